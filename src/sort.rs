//! External sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::buffer::{ChunkBufferBuilder, LimitedBufferBuilder};
use crate::chunk::ExternalChunkError;
use crate::chunker::{Chunker, SourceChunks};
use crate::merger::MergeEngine;
use crate::source::{DecodeError, DecodePolicy, InputSource};
use crate::Value;

/// Default limit of simultaneously open chunk files during the merge.
pub const DEFAULT_MAX_OPEN_CHUNKS: usize = 128;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Common I/O error.
    IO(io::Error),
    /// Sorter configuration is not usable.
    InvalidConfig(String),
    /// Input source does not exist.
    SourceNotFound(PathBuf),
    /// Input record is not a value.
    DecodeError { path: PathBuf, line: u64, err: DecodeError },
    /// Chunk file is not readable as a sorted chunk.
    ChunkError(ExternalChunkError),
    /// The OS refused to open another chunk file during the merge.
    TooManyOpenChunks { opened: usize, err: io::Error },
    /// Output already exists and overwriting is disabled.
    OutputExists(PathBuf),
    /// Sorting was cancelled.
    Cancelled,
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::IO(err) => Some(err),
            SortError::DecodeError { err, .. } => Some(err),
            SortError::ChunkError(err) => Some(err),
            SortError::TooManyOpenChunks { err, .. } => Some(err),
            SortError::InvalidConfig(_)
            | SortError::SourceNotFound(_)
            | SortError::OutputExists(_)
            | SortError::Cancelled => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::IO(err) => write!(f, "I/O operation failed: {}", err),
            SortError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            SortError::SourceNotFound(path) => write!(f, "input source not found: {}", path.display()),
            SortError::DecodeError { path, line, err } => {
                write!(f, "malformed record at {}:{}: {}", path.display(), line, err)
            }
            SortError::ChunkError(err) => write!(f, "chunk error: {}", err),
            SortError::TooManyOpenChunks { opened, err } => {
                write!(f, "too many open chunk files ({} already open): {}", opened, err)
            }
            SortError::OutputExists(path) => write!(f, "output already exists: {}", path.display()),
            SortError::Cancelled => write!(f, "sorting cancelled"),
        }
    }
}

impl From<ExternalChunkError> for SortError {
    fn from(err: ExternalChunkError) -> Self {
        match err {
            ExternalChunkError::IO(err) => SortError::IO(err),
            err => SortError::ChunkError(err),
        }
    }
}

/// What to do if the output file already exists.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Replace the existing file once sorting succeeds.
    Overwrite,
    /// Fail with [`SortError::OutputExists`].
    FailIfExists,
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Overwrite
    }
}

/// Statistics of a finished sorting run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortSummary {
    /// Number of input sources.
    pub sources: usize,
    /// Number of records read from all sources.
    pub records: u64,
    /// Number of records skipped because they did not decode.
    pub skipped: u64,
    /// Number of chunks written by the chunking phase.
    pub chunks: usize,
    /// Number of values written to the output.
    pub values: u64,
    /// Number of intermediate merge waves.
    pub merge_waves: usize,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<B = LimitedBufferBuilder>
where
    B: ChunkBufferBuilder<Value>,
{
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Malformed record handling.
    decode_policy: DecodePolicy,
    /// Existing output handling.
    output_mode: OutputMode,
    /// Merge fan-in limit.
    max_open_chunks: usize,
    /// Whether sources are chunked concurrently.
    parallel_sources: bool,
}

impl<B> ExternalSorterBuilder<B>
where
    B: ChunkBufferBuilder<Value>,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<B>, SortError>
    where
        B: Sync,
    {
        if self.max_open_chunks < 2 {
            return Err(SortError::InvalidConfig(format!(
                "at least 2 open chunks are required for merging, got {}",
                self.max_open_chunks
            )));
        }
        if self.rw_buf_size == Some(0) {
            return Err(SortError::InvalidConfig(String::from("read/write buffer size must be positive")));
        }
        if self.threads_number == Some(0) {
            return Err(SortError::InvalidConfig(String::from("threads number must be positive")));
        }

        ExternalSorter::new(
            self.threads_number,
            self.tmp_dir.as_deref(),
            self.buffer_builder,
            self.rw_buf_size,
            self.decode_policy,
            self.output_mode,
            self.max_open_chunks,
            self.parallel_sources,
        )
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<B> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<B> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets buffer builder.
    pub fn with_buffer(mut self, buffer_builder: B) -> ExternalSorterBuilder<B> {
        self.buffer_builder = buffer_builder;
        return self;
    }

    /// Sets chunk read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<B> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets malformed record handling.
    pub fn with_decode_policy(mut self, decode_policy: DecodePolicy) -> ExternalSorterBuilder<B> {
        self.decode_policy = decode_policy;
        return self;
    }

    /// Sets existing output handling.
    pub fn with_output_mode(mut self, output_mode: OutputMode) -> ExternalSorterBuilder<B> {
        self.output_mode = output_mode;
        return self;
    }

    /// Sets the maximum number of chunk files open at once during the merge.
    pub fn with_max_open_chunks(mut self, max_open_chunks: usize) -> ExternalSorterBuilder<B> {
        self.max_open_chunks = max_open_chunks;
        return self;
    }

    /// Enables or disables concurrent chunking of input sources.
    pub fn with_parallel_sources(mut self, parallel_sources: bool) -> ExternalSorterBuilder<B> {
        self.parallel_sources = parallel_sources;
        return self;
    }
}

impl ExternalSorterBuilder<LimitedBufferBuilder> {
    /// Sets the maximum number of values per chunk.
    pub fn with_chunk_capacity(self, capacity: usize) -> Self {
        self.with_buffer(LimitedBufferBuilder::new(capacity, false))
    }
}

impl<B> Default for ExternalSorterBuilder<B>
where
    B: ChunkBufferBuilder<Value>,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            buffer_builder: B::default(),
            decode_policy: DecodePolicy::default(),
            output_mode: OutputMode::default(),
            max_open_chunks: DEFAULT_MAX_OPEN_CHUNKS,
            parallel_sources: true,
        }
    }
}

/// External sorter.
pub struct ExternalSorter<B = LimitedBufferBuilder>
where
    B: ChunkBufferBuilder<Value>,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to be used to store temporary data.
    tmp_dir: tempfile::TempDir,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    decode_policy: DecodePolicy,
    output_mode: OutputMode,
    max_open_chunks: usize,
    parallel_sources: bool,
}

impl<B> ExternalSorter<B>
where
    B: ChunkBufferBuilder<Value> + Sync,
{
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    /// * `tmp_path` - Directory to be used to store temporary data. If paramater is [`None`] default OS temporary
    ///   directory will be used.
    /// * `buffer_builder` - An instance of a buffer builder that will be used for chunk buffer creation.
    /// * `rw_buf_size` - Chunks file read/write buffer size.
    /// * `decode_policy` - Malformed record handling.
    /// * `output_mode` - Existing output handling.
    /// * `max_open_chunks` - Maximum number of chunk files open at once during the merge.
    /// * `parallel_sources` - Whether input sources are chunked concurrently.
    pub fn new(
        threads_number: Option<usize>,
        tmp_path: Option<&Path>,
        buffer_builder: B,
        rw_buf_size: Option<usize>,
        decode_policy: DecodePolicy,
        output_mode: OutputMode,
        max_open_chunks: usize,
        parallel_sources: bool,
    ) -> Result<Self, SortError> {
        return Ok(ExternalSorter {
            rw_buf_size,
            buffer_builder,
            decode_policy,
            output_mode,
            max_open_chunks,
            parallel_sources,
            thread_pool: Self::init_thread_pool(threads_number)?,
            tmp_dir: Self::init_tmp_directory(tmp_path)?,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
        let tmp_dir = if let Some(tmp_path) = tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    /// Sorts the values of all `inputs` into the `output` file.
    ///
    /// The output is written to a temporary file next to `output` and moved into place only if sorting succeeds,
    /// so a failed run never leaves a partial output behind.
    ///
    /// # Arguments
    /// * `inputs` - Files with one decimal integer per line
    /// * `output` - File the sorted values are written to
    pub fn sort<P: AsRef<Path>>(&self, inputs: &[P], output: &Path) -> Result<SortSummary, SortError> {
        self.sort_with_cancel(inputs, output, &CancellationToken::new())
    }

    /// Same as [`ExternalSorter::sort`] but stops with [`SortError::Cancelled`] once `cancel` is set.
    pub fn sort_with_cancel<P: AsRef<Path>>(
        &self,
        inputs: &[P],
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<SortSummary, SortError> {
        if self.output_mode == OutputMode::FailIfExists && output.exists() {
            return Err(SortError::OutputExists(output.to_path_buf()));
        }

        let output_dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged_builder = tempfile::Builder::new();
        staged_builder.prefix(".ext-sort-");
        // same mode as File::create, the process umask applies
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            staged_builder.permissions(fs::Permissions::from_mode(0o666));
        }
        let staged = staged_builder
            .tempfile_in(output_dir)
            .map_err(|err| SortError::TempDir(err))?;
        log::debug!("staging output in {}", staged.path().display());

        if let Ok(metadata) = fs::metadata(output) {
            staged
                .as_file()
                .set_permissions(metadata.permissions())
                .map_err(SortError::IO)?;
        }

        let mut writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, staged),
            None => io::BufWriter::new(staged),
        };
        let summary = self.sort_into(inputs, &mut writer, cancel)?;

        let staged = writer.into_inner().map_err(|err| SortError::IO(err.into_error()))?;
        staged.as_file().sync_all().map_err(SortError::IO)?;

        let persisted = match self.output_mode {
            OutputMode::Overwrite => staged.persist(output),
            OutputMode::FailIfExists => staged.persist_noclobber(output),
        };
        persisted.map_err(|err| match err.error.kind() {
            io::ErrorKind::AlreadyExists => SortError::OutputExists(output.to_path_buf()),
            _ => SortError::IO(err.error),
        })?;

        log::info!("sorted data saved to {}", output.display());

        return Ok(summary);
    }

    /// Sorts the values of all `inputs` and writes them to `output`, one value per line.
    ///
    /// All sources are chunked first (concurrently unless disabled), then every chunk of every source is merged
    /// in a single pass. Chunk files are removed when the call returns.
    pub fn sort_into<P, W>(&self, inputs: &[P], output: &mut W, cancel: &CancellationToken) -> Result<SortSummary, SortError>
    where
        P: AsRef<Path>,
        W: Write,
    {
        let started = Instant::now();

        let run_dir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(self.tmp_dir.path())
            .map_err(|err| SortError::TempDir(err))?;

        let sources: Vec<InputSource> = inputs
            .iter()
            .enumerate()
            .map(|(index, path)| InputSource::new(index, path.as_ref()))
            .collect();

        let chunker = Chunker::new(
            run_dir.path(),
            &self.buffer_builder,
            self.decode_policy,
            self.rw_buf_size,
            cancel,
        );

        log::info!("chunking {} sources ...", sources.len());
        let chunked = if self.parallel_sources {
            self.thread_pool.install(|| {
                sources
                    .par_iter()
                    .map(|source| chunker.chunk(source))
                    .collect::<Result<Vec<SourceChunks>, SortError>>()
            })?
        } else {
            self.thread_pool.install(|| {
                sources
                    .iter()
                    .map(|source| chunker.chunk(source))
                    .collect::<Result<Vec<SourceChunks>, SortError>>()
            })?
        };

        let mut summary = SortSummary {
            sources: sources.len(),
            ..SortSummary::default()
        };
        let mut chunks = Vec::new();
        for source_chunks in chunked {
            summary.records += source_chunks.records;
            summary.skipped += source_chunks.skipped;
            chunks.extend(source_chunks.chunks);
        }
        summary.chunks = chunks.len();

        log::info!(
            "external sort preparation done: {} chunks from {} records ({} skipped) in {:?}",
            summary.chunks,
            summary.records,
            summary.skipped,
            started.elapsed()
        );

        let merge_started = Instant::now();
        let engine = MergeEngine::new(run_dir.path(), self.rw_buf_size, self.max_open_chunks, cancel);
        let stats = engine.merge(chunks, output)?;
        output.flush().map_err(SortError::IO)?;

        summary.values = stats.values;
        summary.merge_waves = stats.waves;
        debug_assert_eq!(summary.values, summary.records - summary.skipped);

        log::info!(
            "merge done: {} values in {:?} ({} intermediate waves)",
            summary.values,
            merge_started.elapsed(),
            summary.merge_waves
        );
        log::info!("total sorting time: {:?}", started.elapsed());

        return Ok(summary);
    }
}
