//! Sorted chunk files.

use std::error::Error;
use std::fmt::{self, Display};
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use log;
use rayon::slice::ParallelSliceMut;

use crate::buffer::{ChunkBuffer, ChunkBufferBuilder};
use crate::source::{DecodeError, InputSource, Records};
use crate::Value;

/// External chunk error.
#[derive(Debug)]
pub enum ExternalChunkError {
    /// Common I/O error.
    IO(io::Error),
    /// Chunk file holds a record that is not a value.
    Corrupted { path: PathBuf, line: u64, err: DecodeError },
}

impl From<io::Error> for ExternalChunkError {
    fn from(err: io::Error) -> Self {
        ExternalChunkError::IO(err)
    }
}

impl Error for ExternalChunkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            ExternalChunkError::IO(err) => err,
            ExternalChunkError::Corrupted { err, .. } => err,
        })
    }
}

impl Display for ExternalChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ExternalChunkError::IO(err) => write!(f, "{}", err),
            ExternalChunkError::Corrupted { path, line, err } => {
                write!(f, "chunk {} corrupted at line {}: {}", path.display(), line, err)
            }
        }
    }
}

/// Handle of a sorted chunk stored on the file system.
///
/// Values are stored one decimal number per line in non-decreasing order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalChunk {
    path: PathBuf,
    len: usize,
}

impl ExternalChunk {
    /// Writes already sorted items to a new file at `path` and returns its handle.
    /// Fails if the file already exists.
    pub fn dump(
        path: PathBuf,
        items: impl IntoIterator<Item = Value>,
        buf_size: Option<usize>,
    ) -> Result<Self, ExternalChunkError> {
        let mut chunk_writer = create_writer(&path, buf_size)?;

        let mut len = 0;
        for item in items.into_iter() {
            writeln!(chunk_writer, "{}", item)?;
            len += 1;
        }
        chunk_writer.flush()?;

        return Ok(ExternalChunk { path, len });
    }

    pub(crate) fn from_parts(path: PathBuf, len: usize) -> Self {
        ExternalChunk { path, len }
    }

    /// File name of the `seq`-th chunk of a source.
    pub fn file_name(source: &InputSource, seq: usize) -> String {
        format!("src{:04}-{}-{:06}.chunk", source.index(), source.label(), seq)
    }

    /// File name of the `seq`-th intermediate chunk produced by a merge wave.
    pub fn merged_file_name(wave: usize, seq: usize) -> String {
        format!("wave{:04}-{:06}.chunk", wave, seq)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of values stored in the chunk.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Opens the chunk for reading.
    pub fn open(&self, buf_size: Option<usize>) -> io::Result<ChunkReader> {
        let file = fs::File::open(&self.path)?;
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(ChunkReader {
            path: self.path.clone(),
            records: Records::new(reader),
        });
    }

    /// Deletes the chunk file.
    pub fn remove(self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

pub(crate) fn create_writer(path: &Path, buf_size: Option<usize>) -> io::Result<io::BufWriter<fs::File>> {
    let file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;

    return Ok(match buf_size {
        Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
        None => io::BufWriter::new(file),
    });
}

/// Forward-only reader over the values of a chunk file.
pub struct ChunkReader {
    path: PathBuf,
    records: Records<io::BufReader<fs::File>>,
}

impl Iterator for ChunkReader {
    type Item = Result<Value, ExternalChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.records.next()? {
            Ok(record) => match record.decode() {
                Ok(value) => Some(Ok(value)),
                Err(err) => Some(Err(ExternalChunkError::Corrupted {
                    path: self.path.clone(),
                    line: record.line,
                    err,
                })),
            },
            Err(err) => Some(Err(ExternalChunkError::IO(err))),
        }
    }
}

/// Accumulates values of one source in a bounded buffer and spills every full buffer to a sorted chunk file.
pub struct ChunkWriter<'a, B>
where
    B: ChunkBufferBuilder<Value>,
{
    dir: &'a Path,
    source: &'a InputSource,
    buffer_builder: &'a B,
    buffer: B::Buffer,
    rw_buf_size: Option<usize>,
    chunks: Vec<ExternalChunk>,
}

impl<'a, B> ChunkWriter<'a, B>
where
    B: ChunkBufferBuilder<Value>,
{
    /// Creates a writer.
    ///
    /// # Arguments
    /// * `dir` - Directory the chunk files are created in
    /// * `source` - Source the values come from, encoded into the chunk file names
    /// * `buffer_builder` - Builder of the in-memory buffers
    /// * `rw_buf_size` - Chunk file write buffer size
    pub fn new(dir: &'a Path, source: &'a InputSource, buffer_builder: &'a B, rw_buf_size: Option<usize>) -> Self {
        ChunkWriter {
            dir,
            source,
            buffer_builder,
            buffer: buffer_builder.build(),
            rw_buf_size,
            chunks: Vec::new(),
        }
    }

    /// Appends a value. Returns the chunk written if the value filled the buffer.
    pub fn ingest(&mut self, value: Value) -> Result<Option<&ExternalChunk>, ExternalChunkError> {
        self.buffer.push(value);

        if self.buffer.is_full() {
            self.flush()
        } else {
            Ok(None)
        }
    }

    /// Sorts the buffered values and saves them as a new chunk. An empty buffer produces no chunk.
    pub fn flush(&mut self) -> Result<Option<&ExternalChunk>, ExternalChunkError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut buffer = std::mem::replace(&mut self.buffer, self.buffer_builder.build());

        log::debug!("sorting chunk data ({} values) ...", buffer.len());
        buffer.par_sort_unstable();

        let path = self.dir.join(ExternalChunk::file_name(self.source, self.chunks.len()));
        log::debug!("saving chunk data to {}", path.display());
        let chunk = ExternalChunk::dump(path, buffer, self.rw_buf_size)?;
        self.chunks.push(chunk);

        return Ok(self.chunks.last());
    }

    /// Number of chunks written so far.
    pub fn chunks_written(&self) -> usize {
        self.chunks.len()
    }

    /// Flushes the remaining values and returns all chunks in the order they were written.
    pub fn finish(mut self) -> Result<Vec<ExternalChunk>, ExternalChunkError> {
        self.flush()?;
        return Ok(self.chunks);
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{ChunkWriter, ExternalChunk, ExternalChunkError};
    use crate::buffer::LimitedBufferBuilder;
    use crate::source::InputSource;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn read_chunk(chunk: &ExternalChunk) -> Vec<i64> {
        chunk.open(None).unwrap().collect::<Result<_, _>>().unwrap()
    }

    #[rstest]
    fn test_chunk_dump_and_read(tmp_dir: tempfile::TempDir) {
        let saved = vec![i64::MIN, -3, 0, 0, 7, i64::MAX];

        let chunk = ExternalChunk::dump(tmp_dir.path().join("test.chunk"), saved.clone(), Some(16)).unwrap();
        assert_eq!(chunk.len(), saved.len());

        let contents = fs::read_to_string(chunk.path()).unwrap();
        assert_eq!(contents, "-9223372036854775808\n-3\n0\n0\n7\n9223372036854775807\n");

        assert_eq!(read_chunk(&chunk), saved);
    }

    #[rstest]
    fn test_chunk_dump_refuses_existing_file(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("test.chunk");
        ExternalChunk::dump(path.clone(), vec![1], None).unwrap();

        let result = ExternalChunk::dump(path, vec![2], None);
        assert!(matches!(result, Err(ExternalChunkError::IO(_))));
    }

    #[rstest]
    fn test_corrupted_chunk(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("broken.chunk");
        fs::write(&path, "1\noops\n").unwrap();

        let mut reader = ExternalChunk::from_parts(path, 2).open(None).unwrap();
        assert_eq!(reader.next().unwrap().unwrap(), 1);
        match reader.next() {
            Some(Err(ExternalChunkError::Corrupted { line, .. })) => assert_eq!(line, 2),
            other => panic!("unexpected item: {:?}", other.map(|r| r.ok())),
        }
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![2, 1, 3], vec![vec![1, 2, 3]])]
    #[case(vec![5, 1, 3, 2], vec![vec![1, 3, 5], vec![2]])]
    #[case(vec![6, 5, 4, 3, 2, 1], vec![vec![4, 5, 6], vec![1, 2, 3]])]
    fn test_chunk_writer(tmp_dir: tempfile::TempDir, #[case] input: Vec<i64>, #[case] expected: Vec<Vec<i64>>) {
        let source = InputSource::new(1, "numbers.txt");
        let builder = LimitedBufferBuilder::new(3, true);

        let mut writer = ChunkWriter::new(tmp_dir.path(), &source, &builder, None);
        for value in input {
            writer.ingest(value).unwrap();
        }
        let chunks = writer.finish().unwrap();

        let actual: Vec<Vec<i64>> = chunks.iter().map(read_chunk).collect();
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_chunk_writer_flushes_at_capacity(tmp_dir: tempfile::TempDir) {
        let source = InputSource::new(0, "numbers.txt");
        let builder = LimitedBufferBuilder::new(2, false);
        let mut writer = ChunkWriter::new(tmp_dir.path(), &source, &builder, None);

        assert!(writer.ingest(9).unwrap().is_none());
        let flushed = writer.ingest(8).unwrap().cloned().unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(writer.chunks_written(), 1);

        // explicit flush of an empty buffer is a no-op
        assert!(writer.flush().unwrap().is_none());
        assert_eq!(writer.chunks_written(), 1);

        writer.ingest(7).unwrap();
        let chunks = writer.finish().unwrap();
        let lens: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![2, 1]);
    }

    #[rstest]
    fn test_chunk_file_names(tmp_dir: tempfile::TempDir) {
        let first = InputSource::new(0, "data/file.txt");
        let second = InputSource::new(1, "other/file.txt");
        let builder = LimitedBufferBuilder::new(1, false);

        let mut names = Vec::new();
        for source in [&first, &second] {
            let mut writer = ChunkWriter::new(tmp_dir.path(), source, &builder, None);
            writer.ingest(1).unwrap();
            writer.ingest(2).unwrap();
            for chunk in writer.finish().unwrap() {
                names.push(chunk.path().file_name().unwrap().to_string_lossy().into_owned());
            }
        }

        assert_eq!(
            names,
            vec![
                "src0000-file-000000.chunk",
                "src0000-file-000001.chunk",
                "src0001-file-000000.chunk",
                "src0001-file-000001.chunk",
            ]
        );
    }
}
