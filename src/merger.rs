//! Binary heap merger.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::error::Error;
use std::io::{self, prelude::*};
use std::path::Path;

use log;
use tokio_util::sync::CancellationToken;

use crate::chunk::{self, ExternalChunk};
use crate::sort::SortError;

/// Forward-only cursor over one sorted input.
///
/// The cursor always holds the next unconsumed item (the head) and drops the underlying input
/// as soon as it is exhausted.
pub struct MergeReader<T, I> {
    inner: Option<I>,
    head: Option<T>,
}

impl<T, E, I> MergeReader<T, I>
where
    I: Iterator<Item = Result<T, E>>,
{
    /// Wraps an input and loads its first item.
    pub fn new(inner: I) -> Result<Self, E> {
        let mut reader = MergeReader {
            inner: Some(inner),
            head: None,
        };
        reader.load()?;

        return Ok(reader);
    }

    fn load(&mut self) -> Result<(), E> {
        let next = match self.inner.as_mut() {
            Some(inner) => inner.next(),
            None => None,
        };

        match next {
            Some(Ok(item)) => self.head = Some(item),
            Some(Err(err)) => {
                self.close();
                return Err(err);
            }
            None => self.close(),
        }

        return Ok(());
    }

    /// Returns the head without consuming it, or [`None`] if the input is exhausted.
    pub fn peek(&self) -> Option<&T> {
        self.head.as_ref()
    }

    /// Consumes the head and loads the next item. Returns [`None`] if the input is exhausted.
    pub fn advance(&mut self) -> Result<Option<T>, E> {
        let head = match self.head.take() {
            Some(head) => head,
            None => return Ok(None),
        };
        self.load()?;

        return Ok(Some(head));
    }

    pub fn is_exhausted(&self) -> bool {
        self.head.is_none()
    }

    /// Releases the underlying input. The reader is exhausted afterwards.
    pub fn close(&mut self) {
        self.inner = None;
        self.head = None;
    }
}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
///
/// Equal items are emitted in input order: the input passed first wins.
pub struct BinaryHeapMerger<T, E, C>
where
    T: Ord + Clone,
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    // binary heap is max-heap by default so we reverse it to convert it to min-heap
    items: BinaryHeap<Reverse<(T, usize)>>,
    chunks: Vec<C::IntoIter>,
    readers: Vec<MergeReader<T, C::IntoIter>>,
    initiated: bool,
    failed: bool,
}

impl<T, E, C> BinaryHeapMerger<T, E, C>
where
    T: Ord + Clone,
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted in ascending order otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let chunks = Vec::from_iter(chunks.into_iter().map(|c| c.into_iter()));
        let items = BinaryHeap::with_capacity(chunks.len());
        let readers = Vec::with_capacity(chunks.len());

        return BinaryHeapMerger {
            chunks,
            items,
            readers,
            initiated: false,
            failed: false,
        };
    }

    fn init(&mut self) -> Result<(), E> {
        for (idx, chunk) in self.chunks.drain(..).enumerate() {
            let reader = MergeReader::new(chunk)?;
            if let Some(head) = reader.peek() {
                self.items.push(Reverse((head.clone(), idx)));
            }
            self.readers.push(reader);
        }

        return Ok(());
    }
}

impl<T, E, C> Iterator for BinaryHeapMerger<T, E, C>
where
    T: Ord + Clone,
    E: Error,
    C: IntoIterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if !self.initiated {
            self.initiated = true;
            if let Err(err) = self.init() {
                self.failed = true;
                return Some(Err(err));
            }
        }

        let Reverse((_, idx)) = self.items.pop()?;
        let reader = &mut self.readers[idx];

        match reader.advance() {
            Ok(Some(item)) => {
                if let Some(head) = reader.peek() {
                    self.items.push(Reverse((head.clone(), idx)));
                }
                Some(Ok(item))
            }
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Result of a [`MergeEngine::merge`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Number of values written to the output.
    pub values: u64,
    /// Number of intermediate merge waves performed before the final merge.
    pub waves: usize,
}

/// Merges sorted chunk files into a single sorted output.
///
/// At most `max_open_chunks` chunk files are open at any time. Larger chunk sets are merged
/// in waves: groups of chunks are merged into intermediate chunks in `scratch_dir` until a single
/// final merge is possible.
pub struct MergeEngine<'a> {
    scratch_dir: &'a Path,
    rw_buf_size: Option<usize>,
    max_open_chunks: usize,
    cancel: &'a CancellationToken,
}

impl<'a> MergeEngine<'a> {
    /// Creates a merge engine.
    ///
    /// # Arguments
    /// * `scratch_dir` - Directory for intermediate chunks
    /// * `rw_buf_size` - Chunk file read/write buffer size
    /// * `max_open_chunks` - Merge fan-in limit, at least 2
    /// * `cancel` - Cancellation flag checked before every emitted value
    pub fn new(
        scratch_dir: &'a Path,
        rw_buf_size: Option<usize>,
        max_open_chunks: usize,
        cancel: &'a CancellationToken,
    ) -> Self {
        MergeEngine {
            scratch_dir,
            rw_buf_size,
            max_open_chunks: max_open_chunks.max(2),
            cancel,
        }
    }

    /// Merges `chunks` into `output`. Chunks are given in open order, which decides the order of equal values.
    pub fn merge<W: Write>(&self, chunks: Vec<ExternalChunk>, output: &mut W) -> Result<MergeStats, SortError> {
        let mut chunks = chunks;
        let mut waves = 0;

        while chunks.len() > self.max_open_chunks {
            waves += 1;
            log::debug!("merge wave {}: {} chunks", waves, chunks.len());
            chunks = self.merge_wave(waves, chunks)?;
        }

        log::debug!("final merge: {} chunks", chunks.len());
        let values = self.merge_pass(&chunks, output)?;

        return Ok(MergeStats { values, waves });
    }

    fn merge_wave(&self, wave: usize, chunks: Vec<ExternalChunk>) -> Result<Vec<ExternalChunk>, SortError> {
        let mut merged = Vec::new();
        let mut chunks = chunks.into_iter();

        loop {
            let group: Vec<ExternalChunk> = chunks.by_ref().take(self.max_open_chunks).collect();
            match group.len() {
                0 => break,
                1 => merged.extend(group),
                _ => {
                    let path = self.scratch_dir.join(ExternalChunk::merged_file_name(wave, merged.len()));
                    let mut writer = chunk::create_writer(&path, self.rw_buf_size).map_err(SortError::IO)?;
                    let len = self.merge_pass(&group, &mut writer)?;
                    writer.flush().map_err(SortError::IO)?;

                    for consumed in group {
                        consumed.remove().map_err(SortError::IO)?;
                    }
                    merged.push(ExternalChunk::from_parts(path, len as usize));
                }
            }
        }

        return Ok(merged);
    }

    fn merge_pass<W: Write>(&self, chunks: &[ExternalChunk], output: &mut W) -> Result<u64, SortError> {
        let mut readers = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match chunk.open(self.rw_buf_size) {
                Ok(reader) => readers.push(reader),
                Err(err) => return Err(open_error(readers.len(), err)),
            }
        }

        let mut values = 0;
        for item in BinaryHeapMerger::new(readers) {
            if self.cancel.is_cancelled() {
                return Err(SortError::Cancelled);
            }
            writeln!(output, "{}", item?).map_err(SortError::IO)?;
            values += 1;
        }

        return Ok(values);
    }
}

fn open_error(opened: usize, err: io::Error) -> SortError {
    if is_handle_exhaustion(&err) {
        SortError::TooManyOpenChunks { opened, err }
    } else {
        SortError::IO(err)
    }
}

// ENFILE, EMFILE
#[cfg(unix)]
fn is_handle_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

// ERROR_TOO_MANY_OPEN_FILES
#[cfg(windows)]
fn is_handle_exhaustion(err: &io::Error) -> bool {
    err.raw_os_error() == Some(4)
}

#[cfg(not(any(unix, windows)))]
fn is_handle_exhaustion(_err: &io::Error) -> bool {
    false
}
