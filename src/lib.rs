//! `ext-sort-i64` sorts newline-delimited 64-bit signed integers that do not fit into memory.
//!
//! Sorting is achieved in two passes. During the first pass every input file is split into chunks of at most
//! *C* values; each chunk is sorted in memory and saved to a temporary file. During the second pass the sorted
//! chunks of all inputs are merged together into a single sorted output. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Multiple inputs:**
//!   input files are chunked concurrently on a thread pool and all their chunks take part in one global merge.
//! * **Bounded resources:**
//!   chunk capacity bounds memory usage, the merge fan-in bounds the number of open files (larger chunk sets are
//!   merged in waves).
//! * **Safe output:**
//!   the result is written to a temporary file and moved into place only when sorting succeeds.
//! * **Malformed records:**
//!   records that are not integers are either skipped or abort the run, see [`DecodePolicy`].
//! * **Cancellation:**
//!   a [`CancellationToken`] stops a running sort between chunk flushes and merged values.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use ext_sort_i64::{DecodePolicy, ExternalSorter, ExternalSorterBuilder, LimitedBufferBuilder};
//!
//! fn main() {
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_buffer(LimitedBufferBuilder::new(500_000, true))
//!         .with_decode_policy(DecodePolicy::Skip)
//!         .build()
//!         .unwrap();
//!
//!     let summary = sorter.sort(&["file1.txt", "file2.txt"], Path::new("result.txt")).unwrap();
//!     println!("{} values sorted", summary.values);
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod chunker;
pub mod merger;
pub mod sort;
pub mod source;

/// The sorted value type.
pub type Value = i64;

pub use buffer::{ChunkBuffer, ChunkBufferBuilder, LimitedBuffer, LimitedBufferBuilder};
pub use tokio_util::sync::CancellationToken;
pub use chunk::{ChunkReader, ChunkWriter, ExternalChunk, ExternalChunkError};
pub use chunker::{Chunker, SourceChunks};
pub use merger::{BinaryHeapMerger, MergeEngine, MergeReader, MergeStats};
pub use sort::{ExternalSorter, ExternalSorterBuilder, OutputMode, SortError, SortSummary};
pub use source::{DecodeError, DecodePolicy, InputSource};
