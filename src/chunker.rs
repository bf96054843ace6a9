//! Splitting of a single input source into sorted chunks.

use std::io;
use std::path::Path;

use log;
use tokio_util::sync::CancellationToken;

use crate::buffer::ChunkBufferBuilder;
use crate::chunk::{ChunkWriter, ExternalChunk};
use crate::source::{DecodePolicy, InputSource};
use crate::sort::SortError;
use crate::Value;

/// Chunks produced from one source.
#[derive(Clone, Debug)]
pub struct SourceChunks {
    /// Chunks in the order they were written.
    pub chunks: Vec<ExternalChunk>,
    /// Number of records read.
    pub records: u64,
    /// Number of records skipped because they did not decode.
    pub skipped: u64,
}

/// Reads sources record by record and spills them to sorted chunks through a [`ChunkWriter`].
pub struct Chunker<'a, B>
where
    B: ChunkBufferBuilder<Value>,
{
    tmp_dir: &'a Path,
    buffer_builder: &'a B,
    decode_policy: DecodePolicy,
    rw_buf_size: Option<usize>,
    cancel: &'a CancellationToken,
}

impl<'a, B> Chunker<'a, B>
where
    B: ChunkBufferBuilder<Value>,
{
    /// Creates a chunker.
    ///
    /// # Arguments
    /// * `tmp_dir` - Directory the chunk files are created in
    /// * `buffer_builder` - Builder of the in-memory chunk buffers
    /// * `decode_policy` - What to do with records that do not decode
    /// * `rw_buf_size` - Source and chunk file read/write buffer size
    /// * `cancel` - Cancellation flag checked between buffer fills
    pub fn new(
        tmp_dir: &'a Path,
        buffer_builder: &'a B,
        decode_policy: DecodePolicy,
        rw_buf_size: Option<usize>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Chunker {
            tmp_dir,
            buffer_builder,
            decode_policy,
            rw_buf_size,
            cancel,
        }
    }

    /// Splits a source into sorted chunks.
    pub fn chunk(&self, source: &InputSource) -> Result<SourceChunks, SortError> {
        if self.cancel.is_cancelled() {
            return Err(SortError::Cancelled);
        }

        let records = source.open(self.rw_buf_size).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => SortError::SourceNotFound(source.path().to_path_buf()),
            _ => SortError::IO(err),
        })?;
        log::debug!("chunking {}", source.path().display());

        let mut writer = ChunkWriter::new(self.tmp_dir, source, self.buffer_builder, self.rw_buf_size);
        let mut read = 0;
        let mut skipped = 0;

        for record in records {
            let record = record.map_err(SortError::IO)?;
            read += 1;

            let value = match (record.decode(), self.decode_policy) {
                (Ok(value), _) => value,
                (Err(err), DecodePolicy::Skip) => {
                    log::debug!("{}:{}: skipping record: {}", source.path().display(), record.line, err);
                    skipped += 1;
                    continue;
                }
                (Err(err), DecodePolicy::Fail) => {
                    return Err(SortError::DecodeError {
                        path: source.path().to_path_buf(),
                        line: record.line,
                        err,
                    })
                }
            };

            if writer.ingest(value)?.is_some() && self.cancel.is_cancelled() {
                return Err(SortError::Cancelled);
            }
        }

        let chunks = writer.finish()?;

        if skipped > 0 {
            log::warn!("{}: skipped {} malformed records", source.path().display(), skipped);
        }
        log::debug!(
            "{}: {} records, {} chunks",
            source.path().display(),
            read,
            chunks.len()
        );

        return Ok(SourceChunks {
            chunks,
            records: read,
            skipped,
        });
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::PathBuf;

    use rstest::*;
    use tokio_util::sync::CancellationToken;

    use super::Chunker;
    use crate::buffer::LimitedBufferBuilder;
    use crate::chunk::ExternalChunk;
    use crate::source::{DecodePolicy, InputSource};
    use crate::sort::SortError;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn write_source(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn read_chunks(chunks: &[ExternalChunk]) -> Vec<Vec<i64>> {
        chunks
            .iter()
            .map(|chunk| chunk.open(None).unwrap().collect::<Result<_, _>>().unwrap())
            .collect()
    }

    #[rstest]
    #[case("", vec![])]
    #[case("5\n1\n3\n", vec![vec![1, 5], vec![3]])]
    #[case("4\n2\n", vec![vec![2, 4]])]
    #[case("4\n2", vec![vec![2, 4]])]
    #[case("3\n2\n1\n", vec![vec![2, 3], vec![1]])]
    #[case("1\n1\n1\n1\n", vec![vec![1, 1], vec![1, 1]])]
    fn test_chunker(tmp_dir: tempfile::TempDir, #[case] contents: &str, #[case] expected: Vec<Vec<i64>>) {
        let input = write_source(&tmp_dir, "input.txt", contents);
        let builder = LimitedBufferBuilder::new(2, true);
        let cancel = CancellationToken::new();
        let chunker = Chunker::new(tmp_dir.path(), &builder, DecodePolicy::Skip, None, &cancel);

        let result = chunker.chunk(&InputSource::new(0, input)).unwrap();

        assert_eq!(read_chunks(&result.chunks), expected);
        assert_eq!(result.skipped, 0);
        assert_eq!(result.records, expected.iter().map(|c| c.len() as u64).sum::<u64>());
    }

    #[rstest]
    fn test_chunker_skips_malformed_records(tmp_dir: tempfile::TempDir) {
        let input = write_source(&tmp_dir, "input.txt", "3\nthree\n\n1\n99999999999999999999\n2\n");
        let builder = LimitedBufferBuilder::new(2, false);
        let cancel = CancellationToken::new();
        let chunker = Chunker::new(tmp_dir.path(), &builder, DecodePolicy::Skip, None, &cancel);

        let result = chunker.chunk(&InputSource::new(0, input)).unwrap();

        assert_eq!(read_chunks(&result.chunks), vec![vec![1, 3], vec![2]]);
        assert_eq!(result.records, 6);
        assert_eq!(result.skipped, 3);
    }

    #[rstest]
    fn test_chunker_fails_on_malformed_record(tmp_dir: tempfile::TempDir) {
        let input = write_source(&tmp_dir, "input.txt", "3\n1\nthree\n2\n");
        let builder = LimitedBufferBuilder::new(10, false);
        let cancel = CancellationToken::new();
        let chunker = Chunker::new(tmp_dir.path(), &builder, DecodePolicy::Fail, None, &cancel);

        match chunker.chunk(&InputSource::new(0, input.clone())) {
            Err(SortError::DecodeError { path, line, .. }) => {
                assert_eq!(path, input);
                assert_eq!(line, 3);
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.records)),
        }
    }

    #[rstest]
    fn test_chunker_source_not_found(tmp_dir: tempfile::TempDir) {
        let missing = tmp_dir.path().join("missing.txt");
        let builder = LimitedBufferBuilder::new(2, false);
        let cancel = CancellationToken::new();
        let chunker = Chunker::new(tmp_dir.path(), &builder, DecodePolicy::Skip, None, &cancel);

        match chunker.chunk(&InputSource::new(0, missing.clone())) {
            Err(SortError::SourceNotFound(path)) => assert_eq!(path, missing),
            other => panic!("unexpected result: {:?}", other.map(|r| r.records)),
        }
    }

    #[rstest]
    fn test_chunker_cancelled(tmp_dir: tempfile::TempDir) {
        let input = write_source(&tmp_dir, "input.txt", "3\n1\n2\n");
        let builder = LimitedBufferBuilder::new(1, false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chunker = Chunker::new(tmp_dir.path(), &builder, DecodePolicy::Skip, None, &cancel);

        let result = chunker.chunk(&InputSource::new(0, input));
        assert!(matches!(result, Err(SortError::Cancelled)));
    }
}
