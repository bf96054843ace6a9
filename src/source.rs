//! Input sources and record decoding.

use std::error::Error;
use std::fmt::{self, Display};
use std::fs;
use std::io::{self, prelude::*};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::{self, Utf8Error};

use crate::Value;

/// Longest accepted record in bytes, line terminator excluded. Longer lines are decode failures.
pub const MAX_RECORD_LEN: usize = 4096;

/// What to do with a record that does not decode to a [`Value`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Count and log the record, then continue with the next one.
    Skip,
    /// Abort the whole run.
    Fail,
}

impl Default for DecodePolicy {
    fn default() -> Self {
        DecodePolicy::Skip
    }
}

/// Record decoding error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Record is not valid UTF-8.
    Utf8(Utf8Error),
    /// Record is not a decimal 64-bit signed integer.
    Integer(ParseIntError),
    /// Record is longer than the given number of bytes.
    TooLong(usize),
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            DecodeError::Utf8(err) => Some(err),
            DecodeError::Integer(err) => Some(err),
            DecodeError::TooLong(_) => None,
        }
    }
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            DecodeError::Utf8(err) => write!(f, "record is not valid UTF-8: {}", err),
            DecodeError::Integer(err) => write!(f, "record is not a 64-bit integer: {}", err),
            DecodeError::TooLong(limit) => write!(f, "record is longer than {} bytes", limit),
        }
    }
}

/// Decodes a single line-delimited record. Surrounding whitespace, including a trailing `\r`, is ignored.
pub fn decode(record: &[u8]) -> Result<Value, DecodeError> {
    let text = str::from_utf8(record).map_err(DecodeError::Utf8)?;
    text.trim().parse::<Value>().map_err(DecodeError::Integer)
}

/// One input file of a sorting run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputSource {
    index: usize,
    path: PathBuf,
}

impl InputSource {
    /// Creates a source.
    ///
    /// # Arguments
    /// * `index` - Position of the source within the run, used to keep chunk file names unique
    /// * `path` - File the records are read from
    pub fn new(index: usize, path: impl Into<PathBuf>) -> Self {
        InputSource {
            index,
            path: path.into(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a file-name-safe label derived from the source file stem.
    pub fn label(&self) -> String {
        let stem = self
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        let label: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .take(32)
            .collect();

        if label.is_empty() {
            String::from("input")
        } else {
            label
        }
    }

    /// Opens the source for reading. A missing file is reported with [`io::ErrorKind::NotFound`].
    pub fn open(&self, buf_size: Option<usize>) -> io::Result<Records<io::BufReader<fs::File>>> {
        let file = fs::File::open(&self.path)?;
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(Records::new(reader));
    }
}

/// A single undecoded record along with its 1-based line number.
///
/// An oversized record keeps only its first bytes and is marked as `truncated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub line: u64,
    pub bytes: Vec<u8>,
    pub truncated: Option<usize>,
}

impl Record {
    pub fn decode(&self) -> Result<Value, DecodeError> {
        match self.truncated {
            Some(limit) => Err(DecodeError::TooLong(limit)),
            None => decode(&self.bytes),
        }
    }
}

/// Newline-delimited record reader.
///
/// At most `max_record_len + 1` bytes of a line are buffered; the rest of an oversized line is skipped.
pub struct Records<R> {
    reader: R,
    line: u64,
    max_record_len: usize,
}

impl<R: BufRead> Records<R> {
    pub fn new(reader: R) -> Self {
        Records::with_max_record_len(reader, MAX_RECORD_LEN)
    }

    pub fn with_max_record_len(reader: R, max_record_len: usize) -> Self {
        Records {
            reader,
            line: 0,
            max_record_len,
        }
    }

    fn skip_line(&mut self) -> io::Result<()> {
        loop {
            let (found, used) = {
                let buf = match self.reader.fill_buf() {
                    Ok(buf) => buf,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                };
                if buf.is_empty() {
                    return Ok(());
                }
                match buf.iter().position(|&b| b == b'\n') {
                    Some(pos) => (true, pos + 1),
                    None => (false, buf.len()),
                }
            };
            self.reader.consume(used);
            if found {
                return Ok(());
            }
        }
    }
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut bytes = Vec::new();
        let limit = self.max_record_len as u64 + 1;
        match io::Read::take(&mut self.reader, limit).read_until(b'\n', &mut bytes) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(err) => return Some(Err(err)),
        }
        self.line += 1;

        let terminated = bytes.last() == Some(&b'\n');
        if terminated {
            bytes.pop();
        }

        let mut truncated = None;
        if bytes.len() > self.max_record_len {
            bytes.truncate(self.max_record_len);
            truncated = Some(self.max_record_len);
            if !terminated {
                if let Err(err) = self.skip_line() {
                    return Some(Err(err));
                }
            }
        }

        Some(Ok(Record {
            line: self.line,
            bytes,
            truncated,
        }))
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::path::Path;

    use rstest::*;

    use super::{decode, DecodeError, InputSource, Record, Records};

    #[rstest]
    #[case(b"42", Some(42))]
    #[case(b"-17", Some(-17))]
    #[case(b"+8", Some(8))]
    #[case(b"  5 \r", Some(5))]
    #[case(b"-9223372036854775808", Some(i64::MIN))]
    #[case(b"9223372036854775807", Some(i64::MAX))]
    #[case(b"9223372036854775808", None)]
    #[case(b"", None)]
    #[case(b"1.5", None)]
    #[case(b"abc", None)]
    #[case(b"1 2", None)]
    #[case(b"\xff\xfe", None)]
    fn test_decode(#[case] record: &[u8], #[case] expected: Option<i64>) {
        assert_eq!(decode(record).ok(), expected);
    }

    #[test]
    fn test_records() {
        let input = io::Cursor::new(b"3\n\nx\r\n-1".to_vec());
        let records: Vec<Record> = Records::new(input).collect::<Result<_, _>>().unwrap();

        let lines: Vec<u64> = records.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![1, 2, 3, 4]);

        let decoded: Vec<Option<i64>> = records.iter().map(|r| r.decode().ok()).collect();
        assert_eq!(decoded, vec![Some(3), None, None, Some(-1)]);
    }

    #[rstest]
    #[case(b"1234\n12345\n7".to_vec(), vec![Some(1234), None, Some(7)])]
    #[case(b"123456789\n-5\n".to_vec(), vec![None, Some(-5)])]
    #[case(b"99999999999999".to_vec(), vec![None])]
    #[case(b"12345".to_vec(), vec![None])]
    fn test_records_max_len(#[case] input: Vec<u8>, #[case] expected: Vec<Option<i64>>) {
        let records: Vec<Record> = Records::with_max_record_len(io::Cursor::new(input), 4)
            .collect::<Result<_, _>>()
            .unwrap();

        let decoded: Vec<Option<i64>> = records.iter().map(|r| r.decode().ok()).collect();
        assert_eq!(decoded, expected);

        for (idx, record) in records.iter().enumerate() {
            assert_eq!(record.line, idx as u64 + 1);
            assert!(record.bytes.len() <= 4);
            if expected[idx].is_none() {
                assert_eq!(record.decode(), Err(DecodeError::TooLong(4)));
            }
        }
    }

    #[test]
    fn test_records_long_line_small_buffer() {
        let mut input = vec![b'7'; 10_000];
        input.extend_from_slice(b"\n42\n");
        let reader = io::BufReader::with_capacity(16, io::Cursor::new(input));
        let records: Vec<Record> = Records::new(reader).collect::<Result<_, _>>().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].truncated, Some(super::MAX_RECORD_LEN));
        assert_eq!(records[1].decode(), Ok(42));
        assert_eq!(records[1].line, 2);
    }

    #[test]
    fn test_records_empty_input() {
        let input = io::Cursor::new(Vec::new());
        assert_eq!(Records::new(input).count(), 0);
    }

    #[rstest]
    #[case("data/file1.txt", "file1")]
    #[case("numbers.part_2.txt", "numbers-part-2")]
    #[case("/", "input")]
    fn test_label(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(InputSource::new(0, Path::new(path)).label(), expected);
    }

    #[test]
    fn test_open_missing() {
        let source = InputSource::new(0, "./definitely-missing-input.txt");
        let err = source.open(None).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
