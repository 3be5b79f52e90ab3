//! `Transfer-Encoding: chunked` framing.
//!
//! [`ChunkedDecoder`] is a push decoder: feed it whatever bytes the socket
//! produced and it hands back payload bytes, remembering where it stopped
//! between calls. Chunk extensions are ignored and trailers are discarded.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// The terminating zero-length chunk with an empty trailer.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

const MAX_SIZE_LINE: usize = 64;
const MAX_TRAILER: usize = 8 * 1024;

/// Errors in chunked framing. All of them end the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid chunk size line")]
    InvalidSize,

    #[error("chunk size line exceeds {MAX_SIZE_LINE} bytes")]
    SizeLineTooLong,

    #[error("chunk data not followed by CRLF")]
    MissingCrlf,

    #[error("chunk trailer exceeds {MAX_TRAILER} bytes")]
    TrailerTooLarge,
}

/// Body progress of a request, as the connection reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// The body is not chunked.
    NotChunked,
    /// Chunked, but no payload byte has been decoded yet.
    NoDataYet,
    /// Some payload has been decoded; more may follow.
    Partial,
    /// The last chunk and trailer have been consumed.
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Size,
    Data(u64),
    DataCr,
    DataLf,
    Trailer,
    Done,
}

/// Incremental decoder for a chunked request body.
///
/// ```
/// use wharf::http::chunked::ChunkedDecoder;
///
/// let mut decoder = ChunkedDecoder::new();
/// let mut out = [0u8; 16];
/// let (used, produced) = decoder.decode(b"5\r\nhello\r\n0\r\n\r\n", &mut out).unwrap();
/// assert_eq!(&out[..produced], b"hello");
/// assert_eq!(used, 15);
/// assert!(decoder.is_done());
/// ```
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    phase: Phase,
    line: Vec<u8>,
    trailer_len: usize,
    produced_any: bool,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::Size,
            line: Vec::with_capacity(MAX_SIZE_LINE),
            trailer_len: 0,
            produced_any: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn state(&self) -> ChunkState {
        match (&self.phase, self.produced_any) {
            (Phase::Done, _) => ChunkState::Done,
            (_, true) => ChunkState::Partial,
            (_, false) => ChunkState::NoDataYet,
        }
    }

    /// Decodes from `input` into `out`.
    ///
    /// Returns `(consumed, produced)`: how many bytes of `input` were used
    /// and how many payload bytes were written to `out`. Stops early when
    /// `out` is full or the body is complete; unconsumed input belongs to
    /// the caller (it may be the next pipelined request).
    pub fn decode(&mut self, input: &[u8], out: &mut [u8]) -> Result<(usize, usize), ChunkError> {
        let mut pos = 0;
        let mut produced = 0;

        while pos < input.len() {
            match self.phase {
                Phase::Done => break,
                Phase::Size => {
                    let byte = input[pos];
                    pos += 1;
                    if byte != b'\n' {
                        if self.line.len() >= MAX_SIZE_LINE {
                            return Err(ChunkError::SizeLineTooLong);
                        }
                        self.line.push(byte);
                        continue;
                    }
                    let size = parse_size_line(&self.line)?;
                    self.line.clear();
                    self.phase = if size == 0 { Phase::Trailer } else { Phase::Data(size) };
                }
                Phase::Data(remaining) => {
                    if produced == out.len() {
                        break;
                    }
                    let n = (input.len() - pos)
                        .min(out.len() - produced)
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    out[produced..produced + n].copy_from_slice(&input[pos..pos + n]);
                    pos += n;
                    produced += n;
                    self.produced_any = true;
                    let left = remaining - n as u64;
                    self.phase = if left == 0 { Phase::DataCr } else { Phase::Data(left) };
                }
                Phase::DataCr => {
                    if input[pos] != b'\r' {
                        return Err(ChunkError::MissingCrlf);
                    }
                    pos += 1;
                    self.phase = Phase::DataLf;
                }
                Phase::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(ChunkError::MissingCrlf);
                    }
                    pos += 1;
                    self.phase = Phase::Size;
                }
                Phase::Trailer => {
                    let byte = input[pos];
                    pos += 1;
                    self.trailer_len += 1;
                    if self.trailer_len > MAX_TRAILER {
                        return Err(ChunkError::TrailerTooLarge);
                    }
                    if byte != b'\n' {
                        if byte != b'\r' {
                            self.line.push(byte);
                        }
                        continue;
                    }
                    if self.line.is_empty() {
                        self.phase = Phase::Done;
                    }
                    self.line.clear();
                }
            }
        }

        Ok((pos, produced))
    }
}

fn parse_size_line(line: &[u8]) -> Result<u64, ChunkError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let digits = line.split(|&b| b == b';').next().unwrap_or_default();
    let digits = std::str::from_utf8(digits)
        .map_err(|_| ChunkError::InvalidSize)?
        .trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ChunkError::InvalidSize);
    }
    u64::from_str_radix(digits, 16).map_err(|_| ChunkError::InvalidSize)
}

/// Wraps `data` as one chunk. Empty input yields an empty buffer, never the
/// terminating chunk; use [`LAST_CHUNK`] to end the body.
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() + 20);
    if data.is_empty() {
        return buf;
    }
    buf.put(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf
}
