//! Frame codec for the Core wire protocol.
//!
//! A frame is the decimal ASCII length of the payload, a `#` delimiter, and
//! exactly that many bytes of UTF-8 JSON. Senders predating the framing ship
//! a single raw JSON document and close the connection; `FramingMode::Auto`
//! detects which of the two a connection speaks from its first bytes.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Separates the length prefix from the payload.
pub const DELIMITER: u8 = b'#';

/// Default upper bound on a single payload, in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Longest digit run considered a length prefix in `Auto` mode. Anything
/// longer is treated as a legacy document.
pub const MODE_DETECT_LOOKAHEAD: usize = 10;

#[derive(Debug, Error)]
pub enum FrameError {
    /// A byte that is neither a digit nor the delimiter appeared in the
    /// length prefix.
    #[error("invalid length prefix: unexpected byte 0x{byte:02x} before '#'")]
    InvalidLengthPrefix { byte: u8 },
    /// The declared length exceeds the configured maximum. Checked before
    /// any payload allocation.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
    /// The peer closed the connection in the middle of a frame.
    #[error("connection closed mid-frame")]
    Incomplete,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a connection's inbound bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Decide between `Framed` and `Legacy` from the first bytes.
    #[default]
    Auto,
    /// Length-prefixed frames only.
    Framed,
    /// One raw JSON document, terminated by connection close.
    Legacy,
}

impl std::str::FromStr for FramingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(FramingMode::Auto),
            "framed" => Ok(FramingMode::Framed),
            "legacy" => Ok(FramingMode::Legacy),
            other => Err(format!("unknown framing mode '{other}'")),
        }
    }
}

/// Wraps a payload in a frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let length = payload.len().to_string();
    let mut frame = Vec::with_capacity(length.len() + 1 + payload.len());
    frame.extend_from_slice(length.as_bytes());
    frame.push(DELIMITER);
    frame.extend_from_slice(payload);
    frame
}

/// Writes one framed payload and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> io::Result<()> {
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await
}

enum ReadState {
    /// `Auto` mode, first bytes not seen yet.
    Detect,
    Framed,
    Legacy,
    /// EOF reached or the stream was consumed by a legacy read.
    Drained,
}

/// In-flight decode progress for framed mode. Kept on the reader rather
/// than inside the `next_frame` future so that a dropped read (a lost
/// `select!` branch, a timeout) resumes where it left off instead of
/// losing the bytes it already consumed.
enum Progress {
    Prefix { length: usize, digits: usize },
    Payload { payload: Vec<u8>, filled: usize },
}

impl Progress {
    fn start() -> Self {
        Progress::Prefix {
            length: 0,
            digits: 0,
        }
    }
}

/// Pull-based frame reader.
///
/// `next_frame` makes no assumption about how payload boundaries line up
/// with the underlying reads; frames may arrive split across many partial
/// reads or coalesced into one. Callers should hand in a buffered reader.
///
/// Reads are cancellation-safe: dropping a `next_frame` future mid-frame
/// keeps the partial decode on the reader, so the next call continues the
/// same frame.
pub struct FrameReader<R> {
    reader: R,
    max_frame_size: usize,
    state: ReadState,
    progress: Progress,
    /// Detect-mode lookahead and legacy-document accumulator.
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, mode: FramingMode) -> Self {
        Self::with_max_frame_size(reader, mode, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(reader: R, mode: FramingMode, max_frame_size: usize) -> Self {
        let state = match mode {
            FramingMode::Auto => ReadState::Detect,
            FramingMode::Framed => ReadState::Framed,
            FramingMode::Legacy => ReadState::Legacy,
        };
        Self {
            reader,
            max_frame_size,
            state,
            progress: Progress::start(),
            buffer: Vec::new(),
        }
    }

    /// Returns the next payload, or `None` once the peer has cleanly closed
    /// the connection.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        match self.state {
            ReadState::Detect => self.detect_and_read().await,
            ReadState::Framed => self.read_framed().await,
            ReadState::Legacy => self.read_legacy().await,
            ReadState::Drained => Ok(None),
        }
    }

    /// Commits the connection to framed or legacy mode based on its first
    /// bytes: a digit run terminated by `#` within the lookahead means
    /// framed, anything else means legacy. The decision is made once per
    /// connection.
    async fn detect_and_read(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            let byte = match self.reader.read_u8().await {
                Ok(byte) => byte,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // A stream that ends before the mode is decided is a
                    // (possibly empty) legacy document.
                    self.state = ReadState::Drained;
                    let document = std::mem::take(&mut self.buffer);
                    return Ok(if document.is_empty() {
                        None
                    } else {
                        Some(document)
                    });
                }
                Err(e) => return Err(e.into()),
            };
            if byte == DELIMITER && !self.buffer.is_empty() {
                let length = parse_length(&self.buffer, self.max_frame_size)?;
                self.buffer.clear();
                self.state = ReadState::Framed;
                self.progress = Progress::Payload {
                    payload: vec![0u8; length],
                    filled: 0,
                };
                return self.read_framed().await;
            }
            if !byte.is_ascii_digit() || self.buffer.len() >= MODE_DETECT_LOOKAHEAD {
                self.buffer.push(byte);
                self.state = ReadState::Legacy;
                return self.read_legacy().await;
            }
            self.buffer.push(byte);
        }
    }

    async fn read_framed(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            match &mut self.progress {
                Progress::Prefix { length, digits } => {
                    let byte = match self.reader.read_u8().await {
                        Ok(byte) => byte,
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            self.state = ReadState::Drained;
                            if *digits == 0 {
                                // Clean EOF on a frame boundary.
                                return Ok(None);
                            }
                            return Err(FrameError::Incomplete);
                        }
                        Err(e) => return Err(e.into()),
                    };
                    if byte == DELIMITER {
                        if *digits == 0 {
                            return Err(FrameError::InvalidLengthPrefix { byte });
                        }
                        let length = *length;
                        self.progress = Progress::Payload {
                            payload: vec![0u8; length],
                            filled: 0,
                        };
                        continue;
                    }
                    if !byte.is_ascii_digit() {
                        return Err(FrameError::InvalidLengthPrefix { byte });
                    }
                    *length = length
                        .saturating_mul(10)
                        .saturating_add(usize::from(byte - b'0'));
                    *digits += 1;
                    if *length > self.max_frame_size {
                        return Err(FrameError::FrameTooLarge {
                            size: *length,
                            max: self.max_frame_size,
                        });
                    }
                }
                Progress::Payload { payload, filled } => {
                    while *filled < payload.len() {
                        let read = self.reader.read(&mut payload[*filled..]).await?;
                        if read == 0 {
                            self.state = ReadState::Drained;
                            return Err(FrameError::Incomplete);
                        }
                        *filled += read;
                    }
                    let frame = std::mem::take(payload);
                    self.progress = Progress::start();
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Legacy senders ship exactly one document per connection.
    /// `read_to_end` appends as bytes arrive, so partial progress survives
    /// a cancelled read here as well.
    async fn read_legacy(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        self.reader.read_to_end(&mut self.buffer).await?;
        self.state = ReadState::Drained;
        let document = std::mem::take(&mut self.buffer);
        Ok(if document.is_empty() {
            None
        } else {
            Some(document)
        })
    }
}

fn parse_length(digits: &[u8], max: usize) -> Result<usize, FrameError> {
    let mut length: usize = 0;
    for &byte in digits {
        length = length
            .saturating_mul(10)
            .saturating_add(usize::from(byte - b'0'));
        if length > max {
            return Err(FrameError::FrameTooLarge { size: length, max });
        }
    }
    Ok(length)
}
