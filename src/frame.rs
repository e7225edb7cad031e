//! Provides a type representing one framed command record as well as
//! utilities for extracting records from a buffered byte stream.
//!
//! The wire framing is `\r\n`-delimited ASCII. Storage commands span two
//! lines (header plus raw value); everything else is a single line.

use core::fmt;
use std::io::Cursor;
use std::str::Utf8Error;

/// One extracted command record.
///
/// Classification is a prefix test on the raw buffer: a record whose first
/// bytes spell a storage command carries its value on a second line, and
/// any other leading token frames as a single line. Unrecognized commands
/// are therefore still extracted here and rejected later, during parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A one-line record (`get`, `delete`, or an unknown command).
    Line(String),
    /// A two-line record: storage header plus the raw value line.
    Payload { header: String, value: String },
}

#[derive(Debug)]
pub enum Error {
    /// Not enough data is available to extract a record
    Incomplete,

    /// Invalid record encoding
    Other(crate::Error),
}

impl Frame {
    /// Checks if an entire record can be extracted from `src`. If it can
    /// be, return the record length in bytes, delimiters included, so the
    /// caller can release the consumed prefix afterwards.
    #[tracing::instrument]
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<usize, Error> {
        let start = src.position() as usize;
        let two_line = takes_payload(&src.get_ref()[start..]);

        get_line(src)?;
        if two_line {
            get_line(src)?;
        }

        Ok(src.position() as usize - start)
    }

    /// Extract the record. The buffer has already been validated with
    /// `check`.
    #[tracing::instrument]
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        let start = src.position() as usize;
        let two_line = takes_payload(&src.get_ref()[start..]);

        let header = std::str::from_utf8(get_line(src)?)?.to_string();
        if !two_line {
            return Ok(Frame::Line(header));
        }

        let value = std::str::from_utf8(get_line(src)?)?.to_string();
        Ok(Frame::Payload { header, value })
    }
}

/// Storage commands carry their value on a second line.
fn takes_payload(buf: &[u8]) -> bool {
    buf.starts_with(b"set") || buf.starts_with(b"add") || buf.starts_with(b"replace")
}

/// Scan to the next `\r\n` and return the bytes before it, leaving the
/// cursor positioned past the delimiter.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf = *src.get_ref();

    for i in start..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);
            return Ok(&buf[start..i]);
        }
    }

    Err(Error::Incomplete)
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::Line(line) => line.fmt(fmt),
            Frame::Payload { header, value } => {
                write!(fmt, "{header} ({} value bytes)", value.len())
            }
        }
    }
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src.into())
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<Utf8Error> for Error {
    fn from(_src: Utf8Error) -> Error {
        "protocol error; record is not valid UTF-8".into()
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Incomplete => "stream ended early".fmt(fmt),
            Error::Other(err) => err.fmt(fmt),
        }
    }
}
