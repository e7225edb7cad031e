// Maps framed records onto typed cache commands and serializes replies.
//
// Protocol strings live only in this module: token matching on the request
// side and the `Display` impl on the reply side. The store itself never
// sees wire text.

use crate::frame::Frame;
use crate::store::{Item, SharedStore, StoreMode, StoreOutcome};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

/// A typed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Delete { key: String },
    Store(StoreRequest),
}

/// Payload of a `set`, `add`, or `replace` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub mode: StoreMode,
    pub key: String,
    pub flags: u32,
    pub exptime: i64,
    /// The declared length token, stored and echoed as given; the value
    /// line's actual length is not validated against it.
    pub byte_count: u64,
    pub noreply: bool,
    pub value: String,
}

/// Reply to a single command, without the trailing delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Stored,
    NotStored,
    Deleted,
    End,
    Value {
        value: String,
        flags: u32,
        byte_count: u64,
    },
}

/// Typed protocol failures. Any of these closes the connection without a
/// reply line.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported command: {0:?}")]
    Unsupported(String),

    #[error("`{command}` takes {expected} tokens, got {actual}")]
    WrongArity {
        command: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("invalid integer in `{field}`")]
    InvalidInteger {
        field: &'static str,
        #[source]
        source: ParseIntError,
    },
}

impl Command {
    /// Map an extracted record onto a typed command.
    pub fn from_frame(frame: Frame) -> Result<Command, ProtocolError> {
        match frame {
            Frame::Line(line) => Command::from_line(&line),
            Frame::Payload { header, value } => Command::from_storage(&header, value),
        }
    }

    /// True when the client asked for the reply to be computed but not
    /// transmitted.
    pub fn is_noreply(&self) -> bool {
        matches!(self, Command::Store(request) if request.noreply)
    }

    /// Run the command against the shared store and produce its reply.
    ///
    /// Each command is exactly one store operation; the store mutex is held
    /// for that operation and released before the reply goes out.
    pub fn apply(self, store: &SharedStore) -> Response {
        match self {
            Command::Get { key } => match store.get(&key) {
                Some(item) => Response::from(item),
                None => Response::End,
            },
            Command::Delete { key } => {
                if store.delete(&key) {
                    Response::Deleted
                } else {
                    Response::End
                }
            }
            Command::Store(request) => {
                let StoreRequest {
                    mode,
                    key,
                    flags,
                    exptime,
                    byte_count,
                    value,
                    ..
                } = request;
                Response::from(store.insert(&key, value, flags, byte_count, exptime, mode))
            }
        }
    }

    fn from_line(line: &str) -> Result<Command, ProtocolError> {
        let tokens: Vec<&str> = line.split(' ').collect();
        match tokens[0] {
            "get" => Ok(Command::Get {
                key: single_key(&tokens, "get")?,
            }),
            "delete" => Ok(Command::Delete {
                key: single_key(&tokens, "delete")?,
            }),
            other => Err(ProtocolError::Unsupported(other.to_string())),
        }
    }

    fn from_storage(header: &str, value: String) -> Result<Command, ProtocolError> {
        let tokens: Vec<&str> = header.split(' ').collect();
        let (mode, command) = match tokens[0] {
            "set" => (StoreMode::Set, "set"),
            "add" => (StoreMode::Add, "add"),
            "replace" => (StoreMode::Replace, "replace"),
            // A storage prefix without the exact command word, e.g.
            // `settle`; framed as two lines but not a command we speak.
            other => return Err(ProtocolError::Unsupported(other.to_string())),
        };

        if tokens.len() != 5 && tokens.len() != 6 {
            return Err(ProtocolError::WrongArity {
                command,
                expected: "5 or 6",
                actual: tokens.len(),
            });
        }

        // A sixth token only means anything when it is literally `noreply`;
        // any other trailing word is accepted as a plain reply-carrying
        // store.
        let noreply = tokens.len() == 6 && tokens[5] == "noreply";

        Ok(Command::Store(StoreRequest {
            mode,
            key: tokens[1].to_string(),
            flags: parse_int(tokens[2], "flags")?,
            exptime: parse_int(tokens[3], "exptime")?,
            byte_count: parse_int(tokens[4], "byte_count")?,
            noreply,
            value,
        }))
    }
}

fn single_key(tokens: &[&str], command: &'static str) -> Result<String, ProtocolError> {
    match tokens {
        [_, key] => Ok((*key).to_string()),
        _ => Err(ProtocolError::WrongArity {
            command,
            expected: "2",
            actual: tokens.len(),
        }),
    }
}

fn parse_int<T>(token: &str, field: &'static str) -> Result<T, ProtocolError>
where
    T: FromStr<Err = ParseIntError>,
{
    token
        .parse()
        .map_err(|source| ProtocolError::InvalidInteger { field, source })
}

impl From<Item> for Response {
    fn from(item: Item) -> Response {
        Response::Value {
            value: item.value,
            flags: item.flags,
            byte_count: item.byte_count,
        }
    }
}

impl From<StoreOutcome> for Response {
    fn from(outcome: StoreOutcome) -> Response {
        match outcome {
            StoreOutcome::Stored => Response::Stored,
            StoreOutcome::NotStored => Response::NotStored,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Response::Stored => "STORED".fmt(fmt),
            Response::NotStored => "NOT STORED".fmt(fmt),
            Response::Deleted => "DELETED".fmt(fmt),
            Response::End => "END".fmt(fmt),
            Response::Value {
                value,
                flags,
                byte_count,
            } => write!(fmt, "VALUE {value} {flags} {byte_count}"),
        }
    }
}
