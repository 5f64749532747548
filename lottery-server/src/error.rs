use std::io;

use thiserror::Error;

use crate::bet::MalformedRecord;

/// Failures scoped to a single client connection.
///
/// None of these ever escape the connection handler: the handler logs them
/// and closes its socket. A peer that closes mid-message is not represented
/// here; framing reads report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("bet store failure: {0}")]
    Storage(#[source] io::Error),

    #[error("socket connection broken")]
    BrokenPipe,

    #[error("malformed bet record: {0}")]
    MalformedRecord(#[from] MalformedRecord),

    #[error("agency id in the trailer must be positive")]
    InvalidAgency,

    #[error("record length {len} exceeds the {max} byte limit")]
    RecordTooLarge { len: usize, max: usize },

    #[error("winners payload of {len} bytes does not fit a one-byte length prefix")]
    WinnersTooLarge { len: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
