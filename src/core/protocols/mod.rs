pub mod resp;

pub use resp::{
    encode_command, error_reply, merge_replies, read_command, read_reply, write_frame,
    CommandFrame,
};

/// Errors raised while decoding client frames or splitting them into sub-commands
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad request format: {0}")]
    BadFormat(String),
    #[error("wrong number of arguments: {0}")]
    BadArgsCount(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Format errors leave the byte stream out of sync with the client
    pub fn desynchronizes_stream(&self) -> bool {
        matches!(self, ProtocolError::BadFormat(_))
    }
}
