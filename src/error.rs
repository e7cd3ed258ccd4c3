#[derive(thiserror::Error, Debug)]
pub enum RfbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported protocol {requested:?}, only binary is supported")]
    UnsupportedProtocol { requested: String },

    #[error("Receive buffer overflow: {required} bytes needed, ceiling is {max}")]
    BufferOverflow { required: usize, max: usize },

    #[error("Cannot backtrack {backtrack} bytes from read position {read_pos}")]
    InvalidBacktrack { backtrack: usize, read_pos: usize },

    #[error("Send buffer full: {pending} pending + {requested} requested > {capacity}")]
    SendBufferFull {
        pending: usize,
        requested: usize,
        capacity: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Session not open")]
    NotOpen,

    #[error("Session already open")]
    AlreadyOpen,
}

impl RfbError {
    /// Errors after which the session cannot continue and must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RfbError::BufferOverflow { .. } | RfbError::InvalidBacktrack { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RfbError>;
