use std::io;

/// Terminal failures of the intake path.
///
/// Every variant keeps the underlying `io::Error`, so the platform error
/// code reaches the caller untouched.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("receive from queue socket failed: {0}")]
    Recv(#[source] io::Error),

    #[error("sending verdict for packet {id} failed: {source}")]
    Send {
        id: u32,
        #[source]
        source: io::Error,
    },

    #[error("setting socket option {option} failed: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("poll on queue socket failed: {0}")]
    Poll(#[source] io::Error),

    #[error("opening netfilter queue socket failed: {0}")]
    Open(#[source] io::Error),

    #[error("queue {queue_num} {command} failed: {source}")]
    Config {
        queue_num: u16,
        command: &'static str,
        #[source]
        source: io::Error,
    },
}

impl IntakeError {
    /// The raw OS error code carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.io_error().raw_os_error()
    }

    pub fn io_error(&self) -> &io::Error {
        match self {
            IntakeError::Recv(err) | IntakeError::Poll(err) | IntakeError::Open(err) => err,
            IntakeError::Send { source, .. }
            | IntakeError::SocketOption { source, .. }
            | IntakeError::Config { source, .. } => source,
        }
    }
}

pub type Result<T> = std::result::Result<T, IntakeError>;
