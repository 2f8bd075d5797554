use thiserror::Error;

/// Why an inbound frame produced no broadcast.
///
/// Rejections are logged and never reported back over the socket.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("caller is not authenticated")]
    Unauthenticated,

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message text is empty")]
    EmptyMessage,

    #[error("message {0} not found in this conversation")]
    UnknownMessage(i64),

    #[error("message {0} already marked {1}")]
    AlreadyMarked(i64, &'static str),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl Rejection {
    /// Storage failures are faults; everything else is expected client noise.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
