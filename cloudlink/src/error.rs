use crate::topic::TopicError;

pub type Result<T, E = CloudError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum CloudError {
    /// Raised by publish/subscribe/unsubscribe while Disconnected or Disconnecting.
    /// Callers may retry after the next connection-established event.
    #[error("not connected")]
    NotConnected,
    #[error("connect failure, {0}")]
    ConnectFailure(anyhow::Error),
    #[error("disconnect failure, {0}")]
    DisconnectFailure(anyhow::Error),
    #[error("invalid argument, {0}")]
    InvalidArgument(String),
    #[error("topic error, {0}")]
    Topic(#[from] TopicError),
    #[error("configuration store error, {0}")]
    Store(anyhow::Error),
    #[error("session error, {0}")]
    Session(anyhow::Error),
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl CloudError {
    #[inline]
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        CloudError::InvalidArgument(msg.into())
    }

    #[inline]
    pub fn is_not_connected(&self) -> bool {
        matches!(self, CloudError::NotConnected)
    }

    #[inline]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, CloudError::InvalidArgument(_) | CloudError::Topic(_))
    }
}

impl From<serde_json::Error> for CloudError {
    #[inline]
    fn from(e: serde_json::Error) -> Self {
        CloudError::InvalidArgument(e.to_string())
    }
}

impl From<regex::Error> for CloudError {
    #[inline]
    fn from(e: regex::Error) -> Self {
        CloudError::InvalidArgument(e.to_string())
    }
}
