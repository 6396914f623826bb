//! Error types shared by the device runtime crates.
//!
//! `IotError::Wrapped` annotates a cause with the action that failed and the
//! source location where it was caught. Walk the chain with
//! [`std::error::Error::source`] or the helpers on [`IotError`].

use std::panic::Location;

use thiserror::Error;

use crate::service::ErrorResponse;

/// Errors produced by the device runtime.
#[derive(Debug, Error)]
pub enum IotError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("request rejected: {0}")]
    Rejected(ErrorResponse),

    #[error("request already pending for '{0}'")]
    AlreadyPending(String),

    #[error("{0} not created")]
    NotCreated(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("end of stream")]
    Eof,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{action} ({}:{}): {source}", .location.file(), .location.line())]
    Wrapped {
        action: String,
        location: &'static Location<'static>,
        #[source]
        source: Box<IotError>,
    },

    #[error("{0}")]
    Other(String),
}

/// Convenience alias for runtime results.
pub type IotResult<T> = Result<T, IotError>;

impl IotError {
    /// Wrap `cause` with the failing action and the caller's location.
    ///
    /// `Eof` is returned unchanged so stream loops can keep matching on it.
    #[track_caller]
    pub fn wrap(action: impl Into<String>, cause: impl Into<IotError>) -> Self {
        let cause = cause.into();
        if matches!(cause, IotError::Eof) {
            return cause;
        }
        IotError::Wrapped {
            action: action.into(),
            location: Location::caller(),
            source: Box::new(cause),
        }
    }

    /// The innermost error, skipping every `Wrapped` layer.
    pub fn root_cause(&self) -> &IotError {
        let mut current = self;
        while let IotError::Wrapped { source, .. } = current {
            current = source;
        }
        current
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.root_cause(), IotError::Eof)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), IotError::Cancelled)
    }

    /// The service rejection at the root of the chain, if any.
    pub fn rejection(&self) -> Option<&ErrorResponse> {
        match self.root_cause() {
            IotError::Rejected(response) => Some(response),
            _ => None,
        }
    }

    /// Capture site of the outermost wrap.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            IotError::Wrapped { location, .. } => Some(location),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for IotError {
    fn from(e: serde_json::Error) -> Self {
        IotError::Serialization(e.to_string())
    }
}

/// Attach an action description to the error side of a result.
pub trait ResultExt<T> {
    #[track_caller]
    fn wrap_err(self, action: &str) -> IotResult<T>;
}

impl<T, E: Into<IotError>> ResultExt<T> for Result<T, E> {
    #[track_caller]
    fn wrap_err(self, action: &str) -> IotResult<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(IotError::wrap(action, e)),
        }
    }
}
