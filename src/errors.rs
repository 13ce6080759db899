use std::cell::RefCell;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OxError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unsupported layout: {0}")]
    UnsupportedLayout(String),
    #[error("No kernel candidate accepts the configuration: {0}")]
    UnsupportedConfiguration(String),
    #[error("Device compiler rejected kernel source: {log}")]
    CompileError { log: String },
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Device error: {0}")]
    DeviceError(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type OxResult<T> = Result<T, OxError>;

/// Status codes exposed at the embedder boundary. Every `OxError` maps onto
/// exactly one of these; the human-readable message is kept thread-locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    InvalidArg,
    OutOfResources,
    DeviceError,
    NetworkError,
    NetworkNotImplemented,
    Unsupported,
}

impl OxError {
    pub fn status(&self) -> StatusCode {
        match self {
            OxError::InvalidArgument(_) => StatusCode::InvalidArg,
            OxError::UnsupportedLayout(_) => StatusCode::Unsupported,
            OxError::UnsupportedConfiguration(_) => StatusCode::Unsupported,
            OxError::CompileError { .. } => StatusCode::NetworkError,
            OxError::ResourceExhausted(_) => StatusCode::OutOfResources,
            OxError::DeviceError(_) => StatusCode::DeviceError,
            OxError::NotImplemented(_) => StatusCode::NetworkNotImplemented,
            OxError::Io(_) => StatusCode::NetworkError,
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Records the error message thread-locally and returns its status code.
/// Boundary functions call this once per failure before returning the code.
pub fn record_last_error(err: &OxError) -> StatusCode {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(err.to_string()));
    err.status()
}

/// Takes the most recent failure message for the calling thread, clearing it.
pub fn take_last_error() -> Option<String> {
    LAST_ERROR.with(|cell| cell.borrow_mut().take())
}

/// Peeks at the most recent failure message without clearing it.
pub fn last_error_message() -> Option<String> {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_total() {
        let err = OxError::UnsupportedConfiguration("dilated grouped convolution".into());
        assert_eq!(err.status(), StatusCode::Unsupported);
        assert_eq!(record_last_error(&err), StatusCode::Unsupported);
        let msg = take_last_error().unwrap();
        assert!(msg.contains("dilated grouped convolution"));
        assert!(take_last_error().is_none());
    }
}
