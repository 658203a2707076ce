use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Represents errors that can occur while driving the event loop.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Error during reactor initialization
    #[error("reactor initialization failed: {0}")]
    Init(io::Error),

    /// Error when registering a descriptor with the reactor
    #[error("registration failed for fd {fd}: {source}")]
    Registration { fd: RawFd, source: io::Error },

    /// Error when changing interest for a descriptor that was never registered
    #[error("no handler registered for fd {0}")]
    UnknownHandler(RawFd),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(io::Error),

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Represents errors surfaced by buffered stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The peer closed the connection underneath a pending read
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A read was issued while another read is still pending
    #[error("a read is already pending on this stream")]
    AlreadyReading,

    /// Any operation on a stream that has already been closed
    #[error("stream is closed")]
    StreamClosed,

    /// The read buffer outgrew the configured cap
    #[error("read buffer capacity exceeded ({0} bytes)")]
    BufferCapacityExceeded(usize),

    /// Wrapper for reactor-level failures (registration, wake-up, ...)
    #[error("event loop error: {0}")]
    Loop(#[from] LoopError),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Results using LoopError as the error type
pub type Result<T> = std::result::Result<T, LoopError>;

/// Type alias for Results using StreamError as the error type
pub type StreamResult<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Tests the conversion and formatting of LoopError with IO errors
    #[test]
    fn test_loop_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test error");
        let loop_err = LoopError::from(io_err);

        assert!(matches!(loop_err, LoopError::Io(_)));
        assert_eq!(loop_err.to_string(), "io error: test error");
    }

    /// Tests that reactor-level failures nest inside StreamError
    #[test]
    fn test_stream_error_wraps_loop_error() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test error");
        let stream_err = StreamError::from(LoopError::Polling(io_err));

        assert!(matches!(stream_err, StreamError::Loop(LoopError::Polling(_))));
        assert_eq!(
            stream_err.to_string(),
            "event loop error: polling failed: test error"
        );
    }

    /// Tests the display strings of the stream state errors
    #[test]
    fn test_stream_error_display() {
        assert_eq!(
            StreamError::AlreadyReading.to_string(),
            "a read is already pending on this stream"
        );
        assert_eq!(StreamError::StreamClosed.to_string(), "stream is closed");
    }
}
