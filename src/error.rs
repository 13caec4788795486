use thiserror::Error;

/// The error kinds that are delivered to completions of stream operations
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum StreamError {
    /// The operation's deadline expired. The socket itself is still usable.
    #[error("operation timed out")]
    Timeout,
    /// The direction (or the whole socket) was shut down, locally or by the peer. For reads,
    ///  this is also the end-of-stream marker after the peer closed its transmit direction.
    #[error("stream was shut down")]
    Shutdown,
    /// The peer sent malformed or inconsistent messages, and the socket was reset
    #[error("peer violated the stream protocol")]
    ProtocolViolation,
    /// The tunnel reported the loss of the underlying channel
    #[error("tunnel channel was lost")]
    ChannelLost,
}

/// Synchronous rejection of a read / write / shutdown call. Nothing was sent, and no completion
///  will be delivered.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum SubmitError {
    /// there is already an operation of this kind in flight
    #[error("an operation of this kind is already pending")]
    AlreadyPending,
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// A write that did not complete successfully. Bytes are confirmed strictly in order, so the
///  first `total - unconfirmed_bytes` bytes of the write were acknowledged by the peer.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("{error} ({unconfirmed_bytes} bytes unconfirmed)")]
pub struct WriteFailure {
    pub error: StreamError,
    pub unconfirmed_bytes: usize,
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ListenError {
    /// the port could not be bound within the listen timeout
    #[error("listen port could not be bound within the listen timeout")]
    BindTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::timeout(SubmitError::Stream(StreamError::Timeout), "operation timed out")]
    #[case::already_pending(SubmitError::AlreadyPending, "an operation of this kind is already pending")]
    fn test_submit_error_display(#[case] error: SubmitError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[test]
    fn test_write_failure_display() {
        let failure = WriteFailure { error: StreamError::ChannelLost, unconfirmed_bytes: 17 };
        assert_eq!(failure.to_string(), "tunnel channel was lost (17 bytes unconfirmed)");
    }

    #[test]
    fn test_stream_error_converts_into_submit_error() {
        let error: SubmitError = StreamError::Shutdown.into();
        assert_eq!(error, SubmitError::Stream(StreamError::Shutdown));
    }
}
