//! Error types for the codec and the atomic transfer path.

use thiserror::Error;

/// Errors produced while decoding frames from a stream.
///
/// Every variant is fatal to the connection it came from: a byte stream
/// cannot be resynchronized after a short or garbled frame.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Peer closed the stream partway through a frame.
    #[error("stream closed mid-frame ({read} of {expected} bytes)")]
    Truncated {
        /// Bytes received before the stream closed
        read: usize,
        /// Bytes the frame required
        expected: usize,
    },

    /// Declared frame length exceeds the allowed maximum.
    #[error("frame too large: {len} bytes (max: {max} bytes)")]
    FrameTooLarge {
        /// Declared length
        len: usize,
        /// Limit for this frame kind
        max: usize,
    },

    /// Header bytes were not a valid message.
    #[error("malformed message header: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Deadline expired while a frame was in flight.
    #[error("{0} timeout ({1} ms)")]
    Timeout(&'static str, u64),

    /// Underlying stream error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while committing a received file.
///
/// None of these close the connection; the file is discarded and the
/// registry is left untouched.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Path is absolute, escapes the root, or names a reserved entry.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// Wire path as received
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// Content length differs from the size declared in the record.
    #[error("size mismatch for {path}: declared {declared} bytes, received {received}")]
    SizeMismatch {
        /// Wire path
        path: String,
        /// Size in the record
        declared: u64,
        /// Bytes actually received
        received: u64,
    },

    /// File on disk after writing differs from the declared size.
    #[error("short write for {path}: declared {declared} bytes, {on_disk} on disk")]
    WrittenSizeMismatch {
        /// Wire path
        path: String,
        /// Size in the record
        declared: u64,
        /// Size of the temp file after sync
        on_disk: u64,
    },

    /// Content hash differs from the hash declared in the record.
    #[error("hash mismatch for {path}: declared {declared}, computed {computed}")]
    HashMismatch {
        /// Wire path
        path: String,
        /// Hash in the record
        declared: String,
        /// Hash of the received bytes
        computed: String,
    },

    /// File cannot travel in a single content frame.
    #[error("{path} is too large to transfer: {size} bytes (max: {max} bytes)")]
    TooLarge {
        /// Wire path
        path: String,
        /// Size on disk
        size: u64,
        /// Content frame limit
        max: u64,
    },

    /// Filesystem error while writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
