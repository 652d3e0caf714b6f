//! Error types for object encoding and decoding.

use snafu::Snafu;

use crate::constants::MAX_OBJECT_SIZE;

/// Errors produced while parsing or constructing wire objects.
///
/// Every variant is a `BadEncoding`-class failure: the offending object is
/// rejected, never the process.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ObjectError {
    /// Input ended before a field could be read.
    #[snafu(display("truncated object: need {need} more bytes at offset {offset}"))]
    Truncated {
        /// Offset at which the read was attempted.
        offset: usize,
        /// Number of bytes the field required.
        need: usize,
    },

    /// A length field disagrees with the surrounding structure.
    #[snafu(display("bad {field} length {got} (expected {expected})"))]
    BadFieldLength {
        /// Which field carried the length.
        field: &'static str,
        /// The length found on the wire.
        got: usize,
        /// The length the structure requires.
        expected: usize,
    },

    /// The object body exceeds the sane-size ceiling.
    #[snafu(display("object of {size} bytes exceeds the {MAX_OBJECT_SIZE} byte ceiling"))]
    ObjectTooLarge {
        /// Size of the offending body.
        size: usize,
    },

    /// An object tag this codec does not understand.
    #[snafu(display("unknown routing object tag 0x{tag:02x}"))]
    UnknownTag {
        /// The tag found on the wire.
        tag: u8,
    },

    /// A field holds a value outside its domain.
    #[snafu(display("invalid {what}: {reason}"))]
    InvalidField {
        /// Which field was invalid.
        what: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A builder was asked to sign with a key that does not match the
    /// object's VK.
    #[snafu(display("signing key does not match the object's verifying key"))]
    KeyMismatch,
}

/// Result alias for object codec operations.
pub type Result<T> = std::result::Result<T, ObjectError>;
