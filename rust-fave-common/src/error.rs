//! Error types for FaVe model synchronization.

use thiserror::Error;

/// All possible errors that can occur while building, diffing and
/// synchronizing device models.
#[derive(Error, Debug)]
pub enum Error {
    /// A producer message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The message carries a `type` tag with no registered decoder.
    #[error("unsupported model type: {0}")]
    UnsupportedModelType(String),

    /// The field has no static width or is absent from a mapping.
    #[error("unknown field: {0}")]
    UnknownField(String),

    /// The field is already part of the mapping.
    #[error("duplicate field: {0}")]
    DuplicateField(String),

    #[error("length mismatch: expected {expected} bits, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("range {start}..{stop} out of bounds for vector of length {length}")]
    OutOfBounds {
        start: usize,
        stop: usize,
        length: usize,
    },

    /// A field value could not be turned into ternary bits.
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// A table, port or rule name that is not known to the current state.
    #[error("unknown reference: {0}")]
    UnknownReference(String),

    /// Two models of different nodes or types were compared.
    #[error("incompatible models: {0}")]
    IncompatibleModels(String),

    /// Error related to length-prefixed framing.
    #[error("frame error: {0}")]
    Frame(String),

    /// The verification engine rejected a call or could not be reached.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidValue`].
    pub fn invalid_value(field: impl Into<String>, value: impl Into<String>) -> Self {
        Error::InvalidValue {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Whether the error only invalidates a single edit and the surrounding
    /// update may continue.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Error::UnknownReference(_))
    }
}
