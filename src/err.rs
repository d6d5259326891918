use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtwError>;

/// Errors produced while decoding or formatting an event.
///
/// `NotFound` is soft: map and result-code lookups that report it are absorbed into a
/// numeric fallback rendering and never surface from the formatting entry points.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EtwError {
    #[error("event uses an unsupported decoding source (WPP events must be decoded elsewhere)")]
    UnsupportedFormat,

    #[error("offset {offset}: truncated {what} (need {need} bytes, have {have})")]
    InvalidData {
        what: &'static str,
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("property uses an unsupported input type `{in_type}`")]
    UnsupportedType { in_type: u16 },

    #[error("failed to allocate buffer")]
    OutOfMemory,

    #[error("invalid parameter: {what}")]
    InvalidParameter { what: &'static str },

    #[error("not found")]
    NotFound,

    #[error("parameter message id {message_id} was not found")]
    MessageIdNotFound { message_id: u32 },

    #[error("enumerator is not in a state that supports this operation")]
    InvalidState,

    #[error("callback failed: {message}")]
    Callback { message: String },
}

impl EtwError {
    pub(crate) fn truncated(what: &'static str, offset: usize, need: usize, have: usize) -> Self {
        EtwError::InvalidData {
            what,
            offset: offset as u64,
            need,
            have,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EtwError::NotFound)
    }
}

impl From<std::collections::TryReserveError> for EtwError {
    fn from(_: std::collections::TryReserveError) -> Self {
        EtwError::OutOfMemory
    }
}
