use thiserror::Error;

/// Crate-wide error type.
///
/// Success is `Result::Ok`; every other outcome maps onto one of the kinds
/// below. `NotFound` is ordinary control flow in lookups and end-of-log
/// sensing, everything else is exceptional.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("logic error: {0}")]
    LogicError(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Clone the error for the engine's sticky-error slot. `io::Error` does
    /// not implement `Clone`, so the kind and message are preserved instead.
    pub(crate) fn redacted_clone(&self) -> Error {
        match self {
            Error::NotFound(s) => Error::NotFound(s.clone()),
            Error::InvalidArgument(s) => Error::InvalidArgument(s.clone()),
            Error::LogicError(s) => Error::LogicError(s.clone()),
            Error::Corruption(s) => Error::Corruption(s.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinguishable() {
        assert!(Error::NotFound("k".into()).is_not_found());
        assert!(!Error::Corruption("bad magic".into()).is_not_found());
        assert!(Error::Corruption("bad magic".into()).is_corruption());
    }
}
