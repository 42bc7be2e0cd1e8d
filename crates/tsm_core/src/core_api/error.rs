use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dialect::DialectError;
use crate::scanner::ScanError;
use crate::serializer::RenderError;
use crate::tree::{LoadError, StructuralViolation};
use crate::writer::WriteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreErrorCode {
    Parse,
    DialectUnrecognized,
    ProfileNotFound,
    StructuralViolation,
    Io,
    StaleDocument,
    InternalInvariant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreError {
    pub code: CoreErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn new(code: CoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Error for CoreError {}

impl From<ScanError> for CoreError {
    fn from(err: ScanError) -> Self {
        Self::new(CoreErrorCode::Parse, err.to_string())
    }
}

impl From<LoadError> for CoreError {
    fn from(err: LoadError) -> Self {
        Self::new(CoreErrorCode::Parse, err.to_string())
    }
}

impl From<DialectError> for CoreError {
    fn from(err: DialectError) -> Self {
        let code = match err {
            DialectError::Unrecognized(_) => CoreErrorCode::DialectUnrecognized,
            DialectError::ProfileNotFound { .. } => CoreErrorCode::ProfileNotFound,
        };
        Self::new(code, err.to_string())
    }
}

impl From<StructuralViolation> for CoreError {
    fn from(err: StructuralViolation) -> Self {
        Self::new(CoreErrorCode::StructuralViolation, err.to_string())
    }
}

impl From<RenderError> for CoreError {
    fn from(err: RenderError) -> Self {
        Self::new(CoreErrorCode::InternalInvariant, err.to_string())
    }
}

impl From<WriteError> for CoreError {
    fn from(err: WriteError) -> Self {
        let code = match err {
            WriteError::Stale(_) => CoreErrorCode::StaleDocument,
            WriteError::InvalidChanges(_) => CoreErrorCode::InternalInvariant,
            WriteError::TargetMissing(_) | WriteError::ReadOnly(_) | WriteError::Io { .. } => {
                CoreErrorCode::Io
            }
        };
        Self::new(code, err.to_string())
    }
}
