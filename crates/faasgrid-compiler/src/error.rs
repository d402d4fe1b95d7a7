//! Compilation errors.

use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// A descriptor field cannot be turned into a valid pod spec.
    #[error("invalid {field}: {reason}")]
    InvalidResource { field: String, reason: String },
}

impl CompileError {
    pub fn invalid(field: &str, reason: impl ToString) -> Self {
        CompileError::InvalidResource {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Name of the offending descriptor field.
    pub fn field(&self) -> &str {
        match self {
            CompileError::InvalidResource { field, .. } => field,
        }
    }
}
