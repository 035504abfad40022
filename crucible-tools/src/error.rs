use thiserror::Error;

use crucible_core::BrokerError;

/// Errors from custom-tool parsing and input validation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool source does not declare a usable function.
    #[error("invalid tool: {0}")]
    Invalid(String),

    /// The provided arguments do not satisfy the tool's input schema.
    #[error("invalid tool input: {0}")]
    InvalidInput(String),
}

impl From<ToolError> for BrokerError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Invalid(s) => BrokerError::InvalidTool(s),
            ToolError::InvalidInput(s) => BrokerError::InvalidArgument(s),
        }
    }
}
