pub mod error;
pub mod expiry;
pub mod metadata;
pub mod types;
pub mod validation;

pub use error::BrokerError;
pub use expiry::{expiry_from, parse_duration};
pub use metadata::FileMetadata;
pub use types::{ChatId, ContentHash, WorkerName};
pub use validation::validate_workspace_path;
