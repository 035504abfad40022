pub mod error;
pub mod manager;
pub mod wire;

pub use error::WorkspaceError;
pub use manager::{ExtractOutcome, WorkspaceManager};
pub use wire::{
    download_command, list_command, parse_listing, remove_command, shell_quote, upload_command,
};
