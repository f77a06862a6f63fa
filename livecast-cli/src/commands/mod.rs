//! CLI command implementations

mod config;
mod info;
mod record;
mod target;
mod upload;

pub use config::{config, ConfigArgs};
pub use info::info;
pub use record::{record, RecordArgs};
pub use upload::{upload, UploadArgs};
