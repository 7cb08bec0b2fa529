pub mod cloud;
pub mod config;
pub mod convert;
pub mod descriptor;
pub mod error;
pub mod flavor;
pub mod logger;
pub mod network;
pub mod orchestrator;
pub mod provision;
pub mod record;
pub mod vmware;

pub use error::ShiftError;
pub use record::{MigrationRecord, Phase};

pub type Result<T> = std::result::Result<T, ShiftError>;

// Convenience re-exports for the migration pipeline
pub use cloud::{CloudClient, MemoryCloud};
pub use convert::{Converter, VirtV2v};
pub use orchestrator::{MigrationOptions, Orchestrator};
pub use provision::{Ensured, Provisioner};
pub use record::RecordStore;
