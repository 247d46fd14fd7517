pub mod discovery;
pub mod engine_info;
pub mod exporter;
pub mod firewall;
pub mod importer;
pub mod markers;
pub mod models;
pub mod operator;
pub mod provisioning;
pub mod safe_copy;
pub mod services;
pub mod shares;
pub mod transfer_engine;
pub mod verifier;
pub mod wait;

pub use exporter::{ExportReport, Exporter};
pub use importer::{ImportReport, Importer};
pub use models::{MigrationMetadata, Package, ServiceHandle, ServiceState};
pub use safe_copy::SafeCopy;
