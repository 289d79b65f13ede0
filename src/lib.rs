//! learntrack - telemetry relay for interactive course applications
//!
//! Two subsystems share one concern, moving state reliably under partial
//! failure:
//! - configuration bootstrap: database coordinates come from an encrypted
//!   cache or remote blob and are validated against the live store
//! - session tracking: course apps report interaction events, which are
//!   buffered locally per session, normalized into canonical event records
//!   and relayed to a document store without loss or duplication
//!
//! # Example
//!
//! ```ignore
//! use learntrack::normalize::{normalize, NormalizeOptions, RawSessionLog};
//!
//! let raw: RawSessionLog = serde_json::from_str(&std::fs::read_to_string("session.json")?)?;
//! for record in normalize(&raw, &NormalizeOptions::default()) {
//!     println!("{} {} {}", record.date, record.event, record.label);
//! }
//! ```

// Core modules (leaves first)
pub mod error;
pub mod crypto;
pub mod config;
pub mod store;
pub mod bootstrap;
pub mod normalize;
pub mod capture;
pub mod transfer;
pub mod tracker;

// Front ends
pub mod server;
pub mod cli;

pub use bootstrap::{BlobSource, BootstrapError, Bootstrapped, Bootstrapper, ConfigSource};
pub use config::{DbConfig, ExecutionContext, Settings};
pub use crypto::{decrypt, encrypt, EncryptedBlob};
pub use error::{TelemetryError, TelemetryResult};
pub use normalize::{normalize, Correctness, EventKind, EventRecord, NormalizeOptions, RawSessionLog};
pub use store::{DefaultConnector, DocumentStore, Endpoint, StoreConnector};
pub use tracker::{Notice, NoticeLevel, Tracker};
pub use transfer::{LogTransfer, TransferTarget};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - course telemetry relay", NAME, VERSION)
}
