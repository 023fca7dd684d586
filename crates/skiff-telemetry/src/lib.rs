//! # Skiff Telemetry
//!
//! Background log rotation and shipping for long-running interactive programs.
//!
//! ## Pipeline
//!
//! ```text
//! tracing event → RedactingLayer → RedactingFormatter → RotatingLogWriter
//!                                                           │ rollover / close
//!                                                           v
//!                                 ShippingQueue → ShippingWorker → Uploader → archives/
//! ```
//!
//! - **Redaction**: e-mail addresses, IPv4 addresses, credentials and
//!   filesystem paths are scrubbed before a line reaches disk
//! - **Rotation**: hourly or per-minute segments, forced by a lifecycle clock
//!   during idle periods
//! - **Shipping**: closed segments are uploaded by a background task, either
//!   with static credentials or through a presigned form
//! - **Recovery**: startup sweeps expire old files and re-enqueue segments a
//!   previous process left behind
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use skiff_core::SkiffConfig;
//! use skiff_telemetry::TelemetrySystem;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SkiffConfig::load(None).await?;
//!     let guard = TelemetrySystem::init(&config)?;
//!
//!     tracing::info!("Application started");
//!
//!     guard.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod filters;
pub mod formatter;
pub mod layer;
pub mod layout;
pub mod redaction;
pub mod rotation;
pub mod shipping;
pub mod sigv4;
pub mod sweeper;
pub mod system;
pub mod uploader;
pub mod writer;

pub use formatter::{ExceptionInfo, Record, RedactingFormatter};
pub use layer::RedactingLayer;
pub use layout::SegmentLayout;
pub use rotation::{RotationPolicy, TimedRotation};
pub use shipping::{QueueItem, ShippingQueue, ShippingSummary, ShippingWorker};
pub use sweeper::{sweep, SweepReport};
pub use system::{TelemetryGuard, TelemetrySystem};
pub use uploader::{object_key, UploadError, UploadStrategy, Uploader};
pub use writer::{LogSegment, RotatingLogWriter, WriterState};

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Telemetry-specific errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Core(#[from] skiff_core::SkiffError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Telemetry system error: {message}")]
    System { message: String },
}
