//! Core types shared by every part of the skiff log pipeline.
//!
//! This crate owns the immutable [`AppSettings`] describing the running
//! process, the [`LogSettings`] and [`ShippingSettings`] that drive rotation
//! and upload, the TOML-backed [`SkiffConfig`] they are loaded from, and the
//! installation/session identity helpers.

pub mod config;
pub mod error;
pub mod identity;
pub mod settings;

pub use config::{AppConfig, SkiffConfig};
pub use error::{Result, SkiffError};
pub use identity::{get_or_create_installation_id, new_session_id, INSTALLATION_ID_FILE};
pub use settings::{
    parse_sinks, AppSettings, LogLevel, LogSettings, RotationFrequency, ShippingSettings, Sink,
};
