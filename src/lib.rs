//! Skywatch - per-project aircraft sighting tracker
//!
//! Consumes a stream of decoded aircraft messages, keeps one in-memory
//! sighting per ICAO address and maintains, for every configured project,
//! a persisted visibility lifecycle: open, update, close and reopen.

pub mod clock;
pub mod config;
pub mod country;
pub mod email;
pub mod error;
pub mod filter;
pub mod geo;
pub mod geocoding;
pub mod listener;
pub mod log_format;
pub mod message;
pub mod metrics;
pub mod project;
pub mod registry;
pub mod route;
pub mod sighting;
pub mod source;
pub mod store;
pub mod tracker;

pub use config::{TrackerConfig, TrackerFileConfig};
pub use error::TrackerError;
pub use message::Message;
pub use project::{Feature, Notification, ProjectDefinition, ReopenPolicy};
pub use tracker::{RunningTracker, Tracker, TrackerServices};
