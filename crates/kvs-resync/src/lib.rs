//! KV Scheduler resync orchestrator
//!
//! Coordinates a resync handshake across independently registered
//! subsystems. Each subscriber gets a status channel; a resync hands its
//! event to the subscribers one at a time, in registration order, and waits
//! for each to take it and acknowledge within a timeout.
//!
//! # Example
//!
//! ```rust
//! use kvs_resync::{ResyncConfig, ResyncOrchestrator, ResyncStatus};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), kvs_resync::ResyncError> {
//! let orchestrator = ResyncOrchestrator::new(ResyncConfig::default());
//! let mut events = orchestrator.register("interfaces")?;
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         assert_eq!(event.status(), ResyncStatus::Started);
//!         event.ack();
//!     }
//! });
//!
//! let report = orchestrator.after_init().await?;
//! assert!(report.all_acked());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod orchestrator;

// Re-exports
pub use error::ResyncError;
pub use event::{ResyncStatus, StatusEvent, StatusReceiver};
pub use orchestrator::{ResyncConfig, ResyncOrchestrator, ResyncReport, SubscriberReport};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
