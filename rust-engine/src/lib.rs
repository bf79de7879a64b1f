//! Lure - campaign dispatch and engagement tracking for simulated phishing.
//!
//! This library provides shared modules for the two Lure binaries:
//! - `lure-dispatcher`: scheduler that promotes due campaigns and sends them
//! - `lure-web`: tracking and landing page server
//!
//! ## Architecture
//!
//! ```text
//! Scheduler → Dispatcher → MailTransport            (outbound)
//! /track, /landing → Correlator / Gatekeeper → Store  (inbound)
//! ```
//!
//! The two sides share nothing but the SQLite database.

pub mod config;
pub mod dispatch;
pub mod html;
pub mod landing;
pub mod render;
pub mod scheduler;
pub mod store;
pub mod tracking;
pub mod transport;
pub mod util;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{DispatchError, DispatchHandle, DispatchSummary, Dispatcher};
pub use landing::{Gatekeeper, LandingError};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use store::{Store, StoreError};
pub use tracking::{Correlator, TrackError, TrackOutcome, TrackRequest};
pub use transport::{MailTransport, SmtpTransport, TransportError};
pub use web::AppState;
