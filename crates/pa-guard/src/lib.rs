//! Port Authority Guard
//!
//! Everything around the decision engine that turns it into a running
//! blocker.
//!
//! # Architecture
//!
//! ```text
//!  request ──▶ InterceptionPipeline ──▶ DecisionEngine ──▶ verdict
//!                    ▲ attach/detach           │ block events
//!                    │                         ▼
//!  popup ──▶ ControlPlane ──▶ BlockingSwitch   QueuedRecorder ──▶ BlockLedger
//!                                                                   ▲
//!  tab events ──────────────────────────────▶ TabWatcher ───────────┘
//! ```
//!
//! # Features
//!
//! - **Blocking switch**: attach/detach with a persisted mirror
//! - **Control plane**: popup commands, checked against the popup origin
//! - **Abortable dispatch**: abandoned requests are owed no verdict
//! - **Config**: TOML or JSON, defaults for every field

mod config;
mod control;
mod service;
mod switch;

pub use config::{ConfigError, DnsSettings, GuardConfig, POPUP_PATH};
pub use control::{Command, ControlError, ControlPlane, Envelope, Response};
pub use service::{Guard, GuardError};
pub use switch::{BlockingState, BlockingSwitch, InterceptionPipeline, RequestPipeline, StateMismatch};
