//! Experiment orchestration and promotion pipeline for trading strategies.
//!
//! A candidate moves through a fixed stage order:
//!
//! ```text
//! Ideate ─► Sanitize ─► Backtest ─► Score ─► Select ─► Deploy ─► Monitor
//!   ▲                      ▲                            (gated)     │
//!   └──────── kill ────────┴──────── degradation ◄──────────────────┘
//! ```
//!
//! The [`ledger`] records every experiment and invocation in SQLite, the
//! [`artifact`] store keeps immutable content-addressed payloads, the
//! [`scheduler`] turns satisfied predecessors into dispatched work, the
//! [`gate`] holds promotion-sensitive invocations for sign-off, and the
//! [`feedback`] router turns monitor findings into corrective invocations.
//! The [`orchestrator`] owns the control loop and crash recovery.

pub mod artifact;
pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod gate;
pub mod journal;
pub mod ledger;
pub mod logging;
pub mod manifest;
pub mod model;
pub mod orchestrator;
pub mod scheduler;
pub mod stage;

pub use error::{PipelineError, Result};
