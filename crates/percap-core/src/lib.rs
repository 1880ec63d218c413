//! Percap Core - Shared types for the percap capture daemon
//!
//! This crate provides the domain types shared between the capture
//! daemon (percapd) and the wire protocol crate:
//! - `config` - Session configuration and client-supplied settings
//! - `counter` - Counter and SPE configuration records
//! - `event` - ML-runtime event model (counter directories, event ids)
//! - `error` - Domain error types
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, or direct indexing in production paths.

pub mod config;
pub mod counter;
pub mod error;
pub mod event;

// Re-exports for convenience
pub use config::{SessionConfig, SessionSettings};
pub use counter::{CapturedSpe, CounterConfig, SpeConfig};
pub use error::{DomainError, DomainResult};
pub use event::{
    ApcCounterKey, CategoryRecord, CounterCaptureMode, CounterClass, CounterInterpolation,
    CounterSetRecord, DeviceRecord, EventId, EventProperties, EventRecord, KeyAndCore,
};
