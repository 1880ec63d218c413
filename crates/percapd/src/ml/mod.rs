//! ML-runtime counter subsystem.
//!
//! Each connected ML-runtime session announces a counter directory; a
//! per-session [`tracker::SessionStateTracker`] reconciles that directory
//! with the process-wide set of requested events and forwards matching
//! counter values into the capture stream. The [`driver::MlDriver`] claims
//! `ml:` counters into the [`global::GlobalCounterRegistry`];
//! [`source::MlSource`] is the capture source the forwarded values flow
//! through.

pub mod driver;
pub mod global;
pub mod source;
pub mod tracker;

pub use driver::MlDriver;
pub use global::{GlobalCounterRegistry, GlobalState};
pub use source::{MlSource, SessionHub};
pub use tracker::{CounterConsumer, SessionPacketSender, SessionStateTracker};
