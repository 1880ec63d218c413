//! Percapd - Capture child of the percap profiling daemon
//!
//! This crate implements the capture process that runs for the duration of
//! one profiling session. It brings a heterogeneous set of data sources up
//! in a fixed order, multiplexes their output through a single sender to
//! either a live client socket or a local capture directory, and fans a
//! single "stop" decision out to every source under any of several
//! concurrent termination triggers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     CaptureSession                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  signals ──┐                                                 │
//! │  duration ─┤  wake   ┌───────────┐   do_end_session          │
//! │  pid watch ├────────▶│ stop task │──────────┐                │
//! │  command ──┘         └─────┬─────┘          ▼                │
//! │              STOP / PING   │          interrupt all sources  │
//! │  client ───────────────────┘                                 │
//! │                                                              │
//! │  ┌─────────┐ ┌─────────┐ ┌────────┐ ┌─────────┐ ┌────────┐  │
//! │  │ primary │ │ ftrace  │ │  gpu   │ │ polled  │ │   ml   │  │
//! │  └────┬────┘ └────┬────┘ └───┬────┘ └────┬────┘ └───┬────┘  │
//! │       └───────────┴──────────┴───────────┴──────────┘       │
//! │                     drain task ──▶ Sender ──▶ socket / file │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Exactly one [`capture::CaptureSession`] may exist per process; a second
//! concurrent session is a programming error and asserts.

pub mod capture;
pub mod command;
pub mod control;
pub mod drain;
pub mod drivers;
pub mod error;
pub mod fatal;
pub mod local;
pub mod ml;
pub mod proc;
pub mod sender;
pub mod setup;
pub mod signals;
pub mod source;
pub mod sources;
