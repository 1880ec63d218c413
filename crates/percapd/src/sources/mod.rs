//! Concrete capture sources.
//!
//! - `primary` - `/proc/stat` CPU counters; its hot loop drives the session
//! - `external` - byte stream from the tracefs pipe
//! - `gpu` - devfreq-backed GPU counters
//! - `userspace` - periodically polled drivers

pub mod external;
pub mod gpu;
pub mod primary;
pub mod userspace;
