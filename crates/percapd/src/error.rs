//! Errors raised by the capture session.
//!
//! Setup-fatal errors propagate with `?` to the single fatal funnel in the
//! binary; everything else is handled where it occurs.

use thiserror::Error;

use crate::sender::SenderError;
use crate::source::SourceError;

/// Errors that end the capture session.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The driver registry produced no primary source.
    #[error("Failed to init primary capture source")]
    PrimaryInit,

    /// The primary source failed to prepare.
    #[error("Failed to prepare primary capture source")]
    PrimaryPrepare(#[source] SourceError),

    /// A secondary source failed to prepare.
    #[error("Unable to prepare {name} source for capture")]
    SourcePrepare {
        name: &'static str,
        #[source]
        source: SourceError,
    },

    /// The sender could not write to its sink.
    #[error(transparent)]
    Sender(#[from] SenderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
