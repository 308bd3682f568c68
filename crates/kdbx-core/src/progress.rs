//! Progress reporting and cooperative cancellation
//!
//! Long operations report coarse steps to a [`Progress`] observer. Returning
//! [`ControlFlow::Break`] from the observer aborts the operation with
//! [`Error::Cancelled`] at the next step boundary.

use crate::error::{Error, Result};
use std::ops::ControlFlow;

/// Pipeline stage reached during open or save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReadHeader,
    DeriveKey,
    Decrypt,
    Decompress,
    ParseDocument,
    SerializeDocument,
    Compress,
    Encrypt,
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Stage(Stage),
    /// KDF work done so far, in algorithm-specific units
    Kdf { completed: u64, total: u64 },
    /// An authenticated block passed verification
    BlockVerified { index: u64 },
}

pub trait Progress {
    fn report(&self, event: ProgressEvent) -> ControlFlow<()>;
}

impl<F> Progress for F
where
    F: Fn(ProgressEvent) -> ControlFlow<()>,
{
    fn report(&self, event: ProgressEvent) -> ControlFlow<()> {
        self(event)
    }
}

/// Observer that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&self, _event: ProgressEvent) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Report `event`, turning a break request into [`Error::Cancelled`]
pub(crate) fn checkpoint(progress: &dyn Progress, event: ProgressEvent) -> Result<()> {
    match progress.report(event) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => {
            tracing::debug!("Cancelled at {:?}", event);
            Err(Error::Cancelled)
        }
    }
}
