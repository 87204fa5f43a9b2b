//! Error types surfaced by the scheduling group.

use thiserror::Error;

use crate::cancel::CancelReason;

/// Errors returned by [`Group::wait`](crate::Group::wait).
///
/// Task bodies are opaque to the group: a body that fails must report
/// out-of-band, it never surfaces here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GroupError {
    /// The cancel token passed to the group fired before every scheduled
    /// task completed.
    #[error("scheduling group cancelled: {0}")]
    Cancelled(CancelReason),
}
