//! Error taxonomy for the routing-metadata and net-correlator subsystems.
//! Transient network/timeout conditions and protocol-invariant violations
//! are kept in separate enums because they propagate differently: the
//! former is returned to a single caller, the latter is fatal to the
//! owning actor's task.

use crate::types::{Endpoint, Tag};
use thiserror::Error;

/// Errors returned by `routing_meta` operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// `insert(n)` succeeded against the table but the table immediately
    /// evicted it again (full and not splittable).
    #[error("routing table refused peer")]
    NotInserted,

    /// `range_state` (or another range-keyed operation) was called with a
    /// range the table no longer reports.
    #[error("not a current table range")]
    NotMember,

    /// `replace`/`remove` precondition failure: `liveness(old) != bad`.
    #[error("precondition violated: node is not bad")]
    PreconditionNotBad,

    /// `replace` precondition failure: the replacement is already a member.
    #[error("precondition violated: replacement already a member")]
    PreconditionAlreadyMember,
}

/// Errors surfaced by the net correlator's public RPCs. Matches spec's
/// taxonomy: `timeout`, `send_failure`, `tag_exhausted` are surfaced to
/// callers; `decode_failure` and `unsolicited` never reach a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("request timed out")]
    Timeout,

    #[error("send failed: {0}")]
    SendFailure(String),

    #[error("no free tag for endpoint {0}")]
    TagExhausted(Endpoint),

    #[error("peer returned error {code}: {message}")]
    Remote { code: i32, message: String },
}

/// A fatal protocol-invariant violation. Unlike [`RoutingError`] and
/// [`NetError`], this is never returned to a caller — the actor observing
/// it panics its own task, per the "time warp / message-to-ourselves are
/// FATAL" propagation policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("monotonic clock ran backwards past a recorded last_activity")]
    TimeWarpFuture,

    #[error("waiter for tag {0} matched a query, not a response/error")]
    MessageToOurselves(Tag),
}

/// Errors from the wire codec.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message codec failure: {0}")]
    Codec(#[from] bincode::Error),
}
