use once_cell::sync::Lazy;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Process-wide anchor for monotonic time. `Timestamp` values are offsets
/// from this instant, in microseconds, so they stay comparable across the
/// lifetime of the process without exposing `std::time::Instant` itself.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A monotonic instant, expressed as microseconds since process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(micros: u64) -> Self {
        Self(micros)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Saturating difference `self - other`, clamped to zero rather than
    /// wrapping. Callers that need to detect a clock running backwards use
    /// `checked_sub` instead.
    pub fn saturating_sub(&self, other: Timestamp) -> TimestampDuration {
        TimestampDuration(self.0.saturating_sub(other.0))
    }

    /// `None` if `other` is later than `self` — the "time-warp future" case
    /// callers must treat as fatal rather than silently clamp.
    pub fn checked_sub(&self, other: Timestamp) -> Option<TimestampDuration> {
        self.0.checked_sub(other.0).map(TimestampDuration)
    }

    pub fn checked_add(&self, dur: TimestampDuration) -> Option<Timestamp> {
        self.0.checked_add(dur.0).map(Timestamp)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// A duration between two `Timestamp`s, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimestampDuration(u64);

impl TimestampDuration {
    pub fn new(micros: u64) -> Self {
        Self(micros)
    }
    pub fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000))
    }
    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000))
    }
    pub fn as_u64(&self) -> u64 {
        self.0
    }
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.0)
    }
}

/// The clock collaborator: monotonic time plus a timer facility that
/// delivers a tagged message on expiry rather than invoking a callback, so
/// the owning actor processes timer events in the same serial stream as
/// everything else arriving on its mailbox.
pub trait Clock: Clone + Send + Sync + 'static {
    fn monotonic_time(&self) -> Timestamp;

    /// Arm a one-shot timer. When it fires, `msg` is sent on `tx`; if the
    /// receiver has been dropped the send is silently ignored (the owning
    /// actor is gone, so there is nothing to deliver to).
    fn send_after<M>(&self, delay: TimestampDuration, tx: mpsc::Sender<M>, msg: M) -> TimerRef
    where
        M: Send + 'static;
}

/// A handle to a live one-shot timer. Dropping it does *not* cancel the
/// timer — call `cancel` explicitly, matching the "every RangeEntry.timer_ref
/// is either live or has been explicitly cancelled" invariant.
#[derive(Debug)]
pub struct TimerRef {
    task: JoinHandle<()>,
}

impl TimerRef {
    #[instrument(level = "trace", skip(self))]
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// The real wall-clock implementation of [`Clock`], backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic_time(&self) -> Timestamp {
        Timestamp::new(Instant::now().duration_since(*EPOCH).as_micros() as u64)
    }

    fn send_after<M>(&self, delay: TimestampDuration, tx: mpsc::Sender<M>, msg: M) -> TimerRef
    where
        M: Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay.as_duration()).await;
            let _ = tx.send(msg).await;
        });
        TimerRef { task }
    }
}
