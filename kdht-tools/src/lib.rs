//! Baseline tools shared by the `kdht` crates: a monotonic clock/timer
//! facility and injectable randomness. Neither module knows anything about
//! DHTs or RPCs; they exist so `kdht-core` never needs to reach into the
//! standard library's raw `Instant`/`SystemTime` or call `rand` ambiently
//! where a test needs to control the sequence.

mod clock;
mod rng;

pub use clock::*;
pub use rng::*;
