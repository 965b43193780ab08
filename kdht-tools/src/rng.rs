//! Injectable randomness, the same seam shape `Clock` gives monotonic time:
//! production code runs on [`SystemRng`], while a test can substitute a
//! scripted sequence to exercise a low-probability path (like a run of tag
//! collisions) deterministically instead of hoping a real RNG reproduces it.

pub trait Rng: Clone + Send + Sync + 'static {
    /// A fresh, uniformly random 16-bit value — used for transaction tags.
    fn next_u16(&self) -> u16;
    /// A fresh, uniformly random 32-bit value — used for token secrets.
    fn next_u32(&self) -> u32;
    /// Index of a uniformly chosen element among `len` candidates, or
    /// `None` if `len == 0`.
    fn choose_index(&self, len: usize) -> Option<usize>;
}

/// The real implementation, backed by the `rand` crate's thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRng;

impl Rng for SystemRng {
    fn next_u16(&self) -> u16 {
        rand::random()
    }

    fn next_u32(&self) -> u32 {
        rand::random()
    }

    fn choose_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            None
        } else {
            Some(rand::Rng::gen_range(&mut rand::thread_rng(), 0..len))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_rng_choose_index_is_in_bounds_and_none_when_empty() {
        let rng = SystemRng;
        for _ in 0..50 {
            assert!(rng.choose_index(5).unwrap() < 5);
        }
        assert_eq!(rng.choose_index(0), None);
    }
}
