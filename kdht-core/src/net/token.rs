//! The rotating announce token queue: at most `N` recent random 32-bit
//! secrets, oldest at the head, newest at the tail. `find_value` issues
//! tokens from the tail; `store` accepts a token matching any secret
//! currently in the queue.

use kdht_tools::Rng;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct TokenQueue {
    secrets: VecDeque<u32>,
    capacity: usize,
}

impl TokenQueue {
    pub fn new(capacity: usize, rng: &impl Rng) -> Self {
        let mut secrets = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            secrets.push_back(rng.next_u32());
        }
        Self { secrets, capacity }
    }

    /// The newest secret, used to issue fresh tokens.
    pub fn newest(&self) -> u32 {
        *self.secrets.back().expect("capacity is always >= 1")
    }

    /// A snapshot of all currently-valid secrets, to be checked against an
    /// inbound `store` token. Taken by value so a spawned query-handling
    /// sub-task never races the rotation timer.
    pub fn snapshot(&self) -> Vec<u32> {
        self.secrets.iter().copied().collect()
    }

    /// Drop the oldest secret, append a fresh random one.
    pub fn rotate(&mut self, rng: &impl Rng) {
        if self.secrets.len() >= self.capacity {
            self.secrets.pop_front();
        }
        self.secrets.push_back(rng.next_u32());
    }
}
