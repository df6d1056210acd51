use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::numerics::MOST_POSITIVE_EXACT_FLOAT;

/// Largest id handed out before wrapping back to 1. Ids must survive a
/// round trip through an `f64` on hosts without 64-bit integers.
const MAX_ID: u64 = (MOST_POSITIVE_EXACT_FLOAT - 1) as u64;

/// Shared monotonic id source for instance ids, call ids and gensyms.
#[derive(Clone, Debug)]
pub struct Counter {
    next: Arc<AtomicU64>,
}

impl Default for Counter {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl Counter {
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn next(&self) -> u64 {
        let mut id = self.next.load(Ordering::SeqCst);
        loop {
            let following = if id >= MAX_ID { 1 } else { id + 1 };
            match self
                .next
                .compare_exchange(id, following, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return id,
                Err(current) => id = current,
            }
        }
    }
}
