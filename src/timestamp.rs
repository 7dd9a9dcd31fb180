//! Process-global monotonic timestamp counter.
//!
//! One tick per mutation event. Objects stamp four of these (parameter
//! changed, updated, committed, finalized); comparing them is how the
//! commit/finalize pipeline decides what is dirty.

use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub type TimeStamp = u64;

/// Advance and return the new global timestamp.
pub fn new_timestamp() -> TimeStamp {
    COUNTER.fetch_add(1, Ordering::AcqRel) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing() {
        let a = new_timestamp();
        let b = new_timestamp();
        assert!(b > a);
    }
}
