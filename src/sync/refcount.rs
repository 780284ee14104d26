use std::sync::atomic::{AtomicU32, Ordering};

/// A reference counter whose lookups only succeed while the count is nonzero.
///
/// A fresh counter holds one reference, owned by whoever created the object.
#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Takes a reference unless the count already dropped to zero.
    pub fn inc_if_nonzero(&self) -> bool {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            let next = cur.checked_add(1).expect("reference count overflow");
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drops a reference, returning `true` for the last one.
    ///
    /// # Panics
    /// Panics if the count is already zero.
    pub fn dec_and_test(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::Release);
        assert!(prev != 0, "reference count underflow");
        if prev == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}
