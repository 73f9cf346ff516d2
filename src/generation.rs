use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, PartialEq, Eq)]
pub enum ApplyDecision {
    Apply,
    DropSuperseded { committed: u64 },
}

/// Per-key generation counter for in-flight queries.
///
/// Every fetch takes a generation from `issue`. A response may commit only if
/// no later generation has committed before it.
#[derive(Debug, Default)]
pub struct GenerationGuard {
    issued: AtomicU64,
    committed: AtomicU64,
}

impl GenerationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn classify(&self, generation: u64) -> ApplyDecision {
        loop {
            let last = self.committed.load(Ordering::SeqCst);

            if generation <= last {
                return ApplyDecision::DropSuperseded { committed: last };
            }

            match self.committed.compare_exchange(
                last,
                generation,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return ApplyDecision::Apply,
                Err(_) => continue,
            }
        }
    }

    pub fn latest_issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }
}
