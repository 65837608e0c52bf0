use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

pub trait IdGenerator: Send + Sync {
    fn gen_id(&self) -> i64;

    fn gen_ids(&self, count: usize) -> Vec<i64> {
        (0..count).map(|_| self.gen_id()).collect()
    }
}

const SEQUENCE_BITS: u32 = 12;

/// Millisecond timestamp shifted left with a per-process sequence in the low bits.
/// Ids are strictly increasing even when the clock stalls or steps back.
#[derive(Debug, Default)]
pub struct SnowflakeIdGenerator {
    last: AtomicI64,
}

impl SnowflakeIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SnowflakeIdGenerator {
    fn gen_id(&self) -> i64 {
        let floor = Utc::now().timestamp_millis() << SEQUENCE_BITS;
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = floor.max(current + 1);
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}
