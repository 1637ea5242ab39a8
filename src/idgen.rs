// Copyright (c) 2025 - Cowboy AI, LLC.

//! Unique 64-bit id generator
//!
//! Ids are `((now_epoch_s − EPOCH) << 24) | (shard_id << 16) | counter`,
//! with the epoch fixed at 2010-01-01T00:00:00Z and a 16-bit counter that
//! wraps per second. Within one shard the sequence is strictly increasing;
//! different shards can never collide by construction. Used for
//! certificate row ids and CRL numbers.

use chrono::Utc;
use std::sync::Mutex;
use std::time::Duration;

use crate::{CaError, Result};

/// Generator epoch: 2010-01-01T00:00:00Z as unix seconds
const EPOCH_2010_01_01: i64 = 1_262_304_000;

/// Tolerated wall-clock regression before failing
const CLOCK_TOLERANCE_SECS: i64 = 2;

#[derive(Debug)]
struct GenState {
    last_second: i64,
    counter: u16,
    exhausted: bool,
}

/// Monotonic 64-bit id generator parameterised by shard id
#[derive(Debug)]
pub struct UniqueIdGenerator {
    shard_id: u8,
    state: Mutex<GenState>,
}

impl UniqueIdGenerator {
    /// Create a generator for `shard_id`
    pub fn new(shard_id: u8) -> Self {
        Self {
            shard_id,
            state: Mutex::new(GenState {
                last_second: 0,
                counter: 0,
                exhausted: false,
            }),
        }
    }

    /// Shard id baked into every generated value
    pub fn shard_id(&self) -> u8 {
        self.shard_id
    }

    /// Produce the next id
    ///
    /// Blocks into the next wall-clock second when the 16-bit counter is
    /// exhausted within one second. Fails with `ClockRegression` when the
    /// wall clock moves backwards beyond a small tolerance.
    pub fn next_id(&self) -> Result<i64> {
        loop {
            let now = Utc::now().timestamp();
            let mut state = self.state.lock().unwrap();

            if now < state.last_second {
                let regression = state.last_second - now;
                if regression > CLOCK_TOLERANCE_SECS {
                    return Err(CaError::ClockRegression {
                        regression_secs: regression,
                    });
                }
                // Within tolerance: stick to the highest second seen so
                // monotonicity survives small NTP steps.
            }

            let second = now.max(state.last_second);
            if second != state.last_second {
                state.last_second = second;
                state.counter = 0;
                state.exhausted = false;
            } else if state.exhausted {
                drop(state);
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }

            let counter = state.counter;
            if counter == u16::MAX {
                state.exhausted = true;
            } else {
                state.counter += 1;
            }

            let elapsed = second - EPOCH_2010_01_01;
            let id = (elapsed << 24) | ((self.shard_id as i64) << 16) | counter as i64;
            return Ok(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_strictly_increasing_within_a_shard() {
        let generator = UniqueIdGenerator::new(1);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.next_id().unwrap();
            assert!(id > last, "id {} not greater than {}", id, last);
            last = id;
        }
    }

    #[test]
    fn ids_never_repeat() {
        let generator = UniqueIdGenerator::new(3);
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(generator.next_id().unwrap()));
        }
    }

    #[test]
    fn shard_id_is_encoded_in_bits_16_to_23() {
        let generator = UniqueIdGenerator::new(0x2A);
        let id = generator.next_id().unwrap();
        assert_eq!((id >> 16) & 0xFF, 0x2A);
    }

    #[test]
    fn different_shards_cannot_collide() {
        let a = UniqueIdGenerator::new(1);
        let b = UniqueIdGenerator::new(2);
        for _ in 0..1_000 {
            assert_ne!(a.next_id().unwrap(), b.next_id().unwrap());
        }
    }
}
