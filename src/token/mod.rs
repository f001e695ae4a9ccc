//! Short unique strings for temp filenames and stream frame markers.

use std::{
    process,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

const TOKEN_LEN: usize = 16;
/// Odd, so multiplying by it permutes `u64`.
const MIX: u64 = 0x9e37_79b9_7f4a_7c15;

/// Hands out strings that never repeat for the same generator.
///
/// An internal counter advances by a per-instance pseudo-random step (always at
/// least one) and each value is scrambled with a bijection keyed by an
/// md5-derived salt, so distinct counter values give distinct strings. Two
/// generators can still produce the same string, so callers that need
/// uniqueness against the filesystem must retry on collision.
#[derive(Debug)]
pub struct TokenGenerator {
    state: Mutex<Counter>,
    salt: u64,
}

#[derive(Debug)]
struct Counter {
    value: u64,
    steps: [u64; 10],
}

impl TokenGenerator {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let marker = 0u8;
        let entropy = format!("{}:{}:{:p}", nanos, process::id(), &marker);
        let seed = md5::compute(entropy.as_bytes()).0;

        let mut head = [0u8; 8];
        head.copy_from_slice(&seed[..8]);
        // Keep the start well below u64::MAX so advancing never wraps.
        let value = u64::from_le_bytes(head) >> 16;

        let mut steps = [1u64; 10];
        for (step, byte) in steps.iter_mut().zip(&seed[6..16]) {
            *step = u64::from(*byte % 10) + 1;
        }

        let mut tail = [0u8; 8];
        tail.copy_from_slice(&md5::compute(seed).0[..8]);
        let salt = u64::from_le_bytes(tail);
        Self { state: Mutex::new(Counter { value, steps }), salt }
    }

    /// Next token: 16 lowercase hex characters.
    pub fn unique_string(&self) -> String {
        let current = {
            let mut counter = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let current = counter.value;
            let step = counter.steps[(current % 10) as usize];
            counter.value = current + step;
            current
        };

        scramble(current, self.salt)
    }
}

fn scramble(value: u64, salt: u64) -> String {
    let mixed = (value ^ salt).wrapping_mul(MIX).rotate_left(29) ^ salt;
    format!("{:0width$x}", mixed, width = TOKEN_LEN)
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}
