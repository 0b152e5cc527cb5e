use rand::{rngs::StdRng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

/// Guest time is a function of retired instructions, so replays observe the
/// same clock.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
pub struct VirtualClock {
    base_ns: u64,
    ns_per_insn: u64,
    /// time skipped forward while every thread slept.
    skipped_ns: u64,
    /// retired guest instructions.
    pub icount: u64,
}

impl VirtualClock {
    pub fn new(base_secs: u64) -> Self {
        Self {
            base_ns: base_secs.saturating_mul(1_000_000_000),
            ns_per_insn: 10,
            skipped_ns: 0,
            icount: 0,
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.base_ns
            .saturating_add(self.icount.saturating_mul(self.ns_per_insn))
            .saturating_add(self.skipped_ns)
    }

    /// Time since the guest started.
    pub fn uptime_ns(&self) -> u64 {
        self.now_ns() - self.base_ns
    }

    pub fn advance_to(&mut self, ns: u64) {
        let now = self.now_ns();
        if ns > now {
            self.skipped_ns = self.skipped_ns.saturating_add(ns - now);
        }
    }
}

/// Seeded random bytes; each request draws from a fresh stream so the
/// sequence only depends on the seed and the request index.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeterministicRng {
    seed: u64,
    counter: u64,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        Self { seed, counter: 0 }
    }

    pub fn fill(&mut self, len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(self.seed ^ self.counter.rotate_left(32));
        self.counter += 1;
        let mut out = vec![0u8; len];
        rng.fill_bytes(&mut out);
        out
    }
}
