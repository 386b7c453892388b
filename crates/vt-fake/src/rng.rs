//! Counter-based random state (ThreeFry-2x32) and a scoped save/restore.

use std::cell::RefCell;
use std::rc::Rc;

const ROTATIONS: [u32; 8] = [13, 15, 26, 6, 17, 29, 16, 24];
const NUM_ROUNDS: usize = 20;
const KS_PARITY: u32 = 0x1BD1_1BDA;

#[must_use]
pub fn threefry2x32(key: [u32; 2], data: [u32; 2]) -> [u32; 2] {
    let schedule = [key[0], key[1], key[0] ^ key[1] ^ KS_PARITY];
    let mut x0 = data[0].wrapping_add(key[0]);
    let mut x1 = data[1].wrapping_add(key[1]);

    for round in 0..NUM_ROUNDS {
        x0 = x0.wrapping_add(x1);
        x1 = x1.rotate_left(ROTATIONS[round % 8]) ^ x0;
        if (round + 1) % 4 == 0 {
            let inject = (round + 1) / 4;
            x0 = x0.wrapping_add(schedule[inject % 3]);
            x1 = x1.wrapping_add(schedule[(inject + 1) % 3].wrapping_add(inject as u32));
        }
    }
    [x0, x1]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngSnapshot {
    key: [u32; 2],
    counter: u64,
}

/// The process random state as seen by traced code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngState {
    key: [u32; 2],
    counter: u64,
}

pub type SharedRng = Rc<RefCell<RngState>>;

impl RngState {
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            key: [(seed >> 32) as u32, seed as u32],
            counter: 0,
        }
    }

    #[must_use]
    pub fn shared(seed: u64) -> SharedRng {
        Rc::new(RefCell::new(Self::from_seed(seed)))
    }

    pub fn manual_seed(&mut self, seed: u64) {
        *self = Self::from_seed(seed);
    }

    /// Draws a fresh non-negative seed and reseeds with it.
    pub fn reseed(&mut self) -> i64 {
        let seed = self.next_u64() & (i64::MAX as u64);
        self.manual_seed(seed);
        seed as i64
    }

    pub fn next_u64(&mut self) -> u64 {
        let [hi, lo] = threefry2x32(self.key, [(self.counter >> 32) as u32, self.counter as u32]);
        self.counter = self.counter.wrapping_add(1);
        (u64::from(hi) << 32) | u64::from(lo)
    }

    /// Advances the counter as if `draws` values had been generated.
    pub fn skip(&mut self, draws: u64) {
        self.counter = self.counter.wrapping_add(draws);
    }

    #[must_use]
    pub fn snapshot(&self) -> RngSnapshot {
        RngSnapshot {
            key: self.key,
            counter: self.counter,
        }
    }

    pub fn restore(&mut self, snapshot: RngSnapshot) {
        self.key = snapshot.key;
        self.counter = snapshot.counter;
    }
}

impl Default for RngState {
    fn default() -> Self {
        Self::from_seed(0)
    }
}

/// Restores the saved state when dropped, including during unwinding.
#[derive(Debug)]
pub struct PreservedRng {
    rng: SharedRng,
    saved: RngSnapshot,
}

impl PreservedRng {
    #[must_use]
    pub fn new(rng: &SharedRng) -> Self {
        let saved = rng.borrow().snapshot();
        Self {
            rng: Rc::clone(rng),
            saved,
        }
    }
}

impl Drop for PreservedRng {
    fn drop(&mut self) {
        if let Ok(mut rng) = self.rng.try_borrow_mut() {
            rng.restore(self.saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PreservedRng, RngState, threefry2x32};

    #[test]
    fn threefry_is_deterministic_and_key_sensitive() {
        assert_eq!(threefry2x32([1, 2], [3, 4]), threefry2x32([1, 2], [3, 4]));
        assert_ne!(threefry2x32([0, 0], [0, 0]), threefry2x32([0, 1], [0, 0]));
        assert_ne!(threefry2x32([0, 0], [0, 0]), [0, 0]);
    }

    #[test]
    fn seeding_resets_the_stream() {
        let mut a = RngState::from_seed(42);
        let first = a.next_u64();
        a.manual_seed(42);
        assert_eq!(a.next_u64(), first);
    }

    #[test]
    fn preserved_rng_restores_on_scope_exit() {
        let rng = RngState::shared(7);
        let before = rng.borrow().snapshot();
        {
            let _guard = PreservedRng::new(&rng);
            rng.borrow_mut().next_u64();
            rng.borrow_mut().manual_seed(99);
        }
        assert_eq!(rng.borrow().snapshot(), before);
    }

    #[test]
    fn preserved_rng_restores_on_early_return() {
        fn consume(rng: &super::SharedRng) -> Result<(), String> {
            let _guard = PreservedRng::new(rng);
            rng.borrow_mut().skip(10);
            Err("abort".to_owned())
        }

        let rng = RngState::shared(3);
        let before = rng.borrow().snapshot();
        assert!(consume(&rng).is_err());
        assert_eq!(rng.borrow().snapshot(), before);
    }
}
