//! Sliding replay window for explicit-nonce channels.
//!
//! Tracks the highest accepted nonce and a bitmap of the nonces accepted
//! just below it. A nonce is fresh if it is ahead of the window, or inside
//! the window and not yet marked. Anything that has fallen behind the window
//! is treated as a replay.
//!
//! Not thread-safe; the owning [`CipherState`](crate::cipher::CipherState)
//! is serialized by its channel.

/// Sliding window over 64-bit nonces.
#[derive(Debug, Clone)]
pub struct SequenceWindow {
    /// Highest nonce accepted so far
    highest: u64,
    /// Bit 0 = highest, bit 1 = highest-1, etc.
    bitmap: u128,
    /// Number of nonces tracked below (and including) `highest`
    size: u64,
    /// Nothing accepted yet
    empty: bool,
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceWindow {
    /// Largest window the bitmap can represent.
    pub const MAX_SIZE: u64 = 128;

    /// Default window size
    pub const DEFAULT_SIZE: u64 = 64;

    pub fn new() -> Self {
        Self::with_size(Self::DEFAULT_SIZE)
    }

    /// Create a window tracking `size` nonces, clamped to 1..=128.
    pub fn with_size(size: u64) -> Self {
        Self {
            highest: 0,
            bitmap: 0,
            size: size.clamp(1, Self::MAX_SIZE),
            empty: true,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether `nonce` would be accepted. Does not update state.
    pub fn check(&self, nonce: u64) -> bool {
        if self.empty || nonce > self.highest {
            return true;
        }

        // Fell behind the window
        if nonce.saturating_add(self.size) <= self.highest {
            return false;
        }

        let offset = self.highest - nonce;
        self.bitmap & (1u128 << offset) == 0
    }

    /// Accept `nonce` if fresh and mark it as seen. Returns false on replay.
    pub fn check_and_update(&mut self, nonce: u64) -> bool {
        if !self.check(nonce) {
            return false;
        }

        if self.empty {
            self.highest = nonce;
            self.bitmap = 1;
            self.empty = false;
            return true;
        }

        if nonce > self.highest {
            let shift = nonce - self.highest;
            self.bitmap = if shift >= 128 { 1 } else { (self.bitmap << shift) | 1 };
            self.highest = nonce;
            return true;
        }

        self.bitmap |= 1u128 << (self.highest - nonce);
        true
    }

    /// Highest nonce accepted so far (0 if none).
    pub fn highest(&self) -> u64 {
        self.highest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_from_zero() {
        let mut window = SequenceWindow::new();
        for i in 0..=100 {
            assert!(window.check_and_update(i), "nonce {} should be fresh", i);
        }
        assert_eq!(window.highest(), 100);
    }

    #[test]
    fn test_replay_detection() {
        let mut window = SequenceWindow::new();
        assert!(window.check_and_update(0));
        assert!(window.check_and_update(1));

        assert!(!window.check_and_update(0));
        assert!(!window.check_and_update(1));
    }

    #[test]
    fn test_out_of_order() {
        let mut window = SequenceWindow::new();

        for n in [5, 3, 4, 0, 1, 2] {
            assert!(window.check_and_update(n));
        }
        for n in 0..=5 {
            assert!(!window.check_and_update(n));
        }
    }

    #[test]
    fn test_window_slides() {
        let mut window = SequenceWindow::with_size(10);
        for i in 0..10 {
            assert!(window.check_and_update(i));
        }

        // 0 is the oldest tracked slot; it is still marked
        assert!(!window.check(0));

        assert!(window.check_and_update(12));
        // 2 is now behind the window
        assert!(!window.check(2));
        assert!(window.check(11));
    }

    #[test]
    fn test_large_jump_resets_bitmap() {
        let mut window = SequenceWindow::with_size(128);
        assert!(window.check_and_update(1));
        assert!(window.check_and_update(1000));
        assert!(!window.check_and_update(1));
        assert!(window.check_and_update(999));
    }

    #[test]
    fn test_size_is_clamped() {
        assert_eq!(SequenceWindow::with_size(0).size(), 1);
        assert_eq!(SequenceWindow::with_size(4096).size(), 128);
    }

    #[test]
    fn test_check_without_update() {
        let mut window = SequenceWindow::new();
        assert!(window.check_and_update(1));

        assert!(window.check(2));
        assert!(window.check(2));
        assert!(window.check_and_update(2));
        assert!(!window.check(2));
    }
}
