//! Nop labels used for template addressing

use std::fmt;

use crate::inst_lib::NUM_NOPS;

/// Hard cap on the number of nops a label can hold.
pub const MAX_LABEL_SIZE: usize = 10;

/// A run of nop modifiers read from the genome.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Label {
    nops: Vec<u8>,
}

impl Label {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn from_nops(nops: &[u8]) -> Self {
        Self { nops: nops.iter().copied().take(MAX_LABEL_SIZE).collect() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nops.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize) -> u8 {
        self.nops[i]
    }

    pub fn clear(&mut self) {
        self.nops.clear();
    }

    /// Append a nop; silently ignored once the label is full.
    pub fn add_nop(&mut self, nop: usize) {
        debug_assert!(nop < NUM_NOPS);
        if self.nops.len() < MAX_LABEL_SIZE {
            self.nops.push(nop as u8);
        }
    }

    /// Shift every nop by `rot` modulo `base`. `rotate(1, 3)` is the complement.
    pub fn rotate(&mut self, rot: usize, base: usize) {
        for n in self.nops.iter_mut() {
            *n = ((*n as usize + rot) % base) as u8;
        }
    }

    /// Read the label as a number in the given base, first nop most significant.
    pub fn as_int(&self, base: usize) -> i32 {
        self.nops
            .iter()
            .fold(0i32, |acc, &n| acc.wrapping_mul(base as i32).wrapping_add(n as i32))
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({})", self)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &n in &self.nops {
            write!(f, "{}", (b'A' + n) as char)?;
        }
        Ok(())
    }
}
