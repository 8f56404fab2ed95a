//! CPU heads
//!
//! A head is a position plus the id of the memory space it points into. It
//! never holds a reference to that memory; every movement is given the size
//! of the addressed space so the head can wrap itself.

/// Identifier of an addressable memory space.
///
/// The classic CPU only has space 0. The gene-expression hardware uses the
/// stable id of each programid, so ids are never renumbered.
pub type SpaceId = u32;

/// Head indices shared by every hardware type.
pub const HEAD_IP: usize = 0;
pub const HEAD_READ: usize = 1;
pub const HEAD_WRITE: usize = 2;
pub const HEAD_FLOW: usize = 3;
pub const NUM_HEADS: usize = 4;

/// Short name used in trace lines.
pub fn head_name(head: usize) -> &'static str {
    match head {
        HEAD_IP => "IP",
        HEAD_READ => "R",
        HEAD_WRITE => "W",
        HEAD_FLOW => "F",
        _ => "?",
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Head {
    pub pos: i32,
    pub space: SpaceId,
}

impl Head {
    pub fn new(space: SpaceId) -> Self {
        Self { pos: 0, space }
    }

    pub fn at(pos: i32, space: SpaceId) -> Self {
        Self { pos, space }
    }

    /// Bring the position back into `[0, size)`.
    ///
    /// Negative positions clamp to the front; positions past the end wrap.
    /// An empty memory parks the head at 0.
    #[inline]
    pub fn adjust(&mut self, size: usize) {
        let size = size as i32;
        if self.pos >= 0 && self.pos < size {
            return;
        }
        if size == 0 || self.pos < 0 {
            self.pos = 0;
        } else {
            self.pos %= size;
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.pos.max(0) as usize
    }

    #[inline]
    pub fn advance(&mut self, size: usize) {
        self.pos += 1;
        self.adjust(size);
    }

    #[inline]
    pub fn jump(&mut self, offset: i32, size: usize) {
        self.pos = self.pos.wrapping_add(offset);
        self.adjust(size);
    }

    #[inline]
    pub fn set(&mut self, pos: i32, size: usize) {
        self.pos = pos;
        self.adjust(size);
    }

    /// Position of the next instruction in a memory of `size`.
    #[inline]
    pub fn next_index(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        (self.index() + 1) % size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_wraps_forward() {
        let mut h = Head::new(0);
        h.set(12, 10);
        assert_eq!(h.pos, 2);
        h.advance(3);
        assert_eq!(h.pos, 0);
    }

    #[test]
    fn test_adjust_clamps_negative() {
        let mut h = Head::new(0);
        h.jump(-1, 10);
        assert_eq!(h.pos, 0);
        h.jump(-4, 10);
        assert_eq!(h.pos, 0);
    }

    #[test]
    fn test_empty_memory() {
        let mut h = Head::at(5, 2);
        h.adjust(0);
        assert_eq!(h.pos, 0);
        assert_eq!(h.space, 2);
    }

    #[test]
    fn test_next_index() {
        let h = Head::at(9, 0);
        assert_eq!(h.next_index(10), 0);
        assert_eq!(Head::at(3, 0).next_index(0), 0);
    }

    #[test]
    fn test_head_names() {
        assert_eq!(head_name(HEAD_IP), "IP");
        assert_eq!(head_name(HEAD_FLOW), "F");
        assert_eq!(head_name(NUM_HEADS), "?");
    }
}
