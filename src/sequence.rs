//! Instruction sequences
//!
//! A [`Sequence`] is both a genome (flags unused) and a CPU memory (flags
//! track which positions were executed, copied or mutated). Positions are
//! plain indices; circular wraparound is the job of the heads.

use std::fmt;

use crate::error::GenomeError;

/// One instruction: an opcode into the paired instruction set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Instruction(pub u8);

impl Instruction {
    #[inline]
    pub fn op(self) -> usize {
        self.0 as usize
    }

    /// Alphabet symbol for this opcode.
    pub fn symbol(self) -> char {
        match self.0 {
            0..=25 => (b'a' + self.0) as char,
            26..=51 => (b'A' + self.0 - 26) as char,
            52..=60 => (b'1' + self.0 - 52) as char,
            61 => '0',
            _ => '*',
        }
    }

    /// Inverse of [`Instruction::symbol`].
    pub fn from_symbol(c: char) -> Result<Self, GenomeError> {
        let op = match c {
            'a'..='z' => c as u8 - b'a',
            'A'..='Z' => c as u8 - b'A' + 26,
            '1'..='9' => c as u8 - b'1' + 52,
            '0' => 61,
            _ => return Err(GenomeError::BadSymbol(c)),
        };
        Ok(Instruction(op))
    }
}

/// Per-position bookkeeping flags of a CPU memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstFlags {
    pub executed: bool,
    pub mutated: bool,
    pub copied: bool,
    /// Set when the copied instruction was replaced by a copy mutation
    pub copy_mut: bool,
}

/// Resizable instruction sequence with parallel flags.
#[derive(Clone, Default)]
pub struct Sequence {
    insts: Vec<Instruction>,
    flags: Vec<InstFlags>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// `len` copies of `fill`.
    pub fn filled(len: usize, fill: Instruction) -> Self {
        Self { insts: vec![fill; len], flags: vec![InstFlags::default(); len] }
    }

    pub fn from_insts(insts: Vec<Instruction>) -> Self {
        let flags = vec![InstFlags::default(); insts.len()];
        Self { insts, flags }
    }

    /// Decode an alphabet string (see [`Instruction::symbol`]).
    pub fn from_symbols(text: &str) -> Result<Self, GenomeError> {
        let insts = text
            .trim()
            .chars()
            .map(Instruction::from_symbol)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_insts(insts))
    }

    /// Encode as an alphabet string, one symbol per instruction.
    pub fn as_string(&self) -> String {
        self.insts.iter().map(|i| i.symbol()).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    #[inline]
    pub fn get(&self, pos: usize) -> Instruction {
        self.insts[pos]
    }

    /// Overwrite one position; flags are left untouched.
    #[inline]
    pub fn set(&mut self, pos: usize, inst: Instruction) {
        self.insts[pos] = inst;
    }

    #[inline]
    pub fn flags(&self, pos: usize) -> InstFlags {
        self.flags[pos]
    }

    #[inline]
    pub fn flags_mut(&mut self, pos: usize) -> &mut InstFlags {
        &mut self.flags[pos]
    }

    pub fn insts(&self) -> &[Instruction] {
        &self.insts
    }

    pub fn iter(&self) -> impl Iterator<Item = Instruction> + '_ {
        self.insts.iter().copied()
    }

    /// Grow or shrink. New positions are filled with `fill` and clean flags.
    pub fn resize(&mut self, new_len: usize, fill: Instruction) {
        self.insts.resize(new_len, fill);
        self.flags.resize(new_len, InstFlags::default());
    }

    /// Insert before `pos` (`pos == len` appends).
    pub fn insert(&mut self, pos: usize, inst: Instruction) {
        self.insts.insert(pos, inst);
        self.flags.insert(pos, InstFlags::default());
    }

    pub fn remove(&mut self, pos: usize) -> Instruction {
        self.flags.remove(pos);
        self.insts.remove(pos)
    }

    pub fn push(&mut self, inst: Instruction) {
        self.insts.push(inst);
        self.flags.push(InstFlags::default());
    }

    pub fn append(&mut self, other: &Sequence) {
        self.insts.extend_from_slice(&other.insts);
        self.flags.extend(std::iter::repeat(InstFlags::default()).take(other.len()));
    }

    /// The half-open range `[begin, end)` as a new sequence with clean flags.
    pub fn crop(&self, begin: usize, end: usize) -> Sequence {
        Sequence::from_insts(self.insts[begin..end].to_vec())
    }

    /// First position at or after `from` holding `inst`.
    pub fn find_inst(&self, inst: Instruction, from: usize) -> Option<usize> {
        self.insts.iter().skip(from).position(|&i| i == inst).map(|p| p + from)
    }

    pub fn count_executed(&self, upto: usize) -> usize {
        self.flags.iter().take(upto).filter(|f| f.executed).count()
    }
}

impl PartialEq for Sequence {
    /// Sequences compare by instructions only.
    fn eq(&self, other: &Self) -> bool {
        self.insts == other.insts
    }
}

impl Eq for Sequence {}

impl std::hash::Hash for Sequence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.insts.hash(state);
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence({})", self.as_string())
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<Vec<Instruction>> for Sequence {
    fn from(insts: Vec<Instruction>) -> Self {
        Sequence::from_insts(insts)
    }
}

/// Classic dynamic-programming edit distance over any comparable items.
fn edit_distance_by<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, x) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let subst = prev[j] + usize::from(x != y);
            cur[j + 1] = subst.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Edit distance between two instruction sequences.
pub fn edit_distance(a: &Sequence, b: &Sequence) -> usize {
    edit_distance_by(a.insts(), b.insts())
}

pub fn str_edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    edit_distance_by(&a, &b)
}

/// Number of positions that differ, extra length counting as differences.
pub fn hamming_distance(a: &Sequence, b: &Sequence) -> usize {
    let common = a.len().min(b.len());
    let diffs = (0..common).filter(|&i| a.get(i) != b.get(i)).count();
    diffs + a.len().max(b.len()) - common
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_round_trip() {
        let all: Vec<Instruction> = (0..62).map(Instruction).collect();
        let seq = Sequence::from_insts(all);
        let text = seq.as_string();
        assert!(text.starts_with("abc"));
        assert_eq!(&text[26..29], "ABC");
        assert_eq!(&text[52..], "1234567890");
        assert_eq!(Sequence::from_symbols(&text).unwrap(), seq);
    }

    #[test]
    fn test_out_of_alphabet() {
        assert_eq!(Instruction(62).symbol(), '*');
        assert!(matches!(Sequence::from_symbols("ab*c"), Err(GenomeError::BadSymbol('*'))));
    }

    #[test]
    fn test_insert_remove_crop() {
        let mut seq = Sequence::from_symbols("abcde").unwrap();
        seq.insert(2, Instruction(25));
        assert_eq!(seq.as_string(), "abzcde");
        assert_eq!(seq.remove(0), Instruction(0));
        assert_eq!(seq.as_string(), "bzcde");
        assert_eq!(seq.crop(1, 3).as_string(), "zc");
        seq.insert(seq.len(), Instruction(0));
        assert_eq!(seq.as_string(), "bzcdea");
    }

    #[test]
    fn test_resize_keeps_prefix_and_flags() {
        let mut seq = Sequence::from_symbols("abc").unwrap();
        seq.flags_mut(1).executed = true;
        seq.resize(5, Instruction(3));
        assert_eq!(seq.as_string(), "abcdd");
        assert!(seq.flags(1).executed);
        assert!(!seq.flags(4).executed);
        seq.resize(2, Instruction(0));
        assert_eq!(seq.as_string(), "ab");
    }

    #[test]
    fn test_find_inst() {
        let seq = Sequence::from_symbols("abcabc").unwrap();
        assert_eq!(seq.find_inst(Instruction(2), 0), Some(2));
        assert_eq!(seq.find_inst(Instruction(2), 3), Some(5));
        assert_eq!(seq.find_inst(Instruction(9), 0), None);
    }

    #[test]
    fn test_equality_ignores_flags() {
        let a = Sequence::from_symbols("abc").unwrap();
        let mut b = a.clone();
        b.flags_mut(0).copied = true;
        assert_eq!(a, b);
    }

    #[test]
    fn test_edit_distance() {
        let a = Sequence::from_symbols("kitten").unwrap();
        let b = Sequence::from_symbols("sitting").unwrap();
        assert_eq!(edit_distance(&a, &b), 3);
        assert_eq!(edit_distance(&a, &a), 0);
        assert_eq!(edit_distance(&a, &Sequence::new()), 6);
        assert_eq!(str_edit_distance("h-copy", "h-cpy"), 1);
    }

    #[test]
    fn test_hamming_distance() {
        let a = Sequence::from_symbols("abcd").unwrap();
        let b = Sequence::from_symbols("abxdz").unwrap();
        assert_eq!(hamming_distance(&a, &b), 2);
    }
}
