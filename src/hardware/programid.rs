//! Programids and the table that owns them
//!
//! Every programid keeps the id it was created with for its whole life.
//! Heads address memory by that id, so removing one programid never shifts
//! anybody else's references; heads that pointed at the removed one simply
//! fall back onto their owner.

use std::collections::BTreeMap;

use crate::hardware::base::Thread;
use crate::head::{Head, SpaceId, HEAD_READ, HEAD_WRITE};
use crate::inst_lib::{Op, NUM_NOPS};
use crate::inst_set::InstSet;
use crate::label::Label;
use crate::sequence::{Instruction, Sequence};

/// What other programids may do with a programid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Runs its own instructions
    pub executable: bool,
    /// Its sites can be bound
    pub bindable: bool,
    /// Counts as genome and may be read from
    pub readable: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities { executable: true, bindable: true, readable: true };

    pub fn new(executable: bool, bindable: bool, readable: bool) -> Self {
        Self { executable, bindable, readable }
    }
}

/// A bindable site found in another programid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchSite {
    pub programid: SpaceId,
    /// Position of the `site` instruction
    pub site: usize,
    pub label: Label,
}

#[derive(Clone, Debug)]
pub struct Programid {
    pub id: SpaceId,
    pub memory: Sequence,
    pub thread: Thread,
    pub caps: Capabilities,
    pub marked_for_death: bool,
    pub cpu_cycles_used: u64,

    /// Whether the last non-nop passed by p-copy was a site
    pub copying_site: bool,
    /// Nops copied since that non-nop
    pub copying_label: Label,
    /// Label that ends the copy of the bound programid
    pub terminator_label: Label,
}

impl Programid {
    pub fn new(id: SpaceId, memory: Sequence, caps: Capabilities) -> Self {
        Self {
            id,
            memory,
            thread: Thread::new(id),
            caps,
            marked_for_death: false,
            cpu_cycles_used: 0,
            copying_site: false,
            copying_label: Label::new(),
            terminator_label: Label::new(),
        }
    }

    pub fn reset_heads(&mut self) {
        self.thread.reset_heads(self.id);
    }

    /// Pull the read and write heads back onto this programid.
    pub fn detach(&mut self) {
        self.thread.heads[HEAD_READ] = Head::new(self.id);
        self.thread.heads[HEAD_WRITE] = Head::new(self.id);
    }

    /// Attach `head` to a matched site. Copying through this binding stops
    /// at the complement of the site's label.
    pub fn bind(&mut self, head: usize, site: &MatchSite) {
        let mut terminator = site.label.clone();
        terminator.rotate(1, NUM_NOPS);
        self.terminator_label = terminator;
        self.thread.heads[head] = Head::at(site.site as i32, site.programid);
    }

    /// Sites in this programid whose trailing nops spell `label`.
    ///
    /// The scan starts at the first non-nop and walks the whole circle, so
    /// a label running off the end continues at the front.
    pub fn sites(&self, label: &Label, inst_set: &InstSet) -> Vec<MatchSite> {
        let mut matches = Vec::new();
        if !self.caps.bindable {
            return matches;
        }
        let len = self.memory.len();
        let Some(start) = (0..len).find(|&i| !inst_set.is_nop(self.memory.get(i))) else {
            return matches;
        };

        let mut site_pos: Option<usize> = None;
        let mut site_label = Label::new();
        for step in 0..len {
            let pos = (start + step) % len;
            let inst = self.memory.get(pos);
            if inst_set.is_label(inst) {
                site_pos = Some(pos);
                site_label.clear();
            } else if inst_set.is_nop(inst) && site_pos.is_some() {
                site_label.add_nop(inst_set.nop_mod(inst));
            } else {
                site_pos = None;
            }

            if let Some(site) = site_pos {
                let next = self.memory.get((pos + 1) % len);
                if !inst_set.is_nop(next) && site_label == *label {
                    matches.push(MatchSite { programid: self.id, site, label: site_label.clone() });
                }
            }
        }
        matches
    }

    /// Length counted toward a genome when dividing.
    pub fn genome_length(&self) -> usize {
        if self.caps.readable {
            self.memory.len()
        } else {
            0
        }
    }

    /// Append this programid to a linear genome: a PROGRAMID marker, one
    /// marker per capability, then the memory.
    pub fn append_linear(&self, genome: &mut Sequence, inst_set: &InstSet) {
        let markers = [
            (true, Op::MarkProgramid),
            (self.caps.executable, Op::MarkExecutable),
            (self.caps.bindable, Op::MarkBindable),
            (self.caps.readable, Op::MarkReadable),
        ];
        for (present, op) in markers {
            if let Some(inst) = inst_set.find_op(op).filter(|_| present) {
                genome.push(inst);
            }
        }
        genome.append(&self.memory);
    }
}

/// Split a linear genome at its PROGRAMID markers.
///
/// Capability markers are stripped and turned into flags. Anything before
/// the first PROGRAMID is ignored. A genome with no markers at all becomes a
/// single programid with every capability.
pub fn split_linear_genome(genome: &Sequence, inst_set: &InstSet) -> Vec<(Sequence, Capabilities)> {
    let Some(first) = inst_set.find_op(Op::MarkProgramid).and_then(|m| genome.find_inst(m, 0)) else {
        let memory = Sequence::from_insts(strip_markers(genome.insts(), inst_set).0);
        return vec![(memory, Capabilities::ALL)];
    };

    let mut sections = Vec::new();
    let mut begin = first;
    while begin < genome.len() {
        let end = (begin + 1..genome.len())
            .find(|&i| inst_set.op(genome.get(i)) == Op::MarkProgramid)
            .unwrap_or(genome.len());
        let (insts, caps) = strip_markers(&genome.insts()[begin..end], inst_set);
        sections.push((Sequence::from_insts(insts), caps));
        begin = end;
    }
    sections
}

fn strip_markers(insts: &[Instruction], inst_set: &InstSet) -> (Vec<Instruction>, Capabilities) {
    let mut caps = Capabilities::default();
    let mut out = Vec::with_capacity(insts.len());
    for &inst in insts {
        match inst_set.op(inst) {
            Op::MarkProgramid => {}
            Op::MarkExecutable => caps.executable = true,
            Op::MarkBindable => caps.bindable = true,
            Op::MarkReadable => caps.readable = true,
            _ => out.push(inst),
        }
    }
    (out, caps)
}

/// Programids keyed by stable id, iterated in creation order.
#[derive(Clone, Debug, Default)]
pub struct ProgramidTable {
    entries: BTreeMap<SpaceId, Programid>,
    next_id: SpaceId,
}

impl ProgramidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_id = 0;
    }

    pub fn insert(&mut self, memory: Sequence, caps: Capabilities) -> SpaceId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, Programid::new(id, memory, caps));
        id
    }

    pub fn get(&self, id: SpaceId) -> Option<&Programid> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: SpaceId) -> Option<&mut Programid> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: SpaceId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<SpaceId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Programid> {
        self.entries.values()
    }

    /// Id of the `n`th programid in creation order.
    pub fn nth_id(&self, n: usize) -> Option<SpaceId> {
        self.entries.keys().nth(n).copied()
    }

    /// Position of `id` in creation order.
    pub fn index_of(&self, id: SpaceId) -> Option<usize> {
        self.entries.keys().position(|&k| k == id)
    }

    pub fn last_id(&self) -> Option<SpaceId> {
        self.entries.keys().next_back().copied()
    }

    /// Read and write heads of other programids currently on `id`.
    pub fn contacting_heads(&self, id: SpaceId) -> usize {
        self.entries
            .values()
            .filter(|p| p.id != id)
            .flat_map(|p| [p.thread.heads[HEAD_READ], p.thread.heads[HEAD_WRITE]])
            .filter(|h| h.space == id)
            .count()
    }

    /// Executable and not currently held by anybody else's heads.
    pub fn can_execute(&self, id: SpaceId) -> bool {
        self.get(id).is_some_and(|p| p.caps.executable) && self.contacting_heads(id) == 0
    }

    /// Remove a programid; every head that pointed at it returns to the
    /// start of its owner.
    pub fn remove(&mut self, id: SpaceId) -> Option<Programid> {
        let removed = self.entries.remove(&id)?;
        for p in self.entries.values_mut() {
            let owner = p.id;
            for head in p.thread.heads.iter_mut() {
                if head.space == id {
                    *head = Head::new(owner);
                }
            }
        }
        Some(removed)
    }
}
