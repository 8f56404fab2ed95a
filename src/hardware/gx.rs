//! Gene-expression hardware
//!
//! An organism runs as a set of programids. Each cycle every programid that
//! is executable, and not currently held by another programid's read or
//! write head, runs one instruction. Programids find each other through
//! `site` labels, copy each other with `p-copy` and split into parent and
//! offspring with `p-divide`.
//!
//! With implicit gene expression the genome itself is a single readable
//! programid. Executable programids are transcribed from it whenever a
//! position's promoter state fills up, and `h-activate`/`h-repress` move
//! promoter rates around a matched label.

use rand::Rng;
use tracing::{debug, trace};

use crate::hardware::base::{execute_common, head_copy, CpuCore, CpuStack, Thread, REG_AX, REG_BX};
use crate::hardware::programid::{split_linear_genome, Capabilities, MatchSite, ProgramidTable};
use crate::hardware::{
    allocate_main, check_allocate, divide_check_viable, divide_do_mutations, DivideMethod, ExecContext, Hardware,
    HardwareConfig,
};
use crate::head::{Head, SpaceId, HEAD_FLOW, HEAD_IP, HEAD_READ, HEAD_WRITE};
use crate::inst_lib::{Op, NUM_NOPS};
use crate::inst_set::InstSet;
use crate::label::Label;
use crate::organism::OrgState;
use crate::sequence::{Instruction, Sequence};

/// Regulatory state of one genome position.
const ACTIVATED: i8 = 1;
const NEUTRAL: i8 = 0;
const REPRESSED: i8 = -1;

/// Promoter bookkeeping of the implicit model, one slot per genome position.
#[derive(Clone, Debug)]
struct Promoters {
    genome_id: SpaceId,
    default_rates: Vec<f64>,
    rates: Vec<f64>,
    states: Vec<f64>,
    occupied: Vec<i8>,
    sum: f64,
    /// Position last visited by the transcription scan
    update_pos: usize,
    recycle_state: f64,
}

impl Promoters {
    fn new(genome_id: SpaceId, genome: &Sequence, inst_set: &InstSet, bg_rate: f64) -> Self {
        let len = genome.len();
        let default_rates: Vec<f64> =
            genome.iter().map(|inst| if inst_set.is_promoter(inst) { 1.0 } else { bg_rate }).collect();
        let mut promoters = Self {
            genome_id,
            rates: default_rates.clone(),
            default_rates,
            states: vec![0.0; len],
            occupied: vec![NEUTRAL; len],
            sum: 0.0,
            // The first scan step lands on position 0.
            update_pos: len.saturating_sub(1),
            recycle_state: 0.0,
        };
        promoters.adjust_rates(bg_rate);
        promoters
    }

    fn len(&self) -> usize {
        self.rates.len()
    }

    fn adjust_rates(&mut self, bg_rate: f64) {
        for (i, rate) in self.rates.iter_mut().enumerate() {
            *rate = match self.occupied[i] {
                ACTIVATED => 1.0,
                REPRESSED => bg_rate,
                _ => self.default_rates[i],
            };
        }
        self.sum = self.rates.iter().sum();
    }

    /// Set `count` positions starting at `start`, wrapping around.
    fn set_window(&mut self, start: usize, count: usize, value: i8) {
        let len = self.len();
        for i in 0..count {
            self.occupied[(start + i) % len] = value;
        }
    }

    /// Position where `label` overlays the most matching nops without
    /// touching a regulated position.
    fn find_regulatory_match(&self, label: &Label, genome: &Sequence, inst_set: &InstSet) -> Option<usize> {
        let len = self.len().min(genome.len());
        let mut best = None;
        let mut best_matched = 0;
        for start in 0..len {
            let mut matched = 0;
            for i in 0..label.len() {
                let pos = (start + i) % len;
                if self.occupied[pos] != NEUTRAL {
                    matched = 0;
                    break;
                }
                let inst = genome.get(pos);
                if inst_set.is_nop(inst) && inst_set.nop_mod(inst) == label.get(i) as usize {
                    matched += 1;
                }
            }
            if matched > best_matched {
                best = Some(start);
                best_matched = matched;
                if matched == label.len() {
                    break;
                }
            }
        }
        best
    }

    /// Scan forward accumulating promoter states until one fires.
    fn next_firing(&mut self) -> usize {
        let len = self.len();
        loop {
            self.update_pos = (self.update_pos + 1) % len;
            let pos = self.update_pos;
            self.states[pos] += self.rates[pos];
            if self.states[pos] >= 1.0 {
                self.states[pos] -= 1.0;
                return pos;
            }
        }
    }
}

pub struct HardwareGx {
    programids: ProgramidTable,
    /// Programid whose instruction is executing
    current: SpaceId,
    /// Stand-in thread while no programid is current
    idle: Thread,
    global_stack: CpuStack,
    advance_ip: bool,
    just_divided: bool,
    mal_active: bool,
    genome: Sequence,
    promoters: Option<Promoters>,
}

impl HardwareGx {
    pub fn new(org: &OrgState, inst_set: &InstSet, config: &HardwareConfig) -> Self {
        let mut hw = Self {
            programids: ProgramidTable::new(),
            current: 0,
            idle: Thread::new(0),
            global_stack: CpuStack::new(),
            advance_ip: true,
            just_divided: false,
            mal_active: false,
            genome: Sequence::new(),
            promoters: None,
        };
        hw.reset(org, inst_set, config);
        hw
    }

    pub fn programids(&self) -> &ProgramidTable {
        &self.programids
    }

    /// Status of one programid.
    pub fn programid_status(&self, id: SpaceId, inst_set: &InstSet) -> String {
        let Some(p) = self.programids.get(id) else {
            return format!("programid {} (removed)", id);
        };
        let ip = p.thread.heads[HEAD_IP];
        let inst = if ip.index() < p.memory.len() { inst_set.name(p.memory.get(ip.index())) } else { "(none)" };
        format!(
            "[{}{}{}{}] {:>4} {:<10} {} mem:{}",
            id,
            if p.caps.executable { "x" } else { "" },
            if p.caps.bindable { "b" } else { "" },
            if p.caps.readable { "r" } else { "" },
            ip.pos,
            inst,
            p.thread.status(),
            p.memory.len()
        )
    }

    fn execute(&mut self, inst: Instruction, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        let ip = self.head(HEAD_IP);
        self.mark_executed(ip);
        let op = ctx.inst_set.op(inst);
        let ok = match execute_common(self, op, org, ctx) {
            Some(ok) => ok,
            None => self.execute_specific(op, org, ctx),
        };
        trace!(programid = self.current, pos = ip.pos, inst = ctx.inst_set.name(inst), ok, "gx step");
        ok
    }

    fn execute_specific(&mut self, op: Op, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        match op {
            Op::MaxAlloc => {
                let cur_size = self.current_len() as i32;
                let max_len = ctx.config.max_genome_length as i32;
                let alloc_size = ((ctx.config.child_size_range * cur_size as f64) as i32).min(max_len - cur_size);
                self.allocate_into(alloc_size, REG_AX, cur_size, org, ctx)
            }
            Op::Allocate => {
                let cur_size = self.current_len() as i32;
                self.allocate_into(self.reg(REG_BX), REG_AX, cur_size, org, ctx)
            }
            Op::CAlloc => {
                let cur_size = self.current_len() as i32;
                let Some(p) = self.programids.get_mut(self.current) else {
                    return false;
                };
                allocate_main(&mut p.memory, cur_size, &mut self.mal_active, &[], org, ctx.inst_set, ctx.config, ctx.rng)
            }
            // Divides go through p-divide or i-divide.
            Op::HeadDivide => true,
            Op::Repro => self.repro(org, ctx),

            Op::NewProgramid => self.new_programid(Capabilities::new(true, false, false), ctx),
            Op::NewGenomeProgramid => self.new_programid(Capabilities::new(false, true, true), ctx),
            Op::ProgramidCopy => self.programid_copy(org, ctx),
            Op::ProgramidDivide => self.programid_divide(org, ctx),
            Op::Site => {
                self.read_label(ctx.inst_set, ctx.config.max_label_size, ctx.config.max_label_exe_size);
                true
            }
            Op::Bind => self.bind(ctx),
            Op::Bind2 => self.bind2(ctx),
            Op::IfBind => {
                let ok = self.bind(ctx);
                if !ok {
                    self.advance_head(HEAD_IP);
                }
                ok
            }
            Op::IfBind2 => {
                let ok = self.bind2(ctx);
                if !ok {
                    self.advance_head(HEAD_IP);
                }
                ok
            }
            Op::NumSites => {
                self.read_label(ctx.inst_set, ctx.config.max_label_size, ctx.config.max_label_exe_size);
                let label = self.thread().next_label.clone();
                let current = self.current;
                let count: usize = self
                    .programids
                    .iter()
                    .filter(|p| p.id != current)
                    .map(|p| p.sites(&label, ctx.inst_set).len())
                    .sum();
                self.set_reg(REG_BX, count as i32);
                true
            }
            Op::ProgramidImplicitAllocate => self.implicit_allocate(org, ctx),
            Op::ProgramidImplicitDivide => self.implicit_divide(org, ctx),
            Op::HeadActivate => self.regulate(true, ctx),
            Op::HeadRepress => self.regulate(false, ctx),
            Op::EndProgramid => {
                if let Some(p) = self.programids.get_mut(self.current) {
                    p.marked_for_death = true;
                }
                true
            }
            _ => false,
        }
    }

    fn current_len(&self) -> usize {
        self.space_len(self.current)
    }

    /// Grow the current programid's memory; on success store `value` in `dst`.
    fn allocate_into(
        &mut self,
        size: i32,
        dst: usize,
        value: i32,
        org: &mut OrgState,
        ctx: &mut ExecContext<'_>,
    ) -> bool {
        let Some(p) = self.programids.get_mut(self.current) else {
            return false;
        };
        if allocate_main(&mut p.memory, size, &mut self.mal_active, &[], org, ctx.inst_set, ctx.config, ctx.rng) {
            self.set_reg(dst, value);
            true
        } else {
            false
        }
    }

    /// Create a one-instruction programid and point the write head at it.
    fn new_programid(&mut self, caps: Capabilities, ctx: &mut ExecContext<'_>) -> bool {
        let current = self.current;
        self.move_head(HEAD_WRITE, Head::new(current));
        if self.programids.len() >= ctx.config.max_programids {
            return false;
        }
        let id = self.programids.insert(Sequence::filled(1, ctx.inst_set.default_inst()), caps);
        debug!(programid = id, parent = current, ?caps, "programid allocated");
        self.move_head(HEAD_WRITE, Head::new(id));
        true
    }

    fn bind(&mut self, ctx: &mut ExecContext<'_>) -> bool {
        self.read_label(ctx.inst_set, ctx.config.max_label_size, ctx.config.max_label_exe_size);
        let current = self.current;
        if self.head(HEAD_READ).space != current {
            return false;
        }
        let write_space = self.head(HEAD_WRITE).space;
        let label = self.thread().next_label.clone();
        let matches: Vec<MatchSite> = self
            .programids
            .iter()
            .filter(|p| p.id != current && p.id != write_space)
            .flat_map(|p| p.sites(&label, ctx.inst_set))
            .collect();
        if matches.is_empty() {
            return false;
        }
        let choice = ctx.rng.random_range(0..matches.len());
        match self.programids.get_mut(current) {
            Some(p) => {
                p.bind(HEAD_READ, &matches[choice]);
                true
            }
            None => false,
        }
    }

    /// Bind the read head to one programid and the write head to another,
    /// both carrying a site for the label.
    fn bind2(&mut self, ctx: &mut ExecContext<'_>) -> bool {
        self.read_label(ctx.inst_set, ctx.config.max_label_size, ctx.config.max_label_exe_size);
        let current = self.current;
        let label = self.thread().next_label.clone();
        let mut candidates = Vec::new();
        for p in self.programids.iter().filter(|p| p.id != current) {
            let mut sites = p.sites(&label, ctx.inst_set);
            if !sites.is_empty() {
                let pick = ctx.rng.random_range(0..sites.len());
                candidates.push(sites.swap_remove(pick));
            }
        }

        if candidates.len() < 2 {
            self.set_reg(REG_BX, 0);
            return false;
        }
        let first = ctx.rng.random_range(0..candidates.len());
        let mut second = ctx.rng.random_range(0..candidates.len());
        while second == first {
            second = ctx.rng.random_range(0..candidates.len());
        }
        if let Some(p) = self.programids.get_mut(current) {
            p.detach();
            p.bind(HEAD_READ, &candidates[first]);
            p.bind(HEAD_WRITE, &candidates[second]);
        }
        self.set_reg(REG_BX, 2);
        true
    }

    /// h-copy between two other programids. The read head lets go once it
    /// passes the complement of the label it bound to, right after a site.
    fn programid_copy(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        let is = ctx.inst_set;
        let current = self.current;
        self.adjust_head(HEAD_READ);
        self.adjust_head(HEAD_WRITE);
        let read = self.head(HEAD_READ);
        let write = self.head(HEAD_WRITE);
        if read.space == current || write.space == current {
            return false;
        }
        let Some(source) = self.programids.get(read.space) else {
            return false;
        };
        if !source.caps.readable {
            return false;
        }
        if read.index() >= source.memory.len() {
            if let Some(p) = self.programids.get_mut(current) {
                p.detach();
            }
            return false;
        }

        let inst = source.memory.get(read.index());
        if let Some(p) = self.programids.get_mut(current) {
            if is.is_nop(inst) {
                p.copying_label.add_nop(is.nop_mod(inst));
            } else {
                p.copying_site = is.is_label(inst);
                p.copying_label.clear();
            }
        }

        if let Some(target) = self.space_mut(write.space) {
            if target.len() == write.index() + 1 {
                target.resize(target.len() + 1, is.default_inst());
            }
        }

        let mut ok = true;
        if !org.test_divide_del(ctx.rng) {
            ok = head_copy(self, org, ctx);
        }
        if org.test_divide_ins(ctx.rng) {
            let w = self.head(HEAD_WRITE);
            let inserted = is.random_inst(ctx.rng);
            if let Some(target) = self.space_mut(w.space) {
                let pos = w.index().min(target.len());
                target.insert(pos, inserted);
            }
            self.advance_head(HEAD_WRITE);
        }

        let next_is_nop = self.inst_at(self.head(HEAD_READ)).is_some_and(|i| is.is_nop(i));
        let finished = self
            .programids
            .get(current)
            .is_some_and(|p| p.copying_site && !next_is_nop && p.terminator_label == p.copying_label);
        if finished {
            self.move_head(HEAD_READ, Head::new(current));
            let w = self.head(HEAD_WRITE);
            if let Some(target) = self.space_mut(w.space) {
                if target.len() > 1 {
                    let len = target.len() - 1;
                    target.resize(len, is.default_inst());
                }
            }
            return true;
        }
        ok
    }

    /// Split the programids into parent and offspring.
    ///
    /// The read head's programid seeds the parent, the write head's the
    /// offspring. Anything another programid is still writing into is a
    /// fragment and dropped; the rest is assigned by coin flip. Nothing
    /// changes unless both sides end up viable.
    fn programid_divide(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        org.phenotype.executed_size = 1;
        org.phenotype.copied_size = 1;

        let current = self.current;
        let read = self.head(HEAD_READ).space;
        let write = self.head(HEAD_WRITE).space;
        if read == current || write == current || read == write {
            return false;
        }
        let seeds_bindable = [read, write]
            .iter()
            .all(|&id| self.programids.get(id).is_some_and(|p| p.caps.bindable));
        if !seeds_bindable {
            return false;
        }

        let mut parent = vec![read];
        let mut offspring = vec![write];
        let mut rest: Vec<SpaceId> = self.programids.ids().into_iter().filter(|&id| id != read && id != write).collect();
        let mut fragments = Vec::new();
        for p in self.programids.iter() {
            if !rest.contains(&p.id) {
                continue;
            }
            let target = p.thread.heads[HEAD_WRITE].space;
            if target != p.id {
                if let Some(pos) = rest.iter().position(|&id| id == target) {
                    fragments.push(rest.remove(pos));
                }
            }
        }
        for id in rest {
            if ctx.rng.random_range(0..2) == 0 {
                offspring.push(id);
            } else {
                parent.push(id);
            }
        }

        let min_length = ctx.config.min_divide_genome_length;
        let viable = |ids: &[SpaceId]| {
            let members = ids.iter().filter_map(|&id| self.programids.get(id));
            let (executable, length) =
                members.fold((false, 0), |(x, len), p| (x || p.caps.executable, len + p.genome_length()));
            executable && length >= min_length
        };
        if !viable(&offspring) || !viable(&parent) {
            return false;
        }

        let mut child = Sequence::new();
        for &id in &offspring {
            if let Some(p) = self.programids.get(id) {
                p.append_linear(&mut child, ctx.inst_set);
            }
        }
        for &id in offspring.iter().chain(fragments.iter()) {
            self.programids.remove(id);
        }
        for &id in &parent {
            if let Some(p) = self.programids.get_mut(id) {
                p.reset_heads();
            }
        }
        debug!(
            parent = parent.len(),
            offspring = offspring.len(),
            fragments = fragments.len(),
            child_len = child.len(),
            "programid divide"
        );

        org.offspring = child;
        org.activate_divide(ctx.host);
        self.just_divided = true;
        true
    }

    fn genome_id(&self) -> Option<SpaceId> {
        match &self.promoters {
            Some(p) => Some(p.genome_id),
            None => self.programids.nth_id(0),
        }
    }

    /// Allocate an empty genome programid to copy the genome into.
    fn implicit_allocate(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        let Some(genome_id) = self.genome_id() else {
            return false;
        };
        let cur_size = self.space_len(genome_id) as i32;
        let allocated_size = ((ctx.config.child_size_range * cur_size as f64) as i32).min(ctx.config.max_genome_length as i32);
        if !check_allocate(org, ctx.config, cur_size, allocated_size, self.mal_active) {
            return false;
        }
        let memory = Sequence::filled(allocated_size as usize, ctx.inst_set.default_inst());
        let id = self.programids.insert(memory, Capabilities::new(false, true, true));
        self.mal_active = true;
        debug!(programid = id, size = allocated_size, "genome programid allocated");

        self.move_head(HEAD_WRITE, Head::new(id));
        self.move_head(HEAD_READ, Head::new(genome_id));
        self.set_reg(REG_BX, cur_size);
        true
    }

    /// Divide off the memory under the write head up to its position.
    fn implicit_divide(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        let write = self.head(HEAD_WRITE);
        let child_end = write.pos;
        let parent_size = org.genome.len() as i32;
        if !divide_check_viable(org, ctx.config, parent_size, child_end, |parent, child| (parent, child)) {
            return false;
        }
        let Some(target) = self.programids.get(write.space) else {
            return false;
        };
        let end = (child_end as usize).min(target.memory.len());
        org.offspring = target.memory.crop(0, end);
        divide_do_mutations(org, ctx.inst_set, ctx.config, ctx.rng);
        self.finish_divide(org, ctx)
    }

    fn repro(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        org.offspring = Sequence::from_insts(org.genome.insts().to_vec());
        divide_do_mutations(org, ctx.inst_set, ctx.config, ctx.rng);
        let parent_size = org.genome.len() as i32;
        let child_size = org.offspring.len() as i32;
        if !divide_check_viable(org, ctx.config, parent_size, child_size, |parent, child| (parent, child)) {
            return false;
        }
        self.finish_divide(org, ctx)
    }

    fn finish_divide(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        self.mal_active = false;
        let split = ctx.config.divide_method == DivideMethod::Split;
        if split {
            self.advance_ip = false;
        }
        let parent_alive = org.activate_divide(ctx.host);
        if parent_alive && split {
            self.reset(org, ctx.inst_set, ctx.config);
        }
        self.just_divided = true;
        true
    }

    /// h-activate / h-repress: regulate the promoters around the best match
    /// of the complemented label. The write and flow heads remember the
    /// matched span so the regulation can be lifted again.
    fn regulate(&mut self, activate: bool, ctx: &mut ExecContext<'_>) -> bool {
        let config = ctx.config;
        self.remove_regulation(self.current, config);
        self.read_label(ctx.inst_set, config.max_label_size, config.max_label_exe_size);
        self.thread_mut().next_label.rotate(1, NUM_NOPS);
        let label = self.thread().next_label.clone();

        let Some(promoters) = self.promoters.as_mut() else {
            return false;
        };
        let genome_id = promoters.genome_id;
        let Some(genome) = self.programids.get(genome_id).map(|p| &p.memory) else {
            return false;
        };
        let len = promoters.len();
        let Some(match_pos) = promoters.find_regulatory_match(&label, genome, ctx.inst_set) else {
            return false;
        };

        let footprint = config.regulatory_footprint;
        let start = (match_pos as i64 - footprint as i64).rem_euclid(len as i64) as usize;
        promoters.set_window(start, 2 * footprint + label.len(), REPRESSED);
        if activate {
            // A new promoter right after the matched label.
            promoters.occupied[(start + footprint + label.len() - 1) % len] = ACTIVATED;
        }
        promoters.adjust_rates(config.implicit_bg_promoter_rate);

        self.move_head(HEAD_WRITE, Head::at(match_pos as i32, genome_id));
        self.move_head(HEAD_FLOW, Head::at((match_pos + label.len()) as i32, genome_id));
        true
    }

    /// Lift whatever regulation programid `id` holds on the genome.
    fn remove_regulation(&mut self, id: SpaceId, config: &HardwareConfig) {
        let Some(promoters) = self.promoters.as_mut() else {
            return;
        };
        let genome_id = promoters.genome_id;
        if id == genome_id || promoters.len() == 0 {
            return;
        }
        let Some(p) = self.programids.get_mut(id) else {
            return;
        };
        let write = p.thread.heads[HEAD_WRITE];
        if write.space != genome_id {
            return;
        }
        let flow = p.thread.heads[HEAD_FLOW];
        p.thread.heads[HEAD_WRITE] = Head::new(id);
        p.thread.heads[HEAD_FLOW] = Head::new(id);

        let len = promoters.len() as i32;
        let label_size = (flow.pos - write.pos).rem_euclid(len) as usize;
        let footprint = config.regulatory_footprint;
        let start = (write.pos - footprint as i32).rem_euclid(len) as usize;
        promoters.set_window(start, 2 * footprint + label_size, NEUTRAL);
        promoters.adjust_rates(config.implicit_bg_promoter_rate);
    }

    /// Transcribe executable programids from the genome until `limit`
    /// programids exist, the genome programid included.
    fn process_implicit(&mut self, limit: usize, inst_set: &InstSet, config: &HardwareConfig) {
        let Some(promoters) = self.promoters.as_mut() else {
            return;
        };
        if promoters.sum <= 0.0 || promoters.len() == 0 {
            return;
        }
        let limit = limit.min(config.max_programids);
        let genome_id = promoters.genome_id;

        while self.programids.len() < limit {
            let start = promoters.next_firing();
            let Some(genome) = self.programids.get(genome_id).map(|p| &p.memory) else {
                return;
            };
            let len = genome.len();
            let max_len = match config.implicit_max_programid_length {
                0 => len,
                n => n,
            };
            let mut insts = Vec::with_capacity(max_len);
            let mut terminated = false;
            for offset in 1..=max_len {
                let inst = genome.get((start + offset) % len);
                if inst_set.is_terminator(inst) {
                    terminated = true;
                    break;
                }
                insts.push(inst);
            }
            if terminated && insts.is_empty() {
                insts.push(inst_set.default_inst());
            }

            let copied = insts.len();
            let id = self.programids.insert(Sequence::from_insts(insts), Capabilities::new(true, false, false));
            if let Some(p) = self.programids.get_mut(id) {
                p.thread.heads[HEAD_READ] = Head::at(start as i32, genome_id);
            }
            debug!(programid = id, start, len = copied, terminated, "programid transcribed");
            promoters.update_pos = (start + 1) % len;
        }
    }

    /// Remove a programid. Without implicit expression whatever it was
    /// writing into goes too, since that copy can never finish.
    fn remove_programid(&mut self, id: SpaceId, config: &HardwareConfig) {
        if !self.programids.contains(id) {
            return;
        }
        self.remove_regulation(id, config);
        let Some(removed) = self.programids.remove(id) else {
            return;
        };
        debug!(programid = id, len = removed.memory.len(), cycles = removed.cpu_cycles_used, "programid removed");
        if self.promoters.is_none() {
            let target = removed.thread.heads[HEAD_WRITE].space;
            if target != id {
                self.remove_programid(target, config);
            }
        }
    }

    /// Turnover of the implicit model: each whole unit of accumulated
    /// turnover evicts the oldest transcript once the table is full.
    fn turnover(&mut self, config: &HardwareConfig) {
        let Some(promoters) = self.promoters.as_mut() else {
            return;
        };
        promoters.recycle_state += config.implicit_turnover_rate;
        let turnovers = promoters.recycle_state.floor().max(0.0);
        promoters.recycle_state -= turnovers;
        for _ in 0..turnovers as usize {
            if self.programids.len() < config.max_programids {
                break;
            }
            if let Some(oldest) = self.programids.nth_id(1) {
                self.remove_programid(oldest, config);
            }
        }
    }
}

impl CpuCore for HardwareGx {
    fn thread(&self) -> &Thread {
        match self.programids.get(self.current) {
            Some(p) => &p.thread,
            None => &self.idle,
        }
    }

    fn thread_mut(&mut self) -> &mut Thread {
        match self.programids.get_mut(self.current) {
            Some(p) => &mut p.thread,
            None => &mut self.idle,
        }
    }

    fn global_stack_mut(&mut self) -> &mut CpuStack {
        &mut self.global_stack
    }

    fn space(&self, space: SpaceId) -> Option<&Sequence> {
        self.programids.get(space).map(|p| &p.memory)
    }

    fn space_mut(&mut self, space: SpaceId) -> Option<&mut Sequence> {
        self.programids.get_mut(space).map(|p| &mut p.memory)
    }

    fn is_readable(&self, space: SpaceId) -> bool {
        self.programids.get(space).is_some_and(|p| p.caps.readable)
    }

    fn set_advance_ip(&mut self, advance: bool) {
        self.advance_ip = advance;
    }
}

impl Hardware for HardwareGx {
    fn reset(&mut self, org: &OrgState, inst_set: &InstSet, config: &HardwareConfig) {
        self.programids.clear();
        self.global_stack.clear();
        self.idle.reset(0);
        self.mal_active = false;
        self.advance_ip = true;
        self.just_divided = false;
        self.genome = Sequence::from_insts(org.genome.insts().to_vec());

        if config.implicit_gene_expression {
            let genome_id = self.programids.insert(self.genome.clone(), Capabilities::new(false, false, true));
            self.promoters =
                Some(Promoters::new(genome_id, &self.genome, inst_set, config.implicit_bg_promoter_rate));
            self.process_implicit(config.max_programids, inst_set, config);
        } else {
            self.promoters = None;
            for (memory, caps) in split_linear_genome(&self.genome, inst_set) {
                self.programids.insert(memory, caps);
            }
        }
        self.current = self.programids.last_id().unwrap_or(0);
    }

    fn single_process(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) {
        let config = ctx.config;
        let is = ctx.inst_set;
        if self.promoters.is_some() {
            self.turnover(config);
            self.process_implicit(config.max_programids, is, config);
        }

        self.just_divided = false;
        org.phenotype.time_used += 1;

        // Programids created during this cycle first run in the next one.
        for id in self.programids.ids() {
            if !self.programids.contains(id) {
                continue;
            }
            self.current = id;
            ctx.trace_with(|| self.programid_status(id, is));
            if !self.programids.can_execute(id) {
                continue;
            }
            self.adjust_head(HEAD_IP);
            let Some(inst) = self.inst_at(self.head(HEAD_IP)) else {
                continue;
            };
            self.advance_ip = true;
            self.execute(inst, org, ctx);
            if self.just_divided {
                break;
            }
            if self.advance_ip && self.programids.contains(id) {
                self.advance_head(HEAD_IP);
            }
            if let Some(p) = self.programids.get_mut(id) {
                p.cpu_cycles_used += 1;
            }
        }

        let max_age = config.max_programid_age;
        let doomed: Vec<SpaceId> = self
            .programids
            .iter()
            .filter(|p| (max_age > 0 && p.cpu_cycles_used > max_age) || p.marked_for_death)
            .map(|p| p.id)
            .collect();
        for id in doomed {
            self.remove_programid(id, config);
        }
        self.current = self.programids.last_id().unwrap_or(0);

        org.phenotype.cpu_cycles_used += 1;
        let max_executed = config.max_executed;
        if (max_executed > 0 && org.phenotype.time_used >= max_executed)
            || org.phenotype.to_die
            || self.programids.is_empty()
        {
            org.die();
        }
    }

    fn memory(&self) -> &Sequence {
        self.programids.iter().next().map_or(&self.genome, |p| &p.memory)
    }

    fn status(&self, inst_set: &InstSet) -> String {
        format!(
            "{} programids:{}{}",
            self.programid_status(self.current, inst_set),
            self.programids.len(),
            if self.mal_active { " alloc" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{LogicNine, FIXED_INPUTS};
    use crate::inst_lib::HardwareKind;
    use crate::organism::{MutationRates, OrganismHost, PhenotypeConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[derive(Default)]
    struct Nursery(Vec<Sequence>);

    impl OrganismHost for Nursery {
        fn activate_divide(&mut self, _parent: &mut OrgState, offspring: Sequence) -> bool {
            self.0.push(offspring);
            true
        }
    }

    const GX_NAMES: [&str; 27] = [
        "nop-A", "nop-B", "nop-C", "inc", "bind", "bind2", "g-alloc", "p-alloc", "p-copy", "p-divide", "site",
        "num-sites", "end", "i-alloc", "i-divide", "h-copy", "promoter", "terminator", "h-activate", "h-repress",
        "if-bind", "dec", "PROGRAMID", "EXECUTABLE", "BINDABLE", "READABLE", "h-divide",
    ];

    struct Rig {
        set: InstSet,
        config: HardwareConfig,
        env: LogicNine,
        host: Nursery,
        rng: StdRng,
        org: OrgState,
        hw: HardwareGx,
    }

    impl Rig {
        fn new(config: HardwareConfig, names: &[&str]) -> Self {
            let set = InstSet::from_names(HardwareKind::Gx, &GX_NAMES).unwrap();
            let genome = seq(&set, names);
            let org = OrgState::new(genome, 9, PhenotypeConfig::default(), MutationRates::none(), FIXED_INPUTS.to_vec());
            let hw = HardwareGx::new(&org, &set, &config);
            Self { set, config, env: LogicNine::new(), host: Nursery::default(), rng: StdRng::seed_from_u64(7), org, hw }
        }

        fn step(&mut self, n: usize) {
            for _ in 0..n {
                let mut ctx = ExecContext {
                    inst_set: &self.set,
                    config: &self.config,
                    env: &self.env,
                    host: &mut self.host,
                    rng: &mut self.rng,
                    tracer: None,
                };
                self.hw.single_process(&mut self.org, &mut ctx);
            }
        }

        fn seq(&self, names: &[&str]) -> Sequence {
            seq(&self.set, names)
        }

        fn set_head(&mut self, id: SpaceId, head: usize, target: Head) {
            self.hw.programids.get_mut(id).unwrap().thread.heads[head] = target;
        }

        fn head_of(&self, id: SpaceId, head: usize) -> Head {
            self.hw.programids.get(id).unwrap().thread.heads[head]
        }

        /// Register of programid `id`'s own thread.
        fn reg_of(&self, id: SpaceId, reg: usize) -> i32 {
            self.hw.programids.get(id).unwrap().thread.regs[reg]
        }
    }

    fn seq(set: &InstSet, names: &[&str]) -> Sequence {
        Sequence::from_insts(names.iter().map(|n| set.inst_by_name(n).unwrap()).collect())
    }

    /// A linear genome section: PROGRAMID, the capability markers, then `body`.
    fn section(caps: &[&'static str], body: &[&'static str]) -> Vec<&'static str> {
        let mut out = vec!["PROGRAMID"];
        out.extend_from_slice(caps);
        out.extend_from_slice(body);
        out
    }

    fn implicit() -> HardwareConfig {
        HardwareConfig { implicit_gene_expression: true, max_programids: 2, ..Default::default() }
    }

    #[test]
    fn test_reset_splits_genome() {
        let mut names = section(&["EXECUTABLE"], &["inc", "dec"]);
        names.extend(section(&["BINDABLE", "READABLE"], &["site", "nop-A", "inc"]));
        let rig = Rig::new(HardwareConfig::default(), &names);
        let ps = rig.hw.programids();
        assert_eq!(ps.len(), 2);
        assert_eq!(ps.get(0).unwrap().memory, rig.seq(&["inc", "dec"]));
        assert_eq!(ps.get(1).unwrap().caps, Capabilities::new(false, true, true));
    }

    #[test]
    fn test_unmarked_genome_runs_as_one_programid() {
        let mut rig = Rig::new(HardwareConfig::default(), &["inc", "inc", "dec"]);
        rig.step(2);
        assert_eq!(rig.hw.programids().len(), 1);
        assert_eq!(rig.hw.reg(REG_BX), 2);
    }

    #[test]
    fn test_new_programid_is_held_by_write_head() {
        let mut rig = Rig::new(HardwareConfig::default(), &["p-alloc", "inc", "inc"]);
        rig.step(1);
        assert_eq!(rig.hw.programids().len(), 2);
        assert_eq!(rig.head_of(0, HEAD_WRITE), Head::new(1));
        assert!(rig.hw.programids().get(1).unwrap().caps.executable);
        assert!(!rig.hw.programids().can_execute(1));
    }

    #[test]
    fn test_programid_limit() {
        let config = HardwareConfig { max_programids: 1, ..Default::default() };
        let mut rig = Rig::new(config, &["p-alloc", "inc"]);
        rig.step(1);
        assert_eq!(rig.hw.programids().len(), 1);
        assert_eq!(rig.head_of(0, HEAD_WRITE), Head::new(0));
    }

    #[test]
    fn test_bind_attaches_read_head() {
        let mut names = section(&["EXECUTABLE"], &["bind", "nop-A", "inc", "inc"]);
        names.extend(section(&["BINDABLE", "READABLE"], &["site", "nop-A", "inc", "site", "nop-B", "inc"]));
        let mut rig = Rig::new(HardwareConfig::default(), &names);
        rig.step(1);
        assert_eq!(rig.head_of(0, HEAD_READ), Head::at(0, 1));
        assert_eq!(rig.hw.programids().get(0).unwrap().terminator_label, Label::from_nops(&[1]));
        assert_eq!(rig.head_of(0, HEAD_IP).pos, 2);
    }

    #[test]
    fn test_if_bind_skips_on_failure() {
        let mut rig = Rig::new(HardwareConfig::default(), &["if-bind", "nop-C", "inc", "inc", "dec"]);
        rig.step(2);
        // Nothing to bind to: the first inc is skipped.
        assert_eq!(rig.hw.reg(REG_BX), 1);
        assert_eq!(rig.head_of(0, HEAD_READ), Head::new(0));
    }

    #[test]
    fn test_p_copy_stops_at_terminator_label() {
        let mut names = section(&["EXECUTABLE"], &["bind", "nop-A", "g-alloc", "p-copy", "p-copy", "p-copy", "p-copy", "p-copy"]);
        names.extend(section(&["BINDABLE", "READABLE"], &["site", "nop-A", "inc", "site", "nop-B", "inc"]));
        let mut rig = Rig::new(HardwareConfig::default(), &names);
        rig.step(7);

        let copy = &rig.hw.programids().get(2).unwrap().memory;
        assert_eq!(*copy, rig.seq(&["site", "nop-A", "inc", "site", "nop-B"]));
        assert_eq!(rig.head_of(0, HEAD_READ), Head::new(0));
        assert_eq!(rig.head_of(0, HEAD_WRITE).space, 2);
    }

    #[test]
    fn test_num_sites_counts_other_programids() {
        let mut names = section(&["EXECUTABLE"], &["num-sites", "nop-A", "inc"]);
        names.extend(section(&["BINDABLE"], &["site", "nop-A", "inc", "site", "nop-A", "dec"]));
        names.extend(section(&["BINDABLE"], &["site", "nop-A", "inc"]));
        let mut rig = Rig::new(HardwareConfig::default(), &names);
        rig.step(1);
        // The last programid is current after a cycle; ask the one that ran.
        assert_eq!(rig.reg_of(0, REG_BX), 3);
        assert_eq!(rig.reg_of(2, REG_BX), 0);
    }

    fn divide_rig(offspring_len: usize, with_fragment: bool) -> Rig {
        let mut names = section(&["EXECUTABLE"], &["p-divide", "inc"]);
        let parent_body = vec!["inc"; 60];
        let child_body = vec!["dec"; offspring_len];
        names.extend(section(&["EXECUTABLE", "BINDABLE", "READABLE"], &parent_body));
        names.extend(section(&["EXECUTABLE", "BINDABLE", "READABLE"], &child_body));
        if with_fragment {
            names.extend(section(&["EXECUTABLE"], &["inc"]));
            names.extend(section(&["READABLE"], &["nop-A"]));
        }
        let mut rig = Rig::new(HardwareConfig::default(), &names);
        rig.set_head(0, HEAD_READ, Head::at(0, 1));
        rig.set_head(0, HEAD_WRITE, Head::at(0, 2));
        if with_fragment {
            rig.set_head(3, HEAD_WRITE, Head::at(0, 4));
        }
        rig
    }

    #[test]
    fn test_p_divide_splits_programids() {
        let mut rig = divide_rig(60, true);
        rig.step(1);

        assert_eq!(rig.host.0.len(), 1);
        assert_eq!(rig.org.phenotype.num_divides, 1);
        let ps = rig.hw.programids();
        assert!(ps.contains(1));
        assert!(!ps.contains(2));
        assert!(!ps.contains(4), "fragment survived");

        let child = &rig.host.0[0];
        let header = rig.seq(&["PROGRAMID", "EXECUTABLE", "BINDABLE", "READABLE"]);
        assert_eq!(&child.insts()[..4], header.insts());
        assert!(child.insts()[4..64].iter().all(|&i| rig.set.name(i) == "dec"));
        // Heads of every parent programid are back home.
        for p in ps.iter() {
            assert!(p.thread.heads.iter().all(|h| *h == Head::new(p.id)));
        }
    }

    #[test]
    fn test_p_divide_failure_changes_nothing() {
        let mut rig = divide_rig(40, false);
        rig.step(1);
        assert!(rig.host.0.is_empty());
        assert_eq!(rig.org.phenotype.num_divides, 0);
        assert_eq!(rig.hw.programids().len(), 3);
        assert_eq!(rig.head_of(0, HEAD_READ), Head::at(0, 1));
        assert_eq!(rig.head_of(0, HEAD_WRITE), Head::at(0, 2));
    }

    #[test]
    fn test_removal_takes_write_target_along() {
        let mut names = section(&["EXECUTABLE"], &["end", "inc"]);
        names.extend(section(&["READABLE"], &["nop-A"]));
        names.extend(section(&["EXECUTABLE"], &["inc", "inc"]));
        let mut rig = Rig::new(HardwareConfig::default(), &names);
        rig.set_head(0, HEAD_WRITE, Head::at(0, 1));
        rig.step(1);
        assert_eq!(rig.hw.programids().ids(), vec![2]);
        assert!(!rig.org.is_dead());
    }

    #[test]
    fn test_dies_without_programids() {
        let mut rig = Rig::new(HardwareConfig::default(), &["end", "inc"]);
        rig.step(1);
        assert!(rig.hw.programids().is_empty());
        assert!(rig.org.is_dead());
    }

    #[test]
    fn test_programids_age_out() {
        let config = HardwareConfig { max_programid_age: 2, ..Default::default() };
        let mut rig = Rig::new(config, &["inc", "inc"]);
        rig.step(2);
        assert!(!rig.org.is_dead());
        rig.step(1);
        assert!(rig.org.is_dead());
    }

    #[test]
    fn test_implicit_transcribes_from_promoter() {
        let mut names = vec!["promoter", "inc", "inc", "terminator"];
        names.extend(["dec"; 8]);
        let rig = Rig::new(implicit(), &names);
        let ps = rig.hw.programids();
        assert_eq!(ps.len(), 2);
        let genome = ps.get(0).unwrap();
        assert_eq!(genome.caps, Capabilities::new(false, false, true));
        let transcript = ps.get(1).unwrap();
        assert_eq!(transcript.memory, rig.seq(&["inc", "inc"]));
        assert!(transcript.caps.executable);
        assert_eq!(transcript.thread.heads[HEAD_READ], Head::at(0, 0));
    }

    #[test]
    fn test_implicit_transcript_length_cap() {
        let config = HardwareConfig { implicit_max_programid_length: 3, ..implicit() };
        let mut names = vec!["promoter"];
        names.extend(["inc"; 9]);
        let rig = Rig::new(config, &names);
        assert_eq!(rig.hw.programids().get(1).unwrap().memory.len(), 3);
    }

    #[test]
    fn test_activation_moves_promoter() {
        let mut names = vec!["promoter", "h-activate", "nop-A", "terminator", "nop-B"];
        names.extend(["dec"; 15]);
        let mut rig = Rig::new(implicit(), &names);
        rig.step(1);

        let promoters = rig.hw.promoters.as_ref().unwrap();
        // Label nop-A complements to nop-B, matched at 4. The window covers
        // 19 and 0..=9; the new promoter sits right after the label.
        assert_eq!(rig.head_of(1, HEAD_WRITE), Head::at(4, 0));
        assert_eq!(rig.head_of(1, HEAD_FLOW), Head::at(5, 0));
        assert_eq!(promoters.occupied[4], ACTIVATED);
        assert_eq!(promoters.occupied[19], REPRESSED);
        assert_eq!(promoters.occupied[0], REPRESSED);
        assert_eq!(promoters.occupied[10], NEUTRAL);
        assert_eq!(promoters.rates[0], 0.0);
        assert_eq!(promoters.sum, 1.0);
    }

    #[test]
    fn test_removing_regulator_restores_rates() {
        let mut names = vec!["promoter", "h-repress", "nop-A", "end", "terminator", "nop-B"];
        names.extend(["dec"; 14]);
        let mut rig = Rig::new(implicit(), &names);
        rig.step(1);
        assert_eq!(rig.hw.promoters.as_ref().unwrap().sum, 0.0);
        rig.step(1);
        // The transcript ended and was removed, lifting the repression.
        let promoters = rig.hw.promoters.as_ref().unwrap();
        assert!(promoters.occupied.iter().all(|&o| o == NEUTRAL));
        assert_eq!(promoters.sum, 1.0);
    }

    #[test]
    fn test_implicit_allocate_and_divide() {
        let mut names = vec!["promoter", "i-alloc", "i-divide", "terminator"];
        names.extend(["nop-A"; 16]);
        let mut rig = Rig::new(implicit(), &names);
        rig.step(1);
        assert_eq!(rig.hw.programids().len(), 3);
        assert_eq!(rig.reg_of(1, REG_BX), 20);
        assert_eq!(rig.head_of(1, HEAD_WRITE), Head::new(2));
        assert_eq!(rig.head_of(1, HEAD_READ), Head::new(0));
        assert_eq!(rig.hw.programids().get(2).unwrap().memory.len(), 40);

        // Stand in for the copy loop.
        let genome = rig.org.genome.clone();
        let target = &mut rig.hw.programids.get_mut(2).unwrap().memory;
        for i in 0..genome.len() {
            target.set(i, genome.get(i));
            target.flags_mut(i).copied = true;
        }
        rig.set_head(1, HEAD_WRITE, Head::at(20, 2));
        rig.step(1);

        assert_eq!(rig.host.0, vec![rig.org.genome.clone()]);
        assert!(rig.org.phenotype.copy_true);
        // Split divide resets to a freshly transcribed state.
        assert_eq!(rig.hw.programids().len(), 2);
    }

    #[test]
    fn test_second_implicit_allocate_faults() {
        let mut names = vec!["promoter", "i-alloc", "terminator"];
        names.extend(["nop-A"; 17]);
        let mut rig = Rig::new(implicit(), &names);
        rig.step(2);
        assert_eq!(rig.org.faults.len(), 1);
        assert_eq!(rig.org.faults[0].message, "Allocate already active");
    }

    #[test]
    fn test_promoter_scan_fires_in_order() {
        let set = InstSet::from_names(HardwareKind::Gx, &GX_NAMES).unwrap();
        let genome = seq(&set, &["promoter", "inc", "promoter", "inc"]);
        let mut promoters = Promoters::new(0, &genome, &set, 0.0);
        assert_eq!(promoters.sum, 2.0);
        assert_eq!(promoters.next_firing(), 0);
        assert_eq!(promoters.next_firing(), 2);
        assert_eq!(promoters.next_firing(), 0);
    }

    #[test]
    fn test_regulatory_match_skips_occupied() {
        let set = InstSet::from_names(HardwareKind::Gx, &GX_NAMES).unwrap();
        let genome = seq(&set, &["nop-B", "inc", "nop-B", "inc"]);
        let mut promoters = Promoters::new(0, &genome, &set, 0.0);
        let label = Label::from_nops(&[1]);
        assert_eq!(promoters.find_regulatory_match(&label, &genome, &set), Some(0));
        promoters.occupied[0] = REPRESSED;
        assert_eq!(promoters.find_regulatory_match(&label, &genome, &set), Some(2));
        assert_eq!(promoters.find_regulatory_match(&Label::new(), &genome, &set), None);
    }

    #[test]
    fn test_status_names_programid() {
        let rig = Rig::new(HardwareConfig::default(), &["inc", "dec"]);
        let status = rig.hw.status(&rig.set);
        assert!(status.starts_with("[0xbr]"), "{}", status);
        assert!(status.contains("programids:1"));
    }
}
