//! Classic heads CPU
//!
//! One memory, one thread. Replication goes allocate, copy through the
//! read and write heads, then divide the copied tail off as the offspring.

use tracing::trace;

use crate::hardware::base::{execute_common, CpuCore, CpuStack, Thread, REG_AX, REG_BX};
use crate::hardware::{
    allocate_main, divide_check_viable, divide_do_mutations, DivideMethod, ExecContext, Hardware, HardwareConfig,
};
use crate::head::{SpaceId, HEAD_IP, HEAD_READ, HEAD_WRITE, NUM_HEADS};
use crate::inst_lib::Op;
use crate::inst_set::InstSet;
use crate::organism::{test_prob, OrgState};
use crate::sequence::{Instruction, Sequence};

/// Per-opcode execution costs still owed.
#[derive(Clone, Debug, Default)]
struct CostTracker {
    ft_costs: Vec<u32>,
    costs: Vec<u32>,
}

impl CostTracker {
    fn new(inst_set: &InstSet) -> Self {
        Self {
            ft_costs: inst_set.entries().iter().map(|e| e.ft_cost).collect(),
            costs: inst_set.entries().iter().map(|e| e.cost).collect(),
        }
    }

    fn reset_first_time(&mut self, inst_set: &InstSet) {
        self.ft_costs = inst_set.entries().iter().map(|e| e.ft_cost).collect();
    }

    /// Pay one cycle toward `inst`. Returns true once it may execute.
    fn pay(&mut self, inst: Instruction, inst_set: &InstSet) -> bool {
        let op = inst.op();
        let mut exec = true;
        if let Some(ft) = self.ft_costs.get_mut(op) {
            if *ft > 0 {
                *ft -= 1;
                exec = false;
            }
        }
        let cost = inst_set.cost(inst);
        if cost > 0 {
            if let Some(cur) = self.costs.get_mut(op) {
                if *cur > 1 {
                    *cur -= 1;
                    exec = false;
                } else {
                    *cur = cost;
                }
            }
        }
        exec
    }
}

pub struct HardwareCpu {
    memory: Sequence,
    thread: Thread,
    global_stack: CpuStack,
    mal_active: bool,
    advance_ip: bool,
    costs: CostTracker,
    /// Memory contents cut off by the last divide
    necro_tail: Vec<Instruction>,
}

const SPACE: SpaceId = 0;

impl HardwareCpu {
    pub fn new(org: &OrgState, inst_set: &InstSet, config: &HardwareConfig) -> Self {
        let mut hw = Self {
            memory: Sequence::new(),
            thread: Thread::new(SPACE),
            global_stack: CpuStack::new(),
            mal_active: false,
            advance_ip: true,
            costs: CostTracker::default(),
            necro_tail: Vec::new(),
        };
        hw.reset(org, inst_set, config);
        hw
    }

    fn adjust_heads(&mut self) {
        for head in 0..NUM_HEADS {
            self.adjust_head(head);
        }
    }

    fn execute(&mut self, inst: Instruction, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        let ip = self.head(HEAD_IP);
        self.mark_executed(ip);
        let op = ctx.inst_set.op(inst);
        let ok = match execute_common(self, op, org, ctx) {
            Some(ok) => ok,
            None => self.execute_specific(op, org, ctx),
        };
        trace!(pos = ip.pos, inst = ctx.inst_set.name(inst), ok, "cpu step");
        ok
    }

    fn execute_specific(&mut self, op: Op, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        match op {
            Op::MaxAlloc => {
                let cur_size = self.memory.len() as i32;
                let max_len = ctx.config.max_genome_length as i32;
                let alloc_size = ((ctx.config.child_size_range * cur_size as f64) as i32).min(max_len - cur_size);
                if self.allocate(alloc_size, org, ctx) {
                    self.set_reg(REG_AX, cur_size);
                    true
                } else {
                    false
                }
            }
            Op::Allocate => {
                let size = self.memory.len() as i32;
                if self.allocate(self.reg(REG_BX), org, ctx) {
                    self.set_reg(REG_AX, size);
                    true
                } else {
                    false
                }
            }
            Op::CAlloc => self.allocate(self.memory.len() as i32, org, ctx),
            Op::Divide => self.divide_main(self.reg(REG_AX), 0, org, ctx),
            Op::CDivide => self.divide_main(self.memory.len() as i32 / 2, 0, org, ctx),
            Op::HeadDivide => {
                self.adjust_heads();
                let divide_pos = self.head(HEAD_READ).pos;
                let mut child_end = self.head(HEAD_WRITE).pos;
                if child_end == 0 {
                    child_end = self.memory.len() as i32;
                }
                let extra_lines = self.memory.len() as i32 - child_end;
                let ok = self.divide_main(divide_pos, extra_lines, org, ctx);
                self.adjust_heads();
                ok
            }
            Op::Repro => self.repro(org, ctx),
            _ => false,
        }
    }

    fn allocate(&mut self, size: i32, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        allocate_main(
            &mut self.memory,
            size,
            &mut self.mal_active,
            &self.necro_tail,
            org,
            ctx.inst_set,
            ctx.config,
            ctx.rng,
        )
    }

    /// Split memory at `div_point`, dropping `extra_lines` from the end, and
    /// hand the middle over as the offspring.
    fn divide_main(&mut self, div_point: i32, extra_lines: i32, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        let child_size = self.memory.len() as i32 - div_point - extra_lines;
        let memory = &self.memory;
        let viable = divide_check_viable(org, ctx.config, div_point, child_size, |parent, child| {
            let executed = memory.count_executed(parent);
            let copied = (parent..parent + child).filter(|&i| memory.flags(i).copied).count();
            (executed, copied)
        });
        if !viable {
            return false;
        }

        let div = div_point as usize;
        org.offspring = self.memory.crop(div, div + child_size as usize);
        self.necro_tail = self.memory.insts()[div..].to_vec();
        self.memory.resize(div, ctx.inst_set.default_inst());
        divide_do_mutations(org, ctx.inst_set, ctx.config, ctx.rng);

        self.mal_active = false;
        self.finish_divide(org, ctx);
        true
    }

    /// Copy the whole memory as the offspring in one step.
    fn repro(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
        org.offspring = Sequence::from_insts(self.memory.insts().to_vec());
        org.phenotype.copied_size = self.memory.len();
        org.phenotype.executed_size = self.memory.count_executed(self.memory.len());

        if org.mut_rates.copy_mut_prob > 0.0 {
            for i in 0..org.offspring.len() {
                if org.test_copy_mut(ctx.rng) {
                    let inst = ctx.inst_set.random_inst(ctx.rng);
                    org.offspring.set(i, inst);
                }
            }
        }
        divide_do_mutations(org, ctx.inst_set, ctx.config, ctx.rng);
        self.costs.reset_first_time(ctx.inst_set);
        self.finish_divide(org, ctx);
        true
    }

    /// Hand the offspring to the host. A split divide restarts a surviving
    /// parent at its first instruction, which must run next cycle.
    fn finish_divide(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) {
        let split = ctx.config.divide_method == DivideMethod::Split;
        let parent_alive = org.activate_divide(ctx.host);
        if parent_alive && split {
            self.reset(org, ctx.inst_set, ctx.config);
        }
        if split {
            self.advance_ip = false;
        }
    }
}

impl CpuCore for HardwareCpu {
    fn thread(&self) -> &Thread {
        &self.thread
    }

    fn thread_mut(&mut self) -> &mut Thread {
        &mut self.thread
    }

    fn global_stack_mut(&mut self) -> &mut CpuStack {
        &mut self.global_stack
    }

    fn space(&self, _space: SpaceId) -> Option<&Sequence> {
        Some(&self.memory)
    }

    fn space_mut(&mut self, _space: SpaceId) -> Option<&mut Sequence> {
        Some(&mut self.memory)
    }

    fn set_advance_ip(&mut self, advance: bool) {
        self.advance_ip = advance;
    }
}

impl Hardware for HardwareCpu {
    fn reset(&mut self, org: &OrgState, inst_set: &InstSet, _config: &HardwareConfig) {
        self.memory = Sequence::from_insts(org.genome.insts().to_vec());
        self.thread.reset(SPACE);
        self.global_stack.clear();
        self.mal_active = false;
        self.costs = CostTracker::new(inst_set);
    }

    fn single_process(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>) {
        org.phenotype.time_used += 1;
        self.advance_ip = true;
        self.adjust_head(HEAD_IP);

        if self.memory.is_empty() {
            org.die();
            return;
        }

        let is = ctx.inst_set;
        ctx.trace_with(|| self.status(is));

        let inst = self.memory.get(self.head(HEAD_IP).index());
        if self.costs.pay(inst, is) {
            let addl_time_cost = is.addl_time_cost(inst);
            if !test_prob(is.prob_fail(inst), ctx.rng) {
                self.execute(inst, org, ctx);
            }
            if self.advance_ip {
                self.advance_head(HEAD_IP);
            }
            org.phenotype.time_used += addl_time_cost as u64;
        }
        org.phenotype.cpu_cycles_used += 1;

        let max_executed = ctx.config.max_executed;
        if (max_executed > 0 && org.phenotype.time_used >= max_executed) || org.phenotype.to_die {
            org.die();
        }
    }

    fn memory(&self) -> &Sequence {
        &self.memory
    }

    fn status(&self, inst_set: &InstSet) -> String {
        let ip = self.thread.heads[HEAD_IP];
        let inst = if self.memory.is_empty() { "(empty)" } else { inst_set.name(self.memory.get(ip.index())) };
        format!(
            "{:>4} {:<10} {} mem:{}{}",
            ip.pos,
            inst,
            self.thread.status(),
            self.memory.len(),
            if self.mal_active { " alloc" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{LogicNine, FIXED_INPUTS};
    use crate::hardware::base::REG_CX;
    use crate::inst_lib::HardwareKind;
    use crate::organism::{FaultLocation, MutationRates, OrganismHost, PhenotypeConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Keeps offspring; the parent always survives.
    #[derive(Default)]
    struct Nursery(Vec<Sequence>);

    impl OrganismHost for Nursery {
        fn activate_divide(&mut self, _parent: &mut OrgState, offspring: Sequence) -> bool {
            self.0.push(offspring);
            true
        }
    }

    const REPLICATOR: [&str; 15] = [
        "h-alloc", "h-search", "nop-C", "nop-A", "mov-head", "nop-C", "h-search", "h-copy", "if-label", "nop-C",
        "nop-A", "h-divide", "mov-head", "nop-A", "nop-B",
    ];

    struct Rig {
        set: InstSet,
        config: HardwareConfig,
        env: LogicNine,
        host: Nursery,
        rng: StdRng,
        org: OrgState,
        cpu: HardwareCpu,
    }

    impl Rig {
        fn new(names: &[&str]) -> Self {
            Self::with(InstSet::default_for(HardwareKind::Cpu), HardwareConfig::default(), names)
        }

        fn with(set: InstSet, config: HardwareConfig, names: &[&str]) -> Self {
            let genome = Sequence::from_insts(names.iter().map(|n| set.inst_by_name(n).unwrap()).collect());
            let org = OrgState::new(genome, 9, PhenotypeConfig::default(), MutationRates::none(), FIXED_INPUTS.to_vec());
            let cpu = HardwareCpu::new(&org, &set, &config);
            Self { set, config, env: LogicNine::new(), host: Nursery::default(), rng: StdRng::seed_from_u64(1), org, cpu }
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
                self.cpu.single_process(&mut self.org, &mut ctx);
            }
        }
    }

    fn cpu_set(names: &[&str]) -> InstSet {
        InstSet::from_names(HardwareKind::Cpu, names).unwrap()
    }

    #[test]
    fn test_replicator_divides_true() {
        let mut rig = Rig::new(&REPLICATOR);
        let mut cycles = 0;
        while rig.org.phenotype.num_divides == 0 && cycles < 500 {
            rig.step(1);
            cycles += 1;
        }
        assert_eq!(cycles, 49);
        assert!(rig.org.faults.is_empty(), "{:?}", rig.org.faults);
        assert_eq!(rig.host.0.len(), 1);
        assert_eq!(rig.host.0[0], rig.org.genome);
        let p = &rig.org.phenotype;
        assert!(p.copy_true);
        assert_eq!(p.executed_size, 12);
        assert_eq!(p.copied_size, 15);
        assert_eq!(p.gestation_time, 49);
        assert_eq!(p.merit, 12.0);
        // Split divide resets the parent.
        assert_eq!(rig.cpu.memory().len(), 15);
        assert_eq!(rig.cpu.head(HEAD_IP).pos, 0);
    }

    #[test]
    fn test_replicator_second_generation_matches() {
        let mut rig = Rig::new(&REPLICATOR);
        rig.step(98);
        assert_eq!(rig.org.phenotype.num_divides, 2);
        assert_eq!(rig.host.0[0], rig.host.0[1]);
    }

    #[test]
    fn test_if_n_equ_skips_when_equal() {
        let mut rig = Rig::new(&["if-n-equ", "inc", "inc", "shift-l"]);
        rig.step(2);
        // BX == CX == 0 so the first inc was skipped.
        assert_eq!(rig.cpu.reg(REG_BX), 1);
    }

    #[test]
    fn test_nop_modifies_register() {
        let mut rig = Rig::new(&["inc", "nop-C", "inc", "nop-A", "nop-B"]);
        rig.step(2);
        assert_eq!(rig.cpu.reg(REG_CX), 1);
        assert_eq!(rig.cpu.reg(REG_AX), 1);
        assert_eq!(rig.cpu.reg(REG_BX), 0);
    }

    #[test]
    fn test_stack_roundtrip_through_registers() {
        let mut rig = Rig::new(&["inc", "inc", "push", "pop", "nop-C", "nop-A"]);
        rig.step(4);
        assert_eq!(rig.cpu.reg(REG_CX), 2);
    }

    #[test]
    fn test_divide_by_zero_faults() {
        let set = cpu_set(&["nop-A", "nop-B", "nop-C", "div", "mod"]);
        let mut rig = Rig::with(set, HardwareConfig::default(), &["div", "mod", "nop-A", "nop-A"]);
        rig.step(2);
        let faults: Vec<_> = rig.org.faults.iter().map(|f| f.message.as_str()).collect();
        assert_eq!(faults, vec!["div: dividing by 0", "mod: modding by 0"]);
        assert!(rig.org.faults.iter().all(|f| f.location == FaultLocation::Math));
        // Faults never stop the IP; mod also consumed its nop modifier.
        assert_eq!(rig.cpu.head(HEAD_IP).pos, 3);
    }

    #[test]
    fn test_jump_without_complement_faults() {
        let set = cpu_set(&["nop-A", "nop-B", "nop-C", "jump-f", "inc"]);
        let mut rig = Rig::with(set, HardwareConfig::default(), &["jump-f", "nop-A", "inc", "inc"]);
        rig.step(1);
        assert_eq!(rig.org.faults[0].message, "jump-f: No complement label");
    }

    #[test]
    fn test_jump_to_complement() {
        let set = cpu_set(&["nop-A", "nop-B", "nop-C", "jump-f", "inc"]);
        let names = ["jump-f", "nop-A", "inc", "inc", "nop-B", "inc"];
        let mut rig = Rig::with(set, HardwareConfig::default(), &names);
        rig.step(2);
        // Landed on the nop-B, then ran the final inc.
        assert_eq!(rig.cpu.reg(REG_BX), 1);
        assert!(rig.org.faults.is_empty());
    }

    #[test]
    fn test_set_num_reads_label() {
        let set = cpu_set(&["nop-A", "nop-B", "nop-C", "set-num"]);
        let mut rig = Rig::with(set, HardwareConfig::default(), &["set-num", "nop-B", "nop-C", "nop-A"]);
        rig.step(1);
        // Base-3 digits 1, 2, 0.
        assert_eq!(rig.cpu.reg(REG_BX), 15);
    }

    #[test]
    fn test_io_rewards_not() {
        let set = cpu_set(&["nop-A", "nop-B", "nop-C", "IO", "not", "inc"]);
        let mut rig = Rig::with(set, HardwareConfig::default(), &["IO", "not", "IO", "inc", "inc"]);
        rig.step(3);
        assert_eq!(rig.org.phenotype.cur_task_count[0], 1);
        assert_eq!(rig.org.phenotype.cur_bonus, 2.0);
    }

    #[test]
    fn test_double_allocate_faults() {
        let mut rig = Rig::new(&["h-alloc", "h-alloc", "nop-A", "nop-A", "nop-A", "nop-A", "nop-A", "nop-A"]);
        rig.step(2);
        assert_eq!(rig.cpu.memory().len(), 24);
        assert_eq!(rig.org.faults[0].location, FaultLocation::Allocate);
        assert_eq!(rig.org.faults[0].message, "Allocate already active");
    }

    #[test]
    fn test_early_divide_rejected_without_state_change() {
        let genome = ["h-alloc", "h-divide", "nop-A", "nop-A", "nop-A", "nop-A", "nop-A", "nop-A", "nop-A", "nop-A"];
        let mut rig = Rig::new(&genome);
        rig.step(2);
        // Nothing was copied yet.
        assert_eq!(rig.org.phenotype.num_divides, 0);
        assert!(rig.host.0.is_empty());
        assert_eq!(rig.org.faults.len(), 1);
        assert_eq!(rig.cpu.memory().len(), 30);
    }

    #[test]
    fn test_repro_copies_memory() {
        let set = cpu_set(&["nop-A", "nop-B", "nop-C", "repro", "inc"]);
        let names = ["inc", "inc", "inc", "inc", "inc", "inc", "inc", "repro"];
        let mut rig = Rig::with(set, HardwareConfig::default(), &names);
        rig.step(8);
        assert_eq!(rig.host.0.len(), 1);
        assert_eq!(rig.host.0[0], rig.org.genome);
        assert_eq!(rig.org.phenotype.executed_size, 8);
        // The parent restarts on its first inc.
        assert_eq!(rig.cpu.head(HEAD_IP).pos, 0);
        rig.step(1);
        assert_eq!(rig.cpu.reg(REG_BX), 1);
        rig.step(7);
        assert_eq!(rig.host.0.len(), 2);
        assert_eq!(rig.host.0[0], rig.host.0[1]);
    }

    #[test]
    fn test_birth_divide_keeps_running() {
        let config = HardwareConfig { divide_method: DivideMethod::Birth, ..Default::default() };
        let mut rig = Rig::with(InstSet::default_for(HardwareKind::Cpu), config, &REPLICATOR);
        rig.step(49);
        assert_eq!(rig.org.phenotype.num_divides, 1);
        // No reset: the IP moved on past h-divide.
        assert_eq!(rig.cpu.head(HEAD_IP).pos, 12);
    }

    #[test]
    fn test_first_time_cost_delays_execution() {
        let text = "nop-A 1\nnop-B 1\nnop-C 1\ninc 1 0 3\n";
        let set = InstSet::load_str(HardwareKind::Cpu, text).unwrap();
        let mut rig = Rig::with(set, HardwareConfig::default(), &["inc", "inc"]);
        rig.step(3);
        assert_eq!(rig.cpu.reg(REG_BX), 0);
        assert_eq!(rig.cpu.head(HEAD_IP).pos, 0);
        rig.step(1);
        assert_eq!(rig.cpu.reg(REG_BX), 1);
    }

    #[test]
    fn test_instruction_budget_kills() {
        let config = HardwareConfig { max_executed: 5, ..Default::default() };
        let mut rig = Rig::with(InstSet::default_for(HardwareKind::Cpu), config, &["inc", "dec"]);
        rig.step(4);
        assert!(!rig.org.is_dead());
        rig.step(1);
        assert!(rig.org.is_dead());
    }

    #[test]
    fn test_status_line() {
        let rig = Rig::new(&REPLICATOR);
        let s = rig.cpu.status(&rig.set);
        assert!(s.contains("h-alloc"));
        assert!(s.contains("mem:15"));
    }
}
