//! Execution core shared by both hardware types
//!
//! A [`Thread`] is one instruction stream: three registers, four heads, a
//! local stack and the label buffers. [`CpuCore`] is implemented by each
//! hardware to expose its current thread and memory spaces; in return it
//! gets label reading, template search, and every instruction whose meaning
//! does not depend on how memory is organised (see [`execute_common`]).

use std::fmt::Write as _;

use crate::hardware::{copy_with_mutation, ExecContext};
use crate::head::{head_name, Head, SpaceId, HEAD_FLOW, HEAD_IP, HEAD_READ, HEAD_WRITE, NUM_HEADS};
use crate::inst_lib::{Op, NUM_NOPS};
use crate::inst_set::InstSet;
use crate::label::Label;
use crate::organism::{FaultKind, FaultLocation, OrgState};
use crate::sequence::{Instruction, Sequence};

pub const NUM_REGISTERS: usize = 3;
pub const REG_AX: usize = 0;
pub const REG_BX: usize = 1;
pub const REG_CX: usize = 2;

pub const STACK_SIZE: usize = 10;

/// Fixed-depth ring stack. Popping an empty slot yields 0.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuStack {
    values: [i32; STACK_SIZE],
    sp: usize,
}

impl CpuStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: i32) {
        self.sp = (self.sp + STACK_SIZE - 1) % STACK_SIZE;
        self.values[self.sp] = value;
    }

    pub fn pop(&mut self) -> i32 {
        let value = self.values[self.sp];
        self.values[self.sp] = 0;
        self.sp = (self.sp + 1) % STACK_SIZE;
        value
    }

    pub fn top(&self) -> i32 {
        self.values[self.sp]
    }

    /// Reverse the order of every slot, empty ones included.
    pub fn flip(&mut self) {
        let mut popped = [0; STACK_SIZE];
        for v in popped.iter_mut() {
            *v = self.pop();
        }
        for v in popped {
            self.push(v);
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Values from the top down.
    #[cfg(test)]
    pub fn values(&self) -> impl Iterator<Item = i32> + '_ {
        (0..STACK_SIZE).map(move |i| self.values[(self.sp + i) % STACK_SIZE])
    }
}

/// One instruction stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Thread {
    pub regs: [i32; NUM_REGISTERS],
    pub heads: [Head; NUM_HEADS],
    pub stack: CpuStack,
    /// 0 = local stack, 1 = global stack
    pub cur_stack: usize,
    /// Label most recently read after an instruction
    pub next_label: Label,
    /// Nops most recently copied by the read head
    pub read_label: Label,
}

impl Thread {
    pub fn new(space: SpaceId) -> Self {
        Self {
            regs: [0; NUM_REGISTERS],
            heads: [Head::new(space); NUM_HEADS],
            stack: CpuStack::new(),
            cur_stack: 0,
            next_label: Label::new(),
            read_label: Label::new(),
        }
    }

    pub fn reset(&mut self, space: SpaceId) {
        *self = Self::new(space);
    }

    /// Send every head back to the start of `space`.
    pub fn reset_heads(&mut self, space: SpaceId) {
        self.heads = [Head::new(space); NUM_HEADS];
    }

    /// Registers, heads and the top of the active stack on one line.
    pub fn status(&self) -> String {
        let mut out = format!("AX:{} BX:{} CX:{}", self.regs[REG_AX], self.regs[REG_BX], self.regs[REG_CX]);
        for (i, head) in self.heads.iter().enumerate() {
            let _ = write!(out, " {}:{}@{}", head_name(i), head.pos, head.space);
        }
        let _ = write!(out, " stk{}:{}", self.cur_stack, self.stack.top());
        out
    }
}

#[inline]
pub fn next_register(reg: usize) -> usize {
    (reg + 1) % NUM_REGISTERS
}

/// Value modulo `size`, always non-negative.
#[inline]
fn positive_mod(value: i32, size: usize) -> i32 {
    value.rem_euclid(size.max(1) as i32)
}

fn label_matches_at(label: &Label, mem: &Sequence, inst_set: &InstSet, offset: usize) -> bool {
    (0..label.len()).all(|i| label.get(i) as usize == inst_set.nop_mod(mem.get(offset + i)))
}

/// Search forward for `label` inside a run of nops after `pos`.
///
/// Returns the position just past the matching nops. A match may sit
/// inside a longer run of nops.
pub fn find_label_forward(label: &Label, mem: &Sequence, inst_set: &InstSet, pos: usize) -> Option<usize> {
    let label_size = label.len();
    let len = mem.len();
    let search_start = pos;
    let mut pos = pos + label_size;

    while pos < len {
        if inst_set.is_nop(mem.get(pos)) {
            let mut start = pos;
            while start > search_start && inst_set.is_nop(mem.get(start - 1)) {
                start -= 1;
            }
            let mut end = pos + 1;
            while end < len && inst_set.is_nop(mem.get(end)) {
                end += 1;
            }
            if end - start >= label_size {
                if let Some(offset) = (start..=end - label_size).find(|&o| label_matches_at(label, mem, inst_set, o)) {
                    return Some(offset + label_size);
                }
            }
            pos = end;
        }
        pos += label_size;
    }
    None
}

/// Search backward for `label` before `pos`, which sits one label length
/// before the searching instruction.
///
/// Returns the position just past the run of nops holding the match.
pub fn find_label_backward(label: &Label, mem: &Sequence, inst_set: &InstSet, pos: i32) -> Option<usize> {
    let label_size = label.len() as i32;
    let search_start = pos;
    let mut pos = pos - label_size;

    while pos >= 0 {
        if inst_set.is_nop(mem.get(pos as usize)) {
            let mut start = pos;
            while start > 0 && inst_set.is_nop(mem.get(start as usize - 1)) {
                start -= 1;
            }
            let mut end = pos + 1;
            while end < search_start && inst_set.is_nop(mem.get(end as usize)) {
                end += 1;
            }
            if end - start >= label_size {
                let found = (start..=end - label_size)
                    .any(|o| label_matches_at(label, mem, inst_set, o as usize));
                if found {
                    return Some(end as usize);
                }
            }
            pos = start - 1;
        }
        pos -= label_size;
    }
    None
}

/// Access a hardware gives the shared instruction handlers.
pub trait CpuCore {
    fn thread(&self) -> &Thread;
    fn thread_mut(&mut self) -> &mut Thread;
    fn global_stack_mut(&mut self) -> &mut CpuStack;

    /// Memory addressed by a head's space id, if that space exists.
    fn space(&self, space: SpaceId) -> Option<&Sequence>;
    fn space_mut(&mut self, space: SpaceId) -> Option<&mut Sequence>;

    /// Whether other code may read from `space`.
    fn is_readable(&self, _space: SpaceId) -> bool {
        true
    }

    fn set_advance_ip(&mut self, advance: bool);

    fn space_len(&self, space: SpaceId) -> usize {
        self.space(space).map_or(0, Sequence::len)
    }

    fn reg(&self, reg: usize) -> i32 {
        self.thread().regs[reg]
    }

    fn set_reg(&mut self, reg: usize, value: i32) {
        self.thread_mut().regs[reg] = value;
    }

    fn head(&self, head: usize) -> Head {
        self.thread().heads[head]
    }

    fn adjust_head(&mut self, head: usize) {
        let len = self.space_len(self.head(head).space);
        self.thread_mut().heads[head].adjust(len);
    }

    fn advance_head(&mut self, head: usize) {
        let len = self.space_len(self.head(head).space);
        self.thread_mut().heads[head].advance(len);
    }

    /// Move a head within its current space.
    fn set_head_pos(&mut self, head: usize, pos: i32) {
        let len = self.space_len(self.head(head).space);
        self.thread_mut().heads[head].set(pos, len);
    }

    fn jump_head(&mut self, head: usize, offset: i32) {
        let len = self.space_len(self.head(head).space);
        self.thread_mut().heads[head].jump(offset, len);
    }

    /// Point a head at `target`, possibly in another space.
    fn move_head(&mut self, head: usize, target: Head) {
        let mut target = target;
        target.adjust(self.space_len(target.space));
        self.thread_mut().heads[head] = target;
    }

    fn inst_at(&self, head: Head) -> Option<Instruction> {
        let mem = self.space(head.space)?;
        if mem.is_empty() {
            return None;
        }
        let mut head = head;
        head.adjust(mem.len());
        Some(mem.get(head.index()))
    }

    fn next_inst(&self) -> Option<Instruction> {
        let ip = self.head(HEAD_IP);
        let mem = self.space(ip.space)?;
        if mem.is_empty() {
            return None;
        }
        Some(mem.get(ip.next_index(mem.len())))
    }

    fn mark_executed(&mut self, head: Head) {
        if let Some(mem) = self.space_mut(head.space) {
            if !mem.is_empty() {
                let mut head = head;
                head.adjust(mem.len());
                mem.flags_mut(head.index()).executed = true;
            }
        }
    }

    /// A head at `pos` in the IP's memory.
    fn ip_relative(&self, pos: i32) -> Head {
        let space = self.head(HEAD_IP).space;
        let mut head = Head::at(pos, space);
        head.adjust(self.space_len(space));
        head
    }

    fn next_is_nop(&self, inst_set: &InstSet) -> bool {
        self.next_inst().is_some_and(|i| inst_set.is_nop(i))
    }

    /// Step the IP onto a following nop and return its modifier.
    fn consume_nop(&mut self, inst_set: &InstSet) -> Option<usize> {
        if !self.next_is_nop(inst_set) {
            return None;
        }
        self.advance_head(HEAD_IP);
        let ip = self.head(HEAD_IP);
        self.mark_executed(ip);
        self.inst_at(ip).map(|i| inst_set.nop_mod(i))
    }

    fn find_modified_register(&mut self, default: usize, inst_set: &InstSet) -> usize {
        self.consume_nop(inst_set).unwrap_or(default)
    }

    fn find_modified_head(&mut self, default: usize, inst_set: &InstSet) -> usize {
        self.consume_nop(inst_set).unwrap_or(default)
    }

    /// Read the nops following the IP into the thread's label.
    fn read_label(&mut self, inst_set: &InstSet, max_size: usize, max_exe_size: usize) {
        let mut label = Label::new();
        while label.len() < max_size && self.next_is_nop(inst_set) {
            self.advance_head(HEAD_IP);
            let ip = self.head(HEAD_IP);
            if let Some(inst) = self.inst_at(ip) {
                label.add_nop(inst_set.nop_mod(inst));
            }
            if label.len() <= max_exe_size {
                self.mark_executed(ip);
            }
        }
        self.thread_mut().next_label = label;
    }

    /// Track the nops passing under the read head.
    fn read_inst(&mut self, inst: Instruction, inst_set: &InstSet) {
        let read_label = &mut self.thread_mut().read_label;
        if inst_set.is_nop(inst) {
            read_label.add_nop(inst_set.nop_mod(inst));
        } else {
            read_label.clear();
        }
    }

    /// Locate the complement of the current label.
    ///
    /// `direction < 0` searches backward from the IP, `> 0` forward from the
    /// IP and `0` forward from the start of memory. An empty label finds the
    /// IP itself. The returned head sits on the last nop of the match.
    fn find_label(&self, direction: i32, inst_set: &InstSet) -> Option<Head> {
        let ip = self.head(HEAD_IP);
        let label = &self.thread().next_label;
        if label.is_empty() {
            return Some(ip);
        }
        let mem = self.space(ip.space)?;
        let found = match direction {
            d if d < 0 => find_label_backward(label, mem, inst_set, ip.pos - label.len() as i32),
            d if d > 0 => find_label_forward(label, mem, inst_set, ip.index()),
            _ => find_label_forward(label, mem, inst_set, 0),
        }?;
        let mut head = ip;
        head.set(found as i32 - 1, mem.len());
        Some(head)
    }

    fn stack_push(&mut self, value: i32) {
        if self.thread().cur_stack == 0 {
            self.thread_mut().stack.push(value);
        } else {
            self.global_stack_mut().push(value);
        }
    }

    fn stack_pop(&mut self) -> i32 {
        if self.thread().cur_stack == 0 {
            self.thread_mut().stack.pop()
        } else {
            self.global_stack_mut().pop()
        }
    }

    fn switch_stack(&mut self) {
        let thread = self.thread_mut();
        thread.cur_stack = 1 - thread.cur_stack;
    }

    fn flip_stack(&mut self) {
        if self.thread().cur_stack == 0 {
            self.thread_mut().stack.flip();
        } else {
            self.global_stack_mut().flip();
        }
    }

    /// Write `inst` at `head`, applying a copy mutation and the copy flags.
    fn write_copied(&mut self, head: Head, inst: Instruction, org: &OrgState, ctx: &mut ExecContext<'_>) -> bool {
        let (inst, mutated) = copy_with_mutation(inst, org.mut_rates.copy_mut_prob, ctx.inst_set, ctx.rng);
        let Some(mem) = self.space_mut(head.space) else {
            return false;
        };
        if mem.is_empty() {
            return false;
        }
        let mut head = head;
        head.adjust(mem.len());
        let pos = head.index();
        mem.set(pos, inst);
        let flags = mem.flags_mut(pos);
        flags.mutated = mutated;
        flags.copy_mut = mutated;
        flags.copied = true;
        true
    }
}

/// Execute an instruction both hardware types understand.
///
/// Returns `None` when `op` is hardware specific.
pub fn execute_common<C: CpuCore + ?Sized>(
    cpu: &mut C,
    op: Op,
    org: &mut OrgState,
    ctx: &mut ExecContext<'_>,
) -> Option<bool> {
    let is = ctx.inst_set;
    let ok = match op {
        Op::Nop | Op::NopX | Op::Null => true,
        Op::MarkProgramid | Op::MarkReadable | Op::MarkBindable | Op::MarkExecutable => true,
        Op::Promoter | Op::Terminator => true,

        Op::IfEqu0 => if_zero(cpu, is, |v| v == 0),
        Op::IfNot0 => if_zero(cpu, is, |v| v != 0),
        Op::IfGr0 => if_zero(cpu, is, |v| v > 0),
        Op::IfGrEqu0 => if_zero(cpu, is, |v| v >= 0),
        Op::IfLess0 => if_zero(cpu, is, |v| v < 0),
        Op::IfLsEqu0 => if_zero(cpu, is, |v| v <= 0),
        Op::IfNEqu => if_compare(cpu, is, |a, b| a != b),
        Op::IfEqu => if_compare(cpu, is, |a, b| a == b),
        Op::IfGr => if_compare(cpu, is, |a, b| a > b),
        Op::IfGrEqu => if_compare(cpu, is, |a, b| a >= b),
        Op::IfLess => if_compare(cpu, is, |a, b| a < b),
        Op::IfLsEqu => if_compare(cpu, is, |a, b| a <= b),
        Op::IfANotEqB => if_fixed(cpu, REG_AX, REG_BX),
        Op::IfBNotEqC => if_fixed(cpu, REG_BX, REG_CX),
        Op::IfANotEqC => if_fixed(cpu, REG_AX, REG_CX),
        Op::IfBit1 => {
            let reg = cpu.find_modified_register(REG_BX, is);
            if cpu.reg(reg) & 1 == 0 {
                cpu.advance_head(HEAD_IP);
            }
            true
        }

        Op::JumpF => jump_to_label(cpu, org, ctx, 1),
        Op::JumpB => jump_to_label(cpu, org, ctx, -1),
        Op::Call => {
            let location = cpu.head(HEAD_IP).pos;
            cpu.stack_push(location);
            jump_to_label(cpu, org, ctx, 1)
        }
        Op::Return => {
            let pos = cpu.stack_pop();
            cpu.set_head_pos(HEAD_IP, pos);
            true
        }

        Op::Pop => {
            let reg = cpu.find_modified_register(REG_BX, is);
            let value = cpu.stack_pop();
            cpu.set_reg(reg, value);
            true
        }
        Op::Push => {
            let reg = cpu.find_modified_register(REG_BX, is);
            cpu.stack_push(cpu.reg(reg));
            true
        }
        Op::PopA => pop_into(cpu, REG_AX),
        Op::PopB => pop_into(cpu, REG_BX),
        Op::PopC => pop_into(cpu, REG_CX),
        Op::PushA => push_from(cpu, REG_AX),
        Op::PushB => push_from(cpu, REG_BX),
        Op::PushC => push_from(cpu, REG_CX),
        Op::SwitchStack => {
            cpu.switch_stack();
            true
        }
        Op::FlipStack => {
            cpu.flip_stack();
            true
        }

        Op::Swap => {
            let op1 = cpu.find_modified_register(REG_BX, is);
            swap_regs(cpu, op1, next_register(op1))
        }
        Op::SwapAB => swap_regs(cpu, REG_AX, REG_BX),
        Op::SwapBC => swap_regs(cpu, REG_BX, REG_CX),
        Op::SwapAC => swap_regs(cpu, REG_AX, REG_CX),
        Op::CopyReg => {
            let src = cpu.find_modified_register(REG_BX, is);
            copy_reg(cpu, src, next_register(src))
        }
        Op::CopyRegAB => copy_reg(cpu, REG_BX, REG_AX),
        Op::CopyRegAC => copy_reg(cpu, REG_CX, REG_AX),
        Op::CopyRegBA => copy_reg(cpu, REG_AX, REG_BX),
        Op::CopyRegBC => copy_reg(cpu, REG_CX, REG_BX),
        Op::CopyRegCA => copy_reg(cpu, REG_AX, REG_CX),
        Op::CopyRegCB => copy_reg(cpu, REG_BX, REG_CX),

        Op::ShiftR => unary(cpu, is, |v| v >> 1),
        Op::ShiftL => unary(cpu, is, |v| v << 1),
        Op::Bit1 => unary(cpu, is, |v| v | 1),
        Op::Inc => unary(cpu, is, |v| v.wrapping_add(1)),
        Op::Dec => unary(cpu, is, |v| v.wrapping_sub(1)),
        Op::Zero => unary(cpu, is, |_| 0),
        Op::Neg => unary(cpu, is, i32::wrapping_neg),
        Op::Square => unary(cpu, is, |v| v.wrapping_mul(v)),
        Op::Not => unary(cpu, is, |v| !v),
        Op::Sqrt => unary_checked(cpu, org, is, "sqrt", |v| match v {
            v if v > 1 => Some((v as f64).sqrt() as i32),
            v if v < 0 => None,
            v => Some(v),
        }),
        Op::Log => unary_checked(cpu, org, is, "log", |v| match v {
            v if v >= 1 => Some((v as f64).ln() as i32),
            v if v < 0 => None,
            v => Some(v),
        }),
        Op::Log10 => unary_checked(cpu, org, is, "log10", |v| match v {
            v if v >= 1 => Some((v as f64).log10() as i32),
            v if v < 0 => None,
            v => Some(v),
        }),
        Op::SetNum => {
            let cfg = ctx.config;
            cpu.read_label(is, cfg.max_label_size, cfg.max_label_exe_size);
            let value = cpu.thread().next_label.as_int(NUM_NOPS);
            cpu.set_reg(REG_BX, value);
            true
        }

        Op::Add => binary(cpu, is, i32::wrapping_add),
        Op::Sub => binary(cpu, is, i32::wrapping_sub),
        Op::Mult => binary(cpu, is, i32::wrapping_mul),
        Op::Nand => binary(cpu, is, |a, b| !(a & b)),
        Op::Nor => binary(cpu, is, |a, b| !(a | b)),
        Op::And => binary(cpu, is, |a, b| a & b),
        Op::Xor => binary(cpu, is, |a, b| a ^ b),
        Op::Div => {
            let dst = cpu.find_modified_register(REG_BX, is);
            let (a, b) = (cpu.reg(REG_BX), cpu.reg(REG_CX));
            if b == 0 {
                org.fault(FaultLocation::Math, FaultKind::Error, "div: dividing by 0");
                false
            } else {
                if a == i32::MIN && b == -1 {
                    org.fault(FaultLocation::Math, FaultKind::Error, "div: Float exception");
                } else {
                    cpu.set_reg(dst, a / b);
                }
                true
            }
        }
        Op::Mod => {
            let dst = cpu.find_modified_register(REG_BX, is);
            let (a, b) = (cpu.reg(REG_BX), cpu.reg(REG_CX));
            match b {
                0 => {
                    org.fault(FaultLocation::Math, FaultKind::Error, "mod: modding by 0");
                    false
                }
                -1 => {
                    cpu.set_reg(dst, 0);
                    true
                }
                _ => {
                    cpu.set_reg(dst, a % b);
                    true
                }
            }
        }
        Op::Order => {
            if cpu.reg(REG_BX) > cpu.reg(REG_CX) {
                swap_regs(cpu, REG_BX, REG_CX);
            }
            true
        }

        Op::Copy => {
            let from = cpu.ip_relative(cpu.reg(REG_BX));
            let to = cpu.ip_relative(cpu.reg(REG_AX).wrapping_add(cpu.reg(REG_BX)));
            match cpu.inst_at(from) {
                Some(inst) => cpu.write_copied(to, inst, org, ctx),
                None => false,
            }
        }
        Op::ReadInst => {
            let dst = cpu.find_modified_register(REG_CX, is);
            let from = cpu.ip_relative(cpu.reg(REG_BX));
            let value = cpu.inst_at(from).map_or(0, |i| i.op() as i32);
            cpu.set_reg(dst, value);
            true
        }
        Op::WriteInst => {
            let src = cpu.find_modified_register(REG_CX, is);
            let to = cpu.ip_relative(cpu.reg(REG_AX).wrapping_add(cpu.reg(REG_BX)));
            let value = positive_mod(cpu.reg(src), is.len());
            cpu.write_copied(to, Instruction(value as u8), org, ctx)
        }
        Op::StackReadInst => {
            let reg = cpu.find_modified_register(REG_CX, is);
            let from = cpu.ip_relative(cpu.reg(reg));
            let value = cpu.inst_at(from).map_or(0, |i| i.op() as i32);
            cpu.stack_push(value);
            true
        }
        Op::StackWriteInst => {
            let reg = cpu.find_modified_register(REG_BX, is);
            let to = cpu.ip_relative(cpu.reg(REG_AX).wrapping_add(cpu.reg(reg)));
            let value = positive_mod(cpu.stack_pop(), is.len());
            cpu.write_copied(to, Instruction(value as u8), org, ctx)
        }
        Op::Compare => {
            let dst = cpu.find_modified_register(REG_CX, is);
            let from = cpu.ip_relative(cpu.reg(REG_BX));
            let to = cpu.ip_relative(cpu.reg(REG_AX).wrapping_add(cpu.reg(REG_BX)));
            if org.test_copy_mut(ctx.rng) {
                let inst = is.random_inst(ctx.rng);
                if let Some(mem) = cpu.space_mut(to.space) {
                    if !mem.is_empty() {
                        mem.set(to.index(), inst);
                        let flags = mem.flags_mut(to.index());
                        flags.mutated = true;
                        flags.copy_mut = true;
                    }
                }
            }
            let a = cpu.inst_at(from).map_or(0, |i| i.op() as i32);
            let b = cpu.inst_at(to).map_or(0, |i| i.op() as i32);
            cpu.set_reg(dst, a - b);
            true
        }
        Op::IfNCpy => {
            let from = cpu.ip_relative(cpu.reg(REG_BX));
            let to = cpu.ip_relative(cpu.reg(REG_AX).wrapping_add(cpu.reg(REG_BX)));
            let same = cpu.inst_at(from) == cpu.inst_at(to);
            // A copy mutation inverts the test.
            if same != org.test_copy_mut(ctx.rng) {
                cpu.advance_head(HEAD_IP);
            }
            true
        }

        Op::TaskGet => {
            let reg = cpu.find_modified_register(REG_CX, is);
            let value = org.next_input();
            cpu.set_reg(reg, value);
            org.do_input(value);
            true
        }
        Op::TaskPut => {
            let reg = cpu.find_modified_register(REG_BX, is);
            let value = cpu.reg(reg);
            cpu.set_reg(reg, 0);
            org.do_output(value, ctx.env);
            true
        }
        Op::TaskIO => {
            let reg = cpu.find_modified_register(REG_BX, is);
            org.do_output(cpu.reg(reg), ctx.env);
            let value = org.next_input();
            cpu.set_reg(reg, value);
            org.do_input(value);
            true
        }

        Op::SetCopyMut => {
            let reg = cpu.find_modified_register(REG_BX, is);
            org.mut_rates.copy_mut_prob = cpu.reg(reg).max(1) as f64 / 10000.0;
            true
        }
        Op::ModCopyMut => {
            let reg = cpu.find_modified_register(REG_BX, is);
            let rate = org.mut_rates.copy_mut_prob + cpu.reg(reg) as f64 / 10000.0;
            if rate > 0.0 {
                org.mut_rates.copy_mut_prob = rate;
            }
            true
        }

        Op::HeadRead => {
            let head = cpu.find_modified_head(HEAD_READ, is);
            cpu.adjust_head(head);
            let target = cpu.head(head);
            if !cpu.is_readable(target.space) {
                return Some(false);
            }
            let value = if org.test_copy_mut(ctx.rng) {
                is.random_inst(ctx.rng)
            } else {
                match cpu.inst_at(target) {
                    Some(inst) => inst,
                    None => return Some(false),
                }
            };
            cpu.set_reg(REG_BX, value.op() as i32);
            cpu.read_inst(value, is);
            cpu.advance_head(head);
            true
        }
        Op::HeadWrite => {
            let head = cpu.find_modified_head(HEAD_WRITE, is);
            cpu.adjust_head(head);
            let target = cpu.head(head);
            if !cpu.is_readable(target.space) {
                return Some(false);
            }
            let mut value = cpu.reg(REG_BX);
            if value < 0 || value as usize >= is.len() {
                value = 0;
            }
            let Some(mem) = cpu.space_mut(target.space).filter(|m| !m.is_empty()) else {
                return Some(false);
            };
            mem.set(target.index(), Instruction(value as u8));
            mem.flags_mut(target.index()).copied = true;
            cpu.advance_head(head);
            true
        }
        Op::HeadCopy => head_copy(cpu, org, ctx),
        Op::HeadSearch => {
            let cfg = ctx.config;
            cpu.read_label(is, cfg.max_label_size, cfg.max_label_exe_size);
            cpu.thread_mut().next_label.rotate(1, NUM_NOPS);
            let ip = cpu.head(HEAD_IP);
            let found = cpu.find_label(0, is).unwrap_or(ip);
            cpu.set_reg(REG_BX, found.pos - ip.pos);
            let label_size = cpu.thread().next_label.len() as i32;
            cpu.set_reg(REG_CX, label_size);
            cpu.move_head(HEAD_FLOW, found);
            cpu.advance_head(HEAD_FLOW);
            true
        }
        Op::MoveHead => {
            let head = cpu.find_modified_head(HEAD_IP, is);
            cpu.move_head(head, cpu.head(HEAD_FLOW));
            if head == HEAD_IP {
                cpu.set_advance_ip(false);
            }
            true
        }
        Op::JumpHead => {
            let head = cpu.find_modified_head(HEAD_IP, is);
            cpu.jump_head(head, cpu.reg(REG_CX));
            true
        }
        Op::GetHead => {
            let head = cpu.find_modified_head(HEAD_IP, is);
            cpu.set_reg(REG_CX, cpu.head(head).pos);
            true
        }
        Op::SetFlow => {
            let reg = cpu.find_modified_register(REG_CX, is);
            cpu.set_head_pos(HEAD_FLOW, cpu.reg(reg));
            true
        }
        Op::AdvanceHead => {
            let head = cpu.find_modified_head(HEAD_WRITE, is);
            cpu.advance_head(head);
            true
        }
        Op::HeadPush => {
            let head = cpu.find_modified_head(HEAD_IP, is);
            cpu.stack_push(cpu.head(head).pos);
            if head == HEAD_IP {
                cpu.move_head(HEAD_IP, cpu.head(HEAD_FLOW));
                cpu.set_advance_ip(false);
            }
            true
        }
        Op::HeadPop => {
            let head = cpu.find_modified_head(HEAD_IP, is);
            let pos = cpu.stack_pop();
            cpu.set_head_pos(head, pos);
            true
        }
        Op::IfLabel | Op::IfLabel2 => {
            let cfg = ctx.config;
            cpu.read_label(is, cfg.max_label_size, cfg.max_label_exe_size);
            cpu.thread_mut().next_label.rotate(1, NUM_NOPS);
            let thread = cpu.thread();
            if thread.next_label != thread.read_label {
                cpu.advance_head(HEAD_IP);
                if op == Op::IfLabel2 && cpu.next_is_nop(is) {
                    cpu.advance_head(HEAD_IP);
                }
            }
            true
        }
        Op::Skip => {
            cpu.advance_head(HEAD_IP);
            true
        }
        Op::Die => {
            org.die();
            true
        }

        _ => return None,
    };
    Some(ok)
}

fn if_zero<C: CpuCore + ?Sized>(cpu: &mut C, is: &InstSet, execute_next: impl Fn(i32) -> bool) -> bool {
    let reg = cpu.find_modified_register(REG_BX, is);
    if !execute_next(cpu.reg(reg)) {
        cpu.advance_head(HEAD_IP);
    }
    true
}

fn if_compare<C: CpuCore + ?Sized>(cpu: &mut C, is: &InstSet, execute_next: impl Fn(i32, i32) -> bool) -> bool {
    let op1 = cpu.find_modified_register(REG_BX, is);
    let op2 = next_register(op1);
    if !execute_next(cpu.reg(op1), cpu.reg(op2)) {
        cpu.advance_head(HEAD_IP);
    }
    true
}

fn if_fixed<C: CpuCore + ?Sized>(cpu: &mut C, a: usize, b: usize) -> bool {
    if cpu.reg(a) == cpu.reg(b) {
        cpu.advance_head(HEAD_IP);
    }
    true
}

fn pop_into<C: CpuCore + ?Sized>(cpu: &mut C, reg: usize) -> bool {
    let value = cpu.stack_pop();
    cpu.set_reg(reg, value);
    true
}

fn push_from<C: CpuCore + ?Sized>(cpu: &mut C, reg: usize) -> bool {
    cpu.stack_push(cpu.reg(reg));
    true
}

fn swap_regs<C: CpuCore + ?Sized>(cpu: &mut C, a: usize, b: usize) -> bool {
    cpu.thread_mut().regs.swap(a, b);
    true
}

fn copy_reg<C: CpuCore + ?Sized>(cpu: &mut C, src: usize, dst: usize) -> bool {
    cpu.set_reg(dst, cpu.reg(src));
    true
}

fn unary<C: CpuCore + ?Sized>(cpu: &mut C, is: &InstSet, f: impl Fn(i32) -> i32) -> bool {
    let reg = cpu.find_modified_register(REG_BX, is);
    cpu.set_reg(reg, f(cpu.reg(reg)));
    true
}

/// Unary math that faults when `f` rejects a negative argument.
fn unary_checked<C: CpuCore + ?Sized>(
    cpu: &mut C,
    org: &mut OrgState,
    is: &InstSet,
    name: &str,
    f: impl Fn(i32) -> Option<i32>,
) -> bool {
    let reg = cpu.find_modified_register(REG_BX, is);
    match f(cpu.reg(reg)) {
        Some(value) => {
            cpu.set_reg(reg, value);
            true
        }
        None => {
            org.fault(FaultLocation::Math, FaultKind::Error, format!("{}: value is negative", name));
            false
        }
    }
}

fn binary<C: CpuCore + ?Sized>(cpu: &mut C, is: &InstSet, f: impl Fn(i32, i32) -> i32) -> bool {
    let dst = cpu.find_modified_register(REG_BX, is);
    cpu.set_reg(dst, f(cpu.reg(REG_BX), cpu.reg(REG_CX)));
    true
}

/// Copy from the read head to the write head and advance both.
pub fn head_copy<C: CpuCore + ?Sized>(cpu: &mut C, org: &mut OrgState, ctx: &mut ExecContext<'_>) -> bool {
    cpu.adjust_head(HEAD_READ);
    cpu.adjust_head(HEAD_WRITE);
    let Some(inst) = cpu.inst_at(cpu.head(HEAD_READ)) else {
        return false;
    };
    cpu.read_inst(inst, ctx.inst_set);
    if !cpu.write_copied(cpu.head(HEAD_WRITE), inst, org, ctx) {
        return false;
    }
    cpu.advance_head(HEAD_READ);
    cpu.advance_head(HEAD_WRITE);
    true
}

/// Shared body of jump-f, jump-b and call.
fn jump_to_label<C: CpuCore + ?Sized>(cpu: &mut C, org: &mut OrgState, ctx: &mut ExecContext<'_>, direction: i32) -> bool {
    let cfg = ctx.config;
    cpu.read_label(ctx.inst_set, cfg.max_label_size, cfg.max_label_exe_size);
    cpu.thread_mut().next_label.rotate(1, NUM_NOPS);
    if cpu.thread().next_label.is_empty() {
        cpu.jump_head(HEAD_IP, cpu.reg(REG_BX));
        return true;
    }
    match cpu.find_label(direction, ctx.inst_set) {
        Some(found) => {
            cpu.move_head(HEAD_IP, found);
            true
        }
        None => {
            let name = if direction < 0 { "jump-b" } else { "jump-f" };
            org.fault(FaultLocation::Label, FaultKind::Error, format!("{}: No complement label", name));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst_lib::HardwareKind;

    fn set() -> InstSet {
        InstSet::default_for(HardwareKind::Cpu)
    }

    fn seq(set: &InstSet, names: &[&str]) -> Sequence {
        Sequence::from_insts(names.iter().map(|n| set.inst_by_name(n).unwrap()).collect())
    }

    #[test]
    fn test_stack_ring() {
        let mut s = CpuStack::new();
        s.push(1);
        s.push(2);
        assert_eq!(s.top(), 2);
        assert_eq!(s.pop(), 2);
        assert_eq!(s.pop(), 1);
        assert_eq!(s.pop(), 0);
        for v in 0..12 {
            s.push(v);
        }
        // Only the last ten survive.
        assert_eq!(s.values().collect::<Vec<_>>(), vec![11, 10, 9, 8, 7, 6, 5, 4, 3, 2]);
    }

    #[test]
    fn test_stack_flip() {
        let mut s = CpuStack::new();
        s.push(1);
        s.push(2);
        s.flip();
        let values: Vec<i32> = s.values().collect();
        // The old top is now at the bottom.
        assert_eq!(&values[STACK_SIZE - 2..], &[1, 2]);
        assert_eq!(s.top(), 0);
    }

    #[test]
    fn test_find_label_forward() {
        let set = set();
        // [nop-A nop-B] inc inc [nop-C nop-A] dec
        let mem = seq(&set, &["nop-A", "nop-B", "inc", "inc", "nop-B", "nop-C", "nop-A", "dec"]);
        let label = Label::from_nops(&[2, 0]);
        assert_eq!(find_label_forward(&label, &mem, &set, 0), Some(7));
        let missing = Label::from_nops(&[1, 1]);
        assert_eq!(find_label_forward(&missing, &mem, &set, 0), None);
    }

    #[test]
    fn test_find_label_forward_skips_own_template() {
        let set = set();
        let mem = seq(&set, &["nop-C", "nop-A", "inc", "nop-C", "nop-A"]);
        let label = Label::from_nops(&[2, 0]);
        // Searching from the template itself must find the later copy.
        assert_eq!(find_label_forward(&label, &mem, &set, 0), Some(5));
    }

    #[test]
    fn test_find_label_backward() {
        let set = set();
        let mem = seq(&set, &["inc", "nop-B", "nop-B", "dec", "inc", "jmp-head", "nop-A", "nop-A"]);
        let label = Label::from_nops(&[1, 1]);
        // Searching instruction at 5 with a two-nop label.
        assert_eq!(find_label_backward(&label, &mem, &set, 5 - 2), Some(3));
        assert_eq!(find_label_backward(&Label::from_nops(&[2]), &mem, &set, 4), None);
    }

    #[test]
    fn test_thread_status() {
        let mut t = Thread::new(0);
        t.regs = [1, 2, 3];
        t.heads[HEAD_WRITE].pos = 7;
        let s = t.status();
        assert!(s.starts_with("AX:1 BX:2 CX:3"));
        assert!(s.contains("W:7@0"));
    }

    #[test]
    fn test_positive_mod() {
        assert_eq!(positive_mod(-1, 26), 25);
        assert_eq!(positive_mod(27, 26), 1);
        assert_eq!(positive_mod(5, 0), 0);
    }
}
