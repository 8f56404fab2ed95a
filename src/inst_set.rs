//! Instruction set registry
//!
//! Built once from a text table (or the built-in default list) and shared
//! read-only by every organism and worker thread afterwards.
//!
//! File format, one instruction per line, `#` starts a comment:
//!
//! ```text
//! [INST] name [redundancy [cost [first_time_cost [fail_prob [addl_time_cost]]]]]
//! ```
//!
//! Missing trailing fields default to redundancy 1 and zero costs.

use std::fs;
use std::path::Path;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::InstSetError;
use crate::inst_lib::{self, HardwareKind, LibFlags, Op, NULL_INST_NAME};
use crate::sequence::Instruction;

const MAX_REDUNDANCY: i64 = 256;

/// Per-opcode record.
#[derive(Clone, Debug)]
pub struct InstEntry {
    pub name: String,
    pub op: Op,
    pub nop_mod: Option<usize>,
    pub flags: LibFlags,
    pub redundancy: u32,
    pub cost: u32,
    pub ft_cost: u32,
    pub prob_fail: f64,
    pub addl_time_cost: u32,
}

#[derive(Clone, Debug)]
pub struct InstSet {
    hardware: HardwareKind,
    entries: Vec<InstEntry>,
    /// Opcodes repeated by redundancy, for drawing random instructions
    mutation_chart: Vec<Instruction>,
    null_inst: Option<Instruction>,
}

impl InstSet {
    fn empty(hardware: HardwareKind) -> Self {
        Self { hardware, entries: Vec::new(), mutation_chart: Vec::new(), null_inst: None }
    }

    /// The built-in set for a hardware type.
    pub fn default_for(hardware: HardwareKind) -> Self {
        let names: &[&str] = match hardware {
            HardwareKind::Cpu => &inst_lib::DEFAULT_CPU_SET,
            HardwareKind::Gx => &inst_lib::DEFAULT_GX_SET,
        };
        let mut set = Self::empty(hardware);
        for &name in names {
            // Default names are checked by the library tests.
            if let Some(lib) = inst_lib::find_entry(hardware, name) {
                // Programid markers never arise by mutation.
                let redundancy = if lib.op.is_marker() { 0 } else { 1 };
                set.push_entry(lib, redundancy, 0, 0, 0.0, 0);
            }
        }
        set
    }

    /// Build a set from a list of names, all with redundancy 1.
    pub fn from_names(hardware: HardwareKind, names: &[&str]) -> Result<Self, InstSetError> {
        let text = names.join("\n");
        Self::load_str(hardware, &text)
    }

    pub fn load_file<P: AsRef<Path>>(hardware: HardwareKind, path: P) -> Result<Self, InstSetError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| InstSetError::Io { path: path.to_path_buf(), source })?;
        let set = Self::load_str(hardware, &text)?;
        debug!(path = %path.display(), size = set.len(), "loaded instruction set");
        Ok(set)
    }

    pub fn load_str(hardware: HardwareKind, text: &str) -> Result<Self, InstSetError> {
        let mut set = Self::empty(hardware);
        let mut seen_non_nop = false;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace().peekable();
            if fields.peek().map_or(false, |f| f.eq_ignore_ascii_case("INST")) {
                fields.next();
            }
            let name = match fields.next() {
                Some(n) => n,
                None => continue,
            };
            if name == NULL_INST_NAME {
                return Err(InstSetError::Reserved(name.to_string()));
            }
            let lib = inst_lib::find_entry(hardware, name).ok_or_else(|| {
                InstSetError::UnknownInstruction {
                    name: name.to_string(),
                    hardware: hardware.to_string(),
                    suggestion: inst_lib::nearest_name(hardware, name).unwrap_or("").to_string(),
                }
            })?;

            let nums: Vec<&str> = fields.collect();
            let int_field = |i: usize, default: i64| -> Result<i64, InstSetError> {
                match nums.get(i) {
                    Some(s) => s.parse::<i64>().map_err(|_| InstSetError::Malformed {
                        line: lineno + 1,
                        reason: format!("'{}' is not an integer", s),
                    }),
                    None => Ok(default),
                }
            };
            let mut redundancy = int_field(0, 1)?;
            let cost = int_field(1, 0)?;
            let ft_cost = int_field(2, 0)?;
            let prob_fail = match nums.get(3) {
                Some(s) => s.parse::<f64>().map_err(|_| InstSetError::Malformed {
                    line: lineno + 1,
                    reason: format!("'{}' is not a probability", s),
                })?,
                None => 0.0,
            };
            let addl_time_cost = int_field(4, 0)?;

            if redundancy < 0 {
                warn!(instruction = name, "negative redundancy, skipping");
                continue;
            }
            if redundancy > MAX_REDUNDANCY {
                warn!(instruction = name, redundancy, "redundancy capped at {}", MAX_REDUNDANCY);
                redundancy = MAX_REDUNDANCY;
            }
            if lib.nop_mod.is_some() {
                if seen_non_nop {
                    return Err(InstSetError::NopOrder(name.to_string()));
                }
            } else {
                seen_non_nop = true;
            }
            if set.entries.len() >= u8::MAX as usize {
                return Err(InstSetError::TooLarge(set.entries.len() + 1));
            }
            set.push_entry(
                lib,
                redundancy as u32,
                cost.max(0) as u32,
                ft_cost.max(0) as u32,
                prob_fail.clamp(0.0, 1.0),
                addl_time_cost.max(0) as u32,
            );
        }

        if set.entries.is_empty() {
            return Err(InstSetError::Empty);
        }
        Ok(set)
    }

    fn push_entry(
        &mut self,
        lib: &inst_lib::LibEntry,
        redundancy: u32,
        cost: u32,
        ft_cost: u32,
        prob_fail: f64,
        addl_time_cost: u32,
    ) {
        let inst = Instruction(self.entries.len() as u8);
        self.entries.push(InstEntry {
            name: lib.name.to_string(),
            op: lib.op,
            nop_mod: lib.nop_mod,
            flags: lib.flags,
            redundancy,
            cost,
            ft_cost,
            prob_fail,
            addl_time_cost,
        });
        self.mutation_chart.extend(std::iter::repeat(inst).take(redundancy as usize));
    }

    /// Append the reserved null instruction (idempotent) and return it.
    ///
    /// The null instruction has zero redundancy so it never appears through
    /// mutation.
    pub fn activate_null_inst(&mut self) -> Instruction {
        if let Some(inst) = self.null_inst {
            return inst;
        }
        let inst = Instruction(self.entries.len() as u8);
        self.entries.push(InstEntry {
            name: NULL_INST_NAME.to_string(),
            op: Op::Null,
            nop_mod: None,
            flags: LibFlags::default(),
            redundancy: 0,
            cost: 0,
            ft_cost: 0,
            prob_fail: 0.0,
            addl_time_cost: 0,
        });
        self.null_inst = Some(inst);
        inst
    }

    /// A copy of this set with the null instruction activated.
    pub fn with_null_inst(&self) -> (Self, Instruction) {
        let mut set = self.clone();
        let null = set.activate_null_inst();
        (set, null)
    }

    pub fn null_inst(&self) -> Option<Instruction> {
        self.null_inst
    }

    pub fn hardware(&self) -> HardwareKind {
        self.hardware
    }

    /// Number of opcodes, including the null instruction when active.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of opcodes mutations may produce (the null instruction excluded).
    pub fn num_mutable(&self) -> usize {
        self.entries.len() - usize::from(self.null_inst.is_some())
    }

    #[inline]
    pub fn entry(&self, inst: Instruction) -> &InstEntry {
        &self.entries[inst.op()]
    }

    pub fn entries(&self) -> &[InstEntry] {
        &self.entries
    }

    pub fn name(&self, inst: Instruction) -> &str {
        self.entries.get(inst.op()).map_or("(invalid)", |e| e.name.as_str())
    }

    #[inline]
    pub fn op(&self, inst: Instruction) -> Op {
        self.entries.get(inst.op()).map_or(Op::Null, |e| e.op)
    }

    /// Opcode for a name, if the set contains it.
    pub fn inst_by_name(&self, name: &str) -> Option<Instruction> {
        self.entries.iter().position(|e| e.name == name).map(|i| Instruction(i as u8))
    }

    /// Opcode for a name, failing with a suggestion when unknown.
    pub fn get_inst(&self, name: &str) -> Result<Instruction, InstSetError> {
        self.inst_by_name(name).ok_or_else(|| InstSetError::UnknownInstruction {
            name: name.to_string(),
            hardware: self.hardware.to_string(),
            suggestion: self.nearest_name(name),
        })
    }

    fn nearest_name(&self, name: &str) -> String {
        self.entries
            .iter()
            .min_by_key(|e| crate::sequence::str_edit_distance(&e.name, name))
            .map(|e| e.name.clone())
            .unwrap_or_default()
    }

    /// First opcode implementing `op`.
    pub fn find_op(&self, op: Op) -> Option<Instruction> {
        self.entries.iter().position(|e| e.op == op).map(|i| Instruction(i as u8))
    }

    #[inline]
    pub fn is_nop(&self, inst: Instruction) -> bool {
        self.entries.get(inst.op()).map_or(false, |e| e.nop_mod.is_some())
    }

    /// Modifier of a nop. Callers check [`InstSet::is_nop`] first.
    #[inline]
    pub fn nop_mod(&self, inst: Instruction) -> usize {
        self.entries.get(inst.op()).and_then(|e| e.nop_mod).unwrap_or(0)
    }

    #[inline]
    pub fn is_label(&self, inst: Instruction) -> bool {
        self.entries.get(inst.op()).map_or(false, |e| e.flags.label)
    }

    #[inline]
    pub fn is_promoter(&self, inst: Instruction) -> bool {
        self.entries.get(inst.op()).map_or(false, |e| e.flags.promoter)
    }

    #[inline]
    pub fn is_terminator(&self, inst: Instruction) -> bool {
        self.entries.get(inst.op()).map_or(false, |e| e.flags.terminator)
    }

    #[inline]
    pub fn cost(&self, inst: Instruction) -> u32 {
        self.entries.get(inst.op()).map_or(0, |e| e.cost)
    }

    #[inline]
    pub fn prob_fail(&self, inst: Instruction) -> f64 {
        self.entries.get(inst.op()).map_or(0.0, |e| e.prob_fail)
    }

    #[inline]
    pub fn addl_time_cost(&self, inst: Instruction) -> u32 {
        self.entries.get(inst.op()).map_or(0, |e| e.addl_time_cost)
    }

    /// Instruction used to fill newly allocated memory.
    pub fn default_inst(&self) -> Instruction {
        Instruction(0)
    }

    /// Draw an instruction weighted by redundancy.
    pub fn random_inst<R: Rng + ?Sized>(&self, rng: &mut R) -> Instruction {
        if self.mutation_chart.is_empty() {
            return self.default_inst();
        }
        self.mutation_chart[rng.random_range(0..self.mutation_chart.len())]
    }

    /// Render the set back to the text format.
    pub fn to_text(&self) -> String {
        let mut out = format!("# {} instruction set\n", self.hardware);
        for e in self.entries.iter().filter(|e| e.op != Op::Null) {
            out.push_str(&format!(
                "INST {:<12} {} {} {} {} {}\n",
                e.name, e.redundancy, e.cost, e.ft_cost, e.prob_fail, e.addl_time_cost
            ));
        }
        out
    }
}
