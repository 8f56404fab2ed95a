//! Virtual hardware
//!
//! Two hardware types run organisms: the classic heads CPU in [`cpu`] and the
//! gene-expression hardware in [`gx`]. Both implement [`Hardware`]. The
//! register, stack, head and math instructions they share are provided once
//! by the [`base::CpuCore`] trait; each hardware only adds its own
//! allocation, divide and programid handling.
//!
//! Everything an instruction needs from outside the CPU comes in through an
//! [`ExecContext`]: the instruction set, hardware knobs, the task
//! environment, the organism host and the random source.

pub mod base;
pub mod cpu;
pub mod gx;
pub mod programid;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::environment::TaskEvaluator;
use crate::inst_lib::HardwareKind;
use crate::inst_set::InstSet;
use crate::organism::{test_prob, FaultKind, FaultLocation, OrgState, OrganismHost};
use crate::sequence::{Instruction, Sequence};

pub use cpu::HardwareCpu;
pub use gx::HardwareGx;

/// How newly allocated memory is filled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocMethod {
    /// Fill with the default instruction
    #[default]
    Default,
    /// Reuse whatever the memory held before it last shrank
    Necro,
    /// Fill with random instructions
    Random,
}

/// What happens to the parent after a successful divide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivideMethod {
    /// Parent resets to a fresh copy of its genome
    #[default]
    Split,
    /// Parent keeps running where it left off
    Birth,
}

/// Hardware configuration shared by both hardware types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub max_label_size: usize,
    /// Only this many nops of a label are marked executed
    pub max_label_exe_size: usize,
    pub child_size_range: f64,
    pub min_copied_lines: f64,
    pub min_exe_lines: f64,
    pub require_allocate: bool,
    pub alloc_method: AllocMethod,
    pub divide_method: DivideMethod,
    pub min_genome_length: usize,
    pub max_genome_length: usize,
    /// Absolute divide bounds, 0 disables
    pub min_genome_size: usize,
    pub max_genome_size: usize,
    pub copy_mut_prob: f64,
    pub divide_mut_prob: f64,
    pub divide_ins_prob: f64,
    pub divide_del_prob: f64,
    /// Instruction budget per organism, 0 for unlimited
    pub max_executed: u64,

    // Gene-expression hardware
    pub max_programids: usize,
    pub max_programid_age: u64,
    pub implicit_gene_expression: bool,
    pub implicit_bg_promoter_rate: f64,
    pub implicit_turnover_rate: f64,
    /// 0 uses the genome length
    pub implicit_max_programid_length: usize,
    pub regulatory_footprint: usize,
    pub min_divide_genome_length: usize,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            max_label_size: crate::label::MAX_LABEL_SIZE,
            max_label_exe_size: 1,
            child_size_range: 2.0,
            min_copied_lines: 0.5,
            min_exe_lines: 0.5,
            require_allocate: true,
            alloc_method: AllocMethod::Default,
            divide_method: DivideMethod::Split,
            min_genome_length: 8,
            max_genome_length: 2048,
            min_genome_size: 0,
            max_genome_size: 0,
            copy_mut_prob: 0.0075,
            divide_mut_prob: 0.0,
            divide_ins_prob: 0.0,
            divide_del_prob: 0.0,
            max_executed: 0,
            max_programids: 16,
            max_programid_age: 2000,
            implicit_gene_expression: false,
            implicit_bg_promoter_rate: 0.0,
            implicit_turnover_rate: 0.0,
            implicit_max_programid_length: 0,
            regulatory_footprint: 5,
            min_divide_genome_length: 50,
        }
    }
}

impl HardwareConfig {
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        if self.child_size_range < 1.0 {
            return Err(format!("child_size_range must be >= 1 (got {})", self.child_size_range));
        }
        if self.min_genome_length > self.max_genome_length {
            return Err(format!(
                "min_genome_length {} exceeds max_genome_length {}",
                self.min_genome_length, self.max_genome_length
            ));
        }
        if self.max_label_size == 0 || self.max_label_size > crate::label::MAX_LABEL_SIZE {
            return Err(format!(
                "max_label_size must be in 1..={} (got {})",
                crate::label::MAX_LABEL_SIZE,
                self.max_label_size
            ));
        }
        for (name, p) in [
            ("copy_mut_prob", self.copy_mut_prob),
            ("divide_mut_prob", self.divide_mut_prob),
            ("divide_ins_prob", self.divide_ins_prob),
            ("divide_del_prob", self.divide_del_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("{} must be a probability (got {})", name, p));
            }
        }
        if self.max_programids == 0 {
            return Err("max_programids must be at least 1".to_string());
        }
        if self.implicit_gene_expression && self.implicit_bg_promoter_rate == 0.0 {
            warnings.push(
                "implicit gene expression with zero background rate only transcribes from promoters".to_string(),
            );
        }
        if self.max_executed == 0 {
            warnings.push("max_executed is 0: organisms that never divide only stop at the test cycle limit".to_string());
        }
        Ok(warnings)
    }
}

/// Receives one status line per executed cycle.
pub trait Tracer {
    fn trace(&mut self, status: &str);
}

/// Collects trace lines in memory.
#[derive(Debug, Default)]
pub struct BufferTracer {
    pub lines: Vec<String>,
}

impl Tracer for BufferTracer {
    fn trace(&mut self, status: &str) {
        self.lines.push(status.to_string());
    }
}

/// Everything outside the CPU an instruction may touch.
pub struct ExecContext<'a> {
    pub inst_set: &'a InstSet,
    pub config: &'a HardwareConfig,
    pub env: &'a dyn TaskEvaluator,
    pub host: &'a mut dyn OrganismHost,
    pub rng: &'a mut StdRng,
    pub tracer: Option<&'a mut dyn Tracer>,
}

impl ExecContext<'_> {
    pub(crate) fn trace_with(&mut self, status: impl FnOnce() -> String) {
        if let Some(tracer) = self.tracer.as_deref_mut() {
            tracer.trace(&status());
        }
    }
}

/// A virtual CPU able to run one organism.
pub trait Hardware {
    /// Return to the just-born state for `org`'s genome.
    fn reset(&mut self, org: &OrgState, inst_set: &InstSet, config: &HardwareConfig);

    /// Run one scheduling step: one instruction on the classic CPU, one
    /// instruction per runnable programid on the gene-expression hardware.
    fn single_process(&mut self, org: &mut OrgState, ctx: &mut ExecContext<'_>);

    /// The memory the organism executes from.
    fn memory(&self) -> &Sequence;

    /// One-line description of the CPU state.
    fn status(&self, inst_set: &InstSet) -> String;
}

pub fn create_hardware(
    kind: HardwareKind,
    org: &OrgState,
    inst_set: &InstSet,
    config: &HardwareConfig,
) -> Box<dyn Hardware> {
    match kind {
        HardwareKind::Cpu => Box::new(HardwareCpu::new(org, inst_set, config)),
        HardwareKind::Gx => Box::new(HardwareGx::new(org, inst_set, config)),
    }
}

/// An organism's state paired with the hardware running it.
pub struct Organism {
    pub state: OrgState,
    hardware: Box<dyn Hardware>,
}

impl Organism {
    pub fn new(state: OrgState, inst_set: &InstSet, config: &HardwareConfig) -> Self {
        let hardware = create_hardware(inst_set.hardware(), &state, inst_set, config);
        Self { state, hardware }
    }

    pub fn process(&mut self, ctx: &mut ExecContext<'_>) {
        self.hardware.single_process(&mut self.state, ctx);
    }

    pub fn hardware(&self) -> &dyn Hardware {
        self.hardware.as_ref()
    }
}

/// Copy one instruction, replacing it with a random one with probability
/// `prob`. Returns the instruction to write and whether it was mutated.
pub fn copy_with_mutation<R: Rng + ?Sized>(
    src: Instruction,
    prob: f64,
    inst_set: &InstSet,
    rng: &mut R,
) -> (Instruction, bool) {
    if test_prob(prob, rng) {
        (inst_set.random_inst(rng), true)
    } else {
        (src, false)
    }
}

/// Grow `memory` by `allocated_size` after checking every allocation limit.
///
/// `necro_tail` holds what the memory contained past its current end before
/// it last shrank.
#[allow(clippy::too_many_arguments)]
pub(crate) fn allocate_main(
    memory: &mut Sequence,
    allocated_size: i32,
    mal_active: &mut bool,
    necro_tail: &[Instruction],
    org: &mut OrgState,
    inst_set: &InstSet,
    config: &HardwareConfig,
    rng: &mut StdRng,
) -> bool {
    let old_size = memory.len() as i32;
    if !check_allocate(org, config, old_size, allocated_size, *mal_active) {
        return false;
    }
    let new_size = old_size + allocated_size;
    if new_size > config.max_genome_length as i32 || new_size < config.min_genome_length as i32 {
        org.fault(
            FaultLocation::Allocate,
            FaultKind::Error,
            format!("Invalid post-allocate size ({})", new_size),
        );
        return false;
    }

    let old = old_size as usize;
    let new = new_size as usize;
    memory.resize(new, inst_set.default_inst());
    match config.alloc_method {
        AllocMethod::Default => {}
        AllocMethod::Necro => {
            for (pos, &inst) in (old..new).zip(necro_tail.iter()) {
                memory.set(pos, inst);
            }
        }
        AllocMethod::Random => {
            for pos in old..new {
                memory.set(pos, inst_set.random_inst(rng));
            }
        }
    }
    *mal_active = true;
    true
}

/// Allocation limits shared by every allocate instruction.
pub(crate) fn check_allocate(
    org: &mut OrgState,
    config: &HardwareConfig,
    old_size: i32,
    allocated_size: i32,
    mal_active: bool,
) -> bool {
    if config.require_allocate && mal_active {
        org.fault(FaultLocation::Allocate, FaultKind::Error, "Allocate already active");
        return false;
    }
    if allocated_size < 1 {
        org.fault(
            FaultLocation::Allocate,
            FaultKind::Error,
            format!("Allocate of {} too small", allocated_size),
        );
        return false;
    }
    let max_alloc_size = (old_size as f64 * config.child_size_range) as i32;
    if allocated_size > max_alloc_size {
        org.fault(
            FaultLocation::Allocate,
            FaultKind::Error,
            format!("Allocate too large ({} > {})", allocated_size, max_alloc_size),
        );
        return false;
    }
    let max_old_size = (allocated_size as f64 * config.child_size_range) as i32;
    if old_size > max_old_size {
        org.fault(
            FaultLocation::Allocate,
            FaultKind::Error,
            format!("Allocate too small ({} > {})", old_size, max_old_size),
        );
        return false;
    }
    true
}

/// Check that a divide into `parent_size` and `child_size` is viable.
///
/// `count_lines(parent, child)` returns the executed and copied line counts
/// and is only called once both sizes are in range. On success the counts
/// are stored on the phenotype.
pub(crate) fn divide_check_viable(
    org: &mut OrgState,
    config: &HardwareConfig,
    parent_size: i32,
    child_size: i32,
    count_lines: impl FnOnce(usize, usize) -> (usize, usize),
) -> bool {
    let genome_size = org.genome.len() as f64;
    let min_size = (config.min_genome_length as i32).max((genome_size / config.child_size_range) as i32);
    let max_size = (config.max_genome_length as i32).min((genome_size * config.child_size_range) as i32);

    if child_size < min_size || child_size > max_size {
        org.fault(
            FaultLocation::Divide,
            FaultKind::Error,
            format!("Invalid offspring length ({})", child_size),
        );
        return false;
    }
    if parent_size < min_size || parent_size > max_size {
        org.fault(
            FaultLocation::Divide,
            FaultKind::Error,
            format!("Invalid post-divide length ({})", parent_size),
        );
        return false;
    }

    let abs_min = config.min_genome_size as i32;
    let abs_max = config.max_genome_size as i32;
    let outside_abs = |size: i32| (abs_min > 0 && size < abs_min) || (abs_max > 0 && size > abs_max);
    if outside_abs(child_size) {
        org.fault(
            FaultLocation::Divide,
            FaultKind::Error,
            format!("Invalid absolute offspring length ({})", child_size),
        );
        return false;
    }
    if outside_abs(parent_size) {
        org.fault(
            FaultLocation::Divide,
            FaultKind::Error,
            format!("Invalid absolute post-divide length ({})", parent_size),
        );
        return false;
    }

    let (executed_size, copied_size) = count_lines(parent_size as usize, child_size as usize);
    let min_exe_lines = (parent_size as f64 * config.min_exe_lines) as usize;
    if executed_size < min_exe_lines {
        org.fault(
            FaultLocation::Divide,
            FaultKind::Error,
            format!("Too few executed lines ({} < {})", executed_size, min_exe_lines),
        );
        return false;
    }
    let min_copied = (child_size as f64 * config.min_copied_lines) as usize;
    if copied_size < min_copied {
        org.fault(
            FaultLocation::Divide,
            FaultKind::Error,
            format!("Too few copied commands ({} < {})", copied_size, min_copied),
        );
        return false;
    }

    org.phenotype.executed_size = executed_size;
    org.phenotype.copied_size = copied_size;
    org.phenotype.child_copied_size = copied_size;
    true
}

/// Point, insertion and deletion mutations applied to the offspring on divide.
pub(crate) fn divide_do_mutations(org: &mut OrgState, inst_set: &InstSet, config: &HardwareConfig, rng: &mut StdRng) {
    if org.test_divide_mut(rng) && !org.offspring.is_empty() {
        let line = rng.random_range(0..org.offspring.len());
        org.offspring.set(line, inst_set.random_inst(rng));
    }
    if org.test_divide_ins(rng) && org.offspring.len() < config.max_genome_length {
        let line = rng.random_range(0..=org.offspring.len());
        org.offspring.insert(line, inst_set.random_inst(rng));
    }
    if org.test_divide_del(rng) && org.offspring.len() > config.min_genome_length {
        let line = rng.random_range(0..org.offspring.len());
        org.offspring.remove(line);
    }
}
