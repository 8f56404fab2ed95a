//! Test CPU
//!
//! Runs a genome in a private organism, outside any population, and
//! reports whether it forms a colony: it divides, and within a bounded
//! number of generations its offspring either breeds true or repeats an
//! earlier genome. Every evaluation seeds its own RNG from the configured
//! seed, so evaluating the same genome twice gives identical results.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::environment::{setup_inputs, TaskEvaluator};
use crate::hardware::{ExecContext, HardwareConfig, Organism, Tracer};
use crate::inst_set::InstSet;
use crate::organism::{Fault, MutationRates, OrgState, OrganismHost, Phenotype, PhenotypeConfig};
use crate::sequence::Sequence;

/// Test CPU settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestCpuConfig {
    /// Cycles allowed per gestation, per genome instruction
    pub time_mod: u64,
    /// Generations bred before giving up
    pub generations: usize,
    pub use_random_inputs: bool,
    pub seed: u64,
}

impl Default for TestCpuConfig {
    fn default() -> Self {
        Self { time_mod: 20, generations: 3, use_random_inputs: false, seed: 42 }
    }
}

/// Where the environmental inputs of a test come from.
#[derive(Clone, Debug, PartialEq)]
pub enum InputMode {
    Fixed,
    Random,
    Manual(Vec<i32>),
}

/// One tested generation.
#[derive(Clone, Debug)]
pub struct GenerationRecord {
    pub genome: Sequence,
    pub phenotype: Phenotype,
    pub offspring: Sequence,
    pub faults: Vec<Fault>,
    pub time_used: u64,
    pub time_allocated: u64,
}

impl GenerationRecord {
    pub fn divided(&self) -> bool {
        self.phenotype.num_divides > 0
    }
}

/// Settings and results of one Test CPU evaluation.
#[derive(Clone, Debug)]
pub struct TestInfo {
    pub generation_tests: usize,
    pub input_mode: InputMode,
    pub mut_rates: MutationRates,

    /// Colony forming
    pub is_viable: bool,
    /// Deepest generation tested
    pub max_depth: usize,
    /// Generation at which viability was established
    pub depth_found: Option<usize>,
    /// Longest reproductive cycle found
    pub max_cycle: usize,
    /// Ancestor generation the last offspring repeated
    pub cycle_to: Option<usize>,
    /// Inputs of the first generation
    pub used_inputs: Vec<i32>,
    pub generations: Vec<GenerationRecord>,
}

impl TestInfo {
    pub fn new(generation_tests: usize) -> Self {
        Self {
            generation_tests: generation_tests.max(1),
            input_mode: InputMode::Fixed,
            mut_rates: MutationRates::none(),
            is_viable: false,
            max_depth: 0,
            depth_found: None,
            max_cycle: 0,
            cycle_to: None,
            used_inputs: Vec::new(),
            generations: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, mode: InputMode) -> Self {
        self.input_mode = mode;
        self
    }

    /// Forget previous results, keep the settings.
    pub fn clear(&mut self) {
        self.is_viable = false;
        self.max_depth = 0;
        self.depth_found = None;
        self.max_cycle = 0;
        self.cycle_to = None;
        self.used_inputs.clear();
        self.generations.clear();
    }

    /// Reproduction class.
    ///
    /// Not viable: 0 parent never divides, 2 parent divides but the child
    /// does not, 3 both divide without breeding true. Viable: 4 parent
    /// breeds true, 5 the child does, 6 a deeper generation does.
    pub fn repro_type(&self) -> u8 {
        let depth = self.max_depth.min(2) as u8;
        if !self.is_viable && depth == 0 {
            return 0;
        }
        u8::from(self.is_viable) * 3 + 1 + depth
    }

    pub fn test_organism(&self, level: usize) -> Option<&GenerationRecord> {
        self.generations.get(level)
    }

    /// The generation that formed the colony, or the first one.
    pub fn colony_organism(&self) -> Option<&GenerationRecord> {
        self.generations.get(self.depth_found.unwrap_or(0))
    }

    pub fn colony_fitness(&self) -> f64 {
        if !self.is_viable {
            return 0.0;
        }
        self.colony_organism().map_or(0.0, |g| g.phenotype.fitness)
    }

    /// Whether `child` of generation `depth` repeats an ancestor; updates
    /// the cycle statistics when it does.
    fn record_ancestor(&mut self, depth: usize, child: &Sequence) -> bool {
        let mut is_ancestor = false;
        for anc_depth in 0..depth.min(self.generations.len()) {
            if self.generations[anc_depth].genome == *child {
                is_ancestor = true;
                self.max_cycle = self.max_cycle.max(depth - anc_depth);
                self.cycle_to = Some(anc_depth);
            }
        }
        is_ancestor
    }
}

/// The phenotype summary the analysis engines work from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    pub viable: bool,
    pub fitness: f64,
    pub merit: f64,
    pub gestation_time: u64,
    pub tasks: Vec<u32>,
}

/// Host used inside the Test CPU: offspring are kept, the parent survives.
#[derive(Default)]
struct TestHost {
    offspring: Option<Sequence>,
}

impl OrganismHost for TestHost {
    fn activate_divide(&mut self, _parent: &mut OrgState, offspring: Sequence) -> bool {
        self.offspring = Some(offspring);
        true
    }
}

pub struct TestCpu<'a> {
    inst_set: &'a InstSet,
    hardware: &'a HardwareConfig,
    phenotype: &'a PhenotypeConfig,
    env: &'a dyn TaskEvaluator,
    config: TestCpuConfig,
}

impl<'a> TestCpu<'a> {
    pub fn new(
        inst_set: &'a InstSet,
        hardware: &'a HardwareConfig,
        phenotype: &'a PhenotypeConfig,
        env: &'a dyn TaskEvaluator,
        config: &TestCpuConfig,
    ) -> Self {
        Self { inst_set, hardware, phenotype, env, config: config.clone() }
    }

    /// The same CPU running `inst_set` instead.
    pub fn with_inst_set<'b>(&self, inst_set: &'b InstSet) -> TestCpu<'b>
    where
        'a: 'b,
    {
        TestCpu {
            inst_set,
            hardware: self.hardware,
            phenotype: self.phenotype,
            env: self.env,
            config: self.config.clone(),
        }
    }

    pub fn inst_set(&self) -> &InstSet {
        self.inst_set
    }

    pub fn env(&self) -> &dyn TaskEvaluator {
        self.env
    }

    /// A `TestInfo` with this CPU's generation bound and input mode.
    pub fn new_info(&self) -> TestInfo {
        let mode = if self.config.use_random_inputs { InputMode::Random } else { InputMode::Fixed };
        TestInfo::new(self.config.generations).with_inputs(mode)
    }

    pub fn test_genome(&self, info: &mut TestInfo, genome: &Sequence) -> bool {
        self.test_genome_traced(info, genome, None)
    }

    /// Like [`TestCpu::test_genome`], sending one status line per cycle to `tracer`.
    pub fn test_genome_traced(&self, info: &mut TestInfo, genome: &Sequence, mut tracer: Option<&mut dyn Tracer>) -> bool {
        info.clear();
        if genome.is_empty() {
            return false;
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut genome = genome.clone();

        for depth in 0..info.generation_tests {
            let inputs = match &info.input_mode {
                InputMode::Fixed => setup_inputs(&mut rng, false),
                InputMode::Random => setup_inputs(&mut rng, true),
                InputMode::Manual(values) => values.clone(),
            };
            if depth == 0 {
                info.used_inputs = inputs.clone();
            }
            info.max_depth = info.max_depth.max(depth);

            let record = self.process_gestation(genome, inputs, info.mut_rates, &mut rng, reborrow(&mut tracer));
            let divided = record.divided();
            let copy_true = record.phenotype.copy_true;
            let child = record.offspring.clone();
            info.generations.push(record);

            if !divided {
                break;
            }
            if copy_true || info.record_ancestor(depth, &child) {
                info.depth_found = Some(depth);
                info.is_viable = true;
                break;
            }
            genome = child;
        }

        debug!(
            viable = info.is_viable,
            max_depth = info.max_depth,
            repro_type = info.repro_type(),
            fitness = info.colony_fitness(),
            "genome tested"
        );
        info.is_viable
    }

    /// Run one organism until it divides, dies or runs out of time.
    fn process_gestation(
        &self,
        genome: Sequence,
        inputs: Vec<i32>,
        mut_rates: MutationRates,
        rng: &mut StdRng,
        mut tracer: Option<&mut dyn Tracer>,
    ) -> GenerationRecord {
        let time_allocated = self.config.time_mod * genome.len() as u64;
        let state = OrgState::new(genome.clone(), self.env.num_tasks(), self.phenotype.clone(), mut_rates, inputs);
        let mut org = Organism::new(state, self.inst_set, self.hardware);
        let mut host = TestHost::default();

        let mut time_used = 0;
        while time_used < time_allocated
            && !org.hardware().memory().is_empty()
            && org.state.phenotype.num_divides == 0
            && !org.state.is_dead()
        {
            time_used += 1;
            let mut ctx = ExecContext {
                inst_set: self.inst_set,
                config: self.hardware,
                env: self.env,
                host: &mut host,
                rng: &mut *rng,
                tracer: reborrow(&mut tracer),
            };
            org.process(&mut ctx);
        }
        if let Some(t) = tracer.as_mut() {
            t.trace(&format!(
                "# {} of {} cycles used, {} divide(s)",
                time_used, time_allocated, org.state.phenotype.num_divides
            ));
        }

        GenerationRecord {
            genome,
            offspring: host.offspring.unwrap_or_default(),
            phenotype: org.state.phenotype,
            faults: org.state.faults,
            time_used,
            time_allocated,
        }
    }

    /// Colony phenotype of `genome`; fitness is zero unless it is viable.
    pub fn evaluate(&self, genome: &Sequence) -> Evaluation {
        let mut info = self.new_info();
        self.test_genome(&mut info, genome);
        let Some(colony) = info.colony_organism() else {
            return Evaluation::default();
        };
        Evaluation {
            viable: info.is_viable,
            fitness: info.colony_fitness(),
            merit: colony.phenotype.merit,
            gestation_time: colony.phenotype.gestation_time,
            tasks: colony.phenotype.last_task_count.clone(),
        }
    }
}

fn reborrow<'s>(tracer: &'s mut Option<&mut dyn Tracer>) -> Option<&'s mut dyn Tracer> {
    match tracer {
        Some(t) => Some(&mut **t),
        None => None,
    }
}
