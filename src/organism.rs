//! Organism state shared by every hardware type
//!
//! [`OrgState`] is everything about an organism that is not CPU internals:
//! its genome, phenotype, I/O buffers, mutation rates, offspring slot and
//! fault log. The hardware mutates it through the instruction handlers; the
//! surrounding world sees it through the [`OrganismHost`] trait.

use std::collections::VecDeque;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::environment::TaskEvaluator;
use crate::fitness::{calc_size_merit, fitness, BaseMeritMethod};
use crate::sequence::Sequence;

/// Inputs and outputs remembered for task evaluation.
pub const IO_BUFFER_SIZE: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultLocation {
    Divide,
    Allocate,
    Math,
    Label,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Error,
}

/// A recoverable execution fault recorded against an organism.
#[derive(Clone, Debug, PartialEq)]
pub struct Fault {
    pub location: FaultLocation,
    pub kind: FaultKind,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}: {}", self.location, self.kind, self.message)
    }
}

/// Phenotype configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhenotypeConfig {
    pub base_merit_method: BaseMeritMethod,
    pub base_const_merit: u32,
    pub default_bonus: f64,
}

impl Default for PhenotypeConfig {
    fn default() -> Self {
        Self {
            base_merit_method: BaseMeritMethod::Least,
            base_const_merit: 100,
            default_bonus: 1.0,
        }
    }
}

/// Reproduction-relevant statistics of one organism.
#[derive(Clone, Debug, Default)]
pub struct Phenotype {
    pub genome_length: usize,
    pub copied_size: usize,
    pub executed_size: usize,
    /// Lines copied into the most recent offspring
    pub child_copied_size: usize,

    pub time_used: u64,
    pub cpu_cycles_used: u64,
    pub gestation_start: u64,
    pub gestation_time: u64,

    pub merit: f64,
    pub fitness: f64,
    pub cur_bonus: f64,
    pub last_bonus: f64,
    pub last_merit_base: u32,

    pub cur_task_count: Vec<u32>,
    pub last_task_count: Vec<u32>,
    pub cur_num_errors: u32,
    pub last_num_errors: u32,

    pub num_divides: u32,
    pub copy_true: bool,
    pub to_die: bool,
}

impl Phenotype {
    /// Phenotype of a freshly injected genome.
    pub fn inject(genome_length: usize, num_tasks: usize, cfg: &PhenotypeConfig) -> Self {
        Self {
            genome_length,
            copied_size: genome_length,
            executed_size: genome_length,
            cur_bonus: cfg.default_bonus,
            last_bonus: cfg.default_bonus,
            cur_task_count: vec![0; num_tasks],
            last_task_count: vec![0; num_tasks],
            ..Default::default()
        }
    }

    pub fn calc_size_merit(&self, cfg: &PhenotypeConfig) -> u32 {
        calc_size_merit(
            cfg.base_merit_method,
            cfg.base_const_merit,
            self.genome_length,
            self.copied_size,
            self.executed_size,
        )
    }

    /// Lock in a finished gestation: compute merit and fitness, then roll
    /// the current counters into the `last_*` fields.
    pub fn divide_reset(&mut self, genome_length: usize, cfg: &PhenotypeConfig) {
        let merit_base = self.calc_size_merit(cfg);
        self.merit = merit_base as f64 * self.cur_bonus;
        self.genome_length = genome_length;
        self.gestation_time = self.time_used - self.gestation_start;
        self.gestation_start = self.time_used;
        self.fitness = fitness(self.merit, self.gestation_time);

        self.last_merit_base = merit_base;
        self.last_bonus = self.cur_bonus;
        self.last_num_errors = self.cur_num_errors;
        self.last_task_count = std::mem::take(&mut self.cur_task_count);
        self.cur_task_count = vec![0; self.last_task_count.len()];

        self.cur_bonus = cfg.default_bonus;
        self.cur_num_errors = 0;
        self.num_divides += 1;
    }
}

/// Per-organism mutation probabilities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationRates {
    pub copy_mut_prob: f64,
    pub divide_mut_prob: f64,
    pub divide_ins_prob: f64,
    pub divide_del_prob: f64,
}

impl MutationRates {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Everything the world needs to provide while an organism runs.
pub trait OrganismHost {
    /// Hand over a finished offspring. Returns whether the parent survives.
    fn activate_divide(&mut self, parent: &mut OrgState, offspring: Sequence) -> bool;
}

/// Non-CPU state of a running organism.
#[derive(Clone, Debug)]
pub struct OrgState {
    pub genome: Sequence,
    pub phenotype: Phenotype,
    pub phenotype_cfg: PhenotypeConfig,
    pub mut_rates: MutationRates,
    /// Values the organism reads in order with `get`/`IO`
    pub inputs: Vec<i32>,
    input_pointer: usize,
    /// Most recent first
    pub input_buffer: VecDeque<i32>,
    pub output_buffer: VecDeque<i32>,
    pub offspring: Sequence,
    pub faults: Vec<Fault>,
    /// Set while a divide is being processed; read by the hardware.
    pub divided: bool,
}

impl OrgState {
    pub fn new(
        genome: Sequence,
        num_tasks: usize,
        phenotype_cfg: PhenotypeConfig,
        mut_rates: MutationRates,
        inputs: Vec<i32>,
    ) -> Self {
        let phenotype = Phenotype::inject(genome.len(), num_tasks, &phenotype_cfg);
        Self {
            genome,
            phenotype,
            phenotype_cfg,
            mut_rates,
            inputs,
            input_pointer: 0,
            input_buffer: VecDeque::with_capacity(IO_BUFFER_SIZE),
            output_buffer: VecDeque::with_capacity(IO_BUFFER_SIZE),
            offspring: Sequence::new(),
            faults: Vec::new(),
            divided: false,
        }
    }

    pub fn fault(&mut self, location: FaultLocation, kind: FaultKind, message: impl Into<String>) {
        self.faults.push(Fault { location, kind, message: message.into() });
        self.phenotype.cur_num_errors += 1;
    }

    pub fn is_dead(&self) -> bool {
        self.phenotype.to_die
    }

    pub fn die(&mut self) {
        self.phenotype.to_die = true;
    }

    /// Next environmental input, cycling through the input list.
    pub fn next_input(&mut self) -> i32 {
        if self.inputs.is_empty() {
            return 0;
        }
        let value = self.inputs[self.input_pointer % self.inputs.len()];
        self.input_pointer = (self.input_pointer + 1) % self.inputs.len();
        value
    }

    pub fn do_input(&mut self, value: i32) {
        push_front_bounded(&mut self.input_buffer, value);
    }

    /// Record an output and credit any tasks it completes.
    pub fn do_output(&mut self, value: i32, env: &dyn TaskEvaluator) {
        push_front_bounded(&mut self.output_buffer, value);
        let inputs: Vec<i32> = self.input_buffer.iter().copied().collect();
        let result = env.evaluate(&inputs, value);
        for task in result.tasks {
            if let Some(count) = self.phenotype.cur_task_count.get_mut(task) {
                // Each task is rewarded once per gestation.
                if *count == 0 {
                    self.phenotype.cur_bonus *= env.bonus(task);
                }
                *count += 1;
            }
        }
    }

    pub fn test_copy_mut<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        test_prob(self.mut_rates.copy_mut_prob, rng)
    }

    pub fn test_divide_mut<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        test_prob(self.mut_rates.divide_mut_prob, rng)
    }

    pub fn test_divide_ins<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        test_prob(self.mut_rates.divide_ins_prob, rng)
    }

    pub fn test_divide_del<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        test_prob(self.mut_rates.divide_del_prob, rng)
    }

    /// Finish a divide: update the phenotype and hand the offspring to the host.
    ///
    /// Returns whether the parent survives.
    pub fn activate_divide(&mut self, host: &mut dyn OrganismHost) -> bool {
        self.phenotype.copy_true = self.offspring == self.genome;
        let genome_length = self.genome.len();
        let cfg = self.phenotype_cfg.clone();
        self.phenotype.divide_reset(genome_length, &cfg);
        self.divided = true;
        let offspring = self.offspring.clone();
        host.activate_divide(self, offspring)
    }
}

#[inline]
pub fn test_prob<R: Rng + ?Sized>(p: f64, rng: &mut R) -> bool {
    p > 0.0 && rng.random::<f64>() < p
}

fn push_front_bounded(buf: &mut VecDeque<i32>, value: i32) {
    buf.push_front(value);
    buf.truncate(IO_BUFFER_SIZE);
}
