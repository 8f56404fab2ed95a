//! Shared machinery of the mutational analyses
//!
//! Every analysis measures a base genome once, then evaluates mutants of it
//! site by site. Sites are claimed from an atomic counter by rayon workers;
//! each worker writes its result into that site's own slot, and the worker
//! finishing the last site hands all slots to the aggregation step.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::environment::TaskEvaluator;
use crate::error::AnalysisError;
use crate::sequence::Sequence;
use crate::test_cpu::TestCpu;

/// Mutational analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Mutants below base fitness × neutral_min are deleterious
    pub neutral_min: f64,
    /// Mutants above base fitness × neutral_max are beneficial
    pub neutral_max: f64,
    pub two_step: bool,
    /// Task tracked for gains; the last task when unset or unknown
    pub target_task: Option<String>,
    pub knockout_pairs: bool,
    pub knockout_chart: bool,
    /// Worker threads, 0 for the rayon default
    pub threads: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            neutral_min: 0.99,
            neutral_max: 1.01,
            two_step: true,
            target_task: None,
            knockout_pairs: true,
            knockout_chart: true,
            threads: 0,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        if self.neutral_min > self.neutral_max {
            return Err(format!(
                "analysis.neutral_min ({}) must not exceed analysis.neutral_max ({})",
                self.neutral_min, self.neutral_max
            ));
        }
        if self.neutral_min < 0.0 {
            return Err("analysis.neutral_min must not be negative".to_string());
        }
        if self.neutral_min > 1.0 || self.neutral_max < 1.0 {
            warnings.push("neutral zone does not contain the base fitness".to_string());
        }
        Ok(warnings)
    }

    /// Index of the target task in `env`.
    pub fn resolve_target(&self, env: &dyn TaskEvaluator) -> Option<usize> {
        let last = env.num_tasks().checked_sub(1)?;
        match &self.target_task {
            None => Some(last),
            Some(name) => env.task_index(name).or_else(|| {
                warn!(task = %name, fallback = env.task_name(last), "unknown target task");
                Some(last)
            }),
        }
    }
}

/// Effect of a mutation on fitness, relative to the base genome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FitnessClass {
    Dead,
    Negative,
    Neutral,
    Positive,
}

impl FitnessClass {
    pub fn classify(fitness: f64, neut_min: f64, neut_max: f64) -> Self {
        if fitness == 0.0 {
            FitnessClass::Dead
        } else if fitness < neut_min {
            FitnessClass::Negative
        } else if fitness <= neut_max {
            FitnessClass::Neutral
        } else {
            FitnessClass::Positive
        }
    }
}

/// Task differences of a living mutant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskChange {
    /// A task of the base genome is no longer performed
    pub knockout: bool,
    /// A task the base genome lacks is performed
    pub gained: bool,
    /// The target task specifically was gained
    pub target: bool,
}

/// The unmutated genome's measurements.
#[derive(Clone, Debug)]
pub struct Baseline {
    pub genome: Sequence,
    pub fitness: f64,
    pub merit: f64,
    pub gestation_time: u64,
    pub tasks: Vec<u32>,
    pub target: Option<usize>,
    pub neut_min: f64,
    pub neut_max: f64,
}

impl Baseline {
    pub fn measure(cpu: &TestCpu<'_>, genome: &Sequence, config: &AnalysisConfig) -> Self {
        let eval = cpu.evaluate(genome);
        let target = config.resolve_target(cpu.env());
        debug!(fitness = eval.fitness, merit = eval.merit, gestation = eval.gestation_time, "base genome measured");
        Self {
            genome: genome.clone(),
            fitness: eval.fitness,
            merit: eval.merit,
            gestation_time: eval.gestation_time,
            tasks: eval.tasks,
            target,
            neut_min: eval.fitness * config.neutral_min,
            neut_max: eval.fitness * config.neutral_max,
        }
    }

    pub fn classify(&self, fitness: f64) -> FitnessClass {
        FitnessClass::classify(fitness, self.neut_min, self.neut_max)
    }

    /// Whether the base genome performs the target task.
    pub fn has_target(&self) -> bool {
        self.target.is_some_and(|t| self.tasks.get(t).is_some_and(|&c| c > 0))
    }

    pub fn task_change(&self, tasks: &[u32]) -> TaskChange {
        let mut change = TaskChange::default();
        for (&base, &cur) in self.tasks.iter().zip(tasks) {
            if base > 0 && cur == 0 {
                change.knockout = true;
            } else if base == 0 && cur > 0 {
                change.gained = true;
            }
        }
        if let Some(t) = self.target {
            change.target = !self.has_target() && tasks.get(t).is_some_and(|&c| c > 0);
        }
        change
    }
}

/// Running statistics over a set of mutants.
#[derive(Clone, Debug)]
pub struct StepStats {
    pub total: u64,
    pub total_fitness: f64,
    pub total_sqr_fitness: f64,
    pub dead: u64,
    pub neg: u64,
    pub neut: u64,
    pub pos: u64,
    pub size_neg: f64,
    pub size_pos: f64,
    pub peak_fitness: f64,
    pub peak_genome: Sequence,
    /// Per site, mutants at least as fit as the neutral floor
    pub site_count: Vec<u32>,

    pub task_knockout: u64,
    pub task_size_knockout: f64,
    pub task_total: u64,
    pub task_size_total: f64,
    pub task_target: u64,
    pub task_size_target: f64,
}

impl StepStats {
    pub fn new(base: &Baseline, num_sites: usize) -> Self {
        Self {
            total: 0,
            total_fitness: 0.0,
            total_sqr_fitness: 0.0,
            dead: 0,
            neg: 0,
            neut: 0,
            pos: 0,
            size_neg: 0.0,
            size_pos: 0.0,
            peak_fitness: base.fitness,
            peak_genome: base.genome.clone(),
            site_count: vec![0; num_sites],
            task_knockout: 0,
            task_size_knockout: 0.0,
            task_total: 0,
            task_size_total: 0.0,
            task_target: 0,
            task_size_target: 0.0,
        }
    }

    /// Count one mutant at `site`.
    pub fn record(&mut self, base: &Baseline, site: usize, fitness: f64, genome: &Sequence) -> FitnessClass {
        self.total += 1;
        self.total_fitness += fitness;
        self.total_sqr_fitness += fitness * fitness;
        let class = base.classify(fitness);
        match class {
            FitnessClass::Dead => self.dead += 1,
            FitnessClass::Negative => {
                self.neg += 1;
                self.size_neg += fitness;
            }
            FitnessClass::Neutral => self.neut += 1,
            FitnessClass::Positive => {
                self.pos += 1;
                self.size_pos += fitness;
                if fitness > self.peak_fitness {
                    self.peak_fitness = fitness;
                    self.peak_genome = genome.clone();
                }
            }
        }
        if fitness >= base.neut_min {
            if let Some(count) = self.site_count.get_mut(site) {
                *count += 1;
            }
        }
        class
    }

    pub fn record_tasks(&mut self, change: TaskChange, fitness: f64) {
        if change.knockout {
            self.task_knockout += 1;
            self.task_size_knockout += fitness;
        }
        if change.gained {
            self.task_total += 1;
            self.task_size_total += fitness;
        }
        if change.target {
            self.task_target += 1;
            self.task_size_target += fitness;
        }
    }

    pub fn merge(&mut self, other: &StepStats) {
        self.total += other.total;
        self.total_fitness += other.total_fitness;
        self.total_sqr_fitness += other.total_sqr_fitness;
        self.dead += other.dead;
        self.neg += other.neg;
        self.neut += other.neut;
        self.pos += other.pos;
        self.size_neg += other.size_neg;
        self.size_pos += other.size_pos;
        if other.peak_fitness > self.peak_fitness {
            self.peak_fitness = other.peak_fitness;
            self.peak_genome = other.peak_genome.clone();
        }
        if self.site_count.len() < other.site_count.len() {
            self.site_count.resize(other.site_count.len(), 0);
        }
        for (mine, theirs) in self.site_count.iter_mut().zip(&other.site_count) {
            *mine += theirs;
        }
        self.task_knockout += other.task_knockout;
        self.task_size_knockout += other.task_size_knockout;
        self.task_total += other.task_total;
        self.task_size_total += other.task_size_total;
        self.task_target += other.task_target;
        self.task_size_target += other.task_size_target;
    }

    pub fn prob_dead(&self) -> f64 {
        ratio(self.dead, self.total)
    }

    pub fn prob_neg(&self) -> f64 {
        ratio(self.neg, self.total)
    }

    pub fn prob_neut(&self) -> f64 {
        ratio(self.neut, self.total)
    }

    pub fn prob_pos(&self) -> f64 {
        ratio(self.pos, self.total)
    }

    pub fn average_fitness(&self) -> f64 {
        average(self.total_fitness, self.total)
    }

    pub fn average_sqr_fitness(&self) -> f64 {
        average(self.total_sqr_fitness, self.total)
    }

    pub fn average_size_neg(&self) -> f64 {
        average(self.size_neg, self.neg)
    }

    pub fn average_size_pos(&self) -> f64 {
        average(self.size_pos, self.pos)
    }

    pub fn prob_knockout(&self) -> f64 {
        ratio(self.task_knockout, self.total)
    }

    pub fn average_size_knockout(&self) -> f64 {
        average(self.task_size_knockout, self.task_knockout)
    }

    pub fn prob_task(&self) -> f64 {
        ratio(self.task_total, self.total)
    }

    pub fn average_size_task(&self) -> f64 {
        average(self.task_size_total, self.task_total)
    }

    pub fn prob_target(&self) -> f64 {
        ratio(self.task_target, self.total)
    }

    pub fn average_size_target(&self) -> f64 {
        average(self.task_size_target, self.task_target)
    }

    /// Sum over sites of log(legal states + 1) in units of the alphabet size.
    pub fn total_entropy(&self, num_sites: usize, alphabet: usize) -> f64 {
        total_entropy(&self.site_count[..num_sites.min(self.site_count.len())], alphabet)
    }
}

/// Entropy of a set of per-site legal-state counts.
pub fn total_entropy(site_count: &[u32], alphabet: usize) -> f64 {
    if alphabet < 2 {
        return 0.0;
    }
    let max_ent = (alphabet as f64).ln();
    site_count.iter().map(|&c| (c as f64 + 1.0).ln() / max_ent).sum()
}

pub fn complexity(genome_length: usize, entropy: f64) -> f64 {
    genome_length as f64 - entropy
}

pub(crate) fn ratio(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

pub(crate) fn average(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Claim counter, completion counter and one result slot per site.
pub(crate) struct SiteJobs<T> {
    next: AtomicUsize,
    completed: AtomicUsize,
    slots: Vec<Mutex<Option<T>>>,
}

impl<T> SiteJobs<T> {
    pub fn new(num_sites: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            slots: (0..num_sites).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn num_sites(&self) -> usize {
        self.slots.len()
    }

    /// Next unprocessed site, if any remain.
    pub fn claim(&self) -> Option<usize> {
        let site = self.next.fetch_add(1, Ordering::Relaxed);
        (site < self.slots.len()).then_some(site)
    }

    /// Store the result of `site`. True for the call completing the last site.
    pub fn complete(&self, site: usize, result: T) -> bool {
        *self.slots[site].lock() = Some(result);
        self.completed.fetch_add(1, Ordering::AcqRel) + 1 == self.slots.len()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Take every stored result, in site order.
    pub fn drain(&self) -> Vec<T> {
        self.slots.iter().filter_map(|slot| slot.lock().take()).collect()
    }
}

/// Run `job` once for every site on a worker pool, then `finish` exactly
/// once with all results in site order, on the worker that finished last.
pub fn run_sites<T, J, F>(num_sites: usize, threads: usize, job: J, finish: F) -> Result<(), AnalysisError>
where
    T: Send,
    J: Fn(usize) -> T + Sync,
    F: Fn(Vec<T>) + Sync,
{
    if num_sites == 0 {
        finish(Vec::new());
        return Ok(());
    }
    let jobs = SiteJobs::new(num_sites);
    let work = || {
        (0..jobs.num_sites()).into_par_iter().for_each(|_| {
            if let Some(site) = jobs.claim() {
                let result = job(site);
                if jobs.complete(site, result) {
                    finish(jobs.drain());
                }
            }
        });
    };
    with_pool(threads, work)?;
    debug!(sites = jobs.completed(), "site jobs finished");
    Ok(())
}

/// Run `work` on a dedicated pool of `threads` workers, or on the global
/// pool when `threads` is 0.
pub fn with_pool<R, W>(threads: usize, work: W) -> Result<R, AnalysisError>
where
    R: Send,
    W: FnOnce() -> R + Send,
{
    if threads > 0 {
        Ok(rayon::ThreadPoolBuilder::new().num_threads(threads).build()?.install(work))
    } else {
        Ok(work())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::LogicNine;
    use crate::sequence::Instruction;

    fn baseline(fitness: f64, tasks: Vec<u32>) -> Baseline {
        Baseline {
            genome: Sequence::from_insts(vec![Instruction(0); 4]),
            fitness,
            merit: 1.0,
            gestation_time: 10,
            tasks,
            target: Some(2),
            neut_min: fitness * 0.99,
            neut_max: fitness * 1.01,
        }
    }

    #[test]
    fn test_classification_thresholds() {
        let base = baseline(1.0, vec![0; 3]);
        assert_eq!(base.classify(0.0), FitnessClass::Dead);
        assert_eq!(base.classify(0.5), FitnessClass::Negative);
        assert_eq!(base.classify(0.99), FitnessClass::Neutral);
        assert_eq!(base.classify(1.01), FitnessClass::Neutral);
        assert_eq!(base.classify(1.5), FitnessClass::Positive);
    }

    #[test]
    fn test_record_and_merge() {
        let base = baseline(1.0, vec![0; 3]);
        let better = Sequence::from_insts(vec![Instruction(1); 4]);
        let mut a = StepStats::new(&base, 4);
        a.record(&base, 0, 0.0, &base.genome);
        a.record(&base, 0, 0.5, &base.genome);
        a.record(&base, 1, 1.0, &base.genome);
        let mut b = StepStats::new(&base, 4);
        b.record(&base, 2, 2.0, &better);
        a.merge(&b);

        assert_eq!((a.dead, a.neg, a.neut, a.pos, a.total), (1, 1, 1, 1, 4));
        assert_eq!(a.site_count, vec![0, 1, 1, 0]);
        assert_eq!(a.peak_fitness, 2.0);
        assert_eq!(a.peak_genome, better);
        assert!((a.average_fitness() - 0.875).abs() < 1e-12);
        assert_eq!(a.average_size_neg(), 0.5);
        assert_eq!(a.prob_dead(), 0.25);
    }

    #[test]
    fn test_empty_averages_are_zero() {
        let base = baseline(1.0, vec![0; 3]);
        let stats = StepStats::new(&base, 2);
        assert_eq!(stats.average_fitness(), 0.0);
        assert_eq!(stats.average_size_pos(), 0.0);
        assert_eq!(stats.prob_pos(), 0.0);
    }

    #[test]
    fn test_task_change() {
        let base = baseline(1.0, vec![1, 0, 0]);
        let change = base.task_change(&[0, 1, 1]);
        assert!(change.knockout && change.gained && change.target);
        assert_eq!(base.task_change(&[1, 0, 0]), TaskChange::default());

        let has_target = baseline(1.0, vec![0, 0, 1]);
        assert!(!has_target.task_change(&[0, 0, 2]).target);
    }

    #[test]
    fn test_entropy_of_constrained_genome() {
        let counts = vec![0u32; 12];
        let entropy = total_entropy(&counts, 26);
        assert_eq!(entropy, 0.0);
        assert_eq!(complexity(12, entropy), 12.0);

        // Every alternative legal: each site contributes one full unit.
        let entropy = total_entropy(&[25, 25], 26);
        assert!((entropy - 2.0).abs() < 1e-12);
        assert!(complexity(2, entropy).abs() < 1e-12);
    }

    #[test]
    fn test_target_resolution() {
        let env = LogicNine::new();
        let mut config = AnalysisConfig::default();
        assert_eq!(config.resolve_target(&env), Some(8));
        config.target_task = Some("nand".to_string());
        assert_eq!(config.resolve_target(&env), Some(1));
        config.target_task = Some("bogus".to_string());
        assert_eq!(config.resolve_target(&env), Some(8));
    }

    #[test]
    fn test_run_sites_finishes_once_in_order() {
        let finished = Mutex::new(Vec::new());
        let calls = AtomicUsize::new(0);
        run_sites(
            50,
            4,
            |site| site * 2,
            |results| {
                calls.fetch_add(1, Ordering::SeqCst);
                *finished.lock() = results;
            },
        )
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*finished.lock(), (0..50).map(|s| s * 2).collect::<Vec<_>>());

        let empty = Mutex::new(None);
        run_sites(0, 0, |site| site, |results: Vec<usize>| *empty.lock() = Some(results.len())).unwrap();
        assert_eq!(*empty.lock(), Some(0));
    }

    #[test]
    fn test_validate() {
        let mut config = AnalysisConfig::default();
        assert!(config.validate().unwrap().is_empty());
        config.neutral_min = 1.2;
        assert!(config.validate().is_err());
    }
}
