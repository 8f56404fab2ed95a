//! Mutational neighborhood
//!
//! Evaluates every single-instruction substitution of a genome, and
//! optionally every pair of substitutions, against the base genome's
//! fitness. Results become readable once the last site has been processed.

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info};

use crate::analysis::{complexity, run_sites, AnalysisConfig, Baseline, FitnessClass, StepStats};
use crate::error::AnalysisError;
use crate::sequence::{Instruction, Sequence};
use crate::test_cpu::TestCpu;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing,
    Processing,
    Complete,
}

/// First mutation of a pair that conferred the target task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingTarget {
    pub site: usize,
    pub inst: Instruction,
}

/// Target-gaining pairs, bucketed by the single-step effect of their first mutation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PairTargets {
    pub dead: u64,
    pub neg: u64,
    pub neut: u64,
    pub pos: u64,
    pub size_neg: f64,
    pub size_pos: f64,
}

impl PairTargets {
    /// Resolve pending pairs against the finished single-step fitness table.
    pub fn classify(pending: &[PendingTarget], fitness: &[Vec<f64>], base: &Baseline) -> Self {
        let mut targets = PairTargets::default();
        for p in pending {
            let f = fitness.get(p.site).and_then(|row| row.get(p.inst.op())).copied().unwrap_or(0.0);
            match base.classify(f) {
                FitnessClass::Dead => targets.dead += 1,
                FitnessClass::Negative => {
                    targets.neg += 1;
                    targets.size_neg += f;
                }
                FitnessClass::Neutral => targets.neut += 1,
                FitnessClass::Positive => {
                    targets.pos += 1;
                    targets.size_pos += f;
                }
            }
        }
        targets
    }

    pub fn total(&self) -> u64 {
        self.dead + self.neg + self.neut + self.pos
    }
}

/// Aggregated statistics of one mutational distance.
#[derive(Clone, Debug)]
pub struct StepSummary {
    pub stats: StepStats,
    pub total_entropy: f64,
    pub complexity: f64,
}

impl StepSummary {
    fn new(stats: StepStats, genome_length: usize, alphabet: usize) -> Self {
        let total_entropy = stats.total_entropy(genome_length, alphabet);
        Self { complexity: complexity(genome_length, total_entropy), total_entropy, stats }
    }
}

#[derive(Clone, Debug)]
pub struct NeighborhoodResults {
    pub base: Baseline,
    pub alphabet: usize,
    pub one_step: StepSummary,
    pub two_step: Option<StepSummary>,
    pub pair_targets: PairTargets,
    /// Single-step statistics of each site
    pub sites: Vec<StepStats>,
    /// Fitness of each single substitution, indexed by site then opcode
    pub fitness: Vec<Vec<f64>>,
}

impl NeighborhoodResults {
    /// Entropy contributed by one site, in units of the alphabet size.
    pub fn site_entropy(&self, site: usize) -> f64 {
        self.sites
            .get(site)
            .map_or(0.0, |stats| stats.total_entropy(self.base.genome.len(), self.alphabet))
    }
}

struct SiteResult {
    one: StepStats,
    two: Option<StepStats>,
    fitness: Vec<f64>,
    pending: Vec<PendingTarget>,
}

pub struct MutationalNeighborhood {
    genome: Sequence,
    config: AnalysisConfig,
    phase: Mutex<Phase>,
    results: RwLock<Option<NeighborhoodResults>>,
}

impl MutationalNeighborhood {
    pub fn new(genome: Sequence, config: &AnalysisConfig) -> Self {
        Self {
            genome,
            config: config.clone(),
            phase: Mutex::new(Phase::Uninitialized),
            results: RwLock::new(None),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Aggregated results, once processing is complete.
    pub fn results(&self) -> Option<MappedRwLockReadGuard<'_, NeighborhoodResults>> {
        RwLockReadGuard::try_map(self.results.read(), |r| r.as_ref()).ok()
    }

    pub fn process(&self, cpu: &TestCpu<'_>) -> Result<(), AnalysisError> {
        if self.genome.is_empty() {
            return Err(AnalysisError::EmptyGenome);
        }
        *self.phase.lock() = Phase::Initializing;
        *self.results.write() = None;
        let base = Baseline::measure(cpu, &self.genome, &self.config);
        let alphabet = cpu.inst_set().len();
        info!(
            length = self.genome.len(),
            alphabet,
            two_step = self.config.two_step,
            base_fitness = base.fitness,
            "processing mutational neighborhood"
        );

        *self.phase.lock() = Phase::Processing;
        run_sites(
            self.genome.len(),
            self.config.threads,
            |site| self.process_site(cpu, &base, site),
            |sites| {
                let results = self.complete(&base, alphabet, sites);
                *self.results.write() = Some(results);
                *self.phase.lock() = Phase::Complete;
            },
        )
    }

    fn process_site(&self, cpu: &TestCpu<'_>, base: &Baseline, site: usize) -> SiteResult {
        let alphabet = cpu.inst_set().len();
        let length = base.genome.len();
        let mut one = StepStats::new(base, length);
        let mut two = self.config.two_step.then(|| StepStats::new(base, length));
        let mut fitness = vec![0.0; alphabet];
        let mut pending = Vec::new();

        let original = base.genome.get(site);
        if let Some(f) = fitness.get_mut(original.op()) {
            *f = base.fitness;
        }

        let mut mutant = base.genome.clone();
        for op in 0..alphabet {
            let inst = Instruction(op as u8);
            if inst == original {
                continue;
            }
            mutant.set(site, inst);
            let eval = cpu.evaluate(&mutant);
            one.record(base, site, eval.fitness, &mutant);
            fitness[op] = eval.fitness;
            if eval.fitness != 0.0 {
                one.record_tasks(base.task_change(&eval.tasks), eval.fitness);
            }
            if let Some(two) = two.as_mut() {
                two_step(cpu, base, site, &mut mutant, two, &mut pending);
            }
        }
        debug!(site, total = one.total, neutral = one.neut, "site processed");
        SiteResult { one, two, fitness, pending }
    }

    fn complete(&self, base: &Baseline, alphabet: usize, sites: Vec<SiteResult>) -> NeighborhoodResults {
        let length = base.genome.len();
        let mut one = StepStats::new(base, length);
        let mut two = self.config.two_step.then(|| StepStats::new(base, length));
        let mut fitness = Vec::with_capacity(sites.len());
        let mut pending = Vec::new();
        let mut per_site = Vec::with_capacity(sites.len());

        for site in sites {
            one.merge(&site.one);
            if let (Some(total), Some(stats)) = (two.as_mut(), site.two.as_ref()) {
                total.merge(stats);
            }
            fitness.push(site.fitness);
            pending.extend(site.pending);
            per_site.push(site.one);
        }

        let pair_targets = PairTargets::classify(&pending, &fitness, base);
        let one_step = StepSummary::new(one, length, alphabet);
        let two_step = two.map(|stats| StepSummary::new(stats, length, alphabet));
        info!(
            one_step = one_step.stats.total,
            two_step = two_step.as_ref().map_or(0, |s| s.stats.total),
            complexity = one_step.complexity,
            "mutational neighborhood complete"
        );
        NeighborhoodResults {
            base: base.clone(),
            alphabet,
            one_step,
            two_step,
            pair_targets,
            sites: per_site,
            fitness,
        }
    }
}

/// Every substitution at a site after `first`, holding the mutation at `first`.
fn two_step(
    cpu: &TestCpu<'_>,
    base: &Baseline,
    first: usize,
    mutant: &mut Sequence,
    stats: &mut StepStats,
    pending: &mut Vec<PendingTarget>,
) {
    let alphabet = cpu.inst_set().len();
    for line in first + 1..mutant.len() {
        let original = mutant.get(line);
        for op in 0..alphabet {
            let inst = Instruction(op as u8);
            if inst == original {
                continue;
            }
            mutant.set(line, inst);
            let eval = cpu.evaluate(mutant);
            stats.record(base, line, eval.fitness, mutant);
            if eval.fitness != 0.0 {
                let change = base.task_change(&eval.tasks);
                stats.record_tasks(change, eval.fitness);
                if change.target {
                    pending.push(PendingTarget { site: first, inst: mutant.get(first) });
                }
            }
        }
        mutant.set(line, original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::LogicNine;
    use crate::hardware::HardwareConfig;
    use crate::inst_lib::HardwareKind;
    use crate::inst_set::InstSet;
    use crate::organism::PhenotypeConfig;
    use crate::test_cpu::TestCpuConfig;

    const REPLICATOR: [&str; 15] = [
        "h-alloc", "h-search", "nop-C", "nop-A", "mov-head", "nop-C", "h-search", "h-copy", "if-label", "nop-C",
        "nop-A", "h-divide", "mov-head", "nop-A", "nop-B",
    ];

    const REPLICATOR_SET: [&str; 9] =
        ["nop-A", "nop-B", "nop-C", "h-alloc", "h-search", "mov-head", "h-copy", "if-label", "h-divide"];

    fn genome(set: &InstSet, names: &[&str]) -> Sequence {
        Sequence::from_insts(names.iter().map(|n| set.inst_by_name(n).unwrap()).collect())
    }

    fn run(set: &InstSet, genome: Sequence, config: &AnalysisConfig) -> MutationalNeighborhood {
        let hardware = HardwareConfig::default();
        let phenotype = PhenotypeConfig::default();
        let env = LogicNine::new();
        let cpu = TestCpu::new(set, &hardware, &phenotype, &env, &TestCpuConfig::default());
        let hood = MutationalNeighborhood::new(genome, config);
        assert_eq!(hood.phase(), Phase::Uninitialized);
        assert!(hood.results().is_none());
        hood.process(&cpu).unwrap();
        hood
    }

    #[test]
    fn test_one_step_partition() {
        let set = InstSet::from_names(HardwareKind::Cpu, &REPLICATOR_SET).unwrap();
        let config = AnalysisConfig { two_step: false, threads: 2, ..Default::default() };
        let hood = run(&set, genome(&set, &REPLICATOR), &config);
        assert_eq!(hood.phase(), Phase::Complete);
        let results = hood.results().unwrap();

        assert!(results.base.fitness > 0.0);
        assert_eq!(results.sites.len(), REPLICATOR.len());
        for site in &results.sites {
            assert_eq!(site.dead + site.neg + site.neut + site.pos, (set.len() - 1) as u64);
        }
        assert_eq!(results.one_step.stats.total, (REPLICATOR.len() * (set.len() - 1)) as u64);
        assert!(results.two_step.is_none());

        // Unmutated entries hold the base fitness.
        for (site, row) in results.fitness.iter().enumerate() {
            let original = results.base.genome.get(site);
            assert_eq!(row[original.op()], results.base.fitness);
        }
        let entropy = results.one_step.total_entropy;
        assert!(entropy >= 0.0 && entropy <= REPLICATOR.len() as f64);
        let by_site: f64 = (0..REPLICATOR.len()).map(|site| results.site_entropy(site)).sum();
        assert!((by_site - entropy).abs() < 1e-9);
        assert_eq!(results.site_entropy(REPLICATOR.len()), 0.0);
        assert!((results.one_step.complexity + entropy - REPLICATOR.len() as f64).abs() < 1e-9);
    }

    #[test]
    fn test_dead_genome_two_step() {
        let set = InstSet::from_names(HardwareKind::Cpu, &["nop-A", "nop-B", "inc"]).unwrap();
        let config = AnalysisConfig { threads: 1, ..Default::default() };
        let hood = run(&set, genome(&set, &["nop-A", "inc", "nop-B"]), &config);
        let results = hood.results().unwrap();

        assert_eq!(results.base.fitness, 0.0);
        assert_eq!(results.one_step.stats.total, 6);
        assert_eq!(results.one_step.stats.dead, 6);
        let two = results.two_step.as_ref().unwrap();
        // (2 × 2 × 2) from site 0 plus (2 × 2) from site 1.
        assert_eq!(two.stats.total, 12);
        assert_eq!(two.stats.dead, 12);
        // With a zero base every mutant reaches the neutral floor.
        assert!((results.one_step.total_entropy - 3.0).abs() < 1e-9);
        assert!(results.one_step.complexity.abs() < 1e-9);
        assert_eq!(results.pair_targets.total(), 0);
    }

    #[test]
    fn test_pending_pairs_use_first_site_class() {
        let base = Baseline {
            genome: Sequence::from_insts(vec![Instruction(0); 3]),
            fitness: 1.0,
            merit: 1.0,
            gestation_time: 10,
            tasks: vec![0; 9],
            target: Some(8),
            neut_min: 0.99,
            neut_max: 1.01,
        };
        let fitness = vec![vec![1.0, 0.0, 0.5, 2.0], vec![1.0, 1.0, 3.0, 0.0], vec![1.0, 0.2, 0.2, 0.2]];
        let pending = [
            PendingTarget { site: 0, inst: Instruction(1) },
            PendingTarget { site: 0, inst: Instruction(2) },
            PendingTarget { site: 0, inst: Instruction(3) },
            PendingTarget { site: 1, inst: Instruction(1) },
            // The second mutation here would be dead; only the first counts.
            PendingTarget { site: 1, inst: Instruction(2) },
        ];
        let targets = PairTargets::classify(&pending, &fitness, &base);
        assert_eq!((targets.dead, targets.neg, targets.neut, targets.pos), (1, 1, 1, 2));
        assert_eq!(targets.size_neg, 0.5);
        assert_eq!(targets.size_pos, 5.0);
    }

    #[test]
    fn test_empty_genome_is_rejected() {
        let set = InstSet::default_for(HardwareKind::Cpu);
        let hardware = HardwareConfig::default();
        let phenotype = PhenotypeConfig::default();
        let env = LogicNine::new();
        let cpu = TestCpu::new(&set, &hardware, &phenotype, &env, &TestCpuConfig::default());
        let hood = MutationalNeighborhood::new(Sequence::new(), &AnalysisConfig::default());
        assert!(matches!(hood.process(&cpu), Err(AnalysisError::EmptyGenome)));
    }
}
