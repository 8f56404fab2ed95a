//! Single-step fitness landscape
//!
//! Sweeps every point substitution, single insertion or single deletion of
//! a genome and summarises the fitness of the resulting mutants.

use std::fmt;

use parking_lot::Mutex;
use tracing::info;

use crate::analysis::{complexity, run_sites, AnalysisConfig, Baseline, StepStats};
use crate::error::AnalysisError;
use crate::sequence::{Instruction, Sequence};
use crate::test_cpu::TestCpu;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Point,
    Insert,
    Delete,
}

impl MutationKind {
    pub const ALL: [MutationKind; 3] = [MutationKind::Point, MutationKind::Insert, MutationKind::Delete];

    /// Sites swept for a genome of `length`: insertions also go after the last instruction.
    pub fn num_sites(self, length: usize) -> usize {
        match self {
            MutationKind::Insert => length + 1,
            MutationKind::Point | MutationKind::Delete => length,
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Point => "point",
            MutationKind::Insert => "insert",
            MutationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct LandscapeResults {
    pub kind: MutationKind,
    pub base: Baseline,
    pub stats: StepStats,
    pub total_entropy: f64,
    pub complexity: f64,
}

pub struct Landscape {
    genome: Sequence,
    config: AnalysisConfig,
}

impl Landscape {
    pub fn new(genome: Sequence, config: &AnalysisConfig) -> Self {
        Self { genome, config: config.clone() }
    }

    pub fn process(&self, cpu: &TestCpu<'_>, kind: MutationKind) -> Result<LandscapeResults, AnalysisError> {
        if self.genome.is_empty() {
            return Err(AnalysisError::EmptyGenome);
        }
        let base = Baseline::measure(cpu, &self.genome, &self.config);
        let alphabet = cpu.inst_set().len();
        let num_sites = kind.num_sites(self.genome.len());

        let sites = Mutex::new(Vec::new());
        run_sites(
            num_sites,
            self.config.threads,
            |site| sweep_site(cpu, &base, kind, site, num_sites),
            |results| *sites.lock() = results,
        )?;

        let mut stats = StepStats::new(&base, num_sites);
        for site in sites.into_inner() {
            stats.merge(&site);
        }
        let total_entropy = stats.total_entropy(num_sites, alphabet);
        let results = LandscapeResults {
            kind,
            complexity: complexity(self.genome.len(), total_entropy),
            total_entropy,
            base,
            stats,
        };
        info!(
            %kind,
            mutants = results.stats.total,
            peak = results.stats.peak_fitness,
            "landscape processed"
        );
        Ok(results)
    }
}

fn sweep_site(cpu: &TestCpu<'_>, base: &Baseline, kind: MutationKind, site: usize, num_sites: usize) -> StepStats {
    let mut stats = StepStats::new(base, num_sites);
    let mut test = |mutant: &Sequence| {
        let eval = cpu.evaluate(mutant);
        stats.record(base, site, eval.fitness, mutant);
        if eval.fitness != 0.0 {
            stats.record_tasks(base.task_change(&eval.tasks), eval.fitness);
        }
    };
    let alphabet = cpu.inst_set().len();
    match kind {
        MutationKind::Point => {
            let original = base.genome.get(site);
            let mut mutant = base.genome.clone();
            for op in 0..alphabet {
                let inst = Instruction(op as u8);
                if inst != original {
                    mutant.set(site, inst);
                    test(&mutant);
                }
            }
        }
        MutationKind::Insert => {
            for op in 0..alphabet {
                let mut mutant = base.genome.clone();
                mutant.insert(site, Instruction(op as u8));
                test(&mutant);
            }
        }
        MutationKind::Delete => {
            let mut mutant = base.genome.clone();
            mutant.remove(site);
            test(&mutant);
        }
    }
    stats
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

    fn sweep(kind: MutationKind) -> LandscapeResults {
        let set = InstSet::from_names(HardwareKind::Cpu, &REPLICATOR_SET).unwrap();
        let hardware = HardwareConfig::default();
        let phenotype = PhenotypeConfig::default();
        let env = LogicNine::new();
        let cpu = TestCpu::new(&set, &hardware, &phenotype, &env, &TestCpuConfig::default());
        let genome = Sequence::from_insts(REPLICATOR.iter().map(|n| set.inst_by_name(n).unwrap()).collect());
        let config = AnalysisConfig { threads: 2, ..Default::default() };
        Landscape::new(genome, &config).process(&cpu, kind).unwrap()
    }

    #[test]
    fn test_point_sweep() {
        let results = sweep(MutationKind::Point);
        let s = &results.stats;
        assert_eq!(s.total, 15 * 8);
        assert_eq!(s.dead + s.neg + s.neut + s.pos, s.total);
        assert!(s.dead > 0);
        assert!(s.peak_fitness >= results.base.fitness);
        assert!((results.complexity + results.total_entropy - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_insert_and_delete_sweeps() {
        let insert = sweep(MutationKind::Insert);
        assert_eq!(insert.stats.total, 16 * 9);
        assert_eq!(insert.stats.site_count.len(), 16);

        let delete = sweep(MutationKind::Delete);
        assert_eq!(delete.stats.total, 15);
        // Removing h-divide kills the replicator.
        assert!(delete.stats.dead >= 1);
        assert!(delete.stats.site_count.iter().all(|&c| c <= 1));
    }

    #[test]
    fn test_mutation_kind_sites() {
        assert_eq!(MutationKind::Insert.num_sites(10), 11);
        assert_eq!(MutationKind::Delete.num_sites(10), 10);
        assert_eq!(MutationKind::Point.to_string(), "point");
    }
}
