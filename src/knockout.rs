//! Knockout analysis
//!
//! Replaces each genome site with the null instruction and classifies the
//! effect on fitness. Optionally knocks out pairs of sites with the same
//! kind of single effect to find redundant or compensating information,
//! and records the tasks each knockout still performs.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::analysis::{run_sites, with_pool, AnalysisConfig};
use crate::error::AnalysisError;
use crate::sequence::{Instruction, Sequence};
use crate::test_cpu::TestCpu;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KnockoutEffect {
    Lethal,
    Detrimental,
    Neutral,
    Beneficial,
}

impl KnockoutEffect {
    fn of(fitness: f64, base_fitness: f64) -> Self {
        if fitness == 0.0 {
            KnockoutEffect::Lethal
        } else if fitness < base_fitness {
            KnockoutEffect::Detrimental
        } else if fitness == base_fitness {
            KnockoutEffect::Neutral
        } else {
            KnockoutEffect::Beneficial
        }
    }

    /// Lethal and detrimental sites carry information.
    pub fn is_harmful(self) -> bool {
        matches!(self, KnockoutEffect::Lethal | KnockoutEffect::Detrimental)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EffectCounts {
    pub dead: usize,
    pub neg: usize,
    pub neut: usize,
    pub pos: usize,
}

impl EffectCounts {
    fn tally(effects: &[KnockoutEffect]) -> Self {
        let mut counts = EffectCounts::default();
        for effect in effects {
            match effect {
                KnockoutEffect::Lethal => counts.dead += 1,
                KnockoutEffect::Detrimental => counts.neg += 1,
                KnockoutEffect::Neutral => counts.neut += 1,
                KnockoutEffect::Beneficial => counts.pos += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.dead + self.neg + self.neut + self.pos
    }

    /// Sites whose knockout hurts.
    pub fn information(&self) -> usize {
        self.dead + self.neg
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KnockoutInfo {
    pub base_fitness: f64,
    pub counts: EffectCounts,
    /// Single-knockout effect of each site
    pub effects: Vec<KnockoutEffect>,
    /// Counts after pair reclassification
    pub pairs: Option<EffectCounts>,
    /// Task counts of each site's knockout
    pub task_chart: Option<Vec<Vec<u32>>>,
}

impl KnockoutInfo {
    fn has(&self, pairs: bool, chart: bool) -> bool {
        (!pairs || self.pairs.is_some()) && (!chart || self.task_chart.is_some())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Knockouts {
    Pending,
    Computed(KnockoutInfo),
}

pub struct KnockoutAnalysis {
    genome: Sequence,
    threads: usize,
    state: Knockouts,
}

impl KnockoutAnalysis {
    pub fn new(genome: Sequence, config: &AnalysisConfig) -> Self {
        Self { genome, threads: config.threads, state: Knockouts::Pending }
    }

    pub fn state(&self) -> &Knockouts {
        &self.state
    }

    /// Knockout results with at least the requested detail, computing them
    /// when missing.
    pub fn info(&mut self, cpu: &TestCpu<'_>, pairs: bool, chart: bool) -> Result<&KnockoutInfo, AnalysisError> {
        let fresh = match &self.state {
            Knockouts::Computed(info) if info.has(pairs, chart) => None,
            _ => Some(self.compute(cpu, pairs, chart)?),
        };
        if let Some(info) = fresh {
            self.state = Knockouts::Computed(info);
        }
        match &self.state {
            Knockouts::Computed(info) => Ok(info),
            Knockouts::Pending => unreachable!("knockouts computed above"),
        }
    }

    fn compute(&self, cpu: &TestCpu<'_>, pairs: bool, chart: bool) -> Result<KnockoutInfo, AnalysisError> {
        if self.genome.is_empty() {
            return Err(AnalysisError::EmptyGenome);
        }
        let length = self.genome.len();
        let base_fitness = cpu.evaluate(&self.genome).fitness;
        info!(length, base_fitness, pairs, chart, "computing knockouts");

        if base_fitness == 0.0 {
            // A dead genome has no information to knock out.
            let effects = vec![KnockoutEffect::Neutral; length];
            let counts = EffectCounts::tally(&effects);
            return Ok(KnockoutInfo {
                base_fitness,
                counts,
                pairs: pairs.then_some(counts),
                task_chart: chart.then(|| vec![Vec::new(); length]),
                effects,
            });
        }

        let (set, null) = cpu.inst_set().with_null_inst();
        let ko_cpu = cpu.with_inst_set(&set);

        let singles = parking_lot::Mutex::new(Vec::new());
        run_sites(
            length,
            self.threads,
            |site| {
                let mut mutant = self.genome.clone();
                mutant.set(site, null);
                let eval = ko_cpu.evaluate(&mutant);
                (KnockoutEffect::of(eval.fitness, base_fitness), eval.tasks)
            },
            |results| *singles.lock() = results,
        )?;
        let (effects, tasks): (Vec<_>, Vec<_>) = singles.into_inner().into_iter().unzip();
        let counts = EffectCounts::tally(&effects);
        debug!(?counts, "single knockouts done");

        let pairs = if pairs {
            let fitness = self.pair_fitness(&ko_cpu, null, &effects)?;
            let reclassified =
                reclassify_pairs(&effects, base_fitness, |a, b| fitness.get(&(a, b)).copied());
            Some(EffectCounts::tally(&reclassified))
        } else {
            None
        };

        Ok(KnockoutInfo { base_fitness, counts, effects, pairs, task_chart: chart.then_some(tasks) })
    }

    /// Fitness of every double knockout whose sites share a harmful or a
    /// harmless single effect.
    fn pair_fitness(
        &self,
        cpu: &TestCpu<'_>,
        null: Instruction,
        effects: &[KnockoutEffect],
    ) -> Result<HashMap<(usize, usize), f64>, AnalysisError> {
        let candidates: Vec<(usize, usize)> = (0..effects.len())
            .flat_map(|a| (a + 1..effects.len()).map(move |b| (a, b)))
            .filter(|&(a, b)| effects[a].is_harmful() == effects[b].is_harmful())
            .collect();
        debug!(pairs = candidates.len(), "testing knockout pairs");
        with_pool(self.threads, || {
            candidates
                .par_iter()
                .map(|&(a, b)| {
                    let mut mutant = self.genome.clone();
                    mutant.set(a, null);
                    mutant.set(b, null);
                    ((a, b), cpu.evaluate(&mutant).fitness)
                })
                .collect()
        })
    }
}

/// Reclassify single effects by pair knockouts, visiting pairs in order.
///
/// Two harmful sites whose joint knockout keeps base fitness become
/// neutral; two harmless sites whose joint knockout hurts become
/// detrimental. A site already reclassified is not revisited.
pub fn reclassify_pairs<F>(effects: &[KnockoutEffect], base_fitness: f64, pair_fitness: F) -> Vec<KnockoutEffect>
where
    F: Fn(usize, usize) -> Option<f64>,
{
    let mut paired = effects.to_vec();
    for a in 0..effects.len() {
        if paired[a] != effects[a] {
            continue;
        }
        for b in a + 1..effects.len() {
            if paired[b] != effects[b] {
                continue;
            }
            if effects[a].is_harmful() != effects[b].is_harmful() {
                continue;
            }
            let Some(fitness) = pair_fitness(a, b) else { continue };
            if fitness >= base_fitness && effects[a].is_harmful() && effects[b].is_harmful() {
                paired[a] = KnockoutEffect::Neutral;
                paired[b] = KnockoutEffect::Neutral;
            }
            if fitness < base_fitness && !effects[a].is_harmful() && !effects[b].is_harmful() {
                paired[a] = KnockoutEffect::Detrimental;
                paired[b] = KnockoutEffect::Detrimental;
            }
        }
    }
    paired
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
    use KnockoutEffect::*;

    const REPLICATOR: [&str; 15] = [
        "h-alloc", "h-search", "nop-C", "nop-A", "mov-head", "nop-C", "h-search", "h-copy", "if-label", "nop-C",
        "nop-A", "h-divide", "mov-head", "nop-A", "nop-B",
    ];

    struct Fixture {
        set: InstSet,
        hardware: HardwareConfig,
        phenotype: PhenotypeConfig,
        env: LogicNine,
        config: TestCpuConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                set: InstSet::default_for(HardwareKind::Cpu),
                hardware: HardwareConfig::default(),
                phenotype: PhenotypeConfig::default(),
                env: LogicNine::new(),
                config: TestCpuConfig::default(),
            }
        }

        fn cpu(&self) -> TestCpu<'_> {
            TestCpu::new(&self.set, &self.hardware, &self.phenotype, &self.env, &self.config)
        }

        fn genome(&self, names: &[&str]) -> Sequence {
            Sequence::from_insts(names.iter().map(|n| self.set.inst_by_name(n).unwrap()).collect())
        }
    }

    #[test]
    fn test_replicator_knockouts() {
        let fx = Fixture::new();
        let cpu = fx.cpu();
        let mut analysis = KnockoutAnalysis::new(fx.genome(&REPLICATOR), &AnalysisConfig::default());
        assert_eq!(analysis.state(), &Knockouts::Pending);

        let info = analysis.info(&cpu, false, true).unwrap().clone();
        assert!(info.base_fitness > 0.0);
        assert_eq!(info.counts.total(), REPLICATOR.len());
        assert_eq!(info.effects.len(), REPLICATOR.len());
        // Without h-divide nothing reproduces.
        assert_eq!(info.effects[11], Lethal);
        assert!(info.pairs.is_none());
        let chart = info.task_chart.as_ref().unwrap();
        assert_eq!(chart.len(), REPLICATOR.len());

        // Asking for pairs recomputes, asking for less does not.
        let with_pairs = analysis.info(&cpu, true, false).unwrap().clone();
        assert_eq!(with_pairs.counts, info.counts);
        assert_eq!(with_pairs.pairs.unwrap().total(), REPLICATOR.len());
        assert!(matches!(analysis.state(), Knockouts::Computed(i) if i.pairs.is_some()));
    }

    #[test]
    fn test_dead_genome_is_all_neutral() {
        let fx = Fixture::new();
        let cpu = fx.cpu();
        let mut analysis =
            KnockoutAnalysis::new(fx.genome(&["nop-A", "inc", "dec", "nop-B"]), &AnalysisConfig::default());
        let info = analysis.info(&cpu, true, true).unwrap();
        assert_eq!(info.base_fitness, 0.0);
        assert_eq!(info.counts.neut, 4);
        assert_eq!(info.pairs.map(|p| p.neut), Some(4));
    }

    #[test]
    fn test_pair_reclassification() {
        let effects = [Detrimental, Lethal, Neutral, Neutral, Beneficial];
        let base = 1.0;
        let fitness = |a: usize, b: usize| match (a, b) {
            // Two harmful knockouts that compensate each other.
            (0, 1) => Some(1.0),
            // Two harmless knockouts that are redundant.
            (2, 3) => Some(0.5),
            _ => Some(base),
        };
        let paired = reclassify_pairs(&effects, base, fitness);
        assert_eq!(paired, vec![Neutral, Neutral, Detrimental, Detrimental, Beneficial]);
        assert_eq!(EffectCounts::tally(&paired).information(), 2);
    }

    #[test]
    fn test_reclassified_sites_are_skipped() {
        let effects = [Neutral, Neutral, Neutral];
        let paired = reclassify_pairs(&effects, 1.0, |a, b| {
            assert_ne!((a, b), (1, 2), "site 1 was already reclassified");
            Some(if (a, b) == (0, 1) { 0.5 } else { 1.0 })
        });
        assert_eq!(paired, vec![Detrimental, Detrimental, Neutral]);
    }
}
