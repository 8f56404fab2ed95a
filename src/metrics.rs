//! Reports
//!
//! CSV records and console summaries for Test CPU runs and the mutational
//! analyses. Genome compressibility is the Brotli compression ratio of the
//! alphabet-encoded genome: repetitive genomes compress well.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analysis::StepStats;
use crate::environment::TaskEvaluator;
use crate::inst_set::InstSet;
use crate::knockout::KnockoutInfo;
use crate::landscape::LandscapeResults;
use crate::neighborhood::NeighborhoodResults;
use crate::sequence::{Instruction, Sequence};
use crate::test_cpu::TestInfo;

/// Where and how reports are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: String,
    /// Write CSV files next to the console summary
    pub csv: bool,
    /// Write the tested genome as an `.org` file
    pub save_org: bool,
    /// Brotli compression quality (1-11, lower = faster)
    pub brotli_quality: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: "analysis".to_string(),
            csv: true,
            save_org: true,
            brotli_quality: 4, // Balance between speed and compression
        }
    }
}

impl OutputConfig {
    pub fn path(&self, file: &str) -> PathBuf {
        Path::new(&self.dir).join(file)
    }
}

/// Brotli-compressed size and compression ratio of `data`.
pub fn compression_ratio(data: &[u8], quality: u32) -> (usize, f64) {
    use brotli::enc::BrotliEncoderParams;

    if data.is_empty() {
        return (0, 1.0);
    }
    let mut compressed = Vec::new();
    let mut params = BrotliEncoderParams::default();
    params.quality = quality.min(11) as i32;

    match brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut compressed, &params) {
        Ok(_) if !compressed.is_empty() => (compressed.len(), data.len() as f64 / compressed.len() as f64),
        _ => (data.len(), 1.0),
    }
}

pub fn genome_compressibility(genome: &Sequence, quality: u32) -> f64 {
    compression_ratio(genome.as_string().as_bytes(), quality).1
}

/// Test CPU outcome of one genome
#[derive(Clone, Debug)]
pub struct GenomeRecord {
    pub name: String,
    pub length: usize,
    pub viable: bool,
    pub repro_type: u8,
    pub depth_found: i64,
    pub max_cycle: usize,
    pub fitness: f64,
    pub merit: f64,
    pub gestation_time: u64,
    pub copied_size: usize,
    pub executed_size: usize,
    pub errors: u32,
    pub tasks_done: usize,
    pub compression_ratio: f64,
}

impl GenomeRecord {
    pub fn from_test(name: &str, genome: &Sequence, info: &TestInfo, brotli_quality: u32) -> Self {
        let colony = info.colony_organism();
        let phenotype = colony.map(|g| &g.phenotype);
        Self {
            name: name.to_string(),
            length: genome.len(),
            viable: info.is_viable,
            repro_type: info.repro_type(),
            depth_found: info.depth_found.map_or(-1, |d| d as i64),
            max_cycle: info.max_cycle,
            fitness: info.colony_fitness(),
            merit: phenotype.map_or(0.0, |p| p.merit),
            gestation_time: phenotype.map_or(0, |p| p.gestation_time),
            copied_size: phenotype.map_or(0, |p| p.copied_size),
            executed_size: phenotype.map_or(0, |p| p.executed_size),
            errors: phenotype.map_or(0, |p| p.last_num_errors),
            tasks_done: phenotype.map_or(0, |p| p.last_task_count.iter().filter(|&&c| c > 0).count()),
            compression_ratio: genome_compressibility(genome, brotli_quality),
        }
    }

    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{:.6},{:.4},{},{},{},{},{},{:.4}",
            self.name,
            self.length,
            u8::from(self.viable),
            self.repro_type,
            self.depth_found,
            self.max_cycle,
            self.fitness,
            self.merit,
            self.gestation_time,
            self.copied_size,
            self.executed_size,
            self.errors,
            self.tasks_done,
            self.compression_ratio,
        )
    }

    pub fn csv_header() -> &'static str {
        "name,length,viable,repro_type,depth_found,max_cycle,fitness,merit,gestation_time,copied_size,executed_size,errors,tasks_done,compression_ratio"
    }

    pub fn print_summary(&self) {
        print_box(
            "TEST CPU",
            &[
                ("Genome", self.name.clone()),
                ("Length", self.length.to_string()),
                ("Viable", if self.viable { "yes".to_string() } else { "no".to_string() }),
                ("Repro type", self.repro_type.to_string()),
                ("Depth to viable", self.depth_found.to_string()),
                ("Fitness", format!("{:.6}", self.fitness)),
                ("Merit", format!("{:.2}", self.merit)),
                ("Gestation time", self.gestation_time.to_string()),
                ("Copied / executed", format!("{} / {}", self.copied_size, self.executed_size)),
                ("Tasks performed", self.tasks_done.to_string()),
                ("Compression ratio", format!("{:.3}", self.compression_ratio)),
            ],
        );
    }
}

/// Statistics of one sweep (one-step, two-step or a landscape kind)
#[derive(Clone, Debug)]
pub struct StepRecord {
    pub step: String,
    pub base_fitness: f64,
    pub total: u64,
    pub prob_dead: f64,
    pub prob_neg: f64,
    pub prob_neut: f64,
    pub prob_pos: f64,
    pub average_size_neg: f64,
    pub average_size_pos: f64,
    pub average_fitness: f64,
    pub average_sqr_fitness: f64,
    pub peak_fitness: f64,
    pub total_entropy: f64,
    pub complexity: f64,
    pub prob_knockout: f64,
    pub average_size_knockout: f64,
    pub prob_task: f64,
    pub average_size_task: f64,
    pub prob_target: f64,
    pub average_size_target: f64,
}

impl StepRecord {
    pub fn new(step: &str, base_fitness: f64, stats: &StepStats, total_entropy: f64, complexity: f64) -> Self {
        Self {
            step: step.to_string(),
            base_fitness,
            total: stats.total,
            prob_dead: stats.prob_dead(),
            prob_neg: stats.prob_neg(),
            prob_neut: stats.prob_neut(),
            prob_pos: stats.prob_pos(),
            average_size_neg: stats.average_size_neg(),
            average_size_pos: stats.average_size_pos(),
            average_fitness: stats.average_fitness(),
            average_sqr_fitness: stats.average_sqr_fitness(),
            peak_fitness: stats.peak_fitness,
            total_entropy,
            complexity,
            prob_knockout: stats.prob_knockout(),
            average_size_knockout: stats.average_size_knockout(),
            prob_task: stats.prob_task(),
            average_size_task: stats.average_size_task(),
            prob_target: stats.prob_target(),
            average_size_target: stats.average_size_target(),
        }
    }

    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{:.6},{},{:.4},{:.4},{:.4},{:.4},{:.6},{:.6},{:.6},{:.6},{:.6},{:.4},{:.4},{:.4},{:.6},{:.4},{:.6},{:.4},{:.6}",
            self.step,
            self.base_fitness,
            self.total,
            self.prob_dead,
            self.prob_neg,
            self.prob_neut,
            self.prob_pos,
            self.average_size_neg,
            self.average_size_pos,
            self.average_fitness,
            self.average_sqr_fitness,
            self.peak_fitness,
            self.total_entropy,
            self.complexity,
            self.prob_knockout,
            self.average_size_knockout,
            self.prob_task,
            self.average_size_task,
            self.prob_target,
            self.average_size_target,
        )
    }

    pub fn csv_header() -> &'static str {
        "step,base_fitness,total,prob_lethal,prob_deleterious,prob_neutral,prob_beneficial,average_size_deleterious,average_size_beneficial,average_fitness,average_sqr_fitness,peak_fitness,total_entropy,complexity,prob_knockout,average_size_knockout,prob_task,average_size_task,prob_target,average_size_target"
    }

    fn summary_rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Mutants", self.total.to_string()),
            (
                "Lethal/del/neut/ben",
                format!(
                    "{:.1}% {:.1}% {:.1}% {:.1}%",
                    self.prob_dead * 100.0,
                    self.prob_neg * 100.0,
                    self.prob_neut * 100.0,
                    self.prob_pos * 100.0
                ),
            ),
            ("Average fitness", format!("{:.6}", self.average_fitness)),
            ("Peak fitness", format!("{:.6}", self.peak_fitness)),
            ("Total entropy", format!("{:.3}", self.total_entropy)),
            ("Complexity", format!("{:.3}", self.complexity)),
        ]
    }
}

pub fn neighborhood_records(results: &NeighborhoodResults) -> Vec<StepRecord> {
    let base = results.base.fitness;
    let one = &results.one_step;
    let mut records = vec![StepRecord::new("one_step", base, &one.stats, one.total_entropy, one.complexity)];
    if let Some(two) = &results.two_step {
        records.push(StepRecord::new("two_step", base, &two.stats, two.total_entropy, two.complexity));
    }
    records
}

pub fn landscape_record(results: &LandscapeResults) -> StepRecord {
    StepRecord::new(
        &results.kind.to_string(),
        results.base.fitness,
        &results.stats,
        results.total_entropy,
        results.complexity,
    )
}

pub fn print_neighborhood_summary(results: &NeighborhoodResults, env: &dyn TaskEvaluator) {
    let mut rows = vec![
        ("Base fitness", format!("{:.6}", results.base.fitness)),
        ("Base merit", format!("{:.2}", results.base.merit)),
        ("Base gestation", results.base.gestation_time.to_string()),
        ("Target task", results.base.target.map_or("-".to_string(), |t| env.task_name(t).to_string())),
    ];
    for record in neighborhood_records(results) {
        rows.push(("Step", record.step.clone()));
        rows.extend(record.summary_rows());
    }
    if results.two_step.is_some() {
        let t = &results.pair_targets;
        rows.push((
            "Target pairs by first",
            format!("dead {} neg {} neut {} pos {}", t.dead, t.neg, t.neut, t.pos),
        ));
    }
    print_box("MUTATIONAL NEIGHBORHOOD", &rows);
}

pub fn print_landscape_summary(results: &[LandscapeResults]) {
    let mut rows = Vec::new();
    if let Some(first) = results.first() {
        rows.push(("Base fitness", format!("{:.6}", first.base.fitness)));
    }
    for r in results {
        let record = landscape_record(r);
        rows.push(("Mutation", record.step.clone()));
        rows.extend(record.summary_rows());
    }
    print_box("FITNESS LANDSCAPE", &rows);
}

/// Single-step fitness table: one row per site, one column per instruction.
pub fn fitness_table_header(inst_set: &InstSet) -> String {
    let mut header = "site,inst".to_string();
    for op in 0..inst_set.len() {
        header.push(',');
        header.push_str(inst_set.name(Instruction(op as u8)));
    }
    header
}

pub fn fitness_table_rows(results: &NeighborhoodResults, inst_set: &InstSet) -> Vec<String> {
    results
        .fitness
        .iter()
        .enumerate()
        .map(|(site, row)| {
            let mut line = format!("{},{}", site, inst_set.name(results.base.genome.get(site)));
            for f in row {
                line.push_str(&format!(",{:.6}", f));
            }
            line
        })
        .collect()
}

pub fn site_table_header() -> &'static str {
    "site,inst,prob_lethal,prob_deleterious,prob_neutral,prob_beneficial,entropy"
}

/// One-step outcome of each site.
pub fn site_table_rows(results: &NeighborhoodResults, inst_set: &InstSet) -> Vec<String> {
    results
        .sites
        .iter()
        .enumerate()
        .map(|(site, stats)| {
            format!(
                "{},{},{:.4},{:.4},{:.4},{:.4},{:.4}",
                site,
                inst_set.name(results.base.genome.get(site)),
                stats.prob_dead(),
                stats.prob_neg(),
                stats.prob_neut(),
                stats.prob_pos(),
                results.site_entropy(site),
            )
        })
        .collect()
}

/// Knockout counts, single and paired
#[derive(Clone, Debug)]
pub struct KnockoutRecord {
    pub length: usize,
    pub base_fitness: f64,
    pub dead: usize,
    pub neg: usize,
    pub neut: usize,
    pub pos: usize,
    pub pair_dead: Option<usize>,
    pub pair_neg: Option<usize>,
    pub pair_neut: Option<usize>,
    pub pair_pos: Option<usize>,
}

impl KnockoutRecord {
    pub fn new(info: &KnockoutInfo) -> Self {
        Self {
            length: info.effects.len(),
            base_fitness: info.base_fitness,
            dead: info.counts.dead,
            neg: info.counts.neg,
            neut: info.counts.neut,
            pos: info.counts.pos,
            pair_dead: info.pairs.map(|p| p.dead),
            pair_neg: info.pairs.map(|p| p.neg),
            pair_neut: info.pairs.map(|p| p.neut),
            pair_pos: info.pairs.map(|p| p.pos),
        }
    }

    pub fn to_csv_row(&self) -> String {
        let opt = |v: Option<usize>| v.map_or(String::new(), |v| v.to_string());
        format!(
            "{},{:.6},{},{},{},{},{},{},{},{}",
            self.length,
            self.base_fitness,
            self.dead,
            self.neg,
            self.neut,
            self.pos,
            opt(self.pair_dead),
            opt(self.pair_neg),
            opt(self.pair_neut),
            opt(self.pair_pos),
        )
    }

    pub fn csv_header() -> &'static str {
        "length,base_fitness,ko_lethal,ko_deleterious,ko_neutral,ko_beneficial,pair_lethal,pair_deleterious,pair_neutral,pair_beneficial"
    }

    pub fn print_summary(&self) {
        let mut rows = vec![
            ("Base fitness", format!("{:.6}", self.base_fitness)),
            ("Sites", self.length.to_string()),
            ("Lethal/del/neut/ben", format!("{} {} {} {}", self.dead, self.neg, self.neut, self.pos)),
            ("Information", (self.dead + self.neg).to_string()),
        ];
        if let (Some(d), Some(n), Some(u), Some(p)) = (self.pair_dead, self.pair_neg, self.pair_neut, self.pair_pos) {
            rows.push(("Pair lethal/del/neut/ben", format!("{} {} {} {}", d, n, u, p)));
            rows.push(("Pair information", (d + n).to_string()));
        }
        print_box("KNOCKOUTS", &rows);
    }
}

/// Task chart: the task counts of every site's knockout.
pub fn knockout_chart_header(env: &dyn TaskEvaluator) -> String {
    let mut header = "site,inst,effect".to_string();
    for task in 0..env.num_tasks() {
        header.push(',');
        header.push_str(env.task_name(task));
    }
    header
}

pub fn knockout_chart_rows(info: &KnockoutInfo, genome: &Sequence, inst_set: &InstSet) -> Vec<String> {
    let Some(chart) = &info.task_chart else {
        return Vec::new();
    };
    chart
        .iter()
        .enumerate()
        .map(|(site, tasks)| {
            let effect = info.effects.get(site).map_or("?".to_string(), |e| format!("{:?}", e).to_lowercase());
            let mut line = format!("{},{},{}", site, inst_set.name(genome.get(site)), effect);
            for count in tasks {
                line.push_str(&format!(",{}", count));
            }
            line
        })
        .collect()
}

/// Write a CSV file, creating its directory.
pub fn write_csv<P, I>(path: P, header: &str, rows: I) -> std::io::Result<()>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = String>,
{
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{}", header)?;
    for row in rows {
        writeln!(writer, "{}", row)?;
    }
    writer.flush()?;
    info!(path = %path.display(), "report written");
    Ok(())
}

const BOX_WIDTH: usize = 61;

fn print_box(title: &str, rows: &[(&str, String)]) {
    let rule = "─".repeat(BOX_WIDTH);
    println!("\n┌{}┐", rule);
    println!("│{:^width$}│", title, width = BOX_WIDTH);
    println!("├{}┤", rule);
    for (label, value) in rows {
        let line = format!("  {:<24} {}", format!("{}:", label), value);
        println!("│{:<width$}│", line, width = BOX_WIDTH);
    }
    println!("└{}┘", rule);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Baseline, TaskChange};
    use crate::knockout::{EffectCounts, KnockoutEffect};
    use crate::neighborhood::{PairTargets, StepSummary};
    use crate::inst_lib::HardwareKind;

    #[test]
    fn test_repetitive_genomes_compress() {
        let repetitive = Sequence::filled(200, Instruction(0));
        let varied = Sequence::from_insts((0..200u32).map(|i| Instruction(((i * 7 + i / 3) % 26) as u8)).collect());
        let r = genome_compressibility(&repetitive, 4);
        let v = genome_compressibility(&varied, 4);
        assert!(r > v, "{} vs {}", r, v);
        assert_eq!(compression_ratio(&[], 4), (0, 1.0));
    }

    #[test]
    fn test_step_record_csv() {
        let base = Baseline {
            genome: Sequence::filled(3, Instruction(0)),
            fitness: 1.0,
            merit: 1.0,
            gestation_time: 1,
            tasks: Vec::new(),
            target: None,
            neut_min: 0.99,
            neut_max: 1.01,
        };
        let mut stats = StepStats::new(&base, 3);
        stats.record(&base, 0, 0.0, &base.genome);
        stats.record(&base, 1, 1.0, &base.genome);
        stats.record_tasks(TaskChange { knockout: true, gained: false, target: false }, 0.5);
        let record = StepRecord::new("one_step", 1.0, &stats, 0.5, 2.5);
        let row = record.to_csv_row();
        assert_eq!(row.split(',').count(), StepRecord::csv_header().split(',').count());
        assert!(row.starts_with("one_step,1.000000,2,0.5000,0.0000,0.5000"));
        assert!(row.ends_with(",0.5000,0.500000,0.0000,0.000000,0.0000,0.000000"));
    }

    #[test]
    fn test_site_table() {
        let set = InstSet::default_for(HardwareKind::Cpu);
        let base = Baseline {
            genome: Sequence::filled(2, Instruction(0)),
            fitness: 1.0,
            merit: 1.0,
            gestation_time: 1,
            tasks: Vec::new(),
            target: None,
            neut_min: 0.99,
            neut_max: 1.01,
        };
        let mut first = StepStats::new(&base, 2);
        first.record(&base, 0, 0.0, &base.genome);
        first.record(&base, 0, 1.0, &base.genome);
        let results = NeighborhoodResults {
            base: base.clone(),
            alphabet: 2,
            one_step: StepSummary { stats: first.clone(), total_entropy: 1.0, complexity: 1.0 },
            two_step: None,
            pair_targets: PairTargets::default(),
            sites: vec![first, StepStats::new(&base, 2)],
            fitness: Vec::new(),
        };
        let name = set.name(Instruction(0));
        assert_eq!(site_table_header().split(',').count(), 7);
        assert_eq!(
            site_table_rows(&results, &set),
            vec![
                format!("0,{},0.5000,0.0000,0.5000,0.0000,1.0000", name),
                format!("1,{},0.0000,0.0000,0.0000,0.0000,0.0000", name),
            ]
        );
    }

    #[test]
    fn test_knockout_record_and_chart() {
        let set = InstSet::default_for(HardwareKind::Cpu);
        let info = KnockoutInfo {
            base_fitness: 0.25,
            counts: EffectCounts { dead: 1, neg: 0, neut: 1, pos: 0 },
            effects: vec![KnockoutEffect::Lethal, KnockoutEffect::Neutral],
            pairs: None,
            task_chart: Some(vec![vec![0, 1], vec![1, 1]]),
        };
        let record = KnockoutRecord::new(&info);
        assert_eq!(record.to_csv_row(), "2,0.250000,1,0,1,0,,,,");
        assert_eq!(record.to_csv_row().split(',').count(), KnockoutRecord::csv_header().split(',').count());

        let genome = Sequence::filled(2, Instruction(0));
        let rows = knockout_chart_rows(&info, &genome, &set);
        assert_eq!(rows, vec!["0,nop-A,lethal,0,1".to_string(), "1,nop-A,neutral,1,1".to_string()]);
    }

    #[test]
    fn test_write_csv() {
        let dir = std::env::temp_dir().join(format!("gx_metrics_test_{}", std::process::id()));
        let path = dir.join("out.csv");
        write_csv(&path, "a,b", vec!["1,2".to_string(), "3,4".to_string()]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a,b\n1,2\n3,4\n");
        fs::remove_dir_all(&dir).unwrap();
    }
}
