mod analysis;
mod archive;
mod environment;
mod error;
mod fitness;
mod hardware;
mod head;
mod inst_lib;
mod inst_set;
mod knockout;
mod label;
mod landscape;
mod metrics;
mod neighborhood;
mod organism;
mod sequence;
mod test_cpu;

use std::env;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use analysis::AnalysisConfig;
use environment::{LogicNine, TaskEvaluator};
use error::ConfigError;
use hardware::{HardwareConfig, Tracer};
use inst_lib::HardwareKind;
use inst_set::InstSet;
use knockout::KnockoutAnalysis;
use landscape::{Landscape, MutationKind};
use metrics::{GenomeRecord, KnockoutRecord, OutputConfig, StepRecord};
use neighborhood::MutationalNeighborhood;
use organism::PhenotypeConfig;
use sequence::Sequence;
use test_cpu::{TestCpu, TestCpuConfig};

/// Run configuration (can be loaded from YAML)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Virtual CPU settings
    pub hardware: HardwareConfig,
    /// Merit computation
    pub phenotype: PhenotypeConfig,
    /// Genome evaluation
    pub test_cpu: TestCpuConfig,
    /// Mutational neighborhood, knockout and landscape settings
    pub analysis: AnalysisConfig,
    /// Instruction set selection
    pub inst_set: InstSetConfig,
    /// Report settings
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstSetConfig {
    /// Instruction set file; the built-in set for `hardware` when unset
    pub path: Option<String>,
    /// Hardware type: "cpu" or "gx"
    pub hardware: String,
}

impl Default for InstSetConfig {
    fn default() -> Self {
        Self { path: None, hardware: "cpu".to_string() }
    }
}

impl Config {
    /// Load config from a YAML file
    pub fn from_yaml(path: &str) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.into(), source })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to a YAML file
    pub fn to_yaml(&self, path: &str) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Io { path: path.into(), source })?;
        Ok(())
    }

    /// Validate configuration and return warnings.
    /// Returns Err if there are fatal configuration errors
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = self.hardware.validate()?;
        warnings.extend(self.analysis.validate()?);

        if HardwareKind::parse(&self.inst_set.hardware).is_none() {
            return Err(format!("unknown hardware type '{}' (expected cpu or gx)", self.inst_set.hardware));
        }
        if self.test_cpu.time_mod == 0 {
            return Err("test_cpu.time_mod must be greater than 0".to_string());
        }
        if self.test_cpu.generations == 0 {
            return Err("test_cpu.generations must be at least 1".to_string());
        }
        if self.output.brotli_quality > 11 {
            warnings.push(format!("brotli_quality {} is above 11 and will be capped", self.output.brotli_quality));
        }
        Ok(warnings)
    }

    /// Generate a template config file
    pub fn write_template(path: &str) -> Result<(), ConfigError> {
        Config::default().to_yaml(path)
    }

    pub fn hardware_kind(&self) -> Result<HardwareKind, ConfigError> {
        HardwareKind::parse(&self.inst_set.hardware)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown hardware type '{}'", self.inst_set.hardware)))
    }

    pub fn load_inst_set(&self) -> Result<InstSet, ConfigError> {
        let kind = self.hardware_kind()?;
        match &self.inst_set.path {
            Some(path) => Ok(InstSet::load_file(kind, path)?),
            None => Ok(InstSet::default_for(kind)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Test,
    Trace,
    Neighborhood,
    Knockout,
    Landscape,
}

impl Mode {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "test" => Some(Mode::Test),
            "trace" => Some(Mode::Trace),
            "neighborhood" => Some(Mode::Neighborhood),
            "knockout" => Some(Mode::Knockout),
            "landscape" => Some(Mode::Landscape),
            _ => None,
        }
    }
}

/// Command-line arguments
struct Args {
    mode: Mode,
    genome: String,
    config: Config,
}

fn parse_value<T: FromStr>(argv: &[String], i: usize, flag: &str) -> T {
    match argv.get(i).map(|v| v.parse::<T>()) {
        Some(Ok(value)) => value,
        _ => {
            eprintln!("Missing or invalid value for {}", flag);
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Args {
    let mut config = Config::default();
    let argv: Vec<String> = env::args().collect();

    // First pass: check for --config or --generate-config
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let config_path: String = parse_value(&argv, i, "--config");
                match Config::from_yaml(&config_path) {
                    Ok(loaded) => {
                        info!(path = %config_path, "loaded config");
                        config = loaded;
                    }
                    Err(e) => {
                        eprintln!("Error loading config file '{}': {}", config_path, e);
                        std::process::exit(1);
                    }
                }
            }
            "--generate-config" => {
                i += 1;
                let output_path = if i < argv.len() && !argv[i].starts_with('-') {
                    argv[i].clone()
                } else {
                    // No argument provided, use default
                    "config.yaml".to_string()
                };
                match Config::write_template(&output_path) {
                    Ok(_) => {
                        println!("Generated config template: {}", output_path);
                        std::process::exit(0);
                    }
                    Err(e) => {
                        eprintln!("Error writing config template: {}", e);
                        std::process::exit(1);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    // Second pass: CLI args override config file values
    let mut positional = Vec::new();
    i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1; // skip, already processed
            }
            "--inst-set" => {
                i += 1;
                config.inst_set.path = Some(parse_value(&argv, i, "--inst-set"));
            }
            "--hardware" => {
                i += 1;
                config.inst_set.hardware = parse_value(&argv, i, "--hardware");
            }
            "--seed" | "-s" => {
                i += 1;
                config.test_cpu.seed = parse_value(&argv, i, "--seed");
            }
            "--generations" => {
                i += 1;
                config.test_cpu.generations = parse_value(&argv, i, "--generations");
            }
            "--random-inputs" => {
                config.test_cpu.use_random_inputs = true;
            }
            "--out" | "-o" => {
                i += 1;
                config.output.dir = parse_value(&argv, i, "--out");
            }
            "--no-csv" => {
                config.output.csv = false;
            }
            "--threads" | "-t" => {
                i += 1;
                config.analysis.threads = parse_value(&argv, i, "--threads");
            }
            "--merit" => {
                i += 1;
                let name: String = parse_value(&argv, i, "--merit");
                match fitness::get_merit_method(&name) {
                    Some(method) => config.phenotype.base_merit_method = method,
                    None => {
                        eprintln!("Unknown merit method: {} (see --list-merit)", name);
                        std::process::exit(1);
                    }
                }
            }
            "--list-merit" => {
                println!("Available base merit methods:");
                for (name, description) in fitness::list_merit_methods() {
                    println!("    {:<12} {}", name, description);
                }
                std::process::exit(0);
            }
            "--no-two-step" => {
                config.analysis.two_step = false;
            }
            "--target" => {
                i += 1;
                config.analysis.target_task = Some(parse_value(&argv, i, "--target"));
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    match config.validate() {
        Ok(warnings) => {
            for warning in warnings {
                warn!("config: {}", warning);
            }
        }
        Err(e) => {
            eprintln!("Config validation error: {}", e);
            std::process::exit(1);
        }
    }

    let (mode, genome) = match positional.as_slice() {
        [mode, genome] => match Mode::parse(mode) {
            Some(mode) => (mode, genome.clone()),
            None => {
                eprintln!("Unknown mode: {}", mode);
                print_help();
                std::process::exit(1);
            }
        },
        _ => {
            print_help();
            std::process::exit(1);
        }
    };

    Args { mode, genome, config }
}

fn print_help() {
    println!("Digital organism genome analysis");
    println!();
    println!("USAGE:");
    println!("    avida-gx <MODE> <GENOME> [OPTIONS]");
    println!("    avida-gx <MODE> <GENOME> --config config.yaml");
    println!("    avida-gx --generate-config [output.yaml]");
    println!();
    println!("MODES:");
    println!("    test                      Run the genome on the Test CPU and report it");
    println!("    trace                     Print the hardware state after every cycle");
    println!("    neighborhood              One- and two-step mutational neighborhood");
    println!("    knockout                  Null-instruction knockouts of every site");
    println!("    landscape                 Point, insertion and deletion landscape");
    println!();
    println!("GENOME:");
    println!("    <FILE>                    .org file, one instruction name per line");
    println!("    seq:<SYMBOLS>             Inline genome in the instruction alphabet");
    println!();
    println!("CONFIG FILE:");
    println!("    -c, --config <FILE>       Load settings from YAML config file");
    println!("    --generate-config [FILE]  Generate template config (default: config.yaml)");
    println!();
    println!("OPTIONS (override config file values):");
    println!("    --inst-set <FILE>         Instruction set file (default: built-in set)");
    println!("    --hardware <cpu|gx>       Hardware type (default: cpu)");
    println!("    -s, --seed <N>            Test CPU random seed (default: 42)");
    println!("    --generations <N>         Generations bred per test (default: 3)");
    println!("    --random-inputs           Draw random environment inputs");
    println!("    --merit <METHOD>          Base merit method (default: least)");
    println!("    --list-merit              List base merit methods");
    println!("    -o, --out <DIR>           Report directory (default: analysis)");
    println!("    --no-csv                  Only print summaries");
    println!("    -t, --threads <N>         Worker threads (default: all cores)");
    println!("    --no-two-step             Skip the two-step neighborhood");
    println!("    --target <TASK>           Target task (default: last task)");
    println!();
    println!("    -h, --help                Print this help message");
    println!();
    println!("Log verbosity follows RUST_LOG (default: info).");
}

/// Prints every traced cycle to stdout.
struct StdoutTracer;

impl Tracer for StdoutTracer {
    fn trace(&mut self, status: &str) {
        println!("{}", status);
    }
}

fn genome_name(arg: &str) -> String {
    if arg.starts_with(archive::INLINE_PREFIX) {
        return "inline".to_string();
    }
    Path::new(arg)
        .file_stem()
        .map_or_else(|| "genome".to_string(), |s| s.to_string_lossy().into_owned())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = parse_args();
    if let Err(e) = run(&args) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = &args.config;
    let inst_set = config.load_inst_set()?;
    let genome = archive::load_genome(&args.genome, &inst_set)?;
    let name = genome_name(&args.genome);
    let env = LogicNine::new();
    let cpu = TestCpu::new(&inst_set, &config.hardware, &config.phenotype, &env, &config.test_cpu);

    info!(
        mode = ?args.mode,
        genome = %name,
        length = genome.len(),
        hardware = %inst_set.hardware(),
        instructions = inst_set.len(),
        "starting"
    );

    match args.mode {
        Mode::Test => run_test(config, &cpu, &genome, &name, None),
        Mode::Trace => run_test(config, &cpu, &genome, &name, Some(&mut StdoutTracer as &mut dyn Tracer)),
        Mode::Neighborhood => run_neighborhood(config, &cpu, &genome, &env),
        Mode::Knockout => run_knockout(config, &cpu, &genome, &inst_set, &env),
        Mode::Landscape => run_landscape(config, &cpu, &genome),
    }
}

fn run_test(
    config: &Config,
    cpu: &TestCpu<'_>,
    genome: &Sequence,
    name: &str,
    tracer: Option<&mut dyn Tracer>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut test_info = cpu.new_info();
    cpu.test_genome_traced(&mut test_info, genome, tracer);
    let record = GenomeRecord::from_test(name, genome, &test_info, config.output.brotli_quality);
    record.print_summary();

    if config.output.csv {
        metrics::write_csv(config.output.path("test.csv"), GenomeRecord::csv_header(), [record.to_csv_row()])?;
    }
    if config.output.save_org {
        let path = config.output.path(&format!("{:03}-{}.org", genome.len(), name));
        archive::write_org(&path, genome, cpu.inst_set(), cpu.env(), &test_info)?;
    }
    Ok(())
}

fn run_neighborhood(
    config: &Config,
    cpu: &TestCpu<'_>,
    genome: &Sequence,
    env: &dyn TaskEvaluator,
) -> Result<(), Box<dyn std::error::Error>> {
    let hood = MutationalNeighborhood::new(genome.clone(), &config.analysis);
    hood.process(cpu)?;
    let results = hood.results().ok_or("mutational neighborhood produced no results")?;
    metrics::print_neighborhood_summary(&results, env);

    if config.output.csv {
        let rows = metrics::neighborhood_records(&results).iter().map(StepRecord::to_csv_row).collect::<Vec<_>>();
        metrics::write_csv(config.output.path("neighborhood.csv"), StepRecord::csv_header(), rows)?;
        metrics::write_csv(
            config.output.path("fitness_table.csv"),
            &metrics::fitness_table_header(cpu.inst_set()),
            metrics::fitness_table_rows(&results, cpu.inst_set()),
        )?;
        metrics::write_csv(
            config.output.path("sites.csv"),
            metrics::site_table_header(),
            metrics::site_table_rows(&results, cpu.inst_set()),
        )?;
    }
    Ok(())
}

fn run_knockout(
    config: &Config,
    cpu: &TestCpu<'_>,
    genome: &Sequence,
    inst_set: &InstSet,
    env: &dyn TaskEvaluator,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut analysis = KnockoutAnalysis::new(genome.clone(), &config.analysis);
    let ko = analysis.info(cpu, config.analysis.knockout_pairs, config.analysis.knockout_chart)?;
    let record = KnockoutRecord::new(ko);
    record.print_summary();

    if config.output.csv {
        metrics::write_csv(config.output.path("knockouts.csv"), KnockoutRecord::csv_header(), [record.to_csv_row()])?;
        if ko.task_chart.is_some() {
            metrics::write_csv(
                config.output.path("knockout_chart.csv"),
                &metrics::knockout_chart_header(env),
                metrics::knockout_chart_rows(ko, genome, inst_set),
            )?;
        }
    }
    Ok(())
}

fn run_landscape(config: &Config, cpu: &TestCpu<'_>, genome: &Sequence) -> Result<(), Box<dyn std::error::Error>> {
    let landscape = Landscape::new(genome.clone(), &config.analysis);
    let results = MutationKind::ALL
        .iter()
        .map(|&kind| landscape.process(cpu, kind))
        .collect::<Result<Vec<_>, _>>()?;
    metrics::print_landscape_summary(&results);

    if config.output.csv {
        let rows = results.iter().map(|r| metrics::landscape_record(r).to_csv_row()).collect::<Vec<_>>();
        metrics::write_csv(config.output.path("landscape.csv"), StepRecord::csv_header(), rows)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hardware_kind().unwrap(), HardwareKind::Cpu);
        assert_eq!(config.load_inst_set().unwrap().len(), 26);
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = Config::default();
        config.inst_set.hardware = "z80".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.test_cpu.time_mod = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.analysis.neutral_max = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let path = std::env::temp_dir().join(format!("gx_config_test_{}.yaml", std::process::id()));
        let path = path.to_string_lossy().into_owned();
        let mut config = Config::default();
        config.test_cpu.seed = 7;
        config.inst_set.hardware = "gx".to_string();
        config.to_yaml(&path).unwrap();
        let loaded = Config::from_yaml(&path).unwrap();
        assert_eq!(loaded.test_cpu.seed, 7);
        assert_eq!(loaded.hardware_kind().unwrap(), HardwareKind::Gx);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("test_cpu:\n  generations: 5\n").unwrap();
        assert_eq!(config.test_cpu.generations, 5);
        assert_eq!(config.test_cpu.time_mod, 20);
        assert_eq!(config.analysis.neutral_min, 0.99);
    }

    #[test]
    fn test_genome_names() {
        assert_eq!(genome_name("seq:abc"), "inline");
        assert_eq!(genome_name("archive/015-replicator.org"), "015-replicator");
    }
}
