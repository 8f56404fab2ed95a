//! Genome archive files
//!
//! An `.org` file holds one instruction name per line after a commented
//! header describing how the genome fared on the Test CPU.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::environment::TaskEvaluator;
use crate::error::GenomeError;
use crate::inst_set::InstSet;
use crate::sequence::Sequence;
use crate::test_cpu::TestInfo;

/// Prefix marking an inline alphabet-encoded genome on the command line.
pub const INLINE_PREFIX: &str = "seq:";

/// Parse `.org` text: instruction names one per line, or a single line in
/// the genome alphabet.
pub fn parse_org(text: &str, inst_set: &InstSet) -> Result<Sequence, GenomeError> {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(n, l)| (n + 1, l.split('#').next().unwrap_or("").trim()))
        .filter(|(_, l)| !l.is_empty())
        .collect();

    if let [(_, only)] = lines.as_slice() {
        if inst_set.inst_by_name(only).is_none() {
            return decode(only, inst_set);
        }
    }

    let mut insts = Vec::with_capacity(lines.len());
    for (line, name) in lines {
        let inst = inst_set
            .inst_by_name(name)
            .ok_or_else(|| GenomeError::UnknownInstruction { name: name.to_string(), line })?;
        insts.push(inst);
    }
    if insts.is_empty() {
        return Err(GenomeError::Empty);
    }
    Ok(Sequence::from_insts(insts))
}

/// Decode an alphabet string, checking every opcode against `inst_set`.
pub fn decode(text: &str, inst_set: &InstSet) -> Result<Sequence, GenomeError> {
    let genome = Sequence::from_symbols(text)?;
    if genome.is_empty() {
        return Err(GenomeError::Empty);
    }
    if let Some(bad) = genome.iter().find(|&i| i.op() >= inst_set.len()) {
        return Err(GenomeError::BadOpcode(bad.0));
    }
    Ok(genome)
}

pub fn read_org<P: AsRef<Path>>(path: P, inst_set: &InstSet) -> Result<Sequence, GenomeError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| GenomeError::Io { path: path.to_path_buf(), source })?;
    let genome = parse_org(&text, inst_set)?;
    debug!(path = %path.display(), length = genome.len(), "loaded genome");
    Ok(genome)
}

/// A genome given on the command line: `seq:<alphabet>` or an `.org` path.
pub fn load_genome(arg: &str, inst_set: &InstSet) -> Result<Sequence, GenomeError> {
    match arg.strip_prefix(INLINE_PREFIX) {
        Some(symbols) => decode(symbols, inst_set),
        None => read_org(arg, inst_set),
    }
}

/// Render `genome` as an `.org` file with its Test CPU report.
pub fn format_org(genome: &Sequence, inst_set: &InstSet, env: &dyn TaskEvaluator, info: &TestInfo, name: &str) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_header(&mut out, inst_set, env, info, name);
    for inst in genome.iter() {
        out.push_str(inst_set.name(inst));
        out.push('\n');
    }
    out
}

fn write_header(
    out: &mut String,
    inst_set: &InstSet,
    env: &dyn TaskEvaluator,
    info: &TestInfo,
    name: &str,
) -> std::fmt::Result {
    writeln!(out, "# Filename........: {}", name)?;
    writeln!(out, "# Hardware........: {}", inst_set.hardware())?;
    writeln!(out, "# Is Viable.......: {}", u8::from(info.is_viable))?;
    writeln!(out, "# Repro Cycle Size: {}", info.max_cycle)?;
    writeln!(out, "# Depth to Viable.: {}", info.depth_found.map_or(-1, |d| d as i64))?;
    writeln!(out, "# Repro Type......: {}", info.repro_type())?;
    writeln!(out, "#")?;

    for (level, record) in info.generations.iter().enumerate() {
        let p = &record.phenotype;
        writeln!(out, "# Generation: {}", level)?;
        writeln!(out, "# Merit...........: {:.6}", p.merit)?;
        writeln!(out, "# Gestation Time..: {}", p.gestation_time)?;
        writeln!(out, "# Fitness.........: {:.6}", p.fitness)?;
        writeln!(out, "# Errors..........: {}", p.last_num_errors)?;
        writeln!(out, "# Genome Size.....: {}", record.genome.len())?;
        writeln!(out, "# Copied Size.....: {}", p.copied_size)?;
        writeln!(out, "# Executed Size...: {}", p.executed_size)?;
        let offspring = if p.num_divides == 0 {
            "NONE".to_string()
        } else if p.copy_true {
            "SELF".to_string()
        } else if let Some(cycle_to) = info.cycle_to {
            cycle_to.to_string()
        } else {
            (level + 1).to_string()
        };
        writeln!(out, "# Offspring.......: {}", offspring)?;
        writeln!(out, "#")?;
    }

    writeln!(out, "# Tasks Performed:")?;
    if let Some(first) = info.generations.first() {
        for (task, count) in first.phenotype.last_task_count.iter().enumerate() {
            writeln!(out, "# {} {}", env.task_name(task), count)?;
        }
    }
    writeln!(out)
}

pub fn write_org<P: AsRef<Path>>(
    path: P,
    genome: &Sequence,
    inst_set: &InstSet,
    env: &dyn TaskEvaluator,
    info: &TestInfo,
) -> Result<(), GenomeError> {
    let path = path.as_ref();
    let name = path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    let text = format_org(genome, inst_set, env, info, &name);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|source| GenomeError::Io { path: dir.to_path_buf(), source })?;
    }
    fs::write(path, text).map_err(|source| GenomeError::Io { path: path.to_path_buf(), source })?;
    debug!(path = %path.display(), length = genome.len(), "wrote genome");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::LogicNine;
    use crate::hardware::HardwareConfig;
    use crate::inst_lib::HardwareKind;
    use crate::organism::PhenotypeConfig;
    use crate::test_cpu::{TestCpu, TestCpuConfig};

    const REPLICATOR: [&str; 15] = [
        "h-alloc", "h-search", "nop-C", "nop-A", "mov-head", "nop-C", "h-search", "h-copy", "if-label", "nop-C",
        "nop-A", "h-divide", "mov-head", "nop-A", "nop-B",
    ];

    #[test]
    fn test_parse_names_and_comments() {
        let set = InstSet::default_for(HardwareKind::Cpu);
        let genome = parse_org("# header\n\nh-alloc\nnop-A  # trailing\nh-divide\n", &set).unwrap();
        assert_eq!(genome.len(), 3);
        assert_eq!(set.name(genome.get(1)), "nop-A");
    }

    #[test]
    fn test_parse_alphabet_line() {
        let set = InstSet::default_for(HardwareKind::Cpu);
        let genome = parse_org("# encoded\nabc\n", &set).unwrap();
        assert_eq!(genome.as_string(), "abc");
        assert!(matches!(load_genome("seq:", &set), Err(GenomeError::Empty)));
        assert_eq!(load_genome("seq:cba", &set).unwrap().as_string(), "cba");
    }

    #[test]
    fn test_parse_errors() {
        let set = InstSet::default_for(HardwareKind::Cpu);
        let err = parse_org("h-alloc\nh-bogus\n", &set).unwrap_err();
        assert!(matches!(err, GenomeError::UnknownInstruction { line: 2, .. }));
        assert!(matches!(parse_org("# nothing\n", &set), Err(GenomeError::Empty)));
        // 'z' encodes opcode 25, one past the reduced set.
        let small = InstSet::from_names(HardwareKind::Cpu, &["nop-A", "nop-B", "nop-C"]).unwrap();
        assert!(matches!(decode("az", &small), Err(GenomeError::BadOpcode(25))));
        assert!(matches!(read_org("/nonexistent/x.org", &set), Err(GenomeError::Io { .. })));
    }

    #[test]
    fn test_write_and_read_back() {
        let set = InstSet::default_for(HardwareKind::Cpu);
        let hardware = HardwareConfig::default();
        let phenotype = PhenotypeConfig::default();
        let env = LogicNine::new();
        let cpu = TestCpu::new(&set, &hardware, &phenotype, &env, &TestCpuConfig::default());
        let genome = Sequence::from_insts(REPLICATOR.iter().map(|n| set.inst_by_name(n).unwrap()).collect());
        let mut info = cpu.new_info();
        cpu.test_genome(&mut info, &genome);

        let dir = std::env::temp_dir().join(format!("gx_archive_test_{}", std::process::id()));
        let path = dir.join("015-replicator.org");
        write_org(&path, &genome, &set, &env, &info).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("# Is Viable.......: 1"));
        assert!(text.contains("# Offspring.......: SELF"));
        assert!(text.contains("# Filename........: 015-replicator.org"));
        assert_eq!(read_org(&path, &set).unwrap(), genome);
        fs::remove_dir_all(&dir).unwrap();
    }
}
