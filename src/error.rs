//! Configuration-time errors
//!
//! Only loading problems are errors. Anything that goes wrong while an
//! organism runs is recorded as a [`crate::organism::Fault`] instead.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum InstSetError {
    #[error("unknown instruction '{name}' for {hardware} hardware (best match is '{suggestion}')")]
    UnknownInstruction { name: String, hardware: String, suggestion: String },
    #[error("malformed instruction set line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("'{0}' is reserved and cannot appear in an instruction set file")]
    Reserved(String),
    #[error("nop instructions must come first in an instruction set ('{0}' appears after a non-nop)")]
    NopOrder(String),
    #[error("instruction set has {0} instructions, at most 255 are supported")]
    TooLarge(usize),
    #[error("instruction set is empty")]
    Empty,
    #[error("failed to read instruction set {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

#[derive(thiserror::Error, Debug)]
pub enum GenomeError {
    #[error("symbol '{0}' does not encode an instruction")]
    BadSymbol(char),
    #[error("opcode {0} is outside the instruction set")]
    BadOpcode(u8),
    #[error("unknown instruction '{name}' on line {line}")]
    UnknownInstruction { name: String, line: usize },
    #[error("genome is empty")]
    Empty,
    #[error("failed to access genome file {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    InstSet(#[from] InstSetError),
    #[error(transparent)]
    Genome(#[from] GenomeError),
}

#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("base genome is empty")]
    EmptyGenome,
}
