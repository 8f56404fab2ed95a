//! Size merit
//!
//! An organism's base merit is derived from its genome size before task
//! bonuses are applied. Which size counts is configurable: the raw genome
//! length, the lines it copied, the lines it executed, or combinations.

use serde::{Deserialize, Serialize};

/// How the base merit of an organism is computed from its sizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseMeritMethod {
    /// A fixed constant independent of size
    Const,
    /// Lines copied into the genome
    Copied,
    /// Lines executed during gestation
    Executed,
    /// Full genome length
    Full,
    /// Minimum of the three sizes
    #[default]
    Least,
    /// Square root of the minimum
    SqrtLeast,
}

/// Base merit for one organism.
pub fn calc_size_merit(
    method: BaseMeritMethod,
    const_merit: u32,
    genome_length: usize,
    copied_size: usize,
    executed_size: usize,
) -> u32 {
    match method {
        BaseMeritMethod::Const => const_merit,
        BaseMeritMethod::Copied => copied_size as u32,
        BaseMeritMethod::Executed => executed_size as u32,
        BaseMeritMethod::Full => genome_length as u32,
        BaseMeritMethod::Least => least(genome_length, copied_size, executed_size) as u32,
        BaseMeritMethod::SqrtLeast => {
            (least(genome_length, copied_size, executed_size) as f64).sqrt() as u32
        }
    }
}

fn least(genome_length: usize, copied_size: usize, executed_size: usize) -> usize {
    genome_length.min(copied_size).min(executed_size)
}

/// Get a merit method by name
pub fn get_merit_method(name: &str) -> Option<BaseMeritMethod> {
    match name {
        "const" | "constant" => Some(BaseMeritMethod::Const),
        "copied" | "copied_size" => Some(BaseMeritMethod::Copied),
        "executed" | "executed_size" => Some(BaseMeritMethod::Executed),
        "full" | "full_size" | "genome" => Some(BaseMeritMethod::Full),
        "least" | "least_size" => Some(BaseMeritMethod::Least),
        "sqrt_least" | "sqrt" => Some(BaseMeritMethod::SqrtLeast),
        _ => None,
    }
}

/// List available merit methods
pub fn list_merit_methods() -> Vec<(&'static str, &'static str)> {
    vec![
        ("const", "Constant merit regardless of size"),
        ("copied", "Number of lines copied"),
        ("executed", "Number of lines executed"),
        ("full", "Full genome length"),
        ("least", "Least of genome, copied and executed sizes (default)"),
        ("sqrt_least", "Square root of the least size"),
    ]
}

/// Fitness from merit and gestation time; zero when the organism never
/// finished a gestation.
pub fn fitness(merit: f64, gestation_time: u64) -> f64 {
    if gestation_time == 0 {
        0.0
    } else {
        merit / gestation_time as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_merit_methods() {
        assert_eq!(calc_size_merit(BaseMeritMethod::Const, 100, 50, 40, 30), 100);
        assert_eq!(calc_size_merit(BaseMeritMethod::Copied, 100, 50, 40, 30), 40);
        assert_eq!(calc_size_merit(BaseMeritMethod::Executed, 100, 50, 40, 30), 30);
        assert_eq!(calc_size_merit(BaseMeritMethod::Full, 100, 50, 40, 30), 50);
        assert_eq!(calc_size_merit(BaseMeritMethod::Least, 100, 50, 40, 30), 30);
        assert_eq!(calc_size_merit(BaseMeritMethod::SqrtLeast, 100, 50, 40, 36), 6);
    }

    #[test]
    fn test_lookup_by_name() {
        for (name, _) in list_merit_methods() {
            assert!(get_merit_method(name).is_some(), "{}", name);
        }
        assert_eq!(get_merit_method("bogus"), None);
    }

    #[test]
    fn test_serde_names() {
        let m: BaseMeritMethod = serde_yaml::from_str("sqrt_least").unwrap();
        assert_eq!(m, BaseMeritMethod::SqrtLeast);
        assert_eq!(serde_yaml::to_string(&BaseMeritMethod::Least).unwrap().trim(), "least");
    }

    #[test]
    fn test_fitness_zero_gestation() {
        assert_eq!(fitness(10.0, 0), 0.0);
        assert_eq!(fitness(10.0, 4), 2.5);
    }
}
