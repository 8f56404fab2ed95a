//! Task environment
//!
//! The hardware never decides what an output is worth. It hands every output
//! to a [`TaskEvaluator`], which reports the tasks completed and the bonus
//! each one is worth.

use rand::Rng;

/// Fixed inputs used when a test run does not ask for random ones.
pub const FIXED_INPUTS: [i32; 3] = [0x0f13149f, 0x3308e53e, 0x556241eb];

/// Tasks triggered by one output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskResult {
    pub tasks: Vec<usize>,
}

pub trait TaskEvaluator: Send + Sync {
    fn num_tasks(&self) -> usize;
    fn task_name(&self, task: usize) -> &str;
    /// Evaluate `output` against the recent inputs (most recent first).
    fn evaluate(&self, inputs: &[i32], output: i32) -> TaskResult;
    /// Multiplicative merit bonus for completing `task`.
    fn bonus(&self, task: usize) -> f64;

    fn task_index(&self, name: &str) -> Option<usize> {
        (0..self.num_tasks()).find(|&t| self.task_name(t) == name)
    }
}

/// Environmental inputs: three 32-bit values whose top byte carries the
/// classic 00001111 / 00110011 / 01010101 truth-table pattern.
pub fn setup_inputs<R: Rng + ?Sized>(rng: &mut R, random: bool) -> Vec<i32> {
    if !random {
        return FIXED_INPUTS.to_vec();
    }
    vec![
        (15 << 24) + rng.random_range(0..1 << 24),
        (51 << 24) + rng.random_range(0..1 << 24),
        (85 << 24) + rng.random_range(0..1 << 24),
    ]
}

/// Compute the 8-bit logic id of `output` as a function of up to three
/// inputs, or `None` when the output is not a bitwise function of them.
///
/// Bit `i` of the id is the output for the input combination whose bits
/// are (C, B, A) = i, where A is the most recent input.
pub fn logic_id(inputs: &[i32], output: i32) -> Option<u8> {
    let num_inputs = inputs.len().min(3);
    let mut test_inputs = [0u32; 3];
    for (i, slot) in test_inputs.iter_mut().enumerate().take(num_inputs) {
        *slot = inputs[i] as u32;
    }
    let mut test_output = output as u32;

    let mut logic_out: [Option<u8>; 8] = [None; 8];
    for _ in 0..32 {
        let logic_pos = (0..3).fold(0usize, |acc, i| acc + (((test_inputs[i] & 1) as usize) << i));
        let bit = (test_output & 1) as u8;
        match logic_out[logic_pos] {
            Some(prev) if prev != bit => return None,
            _ => logic_out[logic_pos] = Some(bit),
        }
        test_output >>= 1;
        for v in test_inputs.iter_mut() {
            *v >>= 1;
        }
    }

    if num_inputs < 1 {
        logic_out[1] = logic_out[0];
    }
    if num_inputs < 2 {
        logic_out[2] = logic_out[0];
        logic_out[3] = logic_out[1];
    }
    if num_inputs < 3 {
        logic_out[4] = logic_out[0];
        logic_out[5] = logic_out[1];
        logic_out[6] = logic_out[2];
        logic_out[7] = logic_out[3];
    }

    let mut id = 0u8;
    for (i, out) in logic_out.iter().enumerate() {
        // A combination never seen means the inputs did not span the table.
        id |= (*out)? << i;
    }
    Some(id)
}

struct LogicTask {
    name: &'static str,
    ids: &'static [u8],
    /// Bonus is 2^power
    power: i32,
}

const LOGIC_TASKS: [LogicTask; 9] = [
    LogicTask { name: "not", ids: &[15, 51, 85], power: 1 },
    LogicTask { name: "nand", ids: &[63, 95, 119], power: 1 },
    LogicTask { name: "and", ids: &[136, 160, 192], power: 2 },
    LogicTask { name: "orn", ids: &[175, 187, 207, 221, 243, 245], power: 2 },
    LogicTask { name: "or", ids: &[238, 250, 252], power: 3 },
    LogicTask { name: "andn", ids: &[10, 12, 34, 48, 68, 80], power: 3 },
    LogicTask { name: "nor", ids: &[3, 5, 17], power: 4 },
    LogicTask { name: "xor", ids: &[60, 90, 102], power: 4 },
    LogicTask { name: "equ", ids: &[153, 165, 195], power: 5 },
];

/// The nine classic logic tasks with power-of-two bonuses.
#[derive(Clone, Debug, Default)]
pub struct LogicNine;

impl LogicNine {
    pub fn new() -> Self {
        LogicNine
    }
}

impl TaskEvaluator for LogicNine {
    fn num_tasks(&self) -> usize {
        LOGIC_TASKS.len()
    }

    fn task_name(&self, task: usize) -> &str {
        LOGIC_TASKS.get(task).map_or("?", |t| t.name)
    }

    fn evaluate(&self, inputs: &[i32], output: i32) -> TaskResult {
        let tasks = match logic_id(inputs, output) {
            Some(id) => LOGIC_TASKS
                .iter()
                .enumerate()
                .filter(|(_, t)| t.ids.contains(&id))
                .map(|(i, _)| i)
                .collect(),
            None => Vec::new(),
        };
        TaskResult { tasks }
    }

    fn bonus(&self, task: usize) -> f64 {
        LOGIC_TASKS.get(task).map_or(1.0, |t| 2f64.powi(t.power))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: i32 = FIXED_INPUTS[0];
    const B: i32 = FIXED_INPUTS[1];

    #[test]
    fn test_echo_and_not() {
        assert_eq!(logic_id(&[A], A), Some(170));
        assert_eq!(logic_id(&[A], !A), Some(85));
    }

    #[test]
    fn test_two_input_functions() {
        // Most recent input first.
        assert_eq!(logic_id(&[B, A], !(A & B)), Some(119));
        assert_eq!(logic_id(&[B, A], A ^ B), Some(102));
    }

    #[test]
    fn test_inconsistent_output() {
        // Same input bit, different output bits.
        assert_eq!(logic_id(&[0], 1), None);
    }

    #[test]
    fn test_logic_nine_rewards() {
        let env = LogicNine::new();
        assert_eq!(env.evaluate(&[B, A], !(A & B)).tasks, vec![1]);
        assert_eq!(env.evaluate(&[A], A).tasks, Vec::<usize>::new());
        assert_eq!(env.bonus(8), 32.0);
        assert_eq!(env.task_index("xor"), Some(7));
    }

    #[test]
    fn test_random_inputs_pattern() {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let inputs = setup_inputs(&mut rng, true);
        assert_eq!(inputs[0] >> 24, 15);
        assert_eq!(inputs[1] >> 24, 51);
        assert_eq!(inputs[2] >> 24, 85);
        assert_eq!(setup_inputs(&mut rng, false), FIXED_INPUTS.to_vec());
    }
}
