//! Output comparison.

use crate::config::types::{JudgeError, Result};

/// Compares a process's output with the expected output
pub type Checker = fn(process_output: &[u8], judge_output: &[u8]) -> bool;

const CHECKERS: &[(&str, Checker)] = &[("standard", standard), ("identical", identical)];

pub fn by_name(name: &str) -> Result<Checker> {
    CHECKERS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, checker)| *checker)
        .ok_or_else(|| JudgeError::InvalidInit(format!("unknown checker `{}`", name)))
}

/// Token-wise equality, line by line, ignoring trailing blank lines
pub fn standard(process_output: &[u8], judge_output: &[u8]) -> bool {
    significant_lines(process_output) == significant_lines(judge_output)
}

pub fn identical(process_output: &[u8], judge_output: &[u8]) -> bool {
    process_output == judge_output
}

fn significant_lines(output: &[u8]) -> Vec<Vec<&[u8]>> {
    let mut lines: Vec<Vec<&[u8]>> = output
        .split(|&byte| byte == b'\n')
        .map(|line| {
            line.split(|byte| byte.is_ascii_whitespace())
                .filter(|token| !token.is_empty())
                .collect()
        })
        .collect();
    while lines.last().map_or(false, Vec::is_empty) {
        lines.pop();
    }
    lines
}
