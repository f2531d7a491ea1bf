// File: src/errors.rs
//
// Error taxonomy for the Coyote compiler and VM. Compile errors are
// line-annotated and collected rather than raised one at a time (panic-mode
// recovery keeps parsing after a resync point); runtime errors are fatal
// and unwind the dispatch loop.

use colored::Colorize;
use std::fmt;

/// The category of a compile-time failure, following the taxonomy in the
/// specification: lexical, syntactic, and semantic errors are all surfaced
/// through `CompileError`, distinguished by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    Lexical,
    Syntactic,
    Semantic,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileErrorKind::Lexical => write!(f, "Lexical Error"),
            CompileErrorKind::Syntactic => write!(f, "Syntax Error"),
            CompileErrorKind::Semantic => write!(f, "Semantic Error"),
        }
    }
}

/// A single compile-time diagnostic with source position.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub line: u32,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: impl Into<String>, line: u32) -> Self {
        Self { kind, message: message.into(), line }
    }

    pub fn lexical(message: impl Into<String>, line: u32) -> Self {
        Self::new(CompileErrorKind::Lexical, message, line)
    }

    pub fn syntactic(message: impl Into<String>, line: u32) -> Self {
        Self::new(CompileErrorKind::Syntactic, message, line)
    }

    pub fn semantic(message: impl Into<String>, line: u32) -> Self {
        Self::new(CompileErrorKind::Semantic, message, line)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {}",
            format!("{}", self.kind).red().bold(),
            self.message.bold()
        )?;
        write!(f, "  {} line {}", "-->".bright_blue(), self.line)
    }
}

impl std::error::Error for CompileError {}

/// A fatal failure raised while the VM's dispatch loop is running: unhandled
/// opcode, wrong-kind operand, out-of-range index, nil dereference, and the
/// like. Unlike compile errors these are never collected — the first one
/// unwinds execution.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        Self { message: message.into(), line }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", "Runtime Error".red().bold(), self.message.bold())?;
        write!(f, "  {} line {}", "-->".bright_blue(), self.line)
    }
}

impl std::error::Error for RuntimeError {}

/// Computes the Levenshtein edit distance between two strings. Used to
/// suggest "did you mean '<name>'?" for undeclared identifiers that are
/// close to a known global, local, or native name.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let (len1, len2) = (s1_chars.len(), s2_chars.len());

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0usize; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(matrix[i - 1][j] + 1, matrix[i][j - 1] + 1),
                matrix[i - 1][j - 1] + cost,
            );
        }
    }

    matrix[len1][len2]
}

/// Finds the closest candidate to `target` within edit distance 3, or
/// `None` if nothing is close enough to be a plausible typo.
pub fn find_closest_match<'a>(target: &str, candidates: &'a [String]) -> Option<&'a str> {
    let mut best: Option<(&str, usize)> = None;
    for candidate in candidates {
        let distance = levenshtein_distance(target, candidate);
        if distance <= 3 && best.map(|(_, d)| distance < d).unwrap_or(true) {
            best = Some((candidate.as_str(), distance));
        }
    }
    best.map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_identical_is_zero() {
        assert_eq!(levenshtein_distance("count", "count"), 0);
    }

    #[test]
    fn levenshtein_finds_close_typo() {
        assert_eq!(levenshtein_distance("coutn", "count"), 2);
    }

    #[test]
    fn closest_match_prefers_smallest_distance() {
        let candidates = vec!["count".to_string(), "counter".to_string(), "total".to_string()];
        assert_eq!(find_closest_match("coutn", &candidates), Some("count"));
    }

    #[test]
    fn closest_match_none_when_too_far() {
        let candidates = vec!["zebra".to_string()];
        assert_eq!(find_closest_match("count", &candidates), None);
    }
}
