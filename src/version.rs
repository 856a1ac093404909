// Loose, component-wise version ordering for branch names and milestones

use std::fmt;

/// One run of a version string.
///
/// Numeric parts order before alpha parts, matching how mixed versions such as
/// `41` and `41a` have always been compared in the lab.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Part {
    Num(u64),
    Alpha(String),
}

/// A version compared part by part (`"R41"`, `"0.12.433"`, `"6812.B"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LooseVersion {
    parts: Vec<Part>,
}

impl LooseVersion {
    /// Split into runs of digits and letters; separators are dropped
    pub fn parse(s: &str) -> Self {
        let mut parts = Vec::new();
        let mut digits = String::new();
        let mut letters = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                if !letters.is_empty() {
                    parts.push(Part::Alpha(std::mem::take(&mut letters)));
                }
                digits.push(c);
            } else if c.is_alphabetic() {
                if !digits.is_empty() {
                    parts.push(Self::num_part(&std::mem::take(&mut digits)));
                }
                letters.push(c);
            } else {
                if !digits.is_empty() {
                    parts.push(Self::num_part(&std::mem::take(&mut digits)));
                }
                if !letters.is_empty() {
                    parts.push(Part::Alpha(std::mem::take(&mut letters)));
                }
            }
        }
        if !digits.is_empty() {
            parts.push(Self::num_part(&digits));
        }
        if !letters.is_empty() {
            parts.push(Part::Alpha(letters));
        }

        Self { parts }
    }

    /// Parse a milestone, ignoring a single leading `R` marker
    pub fn milestone(s: &str) -> Self {
        let trimmed = s.trim();
        let stripped = trimmed
            .strip_prefix('R')
            .or_else(|| trimmed.strip_prefix('r'))
            .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
            .unwrap_or(trimmed);
        Self::parse(stripped)
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    fn num_part(digits: &str) -> Part {
        // Anything that overflows u64 is not a milestone; keep it comparable as text.
        match digits.parse::<u64>() {
            Ok(n) => Part::Num(n),
            Err(_) => Part::Alpha(digits.to_string()),
        }
    }
}

impl fmt::Display for LooseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .parts
            .iter()
            .map(|p| match p {
                Part::Num(n) => n.to_string(),
                Part::Alpha(s) => s.clone(),
            })
            .collect();
        write!(f, "{}", rendered.join("."))
    }
}
