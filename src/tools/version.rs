//! Version constraints such as `9+`, `4.8-` or `3.10`

use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Exact,
    AtLeast,
    AtMost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    parts: Vec<u64>,
    bound: Bound,
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid version constraint: {0}")]
pub struct InvalidConstraint(String);

impl FromStr for VersionConstraint {
    type Err = InvalidConstraint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (number, bound) = if let Some(n) = s.strip_suffix('+') {
            (n, Bound::AtLeast)
        } else if let Some(n) = s.strip_suffix('-') {
            (n, Bound::AtMost)
        } else {
            (s, Bound::Exact)
        };

        let parts = number
            .split('.')
            .take(3)
            .map(|p| p.trim().parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| InvalidConstraint(s.to_string()))?;

        Ok(Self { parts, bound })
    }
}

impl VersionConstraint {
    /// Components missing on either side match anything
    pub fn matches(&self, version: &Version) -> bool {
        let ordering = self
            .parts
            .iter()
            .zip(&version.0)
            .map(|(want, have)| have.cmp(want))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal);

        match self.bound {
            Bound::Exact => ordering == Ordering::Equal,
            Bound::AtLeast => ordering != Ordering::Less,
            Bound::AtMost => ordering != Ordering::Greater,
        }
    }
}

/// Detected `major.minor[.point]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(Vec<u64>);

impl Version {
    /// First `N.N[.N]` run in a version banner
    pub fn detect(text: &str) -> Option<Self> {
        static VERSION: OnceLock<Regex> = OnceLock::new();
        let re = VERSION.get_or_init(|| {
            Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("valid version regex")
        });
        let caps = re.captures(text)?;
        let parts = caps
            .iter()
            .skip(1)
            .flatten()
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        Some(Self(parts))
    }
}
