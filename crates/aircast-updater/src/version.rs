//! Version parsing and ordering.
//!
//! Feed versions are free-form strings ("1.2", "1.0beta3", "2024.05.17+build9").
//! A [`Version`] keeps the raw string and a derived sequence of components:
//!
//! - Build metadata (everything from the first `+`) is ignored.
//! - The rest is split into maximal runs of ASCII digits (numeric components)
//!   and maximal runs of other alphanumeric characters (text components).
//!   Any other character is a separator and produces no component.
//!
//! Ordering walks both sequences position by position:
//!
//! - numeric vs numeric compares by value with unlimited precision
//! - text vs text compares lexicographically
//! - text sorts below numeric, so pre-release tags sort below releases
//! - a missing position counts as numeric zero, so `1.2 == 1.2.0`
//!
//! A string with no components at all (empty, only separators) is the bottom
//! element: equal to other such strings and below everything else.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One run of a version string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    /// Digits with leading zeros stripped ("" is zero)
    Numeric(String),
    /// Non-numeric alphanumeric run
    Text(String),
}

static ZERO: Component = Component::Numeric(String::new());

impl Component {
    fn cmp_to(&self, other: &Component) -> Ordering {
        match (self, other) {
            (Component::Numeric(a), Component::Numeric(b)) => {
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
            (Component::Text(a), Component::Text(b)) => a.cmp(b),
            (Component::Text(_), Component::Numeric(_)) => Ordering::Less,
            (Component::Numeric(_), Component::Text(_)) => Ordering::Greater,
        }
    }
}

/// A parsed, immutable version string.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    components: Vec<Component>,
}

impl Version {
    /// Parse a version string. Any input is accepted.
    pub fn parse(raw: &str) -> Self {
        let significant = raw.split('+').next().unwrap_or("");
        let mut components = Vec::new();
        let mut current = String::new();
        let mut current_numeric = false;

        for c in significant.chars() {
            let numeric = c.is_ascii_digit();
            if !c.is_alphanumeric() {
                flush(&mut current, current_numeric, &mut components);
                continue;
            }
            if !current.is_empty() && numeric != current_numeric {
                flush(&mut current, current_numeric, &mut components);
            }
            current_numeric = numeric;
            current.push(c);
        }
        flush(&mut current, current_numeric, &mut components);

        Self {
            raw: raw.to_string(),
            components,
        }
    }

    /// The original string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the string produced no components.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Compare two versions with the standard rule.
    pub fn compare(a: &Version, b: &Version) -> Ordering {
        a.cmp(b)
    }
}

fn flush(current: &mut String, numeric: bool, out: &mut Vec<Component>) {
    if current.is_empty() {
        return;
    }
    let run = std::mem::take(current);
    if numeric {
        out.push(Component::Numeric(run.trim_start_matches('0').to_string()));
    } else {
        out.push(Component::Text(run));
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_empty(), other.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).unwrap_or(&ZERO);
            let b = other.components.get(i).unwrap_or(&ZERO);
            match a.cmp_to(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Compares versions during candidate selection.
///
/// Hosts may install their own comparator through the policy hooks.
/// Downgrade prevention at handoff always uses [`StandardVersionComparator`].
pub trait VersionComparator: Send + Sync {
    /// Order `a` relative to `b`.
    fn compare(&self, a: &Version, b: &Version) -> Ordering;
}

/// The built-in comparator described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardVersionComparator;

impl VersionComparator for StandardVersionComparator {
    fn compare(&self, a: &Version, b: &Version) -> Ordering {
        Version::compare(a, b)
    }
}
