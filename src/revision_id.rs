use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Rejection};

/// A dotted revision number such as `1.3` or `1.3.1.1`.
///
/// The first pair is the trunk coordinate and every further pair is a
/// `(branch, revision)` step one level deeper. Always non-empty and of even
/// length.
///
/// Identifiers are ordered component by component, with a prefix ordered
/// before its extensions, so `1.0 < 1.0.1.1 < 1.0.1.2 < 1.1`. Both ways of
/// deriving a new revision (next in line, new branch) produce something
/// strictly greater.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionId(Vec<u32>);

impl RevisionId {
    /// The very first revision of every archive.
    pub fn root() -> Self {
        RevisionId(vec![1, 0])
    }

    pub fn new(components: Vec<u32>) -> Result<Self, Error> {
        if components.is_empty() || components.len() % 2 != 0 {
            return Err(Rejection::InvalidRevisionIdentifier {
                text: join(&components),
                reason: "expected an even, non-zero number of components",
            }
            .into());
        }
        Ok(RevisionId(components))
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    pub fn is_trunk(&self) -> bool {
        self.0.len() == 2
    }

    pub fn last(&self) -> u32 {
        self.0[self.0.len() - 1]
    }

    /// Everything but the last component, naming the line of revisions this
    /// one belongs to. `1.3.2.5` lives on line `1.3.2`.
    pub fn line(&self) -> &[u32] {
        &self.0[..self.0.len() - 1]
    }

    pub fn same_line(&self, other: &RevisionId) -> bool {
        self.line() == other.line()
    }

    /// The revision a branch was rooted at, or `None` on the trunk.
    pub fn branch_origin(&self) -> Option<RevisionId> {
        if self.is_trunk() {
            None
        } else {
            Some(RevisionId(self.0[..self.0.len() - 2].to_vec()))
        }
    }

    /// The branch number this revision's innermost branch has at its origin.
    pub fn branch_number(&self) -> Option<u32> {
        if self.is_trunk() {
            None
        } else {
            Some(self.0[self.0.len() - 2])
        }
    }

    /// The same-level successor, `1.3 -> 1.4`.
    pub fn next_in_line(&self) -> RevisionId {
        let mut next = self.0.clone();
        let last = next.len() - 1;
        next[last] += 1;
        RevisionId(next)
    }

    /// The same-level predecessor, `1.3 -> 1.2`; `None` at the start of a line.
    pub fn previous_in_line(&self) -> Option<RevisionId> {
        let start = if self.is_trunk() { 0 } else { 1 };
        if self.last() <= start {
            return None;
        }
        let mut previous = self.0.clone();
        let last = previous.len() - 1;
        previous[last] -= 1;
        Some(RevisionId(previous))
    }

    /// First revision on branch number `branch` rooted here, `1.3 -> 1.3.b.1`.
    pub fn branch(&self, branch: u32) -> RevisionId {
        let mut first = self.0.clone();
        first.push(branch);
        first.push(1);
        RevisionId(first)
    }

    /// Whether `self` is a first-level branch revision rooted at `origin`.
    pub fn is_branched_from(&self, origin: &RevisionId) -> bool {
        self.0.len() == origin.0.len() + 2 && self.0.starts_with(&origin.0)
    }
}

impl Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", join(&self.0))
    }
}

impl FromStr for RevisionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| Rejection::InvalidRevisionIdentifier {
            text: s.to_string(),
            reason,
        };
        let mut components = Vec::new();
        for part in s.trim().split('.') {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("components must be unsigned integers").into());
            }
            let number = part
                .parse::<u32>()
                .map_err(|_| invalid("component out of range"))?;
            components.push(number);
        }
        RevisionId::new(components).map_err(|_| invalid("expected major.minor pairs").into())
    }
}

impl Serialize for RevisionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RevisionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn join(components: &[u32]) -> String {
    components
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
fn rev(s: &str) -> RevisionId {
    s.parse().unwrap()
}

#[test]
fn test_parse_and_display() {
    assert_eq!(rev("1.3.1.1").components(), &[1, 3, 1, 1]);
    assert_eq!(rev("1.3.1.1").to_string(), "1.3.1.1");
    assert_eq!(rev(" 1.0 "), RevisionId::root());
    for bad in ["", "1", "1.2.3", "1..2", "a.b", "1.-2", "1.2.", "99999999999.0"] {
        let err = bad.parse::<RevisionId>().unwrap_err();
        assert_eq!(
            err.kind(),
            crate::error::ErrorKind::InvalidRevisionIdentifier,
            "{:?}",
            bad
        );
    }
}

#[test]
fn test_ordering_is_level_aware() {
    let mut ids = vec![rev("1.1"), rev("1.0.1.2"), rev("1.0"), rev("1.0.1.1.1.1"), rev("1.0.1.1"), rev("1.0.2.1")];
    ids.sort();
    let sorted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    assert_eq!(
        sorted,
        vec!["1.0", "1.0.1.1", "1.0.1.1.1.1", "1.0.1.2", "1.0.2.1", "1.1"]
    );
}

#[test]
fn test_derivations() {
    let id = rev("1.3.2.5");
    assert_eq!(id.line(), &[1, 3, 2]);
    assert_eq!(id.branch_origin(), Some(rev("1.3")));
    assert_eq!(id.branch_number(), Some(2));
    assert_eq!(id.next_in_line(), rev("1.3.2.6"));
    assert_eq!(id.previous_in_line(), Some(rev("1.3.2.4")));
    assert_eq!(rev("1.3.2.1").previous_in_line(), None);
    assert_eq!(rev("1.0").previous_in_line(), None);
    assert_eq!(rev("1.1").previous_in_line(), Some(rev("1.0")));
    assert_eq!(id.branch(3), rev("1.3.2.5.3.1"));
    assert!(rev("1.3.2.5.3.1").is_branched_from(&id));
    assert!(!rev("1.3.2.5.3.1.1.1").is_branched_from(&id));
    assert!(rev("1.0").is_trunk());
    assert_eq!(rev("1.0").branch_origin(), None);
}

#[test]
fn test_derived_ids_are_greater() {
    for s in ["1.0", "1.7", "1.0.1.1", "2.4.3.9.1.1"] {
        let id = rev(s);
        assert!(id.next_in_line() > id);
        assert!(id.branch(1) > id);
        assert!(id.branch(7) > id.branch(1));
    }
}

#[test]
fn test_serde_as_text() {
    let json = serde_json::to_string(&rev("1.2.1.4")).unwrap();
    assert_eq!(json, "\"1.2.1.4\"");
    let back: RevisionId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, rev("1.2.1.4"));
    assert!(serde_json::from_str::<RevisionId>("\"1.2.1\"").is_err());
}
