use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    error::{not_found, Missing, Rejection, Result},
    revision_id::RevisionId,
};

/// A name attached to a revision.
///
/// A fixed label keeps naming the revision it was applied to. A floating
/// label follows the tip of the line its target lives on: whenever a
/// check-in extends that line the label moves to the new revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    pub name: String,
    pub target: RevisionId,
    pub floating: bool,
    pub creator: String,
}

/// Labels of one archive, unique by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelTable {
    labels: BTreeMap<String, Label>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Label> {
        self.labels.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Label> {
        match self.labels.get(name) {
            Some(label) => Ok(label),
            None => not_found(Missing::Label(name.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.labels.values()
    }

    /// Names of the labels currently pointing at `id`.
    pub fn on(&self, id: &RevisionId) -> Vec<&str> {
        self.labels
            .values()
            .filter(|label| &label.target == id)
            .map(|label| label.name.as_str())
            .collect()
    }

    /// Adds `label`, or retargets an existing label of the same name when
    /// `reuse` is set. Leaves the table untouched on failure.
    pub fn apply(&mut self, label: Label, reuse: bool) -> Result<()> {
        if self.labels.contains_key(&label.name) && !reuse {
            return Err(Rejection::LabelAlreadyExists(label.name).into());
        }
        log::debug!(
            "label {:?} -> {}{}",
            label.name,
            label.target,
            if label.floating { " (floating)" } else { "" }
        );
        self.labels.insert(label.name.clone(), label);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Label> {
        match self.labels.remove(name) {
            Some(label) => Ok(label),
            None => not_found(Missing::Label(name.to_string())),
        }
    }

    /// Moves floating labels sitting on `from` to `to`, its successor in line.
    pub(crate) fn float(&mut self, from: &RevisionId, to: &RevisionId) {
        for label in self.labels.values_mut() {
            if label.floating && &label.target == from {
                log::debug!("floating label {:?} {} -> {}", label.name, from, to);
                label.target = to.clone();
            }
        }
    }

    pub(crate) fn insert_unchecked(&mut self, label: Label) {
        self.labels.insert(label.name.clone(), label);
    }
}

#[cfg(test)]
fn label(name: &str, target: &str, floating: bool) -> Label {
    Label {
        name: name.into(),
        target: target.parse().unwrap(),
        floating,
        creator: "alice".into(),
    }
}

#[test]
fn test_labels_are_unique() {
    let mut table = LabelTable::new();
    table.apply(label("REL1", "1.1", false), false).unwrap();
    let err = table.apply(label("REL1", "1.2", false), false).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::LabelAlreadyExists);
    assert_eq!(table.get("REL1").unwrap().target.to_string(), "1.1");

    table.apply(label("REL1", "1.2", false), true).unwrap();
    assert_eq!(table.get("REL1").unwrap().target.to_string(), "1.2");
    assert_eq!(table.len(), 1);
}

#[test]
fn test_only_floating_labels_move() {
    let mut table = LabelTable::new();
    table.apply(label("REL1", "1.2", false), false).unwrap();
    table.apply(label("HEAD", "1.2", true), false).unwrap();
    table.float(&"1.2".parse().unwrap(), &"1.3".parse().unwrap());
    assert_eq!(table.get("REL1").unwrap().target.to_string(), "1.2");
    assert_eq!(table.get("HEAD").unwrap().target.to_string(), "1.3");
    assert_eq!(table.on(&"1.3".parse().unwrap()), vec!["HEAD"]);
}

#[test]
fn test_remove() {
    let mut table = LabelTable::new();
    table.apply(label("REL1", "1.0", false), false).unwrap();
    assert_eq!(table.remove("REL1").unwrap().name, "REL1");
    let err = table.remove("REL1").unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    assert!(table.is_empty());
}
