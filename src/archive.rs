use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    digest::ContentDigest,
    error::{not_found, Missing, Rejection, Result},
    header::{ArchiveAttributes, ArchiveHeader},
    label::{Label, LabelTable},
    revision::{delta_base, NewRevision, Revision, RevisionHeader, RevisionStore},
    revision_id::RevisionId,
};

/// How a request picks a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum RevisionSelector {
    /// The archive's default revision. For unlock and check-in this is the
    /// revision the user holds locked, when there is one.
    Default,
    Id(RevisionId),
    Label(String),
    /// The newest revision checked in before the given time, following the
    /// history of the default revision.
    Date(DateTime<Utc>),
}

impl Default for RevisionSelector {
    fn default() -> Self {
        RevisionSelector::Default
    }
}

impl From<RevisionId> for RevisionSelector {
    fn from(id: RevisionId) -> Self {
        RevisionSelector::Id(id)
    }
}

/// Parameters for creating a new archive.
#[derive(Debug, Clone, Default)]
pub struct CreateArchive {
    pub author: String,
    /// Defaults to the workfile's file name when empty.
    pub module_description: String,
    pub comment_prefix: String,
    pub workfile_name: String,
    pub attributes: ArchiveAttributes,
    pub checkin_time: Option<DateTime<Utc>>,
    pub workfile_time: Option<DateTime<Utc>>,
    /// Leave `1.0` locked by the author.
    pub keep_locked: bool,
}

/// A label to attach to the revision a check-in produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRequest {
    pub name: String,
    #[serde(default)]
    pub floating: bool,
    #[serde(default)]
    pub reuse: bool,
}

/// Parameters for a check-in.
#[derive(Debug, Clone, Default)]
pub struct CheckIn {
    pub user: String,
    /// The revision the user has locked; when absent, the revision the user
    /// holds locked, or else the default revision.
    pub locked_revision: Option<RevisionId>,
    pub description: String,
    pub checkin_time: Option<DateTime<Utc>>,
    pub workfile_time: Option<DateTime<Utc>>,
    /// The new revision keeps the lock instead of releasing it.
    pub keep_locked: bool,
    /// Always start a new branch at the locked revision.
    pub force_branch: bool,
    /// Store a new revision even when the content did not change.
    pub create_new_revision_if_equal: bool,
    pub label: Option<LabelRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckInOutcome {
    pub revision: RevisionId,
    /// `false` when the content was unchanged and no revision was stored.
    pub created: bool,
}

/// What a label is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelTarget {
    Revision(RevisionSelector),
    /// Whatever the named label currently points at.
    DuplicateOf(String),
}

#[derive(Debug, Clone)]
pub struct ApplyLabel {
    pub user: String,
    pub name: String,
    pub target: LabelTarget,
    pub floating: bool,
    pub reuse: bool,
}

/// Everything a client gets to see about an archive.
#[derive(Debug, Clone, Serialize)]
pub struct LogfileInfo {
    pub header: ArchiveHeader,
    pub revisions: Vec<RevisionSummary>,
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevisionSummary {
    #[serde(flatten)]
    pub header: RevisionHeader,
    pub tip: bool,
    pub labels: Vec<String>,
}

/// The complete revision history of one versioned file, held in memory.
///
/// Operations here only touch memory. Persisting, and making sure a failed
/// operation leaves nothing behind, is up to [`crate::engine::ArchiveEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub(crate) header: ArchiveHeader,
    pub(crate) revisions: RevisionStore,
    pub(crate) labels: LabelTable,
}

impl Archive {
    /// A fresh archive holding `content` as revision `1.0`.
    pub fn create(content: &[u8], params: &CreateArchive, file_id: u32) -> Result<Self> {
        let checkin_time = whole_seconds(params.checkin_time);
        let lock_owner = if params.keep_locked && params.attributes.check_lock {
            Some(params.author.clone())
        } else {
            None
        };
        let module_description = if params.module_description.is_empty() {
            std::path::Path::new(&params.workfile_name)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            params.module_description.clone()
        };

        let mut revisions = RevisionStore::new();
        revisions.insert(Revision::new(NewRevision {
            id: RevisionId::root(),
            author: &params.author,
            checkin_time,
            workfile_time: params.workfile_time.map_or(checkin_time, |t| whole_seconds(Some(t))),
            description: "Initial Revision",
            lock_owner,
            content,
            compress: params.attributes.compress,
        })?)?;

        let header = ArchiveHeader {
            module_description,
            obsolete: false,
            lock_count: revisions.lock_count() as u32,
            default_revision: RevisionId::root(),
            owner: params.author.clone(),
            comment_prefix: params.comment_prefix.clone(),
            workfile_name: params.workfile_name.clone(),
            file_id,
            attributes: params.attributes,
        };
        Ok(Archive {
            header,
            revisions,
            labels: LabelTable::new(),
        })
    }

    pub(crate) fn from_parts(
        header: ArchiveHeader,
        revisions: RevisionStore,
        labels: LabelTable,
    ) -> Self {
        Archive {
            header,
            revisions,
            labels,
        }
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn revisions(&self) -> &RevisionStore {
        &self.revisions
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn labels_on(&self, id: &RevisionId) -> Vec<&str> {
        self.labels.on(id)
    }

    pub fn resolve(&self, selector: &RevisionSelector) -> Result<RevisionId> {
        match selector {
            RevisionSelector::Default => {
                let id = &self.header.default_revision;
                self.revisions.require(id)?;
                Ok(id.clone())
            }
            RevisionSelector::Id(id) => Ok(self.revisions.require(id)?.id().clone()),
            RevisionSelector::Label(name) => Ok(self.labels.require(name)?.target.clone()),
            RevisionSelector::Date(date) => self
                .revisions
                .history(&self.header.default_revision)
                .into_iter()
                .filter(|h| h.checkin_time < *date)
                .max_by(|a, b| (a.checkin_time, &a.id).cmp(&(b.checkin_time, &b.id)))
                .map(|h| h.id.clone())
                .map_or_else(|| not_found(Missing::RevisionBefore(*date)), Ok),
        }
    }

    /// Like [`Archive::resolve`], except that `Default` prefers the revision
    /// `user` holds locked.
    fn resolve_for_lock_holder(&self, selector: &RevisionSelector, user: &str) -> Result<RevisionId> {
        match (selector, self.revisions.locked_by(user)) {
            (RevisionSelector::Default, Some(locked)) => Ok(locked.clone()),
            _ => self.resolve(selector),
        }
    }

    pub fn content(&self, id: &RevisionId) -> Result<Vec<u8>> {
        self.revisions.content(id)
    }

    /// The identifier a check-in against `locked` creates.
    ///
    /// A forced branch, or a locked revision that already has a successor in
    /// its line, starts a new branch at `locked`. Otherwise the line is
    /// extended, whether or not branches are already rooted at `locked`.
    pub fn next_revision_id(&self, locked: &RevisionId, force_branch: bool) -> RevisionId {
        if force_branch || !self.revisions.is_tip(locked) {
            locked.branch(self.revisions.next_branch_number(locked))
        } else {
            locked.next_in_line()
        }
    }

    pub fn lock(&mut self, selector: &RevisionSelector, user: &str) -> Result<RevisionId> {
        if !self.header.attributes.check_lock {
            return Err(Rejection::LockingDisabled.into());
        }
        let id = self.resolve(selector)?;
        match &self.revisions.require(&id)?.header.lock_owner {
            Some(owner) if owner == user => return Ok(id),
            Some(owner) => {
                return Err(Rejection::AlreadyLocked {
                    revision: id,
                    locker: owner.clone(),
                }
                .into())
            }
            None => {}
        }
        if let Some(held) = self.revisions.locked_by(user) {
            return Err(Rejection::AlreadyLocked {
                revision: held.clone(),
                locker: user.to_string(),
            }
            .into());
        }
        self.revisions.require_mut(&id)?.header.lock_owner = Some(user.to_string());
        self.recount_locks();
        Ok(id)
    }

    /// Locks the selected revision for `user` and returns its content.
    pub fn check_out(&mut self, selector: &RevisionSelector, user: &str) -> Result<(RevisionId, Vec<u8>)> {
        let id = self.lock(selector, user)?;
        let content = self.content(&id)?;
        Ok((id, content))
    }

    pub fn unlock(&mut self, selector: &RevisionSelector, user: &str) -> Result<RevisionId> {
        let id = self.resolve_for_lock_holder(selector, user)?;
        let revision = self.revisions.require_mut(&id)?;
        if !revision.header.is_locked_by(user) {
            return Err(Rejection::NotLockedByUser {
                revision: id,
                user: user.to_string(),
            }
            .into());
        }
        revision.header.lock_owner = None;
        self.recount_locks();
        Ok(id)
    }

    pub fn check_in(&mut self, content: &[u8], params: &CheckIn) -> Result<CheckInOutcome> {
        let user = params.user.as_str();
        let selector = params
            .locked_revision
            .clone()
            .map_or(RevisionSelector::Default, RevisionSelector::Id);
        let locked = self.resolve_for_lock_holder(&selector, user)?;
        let locked_header = &self.revisions.require(&locked)?.header;
        let held_by_user = locked_header.is_locked_by(user);
        if self.header.attributes.check_lock && !held_by_user {
            return Err(Rejection::NotLockedByUser {
                revision: locked,
                user: user.to_string(),
            }
            .into());
        }
        if let Some(label) = &params.label {
            if !label.reuse && self.labels.get(&label.name).is_some() {
                return Err(Rejection::LabelAlreadyExists(label.name.clone()).into());
            }
        }

        if ContentDigest::of(content) == locked_header.digest && !params.create_new_revision_if_equal {
            log::debug!("content of {} unchanged, no revision created", locked);
            if held_by_user && !params.keep_locked {
                self.revisions.require_mut(&locked)?.header.lock_owner = None;
            }
            if let Some(label) = &params.label {
                self.attach_label(label, &locked, user)?;
            }
            self.recount_locks();
            return Ok(CheckInOutcome {
                revision: locked,
                created: false,
            });
        }

        let new_id = self.next_revision_id(&locked, params.force_branch);
        let checkin_time = whole_seconds(params.checkin_time);
        let revision = Revision::new(NewRevision {
            id: new_id.clone(),
            author: user,
            checkin_time,
            workfile_time: params.workfile_time.map_or(checkin_time, |t| whole_seconds(Some(t))),
            description: &params.description,
            lock_owner: if params.keep_locked && self.header.attributes.check_lock {
                Some(user.to_string())
            } else {
                None
            },
            content,
            compress: self.header.attributes.compress,
        })?;
        if held_by_user {
            self.revisions.require_mut(&locked)?.header.lock_owner = None;
        }
        self.revisions.insert(revision)?;
        if self.header.attributes.stores_deltas() {
            let compress = self.header.attributes.compress;
            if new_id.is_trunk() {
                // The old trunk tip becomes a reverse delta.
                self.revisions.store_as_delta(&locked, content, compress)?;
            } else {
                let previous = self.content(&locked)?;
                self.revisions.store_as_delta(&new_id, &previous, compress)?;
            }
        }

        if new_id.same_line(&locked) {
            self.labels.float(&locked, &new_id);
            if self.header.default_revision == locked {
                self.header.default_revision = new_id.clone();
            }
        }
        if let Some(label) = &params.label {
            self.attach_label(label, &new_id, user)?;
        }
        self.recount_locks();
        log::info!("{} checked in {} (from {})", user, new_id, locked);
        Ok(CheckInOutcome {
            revision: new_id,
            created: true,
        })
    }

    fn attach_label(&mut self, request: &LabelRequest, id: &RevisionId, user: &str) -> Result<()> {
        let target = if request.floating {
            self.revisions.tip_of_line(id)
        } else {
            id.clone()
        };
        self.labels.apply(
            Label {
                name: request.name.clone(),
                target,
                floating: request.floating,
                creator: user.to_string(),
            },
            request.reuse,
        )
    }

    /// Applies a label and returns the revision it now points at.
    pub fn apply_label(&mut self, params: &ApplyLabel) -> Result<RevisionId> {
        let id = match &params.target {
            LabelTarget::Revision(selector) => self.resolve(selector)?,
            LabelTarget::DuplicateOf(name) => self.labels.require(name)?.target.clone(),
        };
        let request = LabelRequest {
            name: params.name.clone(),
            floating: params.floating,
            reuse: params.reuse,
        };
        self.attach_label(&request, &id, &params.user)?;
        Ok(self.labels.require(&params.name)?.target.clone())
    }

    pub fn remove_label(&mut self, name: &str) -> Result<Label> {
        self.labels.remove(name)
    }

    pub fn set_obsolete(&mut self, obsolete: bool) {
        self.header.obsolete = obsolete;
    }

    pub fn set_module_description(&mut self, description: &str) {
        self.header.module_description = description.to_string();
    }

    pub fn set_revision_description(
        &mut self,
        selector: &RevisionSelector,
        description: &str,
    ) -> Result<RevisionId> {
        let id = self.resolve(selector)?;
        self.revisions.require_mut(&id)?.header.description = description.to_string();
        Ok(id)
    }

    pub fn info(&self) -> LogfileInfo {
        LogfileInfo {
            header: self.header.clone(),
            revisions: self
                .revisions
                .headers()
                .map(|header| RevisionSummary {
                    header: header.clone(),
                    tip: self.revisions.is_tip(&header.id),
                    labels: self.labels.on(&header.id).into_iter().map(String::from).collect(),
                })
                .collect(),
            labels: self.labels.iter().cloned().collect(),
        }
    }

    fn recount_locks(&mut self) {
        self.header.lock_count = self.revisions.lock_count() as u32;
    }

    /// Checks the structural invariants a stored archive must satisfy.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.revisions.contains(&RevisionId::root()) {
            return Err("archive has no revision 1.0".into());
        }
        for id in self.revisions.ids() {
            if *id == RevisionId::root() {
                continue;
            }
            let anchor = id.previous_in_line().or_else(|| id.branch_origin());
            if !anchor.map(|a| self.revisions.contains(&a)).unwrap_or(false) {
                return Err(format!("revision {} is unreachable", id));
            }
        }
        for revision in self.revisions.iter().filter(|r| r.header.delta) {
            let base = delta_base(revision.id());
            if !base.map(|b| self.revisions.contains(&b)).unwrap_or(false) {
                return Err(format!(
                    "revision {} is stored as a delta against a missing revision",
                    revision.id()
                ));
            }
        }
        if self.header.lock_count as usize != self.revisions.lock_count() {
            return Err(format!(
                "lock count {} does not match {} locked revisions",
                self.header.lock_count,
                self.revisions.lock_count()
            ));
        }
        if !self.revisions.contains(&self.header.default_revision) {
            return Err(format!(
                "default revision {} does not exist",
                self.header.default_revision
            ));
        }
        for label in self.labels.iter() {
            if !self.revisions.contains(&label.target) {
                return Err(format!(
                    "label {:?} points at missing revision {}",
                    label.name, label.target
                ));
            }
        }
        Ok(())
    }
}

/// Timestamps are kept with one second resolution.
pub(crate) fn whole_seconds(time: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let time = time.unwrap_or_else(Utc::now);
    DateTime::<Utc>::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}

#[cfg(test)]
mod test_support {
    use super::*;

    pub fn rev(s: &str) -> RevisionId {
        s.parse().unwrap()
    }

    pub fn at(secs: i64) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(secs, 0)
    }

    pub fn new_archive() -> Archive {
        Archive::create(
            b"first\n",
            &CreateArchive {
                author: "alice".into(),
                workfile_name: "src/main.c".into(),
                checkin_time: at(1_000),
                ..Default::default()
            },
            7,
        )
        .unwrap()
    }

    pub fn check_in(user: &str, locked: &str) -> CheckIn {
        CheckIn {
            user: user.into(),
            locked_revision: Some(rev(locked)),
            description: format!("{} edits", user),
            create_new_revision_if_equal: true,
            ..Default::default()
        }
    }

    /// Locks `locked` for `user` and checks in `content` against it.
    pub fn commit(
        archive: &mut Archive,
        user: &str,
        locked: &str,
        content: &[u8],
        force_branch: bool,
    ) -> RevisionId {
        archive.lock(&RevisionSelector::Id(rev(locked)), user).unwrap();
        let mut params = check_in(user, locked);
        params.force_branch = force_branch;
        let outcome = archive.check_in(content, &params).unwrap();
        assert!(outcome.created);
        outcome.revision
    }
}

#[cfg(test)]
use test_support::*;

#[test]
fn test_create() {
    let archive = new_archive();
    assert_eq!(archive.revisions().len(), 1);
    assert_eq!(archive.header().default_revision, rev("1.0"));
    assert_eq!(archive.header().lock_count, 0);
    assert!(!archive.header().obsolete);
    assert_eq!(archive.header().module_description, "main.c");
    assert_eq!(archive.header().file_id, 7);
    assert_eq!(archive.content(&rev("1.0")).unwrap(), b"first\n");
    assert_eq!(archive.revisions().get(&rev("1.0")).unwrap().header.description, "Initial Revision");
    archive.validate().unwrap();
}

#[test]
fn test_create_keeping_lock() {
    let archive = Archive::create(
        b"x",
        &CreateArchive {
            author: "alice".into(),
            keep_locked: true,
            ..Default::default()
        },
        1,
    )
    .unwrap();
    assert_eq!(archive.header().lock_count, 1);
    assert_eq!(archive.revisions().locked_by("alice"), Some(&rev("1.0")));
}

#[test]
fn test_trunk_check_in() {
    let mut archive = new_archive();
    let (id, content) = archive.check_out(&RevisionSelector::Default, "alice").unwrap();
    assert_eq!(id, rev("1.0"));
    assert_eq!(content, b"first\n");
    assert_eq!(archive.header().lock_count, 1);

    let outcome = archive.check_in(b"first\n", &check_in("alice", "1.0")).unwrap();
    assert_eq!(outcome, CheckInOutcome { revision: rev("1.1"), created: true });
    assert!(!archive.revisions().get(&rev("1.0")).unwrap().header.is_locked());
    assert_eq!(archive.header().lock_count, 0);
    assert_eq!(archive.header().default_revision, rev("1.1"));
    archive.validate().unwrap();
}

#[test]
fn test_unchanged_content_creates_nothing() {
    let mut archive = new_archive();
    archive.lock(&RevisionSelector::Default, "alice").unwrap();
    let mut params = check_in("alice", "1.0");
    params.create_new_revision_if_equal = false;
    let outcome = archive.check_in(b"first\n", &params).unwrap();
    assert_eq!(outcome, CheckInOutcome { revision: rev("1.0"), created: false });
    assert_eq!(archive.revisions().len(), 1);
    assert_eq!(archive.header().lock_count, 0);
}

#[test]
fn test_forced_branch_then_same_level() {
    let mut archive = new_archive();
    assert_eq!(commit(&mut archive, "bob", "1.0", b"b1", true), rev("1.0.1.1"));
    assert_eq!(commit(&mut archive, "bob", "1.0.1.1", b"b2", true), rev("1.0.1.1.1.1"));
    assert_eq!(commit(&mut archive, "bob", "1.0.1.1", b"b3", false), rev("1.0.1.2"));
    assert!(archive.revisions().contains(&rev("1.0.1.1.1.1")));
    assert_eq!(archive.content(&rev("1.0.1.1.1.1")).unwrap(), b"b2");
    // Branch check-ins leave the trunk default alone.
    assert_eq!(archive.header().default_revision, rev("1.0"));
    archive.validate().unwrap();
}

#[test]
fn test_non_tip_check_in_branches() {
    let mut archive = new_archive();
    commit(&mut archive, "alice", "1.0", b"v1", false);
    commit(&mut archive, "alice", "1.1", b"v2", false);
    // 1.1 already has a successor, so this must branch.
    assert_eq!(commit(&mut archive, "bob", "1.1", b"fix", false), rev("1.1.1.1"));
    assert_eq!(commit(&mut archive, "bob", "1.1", b"fix2", false), rev("1.1.2.1"));
    assert_eq!(archive.header().default_revision, rev("1.2"));
}

#[test]
fn test_existing_deeper_branch_does_not_force_branching() {
    let mut archive = new_archive();
    commit(&mut archive, "alice", "1.0", b"branch", true);
    // 1.0 has a branch but no successor: extending the trunk is allowed.
    assert_eq!(commit(&mut archive, "alice", "1.0", b"trunk", false), rev("1.1"));
    assert_eq!(archive.content(&rev("1.0.1.1")).unwrap(), b"branch");
}

#[test]
fn test_keep_locked_moves_lock_to_new_revision() {
    let mut archive = new_archive();
    archive.lock(&RevisionSelector::Default, "alice").unwrap();
    let mut params = check_in("alice", "1.0");
    params.keep_locked = true;
    let outcome = archive.check_in(b"v1", &params).unwrap();
    assert_eq!(archive.revisions().locked_by("alice"), Some(&outcome.revision));
    assert!(!archive.revisions().get(&rev("1.0")).unwrap().header.is_locked());
    assert_eq!(archive.header().lock_count, 1);
}

#[test]
fn test_lock_discipline() {
    let mut archive = new_archive();
    archive.lock(&RevisionSelector::Default, "alice").unwrap();
    // Same user again is a no-op.
    archive.lock(&RevisionSelector::Default, "alice").unwrap();
    assert_eq!(archive.header().lock_count, 1);

    let err = archive.lock(&RevisionSelector::Default, "bob").unwrap_err();
    assert_eq!(
        err.rejection(),
        Some(&Rejection::AlreadyLocked { revision: rev("1.0"), locker: "alice".into() })
    );

    let err = archive.check_in(b"bob's", &check_in("bob", "1.0")).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::NotLockedByUser);

    let err = archive.unlock(&RevisionSelector::Default, "bob").unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::NotLockedByUser);

    assert_eq!(archive.unlock(&RevisionSelector::Default, "alice").unwrap(), rev("1.0"));
    assert_eq!(archive.header().lock_count, 0);
}

#[test]
fn test_one_lock_per_user() {
    let mut archive = new_archive();
    commit(&mut archive, "alice", "1.0", b"v1", false);
    archive.lock(&RevisionSelector::Id(rev("1.1")), "alice").unwrap();
    let err = archive.lock(&RevisionSelector::Id(rev("1.0")), "alice").unwrap_err();
    assert_eq!(
        err.rejection(),
        Some(&Rejection::AlreadyLocked { revision: rev("1.1"), locker: "alice".into() })
    );
}

#[test]
fn test_check_in_missing_revision() {
    let mut archive = new_archive();
    let err = archive.check_in(b"x", &check_in("alice", "1.0.3.1")).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    let err = archive.check_in(b"x", &check_in("alice", "1.0.3.1.1.1")).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRevisionIdentifier);
}

#[test]
fn test_locking_disabled() {
    let mut archive = Archive::create(
        b"x",
        &CreateArchive {
            author: "alice".into(),
            attributes: ArchiveAttributes {
                check_lock: false,
                compress: false,
                ..Default::default()
            },
            ..Default::default()
        },
        1,
    )
    .unwrap();
    let err = archive.lock(&RevisionSelector::Default, "alice").unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::LockingDisabled);
    let params = CheckIn { user: "bob".into(), ..Default::default() };
    let outcome = archive.check_in(b"y", &params).unwrap();
    assert_eq!(outcome.revision, rev("1.1"));
}

#[test]
fn test_fixed_and_floating_labels() {
    let mut archive = new_archive();
    commit(&mut archive, "alice", "1.0", b"v1", false);
    let label = |name: &str, floating: bool, reuse: bool| ApplyLabel {
        user: "alice".into(),
        name: name.into(),
        target: LabelTarget::Revision(RevisionSelector::Default),
        floating,
        reuse,
    };
    assert_eq!(archive.apply_label(&label("REL1", false, false)).unwrap(), rev("1.1"));
    commit(&mut archive, "alice", "1.1", b"v2", false);
    assert_eq!(archive.resolve(&RevisionSelector::Label("REL1".into())).unwrap(), rev("1.1"));

    assert_eq!(archive.apply_label(&label("HEAD", true, false)).unwrap(), rev("1.2"));
    commit(&mut archive, "alice", "1.2", b"v3", false);
    assert_eq!(archive.resolve(&RevisionSelector::Label("HEAD".into())).unwrap(), rev("1.3"));
    assert_eq!(archive.labels_on(&rev("1.3")), vec!["HEAD"]);

    // A branch off the floating label's revision does not move it.
    commit(&mut archive, "alice", "1.3", b"side", true);
    assert_eq!(archive.resolve(&RevisionSelector::Label("HEAD".into())).unwrap(), rev("1.3"));
}

#[test]
fn test_floating_label_on_old_revision_targets_tip() {
    let mut archive = new_archive();
    commit(&mut archive, "alice", "1.0", b"v1", false);
    let id = archive
        .apply_label(&ApplyLabel {
            user: "alice".into(),
            name: "LATEST".into(),
            target: LabelTarget::Revision(RevisionSelector::Id(rev("1.0"))),
            floating: true,
            reuse: false,
        })
        .unwrap();
    assert_eq!(id, rev("1.1"));
}

#[test]
fn test_duplicate_and_reuse_labels() {
    let mut archive = new_archive();
    commit(&mut archive, "alice", "1.0", b"v1", false);
    let apply = |name: &str, target: LabelTarget, reuse: bool| ApplyLabel {
        user: "alice".into(),
        name: name.into(),
        target,
        floating: false,
        reuse,
    };
    archive
        .apply_label(&apply("REL1", LabelTarget::Revision(RevisionSelector::Id(rev("1.0"))), false))
        .unwrap();
    let before = archive.clone();
    let err = archive
        .apply_label(&apply("REL1", LabelTarget::Revision(RevisionSelector::Id(rev("1.1"))), false))
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::LabelAlreadyExists);
    assert_eq!(archive, before);

    archive
        .apply_label(&apply("REL1", LabelTarget::Revision(RevisionSelector::Id(rev("1.1"))), true))
        .unwrap();
    assert_eq!(archive.labels().get("REL1").unwrap().target, rev("1.1"));

    let id = archive.apply_label(&apply("COPY", LabelTarget::DuplicateOf("REL1".into()), false)).unwrap();
    assert_eq!(id, rev("1.1"));
    let err = archive
        .apply_label(&apply("OTHER", LabelTarget::DuplicateOf("NOPE".into()), false))
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);

    archive.remove_label("COPY").unwrap();
    assert_eq!(archive.remove_label("COPY").unwrap_err().kind(), crate::error::ErrorKind::NotFound);
}

#[test]
fn test_check_in_with_label() {
    let mut archive = new_archive();
    archive.lock(&RevisionSelector::Default, "alice").unwrap();
    let mut params = check_in("alice", "1.0");
    params.label = Some(LabelRequest { name: "BUILD".into(), floating: false, reuse: false });
    archive.check_in(b"v1", &params).unwrap();
    assert_eq!(archive.labels().get("BUILD").unwrap().target, rev("1.1"));

    archive.lock(&RevisionSelector::Default, "alice").unwrap();
    let before = archive.clone();
    let mut params = check_in("alice", "1.1");
    params.label = Some(LabelRequest { name: "BUILD".into(), floating: false, reuse: false });
    let err = archive.check_in(b"v2", &params).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::LabelAlreadyExists);
    assert_eq!(archive, before);
}

#[test]
fn test_select_by_date() {
    let mut archive = new_archive();
    for (secs, locked) in [(2_000, "1.0"), (3_000, "1.1")] {
        archive.lock(&RevisionSelector::Id(rev(locked)), "alice").unwrap();
        let mut params = check_in("alice", locked);
        params.checkin_time = at(secs);
        archive.check_in(format!("{}", secs).as_bytes(), &params).unwrap();
    }
    let by_date = |secs| archive.resolve(&RevisionSelector::Date(at(secs).unwrap()));
    assert_eq!(by_date(2_500).unwrap(), rev("1.1"));
    assert_eq!(by_date(3_000).unwrap(), rev("1.1"));
    assert_eq!(by_date(3_001).unwrap(), rev("1.2"));
    assert_eq!(by_date(500).unwrap_err().kind(), crate::error::ErrorKind::NotFound);
}

#[test]
fn test_descriptions_and_obsolete() {
    let mut archive = new_archive();
    archive.set_module_description("the main program");
    archive.set_obsolete(true);
    assert_eq!(
        archive.set_revision_description(&RevisionSelector::Default, "first cut").unwrap(),
        rev("1.0")
    );
    assert_eq!(archive.header().module_description, "the main program");
    assert!(archive.header().obsolete);
    assert_eq!(archive.revisions().get(&rev("1.0")).unwrap().header.description, "first cut");
}

#[test]
fn test_info_lists_everything() {
    let mut archive = new_archive();
    commit(&mut archive, "alice", "1.0", b"v1", false);
    archive
        .apply_label(&ApplyLabel {
            user: "alice".into(),
            name: "REL1".into(),
            target: LabelTarget::Revision(RevisionSelector::Default),
            floating: false,
            reuse: false,
        })
        .unwrap();
    let info = archive.info();
    assert_eq!(info.revisions.len(), 2);
    assert!(!info.revisions[0].tip);
    assert!(info.revisions[1].tip);
    assert_eq!(info.revisions[1].labels, vec!["REL1".to_string()]);
    assert_eq!(info.labels.len(), 1);
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["revisions"][1]["id"], "1.1");
}

#[cfg(test)]
fn text(lines: std::ops::Range<usize>, extra: &str) -> Vec<u8> {
    let mut text: String = lines.map(|n| format!("int line_{} = {};\n", n, n)).collect();
    text.push_str(extra);
    text.into_bytes()
}

#[test]
fn test_check_ins_keep_deltas() {
    let mut archive = Archive::create(
        &text(0..200, ""),
        &CreateArchive {
            author: "alice".into(),
            ..Default::default()
        },
        1,
    )
    .unwrap();
    let versions = [
        ("1.1", "1.0", text(0..200, "// one\n")),
        ("1.2", "1.1", text(0..200, "// one\n// two\n")),
        ("1.1.1.1", "1.1", text(10..200, "// one\n")),
        ("1.1.1.2", "1.1.1.1", text(10..180, "// one\n")),
    ];
    for (expected, locked, content) in &versions {
        assert_eq!(commit(&mut archive, "alice", locked, content, false), rev(expected));
    }
    archive.validate().unwrap();

    let whole: Vec<String> = archive
        .revisions()
        .headers()
        .filter(|h| !h.delta)
        .map(|h| h.id.to_string())
        .collect();
    assert_eq!(whole, vec!["1.2"]);
    assert_eq!(archive.content(&rev("1.0")).unwrap(), text(0..200, ""));
    for (id, _, content) in &versions {
        assert_eq!(&archive.content(&rev(id)).unwrap(), content);
    }

    let decoded = crate::codec::decode(&crate::codec::encode(&mut archive).unwrap()).unwrap();
    assert_eq!(decoded, archive);
    assert_eq!(decoded.content(&rev("1.1.1.2")).unwrap(), versions[3].2);

    let mut broken = archive.clone();
    broken.revisions.require_mut(&rev("1.2")).unwrap().header.delta = true;
    assert!(broken.validate().is_err());
}

#[test]
fn test_binary_archives_store_whole_revisions() {
    for attributes in [
        ArchiveAttributes {
            binary: true,
            ..Default::default()
        },
        ArchiveAttributes {
            compute_delta: false,
            ..Default::default()
        },
    ] {
        let mut archive = Archive::create(
            &text(0..100, ""),
            &CreateArchive {
                author: "alice".into(),
                attributes,
                ..Default::default()
            },
            1,
        )
        .unwrap();
        commit(&mut archive, "alice", "1.0", &text(0..100, "x\n"), false);
        commit(&mut archive, "alice", "1.0", &text(5..100, ""), false);
        assert!(archive.revisions().headers().all(|h| !h.delta));
        assert_eq!(archive.content(&rev("1.0.1.1")).unwrap(), text(5..100, ""));
    }
}
