use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    codec, delta,
    digest::ContentDigest,
    error::{not_found, CorruptArchive, Missing, Rejection, Result},
    revision_id::RevisionId,
};

/// Metadata kept for every revision in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionHeader {
    pub id: RevisionId,
    pub author: String,
    pub checkin_time: DateTime<Utc>,
    /// Modification time of the workfile that was checked in.
    pub workfile_time: DateTime<Utc>,
    pub description: String,
    pub lock_owner: Option<String>,
    /// Whether the stored bytes are zlib-compressed.
    pub compressed: bool,
    /// Whether the stored bytes are an edit script against the revision
    /// named by [`delta_base`] rather than the content itself.
    pub delta: bool,
    /// Size of the content once expanded.
    pub content_size: u64,
    pub digest: ContentDigest,
    /// Where the stored bytes start in the archive file. Assigned by the codec.
    pub data_offset: u64,
    /// Number of stored bytes.
    pub data_size: u64,
}

impl RevisionHeader {
    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    pub fn is_locked_by(&self, user: &str) -> bool {
        self.lock_owner.as_deref() == Some(user)
    }
}

/// A revision header together with the bytes stored for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub header: RevisionHeader,
    pub(crate) data: Vec<u8>,
}

/// Fields describing a revision about to be stored.
pub struct NewRevision<'a> {
    pub id: RevisionId,
    pub author: &'a str,
    pub checkin_time: DateTime<Utc>,
    pub workfile_time: DateTime<Utc>,
    pub description: &'a str,
    pub lock_owner: Option<String>,
    pub content: &'a [u8],
    pub compress: bool,
}

impl Revision {
    pub fn new(new: NewRevision<'_>) -> Result<Self> {
        let (compressed, data) = codec::pack(new.content, new.compress)?;
        Ok(Revision {
            header: RevisionHeader {
                id: new.id,
                author: new.author.to_string(),
                checkin_time: new.checkin_time,
                workfile_time: new.workfile_time,
                description: new.description.to_string(),
                lock_owner: new.lock_owner,
                compressed,
                delta: false,
                content_size: new.content.len() as u64,
                digest: ContentDigest::of(new.content),
                data_offset: 0,
                data_size: data.len() as u64,
            },
            data,
        })
    }

    pub fn id(&self) -> &RevisionId {
        &self.header.id
    }

    /// The stored bytes, expanded: the content itself, or an edit script.
    fn stored(&self) -> Result<Vec<u8>> {
        Ok(codec::unpack(&self.data, self.header.compressed)
            .map_err(|msg| CorruptArchive::new(msg, self.header.data_offset))?)
    }

    fn verify(&self, content: &[u8]) -> Result<()> {
        if ContentDigest::of(content) != self.header.digest
            || content.len() as u64 != self.header.content_size
        {
            return Err(CorruptArchive::new(
                format!("content of revision {} does not match its digest", self.header.id),
                self.header.data_offset,
            )
            .into());
        }
        Ok(())
    }
}

/// The revision a delta-stored revision's script is applied to.
///
/// Trunk revisions are kept as reverse deltas against their successor, so
/// the trunk tip is always whole. Branch revisions are kept as forward
/// deltas against their predecessor, which for the first revision of a
/// branch is the branch origin.
pub fn delta_base(id: &RevisionId) -> Option<RevisionId> {
    if id.is_trunk() {
        Some(id.next_in_line())
    } else {
        id.previous_in_line().or_else(|| id.branch_origin())
    }
}

/// All revisions of one archive, ordered by [`RevisionId`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionStore {
    revisions: BTreeMap<RevisionId, Revision>,
}

impl RevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn contains(&self, id: &RevisionId) -> bool {
        self.revisions.contains_key(id)
    }

    pub fn get(&self, id: &RevisionId) -> Option<&Revision> {
        self.revisions.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &RevisionId) -> Option<&mut Revision> {
        self.revisions.get_mut(id)
    }

    /// Looks up a revision, telling an unreachable identifier (one whose
    /// branch origin is missing) apart from one that simply does not exist.
    pub fn require(&self, id: &RevisionId) -> Result<&Revision> {
        match self.revisions.get(id) {
            Some(revision) => Ok(revision),
            None => {
                if let Some(origin) = id.branch_origin() {
                    if !self.contains(&origin) {
                        return Err(Rejection::InvalidRevisionIdentifier {
                            text: id.to_string(),
                            reason: "branch origin does not exist",
                        }
                        .into());
                    }
                }
                not_found(Missing::Revision(id.clone()))
            }
        }
    }

    pub(crate) fn require_mut(&mut self, id: &RevisionId) -> Result<&mut Revision> {
        self.require(id)?;
        match self.revisions.get_mut(id) {
            Some(revision) => Ok(revision),
            None => not_found(Missing::Revision(id.clone())),
        }
    }

    /// Adds a revision. Its branch origin and its predecessor in line must
    /// already exist, and identifiers are never reused.
    pub(crate) fn insert(&mut self, revision: Revision) -> Result<()> {
        let id = revision.id().clone();
        if self.contains(&id) {
            return Err(Rejection::InvalidRevisionIdentifier {
                text: id.to_string(),
                reason: "revision already exists",
            }
            .into());
        }
        if !self.is_empty() || id != RevisionId::root() {
            let anchor = id.previous_in_line().or_else(|| id.branch_origin());
            if !anchor.map(|a| self.contains(&a)).unwrap_or(false) {
                return Err(Rejection::InvalidRevisionIdentifier {
                    text: id.to_string(),
                    reason: "revision is not reachable from an existing revision",
                }
                .into());
            }
        }
        log::trace!("adding revision {}", id);
        self.revisions.insert(id, revision);
        Ok(())
    }

    /// Inserts without reachability checks; used when decoding.
    pub(crate) fn insert_unchecked(&mut self, revision: Revision) {
        self.revisions.insert(revision.id().clone(), revision);
    }

    /// The full content of `id`, rebuilt through the chain of deltas it
    /// depends on. Every step is checked against its digest.
    pub fn content(&self, id: &RevisionId) -> Result<Vec<u8>> {
        let mut chain = Vec::new();
        let mut current = self.require(id)?;
        while current.header.delta {
            let base = delta_base(current.id())
                .and_then(|base| self.get(&base))
                .ok_or_else(|| {
                    CorruptArchive::new(
                        format!("delta base of revision {} is missing", current.id()),
                        current.header.data_offset,
                    )
                })?;
            chain.push(current);
            current = base;
        }
        let mut content = current.stored()?;
        current.verify(&content)?;
        for revision in chain.into_iter().rev() {
            content = delta::apply(&content, &revision.stored()?)
                .map_err(|msg| CorruptArchive::new(msg, revision.header.data_offset))?;
            revision.verify(&content)?;
        }
        Ok(content)
    }

    /// Stores `id` as an edit script against `base`, the content of its
    /// [`delta_base`], if the script takes less space than what is stored
    /// now. Content that is not text stays as it is.
    pub(crate) fn store_as_delta(&mut self, id: &RevisionId, base: &[u8], compress: bool) -> Result<()> {
        let content = self.content(id)?;
        let script = match delta::compute(base, &content)? {
            Some(script) => script,
            None => return Ok(()),
        };
        let (compressed, data) = codec::pack(&script, compress)?;
        let revision = self.require_mut(id)?;
        if data.len() < revision.data.len() {
            log::trace!(
                "storing revision {} as a {} byte delta instead of {} bytes",
                id,
                data.len(),
                revision.data.len()
            );
            revision.header.compressed = compressed;
            revision.header.delta = true;
            revision.header.data_size = data.len() as u64;
            revision.data = data;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Revision> {
        self.revisions.values_mut()
    }

    pub fn headers(&self) -> impl Iterator<Item = &RevisionHeader> {
        self.revisions.values().map(|r| &r.header)
    }

    pub fn ids(&self) -> impl Iterator<Item = &RevisionId> {
        self.revisions.keys()
    }

    /// Whether no later revision exists on `id`'s line.
    pub fn is_tip(&self, id: &RevisionId) -> bool {
        !self.contains(&id.next_in_line())
    }

    /// The newest revision on the line `id` lives on.
    pub fn tip_of_line(&self, id: &RevisionId) -> RevisionId {
        let mut tip = id.clone();
        while self.contains(&tip.next_in_line()) {
            tip = tip.next_in_line();
        }
        tip
    }

    /// One past the highest branch number rooted at `origin`.
    pub fn next_branch_number(&self, origin: &RevisionId) -> u32 {
        self.revisions
            .keys()
            .filter(|id| id.is_branched_from(origin))
            .filter_map(|id| id.branch_number())
            .max()
            .map(|n| n + 1)
            .unwrap_or(1)
    }

    pub fn lock_count(&self) -> usize {
        self.headers().filter(|h| h.is_locked()).count()
    }

    /// The revision `user` holds a lock on, if any.
    pub fn locked_by(&self, user: &str) -> Option<&RevisionId> {
        self.headers().find(|h| h.is_locked_by(user)).map(|h| &h.id)
    }

    /// `id` and every revision it descends from: earlier revisions on its
    /// line, then its branch origin and the revisions before that, down to
    /// `1.0`. Newest first.
    pub fn history(&self, id: &RevisionId) -> Vec<&RevisionHeader> {
        let mut history = Vec::new();
        let mut cursor = Some(id.clone());
        while let Some(current) = cursor {
            if let Some(revision) = self.get(&current) {
                history.push(&revision.header);
            }
            cursor = current
                .previous_in_line()
                .or_else(|| current.branch_origin());
        }
        history
    }
}

#[cfg(test)]
pub(crate) fn test_revision(id: &str, content: &[u8]) -> Revision {
    Revision::new(NewRevision {
        id: id.parse().unwrap(),
        author: "alice",
        checkin_time: DateTime::<Utc>::from_timestamp(1_000_000, 0).unwrap(),
        workfile_time: DateTime::<Utc>::from_timestamp(999_000, 0).unwrap(),
        description: "test",
        lock_owner: None,
        content,
        compress: true,
    })
    .unwrap()
}

#[cfg(test)]
fn test_store(ids: &[&str]) -> RevisionStore {
    let mut store = RevisionStore::new();
    for id in ids {
        store.insert(test_revision(id, id.as_bytes())).unwrap();
    }
    store
}

#[test]
fn test_insert_requires_reachable_ids() {
    let mut store = test_store(&["1.0", "1.1"]);
    let err = store.insert(test_revision("1.3", b"x")).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRevisionIdentifier);
    let err = store.insert(test_revision("1.5.1.1", b"x")).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRevisionIdentifier);
    let err = store.insert(test_revision("1.1", b"x")).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRevisionIdentifier);
    store.insert(test_revision("1.1.1.1", b"x")).unwrap();
    store.insert(test_revision("1.2", b"x")).unwrap();
    assert_eq!(store.len(), 4);
}

#[test]
fn test_require_distinguishes_unreachable() {
    let store = test_store(&["1.0", "1.0.1.1"]);
    assert!(store.require(&"1.0.1.1".parse().unwrap()).is_ok());
    let missing = store.require(&"1.0.1.2".parse().unwrap()).unwrap_err();
    assert_eq!(missing.kind(), crate::error::ErrorKind::NotFound);
    let unreachable = store.require(&"1.0.2.1.1.1".parse().unwrap()).unwrap_err();
    assert_eq!(
        unreachable.kind(),
        crate::error::ErrorKind::InvalidRevisionIdentifier
    );
}

#[test]
fn test_tips_and_branch_numbers() {
    let store = test_store(&["1.0", "1.1", "1.1.1.1", "1.1.1.2", "1.1.2.1", "1.2"]);
    let id = |s: &str| -> RevisionId { s.parse().unwrap() };
    assert!(!store.is_tip(&id("1.1")));
    assert!(store.is_tip(&id("1.2")));
    assert_eq!(store.tip_of_line(&id("1.0")), id("1.2"));
    assert_eq!(store.tip_of_line(&id("1.1.1.1")), id("1.1.1.2"));
    assert_eq!(store.next_branch_number(&id("1.1")), 3);
    assert_eq!(store.next_branch_number(&id("1.2")), 1);
    assert_eq!(store.next_branch_number(&id("1.1.1.2")), 1);
}

#[test]
fn test_history_follows_branch_origins() {
    let store = test_store(&["1.0", "1.1", "1.1.1.1", "1.1.1.2", "1.2"]);
    let history: Vec<String> = store
        .history(&"1.1.1.2".parse().unwrap())
        .iter()
        .map(|h| h.id.to_string())
        .collect();
    assert_eq!(history, vec!["1.1.1.2", "1.1.1.1", "1.1", "1.0"]);
}

#[test]
fn test_locks() {
    let mut store = test_store(&["1.0", "1.1"]);
    assert_eq!(store.lock_count(), 0);
    store
        .get_mut(&"1.1".parse().unwrap())
        .unwrap()
        .header
        .lock_owner = Some("bob".into());
    assert_eq!(store.lock_count(), 1);
    assert_eq!(store.locked_by("bob"), Some(&"1.1".parse().unwrap()));
    assert_eq!(store.locked_by("alice"), None);
}

#[test]
fn test_content_round_trip() {
    let text = b"some workfile text\n".repeat(50);
    let mut store = RevisionStore::new();
    store.insert(test_revision("1.0", &text)).unwrap();
    let root = RevisionId::root();
    assert_eq!(store.content(&root).unwrap(), text);
    let header = &store.get(&root).unwrap().header;
    assert!(header.compressed);
    assert!(!header.delta);
    assert!(header.data_size < header.content_size);
}

#[cfg(test)]
fn numbered_lines(lines: std::ops::Range<usize>) -> Vec<u8> {
    lines
        .map(|n| format!("line {}\n", n))
        .collect::<String>()
        .into_bytes()
}

#[test]
fn test_delta_chains() {
    let id = |s: &str| -> RevisionId { s.parse().unwrap() };
    let v0 = numbered_lines(0..300);
    let v1 = numbered_lines(1..300);
    let v2 = numbered_lines(1..301);
    let b1 = numbered_lines(0..150);
    let b2 = numbered_lines(0..151);

    let mut store = RevisionStore::new();
    store.insert(test_revision("1.0", &v0)).unwrap();
    store.insert(test_revision("1.1", &v1)).unwrap();
    store.store_as_delta(&id("1.0"), &v1, false).unwrap();
    store.insert(test_revision("1.2", &v2)).unwrap();
    store.store_as_delta(&id("1.1"), &v2, false).unwrap();
    store.insert(test_revision("1.1.1.1", &b1)).unwrap();
    store.store_as_delta(&id("1.1.1.1"), &v1, false).unwrap();
    store.insert(test_revision("1.1.1.2", &b2)).unwrap();
    store.store_as_delta(&id("1.1.1.2"), &b1, false).unwrap();

    for (rev, content) in [
        ("1.0", &v0),
        ("1.1", &v1),
        ("1.2", &v2),
        ("1.1.1.1", &b1),
        ("1.1.1.2", &b2),
    ] {
        assert_eq!(&store.content(&id(rev)).unwrap(), content, "{}", rev);
        let delta = store.get(&id(rev)).unwrap().header.delta;
        assert_eq!(delta, rev != "1.2", "{}", rev);
    }
    assert_eq!(delta_base(&id("1.0")), Some(id("1.1")));
    assert_eq!(delta_base(&id("1.1.1.1")), Some(id("1.1")));
    assert_eq!(delta_base(&id("1.1.1.2")), Some(id("1.1.1.1")));
}

#[test]
fn test_binary_content_stays_whole() {
    let mut store = RevisionStore::new();
    store.insert(test_revision("1.0", &[0xff; 64])).unwrap();
    store.insert(test_revision("1.1", &[0xfe; 64])).unwrap();
    store
        .store_as_delta(&RevisionId::root(), &[0xfe; 64], true)
        .unwrap();
    let root = store.get(&RevisionId::root()).unwrap();
    assert!(!root.header.delta);
    assert_eq!(store.content(&RevisionId::root()).unwrap(), vec![0xff; 64]);
}

#[test]
fn test_damaged_delta_is_corrupt() {
    let id = |s: &str| -> RevisionId { s.parse().unwrap() };
    let v0 = numbered_lines(0..100);
    let v1 = numbered_lines(0..101);
    let mut store = RevisionStore::new();
    store.insert(test_revision("1.0", &v0)).unwrap();
    store.insert(test_revision("1.1", &v1)).unwrap();
    store.store_as_delta(&id("1.0"), &v1, false).unwrap();

    // Whole content of the tip is intact but the script no longer applies.
    store.get_mut(&id("1.0")).unwrap().data[0] = 0x07;
    let err = store.content(&id("1.0")).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);
    assert_eq!(store.content(&id("1.1")).unwrap(), v1);
}
