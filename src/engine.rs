use std::io::Write;

use crate::{
    archive::{
        ApplyLabel, Archive, CheckIn, CheckInOutcome, CreateArchive, LogfileInfo, RevisionSelector,
    },
    error::{Rejection, Result},
    label::Label,
    registry::FileIdRegistry,
    revision_id::RevisionId,
    storage::ArchiveFile,
};

/// One open archive: the in-memory model together with the file it lives in.
///
/// Every mutation runs against a copy of the model. The copy is written to
/// disk and only then replaces the live model, so a failed operation leaves
/// both the file and the model as they were.
#[derive(Debug)]
pub struct ArchiveEngine {
    file: ArchiveFile,
    archive: Archive,
}

impl ArchiveEngine {
    /// Creates a new archive file holding `content` as revision `1.0`.
    pub fn create<R: FileIdRegistry + ?Sized>(
        file: ArchiveFile,
        content: &[u8],
        params: &CreateArchive,
        registry: &mut R,
    ) -> Result<Self> {
        let result = (|| -> Result<Archive> {
            // No file id is taken for an archive that already exists.
            if file.exists()? {
                return Err(Rejection::ArchiveExists(file.path().display().to_string()).into());
            }
            let file_id = registry.next_file_id()?;
            let mut archive = Archive::create(content, params, file_id)?;
            file.create(&mut archive)?;
            log::info!(
                "created archive {:?} (file id {}) for {}",
                file.path(),
                file_id,
                params.author
            );
            Ok(archive)
        })();
        let archive = report("create", result)?;
        Ok(ArchiveEngine { file, archive })
    }

    pub fn open(file: ArchiveFile) -> Result<Self> {
        let archive = report("open", file.read())?;
        Ok(ArchiveEngine { file, archive })
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn file(&self) -> &ArchiveFile {
        &self.file
    }

    /// Runs `op` on a copy of the archive, persists the copy and swaps it in.
    fn transact<T>(
        &mut self,
        name: &str,
        op: impl FnOnce(&mut Archive) -> Result<T>,
    ) -> Result<T> {
        let mut staged = self.archive.clone();
        let result = op(&mut staged).and_then(|value| {
            self.file.write(&mut staged)?;
            Ok(value)
        });
        let value = report(name, result)?;
        self.archive = staged;
        Ok(value)
    }

    /// Locks the selected revision for `user` and writes its content to `out`.
    /// The lock is only kept if the content was written.
    pub fn check_out(
        &mut self,
        selector: &RevisionSelector,
        user: &str,
        out: &mut impl Write,
    ) -> Result<RevisionId> {
        let id = self.transact("check out", |archive| {
            let (id, content) = archive.check_out(selector, user)?;
            out.write_all(&content)?;
            Ok(id)
        })?;
        log::info!("{} checked out {} of {:?}", user, id, self.file.path());
        Ok(id)
    }

    pub fn check_in(&mut self, content: &[u8], params: &CheckIn) -> Result<CheckInOutcome> {
        self.transact("check in", |archive| archive.check_in(content, params))
    }

    pub fn lock(&mut self, selector: &RevisionSelector, user: &str) -> Result<RevisionId> {
        self.transact("lock", |archive| archive.lock(selector, user))
    }

    pub fn unlock(&mut self, selector: &RevisionSelector, user: &str) -> Result<RevisionId> {
        self.transact("unlock", |archive| archive.unlock(selector, user))
    }

    pub fn apply_label(&mut self, params: &ApplyLabel) -> Result<RevisionId> {
        self.transact("label", |archive| archive.apply_label(params))
    }

    pub fn remove_label(&mut self, name: &str) -> Result<Label> {
        self.transact("unlabel", |archive| archive.remove_label(name))
    }

    pub fn set_obsolete(&mut self, obsolete: bool) -> Result<()> {
        self.transact("set obsolete", |archive| {
            archive.set_obsolete(obsolete);
            Ok(())
        })
    }

    pub fn set_module_description(&mut self, description: &str) -> Result<()> {
        self.transact("set module description", |archive| {
            archive.set_module_description(description);
            Ok(())
        })
    }

    pub fn set_revision_description(
        &mut self,
        selector: &RevisionSelector,
        description: &str,
    ) -> Result<RevisionId> {
        self.transact("set revision description", |archive| {
            archive.set_revision_description(selector, description)
        })
    }

    /// The selected revision's content, without locking anything.
    pub fn get_revision(&self, selector: &RevisionSelector) -> Result<(RevisionId, Vec<u8>)> {
        let result = self
            .archive
            .resolve(selector)
            .and_then(|id| Ok((id.clone(), self.archive.content(&id)?)));
        report("get revision", result)
    }

    pub fn logfile_info(&self) -> LogfileInfo {
        self.archive.info()
    }
}

/// Logs a failed operation: rejections are routine, faults are not.
fn report<T>(operation: &str, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        if err.is_fatal() {
            log::error!("{} failed: {}", operation, err);
        } else {
            log::debug!("{} rejected: {}", operation, err);
        }
    }
    result
}

#[cfg(test)]
use crate::{
    archive::{LabelRequest, LabelTarget},
    error::ErrorKind,
    registry::in_memory::InMemoryFileIdRegistry,
};

#[cfg(test)]
fn rev(s: &str) -> RevisionId {
    s.parse().unwrap()
}

#[cfg(test)]
fn create_engine(dir: &std::path::Path) -> ArchiveEngine {
    let mut registry = InMemoryFileIdRegistry::new();
    ArchiveEngine::create(
        ArchiveFile::new(dir.join("main.c,v")),
        b"int main() { return 0; }\n",
        &CreateArchive {
            author: "alice".into(),
            workfile_name: "main.c".into(),
            ..Default::default()
        },
        &mut registry,
    )
    .unwrap()
}

#[cfg(test)]
fn check_in_params(user: &str, locked: Option<&str>) -> CheckIn {
    CheckIn {
        user: user.into(),
        locked_revision: locked.map(rev),
        description: "change".into(),
        create_new_revision_if_equal: true,
        ..Default::default()
    }
}

/// Checks the on-disk size invariant and that the file matches the model.
#[cfg(test)]
fn assert_on_disk(engine: &ArchiveEngine) {
    let len = std::fs::metadata(engine.file().path()).unwrap().len();
    let last = engine.archive().revisions().headers().last().unwrap();
    assert_eq!(last.data_offset + last.data_size, len);
    assert_eq!(&engine.file().read().unwrap(), engine.archive());
    let header = engine.archive().header();
    assert_eq!(
        header.lock_count as usize,
        engine.archive().revisions().lock_count()
    );
}

#[test]
fn test_create_archive() {
    let tempdir = tempfile::tempdir().unwrap();
    let engine = create_engine(tempdir.path());
    let archive = engine.archive();
    assert_eq!(archive.revisions().ids().collect::<Vec<_>>(), vec![&rev("1.0")]);
    assert_eq!(archive.header().lock_count, 0);
    assert_eq!(archive.header().default_revision, rev("1.0"));
    assert_eq!(archive.header().file_id, 1);
    assert_on_disk(&engine);

    let mut registry = InMemoryFileIdRegistry::starting_at(9);
    let err = ArchiveEngine::create(
        ArchiveFile::new(tempdir.path().join("main.c,v")),
        b"again",
        &CreateArchive::default(),
        &mut registry,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveExists);
    // A refused create does not use up a file id.
    assert_eq!(registry.peek().unwrap(), 9);
}

#[test]
fn test_check_out_then_check_in_on_trunk() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    let mut workfile = Vec::new();
    let id = engine
        .check_out(&RevisionSelector::Id(rev("1.0")), "alice", &mut workfile)
        .unwrap();
    assert_eq!(id, rev("1.0"));
    assert_eq!(workfile, b"int main() { return 0; }\n");
    assert_eq!(engine.archive().header().lock_count, 1);
    assert_on_disk(&engine);

    let outcome = engine
        .check_in(&workfile, &check_in_params("alice", Some("1.0")))
        .unwrap();
    assert_eq!(outcome.revision, rev("1.1"));
    assert!(outcome.created);
    let archive = engine.archive();
    assert!(!archive.revisions().get(&rev("1.0")).unwrap().header.is_locked());
    assert_eq!(archive.header().default_revision, rev("1.1"));
    assert_eq!(archive.header().lock_count, 0);
    assert_on_disk(&engine);

    let reopened = ArchiveEngine::open(engine.file().clone()).unwrap();
    assert_eq!(reopened.archive(), engine.archive());
}

#[test]
fn test_branch_numbering() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    let mut sink = Vec::new();

    engine.lock(&RevisionSelector::Default, "bob").unwrap();
    let mut params = check_in_params("bob", Some("1.0"));
    params.force_branch = true;
    assert_eq!(engine.check_in(b"b1", &params).unwrap().revision, rev("1.0.1.1"));

    engine
        .check_out(&RevisionSelector::Id(rev("1.0.1.1")), "bob", &mut sink)
        .unwrap();
    let mut params = check_in_params("bob", Some("1.0.1.1"));
    params.force_branch = true;
    assert_eq!(
        engine.check_in(b"b2", &params).unwrap().revision,
        rev("1.0.1.1.1.1")
    );

    engine
        .check_out(&RevisionSelector::Id(rev("1.0.1.1")), "bob", &mut sink)
        .unwrap();
    assert_eq!(
        engine
            .check_in(b"b3", &check_in_params("bob", Some("1.0.1.1")))
            .unwrap()
            .revision,
        rev("1.0.1.2")
    );
    let (_, untouched) = engine
        .get_revision(&RevisionSelector::Id(rev("1.0.1.1.1.1")))
        .unwrap();
    assert_eq!(untouched, b"b2");
    assert_on_disk(&engine);
}

#[test]
fn test_new_ids_are_greater_and_never_reused() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    let plan = [
        ("1.0", false),
        ("1.1", false),
        ("1.1", false),
        ("1.1", true),
        ("1.1.1.1", false),
        ("1.0", false),
        ("1.2", true),
    ];
    let mut seen = vec![rev("1.0")];
    for (n, (locked, force_branch)) in plan.iter().enumerate() {
        engine
            .lock(&RevisionSelector::Id(rev(locked)), "carol")
            .unwrap();
        let mut params = check_in_params("carol", Some(locked));
        params.force_branch = *force_branch;
        let new = engine
            .check_in(format!("content {}", n).as_bytes(), &params)
            .unwrap()
            .revision;
        assert!(new > rev(locked), "{} is not after {}", new, locked);
        assert!(!seen.contains(&new), "{} was reused", new);
        seen.push(new);
    }
    assert_eq!(engine.archive().revisions().len(), seen.len());
    assert_on_disk(&engine);
}

#[test]
fn test_unchanged_check_in_keeps_revision_count() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    let mut workfile = Vec::new();
    engine
        .check_out(&RevisionSelector::Default, "alice", &mut workfile)
        .unwrap();
    let mut params = check_in_params("alice", None);
    params.create_new_revision_if_equal = false;
    params.label = Some(LabelRequest {
        name: "SAME".into(),
        floating: false,
        reuse: false,
    });
    let outcome = engine.check_in(&workfile, &params).unwrap();
    assert_eq!(outcome.revision, rev("1.0"));
    assert!(!outcome.created);
    assert_eq!(engine.archive().revisions().len(), 1);
    assert_eq!(engine.archive().header().lock_count, 0);
    assert_eq!(engine.archive().labels().get("SAME").unwrap().target, rev("1.0"));
    assert_on_disk(&engine);
}

#[test]
fn test_relock_by_same_user_is_idempotent() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    let mut sink = Vec::new();
    engine
        .check_out(&RevisionSelector::Default, "alice", &mut sink)
        .unwrap();
    engine
        .check_out(&RevisionSelector::Default, "alice", &mut sink)
        .unwrap();
    assert_eq!(engine.archive().header().lock_count, 1);

    let err = engine
        .check_out(&RevisionSelector::Default, "bob", &mut sink)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyLocked);
    assert!(!err.is_fatal());
    assert_on_disk(&engine);
}

#[test]
fn test_failed_operations_change_nothing() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    engine.lock(&RevisionSelector::Default, "alice").unwrap();
    let before_model = engine.archive().clone();
    let before_file = std::fs::read(engine.file().path()).unwrap();

    let err = engine
        .check_in(b"x", &check_in_params("bob", Some("1.0")))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotLockedByUser);
    let err = engine
        .unlock(&RevisionSelector::Id(rev("1.0")), "bob")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotLockedByUser);
    let err = engine.remove_label("nope").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine
        .set_revision_description(&RevisionSelector::Id(rev("1.7")), "gone")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(engine.archive(), &before_model);
    assert_eq!(std::fs::read(engine.file().path()).unwrap(), before_file);
}

#[test]
fn test_failed_write_leaves_model_alone() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    let before = engine.archive().clone();
    // Point the engine at a directory that no longer exists.
    engine.file = ArchiveFile::new(tempdir.path().join("gone").join("main.c,v"));
    let err = engine.set_obsolete(true).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(engine.archive(), &before);
}

/// A destination that refuses every write.
#[cfg(test)]
struct FullDisk;

#[cfg(test)]
impl Write for FullDisk {
    fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_check_out_keeps_no_lock_when_output_fails() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    let before_file = std::fs::read(engine.file().path()).unwrap();

    let err = engine
        .check_out(&RevisionSelector::Default, "alice", &mut FullDisk)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(engine.archive().header().lock_count, 0);
    assert_eq!(engine.archive().revisions().locked_by("alice"), None);
    assert_eq!(std::fs::read(engine.file().path()).unwrap(), before_file);
    assert_eq!(engine.file().read().unwrap().header().lock_count, 0);

    let mut out = Vec::new();
    engine
        .check_out(&RevisionSelector::Default, "alice", &mut out)
        .unwrap();
    assert_eq!(out, b"int main() { return 0; }\n");
    assert_eq!(engine.archive().header().lock_count, 1);
    assert_on_disk(&engine);
}

#[test]
fn test_labels_follow_fixed_and_floating_rules() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    let mut sink = Vec::new();
    let mut commit = |engine: &mut ArchiveEngine, content: &[u8]| {
        engine
            .check_out(&RevisionSelector::Default, "alice", &mut sink)
            .unwrap();
        engine
            .check_in(content, &check_in_params("alice", None))
            .unwrap()
            .revision
    };
    assert_eq!(commit(&mut engine, b"one"), rev("1.1"));

    let label = |name: &str, target: LabelTarget, floating: bool, reuse: bool| ApplyLabel {
        user: "alice".into(),
        name: name.into(),
        target,
        floating,
        reuse,
    };
    let on = |id: &str| LabelTarget::Revision(RevisionSelector::Id(rev(id)));
    let resolve = |engine: &ArchiveEngine, name: &str| {
        engine
            .archive()
            .resolve(&RevisionSelector::Label(name.into()))
            .unwrap()
    };

    engine.apply_label(&label("REL1", on("1.1"), false, false)).unwrap();
    assert_eq!(commit(&mut engine, b"two"), rev("1.2"));
    assert_eq!(resolve(&engine, "REL1"), rev("1.1"));

    engine
        .apply_label(&label(
            "HEAD",
            LabelTarget::Revision(RevisionSelector::Default),
            true,
            false,
        ))
        .unwrap();
    assert_eq!(commit(&mut engine, b"three"), rev("1.3"));
    assert_eq!(resolve(&engine, "HEAD"), rev("1.3"));

    let before = engine.archive().clone();
    let err = engine
        .apply_label(&label("REL1", on("1.3"), false, false))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LabelAlreadyExists);
    assert_eq!(engine.archive(), &before);

    engine.apply_label(&label("REL1", on("1.3"), false, true)).unwrap();
    assert_eq!(resolve(&engine, "REL1"), rev("1.3"));

    let names: Vec<&str> = engine.archive().labels().iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["HEAD", "REL1"]);
    assert_on_disk(&engine);
}

#[test]
fn test_get_revision_and_info() {
    let tempdir = tempfile::tempdir().unwrap();
    let mut engine = create_engine(tempdir.path());
    engine.set_module_description("entry point").unwrap();
    engine
        .set_revision_description(&RevisionSelector::Default, "first")
        .unwrap();
    engine.set_obsolete(true).unwrap();

    let (id, content) = engine.get_revision(&RevisionSelector::Default).unwrap();
    assert_eq!(id, rev("1.0"));
    assert_eq!(content, b"int main() { return 0; }\n");
    assert_eq!(engine.archive().header().lock_count, 0);

    let info = engine.logfile_info();
    assert_eq!(info.header.module_description, "entry point");
    assert!(info.header.obsolete);
    assert_eq!(info.revisions[0].header.description, "first");

    let reopened = ArchiveEngine::open(engine.file().clone()).unwrap();
    assert_eq!(reopened.archive(), engine.archive());
    assert_on_disk(&engine);
}
