use std::{
    fs::{create_dir_all, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    archive::Archive,
    codec,
    error::{not_found, CorruptArchive, Error, Missing, Rejection, Result},
};

/// The file an archive lives in.
///
/// Writes go to a temporary file next to the archive which then replaces
/// it, so the file on disk is always either the old or the new archive.
#[derive(Debug, Clone)]
pub struct ArchiveFile {
    path: PathBuf,
}

impl ArchiveFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ArchiveFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(self.path.try_exists()?)
    }

    pub fn read(&self) -> Result<Archive> {
        log::info!("reading archive {:?}", self.path);
        let mut bytes = Vec::new();
        match File::options().read(true).open(&self.path) {
            Ok(mut f) => {
                f.read_to_end(&mut bytes)?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return not_found(Missing::Archive(self.path.display().to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        codec::decode(&bytes)
    }

    /// Writes a brand new archive, refusing to replace an existing one.
    pub fn create(&self, archive: &mut Archive) -> Result<()> {
        if self.exists()? {
            return Err(self.exists_rejection());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.try_exists()? {
                log::info!("creating archive directory {:?}", parent);
                create_dir_all(parent)?;
            }
        }
        let tmp = self.stage(archive)?;
        match tmp.persist_noclobber(&self.path) {
            Ok(_) => Ok(()),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Err(self.exists_rejection()),
            Err(err) => Err(err.error.into()),
        }
    }

    /// Replaces the archive on disk with `archive`.
    pub fn write(&self, archive: &mut Archive) -> Result<()> {
        let tmp = self.stage(archive)?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Encodes `archive` into a temporary file next to the archive and
    /// checks that the file ends where the last revision's data does.
    fn stage(&self, archive: &mut Archive) -> Result<NamedTempFile> {
        let bytes = codec::encode(archive)?;
        let mut tmp = NamedTempFile::new_in(parent_dir(&self.path))?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        check_length(archive, tmp.as_file().metadata()?.len())?;
        log::info!("wrote {} bytes for {:?}", bytes.len(), self.path);
        Ok(tmp)
    }

    fn exists_rejection(&self) -> Error {
        Rejection::ArchiveExists(self.path.display().to_string()).into()
    }
}

fn check_length(archive: &Archive, written: u64) -> Result<()> {
    let end = codec::layout_end(archive);
    if written != end {
        return Err(CorruptArchive::new(
            format!("archive file is {} bytes but its revisions end at {}", written, end),
            written.min(end),
        )
        .into());
    }
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

pub(crate) fn read_json<A: for<'de> Deserialize<'de>>(path: &Path) -> Result<A> {
    Ok(serde_json::from_reader(
        File::options().read(true).open(path)?,
    )?)
}

/// Replaces `path` with `thing` as JSON, through a temporary file so a
/// crash never leaves half a file behind.
pub(crate) fn write_json<A: Serialize>(thing: &A, path: &Path) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(parent_dir(path))?;
    serde_json::to_writer_pretty(&mut tmp, thing)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
fn sample() -> Archive {
    Archive::create(
        b"contents\n",
        &crate::archive::CreateArchive {
            author: "alice".into(),
            workfile_name: "a.txt".into(),
            ..Default::default()
        },
        1,
    )
    .unwrap()
}

#[test]
fn test_write_then_read() {
    let tempdir = tempfile::tempdir().unwrap();
    let file = ArchiveFile::new(tempdir.path().join("nested").join("a.txt,v"));
    assert!(!file.exists().unwrap());
    let mut archive = sample();
    file.create(&mut archive).unwrap();
    assert!(file.exists().unwrap());
    assert_eq!(file.read().unwrap(), archive);

    let err = file.create(&mut sample()).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::ArchiveExists);
}

#[test]
fn test_missing_and_corrupt_files() {
    let tempdir = tempfile::tempdir().unwrap();
    let file = ArchiveFile::new(tempdir.path().join("missing,v"));
    assert_eq!(file.read().unwrap_err().kind(), crate::error::ErrorKind::NotFound);

    std::fs::write(file.path(), b"garbage").unwrap();
    assert_eq!(
        file.read().unwrap_err().kind(),
        crate::error::ErrorKind::CorruptArchive
    );
}

#[test]
fn test_write_leaves_no_temporary_files() {
    let tempdir = tempfile::tempdir().unwrap();
    let file = ArchiveFile::new(tempdir.path().join("a.txt,v"));
    let mut archive = sample();
    file.create(&mut archive).unwrap();
    archive.set_obsolete(true);
    file.write(&mut archive).unwrap();
    assert!(file.read().unwrap().header().obsolete);
    let entries = std::fs::read_dir(tempdir.path()).unwrap().count();
    assert_eq!(entries, 1);
}

#[test]
fn test_length_must_match_layout() {
    let tempdir = tempfile::tempdir().unwrap();
    let file = ArchiveFile::new(tempdir.path().join("a.txt,v"));
    let mut archive = sample();
    file.create(&mut archive).unwrap();
    let on_disk = std::fs::metadata(file.path()).unwrap().len();
    assert_eq!(on_disk, codec::layout_end(&archive));

    check_length(&archive, on_disk).unwrap();
    let err = check_length(&archive, on_disk + 1).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);
    let err = check_length(&archive, on_disk - 1).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);
}

#[test]
fn test_create_never_replaces() {
    let tempdir = tempfile::tempdir().unwrap();
    let file = ArchiveFile::new(tempdir.path().join("a.txt,v"));
    std::fs::write(file.path(), b"somebody else's archive").unwrap();
    // Staged and persisted without the existence check, as a racing
    // creator would.
    let tmp = file.stage(&mut sample()).unwrap();
    assert!(tmp.persist_noclobber(file.path()).is_err());
    let err = file.create(&mut sample()).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::ArchiveExists);
    assert_eq!(std::fs::read(file.path()).unwrap(), b"somebody else's archive");
}

#[test]
fn test_write_json_replaces_whole_file() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("state.json");
    write_json(&vec!["a long first value"; 20], &path).unwrap();
    write_json(&vec!["short"], &path).unwrap();
    let back: Vec<String> = read_json(&path).unwrap();
    assert_eq!(back, vec!["short".to_string()]);
    assert_eq!(std::fs::read_dir(tempdir.path()).unwrap().count(), 1);
}
