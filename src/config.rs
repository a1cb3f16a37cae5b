use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{error::Result, header::ArchiveAttributes, storage::read_json};

/// Settings for serving a tree of archives. Every field has a default, so
/// a config file only needs to mention what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding the archives; request paths are relative to it.
    pub archive_root: PathBuf,
    /// Where file ids are handed out from. Relative paths are taken
    /// relative to `archive_root`.
    pub registry_file: PathBuf,
    /// Attributes for archives created without explicit ones.
    pub attributes: ArchiveAttributes,
    /// Comment prefix for archives created without one.
    pub comment_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            archive_root: PathBuf::from("archives"),
            registry_file: PathBuf::from("file_ids.json"),
            attributes: ArchiveAttributes::default(),
            comment_prefix: String::from("# "),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        log::info!("loading configuration from {:?}", path);
        read_json(path)
    }

    pub fn registry_path(&self) -> PathBuf {
        if self.registry_file.is_absolute() {
            self.registry_file.clone()
        } else {
            self.archive_root.join(&self.registry_file)
        }
    }
}

#[test]
fn test_partial_config_uses_defaults() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("server.json");
    std::fs::write(
        &path,
        r#"{ "archive_root": "/srv/archives", "attributes": { "compress": false } }"#,
    )
    .unwrap();
    let config = ServerConfig::load(&path).unwrap();
    assert_eq!(config.archive_root, PathBuf::from("/srv/archives"));
    assert!(!config.attributes.compress);
    assert!(config.attributes.check_lock);
    assert_eq!(config.comment_prefix, "# ");
    assert_eq!(
        config.registry_path(),
        PathBuf::from("/srv/archives/file_ids.json")
    );
}

#[test]
fn test_bad_config_is_a_json_fault() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("server.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = ServerConfig::load(&path).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::Json);
}
