use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    storage::{read_json, write_json},
};

use super::FileIdRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryState {
    next_file_id: u32,
}

/// A persistent [`FileIdRegistry`] kept as a small JSON file, written back
/// every time an id is handed out.
#[derive(Debug, Clone)]
pub struct JsonFileIdRegistry {
    path: PathBuf,
    state: RegistryState,
}

impl JsonFileIdRegistry {
    pub fn open(path: PathBuf) -> Result<Self> {
        let state = if path.try_exists()? {
            read_json(&path)?
        } else {
            log::info!("creating file id registry {:?}", path);
            let state = RegistryState { next_file_id: 1 };
            write_json(&state, &path)?;
            state
        };
        Ok(Self { path, state })
    }
}

impl FileIdRegistry for JsonFileIdRegistry {
    fn next_file_id(&mut self) -> Result<u32> {
        let id = self.state.next_file_id;
        let next = RegistryState {
            next_file_id: id + 1,
        };
        write_json(&next, &self.path)?;
        self.state = next;
        log::debug!("handed out file id {} from {:?}", id, self.path);
        Ok(id)
    }

    fn peek(&self) -> Result<u32> {
        Ok(self.state.next_file_id)
    }
}

#[test]
fn test_json_registry_survives_reopen() {
    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("file_ids.json");
    let mut registry = JsonFileIdRegistry::open(path.clone()).unwrap();
    assert_eq!(registry.next_file_id().unwrap(), 1);
    assert_eq!(registry.next_file_id().unwrap(), 2);
    drop(registry);

    let mut registry = JsonFileIdRegistry::open(path).unwrap();
    assert_eq!(registry.peek().unwrap(), 3);
    assert_eq!(registry.next_file_id().unwrap(), 3);
}
