use std::{
    collections::HashMap,
    fs::create_dir_all,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use crate::{
    archive::{ApplyLabel, CheckIn, CreateArchive, LabelRequest, LabelTarget, RevisionSelector},
    config::ServerConfig,
    engine::ArchiveEngine,
    error::{FieldAccess, Rejection, Result},
    header::ArchiveAttributes,
    registry::{file::JsonFileIdRegistry, FileIdRegistry},
    request::{OperationKind, Request, Response},
    revision_id::RevisionId,
    storage::ArchiveFile,
};

/// Serves requests against the archives below one root directory.
///
/// Requests for the same archive are serialized: mutations run one at a
/// time, reads may share. Requests for different archives do not wait on
/// each other. Every request re-reads its archive from disk.
pub struct ArchiveDirectory<R> {
    root: PathBuf,
    attributes: ArchiveAttributes,
    comment_prefix: String,
    registry: Mutex<R>,
    guards: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl ArchiveDirectory<JsonFileIdRegistry> {
    /// Opens the archive root named by `config`, creating it if needed.
    pub fn open(config: &ServerConfig) -> Result<Self> {
        if !config.archive_root.try_exists()? {
            log::info!("creating archive root {:?}", config.archive_root);
            create_dir_all(&config.archive_root)?;
        }
        let registry = JsonFileIdRegistry::open(config.registry_path())?;
        Ok(Self::new(config, registry))
    }
}

impl<R: FileIdRegistry> ArchiveDirectory<R> {
    pub fn new(config: &ServerConfig, registry: R) -> Self {
        ArchiveDirectory {
            root: config.archive_root.clone(),
            attributes: config.attributes,
            comment_prefix: config.comment_prefix.clone(),
            registry: Mutex::new(registry),
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a request's archive path, which must stay below the root.
    fn archive_file(&self, request: &Request) -> Result<ArchiveFile> {
        let relative = &request.archive;
        let plain = relative.components().count() > 0
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(Rejection::InvalidFieldAccess {
                operation: request.operation,
                field: "archive",
                access: FieldAccess::Invalid,
            }
            .into());
        }
        Ok(ArchiveFile::new(self.root.join(relative)))
    }

    fn guard(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        guards.entry(path.to_path_buf()).or_default().clone()
    }

    pub fn execute(&self, request: &Request) -> Result<Response> {
        request.validate()?;
        let file = self.archive_file(request)?;
        let guard = self.guard(file.path());
        log::debug!(
            "{} {} on {:?}",
            request.user,
            request.operation,
            request.archive
        );
        let path = file.path().to_path_buf();
        let result = if request.operation.is_mutation() {
            let _held = guard.write().unwrap_or_else(PoisonError::into_inner);
            self.run(file, request)
        } else {
            let _held = guard.read().unwrap_or_else(PoisonError::into_inner);
            self.run(file, request)
        };
        self.release(&path, guard);
        result
    }

    /// Drops the lock for `path` once no request is using it.
    fn release(&self, path: &Path, guard: Arc<RwLock<()>>) {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference is the map's, the other is `guard`.
        if Arc::strong_count(&guard) == 2 {
            guards.remove(path);
        }
    }

    fn create(&self, file: ArchiveFile, request: &Request) -> Result<Response> {
        let content = &required(request, "content", &request.content)?.0;
        let params = CreateArchive {
            author: request.user.clone(),
            module_description: request.description.clone().unwrap_or_default(),
            comment_prefix: request
                .comment_prefix
                .clone()
                .unwrap_or_else(|| self.comment_prefix.clone()),
            workfile_name: request
                .workfile_name
                .clone()
                .unwrap_or_else(|| workfile_name(&request.archive)),
            attributes: request.attributes.unwrap_or(self.attributes),
            checkin_time: request.checkin_time,
            workfile_time: request.workfile_time,
            keep_locked: request.keep_locked.unwrap_or(false),
        };
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let engine = ArchiveEngine::create(file, content, &params, &mut *registry)?;
        Ok(Response::Created {
            revision: RevisionId::root(),
            file_id: engine.archive().header().file_id,
        })
    }

    fn run(&self, file: ArchiveFile, request: &Request) -> Result<Response> {
        let user = request.user.as_str();
        let selector = request.revision.clone().unwrap_or_default();
        let open = || ArchiveEngine::open(file.clone());
        let response = match request.operation {
            OperationKind::CreateArchive => return self.create(file.clone(), request),
            OperationKind::CheckOut => {
                let mut content = Vec::new();
                let revision = open()?.check_out(&selector, user, &mut content)?;
                Response::Content { revision, content }
            }
            OperationKind::CheckIn => {
                let content = &required(request, "content", &request.content)?.0;
                let mut engine = open()?;
                let locked_revision = match &request.revision {
                    None | Some(RevisionSelector::Default) => None,
                    Some(selector) => Some(engine.archive().resolve(selector)?),
                };
                let params = CheckIn {
                    user: request.user.clone(),
                    locked_revision,
                    description: request.description.clone().unwrap_or_default(),
                    checkin_time: request.checkin_time,
                    workfile_time: request.workfile_time,
                    keep_locked: request.keep_locked.unwrap_or(false),
                    force_branch: request.force_branch.unwrap_or(false),
                    create_new_revision_if_equal: request
                        .create_new_revision_if_equal
                        .unwrap_or(false),
                    label: request.label.clone().map(|name| LabelRequest {
                        name,
                        floating: request.floating.unwrap_or(false),
                        reuse: request.reuse.unwrap_or(false),
                    }),
                };
                let outcome = engine.check_in(content, &params)?;
                Response::CheckedIn {
                    revision: outcome.revision,
                    created: outcome.created,
                }
            }
            OperationKind::Lock => Response::Revision {
                revision: open()?.lock(&selector, user)?,
            },
            OperationKind::Unlock => Response::Revision {
                revision: open()?.unlock(&selector, user)?,
            },
            OperationKind::Label => {
                let target = match &request.duplicate_of {
                    Some(name) => LabelTarget::DuplicateOf(name.clone()),
                    None => LabelTarget::Revision(selector),
                };
                let params = ApplyLabel {
                    user: request.user.clone(),
                    name: required(request, "label", &request.label)?.clone(),
                    target,
                    floating: request.floating.unwrap_or(false),
                    reuse: request.reuse.unwrap_or(false),
                };
                Response::Revision {
                    revision: open()?.apply_label(&params)?,
                }
            }
            OperationKind::Unlabel => Response::Unlabeled {
                label: open()?.remove_label(required(request, "label", &request.label)?)?,
            },
            OperationKind::SetObsolete => {
                open()?.set_obsolete(*required(request, "obsolete", &request.obsolete)?)?;
                Response::Done
            }
            OperationKind::SetModuleDescription => {
                open()?.set_module_description(required(
                    request,
                    "description",
                    &request.description,
                )?)?;
                Response::Done
            }
            OperationKind::SetRevisionDescription => Response::Revision {
                revision: open()?.set_revision_description(
                    &selector,
                    required(request, "description", &request.description)?,
                )?,
            },
            OperationKind::GetRevision => {
                let (revision, content) = open()?.get_revision(&selector)?;
                Response::Content { revision, content }
            }
            OperationKind::GetLogfileInfo => Response::Info(open()?.logfile_info()),
        };
        Ok(response)
    }
}

fn required<'a, T>(request: &Request, field: &'static str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| {
        Rejection::InvalidFieldAccess {
            operation: request.operation,
            field,
            access: FieldAccess::Required,
        }
        .into()
    })
}

/// `src/main.c,v` is the archive of `src/main.c`.
fn workfile_name(archive: &Path) -> String {
    let text = archive.to_string_lossy();
    text.strip_suffix(",v").unwrap_or(&text).to_string()
}

#[cfg(test)]
use crate::{error::ErrorKind, registry::in_memory::InMemoryFileIdRegistry, request::Payload};

#[cfg(test)]
fn test_directory(root: &Path) -> ArchiveDirectory<InMemoryFileIdRegistry> {
    let config = ServerConfig {
        archive_root: root.to_path_buf(),
        ..Default::default()
    };
    ArchiveDirectory::new(&config, InMemoryFileIdRegistry::new())
}

#[cfg(test)]
fn create_request(archive: &str, content: &[u8]) -> Request {
    let mut request = Request::new(OperationKind::CreateArchive, archive, "alice");
    request.content = Some(Payload(content.to_vec()));
    request
}

#[test]
fn test_request_flow() {
    let tempdir = tempfile::tempdir().unwrap();
    let directory = test_directory(tempdir.path());

    match directory.execute(&create_request("src/main.c,v", b"v0")).unwrap() {
        Response::Created { revision, file_id } => {
            assert_eq!(revision, RevisionId::root());
            assert_eq!(file_id, 1);
        }
        other => panic!("unexpected response {:?}", other),
    }

    let check_out = Request::new(OperationKind::CheckOut, "src/main.c,v", "alice");
    match directory.execute(&check_out).unwrap() {
        Response::Content { content, .. } => assert_eq!(content, b"v0"),
        other => panic!("unexpected response {:?}", other),
    }

    let mut check_in = Request::new(OperationKind::CheckIn, "src/main.c,v", "alice");
    check_in.content = Some(Payload(b"v1".to_vec()));
    check_in.description = Some("first change".into());
    check_in.label = Some("REL1".into());
    match directory.execute(&check_in).unwrap() {
        Response::CheckedIn { revision, created } => {
            assert_eq!(revision.to_string(), "1.1");
            assert!(created);
        }
        other => panic!("unexpected response {:?}", other),
    }

    let mut get = Request::new(OperationKind::GetRevision, "src/main.c,v", "bob");
    get.revision = Some(RevisionSelector::Label("REL1".into()));
    match directory.execute(&get).unwrap() {
        Response::Content { revision, content } => {
            assert_eq!(revision.to_string(), "1.1");
            assert_eq!(content, b"v1");
        }
        other => panic!("unexpected response {:?}", other),
    }

    let info = Request::new(OperationKind::GetLogfileInfo, "src/main.c,v", "bob");
    match directory.execute(&info).unwrap() {
        Response::Info(info) => {
            assert_eq!(info.header.workfile_name, "src/main.c");
            assert_eq!(info.header.module_description, "main.c");
            assert_eq!(info.revisions.len(), 2);
        }
        other => panic!("unexpected response {:?}", other),
    }

    let err = directory
        .execute(&create_request("src/main.c,v", b"again"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveExists);
}

#[test]
fn test_rejects_bad_requests() {
    let tempdir = tempfile::tempdir().unwrap();
    let directory = test_directory(tempdir.path());

    let err = directory
        .execute(&create_request("../outside,v", b"x"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFieldAccess);
    let err = directory
        .execute(&create_request("/etc/passwd", b"x"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFieldAccess);

    let mut request = Request::new(OperationKind::SetObsolete, "a,v", "alice");
    request.obsolete = Some(true);
    request.revision = Some(RevisionSelector::Default);
    let err = directory.execute(&request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFieldAccess);

    let err = directory
        .execute(&Request::new(OperationKind::GetLogfileInfo, "missing,v", "alice"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(directory.guards.lock().unwrap().is_empty());
}

#[test]
fn test_concurrent_check_ins_are_serialized() {
    let tempdir = tempfile::tempdir().unwrap();
    let directory = Arc::new(test_directory(tempdir.path()));
    let mut create = create_request("shared,v", b"start");
    create.attributes = Some(ArchiveAttributes {
        check_lock: false,
        ..Default::default()
    });
    directory.execute(&create).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let directory = Arc::clone(&directory);
            std::thread::spawn(move || {
                let mut request =
                    Request::new(OperationKind::CheckIn, "shared,v", format!("user{}", n));
                request.content = Some(Payload(format!("change {}", n).into_bytes()));
                match directory.execute(&request).unwrap() {
                    Response::CheckedIn { revision, .. } => revision,
                    other => panic!("unexpected response {:?}", other),
                }
            })
        })
        .collect();
    let mut revisions: Vec<RevisionId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    revisions.sort();
    let expected: Vec<RevisionId> = (1..=8)
        .map(|n| RevisionId::new(vec![1, n]).unwrap())
        .collect();
    assert_eq!(revisions, expected);

    let info = Request::new(OperationKind::GetLogfileInfo, "shared,v", "alice");
    match directory.execute(&info).unwrap() {
        Response::Info(info) => assert_eq!(info.revisions.len(), 9),
        other => panic!("unexpected response {:?}", other),
    }
    // Nobody is waiting on the archive any more, so its lock is gone.
    assert!(directory.guards.lock().unwrap().is_empty());
}
