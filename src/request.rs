use std::path::PathBuf;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    archive::{LogfileInfo, RevisionSelector},
    error::{FieldAccess, Rejection, Result},
    header::ArchiveAttributes,
    label::Label,
    revision_id::RevisionId,
};

/// The operations a client can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    #[display(fmt = "CREATE_ARCHIVE")]
    CreateArchive,
    #[display(fmt = "CHECK_OUT")]
    CheckOut,
    #[display(fmt = "CHECK_IN")]
    CheckIn,
    #[display(fmt = "LOCK")]
    Lock,
    #[display(fmt = "UNLOCK")]
    Unlock,
    #[display(fmt = "LABEL")]
    Label,
    #[display(fmt = "UNLABEL")]
    Unlabel,
    #[display(fmt = "SET_OBSOLETE")]
    SetObsolete,
    #[display(fmt = "SET_MODULE_DESCRIPTION")]
    SetModuleDescription,
    #[display(fmt = "SET_REVISION_DESCRIPTION")]
    SetRevisionDescription,
    #[display(fmt = "GET_REVISION")]
    GetRevision,
    #[display(fmt = "GET_LOGFILE_INFO")]
    GetLogfileInfo,
}

impl OperationKind {
    /// Whether the operation can change the archive.
    pub fn is_mutation(self) -> bool {
        !matches!(self, OperationKind::GetRevision | OperationKind::GetLogfileInfo)
    }

    /// Fields the operation cannot do without, and fields it may use.
    fn fields(self) -> (&'static [&'static str], &'static [&'static str]) {
        use OperationKind::*;
        match self {
            CreateArchive => (
                &["content"],
                &[
                    "description",
                    "checkin_time",
                    "workfile_time",
                    "comment_prefix",
                    "workfile_name",
                    "attributes",
                    "keep_locked",
                ],
            ),
            CheckOut | Lock | Unlock | GetRevision => (&[], &["revision"]),
            CheckIn => (
                &["content"],
                &[
                    "revision",
                    "description",
                    "checkin_time",
                    "workfile_time",
                    "keep_locked",
                    "force_branch",
                    "create_new_revision_if_equal",
                    "label",
                    "floating",
                    "reuse",
                ],
            ),
            Label => (&["label"], &["revision", "duplicate_of", "floating", "reuse"]),
            Unlabel => (&["label"], &[]),
            SetObsolete => (&["obsolete"], &[]),
            SetModuleDescription => (&["description"], &[]),
            SetRevisionDescription => (&["description"], &["revision"]),
            GetLogfileInfo => (&[], &[]),
        }
    }
}

/// Revision content, carried as hex text in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(#[serde(with = "crate::hex::bytes")] pub Vec<u8>);

/// One client request against one archive.
///
/// Which of the optional fields make sense depends on the operation; see
/// [`Request::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub operation: OperationKind,
    /// Archive path, relative to the server's archive root.
    pub archive: PathBuf,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<RevisionSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floating: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reuse: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_branch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_new_revision_if_equal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obsolete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workfile_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workfile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<ArchiveAttributes>,
}

impl Request {
    /// A request with every optional field unset.
    pub fn new(operation: OperationKind, archive: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Request {
            operation,
            archive: archive.into(),
            user: user.into(),
            revision: None,
            content: None,
            description: None,
            label: None,
            duplicate_of: None,
            floating: None,
            reuse: None,
            keep_locked: None,
            force_branch: None,
            create_new_revision_if_equal: None,
            obsolete: None,
            checkin_time: None,
            workfile_time: None,
            comment_prefix: None,
            workfile_name: None,
            attributes: None,
        }
    }

    fn present_fields(&self) -> Vec<&'static str> {
        [
            ("revision", self.revision.is_some()),
            ("content", self.content.is_some()),
            ("description", self.description.is_some()),
            ("label", self.label.is_some()),
            ("duplicate_of", self.duplicate_of.is_some()),
            ("floating", self.floating.is_some()),
            ("reuse", self.reuse.is_some()),
            ("keep_locked", self.keep_locked.is_some()),
            ("force_branch", self.force_branch.is_some()),
            (
                "create_new_revision_if_equal",
                self.create_new_revision_if_equal.is_some(),
            ),
            ("obsolete", self.obsolete.is_some()),
            ("checkin_time", self.checkin_time.is_some()),
            ("workfile_time", self.workfile_time.is_some()),
            ("comment_prefix", self.comment_prefix.is_some()),
            ("workfile_name", self.workfile_name.is_some()),
            ("attributes", self.attributes.is_some()),
        ]
        .into_iter()
        .filter(|(_, present)| *present)
        .map(|(name, _)| name)
        .collect()
    }

    /// Rejects fields the operation does not use, and missing required ones.
    pub fn validate(&self) -> Result<()> {
        let (required, optional) = self.operation.fields();
        let present = self.present_fields();
        let invalid = |field: &'static str, access| -> Result<()> {
            Err(Rejection::InvalidFieldAccess {
                operation: self.operation,
                field,
                access,
            }
            .into())
        };
        for field in &present {
            if !required.contains(field) && !optional.contains(field) {
                return invalid(*field, FieldAccess::NotApplicable);
            }
        }
        for field in required {
            if !present.contains(field) {
                return invalid(*field, FieldAccess::Required);
            }
        }
        if self.operation == OperationKind::Label && self.revision.is_some() && self.duplicate_of.is_some() {
            return invalid("duplicate_of", FieldAccess::NotApplicable);
        }
        if self.operation == OperationKind::CheckIn
            && self.label.is_none()
            && (self.floating.is_some() || self.reuse.is_some())
        {
            let field = if self.floating.is_some() { "floating" } else { "reuse" };
            return invalid(field, FieldAccess::NotApplicable);
        }
        Ok(())
    }
}

/// What a successful request produces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Created {
        revision: RevisionId,
        file_id: u32,
    },
    CheckedIn {
        revision: RevisionId,
        created: bool,
    },
    /// The revision the operation acted on.
    Revision {
        revision: RevisionId,
    },
    Content {
        revision: RevisionId,
        #[serde(with = "crate::hex::bytes")]
        content: Vec<u8>,
    },
    Unlabeled {
        label: Label,
    },
    Info(LogfileInfo),
    Done,
}

#[test]
fn test_operation_names() {
    assert_eq!(OperationKind::CheckIn.to_string(), "CHECK_IN");
    assert_eq!(
        serde_json::to_string(&OperationKind::GetLogfileInfo).unwrap(),
        "\"GET_LOGFILE_INFO\""
    );
    let kind: OperationKind = serde_json::from_str("\"SET_REVISION_DESCRIPTION\"").unwrap();
    assert_eq!(kind, OperationKind::SetRevisionDescription);
    assert!(!OperationKind::GetRevision.is_mutation());
    assert!(OperationKind::Unlabel.is_mutation());
}

#[test]
fn test_request_json() {
    let json = r#"{
        "operation": "CHECK_IN",
        "archive": "src/main.c,v",
        "user": "alice",
        "revision": {"by": "id", "value": "1.2"},
        "content": "68690a",
        "description": "say hi",
        "label": "REL2",
        "floating": true
    }"#;
    let request: Request = serde_json::from_str(json).unwrap();
    assert_eq!(request.operation, OperationKind::CheckIn);
    assert_eq!(
        request.revision,
        Some(RevisionSelector::Id("1.2".parse().unwrap()))
    );
    assert_eq!(request.content, Some(Payload(b"hi\n".to_vec())));
    request.validate().unwrap();

    let back: Request = serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();
    assert_eq!(back, request);
}

#[test]
fn test_validate_field_access() {
    let kind = |request: &Request| request.validate().unwrap_err().rejection().cloned();

    let mut request = Request::new(OperationKind::SetObsolete, "a,v", "alice");
    assert_eq!(
        kind(&request),
        Some(Rejection::InvalidFieldAccess {
            operation: OperationKind::SetObsolete,
            field: "obsolete",
            access: FieldAccess::Required,
        })
    );
    request.obsolete = Some(true);
    request.validate().unwrap();
    request.revision = Some(RevisionSelector::Default);
    assert_eq!(
        kind(&request),
        Some(Rejection::InvalidFieldAccess {
            operation: OperationKind::SetObsolete,
            field: "revision",
            access: FieldAccess::NotApplicable,
        })
    );

    let mut request = Request::new(OperationKind::Label, "a,v", "alice");
    request.label = Some("REL1".into());
    request.revision = Some(RevisionSelector::Default);
    request.validate().unwrap();
    request.duplicate_of = Some("REL0".into());
    assert_eq!(
        request.validate().unwrap_err().kind(),
        crate::error::ErrorKind::InvalidFieldAccess
    );

    let mut request = Request::new(OperationKind::CheckIn, "a,v", "alice");
    request.content = Some(Payload(vec![1, 2, 3]));
    request.floating = Some(true);
    assert_eq!(
        request.validate().unwrap_err().kind(),
        crate::error::ErrorKind::InvalidFieldAccess
    );

    Request::new(OperationKind::GetLogfileInfo, "a,v", "alice")
        .validate()
        .unwrap();
}
