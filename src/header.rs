use serde::{Deserialize, Serialize};

use crate::revision_id::RevisionId;

/// Per-archive behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveAttributes {
    /// Check-in requires a lock held by the user checking in.
    pub check_lock: bool,
    /// Store revision data zlib-compressed when that makes it smaller.
    pub compress: bool,
    /// Keep revisions other than trunk tips as edit scripts against a
    /// neighbouring revision.
    pub compute_delta: bool,
    /// The workfile is not text; every revision is stored whole.
    pub binary: bool,
}

impl Default for ArchiveAttributes {
    fn default() -> Self {
        ArchiveAttributes {
            check_lock: true,
            compress: true,
            compute_delta: true,
            binary: false,
        }
    }
}

impl ArchiveAttributes {
    const CHECK_LOCK: u16 = 0x0001;
    const COMPRESS: u16 = 0x0002;
    const COMPUTE_DELTA: u16 = 0x0004;
    const BINARY: u16 = 0x0008;
    const KNOWN: u16 = Self::CHECK_LOCK | Self::COMPRESS | Self::COMPUTE_DELTA | Self::BINARY;

    /// Whether new revisions may be stored as edit scripts.
    pub fn stores_deltas(self) -> bool {
        self.compute_delta && !self.binary
    }

    pub fn to_bits(self) -> u16 {
        let mut bits = 0;
        if self.check_lock {
            bits |= Self::CHECK_LOCK;
        }
        if self.compress {
            bits |= Self::COMPRESS;
        }
        if self.compute_delta {
            bits |= Self::COMPUTE_DELTA;
        }
        if self.binary {
            bits |= Self::BINARY;
        }
        bits
    }

    /// `None` if unknown bits are set.
    pub fn from_bits(bits: u16) -> Option<Self> {
        if bits & !Self::KNOWN != 0 {
            return None;
        }
        Some(ArchiveAttributes {
            check_lock: bits & Self::CHECK_LOCK != 0,
            compress: bits & Self::COMPRESS != 0,
            compute_delta: bits & Self::COMPUTE_DELTA != 0,
            binary: bits & Self::BINARY != 0,
        })
    }
}

/// File-level metadata of an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveHeader {
    pub module_description: String,
    pub obsolete: bool,
    /// Number of revisions currently locked.
    pub lock_count: u32,
    /// The revision used when a request names no revision.
    pub default_revision: RevisionId,
    pub owner: String,
    pub comment_prefix: String,
    pub workfile_name: String,
    pub file_id: u32,
    pub attributes: ArchiveAttributes,
}

#[test]
fn test_attribute_bits() {
    for attributes in [
        ArchiveAttributes::default(),
        ArchiveAttributes {
            check_lock: false,
            ..Default::default()
        },
        ArchiveAttributes {
            compress: false,
            compute_delta: false,
            ..Default::default()
        },
        ArchiveAttributes {
            binary: true,
            ..Default::default()
        },
    ] {
        assert_eq!(
            ArchiveAttributes::from_bits(attributes.to_bits()),
            Some(attributes)
        );
    }
    assert_eq!(ArchiveAttributes::from_bits(0x8000), None);
    assert!(ArchiveAttributes::default().stores_deltas());
    assert!(!ArchiveAttributes {
        binary: true,
        ..Default::default()
    }
    .stores_deltas());
}
