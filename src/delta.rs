//! Edit scripts between the contents of neighbouring revisions.
//!
//! A script rebuilds a target from a base. It is a sequence of edits, with
//! big-endian integers:
//!
//! ```text
//! copy    0x01 start:u64 len:u64    a run of bytes from the base
//! insert  0x02 len:u64 bytes        bytes the base does not have
//! ```
//!
//! Scripts are computed line by line, so only text gets one.

use std::io::{Cursor, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use similar::{ChangeTag, TextDiff};

use crate::error::Result;

const COPY: u8 = 0x01;
const INSERT: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Edit {
    Copy { start: u64, len: u64 },
    Insert(Vec<u8>),
}

/// The script turning `base` into `target`, or `None` if either is not
/// UTF-8 text.
pub(crate) fn compute(base: &[u8], target: &[u8]) -> Result<Option<Vec<u8>>> {
    let (base, target) = match (std::str::from_utf8(base), std::str::from_utf8(target)) {
        (Ok(base), Ok(target)) => (base, target),
        _ => return Ok(None),
    };
    let diff = TextDiff::from_lines(base, target);
    let mut edits = Vec::new();
    let mut position = 0;
    for change in diff.iter_all_changes() {
        let line = change.value();
        let len = line.len() as u64;
        match change.tag() {
            ChangeTag::Equal => {
                push_copy(&mut edits, position, len);
                position += len;
            }
            ChangeTag::Delete => position += len,
            ChangeTag::Insert => push_insert(&mut edits, line.as_bytes()),
        }
    }
    Ok(Some(write_script(&edits)?))
}

fn push_copy(edits: &mut Vec<Edit>, start: u64, len: u64) {
    if let Some(Edit::Copy {
        start: run_start,
        len: run_len,
    }) = edits.last_mut()
    {
        if *run_start + *run_len == start {
            *run_len += len;
            return;
        }
    }
    edits.push(Edit::Copy { start, len });
}

fn push_insert(edits: &mut Vec<Edit>, bytes: &[u8]) {
    if let Some(Edit::Insert(run)) = edits.last_mut() {
        run.extend_from_slice(bytes);
        return;
    }
    edits.push(Edit::Insert(bytes.to_vec()));
}

fn write_script(edits: &[Edit]) -> Result<Vec<u8>> {
    let mut w = Vec::new();
    for edit in edits {
        match edit {
            Edit::Copy { start, len } => {
                w.write_u8(COPY)?;
                w.write_u64::<BigEndian>(*start)?;
                w.write_u64::<BigEndian>(*len)?;
            }
            Edit::Insert(bytes) => {
                w.write_u8(INSERT)?;
                w.write_u64::<BigEndian>(bytes.len() as u64)?;
                w.write_all(bytes)?;
            }
        }
    }
    Ok(w)
}

/// Runs `script` against `base`.
pub(crate) fn apply(base: &[u8], script: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut cursor = Cursor::new(script);
    let mut out = Vec::new();
    let truncated = |_| String::from("edit script is truncated");
    while (cursor.position() as usize) < script.len() {
        match cursor.read_u8().map_err(truncated)? {
            COPY => {
                let start = cursor.read_u64::<BigEndian>().map_err(truncated)?;
                let len = cursor.read_u64::<BigEndian>().map_err(truncated)?;
                let end = start
                    .checked_add(len)
                    .filter(|end| *end <= base.len() as u64)
                    .ok_or_else(|| {
                        format!(
                            "edit copies {} bytes at {} from a {} byte base",
                            len,
                            start,
                            base.len()
                        )
                    })?;
                out.extend_from_slice(&base[start as usize..end as usize]);
            }
            INSERT => {
                let len = cursor.read_u64::<BigEndian>().map_err(truncated)?;
                let from = cursor.position() as usize;
                let to = usize::try_from(len)
                    .ok()
                    .and_then(|len| from.checked_add(len))
                    .filter(|to| *to <= script.len())
                    .ok_or_else(|| String::from("edit script is truncated"))?;
                out.extend_from_slice(&script[from..to]);
                cursor.set_position(to as u64);
            }
            other => return Err(format!("unknown edit {:#04x}", other)),
        }
    }
    Ok(out)
}

#[cfg(test)]
fn numbered_lines(lines: std::ops::Range<usize>) -> String {
    lines.map(|n| format!("line {}\n", n)).collect()
}

#[test]
fn test_small_edit_gives_small_script() {
    let base = numbered_lines(0..200);
    let target = base.replace("line 57\n", "line fifty-seven\n") + "appended\n";
    let script = compute(base.as_bytes(), target.as_bytes()).unwrap().unwrap();
    assert!(script.len() < 100);
    assert_eq!(apply(base.as_bytes(), &script).unwrap(), target.as_bytes());

    // Reverse direction, as kept for older trunk revisions.
    let back = compute(target.as_bytes(), base.as_bytes()).unwrap().unwrap();
    assert_eq!(apply(target.as_bytes(), &back).unwrap(), base.as_bytes());
}

#[test]
fn test_edge_contents() {
    for (base, target) in [
        ("", "new\n"),
        ("old\n", ""),
        ("no newline", "no newline at all"),
        ("a\nb\nc\n", "c\nb\na\n"),
    ] {
        let script = compute(base.as_bytes(), target.as_bytes()).unwrap().unwrap();
        assert_eq!(apply(base.as_bytes(), &script).unwrap(), target.as_bytes());
    }
}

#[test]
fn test_binary_gets_no_script() {
    assert_eq!(compute(&[0xff, 0xfe, 0x00], b"text\n").unwrap(), None);
    assert_eq!(compute(b"text\n", &[0xc3, 0x28]).unwrap(), None);
}

#[test]
fn test_bad_scripts() {
    let base = b"0123456789";
    let mut script = vec![COPY];
    script.extend_from_slice(&8u64.to_be_bytes());
    script.extend_from_slice(&5u64.to_be_bytes());
    assert!(apply(base, &script).is_err());

    let mut script = vec![INSERT];
    script.extend_from_slice(&4u64.to_be_bytes());
    script.extend_from_slice(b"ab");
    assert!(apply(base, &script).is_err());

    assert!(apply(base, &[0x07]).is_err());
    assert!(apply(base, &[COPY, 0, 0]).is_err());
}
