//! The on-disk archive format.
//!
//! An archive file is a metadata block followed by the stored bytes of every
//! revision. All integers are big-endian; strings are a `u32` byte length
//! followed by UTF-8.
//!
//! ```text
//! "RVARCHV1" format-version:u16
//! header     description obsolete:u8 lock-count:u32 default-revision owner
//!            comment-prefix workfile-name file-id:u32 attributes:u16
//! labels     count:u32 { name target:revision floating:u8 creator }
//! revisions  count:u32 { id author checkin:i64 workfile:i64 description
//!                        locked:u8 [owner] compressed:u8 delta:u8
//!                        content-size:u64 digest:[32] data-offset:u64
//!                        data-size:u64 }
//! checksum   blake3 of everything above:[32]
//! payload    revision data, in revision order, back to back
//! ```
//!
//! Revision data is either the content itself or an edit script against a
//! neighbouring revision, optionally zlib-compressed.
//!
//! A revision identifier is a `u16` component count followed by that many
//! `u32`s. Every offset and size is fixed width, so the size of the metadata
//! does not depend on where the payload ends up.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::{
    archive::Archive,
    digest::{ContentDigest, DIGEST_BYTES},
    error::{CorruptArchive, Result},
    header::{ArchiveAttributes, ArchiveHeader},
    label::{Label, LabelTable},
    revision::{Revision, RevisionHeader, RevisionStore},
    revision_id::RevisionId,
};

pub const MAGIC: &[u8; 8] = b"RVARCHV1";
pub const FORMAT_VERSION: u16 = 1;

/// Prepares content for storage, compressing it if asked to and if that
/// actually saves space. Returns whether the stored form is compressed.
pub(crate) fn pack(content: &[u8], compress: bool) -> Result<(bool, Vec<u8>)> {
    if !compress || content.is_empty() {
        return Ok((false, content.to_vec()));
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    let packed = encoder.finish()?;
    if packed.len() < content.len() {
        Ok((true, packed))
    } else {
        Ok((false, content.to_vec()))
    }
}

pub(crate) fn unpack(data: &[u8], compressed: bool) -> std::result::Result<Vec<u8>, String> {
    if !compressed {
        return Ok(data.to_vec());
    }
    let mut content = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut content)
        .map_err(|e| format!("cannot inflate revision data: {}", e))?;
    Ok(content)
}

/// Where the data of the last revision ends, which is the length of the
/// encoded archive.
pub fn layout_end(archive: &Archive) -> u64 {
    archive
        .revisions
        .headers()
        .last()
        .map_or(0, |h| h.data_offset + h.data_size)
}

/// Serializes `archive`, first assigning every revision its data offset.
pub fn encode(archive: &mut Archive) -> Result<Vec<u8>> {
    let metadata_len = write_metadata(archive)?.len() as u64 + DIGEST_BYTES as u64;
    let mut offset = metadata_len;
    for revision in archive.revisions.iter_mut() {
        revision.header.data_offset = offset;
        revision.header.data_size = revision.data.len() as u64;
        offset += revision.header.data_size;
    }

    let mut out = write_metadata(archive)?;
    let checksum = blake3::hash(&out);
    out.extend_from_slice(checksum.as_bytes());
    debug_assert_eq!(out.len() as u64, metadata_len);
    for revision in archive.revisions.iter() {
        out.extend_from_slice(&revision.data);
    }
    debug_assert_eq!(out.len() as u64, offset);
    Ok(out)
}

fn write_metadata(archive: &Archive) -> Result<Vec<u8>> {
    let mut w = Vec::new();
    w.write_all(MAGIC)?;
    w.write_u16::<BigEndian>(FORMAT_VERSION)?;

    let header = &archive.header;
    write_str(&mut w, &header.module_description)?;
    w.write_u8(header.obsolete as u8)?;
    w.write_u32::<BigEndian>(header.lock_count)?;
    write_id(&mut w, &header.default_revision)?;
    write_str(&mut w, &header.owner)?;
    write_str(&mut w, &header.comment_prefix)?;
    write_str(&mut w, &header.workfile_name)?;
    w.write_u32::<BigEndian>(header.file_id)?;
    w.write_u16::<BigEndian>(header.attributes.to_bits())?;

    w.write_u32::<BigEndian>(archive.labels.len() as u32)?;
    for label in archive.labels.iter() {
        write_str(&mut w, &label.name)?;
        write_id(&mut w, &label.target)?;
        w.write_u8(label.floating as u8)?;
        write_str(&mut w, &label.creator)?;
    }

    w.write_u32::<BigEndian>(archive.revisions.len() as u32)?;
    for h in archive.revisions.headers() {
        write_id(&mut w, &h.id)?;
        write_str(&mut w, &h.author)?;
        w.write_i64::<BigEndian>(h.checkin_time.timestamp())?;
        w.write_i64::<BigEndian>(h.workfile_time.timestamp())?;
        write_str(&mut w, &h.description)?;
        match &h.lock_owner {
            Some(owner) => {
                w.write_u8(1)?;
                write_str(&mut w, owner)?;
            }
            None => w.write_u8(0)?,
        }
        w.write_u8(h.compressed as u8)?;
        w.write_u8(h.delta as u8)?;
        w.write_u64::<BigEndian>(h.content_size)?;
        w.write_all(h.digest.as_bytes())?;
        w.write_u64::<BigEndian>(h.data_offset)?;
        w.write_u64::<BigEndian>(h.data_size)?;
    }
    Ok(w)
}

fn write_str(w: &mut Vec<u8>, s: &str) -> Result<()> {
    w.write_u32::<BigEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn write_id(w: &mut Vec<u8>, id: &RevisionId) -> Result<()> {
    w.write_u16::<BigEndian>(id.components().len() as u16)?;
    for n in id.components() {
        w.write_u32::<BigEndian>(*n)?;
    }
    Ok(())
}

/// Parses an archive file, checking its checksum, its layout and the
/// consistency of what it describes. The stored revision data is kept as
/// is; it is only expanded and verified against its digest when read.
pub fn decode(bytes: &[u8]) -> Result<Archive> {
    let mut r = Reader {
        cursor: Cursor::new(bytes),
    };

    let magic = r.bytes(MAGIC.len())?;
    if magic != MAGIC {
        return Err(CorruptArchive::new("not an archive file", 0).into());
    }
    let version = r.u16()?;
    if version != FORMAT_VERSION {
        return Err(r.corrupt(format!("unsupported format version {}", version)).into());
    }

    let module_description = r.string()?;
    let obsolete = r.flag()?;
    let lock_count = r.u32()?;
    let default_revision = r.id()?;
    let owner = r.string()?;
    let comment_prefix = r.string()?;
    let workfile_name = r.string()?;
    let file_id = r.u32()?;
    let bits = r.u16()?;
    let attributes = ArchiveAttributes::from_bits(bits)
        .ok_or_else(|| r.corrupt(format!("unknown attribute bits {:#06x}", bits)))?;
    let header = ArchiveHeader {
        module_description,
        obsolete,
        lock_count,
        default_revision,
        owner,
        comment_prefix,
        workfile_name,
        file_id,
        attributes,
    };

    let mut labels = LabelTable::new();
    for _ in 0..r.u32()? {
        let label = Label {
            name: r.string()?,
            target: r.id()?,
            floating: r.flag()?,
            creator: r.string()?,
        };
        if labels.get(&label.name).is_some() {
            return Err(r.corrupt(format!("duplicate label {:?}", label.name)).into());
        }
        labels.insert_unchecked(label);
    }

    let count = r.u32()?;
    let mut headers = Vec::new();
    for _ in 0..count {
        let id = r.id()?;
        let author = r.string()?;
        let checkin_time = r.time()?;
        let workfile_time = r.time()?;
        let description = r.string()?;
        let lock_owner = if r.flag()? { Some(r.string()?) } else { None };
        let compressed = r.flag()?;
        let delta = r.flag()?;
        let content_size = r.u64()?;
        let digest = r.bytes(DIGEST_BYTES)?;
        let mut digest_bytes = [0; DIGEST_BYTES];
        digest_bytes.copy_from_slice(digest);
        headers.push(RevisionHeader {
            id,
            author,
            checkin_time,
            workfile_time,
            description,
            lock_owner,
            compressed,
            delta,
            content_size,
            digest: ContentDigest::from_bytes(digest_bytes),
            data_offset: r.u64()?,
            data_size: r.u64()?,
        });
    }

    let metadata_end = r.cursor.position() as usize;
    let stored_sum = r.bytes(DIGEST_BYTES)?;
    if blake3::hash(&bytes[..metadata_end]).as_bytes()[..] != stored_sum[..] {
        return Err(CorruptArchive::new("metadata checksum mismatch", metadata_end as u64).into());
    }

    let mut expected_offset = r.cursor.position();
    let mut revisions = RevisionStore::new();
    for h in headers {
        if h.data_offset != expected_offset {
            return Err(CorruptArchive::new(
                format!(
                    "data of revision {} starts at {}, expected {}",
                    h.id, h.data_offset, expected_offset
                ),
                h.data_offset,
            )
            .into());
        }
        let end = expected_offset
            .checked_add(h.data_size)
            .filter(|end| *end <= bytes.len() as u64)
            .ok_or_else(|| {
                CorruptArchive::new(format!("data of revision {} is truncated", h.id), expected_offset)
            })?;
        if revisions.contains(&h.id) {
            return Err(CorruptArchive::new(format!("duplicate revision {}", h.id), expected_offset).into());
        }
        let data = bytes[expected_offset as usize..end as usize].to_vec();
        expected_offset = end;
        revisions.insert_unchecked(Revision { header: h, data });
    }
    if expected_offset != bytes.len() as u64 {
        return Err(CorruptArchive::new(
            format!(
                "file is {} bytes long but its revisions end at {}",
                bytes.len(),
                expected_offset
            ),
            expected_offset,
        )
        .into());
    }

    let archive = Archive::from_parts(header, revisions, labels);
    archive
        .validate()
        .map_err(|msg| CorruptArchive::new(msg, 0))?;
    Ok(archive)
}

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn corrupt(&self, msg: impl Into<String>) -> CorruptArchive {
        CorruptArchive::new(msg, self.cursor.position())
    }

    fn eof(&self, what: &str) -> CorruptArchive {
        self.corrupt(format!("unexpected end of file reading {}", what))
    }

    fn u8(&mut self) -> std::result::Result<u8, CorruptArchive> {
        self.cursor.read_u8().map_err(|_| self.eof("a byte"))
    }

    fn u16(&mut self) -> std::result::Result<u16, CorruptArchive> {
        self.cursor
            .read_u16::<BigEndian>()
            .map_err(|_| self.eof("a u16"))
    }

    fn u32(&mut self) -> std::result::Result<u32, CorruptArchive> {
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| self.eof("a u32"))
    }

    fn u64(&mut self) -> std::result::Result<u64, CorruptArchive> {
        self.cursor
            .read_u64::<BigEndian>()
            .map_err(|_| self.eof("a u64"))
    }

    fn flag(&mut self) -> std::result::Result<bool, CorruptArchive> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.corrupt(format!("invalid flag byte {}", other))),
        }
    }

    fn time(&mut self) -> std::result::Result<DateTime<Utc>, CorruptArchive> {
        let secs = self
            .cursor
            .read_i64::<BigEndian>()
            .map_err(|_| self.eof("a timestamp"))?;
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| self.corrupt(format!("timestamp {} out of range", secs)))
    }

    fn bytes(&mut self, len: usize) -> std::result::Result<&'a [u8], CorruptArchive> {
        let start = self.cursor.position() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        let end = start
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| self.eof(&format!("{} bytes", len)))?;
        self.cursor.set_position(end as u64);
        Ok(&data[start..end])
    }

    fn string(&mut self) -> std::result::Result<String, CorruptArchive> {
        let len = self.u32()? as usize;
        let start = self.cursor.position();
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CorruptArchive::new("string is not valid UTF-8", start))
    }

    fn id(&mut self) -> std::result::Result<RevisionId, CorruptArchive> {
        let len = self.u16()?;
        let mut components = Vec::with_capacity(len as usize);
        for _ in 0..len {
            components.push(self.u32()?);
        }
        RevisionId::new(components).map_err(|_| self.corrupt("malformed revision identifier"))
    }
}

#[cfg(test)]
fn sample_archive() -> Archive {
    use crate::archive::{CreateArchive, RevisionSelector};

    let mut archive = Archive::create(
        b"line one\n".repeat(40).as_slice(),
        &CreateArchive {
            author: "alice".into(),
            workfile_name: "notes.txt".into(),
            comment_prefix: "# ".into(),
            ..Default::default()
        },
        3,
    )
    .unwrap();
    archive.lock(&RevisionSelector::Default, "alice").unwrap();
    archive
        .check_in(
            b"short",
            &crate::archive::CheckIn {
                user: "alice".into(),
                description: "shrink".into(),
                keep_locked: true,
                label: Some(crate::archive::LabelRequest {
                    name: "TIP".into(),
                    floating: true,
                    reuse: false,
                }),
                ..Default::default()
            },
        )
        .unwrap();
    archive
}

#[test]
fn test_encode_decode() {
    let mut archive = sample_archive();
    let bytes = encode(&mut archive).unwrap();
    let decoded = decode(&bytes).unwrap();
    assert_eq!(decoded, archive);
    assert_eq!(decoded.header().lock_count, 1);
    assert_eq!(decoded.labels().get("TIP").unwrap().target.to_string(), "1.1");
    for revision in decoded.revisions().iter() {
        decoded.content(revision.id()).unwrap();
    }
}

#[test]
fn test_file_size_matches_layout() {
    let mut archive = sample_archive();
    let bytes = encode(&mut archive).unwrap();
    let last = archive.revisions().headers().last().unwrap().clone();
    assert_eq!(last.data_offset + last.data_size, bytes.len() as u64);
    let first = archive.revisions().headers().next().unwrap();
    assert!(first.compressed);
    assert_eq!(first.data_offset + first.data_size, last.data_offset);
}

#[test]
fn test_detects_flipped_metadata() {
    let mut archive = sample_archive();
    let mut bytes = encode(&mut archive).unwrap();
    bytes[12] ^= 0x40;
    let err = decode(&bytes).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);
}

#[test]
fn test_detects_truncation_and_padding() {
    let mut archive = sample_archive();
    let bytes = encode(&mut archive).unwrap();

    let err = decode(&bytes[..bytes.len() - 1]).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);

    let mut padded = bytes.clone();
    padded.push(0);
    let err = decode(&padded).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);

    let err = decode(&bytes[..20]).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);

    let err = decode(b"not an archive").unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);
}

#[test]
fn test_damaged_payload_is_caught_on_read() {
    let mut archive = sample_archive();
    let mut bytes = encode(&mut archive).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    // The payload is not covered by the metadata checksum, only by the digests.
    let decoded = decode(&bytes).unwrap();
    let err = decoded.content(&"1.1".parse().unwrap()).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::CorruptArchive);
}

#[test]
fn test_pack_only_keeps_smaller_form() {
    let (compressed, data) = pack(b"abc", true).unwrap();
    assert!(!compressed);
    assert_eq!(data, b"abc");

    let text = b"aaaaaaaaaa".repeat(100);
    let (compressed, data) = pack(&text, true).unwrap();
    assert!(compressed);
    assert_eq!(unpack(&data, true).unwrap(), text);

    let (compressed, _) = pack(&text, false).unwrap();
    assert!(!compressed);
}
