//! Encoding of buffered modifications as change-buffer tree records.
//!
//! A record is a single byte string whose first three columns fix the sort
//! order: target space, a zero marker byte distinguishing the format era,
//! and the target page. A type-info column follows (six bytes per field,
//! prefixed with one zero byte iff the target page uses the compact record
//! format), then the entry fields themselves. The compact-format heuristic,
//! type length modulo six, is an on-disk contract; nothing outside this
//! module may interpret the type area.

use smallvec::SmallVec;

use crate::page;
use crate::types::{Error, PageKey, PageNo, Result, SpaceId};

/// Bytes of type information stored per entry field.
pub const PER_FIELD_TYPE_BYTES: usize = 6;

/// Length of the fixed sort-order prefix `(space, marker, page)`.
const KEY_PREFIX_LEN: usize = 9;
const TYPES_LEN_AT: usize = KEY_PREFIX_LEN;
const TYPES_AT: usize = KEY_PREFIX_LEN + 2;

const CHARSET_NULLABLE: u16 = 0x8000;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FieldKind {
    Binary = 1,
    Char = 2,
    Varchar = 3,
    Int = 4,
}

impl TryFrom<u8> for FieldKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FieldKind::Binary),
            2 => Ok(FieldKind::Char),
            3 => Ok(FieldKind::Varchar),
            4 => Ok(FieldKind::Int),
            _ => Err(Error::Corruption("unknown field kind in type info")),
        }
    }
}

impl FieldKind {
    /// Fixed-width kinds store values of exactly the declared length.
    pub fn is_fixed(self) -> bool {
        matches!(self, FieldKind::Char | FieldKind::Int)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FieldType {
    pub kind: FieldKind,
    pub len: u16,
    pub charset: u16,
    pub nullable: bool,
}

impl FieldType {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.kind as u8);
        out.push(0);
        out.extend_from_slice(&self.len.to_be_bytes());
        let charset = if self.nullable {
            self.charset | CHARSET_NULLABLE
        } else {
            self.charset
        };
        out.extend_from_slice(&charset.to_be_bytes());
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        debug_assert_eq!(raw.len(), PER_FIELD_TYPE_BYTES);
        if raw[1] != 0 {
            return Err(Error::Corruption("reserved type byte not zero"));
        }
        let charset_raw = u16::from_be_bytes([raw[4], raw[5]]);
        Ok(Self {
            kind: FieldKind::try_from(raw[0])?,
            len: u16::from_be_bytes([raw[2], raw[3]]),
            charset: charset_raw & !CHARSET_NULLABLE,
            nullable: charset_raw & CHARSET_NULLABLE != 0,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    pub ty: FieldType,
    pub value: Option<Vec<u8>>,
}

/// An index entry together with the per-field type information.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Tuple {
    pub fields: SmallVec<[Field; 4]>,
}

impl Tuple {
    /// Canonical byte image of the entry as stored on a target leaf. This is
    /// exactly the field section of the change-buffer record, so volume
    /// accounting and the target page always agree.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for field in &self.fields {
            match &field.value {
                Some(value) => {
                    out.push(1);
                    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
                    out.extend_from_slice(value);
                }
                None => {
                    out.push(0);
                    out.extend_from_slice(&0u16.to_be_bytes());
                }
            }
        }
        out
    }

    /// Bytes the entry occupies on the target page, directory slot included.
    pub fn footprint(&self) -> usize {
        page::record_footprint(self.payload().len())
    }
}

/// Kind of a deferred modification. Only inserts are buffered today; the
/// variant is the seam for delete-marks and updates.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferedOp {
    Insert,
}

/// Rejects entries the change buffer cannot represent.
pub fn validate_for_buffering(tuple: &Tuple) -> Result<()> {
    if tuple.fields.is_empty() {
        return Err(Error::Invalid("entry has no fields"));
    }
    for field in &tuple.fields {
        match &field.value {
            None => {
                if !field.ty.nullable {
                    return Err(Error::Invalid("null value in non-nullable field"));
                }
            }
            Some(value) => {
                if value.len() > u16::MAX as usize {
                    return Err(Error::Invalid("field value too long"));
                }
                if field.ty.kind.is_fixed() && value.len() != field.ty.len as usize {
                    return Err(Error::Invalid("fixed-width field length mismatch"));
                }
                if !field.ty.kind.is_fixed()
                    && field.ty.len != 0
                    && value.len() > field.ty.len as usize
                {
                    return Err(Error::Invalid("variable field exceeds declared length"));
                }
            }
        }
    }
    Ok(())
}

/// Builds the change-buffer record for one deferred entry.
pub fn encode(op: BufferedOp, target: PageKey, tuple: &Tuple, compact: bool) -> Result<Vec<u8>> {
    debug_assert!(matches!(op, BufferedOp::Insert));
    validate_for_buffering(tuple)?;

    let types_len = tuple.fields.len() * PER_FIELD_TYPE_BYTES + usize::from(compact);
    if types_len > u16::MAX as usize {
        return Err(Error::Invalid("entry has too many fields"));
    }

    let mut out = Vec::with_capacity(TYPES_AT + types_len + 16);
    out.extend_from_slice(&target.space.0.to_be_bytes());
    out.push(0); // format-era marker
    out.extend_from_slice(&target.page.0.to_be_bytes());
    out.extend_from_slice(&(types_len as u16).to_be_bytes());
    if compact {
        out.push(0); // compact-format indicator
    }
    for field in &tuple.fields {
        field.ty.encode_into(&mut out);
    }
    out.extend_from_slice(&tuple.payload());
    Ok(out)
}

/// Decodes a change-buffer record back into its target and entry.
pub fn decode(rec: &[u8]) -> Result<(PageKey, Tuple, bool)> {
    let (target, compact, n_fields) = decode_header(rec)?;
    let types_len = rec_types_len(rec)?;
    let types_at = TYPES_AT + usize::from(compact);

    let mut fields = SmallVec::new();
    let mut at = TYPES_AT + types_len;
    for i in 0..n_fields {
        let raw = &rec[types_at + i * PER_FIELD_TYPE_BYTES..types_at + (i + 1) * PER_FIELD_TYPE_BYTES];
        let ty = FieldType::decode(raw)?;
        if at + 3 > rec.len() {
            return Err(Error::Corruption("truncated field in buffered record"));
        }
        let presence = rec[at];
        let len = u16::from_be_bytes([rec[at + 1], rec[at + 2]]) as usize;
        at += 3;
        let value = match presence {
            0 => {
                if len != 0 {
                    return Err(Error::Corruption("null field with non-zero length"));
                }
                None
            }
            1 => {
                if at + len > rec.len() {
                    return Err(Error::Corruption("truncated field in buffered record"));
                }
                let value = rec[at..at + len].to_vec();
                at += len;
                Some(value)
            }
            _ => return Err(Error::Corruption("bad field presence byte")),
        };
        fields.push(Field { ty, value });
    }
    if at != rec.len() {
        return Err(Error::Corruption("trailing bytes in buffered record"));
    }
    Ok((target, Tuple { fields }, compact))
}

fn decode_header(rec: &[u8]) -> Result<(PageKey, bool, usize)> {
    let target = rec_target(rec)?;
    if rec[4] != 0 {
        return Err(Error::Corruption("unknown record format era"));
    }
    let types_len = rec_types_len(rec)?;
    if TYPES_AT + types_len > rec.len() {
        return Err(Error::Corruption("type info exceeds record"));
    }
    // The era of the target-page format hides in the type length. A length
    // divisible by the per-field width is the original format; a remainder
    // of one marks the compact format (one indicator byte precedes the type
    // array). Anything else is damage.
    let compact = match types_len % PER_FIELD_TYPE_BYTES {
        0 => false,
        1 => {
            if rec[TYPES_AT] != 0 {
                return Err(Error::Corruption("compact indicator byte not zero"));
            }
            true
        }
        _ => return Err(Error::Corruption("type info length misaligned")),
    };
    let n_fields = (types_len - usize::from(compact)) / PER_FIELD_TYPE_BYTES;
    if n_fields == 0 {
        return Err(Error::Corruption("buffered record without fields"));
    }
    Ok((target, compact, n_fields))
}

fn rec_types_len(rec: &[u8]) -> Result<usize> {
    if rec.len() < TYPES_AT {
        return Err(Error::Corruption("buffered record shorter than its key"));
    }
    Ok(u16::from_be_bytes([rec[TYPES_LEN_AT], rec[TYPES_LEN_AT + 1]]) as usize)
}

/// Target page of a record, read from the sort-order prefix.
pub fn rec_target(rec: &[u8]) -> Result<PageKey> {
    if rec.len() < KEY_PREFIX_LEN {
        return Err(Error::Corruption("buffered record shorter than its key"));
    }
    Ok(PageKey::new(
        SpaceId(u32::from_be_bytes(rec[0..4].try_into().unwrap())),
        PageNo(u32::from_be_bytes(rec[5..9].try_into().unwrap())),
    ))
}

/// Whether the record targets the compact page format.
pub fn rec_compact(rec: &[u8]) -> Result<bool> {
    let (_, compact, _) = decode_header(rec)?;
    Ok(compact)
}

/// Field section of the record: the exact payload the target leaf stores.
pub fn rec_entry_payload(rec: &[u8]) -> Result<&[u8]> {
    let types_len = rec_types_len(rec)?;
    let at = TYPES_AT + types_len;
    if at > rec.len() {
        return Err(Error::Corruption("type info exceeds record"));
    }
    Ok(&rec[at..])
}

/// Bytes the decoded entry plus its directory slot occupy on the target
/// page. Agrees with the page layer by construction.
pub fn encoded_volume(rec: &[u8]) -> Result<usize> {
    Ok(page::record_footprint(rec_entry_payload(rec)?.len()))
}

/// Smallest possible record prefix for `(space, page)`: positions a cursor
/// before every record of the target.
pub fn search_prefix(space: SpaceId, page: PageNo) -> Vec<u8> {
    let mut out = Vec::with_capacity(KEY_PREFIX_LEN);
    out.extend_from_slice(&space.0.to_be_bytes());
    out.push(0);
    out.extend_from_slice(&page.0.to_be_bytes());
    out
}
