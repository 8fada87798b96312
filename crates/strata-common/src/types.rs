//! Core type definitions for Strata
//!
//! Identifiers for pages, page files and LSM components, the field and
//! tuple model shared by every index, and the operation kinds used by the
//! component lifecycle.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier of a page within one page file
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct PageId(u32);

impl PageId {
    /// Every tree keeps its root at this page, across root splits
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Byte offset of this page inside its backing file
    #[must_use]
    pub const fn offset(self, page_size: usize) -> u64 {
        self.0 as u64 * page_size as u64
    }
}

/// Identifier of a page file registered with the buffer cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[display("file-{_0}")]
pub struct FileId(u32);

impl FileId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

/// Identifier of an LSM component
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[display("c{_0:06}")]
pub struct ComponentId(u64);

impl ComponentId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Operation kinds admitted by an LSM component
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// Insert or delete routed to the mutable component
    Modification,
    /// Modification admitted even after the component filled up
    ForceModification,
    /// Read-only traversal
    Search,
    /// Freezing a memory component into a disk component
    Flush,
    /// Combining disk components into one
    Merge,
}

impl OpType {
    pub const ALL: [Self; 5] = [
        Self::Modification,
        Self::ForceModification,
        Self::Search,
        Self::Flush,
        Self::Merge,
    ];

    /// Whether the operation counts as a writer of the component
    #[must_use]
    pub const fn is_writer(self) -> bool {
        matches!(self, Self::Modification | Self::ForceModification)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Modification => 0,
            Self::ForceModification => 1,
            Self::Search => 2,
            Self::Flush => 3,
            Self::Merge => 4,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modification => write!(f, "modification"),
            Self::ForceModification => write!(f, "force-modification"),
            Self::Search => write!(f, "search"),
            Self::Flush => write!(f, "flush"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

const TAG_INT: u8 = 1;
const TAG_DOUBLE: u8 = 2;
const TAG_BYTES: u8 = 3;

/// A single tuple field
///
/// Fields are totally ordered: values of different kinds order by kind
/// (int < double < bytes) and doubles use IEEE total ordering, so every
/// tuple can be compared, hashed and deduplicated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Field {
    Int(i64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Field {
    const fn tag(&self) -> u8 {
        match self {
            Self::Int(_) => TAG_INT,
            Self::Double(_) => TAG_DOUBLE,
            Self::Bytes(_) => TAG_BYTES,
        }
    }

    /// Numeric view of the field, used by spatial keys
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Bytes(_) => None,
        }
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether the field has a fixed encoded width
    #[must_use]
    pub const fn is_fixed_width(&self) -> bool {
        !matches!(self, Self::Bytes(_))
    }

    /// Encoded size in bytes, including the tag
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Int(_) | Self::Double(_) => 1 + 8,
            Self::Bytes(b) => 1 + 2 + b.len(),
        }
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Field {}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Field {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Double(a), Self::Double(b)) => a.total_cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match self {
            Self::Int(v) => v.hash(state),
            Self::Double(v) => v.to_bits().hash(state),
            Self::Bytes(b) => b.hash(state),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Bytes(b) => write!(f, "0x{}", b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
        }
    }
}

/// An ordered sequence of fields; the key is a prefix of the fields
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tuple {
    fields: Vec<Field>,
}

impl Tuple {
    #[must_use]
    pub const fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Tuple of integer fields
    #[must_use]
    pub fn ints(values: &[i64]) -> Self {
        Self::new(values.iter().copied().map(Field::Int).collect())
    }

    /// Spatial tuple: box corners followed by an integer payload
    #[must_use]
    pub fn rect(min: &[f64], max: &[f64], payload: i64) -> Self {
        let mut fields: Vec<Field> = min.iter().chain(max).copied().map(Field::Double).collect();
        fields.push(Field::Int(payload));
        Self::new(fields)
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    #[must_use]
    pub fn into_fields(self) -> Vec<Field> {
        self.fields
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Size of the encoded image
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        2 + self.fields.iter().map(Field::encoded_len).sum::<usize>()
    }

    /// Encode as `u16` field count followed by tagged little-endian fields
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.fields.len() as u16);
        for field in &self.fields {
            buf.put_u8(field.tag());
            match field {
                Field::Int(v) => buf.put_i64_le(*v),
                Field::Double(v) => buf.put_f64_le(*v),
                Field::Bytes(b) => {
                    buf.put_u16_le(b.len() as u16);
                    buf.put_slice(b);
                }
            }
        }
    }

    /// Decode an image produced by [`Tuple::encode`]
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 2 {
            return Err(Error::corruption("tuple image shorter than its header"));
        }
        let count = usize::from(data.get_u16_le());
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            if !data.has_remaining() {
                return Err(Error::corruption("tuple image truncated"));
            }
            let field = match data.get_u8() {
                TAG_INT if data.remaining() >= 8 => Field::Int(data.get_i64_le()),
                TAG_DOUBLE if data.remaining() >= 8 => Field::Double(data.get_f64_le()),
                TAG_BYTES if data.remaining() >= 2 => {
                    let len = usize::from(data.get_u16_le());
                    if data.remaining() < len {
                        return Err(Error::corruption("tuple bytes field truncated"));
                    }
                    let bytes = data[..len].to_vec();
                    data.advance(len);
                    Field::Bytes(bytes)
                }
                tag => return Err(Error::corruption(format!("bad field tag {tag}"))),
            };
            fields.push(field);
        }
        Ok(Self { fields })
    }
}

impl From<Vec<Field>> for Tuple {
    fn from(fields: Vec<Field>) -> Self {
        Self::new(fields)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}")?;
        }
        write!(f, ")")
    }
}
