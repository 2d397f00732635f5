//! Versioned binary codec for stored records.
//!
//! # Layout
//!
//! Every encoded record starts with two bytes:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | [`FORMAT_VERSION`] |
//! | 1 | 1 | [`RecordKind`] tag |
//!
//! followed by the record's fields in declaration order, encoded with
//! `bincode` in fixed-int mode: integers and floats are little-endian fixed
//! width, strings are `u64` length-prefixed UTF-8, optional fields carry a
//! presence byte (`0` or `1`). Embeddings are a `u64` element count followed
//! by that many `f32`s.
//!
//! Decoding is strict: short buffers, trailing bytes, unknown tags and
//! invalid UTF-8 are [`Error::CorruptRecord`]. A well-formed vector whose
//! element count differs from the codec's dimension is
//! [`Error::DimensionMismatch`]. Nothing is truncated or padded.

pub(crate) mod wire;

use crate::models::{Edge, KvEntry, MemoryRecord, Trajectory, TrajectoryStep, ValueTableRow};
use crate::{Error, Result};
use std::fmt;

/// Current record format version.
pub const FORMAT_VERSION: u8 = 1;

/// Kind tag of an encoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// [`MemoryRecord`].
    Memory = 1,
    /// [`ValueTableRow`].
    ValueRow = 2,
    /// [`Trajectory`] including its steps.
    Trajectory = 3,
    /// A single [`TrajectoryStep`].
    TrajectoryStep = 4,
    /// [`Edge`].
    Edge = 5,
    /// [`KvEntry`].
    Kv = 6,
}

impl RecordKind {
    /// Returns the kind name used in error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::ValueRow => "value_row",
            Self::Trajectory => "trajectory",
            Self::TrajectoryStep => "trajectory_step",
            Self::Edge => "edge",
            Self::Kv => "kv",
        }
    }

    /// Returns the wire tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Parses a wire tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Memory),
            2 => Some(Self::ValueRow),
            3 => Some(Self::Trajectory),
            4 => Some(Self::TrajectoryStep),
            5 => Some(Self::Edge),
            6 => Some(Self::Kv),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any record the codec understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A memory record.
    Memory(MemoryRecord),
    /// A value-table row.
    ValueRow(ValueTableRow),
    /// A trajectory with its steps.
    Trajectory(Trajectory),
    /// A single trajectory step.
    TrajectoryStep(TrajectoryStep),
    /// A co-occurrence edge.
    Edge(Edge),
    /// A key-value entry.
    Kv(KvEntry),
}

impl Record {
    /// Returns the record's kind.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Memory(_) => RecordKind::Memory,
            Self::ValueRow(_) => RecordKind::ValueRow,
            Self::Trajectory(_) => RecordKind::Trajectory,
            Self::TrajectoryStep(_) => RecordKind::TrajectoryStep,
            Self::Edge(_) => RecordKind::Edge,
            Self::Kv(_) => RecordKind::Kv,
        }
    }
}

/// Encoder/decoder bound to a fixed embedding dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    dimension: usize,
}

impl Codec {
    /// Creates a codec for vectors of `dimension` elements.
    #[must_use]
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Returns the configured dimension.
    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Checks a vector against the configured dimension.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if the lengths differ.
    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() == self.dimension {
            Ok(())
        } else {
            Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            })
        }
    }

    /// Encodes a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] for an embedding of the wrong
    /// length.
    pub fn encode(&self, record: &Record) -> Result<Vec<u8>> {
        let kind = record.kind();
        let mut out = vec![FORMAT_VERSION, kind.tag()];
        match record {
            Record::Memory(m) => {
                if let Some(vector) = &m.embedding {
                    self.check_dimension(vector)?;
                }
                wire::encode_into(&mut out, m, kind.as_str())?;
            },
            Record::ValueRow(row) => wire::encode_into(&mut out, row, kind.as_str())?,
            Record::Trajectory(t) => wire::encode_into(&mut out, t, kind.as_str())?,
            Record::TrajectoryStep(step) => wire::encode_into(&mut out, step, kind.as_str())?,
            Record::Edge(e) => wire::encode_into(&mut out, e, kind.as_str())?,
            Record::Kv(kv) => wire::encode_into(&mut out, kv, kind.as_str())?,
        }
        Ok(out)
    }

    /// Decodes a record of the declared kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] if the bytes do not have the shape of
    /// `kind`, or [`Error::DimensionMismatch`] for an embedding of another
    /// dimension.
    pub fn decode(&self, bytes: &[u8], kind: RecordKind) -> Result<Record> {
        let corrupt = |reason: String| Error::CorruptRecord {
            kind: kind.as_str().to_string(),
            reason,
        };
        let ([version, tag], body) = bytes
            .split_first_chunk::<2>()
            .map(|(header, body)| (*header, body))
            .ok_or_else(|| corrupt(format!("{} bytes is shorter than the header", bytes.len())))?;
        if version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {version} (expected {FORMAT_VERSION})"
            )));
        }
        if tag != kind.tag() {
            let found = RecordKind::from_tag(tag).map_or("unknown", RecordKind::as_str);
            return Err(corrupt(format!("kind tag {tag} ({found}) does not match {kind}")));
        }

        let name = kind.as_str();
        Ok(match kind {
            RecordKind::Memory => {
                let memory: MemoryRecord = wire::decode(body, name)?;
                if let Some(vector) = &memory.embedding {
                    self.check_dimension(vector)?;
                }
                Record::Memory(memory)
            },
            RecordKind::ValueRow => Record::ValueRow(wire::decode(body, name)?),
            RecordKind::Trajectory => Record::Trajectory(wire::decode(body, name)?),
            RecordKind::TrajectoryStep => Record::TrajectoryStep(wire::decode(body, name)?),
            RecordKind::Edge => Record::Edge(wire::decode(body, name)?),
            RecordKind::Kv => Record::Kv(wire::decode(body, name)?),
        })
    }

    /// Encodes a bare vector as fixed-width little-endian `f32`s.
    ///
    /// This is the representation of the transactional store's `embedding`
    /// column: exactly `dimension * 4` bytes, no header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if the vector has the wrong length.
    pub fn encode_vector(&self, vector: &[f32]) -> Result<Vec<u8>> {
        self.check_dimension(vector)?;
        Ok(vector.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Decodes a bare vector produced by [`Codec::encode_vector`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptRecord`] if the length is not a multiple of 4,
    /// or [`Error::DimensionMismatch`] if it holds a different number of
    /// elements.
    pub fn decode_vector(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let chunks = bytes.chunks_exact(4);
        if !chunks.remainder().is_empty() {
            return Err(Error::CorruptRecord {
                kind: "embedding".to_string(),
                reason: format!("{} bytes is not a whole number of f32 values", bytes.len()),
            });
        }
        let vector: Vec<f32> = chunks
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.check_dimension(&vector)?;
        Ok(vector)
    }
}
