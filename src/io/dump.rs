//! Binary dump format.
//!
//! # Layout
//!
//! | Field | Size |
//! |-------|------|
//! | [`DUMP_MAGIC`] | 18 |
//! | [`DUMP_VERSION`] | 1 |
//! | table presence mask ([`Table::bit`]) | 1 |
//! | embedding dimension (`u32` LE) | 4 |
//! | frames | ... |
//!
//! Each frame header is a tag byte, a `u32` LE payload length and the
//! CRC-32C of tag and payload, followed by the payload. Record frames use the
//! [`RecordKind`] tag and carry one codec-encoded record; trajectories carry
//! their steps. Stats frames carry a counter name and a `u64` value. The
//! final frame holds the number of frames before it. Headers and non-record
//! payloads use the codec's bincode settings.
//!
//! Reading skips frames that fail their checksum or fail to decode and counts
//! them, the same policy bulk loads use. A dump cut short keeps everything
//! before the cut.

use crate::codec::{Codec, Record, RecordKind, wire};
use crate::models::{FullSnapshot, StatCounter, Table, TableCounts};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::instrument;

/// Magic bytes at the start of every dump.
pub const DUMP_MAGIC: &[u8] = b"INTELLISTORE_DUMP\0";

/// Current dump format version.
pub const DUMP_VERSION: u8 = 1;

const STATS_TAG: u8 = 0x20;
const END_TAG: u8 = 0xFF;
const HEADER_LEN: usize = 6;
const FRAME_HEADER_LEN: usize = 9;

#[derive(Debug, Serialize, Deserialize)]
struct DumpHeader {
    version: u8,
    tables: u8,
    dimension: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    tag: u8,
    len: u32,
    crc: u32,
}

fn frame_crc(tag: u8, payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(&[tag]), payload)
}

/// A dump read back into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDump {
    /// Tables named by the presence mask, with every frame that decoded.
    pub snapshot: FullSnapshot,
    /// Frames dropped because they failed to decode or named an absent
    /// table.
    pub skipped: usize,
    /// True if the dump ended without its closing frame.
    pub truncated: bool,
}

fn io_error(operation: &str) -> impl Fn(std::io::Error) -> Error + '_ {
    move |e| Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

fn corrupt_dump(reason: impl Into<String>) -> Error {
    Error::CorruptRecord {
        kind: "dump".to_string(),
        reason: reason.into(),
    }
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::InvalidInput(format!("dump frame of {len} bytes is too large")))
}

struct FrameWriter<W: Write> {
    inner: W,
    frames: u64,
}

impl<W: Write> FrameWriter<W> {
    fn frame(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        let header = FrameHeader {
            tag,
            len: frame_len(payload.len())?,
            crc: frame_crc(tag, payload),
        };
        let write = io_error("write_dump");
        self.inner
            .write_all(&wire::encode(&header, "dump_frame")?)
            .map_err(&write)?;
        self.inner.write_all(payload).map_err(&write)?;
        self.frames += 1;
        Ok(())
    }

    fn record(&mut self, codec: &Codec, record: &Record) -> Result<()> {
        let payload = codec.encode(record)?;
        self.frame(record.kind().tag(), &payload)
    }
}

/// Writes `snapshot` as a dump.
///
/// Only present tables are written; the presence mask records which.
///
/// # Errors
///
/// Returns [`Error::DimensionMismatch`] if an embedding does not match the
/// codec, and [`Error::OperationFailed`] if the writer fails.
#[instrument(skip(writer, snapshot, codec), fields(operation = "write_dump", tables = snapshot.presence_mask()))]
pub fn write_dump<W: Write>(writer: W, snapshot: &FullSnapshot, codec: &Codec) -> Result<TableCounts> {
    let dimension = u32::try_from(codec.dimension())
        .map_err(|_| Error::InvalidInput("dimension does not fit the dump header".to_string()))?;

    let mut out = FrameWriter {
        inner: writer,
        frames: 0,
    };
    let header = wire::encode(
        &DumpHeader {
            version: DUMP_VERSION,
            tables: snapshot.presence_mask(),
            dimension,
        },
        "dump_header",
    )?;
    let write = io_error("write_dump");
    out.inner.write_all(DUMP_MAGIC).map_err(&write)?;
    out.inner.write_all(&header).map_err(&write)?;

    for memory in snapshot.memories.iter().flatten() {
        out.record(codec, &Record::Memory(memory.clone()))?;
    }
    for row in snapshot.value_rows.iter().flatten() {
        out.record(codec, &Record::ValueRow(row.clone()))?;
    }
    for trajectory in snapshot.trajectories.iter().flatten() {
        out.record(codec, &Record::Trajectory(trajectory.clone()))?;
    }
    for edge in snapshot.edges.iter().flatten() {
        out.record(codec, &Record::Edge(edge.clone()))?;
    }
    for entry in snapshot.kv.iter().flatten() {
        out.record(codec, &Record::Kv(entry.clone()))?;
    }
    for (counter, value) in snapshot.stats.iter().flatten() {
        let payload = wire::encode(&(counter.as_str(), *value), "stat")?;
        out.frame(STATS_TAG, &payload)?;
    }

    let frames = out.frames;
    out.frame(END_TAG, &wire::encode(&frames, "dump_trailer")?)?;
    out.inner.flush().map_err(io_error("write_dump"))?;

    let counts = snapshot.counts();
    tracing::debug!(frames, rows = counts.total_rows(), "wrote dump");
    Ok(counts)
}

/// Writes a dump to `path`, creating parent directories.
///
/// # Errors
///
/// Same as [`write_dump`], plus file creation and sync failures.
pub fn write_dump_file(path: impl AsRef<Path>, snapshot: &FullSnapshot, codec: &Codec) -> Result<TableCounts> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error("create_dump_dir"))?;
    }
    let file = File::create(path).map_err(io_error("create_dump"))?;
    let mut writer = BufWriter::new(file);
    let counts = write_dump(&mut writer, snapshot, codec)?;
    let file = writer
        .into_inner()
        .map_err(|e| io_error("write_dump")(e.into_error()))?;
    file.sync_all().map_err(io_error("sync_dump"))?;
    Ok(counts)
}

/// Cursor over the dump bytes.
struct Frames<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Frames<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Next frame header and payload, or `None` if the bytes end mid-frame.
    fn next_frame(&mut self) -> Option<(FrameHeader, &'a [u8])> {
        let header: FrameHeader = wire::decode(self.take(FRAME_HEADER_LEN)?, "dump_frame").ok()?;
        let payload = self.take(usize::try_from(header.len).ok()?)?;
        Some((header, payload))
    }
}

fn decode_stat(payload: &[u8]) -> Result<(StatCounter, u64)> {
    let (name, value): (String, u64) = wire::decode(payload, "stat")?;
    let counter = StatCounter::parse(&name).ok_or_else(|| Error::CorruptRecord {
        kind: "stat".to_string(),
        reason: format!("unknown counter '{name}'"),
    })?;
    Ok((counter, value))
}

/// Places a decoded record into its table. Returns the table the record
/// belongs to, or `None` for a record kind dumps never contain.
fn place(snapshot: &mut FullSnapshot, record: Record) -> std::result::Result<(), Table> {
    match record {
        Record::Memory(m) => snapshot.memories.as_mut().map(|t| t.push(m)).ok_or(Table::Memories),
        Record::ValueRow(r) => snapshot
            .value_rows
            .as_mut()
            .map(|t| t.push(r))
            .ok_or(Table::ValueRows),
        Record::Trajectory(t) => snapshot
            .trajectories
            .as_mut()
            .map(|v| v.push(t))
            .ok_or(Table::Trajectories),
        Record::Edge(e) => snapshot.edges.as_mut().map(|t| t.push(e)).ok_or(Table::Edges),
        Record::Kv(kv) => snapshot.kv.as_mut().map(|t| t.push(kv)).ok_or(Table::Kv),
        // Steps only travel inside their trajectory.
        Record::TrajectoryStep(_) => Err(Table::Trajectories),
    }
}

/// Reads a dump.
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] if the header is missing or has an
/// unsupported version, [`Error::DimensionMismatch`] if the dump was written
/// with another embedding dimension, and [`Error::OperationFailed`] if the
/// reader fails. Bad frames are skipped, not returned as errors.
#[instrument(skip(reader, codec), fields(operation = "read_dump"))]
pub fn read_dump<R: Read>(mut reader: R, codec: &Codec) -> Result<LoadedDump> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(io_error("read_dump"))?;

    let mut frames = Frames {
        bytes: &bytes,
        pos: 0,
    };
    if frames.take(DUMP_MAGIC.len()) != Some(DUMP_MAGIC) {
        return Err(corrupt_dump("missing dump header"));
    }
    let header: DumpHeader = frames
        .take(HEADER_LEN)
        .ok_or_else(|| corrupt_dump("truncated dump header"))
        .and_then(|h| wire::decode(h, "dump"))?;
    if header.version != DUMP_VERSION {
        return Err(corrupt_dump(format!(
            "unsupported dump version {} (expected {DUMP_VERSION})",
            header.version
        )));
    }
    let mask = header.tables;
    let dimension = usize::try_from(header.dimension)
        .map_err(|_| corrupt_dump("dimension overflow"))?;
    if dimension != codec.dimension() {
        return Err(Error::DimensionMismatch {
            expected: codec.dimension(),
            actual: dimension,
        });
    }

    let present = |table: Table| mask & table.bit() != 0;
    let mut snapshot = FullSnapshot {
        memories: present(Table::Memories).then(Vec::new),
        value_rows: present(Table::ValueRows).then(Vec::new),
        trajectories: present(Table::Trajectories).then(Vec::new),
        edges: present(Table::Edges).then(Vec::new),
        kv: present(Table::Kv).then(Vec::new),
        stats: present(Table::Stats).then(BTreeMap::new),
    };

    let mut skipped = 0;
    let mut seen: u64 = 0;
    let mut truncated = true;
    while frames.remaining() > 0 {
        let Some((header, payload)) = frames.next_frame() else {
            tracing::warn!("dump ends mid-frame");
            skipped += 1;
            break;
        };
        let tag = header.tag;
        if header.crc != frame_crc(tag, payload) {
            tracing::warn!(tag, "skipping dump frame with bad checksum");
            metrics::counter!("storage_corrupt_records_total", "backend" => "dump").increment(1);
            seen += 1;
            skipped += 1;
            continue;
        }
        if tag == END_TAG {
            let declared = wire::decode::<u64>(payload, "dump_trailer").ok();
            if declared != Some(seen) {
                tracing::warn!(seen, "dump frame count does not match its trailer");
            }
            truncated = false;
            break;
        }
        seen += 1;

        let placed = if tag == STATS_TAG {
            decode_stat(payload).and_then(|(counter, value)| {
                snapshot
                    .stats
                    .as_mut()
                    .map(|s| {
                        s.insert(counter, value);
                    })
                    .ok_or_else(|| corrupt_dump("stats frame but stats table absent"))
            })
        } else {
            RecordKind::from_tag(tag)
                .ok_or_else(|| corrupt_dump(format!("unknown frame tag {tag}")))
                .and_then(|kind| codec.decode(payload, kind))
                .and_then(|record| {
                    place(&mut snapshot, record).map_err(|table| {
                        corrupt_dump(format!("record frame for absent table {table}"))
                    })
                })
        };
        if let Err(e) = placed {
            tracing::warn!(tag, error = %e, "skipping corrupt dump frame");
            metrics::counter!("storage_corrupt_records_total", "backend" => "dump").increment(1);
            skipped += 1;
        }
    }

    if truncated {
        tracing::warn!(skipped, "dump has no closing frame; keeping what was read");
    }
    Ok(LoadedDump {
        snapshot,
        skipped,
        truncated,
    })
}

/// Reads a dump from `path`.
///
/// # Errors
///
/// Same as [`read_dump`], plus failure to open the file.
pub fn read_dump_file(path: impl AsRef<Path>, codec: &Codec) -> Result<LoadedDump> {
    let file = File::open(path.as_ref()).map_err(io_error("open_dump"))?;
    read_dump(BufReader::new(file), codec)
}
