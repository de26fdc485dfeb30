#![forbid(unsafe_code)]
//! Wire protocol between the snapshot daemon and its clients.
//!
//! Every message is `head{code: u32, length: u32}` followed by `length`
//! body bytes, all little-endian. Write queries carry ranges of origin
//! chunks; write and snapshot-read responses carry coalesced ranges of
//! chunk addresses, with the per-chunk exception addresses tacked on for
//! snapshot views. A change-list reply is followed by `count` raw u64
//! chunk ids outside the framed body.

use snapstore_error::{Result, SnapError};
use snapstore_types::{put_le_u16, put_le_u32, put_le_u64, read_le_u16, read_le_u32, read_le_u64};

/// Framing header size.
pub const HEAD_SIZE: usize = 8;
/// Hard cap on a message body.
pub const MAX_BODY: usize = 65536;
/// Longest error message text shipped in an error body.
pub const MAX_ERRMSG_SIZE: usize = 128;

// ── Message codes ───────────────────────────────────────────────────────────

pub const QUERY_WRITE: u32 = 1;
pub const QUERY_SNAPSHOT_READ: u32 = 2;
pub const FINISH_SNAPSHOT_READ: u32 = 3;
pub const IDENTIFY: u32 = 4;
pub const CREATE_SNAPSHOT: u32 = 5;
pub const DELETE_SNAPSHOT: u32 = 6;
pub const LIST_SNAPSHOTS: u32 = 7;
pub const PRIORITY: u32 = 8;
pub const USECOUNT: u32 = 9;
pub const STATUS: u32 = 10;
pub const STREAM_CHANGELIST: u32 = 11;
pub const REQUEST_ORIGIN_SECTORS: u32 = 12;
pub const SHUTDOWN_SERVER: u32 = 13;

pub const ORIGIN_WRITE_OK: u32 = 0x81;
pub const ORIGIN_WRITE_ERROR: u32 = 0x82;
pub const SNAPSHOT_WRITE_OK: u32 = 0x83;
pub const SNAPSHOT_WRITE_ERROR: u32 = 0x84;
pub const SNAPSHOT_READ_OK: u32 = 0x85;
pub const SNAPSHOT_READ_ORIGIN_OK: u32 = 0x86;
pub const IDENTIFY_OK: u32 = 0x87;
pub const IDENTIFY_ERROR: u32 = 0x88;
pub const CREATE_SNAPSHOT_OK: u32 = 0x89;
pub const CREATE_SNAPSHOT_ERROR: u32 = 0x8a;
pub const DELETE_SNAPSHOT_OK: u32 = 0x8b;
pub const DELETE_SNAPSHOT_ERROR: u32 = 0x8c;
pub const SNAPSHOT_LIST: u32 = 0x8d;
pub const PRIORITY_OK: u32 = 0x8e;
pub const PRIORITY_ERROR: u32 = 0x8f;
pub const USECOUNT_OK: u32 = 0x90;
pub const USECOUNT_ERROR: u32 = 0x91;
pub const STATUS_OK: u32 = 0x92;
pub const STATUS_ERROR: u32 = 0x93;
pub const STREAM_CHANGELIST_OK: u32 = 0x94;
pub const STREAM_CHANGELIST_ERROR: u32 = 0x95;
pub const ORIGIN_SECTORS: u32 = 0x96;
pub const PROTOCOL_ERROR: u32 = 0xff;

// ── Error codes carried in error bodies ─────────────────────────────────────

pub const ERROR_INVALID_SNAPSHOT: u32 = 1;
pub const ERROR_USECOUNT: u32 = 2;
pub const ERROR_SIZE_MISMATCH: u32 = 3;
pub const ERROR_OFFSET_MISMATCH: u32 = 4;
pub const ERROR_UNKNOWN_MESSAGE: u32 = 5;

fn short(what: &'static str) -> SnapError {
    SnapError::Protocol(format!("truncated {what} body"))
}

/// Frame a message: header plus body.
#[must_use]
pub fn frame(code: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEAD_SIZE + body.len());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Split a header into `(code, body_length)`.
pub fn parse_head(head: &[u8]) -> Result<(u32, usize)> {
    let code = read_le_u32(head, 0).map_err(|_| short("head"))?;
    let length = read_le_u32(head, 4).map_err(|_| short("head"))?;
    Ok((code, length as usize))
}

// ── Request bodies ──────────────────────────────────────────────────────────

/// One run of consecutive origin chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub chunk: u64,
    pub chunks: u16,
}

/// Body of `QUERY_WRITE`, `QUERY_SNAPSHOT_READ` and `FINISH_SNAPSHOT_READ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwRequest {
    pub id: u64,
    pub ranges: Vec<ChunkRange>,
}

impl RwRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; 12 + self.ranges.len() * 10];
        put_le_u64(&mut out, 0, self.id);
        put_le_u32(&mut out, 8, self.ranges.len() as u32);
        for (i, range) in self.ranges.iter().enumerate() {
            put_le_u64(&mut out, 12 + i * 10, range.chunk);
            put_le_u16(&mut out, 12 + i * 10 + 8, range.chunks);
        }
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let id = read_le_u64(body, 0).map_err(|_| short("rw_request"))?;
        let count = read_le_u32(body, 8).map_err(|_| short("rw_request"))? as usize;
        let mut ranges = Vec::with_capacity(count.min(MAX_BODY / 10));
        for i in 0..count {
            ranges.push(ChunkRange {
                chunk: read_le_u64(body, 12 + i * 10).map_err(|_| short("rw_request"))?,
                chunks: read_le_u16(body, 12 + i * 10 + 8).map_err(|_| short("rw_request"))?,
            });
        }
        Ok(Self { id, ranges })
    }
}

/// `IDENTIFY`: who is connecting and which view it wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identify {
    pub id: u64,
    /// Snapshot tag; `ORIGIN_TAG` (`!0`) selects the origin.
    pub snap: u32,
    /// Origin start offset in sectors.
    pub off: u64,
    /// Origin length in sectors.
    pub len: u64,
}

impl Identify {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; 28];
        put_le_u64(&mut out, 0, self.id);
        put_le_u32(&mut out, 8, self.snap);
        put_le_u64(&mut out, 12, self.off);
        put_le_u64(&mut out, 20, self.len);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Self {
            id: read_le_u64(body, 0).map_err(|_| short("identify"))?,
            snap: read_le_u32(body, 8).map_err(|_| short("identify"))?,
            off: read_le_u64(body, 12).map_err(|_| short("identify"))?,
            len: read_le_u64(body, 20).map_err(|_| short("identify"))?,
        })
    }
}

/// `CREATE_SNAPSHOT` / `DELETE_SNAPSHOT`: just the tag.
pub fn encode_tag(tag: u32) -> Vec<u8> {
    tag.to_le_bytes().to_vec()
}

pub fn decode_tag(body: &[u8]) -> Result<u32> {
    read_le_u32(body, 0).map_err(|_| short("snapshot tag"))
}

/// `PRIORITY`: set a snapshot's eviction priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRequest {
    pub snap: u32,
    pub prio: i8,
}

impl PriorityRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; 8];
        put_le_u32(&mut out, 0, self.snap);
        out[4] = self.prio as u8;
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let snap = read_le_u32(body, 0).map_err(|_| short("priority"))?;
        let prio = *body.get(4).ok_or_else(|| short("priority"))? as i8;
        Ok(Self { snap, prio })
    }
}

/// `USECOUNT`: adjust a snapshot's use count by a signed delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsecountRequest {
    pub snap: u32,
    pub delta: i32,
}

impl UsecountRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; 8];
        put_le_u32(&mut out, 0, self.snap);
        put_le_u32(&mut out, 4, self.delta as u32);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Self {
            snap: read_le_u32(body, 0).map_err(|_| short("usecount"))?,
            delta: read_le_u32(body, 4).map_err(|_| short("usecount"))? as i32,
        })
    }
}

/// `STREAM_CHANGELIST`: the two snapshots to diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangelistRequest {
    pub snap1: u32,
    pub snap2: u32,
}

impl ChangelistRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; 8];
        put_le_u32(&mut out, 0, self.snap1);
        put_le_u32(&mut out, 4, self.snap2);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Self {
            snap1: read_le_u32(body, 0).map_err(|_| short("changelist"))?,
            snap2: read_le_u32(body, 4).map_err(|_| short("changelist"))?,
        })
    }
}

// ── Reply bodies ────────────────────────────────────────────────────────────

/// `IDENTIFY_OK`: the store's snapshot chunk size.
pub fn encode_identify_ok(chunksize_bits: u32) -> Vec<u8> {
    chunksize_bits.to_le_bytes().to_vec()
}

pub fn decode_identify_ok(body: &[u8]) -> Result<u32> {
    read_le_u32(body, 0).map_err(|_| short("identify_ok"))
}

/// Typed error body: code plus nul-terminated ASCII message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub err: u32,
    pub msg: String,
}

impl ErrorBody {
    #[must_use]
    pub fn new(err: u32, msg: impl Into<String>) -> Self {
        let mut msg = msg.into();
        msg.truncate(MAX_ERRMSG_SIZE - 1);
        Self { err, msg }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.msg.len() + 1);
        out.extend_from_slice(&self.err.to_le_bytes());
        out.extend_from_slice(self.msg.as_bytes());
        out.push(0);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let err = read_le_u32(body, 0).map_err(|_| short("error"))?;
        let text = &body[4..];
        let end = text.iter().position(|b| *b == 0).unwrap_or(text.len());
        Ok(Self {
            err,
            msg: String::from_utf8_lossy(&text[..end]).into_owned(),
        })
    }
}

/// `PROTOCOL_ERROR`: error code, the offending message code, message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolErrorBody {
    pub err: u32,
    pub culprit: u32,
    pub msg: String,
}

impl ProtocolErrorBody {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.msg.len() + 1);
        out.extend_from_slice(&self.err.to_le_bytes());
        out.extend_from_slice(&self.culprit.to_le_bytes());
        out.extend_from_slice(self.msg.as_bytes());
        out.push(0);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let err = read_le_u32(body, 0).map_err(|_| short("protocol_error"))?;
        let culprit = read_le_u32(body, 4).map_err(|_| short("protocol_error"))?;
        let text = &body[8..];
        let end = text.iter().position(|b| *b == 0).unwrap_or(text.len());
        Ok(Self {
            err,
            culprit,
            msg: String::from_utf8_lossy(&text[..end]).into_owned(),
        })
    }
}

/// One `SNAPSHOT_LIST` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapInfo {
    pub tag: u32,
    pub prio: i8,
    pub ctime: u32,
    pub usecount: u32,
}

pub fn encode_snapshot_list(snapshots: &[SnapInfo]) -> Vec<u8> {
    let mut out = vec![0_u8; 4 + snapshots.len() * 16];
    put_le_u32(&mut out, 0, snapshots.len() as u32);
    for (i, snap) in snapshots.iter().enumerate() {
        let base = 4 + i * 16;
        put_le_u32(&mut out, base, snap.tag);
        out[base + 4] = snap.prio as u8;
        put_le_u32(&mut out, base + 8, snap.ctime);
        put_le_u32(&mut out, base + 12, snap.usecount);
    }
    out
}

pub fn decode_snapshot_list(body: &[u8]) -> Result<Vec<SnapInfo>> {
    let count = read_le_u32(body, 0).map_err(|_| short("snapshot_list"))? as usize;
    let mut snapshots = Vec::with_capacity(count.min(MAX_BODY / 16));
    for i in 0..count {
        let base = 4 + i * 16;
        snapshots.push(SnapInfo {
            tag: read_le_u32(body, base).map_err(|_| short("snapshot_list"))?,
            prio: *body.get(base + 4).ok_or_else(|| short("snapshot_list"))? as i8,
            ctime: read_le_u32(body, base + 8).map_err(|_| short("snapshot_list"))?,
            usecount: read_le_u32(body, base + 12).map_err(|_| short("snapshot_list"))?,
        });
    }
    Ok(snapshots)
}

/// `STREAM_CHANGELIST_OK`: chunk count and chunk size; `count` raw u64
/// chunk addresses follow the framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangelistStream {
    pub count: u64,
    pub chunksize_bits: u32,
}

impl ChangelistStream {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; 12];
        put_le_u64(&mut out, 0, self.count);
        put_le_u32(&mut out, 8, self.chunksize_bits);
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Self {
            count: read_le_u64(body, 0).map_err(|_| short("changelist_stream"))?,
            chunksize_bits: read_le_u32(body, 8).map_err(|_| short("changelist_stream"))?,
        })
    }
}

/// Per-space usage figures in a `STATUS_OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceUsage {
    pub chunksize_bits: u32,
    pub used: u64,
    pub free: u64,
}

/// Per-snapshot block of a `STATUS_OK`: creation time plus the sharing
/// histogram (chunk counts by number of co-owning snapshots).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapStatus {
    pub ctime: u32,
    pub tag: u32,
    pub chunk_counts: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    pub ctime: u32,
    pub meta: SpaceUsage,
    pub store: SpaceUsage,
    pub write_density: u32,
    pub num_columns: u32,
    pub snapshots: Vec<SnapStatus>,
}

impl StatusReply {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let columns = self.num_columns as usize;
        let mut out = vec![0_u8; 56 + self.snapshots.len() * (8 + columns * 8)];
        put_le_u32(&mut out, 0, self.ctime);
        put_le_u32(&mut out, 4, self.meta.chunksize_bits);
        put_le_u64(&mut out, 8, self.meta.used);
        put_le_u64(&mut out, 16, self.meta.free);
        put_le_u32(&mut out, 24, self.store.chunksize_bits);
        put_le_u64(&mut out, 28, self.store.used);
        put_le_u64(&mut out, 36, self.store.free);
        put_le_u32(&mut out, 44, self.write_density);
        put_le_u32(&mut out, 48, self.snapshots.len() as u32);
        put_le_u32(&mut out, 52, self.num_columns);
        let mut base = 56;
        for snap in &self.snapshots {
            put_le_u32(&mut out, base, snap.ctime);
            put_le_u32(&mut out, base + 4, snap.tag);
            for (i, count) in snap.chunk_counts.iter().take(columns).enumerate() {
                put_le_u64(&mut out, base + 8 + i * 8, *count);
            }
            base += 8 + columns * 8;
        }
        out
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let ctime = read_le_u32(body, 0).map_err(|_| short("status"))?;
        let meta = SpaceUsage {
            chunksize_bits: read_le_u32(body, 4).map_err(|_| short("status"))?,
            used: read_le_u64(body, 8).map_err(|_| short("status"))?,
            free: read_le_u64(body, 16).map_err(|_| short("status"))?,
        };
        let store = SpaceUsage {
            chunksize_bits: read_le_u32(body, 24).map_err(|_| short("status"))?,
            used: read_le_u64(body, 28).map_err(|_| short("status"))?,
            free: read_le_u64(body, 36).map_err(|_| short("status"))?,
        };
        let write_density = read_le_u32(body, 44).map_err(|_| short("status"))?;
        let status_count = read_le_u32(body, 48).map_err(|_| short("status"))? as usize;
        let num_columns = read_le_u32(body, 52).map_err(|_| short("status"))?;
        let columns = num_columns as usize;
        let mut snapshots = Vec::with_capacity(status_count.min(64));
        let mut base = 56;
        for _ in 0..status_count {
            let ctime = read_le_u32(body, base).map_err(|_| short("status"))?;
            let tag = read_le_u32(body, base + 4).map_err(|_| short("status"))?;
            let mut chunk_counts = Vec::with_capacity(columns);
            for i in 0..columns {
                chunk_counts.push(read_le_u64(body, base + 8 + i * 8).map_err(|_| short("status"))?);
            }
            snapshots.push(SnapStatus {
                ctime,
                tag,
                chunk_counts,
            });
            base += 8 + columns * 8;
        }
        Ok(Self {
            ctime,
            meta,
            store,
            write_density,
            num_columns,
            snapshots,
        })
    }
}

/// `ORIGIN_SECTORS` reply body.
pub fn encode_origin_sectors(sectors: u64) -> Vec<u8> {
    sectors.to_le_bytes().to_vec()
}

pub fn decode_origin_sectors(body: &[u8]) -> Result<u64> {
    read_le_u64(body, 0).map_err(|_| short("origin_sectors"))
}

/// `PRIORITY_OK` reply body: the priority now in force.
pub fn encode_priority_ok(prio: i8) -> Vec<u8> {
    vec![prio as u8]
}

pub fn decode_priority_ok(body: &[u8]) -> Result<i8> {
    body.first()
        .map(|b| *b as i8)
        .ok_or_else(|| short("priority_ok"))
}

/// `USECOUNT_OK` reply body: the new use count.
pub fn encode_usecount_ok(usecount: u32) -> Vec<u8> {
    usecount.to_le_bytes().to_vec()
}

pub fn decode_usecount_ok(body: &[u8]) -> Result<u32> {
    read_le_u32(body, 0).map_err(|_| short("usecount_ok"))
}

// ── Range-list reply builder ────────────────────────────────────────────────

/// Builds write/read replies as a minimum number of contiguous chunk
/// ranges: `{id, count, [{start: u64, count: u16, ...}]}`. Snapshot views
/// append one exception address per chunk inside each range.
#[derive(Debug)]
pub struct RangeReply {
    body: Vec<u8>,
    ranges: u32,
    /// Offset of the open range's count field.
    countp: Option<usize>,
    first: u64,
    next: Option<u64>,
}

impl RangeReply {
    #[must_use]
    pub fn new(id: u64) -> Self {
        let mut body = vec![0_u8; 12];
        put_le_u64(&mut body, 0, id);
        Self {
            body,
            ranges: 0,
            countp: None,
            first: 0,
            next: None,
        }
    }

    fn close_range(&mut self) {
        if let (Some(countp), Some(next)) = (self.countp, self.next) {
            let count = (next - self.first) as u16;
            put_le_u16(&mut self.body, countp, count);
        }
    }

    /// Append a chunk, opening a new range when it does not continue the
    /// previous one.
    pub fn add_chunk(&mut self, chunk: u64) -> Result<()> {
        if self.next != Some(chunk) {
            self.close_range();
            if self.body.len() + 10 > MAX_BODY {
                return Err(SnapError::Protocol("reply overflows message body".into()));
            }
            self.body.extend_from_slice(&chunk.to_le_bytes());
            self.countp = Some(self.body.len());
            self.body.extend_from_slice(&0_u16.to_le_bytes());
            self.first = chunk;
            self.ranges += 1;
        }
        self.next = Some(chunk + 1);
        Ok(())
    }

    /// Append the exception address for the chunk just added.
    pub fn push_exception(&mut self, exception: u64) -> Result<()> {
        if self.body.len() + 8 > MAX_BODY {
            return Err(SnapError::Protocol("reply overflows message body".into()));
        }
        self.body.extend_from_slice(&exception.to_le_bytes());
        Ok(())
    }

    /// Close the builder into a framed message, or `None` when no chunk
    /// was ever added (no message is sent for an empty list).
    #[must_use]
    pub fn finish(mut self, code: u32) -> Option<Vec<u8>> {
        self.countp?;
        self.close_range();
        put_le_u32(&mut self.body, 8, self.ranges);
        Some(frame(code, &self.body))
    }
}

/// Parsed range reply, exceptions included when the view is a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeReplyBody {
    pub id: u64,
    pub ranges: Vec<(ChunkRange, Vec<u64>)>,
}

/// Decode a range reply body. `with_exceptions` matches the message codes
/// that carry per-chunk exception addresses.
pub fn decode_range_reply(body: &[u8], with_exceptions: bool) -> Result<RangeReplyBody> {
    let id = read_le_u64(body, 0).map_err(|_| short("range reply"))?;
    let count = read_le_u32(body, 8).map_err(|_| short("range reply"))? as usize;
    let mut offset = 12;
    let mut ranges = Vec::with_capacity(count.min(MAX_BODY / 10));
    for _ in 0..count {
        let chunk = read_le_u64(body, offset).map_err(|_| short("range reply"))?;
        let chunks = read_le_u16(body, offset + 8).map_err(|_| short("range reply"))?;
        offset += 10;
        let mut exceptions = Vec::new();
        if with_exceptions {
            for _ in 0..chunks {
                exceptions.push(read_le_u64(body, offset).map_err(|_| short("range reply"))?);
                offset += 8;
            }
        }
        ranges.push((ChunkRange { chunk, chunks }, exceptions));
    }
    Ok(RangeReplyBody { id, ranges })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_and_head_round_trip() {
        let framed = frame(QUERY_WRITE, &[1, 2, 3]);
        assert_eq!(framed.len(), HEAD_SIZE + 3);
        let (code, length) = parse_head(&framed[..HEAD_SIZE]).unwrap();
        assert_eq!(code, QUERY_WRITE);
        assert_eq!(length, 3);
    }

    #[test]
    fn rw_request_round_trip() {
        let request = RwRequest {
            id: 0xdead_beef,
            ranges: vec![
                ChunkRange { chunk: 10, chunks: 4 },
                ChunkRange {
                    chunk: 99,
                    chunks: 1,
                },
            ],
        };
        let body = request.encode();
        assert_eq!(RwRequest::decode(&body).unwrap(), request);
    }

    #[test]
    fn rw_request_truncated_body_errors() {
        let body = RwRequest {
            id: 1,
            ranges: vec![ChunkRange { chunk: 5, chunks: 2 }],
        }
        .encode();
        assert!(RwRequest::decode(&body[..body.len() - 1]).is_err());
    }

    #[test]
    fn identify_round_trip() {
        let identify = Identify {
            id: 7,
            snap: u32::MAX,
            off: 0,
            len: 32768,
        };
        assert_eq!(Identify::decode(&identify.encode()).unwrap(), identify);
    }

    #[test]
    fn error_body_nul_terminated() {
        let body = ErrorBody::new(ERROR_INVALID_SNAPSHOT, "no such tag").encode();
        assert_eq!(*body.last().unwrap(), 0);
        let back = ErrorBody::decode(&body).unwrap();
        assert_eq!(back.err, ERROR_INVALID_SNAPSHOT);
        assert_eq!(back.msg, "no such tag");
    }

    #[test]
    fn range_reply_coalesces_contiguous_chunks() {
        let mut reply = RangeReply::new(42);
        for chunk in [5_u64, 6, 7, 20, 21] {
            reply.add_chunk(chunk).unwrap();
        }
        let framed = reply.finish(ORIGIN_WRITE_OK).unwrap();
        let (code, length) = parse_head(&framed[..HEAD_SIZE]).unwrap();
        assert_eq!(code, ORIGIN_WRITE_OK);
        let body = &framed[HEAD_SIZE..HEAD_SIZE + length];
        let parsed = decode_range_reply(body, false).unwrap();
        assert_eq!(parsed.id, 42);
        assert_eq!(
            parsed.ranges,
            vec![
                (ChunkRange { chunk: 5, chunks: 3 }, vec![]),
                (
                    ChunkRange {
                        chunk: 20,
                        chunks: 2
                    },
                    vec![]
                ),
            ]
        );
    }

    #[test]
    fn range_reply_with_exceptions() {
        let mut reply = RangeReply::new(1);
        reply.add_chunk(5).unwrap();
        reply.push_exception(0x100).unwrap();
        reply.add_chunk(6).unwrap();
        reply.push_exception(0x101).unwrap();
        let framed = reply.finish(SNAPSHOT_READ_OK).unwrap();
        let body = &framed[HEAD_SIZE..];
        let parsed = decode_range_reply(body, true).unwrap();
        assert_eq!(
            parsed.ranges,
            vec![(ChunkRange { chunk: 5, chunks: 2 }, vec![0x100, 0x101])]
        );
    }

    #[test]
    fn empty_range_reply_sends_nothing() {
        let reply = RangeReply::new(1);
        assert!(reply.finish(SNAPSHOT_READ_OK).is_none());
    }

    #[test]
    fn snapshot_list_round_trip() {
        let list = vec![
            SnapInfo {
                tag: 1,
                prio: -5,
                ctime: 1000,
                usecount: 2,
            },
            SnapInfo {
                tag: 9,
                prio: 0,
                ctime: 2000,
                usecount: 0,
            },
        ];
        assert_eq!(
            decode_snapshot_list(&encode_snapshot_list(&list)).unwrap(),
            list
        );
    }

    #[test]
    fn status_reply_round_trip() {
        let reply = StatusReply {
            ctime: 123,
            meta: SpaceUsage {
                chunksize_bits: 12,
                used: 70,
                free: 4026,
            },
            store: SpaceUsage {
                chunksize_bits: 12,
                used: 3,
                free: 4093,
            },
            write_density: 0,
            num_columns: 2,
            snapshots: vec![
                SnapStatus {
                    ctime: 500,
                    tag: 1,
                    chunk_counts: vec![2, 1],
                },
                SnapStatus {
                    ctime: 600,
                    tag: 2,
                    chunk_counts: vec![0, 1],
                },
            ],
        };
        assert_eq!(StatusReply::decode(&reply.encode()).unwrap(), reply);
    }
}
