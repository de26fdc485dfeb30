//! Request dispatch: decode one message, drive the engine, produce replies.
//!
//! Origin writes are echoed back with their code rewritten, unless a chunk
//! they touched is read-locked, in which case the reply parks in the lock
//! table. Snapshot read and write responses are built up as coalesced chunk
//! ranges and always go out immediately.

use crate::locks::{settle_pending, LockTable};
use snapstore_core::SnapStore;
use snapstore_proto as proto;
use snapstore_types::ORIGIN_TAG;
use tracing::warn;

/// Which view a session speaks for after `IDENTIFY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionView {
    Unidentified,
    Origin,
    Snapshot(u32),
}

/// Per-session state threaded through dispatch.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub token: usize,
    pub id: u64,
    pub view: SessionView,
    /// Set once the client identified; gates use-count bookkeeping on
    /// disconnect.
    pub using: bool,
}

impl SessionState {
    #[must_use]
    pub fn new(token: usize) -> Self {
        Self {
            token,
            id: 0,
            view: SessionView::Unidentified,
            using: false,
        }
    }
}

/// What the server should do after handling one message.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Framed messages to queue, each to a session token.
    pub replies: Vec<(usize, Vec<u8>)>,
    /// Disconnect this client (protocol violation).
    pub close: bool,
    /// Clean shutdown of the whole server.
    pub shutdown: bool,
}

impl Outcome {
    fn reply(state: &SessionState, message: Vec<u8>) -> Self {
        Self {
            replies: vec![(state.token, message)],
            ..Self::default()
        }
    }

    fn close() -> Self {
        Self {
            close: true,
            ..Self::default()
        }
    }
}

/// Handle one decoded message frame.
pub fn dispatch(
    store: &mut SnapStore,
    locks: &mut LockTable,
    state: &mut SessionState,
    code: u32,
    body: &[u8],
) -> Outcome {
    match code {
        proto::QUERY_WRITE => query_write(store, locks, state, body),
        proto::QUERY_SNAPSHOT_READ => query_snapshot_read(store, locks, state, body),
        proto::FINISH_SNAPSHOT_READ => finish_snapshot_read(locks, state, body),
        proto::IDENTIFY => identify(store, state, body),
        proto::CREATE_SNAPSHOT => create_snapshot(store, state, body),
        proto::DELETE_SNAPSHOT => delete_snapshot(store, state, body),
        proto::LIST_SNAPSHOTS => list_snapshots(store, state),
        proto::PRIORITY => priority(store, state, body),
        proto::USECOUNT => usecount(store, state, body),
        proto::STATUS => status(store, state, body),
        proto::STREAM_CHANGELIST => stream_changelist(store, state, body),
        proto::REQUEST_ORIGIN_SECTORS => Outcome::reply(
            state,
            proto::frame(
                proto::ORIGIN_SECTORS,
                &proto::encode_origin_sectors(store.image.orgsectors),
            ),
        ),
        proto::SHUTDOWN_SERVER => Outcome {
            shutdown: true,
            ..Outcome::default()
        },
        proto::PROTOCOL_ERROR => {
            match proto::ProtocolErrorBody::decode(body) {
                Ok(perror) => warn!(
                    target: "snapstore::server",
                    err = perror.err,
                    culprit = format_args!("{:#x}", perror.culprit),
                    msg = %perror.msg,
                    "protocol error message"
                ),
                Err(_) => warn!(
                    target: "snapstore::server",
                    "received protocol error message; unable to retrieve information"
                ),
            }
            Outcome::default()
        }
        _ => {
            warn!(
                target: "snapstore::server",
                code = format_args!("{code:#x}"),
                length = body.len(),
                "unknown message code"
            );
            let perror = proto::ProtocolErrorBody {
                err: proto::ERROR_UNKNOWN_MESSAGE,
                culprit: code,
                msg: "server received unknown message".to_owned(),
            };
            Outcome::reply(state, proto::frame(proto::PROTOCOL_ERROR, &perror.encode()))
        }
    }
}

fn query_write(
    store: &mut SnapStore,
    locks: &mut LockTable,
    state: &mut SessionState,
    body: &[u8],
) -> Outcome {
    let Ok(request) = proto::RwRequest::decode(body) else {
        return Outcome::close();
    };
    match state.view {
        SessionView::Origin => origin_write(store, locks, state, &request, body),
        SessionView::Snapshot(bit) => snapshot_write(store, state, &request, bit),
        SessionView::Unidentified => Outcome::close(),
    }
}

fn origin_write(
    store: &mut SnapStore,
    locks: &mut LockTable,
    state: &mut SessionState,
    request: &proto::RwRequest,
    body: &[u8],
) -> Outcome {
    let mut pending = None;
    let mut code = proto::ORIGIN_WRITE_OK;
    for range in &request.ranges {
        for offset in 0..u64::from(range.chunks) {
            let chunk = range.chunk + offset;
            match store.make_unique(chunk, None) {
                Ok(0) => {}
                Ok(_exception) => locks.waitfor_chunk(chunk, &mut pending),
                Err(err) => {
                    warn!(
                        target: "snapstore::server",
                        chunk,
                        error = %err,
                        "unable to perform copyout during origin write"
                    );
                    code = proto::ORIGIN_WRITE_ERROR;
                }
            }
        }
    }
    if let Err(err) = store.finish_copyout() {
        warn!(target: "snapstore::server", error = %err, "copyout flush failed");
        code = proto::ORIGIN_WRITE_ERROR;
    }
    if let Err(err) = store.commit_transaction() {
        warn!(target: "snapstore::server", error = %err, "commit failed");
        code = proto::ORIGIN_WRITE_ERROR;
    }

    // The reply is the request body under the response code.
    let message = proto::frame(code, body);
    if let Some(pending) = pending {
        {
            let mut inner = pending.lock();
            inner.client = state.token;
            inner.message = message;
        }
        // Balance the base hold; locks may all have drained already.
        if settle_pending(&pending) {
            let inner = pending.lock();
            return Outcome {
                replies: vec![(inner.client, inner.message.clone())],
                ..Outcome::default()
            };
        }
        return Outcome::default();
    }
    Outcome::reply(state, message)
}

fn snapshot_write(
    store: &mut SnapStore,
    state: &mut SessionState,
    request: &proto::RwRequest,
    bit: u32,
) -> Outcome {
    let mut reply = proto::RangeReply::new(request.id);
    let mut code = proto::SNAPSHOT_WRITE_OK;
    for range in &request.ranges {
        for offset in 0..u64::from(range.chunks) {
            let chunk = range.chunk + offset;
            let exception = match store.make_unique(chunk, Some(bit)) {
                Ok(exception) => exception,
                Err(err) => {
                    warn!(
                        target: "snapstore::server",
                        chunk,
                        error = %err,
                        "unable to perform copyout during snapshot write"
                    );
                    code = proto::SNAPSHOT_WRITE_ERROR;
                    u64::MAX
                }
            };
            if reply.add_chunk(chunk).is_err() || reply.push_exception(exception).is_err() {
                return Outcome::close();
            }
        }
    }
    if let Err(err) = store.finish_copyout() {
        warn!(target: "snapstore::server", error = %err, "copyout flush failed");
        code = proto::SNAPSHOT_WRITE_ERROR;
    }
    if let Err(err) = store.commit_transaction() {
        warn!(target: "snapstore::server", error = %err, "commit failed");
        code = proto::SNAPSHOT_WRITE_ERROR;
    }
    match reply.finish(code) {
        Some(message) => Outcome::reply(state, message),
        None => Outcome::default(),
    }
}

fn query_snapshot_read(
    store: &mut SnapStore,
    locks: &mut LockTable,
    state: &mut SessionState,
    body: &[u8],
) -> Outcome {
    let Ok(request) = proto::RwRequest::decode(body) else {
        return Outcome::close();
    };
    let SessionView::Snapshot(bit) = state.view else {
        return Outcome::close();
    };
    let mut snap = proto::RangeReply::new(request.id);
    let mut org = proto::RangeReply::new(request.id);
    for range in &request.ranges {
        for offset in 0..u64::from(range.chunks) {
            let chunk = range.chunk + offset;
            let exception = match store.test_unique(chunk, Some(bit)) {
                Ok((_unique, exception)) => exception,
                Err(err) => {
                    warn!(
                        target: "snapstore::server",
                        chunk,
                        error = %err,
                        "snapshot read probe failed"
                    );
                    return Outcome::close();
                }
            };
            let full = if exception != 0 {
                snap.add_chunk(chunk).is_err() || snap.push_exception(exception).is_err()
            } else {
                locks.readlock_chunk(chunk, state.token);
                org.add_chunk(chunk).is_err()
            };
            if full {
                return Outcome::close();
            }
        }
    }
    let mut replies = Vec::new();
    if let Some(message) = org.finish(proto::SNAPSHOT_READ_ORIGIN_OK) {
        replies.push((state.token, message));
    }
    if let Some(message) = snap.finish(proto::SNAPSHOT_READ_OK) {
        replies.push((state.token, message));
    }
    Outcome {
        replies,
        ..Outcome::default()
    }
}

fn finish_snapshot_read(locks: &mut LockTable, state: &mut SessionState, body: &[u8]) -> Outcome {
    let Ok(request) = proto::RwRequest::decode(body) else {
        return Outcome::close();
    };
    let mut replies = Vec::new();
    for range in &request.ranges {
        for offset in 0..u64::from(range.chunks) {
            for pending in locks.release_chunk(range.chunk + offset, state.token) {
                let inner = pending.lock();
                replies.push((inner.client, inner.message.clone()));
            }
        }
    }
    Outcome {
        replies,
        ..Outcome::default()
    }
}

fn identify(store: &mut SnapStore, state: &mut SessionState, body: &[u8]) -> Outcome {
    let Ok(request) = proto::Identify::decode(body) else {
        return Outcome::close();
    };

    state.id = request.id;
    state.using = true;
    if request.snap == ORIGIN_TAG {
        state.view = SessionView::Origin;
    } else {
        let Some(snapshot) = store.snapshot_by_tag_mut(request.snap) else {
            warn!(target: "snapstore::server", tag = request.snap, "snapshot tag is not valid");
            let error = proto::ErrorBody::new(
                proto::ERROR_INVALID_SNAPSHOT,
                format!("Snapshot tag {} is not valid", request.snap),
            );
            return Outcome::reply(state, proto::frame(proto::IDENTIFY_ERROR, &error.encode()));
        };
        let Some(new_usecount) = snapshot.usecount.checked_add(1) else {
            let error = proto::ErrorBody::new(proto::ERROR_USECOUNT, "Usecount overflow.");
            return Outcome::reply(state, proto::frame(proto::IDENTIFY_ERROR, &error.encode()));
        };
        snapshot.usecount = new_usecount;
        let bit = u32::from(snapshot.bit);
        state.view = SessionView::Snapshot(bit);
    }

    if request.len != store.image.orgsectors {
        let error = proto::ErrorBody::new(
            proto::ERROR_SIZE_MISMATCH,
            format!("volume size mismatch for snapshot {}", request.snap),
        );
        return Outcome::reply(state, proto::frame(proto::IDENTIFY_ERROR, &error.encode()));
    }
    if request.off != store.image.orgoffset {
        let error = proto::ErrorBody::new(
            proto::ERROR_OFFSET_MISMATCH,
            format!("volume offset mismatch for snapshot {}", request.snap),
        );
        return Outcome::reply(state, proto::frame(proto::IDENTIFY_ERROR, &error.encode()));
    }

    let chunksize_bits = store.snap_geometry().allocsize_bits();
    Outcome::reply(
        state,
        proto::frame(
            proto::IDENTIFY_OK,
            &proto::encode_identify_ok(chunksize_bits),
        ),
    )
}

fn create_snapshot(store: &mut SnapStore, state: &mut SessionState, body: &[u8]) -> Outcome {
    let Ok(tag) = proto::decode_tag(body) else {
        return Outcome::close();
    };
    match store.create_snapshot(tag) {
        Ok(_bit) => {
            if let Err(err) = store.save_state() {
                warn!(target: "snapstore::server", error = %err, "unable to save state");
            }
            Outcome::reply(state, proto::frame(proto::CREATE_SNAPSHOT_OK, &[]))
        }
        Err(err) => {
            warn!(target: "snapstore::server", tag, error = %err, "create snapshot failed");
            Outcome::reply(state, proto::frame(proto::CREATE_SNAPSHOT_ERROR, &[]))
        }
    }
}

fn delete_snapshot(store: &mut SnapStore, state: &mut SessionState, body: &[u8]) -> Outcome {
    let Ok(tag) = proto::decode_tag(body) else {
        return Outcome::close();
    };
    match store.delete_snapshot(tag) {
        Ok(()) => {
            if let Err(err) = store.save_state() {
                warn!(target: "snapstore::server", error = %err, "unable to save state");
            }
            Outcome::reply(state, proto::frame(proto::DELETE_SNAPSHOT_OK, &[]))
        }
        Err(err) => {
            warn!(target: "snapstore::server", tag, error = %err, "delete snapshot failed");
            Outcome::reply(state, proto::frame(proto::DELETE_SNAPSHOT_ERROR, &[]))
        }
    }
}

fn list_snapshots(store: &mut SnapStore, state: &mut SessionState) -> Outcome {
    let list: Vec<proto::SnapInfo> = store
        .image
        .snaplist
        .iter()
        .map(|snap| proto::SnapInfo {
            tag: snap.tag,
            prio: snap.prio,
            ctime: snap.ctime,
            usecount: snap.usecount,
        })
        .collect();
    Outcome::reply(
        state,
        proto::frame(proto::SNAPSHOT_LIST, &proto::encode_snapshot_list(&list)),
    )
}

fn priority(store: &mut SnapStore, state: &mut SessionState, body: &[u8]) -> Outcome {
    let Ok(request) = proto::PriorityRequest::decode(body) else {
        return Outcome::close();
    };
    if request.snap == ORIGIN_TAG {
        let error = proto::ErrorBody::new(
            proto::ERROR_INVALID_SNAPSHOT,
            "Can not set priority for origin",
        );
        return Outcome::reply(state, proto::frame(proto::PRIORITY_ERROR, &error.encode()));
    }
    let Some(snapshot) = store.snapshot_by_tag_mut(request.snap) else {
        warn!(target: "snapstore::server", tag = request.snap, "snapshot tag is not valid");
        let error = proto::ErrorBody::new(
            proto::ERROR_INVALID_SNAPSHOT,
            format!("Snapshot tag {} is not valid", request.snap),
        );
        return Outcome::reply(state, proto::frame(proto::PRIORITY_ERROR, &error.encode()));
    };
    snapshot.prio = request.prio;
    let prio = snapshot.prio;
    store.set_sb_dirty();
    Outcome::reply(
        state,
        proto::frame(proto::PRIORITY_OK, &proto::encode_priority_ok(prio)),
    )
}

fn usecount(store: &mut SnapStore, state: &mut SessionState, body: &[u8]) -> Outcome {
    let Ok(request) = proto::UsecountRequest::decode(body) else {
        return Outcome::close();
    };
    if request.snap == ORIGIN_TAG {
        let error = proto::ErrorBody::new(
            proto::ERROR_INVALID_SNAPSHOT,
            "Setting the usecount of the origin.",
        );
        return Outcome::reply(state, proto::frame(proto::USECOUNT_ERROR, &error.encode()));
    }
    let Some(snapshot) = store.snapshot_by_tag_mut(request.snap) else {
        let error = proto::ErrorBody::new(
            proto::ERROR_INVALID_SNAPSHOT,
            format!("Snapshot tag {} is not valid", request.snap),
        );
        return Outcome::reply(state, proto::frame(proto::USECOUNT_ERROR, &error.encode()));
    };
    let new_usecount = i64::from(snapshot.usecount) + i64::from(request.delta);
    if new_usecount > 0xffff {
        let error = proto::ErrorBody::new(proto::ERROR_USECOUNT, "Usecount overflow.");
        return Outcome::reply(state, proto::frame(proto::USECOUNT_ERROR, &error.encode()));
    }
    if new_usecount < 0 {
        let error = proto::ErrorBody::new(proto::ERROR_USECOUNT, "Usecount underflow.");
        return Outcome::reply(state, proto::frame(proto::USECOUNT_ERROR, &error.encode()));
    }
    snapshot.usecount = new_usecount as u32;
    let usecount = snapshot.usecount;
    store.set_sb_dirty();
    Outcome::reply(
        state,
        proto::frame(proto::USECOUNT_OK, &proto::encode_usecount_ok(usecount)),
    )
}

fn status(store: &mut SnapStore, state: &mut SessionState, body: &[u8]) -> Outcome {
    let Ok(tag) = proto::decode_tag(body) else {
        return Outcome::close();
    };
    let num_rows = store.max_snapbit() as usize + 1;
    let table = match store.calc_sharing(num_rows) {
        Ok(table) => table,
        Err(err) => {
            warn!(target: "snapstore::server", error = %err, "unable to compute sharing table");
            let body = b"unable to compute sharing table\0".to_vec();
            return Outcome::reply(state, proto::frame(proto::STATUS_ERROR, &body));
        }
    };

    let snapshots: Vec<proto::SnapStatus> = store
        .image
        .snaplist
        .iter()
        .filter(|snap| tag == ORIGIN_TAG || snap.tag == tag)
        .map(|snap| proto::SnapStatus {
            ctime: snap.ctime,
            tag: snap.tag,
            chunk_counts: table[usize::from(snap.bit)].clone(),
        })
        .collect();

    let meta = store.asi(snapstore_core::Space::Meta);
    let reply = proto::StatusReply {
        ctime: store.image.create_time,
        meta: proto::SpaceUsage {
            chunksize_bits: store.meta_geometry().allocsize_bits(),
            used: store.image.meta_chunks_used,
            free: meta.freechunks,
        },
        store: proto::SpaceUsage {
            chunksize_bits: store.snap_geometry().allocsize_bits(),
            used: store.image.snap_chunks_used,
            free: store.asi(snapstore_core::Space::Snap).freechunks,
        },
        write_density: 0,
        num_columns: num_rows as u32,
        snapshots,
    };
    Outcome::reply(state, proto::frame(proto::STATUS_OK, &reply.encode()))
}

fn stream_changelist(store: &mut SnapStore, state: &mut SessionState, body: &[u8]) -> Outcome {
    let Ok(request) = proto::ChangelistRequest::decode(body) else {
        return Outcome::close();
    };
    let bits = (
        store.snapshot_by_tag(request.snap1).map(|snap| snap.bit),
        store.snapshot_by_tag(request.snap2).map(|snap| snap.bit),
    );
    let (Some(bit1), Some(bit2)) = bits else {
        let message = b"invalid snapshot tag\0".to_vec();
        return Outcome::reply(
            state,
            proto::frame(proto::STREAM_CHANGELIST_ERROR, &message),
        );
    };
    let chunks = match store.gen_changelist(u32::from(bit1), u32::from(bit2)) {
        Ok(chunks) => chunks,
        Err(err) => {
            warn!(target: "snapstore::server", error = %err, "unable to generate changelist");
            let message = b"unable to generate changelist\0".to_vec();
            return Outcome::reply(
                state,
                proto::frame(proto::STREAM_CHANGELIST_ERROR, &message),
            );
        }
    };

    let header = proto::ChangelistStream {
        count: chunks.len() as u64,
        chunksize_bits: store.snap_geometry().allocsize_bits(),
    };
    // The chunk addresses stream raw after the framed header.
    let mut message = proto::frame(proto::STREAM_CHANGELIST_OK, &header.encode());
    for chunk in chunks {
        message.extend_from_slice(&chunk.to_le_bytes());
    }
    Outcome::reply(state, message)
}
