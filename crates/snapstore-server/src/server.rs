//! Single-threaded poll server over a Unix-domain socket.
//!
//! One `mio` poll set multiplexes the listen socket, the signal pipe and up
//! to 100 client streams. All engine work happens inline on this thread;
//! replies that cannot be written immediately queue per session, and origin
//! writes blocked on snapshot read locks park in the lock table rather than
//! blocking the loop.

use crate::dispatch::{dispatch, SessionState, SessionView};
use crate::locks::{LockTable, SNAPLOCK_HASH_BITS};
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v0_8::Signals;
use snapstore_core::SnapStore;
use snapstore_error::{Result, SnapError};
use snapstore_proto as proto;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

const LISTENER: Token = Token(0);
const SIGNALS: Token = Token(1);
const FIRST_CLIENT: usize = 2;
const MAX_CLIENTS: usize = 100;

struct Session {
    stream: UnixStream,
    state: SessionState,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
}

pub struct Server {
    poll: Poll,
    listener: UnixListener,
    signals: Signals,
    store: SnapStore,
    locks: LockTable,
    sessions: HashMap<usize, Session>,
    next_token: usize,
    shutdown: bool,
}

impl Server {
    /// Bind the server socket and activate the store: a busy flag left set
    /// by a dead server forces journal replay before anything is served.
    pub fn bind(mut store: SnapStore, socket_path: &Path) -> Result<Self> {
        if store.busy() {
            warn!(target: "snapstore::server", "server was not shut down properly");
            store.recover_journal()?;
            store.save_state()?;
        } else {
            store.set_busy(true);
            store.save_sb()?;
        }

        let _ = std::fs::remove_file(socket_path);
        let mut listener = UnixListener::bind(socket_path)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        poll.registry()
            .register(&mut signals, SIGNALS, Interest::READABLE)?;
        info!(
            target: "snapstore::server",
            socket = %socket_path.display(),
            "snapshot server bound to socket"
        );
        Ok(Self {
            poll,
            listener,
            signals,
            store,
            locks: LockTable::new(SNAPLOCK_HASH_BITS),
            sessions: HashMap::new(),
            next_token: FIRST_CLIENT,
            shutdown: false,
        })
    }

    /// Serve until a `SHUTDOWN_SERVER` message or a termination signal.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(128);
        while !self.shutdown {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(SnapError::Io(err));
            }
            let mut touched = Vec::with_capacity(events.iter().count());
            for event in &events {
                touched.push((event.token(), event.is_writable()));
            }
            for (token, writable) in touched {
                match token {
                    LISTENER => self.accept_clients()?,
                    SIGNALS => self.handle_signals()?,
                    Token(token) => {
                        if writable {
                            self.try_flush(token)?;
                        }
                        self.handle_client(token)?;
                        if self.shutdown {
                            break;
                        }
                    }
                }
            }
        }
        self.store.cleanup()
    }

    fn accept_clients(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    if self.sessions.len() >= MAX_CLIENTS {
                        warn!(target: "snapstore::server", "too many clients, dropping connection");
                        continue;
                    }
                    let token = self.next_token;
                    self.next_token += 1;
                    self.poll.registry().register(
                        &mut stream,
                        Token(token),
                        Interest::READABLE,
                    )?;
                    debug!(target: "snapstore::server", token, "received connection");
                    self.sessions.insert(
                        token,
                        Session {
                            stream,
                            state: SessionState::new(token),
                            inbuf: Vec::new(),
                            outbuf: Vec::new(),
                        },
                    );
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(SnapError::Io(err)),
            }
        }
    }

    fn handle_signals(&mut self) -> Result<()> {
        let pending: Vec<i32> = self.signals.pending().collect();
        for signal in pending {
            warn!(
                target: "snapstore::server",
                signal,
                "cleaning up before server dies"
            );
            self.store.cleanup()?;
            // Re-raise so the process reports the true cause of death.
            let _ = signal_hook::low_level::emulate_default_handler(signal);
            self.shutdown = true;
        }
        Ok(())
    }

    fn handle_client(&mut self, token: usize) -> Result<()> {
        let mut closed = false;
        {
            let Some(session) = self.sessions.get_mut(&token) else {
                return Ok(());
            };
            let mut tmp = [0_u8; 8192];
            loop {
                match session.stream.read(&mut tmp) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => session.inbuf.extend_from_slice(&tmp[..n]),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => {}
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        loop {
            let frame = {
                let Some(session) = self.sessions.get_mut(&token) else {
                    return Ok(());
                };
                if session.inbuf.len() < proto::HEAD_SIZE {
                    None
                } else {
                    let (code, length) = proto::parse_head(&session.inbuf[..proto::HEAD_SIZE])?;
                    if length > proto::MAX_BODY {
                        warn!(
                            target: "snapstore::server",
                            code = format_args!("{code:#x}"),
                            length,
                            "message too long, disconnecting client"
                        );
                        self.close_session(token)?;
                        return Ok(());
                    }
                    if session.inbuf.len() < proto::HEAD_SIZE + length {
                        None
                    } else {
                        let body =
                            session.inbuf[proto::HEAD_SIZE..proto::HEAD_SIZE + length].to_vec();
                        session.inbuf.drain(..proto::HEAD_SIZE + length);
                        Some((code, body))
                    }
                }
            };
            let Some((code, body)) = frame else { break };

            let mut state = match self.sessions.get(&token) {
                Some(session) => session.state.clone(),
                None => return Ok(()),
            };
            let outcome = dispatch(&mut self.store, &mut self.locks, &mut state, code, &body);
            if let Some(session) = self.sessions.get_mut(&token) {
                session.state = state;
            }
            for (target, message) in outcome.replies {
                self.queue_reply(target, &message)?;
            }
            if outcome.shutdown {
                info!(target: "snapstore::server", "shutdown requested");
                self.shutdown = true;
                return Ok(());
            }
            if outcome.close {
                self.close_session(token)?;
                return Ok(());
            }
        }

        if closed {
            self.close_session(token)?;
        }
        Ok(())
    }

    fn queue_reply(&mut self, token: usize, message: &[u8]) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&token) else {
            // The client went away while its reply was parked.
            return Ok(());
        };
        session.outbuf.extend_from_slice(message);
        self.try_flush(token)
    }

    fn try_flush(&mut self, token: usize) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&token) else {
            return Ok(());
        };
        let mut written = 0;
        while written < session.outbuf.len() {
            match session.stream.write(&session.outbuf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(target: "snapstore::server", token, error = %err, "write failed");
                    session.outbuf.clear();
                    written = 0;
                    break;
                }
            }
        }
        session.outbuf.drain(..written);
        let interest = if session.outbuf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        self.poll
            .registry()
            .reregister(&mut session.stream, Token(token), interest)?;
        Ok(())
    }

    fn close_session(&mut self, token: usize) -> Result<()> {
        let Some(mut session) = self.sessions.remove(&token) else {
            return Ok(());
        };
        let _ = self.poll.registry().deregister(&mut session.stream);
        info!(
            target: "snapstore::server",
            token,
            id = session.state.id,
            "client disconnected"
        );

        // Wake any origin writes this reader was blocking.
        let ready = self.locks.release_client(token);
        for pending in ready {
            let (client, message) = {
                let inner = pending.lock();
                (inner.client, inner.message.clone())
            };
            self.queue_reply(client, &message)?;
        }

        if session.state.using {
            if let SessionView::Snapshot(bit) = session.state.view {
                match self.store.snapshot_by_bit_mut(bit) {
                    Some(snapshot) => {
                        if snapshot.usecount == 0 {
                            warn!(target: "snapstore::server", bit, "usecount underflow");
                        } else {
                            snapshot.usecount -= 1;
                        }
                        self.store.set_sb_dirty();
                    }
                    None => {
                        warn!(target: "snapstore::server", bit, "snapshot bit is not valid");
                    }
                }
            }
        }
        self.store.save_state()
    }
}
