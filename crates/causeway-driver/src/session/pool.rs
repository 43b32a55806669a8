//! Server session pool
//!
//! Server sessions are reused most-recently-used first so the least recently
//! used ones age out at the back of the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bson::{doc, spec::BinarySubtype, Binary, Document};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use causeway_common::metrics;
use causeway_common::types::TxnNumber;

/// Server-side state of a logical session
#[derive(Debug)]
pub struct ServerSession {
    id: Uuid,
    lsid: Document,
    last_use: Instant,
    txn_number: TxnNumber,
    dirty: bool,
}

impl ServerSession {
    fn new() -> Self {
        let id = Uuid::new_v4();
        let lsid = doc! {
            "id": Binary {
                subtype: BinarySubtype::Uuid,
                bytes: id.as_bytes().to_vec(),
            }
        };
        Self {
            id,
            lsid,
            last_use: Instant::now(),
            txn_number: 0,
            dirty: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `{ id: <UUID binary> }`, sent as `lsid`
    pub fn lsid(&self) -> &Document {
        &self.lsid
    }

    pub fn txn_number(&self) -> TxnNumber {
        self.txn_number
    }

    pub(crate) fn increment_txn_number(&mut self) -> TxnNumber {
        self.txn_number += 1;
        self.txn_number
    }

    pub(crate) fn touch(&mut self) {
        self.last_use = Instant::now();
    }

    /// A network error leaves the server-side session in an unknown state
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn is_expired(&self, timeout: Option<Duration>, margin: Duration) -> bool {
        match timeout {
            Some(timeout) => self.last_use.elapsed() + margin >= timeout,
            None => false,
        }
    }
}

/// Pool of idle server sessions shared by every session of a client
#[derive(Debug)]
pub struct ServerSessionPool {
    idle: Mutex<VecDeque<ServerSession>>,
    checked_out: AtomicUsize,
    expiry_margin: Duration,
}

impl ServerSessionPool {
    pub fn new(expiry_margin: Duration) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            checked_out: AtomicUsize::new(0),
            expiry_margin,
        }
    }

    /// Reuse the most recently returned live session, or allocate a new one
    pub fn check_out(&self, logical_session_timeout: Option<Duration>) -> ServerSession {
        let reused = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(session) = idle.pop_front() {
                if !session.is_expired(logical_session_timeout, self.expiry_margin) {
                    found = Some(session);
                    break;
                }
            }
            found
        };

        let session = reused.unwrap_or_else(|| {
            debug!("allocating new server session");
            ServerSession::new()
        });

        let count = self.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_sessions_checked_out(count);
        session
    }

    /// Return a session. Dirty and expired sessions are discarded.
    pub fn check_in(&self, session: ServerSession, logical_session_timeout: Option<Duration>) {
        let count = self.checked_out.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_sessions_checked_out(count);

        let mut idle = self.idle.lock();
        while idle
            .back()
            .is_some_and(|s| s.is_expired(logical_session_timeout, self.expiry_margin))
        {
            idle.pop_back();
        }

        if session.is_dirty() {
            debug!(session_id = %session.id, "discarding dirty server session");
            return;
        }
        if session.is_expired(logical_session_timeout, self.expiry_margin) {
            return;
        }
        idle.push_front(session);
    }

    /// Sessions currently held by client sessions
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }

    /// Idle sessions available for reuse
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl Default for ServerSessionPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
