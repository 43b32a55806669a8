//! Server-side cursor plumbing
//!
//! A [`BatchCursor`] holds one batch of raw documents and fetches the next
//! with `getMore` on the server that created it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Document};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use causeway_common::error::Result;
use causeway_common::types::{CursorId, Namespace, ServerAddress};

use crate::client::Client;
use crate::context::Context;
use crate::executor::ExecutionOutput;
use crate::operation::{kill_cursors_command, CommandKind, Operation};
use crate::reply::CursorReply;
use crate::session::ClientSession;
use crate::topology::Server;

/// The session a cursor runs its `getMore`s with
#[derive(Debug, Clone)]
pub(crate) enum CursorSession {
    /// Borrowed from the caller; never ended by the cursor
    Explicit(ClientSession),
    /// Created for the operation that opened the cursor; released on exhaustion
    Implicit(ClientSession),
}

impl CursorSession {
    fn session(&self) -> &ClientSession {
        match self {
            CursorSession::Explicit(s) | CursorSession::Implicit(s) => s,
        }
    }
}

/// Options carried on every `getMore`
#[derive(Debug, Clone, Default)]
pub struct CursorOptions {
    pub batch_size: Option<u32>,
    /// Sent as `maxTimeMS` on `getMore` for tailable-await cursors
    pub max_await_time: Option<Duration>,
}

pub struct BatchCursor {
    client: Client,
    server: Arc<dyn Server>,
    namespace: Namespace,
    id: CursorId,
    batch: VecDeque<Document>,
    post_batch_resume_token: Option<Document>,
    options: CursorOptions,
    session: Option<CursorSession>,
    closed: bool,
}

impl std::fmt::Debug for BatchCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCursor")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("buffered", &self.batch.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl BatchCursor {
    pub(crate) fn new(
        client: Client,
        server: Arc<dyn Server>,
        reply: CursorReply,
        namespace: Namespace,
        session: Option<CursorSession>,
        options: CursorOptions,
    ) -> Self {
        let mut cursor = Self {
            client,
            server,
            namespace: reply.namespace.unwrap_or(namespace),
            id: reply.id,
            batch: reply.batch,
            post_batch_resume_token: reply.post_batch_resume_token,
            options,
            session,
            closed: false,
        };
        cursor.release_session_if_exhausted();
        cursor
    }

    /// Build a cursor from the reply of the `find`/`aggregate` that opened it.
    /// An implicit session created for that command moves into the cursor.
    pub(crate) fn from_output(
        client: &Client,
        output: ExecutionOutput,
        namespace: Namespace,
        explicit_session: Option<&ClientSession>,
        options: CursorOptions,
    ) -> Result<Self> {
        let reply = CursorReply::parse(&output.reply)?;
        let session = match (explicit_session, output.implicit_session) {
            (Some(session), _) => Some(CursorSession::Explicit(session.clone())),
            (None, Some(session)) => Some(CursorSession::Implicit(session)),
            (None, None) => None,
        };
        Ok(Self::new(
            client.clone(),
            output.server,
            reply,
            namespace,
            session,
            options,
        ))
    }

    pub fn id(&self) -> CursorId {
        self.id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn server_address(&self) -> ServerAddress {
        self.server.address()
    }

    /// No server-side resources remain
    pub fn is_exhausted(&self) -> bool {
        self.id == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Documents buffered from the last reply
    pub fn batch(&self) -> &VecDeque<Document> {
        &self.batch
    }

    pub(crate) fn take_next(&mut self) -> Option<Document> {
        self.batch.pop_front()
    }

    pub fn post_batch_resume_token(&self) -> Option<&Document> {
        self.post_batch_resume_token.as_ref()
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref().map(CursorSession::session)
    }

    /// Fetch batches until one is non-empty. Returns `false` once the cursor is exhausted.
    pub async fn advance(&mut self, ctx: &Context) -> Result<bool> {
        loop {
            if !self.batch.is_empty() {
                return Ok(true);
            }
            if self.is_exhausted() || self.closed {
                return Ok(false);
            }
            self.get_more(ctx).await?;
        }
    }

    /// Like [`advance`](Self::advance) but sends at most one `getMore`
    pub async fn try_advance(&mut self, ctx: &Context) -> Result<bool> {
        if !self.batch.is_empty() {
            return Ok(true);
        }
        if self.is_exhausted() || self.closed {
            return Ok(false);
        }
        self.get_more(ctx).await?;
        Ok(!self.batch.is_empty())
    }

    async fn get_more(&mut self, ctx: &Context) -> Result<()> {
        let mut cmd = doc! {
            "getMore": self.id,
            "collection": self.namespace.coll.clone(),
        };
        if let Some(batch_size) = self.options.batch_size {
            cmd.insert("batchSize", i64::from(batch_size));
        }
        if let Some(max_await_time) = self.options.max_await_time {
            cmd.insert(
                "maxTimeMS",
                i64::try_from(max_await_time.as_millis()).unwrap_or(i64::MAX),
            );
        }

        let op = Operation::new(CommandKind::GetMore, self.namespace.db.clone(), cmd);
        let session = self.session.as_ref().map(CursorSession::session);
        let (reply, _) = self
            .client
            .execute_on_server(ctx, &op, &self.server, session)
            .await?;

        let reply = CursorReply::parse(&reply)?;
        self.id = reply.id;
        self.batch = reply.batch;
        self.post_batch_resume_token = reply.post_batch_resume_token;
        debug!(cursor_id = self.id, batch = self.batch.len(), "getMore");
        self.release_session_if_exhausted();
        Ok(())
    }

    /// Drop an owned implicit session as soon as the server side is gone
    fn release_session_if_exhausted(&mut self) {
        if self.is_exhausted() && matches!(self.session, Some(CursorSession::Implicit(_))) {
            self.session = None;
        }
    }

    /// Kill the server-side cursor if one remains and release local state.
    /// `killCursors` failures are logged and ignored.
    pub async fn close(&mut self, ctx: &Context) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.batch.clear();

        if !self.is_exhausted() {
            let session = self.session.as_ref().map(CursorSession::session);
            if let Err(err) =
                kill_cursor(&self.client, ctx, &self.server, &self.namespace, self.id, session).await
            {
                warn!(cursor_id = self.id, error = %err, "killCursors failed, ignoring");
            }
            self.id = 0;
        }
        if matches!(self.session, Some(CursorSession::Implicit(_))) {
            self.session = None;
        }
    }
}

async fn kill_cursor(
    client: &Client,
    ctx: &Context,
    server: &Arc<dyn Server>,
    namespace: &Namespace,
    id: CursorId,
    session: Option<&ClientSession>,
) -> Result<()> {
    let op = Operation::new(
        CommandKind::KillCursors,
        namespace.db.clone(),
        kill_cursors_command(&namespace.coll, id),
    );
    client.execute_on_server(ctx, &op, server, session).await?;
    Ok(())
}

impl Drop for BatchCursor {
    fn drop(&mut self) {
        if self.closed || self.is_exhausted() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };

        let client = self.client.clone();
        let server = Arc::clone(&self.server);
        let namespace = self.namespace.clone();
        let id = self.id;
        let session = self.session.take();
        handle.spawn(async move {
            let session = session.as_ref().map(CursorSession::session);
            let ctx = Context::background();
            if let Err(err) = kill_cursor(&client, &ctx, &server, &namespace, id, session).await {
                debug!(cursor_id = id, error = %err, "killCursors on drop failed");
            }
        });
    }
}
