//! Change streams
//!
//! A [`ChangeStream`] is an `aggregate` cursor with a leading `$changeStream`
//! stage. It remembers the resume token of the last event it returned and,
//! when a `getMore` fails with a resumable error, reopens the stream once from
//! that token.

use std::marker::PhantomData;
use std::time::Duration;

use bson::{doc, Bson, Document, Timestamp};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use causeway_common::error::{ChangeStreamError, Result};
use causeway_common::metrics;
use causeway_common::types::{Namespace, ReadPreference};

use crate::client::Client;
use crate::context::Context;
use crate::cursor::{BatchCursor, CursorOptions};
use crate::operation::{CommandKind, Operation};
use crate::session::ClientSession;
use crate::topology::ServerSelector;

/// What a change stream watches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeStreamTarget {
    Collection(Namespace),
    Database(String),
    /// Every database; the aggregate runs against `admin`
    Cluster,
}

impl ChangeStreamTarget {
    fn db(&self) -> &str {
        match self {
            ChangeStreamTarget::Collection(ns) => &ns.db,
            ChangeStreamTarget::Database(db) => db,
            ChangeStreamTarget::Cluster => "admin",
        }
    }

    /// Value of the `aggregate` field
    fn aggregate_target(&self) -> Bson {
        match self {
            ChangeStreamTarget::Collection(ns) => Bson::String(ns.coll.clone()),
            ChangeStreamTarget::Database(_) | ChangeStreamTarget::Cluster => Bson::Int32(1),
        }
    }

    fn namespace(&self) -> Namespace {
        match self {
            ChangeStreamTarget::Collection(ns) => ns.clone(),
            _ => Namespace::new(self.db(), "$cmd.aggregate"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOptions {
    /// `"updateLookup"`, `"whenAvailable"` or `"required"`
    pub full_document: Option<String>,
    pub resume_after: Option<Document>,
    pub start_after: Option<Document>,
    pub start_at_operation_time: Option<Timestamp>,
    /// Sent as `maxTimeMS` on every `getMore`
    pub max_await_time: Option<Duration>,
    pub batch_size: Option<u32>,
    /// Defaults to the client's read preference
    pub read_preference: Option<ReadPreference>,
}

pub struct ChangeStream<T = Document> {
    client: Client,
    target: ChangeStreamTarget,
    pipeline: Vec<Document>,
    options: ChangeStreamOptions,
    /// Explicit session handle, or the implicit session of the first aggregate
    session: Option<ClientSession>,
    cursor: Option<BatchCursor>,
    resume_token: Option<Document>,
    initial_operation_time: Option<Timestamp>,
    current: Option<Document>,
    closed: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for ChangeStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("target", &self.target)
            .field("resume_token", &self.resume_token)
            .field("cursor", &self.cursor)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<T> ChangeStream<T>
where
    T: DeserializeOwned,
{
    /// Run the initial aggregate. Its errors are returned as-is, never resumed.
    pub(crate) async fn open(
        ctx: &Context,
        client: Client,
        target: ChangeStreamTarget,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
        session: Option<&ClientSession>,
    ) -> Result<Self> {
        let mut stream = Self {
            client,
            target,
            pipeline,
            options,
            session: session.cloned(),
            cursor: None,
            resume_token: None,
            initial_operation_time: None,
            current: None,
            closed: false,
            _marker: PhantomData,
        };

        let cursor = stream.aggregate(ctx, false).await?;
        stream.resume_token = match cursor.post_batch_resume_token() {
            Some(pbrt) if cursor.batch().is_empty() => Some(pbrt.clone()),
            _ => stream
                .options
                .start_after
                .clone()
                .or_else(|| stream.options.resume_after.clone()),
        };
        stream.cursor = Some(cursor);
        info!(target = ?stream.target, "change stream opened");
        Ok(stream)
    }

    fn selector(&self) -> ServerSelector {
        ServerSelector::Read(
            self.options
                .read_preference
                .unwrap_or(self.client.config().client.read_preference),
        )
    }

    /// Options of the `$changeStream` stage. A resume with no token restarts at
    /// the initial operation time, which the executor adds once it knows the server.
    fn change_stream_stage(&self, resuming: bool) -> Document {
        let mut stage = Document::new();
        if let Some(full_document) = &self.options.full_document {
            stage.insert("fullDocument", full_document.clone());
        }
        if self.target == ChangeStreamTarget::Cluster {
            stage.insert("allChangesForCluster", true);
        }

        if resuming {
            if let Some(token) = &self.resume_token {
                stage.insert("resumeAfter", token.clone());
            }
        } else {
            if let Some(token) = &self.options.resume_after {
                stage.insert("resumeAfter", token.clone());
            }
            if let Some(token) = &self.options.start_after {
                stage.insert("startAfter", token.clone());
            }
            if let Some(ts) = self.options.start_at_operation_time {
                stage.insert("startAtOperationTime", ts);
            }
        }
        stage
    }

    async fn aggregate(&mut self, ctx: &Context, resuming: bool) -> Result<BatchCursor> {
        let mut pipeline = vec![Bson::Document(doc! {
            "$changeStream": self.change_stream_stage(resuming),
        })];
        pipeline.extend(self.pipeline.iter().cloned().map(Bson::Document));

        let mut cursor_doc = Document::new();
        if let Some(batch_size) = self.options.batch_size {
            cursor_doc.insert("batchSize", i64::from(batch_size));
        }
        let cmd = doc! {
            "aggregate": self.target.aggregate_target(),
            "pipeline": pipeline,
            "cursor": cursor_doc,
        };

        let mut op = Operation::new(CommandKind::Aggregate, self.target.db(), cmd)
            .with_selector(self.selector())
            .with_read_concern(self.client.config().client.read_concern.clone());
        if resuming && self.resume_token.is_none() {
            let min_wire_version = self
                .client
                .config()
                .change_stream
                .start_at_operation_time_min_wire_version;
            op.start_at_operation_time = self.initial_operation_time.map(|ts| (ts, min_wire_version));
        }

        let mut output = self
            .client
            .execute_operation(ctx, op, self.session.as_ref())
            .await?;
        if self.session.is_none() {
            self.session = output.implicit_session.take();
        }
        if !resuming {
            self.initial_operation_time = self
                .options
                .start_at_operation_time
                .or(output.header.operation_time);
        }

        BatchCursor::from_output(
            &self.client,
            output,
            self.target.namespace(),
            self.session.as_ref(),
            CursorOptions {
                batch_size: self.options.batch_size,
                max_await_time: self.options.max_await_time,
            },
        )
    }

    /// Wait for the next event. Returns `None` only once the server has
    /// closed the stream.
    pub async fn next(&mut self, ctx: &Context) -> Result<Option<T>> {
        loop {
            if let Some(event) = self.try_next(ctx).await? {
                return Ok(Some(event));
            }
            if !self.is_alive() {
                return Ok(None);
            }
        }
    }

    /// Return a buffered event or send at most one `getMore` (plus one resume).
    /// A closed stream yields `None`; the error that closed it is returned once.
    pub async fn try_next(&mut self, ctx: &Context) -> Result<Option<T>> {
        if self.closed {
            return Ok(None);
        }
        ctx.check()?;

        match self.next_document(ctx).await? {
            Some(event) => {
                let decoded = bson::from_document(event.clone())?;
                self.current = Some(event);
                Ok(Some(decoded))
            }
            None => {
                self.current = None;
                Ok(None)
            }
        }
    }

    async fn next_document(&mut self, ctx: &Context) -> Result<Option<Document>> {
        let needs_batch = self
            .cursor
            .as_ref()
            .is_some_and(|c| c.batch().is_empty() && !c.is_exhausted());

        if needs_batch {
            let result = match self.cursor.as_mut() {
                Some(cursor) => cursor.try_advance(ctx).await,
                None => Ok(false),
            };
            if let Err(err) = result {
                let denylist = &self.client.config().change_stream.non_resumable_codes;
                if err.is_context_error() || !err.is_resumable(denylist) {
                    return Err(err);
                }
                debug!(error = %err, "change stream getMore failed, resuming");
                if let Err(resume_err) = self.resume(ctx).await {
                    self.close(ctx).await;
                    return Err(resume_err);
                }
            }
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return Err(ChangeStreamError::Closed.into());
        };
        let Some(event) = cursor.take_next() else {
            if let Some(pbrt) = cursor.post_batch_resume_token() {
                self.resume_token = Some(pbrt.clone());
            }
            return Ok(None);
        };

        let token = match event.get("_id") {
            Some(Bson::Document(token)) => token.clone(),
            _ => {
                self.close(ctx).await;
                return Err(ChangeStreamError::MissingResumeToken.into());
            }
        };
        self.resume_token = match cursor.post_batch_resume_token() {
            Some(pbrt) if cursor.batch().is_empty() => Some(pbrt.clone()),
            _ => Some(token),
        };
        Ok(Some(event))
    }

    /// Kill the old cursor, ignoring errors, and reopen from the last token
    async fn resume(&mut self, ctx: &Context) -> Result<()> {
        if let Some(mut old) = self.cursor.take() {
            old.close(ctx).await;
        }
        metrics::record_change_stream_resume();
        info!(resume_token = ?self.resume_token, "resuming change stream");
        let cursor = self.aggregate(ctx, true).await?;
        self.cursor = Some(cursor);
        Ok(())
    }

    /// Token to pass as `resumeAfter` to continue after the last returned event
    pub fn resume_token(&self) -> Option<&Document> {
        self.resume_token.as_ref()
    }

    /// The raw event last returned
    pub fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    pub fn is_alive(&self) -> bool {
        !self.closed && self.cursor.as_ref().is_some_and(|c| !c.is_exhausted())
    }

    /// Close the stream and its cursor. Errors are logged, never returned.
    pub async fn close(&mut self, ctx: &Context) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current = None;
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close(ctx).await;
        }
        if self.session.as_ref().is_some_and(ClientSession::is_implicit) {
            self.session = None;
        }
        debug!(target = ?self.target, "change stream closed");
    }
}
