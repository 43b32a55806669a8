//! Database and collection handles
//!
//! Thin CRUD marshaling over the executor: each method builds one command
//! document, picks its retry class and hands it off. Single-document writes
//! are retryable; multi-document writes are not.

use std::marker::PhantomData;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use serde::de::DeserializeOwned;
use serde::Serialize;

use causeway_common::error::Result;
use causeway_common::types::{Namespace, ReadConcern, ReadPreference, WriteConcern};

use crate::change_stream::{ChangeStream, ChangeStreamOptions, ChangeStreamTarget};
use crate::client::Client;
use crate::context::Context;
use crate::cursor::{BatchCursor, Cursor, CursorOptions};
use crate::executor::ExecutionOutput;
use crate::operation::{CommandKind, Operation, Retryability};
use crate::reply::WriteReply;
use crate::session::ClientSession;
use crate::topology::ServerSelector;

// ============================================================================
// Database
// ============================================================================

#[derive(Debug, Clone)]
pub struct Database {
    client: Client,
    name: String,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn collection<T>(&self, name: &str) -> Collection<T> {
        Collection {
            client: self.client.clone(),
            namespace: Namespace::new(self.name.clone(), name),
            options: CollectionOptions::default(),
            _marker: PhantomData,
        }
    }

    /// Run an arbitrary command against this database. Never retried.
    pub async fn run_command(
        &self,
        ctx: &Context,
        command: Document,
        session: Option<&ClientSession>,
    ) -> Result<Document> {
        let op = Operation::new(CommandKind::Other, self.name.clone(), command);
        let output = self.client.execute_operation(ctx, op, session).await?;
        Ok(output.reply)
    }

    /// Watch every collection in this database
    pub async fn watch(
        &self,
        ctx: &Context,
        pipeline: Vec<Document>,
        options: Option<ChangeStreamOptions>,
        session: Option<&ClientSession>,
    ) -> Result<ChangeStream> {
        ChangeStream::open(
            ctx,
            self.client.clone(),
            ChangeStreamTarget::Database(self.name.clone()),
            pipeline,
            options.unwrap_or_default(),
            session,
        )
        .await
    }
}

// ============================================================================
// Options and Results
// ============================================================================

/// Per-collection overrides of the client defaults
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub read_preference: Option<ReadPreference>,
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Bson,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Bson>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

fn count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or_default()
}

// ============================================================================
// Collection
// ============================================================================

pub struct Collection<T = Document> {
    client: Client,
    namespace: Namespace,
    options: CollectionOptions,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            options: self.options.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.namespace)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<T> Collection<T> {
    #[must_use]
    pub fn with_options(mut self, options: CollectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn read_preference(&self) -> ReadPreference {
        self.options
            .read_preference
            .unwrap_or(self.client.config().client.read_preference)
    }

    fn read_concern(&self) -> Option<ReadConcern> {
        self.options
            .read_concern
            .clone()
            .or_else(|| self.client.config().client.read_concern.clone())
    }

    fn write_concern(&self) -> Option<WriteConcern> {
        self.options
            .write_concern
            .clone()
            .or_else(|| self.client.config().client.write_concern.clone())
    }

    fn read_op(&self, kind: CommandKind, cmd: Document) -> Operation {
        Operation::new(kind, self.namespace.db.clone(), cmd)
            .with_selector(ServerSelector::Read(self.read_preference()))
            .with_read_concern(self.read_concern())
    }

    fn write_op(&self, kind: CommandKind, cmd: Document, retryability: Retryability) -> Operation {
        Operation::new(kind, self.namespace.db.clone(), cmd)
            .with_retryability(retryability)
            .with_write_concern(self.write_concern())
    }

    async fn write(
        &self,
        ctx: &Context,
        op: Operation,
        session: Option<&ClientSession>,
    ) -> Result<WriteReply> {
        let output = self.client.execute_operation(ctx, op, session).await?;
        Ok(WriteReply::parse(&output.reply))
    }

    fn cursor<D: DeserializeOwned>(
        &self,
        output: ExecutionOutput,
        session: Option<&ClientSession>,
        batch_size: Option<u32>,
    ) -> Result<Cursor<D>> {
        let inner = BatchCursor::from_output(
            &self.client,
            output,
            self.namespace.clone(),
            session,
            CursorOptions {
                batch_size,
                max_await_time: None,
            },
        )?;
        Ok(Cursor::new(inner))
    }

    /// Run an aggregation pipeline over the collection
    pub async fn aggregate(
        &self,
        ctx: &Context,
        pipeline: Vec<Document>,
        session: Option<&ClientSession>,
    ) -> Result<Cursor<Document>> {
        let cmd = doc! {
            "aggregate": self.namespace.coll.clone(),
            "pipeline": pipeline,
            "cursor": {},
        };
        let op = self.read_op(CommandKind::Aggregate, cmd);
        let output = self.client.execute_operation(ctx, op, session).await?;
        self.cursor(output, session, None)
    }

    pub async fn watch(
        &self,
        ctx: &Context,
        pipeline: Vec<Document>,
        options: Option<ChangeStreamOptions>,
        session: Option<&ClientSession>,
    ) -> Result<ChangeStream> {
        ChangeStream::open(
            ctx,
            self.client.clone(),
            ChangeStreamTarget::Collection(self.namespace.clone()),
            pipeline,
            options.unwrap_or_default(),
            session,
        )
        .await
    }

    pub async fn update_one(
        &self,
        ctx: &Context,
        filter: Document,
        update: Document,
        session: Option<&ClientSession>,
    ) -> Result<UpdateResult> {
        self.update(ctx, filter, Bson::Document(update), false, session).await
    }

    /// Not retryable
    pub async fn update_many(
        &self,
        ctx: &Context,
        filter: Document,
        update: Document,
        session: Option<&ClientSession>,
    ) -> Result<UpdateResult> {
        self.update(ctx, filter, Bson::Document(update), true, session).await
    }

    async fn update(
        &self,
        ctx: &Context,
        filter: Document,
        update: Bson,
        multi: bool,
        session: Option<&ClientSession>,
    ) -> Result<UpdateResult> {
        let cmd = doc! {
            "update": self.namespace.coll.clone(),
            "updates": [{ "q": filter, "u": update, "multi": multi }],
        };
        let retryability = if multi { Retryability::None } else { Retryability::Write };
        let reply = self
            .write(ctx, self.write_op(CommandKind::Update, cmd, retryability), session)
            .await?;
        Ok(UpdateResult {
            matched_count: count(reply.n),
            modified_count: count(reply.n_modified.unwrap_or_default()),
            upserted_id: reply.upserted_id,
        })
    }

    pub async fn delete_one(
        &self,
        ctx: &Context,
        filter: Document,
        session: Option<&ClientSession>,
    ) -> Result<DeleteResult> {
        self.delete(ctx, filter, 1, session).await
    }

    /// Not retryable
    pub async fn delete_many(
        &self,
        ctx: &Context,
        filter: Document,
        session: Option<&ClientSession>,
    ) -> Result<DeleteResult> {
        self.delete(ctx, filter, 0, session).await
    }

    async fn delete(
        &self,
        ctx: &Context,
        filter: Document,
        limit: i32,
        session: Option<&ClientSession>,
    ) -> Result<DeleteResult> {
        let cmd = doc! {
            "delete": self.namespace.coll.clone(),
            "deletes": [{ "q": filter, "limit": limit }],
        };
        let retryability = if limit == 1 { Retryability::Write } else { Retryability::None };
        let reply = self
            .write(ctx, self.write_op(CommandKind::Delete, cmd, retryability), session)
            .await?;
        Ok(DeleteResult {
            deleted_count: count(reply.n),
        })
    }
}

impl<T> Collection<T>
where
    T: DeserializeOwned,
{
    pub async fn find(
        &self,
        ctx: &Context,
        filter: Document,
        options: Option<FindOptions>,
        session: Option<&ClientSession>,
    ) -> Result<Cursor<T>> {
        let options = options.unwrap_or_default();
        let mut cmd = doc! { "find": self.namespace.coll.clone(), "filter": filter };
        if let Some(sort) = options.sort {
            cmd.insert("sort", sort);
        }
        if let Some(projection) = options.projection {
            cmd.insert("projection", projection);
        }
        if let Some(skip) = options.skip {
            cmd.insert("skip", i64::try_from(skip).unwrap_or(i64::MAX));
        }
        if let Some(limit) = options.limit {
            cmd.insert("limit", limit.abs());
            if limit < 0 {
                cmd.insert("singleBatch", true);
            }
        }
        if let Some(batch_size) = options.batch_size {
            cmd.insert("batchSize", i64::from(batch_size));
        }

        let op = self.read_op(CommandKind::Find, cmd);
        let output = self.client.execute_operation(ctx, op, session).await?;
        self.cursor(output, session, options.batch_size)
    }

    pub async fn find_one(
        &self,
        ctx: &Context,
        filter: Document,
        session: Option<&ClientSession>,
    ) -> Result<Option<T>> {
        let options = FindOptions {
            limit: Some(-1),
            ..FindOptions::default()
        };
        let mut cursor = self.find(ctx, filter, Some(options), session).await?;
        let result = cursor.next(ctx).await;
        cursor.close(ctx).await;
        result
    }

    async fn find_and_modify(
        &self,
        ctx: &Context,
        filter: Document,
        modification: Document,
        session: Option<&ClientSession>,
    ) -> Result<Option<T>> {
        let mut cmd = doc! { "findAndModify": self.namespace.coll.clone(), "query": filter };
        cmd.extend(modification);
        let op = self.write_op(CommandKind::FindAndModify, cmd, Retryability::Write);
        match self.write(ctx, op, session).await?.value {
            Some(value) => Ok(Some(bson::from_document(value)?)),
            None => Ok(None),
        }
    }

    pub async fn find_one_and_delete(
        &self,
        ctx: &Context,
        filter: Document,
        session: Option<&ClientSession>,
    ) -> Result<Option<T>> {
        self.find_and_modify(ctx, filter, doc! { "remove": true }, session)
            .await
    }

    /// Returns the document as it was before the update
    pub async fn find_one_and_update(
        &self,
        ctx: &Context,
        filter: Document,
        update: Document,
        session: Option<&ClientSession>,
    ) -> Result<Option<T>> {
        self.find_and_modify(ctx, filter, doc! { "update": update }, session)
            .await
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Insert one document, generating an `_id` when it has none
    pub async fn insert_one(
        &self,
        ctx: &Context,
        document: T,
        session: Option<&ClientSession>,
    ) -> Result<InsertOneResult> {
        let (document, inserted_id) = with_id(bson::to_document(&document)?);
        let cmd = doc! {
            "insert": self.namespace.coll.clone(),
            "documents": [document],
        };
        self.write(ctx, self.write_op(CommandKind::Insert, cmd, Retryability::Write), session)
            .await?;
        Ok(InsertOneResult { inserted_id })
    }

    /// Ordered inserts are retryable; unordered ones are not
    pub async fn insert_many(
        &self,
        ctx: &Context,
        documents: impl IntoIterator<Item = T>,
        ordered: bool,
        session: Option<&ClientSession>,
    ) -> Result<InsertManyResult> {
        let mut batch = Vec::new();
        let mut inserted_ids = Vec::new();
        for document in documents {
            let (document, id) = with_id(bson::to_document(&document)?);
            batch.push(document);
            inserted_ids.push(id);
        }

        let cmd = doc! {
            "insert": self.namespace.coll.clone(),
            "documents": batch,
            "ordered": ordered,
        };
        let retryability = if ordered { Retryability::Write } else { Retryability::None };
        self.write(ctx, self.write_op(CommandKind::Insert, cmd, retryability), session)
            .await?;
        Ok(InsertManyResult { inserted_ids })
    }

    pub async fn replace_one(
        &self,
        ctx: &Context,
        filter: Document,
        replacement: T,
        session: Option<&ClientSession>,
    ) -> Result<UpdateResult> {
        let replacement = bson::to_document(&replacement)?;
        self.update(ctx, filter, Bson::Document(replacement), false, session)
            .await
    }

    pub async fn find_one_and_replace(
        &self,
        ctx: &Context,
        filter: Document,
        replacement: T,
        session: Option<&ClientSession>,
    ) -> Result<Option<T>> {
        let replacement = bson::to_document(&replacement)?;
        self.find_and_modify(ctx, filter, doc! { "update": replacement }, session)
            .await
    }
}

/// Put `_id` first, generating one if missing
fn with_id(document: Document) -> (Document, Bson) {
    let id = document
        .get("_id")
        .cloned()
        .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
    let mut out = doc! { "_id": id.clone() };
    out.extend(document.into_iter().filter(|(k, _)| k != "_id"));
    (out, id)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mock::MockDeployment;
    use causeway_common::Config;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Item {
        #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
        id: Option<i32>,
        x: i32,
    }

    fn setup() -> (MockDeployment, Collection<Item>) {
        let mock = MockDeployment::replica_set();
        let client = Client::with_topology(Arc::new(mock.clone()), Config::default());
        (mock, client.database("db").collection("items"))
    }

    #[tokio::test]
    async fn test_insert_generates_id_first() {
        let (mock, coll) = setup();
        let result = coll
            .insert_one(&Context::background(), Item { id: None, x: 1 }, None)
            .await
            .unwrap();
        assert!(matches!(result.inserted_id, Bson::ObjectId(_)));

        let sent = &mock.commands("insert")[0];
        let inserted = sent.get_array("documents").unwrap()[0].as_document().unwrap();
        assert_eq!(inserted.keys().next().map(String::as_str), Some("_id"));
        assert_eq!(inserted.get_i32("x").unwrap(), 1);
        assert!(sent.contains_key("txnNumber"));
    }

    #[tokio::test]
    async fn test_txn_number_per_write_kind() {
        let (mock, coll) = setup();
        let ctx = Context::background();

        coll.insert_many(&ctx, vec![Item { id: Some(1), x: 1 }], true, None).await.unwrap();
        coll.insert_many(&ctx, vec![Item { id: Some(2), x: 2 }], false, None).await.unwrap();
        coll.update_one(&ctx, doc! {}, doc! { "$set": { "x": 3 } }, None).await.unwrap();
        coll.update_many(&ctx, doc! {}, doc! { "$set": { "x": 3 } }, None).await.unwrap();
        coll.delete_one(&ctx, doc! {}, None).await.unwrap();
        coll.delete_many(&ctx, doc! {}, None).await.unwrap();
        coll.find_one_and_delete(&ctx, doc! {}, None).await.unwrap();

        let has_txn: Vec<bool> = mock
            .started()
            .iter()
            .map(|c| c.command.contains_key("txnNumber"))
            .collect();
        assert_eq!(has_txn, vec![true, false, true, false, true, false, true]);
    }

    #[tokio::test]
    async fn test_find_one_decodes_first_document() {
        let (mock, coll) = setup();
        mock.push_reply(
            "find",
            doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.items", "firstBatch": [{ "_id": 4, "x": 9 }] } },
        );

        let found = coll
            .find_one(&Context::background(), doc! { "x": 9 }, None)
            .await
            .unwrap();
        assert_eq!(found, Some(Item { id: Some(4), x: 9 }));

        let sent = &mock.commands("find")[0];
        assert_eq!(sent.get_i64("limit").unwrap(), 1);
        assert!(sent.get_bool("singleBatch").unwrap());
        assert_eq!(sent.get_document("filter").unwrap(), &doc! { "x": 9 });
    }

    #[tokio::test]
    async fn test_write_results() {
        let (mock, coll) = setup();
        let ctx = Context::background();
        mock.push_reply(
            "update",
            doc! { "ok": 1, "n": 1, "nModified": 0, "upserted": [{ "index": 0, "_id": 7 }] },
        );
        mock.push_reply("delete", doc! { "ok": 1, "n": 3 });

        let update = coll.update_one(&ctx, doc! {}, doc! { "$set": { "x": 1 } }, None).await.unwrap();
        assert_eq!(update.matched_count, 1);
        assert_eq!(update.modified_count, 0);
        assert_eq!(update.upserted_id, Some(Bson::Int32(7)));

        let delete = coll.delete_many(&ctx, doc! {}, None).await.unwrap();
        assert_eq!(delete.deleted_count, 3);
    }

    #[tokio::test]
    async fn test_write_error_surfaces() {
        let (mock, coll) = setup();
        mock.push_reply(
            "insert",
            doc! { "ok": 1, "n": 0, "writeErrors": [{ "index": 0, "code": 11000, "errmsg": "duplicate key" }] },
        );
        let err = coll
            .insert_one(&Context::background(), Item { id: Some(1), x: 1 }, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(11000));
    }

    #[tokio::test]
    async fn test_collection_write_concern_override() {
        let (mock, coll) = setup();
        let coll = coll.with_options(CollectionOptions {
            write_concern: Some(WriteConcern::majority()),
            ..Default::default()
        });
        coll.delete_one(&Context::background(), doc! {}, None).await.unwrap();
        let sent = &mock.commands("delete")[0];
        assert_eq!(
            sent.get_document("writeConcern").unwrap().get_str("w").unwrap(),
            "majority"
        );
    }

    #[tokio::test]
    async fn test_run_command() {
        let (mock, coll) = setup();
        mock.push_reply("ping", doc! { "ok": 1, "pong": true });
        let db = coll.client.database("db");
        let reply = db
            .run_command(&Context::background(), doc! { "ping": 1 }, None)
            .await
            .unwrap();
        assert!(reply.get_bool("pong").unwrap());
        assert_eq!(mock.commands("ping")[0].get_str("$db").unwrap(), "db");
    }
}
