//! Typed cursors
//!
//! [`Cursor`] walks the documents of a [`BatchCursor`] one at a time and
//! decodes them on demand.

pub mod batch;

use std::marker::PhantomData;

use bson::Document;
use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;

use causeway_common::error::{CursorError, Error, Result};
use causeway_common::types::{CursorId, Namespace};

use crate::context::Context;
use crate::session::ClientSession;

pub use batch::{BatchCursor, CursorOptions};

/// Cursor over the results of a `find` or `aggregate`
#[derive(Debug)]
pub struct Cursor<T = Document> {
    inner: BatchCursor,
    current: Option<Document>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Cursor<T>
where
    T: DeserializeOwned,
{
    pub(crate) fn new(inner: BatchCursor) -> Self {
        Self {
            inner,
            current: None,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> CursorId {
        self.inner.id()
    }

    pub fn namespace(&self) -> &Namespace {
        self.inner.namespace()
    }

    /// True while the server may still hold documents for this cursor
    pub fn is_alive(&self) -> bool {
        !self.inner.is_exhausted() && !self.inner.is_closed()
    }

    /// Documents buffered but not yet consumed
    pub fn remaining_batch_len(&self) -> usize {
        self.inner.batch().len()
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.inner.session()
    }

    /// Move to the next document, fetching batches until one arrives or the
    /// cursor is exhausted.
    pub async fn advance(&mut self, ctx: &Context) -> Result<bool> {
        if self.inner.advance(ctx).await? {
            self.current = self.inner.take_next();
            Ok(true)
        } else {
            self.current = None;
            Ok(false)
        }
    }

    /// Like [`advance`](Self::advance) but sends at most one `getMore`
    pub async fn try_advance(&mut self, ctx: &Context) -> Result<bool> {
        if self.inner.try_advance(ctx).await? {
            self.current = self.inner.take_next();
            Ok(true)
        } else {
            self.current = None;
            Ok(false)
        }
    }

    /// The raw document the cursor is positioned on
    pub fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    /// Decode the current document. Can be called repeatedly with different types.
    pub fn deserialize_current<D: DeserializeOwned>(&self) -> Result<D> {
        let current = self.current.as_ref().ok_or(CursorError::NoCurrentDocument)?;
        Ok(bson::from_document(current.clone())?)
    }

    pub async fn next(&mut self, ctx: &Context) -> Result<Option<T>> {
        if self.advance(ctx).await? {
            self.deserialize_current().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Decode every remaining document into `out`, in arrival order. The
    /// cursor is closed whether or not this succeeds.
    pub async fn all(&mut self, ctx: &Context, out: &mut Vec<T>) -> Result<()> {
        let result = self.drain(ctx, out).await;
        self.close(ctx).await;
        result
    }

    async fn drain(&mut self, ctx: &Context, out: &mut Vec<T>) -> Result<()> {
        while self.inner.advance(ctx).await? {
            while let Some(doc) = self.inner.take_next() {
                out.push(bson::from_document(doc)?);
            }
        }
        Ok(())
    }

    /// Kill the server-side cursor. Errors are logged, never returned.
    pub async fn close(&mut self, ctx: &Context) {
        self.current = None;
        self.inner.close(ctx).await;
    }

    /// Consume the cursor as a stream of decoded documents
    pub fn into_stream(self, ctx: Context) -> impl Stream<Item = Result<T>> {
        stream::try_unfold((self, ctx), |(mut cursor, ctx)| async move {
            let item = cursor.next(&ctx).await?;
            Ok::<_, Error>(item.map(|item| (item, (cursor, ctx))))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bson::doc;
    use futures::TryStreamExt;
    use serde::Deserialize;

    use super::*;
    use crate::client::Client;
    use crate::mock::MockDeployment;
    use crate::reply::CursorReply;
    use crate::topology::{SelectionCriteria, ServerSelector, Topology};
    use causeway_common::Config;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        x: i32,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Other {
        y: String,
    }

    async fn cursor<T: DeserializeOwned>(mock: &MockDeployment, first: Document) -> Cursor<T> {
        let client = Client::with_topology(Arc::new(mock.clone()), Config::default());
        let server = mock
            .select_server(&Context::background(), &SelectionCriteria::new(ServerSelector::Write))
            .await
            .unwrap();
        let inner = BatchCursor::new(
            client,
            server,
            CursorReply::parse(&first).unwrap(),
            Namespace::new("db", "coll"),
            None,
            CursorOptions::default(),
        );
        Cursor::new(inner)
    }

    #[tokio::test]
    async fn test_decode_current_with_different_types() {
        let mock = MockDeployment::replica_set();
        let mut cursor: Cursor = cursor(
            &mock,
            doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.coll", "firstBatch": [{ "x": 1, "y": "a" }, { "x": "bad" }] } },
        )
        .await;
        let ctx = Context::background();

        assert!(cursor.deserialize_current::<Item>().is_err());
        assert!(cursor.advance(&ctx).await.unwrap());
        assert_eq!(cursor.deserialize_current::<Item>().unwrap(), Item { x: 1 });
        assert_eq!(cursor.deserialize_current::<Other>().unwrap(), Other { y: "a".into() });
        assert_eq!(cursor.deserialize_current::<Item>().unwrap(), Item { x: 1 });

        // a decode failure leaves the cursor usable
        assert!(cursor.advance(&ctx).await.unwrap());
        assert!(matches!(cursor.deserialize_current::<Item>(), Err(Error::Serialization(_))));
        assert_eq!(cursor.current().unwrap().get_str("x").unwrap(), "bad");
        assert!(!cursor.advance(&ctx).await.unwrap());
        assert!(cursor.current().is_none());
    }

    #[tokio::test]
    async fn test_all_drains_batches_and_closes() {
        let mock = MockDeployment::replica_set();
        mock.push_reply(
            "getMore",
            doc! { "ok": 1, "cursor": { "id": 0_i64, "nextBatch": [{ "x": 3 }, { "x": 4 }] } },
        );
        let mut cursor: Cursor<Item> = cursor(
            &mock,
            doc! { "ok": 1, "cursor": { "id": 5_i64, "ns": "db.coll", "firstBatch": [{ "x": 1 }, { "x": 2 }] } },
        )
        .await;

        let mut out = Vec::new();
        cursor.all(&Context::background(), &mut out).await.unwrap();
        assert_eq!(out.iter().map(|i| i.x).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(!cursor.is_alive());
        assert!(mock.commands("killCursors").is_empty());
    }

    #[tokio::test]
    async fn test_all_closes_on_error() {
        let mock = MockDeployment::replica_set();
        mock.push_reply("getMore", doc! { "ok": 0, "code": 43, "codeName": "CursorNotFound", "errmsg": "gone" });
        let mut cursor: Cursor<Item> = cursor(
            &mock,
            doc! { "ok": 1, "cursor": { "id": 5_i64, "ns": "db.coll", "firstBatch": [{ "x": 1 }] } },
        )
        .await;

        let mut out = Vec::new();
        let result = cursor.all(&Context::background(), &mut out).await;
        assert_eq!(result.unwrap_err().code(), Some(43));
        assert_eq!(out, vec![Item { x: 1 }]);
        assert!(!cursor.is_alive());
        assert_eq!(mock.commands("killCursors").len(), 1);
    }

    #[tokio::test]
    async fn test_into_stream() {
        let mock = MockDeployment::replica_set();
        let cursor: Cursor<Item> = cursor(
            &mock,
            doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.coll", "firstBatch": [{ "x": 1 }, { "x": 2 }] } },
        )
        .await;

        let items: Vec<Item> = cursor.into_stream(Context::background()).try_collect().await.unwrap();
        assert_eq!(items, vec![Item { x: 1 }, Item { x: 2 }]);
    }
}
