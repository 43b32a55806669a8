//! `with_transaction`
//!
//! Runs a callback inside a transaction and commits it, retrying the whole
//! transaction on `TransientTransactionError` and the commit alone on
//! `UnknownTransactionCommitResult` until the configured time limit passes.

use std::future::Future;

use tokio::time::Instant;
use tracing::debug;

use causeway_common::error::{
    Error, Result, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT,
};

use super::{ClientSession, TransactionOptions};
use crate::context::Context;

/// Outcome of one step of the transaction loop
#[derive(Debug)]
pub enum TransactionStep<R> {
    Success(R),
    /// Start the transaction over, running the callback again
    RetryTransaction(Error),
    /// Send `commitTransaction` again
    RetryCommit(Error),
    Fail(Error),
}

impl ClientSession {
    /// Run `callback` in a transaction and commit it.
    ///
    /// The callback gets a handle to this session and must pass it to every
    /// operation it runs. If it commits or aborts the transaction itself, its
    /// result is returned as is.
    pub async fn with_transaction<F, Fut, R>(
        &self,
        ctx: &Context,
        mut callback: F,
        options: Option<TransactionOptions>,
    ) -> Result<R>
    where
        F: FnMut(ClientSession) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let timeout = self.client().config().transaction.with_transaction_timeout();
        let deadline = Instant::now() + timeout;

        'transaction: loop {
            ctx.check()?;
            self.start_transaction(options.clone())?;

            let value = match self.run_callback(ctx, &mut callback, deadline).await {
                TransactionStep::Success(value) => value,
                TransactionStep::RetryTransaction(err) => {
                    debug!(session_id = %self.id(), error = %err, "retrying transaction");
                    continue 'transaction;
                }
                TransactionStep::RetryCommit(err) | TransactionStep::Fail(err) => return Err(err),
            };

            if !self.transaction_state().is_active() {
                return Ok(value);
            }

            loop {
                ctx.check()?;
                match self.commit_step(ctx, deadline).await {
                    TransactionStep::Success(()) => return Ok(value),
                    TransactionStep::RetryCommit(err) => {
                        debug!(session_id = %self.id(), error = %err, "retrying commit");
                    }
                    TransactionStep::RetryTransaction(err) => {
                        debug!(session_id = %self.id(), error = %err, "retrying transaction after commit");
                        continue 'transaction;
                    }
                    TransactionStep::Fail(err) => return Err(err),
                }
            }
        }
    }

    async fn run_callback<F, Fut, R>(
        &self,
        ctx: &Context,
        callback: &mut F,
        deadline: Instant,
    ) -> TransactionStep<R>
    where
        F: FnMut(ClientSession) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match callback(self.clone()).await {
            Ok(value) => TransactionStep::Success(value),
            Err(err) => {
                if self.in_transaction() {
                    // abort failures are logged inside abort_transaction
                    let _ = self.abort_transaction(ctx).await;
                }
                if err.contains_label(TRANSIENT_TRANSACTION_ERROR) && Instant::now() < deadline {
                    TransactionStep::RetryTransaction(err)
                } else {
                    TransactionStep::Fail(err)
                }
            }
        }
    }

    async fn commit_step(&self, ctx: &Context, deadline: Instant) -> TransactionStep<()> {
        let Err(err) = self.commit_transaction(ctx).await else {
            return TransactionStep::Success(());
        };
        if Instant::now() >= deadline {
            return TransactionStep::Fail(err);
        }
        if err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) && !err.is_max_time_expired() {
            TransactionStep::RetryCommit(err)
        } else if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            TransactionStep::RetryTransaction(err)
        } else {
            TransactionStep::Fail(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bson::{doc, Document};

    use super::*;
    use crate::client::Client;
    use crate::mock::MockDeployment;
    use crate::session::TransactionState;
    use causeway_common::error::NetworkError;
    use causeway_common::Config;

    fn setup(config: Config) -> (MockDeployment, Client) {
        let mock = MockDeployment::replica_set();
        let client = Client::with_topology(Arc::new(mock.clone()), config);
        (mock, client)
    }

    fn transient() -> Error {
        let mut err = Error::from(NetworkError::closed("reset"));
        err.add_label(TRANSIENT_TRANSACTION_ERROR);
        err
    }

    #[tokio::test]
    async fn test_transient_callback_error_retries_transaction() {
        let (mock, client) = setup(Config::default());
        mock.push_network_error("insert");
        let session = client.start_session(None).unwrap();
        let coll = client.database("db").collection::<Document>("coll");
        let ctx = Context::background();

        let attempts = AtomicUsize::new(0);
        let result = session
            .with_transaction(
                &ctx,
                |s| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let coll = coll.clone();
                    let ctx = ctx.clone();
                    async move {
                        coll.insert_one(&ctx, doc! { "x": 1 }, Some(&s)).await?;
                        Ok(42)
                    }
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            mock.started_names(),
            vec!["insert", "abortTransaction", "insert", "commitTransaction"]
        );
        let inserts = mock.commands("insert");
        assert!(inserts[1].get_bool("startTransaction").unwrap());
        assert_eq!(
            inserts[1].get_i64("txnNumber").unwrap(),
            inserts[0].get_i64("txnNumber").unwrap() + 1
        );
        assert_eq!(session.transaction_state(), TransactionState::Committed);
    }

    #[tokio::test]
    async fn test_plain_error_is_not_retried() {
        let (mock, client) = setup(Config::default());
        let session = client.start_session(None).unwrap();
        let coll = client.database("db").collection::<Document>("coll");
        let ctx = Context::background();

        let attempts = AtomicUsize::new(0);
        let result: Result<()> = session
            .with_transaction(
                &ctx,
                |s| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let coll = coll.clone();
                    let ctx = ctx.clone();
                    async move {
                        coll.insert_one(&ctx, doc! { "x": 1 }, Some(&s)).await?;
                        Err(Error::application(anyhow::anyhow!("validation failed")))
                    }
                },
                None,
            )
            .await;

        assert!(matches!(result, Err(Error::Application(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(mock.started_names(), vec!["insert", "abortTransaction"]);
        assert_eq!(session.transaction_state(), TransactionState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_surfaces_last_error() {
        let mut config = Config::default();
        config.transaction.with_transaction_timeout_ms = 1000;
        let (_mock, client) = setup(config);
        let session = client.start_session(None).unwrap();

        let attempts = AtomicUsize::new(0);
        let result: Result<()> = session
            .with_transaction(
                &Context::background(),
                |_| {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::time::sleep(Duration::from_millis(400)).await;
                        let mut err = transient();
                        err.add_label(&format!("Attempt{attempt}"));
                        Err(err)
                    }
                },
                None,
            )
            .await;

        // attempts end at 400ms, 800ms and 1200ms
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert!(err.contains_label("Attempt2"));
        assert!(err.contains_label(TRANSIENT_TRANSACTION_ERROR));
    }

    #[tokio::test]
    async fn test_commit_retried_on_unknown_result() {
        let (mock, client) = setup(Config::default());
        mock.push_reply(
            "commitTransaction",
            doc! { "ok": 1, "writeConcernError": { "code": 64, "codeName": "WriteConcernFailed", "errmsg": "waiting for replication timed out" } },
        );
        mock.push_network_error("commitTransaction");
        let session = client.start_session(None).unwrap();
        let coll = client.database("db").collection::<Document>("coll");
        let ctx = Context::background();

        session
            .with_transaction(
                &ctx,
                |s| {
                    let coll = coll.clone();
                    let ctx = ctx.clone();
                    async move {
                        coll.insert_one(&ctx, doc! { "x": 1 }, Some(&s)).await?;
                        Ok(())
                    }
                },
                None,
            )
            .await
            .unwrap();

        let commits = mock.commands("commitTransaction");
        assert_eq!(commits.len(), 3);
        let txn_number = commits[0].get_i64("txnNumber").unwrap();
        for commit in &commits {
            assert_eq!(commit.get_i64("txnNumber").unwrap(), txn_number);
        }
        for commit in &commits[1..] {
            let wc = commit.get_document("writeConcern").unwrap();
            assert_eq!(wc.get_str("w").unwrap(), "majority");
            assert_eq!(wc.get_i64("wtimeout").unwrap(), 10_000);
        }
    }

    #[tokio::test]
    async fn test_max_time_expired_commit_is_not_retried() {
        let (mock, client) = setup(Config::default());
        mock.push_reply(
            "commitTransaction",
            doc! { "ok": 0, "code": 50, "codeName": "MaxTimeMSExpired", "errmsg": "operation exceeded time limit" },
        );
        let session = client.start_session(None).unwrap();
        let coll = client.database("db").collection::<Document>("coll");
        let ctx = Context::background();

        let result = session
            .with_transaction(
                &ctx,
                |s| {
                    let coll = coll.clone();
                    let ctx = ctx.clone();
                    async move { coll.insert_one(&ctx, doc! { "x": 1 }, Some(&s)).await }
                },
                None,
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is_max_time_expired());
        assert!(err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));
        assert_eq!(mock.commands("commitTransaction").len(), 1);
    }

    #[tokio::test]
    async fn test_transient_commit_error_retries_transaction() {
        let (mock, client) = setup(Config::default());
        mock.push_reply(
            "commitTransaction",
            doc! { "ok": 0, "code": 251, "codeName": "NoSuchTransaction", "errmsg": "gone", "errorLabels": [TRANSIENT_TRANSACTION_ERROR] },
        );
        let session = client.start_session(None).unwrap();
        let coll = client.database("db").collection::<Document>("coll");
        let ctx = Context::background();

        session
            .with_transaction(
                &ctx,
                |s| {
                    let coll = coll.clone();
                    let ctx = ctx.clone();
                    async move { coll.insert_one(&ctx, doc! { "x": 1 }, Some(&s)).await }
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            mock.started_names(),
            vec!["insert", "commitTransaction", "insert", "commitTransaction"]
        );
    }

    #[tokio::test]
    async fn test_callback_may_end_transaction() {
        let (mock, client) = setup(Config::default());
        let session = client.start_session(None).unwrap();
        let ctx = Context::background();

        let result = session
            .with_transaction(
                &ctx,
                |s| {
                    let ctx = ctx.clone();
                    async move {
                        s.abort_transaction(&ctx).await?;
                        Ok("aborted")
                    }
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(result, "aborted");
        assert!(mock.started().is_empty());
        assert_eq!(session.transaction_state(), TransactionState::Aborted);
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_loop() {
        let (_mock, client) = setup(Config::default());
        let session = client.start_session(None).unwrap();
        let ctx = Context::background();

        let result: Result<()> = session
            .with_transaction(
                &ctx,
                |_| {
                    let ctx = ctx.clone();
                    async move {
                        ctx.cancel();
                        Err(transient())
                    }
                },
                None,
            )
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
