//! Operation execution
//!
//! Runs one command with at most one retry. Reads retry on a freshly selected
//! server; writes retry with the same transaction number so the server can
//! recognise the duplicate.

use std::sync::Arc;

use bson::Document;
use tracing::debug;

use causeway_common::error::{
    Error, Result, NO_WRITES_PERFORMED, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR,
    UNKNOWN_TRANSACTION_COMMIT_RESULT,
};
use causeway_common::metrics::{self, CommandTimer};
use causeway_common::types::{ServerAddress, TxnNumber};

use crate::client::Client;
use crate::clock::ClusterTime;
use crate::context::Context;
use crate::operation::{CommandKind, Operation, Retryability};
use crate::reply::ReplyHeader;
use crate::session::{commit_retry_write_concern, ClientSession, TransactionState};
use crate::topology::{Server, ServerDescription};

/// Result of a successful execution
pub(crate) struct ExecutionOutput {
    pub reply: Document,
    pub header: ReplyHeader,
    pub server: Arc<dyn Server>,
    /// Session created for this operation, handed to cursors that outlive it
    pub implicit_session: Option<ClientSession>,
}

impl std::fmt::Debug for ExecutionOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionOutput")
            .field("reply", &self.reply)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ExecutionRetry {
    prior_txn_number: Option<TxnNumber>,
    first_error: Error,
    first_server: ServerAddress,
}

impl Client {
    /// Select a server and run `op`, retrying once when its retry class allows.
    pub(crate) async fn execute_operation(
        &self,
        ctx: &Context,
        mut op: Operation,
        session: Option<&ClientSession>,
    ) -> Result<ExecutionOutput> {
        if let Some(session) = session {
            session.validate(self)?;
        }

        let mut retry: Option<ExecutionRetry> = None;
        let mut implicit_session: Option<ClientSession> = None;

        loop {
            ctx.check()?;

            let mut criteria = op.criteria.clone();
            if let Some(session) = session {
                if let Some(selector) = session.transaction_selector() {
                    criteria.selector = selector;
                }
                if criteria.pinned.is_none() {
                    criteria.pinned = session.pinned_server();
                }
            }
            if let Some(r) = &retry {
                criteria.deprioritized.push(r.first_server.clone());
            }

            let server = match self.topology().select_server(ctx, &criteria).await {
                Ok(server) => server,
                Err(mut err) => {
                    if let Some(r) = retry {
                        return Err(r.first_error);
                    }
                    add_labels_and_unpin(&mut err, op.kind, session, Retryability::None, false);
                    return Err(err);
                }
            };
            let description = server.description();

            if session.is_none()
                && implicit_session.is_none()
                && description.supports_sessions()
                && op.is_acknowledged()
            {
                implicit_session =
                    Some(self.start_implicit_session(description.logical_session_timeout_minutes));
            }
            let active = session.or(implicit_session.as_ref());

            let retryability = self.effective_retryability(&op, active, &description);
            if retryability == Retryability::None {
                if let Some(r) = retry.take() {
                    return Err(r.first_error);
                }
            }

            let txn_number = match retry.as_ref().and_then(|r| r.prior_txn_number) {
                Some(prior) => Some(prior),
                None => active.and_then(|s| s.txn_number_for(op.kind, retryability)),
            };

            let result = self
                .run_on_server(ctx, &op, &server, &description, active, txn_number)
                .await;

            match result {
                Ok((reply, header)) => {
                    return Ok(ExecutionOutput {
                        reply,
                        header,
                        server,
                        implicit_session,
                    });
                }
                Err(mut err) => {
                    if err.is_context_error() {
                        return Err(err);
                    }
                    add_labels_and_unpin(
                        &mut err,
                        op.kind,
                        active,
                        retryability,
                        self.config().client.retry_writes,
                    );

                    if let Some(r) = retry {
                        if err.contains_label(NO_WRITES_PERFORMED) {
                            return Err(r.first_error);
                        }
                        return Err(err);
                    }

                    if can_retry(retryability, &err) {
                        debug!(
                            command = op.kind.name(),
                            server = %description.address,
                            error = %err,
                            "retrying operation"
                        );
                        metrics::record_retry(match retryability {
                            Retryability::Write => "write",
                            _ => "read",
                        });
                        // Labelled errors unpin the session; the retry selects afresh.
                        op.criteria.pinned = active.and_then(ClientSession::pinned_server);
                        if op.kind == CommandKind::CommitTransaction {
                            op.write_concern = Some(commit_retry_write_concern(
                                op.write_concern.as_ref(),
                                self.config().transaction.commit_retry_wtimeout_ms,
                            ));
                        }
                        retry = Some(ExecutionRetry {
                            prior_txn_number: txn_number,
                            first_error: err,
                            first_server: description.address.clone(),
                        });
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Run `op` once against a known server, e.g. `getMore` on the server that owns a cursor
    pub(crate) async fn execute_on_server(
        &self,
        ctx: &Context,
        op: &Operation,
        server: &Arc<dyn Server>,
        session: Option<&ClientSession>,
    ) -> Result<(Document, ReplyHeader)> {
        if let Some(session) = session {
            session.validate(self)?;
        }
        let description = server.description();
        let txn_number = session.and_then(|s| s.txn_number_for(op.kind, Retryability::None));

        let result = self
            .run_on_server(ctx, op, server, &description, session, txn_number)
            .await;
        result.map_err(|mut err| {
            add_labels_and_unpin(&mut err, op.kind, session, Retryability::None, false);
            err
        })
    }

    fn effective_retryability(
        &self,
        op: &Operation,
        session: Option<&ClientSession>,
        description: &ServerDescription,
    ) -> Retryability {
        if op.kind.is_transaction_command() {
            return Retryability::Write;
        }
        if session.is_some_and(ClientSession::in_transaction) || !op.is_acknowledged() {
            return Retryability::None;
        }

        let config = &self.config().client;
        match op.retryability {
            Retryability::Write
                if config.retry_writes
                    && session.is_some()
                    && description.supports_retryable_writes() =>
            {
                Retryability::Write
            }
            Retryability::Read if config.retry_reads => Retryability::Read,
            _ => Retryability::None,
        }
    }

    /// Stamp, send and parse one command
    async fn run_on_server(
        &self,
        ctx: &Context,
        op: &Operation,
        server: &Arc<dyn Server>,
        description: &ServerDescription,
        session: Option<&ClientSession>,
        txn_number: Option<TxnNumber>,
    ) -> Result<(Document, ReplyHeader)> {
        let acknowledged = op.is_acknowledged();
        let session_cluster_time = session.and_then(ClientSession::cluster_time);
        let cluster_time = ClusterTime::max(session_cluster_time.as_ref(), self.cluster_time().as_ref());

        let mut cmd = op.build(description, cluster_time.as_ref());
        if let Some(session) = session {
            session.apply_to_command(&mut cmd, op.kind, txn_number, acknowledged, description);
        }

        let name = op.kind.name();
        debug!(command = name, db = %op.db, server = %description.address, "command started");
        let _timer = CommandTimer::new(name);

        let round_trip = ctx
            .run(async {
                let mut connection = server.connection(ctx).await?;
                connection.round_trip(ctx, cmd).await
            })
            .await;

        let reply = match round_trip {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_network_error() {
                    if let Some(session) = session {
                        session.mark_dirty();
                    }
                }
                metrics::record_command(name, false);
                debug!(command = name, error = %err, "command failed");
                return Err(err);
            }
        };

        let header = ReplyHeader::parse(&reply);
        if let Some(ct) = &header.cluster_time {
            self.advance_cluster_time(ct);
        }
        if let Some(session) = session {
            session.update_from_reply(&header, acknowledged);
        }

        if let Some(err) = header.error() {
            metrics::record_command(name, false);
            debug!(command = name, error = %err, "command failed");
            return Err(err);
        }
        metrics::record_command(name, true);
        debug!(command = name, "command succeeded");
        Ok((reply, header))
    }
}

fn can_retry(retryability: Retryability, err: &Error) -> bool {
    match retryability {
        Retryability::Read => err.is_retryable_read(),
        Retryability::Write => err.is_retryable_write(),
        Retryability::None => false,
    }
}

/// Attach driver-side labels. Errors in an active transaction from the network
/// or server selection are transient; commit failures with an unknown outcome
/// get `UnknownTransactionCommitResult`. Either label unpins the session.
fn add_labels_and_unpin(
    err: &mut Error,
    kind: CommandKind,
    session: Option<&ClientSession>,
    retryability: Retryability,
    retry_writes: bool,
) {
    let state = session.map_or(TransactionState::None, ClientSession::transaction_state);

    match state {
        TransactionState::Starting | TransactionState::InProgress => {
            if err.is_network_error() || err.is_server_selection_error() {
                err.add_label(TRANSIENT_TRANSACTION_ERROR);
            }
        }
        TransactionState::Committed if kind == CommandKind::CommitTransaction => {
            if retry_writes && err.is_network_error() {
                err.add_label(RETRYABLE_WRITE_ERROR);
            }
            if err.is_unknown_commit_result() {
                err.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
            }
        }
        TransactionState::Aborted if kind == CommandKind::AbortTransaction => {
            if retry_writes && err.is_network_error() {
                err.add_label(RETRYABLE_WRITE_ERROR);
            }
        }
        _ => {
            if retryability == Retryability::Write && retry_writes && err.is_network_error() {
                err.add_label(RETRYABLE_WRITE_ERROR);
            }
        }
    }

    if err.contains_label(TRANSIENT_TRANSACTION_ERROR)
        || err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    {
        if let Some(session) = session {
            session.unpin();
        }
    }
}
