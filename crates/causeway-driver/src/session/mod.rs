//! Client sessions
//!
//! A [`ClientSession`] is a cheap handle: clones share one session. The last
//! handle to go away returns the server session to the client's pool, which is
//! how implicit sessions owned by cursors are released.

pub mod pool;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Document, Timestamp};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use causeway_common::error::{Error, Result, SessionError};
use causeway_common::metrics;
use causeway_common::types::{
    Acknowledgment, ReadConcern, ReadPreference, ServerAddress, TxnNumber, WriteConcern,
};

use crate::client::Client;
use crate::clock::{CausalState, ClusterTime};
use crate::context::Context;
use crate::operation::{set_after_cluster_time, CommandKind, Operation, Retryability};
use crate::reply::ReplyHeader;
use crate::topology::{ServerDescription, ServerSelector};

pub use pool::{ServerSession, ServerSessionPool};
pub use runner::TransactionStep;

// ============================================================================
// Options
// ============================================================================

/// Options for [`Client::start_session`]
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Defaults to `session.causal_consistency` from the client config
    pub causal_consistency: Option<bool>,
    /// Used by `start_transaction` for every option left unset
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Per-transaction options. Unset fields fall back to the session's defaults,
/// then to the client's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOptions {
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub read_preference: Option<ReadPreference>,
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    fn or(self, fallback: &TransactionOptions) -> Self {
        Self {
            read_concern: self.read_concern.or_else(|| fallback.read_concern.clone()),
            write_concern: self.write_concern.or_else(|| fallback.write_concern.clone()),
            read_preference: self.read_preference.or(fallback.read_preference),
            max_commit_time: self.max_commit_time.or(fallback.max_commit_time),
        }
    }
}

// ============================================================================
// Transaction State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

impl TransactionState {
    /// Starting or InProgress
    pub fn is_active(self) -> bool {
        matches!(self, TransactionState::Starting | TransactionState::InProgress)
    }
}

#[derive(Debug, Default)]
struct Transaction {
    state: TransactionState,
    options: TransactionOptions,
    pinned: Option<ServerAddress>,
    recovery_token: Option<Document>,
    /// Whether any command ran inside the transaction
    commands_sent: bool,
}

impl Transaction {
    fn reset(&mut self, options: TransactionOptions) {
        *self = Transaction {
            state: TransactionState::Starting,
            options,
            ..Transaction::default()
        };
    }
}

/// Write concern used when a commit is sent again: majority with a bounded
/// wtimeout, keeping any journal setting.
pub(crate) fn commit_retry_write_concern(
    write_concern: Option<&WriteConcern>,
    wtimeout_ms: u64,
) -> WriteConcern {
    WriteConcern {
        w: Some(Acknowledgment::majority()),
        journal: write_concern.and_then(|wc| wc.journal),
        w_timeout_ms: Some(wtimeout_ms),
    }
}

// ============================================================================
// Client Session
// ============================================================================

struct SessionCore {
    id: Uuid,
    lsid: Document,
    server_session: Option<ServerSession>,
    ended: bool,
    causal_consistency: bool,
    causal: CausalState,
    default_transaction_options: TransactionOptions,
    transaction: Transaction,
}

impl SessionCore {
    fn check_not_ended(&self) -> Result<()> {
        if self.ended {
            return Err(SessionError::SessionEnded.into());
        }
        Ok(())
    }
}

struct SessionInner {
    client: Client,
    implicit: bool,
    logical_session_timeout: Option<Duration>,
    core: Mutex<SessionCore>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(server_session) = self.core.get_mut().server_session.take() {
            self.client
                .session_pool()
                .check_in(server_session, self.logical_session_timeout);
        }
    }
}

/// A logical session bound to the client that created it
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("ClientSession")
            .field("id", &core.id)
            .field("implicit", &self.inner.implicit)
            .field("ended", &core.ended)
            .field("transaction_state", &core.transaction.state)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    pub(crate) fn new(
        client: Client,
        implicit: bool,
        logical_session_timeout: Option<Duration>,
        options: SessionOptions,
    ) -> Self {
        let server_session = client.session_pool().check_out(logical_session_timeout);
        let causal_consistency = !implicit
            && options
                .causal_consistency
                .unwrap_or(client.config().session.causal_consistency);

        let core = SessionCore {
            id: server_session.id(),
            lsid: server_session.lsid().clone(),
            server_session: Some(server_session),
            ended: false,
            causal_consistency,
            causal: CausalState::new(),
            default_transaction_options: options.default_transaction_options.unwrap_or_default(),
            transaction: Transaction::default(),
        };
        debug!(session_id = %core.id, implicit, "session started");

        Self {
            inner: Arc::new(SessionInner {
                client,
                implicit,
                logical_session_timeout,
                core: Mutex::new(core),
            }),
        }
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn id(&self) -> Uuid {
        self.inner.core.lock().id
    }

    /// The `lsid` document sent with every command
    pub fn lsid(&self) -> Document {
        self.inner.core.lock().lsid.clone()
    }

    pub fn is_implicit(&self) -> bool {
        self.inner.implicit
    }

    pub fn has_ended(&self) -> bool {
        self.inner.core.lock().ended
    }

    pub fn causal_consistency(&self) -> bool {
        self.inner.core.lock().causal_consistency
    }

    pub fn operation_time(&self) -> Option<Timestamp> {
        self.inner.core.lock().causal.operation_time()
    }

    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.inner.core.lock().causal.cluster_time().cloned()
    }

    /// Advance the session's operationTime, e.g. to chain reads after a write
    /// made through another session
    pub fn advance_operation_time(&self, ts: Timestamp) {
        self.inner.core.lock().causal.advance_operation_time(ts);
    }

    pub fn advance_cluster_time(&self, ct: &ClusterTime) {
        self.inner.core.lock().causal.advance_cluster_time(ct);
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.inner.core.lock().transaction.state
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_state().is_active()
    }

    /// Current transaction number of the server session
    pub fn txn_number(&self) -> TxnNumber {
        self.inner
            .core
            .lock()
            .server_session
            .as_ref()
            .map_or(0, ServerSession::txn_number)
    }

    pub fn pinned_server(&self) -> Option<ServerAddress> {
        self.inner.core.lock().transaction.pinned.clone()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a transaction. The first command run with this session carries
    /// `startTransaction`.
    pub fn start_transaction(&self, options: Option<TransactionOptions>) -> Result<()> {
        let mut core = self.inner.core.lock();
        core.check_not_ended()?;
        if core.transaction.state.is_active() {
            return Err(Error::invalid_state("transaction already in progress"));
        }

        let client_config = &self.inner.client.config().client;
        let client_defaults = TransactionOptions {
            read_concern: client_config.read_concern.clone(),
            write_concern: client_config.write_concern.clone(),
            read_preference: Some(client_config.read_preference),
            max_commit_time: None,
        };
        let options = options
            .unwrap_or_default()
            .or(&core.default_transaction_options)
            .or(&client_defaults);

        if options
            .write_concern
            .as_ref()
            .is_some_and(|wc| !wc.is_acknowledged())
        {
            return Err(Error::InvalidArgument(
                "transactions do not support unacknowledged write concerns".to_string(),
            ));
        }

        core.transaction.reset(options);
        let txn_number = core
            .server_session
            .as_mut()
            .map_or(0, ServerSession::increment_txn_number);
        info!(session_id = %core.id, txn_number, "transaction started");
        Ok(())
    }

    /// Commit the active transaction. Committing again after a commit re-sends
    /// `commitTransaction` with a majority write concern.
    pub async fn commit_transaction(&self, ctx: &Context) -> Result<()> {
        let op = {
            let mut core = self.inner.core.lock();
            core.check_not_ended()?;
            let retrying = match core.transaction.state {
                TransactionState::None => return Err(SessionError::NoTransactionStarted.into()),
                TransactionState::Aborted => {
                    return Err(Error::invalid_state(
                        "cannot call commitTransaction after calling abortTransaction",
                    ))
                }
                TransactionState::Starting => {
                    core.transaction.state = TransactionState::Committed;
                    return Ok(());
                }
                TransactionState::Committed if !core.transaction.commands_sent => return Ok(()),
                TransactionState::Committed => true,
                TransactionState::InProgress => false,
            };
            core.transaction.state = TransactionState::Committed;
            self.commit_operation(&core.transaction, retrying)
        };

        self.inner.client.execute_operation(ctx, op, Some(self)).await?;
        metrics::record_transaction("committed");
        info!(session_id = %self.id(), "transaction committed");
        Ok(())
    }

    fn commit_operation(&self, txn: &Transaction, retrying: bool) -> Operation {
        let mut cmd = doc! { "commitTransaction": 1 };
        if let Some(max_commit_time) = txn.options.max_commit_time {
            cmd.insert(
                "maxTimeMS",
                i64::try_from(max_commit_time.as_millis()).unwrap_or(i64::MAX),
            );
        }
        if let Some(token) = &txn.recovery_token {
            cmd.insert("recoveryToken", token.clone());
        }

        let write_concern = if retrying {
            Some(commit_retry_write_concern(
                txn.options.write_concern.as_ref(),
                self.inner.client.config().transaction.commit_retry_wtimeout_ms,
            ))
        } else {
            txn.options.write_concern.clone()
        };

        let mut op = Operation::new(CommandKind::CommitTransaction, "admin", cmd)
            .with_write_concern(write_concern);
        op.criteria.pinned = txn.pinned.clone();
        op
    }

    /// Abort the active transaction. Server errors are logged and ignored.
    pub async fn abort_transaction(&self, ctx: &Context) -> Result<()> {
        let op = {
            let mut core = self.inner.core.lock();
            core.check_not_ended()?;
            match core.transaction.state {
                TransactionState::None => return Err(SessionError::NoTransactionStarted.into()),
                TransactionState::Committed => {
                    return Err(Error::invalid_state(
                        "cannot call abortTransaction after calling commitTransaction",
                    ))
                }
                TransactionState::Aborted => {
                    return Err(Error::invalid_state("cannot call abortTransaction twice"))
                }
                TransactionState::Starting => {
                    core.transaction.state = TransactionState::Aborted;
                    return Ok(());
                }
                TransactionState::InProgress => {}
            }
            core.transaction.state = TransactionState::Aborted;

            let mut op = Operation::new(
                CommandKind::AbortTransaction,
                "admin",
                doc! { "abortTransaction": 1 },
            )
            .with_write_concern(core.transaction.options.write_concern.clone());
            op.criteria.pinned = core.transaction.pinned.clone();
            if let Some(token) = &core.transaction.recovery_token {
                op.command.insert("recoveryToken", token.clone());
            }
            op
        };

        if let Err(err) = self.inner.client.execute_operation(ctx, op, Some(self)).await {
            warn!(error = %err, "abortTransaction failed, ignoring");
        }
        self.unpin();
        metrics::record_transaction("aborted");
        info!(session_id = %self.id(), "transaction aborted");
        Ok(())
    }

    /// End the session, aborting any active transaction. The server session
    /// goes back to the pool; later use fails with `SessionEnded`.
    pub async fn end_session(&self, ctx: &Context) {
        if self.has_ended() {
            return;
        }
        if self.in_transaction() {
            let _ = self.abort_transaction(ctx).await;
        }

        let server_session = {
            let mut core = self.inner.core.lock();
            core.ended = true;
            core.server_session.take()
        };
        if let Some(server_session) = server_session {
            self.inner
                .client
                .session_pool()
                .check_in(server_session, self.inner.logical_session_timeout);
        }
        debug!(session_id = %self.id(), "session ended");
    }

    // ========================================================================
    // Command plumbing
    // ========================================================================

    /// Fails when the session belongs to another client or has ended
    pub(crate) fn validate(&self, client: &Client) -> Result<()> {
        if self.inner.client.id() != client.id() {
            return Err(SessionError::WrongClient.into());
        }
        self.inner.core.lock().check_not_ended()
    }

    /// Transaction number to send with a command of `kind`. Writes retried
    /// outside a transaction take a fresh number.
    pub(crate) fn txn_number_for(
        &self,
        kind: CommandKind,
        retryability: Retryability,
    ) -> Option<TxnNumber> {
        let mut core = self.inner.core.lock();
        let in_transaction = core.transaction.state.is_active() || kind.is_transaction_command();
        let server_session = core.server_session.as_mut()?;
        if in_transaction {
            Some(server_session.txn_number())
        } else if retryability == Retryability::Write {
            Some(server_session.increment_txn_number())
        } else {
            None
        }
    }

    /// Selector for a command in the active transaction
    pub(crate) fn transaction_selector(&self) -> Option<ServerSelector> {
        let core = self.inner.core.lock();
        if core.transaction.state.is_active() {
            core.transaction
                .options
                .read_preference
                .map(ServerSelector::Read)
        } else {
            None
        }
    }

    /// Attach `lsid`, `txnNumber`, transaction fields and `afterClusterTime`.
    /// Unacknowledged commands outside a transaction carry no session.
    pub(crate) fn apply_to_command(
        &self,
        cmd: &mut Document,
        kind: CommandKind,
        txn_number: Option<TxnNumber>,
        acknowledged: bool,
        description: &ServerDescription,
    ) {
        let mut core = self.inner.core.lock();
        let state = core.transaction.state;
        if !acknowledged && !state.is_active() && !kind.is_transaction_command() {
            return;
        }

        if let Some(server_session) = core.server_session.as_mut() {
            server_session.touch();
        }
        cmd.insert("lsid", core.lsid.clone());
        if let Some(txn_number) = txn_number {
            cmd.insert("txnNumber", txn_number);
        }

        let operation_time = core
            .causal_consistency
            .then(|| core.causal.operation_time())
            .flatten();

        match state {
            TransactionState::Starting => {
                cmd.remove("readConcern");
                cmd.remove("writeConcern");
                let mut read_concern = core
                    .transaction
                    .options
                    .read_concern
                    .as_ref()
                    .map(ReadConcern::to_document)
                    .unwrap_or_default();
                if let Some(ts) = operation_time {
                    read_concern.insert("afterClusterTime", ts);
                }
                if !read_concern.is_empty() {
                    cmd.insert("readConcern", read_concern);
                }
                cmd.insert("startTransaction", true);
                cmd.insert("autocommit", false);

                core.transaction.state = TransactionState::InProgress;
                core.transaction.commands_sent = true;
                if description.server_type.is_sharded() {
                    core.transaction.pinned = Some(description.address.clone());
                }
            }
            TransactionState::InProgress => {
                cmd.remove("readConcern");
                cmd.remove("writeConcern");
                cmd.insert("autocommit", false);
            }
            TransactionState::Committed | TransactionState::Aborted
                if kind.is_transaction_command() =>
            {
                cmd.insert("autocommit", false);
            }
            _ => {
                if kind.supports_read_concern() {
                    if let Some(ts) = operation_time {
                        set_after_cluster_time(cmd, ts);
                    }
                }
            }
        }
    }

    /// Advance causal state from a reply. Unacknowledged writes leave it untouched.
    pub(crate) fn update_from_reply(&self, header: &ReplyHeader, acknowledged: bool) {
        if !acknowledged {
            return;
        }
        let mut core = self.inner.core.lock();
        if let Some(ts) = header.operation_time {
            core.causal.advance_operation_time(ts);
        }
        if let Some(ct) = &header.cluster_time {
            core.causal.advance_cluster_time(ct);
        }
        if let Some(token) = &header.recovery_token {
            core.transaction.recovery_token = Some(token.clone());
        }
    }

    pub(crate) fn mark_dirty(&self) {
        if let Some(server_session) = self.inner.core.lock().server_session.as_mut() {
            server_session.mark_dirty();
        }
    }

    pub(crate) fn unpin(&self) {
        self.inner.core.lock().transaction.pinned = None;
    }
}
