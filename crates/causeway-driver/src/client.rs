//! Client handle
//!
//! Owns the topology, the server session pool and the client-wide cluster
//! clock. Cloning a [`Client`] is cheap.

use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use tracing::info;
use uuid::Uuid;

use causeway_common::error::{Result, SessionError};
use causeway_common::Config;

use crate::change_stream::{ChangeStream, ChangeStreamOptions, ChangeStreamTarget};
use crate::clock::{ClusterClock, ClusterTime};
use crate::collection::Database;
use crate::context::Context;
use crate::session::{ClientSession, ServerSessionPool, SessionOptions};
use crate::topology::Topology;

struct ClientInner {
    id: Uuid,
    topology: Arc<dyn Topology>,
    pool: ServerSessionPool,
    clock: ClusterClock,
    config: Config,
}

/// Entry point for sessions, databases and change streams
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("checked_out_sessions", &self.inner.pool.checked_out())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client over an already-connected topology
    pub fn with_topology(topology: Arc<dyn Topology>, config: Config) -> Self {
        let margin = Duration::from_secs(config.session.expiry_margin_minutes * 60);
        let id = Uuid::new_v4();
        info!(client_id = %id, "client created");

        Self {
            inner: Arc::new(ClientInner {
                id,
                topology,
                pool: ServerSessionPool::new(margin),
                clock: ClusterClock::new(),
                config,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn topology(&self) -> &Arc<dyn Topology> {
        &self.inner.topology
    }

    pub(crate) fn session_pool(&self) -> &ServerSessionPool {
        &self.inner.pool
    }

    /// Server sessions currently held by live client sessions
    pub fn checked_out_sessions(&self) -> usize {
        self.inner.pool.checked_out()
    }

    /// Newest `$clusterTime` seen by any session of this client
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.inner.clock.get()
    }

    pub(crate) fn advance_cluster_time(&self, ct: &ClusterTime) {
        self.inner.clock.advance(ct);
    }

    fn logical_session_timeout(&self) -> Option<Duration> {
        self.inner
            .topology
            .logical_session_timeout_minutes()
            .map(|minutes| Duration::from_secs(minutes * 60))
    }

    /// Start an explicit session
    pub fn start_session(&self, options: Option<SessionOptions>) -> Result<ClientSession> {
        let timeout = self.logical_session_timeout();
        if timeout.is_none() {
            return Err(SessionError::NotSupported.into());
        }
        Ok(ClientSession::new(
            self.clone(),
            false,
            timeout,
            options.unwrap_or_default(),
        ))
    }

    pub(crate) fn start_implicit_session(&self, logical_session_timeout_minutes: Option<u64>) -> ClientSession {
        let timeout = logical_session_timeout_minutes
            .map(|minutes| Duration::from_secs(minutes * 60))
            .or_else(|| self.logical_session_timeout());
        ClientSession::new(self.clone(), true, timeout, SessionOptions::default())
    }

    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    /// Watch every database in the deployment
    pub async fn watch(
        &self,
        ctx: &Context,
        pipeline: Vec<Document>,
        options: Option<ChangeStreamOptions>,
        session: Option<&ClientSession>,
    ) -> Result<ChangeStream> {
        ChangeStream::open(
            ctx,
            self.clone(),
            ChangeStreamTarget::Cluster,
            pipeline,
            options.unwrap_or_default(),
            session,
        )
        .await
    }
}
