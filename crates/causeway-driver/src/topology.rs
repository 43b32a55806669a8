//! Server selection and wire round trips
//!
//! The driver core never talks to sockets. Monitoring, pooling and BSON
//! encoding sit behind these traits and are provided by the embedding client.

use std::sync::Arc;

use async_trait::async_trait;
use bson::Document;

use causeway_common::error::Result;
use causeway_common::types::{ReadPreference, ServerAddress, ServerType, WireVersion};

use crate::context::Context;

/// Wire version that introduced sessions, cluster times and retryable writes (3.6)
pub const SESSIONS_MIN_WIRE_VERSION: WireVersion = 6;

/// What the handshake told us about a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub max_wire_version: WireVersion,
    pub logical_session_timeout_minutes: Option<u64>,
}

impl ServerDescription {
    pub fn supports_sessions(&self) -> bool {
        self.logical_session_timeout_minutes.is_some()
    }

    pub fn supports_cluster_time(&self) -> bool {
        self.max_wire_version >= SESSIONS_MIN_WIRE_VERSION
    }

    pub fn supports_retryable_writes(&self) -> bool {
        self.supports_sessions()
            && self.server_type != ServerType::Standalone
            && self.max_wire_version >= SESSIONS_MIN_WIRE_VERSION
    }
}

/// Which kind of server an operation needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSelector {
    Read(ReadPreference),
    Write,
}

/// Selector plus the constraints accumulated by sessions and retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub selector: ServerSelector,
    /// Servers to avoid when others are suitable, e.g. the server a retry follows
    pub deprioritized: Vec<ServerAddress>,
    /// Server the session is pinned to for the current transaction
    pub pinned: Option<ServerAddress>,
}

impl SelectionCriteria {
    pub fn new(selector: ServerSelector) -> Self {
        Self {
            selector,
            deprioritized: Vec::new(),
            pinned: None,
        }
    }
}

/// The deployment as seen by the driver
#[async_trait]
pub trait Topology: Send + Sync {
    /// Pick a server suitable for `criteria`
    async fn select_server(
        &self,
        ctx: &Context,
        criteria: &SelectionCriteria,
    ) -> Result<Arc<dyn Server>>;

    /// Smallest `logicalSessionTimeoutMinutes` across data-bearing servers,
    /// `None` when the deployment does not support sessions
    fn logical_session_timeout_minutes(&self) -> Option<u64>;
}

/// A selected server
#[async_trait]
pub trait Server: Send + Sync {
    fn description(&self) -> ServerDescription;

    fn address(&self) -> ServerAddress {
        self.description().address
    }

    /// Check a connection out of the server's pool
    async fn connection(&self, ctx: &Context) -> Result<Box<dyn Connection>>;
}

/// A pooled connection able to run one command at a time
#[async_trait]
pub trait Connection: Send {
    fn address(&self) -> &ServerAddress;

    /// Send `request` and wait for its reply. Transport failures surface as
    /// `Error::Network`; `ok: 0` replies are returned as documents.
    async fn round_trip(&mut self, ctx: &Context, request: Document) -> Result<Document>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description(server_type: ServerType, wire: WireVersion, lst: Option<u64>) -> ServerDescription {
        ServerDescription {
            address: ServerAddress::new("localhost", 27017),
            server_type,
            max_wire_version: wire,
            logical_session_timeout_minutes: lst,
        }
    }

    #[test]
    fn test_retryable_writes_support() {
        assert!(description(ServerType::ReplicaSetPrimary, 8, Some(30)).supports_retryable_writes());
        assert!(description(ServerType::Mongos, 6, Some(30)).supports_retryable_writes());
        assert!(!description(ServerType::Standalone, 8, Some(30)).supports_retryable_writes());
        assert!(!description(ServerType::ReplicaSetPrimary, 5, Some(30)).supports_retryable_writes());
        assert!(!description(ServerType::ReplicaSetPrimary, 8, None).supports_retryable_writes());
    }

    #[test]
    fn test_cluster_time_support() {
        assert!(description(ServerType::Standalone, 6, None).supports_cluster_time());
        assert!(!description(ServerType::Standalone, 5, None).supports_cluster_time());
    }
}
