//! Scripted in-memory deployment
//!
//! Implements the topology traits over a list of server descriptions and a
//! per-command queue of scripted responses. Every command sent is recorded so
//! tests can assert on exactly what went over the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use parking_lot::Mutex;

use causeway_common::error::{Error, NetworkError, Result, ServerSelectionError};
use causeway_common::types::{ReadPreference, ServerAddress, ServerType, WireVersion};

use crate::context::Context;
use crate::operation::command_name;
use crate::topology::{
    Connection, SelectionCriteria, Server, ServerDescription, ServerSelector, Topology,
};

/// Scripted outcome of one command
#[derive(Debug, Clone)]
pub enum MockResponse {
    Reply(Document),
    /// The connection is closed before a reply arrives
    NetworkError,
    /// The reply never arrives
    Hang,
}

/// A command as received by the mock
#[derive(Debug, Clone)]
pub struct StartedCommand {
    pub name: String,
    pub command: Document,
    pub server: ServerAddress,
}

#[derive(Default)]
struct MockState {
    servers: Vec<ServerDescription>,
    responses: HashMap<String, VecDeque<MockResponse>>,
    selection_failures: VecDeque<String>,
    started: Vec<StartedCommand>,
}

/// In-memory deployment shared between a test and the client under test
#[derive(Clone, Default)]
pub struct MockDeployment {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockDeployment")
            .field("servers", &state.servers)
            .field("started", &state.started.len())
            .finish()
    }
}

fn server(address: ServerAddress, server_type: ServerType, wire: WireVersion) -> ServerDescription {
    ServerDescription {
        address,
        server_type,
        max_wire_version: wire,
        logical_session_timeout_minutes: Some(30),
    }
}

impl MockDeployment {
    pub fn new(servers: Vec<ServerDescription>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                servers,
                ..MockState::default()
            })),
        }
    }

    /// Primary on port 27017 and a secondary on 27018
    pub fn replica_set() -> Self {
        Self::new(vec![
            server(ServerAddress::new("localhost", 27017), ServerType::ReplicaSetPrimary, 17),
            server(ServerAddress::new("localhost", 27018), ServerType::ReplicaSetSecondary, 17),
        ])
    }

    /// Two mongos routers on ports 27017 and 27018
    pub fn sharded() -> Self {
        Self::new(vec![
            server(ServerAddress::new("localhost", 27017), ServerType::Mongos, 17),
            server(ServerAddress::new("localhost", 27018), ServerType::Mongos, 17),
        ])
    }

    pub fn single(
        address: ServerAddress,
        server_type: ServerType,
        max_wire_version: WireVersion,
        logical_session_timeout_minutes: Option<u64>,
    ) -> Self {
        Self::new(vec![ServerDescription {
            address,
            server_type,
            max_wire_version,
            logical_session_timeout_minutes,
        }])
    }

    /// Queue a response for the next `command` received
    pub fn push_response(&self, command: &str, response: MockResponse) {
        self.state
            .lock()
            .responses
            .entry(command.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_reply(&self, command: &str, reply: Document) {
        self.push_response(command, MockResponse::Reply(reply));
    }

    pub fn push_network_error(&self, command: &str) {
        self.push_response(command, MockResponse::NetworkError);
    }

    pub fn push_hang(&self, command: &str) {
        self.push_response(command, MockResponse::Hang);
    }

    /// Make the next server selection fail
    pub fn fail_next_selection(&self, message: &str) {
        self.state.lock().selection_failures.push_back(message.to_string());
    }

    pub fn started(&self) -> Vec<StartedCommand> {
        self.state.lock().started.clone()
    }

    pub fn started_names(&self) -> Vec<String> {
        self.state.lock().started.iter().map(|c| c.name.clone()).collect()
    }

    /// Every `name` command received, in order
    pub fn commands(&self, name: &str) -> Vec<Document> {
        self.state
            .lock()
            .started
            .iter()
            .filter(|c| c.name == name)
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn clear_started(&self) {
        self.state.lock().started.clear();
    }

    fn next_response(&self, request: &Document, address: &ServerAddress) -> MockResponse {
        let name = command_name(request).to_string();
        let mut state = self.state.lock();
        state.started.push(StartedCommand {
            name: name.clone(),
            command: request.clone(),
            server: address.clone(),
        });
        state
            .responses
            .get_mut(&name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| MockResponse::Reply(default_reply(&name, request)))
    }
}

/// Reply used when nothing was scripted for a command
fn default_reply(name: &str, request: &Document) -> Document {
    let db = request.get_str("$db").unwrap_or("test");
    match name {
        "find" | "aggregate" => {
            let coll = match request.get(name) {
                Some(Bson::String(coll)) => coll.clone(),
                _ => "$cmd.aggregate".to_string(),
            };
            doc! {
                "ok": 1,
                "cursor": { "id": 0_i64, "ns": format!("{db}.{coll}"), "firstBatch": [] },
            }
        }
        "getMore" => doc! { "ok": 1, "cursor": { "id": 0_i64, "nextBatch": [] } },
        "insert" => {
            let n = request.get_array("documents").map_or(0, Vec::len);
            doc! { "ok": 1, "n": i32::try_from(n).unwrap_or(i32::MAX) }
        }
        "update" | "delete" => doc! { "ok": 1, "n": 1 },
        "findAndModify" => doc! { "ok": 1, "value": Bson::Null },
        _ => doc! { "ok": 1 },
    }
}

fn is_writable(server_type: ServerType) -> bool {
    !matches!(server_type, ServerType::ReplicaSetSecondary | ServerType::Unknown)
}

#[async_trait]
impl Topology for MockDeployment {
    async fn select_server(
        &self,
        _ctx: &Context,
        criteria: &SelectionCriteria,
    ) -> Result<Arc<dyn Server>> {
        let mut state = self.state.lock();
        if let Some(message) = state.selection_failures.pop_front() {
            return Err(ServerSelectionError::new(message).into());
        }

        if let Some(pinned) = &criteria.pinned {
            if let Some(description) = state.servers.iter().find(|s| &s.address == pinned) {
                return Ok(self.server_for(description.clone()));
            }
        }

        let suitable: Vec<&ServerDescription> = state
            .servers
            .iter()
            .filter(|s| match criteria.selector {
                ServerSelector::Write | ServerSelector::Read(ReadPreference::Primary) => {
                    is_writable(s.server_type)
                }
                ServerSelector::Read(_) => s.server_type != ServerType::Unknown,
            })
            .collect();

        let chosen = suitable
            .iter()
            .find(|s| !criteria.deprioritized.contains(&s.address))
            .or_else(|| suitable.first())
            .ok_or_else(|| Error::from(ServerSelectionError::new("no suitable server")))?;
        Ok(self.server_for((*chosen).clone()))
    }

    fn logical_session_timeout_minutes(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .servers
            .iter()
            .filter(|s| s.server_type != ServerType::Unknown)
            .map(|s| s.logical_session_timeout_minutes)
            .try_fold(u64::MAX, |min, lst| lst.map(|m| min.min(m)))
            .filter(|m| *m != u64::MAX)
    }
}

impl MockDeployment {
    fn server_for(&self, description: ServerDescription) -> Arc<dyn Server> {
        Arc::new(MockServer {
            description,
            deployment: self.clone(),
        })
    }
}

struct MockServer {
    description: ServerDescription,
    deployment: MockDeployment,
}

#[async_trait]
impl Server for MockServer {
    fn description(&self) -> ServerDescription {
        self.description.clone()
    }

    async fn connection(&self, _ctx: &Context) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MockConnection {
            address: self.description.address.clone(),
            deployment: self.deployment.clone(),
        }))
    }
}

struct MockConnection {
    address: ServerAddress,
    deployment: MockDeployment,
}

#[async_trait]
impl Connection for MockConnection {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    async fn round_trip(&mut self, _ctx: &Context, request: Document) -> Result<Document> {
        match self.deployment.next_response(&request, &self.address) {
            MockResponse::Reply(reply) => Ok(reply),
            MockResponse::NetworkError => {
                Err(NetworkError::closed("connection closed by mock server").into())
            }
            MockResponse::Hang => std::future::pending().await,
        }
    }
}
