//! Common type definitions for Causeway

use std::fmt;

use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

/// Server-side cursor identifier; `0` means the cursor is exhausted
pub type CursorId = i64;

/// Per-session transaction number
pub type TxnNumber = i64;

/// Maximum wire version reported by a server
pub type WireVersion = i32;

// ============================================================================
// Addressing
// ============================================================================

/// Address of a single server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, defaulting to port 27017
    pub fn parse(addr: &str) -> Self {
        match addr.rsplit_once(':') {
            Some((host, port)) => Self::new(host, port.parse().unwrap_or(27017)),
            None => Self::new(addr, 27017),
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Kind of server as reported by its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerType {
    Standalone,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    Mongos,
    LoadBalancer,
    Unknown,
}

impl ServerType {
    pub fn is_sharded(self) -> bool {
        self == ServerType::Mongos
    }
}

/// `database.collection` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse the `ns` field of a cursor reply
    pub fn parse(ns: &str) -> Option<Self> {
        let (db, coll) = ns.split_once('.')?;
        Some(Self::new(db, coll))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

// ============================================================================
// Read / Write Concerns
// ============================================================================

/// Read concern attached to read commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConcern {
    pub level: String,
}

impl ReadConcern {
    pub fn local() -> Self {
        Self::level("local")
    }

    pub fn majority() -> Self {
        Self::level("majority")
    }

    pub fn snapshot() -> Self {
        Self::level("snapshot")
    }

    pub fn level(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
        }
    }

    pub fn to_document(&self) -> Document {
        doc! { "level": self.level.clone() }
    }
}

/// The `w` field of a write concern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Acknowledgment {
    Nodes(u32),
    Tag(String),
}

impl Acknowledgment {
    pub fn majority() -> Self {
        Acknowledgment::Tag("majority".to_string())
    }
}

/// Write concern attached to write commands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<Acknowledgment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w_timeout_ms: Option<u64>,
}

impl WriteConcern {
    pub fn nodes(w: u32) -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(w)),
            ..Default::default()
        }
    }

    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::majority()),
            ..Default::default()
        }
    }

    /// `w: 0` without journaling
    pub fn unacknowledged() -> Self {
        Self::nodes(0)
    }

    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        match &self.w {
            Some(Acknowledgment::Nodes(n)) => {
                doc.insert("w", Bson::Int32(i32::try_from(*n).unwrap_or(i32::MAX)));
            }
            Some(Acknowledgment::Tag(tag)) => {
                doc.insert("w", tag.clone());
            }
            None => {}
        }
        if let Some(j) = self.journal {
            doc.insert("j", j);
        }
        if let Some(wtimeout) = self.w_timeout_ms {
            doc.insert("wtimeout", Bson::Int64(i64::try_from(wtimeout).unwrap_or(i64::MAX)));
        }
        doc
    }
}

/// Read preference used for server selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreference {
    pub fn mode(self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred => "primaryPreferred",
            ReadPreference::Secondary => "secondary",
            ReadPreference::SecondaryPreferred => "secondaryPreferred",
            ReadPreference::Nearest => "nearest",
        }
    }

    pub fn to_document(self) -> Document {
        doc! { "mode": self.mode() }
    }
}
