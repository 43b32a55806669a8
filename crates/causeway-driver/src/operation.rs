//! Operation descriptions
//!
//! An [`Operation`] is a command document plus everything the executor needs
//! to run it: target database, retry class, server selection and concerns.

use bson::{doc, Bson, Document, Timestamp};

use causeway_common::types::{ReadConcern, ReadPreference, WireVersion, WriteConcern};

use crate::clock::ClusterTime;
use crate::topology::{SelectionCriteria, ServerDescription, ServerSelector};

/// Commands the driver core knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Find,
    Aggregate,
    GetMore,
    KillCursors,
    Insert,
    Update,
    Delete,
    FindAndModify,
    CommitTransaction,
    AbortTransaction,
    /// Any other command, run through `Database::run_command`
    Other,
}

impl CommandKind {
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Find => "find",
            CommandKind::Aggregate => "aggregate",
            CommandKind::GetMore => "getMore",
            CommandKind::KillCursors => "killCursors",
            CommandKind::Insert => "insert",
            CommandKind::Update => "update",
            CommandKind::Delete => "delete",
            CommandKind::FindAndModify => "findAndModify",
            CommandKind::CommitTransaction => "commitTransaction",
            CommandKind::AbortTransaction => "abortTransaction",
            CommandKind::Other => "command",
        }
    }

    /// Whether the command accepts a `readConcern`, and with it `afterClusterTime`
    pub fn supports_read_concern(self) -> bool {
        matches!(self, CommandKind::Find | CommandKind::Aggregate)
    }

    pub fn is_transaction_command(self) -> bool {
        matches!(self, CommandKind::CommitTransaction | CommandKind::AbortTransaction)
    }

    fn default_retryability(self) -> Retryability {
        match self {
            CommandKind::Find | CommandKind::Aggregate => Retryability::Read,
            CommandKind::CommitTransaction | CommandKind::AbortTransaction => Retryability::Write,
            _ => Retryability::None,
        }
    }
}

/// Retry class of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    None,
    Read,
    Write,
}

/// A command ready to be handed to the executor
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: CommandKind,
    pub db: String,
    pub command: Document,
    pub retryability: Retryability,
    pub criteria: SelectionCriteria,
    pub write_concern: Option<WriteConcern>,
    pub read_concern: Option<ReadConcern>,
    /// `startAtOperationTime` for a `$changeStream` stage, added only when the
    /// selected server is at least the paired wire version
    pub(crate) start_at_operation_time: Option<(Timestamp, WireVersion)>,
}

impl Operation {
    pub fn new(kind: CommandKind, db: impl Into<String>, command: Document) -> Self {
        let selector = match kind {
            CommandKind::Find | CommandKind::Aggregate | CommandKind::GetMore => {
                ServerSelector::Read(ReadPreference::Primary)
            }
            _ => ServerSelector::Write,
        };
        Self {
            kind,
            db: db.into(),
            command,
            retryability: kind.default_retryability(),
            criteria: SelectionCriteria::new(selector),
            write_concern: None,
            read_concern: None,
            start_at_operation_time: None,
        }
    }

    #[must_use]
    pub fn with_retryability(mut self, retryability: Retryability) -> Self {
        self.retryability = retryability;
        self
    }

    #[must_use]
    pub fn with_selector(mut self, selector: ServerSelector) -> Self {
        self.criteria.selector = selector;
        self
    }

    #[must_use]
    pub fn with_write_concern(mut self, write_concern: Option<WriteConcern>) -> Self {
        self.write_concern = write_concern;
        self
    }

    #[must_use]
    pub fn with_read_concern(mut self, read_concern: Option<ReadConcern>) -> Self {
        self.read_concern = read_concern;
        self
    }

    pub fn is_acknowledged(&self) -> bool {
        self.write_concern
            .as_ref()
            .map_or(true, WriteConcern::is_acknowledged)
    }

    /// Copy the command and attach the fields that do not depend on a session:
    /// `$db`, concerns, read preference and `$clusterTime`.
    pub(crate) fn build(
        &self,
        description: &ServerDescription,
        cluster_time: Option<&ClusterTime>,
    ) -> Document {
        let mut cmd = self.command.clone();
        cmd.insert("$db", self.db.clone());

        if let Some(rc) = &self.read_concern {
            if self.kind.supports_read_concern() {
                cmd.insert("readConcern", rc.to_document());
            }
        }
        if let Some(wc) = &self.write_concern {
            let wc_doc = wc.to_document();
            if !wc_doc.is_empty() {
                cmd.insert("writeConcern", wc_doc);
            }
        }
        if let ServerSelector::Read(pref) = self.criteria.selector {
            if description.server_type.is_sharded() && pref != ReadPreference::Primary {
                cmd.insert("$readPreference", pref.to_document());
            }
        }
        if description.supports_cluster_time() {
            if let Some(ct) = cluster_time {
                cmd.insert("$clusterTime", ct.document().clone());
            }
        }
        if let Some((ts, min_wire_version)) = self.start_at_operation_time {
            if description.max_wire_version >= min_wire_version {
                if let Some(stage) = change_stream_stage_mut(&mut cmd) {
                    stage.insert("startAtOperationTime", ts);
                }
            }
        }
        cmd
    }
}

fn change_stream_stage_mut(cmd: &mut Document) -> Option<&mut Document> {
    match cmd.get_array_mut("pipeline").ok()?.first_mut()? {
        Bson::Document(stage) => stage.get_document_mut("$changeStream").ok(),
        _ => None,
    }
}

/// Merge `afterClusterTime` into the command's read concern, keeping any level already set
pub(crate) fn set_after_cluster_time(cmd: &mut Document, operation_time: bson::Timestamp) {
    let mut read_concern = match cmd.remove("readConcern") {
        Some(Bson::Document(rc)) => rc,
        _ => Document::new(),
    };
    read_concern.insert("afterClusterTime", operation_time);
    cmd.insert("readConcern", read_concern);
}

/// Name of the command in `cmd`, which is always its first key
pub fn command_name(cmd: &Document) -> &str {
    cmd.keys().next().map_or("", String::as_str)
}

/// `{ killCursors: <coll>, cursors: [<id>] }`
pub(crate) fn kill_cursors_command(coll: &str, id: i64) -> Document {
    doc! { "killCursors": coll, "cursors": [id] }
}
