//! Causeway Driver - sessions, cursors, change streams and transactions
//!
//! Provides:
//! - Causal consistency (`operationTime` / `$clusterTime` tracking)
//! - Batch and typed cursors with implicit session lifetime
//! - Resumable change streams
//! - Client sessions, transactions and `with_transaction`
//! - Retryable reads and writes
//!
//! Networking, server monitoring and BSON encoding are supplied by the
//! embedding client through the traits in [`topology`].

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod change_stream;
pub mod client;
pub mod clock;
pub mod collection;
pub mod context;
pub mod cursor;
mod executor;
pub mod operation;
pub mod reply;
pub mod session;
pub mod topology;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use change_stream::{ChangeStream, ChangeStreamOptions, ChangeStreamTarget};
pub use client::Client;
pub use clock::{CausalState, ClusterClock, ClusterTime};
pub use collection::{
    Collection, CollectionOptions, Database, DeleteResult, FindOptions, InsertManyResult,
    InsertOneResult, UpdateResult,
};
pub use context::Context;
pub use cursor::{BatchCursor, Cursor, CursorOptions};
pub use session::{
    ClientSession, SessionOptions, TransactionOptions, TransactionState, TransactionStep,
};
pub use topology::{Connection, SelectionCriteria, Server, ServerDescription, ServerSelector, Topology};

pub use causeway_common::{Config, Error, Result};
