//! Shared-backend abstractions and concrete implementations.

pub mod memory;
pub mod sqlite;

use std::sync::mpsc::Receiver;

use crate::connection_monitor::LifecycleEvent;
use crate::error::SyncError;
use crate::model::{
    Command, CommandEnvelope, ExecutionRecord, RemoteStateChange, StateDelta, StateRecord,
};

/// Items delivered on a node-scoped command subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Lifecycle(LifecycleEvent),
    Envelope(CommandEnvelope),
}

/// Interface implemented by the shared, eventually-consistent backend.
///
/// Covers the three external contracts: the per-node state record with its
/// change feed, the append-only command log, and the node-scoped pub/sub
/// channel. Every call may block on I/O and must not be made from the
/// playback path.
pub trait SyncBackend: Send + Sync {
    fn fetch_state(&self, node_id: &str) -> Result<Option<StateRecord>, SyncError>;

    /// Returns the node's record, creating a default one on first contact.
    fn ensure_state(&self, node_id: &str) -> Result<StateRecord, SyncError>;

    /// Partial-field upsert. Fields absent from `delta` are left untouched.
    /// Returns the server timestamp assigned to the write.
    fn upsert_state(&self, node_id: &str, delta: &StateDelta, origin: &str)
        -> Result<i64, SyncError>;

    fn subscribe_state(&self, node_id: &str) -> Result<Receiver<RemoteStateChange>, SyncError>;

    fn insert_command(&self, command: &Command) -> Result<(), SyncError>;

    fn fetch_command(&self, command_id: &str) -> Result<Option<Command>, SyncError>;

    /// Pending commands for `node_id` issued at or after `since_ms`, oldest first.
    fn fetch_pending_commands(&self, node_id: &str, since_ms: i64)
        -> Result<Vec<Command>, SyncError>;

    /// Writes the status fields present in `record`.
    fn update_command_status(
        &self,
        command_id: &str,
        record: &ExecutionRecord,
    ) -> Result<(), SyncError>;

    fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), SyncError>;

    fn subscribe_commands(&self, node_id: &str) -> Result<Receiver<ChannelEvent>, SyncError>;

    /// Lightweight liveness RPC. `Unsupported` when the deployment lacks it.
    fn heartbeat(&self, node_id: &str, at_ms: i64) -> Result<(), SyncError>;

    /// Direct `lastHeartbeat` field update used when the RPC is unavailable.
    fn touch_heartbeat(&self, node_id: &str, at_ms: i64) -> Result<(), SyncError>;
}
