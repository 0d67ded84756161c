//! Event-bus protocol shared by all runtime components.
//!
//! Components publish notifications on a `tokio::sync::broadcast` bus; hosts and
//! sibling components subscribe instead of registering callbacks. Dropping a
//! receiver is the unsubscribe.

use crate::model::{CommandType, ConnectionState, QueueItem};

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Connection(ConnectionMessage),
    Sync(SyncMessage),
    Queue(QueueMessage),
    Command(CommandMessage),
}

/// Connectivity transitions published by the connection monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionMessage {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
}

/// State publication outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    StateWritten {
        server_timestamp: i64,
        carried_queue: bool,
    },
    WriteFailed {
        error_class: &'static str,
    },
    /// Queue intent was parked in the offline buffer.
    QueueBuffered {
        buffered_entries: usize,
    },
    /// A buffered entry exhausted its retries.
    BufferedUpdateDropped {
        retry_count: u32,
    },
    /// Startup could not reach the backend; the node runs without sync.
    Degraded {
        reason: String,
    },
}

/// Remote queue edits after conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    RemoteQueueApplied {
        now_playing: Option<QueueItem>,
        active_queue: Vec<QueueItem>,
        priority_queue: Vec<QueueItem>,
    },
    RemoteUpdateDiscarded {
        remote_timestamp: i64,
        local_timestamp: i64,
    },
    RemoteUpdateDeferred {
        remote_timestamp: i64,
    },
}

/// Command dispatch outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandMessage {
    Executed {
        id: String,
        command_type: CommandType,
        success: bool,
    },
    Skipped {
        id: String,
        reason: String,
    },
    /// Command held until the connection comes back.
    Queued {
        id: String,
        pending: usize,
    },
}
