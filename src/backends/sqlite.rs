//! SQLite-backed shared store.
//!
//! Several node processes can point at the same database file. Change feeds
//! and the command channel are tailed by watcher threads that poll the
//! database, so a write from any process reaches every subscriber.

use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::backends::{ChannelEvent, SyncBackend};
use crate::connection_monitor::LifecycleEvent;
use crate::error::SyncError;
use crate::lock_or_recover;
use crate::model::{
    now_unix_ms, Command, CommandEnvelope, CommandStatus, CommandType, ExecutionRecord,
    PlaybackStatus, QueueItem, RemoteStateChange, StateDelta, StateRecord,
};

const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(250);

const STATE_COLUMNS: &str = "node_id, status, now_playing, current_position, volume, \
     active_queue, priority_queue, last_updated, is_online, last_heartbeat, updated_by";

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    watch_interval: Duration,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    SyncError::TransientNetwork(format!(
                        "create {}: {}",
                        parent.display(),
                        err
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(2))?;
        Self::from_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self, SyncError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, SyncError> {
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            watch_interval: DEFAULT_WATCH_INTERVAL,
        })
    }

    /// Wraps a connection as-is, without creating missing tables.
    pub fn from_existing_schema(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            watch_interval: DEFAULT_WATCH_INTERVAL,
        }
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval.max(Duration::from_millis(5));
        self
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS player_state (
            node_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            now_playing TEXT,
            current_position REAL NOT NULL DEFAULT 0,
            volume REAL NOT NULL DEFAULT 1,
            active_queue TEXT NOT NULL DEFAULT '[]',
            priority_queue TEXT NOT NULL DEFAULT '[]',
            last_updated INTEGER NOT NULL,
            is_online INTEGER NOT NULL DEFAULT 0,
            last_heartbeat INTEGER NOT NULL DEFAULT 0,
            updated_by TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS commands (
            id TEXT PRIMARY KEY,
            target_node_id TEXT NOT NULL,
            type TEXT NOT NULL,
            payload TEXT NOT NULL,
            issuer TEXT NOT NULL,
            issued_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            executed_at INTEGER,
            result TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_commands_target_status
            ON commands(target_node_id, status, issued_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS node_liveness (
            node_id TEXT PRIMARY KEY,
            last_seen INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS channel_messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

struct StateRow {
    record: StateRecord,
    updated_by: String,
}

fn read_state_row(row: &Row<'_>) -> rusqlite::Result<(StateRow, [String; 3])> {
    let status: String = row.get(1)?;
    let now_playing: Option<String> = row.get(2)?;
    let active_queue: String = row.get(5)?;
    let priority_queue: String = row.get(6)?;
    let record = StateRecord {
        node_id: row.get(0)?,
        status: PlaybackStatus::parse(&status).unwrap_or_default(),
        now_playing_video: None,
        current_position: row.get(3)?,
        volume: row.get(4)?,
        active_queue: Vec::new(),
        priority_queue: Vec::new(),
        last_updated: row.get(7)?,
        is_online: row.get::<_, i64>(8)? != 0,
        last_heartbeat: row.get(9)?,
    };
    Ok((
        StateRow {
            record,
            updated_by: row.get(10)?,
        },
        [now_playing.unwrap_or_default(), active_queue, priority_queue],
    ))
}

/// Fills the JSON-encoded columns of a row read by `read_state_row`.
fn decode_state_row((mut row, json): (StateRow, [String; 3])) -> Result<StateRow, SyncError> {
    let [now_playing, active_queue, priority_queue] = json;
    if !now_playing.is_empty() {
        row.record.now_playing_video = serde_json::from_str::<Option<QueueItem>>(&now_playing)?;
    }
    row.record.active_queue = serde_json::from_str(&active_queue)?;
    row.record.priority_queue = serde_json::from_str(&priority_queue)?;
    Ok(row)
}

fn select_state(conn: &Connection, node_id: &str) -> Result<Option<StateRow>, SyncError> {
    let raw = conn
        .query_row(
            &format!("SELECT {STATE_COLUMNS} FROM player_state WHERE node_id = ?1"),
            params![node_id],
            read_state_row,
        )
        .optional()?;
    raw.map(decode_state_row).transpose()
}

fn next_timestamp(conn: &Connection) -> Result<i64, SyncError> {
    let latest: Option<i64> =
        conn.query_row("SELECT MAX(last_updated) FROM player_state", [], |row| {
            row.get(0)
        })?;
    Ok(now_unix_ms().max(latest.unwrap_or(0).saturating_add(1)))
}

fn write_state(
    conn: &Connection,
    record: &StateRecord,
    updated_by: &str,
) -> Result<(), SyncError> {
    let now_playing = match &record.now_playing_video {
        Some(item) => Some(serde_json::to_string(item)?),
        None => None,
    };
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO player_state ({STATE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            record.node_id,
            record.status.to_string(),
            now_playing,
            record.current_position,
            record.volume,
            serde_json::to_string(&record.active_queue)?,
            serde_json::to_string(&record.priority_queue)?,
            record.last_updated,
            record.is_online as i64,
            record.last_heartbeat,
            updated_by,
        ],
    )?;
    Ok(())
}

fn read_command_core(row: &Row<'_>) -> rusqlite::Result<(Command, String, String)> {
    let command_type: String = row.get(2)?;
    let payload: String = row.get(3)?;
    let status: String = row.get(6)?;
    let command = Command {
        id: row.get(0)?,
        target_node_id: row.get(1)?,
        command_type: CommandType::parse(&command_type).unwrap_or(CommandType::Play),
        payload: serde_json::Value::Null,
        issuer: row.get(4)?,
        issued_at: row.get(5)?,
        status: CommandStatus::parse(&status).unwrap_or_default(),
        executed_at: None,
        execution_result: None,
    };
    Ok((command, command_type, payload))
}

fn decode_command(
    (mut command, command_type, payload): (Command, String, String),
) -> Result<Command, SyncError> {
    if CommandType::parse(&command_type).is_none() {
        return Err(SyncError::SchemaMismatch(format!(
            "unknown command type {command_type}"
        )));
    }
    command.payload = serde_json::from_str(&payload)?;
    Ok(command)
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

impl SyncBackend for SqliteBackend {
    fn fetch_state(&self, node_id: &str) -> Result<Option<StateRecord>, SyncError> {
        let conn = lock_or_recover(&self.conn);
        Ok(select_state(&conn, node_id)?.map(|row| row.record))
    }

    fn ensure_state(&self, node_id: &str) -> Result<StateRecord, SyncError> {
        let conn = lock_or_recover(&self.conn);
        if let Some(row) = select_state(&conn, node_id)? {
            return Ok(row.record);
        }
        let mut record = StateRecord::new(node_id);
        record.last_updated = next_timestamp(&conn)?;
        write_state(&conn, &record, node_id)?;
        Ok(record)
    }

    fn upsert_state(
        &self,
        node_id: &str,
        delta: &StateDelta,
        origin: &str,
    ) -> Result<i64, SyncError> {
        let conn = lock_or_recover(&self.conn);
        let mut record = select_state(&conn, node_id)?
            .map(|row| row.record)
            .unwrap_or_else(|| StateRecord::new(node_id));
        delta.apply_to(&mut record);
        record.last_updated = next_timestamp(&conn)?;
        write_state(&conn, &record, origin)?;
        Ok(record.last_updated)
    }

    fn subscribe_state(&self, node_id: &str) -> Result<Receiver<RemoteStateChange>, SyncError> {
        let cursor = {
            let conn = lock_or_recover(&self.conn);
            select_state(&conn, node_id)?
                .map(|row| row.record.last_updated)
                .unwrap_or(0)
        };
        let (tx, rx) = channel();
        let conn = Arc::clone(&self.conn);
        let node_id = node_id.to_string();
        let interval = self.watch_interval;
        thread::Builder::new()
            .name(format!("state-feed-{node_id}"))
            .spawn(move || watch_state(conn, node_id, cursor, interval, tx))
            .map_err(|err| SyncError::TransientNetwork(err.to_string()))?;
        Ok(rx)
    }

    fn insert_command(&self, command: &Command) -> Result<(), SyncError> {
        let conn = lock_or_recover(&self.conn);
        let inserted = conn.execute(
            "INSERT INTO commands (id, target_node_id, type, payload, issuer, issued_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                command.id,
                command.target_node_id,
                command.command_type.to_string(),
                serde_json::to_string(&command.payload)?,
                command.issuer,
                command.issued_at,
                command.status.to_string(),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => {
                Err(SyncError::DuplicateCommand(command.id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn fetch_command(&self, command_id: &str) -> Result<Option<Command>, SyncError> {
        let conn = lock_or_recover(&self.conn);
        let raw = conn
            .query_row(
                "SELECT id, target_node_id, type, payload, issuer, issued_at, status
                 FROM commands WHERE id = ?1",
                params![command_id],
                read_command_core,
            )
            .optional()?;
        let Some(mut command) = raw.map(decode_command).transpose()? else {
            return Ok(None);
        };

        // Deployments predating execution results only carry the status column.
        let extended = conn
            .query_row(
                "SELECT executed_at, result FROM commands WHERE id = ?1",
                params![command_id],
                |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .map_err(SyncError::from);
        match extended {
            Ok((executed_at, result)) => {
                command.executed_at = executed_at;
                command.execution_result = match result {
                    Some(text) => Some(serde_json::from_str(&text)?),
                    None => None,
                };
            }
            Err(SyncError::SchemaMismatch(_)) => {}
            Err(err) => return Err(err),
        }
        Ok(Some(command))
    }

    fn fetch_pending_commands(
        &self,
        node_id: &str,
        since_ms: i64,
    ) -> Result<Vec<Command>, SyncError> {
        let conn = lock_or_recover(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, target_node_id, type, payload, issuer, issued_at, status
             FROM commands
             WHERE target_node_id = ?1 AND status = 'pending' AND issued_at >= ?2
             ORDER BY issued_at ASC",
        )?;
        let rows = stmt.query_map(params![node_id, since_ms], read_command_core)?;

        let mut commands = Vec::new();
        for row in rows {
            match decode_command(row?) {
                Ok(command) => commands.push(command),
                Err(err) => debug!("SqliteBackend: skipping undecodable command: {}", err),
            }
        }
        Ok(commands)
    }

    fn update_command_status(
        &self,
        command_id: &str,
        record: &ExecutionRecord,
    ) -> Result<(), SyncError> {
        let conn = lock_or_recover(&self.conn);
        let result = match &record.result {
            Some(result) => Some(serde_json::to_string(result)?),
            None => None,
        };
        let changed = match (record.executed_at, result) {
            (Some(executed_at), Some(result)) => conn.execute(
                "UPDATE commands SET status = ?1, executed_at = ?2, result = ?3 WHERE id = ?4",
                params![record.status.to_string(), executed_at, result, command_id],
            )?,
            (Some(executed_at), None) => conn.execute(
                "UPDATE commands SET status = ?1, executed_at = ?2 WHERE id = ?3",
                params![record.status.to_string(), executed_at, command_id],
            )?,
            (None, Some(result)) => conn.execute(
                "UPDATE commands SET status = ?1, result = ?2 WHERE id = ?3",
                params![record.status.to_string(), result, command_id],
            )?,
            (None, None) => conn.execute(
                "UPDATE commands SET status = ?1 WHERE id = ?2",
                params![record.status.to_string(), command_id],
            )?,
        };
        if changed == 0 {
            return Err(SyncError::TransientNetwork(format!(
                "unknown command {command_id}"
            )));
        }
        Ok(())
    }

    fn publish_command(&self, envelope: &CommandEnvelope) -> Result<(), SyncError> {
        let body = serde_json::to_string(envelope)?;
        let conn = lock_or_recover(&self.conn);
        conn.execute(
            "INSERT INTO channel_messages (node_id, body, created_at) VALUES (?1, ?2, ?3)",
            params![envelope.command.target_node_id, body, now_unix_ms()],
        )?;
        Ok(())
    }

    fn subscribe_commands(&self, node_id: &str) -> Result<Receiver<ChannelEvent>, SyncError> {
        let cursor: i64 = {
            let conn = lock_or_recover(&self.conn);
            conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM channel_messages",
                [],
                |row| row.get(0),
            )?
        };
        let (tx, rx) = channel();
        let conn = Arc::clone(&self.conn);
        let node_id = node_id.to_string();
        let interval = self.watch_interval;
        thread::Builder::new()
            .name(format!("command-channel-{node_id}"))
            .spawn(move || watch_channel(conn, node_id, cursor, interval, tx))
            .map_err(|err| SyncError::TransientNetwork(err.to_string()))?;
        Ok(rx)
    }

    fn heartbeat(&self, node_id: &str, at_ms: i64) -> Result<(), SyncError> {
        let conn = lock_or_recover(&self.conn);
        conn.execute(
            "INSERT INTO node_liveness (node_id, last_seen) VALUES (?1, ?2)
             ON CONFLICT(node_id) DO UPDATE SET last_seen = excluded.last_seen",
            params![node_id, at_ms],
        )?;
        conn.execute(
            "UPDATE player_state SET last_heartbeat = ?1, is_online = 1 WHERE node_id = ?2",
            params![at_ms, node_id],
        )?;
        Ok(())
    }

    fn touch_heartbeat(&self, node_id: &str, at_ms: i64) -> Result<(), SyncError> {
        let conn = lock_or_recover(&self.conn);
        let changed = conn.execute(
            "UPDATE player_state SET last_heartbeat = ?1, is_online = 1 WHERE node_id = ?2",
            params![at_ms, node_id],
        )?;
        if changed == 0 {
            let mut record = StateRecord::new(node_id);
            record.last_updated = next_timestamp(&conn)?;
            record.last_heartbeat = at_ms;
            record.is_online = true;
            write_state(&conn, &record, node_id)?;
        }
        Ok(())
    }
}

fn watch_state(
    conn: Arc<Mutex<Connection>>,
    node_id: String,
    mut cursor: i64,
    interval: Duration,
    tx: Sender<RemoteStateChange>,
) {
    loop {
        thread::sleep(interval);
        let row = {
            let conn = lock_or_recover(&conn);
            select_state(&conn, &node_id)
        };
        match row {
            Ok(Some(row)) if row.record.last_updated > cursor => {
                cursor = row.record.last_updated;
                let change = RemoteStateChange {
                    timestamp: row.record.last_updated,
                    origin: row.updated_by,
                    record: row.record,
                };
                if tx.send(change).is_err() {
                    debug!("SqliteBackend: state feed for {} closed", node_id);
                    return;
                }
            }
            Ok(_) => {}
            Err(err) => debug!("SqliteBackend: state feed poll failed: {}", err),
        }
    }
}

fn poll_channel(
    conn: &Arc<Mutex<Connection>>,
    node_id: &str,
    cursor: i64,
) -> Result<Vec<(i64, String)>, SyncError> {
    let conn = lock_or_recover(conn);
    let mut stmt = conn.prepare(
        "SELECT seq, body FROM channel_messages WHERE node_id = ?1 AND seq > ?2 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![node_id, cursor], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

fn watch_channel(
    conn: Arc<Mutex<Connection>>,
    node_id: String,
    mut cursor: i64,
    interval: Duration,
    tx: Sender<ChannelEvent>,
) {
    if tx
        .send(ChannelEvent::Lifecycle(LifecycleEvent::Subscribed))
        .is_err()
    {
        return;
    }
    let mut healthy = true;
    loop {
        thread::sleep(interval);
        match poll_channel(&conn, &node_id, cursor) {
            Ok(messages) => {
                if !healthy {
                    healthy = true;
                    if tx
                        .send(ChannelEvent::Lifecycle(LifecycleEvent::Subscribed))
                        .is_err()
                    {
                        return;
                    }
                }
                for (seq, body) in messages {
                    cursor = seq;
                    match serde_json::from_str::<CommandEnvelope>(&body) {
                        Ok(envelope) => {
                            if tx.send(ChannelEvent::Envelope(envelope)).is_err() {
                                debug!("SqliteBackend: command channel for {} closed", node_id);
                                return;
                            }
                        }
                        Err(err) => {
                            debug!("SqliteBackend: dropping malformed envelope {}: {}", seq, err)
                        }
                    }
                }
            }
            Err(err) => {
                debug!("SqliteBackend: command channel poll failed: {}", err);
                if healthy {
                    healthy = false;
                    if tx
                        .send(ChannelEvent::Lifecycle(LifecycleEvent::Error))
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
}
