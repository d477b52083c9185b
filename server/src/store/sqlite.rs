use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;
use wsn_common::{FlashState, SlotWindow};

use super::StoreError;
use crate::models::{GatewayRecord, NewNode, NodeRecord, TimeSlot, User};

const NODE_COLUMNS: &str =
    "uid, local_id, nodetype_id, gateway_id, location, flash_state, image_name";

/// SQLite-backed record store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(database_url: &str) -> Result<Self, StoreError> {
        // Parse sqlite: prefix if present
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
            Connection::open(path)?
        };

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS gateways (
                id TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                location TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                uid TEXT PRIMARY KEY,
                local_id TEXT NOT NULL,
                nodetype_id TEXT NOT NULL,
                gateway_id TEXT NOT NULL REFERENCES gateways(id) ON DELETE CASCADE,
                location TEXT NOT NULL DEFAULT '{}',
                flash_state TEXT NOT NULL DEFAULT 'NOT_STARTED',
                image_name TEXT,
                UNIQUE (gateway_id, local_id)
            );

            CREATE TABLE IF NOT EXISTS node_types (
                position INTEGER PRIMARY KEY,
                document TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS time_slots (
                uid TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                email TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_gateway_id ON nodes(gateway_id);
            CREATE INDEX IF NOT EXISTS idx_time_slots_user_id ON time_slots(user_id);
            CREATE INDEX IF NOT EXISTS idx_time_slots_start ON time_slots(start_ms);",
        )?;

        tracing::info!("Store initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    // --- gateways -------------------------------------------------------

    /// Insert a gateway with its nodes, dropping any previous record of it.
    pub fn replace_gateway(
        &self,
        gateway: &GatewayRecord,
        nodes: &[NewNode],
    ) -> Result<Vec<NodeRecord>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM gateways WHERE id = ?1", params![gateway.id])?;
        tx.execute(
            "INSERT INTO gateways (id, ip, port, location, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                gateway.id,
                gateway.ip,
                gateway.port,
                encode_map(&gateway.location),
                Utc::now().to_rfc3339(),
            ],
        )?;

        let mut inserted = Vec::with_capacity(nodes.len());
        for node in nodes {
            inserted.push(insert_node(&tx, &gateway.id, node)?);
        }
        tx.commit()?;

        tracing::info!(gateway = %gateway.id, nodes = inserted.len(), "Inserted gateway");
        Ok(inserted)
    }

    /// Refresh address and location of a known gateway.
    pub fn update_gateway(&self, gateway: &GatewayRecord) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE gateways SET ip = ?1, port = ?2, location = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                gateway.ip,
                gateway.port,
                encode_map(&gateway.location),
                Utc::now().to_rfc3339(),
                gateway.id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Delete a gateway; its nodes go with it.
    pub fn delete_gateway(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM gateways WHERE id = ?1", params![id])?;
        if changed > 0 {
            tracing::info!(gateway = %id, "Deleted gateway");
        }
        Ok(changed > 0)
    }

    pub fn gateway(&self, id: &str) -> Result<Option<GatewayRecord>, StoreError> {
        let conn = self.lock()?;
        let gateway = conn
            .query_row(
                "SELECT id, ip, port, location FROM gateways WHERE id = ?1",
                params![id],
                gateway_from_row,
            )
            .optional()?;
        Ok(gateway)
    }

    pub fn gateway_address(&self, id: &str) -> Result<Option<(String, u16)>, StoreError> {
        Ok(self.gateway(id)?.map(|g| (g.ip, g.port)))
    }

    pub fn list_gateways(&self) -> Result<Vec<GatewayRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, ip, port, location FROM gateways ORDER BY id")?;
        let rows = stmt.query_map([], gateway_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // --- nodes ----------------------------------------------------------

    pub fn insert_node(&self, gateway_id: &str, node: &NewNode) -> Result<NodeRecord, StoreError> {
        let conn = self.lock()?;
        insert_node(&conn, gateway_id, node)
    }

    pub fn delete_node(&self, gateway_id: &str, local_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM nodes WHERE gateway_id = ?1 AND local_id = ?2",
            params![gateway_id, local_id],
        )?;
        Ok(changed > 0)
    }

    pub fn list_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes ORDER BY gateway_id, local_id",
            NODE_COLUMNS
        ))?;
        let rows = stmt.query_map([], node_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn nodes_by_gateway(&self, gateway_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes WHERE gateway_id = ?1 ORDER BY local_id",
            NODE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![gateway_id], node_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn node(&self, uid: &str) -> Result<Option<NodeRecord>, StoreError> {
        let conn = self.lock()?;
        let node = conn
            .query_row(
                &format!("SELECT {} FROM nodes WHERE uid = ?1", NODE_COLUMNS),
                params![uid],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    pub fn node_uid(&self, gateway_id: &str, local_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let uid = conn
            .query_row(
                "SELECT uid FROM nodes WHERE gateway_id = ?1 AND local_id = ?2",
                params![gateway_id, local_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(uid)
    }

    /// Set flash state and image name of one node in a single statement.
    pub fn update_flash_state(
        &self,
        uid: &str,
        state: FlashState,
        image_name: Option<&str>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE nodes SET flash_state = ?1, image_name = ?2 WHERE uid = ?3",
            params![state.as_str(), image_name, uid],
        )?;
        Ok(changed > 0)
    }

    // --- node types -----------------------------------------------------

    pub fn replace_node_types(&self, node_types: &[Value]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM node_types", [])?;
        for (position, doc) in node_types.iter().enumerate() {
            tx.execute(
                "INSERT INTO node_types (position, document) VALUES (?1, ?2)",
                params![position as i64, doc.to_string()],
            )?;
        }
        tx.commit()?;
        tracing::info!(count = node_types.len(), "Loaded node types");
        Ok(())
    }

    pub fn node_types(&self) -> Result<Vec<Value>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT document FROM node_types ORDER BY position")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut docs = Vec::new();
        for raw in rows {
            let raw = raw?;
            let doc = serde_json::from_str(&raw).map_err(|e| StoreError::Database(e.to_string()))?;
            docs.push(doc);
        }
        Ok(docs)
    }

    // --- time slots -----------------------------------------------------

    pub fn insert_slot(&self, user_id: &str, window: &SlotWindow) -> Result<TimeSlot, StoreError> {
        let conn = self.lock()?;
        let slot = TimeSlot {
            uid: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            start: window.start,
            end: window.end,
        };
        conn.execute(
            "INSERT INTO time_slots (uid, user_id, start_ms, end_ms) VALUES (?1, ?2, ?3, ?4)",
            params![
                slot.uid,
                slot.user_id,
                slot.start.timestamp_millis(),
                slot.end.timestamp_millis(),
            ],
        )?;
        Ok(slot)
    }

    pub fn list_slots(&self) -> Result<Vec<TimeSlot>, StoreError> {
        self.query_slots(
            "SELECT uid, user_id, start_ms, end_ms FROM time_slots ORDER BY start_ms",
            [],
        )
    }

    pub fn slot(&self, uid: &str) -> Result<Option<TimeSlot>, StoreError> {
        let conn = self.lock()?;
        let slot = conn
            .query_row(
                "SELECT uid, user_id, start_ms, end_ms FROM time_slots WHERE uid = ?1",
                params![uid],
                slot_from_row,
            )
            .optional()?;
        Ok(slot)
    }

    pub fn delete_slot(&self, uid: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM time_slots WHERE uid = ?1", params![uid])?;
        Ok(changed > 0)
    }

    pub fn slots_by_user(&self, user_id: &str) -> Result<Vec<TimeSlot>, StoreError> {
        self.query_slots(
            "SELECT uid, user_id, start_ms, end_ms FROM time_slots WHERE user_id = ?1 ORDER BY start_ms",
            params![user_id],
        )
    }

    /// Slots intersecting `[from, to)`.
    pub fn slots_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeSlot>, StoreError> {
        self.query_slots(
            "SELECT uid, user_id, start_ms, end_ms FROM time_slots
             WHERE start_ms < ?2 AND end_ms > ?1 ORDER BY start_ms",
            params![from.timestamp_millis(), to.timestamp_millis()],
        )
    }

    fn query_slots<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<TimeSlot>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, slot_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // --- users ----------------------------------------------------------

    /// Create a user; an existing email yields [`StoreError::Duplicate`].
    pub fn create_user(&self, email: &str, username: &str, password_hash: &str) -> Result<User, StoreError> {
        let conn = self.lock()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO users (email, username, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![email, username, password_hash, now.to_rfc3339()],
        )?;
        tracing::info!("Created new user: {}", email);
        Ok(User {
            email: email.to_string(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now,
        })
    }

    pub fn find_user(&self, email: &str) -> Result<Option<User>, StoreError> {
        let conn = self.lock()?;
        let user = conn
            .query_row(
                "SELECT email, username, password_hash, created_at FROM users WHERE email = ?1",
                params![email],
                |row| {
                    let created_at: String = row.get(3)?;
                    Ok(User {
                        email: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        created_at: DateTime::parse_from_rfc3339(&created_at)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()?;
        Ok(user)
    }
}

fn insert_node(conn: &Connection, gateway_id: &str, node: &NewNode) -> Result<NodeRecord, StoreError> {
    let record = NodeRecord {
        uid: Uuid::new_v4().to_string(),
        local_id: node.local_id.clone(),
        nodetype_id: node.nodetype_id.clone(),
        gateway_id: gateway_id.to_string(),
        location: node.location.clone(),
        flash_state: FlashState::NotStarted,
        image_name: None,
    };
    conn.execute(
        "INSERT INTO nodes (uid, local_id, nodetype_id, gateway_id, location, flash_state, image_name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
        params![
            record.uid,
            record.local_id,
            record.nodetype_id,
            record.gateway_id,
            encode_map(&record.location),
            record.flash_state.as_str(),
        ],
    )?;
    Ok(record)
}

fn encode_map(map: &BTreeMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

fn decode_map(raw: &str) -> BTreeMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn gateway_from_row(row: &Row<'_>) -> rusqlite::Result<GatewayRecord> {
    let location: String = row.get(3)?;
    Ok(GatewayRecord {
        id: row.get(0)?,
        ip: row.get(1)?,
        port: row.get(2)?,
        location: decode_map(&location),
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeRecord> {
    let location: String = row.get(4)?;
    let flash_state: String = row.get(5)?;
    Ok(NodeRecord {
        uid: row.get(0)?,
        local_id: row.get(1)?,
        nodetype_id: row.get(2)?,
        gateway_id: row.get(3)?,
        location: decode_map(&location),
        flash_state: FlashState::parse(&flash_state).unwrap_or_default(),
        image_name: row.get(6)?,
    })
}

fn slot_from_row(row: &Row<'_>) -> rusqlite::Result<TimeSlot> {
    let start_ms: i64 = row.get(2)?;
    let end_ms: i64 = row.get(3)?;
    Ok(TimeSlot {
        uid: row.get(0)?,
        user_id: row.get(1)?,
        start: from_millis(start_ms),
        end: from_millis(end_ms),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
