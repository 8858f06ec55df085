/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Fixed column layout of the persisted snapshot. Order matters: a persisted
/// table is only trusted when its `PRAGMA table_info` matches this list
/// element by element.
pub const STORE_SCHEMA: &[(&str, &str)] = &[
    ("pos", "INTEGER"),
    ("account_ids", "TEXT"),
    ("protocol", "TEXT"),
    ("message_id", "TEXT"),
    ("stream", "TEXT"),
    ("sender", "TEXT"),
    ("sender_id", "TEXT"),
    ("sender_nick", "TEXT"),
    ("from_me", "INTEGER"),
    ("timestamp", "TEXT"),
    ("message", "TEXT"),
    ("icon_uri", "TEXT"),
    ("url", "TEXT"),
    ("urls", "TEXT"),
    ("reply_to", "TEXT"),
    ("likes", "INTEGER"),
    ("liked", "INTEGER"),
    ("retweets", "INTEGER"),
    ("location", "TEXT"),
    ("latitude", "REAL"),
    ("longitude", "REAL"),
    ("privacy", "TEXT"),
];

const STORE_TABLE: &str = "stream_rows";

/// One unified message row. Identity is `(protocol, message_id)`; everything
/// else is payload. `account_ids` lists every local account that can see the
/// message, since the same post may be visible from more than one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    #[serde(default)]
    pub account_ids: Vec<String>,
    pub protocol: String,
    pub message_id: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_nick: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub icon_uri: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub reply_to: String,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub liked: bool,
    #[serde(default)]
    pub retweets: i64,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub privacy: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RowKey {
    pub protocol: String,
    pub message_id: String,
}

impl MessageRow {
    pub fn key(&self) -> RowKey {
        RowKey {
            protocol: self.protocol.clone(),
            message_id: self.message_id.clone(),
        }
    }

    /// Fold another sighting of the same message into this row. Only the
    /// mutable fields move; identity and position stay put. Returns true if
    /// anything observable changed.
    fn merge(&mut self, other: &MessageRow) -> bool {
        let mut changed = false;
        for id in &other.account_ids {
            if !self.account_ids.contains(id) {
                self.account_ids.push(id.clone());
                changed = true;
            }
        }
        if self.likes != other.likes {
            self.likes = other.likes;
            changed = true;
        }
        if self.liked != other.liked {
            self.liked = other.liked;
            changed = true;
        }
        if self.retweets != other.retweets {
            self.retweets = other.retweets;
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

/// The shared row store. Insertion-ordered, keyed by `(protocol,
/// message_id)`, mutated only under one lock so concurrent account tasks
/// serialize their merges.
#[derive(Clone, Default)]
pub struct StreamStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    rows: Vec<MessageRow>,
    index: HashMap<RowKey, usize>,
}

impl StreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted snapshot, falling back to an empty store when the
    /// file is missing, unreadable, or carries a stale column layout.
    pub fn open(db_path: impl AsRef<Path>) -> Self {
        let store = Self::new();
        match load_rows(db_path.as_ref()) {
            Ok(rows) => {
                let mut inner = store.inner.lock().unwrap();
                for row in rows {
                    let key = row.key();
                    if inner.index.contains_key(&key) {
                        continue;
                    }
                    inner.rows.push(row);
                    let pos = inner.rows.len() - 1;
                    inner.index.insert(key, pos);
                }
                info!("stream store loaded {} rows", inner.rows.len());
            }
            Err(e) => {
                warn!("stream store load failed, starting empty: {e:#}");
            }
        }
        store
    }

    pub fn upsert(&self, row: MessageRow) -> Upsert {
        let mut inner = self.inner.lock().unwrap();
        let key = row.key();
        match inner.index.get(&key).copied() {
            Some(pos) => {
                if inner.rows[pos].merge(&row) {
                    Upsert::Updated
                } else {
                    Upsert::Unchanged
                }
            }
            None => {
                inner.rows.push(row);
                let pos = inner.rows.len() - 1;
                inner.index.insert(key, pos);
                Upsert::Inserted
            }
        }
    }

    pub fn get(&self, key: &RowKey) -> Option<MessageRow> {
        let inner = self.inner.lock().unwrap();
        inner.index.get(key).map(|&pos| inner.rows[pos].clone())
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.inner.lock().unwrap().index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all rows in first-appearance order.
    pub fn rows(&self) -> Vec<MessageRow> {
        self.inner.lock().unwrap().rows.clone()
    }

    /// Detach `account_id` from every row; rows left with no owning account
    /// are deleted. Returns the number of rows removed.
    pub fn purge_by_account(&self, account_id: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.rows.len();
        for row in inner.rows.iter_mut() {
            row.account_ids.retain(|id| id != account_id);
        }
        inner.rows.retain(|row| !row.account_ids.is_empty());
        rebuild_index(&mut inner);
        (before - inner.rows.len()) as u64
    }

    /// Drop oldest rows until at most `max` remain.
    pub fn prune_to_max(&self, max: usize) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if inner.rows.len() <= max {
            return 0;
        }
        let drop_count = inner.rows.len() - max;
        inner.rows.drain(..drop_count);
        rebuild_index(&mut inner);
        drop_count as u64
    }

    /// Write the snapshot to disk. Best-effort: callers log failures and
    /// carry on with the in-memory store.
    pub fn persist(&self, db_path: &Path) -> Result<u64> {
        let rows = self.rows();
        let mut conn = open_store_db(db_path)?;
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {STORE_TABLE}"), [])?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {STORE_TABLE} (
                   pos, account_ids, protocol, message_id, stream, sender,
                   sender_id, sender_nick, from_me, timestamp, message,
                   icon_uri, url, urls, reply_to, likes, liked, retweets,
                   location, latitude, longitude, privacy
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                           ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
            ))?;
            for (pos, row) in rows.iter().enumerate() {
                stmt.execute(params![
                    pos as i64,
                    serde_json::to_string(&row.account_ids)?,
                    row.protocol,
                    row.message_id,
                    row.stream,
                    row.sender,
                    row.sender_id,
                    row.sender_nick,
                    row.from_me,
                    row.timestamp,
                    row.message,
                    row.icon_uri,
                    row.url,
                    serde_json::to_string(&row.urls)?,
                    row.reply_to,
                    row.likes,
                    row.liked,
                    row.retweets,
                    row.location,
                    row.latitude,
                    row.longitude,
                    row.privacy,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len() as u64)
    }

    /// Periodically snapshot the store to disk, on its own interval,
    /// independent of the refresh schedule.
    pub fn start_persist_worker(
        &self,
        db_path: PathBuf,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                let store = store.clone();
                let path = db_path.clone();
                let res = tokio::task::spawn_blocking(move || store.persist(&path)).await;
                match res {
                    Ok(Ok(n)) => debug!("persisted {n} rows"),
                    Ok(Err(e)) => warn!("persist failed: {e:#}"),
                    Err(e) => warn!("persist task failed: {e}"),
                }
            }
        });
    }
}

fn rebuild_index(inner: &mut Inner) {
    inner.index.clear();
    for (pos, row) in inner.rows.iter().enumerate() {
        inner.index.insert(row.key(), pos);
    }
}

/// Open the snapshot database, dropping the table if its column layout does
/// not match [`STORE_SCHEMA`]. No partial migration is attempted.
fn open_store_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create data dir: {}", parent.display()))?;
    }
    let conn =
        Connection::open(path).with_context(|| format!("open store db: {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    if table_exists(&conn, STORE_TABLE)? && !schema_matches(&conn)? {
        warn!("persisted store schema mismatch, discarding snapshot");
        conn.execute(&format!("DROP TABLE {STORE_TABLE}"), [])?;
    }

    let columns = STORE_SCHEMA
        .iter()
        .map(|(name, ty)| format!("{name} {ty}"))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!("CREATE TABLE IF NOT EXISTS {STORE_TABLE} ({columns})"),
        [],
    )?;
    Ok(conn)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn schema_matches(conn: &Connection) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({STORE_TABLE})"))?;
    let mut rows = stmt.query([])?;
    let mut found: Vec<(String, String)> = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let ty: String = row.get(2)?;
        found.push((name, ty));
    }
    if found.len() != STORE_SCHEMA.len() {
        return Ok(false);
    }
    for ((name, ty), (want_name, want_ty)) in found.iter().zip(STORE_SCHEMA.iter()) {
        if name != want_name || !ty.eq_ignore_ascii_case(want_ty) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn load_rows(path: &Path) -> Result<Vec<MessageRow>> {
    let conn = open_store_db(path)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT account_ids, protocol, message_id, stream, sender, sender_id,
                sender_nick, from_me, timestamp, message, icon_uri, url, urls,
                reply_to, likes, liked, retweets, location, latitude,
                longitude, privacy
         FROM {STORE_TABLE} ORDER BY pos ASC"
    ))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let account_ids: String = row.get(0)?;
        let urls: String = row.get(12)?;
        out.push(MessageRow {
            account_ids: serde_json::from_str(&account_ids).unwrap_or_default(),
            protocol: row.get(1)?,
            message_id: row.get(2)?,
            stream: row.get(3)?,
            sender: row.get(4)?,
            sender_id: row.get(5)?,
            sender_nick: row.get(6)?,
            from_me: row.get(7)?,
            timestamp: row.get(8)?,
            message: row.get(9)?,
            icon_uri: row.get(10)?,
            url: row.get(11)?,
            urls: serde_json::from_str(&urls).unwrap_or_default(),
            reply_to: row.get(13)?,
            likes: row.get(14)?,
            liked: row.get(15)?,
            retweets: row.get(16)?,
            location: row.get(17)?,
            latitude: row.get(18)?,
            longitude: row.get(19)?,
            privacy: row.get(20)?,
        });
    }
    Ok(out)
}
