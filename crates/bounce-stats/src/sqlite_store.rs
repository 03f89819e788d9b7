use crate::store::{bucket_ts, BounceStore, EventRecord, WindowCounts};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use egress_types::{BounceEvent, BounceType, IdentityKey};
use sqlite::{Connection, ConnectionThreadSafe, State};
use std::sync::Arc;
use tokio::task::spawn_blocking;

/// Durable implementation of the storage port backed by an embedded
/// sqlite database. All statement execution happens on the blocking
/// thread pool; callers only ever await.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<ConnectionThreadSafe>,
}

impl SqliteStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let mut db = Connection::open_thread_safe(path)
            .with_context(|| format!("failed to open stats database {path}"))?;

        db.set_busy_timeout(60_000)?;

        let query = r#"
CREATE TABLE IF NOT EXISTS sent_counters (
    identity text,
    bucket_ts int,
    count int,
    PRIMARY KEY (identity, bucket_ts)
);

CREATE TABLE IF NOT EXISTS event_log (
    identity text,
    kind text,
    ts int,
    payload text
);

CREATE INDEX IF NOT EXISTS event_log_by_ts ON event_log (ts, identity);

CREATE TABLE IF NOT EXISTS batch_queue (
    slot int PRIMARY KEY,
    payload text
);
    "#;

        db.execute(query)?;
        db.execute("PRAGMA synchronous = OFF")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Carry out the blocking operation on the database object
    pub async fn perform<T: Send + 'static>(
        &self,
        mut func: impl FnMut(&ConnectionThreadSafe) -> anyhow::Result<T> + Send + 'static,
    ) -> anyhow::Result<T> {
        let db = self.db.clone();
        spawn_blocking(move || (func)(&db)).await?
    }
}

fn insert_event(db: &ConnectionThreadSafe, event: &EventRecord) -> anyhow::Result<()> {
    let mut stmt = db.prepare(
        "INSERT INTO event_log (identity, kind, ts, payload) \
         VALUES (?, ?, ?, ?)",
    )?;
    stmt.bind((1, event.identity().to_string().as_str()))?;
    stmt.bind((2, event.kind()))?;
    stmt.bind((3, event.timestamp().timestamp()))?;
    stmt.bind((4, serde_json::to_string(event)?.as_str()))?;
    while stmt.next()? != State::Done {}
    Ok(())
}

#[async_trait]
impl BounceStore for SqliteStore {
    async fn record_sent(
        &self,
        identity: &IdentityKey,
        count: u64,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let identity = identity.to_string();
        let bucket = bucket_ts(timestamp);
        self.perform(move |db| {
            let mut stmt = db.prepare(
                "INSERT INTO sent_counters (identity, bucket_ts, count) \
                 VALUES (?, ?, ?) \
                 ON CONFLICT (identity, bucket_ts) \
                 DO UPDATE SET count = count + excluded.count",
            )?;
            stmt.bind((1, identity.as_str()))?;
            stmt.bind((2, bucket))?;
            stmt.bind((3, count as i64))?;
            while stmt.next()? != State::Done {}
            Ok(())
        })
        .await
    }

    async fn record_bounce(&self, event: &BounceEvent) -> anyhow::Result<()> {
        let record = EventRecord::Bounce(event.clone());
        self.perform(move |db| insert_event(db, &record)).await
    }

    async fn get_stats(
        &self,
        identity: &IdentityKey,
        since: DateTime<Utc>,
    ) -> anyhow::Result<WindowCounts> {
        let identity = identity.to_string();
        self.perform(move |db| {
            let mut counts = WindowCounts::default();

            let mut stmt = db.prepare(
                "SELECT COALESCE(SUM(count), 0) FROM sent_counters \
                 WHERE identity = ? AND bucket_ts >= ?",
            )?;
            stmt.bind((1, identity.as_str()))?;
            stmt.bind((2, bucket_ts(since)))?;
            if stmt.next()? == State::Row {
                counts.sent = stmt.read::<i64, _>(0)? as u64;
            }

            let mut stmt = db.prepare(
                "SELECT payload FROM event_log \
                 WHERE identity = ? AND kind = 'Bounce' AND ts >= ?",
            )?;
            stmt.bind((1, identity.as_str()))?;
            stmt.bind((2, since.timestamp()))?;
            while stmt.next()? == State::Row {
                let payload = stmt.read::<String, _>(0)?;
                let record: EventRecord = serde_json::from_str(&payload)
                    .with_context(|| format!("malformed event payload: {payload}"))?;
                if let EventRecord::Bounce(bounce) = record {
                    match bounce.bounce_type {
                        BounceType::Hard => counts.hard += 1,
                        BounceType::Soft => counts.soft += 1,
                        BounceType::Block => counts.block += 1,
                    }
                }
            }

            Ok(counts)
        })
        .await
    }

    async fn list_identities(&self) -> anyhow::Result<Vec<IdentityKey>> {
        self.perform(move |db| {
            let mut stmt = db.prepare(
                "SELECT DISTINCT identity FROM sent_counters \
                 UNION SELECT DISTINCT identity FROM event_log \
                 ORDER BY identity",
            )?;
            let mut identities = vec![];
            while stmt.next()? == State::Row {
                let raw = stmt.read::<String, _>(0)?;
                match raw.parse::<IdentityKey>() {
                    Ok(identity) => identities.push(identity),
                    Err(err) => {
                        tracing::warn!("skipping unparsable identity row '{raw}': {err}");
                    }
                }
            }
            Ok(identities)
        })
        .await
    }

    async fn append_event(&self, event: &EventRecord) -> anyhow::Result<()> {
        let event = event.clone();
        self.perform(move |db| insert_event(db, &event)).await
    }

    async fn query_events(
        &self,
        identity: Option<&IdentityKey>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EventRecord>> {
        let identity = identity.map(|id| id.to_string());
        self.perform(move |db| {
            let mut events = vec![];
            let mut stmt = match &identity {
                Some(id) => {
                    let mut stmt = db.prepare(
                        "SELECT payload FROM event_log \
                         WHERE identity = ? AND ts >= ? AND ts < ? ORDER BY ts",
                    )?;
                    stmt.bind((1, id.as_str()))?;
                    stmt.bind((2, since.timestamp()))?;
                    stmt.bind((3, until.timestamp()))?;
                    stmt
                }
                None => {
                    let mut stmt = db.prepare(
                        "SELECT payload FROM event_log \
                         WHERE ts >= ? AND ts < ? ORDER BY ts",
                    )?;
                    stmt.bind((1, since.timestamp()))?;
                    stmt.bind((2, until.timestamp()))?;
                    stmt
                }
            };
            while stmt.next()? == State::Row {
                let payload = stmt.read::<String, _>(0)?;
                let record: EventRecord = serde_json::from_str(&payload)
                    .with_context(|| format!("malformed event payload: {payload}"))?;
                events.push(record);
            }
            Ok(events)
        })
        .await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        self.perform(move |db| {
            let mut removed = 0u64;

            let mut stmt = db.prepare("DELETE FROM sent_counters WHERE bucket_ts < ?")?;
            stmt.bind((1, bucket_ts(cutoff)))?;
            while stmt.next()? != State::Done {}
            drop(stmt);
            removed += db.change_count() as u64;

            let mut stmt = db.prepare("DELETE FROM event_log WHERE ts < ?")?;
            stmt.bind((1, cutoff.timestamp()))?;
            while stmt.next()? != State::Done {}
            drop(stmt);
            removed += db.change_count() as u64;

            Ok(removed)
        })
        .await
    }

    async fn reset(&self, identity: &IdentityKey) -> anyhow::Result<()> {
        let identity = identity.to_string();
        self.perform(move |db| {
            for table in ["sent_counters", "event_log"] {
                let mut stmt =
                    db.prepare(format!("DELETE FROM {table} WHERE identity = ?"))?;
                stmt.bind((1, identity.as_str()))?;
                while stmt.next()? != State::Done {}
            }
            Ok(())
        })
        .await
    }

    async fn save_queue_snapshot(&self, items: &[String]) -> anyhow::Result<()> {
        let items = items.to_vec();
        self.perform(move |db| {
            db.execute("DELETE FROM batch_queue")?;
            for (slot, payload) in items.iter().enumerate() {
                let mut stmt =
                    db.prepare("INSERT INTO batch_queue (slot, payload) VALUES (?, ?)")?;
                stmt.bind((1, slot as i64))?;
                stmt.bind((2, payload.as_str()))?;
                while stmt.next()? != State::Done {}
            }
            Ok(())
        })
        .await
    }

    async fn load_queue_snapshot(&self) -> anyhow::Result<Vec<String>> {
        self.perform(move |db| {
            let mut stmt = db.prepare("SELECT payload FROM batch_queue ORDER BY slot")?;
            let mut items = vec![];
            while stmt.next()? == State::Row {
                items.push(stmt.read::<String, _>(0)?);
            }
            Ok(items)
        })
        .await
    }
}
