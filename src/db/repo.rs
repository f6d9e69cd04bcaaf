use super::model::{
    ClaimOutcome, DispenserRow, MedicationRow, NotificationRow, SetOutcome,
};
use crate::allocator::ChamberPool;
use crate::config::expand_home;
use crate::model::{DispenserStatus, MedicationRecord, NewMedication, NotificationEvent, StorePath};
use crate::schedule::FiredDose;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{instrument, warn};
use uuid::Uuid;

pub type Pool = SqlitePool;

const MEDICATION_COLUMNS: &str = "id, name, pills, chamber, hour, minute, from_date, to_date, \
                                  conditions, dispensed, last_dispensed";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL and stricter durability on every pooled connection.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Normalise a file-backed SQLite URL to `sqlite://<path>[?query]`, expanding
/// `~/` and creating the parent directory. In-memory and non-SQLite URLs pass
/// through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = expand_home(path);
    if let Some(parent) = Path::new(&path).parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(err) = std::fs::create_dir_all(parent) {
            warn!(?err, dir = %parent.display(), "failed to create database directory");
        }
    }
    match query {
        Some(query) => format!("sqlite://{}?{}", path, query),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_medications(pool: &Pool) -> Result<Vec<MedicationRecord>> {
    let rows: Vec<MedicationRow> = sqlx::query_as(&format!(
        "SELECT {} FROM medications ORDER BY chamber ASC",
        MEDICATION_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(MedicationRecord::try_from).collect()
}

#[instrument(skip_all)]
pub async fn get_medication(pool: &Pool, id: &str) -> Result<Option<MedicationRecord>> {
    let row: Option<MedicationRow> = sqlx::query_as(&format!(
        "SELECT {} FROM medications WHERE id = ?",
        MEDICATION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(MedicationRecord::try_from).transpose()
}

#[instrument(skip_all)]
pub async fn used_chambers(pool: &Pool) -> Result<Vec<u8>> {
    let rows: Vec<i64> = sqlx::query_scalar("SELECT chamber FROM medications ORDER BY chamber")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().filter_map(|c| u8::try_from(c).ok()).collect())
}

async fn insert_medication<'e, E>(executor: E, record: &MedicationRecord) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO medications (id, name, pills, chamber, hour, minute, from_date, to_date, conditions, dispensed, last_dispensed) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.name)
    .bind(i64::from(record.pills))
    .bind(i64::from(record.chamber))
    .bind(i64::from(record.hour))
    .bind(i64::from(record.minute))
    .bind(record.from_date)
    .bind(record.to_date)
    .bind(&record.conditions)
    .bind(record.dispensed)
    .bind(&record.last_dispensed)
    .execute(executor)
    .await?;
    Ok(())
}

/// A pooled connection inside a raw `BEGIN IMMEDIATE`.
///
/// If the transaction is neither committed nor rolled back (the future was
/// dropped, or the closing statement failed) the connection is detached from
/// the pool; closing it makes SQLite discard the open transaction.
struct ImmediateTx {
    conn: Option<PoolConnection<Sqlite>>,
}

impl ImmediateTx {
    async fn begin(pool: &Pool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| anyhow!("transaction already finished"))
    }

    async fn finish(mut self, statement: &'static str) -> Result<()> {
        sqlx::query(statement).execute(self.conn()?).await?;
        // Back to the pool only once the transaction is closed.
        self.conn.take();
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for ImmediateTx {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("transaction left open; closing its connection");
            drop(conn.detach());
        }
    }
}

/// Assign the lowest free chambers to `items` and insert them, all or nothing.
///
/// Runs under `BEGIN IMMEDIATE` so the free-chamber read and the inserts see
/// no interleaved writer; the unique chamber index rejects anything that
/// slips past.
#[instrument(skip_all, fields(count = items.len()))]
pub async fn claim_medications(
    pool: &Pool,
    chambers: ChamberPool,
    items: &[NewMedication],
) -> Result<ClaimOutcome> {
    let mut tx = ImmediateTx::begin(pool).await?;
    let outcome = claim_in_tx(tx.conn()?, chambers, items).await;
    match outcome {
        Ok(ClaimOutcome::Claimed(records)) => {
            tx.commit().await?;
            Ok(ClaimOutcome::Claimed(records))
        }
        Ok(ClaimOutcome::NoCapacity) => {
            tx.rollback().await?;
            Ok(ClaimOutcome::NoCapacity)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(?rollback_err, "rollback after failed claim also failed");
            }
            Err(err)
        }
    }
}

async fn claim_in_tx(
    conn: &mut SqliteConnection,
    chambers: ChamberPool,
    items: &[NewMedication],
) -> Result<ClaimOutcome> {
    let used: Vec<i64> = sqlx::query_scalar("SELECT chamber FROM medications")
        .fetch_all(&mut *conn)
        .await?;
    let available = chambers.available(used.into_iter().filter_map(|c| u8::try_from(c).ok()));
    if available.len() < items.len() {
        return Ok(ClaimOutcome::NoCapacity);
    }

    let mut claimed = Vec::with_capacity(items.len());
    for (item, chamber) in items.iter().zip(available) {
        let record = item.clone().into_record(Uuid::new_v4().to_string(), chamber);
        insert_medication(&mut *conn, &record).await?;
        claimed.push(record);
    }
    Ok(ClaimOutcome::Claimed(claimed))
}

/// Overwrite the whole record at `record.id`, creating it if absent.
#[instrument(skip_all, fields(id = %record.id, chamber = record.chamber))]
pub async fn set_medication(pool: &Pool, record: &MedicationRecord) -> Result<SetOutcome> {
    let res = sqlx::query(
        "INSERT INTO medications (id, name, pills, chamber, hour, minute, from_date, to_date, conditions, dispensed, last_dispensed) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, pills = excluded.pills, \
         chamber = excluded.chamber, hour = excluded.hour, minute = excluded.minute, \
         from_date = excluded.from_date, to_date = excluded.to_date, \
         conditions = excluded.conditions, dispensed = excluded.dispensed, \
         last_dispensed = excluded.last_dispensed",
    )
    .bind(&record.id)
    .bind(&record.name)
    .bind(i64::from(record.pills))
    .bind(i64::from(record.chamber))
    .bind(i64::from(record.hour))
    .bind(i64::from(record.minute))
    .bind(record.from_date)
    .bind(record.to_date)
    .bind(&record.conditions)
    .bind(record.dispensed)
    .bind(&record.last_dispensed)
    .execute(pool)
    .await;

    match res {
        Ok(_) => Ok(SetOutcome::Written),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Ok(SetOutcome::ChamberTaken)
        }
        Err(err) => Err(err.into()),
    }
}

/// Delete a medication and its reminder history. Returns whether it existed.
#[instrument(skip_all, fields(id = %id))]
pub async fn remove_medication(pool: &Pool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query("DELETE FROM medications WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM reminder_fires WHERE medication_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn get_dispenser_status(pool: &Pool) -> Result<Option<DispenserStatus>> {
    let row: Option<DispenserRow> = sqlx::query_as(
        "SELECT is_online, last_dispense_time, last_dispense_successful FROM pill_dispenser WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(DispenserStatus::from))
}

#[instrument(skip_all)]
pub async fn put_dispenser_status(pool: &Pool, status: &DispenserStatus) -> Result<()> {
    sqlx::query(
        "INSERT INTO pill_dispenser (id, is_online, last_dispense_time, last_dispense_successful, updated_at) \
         VALUES (1, ?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(id) DO UPDATE SET is_online = excluded.is_online, \
         last_dispense_time = excluded.last_dispense_time, \
         last_dispense_successful = excluded.last_dispense_successful, \
         updated_at = CURRENT_TIMESTAMP",
    )
    .bind(status.is_online)
    .bind(&status.last_dispense_time)
    .bind(status.last_dispense_successful)
    .execute(pool)
    .await
    .context("failed to write dispenser status")?;
    Ok(())
}

/// Device-side dispense report. Marks the dispenser online with the attempt's
/// result and, for a successful dispense of a known medication, stamps the
/// medication. Returns false when `medication_id` names no medication.
#[instrument(skip_all, fields(successful = successful, at = %at))]
pub async fn record_dispense(
    pool: &Pool,
    medication_id: Option<&str>,
    successful: bool,
    at: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO pill_dispenser (id, is_online, last_dispense_time, last_dispense_successful, updated_at) \
         VALUES (1, 1, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(id) DO UPDATE SET is_online = 1, \
         last_dispense_time = excluded.last_dispense_time, \
         last_dispense_successful = excluded.last_dispense_successful, \
         updated_at = CURRENT_TIMESTAMP",
    )
    .bind(at)
    .bind(successful)
    .execute(&mut *tx)
    .await?;

    let mut found = true;
    if let Some(id) = medication_id {
        let res = if successful {
            sqlx::query("UPDATE medications SET dispensed = 1, last_dispensed = ? WHERE id = ?")
                .bind(at)
                .bind(id)
                .execute(&mut *tx)
                .await?
        } else {
            sqlx::query("UPDATE medications SET dispensed = 0 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
        };
        found = res.rows_affected() > 0;
    }
    tx.commit().await?;
    Ok(found)
}

#[instrument(skip_all, fields(id = event.id))]
pub async fn insert_notification(
    pool: &Pool,
    event: &NotificationEvent,
    timestamp: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO notifications (id, kind, title, message, time, read, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.id)
    .bind(event.kind.as_str())
    .bind(&event.title)
    .bind(&event.message)
    .bind(&event.time)
    .bind(event.read)
    .bind(timestamp)
    .execute(pool)
    .await
    .context("failed to persist notification")?;
    Ok(())
}

/// Persisted notifications, newest first.
#[instrument(skip_all)]
pub async fn list_notifications(pool: &Pool) -> Result<Vec<NotificationEvent>> {
    let rows: Vec<NotificationRow> = sqlx::query_as(
        "SELECT id, kind, title, message, time, read FROM notifications ORDER BY id DESC",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(NotificationEvent::try_from).collect()
}

/// Fired doses per medication. Rows without a recorded time are skipped.
#[instrument(skip_all)]
pub async fn load_reminder_fires(pool: &Pool) -> Result<HashMap<String, FiredDose>> {
    let rows: Vec<(String, NaiveDate, Option<i64>, Option<i64>)> =
        sqlx::query_as("SELECT medication_id, fired_on, hour, minute FROM reminder_fires")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, day, hour, minute)| {
            let hour = u8::try_from(hour?).ok()?;
            let minute = u8::try_from(minute?).ok()?;
            Some((id, FiredDose { day, hour, minute }))
        })
        .collect())
}

#[instrument(skip_all, fields(medication_id = %medication_id, day = %fired.day))]
pub async fn mark_reminder_fired(pool: &Pool, medication_id: &str, fired: FiredDose) -> Result<()> {
    sqlx::query(
        "INSERT INTO reminder_fires (medication_id, fired_on, hour, minute) VALUES (?, ?, ?, ?) \
         ON CONFLICT(medication_id) DO UPDATE SET fired_on = excluded.fired_on, \
         hour = excluded.hour, minute = excluded.minute",
    )
    .bind(medication_id)
    .bind(fired.day)
    .bind(i64::from(fired.hour))
    .bind(i64::from(fired.minute))
    .execute(pool)
    .await?;
    Ok(())
}

/// Change counter for `path`, bumped by triggers on every committed write.
pub async fn store_revision(pool: &Pool, path: StorePath) -> Result<i64> {
    let revision: Option<i64> =
        sqlx::query_scalar("SELECT revision FROM store_revisions WHERE path = ?")
            .bind(path.as_str())
            .fetch_optional(pool)
            .await?;
    Ok(revision.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn new_med(name: &str, hour: u8) -> NewMedication {
        NewMedication {
            name: name.into(),
            pills: 1,
            hour,
            minute: 30,
            from_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            to_date: NaiveDate::from_ymd_opt(2024, 1, 31),
            conditions: None,
        }
    }

    #[test]
    fn prepare_sqlite_url_keeps_memory_urls() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn prepare_sqlite_url_normalizes_file_urls() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("db.sqlite");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert_eq!(rebuilt, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn claim_fills_lowest_chambers_and_roundtrips() {
        let pool = setup_pool().await;
        let outcome = claim_medications(&pool, ChamberPool::default(), &[new_med("A", 8), new_med("B", 9)])
            .await
            .unwrap();
        let ClaimOutcome::Claimed(records) = outcome else {
            panic!("expected claim");
        };
        assert_eq!(records.iter().map(|r| r.chamber).collect::<Vec<_>>(), vec![1, 2]);

        let stored = list_medications(&pool).await.unwrap();
        assert_eq!(stored, records);
        assert_eq!(used_chambers(&pool).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn claim_is_all_or_nothing() {
        let pool = setup_pool().await;
        let meds: Vec<_> = (0..3).map(|i| new_med(&format!("M{}", i), i)).collect();
        claim_medications(&pool, ChamberPool::default(), &meds).await.unwrap();

        let outcome = claim_medications(&pool, ChamberPool::default(), &meds[..2])
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::NoCapacity);
        assert_eq!(list_medications(&pool).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn set_rejects_duplicate_chamber() {
        let pool = setup_pool().await;
        let ClaimOutcome::Claimed(records) =
            claim_medications(&pool, ChamberPool::default(), &[new_med("A", 8), new_med("B", 9)])
                .await
                .unwrap()
        else {
            panic!("expected claim");
        };

        let mut moved = records[1].clone();
        moved.chamber = records[0].chamber;
        assert_eq!(set_medication(&pool, &moved).await.unwrap(), SetOutcome::ChamberTaken);

        let mut renamed = records[1].clone();
        renamed.name = "B2".into();
        assert_eq!(set_medication(&pool, &renamed).await.unwrap(), SetOutcome::Written);
        let stored = get_medication(&pool, &renamed.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "B2");
    }

    #[tokio::test]
    async fn remove_clears_reminder_history() {
        let pool = setup_pool().await;
        let ClaimOutcome::Claimed(records) =
            claim_medications(&pool, ChamberPool::default(), &[new_med("A", 8)])
                .await
                .unwrap()
        else {
            panic!("expected claim");
        };
        let id = &records[0].id;
        let fired = FiredDose {
            day: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            hour: 8,
            minute: 30,
        };
        mark_reminder_fired(&pool, id, fired).await.unwrap();
        assert_eq!(load_reminder_fires(&pool).await.unwrap().get(id), Some(&fired));

        assert!(remove_medication(&pool, id).await.unwrap());
        assert!(!remove_medication(&pool, id).await.unwrap());
        assert!(load_reminder_fires(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_transaction_releases_the_write_lock() {
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", td.path().join("dose.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let mut tx = ImmediateTx::begin(&pool).await.unwrap();
        let lost = new_med("Lost", 7).into_record("lost".into(), 1);
        insert_medication(tx.conn().unwrap(), &lost).await.unwrap();
        drop(tx);

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            claim_medications(&pool, ChamberPool::default(), &[new_med("A", 9)]),
        )
        .await
        .unwrap()
        .unwrap();
        let ClaimOutcome::Claimed(records) = outcome else {
            panic!("expected claim");
        };
        assert_eq!(records[0].chamber, 1);
        assert!(get_medication(&pool, "lost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_bump_their_path_revision() {
        let pool = setup_pool().await;
        let revision = |path| {
            let pool = pool.clone();
            async move { store_revision(&pool, path).await.unwrap() }
        };
        assert_eq!(revision(StorePath::Medications).await, 0);

        claim_medications(&pool, ChamberPool::default(), &[new_med("A", 8), new_med("B", 9)])
            .await
            .unwrap();
        let after_claim = revision(StorePath::Medications).await;
        assert!(after_claim > 0);
        assert_eq!(revision(StorePath::PillDispenser).await, 0);

        assert!(!remove_medication(&pool, "missing").await.unwrap());
        assert_eq!(revision(StorePath::Medications).await, after_claim);

        put_dispenser_status(
            &pool,
            &DispenserStatus {
                is_online: false,
                last_dispense_time: None,
                last_dispense_successful: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(revision(StorePath::PillDispenser).await, 1);
        assert_eq!(revision(StorePath::Medications).await, after_claim);
    }

    #[tokio::test]
    async fn record_dispense_updates_device_and_medication() {
        let pool = setup_pool().await;
        assert!(get_dispenser_status(&pool).await.unwrap().is_none());
        let ClaimOutcome::Claimed(records) =
            claim_medications(&pool, ChamberPool::default(), &[new_med("A", 8)])
                .await
                .unwrap()
        else {
            panic!("expected claim");
        };

        let found = record_dispense(&pool, Some(&records[0].id), true, "2024-01-02 08:00")
            .await
            .unwrap();
        assert!(found);
        let status = get_dispenser_status(&pool).await.unwrap().unwrap();
        assert!(status.is_online);
        assert!(status.last_dispense_successful);
        assert_eq!(status.last_dispense_time.as_deref(), Some("2024-01-02 08:00"));

        let med = get_medication(&pool, &records[0].id).await.unwrap().unwrap();
        assert!(med.dispensed);
        assert_eq!(med.last_dispensed.as_deref(), Some("2024-01-02 08:00"));

        assert!(!record_dispense(&pool, Some("missing"), false, "x").await.unwrap());
    }
}
