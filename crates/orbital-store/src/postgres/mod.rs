//! A relational [`DataStore`] back end on top of Postgres via `sqlx`.
//!
//! Atomic acquisition uses a common-table-expression combined with
//! `FOR UPDATE SKIP LOCKED` plus an `UPDATE ... RETURNING`, the same shape
//! this lineage's worker uses to atomically claim rows it owns.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use orbital_core::model::{ConflictPolicy, Job, Schedule};
use orbital_core::{deserialize, serialize, CoreError, CoreResult, DataStore, Event, EventHub, JsonSerializer, Serializer};
use orbital_migrate::{Migrator, Options as MigrateOptions};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const SCHEMA_VERSION: i64 = 1;

fn migrator() -> Migrator {
    // Loaded from disk relative to this crate, not build-script embedded: see
    // DESIGN.md for why this crate does not use `orbital_migrate::Migrator::embed`.
    Migrator::from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
        .expect("bundled migrations directory is malformed")
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("failed to run database migrations")]
    Migrate(#[from] orbital_migrate::Error),
    #[error("database error")]
    Database(#[from] sqlx::Error),
}

pub struct PostgresDataStore {
    pool: PgPool,
    hub: EventHub,
    serializer: Arc<dyn Serializer>,
    lock_expiration_delay: Duration,
}

impl PostgresDataStore {
    /// Open a store against `pool`, running migrations up to the latest
    /// version if they have not already been applied.
    ///
    /// Timestamps in this back end are always `timestamptz`, i.e.
    /// timezone-aware, so there is no naive-timestamp rejection path to wire
    /// up here (contrast with a back end whose native timestamp type lacks a
    /// timezone, which must refuse to open at all).
    pub async fn open(pool: PgPool, lock_expiration_delay: Duration) -> Result<Self, OpenError> {
        Self::open_with_serializer(pool, lock_expiration_delay, Arc::new(JsonSerializer)).await
    }

    pub async fn open_with_serializer(
        pool: PgPool,
        lock_expiration_delay: Duration,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self, OpenError> {
        let mut conn = pool.acquire().await?;
        migrator()
            .run(&mut conn, &MigrateOptions::default())
            .await?;

        let version: i64 = sqlx::query_scalar("SELECT schema_version FROM orbital.metadata")
            .fetch_one(&mut *conn)
            .await?;
        debug_assert_eq!(version, SCHEMA_VERSION, "unexpected schema version after migrating");
        drop(conn);

        Ok(Self {
            pool,
            hub: EventHub::new(),
            serializer,
            lock_expiration_delay,
        })
    }

    fn decode_schedule(&self, row: &PgRow) -> CoreResult<Schedule> {
        let id: String = row.get("id");
        let bytes: Vec<u8> = row.get("serialized_data");
        deserialize(self.serializer.as_ref(), &bytes).map_err(|e| CoreError::Deserialization {
            what: "Schedule",
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("schedule {id}: {e}"),
            )),
        })
    }

    fn decode_job(&self, row: &PgRow) -> CoreResult<Job> {
        let id: Uuid = row.get("id");
        let bytes: Vec<u8> = row.get("serialized_data");
        deserialize(self.serializer.as_ref(), &bytes).map_err(|e| CoreError::Deserialization {
            what: "Job",
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("job {id}: {e}"),
            )),
        })
    }
}

#[async_trait::async_trait]
impl DataStore for PostgresDataStore {
    async fn add_schedule(&self, schedule: Schedule, policy: ConflictPolicy) -> CoreResult<()> {
        let bytes = serialize(self.serializer.as_ref(), &schedule)?;

        let insert = sqlx::query(
            "INSERT INTO orbital.schedule(id, task_id, serialized_data, next_fire_time, last_fire_time)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&schedule.id)
        .bind(&schedule.task_id.0)
        .bind(&bytes)
        .bind(schedule.next_fire_time)
        .bind(schedule.last_fire_time)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => {
                self.hub.publish(Event::schedule_added(schedule.id)).await;
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => match policy {
                ConflictPolicy::DoNothing => Ok(()),
                ConflictPolicy::Exception => Err(CoreError::ConflictingId { id: schedule.id }),
                ConflictPolicy::Replace => {
                    sqlx::query(
                        "UPDATE orbital.schedule
                            SET task_id = $2, serialized_data = $3, next_fire_time = $4, last_fire_time = $5
                          WHERE id = $1",
                    )
                    .bind(&schedule.id)
                    .bind(&schedule.task_id.0)
                    .bind(&bytes)
                    .bind(schedule.next_fire_time)
                    .bind(schedule.last_fire_time)
                    .execute(&self.pool)
                    .await
                    .map_err(wrap_storage)?;

                    self.hub
                        .publish(Event::schedule_updated(schedule.id))
                        .await;
                    Ok(())
                }
            },
            Err(e) => Err(wrap_storage(e)),
        }
    }

    async fn remove_schedules(&self, ids: &[String]) -> CoreResult<()> {
        // Postgres always supports RETURNING, so this is the fast path
        // described in the data store contract; a dialect without it would
        // need to pre-select matching ids inside the same transaction before
        // deleting, the way the Mongo back end does with a find-then-delete.
        let removed: Vec<String> = sqlx::query_scalar(
            "DELETE FROM orbital.schedule
              WHERE id = ANY($1)
                AND (acquired_until IS NULL OR acquired_until < now())
          RETURNING id",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(wrap_storage)?;

        for id in removed {
            self.hub.publish(Event::schedule_removed(id)).await;
        }
        Ok(())
    }

    async fn get_schedules(&self, ids: Option<&[String]>) -> CoreResult<Vec<Schedule>> {
        let rows = match ids {
            Some(ids) => sqlx::query("SELECT * FROM orbital.schedule WHERE id = ANY($1) ORDER BY id")
                .bind(ids)
                .fetch_all(&self.pool)
                .await,
            None => {
                sqlx::query("SELECT * FROM orbital.schedule ORDER BY id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(wrap_storage)?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.decode_schedule(row) {
                Ok(schedule) => schedules.push(schedule),
                Err(e) => {
                    let id: String = row.get("id");
                    self.hub
                        .publish(Event::schedule_deserialization_failed(id, e.to_string()))
                        .await;
                }
            }
        }
        Ok(schedules)
    }

    async fn acquire_schedules(&self, scheduler_id: &str, limit: usize) -> CoreResult<Vec<Schedule>> {
        let now = Utc::now();
        let until = now + self.lock_expiration_delay;

        let rows = sqlx::query(
            "WITH selected AS (
                SELECT id
                  FROM orbital.schedule
                 WHERE next_fire_time IS NOT NULL
                   AND next_fire_time <= $1
                   AND (acquired_until IS NULL OR acquired_until < $1)
              ORDER BY next_fire_time ASC, id ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT $2
             )
             UPDATE orbital.schedule
                SET acquired_by = $3, acquired_until = $4
               FROM selected
              WHERE selected.id = orbital.schedule.id
          RETURNING orbital.schedule.*",
        )
        .bind(now)
        .bind(limit as i64)
        .bind(scheduler_id)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(wrap_storage)?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.decode_schedule(row) {
                Ok(schedule) => schedules.push(schedule),
                Err(e) => {
                    let id: String = row.get("id");
                    // This row is already locked under `scheduler_id`; release it
                    // immediately rather than leaving it stranded until the lease
                    // expires, since it can never be decoded by anyone.
                    let _ = sqlx::query(
                        "UPDATE orbital.schedule SET acquired_by = NULL, acquired_until = NULL WHERE id = $1",
                    )
                    .bind(&id)
                    .execute(&self.pool)
                    .await;
                    self.hub
                        .publish(Event::schedule_deserialization_failed(id, e.to_string()))
                        .await;
                }
            }
        }
        // UPDATE ... RETURNING does not guarantee the CTE's ORDER BY survives,
        // so the ascending next_fire_time ordering is restored here.
        schedules.sort_by(|a, b| {
            a.next_fire_time
                .cmp(&b.next_fire_time)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(schedules)
    }

    async fn release_schedules(&self, scheduler_id: &str, schedules: Vec<Schedule>) -> CoreResult<()> {
        let mut events = Vec::new();
        let mut tx = self.pool.begin().await.map_err(wrap_storage)?;

        for schedule in schedules {
            let owned: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM orbital.schedule WHERE id = $1 AND acquired_by = $2",
            )
            .bind(&schedule.id)
            .bind(scheduler_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(wrap_storage)?;

            if owned.is_none() {
                continue;
            }

            if schedule.is_terminal() {
                sqlx::query("DELETE FROM orbital.schedule WHERE id = $1")
                    .bind(&schedule.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(wrap_storage)?;
                events.push(Event::schedule_removed(schedule.id));
                continue;
            }

            let bytes = match serialize(self.serializer.as_ref(), &schedule) {
                Ok(bytes) => bytes,
                Err(_) => {
                    // A schedule that cannot be persisted forward cannot
                    // survive a restart: drop it rather than leaving a lock
                    // that can never be refreshed.
                    sqlx::query("DELETE FROM orbital.schedule WHERE id = $1")
                        .bind(&schedule.id)
                        .execute(&mut *tx)
                        .await
                        .map_err(wrap_storage)?;
                    events.push(Event::schedule_removed(schedule.id));
                    continue;
                }
            };

            sqlx::query(
                "UPDATE orbital.schedule
                    SET serialized_data = $2,
                        next_fire_time = $3,
                        last_fire_time = $4,
                        acquired_by = NULL,
                        acquired_until = NULL
                  WHERE id = $1",
            )
            .bind(&schedule.id)
            .bind(&bytes)
            .bind(schedule.next_fire_time)
            .bind(schedule.last_fire_time)
            .execute(&mut *tx)
            .await
            .map_err(wrap_storage)?;
            events.push(Event::schedule_updated(schedule.id));
        }

        tx.commit().await.map_err(wrap_storage)?;
        for event in events {
            self.hub.publish(event).await;
        }
        Ok(())
    }

    async fn add_job(&self, job: Job) -> CoreResult<()> {
        let bytes = serialize(self.serializer.as_ref(), &job)?;

        sqlx::query(
            "INSERT INTO orbital.job(id, task_id, schedule_id, serialized_data, scheduled_fire_time, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(job.id)
        .bind(&job.task_id.0)
        .bind(&job.schedule_id)
        .bind(&bytes)
        .bind(job.scheduled_fire_time)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(wrap_storage)?;

        self.hub.publish(Event::job_added(job.id, job.task_id.0)).await;
        Ok(())
    }

    async fn get_jobs(&self, ids: Option<&[Uuid]>) -> CoreResult<Vec<Job>> {
        let rows = match ids {
            Some(ids) => {
                sqlx::query("SELECT * FROM orbital.job WHERE id = ANY($1) ORDER BY created_at")
                    .bind(ids)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM orbital.job ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(wrap_storage)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.decode_job(row) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    let id: Uuid = row.get("id");
                    self.hub
                        .publish(Event::job_deserialization_failed(id, e.to_string()))
                        .await;
                }
            }
        }
        Ok(jobs)
    }

    async fn acquire_jobs(&self, worker_id: &str, limit: usize) -> CoreResult<Vec<Job>> {
        let now: DateTime<Utc> = Utc::now();
        let until = now + self.lock_expiration_delay;

        let rows = sqlx::query(
            "WITH selected AS (
                SELECT id
                  FROM orbital.job
                 WHERE acquired_until IS NULL OR acquired_until < $1
              ORDER BY created_at ASC, id ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT $2
             )
             UPDATE orbital.job
                SET acquired_by = $3, acquired_until = $4
               FROM selected
              WHERE selected.id = orbital.job.id
          RETURNING orbital.job.*",
        )
        .bind(now)
        .bind(limit as i64)
        .bind(worker_id)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(wrap_storage)?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.decode_job(row) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    let id: Uuid = row.get("id");
                    let _ = sqlx::query(
                        "UPDATE orbital.job SET acquired_by = NULL, acquired_until = NULL WHERE id = $1",
                    )
                    .bind(id)
                    .execute(&self.pool)
                    .await;
                    self.hub
                        .publish(Event::job_deserialization_failed(id, e.to_string()))
                        .await;
                }
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        // Always a list: there is no code path here that returns anything else.
        Ok(jobs)
    }

    async fn release_jobs(&self, worker_id: &str, jobs: &[Job]) -> CoreResult<()> {
        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        sqlx::query("DELETE FROM orbital.job WHERE id = ANY($1) AND acquired_by = $2")
            .bind(&ids)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(wrap_storage)?;
        Ok(())
    }

    async fn clear(&self) -> CoreResult<()> {
        sqlx::query("TRUNCATE orbital.schedule, orbital.job")
            .execute(&self.pool)
            .await
            .map_err(wrap_storage)?;
        Ok(())
    }

    fn event_hub(&self) -> &EventHub {
        &self.hub
    }
}

fn wrap_storage(e: sqlx::Error) -> CoreError {
    CoreError::Storage(Box::new(e))
}
