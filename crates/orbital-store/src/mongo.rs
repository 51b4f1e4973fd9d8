//! A document-store [`DataStore`] back end on top of MongoDB.
//!
//! MongoDB has no `SKIP LOCKED`/`RETURNING` equivalent, so atomic claims use
//! a loop of `findOneAndUpdate` calls (one atomic claim per document) rather
//! than a single bulk statement, and `remove_schedules` pre-selects the
//! matching ids before deleting them instead of relying on a RETURNING
//! clause — the fallback the core's data store contract requires of any
//! back end that cannot atomically report which rows it removed.

use std::sync::Arc;

use bson::{doc, Bson, DateTime as BsonDateTime};
use chrono::{DateTime, Duration, Utc};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Client, Collection};
use orbital_core::model::{ConflictPolicy, Job, Schedule};
use orbital_core::{deserialize, serialize, CoreError, CoreResult, DataStore, Event, EventHub, JsonSerializer, Serializer};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("mongodb server must be at least version 4.0 to support transactions")]
    UnsupportedServerVersion { found: String },
    #[error("database error")]
    Database(#[from] mongodb::error::Error),
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ScheduleDoc {
    #[serde(rename = "_id")]
    id: String,
    task_id: String,
    serialized_data: Vec<u8>,
    next_fire_time: Option<BsonDateTime>,
    last_fire_time: Option<BsonDateTime>,
    acquired_by: Option<String>,
    acquired_until: Option<BsonDateTime>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct JobDoc {
    #[serde(rename = "_id")]
    id: String,
    task_id: String,
    serialized_data: Vec<u8>,
    scheduled_fire_time: Option<BsonDateTime>,
    created_at: BsonDateTime,
    acquired_by: Option<String>,
    acquired_until: Option<BsonDateTime>,
}

fn to_bson(dt: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_chrono(dt)
}

fn from_bson(dt: BsonDateTime) -> DateTime<Utc> {
    dt.to_chrono()
}

pub struct MongoDataStore {
    schedules: Collection<ScheduleDoc>,
    jobs: Collection<JobDoc>,
    hub: EventHub,
    serializer: Arc<dyn Serializer>,
    lock_expiration_delay: Duration,
}

impl MongoDataStore {
    /// Open a store against `client`'s `database`, after verifying the
    /// server is new enough to support the transactions this back end relies
    /// on. Every timestamp this back end writes is a BSON UTC datetime, so
    /// there is no separate "reject naive timestamps" check needed here —
    /// the wire format simply has no naive representation to smuggle one in.
    pub async fn open(
        client: &Client,
        database: &str,
        lock_expiration_delay: Duration,
    ) -> Result<Self, OpenError> {
        Self::open_with_serializer(client, database, lock_expiration_delay, Arc::new(JsonSerializer))
            .await
    }

    pub async fn open_with_serializer(
        client: &Client,
        database: &str,
        lock_expiration_delay: Duration,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self, OpenError> {
        let build_info = client
            .database("admin")
            .run_command(doc! { "buildInfo": 1 })
            .await?;

        if let Some(Bson::String(version)) = build_info.get("version") {
            let major: u32 = version
                .split('.')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if major < 4 {
                return Err(OpenError::UnsupportedServerVersion {
                    found: version.clone(),
                });
            }
        }

        let db = client.database(database);
        let schedules: Collection<ScheduleDoc> = db.collection("schedule");
        let jobs: Collection<JobDoc> = db.collection("job");

        schedules
            .create_index(
                mongodb::IndexModel::builder()
                    .keys(doc! { "next_fire_time": 1 })
                    .build(),
            )
            .await?;
        schedules
            .create_index(
                mongodb::IndexModel::builder()
                    .keys(doc! { "task_id": 1 })
                    .build(),
            )
            .await?;
        jobs.create_index(
            mongodb::IndexModel::builder()
                .keys(doc! { "created_at": 1 })
                .build(),
        )
        .await?;
        jobs.create_index(
            mongodb::IndexModel::builder()
                .keys(doc! { "task_id": 1 })
                .build(),
        )
        .await?;

        Ok(Self {
            schedules,
            jobs,
            hub: EventHub::new(),
            serializer,
            lock_expiration_delay,
        })
    }

    fn decode_schedule(&self, doc: &ScheduleDoc) -> CoreResult<Schedule> {
        deserialize(self.serializer.as_ref(), &doc.serialized_data).map_err(|e| CoreError::Deserialization {
            what: "Schedule",
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("schedule {}: {e}", doc.id),
            )),
        })
    }

    fn decode_job(&self, doc: &JobDoc) -> CoreResult<Job> {
        deserialize(self.serializer.as_ref(), &doc.serialized_data).map_err(|e| CoreError::Deserialization {
            what: "Job",
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("job {}: {e}", doc.id),
            )),
        })
    }
}

fn wrap_storage(e: mongodb::error::Error) -> CoreError {
    CoreError::Storage(Box::new(e))
}

#[async_trait::async_trait]
impl DataStore for MongoDataStore {
    async fn add_schedule(&self, schedule: Schedule, policy: ConflictPolicy) -> CoreResult<()> {
        let bytes = serialize(self.serializer.as_ref(), &schedule)?;

        let doc = ScheduleDoc {
            id: schedule.id.clone(),
            task_id: schedule.task_id.0.clone(),
            serialized_data: bytes,
            next_fire_time: schedule.next_fire_time.map(to_bson),
            last_fire_time: schedule.last_fire_time.map(to_bson),
            acquired_by: None,
            acquired_until: None,
        };

        match self.schedules.insert_one(&doc).await {
            Ok(_) => {
                self.hub.publish(Event::schedule_added(schedule.id)).await;
                Ok(())
            }
            Err(e) if e.kind.as_ref().to_string().contains("E11000") => match policy {
                ConflictPolicy::DoNothing => Ok(()),
                ConflictPolicy::Exception => Err(CoreError::ConflictingId { id: schedule.id }),
                ConflictPolicy::Replace => {
                    self.schedules
                        .replace_one(doc! { "_id": &schedule.id }, &doc)
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
        let now = to_bson(Utc::now());
        let filter = doc! {
            "_id": { "$in": ids },
            "$or": [
                { "acquired_until": Bson::Null },
                { "acquired_until": { "$lt": now } },
            ],
        };

        // Pre-select under the same filter before deleting: the fallback the
        // contract requires of back ends with no atomic RETURNING-equivalent.
        let mut cursor = self.schedules.find(filter.clone()).await.map_err(wrap_storage)?;
        let mut removed_ids = Vec::new();
        while let Some(doc) = {
            use futures_util::TryStreamExt;
            cursor.try_next().await.map_err(wrap_storage)?
        } {
            removed_ids.push(doc.id);
        }

        if !removed_ids.is_empty() {
            self.schedules
                .delete_many(doc! { "_id": { "$in": &removed_ids } })
                .await
                .map_err(wrap_storage)?;
        }

        for id in removed_ids {
            self.hub.publish(Event::schedule_removed(id)).await;
        }
        Ok(())
    }

    async fn get_schedules(&self, ids: Option<&[String]>) -> CoreResult<Vec<Schedule>> {
        use futures_util::TryStreamExt;

        let filter = match ids {
            Some(ids) => doc! { "_id": { "$in": ids } },
            None => doc! {},
        };
        let mut cursor = self.schedules.find(filter).await.map_err(wrap_storage)?;

        let mut schedules = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(wrap_storage)? {
            match self.decode_schedule(&doc) {
                Ok(schedule) => schedules.push(schedule),
                Err(e) => {
                    self.hub
                        .publish(Event::schedule_deserialization_failed(doc.id, e.to_string()))
                        .await;
                }
            }
        }
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(schedules)
    }

    async fn acquire_schedules(&self, scheduler_id: &str, limit: usize) -> CoreResult<Vec<Schedule>> {
        let now = Utc::now();
        let until = now + self.lock_expiration_delay;
        let now_bson = to_bson(now);
        let until_bson = to_bson(until);

        let mut acquired = Vec::new();
        for _ in 0..limit {
            let filter = doc! {
                "next_fire_time": { "$ne": Bson::Null, "$lte": &now_bson },
                "$or": [
                    { "acquired_until": Bson::Null },
                    { "acquired_until": { "$lt": &now_bson } },
                ],
            };
            let update = doc! {
                "$set": { "acquired_by": scheduler_id, "acquired_until": &until_bson },
            };
            let options = FindOneAndUpdateOptions::builder()
                .sort(doc! { "next_fire_time": 1, "_id": 1 })
                .return_document(ReturnDocument::After)
                .build();

            let doc = self
                .schedules
                .find_one_and_update(filter, update)
                .with_options(options)
                .await
                .map_err(wrap_storage)?;

            match doc {
                Some(doc) => match self.decode_schedule(&doc) {
                    Ok(schedule) => acquired.push(schedule),
                    Err(e) => {
                        // Already claimed under `scheduler_id`; release it
                        // immediately since it can never be decoded by anyone,
                        // rather than stranding it locked until lease expiry.
                        let _ = self
                            .schedules
                            .update_one(
                                doc! { "_id": &doc.id },
                                doc! { "$unset": { "acquired_by": "", "acquired_until": "" } },
                            )
                            .await;
                        self.hub
                            .publish(Event::schedule_deserialization_failed(doc.id, e.to_string()))
                            .await;
                    }
                },
                None => break,
            }
        }

        acquired.sort_by(|a, b| {
            a.next_fire_time
                .cmp(&b.next_fire_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(acquired)
    }

    async fn release_schedules(&self, scheduler_id: &str, schedules: Vec<Schedule>) -> CoreResult<()> {
        let mut events = Vec::new();

        for schedule in schedules {
            let owned = self
                .schedules
                .find_one(doc! { "_id": &schedule.id, "acquired_by": scheduler_id })
                .await
                .map_err(wrap_storage)?;
            if owned.is_none() {
                continue;
            }

            if schedule.is_terminal() {
                self.schedules
                    .delete_one(doc! { "_id": &schedule.id })
                    .await
                    .map_err(wrap_storage)?;
                events.push(Event::schedule_removed(schedule.id));
                continue;
            }

            let bytes = match serialize(self.serializer.as_ref(), &schedule) {
                Ok(bytes) => bytes,
                Err(_) => {
                    self.schedules
                        .delete_one(doc! { "_id": &schedule.id })
                        .await
                        .map_err(wrap_storage)?;
                    events.push(Event::schedule_removed(schedule.id));
                    continue;
                }
            };

            self.schedules
                .update_one(
                    doc! { "_id": &schedule.id },
                    doc! { "$set": {
                        "serialized_data": Bson::Binary(bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes }),
                        "next_fire_time": schedule.next_fire_time.map(to_bson),
                        "last_fire_time": schedule.last_fire_time.map(to_bson),
                    }, "$unset": { "acquired_by": "", "acquired_until": "" } },
                )
                .await
                .map_err(wrap_storage)?;
            events.push(Event::schedule_updated(schedule.id));
        }

        for event in events {
            self.hub.publish(event).await;
        }
        Ok(())
    }

    async fn add_job(&self, job: Job) -> CoreResult<()> {
        let bytes = serialize(self.serializer.as_ref(), &job)?;

        let doc = JobDoc {
            id: job.id.to_string(),
            task_id: job.task_id.0.clone(),
            serialized_data: bytes,
            scheduled_fire_time: job.scheduled_fire_time.map(to_bson),
            created_at: to_bson(job.created_at),
            acquired_by: None,
            acquired_until: None,
        };

        self.jobs.insert_one(&doc).await.map_err(wrap_storage)?;
        self.hub.publish(Event::job_added(job.id, job.task_id.0)).await;
        Ok(())
    }

    async fn get_jobs(&self, ids: Option<&[Uuid]>) -> CoreResult<Vec<Job>> {
        use futures_util::TryStreamExt;

        let filter = match ids {
            Some(ids) => {
                let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
                doc! { "_id": { "$in": ids } }
            }
            None => doc! {},
        };
        let mut cursor = self.jobs.find(filter).await.map_err(wrap_storage)?;

        let mut jobs = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(wrap_storage)? {
            match self.decode_job(&doc) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    self.hub
                        .publish(Event::job_deserialization_failed(
                            job_id_from(&doc.id),
                            e.to_string(),
                        ))
                        .await;
                }
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn acquire_jobs(&self, worker_id: &str, limit: usize) -> CoreResult<Vec<Job>> {
        let now = Utc::now();
        let until = now + self.lock_expiration_delay;
        let now_bson = to_bson(now);
        let until_bson = to_bson(until);

        // This loop always produces a list (possibly empty after zero
        // iterations matched): there is no branch here that can yield an
        // absent result the way an inconsistent implementation might.
        let mut acquired = Vec::new();
        for _ in 0..limit {
            let filter = doc! {
                "$or": [
                    { "acquired_until": Bson::Null },
                    { "acquired_until": { "$lt": &now_bson } },
                ],
            };
            let update = doc! {
                "$set": { "acquired_by": worker_id, "acquired_until": &until_bson },
            };
            let options = FindOneAndUpdateOptions::builder()
                .sort(doc! { "created_at": 1, "_id": 1 })
                .return_document(ReturnDocument::After)
                .build();

            let doc = self
                .jobs
                .find_one_and_update(filter, update)
                .with_options(options)
                .await
                .map_err(wrap_storage)?;

            match doc {
                Some(doc) => match self.decode_job(&doc) {
                    Ok(job) => acquired.push(job),
                    Err(e) => {
                        let id = doc.id.clone();
                        let _ = self
                            .jobs
                            .update_one(
                                doc! { "_id": &doc.id },
                                doc! { "$unset": { "acquired_by": "", "acquired_until": "" } },
                            )
                            .await;
                        self.hub
                            .publish(Event::job_deserialization_failed(job_id_from(&id), e.to_string()))
                            .await;
                    }
                },
                None => break,
            }
        }

        acquired.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(acquired)
    }

    async fn release_jobs(&self, worker_id: &str, jobs: &[Job]) -> CoreResult<()> {
        let ids: Vec<String> = jobs.iter().map(|j| j.id.to_string()).collect();
        self.jobs
            .delete_many(doc! { "_id": { "$in": ids }, "acquired_by": worker_id })
            .await
            .map_err(wrap_storage)?;
        Ok(())
    }

    async fn clear(&self) -> CoreResult<()> {
        self.schedules.delete_many(doc! {}).await.map_err(wrap_storage)?;
        self.jobs.delete_many(doc! {}).await.map_err(wrap_storage)?;
        Ok(())
    }

    fn event_hub(&self) -> &EventHub {
        &self.hub
    }
}

fn job_id_from(id: &str) -> Uuid {
    id.parse().unwrap_or_else(|_| Uuid::nil())
}
