use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marigold_schemas::{
  ConcurrencyLimit, Deployment, DeploymentSchedule, EmpiricalPolicy, NotificationPolicy,
  QueueFilter, QueuedNotification, Run, RunKind, State, StateDetails, StateType, WorkPool,
  WorkQueue, Worker,
};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{Error, RunFilter, Store};

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if missing) the database at `url`, e.g. `sqlite://marigold.db`.
  pub async fn connect(url: &str) -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }
}

const RUN_SELECT: &str = r#"
  SELECT r.id, r.kind, r.name, r.tags, r.deployment_id, r.work_queue_id, r.flow_run_id,
         r.parent_task_run_id, r.state_id, r.state_type, r.state_name, r.run_count,
         r.expected_start_time, r.next_scheduled_start_time, r.start_time, r.end_time,
         r.total_run_time_ms, r.empirical_policy, r.idempotency_key, r.auto_scheduled, r.created,
         s.type AS s_type, s.name AS s_name, s.timestamp AS s_timestamp, s.message AS s_message,
         s.data AS s_data, s.state_details AS s_details
  FROM runs r
  LEFT JOIN states s ON s.id = r.state_id
"#;

const INSERT_RUN: &str = r#"
  INSERT INTO runs (id, kind, name, tags, deployment_id, work_queue_id, flow_run_id,
                    parent_task_run_id, state_id, state_type, state_name, run_count,
                    expected_start_time, next_scheduled_start_time, start_time, end_time,
                    total_run_time_ms, empirical_policy, idempotency_key, auto_scheduled, created)
  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const INSERT_SCHEDULED_RUN: &str = r#"
  INSERT OR IGNORE INTO runs (id, kind, name, tags, deployment_id, work_queue_id, flow_run_id,
                    parent_task_run_id, state_id, state_type, state_name, run_count,
                    expected_start_time, next_scheduled_start_time, start_time, end_time,
                    total_run_time_ms, empirical_policy, idempotency_key, auto_scheduled, created)
  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

#[derive(FromRow)]
struct RunRow {
  id: Uuid,
  kind: String,
  name: String,
  tags: Json<Vec<String>>,
  deployment_id: Option<Uuid>,
  work_queue_id: Option<Uuid>,
  flow_run_id: Option<Uuid>,
  parent_task_run_id: Option<Uuid>,
  state_id: Option<Uuid>,
  state_type: Option<String>,
  state_name: Option<String>,
  run_count: i64,
  expected_start_time: Option<i64>,
  next_scheduled_start_time: Option<i64>,
  start_time: Option<i64>,
  end_time: Option<i64>,
  total_run_time_ms: i64,
  empirical_policy: Json<EmpiricalPolicy>,
  idempotency_key: Option<String>,
  auto_scheduled: bool,
  created: DateTime<Utc>,
  s_type: Option<String>,
  s_name: Option<String>,
  s_timestamp: Option<i64>,
  s_message: Option<String>,
  s_data: Option<Json<serde_json::Value>>,
  s_details: Option<Json<StateDetails>>,
}

#[derive(FromRow)]
struct StateRow {
  id: Uuid,
  state_type: String,
  name: String,
  timestamp: i64,
  message: Option<String>,
  data: Option<Json<serde_json::Value>>,
  state_details: Json<StateDetails>,
}

#[derive(FromRow)]
struct DeploymentRow {
  id: Uuid,
  name: String,
  flow_name: String,
  work_queue_id: Option<Uuid>,
  paused: bool,
  tags: Json<Vec<String>>,
  schedules: Json<Vec<DeploymentSchedule>>,
  empirical_policy: Json<EmpiricalPolicy>,
  created: DateTime<Utc>,
}

#[derive(FromRow)]
struct WorkPoolRow {
  id: Uuid,
  name: String,
  description: Option<String>,
  is_paused: bool,
  concurrency_limit: Option<i64>,
  default_queue_id: Option<Uuid>,
  created: DateTime<Utc>,
}

#[derive(FromRow)]
struct WorkQueueRow {
  id: Uuid,
  work_pool_id: Uuid,
  name: String,
  description: Option<String>,
  priority: i64,
  concurrency_limit: Option<i64>,
  is_paused: bool,
  filter: Json<QueueFilter>,
  last_polled: Option<i64>,
  created: DateTime<Utc>,
}

#[derive(FromRow)]
struct WorkerRow {
  id: Uuid,
  work_pool_id: Uuid,
  name: String,
  last_heartbeat_time: i64,
}

#[derive(FromRow)]
struct ConcurrencyLimitRow {
  id: Uuid,
  tag: String,
  concurrency_limit: i64,
  created: DateTime<Utc>,
}

#[derive(FromRow)]
struct NotificationPolicyRow {
  id: Uuid,
  is_active: bool,
  state_names: Json<Vec<String>>,
  tags: Json<Vec<String>>,
  message_template: Option<String>,
  destination: String,
}

#[derive(FromRow)]
struct QueuedNotificationRow {
  id: Uuid,
  policy_id: Uuid,
  run_id: Uuid,
  state_id: Uuid,
  enqueued_at: DateTime<Utc>,
}

fn millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, Error> {
  DateTime::from_timestamp_millis(ms)
    .ok_or_else(|| Error::Serialization(format!("timestamp out of range: {}", ms)))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, Error> {
  ms.map(from_millis).transpose()
}

fn to_u32(value: i64, column: &str) -> Result<u32, Error> {
  u32::try_from(value)
    .map_err(|_| Error::Serialization(format!("{} out of range: {}", column, value)))
}

fn parse_state_type(value: &str) -> Result<StateType, Error> {
  value.parse().map_err(Error::Serialization)
}

fn parse_kind(value: &str) -> Result<RunKind, Error> {
  match value {
    "flow" => Ok(RunKind::Flow),
    "task" => Ok(RunKind::Task),
    other => Err(Error::Serialization(format!("unknown run kind: {}", other))),
  }
}

fn already_exists(err: sqlx::Error, what: impl FnOnce() -> String) -> Error {
  match &err {
    sqlx::Error::Database(db) if db.is_unique_violation() => Error::AlreadyExists(what()),
    _ => Error::Database(err),
  }
}

impl TryFrom<RunRow> for Run {
  type Error = Error;

  fn try_from(row: RunRow) -> Result<Self, Error> {
    let state = match (row.state_id, row.s_type, row.s_name, row.s_timestamp) {
      (Some(id), Some(state_type), Some(name), Some(timestamp)) => Some(State {
        id,
        state_type: parse_state_type(&state_type)?,
        name,
        timestamp: from_millis(timestamp)?,
        message: row.s_message,
        data: row.s_data.map(|d| d.0),
        state_details: row.s_details.map(|d| d.0).unwrap_or_default(),
      }),
      _ => None,
    };

    Ok(Run {
      id: row.id,
      kind: parse_kind(&row.kind)?,
      name: row.name,
      tags: row.tags.0,
      deployment_id: row.deployment_id,
      work_queue_id: row.work_queue_id,
      flow_run_id: row.flow_run_id,
      parent_task_run_id: row.parent_task_run_id,
      state,
      state_id: row.state_id,
      state_type: row.state_type.as_deref().map(parse_state_type).transpose()?,
      state_name: row.state_name,
      run_count: to_u32(row.run_count, "run_count")?,
      expected_start_time: opt_from_millis(row.expected_start_time)?,
      next_scheduled_start_time: opt_from_millis(row.next_scheduled_start_time)?,
      start_time: opt_from_millis(row.start_time)?,
      end_time: opt_from_millis(row.end_time)?,
      total_run_time_ms: row.total_run_time_ms,
      empirical_policy: row.empirical_policy.0,
      idempotency_key: row.idempotency_key,
      auto_scheduled: row.auto_scheduled,
      created: row.created,
    })
  }
}

impl TryFrom<StateRow> for State {
  type Error = Error;

  fn try_from(row: StateRow) -> Result<Self, Error> {
    Ok(State {
      id: row.id,
      state_type: parse_state_type(&row.state_type)?,
      name: row.name,
      timestamp: from_millis(row.timestamp)?,
      message: row.message,
      data: row.data.map(|d| d.0),
      state_details: row.state_details.0,
    })
  }
}

impl From<DeploymentRow> for Deployment {
  fn from(row: DeploymentRow) -> Self {
    Deployment {
      id: row.id,
      name: row.name,
      flow_name: row.flow_name,
      work_queue_id: row.work_queue_id,
      paused: row.paused,
      tags: row.tags.0,
      schedules: row.schedules.0,
      empirical_policy: row.empirical_policy.0,
      created: row.created,
    }
  }
}

impl TryFrom<WorkPoolRow> for WorkPool {
  type Error = Error;

  fn try_from(row: WorkPoolRow) -> Result<Self, Error> {
    Ok(WorkPool {
      id: row.id,
      name: row.name,
      description: row.description,
      is_paused: row.is_paused,
      concurrency_limit: row
        .concurrency_limit
        .map(|l| to_u32(l, "concurrency_limit"))
        .transpose()?,
      default_queue_id: row.default_queue_id,
      created: row.created,
    })
  }
}

impl TryFrom<WorkQueueRow> for WorkQueue {
  type Error = Error;

  fn try_from(row: WorkQueueRow) -> Result<Self, Error> {
    Ok(WorkQueue {
      id: row.id,
      work_pool_id: row.work_pool_id,
      name: row.name,
      description: row.description,
      priority: i32::try_from(row.priority)
        .map_err(|_| Error::Serialization(format!("priority out of range: {}", row.priority)))?,
      concurrency_limit: row
        .concurrency_limit
        .map(|l| to_u32(l, "concurrency_limit"))
        .transpose()?,
      is_paused: row.is_paused,
      filter: row.filter.0,
      last_polled: opt_from_millis(row.last_polled)?,
      created: row.created,
    })
  }
}

fn bind_run<'q>(sql: &'q str, run: &Run) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
  sqlx::query(sql)
    .bind(run.id)
    .bind(run.kind.as_str())
    .bind(Json(run.tags.clone()))
    .bind(run.deployment_id)
    .bind(run.work_queue_id)
    .bind(run.flow_run_id)
    .bind(run.parent_task_run_id)
    .bind(run.state_id)
    .bind(run.state_type.map(StateType::as_str))
    .bind(run.state_name.clone())
    .bind(i64::from(run.run_count))
    .bind(run.expected_start_time.map(millis))
    .bind(run.next_scheduled_start_time.map(millis))
    .bind(run.start_time.map(millis))
    .bind(run.end_time.map(millis))
    .bind(run.total_run_time_ms)
    .bind(Json(run.empirical_policy.clone()))
    .bind(run.idempotency_key.clone())
    .bind(run.auto_scheduled)
    .bind(run.created)
}

async fn insert_state(
  conn: &mut SqliteConnection,
  run_id: Uuid,
  state: &State,
) -> Result<(), Error> {
  sqlx::query(
    r#"
    INSERT INTO states (id, run_id, type, name, timestamp, message, data, state_details, cache_key,
      cache_expiration)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#,
  )
  .bind(state.id)
  .bind(run_id)
  .bind(state.state_type.as_str())
  .bind(&state.name)
  .bind(millis(state.timestamp))
  .bind(&state.message)
  .bind(state.data.clone().map(Json))
  .bind(Json(state.state_details.clone()))
  .bind(&state.state_details.cache_key)
  .bind(state.state_details.cache_expiration.map(millis))
  .execute(conn)
  .await?;

  Ok(())
}

fn push_uuid_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[Uuid]) {
  qb.push("(");
  let mut separated = qb.separated(", ");
  for id in ids {
    separated.push_bind(*id);
  }
  separated.push_unseparated(")");
}

impl SqliteStore {
  async fn read_limit_slots(&self, tag: &str) -> Result<Vec<Uuid>, Error> {
    Ok(
      sqlx::query_scalar("SELECT run_id FROM concurrency_slots WHERE tag = ? ORDER BY rowid")
        .bind(tag)
        .fetch_all(&self.pool)
        .await?,
    )
  }

  async fn limit_from_row(&self, row: ConcurrencyLimitRow) -> Result<ConcurrencyLimit, Error> {
    let active_slots = self.read_limit_slots(&row.tag).await?;
    Ok(ConcurrencyLimit {
      id: row.id,
      limit: to_u32(row.concurrency_limit, "concurrency_limit")?,
      tag: row.tag,
      active_slots,
      created: row.created,
    })
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_run(&self, run: &Run) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    bind_run(INSERT_RUN, run)
      .execute(&mut *tx)
      .await
      .map_err(|e| already_exists(e, || format!("run {}", run.id)))?;
    if let Some(state) = &run.state {
      insert_state(&mut tx, run.id, state).await?;
    }
    tx.commit().await?;
    Ok(())
  }

  async fn read_run(&self, run_id: Uuid) -> Result<Run, Error> {
    let row: Option<RunRow> = sqlx::query_as(&format!("{} WHERE r.id = ?", RUN_SELECT))
      .bind(run_id)
      .fetch_optional(&self.pool)
      .await?;
    row
      .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))?
      .try_into()
  }

  async fn read_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, Error> {
    let mut qb = QueryBuilder::<Sqlite>::new(RUN_SELECT);
    qb.push(" WHERE 1 = 1");
    if let Some(kind) = filter.kind {
      qb.push(" AND r.kind = ").push_bind(kind.as_str());
    }
    if !filter.state_types.is_empty() {
      qb.push(" AND r.state_type IN (");
      let mut separated = qb.separated(", ");
      for state_type in &filter.state_types {
        separated.push_bind(state_type.as_str());
      }
      separated.push_unseparated(")");
    }
    if !filter.exclude_state_names.is_empty() {
      qb.push(" AND (r.state_name IS NULL OR r.state_name NOT IN (");
      let mut separated = qb.separated(", ");
      for name in &filter.exclude_state_names {
        separated.push_bind(name.clone());
      }
      separated.push_unseparated("))");
    }
    if let Some(flow_run_id) = filter.flow_run_id {
      qb.push(" AND r.flow_run_id = ").push_bind(flow_run_id);
    }
    if filter.autonomous_only {
      qb.push(" AND r.kind = 'task' AND r.flow_run_id IS NULL");
    }
    if let Some(deployment_id) = filter.deployment_id {
      qb.push(" AND r.deployment_id = ").push_bind(deployment_id);
    }
    if !filter.work_queue_ids.is_empty() {
      qb.push(" AND r.work_queue_id IN ");
      push_uuid_list(&mut qb, &filter.work_queue_ids);
    }
    if let Some(before) = filter.next_scheduled_before {
      qb.push(" AND r.next_scheduled_start_time <= ")
        .push_bind(millis(before));
    }
    if let Some(before) = filter.state_entered_before {
      qb.push(" AND s.timestamp < ").push_bind(millis(before));
    }
    qb.push(" ORDER BY r.rowid");
    if let Some(limit) = filter.limit {
      qb.push(" LIMIT ").push_bind(limit as i64);
    }

    let rows: Vec<RunRow> = qb.build_query_as().fetch_all(&self.pool).await?;
    rows.into_iter().map(Run::try_from).collect()
  }

  async fn read_run_states(&self, run_id: Uuid) -> Result<Vec<State>, Error> {
    let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM runs WHERE id = ?")
      .bind(run_id)
      .fetch_optional(&self.pool)
      .await?;
    if exists.is_none() {
      return Err(Error::NotFound(format!("run {}", run_id)));
    }

    let rows: Vec<StateRow> = sqlx::query_as(
      r#"
      SELECT id, type AS state_type, name, timestamp, message, data, state_details
      FROM states
      WHERE run_id = ?
      ORDER BY rowid ASC
      "#,
    )
    .bind(run_id)
    .fetch_all(&self.pool)
    .await?;
    rows.into_iter().map(State::try_from).collect()
  }

  async fn commit_transition(
    &self,
    run: &Run,
    expected_state_id: Option<Uuid>,
  ) -> Result<(), Error> {
    let state = run
      .state
      .as_ref()
      .ok_or_else(|| Error::Invalid(format!("run {} has no state to commit", run.id)))?;

    let mut tx = self.pool.begin().await?;
    let updated = sqlx::query(
      r#"
      UPDATE runs
      SET state_id = ?, state_type = ?, state_name = ?, run_count = ?,
          expected_start_time = ?, next_scheduled_start_time = ?, start_time = ?, end_time = ?,
          total_run_time_ms = ?, empirical_policy = ?, tags = ?, work_queue_id = ?
      WHERE id = ? AND state_id IS ?
      "#,
    )
    .bind(state.id)
    .bind(state.state_type.as_str())
    .bind(&state.name)
    .bind(i64::from(run.run_count))
    .bind(run.expected_start_time.map(millis))
    .bind(run.next_scheduled_start_time.map(millis))
    .bind(run.start_time.map(millis))
    .bind(run.end_time.map(millis))
    .bind(run.total_run_time_ms)
    .bind(Json(run.empirical_policy.clone()))
    .bind(Json(run.tags.clone()))
    .bind(run.work_queue_id)
    .bind(run.id)
    .bind(expected_state_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
      let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM runs WHERE id = ?")
        .bind(run.id)
        .fetch_optional(&mut *tx)
        .await?;
      return Err(match exists {
        Some(_) => Error::Conflict(format!("run {} is no longer in the expected state", run.id)),
        None => Error::NotFound(format!("run {}", run.id)),
      });
    }

    insert_state(&mut tx, run.id, state).await?;
    tx.commit().await?;
    Ok(())
  }

  async fn read_cached_state(
    &self,
    cache_key: &str,
    now: DateTime<Utc>,
  ) -> Result<Option<State>, Error> {
    let row: Option<StateRow> = sqlx::query_as(
      r#"
      SELECT id, type AS state_type, name, timestamp, message, data, state_details
      FROM states
      WHERE cache_key = ? AND type = 'COMPLETED'
        AND (cache_expiration IS NULL OR cache_expiration > ?)
      ORDER BY timestamp DESC, rowid DESC
      LIMIT 1
      "#,
    )
    .bind(cache_key)
    .bind(millis(now))
    .fetch_optional(&self.pool)
    .await?;
    row.map(State::try_from).transpose()
  }

  async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO deployments (id, name, flow_name, work_queue_id, paused, tags, schedules,
        empirical_policy, created)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(deployment.id)
    .bind(&deployment.name)
    .bind(&deployment.flow_name)
    .bind(deployment.work_queue_id)
    .bind(deployment.paused)
    .bind(Json(&deployment.tags))
    .bind(Json(&deployment.schedules))
    .bind(Json(&deployment.empirical_policy))
    .bind(deployment.created)
    .execute(&self.pool)
    .await
    .map_err(|e| already_exists(e, || format!("deployment {}", deployment.id)))?;

    Ok(())
  }

  async fn read_deployment(&self, deployment_id: Uuid) -> Result<Deployment, Error> {
    let row: Option<DeploymentRow> = sqlx::query_as(
      r#"
      SELECT id, name, flow_name, work_queue_id, paused, tags, schedules, empirical_policy, created
      FROM deployments
      WHERE id = ?
      "#,
    )
    .bind(deployment_id)
    .fetch_optional(&self.pool)
    .await?;
    row
      .map(Deployment::from)
      .ok_or_else(|| Error::NotFound(format!("deployment {}", deployment_id)))
  }

  async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      UPDATE deployments
      SET name = ?, flow_name = ?, work_queue_id = ?, paused = ?, tags = ?, schedules = ?,
        empirical_policy = ?
      WHERE id = ?
      "#,
    )
    .bind(&deployment.name)
    .bind(&deployment.flow_name)
    .bind(deployment.work_queue_id)
    .bind(deployment.paused)
    .bind(Json(&deployment.tags))
    .bind(Json(&deployment.schedules))
    .bind(Json(&deployment.empirical_policy))
    .bind(deployment.id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("deployment {}", deployment.id)));
    }
    Ok(())
  }

  async fn read_schedulable_deployments(
    &self,
    offset: usize,
    limit: usize,
  ) -> Result<Vec<Deployment>, Error> {
    let rows: Vec<DeploymentRow> = sqlx::query_as(
      r#"
      SELECT id, name, flow_name, work_queue_id, paused, tags, schedules, empirical_policy, created
      FROM deployments
      WHERE paused = 0
        AND EXISTS (SELECT 1 FROM json_each(schedules) WHERE json_extract(value, '$.active') = 1)
      ORDER BY rowid
      LIMIT ? OFFSET ?
      "#,
    )
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(&self.pool)
    .await?;
    Ok(rows.into_iter().map(Deployment::from).collect())
  }

  async fn insert_scheduled_runs(&self, runs: &[Run]) -> Result<usize, Error> {
    let mut tx = self.pool.begin().await?;
    let mut inserted = 0;
    for run in runs {
      let result = bind_run(INSERT_SCHEDULED_RUN, run)
        .execute(&mut *tx)
        .await?;
      if result.rows_affected() == 0 {
        continue;
      }
      if let Some(state) = &run.state {
        insert_state(&mut tx, run.id, state).await?;
      }
      inserted += 1;
    }
    tx.commit().await?;
    Ok(inserted)
  }

  async fn create_work_pool(&self, pool: &WorkPool) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO work_pools (id, name, description, is_paused, concurrency_limit,
        default_queue_id, created)
      VALUES (?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(pool.id)
    .bind(&pool.name)
    .bind(&pool.description)
    .bind(pool.is_paused)
    .bind(pool.concurrency_limit.map(i64::from))
    .bind(pool.default_queue_id)
    .bind(pool.created)
    .execute(&self.pool)
    .await
    .map_err(|e| already_exists(e, || format!("work pool '{}'", pool.name)))?;

    Ok(())
  }

  async fn read_work_pool_by_name(&self, name: &str) -> Result<Option<WorkPool>, Error> {
    let row: Option<WorkPoolRow> = sqlx::query_as(
      r#"
      SELECT id, name, description, is_paused, concurrency_limit, default_queue_id, created
      FROM work_pools
      WHERE name = ?
      "#,
    )
    .bind(name)
    .fetch_optional(&self.pool)
    .await?;
    row.map(WorkPool::try_from).transpose()
  }

  async fn update_work_pool(&self, pool: &WorkPool) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      UPDATE work_pools
      SET name = ?, description = ?, is_paused = ?, concurrency_limit = ?, default_queue_id = ?
      WHERE id = ?
      "#,
    )
    .bind(&pool.name)
    .bind(&pool.description)
    .bind(pool.is_paused)
    .bind(pool.concurrency_limit.map(i64::from))
    .bind(pool.default_queue_id)
    .bind(pool.id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("work pool {}", pool.id)));
    }
    Ok(())
  }

  async fn create_work_queue(&self, queue: &WorkQueue) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO work_queues (id, work_pool_id, name, description, priority, concurrency_limit,
        is_paused, filter, last_polled, created)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(queue.id)
    .bind(queue.work_pool_id)
    .bind(&queue.name)
    .bind(&queue.description)
    .bind(i64::from(queue.priority))
    .bind(queue.concurrency_limit.map(i64::from))
    .bind(queue.is_paused)
    .bind(Json(&queue.filter))
    .bind(queue.last_polled.map(millis))
    .bind(queue.created)
    .execute(&self.pool)
    .await
    .map_err(|e| already_exists(e, || format!("work queue '{}'", queue.name)))?;

    Ok(())
  }

  async fn read_work_queue(&self, queue_id: Uuid) -> Result<WorkQueue, Error> {
    let row: Option<WorkQueueRow> = sqlx::query_as(
      r#"
      SELECT id, work_pool_id, name, description, priority, concurrency_limit, is_paused, filter,
        last_polled, created
      FROM work_queues
      WHERE id = ?
      "#,
    )
    .bind(queue_id)
    .fetch_optional(&self.pool)
    .await?;
    row
      .ok_or_else(|| Error::NotFound(format!("work queue {}", queue_id)))?
      .try_into()
  }

  async fn read_work_queue_by_name(
    &self,
    pool_id: Uuid,
    name: &str,
  ) -> Result<Option<WorkQueue>, Error> {
    let row: Option<WorkQueueRow> = sqlx::query_as(
      r#"
      SELECT id, work_pool_id, name, description, priority, concurrency_limit, is_paused, filter,
        last_polled, created
      FROM work_queues
      WHERE work_pool_id = ? AND name = ?
      "#,
    )
    .bind(pool_id)
    .bind(name)
    .fetch_optional(&self.pool)
    .await?;
    row.map(WorkQueue::try_from).transpose()
  }

  async fn read_work_queues(&self, pool_id: Uuid) -> Result<Vec<WorkQueue>, Error> {
    let rows: Vec<WorkQueueRow> = sqlx::query_as(
      r#"
      SELECT id, work_pool_id, name, description, priority, concurrency_limit, is_paused, filter,
        last_polled, created
      FROM work_queues
      WHERE work_pool_id = ?
      ORDER BY priority ASC, name ASC
      "#,
    )
    .bind(pool_id)
    .fetch_all(&self.pool)
    .await?;
    rows.into_iter().map(WorkQueue::try_from).collect()
  }

  async fn update_work_queue(&self, queue: &WorkQueue) -> Result<(), Error> {
    let result = sqlx::query(
      r#"
      UPDATE work_queues
      SET name = ?, description = ?, priority = ?, concurrency_limit = ?, is_paused = ?,
        filter = ?, last_polled = ?
      WHERE id = ?
      "#,
    )
    .bind(&queue.name)
    .bind(&queue.description)
    .bind(i64::from(queue.priority))
    .bind(queue.concurrency_limit.map(i64::from))
    .bind(queue.is_paused)
    .bind(Json(&queue.filter))
    .bind(queue.last_polled.map(millis))
    .bind(queue.id)
    .execute(&self.pool)
    .await
    .map_err(|e| already_exists(e, || format!("work queue '{}'", queue.name)))?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("work queue {}", queue.id)));
    }
    Ok(())
  }

  async fn touch_work_queue_polled(&self, queue_id: Uuid, at: DateTime<Utc>) -> Result<(), Error> {
    let result = sqlx::query("UPDATE work_queues SET last_polled = ? WHERE id = ?")
      .bind(millis(at))
      .bind(queue_id)
      .execute(&self.pool)
      .await?;

    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("work queue {}", queue_id)));
    }
    Ok(())
  }

  async fn delete_work_queue(&self, queue_id: Uuid) -> Result<(), Error> {
    let result = sqlx::query("DELETE FROM work_queues WHERE id = ?")
      .bind(queue_id)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("work queue {}", queue_id)));
    }
    Ok(())
  }

  async fn read_scheduled_runs_for_queues(
    &self,
    queue_ids: &[Uuid],
    scheduled_before: DateTime<Utc>,
    limit: Option<usize>,
  ) -> Result<Vec<Run>, Error> {
    if queue_ids.is_empty() {
      return Ok(Vec::new());
    }

    let mut qb = QueryBuilder::<Sqlite>::new(RUN_SELECT);
    qb.push(" WHERE r.state_type = 'SCHEDULED' AND r.work_queue_id IN ");
    push_uuid_list(&mut qb, queue_ids);
    qb.push(" AND r.next_scheduled_start_time <= ")
      .push_bind(millis(scheduled_before));
    qb.push(
      " AND (r.deployment_id IS NULL OR NOT EXISTS \
       (SELECT 1 FROM deployments d WHERE d.id = r.deployment_id AND d.paused = 1))",
    );
    qb.push(" ORDER BY r.next_scheduled_start_time ASC, r.rowid ASC");
    if let Some(limit) = limit {
      qb.push(" LIMIT ").push_bind(limit as i64);
    }

    let rows: Vec<RunRow> = qb.build_query_as().fetch_all(&self.pool).await?;
    rows.into_iter().map(Run::try_from).collect()
  }

  async fn count_active_runs(&self, queue_ids: &[Uuid]) -> Result<usize, Error> {
    if queue_ids.is_empty() {
      return Ok(0);
    }

    let mut qb = QueryBuilder::<Sqlite>::new(
      "SELECT COUNT(*) FROM runs \
       WHERE state_type IN ('PENDING', 'RUNNING', 'CANCELLING') AND work_queue_id IN ",
    );
    push_uuid_list(&mut qb, queue_ids);
    let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
    Ok(count.max(0) as usize)
  }

  async fn upsert_worker_heartbeat(
    &self,
    pool_id: Uuid,
    name: &str,
    at: DateTime<Utc>,
  ) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO workers (id, work_pool_id, name, last_heartbeat_time)
      VALUES (?, ?, ?, ?)
      ON CONFLICT (work_pool_id,
        name) DO UPDATE SET last_heartbeat_time = excluded.last_heartbeat_time
      "#,
    )
    .bind(Uuid::new_v4())
    .bind(pool_id)
    .bind(name)
    .bind(millis(at))
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn read_workers(&self, pool_id: Uuid) -> Result<Vec<Worker>, Error> {
    let rows: Vec<WorkerRow> = sqlx::query_as(
      r#"
      SELECT id, work_pool_id, name, last_heartbeat_time
      FROM workers
      WHERE work_pool_id = ?
      ORDER BY name ASC
      "#,
    )
    .bind(pool_id)
    .fetch_all(&self.pool)
    .await?;

    rows
      .into_iter()
      .map(|row| {
        Ok(Worker {
          id: row.id,
          work_pool_id: row.work_pool_id,
          name: row.name,
          last_heartbeat_time: from_millis(row.last_heartbeat_time)?,
        })
      })
      .collect()
  }

  async fn create_concurrency_limit(&self, limit: &ConcurrencyLimit) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    sqlx::query(
      "INSERT INTO concurrency_limits (id, tag, concurrency_limit, created) VALUES (?, ?, ?, ?)",
    )
    .bind(limit.id)
    .bind(&limit.tag)
    .bind(i64::from(limit.limit))
    .bind(limit.created)
    .execute(&mut *tx)
    .await
    .map_err(|e| already_exists(e, || format!("concurrency limit '{}'", limit.tag)))?;

    for run_id in &limit.active_slots {
      sqlx::query("INSERT OR IGNORE INTO concurrency_slots (tag, run_id) VALUES (?, ?)")
        .bind(&limit.tag)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
  }

  async fn read_concurrency_limit(&self, tag: &str) -> Result<Option<ConcurrencyLimit>, Error> {
    let row: Option<ConcurrencyLimitRow> = sqlx::query_as(
      "SELECT id, tag, concurrency_limit, created FROM concurrency_limits WHERE tag = ?",
    )
    .bind(tag)
    .fetch_optional(&self.pool)
    .await?;
    match row {
      Some(row) => Ok(Some(self.limit_from_row(row).await?)),
      None => Ok(None),
    }
  }

  async fn read_concurrency_limits(&self, tags: &[String]) -> Result<Vec<ConcurrencyLimit>, Error> {
    let mut limits = Vec::new();
    for tag in tags {
      if let Some(limit) = self.read_concurrency_limit(tag).await? {
        limits.push(limit);
      }
    }
    Ok(limits)
  }

  async fn delete_concurrency_limit(&self, tag: &str) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    sqlx::query("DELETE FROM concurrency_slots WHERE tag = ?")
      .bind(tag)
      .execute(&mut *tx)
      .await?;
    let result = sqlx::query("DELETE FROM concurrency_limits WHERE tag = ?")
      .bind(tag)
      .execute(&mut *tx)
      .await?;
    if result.rows_affected() == 0 {
      return Err(Error::NotFound(format!("concurrency limit '{}'", tag)));
    }
    tx.commit().await?;
    Ok(())
  }

  async fn acquire_concurrency_slots(&self, tags: &[String], run_id: Uuid) -> Result<bool, Error> {
    let mut tx = self.pool.begin().await?;
    for tag in tags {
      // Conditional insert: takes a slot only while the tag is under its limit.
      let taken = sqlx::query(
        r#"
        INSERT OR IGNORE INTO concurrency_slots (tag, run_id)
        SELECT l.tag, ?
        FROM concurrency_limits l
        WHERE l.tag = ?
          AND (SELECT COUNT(*) FROM concurrency_slots s WHERE s.tag = l.tag) < l.concurrency_limit
        "#,
      )
      .bind(run_id)
      .bind(tag)
      .execute(&mut *tx)
      .await?;
      if taken.rows_affected() > 0 {
        continue;
      }

      let limited: Option<i64> =
        sqlx::query_scalar("SELECT concurrency_limit FROM concurrency_limits WHERE tag = ?")
          .bind(tag)
          .fetch_optional(&mut *tx)
          .await?;
      let held: Option<Uuid> =
        sqlx::query_scalar("SELECT run_id FROM concurrency_slots WHERE tag = ? AND run_id = ?")
          .bind(tag)
          .bind(run_id)
          .fetch_optional(&mut *tx)
          .await?;
      if limited.is_some() && held.is_none() {
        tx.rollback().await?;
        return Ok(false);
      }
    }
    tx.commit().await?;
    Ok(true)
  }

  async fn release_concurrency_slots(&self, tags: &[String], run_id: Uuid) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    for tag in tags {
      sqlx::query("DELETE FROM concurrency_slots WHERE tag = ? AND run_id = ?")
        .bind(tag)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
  }

  async fn create_notification_policy(&self, policy: &NotificationPolicy) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO notification_policies (id, is_active, state_names, tags, message_template,
        destination)
      VALUES (?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(policy.id)
    .bind(policy.is_active)
    .bind(Json(&policy.state_names))
    .bind(Json(&policy.tags))
    .bind(&policy.message_template)
    .bind(&policy.destination)
    .execute(&self.pool)
    .await
    .map_err(|e| already_exists(e, || format!("notification policy {}", policy.id)))?;

    Ok(())
  }

  async fn read_notification_policies(
    &self,
    active_only: bool,
  ) -> Result<Vec<NotificationPolicy>, Error> {
    let rows: Vec<NotificationPolicyRow> = sqlx::query_as(
      r#"
      SELECT id, is_active, state_names, tags, message_template, destination
      FROM notification_policies
      WHERE is_active = 1 OR ? = 0
      ORDER BY rowid
      "#,
    )
    .bind(active_only)
    .fetch_all(&self.pool)
    .await?;

    Ok(
      rows
        .into_iter()
        .map(|row| NotificationPolicy {
          id: row.id,
          is_active: row.is_active,
          state_names: row.state_names.0,
          tags: row.tags.0,
          message_template: row.message_template,
          destination: row.destination,
        })
        .collect(),
    )
  }

  async fn enqueue_notification(&self, notification: &QueuedNotification) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO notification_queue (id, policy_id, run_id, state_id, enqueued_at)
      VALUES (?, ?, ?, ?, ?)
      "#,
    )
    .bind(notification.id)
    .bind(notification.policy_id)
    .bind(notification.run_id)
    .bind(notification.state_id)
    .bind(notification.enqueued_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn pop_notification(&self) -> Result<Option<QueuedNotification>, Error> {
    let mut tx = self.pool.begin().await?;
    let row: Option<QueuedNotificationRow> = sqlx::query_as(
      r#"
      SELECT id, policy_id, run_id, state_id, enqueued_at
      FROM notification_queue
      ORDER BY seq ASC
      LIMIT 1
      "#,
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
      return Ok(None);
    };
    sqlx::query("DELETE FROM notification_queue WHERE id = ?")
      .bind(row.id)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;

    Ok(Some(QueuedNotification {
      id: row.id,
      policy_id: row.policy_id,
      run_id: row.run_id,
      state_id: row.state_id,
      enqueued_at: row.enqueued_at,
    }))
  }
}
