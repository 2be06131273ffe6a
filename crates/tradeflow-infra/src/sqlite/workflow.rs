//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `tradeflow-core` using sqlx with split
//! read/write pools. Nested structures (step config, conditions, schedule
//! specs, execution payloads) are stored as JSON text. Timestamps use a fixed
//! RFC 3339 format with microseconds so they compare correctly as text.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Decode, Row, Type};
use tradeflow_core::repository::workflow::WorkflowRepository;
use tradeflow_types::error::RepositoryError;
use tradeflow_types::workflow::{
    Workflow, WorkflowExecution, WorkflowSchedule, WorkflowStep, WorkflowStepExecution,
};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const WORKFLOW_COLUMNS: &str = "id, code, name, workflow_type, description, version, status, \
     max_retries, retry_delay_seconds, timeout_minutes, total_executions, successful_executions, \
     failed_executions, average_duration_seconds, created_at, updated_at";

const STEP_COLUMNS: &str = "id, workflow_id, name, step_type, step_order, config, is_optional, \
     can_retry, max_retries, timeout_seconds, condition, can_run_parallel, parallel_group, depends_on";

const EXECUTION_COLUMNS: &str = "id, execution_id, workflow_id, status, trigger_type, triggered_by, \
     input_data, output_data, context_data, total_steps, completed_steps, current_step, started_at, \
     completed_at, duration_seconds, error_message, error_step, retry_count, retried_from, created_at";

const STEP_EXECUTION_COLUMNS: &str = "id, execution_id, step_id, step_name, status, execution_order, \
     input_data, output_data, started_at, completed_at, duration_seconds, error_message, \
     error_details, retry_count, metrics";

const SCHEDULE_COLUMNS: &str = "id, workflow_id, name, spec, input_data, is_active, next_run_at, \
     last_run_at, total_runs, created_at";

/// Statuses an execution can still be written in.
const OPEN_STATUSES: &str = "('pending', 'running')";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_err(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: Decode<'r, Sqlite> + Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| RepositoryError::Query(format!("column {name}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_opt_uuid(s: Option<String>) -> Result<Option<Uuid>, RepositoryError> {
    s.as_deref().map(parse_uuid).transpose()
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a snake_case enum stored as plain text.
fn parse_enum<T: DeserializeOwned>(value: String, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::String(value.clone()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {value}")))
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn workflow_from_row(row: &SqliteRow) -> Result<Workflow, RepositoryError> {
    Ok(Workflow {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        code: col(row, "code")?,
        name: col(row, "name")?,
        workflow_type: col(row, "workflow_type")?,
        description: col(row, "description")?,
        version: col(row, "version")?,
        status: parse_enum(col(row, "status")?, "workflow status")?,
        max_retries: col::<i64>(row, "max_retries")? as u32,
        retry_delay_seconds: col::<i64>(row, "retry_delay_seconds")? as u64,
        timeout_minutes: col::<i64>(row, "timeout_minutes")? as u32,
        total_executions: col::<i64>(row, "total_executions")? as u64,
        successful_executions: col::<i64>(row, "successful_executions")? as u64,
        failed_executions: col::<i64>(row, "failed_executions")? as u64,
        average_duration_seconds: col(row, "average_duration_seconds")?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
        updated_at: parse_datetime(&col::<String>(row, "updated_at")?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<WorkflowStep, RepositoryError> {
    let condition: Option<String> = col(row, "condition")?;
    Ok(WorkflowStep {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        workflow_id: parse_uuid(&col::<String>(row, "workflow_id")?)?,
        name: col(row, "name")?,
        step_type: col::<String>(row, "step_type")?.into(),
        order: col::<i64>(row, "step_order")? as i32,
        config: parse_json(&col::<String>(row, "config")?, "step config")?,
        is_optional: col(row, "is_optional")?,
        can_retry: col(row, "can_retry")?,
        max_retries: col::<i64>(row, "max_retries")? as u32,
        timeout_seconds: col::<i64>(row, "timeout_seconds")? as u64,
        condition: condition
            .as_deref()
            .map(|c| parse_json(c, "step condition"))
            .transpose()?,
        can_run_parallel: col(row, "can_run_parallel")?,
        parallel_group: col(row, "parallel_group")?,
        depends_on: parse_json(&col::<String>(row, "depends_on")?, "depends_on")?,
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<WorkflowExecution, RepositoryError> {
    Ok(WorkflowExecution {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        execution_id: col(row, "execution_id")?,
        workflow_id: parse_uuid(&col::<String>(row, "workflow_id")?)?,
        status: parse_enum(col(row, "status")?, "execution status")?,
        trigger_type: parse_enum(col(row, "trigger_type")?, "trigger type")?,
        triggered_by: col(row, "triggered_by")?,
        input_data: parse_json(&col::<String>(row, "input_data")?, "input_data")?,
        output_data: parse_json(&col::<String>(row, "output_data")?, "output_data")?,
        context_data: parse_json(&col::<String>(row, "context_data")?, "context_data")?,
        total_steps: col::<i64>(row, "total_steps")? as u32,
        completed_steps: col::<i64>(row, "completed_steps")? as u32,
        current_step: parse_opt_uuid(col(row, "current_step")?)?,
        started_at: parse_opt_datetime(col(row, "started_at")?)?,
        completed_at: parse_opt_datetime(col(row, "completed_at")?)?,
        duration_seconds: col(row, "duration_seconds")?,
        error_message: col(row, "error_message")?,
        error_step: parse_opt_uuid(col(row, "error_step")?)?,
        retry_count: col::<i64>(row, "retry_count")? as u32,
        retried_from: parse_opt_uuid(col(row, "retried_from")?)?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
    })
}

fn step_execution_from_row(row: &SqliteRow) -> Result<WorkflowStepExecution, RepositoryError> {
    let details: Option<String> = col(row, "error_details")?;
    Ok(WorkflowStepExecution {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        execution_id: parse_uuid(&col::<String>(row, "execution_id")?)?,
        step_id: parse_uuid(&col::<String>(row, "step_id")?)?,
        step_name: col(row, "step_name")?,
        status: parse_enum(col(row, "status")?, "step status")?,
        execution_order: col::<i64>(row, "execution_order")? as u32,
        input_data: parse_json(&col::<String>(row, "input_data")?, "input_data")?,
        output_data: parse_json(&col::<String>(row, "output_data")?, "output_data")?,
        started_at: parse_opt_datetime(col(row, "started_at")?)?,
        completed_at: parse_opt_datetime(col(row, "completed_at")?)?,
        duration_seconds: col(row, "duration_seconds")?,
        error_message: col(row, "error_message")?,
        error_details: details
            .as_deref()
            .map(|d| parse_json(d, "error_details"))
            .transpose()?,
        retry_count: col::<i64>(row, "retry_count")? as u32,
        metrics: parse_json(&col::<String>(row, "metrics")?, "metrics")?,
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<WorkflowSchedule, RepositoryError> {
    Ok(WorkflowSchedule {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        workflow_id: parse_uuid(&col::<String>(row, "workflow_id")?)?,
        name: col(row, "name")?,
        spec: parse_json(&col::<String>(row, "spec")?, "schedule spec")?,
        input_data: parse_json(&col::<String>(row, "input_data")?, "input_data")?,
        is_active: col(row, "is_active")?,
        next_run_at: parse_opt_datetime(col(row, "next_run_at")?)?,
        last_run_at: parse_opt_datetime(col(row, "last_run_at")?)?,
        total_runs: col::<i64>(row, "total_runs")? as u64,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
    })
}

fn collect<T>(
    rows: &[SqliteRow],
    map: fn(&SqliteRow) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter().map(map).collect()
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        // Counters are left alone on update; `record_execution_outcome` owns them.
        sqlx::query(&format!(
            r#"INSERT INTO workflows ({WORKFLOW_COLUMNS})
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 code = excluded.code,
                 name = excluded.name,
                 workflow_type = excluded.workflow_type,
                 description = excluded.description,
                 version = excluded.version,
                 status = excluded.status,
                 max_retries = excluded.max_retries,
                 retry_delay_seconds = excluded.retry_delay_seconds,
                 timeout_minutes = excluded.timeout_minutes,
                 updated_at = excluded.updated_at"#
        ))
        .bind(workflow.id.to_string())
        .bind(&workflow.code)
        .bind(&workflow.name)
        .bind(&workflow.workflow_type)
        .bind(&workflow.description)
        .bind(&workflow.version)
        .bind(workflow.status.as_str())
        .bind(i64::from(workflow.max_retries))
        .bind(workflow.retry_delay_seconds as i64)
        .bind(i64::from(workflow.timeout_minutes))
        .bind(workflow.total_executions as i64)
        .bind(workflow.successful_executions as i64)
        .bind(workflow.failed_executions as i64)
        .bind(workflow.average_duration_seconds)
        .bind(format_datetime(&workflow.created_at))
        .bind(format_datetime(&workflow.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn get_workflow_by_code(&self, code: &str) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE code = ?"))
            .bind(code)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY code ASC"))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        collect(&rows, workflow_from_row)
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        let (executions,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workflow_executions WHERE workflow_id = ?")
                .bind(id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        if executions > 0 {
            return Err(RepositoryError::Conflict(
                "workflow has executions".to_string(),
            ));
        }

        // Steps and schedules go with the workflow (ON DELETE CASCADE).
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_execution_outcome(
        &self,
        workflow_id: &Uuid,
        success: bool,
        duration_seconds: Option<f64>,
    ) -> Result<(), RepositoryError> {
        // Right-hand sides see the pre-update row, so the average uses the
        // old success count.
        let result = sqlx::query(
            r#"UPDATE workflows SET
                 total_executions = total_executions + 1,
                 successful_executions = successful_executions + CASE WHEN ?1 THEN 1 ELSE 0 END,
                 failed_executions = failed_executions + CASE WHEN ?1 THEN 0 ELSE 1 END,
                 average_duration_seconds = CASE
                   WHEN ?1 AND ?2 IS NOT NULL
                   THEN (average_duration_seconds * successful_executions + ?2) / (successful_executions + 1)
                   ELSE average_duration_seconds
                 END,
                 updated_at = ?3
               WHERE id = ?4"#,
        )
        .bind(success)
        .bind(duration_seconds)
        .bind(format_datetime(&Utc::now()))
        .bind(workflow_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_step(&self, step: &WorkflowStep) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM workflow_steps WHERE id = ?")
            .bind(step.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        insert_step(&mut tx, step).await?;
        tx.commit().await.map_err(db_err)
    }

    async fn replace_steps(
        &self,
        workflow_id: &Uuid,
        steps: &[WorkflowStep],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM workflow_steps WHERE workflow_id = ?")
            .bind(workflow_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for step in steps {
            insert_step(&mut tx, step).await?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<WorkflowStep>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = ? ORDER BY step_order ASC, name ASC"
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        collect(&rows, step_from_row)
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO workflow_executions ({EXECUTION_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(execution.id.to_string())
        .bind(&execution.execution_id)
        .bind(execution.workflow_id.to_string())
        .bind(execution.status.as_str())
        .bind(execution.trigger_type.as_str())
        .bind(&execution.triggered_by)
        .bind(to_json(&execution.input_data)?)
        .bind(to_json(&execution.output_data)?)
        .bind(to_json(&execution.context_data)?)
        .bind(i64::from(execution.total_steps))
        .bind(i64::from(execution.completed_steps))
        .bind(execution.current_step.map(|id| id.to_string()))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.duration_seconds)
        .bind(&execution.error_message)
        .bind(execution.error_step.map(|id| id.to_string()))
        .bind(i64::from(execution.retry_count))
        .bind(execution.retried_from.map(|id| id.to_string()))
        .bind(format_datetime(&execution.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn get_execution_by_key(
        &self,
        key: &str,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE execution_id = ?"
        ))
        .bind(key)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<bool, RepositoryError> {
        let result = sqlx::query(&format!(
            r#"UPDATE workflow_executions SET
                 status = ?, output_data = ?, context_data = ?, completed_steps = ?,
                 current_step = ?, started_at = ?, completed_at = ?, duration_seconds = ?,
                 error_message = ?, error_step = ?
               WHERE id = ? AND status IN {OPEN_STATUSES}"#
        ))
        .bind(execution.status.as_str())
        .bind(to_json(&execution.output_data)?)
        .bind(to_json(&execution.context_data)?)
        .bind(i64::from(execution.completed_steps))
        .bind(execution.current_step.map(|id| id.to_string()))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.duration_seconds)
        .bind(&execution.error_message)
        .bind(execution.error_step.map(|id| id.to_string()))
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_current_step(&self, execution_id: &Uuid, step_id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "UPDATE workflow_executions SET current_step = ? WHERE id = ? AND status IN {OPEN_STATUSES}"
        ))
        .bind(step_id.to_string())
        .bind(execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = match workflow_id {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
                     WHERE workflow_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(id.to_string())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(db_err)?;
        collect(&rows, execution_from_row)
    }

    async fn create_step_execution(&self, record: &WorkflowStepExecution) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO workflow_step_executions ({STEP_EXECUTION_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(record.id.to_string())
        .bind(record.execution_id.to_string())
        .bind(record.step_id.to_string())
        .bind(&record.step_name)
        .bind(record.status.as_str())
        .bind(i64::from(record.execution_order))
        .bind(to_json(&record.input_data)?)
        .bind(to_json(&record.output_data)?)
        .bind(record.started_at.as_ref().map(format_datetime))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.duration_seconds)
        .bind(&record.error_message)
        .bind(record.error_details.as_ref().map(to_json).transpose()?)
        .bind(i64::from(record.retry_count))
        .bind(to_json(&record.metrics)?)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_step_execution(&self, record: &WorkflowStepExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_step_executions SET
                 status = ?, input_data = ?, output_data = ?, started_at = ?, completed_at = ?,
                 duration_seconds = ?, error_message = ?, error_details = ?, retry_count = ?,
                 metrics = ?
               WHERE id = ?"#,
        )
        .bind(record.status.as_str())
        .bind(to_json(&record.input_data)?)
        .bind(to_json(&record.output_data)?)
        .bind(record.started_at.as_ref().map(format_datetime))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.duration_seconds)
        .bind(&record.error_message)
        .bind(record.error_details.as_ref().map(to_json).transpose()?)
        .bind(i64::from(record.retry_count))
        .bind(to_json(&record.metrics)?)
        .bind(record.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<WorkflowStepExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} FROM workflow_step_executions
             WHERE execution_id = ? ORDER BY execution_order ASC"
        ))
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        collect(&rows, step_execution_from_row)
    }

    async fn save_schedule(&self, schedule: &WorkflowSchedule) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            r#"INSERT INTO workflow_schedules ({SCHEDULE_COLUMNS})
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 spec = excluded.spec,
                 input_data = excluded.input_data,
                 is_active = excluded.is_active,
                 next_run_at = excluded.next_run_at"#
        ))
        .bind(schedule.id.to_string())
        .bind(schedule.workflow_id.to_string())
        .bind(&schedule.name)
        .bind(to_json(&schedule.spec)?)
        .bind(to_json(&schedule.input_data)?)
        .bind(schedule.is_active)
        .bind(schedule.next_run_at.as_ref().map(format_datetime))
        .bind(schedule.last_run_at.as_ref().map(format_datetime))
        .bind(schedule.total_runs as i64)
        .bind(format_datetime(&schedule.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_schedule(&self, id: &Uuid) -> Result<Option<WorkflowSchedule>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM workflow_schedules WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_schedules(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> Result<Vec<WorkflowSchedule>, RepositoryError> {
        let rows = match workflow_id {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM workflow_schedules WHERE workflow_id = ? ORDER BY created_at ASC"
                ))
                .bind(id.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM workflow_schedules ORDER BY created_at ASC"
                ))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(db_err)?;
        collect(&rows, schedule_from_row)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowSchedule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM workflow_schedules
             WHERE is_active = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at ASC"
        ))
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        collect(&rows, schedule_from_row)
    }

    async fn mark_schedule_run(
        &self,
        id: &Uuid,
        ran_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_schedules SET last_run_at = ?, total_runs = total_runs + 1, next_run_at = ? WHERE id = ?",
        )
        .bind(format_datetime(&ran_at))
        .bind(next.as_ref().map(format_datetime))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_schedule(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

async fn insert_step(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    step: &WorkflowStep,
) -> Result<(), RepositoryError> {
    sqlx::query(&format!(
        "INSERT INTO workflow_steps ({STEP_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(step.id.to_string())
    .bind(step.workflow_id.to_string())
    .bind(&step.name)
    .bind(step.step_type.as_str())
    .bind(i64::from(step.order))
    .bind(to_json(&step.config)?)
    .bind(step.is_optional)
    .bind(step.can_retry)
    .bind(i64::from(step.max_retries))
    .bind(step.timeout_seconds as i64)
    .bind(step.condition.as_ref().map(to_json).transpose()?)
    .bind(step.can_run_parallel)
    .bind(&step.parallel_group)
    .bind(to_json(&step.depends_on)?)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeDelta};
    use serde_json::json;
    use tradeflow_types::workflow::{
        CompareOperator, ExecutionStatus, ScheduleSpec, StepCondition, StepKind,
        StepExecutionStatus, TriggerType, WorkflowStatus,
    };

    async fn test_repo() -> SqliteWorkflowRepository {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteWorkflowRepository::new(DatabasePool::new(&url).await.unwrap())
    }

    fn sample_workflow() -> Workflow {
        let mut wf = Workflow::new("Supplier Sync", "supplier_sync", "supplier_sync");
        wf.status = WorkflowStatus::Active;
        wf.description = Some("Pull supplier catalogue".to_string());
        wf
    }

    fn trunc(dt: DateTime<Utc>) -> DateTime<Utc> {
        parse_datetime(&format_datetime(&dt)).unwrap()
    }

    async fn seeded() -> (SqliteWorkflowRepository, Workflow, WorkflowStep) {
        let repo = test_repo().await;
        let wf = sample_workflow();
        repo.save_workflow(&wf).await.unwrap();
        let step = WorkflowStep::new(wf.id, "fetch", StepKind::DataFetch, 1);
        repo.save_step(&step).await.unwrap();
        (repo, wf, step)
    }

    // -- Workflows and steps --

    #[tokio::test]
    async fn test_save_and_get_workflow() {
        let repo = test_repo().await;
        let wf = sample_workflow();
        repo.save_workflow(&wf).await.unwrap();

        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.code, "supplier_sync");
        assert_eq!(loaded.status, WorkflowStatus::Active);
        assert_eq!(loaded.description.as_deref(), Some("Pull supplier catalogue"));

        let by_code = repo.get_workflow_by_code("supplier_sync").await.unwrap().unwrap();
        assert_eq!(by_code.id, wf.id);
        assert!(repo.get_workflow_by_code("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_code_conflicts() {
        let repo = test_repo().await;
        repo.save_workflow(&sample_workflow()).await.unwrap();
        let err = repo.save_workflow(&sample_workflow()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_steps_round_trip_in_order() {
        let (repo, wf, fetch) = seeded().await;

        let mut enrich = WorkflowStep::new(wf.id, "enrich", StepKind::Custom("shopify_enrich".into()), 2);
        enrich.depends_on = vec![fetch.id];
        enrich.can_run_parallel = true;
        enrich.parallel_group = Some("enrich".to_string());
        enrich.condition = Some(StepCondition::ValueCheck {
            path: "input_data.enrich".to_string(),
            operator: CompareOperator::Equals,
            value: json!(true),
        });
        enrich.config.input_mapping.insert("products".into(), "steps.fetch.body".into());
        repo.save_step(&enrich).await.unwrap();

        let steps = repo.list_steps(&wf.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "fetch");
        assert_eq!(steps[1].step_type, StepKind::Custom("shopify_enrich".into()));
        assert_eq!(steps[1].depends_on, vec![fetch.id]);
        assert_eq!(steps[1].condition, enrich.condition);
        assert_eq!(steps[1].config.input_mapping["products"], "steps.fetch.body");

        repo.replace_steps(&wf.id, &[WorkflowStep::new(wf.id, "only", StepKind::DataTransform, 1)])
            .await
            .unwrap();
        let steps = repo.list_steps(&wf.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "only");
    }

    #[tokio::test]
    async fn test_record_outcome_is_atomic_and_averages_successes() {
        let (repo, wf, _) = seeded().await;
        repo.record_execution_outcome(&wf.id, true, Some(10.0)).await.unwrap();
        repo.record_execution_outcome(&wf.id, true, Some(20.0)).await.unwrap();
        repo.record_execution_outcome(&wf.id, false, Some(99.0)).await.unwrap();

        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.total_executions, 3);
        assert_eq!(loaded.successful_executions, 2);
        assert_eq!(loaded.failed_executions, 1);
        assert!((loaded.average_duration_seconds - 15.0).abs() < 1e-9);

        // Saving the template again must not reset counters.
        repo.save_workflow(&wf).await.unwrap();
        assert_eq!(repo.get_workflow(&wf.id).await.unwrap().unwrap().total_executions, 3);
    }

    #[tokio::test]
    async fn test_delete_workflow_with_executions_conflicts() {
        let (repo, wf, _) = seeded().await;
        let execution = WorkflowExecution::new(&wf, 1, json!({}), None, TriggerType::Manual);
        repo.create_execution(&execution).await.unwrap();
        assert!(matches!(
            repo.delete_workflow(&wf.id).await.unwrap_err(),
            RepositoryError::Conflict(_)
        ));

        let other = Workflow::new("Other", "other", "other");
        repo.save_workflow(&other).await.unwrap();
        repo.save_step(&WorkflowStep::new(other.id, "a", StepKind::DataFetch, 1)).await.unwrap();
        assert!(repo.delete_workflow(&other.id).await.unwrap());
        assert!(repo.list_steps(&other.id).await.unwrap().is_empty());
    }

    // -- Executions --

    #[tokio::test]
    async fn test_execution_round_trip_and_guarded_update() {
        let (repo, wf, step) = seeded().await;
        let mut execution = WorkflowExecution::new(&wf, 1, json!({"since": "2026-01-01"}), Some("cli".into()), TriggerType::Manual);
        repo.create_execution(&execution).await.unwrap();

        execution.start();
        assert!(repo.update_execution(&execution).await.unwrap());
        repo.set_current_step(&execution.id, &step.id).await.unwrap();

        let by_key = repo.get_execution_by_key(&execution.execution_id).await.unwrap().unwrap();
        assert_eq!(by_key.status, ExecutionStatus::Running);
        assert_eq!(by_key.current_step, Some(step.id));
        assert_eq!(by_key.input_data, json!({"since": "2026-01-01"}));
        assert_eq!(by_key.triggered_by.as_deref(), Some("cli"));

        let mut cancelled = by_key.clone();
        assert!(cancelled.cancel());
        assert!(repo.update_execution(&cancelled).await.unwrap());

        // A late completion must not overwrite the cancellation.
        execution.complete(true, None);
        assert!(!repo.update_execution(&execution).await.unwrap());
        let stored = repo.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_list_executions_newest_first() {
        let (repo, wf, _) = seeded().await;
        let mut first = WorkflowExecution::new(&wf, 1, json!({}), None, TriggerType::Manual);
        first.created_at = Utc::now() - TimeDelta::minutes(5);
        let second = WorkflowExecution::new(&wf, 1, json!({}), None, TriggerType::Scheduled);
        repo.create_execution(&first).await.unwrap();
        repo.create_execution(&second).await.unwrap();

        let listed = repo.list_executions(Some(&wf.id), 10).await.unwrap();
        assert_eq!(listed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert_eq!(repo.list_executions(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_step_execution_unique_per_pair() {
        let (repo, wf, step) = seeded().await;
        let execution = WorkflowExecution::new(&wf, 1, json!({}), None, TriggerType::Manual);
        repo.create_execution(&execution).await.unwrap();

        let mut record = WorkflowStepExecution::new(execution.id, &step, 1);
        repo.create_step_execution(&record).await.unwrap();
        let duplicate = WorkflowStepExecution::new(execution.id, &step, 2);
        assert!(matches!(
            repo.create_step_execution(&duplicate).await.unwrap_err(),
            RepositoryError::Conflict(_)
        ));

        record.start(json!({"url": "https://supplier.example"}));
        record.fail("HTTP 503", Some(json!({"kind": "execution_failed", "attempts": 1})));
        repo.update_step_execution(&record).await.unwrap();

        let records = repo.list_step_executions(&execution.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, StepExecutionStatus::Failed);
        assert_eq!(records[0].error_details.as_ref().unwrap()["attempts"], json!(1));
    }

    // -- Schedules --

    #[tokio::test]
    async fn test_due_schedules_and_mark_run() {
        let (repo, wf, _) = seeded().await;
        let now = Utc::now();

        let mut due = WorkflowSchedule::new(
            wf.id,
            "nightly",
            ScheduleSpec::Daily { at: NaiveTime::from_hms_opt(2, 0, 0).unwrap() },
        );
        due.next_run_at = Some(now - TimeDelta::minutes(1));
        let mut later = WorkflowSchedule::new(wf.id, "later", ScheduleSpec::Interval { seconds: 60 });
        later.next_run_at = Some(now + TimeDelta::hours(1));
        let mut paused = WorkflowSchedule::new(wf.id, "paused", ScheduleSpec::Interval { seconds: 60 });
        paused.next_run_at = Some(now - TimeDelta::hours(1));
        paused.is_active = false;
        for s in [&due, &later, &paused] {
            repo.save_schedule(s).await.unwrap();
        }

        let found = repo.list_due_schedules(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
        assert_eq!(found[0].spec, due.spec);

        let next = now + TimeDelta::days(1);
        repo.mark_schedule_run(&due.id, now, Some(next)).await.unwrap();
        let stored = repo.get_schedule(&due.id).await.unwrap().unwrap();
        assert_eq!(stored.total_runs, 1);
        assert_eq!(stored.last_run_at, Some(trunc(now)));
        assert_eq!(stored.next_run_at, Some(trunc(next)));
        assert!(repo.list_due_schedules(now).await.unwrap().is_empty());

        assert_eq!(repo.list_schedules(Some(&wf.id)).await.unwrap().len(), 3);
        assert!(repo.delete_schedule(&later.id).await.unwrap());
        assert!(matches!(
            repo.mark_schedule_run(&later.id, now, None).await.unwrap_err(),
            RepositoryError::NotFound
        ));
    }
}
