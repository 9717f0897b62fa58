//! The relational half of the trace store: a SQLite database indexed by
//! `traceId` / `stepId` / `stepName` / `tourneyResultId`, serving the
//! read-side queries the HTTP surface needs — `get_complete_trace`,
//! `get_tourney_step_name_list`, and `get_tourney_results_for_step_name`.
//!
//! Built on `sqlx` (sqlite feature) rather than `rusqlite`; see `DESIGN.md`.
//!
//! The recorder's record types (`StepTraceData`, `TourneyResult`, `TraceInfo`,
//! `LogEvent`) derive `Serialize` only — they're write-only by design, emitted
//! once and never read back into the same shape. Rows are stored as indexed
//! columns plus a JSON blob, and read back as `serde_json::Value` rather than
//! reconstructed into those types.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use llmonpy_core::recorder::{LogEvent, StepTraceData, TourneyResult, TraceInfo, TraceSink};

use crate::error::TraceResult;

/// The aggregate `get_complete_trace` assembles for one `traceId`: the
/// trace-info row (absent until the root recorder finalizes) plus every step
/// and tourney result recorded under it.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CompleteTraceData {
    pub trace_info: Option<Value>,
    pub step_list: Vec<Value>,
    pub tourney_result_list: Vec<Value>,
}

pub struct SqliteTraceSink {
    pool: SqlitePool,
}

impl SqliteTraceSink {
    pub async fn connect(path: impl AsRef<Path>) -> TraceResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        let sink = Self { pool };
        sink.migrate().await?;
        Ok(sink)
    }

    /// In-memory store for tests — one connection, same schema.
    pub async fn connect_in_memory() -> TraceResult<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        let sink = Self { pool };
        sink.migrate().await?;
        Ok(sink)
    }

    async fn migrate(&self) -> TraceResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trace_info (
                trace_id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS step_record (
                step_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                data TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_step_record_trace_id ON step_record(trace_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_step_record_step_name ON step_record(step_name)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS event (
                event_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                data TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_trace_id ON event(trace_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_step_id ON event(step_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tourney_result (
                tourney_result_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                data TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tourney_result_trace_id ON tourney_result(trace_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tourney_result_step_name ON tourney_result(step_name)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_complete_trace(&self, trace_id: Uuid) -> TraceResult<CompleteTraceData> {
        let trace_id_str = trace_id.to_string();

        let trace_info = sqlx::query("SELECT data FROM trace_info WHERE trace_id = ?1")
            .bind(&trace_id_str)
            .fetch_optional(&self.pool)
            .await?
            .and_then(|row| serde_json::from_str(row.get::<&str, _>("data")).ok());

        let step_rows = sqlx::query("SELECT data FROM step_record WHERE trace_id = ?1 ORDER BY rowid")
            .bind(&trace_id_str)
            .fetch_all(&self.pool)
            .await?;
        let step_list = step_rows
            .iter()
            .filter_map(|row| serde_json::from_str(row.get::<&str, _>("data")).ok())
            .collect();

        let tourney_rows = sqlx::query("SELECT data FROM tourney_result WHERE trace_id = ?1 ORDER BY rowid")
            .bind(&trace_id_str)
            .fetch_all(&self.pool)
            .await?;
        let tourney_result_list = tourney_rows
            .iter()
            .filter_map(|row| serde_json::from_str(row.get::<&str, _>("data")).ok())
            .collect();

        Ok(CompleteTraceData { trace_info, step_list, tourney_result_list })
    }

    /// Every distinct step name a `Ranker` has ever recorded a `TourneyResult`
    /// under — backs the CLI's `tourney-steps` command and the HTTP
    /// `get_tourney_step_name_list` endpoint.
    pub async fn get_tourney_step_name_list(&self) -> TraceResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT step_name FROM tourney_result ORDER BY step_name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get::<String, _>("step_name")).collect())
    }

    pub async fn get_tourney_results_for_step_name(&self, step_name: &str) -> TraceResult<Vec<Value>> {
        let rows = sqlx::query("SELECT data FROM tourney_result WHERE step_name = ?1 ORDER BY rowid")
            .bind(step_name)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| serde_json::from_str(row.get::<&str, _>("data")).ok())
            .collect())
    }

    pub async fn get_events_for_step(&self, step_id: Uuid) -> TraceResult<Vec<Value>> {
        let rows = sqlx::query("SELECT data FROM event WHERE step_id = ?1 ORDER BY rowid")
            .bind(step_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| serde_json::from_str(row.get::<&str, _>("data")).ok())
            .collect())
    }

    pub async fn get_trace_list(&self) -> TraceResult<Vec<Value>> {
        let rows = sqlx::query("SELECT data FROM trace_info ORDER BY rowid DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| serde_json::from_str(row.get::<&str, _>("data")).ok())
            .collect())
    }
}

#[async_trait]
impl TraceSink for SqliteTraceSink {
    async fn record_step(&self, step: StepTraceData) {
        let Ok(data) = serde_json::to_string(&step) else {
            tracing::error!("failed to serialize step record");
            return;
        };
        let result = sqlx::query(
            "INSERT OR REPLACE INTO step_record (step_id, trace_id, step_name, data) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(step.step_id.to_string())
        .bind(step.trace_id.to_string())
        .bind(&step.step_name)
        .bind(&data)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "failed to persist step record");
        }
    }

    async fn record_event(&self, event: LogEvent) {
        let (event_id, trace_id, step_id) = match &event {
            LogEvent::Message { event_id, trace_id, step_id, .. }
            | LogEvent::Exception { event_id, trace_id, step_id, .. }
            | LogEvent::PromptTemplate { event_id, trace_id, step_id, .. }
            | LogEvent::PromptResponse { event_id, trace_id, step_id, .. } => (*event_id, *trace_id, *step_id),
        };
        let Ok(data) = serde_json::to_string(&event) else {
            tracing::error!("failed to serialize event");
            return;
        };
        let result = sqlx::query(
            "INSERT OR REPLACE INTO event (event_id, trace_id, step_id, data) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event_id.to_string())
        .bind(trace_id.to_string())
        .bind(step_id.to_string())
        .bind(&data)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "failed to persist event");
        }
    }

    async fn record_tourney_result(&self, result: TourneyResult) {
        let Ok(data) = serde_json::to_string(&result) else {
            tracing::error!("failed to serialize tourney result");
            return;
        };
        let outcome = sqlx::query(
            "INSERT OR REPLACE INTO tourney_result (tourney_result_id, trace_id, step_name, data) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(result.tourney_result_id.to_string())
        .bind(result.trace_id.to_string())
        .bind(&result.step_name)
        .bind(&data)
        .execute(&self.pool)
        .await;
        if let Err(err) = outcome {
            tracing::error!(error = %err, "failed to persist tourney result");
        }
    }

    async fn flush_trace(&self, trace_info: TraceInfo) {
        let Ok(data) = serde_json::to_string(&trace_info) else {
            tracing::error!("failed to serialize trace info");
            return;
        };
        let result = sqlx::query("INSERT OR REPLACE INTO trace_info (trace_id, data) VALUES (?1, ?2)")
            .bind(trace_info.trace_id.to_string())
            .bind(&data)
            .execute(&self.pool)
            .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "failed to persist trace info");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmonpy_core::model::{OutputFormat, StepType};
    use serde_json::json;

    fn sample_step(trace_id: Uuid, step_name: &str) -> StepTraceData {
        StepTraceData {
            trace_id,
            trace_group_id: None,
            variation_of_trace_id: None,
            step_id: Uuid::new_v4(),
            step_index: 0,
            step_name: step_name.to_string(),
            step_type: StepType::Prompt,
            root_step_id: Uuid::new_v4(),
            parent_step_id: None,
            model_info: None,
            input_dict: json!({}),
            start_time: chrono::Utc::now(),
            end_time: Some(chrono::Utc::now()),
            output_dict: Some(json!({"n": 4})),
            output_format: OutputFormat::Json,
            status_code: 200,
            error_list: Vec::new(),
            cost: 0.01,
        }
    }

    #[tokio::test]
    async fn get_complete_trace_assembles_steps_and_trace_info_for_one_trace_id() {
        let sink = SqliteTraceSink::connect_in_memory().await.unwrap();
        let trace_id = Uuid::new_v4();

        sink.record_step(sample_step(trace_id, "root::Sum")).await;
        sink.record_step(sample_step(Uuid::new_v4(), "other::Sum")).await;
        sink.flush_trace(TraceInfo {
            trace_id,
            trace_group_id: None,
            variation_of_trace_id: None,
            title: "root".to_string(),
            start_time: chrono::Utc::now(),
            end_time: chrono::Utc::now(),
            status_code: 200,
            cost: 0.01,
        })
        .await;

        let complete = sink.get_complete_trace(trace_id).await.unwrap();
        assert_eq!(complete.step_list.len(), 1);
        assert!(complete.trace_info.is_some());
    }

    #[tokio::test]
    async fn tourney_step_name_list_is_distinct_and_sorted() {
        let sink = SqliteTraceSink::connect_in_memory().await.unwrap();
        let trace_id = Uuid::new_v4();

        for step_name in ["b::Rank", "a::Rank", "b::Rank"] {
            let result = TourneyResult::new(Uuid::new_v4(), trace_id, step_name.to_string(), json!({}), 3);
            sink.record_tourney_result(result).await;
        }

        let names = sink.get_tourney_step_name_list().await.unwrap();
        assert_eq!(names, vec!["a::Rank".to_string(), "b::Rank".to_string()]);
    }

    #[tokio::test]
    async fn tourney_results_for_step_name_only_returns_matching_rows() {
        let sink = SqliteTraceSink::connect_in_memory().await.unwrap();
        let trace_id = Uuid::new_v4();

        sink.record_tourney_result(TourneyResult::new(Uuid::new_v4(), trace_id, "wanted::Rank".to_string(), json!({}), 3))
            .await;
        sink.record_tourney_result(TourneyResult::new(Uuid::new_v4(), trace_id, "other::Rank".to_string(), json!({}), 3))
            .await;

        let results = sink.get_tourney_results_for_step_name("wanted::Rank").await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
