//! Wires the JSONL and SQLite halves of the trace store together behind one
//! [`TraceSink`] so `AppContext::trace_sink` only ever holds a single handle,
//! keeping both persistence forms in sync.

use std::path::Path;

use async_trait::async_trait;

use llmonpy_core::recorder::{LogEvent, StepTraceData, TourneyResult, TraceInfo, TraceSink};

use crate::error::TraceResult;
use crate::file::FileTraceSink;
use crate::sqlite::SqliteTraceSink;

/// A data directory layout of `steps.jsonl` / `events.jsonl` /
/// `tourney_results.jsonl` / `trace_info.jsonl` plus `trace.sqlite3`,
/// matching the directory `llmonpy_cli.py`'s `--data-dir` points at.
pub struct DataDirTraceSink {
    file: FileTraceSink,
    sqlite: SqliteTraceSink,
}

impl DataDirTraceSink {
    pub async fn open(data_dir: impl AsRef<Path>) -> TraceResult<Self> {
        let data_dir = data_dir.as_ref();
        let file = FileTraceSink::new(data_dir)?;
        let sqlite = SqliteTraceSink::connect(data_dir.join("trace.sqlite3")).await?;
        Ok(Self { file, sqlite })
    }

    pub fn sqlite(&self) -> &SqliteTraceSink {
        &self.sqlite
    }
}

#[async_trait]
impl TraceSink for DataDirTraceSink {
    async fn record_step(&self, step: StepTraceData) {
        let sqlite_copy = step.clone();
        tokio::join!(self.file.record_step(step), self.sqlite.record_step(sqlite_copy));
    }

    async fn record_event(&self, event: LogEvent) {
        let sqlite_copy = event.clone();
        tokio::join!(self.file.record_event(event), self.sqlite.record_event(sqlite_copy));
    }

    async fn record_tourney_result(&self, result: TourneyResult) {
        let sqlite_copy = result.clone();
        tokio::join!(self.file.record_tourney_result(result), self.sqlite.record_tourney_result(sqlite_copy));
    }

    async fn flush_trace(&self, trace_info: TraceInfo) {
        let sqlite_copy = trace_info.clone();
        tokio::join!(self.file.flush_trace(trace_info), self.sqlite.flush_trace(sqlite_copy));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmonpy_core::model::{OutputFormat, StepType};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn a_recorded_step_lands_in_both_the_jsonl_file_and_the_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DataDirTraceSink::open(dir.path()).await.unwrap();

        let trace_id = Uuid::new_v4();
        sink.record_step(StepTraceData {
            trace_id,
            trace_group_id: None,
            variation_of_trace_id: None,
            step_id: Uuid::new_v4(),
            step_index: 0,
            step_name: "root::Sum".to_string(),
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
        })
        .await;

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

        let steps_jsonl = std::fs::read_to_string(dir.path().join("steps.jsonl")).unwrap();
        assert_eq!(steps_jsonl.lines().count(), 1);

        let complete = sink.sqlite().get_complete_trace(trace_id).await.unwrap();
        assert_eq!(complete.step_list.len(), 1);
    }
}
