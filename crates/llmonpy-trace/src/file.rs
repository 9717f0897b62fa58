//! JSONL append-only trace streams under a data directory.
//!
//! One growing file per stream, appended under a lock. No rotation policy is
//! implemented — carrying one here would be inventing scope no caller needs.
//!
//! Flush policy: non-terminal records (step records, events, tourney results)
//! are buffered and flushed once a second by a background task; a
//! `trace_info` record — emitted exactly once, when the root recorder
//! finalizes — forces an immediate flush of everything buffered for that
//! trace before it's written, so a trace's JSONL files are complete by the
//! time its `trace_info` line appears.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use llmonpy_core::recorder::{LogEvent, StepTraceData, TourneyResult, TraceInfo, TraceSink};

const STEPS_FILE: &str = "steps.jsonl";
const EVENTS_FILE: &str = "events.jsonl";
const TOURNEY_RESULTS_FILE: &str = "tourney_results.jsonl";
const TRACE_INFO_FILE: &str = "trace_info.jsonl";

fn append_line(path: &Path, line: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}").and_then(|_| file.flush()));
    if let Err(err) = result {
        tracing::error!(path = %path.display(), error = %err, "failed to append trace record");
    }
}

fn drain_to_file<T: Serialize>(path: &Path, buffer: &Mutex<Vec<T>>) {
    let records = std::mem::take(&mut *buffer.lock());
    for record in records {
        match serde_json::to_string(&record) {
            Ok(line) => append_line(path, &line),
            Err(err) => tracing::error!(error = %err, "failed to serialize trace record"),
        }
    }
}

struct Inner {
    dir: PathBuf,
    steps: Mutex<Vec<StepTraceData>>,
    events: Mutex<Vec<LogEvent>>,
    tourney_results: Mutex<Vec<TourneyResult>>,
}

impl Inner {
    fn flush_buffers(&self) {
        drain_to_file(&self.dir.join(STEPS_FILE), &self.steps);
        drain_to_file(&self.dir.join(EVENTS_FILE), &self.events);
        drain_to_file(&self.dir.join(TOURNEY_RESULTS_FILE), &self.tourney_results);
    }
}

/// The JSONL half of the trace store's persistence under a data directory.
/// Cheap to clone; every clone shares the same buffers and background flush
/// task.
#[derive(Clone)]
pub struct FileTraceSink(Arc<Inner>);

impl FileTraceSink {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let inner = Arc::new(Inner {
            dir,
            steps: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            tourney_results: Mutex::new(Vec::new()),
        });

        let background = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                background.flush_buffers();
            }
        });

        Ok(Self(inner))
    }
}

#[async_trait]
impl TraceSink for FileTraceSink {
    async fn record_step(&self, step: StepTraceData) {
        self.0.steps.lock().push(step);
    }

    async fn record_event(&self, event: LogEvent) {
        self.0.events.lock().push(event);
    }

    async fn record_tourney_result(&self, result: TourneyResult) {
        self.0.tourney_results.lock().push(result);
    }

    async fn flush_trace(&self, trace_info: TraceInfo) {
        self.0.flush_buffers();
        match serde_json::to_string(&trace_info) {
            Ok(line) => append_line(&self.0.dir.join(TRACE_INFO_FILE), &line),
            Err(err) => tracing::error!(error = %err, "failed to serialize trace info"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmonpy_core::model::{OutputFormat, StepType};
    use serde_json::json;
    use uuid::Uuid;

    fn sample_step() -> StepTraceData {
        StepTraceData {
            trace_id: Uuid::new_v4(),
            trace_group_id: None,
            variation_of_trace_id: None,
            step_id: Uuid::new_v4(),
            step_index: 0,
            step_name: "t::Sum".to_string(),
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
    async fn flush_trace_writes_buffered_steps_and_the_trace_info_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileTraceSink::new(dir.path()).unwrap();

        let step = sample_step();
        let trace_id = step.trace_id;
        sink.record_step(step).await;

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

        let steps_content = std::fs::read_to_string(dir.path().join(STEPS_FILE)).unwrap();
        assert_eq!(steps_content.lines().count(), 1);
        let trace_info_content = std::fs::read_to_string(dir.path().join(TRACE_INFO_FILE)).unwrap();
        assert_eq!(trace_info_content.lines().count(), 1);
    }

    #[tokio::test]
    async fn background_ticker_flushes_buffered_events_without_a_trace_info_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileTraceSink::new(dir.path()).unwrap();

        sink.record_event(LogEvent::Message {
            event_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            event_time: chrono::Utc::now(),
            message: "cycle done after round 1".to_string(),
        })
        .await;

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let events_content = std::fs::read_to_string(dir.path().join(EVENTS_FILE)).unwrap();
        assert_eq!(events_content.lines().count(), 1);
    }
}
