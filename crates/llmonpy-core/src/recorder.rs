//! Per-step recorder tree: trace bookkeeping, example inheritance, cost roll-up,
//! and the append-only records a [`TraceSink`] persists.
//!
//! The recorder graph is a tree. A child holds a (non-owning, in the sense that it
//! never points back) [`Recorder`] handle to its parent purely to look up inherited
//! examples and roll up cost; nothing here forms a reference cycle, so plain `Arc`
//! sharing is sufficient without resorting to `Weak`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{StepError, StepResult};
use crate::model::{ModelInfo, OutputFormat, StepType};

pub const STEP_STATUS_NO_STATUS: u16 = 0;
pub const STEP_STATUS_SUCCESS: u16 = 200;
pub const STEP_STATUS_FAILURE: u16 = 500;

/// One append-only step record, emitted exactly once per `stepId` when its
/// recorder finalizes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepTraceData {
    pub trace_id: Uuid,
    pub trace_group_id: Option<String>,
    pub variation_of_trace_id: Option<Uuid>,
    pub step_id: Uuid,
    pub step_index: u64,
    pub step_name: String,
    pub step_type: StepType,
    pub root_step_id: Uuid,
    pub parent_step_id: Option<Uuid>,
    pub model_info: Option<ModelInfo>,
    pub input_dict: Value,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub output_dict: Option<Value>,
    pub output_format: OutputFormat,
    pub status_code: u16,
    pub error_list: Vec<String>,
    pub cost: f64,
}

/// Closes a trace when its root recorder finalizes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TraceInfo {
    pub trace_id: Uuid,
    pub trace_group_id: Option<String>,
    pub variation_of_trace_id: Option<Uuid>,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status_code: u16,
    pub cost: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum LogEvent {
    Message { event_id: Uuid, trace_id: Uuid, step_id: Uuid, event_time: DateTime<Utc>, message: String },
    Exception { event_id: Uuid, trace_id: Uuid, step_id: Uuid, event_time: DateTime<Utc>, exception_message: String },
    PromptTemplate { event_id: Uuid, trace_id: Uuid, step_id: Uuid, event_time: DateTime<Utc>, prompt_template: String },
    PromptResponse {
        event_id: Uuid,
        trace_id: Uuid,
        step_id: Uuid,
        event_time: DateTime<Utc>,
        prompt_text: String,
        response_text: String,
    },
}

/// One pairwise contest decided by a `Comparator` (see `crate::comparator`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContestResult {
    pub contestant_one_output_id: Uuid,
    pub contestant_two_output_id: Uuid,
    pub winner_output_id: Uuid,
    pub dissenting_judges: u32,
}

/// The persisted record of one ranking operation: every pairwise contest plus
/// the final ordered contestant list, keyed by a freshly assigned id at creation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TourneyResult {
    pub tourney_result_id: Uuid,
    pub step_id: Uuid,
    pub trace_id: Uuid,
    pub step_name: String,
    pub start_time: DateTime<Utc>,
    pub input_data: Value,
    pub number_of_judges: usize,
    pub contestant_list: Vec<Value>,
    pub contest_result_list: Vec<ContestResult>,
}

impl TourneyResult {
    pub fn new(step_id: Uuid, trace_id: Uuid, step_name: String, input_data: Value, number_of_judges: usize) -> Self {
        Self {
            tourney_result_id: Uuid::new_v4(),
            step_id,
            trace_id,
            step_name,
            start_time: Utc::now(),
            input_data,
            number_of_judges,
            contestant_list: Vec::new(),
            contest_result_list: Vec::new(),
        }
    }

    pub fn add_contest_result(&mut self, result: ContestResult) {
        self.contest_result_list.push(result);
    }
}

/// The step/event/tourney/trace-info append contract the trace service writes
/// through. Implementations batch and flush however they like; every call here
/// must return promptly (callers await it under the recorder's control flow).
#[async_trait::async_trait]
pub trait TraceSink: Send + Sync {
    async fn record_step(&self, step: StepTraceData);
    async fn record_event(&self, event: LogEvent);
    async fn record_tourney_result(&self, result: TourneyResult);
    async fn flush_trace(&self, trace_info: TraceInfo);
}

/// A sink that drops everything. Useful for tests and for callers who don't
/// need trace persistence.
pub struct NullTraceSink;

#[async_trait::async_trait]
impl TraceSink for NullTraceSink {
    async fn record_step(&self, _step: StepTraceData) {}
    async fn record_event(&self, _event: LogEvent) {}
    async fn record_tourney_result(&self, _result: TourneyResult) {}
    async fn flush_trace(&self, _trace_info: TraceInfo) {}
}

struct RecorderState {
    trace_data: StepTraceData,
    examples: HashMap<String, Vec<Value>>,
    finalized: bool,
}

struct RecorderInner {
    parent: Option<Recorder>,
    root: Option<Recorder>,
    sink: Arc<dyn TraceSink>,
    /// Only meaningful when this recorder is itself the root; allocates
    /// `step_index` for every descendant under a single lock.
    next_step_index: AtomicU64,
    is_root: AtomicBool,
    state: Mutex<RecorderState>,
}

/// Per-step bookkeeping handle. Cheap to clone (`Arc` internally); every step
/// execution gets its own recorder created by [`crate::runtime`] before the
/// step body runs.
#[derive(Clone)]
pub struct Recorder(Arc<RecorderInner>);

impl Recorder {
    /// Creates the root recorder of a new trace.
    pub fn new_root(
        trace_id: Uuid,
        trace_group_id: Option<String>,
        variation_of_trace_id: Option<Uuid>,
        step_name: String,
        step_type: StepType,
        model_info: Option<ModelInfo>,
        input_dict: Value,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        let step_id = Uuid::new_v4();
        let trace_data = StepTraceData {
            trace_id,
            trace_group_id,
            variation_of_trace_id,
            step_id,
            step_index: 0,
            step_name,
            step_type,
            root_step_id: step_id,
            parent_step_id: None,
            model_info,
            input_dict,
            start_time: Utc::now(),
            end_time: None,
            output_dict: None,
            output_format: OutputFormat::Json,
            status_code: STEP_STATUS_NO_STATUS,
            error_list: Vec::new(),
            cost: 0.0,
        };
        Recorder(Arc::new(RecorderInner {
            parent: None,
            root: None,
            sink,
            next_step_index: AtomicU64::new(0),
            is_root: AtomicBool::new(true),
            state: Mutex::new(RecorderState { trace_data, examples: HashMap::new(), finalized: false }),
        }))
    }

    /// Creates a child recorder, assigning it the next monotonic `step_index`
    /// from the root and inheriting trace/root identity from `self`.
    pub fn create_child(
        &self,
        step_name: String,
        step_type: StepType,
        model_info: Option<ModelInfo>,
        input_dict: Value,
    ) -> Recorder {
        let root = self.root_handle();
        let step_index = root.next_step_index();
        let (trace_id, trace_group_id, variation_of_trace_id, root_step_id) = {
            let state = self.0.state.lock();
            (
                state.trace_data.trace_id,
                state.trace_data.trace_group_id.clone(),
                state.trace_data.variation_of_trace_id,
                state.trace_data.root_step_id,
            )
        };
        let parent_step_id = self.step_id();
        let step_id = Uuid::new_v4();
        let trace_data = StepTraceData {
            trace_id,
            trace_group_id,
            variation_of_trace_id,
            step_id,
            step_index,
            step_name,
            step_type,
            root_step_id,
            parent_step_id: Some(parent_step_id),
            model_info,
            input_dict,
            start_time: Utc::now(),
            end_time: None,
            output_dict: None,
            output_format: OutputFormat::Json,
            status_code: STEP_STATUS_NO_STATUS,
            error_list: Vec::new(),
            cost: 0.0,
        };
        Recorder(Arc::new(RecorderInner {
            parent: Some(self.clone()),
            root: Some(root),
            sink: self.0.sink.clone(),
            next_step_index: AtomicU64::new(0),
            is_root: AtomicBool::new(false),
            state: Mutex::new(RecorderState { trace_data, examples: HashMap::new(), finalized: false }),
        }))
    }

    fn root_handle(&self) -> Recorder {
        self.0.root.clone().unwrap_or_else(|| self.clone())
    }

    /// Invariant 2: `step_index` is assigned under a single lock in the root,
    /// monotonically increasing for the whole trace.
    fn next_step_index(&self) -> u64 {
        debug_assert!(self.0.is_root.load(Ordering::Relaxed), "next_step_index must be called on the root");
        self.0.next_step_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn step_id(&self) -> Uuid {
        self.0.state.lock().trace_data.step_id
    }

    pub fn trace_id(&self) -> Uuid {
        self.0.state.lock().trace_data.trace_id
    }

    pub fn step_name(&self) -> String {
        self.0.state.lock().trace_data.step_name.clone()
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.0.state.lock().trace_data.model_info.clone()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_root.load(Ordering::Relaxed)
    }

    /// Invariant 4: a child inherits the parent's example map by lookup
    /// fallback, walking up to the root, never by copying the map.
    pub fn get_step_examples(&self, step_name: &str) -> Option<Vec<Value>> {
        if let Some(list) = self.0.state.lock().examples.get(step_name).cloned() {
            return Some(list);
        }
        self.0.parent.as_ref().and_then(|parent| parent.get_step_examples(step_name))
    }

    pub fn set_step_examples(&self, step_name: impl Into<String>, example_list: Vec<Value>) {
        self.0.state.lock().examples.insert(step_name.into(), example_list);
    }

    pub fn log_message(&self, message: impl Into<String>) {
        let (trace_id, step_id) = self.ids();
        let sink = self.0.sink.clone();
        let event = LogEvent::Message { event_id: Uuid::new_v4(), trace_id, step_id, event_time: Utc::now(), message: message.into() };
        tokio::spawn(async move { sink.record_event(event).await });
    }

    pub fn log_exception(&self, exception_message: impl Into<String>) {
        let (trace_id, step_id) = self.ids();
        let sink = self.0.sink.clone();
        let event = LogEvent::Exception {
            event_id: Uuid::new_v4(),
            trace_id,
            step_id,
            event_time: Utc::now(),
            exception_message: exception_message.into(),
        };
        tokio::spawn(async move { sink.record_event(event).await });
    }

    pub fn log_prompt_template(&self, prompt_template: impl Into<String>) {
        let (trace_id, step_id) = self.ids();
        let sink = self.0.sink.clone();
        let event = LogEvent::PromptTemplate {
            event_id: Uuid::new_v4(),
            trace_id,
            step_id,
            event_time: Utc::now(),
            prompt_template: prompt_template.into(),
        };
        tokio::spawn(async move { sink.record_event(event).await });
    }

    pub fn log_prompt_response(&self, prompt_text: impl Into<String>, response_text: impl Into<String>) {
        let (trace_id, step_id) = self.ids();
        let sink = self.0.sink.clone();
        let event = LogEvent::PromptResponse {
            event_id: Uuid::new_v4(),
            trace_id,
            step_id,
            event_time: Utc::now(),
            prompt_text: prompt_text.into(),
            response_text: response_text.into(),
        };
        tokio::spawn(async move { sink.record_event(event).await });
    }

    fn ids(&self) -> (Uuid, Uuid) {
        let state = self.0.state.lock();
        (state.trace_data.trace_id, state.trace_data.step_id)
    }

    /// Records an exception on this recorder's own step record (does not finalize).
    pub fn record_exception(&self, message: impl Into<String>) {
        let message = message.into();
        self.0.state.lock().trace_data.error_list.push(message.clone());
        self.log_exception(message);
    }

    /// Invariant 5: cost rolls up to every ancestor, recorded exactly once per
    /// step at finalization (not recursively re-triggered on re-entry).
    pub fn record_cost(&self, cost: f64) {
        if cost == 0.0 {
            return;
        }
        self.0.state.lock().trace_data.cost += cost;
        if let Some(parent) = &self.0.parent {
            parent.record_cost(cost);
        }
    }

    pub fn create_tourney_result(&self, step_name: String, number_of_judges: usize) -> TourneyResult {
        let state = self.0.state.lock();
        TourneyResult::new(state.trace_data.step_id, state.trace_data.trace_id, step_name, state.trace_data.input_dict.clone(), number_of_judges)
    }

    pub async fn record_tourney_result(&self, contestant_list: Vec<Value>, mut result: TourneyResult) {
        result.contestant_list = contestant_list;
        self.0.sink.record_tourney_result(result).await;
    }

    /// Invariant 3: finalizes exactly once. A second call is a programming
    /// error in the caller and is rejected rather than silently overwriting
    /// the already-emitted record.
    pub async fn finish_child_step(&self, output_dict: Option<Value>, output_format: OutputFormat, status_code: u16, cost: Option<f64>) -> StepResult<()> {
        if let Some(cost) = cost {
            self.record_cost(cost);
        }
        let (trace_data, is_root) = {
            let mut state = self.0.state.lock();
            if state.finalized {
                return Err(StepError::Other(format!("recorder for step {} already finalized", state.trace_data.step_id)));
            }
            state.finalized = true;
            state.trace_data.end_time = Some(Utc::now());
            state.trace_data.output_dict = output_dict;
            state.trace_data.output_format = output_format;
            state.trace_data.status_code = status_code;
            (state.trace_data.clone(), self.0.parent.is_none())
        };
        let end_time = trace_data.end_time.unwrap_or_else(Utc::now);
        self.0.sink.record_step(trace_data.clone()).await;
        if is_root {
            let trace_info = TraceInfo {
                trace_id: trace_data.trace_id,
                trace_group_id: trace_data.trace_group_id,
                variation_of_trace_id: trace_data.variation_of_trace_id,
                title: trace_data.step_name,
                start_time: trace_data.start_time,
                end_time,
                status_code: trace_data.status_code,
                cost: trace_data.cost,
            };
            self.0.sink.flush_trace(trace_info).await;
        }
        Ok(())
    }

    pub fn cost(&self) -> f64 {
        self.0.state.lock().trace_data.cost
    }

    pub fn step_index(&self) -> u64 {
        self.0.state.lock().trace_data.step_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn root(sink: Arc<dyn TraceSink>) -> Recorder {
        Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), StepType::Pipeline, None, Value::Null, sink)
    }

    #[tokio::test]
    async fn step_index_is_monotonic_across_children() {
        let r = root(Arc::new(NullTraceSink));
        let mut indices = Vec::new();
        for _ in 0..5 {
            let child = r.create_child("child".into(), StepType::Prompt, None, Value::Null);
            indices.push(child.step_index());
        }
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn finalize_twice_is_rejected() {
        let r = root(Arc::new(NullTraceSink));
        r.finish_child_step(None, OutputFormat::Json, STEP_STATUS_SUCCESS, None).await.unwrap();
        let second = r.finish_child_step(None, OutputFormat::Json, STEP_STATUS_SUCCESS, None).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn cost_rolls_up_to_every_ancestor() {
        let r = root(Arc::new(NullTraceSink));
        let child = r.create_child("c1".into(), StepType::Prompt, None, Value::Null);
        let grandchild = child.create_child("c2".into(), StepType::Prompt, None, Value::Null);
        grandchild.record_cost(1.5);
        grandchild.record_cost(0.5);
        assert_eq!(grandchild.cost(), 2.0);
        assert_eq!(child.cost(), 2.0);
        assert_eq!(r.cost(), 2.0);
    }

    #[tokio::test]
    async fn child_examples_fall_back_to_parent_without_mutating_it() {
        let r = root(Arc::new(NullTraceSink));
        r.set_step_examples("prompt::Foo", vec![Value::String("a".into())]);
        let child = r.create_child("child".into(), StepType::Prompt, None, Value::Null);
        assert_eq!(child.get_step_examples("prompt::Foo").unwrap().len(), 1);

        child.set_step_examples("prompt::Foo", vec![Value::String("a".into()), Value::String("b".into())]);
        assert_eq!(child.get_step_examples("prompt::Foo").unwrap().len(), 2);
        assert_eq!(r.get_step_examples("prompt::Foo").unwrap().len(), 1);
    }

    struct CountingSink(AtomicUsize);
    #[async_trait::async_trait]
    impl TraceSink for CountingSink {
        async fn record_step(&self, _step: StepTraceData) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        async fn record_event(&self, _event: LogEvent) {}
        async fn record_tourney_result(&self, _result: TourneyResult) {}
        async fn flush_trace(&self, _trace_info: TraceInfo) {}
    }

    #[tokio::test]
    async fn one_step_record_per_finalized_recorder() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let r = root(sink.clone());
        let child = r.create_child("c".into(), StepType::Prompt, None, Value::Null);
        child.finish_child_step(None, OutputFormat::Json, STEP_STATUS_SUCCESS, None).await.unwrap();
        r.finish_child_step(None, OutputFormat::Json, STEP_STATUS_SUCCESS, None).await.unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }
}
