//! The step runtime: `run_step`, `run_parallel`, and the `Step` capability trait
//! every step implementation (prompt, generator, comparator, ranker, tournament,
//! cycle, GAR, user pipelines) satisfies.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::StepResult;
use crate::model::{ModelInfo, OutputFormat, StepType};
use crate::recorder::{Recorder, STEP_STATUS_FAILURE, STEP_STATUS_SUCCESS};

/// The capability set every polymorphic step variant implements:
/// name, type, input-dict assembly against an optional parent, and execution.
#[async_trait]
pub trait Step: Send + Sync {
    fn step_name(&self) -> String;

    fn step_type(&self) -> StepType;

    fn model_info(&self) -> Option<ModelInfo> {
        None
    }

    fn output_format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    /// Builds this step's input dict, consulting `parent` (when present) for
    /// an inherited example list under this step's own name.
    fn input_dict(&self, parent: Option<&Recorder>) -> Value;

    async fn execute(&self, ctx: &AppContext, recorder: &Recorder) -> StepResult<Value>;
}

/// Runs `step` as the root of a new trace: creates a root recorder, runs the
/// step body synchronously on the caller, and returns the output or rethrows
/// the step's terminal failure after recording it.
pub async fn run_step(
    ctx: &AppContext,
    step: Arc<dyn Step>,
    trace_id: Uuid,
    trace_group_id: Option<String>,
    variation_of_trace_id: Option<Uuid>,
) -> StepResult<(Value, Recorder)> {
    let input_dict = step.input_dict(None);
    let recorder = Recorder::new_root(
        trace_id,
        trace_group_id,
        variation_of_trace_id,
        step.step_name(),
        step.step_type(),
        step.model_info(),
        input_dict,
        ctx.trace_sink.clone(),
    );
    match step.execute(ctx, &recorder).await {
        Ok(output) => {
            recorder
                .finish_child_step(Some(output.clone()), step.output_format(), STEP_STATUS_SUCCESS, None)
                .await?;
            Ok((output, recorder))
        }
        Err(err) => {
            recorder.record_exception(err.to_string());
            let _ = recorder.finish_child_step(None, step.output_format(), STEP_STATUS_FAILURE, None).await;
            Err(err)
        }
    }
}

/// One child step that ran to completion (not failure) under `run_parallel`.
pub struct CompletedStep {
    pub recorder: Recorder,
    pub output: Value,
}

/// Submits each child to the shared step pool, awaits all, and returns
/// completions in *completion order* (not submission order). A per-child
/// failure is recorded on that child's own recorder but does not abort
/// siblings; failed children are simply absent from the returned list.
pub async fn run_parallel(ctx: &AppContext, parent: &Recorder, steps: Vec<Arc<dyn Step>>) -> Vec<CompletedStep> {
    run_parallel_with_callback(ctx, parent, steps, |_: &CompletedStep| {}).await
}

/// Like [`run_parallel`] but invokes `on_each` once per success, on the
/// completion task, as soon as that child finishes (not after the whole batch).
pub async fn run_parallel_with_callback<F>(
    ctx: &AppContext,
    parent: &Recorder,
    steps: Vec<Arc<dyn Step>>,
    on_each: F,
) -> Vec<CompletedStep>
where
    F: Fn(&CompletedStep) + Send + Sync + 'static,
{
    let on_each = Arc::new(on_each);
    let mut handles = FuturesUnordered::new();

    for step in steps {
        let input_dict = step.input_dict(Some(parent));
        let recorder = parent.create_child(step.step_name(), step.step_type(), step.model_info(), input_dict);
        let ctx = ctx.clone();
        let pool = ctx.step_pool.clone();
        let on_each = on_each.clone();

        handles.push(tokio::spawn(async move {
            let _permit = pool.acquire_owned().await.expect("step pool semaphore closed");
            match step.execute(&ctx, &recorder).await {
                Ok(output) => {
                    let _ = recorder
                        .finish_child_step(Some(output.clone()), step.output_format(), STEP_STATUS_SUCCESS, None)
                        .await;
                    let completed = CompletedStep { recorder, output };
                    on_each(&completed);
                    Some(completed)
                }
                Err(err) => {
                    recorder.record_exception(err.to_string());
                    let _ = recorder.finish_child_step(None, step.output_format(), STEP_STATUS_FAILURE, None).await;
                    None
                }
            }
        }));
    }

    let mut results = Vec::new();
    while let Some(joined) = handles.next().await {
        if let Ok(Some(completed)) = joined {
            results.push(completed);
        }
    }
    results
}

/// Runs a composite step body (`Generator`/`Comparator`/`Ranker`/`Tournament`/
/// `Cycle`/GAR) as a child of `parent`: creates its own recorder, runs `body`
/// against it, and finalizes exactly once, the same lifecycle `run_parallel`
/// gives a single `Step` — but returning a typed in-process result rather than
/// a `Value`, since these compose with each other directly (a `Tournament`
/// consumes the `Vec<JudgedOutput>` a `Generator` produced, not its JSON form).
pub async fn run_composite<F, Fut, T>(
    parent: &Recorder,
    step_name: String,
    step_type: StepType,
    input_dict: Value,
    body: F,
) -> StepResult<(T, Recorder)>
where
    F: FnOnce(Recorder) -> Fut,
    Fut: std::future::Future<Output = StepResult<(T, Value)>>,
{
    let recorder = parent.create_child(step_name, step_type, None, input_dict);
    match body(recorder.clone()).await {
        Ok((typed, value)) => {
            recorder
                .finish_child_step(Some(value), OutputFormat::Json, STEP_STATUS_SUCCESS, None)
                .await?;
            Ok((typed, recorder))
        }
        Err(err) => {
            recorder.record_exception(err.to_string());
            let _ = recorder.finish_child_step(None, OutputFormat::Json, STEP_STATUS_FAILURE, None).await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::NullTraceSink;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        name: String,
        fail: bool,
        delay_ms: u64,
    }

    #[async_trait]
    impl Step for Echo {
        fn step_name(&self) -> String {
            self.name.clone()
        }
        fn step_type(&self) -> StepType {
            StepType::Prompt
        }
        fn input_dict(&self, _parent: Option<&Recorder>) -> Value {
            json!({})
        }
        async fn execute(&self, _ctx: &AppContext, _recorder: &Recorder) -> StepResult<Value> {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            if self.fail {
                Err(crate::error::StepError::Other("boom".to_string()))
            } else {
                Ok(json!({ "name": self.name }))
            }
        }
    }

    #[tokio::test]
    async fn run_step_returns_output_and_success_recorder() {
        let ctx = AppContext::for_tests();
        let step = Arc::new(Echo { name: "a".into(), fail: false, delay_ms: 0 });
        let (output, recorder) = run_step(&ctx, step, Uuid::new_v4(), None, None).await.unwrap();
        assert_eq!(output["name"], "a");
        assert!(recorder.is_root());
    }

    #[tokio::test]
    async fn run_step_propagates_failure_after_recording() {
        let ctx = AppContext::for_tests();
        let step = Arc::new(Echo { name: "a".into(), fail: true, delay_ms: 0 });
        let result = run_step(&ctx, step, Uuid::new_v4(), None, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_parallel_skips_failed_children_without_aborting_siblings() {
        let ctx = AppContext::for_tests();
        let root = Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), StepType::Pipeline, None, json!({}), Arc::new(NullTraceSink));
        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(Echo { name: "a".into(), fail: false, delay_ms: 5 }),
            Arc::new(Echo { name: "b".into(), fail: true, delay_ms: 0 }),
            Arc::new(Echo { name: "c".into(), fail: false, delay_ms: 0 }),
        ];
        let completed = run_parallel(&ctx, &root, steps).await;
        assert_eq!(completed.len(), 2);
    }

    #[tokio::test]
    async fn run_parallel_returns_completion_order_not_submission_order() {
        let ctx = AppContext::for_tests();
        let root = Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), StepType::Pipeline, None, json!({}), Arc::new(NullTraceSink));
        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(Echo { name: "slow".into(), fail: false, delay_ms: 30 }),
            Arc::new(Echo { name: "fast".into(), fail: false, delay_ms: 0 }),
        ];
        let completed = run_parallel(&ctx, &root, steps).await;
        assert_eq!(completed[0].output["name"], "fast");
    }

    #[tokio::test]
    async fn on_each_callback_fires_once_per_success() {
        let ctx = AppContext::for_tests();
        let root = Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), StepType::Pipeline, None, json!({}), Arc::new(NullTraceSink));
        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(Echo { name: "a".into(), fail: false, delay_ms: 0 }),
            Arc::new(Echo { name: "b".into(), fail: true, delay_ms: 0 }),
        ];
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        run_parallel_with_callback(&ctx, &root, steps, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
