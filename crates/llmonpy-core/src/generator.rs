//! `Generator`: fans a [`PromptTemplate`] out across a model list via
//! [`run_parallel`], then deduplicates the survivors by serialized output
//! (`JudgedOutput::dedup_key`), keeping the first copy of each distinct answer.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::context::AppContext;
use crate::error::{StepError, StepResult};
use crate::model::{JudgedOutput, ModelInfo, StepType};
use crate::prompt::{PromptStep, PromptTemplate};
use crate::recorder::Recorder;
use crate::runtime::{run_composite, run_parallel, Step};

/// Runs one model per entry in `model_list` against `template`, in parallel,
/// and returns the surviving distinct outputs wrapped as [`JudgedOutput`]s
/// with a fresh `victory_count` of zero.
pub async fn run_generator(
    ctx: &AppContext,
    parent: &Recorder,
    template: Arc<PromptTemplate>,
    model_list: &[ModelInfo],
) -> StepResult<(Vec<JudgedOutput>, Recorder)> {
    let step_name = format!("{}:Generator", template.name);
    let input_dict = json!({
        "prompt_template": template.name,
        "model_list": model_list,
    });
    let model_list = model_list.to_vec();

    run_composite(parent, step_name, StepType::Generator, input_dict, |recorder| async move {
        let mut children: Vec<Arc<dyn Step>> = Vec::with_capacity(model_list.len());
        for model_info in &model_list {
            let client = ctx.clients.get(&model_info.model_name).ok_or_else(|| {
                StepError::Other(format!("no client registered for model {}", model_info.model_name))
            })?;
            children.push(Arc::new(PromptStep::new(template.clone(), model_info.clone(), client)));
        }

        let completed = run_parallel(ctx, &recorder, children).await;

        let mut seen = HashSet::new();
        let mut survivors = Vec::with_capacity(completed.len());
        for completed_step in completed {
            let candidate = JudgedOutput::new(
                completed_step.recorder.step_id(),
                completed_step.recorder.model_info(),
                completed_step.output,
            );
            if seen.insert(candidate.dedup_key()) {
                survivors.push(candidate);
            }
        }

        let value = json!({ "output_list": survivors.iter().map(JudgedOutput::to_dict).collect::<Vec<_>>() });
        Ok((survivors, value))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::NullTraceSink;
    use async_trait::async_trait;
    use llmonpy_providers::{ClientError, LlmClient, PromptRequest, PromptResponse};
    use uuid::Uuid;

    struct FixedClient {
        name: String,
        text: String,
    }

    #[async_trait]
    impl LlmClient for FixedClient {
        fn name(&self) -> &str {
            &self.name
        }
        async fn prompt(&self, _request: PromptRequest) -> Result<PromptResponse, ClientError> {
            Ok(PromptResponse {
                text: self.text.clone(),
                dict: Some(serde_json::from_str(&self.text).unwrap()),
                input_cost: 0.0,
                output_cost: 0.0,
            })
        }
        async fn is_blocked(&self) -> bool {
            false
        }
    }

    fn ctx_with(models: &[(&str, &str)]) -> AppContext {
        let registry = crate::context::ClientRegistry::new();
        for (name, text) in models {
            registry.insert(*name, Arc::new(FixedClient { name: name.to_string(), text: text.to_string() }));
        }
        AppContext::new(registry, Arc::new(NullTraceSink))
    }

    fn root() -> Recorder {
        Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), StepType::Pipeline, None, json!({}), Arc::new(NullTraceSink))
    }

    #[tokio::test]
    async fn deduplicates_identical_outputs_across_models() {
        let ctx = ctx_with(&[("a", "{\"n\":1}"), ("b", "{\"n\":1}"), ("c", "{\"n\":2}")]);
        let template = Arc::new(PromptTemplate::new("t::Sum", "2+2"));
        let model_list = vec![ModelInfo::new("a", 0.0), ModelInfo::new("b", 0.0), ModelInfo::new("c", 0.0)];

        let (survivors, _recorder) = run_generator(&ctx, &root(), template, &model_list).await.unwrap();

        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors.iter().filter(|o| o.victory_count == 0).count(), 2);
    }

    #[tokio::test]
    async fn missing_client_fails_the_generator() {
        let ctx = ctx_with(&[("a", "{\"n\":1}")]);
        let template = Arc::new(PromptTemplate::new("t::Sum", "2+2"));
        let model_list = vec![ModelInfo::new("missing", 0.0)];

        let result = run_generator(&ctx, &root(), template, &model_list).await;
        assert!(result.is_err());
    }
}
