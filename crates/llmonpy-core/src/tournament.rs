//! `Tournament`: a [`Generator`](crate::generator) followed by a
//! [`Ranker`](crate::ranker) over its survivors.

use std::sync::Arc;

use serde_json::json;

use crate::context::AppContext;
use crate::error::StepResult;
use crate::generator::run_generator;
use crate::model::{JudgedOutput, ModelInfo, StepType};
use crate::prompt::PromptTemplate;
use crate::ranker::run_ranker;
use crate::recorder::Recorder;
use crate::runtime::run_composite;

pub async fn run_tournament(
    ctx: &AppContext,
    parent: &Recorder,
    generation_template: Arc<PromptTemplate>,
    generation_models: Vec<ModelInfo>,
    judge_template: Arc<PromptTemplate>,
    judge_models: Vec<ModelInfo>,
) -> StepResult<(Vec<JudgedOutput>, Recorder)> {
    let step_name = format!("{}:Tournament", generation_template.name);
    let input_dict = json!({
        "generation_prompt": generation_template.name,
        "generation_models": generation_models,
        "judge_models": judge_models,
    });

    run_composite(parent, step_name, StepType::Tournament, input_dict, |recorder| async move {
        let (candidates, _generator_recorder) =
            run_generator(ctx, &recorder, generation_template.clone(), &generation_models).await?;
        let (ordered, _ranker_recorder) = run_ranker(
            ctx,
            &recorder,
            generation_template.name.clone(),
            candidates,
            judge_template.clone(),
            judge_models.clone(),
        )
        .await?;

        let value = json!({ "ordered_response_list": ordered.iter().map(JudgedOutput::to_dict).collect::<Vec<_>>() });
        Ok((ordered, value))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ClientRegistry;
    use crate::recorder::NullTraceSink;
    use async_trait::async_trait;
    use llmonpy_providers::{ClientError, LlmClient, PromptRequest, PromptResponse};
    use uuid::Uuid;

    struct ScriptedClient {
        name: String,
        response: serde_json::Value,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn name(&self) -> &str {
            &self.name
        }
        async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, ClientError> {
            let response = if request.text.contains("who wins") {
                json!({"winner": 1})
            } else {
                self.response.clone()
            };
            Ok(PromptResponse { text: response.to_string(), dict: Some(response), input_cost: 0.0, output_cost: 0.0 })
        }
        async fn is_blocked(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn tournament_generates_then_ranks() {
        let registry = ClientRegistry::new();
        registry.insert("gen-a", Arc::new(ScriptedClient { name: "gen-a".into(), response: json!({"n": 1}) }));
        registry.insert("gen-b", Arc::new(ScriptedClient { name: "gen-b".into(), response: json!({"n": 2}) }));
        registry.insert("judge", Arc::new(ScriptedClient { name: "judge".into(), response: json!({"winner": 1}) }));
        let ctx = AppContext::new(registry, Arc::new(NullTraceSink));

        let generation_template = Arc::new(PromptTemplate::new("t::Sum", "what is 2+2?"));
        let judge_template = Arc::new(PromptTemplate::new("t::Sum:Judge", "who wins, {{output_1}} vs {{output_2}}?"));
        let root = Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), StepType::Pipeline, None, json!({}), Arc::new(NullTraceSink));

        let (ordered, _recorder) = run_tournament(
            &ctx,
            &root,
            generation_template,
            vec![ModelInfo::new("gen-a", 0.0), ModelInfo::new("gen-b", 0.0)],
            judge_template,
            vec![ModelInfo::new("judge", 0.0)],
        )
        .await
        .unwrap();

        assert_eq!(ordered.len(), 2);
        assert!(ordered[0].victory_count >= ordered[1].victory_count);
    }
}
