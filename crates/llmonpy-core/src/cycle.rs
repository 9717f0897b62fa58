//! Adaptive ICL Cycle: seed an example list from a first-round tournament,
//! then repeatedly refine it — publishing the current best examples
//! worst-to-best, running another tournament, merging the new contenders back
//! in against the retained examples, and re-ranking — stopping early the
//! moment the champion stops changing.

use std::sync::Arc;

use serde_json::json;

use crate::context::AppContext;
use crate::error::StepResult;
use crate::model::{JudgedOutput, ModelInfo, StepType};
use crate::prompt::PromptTemplate;
use crate::ranker::run_ranker;
use crate::recorder::Recorder;
use crate::runtime::run_composite;
use crate::tournament::run_tournament;

pub struct CycleConfig {
    pub generation_template: Arc<PromptTemplate>,
    pub first_round_models: Vec<ModelInfo>,
    pub refinement_models: Vec<ModelInfo>,
    pub judge_template: Arc<PromptTemplate>,
    pub judge_models: Vec<ModelInfo>,
    /// Total number of tournament rounds, including the first; the refinement
    /// loop runs `max_cycles - 1` additional rounds.
    pub max_cycles: u32,
    /// Size of the example list carried between rounds.
    pub number_of_examples: usize,
}

fn publish_examples_worst_to_best(recorder: &Recorder, step_name: &str, example_list: &[JudgedOutput]) {
    let examples = example_list.iter().rev().map(|e| e.step_output.clone()).collect();
    recorder.set_step_examples(step_name.to_string(), examples);
}

pub async fn run_cycle(ctx: &AppContext, parent: &Recorder, config: CycleConfig) -> StepResult<(Vec<JudgedOutput>, Recorder)> {
    let step_name = format!("{}:Cycle", config.generation_template.name);
    let input_dict = json!({
        "generation_prompt": config.generation_template.name,
        "first_round_models": config.first_round_models,
        "refinement_models": config.refinement_models,
        "max_cycles": config.max_cycles,
        "number_of_examples": config.number_of_examples,
    });

    run_composite(parent, step_name, StepType::Cycle, input_dict, |recorder| async move {
        let CycleConfig {
            generation_template,
            first_round_models,
            refinement_models,
            judge_template,
            judge_models,
            max_cycles,
            number_of_examples,
        } = config;

        let (first_round, _) = run_tournament(
            ctx,
            &recorder,
            generation_template.clone(),
            first_round_models,
            judge_template.clone(),
            judge_models.clone(),
        )
        .await?;
        let mut example_list: Vec<JudgedOutput> = first_round.into_iter().take(number_of_examples).collect();

        for round in 1..max_cycles {
            let current_champion = example_list.first().map(|c| c.output_id);
            publish_examples_worst_to_best(&recorder, &generation_template.name, &example_list);

            let (refined, _) = run_tournament(
                ctx,
                &recorder,
                generation_template.clone(),
                refinement_models.clone(),
                judge_template.clone(),
                judge_models.clone(),
            )
            .await?;

            let mut merged: Vec<JudgedOutput> = refined.into_iter().take(number_of_examples).collect();
            merged.extend(example_list.into_iter());
            for candidate in merged.iter_mut() {
                candidate.reset_victory_count();
            }

            let (ordered, _) =
                run_ranker(ctx, &recorder, generation_template.name.clone(), merged, judge_template.clone(), judge_models.clone())
                    .await?;
            example_list = ordered.into_iter().take(number_of_examples).collect();

            let new_champion = example_list.first().map(|c| c.output_id);
            if new_champion == current_champion {
                recorder.log_message(format!("cycle done after round {round}"));
                break;
            }
        }

        let value = json!({ "ordered_response_list": example_list.iter().map(JudgedOutput::to_dict).collect::<Vec<_>>() });
        Ok((example_list, value))
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
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct StableGenerator {
        answer: serde_json::Value,
    }

    #[async_trait]
    impl LlmClient for StableGenerator {
        fn name(&self) -> &str {
            "generator"
        }
        async fn prompt(&self, _request: PromptRequest) -> Result<PromptResponse, ClientError> {
            Ok(PromptResponse { text: self.answer.to_string(), dict: Some(self.answer.clone()), input_cost: 0.0, output_cost: 0.0 })
        }
        async fn is_blocked(&self) -> bool {
            false
        }
    }

    struct AlwaysFirstJudge;

    #[async_trait]
    impl LlmClient for AlwaysFirstJudge {
        fn name(&self) -> &str {
            "judge"
        }
        async fn prompt(&self, _request: PromptRequest) -> Result<PromptResponse, ClientError> {
            let response = json!({"winner": 1});
            Ok(PromptResponse { text: response.to_string(), dict: Some(response), input_cost: 0.0, output_cost: 0.0 })
        }
        async fn is_blocked(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn stops_early_once_the_champion_stops_changing() {
        let registry = ClientRegistry::new();
        registry.insert("gen", Arc::new(StableGenerator { answer: json!({"n": 1}) }));
        registry.insert("judge", Arc::new(AlwaysFirstJudge));
        let ctx = AppContext::new(registry, Arc::new(NullTraceSink));

        let generation_template = Arc::new(PromptTemplate::new("t::Sum", "2+2"));
        let judge_template = Arc::new(PromptTemplate::new("t::Sum:Judge", "who wins?"));
        let root = Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), StepType::Pipeline, None, json!({}), Arc::new(NullTraceSink));

        let config = CycleConfig {
            generation_template,
            first_round_models: vec![ModelInfo::new("gen", 0.0)],
            refinement_models: vec![ModelInfo::new("gen", 0.0)],
            judge_template,
            judge_models: vec![ModelInfo::new("judge", 0.0)],
            max_cycles: 5,
            number_of_examples: 1,
        };

        let (example_list, _recorder) = run_cycle(&ctx, &root, config).await.unwrap();
        assert_eq!(example_list.len(), 1);
    }

    #[tokio::test]
    async fn worst_to_best_publishing_reverses_victory_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        struct RecordingGenerator {
            log: Arc<std::sync::Mutex<Vec<String>>>,
            calls: AtomicU32,
        }
        #[async_trait]
        impl LlmClient for RecordingGenerator {
            fn name(&self) -> &str {
                "recording"
            }
            async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, ClientError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.log.lock().unwrap().push(request.text.clone());
                let response = json!({"n": 1});
                Ok(PromptResponse { text: response.to_string(), dict: Some(response), input_cost: 0.0, output_cost: 0.0 })
            }
            async fn is_blocked(&self) -> bool {
                false
            }
        }

        let registry = ClientRegistry::new();
        registry.insert("gen", Arc::new(RecordingGenerator { log: log.clone(), calls: AtomicU32::new(0) }));
        registry.insert("judge", Arc::new(AlwaysFirstJudge));
        let ctx = AppContext::new(registry, Arc::new(NullTraceSink));

        let generation_template = Arc::new(PromptTemplate::new("t::Sum", "{{#each example_list}}[{{this}}]{{/each}}"));
        let judge_template = Arc::new(PromptTemplate::new("t::Sum:Judge", "who wins?"));
        let root = Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), StepType::Pipeline, None, json!({}), Arc::new(NullTraceSink));

        let config = CycleConfig {
            generation_template,
            first_round_models: vec![ModelInfo::new("gen", 0.0)],
            refinement_models: vec![ModelInfo::new("gen", 0.0)],
            judge_template,
            judge_models: vec![ModelInfo::new("judge", 0.0)],
            max_cycles: 2,
            number_of_examples: 1,
        };

        let (_example_list, _recorder) = run_cycle(&ctx, &root, config).await.unwrap();
        // At least the refinement round's generator call should have rendered
        // with a non-empty example list (the first round has none yet).
        assert!(log.lock().unwrap().iter().any(|t| t.contains('[')));
    }
}
