//! `Comparator`: a panel of judge models voting on two contestants. Majority
//! vote decides the winner; a tie falls through to the second contestant
//! (arbitrary — ties are rare enough in practice that breaking them
//! deterministically toward one side was never revisited).

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{StepError, StepResult};
use crate::model::{JudgedOutput, ModelInfo, StepType};
use crate::prompt::{PromptStep, PromptTemplate};
use crate::recorder::Recorder;
use crate::runtime::{run_composite, run_parallel, Step};

pub const WINNER_KEY: &str = "winner";

/// The decided outcome of one pairwise contest.
pub struct ComparatorResult {
    pub contestant_one_output_id: Uuid,
    pub contestant_two_output_id: Uuid,
    pub winner_output_id: Uuid,
    /// The loser's vote count — how many judges dissented from the majority.
    pub dissent_count: u32,
}

/// Runs every judge model in `judge_models` against `judge_template` with
/// `output_1`/`output_2` spliced in, then majority-votes on a winner.
///
/// `contestant_step_name` is the step name of the prompt that *produced* the
/// contestants (not the judge template's own name) — composite steps qualify
/// their recorded name from the step being judged, matching
/// `TournamentJudgePrompt.get_step_name`.
pub async fn run_comparator(
    ctx: &AppContext,
    parent: &Recorder,
    contestant_step_name: &str,
    judge_template: Arc<PromptTemplate>,
    judge_models: &[ModelInfo],
    output_1: &JudgedOutput,
    output_2: &JudgedOutput,
) -> StepResult<(ComparatorResult, Recorder)> {
    let judge_step_name = format!("{contestant_step_name}:Comparator:Judge");
    let named_template = Arc::new(PromptTemplate {
        name: judge_step_name,
        template_text: judge_template.template_text.clone(),
        system_prompt: judge_template.system_prompt.clone(),
        output_format: judge_template.output_format,
    });
    let extra_input = json!({ "output_1": output_1.step_output, "output_2": output_2.step_output });

    let step_name = format!("{contestant_step_name}:Comparator");
    let input_dict = json!({
        "output_1": output_1.to_dict(),
        "output_2": output_2.to_dict(),
        "model_list": judge_models,
    });

    let output_1 = output_1.clone();
    let output_2 = output_2.clone();
    let judge_models = judge_models.to_vec();

    run_composite(parent, step_name, StepType::Comparator, input_dict, |recorder| async move {
        let mut children: Vec<Arc<dyn Step>> = Vec::with_capacity(judge_models.len());
        for model_info in &judge_models {
            let client = ctx.clients.get(&model_info.model_name).ok_or_else(|| {
                StepError::Other(format!("no client registered for model {}", model_info.model_name))
            })?;
            let step = PromptStep::new(named_template.clone(), model_info.clone(), client)
                .with_extra_input(extra_input.clone())
                .with_step_type(StepType::Judge);
            children.push(Arc::new(step));
        }

        let completed = run_parallel(ctx, &recorder, children).await;

        let mut votes_one = 0u32;
        let mut votes_two = 0u32;
        for completed_step in &completed {
            match completed_step.output.get(WINNER_KEY).and_then(Value::as_i64) {
                Some(1) => votes_one += 1,
                Some(2) => votes_two += 1,
                _ => {} // malformed vote, dropped rather than failing the whole contest
            }
        }

        let (winner_output_id, dissent_count) = if votes_one > votes_two {
            (output_1.output_id, votes_two)
        } else {
            (output_2.output_id, votes_one)
        };

        let result = ComparatorResult {
            contestant_one_output_id: output_1.output_id,
            contestant_two_output_id: output_2.output_id,
            winner_output_id,
            dissent_count,
        };
        let value = json!({
            "contestant_one_output_id": result.contestant_one_output_id,
            "contestant_two_output_id": result.contestant_two_output_id,
            "winner_output_id": result.winner_output_id,
            "dissent_count": result.dissent_count,
            "votes_one": votes_one,
            "votes_two": votes_two,
        });
        Ok((result, value))
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

    struct VotingClient {
        name: String,
        winner: i64,
    }

    #[async_trait]
    impl LlmClient for VotingClient {
        fn name(&self) -> &str {
            &self.name
        }
        async fn prompt(&self, _request: PromptRequest) -> Result<PromptResponse, ClientError> {
            let text = format!("{{\"winner\":{}}}", self.winner);
            Ok(PromptResponse { dict: Some(json!({"winner": self.winner})), text, input_cost: 0.0, output_cost: 0.0 })
        }
        async fn is_blocked(&self) -> bool {
            false
        }
    }

    fn root() -> Recorder {
        Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), StepType::Pipeline, None, json!({}), Arc::new(NullTraceSink))
    }

    fn contestants() -> (JudgedOutput, JudgedOutput) {
        (
            JudgedOutput::new(Uuid::new_v4(), None, json!({"n": 1})),
            JudgedOutput::new(Uuid::new_v4(), None, json!({"n": 2})),
        )
    }

    #[tokio::test]
    async fn majority_vote_decides_the_winner() {
        let registry = ClientRegistry::new();
        registry.insert("j1", Arc::new(VotingClient { name: "j1".into(), winner: 1 }));
        registry.insert("j2", Arc::new(VotingClient { name: "j2".into(), winner: 1 }));
        registry.insert("j3", Arc::new(VotingClient { name: "j3".into(), winner: 2 }));
        let ctx = AppContext::new(registry, Arc::new(NullTraceSink));

        let judge_template = Arc::new(PromptTemplate::new("judge", "who wins, {{output_1}} or {{output_2}}?"));
        let judge_models = vec![ModelInfo::new("j1", 0.0), ModelInfo::new("j2", 0.0), ModelInfo::new("j3", 0.0)];
        let (one, two) = contestants();

        let (result, _recorder) =
            run_comparator(&ctx, &root(), "t::Sum", judge_template, &judge_models, &one, &two).await.unwrap();

        assert_eq!(result.winner_output_id, one.output_id);
        assert_eq!(result.dissent_count, 1);
    }

    #[tokio::test]
    async fn tie_falls_through_to_second_contestant() {
        let registry = ClientRegistry::new();
        registry.insert("j1", Arc::new(VotingClient { name: "j1".into(), winner: 1 }));
        registry.insert("j2", Arc::new(VotingClient { name: "j2".into(), winner: 2 }));
        let ctx = AppContext::new(registry, Arc::new(NullTraceSink));

        let judge_template = Arc::new(PromptTemplate::new("judge", "who wins?"));
        let judge_models = vec![ModelInfo::new("j1", 0.0), ModelInfo::new("j2", 0.0)];
        let (one, two) = contestants();

        let (result, _recorder) =
            run_comparator(&ctx, &root(), "t::Sum", judge_template, &judge_models, &one, &two).await.unwrap();

        assert_eq!(result.winner_output_id, two.output_id);
        assert_eq!(result.dissent_count, 1);
    }
}
