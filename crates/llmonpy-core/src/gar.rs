//! Generate-Aggregate-Rank: generate an initial candidate set, then repeatedly
//! re-aggregate it over a fresh model list, republishing the current candidate
//! set as that prompt's examples on every layer, and optionally rank the
//! final layer.

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

/// Configures a single Generate-Aggregate-Rank run.
pub struct GarConfig {
    pub generation_template: Arc<PromptTemplate>,
    pub generation_models: Vec<ModelInfo>,
    pub aggregation_models: Vec<ModelInfo>,
    /// Number of aggregation layers to run after the initial generation.
    pub repeat_aggregation_layer: u32,
    /// When set, the last layer's survivors are ranked; otherwise they're
    /// returned unranked in whatever order the generator produced them.
    pub judgement: Option<(Arc<PromptTemplate>, Vec<ModelInfo>)>,
}

fn publish_examples(recorder: &Recorder, step_name: &str, candidates: &[JudgedOutput]) {
    let examples = candidates.iter().map(|c| c.step_output.clone()).collect();
    recorder.set_step_examples(step_name.to_string(), examples);
}

pub async fn run_gar(ctx: &AppContext, parent: &Recorder, config: GarConfig) -> StepResult<(Vec<JudgedOutput>, Recorder)> {
    let step_name = format!("{}:GenerateAggregateRank", config.generation_template.name);
    let input_dict = json!({
        "generation_prompt": config.generation_template.name,
        "generation_models": config.generation_models,
        "aggregation_models": config.aggregation_models,
        "repeat_aggregation_layer": config.repeat_aggregation_layer,
    });

    run_composite(parent, step_name, StepType::GenerateAggregateRank, input_dict, |recorder| async move {
        let GarConfig { generation_template, generation_models, aggregation_models, repeat_aggregation_layer, judgement } = config;

        let (mut candidates, _) = run_generator(ctx, &recorder, generation_template.clone(), &generation_models).await?;
        publish_examples(&recorder, &generation_template.name, &candidates);

        for _ in 0..repeat_aggregation_layer {
            let (layer_candidates, _) = run_generator(ctx, &recorder, generation_template.clone(), &aggregation_models).await?;
            candidates = layer_candidates;
            publish_examples(&recorder, &generation_template.name, &candidates);
        }

        let final_list = match judgement {
            Some((judge_template, judge_models)) => {
                let (ordered, _) =
                    run_ranker(ctx, &recorder, generation_template.name.clone(), candidates, judge_template, judge_models).await?;
                ordered
            }
            None => candidates,
        };

        let value = json!({ "ordered_response_list": final_list.iter().map(JudgedOutput::to_dict).collect::<Vec<_>>() });
        Ok((final_list, value))
    })
    .await
}
