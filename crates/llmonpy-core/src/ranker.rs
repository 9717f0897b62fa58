//! `Ranker`: schedules every pairwise contest among a contestant list,
//! tallies victories, and produces a stable-sorted order plus a persisted
//! [`TourneyResult`].

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};

use crate::comparator::run_comparator;
use crate::context::AppContext;
use crate::error::StepResult;
use crate::model::{JudgedOutput, ModelInfo, StepType};
use crate::prompt::PromptTemplate;
use crate::recorder::{ContestResult, Recorder};
use crate::runtime::run_composite;

/// Runs all `n * (n - 1) / 2` pairwise comparators among `contestants` in
/// parallel, then orders the field by `victory_count` descending, stable on
/// the original (pre-sort) position for ties.
///
/// `contestant_step_name` labels the [`TourneyResult`] and is passed through
/// to each comparator so its judge prompt is recorded under a name derived
/// from the step that produced the contestants.
pub async fn run_ranker(
    ctx: &AppContext,
    parent: &Recorder,
    contestant_step_name: String,
    contestants: Vec<JudgedOutput>,
    judge_template: Arc<PromptTemplate>,
    judge_models: Vec<ModelInfo>,
) -> StepResult<(Vec<JudgedOutput>, Recorder)> {
    let step_name = format!("{contestant_step_name}:Ranker");
    let input_dict = json!({
        "contestant_step_name": contestant_step_name,
        "contestant_list": contestants.iter().map(JudgedOutput::to_dict).collect::<Vec<_>>(),
    });

    run_composite(parent, step_name, StepType::Ranker, input_dict, |recorder| async move {
        let number_of_judges = judge_models.len();
        let tourney_result = recorder.create_tourney_result(contestant_step_name.clone(), number_of_judges);

        let mut pairs = Vec::new();
        for i in 0..contestants.len() {
            for j in (i + 1)..contestants.len() {
                pairs.push((i, j));
            }
        }

        let mut handles = FuturesUnordered::new();
        for (i, j) in pairs {
            let ctx = ctx.clone();
            let recorder = recorder.clone();
            let contestant_step_name = contestant_step_name.clone();
            let judge_template = judge_template.clone();
            let judge_models = judge_models.clone();
            let one = contestants[i].clone();
            let two = contestants[j].clone();

            handles.push(tokio::spawn(async move {
                let _permit = ctx.step_pool.clone().acquire_owned().await.expect("step pool semaphore closed");
                run_comparator(&ctx, &recorder, &contestant_step_name, judge_template, &judge_models, &one, &two).await
            }));
        }

        let mut contest_results = Vec::new();
        while let Some(joined) = handles.next().await {
            // A comparator that itself errors (e.g. every judge unreachable) is
            // simply dropped — its contest never happened, matching how a
            // failed child under `run_parallel` leaves its parent unaffected.
            if let Ok(Ok((result, _comparator_recorder))) = joined {
                contest_results.push(result);
            }
        }

        let mut contestants = contestants;
        for result in &contest_results {
            if let Some(winner) = contestants.iter_mut().find(|c| c.output_id == result.winner_output_id) {
                winner.victory_count += 1;
            }
            tourney_result.add_contest_result(ContestResult {
                contestant_one_output_id: result.contestant_one_output_id,
                contestant_two_output_id: result.contestant_two_output_id,
                winner_output_id: result.winner_output_id,
                dissenting_judges: result.dissent_count,
            });
        }

        contestants.sort_by(|a, b| b.victory_count.cmp(&a.victory_count));

        let contestant_values: Vec<Value> = contestants.iter().map(JudgedOutput::to_dict).collect();
        recorder.record_tourney_result(contestant_values.clone(), tourney_result).await;

        let value = json!({ "ordered_response_list": contestant_values });
        Ok((contestants, value))
    })
    .await
}
