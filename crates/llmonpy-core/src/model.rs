//! Step identity, output, and model-selection types shared across the runtime.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// `:`-separated path segment used when a composite step builds a qualified
/// step name out of its parent's.
pub const STEP_NAME_SEPARATOR: &str = ":";

/// Key under which an inherited example list is published in a step's input dict.
pub const EXAMPLE_LIST_KEY: &str = "example_list";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Prompt,
    Generator,
    Comparator,
    Ranker,
    Tournament,
    Cycle,
    GenerateAggregateRank,
    Judge,
    Pipeline,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Prompt => "prompt",
            StepType::Generator => "generator",
            StepType::Comparator => "comparator",
            StepType::Ranker => "ranker",
            StepType::Tournament => "tournament",
            StepType::Cycle => "cycle",
            StepType::GenerateAggregateRank => "gar",
            StepType::Judge => "judge",
            StepType::Pipeline => "pipeline",
        }
    }
}

/// One entry of a model list: a named client plus the sampling settings to call
/// it with. A model list is the Cartesian product of clients and temperatures;
/// the caller is responsible for not deduplicating it (duplicates are intentional
/// — they let the same client contribute multiple independent samples).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl ModelInfo {
    pub fn new(model_name: impl Into<String>, temperature: f32) -> Self {
        Self { model_name: model_name.into(), temperature, max_output_tokens: 4096 }
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }
}

/// An opaque, serializable value tree produced by a step.
///
/// Two outputs are structurally equal iff their serialized forms are byte-equal;
/// the generator relies on this for deduplication (`dedup_key`).
pub trait StepOutput: Send + Sync + std::fmt::Debug {
    fn to_value(&self) -> Value;

    /// Canonical serialized form used for dedup comparison: two outputs are
    /// structurally equal iff their serialized forms are byte-equal.
    fn dedup_key(&self) -> String {
        self.to_value().to_string()
    }
}

impl StepOutput for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

/// Plain text output, used by simple text-format prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextOutput {
    pub response_string: String,
}

impl StepOutput for TextOutput {
    fn to_value(&self) -> Value {
        serde_json::json!({ "response_string": self.response_string })
    }
}

/// A candidate carrying identity, provenance, and a running victory count
/// across comparator calls. Identity/equality is by `output_id`; ranking
/// orders by `victory_count` descending.
#[derive(Debug, Clone)]
pub struct JudgedOutput {
    pub output_id: Uuid,
    pub originating_step_id: Uuid,
    pub model_info: Option<ModelInfo>,
    pub step_output: Value,
    pub victory_count: u32,
}

impl JudgedOutput {
    pub fn new(originating_step_id: Uuid, model_info: Option<ModelInfo>, step_output: Value) -> Self {
        Self {
            output_id: Uuid::new_v4(),
            originating_step_id,
            model_info,
            step_output,
            victory_count: 0,
        }
    }

    pub fn reset_victory_count(&mut self) {
        self.victory_count = 0;
    }

    pub fn to_dict(&self) -> Value {
        serde_json::json!({
            "output_id": self.output_id,
            "originating_step_id": self.originating_step_id,
            "model_info": self.model_info.as_ref().map(|m| serde_json::to_value(m).unwrap()),
            "step_output": self.step_output,
            "victory_count": self.victory_count,
        })
    }

    /// Structural-equality dedup key over the serialized output alone — model
    /// identity and victory count do not participate.
    pub fn dedup_key(&self) -> String {
        self.step_output.to_string()
    }
}
