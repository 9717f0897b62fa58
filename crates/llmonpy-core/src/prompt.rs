//! The `Prompt` step variant: renders a template against the current input
//! dict, calls an [`LlmClient`], and retries purely on JSON-parse failures.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use llmonpy_providers::{ClientError, LlmClient, PromptRequest};

use crate::context::AppContext;
use crate::error::{StepError, StepResult};
use crate::model::{ModelInfo, OutputFormat, EXAMPLE_LIST_KEY};
use crate::recorder::Recorder;
use crate::runtime::Step;

/// A prompt body shared across every model a `Generator`/`Ranker` spawns for
/// it. `name` is the step's fully-qualified name — the key examples are
/// looked up and published under, independent of which model renders it.
#[derive(Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub template_text: String,
    pub system_prompt: Option<String>,
    pub output_format: OutputFormat,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, template_text: impl Into<String>) -> Self {
        Self { name: name.into(), template_text: template_text.into(), system_prompt: None, output_format: OutputFormat::Json }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_output_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = output_format;
        self
    }

    /// Its own public fields, serialized — the base every step's input dict
    /// is built on before `extra_input`/`example_list` are merged on top.
    fn to_dict(&self) -> Value {
        json!({
            "name": self.name,
            "template_text": self.template_text,
            "system_prompt": self.system_prompt,
            "output_format": self.output_format,
        })
    }
}

/// Retries purely on JSON-parse failures; rate-limit waits happen underneath
/// `LlmClient::prompt` and are never counted here.
pub const PROMPT_JSON_RETRIES: u32 = 3;

/// One model's execution of a [`PromptTemplate`].
///
/// `extra_input` carries whatever fields the caller wants merged into the
/// rendered dict beyond inherited examples — e.g. a judge prompt's two
/// contestants.
pub struct PromptStep {
    pub template: Arc<PromptTemplate>,
    pub model_info: ModelInfo,
    pub client: Arc<dyn LlmClient>,
    pub extra_input: Value,
    pub step_type: crate::model::StepType,
}

impl PromptStep {
    pub fn new(template: Arc<PromptTemplate>, model_info: ModelInfo, client: Arc<dyn LlmClient>) -> Self {
        Self { template, model_info, client, extra_input: json!({}), step_type: crate::model::StepType::Prompt }
    }

    pub fn with_extra_input(mut self, extra_input: Value) -> Self {
        self.extra_input = extra_input;
        self
    }

    /// A judge's per-model prompt is itself recorded under `StepType::Judge`
    /// rather than the generic `Prompt` type, matching `TournamentJudgePrompt`.
    pub fn with_step_type(mut self, step_type: crate::model::StepType) -> Self {
        self.step_type = step_type;
        self
    }

    /// Merges the template's own fields in as the base, then `extra_input`'s
    /// keys, then the inherited `example_list` — mirroring the original's
    /// `result = self.prompt.to_dict(); result.update(super_result)`.
    fn build_input_dict(&self, parent: Option<&Recorder>) -> Value {
        let mut dict = self.template.to_dict();
        let Value::Object(map) = &mut dict else {
            unreachable!("PromptTemplate::to_dict always builds an object")
        };

        if let Value::Object(extra) = &self.extra_input {
            map.extend(extra.clone());
        }

        if let Some(parent) = parent {
            if let Some(examples) = parent.get_step_examples(&self.template.name) {
                map.insert(EXAMPLE_LIST_KEY.to_string(), Value::Array(examples));
            }
        }

        dict
    }
}

#[async_trait]
impl Step for PromptStep {
    fn step_name(&self) -> String {
        self.template.name.clone()
    }

    fn step_type(&self) -> crate::model::StepType {
        self.step_type
    }

    fn model_info(&self) -> Option<ModelInfo> {
        Some(self.model_info.clone())
    }

    fn output_format(&self) -> OutputFormat {
        self.template.output_format
    }

    fn input_dict(&self, parent: Option<&Recorder>) -> Value {
        self.build_input_dict(parent)
    }

    async fn execute(&self, ctx: &AppContext, recorder: &Recorder) -> StepResult<Value> {
        let input_dict = self.build_input_dict(Some(recorder));
        let rendered_text = ctx.templates.render(&self.template.template_text, &input_dict)?;
        let rendered_system = match &self.template.system_prompt {
            Some(system) => Some(ctx.templates.render(system, &input_dict)?),
            None => None,
        };
        recorder.log_prompt_template(rendered_text.clone());

        let json_mode = self.template.output_format == OutputFormat::Json;
        let mut last_error: Option<StepError> = None;

        for _attempt in 0..PROMPT_JSON_RETRIES {
            let mut request = PromptRequest::new(rendered_text.clone())
                .json_mode(json_mode)
                .with_temperature(self.model_info.temperature)
                .with_max_output_tokens(self.model_info.max_output_tokens);
            if let Some(system) = &rendered_system {
                request = request.with_system(system.clone());
            }

            match self.client.prompt(request).await {
                Ok(response) => {
                    recorder.log_prompt_response(rendered_text.clone(), response.text.clone());
                    recorder.record_cost(response.total_cost());
                    let output = if json_mode {
                        response.dict.unwrap_or_else(|| json!({ "response_string": response.text }))
                    } else {
                        json!({ "response_string": response.text })
                    };
                    return Ok(output);
                }
                Err(ClientError::JsonFormat { attempts, last_error: msg }) => {
                    last_error = Some(StepError::JsonFormat(format!("{attempts} attempt(s): {msg}")));
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(last_error.unwrap_or_else(|| StepError::JsonFormat("exhausted retries".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AppContext;
    use crate::recorder::NullTraceSink;
    use llmonpy_providers::PromptResponse;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct StubClient {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl LlmClient for StubClient {
        fn name(&self) -> &str {
            "stub"
        }
        async fn prompt(&self, _request: PromptRequest) -> Result<PromptResponse, ClientError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                return Err(ClientError::JsonFormat { attempts: 3, last_error: "bad".to_string() });
            }
            Ok(PromptResponse { text: "{\"n\":4}".to_string(), dict: Some(json!({"n": 4})), input_cost: 0.001, output_cost: 0.002 })
        }
        async fn is_blocked(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn happy_path_produces_parsed_json_and_cost() {
        let ctx = AppContext::for_tests();
        let template = Arc::new(PromptTemplate::new("t::Sum", "What is 2+2? Reply {\"n\":...}"));
        let client = Arc::new(StubClient { calls: AtomicU32::new(0), fail_times: 0 });
        let step = Arc::new(PromptStep::new(template, ModelInfo::new("stub-model", 0.0), client));
        let (output, recorder) = crate::runtime::run_step(&ctx, step, Uuid::new_v4(), None, None).await.unwrap();
        assert_eq!(output["n"], 4);
        assert!(recorder.cost() > 0.0);
    }

    #[tokio::test]
    async fn retries_up_to_three_times_on_json_format_error() {
        let ctx = AppContext::for_tests();
        let template = Arc::new(PromptTemplate::new("t::Sum", "2+2"));
        let client = Arc::new(StubClient { calls: AtomicU32::new(0), fail_times: 2 });
        let step = Arc::new(PromptStep::new(template, ModelInfo::new("stub-model", 0.0), client));
        let (output, _) = crate::runtime::run_step(&ctx, step, Uuid::new_v4(), None, None).await.unwrap();
        assert_eq!(output["n"], 4);
    }

    #[tokio::test]
    async fn fails_after_exhausting_retries() {
        let ctx = AppContext::for_tests();
        let template = Arc::new(PromptTemplate::new("t::Sum", "2+2"));
        let client = Arc::new(StubClient { calls: AtomicU32::new(0), fail_times: 10 });
        let step = Arc::new(PromptStep::new(template, ModelInfo::new("stub-model", 0.0), client));
        let result = crate::runtime::run_step(&ctx, step, Uuid::new_v4(), None, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn examples_from_parent_are_merged_into_input_dict() {
        let root = Recorder::new_root(Uuid::new_v4(), None, None, "root".into(), crate::model::StepType::Pipeline, None, json!({}), Arc::new(NullTraceSink));
        root.set_step_examples("t::Sum", vec![json!({"n": 1})]);
        let template = Arc::new(PromptTemplate::new("t::Sum", "2+2"));
        let client = Arc::new(StubClient { calls: AtomicU32::new(0), fail_times: 0 });
        let step = PromptStep::new(template, ModelInfo::new("stub-model", 0.0), client);
        let dict = step.input_dict(Some(&root));
        assert_eq!(dict[EXAMPLE_LIST_KEY].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn own_template_fields_are_merged_into_input_dict() {
        let template = Arc::new(PromptTemplate::new("t::Sum", "the template text"));
        let client = Arc::new(StubClient { calls: AtomicU32::new(0), fail_times: 0 });
        let step = PromptStep::new(template, ModelInfo::new("stub-model", 0.0), client);
        let dict = step.input_dict(None);
        assert_eq!(dict["name"], json!("t::Sum"));
        assert_eq!(dict["template_text"], json!("the template text"));
        assert_eq!(dict["output_format"], json!("json"));
    }

    #[tokio::test]
    async fn extra_input_overrides_a_colliding_template_field() {
        let template = Arc::new(PromptTemplate::new("t::Sum", "the template text"));
        let client = Arc::new(StubClient { calls: AtomicU32::new(0), fail_times: 0 });
        let step = PromptStep::new(template, ModelInfo::new("stub-model", 0.0), client)
            .with_extra_input(json!({"name": "overridden"}));
        let dict = step.input_dict(None);
        assert_eq!(dict["name"], json!("overridden"));
    }
}
