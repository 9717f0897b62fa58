//! Thin `handlebars` wrapper used to render prompt templates against a step's
//! input dict.
//!
//! Prompts only need `{{var}}` interpolation, `{{#if var}}...{{/if}}`
//! conditionals, `{{#each list}}...{{/each}}` iteration, and a `json` helper
//! that renders a value as an embedded JSON string (used to splice prior
//! `JudgedOutput`s verbatim into few-shot blocks). `handlebars` covers all of
//! that out of the box except the `json` helper, which is registered once here.

use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};
use serde_json::Value;

use crate::error::{StepError, StepResult};

fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h.param(0).map(|p| p.value()).cloned().unwrap_or(Value::Null);
    out.write(&serde_json::to_string(&value).unwrap_or_default())?;
    Ok(())
}

/// Owns a single `handlebars` registry shared by every prompt render in the
/// process, matching the runtime's "one template engine" design.
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        registry.register_helper("json", Box::new(json_helper));
        Self { registry }
    }

    pub fn render(&self, template: &str, input_dict: &Value) -> StepResult<String> {
        self.registry
            .render_template(template, input_dict)
            .map_err(|err| StepError::Template(err.to_string()))
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interpolates_variables() {
        let engine = TemplateEngine::new();
        let out = engine.render("Hello {{name}}", &json!({"name": "world"})).unwrap();
        assert_eq!(out, "Hello world");
    }

    #[test]
    fn renders_conditional_and_loop_blocks() {
        let engine = TemplateEngine::new();
        let input = json!({"example_list": [{"q": "a"}, {"q": "b"}]});
        let template = "{{#if example_list}}{{#each example_list}}[{{q}}]{{/each}}{{else}}none{{/if}}";
        let out = engine.render(template, &input).unwrap();
        assert_eq!(out, "[a][b]");

        let empty_out = engine.render(template, &json!({})).unwrap();
        assert_eq!(empty_out, "none");
    }

    #[test]
    fn json_helper_embeds_value_as_json_string() {
        let engine = TemplateEngine::new();
        let input = json!({"example": {"n": 4}});
        let out = engine.render("{{json example}}", &input).unwrap();
        assert_eq!(out, "{\"n\":4}");
    }
}
