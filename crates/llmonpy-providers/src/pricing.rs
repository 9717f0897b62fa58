//! Per-model list prices, in currency units per million tokens.

/// Price per million input/output tokens for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self { input_per_million, output_per_million }
    }

    pub fn input_cost(&self, tokens: u32) -> f64 {
        tokens as f64 * self.input_per_million / 1_000_000.0
    }

    pub fn output_cost(&self, tokens: u32) -> f64 {
        tokens as f64 * self.output_per_million / 1_000_000.0
    }
}

/// Falls back to a conservative flat rate for unlisted models rather than
/// failing the request outright; unknown-model pricing is logged by callers.
pub const UNKNOWN_MODEL_PRICING: ModelPricing = ModelPricing::new(5.0, 15.0);

pub fn openai_pricing(model: &str) -> ModelPricing {
    match model {
        "gpt-4o" => ModelPricing::new(2.50, 10.0),
        "gpt-4o-mini" => ModelPricing::new(0.15, 0.60),
        "gpt-4-turbo" => ModelPricing::new(10.0, 30.0),
        "gpt-3.5-turbo" => ModelPricing::new(0.50, 1.50),
        _ => UNKNOWN_MODEL_PRICING,
    }
}

pub fn anthropic_pricing(model: &str) -> ModelPricing {
    match model {
        "claude-3-opus-20240229" => ModelPricing::new(15.0, 75.0),
        "claude-3-5-sonnet-20241022" | "claude-3-sonnet-20240229" => ModelPricing::new(3.0, 15.0),
        "claude-3-haiku-20240307" | "claude-3-5-haiku-20241022" => ModelPricing::new(0.25, 1.25),
        _ => UNKNOWN_MODEL_PRICING,
    }
}
