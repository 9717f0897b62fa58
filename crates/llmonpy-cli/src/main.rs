//! Command-line entry point for running LLMonPy steps directly.
//!
//! `models` lists the clients that started, `prompt`/`tourney`/`cycle`/`gar`
//! run one step against the live engine, and `tourney-steps`/`tourney-results`
//! read back what the trace store already recorded on an earlier run.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use llmonpy_core::{
    run_cycle, run_gar, run_step, run_tournament, AppContext, ClientRegistry, CycleConfig, GarConfig, JudgedOutput,
    ModelInfo, OutputFormat, PromptStep, PromptTemplate, Recorder, StepResult, StepType,
};
use llmonpy_providers::{AnthropicClient, LlmClient, OpenAiClient};
use llmonpy_ratellmiter::RateLimiterMonitor;
use llmonpy_trace::DataDirTraceSink;

/// One client this CLI knows how to start from environment variables, keyed
/// by the model name the client registry and `ModelInfo` both look up by.
struct ModelCatalogEntry {
    provider: &'static str,
    model_name: &'static str,
    requests_per_minute: u32,
}

const MODEL_CATALOG: &[ModelCatalogEntry] = &[
    ModelCatalogEntry { provider: "openai", model_name: "gpt-4o", requests_per_minute: 500 },
    ModelCatalogEntry { provider: "openai", model_name: "gpt-4o-mini", requests_per_minute: 500 },
    ModelCatalogEntry { provider: "anthropic", model_name: "claude-3-5-sonnet-20241022", requests_per_minute: 300 },
    ModelCatalogEntry { provider: "anthropic", model_name: "claude-3-5-haiku-20241022", requests_per_minute: 300 },
];

const DEFAULT_JUDGE_PROMPT: &str = "Compare two candidate answers to the same prompt and decide which is better.\n\
Answer 1: {{json output_1}}\n\
Answer 2: {{json output_2}}\n\
Respond with only a JSON object: {\"winner\": 1} or {\"winner\": 2}.";

#[derive(Parser)]
#[command(name = "llmonpy")]
#[command(version, about = "Run LLMonPy steps and tournaments from the command line", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory the trace store writes JSONL streams and its SQLite database under.
    #[arg(long, global = true, default_value = "./data")]
    data_dir: String,

    /// Enable debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the LLM clients that started successfully from environment variables.
    Models,

    /// Run a single prompt against one model.
    Prompt {
        /// The prompt text.
        text: String,

        /// Model name to use; defaults to the first active client.
        #[arg(short, long)]
        model: Option<String>,

        /// Optional system prompt.
        #[arg(short, long)]
        system: Option<String>,

        /// Treat the response as plain text instead of requiring JSON.
        #[arg(long)]
        text_output: bool,
    },

    /// Run a Generator followed by a Ranker over the active clients.
    Tourney {
        /// The generation prompt template text.
        text: String,

        /// Sampling temperature for generation.
        #[arg(long, default_value_t = 0.7)]
        temperature: f32,
    },

    /// Run an adaptive in-context-learning cycle.
    Cycle {
        text: String,

        /// Total tournament rounds, including the first.
        #[arg(long, default_value_t = 3)]
        max_cycles: u32,

        /// Size of the example list carried between rounds.
        #[arg(long, default_value_t = 3)]
        number_of_examples: usize,
    },

    /// Run a Generate-Aggregate-Rank pipeline.
    Gar {
        text: String,

        /// Aggregation layers to run after the initial generation.
        #[arg(long, default_value_t = 1)]
        repeat_aggregation_layer: u32,
    },

    /// List step names that have recorded tourney results.
    TourneySteps,

    /// Print the tourney results recorded for one step name.
    TourneyResults {
        /// The fully-qualified step name, e.g. `my_prompt:Tournament:Ranker`.
        step_name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("llmonpy={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Models => {
            let ctx = build_context(&cli.data_dir).await?;
            print_active_models(&ctx);
            Ok(())
        }
        Commands::Prompt { text, model, system, text_output } => {
            run_prompt(&cli.data_dir, text, model, system, text_output).await
        }
        Commands::Tourney { text, temperature } => run_tourney(&cli.data_dir, text, temperature).await,
        Commands::Cycle { text, max_cycles, number_of_examples } => {
            run_cycle_command(&cli.data_dir, text, max_cycles, number_of_examples).await
        }
        Commands::Gar { text, repeat_aggregation_layer } => {
            run_gar_command(&cli.data_dir, text, repeat_aggregation_layer).await
        }
        Commands::TourneySteps => tourney_steps(&cli.data_dir).await,
        Commands::TourneyResults { step_name } => tourney_results(&cli.data_dir, &step_name).await,
    }
}

/// Starts every client in [`MODEL_CATALOG`] whose API key is present in the
/// environment, registers each with a shared [`RateLimiterMonitor`], and opens
/// the data-directory trace store. Clients that didn't start are simply
/// absent from the returned [`AppContext`]'s active registry.
async fn build_context(data_dir: &str) -> Result<AppContext> {
    let monitor: Arc<RateLimiterMonitor> = RateLimiterMonitor::new();
    let registry = ClientRegistry::new();

    for entry in MODEL_CATALOG {
        let client: Option<Arc<dyn LlmClient>> = match entry.provider {
            "openai" => OpenAiClient::from_env(entry.model_name.to_string(), entry.requests_per_minute, &monitor)
                .ok()
                .map(|client| Arc::new(client) as Arc<dyn LlmClient>),
            "anthropic" => {
                AnthropicClient::from_env(entry.model_name.to_string(), entry.requests_per_minute, &monitor)
                    .ok()
                    .map(|client| Arc::new(client) as Arc<dyn LlmClient>)
            }
            other => bail!("unknown provider in model catalog: {other}"),
        };
        if let Some(client) = client {
            tracing::info!(model = entry.model_name, provider = entry.provider, "registered client");
            registry.insert(entry.model_name, client);
        }
    }

    monitor.start();

    let trace_sink = DataDirTraceSink::open(data_dir)
        .await
        .with_context(|| format!("opening trace store at {data_dir}"))?;

    Ok(AppContext::new(registry, Arc::new(trace_sink)).with_monitor(monitor))
}

fn print_active_models(ctx: &AppContext) {
    let mut names = ctx.clients.active_client_names();
    if names.is_empty() {
        println!("No models are active.");
        return;
    }
    names.sort();
    for name in names {
        println!("{}", name.green());
    }
}

fn first_active_model(ctx: &AppContext) -> Result<String> {
    ctx.clients
        .active_client_names()
        .into_iter()
        .min()
        .context("no models are active; set OPENAI_API_KEY or ANTHROPIC_API_KEY")
}

/// Every active client, wrapped as a `ModelInfo` at the given temperature —
/// the Cartesian product of clients and a single-entry temperature list.
fn all_models_at(ctx: &AppContext, temperature: f32) -> Vec<ModelInfo> {
    let mut names = ctx.clients.active_client_names();
    names.sort();
    names.into_iter().map(|name| ModelInfo::new(name, temperature)).collect()
}

async fn run_prompt(data_dir: &str, text: String, model: Option<String>, system: Option<String>, text_output: bool) -> Result<()> {
    let ctx = build_context(data_dir).await?;
    let model_name = match model {
        Some(name) => name,
        None => first_active_model(&ctx)?,
    };
    let client = ctx.clients.get(&model_name).with_context(|| format!("no active client named {model_name}"))?;

    let mut template = PromptTemplate::new("cli_prompt", text);
    if text_output {
        template = template.with_output_format(OutputFormat::Text);
    }
    if let Some(system) = system {
        template = template.with_system_prompt(system);
    }

    let step = Arc::new(PromptStep::new(Arc::new(template), ModelInfo::new(model_name, 0.0), client));
    let (output, recorder) = run_step(&ctx, step, Uuid::new_v4(), None, None).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    eprintln!("{} ${:.6}", "cost:".dimmed(), recorder.cost());
    Ok(())
}

async fn run_tourney(data_dir: &str, text: String, temperature: f32) -> Result<()> {
    let ctx = build_context(data_dir).await?;
    let generation_template = Arc::new(PromptTemplate::new("cli_tourney", text));
    let judge_template = Arc::new(PromptTemplate::new("cli_tourney_judge", DEFAULT_JUDGE_PROMPT));

    let generation_models = all_models_at(&ctx, temperature);
    let judge_models = all_models_at(&ctx, 0.0);
    if generation_models.is_empty() {
        bail!("no models are active; set OPENAI_API_KEY or ANTHROPIC_API_KEY");
    }

    println!("{}", "running tourney...".cyan());
    let root = new_root(&ctx);
    let result = run_tournament(&ctx, &root, generation_template, generation_models, judge_template, judge_models).await;
    let (_ordered, recorder) = finish_root(root, result, ordered_response_value).await?;
    print_done(&recorder)
}

async fn run_cycle_command(data_dir: &str, text: String, max_cycles: u32, number_of_examples: usize) -> Result<()> {
    let ctx = build_context(data_dir).await?;
    let generation_template = Arc::new(PromptTemplate::new("cli_cycle", text));
    let judge_template = Arc::new(PromptTemplate::new("cli_cycle_judge", DEFAULT_JUDGE_PROMPT));
    let first_round_models = all_models_at(&ctx, 0.7);
    let refinement_models = all_models_at(&ctx, 0.7);
    let judge_models = all_models_at(&ctx, 0.0);
    if first_round_models.is_empty() {
        bail!("no models are active; set OPENAI_API_KEY or ANTHROPIC_API_KEY");
    }

    println!("{}", "running cycle...".cyan());
    let root = new_root(&ctx);
    let config = CycleConfig {
        generation_template,
        first_round_models,
        refinement_models,
        judge_template,
        judge_models,
        max_cycles,
        number_of_examples,
    };
    let result = run_cycle(&ctx, &root, config).await;
    let (_ordered, recorder) = finish_root(root, result, ordered_response_value).await?;
    print_done(&recorder)
}

async fn run_gar_command(data_dir: &str, text: String, repeat_aggregation_layer: u32) -> Result<()> {
    let ctx = build_context(data_dir).await?;
    let generation_template = Arc::new(PromptTemplate::new("cli_gar", text));
    let judge_template = Arc::new(PromptTemplate::new("cli_gar_judge", DEFAULT_JUDGE_PROMPT));
    let generation_models = all_models_at(&ctx, 0.7);
    let aggregation_models = all_models_at(&ctx, 0.7);
    let judge_models = all_models_at(&ctx, 0.0);
    if generation_models.is_empty() {
        bail!("no models are active; set OPENAI_API_KEY or ANTHROPIC_API_KEY");
    }

    println!("{}", "running gar...".cyan());
    let root = new_root(&ctx);
    let config = GarConfig {
        generation_template,
        generation_models,
        aggregation_models,
        repeat_aggregation_layer,
        judgement: Some((judge_template, judge_models)),
    };
    let result = run_gar(&ctx, &root, config).await;
    let (_ordered, recorder) = finish_root(root, result, ordered_response_value).await?;
    print_done(&recorder)
}

/// `run_tournament`/`run_cycle`/`run_gar` are composite step bodies, not root
/// `Step`s — each attaches its own finalized recorder as a child of whatever
/// `parent` it's handed, but never finalizes `parent` itself. The CLI's own
/// invocation is the true trace root, so it creates one here and finalizes it
/// after the composite call returns.
fn new_root(ctx: &AppContext) -> Recorder {
    Recorder::new_root(Uuid::new_v4(), None, None, "cli".to_string(), StepType::Pipeline, None, serde_json::json!({}), ctx.trace_sink.clone())
}

fn ordered_response_value(ordered: &Vec<JudgedOutput>) -> serde_json::Value {
    serde_json::json!({ "ordered_response_list": ordered.iter().map(JudgedOutput::to_dict).collect::<Vec<_>>() })
}

/// Finalizes `root` from a composite call's result: on success, builds the
/// root's own output dict via `to_value`; on failure, records the exception
/// and finalizes as a failure, matching the `run_step` root lifecycle.
async fn finish_root<T>(
    root: Recorder,
    result: StepResult<(T, Recorder)>,
    to_value: impl FnOnce(&T) -> serde_json::Value,
) -> Result<(T, Recorder)> {
    match result {
        Ok((typed, _child_recorder)) => {
            let value = to_value(&typed);
            root.finish_child_step(Some(value), OutputFormat::Json, 200, None).await?;
            Ok((typed, root))
        }
        Err(err) => {
            root.record_exception(err.to_string());
            let _ = root.finish_child_step(None, OutputFormat::Json, 500, None).await;
            Err(err.into())
        }
    }
}

fn print_done(recorder: &Recorder) -> Result<()> {
    println!("{}", "done.".green().bold());
    eprintln!("{} ${:.6}", "cost:".dimmed(), recorder.cost());
    Ok(())
}

async fn tourney_steps(data_dir: &str) -> Result<()> {
    let sink = DataDirTraceSink::open(data_dir).await.with_context(|| format!("opening trace store at {data_dir}"))?;
    let step_names = sink.sqlite().get_tourney_step_name_list().await?;
    if step_names.is_empty() {
        println!("No steps have recorded tourney results yet.");
        return Ok(());
    }
    println!("{}", "Step names with tourney data:".cyan().bold());
    for step_name in step_names {
        println!("  {step_name}");
    }
    Ok(())
}

async fn tourney_results(data_dir: &str, step_name: &str) -> Result<()> {
    let sink = DataDirTraceSink::open(data_dir).await.with_context(|| format!("opening trace store at {data_dir}"))?;
    let results = sink.sqlite().get_tourney_results_for_step_name(step_name).await?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
