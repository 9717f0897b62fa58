//! Step execution engine, recorder tree, and adaptive in-context-learning
//! tournament algorithms for LLMonPy.
//!
//! A step is any type implementing [`runtime::Step`]; `llmonpy-core` ships the
//! base [`prompt::PromptStep`] variant and the composite tournament family
//! built on top of it ([`generator`], [`comparator`], [`ranker`],
//! [`tournament`], [`gar`], [`cycle`]). Every execution — prompt or composite —
//! is bookkept by a [`recorder::Recorder`] and persisted through whatever
//! [`recorder::TraceSink`] the caller's [`context::AppContext`] wires in.

pub mod comparator;
pub mod context;
pub mod cycle;
pub mod error;
pub mod gar;
pub mod generator;
pub mod model;
pub mod prompt;
pub mod ranker;
pub mod recorder;
pub mod runtime;
pub mod template;
pub mod tournament;

pub use context::{AppContext, ClientRegistry};
pub use error::{StepError, StepResult};
pub use model::{JudgedOutput, ModelInfo, OutputFormat, StepType, StepOutput, TextOutput};
pub use prompt::{PromptStep, PromptTemplate, PROMPT_JSON_RETRIES};
pub use recorder::{ContestResult, LogEvent, Recorder, TourneyResult, TraceInfo, TraceSink};
pub use runtime::{run_composite, run_parallel, run_parallel_with_callback, run_step, CompletedStep, Step};
pub use template::TemplateEngine;

pub use comparator::{run_comparator, ComparatorResult};
pub use cycle::{run_cycle, CycleConfig};
pub use gar::{run_gar, GarConfig};
pub use generator::run_generator;
pub use ranker::run_ranker;
pub use tournament::run_tournament;
