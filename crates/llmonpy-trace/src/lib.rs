//! Trace service: persists the records `llmonpy_core::recorder::Recorder`
//! produces, and answers the read-side queries built on top of them.
//!
//! Two sinks, combinable:
//! - [`file::FileTraceSink`] — append-only JSONL streams.
//! - [`sqlite::SqliteTraceSink`] — an indexed relational store backing
//!   `get_complete_trace`, `get_tourney_step_name_list`, and
//!   `get_tourney_results_for_step_name`.
//!
//! [`combined::DataDirTraceSink`] wires both into the single
//! `Arc<dyn TraceSink>` an `AppContext` holds.

pub mod combined;
pub mod error;
pub mod file;
pub mod sqlite;

pub use combined::DataDirTraceSink;
pub use error::{TraceError, TraceResult};
pub use file::FileTraceSink;
pub use sqlite::{CompleteTraceData, SqliteTraceSink};
