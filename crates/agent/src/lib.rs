//! Question-answering pipeline for CRM data.
//!
//! A run moves through three steps, each backed by a remote collaborator:
//! 1. **Generation** (`generation`) asks the model for Presto SQL and checks it
//!    with `EXPLAIN`, feeding errors back for correction.
//! 2. **Execution** (`execution`) runs the query behind the read-only
//!    `guardrails`.
//! 3. **Summarization** (`summarize`) turns rows into an answer and a chart.
//!
//! `runtime::PipelineController` sequences the steps through the pipeline state
//! machine and streams `RunEvent`s to the caller.
//!
//! The model only ever proposes SQL and prose. Whether SQL may run is decided
//! by the guardrail, never by the model.

pub mod conversation;
pub mod execution;
pub mod generation;
pub mod guardrails;
pub mod llm;
pub mod metadata;
pub mod prompts;
pub mod runtime;
pub mod summarize;

#[cfg(test)]
pub(crate) mod testing;

pub use llm::{LlmClient, OpenAiCompatibleClient};
pub use runtime::{PipelineController, RunEvent, RunOutcome};
