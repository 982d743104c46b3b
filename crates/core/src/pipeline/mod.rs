pub mod engine;
pub mod states;

pub use engine::{
    PipelineDefinition, PipelineEngine, PipelineTransitionError, QuestionAnsweringFlow,
};
pub use states::{PipelineAction, PipelineEvent, PipelineState, TransitionOutcome};
