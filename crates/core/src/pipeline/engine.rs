use thiserror::Error;

use crate::pipeline::states::{PipelineAction, PipelineEvent, PipelineState, TransitionOutcome};

pub trait PipelineDefinition {
    fn initial_state(&self) -> PipelineState;
    fn transition(
        &self,
        current: PipelineState,
        event: PipelineEvent,
    ) -> Result<TransitionOutcome, PipelineTransitionError>;
}

/// Generate, execute, then summarize. No backward edges.
#[derive(Clone, Debug, Default)]
pub struct QuestionAnsweringFlow;

impl PipelineDefinition for QuestionAnsweringFlow {
    fn initial_state(&self) -> PipelineState {
        PipelineState::Idle
    }

    fn transition(
        &self,
        current: PipelineState,
        event: PipelineEvent,
    ) -> Result<TransitionOutcome, PipelineTransitionError> {
        transition_question_answering(current, event)
    }
}

pub struct PipelineEngine<F> {
    flow: F,
}

impl<F> PipelineEngine<F>
where
    F: PipelineDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> PipelineState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: PipelineState,
        event: PipelineEvent,
    ) -> Result<TransitionOutcome, PipelineTransitionError> {
        self.flow.transition(current, event)
    }

    /// Folds a sequence of events from the initial state, stopping at the first rejection.
    pub fn replay<'a, I>(&self, events: I) -> Result<PipelineState, PipelineTransitionError>
    where
        I: IntoIterator<Item = &'a PipelineEvent>,
    {
        events
            .into_iter()
            .try_fold(self.initial_state(), |state, event| Ok(self.apply(state, *event)?.to))
    }
}

impl Default for PipelineEngine<QuestionAnsweringFlow> {
    fn default() -> Self {
        Self::new(QuestionAnsweringFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineTransitionError {
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: PipelineState, event: PipelineEvent },
}

fn transition_question_answering(
    current: PipelineState,
    event: PipelineEvent,
) -> Result<TransitionOutcome, PipelineTransitionError> {
    use PipelineAction::{ExecuteQuery, GenerateQuery, RecordExchange, ReportFailure, Summarize};
    use PipelineEvent::{AnswerReady, QueryGenerated, QuestionReceived, ResultsReady, StepFailed};
    use PipelineState::{Done, Executing, Failed, Generating, Idle, Summarizing};

    let (to, actions) = match (current, event) {
        (Idle, QuestionReceived) => (Generating, vec![GenerateQuery]),
        (Generating, QueryGenerated) => (Executing, vec![ExecuteQuery]),
        (Executing, ResultsReady) => (Summarizing, vec![Summarize]),
        (Summarizing, AnswerReady) => (Done, vec![RecordExchange]),
        (Generating | Executing | Summarizing, StepFailed) => (Failed, vec![ReportFailure]),
        _ => {
            return Err(PipelineTransitionError::InvalidTransition { state: current, event });
        }
    };

    Ok(TransitionOutcome { from: current, to, event, actions })
}

#[cfg(test)]
mod tests {
    use crate::pipeline::engine::{PipelineEngine, PipelineTransitionError};
    use crate::pipeline::states::{PipelineAction, PipelineEvent, PipelineState};

    const ALL_STATES: [PipelineState; 6] = [
        PipelineState::Idle,
        PipelineState::Generating,
        PipelineState::Executing,
        PipelineState::Summarizing,
        PipelineState::Done,
        PipelineState::Failed,
    ];

    const ALL_EVENTS: [PipelineEvent; 5] = [
        PipelineEvent::QuestionReceived,
        PipelineEvent::QueryGenerated,
        PipelineEvent::ResultsReady,
        PipelineEvent::AnswerReady,
        PipelineEvent::StepFailed,
    ];

    #[test]
    fn happy_path_reaches_done_and_records_exchange() {
        let engine = PipelineEngine::default();
        let mut state = engine.initial_state();
        assert_eq!(state, PipelineState::Idle);

        state = engine
            .apply(state, PipelineEvent::QuestionReceived)
            .expect("idle -> generating")
            .to;
        state = engine
            .apply(state, PipelineEvent::QueryGenerated)
            .expect("generating -> executing")
            .to;
        state = engine
            .apply(state, PipelineEvent::ResultsReady)
            .expect("executing -> summarizing")
            .to;
        let done = engine.apply(state, PipelineEvent::AnswerReady).expect("summarizing -> done");

        assert_eq!(done.to, PipelineState::Done);
        assert_eq!(done.actions, vec![PipelineAction::RecordExchange]);
    }

    #[test]
    fn every_working_state_can_fail() {
        let engine = PipelineEngine::default();
        for state in
            [PipelineState::Generating, PipelineState::Executing, PipelineState::Summarizing]
        {
            let outcome =
                engine.apply(state, PipelineEvent::StepFailed).expect("working state should fail");
            assert_eq!(outcome.to, PipelineState::Failed);
            assert_eq!(outcome.actions, vec![PipelineAction::ReportFailure]);
        }
    }

    #[test]
    fn idle_cannot_fail_and_cannot_skip_generation() {
        let engine = PipelineEngine::default();
        let error = engine
            .apply(PipelineState::Idle, PipelineEvent::StepFailed)
            .expect_err("idle has no running step");
        assert!(matches!(
            error,
            PipelineTransitionError::InvalidTransition {
                state: PipelineState::Idle,
                event: PipelineEvent::StepFailed
            }
        ));

        assert!(engine.apply(PipelineState::Idle, PipelineEvent::ResultsReady).is_err());
    }

    #[test]
    fn terminal_states_accept_no_events() {
        let engine = PipelineEngine::default();
        for state in ALL_STATES.into_iter().filter(|state| state.is_terminal()) {
            for event in ALL_EVENTS {
                assert!(
                    engine.apply(state, event).is_err(),
                    "{state:?} should reject {event:?}"
                );
            }
        }
    }

    #[test]
    fn only_forward_and_failure_edges_are_legal() {
        let engine = PipelineEngine::default();
        let legal = ALL_STATES
            .iter()
            .flat_map(|state| ALL_EVENTS.iter().map(move |event| (*state, *event)))
            .filter(|(state, event)| engine.apply(*state, *event).is_ok())
            .count();

        // four forward edges plus three failure edges
        assert_eq!(legal, 7);
    }

    #[test]
    fn replay_is_deterministic_for_same_event_sequence() {
        let engine = PipelineEngine::default();
        let events = [
            PipelineEvent::QuestionReceived,
            PipelineEvent::QueryGenerated,
            PipelineEvent::StepFailed,
        ];

        let first = engine.replay(&events).expect("replay");
        let second = engine.replay(&events).expect("replay");
        assert_eq!(first, PipelineState::Failed);
        assert_eq!(first, second);

        let rejected =
            engine.replay(&[PipelineEvent::QuestionReceived, PipelineEvent::AnswerReady]);
        assert!(rejected.is_err());
    }
}
