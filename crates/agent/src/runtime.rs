use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tally_core::config::PipelineConfig;
use tally_core::domain::answer::Answer;
use tally_core::domain::question::Question;
use tally_core::domain::result_set::Column;
use tally_core::domain::session::{Exchange, Session, SessionKey};
use tally_core::errors::{ApplicationError, DomainError, PipelineError};
use tally_core::pipeline::{
    PipelineAction, PipelineEngine, PipelineEvent, PipelineState, QuestionAnsweringFlow,
};
use tally_db::repositories::SessionRepository;
use tally_warehouse::Warehouse;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::conversation::ConversationContext;
use crate::execution::QueryExecutor;
use crate::generation::QueryGenerator;
use crate::guardrails::GuardrailPolicy;
use crate::llm::LlmClient;
use crate::prompts::{PromptError, Prompts};
use crate::summarize::Summarizer;

const PREVIEW_ROWS: usize = 10;

/// Progress of one run as seen by the client. Every run that is not cancelled
/// ends with exactly one `Completed` or `Failed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    StateChanged { from: PipelineState, to: PipelineState },
    QueryGenerated { sql: String, validated: bool },
    ResultsReady { columns: Vec<Column>, row_count: usize, preview: Vec<Map<String, Value>> },
    Completed { answer: Answer },
    Failed { error_class: String, message: String },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::QueryGenerated { .. } => "query_generated",
            Self::ResultsReady { .. } => "results_ready",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Completed(Answer),
    Failed(PipelineError),
    Cancelled,
}

/// Drives generation, execution and summarization through the pipeline state
/// machine for one question at a time. Cheap to share behind an `Arc`.
pub struct PipelineController {
    engine: PipelineEngine<QuestionAnsweringFlow>,
    generator: QueryGenerator,
    executor: QueryExecutor,
    summarizer: Summarizer,
    sessions: Arc<dyn SessionRepository>,
    history_turns: usize,
    preview_rows: usize,
}

struct RunScope<'a> {
    run_id: String,
    key: SessionKey,
    events: &'a mpsc::Sender<RunEvent>,
    state: PipelineState,
}

impl PipelineController {
    pub fn new(
        generator: QueryGenerator,
        executor: QueryExecutor,
        summarizer: Summarizer,
        sessions: Arc<dyn SessionRepository>,
        history_turns: usize,
        preview_rows: usize,
    ) -> Self {
        Self {
            engine: PipelineEngine::default(),
            generator,
            executor,
            summarizer,
            sessions,
            history_turns,
            preview_rows,
        }
    }

    /// Wires the three steps from configuration around shared clients.
    pub fn assemble(
        pipeline: &PipelineConfig,
        llm: Arc<dyn LlmClient>,
        warehouse: Arc<dyn Warehouse>,
        sessions: Arc<dyn SessionRepository>,
        schema: impl Into<String>,
    ) -> Result<Self, PromptError> {
        let prompts = Arc::new(Prompts::new()?);
        Ok(Self::new(
            QueryGenerator::new(
                llm.clone(),
                warehouse.clone(),
                prompts.clone(),
                schema,
                pipeline.max_fix_attempts,
            )
            .with_analysis_plan(pipeline.analysis_plan),
            QueryExecutor::new(warehouse, GuardrailPolicy::default()),
            Summarizer::new(llm, prompts, pipeline.max_result_rows, pipeline.max_chart_attempts),
            sessions,
            pipeline.history_turns,
            PREVIEW_ROWS,
        ))
    }

    pub fn sessions(&self) -> &Arc<dyn SessionRepository> {
        &self.sessions
    }

    pub async fn load_session(&self, key: &SessionKey) -> Result<Session, ApplicationError> {
        self.sessions.get(key).await?.ok_or_else(|| {
            ApplicationError::NotFound(format!("session `{}` not found", key.session_id.as_str()))
        })
    }

    /// Runs one question. Dropping the receiving half of `events` before the
    /// answer is committed cancels the run at its next suspension point;
    /// nothing further is emitted or recorded.
    pub async fn run(
        &self,
        session: &Session,
        question: &str,
        events: mpsc::Sender<RunEvent>,
    ) -> RunOutcome {
        let mut scope = RunScope {
            run_id: Uuid::new_v4().simple().to_string(),
            key: session.key(),
            events: &events,
            state: self.engine.initial_state(),
        };
        info!(
            event_name = "pipeline.started",
            correlation_id = %scope.run_id,
            session_id = %scope.key.session_id.as_str(),
            "pipeline run started"
        );

        let run_id = scope.run_id.clone();
        let driven = tokio::select! {
            biased;
            _ = events.closed() => Err(RunOutcome::Cancelled),
            driven = self.drive(&mut scope, session, question) => driven,
        };
        let outcome = match driven {
            Ok((answer, exchange)) => self.commit(&scope, answer, exchange).await,
            Err(outcome) => outcome,
        };

        if outcome == RunOutcome::Cancelled {
            info!(event_name = "pipeline.cancelled", correlation_id = %run_id, "client went away");
        }
        outcome
    }

    async fn drive(
        &self,
        scope: &mut RunScope<'_>,
        session: &Session,
        question: &str,
    ) -> Result<(Answer, Option<Exchange>), RunOutcome> {
        match self.steps(scope, session, question).await {
            Ok(finished) => Ok(finished),
            Err(PipelineError::Cancelled) => Err(RunOutcome::Cancelled),
            Err(error) => Err(self.report_failure(scope, error).await),
        }
    }

    /// Storing the exchange is the commit point. It runs outside the
    /// cancellation race: once stored, the run is completed even when the
    /// client leaves before `Completed` is delivered.
    async fn commit(
        &self,
        scope: &RunScope<'_>,
        answer: Answer,
        exchange: Option<Exchange>,
    ) -> RunOutcome {
        if scope.events.is_closed() {
            return RunOutcome::Cancelled;
        }
        if let Some(exchange) = exchange {
            if let Err(error) = self.sessions.append_exchange(&scope.key, exchange).await {
                warn!(
                    event_name = "pipeline.record_failed",
                    correlation_id = %scope.run_id,
                    error = %error,
                    "exchange not recorded"
                );
            }
        }

        if emit(scope, RunEvent::Completed { answer: answer.clone() }).await.is_err() {
            info!(
                event_name = "pipeline.completed_unseen",
                correlation_id = %scope.run_id,
                "client left before the answer was delivered"
            );
        }
        info!(
            event_name = "pipeline.completed",
            correlation_id = %scope.run_id,
            "pipeline run completed"
        );
        RunOutcome::Completed(answer)
    }

    async fn steps(
        &self,
        scope: &mut RunScope<'_>,
        session: &Session,
        question: &str,
    ) -> Result<(Answer, Option<Exchange>), PipelineError> {
        let question = Question::new(question)?;
        let context = ConversationContext::from_session(session, self.history_turns);

        self.advance(scope, PipelineEvent::QuestionReceived).await?;
        let query = self.generator.generate(&question, &context).await?;
        emit(
            scope,
            RunEvent::QueryGenerated { sql: query.sql.clone(), validated: query.is_validated() },
        )
        .await?;

        self.advance(scope, PipelineEvent::QueryGenerated).await?;
        let result = self.executor.execute(&query).await?;
        emit(
            scope,
            RunEvent::ResultsReady {
                columns: result.columns.clone(),
                row_count: result.row_count(),
                preview: result.preview_rows(self.preview_rows),
            },
        )
        .await?;

        self.advance(scope, PipelineEvent::ResultsReady).await?;
        let answer = self.summarizer.summarize(&question, &query, &result).await?;

        let actions = self.advance(scope, PipelineEvent::AnswerReady).await?;
        let exchange = actions.contains(&PipelineAction::RecordExchange).then(|| Exchange {
            question: question.to_string(),
            sql: query.sql.clone(),
            answer: answer.clone(),
            recorded_at: Utc::now(),
        });
        Ok((answer, exchange))
    }

    async fn advance(
        &self,
        scope: &mut RunScope<'_>,
        event: PipelineEvent,
    ) -> Result<Vec<PipelineAction>, PipelineError> {
        let outcome = self
            .engine
            .apply(scope.state, event)
            .map_err(|error| PipelineError::from(DomainError::from(error)))?;
        info!(
            event_name = "pipeline.state_changed",
            correlation_id = %scope.run_id,
            from = ?outcome.from,
            to = ?outcome.to,
            "pipeline state changed"
        );
        scope.state = outcome.to;
        emit(scope, RunEvent::StateChanged { from: outcome.from, to: outcome.to }).await?;
        Ok(outcome.actions)
    }

    async fn report_failure(&self, scope: &mut RunScope<'_>, error: PipelineError) -> RunOutcome {
        warn!(
            event_name = "pipeline.failed",
            correlation_id = %scope.run_id,
            error_class = error.error_class(),
            error = %error,
            "pipeline run failed"
        );
        // Failures before the first transition (an empty question) have no state edge.
        if scope.state != PipelineState::Idle && !scope.state.is_terminal() {
            let advanced = self.advance(scope, PipelineEvent::StepFailed).await;
            if let Err(PipelineError::Cancelled) = advanced {
                return RunOutcome::Cancelled;
            }
        }
        let terminal = RunEvent::Failed {
            error_class: error.error_class().to_owned(),
            message: error.to_string(),
        };
        match emit(scope, terminal).await {
            Ok(()) => RunOutcome::Failed(error),
            Err(_) => RunOutcome::Cancelled,
        }
    }
}

async fn emit(scope: &RunScope<'_>, event: RunEvent) -> Result<(), PipelineError> {
    scope.events.send(event).await.map_err(|_| PipelineError::Cancelled)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use tally_core::domain::session::{Exchange, Session, SessionId, SessionKey};
    use tally_core::pipeline::PipelineState;
    use tally_db::repositories::{InMemorySessionRepository, RepositoryError, SessionRepository};
    use tokio::sync::{mpsc, Notify};

    use super::{PipelineController, RunEvent, RunOutcome};
    use crate::execution::QueryExecutor;
    use crate::generation::QueryGenerator;
    use crate::guardrails::GuardrailPolicy;
    use crate::prompts::Prompts;
    use crate::summarize::Summarizer;
    use crate::testing::{default_response, FixtureWarehouse, PromptKind, ScriptedLlm};

    struct Harness {
        controller: Arc<PipelineController>,
        llm: Arc<ScriptedLlm>,
        warehouse: Arc<FixtureWarehouse>,
        sessions: Arc<InMemorySessionRepository>,
    }

    fn harness(llm: ScriptedLlm, warehouse: FixtureWarehouse) -> Harness {
        let llm = Arc::new(llm);
        let warehouse = Arc::new(warehouse);
        let sessions = Arc::new(InMemorySessionRepository::new());
        let prompts = Arc::new(Prompts::new().expect("prompts"));
        let controller = PipelineController::new(
            QueryGenerator::new(llm.clone(), warehouse.clone(), prompts.clone(), "{}", 3),
            QueryExecutor::new(warehouse.clone(), GuardrailPolicy::default()),
            Summarizer::new(llm.clone(), prompts, 50, 3),
            sessions.clone(),
            5,
            10,
        );
        Harness { controller: Arc::new(controller), llm, warehouse, sessions }
    }

    async fn session(sessions: &InMemorySessionRepository, id: &str) -> Session {
        sessions
            .create(SessionKey::new("crm_insights", "u-1", SessionId(id.to_owned())), Map::new())
            .await
            .expect("session")
    }

    async fn run_collect(
        controller: &PipelineController,
        session: &Session,
        question: &str,
    ) -> (RunOutcome, Vec<RunEvent>) {
        let (tx, mut rx) = mpsc::channel(32);
        let outcome = controller.run(session, question, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    fn states(events: &[RunEvent]) -> Vec<PipelineState> {
        events
            .iter()
            .filter_map(|event| match event {
                RunEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_run_walks_every_state_and_records_exchange() {
        let h = harness(ScriptedLlm::happy(), FixtureWarehouse::accounts());
        let session = session(&h.sessions, "s-1").await;

        let (outcome, events) = run_collect(&h.controller, &session, "Top accounts?").await;

        assert!(matches!(outcome, RunOutcome::Completed(ref answer) if !answer.text.is_empty()));
        assert_eq!(
            states(&events),
            vec![
                PipelineState::Generating,
                PipelineState::Executing,
                PipelineState::Summarizing,
                PipelineState::Done
            ]
        );
        let kinds: Vec<_> = events.iter().map(RunEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "state_changed",
                "query_generated",
                "state_changed",
                "results_ready",
                "state_changed",
                "state_changed",
                "completed"
            ]
        );
        assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
        assert!(matches!(events[3], RunEvent::ResultsReady { row_count: 3, .. }));

        let stored = h.sessions.get(&session.key()).await.expect("get").expect("present");
        assert_eq!(stored.exchanges.len(), 1);
        assert_eq!(stored.exchanges[0].question, "Top accounts?");
    }

    #[tokio::test]
    async fn execution_failure_skips_summarization() {
        let llm = ScriptedLlm::new(|kind, request| match kind {
            PromptKind::Generation | PromptKind::Correction => {
                Ok("```sql\nSELECT * FROM \"hive_catalog\".\"test_db\".\"Nope\"\n```".to_owned())
            }
            other => Ok(default_response(other, request)),
        });
        let h = harness(llm, FixtureWarehouse::accounts());
        let session = session(&h.sessions, "s-1").await;

        let (outcome, events) = run_collect(&h.controller, &session, "Show me nope").await;

        assert!(matches!(outcome, RunOutcome::Failed(_)));
        assert_eq!(
            states(&events),
            vec![PipelineState::Generating, PipelineState::Executing, PipelineState::Failed]
        );
        let Some(RunEvent::Failed { error_class, message }) = events.last() else {
            panic!("last event must be Failed");
        };
        assert_eq!(error_class, "execution_syntax");
        assert!(!message.is_empty());
        assert!(!h.llm.kinds().contains(&PromptKind::Summary));
        assert_eq!(h.warehouse.executed().len(), 1);
        let stored = h.sessions.get(&session.key()).await.expect("get").expect("present");
        assert!(stored.exchanges.is_empty());
    }

    #[tokio::test]
    async fn generation_failure_never_executes() {
        let llm = ScriptedLlm::new(|_, _| Err(crate::llm::LlmError::EmptyResponse));
        let h = harness(llm, FixtureWarehouse::accounts());
        let session = session(&h.sessions, "s-1").await;

        let (_, events) = run_collect(&h.controller, &session, "Anything").await;

        assert_eq!(states(&events), vec![PipelineState::Generating, PipelineState::Failed]);
        assert!(matches!(
            events.last(),
            Some(RunEvent::Failed { error_class, .. }) if error_class == "generation_failure"
        ));
        assert!(h.warehouse.statements().is_empty());
    }

    #[tokio::test]
    async fn blank_question_fails_without_transitions() {
        let h = harness(ScriptedLlm::happy(), FixtureWarehouse::accounts());
        let session = session(&h.sessions, "s-1").await;

        let (_, events) = run_collect(&h.controller, &session, "   ").await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RunEvent::Failed { error_class, .. } if error_class == "invalid_question"
        ));
        assert!(h.llm.kinds().is_empty());
    }

    #[tokio::test]
    async fn concurrent_runs_stay_isolated() {
        let h = harness(ScriptedLlm::happy(), FixtureWarehouse::accounts());
        let first = session(&h.sessions, "s-1").await;
        let second = session(&h.sessions, "s-2").await;

        let ((_, first_events), (_, second_events)) = tokio::join!(
            run_collect(&h.controller, &first, "Question one"),
            run_collect(&h.controller, &second, "Question two"),
        );

        let answer = |events: &[RunEvent]| match events.last() {
            Some(RunEvent::Completed { answer }) => answer.text.clone(),
            other => panic!("unexpected terminal event {other:?}"),
        };
        assert_eq!(answer(&first_events), "Answer for: Question one");
        assert_eq!(answer(&second_events), "Answer for: Question two");

        let first_stored = h.sessions.get(&first.key()).await.expect("get").expect("present");
        let second_stored = h.sessions.get(&second.key()).await.expect("get").expect("present");
        assert_eq!(first_stored.exchanges.len(), 1);
        assert_eq!(first_stored.exchanges[0].question, "Question one");
        assert_eq!(second_stored.exchanges[0].question, "Question two");
    }

    #[tokio::test]
    async fn history_reaches_the_generation_prompt() {
        let h = harness(ScriptedLlm::happy(), FixtureWarehouse::accounts());
        let created = session(&h.sessions, "s-1").await;
        run_collect(&h.controller, &created, "How many accounts?").await;

        let reloaded = h.controller.load_session(&created.key()).await.expect("session");
        run_collect(&h.controller, &reloaded, "And their revenue?").await;

        let prompts = h.llm.requests(PromptKind::Generation);
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].user_text().contains("Earlier in this conversation"));
        assert!(prompts[1].user_text().contains("- Question: How many accounts?"));
    }

    #[tokio::test]
    async fn dropping_the_receiver_cancels_and_records_nothing() {
        let h = harness(ScriptedLlm::happy().holding_generation(), FixtureWarehouse::accounts());
        let session = session(&h.sessions, "s-1").await;
        let (tx, mut rx) = mpsc::channel(8);

        let controller = h.controller.clone();
        let run_session = session.clone();
        let handle =
            tokio::spawn(async move { controller.run(&run_session, "Slow question", tx).await });

        let first = rx.recv().await.expect("first event");
        assert!(matches!(first, RunEvent::StateChanged { to: PipelineState::Generating, .. }));
        drop(rx);

        let outcome = handle.await.expect("join");
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(h.warehouse.statements().is_empty());
        let stored = h.sessions.get(&session.key()).await.expect("get").expect("present");
        assert!(stored.exchanges.is_empty());
    }

    /// Holds `append_exchange` until released.
    struct GatedSessions {
        inner: InMemorySessionRepository,
        entered: Arc<Notify>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl SessionRepository for GatedSessions {
        async fn create(
            &self,
            key: SessionKey,
            state: Map<String, Value>,
        ) -> Result<Session, RepositoryError> {
            self.inner.create(key, state).await
        }

        async fn get(&self, key: &SessionKey) -> Result<Option<Session>, RepositoryError> {
            self.inner.get(key).await
        }

        async fn list(
            &self,
            app_name: &str,
            user_id: &str,
        ) -> Result<Vec<Session>, RepositoryError> {
            self.inner.list(app_name, user_id).await
        }

        async fn delete(&self, key: &SessionKey) -> Result<bool, RepositoryError> {
            self.inner.delete(key).await
        }

        async fn append_exchange(
            &self,
            key: &SessionKey,
            exchange: Exchange,
        ) -> Result<(), RepositoryError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.append_exchange(key, exchange).await
        }
    }

    #[tokio::test]
    async fn recorded_exchange_completes_even_if_client_leaves() {
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let sessions = Arc::new(GatedSessions {
            inner: InMemorySessionRepository::new(),
            entered: entered.clone(),
            gate: gate.clone(),
        });
        let llm = Arc::new(ScriptedLlm::happy());
        let warehouse = Arc::new(FixtureWarehouse::accounts());
        let prompts = Arc::new(Prompts::new().expect("prompts"));
        let controller = Arc::new(PipelineController::new(
            QueryGenerator::new(llm.clone(), warehouse.clone(), prompts.clone(), "{}", 3),
            QueryExecutor::new(warehouse, GuardrailPolicy::default()),
            Summarizer::new(llm, prompts, 50, 3),
            sessions.clone(),
            5,
            10,
        ));
        let session = sessions
            .create(SessionKey::new("crm_insights", "u-1", SessionId("s-1".to_owned())), Map::new())
            .await
            .expect("session");

        let (tx, mut rx) = mpsc::channel(32);
        let run_session = session.clone();
        let runner = controller.clone();
        let handle =
            tokio::spawn(async move { runner.run(&run_session, "Top accounts?", tx).await });

        while let Some(event) = rx.recv().await {
            if matches!(event, RunEvent::StateChanged { to: PipelineState::Done, .. }) {
                break;
            }
        }
        entered.notified().await;
        drop(rx);
        gate.notify_one();

        let outcome = handle.await.expect("join");
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        let stored = sessions.get(&session.key()).await.expect("get").expect("present");
        assert_eq!(stored.exchanges.len(), 1);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let h = harness(ScriptedLlm::happy(), FixtureWarehouse::accounts());
        let error = h
            .controller
            .load_session(&SessionKey::new("crm_insights", "u-1", SessionId("missing".to_owned())))
            .await
            .expect_err("missing");
        assert!(matches!(error, tally_core::errors::ApplicationError::NotFound(_)));
    }
}
