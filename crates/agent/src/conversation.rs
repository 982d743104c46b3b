use tally_core::domain::session::{Exchange, Session};

use crate::prompts::HistoryTurn;

const MAX_ANSWER_CHARS: usize = 600;

/// Earlier exchanges of a session, trimmed to what the generation prompt needs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationContext {
    turns: Vec<HistoryTurn>,
}

impl ConversationContext {
    pub fn from_session(session: &Session, turns: usize) -> Self {
        Self::from_exchanges(session.recent_exchanges(turns))
    }

    pub fn from_exchanges(exchanges: &[Exchange]) -> Self {
        Self {
            turns: exchanges
                .iter()
                .map(|exchange| HistoryTurn {
                    question: exchange.question.clone(),
                    sql: collapse_whitespace(&exchange.sql),
                    answer: truncate_chars(exchange.answer.text.trim(), MAX_ANSWER_CHARS),
                })
                .collect(),
        }
    }

    pub fn turns(&self) -> &[HistoryTurn] {
        &self.turns
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_owned(),
    }
}
