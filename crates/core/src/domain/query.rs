use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryValidation {
    Validated,
    /// Every EXPLAIN attempt failed; the query is still handed to execution.
    Unvalidated { last_error: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub sql: String,
    pub validation: QueryValidation,
}

impl GeneratedQuery {
    pub fn validated(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), validation: QueryValidation::Validated }
    }

    pub fn unvalidated(sql: impl Into<String>, last_error: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            validation: QueryValidation::Unvalidated { last_error: last_error.into() },
        }
    }

    pub fn is_validated(&self) -> bool {
        matches!(self.validation, QueryValidation::Validated)
    }
}

/// Pulls SQL out of model output: the last ```sql fence, else the first fence
/// of any language, else the whole trimmed text.
pub fn extract_sql(text: &str) -> String {
    let fences = fenced_blocks(text);

    let chosen = fences
        .iter()
        .rev()
        .find(|(language, _)| language.eq_ignore_ascii_case("sql"))
        .or_else(|| fences.first())
        .map(|(_, body)| body.as_str())
        .unwrap_or(text);

    chosen.trim().to_owned()
}

fn fenced_blocks(text: &str) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("```") {
        let after_ticks = &rest[start + 3..];
        let (language, body_start) = match after_ticks.find('\n') {
            Some(newline) => (after_ticks[..newline].trim().to_owned(), newline + 1),
            None => break,
        };
        let body = &after_ticks[body_start..];
        let Some(end) = body.find("```") else {
            break;
        };
        blocks.push((language, body[..end].to_owned()));
        rest = &body[end + 3..];
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::{extract_sql, GeneratedQuery, QueryValidation};

    #[test]
    fn last_sql_fence_wins() {
        let text = concat!(
            "First try:\n```sql\nSELECT 1\n```\n",
            "Better:\n```sql\nSELECT \"Name\" FROM \"hive_catalog\".\"test_db\".\"Account\"\n```\n",
        );
        assert_eq!(
            extract_sql(text),
            "SELECT \"Name\" FROM \"hive_catalog\".\"test_db\".\"Account\""
        );
    }

    #[test]
    fn first_untagged_fence_is_used_without_sql_fence() {
        let text = "```\nSELECT count(*) FROM t\n```\n```python\nprint(1)\n```";
        assert_eq!(extract_sql(text), "SELECT count(*) FROM t");
    }

    #[test]
    fn plain_text_is_trimmed() {
        assert_eq!(extract_sql("  SELECT 42  \n"), "SELECT 42");
    }

    #[test]
    fn unterminated_fence_falls_back_to_text() {
        let text = "```sql\nSELECT 1";
        assert_eq!(extract_sql(text), text);
    }

    #[test]
    fn validation_marker_serializes_with_status_tag() {
        let query = GeneratedQuery::unvalidated("SELECT 1", "line 1: table not found");
        let json = serde_json::to_value(&query).expect("serialize");
        assert_eq!(json["validation"]["status"], "unvalidated");
        assert_eq!(json["validation"]["last_error"], "line 1: table not found");
        assert!(!query.is_validated());
        assert_eq!(GeneratedQuery::validated("SELECT 1").validation, QueryValidation::Validated);
    }
}
