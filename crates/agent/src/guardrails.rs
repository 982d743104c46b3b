//! Read-only gate in front of the warehouse. Model-written SQL is only ever
//! allowed to read.

const READ_ONLY_KEYWORDS: [&str; 6] = ["SELECT", "WITH", "SHOW", "DESCRIBE", "EXPLAIN", "VALUES"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow { statements: Vec<String> },
    Deny { reason_code: &'static str, user_message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub allowed_keywords: Vec<String>,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self {
            allowed_keywords: READ_ONLY_KEYWORDS.iter().map(|word| (*word).to_owned()).collect(),
        }
    }
}

impl GuardrailPolicy {
    /// Splits `sql` into statements and allows it only when every statement
    /// starts with a read-only keyword. Comments are ignored.
    pub fn evaluate(&self, sql: &str) -> GuardrailDecision {
        let statements = split_statements(sql);
        if statements.is_empty() {
            return GuardrailDecision::Deny {
                reason_code: "empty_statement",
                user_message: "The generated query contained no SQL statement.".to_owned(),
            };
        }

        for statement in &statements {
            let keyword = statement_keyword(statement);
            if !self.allowed_keywords.iter().any(|allowed| allowed.eq_ignore_ascii_case(&keyword)) {
                return GuardrailDecision::Deny {
                    reason_code: "write_statement",
                    user_message: format!(
                        "Only read-only queries may run against the warehouse; \
                         refused a `{}` statement.",
                        if keyword.is_empty() { "unknown" } else { keyword.as_str() }
                    ),
                };
            }
        }

        GuardrailDecision::Allow { statements }
    }
}

/// `EXPLAIN ANALYZE` runs the statement it wraps, so an explained statement is
/// judged by the statement inside it.
fn statement_keyword(statement: &str) -> String {
    let keyword = leading_keyword(statement);
    if keyword != "EXPLAIN" {
        return keyword;
    }
    let inner = explained_statement(statement);
    if inner.is_empty() {
        keyword
    } else {
        statement_keyword(inner)
    }
}

/// Skips `EXPLAIN` and its `ANALYZE`, `VERBOSE` and `(TYPE ..., FORMAT ...)` options.
fn explained_statement(statement: &str) -> &str {
    let trimmed = statement.trim_start_matches(|ch: char| ch == '(' || ch.is_whitespace());
    let mut rest = strip_word(trimmed, "EXPLAIN").unwrap_or(trimmed);
    loop {
        rest = rest.trim_start();
        if let Some(after) = strip_word(rest, "ANALYZE").or_else(|| strip_word(rest, "VERBOSE")) {
            rest = after;
            continue;
        }
        if let Some(options) = rest.strip_prefix('(') {
            let first = leading_keyword(options);
            if first == "TYPE" || first == "FORMAT" {
                if let Some(close) = options.find(')') {
                    rest = &options[close + 1..];
                    continue;
                }
            }
        }
        return rest;
    }
}

fn strip_word<'a>(text: &'a str, word: &str) -> Option<&'a str> {
    let head = text.get(..word.len())?;
    let rest = &text[word.len()..];
    let boundary =
        rest.chars().next().map_or(true, |ch| !(ch.is_ascii_alphanumeric() || ch == '_'));
    (head.eq_ignore_ascii_case(word) && boundary).then_some(rest)
}

fn leading_keyword(statement: &str) -> String {
    statement
        .trim_start_matches(|ch: char| ch == '(' || ch.is_whitespace())
        .chars()
        .take_while(|ch| ch.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Statement texts with comments removed, split on `;` outside quotes.
/// Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(ch) = chars.next() {
        if let Some(open) = quote {
            current.push(ch);
            if ch == open {
                // Doubled quote is an escaped quote.
                if chars.peek() == Some(&open) {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                } else {
                    quote = None;
                }
            }
            continue;
        }

        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                current.push(' ');
            }
            ';' => {
                push_statement(&mut statements, &mut current);
            }
            _ => current.push(ch),
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_owned());
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::{split_statements, GuardrailDecision, GuardrailPolicy};

    fn reason(decision: GuardrailDecision) -> &'static str {
        match decision {
            GuardrailDecision::Allow { .. } => "allow",
            GuardrailDecision::Deny { reason_code, .. } => reason_code,
        }
    }

    #[test]
    fn read_only_statements_are_allowed() {
        let policy = GuardrailPolicy::default();
        for sql in [
            "SELECT 1",
            "  with t as (select 1) select * from t",
            "SHOW TABLES FROM \"c\".\"d\"",
            "DESCRIBE \"c\".\"d\".\"Account\"",
            "EXPLAIN SELECT 1",
            "(SELECT 1) UNION ALL (SELECT 2)",
            "-- leading comment\nSELECT 2;",
        ] {
            assert_eq!(reason(policy.evaluate(sql)), "allow", "{sql}");
        }
    }

    #[test]
    fn writes_are_denied_even_after_a_read() {
        let policy = GuardrailPolicy::default();
        assert_eq!(reason(policy.evaluate("DROP TABLE Account")), "write_statement");
        assert_eq!(
            reason(policy.evaluate("SELECT 1; DELETE FROM \"c\".\"d\".\"Lead\"")),
            "write_statement"
        );
        assert_eq!(
            reason(policy.evaluate("/* hidden */ INSERT INTO t VALUES (1)")),
            "write_statement"
        );
        assert_eq!(reason(policy.evaluate("  ;  -- nothing\n")), "empty_statement");
    }

    #[test]
    fn explain_is_judged_by_the_statement_it_wraps() {
        let policy = GuardrailPolicy::default();
        for sql in [
            "EXPLAIN ANALYZE DELETE FROM \"c\".\"d\".\"Account\"",
            "explain analyze insert into t values (1)",
            "EXPLAIN ANALYZE VERBOSE UPDATE t SET x = 1",
            "EXPLAIN (TYPE DISTRIBUTED, FORMAT TEXT) DROP TABLE t",
            "EXPLAIN /* plan */ ANALYZE DELETE FROM t",
        ] {
            assert_eq!(reason(policy.evaluate(sql)), "write_statement", "{sql}");
        }

        for sql in [
            "EXPLAIN ANALYZE SELECT 1",
            "EXPLAIN (FORMAT JSON) SELECT * FROM t",
            "EXPLAIN (SELECT 1)",
            "EXPLAIN ANALYZE VERBOSE WITH t AS (SELECT 1) SELECT * FROM t",
            "EXPLAIN",
        ] {
            assert_eq!(reason(policy.evaluate(sql)), "allow", "{sql}");
        }
    }

    #[test]
    fn explain_denial_names_the_wrapped_keyword() {
        let decision = GuardrailPolicy::default().evaluate("EXPLAIN ANALYZE DELETE FROM t");
        let GuardrailDecision::Deny { user_message, .. } = decision else {
            panic!("explain analyze delete must be denied");
        };
        assert!(user_message.contains("`DELETE`"));
    }

    #[test]
    fn denial_message_names_the_keyword() {
        let decision = GuardrailPolicy::default().evaluate("update Account set Name = 'x'");
        let GuardrailDecision::Deny { user_message, .. } = decision else {
            panic!("update must be denied");
        };
        assert!(user_message.contains("`UPDATE`"));
    }

    #[test]
    fn semicolons_and_comment_markers_inside_quotes_do_not_split() {
        let statements = split_statements(
            "SELECT 'a;b' AS x, '--not a comment' AS y FROM \"we;ird\"; SELECT 'it''s'",
        );
        assert_eq!(
            statements,
            vec![
                "SELECT 'a;b' AS x, '--not a comment' AS y FROM \"we;ird\"".to_owned(),
                "SELECT 'it''s'".to_owned(),
            ]
        );
    }
}
