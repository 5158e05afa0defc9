//! Session state replay.
//!
//! Every runops task runs in a fresh database session, so statements that only
//! change session state (`SET ...`, `USE ...`) would be lost between queries.
//! The accumulator remembers them and replays them in front of every query.

use super::{QueryExecutor, ResultSet, leading_keyword};
use crate::error::ProxyResult;
use async_trait::async_trait;
use tracing::debug;

pub struct QueryAccumulator<T> {
    executor: T,
    database: Option<String>,
    statements: Vec<String>,
}

impl<T> QueryAccumulator<T> {
    pub fn new(executor: T) -> Self {
        Self {
            executor,
            database: None,
            statements: Vec::new(),
        }
    }

    /// Remembered `SET` statements, oldest first.
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Remembered `USE` statement, if any.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    fn remember(&mut self, statement: &str) {
        let statement = statement.trim().trim_end_matches(';').trim_end().to_string();
        // A repeated statement moves to the end so it wins over earlier ones.
        self.statements.retain(|existing| *existing != statement);
        self.statements.push(statement);
    }

    fn prefixed(&self, query: &str) -> Option<String> {
        if self.database.is_none() && self.statements.is_empty() {
            return None;
        }
        let mut script = String::new();
        for statement in self.database.iter().chain(self.statements.iter()) {
            script.push_str(statement);
            script.push_str(";\n");
        }
        script.push_str(query);
        Some(script)
    }
}

#[async_trait]
impl<T> QueryExecutor for QueryAccumulator<T>
where
    T: QueryExecutor,
{
    async fn query(&mut self, query: &str) -> ProxyResult<Option<ResultSet>> {
        match leading_keyword(query).as_str() {
            "set" => {
                debug!(statement = %query, "Remembering session variable");
                self.remember(query);
                return Ok(None);
            }
            "use" => {
                debug!(statement = %query, "Remembering default database");
                self.database = Some(query.trim().trim_end_matches(';').trim_end().to_string());
                return Ok(None);
            }
            _ => {}
        }

        match self.prefixed(query) {
            Some(script) => self.executor.query(&script).await,
            None => self.executor.query(query).await,
        }
    }
}
