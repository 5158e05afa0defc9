use super::{QueryExecutor, ResultSet};
use crate::error::ProxyResult;
use async_trait::async_trait;
use tracing::debug;

/// Statements answered locally with an empty OK instead of being sent to runops.
const FILTERED_STATEMENTS: &[&str] = &["SHOW WARNINGS"];

pub struct QueryFilter<T>(T);

impl<T> QueryFilter<T> {
    pub fn new(executor: T) -> Self {
        Self(executor)
    }
}

fn is_filtered(query: &str) -> bool {
    let statement = query.trim().trim_end_matches(';').trim_end();
    FILTERED_STATEMENTS
        .iter()
        .any(|filtered| statement.eq_ignore_ascii_case(filtered))
}

#[async_trait]
impl<T> QueryExecutor for QueryFilter<T>
where
    T: QueryExecutor,
{
    async fn query(&mut self, query: &str) -> ProxyResult<Option<ResultSet>> {
        if is_filtered(query) {
            debug!(statement = %query, "Statement filtered");
            return Ok(None);
        }

        self.0.query(query).await
    }
}
