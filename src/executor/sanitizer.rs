//! Query cleanup before forwarding.
//!
//! GUI clients decorate their queries with comment headers and reference
//! server variables the targets do not know about.

use super::{QueryExecutor, ResultSet};
use crate::error::ProxyResult;
use async_trait::async_trait;

pub struct QuerySanitizer<T>(T);

impl<T> QuerySanitizer<T> {
    pub fn new(executor: T) -> Self {
        Self(executor)
    }
}

#[async_trait]
impl<T> QueryExecutor for QuerySanitizer<T>
where
    T: QueryExecutor,
{
    async fn query(&mut self, query: &str) -> ProxyResult<Option<ResultSet>> {
        let query = sanitize(query);
        self.0.query(&query).await
    }
}

/// Strip leading block comments and comment lines, and replace `@@language`.
pub fn sanitize(query: &str) -> String {
    let query = strip_leading_block_comments(query.trim());
    query
        .trim()
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("--"))
        .filter(|line| !line.starts_with('#'))
        .collect::<Vec<&str>>()
        .join("\n")
        .replace("@@language", "'english'")
}

fn strip_leading_block_comments(mut query: &str) -> &str {
    while let Some(rest) = query.strip_prefix("/*") {
        match rest.find("*/") {
            Some(end) => query = rest[end + 2..].trim_start(),
            // Unterminated comment: nothing executable follows.
            None => return "",
        }
    }
    query
}
