use super::values;
use crate::error::{ProxyError, ProxyResult};
use crate::executor::{QueryExecutor, ResultSet};
use async_trait::async_trait;
use opensrv_mysql::{
    AsyncMysqlShim, Column, ColumnFlags, ColumnType, ErrorKind, InitWriter, OkResponse,
    ParamParser, QueryResultWriter, StatementMetaWriter,
};
use std::collections::HashMap;
use std::io;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

/// A statement prepared by the client, kept until it is closed.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub query: String,
    pub param_count: usize,
}

/// opensrv shim that adapts the MySQL protocol to a [`QueryExecutor`].
///
/// One instance is created per connection and owns that connection's
/// executor chain and prepared statements.
pub struct ProxyShim<E> {
    executor: E,
    statements: HashMap<u32, PreparedStatement>,
    next_statement_id: u32,
}

impl<E> ProxyShim<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            statements: HashMap::new(),
            next_statement_id: 1,
        }
    }

    fn register(&mut self, statement: PreparedStatement) -> u32 {
        let id = self.next_statement_id;
        self.next_statement_id = self.next_statement_id.checked_add(1).unwrap_or(1);
        self.statements.insert(id, statement);
        id
    }
}

impl<E> ProxyShim<E>
where
    E: QueryExecutor,
{
    async fn execute_prepared(
        &mut self,
        id: u32,
        params: ParamParser<'_>,
    ) -> ProxyResult<Option<ResultSet>> {
        let statement = self
            .statements
            .get(&id)
            .ok_or_else(|| ProxyError::statement_not_found(id))?;

        let literals = params
            .into_iter()
            .map(|param| values::param_literal(param.value.into_inner()))
            .collect::<ProxyResult<Vec<String>>>()?;
        let query = values::bind_placeholders(&statement.query, &literals)?;

        debug!(
            statement_id = id,
            params = statement.param_count,
            "Executing prepared statement"
        );
        self.executor.query(&query).await
    }
}

/// ERR packet kind for a pipeline error.
pub fn error_kind(err: &ProxyError) -> ErrorKind {
    match err {
        ProxyError::Sql { .. } => ErrorKind::ER_ERROR_ON_READ,
        ProxyError::Timeout { .. } => ErrorKind::ER_QUERY_INTERRUPTED,
        ProxyError::StatementNotFound { .. } => ErrorKind::ER_UNKNOWN_STMT_HANDLER,
        ProxyError::InvalidInput { .. } => ErrorKind::ER_WRONG_ARGUMENTS,
        _ => ErrorKind::ER_UNKNOWN_ERROR,
    }
}

fn error_message(err: &ProxyError) -> String {
    match err.suggestion() {
        Some(suggestion) => format!("{}. {}", err, suggestion),
        None => err.to_string(),
    }
}

async fn write_outcome<W>(
    outcome: ProxyResult<Option<ResultSet>>,
    results: QueryResultWriter<'_, W>,
    binary: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    match outcome {
        Ok(Some(mut result)) if result.has_columns() => {
            let columns = values::result_columns(&mut result, binary);
            debug!(
                columns = columns.len(),
                rows = result.rows.len(),
                "Sending result set"
            );
            let mut rows = results.start(&columns).await?;
            for row in result.rows {
                rows.write_row(row).await?;
            }
            rows.finish().await
        }
        Ok(_) => results.completed(OkResponse::default()).await,
        Err(e) => {
            warn!(error = %e, retryable = e.is_retryable(), "Query failed");
            results
                .error(error_kind(&e), error_message(&e).as_bytes())
                .await
        }
    }
}

#[async_trait]
impl<E, W> AsyncMysqlShim<W> for ProxyShim<E>
where
    E: QueryExecutor,
    W: AsyncWrite + Send + Unpin,
{
    type Error = io::Error;

    async fn on_prepare<'a>(
        &'a mut self,
        query: &'a str,
        info: StatementMetaWriter<'a, W>,
    ) -> Result<(), Self::Error> {
        let param_count = values::count_placeholders(query);
        let id = self.register(PreparedStatement {
            query: query.to_string(),
            param_count,
        });
        debug!(statement_id = id, params = param_count, "Statement prepared");

        let params: Vec<Column> = (0..param_count)
            .map(|_| Column {
                table: String::new(),
                column: "?".to_string(),
                coltype: ColumnType::MYSQL_TYPE_VAR_STRING,
                colflags: ColumnFlags::empty(),
            })
            .collect();
        let columns: Vec<Column> = Vec::new();
        info.reply(id, &params, &columns).await
    }

    async fn on_execute<'a>(
        &'a mut self,
        id: u32,
        params: ParamParser<'a>,
        results: QueryResultWriter<'a, W>,
    ) -> Result<(), Self::Error> {
        let outcome = self.execute_prepared(id, params).await;
        write_outcome(outcome, results, true).await
    }

    async fn on_close<'a>(&'a mut self, stmt: u32)
    where
        W: 'async_trait,
    {
        if self.statements.remove(&stmt).is_some() {
            debug!(statement_id = stmt, "Statement closed");
        }
    }

    async fn on_query<'a>(
        &'a mut self,
        query: &'a str,
        results: QueryResultWriter<'a, W>,
    ) -> Result<(), Self::Error> {
        debug!(sql = %query, "Query received");
        let outcome = self.executor.query(query).await;
        write_outcome(outcome, results, false).await
    }

    async fn on_init<'a>(
        &'a mut self,
        database: &'a str,
        w: InitWriter<'a, W>,
    ) -> Result<(), Self::Error> {
        let statement = format!("USE `{}`", database.replace('`', "``"));
        match self.executor.query(&statement).await {
            Ok(_) => w.ok().await,
            Err(e) => {
                warn!(error = %e, database, "Changing database failed");
                w.error(error_kind(&e), error_message(&e).as_bytes()).await
            }
        }
    }
}
