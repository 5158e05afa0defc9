//! runops CLI client.
//!
//! Each query becomes a runops task: `runops tasks create -t <target> -m <message> -s <sql>`.
//! The task prints its result as tab-separated text, or a `https://` link to the
//! result when the output is too large to print inline.

use super::{QueryExecutor, ResultSet};
use crate::error::{ProxyError, ProxyResult};
use async_trait::async_trait;
use humansize::{DECIMAL, format_size};
use regex::Regex;
use std::process::{Output, Stdio};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_RUNOPS_BIN: &str = "runops";
pub const DEFAULT_TASK_MESSAGE: &str = "Fake SQL";
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 300;

const LOGIN_SUGGESTION: &str =
    "Make sure the runops CLI is installed, you are logged in and the target exists";

/// `ERROR 1146 (42S02) at line 1: Table 'x' doesn't exist`
static SQL_ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ERROR (\d+)(?: \(([0-9A-Za-z]{5})\))?(?: at line \d+)?: (.*)$")
        .expect("valid SQL error regex")
});

/// Settings shared by every runops client of the process.
#[derive(Debug, Clone)]
pub struct RunopsSettings {
    /// Path or name of the runops binary.
    pub binary: String,
    /// Message attached to every task.
    pub task_message: String,
    pub query_timeout: Duration,
}

impl Default for RunopsSettings {
    fn default() -> Self {
        Self {
            binary: DEFAULT_RUNOPS_BIN.to_string(),
            task_message: DEFAULT_TASK_MESSAGE.to_string(),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }
}

/// Executes queries as runops tasks against a single target.
#[derive(Debug, Clone)]
pub struct RunopsClient {
    settings: Arc<RunopsSettings>,
    target: String,
    http: reqwest::Client,
}

impl RunopsClient {
    pub fn new(settings: Arc<RunopsSettings>, target: impl Into<String>) -> Self {
        Self {
            settings,
            target: target.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn run_task(&self, query: &str) -> ProxyResult<Output> {
        let mut command = Command::new(&self.settings.binary);
        command
            .arg("tasks")
            .arg("create")
            .arg("-t")
            .arg(&self.target)
            .arg("-m")
            .arg(&self.settings.task_message)
            .arg("-s")
            .arg(query)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let secs = self.settings.query_timeout.as_secs();
        match timeout(self.settings.query_timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ProxyError::runops(
                format!("could not start '{}': {}", self.settings.binary, e),
                LOGIN_SUGGESTION,
            )),
            Err(_) => Err(ProxyError::timeout("runops task", secs)),
        }
    }

    async fn fetch(&self, url: Url) -> ProxyResult<String> {
        debug!(url = %url, "Downloading task result");
        let body = self
            .http
            .get(url)
            .timeout(self.settings.query_timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

#[async_trait]
impl QueryExecutor for RunopsClient {
    async fn query(&mut self, query: &str) -> ProxyResult<Option<ResultSet>> {
        info!(target_name = %self.target, "Creating runops task");
        let output = self.run_task(query).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some(err) = find_sql_error(&stderr) {
            return Err(err);
        }

        if !output.status.success() {
            // stdout is only an error report when the task failed; otherwise it is data
            if let Some(err) = find_sql_error(&stdout) {
                return Err(err);
            }
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            warn!(status = %output.status, "runops task failed");
            return Err(ProxyError::runops(
                format!("{} ({})", message, output.status),
                LOGIN_SUGGESTION,
            ));
        }

        let body = match result_url(&stdout)? {
            Some(url) => self.fetch(url).await?,
            None => stdout.into_owned(),
        };

        debug!(size = %format_size(body.len(), DECIMAL), "Task result received");
        Ok(Some(ResultSet::from_tsv(&body)))
    }
}

/// Extract the result link when runops printed one instead of the result.
fn result_url(stdout: &str) -> ProxyResult<Option<Url>> {
    let trimmed = stdout.trim();
    if !trimmed.starts_with("https://") {
        return Ok(None);
    }
    Ok(Some(Url::parse(trimmed)?))
}

/// Look for a mysql client error line in task output.
fn find_sql_error(output: &str) -> Option<ProxyError> {
    output.lines().find_map(|line| {
        let caps = SQL_ERROR_LINE.captures(line.trim())?;
        let code = caps.get(1).and_then(|m| m.as_str().parse().ok());
        let sql_state = caps.get(2).map(|m| m.as_str().to_string());
        let message = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        Some(ProxyError::sql(code, sql_state, message))
    })
}
