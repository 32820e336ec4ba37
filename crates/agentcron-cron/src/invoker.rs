//! Agent invocation backends.
//!
//! The executor hands every admitted run to an [`AgentInvoker`]. Two
//! backends ship: spawning a local command and POSTing to an HTTP agent
//! service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use agentcron_config::InvokerConfig;
use agentcron_types::TriggerKind;

/// Lines of stdout/stderr kept when summarising command output.
const OUTPUT_TAIL_LINES: usize = 20;

/// Everything an agent needs to know about one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub execution_id: String,
    pub task_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub trigger: TriggerKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Completed { summary: Option<String> },
    /// The run observed its cancellation token and stopped.
    Cancelled,
}

/// Runs an agent to completion.
///
/// Implementations must watch `cancel` and return
/// [`InvocationOutcome::Cancelled`] promptly once it fires.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<InvocationOutcome>;
}

/// Build the invoker selected by configuration.
pub fn from_config(config: &InvokerConfig) -> anyhow::Result<Arc<dyn AgentInvoker>> {
    match config {
        InvokerConfig::Command {
            program,
            args,
            timeout_secs,
        } => Ok(Arc::new(CommandInvoker::new(
            program.clone(),
            args.clone(),
            timeout_secs.map(Duration::from_secs),
        ))),
        InvokerConfig::Http {
            url,
            auth_token,
            timeout_secs,
        } => Ok(Arc::new(HttpInvoker::new(
            url.clone(),
            auth_token.clone(),
            timeout_secs.map(Duration::from_secs),
        )?)),
    }
}

// ──────────────────── Command ────────────────────

/// Spawns `program args...` per run, in the task's project directory.
pub struct CommandInvoker {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandInvoker {
    pub fn new(program: String, args: Vec<String>, timeout: Option<Duration>) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    fn render_arg(arg: &str, request: &InvocationRequest) -> String {
        arg.replace("{agent_id}", &request.agent_id)
            .replace("{task_id}", &request.task_id)
            .replace("{execution_id}", &request.execution_id)
            .replace(
                "{project_path}",
                request.project_path.as_deref().unwrap_or("."),
            )
    }
}

#[async_trait]
impl AgentInvoker for CommandInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<InvocationOutcome> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.args.iter().map(|a| Self::render_arg(a, request)));
        if let Some(dir) = &request.project_path {
            cmd.current_dir(dir);
        }
        cmd.env("AGENTCRON_EXECUTION_ID", &request.execution_id)
            .env("AGENTCRON_TASK_ID", &request.task_id)
            .env("AGENTCRON_AGENT_ID", &request.agent_id)
            .env("AGENTCRON_TRIGGER", request.trigger.as_str());
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Dropping the wait future on cancellation kills the child.
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent command '{}'", self.program))?;

        let wait = async {
            match self.timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, child.wait_with_output()).await {
                        Ok(output) => output.map_err(anyhow::Error::from),
                        Err(_) => Err(anyhow!("agent timed out after {}s", timeout.as_secs())),
                    }
                }
                None => child.wait_with_output().await.map_err(anyhow::Error::from),
            }
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => return Ok(InvocationOutcome::Cancelled),
            output = wait => output?,
        };

        if !output.status.success() {
            let stderr = tail(&String::from_utf8_lossy(&output.stderr));
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            if stderr.is_empty() {
                bail!("agent exited with status {code}");
            }
            bail!("agent exited with status {code}: {stderr}");
        }

        let stdout = tail(&String::from_utf8_lossy(&output.stdout));
        Ok(InvocationOutcome::Completed {
            summary: (!stdout.is_empty()).then_some(stdout),
        })
    }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

// ──────────────────── HTTP ────────────────────

/// POSTs the [`InvocationRequest`] as JSON to an agent service.
pub struct HttpInvoker {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpInvoker {
    pub fn new(
        url: String,
        auth_token: Option<String>,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url,
            auth_token,
        })
    }
}

#[async_trait]
impl AgentInvoker for HttpInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<InvocationOutcome> {
        let mut req = self.client.post(&self.url).json(request);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let call = async {
            let resp = req
                .send()
                .await
                .with_context(|| format!("request to {} failed", self.url))?;
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                bail!("agent endpoint returned {status}: {}", tail(&body));
            }
            Ok::<_, anyhow::Error>(InvocationOutcome::Completed {
                summary: (!body.is_empty()).then_some(body),
            })
        };

        tokio::select! {
            _ = cancel.cancelled() => Ok(InvocationOutcome::Cancelled),
            outcome = call => outcome,
        }
    }
}
