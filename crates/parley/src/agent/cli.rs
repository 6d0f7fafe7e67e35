//! Drives the coding-agent CLI in `--output-format stream-json` mode.
//!
//! One process per query. The prompt goes in on stdin; every stdout line is one
//! JSON message. Cancellation sends SIGINT and keeps reading until the process
//! exits or the grace period runs out, after which it is killed.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use log::{debug, info, warn};
use parley_protocol::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AgentBackend, AgentError, AgentMessageStream, AgentQuery, AgentResult};
use crate::config::AgentConfig;

/// Maximum stderr kept for error reports.
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct CliAgentConfig {
    pub binary: String,
    pub default_model: Option<String>,
    pub extra_args: Vec<String>,
    pub cancel_grace: Duration,
    pub env: HashMap<String, String>,
}

impl Default for CliAgentConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for CliAgentConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            default_model: config.default_model.clone(),
            extra_args: config.extra_args.clone(),
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
            env: config.env.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CliAgentBackend {
    config: CliAgentConfig,
}

impl CliAgentBackend {
    pub fn new(config: CliAgentConfig) -> Self {
        Self { config }
    }

    /// Command-line arguments for `query`, excluding the prompt.
    pub fn build_args(&self, query: &AgentQuery) -> Vec<String> {
        let options = &query.options;
        let mut args: Vec<String> = vec![
            "-p".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ];

        let mut push_value = |flag: &str, value: Option<&str>| {
            if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        };

        push_value("--resume", query.resume.as_deref());
        push_value(
            "--model",
            options
                .model
                .as_deref()
                .or(self.config.default_model.as_deref()),
        );
        let max_turns = options.max_turns.map(|n| n.to_string());
        push_value("--max-turns", max_turns.as_deref());
        push_value("--system-prompt", options.system_prompt.as_deref());
        push_value(
            "--append-system-prompt",
            options.append_system_prompt.as_deref(),
        );
        let allowed = options.allowed_tools.as_deref().map(join_tools);
        push_value("--allowedTools", allowed.as_deref());
        let disallowed = options.disallowed_tools.as_deref().map(join_tools);
        push_value("--disallowedTools", disallowed.as_deref());
        push_value(
            "--permission-mode",
            options.permission_mode.as_ref().map(|m| m.as_arg()),
        );
        let mcp = query
            .mcp_config_path
            .as_ref()
            .map(|p| p.display().to_string());
        push_value("--mcp-config", mcp.as_deref());

        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

fn join_tools(tools: &[String]) -> String {
    tools
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl AgentBackend for CliAgentBackend {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn query(
        &self,
        query: AgentQuery,
        cancel: CancellationToken,
    ) -> AgentResult<AgentMessageStream> {
        let args = self.build_args(&query);
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = query.options.cwd.as_deref().filter(|c| !c.trim().is_empty()) {
            cmd.current_dir(shellexpand::tilde(cwd).into_owned());
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        // Scoped to this child; the server's own environment is untouched.
        if let Some(key) = query.options.api_key.as_deref().filter(|k| !k.is_empty()) {
            cmd.env("ANTHROPIC_API_KEY", key);
        }

        debug!("spawning agent: {} {}", self.config.binary, args.join(" "));
        let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
            binary: self.config.binary.clone(),
            source,
        })?;
        info!(
            "agent process started (pid={:?}, resume={:?})",
            child.id(),
            query.resume
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Failed("agent process has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Failed("agent process has no stdout".into()))?;
        let stderr = child.stderr.take().map(|s| tokio::spawn(stderr_tail(s)));

        tokio::spawn(write_prompt(stdin, query.prompt));

        let run = CliRun {
            child,
            lines: BufReader::new(stdout).lines(),
            stderr,
            cancel,
            grace: self.config.cancel_grace,
            deadline: None,
            saw_result: false,
            done: false,
        };

        Ok(Box::pin(stream::unfold(run, |mut run| async move {
            let item = run.next().await?;
            Some((item, run))
        })))
    }
}

async fn write_prompt(mut stdin: tokio::process::ChildStdin, prompt: String) {
    if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
        warn!("failed to write prompt to agent stdin: {:?}", e);
        return;
    }
    if let Err(e) = stdin.shutdown().await {
        debug!("failed to close agent stdin: {:?}", e);
    }
}

async fn stderr_tail(stderr: tokio::process::ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!("agent stderr: {}", line);
        if !tail.is_empty() {
            tail.push('\n');
        }
        tail.push_str(&line);
        if tail.len() > STDERR_TAIL_BYTES {
            let mut cut = tail.len() - STDERR_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
    tail
}

/// State of one running agent process.
struct CliRun {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr: Option<JoinHandle<String>>,
    cancel: CancellationToken,
    grace: Duration,
    /// Set once SIGINT has been sent.
    deadline: Option<Instant>,
    saw_result: bool,
    done: bool,
}

impl CliRun {
    async fn next(&mut self) -> Option<AgentResult<Message>> {
        loop {
            if self.done {
                return None;
            }

            let deadline = self.deadline;
            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if deadline.is_none() => {
                    self.interrupt();
                }

                _ = sleep_until_opt(deadline) => {
                    warn!("agent did not exit within {:?} of SIGINT, killing it", self.grace);
                    if let Err(e) = self.child.start_kill() {
                        debug!("failed to kill agent: {:?}", e);
                    }
                    self.done = true;
                    return None;
                }

                line = self.lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(message) = self.parse_line(&line) {
                            return Some(Ok(message));
                        }
                    }
                    Ok(None) => return self.finish().await,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(AgentError::Io(e)));
                    }
                },
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> Option<Message> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(message) => {
                if message.is_result() {
                    self.saw_result = true;
                }
                Some(message)
            }
            Err(e) => {
                let display: String = line.chars().take(200).collect();
                warn!("failed to parse agent message: {}, line: {}", e, display);
                None
            }
        }
    }

    fn interrupt(&mut self) {
        info!("cancelling agent query (pid={:?})", self.child.id());
        self.deadline = Some(Instant::now() + self.grace);
        send_interrupt(&mut self.child);
    }

    async fn finish(&mut self) -> Option<AgentResult<Message>> {
        self.done = true;
        let status = self.child.wait().await;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if self.cancel.is_cancelled() {
            debug!("agent stopped after cancellation: {:?}", status);
            return None;
        }

        match status {
            Ok(status) if status.success() || self.saw_result => {
                debug!("agent exited: {}", status);
                None
            }
            Ok(status) => Some(Err(AgentError::Exited {
                code: status.code(),
                stderr,
            })),
            Err(e) => Some(Err(AgentError::Io(e))),
        }
    }
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: `pid` is our own unreaped child; kill(2) has no memory effects.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc != 0 {
        debug!("SIGINT failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("failed to kill agent: {:?}", e);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
