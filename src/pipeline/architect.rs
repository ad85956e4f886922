//! The architect collaborator: PRD decomposition and contract
//! registration behind a small interface.
//!
//! The production backend is a sum type with two variants: an MCP stdio
//! client and a plain subprocess + JSON fallback. The runtime chooses at
//! startup based on configuration; a failed MCP call degrades to the
//! subprocess path before giving up with a remediation hint.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use buildsmith_models::ArchitectOutput;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ArchitectConfig;
use crate::errors::PipelineError;
use crate::util::load_json;

/// What the pipeline needs from the architect service.
#[async_trait]
pub trait ArchitectAdapter: Send + Sync {
    /// Decompose a PRD into services, a domain model, and contract stubs.
    async fn decompose(&self, prd_text: &str, output_dir: &Path) -> Result<ArchitectOutput, PipelineError>;

    /// Register one contract. Errors make the caller fall back to the
    /// filesystem registry.
    async fn register_contract(&self, service_name: &str, spec: &Value) -> Result<Value, PipelineError>;
}

/// Production architect backend.
pub enum ArchitectBackend {
    Mcp(McpEndpoint),
    Subprocess(SubprocessArchitect),
}

impl ArchitectBackend {
    /// Choose a backend from configuration: MCP when a server command is
    /// configured, subprocess otherwise.
    pub fn from_config(config: &ArchitectConfig) -> Self {
        if config.mcp_command.is_empty() {
            ArchitectBackend::Subprocess(SubprocessArchitect {
                command: config.command.clone(),
                timeout: Duration::from_secs(config.timeout_s),
            })
        } else {
            ArchitectBackend::Mcp(McpEndpoint {
                command: config.mcp_command.clone(),
                timeout: Duration::from_secs(config.timeout_s),
                fallback: SubprocessArchitect {
                    command: config.command.clone(),
                    timeout: Duration::from_secs(config.timeout_s),
                },
            })
        }
    }
}

#[async_trait]
impl ArchitectAdapter for ArchitectBackend {
    async fn decompose(&self, prd_text: &str, output_dir: &Path) -> Result<ArchitectOutput, PipelineError> {
        match self {
            ArchitectBackend::Subprocess(sub) => sub
                .decompose(prd_text, output_dir)
                .await
                .map_err(|e| PipelineError::Configuration(format!(
                    "Architect phase failed: {e:#}. Ensure the architect CLI is installed and on PATH."
                ))),
            ArchitectBackend::Mcp(mcp) => {
                match mcp.call_tool("decompose_prd", json!({"prd_text": prd_text})).await {
                    Ok(value) => serde_json::from_value(value).map_err(|e| {
                        PipelineError::Configuration(format!("Architect MCP returned malformed result: {e}"))
                    }),
                    Err(e) => {
                        warn!("MCP architect call failed: {e:#}; trying subprocess");
                        mcp.fallback.decompose(prd_text, output_dir).await.map_err(|sub_err| {
                            PipelineError::Configuration(format!(
                                "Architect phase failed: both MCP and subprocess unavailable \
                                 (mcp: {e:#}; subprocess: {sub_err:#}). Ensure the architect \
                                 service is installed and its MCP server is running."
                            ))
                        })
                    }
                }
            }
        }
    }

    async fn register_contract(&self, service_name: &str, spec: &Value) -> Result<Value, PipelineError> {
        match self {
            ArchitectBackend::Mcp(mcp) => mcp
                .call_tool(
                    "create_contract",
                    json!({
                        "service_name": service_name,
                        "type": "openapi",
                        "version": "1.0.0",
                        "spec": spec,
                    }),
                )
                .await
                .map_err(|e| {
                    PipelineError::Configuration(format!(
                        "Contract engine MCP not available for {service_name}: {e:#}"
                    ))
                }),
            ArchitectBackend::Subprocess(_) => Err(PipelineError::Configuration(format!(
                "Contract engine MCP not available for {service_name}; \
                 no registration endpoint in subprocess mode"
            ))),
        }
    }
}

/// One-shot stdio JSON-RPC client: spawns the server, sends a single
/// `tools/call`, reads one response line.
pub struct McpEndpoint {
    command: String,
    timeout: Duration,
    fallback: SubprocessArchitect,
}

impl McpEndpoint {
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().context("Empty MCP command")?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn MCP server")?;

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": tool, "arguments": arguments},
        });

        let result = tokio::time::timeout(self.timeout, async {
            let mut stdin = child.stdin.take().context("MCP stdin unavailable")?;
            stdin
                .write_all(format!("{request}\n").as_bytes())
                .await
                .context("Failed to write MCP request")?;
            stdin.shutdown().await.ok();

            let stdout = child.stdout.take().context("MCP stdout unavailable")?;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.context("Failed to read MCP response")? {
                if line.trim().is_empty() {
                    continue;
                }
                let response: Value =
                    serde_json::from_str(&line).context("Malformed MCP response")?;
                if let Some(error) = response.get("error") {
                    anyhow::bail!("MCP error: {error}");
                }
                if let Some(result) = response.get("result") {
                    return Ok(result.clone());
                }
            }
            Err(anyhow!("MCP server closed without a response"))
        })
        .await;

        // Reap the server on every path.
        if child.try_wait().ok().flatten().is_none() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }

        match result {
            Ok(inner) => inner,
            Err(_) => Err(anyhow!("MCP call timed out after {:?}", self.timeout)),
        }
    }
}

/// Subprocess + JSON architect invocation.
pub struct SubprocessArchitect {
    command: String,
    timeout: Duration,
}

impl SubprocessArchitect {
    pub fn new(command: String, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub async fn decompose(&self, prd_text: &str, output_dir: &Path) -> Result<ArchitectOutput> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        let prd_file = output_dir.join("prd_input.md");
        std::fs::write(&prd_file, prd_text).context("Failed to write PRD input")?;
        let result_file = output_dir.join("architect_result.json");

        let mut parts = self.command.split_whitespace();
        let program = parts.next().context("Empty architect command")?;
        let mut child = Command::new(program)
            .args(parts)
            .arg("--prd")
            .arg(&prd_file)
            .arg("--output")
            .arg(&result_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn architect subprocess")?;

        // Drain both pipes while waiting so a chatty architect cannot
        // block on a full pipe buffer.
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let drain = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut out = Vec::new();
            let mut err = Vec::new();
            if let Some(pipe) = stdout.as_mut() {
                let _ = pipe.read_to_end(&mut out).await;
            }
            if let Some(pipe) = stderr.as_mut() {
                let _ = pipe.read_to_end(&mut err).await;
            }
            (out, err)
        });

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        if child.try_wait().ok().flatten().is_none() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        let (stdout_bytes, stderr_bytes) = drain.await.unwrap_or_default();
        let status = match waited {
            Ok(status) => status.context("Failed waiting for architect")?,
            Err(_) => anyhow::bail!(
                "Architect subprocess timed out after {}s",
                self.timeout.as_secs()
            ),
        };
        if !status.success() {
            let stderr_text = String::from_utf8_lossy(&stderr_bytes);
            anyhow::bail!(
                "Architect subprocess failed (exit {:?}): {:.500}",
                status.code(),
                stderr_text
            );
        }

        // Prefer the result file; fall back to stdout JSON.
        let raw = load_json(&result_file)
            .or_else(|| serde_json::from_slice(&stdout_bytes).ok())
            .ok_or_else(|| anyhow!("Architect subprocess produced no parseable result"))?;
        let output: ArchitectOutput =
            serde_json::from_value(raw).context("Architect result did not match contract")?;
        info!(
            "Architect decomposed PRD into {} services",
            output.service_map.services.len()
        );
        Ok(output)
    }
}

/// Deterministic result paths for callers persisting architect output.
pub fn artifact_paths(output_dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
    (
        output_dir.join("service_map.json"),
        output_dir.join("domain_model.json"),
        output_dir.join("contracts"),
    )
}
