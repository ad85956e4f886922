//! Semaphore-gated parallel builder dispatch and subprocess lifecycle.
//!
//! Each service gets a generated `config.yaml` and an output directory;
//! the builder worker runs as an isolated subprocess with a filtered
//! environment and piped, jointly drained stdio. The kill-and-reap
//! cleanup runs on every exit path, so no orphan processes survive
//! normal completion, timeout, error, or cancellation.

use anyhow::{Context, Result};
use buildsmith_models::{BuilderResult, ServiceInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::{BuilderConfig, Depth};
use crate::state::ShutdownSignal;

/// Secret-bearing environment keys never handed to builder subprocesses.
pub const FILTERED_ENV_KEYS: [&str; 3] =
    ["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "AWS_SECRET_ACCESS_KEY"];

/// A copy of the process environment with secret keys removed.
pub fn filtered_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| !FILTERED_ENV_KEYS.contains(&k.as_str()))
        .collect()
}

/// Parse a builder's `.agent-team/STATE.json` into a result summary.
///
/// Missing or malformed files produce a failure result with zero costs;
/// this function never errors.
pub fn parse_builder_state(service_id: &str, output_dir: &Path) -> BuilderResult {
    let state_path = output_dir.join(".agent-team").join("STATE.json");
    let raw = match std::fs::read_to_string(&state_path) {
        Ok(raw) => raw,
        Err(_) => {
            warn!("No STATE.json found for builder {service_id}");
            return BuilderResult::failure(service_id, "No STATE.json found");
        }
    };
    let data: Value = match serde_json::from_str(&raw) {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to parse STATE.json for builder {service_id}: {e}");
            return BuilderResult::failure(service_id, format!("Failed to parse STATE.json: {e}"));
        }
    };

    let summary = data.get("summary").cloned().unwrap_or(Value::Null);
    BuilderResult {
        service_id: service_id.to_string(),
        success: summary.get("success").and_then(Value::as_bool).unwrap_or(false),
        test_passed: summary.get("test_passed").and_then(Value::as_u64).unwrap_or(0) as u32,
        test_total: summary.get("test_total").and_then(Value::as_u64).unwrap_or(0) as u32,
        convergence_ratio: summary
            .get("convergence_ratio")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        total_cost: data.get("total_cost").and_then(Value::as_f64).unwrap_or(0.0),
        health: data
            .get("health")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        completed_phases: data
            .get("completed_phases")
            .and_then(Value::as_array)
            .map(|phases| {
                phases
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        exit_code: 0,
        duration_s: 0.0,
        error: data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Launches builder workers and harvests their results.
pub struct BuilderDispatcher {
    config: BuilderConfig,
    output_root: PathBuf,
}

impl BuilderDispatcher {
    pub fn new(config: BuilderConfig, output_root: PathBuf) -> Self {
        Self {
            config,
            output_root,
        }
    }

    pub fn output_dir(&self, service_id: &str) -> PathBuf {
        self.output_root.join(service_id)
    }

    /// Write the per-builder `config.yaml` the worker reads on startup.
    pub fn generate_builder_config(
        &self,
        service: &ServiceInfo,
        depth: Depth,
    ) -> Result<PathBuf> {
        let output_dir = self.output_dir(&service.service_id);
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let config = serde_json::json!({
            "depth": depth.as_str(),
            "milestone": format!("build-{}", service.service_id),
            "e2e_testing": true,
            "post_orchestration_scans": true,
            "service_id": service.service_id,
            "domain": service.domain,
            "stack": service.stack,
            "port": service.port,
            "output_dir": output_dir.to_string_lossy(),
        });
        let config_path = output_dir.join("config.yaml");
        let yaml = serde_yaml::to_string(&config).context("Failed to render builder config")?;
        std::fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        info!("Generated builder config: {}", config_path.display());
        Ok(config_path)
    }

    /// Run builders for every service with bounded concurrency.
    ///
    /// The semaphore is created inside this function, never at module
    /// scope. Each task acquires a permit, re-checks shutdown, then runs
    /// the worker. Individual failures surface as failed results, not
    /// errors.
    pub async fn run_parallel(
        &self,
        services: &[ServiceInfo],
        depth: Depth,
        shutdown: &ShutdownSignal,
    ) -> Vec<BuilderResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        let tasks = services.iter().map(|service| {
            let semaphore = semaphore.clone();
            let shutdown = shutdown.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                if shutdown.should_stop() {
                    return BuilderResult::failure(
                        &service.service_id,
                        "Pipeline shutdown requested",
                    );
                }
                self.build_one(service, depth).await
            }
        });

        futures::future::join_all(tasks).await
    }

    async fn build_one(&self, service: &ServiceInfo, depth: Depth) -> BuilderResult {
        let output_dir = self.output_dir(&service.service_id);
        if let Err(e) = self.generate_builder_config(service, depth) {
            return BuilderResult::failure(&service.service_id, format!("{e:#}"));
        }
        self.invoke(&service.service_id, &output_dir, depth).await
    }

    /// Invoke the builder worker subprocess for one service directory.
    pub async fn invoke(&self, service_id: &str, output_dir: &Path, depth: Depth) -> BuilderResult {
        if let Err(e) = std::fs::create_dir_all(output_dir) {
            return BuilderResult::failure(service_id, format!("{e}"));
        }
        let Some((program, prefix_args)) = self.config.command.split_first() else {
            return BuilderResult::failure(service_id, "Builder command not configured");
        };

        let mut cmd = Command::new(program);
        cmd.args(prefix_args)
            .arg("--cwd")
            .arg(output_dir)
            .arg("--depth")
            .arg(depth.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(filtered_env())
            .kill_on_drop(true);

        let start = Instant::now();
        let timeout = Duration::from_secs(self.config.timeout_s);

        let outcome = run_worker(cmd, timeout).await;
        let duration = start.elapsed().as_secs_f64();

        match outcome {
            Ok(WorkerOutcome {
                timed_out: true, ..
            }) => {
                warn!(
                    "Builder for {service_id} timed out after {}s",
                    self.config.timeout_s
                );
                let mut result = BuilderResult::failure(
                    service_id,
                    format!("Timed out after {}s", self.config.timeout_s),
                );
                result.duration_s = duration;
                result
            }
            Ok(WorkerOutcome { exit_code, .. }) => {
                let mut result = parse_builder_state(service_id, output_dir);
                result.exit_code = exit_code;
                result.duration_s = duration;
                result
            }
            Err(e) => {
                warn!("Builder for {service_id} failed to spawn: {e:#}");
                BuilderResult::failure(service_id, format!("{e:#}"))
            }
        }
    }
}

struct WorkerOutcome {
    exit_code: i32,
    timed_out: bool,
}

/// Spawn the worker and wait with a deadline.
///
/// Stdout and stderr are drained concurrently so a chatty child cannot
/// deadlock on a full pipe. The cleanup block kills and reaps the child
/// if it has not exited, on every path.
async fn run_worker(mut cmd: Command, timeout: Duration) -> Result<WorkerOutcome> {
    let mut child = cmd.spawn().context("Failed to spawn builder worker")?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let drain = tokio::spawn(async move {
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        if let Some(out) = stdout.as_mut() {
            let _ = out.read_to_end(&mut out_buf).await;
        }
        if let Some(err) = stderr.as_mut() {
            let _ = err.read_to_end(&mut err_buf).await;
        }
        (out_buf, err_buf)
    });

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
            (code, false)
        }
        _ = tokio::time::sleep(timeout) => (-1, true),
    };

    // Kill-and-reap cleanup: runs whether we timed out, errored, or the
    // wait path above already reaped the child.
    if child.try_wait().ok().flatten().is_none() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    let _ = drain.await;

    Ok(WorkerOutcome { exit_code, timed_out })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher_with(command: Vec<String>, root: &Path) -> BuilderDispatcher {
        BuilderDispatcher::new(
            BuilderConfig {
                command,
                max_concurrent: 2,
                timeout_s: 10,
                depth: Depth::Standard,
            },
            root.to_path_buf(),
        )
    }

    /// Shell script worker that writes a STATE.json then exits.
    fn fake_worker(dir: &Path, state_json: &str, exit_code: i32) -> Vec<String> {
        let script = dir.join("worker.sh");
        let body = format!(
            "#!/bin/sh\n\
             cwd=\"\"\n\
             while [ $# -gt 0 ]; do\n\
               if [ \"$1\" = \"--cwd\" ]; then cwd=\"$2\"; shift; fi\n\
               shift\n\
             done\n\
             mkdir -p \"$cwd/.agent-team\"\n\
             cat > \"$cwd/.agent-team/STATE.json\" <<'EOF'\n{state_json}\nEOF\n\
             exit {exit_code}\n"
        );
        std::fs::write(&script, body).unwrap();
        vec!["sh".to_string(), script.to_string_lossy().to_string()]
    }

    #[test]
    fn filtered_env_drops_secret_keys() {
        // SAFETY: test-local mutation, keys removed again below.
        unsafe {
            std::env::set_var("ANTHROPIC_API_KEY", "sk-secret");
            std::env::set_var("OPENAI_API_KEY", "sk-other");
            std::env::set_var("AWS_SECRET_ACCESS_KEY", "aws-secret");
            std::env::set_var("HARMLESS_VAR", "ok");
        }
        let env = filtered_env();
        for key in FILTERED_ENV_KEYS {
            assert!(!env.contains_key(key), "{key} must be filtered");
        }
        assert_eq!(env.get("HARMLESS_VAR").map(String::as_str), Some("ok"));
        unsafe {
            std::env::remove_var("ANTHROPIC_API_KEY");
            std::env::remove_var("OPENAI_API_KEY");
            std::env::remove_var("AWS_SECRET_ACCESS_KEY");
            std::env::remove_var("HARMLESS_VAR");
        }
    }

    #[test]
    fn parse_state_missing_file_is_a_failure_result() {
        let dir = tempfile::tempdir().unwrap();
        let result = parse_builder_state("auth-service", dir.path());
        assert!(!result.success);
        assert_eq!(result.total_cost, 0.0);
        assert_eq!(result.error, "No STATE.json found");
    }

    #[test]
    fn parse_state_malformed_json_is_a_failure_result() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join(".agent-team");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join("STATE.json"), "{not json").unwrap();

        let result = parse_builder_state("auth-service", dir.path());
        assert!(!result.success);
        assert!(result.error.contains("Failed to parse STATE.json"));
    }

    #[test]
    fn parse_state_extracts_summary_and_top_level_fields() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join(".agent-team");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(
            state_dir.join("STATE.json"),
            r#"{
                "total_cost": 1.75,
                "health": "healthy",
                "completed_phases": ["scaffold", "implement"],
                "summary": {
                    "success": true,
                    "test_passed": 10,
                    "test_total": 12,
                    "convergence_ratio": 0.83
                }
            }"#,
        )
        .unwrap();

        let result = parse_builder_state("auth-service", dir.path());
        assert!(result.success);
        assert_eq!(result.test_passed, 10);
        assert_eq!(result.test_total, 12);
        assert_eq!(result.total_cost, 1.75);
        assert_eq!(result.health, "healthy");
        assert_eq!(result.completed_phases, vec!["scaffold", "implement"]);
    }

    #[test]
    fn parse_state_tolerates_missing_summary_fields() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join(".agent-team");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join("STATE.json"), r#"{"summary": {}}"#).unwrap();

        let result = parse_builder_state("svc", dir.path());
        assert!(!result.success);
        assert_eq!(result.health, "unknown");
        assert!(result.completed_phases.is_empty());
    }

    #[tokio::test]
    async fn invoke_harvests_state_from_worker() {
        let dir = tempfile::tempdir().unwrap();
        let command = fake_worker(
            dir.path(),
            r#"{"total_cost": 0.5, "health": "healthy", "summary": {"success": true, "test_passed": 3, "test_total": 3}}"#,
            0,
        );
        let dispatcher = dispatcher_with(command, dir.path());
        let output_dir = dispatcher.output_dir("auth-service");

        let result = dispatcher
            .invoke("auth-service", &output_dir, Depth::Standard)
            .await;
        assert!(result.success, "error: {}", result.error);
        assert_eq!(result.total_cost, 0.5);
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn run_parallel_builds_every_service() {
        let dir = tempfile::tempdir().unwrap();
        let command = fake_worker(
            dir.path(),
            r#"{"total_cost": 0.1, "summary": {"success": true}}"#,
            0,
        );
        let dispatcher = dispatcher_with(command, dir.path());
        let services = vec![
            ServiceInfo::named("auth-service"),
            ServiceInfo::named("order-service"),
            ServiceInfo::named("notification-service"),
        ];
        let shutdown = ShutdownSignal::new();

        let results = dispatcher
            .run_parallel(&services, Depth::Standard, &shutdown)
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        // Each service got its own config.yaml.
        for svc in &services {
            assert!(dispatcher.output_dir(&svc.service_id).join("config.yaml").exists());
        }
    }

    #[tokio::test]
    async fn shutdown_short_circuits_builders() {
        let dir = tempfile::tempdir().unwrap();
        let command = fake_worker(dir.path(), r#"{"summary": {"success": true}}"#, 0);
        let dispatcher = dispatcher_with(command, dir.path());
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let results = dispatcher
            .run_parallel(&[ServiceInfo::named("auth-service")], Depth::Quick, &shutdown)
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].error, "Pipeline shutdown requested");
    }

    #[tokio::test]
    async fn timeout_kills_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("sleeper.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 60\n").unwrap();
        let dispatcher = BuilderDispatcher::new(
            BuilderConfig {
                command: vec!["sh".to_string(), script.to_string_lossy().to_string()],
                max_concurrent: 1,
                timeout_s: 1,
                depth: Depth::Quick,
            },
            dir.path().to_path_buf(),
        );

        let start = Instant::now();
        let result = dispatcher
            .invoke("slow-service", &dispatcher.output_dir("slow-service"), Depth::Quick)
            .await;
        assert!(!result.success);
        assert!(result.error.contains("Timed out"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_worker_binary_is_a_failure_result() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher_with(
            vec!["definitely-not-a-real-binary-xyz".to_string()],
            dir.path(),
        );
        let result = dispatcher
            .invoke("svc", &dispatcher.output_dir("svc"), Depth::Quick)
            .await;
        assert!(!result.success);
        assert!(!result.error.is_empty());
    }
}
