//! Container runtime behind a trait: the production implementation
//! shells out to `docker compose`; tests substitute an in-memory mock.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error};

/// Per-service health snapshot from a polling pass.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub all_healthy: bool,
    /// service name -> status string ("healthy" / "starting" / ...).
    pub services: BTreeMap<String, String>,
}

/// Lifecycle of the deployed service set.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `docker compose up -d --build` equivalent.
    async fn start_services(&self) -> Result<()>;

    /// `docker compose down --remove-orphans` equivalent. Must be safe to
    /// call even when startup failed.
    async fn stop_services(&self) -> Result<()>;

    /// Poll service health until all pass or the timeout elapses.
    async fn wait_for_healthy(&self, timeout: Duration, poll_interval: Duration) -> HealthReport;
}

/// `docker compose` subprocess wrapper.
pub struct ComposeRuntime {
    compose_file: PathBuf,
    project_name: String,
}

impl ComposeRuntime {
    pub fn new(compose_file: PathBuf) -> Self {
        Self {
            compose_file,
            project_name: "buildsmith".to_string(),
        }
    }

    pub fn with_project_name(mut self, name: &str) -> Self {
        self.project_name = name.to_string();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<(i32, String, String)> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .arg("-p")
            .arg(&self.project_name)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("Running docker compose {args:?}");

        let output = cmd
            .output()
            .await
            .context("Failed to run docker compose")?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    /// One `docker compose ps` pass parsed into service -> health.
    async fn poll_health(&self) -> Result<BTreeMap<String, String>> {
        let (code, stdout, stderr) = self
            .run(&["ps", "--format", "{{.Service}}\t{{.Health}}"])
            .await?;
        if code != 0 {
            anyhow::bail!("docker compose ps failed: {stderr}");
        }
        let mut services = BTreeMap::new();
        for line in stdout.lines() {
            let mut parts = line.splitn(2, '\t');
            let Some(name) = parts.next().map(str::trim) else { continue };
            if name.is_empty() {
                continue;
            }
            let health = parts.next().map(str::trim).unwrap_or("");
            services.insert(
                name.to_string(),
                if health.is_empty() { "unknown".to_string() } else { health.to_string() },
            );
        }
        Ok(services)
    }
}

#[async_trait]
impl ContainerRuntime for ComposeRuntime {
    async fn start_services(&self) -> Result<()> {
        let (code, _stdout, stderr) = self.run(&["up", "-d", "--build"]).await?;
        if code != 0 {
            error!("Failed to start services: {stderr}");
            anyhow::bail!("docker compose up failed (exit {code}): {stderr}");
        }
        Ok(())
    }

    async fn stop_services(&self) -> Result<()> {
        let (code, _stdout, stderr) = self.run(&["down", "--remove-orphans"]).await?;
        if code != 0 {
            anyhow::bail!("docker compose down failed (exit {code}): {stderr}");
        }
        Ok(())
    }

    async fn wait_for_healthy(&self, timeout: Duration, poll_interval: Duration) -> HealthReport {
        let deadline = Instant::now() + timeout;
        let mut last = BTreeMap::new();
        loop {
            match self.poll_health().await {
                Ok(services) => {
                    let all_healthy = !services.is_empty()
                        && services.values().all(|s| s == "healthy");
                    last = services;
                    if all_healthy {
                        return HealthReport {
                            all_healthy: true,
                            services: last,
                        };
                    }
                }
                Err(e) => debug!("Health poll failed: {e:#}"),
            }
            if Instant::now() >= deadline {
                return HealthReport {
                    all_healthy: false,
                    services: last,
                };
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted runtime used by the pipeline tests as well.
    pub struct ScriptedRuntime {
        pub fail_start: bool,
        pub healthy: Vec<String>,
        pub calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn start_services(&self) -> Result<()> {
            self.calls.lock().unwrap().push("start");
            if self.fail_start {
                anyhow::bail!("compose up failed");
            }
            Ok(())
        }

        async fn stop_services(&self) -> Result<()> {
            self.calls.lock().unwrap().push("stop");
            Ok(())
        }

        async fn wait_for_healthy(&self, _t: Duration, _p: Duration) -> HealthReport {
            self.calls.lock().unwrap().push("wait");
            HealthReport {
                all_healthy: !self.healthy.is_empty(),
                services: self
                    .healthy
                    .iter()
                    .map(|s| (s.clone(), "healthy".to_string()))
                    .collect(),
            }
        }
    }

    #[tokio::test]
    async fn scripted_runtime_reports_healthy_services() {
        let runtime = ScriptedRuntime {
            fail_start: false,
            healthy: vec!["auth-service".to_string()],
            calls: Mutex::new(Vec::new()),
        };
        runtime.start_services().await.unwrap();
        let report = runtime
            .wait_for_healthy(Duration::from_secs(1), Duration::from_millis(10))
            .await;
        assert!(report.all_healthy);
        assert_eq!(report.services.len(), 1);
        runtime.stop_services().await.unwrap();
        assert_eq!(*runtime.calls.lock().unwrap(), vec!["start", "wait", "stop"]);
    }

    #[test]
    fn compose_runtime_holds_project_name() {
        let runtime =
            ComposeRuntime::new(PathBuf::from("/tmp/compose.yml")).with_project_name("demo");
        assert_eq!(runtime.project_name, "demo");
    }
}
