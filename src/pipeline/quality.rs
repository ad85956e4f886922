//! Production quality-gate collaborator: shells out to the external
//! multi-layer scanner and parses its report.

use async_trait::async_trait;
use buildsmith_models::{BuilderResult, IntegrationReport, QualityGateReport};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::QualityGateConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::pipeline::QualityEngine;
use crate::util::{atomic_write_json, load_json};

/// Invokes the external scanner as `{command} --target DIR --input X
/// --output Y` and parses the report it writes.
pub struct SubprocessQualityEngine {
    config: QualityGateConfig,
}

impl SubprocessQualityEngine {
    pub fn new(config: QualityGateConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl QualityEngine for SubprocessQualityEngine {
    async fn run_all_layers(
        &self,
        builder_results: &BTreeMap<String, BuilderResult>,
        integration_report: &IntegrationReport,
        target_dir: &Path,
        fix_attempts: u32,
        max_fix_attempts: u32,
    ) -> PipelineResult<QualityGateReport> {
        let input_path = target_dir.join("quality_gate_input.json");
        atomic_write_json(
            &input_path,
            &serde_json::json!({
                "builder_results": builder_results,
                "integration_report": integration_report,
                "fix_attempts": fix_attempts,
                "max_fix_attempts": max_fix_attempts,
            }),
        )?;
        let output_path = target_dir.join("quality_gate_output.json");

        let mut parts = self.config.command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            PipelineError::Configuration("Quality gate command not configured".to_string())
        })?;
        let mut child = Command::new(program)
            .args(parts)
            .arg("--target")
            .arg(target_dir)
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::Configuration(format!(
                    "Quality gate not available ({program}: {e}). \
                     Install the quality scanner or set [quality_gate].command."
                ))
            })?;

        let waited =
            tokio::time::timeout(Duration::from_secs(self.config.timeout_s), child.wait()).await;
        if child.try_wait().ok().flatten().is_none() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        match waited {
            Ok(Ok(_status)) => {}
            Ok(Err(e)) => return Err(PipelineError::Other(e.into())),
            Err(_) => {
                return Err(PipelineError::PhaseTimeout {
                    phase: "quality_gate".to_string(),
                    timeout_s: self.config.timeout_s,
                });
            }
        }

        let raw = load_json(&output_path).ok_or_else(|| {
            PipelineError::Other(anyhow::anyhow!(
                "Quality gate produced no report at {}",
                output_path.display()
            ))
        })?;
        serde_json::from_value(raw)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("Malformed quality report: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scanner_report_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("gate.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             out=\"\"\n\
             while [ $# -gt 0 ]; do\n\
               if [ \"$1\" = \"--output\" ]; then out=\"$2\"; shift; fi\n\
               shift\n\
             done\n\
             printf '{\"overall_verdict\": \"passed\", \"total_violations\": 0, \"blocking_violations\": 0, \"layers\": {}}' > \"$out\"\n",
        )
        .unwrap();

        let engine = SubprocessQualityEngine::new(QualityGateConfig {
            command: format!("sh {}", script.display()),
            max_fix_retries: 2,
            timeout_s: 10,
        });
        let report = engine
            .run_all_layers(&BTreeMap::new(), &IntegrationReport::default(), dir.path(), 0, 2)
            .await
            .unwrap();
        assert_eq!(report.overall_verdict.as_str(), "passed");
    }

    #[tokio::test]
    async fn missing_scanner_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SubprocessQualityEngine::new(QualityGateConfig {
            command: "definitely-not-a-real-scanner".to_string(),
            max_fix_retries: 2,
            timeout_s: 10,
        });
        let err = engine
            .run_all_layers(&BTreeMap::new(), &IntegrationReport::default(), dir.path(), 0, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
