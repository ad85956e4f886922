//! Phase executors: one function per pipeline phase.
//!
//! Every executor checks the shutdown flag at entry and between
//! sub-steps, persists the snapshot before the completion transition
//! fires, and mirrors its cost into the ledger.

use buildsmith_models::{
    BuilderStatus, IntegrationReport, QualityGateReport, ServiceInfo, ServiceMap, Violation,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::builder::fix::FixLoop;
use crate::errors::{PipelineError, PipelineResult};
use crate::integrator::compose::generate_compose_file;
use crate::persistence::{build_failure_context, build_fix_context};
use crate::pipeline::Pipeline;
use crate::pipeline::architect::artifact_paths;
use crate::state::phases;
use crate::util::{atomic_write_json, ensure_dir, load_json};

impl Pipeline {
    // ==================================================================
    // Architect
    // ==================================================================

    pub(crate) async fn phase_architect(&mut self) -> PipelineResult<()> {
        info!("Starting architect phase");
        self.ledger.start_phase(phases::ARCHITECT);

        if self.shutdown.should_stop() {
            warn!("Shutdown requested during architect phase");
            self.ledger.end_phase(0.0);
            return self.save();
        }

        let (prd_path, max_retries) = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            (snap.prd_path.clone(), snap.max_architect_retries)
        };
        let prd_text = std::fs::read_to_string(&prd_path).map_err(|e| {
            PipelineError::Configuration(format!("Failed to read PRD at {prd_path}: {e}"))
        })?;

        ensure_dir(&self.output_dir)?;

        let mut result = None;
        let mut retries = 0u32;
        while retries <= max_retries {
            if self.shutdown.should_stop() {
                warn!("Shutdown requested during architect phase");
                self.ledger.end_phase(0.0);
                return self.save();
            }
            match self.architect.decompose(&prd_text, &self.output_dir).await {
                Ok(output) => {
                    result = Some(output);
                    break;
                }
                Err(e @ PipelineError::Configuration(_)) => {
                    self.ledger.end_phase(0.0);
                    self.sync_costs();
                    return Err(e);
                }
                Err(e) => {
                    retries += 1;
                    {
                        let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
                        snap.architect_retries = retries;
                    }
                    warn!(
                        "Architect attempt {retries}/{} failed: {e}",
                        max_retries + 1
                    );
                    if retries > max_retries {
                        self.ledger.end_phase(0.0);
                        self.sync_costs();
                        return Err(PipelineError::Other(anyhow::anyhow!(
                            "Architect phase failed after {retries} attempts: {e}"
                        )));
                    }
                    self.save()?;
                }
            }
        }
        let output = result.ok_or_else(|| {
            PipelineError::Other(anyhow::anyhow!("Architect phase returned no result"))
        })?;

        // Persist all three artifacts atomically.
        let (map_path, model_path, registry_dir) = artifact_paths(&self.output_dir);
        ensure_dir(&registry_dir)?;
        atomic_write_json(&map_path, &output.service_map)?;
        atomic_write_json(&model_path, &output.domain_model)?;
        atomic_write_json(&registry_dir.join("stubs.json"), &output.contract_stubs)?;

        self.ledger.end_phase(output.cost);
        {
            let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.service_map_path = map_path.to_string_lossy().to_string();
            snap.domain_model_path = model_path.to_string_lossy().to_string();
            snap.contract_registry_path = registry_dir.to_string_lossy().to_string();
            let service_map_path = snap.service_map_path.clone();
            let domain_model_path = snap.domain_model_path.clone();
            let contract_registry_path = snap.contract_registry_path.clone();
            snap.record_artifacts(
                phases::ARCHITECT,
                [
                    ("service_map_path", service_map_path),
                    ("domain_model_path", domain_model_path),
                    ("contract_registry_path", contract_registry_path),
                ],
            );
            snap.mark_phase_complete(phases::ARCHITECT);
        }
        self.sync_costs();
        self.save()?;
        info!("Architect phase complete, cost=${:.4}", output.cost);
        Ok(())
    }

    // ==================================================================
    // Contract registration
    // ==================================================================

    pub(crate) async fn phase_contract_registration(&mut self) -> PipelineResult<()> {
        info!("Starting contract registration phase");
        self.ledger.start_phase(phases::CONTRACT_REGISTRATION);

        if self.shutdown.should_stop() {
            warn!("Shutdown requested before contract registration");
            self.ledger.end_phase(0.0);
            return self.save();
        }

        let (map_path, registry_path) = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            (snap.service_map_path.clone(), snap.contract_registry_path.clone())
        };
        let service_map = read_service_map(Path::new(&map_path))?;
        let registry_dir = Path::new(&registry_path).to_path_buf();
        ensure_dir(&registry_dir)?;

        let stubs = load_json(&registry_dir.join("stubs.json")).unwrap_or(Value::Null);

        let mut registered = 0usize;
        for service in &service_map.services {
            if self.shutdown.should_stop() {
                break;
            }
            let name = &service.service_id;
            if name.is_empty() {
                continue;
            }
            let spec = stubs.get(name).cloned().unwrap_or(Value::Null);
            if spec.is_null() {
                continue;
            }

            match self.architect.register_contract(name, &spec).await {
                Ok(_) => {
                    registered += 1;
                    info!("Registered contract for {name}");
                }
                Err(e) => {
                    // MCP unavailable or any runtime failure: filesystem
                    // fallback keeps the phase going.
                    warn!("Contract registration for {name} fell back to filesystem: {e}");
                    atomic_write_json(&registry_dir.join(format!("{name}.json")), &spec)?;
                }
            }
        }

        self.ledger.end_phase(0.0);
        {
            let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.record_artifacts(
                phases::CONTRACT_REGISTRATION,
                [
                    ("registered_contracts", registered.to_string()),
                    ("registry_path", registry_dir.to_string_lossy().to_string()),
                ],
            );
            snap.mark_phase_complete(phases::CONTRACT_REGISTRATION);
        }
        self.sync_costs();
        self.save()?;
        info!("Contract registration complete, {registered} contracts via MCP");
        Ok(())
    }

    // ==================================================================
    // Builders
    // ==================================================================

    pub(crate) async fn phase_builders(&mut self) -> PipelineResult<()> {
        info!("Starting parallel builders phase");
        self.ledger.start_phase(phases::BUILDERS);

        if self.shutdown.should_stop() {
            warn!("Shutdown requested before builders phase");
            self.ledger.end_phase(0.0);
            return self.save();
        }

        let (map_path, depth) = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            (snap.service_map_path.clone(), snap.depth)
        };
        let service_map = read_service_map(Path::new(&map_path))?;
        let services: Vec<ServiceInfo> = service_map
            .services
            .into_iter()
            .filter(|s| !s.service_id.is_empty())
            .collect();

        {
            let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.total_builders = services.len() as u32;
        }

        // Inject failure memory from prior runs before dispatch.
        for service in &services {
            let context = build_failure_context(
                &service.service_id,
                &service.stack_label(),
                &self.config.persistence,
                self.pattern_store.as_deref(),
                self.run_tracker.as_deref(),
            );
            if !context.is_empty() {
                let dir = self.dispatcher.output_dir(&service.service_id);
                ensure_dir(&dir)?;
                std::fs::write(dir.join("FAILURE_CONTEXT.md"), context)
                    .map_err(|e| PipelineError::Other(e.into()))?;
            }
        }

        let results = self.dispatcher.run_parallel(&services, depth, &self.shutdown).await;

        let mut successful = 0u32;
        let mut total_cost = 0.0;
        let mut budget_hit = false;
        {
            let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
            for result in &results {
                snap.builder_costs.insert(result.service_id.clone(), result.total_cost);
                snap.builder_statuses.insert(
                    result.service_id.clone(),
                    if result.success { BuilderStatus::Healthy } else { BuilderStatus::Failed },
                );
                if result.success {
                    successful += 1;
                }
                total_cost += result.total_cost;
                snap.builder_results.insert(result.service_id.clone(), result.clone());

                // Budget gate on completion of each builder.
                self.ledger.add_phase_cost(phases::BUILDERS, result.total_cost);
                if !self.ledger.check_budget().0 {
                    budget_hit = true;
                }
            }
            snap.successful_builders = successful;
            snap.record_artifacts(
                phases::BUILDERS,
                [
                    ("total_builders", services.len().to_string()),
                    ("successful_builders", successful.to_string()),
                    ("total_cost", format!("{total_cost}")),
                ],
            );
            snap.mark_phase_complete(phases::BUILDERS);
        }
        self.ledger.end_phase(0.0);
        self.sync_costs();
        self.save()?;

        info!(
            "Builders complete: {successful}/{} succeeded, cost=${total_cost:.4}",
            results.len()
        );

        if budget_hit {
            return Err(PipelineError::BudgetExceeded {
                total_cost: self.ledger.total_cost(),
                budget_limit: self.ledger.budget_limit().unwrap_or_default(),
            });
        }
        if successful == 0 && !results.is_empty() {
            return Err(PipelineError::BuilderFailure(format!(
                "All {} builders failed",
                results.len()
            )));
        }
        Ok(())
    }

    // ==================================================================
    // Integration
    // ==================================================================

    pub(crate) async fn phase_integration(&mut self) -> PipelineResult<()> {
        info!("Starting integration phase");
        self.ledger.start_phase(phases::INTEGRATION);

        if self.shutdown.should_stop() {
            warn!("Shutdown requested before integration phase");
            self.ledger.end_phase(0.0);
            return self.save();
        }

        let (map_path, statuses) = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            (snap.service_map_path.clone(), snap.builder_statuses.clone())
        };
        let service_map = read_service_map(Path::new(&map_path))?;
        let services: Vec<ServiceInfo> = service_map
            .services
            .into_iter()
            .filter(|s| statuses.get(&s.service_id) == Some(&BuilderStatus::Healthy))
            .collect();

        let report_path = self.output_dir.join("integration_report.json");
        let md_path = self.output_dir.join("INTEGRATION_REPORT.md");

        let report = if services.is_empty() {
            warn!("No passing services to integrate");
            IntegrationReport::failed()
        } else {
            self.deploy_and_verify(&services).await
        };

        atomic_write_json(&report_path, &report)?;
        std::fs::write(&md_path, render_integration_markdown(&report))
            .map_err(|e| PipelineError::Other(e.into()))?;

        self.ledger.end_phase(0.0);
        {
            let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.integration_report_path = report_path.to_string_lossy().to_string();
            snap.services_deployed = services.iter().map(|s| s.service_id.clone()).collect();
            snap.record_artifacts(
                phases::INTEGRATION,
                [
                    ("report_path", report_path.to_string_lossy().to_string()),
                    ("md_report_path", md_path.to_string_lossy().to_string()),
                ],
            );
            snap.mark_phase_complete(phases::INTEGRATION);
        }
        self.sync_costs();
        self.save()?;
        info!(
            "Integration phase complete: {}/{} healthy, health={}",
            report.services_healthy, report.services_deployed, report.overall_health
        );
        Ok(())
    }

    /// Compose, start, health-check, and verify; services are stopped on
    /// every path, success or failure.
    async fn deploy_and_verify(&self, services: &[ServiceInfo]) -> IntegrationReport {
        let compose_path = match generate_compose_file(
            services,
            &self.output_dir,
            &self.config.integration.traefik_image,
        ) {
            Ok(path) => path,
            Err(e) => {
                return failed_report(services.len(), format!("Compose generation failed: {e:#}"));
            }
        };
        let runtime = (self.runtime_factory)(compose_path);

        let report = match runtime.start_services().await {
            Ok(()) => {
                let health = runtime
                    .wait_for_healthy(
                        Duration::from_secs(self.config.integration.compose_timeout_s),
                        Duration::from_secs(self.config.integration.health_poll_interval_s),
                    )
                    .await;
                let healthy = health.services.values().filter(|s| *s == "healthy").count() as u32;
                IntegrationReport {
                    services_deployed: services.len() as u32,
                    services_healthy: healthy,
                    overall_health: if health.all_healthy {
                        "healthy".to_string()
                    } else {
                        "degraded".to_string()
                    },
                    ..IntegrationReport::default()
                }
            }
            Err(e) => {
                warn!("Integration phase error: {e:#}");
                failed_report(services.len(), format!("Integration phase failed: {e:#}"))
            }
        };

        if let Err(e) = runtime.stop_services().await {
            warn!("Failed to stop services: {e:#}");
        }
        report
    }

    // ==================================================================
    // Quality gate
    // ==================================================================

    pub(crate) async fn phase_quality_gate(&mut self) -> PipelineResult<QualityGateReport> {
        info!("Starting quality gate phase");
        self.ledger.start_phase(phases::QUALITY_GATE);

        if self.shutdown.should_stop() {
            warn!("Shutdown requested before quality gate");
            self.ledger.end_phase(0.0);
            self.save()?;
            return Ok(QualityGateReport::default());
        }

        let (builder_results, integration_path, attempts, max_attempts) = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            (
                snap.builder_results.clone(),
                snap.integration_report_path.clone(),
                snap.quality_attempts,
                snap.max_quality_retries,
            )
        };

        let integration_report: IntegrationReport = load_json(Path::new(&integration_path))
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let report = self
            .quality
            .run_all_layers(
                &builder_results,
                &integration_report,
                &self.output_dir,
                attempts,
                max_attempts,
            )
            .await?;

        let report_path = self.output_dir.join("quality_gate_report.json");
        let md_path = self.output_dir.join("QUALITY_GATE_REPORT.md");
        atomic_write_json(&report_path, &report)?;
        std::fs::write(&md_path, render_quality_markdown(&report))
            .map_err(|e| PipelineError::Other(e.into()))?;

        self.record_quality_learning(&report);

        self.ledger.end_phase(0.0);
        {
            let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.quality_report_path = report_path.to_string_lossy().to_string();
            snap.last_quality_results =
                serde_json::to_value(&report).unwrap_or(Value::Null);
            snap.record_artifacts(
                phases::QUALITY_GATE,
                [
                    ("report_path", report_path.to_string_lossy().to_string()),
                    ("md_report_path", md_path.to_string_lossy().to_string()),
                    ("overall_verdict", report.overall_verdict.to_string()),
                ],
            );
            snap.mark_phase_complete(phases::QUALITY_GATE);
        }
        self.sync_costs();
        self.save()?;

        info!(
            "Quality gate complete: verdict={}, violations={}, blocking={}",
            report.overall_verdict, report.total_violations, report.blocking_violations
        );
        Ok(report)
    }

    /// Feed gate findings into the cross-run learning stores.
    fn record_quality_learning(&self, report: &QualityGateReport) {
        let stacks = self.service_stacks();
        let pipeline_id = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.pipeline_id.clone()
        };
        for violation in report.all_violations() {
            let stack = stacks
                .get(&violation.service)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            if let Some(tracker) = &self.run_tracker {
                tracker.record_violation(&pipeline_id, &violation, &violation.service, &stack);
            }
            if let Some(store) = &self.pattern_store {
                store.add_violation_pattern(&violation, &stack, "", false);
            }
        }
        if let Some(tracker) = &self.run_tracker {
            tracker.update_scan_code_stats(&pipeline_id);
        }
    }

    fn service_stacks(&self) -> BTreeMap<String, String> {
        let map_path = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.service_map_path.clone()
        };
        read_service_map(Path::new(&map_path))
            .map(|map| {
                map.services
                    .iter()
                    .map(|s| (s.service_id.clone(), s.stack_label()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ==================================================================
    // Fix pass
    // ==================================================================

    pub(crate) async fn phase_fix_pass(&mut self) -> PipelineResult<()> {
        let attempt = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.quality_attempts + 1
        };
        info!("Starting fix pass (attempt {attempt})");
        self.ledger.start_phase(phases::FIX_PASS);

        if self.shutdown.should_stop() {
            warn!("Shutdown requested before fix pass");
            self.ledger.end_phase(0.0);
            return self.save();
        }

        let quality_results = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.last_quality_results.clone()
        };
        let violations = extract_violations(&quality_results);

        let mut by_service: BTreeMap<String, Vec<Violation>> = BTreeMap::new();
        for violation in violations {
            let service = if violation.service.is_empty() {
                "unknown".to_string()
            } else {
                violation.service.clone()
            };
            by_service.entry(service).or_default().push(violation);
        }

        let stacks = self.service_stacks();
        let fix_loop = FixLoop::new(&self.dispatcher);
        let mut total_fix_cost = 0.0;
        let services_fixed = by_service.len();

        for (service_id, violations) in &by_service {
            if self.shutdown.should_stop() {
                break;
            }
            let builder_dir = self.dispatcher.output_dir(service_id);
            let mut context = self
                .graph_engine
                .as_ref()
                .map(|engine| engine.get_service_context(service_id).context_text)
                .unwrap_or_default();
            let stack = stacks
                .get(service_id)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            context.push_str(&build_fix_context(
                violations,
                &stack,
                &self.config.persistence,
                self.pattern_store.as_deref(),
            ));

            match fix_loop
                .feed_violations_to_builder(service_id, violations, &builder_dir, &context)
                .await
            {
                Ok(result) => total_fix_cost += result.total_cost,
                Err(e) => warn!("Fix pass for service {service_id} failed: {e:#}"),
            }
        }

        self.ledger.end_phase(total_fix_cost);
        {
            let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.quality_attempts += 1;
            let attempt = snap.quality_attempts.to_string();
            snap.record_artifacts(
                phases::FIX_PASS,
                [
                    ("attempt", attempt),
                    ("services_fixed", services_fixed.to_string()),
                    ("total_cost", format!("{total_fix_cost}")),
                ],
            );
            snap.mark_phase_complete(phases::FIX_PASS);
        }
        self.sync_costs();
        self.save()?;
        info!("Fix pass complete: attempt {attempt}, cost=${total_fix_cost:.4}");
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn read_service_map(path: &Path) -> PipelineResult<ServiceMap> {
    load_json(path)
        .and_then(|v| serde_json::from_value(v).ok())
        .ok_or_else(|| {
            PipelineError::Configuration(format!(
                "Service map missing or unreadable at {}",
                path.display()
            ))
        })
}

fn failed_report(deployed: usize, message: String) -> IntegrationReport {
    IntegrationReport {
        services_deployed: deployed as u32,
        services_healthy: 0,
        violations: vec![Violation {
            code: "INTEGRATION-001".to_string(),
            severity: "error".to_string(),
            message,
            ..Violation::default()
        }],
        overall_health: "failed".to_string(),
        ..IntegrationReport::default()
    }
}

/// Flatten `layers.*.violations[]` out of an inline quality report.
fn extract_violations(quality_results: &Value) -> Vec<Violation> {
    let mut violations = Vec::new();
    let Some(layers) = quality_results.get("layers").and_then(Value::as_object) else {
        return violations;
    };
    for layer in layers.values() {
        let Some(raw) = layer.get("violations").and_then(Value::as_array) else {
            continue;
        };
        for value in raw {
            if let Ok(violation) = serde_json::from_value::<Violation>(value.clone()) {
                violations.push(violation);
            }
        }
    }
    violations
}

fn render_integration_markdown(report: &IntegrationReport) -> String {
    let mut lines = vec![
        "# Integration Report".to_string(),
        String::new(),
        format!("- **Services deployed**: {}", report.services_deployed),
        format!("- **Services healthy**: {}", report.services_healthy),
        format!(
            "- **Contract tests**: {}/{}",
            report.contract_tests_passed, report.contract_tests_total
        ),
        format!(
            "- **Integration tests**: {}/{}",
            report.integration_tests_passed, report.integration_tests_total
        ),
        format!("- **Overall health**: {}", report.overall_health),
    ];
    if !report.violations.is_empty() {
        lines.push(String::new());
        lines.push("## Violations".to_string());
        for violation in &report.violations {
            lines.push(format!(
                "- `{}` [{}] {}",
                violation.code, violation.severity, violation.message
            ));
        }
    }
    lines.join("\n")
}

fn render_quality_markdown(report: &QualityGateReport) -> String {
    let mut lines = vec![
        "# Quality Gate Report".to_string(),
        String::new(),
        format!("- **Verdict**: {}", report.overall_verdict),
        format!("- **Total violations**: {}", report.total_violations),
        format!("- **Blocking violations**: {}", report.blocking_violations),
    ];
    for (name, layer) in &report.layers {
        lines.push(String::new());
        lines.push(format!("## Layer: {name} ({})", layer.verdict));
        for violation in &layer.violations {
            lines.push(format!(
                "- `{}` [{}] {} ({})",
                violation.code, violation.severity, violation.message, violation.service
            ));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildsmith_models::{GateLayerReport, GateVerdict};
    use serde_json::json;

    #[test]
    fn extract_violations_reads_all_layers() {
        let results = json!({
            "overall_verdict": "failed",
            "layers": {
                "contract": {"verdict": "failed", "violations": [
                    {"code": "API-001", "severity": "error", "service": "auth-service",
                     "message": "response schema mismatch"}
                ]},
                "static": {"verdict": "passed", "violations": []},
            }
        });
        let violations = extract_violations(&results);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, "API-001");
        assert_eq!(violations[0].service, "auth-service");
    }

    #[test]
    fn extract_violations_handles_missing_layers() {
        assert!(extract_violations(&Value::Null).is_empty());
        assert!(extract_violations(&json!({"overall_verdict": "passed"})).is_empty());
    }

    #[test]
    fn integration_markdown_lists_violations() {
        let report = failed_report(2, "compose up failed".to_string());
        let text = render_integration_markdown(&report);
        assert!(text.starts_with("# Integration Report"));
        assert!(text.contains("- **Overall health**: failed"));
        assert!(text.contains("`INTEGRATION-001`"));
    }

    #[test]
    fn quality_markdown_renders_layers() {
        let mut report = QualityGateReport {
            overall_verdict: GateVerdict::Failed,
            total_violations: 1,
            blocking_violations: 1,
            ..QualityGateReport::default()
        };
        report.layers.insert(
            "contract".to_string(),
            GateLayerReport {
                verdict: GateVerdict::Failed,
                violations: vec![Violation::new("API-001", "error", "mismatch")],
            },
        );
        let text = render_quality_markdown(&report);
        assert!(text.contains("## Layer: contract (failed)"));
        assert!(text.contains("`API-001`"));
    }
}
