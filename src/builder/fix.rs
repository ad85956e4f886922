//! The fix loop: classify violations, write FIX_INSTRUCTIONS.md, and
//! relaunch the builder in quick mode.

use anyhow::{Context, Result};
use buildsmith_models::{BuilderResult, Violation};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::builder::dispatcher::BuilderDispatcher;
use crate::config::Depth;

/// Severity buckets, highest first. Unknown severities map to `error`.
pub const SEVERITY_ORDER: [&str; 4] = ["critical", "error", "warning", "info"];

fn priority_of(severity: &str) -> &'static str {
    match severity.to_lowercase().as_str() {
        "critical" => "P0",
        "error" => "P1",
        "warning" | "info" => "P2",
        _ => "P1",
    }
}

fn priority_label(priority: &str) -> &'static str {
    match priority {
        "P0" => "P0 (Must Fix)",
        "P1" => "P1 (Should Fix)",
        _ => "P2 (Nice to Have)",
    }
}

/// Feeds quality-gate violations back into builder workers.
pub struct FixLoop<'a> {
    dispatcher: &'a BuilderDispatcher,
}

impl<'a> FixLoop<'a> {
    pub fn new(dispatcher: &'a BuilderDispatcher) -> Self {
        Self { dispatcher }
    }

    /// Group violations by severity into the four fixed buckets; all
    /// buckets are present even when empty.
    pub fn classify_violations(violations: &[Violation]) -> BTreeMap<&'static str, Vec<Violation>> {
        let mut classified: BTreeMap<&'static str, Vec<Violation>> =
            SEVERITY_ORDER.iter().map(|s| (*s, Vec::new())).collect();
        for violation in violations {
            let bucket = match violation.severity.to_lowercase().as_str() {
                "critical" => "critical",
                "warning" => "warning",
                "info" => "info",
                _ => "error",
            };
            classified
                .get_mut(bucket)
                .expect("severity buckets are fixed")
                .push(violation.clone());
        }
        classified
    }

    /// Write `FIX_INSTRUCTIONS.md` into the service output directory,
    /// grouping findings into priority sections.
    pub fn write_fix_instructions(
        output_dir: &Path,
        violations: &[Violation],
        graph_rag_context: &str,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let mut buckets: BTreeMap<&str, Vec<&Violation>> =
            [("P0", Vec::new()), ("P1", Vec::new()), ("P2", Vec::new())]
                .into_iter()
                .collect();
        for violation in violations {
            buckets
                .get_mut(priority_of(&violation.severity))
                .expect("priority buckets are fixed")
                .push(violation);
        }

        let mut lines: Vec<String> = vec!["# Fix Instructions".to_string(), String::new()];
        for priority in ["P0", "P1", "P2"] {
            let group = &buckets[priority];
            if group.is_empty() {
                continue;
            }
            lines.push(format!("## Priority: {}", priority_label(priority)));
            lines.push(String::new());
            for violation in group {
                let component = if violation.file_path.is_empty() {
                    violation.service.clone()
                } else {
                    format!("{}/{}", violation.service, violation.file_path)
                };
                let evidence = if violation.actual.is_empty() {
                    violation.endpoint.clone()
                } else {
                    format!("{}: {}", violation.endpoint, violation.actual)
                };
                lines.push(format!("### {}: {}", violation.code, violation.message));
                lines.push(format!("- **Component**: {component}"));
                if !evidence.is_empty() {
                    lines.push(format!("- **Evidence**: {evidence}"));
                }
                lines.push(format!("- **Action**: {}", violation.message));
                lines.push(String::new());
            }
        }

        if !graph_rag_context.is_empty() {
            lines.push("## Cross-Service Dependency Context".to_string());
            lines.push(String::new());
            lines.push(
                "The following context describes how other services depend on this one."
                    .to_string(),
            );
            lines.push("Consider cross-service impact when applying fixes.".to_string());
            lines.push(String::new());
            lines.push(graph_rag_context.to_string());
        }

        let instructions_path = output_dir.join("FIX_INSTRUCTIONS.md");
        std::fs::write(&instructions_path, lines.join("\n"))
            .with_context(|| format!("Failed to write {}", instructions_path.display()))?;
        info!(
            "Wrote {} ({} violations)",
            instructions_path.display(),
            violations.len()
        );
        Ok(instructions_path)
    }

    /// Write fix instructions and relaunch the builder in quick depth.
    pub async fn feed_violations_to_builder(
        &self,
        service_id: &str,
        violations: &[Violation],
        builder_dir: &Path,
        graph_rag_context: &str,
    ) -> Result<BuilderResult> {
        Self::write_fix_instructions(builder_dir, violations, graph_rag_context)?;
        Ok(self.dispatcher.invoke(service_id, builder_dir, Depth::Quick).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(code: &str, severity: &str, message: &str) -> Violation {
        Violation {
            code: code.to_string(),
            severity: severity.to_string(),
            service: "auth-service".to_string(),
            endpoint: "/login".to_string(),
            message: message.to_string(),
            actual: "500".to_string(),
            file_path: "auth/login.py".to_string(),
            ..Violation::default()
        }
    }

    #[test]
    fn classify_fills_all_four_buckets() {
        let violations = vec![
            violation("A", "critical", "a"),
            violation("B", "error", "b"),
            violation("C", "warning", "c"),
            violation("D", "info", "d"),
        ];
        let classified = FixLoop::classify_violations(&violations);
        assert_eq!(classified.len(), 4);
        assert_eq!(classified["critical"].len(), 1);
        assert_eq!(classified["error"].len(), 1);
        assert_eq!(classified["warning"].len(), 1);
        assert_eq!(classified["info"].len(), 1);
    }

    #[test]
    fn unknown_severity_maps_to_error() {
        let violations = vec![violation("X", "catastrophic", "x")];
        let classified = FixLoop::classify_violations(&violations);
        assert_eq!(classified["error"].len(), 1);
        assert!(classified["critical"].is_empty());
    }

    #[test]
    fn empty_input_still_has_all_buckets() {
        let classified = FixLoop::classify_violations(&[]);
        assert_eq!(classified.len(), 4);
        assert!(classified.values().all(Vec::is_empty));
    }

    #[test]
    fn fix_instructions_follow_the_priority_format() {
        let dir = tempfile::tempdir().unwrap();
        let violations = vec![
            violation("SEC-001", "critical", "secret leaked"),
            violation("LINT-002", "warning", "unused import"),
        ];
        let path = FixLoop::write_fix_instructions(dir.path(), &violations, "").unwrap();
        let text = std::fs::read_to_string(path).unwrap();

        assert!(text.starts_with("# Fix Instructions"));
        assert!(text.contains("## Priority: P0 (Must Fix)"));
        assert!(text.contains("## Priority: P2 (Nice to Have)"));
        // No error-severity findings, so no P1 section.
        assert!(!text.contains("## Priority: P1 (Should Fix)"));
        assert!(text.contains("### SEC-001: secret leaked"));
        assert!(text.contains("- **Component**: auth-service/auth/login.py"));
        assert!(text.contains("- **Evidence**: /login: 500"));
        assert!(text.contains("- **Action**: secret leaked"));
        assert!(!text.contains("## Cross-Service Dependency Context"));
    }

    #[test]
    fn graph_context_appends_trailing_section() {
        let dir = tempfile::tempdir().unwrap();
        let violations = vec![violation("SEC-001", "error", "x")];
        let path = FixLoop::write_fix_instructions(
            dir.path(),
            &violations,
            "## Graph RAG Context: auth-service",
        )
        .unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("## Cross-Service Dependency Context"));
        assert!(text.contains("## Graph RAG Context: auth-service"));
    }

    #[tokio::test]
    async fn feed_violations_writes_instructions_and_invokes_builder() {
        use crate::config::BuilderConfig;

        let dir = tempfile::tempdir().unwrap();
        // Worker that proves it ran in quick depth by echoing into STATE.json.
        let script = dir.path().join("worker.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             cwd=\"\"\ndepth=\"\"\n\
             while [ $# -gt 0 ]; do\n\
               case \"$1\" in\n\
                 --cwd) cwd=\"$2\"; shift;;\n\
                 --depth) depth=\"$2\"; shift;;\n\
               esac\n\
               shift\n\
             done\n\
             mkdir -p \"$cwd/.agent-team\"\n\
             printf '{\"total_cost\": 0.05, \"health\": \"%s\", \"summary\": {\"success\": true}}' \"$depth\" \
               > \"$cwd/.agent-team/STATE.json\"\n",
        )
        .unwrap();

        let dispatcher = BuilderDispatcher::new(
            BuilderConfig {
                command: vec!["sh".to_string(), script.to_string_lossy().to_string()],
                max_concurrent: 1,
                timeout_s: 10,
                depth: Depth::Standard,
            },
            dir.path().to_path_buf(),
        );
        let fix_loop = FixLoop::new(&dispatcher);
        let builder_dir = dispatcher.output_dir("auth-service");

        let result = fix_loop
            .feed_violations_to_builder(
                "auth-service",
                &[violation("SEC-001", "critical", "secret leaked")],
                &builder_dir,
                "",
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.health, "quick"); // worker saw --depth quick
        assert!(builder_dir.join("FIX_INSTRUCTIONS.md").exists());
    }
}
