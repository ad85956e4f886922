//! Failure-memory and fix-example context blocks for builder prompts.
//!
//! Both builders return bounded markdown delimited by an ASCII ruler.
//! When persistence is disabled or the stores are absent, they return
//! empty strings; injection is always best-effort.

use buildsmith_models::Violation;
use serde_json::Value;
use std::collections::HashSet;

use crate::config::PersistenceConfig;
use crate::persistence::pattern_store::PatternStore;
use crate::persistence::run_tracker::RunTracker;

const RULER: &str = "================================================";

/// Assemble the failure-memory section for a builder prompt.
///
/// Queries the run tracker for top violations on this tech stack and the
/// pattern store for semantically similar prior patterns.
pub fn build_failure_context(
    service_name: &str,
    tech_stack: &str,
    config: &PersistenceConfig,
    pattern_store: Option<&PatternStore>,
    run_tracker: Option<&RunTracker>,
) -> String {
    if !config.enabled {
        return String::new();
    }
    if pattern_store.is_none() && run_tracker.is_none() {
        return String::new();
    }

    let max_patterns = config.max_patterns_per_injection;
    let mut sections: Vec<String> = Vec::new();

    if let Some(tracker) = run_tracker {
        let stats = tracker.get_stats_for_stack(tech_stack);
        if !stats.is_empty() {
            let lines: Vec<String> = stats
                .iter()
                .take(max_patterns)
                .map(|s| {
                    format!(
                        "- {}: {} occurrences, fix rate {:.0}%",
                        s.scan_code,
                        s.occurrence_count,
                        s.fix_success_rate * 100.0
                    )
                })
                .collect();
            sections.push(format!(
                "Top recurring violations for this tech stack:\n{}",
                lines.join("\n")
            ));
        }
    }

    if let Some(store) = pattern_store {
        let patterns = store.find_similar_patterns(
            &format!("Common violations for {service_name} {tech_stack}"),
            tech_stack,
            max_patterns,
        );
        if !patterns.is_empty() {
            let lines: Vec<String> = patterns
                .iter()
                .map(|p| {
                    let code = p
                        .metadata
                        .get("scan_code")
                        .and_then(Value::as_str)
                        .unwrap_or("?");
                    format!("- [{code}] {}", truncate(&p.document, 200))
                })
                .collect();
            sections.push(format!(
                "Similar violation patterns from prior runs:\n{}",
                lines.join("\n")
            ));
        }
    }

    if sections.is_empty() {
        return String::new();
    }

    format!(
        "\n\n{RULER}\nFAILURE MEMORY FROM PRIOR RUNS\n{RULER}\n\
         Service: {service_name} | Stack: {tech_stack}\n\n\
         {}\n\n\
         Use this information to proactively avoid these violations.\n{RULER}\n",
        sections.join("\n\n")
    )
}

/// Assemble the fix-example section for `FIX_INSTRUCTIONS.md` injection.
pub fn build_fix_context(
    violations: &[Violation],
    tech_stack: &str,
    config: &PersistenceConfig,
    pattern_store: Option<&PatternStore>,
) -> String {
    if !config.enabled {
        return String::new();
    }
    let Some(store) = pattern_store else {
        return String::new();
    };

    let max_patterns = config.max_patterns_per_injection;
    let mut examples: Vec<String> = Vec::new();
    let mut seen_codes: HashSet<&str> = HashSet::new();

    for violation in violations {
        if !seen_codes.insert(violation.code.as_str()) {
            continue;
        }
        for example in store.find_fix_examples(&violation.code, tech_stack, max_patterns.min(3)) {
            if !example.document.is_empty() {
                examples.push(format!(
                    "[{}] Prior fix:\n{}",
                    violation.code,
                    truncate(&example.document, 500)
                ));
            }
        }
        if examples.len() >= max_patterns {
            examples.truncate(max_patterns);
            break;
        }
    }

    if examples.is_empty() {
        return String::new();
    }

    format!(
        "\n\n{RULER}\nFIX EXAMPLES FROM PRIOR RUNS\n{RULER}\n\
         {}\n\n\
         Apply similar fix patterns where applicable.\n{RULER}\n",
        examples.join("\n\n")
    )
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool) -> PersistenceConfig {
        PersistenceConfig {
            enabled,
            max_patterns_per_injection: 5,
        }
    }

    #[test]
    fn disabled_persistence_yields_empty_blocks() {
        let store = PatternStore::open_in_memory();
        let tracker = RunTracker::open_in_memory();
        let text = build_failure_context(
            "auth-service",
            "python/fastapi",
            &config(false),
            Some(&store),
            Some(&tracker),
        );
        assert!(text.is_empty());
        assert!(build_fix_context(&[], "python/fastapi", &config(false), Some(&store)).is_empty());
    }

    #[test]
    fn missing_stores_yield_empty_blocks() {
        assert!(build_failure_context("svc", "stack", &config(true), None, None).is_empty());
        assert!(build_fix_context(&[], "stack", &config(true), None).is_empty());
    }

    #[test]
    fn failure_context_includes_header_and_stats() {
        let tracker = RunTracker::open_in_memory();
        tracker.record_violation(
            "run-1",
            &Violation::new("SEC-001", "critical", "hardcoded key"),
            "auth-service",
            "python/fastapi",
        );
        tracker.update_scan_code_stats("run-1");

        let text = build_failure_context(
            "auth-service",
            "python/fastapi",
            &config(true),
            None,
            Some(&tracker),
        );
        assert!(text.contains(RULER));
        assert!(text.contains("FAILURE MEMORY FROM PRIOR RUNS"));
        assert!(text.contains("Service: auth-service | Stack: python/fastapi"));
        assert!(text.contains("SEC-001: 1 occurrences"));
    }

    #[test]
    fn no_history_yields_empty_string() {
        let tracker = RunTracker::open_in_memory();
        let store = PatternStore::open_in_memory();
        let text = build_failure_context(
            "auth-service",
            "python/fastapi",
            &config(true),
            Some(&store),
            Some(&tracker),
        );
        assert!(text.is_empty());
    }

    #[test]
    fn fix_context_dedupes_codes_and_caps_examples() {
        let store = PatternStore::open_in_memory();
        store.add_fix_example("-a\n+b", "swap", "SEC-001", "python/fastapi");

        let violations = vec![
            Violation::new("SEC-001", "critical", "first"),
            Violation::new("SEC-001", "critical", "second (same code)"),
        ];
        let text = build_fix_context(&violations, "python/fastapi", &config(true), Some(&store));
        assert!(text.contains("FIX EXAMPLES FROM PRIOR RUNS"));
        // Code deduped: only one example block despite two violations.
        assert_eq!(text.matches("[SEC-001] Prior fix:").count(), 1);
    }
}
