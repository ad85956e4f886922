//! Prompt-context assembly for service context blocks.
//!
//! Produces a prioritized markdown block for builder prompt injection.
//! Sections are included whole, lowest priority number first, while the
//! running token estimate stays within budget; the first section that
//! would overflow is cut to a character prefix of the remaining quota and
//! marked, and everything after it is dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default soft token budget for an assembled context block.
pub const DEFAULT_MAX_TOKENS: usize = 2000;

/// An endpoint this service provides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProvidedEndpoint {
    pub method: String,
    pub path: String,
    pub handler: String,
    pub contract_id: String,
}

/// An endpoint this service consumes from another service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConsumedEndpoint {
    pub method: String,
    pub path: String,
    pub provider_service: String,
}

/// An event this service publishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PublishedEvent {
    pub event_name: String,
    pub channel: String,
}

/// An event this service consumes, with its known publisher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConsumedEvent {
    pub event_name: String,
    pub publisher_service: String,
}

/// A domain entity owned by this service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OwnedEntity {
    pub name: String,
    pub fields: Vec<Value>,
}

/// A domain entity owned elsewhere but referenced by this service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReferencedEntity {
    pub name: String,
    pub owning_service: String,
    pub fields: Vec<Value>,
}

/// Assembles structured markdown context from graph traversal data.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    max_tokens: usize,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl ContextAssembler {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    /// Produce the markdown context block for one service. Empty sections
    /// are omitted entirely.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble_service_context(
        &self,
        service_name: &str,
        provided_endpoints: &[ProvidedEndpoint],
        consumed_endpoints: &[ConsumedEndpoint],
        events_published: &[PublishedEvent],
        events_consumed: &[ConsumedEvent],
        owned_entities: &[OwnedEntity],
        referenced_entities: &[ReferencedEntity],
        depends_on: &[String],
        depended_on_by: &[String],
    ) -> String {
        let mut sections: Vec<(String, u8)> = Vec::new();

        sections.push((format!("## Graph RAG Context: {service_name}"), 0));

        if !depends_on.is_empty() || !depended_on_by.is_empty() {
            let mut lines = vec!["### Service Dependencies".to_string()];
            lines.push(format!(
                "- **Depends on:** {}",
                if depends_on.is_empty() { "none".to_string() } else { depends_on.join(", ") }
            ));
            lines.push(format!(
                "- **Depended on by:** {}",
                if depended_on_by.is_empty() {
                    "none".to_string()
                } else {
                    depended_on_by.join(", ")
                }
            ));
            sections.push((lines.join("\n"), 1));
        }

        if !consumed_endpoints.is_empty() {
            let mut lines = vec![
                "### APIs This Service Must Consume".to_string(),
                "| Method | Path | Provider Service |".to_string(),
                "|--------|------|-----------------|".to_string(),
            ];
            for ep in consumed_endpoints {
                lines.push(format!("| {} | {} | {} |", ep.method, ep.path, ep.provider_service));
            }
            sections.push((lines.join("\n"), 2));
        }

        if !referenced_entities.is_empty() {
            let mut lines = vec!["### Domain Entities Referenced (from other services)".to_string()];
            for ent in referenced_entities {
                if ent.owning_service.is_empty() {
                    lines.push(format!("#### {}", ent.name));
                } else {
                    lines.push(format!("#### {} (owned by {})", ent.name, ent.owning_service));
                }
                append_field_lines(&mut lines, &ent.fields);
            }
            sections.push((lines.join("\n"), 3));
        }

        if !provided_endpoints.is_empty() {
            let mut lines = vec![
                "### APIs This Service Provides".to_string(),
                "| Method | Path | Handler |".to_string(),
                "|--------|------|---------|".to_string(),
            ];
            for ep in provided_endpoints {
                lines.push(format!("| {} | {} | {} |", ep.method, ep.path, ep.handler));
            }
            sections.push((lines.join("\n"), 4));
        }

        if !events_published.is_empty() {
            let mut lines = vec![
                "### Events Published".to_string(),
                "| Event Name | Channel |".to_string(),
                "|------------|---------|".to_string(),
            ];
            for ev in events_published {
                lines.push(format!("| {} | {} |", ev.event_name, ev.channel));
            }
            sections.push((lines.join("\n"), 5));
        }

        if !events_consumed.is_empty() {
            let mut lines = vec![
                "### Events Consumed".to_string(),
                "| Event Name | Publisher |".to_string(),
                "|------------|----------|".to_string(),
            ];
            for ev in events_consumed {
                lines.push(format!("| {} | {} |", ev.event_name, ev.publisher_service));
            }
            sections.push((lines.join("\n"), 5));
        }

        if !owned_entities.is_empty() {
            let mut lines = vec!["### Domain Entities Owned".to_string()];
            for ent in owned_entities {
                lines.push(format!("#### {}", ent.name));
                append_field_lines(&mut lines, &ent.fields);
            }
            sections.push((lines.join("\n"), 6));
        }

        let notes = integration_notes(
            consumed_endpoints,
            events_published,
            events_consumed,
            depended_on_by,
        );
        if !notes.is_empty() {
            let mut lines = vec!["### Cross-Service Integration Notes".to_string()];
            lines.extend(notes.iter().map(|n| format!("- {n}")));
            sections.push((lines.join("\n"), 7));
        }

        self.truncate_to_budget(sections, self.max_tokens)
    }

    /// Assemble sections within a token budget. Token count is estimated
    /// as `ceil(chars / 4)`.
    pub fn truncate_to_budget(&self, mut sections: Vec<(String, u8)>, max_tokens: usize) -> String {
        sections.sort_by_key(|(_, priority)| *priority);
        let mut result: Vec<String> = Vec::new();
        let mut tokens_used = 0usize;

        for (text, _priority) in sections {
            let section_tokens = text.chars().count().div_ceil(4);
            if tokens_used + section_tokens <= max_tokens {
                tokens_used += section_tokens;
                result.push(text);
            } else {
                let remaining = max_tokens.saturating_sub(tokens_used);
                if remaining > 0 {
                    let prefix: String = text.chars().take(remaining * 4).collect();
                    result.push(format!("{prefix}\n[... truncated ...]"));
                }
                break;
            }
        }

        result.join("\n\n")
    }
}

fn append_field_lines(lines: &mut Vec<String>, fields: &[Value]) {
    for field in fields {
        match field {
            Value::Object(map) => {
                let name = map.get("name").and_then(Value::as_str).unwrap_or("");
                let field_type = map.get("type").and_then(Value::as_str).unwrap_or("");
                let description = map.get("description").and_then(Value::as_str).unwrap_or("");
                let mut entry = format!("- {name}: {field_type}");
                if !description.is_empty() {
                    entry.push_str(&format!(" ({description})"));
                }
                lines.push(entry);
            }
            other => lines.push(format!("- {other}")),
        }
    }
}

/// Deterministic integration notes: one per consumed endpoint, published
/// event, and consumed event.
fn integration_notes(
    consumed_endpoints: &[ConsumedEndpoint],
    events_published: &[PublishedEvent],
    events_consumed: &[ConsumedEvent],
    depended_on_by: &[String],
) -> Vec<String> {
    let mut notes = Vec::new();

    for ep in consumed_endpoints {
        if !ep.provider_service.is_empty() && !ep.method.is_empty() && !ep.path.is_empty() {
            notes.push(format!(
                "When calling {} {} {}, ensure the request matches the provider's contract schema.",
                ep.provider_service, ep.method, ep.path
            ));
        }
    }

    for ev in events_published {
        if !ev.event_name.is_empty() {
            let consumers = if depended_on_by.is_empty() {
                String::new()
            } else {
                format!(
                    " Downstream services ({}) may consume this event; ensure payload schema is stable.",
                    depended_on_by.join(", ")
                )
            };
            notes.push(format!(
                "When publishing {}, include all required fields in the payload.{}",
                ev.event_name, consumers
            ));
        }
    }

    for ev in events_consumed {
        if !ev.event_name.is_empty() && !ev.publisher_service.is_empty() {
            notes.push(format!(
                "Event {} is published by {}. Implement idempotent handling for this event.",
                ev.event_name, ev.publisher_service
            ));
        }
    }

    notes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_consumed() -> Vec<ConsumedEndpoint> {
        vec![ConsumedEndpoint {
            method: "GET".to_string(),
            path: "/users/{id}".to_string(),
            provider_service: "auth-service".to_string(),
        }]
    }

    #[test]
    fn empty_inputs_yield_only_the_header() {
        let assembler = ContextAssembler::default();
        let text = assembler.assemble_service_context(
            "order-service",
            &[],
            &[],
            &[],
            &[],
            &[],
            &[],
            &[],
            &[],
        );
        assert_eq!(text, "## Graph RAG Context: order-service");
    }

    #[test]
    fn consumed_apis_render_as_a_table_with_notes() {
        let assembler = ContextAssembler::default();
        let text = assembler.assemble_service_context(
            "order-service",
            &[],
            &one_consumed(),
            &[],
            &[],
            &[],
            &[],
            &["auth-service".to_string()],
            &[],
        );
        assert!(text.contains("### APIs This Service Must Consume"));
        assert!(text.contains("| GET | /users/{id} | auth-service |"));
        assert!(text.contains("### Service Dependencies"));
        assert!(text.contains("### Cross-Service Integration Notes"));
        assert!(text.contains("When calling auth-service GET /users/{id}"));
    }

    #[test]
    fn sections_are_separated_by_blank_lines() {
        let assembler = ContextAssembler::default();
        let text = assembler.assemble_service_context(
            "svc",
            &[],
            &one_consumed(),
            &[],
            &[],
            &[],
            &[],
            &[],
            &[],
        );
        assert!(text.contains("\n\n### APIs This Service Must Consume"));
    }

    #[test]
    fn over_budget_section_gets_char_prefix_and_marker() {
        let assembler = ContextAssembler::new(10);
        let sections = vec![
            ("short".to_string(), 0),
            ("x".repeat(400), 1),
            ("never included".to_string(), 2),
        ];
        let text = assembler.truncate_to_budget(sections, 10);
        assert!(text.starts_with("short"));
        assert!(text.contains("[... truncated ...]"));
        assert!(!text.contains("never included"));
        // 10 tokens budget, "short" uses ceil(5/4)=2, remainder 8 tokens = 32 chars
        let truncated_part = text.split("\n\n").nth(1).unwrap();
        let x_count = truncated_part.chars().filter(|c| *c == 'x').count();
        assert_eq!(x_count, 32);
    }

    #[test]
    fn exactly_fitting_sections_are_not_truncated() {
        let assembler = ContextAssembler::default();
        let sections = vec![("abcd".to_string(), 0), ("efgh".to_string(), 1)];
        let text = assembler.truncate_to_budget(sections, 2);
        assert_eq!(text, "abcd\n\nefgh");
    }

    #[test]
    fn published_event_notes_mention_downstream_services() {
        let notes = integration_notes(
            &[],
            &[PublishedEvent {
                event_name: "order.created".to_string(),
                channel: "orders".to_string(),
            }],
            &[],
            &["notification-service".to_string()],
        );
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("order.created"));
        assert!(notes[0].contains("notification-service"));
    }

    #[test]
    fn consumed_event_notes_require_publisher() {
        let notes = integration_notes(
            &[],
            &[],
            &[
                ConsumedEvent {
                    event_name: "user.registered".to_string(),
                    publisher_service: "auth-service".to_string(),
                },
                ConsumedEvent {
                    event_name: "unknown.source".to_string(),
                    publisher_service: String::new(),
                },
            ],
            &[],
        );
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("idempotent"));
    }
}
