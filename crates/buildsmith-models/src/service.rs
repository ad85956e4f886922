//! Architect output types: service map, domain model, contract stubs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata about one service to build, taken from the service map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInfo {
    #[serde(default, alias = "name")]
    pub service_id: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub stack: serde_json::Value,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,
    #[serde(default)]
    pub docker_image: String,
    #[serde(default)]
    pub estimated_loc: u64,
}

fn default_domain() -> String {
    "unknown".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service_id: String::new(),
            domain: default_domain(),
            stack: serde_json::Value::Null,
            port: default_port(),
            health_endpoint: default_health_endpoint(),
            docker_image: String::new(),
            estimated_loc: 0,
        }
    }
}

impl ServiceInfo {
    pub fn named(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            ..Self::default()
        }
    }

    /// Short tech-stack label for learning-store grouping, e.g.
    /// `"python/fastapi"`. Falls back to the raw stack string.
    pub fn stack_label(&self) -> String {
        match &self.stack {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => {
                let language = map.get("language").and_then(|v| v.as_str()).unwrap_or("");
                let framework = map.get("framework").and_then(|v| v.as_str()).unwrap_or("");
                match (language.is_empty(), framework.is_empty()) {
                    (false, false) => format!("{language}/{framework}"),
                    (false, true) => language.to_string(),
                    _ => "unknown".to_string(),
                }
            }
            _ => "unknown".to_string(),
        }
    }
}

/// The architect's decomposition of a PRD into services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServiceMap {
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
}

/// A field of a domain entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EntityField {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub description: String,
}

/// A relationship between two domain entities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EntityRelationship {
    #[serde(default)]
    pub target: String,
    #[serde(default, rename = "type")]
    pub relationship_type: String,
    #[serde(default)]
    pub cardinality: String,
}

/// One entity of the domain model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DomainEntity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owning_service: String,
    #[serde(default)]
    pub fields: Vec<EntityField>,
    #[serde(default)]
    pub relationships: Vec<EntityRelationship>,
    #[serde(default)]
    pub referenced_by: Vec<String>,
}

/// The architect's domain model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DomainModel {
    #[serde(default)]
    pub entities: Vec<DomainEntity>,
}

/// Everything the architect phase produces in one shot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ArchitectOutput {
    #[serde(default)]
    pub service_map: ServiceMap,
    #[serde(default)]
    pub domain_model: DomainModel,
    /// Contract stubs keyed by service id; each value is the raw spec JSON.
    #[serde(default)]
    pub contract_stubs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_info_accepts_name_alias() {
        let svc: ServiceInfo = serde_json::from_str(r#"{"name": "auth-service"}"#).unwrap();
        assert_eq!(svc.service_id, "auth-service");
        assert_eq!(svc.port, 8080);
        assert_eq!(svc.health_endpoint, "/health");
    }

    #[test]
    fn stack_label_from_object() {
        let svc: ServiceInfo = serde_json::from_str(
            r#"{"service_id": "a", "stack": {"language": "python", "framework": "fastapi"}}"#,
        )
        .unwrap();
        assert_eq!(svc.stack_label(), "python/fastapi");
    }

    #[test]
    fn stack_label_from_string() {
        let svc: ServiceInfo =
            serde_json::from_str(r#"{"service_id": "a", "stack": "node/express"}"#).unwrap();
        assert_eq!(svc.stack_label(), "node/express");
    }

    #[test]
    fn architect_output_roundtrips() {
        let mut output = ArchitectOutput::default();
        output.service_map.services.push(ServiceInfo::named("auth-service"));
        output.cost = 0.42;
        output
            .contract_stubs
            .insert("auth-service".to_string(), serde_json::json!({"openapi": "3.0.0"}));
        let json = serde_json::to_string(&output).unwrap();
        let parsed: ArchitectOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, output);
    }
}
