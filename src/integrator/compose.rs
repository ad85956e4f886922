//! docker-compose file generation for built services.
//!
//! Renders one app service block per built service plus a Traefik
//! reverse-proxy front. The rendering itself is plain serde_yaml over a
//! JSON tree.

use anyhow::{Context, Result};
use buildsmith_models::ServiceInfo;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Name of the generated compose file inside the output dir.
pub const COMPOSE_FILE: &str = "docker-compose.generated.yml";

/// Generate the compose file for `services`, returning its path.
pub fn generate_compose_file(
    services: &[ServiceInfo],
    output_dir: &Path,
    traefik_image: &str,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let mut service_blocks = serde_json::Map::new();
    service_blocks.insert(
        "traefik".to_string(),
        json!({
            "image": traefik_image,
            "command": [
                "--providers.docker=true",
                "--providers.docker.exposedbydefault=false",
                "--entrypoints.web.address=:80",
            ],
            "ports": ["80:80"],
            "volumes": ["/var/run/docker.sock:/var/run/docker.sock:ro"],
            "networks": ["buildsmith"],
        }),
    );

    for svc in services {
        let router = format!("traefik.http.routers.{}.rule", svc.service_id);
        let port_label = format!(
            "traefik.http.services.{}.loadbalancer.server.port",
            svc.service_id
        );
        let mut block = serde_json::Map::new();
        if svc.docker_image.is_empty() {
            block.insert("build".to_string(), json!(format!("./{}", svc.service_id)));
        } else {
            block.insert("image".to_string(), json!(svc.docker_image));
        }
        block.insert("ports".to_string(), json!([format!("{0}:{0}", svc.port)]));
        block.insert(
            "labels".to_string(),
            json!([
                "traefik.enable=true",
                format!("{router}=PathPrefix(`/{}`)", svc.service_id),
                format!("{port_label}={}", svc.port),
            ]),
        );
        block.insert(
            "healthcheck".to_string(),
            json!({
                "test": ["CMD", "curl", "-f",
                         format!("http://localhost:{}{}", svc.port, svc.health_endpoint)],
                "interval": "5s",
                "timeout": "3s",
                "retries": 10,
            }),
        );
        block.insert("networks".to_string(), json!(["buildsmith"]));
        service_blocks.insert(svc.service_id.clone(), serde_json::Value::Object(block));
    }

    let compose = json!({
        "services": service_blocks,
        "networks": {"buildsmith": {"driver": "bridge"}},
    });

    let path = output_dir.join(COMPOSE_FILE);
    let yaml = serde_yaml::to_string(&compose).context("Failed to render compose file")?;
    std::fs::write(&path, yaml).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
