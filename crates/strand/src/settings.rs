//! Server configuration.
//!
//! Layered: built-in defaults, then an optional TOML file, then
//! `STRAND_*` environment variables. The spec-kit template coordinates
//! additionally honor their dedicated environment variables.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Default spec-kit template version when the environment is silent.
pub const DEFAULT_SPEC_KIT_VERSION: &str = "v0.0.50";
/// Default spec-kit template name.
pub const DEFAULT_SPEC_KIT_TEMPLATE: &str = "spec-kit-template";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds.
    pub bind_addr: SocketAddr,
    /// Base directory for per-session state (event and run logs).
    pub state_dir: PathBuf,
    /// Runner endpoint template; `{name}` and `{project}` are substituted.
    pub runner_endpoint: String,
    /// Content-service endpoint template; `{project}` is substituted.
    pub content_endpoint: String,
    /// CORS origins allowed to call the API.
    pub allowed_origins: Vec<String>,
    /// ConfigMap carrying project-level Git defaults.
    pub git_defaults_configmap: String,
    /// Secret carrying external issue-tracker credentials.
    pub runner_secrets_name: String,
    /// Spec-kit template name for workflow workspace seeding.
    pub spec_kit_template: String,
    /// Spec-kit template version tag.
    pub spec_kit_version: String,
    /// Base URL the template archive is fetched from.
    pub spec_kit_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("default bind addr"),
            state_dir: PathBuf::from("/data/state"),
            runner_endpoint: "http://session-{name}.{project}.svc.cluster.local:8001".to_string(),
            content_endpoint: "http://content-service.{project}.svc.cluster.local:8080"
                .to_string(),
            allowed_origins: Vec::new(),
            git_defaults_configmap: "git-defaults".to_string(),
            runner_secrets_name: "runner-secrets".to_string(),
            spec_kit_template: DEFAULT_SPEC_KIT_TEMPLATE.to_string(),
            spec_kit_version: DEFAULT_SPEC_KIT_VERSION.to_string(),
            spec_kit_base_url: "https://github.com/github/spec-kit/releases/download".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration, layering file and environment over defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }
        let mut settings: ServerConfig = builder
            .add_source(Environment::with_prefix("STRAND").separator("__"))
            .build()
            .context("assembling configuration")?
            .try_deserialize()
            .context("deserializing configuration")?;

        // The template coordinates keep their historical env names.
        if let Ok(version) = std::env::var("SPEC_KIT_VERSION")
            && !version.is_empty()
        {
            settings.spec_kit_version = version;
        }
        if let Ok(name) = std::env::var("SPEC_KIT_TEMPLATE_NAME")
            && !name.is_empty()
        {
            settings.spec_kit_template = name;
        }
        Ok(settings)
    }

    /// Runner base URL for a session, by naming convention.
    pub fn runner_url(&self, project: &str, session: &str) -> String {
        self.runner_endpoint
            .replace("{name}", session)
            .replace("{project}", project)
    }

    /// Content-service base URL for a project.
    pub fn content_url(&self, project: &str) -> String {
        self.content_endpoint.replace("{project}", project)
    }

    /// Download URL of the workflow seeding archive.
    pub fn spec_kit_archive_url(&self) -> String {
        format!(
            "{}/{}/{}-{}.tar.gz",
            self.spec_kit_base_url,
            self.spec_kit_version,
            self.spec_kit_template,
            self.spec_kit_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.spec_kit_version, "v0.0.50");
        assert_eq!(cfg.git_defaults_configmap, "git-defaults");
        assert_eq!(cfg.runner_secrets_name, "runner-secrets");
    }

    #[test]
    fn runner_url_substitutes_both_parts() {
        let cfg = ServerConfig::default();
        assert_eq!(
            cfg.runner_url("demo", "session-1"),
            "http://session-session-1.demo.svc.cluster.local:8001"
        );
    }

    #[test]
    fn content_url_substitutes_project() {
        let cfg = ServerConfig::default();
        assert_eq!(
            cfg.content_url("demo"),
            "http://content-service.demo.svc.cluster.local:8080"
        );
    }

    #[test]
    fn archive_url_is_version_pinned() {
        let cfg = ServerConfig::default();
        assert!(
            cfg.spec_kit_archive_url()
                .ends_with("v0.0.50/spec-kit-template-v0.0.50.tar.gz")
        );
    }
}
