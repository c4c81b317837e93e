//! Aggregator configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::events::LabelFilter;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_prefix() -> String {
    "x".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ignore_prefixes() -> Vec<String> {
    vec!["mcp-aggregator".to_string(), "port-forward".to_string()]
}

/// Top-level configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Front-end bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Front-end bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix applied to aggregator-owned tools (workflow actions,
    /// workflow management, API surface).
    #[serde(default = "default_prefix")]
    pub envctl_prefix: String,

    /// Project configuration directory. Setting it enables the workflow
    /// manager; workflows live under `<config_dir>/workflows`.
    #[serde(default)]
    pub config_dir: Option<String>,

    /// Disable destructive-tool marking at publish time.
    #[serde(default)]
    pub yolo: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub events: EventsConfig,
}

/// Event-handler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Service labels starting with any of these prefixes are ignored.
    #[serde(default = "default_ignore_prefixes")]
    pub ignore_prefixes: Vec<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            ignore_prefixes: default_ignore_prefixes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            envctl_prefix: default_prefix(),
            config_dir: None,
            yolo: false,
            log_level: default_log_level(),
            events: EventsConfig::default(),
        }
    }
}

impl Config {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml_ng::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    fn expanded_config_dir(&self) -> Option<PathBuf> {
        self.config_dir
            .as_deref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned()))
    }

    /// `<config_dir>/workflows`, when the workflow manager is enabled.
    pub fn project_workflows_dir(&self) -> Option<PathBuf> {
        self.expanded_config_dir().map(|dir| dir.join("workflows"))
    }

    /// `<user-config>/mcpmux/workflows`.
    pub fn user_workflows_dir(&self) -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mcpmux").join("workflows"))
    }

    /// Compatibility path for the old single-file catalog.
    pub fn legacy_workflows_file(&self) -> Option<PathBuf> {
        self.expanded_config_dir()
            .map(|dir| dir.join("agent_workflows.yaml"))
    }

    /// Whether the workflow subsystem is active at all.
    pub fn workflows_enabled(&self) -> bool {
        self.config_dir.is_some()
    }

    pub fn label_filter(&self) -> LabelFilter {
        LabelFilter::new(self.events.ignore_prefixes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8080);
        assert_eq!(config.envctl_prefix, "x");
        assert!(!config.yolo);
        assert!(!config.workflows_enabled());
        assert!(config.project_workflows_dir().is_none());
    }

    #[test]
    fn parses_partial_yaml_with_defaults() {
        let config: Config = serde_yaml_ng::from_str(
            "port: 9191\nconfig_dir: /tmp/agg\nyolo: true\n",
        )
        .unwrap();
        assert_eq!(config.port, 9191);
        assert_eq!(config.host, "localhost");
        assert!(config.yolo);
        assert!(config.workflows_enabled());
        assert_eq!(
            config.project_workflows_dir().unwrap(),
            PathBuf::from("/tmp/agg/workflows")
        );
        assert_eq!(
            config.legacy_workflows_file().unwrap(),
            PathBuf::from("/tmp/agg/agent_workflows.yaml")
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/definitely/not/here.yaml")).unwrap();
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn custom_event_prefixes_reach_the_filter() {
        let config: Config = serde_yaml_ng::from_str(
            "events:\n  ignore_prefixes: [\"internal-\"]\n",
        )
        .unwrap();
        let filter = config.label_filter();
        assert!(!filter.accepts("internal-svc"));
        assert!(filter.accepts("mcp-aggregator"));
    }
}
