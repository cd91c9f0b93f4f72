// SPDX-License-Identifier: MIT

//! Process configuration read from the environment (and `.env`)

use std::time::Duration;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_GRACE_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Overrides `apiServer.hostIp`
    pub host: Option<String>,
    /// Overrides `apiServer.portNum`
    pub port: Option<u16>,
    /// How long shutdown waits for in-flight executions
    pub grace_period: Duration,
    pub ollama_url: String,
    pub python_bin: String,
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            grace_period: Duration::from_secs(DEFAULT_GRACE_SECS),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            python_bin: "python3".to_string(),
            debug: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparseable values fall back to defaults
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = get("AGENTRUN_PORT").and_then(|v| match v.trim().parse::<u16>() {
            Ok(p) => Some(p),
            Err(_) => {
                log::warn!("Ignoring invalid AGENTRUN_PORT '{}'", v);
                None
            }
        });

        let grace_period = get("AGENTRUN_GRACE_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.grace_period);

        let debug = get("AGENTRUN_DEBUG")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self {
            host: get("AGENTRUN_HOST"),
            port,
            grace_period,
            ollama_url: get("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            python_bin: get("PYTHON_BIN").unwrap_or(defaults.python_bin),
            debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_vars(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.ollama_url, "http://localhost:11434");
        assert_eq!(cfg.grace_period, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("AGENTRUN_HOST", "0.0.0.0"),
            ("AGENTRUN_PORT", "8080"),
            ("AGENTRUN_GRACE_SECS", "3"),
            ("AGENTRUN_DEBUG", "true"),
            ("OLLAMA_URL", "http://ollama:11434"),
            ("PYTHON_BIN", "/usr/bin/python3.12"),
        ]);
        assert_eq!(cfg.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cfg.port, Some(8080));
        assert_eq!(cfg.grace_period, Duration::from_secs(3));
        assert!(cfg.debug);
        assert_eq!(cfg.ollama_url, "http://ollama:11434");
        assert_eq!(cfg.python_bin, "/usr/bin/python3.12");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config(&[("AGENTRUN_PORT", "http"), ("AGENTRUN_GRACE_SECS", "-1")]);
        assert_eq!(cfg.port, None);
        assert_eq!(cfg.grace_period, Duration::from_secs(DEFAULT_GRACE_SECS));
    }
}
