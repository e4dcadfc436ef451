//! Environment for worker processes.
//!
//! Variables come from three layers, later layers winning: the process
//! environment (with `NODE_ENV` forced to `development`), variables configured
//! remotely for the project, and the local env file. A fixed set of protocol
//! variables is applied last and cannot be overridden by any layer.

use std::{collections::HashMap, path::Path};

use worker_bridge_core::EnvFileSource;

use crate::config::SessionConfig;

pub const API_URL_KEY: &str = "WORKER_BRIDGE_API_URL";
pub const SECRET_KEY_KEY: &str = "WORKER_BRIDGE_SECRET_KEY";
pub const OTEL_COMPRESSION_KEY: &str = "OTEL_EXPORTER_OTLP_COMPRESSION";
pub const OTEL_RESOURCE_ATTRIBUTES_KEY: &str = "OTEL_RESOURCE_ATTRIBUTES";
pub const OTEL_IMPORT_HOOK_INCLUDES_KEY: &str = "OTEL_IMPORT_HOOK_INCLUDES";
pub const NODE_ENV_KEY: &str = "NODE_ENV";

/// Mode worker processes run in during a dev session.
pub const DEV_NODE_ENV: &str = "development";

/// Resource attribute carrying the project directory.
pub const PROJECT_DIR_ATTRIBUTE: &str = "worker_bridge.project.dir";

/// Variable layers in ascending precedence.
#[derive(Debug, Clone, Default)]
pub struct EnvLayers {
    pub process: HashMap<String, String>,
    pub remote: HashMap<String, String>,
    pub file: HashMap<String, String>,
}

impl EnvLayers {
    /// Layers with the current process environment as the base.
    #[must_use]
    pub fn from_process() -> Self {
        Self::with_process(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    /// Layers with `vars` as the process layer. The remote and file layers
    /// can still override `NODE_ENV`.
    #[must_use]
    pub fn with_process(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut process: HashMap<_, _> = vars.into_iter().collect();
        process.insert(NODE_ENV_KEY.to_string(), DEV_NODE_ENV.to_string());
        Self {
            process,
            ..Self::default()
        }
    }
}

/// Env file source for sessions that do not use one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnvFile;

impl EnvFileSource for NoEnvFile {
    fn load(&self, _path: Option<&Path>) -> Result<HashMap<String, String>, std::io::Error> {
        Ok(HashMap::new())
    }
}

/// Merge `layers` in precedence order, then apply `overlay`.
#[must_use]
pub fn resolve_environment(
    layers: EnvLayers,
    overlay: HashMap<String, String>,
) -> HashMap<String, String> {
    let EnvLayers {
        process,
        remote,
        file,
    } = layers;

    let mut env = process;
    env.extend(remote);
    env.extend(file);
    env.extend(overlay);
    sanitize(env)
}

/// Protocol variables every worker process must see.
#[must_use]
pub fn protocol_overlay(config: &SessionConfig) -> HashMap<String, String> {
    let mut resource_attributes = serde_json::Map::new();
    resource_attributes.insert(
        PROJECT_DIR_ATTRIBUTE.to_string(),
        config.working_dir.display().to_string().into(),
    );

    HashMap::from([
        (API_URL_KEY.to_string(), config.api_url.clone()),
        (SECRET_KEY_KEY.to_string(), config.access_token.clone()),
        (OTEL_COMPRESSION_KEY.to_string(), "none".to_string()),
        (
            OTEL_RESOURCE_ATTRIBUTES_KEY.to_string(),
            serde_json::Value::Object(resource_attributes).to_string(),
        ),
        (
            OTEL_IMPORT_HOOK_INCLUDES_KEY.to_string(),
            config.instrumented_packages.join(","),
        ),
    ])
}

/// Drop entries a process environment cannot hold.
#[must_use]
pub fn sanitize(env: HashMap<String, String>) -> HashMap<String, String> {
    env.into_iter()
        .filter(|(key, value)| {
            let valid = !key.is_empty()
                && !key.contains(['=', '\0'])
                && !value.contains('\0');
            if !valid {
                tracing::debug!(key = %key.escape_debug(), "Dropping invalid environment entry");
            }
            valid
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_later_layers_win() {
        let layers = EnvLayers {
            process: vars(&[("A", "process"), ("B", "process"), ("C", "process")]),
            remote: vars(&[("B", "remote"), ("C", "remote")]),
            file: vars(&[("C", "file")]),
        };

        let env = resolve_environment(layers, HashMap::new());
        assert_eq!(env["A"], "process");
        assert_eq!(env["B"], "remote");
        assert_eq!(env["C"], "file");
    }

    #[test]
    fn test_process_layer_runs_in_development() {
        let layers = EnvLayers::with_process(vars(&[("NODE_ENV", "production"), ("HOME", "/h")]));
        assert_eq!(layers.process["NODE_ENV"], "development");
        assert_eq!(layers.process["HOME"], "/h");

        let layers = EnvLayers {
            file: vars(&[("NODE_ENV", "test")]),
            ..layers
        };
        let env = resolve_environment(layers, HashMap::new());
        assert_eq!(env["NODE_ENV"], "test");
    }

    #[test]
    fn test_overlay_cannot_be_overridden() {
        let config = SessionConfig::new("https://api.example.com", "tok_1", "proj")
            .with_working_dir("/work/app")
            .with_instrumented_packages(["openai", "pg"]);
        let layers = EnvLayers {
            file: vars(&[(API_URL_KEY, "http://elsewhere"), (OTEL_COMPRESSION_KEY, "gzip")]),
            ..EnvLayers::default()
        };

        let env = resolve_environment(layers, protocol_overlay(&config));
        assert_eq!(env[API_URL_KEY], "https://api.example.com");
        assert_eq!(env[SECRET_KEY_KEY], "tok_1");
        assert_eq!(env[OTEL_COMPRESSION_KEY], "none");
        assert_eq!(env[OTEL_IMPORT_HOOK_INCLUDES_KEY], "openai,pg");

        let attributes: serde_json::Value =
            serde_json::from_str(&env[OTEL_RESOURCE_ATTRIBUTES_KEY]).unwrap();
        assert_eq!(attributes[PROJECT_DIR_ATTRIBUTE], "/work/app");
    }

    #[test]
    fn test_sanitize_drops_unrepresentable_entries() {
        let env = sanitize(vars(&[
            ("", "empty"),
            ("A=B", "eq"),
            ("NUL\0", "nul"),
            ("VALUE_NUL", "a\0b"),
            ("OK", ""),
        ]));
        assert_eq!(env.len(), 1);
        assert_eq!(env["OK"], "");
    }
}
