//! Runtime configuration: global settings, plugin manifests, and the
//! sanitized public view.
//!
//! Configuration is loaded once at startup and shared read-only through
//! `AppState`. Manifest discovery is filesystem-driven: every `*.json`
//! under the plugins directory is a candidate, with a priority scheme that
//! lets a `.local.` override ship next to the checked-in manifest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::providers::{normalize_provider, ProviderKind};

const SETTINGS_FILE: &str = "settings.json";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_STREAM_TIMEOUT_MS: u64 = 60_000;

const ENV_POLL_INTERVAL: &str = "AGENT_PROXY_POLL_INTERVAL_MS";
const ENV_STREAM_TIMEOUT: &str = "AGENT_PROXY_STREAM_TIMEOUT_MS";
const ENV_EXPOSE_CONFIG: &str = "AGENT_PROXY_EXPOSE_CONFIG";
const ENV_GLOBAL_SECRET: &str = "DIRECT_LINE_SECRET";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginConnection {
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub project_id: Option<String>,
    #[serde(alias = "deploymentId")]
    pub agent_id: Option<String>,
    #[serde(alias = "directLineBaseUrl")]
    pub direct_line_endpoint: Option<String>,
    pub direct_line_secret: Option<String>,
    pub direct_line_secret_env: Option<String>,
    #[serde(alias = "botId")]
    pub direct_line_bot_id: Option<String>,
    #[serde(alias = "userId")]
    pub direct_line_user_id: Option<String>,
    #[serde(alias = "scope")]
    pub direct_line_scope: Option<String>,
}

impl PluginConnection {
    fn normalized(mut self) -> Self {
        for field in [
            &mut self.provider,
            &mut self.endpoint,
            &mut self.project_id,
            &mut self.agent_id,
            &mut self.direct_line_endpoint,
            &mut self.direct_line_secret,
            &mut self.direct_line_secret_env,
            &mut self.direct_line_bot_id,
            &mut self.direct_line_user_id,
            &mut self.direct_line_scope,
        ] {
            if let Some(value) = field.as_deref() {
                let trimmed = value.trim();
                *field = if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                };
            }
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub id: String,
    pub label: String,
    pub default: bool,
    pub connection: PluginConnection,
    /// The manifest as discovered, for the public config view.
    pub manifest: Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PluginManifest {
    id: Option<String>,
    label: Option<String>,
    default: bool,
    connection: Option<PluginConnection>,
    provider: Option<String>,
    agent_id: Option<String>,
}

/// Global transport defaults from `settings.json`, merged under plugin
/// connections at resolution time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportDefaults {
    pub endpoint: Option<String>,
    pub bot_id: Option<String>,
    pub user_id: Option<String>,
    pub scope: Option<String>,
    pub secret: Option<String>,
    pub secret_env: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AgentSettings {
    provider: Option<String>,
    default_plugin_id: Option<String>,
    direct_line: TransportDefaults,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Settings {
    agent: AgentSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    pub config_dir: Option<PathBuf>,
    pub plugins_dir: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub stream_timeout_ms: Option<u64>,
    pub expose_config: bool,
}

#[derive(Debug, Default)]
pub struct RuntimeConfig {
    settings: Settings,
    raw_settings: Value,
    plugins: Vec<PluginRecord>,
    poll_interval: Duration,
    stream_timeout: Duration,
    expose_config: bool,
}

impl RuntimeConfig {
    /// Load settings and plugin manifests. Missing directories and broken
    /// files degrade to warnings; the gateway always starts.
    pub fn load(options: &ConfigOptions) -> Self {
        let (settings, raw_settings) = load_settings(options.config_dir.as_deref());
        let plugins = options
            .plugins_dir
            .as_deref()
            .map(load_plugins)
            .unwrap_or_default();

        let poll_interval_ms = options
            .poll_interval_ms
            .or_else(|| env_u64(ENV_POLL_INTERVAL))
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let stream_timeout_ms = options
            .stream_timeout_ms
            .or_else(|| env_u64(ENV_STREAM_TIMEOUT))
            .unwrap_or(DEFAULT_STREAM_TIMEOUT_MS);
        let expose_config = options.expose_config || env_truthy(ENV_EXPOSE_CONFIG);

        Self {
            settings,
            raw_settings,
            plugins,
            poll_interval: Duration::from_millis(poll_interval_ms),
            stream_timeout: Duration::from_millis(stream_timeout_ms),
            expose_config,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn stream_timeout(&self) -> Duration {
        self.stream_timeout
    }

    pub fn expose_config(&self) -> bool {
        self.expose_config
    }

    pub fn plugin(&self, id: &str) -> Option<&PluginRecord> {
        self.plugins.iter().find(|record| record.id == id)
    }

    /// First plugin flagged default, else the first discovered, else the
    /// settings-level default id.
    pub fn default_plugin_id(&self) -> Option<String> {
        self.plugins
            .iter()
            .find(|record| record.default)
            .or_else(|| self.plugins.first())
            .map(|record| record.id.clone())
            .or_else(|| self.settings.agent.default_plugin_id.clone())
    }

    pub fn global_provider(&self) -> Option<&str> {
        self.settings.agent.provider.as_deref()
    }

    pub fn transport_defaults(&self) -> &TransportDefaults {
        &self.settings.agent.direct_line
    }

    /// Static-secret resolution for the polling transport. First match
    /// wins: manifest secret, manifest-named env var, global settings
    /// secret, global settings env var, the `DIRECT_LINE_SECRET` fallback.
    pub fn resolve_transport_secret(&self, connection: &PluginConnection) -> Option<String> {
        if let Some(secret) = non_empty(connection.direct_line_secret.as_deref()) {
            return Some(secret);
        }
        if let Some(var) = connection.direct_line_secret_env.as_deref() {
            if let Some(secret) = env_non_empty(var) {
                return Some(secret);
            }
            debug!(var, "manifest secret env var not set");
        }
        let defaults = self.transport_defaults();
        if let Some(secret) = non_empty(defaults.secret.as_deref()) {
            return Some(secret);
        }
        if let Some(var) = defaults.secret_env.as_deref() {
            if let Some(secret) = env_non_empty(var) {
                return Some(secret);
            }
        }
        env_non_empty(ENV_GLOBAL_SECRET)
    }

    /// The externally servable view: raw settings plus the plugin map, with
    /// every secret-bearing key stripped recursively.
    pub fn public_config(&self) -> Value {
        let mut root = match &self.raw_settings {
            Value::Object(map) => Value::Object(map.clone()),
            _ => json!({}),
        };
        if let Some(obj) = root.as_object_mut() {
            let agent = obj
                .entry("agent")
                .or_insert_with(|| json!({}));
            if let Some(agent) = agent.as_object_mut() {
                if let Some(id) = self.default_plugin_id() {
                    agent.insert("defaultPluginId".to_string(), json!(id));
                }
                let plugins: Map<String, Value> = self
                    .plugins
                    .iter()
                    .map(|record| (record.id.clone(), record.manifest.clone()))
                    .collect();
                agent.insert("plugins".to_string(), Value::Object(plugins));
            }
        }
        sanitize_value(&mut root);
        root
    }
}

fn load_settings(config_dir: Option<&Path>) -> (Settings, Value) {
    let Some(dir) = config_dir else {
        return (Settings::default(), json!({}));
    };
    let path = dir.join(SETTINGS_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "no settings file");
            return (Settings::default(), json!({}));
        }
    };
    let value: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "settings file is not valid json");
            return (Settings::default(), json!({}));
        }
    };
    let settings = serde_json::from_value(value.clone()).unwrap_or_else(|err| {
        warn!(path = %path.display(), error = %err, "settings file has unexpected shape");
        Settings::default()
    });
    (settings, value)
}

/// Priority for duplicate plugin ids. Example/sample/template files are
/// rejected outright.
fn manifest_priority(file_name: &str) -> Option<u8> {
    let lower = file_name.to_ascii_lowercase();
    if lower.contains(".example.") || lower.contains(".sample.") || lower.contains(".template.") {
        return None;
    }
    if lower.contains(".local.") {
        return Some(3);
    }
    if lower == "manifest.json" {
        return Some(2);
    }
    Some(1)
}

fn load_plugins(dir: &Path) -> Vec<PluginRecord> {
    let mut files = Vec::new();
    collect_json_files(dir, &mut files);

    struct Candidate {
        record: PluginRecord,
        priority: u8,
        order: usize,
    }
    let mut by_id: HashMap<String, Candidate> = HashMap::new();

    for (index, path) in files.iter().enumerate() {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(priority) = manifest_priority(file_name) else {
            continue;
        };
        let Some(record) = read_manifest(path) else {
            continue;
        };
        let id = record.id.clone();
        match by_id.get_mut(&id) {
            Some(existing) if existing.priority >= priority => {}
            Some(existing) => {
                // Higher-priority duplicate keeps the original slot.
                existing.record = record;
                existing.priority = priority;
            }
            None => {
                by_id.insert(
                    id,
                    Candidate {
                        record,
                        priority,
                        order: index,
                    },
                );
            }
        }
    }

    let mut records: Vec<Candidate> = by_id.into_values().collect();
    records.sort_by_key(|candidate| candidate.order);
    records.into_iter().map(|candidate| candidate.record).collect()
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_json_files(&path, out);
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        {
            out.push(path);
        }
    }
}

fn read_manifest(path: &Path) -> Option<PluginRecord> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) if !raw.trim().is_empty() => raw,
        Ok(_) => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read plugin manifest");
            return None;
        }
    };
    let value: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "plugin manifest is not valid json");
            return None;
        }
    };
    let manifest: PluginManifest = match serde_json::from_value(value.clone()) {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "plugin manifest has unexpected shape");
            return None;
        }
    };

    let id = manifest
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        })?;

    let mut connection = manifest.connection.unwrap_or_default().normalized();
    if connection.provider.is_none() {
        connection.provider = manifest.provider.clone();
    }
    if connection.agent_id.is_none() {
        connection.agent_id = manifest.agent_id.clone();
    }

    // Without an agent id the manifest can only drive the polling provider.
    let provider = normalize_provider(connection.provider.as_deref());
    if connection.agent_id.is_none() && provider != Some(ProviderKind::CopilotStudio) {
        warn!(path = %path.display(), "plugin manifest has no agent id and is not a polling plugin");
        return None;
    }

    let label = manifest
        .label
        .as_deref()
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| id.clone());

    Some(PluginRecord {
        id,
        label,
        default: manifest.default,
        connection,
        manifest: value,
    })
}

/// Drop every key whose name suggests credential material. Applied to the
/// whole public view, nested objects and arrays included.
fn sanitize_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| {
                let lower = key.to_ascii_lowercase();
                !(lower.contains("secret")
                    || lower.contains("apikey")
                    || lower.contains("api_key")
                    || lower.contains("password")
                    || lower == "token")
            });
            for nested in map.values_mut() {
                sanitize_value(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_value(item);
            }
        }
        _ => {}
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn env_non_empty(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|value| value.trim().parse().ok())
}

fn env_truthy(var: &str) -> bool {
    std::env::var(var)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn polling_manifest(id: &str, default: bool) -> String {
        json!({
            "id": id,
            "label": id,
            "default": default,
            "connection": {
                "provider": "copilot_studio",
                "directLineSecretEnv": "TEST_DL_SECRET"
            }
        })
        .to_string()
    }

    #[test]
    fn local_manifest_outranks_checked_in_one() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "bot/manifest.json",
            &json!({
                "id": "bot",
                "connection": {"provider": "copilot_studio", "directLineBotId": "checked-in"}
            })
            .to_string(),
        );
        write(
            dir.path(),
            "bot/manifest.local.json",
            &json!({
                "id": "bot",
                "connection": {"provider": "copilot_studio", "directLineBotId": "local"}
            })
            .to_string(),
        );
        let plugins = load_plugins(dir.path());
        assert_eq!(plugins.len(), 1);
        assert_eq!(
            plugins[0].connection.direct_line_bot_id.as_deref(),
            Some("local")
        );
    }

    #[test]
    fn example_and_template_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "bot.example.json", &polling_manifest("bot", false));
        write(dir.path(), "bot.sample.json", &polling_manifest("bot", false));
        write(dir.path(), "bot.template.json", &polling_manifest("bot", false));
        assert!(load_plugins(dir.path()).is_empty());
    }

    #[test]
    fn manifest_without_agent_id_requires_polling_provider() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "streaming.json",
            &json!({"id": "streaming", "connection": {"provider": "azure"}}).to_string(),
        );
        write(dir.path(), "polling.json", &polling_manifest("polling", false));
        let plugins = load_plugins(dir.path());
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].id, "polling");
    }

    #[test]
    fn default_flag_wins_over_discovery_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", &polling_manifest("a", false));
        write(dir.path(), "b.json", &polling_manifest("b", true));
        let config = RuntimeConfig {
            plugins: load_plugins(dir.path()),
            ..Default::default()
        };
        assert_eq!(config.default_plugin_id().as_deref(), Some("b"));
    }

    #[test]
    fn public_config_strips_credential_keys() {
        let mut value = json!({
            "agent": {
                "directLine": {"secret": "s3cret", "endpoint": "https://dl"},
                "plugins": {
                    "bot": {
                        "connection": {"directLineSecret": "x", "directLineBotId": "b"},
                        "imageGeneration": {"apiKey": "k"},
                        "token": "t"
                    }
                }
            },
            "search": {"apiKey": "k2", "indexName": "idx"}
        });
        sanitize_value(&mut value);
        assert!(value["agent"]["directLine"].get("secret").is_none());
        assert_eq!(value["agent"]["directLine"]["endpoint"], "https://dl");
        let bot = &value["agent"]["plugins"]["bot"];
        assert!(bot["connection"].get("directLineSecret").is_none());
        assert_eq!(bot["connection"]["directLineBotId"], "b");
        assert!(bot["imageGeneration"].get("apiKey").is_none());
        assert!(bot.get("token").is_none());
        assert!(value["search"].get("apiKey").is_none());
        assert_eq!(value["search"]["indexName"], "idx");
    }

    #[test]
    fn secret_precedence_prefers_manifest_value() {
        let config = RuntimeConfig::default();
        let connection = PluginConnection {
            direct_line_secret: Some("manifest-secret".to_string()),
            direct_line_secret_env: Some("UNSET_VAR_FOR_TEST".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_transport_secret(&connection).as_deref(),
            Some("manifest-secret")
        );
    }
}
