//! Provider resolution: which backend a request targets and the connection
//! settings that go with it.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::{PluginConnection, RuntimeConfig};

pub const DEFAULT_TRANSPORT_BASE_URL: &str = "https://directline.botframework.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    CopilotStudio,
    AzureAiFoundry,
}

/// Fold the client-facing provider aliases into a canonical kind. Unknown
/// strings resolve to nothing and leave the plugin defaults in charge.
pub fn normalize_provider(value: Option<&str>) -> Option<ProviderKind> {
    let trimmed = value?.trim().to_ascii_lowercase();
    match trimmed.as_str() {
        "copilotstudio" | "copilot-studio" | "copilot_studio" | "copilot" | "directline"
        | "direct-line" | "direct_line" => Some(ProviderKind::CopilotStudio),
        "azure-ai-foundry" | "azureaifoundry" | "aifoundry" | "azure" | "azure_ai_foundry" => {
            Some(ProviderKind::AzureAiFoundry)
        }
        _ => None,
    }
}

/// Transport settings merged from the plugin connection and the global
/// defaults, ready for conversation creation.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub endpoint: String,
    pub bot_id: Option<String>,
    pub user_id: Option<String>,
    pub scope: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedContext {
    pub provider: ProviderKind,
    pub plugin_id: Option<String>,
    pub transport: TransportSettings,
}

/// Resolve the backend for a request: explicit hint first, then the named
/// (or default) plugin's connection provider, then the streaming backend.
pub fn resolve_context(
    config: &RuntimeConfig,
    provider_hint: Option<&str>,
    plugin_id: Option<&str>,
) -> ResolvedContext {
    let plugin_id = plugin_id
        .map(str::to_string)
        .or_else(|| config.default_plugin_id());
    let connection = plugin_id
        .as_deref()
        .and_then(|id| config.plugin(id))
        .map(|record| record.connection.clone())
        .unwrap_or_default();

    let provider = normalize_provider(provider_hint)
        .or_else(|| normalize_provider(connection.provider.as_deref()))
        .or_else(|| normalize_provider(config.global_provider()))
        .unwrap_or(ProviderKind::AzureAiFoundry);

    let transport = transport_settings(config, &connection);
    ResolvedContext {
        provider,
        plugin_id,
        transport,
    }
}

fn transport_settings(config: &RuntimeConfig, connection: &PluginConnection) -> TransportSettings {
    let defaults = config.transport_defaults();
    TransportSettings {
        endpoint: connection
            .direct_line_endpoint
            .clone()
            .or_else(|| connection.endpoint.clone())
            .or_else(|| defaults.endpoint.clone())
            .unwrap_or_else(|| DEFAULT_TRANSPORT_BASE_URL.to_string()),
        bot_id: connection
            .direct_line_bot_id
            .clone()
            .or_else(|| defaults.bot_id.clone())
            .or_else(|| connection.agent_id.clone()),
        user_id: connection
            .direct_line_user_id
            .clone()
            .or_else(|| defaults.user_id.clone()),
        scope: connection
            .direct_line_scope
            .clone()
            .or_else(|| defaults.scope.clone()),
        secret: config.resolve_transport_secret(connection),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_fold_to_canonical_kinds() {
        for alias in [
            "copilotstudio",
            "Copilot-Studio",
            "copilot_studio",
            "copilot",
            "directline",
            "direct-line",
            "direct_line",
        ] {
            assert_eq!(
                normalize_provider(Some(alias)),
                Some(ProviderKind::CopilotStudio),
                "{alias}"
            );
        }
        for alias in [
            "azure-ai-foundry",
            "AzureAiFoundry",
            "aifoundry",
            "azure",
            "azure_ai_foundry",
        ] {
            assert_eq!(
                normalize_provider(Some(alias)),
                Some(ProviderKind::AzureAiFoundry),
                "{alias}"
            );
        }
    }

    #[test]
    fn unknown_and_empty_values_resolve_to_nothing() {
        assert_eq!(normalize_provider(Some("openai")), None);
        assert_eq!(normalize_provider(Some("  ")), None);
        assert_eq!(normalize_provider(None), None);
    }

    #[test]
    fn hint_overrides_plugin_provider() {
        let config = RuntimeConfig::default();
        let resolved = resolve_context(&config, Some("copilot"), None);
        assert_eq!(resolved.provider, ProviderKind::CopilotStudio);
        assert_eq!(resolved.transport.endpoint, DEFAULT_TRANSPORT_BASE_URL);
    }

    #[test]
    fn missing_everything_defaults_to_streaming_backend() {
        let config = RuntimeConfig::default();
        let resolved = resolve_context(&config, None, None);
        assert_eq!(resolved.provider, ProviderKind::AzureAiFoundry);
    }
}
