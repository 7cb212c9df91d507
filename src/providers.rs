//! Provider credential table.
//!
//! Each provider maps to one or more credential slots. A slot is named after
//! the environment variable the upstream tooling conventionally reads, so a
//! value missing from the settings request can still be picked up from the
//! process environment.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which part of a [`ProviderSetting`] feeds a credential slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    ApiKey,
    BaseUrl,
}

impl CredentialField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialField::ApiKey => "api_key",
            CredentialField::BaseUrl => "base_url",
        }
    }
}

/// How a provider's credentials are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSpec {
    /// The API key goes into a single slot.
    SingleKey(&'static str),
    /// Several fields, each into its own slot.
    MultiKey(&'static [(CredentialField, &'static str)]),
}

impl CredentialSpec {
    /// Every `(field, slot)` pair this spec requires.
    #[must_use]
    pub fn slots(&self) -> Vec<(CredentialField, &'static str)> {
        match self {
            CredentialSpec::SingleKey(slot) => vec![(CredentialField::ApiKey, slot)],
            CredentialSpec::MultiKey(slots) => slots.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub credentials: CredentialSpec,
    pub default_base_url: Option<&'static str>,
    /// Path appended to the base URL for streaming chat completions.
    pub chat_path: &'static str,
    /// Model prefixes stripped before the name is sent upstream.
    pub model_prefixes: &'static [&'static str],
}

impl ProviderInfo {
    /// Strip routing prefixes such as `deepseek/` from a model name.
    #[must_use]
    pub fn api_model_name<'a>(&self, model: &'a str) -> &'a str {
        let model = model.trim();
        for prefix in self.model_prefixes {
            if let Some(rest) = model.strip_prefix(prefix)
                && let Some(rest) = rest.strip_prefix('/')
                && !rest.is_empty()
            {
                return rest;
            }
        }
        model
    }
}

pub const PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        name: "deepseek",
        credentials: CredentialSpec::SingleKey("DEEPSEEK_API_KEY"),
        default_base_url: Some("https://api.deepseek.com"),
        chat_path: "/chat/completions",
        model_prefixes: &["deepseek"],
    },
    ProviderInfo {
        name: "openai",
        credentials: CredentialSpec::SingleKey("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        chat_path: "/chat/completions",
        model_prefixes: &["openai"],
    },
    ProviderInfo {
        name: "anthropic",
        credentials: CredentialSpec::SingleKey("ANTHROPIC_API_KEY"),
        default_base_url: Some("https://api.anthropic.com/v1"),
        chat_path: "/chat/completions",
        model_prefixes: &["anthropic"],
    },
    ProviderInfo {
        name: "openrouter",
        credentials: CredentialSpec::SingleKey("OPENROUTER_API_KEY"),
        default_base_url: Some("https://openrouter.ai/api/v1"),
        chat_path: "/chat/completions",
        model_prefixes: &["openrouter"],
    },
    ProviderInfo {
        name: "ollama",
        credentials: CredentialSpec::MultiKey(&[(CredentialField::BaseUrl, "OLLAMA_API_BASE")]),
        default_base_url: None,
        chat_path: "/v1/chat/completions",
        model_prefixes: &["ollama_chat", "ollama"],
    },
    ProviderInfo {
        name: "openai_compatible",
        credentials: CredentialSpec::MultiKey(&[
            (CredentialField::ApiKey, "OPENAI_API_KEY"),
            (CredentialField::BaseUrl, "OPENAI_API_BASE"),
        ]),
        default_base_url: None,
        chat_path: "/chat/completions",
        model_prefixes: &["openai"],
    },
];

/// Look up a provider by name (case-insensitive).
#[must_use]
pub fn lookup(name: &str) -> Option<&'static ProviderInfo> {
    let name = name.trim();
    PROVIDERS
        .iter()
        .find(|info| info.name.eq_ignore_ascii_case(name))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("Provider '{provider}' requires a non-empty '{field}'")]
    MissingCredential {
        provider: &'static str,
        field: &'static str,
    },
    #[error("model cannot be empty")]
    EmptyModel,
}

/// Provider/model settings posted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSetting {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderSetting {
    fn field(&self, field: CredentialField) -> Option<&str> {
        let value = match field {
            CredentialField::ApiKey => Some(self.api_key.as_str()),
            CredentialField::BaseUrl => self.base_url.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    /// Resolve this setting against the provider table.
    pub fn resolve(&self) -> Result<Credentials, ConfigurationError> {
        if self.model.trim().is_empty() {
            return Err(ConfigurationError::EmptyModel);
        }
        let info = lookup(&self.provider)
            .ok_or_else(|| ConfigurationError::UnknownProvider(self.provider.clone()))?;

        let mut slots = Vec::new();
        for (field, env_var) in info.credentials.slots() {
            let value = self
                .field(field)
                .ok_or(ConfigurationError::MissingCredential {
                    provider: info.name,
                    field: field.as_str(),
                })?;
            slots.push(CredentialSlot {
                field,
                env_var,
                value: value.to_string(),
            });
        }

        Ok(Credentials {
            provider: Some(info),
            slots,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSlot {
    pub field: CredentialField,
    pub env_var: &'static str,
    pub value: String,
}

/// Credentials resolved for one provider, handed to the engine on rebuild.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    provider: Option<&'static ProviderInfo>,
    slots: Vec<CredentialSlot>,
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.provider.map(|p| p.name) == other.provider.map(|p| p.name)
            && self.slots == other.slots
    }
}

impl Eq for Credentials {}

impl Credentials {
    #[must_use]
    pub fn provider(&self) -> Option<&'static ProviderInfo> {
        self.provider
    }

    #[must_use]
    pub fn slots(&self) -> &[CredentialSlot] {
        &self.slots
    }

    /// Value for `field`: the configured slot first, then the process environment.
    #[must_use]
    pub fn value(&self, field: CredentialField) -> Option<String> {
        if let Some(slot) = self.slots.iter().find(|slot| slot.field == field) {
            return Some(slot.value.clone());
        }
        let env_var = self.provider.and_then(|info| {
            info.credentials
                .slots()
                .into_iter()
                .find(|(f, _)| *f == field)
                .map(|(_, env_var)| env_var)
        })?;
        std::env::var(env_var)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        self.value(CredentialField::ApiKey)
    }

    #[must_use]
    pub fn base_url(&self) -> Option<String> {
        self.value(CredentialField::BaseUrl)
            .or_else(|| self.provider?.default_base_url.map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setting(provider: &str, api_key: &str, base_url: Option<&str>) -> ProviderSetting {
        ProviderSetting {
            provider: provider.to_string(),
            api_key: api_key.to_string(),
            model: "deepseek/deepseek-chat".to_string(),
            base_url: base_url.map(str::to_string),
        }
    }

    #[test]
    fn single_key_provider_fills_one_slot() {
        let creds = setting("deepseek", "sk-1", None).resolve().unwrap();
        assert_eq!(creds.slots().len(), 1);
        assert_eq!(creds.slots()[0].env_var, "DEEPSEEK_API_KEY");
        assert_eq!(creds.api_key().as_deref(), Some("sk-1"));
        assert_eq!(creds.base_url().as_deref(), Some("https://api.deepseek.com"));
    }

    #[test]
    fn multi_key_provider_sets_each_slot() {
        let creds = setting("openai_compatible", "sk-2", Some("http://localhost:8000/v1"))
            .resolve()
            .unwrap();
        let slots: Vec<_> = creds.slots().iter().map(|s| s.env_var).collect();
        assert_eq!(slots, vec!["OPENAI_API_KEY", "OPENAI_API_BASE"]);
        assert_eq!(creds.api_key().as_deref(), Some("sk-2"));
        assert_eq!(creds.base_url().as_deref(), Some("http://localhost:8000/v1"));
    }

    #[test]
    fn multi_key_provider_requires_every_field() {
        let err = setting("ollama", "", None).resolve().unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::MissingCredential {
                provider: "ollama",
                field: "base_url"
            }
        );
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = setting("invalid_provider", "key", None).resolve().unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownProvider(name) if name == "invalid_provider"));
    }

    #[test]
    fn empty_model_is_rejected_before_provider_lookup() {
        let mut s = setting("", "", Some(""));
        s.model = "  ".to_string();
        assert_eq!(s.resolve().unwrap_err(), ConfigurationError::EmptyModel);
    }

    #[test]
    fn model_prefix_is_stripped_for_upstream() {
        let info = lookup("deepseek").unwrap();
        assert_eq!(info.api_model_name("deepseek/deepseek-chat"), "deepseek-chat");
        assert_eq!(info.api_model_name("deepseek-chat"), "deepseek-chat");
        let ollama = lookup("Ollama").unwrap();
        assert_eq!(ollama.api_model_name("ollama_chat/llama3"), "llama3");
    }
}
