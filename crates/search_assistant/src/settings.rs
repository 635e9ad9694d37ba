use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use llm::{ApiCredentials, ProviderConfigs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "camelCase")]
pub enum TriggerMode {
    /// Ask for every search
    #[default]
    Always,
    /// Ask only when the query ends with a question mark
    QuestionMark,
    /// Ask only on explicit request
    Manually,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Auto,
    Light,
    Dark,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Auto,
    English,
    Chinese,
    Spanish,
    French,
    Korean,
    Japanese,
    German,
    Portuguese,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Language::Auto => "auto",
            Language::English => "english",
            Language::Chinese => "chinese",
            Language::Spanish => "spanish",
            Language::French => "french",
            Language::Korean => "korean",
            Language::Japanese => "japanese",
            Language::German => "german",
            Language::Portuguese => "portuguese",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserConfig {
    pub trigger_mode: TriggerMode,
    pub theme: Theme,
    pub language: Language,
}

/// Contents of `config.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct StoredConfig {
    providers: ProviderConfigs,
    user: UserConfig,
}

/// Key-value style storage for provider and user settings
pub trait ConfigStore: Send + Sync {
    fn provider_configs(&self) -> Result<ProviderConfigs>;
    fn user_config(&self) -> Result<UserConfig>;
    fn save_provider_configs(&self, configs: &ProviderConfigs) -> Result<()>;
    fn save_user_config(&self, config: &UserConfig) -> Result<()>;
}

/// Settings persisted as JSON on disk.
///
/// API keys are stored base64 encoded and may reference environment
/// variables as `${VAR}`. References are substituted when provider configs
/// are read and are never written back resolved.
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("config.json"))
    }

    /// `$SEARCH_ASSISTANT_CONFIG_DIR/config.json`, falling back to the
    /// platform config directory.
    pub fn default_location() -> Result<Self> {
        let dir = match std::env::var("SEARCH_ASSISTANT_CONFIG_DIR") {
            Ok(custom_dir) => PathBuf::from(custom_dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("search-assistant"),
        };
        Ok(Self::in_dir(&dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoredConfig> {
        if !self.path.exists() {
            return Ok(StoredConfig::default());
        }

        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let mut stored: StoredConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings from {}", self.path.display()))?;

        // Keys stay as stored, `${VAR}` references included
        for credentials in api_credentials_mut(&mut stored.providers) {
            if let Some(api_key) = &mut credentials.api_key {
                *api_key = decode_api_key(api_key);
            }
        }

        Ok(stored)
    }

    fn store(&self, mut stored: StoredConfig) -> Result<()> {
        for credentials in api_credentials_mut(&mut stored.providers) {
            if let Some(api_key) = &mut credentials.api_key {
                *api_key = STANDARD.encode(api_key.as_bytes());
            }
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&stored)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))?;
        tracing::debug!("Saved settings to {}", self.path.display());
        Ok(())
    }

    fn update(&self, apply: impl FnOnce(&mut StoredConfig)) -> Result<()> {
        let mut stored = self.load()?;
        apply(&mut stored);
        self.store(stored)
    }
}

impl ConfigStore for FileConfigStore {
    fn provider_configs(&self) -> Result<ProviderConfigs> {
        let mut providers = self.load()?.providers;
        for credentials in api_credentials_mut(&mut providers) {
            if let Some(api_key) = &mut credentials.api_key {
                if let Some(resolved) = substitute_env_vars(api_key) {
                    *api_key = resolved;
                }
            }
        }
        Ok(providers)
    }

    fn user_config(&self) -> Result<UserConfig> {
        Ok(self.load()?.user)
    }

    /// A key equal to what a stored `${VAR}` reference resolves to keeps
    /// the reference.
    fn save_provider_configs(&self, configs: &ProviderConfigs) -> Result<()> {
        self.update(|stored| {
            let mut configs = configs.clone();
            let previous = [&stored.providers.openai, &stored.providers.gemini];
            let pairs = api_credentials_mut(&mut configs).into_iter().zip(previous);
            for (credentials, previous) in pairs {
                let Some(reference) = &previous.api_key else {
                    continue;
                };
                if substitute_env_vars(reference).as_ref() == credentials.api_key.as_ref() {
                    credentials.api_key = Some(reference.clone());
                }
            }
            stored.providers = configs;
        })
    }

    fn save_user_config(&self, config: &UserConfig) -> Result<()> {
        self.update(|stored| stored.user = *config)
    }
}

fn api_credentials_mut(configs: &mut ProviderConfigs) -> [&mut ApiCredentials; 2] {
    [&mut configs.openai, &mut configs.gemini]
}

fn decode_api_key(stored: &str) -> String {
    match STANDARD
        .decode(stored)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(decoded) => decoded,
        None => {
            tracing::warn!("Stored API key is not base64 encoded, using it as is");
            stored.to_string()
        }
    }
}

fn substitute_env_vars(input: &str) -> Option<String> {
    let mut result = input.to_string();
    let mut changed = false;
    while let Some(start) = result.find("${") {
        let end = start + result[start..].find('}')?;
        let var_name = &result[start + 2..end];
        let var_value = std::env::var(var_name).ok()?;
        result.replace_range(start..=end, &var_value);
        changed = true;
    }

    changed.then_some(result)
}
