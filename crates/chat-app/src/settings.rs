use std::fmt::Display;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_llm::{
    EngineResult, InferenceEngine, RigEngine, RigEngineConfig, ScriptedEngine,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tempfile::NamedTempFile;

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "PARLEY_";
pub const DEFAULT_MODEL_ID: &str = "Llama-3.1-8B-Instruct-q4f32_1-MLC";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/v1";
const DATABASE_FILE_NAME: &str = "chat.db";

/// Keys accepted by [`ChatSettings::set`].
pub const SETTING_KEYS: &[&str] = &[
    "user",
    "database_path",
    "engine.kind",
    "engine.endpoint",
    "engine.api_key",
    "engine.model_id",
    "engine.system_prompt",
    "engine.temperature",
    "engine.max_tokens",
    "engine.scripted_delay_ms",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// OpenAI-compatible HTTP endpoint.
    #[default]
    Rig,
    /// Offline echo engine.
    Scripted,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rig" => Ok(Self::Rig),
            "scripted" => Ok(Self::Scripted),
            other => Err(format!("expected `rig` or `scripted`, got `{other}`")),
        }
    }
}

impl Display for EngineKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(match self {
            Self::Rig => "rig",
            Self::Scripted => "scripted",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub kind: EngineKind,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub scripted_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            endpoint: default_endpoint(),
            api_key: String::new(),
            model_id: default_model_id(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            scripted_delay_ms: 0,
        }
    }
}

impl EngineSettings {
    fn normalized(mut self) -> Self {
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.api_key = self.api_key.trim().to_string();
        self.model_id = non_blank_or(self.model_id, default_model_id);
        self.system_prompt = self
            .system_prompt
            .map(|prompt| prompt.trim().to_string())
            .filter(|prompt| !prompt.is_empty());
        self
    }

    /// Builds the configured engine. Nothing is loaded until it is initialized.
    pub fn build_engine(&self) -> EngineResult<Arc<dyn InferenceEngine>> {
        match self.kind {
            EngineKind::Rig => {
                let mut config =
                    RigEngineConfig::new(&self.endpoint, &self.api_key, &self.model_id);
                config.system_prompt = self.system_prompt.clone();
                config.temperature = self.temperature;
                config.max_tokens = self.max_tokens;
                Ok(Arc::new(RigEngine::new(config)?))
            }
            EngineKind::Scripted => {
                let mut engine = ScriptedEngine::new();
                if self.scripted_delay_ms > 0 {
                    engine = engine.with_delta_delay(Duration::from_millis(self.scripted_delay_ms));
                }
                Ok(Arc::new(engine))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    /// File path, `sqlite:` URL or `:memory:`.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Signs this user in at startup when set.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            user: String::new(),
            engine: EngineSettings::default(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.database_path = non_blank_or(self.database_path, default_database_path);
        self.user = self.user.trim().to_string();
        self.engine = self.engine.normalized();
        self
    }

    /// Changes one setting by its dotted key. An empty value resets optional
    /// fields; blank required fields fall back to their defaults on save.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        let engine = &mut self.engine;
        match key {
            "user" => self.user = value.to_string(),
            "database_path" => self.database_path = value.to_string(),
            "engine.kind" => engine.kind = parse_value(key, value)?,
            "engine.endpoint" => engine.endpoint = value.to_string(),
            "engine.api_key" => engine.api_key = value.to_string(),
            "engine.model_id" => engine.model_id = value.to_string(),
            "engine.system_prompt" => engine.system_prompt = Some(value.to_string()),
            "engine.temperature" => engine.temperature = parse_optional(key, value)?,
            "engine.max_tokens" => engine.max_tokens = parse_optional(key, value)?,
            "engine.scripted_delay_ms" => {
                engine.scripted_delay_ms = parse_optional(key, value)?.unwrap_or_default()
            }
            _ => {
                return UnknownKeySnafu {
                    stage: "set-setting",
                    key,
                }
                .fail();
            }
        }
        Ok(())
    }

    /// `(key, value)` pairs in [`SETTING_KEYS`] order, with the API key masked.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let engine = &self.engine;
        let optional = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
        let api_key = if engine.api_key.is_empty() { "-" } else { "***" };

        vec![
            ("user", self.user.clone()),
            ("database_path", self.database_path.clone()),
            ("engine.kind", engine.kind.to_string()),
            ("engine.endpoint", engine.endpoint.clone()),
            ("engine.api_key", api_key.to_string()),
            ("engine.model_id", engine.model_id.clone()),
            ("engine.system_prompt", optional(engine.system_prompt.clone())),
            ("engine.temperature", optional(engine.temperature.map(|t| t.to_string()))),
            ("engine.max_tokens", optional(engine.max_tokens.map(|n| n.to_string()))),
            ("engine.scripted_delay_ms", engine.scripted_delay_ms.to_string()),
        ]
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse::<T>().map_err(|error| {
        InvalidValueSnafu {
            stage: "parse-setting-value",
            key,
            details: error.to_string(),
        }
        .build()
    })
}

fn parse_optional<T>(key: &str, value: &str) -> Result<Option<T>, SettingsError>
where
    T: FromStr,
    T::Err: Display,
{
    if value.is_empty() {
        return Ok(None);
    }
    parse_value(key, value).map(Some)
}

pub struct SettingsStore {
    settings: ChatSettings,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Defaults, then the JSON file, then `PARLEY_` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `PARLEY_ENGINE__KIND=scripted`.
    pub fn figment(config_path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(&config_path);
        Self {
            settings,
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Normalizes, saves and then adopts `settings`. Nothing changes on failure.
    pub fn update(&mut self, settings: ChatSettings) -> Result<(), SettingsError> {
        let settings = settings.normalized();
        self.persist(&settings)?;
        self.settings = settings;
        Ok(())
    }

    fn load_from(path: &Path) -> ChatSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        match Self::figment(path).extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        let directory = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(directory).context(CreateDirSnafu {
            stage: "settings-create-directory",
            path: directory,
        })?;

        let encoded = serde_json::to_vec_pretty(settings).context(EncodeSnafu {
            stage: "settings-encode",
        })?;

        // Same directory as the target; the rename must not cross filesystems.
        let mut staged = NamedTempFile::new_in(directory).context(StageSnafu {
            stage: "settings-stage-create",
            path: directory,
        })?;
        staged.write_all(&encoded).context(StageSnafu {
            stage: "settings-stage-write",
            path: staged.path(),
        })?;
        staged
            .persist(&self.config_path)
            .context(ReplaceSnafu {
                stage: "settings-replace",
                path: &self.config_path,
            })?;

        tracing::info!(path = %self.config_path.display(), "settings saved");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("unknown setting `{key}`, expected one of: {}", SETTING_KEYS.join(", ")))]
    UnknownKey { stage: &'static str, key: String },
    #[snafu(display("invalid value for `{key}`: {details}"))]
    InvalidValue {
        stage: &'static str,
        key: String,
        details: String,
    },
    #[snafu(display("cannot create {} on `{stage}`", path.display()))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode settings on `{stage}`"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot stage settings in {} on `{stage}`", path.display()))]
    Stage {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot replace {} on `{stage}`", path.display()))]
    Replace {
        stage: &'static str,
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".parley"))
        .join(DATABASE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"engine":{"kind":"scripted","model_id":"  tiny  ","endpoint":" "}}"#,
        )
        .unwrap();

        let store = SettingsStore::new(path);
        let settings = store.settings();
        assert_eq!(settings.engine.kind, EngineKind::Scripted);
        assert_eq!(settings.engine.model_id, "tiny");
        assert_eq!(settings.engine.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.database_path, default_database_path());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("absent.json"));
        assert_eq!(store.settings().engine.model_id, DEFAULT_MODEL_ID);
        assert_eq!(store.settings().engine.kind, EngineKind::Rig);
    }

    #[test]
    fn update_persists_atomically_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let mut store = SettingsStore::new(path.clone());

        let mut settings = store.settings().clone();
        settings.user = " grace ".to_string();
        settings.engine.system_prompt = Some("   ".to_string());
        settings.database_path = ":memory:".to_string();
        store.update(settings).unwrap();

        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().user, "grace");
        assert_eq!(reloaded.settings().engine.system_prompt, None);
        assert_eq!(reloaded.settings().database_path, ":memory:");
    }

    #[test]
    fn set_edits_single_keys_and_rejects_bad_input() {
        let mut settings = ChatSettings::default();
        settings.set("engine.kind", "Scripted").unwrap();
        settings.set("engine.temperature", "0.2").unwrap();
        settings.set("engine.max_tokens", "256").unwrap();
        settings.set("engine.api_key", "sk-local").unwrap();
        assert_eq!(settings.engine.kind, EngineKind::Scripted);
        assert_eq!(settings.engine.temperature, Some(0.2));
        assert_eq!(settings.engine.max_tokens, Some(256));

        settings.set("engine.max_tokens", "").unwrap();
        assert_eq!(settings.engine.max_tokens, None);

        assert!(matches!(
            settings.set("engine.kind", "gpu"),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings.set("engine.temperature", "warm"),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings.set("theme", "dark"),
            Err(SettingsError::UnknownKey { .. })
        ));
        assert_eq!(settings.engine.temperature, Some(0.2));

        let entries = settings.entries();
        assert_eq!(
            entries.iter().map(|(key, _)| *key).collect::<Vec<_>>(),
            SETTING_KEYS
        );
        assert!(entries.contains(&("engine.api_key", "***".to_string())));
        assert!(entries.contains(&("engine.kind", "scripted".to_string())));
    }

    #[test]
    fn edited_settings_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        let mut store = SettingsStore::new(path.clone());

        let mut settings = store.settings().clone();
        settings.set("engine.model_id", "  phi-3 ").unwrap();
        settings.set("engine.endpoint", "").unwrap();
        store.update(settings).unwrap();
        assert_eq!(store.settings().engine.model_id, "phi-3");
        assert_eq!(store.settings().engine.endpoint, DEFAULT_ENDPOINT);

        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings(), store.settings());
    }

    #[test]
    fn engines_are_built_from_settings() {
        let scripted = EngineSettings {
            kind: EngineKind::Scripted,
            ..EngineSettings::default()
        };
        assert_eq!(scripted.build_engine().unwrap().id(), parley_llm::SCRIPTED_ENGINE_ID);

        let rig = EngineSettings::default();
        assert_eq!(rig.build_engine().unwrap().id(), parley_llm::RIG_ENGINE_ID);
    }
}
