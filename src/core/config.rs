use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Default configuration file, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

pub const DEFAULT_EXTENSIONS: &[&str] = &["txt", "md", "html", "json", "csv"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of source documents for the knowledge index
    pub knowledge_dir: PathBuf,
    /// Directory holding persisted indexes, one `<name>.db` each
    pub index_dir: PathBuf,
    pub index_name: String,
    /// Only markdown files sharing at least one of these tags are indexed
    pub tag_filter: Vec<String>,
    /// File extensions (without dot) that are indexed and watched
    pub extensions: Vec<String>,
    pub cooldown_seconds: u64,
    /// Watcher polling interval
    pub tick_millis: u64,
    pub force_rebuild: bool,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub max_links_per_document: usize,
    /// Directory of published articles for cross-linking
    pub content_dir: PathBuf,
    pub crosslink_index_name: String,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Remote when a credential is configured, local otherwise
    #[default]
    Auto,
    Remote,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    #[serde(alias = "openai_api_key")]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            knowledge_dir: PathBuf::from("knowledge_base"),
            index_dir: PathBuf::from("indexes"),
            index_name: "seo_index".to_string(),
            tag_filter: Vec::new(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            cooldown_seconds: 5,
            tick_millis: 1000,
            force_rebuild: false,
            chunk_size: 1000,
            chunk_overlap: 100,
            top_k: 5,
            max_links_per_document: 3,
            content_dir: PathBuf::from("seo_content"),
            crosslink_index_name: "crosslink_index".to_string(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Auto,
            api_key: None,
            base_url: "https://api.openai.com".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            batch_size: 64,
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, `config.json` in the
    /// working directory is used when present and defaults otherwise.
    /// Environment overrides are applied afterwards and the result is
    /// validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                Self::from_file(p)?
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Apply environment overrides through `lookup` (injectable for tests)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("KINDEX_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            if !key.trim().is_empty() {
                self.embedding.api_key = Some(key);
            }
        }
        if let Some(dir) = lookup("KINDEX_KNOWLEDGE_DIR") {
            self.knowledge_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("KINDEX_INDEX_DIR") {
            self.index_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size", "must be greater than 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(invalid(
                "chunk_overlap",
                format!(
                    "{} must be less than chunk_size {}",
                    self.chunk_overlap, self.chunk_size
                ),
            ));
        }
        if self.top_k == 0 {
            return Err(invalid("top_k", "must be greater than 0"));
        }
        if self.cooldown_seconds == 0 {
            return Err(invalid("cooldown_seconds", "must be greater than 0"));
        }
        if self.tick_millis == 0 {
            return Err(invalid("tick_millis", "must be greater than 0"));
        }
        validate_index_name("index_name", &self.index_name)?;
        validate_index_name("crosslink_index_name", &self.crosslink_index_name)?;

        let emb = &self.embedding;
        if emb.dimension == 0 {
            return Err(invalid("embedding.dimension", "must be greater than 0"));
        }
        if emb.batch_size == 0 {
            return Err(invalid("embedding.batch_size", "must be greater than 0"));
        }
        if emb.timeout_secs == 0 {
            return Err(invalid("embedding.timeout_secs", "must be greater than 0"));
        }
        if emb.provider == ProviderKind::Remote && emb.api_key().is_none() {
            return Err(ConfigError::MissingCredential(
                "embedding.provider is 'remote' but no api key is configured (set OPENAI_API_KEY)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

impl EmbeddingConfig {
    /// Configured, non-blank credential
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

/// Index names become a file name under `index_dir`
fn validate_index_name(field: &'static str, name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    if ok {
        Ok(())
    } else {
        Err(invalid(field, format!("'{}' is not a valid index name", name)))
    }
}
