use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::semantic::chunker::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::semantic::identity;

const DEFAULT_KB_DIR: &str = "./kb";
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Default local model, small enough to download on first use
const DEFAULT_LOCAL_MODEL: &str = "bge-small-en-v1.5";
const DEFAULT_REMOTE_MODEL: &str = "text-embedding-3-small";
const DEFAULT_REMOTE_BASE_URL: &str = "https://api.openai.com/v1";

/// Items per remote embedding request
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config file is malformed: {0}")]
    Yaml(#[from] serde_yml::Error),
}

/// Which embedder produces vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    Local,
    #[serde(alias = "openai_compat", alias = "openai")]
    Remote,
}

impl EmbeddingBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingBackend::Local => "local",
            EmbeddingBackend::Remote => "remote",
        }
    }

    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "local" => Ok(EmbeddingBackend::Local),
            "remote" | "openai_compat" | "openai" => Ok(EmbeddingBackend::Remote),
            _ => Err(ConfigError::InvalidValue {
                key: "EMBEDDING_BACKEND",
                value: value.to_string(),
                reason: "expected one of: local, remote".to_string(),
            }),
        }
    }
}

impl fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the embedding backends
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default = "default_backend")]
    pub backend: EmbeddingBackend,

    /// fastembed model name (e.g., "bge-small-en-v1.5")
    #[serde(default = "default_local_model")]
    pub local_model: String,

    /// Model name sent to the remote embeddings endpoint
    #[serde(default = "default_remote_model")]
    pub remote_model: String,

    /// Base URL of an OpenAI-compatible API, without the `/embeddings` suffix
    #[serde(default = "default_remote_base_url")]
    pub remote_base_url: String,

    #[serde(default, skip_serializing)]
    pub remote_api_key: String,

    /// Maximum texts per remote request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Remote request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for transient remote failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl EmbeddingConfig {
    /// Fingerprint of this configuration, used as the corpus directory name.
    pub fn space_id(&self) -> String {
        identity::fingerprint(
            self.backend.as_str(),
            &[self.local_model.as_str(), self.remote_model.as_str()],
        )
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            local_model: default_local_model(),
            remote_model: default_remote_model(),
            remote_base_url: default_remote_base_url(),
            remote_api_key: String::new(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let api_key = if self.remote_api_key.is_empty() {
            ""
        } else {
            "[REDACTED]"
        };

        f.debug_struct("EmbeddingConfig")
            .field("backend", &self.backend)
            .field("local_model", &self.local_model)
            .field("remote_model", &self.remote_model)
            .field("remote_base_url", &self.remote_base_url)
            .field("remote_api_key", &api_key)
            .field("batch_size", &self.batch_size)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

fn default_backend() -> EmbeddingBackend {
    EmbeddingBackend::Local
}

fn default_local_model() -> String {
    DEFAULT_LOCAL_MODEL.to_string()
}

fn default_remote_model() -> String {
    DEFAULT_REMOTE_MODEL.to_string()
}

fn default_remote_base_url() -> String {
    DEFAULT_REMOTE_BASE_URL.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Corpus root, one subdirectory per embedding space
    #[serde(default = "default_kb_dir")]
    pub kb_dir: PathBuf,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Daemon listen address
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kb_dir: default_kb_dir(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            embedding: EmbeddingConfig::default(),
            listen: default_listen(),
        }
    }
}

fn default_kb_dir() -> PathBuf {
    PathBuf::from(DEFAULT_KB_DIR)
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// `KB_CONFIG` may point at a YAML file which is read first; individual
    /// environment variables override it.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base = match lookup("KB_CONFIG").filter(|path| !path.is_empty()) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        let config = base.with_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yml::from_str(&config_str)?)
    }

    fn with_overrides(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |keys: &[&str]| keys.iter().find_map(|key| lookup(key).filter(|v| !v.is_empty()));

        if let Some(dir) = get(&["KB_DIR"]) {
            self.kb_dir = PathBuf::from(dir);
        }
        if let Some(size) = get(&["CHUNK_SIZE"]) {
            self.chunk_size = parse_number("CHUNK_SIZE", &size)?;
        }
        if let Some(overlap) = get(&["CHUNK_OVERLAP"]) {
            self.chunk_overlap = parse_number("CHUNK_OVERLAP", &overlap)?;
        }
        if let Some(listen) = get(&["KB_LISTEN"]) {
            self.listen = listen;
        }

        let embedding = &mut self.embedding;
        if let Some(backend) = get(&["EMBEDDING_BACKEND"]) {
            embedding.backend = EmbeddingBackend::parse(&backend)?;
        }
        if let Some(model) = get(&["EMBED_MODEL_LOCAL"]) {
            embedding.local_model = model;
        }
        if let Some(model) = get(&["EMBED_MODEL_OPENAI_COMPAT", "EMBED_MODEL_REMOTE"]) {
            embedding.remote_model = model;
        }
        if let Some(url) = get(&["OPENAI_BASE_URL", "ALIYUN_BASE_URL"]) {
            embedding.remote_base_url = url;
        }
        if let Some(key) = get(&["OPENAI_API_KEY", "ALIYUN_API_KEY"]) {
            embedding.remote_api_key = key;
        }
        if let Some(batch) = get(&["EMBED_BATCH_SIZE"]) {
            embedding.batch_size = parse_number("EMBED_BATCH_SIZE", &batch)?;
        }
        if let Some(timeout) = get(&["EMBED_TIMEOUT_SECS"]) {
            embedding.timeout_secs = parse_number("EMBED_TIMEOUT_SECS", &timeout)?;
        }
        if let Some(retries) = get(&["EMBED_MAX_RETRIES"]) {
            embedding.max_retries = parse_number("EMBED_MAX_RETRIES", &retries)?;
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHUNK_SIZE",
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        let embedding = &self.embedding;
        if embedding.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EMBED_BATCH_SIZE",
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if embedding.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EMBED_TIMEOUT_SECS",
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if embedding.backend == EmbeddingBackend::Remote {
            let parsed = url::Url::parse(&embedding.remote_base_url).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "OPENAI_BASE_URL",
                    value: embedding.remote_base_url.clone(),
                    reason: e.to_string(),
                }
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidValue {
                    key: "OPENAI_BASE_URL",
                    value: embedding.remote_base_url.clone(),
                    reason: "must be an http(s) url".to_string(),
                });
            }
        }

        if self.chunk_overlap >= self.chunk_size {
            log::warn!(
                "chunk overlap {} is not smaller than chunk size {}, chunks will advance one character at a time",
                self.chunk_overlap,
                self.chunk_size
            );
        }

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        })
}
