//! Embedding backends.
//!
//! Two backends produce vectors:
//! - `Local`: a fastembed model loaded into this process on first use
//! - `Remote`: an OpenAI-compatible `/embeddings` endpoint
//!
//! Both return one unit-length vector per input, in input order. A call
//! either returns every vector or fails as a whole.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::semantic::index::normalize;

/// Base delay between retries of a transient remote failure, multiplied by the attempt number
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Longest slice of an error body kept in error messages
const MAX_ERROR_BODY: usize = 200;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Embedding endpoint refused credentials: {0}")]
    Auth(String),

    #[error("Embedding endpoint quota exceeded: {0}")]
    Quota(String),

    #[error("Embedding endpoint temporarily unavailable: {0}")]
    Transient(String),

    #[error("Malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("Embedding request rejected: {0}")]
    Rejected(String),
}

/// The configured embedding backend.
pub enum Embedder {
    Local(LocalEmbedder),
    Remote(RemoteEmbedder),
}

impl Embedder {
    /// Build the backend selected in `config`.
    ///
    /// Local models are cached under `<cache_root>/models`.
    pub fn from_config(config: &EmbeddingConfig, cache_root: &Path) -> Result<Self, EmbeddingError> {
        match config.backend {
            EmbeddingBackend::Local => Ok(Embedder::Local(LocalEmbedder::new(
                &config.local_model,
                cache_root,
            )?)),
            EmbeddingBackend::Remote => Ok(Embedder::Remote(RemoteEmbedder::new(config)?)),
        }
    }

    pub fn backend(&self) -> EmbeddingBackend {
        match self {
            Embedder::Local(_) => EmbeddingBackend::Local,
            Embedder::Remote(_) => EmbeddingBackend::Remote,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Embedder::Local(local) => local.name(),
            Embedder::Remote(remote) => remote.model(),
        }
    }

    /// Embed `texts`, one unit vector per text, in order.
    pub fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        match self {
            Embedder::Local(local) => local.embed_batch(texts),
            Embedder::Remote(remote) => remote.embed_batch(texts),
        }
    }
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
/// The model is downloaded and loaded on the first embed call.
pub struct LocalEmbedder {
    model: Mutex<Option<TextEmbedding>>,
    model_enum: EmbeddingModel,
    model_name: String,
    cache_dir: std::path::PathBuf,
}

impl LocalEmbedder {
    /// Create a local embedder for `model_name` (e.g., "bge-small-en-v1.5").
    ///
    /// Fails right away for unknown model names; the model files themselves
    /// are fetched lazily.
    pub fn new(model_name: &str, cache_root: &Path) -> Result<Self, EmbeddingError> {
        let model_enum = parse_model_name(model_name)?;

        Ok(Self {
            model: Mutex::new(None),
            model_enum,
            model_name: model_name.to_string(),
            cache_dir: cache_root.join("models"),
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    fn load(&self) -> Result<TextEmbedding, EmbeddingError> {
        std::fs::create_dir_all(&self.cache_dir).map_err(|e| {
            EmbeddingError::ModelUnavailable(format!("Failed to create models directory: {}", e))
        })?;

        log::info!("loading embedding model {}", self.model_name);
        let options = InitOptions::new(self.model_enum.clone())
            .with_cache_dir(self.cache_dir.clone())
            .with_show_download_progress(true);

        TextEmbedding::try_new(options).map_err(|e| EmbeddingError::ModelUnavailable(e.to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut guard = self.model.lock().map_err(|e| {
            EmbeddingError::ModelUnavailable(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        let model = guard
            .as_mut()
            .ok_or_else(|| EmbeddingError::ModelUnavailable("model not loaded".to_string()))?;

        let embeddings = model.embed(texts.to_vec(), None).map_err(inference_failed)?;

        finish(embeddings, texts.len())
    }
}

/// A loaded model that fails on a batch is not missing; the call may succeed again.
fn inference_failed(err: impl std::fmt::Display) -> EmbeddingError {
    EmbeddingError::Transient(format!("local inference failed: {err}"))
}

/// Resolve a model name to a fastembed model.
///
/// Accepts the short names below, a fastembed model code
/// (`Xenova/bge-small-zh-v1.5`) or any `<org>/<name>` id whose name part
/// matches one (`BAAI/bge-small-zh-v1.5`). Case is ignored.
fn parse_model_name(name: &str) -> Result<EmbeddingModel, EmbeddingError> {
    let wanted = name.trim().to_lowercase();
    let short = wanted.rsplit('/').next().unwrap_or(wanted.as_str());

    if let Some(model) = short_name(short) {
        return Ok(model);
    }

    TextEmbedding::list_supported_models()
        .into_iter()
        .find(|info| {
            let code = info.model_code.to_lowercase();
            code == wanted || code.rsplit('/').next() == Some(short)
        })
        .map(|info| info.model)
        .ok_or_else(|| {
            EmbeddingError::ModelUnavailable(format!(
                "Unknown model: {name}. Use a fastembed model code such as BAAI/bge-small-en-v1.5"
            ))
        })
}

/// Compact spellings, including quantized variants whose model codes differ.
fn short_name(name: &str) -> Option<EmbeddingModel> {
    let model = match name {
        "all-minilm-l6-v2" | "allminiml6v2" => EmbeddingModel::AllMiniLML6V2,
        "all-minilm-l6-v2-q" | "allminiml6v2q" => EmbeddingModel::AllMiniLML6V2Q,
        "bge-small-en-v1.5" | "bgesmallenv15" => EmbeddingModel::BGESmallENV15,
        "bge-small-en-v1.5-q" | "bgesmallenv15q" => EmbeddingModel::BGESmallENV15Q,
        "bge-base-en-v1.5" | "bgebaseenv15" => EmbeddingModel::BGEBaseENV15,
        "bge-base-en-v1.5-q" | "bgebaseenv15q" => EmbeddingModel::BGEBaseENV15Q,
        "bge-large-en-v1.5" | "bgelargeenv15" => EmbeddingModel::BGELargeENV15,
        "bge-large-en-v1.5-q" | "bgelargeenv15q" => EmbeddingModel::BGELargeENV15Q,
        "bge-small-zh-v1.5" | "bgesmallzhv15" => EmbeddingModel::BGESmallZHV15,
        _ => return None,
    };
    Some(model)
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Client for an OpenAI-compatible embeddings endpoint.
pub struct RemoteEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::ModelUnavailable(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.remote_base_url.trim_end_matches('/')),
            model: config.remote_model.clone(),
            api_key: config.remote_api_key.clone(),
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    /// Override the base retry delay.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.request_with_retry(batch)?);
        }

        finish(vectors, texts.len())
    }

    fn request_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut attempt = 0;
        loop {
            match self.request(batch) {
                Err(EmbeddingError::Transient(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "embedding request failed ({msg}), retry {attempt}/{}",
                        self.max_retries
                    );
                    std::thread::sleep(self.retry_backoff * attempt);
                }
                result => return result,
            }
        }
    }

    fn request(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        log::debug!("POST {} ({} inputs)", self.endpoint, batch.len());

        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: batch,
        });
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .map_err(|e| EmbeddingError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let bytes = response
            .bytes()
            .map_err(|e| EmbeddingError::Transient(e.to_string()))?;
        let parsed: EmbeddingResponse = serde_json::from_slice(&bytes)
            .map_err(|e| EmbeddingError::MalformedResponse(e.to_string()))?;

        into_ordered(parsed.data, batch.len())
    }
}

/// Map a non-success HTTP status to an error kind.
fn classify_status(status: reqwest::StatusCode, body: &str) -> EmbeddingError {
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());

    match status.as_u16() {
        401 | 403 => EmbeddingError::Auth(message),
        429 => EmbeddingError::Quota(message),
        500..=599 => EmbeddingError::Transient(message),
        _ => EmbeddingError::Rejected(message),
    }
}

/// Put response items back in request order.
///
/// Items carrying an `index` are sorted by it; the indices must then be
/// exactly `0..expected`. Items without one are taken as already ordered.
fn into_ordered(mut items: Vec<EmbeddingItem>, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if items.len() != expected {
        return Err(EmbeddingError::MalformedResponse(format!(
            "expected {expected} embeddings, got {}",
            items.len()
        )));
    }

    if items.iter().all(|item| item.index.is_some()) {
        items.sort_by_key(|item| item.index);
        let in_range = items
            .iter()
            .enumerate()
            .all(|(position, item)| item.index == Some(position));
        if !in_range {
            return Err(EmbeddingError::MalformedResponse(
                "response indices are not a permutation of the inputs".to_string(),
            ));
        }
    } else if items.iter().any(|item| item.index.is_some()) {
        return Err(EmbeddingError::MalformedResponse(
            "only some response items carry an index".to_string(),
        ));
    }

    Ok(items.into_iter().map(|item| item.embedding).collect())
}

/// Check counts and dimensionality, then normalize every vector.
fn finish(mut vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if vectors.len() != expected {
        return Err(EmbeddingError::MalformedResponse(format!(
            "expected {expected} embeddings, got {}",
            vectors.len()
        )));
    }

    let dimensions = vectors.first().map(Vec::len).unwrap_or(0);
    for (position, vector) in vectors.iter_mut().enumerate() {
        if vector.is_empty() || vector.len() != dimensions {
            return Err(EmbeddingError::MalformedResponse(format!(
                "embedding {position} has {} dimensions, expected {dimensions}",
                vector.len()
            )));
        }
        if vector.iter().any(|x| !x.is_finite()) || !normalize(vector) {
            return Err(EmbeddingError::MalformedResponse(format!(
                "embedding {position} is zero or not finite"
            )));
        }
    }

    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::index::l2_norm;

    fn item(embedding: Vec<f32>, index: Option<usize>) -> EmbeddingItem {
        EmbeddingItem { embedding, index }
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_local_embedding_generation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let embedder = LocalEmbedder::new("bge-small-en-v1.5", temp_dir.path()).unwrap();

        let texts = vec!["Hello, world!".to_string(), "second".to_string()];
        let embeddings = embedder.embed_batch(&texts).unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].len(), 384);

        for embedding in &embeddings {
            assert!((l2_norm(embedding) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = LocalEmbedder::new("nonexistent-model", temp_dir.path());
        assert!(matches!(result, Err(EmbeddingError::ModelUnavailable(_))));
    }

    #[test]
    fn test_model_names_case_insensitive() {
        assert!(parse_model_name("BGE-Small-EN-v1.5").is_ok());
        assert!(parse_model_name("all-MiniLM-L6-v2").is_ok());
    }

    #[test]
    fn test_hugging_face_ids_resolve() {
        assert!(matches!(
            parse_model_name("BAAI/bge-small-zh-v1.5"),
            Ok(EmbeddingModel::BGESmallZHV15)
        ));
        assert!(matches!(
            parse_model_name("Xenova/bge-small-zh-v1.5"),
            Ok(EmbeddingModel::BGESmallZHV15)
        ));
        assert!(matches!(
            parse_model_name("BAAI/bge-small-en-v1.5"),
            Ok(EmbeddingModel::BGESmallENV15)
        ));
        assert!(matches!(
            parse_model_name("sentence-transformers/all-MiniLM-L6-v2"),
            Ok(EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(matches!(
            parse_model_name("BAAI/not-a-model"),
            Err(EmbeddingError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn test_local_constructs_for_hugging_face_id() {
        let temp_dir = tempfile::tempdir().unwrap();
        let embedder = LocalEmbedder::new("BAAI/bge-small-zh-v1.5", temp_dir.path()).unwrap();
        assert_eq!(embedder.name(), "BAAI/bge-small-zh-v1.5");
        // nothing is downloaded until the first embed
        assert!(!temp_dir.path().join("models").exists());
    }

    #[test]
    fn test_inference_failure_is_transient() {
        let err = inference_failed("session run failed");
        assert!(matches!(err, EmbeddingError::Transient(_)));
        assert!(err.to_string().contains("session run failed"));
    }

    #[test]
    fn test_empty_input_skips_backend() {
        let config = EmbeddingConfig {
            backend: EmbeddingBackend::Remote,
            // nothing listens here; an actual request would fail
            remote_base_url: "http://127.0.0.1:9".to_string(),
            ..EmbeddingConfig::default()
        };
        let temp_dir = tempfile::tempdir().unwrap();
        let embedder = Embedder::from_config(&config, temp_dir.path()).unwrap();

        assert!(embedder.embed(&[]).unwrap().is_empty());
        assert_eq!(embedder.backend(), EmbeddingBackend::Remote);
        assert_eq!(embedder.model(), "text-embedding-3-small");
    }

    #[test]
    fn test_classify_status() {
        use reqwest::StatusCode;

        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED, ""), EmbeddingError::Auth(_)));
        assert!(matches!(classify_status(StatusCode::FORBIDDEN, ""), EmbeddingError::Auth(_)));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            EmbeddingError::Quota(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            EmbeddingError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad model"),
            EmbeddingError::Rejected(_)
        ));
    }

    #[test]
    fn test_error_body_truncated() {
        let body = "x".repeat(10_000);
        let err = classify_status(reqwest::StatusCode::BAD_REQUEST, &body);
        assert!(err.to_string().len() < 400);
    }

    #[test]
    fn test_into_ordered_sorts_by_index() {
        let items = vec![
            item(vec![2.0], Some(2)),
            item(vec![0.0], Some(0)),
            item(vec![1.0], Some(1)),
        ];
        let ordered = into_ordered(items, 3).unwrap();
        assert_eq!(ordered, vec![vec![0.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_into_ordered_without_index_keeps_order() {
        let items = vec![item(vec![5.0], None), item(vec![3.0], None)];
        let ordered = into_ordered(items, 2).unwrap();
        assert_eq!(ordered, vec![vec![5.0], vec![3.0]]);
    }

    #[test]
    fn test_into_ordered_rejects_bad_indices() {
        let duplicate = vec![item(vec![1.0], Some(0)), item(vec![1.0], Some(0))];
        assert!(matches!(
            into_ordered(duplicate, 2),
            Err(EmbeddingError::MalformedResponse(_))
        ));

        let mixed = vec![item(vec![1.0], Some(0)), item(vec![1.0], None)];
        assert!(matches!(
            into_ordered(mixed, 2),
            Err(EmbeddingError::MalformedResponse(_))
        ));

        let short = vec![item(vec![1.0], Some(0))];
        assert!(matches!(
            into_ordered(short, 2),
            Err(EmbeddingError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_finish_normalizes() {
        let vectors = finish(vec![vec![3.0, 4.0], vec![0.0, 2.0]], 2).unwrap();
        assert!((vectors[0][0] - 0.6).abs() < 1e-6);
        assert!((vectors[0][1] - 0.8).abs() < 1e-6);
        for vector in &vectors {
            assert!((l2_norm(vector) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_finish_rejects_bad_vectors() {
        assert!(finish(vec![vec![0.0, 0.0]], 1).is_err());
        assert!(finish(vec![vec![f32::NAN, 1.0]], 1).is_err());
        assert!(finish(vec![vec![1.0, 0.0], vec![1.0]], 2).is_err());
        assert!(finish(vec![vec![]], 1).is_err());
    }
}
