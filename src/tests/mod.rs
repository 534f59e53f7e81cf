mod mock_api;
mod web;

use std::path::Path;

use crate::config::{Config, EmbeddingBackend};
use mock_api::MockApi;

/// Remote-backed configuration pointing at `api`, storing under `kb_dir`.
pub fn remote_config(kb_dir: &Path, api: &MockApi) -> Config {
    let mut config = Config::default();
    config.kb_dir = kb_dir.to_path_buf();
    config.embedding.backend = EmbeddingBackend::Remote;
    config.embedding.remote_base_url = api.base_url.clone();
    config.embedding.max_retries = 0;
    config
}
