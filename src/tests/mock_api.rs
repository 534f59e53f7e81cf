//! In-process stand-in for an OpenAI-compatible embeddings API.
//!
//! Vectors are deterministic bag-of-characters counts, so equal texts get
//! equal vectors and the returned vectors are never unit length.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Ok,
    /// Reply with this status code
    Status(u16),
    /// Reply 200 with a body that isn't an embeddings response
    Garbage,
    /// Reply with one embedding fewer than requested
    WrongCount,
    /// Fail the first n requests with 500
    FailFirst(usize),
}

struct MockState {
    dimensions: usize,
    shuffle: bool,
    behavior: Behavior,
    api_key: Option<String>,
    requests: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

pub struct MockApi {
    pub base_url: String,
    state: Arc<MockState>,
}

pub struct MockApiBuilder {
    dimensions: usize,
    shuffle: bool,
    behavior: Behavior,
    api_key: Option<String>,
}

impl MockApiBuilder {
    pub fn dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Return items in reverse order, relying on their `index` field.
    pub fn shuffle(mut self) -> Self {
        self.shuffle = true;
        self
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn start(self) -> MockApi {
        let state = Arc::new(MockState {
            dimensions: self.dimensions,
            shuffle: self.shuffle,
            behavior: self.behavior,
            api_key: self.api_key,
            requests: AtomicUsize::new(0),
            batch_sizes: Mutex::new(vec![]),
        });

        let (tx, rx) = mpsc::channel::<SocketAddr>();
        let server_state = state.clone();
        // detached; lives until the test process exits
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let app = Router::new()
                    .route("/v1/embeddings", post(embeddings))
                    .with_state(server_state);
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });

        let addr = rx.recv().unwrap();
        MockApi {
            base_url: format!("http://{addr}/v1"),
            state,
        }
    }
}

impl MockApi {
    pub fn builder() -> MockApiBuilder {
        MockApiBuilder {
            dimensions: 16,
            shuffle: false,
            behavior: Behavior::Ok,
            api_key: None,
        }
    }

    pub fn start() -> MockApi {
        Self::builder().start()
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.batch_sizes.lock().unwrap().clone()
    }
}

/// Deterministic, non-normalized embedding of `text`.
pub fn fake_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions];
    let chars: Vec<char> = text.chars().collect();

    for c in &chars {
        vector[bucket(&[*c], dimensions)] += 1.0;
    }
    for pair in chars.windows(2) {
        vector[bucket(pair, dimensions)] += 2.0;
    }
    // keeps blank input from mapping to the zero vector
    vector[0] += 0.5;

    vector
}

fn bucket(chars: &[char], dimensions: usize) -> usize {
    // FNV-1a
    let mut hash: u64 = 0xcbf29ce484222325;
    for c in chars {
        for byte in (*c as u32).to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
    }
    (hash % dimensions as u64) as usize
}

async fn embeddings(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request_number = state.requests.fetch_add(1, Ordering::SeqCst);

    if let Some(key) = &state.api_key {
        let expected = format!("Bearer {key}");
        let given = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        if given != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"message": "invalid api key"}})),
            )
                .into_response();
        }
    }

    let inputs: Vec<String> = body["input"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    state.batch_sizes.lock().unwrap().push(inputs.len());

    match state.behavior {
        Behavior::Status(code) => {
            let status = StatusCode::from_u16(code).unwrap();
            return (status, Json(json!({"error": {"message": "mock failure"}}))).into_response();
        }
        Behavior::FailFirst(n) if request_number < n => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"message": "try again"}})),
            )
                .into_response();
        }
        Behavior::Garbage => {
            return (StatusCode::OK, "<html>definitely not json</html>").into_response();
        }
        _ => {}
    }

    let mut data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .map(|(index, text)| {
            json!({
                "object": "embedding",
                "index": index,
                "embedding": fake_embedding(text, state.dimensions),
            })
        })
        .collect();

    if matches!(state.behavior, Behavior::WrongCount) {
        data.pop();
    }
    if state.shuffle {
        data.reverse();
    }

    Json(json!({
        "object": "list",
        "model": body["model"],
        "data": data,
        "usage": {"prompt_tokens": 0, "total_tokens": 0},
    }))
    .into_response()
}
