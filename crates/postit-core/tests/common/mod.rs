use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

async fn get_item(State(hits): State<Hits>, Path(id): Path<String>) -> impl IntoResponse {
    hits.0.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, [("x-item", id.clone())], format!("{{\"id\":\"{id}\"}}"))
}

/// 201 for a JSON body, 422 for anything else.
async fn post_item(
    State(hits): State<Hits>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    hits.0.fetch_add(1, Ordering::SeqCst);
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(_) => (StatusCode::CREATED, format!("created {id}")),
        Err(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    }
}

async fn status(State(hits): State<Hits>, Path(code): Path<u16>) -> impl IntoResponse {
    hits.0.fetch_add(1, Ordering::SeqCst);
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Start the mock target on an ephemeral port.
pub async fn spawn_server() -> (SocketAddr, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/get/:id", get(get_item))
        .route("/post/:id", post(post_item))
        .route("/status/:code", get(status))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

/// Unique scratch path under the system temp dir.
pub fn scratch(name: &str) -> PathBuf {
    static N: AtomicUsize = AtomicUsize::new(0);
    let n = N.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("postit-it-{}-{n}-{name}", std::process::id()))
}

pub fn write_input(contents: &str) -> PathBuf {
    let path = scratch("input.csv");
    std::fs::write(&path, contents).unwrap();
    path
}
