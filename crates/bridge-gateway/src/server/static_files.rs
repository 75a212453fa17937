//! Static file server
//!
//! Maps the request path onto a file below a fixed root directory.

use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

const INDEX_FILE: &str = "index.html";

/// Static file errors, rendered as plain HTML status pages
#[derive(Debug, Error)]
pub enum StaticFileError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IntoResponse for StaticFileError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::NotFound(path) => {
                tracing::debug!(path = %path, "Static file not found");
                (StatusCode::NOT_FOUND, "404 Not Found")
            }
            Self::Read { path, source } => {
                tracing::error!(path = %path.display(), error = %source, "Static file read failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error")
            }
        };

        (status, [(header::CONTENT_TYPE, "text/html")], body).into_response()
    }
}

/// Content type for a file, by extension
pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("ico") => "image/x-icon",
        Some("html") => "text/html",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("css") => "text/css",
        Some("png") => "image/png",
        Some("jpg") => "image/jpeg",
        _ => "text/plain",
    }
}

/// Resolve a URL path below `root`, rejecting anything that would escape it
pub fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();

    for component in relative.components() {
        match component {
            Component::Normal(segment) => resolved.push(segment),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(resolved)
}

/// Serve one file from the root
pub async fn serve_file(
    State(root): State<Arc<PathBuf>>,
    uri: Uri,
) -> Result<Response, StaticFileError> {
    let request_path = uri.path();
    let not_found = || StaticFileError::NotFound(request_path.to_string());

    let mut path = resolve(&root, request_path).ok_or_else(not_found)?;

    let metadata = tokio::fs::metadata(&path).await.map_err(|_| not_found())?;
    if metadata.is_dir() {
        path.push(INDEX_FILE);
    }

    let content = tokio::fs::read(&path).await.map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => not_found(),
        _ => StaticFileError::Read {
            path: path.clone(),
            source,
        },
    })?;

    Ok(([(header::CONTENT_TYPE, content_type(&path))], content).into_response())
}

/// Build the static file application
pub fn create_static_app(root: PathBuf) -> Router {
    Router::new()
        .route("/", get(serve_file))
        .fallback(serve_file)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(root))
}
