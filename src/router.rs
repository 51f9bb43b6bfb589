use axum::{
    Json, Router,
    body::Body,
    extract::{Path as HttpPath, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use std::path::PathBuf;
use tokio_util::io::ReaderStream;
use tower_http::{services::ServeDir, trace::TraceLayer};
use ulid::Ulid;

use crate::job::Job;
use crate::service::{JobService, ServiceError};

/// Directory served for anything that isn't an API route (the web UI)
const STATIC_DIR: &str = "static";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("Malformed job id: {0}")]
    BadId(String),
    #[error("File {} is gone: {source}", path.display())]
    MissingFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to build response: {0}")]
    Http(#[from] axum::http::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Error::Service(ServiceError::NotFound(_)) | Error::BadId(_) => {
                (StatusCode::NOT_FOUND, "Not found")
            }
            Error::MissingFile { .. } => (StatusCode::NOT_FOUND, "Not found"),
            Error::Service(ServiceError::NotDownloaded(_)) => {
                (StatusCode::BAD_REQUEST, "ERROR - Not yet downloaded")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "ERROR"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, Error>;

fn parse_id(raw: &str) -> ApiResult<Ulid> {
    Ulid::from_string(raw).map_err(|_| Error::BadId(raw.to_string()))
}

#[derive(Debug, Deserialize)]
struct AddRequest {
    /// One or more URLs, newline separated
    url: String,
}

async fn list_jobs(State(service): State<JobService>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(service.list().await?))
}

async fn add_jobs(
    State(service): State<JobService>,
    Json(request): Json<AddRequest>,
) -> ApiResult<impl IntoResponse> {
    let created = service.add_from_urls(&request.url).await?;
    tracing::debug!(count = created.len(), "Jobs created");
    Ok((StatusCode::CREATED, "OK"))
}

async fn remove_job(
    State(service): State<JobService>,
    HttpPath(id): HttpPath<String>,
) -> ApiResult<&'static str> {
    service.remove(parse_id(&id)?).await?;
    Ok("OK")
}

async fn restart_job(
    State(service): State<JobService>,
    HttpPath(id): HttpPath<String>,
) -> ApiResult<&'static str> {
    service.restart(parse_id(&id)?).await?;
    Ok("OK")
}

async fn download_file(
    State(service): State<JobService>,
    HttpPath(id): HttpPath<String>,
) -> ApiResult<Response> {
    let path = service.file_path(parse_id(&id)?).await?;
    tracing::debug!(%id, path = ?path, "Serving file");

    let file = tokio::fs::File::open(&path).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::MissingFile {
                path: path.clone(),
                source,
            }
        } else {
            Error::Io {
                path: path.clone(),
                source,
            }
        }
    })?;
    let length = file
        .metadata()
        .await
        .map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?
        .len();

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    let response = Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(header::CONTENT_LENGTH, length)
        .header(header::CONTENT_DISPOSITION, content_disposition(&filename))
        .body(Body::from_stream(ReaderStream::new(file)))?;

    Ok(response)
}

/// Attachment header with an ASCII fallback name and the exact name percent-encoded.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

pub fn create_router(service: JobService) -> Router {
    Router::new()
        .route("/downloads", get(list_jobs))
        .route("/add", post(add_jobs))
        .route("/remove/{id}", delete(remove_job))
        .route("/restart/{id}", post(restart_job))
        .route("/download/{id}", get(download_file))
        .fallback_service(ServeDir::new(STATIC_DIR))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
