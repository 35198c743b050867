use std::{fmt::Debug, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::alias_service::{
    AliasRestService, DeleteUrlError, GetUrlError, PutUrlError, PutUrlPayload, ShortenPayload,
    ShortenUrlError, ShortenedUrl,
};

pub const GREETING: &str = "Welcome to the URL shortener! The server is running.";

/// Carries the ID under which an error response was logged.
pub const ERROR_ID_HEADER: &str = "x-error-id";

type Service = Arc<dyn AliasRestService>;

#[derive(Serialize)]
pub struct Error {
    pub error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedUrl {
    pub message: String,
    pub deleted_url: ShortenedUrl,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedUrl {
    pub message: String,
    pub updated_url: ShortenedUrl,
}

/// Static routes take precedence over the `/{short_url}` capture,
/// and the aliases that would collide with them are reserved.
pub fn router(service: Service) -> Router {
    Router::new()
        .route("/", get(greeting))
        .route("/shorten", post(shorten_url))
        .route("/shortened-urls", get(list_urls))
        .route("/shortened-urls/{short_url}", put(put_url).delete(delete_url))
        .route("/{short_url}", get(redirect))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn greeting() -> &'static str {
    GREETING
}

#[instrument(skip(service))]
async fn shorten_url(
    State(service): State<Service>,
    payload: Result<Json<ShortenPayload>, JsonRejection>,
) -> Result<Json<ShortenedUrl>, Response> {
    let Json(ShortenPayload { full_url }) =
        payload.map_err(|rejection| bad_json_response(&rejection))?;

    service
        .shorten_url(full_url.as_deref().unwrap_or_default())
        .await
        .map(Json)
        .map_err(|error: ShortenUrlError| match error {
            ShortenUrlError::InvalidUrl(_) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string(), &error)
            }
            ShortenUrlError::AliasesExhausted(_) | ShortenUrlError::Internal(_) => {
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Could not shorten the URL",
                    &error,
                )
            }
        })
}

#[instrument(skip(service))]
async fn list_urls(State(service): State<Service>) -> Result<Json<Vec<ShortenedUrl>>, Response> {
    service.list_urls().await.map(Json).map_err(|error| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Could not load the shortened URLs",
            &error,
        )
    })
}

#[instrument(skip(service))]
async fn redirect(
    State(service): State<Service>,
    Path(short_url): Path<String>,
) -> Result<Response, Response> {
    let redirect = service
        .get_url(&short_url)
        .await
        .map_err(|error: GetUrlError| match error {
            GetUrlError::NotFound => error_response(StatusCode::NOT_FOUND, "URL not found", &error),
            GetUrlError::Internal(_) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not resolve the URL",
                &error,
            ),
        })?;

    let location = HeaderValue::try_from(redirect.location).map_err(|error| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Could not resolve the URL",
            &error,
        )
    })?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

#[instrument(skip(service))]
async fn delete_url(
    State(service): State<Service>,
    Path(short_url): Path<String>,
) -> Result<Json<DeletedUrl>, Response> {
    service
        .delete_url(&short_url)
        .await
        .map(|deleted_url| {
            Json(DeletedUrl {
                message: format!("Shortened URL {short_url} was deleted successfully."),
                deleted_url,
            })
        })
        .map_err(|error: DeleteUrlError| match error {
            DeleteUrlError::NotFound => error_response(
                StatusCode::NOT_FOUND,
                "No shortened URL was found to delete.",
                &error,
            ),
            DeleteUrlError::Internal(_) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "An error occurred while deleting the URL.",
                &error,
            ),
        })
}

#[instrument(skip(service))]
async fn put_url(
    State(service): State<Service>,
    Path(short_url): Path<String>,
    payload: Result<Json<PutUrlPayload>, JsonRejection>,
) -> Result<Json<UpdatedUrl>, Response> {
    let Json(PutUrlPayload {
        full_url,
        new_short_url,
    }) = payload.map_err(|rejection| bad_json_response(&rejection))?;

    service
        .put_url(&short_url, full_url, new_short_url)
        .await
        .map(|updated_url| {
            Json(UpdatedUrl {
                message: "URL was updated successfully".to_owned(),
                updated_url,
            })
        })
        .map_err(|error: PutUrlError| match error {
            PutUrlError::NotFound => error_response(StatusCode::NOT_FOUND, "URL not found", &error),
            PutUrlError::InvalidUrl(_)
            | PutUrlError::InvalidAlias(_)
            | PutUrlError::AliasTaken(_) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                error.to_string(),
                &error,
            ),
            PutUrlError::Internal(_) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "An error occurred while updating the URL.",
                &error,
            ),
        })
}

/// Only "not found" maps to a 4xx; every other failure answers 500.
fn bad_json_response(rejection: &JsonRejection) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        rejection.body_text(),
        rejection,
    )
}

fn error_response(
    status: StatusCode,
    message: impl Into<String>,
    error: &(impl Debug + ?Sized),
) -> Response {
    let err_uuid = Uuid::new_v4();
    if status.is_server_error() {
        error!(%err_uuid, ?error, "Encountered an error during a request");
    } else {
        info!(%err_uuid, ?error, "Rejected a request");
    }

    (
        status,
        [(ERROR_ID_HEADER, err_uuid.to_string())],
        Json(Error {
            error: message.into(),
        }),
    )
        .into_response()
}
