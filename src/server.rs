//! HTTP surface.
//!
//! | Route | Convention | Reply |
//! |-------|------------|-------|
//! | `GET /update` | default | JSON |
//! | `GET`, `DELETE /delete` | default, delete action | JSON |
//! | `GET /nic/update`, `/v2/update`, `/v3/update` | legacy | `good`, `notfqdn`, `numhost`, `badauth`, `dnserr` |
//!
//! Validation failures are still `200 OK`; legacy clients expect a sentinel
//! body, not a status code.

use crate::config::Config;
use crate::error::Result;
use crate::extractor::{Action, Convention, UpdateRequest};
use crate::pipeline::Pipeline;
use crate::response::{FailureKind, WebserviceResponse};
use crate::store::ExpiryStore;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Build the router.
pub fn router(pipeline: Pipeline) -> Router {
    Router::new()
        .route("/update", get(update))
        .route("/delete", get(delete).delete(delete))
        .route("/nic/update", get(legacy_update))
        .route("/v2/update", get(legacy_update))
        .route("/v3/update", get(legacy_update))
        .with_state(pipeline)
}

/// Bind `config.listen` and serve until `shutdown` resolves.
pub async fn serve<F>(
    config: Arc<Config>,
    store: Option<Arc<dyn ExpiryStore>>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(config.listen).await?;
    serve_on(listener, Pipeline::new(config, store), shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_on<F>(listener: TcpListener, pipeline: Pipeline, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Serving dyndns REST services on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(pipeline).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

fn update_request(request: &Request, route_action: Action) -> UpdateRequest {
    let query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .map(|Query(query)| query)
        .unwrap_or_default();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    UpdateRequest::new(request.method().clone(), query, request.headers().clone(), peer)
        .with_route_action(route_action)
}

/// Run the pipeline on its own task so a client disconnect cannot cut an
/// update session short.
async fn process(pipeline: Pipeline, req: UpdateRequest, convention: Convention) -> WebserviceResponse {
    let handle = tokio::spawn(async move { pipeline.handle(&req, convention).await });
    match handle.await {
        Ok(response) => response,
        Err(e) => {
            error!("Update task failed: {}", e);
            WebserviceResponse::default().fail(FailureKind::UpdateFailed, "Internal error")
        }
    }
}

async fn update(State(pipeline): State<Pipeline>, request: Request) -> Json<WebserviceResponse> {
    let req = update_request(&request, Action::Update);
    Json(process(pipeline, req, Convention::Default).await)
}

async fn delete(State(pipeline): State<Pipeline>, request: Request) -> Json<WebserviceResponse> {
    let req = update_request(&request, Action::Delete);
    Json(process(pipeline, req, Convention::Default).await)
}

async fn legacy_update(State(pipeline): State<Pipeline>, request: Request) -> Response {
    let req = update_request(&request, Action::Update);
    let response = process(pipeline, req, Convention::Legacy).await;
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        legacy_reply(&response),
    )
        .into_response()
}

/// DynDNS protocol reply line.
pub fn legacy_reply(response: &WebserviceResponse) -> String {
    if response.success {
        return format!("good {}\n", response.address);
    }
    match response.failure {
        Some(FailureKind::DomainNotSet) => "notfqdn\n".to_string(),
        Some(FailureKind::MixedZones) => "numhost\n".to_string(),
        Some(FailureKind::UpdateFailed) => "dnserr\n".to_string(),
        _ => "badauth\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(kind: FailureKind) -> WebserviceResponse {
        WebserviceResponse::default().fail(kind, "x")
    }

    #[test]
    fn test_legacy_reply_lines() {
        let ok = WebserviceResponse {
            success: true,
            address: "1.2.3.4".to_string(),
            ..WebserviceResponse::default()
        };
        assert_eq!(legacy_reply(&ok), "good 1.2.3.4\n");
        assert_eq!(legacy_reply(&failed(FailureKind::DomainNotSet)), "notfqdn\n");
        assert_eq!(legacy_reply(&failed(FailureKind::UpdateFailed)), "dnserr\n");
        assert_eq!(legacy_reply(&failed(FailureKind::MixedZones)), "numhost\n");
        assert_eq!(legacy_reply(&failed(FailureKind::InvalidCredentials)), "badauth\n");
        assert_eq!(legacy_reply(&failed(FailureKind::InvalidAddress)), "badauth\n");
    }
}
