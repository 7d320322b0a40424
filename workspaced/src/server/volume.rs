use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use workspaced_protocol::SNAPSHOT_PARENTS_HEADER;

use crate::lock::LockError;
use crate::volume::{format_etag, parse_etag, SnapshotId, VolumeError};

use super::{error_response, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/volume/{name}", get(get_volume))
        .route("/volume/{name}/activate", post(activate_volume))
}

fn volume_error(name: &str, e: VolumeError) -> Response {
    match e {
        VolumeError::InvalidName(_) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_name", e.to_string())
        }
        VolumeError::NoSnapshots(_) | VolumeError::UnknownSnapshot { .. } => {
            error_response(StatusCode::NOT_FOUND, "not_found", e.to_string())
        }
        VolumeError::Lock(LockError::Busy { .. }) => {
            error_response(StatusCode::CONFLICT, "busy", e.to_string())
        }
        e => {
            error!(volume = name, error = %e, "volume request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
        }
    }
}

fn known_parents(headers: &HeaderMap) -> Vec<SnapshotId> {
    headers
        .get(SNAPSHOT_PARENTS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').filter_map(|id| id.trim().parse().ok()).collect())
        .unwrap_or_default()
}

fn matches_etag(headers: &HeaderMap, id: SnapshotId) -> bool {
    headers
        .get_all(IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|tag| tag.trim() == "*" || parse_etag(tag) == Some(id))
}

/// Latest consistent snapshot as a (delta) send stream, identified by ETag.
async fn get_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let snapshot = match state.volumes.snapshot(&name).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("volume {name} has no snapshot available"),
            )
        }
        Err(e) => return volume_error(&name, e),
    };
    let etag = format_etag(snapshot.id);

    if matches_etag(&headers, snapshot.id) {
        return (StatusCode::NOT_MODIFIED, [(ETAG, etag)]).into_response();
    }

    let parents = known_parents(&headers);
    match state.volumes.send(&name, Some(snapshot.id), &parents).await {
        Ok((_, stream)) => (
            StatusCode::OK,
            [
                (ETAG, etag),
                (CONTENT_TYPE, "application/octet-stream".to_string()),
            ],
            Body::from_stream(ReaderStream::new(stream)),
        )
            .into_response(),
        Err(e) => volume_error(&name, e),
    }
}

#[derive(Serialize)]
struct ActivateResponse {
    volume: String,
    path: String,
}

async fn activate_volume(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.volumes.activate(&name, None).await {
        Ok(path) => Json(ActivateResponse {
            volume: name,
            path: path.display().to_string(),
        })
        .into_response(),
        Err(e) => {
            if matches!(e, VolumeError::Lock(LockError::Busy { .. })) {
                warn!(volume = %name, "activation refused, volume busy");
            }
            volume_error(&name, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::test_app;
    use crate::volume::volume_lock_key;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_cold_volume_serves_baseline() {
        let app = test_app().await;
        let resp = app
            .router
            .oneshot(Request::get("/volume/fresh").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let id = app.state.volumes.latest("fresh").await.unwrap().unwrap().id;
        assert_eq!(resp.headers()[ETAG], format_etag(id).as_str());
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/octet-stream");
    }

    #[tokio::test]
    async fn test_get_not_modified() {
        let app = test_app().await;
        let snap = app.state.volumes.snapshot("v1").await.unwrap().unwrap();
        let resp = app
            .router
            .oneshot(
                Request::get("/volume/v1")
                    .header(IF_NONE_MATCH, format_etag(snap.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(resp.headers()[ETAG], format_etag(snap.id).as_str());
    }

    #[tokio::test]
    async fn test_get_invalid_name() {
        let app = test_app().await;
        let resp = app
            .router
            .oneshot(Request::get("/volume/.hidden").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_busy_cold_volume_is_not_found() {
        let app = test_app().await;
        let _held = app
            .volumes
            .locks
            .try_acquire(&volume_lock_key("v1"), Duration::from_secs(30))
            .await
            .unwrap();
        let resp = app
            .router
            .oneshot(Request::get("/volume/v1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_activate_route() {
        let app = test_app().await;
        let resp = app
            .router
            .clone()
            .oneshot(
                Request::post("/volume/v1/activate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(app.state.volumes.is_active("v1").await);

        let _held = app
            .volumes
            .locks
            .try_acquire(&volume_lock_key("v1"), Duration::from_secs(30))
            .await
            .unwrap();
        let resp = app
            .router
            .oneshot(
                Request::post("/volume/v1/activate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(SNAPSHOT_PARENTS_HEADER, "1, 2,bogus,3".parse().unwrap());
        headers.insert(IF_NONE_MATCH, "\"9\", W/\"10\"".parse().unwrap());
        assert_eq!(known_parents(&headers), vec![1, 2, 3]);
        assert!(matches_etag(&headers, 10));
        assert!(!matches_etag(&headers, 11));
        assert!(known_parents(&HeaderMap::new()).is_empty());
    }

    /// Two nodes over real loopback HTTP: full transfer, not-modified, then
    /// a delta against the parent the receiver already holds.
    #[tokio::test]
    async fn test_replication_round_trip() {
        let source = test_app().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let router = source.router.clone();
        let server = tokio::spawn(async move { axum::serve(listener, router).await });

        let volumes = &source.state.volumes;
        let active = volumes.activate("home-x", None).await.unwrap();
        std::fs::write(active.join("notes.txt"), "v1").unwrap();

        let target = crate::volume::tests::harness();
        let first = target.volumes.fetch("home-x", &addr).await.unwrap();
        let served = volumes.latest("home-x").await.unwrap().unwrap();
        assert_eq!(first.id, served.id);
        assert_eq!(
            std::fs::read_to_string(first.path.join("notes.txt")).unwrap(),
            "v1"
        );

        // Nothing changed on the source: same snapshot, no transfer.
        let again = target.volumes.fetch("home-x", &addr).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(volumes.snapshots("home-x").await.unwrap().len(), 1);

        std::fs::write(active.join("notes.txt"), "v2").unwrap();
        let second = target.volumes.fetch("home-x", &addr).await.unwrap();
        assert!(second.id > first.id);
        assert_eq!(
            std::fs::read_to_string(second.path.join("notes.txt")).unwrap(),
            "v2"
        );
        let (sent, parent) = source.volumes.store.sends.lock().unwrap().last().cloned().unwrap();
        assert_eq!(sent, volumes.snapshots_dir("home-x").join(second.id.to_string()));
        assert_eq!(
            parent,
            Some(volumes.snapshots_dir("home-x").join(first.id.to_string()))
        );
        assert_eq!(target.volumes.snapshots("home-x").await.unwrap(), vec![first.id, second.id]);

        server.abort();
    }

    #[tokio::test]
    async fn test_fetch_unexpected_status() {
        let source = test_app().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let router = source.router.clone();
        let server = tokio::spawn(async move { axum::serve(listener, router).await });

        let _held = source
            .volumes
            .locks
            .try_acquire(&volume_lock_key("busy"), Duration::from_secs(30))
            .await
            .unwrap();
        let target = crate::volume::tests::harness();
        let err = target.volumes.fetch("busy", &addr).await.unwrap_err();
        assert!(matches!(
            err,
            VolumeError::Replication(crate::volume::ReplicationError::UnexpectedStatus {
                status: 404,
                ..
            })
        ));
        server.abort();
    }
}
