//! Docker volume driver protocol, served on the plugin unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use workspaced_protocol::{
    Capabilities, CapabilitiesResponse, ErrResponse, GetResponse, ListResponse,
    MountpointResponse, PluginActivateResponse, PluginVolumeInfo, VolumeCreateRequest,
    VolumeNameRequest, PLUGIN_CONTENT_TYPE,
};

use crate::plugin::{PluginError, VolumePlugin, VolumeStatus};

pub fn build_router(plugin: Arc<VolumePlugin>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Get", post(get))
        .route("/VolumeDriver.List", post(list))
        .route("/VolumeDriver.Capabilities", post(capabilities))
        .layer(TraceLayer::new_for_http())
        .with_state(plugin)
}

/// Serve the plugin protocol on `socket` until `cancel` fires.
pub async fn serve(
    socket: &Path,
    plugin: Arc<VolumePlugin>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use anyhow::Context;

    if let Some(parent) = socket.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    // Left behind by an unclean shutdown.
    match tokio::fs::remove_file(socket).await {
        Ok(()) => warn!(socket = %socket.display(), "removed stale plugin socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("removing stale socket {}", socket.display()))
        }
    }

    let listener = UnixListener::bind(socket)
        .with_context(|| format!("binding plugin socket {}", socket.display()))?;
    info!(socket = %socket.display(), "volume plugin listening");

    axum::serve(listener, build_router(plugin))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("plugin server")?;

    let _ = tokio::fs::remove_file(socket).await;
    Ok(())
}

fn reply<T: Serialize>(body: T) -> Response {
    ([(CONTENT_TYPE, PLUGIN_CONTENT_TYPE)], Json(body)).into_response()
}

/// Docker sends the plugin content type, so bodies are parsed by hand. An
/// empty body is the request's default.
fn parse<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("malformed request: {e}"))
}

fn log_failure(op: &str, e: &PluginError) {
    match e {
        PluginError::NotFound(_) | PluginError::AlreadyExists(_) => {}
        e => warn!(op, error = %e, "volume plugin request failed"),
    }
}

fn display(path: Option<PathBuf>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

fn volume_info(status: VolumeStatus) -> PluginVolumeInfo {
    PluginVolumeInfo {
        name: status.name,
        mountpoint: display(status.mountpoint),
        created_at: Some(status.created_at),
    }
}

async fn activate() -> Response {
    reply(PluginActivateResponse {
        implements: vec!["VolumeDriver".to_string()],
    })
}

async fn create(State(plugin): State<Arc<VolumePlugin>>, body: Bytes) -> Response {
    let req: VolumeCreateRequest = match parse(&body) {
        Ok(req) => req,
        Err(e) => return reply(ErrResponse::err(e)),
    };
    match plugin.create(&req.name, req.opts.unwrap_or_default()).await {
        Ok(()) => reply(ErrResponse::ok()),
        Err(e) => {
            log_failure("create", &e);
            reply(ErrResponse::err(e.to_string()))
        }
    }
}

async fn remove(State(plugin): State<Arc<VolumePlugin>>, body: Bytes) -> Response {
    let req: VolumeNameRequest = match parse(&body) {
        Ok(req) => req,
        Err(e) => return reply(ErrResponse::err(e)),
    };
    match plugin.remove(&req.name).await {
        Ok(()) => reply(ErrResponse::ok()),
        Err(e) => {
            log_failure("remove", &e);
            reply(ErrResponse::err(e.to_string()))
        }
    }
}

async fn mount(State(plugin): State<Arc<VolumePlugin>>, body: Bytes) -> Response {
    let req: VolumeNameRequest = match parse(&body) {
        Ok(req) => req,
        Err(e) => return reply(MountpointResponse { mountpoint: String::new(), err: e }),
    };
    let id = req.id.unwrap_or_default();
    match plugin.mount(&req.name, &id).await {
        Ok(path) => reply(MountpointResponse {
            mountpoint: path.display().to_string(),
            err: String::new(),
        }),
        Err(e) => {
            log_failure("mount", &e);
            reply(MountpointResponse {
                mountpoint: String::new(),
                err: e.to_string(),
            })
        }
    }
}

async fn unmount(State(plugin): State<Arc<VolumePlugin>>, body: Bytes) -> Response {
    let req: VolumeNameRequest = match parse(&body) {
        Ok(req) => req,
        Err(e) => return reply(ErrResponse::err(e)),
    };
    match plugin.unmount(&req.name, &req.id.unwrap_or_default()).await {
        Ok(()) => reply(ErrResponse::ok()),
        Err(e) => reply(ErrResponse::err(e.to_string())),
    }
}

async fn path(State(plugin): State<Arc<VolumePlugin>>, body: Bytes) -> Response {
    let req: VolumeNameRequest = match parse(&body) {
        Ok(req) => req,
        Err(e) => return reply(MountpointResponse { mountpoint: String::new(), err: e }),
    };
    match plugin.path(&req.name).await {
        Ok(path) => reply(MountpointResponse {
            mountpoint: display(path),
            err: String::new(),
        }),
        Err(e) => reply(MountpointResponse {
            mountpoint: String::new(),
            err: e.to_string(),
        }),
    }
}

async fn get(State(plugin): State<Arc<VolumePlugin>>, body: Bytes) -> Response {
    let req: VolumeNameRequest = match parse(&body) {
        Ok(req) => req,
        Err(e) => {
            return reply(GetResponse {
                volume: None,
                err: e,
            })
        }
    };
    match plugin.get(&req.name).await {
        Ok(status) => reply(GetResponse {
            volume: Some(volume_info(status)),
            err: String::new(),
        }),
        Err(e) => reply(GetResponse {
            volume: None,
            err: e.to_string(),
        }),
    }
}

async fn list(State(plugin): State<Arc<VolumePlugin>>) -> Response {
    let volumes = plugin.list().await.into_iter().map(volume_info).collect();
    reply(ListResponse {
        volumes,
        err: String::new(),
    })
}

async fn capabilities() -> Response {
    reply(CapabilitiesResponse {
        capabilities: Capabilities {
            scope: "local".to_string(),
        },
        err: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Catalog;
    use crate::volume::tests::harness;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn call(router: &Router, route: &str, body: &str) -> serde_json::Value {
        let resp = router
            .clone()
            .oneshot(
                Request::post(route)
                    .header(CONTENT_TYPE, PLUGIN_CONTENT_TYPE)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_driver_lifecycle() {
        let h = harness();
        let plugin = Arc::new(VolumePlugin::new(h.volumes.clone(), Catalog::in_memory(), None));
        let router = build_router(plugin);

        let activated = call(&router, "/Plugin.Activate", "").await;
        assert_eq!(activated["Implements"][0], "VolumeDriver");

        let created = call(&router, "/VolumeDriver.Create", r#"{"Name":"home-a","Opts":null}"#).await;
        assert_eq!(created["Err"], "");

        let dup = call(&router, "/VolumeDriver.Create", r#"{"Name":"home-a","Opts":{}}"#).await;
        assert_eq!(dup["Err"], "volume home-a already exists");

        let mounted = call(&router, "/VolumeDriver.Mount", r#"{"Name":"home-a","ID":"c1"}"#).await;
        assert_eq!(mounted["Err"], "");
        let mountpoint = h.volumes.active_path("home-a").display().to_string();
        assert_eq!(mounted["Mountpoint"], mountpoint.as_str());

        let path = call(&router, "/VolumeDriver.Path", r#"{"Name":"home-a"}"#).await;
        assert_eq!(path["Mountpoint"], mountpoint.as_str());

        let got = call(&router, "/VolumeDriver.Get", r#"{"Name":"home-a"}"#).await;
        assert_eq!(got["Volume"]["Name"], "home-a");
        assert_eq!(got["Volume"]["Mountpoint"], mountpoint.as_str());

        let listed = call(&router, "/VolumeDriver.List", "").await;
        assert_eq!(listed["Volumes"].as_array().unwrap().len(), 1);

        let unmounted = call(&router, "/VolumeDriver.Unmount", r#"{"Name":"home-a","ID":"c1"}"#).await;
        assert_eq!(unmounted["Err"], "");

        let removed = call(&router, "/VolumeDriver.Remove", r#"{"Name":"home-a"}"#).await;
        assert_eq!(removed["Err"], "");
        let listed = call(&router, "/VolumeDriver.List", "{}").await;
        assert!(listed["Volumes"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_volume_uses_error_envelope() {
        let h = harness();
        let router = build_router(Arc::new(VolumePlugin::new(
            h.volumes.clone(),
            Catalog::in_memory(),
            None,
        )));
        for route in [
            "/VolumeDriver.Mount",
            "/VolumeDriver.Remove",
            "/VolumeDriver.Path",
            "/VolumeDriver.Get",
            "/VolumeDriver.Unmount",
        ] {
            let resp = call(&router, route, r#"{"Name":"ghost"}"#).await;
            assert_eq!(resp["Err"], "volume ghost not found", "{route}");
        }
    }

    #[tokio::test]
    async fn test_malformed_body_and_capabilities() {
        let h = harness();
        let router = build_router(Arc::new(VolumePlugin::new(
            h.volumes.clone(),
            Catalog::in_memory(),
            None,
        )));
        let resp = call(&router, "/VolumeDriver.Create", "{not json").await;
        assert!(resp["Err"].as_str().unwrap().starts_with("malformed request"));

        let caps = call(&router, "/VolumeDriver.Capabilities", "").await;
        assert_eq!(caps["Capabilities"]["Scope"], "local");
        assert_eq!(caps["Err"], "");
    }

    #[tokio::test]
    async fn test_serve_on_unix_socket() {
        let h = harness();
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run/plugin.sock");
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::write(&socket, "stale").unwrap();

        let plugin = Arc::new(VolumePlugin::new(h.volumes.clone(), Catalog::in_memory(), None));
        let cancel = CancellationToken::new();
        let server = {
            let socket = socket.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { serve(&socket, plugin, cancel).await })
        };

        let mut connected = None;
        for _ in 0..100 {
            if let Ok(stream) = tokio::net::UnixStream::connect(&socket).await {
                connected = Some(stream);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(connected.is_some(), "plugin socket never accepted");
        drop(connected);

        cancel.cancel();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
