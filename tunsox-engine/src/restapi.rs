//! Statistics HTTP endpoint
//!
//! Serves `GET /stats` as JSON. When a token is configured the request must
//! carry `Authorization: Bearer <token>`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{Error, Result};
use crate::stats::StatsSource;

/// Listen address and optional token parsed from `http://[token@]host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestApiTarget {
    pub addr: String,
    pub token: Option<String>,
}

/// Parse the `restapi` setting; the scheme defaults to `http`
pub fn parse_restapi(s: &str) -> Result<RestApiTarget> {
    let s = s.trim();
    let owned;
    let s = if s.contains("://") {
        s
    } else {
        owned = format!("http://{}", s);
        owned.as_str()
    };

    let url = Url::parse(s).map_err(|e| Error::Config(format!("invalid restapi '{}': {}", s, e)))?;
    if url.scheme() != "http" {
        return Err(Error::Config(format!(
            "unsupported restapi scheme: {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::Config("restapi requires a host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Config("restapi requires a port".into()))?;

    let token = match (url.username(), url.password()) {
        ("", None) => None,
        (user, None) => Some(user.to_string()),
        (user, Some(pass)) => Some(format!("{}:{}", user, pass)),
    };

    Ok(RestApiTarget {
        addr: format!("{}:{}", host, port),
        token,
    })
}

#[derive(Clone)]
struct ApiState {
    token: Option<Arc<str>>,
    source: Arc<StatsSource>,
}

/// Running statistics server
pub struct RestApi {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RestApi {
    /// Bind and start serving in the background
    pub async fn start(target: &RestApiTarget, source: Arc<StatsSource>) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(target.addr.as_str()).await?;
        let addr = listener.local_addr()?;

        let state = ApiState {
            token: target.token.as_deref().map(Arc::from),
            source,
        };
        let app = Router::new()
            .route("/stats", get(stats))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                log::warn!("[RESTAPI] server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and wait for the server task
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RestApi {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn authorized(headers: &HeaderMap, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        == Some(token)
}

async fn stats(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, state.token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.source.snapshot()).into_response()
}
