//! HTTP callback plumbing.
//!
//! The runtime answers API requests by POSTing a reply to the `callback` URL
//! the event carried; the node HTTP listener receives those replies on
//! `POST /v1/respond` and wakes the waiting caller through the holder. The
//! same listener serves `/health` and `/metrics`.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response as HttpResponse, Server, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::errors::{CoreError, Result};
use crate::holder::{Response, Status};
use crate::manager::ApiManager;
use crate::metrics;

/// Path the callback URL points at.
pub const RESPOND_PATH: &str = "/v1/respond";

/// Builds the callback URL advertised in dispatched events.
pub fn callback_addr(host: &str, port: u16) -> String {
    format!("http://{}:{}{}", host, port, RESPOND_PATH)
}

/// Wire body of `POST /v1/respond`. `data` is base64.
#[derive(Debug, Serialize, Deserialize)]
struct RespondBody {
    #[serde(rename = "reqID")]
    req_id: String,
    status: Status,
    #[serde(rename = "errCode", default)]
    err_code: String,
    #[serde(default)]
    data: String,
}

impl From<&Response> for RespondBody {
    fn from(response: &Response) -> Self {
        RespondBody {
            req_id: response.req_id.clone(),
            status: response.status,
            err_code: response.err_code.clone(),
            data: BASE64.encode(&response.data),
        }
    }
}

impl RespondBody {
    fn into_response(self) -> Result<Response> {
        let data = BASE64
            .decode(self.data.as_bytes())
            .map_err(|e| CoreError::InvalidParam(format!("respond data is not base64: {}", e)))?;
        Ok(Response {
            req_id: self.req_id,
            status: self.status,
            err_code: self.err_code,
            data,
        })
    }
}

// ── Callback client ───────────────────────────────────────────────────────────

/// Posts reply events to callback URLs.
pub struct CallbackClient {
    client: reqwest::Client,
}

impl CallbackClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Deliver one reply. A lost reply surfaces as the caller's holder
    /// timeout, so errors are reported but not retried here.
    pub async fn post_reply(&self, callback_url: &str, response: &Response) -> Result<()> {
        let body = RespondBody::from(response);
        let result = self
            .client
            .post(callback_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Unavailable(format!("callback post: {}", e)))?;

        if !result.status().is_success() {
            return Err(CoreError::Unavailable(format!(
                "callback returned {}",
                result.status()
            )));
        }
        metrics::CALLBACKS_SENT.inc();
        debug!(req_id = %response.req_id, url = %callback_url, "reply delivered");
        Ok(())
    }
}

impl Default for CallbackClient {
    fn default() -> Self {
        Self::new()
    }
}

// ── HTTP server ───────────────────────────────────────────────────────────────

/// JSON body returned by `GET /health`.
#[derive(Debug, Serialize)]
struct HealthBody {
    name: String,
    is_leader: bool,
    pending_requests: usize,
}

#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<ApiManager>,
    pub node_name: String,
    pub leader_probe: Arc<dyn Fn() -> bool + Send + Sync>,
}

async fn handle(
    req: Request<Body>,
    state: HttpState,
) -> std::result::Result<HttpResponse<Body>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, RESPOND_PATH) => {
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            let body: RespondBody = match serde_json::from_slice(&bytes) {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "malformed respond body");
                    return Ok(status_response(StatusCode::BAD_REQUEST, "bad request"));
                }
            };
            match body.into_response() {
                Ok(response) => {
                    state.manager.on_respond(response);
                    Ok(status_response(StatusCode::OK, "ok"))
                }
                Err(e) => {
                    warn!(error = %e, "undecodable respond data");
                    Ok(status_response(StatusCode::BAD_REQUEST, "bad data"))
                }
            }
        }
        (&Method::GET, "/health") => {
            let body = HealthBody {
                name: state.node_name.clone(),
                is_leader: (state.leader_probe)(),
                pending_requests: state.manager.holder().pending(),
            };
            let json = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
            Ok(HttpResponse::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(Body::from(json))
                .expect("static response"))
        }
        (&Method::GET, "/metrics") => Ok(HttpResponse::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Body::from(metrics::render()))
            .expect("static response")),
        _ => Ok(status_response(StatusCode::NOT_FOUND, "not found")),
    }
}

fn status_response(status: StatusCode, text: &'static str) -> HttpResponse<Body> {
    HttpResponse::builder()
        .status(status)
        .body(Body::from(text))
        .expect("static response")
}

/// Starts the node HTTP listener. Runs until the process exits; spawn it.
pub async fn start_http_server(state: HttpState, port: u16) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let state = state.clone();
                async move { handle(req, state).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(%addr, "node HTTP listener started");

    if let Err(e) = server.await {
        error!(error = %e, "node HTTP listener error");
    }
}
