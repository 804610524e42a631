//! ============================================================================
//! Meter Server - HTTP surface for the access gate
//! ============================================================================
//! - `GET  /api/meter`  current count for the caller (display only)
//! - `POST /api/meter`  `{"content_id": ...}` -> authoritative decision
//! - `GET  /healthz`    liveness
//!
//! The caller is identified by `X-Forwarded-For` (first hop) or the peer
//! address; `X-Account-Id` carries an authenticated session's account id and
//! is expected to be set by the upstream auth layer.
//!
//! tiny_http accepts on a blocking thread; each request is handled on the
//! tokio blocking pool and drives the async gate with `Handle::block_on`.
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use tiny_http::{Header, Method, Request, Response, Server};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::access::AccessGate;
use crate::catalog::ContentCatalog;
use crate::identity::{IdentityResolver, RequestMeta};
use crate::types::{
    AccessOutcome, ContentRequest, ErrorBody, GateError, MeterResponse, MeterSnapshot,
};

pub const METER_PATH: &str = "/api/meter";
pub const HEALTH_PATH: &str = "/healthz";
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";
pub const ACCOUNT_HEADER: &str = "X-Account-Id";

/// Largest accepted request body
const MAX_BODY_BYTES: u64 = 16 * 1024;

/// Everything a request handler needs
pub struct MeterState {
    gate: AccessGate,
    resolver: IdentityResolver,
    catalog: Arc<dyn ContentCatalog>,
    cap: u32,
}

impl MeterState {
    pub fn new(
        gate: AccessGate,
        resolver: IdentityResolver,
        catalog: Arc<dyn ContentCatalog>,
        cap: u32,
    ) -> Self {
        Self {
            gate,
            resolver,
            catalog,
            cap,
        }
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Non-mutating count for banners
    pub async fn snapshot(&self, meta: &RequestMeta) -> Result<MeterSnapshot, GateError> {
        let identity = self.resolver.resolve(meta);
        let count = self.gate.peek(&identity).await?;
        Ok(MeterSnapshot {
            count,
            day: identity.day,
            cap: self.cap,
            remaining: self.cap.saturating_sub(count),
        })
    }

    /// Authoritative gated read. Each call may consume one unit of quota.
    pub async fn content_request(
        &self,
        meta: &RequestMeta,
        content_id: &str,
    ) -> Result<MeterResponse, GateError> {
        let identity = self.resolver.resolve(meta);

        let content = match self.catalog.content_flag(content_id).await {
            Ok(Some(flag)) => flag,
            Ok(None) => return Err(GateError::ContentNotFound(content_id.to_string())),
            Err(e) => {
                warn!("Content lookup failed for {}: {}", content_id, e);
                return Err(GateError::ContentLookupFailed(e.to_string()));
            }
        };

        let decision = self.gate.decide(&identity, &content, self.cap).await?;

        // A premium block leaves the meter untouched. The stored count is
        // only reported for display; the block stands when the store is down.
        let (count, remaining) = match decision.outcome {
            AccessOutcome::BlockedPremium => match self.gate.peek(&identity).await {
                Ok(count) => (count, self.cap.saturating_sub(count)),
                Err(e) => {
                    warn!("Premium block for {} without a meter count: {}", identity.key, e);
                    (decision.count_after, decision.remaining)
                }
            },
            _ => (decision.count_after, decision.remaining),
        };

        Ok(MeterResponse {
            allowed: decision.outcome.is_allowed(),
            count,
            outcome: decision.outcome,
            remaining,
            day: identity.day,
        })
    }
}

/// Stops a running server from another task
#[derive(Clone)]
pub struct ShutdownHandle {
    server: Arc<Server>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("Meter server shutting down");
        self.server.unblock();
    }
}

pub struct MeterServer {
    server: Arc<Server>,
    state: Arc<MeterState>,
}

impl MeterServer {
    pub fn bind(addr: &str, state: MeterState) -> Result<Self> {
        let server = Server::http(addr)
            .map_err(|e| anyhow!("Failed to start meter server on {}: {}", addr, e))?;
        Ok(Self {
            server: Arc::new(server),
            state: Arc::new(state),
        })
    }

    /// Bound address (useful when binding port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            server: Arc::clone(&self.server),
        }
    }

    /// Serve until `ShutdownHandle::shutdown` is called
    pub async fn run(self) -> Result<()> {
        let runtime = Handle::current();
        let server = Arc::clone(&self.server);
        let state = Arc::clone(&self.state);

        if let Some(addr) = self.local_addr() {
            info!("Meter server listening on http://{}", addr);
        }

        tokio::task::spawn_blocking(move || {
            for request in server.incoming_requests() {
                let state = Arc::clone(&state);
                let handle = runtime.clone();
                runtime.spawn_blocking(move || handle_request(&handle, &state, request));
            }
            info!("Meter server stopped");
        })
        .await
        .map_err(|e| anyhow!("Meter server loop failed: {}", e))
    }
}

struct Reply {
    status: u16,
    body: String,
}

impl Reply {
    fn json<T: Serialize>(status: u16, payload: &T) -> Self {
        match serde_json::to_string(payload) {
            Ok(body) => Self { status, body },
            Err(e) => {
                error!("Failed to serialize response: {}", e);
                Self {
                    status: 500,
                    body: r#"{"error":"internal","message":"serialization failed"}"#.to_string(),
                }
            }
        }
    }

    fn error(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self::json(
            status,
            &ErrorBody {
                error: code.to_string(),
                message: message.into(),
            },
        )
    }

    fn from_gate_error(e: &GateError) -> Self {
        let message = match e {
            GateError::MeteringUnavailable(_) => "Metering is temporarily unavailable, try again".to_string(),
            other => other.to_string(),
        };
        Self::error(e.http_status(), e.code(), message)
    }
}

fn handle_request(runtime: &Handle, state: &MeterState, mut request: Request) {
    let meta = request_meta(&request);
    let path = request.url().split('?').next().unwrap_or_default().to_string();
    let method = request.method().clone();
    debug!("{} {} from {:?}", method, path, meta.peer_addr);

    let reply = match (&method, path.as_str()) {
        (Method::Get, HEALTH_PATH) => Reply::json(200, &serde_json::json!({ "status": "ok" })),
        (Method::Get, METER_PATH) => match runtime.block_on(state.snapshot(&meta)) {
            Ok(snapshot) => Reply::json(200, &snapshot),
            Err(e) => Reply::from_gate_error(&e),
        },
        (Method::Post, METER_PATH) => {
            let mut raw = String::new();
            match request.as_reader().take(MAX_BODY_BYTES).read_to_string(&mut raw) {
                Ok(_) => gated_read(runtime, state, &meta, &raw),
                Err(e) => Reply::error(400, "bad_request", format!("Failed to read body: {}", e)),
            }
        }
        (_, METER_PATH) => Reply::error(405, "method_not_allowed", format!("{} not allowed", method)),
        _ => Reply::error(404, "not_found", format!("No route for {}", path)),
    };

    respond(request, reply);
}

fn gated_read(runtime: &Handle, state: &MeterState, meta: &RequestMeta, raw: &str) -> Reply {
    let body: ContentRequest = match serde_json::from_str(raw) {
        Ok(body) => body,
        Err(e) => return Reply::error(400, "bad_request", format!("Invalid body: {}", e)),
    };
    let content_id = body.content_id.trim();
    if content_id.is_empty() {
        return Reply::error(400, "bad_request", "content_id is required");
    }

    match runtime.block_on(state.content_request(meta, content_id)) {
        Ok(response) => Reply::json(200, &response),
        Err(e) => Reply::from_gate_error(&e),
    }
}

fn request_meta(request: &Request) -> RequestMeta {
    let mut meta = RequestMeta {
        peer_addr: request.remote_addr().map(|addr| addr.ip()),
        ..RequestMeta::default()
    };
    let mut forwarded = Vec::new();
    for header in request.headers() {
        if header.field.equiv(FORWARDED_FOR_HEADER) {
            forwarded.push(header.value.as_str());
        } else if header.field.equiv(ACCOUNT_HEADER) {
            meta.account_id = Some(header.value.as_str().to_string());
        }
    }
    meta.forwarded_for = join_forwarded(&forwarded);
    meta
}

/// Repeated forwarded-for lines form one chain, in arrival order
fn join_forwarded(lines: &[&str]) -> Option<String> {
    if lines.is_empty() {
        None
    } else {
        Some(lines.join(", "))
    }
}

fn respond(request: Request, reply: Reply) {
    let mut response = Response::from_string(reply.body).with_status_code(reply.status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    if let Err(e) = request.respond(response) {
        warn!("Failed to send response: {}", e);
    }
}
