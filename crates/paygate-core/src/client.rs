//! ============================================================================
//! Meter Client - HTTP client for the meter endpoints + mirror driver
//! ============================================================================
//! `MeterClient` wraps the two endpoints. `MirroredReader` keeps a
//! `ClientMirror` in step with the server: seeded by the display read on page
//! load, replaced by every metered response, untouched on failures.
//! ============================================================================

use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::mirror::ClientMirror;
use crate::server::{ACCOUNT_HEADER, FORWARDED_FOR_HEADER, METER_PATH};
use crate::types::{AccessOutcome, ContentRequest, ErrorBody, MeterResponse, MeterSnapshot};

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Metering unavailable, try again")]
    MeteringUnavailable,

    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub struct MeterClient {
    http: Client,
    endpoint: Url,
    account_id: Option<String>,
    forwarded_for: Option<String>,
}

impl MeterClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Self::with_http_client(base_url, http)
    }

    /// Use a preconfigured reqwest client (proxy, TLS, timeouts)
    pub fn with_http_client(base_url: &str, http: Client) -> Result<Self, ClientError> {
        let endpoint = Url::parse(base_url)
            .and_then(|base| base.join(METER_PATH))
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        Ok(Self {
            http,
            endpoint,
            account_id: None,
            forwarded_for: None,
        })
    }

    /// Send requests as an authenticated account
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Send requests with a forwarded-for chain (when acting as a proxy)
    pub fn with_forwarded_for(mut self, chain: impl Into<String>) -> Self {
        self.forwarded_for = Some(chain.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// `GET /api/meter`
    pub async fn fetch_count(&self) -> Result<MeterSnapshot, ClientError> {
        let response = self
            .decorate(self.http.get(self.endpoint.clone()))
            .send()
            .await?;
        Self::parse(response, None).await
    }

    /// `POST /api/meter`. Not idempotent; do not retry blindly.
    pub async fn request_content(&self, content_id: &str) -> Result<MeterResponse, ClientError> {
        let body = ContentRequest {
            content_id: content_id.to_string(),
        };
        let response = self
            .decorate(self.http.post(self.endpoint.clone()).json(&body))
            .send()
            .await?;
        Self::parse(response, Some(content_id)).await
    }

    fn decorate(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(account) = &self.account_id {
            request = request.header(ACCOUNT_HEADER, account);
        }
        if let Some(chain) = &self.forwarded_for {
            request = request.header(FORWARDED_FOR_HEADER, chain);
        }
        request
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        content_id: Option<&str>,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.message,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };

        match (status, content_id) {
            (StatusCode::SERVICE_UNAVAILABLE, _) => Err(ClientError::MeteringUnavailable),
            (StatusCode::NOT_FOUND, Some(id)) => Err(ClientError::ContentNotFound(id.to_string())),
            _ => Err(ClientError::Server {
                status: status.as_u16(),
                message,
            }),
        }
    }
}

/// Reader-side flow: display from the mirror, decide on the server
pub struct MirroredReader {
    client: MeterClient,
    mirror: ClientMirror,
    persist_path: Option<PathBuf>,
}

impl MirroredReader {
    pub fn new(client: MeterClient) -> Self {
        Self {
            client,
            mirror: ClientMirror::new(),
            persist_path: None,
        }
    }

    /// Persist the mirror to a file between sessions
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.mirror = ClientMirror::load(&path);
        self.persist_path = Some(path);
        self
    }

    pub fn mirror(&self) -> &ClientMirror {
        &self.mirror
    }

    /// Page load: seed the mirror from the display read
    pub async fn page_load(&mut self) -> Result<MeterSnapshot, ClientError> {
        let snapshot = self.client.fetch_count().await?;
        self.mirror.seed(snapshot.day, snapshot.count);
        self.persist();
        Ok(snapshot)
    }

    /// Open a content item. The server decides; the mirror adopts its count.
    /// On error the mirror is left as it was. A premium block never touches
    /// the meter and its count may be a placeholder, so it is not adopted.
    pub async fn open(&mut self, content_id: &str) -> Result<MeterResponse, ClientError> {
        let response = self.client.request_content(content_id).await?;
        if response.outcome != AccessOutcome::BlockedPremium {
            self.mirror.reconcile(response.day, response.count);
            self.persist();
        }
        debug!(
            "Opened {}: {} ({} remaining)",
            content_id,
            response.outcome.as_str(),
            response.remaining
        );
        Ok(response)
    }

    fn persist(&self) {
        if let Some(path) = &self.persist_path {
            if let Err(e) = self.mirror.save(path) {
                warn!("Failed to persist mirror: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessGate, EntitlementResolver, SubscriptionTier};
    use crate::catalog::Directory;
    use crate::db::MeterDb;
    use crate::identity::IdentityResolver;
    use crate::server::{MeterServer, MeterState, ShutdownHandle};
    use std::sync::Arc;

    fn start_server(cap: u32) -> (String, ShutdownHandle, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let directory = Arc::new(
            Directory::default()
                .with_account("sub-1", SubscriptionTier::Premium)
                .with_content("story-a", false)
                .with_content("story-b", false)
                .with_content("vault", true),
        );
        let gate = AccessGate::new(
            Arc::new(MeterDb::in_memory().unwrap()),
            EntitlementResolver::new(directory.clone()),
        );
        let state = MeterState::new(gate, IdentityResolver::system(), directory, cap);
        let server = MeterServer::bind("127.0.0.1:0", state).unwrap();
        let base = format!("http://{}", server.local_addr().unwrap());
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());
        (base, shutdown, task)
    }

    fn loopback_client(base: &str) -> MeterClient {
        let http = Client::builder().no_proxy().build().unwrap();
        MeterClient::with_http_client(base, http).unwrap()
    }

    #[test]
    fn test_endpoint_join() {
        let client = MeterClient::new("http://localhost:8787").unwrap();
        assert_eq!(client.endpoint().as_str(), "http://localhost:8787/api/meter");
        assert!(matches!(
            MeterClient::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mirror_follows_server() {
        let (base, shutdown, task) = start_server(2);
        let mut reader = MirroredReader::new(
            loopback_client(&base).with_forwarded_for("192.0.2.44"),
        );

        let snapshot = reader.page_load().await.unwrap();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.remaining, 2);
        let today = snapshot.day;

        let first = reader.open("story-a").await.unwrap();
        assert!(first.allowed);
        assert_eq!(reader.mirror().count_on(today), 1);

        reader.open("story-b").await.unwrap();
        let blocked = reader.open("story-a").await.unwrap();
        assert_eq!(blocked.outcome, AccessOutcome::BlockedQuota);
        assert_eq!(blocked.count, 2);
        assert_eq!(reader.mirror().count_on(today), 2);
        assert_eq!(reader.mirror().remaining_on(today, 2), 0);

        let premium = reader.open("vault").await.unwrap();
        assert_eq!(premium.outcome, AccessOutcome::BlockedPremium);
        assert_eq!(reader.mirror().count_on(today), 2);

        let missing = reader.open("nope").await;
        assert!(matches!(missing, Err(ClientError::ContentNotFound(_))));
        assert_eq!(reader.mirror().count_on(today), 2);

        shutdown.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscriber_over_http() {
        let (base, shutdown, task) = start_server(1);
        let client = loopback_client(&base).with_account("sub-1");

        for _ in 0..3 {
            let response = client.request_content("vault").await.unwrap();
            assert!(response.allowed);
            assert_eq!(response.count, 0);
        }
        assert_eq!(client.fetch_count().await.unwrap().count, 0);

        // Bad body is rejected without touching the meter
        let raw = Client::builder()
            .no_proxy()
            .build()
            .unwrap()
            .post(client.endpoint().clone())
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(raw.status(), StatusCode::BAD_REQUEST);

        shutdown.shutdown();
        task.await.unwrap().unwrap();
    }
}
