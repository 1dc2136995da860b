//! vCenter gateway over the VI/JSON API (`/sdk/vim25/{release}/...`).
//!
//! Cursor acquisition is three calls: fetch `ServiceContent`, `Login` through
//! the SessionManager, then `CreateCollectorForEvents` on the EventManager. The
//! returned `EventHistoryCollector` is the cursor; closing it destroys the
//! collector and logs the session out.

// Local crates
use crate::{
    collector::filter::EventFilterSpec,
    gateway::{
        gateway::{ConnectionParams, EventCursor, GatewayError, SessionGateway},
        wire::{self, ManagedObjectReference, ServiceContent},
    },
    models::event::Event,
};

// External crates
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::instrument;

/// Header carrying the VI/JSON session token.
pub const SESSION_HEADER: &str = "vmware-api-session-id";

/// vim25 release addressed when none is configured.
pub const DEFAULT_API_RELEASE: &str = "8.0.1.0";

#[derive(Debug, Clone)]
pub struct ViJsonGateway {
    params: ConnectionParams,
    client: Client,
    base_url: String,
    release: String,
}

impl ViJsonGateway {
    /// Gateway for `https://{host}:{port}`.
    pub fn new(params: ConnectionParams, release: &str) -> Result<Self, GatewayError> {
        let base_url = format!("https://{}:{}", params.host, params.port);
        Self::with_base_url(params, release, base_url)
    }

    /// Gateway for an explicit base URL (scheme, host and port).
    pub fn with_base_url(
        params: ConnectionParams,
        release: &str,
        base_url: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(params.pool_timeout)
            .connect_timeout(params.pool_timeout)
            .danger_accept_invalid_certs(!params.tls_verify)
            .build()
            .map_err(|e| GatewayError::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            params,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            release: release.to_string(),
        })
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            release: self.release.clone(),
        }
    }
}

#[async_trait]
impl SessionGateway for ViJsonGateway {
    type Cursor = ViJsonCursor;

    #[instrument(
        name = "event_collector_gateway::acquire_cursor",
        target = "gateway::vijson",
        skip_all,
        fields(host = %self.params.host, port = self.params.port),
        level = "debug"
    )]
    async fn acquire_cursor(&self, filter: &EventFilterSpec) -> Result<ViJsonCursor, GatewayError> {
        let endpoint = self.endpoint();

        tracing::debug!("Fetching vCenter service content");
        let content: ServiceContent = endpoint
            .decode(
                endpoint
                    .client
                    .get(endpoint.url("ServiceInstance", "ServiceInstance", "content")),
            )
            .await?;
        let session_manager = content.session_manager.ok_or_else(|| {
            GatewayError::InvalidResponse("service content has no sessionManager".to_string())
        })?;
        let event_manager = content.event_manager.ok_or_else(|| {
            GatewayError::InvalidResponse("service content has no eventManager".to_string())
        })?;

        tracing::debug!(
            username = %self.params.credentials.username,
            "Logging in to vCenter session manager"
        );
        let login = endpoint
            .send(
                endpoint
                    .client
                    .post(endpoint.moref_url(&session_manager, "Login"))
                    .json(&wire::login_body(
                        &self.params.credentials.username,
                        &self.params.credentials.password,
                    )),
            )
            .await?;
        let session_id = login
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                GatewayError::InvalidResponse(format!("login answer lacks {SESSION_HEADER}"))
            })?;

        let mut cursor = ViJsonCursor {
            endpoint,
            session_id,
            session_manager,
            collector: None,
            closed: false,
        };

        let created: Result<ManagedObjectReference, GatewayError> = cursor
            .endpoint
            .decode(cursor.authorized(
                cursor
                    .endpoint
                    .client
                    .post(cursor.endpoint.moref_url(&event_manager, "CreateCollectorForEvents"))
                    .json(&wire::create_collector_body(filter)),
            ))
            .await;

        match created {
            Ok(collector) => {
                tracing::info!(collector = %collector.value, "Event history collector created");
                cursor.collector = Some(collector);
                Ok(cursor)
            }
            Err(e) => {
                // Do not leave the session behind when the collector could not be created
                if let Err(close_err) = cursor.close().await {
                    tracing::warn!(error = %close_err, "Failed to log out after collector creation failure");
                }
                Err(e)
            }
        }
    }
}

/// An `EventHistoryCollector` plus the session that owns it.
#[derive(Debug)]
pub struct ViJsonCursor {
    endpoint: Endpoint,
    session_id: String,
    session_manager: ManagedObjectReference,
    collector: Option<ManagedObjectReference>,
    closed: bool,
}

impl ViJsonCursor {
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(SESSION_HEADER, &self.session_id)
    }
}

#[async_trait]
impl EventCursor for ViJsonCursor {
    #[instrument(
        name = "event_collector_gateway::read_next",
        target = "gateway::vijson",
        skip(self),
        level = "debug"
    )]
    async fn read_next(&mut self, max_count: usize) -> Result<Vec<Event>, GatewayError> {
        if self.closed {
            return Err(GatewayError::CursorClosed);
        }
        let collector = self.collector.as_ref().ok_or(GatewayError::CursorClosed)?;

        let page: Value = self
            .endpoint
            .decode(self.authorized(
                self.endpoint
                    .client
                    .post(self.endpoint.moref_url(collector, "ReadNextEvents"))
                    .json(&wire::read_next_body(max_count)),
            ))
            .await?;

        wire::decode_page(page)
    }

    #[instrument(
        name = "event_collector_gateway::close",
        target = "gateway::vijson",
        skip(self),
        level = "debug"
    )]
    async fn close(&mut self) -> Result<(), GatewayError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;

        if let Some(collector) = self.collector.take() {
            tracing::debug!(collector = %collector.value, "Destroying event history collector");
            let destroy = self.authorized(
                self.endpoint
                    .client
                    .post(self.endpoint.moref_url(&collector, "DestroyCollector")),
            );
            if let Err(e) = self.endpoint.send(destroy).await {
                tracing::warn!(error = %e, "Failed to destroy event history collector");
                first_error = Some(e);
            }
        }

        tracing::debug!("Logging out of vCenter session");
        let logout = self.authorized(
            self.endpoint
                .client
                .post(self.endpoint.moref_url(&self.session_manager, "Logout")),
        );
        if let Err(e) = self.endpoint.send(logout).await {
            tracing::warn!(error = %e, "Failed to log out of vCenter session");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Shared HTTP plumbing for the gateway and its cursors.
#[derive(Debug, Clone)]
struct Endpoint {
    client: Client,
    base_url: String,
    release: String,
}

impl Endpoint {
    fn url(&self, kind: &str, id: &str, method: &str) -> String {
        format!(
            "{}/sdk/vim25/{}/{}/{}/{}",
            self.base_url, self.release, kind, id, method
        )
    }

    fn moref_url(&self, moref: &ManagedObjectReference, method: &str) -> String {
        self.url(&moref.kind, &moref.value, method)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Connection(format!("{}: {e}", self.base_url)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = wire::classify_failure(status, &body);
        tracing::debug!(http_status = %status, error = %error, "vCenter call failed");
        Err(error)
    }

    async fn decode<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        let response = self.send(request).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Connection(format!("{}: {e}", self.base_url)))?;
        if body.is_empty() {
            return serde_json::from_value(Value::Null)
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()));
        }
        serde_json::from_slice(&body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}
