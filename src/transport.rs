use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::credentials::{CredentialPair, Credentials, RefreshExchange};
use crate::error::ClientError;
use crate::protocol::{GraphQlRequest, GraphQlResponse};

/// One request-response exchange. The dispatcher's seam; mocked in tests.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn execute(&self, request: &GraphQlRequest) -> Result<Value, ClientError>;
}

pub struct HttpTransport {
    client: Client,
    endpoint: String,
    credentials: Arc<Credentials>,
}

enum ExchangeOutcome {
    Data(Value),
    Unauthorized,
}

impl HttpTransport {
    pub fn new(client: Client, endpoint: String, credentials: Arc<Credentials>) -> Self {
        Self {
            client,
            endpoint,
            credentials,
        }
    }

    async fn exchange_once(
        &self,
        request: &GraphQlRequest,
        access: Option<&str>,
    ) -> Result<ExchangeOutcome, ClientError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(token) = access {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(ExchangeOutcome::Unauthorized);
        }
        let response = response.error_for_status()?;

        let body: GraphQlResponse = response.json().await?;
        if let Some(errors) = body.errors.filter(|errors| !errors.is_empty()) {
            return Err(ClientError::graphql(errors));
        }
        Ok(ExchangeOutcome::Data(body.data.unwrap_or(Value::Null)))
    }
}

#[async_trait]
impl RequestTransport for HttpTransport {
    async fn execute(&self, request: &GraphQlRequest) -> Result<Value, ClientError> {
        if self.credentials.is_expired().await {
            return Err(ClientError::SessionExpired);
        }

        let access = self.credentials.access_token().await;
        match self.exchange_once(request, access.as_deref()).await? {
            ExchangeOutcome::Data(data) => Ok(data),
            ExchangeOutcome::Unauthorized => {
                debug!("exchange rejected as unauthorized, refreshing credentials");
                self.credentials.refresh().await?;

                let access = self.credentials.access_token().await;
                match self.exchange_once(request, access.as_deref()).await? {
                    ExchangeOutcome::Data(data) => Ok(data),
                    ExchangeOutcome::Unauthorized => {
                        // The freshly refreshed credential was rejected too;
                        // retrying further cannot succeed.
                        warn!("refreshed credential rejected, ending session");
                        self.credentials.invalidate().await;
                        Err(ClientError::SessionExpired)
                    }
                }
            }
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
}

/// Production refresh exchange: a dedicated request against the auth
/// endpoint, outside the GraphQL surface.
pub struct HttpRefreshExchange {
    client: Client,
    endpoint: String,
}

impl HttpRefreshExchange {
    pub fn new(client: Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl RefreshExchange for HttpRefreshExchange {
    async fn exchange(&self, refresh_token: &str) -> Result<CredentialPair, ClientError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::SessionExpired);
        }
        let response = response.error_for_status()?;

        let body: RefreshResponse = response.json().await?;
        Ok(CredentialPair {
            access: body.access_token,
            refresh: body.refresh_token,
        })
    }
}
