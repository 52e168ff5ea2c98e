//! HTTP client for an XRPC protocol service.
//!
//! Queries are `GET /xrpc/<nsid>?params`, procedures are `POST /xrpc/<nsid>`
//! with a JSON body. Session management uses the `com.atproto.server.*`
//! procedures. Retries and credential rotation live in the request pipeline;
//! this client performs exactly one HTTP exchange per call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{CallError, Operation, OperationKind, RemoteService};
use crate::auth::{Did, SessionTokens};

const CREATE_SESSION: &str = "com.atproto.server.createSession";
const REFRESH_SESSION: &str = "com.atproto.server.refreshSession";
const DELETE_SESSION: &str = "com.atproto.server.deleteSession";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    refresh_jwt: String,
    handle: String,
    did: String,
    #[serde(default)]
    email: Option<String>,
}

impl From<SessionResponse> for SessionTokens {
    fn from(r: SessionResponse) -> Self {
        SessionTokens {
            did: Did::new(r.did),
            handle: r.handle,
            email: r.email,
            access_token: r.access_jwt,
            refresh_token: r.refresh_jwt,
            expires_at: None,
        }
    }
}

/// XRPC client. Clone is cheap - reqwest::Client uses Arc internally for
/// connection pooling.
#[derive(Clone)]
pub struct XrpcService {
    client: Client,
    base_url: String,
}

impl XrpcService {
    pub fn new(base_url: &str) -> Result<Self, CallError> {
        Self::with_timeout(base_url, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, CallError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::Rejected {
                error: "ClientInit".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, nsid: &str) -> String {
        format!("{}/xrpc/{}", self.base_url, nsid)
    }

    fn auth_headers(token: Option<&str>) -> Result<header::HeaderMap, CallError> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token)).map_err(
                |e| CallError::Rejected {
                    error: "InvalidToken".to_string(),
                    message: e.to_string(),
                },
            )?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning a classified error with
    /// the body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, CallError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CallError::from_status(status, &body))
        }
    }

    /// Parse a body that may legitimately be empty (procedures without output).
    async fn read_json(response: reqwest::Response) -> Result<Value, CallError> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| CallError::Rejected {
            error: "InvalidResponse".to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl RemoteService for XrpcService {
    async fn create_session(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<SessionTokens, CallError> {
        let response = self
            .client
            .post(self.url(CREATE_SESSION))
            .json(&serde_json::json!({ "identifier": identifier, "password": secret }))
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        let session: SessionResponse = response.json().await?;
        debug!(did = %session.did, "Session created");
        Ok(session.into())
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionTokens, CallError> {
        let response = self
            .client
            .post(self.url(REFRESH_SESSION))
            .headers(Self::auth_headers(Some(refresh_token))?)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        let session: SessionResponse = response.json().await?;
        Ok(session.into())
    }

    async fn delete_session(&self, refresh_token: &str) -> Result<(), CallError> {
        let response = self
            .client
            .post(self.url(DELETE_SESSION))
            .headers(Self::auth_headers(Some(refresh_token))?)
            .send()
            .await?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn call(
        &self,
        operation: &Operation,
        access_token: Option<&str>,
    ) -> Result<Value, CallError> {
        let url = self.url(&operation.nsid);
        let headers = Self::auth_headers(access_token)?;
        let request = match operation.kind {
            OperationKind::Query => self.client.get(&url).query(&operation.params),
            OperationKind::Procedure => {
                let request = self.client.post(&url).query(&operation.params);
                match operation.body {
                    Some(ref body) => request.json(body),
                    None => request,
                }
            }
        };

        let response = request.headers(headers).send().await?;
        let response = Self::check_response(response).await?;
        Self::read_json(response).await
    }

    fn service_url(&self) -> &str {
        &self.base_url
    }
}
