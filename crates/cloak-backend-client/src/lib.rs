use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cloak_client_core::auth::{
    BackendSession, IdentityBackend, LinkedAccountProfile, UserProfileRow,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;
const API_KEY_HEADER: &str = "apikey";
const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct IdentityClientConfig {
    pub auth_base_url: String,
    pub api_base_url: String,
    pub anon_key: Option<String>,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl IdentityClientConfig {
    #[must_use]
    pub fn new(auth_base_url: impl Into<String>, api_base_url: impl Into<String>) -> Self {
        Self {
            auth_base_url: auth_base_url.into(),
            api_base_url: api_base_url.into(),
            anon_key: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

/// Client for the hosted auth/REST service and the bot-facing API server.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    auth_base_url: String,
    api_base_url: String,
    anon_key: Option<String>,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum BackendClientError {
    #[error("identity_client_base_url_missing")]
    BaseUrlMissing,
    #[error("identity_client_invalid_path")]
    InvalidPath,
    #[error("identity_request_failed:{message}")]
    Request { message: String },
    #[error("identity_read_failed:{message}")]
    Read { message: String },
    #[error("identity_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("identity_json_decode_failed:{message}")]
    Decode { message: String },
    #[error("identity_profile_not_found:{user_id}")]
    ProfileNotFound { user_id: String },
    #[error("identity_linked_login_rejected:{message}")]
    LinkedLoginRejected { message: String },
}

#[derive(Debug, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user: IdentityUser,
}

#[derive(Debug, Serialize)]
struct RefreshTokenRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
pub struct LinkedAccountLoginRequest<'a> {
    #[serde(flatten)]
    pub profile: &'a LinkedAccountProfile,
    pub auth_date: i64,
}

#[derive(Debug, Deserialize)]
pub struct LinkedAccountLoginResponse {
    #[serde(default)]
    pub user: Option<UserProfileRow>,
    #[serde(default)]
    pub error: Option<String>,
}

impl IdentityClient {
    pub fn new(config: IdentityClientConfig) -> Result<Self, BackendClientError> {
        Ok(Self {
            auth_base_url: normalize_base_url(&config.auth_base_url)?,
            api_base_url: normalize_base_url(&config.api_base_url)?,
            anon_key: config
                .anon_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn auth_endpoint(&self, path: &str) -> Option<String> {
        join_endpoint(&self.auth_base_url, path)
    }

    #[must_use]
    pub fn api_endpoint(&self, path: &str) -> Option<String> {
        join_endpoint(&self.api_base_url, path)
    }

    #[must_use]
    pub fn user_path() -> &'static str {
        "/auth/v1/user"
    }

    #[must_use]
    pub fn refresh_token_path() -> &'static str {
        "/auth/v1/token?grant_type=refresh_token"
    }

    #[must_use]
    pub fn profile_path(user_id: &str) -> String {
        format!("/rest/v1/users?id=eq.{}&select=*", user_id.trim())
    }

    #[must_use]
    pub fn linked_account_login_path() -> &'static str {
        "/api/telegram/auth"
    }

    /// Validates an access credential. A 401 with a refresh credential on
    /// hand is retried once through the refresh-token grant.
    pub async fn exchange_credential(
        &self,
        access_credential: &str,
        refresh_credential: Option<&str>,
    ) -> Result<BackendSession, BackendClientError> {
        let url = self
            .auth_endpoint(Self::user_path())
            .ok_or(BackendClientError::InvalidPath)?;
        let response = self
            .send_with_attempts(|| self.authorize(self.http.get(url.as_str()), Some(access_credential)))
            .await?;

        let refresh_credential = refresh_credential
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if response.status() == StatusCode::UNAUTHORIZED
            && let Some(refresh_credential) = refresh_credential
        {
            tracing::info!("access credential rejected, refreshing session");
            return self.refresh_session(refresh_credential).await;
        }

        let user = decode_json_response::<IdentityUser>(response).await?;
        Ok(BackendSession {
            access_token: access_credential.to_string(),
            refresh_token: refresh_credential.map(str::to_string),
            user_id: user.id,
            email: user.email,
        })
    }

    pub async fn refresh_session(
        &self,
        refresh_credential: &str,
    ) -> Result<BackendSession, BackendClientError> {
        let url = self
            .auth_endpoint(Self::refresh_token_path())
            .ok_or(BackendClientError::InvalidPath)?;
        let body = RefreshTokenRequest {
            refresh_token: refresh_credential,
        };
        let response = self
            .send_with_attempts(|| self.authorize(self.http.post(url.as_str()), None).json(&body))
            .await?;
        let refreshed = decode_json_response::<RefreshTokenResponse>(response).await?;
        Ok(BackendSession {
            access_token: refreshed.access_token,
            refresh_token: refreshed
                .refresh_token
                .or_else(|| Some(refresh_credential.to_string())),
            user_id: refreshed.user.id,
            email: refreshed.user.email,
        })
    }

    pub async fn fetch_profile(
        &self,
        session: &BackendSession,
    ) -> Result<UserProfileRow, BackendClientError> {
        let url = self
            .auth_endpoint(Self::profile_path(&session.user_id).as_str())
            .ok_or(BackendClientError::InvalidPath)?;
        let response = self
            .send_with_attempts(|| {
                self.authorize(
                    self.http.get(url.as_str()),
                    Some(session.access_token.as_str()),
                )
            })
            .await?;
        decode_json_response::<Vec<UserProfileRow>>(response)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendClientError::ProfileNotFound {
                user_id: session.user_id.clone(),
            })
    }

    /// Find-or-create login by linked Telegram account. Account creation is
    /// owned by the API server, so replays resolve to the same user.
    pub async fn linked_account_login(
        &self,
        profile: &LinkedAccountProfile,
    ) -> Result<UserProfileRow, BackendClientError> {
        let url = self
            .api_endpoint(Self::linked_account_login_path())
            .ok_or(BackendClientError::InvalidPath)?;
        let body = LinkedAccountLoginRequest {
            profile,
            auth_date: Utc::now().timestamp(),
        };
        let response = self
            .send_with_attempts(|| self.http.post(url.as_str()).json(&body))
            .await?;
        let decoded = decode_json_response::<LinkedAccountLoginResponse>(response).await?;
        decoded
            .user
            .ok_or_else(|| BackendClientError::LinkedLoginRejected {
                message: decoded
                    .error
                    .unwrap_or_else(|| "response carried no user".to_string()),
            })
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        bearer: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let request = match self.anon_key.as_deref() {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        };
        match bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_with_attempts<F>(&self, build: F) -> Result<reqwest::Response, BackendClientError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let request = build()
                .header(REQUEST_ID_HEADER, format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout);

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::debug!(attempt, error = %error, "identity request failed");
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(BackendClientError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[async_trait]
impl IdentityBackend for IdentityClient {
    type Error = BackendClientError;

    async fn exchange_credential(
        &self,
        access_credential: &str,
        refresh_credential: Option<&str>,
    ) -> Result<BackendSession, BackendClientError> {
        IdentityClient::exchange_credential(self, access_credential, refresh_credential).await
    }

    async fn fetch_profile(
        &self,
        session: &BackendSession,
    ) -> Result<UserProfileRow, BackendClientError> {
        IdentityClient::fetch_profile(self, session).await
    }

    async fn linked_account_login(
        &self,
        profile: &LinkedAccountProfile,
    ) -> Result<UserProfileRow, BackendClientError> {
        IdentityClient::linked_account_login(self, profile).await
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> BackendClientError {
    let body = non_empty_string(String::from_utf8_lossy(body).to_string())
        .unwrap_or_else(|| "<empty>".to_string());
    BackendClientError::Http { status, body }
}

fn normalize_base_url(base_url: &str) -> Result<String, BackendClientError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(BackendClientError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

fn join_endpoint(base_url: &str, path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(format!("{base_url}{trimmed}"))
    } else {
        Some(format!("{base_url}/{trimmed}"))
    }
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, BackendClientError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| BackendClientError::Read {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| BackendClientError::Decode {
        message: error.to_string(),
    })
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
