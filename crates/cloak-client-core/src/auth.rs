use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_AUTH_BASE_URL: &str = "http://127.0.0.1:54321";
pub const ENV_AUTH_BASE_URL: &str = "CLOAK_AUTH_BASE_URL";
pub const ENV_AUTH_BASE_URL_LEGACY: &str = "VITE_SUPABASE_URL";
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3000";
pub const ENV_API_BASE_URL: &str = "CLOAK_API_BASE_URL";
pub const ENV_API_BASE_URL_LEGACY: &str = "VITE_API_URL";
pub const BASE_URL_SOURCE_DEFAULT: &str = "default_local";

pub const LINKED_ACCOUNT_EMAIL_DOMAIN: &str = "cloakvpn.local";
pub const FALLBACK_FIRST_NAME: &str = "User";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthInputError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
}

/// Payload carried by an `auth` deep link once its `data` parameter has been
/// percent-decoded and parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedAuthData {
    pub user: LinkedUserFields,
    pub session: LinkSessionFields,
}

impl DecodedAuthData {
    #[must_use]
    pub fn access_credential(&self) -> Option<&str> {
        self.session.access_credential()
    }

    #[must_use]
    pub fn linked_account_id(&self) -> Option<i64> {
        self.user.linked_account_id
    }

    /// True when the payload carries enough to attempt any adoption path.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.access_credential().is_some() || self.linked_account_id().is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedUserFields {
    #[serde(
        default,
        deserialize_with = "deserialize_lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(
        default,
        alias = "telegram_id",
        alias = "linked_account_id",
        deserialize_with = "deserialize_linked_account_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub linked_account_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(
        default,
        alias = "telegram_username",
        skip_serializing_if = "Option::is_none"
    )]
    pub username: Option<String>,
    #[serde(default, alias = "photo_url", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSessionFields {
    #[serde(
        default,
        alias = "access_token",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_credential: Option<String>,
    #[serde(
        default,
        alias = "refresh_token",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_credential: Option<String>,
}

impl LinkSessionFields {
    #[must_use]
    pub fn access_credential(&self) -> Option<&str> {
        non_empty(self.access_credential.as_deref())
    }

    #[must_use]
    pub fn refresh_credential(&self) -> Option<&str> {
        non_empty(self.refresh_credential.as_deref())
    }
}

/// Live session returned by the identity service after a credential exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSession {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Row shape of the hosted `users` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfileRow {
    #[serde(deserialize_with = "deserialize_required_lenient_string")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subscription_plan: Option<String>,
    #[serde(default)]
    pub subscription_expires_at: Option<String>,
    #[serde(default)]
    pub subscription_is_active: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_linked_account_id")]
    pub telegram_id: Option<i64>,
    #[serde(default)]
    pub telegram_username: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Profile fields sent with a linked-account (Telegram) login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedAccountProfile {
    pub id: i64,
    pub first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl LinkedAccountProfile {
    /// Splits the display name into first and last name the way the bot
    /// callback expects: first word, then the remainder.
    #[must_use]
    pub fn from_link_user(linked_account_id: i64, user: &LinkedUserFields) -> Self {
        let mut words = user
            .name
            .as_deref()
            .unwrap_or_default()
            .split_whitespace();
        let first_name = words
            .next()
            .map_or_else(|| FALLBACK_FIRST_NAME.to_string(), str::to_string);
        let last_name = words.collect::<Vec<_>>().join(" ");
        Self {
            id: linked_account_id,
            first_name,
            last_name: (!last_name.is_empty()).then_some(last_name),
            username: non_empty(user.username.as_deref()).map(str::to_string),
            photo_url: non_empty(user.photo_url.as_deref()).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    #[default]
    Free,
    Premium,
    Yearly,
    Family,
}

impl SubscriptionPlan {
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("premium") => Self::Premium,
            Some("yearly") => Self::Yearly,
            Some("family") => Self::Family,
            _ => Self::Free,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::Yearly => "yearly",
            Self::Family => "family",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub plan: SubscriptionPlan,
    #[serde(default)]
    pub expires_at: Option<String>,
    pub is_active: bool,
}

/// Application-facing user persisted after a successful adoption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: String,
    pub subscription: Subscription,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_account_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_username: Option<String>,
}

impl UserRecord {
    #[must_use]
    pub fn from_profile(row: UserProfileRow, now: DateTime<Utc>) -> Self {
        let email = match non_empty(row.email.as_deref()) {
            Some(email) => email.to_string(),
            None => row
                .telegram_id
                .map(linked_account_email)
                .unwrap_or_default(),
        };
        let name = non_empty(row.name.as_deref())
            .map(str::to_string)
            .or_else(|| email.split('@').next().map(str::to_string))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| FALLBACK_FIRST_NAME.to_string());
        Self {
            id: row.id,
            email,
            name,
            subscription: Subscription {
                plan: SubscriptionPlan::parse(row.subscription_plan.as_deref()),
                expires_at: row.subscription_expires_at,
                is_active: row.subscription_is_active != Some(false),
            },
            created_at: non_empty(row.created_at.as_deref())
                .map_or_else(|| now.to_rfc3339(), str::to_string),
            linked_account_id: row.telegram_id,
            linked_username: row.telegram_username,
        }
    }

    /// Fills linked-account fields the profile row did not carry.
    #[must_use]
    pub fn with_link_fallback(mut self, user: &LinkedUserFields) -> Self {
        if self.linked_account_id.is_none() {
            self.linked_account_id = user.linked_account_id;
        }
        if self.linked_username.is_none() {
            self.linked_username = non_empty(user.username.as_deref()).map(str::to_string);
        }
        if self.email.is_empty() {
            if let Some(email) = non_empty(user.email.as_deref()) {
                self.email = email.to_string();
            } else if let Some(linked) = self.linked_account_id {
                self.email = linked_account_email(linked);
            }
        }
        self
    }
}

#[must_use]
pub fn linked_account_email(linked_account_id: i64) -> String {
    format!("telegram_{linked_account_id}@{LINKED_ACCOUNT_EMAIL_DOMAIN}")
}

pub trait UserRecordStore {
    type Error: std::fmt::Display;

    fn load_user(&self) -> Result<Option<UserRecord>, Self::Error>;
    fn persist_user(&self, user: &UserRecord) -> Result<(), Self::Error>;
    fn clear_user(&self) -> Result<(), Self::Error>;
}

/// Hosted identity service: credential exchange, profile lookup and the
/// linked-account login used as fallback.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    type Error: std::fmt::Display + Send;

    async fn exchange_credential(
        &self,
        access_credential: &str,
        refresh_credential: Option<&str>,
    ) -> Result<BackendSession, Self::Error>;
    async fn fetch_profile(&self, session: &BackendSession)
    -> Result<UserProfileRow, Self::Error>;
    async fn linked_account_login(
        &self,
        profile: &LinkedAccountProfile,
    ) -> Result<UserProfileRow, Self::Error>;
}

pub fn resolve_auth_base_url() -> Result<(String, &'static str), AuthInputError> {
    resolve_base_url(
        ENV_AUTH_BASE_URL,
        ENV_AUTH_BASE_URL_LEGACY,
        DEFAULT_AUTH_BASE_URL,
    )
}

pub fn resolve_api_base_url() -> Result<(String, &'static str), AuthInputError> {
    resolve_base_url(
        ENV_API_BASE_URL,
        ENV_API_BASE_URL_LEGACY,
        DEFAULT_API_BASE_URL,
    )
}

fn resolve_base_url(
    primary: &'static str,
    legacy: &'static str,
    default: &str,
) -> Result<(String, &'static str), AuthInputError> {
    if let Some(base_url) = env_non_empty(primary) {
        return normalize_base_url(&base_url).map(|normalized| (normalized, primary));
    }
    if let Some(base_url) = env_non_empty(legacy) {
        return normalize_base_url(&base_url).map(|normalized| (normalized, legacy));
    }
    normalize_base_url(default).map(|normalized| (normalized, BASE_URL_SOURCE_DEFAULT))
}

pub fn normalize_base_url(raw: &str) -> Result<String, AuthInputError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(AuthInputError::EmptyBaseUrl);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(AuthInputError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(AuthInputError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(AuthInputError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

pub fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn deserialize_linked_account_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(number)) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| D::Error::custom("linked account id must be an integer")),
        Some(serde_json::Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i64>()
                .map(Some)
                .map_err(|_| D::Error::custom("linked account id must be numeric"))
        }
        Some(_) => Err(D::Error::custom(
            "linked account id must be a number or string",
        )),
    }
}

fn deserialize_lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(raw)) => Ok(non_empty(Some(&raw)).map(str::to_string)),
        Some(serde_json::Value::Number(number)) => Ok(Some(number.to_string())),
        Some(_) => Err(D::Error::custom("identifier must be a string or number")),
    }
}

fn deserialize_required_lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_lenient_string(deserializer)?
        .ok_or_else(|| D::Error::custom("identifier must not be empty"))
}
