use std::future::Future;
use std::time::Duration;

use chrono::Utc;

use crate::auth::{
    DecodedAuthData, IdentityBackend, LinkedAccountProfile, UserRecord, UserRecordStore,
};

pub const DEFAULT_EXCHANGE_TIMEOUT_MS: u64 = 8_000;
pub const MESSAGE_INCOMPLETE: &str = "Authorization data incomplete.";
pub const MESSAGE_FAILED: &str = "Authorization failed, try again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Adopting,
    Authenticated(UserRecord),
}

impl AuthState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Adopting => "adopting",
            Self::Authenticated(_) => "authenticated",
        }
    }

    #[must_use]
    pub fn user(&self) -> Option<&UserRecord> {
        match self {
            Self::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptionStep {
    CredentialExchange,
    ProfileFetch,
    LinkedAccountLogin,
}

impl AdoptionStep {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredentialExchange => "credential_exchange",
            Self::ProfileFetch => "profile_fetch",
            Self::LinkedAccountLogin => "linked_account_login",
        }
    }
}

impl std::fmt::Display for AdoptionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdoptionError {
    #[error("auth payload carries neither an access credential nor a linked account id")]
    IncompletePayload,
    #[error("{step} failed: {message}")]
    ExchangeFailed { step: AdoptionStep, message: String },
    #[error("{step} timed out after {timeout_ms}ms")]
    ExchangeTimedOut { step: AdoptionStep, timeout_ms: u64 },
    #[error("adopted user could not be persisted: {message}")]
    Persist { message: String },
}

impl AdoptionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::IncompletePayload => "incomplete_payload",
            Self::ExchangeFailed { .. } => "exchange_failed",
            Self::ExchangeTimedOut { .. } => "exchange_timed_out",
            Self::Persist { .. } => "persist_failed",
        }
    }

    /// Status-line text shown to the user once the fallback chain is spent.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::IncompletePayload => MESSAGE_INCOMPLETE,
            _ => MESSAGE_FAILED,
        }
    }
}

/// Turns decoded deep-link data into an authenticated session.
///
/// The credential path is tried first; when it fails and the payload also
/// names a linked account, the linked-account login is used instead. Nothing
/// is persisted unless a full user record was produced, and a failed attempt
/// leaves the previous auth state in place.
pub struct SessionAdoption<B, S> {
    backend: B,
    store: S,
    exchange_timeout: Duration,
    state: AuthState,
}

impl<B, S> SessionAdoption<B, S>
where
    B: IdentityBackend,
    S: UserRecordStore,
{
    pub fn new(backend: B, store: S) -> Self {
        Self {
            backend,
            store,
            exchange_timeout: Duration::from_millis(DEFAULT_EXCHANGE_TIMEOUT_MS),
            state: AuthState::Unauthenticated,
        }
    }

    #[must_use]
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    #[must_use]
    pub fn state(&self) -> &AuthState {
        &self.state
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads a previously adopted user. A record that cannot be read is
    /// cleared so the next launch starts clean.
    pub fn restore_saved_session(&mut self) -> &AuthState {
        match self.store.load_user() {
            Ok(Some(user)) => {
                tracing::info!(user_id = %user.id, "restored saved session");
                self.state = AuthState::Authenticated(user);
            }
            Ok(None) => {
                self.state = AuthState::Unauthenticated;
            }
            Err(error) => {
                tracing::warn!(error = %error, "saved session unreadable, clearing");
                if let Err(clear_error) = self.store.clear_user() {
                    tracing::warn!(error = %clear_error, "failed to clear unreadable session");
                }
                self.state = AuthState::Unauthenticated;
            }
        }
        &self.state
    }

    pub fn sign_out(&mut self) -> Result<(), S::Error> {
        self.state = AuthState::Unauthenticated;
        self.store.clear_user()
    }

    pub async fn adopt(&mut self, data: &DecodedAuthData) -> Result<UserRecord, AdoptionError> {
        if !data.is_complete() {
            tracing::warn!("auth payload rejected as incomplete");
            return Err(AdoptionError::IncompletePayload);
        }

        let previous = std::mem::replace(&mut self.state, AuthState::Adopting);
        let resolved = self.resolve_user(data).await;
        let user = match resolved {
            Ok(user) => user,
            Err(error) => {
                tracing::warn!(code = error.code(), error = %error, "session adoption failed");
                self.state = previous;
                return Err(error);
            }
        };

        if let Err(error) = self.store.persist_user(&user) {
            tracing::warn!(error = %error, "failed to persist adopted user");
            self.state = previous;
            return Err(AdoptionError::Persist {
                message: error.to_string(),
            });
        }

        tracing::info!(
            user_id = %user.id,
            linked_account_id = ?user.linked_account_id,
            "session adopted"
        );
        self.state = AuthState::Authenticated(user.clone());
        Ok(user)
    }

    async fn resolve_user(&self, data: &DecodedAuthData) -> Result<UserRecord, AdoptionError> {
        let linked_account_id = data.linked_account_id();

        if let Some(access_credential) = data.access_credential() {
            match self
                .exchange_and_fetch(access_credential, data.session.refresh_credential())
                .await
            {
                Ok(user) => return Ok(user.with_link_fallback(&data.user)),
                Err(error) if linked_account_id.is_some() => {
                    tracing::info!(
                        error = %error,
                        "credential exchange failed, falling back to linked account login"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        let Some(linked_account_id) = linked_account_id else {
            return Err(AdoptionError::IncompletePayload);
        };
        let profile = LinkedAccountProfile::from_link_user(linked_account_id, &data.user);
        let row = self
            .bounded(
                AdoptionStep::LinkedAccountLogin,
                self.backend.linked_account_login(&profile),
            )
            .await?;
        Ok(UserRecord::from_profile(row, Utc::now()).with_link_fallback(&data.user))
    }

    async fn exchange_and_fetch(
        &self,
        access_credential: &str,
        refresh_credential: Option<&str>,
    ) -> Result<UserRecord, AdoptionError> {
        let session = self
            .bounded(
                AdoptionStep::CredentialExchange,
                self.backend
                    .exchange_credential(access_credential, refresh_credential),
            )
            .await?;
        let row = self
            .bounded(
                AdoptionStep::ProfileFetch,
                self.backend.fetch_profile(&session),
            )
            .await?;
        Ok(UserRecord::from_profile(row, Utc::now()))
    }

    async fn bounded<T, E, F>(&self, step: AdoptionStep, call: F) -> Result<T, AdoptionError>
    where
        E: std::fmt::Display,
        F: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.exchange_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(AdoptionError::ExchangeFailed {
                step,
                message: error.to_string(),
            }),
            Err(_) => Err(AdoptionError::ExchangeTimedOut {
                step,
                timeout_ms: self.exchange_timeout.as_millis() as u64,
            }),
        }
    }
}
