use cloak_client_core::adoption::{AuthState, SessionAdoption};
use cloak_client_core::auth::IdentityBackend;
use cloak_client_core::deep_link::parse_auth_data;
use tokio::sync::mpsc;

use crate::relay::{RelayEndpoint, RelayMessage};
use crate::shell_open::{ExternalOpener, OpenError, telegram_bot_url};
use crate::user_store::DesktopStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Login,
    TelegramAuth,
    Home,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::TelegramAuth => "telegram_auth",
            Self::Home => "home",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Info,
    Success,
    Error,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub kind: StatusKind,
    pub text: String,
}

impl StatusLine {
    fn new(kind: StatusKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewCommand {
    BeginTelegramLogin,
    Logout,
}

/// Display-side consumer of relayed links. Owns session adoption, the
/// status line and the current route.
pub struct AuthView<B, O> {
    adoption: SessionAdoption<B, DesktopStore>,
    opener: O,
    telegram_bot: String,
    route: Route,
    status: Option<StatusLine>,
}

impl<B, O> AuthView<B, O>
where
    B: IdentityBackend,
    O: ExternalOpener,
{
    pub fn new(
        adoption: SessionAdoption<B, DesktopStore>,
        opener: O,
        telegram_bot: impl Into<String>,
    ) -> Self {
        Self {
            adoption,
            opener,
            telegram_bot: telegram_bot.into(),
            route: Route::Login,
            status: None,
        }
    }

    #[must_use]
    pub fn route(&self) -> Route {
        self.route
    }

    #[must_use]
    pub fn status(&self) -> Option<&StatusLine> {
        self.status.as_ref()
    }

    #[must_use]
    pub fn auth_state(&self) -> &AuthState {
        self.adoption.state()
    }

    /// Restores a saved session, then adopts a link persisted at the last
    /// shutdown, if any.
    pub async fn start(&mut self) {
        if self.adoption.restore_saved_session().is_authenticated() {
            self.route = Route::Home;
        }
        match self.adoption.store().take_pending_auth() {
            Ok(Some(raw_data)) => {
                tracing::info!("adopting deep link saved at last shutdown");
                self.adopt_raw(&raw_data).await;
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(error = %error, "failed to read saved deep link");
            }
        }
    }

    pub async fn handle_message(&mut self, message: &RelayMessage) {
        match message {
            RelayMessage::DeepLinkAuth {
                delivery_id,
                raw_data,
            } => {
                tracing::debug!(
                    channel = message.channel(),
                    delivery_id,
                    "deep link arrived at auth view"
                );
                self.adopt_raw(raw_data).await;
            }
        }
    }

    async fn adopt_raw(&mut self, raw_data: &str) {
        let data = match parse_auth_data(raw_data) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(code = error.code(), error = %error, "dropping undecodable auth payload");
                return;
            }
        };

        match self.adoption.adopt(&data).await {
            Ok(user) => {
                self.route = Route::Home;
                self.status = Some(StatusLine::new(
                    StatusKind::Success,
                    format!("Signed in as {}.", user.name),
                ));
            }
            Err(error) => {
                self.status = Some(StatusLine::new(StatusKind::Error, error.user_message()));
                if !self.adoption.state().is_authenticated() {
                    self.route = Route::Login;
                }
            }
        }
    }

    pub fn begin_telegram_login(&mut self) -> Result<(), OpenError> {
        let url = telegram_bot_url(&self.telegram_bot);
        match self.opener.open(&url) {
            Ok(()) => {
                self.route = Route::TelegramAuth;
                self.status = Some(StatusLine::new(
                    StatusKind::Info,
                    format!(
                        "Open the Telegram bot (@{}), tap Sign in, then Open Cloak VPN. \
                         Return to the app afterwards and sign-in completes automatically.",
                        self.telegram_bot.trim().trim_start_matches('@')
                    ),
                ));
                Ok(())
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to open telegram bot");
                self.status = Some(StatusLine::new(
                    StatusKind::Error,
                    "Could not open Telegram. Try again.",
                ));
                Err(error)
            }
        }
    }

    pub fn logout(&mut self) {
        if let Err(error) = self.adoption.sign_out() {
            tracing::warn!(error = %error, "failed to clear saved session");
        }
        self.route = Route::Login;
        self.status = None;
    }

    fn handle_command(&mut self, command: ViewCommand) {
        match command {
            ViewCommand::BeginTelegramLogin => {
                let _ = self.begin_telegram_login();
            }
            ViewCommand::Logout => self.logout(),
        }
    }

    /// Signals readiness once started and processes links in arrival order
    /// until the relay closes. Deliveries are acknowledged by the relay
    /// intake as they arrive, so links queued behind a slow adoption are
    /// not mistaken for lost ones.
    pub async fn run(
        mut self,
        endpoint: RelayEndpoint,
        mut commands: mpsc::UnboundedReceiver<ViewCommand>,
    ) -> Self {
        self.start().await;
        endpoint.signal_ready();
        let mut messages = endpoint.spawn_intake();

        loop {
            tokio::select! {
                message = messages.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    self.handle_message(&message).await;
                }
                Some(command) = commands.recv() => self.handle_command(command),
            }
        }
        tracing::debug!(route = self.route.as_str(), "auth view stopped");
        self
    }
}
