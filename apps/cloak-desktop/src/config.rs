use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use clap::error::ErrorKind;
use cloak_backend_client::{DEFAULT_REQUEST_ATTEMPTS, DEFAULT_TIMEOUT_MS, IdentityClientConfig};
use cloak_client_core::adoption::DEFAULT_EXCHANGE_TIMEOUT_MS;
use cloak_client_core::auth::{
    AuthInputError, BASE_URL_SOURCE_DEFAULT, env_non_empty, resolve_api_base_url,
    resolve_auth_base_url,
};
use cloak_client_core::deep_link::DEFAULT_DEEP_LINK_SCHEME;
use thiserror::Error;

use crate::instance_lock::{DEFAULT_FORWARD_TIMEOUT_MS, DEFAULT_INSTANCE_ADDR, default_key_path};
use crate::link_context::{DEFAULT_READY_TIMEOUT_MS, LinkContextConfig};
use crate::relay::DEFAULT_ACK_TIMEOUT_MS;
use crate::shell_open::DEFAULT_TELEGRAM_BOT;
use crate::user_store::app_data_dir;

pub const ENV_ANON_KEY: &str = "CLOAK_ANON_KEY";
pub const ENV_ANON_KEY_LEGACY: &str = "VITE_SUPABASE_ANON_KEY";
pub const ENV_TELEGRAM_BOT: &str = "CLOAK_TELEGRAM_BOT";
pub const ENV_TELEGRAM_BOT_LEGACY: &str = "VITE_TELEGRAM_BOT_USERNAME";
pub const ENV_DEEP_LINK_SCHEME: &str = "CLOAK_DEEP_LINK_SCHEME";
pub const ENV_INSTANCE_ADDR: &str = "CLOAK_INSTANCE_ADDR";
pub const SOURCE_CLI: &str = "cli";

#[derive(Parser, Debug, Default)]
#[command(name = "cloak-desktop", about = "Cloak VPN desktop shell")]
pub struct Args {
    /// Custom URL scheme this install is registered for.
    #[arg(long)]
    pub scheme: Option<String>,

    /// Loopback address used as the single-instance lock.
    #[arg(long)]
    pub instance_addr: Option<String>,

    /// Open the Telegram bot for sign-in right after start.
    #[arg(long)]
    pub telegram_login: bool,

    /// Forget the saved session on start.
    #[arg(long)]
    pub sign_out: bool,

    /// Override for the local store file.
    #[arg(long)]
    pub store_path: Option<PathBuf>,

    /// Remaining arguments; the OS passes deep links here.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub links: Vec<String>,
}

#[derive(Debug)]
pub enum ParsedArgs {
    Run(Args),
    /// Help was requested; print it and stop.
    Exit(clap::Error),
}

/// Parses argv without ever aborting the launch on a bad flag: the OS may
/// append arguments we do not know, and the deep link in argv must still
/// reach the instance hand-off. Only help requests end the run here.
pub fn parse_args<I, T>(argv: I) -> ParsedArgs
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Args::try_parse_from(argv) {
        Ok(args) => ParsedArgs::Run(args),
        Err(error) if matches!(error.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            ParsedArgs::Exit(error)
        }
        Err(error) => {
            tracing::warn!(kind = ?error.kind(), "unrecognised arguments, continuing with defaults");
            ParsedArgs::Run(Args::default())
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    BaseUrl(#[from] AuthInputError),
    #[error("invalid deep link scheme: {value}")]
    InvalidScheme { value: String },
    #[error("invalid instance address {value}: {message}")]
    InvalidInstanceAddr { value: String, message: String },
    #[error("instance address must be loopback: {addr}")]
    NonLoopbackInstanceAddr { addr: SocketAddr },
}

#[derive(Debug, Clone)]
pub struct DesktopConfig {
    pub scheme: String,
    pub scheme_source: &'static str,
    pub instance_addr: SocketAddr,
    pub instance_addr_source: &'static str,
    pub auth_base_url: String,
    pub auth_base_url_source: &'static str,
    pub api_base_url: String,
    pub api_base_url_source: &'static str,
    pub anon_key: Option<String>,
    pub telegram_bot: String,
    pub store_path: Option<PathBuf>,
    pub instance_key_path: PathBuf,
    pub telegram_login: bool,
    pub sign_out: bool,
    pub ready_timeout: Duration,
    pub ack_timeout: Duration,
    pub exchange_timeout: Duration,
    pub forward_timeout: Duration,
}

impl DesktopConfig {
    /// CLI flags win over environment, environment over built-in defaults.
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let (scheme, scheme_source) = resolve_scheme(args.scheme.as_deref())?;
        let (instance_addr, instance_addr_source) =
            resolve_instance_addr(args.instance_addr.as_deref())?;
        let (auth_base_url, auth_base_url_source) = resolve_auth_base_url()?;
        let (api_base_url, api_base_url_source) = resolve_api_base_url()?;

        Ok(Self {
            scheme,
            scheme_source,
            instance_addr,
            instance_addr_source,
            auth_base_url,
            auth_base_url_source,
            api_base_url,
            api_base_url_source,
            anon_key: env_non_empty(ENV_ANON_KEY).or_else(|| env_non_empty(ENV_ANON_KEY_LEGACY)),
            telegram_bot: env_non_empty(ENV_TELEGRAM_BOT)
                .or_else(|| env_non_empty(ENV_TELEGRAM_BOT_LEGACY))
                .unwrap_or_else(|| DEFAULT_TELEGRAM_BOT.to_string()),
            store_path: args.store_path.clone(),
            instance_key_path: instance_key_path(args.store_path.as_deref()),
            telegram_login: args.telegram_login,
            sign_out: args.sign_out,
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            exchange_timeout: Duration::from_millis(DEFAULT_EXCHANGE_TIMEOUT_MS),
            forward_timeout: Duration::from_millis(DEFAULT_FORWARD_TIMEOUT_MS),
        })
    }

    #[must_use]
    pub fn link_context(&self) -> LinkContextConfig {
        LinkContextConfig {
            scheme: self.scheme.clone(),
            ready_timeout: self.ready_timeout,
        }
    }

    #[must_use]
    pub fn identity_client(&self) -> IdentityClientConfig {
        IdentityClientConfig {
            auth_base_url: self.auth_base_url.clone(),
            api_base_url: self.api_base_url.clone(),
            anon_key: self.anon_key.clone(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

/// The key lives beside the store, so a `--store-path` override moves both.
fn instance_key_path(store_path: Option<&Path>) -> PathBuf {
    let data_dir = store_path
        .and_then(Path::parent)
        .map_or_else(app_data_dir, Path::to_path_buf);
    default_key_path(&data_dir)
}

fn resolve_scheme(cli: Option<&str>) -> Result<(String, &'static str), ConfigError> {
    if let Some(value) = cli {
        return normalize_scheme(value).map(|scheme| (scheme, SOURCE_CLI));
    }
    if let Some(value) = env_non_empty(ENV_DEEP_LINK_SCHEME) {
        return normalize_scheme(&value).map(|scheme| (scheme, ENV_DEEP_LINK_SCHEME));
    }
    Ok((DEFAULT_DEEP_LINK_SCHEME.to_string(), BASE_URL_SOURCE_DEFAULT))
}

/// Lowercases and validates a URL scheme per RFC 3986: a letter followed by
/// letters, digits, `+`, `-` or `.`.
pub fn normalize_scheme(raw: &str) -> Result<String, ConfigError> {
    let scheme = raw.trim().trim_end_matches("://").to_ascii_lowercase();
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'));
    if valid {
        Ok(scheme)
    } else {
        Err(ConfigError::InvalidScheme {
            value: raw.to_string(),
        })
    }
}

fn resolve_instance_addr(cli: Option<&str>) -> Result<(SocketAddr, &'static str), ConfigError> {
    if let Some(value) = cli {
        return parse_instance_addr(value).map(|addr| (addr, SOURCE_CLI));
    }
    if let Some(value) = env_non_empty(ENV_INSTANCE_ADDR) {
        return parse_instance_addr(&value).map(|addr| (addr, ENV_INSTANCE_ADDR));
    }
    parse_instance_addr(DEFAULT_INSTANCE_ADDR).map(|addr| (addr, BASE_URL_SOURCE_DEFAULT))
}

pub fn parse_instance_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    let addr = raw
        .trim()
        .parse::<SocketAddr>()
        .map_err(|error| ConfigError::InvalidInstanceAddr {
            value: raw.to_string(),
            message: error.to_string(),
        })?;
    if !addr.ip().is_loopback() {
        return Err(ConfigError::NonLoopbackInstanceAddr { addr });
    }
    Ok(addr)
}
