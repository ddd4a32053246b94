use std::process::Command;

use thiserror::Error;
use url::Url;

pub const DEFAULT_TELEGRAM_BOT: &str = "cloakv_bot";
const TELEGRAM_START_PARAMETER: &str = "app_auth";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("open_url_missing")]
    Missing,
    #[error("open_url_invalid:{message}")]
    Invalid { message: String },
    #[error("open_url_unsupported_scheme:{scheme}")]
    UnsupportedScheme { scheme: String },
    #[error("open_url_launch_failed:{message}")]
    Launch { message: String },
    #[error("open_url_exit_status:{code}")]
    ExitStatus { code: i32 },
}

/// Hands a URL to whatever the desktop uses for web links.
pub trait ExternalOpener: Send {
    fn open(&self, url: &str) -> Result<(), OpenError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemOpener;

impl ExternalOpener for SystemOpener {
    fn open(&self, url: &str) -> Result<(), OpenError> {
        let candidate = validate_external_url(url)?;
        tracing::info!(url = %candidate, "opening external url");

        #[cfg(target_os = "macos")]
        let status = Command::new("open").arg(candidate).status();
        #[cfg(target_os = "windows")]
        let status = Command::new("cmd")
            .arg("/C")
            .arg("start")
            .arg("")
            .arg(candidate)
            .status();
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let status = Command::new("xdg-open").arg(candidate).status();

        let status = status.map_err(|error| OpenError::Launch {
            message: error.to_string(),
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(OpenError::ExitStatus {
                code: status.code().unwrap_or(-1),
            })
        }
    }
}

/// Only web links leave the app.
pub fn validate_external_url(url: &str) -> Result<&str, OpenError> {
    let candidate = url.trim();
    if candidate.is_empty() {
        return Err(OpenError::Missing);
    }
    let parsed = Url::parse(candidate).map_err(|error| OpenError::Invalid {
        message: error.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(candidate),
        other => Err(OpenError::UnsupportedScheme {
            scheme: other.to_string(),
        }),
    }
}

#[must_use]
pub fn telegram_bot_url(bot: &str) -> String {
    let bot = bot.trim().trim_start_matches('@');
    let bot = if bot.is_empty() {
        DEFAULT_TELEGRAM_BOT
    } else {
        bot
    };
    format!("https://t.me/{bot}?start={TELEGRAM_START_PARAMETER}")
}
