use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::DecodedAuthData;

pub const DEFAULT_DEEP_LINK_SCHEME: &str = "cloak";
pub const DATA_QUERY_PARAM: &str = "data";
const FALLBACK_REPARSE_PREFIX: &str = "http://";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeepLinkError {
    #[error("deep link could not be parsed: {message}")]
    Unparseable { message: String },
    #[error("deep link scheme {found} does not match registered scheme {expected}")]
    SchemeMismatch { expected: String, found: String },
    #[error("deep link route {route:?} is not recognized")]
    UnrecognizedRoute { route: String },
    #[error("deep link is missing the data query parameter")]
    MissingData,
    #[error("deep link data is not valid percent-encoded utf-8: {message}")]
    Decode { message: String },
    #[error("deep link data is not a valid auth payload: {message}")]
    Payload { message: String },
}

impl DeepLinkError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unparseable { .. } => "unparseable",
            Self::SchemeMismatch { .. } => "scheme_mismatch",
            Self::UnrecognizedRoute { .. } => "unrecognized_route",
            Self::MissingData => "missing_data",
            Self::Decode { .. } => "decode_failed",
            Self::Payload { .. } => "payload_invalid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRoute {
    Auth,
}

impl LinkRoute {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim_matches('/').to_ascii_lowercase().as_str() {
            "auth" => Some(Self::Auth),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
        }
    }
}

/// A recognised deep link. `raw_data` stays percent-encoded until the
/// receiving side decodes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthLinkPayload {
    pub protocol: String,
    pub route: LinkRoute,
    pub raw_data: String,
}

impl AuthLinkPayload {
    pub fn decode(&self) -> Result<DecodedAuthData, DeepLinkError> {
        parse_auth_data(&self.raw_data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Strict,
    SubstitutionFallback,
}

impl ParseStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::SubstitutionFallback => "substitution_fallback",
        }
    }
}

/// Scheme, route candidate and raw query pulled out of a URL before any
/// validation against the registered scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParts {
    pub scheme: String,
    pub route: String,
    pub query: Option<String>,
    pub strategy: ParseStrategy,
}

pub fn parse_strict(raw_url: &str) -> Result<LinkParts, DeepLinkError> {
    let url = Url::parse(raw_url.trim()).map_err(|error| DeepLinkError::Unparseable {
        message: error.to_string(),
    })?;
    Ok(LinkParts {
        scheme: url.scheme().to_string(),
        route: route_candidate(&url),
        query: url.query().map(str::to_string),
        strategy: ParseStrategy::Strict,
    })
}

/// Rewrites `<scheme>://` to `http://` and reparses, for links whose
/// authority the strict parser rejects.
pub fn parse_with_substitution(raw_url: &str, scheme: &str) -> Result<LinkParts, DeepLinkError> {
    let trimmed = raw_url.trim();
    let prefix = format!("{scheme}://");
    let Some(head) = trimmed.get(..prefix.len()) else {
        return Err(DeepLinkError::Unparseable {
            message: format!("link does not start with {prefix}"),
        });
    };
    if !head.eq_ignore_ascii_case(&prefix) {
        return Err(DeepLinkError::Unparseable {
            message: format!("link does not start with {prefix}"),
        });
    }
    let rewritten = format!("{FALLBACK_REPARSE_PREFIX}{}", &trimmed[prefix.len()..]);
    let url = Url::parse(&rewritten).map_err(|error| DeepLinkError::Unparseable {
        message: error.to_string(),
    })?;
    Ok(LinkParts {
        scheme: scheme.to_ascii_lowercase(),
        route: route_candidate(&url),
        query: url.query().map(str::to_string),
        strategy: ParseStrategy::SubstitutionFallback,
    })
}

/// Strict parse first, substitution reparse second; then the scheme, route
/// and `data` parameter are checked.
pub fn interpret(raw_url: &str, registered_scheme: &str) -> Result<AuthLinkPayload, DeepLinkError> {
    let parts = match parse_strict(raw_url) {
        Ok(parts) => parts,
        Err(strict_error) => {
            tracing::debug!(
                error = %strict_error,
                "strict deep link parse failed, retrying with substitution"
            );
            parse_with_substitution(raw_url, registered_scheme)?
        }
    };

    if !parts.scheme.eq_ignore_ascii_case(registered_scheme) {
        return Err(DeepLinkError::SchemeMismatch {
            expected: registered_scheme.to_string(),
            found: parts.scheme,
        });
    }
    let route = LinkRoute::parse(&parts.route).ok_or_else(|| DeepLinkError::UnrecognizedRoute {
        route: parts.route.clone(),
    })?;
    let raw_data = parts
        .query
        .as_deref()
        .and_then(|query| query_value(query, DATA_QUERY_PARAM))
        .ok_or(DeepLinkError::MissingData)?;

    tracing::debug!(
        strategy = parts.strategy.as_str(),
        route = route.as_str(),
        data_len = raw_data.len(),
        "deep link interpreted"
    );
    Ok(AuthLinkPayload {
        protocol: registered_scheme.to_ascii_lowercase(),
        route,
        raw_data,
    })
}

pub fn decode_raw_data(raw_data: &str) -> Result<String, DeepLinkError> {
    let spaced = raw_data.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|error| DeepLinkError::Decode {
            message: error.to_string(),
        })
}

/// Decodes and parses `raw_data`. A payload that was percent-encoded twice by
/// the sender is accepted after a second decode.
pub fn parse_auth_data(raw_data: &str) -> Result<DecodedAuthData, DeepLinkError> {
    let decoded = decode_raw_data(raw_data)?;
    match serde_json::from_str::<DecodedAuthData>(&decoded) {
        Ok(data) => Ok(data),
        Err(first_error) if decoded.contains('%') => {
            let twice = decode_raw_data(&decoded)?;
            serde_json::from_str::<DecodedAuthData>(&twice).map_err(|_| DeepLinkError::Payload {
                message: first_error.to_string(),
            })
        }
        Err(error) => Err(DeepLinkError::Payload {
            message: error.to_string(),
        }),
    }
}

/// First argument that starts with `<scheme>://`, compared case-insensitively.
#[must_use]
pub fn find_deep_link_arg<'a, I>(args: I, scheme: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("{scheme}://");
    args.into_iter().find(|arg| {
        arg.trim()
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(&prefix))
    })
}

fn route_candidate(url: &Url) -> String {
    if let Some(host) = url.host_str().filter(|host| !host.is_empty()) {
        return host.to_string();
    }
    url.path()
        .split('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn query_value(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
