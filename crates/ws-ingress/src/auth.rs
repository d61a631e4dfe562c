use std::time::Duration;

use http::header::AUTHORIZATION;
use http::{HeaderMap, StatusCode};
use reqwest::Url;
use thiserror::Error;

const BEARER_PREFIX: &str = "Bearer ";

/// Why an upgrade request was turned away.
#[derive(Debug, Error)]
pub enum AuthRejection {
    #[error("no Authorization header provided")]
    MissingHeader,

    #[error("Authorization header does not carry a Bearer token")]
    NotBearer,

    #[error("token validation failed with status {status}")]
    Denied { status: StatusCode },

    #[error("token validation request failed: {0}")]
    Unavailable(#[source] reqwest::Error),
}

impl AuthRejection {
    /// HTTP status returned instead of `101 Switching Protocols`.
    pub fn status(&self) -> StatusCode {
        match self {
            AuthRejection::MissingHeader | AuthRejection::NotBearer => StatusCode::UNAUTHORIZED,
            AuthRejection::Denied { .. } => StatusCode::FORBIDDEN,
            AuthRejection::Unavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Response body sent to the rejected client.
    pub fn client_message(&self) -> &'static str {
        match self {
            AuthRejection::MissingHeader => {
                "Unauthorized request: no Authorization header provided"
            }
            AuthRejection::NotBearer => {
                "Unauthorized request: no Bearer token provided in Authorization header"
            }
            AuthRejection::Denied { .. } => "Validation of Bearer token failed",
            AuthRejection::Unavailable(_) => "Problem while validating provided Bearer token",
        }
    }
}

/// Errors building an [`AuthGate`] from configuration.
#[derive(Debug, Error)]
pub enum AuthSetupError {
    #[error("OAuth authority '{0}' cannot be used as a base URL")]
    NotABase(Url),

    #[error("failed to build introspection client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
struct Introspection {
    client: reqwest::Client,
    validate_url: Url,
}

/// Bearer-token check run on every WebSocket upgrade request.
///
/// With an OAuth authority configured, the `Authorization` header is
/// forwarded verbatim to `<authority>/validate`; any response below 300
/// admits the connection. Without an authority every request is admitted.
#[derive(Debug, Clone)]
pub struct AuthGate {
    introspection: Option<Introspection>,
}

impl AuthGate {
    /// A gate that admits every request.
    pub fn disabled() -> Self {
        Self {
            introspection: None,
        }
    }

    /// A gate that validates tokens against `authority`, bounding each
    /// introspection call by `timeout`.
    pub fn introspecting(authority: &Url, timeout: Duration) -> Result<Self, AuthSetupError> {
        let mut validate_url = authority.clone();
        validate_url
            .path_segments_mut()
            .map_err(|()| AuthSetupError::NotABase(authority.clone()))?
            .pop_if_empty()
            .push("validate");

        // A redirect from the authority is a denial, not something to chase.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            introspection: Some(Introspection {
                client,
                validate_url,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.introspection.is_some()
    }

    /// The introspection endpoint, if validation is enabled.
    pub fn validate_url(&self) -> Option<&Url> {
        self.introspection.as_ref().map(|i| &i.validate_url)
    }

    /// Decide whether the request carrying `headers` may be upgraded.
    pub async fn check(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        let Some(introspection) = &self.introspection else {
            tracing::debug!("token validation disabled; admitting connection");
            return Ok(());
        };

        let header = headers
            .get(AUTHORIZATION)
            .ok_or(AuthRejection::MissingHeader)?;

        let is_bearer = header
            .to_str()
            .map(|value| value.starts_with(BEARER_PREFIX))
            .unwrap_or(false);
        if !is_bearer {
            return Err(AuthRejection::NotBearer);
        }

        let response = introspection
            .client
            .get(introspection.validate_url.clone())
            .header(AUTHORIZATION, header.clone())
            .send()
            .await
            .map_err(AuthRejection::Unavailable)?;

        let status = response.status();
        if status.as_u16() >= 300 {
            return Err(AuthRejection::Denied { status });
        }

        tracing::info!("token validation successful");
        Ok(())
    }
}
