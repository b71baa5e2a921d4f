use axum::{
    extract::{FromRequestParts, Query},
    http::{header, request::Parts, HeaderMap, Uri},
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use relay_mcp::Principal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use crate::config::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Session token claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl From<AuthClaims> for Principal {
    fn from(claims: AuthClaims) -> Self {
        Self {
            subject: claims.sub,
            login: claims.login,
            name: claims.name,
            permissions: claims.permissions,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
}

/// Verifies compact HS256 session tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Option<Vec<u8>>,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }

    /// A verifier that rejects every token.
    pub fn disabled() -> Self {
        Self { secret: None }
    }

    pub fn from_env(variable: &str) -> Self {
        match std::env::var(variable) {
            Ok(secret) if !secret.is_empty() => Self::new(secret),
            _ => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Claims of a well-signed, unexpired token.
    pub fn verify(&self, token: &str) -> Option<AuthClaims> {
        let mut mac = self.mac()?;
        let (signing_input, signature) = token.rsplit_once('.')?;
        let (header, claims) = signing_input.split_once('.')?;
        if claims.contains('.') {
            return None;
        }

        let header: TokenHeader =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header).ok()?).ok()?;
        if header.alg != "HS256" {
            return None;
        }

        mac.update(signing_input.as_bytes());
        mac.verify_slice(&URL_SAFE_NO_PAD.decode(signature).ok()?).ok()?;

        let claims: AuthClaims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims).ok()?).ok()?;
        if claims.exp <= chrono::Utc::now().timestamp() {
            return None;
        }
        Some(claims)
    }

    /// Sign `claims`. Returns `None` when no secret is configured.
    #[cfg(test)]
    pub fn issue(&self, claims: &AuthClaims) -> Option<String> {
        let mut mac = self.mac()?;
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).ok()?);
        let signing_input = format!("{}.{}", header, payload);
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Some(format!("{}.{}", signing_input, signature))
    }

    fn mac(&self) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(self.secret.as_deref()?).ok()
    }
}

/// Token from `Authorization: Bearer` or, failing that, the `token` query parameter.
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    bearer.or_else(|| {
        let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
        params.get("token").filter(|t| !t.is_empty()).cloned()
    })
}

/// The verified caller of a request; anonymous when the token is absent or invalid.
#[derive(Debug, Clone, Default)]
pub struct Caller(pub Option<Principal>);

impl<S> FromRequestParts<S> for Caller
where
    Arc<AppState>: axum::extract::FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app: Arc<AppState> = axum::extract::FromRef::from_ref(state);
        let Some(token) = extract_token(&parts.headers, &parts.uri) else {
            return Ok(Self(None));
        };
        match app.verifier.verify(&token) {
            Some(claims) => {
                tracing::debug!(subject = %claims.sub, "Authenticated caller");
                Ok(Self(Some(claims.into())))
            }
            None => {
                tracing::debug!("Ignoring invalid or expired token");
                Ok(Self(None))
            }
        }
    }
}
