//! GitHub App authentication.
//!
//! An App authenticates with a short-lived RS256 JWT signed by its private
//! key, then exchanges it for an installation access token used for git
//! pushes and REST calls.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::Client;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use rustls_pemfile::Item;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufReader;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{http_client, GITHUB_API_BASE};
use crate::error::GitHubError;

/// Seconds the JWT `iat` is backdated to absorb clock drift.
const JWT_BACKDATE_SECS: i64 = 60;

/// JWT lifetime after `now`. GitHub caps it at ten minutes.
const JWT_LIFETIME_SECS: i64 = 540;

/// GitHub App identity.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct GitHubAppCredentials {
    pub app_id: String,
    pub installation_id: String,
    /// PEM content. Literal `\n` sequences are accepted.
    pub private_key: Option<String>,
    pub private_key_path: Option<PathBuf>,
}

impl fmt::Debug for GitHubAppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubAppCredentials")
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .finish()
    }
}

impl GitHubAppCredentials {
    /// Read credentials from a variable lookup.
    ///
    /// Uses `GITHUB_APP_ID`, `GITHUB_INSTALLATION_ID`, `GITHUB_APP_PRIVATE_KEY`
    /// and `GITHUB_APP_PRIVATE_KEY_PATH`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            app_id: get("GITHUB_APP_ID").unwrap_or_default(),
            installation_id: get("GITHUB_INSTALLATION_ID").unwrap_or_default(),
            private_key: get("GITHUB_APP_PRIVATE_KEY"),
            private_key_path: get("GITHUB_APP_PRIVATE_KEY_PATH").map(PathBuf::from),
        }
    }

    /// Whether an id, an installation and a key source are all present.
    pub fn is_complete(&self) -> bool {
        !self.app_id.trim().is_empty()
            && !self.installation_id.trim().is_empty()
            && (self.private_key.is_some() || self.private_key_path.is_some())
    }

    /// PEM text of the private key, preferring inline content over the path.
    pub fn load_private_key(&self) -> Result<String, GitHubError> {
        if let Some(key) = &self.private_key {
            return Ok(key.replace("\\n", "\n"));
        }
        let path = self
            .private_key_path
            .as_ref()
            .ok_or(GitHubError::MissingCredentials)?;
        std::fs::read_to_string(path).map_err(|source| GitHubError::KeyFile {
            path: path.clone(),
            source,
        })
    }
}

fn load_key_pair(pem: &str) -> Result<RsaKeyPair, GitHubError> {
    let mut reader = BufReader::new(pem.as_bytes());
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::Pkcs1Key(key))) => {
                return RsaKeyPair::from_der(key.secret_pkcs1_der())
                    .map_err(|e| GitHubError::InvalidKey(e.to_string()));
            }
            Ok(Some(Item::Pkcs8Key(key))) => {
                return RsaKeyPair::from_pkcs8(key.secret_pkcs8_der())
                    .map_err(|e| GitHubError::InvalidKey(e.to_string()));
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(GitHubError::InvalidKey(
                    "no RSA private key found in PEM".to_string(),
                ))
            }
            Err(e) => return Err(GitHubError::InvalidKey(e.to_string())),
        }
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iat: i64,
    exp: i64,
    iss: &'a str,
}

/// Sign a GitHub App JWT for `app_id` at unix time `now`.
pub fn app_jwt(app_id: &str, pem: &str, now: i64) -> Result<String, GitHubError> {
    let key_pair = load_key_pair(pem)?;

    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = serde_json::to_vec(&Claims {
        iat: now - JWT_BACKDATE_SECS,
        exp: now + JWT_LIFETIME_SECS,
        iss: app_id,
    })
    .map_err(|_| GitHubError::Signing)?;
    let signing_input = format!("{}.{}", header, URL_SAFE_NO_PAD.encode(claims));

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &RSA_PKCS1_SHA256,
            &SystemRandom::new(),
            signing_input.as_bytes(),
            &mut signature,
        )
        .map_err(|_| GitHubError::Signing)?;

    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)))
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<String>,
}

/// Exchanges App credentials for installation tokens.
#[derive(Clone)]
pub struct GitHubAuth {
    http_client: Client,
    api_base: String,
}

impl GitHubAuth {
    pub fn new() -> Result<Self, GitHubError> {
        Ok(Self {
            http_client: http_client()?,
            api_base: GITHUB_API_BASE.to_string(),
        })
    }

    /// Point at a different API host (GitHub Enterprise or a test server).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn client(&self) -> &Client {
        &self.http_client
    }

    /// Fetch an installation access token.
    pub async fn installation_token(
        &self,
        credentials: &GitHubAppCredentials,
    ) -> Result<String, GitHubError> {
        if !credentials.is_complete() {
            return Err(GitHubError::MissingCredentials);
        }
        let pem = credentials.load_private_key()?;
        let jwt = app_jwt(&credentials.app_id, &pem, chrono::Utc::now().timestamp())?;

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, credentials.installation_id
        );
        debug!(installation_id = %credentials.installation_id, "Requesting installation token");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let token: AccessTokenResponse = response.json().await?;
        info!(
            installation_id = %credentials.installation_id,
            expires_at = token.expires_at.as_deref().unwrap_or("unknown"),
            "Obtained installation token"
        );
        Ok(token.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_credentials_completeness() {
        let creds = GitHubAppCredentials::from_lookup(lookup(&[
            ("GITHUB_APP_ID", "123"),
            ("GITHUB_INSTALLATION_ID", "456"),
            ("GITHUB_APP_PRIVATE_KEY_PATH", "/keys/app.pem"),
        ]));
        assert!(creds.is_complete());

        let creds = GitHubAppCredentials::from_lookup(lookup(&[
            ("GITHUB_APP_ID", "123"),
            ("GITHUB_INSTALLATION_ID", "456"),
            ("GITHUB_APP_PRIVATE_KEY", "  "),
        ]));
        assert!(!creds.is_complete());
        assert!(!GitHubAppCredentials::default().is_complete());
    }

    #[test]
    fn test_inline_key_unescapes_newlines() {
        let creds = GitHubAppCredentials {
            private_key: Some("-----BEGIN-----\\nabc\\n-----END-----".to_string()),
            ..Default::default()
        };
        assert_eq!(
            creds.load_private_key().unwrap(),
            "-----BEGIN-----\nabc\n-----END-----"
        );
    }

    #[test]
    fn test_missing_key_file() {
        let creds = GitHubAppCredentials {
            private_key_path: Some(PathBuf::from("/nonexistent/app.pem")),
            ..Default::default()
        };
        assert!(matches!(
            creds.load_private_key(),
            Err(GitHubError::KeyFile { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let creds = GitHubAppCredentials {
            private_key: Some("secret-material".to_string()),
            ..Default::default()
        };
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret-material"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_jwt_rejects_garbage_key() {
        assert!(matches!(
            app_jwt("1", "not a pem", 0),
            Err(GitHubError::InvalidKey(_))
        ));
    }

    use crate::github::testing::{credentials, APP_KEY_PEM};
    use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};
    use serde_json::{json, Value};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn segment(raw: &str) -> Value {
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(raw).unwrap()).unwrap()
    }

    /// Check the signature against the test key and return (header, claims).
    fn verify(jwt: &str) -> (Value, Value) {
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        let key_pair = load_key_pair(APP_KEY_PEM).unwrap();
        let public = UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, key_pair.public().as_ref());
        let signature = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        public
            .verify(format!("{}.{}", parts[0], parts[1]).as_bytes(), &signature)
            .unwrap();
        (segment(parts[0]), segment(parts[1]))
    }

    #[test]
    fn test_jwt_is_signed_with_app_claims() {
        let now = 1_700_000_000;
        let jwt = app_jwt("123", APP_KEY_PEM, now).unwrap();
        let (header, claims) = verify(&jwt);

        assert_eq!(header, json!({"alg": "RS256", "typ": "JWT"}));
        assert_eq!(claims["iss"], "123");
        assert_eq!(claims["iat"], now - 60);
        assert_eq!(claims["exp"], now + 540);
    }

    #[test]
    fn test_jwt_detects_tampering() {
        let jwt = app_jwt("123", APP_KEY_PEM, 0).unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        let forged_claims = URL_SAFE_NO_PAD.encode(br#"{"iat":0,"exp":99999999999,"iss":"999"}"#);
        let key_pair = load_key_pair(APP_KEY_PEM).unwrap();
        let public = UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, key_pair.public().as_ref());
        let signature = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        assert!(public
            .verify(format!("{}.{}", parts[0], forged_claims).as_bytes(), &signature)
            .is_err());
    }

    #[test]
    fn test_escaped_inline_key_signs() {
        let creds = GitHubAppCredentials {
            private_key: Some(APP_KEY_PEM.replace('\n', "\\n")),
            ..credentials()
        };
        let pem = creds.load_private_key().unwrap();
        let jwt = app_jwt(&creds.app_id, &pem, 1_000).unwrap();
        assert_eq!(verify(&jwt).1["iss"], "123");
    }

    #[tokio::test]
    async fn test_installation_token_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/456/access_tokens"))
            .and(header("accept", "application/vnd.github+json"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "token": "ghs_installation",
                "expires_at": "2030-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = GitHubAuth::new()
            .unwrap()
            .with_api_base(format!("{}/", server.uri()));
        assert_eq!(auth.api_base(), server.uri());
        let token = auth.installation_token(&credentials()).await.unwrap();
        assert_eq!(token, "ghs_installation");

        let requests = server.received_requests().await.unwrap();
        let bearer = requests[0]
            .headers
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let jwt = bearer.strip_prefix("Bearer ").unwrap();
        let (_, claims) = verify(jwt);
        assert_eq!(claims["iss"], "123");
        let exp = claims["exp"].as_i64().unwrap();
        let iat = claims["iat"].as_i64().unwrap();
        assert_eq!(exp - iat, 600);
    }

    #[tokio::test]
    async fn test_installation_token_rejection_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/456/access_tokens"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
            .mount(&server)
            .await;

        let auth = GitHubAuth::new().unwrap().with_api_base(server.uri());
        let err = auth.installation_token(&credentials()).await.unwrap_err();
        match err {
            GitHubError::Api { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "Bad credentials");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_installation_token_requires_credentials() {
        let auth = GitHubAuth::new().unwrap();
        let err = auth
            .installation_token(&GitHubAppCredentials::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GitHubError::MissingCredentials));
    }
}
