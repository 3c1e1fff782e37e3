//! Email notifications.
//!
//! A [`MailClient`] delivers one plain-text message. Drivers are chosen by
//! `MAIL_DRIVER`:
//! - `mailtrap`: Mailtrap sending API over HTTPS (`MAILTRAP_API_TOKEN`)
//! - `smtp`: any SMTP relay via lettre (`SMTP_HOST`, `SMTP_PORT`,
//!   `SMTP_USERNAME`, `SMTP_PASSWORD`)
//! - `none`: log and discard

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::MailError;

/// Mailtrap sending endpoint.
pub const MAILTRAP_API_URL: &str = "https://send.api.mailtrap.io/api/send";

/// SMTP submission port used when `SMTP_PORT` is unset.
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Port that expects TLS from the first byte instead of STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

/// A plain-text email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    /// `addr@example.com` or `Display Name <addr@example.com>`.
    pub from: String,
    pub subject: String,
    pub body: String,
}

/// Delivers email. Returns a provider message id.
#[async_trait]
pub trait MailClient: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<String, MailError>;
}

/// Split `Name <addr>` into its parts. Bare addresses have no name.
pub fn parse_sender(from: &str) -> (Option<String>, String) {
    let trimmed = from.trim();
    if let (Some(open), true) = (trimmed.rfind('<'), trimmed.ends_with('>')) {
        let name = trimmed[..open].trim().trim_matches('"').trim();
        let email = trimmed[open + 1..trimmed.len() - 1].trim();
        if !email.is_empty() {
            let name = (!name.is_empty()).then(|| name.to_string());
            return (name, email.to_string());
        }
    }
    (None, trimmed.to_string())
}

/// Validate required fields, then send.
pub async fn send_email(client: &dyn MailClient, message: &EmailMessage) -> Result<String, MailError> {
    let fields = [
        ("to", &message.to),
        ("from", &message.from),
        ("subject", &message.subject),
        ("body", &message.body),
    ];
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(MailError::MissingField(name));
        }
    }
    client.send(message).await
}

#[derive(Debug, Deserialize)]
struct MailtrapResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// Mailtrap HTTP API client.
pub struct MailtrapMailClient {
    http_client: Client,
    api_token: String,
    api_url: String,
}

impl MailtrapMailClient {
    pub fn new(api_token: impl Into<String>) -> Result<Self, MailError> {
        let api_token = api_token.into();
        if api_token.trim().is_empty() {
            return Err(MailError::NotConfigured(
                "MAILTRAP_API_TOKEN required for the mailtrap driver".to_string(),
            ));
        }
        Ok(Self {
            http_client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            api_token,
            api_url: MAILTRAP_API_URL.to_string(),
        })
    }

    /// Send through another endpoint, such as a sandbox inbox.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }
}

#[async_trait]
impl MailClient for MailtrapMailClient {
    async fn send(&self, message: &EmailMessage) -> Result<String, MailError> {
        let (name, email) = parse_sender(&message.from);
        let mut from = json!({ "email": email });
        if let Some(name) = name {
            from["name"] = json!(name);
        }
        let payload = json!({
            "from": from,
            "to": [{ "email": message.to.trim() }],
            "subject": message.subject,
            "text": message.body,
        });

        let response = self
            .http_client
            .post(&self.api_url)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MailtrapResponse = response.json().await?;
        let id = parsed
            .message_ids
            .into_iter()
            .next()
            .unwrap_or_else(|| format!("mailtrap-{}", chrono::Utc::now().timestamp_millis()));
        info!(to = %message.to, message_id = %id, "Email sent via Mailtrap");
        Ok(id)
    }
}

/// SMTP settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// SMTP relay client.
pub struct SmtpMailClient {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailClient {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let builder = if config.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|e| MailError::Smtp(e.to_string()))?
        .port(config.port)
        .timeout(Some(Duration::from_secs(30)));

        let builder = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => builder.credentials(Credentials::new(user.clone(), pass.clone())),
            _ => builder,
        };

        Ok(Self {
            transport: builder.build(),
        })
    }
}

fn mailbox(address: &str) -> Result<Mailbox, MailError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| MailError::InvalidAddress {
            address: address.to_string(),
            message: e.to_string(),
        })
}

#[async_trait]
impl MailClient for SmtpMailClient {
    async fn send(&self, message: &EmailMessage) -> Result<String, MailError> {
        let email = Message::builder()
            .from(mailbox(&message.from)?)
            .to(mailbox(&message.to)?)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| MailError::Smtp(e.to_string()))?;

        let response = self
            .transport
            .send(email)
            .await
            .map_err(|e| MailError::Smtp(e.to_string()))?;

        let id = response.message().collect::<Vec<_>>().join(" ");
        info!(to = %message.to, code = %response.code(), "Email sent via SMTP");
        Ok(id)
    }
}

/// Discards every message.
#[derive(Debug, Default)]
pub struct NoopMailClient;

#[async_trait]
impl MailClient for NoopMailClient {
    async fn send(&self, message: &EmailMessage) -> Result<String, MailError> {
        debug!(to = %message.to, subject = %message.subject, "Mail driver disabled, dropping email");
        Ok(format!("noop-{}", uuid::Uuid::new_v4()))
    }
}

/// Build the configured mail client from a variable lookup.
pub fn create_mail_client_from_lookup<F>(lookup: F) -> Result<Arc<dyn MailClient>, MailError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let driver = match get("MAIL_DRIVER") {
        Some(driver) => driver.trim().to_lowercase(),
        None if get("SMTP_HOST").is_some() => "smtp".to_string(),
        None if get("MAILTRAP_API_TOKEN").is_some() => "mailtrap".to_string(),
        None => "none".to_string(),
    };
    debug!(driver = %driver, "Selecting mail driver");

    match driver.as_str() {
        "mailtrap" => {
            let mut client = MailtrapMailClient::new(get("MAILTRAP_API_TOKEN").unwrap_or_default())?;
            if let Some(url) = get("MAILTRAP_API_URL") {
                client = client.with_api_url(url.trim());
            }
            Ok(Arc::new(client))
        }
        "smtp" => {
            let host = get("SMTP_HOST").ok_or_else(|| {
                MailError::NotConfigured("SMTP_HOST required for the smtp driver".to_string())
            })?;
            let port = match get("SMTP_PORT") {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    MailError::NotConfigured(format!("SMTP_PORT must be a port number, got '{}'", raw))
                })?,
                None => DEFAULT_SMTP_PORT,
            };
            Ok(Arc::new(SmtpMailClient::new(&SmtpConfig {
                host,
                port,
                username: get("SMTP_USERNAME"),
                password: get("SMTP_PASSWORD"),
            })?))
        }
        "none" => Ok(Arc::new(NoopMailClient)),
        other => Err(MailError::UnknownDriver(other.to_string())),
    }
}

/// Build the configured mail client from the process environment.
pub fn create_mail_client() -> Result<Arc<dyn MailClient>, MailError> {
    create_mail_client_from_lookup(|key| std::env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    fn message() -> EmailMessage {
        EmailMessage {
            to: "dev@example.com".to_string(),
            from: "Agent <agent@example.com>".to_string(),
            subject: "PR created".to_string(),
            body: "hello".to_string(),
        }
    }

    #[test]
    fn test_parse_sender() {
        assert_eq!(
            parse_sender("Error Assistant <bot@example.com>"),
            (Some("Error Assistant".to_string()), "bot@example.com".to_string())
        );
        assert_eq!(
            parse_sender("\"Quoted\" <q@example.com>"),
            (Some("Quoted".to_string()), "q@example.com".to_string())
        );
        assert_eq!(parse_sender("<only@example.com>"), (None, "only@example.com".to_string()));
        assert_eq!(parse_sender(" plain@example.com "), (None, "plain@example.com".to_string()));
    }

    #[tokio::test]
    async fn test_send_email_validates_fields() {
        let client = NoopMailClient;
        let mut msg = message();
        msg.subject = "  ".to_string();
        let err = send_email(&client, &msg).await.unwrap_err();
        assert!(matches!(err, MailError::MissingField("subject")));

        let mut msg = message();
        msg.to.clear();
        assert!(matches!(
            send_email(&client, &msg).await,
            Err(MailError::MissingField("to"))
        ));

        let id = send_email(&client, &message()).await.unwrap();
        assert!(id.starts_with("noop-"));
    }

    #[test]
    fn test_driver_selection() {
        assert!(create_mail_client_from_lookup(lookup(&[])).is_ok());
        assert!(create_mail_client_from_lookup(lookup(&[("MAILTRAP_API_TOKEN", "tok")])).is_ok());
        assert!(create_mail_client_from_lookup(lookup(&[("SMTP_HOST", "smtp.example.com")])).is_ok());

        assert!(matches!(
            create_mail_client_from_lookup(lookup(&[("MAIL_DRIVER", "ses")])),
            Err(MailError::UnknownDriver(_))
        ));
        assert!(matches!(
            create_mail_client_from_lookup(lookup(&[("MAIL_DRIVER", "mailtrap")])),
            Err(MailError::NotConfigured(_))
        ));
        assert!(matches!(
            create_mail_client_from_lookup(lookup(&[
                ("SMTP_HOST", "smtp.example.com"),
                ("SMTP_PORT", "smtp"),
            ])),
            Err(MailError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_smtp_rejects_invalid_address() {
        let client = SmtpMailClient::new(&SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: DEFAULT_SMTP_PORT,
            username: None,
            password: None,
        })
        .unwrap();
        let mut msg = message();
        msg.to = "not an address".to_string();
        assert!(matches!(
            client.send(&msg).await,
            Err(MailError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_mailtrap_posts_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/send"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!({
                "from": {"email": "agent@example.com", "name": "Agent"},
                "to": [{"email": "dev@example.com"}],
                "subject": "PR created",
                "text": "hello"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": true, "message_ids": ["m-1"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/api/send", server.uri());
        let client = create_mail_client_from_lookup(lookup(&[
            ("MAIL_DRIVER", "mailtrap"),
            ("MAILTRAP_API_TOKEN", "tok"),
            ("MAILTRAP_API_URL", url.as_str()),
        ]))
        .unwrap();
        assert_eq!(send_email(client.as_ref(), &message()).await.unwrap(), "m-1");
    }

    #[tokio::test]
    async fn test_mailtrap_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let client = MailtrapMailClient::new("bad").unwrap().with_api_url(server.uri());
        match client.send(&message()).await {
            Err(MailError::Rejected { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "Unauthorized");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
