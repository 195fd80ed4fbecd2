//! Verification email delivery over SMTP.
//!
//! Port 465 uses implicit TLS, any other port STARTTLS. When the SMTP
//! settings are incomplete the mailer is disabled and every delivery
//! reports failure, which signup surfaces in its response message.

use eyre::{Result, WrapErr};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

pub const DEFAULT_SMTP_PORT: u16 = 465;
const SUBJECT: &str = "Verify your email address - Explainable AI";

/// SMTP connection settings, usually read from the environment.
#[derive(Clone, Default)]
pub struct SmtpSettings {
    pub server: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

pub enum Mailer {
    Smtp {
        transport: AsyncSmtpTransport<Tokio1Executor>,
        from: Mailbox,
        frontend_url: String,
    },
    Disabled,
}

impl std::fmt::Debug for Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mailer::Smtp {
                from, frontend_url, ..
            } => f
                .debug_struct("Mailer::Smtp")
                .field("from", &from.to_string())
                .field("frontend_url", frontend_url)
                .finish(),
            Mailer::Disabled => f.write_str("Mailer::Disabled"),
        }
    }
}

impl Mailer {
    /// Build a mailer, falling back to `Disabled` on missing or bad settings.
    pub fn from_settings(settings: &SmtpSettings, frontend_url: &str) -> Self {
        let (Some(server), Some(user), Some(password)) = (
            settings.server.as_deref().filter(|s| !s.is_empty()),
            settings.user.as_deref().filter(|s| !s.is_empty()),
            settings.password.as_deref().filter(|s| !s.is_empty()),
        ) else {
            warn!("SMTP configuration missing; verification emails disabled");
            return Mailer::Disabled;
        };

        match Self::connect(server, settings.port, user, password, frontend_url) {
            Ok(mailer) => {
                info!(server, port = settings.port, "SMTP mailer configured");
                mailer
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "invalid SMTP configuration; verification emails disabled");
                Mailer::Disabled
            }
        }
    }

    fn connect(
        server: &str,
        port: u16,
        user: &str,
        password: &str,
        frontend_url: &str,
    ) -> Result<Self> {
        let builder = if port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server)
        }
        .wrap_err_with(|| format!("failed to configure SMTP relay {}", server))?;

        let transport = builder
            .port(port)
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .build();
        let from: Mailbox = user
            .parse()
            .wrap_err_with(|| format!("SMTP user {:?} is not a valid sender address", user))?;

        Ok(Mailer::Smtp {
            transport,
            from,
            frontend_url: frontend_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Mailer::Smtp { .. })
    }

    /// Send the verification link. Returns whether delivery succeeded.
    pub async fn send_verification(&self, to: &str, token: &str) -> bool {
        match self.try_send_verification(to, token).await {
            Ok(()) => {
                info!(to, "verification email sent");
                true
            }
            Err(e) => {
                warn!(to, error = %format!("{:#}", e), "failed to send verification email");
                false
            }
        }
    }

    async fn try_send_verification(&self, to: &str, token: &str) -> Result<()> {
        let Mailer::Smtp {
            transport,
            from,
            frontend_url,
        } = self
        else {
            eyre::bail!("mailer is disabled");
        };

        let link = verification_link(frontend_url, token);
        let message = Message::builder()
            .from(from.clone())
            .to(to
                .parse()
                .wrap_err_with(|| format!("invalid recipient {:?}", to))?)
            .subject(SUBJECT)
            .header(ContentType::TEXT_HTML)
            .body(verification_email_html(&link))
            .wrap_err("failed to build verification email")?;

        transport
            .send(message)
            .await
            .wrap_err("SMTP delivery failed")?;
        Ok(())
    }
}

pub fn verification_link(frontend_url: &str, token: &str) -> String {
    format!("{}/verify?token={}", frontend_url.trim_end_matches('/'), token)
}

pub fn verification_email_html(link: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Email Verification</title>
  <style>
    body {{ font-family: Arial, sans-serif; line-height: 1.6; color: #333; }}
    .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
    .btn {{ display: inline-block; padding: 12px 30px; background: #4db6ac; color: white; text-decoration: none; border-radius: 5px; }}
    .footer {{ margin-top: 30px; font-size: 12px; color: #666; }}
  </style>
</head>
<body>
  <div class="container">
    <h2 style="text-align: center;">Welcome to Explainable AI!</h2>
    <p>Thank you for signing up! Please verify your email address to complete your registration.</p>
    <p style="text-align: center; margin: 30px 0;"><a href="{link}" class="btn">Verify Email Address</a></p>
    <p>If the button doesn't work, copy and paste this link into your browser:</p>
    <p style="word-break: break-all; background: #f8f9fa; padding: 10px; border-radius: 5px;">{link}</p>
    <div class="footer">
      <p>If you didn't create an account, you can safely ignore this email.</p>
    </div>
  </div>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_settings_disable_mailer() {
        let settings = SmtpSettings {
            server: Some("smtp.example.com".into()),
            port: 465,
            user: Some("noreply@example.com".into()),
            password: None,
        };
        let mailer = Mailer::from_settings(&settings, "http://localhost:3000");
        assert!(!mailer.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_mailer_reports_failure() {
        let mailer = Mailer::Disabled;
        assert!(!mailer.send_verification("a@example.com", "tok").await);
    }

    #[test]
    fn test_link_and_body() {
        let link = verification_link("http://localhost:3000/", "abc_123");
        assert_eq!(link, "http://localhost:3000/verify?token=abc_123");
        let html = verification_email_html(&link);
        assert_eq!(html.matches(&link).count(), 2);
    }

    #[test]
    fn test_debug_redacts_password() {
        let settings = SmtpSettings {
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let dbg = format!("{:?}", settings);
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("[REDACTED]"));
    }
}
