use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::error::ApiError;

/// Verification-code delivery backend. `Smtp` talks SSL to the campus
/// relay; `Console` just logs the code and is the default when
/// `EMAIL_HOST` is unset, so local development needs no mail server.
pub enum Mailer {
    Smtp {
        transport: SmtpTransport,
        from: Mailbox,
    },
    Console,
    /// Always fails; lets tests exercise the rollback path.
    #[cfg(test)]
    Failing,
}

impl Mailer {
    pub fn from_env() -> Self {
        let host = match std::env::var("EMAIL_HOST") {
            Ok(host) if !host.is_empty() => host,
            _ => return Mailer::Console,
        };

        let port: u16 = std::env::var("EMAIL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(465);
        let user = std::env::var("EMAIL_HOST_USER").unwrap_or_default();
        let password = std::env::var("EMAIL_HOST_PASSWORD").unwrap_or_default();
        let from = std::env::var("DEFAULT_FROM_EMAIL")
            .ok()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| user.clone())
            .parse::<Mailbox>()
            .expect("Invalid DEFAULT_FROM_EMAIL");

        let transport = SmtpTransport::relay(&host)
            .expect("Failed to configure SMTP relay")
            .port(port)
            .credentials(Credentials::new(user, password))
            .build();

        Mailer::Smtp { transport, from }
    }

    pub fn send_verification_code(&self, to: &str, code: &str) -> Result<(), ApiError> {
        match self {
            Mailer::Console => {
                tracing::info!(%to, %code, "verification code (console mailer)");
                Ok(())
            }
            Mailer::Smtp { transport, from } => {
                let message = Message::builder()
                    .from(from.clone())
                    .to(to
                        .parse()
                        .map_err(|e| ApiError::Internal(format!("invalid recipient: {e}")))?)
                    .subject("核桃书论坛验证码")
                    .body(format!("你的验证码是: {code}，10分钟内有效。"))
                    .map_err(|e| ApiError::Internal(format!("building mail: {e}")))?;

                transport
                    .send(&message)
                    .map(|_| ())
                    .map_err(|e| ApiError::Internal(format!("mail delivery failed: {e}")))
            }
            #[cfg(test)]
            Mailer::Failing => Err(ApiError::Internal("mail delivery failed".to_string())),
        }
    }
}
