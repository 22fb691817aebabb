use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{FormBuilderError, FormBuilderResult};
use crate::settings::{Settings, SmtpSettings};

/// Outgoing mail backend used by the notification action.
pub trait Mailer: Send + Sync {
    fn name(&self) -> &'static str;

    fn send_mail(&self, subject: &str, body: &str, from: &str, recipients: &[String]) -> FormBuilderResult<()>;

    /// Notify the site administrators.
    fn mail_admins(&self, subject: &str, body: &str) -> FormBuilderResult<()>;
}

/// SMTP when a mail server is configured, the log otherwise.
pub fn mailer_from_settings(settings: &Settings) -> FormBuilderResult<Arc<dyn Mailer>> {
    match &settings.smtp {
        Some(smtp) => {
            info!(host = %smtp.host, port = smtp.port, "sending mail over SMTP");
            Ok(Arc::new(SmtpMailer::new(smtp, settings.admins.clone(), settings.from_email.clone())?))
        }
        None => {
            warn!("no SMTP server configured, mail is only logged");
            Ok(Arc::new(LogMailer::new(settings.admins.clone(), settings.from_email.clone())))
        }
    }
}

fn parse_mailbox(address: &str) -> FormBuilderResult<Mailbox> {
    address
        .trim()
        .parse()
        .map_err(|e| FormBuilderError::configuration(format!("invalid mail address {:?}: {}", address, e)))
}

/// Plain text message to every recipient.
pub fn build_message(subject: &str, body: &str, from: &str, recipients: &[String]) -> FormBuilderResult<Message> {
    if recipients.is_empty() {
        return Err(FormBuilderError::configuration("mail needs at least one recipient"));
    }
    let mut builder = Message::builder().from(parse_mailbox(from)?).subject(subject);
    for recipient in recipients {
        builder = builder.to(parse_mailbox(recipient)?);
    }
    builder
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| anyhow::anyhow!("failed to build mail: {}", e).into())
}

/// Delivers through an SMTP relay. Port 465 uses implicit TLS, 587 STARTTLS,
/// anything else a plain connection (local relays, test servers).
pub struct SmtpMailer {
    transport: SmtpTransport,
    admins: Vec<String>,
    from_email: String,
}

impl SmtpMailer {
    pub fn new(config: &SmtpSettings, admins: Vec<String>, from_email: impl Into<String>) -> FormBuilderResult<Self> {
        let builder = match config.port {
            465 => SmtpTransport::relay(&config.host),
            587 => SmtpTransport::starttls_relay(&config.host),
            _ => Ok(SmtpTransport::builder_dangerous(&config.host)),
        }
        .map_err(|e| FormBuilderError::configuration(format!("SMTP relay {}: {}", config.host, e)))?;

        let mut builder = builder.port(config.port);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            admins,
            from_email: from_email.into(),
        })
    }
}

impl Mailer for SmtpMailer {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn send_mail(&self, subject: &str, body: &str, from: &str, recipients: &[String]) -> FormBuilderResult<()> {
        let message = build_message(subject, body, from, recipients)?;
        self.transport
            .send(&message)
            .map_err(|e| anyhow::anyhow!("SMTP delivery failed: {}", e))?;
        debug!(subject, recipients = recipients.len(), "mail delivered");
        Ok(())
    }

    fn mail_admins(&self, subject: &str, body: &str) -> FormBuilderResult<()> {
        if self.admins.is_empty() {
            warn!(subject, "mail to admins dropped, no admins configured");
            return Ok(());
        }
        self.send_mail(subject, body, &self.from_email, &self.admins)
    }
}

/// Writes every message to the log instead of delivering it. Used when no
/// SMTP server is configured.
pub struct LogMailer {
    admins: Vec<String>,
    from_email: String,
}

impl LogMailer {
    pub fn new(admins: Vec<String>, from_email: impl Into<String>) -> Self {
        Self {
            admins,
            from_email: from_email.into(),
        }
    }
}

impl Mailer for LogMailer {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send_mail(&self, subject: &str, body: &str, from: &str, recipients: &[String]) -> FormBuilderResult<()> {
        info!(subject, from, to = %recipients.join(", "), "mail: {}", body);
        Ok(())
    }

    fn mail_admins(&self, subject: &str, body: &str) -> FormBuilderResult<()> {
        if self.admins.is_empty() {
            warn!(subject, "mail to admins dropped, no admins configured");
            return Ok(());
        }
        self.send_mail(subject, body, &self.from_email, &self.admins)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    Direct,
    Admins,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub kind: MailKind,
    pub subject: String,
    pub body: String,
    pub from: Option<String>,
    pub recipients: Vec<String>,
}

/// Keeps sent messages in memory.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    outbox: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbox(&self) -> Vec<SentMail> {
        match self.outbox.lock() {
            Ok(outbox) => outbox.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, mail: SentMail) {
        match self.outbox.lock() {
            Ok(mut outbox) => outbox.push(mail),
            Err(poisoned) => poisoned.into_inner().push(mail),
        }
    }
}

impl Mailer for RecordingMailer {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn send_mail(&self, subject: &str, body: &str, from: &str, recipients: &[String]) -> FormBuilderResult<()> {
        self.record(SentMail {
            kind: MailKind::Direct,
            subject: subject.to_string(),
            body: body.to_string(),
            from: Some(from.to_string()),
            recipients: recipients.to_vec(),
        });
        Ok(())
    }

    fn mail_admins(&self, subject: &str, body: &str) -> FormBuilderResult<()> {
        self.record(SentMail {
            kind: MailKind::Admins,
            subject: subject.to_string(),
            body: body.to_string(),
            from: None,
            recipients: Vec::new(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_mailer_keeps_order() {
        let mailer = RecordingMailer::new();
        mailer
            .send_mail("Hello", "body", "from@example.com", &["a@b.c".to_string()])
            .unwrap();
        mailer.mail_admins("Alert", "admin body").unwrap();

        let outbox = mailer.outbox();
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].kind, MailKind::Direct);
        assert_eq!(outbox[0].recipients, vec!["a@b.c"]);
        assert_eq!(outbox[1].kind, MailKind::Admins);
        assert_eq!(outbox[1].subject, "Alert");
    }

    #[test]
    fn test_build_message_headers_and_envelope() {
        let recipients = vec!["a@b.c".to_string(), "d@e.f".to_string()];
        let message = build_message("Test form form submission", "field1: value1\n", "forms@example.com", &recipients)
            .unwrap();

        let envelope = message.envelope();
        let to: Vec<String> = envelope.to().iter().map(|a| a.to_string()).collect();
        assert_eq!(to, vec!["a@b.c", "d@e.f"]);
        assert_eq!(envelope.from().map(|a| a.to_string()).as_deref(), Some("forms@example.com"));

        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(formatted.contains("Subject: Test form form submission"));
        assert!(formatted.contains("field1: value1"));
    }

    #[test]
    fn test_build_message_rejects_bad_addresses() {
        let bad_recipient = build_message("s", "b", "forms@example.com", &["not an address".to_string()]);
        assert!(matches!(bad_recipient, Err(FormBuilderError::Configuration(_))));
        let bad_from = build_message("s", "b", "nope", &["a@b.c".to_string()]);
        assert!(matches!(bad_from, Err(FormBuilderError::Configuration(_))));
        assert!(build_message("s", "b", "forms@example.com", &[]).is_err());
    }

    #[test]
    fn test_mailer_from_settings_picks_smtp_when_configured() {
        let mut settings = Settings {
            admins: vec!["ops@example.com".to_string()],
            ..Settings::default()
        };
        assert_eq!(mailer_from_settings(&settings).unwrap().name(), "log");

        settings.smtp = Some(SmtpSettings {
            host: "localhost".to_string(),
            port: 1025,
            username: None,
            password: None,
        });
        assert_eq!(mailer_from_settings(&settings).unwrap().name(), "smtp");
    }

    #[test]
    fn test_smtp_mailer_without_admins_skips_delivery() {
        let config = SmtpSettings {
            host: "localhost".to_string(),
            port: 1025,
            username: None,
            password: None,
        };
        let mailer = SmtpMailer::new(&config, Vec::new(), "forms@example.com").unwrap();
        assert!(mailer.mail_admins("subject", "body").is_ok());
    }

    #[test]
    fn test_log_mailer_without_admins_is_silent() {
        let mailer = LogMailer::new(Vec::new(), "webmaster@localhost");
        assert!(mailer.mail_admins("subject", "body").is_ok());
    }
}
