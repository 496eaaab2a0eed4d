use crate::error::{NotifyError, Result};
use crate::NotificationChannel;
use async_trait::async_trait;
use lettre::message::MultiPart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use virtmon_common::types::Alert;

/// SMTP transport settings. TLS is always required: `secure` selects
/// implicit TLS versus STARTTLS, never plaintext.
#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    /// Comma-separated recipient list.
    pub to: String,
}

pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    recipients: Vec<String>,
}

impl EmailChannel {
    pub fn new(settings: &EmailSettings) -> Result<Self> {
        if settings.host.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("smtp host is empty".into()));
        }
        if settings.from.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("from address is empty".into()));
        }
        let recipients = parse_recipients(&settings.to);
        if recipients.is_empty() {
            return Err(NotifyError::InvalidConfig("no recipients configured".into()));
        }

        let mut builder = if settings.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        }
        .map_err(|e| NotifyError::Smtp(e.to_string()))?
        .port(settings.port);

        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from: settings.from.clone(),
            recipients,
        })
    }

    fn subject(alert: &Alert, urgent: bool) -> String {
        let tag = if urgent { "[ESCALATED]" } else { "" };
        format!(
            "[virtmon]{tag} {} - {} ({})",
            alert.rule.name, alert.guest.name, alert.guest.vmid
        )
    }

    fn plain_body(alert: &Alert) -> String {
        format!(
            "Alert: {rule}\nGuest: {guest} (vmid {vmid}) on {node}\nState: {state}\nValue: {value}\nThreshold: {threshold}\nSince: {since}",
            rule = alert.rule.name,
            guest = alert.guest.name,
            vmid = alert.guest.vmid,
            node = alert.guest.node,
            state = alert.state,
            value = alert.current_value,
            threshold = alert.effective_threshold,
            since = alert.start_time,
        )
    }

    fn html_body(alert: &Alert, urgent: bool) -> String {
        let color = if urgent { "#c0392b" } else { "#e67e22" };
        format!(
            "<h2 style=\"color:{color}\">{rule}</h2>\
             <table>\
             <tr><td>Guest</td><td>{guest} (vmid {vmid}) on {node}</td></tr>\
             <tr><td>State</td><td>{state}</td></tr>\
             <tr><td>Value</td><td>{value}</td></tr>\
             <tr><td>Threshold</td><td>{threshold}</td></tr>\
             <tr><td>Since</td><td>{since}</td></tr>\
             </table>",
            rule = alert.rule.name,
            guest = alert.guest.name,
            vmid = alert.guest.vmid,
            node = alert.guest.node,
            state = alert.state,
            value = alert.current_value,
            threshold = alert.effective_threshold,
            since = alert.start_time,
        )
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    async fn send(&self, alert: &Alert, urgent: bool) -> Result<()> {
        let subject = Self::subject(alert, urgent);
        let plain = Self::plain_body(alert);
        let html = Self::html_body(alert, urgent);

        for recipient in &self.recipients {
            let message = Message::builder()
                .from(self.from.parse()?)
                .to(recipient.parse()?)
                .subject(&subject)
                .multipart(MultiPart::alternative_plain_html(
                    plain.clone(),
                    html.clone(),
                ))
                .map_err(|e| NotifyError::Smtp(e.to_string()))?;

            self.transport
                .send(message)
                .await
                .map_err(|e| NotifyError::Smtp(e.to_string()))?;
            tracing::debug!(recipient = %recipient, alert_id = %alert.id, "Email sent");
        }
        Ok(())
    }

    fn channel_name(&self) -> &'static str {
        "email"
    }
}

/// Split a comma-separated recipient list, dropping empty entries.
pub fn parse_recipients(to: &str) -> Vec<String> {
    to.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
