//! Outbound email collaborator.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::AuthError;

#[derive(Debug, Clone, PartialEq)]
pub enum EmailKind {
    /// Passwordless one-time code, optionally with a magic link.
    Passwordless { code: String, link: Option<String> },
    /// Link confirming a username-password signup.
    VerifyEmail { link: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub tenant_id: String,
    pub to: String,
    pub kind: EmailKind,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), AuthError>;
}

/// Logs that a message was queued. Codes and links are never logged.
#[derive(Debug, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<(), AuthError> {
        let kind = match message.kind {
            EmailKind::Passwordless { .. } => "passwordless",
            EmailKind::VerifyEmail { .. } => "verify_email",
        };
        info!(tenant_id = %message.tenant_id, kind, "Email queued for delivery");
        Ok(())
    }
}

/// Keeps sent messages in memory.
#[derive(Debug, Default)]
pub struct MemoryEmailSender {
    messages: Mutex<Vec<EmailMessage>>,
}

impl MemoryEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<EmailMessage> {
        self.messages.lock().await.clone()
    }

    /// Most recent message sent to `to`.
    pub async fn last_to(&self, to: &str) -> Option<EmailMessage> {
        self.messages
            .lock()
            .await
            .iter()
            .rev()
            .find(|m| m.to == to)
            .cloned()
    }

    /// Code of the most recent passwordless message sent to `to`.
    pub async fn last_code_for(&self, to: &str) -> Option<String> {
        match self.last_to(to).await?.kind {
            EmailKind::Passwordless { code, .. } => Some(code),
            EmailKind::VerifyEmail { .. } => None,
        }
    }
}

#[async_trait]
impl EmailSender for MemoryEmailSender {
    async fn send(&self, message: EmailMessage) -> Result<(), AuthError> {
        LogEmailSender.send(message.clone()).await?;
        self.messages.lock().await.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sender_keeps_latest_code() {
        let sender = MemoryEmailSender::new();
        for code in ["111111", "222222"] {
            sender
                .send(EmailMessage {
                    tenant_id: "acme".to_string(),
                    to: "a@example.com".to_string(),
                    kind: EmailKind::Passwordless {
                        code: code.to_string(),
                        link: None,
                    },
                })
                .await
                .unwrap();
        }
        assert_eq!(
            sender.last_code_for("a@example.com").await.as_deref(),
            Some("222222")
        );
        assert!(sender.last_code_for("b@example.com").await.is_none());
        assert_eq!(sender.messages().await.len(), 2);
    }
}
