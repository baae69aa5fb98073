//! Async mail queue
//!
//! Backs the mail_async action: messages enqueue without blocking the
//! guarded section and a background worker relays them, logging failures.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Clone)]
pub struct Mailer {
    tx: mpsc::UnboundedSender<OutboundMail>,
}

impl Mailer {
    /// Spawn the relay worker. When `relay_url` is unset messages are only
    /// logged, which keeps test and dev environments quiet.
    pub fn spawn(relay_url: Option<String>, client: reqwest::Client) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMail>();
        tokio::spawn(async move {
            while let Some(mail) = rx.recv().await {
                match &relay_url {
                    Some(url) => {
                        if let Err(e) = client.post(url).json(&mail).send().await {
                            warn!(to = %mail.to, error = %e, "Mail relay failed");
                        }
                    }
                    None => info!(to = %mail.to, subject = %mail.subject, "Mail queued without relay"),
                }
            }
        });
        Self { tx }
    }

    pub fn queue(&self, mail: OutboundMail) {
        let _ = self.tx.send(mail);
    }
}
