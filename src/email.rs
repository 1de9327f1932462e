//! Outbound notification email.
//!
//! The tracker only ever calls [`Notifier::queue`], which never blocks and
//! never fails from the caller's point of view. Delivery happens on a
//! background task draining an [`EmailQueue`].

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Attachment, Mailbox, Message, MultiPart, SinglePart, header::ContentType},
    transport::smtp::{authentication::Credentials, client::TlsParametersBuilder},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// File attached to an email job
#[derive(Debug, Clone, PartialEq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailJob {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachment: Option<EmailAttachment>,
}

/// Fire-and-forget email submission
pub trait Notifier: Send + Sync {
    fn queue(&self, job: EmailJob);
}

/// Something that can actually deliver a job
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, job: &EmailJob) -> Result<()>;
}

/// Create a properly formatted Mailbox with display name
fn create_mailbox(name: Option<&str>, email: &str) -> Result<Mailbox> {
    let address = email
        .parse()
        .map_err(|e| anyhow!("Invalid email address '{}': {}", email, e))?;
    Ok(Mailbox::new(name.map(str::to_string), address))
}

pub struct EmailService {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl EmailService {
    /// Configure SMTP from `SMTP_SERVER`, `SMTP_PORT`, `SMTP_USERNAME`,
    /// `SMTP_PASSWORD`, `FROM_EMAIL` and `FROM_NAME`
    pub fn new() -> Result<Self> {
        let smtp_server = std::env::var("SMTP_SERVER")
            .map_err(|_| anyhow!("SMTP_SERVER environment variable not set"))?;

        let smtp_port: u16 = std::env::var("SMTP_PORT")
            .unwrap_or_else(|_| "587".to_string())
            .parse()
            .map_err(|_| anyhow!("Invalid SMTP_PORT"))?;

        let smtp_username = std::env::var("SMTP_USERNAME")
            .map_err(|_| anyhow!("SMTP_USERNAME environment variable not set"))?;

        let smtp_password = std::env::var("SMTP_PASSWORD")
            .map_err(|_| anyhow!("SMTP_PASSWORD environment variable not set"))?;

        let from_email = std::env::var("FROM_EMAIL")
            .map_err(|_| anyhow!("FROM_EMAIL environment variable not set"))?;

        let from_name = std::env::var("FROM_NAME").unwrap_or_else(|_| "Skywatch".to_string());

        let creds = Credentials::new(smtp_username, smtp_password);

        // Port 1025: plain local relay (Mailpit)
        // Port 465: implicit TLS
        // Anything else: STARTTLS
        let mailer = if smtp_port == 1025 {
            info!("Using insecure SMTP connection for port 1025 without TLS");
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_server)
                .port(smtp_port)
                .tls(lettre::transport::smtp::client::Tls::None)
                .build()
        } else {
            let tls_params = TlsParametersBuilder::new(smtp_server.clone())
                .build()
                .map_err(|e| anyhow!("Failed to create TLS parameters: {}", e))?;
            let tls = if smtp_port == 465 {
                info!("Using implicit TLS (SMTPS) for port 465");
                lettre::transport::smtp::client::Tls::Wrapper(tls_params)
            } else {
                info!("Using STARTTLS for port {}", smtp_port);
                lettre::transport::smtp::client::Tls::Required(tls_params)
            };
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp_server)?
                .port(smtp_port)
                .credentials(creds)
                .tls(tls)
                .build()
        };

        Ok(Self {
            mailer,
            from_email,
            from_name,
        })
    }

    fn build_message(&self, job: &EmailJob) -> Result<Message> {
        let mut builder = Message::builder()
            .from(create_mailbox(Some(&self.from_name), &self.from_email)?)
            .subject(job.subject.clone());
        for recipient in &job.to {
            builder = builder.to(create_mailbox(None, recipient)?);
        }

        let message = match &job.attachment {
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(job.body.clone())?,
            Some(attachment) => {
                let part = Attachment::new(attachment.filename.clone()).body(
                    attachment.body.clone(),
                    ContentType::parse(&attachment.content_type)?,
                );
                builder.multipart(
                    MultiPart::mixed()
                        .singlepart(SinglePart::plain(job.body.clone()))
                        .singlepart(part),
                )?
            }
        };
        Ok(message)
    }
}

#[async_trait]
impl MailSender for EmailService {
    async fn send(&self, job: &EmailJob) -> Result<()> {
        let message = self.build_message(job)?;
        let response = self.mailer.send(message).await?;
        debug!(code = %response.code(), subject = %job.subject, "email delivered");
        Ok(())
    }
}

/// Bounded queue in front of a [`MailSender`], drained by one background task
#[derive(Clone)]
pub struct EmailQueue {
    tx: flume::Sender<EmailJob>,
}

impl EmailQueue {
    /// The worker stops once every clone of the queue has been dropped and
    /// the backlog is delivered
    pub fn spawn<S>(sender: S, capacity: usize) -> (Self, JoinHandle<()>)
    where
        S: MailSender + 'static,
    {
        let (tx, rx) = flume::bounded::<EmailJob>(capacity);

        let handle = tokio::spawn(async move {
            info!("Email queue worker started");
            let mut delivered = 0u64;
            while let Ok(job) = rx.recv_async().await {
                match sender.send(&job).await {
                    Ok(()) => {
                        delivered += 1;
                        metrics::counter!("tracker.email.sent_total").increment(1);
                    }
                    Err(e) => {
                        error!(subject = %job.subject, "Failed to send email: {:#}", e);
                        metrics::counter!("tracker.email.failed_total").increment(1);
                    }
                }
                metrics::gauge!("tracker.email.queue_depth").set(rx.len() as f64);
            }
            info!("Email queue worker stopped after delivering {} emails", delivered);
        });

        (Self { tx }, handle)
    }
}

impl Notifier for EmailQueue {
    fn queue(&self, job: EmailJob) {
        if job.to.is_empty() {
            return;
        }
        if let Err(e) = self.tx.try_send(job) {
            let job = e.into_inner();
            warn!(subject = %job.subject, "Email queue full or closed, dropping email");
            metrics::counter!("tracker.email.dropped_total").increment(1);
        }
    }
}

/// Logs jobs instead of sending them, used when email is disabled
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn queue(&self, job: EmailJob) {
        info!(
            to = ?job.to,
            subject = %job.subject,
            attachment = ?job.attachment.as_ref().map(|a| &a.filename),
            "email (not sent, email disabled)"
        );
    }
}
