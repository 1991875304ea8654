use std::io::{Read, Write};
use std::net::TcpStream;

use mailparse::{DispositionType, ParsedMail};
use thiserror::Error;

use crate::config::MailboxConfig;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("retrieval failed: {0}")]
    Retrieval(String),
}

/// An attachment pulled from an unseen message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
}

/// What a MIME part is, as far as report extraction cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartKind {
    Attachment { filename: String },
    Inline,
    Other,
}

/// Classifies a leaf MIME part. The filename comes from the
/// Content-Disposition parameters, falling back to the Content-Type
/// `name` parameter some report senders use instead.
pub fn classify_part(part: &ParsedMail) -> PartKind {
    let disposition = part.get_content_disposition();
    match disposition.disposition {
        DispositionType::Attachment => {
            let filename = disposition
                .params
                .get("filename")
                .or_else(|| part.ctype.params.get("name"))
                .cloned()
                .unwrap_or_default();
            PartKind::Attachment { filename }
        }
        DispositionType::Inline => PartKind::Inline,
        _ => PartKind::Other,
    }
}

/// Walks a parsed message and collects its attachment parts. Inline and
/// other parts are ignored.
pub fn collect_attachments(mail: &ParsedMail, out: &mut Vec<Attachment>) {
    if mail.subparts.is_empty() {
        if let PartKind::Attachment { filename } = classify_part(mail) {
            match mail.get_body_raw() {
                Ok(data) => out.push(Attachment { filename, data }),
                Err(e) => log::warn!("Failed to read attachment body: {e}"),
            }
        }
        return;
    }
    for part in &mail.subparts {
        collect_attachments(part, out);
    }
}

/// Transport collaborator the fetch orchestrator talks to.
///
/// Implementations own their connection lifetime details; `disconnect`
/// must be safe to call on any connection handed out by `connect`, even
/// one whose mailbox operations have already failed.
pub trait MailboxSource {
    type Connection: Send;

    fn connect(&self, config: &MailboxConfig) -> Result<Self::Connection, MailboxError>;

    fn list_unseen_attachments(
        &self,
        conn: &mut Self::Connection,
    ) -> Result<Vec<Attachment>, MailboxError>;

    fn disconnect(&self, conn: Self::Connection);
}

pub enum ImapConnection {
    Tls(Box<imap::Session<native_tls::TlsStream<TcpStream>>>, String),
    Plain(imap::Session<TcpStream>, String),
}

/// Production [`MailboxSource`] over IMAP.
#[derive(Debug, Default)]
pub struct ImapSource;

impl ImapSource {
    pub fn new() -> Self {
        ImapSource
    }
}

impl MailboxSource for ImapSource {
    type Connection = ImapConnection;

    fn connect(&self, config: &MailboxConfig) -> Result<ImapConnection, MailboxError> {
        let addr = (config.host.as_str(), config.port);

        let conn = if config.use_tls {
            let tls = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| MailboxError::Connection(e.to_string()))?;
            let client = imap::connect(addr, &config.host, &tls)
                .map_err(|e| MailboxError::Connection(e.to_string()))?;
            let session = client
                .login(&config.username, &config.password)
                .map_err(|(e, _)| MailboxError::Connection(format!("login failed: {e}")))?;
            ImapConnection::Tls(Box::new(session), config.mailbox.clone())
        } else {
            let tcp = TcpStream::connect(addr)
                .map_err(|e| MailboxError::Connection(e.to_string()))?;
            let client = imap::Client::new(tcp);
            let session = client
                .login(&config.username, &config.password)
                .map_err(|(e, _)| MailboxError::Connection(format!("login failed: {e}")))?;
            ImapConnection::Plain(session, config.mailbox.clone())
        };

        log::debug!("Connected to {}:{}", config.host, config.port);
        Ok(conn)
    }

    fn list_unseen_attachments(
        &self,
        conn: &mut ImapConnection,
    ) -> Result<Vec<Attachment>, MailboxError> {
        match conn {
            ImapConnection::Tls(session, mailbox) => fetch_unseen(session, mailbox),
            ImapConnection::Plain(session, mailbox) => fetch_unseen(session, mailbox),
        }
    }

    fn disconnect(&self, conn: ImapConnection) {
        let result = match conn {
            ImapConnection::Tls(mut session, _) => session.logout(),
            ImapConnection::Plain(mut session, _) => session.logout(),
        };
        if let Err(e) = result {
            log::debug!("Logout failed: {e}");
        }
    }
}

fn fetch_unseen<T: Read + Write>(
    session: &mut imap::Session<T>,
    mailbox: &str,
) -> Result<Vec<Attachment>, MailboxError> {
    let mbox = session
        .select(mailbox)
        .map_err(|e| MailboxError::Retrieval(format!("select {mailbox} failed: {e}")))?;
    if mbox.exists == 0 {
        log::debug!("No messages in {mailbox}");
        return Ok(Vec::new());
    }

    let unseen = session
        .search("UNSEEN")
        .map_err(|e| MailboxError::Retrieval(format!("search failed: {e}")))?;
    if unseen.is_empty() {
        log::debug!("No new messages in {mailbox}");
        return Ok(Vec::new());
    }
    log::info!("Found {} new message(s) in {mailbox}", unseen.len());

    let sequence = unseen
        .iter()
        .map(|seq| seq.to_string())
        .collect::<Vec<_>>()
        .join(",");

    // RFC822 without .PEEK marks the messages seen, so the next cycle
    // only considers mail that arrived in between.
    let messages = session
        .fetch(sequence, "RFC822")
        .map_err(|e| MailboxError::Retrieval(format!("fetch failed: {e}")))?;

    let mut attachments = Vec::new();
    for message in messages.iter() {
        let body = match message.body() {
            Some(body) => body,
            None => {
                log::warn!("Server returned no body for message {}", message.message);
                continue;
            }
        };
        match mailparse::parse_mail(body) {
            Ok(parsed) => collect_attachments(&parsed, &mut attachments),
            Err(e) => log::warn!("Skipping unreadable message {}: {e}", message.message),
        }
    }

    Ok(attachments)
}
