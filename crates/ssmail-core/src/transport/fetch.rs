//! Pulling recent mail from linked external mailboxes.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use tracing::{debug, info};

use super::session::{PullConnection, PullSession};
use crate::config::{LinkedAccount, Security};
use crate::message::{AttachmentMeta, NewMessage, normalize_address};
use crate::{Error, Result};

/// Label attached to every imported message.
pub const EXTERNAL_LABEL: &str = "external";

/// One message pulled from an external mailbox, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMail {
    /// Provider label of the linked account.
    pub provider: String,
    /// Sender address.
    pub from: String,
    /// Recipient addresses as they appear on the message.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
    /// `Date` header.
    pub date: Option<DateTime<Utc>>,
    /// `Message-ID` header, in angle brackets.
    pub message_id: Option<String>,
    /// Attachment metadata.
    pub attachments: Vec<AttachmentMeta>,
}

impl FetchedMail {
    /// Converts to an inbox message for `owner`, keeping the original sender.
    #[must_use]
    pub fn into_new_message(self, owner: &str) -> NewMessage {
        let mut message = NewMessage::new(self.from, [owner])
            .subject(self.subject)
            .body(self.body)
            .label(EXTERNAL_LABEL)
            .label(self.provider);
        message.date = self.date;
        message.message_id = self.message_id;
        message.attachments = self.attachments;
        message
    }
}

/// Parses raw RFC 5322 bytes into a [`FetchedMail`].
///
/// Returns `None` when the bytes do not parse or carry no sender address.
#[must_use]
pub fn parse_fetched(raw: &[u8], provider: &str) -> Option<FetchedMail> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed
        .from()
        .and_then(|list| list.first())
        .and_then(|addr| addr.address())
        .map(normalize_address)?;
    let to = parsed
        .to()
        .map(|list| {
            list.iter()
                .filter_map(|addr| addr.address())
                .map(normalize_address)
                .collect()
        })
        .unwrap_or_default();
    let date = parsed
        .date()
        .and_then(|d| DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok())
        .map(|d| d.with_timezone(&Utc));
    let body = parsed
        .body_text(0)
        .map(|s| s.into_owned())
        .unwrap_or_default();
    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(idx, part)| AttachmentMeta {
            filename: part
                .attachment_name()
                .map_or_else(|| format!("attachment_{idx}"), String::from),
            content_type: part.content_type().map_or_else(
                || "application/octet-stream".to_string(),
                |ct| match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_string(),
                },
            ),
            size: part.contents().len() as u64,
        })
        .collect();

    Some(FetchedMail {
        provider: provider.to_string(),
        from,
        to,
        subject: parsed.subject().unwrap_or_default().to_string(),
        body,
        date,
        message_id: parsed.message_id().map(|id| format!("<{id}>")),
        attachments,
    })
}

/// Source of recent external mail.
#[async_trait]
pub trait MailFetcher: Send + Sync {
    /// Fetches the newest `window` messages of `account`.
    ///
    /// `secret` is the already resolved login secret.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the mailbox cannot be read.
    async fn fetch_recent(
        &self,
        account: &LinkedAccount,
        secret: &str,
        window: usize,
    ) -> Result<Vec<FetchedMail>>;
}

/// Socket timeout used when no fetch timeout is configured.
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// IMAP fetcher. Each call opens its own session on the blocking pool.
///
/// Connect, read and write on the session socket are bounded by the I/O
/// timeout, so an unresponsive server releases the blocking thread.
#[derive(Debug, Clone, Copy)]
pub struct ImapFetcher {
    io_timeout: Duration,
}

impl ImapFetcher {
    /// A fetcher whose socket operations give up after `io_timeout`.
    #[must_use]
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            io_timeout: io_timeout.max(Duration::from_millis(1)),
        }
    }
}

impl Default for ImapFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_IO_TIMEOUT)
    }
}

#[async_trait]
impl MailFetcher for ImapFetcher {
    async fn fetch_recent(
        &self,
        account: &LinkedAccount,
        secret: &str,
        window: usize,
    ) -> Result<Vec<FetchedMail>> {
        let label = format!("{}/{}", account.provider, account.address);
        let io_timeout = self.io_timeout;
        let outcome = {
            let account = account.clone();
            let secret = secret.to_string();
            let session_label = label.clone();
            tokio::task::spawn_blocking(move || {
                PullSession::new(session_label).run(
                    || ImapConnection::open(&account, &secret, io_timeout),
                    window,
                )
            })
            .await
            .map_err(|e| Error::Transport(format!("{label}: pull task failed: {e}")))?
        };
        debug!("{label}: session {:?}", outcome.history);

        let raw = outcome.result?;
        let fetched: Vec<FetchedMail> = raw
            .iter()
            .filter_map(|bytes| parse_fetched(bytes, &account.provider))
            .collect();
        info!("{label}: fetched {} of {} messages", fetched.len(), raw.len());
        Ok(fetched)
    }
}

/// Session socket, plain or wrapped in TLS.
enum ImapStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl ImapStream {
    /// Wraps `tcp` in a TLS client session for `host`.
    ///
    /// The handshake runs on first use, under the socket timeouts.
    fn tls(host: &str, tcp: TcpStream) -> Result<Self> {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Transport(format!("IMAP: invalid server name {host}: {e}")))?;
        let conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| Error::Transport(format!("IMAP: TLS setup for {host} failed: {e}")))?;
        Ok(Self::Tls(Box::new(StreamOwned::new(conn, tcp))))
    }
}

impl Read for ImapStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for ImapStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

struct ImapConnection {
    session: imap::Session<ImapStream>,
}

impl ImapConnection {
    fn open(account: &LinkedAccount, secret: &str, io_timeout: Duration) -> Result<Self> {
        let host = account.host.as_str();
        let mut tcp = connect_tcp(host, account.port, io_timeout)?;
        let client = match account.security {
            Security::None => greeted(ImapStream::Plain(tcp))?,
            Security::Tls => greeted(ImapStream::tls(host, tcp)?)?,
            Security::StartTls => {
                upgrade_plaintext(&mut tcp).map_err(|e| io_error(host, &e))?;
                let mut client = imap::Client::new(ImapStream::tls(host, tcp)?);
                client.greeting_read = true;
                client
            }
        };
        let session = client
            .login(&account.username, secret)
            .map_err(|e| imap_error(e.0))?;
        Ok(Self { session })
    }
}

/// Connects to the first reachable address of `host`, with every socket
/// operation bounded by `timeout`.
fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| io_error(host, &e))?;
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                tcp.set_read_timeout(Some(timeout))
                    .and_then(|()| tcp.set_write_timeout(Some(timeout)))
                    .map_err(|e| io_error(host, &e))?;
                return Ok(tcp);
            }
            Err(e) => last_error = e,
        }
    }
    Err(io_error(host, &last_error))
}

fn greeted(stream: ImapStream) -> Result<imap::Client<ImapStream>> {
    let mut client = imap::Client::new(stream);
    client.read_greeting().map_err(imap_error)?;
    Ok(client)
}

const STARTTLS_TAG: &str = "s0";

/// Reads the greeting and negotiates STARTTLS on a fresh plaintext socket.
fn upgrade_plaintext(tcp: &mut TcpStream) -> io::Result<()> {
    let mut reader = BufReader::new(tcp.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if !line.starts_with("* OK") {
        return Err(io::Error::other(format!("unexpected greeting: {}", line.trim_end())));
    }
    tcp.write_all(format!("{STARTTLS_TAG} STARTTLS\r\n").as_bytes())?;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if let Some(status) = line.strip_prefix(STARTTLS_TAG).map(str::trim_start) {
            return if status.starts_with("OK") {
                Ok(())
            } else {
                Err(io::Error::other(format!("STARTTLS refused: {}", status.trim_end())))
            };
        }
    }
}

impl PullConnection for ImapConnection {
    fn fetch_recent(&mut self, window: usize) -> Result<Vec<Vec<u8>>> {
        let mailbox = self.session.examine("INBOX").map_err(imap_error)?;
        let exists = mailbox.exists;
        let window = u32::try_from(window).unwrap_or(u32::MAX);
        if exists == 0 || window == 0 {
            return Ok(Vec::new());
        }
        let first = exists - window.min(exists) + 1;
        let fetches = self
            .session
            .fetch(format!("{first}:{exists}"), "RFC822")
            .map_err(imap_error)?;
        let mut raw: Vec<Vec<u8>> = fetches
            .iter()
            .filter_map(|f| f.body().map(<[u8]>::to_vec))
            .collect();
        raw.reverse();
        Ok(raw)
    }

    fn close(&mut self) -> Result<()> {
        self.session.logout().map_err(imap_error)
    }
}

fn imap_error(e: imap::Error) -> Error {
    Error::Transport(format!("IMAP: {e}"))
}

fn io_error(host: &str, e: &io::Error) -> Error {
    Error::Transport(format!("IMAP: {host}: {e}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: Alice <Alice@External.com>\r\n\
To: bob@external.com, carol@external.com\r\n\
Subject: Quarterly numbers\r\n\
Date: Tue, 2 Jan 2024 10:00:00 +0000\r\n\
Message-ID: <abc123@external.com>\r\n\
\r\n\
See attached.\r\n";

    #[test]
    fn test_parse_fetched() {
        let mail = parse_fetched(RAW, "gmail").unwrap();
        assert_eq!(mail.provider, "gmail");
        assert_eq!(mail.from, "alice@external.com");
        assert_eq!(mail.to, vec!["bob@external.com", "carol@external.com"]);
        assert_eq!(mail.subject, "Quarterly numbers");
        assert!(mail.body.starts_with("See attached."));
        assert_eq!(mail.message_id.as_deref(), Some("<abc123@external.com>"));
        assert_eq!(mail.date.unwrap().to_rfc3339(), "2024-01-02T10:00:00+00:00");
        assert!(mail.attachments.is_empty());
    }

    #[test]
    fn test_parse_rejects_missing_sender() {
        assert!(parse_fetched(b"Subject: nobody\r\n\r\nbody\r\n", "gmail").is_none());
    }

    #[test]
    fn test_into_new_message() {
        let message = parse_fetched(RAW, "gmail")
            .unwrap()
            .into_new_message("bob@ssm.com");
        assert_eq!(message.from, "alice@external.com");
        assert_eq!(message.to, vec!["bob@ssm.com"]);
        assert!(message.labels.contains(EXTERNAL_LABEL));
        assert!(message.labels.contains("gmail"));
        assert_eq!(message.message_id.as_deref(), Some("<abc123@external.com>"));
        assert!(message.folder.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let account = LinkedAccount {
            owner: "bob@ssm.com".into(),
            provider: "local".into(),
            address: "bob@external.com".into(),
            host: "127.0.0.1".into(),
            port: 1,
            security: Security::None,
            username: "bob".into(),
            secret: None,
        };
        let err = ImapFetcher::default()
            .fetch_recent(&account, "pw", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    fn silent_account(port: u16, security: Security) -> LinkedAccount {
        LinkedAccount {
            owner: "bob@ssm.com".into(),
            provider: "local".into(),
            address: "bob@external.com".into(),
            host: "127.0.0.1".into(),
            port,
            security,
            username: "bob".into(),
            secret: None,
        }
    }

    #[test]
    fn test_silent_server_times_out() {
        // Accepts the connection but never sends a greeting.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        for security in [Security::None, Security::StartTls] {
            let started = std::time::Instant::now();
            let result = ImapConnection::open(
                &silent_account(port, security),
                "pw",
                Duration::from_millis(200),
            );
            assert!(matches!(result, Err(Error::Transport(_))));
            assert!(started.elapsed() < Duration::from_secs(10));
        }
        drop(listener);
    }

    #[tokio::test]
    async fn test_fetch_from_silent_server_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let fetcher = ImapFetcher::new(Duration::from_millis(200));
        let err = fetcher
            .fetch_recent(&silent_account(port, Security::None), "pw", 5)
            .await
            .unwrap_err();
        let Error::Transport(message) = err else {
            panic!("expected a transport error");
        };
        assert!(message.contains("IMAP"));
        drop(listener);
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let fetcher = ImapFetcher::new(Duration::ZERO);
        assert!(fetcher.io_timeout > Duration::ZERO);
    }
}
