//! Outbound SMTP transports and inbound pulls from linked mailboxes.

pub mod credentials;
mod fetch;
mod outgoing;
mod registry;
mod session;
mod smtp;
mod stub;

pub use fetch::{EXTERNAL_LABEL, FetchedMail, ImapFetcher, MailFetcher, parse_fetched};
pub use outgoing::{MailTransport, OutgoingMessage, SendReceipt};
pub use registry::{ProviderHealth, Selection, TransportRegistry};
pub use session::{PullConnection, PullOutcome, PullSession, SessionState};
pub use smtp::SmtpTransport;
pub use stub::StubTransport;
