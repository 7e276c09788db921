//! # ssmail-core
//!
//! Mail persistence and routing core for the ssmail webmail backend.
//!
//! This crate provides:
//! - Folder-partitioned message storage over two backends (an embedded
//!   document store and an SQL fallback)
//! - One-time backend selection by write probing, with a degraded mode
//! - Delivery routing between local mailboxes and external SMTP providers
//! - Pulling recent mail from linked IMAP accounts
//! - A facade returning `{success, ...}` envelopes for an HTTP layer

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod clock;
pub mod config;
mod error;
pub mod message;
pub mod router;
pub mod service;
pub mod store;
pub mod transport;

pub use backend::{BackendMode, BackendSelector};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::CoreConfig;
pub use error::{Error, ErrorKind, Result};
pub use message::{Folder, Message, MessageId, MessagePatch, NewMessage, ThreadId};
pub use router::{DeliveryRecord, DeliveryRouter, RecipientKind, RouteOptions, RouteOutcome};
pub use service::{Compose, MailListOptions, MailService, Reply};
pub use store::{ListQuery, MailStatistics, MailStore, MessagePage};
pub use transport::{MailTransport, StubTransport, TransportRegistry};
