//! Recipient classification and delivery fan-out.
//!
//! A routed message is split by recipient domain. Internal recipients get
//! an inbox copy through the active [`MailStore`], blind copies one each so
//! no stored copy names a blind recipient to anyone else; external recipients are
//! handed to a transport from the [`TransportRegistry`], and a successful
//! send is recorded in the sender's sent folder. Each class attempted yields
//! exactly one [`RouteOutcome`], whatever happened to it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::message::{
    AttachmentMeta, Folder, MessageId, NewMessage, Priority, address_domain,
    generate_message_token, normalize_address,
};
use crate::store::MailStore;
use crate::transport::{MailTransport, OutgoingMessage, SendReceipt, TransportRegistry};
use crate::{Error, Result};

/// Label on sender copies.
pub const SENT_LABEL: &str = "sent";

/// Which delivery path a recipient takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    /// Mailbox served by local storage.
    Internal,
    /// Mailbox reached through a transport.
    External,
}

/// Optional parts of a routed message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteOptions {
    /// Carbon-copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    pub bcc: Vec<String>,
    /// Importance.
    pub priority: Priority,
    /// Token of the message being replied to.
    pub in_reply_to: Option<String>,
    /// Attachment metadata.
    pub attachments: Vec<AttachmentMeta>,
    /// Token to send under; generated when absent.
    pub message_id: Option<String>,
}

/// Outcome of one delivery class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    /// Whether the class was delivered.
    pub success: bool,
    /// Stored copy written for this class.
    pub mail_id: Option<MessageId>,
    /// Transport that sent the external leg.
    pub provider_used: Option<String>,
    /// Identifier the transport sent under.
    pub transport_message_id: Option<String>,
    /// Whether the designated fallback transport was used.
    pub used_fallback: bool,
    /// Failure detail.
    pub error: Option<String>,
    /// Non-fatal problem, e.g. a sent message whose record was not stored.
    pub warning: Option<String>,
}

impl DeliveryRecord {
    fn failed(error: &Error) -> Self {
        Self {
            error: Some(error.public_message()),
            ..Self::default()
        }
    }
}

/// One entry of a route result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOutcome {
    /// Recipient class.
    #[serde(rename = "type")]
    pub kind: RecipientKind,
    /// What happened to it.
    pub result: DeliveryRecord,
}

/// Splits recipients and dispatches each class.
pub struct DeliveryRouter {
    store: Arc<dyn MailStore>,
    transports: Arc<TransportRegistry>,
    internal_domains: Vec<String>,
    send_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl DeliveryRouter {
    /// Creates a router delivering internal mail to `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn MailStore>,
        transports: Arc<TransportRegistry>,
        internal_domains: Vec<String>,
        send_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            transports,
            internal_domains: internal_domains
                .iter()
                .map(|d| d.trim().to_lowercase())
                .collect(),
            send_timeout,
            clock,
        }
    }

    /// Internal when the domain is one of the system's own.
    #[must_use]
    pub fn classify(&self, address: &str) -> RecipientKind {
        match address_domain(address) {
            Some(domain) if self.internal_domains.iter().any(|d| d.eq_ignore_ascii_case(domain)) => {
                RecipientKind::Internal
            }
            _ => RecipientKind::External,
        }
    }

    /// Delivers to every recipient class present in `to`, `cc` and `bcc`.
    ///
    /// Never fails: problems are reported per class in the returned
    /// outcomes, internal first.
    pub async fn route(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        body: &str,
        options: RouteOptions,
    ) -> Vec<RouteOutcome> {
        let from = normalize_address(from);
        let token = options
            .message_id
            .clone()
            .unwrap_or_else(|| generate_message_token(self.clock.now()));

        let split = Split::new(self, to, &options);
        let mut outcomes = Vec::with_capacity(2);

        if split.has_internal() {
            let result = self
                .deliver_internal(&from, &split, subject, body, &options, &token)
                .await;
            outcomes.push(RouteOutcome {
                kind: RecipientKind::Internal,
                result,
            });
        }

        if split.has_external() {
            let result = self
                .deliver_external(&from, to, &split, subject, body, &options, &token)
                .await;
            outcomes.push(RouteOutcome {
                kind: RecipientKind::External,
                result,
            });
        }

        outcomes
    }

    /// Stores the shared copy for visible recipients and one private copy
    /// per blind recipient. The record points at the first stored copy and
    /// fails if any copy could not be stored.
    async fn deliver_internal(
        &self,
        from: &str,
        split: &Split,
        subject: &str,
        body: &str,
        options: &RouteOptions,
        token: &str,
    ) -> DeliveryRecord {
        let mut copies = Vec::with_capacity(1 + split.internal_bcc.len());
        if !split.internal.is_empty() {
            copies.push(split.internal.clone());
        }
        copies.extend(split.internal_bcc.iter().map(|addr| vec![addr.clone()]));

        let mut record = DeliveryRecord {
            success: true,
            ..DeliveryRecord::default()
        };
        let mut delivered = 0;
        for recipients in copies {
            let count = recipients.len();
            let mut message = NewMessage::new(from, recipients).subject(subject).body(body);
            message.cc = options.cc.clone();
            message.priority = options.priority;
            message.in_reply_to = options.in_reply_to.clone();
            message.attachments = options.attachments.clone();
            message.message_id = Some(token.to_string());

            match self.store.create(message).await {
                Ok(id) => {
                    delivered += count;
                    record.mail_id.get_or_insert(id);
                }
                Err(e) => {
                    warn!("Internal delivery of {token} failed: {e}");
                    record.success = false;
                    record.error.get_or_insert_with(|| e.public_message());
                }
            }
        }
        info!("Delivered {token} to {delivered} internal recipient(s)");
        record
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_external(
        &self,
        from: &str,
        to: &[String],
        split: &Split,
        subject: &str,
        body: &str,
        options: &RouteOptions,
        token: &str,
    ) -> DeliveryRecord {
        let Some(selection) = self.transports.resolve(from) else {
            let e = Error::Transport("no transport available".into());
            warn!("External delivery of {token} skipped: {e}");
            return DeliveryRecord::failed(&e);
        };
        if selection.used_fallback {
            warn!("No provider for {from}, sending {token} through fallback transport");
        }

        let mut outgoing = OutgoingMessage::new(from, subject, body, token);
        outgoing.to.clone_from(&split.external_to);
        outgoing.cc.clone_from(&split.external_cc);
        outgoing.bcc.clone_from(&split.external_bcc);
        outgoing.in_reply_to.clone_from(&options.in_reply_to);

        let receipt = match self.send(&selection.transport, &outgoing).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("External delivery of {token} via {} failed: {e}", selection.transport.name());
                return DeliveryRecord {
                    provider_used: Some(selection.transport.name().to_string()),
                    used_fallback: selection.used_fallback,
                    ..DeliveryRecord::failed(&e)
                };
            }
        };
        info!(
            "Sent {token} to {} external recipient(s) via {}",
            split.external_count(),
            receipt.provider
        );

        let mut record = DeliveryRecord {
            success: true,
            provider_used: Some(receipt.provider.clone()),
            transport_message_id: Some(receipt.message_id.clone()),
            used_fallback: selection.used_fallback,
            ..DeliveryRecord::default()
        };
        match self.store.create(sent_copy(from, to, subject, body, options, &receipt)).await {
            Ok(id) => record.mail_id = Some(id),
            Err(e) => {
                warn!("Sent {token} but could not store the sent record: {e}");
                record.warning = Some(format!("sent but not recorded: {}", e.public_message()));
            }
        }
        record
    }

    async fn send(
        &self,
        transport: &Arc<dyn MailTransport>,
        outgoing: &OutgoingMessage,
    ) -> Result<SendReceipt> {
        tokio::time::timeout(self.send_timeout, transport.send(outgoing))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "send via {} exceeded {:?}",
                    transport.name(),
                    self.send_timeout
                ))
            })?
    }
}

/// Sender copy of an externally sent message.
fn sent_copy(
    from: &str,
    to: &[String],
    subject: &str,
    body: &str,
    options: &RouteOptions,
    receipt: &SendReceipt,
) -> NewMessage {
    let mut message = NewMessage::new(from, to.iter().cloned())
        .subject(subject)
        .body(body)
        .in_folder(Folder::Sent)
        .label(SENT_LABEL)
        .label(receipt.provider.clone());
    message.cc = options.cc.clone();
    message.bcc = options.bcc.clone();
    message.priority = options.priority;
    message.in_reply_to = options.in_reply_to.clone();
    message.attachments = options.attachments.clone();
    message.message_id = Some(receipt.message_id.clone());
    message.is_read = true;
    message
}

/// Recipients grouped by class.
struct Split {
    /// Internal addresses from `to` and `cc`, deduplicated.
    internal: Vec<String>,
    /// Internal blind recipients not already listed in `internal`.
    internal_bcc: Vec<String>,
    external_to: Vec<String>,
    external_cc: Vec<String>,
    external_bcc: Vec<String>,
}

impl Split {
    fn new(router: &DeliveryRouter, to: &[String], options: &RouteOptions) -> Self {
        let mut seen = BTreeSet::new();
        let mut split_list = |list: &[String]| -> (Vec<String>, Vec<String>) {
            let mut inside = Vec::new();
            let mut outside = Vec::new();
            for addr in list.iter().map(|a| normalize_address(a)).filter(|a| !a.is_empty()) {
                match router.classify(&addr) {
                    RecipientKind::Internal => {
                        if seen.insert(addr.clone()) {
                            inside.push(addr);
                        }
                    }
                    RecipientKind::External => outside.push(addr),
                }
            }
            (inside, outside)
        };
        let (mut internal, external_to) = split_list(to);
        let (internal_cc, external_cc) = split_list(&options.cc);
        let (internal_bcc, external_bcc) = split_list(&options.bcc);
        internal.extend(internal_cc);
        Self {
            internal,
            internal_bcc,
            external_to,
            external_cc,
            external_bcc,
        }
    }

    fn has_internal(&self) -> bool {
        !self.internal.is_empty() || !self.internal_bcc.is_empty()
    }

    fn external_count(&self) -> usize {
        self.external_to.len() + self.external_cc.len() + self.external_bcc.len()
    }

    fn has_external(&self) -> bool {
        self.external_count() > 0
    }
}
