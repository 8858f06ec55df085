/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::Account;
use crate::errors::ProtocolError;
use crate::stream_store::MessageRow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::warn;

/// Guideline (not a hard limit) for how many items a plugin downloads per
/// refresh before stopping pagination.
pub const DOWNLOAD_LIMIT: usize = 50;

/// Address-book entry produced by `fetch_contacts`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub account_id: String,
    pub protocol: String,
    pub contact_id: String,
    pub full_name: String,
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

/// Per-operation handle a plugin publishes rows through.
///
/// The sink stamps the owning protocol and account onto each row and
/// linkifies the body, so plugins only fill in what they parsed off the wire.
pub struct RowSink {
    protocol: String,
    account_id: String,
    tx: mpsc::Sender<MessageRow>,
}

impl RowSink {
    pub(crate) fn channel(account: &Account, protocol: &str) -> (Self, mpsc::Receiver<MessageRow>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Self {
                protocol: protocol.to_string(),
                account_id: account.id.clone(),
                tx,
            },
            rx,
        )
    }

    /// Publish one row. Returns false when the row was rejected (missing id)
    /// or the consuming side has gone away, which a paging loop should treat
    /// as its signal to stop.
    pub async fn publish(&self, mut row: MessageRow) -> bool {
        if row.message_id.trim().is_empty() {
            warn!(protocol = %self.protocol, "dropping row without message id");
            return false;
        }
        row.protocol = self.protocol.clone();
        if !row.account_ids.contains(&self.account_id) {
            row.account_ids.push(self.account_id.clone());
        }
        row.message = linkify(&row.message);
        if row.timestamp.is_empty() {
            row.timestamp = iso_now();
        }
        self.tx.send(row).await.is_ok()
    }
}

/// Per-operation handle for streaming contacts to the address-book consumer.
pub struct ContactSink {
    protocol: String,
    account_id: String,
    tx: mpsc::Sender<Contact>,
}

impl ContactSink {
    pub(crate) fn channel(account: &Account, protocol: &str) -> (Self, mpsc::Receiver<Contact>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Self {
                protocol: protocol.to_string(),
                account_id: account.id.clone(),
                tx,
            },
            rx,
        )
    }

    pub async fn publish(&self, mut contact: Contact) -> bool {
        contact.protocol = self.protocol.clone();
        contact.account_id = self.account_id.clone();
        self.tx.send(contact).await.is_ok()
    }
}

/// The uniform surface every network plugin implements. The dispatcher never
/// special-cases a network: everything it needs is reachable through here.
///
/// All methods may block on the network. `refresh` and `fetch_contacts` page
/// through the remote service and push results into their sink until done or
/// until the [`DOWNLOAD_LIMIT`] guideline is reached; neither is restartable
/// mid-sequence.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Stable lowercase identifier, matching `Account::protocol`.
    fn name(&self) -> &'static str;

    /// Operation names this plugin supports, for the features listing.
    fn features(&self) -> Vec<&'static str> {
        vec!["refresh"]
    }

    /// Fetch new content for the account, publishing zero or more rows.
    async fn refresh(&self, account: &Account, sink: &RowSink) -> Result<(), ProtocolError>;

    /// Post outbound content. On success the returned row represents the
    /// posted message so the caller can merge it without waiting for the
    /// next refresh.
    async fn send(
        &self,
        _account: &Account,
        _message: &str,
        _reply_to: Option<&str>,
    ) -> Result<MessageRow, ProtocolError> {
        Err(ProtocolError::UnsupportedAction("send".to_string()))
    }

    /// Name-based verb dispatch (like, retweet, delete, ...).
    async fn perform_action(
        &self,
        _account: &Account,
        action: &str,
        _message_id: &str,
    ) -> Result<String, ProtocolError> {
        Err(ProtocolError::UnsupportedAction(action.to_string()))
    }

    /// Stream the account's contacts to the address-book consumer. Returns
    /// the number published.
    async fn fetch_contacts(
        &self,
        _account: &Account,
        _sink: &ContactSink,
    ) -> Result<u64, ProtocolError> {
        Ok(0)
    }

    /// Purge plugin-private avatar caches older than the threshold. The
    /// shared avatar cache is swept by the dispatcher itself; most plugins
    /// keep the default.
    async fn expire_avatars(
        &self,
        _account: &Account,
        _older_than: Duration,
    ) -> Result<u64, ProtocolError> {
        Ok(0)
    }
}

/// Static name → plugin table, populated at startup. New networks are added
/// by registering an implementation here, not by discovery.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    map: HashMap<String, Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: Arc<dyn Protocol>) {
        self.map.insert(protocol.name().to_string(), protocol);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.map.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.map.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn features(&self, name: &str) -> Option<Vec<&'static str>> {
        self.map.get(name).map(|p| {
            let mut features = p.features();
            features.sort_unstable();
            features
        })
    }
}

/// Current time in the row timestamp format.
pub fn iso_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

const URL_PREFIXES: &[&str] = &["https://", "http://", "ftp://", "www."];
const TRAILING_PUNCT: &[char] = &['.', ',', '!', '?', ')'];

/// Byte ranges of bare URLs in `text`, longest-sensible extent: up to the
/// next whitespace, minus trailing punctuation. URLs preceded by `"` or `>`
/// are skipped, as they are already inside an anchor.
pub fn find_urls(text: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < text.len() {
        let Some(start) = URL_PREFIXES
            .iter()
            .filter_map(|p| text[at..].find(p).map(|i| at + i))
            .min()
        else {
            break;
        };
        let end = text[start..]
            .find(char::is_whitespace)
            .map(|i| start + i)
            .unwrap_or(text.len());
        let trimmed = text[start..end].trim_end_matches(TRAILING_PUNCT);
        let end = start + trimmed.len();

        let preceded_by_markup = text[..start]
            .chars()
            .next_back()
            .map(|c| c == '"' || c == '>')
            .unwrap_or(false);
        if !preceded_by_markup && !trimmed.ends_with("</a>") && end > start {
            out.push((start, end));
        }
        at = end.max(start + 1);
    }
    out
}

/// Wrap bare URLs in a message body into HTML anchors, leaving text that is
/// already linkified alone.
pub fn linkify(text: &str) -> String {
    let ranges = find_urls(text);
    if ranges.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + ranges.len() * 16);
    let mut at = 0;
    for (start, end) in ranges {
        out.push_str(&text[at..start]);
        let url = &text[start..end];
        out.push_str(&format!("<a href=\"{url}\">{url}</a>"));
        at = end;
    }
    out.push_str(&text[at..]);
    out
}
