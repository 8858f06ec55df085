/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! A network-free protocol used by the service's test mode and the test
//! suite. Generates deterministic rows locally instead of talking to a real
//! social network.

use crate::account::Account;
use crate::errors::ProtocolError;
use crate::protocol::{Contact, ContactSink, Protocol, RowSink, DOWNLOAD_LIMIT};
use crate::stream_store::MessageRow;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct MockProtocol {
    seq: AtomicU64,
    refresh_calls: AtomicU64,
    rows_per_refresh: u64,
    delay: Duration,
}

impl Default for MockProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProtocol {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            refresh_calls: AtomicU64::new(0),
            rows_per_refresh: 3,
            delay: Duration::ZERO,
        }
    }

    /// Simulate a slow network on every operation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_rows_per_refresh(mut self, rows: u64) -> Self {
        self.rows_per_refresh = rows;
        self
    }

    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Protocol for MockProtocol {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn features(&self) -> Vec<&'static str> {
        vec!["refresh", "send", "send_thread", "like", "contacts"]
    }

    async fn refresh(&self, _account: &Account, sink: &RowSink) -> Result<(), ProtocolError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        for _ in 0..self.rows_per_refresh.min(DOWNLOAD_LIMIT as u64) {
            let n = self.next_id();
            sink.publish(MessageRow {
                message_id: format!("mock-{n}"),
                stream: "messages".to_string(),
                sender: "Mock User".to_string(),
                sender_nick: "mock".to_string(),
                message: format!("mock message {n}"),
                ..Default::default()
            })
            .await;
        }
        Ok(())
    }

    async fn send(
        &self,
        _account: &Account,
        message: &str,
        reply_to: Option<&str>,
    ) -> Result<MessageRow, ProtocolError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.next_id();
        Ok(MessageRow {
            message_id: format!("mock-sent-{n}"),
            stream: "messages".to_string(),
            sender: "Mock User".to_string(),
            message: message.to_string(),
            reply_to: reply_to.unwrap_or_default().to_string(),
            ..Default::default()
        })
    }

    async fn perform_action(
        &self,
        _account: &Account,
        action: &str,
        message_id: &str,
    ) -> Result<String, ProtocolError> {
        match action {
            "like" | "unlike" => Ok(format!("{action} {message_id}")),
            other => Err(ProtocolError::UnsupportedAction(other.to_string())),
        }
    }

    async fn fetch_contacts(
        &self,
        _account: &Account,
        sink: &ContactSink,
    ) -> Result<u64, ProtocolError> {
        let mut published = 0u64;
        for name in ["Alice Mock", "Bob Mock"] {
            let ok = sink
                .publish(Contact {
                    contact_id: name.to_lowercase().replace(' ', "-"),
                    full_name: name.to_string(),
                    nick: name.split(' ').next().unwrap_or_default().to_lowercase(),
                    ..Default::default()
                })
                .await;
            if ok {
                published += 1;
            }
        }
        Ok(published)
    }
}
