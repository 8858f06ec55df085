/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub type AccountId = String;

/// One configured identity on one social network. Owned by the registry;
/// protocol plugins are looked up by `protocol`, never stored on the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub protocol: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub send_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub enum AccountEvent {
    Added(Account),
    Removed(Account),
    AuthExpired(AccountId),
    Reauthorized(AccountId),
}

/// Live set of configured accounts, fed by the external account provider.
///
/// Lifecycle ordering is part of the contract: an added account is registered
/// before handlers hear about it, a removed account is gone from the set
/// before handlers run, so a handler that snapshots the registry always sees
/// the post-event state.
#[derive(Clone)]
pub struct AccountRegistry {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<AccountEvent>,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, Account>,
    needs_reauth: HashSet<AccountId>,
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.events.subscribe()
    }

    pub fn account_added(&self, account: Account) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.needs_reauth.remove(&account.id);
            inner.accounts.insert(account.id.clone(), account.clone());
        }
        info!(account = %account.id, protocol = %account.protocol, "account added");
        let _ = self.events.send(AccountEvent::Added(account));
    }

    pub fn account_removed(&self, account_id: &str) -> Option<Account> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner.needs_reauth.remove(account_id);
            inner.accounts.remove(account_id)
        };
        match removed {
            Some(account) => {
                info!(account = %account_id, "account removed");
                let _ = self.events.send(AccountEvent::Removed(account.clone()));
                Some(account)
            }
            None => {
                debug!(account = %account_id, "remove for unknown account ignored");
                None
            }
        }
    }

    pub fn get(&self, account_id: &str) -> Option<Account> {
        self.inner.lock().unwrap().accounts.get(account_id).cloned()
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.inner.lock().unwrap().accounts.contains_key(account_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enabled accounts, ordered by id so cycles are deterministic.
    pub fn list_enabled(&self) -> Vec<Account> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Account> = inner
            .accounts
            .values()
            .filter(|a| a.enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Enabled accounts eligible for automatic refresh: expired authorization
    /// suppresses an account until `reauthorized` is signalled.
    pub fn list_refreshable(&self) -> Vec<Account> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Account> = inner
            .accounts
            .values()
            .filter(|a| a.enabled && !inner.needs_reauth.contains(&a.id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn list_send_enabled(&self) -> Vec<Account> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Account> = inner
            .accounts
            .values()
            .filter(|a| a.enabled && a.send_enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn needs_reauth(&self, account_id: &str) -> bool {
        self.inner.lock().unwrap().needs_reauth.contains(account_id)
    }

    pub fn mark_auth_expired(&self, account_id: &str) {
        let known = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.accounts.contains_key(account_id) {
                false
            } else {
                inner.needs_reauth.insert(account_id.to_string());
                true
            }
        };
        if known {
            let _ = self
                .events
                .send(AccountEvent::AuthExpired(account_id.to_string()));
        }
    }

    pub fn reauthorized(&self, account_id: &str) {
        let was_flagged = {
            let mut inner = self.inner.lock().unwrap();
            inner.needs_reauth.remove(account_id)
        };
        if was_flagged {
            info!(account = %account_id, "account re-authorized");
            let _ = self
                .events
                .send(AccountEvent::Reauthorized(account_id.to_string()));
        }
    }
}
