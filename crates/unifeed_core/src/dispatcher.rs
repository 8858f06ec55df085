/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::{Account, AccountEvent, AccountRegistry};
use crate::avatar::AvatarCache;
use crate::config::NotifyMode;
use crate::errors::ProtocolError;
use crate::events::ServiceEvent;
use crate::protocol::{iso_now, Contact, ContactSink, Protocol, ProtocolRegistry, RowSink};
use crate::shortener::Shortener;
use crate::stream_store::{MessageRow, StreamStore, Upsert};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The fixed set of operations the dispatcher knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Refresh,
    Send,
    Action,
    FetchContacts,
    ExpireAvatars,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::Send => "send",
            Self::Action => "action",
            Self::FetchContacts => "fetch_contacts",
            Self::ExpireAvatars => "expire_avatars",
        }
    }
}

/// Receives the contact sequences produced by `fetch_contacts`. The real
/// address book lives outside this service; the default consumer just logs.
#[async_trait]
pub trait ContactConsumer: Send + Sync {
    async fn accept(&self, contact: Contact);
}

pub struct LoggingContacts;

#[async_trait]
impl ContactConsumer for LoggingContacts {
    async fn accept(&self, contact: Contact) {
        debug!(
            account = %contact.account_id,
            name = %contact.full_name,
            "contact received"
        );
    }
}

/// Everything the dispatcher needs, wired once at startup.
pub struct DispatcherContext {
    pub accounts: AccountRegistry,
    pub protocols: ProtocolRegistry,
    pub store: StreamStore,
    pub avatars: AvatarCache,
    pub shortener: Shortener,
    pub contacts: Arc<dyn ContactConsumer>,
    pub notify_mode: NotifyMode,
    pub op_timeout: Duration,
    pub avatar_max_age: Duration,
    pub max_rows: usize,
}

/// What one triggered cycle did.
#[derive(Debug, Clone, Copy)]
pub struct CycleSummary {
    pub kind: OpKind,
    /// True when another cycle of the same kind was already running and this
    /// trigger was dropped.
    pub coalesced: bool,
    pub launched: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Rows merged, contacts forwarded, or avatar files expired.
    pub produced: u64,
}

impl CycleSummary {
    fn coalesced(kind: OpKind) -> Self {
        Self {
            kind,
            coalesced: true,
            launched: 0,
            skipped: 0,
            succeeded: 0,
            failed: 0,
            produced: 0,
        }
    }
}

enum TaskReport {
    Skipped,
    Done(u64),
    Failed,
}

/// Fan-out/fan-in coordinator. One task per enabled account per cycle, each
/// under its own failure boundary and per-call timeout; at most one in-flight
/// operation per `(account, kind)` pair at any time.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    accounts: AccountRegistry,
    protocols: ProtocolRegistry,
    store: StreamStore,
    avatars: AvatarCache,
    shortener: Shortener,
    contacts: Arc<dyn ContactConsumer>,
    notify_mode: NotifyMode,
    op_timeout: Duration,
    avatar_max_age: Duration,
    max_rows: usize,
    events: broadcast::Sender<ServiceEvent>,
    in_flight: Mutex<HashSet<(String, OpKind)>>,
    active_cycles: Mutex<HashSet<OpKind>>,
    unread: AtomicU64,
}

struct OpGuard {
    inner: Arc<Inner>,
    key: (String, OpKind),
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().unwrap().remove(&self.key);
    }
}

struct CycleGuard {
    inner: Arc<Inner>,
    kind: OpKind,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.inner.active_cycles.lock().unwrap().remove(&self.kind);
    }
}

impl Dispatcher {
    pub fn new(ctx: DispatcherContext) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                accounts: ctx.accounts,
                protocols: ctx.protocols,
                store: ctx.store,
                avatars: ctx.avatars,
                shortener: ctx.shortener,
                contacts: ctx.contacts,
                notify_mode: ctx.notify_mode,
                op_timeout: ctx.op_timeout,
                avatar_max_age: ctx.avatar_max_age,
                max_rows: ctx.max_rows,
                events,
                in_flight: Mutex::new(HashSet::new()),
                active_cycles: Mutex::new(HashSet::new()),
                unread: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Rows added since the last refresh trigger.
    pub fn unread(&self) -> u64 {
        self.inner.unread.load(Ordering::Relaxed)
    }

    /// React to account lifecycle changes: an added or re-authorized account
    /// gets an immediate refresh of just that account, a removed account has
    /// its rows purged and any still-running operation's results discarded.
    pub fn start_account_listener(&self, mut shutdown: watch::Receiver<bool>) {
        let dispatcher = self.clone();
        let mut events = dispatcher.inner.accounts.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    ev = events.recv() => match ev {
                        Ok(AccountEvent::Added(account)) => {
                            let d = dispatcher.clone();
                            tokio::spawn(async move { d.refresh_one(&account.id).await });
                        }
                        Ok(AccountEvent::Reauthorized(account_id)) => {
                            let d = dispatcher.clone();
                            tokio::spawn(async move { d.refresh_one(&account_id).await });
                        }
                        Ok(AccountEvent::Removed(account)) => {
                            let purged = dispatcher.inner.store.purge_by_account(&account.id);
                            info!(account = %account.id, purged, "purged rows for removed account");
                            dispatcher.send_event(ServiceEvent::new(
                                "account_purged",
                                Some(account.id.clone()),
                                Some(purged.to_string()),
                            ));
                        }
                        Ok(AccountEvent::AuthExpired(_)) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "account event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Run one cycle of `kind` across all eligible accounts. Triggers while a
    /// cycle of the same kind is still running are coalesced.
    pub async fn run_cycle(&self, kind: OpKind) -> CycleSummary {
        let Some(_cycle) = self.claim_cycle(kind) else {
            debug!(kind = kind.as_str(), "cycle already running, trigger coalesced");
            return CycleSummary::coalesced(kind);
        };

        if kind == OpKind::Refresh {
            self.inner.unread.store(0, Ordering::Relaxed);
        }

        let mut produced = 0u64;
        if kind == OpKind::ExpireAvatars {
            match self
                .inner
                .avatars
                .expire_older_than(self.inner.avatar_max_age)
                .await
            {
                Ok(n) => produced += n,
                Err(e) => warn!("avatar sweep failed: {e:#}"),
            }
        }

        let accounts = match kind {
            OpKind::Refresh => self.inner.accounts.list_refreshable(),
            _ => self.inner.accounts.list_enabled(),
        };

        let mut set = JoinSet::new();
        let launched = accounts.len();
        for account in accounts {
            let dispatcher = self.clone();
            set.spawn(async move { dispatcher.run_account(kind, account).await });
        }

        let mut skipped = 0usize;
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        while let Some(res) = set.join_next().await {
            match res {
                Ok(TaskReport::Skipped) => skipped += 1,
                Ok(TaskReport::Done(n)) => {
                    succeeded += 1;
                    produced += n;
                }
                Ok(TaskReport::Failed) => failed += 1,
                Err(e) => {
                    error!("account task aborted: {e}");
                    failed += 1;
                }
            }
        }

        if kind == OpKind::Refresh {
            let pruned = self.inner.store.prune_to_max(self.inner.max_rows);
            if pruned > 0 {
                debug!(pruned, "pruned row store to maximum size");
            }
        }

        let summary = CycleSummary {
            kind,
            coalesced: false,
            launched,
            skipped,
            succeeded,
            failed,
            produced,
        };
        info!(
            kind = kind.as_str(),
            launched, skipped, succeeded, failed, produced, "cycle complete"
        );
        self.send_event(ServiceEvent::new(
            "cycle_complete",
            None,
            Some(format!("{}: {produced} produced", kind.as_str())),
        ));
        summary
    }

    /// Immediate refresh of a single account, used for account-added and
    /// re-authorization events. Subject to the same concurrency-of-one rule.
    pub async fn refresh_one(&self, account_id: &str) {
        let Some(account) = self.inner.accounts.get(account_id) else {
            debug!(account = %account_id, "refresh for unknown account ignored");
            return;
        };
        if !account.enabled {
            return;
        }
        self.run_account(OpKind::Refresh, account).await;
    }

    /// Post a message (or reply) through one account. The resulting row is
    /// merged into the store before this returns.
    pub async fn send(
        &self,
        account_id: &str,
        message: &str,
        reply_to: Option<&str>,
    ) -> Result<MessageRow, ProtocolError> {
        let account = self.inner.accounts.get(account_id).ok_or_else(|| {
            ProtocolError::Permanent(format!("unknown account: {account_id}"))
        })?;
        let protocol = self.inner.protocols.get(&account.protocol).ok_or_else(|| {
            ProtocolError::Permanent(format!("no plugin for protocol: {}", account.protocol))
        })?;
        let Some(_op) = self.claim(&account.id, OpKind::Send) else {
            return Err(ProtocolError::Transient(format!(
                "send already in flight for account {account_id}"
            )));
        };

        let message = self.inner.shortener.shorten_text(message).await;
        let result = match tokio::time::timeout(
            self.inner.op_timeout,
            protocol.send(&account, &message, reply_to),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(timeout_error(OpKind::Send, self.inner.op_timeout)),
        };

        match result {
            Ok(mut row) => {
                if row.protocol.is_empty() {
                    row.protocol = protocol.name().to_string();
                }
                if !row.account_ids.contains(&account.id) {
                    row.account_ids.push(account.id.clone());
                }
                if row.timestamp.is_empty() {
                    row.timestamp = iso_now();
                }
                row.from_me = true;
                if self.inner.accounts.contains(&account.id) {
                    self.inner.store.upsert(row.clone());
                }
                self.send_event(ServiceEvent::new(
                    "sent",
                    Some(account.id.clone()),
                    Some(row.message_id.clone()),
                ));
                Ok(row)
            }
            Err(err) => {
                self.apply_error_policy(&account, OpKind::Send, &err);
                Err(err)
            }
        }
    }

    /// Post a message through every send-enabled account.
    pub async fn send_to_all(&self, message: &str) -> Vec<(String, Result<MessageRow, ProtocolError>)> {
        let accounts = self.inner.accounts.list_send_enabled();
        let sends = accounts.iter().map(|account| {
            let dispatcher = self.clone();
            let id = account.id.clone();
            async move {
                let res = dispatcher.send(&id, message, None).await;
                (id, res)
            }
        });
        futures_util::future::join_all(sends).await
    }

    /// Invoke a named verb (like, retweet, delete, ...) on one account.
    pub async fn perform_action(
        &self,
        account_id: &str,
        action: &str,
        message_id: &str,
    ) -> Result<String, ProtocolError> {
        let account = self.inner.accounts.get(account_id).ok_or_else(|| {
            ProtocolError::Permanent(format!("unknown account: {account_id}"))
        })?;
        let protocol = self.inner.protocols.get(&account.protocol).ok_or_else(|| {
            ProtocolError::Permanent(format!("no plugin for protocol: {}", account.protocol))
        })?;
        let Some(_op) = self.claim(&account.id, OpKind::Action) else {
            return Err(ProtocolError::Transient(format!(
                "action already in flight for account {account_id}"
            )));
        };

        let result = match tokio::time::timeout(
            self.inner.op_timeout,
            protocol.perform_action(&account, action, message_id),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(timeout_error(OpKind::Action, self.inner.op_timeout)),
        };

        match result {
            Ok(out) => {
                debug!(account = %account.id, action, message_id, "action complete");
                Ok(out)
            }
            Err(err) => {
                self.apply_error_policy(&account, OpKind::Action, &err);
                Err(err)
            }
        }
    }

    /// Invoke a named verb on every enabled account. Accounts whose protocol
    /// does not support the action are skipped, as not every network
    /// implements every verb.
    pub async fn perform_action_all(
        &self,
        action: &str,
        message_id: &str,
    ) -> Vec<(String, Result<String, ProtocolError>)> {
        let accounts = self.inner.accounts.list_enabled();
        let actions = accounts.iter().map(|account| {
            let dispatcher = self.clone();
            let id = account.id.clone();
            async move {
                let res = dispatcher.perform_action(&id, action, message_id).await;
                (id, res)
            }
        });
        futures_util::future::join_all(actions)
            .await
            .into_iter()
            .filter(|(_, res)| !matches!(res, Err(ProtocolError::UnsupportedAction(_))))
            .collect()
    }

    async fn run_account(&self, kind: OpKind, account: Account) -> TaskReport {
        let Some(protocol) = self.inner.protocols.get(&account.protocol) else {
            warn!(
                account = %account.id,
                protocol = %account.protocol,
                "no protocol plugin registered, skipping account"
            );
            return TaskReport::Skipped;
        };
        let Some(_op) = self.claim(&account.id, kind) else {
            debug!(
                account = %account.id,
                kind = kind.as_str(),
                "operation already in flight, coalesced"
            );
            return TaskReport::Skipped;
        };

        let result = match kind {
            OpKind::Refresh => self.refresh_account(&account, protocol).await,
            OpKind::FetchContacts => self.contacts_account(&account, protocol).await,
            OpKind::ExpireAvatars => {
                match tokio::time::timeout(
                    self.inner.op_timeout,
                    protocol.expire_avatars(&account, self.inner.avatar_max_age),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_) => Err(timeout_error(kind, self.inner.op_timeout)),
                }
            }
            OpKind::Send | OpKind::Action => {
                debug!(kind = kind.as_str(), "kind is not cycle-scheduled");
                return TaskReport::Skipped;
            }
        };

        match result {
            Ok(n) => {
                debug!(
                    account = %account.id,
                    kind = kind.as_str(),
                    produced = n,
                    "account task complete"
                );
                TaskReport::Done(n)
            }
            Err(err) => {
                self.apply_error_policy(&account, kind, &err);
                TaskReport::Failed
            }
        }
    }

    async fn refresh_account(
        &self,
        account: &Account,
        protocol: Arc<dyn Protocol>,
    ) -> Result<u64, ProtocolError> {
        let (sink, mut rx) = RowSink::channel(account, protocol.name());

        let call = async {
            let res = tokio::time::timeout(
                self.inner.op_timeout,
                protocol.refresh(account, &sink),
            )
            .await;
            // Dropping the sink closes the channel and ends the merge loop,
            // whether the call finished or was abandoned on timeout.
            drop(sink);
            match res {
                Ok(r) => r,
                Err(_) => Err(timeout_error(OpKind::Refresh, self.inner.op_timeout)),
            }
        };

        let merge = async {
            let mut added = 0u64;
            while let Some(row) = rx.recv().await {
                // The account may have been removed while this call was in
                // flight; its rows must not be merged.
                if !self.inner.accounts.contains(&account.id) {
                    continue;
                }
                if self.inner.store.upsert(row.clone()) == Upsert::Inserted {
                    added += 1;
                    self.inner.unread.fetch_add(1, Ordering::Relaxed);
                    if !row.from_me && self.inner.notify_mode.wants(&row.stream) {
                        self.send_event(ServiceEvent::new(
                            "notify",
                            Some(account.id.clone()),
                            Some(format!("{}: {}", row.sender, row.message)),
                        ));
                    }
                }
            }
            added
        };

        let (result, added) = tokio::join!(call, merge);
        result.map(|()| added)
    }

    async fn contacts_account(
        &self,
        account: &Account,
        protocol: Arc<dyn Protocol>,
    ) -> Result<u64, ProtocolError> {
        let (sink, mut rx) = ContactSink::channel(account, protocol.name());

        let call = async {
            let res = tokio::time::timeout(
                self.inner.op_timeout,
                protocol.fetch_contacts(account, &sink),
            )
            .await;
            drop(sink);
            match res {
                Ok(r) => r,
                Err(_) => Err(timeout_error(OpKind::FetchContacts, self.inner.op_timeout)),
            }
        };

        let forward = async {
            let mut forwarded = 0u64;
            while let Some(contact) = rx.recv().await {
                if !self.inner.accounts.contains(&account.id) {
                    continue;
                }
                self.inner.contacts.accept(contact).await;
                forwarded += 1;
            }
            forwarded
        };

        let (result, forwarded) = tokio::join!(call, forward);
        result.map(|_| forwarded)
    }

    fn apply_error_policy(&self, account: &Account, kind: OpKind, err: &ProtocolError) {
        match err {
            ProtocolError::Transient(msg) => {
                warn!(
                    account = %account.id,
                    kind = kind.as_str(),
                    "{msg}; leaving account for the next cycle"
                );
            }
            ProtocolError::RateLimited { retry_after } => {
                warn!(
                    account = %account.id,
                    kind = kind.as_str(),
                    retry_after_secs = retry_after.as_ref().map(|d| d.as_secs()),
                    "rate limited; backing off until the next cycle"
                );
            }
            ProtocolError::AuthExpired => {
                warn!(
                    account = %account.id,
                    "authorization expired; suspending automatic refresh"
                );
                self.inner.accounts.mark_auth_expired(&account.id);
                self.send_event(ServiceEvent::new(
                    "auth_expired",
                    Some(account.id.clone()),
                    None,
                ));
            }
            ProtocolError::UnsupportedAction(action) => {
                debug!(
                    account = %account.id,
                    action = %action,
                    "protocol does not support this operation"
                );
            }
            ProtocolError::Permanent(msg) => {
                error!(account = %account.id, kind = kind.as_str(), "{msg}");
            }
        }
    }

    fn claim(&self, account_id: &str, kind: OpKind) -> Option<OpGuard> {
        let key = (account_id.to_string(), kind);
        let mut in_flight = self.inner.in_flight.lock().unwrap();
        if !in_flight.insert(key.clone()) {
            return None;
        }
        Some(OpGuard {
            inner: self.inner.clone(),
            key,
        })
    }

    fn claim_cycle(&self, kind: OpKind) -> Option<CycleGuard> {
        let mut active = self.inner.active_cycles.lock().unwrap();
        if !active.insert(kind) {
            return None;
        }
        Some(CycleGuard {
            inner: self.inner.clone(),
            kind,
        })
    }

    fn send_event(&self, event: ServiceEvent) {
        let _ = self.inner.events.send(event);
    }
}

fn timeout_error(kind: OpKind, after: Duration) -> ProtocolError {
    ProtocolError::Transient(format!(
        "{} timed out after {}s",
        kind.as_str(),
        after.as_secs()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_fetch::{FetchRequest, FetchResponse, Transport};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn fetch(
            &self,
            _req: FetchRequest,
        ) -> Result<FetchResponse, crate::errors::TransportError> {
            Err(crate::errors::TransportError::Other("no network in tests".to_string()))
        }
    }

    #[derive(Clone)]
    enum Behavior {
        Rows(Vec<&'static str>),
        Mentions(Vec<&'static str>),
        Transient,
        AuthExpired,
        Hang(Duration),
        HangThenRows(Duration, Vec<&'static str>),
    }

    struct TestProtocol {
        behaviors: Mutex<HashMap<String, Behavior>>,
        refresh_calls: AtomicUsize,
    }

    impl TestProtocol {
        fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: Mutex::new(
                    behaviors
                        .iter()
                        .map(|(id, b)| (id.to_string(), b.clone()))
                        .collect(),
                ),
                refresh_calls: AtomicUsize::new(0),
            })
        }

        fn behavior(&self, account: &Account) -> Behavior {
            self.behaviors
                .lock()
                .unwrap()
                .get(&account.id)
                .cloned()
                .unwrap_or(Behavior::Rows(Vec::new()))
        }
    }

    #[async_trait]
    impl Protocol for TestProtocol {
        fn name(&self) -> &'static str {
            "mocknet"
        }

        async fn refresh(&self, account: &Account, sink: &RowSink) -> Result<(), ProtocolError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behavior(account);
            match behavior {
                Behavior::Rows(ids) => {
                    for id in ids {
                        sink.publish(MessageRow {
                            message_id: id.to_string(),
                            stream: "messages".to_string(),
                            sender: "peer".to_string(),
                            message: "hello".to_string(),
                            ..Default::default()
                        })
                        .await;
                    }
                    Ok(())
                }
                Behavior::Mentions(ids) => {
                    for id in ids {
                        sink.publish(MessageRow {
                            message_id: id.to_string(),
                            stream: "mentions".to_string(),
                            sender: "peer".to_string(),
                            message: "hey you".to_string(),
                            ..Default::default()
                        })
                        .await;
                    }
                    Ok(())
                }
                Behavior::Transient => {
                    Err(ProtocolError::Transient("connection reset".to_string()))
                }
                Behavior::AuthExpired => Err(ProtocolError::AuthExpired),
                Behavior::Hang(d) => {
                    tokio::time::sleep(d).await;
                    Ok(())
                }
                Behavior::HangThenRows(d, ids) => {
                    tokio::time::sleep(d).await;
                    for id in ids {
                        sink.publish(MessageRow {
                            message_id: id.to_string(),
                            ..Default::default()
                        })
                        .await;
                    }
                    Ok(())
                }
            }
        }

        async fn send(
            &self,
            _account: &Account,
            message: &str,
            reply_to: Option<&str>,
        ) -> Result<MessageRow, ProtocolError> {
            Ok(MessageRow {
                message_id: format!("sent-{}", message.len()),
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
                "like" => Ok(format!("liked {message_id}")),
                other => Err(ProtocolError::UnsupportedAction(other.to_string())),
            }
        }
    }

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            protocol: "mocknet".to_string(),
            enabled: true,
            send_enabled: true,
        }
    }

    fn build(
        behaviors: &[(&str, Behavior)],
        op_timeout: Duration,
    ) -> (Dispatcher, AccountRegistry, StreamStore, Arc<TestProtocol>) {
        let accounts = AccountRegistry::new();
        let store = StreamStore::new();
        let protocol = TestProtocol::new(behaviors);
        let mut protocols = ProtocolRegistry::new();
        protocols.register(protocol.clone());

        let transport: Arc<dyn Transport> = Arc::new(NullTransport);
        let dir = tempfile::tempdir().unwrap();
        let avatars = AvatarCache::new(dir.path().join("avatars"), transport.clone()).unwrap();
        // tempdir must outlive the test; leak it so files stay writable.
        std::mem::forget(dir);

        let dispatcher = Dispatcher::new(DispatcherContext {
            accounts: accounts.clone(),
            protocols,
            store: store.clone(),
            avatars,
            shortener: Shortener::disabled(transport),
            contacts: Arc::new(LoggingContacts),
            notify_mode: NotifyMode::Relevant,
            op_timeout,
            avatar_max_age: Duration::from_secs(3600),
            max_rows: 2000,
        });
        (dispatcher, accounts, store, protocol)
    }

    #[tokio::test]
    async fn failing_account_does_not_block_others() {
        let (dispatcher, accounts, store, _) = build(
            &[("a", Behavior::Transient), ("b", Behavior::Rows(vec!["1", "2"]))],
            Duration::from_secs(5),
        );
        accounts.account_added(account("a"));
        accounts.account_added(account("b"));

        let summary = dispatcher.run_cycle(OpKind::Refresh).await;
        assert_eq!(summary.launched, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(store.len(), 2);

        // A transient failure leaves the account enabled and unflagged.
        assert!(!accounts.needs_reauth("a"));
        assert_eq!(accounts.list_refreshable().len(), 2);
    }

    #[tokio::test]
    async fn concurrency_of_one_per_account() {
        let (dispatcher, accounts, _, protocol) = build(
            &[("a", Behavior::Hang(Duration::from_millis(200)))],
            Duration::from_secs(5),
        );
        accounts.account_added(account("a"));

        let d1 = dispatcher.clone();
        let d2 = dispatcher.clone();
        tokio::join!(d1.refresh_one("a"), async {
            // Second trigger lands while the first call is still hanging.
            tokio::time::sleep(Duration::from_millis(50)).await;
            d2.refresh_one("a").await;
        });

        assert_eq!(protocol.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_cycles_coalesce() {
        let (dispatcher, accounts, _, _) = build(
            &[("a", Behavior::Hang(Duration::from_millis(200)))],
            Duration::from_secs(5),
        );
        accounts.account_added(account("a"));

        let d1 = dispatcher.clone();
        let d2 = dispatcher.clone();
        let (first, second) = tokio::join!(d1.run_cycle(OpKind::Refresh), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            d2.run_cycle(OpKind::Refresh).await
        });
        assert!(!first.coalesced);
        assert!(second.coalesced);
    }

    #[tokio::test]
    async fn slow_account_times_out_as_transient() {
        let (dispatcher, accounts, store, _) = build(
            &[
                ("a", Behavior::Hang(Duration::from_secs(30))),
                ("b", Behavior::Rows(vec!["1"])),
            ],
            Duration::from_millis(100),
        );
        accounts.account_added(account("a"));
        accounts.account_added(account("b"));

        let summary = dispatcher.run_cycle(OpKind::Refresh).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(store.len(), 1);
        // Timeout is transient, not an auth problem.
        assert!(!accounts.needs_reauth("a"));
    }

    #[tokio::test]
    async fn auth_expiry_suspends_refresh_until_signal() {
        let (dispatcher, accounts, _, protocol) = build(
            &[("a", Behavior::AuthExpired)],
            Duration::from_secs(5),
        );
        accounts.account_added(account("a"));

        dispatcher.run_cycle(OpKind::Refresh).await;
        assert!(accounts.needs_reauth("a"));

        // The next cycle launches nothing for the flagged account.
        let summary = dispatcher.run_cycle(OpKind::Refresh).await;
        assert_eq!(summary.launched, 0);
        assert_eq!(protocol.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_inserts_before_returning() {
        let (dispatcher, accounts, store, _) = build(&[], Duration::from_secs(5));
        accounts.account_added(account("a"));

        let row = dispatcher.send("a", "hello", None).await.unwrap();
        assert!(store.contains(&row.key()));
        assert!(row.from_me);
        assert_eq!(row.account_ids, vec!["a"]);
    }

    #[tokio::test]
    async fn send_to_all_targets_send_enabled_accounts() {
        let (dispatcher, accounts, store, _) = build(&[], Duration::from_secs(5));
        accounts.account_added(account("a"));
        let mut no_send = account("b");
        no_send.send_enabled = false;
        accounts.account_added(no_send);

        let results = dispatcher.send_to_all("hi").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "a");
        assert!(results[0].1.is_ok());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let (dispatcher, accounts, _, _) = build(&[], Duration::from_secs(5));
        accounts.account_added(account("a"));

        let out = dispatcher.perform_action("a", "like", "42").await.unwrap();
        assert_eq!(out, "liked 42");

        let err = dispatcher
            .perform_action("a", "frobnicate", "42")
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedAction(_)));
    }

    #[tokio::test]
    async fn action_on_all_accounts_skips_unsupported() {
        let (dispatcher, accounts, _, _) = build(&[], Duration::from_secs(5));
        accounts.account_added(account("a"));
        accounts.account_added(account("b"));

        let results = dispatcher.perform_action_all("like", "42").await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, res)| res.is_ok()));

        // No account supports the verb: nothing useful to report.
        let results = dispatcher.perform_action_all("frobnicate", "42").await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn unknown_account_and_protocol_fail_cleanly() {
        let (dispatcher, accounts, _, _) = build(&[], Duration::from_secs(5));
        let err = dispatcher.send("nope", "hi", None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Permanent(_)));

        accounts.account_added(Account {
            id: "x".to_string(),
            protocol: "unregistered".to_string(),
            enabled: true,
            send_enabled: true,
        });
        let summary = dispatcher.run_cycle(OpKind::Refresh).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn removed_account_results_are_discarded() {
        let (dispatcher, accounts, store, _) = build(
            &[(
                "a",
                Behavior::HangThenRows(Duration::from_millis(150), vec!["late-1", "late-2"]),
            )],
            Duration::from_secs(5),
        );
        accounts.account_added(account("a"));

        let d = dispatcher.clone();
        let cycle = tokio::spawn(async move { d.run_cycle(OpKind::Refresh).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        accounts.account_removed("a");
        cycle.await.unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn account_listener_refreshes_new_accounts_and_purges_removed() {
        let (dispatcher, accounts, store, _) = build(
            &[("a", Behavior::Rows(vec!["1", "2"]))],
            Duration::from_secs(5),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        dispatcher.start_account_listener(shutdown_rx);

        accounts.account_added(account("a"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.len(), 2);

        accounts.account_removed("a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn auth_expiry_is_broadcast_for_the_user() {
        let (dispatcher, accounts, _, _) = build(
            &[("a", Behavior::AuthExpired), ("b", Behavior::Transient)],
            Duration::from_secs(5),
        );
        let mut events = dispatcher.subscribe_events();
        accounts.account_added(account("a"));
        accounts.account_added(account("b"));

        dispatcher.run_cycle(OpKind::Refresh).await;

        let mut kinds = Vec::new();
        while let Ok(ev) = events.try_recv() {
            kinds.push((ev.kind, ev.account_id));
        }
        // The auth failure is the only per-account event; the transient
        // failure stays in the logs.
        assert!(kinds.contains(&("auth_expired".to_string(), Some("a".to_string()))));
        assert!(!kinds.iter().any(|(_, acct)| acct.as_deref() == Some("b")));
    }

    #[tokio::test]
    async fn notifications_follow_the_verbosity_mode() {
        // Default mode notifies about mentions and private messages, not the
        // main message stream.
        let (dispatcher, accounts, _, _) = build(
            &[
                ("a", Behavior::Rows(vec!["1", "2"])),
                ("b", Behavior::Mentions(vec!["3"])),
            ],
            Duration::from_secs(5),
        );
        let mut events = dispatcher.subscribe_events();
        accounts.account_added(account("a"));
        accounts.account_added(account("b"));

        dispatcher.run_cycle(OpKind::Refresh).await;

        let mut notified = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if ev.kind == "notify" {
                notified.push(ev.account_id);
            }
        }
        assert_eq!(notified, vec![Some("b".to_string())]);
    }

    #[tokio::test]
    async fn unread_counts_new_rows_until_next_refresh() {
        let (dispatcher, accounts, _, _) = build(
            &[("a", Behavior::Rows(vec!["1", "2"]))],
            Duration::from_secs(5),
        );
        accounts.account_added(account("a"));

        dispatcher.run_cycle(OpKind::Refresh).await;
        assert_eq!(dispatcher.unread(), 2);

        // Same rows again: nothing new, counter resets with the new cycle.
        dispatcher.run_cycle(OpKind::Refresh).await;
        assert_eq!(dispatcher.unread(), 0);
    }
}
