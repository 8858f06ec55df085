/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::dispatcher::{Dispatcher, OpKind};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Cycle cadence for the scheduled operation kinds. Send and Action are not
/// here: they only run when triggered from the control surface.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    pub refresh: Duration,
    pub contacts: Duration,
    pub avatar_expiry: Duration,
    /// Delay before the first cycle of every kind after process start.
    pub startup_delay: Duration,
}

/// Spawn the self-rearming cycle loops. Each loop sleeps, runs one cycle to
/// completion, and only then arms the next sleep, so two cycles of the same
/// kind can never overlap even when one runs long.
pub fn start_schedulers(dispatcher: Dispatcher, cadence: Cadence, shutdown: watch::Receiver<bool>) {
    info!(
        refresh_secs = cadence.refresh.as_secs(),
        contacts_secs = cadence.contacts.as_secs(),
        avatar_expiry_secs = cadence.avatar_expiry.as_secs(),
        "starting cycle schedulers"
    );
    spawn_cycle_loop(
        dispatcher.clone(),
        OpKind::Refresh,
        cadence.startup_delay,
        cadence.refresh,
        shutdown.clone(),
    );
    spawn_cycle_loop(
        dispatcher.clone(),
        OpKind::FetchContacts,
        cadence.startup_delay,
        cadence.contacts,
        shutdown.clone(),
    );
    spawn_cycle_loop(
        dispatcher,
        OpKind::ExpireAvatars,
        cadence.startup_delay,
        cadence.avatar_expiry,
        shutdown,
    );
}

fn spawn_cycle_loop(
    dispatcher: Dispatcher,
    kind: OpKind,
    initial_delay: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut delay = initial_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let started = std::time::Instant::now();
            let summary = dispatcher.run_cycle(kind).await;
            debug!(
                kind = kind.as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                produced = summary.produced,
                "scheduled cycle finished"
            );
            delay = interval;
        }
        debug!(kind = kind.as_str(), "cycle scheduler stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountRegistry};
    use crate::avatar::AvatarCache;
    use crate::config::NotifyMode;
    use crate::dispatcher::{DispatcherContext, LoggingContacts};
    use crate::http_fetch::Transport;
    use crate::mock_protocol::MockProtocol;
    use crate::protocol::ProtocolRegistry;
    use crate::shortener::Shortener;
    use crate::stream_store::StreamStore;
    use std::sync::Arc;

    struct NoTransport;

    #[async_trait::async_trait]
    impl Transport for NoTransport {
        async fn fetch(
            &self,
            _req: crate::http_fetch::FetchRequest,
        ) -> Result<crate::http_fetch::FetchResponse, crate::errors::TransportError> {
            Err(crate::errors::TransportError::Other("offline".to_string()))
        }
    }

    fn build(mock: Arc<MockProtocol>) -> (Dispatcher, AccountRegistry) {
        let accounts = AccountRegistry::new();
        let mut protocols = ProtocolRegistry::new();
        protocols.register(mock);

        let transport: Arc<dyn Transport> = Arc::new(NoTransport);
        let dir = tempfile::tempdir().unwrap();
        let avatars = AvatarCache::new(dir.path().join("avatars"), transport.clone()).unwrap();
        std::mem::forget(dir);

        let dispatcher = Dispatcher::new(DispatcherContext {
            accounts: accounts.clone(),
            protocols,
            store: StreamStore::new(),
            avatars,
            shortener: Shortener::disabled(transport),
            contacts: Arc::new(LoggingContacts),
            notify_mode: NotifyMode::None,
            op_timeout: Duration::from_secs(5),
            avatar_max_age: Duration::from_secs(3600),
            max_rows: 2000,
        });
        (dispatcher, accounts)
    }

    #[tokio::test]
    async fn first_cycle_fires_shortly_after_start() {
        let mock = Arc::new(MockProtocol::new());
        let (dispatcher, accounts) = build(mock.clone());
        accounts.account_added(Account {
            id: "1".to_string(),
            protocol: "mock".to_string(),
            enabled: true,
            send_enabled: false,
        });

        let (_tx, rx) = watch::channel(false);
        start_schedulers(
            dispatcher,
            Cadence {
                refresh: Duration::from_secs(3600),
                contacts: Duration::from_secs(3600),
                avatar_expiry: Duration::from_secs(3600),
                startup_delay: Duration::from_millis(10),
            },
            rx,
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(mock.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn rearms_only_after_the_cycle_completes() {
        // Each refresh takes ~100ms while the interval is near zero: a
        // fixed-rate timer would pile up many overlapping cycles, the
        // re-arming loop runs them strictly back to back.
        let mock = Arc::new(MockProtocol::new().with_delay(Duration::from_millis(100)));
        let (dispatcher, accounts) = build(mock.clone());
        accounts.account_added(Account {
            id: "1".to_string(),
            protocol: "mock".to_string(),
            enabled: true,
            send_enabled: false,
        });

        let (tx, rx) = watch::channel(false);
        start_schedulers(
            dispatcher,
            Cadence {
                refresh: Duration::from_millis(1),
                contacts: Duration::from_secs(3600),
                avatar_expiry: Duration::from_secs(3600),
                startup_delay: Duration::from_millis(1),
            },
            rx,
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        let _ = tx.send(true);
        let calls = mock.refresh_calls();
        assert!(calls >= 2, "expected at least two cycles, got {calls}");
        assert!(calls <= 4, "cycles overlapped: {calls} in 350ms");
    }

    #[tokio::test]
    async fn shutdown_stops_the_loops() {
        let mock = Arc::new(MockProtocol::new());
        let (dispatcher, accounts) = build(mock.clone());
        accounts.account_added(Account {
            id: "1".to_string(),
            protocol: "mock".to_string(),
            enabled: true,
            send_enabled: false,
        });

        let (tx, rx) = watch::channel(false);
        start_schedulers(
            dispatcher,
            Cadence {
                refresh: Duration::from_millis(30),
                contacts: Duration::from_secs(3600),
                avatar_expiry: Duration::from_secs(3600),
                startup_delay: Duration::from_millis(1),
            },
            rx,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = tx.send(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls_at_shutdown = mock.refresh_calls();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.refresh_calls(), calls_at_shutdown);
    }
}
