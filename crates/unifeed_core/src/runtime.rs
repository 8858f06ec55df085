/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::AccountRegistry;
use crate::api::{self, AppState};
use crate::avatar::AvatarCache;
use crate::config::ServiceConfig;
use crate::dispatcher::{Dispatcher, DispatcherContext, LoggingContacts};
use crate::http_fetch::{ReqwestTransport, Transport};
use crate::mock_protocol::MockProtocol;
use crate::protocol::ProtocolRegistry;
use crate::scheduler::{self, Cadence};
use crate::shortener::Shortener;
use crate::stream_store::StreamStore;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::watch;
use tracing::{error, info, warn};

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);

struct RunningCore {
    shutdown_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
}

static REGISTRY: Mutex<Vec<(u64, RunningCore)>> = Mutex::new(Vec::new());

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("UNIFEED_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("org", "unifeed", "Unifeed")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

/// Start a service core on its own thread. Returns a handle for `stop`.
pub fn start(cfg: ServiceConfig, protocols: ProtocolRegistry) -> Result<u64> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .try_init()
        .ok();

    let handle = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = thread::spawn(move || {
        if let Err(e) = run_core(cfg, protocols, shutdown_rx) {
            error!("core runtime failed: {e:#}");
        }
    });

    let mut reg = REGISTRY.lock().unwrap();
    reg.push((
        handle,
        RunningCore {
            shutdown_tx,
            join: Some(join),
        },
    ));

    Ok(handle)
}

pub fn stop(handle: u64) -> Result<()> {
    let running = {
        let mut reg = REGISTRY.lock().unwrap();
        let idx = reg
            .iter()
            .position(|(h, _)| *h == handle)
            .context("invalid handle")?;
        let (_, mut running) = reg.swap_remove(idx);
        let _ = running.shutdown_tx.send(true);
        running.join.take()
    };

    if let Some(j) = running {
        thread::spawn(move || {
            let _ = j.join();
        });
    }
    Ok(())
}

fn run_core(
    cfg: ServiceConfig,
    mut protocols: ProtocolRegistry,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        let data_dir = if let Some(dir) = &cfg.data_dir {
            PathBuf::from(dir)
        } else {
            default_data_dir()?
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;
        info!("data dir: {}", data_dir.display());

        let db_path = data_dir.join("unifeed.db");
        let store = StreamStore::open(&db_path);

        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .context("build http client")?;
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(http));

        let avatars = AvatarCache::new(data_dir.join("avatars"), transport.clone())?
            .with_freshness(cfg.avatar_max_age());
        let shortener = if cfg.shorten_urls() {
            Shortener::lookup(cfg.urlshorter(), transport.clone())
        } else {
            Shortener::disabled(transport.clone())
        };

        if cfg.mock_protocol.unwrap_or(false) {
            warn!("mock protocol enabled; registering local mock network");
            protocols.register(Arc::new(MockProtocol::new()));
        }
        info!("protocols registered: {}", protocols.names().join(", "));

        let accounts = AccountRegistry::new();
        let dispatcher = Dispatcher::new(DispatcherContext {
            accounts: accounts.clone(),
            protocols: protocols.clone(),
            store: store.clone(),
            avatars,
            shortener: shortener.clone(),
            contacts: Arc::new(LoggingContacts),
            notify_mode: cfg.notify_mode(),
            op_timeout: cfg.op_timeout(),
            avatar_max_age: cfg.avatar_max_age(),
            max_rows: cfg.max_rows(),
        });

        // The listener must be running before the first account lands so
        // every account gets its immediate initial refresh.
        dispatcher.start_account_listener(shutdown_rx.clone());
        for account in &cfg.accounts {
            accounts.account_added(account.clone());
        }
        info!("accounts configured: {}", accounts.len());

        store.start_persist_worker(db_path.clone(), cfg.persist_interval(), shutdown_rx.clone());
        scheduler::start_schedulers(
            dispatcher.clone(),
            Cadence {
                refresh: cfg.refresh_interval(),
                contacts: cfg.contacts_interval(),
                avatar_expiry: cfg.avatar_expiry_interval(),
                startup_delay: cfg.startup_delay(),
            },
            shutdown_rx.clone(),
        );

        let router = api::router(AppState {
            dispatcher,
            accounts,
            store: store.clone(),
            protocols,
            shortener,
        });

        let addr: SocketAddr = cfg.bind.parse().context("parse bind")?;
        let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
        info!("control surface on http://{addr}");

        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = server_shutdown_rx.changed().await;
            };
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(shutdown)
                .await
        });

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        let _ = server_shutdown_tx.send(true);

        // Last snapshot before exit; failure is logged like any other
        // persist failure.
        let final_store = store.clone();
        let final_path = db_path.clone();
        match tokio::task::spawn_blocking(move || final_store.persist(&final_path)).await {
            Ok(Ok(n)) => info!("final persist wrote {n} rows"),
            Ok(Err(e)) => warn!("final persist failed: {e:#}"),
            Err(e) => warn!("final persist task failed: {e}"),
        }

        let _ = server.await;
        Ok::<(), anyhow::Error>(())
    })
}
