//! Running the server.
//!
//! This module wires all subsystems together and drives them until the
//! process is told to stop. Construction happens in one pass: either every
//! part comes up and a fully connected server runs, or a single error is
//! returned and nothing keeps running half-initialized.

use std::sync::Arc;
use log::{error, info, warn};
use tokio::sync::watch;
use crate::aspa::AspaStore;
use crate::aspath::AsPathCache;
use crate::bgpsec::{CryptoProvider, KeyKind, NullCrypto, RingProvider};
use crate::command::CommandHandler;
use crate::config::Config;
use crate::error::ExitError;
use crate::metrics::ServerMetrics;
use crate::prefixes::PrefixCache;
use crate::queue::WorkQueue;
use crate::rpki::{RpkiFeed, RpkiQueue, RpkiWorker};
use crate::server::{Broadcaster, ProxyMap, Server};
use crate::updates::UpdateCache;


/// How often the zombie reaper runs.
const PURGE_INTERVAL_SECS: u64 = 60;


//------------ run -----------------------------------------------------------

/// Builds all subsystems and serves until interrupted.
pub fn run(config: Config) -> Result<(), ExitError> {
    config.switch_logging()?;
    let config = Arc::new(config);

    let metrics = Arc::new(ServerMetrics::new());
    let proxy_map = Arc::new(ProxyMap::new(config.default_keep_window));
    proxy_map.configure(&config.mapping_router_id);
    let broadcaster = Arc::new(
        Broadcaster::new(proxy_map.clone(), metrics.clone())
    );
    let update_cache = Arc::new(UpdateCache::new(broadcaster));
    let prefix_cache = Arc::new(PrefixCache::new(update_cache.clone()));
    let aspa_store = Arc::new(AspaStore::new());
    let aspath_cache = Arc::new(AsPathCache::new());

    let crypto: Arc<dyn CryptoProvider> = match config.keys_dir {
        Some(ref dir) => {
            Arc::new(RingProvider::load_keys(dir, KeyKind::Both)?)
        }
        None => {
            warn!(
                "No key directory configured; \
                 BGPsec requests will be answered with invalid."
            );
            Arc::new(NullCrypto)
        }
    };

    let cmd_queue = Arc::new(WorkQueue::new());
    let rpki_queue = Arc::new(RpkiQueue::new());

    // The RTR transport is not part of the core; whatever drives it gets
    // its change feed through this handle.
    let _rpki_feed = RpkiFeed::new(rpki_queue.clone());
    info!(
        "Expecting RPKI data for {}:{}",
        config.rpki_host, config.rpki_port
    );

    let handler = Arc::new(CommandHandler::new(
        config.clone(),
        cmd_queue.clone(),
        proxy_map.clone(),
        update_cache.clone(),
        prefix_cache.clone(),
        aspath_cache.clone(),
        aspa_store.clone(),
        crypto,
        metrics.clone(),
    ));
    let workers = handler.spawn_pool(config.effective_command_threads());
    let rpki_worker = RpkiWorker {
        queue: rpki_queue.clone(),
        prefix_cache,
        aspa_store,
        aspath_cache,
        update_cache: update_cache.clone(),
    }.spawn();

    info!(
        "Serving up to {} expected proxies with {} command threads.",
        config.expected_proxies, config.effective_command_threads()
    );
    let server = Arc::new(Server {
        config: config.clone(),
        cmd_queue: cmd_queue.clone(),
        proxy_map,
        update_cache: update_cache.clone(),
        metrics,
        direct_handler: if config.mode_no_receivequeue {
            Some(handler.clone())
        }
        else {
            None
        },
    });

    // The write-through send mode parks a worker while a frame drains, so
    // the runtime always gets a second worker to drain it on.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .build()
        .map_err(|err| {
            error!("Failed to start the runtime: {}", err);
            ExitError::Runtime
        })?;
    let res = runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(server.run(shutdown_rx));
        let reaper = {
            let update_cache = update_cache.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(
                    std::time::Duration::from_secs(PURGE_INTERVAL_SECS)
                );
                loop {
                    interval.tick().await;
                    let reaped = update_cache.purge_expired();
                    if reaped > 0 {
                        info!("Reaped {} expired updates.", reaped);
                    }
                }
            })
        };

        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down.");
        let _ = shutdown_tx.send(true);
        reaper.abort();
        match listener.await {
            Ok(res) => res,
            Err(_) => Err(ExitError::Runtime),
        }
    });

    rpki_queue.close();
    let _ = rpki_worker.join();
    handler.stop_pool(workers);
    info!("Shutdown complete.");
    res
}
