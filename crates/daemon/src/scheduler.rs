//! Scheduling loop.
//!
//! Signs the machine in as a client, leases jobs while inside the client's
//! availability window and sleeps otherwise. The loop wakes early on a wake
//! or resume signal and stops on shutdown, always after the current job.

use crate::broadcast::{spawn_cache_feeder, CacheTransport};
use crate::config::{Config, ConfigError};
use crate::encode::Encoder;
use crate::library::{new_shared_cache, SharedLibraryCache};
use crate::state::{
    current_config, new_shared_status, PauseReason, ServiceStatus, SharedConfig, SharedStatus,
    Signal,
};
use crate::store::{Client, JobStore, StoreError};
use crate::worker::Worker;
use chrono::{Local, NaiveTime, Timelike};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wait between cycles inside the availability window
pub const ACTIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Wait between cycles outside the availability window
pub const SLEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How long the cache feeder and relay get to stop on shutdown
pub const FEEDER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// `H:MM` to minutes after midnight.
pub fn parse_time_of_day(value: &str) -> Option<u32> {
    let (h, m) = value.trim().split_once(':')?;
    let h: u32 = h.trim().parse().ok()?;
    let m: u32 = m.trim().parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

/// Whether `now` lies in `[start, end)`, wrapping past midnight when `end < start`.
///
/// Equal bounds mean always available.
pub fn in_time_span(start: u32, end: u32, now: u32) -> bool {
    if start == end {
        true
    } else if start < end {
        start <= now && now < end
    } else {
        now >= start || now < end
    }
}

/// Whether `client` may lease jobs at `now`. Unparsable bounds count as available.
pub fn client_available(client: &Client, now: NaiveTime) -> bool {
    let start = parse_time_of_day(&client.availability_start);
    let end = parse_time_of_day(&client.availability_end);
    match (start, end) {
        (Some(start), Some(end)) => in_time_span(start, end, now.hour() * 60 + now.minute()),
        _ => {
            warn!(
                "invalid availability window '{}'-'{}', treating as always available",
                client.availability_start, client.availability_end
            );
            true
        }
    }
}

/// Control surface of a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    status: SharedStatus,
    wake: Arc<Signal>,
    resume: Arc<Signal>,
    stop: CancellationToken,
}

impl ServiceHandle {
    pub fn pause(&self, reason: PauseReason) {
        info!("pausing: {}", reason);
        self.status.write().pause(reason);
    }

    pub fn resume(&self) {
        info!("resuming");
        self.status.write().resume();
        self.resume.raise();
    }

    /// End the current wait early.
    pub fn wake(&self) {
        self.wake.raise();
    }

    /// Stop after the current job.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.status.write().shutting_down = true;
        self.stop.cancel();
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

pub struct Service {
    store: Arc<dyn JobStore>,
    worker: Arc<Worker>,
    config: SharedConfig,
    config_path: Option<PathBuf>,
    cache: SharedLibraryCache,
    status: SharedStatus,
    wake: Arc<Signal>,
    resume: Arc<Signal>,
    stop: CancellationToken,
    hostname: String,
    transport: CacheTransport,
}

impl Service {
    /// Wire up a service. `config_path`, when given, is reloaded into `config` every cycle.
    ///
    /// The shared cache transport is taken from the configuration at this point.
    pub fn new(
        config: SharedConfig,
        config_path: Option<PathBuf>,
        store: Arc<dyn JobStore>,
        encoder: Arc<dyn Encoder>,
        hostname: impl Into<String>,
    ) -> Self {
        let transport = CacheTransport::from_config(&current_config(&config).shared_cache);
        Self::with_transport(config, config_path, store, encoder, hostname, transport)
    }

    /// Wire up a service publishing through `transport`.
    pub fn with_transport(
        config: SharedConfig,
        config_path: Option<PathBuf>,
        store: Arc<dyn JobStore>,
        encoder: Arc<dyn Encoder>,
        hostname: impl Into<String>,
        transport: CacheTransport,
    ) -> Self {
        let hostname = hostname.into();
        let cache = new_shared_cache();
        let status = new_shared_status();
        let resume = Arc::new(Signal::new());
        let worker = Arc::new(Worker::new(
            config.clone(),
            encoder,
            transport.broadcaster(),
            cache.clone(),
            status.clone(),
            resume.clone(),
            hostname.clone(),
        ));

        Self {
            store,
            worker,
            config,
            config_path,
            cache,
            status,
            wake: Arc::new(Signal::new()),
            resume,
            stop: CancellationToken::new(),
            hostname,
            transport,
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            status: self.status.clone(),
            wake: self.wake.clone(),
            resume: self.resume.clone(),
            stop: self.stop.clone(),
        }
    }

    /// Run until shutdown. Returns after signing the client out.
    pub async fn run(self) -> Result<(), ServiceError> {
        let mut client = self.store.client_for_machine(&self.hostname).await?;
        self.store.sign_in(&client).await?;
        info!("signed in as {}", client.name);

        let feeder_cancel = CancellationToken::new();
        let feeder = self
            .transport
            .subscribe()
            .map(|rx| spawn_cache_feeder(rx, self.cache.clone(), feeder_cancel.clone()));
        let relay = self.transport.spawn_relay(feeder_cancel.clone());

        let mut window_open: Option<bool> = None;
        while !self.stop.is_cancelled() {
            self.reload_config();

            let available = client_available(&client, Local::now().time());
            if window_open != Some(available) {
                if available {
                    info!("inside availability window, starting work");
                } else {
                    info!(
                        "outside availability window {}-{}, sleeping",
                        client.availability_start, client.availability_end
                    );
                }
                window_open = Some(available);
                self.status.write().sleeping = !available;
            }

            let paused = self.status.read().paused;
            if available && !paused {
                self.process_next(&client).await;
            }

            let timeout = if available { ACTIVE_INTERVAL } else { SLEEP_INTERVAL };
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.wake.wait() => debug!("woken"),
                _ = self.resume.wait() => debug!("resumed"),
                _ = tokio::time::sleep(timeout) => {}
            }

            match self.store.client_for_machine(&self.hostname).await {
                Ok(fresh) => client = fresh,
                Err(e) => warn!("could not refresh client record: {}", e),
            }
        }

        info!("stopping service");
        feeder_cancel.cancel();
        for (name, handle) in [("cache feeder", feeder), ("redis relay", relay)] {
            if let Some(handle) = handle {
                if tokio::time::timeout(FEEDER_GRACE, handle).await.is_err() {
                    warn!("{} did not stop within {:?}", name, FEEDER_GRACE);
                }
            }
        }
        self.store.sign_out(&client).await?;
        info!("signed out {}", client.name);
        Ok(())
    }

    /// Swap in the configuration file. Keeps the last good one on failure.
    fn reload_config(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        match Config::load(path) {
            Ok(config) => *self.config.write() = Arc::new(config),
            Err(e) => warn!("could not reload {}: {}, keeping previous configuration", path.display(), e),
        }
    }

    /// Lease, delete and process one job.
    async fn process_next(&self, client: &Client) {
        let job = match self.store.lease_next_job(client).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("no job for {}", client.name);
                return;
            }
            Err(e) => {
                warn!("could not lease job: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.delete_job(&job.id).await {
            error!("could not delete leased job {}, pausing: {}", job.id, e);
            self.status.write().pause(PauseReason::JobDelete);
            return;
        }

        let worker = self.worker.clone();
        match tokio::task::spawn_blocking(move || worker.process_job(&job)).await {
            Ok(outcome) => debug!("job finished: {:?}", outcome),
            Err(e) => error!("job task failed: {}", e),
        }
    }
}
