pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::{
    Bootstrap, BootstrapContext, FixedGrainAggregator, FixedSettings, Grain, RollingAggregator,
    RollingGroup, Tier, TotalBootstrap, WindowBootstrap, Width,
};
use crate::beacon::{self, BeaconClient};
use crate::clock::{Clock, EpochTiming};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::ClickHouseWriter;
use crate::pipeline::{InsertPipeline, TransferPipeline};
use crate::source::RemoteSource;
use crate::store::{GapDetector, HotStore, Level, PartitionManager};

use worker::{spawn_loop, LoopTiming};

/// The three stored levels, finest first.
struct Tiers {
    epoch: Tier,
    hourly: Tier,
    daily: Tier,
}

impl Tiers {
    fn get(&self, level: Level) -> &Tier {
        match level {
            Level::Epoch => &self.epoch,
            Level::Hourly => &self.hourly,
            Level::Daily => &self.daily,
        }
    }
}

/// Agent wires every component together: beacon, clock, hot store,
/// archive and the background loops.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    clock: Option<Clock>,
    store: Option<HotStore>,
    ch_writer: Option<ClickHouseWriter>,
    loops: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            clock: None,
            store: None,
            ch_writer: None,
            loops: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and spawn the enabled loops.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Chain parameters from the beacon node.
        let beacon = self.create_beacon_client()?;
        let genesis = beacon
            .fetch_genesis()
            .await
            .context("fetching beacon genesis")?;
        let spec = beacon.fetch_spec().await.context("fetching beacon spec")?;
        info!(
            genesis_time = ?genesis.genesis_time,
            seconds_per_slot = spec.seconds_per_slot,
            slots_per_epoch = spec.slots_per_epoch,
            "fetched chain parameters",
        );

        // 2. Wall clock.
        let clock = Clock::new(
            genesis.genesis_time,
            spec.seconds_per_slot,
            spec.slots_per_epoch,
        )
        .context("creating clock")?;
        {
            let health = Arc::clone(&self.health);
            clock.on_epoch_changed(Box::new(move |epoch| {
                health.wallclock_epoch.set(epoch as f64);
            }));
        }
        self.health.wallclock_epoch.set(clock.current_epoch() as f64);
        clock.start();
        let timing = clock.timing();
        self.clock = Some(clock);

        // 3. Hot store.
        let store = HotStore::open(&self.cfg.store).await?;
        store.migrate().await?;
        let tiers = self.build_tiers(&store, timing)?;
        let gaps = GapDetector::new(store.pool().clone(), tiers.epoch.retention);

        // 4. Rolling windows first: the insert loop asks them for priorities.
        let rolling = if self.cfg.rolling.enabled {
            Some(Arc::new(self.build_rolling(&store, &tiers, &gaps, timing).await?))
        } else {
            None
        };

        // 5. Insert loop.
        if self.cfg.insert.enabled {
            let source = RemoteSource::new(&self.cfg.source, self.create_beacon_client()?)
                .context("creating epoch source")?;
            let insert = Arc::new(InsertPipeline::new(
                Arc::new(source),
                &store,
                Arc::clone(&tiers.epoch.partitions),
                self.cfg.insert.clone(),
                tiers.epoch.retention,
                Arc::clone(&self.health),
            ));
            let metadata = store.metadata();
            let rolling = rolling.clone();

            self.spawn("insert", self.cfg.insert.poll_interval, move || {
                let insert = Arc::clone(&insert);
                let metadata = metadata.clone();
                let rolling = rolling.clone();
                async move {
                    if let (Some(group), Some(head)) = (&rolling, metadata.latest_inserted().await?) {
                        insert.set_priority(group.repair_priorities(head).await?);
                    }
                    insert.run_cycle().await.map(|_| ())
                }
            });
        }

        // 6. Transfer loop.
        if self.cfg.transfer.enabled {
            let mut writer = ClickHouseWriter::new(self.cfg.transfer.clickhouse.clone());
            writer.start().await.context("starting ClickHouse writer")?;
            let archive = writer.archive(Arc::clone(&self.health))?;
            self.ch_writer = Some(writer);
            info!(
                endpoint = %self.cfg.transfer.clickhouse.endpoint,
                "archive configured",
            );

            let transfer = Arc::new(TransferPipeline::new(
                Arc::new(archive),
                &store,
                Arc::clone(&tiers.epoch.partitions),
                self.cfg.transfer.clone(),
                Arc::clone(&self.health),
            ));
            self.spawn("transfer", self.cfg.transfer.poll_interval, move || {
                let transfer = Arc::clone(&transfer);
                async move { transfer.run_cycle().await.map(|_| ()) }
            });
        }

        // 7. Fixed-grain loop: hourly from epochs, then daily from hourly.
        if self.cfg.aggregation.enabled {
            let settings = FixedSettings {
                max_buckets_per_cycle: self.cfg.aggregation.max_buckets_per_cycle,
                prune_buffer: timing.epochs_covering(self.cfg.aggregation.prune_buffer),
                hold_untransferred: self.cfg.transfer.enabled,
                prune_target: false,
            };
            let hourly = FixedGrainAggregator::new(
                tiers.epoch.clone(),
                tiers.hourly.clone(),
                &store,
                gaps.clone(),
                settings,
                Arc::clone(&self.health),
            );
            let daily = FixedGrainAggregator::new(
                tiers.hourly.clone(),
                tiers.daily.clone(),
                &store,
                gaps.clone(),
                FixedSettings {
                    hold_untransferred: false,
                    prune_target: true,
                    ..settings
                },
                Arc::clone(&self.health),
            );
            let levels = Arc::new([hourly, daily]);

            self.spawn("aggregate", self.cfg.aggregation.poll_interval, move || {
                let levels = Arc::clone(&levels);
                async move {
                    for agg in levels.iter() {
                        let cycle = agg.run_cycle().await?;
                        if cycle.buckets > 0 || !cycle.pruned.is_empty() {
                            info!(
                                level = %agg.level(),
                                buckets = cycle.buckets,
                                frontier = ?cycle.frontier,
                                pruned = cycle.pruned.len(),
                                "aggregation cycle"
                            );
                        }
                    }
                    Ok(())
                }
            });
        }

        // 8. Rolling loop.
        if let Some(group) = rolling {
            self.spawn("rolling", self.cfg.rolling.poll_interval, move || {
                let group = Arc::clone(&group);
                async move { group.run_cycle().await.map(|_| ()) }
            });
        }

        self.store = Some(store);
        info!(loops = self.loops.len(), "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components. In-flight cycles get
    /// `shutdown_timeout` to finish before they are aborted.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(clock) = &self.clock {
            clock.stop();
        }

        let deadline = tokio::time::Instant::now() + self.cfg.shutdown_timeout;
        for mut handle in self.loops.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "loop task panicked"),
                Err(_) => {
                    warn!("shutdown timeout reached, aborting loop");
                    handle.abort();
                }
            }
        }

        if let Some(writer) = &mut self.ch_writer {
            if let Err(e) = writer.stop().await {
                error!(error = %e, "error stopping ClickHouse writer");
            }
        }

        if let Some(store) = self.store.take() {
            store.close().await;
        }

        self.health.stop().await?;

        Ok(())
    }

    fn spawn<F, Fut>(&mut self, name: &'static str, interval: std::time::Duration, cycle: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let timing = LoopTiming {
            interval,
            error_backoff: self.cfg.error_backoff,
        };
        let handle = spawn_loop(
            name,
            timing,
            self.cancel.child_token(),
            Arc::clone(&self.health),
            cycle,
        );
        self.loops.push(handle);
    }

    /// Partition managers and grains of every level, in epochs.
    fn build_tiers(&self, store: &HotStore, timing: EpochTiming) -> Result<Tiers> {
        let tier = |level: Level| -> Result<Tier> {
            let cfg = self.cfg.levels.get(level);
            let width = timing.epochs_in(cfg.partition_width).max(1);
            let partitions = PartitionManager::new(
                store.pool().clone(),
                level,
                width,
                Arc::clone(&self.health),
            )?;
            let retention = cfg.retention.map(|r| timing.epochs_covering(r));
            info!(%level, partition_epochs = width, retention_epochs = ?retention, "level configured");
            Ok(Tier::new(
                level,
                Grain::for_level(level, timing),
                Arc::new(partitions),
                retention,
            ))
        };

        Ok(Tiers {
            epoch: tier(Level::Epoch)?,
            hourly: tier(Level::Hourly)?,
            daily: tier(Level::Daily)?,
        })
    }

    async fn build_rolling(
        &self,
        store: &HotStore,
        tiers: &Tiers,
        gaps: &GapDetector,
        timing: EpochTiming,
    ) -> Result<RollingGroup> {
        let rolling = &self.cfg.rolling;
        let ctx = BootstrapContext {
            pool: store.pool().clone(),
            buckets: store.buckets(),
            gaps: gaps.clone(),
            parts_in_parallel: rolling.rolling_parts_in_parallel,
        };

        let mut aggregators = Vec::with_capacity(rolling.windows.len() + 1);
        for window in &rolling.windows {
            let strategy = WindowBootstrap::new(
                tiers.get(window.source).clone(),
                Some(timing.epochs_covering(window.threshold())),
            );
            let agg = RollingAggregator::create(
                &window.name,
                Width::Epochs(timing.epochs_covering(window.width)),
                Bootstrap::Window(strategy),
                ctx.clone(),
                Arc::clone(&tiers.epoch.partitions),
                Arc::clone(&self.health),
            )
            .await?;
            aggregators.push(Arc::new(agg));
        }

        if rolling.total {
            let strategy = TotalBootstrap::new(
                tiers.daily.clone(),
                timing.epochs_covering(rolling.total_threshold),
            );
            let agg = RollingAggregator::create(
                "total",
                Width::Unbounded,
                Bootstrap::Total(strategy),
                ctx,
                Arc::clone(&tiers.epoch.partitions),
                Arc::clone(&self.health),
            )
            .await?;
            aggregators.push(Arc::new(agg));
        }

        info!(windows = aggregators.len(), "rolling windows configured");
        Ok(RollingGroup::new(
            aggregators,
            store,
            rolling.rollings_in_parallel,
        ))
    }

    /// Create a beacon client with metrics callback.
    fn create_beacon_client(&self) -> Result<beacon::Client> {
        let client = beacon::Client::new(&self.cfg.beacon).context("creating beacon client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |endpoint, status, duration| {
            health
                .beacon_requests_total
                .with_label_values(&[endpoint, status])
                .inc();
            health
                .beacon_request_duration
                .with_label_values(&[endpoint])
                .observe(duration.as_secs_f64());
        }));

        Ok(client)
    }
}
