use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ProbeError};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

/// Periodically probes an established channel so that a silently-dead peer is
/// noticed. Isolated unacknowledged probes are tolerated up to
/// `failure_threshold` in a row; a transport-level probe failure is fatal at
/// once. The dead-callback fires at most once, and never after `stop()`.
pub struct LivenessMonitor {
    stopped: Arc<AtomicBool>,
    probe_task: RwLock<Option<JoinHandle<()>>>,
}

impl LivenessMonitor {
    pub fn start<F>(channel: Arc<dyn Channel>, config: MonitorConfig, on_dead: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));

        let probe_task = {
            let stopped = stopped.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(config.interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                // the first tick completes immediately
                interval.tick().await;

                let mut failures = 0_u32;

                loop {
                    interval.tick().await;

                    if stopped.load(Ordering::Acquire) {
                        return;
                    }

                    match channel.probe(config.probe_timeout).await {
                        Ok(()) => {
                            failures = 0;
                            continue;
                        }
                        Err(ProbeError::Timeout) => {
                            failures += 1;

                            log::warn!(
                                target: "duplexrs_networking::monitor",
                                "probe went unacknowledged ({}/{})",
                                failures, config.failure_threshold
                            );

                            if failures < config.failure_threshold {
                                continue;
                            }
                        }
                        Err(ProbeError::Transport(error)) => {
                            log::error!(
                                target: "duplexrs_networking::monitor",
                                "probe failed on the transport: {}",
                                error
                            );
                        }
                    }

                    // exactly one of {stop, death declaration} wins this swap
                    if !stopped.swap(true, Ordering::AcqRel) {
                        on_dead();
                    }

                    return;
                }
            })
        };

        Self {
            stopped,
            probe_task: Some(probe_task).into(),
        }
    }

    /// Tells the monitor the channel has ended. Once this returns, no further
    /// probe runs and the dead-callback can no longer fire.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);

        if let Some(probe_task) = self.probe_task.write().await.take() {
            probe_task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use test_log::test;
    use tokio::time::sleep;

    // answers the first `failures_before_ack` probes negatively, then acks
    struct ScriptedChannel {
        failures_before_ack: u32,
        transport_failure: bool,
        probes_seen: AtomicU32,
    }

    impl ScriptedChannel {
        fn acking() -> Self {
            Self {
                failures_before_ack: 0,
                transport_failure: false,
                probes_seen: AtomicU32::new(0),
            }
        }

        fn silent() -> Self {
            Self {
                failures_before_ack: u32::MAX,
                transport_failure: false,
                probes_seen: AtomicU32::new(0),
            }
        }

        fn probes_seen(&self) -> u32 {
            self.probes_seen.load(Ordering::Acquire)
        }
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        async fn probe(&self, _timeout: Duration) -> Result<(), ProbeError> {
            let seen = self.probes_seen.fetch_add(1, Ordering::AcqRel);

            if self.transport_failure {
                return Err(ProbeError::Transport("scripted failure".to_string()));
            }

            if seen < self.failures_before_ack {
                return Err(ProbeError::Timeout);
            }

            Ok(())
        }

        async fn join(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(20),
            failure_threshold: 3,
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test(tokio::test)]
    async fn declares_death_after_consecutive_failures() {
        let _ = env_logger::builder().is_test(true).try_init();

        let channel = Arc::new(ScriptedChannel::silent());
        let deaths = Arc::new(AtomicU32::new(0));

        let monitor = {
            let deaths = deaths.clone();
            LivenessMonitor::start(channel.clone(), fast_config(), move || {
                deaths.fetch_add(1, Ordering::AcqRel);
            })
        };

        assert!(wait_for(|| deaths.load(Ordering::Acquire) == 1).await);
        assert!(channel.probes_seen() >= 3);
        assert!(monitor.is_stopped());

        // once dead the decision is final; no second declaration, no probes
        let probes_at_death = channel.probes_seen();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(deaths.load(Ordering::Acquire), 1);
        assert_eq!(channel.probes_seen(), probes_at_death);
    }

    #[test(tokio::test)]
    async fn isolated_failures_below_threshold_are_tolerated() {
        let channel = Arc::new(ScriptedChannel {
            failures_before_ack: 2,
            transport_failure: false,
            probes_seen: AtomicU32::new(0),
        });
        let deaths = Arc::new(AtomicU32::new(0));

        let monitor = {
            let deaths = deaths.clone();
            LivenessMonitor::start(channel.clone(), fast_config(), move || {
                deaths.fetch_add(1, Ordering::AcqRel);
            })
        };

        assert!(wait_for(|| channel.probes_seen() >= 6).await);
        assert_eq!(deaths.load(Ordering::Acquire), 0);

        monitor.stop().await;
    }

    #[test(tokio::test)]
    async fn transport_failure_is_fatal_at_once() {
        let channel = Arc::new(ScriptedChannel {
            failures_before_ack: 0,
            transport_failure: true,
            probes_seen: AtomicU32::new(0),
        });
        let deaths = Arc::new(AtomicU32::new(0));

        let _monitor = {
            let deaths = deaths.clone();
            LivenessMonitor::start(channel.clone(), fast_config(), move || {
                deaths.fetch_add(1, Ordering::AcqRel);
            })
        };

        assert!(wait_for(|| deaths.load(Ordering::Acquire) == 1).await);
        assert_eq!(channel.probes_seen(), 1);
    }

    #[test(tokio::test)]
    async fn stop_prevents_a_late_death_declaration() {
        let channel = Arc::new(ScriptedChannel::silent());
        let deaths = Arc::new(AtomicU32::new(0));

        let monitor = {
            let deaths = deaths.clone();
            LivenessMonitor::start(
                channel.clone(),
                MonitorConfig {
                    failure_threshold: 1,
                    ..fast_config()
                },
                move || {
                    deaths.fetch_add(1, Ordering::AcqRel);
                },
            )
        };

        monitor.stop().await;

        let probes_at_stop = channel.probes_seen();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(deaths.load(Ordering::Acquire), 0);
        assert_eq!(channel.probes_seen(), probes_at_stop);
    }

    #[test(tokio::test)]
    async fn stop_after_healthy_probing_is_clean() {
        let channel = Arc::new(ScriptedChannel::acking());
        let deaths = Arc::new(AtomicU32::new(0));

        let monitor = {
            let deaths = deaths.clone();
            LivenessMonitor::start(channel.clone(), fast_config(), move || {
                deaths.fetch_add(1, Ordering::AcqRel);
            })
        };

        assert!(wait_for(|| channel.probes_seen() >= 2).await);
        monitor.stop().await;

        let probes_at_stop = channel.probes_seen();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(deaths.load(Ordering::Acquire), 0);
        assert!(channel.probes_seen() <= probes_at_stop + 1);
    }
}
