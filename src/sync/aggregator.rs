use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::probe::{exchange, ProbeOptions, Sample};
use super::stats;
use crate::core::{ClientConfig, Error, Grouping, ProbeError, ProbeMode, Result, Target};
use crate::network::{Connection, Connector};

/// A probe that produced no sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    /// Server the probe was sent to
    pub server: String,
    /// Zero-based round number
    pub round: usize,
    pub error: ProbeError,
}

/// Statistics over the samples of one target or of the whole group
#[derive(Debug, Clone)]
pub struct AggregationResult {
    /// Target, or comma-separated targets for a combined result
    pub id: String,
    /// Valid samples in the order they were taken
    pub samples: Vec<Sample>,
    /// Failed probes in the order they happened
    pub failures: Vec<ProbeFailure>,
    pub median_offset_ms: f64,
    pub offset_stdev_ms: f64,
    pub median_rtt_ms: f64,
}

impl AggregationResult {
    /// Summarizes a sample set. Fails with [`Error::NoValidMeasurements`]
    /// when every probe failed.
    pub fn from_samples(
        id: impl Into<String>,
        samples: Vec<Sample>,
        failures: Vec<ProbeFailure>,
    ) -> Result<Self> {
        let id = id.into();
        let offsets: Vec<f64> = samples.iter().map(|s| s.offset_ms).collect();
        let rtts: Vec<f64> = samples.iter().map(|s| s.rtt_ms).collect();

        let (median_offset_ms, median_rtt_ms) = match (stats::median(&offsets), stats::median(&rtts)) {
            (Some(offset), Some(rtt)) => (offset, rtt),
            _ => {
                return Err(Error::NoValidMeasurements {
                    target: id,
                    attempts: failures.len(),
                    failures: failures.len(),
                })
            }
        };

        Ok(AggregationResult {
            id,
            offset_stdev_ms: stats::sample_stdev(&offsets),
            samples,
            failures,
            median_offset_ms,
            median_rtt_ms,
        })
    }

    /// Probes attempted, successful or not
    pub fn attempts(&self) -> usize {
        self.samples.len() + self.failures.len()
    }

    /// Rejects results whose median offset is larger than `max_offset_ms`.
    /// An offset exactly at the bound is accepted.
    pub fn check_bound(&self, max_offset_ms: f64) -> Result<()> {
        if self.median_offset_ms.abs() > max_offset_ms {
            return Err(Error::OffsetOutOfRange {
                target: self.id.clone(),
                offset_ms: self.median_offset_ms,
                max_offset_ms,
            });
        }
        Ok(())
    }
}

/// Raw per-target outcome of the probing rounds
#[derive(Debug, Default)]
struct Collected {
    samples: Vec<(usize, Sample)>,
    failures: Vec<(usize, ProbeFailure)>,
}

/// Runs probing rounds against a set of targets and summarizes the results
pub struct Aggregator {
    connector: Arc<dyn Connector>,
    targets: Vec<Target>,
    count: usize,
    interval: Duration,
    mode: ProbeMode,
    grouping: Grouping,
    deadline: Option<Duration>,
    max_offset_ms: f64,
    probe: ProbeOptions,
}

impl Aggregator {
    pub fn new(connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        Aggregator {
            connector,
            targets: config.targets.clone(),
            count: config.count,
            interval: config.interval,
            mode: config.mode,
            grouping: config.grouping,
            deadline: config.deadline,
            max_offset_ms: config.max_offset_ms,
            probe: ProbeOptions {
                timeout: config.timeout,
                padding: config.padding,
            },
        }
    }

    /// Probes every target `count` times and returns one gated result per
    /// target, or a single one for the combined group.
    ///
    /// Never touches the system clock.
    pub async fn run(&self) -> Vec<Result<AggregationResult>> {
        let collected = self.collect().await;
        let results = self.summarize(collected);
        results
            .into_iter()
            .map(|result| {
                let result = result?;
                result.check_bound(self.max_offset_ms)?;
                Ok(result)
            })
            .collect()
    }

    async fn collect(&self) -> Collected {
        let mut collected = Collected::default();
        let mut connections: Vec<Option<Box<dyn Connection>>> =
            self.targets.iter().map(|_| None).collect();

        info!(
            targets = self.targets.len(),
            count = self.count,
            mode = ?self.mode,
            "starting measurement"
        );

        let rounds = self.rounds(&mut collected, &mut connections);
        let finished = match self.deadline {
            Some(limit) => timeout_at(Instant::now() + limit, rounds).await.is_ok(),
            None => {
                rounds.await;
                true
            }
        };

        if !finished {
            warn!(
                samples = collected.samples.len(),
                failures = collected.failures.len(),
                "measurement deadline reached, keeping partial results"
            );
        }
        collected
    }

    async fn rounds(&self, collected: &mut Collected, connections: &mut [Option<Box<dyn Connection>>]) {
        for round in 0..self.count {
            match self.mode {
                ProbeMode::Sequential => {
                    for (index, (target, slot)) in self.targets.iter().zip(connections.iter_mut()).enumerate() {
                        let outcome = self.probe_target(target, slot).await;
                        record(collected, index, target, round, outcome);
                    }
                }
                ProbeMode::Concurrent => {
                    // Record each outcome as it lands so a deadline keeps finished probes
                    let mut probes: FuturesUnordered<_> = self
                        .targets
                        .iter()
                        .zip(connections.iter_mut())
                        .enumerate()
                        .map(move |(index, (target, slot))| async move {
                            (index, target, self.probe_target(target, slot).await)
                        })
                        .collect();
                    while let Some((index, target, outcome)) = probes.next().await {
                        record(collected, index, target, round, outcome);
                    }
                }
            }

            if round + 1 < self.count {
                sleep(self.interval).await;
            }
        }
    }

    /// One probe on a reused connection. A connection whose probe failed is
    /// dropped and reopened next time.
    async fn probe_target(
        &self,
        target: &Target,
        slot: &mut Option<Box<dyn Connection>>,
    ) -> std::result::Result<Sample, ProbeError> {
        let connection = match slot.take() {
            Some(connection) => connection,
            None => match timeout(self.probe.timeout, self.connector.open(target)).await {
                Ok(Ok(connection)) => {
                    debug!(%target, peer = %connection.peer(), "connection opened");
                    connection
                }
                Ok(Err(e)) => return Err(ProbeError::Transport(e.to_string())),
                Err(_) => return Err(ProbeError::Timeout),
            },
        };

        let (mut sender, mut receiver) = match timeout(self.probe.timeout, connection.open_channel()).await {
            Ok(channel) => channel?,
            Err(_) => return Err(ProbeError::Timeout),
        };

        let sample = exchange(
            sender.as_mut(),
            receiver.as_mut(),
            &target.to_string(),
            &self.probe,
        )
        .await?;

        *slot = Some(connection);
        Ok(sample)
    }

    fn summarize(&self, collected: Collected) -> Vec<Result<AggregationResult>> {
        match self.grouping {
            Grouping::Combined => {
                let id = self
                    .targets
                    .iter()
                    .map(Target::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                let samples = collected.samples.into_iter().map(|(_, s)| s).collect();
                let failures = collected.failures.into_iter().map(|(_, f)| f).collect();
                vec![AggregationResult::from_samples(id, samples, failures)]
            }
            Grouping::PerTarget => self
                .targets
                .iter()
                .enumerate()
                .map(|(index, target)| {
                    let samples = collected
                        .samples
                        .iter()
                        .filter(|(i, _)| *i == index)
                        .map(|(_, s)| s.clone())
                        .collect();
                    let failures = collected
                        .failures
                        .iter()
                        .filter(|(i, _)| *i == index)
                        .map(|(_, f)| f.clone())
                        .collect();
                    AggregationResult::from_samples(target.to_string(), samples, failures)
                })
                .collect(),
        }
    }
}

fn record(
    collected: &mut Collected,
    index: usize,
    target: &Target,
    round: usize,
    outcome: std::result::Result<Sample, ProbeError>,
) {
    match outcome {
        Ok(sample) => collected.samples.push((index, sample)),
        Err(error) => {
            debug!(%target, round, error = %error, "probe failed, skipping");
            collected.failures.push((
                index,
                ProbeFailure {
                    server: target.to_string(),
                    round,
                    error,
                },
            ));
        }
    }
}
