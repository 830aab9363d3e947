use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use super::aggregator::{AggregationResult, Aggregator};
use super::probe::Sample;
use super::stats;
use crate::clock::{AdjustmentDecision, AdjustmentPolicy, ClockAdjuster};
use crate::core::{ClientConfig, Error, Result};
use crate::network::Connector;

/// Where a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Measurement,
    Adjustment,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Measurement => write!(f, "measurement"),
            Stage::Adjustment => write!(f, "adjustment"),
        }
    }
}

/// A run that ended without adjusting the clock
#[derive(Debug)]
pub struct SyncFailure {
    pub stage: Stage,
    pub error: Error,
    /// Results that passed measurement, if any
    pub measured: Vec<AggregationResult>,
    /// The offset that would have been applied
    pub offset_ms: Option<f64>,
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)?;
        if let Some(offset) = self.offset_ms {
            let samples: usize = self.measured.iter().map(|r| r.samples.len()).sum();
            write!(f, " (measured offset {:.3}ms from {} samples)", offset, samples)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Outcome of a successful run
#[derive(Debug)]
pub struct SyncReport {
    /// Accepted aggregation results
    pub results: Vec<AggregationResult>,
    /// Targets that were measured but rejected, per-target grouping only
    pub rejected: Vec<Error>,
    /// Offset handed to the clock adjuster
    pub offset_ms: f64,
    pub decision: AdjustmentDecision,
    /// Wall time of the whole run
    pub duration_ms: f64,
}

/// Medians over the samples of one server
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSummary {
    pub server: String,
    pub samples: usize,
    pub median_rtt_ms: f64,
    pub median_offset_ms: f64,
}

impl SyncReport {
    /// Accepted samples grouped by the server that answered them, in the
    /// order servers first appear.
    pub fn server_summaries(&self) -> Vec<ServerSummary> {
        let mut groups: Vec<(&str, Vec<&Sample>)> = Vec::new();
        for sample in self.results.iter().flat_map(|r| r.samples.iter()) {
            match groups.iter_mut().find(|(server, _)| *server == sample.server) {
                Some((_, group)) => group.push(sample),
                None => groups.push((sample.server.as_str(), vec![sample])),
            }
        }

        groups
            .into_iter()
            .filter_map(|(server, group)| {
                let rtts: Vec<f64> = group.iter().map(|s| s.rtt_ms).collect();
                let offsets: Vec<f64> = group.iter().map(|s| s.offset_ms).collect();
                Some(ServerSummary {
                    server: server.to_string(),
                    samples: group.len(),
                    median_rtt_ms: stats::median(&rtts)?,
                    median_offset_ms: stats::median(&offsets)?,
                })
            })
            .collect()
    }
}

/// One synchronization run: measure, gate, adjust, report
pub struct SyncSession {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn ClockAdjuster>,
}

impl SyncSession {
    /// Creates a session after validating `config`
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn ClockAdjuster>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(SyncSession {
            config,
            connector,
            clock,
        })
    }

    pub async fn run(&self) -> std::result::Result<SyncReport, SyncFailure> {
        let started = Instant::now();
        self.log_banner();

        let aggregator = Aggregator::new(self.connector.clone(), &self.config);
        let mut results = Vec::new();
        let mut rejected = Vec::new();
        for outcome in aggregator.run().await {
            match outcome {
                Ok(result) => {
                    log_result(&result);
                    results.push(result);
                }
                Err(e) if e.is_target_fatal() => {
                    warn!(error = %e, "target rejected");
                    rejected.push(e);
                }
                Err(e) => {
                    return Err(SyncFailure {
                        stage: Stage::Measurement,
                        error: e,
                        measured: results,
                        offset_ms: None,
                    })
                }
            }
        }

        // A single result is the group result; otherwise combine the accepted targets
        let offsets: Vec<f64> = results.iter().map(|r| r.median_offset_ms).collect();
        let offset_ms = match stats::median(&offsets) {
            Some(offset) => offset,
            None => {
                let error = rejected.into_iter().next().unwrap_or(Error::NoValidMeasurements {
                    target: String::new(),
                    attempts: 0,
                    failures: 0,
                });
                return Err(SyncFailure {
                    stage: Stage::Measurement,
                    error,
                    measured: Vec::new(),
                    offset_ms: None,
                });
            }
        };

        let policy = AdjustmentPolicy::new(self.config.slew_threshold_ms, self.config.dry_run);
        let decision = match policy.apply(self.clock.as_ref(), offset_ms) {
            Ok(decision) => decision,
            Err(e) => {
                return Err(SyncFailure {
                    stage: Stage::Adjustment,
                    error: e.into(),
                    measured: results,
                    offset_ms: Some(offset_ms),
                })
            }
        };

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            offset_ms,
            mode = %decision.mode,
            applied = decision.applied,
            duration_ms,
            "synchronization complete"
        );

        Ok(SyncReport {
            results,
            rejected,
            offset_ms,
            decision,
            duration_ms,
        })
    }

    fn log_banner(&self) {
        let servers: Vec<String> = self.config.targets.iter().map(|t| t.to_string()).collect();
        info!("TSQ time synchronization starting");
        info!("servers: {}", servers.join(", "));
        info!(
            "queries per server: {}, max offset: {}ms, slew threshold: {}ms",
            self.config.count, self.config.max_offset_ms, self.config.slew_threshold_ms
        );
        if self.config.dry_run {
            warn!("dry run: the system clock will not be adjusted");
        }
    }
}

fn log_result(result: &AggregationResult) {
    info!(
        id = %result.id,
        samples = result.samples.len(),
        attempts = result.attempts(),
        median_offset_ms = result.median_offset_ms,
        stdev_ms = result.offset_stdev_ms,
        median_rtt_ms = result.median_rtt_ms,
        "measurement accepted"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::mock::MockClock;
    use crate::clock::AdjustMode;
    use crate::core::{ClockError, Grouping, Target};
    use crate::network::MemoryConnector;
    use crate::protocol::timestamp;
    use crate::server::Responder;
    use std::time::Duration;

    fn skewed(offset_ms: f64) -> Responder {
        Responder::with_clock(move || timestamp::now().offset_by_ms(offset_ms))
    }

    fn config(hosts: &[&str]) -> ClientConfig {
        ClientConfig {
            targets: hosts.iter().map(|h| Target::new(*h, 443)).collect(),
            count: 3,
            interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn session(connector: MemoryConnector, config: ClientConfig, clock: Arc<MockClock>) -> SyncSession {
        SyncSession::new(config, Arc::new(connector), clock).unwrap()
    }

    #[tokio::test]
    async fn test_slews_small_offset() {
        let clock = Arc::new(MockClock::default());
        let connector = MemoryConnector::new().with_server("a", skewed(100.0));
        let report = session(connector, config(&["a"]), clock.clone()).run().await.unwrap();

        assert_eq!(report.decision.mode, AdjustMode::Slew);
        assert!(report.decision.applied);
        assert_eq!(clock.slewed.lock().unwrap().len(), 1);
        assert!((report.offset_ms - 100.0).abs() < 50.0);
        assert!(report.duration_ms > 0.0);
    }

    #[tokio::test]
    async fn test_steps_large_offset() {
        let clock = Arc::new(MockClock::default());
        let connector = MemoryConnector::new().with_server("a", skewed(-800.0));
        let report = session(connector, config(&["a"]), clock.clone()).run().await.unwrap();
        assert_eq!(report.decision.mode, AdjustMode::Step);
        assert_eq!(clock.stepped.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_measurement_failure_names_stage() {
        let clock = Arc::new(MockClock::default());
        let failure = session(MemoryConnector::new(), config(&["gone"]), clock)
            .run()
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Measurement);
        assert!(matches!(failure.error, Error::NoValidMeasurements { .. }));
        assert!(failure.to_string().starts_with("measurement failed"));
    }

    #[tokio::test]
    async fn test_adjustment_failure_keeps_measurement() {
        let clock = Arc::new(MockClock {
            fail_with: Some(ClockError::PermissionDenied),
            ..Default::default()
        });
        let connector = MemoryConnector::new().with_server("a", skewed(0.0));
        let failure = session(connector, config(&["a"]), clock).run().await.unwrap_err();

        assert_eq!(failure.stage, Stage::Adjustment);
        assert!(matches!(failure.error, Error::Clock(ClockError::PermissionDenied)));
        assert_eq!(failure.measured.len(), 1);
        assert!(failure.to_string().contains("from 3 samples"));
    }

    #[tokio::test]
    async fn test_per_target_combines_accepted_medians() {
        let clock = Arc::new(MockClock::default());
        let connector = MemoryConnector::new()
            .with_server("a", skewed(100.0))
            .with_server("b", skewed(120.0))
            .with_server("c", skewed(4_000.0));
        let mut config = config(&["a", "b", "c"]);
        config.grouping = Grouping::PerTarget;
        config.dry_run = true;

        let report = session(connector, config, clock).run().await.unwrap();
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(report.rejected[0], Error::OffsetOutOfRange { .. }));
        assert!((report.offset_ms - 110.0).abs() < 50.0);
        assert!(!report.decision.applied);
    }

    #[tokio::test]
    async fn test_server_summaries_split_combined_result() {
        let clock = Arc::new(MockClock::default());
        let connector = MemoryConnector::new()
            .with_server("a", skewed(100.0))
            .with_server("b", skewed(-100.0));
        let mut config = config(&["a", "b"]);
        config.dry_run = true;

        let report = session(connector, config, clock).run().await.unwrap();
        assert_eq!(report.results.len(), 1);

        let summaries = report.server_summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].server, "a:443");
        assert_eq!(summaries[0].samples, 3);
        assert!((summaries[0].median_offset_ms - 100.0).abs() < 50.0);
        assert_eq!(summaries[1].server, "b:443");
        assert!((summaries[1].median_offset_ms + 100.0).abs() < 50.0);
        assert!(summaries.iter().all(|s| s.median_rtt_ms >= 0.0));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let clock: Arc<dyn ClockAdjuster> = Arc::new(MockClock::default());
        let result = SyncSession::new(ClientConfig::default(), Arc::new(MemoryConnector::new()), clock);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
