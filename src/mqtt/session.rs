/// Publish session: connection state machine, one-time discovery, metric publication
use log::{debug, error, info, warn};
use tokio::time::{sleep, Duration};

use super::discovery::{discovery_messages, Topics};
use super::{Transport, TransportError};
use crate::models::{Metric, PublishBatch};
use crate::utils::{format_fixed, period_elapsed};

/// Wait between failed connection attempts
pub const RECONNECT_DELAY_MS: u32 = 5000;
/// Granularity of the reconnect wait; the yield hook runs once per slice
pub const YIELD_SLICE_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Outcome of one publish cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishSummary {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct PublishSession<T> {
    transport: T,
    topics: Topics,
    metrics: Vec<Metric>,
    state: ConnectionState,
    announced: bool,
    last_failure_ms: Option<u32>,
    connect_attempts: u32,
}

impl<T: Transport> PublishSession<T> {
    pub fn new(transport: T, topics: Topics, metrics: &[Metric]) -> Self {
        Self {
            transport,
            topics,
            metrics: metrics.to_vec(),
            state: ConnectionState::Disconnected,
            announced: false,
            last_failure_ms: None,
            connect_attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn has_announced(&self) -> bool {
        self.announced
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Clock reading at which the next attempt is allowed, if one failed
    pub fn next_retry_at(&self) -> Option<u32> {
        self.last_failure_ms
            .map(|failed| failed.wrapping_add(RECONNECT_DELAY_MS))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Move the state machine one step
    ///
    /// Attempts a connection when disconnected and no retry delay is pending.
    /// Returns the error of an attempt that failed during this call; the next
    /// attempt is then allowed `RECONNECT_DELAY_MS` later.
    pub async fn advance(&mut self, now_ms: u32) -> Result<ConnectionState, TransportError> {
        if self.state == ConnectionState::Connected && !self.transport.is_connected() {
            warn!("MQTT connection lost");
            self.state = ConnectionState::Disconnected;
        }
        if self.state != ConnectionState::Disconnected {
            return Ok(self.state);
        }
        if let Some(failed) = self.last_failure_ms {
            if !period_elapsed(now_ms, failed, RECONNECT_DELAY_MS) {
                return Ok(self.state);
            }
        }

        self.state = ConnectionState::Connecting;
        self.connect_attempts += 1;
        debug!("MQTT connection attempt {}", self.connect_attempts);

        match self.transport.connect().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.last_failure_ms = None;
                if !self.announced {
                    self.announce().await;
                }
                Ok(self.state)
            }
            Err(e) => {
                error!(
                    "MQTT connect failed: {}, retrying in {} ms",
                    e, RECONNECT_DELAY_MS
                );
                self.state = ConnectionState::Disconnected;
                self.last_failure_ms = Some(now_ms);
                Err(e)
            }
        }
    }

    /// Sit out the reconnect delay in short slices, calling `hook` after each
    pub async fn wait_for_retry<F: FnMut()>(&self, mut hook: F) {
        for _ in 0..RECONNECT_DELAY_MS / YIELD_SLICE_MS {
            sleep(Duration::from_millis(u64::from(YIELD_SLICE_MS))).await;
            hook();
        }
    }

    /// Keep-alive housekeeping; detects a dropped transport
    pub async fn service(&mut self) -> ConnectionState {
        if self.state != ConnectionState::Connected {
            return self.state;
        }
        if let Err(e) = self.transport.service().await {
            warn!("MQTT transport error: {}", e);
        }
        if !self.transport.is_connected() {
            self.state = ConnectionState::Disconnected;
        }
        self.state
    }

    /// Discovery documents for every configured metric, sent retained
    ///
    /// The latch is set even when single messages fail; they are not re-sent.
    async fn announce(&mut self) {
        let messages = match discovery_messages(&self.topics, &self.metrics) {
            Ok(messages) => messages,
            Err(e) => {
                error!("Failed to build discovery documents: {}", e);
                Vec::new()
            }
        };
        for (topic, payload) in &messages {
            if let Err(e) = self.transport.publish(topic, payload.as_bytes(), true).await {
                error!("Failed to publish discovery to {}: {}", topic, e);
            }
        }
        self.announced = true;
        info!(
            "Announced {} metrics for {}",
            messages.len(),
            self.topics.node_id()
        );
    }

    async fn send(&mut self, topic: &str, payload: &[u8], retain: bool, summary: &mut PublishSummary) {
        match self.transport.publish(topic, payload, retain).await {
            Ok(()) => summary.delivered += 1,
            Err(e) => {
                error!("Failed to publish to {}: {}", topic, e);
                summary.dropped += 1;
            }
        }
    }

    /// One message per metric average plus the particulate report
    ///
    /// Failed messages are dropped for this cycle.
    pub async fn publish_batch(&mut self, batch: &PublishBatch) -> PublishSummary {
        let mut summary = PublishSummary::default();

        for average in &batch.metrics {
            let topic = self.topics.state_topic(average.metric);
            let payload = format_fixed(average.value);
            self.send(&topic, payload.as_bytes(), false, &mut summary).await;
        }

        if let Some(report) = &batch.particulate {
            match report.to_json() {
                Ok(json) => {
                    let topic = self.topics.particulate_topic();
                    self.send(&topic, json.as_bytes(), true, &mut summary).await;
                }
                Err(e) => {
                    error!("Failed to serialise particulate report: {}", e);
                    summary.dropped += 1;
                }
            }
        }

        if !self.transport.is_connected() {
            self.state = ConnectionState::Disconnected;
        }
        summary
    }

    pub async fn shutdown(&mut self) {
        if self.transport.is_connected() {
            self.transport.disconnect().await;
            info!("Disconnected from MQTT broker");
        }
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricAverage;
    use crate::mqtt::testing::FakeTransport;
    use crate::particulate::report::generate_report;

    const METRICS: [Metric; 2] = [Metric::Temperature, Metric::Humidity];

    fn session(transport: FakeTransport) -> PublishSession<FakeTransport> {
        PublishSession::new(transport, Topics::new("ha", "node"), &METRICS)
    }

    fn batch(temperature: f32, humidity: f32) -> PublishBatch {
        PublishBatch {
            metrics: vec![
                MetricAverage {
                    metric: Metric::Temperature,
                    value: temperature,
                    samples: 3,
                },
                MetricAverage {
                    metric: Metric::Humidity,
                    value: humidity,
                    samples: 3,
                },
            ],
            particulate: None,
            particulate_samples: 0,
        }
    }

    #[tokio::test]
    async fn failed_connect_schedules_exactly_one_retry() {
        let mut session = session(FakeTransport::scripted(&[false, true]));

        assert!(session.advance(1000).await.is_err());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.connect_attempts(), 1);
        assert_eq!(session.next_retry_at(), Some(6000));

        for now in [1000, 2000, 5999] {
            assert_eq!(session.advance(now).await.unwrap(), ConnectionState::Disconnected);
        }
        assert_eq!(session.connect_attempts(), 1);

        assert_eq!(session.advance(6000).await.unwrap(), ConnectionState::Connected);
        assert_eq!(session.connect_attempts(), 2);
        assert_eq!(session.next_retry_at(), None);
    }

    #[tokio::test]
    async fn retry_delay_survives_clock_rollover() {
        let mut session = session(FakeTransport::scripted(&[false]));
        let failed_at = u32::MAX - 1000;
        assert!(session.advance(failed_at).await.is_err());
        assert_eq!(session.advance(3000).await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(session.advance(3999).await.unwrap(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn discovery_is_announced_once_across_reconnects() {
        let mut session = session(FakeTransport::default());

        session.advance(0).await.unwrap();
        assert!(session.has_announced());
        let configs: Vec<_> = session
            .transport()
            .published
            .iter()
            .filter(|p| p.topic.ends_with("/config"))
            .collect();
        assert_eq!(configs.len(), 2);
        assert!(configs.iter().all(|p| p.retain));

        session.transport_mut().drop_connection();
        assert_eq!(session.service().await, ConnectionState::Disconnected);
        assert_eq!(session.advance(10).await.unwrap(), ConnectionState::Connected);
        assert_eq!(session.transport().connect_calls, 2);

        let config_count = session
            .transport()
            .topics()
            .iter()
            .filter(|t| t.ends_with("/config"))
            .count();
        assert_eq!(config_count, 2);
    }

    #[tokio::test]
    async fn discovery_precedes_state_messages() {
        let mut session = session(FakeTransport::default());
        session.advance(0).await.unwrap();
        session.publish_batch(&batch(21.0, 40.0)).await;

        let topics = session.transport().topics();
        assert_eq!(
            topics,
            vec![
                "ha/sensor/node/temperature/config",
                "ha/sensor/node/humidity/config",
                "ha/sensor/node/temperature/state",
                "ha/sensor/node/humidity/state",
            ]
        );
    }

    #[tokio::test]
    async fn state_messages_are_fixed_point_and_not_retained() {
        let mut session = session(FakeTransport::default());
        session.advance(0).await.unwrap();
        let summary = session.publish_batch(&batch(21.456, 40.0)).await;
        assert_eq!(summary, PublishSummary { delivered: 2, dropped: 0 });

        let transport = session.transport();
        assert_eq!(
            transport.payload_for("ha/sensor/node/temperature/state"),
            Some("21.46")
        );
        assert_eq!(
            transport.payload_for("ha/sensor/node/humidity/state"),
            Some("40.00")
        );
        assert!(transport
            .published
            .iter()
            .filter(|p| p.topic.ends_with("/state"))
            .all(|p| !p.retain));
    }

    #[tokio::test]
    async fn particulate_report_is_retained_json() {
        let mut session = session(FakeTransport::default());
        session.advance(0).await.unwrap();
        let mut batch = batch(20.0, 30.0);
        batch.particulate = Some(generate_report(1.0, 2.0, 3.0));
        batch.particulate_samples = 4;

        session.publish_batch(&batch).await;
        let report = session
            .transport()
            .published
            .iter()
            .find(|p| p.topic == "ha/sensor/node/particulate/state")
            .unwrap();
        assert!(report.retain);
        assert_eq!(
            report.payload,
            r#"{"version":1,"data":[{"pm1":1.0,"pm25":2.0,"pm10":3.0}]}"#
        );
    }

    #[tokio::test]
    async fn failed_message_is_dropped_and_rest_delivered() {
        let mut transport = FakeTransport::default();
        transport
            .failing_topics
            .push("ha/sensor/node/temperature/state".into());
        let mut session = session(transport);
        session.advance(0).await.unwrap();

        let summary = session.publish_batch(&batch(20.0, 30.0)).await;
        assert_eq!(summary, PublishSummary { delivered: 1, dropped: 1 });
        assert!(session.is_connected());
        assert_eq!(
            session.transport().payload_for("ha/sensor/node/temperature/state"),
            None
        );
    }

    #[tokio::test]
    async fn failed_discovery_still_sets_latch() {
        let mut transport = FakeTransport::default();
        transport
            .failing_topics
            .push("ha/sensor/node/humidity/config".into());
        let mut session = session(transport);
        session.advance(0).await.unwrap();
        assert!(session.has_announced());
        assert_eq!(session.transport().topics(), vec!["ha/sensor/node/temperature/config"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_wait_yields_every_slice() {
        let session = session(FakeTransport::default());
        let started = tokio::time::Instant::now();
        let mut calls = 0;
        session.wait_for_retry(|| calls += 1).await;
        assert_eq!(calls, 50);
        assert_eq!(started.elapsed(), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn shutdown_disconnects_transport() {
        let mut session = session(FakeTransport::default());
        session.advance(0).await.unwrap();
        session.shutdown().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.transport().disconnect_calls, 1);
    }
}
