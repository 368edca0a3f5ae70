/// In-memory transport for session and scheduler tests
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;

use super::{Transport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Records everything published; connect outcomes are scripted, default success
#[derive(Debug, Default)]
pub struct FakeTransport {
    pub connect_results: VecDeque<bool>,
    pub connected: bool,
    pub connect_calls: usize,
    pub disconnect_calls: usize,
    pub published: Vec<Published>,
    pub failing_topics: Vec<String>,
}

impl FakeTransport {
    pub fn scripted(results: &[bool]) -> Self {
        Self {
            connect_results: results.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// Simulate the broker going away
    pub fn drop_connection(&mut self) {
        self.connected = false;
    }

    pub fn topics(&self) -> Vec<&str> {
        self.published.iter().map(|p| p.topic.as_str()).collect()
    }

    pub fn payload_for(&self, topic: &str) -> Option<&str> {
        self.published
            .iter()
            .rev()
            .find(|p| p.topic == topic)
            .map(|p| p.payload.as_str())
    }
}

impl Transport for FakeTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            self.connect_calls += 1;
            if self.connect_results.pop_front().unwrap_or(true) {
                self.connected = true;
                Ok(())
            } else {
                self.connected = false;
                Err(TransportError::Timeout("connect"))
            }
        }
        .boxed()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: &'a [u8],
        retain: bool,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            if self.failing_topics.iter().any(|t| t == topic) {
                return Err(TransportError::PayloadTooLarge {
                    size: payload.len(),
                    limit: 0,
                });
            }
            self.published.push(Published {
                topic: topic.to_string(),
                payload: String::from_utf8_lossy(payload).into_owned(),
                retain,
            });
            Ok(())
        }
        .boxed()
    }

    fn service(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            if self.connected {
                Ok(())
            } else {
                Err(TransportError::NotConnected)
            }
        }
        .boxed()
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        async move {
            self.disconnect_calls += 1;
            self.connected = false;
        }
        .boxed()
    }
}
