/// Home Assistant MQTT discovery.
///
/// Topics follow `<prefix>/sensor/<node>/<key>/{state,config}`; each config
/// topic carries a small JSON document naming the metric, its unit and its
/// device class.
use serde::Serialize;

use crate::models::Metric;

const COMPONENT: &str = "sensor";
const PARTICULATE_KEY: &str = "particulate";

/// Topic names for one node under a discovery prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    node_id: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn base(&self, key: &str) -> String {
        format!("{}/{}/{}/{}", self.prefix, COMPONENT, self.node_id, key)
    }

    pub fn state_topic(&self, metric: Metric) -> String {
        format!("{}/state", self.base(metric.key()))
    }

    pub fn config_topic(&self, metric: Metric) -> String {
        format!("{}/config", self.base(metric.key()))
    }

    /// Structured particulate report; it has no discovery document
    pub fn particulate_topic(&self) -> String {
        format!("{}/state", self.base(PARTICULATE_KEY))
    }
}

#[derive(Debug, Serialize)]
struct DiscoveryConfig<'a> {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    unit_of_measurement: &'a str,
    state_topic: String,
}

pub fn discovery_payload(topics: &Topics, metric: Metric) -> Result<String, serde_json::Error> {
    serde_json::to_string(&DiscoveryConfig {
        name: format!("{} {}", topics.node_id, metric.display_name()),
        device_class: metric.device_class(),
        unit_of_measurement: metric.unit(),
        state_topic: topics.state_topic(metric),
    })
}

/// (config topic, payload) pairs in channel order
pub fn discovery_messages(
    topics: &Topics,
    metrics: &[Metric],
) -> Result<Vec<(String, String)>, serde_json::Error> {
    metrics
        .iter()
        .map(|&metric| Ok((topics.config_topic(metric), discovery_payload(topics, metric)?)))
        .collect()
}
