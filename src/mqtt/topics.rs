//! Topic naming for device channels
//!
//! Every device owns three topics under a fixed namespace:
//!
//! ```text
//! <ns>/devices/<id>/status     device → app, retained by the device
//! <ns>/devices/<id>/telemetry  device → app, live samples
//! <ns>/devices/<id>/cmd        app → device
//! ```
//!
//! Names depend only on the namespace and the device id, so they survive
//! process restarts.

use std::fmt;

pub const DEFAULT_NAMESPACE: &str = "mqtt_lukmankh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Status,
    Telemetry,
    Command,
}

impl TopicKind {
    fn suffix(self) -> &'static str {
        match self {
            TopicKind::Status => "status",
            TopicKind::Telemetry => "telemetry",
            TopicKind::Command => "cmd",
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Maps device ids to topic strings under one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNamer {
    namespace: String,
}

impl Default for TopicNamer {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl TopicNamer {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace: String = namespace.into();
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn topic_for(&self, kind: TopicKind, device_id: &str) -> String {
        format!("{}/devices/{}/{}", self.namespace, device_id, kind.suffix())
    }

    pub fn device_topics(&self, device_id: &str) -> DeviceTopics {
        DeviceTopics {
            status: self.topic_for(TopicKind::Status, device_id),
            telemetry: self.topic_for(TopicKind::Telemetry, device_id),
            command: self.topic_for(TopicKind::Command, device_id),
        }
    }

    /// Topic carrying the dashboard client's last will
    pub fn last_will(&self) -> String {
        format!("{}/web/lastwill", self.namespace)
    }
}

/// The three topics of a single device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub status: String,
    pub telemetry: String,
    pub command: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_deterministic_and_distinct() {
        let namer = TopicNamer::default();
        let first = namer.topic_for(TopicKind::Status, "D1");
        let second = namer.topic_for(TopicKind::Status, "D1");
        assert_eq!(first, second);
        assert_ne!(first, namer.topic_for(TopicKind::Telemetry, "D1"));
        assert_ne!(first, namer.topic_for(TopicKind::Command, "D1"));
    }

    #[test]
    fn topics_follow_wire_layout() {
        let topics = TopicNamer::new("plant/").device_topics("PAMITS001");
        assert_eq!(topics.status, "plant/devices/PAMITS001/status");
        assert_eq!(topics.telemetry, "plant/devices/PAMITS001/telemetry");
        assert_eq!(topics.command, "plant/devices/PAMITS001/cmd");
    }

    #[test]
    fn different_devices_never_share_topics() {
        let namer = TopicNamer::default();
        assert_ne!(
            namer.topic_for(TopicKind::Status, "D1"),
            namer.topic_for(TopicKind::Status, "D2")
        );
    }
}
