//! Centralized Configuration Management
//!
//! Every component reads its constants from an explicit `NeuronConfig` value
//! instead of process-wide globals. All fields have defaults, so a partial TOML
//! document is a valid configuration.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{NeuronError, Result};

/// Default queue capacity (2^30)
pub const DEFAULT_QUEUE_CAPACITY: usize = 1 << 30;

// ----------------------------------------------------------------------------
// Interval Configuration
// ----------------------------------------------------------------------------

/// Loop periods in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    /// Commander outbound drain period
    pub commander: u64,
    /// Receiver heartbeat period
    pub heartbeat: u64,
    /// Delay before a receiver reconnects
    pub reconnect: u64,
    /// Pause between send attempts
    pub retry: u64,
    /// Publisher twin looper base period
    pub publisher: u64,
    /// Subscriber twin processor period
    pub processor: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            commander: 100,
            heartbeat: 120_000,
            reconnect: 5_000,
            retry: 1_000,
            publisher: 125, // 8 Hz
            processor: 40,  // 25 Hz
        }
    }
}

impl IntervalConfig {
    /// Short periods for tests
    pub fn testing() -> Self {
        Self {
            commander: 10,
            heartbeat: 200,
            reconnect: 50,
            retry: 10,
            publisher: 20,
            processor: 10,
        }
    }

    pub fn commander(&self) -> Duration {
        Duration::from_millis(self.commander)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_millis(self.reconnect)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry)
    }

    pub fn publisher(&self) -> Duration {
        Duration::from_millis(self.publisher)
    }

    pub fn processor(&self) -> Duration {
        Duration::from_millis(self.processor)
    }
}

// ----------------------------------------------------------------------------
// Queue Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of the commander reply queue
    pub reply_capacity: usize,
    /// Capacity of the commander outbound queue
    pub outbound_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            reply_capacity: 1 << 20,
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

// ----------------------------------------------------------------------------
// Behavior Tree Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorTreeConfig {
    /// Bounded length of the forest error queue
    pub error_queue_len: usize,
}

impl Default for BehaviorTreeConfig {
    fn default() -> Self {
        Self {
            error_queue_len: 512,
        }
    }
}

// ----------------------------------------------------------------------------
// Node Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration shared by the commander and receiver roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuronConfig {
    /// Worker identity announced in heartbeats
    pub node_id: String,
    /// Protocol version, its digits feed the obfuscation key
    pub version: String,
    /// Websocket URL a receiver dials
    pub commander_url: String,
    /// Address the commander listens on
    pub listen_addr: String,
    /// Path prefix for the commander's endpoints
    pub commander_root: String,
    /// Log every inbound frame at info level
    pub commander_log: bool,
    /// Attempts made by a receiver before a send is reported as failed
    pub send_retries: u32,
    pub intervals: IntervalConfig,
    pub queues: QueueConfig,
    pub behavior_tree: BehaviorTreeConfig,
}

impl Default for NeuronConfig {
    fn default() -> Self {
        Self {
            node_id: "Neuron".to_string(),
            version: "1.4.7".to_string(),
            commander_url: "ws://127.0.0.1:8800/Commander/Channel".to_string(),
            listen_addr: "0.0.0.0:8800".to_string(),
            commander_root: "/Commander".to_string(),
            commander_log: false,
            send_retries: 3,
            intervals: IntervalConfig::default(),
            queues: QueueConfig::default(),
            behavior_tree: BehaviorTreeConfig::default(),
        }
    }
}

impl NeuronConfig {
    /// Create configuration with short intervals for tests
    pub fn testing() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            intervals: IntervalConfig::testing(),
            queues: QueueConfig {
                reply_capacity: 1024,
                outbound_capacity: 1024,
            },
            behavior_tree: BehaviorTreeConfig { error_queue_len: 16 },
            ..Self::default()
        }
    }

    /// Path of the websocket upgrade endpoint
    pub fn channel_path(&self) -> String {
        format!("{}/Channel", self.commander_root.trim_end_matches('/'))
    }

    /// Path of the enqueue endpoint
    pub fn message_path(&self) -> String {
        format!("{}/Message", self.commander_root.trim_end_matches('/'))
    }

    /// Reject configurations no component could run with
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(NeuronError::config_error("node_id must not be empty"));
        }
        if self.node_id.contains('#') {
            return Err(NeuronError::config_error("node_id must not contain '#'"));
        }
        if self.send_retries == 0 {
            return Err(NeuronError::config_error("send_retries must be at least 1"));
        }
        let intervals = &self.intervals;
        if [
            intervals.commander,
            intervals.heartbeat,
            intervals.publisher,
            intervals.processor,
        ]
        .contains(&0)
        {
            return Err(NeuronError::config_error("loop intervals must be non-zero"));
        }
        if self.queues.reply_capacity == 0 || self.queues.outbound_capacity == 0 {
            return Err(NeuronError::config_error("queue capacities must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NeuronConfig::default();
        assert_eq!(config.node_id, "Neuron");
        assert_eq!(config.intervals.heartbeat(), Duration::from_secs(120));
        assert_eq!(config.queues.reply_capacity, 1 << 20);
        assert_eq!(config.behavior_tree.error_queue_len, 512);
        assert_eq!(config.channel_path(), "/Commander/Channel");
        assert_eq!(config.message_path(), "/Commander/Message");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"node_id":"Worker-7","intervals":{"heartbeat":500}}"#;
        let config: NeuronConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.node_id, "Worker-7");
        assert_eq!(config.intervals.heartbeat, 500);
        assert_eq!(config.intervals.commander, 100);
        assert_eq!(config.version, "1.4.7");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NeuronConfig::testing();
        config.node_id = "a#b".to_string();
        assert!(config.validate().is_err());

        let mut config = NeuronConfig::testing();
        config.intervals.commander = 0;
        assert!(config.validate().is_err());
    }
}
