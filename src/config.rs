//! Configuration options the shard layer recognizes.
//!
//! Durations are written the way operators write them in the config file
//! ("7d", "200ms") and parsed with humantime.

use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::shard::ShardType;

/// A duration in its config-file spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(Duration);

impl ConfigDuration {
    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for ConfigDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl FromStr for ConfigDuration {
    type Err = humantime::DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(humantime::parse_duration(s)?))
    }
}

impl fmt::Display for ConfigDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        humantime::format_duration(self.0).fmt(f)
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A compiled regular expression in its config-file spelling.
#[derive(Debug, Clone)]
pub struct ConfigRegex(Regex);

impl ConfigRegex {
    pub fn is_match(&self, input: &str) -> bool {
        self.0.is_match(input)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for ConfigRegex {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl FromStr for ConfigRegex {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Regex::new(s)?))
    }
}

impl Serialize for ConfigRegex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConfigRegex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Knobs for one shard type (short-term or long-term).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSpaceConfig {
    /// Width of each shard's time window.
    pub duration: ConfigDuration,
    /// Number of shards covering the same interval. Writes are spread over
    /// them by hashing (series, database).
    #[serde(default = "default_split")]
    pub split: u32,
    /// Series matching this pattern are placed randomly among the split
    /// shards instead of by hash. Consumed by the coordinator.
    #[serde(default, rename = "split-random")]
    pub split_random: Option<ConfigRegex>,
}

impl ShardSpaceConfig {
    pub fn duration_is_split(&self) -> bool {
        self.split > 1
    }

    pub fn matches_split_random(&self, series: &str) -> bool {
        self.split_random
            .as_ref()
            .map_or(false, |pattern| pattern.is_match(series))
    }
}

fn default_split() -> u32 {
    1
}

fn default_replication_factor() -> u32 {
    1
}

fn default_short_term() -> ShardSpaceConfig {
    ShardSpaceConfig {
        duration: Duration::from_secs(7 * 24 * 3600).into(),
        split: default_split(),
        split_random: None,
    }
}

fn default_long_term() -> ShardSpaceConfig {
    ShardSpaceConfig {
        duration: Duration::from_secs(30 * 24 * 3600).into(),
        split: default_split(),
        split_random: None,
    }
}

/// The `sharding` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Expected size of each shard's replica set.
    #[serde(default = "default_replication_factor", rename = "replication-factor")]
    pub replication_factor: u32,
    #[serde(default = "default_short_term", rename = "short-term")]
    pub short_term: ShardSpaceConfig,
    #[serde(default = "default_long_term", rename = "long-term")]
    pub long_term: ShardSpaceConfig,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            short_term: default_short_term(),
            long_term: default_long_term(),
        }
    }
}

impl ShardingConfig {
    pub fn space(&self, shard_type: ShardType) -> &ShardSpaceConfig {
        match shard_type {
            ShardType::ShortTerm => &self.short_term,
            ShardType::LongTerm => &self.long_term,
        }
    }

    pub fn duration(&self, shard_type: ShardType) -> Duration {
        self.space(shard_type).duration.duration()
    }

    pub fn duration_is_split(&self, shard_type: ShardType) -> bool {
        self.space(shard_type).duration_is_split()
    }
}

fn default_protobuf_timeout() -> ConfigDuration {
    Duration::from_secs(2).into()
}

fn default_protobuf_heartbeat() -> ConfigDuration {
    Duration::from_millis(200).into()
}

fn default_write_buffer_size() -> usize {
    1000
}

fn default_query_shard_buffer_size() -> usize {
    1000
}

/// The `cluster` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Write timeout on replica connections.
    #[serde(default = "default_protobuf_timeout")]
    pub protobuf_timeout: ConfigDuration,
    /// Replica liveness interval feeding `is_up`.
    #[serde(default = "default_protobuf_heartbeat")]
    pub protobuf_heartbeat: ConfigDuration,
    /// Per-server replica write buffer depth.
    #[serde(default = "default_write_buffer_size", rename = "write-buffer-size")]
    pub write_buffer_size: usize,
    /// Minimum response-channel depth per shard.
    #[serde(
        default = "default_query_shard_buffer_size",
        rename = "query-shard-buffer-size"
    )]
    pub query_shard_buffer_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            protobuf_timeout: default_protobuf_timeout(),
            protobuf_heartbeat: default_protobuf_heartbeat(),
            write_buffer_size: default_write_buffer_size(),
            query_shard_buffer_size: default_query_shard_buffer_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_the_config_spelling() {
        let d: ConfigDuration = "7d".parse().unwrap();
        assert_eq!(d.duration(), Duration::from_secs(7 * 24 * 3600));

        let d: ConfigDuration = "200ms".parse().unwrap();
        assert_eq!(d.duration(), Duration::from_millis(200));

        assert!("not a duration".parse::<ConfigDuration>().is_err());
    }

    #[test]
    fn sharding_defaults() {
        let config: ShardingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ShardingConfig::default());
        assert_eq!(config.replication_factor, 1);
        assert_eq!(
            config.duration(ShardType::ShortTerm),
            Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(
            config.duration(ShardType::LongTerm),
            Duration::from_secs(30 * 24 * 3600)
        );
        assert!(!config.duration_is_split(ShardType::ShortTerm));
    }

    #[test]
    fn sharding_section_round_trips() {
        let config: ShardingConfig = serde_json::from_str(
            r#"{
                "replication-factor": 3,
                "short-term": {
                    "duration": "1day",
                    "split": 4,
                    "split-random": "^big_.*"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.replication_factor, 3);
        assert_eq!(
            config.duration(ShardType::ShortTerm),
            Duration::from_secs(24 * 3600)
        );
        assert!(config.duration_is_split(ShardType::ShortTerm));
        assert!(config.short_term.matches_split_random("big_events"));
        assert!(!config.short_term.matches_split_random("cpu"));

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: ShardingConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn cluster_defaults() {
        let config: ClusterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ClusterConfig::default());
        assert_eq!(config.protobuf_timeout.duration(), Duration::from_secs(2));
        assert_eq!(
            config.protobuf_heartbeat.duration(),
            Duration::from_millis(200)
        );
        assert_eq!(config.write_buffer_size, 1000);
        assert_eq!(config.query_shard_buffer_size, 1000);
    }
}
