//! Runtime configuration of a node.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// Election behavior of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMode {
    /// The node takes part in elections.
    Active,
    /// The node replicates but never starts an election, even when it is the
    /// only member of its group.
    Standby,
}

/// Errors from configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("election timeout bounds must satisfy min < max")]
    InvalidElectionTimeoutBounds,
    #[error("replication batch sizes must be greater than 0")]
    InvalidMaxReplicationEntries,
    #[error("catch-up round count must be greater than 0")]
    InvalidCatchUpRounds,
    #[error("snapshot chunk length must be greater than 0")]
    InvalidSnapshotDataLength,
}

/// The runtime configuration of a node.
///
/// Use [`Config::build`] to construct an instance through the builder, which
/// applies defaults and validates the result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The name of the cluster this node belongs to; only used for logging.
    pub cluster_name: String,
    /// The lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// The upper bound of the randomized election timeout, in milliseconds.
    pub election_timeout_max: u64,
    /// The period of the leader's replication ticker, in milliseconds.
    pub log_replication_interval: u64,
    /// The minimum interval between replication messages to a member which
    /// has one in flight already, in milliseconds.
    pub min_replication_interval: u64,
    /// The maximum number of entries per AppendEntries message.
    pub max_replication_entries: u64,
    /// The maximum number of entries per AppendEntries message during a
    /// new-node catch-up.
    pub max_replication_entries_for_new_node: u64,
    /// The number of bytes per InstallSnapshot chunk.
    pub snapshot_data_length: u64,
    /// How long a membership change waits for a previous in-flight change to
    /// commit before giving up, in milliseconds.
    pub previous_group_config_change_timeout: u64,
    /// The overall deadline for a new-node catch-up, in milliseconds.
    pub catch_up_timeout: u64,
    /// The maximum number of catch-up replication rounds.
    pub catch_up_rounds: u32,
    /// The deadline for a single catch-up round, in milliseconds.
    pub catch_up_round_timeout: u64,
    /// Whether the node takes part in elections.
    pub mode: NodeMode,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            log_replication_interval: None,
            min_replication_interval: None,
            max_replication_entries: None,
            max_replication_entries_for_new_node: None,
            snapshot_data_length: None,
            previous_group_config_change_timeout: None,
            catch_up_timeout: None,
            catch_up_rounds: None,
            catch_up_round_timeout: None,
            mode: None,
        }
    }

    /// Generate a new random election timeout within the configured bounds,
    /// in milliseconds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    log_replication_interval: Option<u64>,
    min_replication_interval: Option<u64>,
    max_replication_entries: Option<u64>,
    max_replication_entries_for_new_node: Option<u64>,
    snapshot_data_length: Option<u64>,
    previous_group_config_change_timeout: Option<u64>,
    catch_up_timeout: Option<u64>,
    catch_up_rounds: Option<u32>,
    catch_up_round_timeout: Option<u64>,
    mode: Option<NodeMode>,
}

impl ConfigBuilder {
    /// Set the election timeout bounds, in milliseconds.
    pub fn election_timeout(mut self, min: u64, max: u64) -> Self {
        self.election_timeout_min = Some(min);
        self.election_timeout_max = Some(max);
        self
    }

    /// Set the replication ticker period, in milliseconds.
    pub fn log_replication_interval(mut self, val: u64) -> Self {
        self.log_replication_interval = Some(val);
        self
    }

    /// Set the minimum replication interval, in milliseconds.
    pub fn min_replication_interval(mut self, val: u64) -> Self {
        self.min_replication_interval = Some(val);
        self
    }

    /// Set the maximum number of entries per AppendEntries message.
    pub fn max_replication_entries(mut self, val: u64) -> Self {
        self.max_replication_entries = Some(val);
        self
    }

    /// Set the maximum number of entries per catch-up AppendEntries message.
    pub fn max_replication_entries_for_new_node(mut self, val: u64) -> Self {
        self.max_replication_entries_for_new_node = Some(val);
        self
    }

    /// Set the number of bytes per InstallSnapshot chunk.
    pub fn snapshot_data_length(mut self, val: u64) -> Self {
        self.snapshot_data_length = Some(val);
        self
    }

    /// Set the timeout for awaiting a previous membership change, in
    /// milliseconds.
    pub fn previous_group_config_change_timeout(mut self, val: u64) -> Self {
        self.previous_group_config_change_timeout = Some(val);
        self
    }

    /// Set the overall catch-up timeout, in milliseconds.
    pub fn catch_up_timeout(mut self, val: u64) -> Self {
        self.catch_up_timeout = Some(val);
        self
    }

    /// Set the maximum number of catch-up rounds.
    pub fn catch_up_rounds(mut self, val: u32) -> Self {
        self.catch_up_rounds = Some(val);
        self
    }

    /// Set the per-round catch-up deadline, in milliseconds.
    pub fn catch_up_round_timeout(mut self, val: u64) -> Self {
        self.catch_up_round_timeout = Some(val);
        self
    }

    /// Set the node mode.
    pub fn mode(mut self, mode: NodeMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Validate the state of this builder, returning a config on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let config = Config {
            cluster_name: self.cluster_name,
            election_timeout_min: self.election_timeout_min.unwrap_or(150),
            election_timeout_max: self.election_timeout_max.unwrap_or(300),
            log_replication_interval: self.log_replication_interval.unwrap_or(50),
            min_replication_interval: self.min_replication_interval.unwrap_or(20),
            max_replication_entries: self.max_replication_entries.unwrap_or(300),
            max_replication_entries_for_new_node: self.max_replication_entries_for_new_node.unwrap_or(300),
            snapshot_data_length: self.snapshot_data_length.unwrap_or(1024),
            previous_group_config_change_timeout: self.previous_group_config_change_timeout.unwrap_or(2000),
            catch_up_timeout: self.catch_up_timeout.unwrap_or(60_000),
            catch_up_rounds: self.catch_up_rounds.unwrap_or(10),
            catch_up_round_timeout: self.catch_up_round_timeout.unwrap_or(5000),
            mode: self.mode.unwrap_or(NodeMode::Active),
        };
        if config.election_timeout_min >= config.election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutBounds);
        }
        if config.max_replication_entries == 0 || config.max_replication_entries_for_new_node == 0 {
            return Err(ConfigError::InvalidMaxReplicationEntries);
        }
        if config.catch_up_rounds == 0 {
            return Err(ConfigError::InvalidCatchUpRounds);
        }
        if config.snapshot_data_length == 0 {
            return Err(ConfigError::InvalidSnapshotDataLength);
        }
        Ok(config)
    }
}
