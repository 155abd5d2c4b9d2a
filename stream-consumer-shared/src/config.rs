//! `ConsumerConfig` — the config-by-callback surface hosts use to wire a
//! consumer up.
//!
//! This struct is deliberately dumb: it holds the knobs the engine needs
//! and a `validate()` step. Loading it from layered TOML files (base +
//! environment) is the host binary's job, not this crate's.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Kinesis,
    Dynamodb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub stream_type: StreamType,
    pub sequencing_required: bool,
    pub sequencing_per_key: bool,
    pub batch_keyed_on_event_id: bool,

    /// Explicit consumer id. When absent or blank, derived from
    /// `function_name` + `function_alias` + `consumer_id_suffix` at
    /// resolution time.
    pub consumer_id: Option<String>,
    pub consumer_id_suffix: Option<String>,

    /// Fraction of the host's remaining time budget to allocate before
    /// each phase's deadline is considered reached.
    pub timeout_at_percentage_of_remaining_time: f64,
    pub max_number_of_attempts: u32,

    pub id_property_names: Vec<String>,
    pub key_property_names: Vec<String>,
    pub seq_no_property_names: Vec<String>,

    pub checkpoint_table_name: String,
    pub dead_record_queue_name: String,
    pub dead_message_queue_name: String,

    /// Skip the cached event-source-mapping id lookup and always resolve
    /// it afresh before disabling it on a fatal error.
    pub avoid_esm_cache: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            stream_type: StreamType::Kinesis,
            sequencing_required: false,
            sequencing_per_key: true,
            batch_keyed_on_event_id: false,
            consumer_id: None,
            consumer_id_suffix: None,
            timeout_at_percentage_of_remaining_time: 0.9,
            max_number_of_attempts: 3,
            id_property_names: Vec::new(),
            key_property_names: Vec::new(),
            seq_no_property_names: Vec::new(),
            checkpoint_table_name: "stream_consumer_checkpoints".to_string(),
            dead_record_queue_name: "dead-record-queue".to_string(),
            dead_message_queue_name: "dead-message-queue".to_string(),
            avoid_esm_cache: false,
        }
    }
}

impl ConsumerConfig {
    /// Validates field-level invariants that do not depend on the host
    /// runtime (function name/alias are checked separately by
    /// [`ConsumerConfig::resolve_consumer_id`], since they come from the
    /// invocation context, not the config file).
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.timeout_at_percentage_of_remaining_time) {
            return Err(CoreError::fatal(
                "timeout_at_percentage_of_remaining_time must be within [0, 1]",
            ));
        }
        if self.max_number_of_attempts == 0 {
            return Err(CoreError::fatal("max_number_of_attempts must be >= 1"));
        }
        if self.checkpoint_table_name.trim().is_empty() {
            return Err(CoreError::fatal("checkpoint_table_name must not be blank"));
        }
        if self.dead_record_queue_name.trim().is_empty() {
            return Err(CoreError::fatal("dead_record_queue_name must not be blank"));
        }
        if self.dead_message_queue_name.trim().is_empty() {
            return Err(CoreError::fatal(
                "dead_message_queue_name must not be blank",
            ));
        }
        Ok(())
    }

    /// Resolves the effective consumer id: the explicit `consumer_id` if
    /// set and non-blank, otherwise a derived form built from the
    /// function's name, alias and the configured suffix. Neither path is
    /// preferred over the other — both are accepted, but the result must
    /// not be blank.
    pub fn resolve_consumer_id(&self, function_name: &str, function_alias: &str) -> Result<String> {
        if let Some(id) = &self.consumer_id {
            if !id.trim().is_empty() {
                return Ok(id.clone());
            }
        }
        let mut derived = format!("{function_name}:{function_alias}");
        if let Some(suffix) = &self.consumer_id_suffix {
            if !suffix.trim().is_empty() {
                derived.push(':');
                derived.push_str(suffix);
            }
        }
        if derived.trim().is_empty() || derived == ":" {
            return Err(CoreError::fatal(
                "could not resolve a non-blank consumer id from config or invocation context",
            ));
        }
        Ok(derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ConsumerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_timeout_percentage() {
        let mut cfg = ConsumerConfig::default();
        cfg.timeout_at_percentage_of_remaining_time = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_consumer_id_wins_over_derivation() {
        let mut cfg = ConsumerConfig::default();
        cfg.consumer_id = Some("explicit-id".to_string());
        let id = cfg.resolve_consumer_id("fn-name", "live").unwrap();
        assert_eq!(id, "explicit-id");
    }

    #[test]
    fn derives_consumer_id_with_suffix_when_unset() {
        let mut cfg = ConsumerConfig::default();
        cfg.consumer_id_suffix = Some("shard-0".to_string());
        let id = cfg.resolve_consumer_id("orders-consumer", "live").unwrap();
        assert_eq!(id, "orders-consumer:live:shard-0");
    }

    #[test]
    fn blank_consumer_id_falls_back_to_derivation() {
        let mut cfg = ConsumerConfig::default();
        cfg.consumer_id = Some("   ".to_string());
        let id = cfg.resolve_consumer_id("orders-consumer", "live").unwrap();
        assert_eq!(id, "orders-consumer:live");
    }
}
