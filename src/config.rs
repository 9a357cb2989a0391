//! Configuration assembly for a replication session.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{ReplicationError, ReplicationResult};

/// Immutable, validated configuration for a `ReplicationSession`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub slot_name: String,
    pub plugin: String,
    pub drop_slot_on_close: bool,
    pub status_update_interval: Option<std::time::Duration>,
    pub stream_params: HashMap<String, String>,
}

impl SessionConfig {
    /// True only once the server major version is known to support `TEMPORARY` slots (>= 10).
    pub fn temporary_slot(&self, server_major_version: u32) -> bool {
        self.drop_slot_on_close && server_major_version >= 10
    }
}

/// Builds a `SessionConfig` field by field; `build()` validates the required fields.
#[derive(Debug, Default)]
pub struct Builder {
    slot_name: Option<String>,
    plugin: Option<String>,
    drop_slot_on_close: bool,
    status_update_interval: Option<std::time::Duration>,
    stream_params_raw: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_name(mut self, slot_name: impl Into<String>) -> Self {
        self.slot_name = Some(slot_name.into());
        self
    }

    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn drop_slot_on_close(mut self, drop: bool) -> Self {
        self.drop_slot_on_close = drop;
        self
    }

    pub fn status_update_interval(mut self, interval: std::time::Duration) -> Self {
        self.status_update_interval = Some(interval);
        self
    }

    /// `"k1=v1;k2=v2"` form forwarded to the plugin at stream start.
    pub fn stream_params(mut self, raw: impl Into<String>) -> Self {
        self.stream_params_raw = Some(raw.into());
        self
    }

    pub fn build(self) -> ReplicationResult<SessionConfig> {
        let slot_name = self
            .slot_name
            .ok_or_else(|| ReplicationError::config("slot_name is required"))?;
        let plugin = self
            .plugin
            .ok_or_else(|| ReplicationError::config("plugin is required"))?;

        if slot_name.is_empty() || slot_name.len() > 63 || !slot_name.is_ascii() {
            return Err(ReplicationError::config(format!(
                "slot_name {slot_name:?} must be non-empty ASCII of at most 63 bytes"
            )));
        }

        let stream_params = self
            .stream_params_raw
            .map(|raw| parse_stream_params(&raw))
            .unwrap_or_default();

        Ok(SessionConfig {
            slot_name,
            plugin,
            drop_slot_on_close: self.drop_slot_on_close,
            status_update_interval: self.status_update_interval,
            stream_params,
        })
    }
}

/// Parses `"k1=v1;k2=v2"`. Pairs missing `=` are logged and skipped, never fatal.
pub fn parse_stream_params(raw: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => {
                params.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => warn!(pair, "malformed stream parameter, skipping"),
        }
    }
    params
}

/// Parses connection arguments given as either `key=value` tokens or alternating
/// `key value` tokens (both forms libpq's `conninfo` sibling tools accept) into a single
/// libpq keyword/value connection string.
pub fn parse_connection_args(args: &[String]) -> String {
    if args.iter().all(|arg| arg.contains('=')) {
        return args.join(" ");
    }

    args.chunks(2)
        .filter_map(|chunk| match chunk {
            [key, value] => Some(format!("{key}={value}")),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_pairs_and_skips_malformed() {
        let params = parse_stream_params("a=1;b;c=3");
        assert_eq!(params.get("a").map(String::as_str), Some("1"));
        assert_eq!(params.get("c").map(String::as_str), Some("3"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn builder_requires_slot_name_and_plugin() {
        let err = Builder::new().plugin("pgoutput").build().unwrap_err();
        assert!(matches!(err, ReplicationError::Configuration { .. }));
    }

    #[test]
    fn builder_produces_valid_config() {
        let config = Builder::new()
            .slot_name("dbz_test")
            .plugin("pgoutput")
            .drop_slot_on_close(true)
            .stream_params("proto_version=1;publication_names=pub")
            .build()
            .unwrap();
        assert_eq!(config.slot_name, "dbz_test");
        assert!(config.temporary_slot(14));
        assert!(!config.temporary_slot(9));
    }

    #[test]
    fn connection_args_accept_key_value_tokens() {
        let args = vec!["user=postgres".to_string(), "host=localhost".to_string()];
        assert_eq!(parse_connection_args(&args), "user=postgres host=localhost");
    }

    #[test]
    fn connection_args_accept_space_separated_pairs() {
        let args = vec![
            "user".to_string(),
            "postgres".to_string(),
            "host".to_string(),
            "localhost".to_string(),
        ];
        assert_eq!(parse_connection_args(&args), "user=postgres host=localhost");
    }
}
