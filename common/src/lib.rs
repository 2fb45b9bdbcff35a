/*!
common/src/lib.rs

Shared configuration types for activity-stream.

This file provides:
- Config data structures (deserialized from the process environment)
- The double-underscore environment normaliser: `FEEDS__1__SEED=...`
  style variables flatten into the nested structure the Config types
  expect, with numeric segments producing ordered sequences
*/

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Elasticsearch endpoint configuration section.
///
/// All values are kept as the strings the environment provides; `PORT`
/// is parsed where a number is actually needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EsConfig {
    pub host: String,
    pub port: String,
    pub protocol: String,
    pub region: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
}

/// Optional error-reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SentryConfig {
    pub dsn: String,
    pub environment: String,
}

/// One upstream feed, tagged by TYPE.
///
/// `unique_id` must be unique across configured feeds and is embedded
/// into index names, so it has to be a safe index-name substring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "TYPE")]
pub enum FeedConfig {
    #[serde(rename = "activity_stream", rename_all = "SCREAMING_SNAKE_CASE")]
    ActivityStream {
        unique_id: String,
        seed: String,
        access_key_id: String,
        secret_access_key: String,
    },
    #[serde(rename = "zendesk", rename_all = "SCREAMING_SNAKE_CASE")]
    Zendesk {
        unique_id: String,
        seed: String,
        api_email: String,
        api_key: String,
    },
}

/// An incoming API credential: key pair plus the HTTP methods it may use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct KeyPairConfig {
    pub key_id: String,
    pub secret_key: String,
    pub permissions: Vec<String>,
}

/// Top-level application configuration (deserialized from the environment).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    pub port: String,
    pub elasticsearch: EsConfig,
    pub redis_uri: String,
    #[serde(default)]
    pub sentry: Option<SentryConfig>,
    pub feeds: Vec<FeedConfig>,
    pub incoming_access_key_pairs: Vec<KeyPairConfig>,
    pub incoming_ip_whitelist: Vec<String>,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// A missing required key or an unknown feed TYPE is a startup
    /// failure; the caller is expected to exit non-zero.
    pub fn from_env() -> Result<Self> {
        let vars: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load configuration from an explicit key/value set (kept separate
    /// from `from_env` so tests can supply their own environment).
    pub fn from_vars(vars: &BTreeMap<String, String>) -> Result<Self> {
        let normalised = normalise_environment(vars);
        let config: Config = serde_json::from_value(normalised)
            .context("invalid or incomplete environment configuration")?;
        Ok(config)
    }
}

/// Flatten double-underscore-indexed keys into a nested structure.
///
/// `A__B=x` becomes `{"A": {"B": "x"}}`; a level whose keys are all
/// numeric becomes a sequence ordered by the numeric value of the
/// segment, so `FEEDS__2__...` sorts after `FEEDS__1__...` and before
/// `FEEDS__10__...`. Unrelated environment variables simply become
/// top-level keys that deserialization ignores.
pub fn normalise_environment(key_values: &BTreeMap<String, String>) -> Value {
    let mut scalars: Vec<(&str, &str)> = Vec::new();
    let mut groups: BTreeMap<&str, BTreeMap<String, String>> = BTreeMap::new();

    for (key, value) in key_values {
        match key.split_once("__") {
            None => scalars.push((key, value)),
            Some((first, rest)) => {
                groups
                    .entry(first)
                    .or_default()
                    .insert(rest.to_string(), value.clone());
            }
        }
    }

    let mut map = Map::new();
    for (key, value) in scalars {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    for (key, nested) in groups {
        map.insert(key.to_string(), normalise_environment(&nested));
    }

    let all_numeric = !map.is_empty() && map.keys().all(|k| k.parse::<u64>().is_ok());
    if all_numeric {
        let mut entries: Vec<(u64, Value)> = map
            .into_iter()
            .map(|(k, v)| (k.parse::<u64>().unwrap_or(u64::MAX), v))
            .collect();
        entries.sort_by_key(|(index, _)| *index);
        Value::Array(entries.into_iter().map(|(_, v)| v).collect())
    } else {
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_environment() -> BTreeMap<String, String> {
        vars(&[
            ("PORT", "8080"),
            ("ELASTICSEARCH__HOST", "127.0.0.1"),
            ("ELASTICSEARCH__PORT", "9200"),
            ("ELASTICSEARCH__PROTOCOL", "http"),
            ("ELASTICSEARCH__REGION", "us-east-2"),
            ("ELASTICSEARCH__AWS_ACCESS_KEY_ID", "some-id"),
            ("ELASTICSEARCH__AWS_SECRET_ACCESS_KEY", "some-secret"),
            ("REDIS_URI", "redis://127.0.0.1:6379"),
            ("FEEDS__1__TYPE", "activity_stream"),
            ("FEEDS__1__UNIQUE_ID", "first_feed"),
            ("FEEDS__1__SEED", "http://localhost:8081/0"),
            ("FEEDS__1__ACCESS_KEY_ID", "feed-some-id"),
            ("FEEDS__1__SECRET_ACCESS_KEY", "feed-some-secret"),
            ("FEEDS__2__TYPE", "zendesk"),
            ("FEEDS__2__UNIQUE_ID", "second_feed"),
            ("FEEDS__2__SEED", "http://localhost:8081/tickets"),
            ("FEEDS__2__API_EMAIL", "test@test.com"),
            ("FEEDS__2__API_KEY", "some-key"),
            ("INCOMING_ACCESS_KEY_PAIRS__1__KEY_ID", "incoming-some-id-1"),
            ("INCOMING_ACCESS_KEY_PAIRS__1__SECRET_KEY", "incoming-some-secret-1"),
            ("INCOMING_ACCESS_KEY_PAIRS__1__PERMISSIONS__1", "POST"),
            ("INCOMING_ACCESS_KEY_PAIRS__1__PERMISSIONS__2", "GET"),
            ("INCOMING_IP_WHITELIST__1", "1.2.3.4"),
        ])
    }

    #[test]
    fn environment_flattens_into_the_structured_form() {
        let normalised = normalise_environment(&vars(&[
            ("PORT", "8080"),
            ("ELASTICSEARCH__HOST", "127.0.0.1"),
            ("ELASTICSEARCH__PORT", "9200"),
            ("INCOMING_IP_WHITELIST__1", "1.2.3.4"),
            ("INCOMING_IP_WHITELIST__2", "5.6.7.8"),
        ]));
        assert_eq!(
            normalised,
            json!({
                "PORT": "8080",
                "ELASTICSEARCH": {"HOST": "127.0.0.1", "PORT": "9200"},
                "INCOMING_IP_WHITELIST": ["1.2.3.4", "5.6.7.8"],
            })
        );
    }

    #[test]
    fn numeric_segments_order_numerically_not_lexically() {
        let normalised = normalise_environment(&vars(&[
            ("ITEMS__1", "first"),
            ("ITEMS__2", "second"),
            ("ITEMS__10", "tenth"),
        ]));
        assert_eq!(
            normalised,
            json!({"ITEMS": ["first", "second", "tenth"]})
        );
    }

    #[test]
    fn config_parses_the_full_environment() {
        let config = Config::from_vars(&full_environment()).expect("config should parse");
        assert_eq!(config.port, "8080");
        assert_eq!(config.elasticsearch.region, "us-east-2");
        assert_eq!(config.feeds.len(), 2);
        match &config.feeds[0] {
            FeedConfig::ActivityStream { unique_id, seed, .. } => {
                assert_eq!(unique_id, "first_feed");
                assert_eq!(seed, "http://localhost:8081/0");
            }
            other => panic!("expected activity_stream feed, got {:?}", other),
        }
        match &config.feeds[1] {
            FeedConfig::Zendesk { api_email, .. } => assert_eq!(api_email, "test@test.com"),
            other => panic!("expected zendesk feed, got {:?}", other),
        }
        assert_eq!(
            config.incoming_access_key_pairs[0].permissions,
            vec!["POST".to_string(), "GET".to_string()]
        );
        assert_eq!(config.incoming_ip_whitelist, vec!["1.2.3.4".to_string()]);
        assert!(config.sentry.is_none());
    }

    #[test]
    fn unrelated_environment_variables_are_ignored() {
        let mut environment = full_environment();
        environment.insert("HOME".to_string(), "/home/someone".to_string());
        environment.insert("LC_ALL__WEIRD".to_string(), "C".to_string());
        assert!(Config::from_vars(&environment).is_ok());
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let mut environment = full_environment();
        environment.remove("PORT");
        assert!(Config::from_vars(&environment).is_err());
    }

    #[test]
    fn unknown_feed_type_is_an_error() {
        let mut environment = full_environment();
        environment.insert("FEEDS__1__TYPE".to_string(), "carrier_pigeon".to_string());
        assert!(Config::from_vars(&environment).is_err());
    }
}
