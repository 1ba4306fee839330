use std::str::FromStr;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// Base urls of peer instances, e.g. `http://10.0.0.2:8080`.
    pub relay_peers: Vec<String>,
    /// Shared secret peers present on `/relay`. Required with `relay_peers`.
    pub relay_token: Option<String>,
    /// Lets websocket clients without a login name themselves with `?user=`.
    pub allow_query_user: bool,
    /// Events buffered per connection before it counts as too slow.
    pub outbound_buffer: usize,
    pub session_idle_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            database_url: "sqlite://shawazi.db?mode=rwc".to_owned(),
            relay_peers: Vec::new(),
            relay_token: None,
            allow_query_user: false,
            outbound_buffer: 64,
            session_idle_minutes: 60,
        }
    }
}

impl Config {
    /// Reads `.env` (if present) and then the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            relay_peers: lookup("RELAY_PEERS")
                .map(|peers| {
                    peers
                        .split(',')
                        .map(|peer| peer.trim().trim_end_matches('/').to_owned())
                        .filter(|peer| !peer.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            relay_token: lookup("RELAY_TOKEN").filter(|token| !token.is_empty()),
            allow_query_user: parse(&lookup, "ALLOW_QUERY_USER")?.unwrap_or(defaults.allow_query_user),
            outbound_buffer: parse(&lookup, "OUTBOUND_BUFFER")?.unwrap_or(defaults.outbound_buffer),
            session_idle_minutes: parse(&lookup, "SESSION_IDLE_MINUTES")?
                .unwrap_or(defaults.session_idle_minutes),
        };

        anyhow::ensure!(
            !config.relay_enabled() || config.relay_token.is_some(),
            "RELAY_TOKEN must be set when RELAY_PEERS is"
        );
        Ok(config)
    }

    /// Whether this instance exchanges messages with peers over HTTP.
    pub fn relay_enabled(&self) -> bool {
        !self.relay_peers.is_empty()
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("{key}={raw:?}")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert!(config.relay_peers.is_empty());
        assert_eq!(config.outbound_buffer, 64);
    }

    #[test]
    fn peers_are_split_and_trimmed() {
        let config = config(&[("RELAY_PEERS", "http://a:8080/, ,http://b:8080")]).unwrap();
        assert_eq!(config.relay_peers, vec!["http://a:8080", "http://b:8080"]);
    }

    #[test]
    fn peers_require_a_token() {
        let err = config(&[("RELAY_PEERS", "http://a:8080")]).unwrap_err();
        assert!(err.to_string().contains("RELAY_TOKEN"));

        let config = config(&[("RELAY_PEERS", "http://a:8080"), ("RELAY_TOKEN", "s3cret")]).unwrap();
        assert!(config.relay_enabled());
    }

    #[test]
    fn query_user_is_opt_in() {
        assert!(!config(&[]).unwrap().allow_query_user);
        assert!(config(&[("ALLOW_QUERY_USER", "true")]).unwrap().allow_query_user);
        assert!(config(&[("ALLOW_QUERY_USER", "maybe")]).is_err());
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = config(&[("OUTBOUND_BUFFER", "lots")]).unwrap_err();
        assert!(err.to_string().contains("OUTBOUND_BUFFER"));
    }
}
