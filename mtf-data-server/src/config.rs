use mtf_data::{
    HubConfig, buffer::DEFAULT_BAR1M_CAPACITY, bus::DEFAULT_BUS_CAPACITY,
    cache::DEFAULT_CACHE_MAX_AGE, distributor::DEFAULT_BROADCAST_BUFFER,
    protocol::DEFAULT_PORT, switch::DEFAULT_BACKFILL_LIMIT,
};
use std::{net::SocketAddr, str::FromStr, time::Duration};
use tracing::warn;

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

/// Server configuration read from `MTF_*` environment variables, falling back to defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub keepalive: Duration,
    pub bus_capacity: usize,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            keepalive: DEFAULT_KEEPALIVE,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| -> String {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            addr: parse_or(&var("MTF_ADDR", ""), "MTF_ADDR", Self::default().addr),
            keepalive: Duration::from_secs(parse_or(
                &var("MTF_KEEPALIVE_SECS", ""),
                "MTF_KEEPALIVE_SECS",
                DEFAULT_KEEPALIVE.as_secs(),
            )),
            bus_capacity: parse_or(
                &var("MTF_BUS_CAPACITY", ""),
                "MTF_BUS_CAPACITY",
                DEFAULT_BUS_CAPACITY,
            ),
            hub: HubConfig {
                buffer_capacity: parse_or(
                    &var("MTF_BUFFER_CAPACITY", ""),
                    "MTF_BUFFER_CAPACITY",
                    DEFAULT_BAR1M_CAPACITY,
                ),
                broadcast_buffer: parse_or(
                    &var("MTF_BROADCAST_BUFFER", ""),
                    "MTF_BROADCAST_BUFFER",
                    DEFAULT_BROADCAST_BUFFER,
                ),
                backfill_limit: parse_or(
                    &var("MTF_BACKFILL_LIMIT", ""),
                    "MTF_BACKFILL_LIMIT",
                    DEFAULT_BACKFILL_LIMIT,
                ),
                cache_max_age: Duration::from_secs(parse_or(
                    &var("MTF_CACHE_MAX_AGE_SECS", ""),
                    "MTF_CACHE_MAX_AGE_SECS",
                    DEFAULT_CACHE_MAX_AGE.as_secs(),
                )),
            },
        }
    }
}

fn parse_or<T: FromStr>(value: &str, name: &str, default: T) -> T {
    if value.is_empty() {
        return default;
    }
    value.parse().unwrap_or_else(|_| {
        warn!(%name, %value, "invalid config value, using default");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup() {
        struct TestCase {
            vars: Vec<(&'static str, &'static str)>,
            expected: ServerConfig,
        }

        let tests = vec![
            TestCase {
                // TC0: nothing set
                vars: vec![],
                expected: ServerConfig::default(),
            },
            TestCase {
                // TC1: every variable set
                vars: vec![
                    ("MTF_ADDR", "127.0.0.1:8080"),
                    ("MTF_KEEPALIVE_SECS", "5"),
                    ("MTF_BUS_CAPACITY", "64"),
                    ("MTF_BUFFER_CAPACITY", "100"),
                    ("MTF_BROADCAST_BUFFER", "32"),
                    ("MTF_BACKFILL_LIMIT", "50"),
                    ("MTF_CACHE_MAX_AGE_SECS", "10"),
                ],
                expected: ServerConfig {
                    addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
                    keepalive: Duration::from_secs(5),
                    bus_capacity: 64,
                    hub: HubConfig {
                        buffer_capacity: 100,
                        broadcast_buffer: 32,
                        backfill_limit: 50,
                        cache_max_age: Duration::from_secs(10),
                    },
                },
            },
            TestCase {
                // TC2: garbage falls back to defaults
                vars: vec![("MTF_ADDR", "nowhere"), ("MTF_BACKFILL_LIMIT", "-3")],
                expected: ServerConfig::default(),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let vars = test.vars.into_iter().collect::<HashMap<_, _>>();
            let actual = ServerConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
