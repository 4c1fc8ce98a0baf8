//! Store connection configuration.

use serde::Deserialize;

/// Redis connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis host.
    pub host: String,
    /// Redis port (0 means the default port).
    pub port: u16,
    /// Logical database index.
    pub db: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Connection URL, e.g. `redis://localhost:6379/0`.
    pub fn url(&self) -> String {
        let port = if self.port == 0 { 6379 } else { self.port };
        format!("redis://{}:{}/{}", self.host, port, self.db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_default() {
        assert_eq!(RedisConfig::default().url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_redis_url_zero_port_falls_back() {
        let config = RedisConfig {
            host: "sync-redis".to_string(),
            port: 0,
            db: 1,
        };
        assert_eq!(config.url(), "redis://sync-redis:6379/1");
    }
}
