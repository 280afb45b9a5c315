use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

const DEFAULT_URL: &str = "mem://casbin_rule/id";
const DEFAULT_MONGO_SERVER_URL: &str = "mongodb://localhost:27017";

// Policy store configuration sourced from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStoreConfig {
    /// Connection string handed to the driver registry.
    pub url: String,
    /// Server address used by `mongo://` collections.
    pub mongo_server_url: String,
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl Default for PolicyStoreConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            mongo_server_url: DEFAULT_MONGO_SERVER_URL.to_string(),
            postgres: PostgresConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicyStoreConfigOverride {
    url: Option<String>,
    mongo_server_url: Option<String>,
    postgres_max_connections: Option<u32>,
    postgres_acquire_timeout_ms: Option<u64>,
}

impl PolicyStoreConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let url = std::env::var("FELIX_POLICY_STORE_URL").unwrap_or(defaults.url);
        let mongo_server_url =
            std::env::var("MONGO_SERVER_URL").unwrap_or(defaults.mongo_server_url);
        let max_connections = match std::env::var("FELIX_POLICY_PG_MAX_CONNECTIONS") {
            Ok(value) => value
                .parse()
                .with_context(|| "parse FELIX_POLICY_PG_MAX_CONNECTIONS")?,
            Err(_) => defaults.postgres.max_connections,
        };
        let acquire_timeout_ms = match std::env::var("FELIX_POLICY_PG_ACQUIRE_TIMEOUT_MS") {
            Ok(value) => value
                .parse()
                .with_context(|| "parse FELIX_POLICY_PG_ACQUIRE_TIMEOUT_MS")?,
            Err(_) => defaults.postgres.acquire_timeout_ms,
        };
        Ok(Self {
            url,
            mongo_server_url,
            postgres: PostgresConfig {
                max_connections,
                acquire_timeout_ms,
            },
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("FELIX_POLICY_STORE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read FELIX_POLICY_STORE_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    /// Overlay the keys present in a YAML document onto this config.
    pub fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: PolicyStoreConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse policy store config yaml")?;
        if let Some(value) = override_cfg.url {
            self.url = value;
        }
        if let Some(value) = override_cfg.mongo_server_url {
            self.mongo_server_url = value;
        }
        if let Some(value) = override_cfg.postgres_max_connections {
            self.postgres.max_connections = value;
        }
        if let Some(value) = override_cfg.postgres_acquire_timeout_ms {
            self.postgres.acquire_timeout_ms = value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 5] = [
        "FELIX_POLICY_STORE_URL",
        "MONGO_SERVER_URL",
        "FELIX_POLICY_PG_MAX_CONNECTIONS",
        "FELIX_POLICY_PG_ACQUIRE_TIMEOUT_MS",
        "FELIX_POLICY_STORE_CONFIG",
    ];

    // Clears the config variables on creation and again on drop.
    struct EnvGuard;

    impl EnvGuard {
        fn clean() -> Self {
            clear_env();
            Self
        }

        fn set(&self, key: &str, value: impl AsRef<std::ffi::OsStr>) {
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            clear_env();
        }
    }

    fn clear_env() {
        for var in VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        let _env = EnvGuard::clean();
        let config = PolicyStoreConfig::from_env().expect("config");
        assert_eq!(config, PolicyStoreConfig::default());
        assert_eq!(config.url, "mem://casbin_rule/id");
    }

    #[test]
    #[serial]
    fn env_overrides_and_rejects_bad_numbers() {
        let env = EnvGuard::clean();
        env.set("FELIX_POLICY_STORE_URL", "mongo://casbin/casbin_rule");
        env.set("FELIX_POLICY_PG_MAX_CONNECTIONS", "12");
        let config = PolicyStoreConfig::from_env().expect("config");
        assert_eq!(config.url, "mongo://casbin/casbin_rule");
        assert_eq!(config.postgres.max_connections, 12);

        env.set("FELIX_POLICY_PG_ACQUIRE_TIMEOUT_MS", "soon");
        let err = PolicyStoreConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("FELIX_POLICY_PG_ACQUIRE_TIMEOUT_MS"));
    }

    #[test]
    #[serial]
    fn yaml_file_overrides_env() {
        let env = EnvGuard::clean();
        let path = std::env::temp_dir().join(format!(
            "felix-policy-store-{}.yaml",
            std::process::id()
        ));
        fs::write(
            &path,
            "url: postgres://localhost/policies\npostgres_max_connections: 2\n",
        )
        .expect("write yaml");
        env.set("FELIX_POLICY_STORE_URL", "mem://ignored");
        env.set("FELIX_POLICY_STORE_CONFIG", &path);

        let config = PolicyStoreConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.url, "postgres://localhost/policies");
        assert_eq!(config.postgres.max_connections, 2);
        assert_eq!(config.postgres.acquire_timeout_ms, 5_000);

        let _ = fs::remove_file(&path);
    }

    #[test]
    #[serial]
    fn missing_yaml_file_is_an_error() {
        let env = EnvGuard::clean();
        env.set("FELIX_POLICY_STORE_CONFIG", "/nonexistent/felix-policy-store.yaml");
        let err = PolicyStoreConfig::from_env_or_yaml().unwrap_err();
        assert!(err.to_string().contains("read FELIX_POLICY_STORE_CONFIG"));
    }

    #[test]
    fn invalid_yaml_is_reported() {
        let mut config = PolicyStoreConfig::default();
        let err = config.apply_yaml("postgres_max_connections: many").unwrap_err();
        assert!(err.to_string().contains("parse policy store config yaml"));
    }
}
