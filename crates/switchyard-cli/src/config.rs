use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use switchyard_observability::LoggingConfig;
use switchyard_routing::{GroupRouterConfig, SchedulerConfig};
use switchyard_stream::SsePumpOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub router: GroupRouterConfig,

    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,

    /// Catalog read cache lifetime; 0 reads through on every selection
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// JSON file holding the scheduler and group pointers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer_state: Option<PathBuf>,
}

/// Scheduler timing, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_affinity_ttl_secs")]
    pub affinity_ttl_secs: u64,

    #[serde(default = "default_binding_ttl_secs")]
    pub binding_ttl_secs: u64,

    #[serde(default = "default_window_secs")]
    pub rpm_window_secs: u64,

    #[serde(default = "default_window_secs")]
    pub tpm_window_secs: u64,

    #[serde(default = "default_cooldown_base_secs")]
    pub cooldown_base_secs: u64,

    #[serde(default = "default_probe_claim_ttl_secs")]
    pub probe_claim_ttl_secs: u64,

    #[serde(default = "default_max_ban_secs")]
    pub max_ban_secs: u64,

    #[serde(default = "default_binding_sweep_interval_secs")]
    pub binding_sweep_interval_secs: u64,
}

/// SSE relay limits; 0 disables a limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    #[serde(default = "default_initial_line_bytes")]
    pub initial_line_bytes: usize,

    #[serde(default)]
    pub ping_interval_secs: u64,

    #[serde(default)]
    pub idle_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
            cache_ttl_secs: default_cache_ttl_secs(),
            pointer_state: None,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            affinity_ttl_secs: default_affinity_ttl_secs(),
            binding_ttl_secs: default_binding_ttl_secs(),
            rpm_window_secs: default_window_secs(),
            tpm_window_secs: default_window_secs(),
            cooldown_base_secs: default_cooldown_base_secs(),
            probe_claim_ttl_secs: default_probe_claim_ttl_secs(),
            max_ban_secs: default_max_ban_secs(),
            binding_sweep_interval_secs: default_binding_sweep_interval_secs(),
        }
    }
}

impl SchedulerSettings {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            affinity_ttl: Duration::from_secs(self.affinity_ttl_secs),
            binding_ttl: Duration::from_secs(self.binding_ttl_secs),
            rpm_window: Duration::from_secs(self.rpm_window_secs),
            tpm_window: Duration::from_secs(self.tpm_window_secs),
            cooldown_base: Duration::from_secs(self.cooldown_base_secs),
            probe_claim_ttl: Duration::from_secs(self.probe_claim_ttl_secs),
            max_ban: Duration::from_secs(self.max_ban_secs),
            binding_sweep_interval: Duration::from_secs(self.binding_sweep_interval_secs),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            initial_line_bytes: default_initial_line_bytes(),
            ping_interval_secs: 0,
            idle_timeout_secs: 0,
        }
    }
}

impl StreamSettings {
    pub fn to_pump_options(&self) -> SsePumpOptions {
        SsePumpOptions {
            max_line_bytes: self.max_line_bytes,
            initial_line_bytes: self.initial_line_bytes,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

impl ServerConfig {
    /// Load from YAML, or TOML when the file ends in `.toml`
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?
        };

        Ok(config)
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("SWITCHYARD_CATALOG") {
            self.catalog.path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SWITCHYARD_POINTER_STATE") {
            self.catalog.pointer_state = (!val.trim().is_empty()).then(|| PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("SWITCHYARD_CACHE_TTL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => self.catalog.cache_ttl_secs = secs,
                Err(_) => {
                    eprintln!("Warning: Invalid SWITCHYARD_CACHE_TTL_SECS '{}', ignoring", val)
                }
            }
        }

        if let Ok(val) = std::env::var("SWITCHYARD_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Ok(val) = std::env::var("SWITCHYARD_LOG_JSON")
            && let Ok(json) = val.parse::<bool>()
        {
            self.logging.json = json;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.catalog.path.as_os_str().is_empty() {
            return Err("catalog.path must not be empty".to_string());
        }
        self.scheduler
            .to_scheduler_config()
            .validate()
            .map_err(|e| format!("scheduler: {}", e))?;
        self.router.validate().map_err(|e| format!("router: {}", e))?;
        let stream = &self.stream;
        if stream.max_line_bytes > 0 && stream.initial_line_bytes > stream.max_line_bytes {
            return Err(
                "stream.initial_line_bytes must not exceed stream.max_line_bytes".to_string(),
            );
        }
        Ok(())
    }
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("./catalog.yaml")
}

fn default_cache_ttl_secs() -> u64 {
    5
}

fn default_affinity_ttl_secs() -> u64 {
    30 * 60
}

fn default_binding_ttl_secs() -> u64 {
    60 * 60
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_base_secs() -> u64 {
    30
}

fn default_probe_claim_ttl_secs() -> u64 {
    30
}

fn default_max_ban_secs() -> u64 {
    10 * 60
}

fn default_binding_sweep_interval_secs() -> u64 {
    10
}

fn default_max_line_bytes() -> usize {
    4 << 20
}

fn default_initial_line_bytes() -> usize {
    64 << 10
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ENV_VARS: [&str; 5] = [
        "SWITCHYARD_CATALOG",
        "SWITCHYARD_POINTER_STATE",
        "SWITCHYARD_CACHE_TTL_SECS",
        "SWITCHYARD_LOG_LEVEL",
        "SWITCHYARD_LOG_JSON",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            unsafe { std::env::remove_var(var) };
        }
    }

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.scheduler.to_scheduler_config(), SchedulerConfig::default());
        assert_eq!(config.router, GroupRouterConfig::default());
        assert_eq!(config.stream.to_pump_options(), SsePumpOptions::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_file() {
        let file = write_temp(
            ".yaml",
            r#"
catalog:
  path: /etc/switchyard/catalog.yaml
  pointer_state: /var/lib/switchyard/pointers.json
scheduler:
  cooldown_base_secs: 15
router:
  default_max_attempts: 3
stream:
  ping_interval_secs: 10
logging:
  level: debug
"#,
        );

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.catalog.path, PathBuf::from("/etc/switchyard/catalog.yaml"));
        assert_eq!(config.catalog.cache_ttl_secs, 5);
        assert_eq!(
            config.catalog.pointer_state,
            Some(PathBuf::from("/var/lib/switchyard/pointers.json"))
        );
        assert_eq!(
            config.scheduler.to_scheduler_config().cooldown_base,
            Duration::from_secs(15)
        );
        assert_eq!(config.router.default_max_attempts, 3);
        assert_eq!(config.router.default_group_name, "default");
        assert_eq!(config.stream.to_pump_options().ping_interval, Duration::from_secs(10));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_toml_file() {
        let file = write_temp(
            ".toml",
            r#"
[catalog]
path = "catalog.toml"
cache_ttl_secs = 0

[stream]
idle_timeout_secs = 90
"#,
        );

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.catalog.path, PathBuf::from("catalog.toml"));
        assert_eq!(config.catalog.cache_ttl_secs, 0);
        assert_eq!(config.stream.to_pump_options().idle_timeout, Duration::from_secs(90));
        assert_eq!(config.scheduler.max_ban_secs, 600);
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let file = write_temp(".yaml", "scheduler: [");
        let err = ServerConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid YAML"));
    }

    #[test]
    #[serial]
    fn test_merge_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("SWITCHYARD_CATALOG", "/tmp/other.yaml");
            std::env::set_var("SWITCHYARD_POINTER_STATE", "/tmp/pointers.json");
            std::env::set_var("SWITCHYARD_CACHE_TTL_SECS", "0");
            std::env::set_var("SWITCHYARD_LOG_LEVEL", "trace");
            std::env::set_var("SWITCHYARD_LOG_JSON", "true");
        }

        let mut config = ServerConfig::default();
        config.merge_env();
        clear_env();

        assert_eq!(config.catalog.path, PathBuf::from("/tmp/other.yaml"));
        assert_eq!(config.catalog.pointer_state, Some(PathBuf::from("/tmp/pointers.json")));
        assert_eq!(config.catalog.cache_ttl_secs, 0);
        assert_eq!(config.logging.level, "trace");
        assert!(config.logging.json);
    }

    #[test]
    #[serial]
    fn test_merge_env_bad_values_and_empty_pointer_state() {
        clear_env();
        unsafe {
            std::env::set_var("SWITCHYARD_CACHE_TTL_SECS", "soon");
            std::env::set_var("SWITCHYARD_LOG_JSON", "maybe");
            std::env::set_var("SWITCHYARD_POINTER_STATE", "");
        }

        let mut config = ServerConfig::default();
        config.catalog.pointer_state = Some(PathBuf::from("keep.json"));
        config.merge_env();
        clear_env();

        assert_eq!(config.catalog.cache_ttl_secs, 5);
        assert!(!config.logging.json);
        assert_eq!(config.catalog.pointer_state, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.scheduler.rpm_window_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.starts_with("scheduler:"));

        let mut config = ServerConfig::default();
        config.router.default_max_attempts = 0;
        assert!(config.validate().unwrap_err().starts_with("router:"));

        let mut config = ServerConfig::default();
        config.stream.max_line_bytes = 1024;
        config.stream.initial_line_bytes = 4096;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.stream.max_line_bytes = 0;
        config.stream.initial_line_bytes = 4096;
        assert!(config.validate().is_ok());
    }
}
