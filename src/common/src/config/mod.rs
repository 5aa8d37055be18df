use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use once_cell::sync::OnceCell;

pub static CONFIG: OnceCell<Configuration> = OnceCell::new();

/// Query engine tunables
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Step used when a request does not carry one
    #[serde(with = "humantime_serde")]
    pub default_step: Duration,
    /// Lookback delta handed to the backend for instant queries
    #[serde(with = "humantime_serde")]
    pub lookback_delta: Duration,
    /// Storage used by raw queries that do not name a storage
    pub default_storage_id: String,
    /// Storage id substituted when the time range hits archived shards
    pub archive_storage_id: String,
    /// Shift windowed selectors so samples line up with InfluxDB-style buckets
    pub align_result: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_step: Duration::from_secs(60),
            lookback_delta: Duration::from_secs(300),
            default_storage_id: String::from("vm"),
            archive_storage_id: String::from("offline_data_archive"),
            align_result: false,
        }
    }
}

/// A result table known to a space
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct TableConfig {
    pub space_uid: String,
    pub table_id: String,
    pub measurement_type: String,
    #[serde(default)]
    pub fields: Vec<String>,
    /// Space scoped filters, one map per OR-group
    #[serde(default)]
    pub filters: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub segmented_enable: bool,
}

/// Storage target for a table, optionally narrowed to a single metric
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    pub table_id: String,
    #[serde(default)]
    pub metric: Option<String>,
    pub storage_id: String,
    pub cluster_name: String,
    pub db: String,
    pub measurement: String,
    #[serde(default)]
    pub tags_key: Vec<String>,
    #[serde(default)]
    pub vm_rt: String,
    #[serde(default)]
    pub retention_policy: String,
}

/// A shard that has been moved to the offline archive
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ArchiveConfig {
    pub cluster_name: String,
    pub db: String,
    #[serde(default)]
    pub retention_policy: String,
    pub shard_id: String,
    /// Inclusive unix seconds
    pub start: i64,
    /// Inclusive unix seconds
    pub end: i64,
}

/// Static routing metadata served by the in-memory collaborators
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct CatalogConfig {
    #[serde(default)]
    pub tables: Vec<TableConfig>,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub archives: Vec<ArchiveConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Query engine settings
    pub query: QueryConfig,
    /// Routing metadata
    pub catalog: CatalogConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file("tsquery.toml"))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path))
    }

    fn figment(file: figment::providers::Data<Toml>) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed("TSQUERY__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();

        assert_eq!(config.query.default_step, Duration::from_secs(60));
        assert_eq!(config.query.lookback_delta, Duration::from_secs(300));
        assert_eq!(config.query.archive_storage_id, "offline_data_archive");
        assert!(!config.query.align_result);
        assert!(config.catalog.tables.is_empty());
    }

    #[test]
    fn test_configless_operation() {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .extract::<Configuration>()
            .unwrap();

        assert_eq!(config.query.default_storage_id, "vm");
        assert!(config.catalog.proxies.is_empty());
    }

    #[test]
    fn test_env_var_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("tsquery.toml", "[query]\ndefault_step = \"5m\"")?;
            jail.set_env("TSQUERY__QUERY__DEFAULT_STEP", "30s");
            jail.set_env("TSQUERY__QUERY__ARCHIVE_STORAGE_ID", "cold");

            let config = Configuration::load().map_err(|e| *e)?;

            assert_eq!(config.query.default_step, Duration::from_secs(30));
            assert_eq!(config.query.archive_storage_id, "cold");
            Ok(())
        });
    }

    #[test]
    fn test_load_catalog_from_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "catalog.toml",
                r#"
[query]
default_step = "5m"

[[catalog.tables]]
space_uid = "bkcc__2"
table_id = "system.cpu_summary"
measurement_type = "bk_traditional_measurement"
fields = ["usage", "idle"]
filters = [{ bk_biz_id = "2" }]

[[catalog.proxies]]
table_id = "system.cpu_summary"
storage_id = "vm"
cluster_name = "default"
db = "system"
measurement = "cpu_summary"
vm_rt = "2_bkmonitor_time_series_cpu_summary"

[[catalog.archives]]
cluster_name = "default"
db = "system"
shard_id = "shard-1"
start = 1000
end = 2000
"#,
            )?;

            let config = Configuration::load_from_path(Path::new("catalog.toml")).map_err(|e| *e)?;

            assert_eq!(config.query.default_step, Duration::from_secs(300));
            assert_eq!(config.catalog.tables.len(), 1);
            let table = &config.catalog.tables[0];
            assert_eq!(table.fields, vec!["usage", "idle"]);
            assert_eq!(table.filters[0].get("bk_biz_id").map(String::as_str), Some("2"));
            assert_eq!(config.catalog.proxies[0].measurement, "cpu_summary");
            assert!(config.catalog.proxies[0].metric.is_none());
            assert_eq!(config.catalog.archives[0].shard_id, "shard-1");
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_duration() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("tsquery.toml", "[query]\ndefault_step = \"soon\"")?;
            assert!(Configuration::load().is_err());
            Ok(())
        });
    }
}
