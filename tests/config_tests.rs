use std::io::Write;
use std::sync::Arc;

use common::cli::utils;
use querier::query::structured::StructuredQuery;
use querier::{Collaborators, InMemoryCatalog, InMemoryStorageRegistry, QueryContext, QueryService};

const CATALOG: &str = r#"
[query]
default_step = "1m"
archive_storage_id = "cold"

[[catalog.tables]]
space_uid = "bkcc__2"
table_id = "system.cpu_summary"
measurement_type = "bk_exporter"
fields = ["usage"]
filters = [{ bk_biz_id = "2" }]

[[catalog.proxies]]
table_id = "system.cpu_summary"
storage_id = "vm"
cluster_name = "default"
db = "system"
measurement = "cpu_summary"
tags_key = ["bk_biz_id"]
vm_rt = "2_bkmonitor_time_series_cpu_summary"

[[catalog.archives]]
cluster_name = "default"
db = "system"
shard_id = "shard-1"
start = 1657840000
end = 1657860000
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_explain_with_catalog_from_config_file() {
    let file = write_config(CATALOG);
    let config = utils::load_config(Some(&file.path().to_path_buf())).unwrap();
    utils::validate_config(&config).unwrap();

    let catalog = Arc::new(InMemoryCatalog::from_config(&config.catalog).unwrap());
    let service = QueryService::new(
        config.query.clone(),
        Collaborators::shared(catalog),
        Arc::new(InMemoryStorageRegistry::new()),
    );
    let query: StructuredQuery = serde_json::from_str(
        r#"{
            "space_uid": "bkcc__2",
            "query_list": [{"table_id": "system.cpu_summary", "field_name": "usage", "reference_name": "a"}],
            "metric_merge": "a",
            "start_time": "1657848000",
            "end_time": "1657851600"
        }"#,
    )
    .unwrap();

    let (reference, expr) = service
        .explain(&QueryContext::default(), &query)
        .await
        .unwrap();

    let physical = &reference.get("a").unwrap().query_list[0];
    assert_eq!(physical.storage_id, "cold");
    assert_eq!(physical.field, "metric_value");
    assert_eq!(physical.condition, "metric_name = 'usage' and bk_biz_id = '2'");
    assert!(
        physical
            .vm_condition
            .contains(r#"__name__="cpu_summary_metric_value""#)
    );
    let rendered = expr.to_string();
    assert!(rendered.starts_with("cpu_summary_metric_value"));
    assert!(rendered.contains(r#"bk_biz_id="2""#));
}

#[test]
fn test_unknown_measurement_type_fails_catalog() {
    let file = write_config(
        r#"
[[catalog.tables]]
space_uid = "bkcc__2"
table_id = "system.disk"
measurement_type = "bk_mystery"
"#,
    );
    let config = utils::load_config(Some(&file.path().to_path_buf())).unwrap();

    let err = InMemoryCatalog::from_config(&config.catalog).unwrap_err();
    assert!(err.to_string().contains("system.disk"));
    assert!(err.to_string().contains("bk_mystery"));
}
