//! Host harness for `connect-engine`: flat property-map loading from a
//! TOML file with `CONNECT_`-prefixed environment overrides (`spec.md`
//! §6), offset persistence between runs, and the poll loop that ties
//! `Engine::poll` to a fixed interval.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use connect_core::config::PropertyMap;
use connect_core::model::{EndpointId, Record};

/// Load a TOML config file into the flat dotted-key `PropertyMap`
/// `ConnectorConfig::from_properties` expects. Nested tables become
/// `parent.child` keys; `[api1]` style sections map straight onto the
/// `api{n}.*` prefix the config parser already understands.
pub fn load_properties(path: &Path) -> anyhow::Result<PropertyMap> {
    let raw = std::fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&raw)?;
    let mut props = PropertyMap::new();
    flatten_into(&value, "", &mut props);
    Ok(props)
}

fn flatten_into(value: &toml::Value, prefix: &str, out: &mut PropertyMap) {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                flatten_into(v, &key, out);
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        toml::Value::Array(items) => {
            let joined = items
                .iter()
                .map(|v| match v {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(",");
            out.insert(prefix.to_string(), joined);
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Apply `CONNECT_`-prefixed environment overrides on top of a loaded
/// property map. `CONNECT_API1_HTTP_API_PATH` becomes `api1.http.api.path`
/// — every config key in `spec.md` §6 is dot-separated with no
/// underscores of its own, so a plain `_` → `.` translation is
/// unambiguous.
pub fn apply_env_overrides(props: &mut PropertyMap) {
    for (name, value) in std::env::vars() {
        if let Some(rest) = name.strip_prefix("CONNECT_") {
            let key = rest.to_lowercase().replace('_', ".");
            props.insert(key, value);
        }
    }
}

/// Read/write the host's persisted per-endpoint offsets between
/// process restarts. A missing or corrupt file degrades to "start
/// fresh" rather than a fatal error — a worker's first run always
/// lacks this file.
pub fn load_offsets(path: &Path) -> BTreeMap<EndpointId, serde_json::Value> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn save_offsets(path: &Path, offsets: &BTreeMap<EndpointId, serde_json::Value>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(offsets)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Hand a poll batch's records to the host's sink. Logging here is a
/// stand-in for the actual publish step (Kafka, file sink, ...), which
/// is the host framework's responsibility, not this connector's.
pub fn log_records(records: &[Record]) {
    for record in records {
        tracing::debug!(
            topic = %record.topic,
            partition_key = %record.partition_key,
            "emitting record"
        );
    }
}

pub fn poll_interval(props: &PropertyMap) -> Duration {
    let ms = props
        .get("worker.poll.interval.ms")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5_000);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_nested_tables_into_dotted_keys() {
        let toml_src = r#"
            [http.api]
            base.url = "https://example.invalid"

            [api1.http.api]
            path = "/things"
        "#;
        let value: toml::Value = toml::from_str(toml_src).unwrap();
        let mut props = PropertyMap::new();
        flatten_into(&value, "", &mut props);
        assert_eq!(props.get("http.api.base.url").map(String::as_str), Some("https://example.invalid"));
        assert_eq!(props.get("api1.http.api.path").map(String::as_str), Some("/things"));
    }

    #[test]
    fn env_override_translates_underscores_to_dots() {
        std::env::set_var("CONNECT_API1_HTTP_API_PATH", "/overridden");
        let mut props = PropertyMap::new();
        apply_env_overrides(&mut props);
        assert_eq!(props.get("api1.http.api.path").map(String::as_str), Some("/overridden"));
        std::env::remove_var("CONNECT_API1_HTTP_API_PATH");
    }

    #[test]
    fn missing_offsets_file_yields_empty_map() {
        let offsets = load_offsets(Path::new("/nonexistent/path/offsets.json"));
        assert!(offsets.is_empty());
    }

    #[test]
    fn offsets_round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("connect-worker-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("offsets.json");

        let mut offsets = BTreeMap::new();
        offsets.insert("api1".to_string(), serde_json::json!({"mode": "simple_counter", "value": 5}));
        save_offsets(&path, &offsets).unwrap();

        let loaded = load_offsets(&path);
        assert_eq!(loaded.get("api1").unwrap()["value"], serde_json::json!(5));

        std::fs::remove_file(&path).unwrap();
        std::fs::remove_dir(&dir).unwrap();
    }

    #[test]
    fn poll_interval_defaults_when_absent() {
        let props = PropertyMap::new();
        assert_eq!(poll_interval(&props), Duration::from_millis(5_000));
    }
}
