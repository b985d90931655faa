//! Property-map driven configuration (`spec.md` §6).
//!
//! The host framework hands the connector a flat `HashMap<String,
//! String>` of dotted keys (`apiN.http.api.path`, `circuit.breaker.*`,
//! ...). This mirrors `stupid_core::config::Config::from_env`'s
//! profiled-lookup pattern — there it is `{PROFILE}_{KEY}` falling
//! back to `{KEY}`; here it is `api{N}.{KEY}` falling back to the
//! unprefixed global default.

use std::collections::{BTreeMap, HashMap};

use crate::error::ConnectError;
use crate::model::{
    BreakerConfig, CacheConfig, Endpoint, EvictionPolicy, HttpMethod, ODataTokenMode, OffsetMode,
    OverflowStrategy, RateLimitAlgorithm, RateLimitConfig, RetryConfig,
};

pub type PropertyMap = HashMap<String, String>;

fn get<'a>(props: &'a PropertyMap, key: &str) -> Option<&'a str> {
    props.get(key).map(String::as_str).filter(|s| !s.is_empty())
}

fn get_or<'a>(props: &'a PropertyMap, key: &str, default: &'a str) -> &'a str {
    get(props, key).unwrap_or(default)
}

fn get_owned(props: &PropertyMap, key: &str, default: &str) -> String {
    get_or(props, key, default).to_string()
}

fn get_bool(props: &PropertyMap, key: &str, default: bool) -> bool {
    get(props, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(props: &PropertyMap, key: &str, default: u64) -> u64 {
    get(props, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(props: &PropertyMap, key: &str, default: u32) -> u32 {
    get(props, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_usize(props: &PropertyMap, key: &str, default: usize) -> usize {
    get(props, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_i64(props: &PropertyMap, key: &str, default: i64) -> i64 {
    get(props, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_f64(props: &PropertyMap, key: &str, default: f64) -> f64 {
    get(props, key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_codes(props: &PropertyMap, key: &str, default: &[u16]) -> Vec<u16> {
    match get(props, key) {
        Some(v) => v
            .split(',')
            .filter_map(|s| s.trim().parse::<u16>().ok())
            .collect(),
        None => default.to_vec(),
    }
}

/// Looks up `api{n}.{suffix}` first, falling back to the unprefixed
/// global key `{suffix}`.
fn api_key(n: u32, suffix: &str) -> String {
    format!("api{n}.{suffix}")
}

fn api_get<'a>(props: &'a PropertyMap, n: u32, suffix: &str) -> Option<&'a str> {
    get(props, &api_key(n, suffix)).or_else(|| get(props, suffix))
}

fn api_get_owned(props: &PropertyMap, n: u32, suffix: &str, default: &str) -> String {
    api_get(props, n, suffix).unwrap_or(default).to_string()
}

fn api_get_bool(props: &PropertyMap, n: u32, suffix: &str, default: bool) -> bool {
    api_get(props, n, suffix).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn api_get_u64(props: &PropertyMap, n: u32, suffix: &str, default: u64) -> u64 {
    api_get(props, n, suffix).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn api_get_u32(props: &PropertyMap, n: u32, suffix: &str, default: u32) -> u32 {
    api_get(props, n, suffix).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn api_get_f64(props: &PropertyMap, n: u32, suffix: &str, default: f64) -> f64 {
    api_get(props, n, suffix).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn api_get_codes(props: &PropertyMap, n: u32, suffix: &str, default: &[u16]) -> Vec<u16> {
    match api_get(props, n, suffix) {
        Some(v) => v.split(',').filter_map(|s| s.trim().parse::<u16>().ok()).collect(),
        None => default.to_vec(),
    }
}

fn parse_method(s: &str) -> Result<HttpMethod, ConnectError> {
    match s.to_uppercase().as_str() {
        "GET" => Ok(HttpMethod::Get),
        "POST" => Ok(HttpMethod::Post),
        "PUT" => Ok(HttpMethod::Put),
        "DELETE" => Ok(HttpMethod::Delete),
        "PATCH" => Ok(HttpMethod::Patch),
        other => Err(ConnectError::Config(format!("invalid http method: {other}"))),
    }
}

fn parse_offset_mode(s: &str) -> Result<OffsetMode, ConnectError> {
    match s {
        "SIMPLE_INCREMENTING" => Ok(OffsetMode::SimpleIncrementing),
        "CURSOR_PAGINATION" => Ok(OffsetMode::CursorPagination),
        "ODATA_PAGINATION" => Ok(OffsetMode::ODataPagination),
        "TIMESTAMP_PAGINATION" => Ok(OffsetMode::TimestampPagination),
        "CHAINING" => Ok(OffsetMode::Chaining),
        "SNAPSHOT_PAGINATION" => Ok(OffsetMode::SnapshotPagination),
        other => Err(ConnectError::Config(format!("invalid offset mode: {other}"))),
    }
}

fn parse_odata_token_mode(s: &str) -> ODataTokenMode {
    match s {
        "TOKEN_ONLY" => ODataTokenMode::TokenOnly,
        _ => ODataTokenMode::FullUrl,
    }
}

fn parse_eviction_policy(s: &str) -> EvictionPolicy {
    match s {
        "LFU" => EvictionPolicy::Lfu,
        "FIFO" => EvictionPolicy::Fifo,
        _ => EvictionPolicy::Lru,
    }
}

fn parse_rate_limit_algorithm(s: &str) -> RateLimitAlgorithm {
    match s {
        "SLIDING_WINDOW" => RateLimitAlgorithm::SlidingWindow,
        "FIXED_WINDOW" => RateLimitAlgorithm::FixedWindow,
        "LEAKY_BUCKET" => RateLimitAlgorithm::LeakyBucket,
        "ADAPTIVE" => RateLimitAlgorithm::Adaptive,
        _ => RateLimitAlgorithm::TokenBucket,
    }
}

fn parse_overflow_strategy(s: &str) -> OverflowStrategy {
    match s {
        "QUEUE" => OverflowStrategy::Queue,
        _ => OverflowStrategy::Drop,
    }
}

/// Parent/child relation from `api.chaining.parent.child.relationship`
/// (`spec.md` §6): comma-separated `child:parent` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRelation {
    pub child: String,
    pub parent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainingConfig {
    pub relations: Vec<ChainRelation>,
    pub metadata_topic: Option<String>,
    pub continue_on_parent_error: bool,
    pub parallel_processing_enabled: bool,
    pub max_queue_len: usize,
}

#[derive(Debug, Clone)]
pub struct TemplateConfig {
    pub variables: BTreeMap<String, String>,
    pub env_enabled: bool,
    pub date_format: String,
    pub time_format: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            variables: BTreeMap::new(),
            env_enabled: false,
            date_format: "%Y-%m-%d".to_string(),
            time_format: "%H:%M:%S".to_string(),
        }
    }
}

/// Top-level parsed configuration, frozen for the worker's lifetime.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub base_url: String,
    pub endpoints: Vec<Endpoint>,
    pub chaining: ChainingConfig,
    pub global_rate_limit: Option<RateLimitConfig>,
    pub max_records_per_poll: usize,
    pub max_poll_duration_ms: u64,
    pub template: TemplateConfig,
}

impl ConnectorConfig {
    /// Parse and validate the full property surface from `spec.md`
    /// §6. Fatal on any error — callers must treat `Err` as a startup
    /// failure, never retry it at poll time (`spec.md` §6).
    pub fn from_properties(props: &PropertyMap) -> Result<Self, ConnectError> {
        let base_url = get_owned(props, "http.api.base.url", "");

        let num_apis = get_u32(props, "apis.num", 0);
        if !(1..=15).contains(&num_apis) {
            return Err(ConnectError::Config(format!(
                "apis.num must be in 1..=15, got {num_apis}"
            )));
        }

        let mut endpoints = Vec::with_capacity(num_apis as usize);
        for n in 1..=num_apis {
            endpoints.push(Self::parse_endpoint(props, n)?);
        }

        let mut seen = std::collections::BTreeSet::new();
        for ep in &endpoints {
            if !seen.insert(ep.id.clone()) {
                return Err(ConnectError::Config(format!("duplicate endpoint id: {}", ep.id)));
            }
        }

        let chaining = Self::parse_chaining(props, &endpoints)?;

        let global_rate_limit = if get_bool(props, "rate.limiting.enabled", false)
            && get(props, "rate.limiting.scope").map(|s| s == "global").unwrap_or(false)
        {
            Some(Self::parse_rate_limit(props, 0))
        } else {
            None
        };

        let template = TemplateConfig {
            variables: props
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix("template.variables.").map(|name| (name.to_string(), v.clone()))
                })
                .collect(),
            env_enabled: get_bool(props, "template.env.enabled", false),
            date_format: get_owned(props, "template.date.format", "%Y-%m-%d"),
            time_format: get_owned(props, "template.time.format", "%H:%M:%S"),
        };

        Ok(Self {
            base_url,
            endpoints,
            chaining,
            global_rate_limit,
            max_records_per_poll: get_usize(props, "max.records.per.poll", 1000),
            max_poll_duration_ms: get_u64(props, "max.poll.duration.ms", 2_000),
            template,
        })
    }

    fn parse_endpoint(props: &PropertyMap, n: u32) -> Result<Endpoint, ConnectError> {
        let id = format!("api{n}");

        let path_template = api_get(props, n, "http.api.path")
            .ok_or_else(|| ConnectError::Config(format!("{id}.http.api.path is required")))?
            .to_string();

        let method = parse_method(&api_get_owned(props, n, "http.request.method", "GET"))?;

        let headers_template: BTreeMap<String, String> = api_get(props, n, "http.request.headers")
            .map(parse_kv_list)
            .unwrap_or_default();

        let body_template = api_get(props, n, "http.request.body").map(str::to_string);

        let topic = api_get(props, n, "topics")
            .ok_or_else(|| ConnectError::Config(format!("{id}.topics is required")))?
            .to_string();

        let offset_mode = parse_offset_mode(
            &api_get_owned(props, n, "http.offset.mode", "SIMPLE_INCREMENTING"),
        )?;

        let record_pointer = api_get(props, n, "http.response.data.json.pointer")
            .ok_or_else(|| {
                ConnectError::Config(format!("{id}.http.response.data.json.pointer is required"))
            })?
            .to_string();

        if offset_mode == OffsetMode::Chaining
            && api_get(props, n, "http.chaining.json.pointer").is_none()
        {
            return Err(ConnectError::Config(format!(
                "{id} uses CHAINING mode but http.chaining.json.pointer is missing"
            )));
        }

        Ok(Endpoint {
            id,
            path_template,
            method,
            headers_template,
            body_template,
            topic,
            interval_ms: api_get_u64(props, n, "request.interval.ms", 60_000),
            auth_ref: api_get(props, n, "auth.ref").map(str::to_string),

            offset_mode,
            initial_offset: api_get(props, n, "http.initial.offset").map(str::to_string),
            increment: api_get(props, n, "http.offset.increment")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),

            record_pointer,
            next_page_pointer: api_get(props, n, "http.next.page.json.pointer").map(str::to_string),
            chaining_value_pointer: api_get(props, n, "http.chaining.json.pointer").map(str::to_string),
            timestamp_pointer: api_get(props, n, "http.timestamp.json.pointer").map(str::to_string),
            timestamp_param: api_get_owned(props, n, "http.timestamp.param", "timestamp_param"),
            timestamp_format: api_get_owned(props, n, "http.timestamp.format", "%Y-%m-%dT%H:%M:%SZ"),

            odata_nextlink_field: api_get_owned(props, n, "odata.nextlink.field", "@odata.nextLink"),
            odata_deltalink_field: api_get_owned(props, n, "odata.deltalink.field", "@odata.deltaLink"),
            odata_token_mode: parse_odata_token_mode(&api_get_owned(
                props, n, "odata.token.mode", "FULL_URL",
            )),
            odata_nextlink_interval_ms: api_get_u64(props, n, "odata.nextlink.poll.interval.ms", 1_000),
            odata_deltalink_interval_ms: api_get_u64(
                props, n, "odata.deltalink.poll.interval.ms", 60_000,
            ),

            snapshot_total_pages_pointer: api_get(props, n, "snapshot.total.pages.json.pointer")
                .map(str::to_string),
            snapshot_id_pointer: api_get(props, n, "snapshot.id.json.pointer").map(str::to_string),

            connection_timeout_ms: api_get_u64(props, n, "connection.timeout.ms", 10_000),
            request_timeout_ms: api_get_u64(props, n, "request.timeout.ms", 30_000),

            rate_limit: Self::parse_rate_limit(props, n),
            cache: Self::parse_cache(props, n),
            breaker: Self::parse_breaker(props, n),
            retry: Self::parse_retry(props, n),
        })
    }

    fn parse_rate_limit(props: &PropertyMap, n: u32) -> RateLimitConfig {
        let d = RateLimitConfig::default();
        RateLimitConfig {
            enabled: api_get_bool(props, n, "rate.limiting.enabled", d.enabled),
            algorithm: parse_rate_limit_algorithm(&api_get_owned(
                props, n, "rate.limiting.algorithm", "TOKEN_BUCKET",
            )),
            requests_per_second: api_get_f64(
                props, n, "rate.limiting.requests.per.second", d.requests_per_second,
            ),
            bucket_capacity: api_get_f64(props, n, "rate.limiting.bucket.capacity", d.bucket_capacity),
            window_size_ms: api_get_u64(props, n, "rate.limiting.window.size.ms", d.window_size_ms),
            leak_rate: api_get_f64(props, n, "rate.limiting.leak.rate", d.leak_rate),
            overflow_strategy: parse_overflow_strategy(&api_get_owned(
                props, n, "rate.limiting.overflow.strategy", "DROP",
            )),
            handle_429: api_get_bool(props, n, "rate.limiting.429.handling.enabled", d.handle_429),
            initial_delay_ms: api_get_u64(
                props, n, "rate.limiting.429.initial.delay.ms", d.initial_delay_ms,
            ),
            max_delay_ms: api_get_u64(props, n, "rate.limiting.429.max.delay.ms", d.max_delay_ms),
            min_rate: d.min_rate,
            adaptation_window_secs: d.adaptation_window_secs,
            success_threshold: d.success_threshold,
            adaptation_factor: d.adaptation_factor,
        }
    }

    fn parse_cache(props: &PropertyMap, n: u32) -> CacheConfig {
        let d = CacheConfig::default();
        CacheConfig {
            enabled: api_get_bool(props, n, "response.caching.enabled", d.enabled),
            ttl_seconds: api_get_u64(props, n, "response.caching.ttl.seconds", d.ttl_seconds),
            max_size: api_get(props, n, "response.caching.max.size")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_size),
            max_memory_bytes: api_get_u64(props, n, "response.caching.max.memory.mb", 64) * 1024 * 1024,
            eviction_policy: parse_eviction_policy(&api_get_owned(
                props, n, "response.caching.eviction.policy", "LRU",
            )),
            conditional_enabled: api_get_bool(
                props, n, "response.caching.conditional.enabled", d.conditional_enabled,
            ),
            etag_enabled: api_get_bool(props, n, "response.caching.etag.enabled", d.etag_enabled),
            last_modified_enabled: api_get_bool(
                props, n, "response.caching.last.modified.enabled", d.last_modified_enabled,
            ),
            invalidation_enabled: api_get_bool(
                props, n, "response.caching.invalidation.enabled", d.invalidation_enabled,
            ),
            invalidation_error_codes: api_get_codes(
                props, n, "response.caching.invalidation.error.codes", &d.invalidation_error_codes,
            ),
        }
    }

    fn parse_breaker(props: &PropertyMap, n: u32) -> BreakerConfig {
        let d = BreakerConfig::default();
        BreakerConfig {
            enabled: api_get_bool(props, n, "circuit.breaker.enabled", d.enabled),
            failure_threshold: api_get_u32(
                props, n, "circuit.breaker.failure.threshold", d.failure_threshold,
            ),
            reset_timeout_ms: api_get_u64(props, n, "circuit.breaker.reset.timeout.ms", d.reset_timeout_ms),
            half_open_max_calls: api_get_u32(
                props, n, "circuit.breaker.half.open.max.calls", d.half_open_max_calls,
            ),
            half_open_required_successes: d.half_open_required_successes,
            bulkhead_group: api_get(props, n, "bulkhead.group").map(str::to_string),
        }
    }

    fn parse_retry(props: &PropertyMap, n: u32) -> RetryConfig {
        let d = RetryConfig::default();
        RetryConfig {
            enabled: api_get_bool(props, n, "error.retry.enabled", d.enabled),
            max_attempts: api_get_u32(props, n, "error.retry.max.attempts", d.max_attempts),
            base_backoff_ms: api_get_u64(props, n, "error.retry.backoff.ms", d.base_backoff_ms),
            max_backoff_ms: api_get_u64(props, n, "error.retry.max.backoff.ms", d.max_backoff_ms),
            jitter: api_get_bool(props, n, "error.retry.jitter", d.jitter),
            retryable_codes: api_get_codes(props, n, "error.retryable.codes", &d.retryable_codes),
            non_retryable_codes: api_get_codes(
                props, n, "error.non.retryable.codes", &d.non_retryable_codes,
            ),
            dlq_enabled: api_get_bool(props, n, "dlq.enabled", d.dlq_enabled),
            dlq_topic: get(props, "dlq.topic.name").map(str::to_string),
        }
    }

    fn parse_chaining(
        props: &PropertyMap,
        endpoints: &[Endpoint],
    ) -> Result<ChainingConfig, ConnectError> {
        let relations: Vec<ChainRelation> = match get(props, "api.chaining.parent.child.relationship") {
            Some(v) => v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|pair| {
                    let mut parts = pair.splitn(2, ':');
                    let child = parts.next().unwrap_or("").trim().to_string();
                    let parent = parts.next().unwrap_or("").trim().to_string();
                    if child.is_empty() || parent.is_empty() {
                        return Err(ConnectError::Config(format!(
                            "invalid chaining relation: {pair}"
                        )));
                    }
                    Ok(ChainRelation { child, parent })
                })
                .collect::<Result<_, _>>()?,
            None => Vec::new(),
        };

        let ids: std::collections::BTreeSet<&str> =
            endpoints.iter().map(|e| e.id.as_str()).collect();
        for rel in &relations {
            if !ids.contains(rel.child.as_str()) {
                return Err(ConnectError::Config(format!("unknown chaining child: {}", rel.child)));
            }
            if !ids.contains(rel.parent.as_str()) {
                return Err(ConnectError::Config(format!("unknown chaining parent: {}", rel.parent)));
            }
        }
        assert_acyclic(&relations)?;

        let mut children_per_parent: BTreeMap<&str, u32> = BTreeMap::new();
        for rel in &relations {
            *children_per_parent.entry(rel.parent.as_str()).or_default() += 1;
        }

        Ok(ChainingConfig {
            relations,
            metadata_topic: get(props, "api.chaining.metadata.topic").map(str::to_string),
            continue_on_parent_error: get_bool(props, "api.chaining.continue.on.parent.error", true),
            parallel_processing_enabled: get_bool(
                props, "api.chaining.parallel.processing.enabled", false,
            ),
            max_queue_len: get_usize(props, "api.chaining.max.queue.length", 10_000),
        })
    }
}

/// Validates the chaining relation graph is a DAG (`spec.md` §4.4/§9).
fn assert_acyclic(relations: &[ChainRelation]) -> Result<(), ConnectError> {
    use std::collections::{HashMap, HashSet};

    let mut parent_of: HashMap<&str, &str> = HashMap::new();
    for rel in relations {
        if parent_of.insert(rel.child.as_str(), rel.parent.as_str()).is_some() {
            return Err(ConnectError::Config(format!(
                "child endpoint {} declares more than one parent",
                rel.child
            )));
        }
    }

    for start in parent_of.keys() {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut cur = *start;
        loop {
            if !visited.insert(cur) {
                return Err(ConnectError::Config(format!(
                    "chaining relation graph contains a cycle involving {cur}"
                )));
            }
            match parent_of.get(cur) {
                Some(next) => cur = next,
                None => break,
            }
        }
    }
    Ok(())
}

fn parse_kv_list(s: &str) -> BTreeMap<String, String> {
    s.split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let k = parts.next()?.trim();
            let v = parts.next()?.trim();
            if k.is_empty() {
                None
            } else {
                Some((k.to_string(), v.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_props() -> PropertyMap {
        let mut p = PropertyMap::new();
        p.insert("apis.num".into(), "1".into());
        p.insert("api1.http.api.path".into(), "/events".into());
        p.insert("api1.topics".into(), "events-topic".into());
        p.insert(
            "api1.http.response.data.json.pointer".into(),
            "/data".into(),
        );
        p
    }

    #[test]
    fn parses_minimal_single_endpoint() {
        let cfg = ConnectorConfig::from_properties(&base_props()).unwrap();
        assert_eq!(cfg.endpoints.len(), 1);
        assert_eq!(cfg.endpoints[0].id, "api1");
        assert_eq!(cfg.endpoints[0].offset_mode, OffsetMode::SimpleIncrementing);
    }

    #[test]
    fn rejects_apis_num_out_of_range() {
        let mut p = base_props();
        p.insert("apis.num".into(), "16".into());
        assert!(ConnectorConfig::from_properties(&p).is_err());

        let mut p2 = base_props();
        p2.insert("apis.num".into(), "0".into());
        assert!(ConnectorConfig::from_properties(&p2).is_err());
    }

    #[test]
    fn requires_path_and_topic_and_pointer() {
        let mut p = PropertyMap::new();
        p.insert("apis.num".into(), "1".into());
        assert!(ConnectorConfig::from_properties(&p).is_err());
    }

    #[test]
    fn per_endpoint_overrides_global_breaker_config() {
        let mut p = base_props();
        p.insert("circuit.breaker.failure.threshold".into(), "10".into());
        p.insert("api1.circuit.breaker.failure.threshold".into(), "3".into());
        let cfg = ConnectorConfig::from_properties(&p).unwrap();
        assert_eq!(cfg.endpoints[0].breaker.failure_threshold, 3);
    }

    #[test]
    fn chaining_relations_parsed_and_validated() {
        let mut p = PropertyMap::new();
        p.insert("apis.num".into(), "2".into());
        p.insert("api1.http.api.path".into(), "/orgs".into());
        p.insert("api1.topics".into(), "orgs".into());
        p.insert("api1.http.response.data.json.pointer".into(), "/data".into());
        p.insert("api1.http.offset.mode".into(), "CHAINING".into());
        p.insert("api1.http.chaining.json.pointer".into(), "/id".into());
        p.insert("api2.http.api.path".into(), "/orgs/${parent_value}/depts".into());
        p.insert("api2.topics".into(), "depts".into());
        p.insert("api2.http.response.data.json.pointer".into(), "/data".into());
        p.insert("api2.http.offset.mode".into(), "CHAINING".into());
        p.insert(
            "api.chaining.parent.child.relationship".into(),
            "api2:api1".into(),
        );

        let cfg = ConnectorConfig::from_properties(&p).unwrap();
        assert_eq!(cfg.chaining.relations.len(), 1);
        assert_eq!(cfg.chaining.relations[0].child, "api2");
        assert_eq!(cfg.chaining.relations[0].parent, "api1");
    }

    #[test]
    fn rejects_cyclic_chaining_relations() {
        let mut p = PropertyMap::new();
        p.insert("apis.num".into(), "2".into());
        p.insert("api1.http.api.path".into(), "/a".into());
        p.insert("api1.topics".into(), "a".into());
        p.insert("api1.http.response.data.json.pointer".into(), "/data".into());
        p.insert("api2.http.api.path".into(), "/b".into());
        p.insert("api2.topics".into(), "b".into());
        p.insert("api2.http.response.data.json.pointer".into(), "/data".into());
        p.insert(
            "api.chaining.parent.child.relationship".into(),
            "api1:api2,api2:api1".into(),
        );
        assert!(ConnectorConfig::from_properties(&p).is_err());
    }

    #[test]
    fn chaining_requires_known_endpoints() {
        let mut p = base_props();
        p.insert(
            "api.chaining.parent.child.relationship".into(),
            "apiX:api1".into(),
        );
        assert!(ConnectorConfig::from_properties(&p).is_err());
    }
}
