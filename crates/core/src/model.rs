use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier for one configured endpoint (`api1`, `api2`, ...).
pub type EndpointId = String;

/// HTTP methods an endpoint may issue. Kept as a closed enum rather
/// than a raw string so config validation can reject typos at
/// `start()` instead of at the first `poll()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

/// Which `OffsetState` variant an endpoint is bound to. Fixed at
/// configuration time — the engine never transitions an endpoint
/// between modes (`spec.md` §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetMode {
    SimpleIncrementing,
    CursorPagination,
    ODataPagination,
    TimestampPagination,
    Chaining,
    SnapshotPagination,
}

/// OData link-following strategy (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ODataTokenMode {
    /// Use the nextLink/deltaLink value verbatim as the next URL.
    FullUrl,
    /// Extract just the `$skiptoken`/`$deltatoken` query parameter.
    TokenOnly,
}

/// Eviction policy for the response cache (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
}

/// Rate limiting algorithm (`spec.md` §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
    Adaptive,
}

/// Leaky-bucket overflow strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowStrategy {
    Drop,
    Queue,
}

/// Per-endpoint rate limit configuration. `algorithm == Adaptive`
/// layers 429-aware throttling on top of `TokenBucket` semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub algorithm: RateLimitAlgorithm,
    pub requests_per_second: f64,
    pub bucket_capacity: f64,
    pub window_size_ms: u64,
    pub leak_rate: f64,
    pub overflow_strategy: OverflowStrategy,
    pub handle_429: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub min_rate: f64,
    pub adaptation_window_secs: u64,
    pub success_threshold: f64,
    pub adaptation_factor: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: RateLimitAlgorithm::TokenBucket,
            requests_per_second: 10.0,
            bucket_capacity: 10.0,
            window_size_ms: 1_000,
            leak_rate: 10.0,
            overflow_strategy: OverflowStrategy::Drop,
            handle_429: false,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            min_rate: 0.1,
            adaptation_window_secs: 30,
            success_threshold: 0.95,
            adaptation_factor: 2.0,
        }
    }
}

/// Per-endpoint circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
    pub half_open_required_successes: u32,
    pub bulkhead_group: Option<String>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_max_calls: 1,
            half_open_required_successes: 1,
            bulkhead_group: None,
        }
    }
}

/// Per-endpoint response cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_size: usize,
    pub max_memory_bytes: u64,
    pub eviction_policy: EvictionPolicy,
    pub conditional_enabled: bool,
    pub etag_enabled: bool,
    pub last_modified_enabled: bool,
    pub invalidation_enabled: bool,
    pub invalidation_error_codes: Vec<u16>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: 60,
            max_size: 1_000,
            max_memory_bytes: 64 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            conditional_enabled: true,
            etag_enabled: true,
            last_modified_enabled: true,
            invalidation_enabled: true,
            invalidation_error_codes: vec![500, 502, 503, 504],
        }
    }
}

/// Retry / DLQ configuration shared by the fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
    pub retryable_codes: Vec<u16>,
    pub non_retryable_codes: Vec<u16>,
    pub dlq_enabled: bool,
    pub dlq_topic: Option<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter: true,
            retryable_codes: vec![429, 500, 502, 503, 504],
            non_retryable_codes: vec![400, 401, 403, 404, 422],
            dlq_enabled: false,
            dlq_topic: None,
        }
    }
}

/// Immutable per-endpoint configuration (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub path_template: String,
    pub method: HttpMethod,
    pub headers_template: BTreeMap<String, String>,
    pub body_template: Option<String>,
    pub topic: String,
    pub interval_ms: u64,
    pub auth_ref: Option<String>,

    pub offset_mode: OffsetMode,
    pub initial_offset: Option<String>,
    pub increment: i64,

    pub record_pointer: String,
    pub next_page_pointer: Option<String>,
    pub chaining_value_pointer: Option<String>,
    pub timestamp_pointer: Option<String>,
    pub timestamp_param: String,
    pub timestamp_format: String,

    pub odata_nextlink_field: String,
    pub odata_deltalink_field: String,
    pub odata_token_mode: ODataTokenMode,
    pub odata_nextlink_interval_ms: u64,
    pub odata_deltalink_interval_ms: u64,

    pub snapshot_total_pages_pointer: Option<String>,
    pub snapshot_id_pointer: Option<String>,

    pub connection_timeout_ms: u64,
    pub request_timeout_ms: u64,

    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
}

/// Destination metadata for a chain-expansion event (`spec.md` §3/§4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainMetadata {
    pub parent_id: EndpointId,
    pub child_id: EndpointId,
    pub parent_value: String,
    pub emitted_at: DateTime<Utc>,
    pub status: ChainStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainStatus {
    Enqueued,
    Dispatched,
    Failed,
}

/// A record value, as extracted by the record extractor. Kept as raw
/// JSON here; `RecordEncoder` (outside this workspace's scope) is
/// responsible for any schema-aware serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub key: Option<String>,
    pub value: serde_json::Value,
    pub partition_key: EndpointId,
    pub source_offset: BTreeMap<String, serde_json::Value>,
}

/// Ephemeral result of one `poll()` call (`spec.md` §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollBatch {
    pub records: Vec<Record>,
    pub offsets: BTreeMap<EndpointId, serde_json::Value>,
    pub chain_metadata: Vec<ChainMetadata>,
}

impl PollBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.chain_metadata.is_empty()
    }
}
