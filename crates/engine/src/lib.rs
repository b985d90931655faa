//! The orchestrator (`spec.md` §4.2/§5): one `Engine` per connector
//! instance, owning all per-endpoint runtime state and driving
//! `poll()` — scheduling, fetch, offset advance, chain expansion, and
//! DLQ routing tied together.
//!
//! `poll()` spawns one task per selected endpoint this round and waits
//! for them under a deadline. On deadline, outstanding tasks are
//! aborted rather than awaited to completion — an aborted task never
//! reaches the line that writes its offset back, so a slow endpoint
//! loses its slot this round without corrupting state (`spec.md` §5
//! cancellation invariant).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as TokioMutex;

use connect_breaker::{Admission, BreakerRegistry};
use connect_cache::{Lookup, ResponseCache};
use connect_chaining::ChainGraph;
use connect_core::auth::{Authenticator, NoopAuthenticator, OutboundRequest};
use connect_core::config::ConnectorConfig;
use connect_core::error::{ConnectError, ErrorClass};
use connect_core::metrics::Metrics;
use connect_core::model::{
    ChainMetadata, Endpoint, EndpointId, HttpMethod, OffsetMode, PollBatch, Record,
};
use connect_core::offset_state::{ODataPhase, OffsetState};
use connect_core::template::{substitute, TemplateContext};
use connect_fetch::{fetch_with_retry, DlqEvent, DlqRouter, FetchRequest, FetchResult, RawFetch};
use connect_offsets::UpdateSignal;
use connect_ratelimit::{Decision, RateLimiter};

struct EndpointRuntime {
    endpoint: Endpoint,
    offset: TokioMutex<OffsetState>,
    next_due: TokioMutex<Instant>,
    limiter: RateLimiter,
    cache: Option<ResponseCache>,
}

/// Everything one `step_endpoint` call produced, folded into the
/// poll's `PollBatch` by the caller.
struct StepOutcome {
    endpoint_id: EndpointId,
    records: Vec<Record>,
    chain_metadata: Vec<ChainMetadata>,
    offset_after: Option<OffsetState>,
}

impl StepOutcome {
    fn empty(endpoint_id: EndpointId) -> Self {
        Self { endpoint_id, records: Vec::new(), chain_metadata: Vec::new(), offset_after: None }
    }
}

pub struct Engine {
    config: ConnectorConfig,
    graph: ChainGraph,
    runtimes: HashMap<EndpointId, Arc<EndpointRuntime>>,
    breakers: BreakerRegistry,
    dlq: DlqRouter,
    metrics: Arc<dyn Metrics>,
    fetcher: Arc<dyn RawFetch>,
    authenticators: HashMap<String, Arc<dyn Authenticator>>,
    noop_authenticator: Arc<dyn Authenticator>,
    root_rotation: TokioMutex<VecDeque<EndpointId>>,
}

fn default_offset_state(endpoint: &Endpoint) -> OffsetState {
    match endpoint.offset_mode {
        OffsetMode::SimpleIncrementing => OffsetState::initial_simple_counter(endpoint.initial_offset.as_deref()),
        OffsetMode::CursorPagination => OffsetState::initial_cursor(endpoint.initial_offset.as_deref()),
        OffsetMode::ODataPagination => OffsetState::initial_odata(),
        OffsetMode::TimestampPagination => OffsetState::initial_timestamp(endpoint.initial_offset.as_deref()),
        OffsetMode::Chaining => OffsetState::initial_chaining(),
        OffsetMode::SnapshotPagination => OffsetState::initial_snapshot(),
    }
}

/// The interval until the next poll is not always the endpoint's flat
/// `interval_ms`: an OData-paginating endpoint uses its phase-specific
/// interval, and a chaining child with values still queued must be
/// revisited immediately (`spec.md` §4.3).
fn scheduled_interval_ms(endpoint: &Endpoint, offset: &OffsetState) -> u64 {
    match offset {
        OffsetState::ODataLink { phase: ODataPhase::NextLink, .. } => endpoint.odata_nextlink_interval_ms,
        OffsetState::ODataLink { phase: ODataPhase::DeltaLink, .. } => endpoint.odata_deltalink_interval_ms,
        OffsetState::Chaining { parent_values, .. } if !parent_values.is_empty() => 0,
        _ => endpoint.interval_ms,
    }
}

fn offset_to_map(state: &OffsetState) -> BTreeMap<String, serde_json::Value> {
    match serde_json::to_value(state) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

fn status_of(err: &ConnectError) -> Option<u16> {
    match err {
        ConnectError::ServerTransient { status, .. } | ConnectError::ClientPermanent { status, .. } => Some(*status),
        _ => None,
    }
}

fn attempts_of(err: &ConnectError) -> u32 {
    match err {
        ConnectError::RetriesExhausted { attempts, .. } => *attempts,
        _ => 1,
    }
}

fn class_label(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::Transport => "transport",
        ErrorClass::ServerTransient => "server_transient",
        ErrorClass::ClientPermanent => "client_permanent",
        ErrorClass::Throttled => "throttled",
        ErrorClass::Parse => "parse",
        ErrorClass::Config => "config",
        ErrorClass::BreakerOpen => "breaker_open",
    }
}

/// Derive the post-fetch pagination signal purely from the *tag* of
/// the current `OffsetState` — this is what lets a chaining middle
/// node (simultaneously a child of its own parent and a parent of its
/// children) fall out naturally, with no separate "is this a root or
/// a child" branch: its state IS `Chaining`, so it pops its own queue
/// exactly like a leaf child would.
fn build_signal(
    endpoint: &Endpoint,
    current: &OffsetState,
    parsed: &serde_json::Value,
    records: &[serde_json::Value],
) -> Result<UpdateSignal, ConnectError> {
    match current {
        OffsetState::SimpleCounter { .. } => Ok(UpdateSignal::SimpleCounter),

        OffsetState::Cursor { .. } => {
            let next_token = endpoint
                .next_page_pointer
                .as_deref()
                .and_then(|p| connect_core::pointer::extract_optional_str(parsed, p));
            Ok(UpdateSignal::Cursor { next_token })
        }

        OffsetState::ODataLink { .. } => {
            let next_link =
                connect_core::pointer::extract_optional_str(parsed, &format!("/{}", endpoint.odata_nextlink_field));
            let delta_link =
                connect_core::pointer::extract_optional_str(parsed, &format!("/{}", endpoint.odata_deltalink_field));
            Ok(UpdateSignal::ODataLink { next_link, delta_link })
        }

        OffsetState::Timestamp { .. } => {
            let pointer = endpoint.timestamp_pointer.as_deref().ok_or_else(|| {
                ConnectError::Config(format!(
                    "{} uses TIMESTAMP_PAGINATION but timestamp_pointer is missing",
                    endpoint.id
                ))
            })?;
            let mut max_ts: Option<DateTime<Utc>> = None;
            for item in records {
                if let Some(s) = item.pointer(pointer).and_then(|v| v.as_str()) {
                    if let Ok(parsed_dt) = DateTime::parse_from_rfc3339(s) {
                        let dt = parsed_dt.with_timezone(&Utc);
                        if max_ts.map_or(true, |m| dt > m) {
                            max_ts = Some(dt);
                        }
                    }
                }
            }
            Ok(UpdateSignal::Timestamp { max_record_timestamp: max_ts })
        }

        OffsetState::Chaining { .. } => Ok(UpdateSignal::Chaining),

        OffsetState::Snapshot { total_pages, .. } => {
            let extracted_total = endpoint
                .snapshot_total_pages_pointer
                .as_deref()
                .and_then(|p| connect_core::pointer::extract_optional_u64(parsed, p));
            let snapshot_id = endpoint
                .snapshot_id_pointer
                .as_deref()
                .and_then(|p| connect_core::pointer::extract_optional_str(parsed, p));
            Ok(UpdateSignal::Snapshot { total_pages: extracted_total.or(*total_pages), snapshot_id })
        }
    }
}

impl Engine {
    /// Build the engine from parsed config and its collaborators.
    /// `restored_offsets` is the host's persisted `PollBatch.offsets`
    /// from the previous run — missing/corrupt entries fall back to
    /// each endpoint's configured initial state.
    pub fn start(
        config: ConnectorConfig,
        fetcher: Arc<dyn RawFetch>,
        authenticators: HashMap<String, Arc<dyn Authenticator>>,
        metrics: Arc<dyn Metrics>,
        restored_offsets: &BTreeMap<EndpointId, serde_json::Value>,
    ) -> Result<Arc<Self>, ConnectError> {
        let graph = ChainGraph::from_config(&config.chaining);
        let now = Instant::now();
        let mut runtimes = HashMap::with_capacity(config.endpoints.len());
        let mut root_order = VecDeque::new();

        for endpoint in &config.endpoints {
            let initial = restored_offsets
                .get(&endpoint.id)
                .and_then(|v| serde_json::from_value::<OffsetState>(v.clone()).ok())
                .unwrap_or_else(|| default_offset_state(endpoint));

            let cache = if endpoint.cache.enabled {
                Some(ResponseCache::new(
                    Duration::from_secs(endpoint.cache.ttl_seconds),
                    endpoint.cache.max_size,
                    endpoint.cache.max_memory_bytes,
                    endpoint.cache.eviction_policy,
                    endpoint.cache.conditional_enabled,
                    endpoint.cache.etag_enabled,
                    endpoint.cache.last_modified_enabled,
                ))
            } else {
                None
            };

            if graph.is_root(&endpoint.id) {
                root_order.push_back(endpoint.id.clone());
            }

            runtimes.insert(
                endpoint.id.clone(),
                Arc::new(EndpointRuntime {
                    limiter: RateLimiter::new(endpoint.rate_limit.clone(), now),
                    endpoint: endpoint.clone(),
                    offset: TokioMutex::new(initial),
                    next_due: TokioMutex::new(now),
                    cache,
                }),
            );
        }

        Ok(Arc::new(Self {
            graph,
            runtimes,
            breakers: BreakerRegistry::new(),
            dlq: DlqRouter::new(),
            metrics,
            fetcher,
            authenticators,
            noop_authenticator: Arc::new(NoopAuthenticator),
            root_rotation: TokioMutex::new(root_order),
            config,
        }))
    }

    /// Drain structured failures routed to the DLQ since the last
    /// call, for the host to hand to its configured sink.
    pub fn drain_dlq(&self) -> Vec<DlqEvent> {
        self.dlq.drain()
    }

    /// One polling round: select due endpoints (children before roots,
    /// round-robin among roots), run each concurrently, and fold the
    /// results into a single batch bounded by `max_records_per_poll`
    /// and `max_poll_duration_ms`.
    pub async fn poll(self: &Arc<Self>) -> PollBatch {
        let now = Instant::now();
        let wall_now = Utc::now();
        let candidates = self.select_candidates(now).await;

        let total_records = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_records = self.config.max_records_per_poll;

        let mut set = tokio::task::JoinSet::new();
        for id in candidates {
            let engine = Arc::clone(self);
            let total_records = Arc::clone(&total_records);
            set.spawn(async move { engine.step_endpoint_loop(id, wall_now, total_records, max_records).await });
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.max_poll_duration_ms);
        let mut outcomes = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!("poll deadline reached with endpoint tasks still in flight");
                break;
            }
            match tokio::time::timeout(remaining, set.join_next()).await {
                Ok(Some(Ok(batch_outcomes))) => outcomes.extend(batch_outcomes),
                Ok(Some(Err(join_err))) => tracing::warn!(error = %join_err, "endpoint step task panicked"),
                Ok(None) => break,
                Err(_elapsed) => {
                    tracing::warn!("poll deadline reached with endpoint tasks still in flight");
                    break;
                }
            }
        }
        set.abort_all();

        let mut batch = PollBatch::default();
        for outcome in outcomes {
            batch.records.extend(outcome.records);
            batch.chain_metadata.extend(outcome.chain_metadata);
            if let Some(state) = outcome.offset_after {
                if let Ok(value) = serde_json::to_value(&state) {
                    batch.offsets.insert(outcome.endpoint_id, value);
                }
            }
        }
        if batch.records.len() > self.config.max_records_per_poll {
            let dropped = batch.records.len() - self.config.max_records_per_poll;
            tracing::debug!(kept = self.config.max_records_per_poll, dropped, "truncating poll batch");
            batch.records.truncate(self.config.max_records_per_poll);
        }
        batch
    }

    /// Children with a non-empty parent-value queue always come
    /// first; due roots follow in round-robin order so no single root
    /// starves the others across repeated polls.
    async fn select_candidates(&self, now: Instant) -> Vec<EndpointId> {
        let mut children = Vec::new();
        let mut due_roots = Vec::new();

        for endpoint in &self.config.endpoints {
            let runtime = &self.runtimes[&endpoint.id];
            if self.graph.is_child(&endpoint.id) {
                // A child mid-sweep is always a candidate regardless of
                // `next_due` — pagination cursors must drain within the
                // same poll, not wait for the next scheduled tick.
                let state = runtime.offset.lock().await;
                if !state.sweep_complete() {
                    children.push(endpoint.id.clone());
                    continue;
                }
                drop(state);
                if *runtime.next_due.lock().await <= now {
                    children.push(endpoint.id.clone());
                }
                continue;
            }
            if *runtime.next_due.lock().await <= now {
                due_roots.push(endpoint.id.clone());
            }
        }

        let mut rotation = self.root_rotation.lock().await;
        let ordered: Vec<EndpointId> = rotation.iter().filter(|id| due_roots.contains(id)).cloned().collect();
        for id in &ordered {
            if let Some(pos) = rotation.iter().position(|x| x == id) {
                if let Some(moved) = rotation.remove(pos) {
                    rotation.push_back(moved);
                }
            }
        }

        children.extend(ordered);
        children
    }

    async fn snapshot_children(&self, parent_id: &str) -> (HashMap<EndpointId, usize>, HashMap<EndpointId, OffsetState>) {
        let mut depth = HashMap::new();
        let mut state = HashMap::new();
        for child in self.graph.children_of(parent_id) {
            if let Some(runtime) = self.runtimes.get(child) {
                let s = runtime.offset.lock().await.clone();
                let d = match &s {
                    OffsetState::Chaining { parent_values, .. } => parent_values.len(),
                    _ => 0,
                };
                depth.insert(child.clone(), d);
                state.insert(child.clone(), s);
            }
        }
        (depth, state)
    }

    /// Cache-aware dispatch: fresh hits skip HTTP entirely, stale
    /// revalidatable entries get a conditional request, everything
    /// else falls through to a normal `fetch_with_retry`.
    async fn cached_fetch(
        &self,
        runtime: &EndpointRuntime,
        request: &FetchRequest,
        cache_key: Option<&str>,
        authenticator: &dyn Authenticator,
    ) -> Result<Vec<u8>, ConnectError> {
        let (cache, key) = match (&runtime.cache, cache_key) {
            (Some(cache), Some(key)) => (cache, key),
            _ => {
                let result = fetch_with_retry(self.fetcher.as_ref(), request, &runtime.endpoint.retry, authenticator).await?;
                return Ok(result.body);
            }
        };

        match cache.lookup(key, Instant::now()) {
            Lookup::Fresh(entry) => Ok(entry.body),
            Lookup::Revalidate { etag, last_modified } => {
                let mut conditional = request.clone();
                if let Some(etag) = &etag {
                    conditional.headers.push(("If-None-Match".to_string(), etag.clone()));
                }
                if let Some(last_modified) = &last_modified {
                    conditional.headers.push(("If-Modified-Since".to_string(), last_modified.clone()));
                }
                let result = fetch_with_retry(self.fetcher.as_ref(), &conditional, &runtime.endpoint.retry, authenticator).await?;
                if result.status == Some(304) {
                    cache.mark_revalidated(key, Instant::now());
                    if let Lookup::Fresh(entry) = cache.lookup(key, Instant::now()) {
                        return Ok(entry.body);
                    }
                }
                self.maybe_store(&runtime.endpoint, cache, key, &result);
                Ok(result.body)
            }
            Lookup::Miss => {
                let result = fetch_with_retry(self.fetcher.as_ref(), request, &runtime.endpoint.retry, authenticator).await?;
                self.maybe_store(&runtime.endpoint, cache, key, &result);
                Ok(result.body)
            }
        }
    }

    fn maybe_store(&self, endpoint: &Endpoint, cache: &ResponseCache, key: &str, result: &FetchResult) {
        let status = result.status.unwrap_or(0);
        if (200..300).contains(&status) {
            let find = |name: &str| {
                result.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.clone())
            };
            cache.store(key, result.body.clone(), find("content-type"), find("etag"), find("last-modified"), Instant::now());
        } else if endpoint.cache.invalidation_enabled && endpoint.cache.invalidation_error_codes.contains(&status) {
            cache.invalidate(key);
        }
    }

    /// Fetch `id` repeatedly within this single `poll()` call while it
    /// is still draining a pagination cursor, stopping once its sweep
    /// completes or the poll's shared `max_records_per_poll` budget is
    /// reached (`spec.md` §4.2 fairness exception). A step that makes
    /// no progress (no records, still mid-sweep) stops the loop too,
    /// since nothing short of the sweep completing would otherwise end
    /// it.
    async fn step_endpoint_loop(
        self: Arc<Self>,
        id: EndpointId,
        wall_now: DateTime<Utc>,
        total_records: Arc<std::sync::atomic::AtomicUsize>,
        max_records: usize,
    ) -> Vec<StepOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let outcome = Arc::clone(&self).step_endpoint(id.clone(), wall_now).await;
            let still_paginating = outcome.offset_after.as_ref().is_some_and(|s| !s.sweep_complete());
            let made_progress = !outcome.records.is_empty();
            total_records.fetch_add(outcome.records.len(), std::sync::atomic::Ordering::Relaxed);
            outcomes.push(outcome);

            if !still_paginating || !made_progress {
                break;
            }
            if total_records.load(std::sync::atomic::Ordering::Relaxed) >= max_records {
                break;
            }
        }
        outcomes
    }

    async fn step_endpoint(self: Arc<Self>, id: EndpointId, wall_now: DateTime<Utc>) -> StepOutcome {
        let runtime = match self.runtimes.get(&id) {
            Some(r) => Arc::clone(r),
            None => return StepOutcome::empty(id),
        };

        let current_offset = runtime.offset.lock().await.clone();
        {
            let mut next_due = runtime.next_due.lock().await;
            let interval = scheduled_interval_ms(&runtime.endpoint, &current_offset);
            *next_due = Instant::now() + Duration::from_millis(interval);
        }

        let breaker = self.breakers.get_or_create(&id, &runtime.endpoint.breaker);
        if breaker.try_call_at(Instant::now()) == Admission::Rejected {
            self.metrics.incr_counter("connect.breaker.rejected", &[("endpoint", id.as_str())], 1);
            return StepOutcome::empty(id);
        }

        match runtime.limiter.try_acquire_at(Instant::now()) {
            Decision::Admit => {}
            Decision::Wait(_) | Decision::Reject => {
                self.metrics.incr_counter("connect.ratelimit.rejected", &[("endpoint", id.as_str())], 1);
                return StepOutcome::empty(id);
            }
        }

        let next = match connect_offsets::next_request(&runtime.endpoint, &current_offset) {
            Ok(Some(n)) => n,
            Ok(None) => return StepOutcome::empty(id),
            Err(err) => {
                tracing::warn!(endpoint_id = %id, error = %err, "failed to compute next request");
                return StepOutcome::empty(id);
            }
        };

        let mut ctx = TemplateContext::new()
            .with_env_enabled(self.config.template.env_enabled)
            .with_date_format(self.config.template.date_format.clone())
            .with_time_format(self.config.template.time_format.clone());
        for (k, v) in &self.config.template.variables {
            ctx.set(k.clone(), v.clone());
        }
        for (k, v) in &next.vars {
            ctx.set(k.clone(), v.clone());
        }

        let path_or_url = match &next.url_override {
            Some(url) => url.clone(),
            None => match substitute(&runtime.endpoint.path_template, &ctx) {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(endpoint_id = %id, error = %err, "path template substitution failed");
                    return StepOutcome::empty(id);
                }
            },
        };

        let base_url = if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url
        } else {
            format!("{}{}", self.config.base_url, path_or_url)
        };

        let mut url_obj = match url::Url::parse(&base_url) {
            Ok(u) => u,
            Err(err) => {
                tracing::warn!(endpoint_id = %id, error = %err, "invalid endpoint url");
                return StepOutcome::empty(id);
            }
        };
        if !next.extra_query.is_empty() {
            let mut pairs = url_obj.query_pairs_mut();
            for (k, v) in &next.extra_query {
                pairs.append_pair(k, v);
            }
        }

        let mut headers = Vec::with_capacity(runtime.endpoint.headers_template.len());
        for (k, v) in &runtime.endpoint.headers_template {
            match substitute(v, &ctx) {
                Ok(value) => headers.push((k.clone(), value)),
                Err(err) => {
                    tracing::warn!(endpoint_id = %id, error = %err, "header template substitution failed");
                    return StepOutcome::empty(id);
                }
            }
        }
        let body = match runtime.endpoint.body_template.as_deref().map(|b| substitute(b, &ctx)).transpose() {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(endpoint_id = %id, error = %err, "body template substitution failed");
                return StepOutcome::empty(id);
            }
        };

        let authenticator = self
            .authenticators
            .get(runtime.endpoint.auth_ref.as_deref().unwrap_or(""))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.noop_authenticator));

        let mut outbound = OutboundRequest { url: url_obj.to_string(), headers, query_params: Vec::new() };
        if let Err(err) = authenticator.authenticate(&mut outbound).await {
            tracing::warn!(endpoint_id = %id, error = %err, "authentication failed");
            self.metrics.incr_counter("connect.auth.failure", &[("endpoint", id.as_str())], 1);
            return StepOutcome::empty(id);
        }
        if !outbound.query_params.is_empty() {
            if let Ok(mut u) = url::Url::parse(&outbound.url) {
                {
                    let mut pairs = u.query_pairs_mut();
                    for (k, v) in &outbound.query_params {
                        pairs.append_pair(k, v);
                    }
                }
                outbound.url = u.to_string();
            }
        }
        let full_url = outbound.url;

        let fetch_request = FetchRequest {
            endpoint_id: id.clone(),
            method: runtime.endpoint.method,
            url: full_url.clone(),
            headers: outbound.headers,
            body,
            connection_timeout: Duration::from_millis(runtime.endpoint.connection_timeout_ms),
            request_timeout: Duration::from_millis(runtime.endpoint.request_timeout_ms),
        };

        let cache_key = if runtime.endpoint.cache.enabled {
            let header_refs: Vec<(&str, &str)> =
                fetch_request.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            Some(ResponseCache::key(fetch_request.method.as_str(), &fetch_request.url, &header_refs))
        } else {
            None
        };

        let body_bytes = match self.cached_fetch(&runtime, &fetch_request, cache_key.as_deref(), authenticator.as_ref()).await {
            Ok(bytes) => {
                breaker.record_success_at(Instant::now());
                runtime.limiter.on_response(Instant::now(), 200, None);
                bytes
            }
            Err(err) => {
                breaker.record_failure_at(Instant::now(), err.class());
                let retry_after = match &err {
                    ConnectError::Throttled { retry_after_secs: Some(secs), .. } => Some(Duration::from_secs(*secs)),
                    _ => None,
                };
                runtime.limiter.on_response(Instant::now(), status_of(&err).unwrap_or(0), retry_after);
                self.metrics.incr_counter(
                    "connect.fetch.failure",
                    &[("endpoint", id.as_str()), ("class", class_label(err.class()))],
                    1,
                );
                if runtime.endpoint.retry.dlq_enabled {
                    self.dlq.route(DlqEvent::new(
                        &id,
                        &full_url,
                        serde_json::to_value(&current_offset).unwrap_or(serde_json::Value::Null),
                        status_of(&err),
                        &[],
                        err.class(),
                        attempts_of(&err),
                        &err.to_string(),
                    ));
                }
                return StepOutcome::empty(id);
            }
        };

        let parsed: serde_json::Value = match serde_json::from_slice(&body_bytes) {
            Ok(v) => v,
            Err(parse_err) => {
                self.metrics.incr_counter("connect.parse.failure", &[("endpoint", id.as_str())], 1);
                if runtime.endpoint.retry.dlq_enabled {
                    self.dlq.route(DlqEvent::new(
                        &id,
                        &full_url,
                        serde_json::to_value(&current_offset).unwrap_or(serde_json::Value::Null),
                        None,
                        &body_bytes,
                        ErrorClass::Parse,
                        1,
                        &parse_err.to_string(),
                    ));
                }
                return StepOutcome::empty(id);
            }
        };

        let records: Vec<serde_json::Value> =
            match connect_core::pointer::extract_records(&parsed, &runtime.endpoint.record_pointer, &id) {
                Ok(items) => items.to_vec(),
                Err(err) => {
                    self.metrics.incr_counter("connect.parse.failure", &[("endpoint", id.as_str())], 1);
                    if runtime.endpoint.retry.dlq_enabled {
                        self.dlq.route(DlqEvent::new(
                            &id,
                            &full_url,
                            serde_json::to_value(&current_offset).unwrap_or(serde_json::Value::Null),
                            None,
                            &body_bytes,
                            ErrorClass::Parse,
                            1,
                            &err.to_string(),
                        ));
                    }
                    return StepOutcome::empty(id);
                }
            };

        let mut chain_metadata = Vec::new();
        let final_state = match build_signal(&runtime.endpoint, &current_offset, &parsed, &records) {
            Ok(signal) => {
                let new_state = connect_offsets::advance(&current_offset, signal, runtime.endpoint.increment);
                *runtime.offset.lock().await = new_state.clone();

                if let Some(ptr) = &runtime.endpoint.chaining_value_pointer {
                    if !self.graph.children_of(&id).is_empty() {
                        let values: Vec<String> =
                            records.iter().filter_map(|r| connect_core::pointer::extract_optional_str(r, ptr)).collect();
                        if !values.is_empty() {
                            let (depth, child_states) = self.snapshot_children(&id).await;
                            let expansion = connect_chaining::expand(
                                &self.graph,
                                &id,
                                &values,
                                self.config.chaining.max_queue_len,
                                |c| *depth.get(c).unwrap_or(&0),
                                |c| child_states.get(c).cloned().unwrap_or_else(OffsetState::initial_chaining),
                                wall_now,
                            );
                            for (child_id, new_child_state) in &expansion.updated_child_state {
                                if let Some(child_runtime) = self.runtimes.get(child_id) {
                                    *child_runtime.offset.lock().await = new_child_state.clone();
                                }
                            }
                            chain_metadata.extend(expansion.metadata);
                            if !expansion.overflowed_children.is_empty() {
                                tracing::warn!(
                                    endpoint_id = %id,
                                    overflowed = ?expansion.overflowed_children,
                                    "chain child queue at capacity"
                                );
                            }
                        }
                    }
                }
                Some(new_state)
            }
            Err(err) => {
                tracing::warn!(endpoint_id = %id, error = %err, "pagination signal parse failed, offset not advanced");
                None
            }
        };

        // The interval set before the fetch reflected the pre-fetch
        // state; once the offset has advanced, re-derive it from the
        // new state so a phase switch (or a chaining queue draining to
        // empty) takes effect starting with the very next schedule.
        if let Some(new_state) = &final_state {
            let mut next_due = runtime.next_due.lock().await;
            *next_due = Instant::now() + Duration::from_millis(scheduled_interval_ms(&runtime.endpoint, new_state));
        }

        let source_offset = offset_to_map(final_state.as_ref().unwrap_or(&current_offset));
        let out_records = records
            .into_iter()
            .map(|value| Record {
                topic: runtime.endpoint.topic.clone(),
                key: None,
                value,
                partition_key: id.clone(),
                source_offset: source_offset.clone(),
            })
            .collect();

        StepOutcome { endpoint_id: id, records: out_records, chain_metadata, offset_after: final_state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_core::config::{ChainRelation, ChainingConfig, ConnectorConfig, TemplateConfig};
    use connect_core::model::{
        BreakerConfig, CacheConfig, HttpMethod, ODataTokenMode, OffsetMode, RateLimitConfig, RetryConfig,
    };
    use std::collections::BTreeMap as StdBTreeMap;

    struct ScriptedFetch {
        responses: std::sync::Mutex<Vec<FetchResult>>,
    }

    impl ScriptedFetch {
        fn new(responses: Vec<FetchResult>) -> Self {
            Self { responses: std::sync::Mutex::new(responses) }
        }
    }

    #[async_trait::async_trait]
    impl RawFetch for ScriptedFetch {
        async fn fetch_once(&self, _request: &FetchRequest) -> FetchResult {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            }
        }
    }

    fn json_result(body: serde_json::Value) -> FetchResult {
        FetchResult {
            status: Some(200),
            headers: vec![],
            body: serde_json::to_vec(&body).unwrap(),
            duration: Duration::ZERO,
            transport_error: None,
        }
    }

    fn simple_endpoint(id: &str) -> Endpoint {
        Endpoint {
            id: id.into(),
            path_template: "/things".into(),
            method: HttpMethod::Get,
            headers_template: StdBTreeMap::new(),
            body_template: None,
            topic: "things-topic".into(),
            interval_ms: 0,
            auth_ref: None,
            offset_mode: OffsetMode::SimpleIncrementing,
            initial_offset: None,
            increment: 1,
            record_pointer: "/data".into(),
            next_page_pointer: None,
            chaining_value_pointer: None,
            timestamp_pointer: None,
            timestamp_param: "since".into(),
            timestamp_format: "%Y-%m-%dT%H:%M:%SZ".into(),
            odata_nextlink_field: "@odata.nextLink".into(),
            odata_deltalink_field: "@odata.deltaLink".into(),
            odata_token_mode: ODataTokenMode::FullUrl,
            odata_nextlink_interval_ms: 0,
            odata_deltalink_interval_ms: 60_000,
            snapshot_total_pages_pointer: None,
            snapshot_id_pointer: None,
            connection_timeout_ms: 1_000,
            request_timeout_ms: 1_000,
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig { enabled: false, ..CacheConfig::default() },
            breaker: BreakerConfig::default(),
            retry: RetryConfig { enabled: true, max_attempts: 1, ..RetryConfig::default() },
        }
    }

    fn config(endpoints: Vec<Endpoint>) -> ConnectorConfig {
        ConnectorConfig {
            base_url: "https://example.invalid".into(),
            endpoints,
            chaining: ChainingConfig::default(),
            global_rate_limit: None,
            max_records_per_poll: 1_000,
            max_poll_duration_ms: 5_000,
            template: TemplateConfig::default(),
        }
    }

    fn start_engine(cfg: ConnectorConfig, fetcher: Arc<dyn RawFetch>) -> Arc<Engine> {
        Engine::start(cfg, fetcher, HashMap::new(), Arc::new(connect_core::metrics::NoopMetrics), &BTreeMap::new()).unwrap()
    }

    #[tokio::test]
    async fn polls_simple_counter_endpoint_and_advances_offset() {
        let fetcher = Arc::new(ScriptedFetch::new(vec![json_result(
            serde_json::json!({"data": [{"id": 1}, {"id": 2}]}),
        )]));
        let engine = start_engine(config(vec![simple_endpoint("api1")]), fetcher);

        let batch = engine.poll().await;
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].topic, "things-topic");
        let offset = batch.offsets.get("api1").unwrap();
        assert_eq!(offset["value"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn cursor_endpoint_exhausts_when_next_page_pointer_absent() {
        let mut ep = simple_endpoint("api1");
        ep.offset_mode = OffsetMode::CursorPagination;
        ep.next_page_pointer = Some("/next_cursor".into());
        let fetcher = Arc::new(ScriptedFetch::new(vec![json_result(
            serde_json::json!({"data": [], "next_cursor": null}),
        )]));
        let engine = start_engine(config(vec![ep]), fetcher);

        let batch = engine.poll().await;
        let offset: OffsetState = serde_json::from_value(batch.offsets.get("api1").unwrap().clone()).unwrap();
        assert!(offset.sweep_complete());
    }

    #[tokio::test]
    async fn parent_chaining_enqueues_values_for_child() {
        let mut parent = simple_endpoint("api1");
        parent.chaining_value_pointer = Some("/id".into());
        let mut child = simple_endpoint("api2");
        child.offset_mode = OffsetMode::Chaining;
        child.path_template = "/things/${parent_value}".into();

        let mut cfg = config(vec![parent, child]);
        cfg.chaining = ChainingConfig {
            relations: vec![ChainRelation { child: "api2".into(), parent: "api1".into() }],
            metadata_topic: None,
            continue_on_parent_error: true,
            parallel_processing_enabled: false,
            max_queue_len: 10,
        };

        let fetcher = Arc::new(ScriptedFetch::new(vec![json_result(serde_json::json!({"data": [{"id": "org1"}]}))]));
        let engine = start_engine(cfg, fetcher);

        let batch = engine.poll().await;
        assert_eq!(batch.chain_metadata.len(), 1);
        assert_eq!(batch.chain_metadata[0].parent_id, "api1");
        assert_eq!(batch.chain_metadata[0].child_id, "api2");
    }

    #[tokio::test]
    async fn permanent_failure_opens_breaker_and_next_poll_is_rejected() {
        let mut ep = simple_endpoint("api1");
        ep.breaker.failure_threshold = 1;
        let fetcher = Arc::new(ScriptedFetch::new(vec![FetchResult {
            status: Some(404),
            headers: vec![],
            body: b"{}".to_vec(),
            duration: Duration::ZERO,
            transport_error: None,
        }]));
        let engine = start_engine(config(vec![ep]), fetcher);

        let first = engine.poll().await;
        assert!(first.records.is_empty());

        let second = engine.poll().await;
        assert!(second.records.is_empty());
    }

    #[tokio::test]
    async fn parse_failure_leaves_offset_unchanged() {
        let mut ep = simple_endpoint("api1");
        ep.offset_mode = OffsetMode::CursorPagination;
        ep.next_page_pointer = None;
        let fetcher = Arc::new(ScriptedFetch::new(vec![FetchResult {
            status: Some(200),
            headers: vec![],
            body: b"not json".to_vec(),
            duration: Duration::ZERO,
            transport_error: None,
        }]));
        let engine = start_engine(config(vec![ep]), fetcher);

        let batch = engine.poll().await;
        assert!(batch.records.is_empty());
        assert!(batch.offsets.is_empty());
    }
}
