//! Offset / pagination state machine (`spec.md` §4.3): URL formation
//! from the current `OffsetState` and the pure state transition after
//! a fetch. JSON extraction itself (reading `next_page_pointer`,
//! `@odata.nextLink`, record timestamps, ...) is the caller's job via
//! `connect_core::pointer` — this crate only knows what to do with the
//! values once extracted, so it stays testable without any JSON at all.

use chrono::{DateTime, Utc};

use connect_core::error::ConnectError;
use connect_core::model::{Endpoint, ODataTokenMode};
use connect_core::offset_state::{ODataPhase, OffsetState};

/// What the caller needs to assemble the next HTTP request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NextRequest {
    /// Named values to merge into the `TemplateContext` before
    /// substituting `path_template`.
    pub vars: Vec<(String, String)>,
    /// When set, use this URL verbatim instead of substituting
    /// `path_template` (OData `FullUrl` link-following).
    pub url_override: Option<String>,
    /// Query parameters appended after substitution/override (the
    /// timestamp watermark param).
    pub extra_query: Vec<(String, String)>,
}

impl NextRequest {
    fn vars(vars: Vec<(&str, String)>) -> Self {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            url_override: None,
            extra_query: Vec::new(),
        }
    }
}

/// The value extracted from a successful response that drives the
/// next state transition. Produced by the caller after it has parsed
/// the response with `connect_core::pointer`.
#[derive(Debug, Clone)]
pub enum UpdateSignal {
    SimpleCounter,
    Cursor { next_token: Option<String> },
    ODataLink { next_link: Option<String>, delta_link: Option<String> },
    Timestamp { max_record_timestamp: Option<DateTime<Utc>> },
    Chaining,
    Snapshot { total_pages: Option<u64>, snapshot_id: Option<String> },
}

/// Compute the next request's URL ingredients from the current state.
/// Returns `Ok(None)` only for a `Chaining` child whose parent queue is
/// currently empty — nothing to dispatch until the parent enqueues a
/// value.
pub fn next_request(endpoint: &Endpoint, state: &OffsetState) -> Result<Option<NextRequest>, ConnectError> {
    match state {
        OffsetState::SimpleCounter { value } => Ok(Some(NextRequest::vars(vec![("offset", value.to_string())]))),

        OffsetState::Cursor { token, .. } => {
            let cursor = token.clone().unwrap_or_else(|| "start".to_string());
            Ok(Some(NextRequest::vars(vec![("cursor", cursor)])))
        }

        OffsetState::ODataLink { current_link, phase, delta_token } => match current_link {
            None => {
                let seed = endpoint.initial_offset.clone().unwrap_or_default();
                Ok(Some(NextRequest::vars(vec![("odata_query", seed)])))
            }
            Some(link) => match phase {
                ODataPhase::DeltaLink if endpoint.odata_token_mode == ODataTokenMode::TokenOnly => {
                    let token = delta_token.clone().unwrap_or_default();
                    Ok(Some(NextRequest::vars(vec![("odata_token", token)])))
                }
                _ => match endpoint.odata_token_mode {
                    ODataTokenMode::FullUrl => Ok(Some(NextRequest {
                        vars: Vec::new(),
                        url_override: Some(link.clone()),
                        extra_query: Vec::new(),
                    })),
                    ODataTokenMode::TokenOnly => {
                        let param = match phase {
                            ODataPhase::DeltaLink => "$deltatoken",
                            ODataPhase::NextLink => "$skiptoken",
                        };
                        let token = extract_query_param(link, param).ok_or_else(|| ConnectError::Parse {
                            endpoint_id: endpoint.id.clone(),
                            message: format!("{param} missing from odata link"),
                        })?;
                        Ok(Some(NextRequest::vars(vec![("odata_token", token)])))
                    }
                },
            },
        },

        OffsetState::Timestamp { watermark } => {
            let formatted = watermark.format(&endpoint.timestamp_format).to_string();
            Ok(Some(NextRequest {
                vars: Vec::new(),
                url_override: None,
                extra_query: vec![(endpoint.timestamp_param.clone(), formatted)],
            }))
        }

        OffsetState::Chaining { parent_values, .. } => match parent_values.front() {
            None => Ok(None),
            Some(value) => Ok(Some(NextRequest::vars(vec![("parent_value", value.clone())]))),
        },

        OffsetState::Snapshot { page, .. } => Ok(Some(NextRequest::vars(vec![("page", page.to_string())]))),
    }
}

fn extract_query_param(url: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed.query_pairs().find(|(k, _)| k == name).map(|(_, v)| v.into_owned())
}

/// Apply the post-fetch transition. Only called after a successful
/// fetch whose pagination signal was itself parsed successfully — a
/// caller that failed to parse the signal must leave the prior state
/// untouched rather than call this (`spec.md` §8 offset-advance law).
pub fn advance(state: &OffsetState, signal: UpdateSignal, increment: i64) -> OffsetState {
    match (state, signal) {
        (OffsetState::SimpleCounter { value }, UpdateSignal::SimpleCounter) => {
            OffsetState::SimpleCounter { value: value + increment }
        }

        (OffsetState::Cursor { .. }, UpdateSignal::Cursor { next_token }) => match next_token {
            Some(token) => OffsetState::Cursor { token: Some(token), exhausted: false },
            None => OffsetState::Cursor { token: None, exhausted: true },
        },

        (OffsetState::ODataLink { delta_token, .. }, UpdateSignal::ODataLink { next_link, delta_link }) => {
            if let Some(delta) = delta_link {
                OffsetState::ODataLink {
                    current_link: Some(delta.clone()),
                    phase: ODataPhase::DeltaLink,
                    delta_token: extract_query_param(&delta, "$deltatoken").or_else(|| delta_token.clone()),
                }
            } else {
                OffsetState::ODataLink {
                    current_link: next_link,
                    phase: ODataPhase::NextLink,
                    delta_token: delta_token.clone(),
                }
            }
        }

        (OffsetState::Timestamp { watermark }, UpdateSignal::Timestamp { max_record_timestamp }) => {
            let next = match max_record_timestamp {
                Some(candidate) if candidate > *watermark => candidate,
                _ => *watermark,
            };
            OffsetState::Timestamp { watermark: next }
        }

        (OffsetState::Chaining { parent_values, emitted_values }, UpdateSignal::Chaining) => {
            let mut values = parent_values.clone();
            let mut emitted = emitted_values.clone();
            if let Some(front) = values.pop_front() {
                emitted.insert(front);
            }
            OffsetState::Chaining { parent_values: values, emitted_values: emitted }
        }

        (OffsetState::Snapshot { page, snapshot_id, .. }, UpdateSignal::Snapshot { total_pages, snapshot_id: new_id }) => {
            OffsetState::Snapshot {
                page: page + 1,
                total_pages,
                snapshot_id: snapshot_id.clone().or(new_id),
            }
        }

        (unchanged, _) => unchanged.clone(),
    }
}

/// Enqueue a value extracted from a parent response into a child's
/// `Chaining` state (called by the chaining engine, `spec.md` §4.4).
pub fn enqueue_chain_value(state: &OffsetState, value: String) -> OffsetState {
    match state {
        OffsetState::Chaining { parent_values, emitted_values } => {
            let mut values = parent_values.clone();
            values.push_back(value);
            OffsetState::Chaining { parent_values: values, emitted_values: emitted_values.clone() }
        }
        other => other.clone(),
    }
}
