use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OData paging phase: follow `nextLink` pages, then settle into the
/// long-lived `deltaLink` incremental phase (`spec.md` §4.3, scenario 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ODataPhase {
    NextLink,
    DeltaLink,
}

/// Per-endpoint pagination/offset state. The tag is fixed at
/// configuration time (`OffsetMode`); transitions never move between
/// variants — only the payload within a variant changes.
///
/// This type round-trips through the host framework's offset store as
/// JSON (`serde`), satisfying the round-trip law in `spec.md` §8:
/// `deserialize(serialize(s)) == s`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OffsetState {
    SimpleCounter {
        value: i64,
    },
    Cursor {
        token: Option<String>,
        exhausted: bool,
    },
    ODataLink {
        current_link: Option<String>,
        phase: ODataPhase,
        delta_token: Option<String>,
    },
    Timestamp {
        watermark: DateTime<Utc>,
    },
    Chaining {
        parent_values: VecDeque<String>,
        emitted_values: BTreeSet<String>,
    },
    Snapshot {
        page: u64,
        total_pages: Option<u64>,
        snapshot_id: Option<String>,
    },
}

impl OffsetState {
    pub fn initial_simple_counter(initial: Option<&str>) -> Self {
        let value = initial.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
        OffsetState::SimpleCounter { value }
    }

    pub fn initial_cursor(initial: Option<&str>) -> Self {
        OffsetState::Cursor {
            token: initial.map(str::to_string),
            exhausted: false,
        }
    }

    pub fn initial_odata() -> Self {
        OffsetState::ODataLink {
            current_link: None,
            phase: ODataPhase::NextLink,
            delta_token: None,
        }
    }

    pub fn initial_timestamp(initial: Option<&str>) -> Self {
        let watermark = initial
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap());
        OffsetState::Timestamp { watermark }
    }

    pub fn initial_chaining() -> Self {
        OffsetState::Chaining {
            parent_values: VecDeque::new(),
            emitted_values: BTreeSet::new(),
        }
    }

    pub fn initial_snapshot() -> Self {
        OffsetState::Snapshot {
            page: 1,
            total_pages: None,
            snapshot_id: None,
        }
    }

    /// Whether the current sweep has completed, per the per-mode rule
    /// in `spec.md` §4.3's "End of sweep" column. `SimpleCounter` and
    /// the OData delta phase never end (continuous polling).
    pub fn sweep_complete(&self) -> bool {
        match self {
            OffsetState::SimpleCounter { .. } => false,
            OffsetState::Cursor { exhausted, .. } => *exhausted,
            OffsetState::ODataLink { phase, current_link, .. } => {
                *phase == ODataPhase::NextLink && current_link.is_none()
            }
            OffsetState::Timestamp { .. } => true,
            OffsetState::Chaining { parent_values, .. } => parent_values.is_empty(),
            OffsetState::Snapshot { page, total_pages, .. } => {
                matches!(total_pages, Some(total) if *page > *total)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_counter_round_trip() {
        let s = OffsetState::SimpleCounter { value: 42 };
        let json = serde_json::to_string(&s).unwrap();
        let back: OffsetState = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn cursor_round_trip() {
        let s = OffsetState::Cursor {
            token: Some("c1".into()),
            exhausted: false,
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: OffsetState = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn odata_round_trip() {
        let s = OffsetState::ODataLink {
            current_link: Some("https://x/y?$skiptoken=abc".into()),
            phase: ODataPhase::DeltaLink,
            delta_token: Some("tok".into()),
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: OffsetState = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn sweep_complete_rules() {
        assert!(!OffsetState::SimpleCounter { value: 0 }.sweep_complete());
        assert!(OffsetState::Cursor { token: None, exhausted: true }.sweep_complete());
        assert!(!OffsetState::Cursor { token: Some("x".into()), exhausted: false }.sweep_complete());
        assert!(OffsetState::Snapshot { page: 4, total_pages: Some(3), snapshot_id: None }.sweep_complete());
        assert!(!OffsetState::Snapshot { page: 2, total_pages: Some(3), snapshot_id: None }.sweep_complete());
        assert!(OffsetState::Chaining { parent_values: VecDeque::new(), emitted_values: Default::default() }.sweep_complete());
    }
}
