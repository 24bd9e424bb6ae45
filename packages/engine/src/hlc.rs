use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DbError;

/// Width of the zero-padded physical-time field in the textual encoding.
const PHYSICAL_WIDTH: usize = 15;
/// Width of the zero-padded counter field.
const COUNTER_WIDTH: usize = 9;
/// Node ids are canonical hyphenated UUIDs.
const NODE_ID_WIDTH: usize = 36;

/// Hybrid logical clock value: wall milliseconds, a tie-break counter, and a
/// process-stable node id. Total order is `(physical_ms, counter, node_id)`,
/// and the textual encoding is fixed-width so string order equals that order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Hlc {
    physical_ms: u64,
    counter: u32,
    node_id: String,
}

impl Hlc {
    pub fn new(physical_ms: u64, counter: u32, node_id: impl Into<String>) -> Self {
        Self {
            physical_ms,
            counter,
            node_id: node_id.into(),
        }
    }

    pub fn physical_ms(&self) -> u64 {
        self.physical_ms
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn parse(input: &str) -> Result<Self, DbError> {
        input.parse()
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_ms
            .cmp(&other.physical_ms)
            .then(self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:0physical$}:{:0counter$}:{}",
            self.physical_ms,
            self.counter,
            self.node_id,
            physical = PHYSICAL_WIDTH,
            counter = COUNTER_WIDTH,
        )
    }
}

impl FromStr for Hlc {
    type Err = DbError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let malformed = || DbError::invalid_data(format!("malformed HLC value: {input:?}"));

        let (physical_part, rest) = input.split_once(':').ok_or_else(malformed)?;
        let (counter_part, node_id) = rest.split_once(':').ok_or_else(malformed)?;

        if physical_part.len() != PHYSICAL_WIDTH
            || counter_part.len() != COUNTER_WIDTH
            || node_id.len() != NODE_ID_WIDTH
        {
            return Err(malformed());
        }

        let physical_ms: u64 = physical_part.parse().map_err(|_| malformed())?;
        let counter: u32 = counter_part.parse().map_err(|_| malformed())?;

        Ok(Self {
            physical_ms,
            counter,
            node_id: node_id.to_string(),
        })
    }
}

impl From<Hlc> for String {
    fn from(hlc: Hlc) -> Self {
        hlc.to_string()
    }
}

impl TryFrom<String> for Hlc {
    type Error = DbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Process-wide monotonic HLC source.
///
/// `now()` never goes backwards even if the wall clock does; observing a
/// remote HLC advances the local state past it so subsequent local stamps
/// order after everything already seen.
pub struct HlcClock {
    node_id: String,
    state: Mutex<ClockState>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClockState {
    physical_ms: u64,
    counter: u32,
}

impl HlcClock {
    pub fn new() -> Self {
        Self::with_node_id(Uuid::new_v4().to_string())
    }

    pub fn with_node_id(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(ClockState::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn now(&self) -> Hlc {
        let wall_ms = Utc::now().timestamp_millis().max(0) as u64;
        let mut state = self.state.lock().unwrap();
        if wall_ms > state.physical_ms {
            state.physical_ms = wall_ms;
            state.counter = 0;
        } else {
            state.counter = state.counter.saturating_add(1);
        }
        Hlc::new(state.physical_ms, state.counter, self.node_id.clone())
    }

    /// Folds a remote HLC into the local state so the next `now()` is
    /// strictly greater than both the wall clock and the observed value.
    pub fn observe(&self, remote: &Hlc) {
        let mut state = self.state.lock().unwrap();
        match remote.physical_ms.cmp(&state.physical_ms) {
            Ordering::Greater => {
                state.physical_ms = remote.physical_ms;
                state.counter = remote.counter;
            }
            Ordering::Equal => {
                state.counter = state.counter.max(remote.counter);
            }
            Ordering::Less => {}
        }
    }
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Hlc, HlcClock};

    const NODE_A: &str = "00000000-0000-4000-8000-0000000000aa";
    const NODE_B: &str = "00000000-0000-4000-8000-0000000000bb";

    #[test]
    fn format_parse_round_trip() {
        let hlc = Hlc::new(1_717_171_717_000, 42, NODE_A);
        let text = hlc.to_string();
        let parsed = Hlc::parse(&text).expect("round trip should parse");
        assert_eq!(parsed, hlc);
    }

    #[test]
    fn string_order_matches_logical_order() {
        let earlier = Hlc::new(1000, 5, NODE_B);
        let later_physical = Hlc::new(1001, 0, NODE_A);
        let later_counter = Hlc::new(1000, 6, NODE_A);

        assert!(earlier < later_physical);
        assert!(earlier < later_counter);
        assert!(earlier.to_string() < later_physical.to_string());
        assert!(earlier.to_string() < later_counter.to_string());
    }

    #[test]
    fn ties_break_by_node_id() {
        let a = Hlc::new(1000, 0, NODE_A);
        let b = Hlc::new(1000, 0, NODE_B);
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(Hlc::parse("not-an-hlc").is_err());
        assert!(Hlc::parse("123:0:node").is_err());
        // Counter field too narrow.
        assert!(Hlc::parse(&format!("{:015}:{:08}:{NODE_A}", 1, 1)).is_err());
    }

    #[test]
    fn clock_is_monotonic_under_repeated_reads() {
        let clock = HlcClock::with_node_id(NODE_A);
        let mut previous = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn observe_advances_past_remote_values() {
        let clock = HlcClock::with_node_id(NODE_A);
        let remote = Hlc::new(u64::MAX / 2, 7, NODE_B);
        clock.observe(&remote);
        let local = clock.now();
        assert!(local > remote);
        assert_eq!(local.node_id(), NODE_A);
    }
}
