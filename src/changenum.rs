// Change numbers (CSNs) and per-origin replication state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A change number: globally unique, totally ordered identifier of one
/// update. Ordering is (time_ms, seqnum, server_id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeNumber {
    pub time_ms: u64,
    pub seqnum: u32,
    pub server_id: u16,
}

impl ChangeNumber {
    pub fn new(time_ms: u64, seqnum: u32, server_id: u16) -> Self {
        Self {
            time_ms,
            seqnum,
            server_id,
        }
    }

    /// Sortable fixed-width key: 16 hex chars of time, 4 of server id, 8 of
    /// seqnum. Lexicographic byte order equals change-number order for
    /// records of the same origin, and groups keys by time across origins.
    pub fn to_key(&self) -> [u8; 28] {
        let s = format!(
            "{:016x}{:04x}{:08x}",
            self.time_ms, self.server_id, self.seqnum
        );
        let mut key = [0u8; 28];
        key.copy_from_slice(s.as_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 28 {
            return None;
        }
        let s = std::str::from_utf8(key).ok()?;
        let time_ms = u64::from_str_radix(&s[0..16], 16).ok()?;
        let server_id = u16::from_str_radix(&s[16..20], 16).ok()?;
        let seqnum = u32::from_str_radix(&s[20..28], 16).ok()?;
        Some(Self {
            time_ms,
            seqnum,
            server_id,
        })
    }

    /// True when this change happened before `other` in the total order.
    pub fn older_than(&self, other: &ChangeNumber) -> bool {
        self < other
    }
}

impl Ord for ChangeNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_ms
            .cmp(&other.time_ms)
            .then(self.seqnum.cmp(&other.seqnum))
            .then(self.server_id.cmp(&other.server_id))
    }
}

impl PartialOrd for ChangeNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChangeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:08x}",
            self.time_ms, self.server_id, self.seqnum
        )
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generates strictly increasing change numbers for one origin server.
/// Survives clock steps: if the wall clock moves backwards, generation keeps
/// using the last seen time and bumps the sequence number instead.
pub struct CsnGenerator {
    server_id: u16,
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    last_time_ms: u64,
    seqnum: u32,
}

impl CsnGenerator {
    pub fn new(server_id: u16) -> Self {
        Self {
            server_id,
            state: Mutex::new(GeneratorState {
                last_time_ms: now_ms(),
                seqnum: 0,
            }),
        }
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    pub fn next(&self) -> ChangeNumber {
        let mut state = self.state.lock().unwrap();
        let now = now_ms();
        if now > state.last_time_ms {
            state.last_time_ms = now;
            state.seqnum = 0;
        } else {
            // Clock stalled or stepped back: keep the old time, bump seqnum.
            // Seqnum overflow forces the time forward one millisecond.
            match state.seqnum.checked_add(1) {
                Some(n) => state.seqnum = n,
                None => {
                    state.last_time_ms += 1;
                    state.seqnum = 0;
                }
            }
        }
        ChangeNumber::new(state.last_time_ms, state.seqnum, self.server_id)
    }

    /// Make sure future change numbers sort after one received from a peer
    /// whose clock runs ahead of ours.
    pub fn adjust(&self, seen: &ChangeNumber) {
        let mut state = self.state.lock().unwrap();
        if seen.time_ms > state.last_time_ms
            || (seen.time_ms == state.last_time_ms && seen.seqnum > state.seqnum)
        {
            state.last_time_ms = seen.time_ms;
            state.seqnum = seen.seqnum;
        }
    }
}

/// Newest change number seen per origin server. Exchanged in the replication
/// handshake and used for the trim watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    newest: HashMap<u16, ChangeNumber>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cn` if it is newer than what we have for its origin.
    /// Returns true when the state advanced.
    pub fn update(&mut self, cn: ChangeNumber) -> bool {
        match self.newest.get(&cn.server_id) {
            Some(existing) if *existing >= cn => false,
            _ => {
                self.newest.insert(cn.server_id, cn);
                true
            }
        }
    }

    pub fn newest_for(&self, server_id: u16) -> Option<ChangeNumber> {
        self.newest.get(&server_id).copied()
    }

    pub fn origins(&self) -> impl Iterator<Item = u16> + '_ {
        self.newest.keys().copied()
    }

    /// True when this state covers `cn`: a server with this state has
    /// already seen that change.
    pub fn covers(&self, cn: &ChangeNumber) -> bool {
        self.newest_for(cn.server_id).is_some_and(|n| n >= *cn)
    }

    pub fn is_empty(&self) -> bool {
        self.newest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_number_ordering() {
        let a = ChangeNumber::new(1000, 0, 1);
        let b = ChangeNumber::new(1000, 1, 1);
        let c = ChangeNumber::new(1001, 0, 1);
        let d = ChangeNumber::new(1000, 0, 2);
        assert!(a < b);
        assert!(b < c);
        assert!(a < d); // same time+seq, higher server id
        assert!(a.older_than(&c));
    }

    #[test]
    fn test_key_roundtrip_and_sort_order() {
        let cns = [
            ChangeNumber::new(1000, 0, 1),
            ChangeNumber::new(1000, 5, 1),
            ChangeNumber::new(2000, 0, 1),
            ChangeNumber::new(u64::from(u32::MAX) + 7, 3, 42),
        ];
        for cn in &cns {
            assert_eq!(ChangeNumber::from_key(&cn.to_key()), Some(*cn));
        }
        // Byte order of keys follows change-number order for one origin.
        assert!(cns[0].to_key() < cns[1].to_key());
        assert!(cns[1].to_key() < cns[2].to_key());
    }

    #[test]
    fn test_from_key_rejects_bad_input() {
        assert_eq!(ChangeNumber::from_key(b"short"), None);
        assert_eq!(ChangeNumber::from_key(&[0xFFu8; 28]), None);
    }

    #[test]
    fn test_generator_strictly_increasing() {
        let generator = CsnGenerator::new(7);
        let mut previous = generator.next();
        for _ in 0..10_000 {
            let next = generator.next();
            assert!(previous < next, "{} !< {}", previous, next);
            assert_eq!(next.server_id, 7);
            previous = next;
        }
    }

    #[test]
    fn test_generator_adjusts_to_peer_clock() {
        let generator = CsnGenerator::new(1);
        let future = ChangeNumber::new(now_in_far_future(), 9, 2);
        generator.adjust(&future);
        let next = generator.next();
        assert!(next > future);
    }

    fn now_in_far_future() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
            + 3_600_000
    }

    #[test]
    fn test_server_state_update_and_covers() {
        let mut state = ServerState::new();
        let older = ChangeNumber::new(1000, 0, 1);
        let newer = ChangeNumber::new(2000, 0, 1);

        assert!(state.update(older));
        assert!(state.update(newer));
        assert!(!state.update(older)); // stale update ignored

        assert!(state.covers(&older));
        assert!(state.covers(&newer));
        assert!(!state.covers(&ChangeNumber::new(3000, 0, 1)));
        // Unknown origin is never covered.
        assert!(!state.covers(&ChangeNumber::new(1, 0, 9)));
    }
}
