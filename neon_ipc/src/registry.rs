//! Bounded table of processes authorized to use the broker's channels.
//!
//! Entries are keyed by process id and kept in insertion order. A pid that is
//! already present is always granted and only has its last-activity time
//! refreshed; the name and level it first registered with are kept. Nothing
//! removes an entry when its process exits, so under the default
//! [`EvictionPolicy::Deny`] a long-running broker can fill the table with
//! stale entries and start denying every new process.

use shared_utils::config::{EvictionPolicy, RegistryConfig, SecurityLevel};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Longest stored process name in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// One authorized process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessAuth {
    pub pid: i32,
    pub name: String,
    pub security: SecurityLevel,
    pub last_activity: SystemTime,
}

/// Outcome of an authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Granted,
    Denied,
}

impl AuthDecision {
    pub fn is_granted(self) -> bool {
        self == AuthDecision::Granted
    }
}

/// Fixed-capacity, insertion-ordered registry.
#[derive(Debug, Clone)]
pub struct AuthorizationRegistry {
    capacity: usize,
    policy: EvictionPolicy,
    entries: Vec<ProcessAuth>,
}

impl AuthorizationRegistry {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            capacity,
            policy,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.capacity, config.eviction)
    }

    /// Authorize `pid`, stamping it with the current time.
    pub fn authorize(&mut self, pid: i32, name: &str, level: SecurityLevel) -> AuthDecision {
        self.authorize_at(pid, name, level, SystemTime::now())
    }

    /// Authorize `pid` as of `now`.
    pub fn authorize_at(
        &mut self,
        pid: i32,
        name: &str,
        level: SecurityLevel,
        now: SystemTime,
    ) -> AuthDecision {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.pid == pid) {
            entry.last_activity = now;
            debug!(pid, name = %entry.name, "Refreshed authorized process");
            return AuthDecision::Granted;
        }

        let entry = ProcessAuth {
            pid,
            name: truncate_name(name),
            security: level,
            last_activity: now,
        };

        if self.entries.len() < self.capacity {
            info!(pid, name = %entry.name, %level, "Authorized new process");
            self.entries.push(entry);
            return AuthDecision::Granted;
        }

        match self.policy {
            EvictionPolicy::Deny => {
                warn!(
                    pid,
                    capacity = self.capacity,
                    "Authorization registry full, denying process"
                );
                AuthDecision::Denied
            }
            EvictionPolicy::OldestActivity => {
                // min_by_key keeps the first of equal keys, i.e. the earliest inserted
                let oldest = self
                    .entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.last_activity)
                    .map(|(idx, _)| idx);
                if let Some(idx) = oldest {
                    let evicted = self.entries.remove(idx);
                    info!(
                        evicted_pid = evicted.pid,
                        pid,
                        "Evicted least recently active process"
                    );
                }
                self.entries.push(entry);
                AuthDecision::Granted
            }
        }
    }

    pub fn get(&self, pid: i32) -> Option<&ProcessAuth> {
        self.entries.iter().find(|e| e.pid == pid)
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[ProcessAuth] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }
}

pub(crate) fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn registry(capacity: usize) -> AuthorizationRegistry {
        AuthorizationRegistry::new(capacity, EvictionPolicy::Deny)
    }

    #[test]
    fn test_fill_deny_and_reauthorize() {
        let mut reg = registry(10);
        for pid in 1000..1010 {
            assert_eq!(
                reg.authorize(pid, &format!("proc-{pid}"), SecurityLevel::High),
                AuthDecision::Granted
            );
        }
        assert_eq!(reg.len(), 10);
        assert!(reg.is_full());

        assert_eq!(
            reg.authorize(2000, "late", SecurityLevel::High),
            AuthDecision::Denied
        );
        assert_eq!(reg.len(), 10);
        assert!(reg.get(2000).is_none());

        assert_eq!(
            reg.authorize(1002, "proc-1002", SecurityLevel::High),
            AuthDecision::Granted
        );
        assert_eq!(reg.len(), 10);
    }

    #[test]
    fn test_first_registration_wins() {
        let mut reg = registry(4);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = t0 + Duration::from_secs(5);

        reg.authorize_at(7, "original", SecurityLevel::Low, t0);
        reg.authorize_at(7, "impostor", SecurityLevel::High, t1);

        let entry = reg.get(7).unwrap();
        assert_eq!(entry.name, "original");
        assert_eq!(entry.security, SecurityLevel::Low);
        assert_eq!(entry.last_activity, t1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_name_truncation() {
        let mut reg = registry(2);
        let long = "x".repeat(64);
        reg.authorize(1, &long, SecurityLevel::Medium);
        assert_eq!(reg.get(1).unwrap().name.len(), MAX_NAME_LEN);

        // 30 ASCII bytes followed by a two-byte char straddling the limit
        let straddling = format!("{}é", "a".repeat(30));
        reg.authorize(2, &straddling, SecurityLevel::Medium);
        assert_eq!(reg.get(2).unwrap().name, "a".repeat(30));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut reg = registry(3);
        for pid in [30, 10, 20] {
            reg.authorize(pid, "p", SecurityLevel::High);
        }
        let pids: Vec<i32> = reg.entries().iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![30, 10, 20]);
    }

    #[test]
    fn test_oldest_activity_eviction() {
        let mut reg = AuthorizationRegistry::new(3, EvictionPolicy::OldestActivity);
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        reg.authorize_at(1, "a", SecurityLevel::High, base);
        reg.authorize_at(2, "b", SecurityLevel::High, base + Duration::from_secs(1));
        reg.authorize_at(3, "c", SecurityLevel::High, base + Duration::from_secs(2));
        // pid 1 becomes the most recently active
        reg.authorize_at(1, "a", SecurityLevel::High, base + Duration::from_secs(3));

        let decision = reg.authorize_at(4, "d", SecurityLevel::High, base + Duration::from_secs(4));
        assert_eq!(decision, AuthDecision::Granted);
        assert_eq!(reg.len(), 3);
        assert!(reg.get(2).is_none(), "pid 2 had the oldest activity");
        let pids: Vec<i32> = reg.entries().iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![1, 3, 4]);
    }

    #[test]
    fn test_eviction_tie_prefers_earliest_inserted() {
        let mut reg = AuthorizationRegistry::new(2, EvictionPolicy::OldestActivity);
        let t = SystemTime::UNIX_EPOCH;
        reg.authorize_at(1, "a", SecurityLevel::High, t);
        reg.authorize_at(2, "b", SecurityLevel::High, t);
        reg.authorize_at(3, "c", SecurityLevel::High, t);
        assert!(reg.get(1).is_none());
        assert!(reg.get(2).is_some());
    }

    proptest! {
        #[test]
        fn size_never_exceeds_capacity(
            capacity in 1usize..16,
            pids in proptest::collection::vec(0i32..40, 0..200),
        ) {
            let mut reg = registry(capacity);
            for pid in pids {
                let before = reg.len();
                let known = reg.get(pid).is_some();
                let decision = reg.authorize(pid, "p", SecurityLevel::High);
                prop_assert!(reg.len() <= capacity);
                if known {
                    prop_assert_eq!(decision, AuthDecision::Granted);
                    prop_assert_eq!(reg.len(), before);
                } else if before < capacity {
                    prop_assert_eq!(decision, AuthDecision::Granted);
                    prop_assert_eq!(reg.len(), before + 1);
                } else {
                    prop_assert_eq!(decision, AuthDecision::Denied);
                    prop_assert_eq!(reg.len(), before);
                }
            }
        }
    }
}
