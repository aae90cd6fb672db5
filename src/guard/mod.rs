//! Notification Guard: per-recipient, per-topic admission control.
//!
//! Before a notification is produced, callers ask the guard whether the
//! recipient may receive another message about the same topic. A
//! [`GuardPolicy`] bounds sends to `max_count` per sliding `window`, and
//! additionally spaces them at least `window / max_count` apart so a burst
//! cannot spend the whole allowance at once.
//!
//! State is process-local and only shrinks through explicit eviction
//! (`clear_user`, `clear`, `cleanup_old_entries`).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// How often a recipient may be notified about one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardPolicy {
    pub window: TimeDelta,
    pub max_count: u32,
}

impl GuardPolicy {
    /// At most `max_count` sends per `window`.
    pub fn new(window: Duration, max_count: u32) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            max_count,
        }
    }

    /// Minimum gap between two consecutive sends.
    pub fn spacing(&self) -> TimeDelta {
        if self.max_count == 0 {
            return self.window;
        }
        self.window / i32::try_from(self.max_count).unwrap_or(i32::MAX)
    }

    fn history_cap(&self) -> usize {
        (self.max_count as usize).saturating_mul(3).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GuardKey {
    recipient: String,
    topic: String,
    window_ms: i64,
}

impl GuardKey {
    fn new(recipient: &str, topic: &str, policy: &GuardPolicy) -> Self {
        Self {
            recipient: recipient.to_string(),
            topic: topic.to_string(),
            window_ms: policy.window.num_milliseconds(),
        }
    }

    fn window(&self) -> TimeDelta {
        TimeDelta::try_milliseconds(self.window_ms).unwrap_or(TimeDelta::MAX)
    }
}

/// Sliding-window admission control keyed by (recipient, topic, window).
#[derive(Debug, Default)]
pub struct NotificationGuard {
    history: Mutex<HashMap<GuardKey, VecDeque<DateTime<Utc>>>>,
}

/// Adds saturating at the end of the representable range.
fn later_by(at: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn prune(entries: &mut VecDeque<DateTime<Utc>>, window: TimeDelta, now: DateTime<Utc>) {
    // A window reaching past the start of time expires nothing.
    let Some(cutoff) = now.checked_sub_signed(window) else {
        return;
    };
    while entries.front().is_some_and(|ts| *ts <= cutoff) {
        entries.pop_front();
    }
}

impl NotificationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<GuardKey, VecDeque<DateTime<Utc>>>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a send is allowed now. Prunes expired history.
    pub fn check(&self, recipient: &str, topic: &str, policy: &GuardPolicy) -> bool {
        self.check_at(recipient, topic, policy, Utc::now())
    }

    pub fn check_at(&self, recipient: &str, topic: &str, policy: &GuardPolicy, now: DateTime<Utc>) -> bool {
        if policy.max_count == 0 {
            return false;
        }

        let key = GuardKey::new(recipient, topic, policy);
        let mut history = self.lock();
        let Some(entries) = history.get_mut(&key) else {
            return true;
        };
        prune(entries, policy.window, now);

        if entries.len() >= policy.max_count as usize {
            tracing::debug!(recipient, topic, count = entries.len(), "Guard denied: window full");
            return false;
        }
        match entries.back() {
            Some(last) if now - *last < policy.spacing() => {
                tracing::debug!(recipient, topic, "Guard denied: too soon after last send");
                false
            }
            _ => true,
        }
    }

    /// Record a send at the current time.
    pub fn record(&self, recipient: &str, topic: &str, policy: &GuardPolicy) {
        self.record_at(recipient, topic, policy, Utc::now());
    }

    pub fn record_at(&self, recipient: &str, topic: &str, policy: &GuardPolicy, now: DateTime<Utc>) {
        let key = GuardKey::new(recipient, topic, policy);
        let mut history = self.lock();
        let entries = history.entry(key).or_default();
        entries.push_back(now);

        let cap = policy.history_cap();
        while entries.len() > cap {
            entries.pop_front();
        }
    }

    /// Earliest time a send would pass `check`. Never earlier than now.
    pub fn next_allowed_time(&self, recipient: &str, topic: &str, policy: &GuardPolicy) -> DateTime<Utc> {
        self.next_allowed_time_at(recipient, topic, policy, Utc::now())
    }

    pub fn next_allowed_time_at(
        &self,
        recipient: &str,
        topic: &str,
        policy: &GuardPolicy,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if policy.max_count == 0 {
            return later_by(now, policy.window);
        }

        let key = GuardKey::new(recipient, topic, policy);
        let history = self.lock();
        let Some(entries) = history.get(&key) else {
            return now;
        };

        let cutoff = now.checked_sub_signed(policy.window);
        let live: Vec<DateTime<Utc>> = entries
            .iter()
            .copied()
            .filter(|ts| cutoff.is_none_or(|cutoff| *ts > cutoff))
            .collect();
        let Some(last) = live.last().copied() else {
            return now;
        };

        let mut next = later_by(last, policy.spacing());
        if live.len() >= policy.max_count as usize {
            // The slot frees once enough of the oldest entries leave the window.
            let excess = live.len() + 1 - policy.max_count as usize;
            let oldest_blocking = live[excess - 1];
            next = next.max(later_by(oldest_blocking, policy.window));
        }
        next.max(now)
    }

    /// How long until a send would pass `check`. Zero when allowed now.
    pub fn time_until_next_allowed(&self, recipient: &str, topic: &str, policy: &GuardPolicy) -> Duration {
        self.time_until_next_allowed_at(recipient, topic, policy, Utc::now())
    }

    pub fn time_until_next_allowed_at(
        &self,
        recipient: &str,
        topic: &str,
        policy: &GuardPolicy,
        now: DateTime<Utc>,
    ) -> Duration {
        (self.next_allowed_time_at(recipient, topic, policy, now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Forget every topic for one recipient.
    pub fn clear_user(&self, recipient: &str) {
        self.lock().retain(|key, _| key.recipient != recipient);
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Drop expired timestamps and empty keys.
    pub fn cleanup_old_entries(&self) {
        self.cleanup_old_entries_at(Utc::now());
    }

    pub fn cleanup_old_entries_at(&self, now: DateTime<Utc>) {
        let mut history = self.lock();
        let before = history.len();
        history.retain(|key, entries| {
            prune(entries, key.window(), now);
            !entries.is_empty()
        });
        let removed = before - history.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = history.len(), "Guard cleanup");
        }
    }

    /// Number of (recipient, topic, window) keys currently held.
    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }
}

/// Human-readable wait for "try again in ..." replies: `1h 5m`, `3m`, `12s`.
///
/// Partial seconds round up so a pending wait never reads as `0s`.
pub fn describe_wait(wait: Duration) -> String {
    let mut secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs += 1;
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()
    }

    fn five_per_five_minutes() -> GuardPolicy {
        GuardPolicy::new(Duration::from_secs(300), 5)
    }

    #[test]
    fn test_policy_spacing() {
        assert_eq!(five_per_five_minutes().spacing(), TimeDelta::seconds(60));
        assert_eq!(GuardPolicy::new(Duration::from_secs(3600), 1).spacing(), TimeDelta::hours(1));
    }

    #[test]
    fn test_first_send_allowed() {
        let guard = NotificationGuard::new();
        assert!(guard.check_at("42", "btc", &five_per_five_minutes(), t0()));
    }

    #[test]
    fn test_zero_max_count_always_denies() {
        let guard = NotificationGuard::new();
        let policy = GuardPolicy::new(Duration::from_secs(60), 0);
        assert!(!guard.check_at("42", "btc", &policy, t0()));
    }

    #[test]
    fn test_zero_max_count_next_allowed_after_record() {
        let guard = NotificationGuard::new();
        let policy = GuardPolicy::new(Duration::from_secs(60), 0);
        guard.record_at("42", "btc", &policy, t0());

        assert_eq!(
            guard.next_allowed_time_at("42", "btc", &policy, t0()),
            t0() + TimeDelta::seconds(60)
        );
        assert_eq!(
            guard.time_until_next_allowed_at("42", "btc", &policy, t0()),
            Duration::from_secs(60)
        );
        assert!(!guard.check_at("42", "btc", &policy, t0()));
    }

    #[test]
    fn test_unbounded_window_never_expires() {
        let guard = NotificationGuard::new();
        let policy = GuardPolicy::new(Duration::MAX, 2);
        assert_eq!(policy.window, TimeDelta::MAX);

        guard.record_at("42", "btc", &policy, t0());
        assert!(!guard.check_at("42", "btc", &policy, t0() + TimeDelta::days(365)));
        assert_eq!(
            guard.next_allowed_time_at("42", "btc", &policy, t0()),
            DateTime::<Utc>::MAX_UTC
        );

        guard.cleanup_old_entries_at(t0() + TimeDelta::days(365));
        assert_eq!(guard.tracked_keys(), 1);
    }

    #[test]
    fn test_back_to_back_denied_by_spacing() {
        let guard = NotificationGuard::new();
        let policy = five_per_five_minutes();
        assert!(guard.check_at("42", "btc", &policy, t0()));
        guard.record_at("42", "btc", &policy, t0());

        assert!(!guard.check_at("42", "btc", &policy, t0() + TimeDelta::seconds(1)));
        assert!(!guard.check_at("42", "btc", &policy, t0() + TimeDelta::seconds(59)));
        assert!(guard.check_at("42", "btc", &policy, t0() + TimeDelta::seconds(60)));
    }

    #[test]
    fn test_window_fills_then_frees() {
        let guard = NotificationGuard::new();
        let policy = five_per_five_minutes();

        for i in 0..5 {
            let now = t0() + TimeDelta::seconds(60 * i);
            assert!(guard.check_at("42", "btc", &policy, now), "send {} should pass", i);
            guard.record_at("42", "btc", &policy, now);
        }

        // Spacing satisfied but the window holds five sends.
        assert!(!guard.check_at("42", "btc", &policy, t0() + TimeDelta::seconds(299)));
        // Window has elapsed since the first send.
        assert!(guard.check_at("42", "btc", &policy, t0() + TimeDelta::seconds(300)));
    }

    #[test]
    fn test_topics_and_recipients_are_independent() {
        let guard = NotificationGuard::new();
        let policy = five_per_five_minutes();
        guard.record_at("42", "btc", &policy, t0());

        assert!(guard.check_at("42", "eth", &policy, t0()));
        assert!(guard.check_at("7", "btc", &policy, t0()));
        assert!(!guard.check_at("42", "btc", &policy, t0()));
    }

    #[test]
    fn test_different_windows_are_separate_keys() {
        let guard = NotificationGuard::new();
        let hourly = GuardPolicy::new(Duration::from_secs(3600), 1);
        let minutely = GuardPolicy::new(Duration::from_secs(60), 1);
        guard.record_at("42", "btc", &hourly, t0());

        assert!(guard.check_at("42", "btc", &minutely, t0()));
        assert_eq!(guard.tracked_keys(), 1);
    }

    #[test]
    fn test_record_caps_history() {
        let guard = NotificationGuard::new();
        let policy = GuardPolicy::new(Duration::from_secs(60), 2);
        for i in 0..20 {
            guard.record_at("42", "btc", &policy, t0() + TimeDelta::milliseconds(i));
        }
        let key = GuardKey::new("42", "btc", &policy);
        assert_eq!(guard.lock().get(&key).map(|e| e.len()), Some(6));
    }

    #[test]
    fn test_next_allowed_without_history_is_now() {
        let guard = NotificationGuard::new();
        let policy = five_per_five_minutes();
        assert_eq!(guard.next_allowed_time_at("42", "btc", &policy, t0()), t0());
        assert_eq!(guard.time_until_next_allowed_at("42", "btc", &policy, t0()), Duration::ZERO);
    }

    #[test]
    fn test_next_allowed_after_spacing() {
        let guard = NotificationGuard::new();
        let policy = five_per_five_minutes();
        guard.record_at("42", "btc", &policy, t0());

        let now = t0() + TimeDelta::seconds(10);
        assert_eq!(
            guard.next_allowed_time_at("42", "btc", &policy, now),
            t0() + TimeDelta::seconds(60)
        );
        assert_eq!(
            guard.time_until_next_allowed_at("42", "btc", &policy, now),
            Duration::from_secs(50)
        );
    }

    #[test]
    fn test_next_allowed_when_window_full() {
        let guard = NotificationGuard::new();
        let policy = five_per_five_minutes();
        for i in 0..5 {
            guard.record_at("42", "btc", &policy, t0() + TimeDelta::seconds(60 * i));
        }

        let now = t0() + TimeDelta::seconds(250);
        let next = guard.next_allowed_time_at("42", "btc", &policy, now);
        assert_eq!(next, t0() + TimeDelta::seconds(300));
        assert!(guard.check_at("42", "btc", &policy, next));
    }

    #[test]
    fn test_next_allowed_does_not_mutate() {
        let guard = NotificationGuard::new();
        let policy = five_per_five_minutes();
        guard.record_at("42", "btc", &policy, t0());

        let later = t0() + TimeDelta::hours(1);
        guard.next_allowed_time_at("42", "btc", &policy, later);
        let key = GuardKey::new("42", "btc", &policy);
        assert_eq!(guard.lock().get(&key).map(|e| e.len()), Some(1));
    }

    #[test]
    fn test_clear_user() {
        let guard = NotificationGuard::new();
        let policy = five_per_five_minutes();
        guard.record_at("42", "btc", &policy, t0());
        guard.record_at("42", "eth", &policy, t0());
        guard.record_at("7", "btc", &policy, t0());

        guard.clear_user("42");

        assert_eq!(guard.tracked_keys(), 1);
        assert!(guard.check_at("42", "btc", &policy, t0()));
    }

    #[test]
    fn test_clear() {
        let guard = NotificationGuard::new();
        let policy = five_per_five_minutes();
        guard.record_at("42", "btc", &policy, t0());
        guard.record_at("7", "btc", &policy, t0());
        guard.clear();
        assert_eq!(guard.tracked_keys(), 0);
    }

    #[test]
    fn test_cleanup_uses_each_keys_window() {
        let guard = NotificationGuard::new();
        let short = GuardPolicy::new(Duration::from_secs(60), 3);
        let long = GuardPolicy::new(Duration::from_secs(3600), 3);
        guard.record_at("42", "btc", &short, t0());
        guard.record_at("42", "btc", &long, t0());

        guard.cleanup_old_entries_at(t0() + TimeDelta::minutes(5));
        assert_eq!(guard.tracked_keys(), 1);

        guard.cleanup_old_entries_at(t0() + TimeDelta::hours(2));
        assert_eq!(guard.tracked_keys(), 0);
    }

    #[test]
    fn test_describe_wait() {
        assert_eq!(describe_wait(Duration::from_secs(3900)), "1h 5m");
        assert_eq!(describe_wait(Duration::from_secs(7200)), "2h 0m");
        assert_eq!(describe_wait(Duration::from_secs(180)), "3m");
        assert_eq!(describe_wait(Duration::from_secs(12)), "12s");
        assert_eq!(describe_wait(Duration::from_millis(400)), "1s");
        assert_eq!(describe_wait(Duration::ZERO), "0s");
    }

    #[test]
    fn test_concurrent_check_and_record() {
        let guard = std::sync::Arc::new(NotificationGuard::new());
        let policy = GuardPolicy::new(Duration::from_secs(60), 1000);
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let guard = guard.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let now = t0() + TimeDelta::milliseconds(i);
                        guard.check_at(&n.to_string(), "btc", &policy, now);
                        guard.record_at(&n.to_string(), "btc", &policy, now);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(guard.tracked_keys(), 8);
    }
}
