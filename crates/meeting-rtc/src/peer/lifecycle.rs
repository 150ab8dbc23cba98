//! Peer recovery: exponential backoff and per-peer attempt budgets
//!
//! The attempt counter is keyed by remote client id so it survives the
//! replacement of a failed connection.

use crate::config::{MeetingConfig, RecoveryConfig};
use crate::types::ClientId;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backoff timing (defaults: 5 attempts, 1s base, 30s cap, no jitter)
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    /// Attempts allowed before giving up
    pub max_attempts: u32,
    /// First delay in milliseconds
    pub base_ms: u64,
    /// Delay cap in milliseconds
    pub max_ms: u64,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Add 0-25% random jitter
    pub jitter_enabled: bool,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for BackoffSchedule {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            multiplier: 2.0,
            jitter_enabled: config.jitter,
        }
    }
}

impl BackoffSchedule {
    /// Delay before the step following `attempt` (0-indexed):
    /// `base * multiplier^attempt`, clamped to the cap, plus optional jitter.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff_ms = (self.base_ms as f64) * self.multiplier.powi(exponent);
        let backoff_ms = backoff_ms.min(self.max_ms as f64);

        let final_ms = if self.jitter_enabled {
            backoff_ms + rand::thread_rng().gen_range(0.0..=0.25) * backoff_ms
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Check if more attempts are allowed
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Outcome when a recovery timer fires and the peer is still down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Run attempt number `attempt` (1-based), then check again after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Budget spent
    GiveUp { attempts: u32 },
}

/// Outcome for an engine-reported connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Tear down and rebuild the connection, counted as attempt `attempt`
    Replace { attempt: u32, force_relay: bool },
    GiveUp { attempts: u32 },
}

/// Per-peer recovery bookkeeping, owned by the session handler
#[derive(Debug)]
pub struct RecoveryPolicy {
    schedule: BackoffSchedule,
    force_relay: bool,
    attempts: HashMap<ClientId, u32>,
}

impl RecoveryPolicy {
    pub fn new(config: &MeetingConfig) -> Self {
        Self {
            schedule: BackoffSchedule::from(&config.recovery),
            force_relay: config.recovery.force_relay_on_failure && config.has_relay(),
            attempts: HashMap::new(),
        }
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }

    pub fn max_attempts(&self) -> u32 {
        self.schedule.max_attempts
    }

    /// Attempts made since the peer was last connected
    pub fn attempts(&self, peer: &ClientId) -> u32 {
        self.attempts.get(peer).copied().unwrap_or(0)
    }

    /// Wait before acting on a fresh disconnect
    pub fn initial_delay(&self, peer: &ClientId) -> Duration {
        self.schedule.calculate_backoff(self.attempts(peer))
    }

    /// Consume one attempt for a peer that is still not connected
    pub fn next_attempt(&mut self, peer: &ClientId) -> RecoveryDecision {
        let made = self.attempts(peer);
        if !self.schedule.should_retry(made) {
            warn!(peer_id = %peer, attempts = made, "Recovery budget exhausted");
            return RecoveryDecision::GiveUp { attempts: made };
        }
        let attempt = made + 1;
        self.attempts.insert(peer.clone(), attempt);
        let delay = self.schedule.calculate_backoff(attempt);
        info!(peer_id = %peer, attempt, ?delay, "Recovery attempt");
        RecoveryDecision::Retry { attempt, delay }
    }

    /// Consume one attempt for an engine-reported failure
    pub fn on_failed(&mut self, peer: &ClientId) -> FailureDecision {
        let made = self.attempts(peer);
        if !self.schedule.should_retry(made) {
            warn!(peer_id = %peer, attempts = made, "Recovery budget exhausted after failure");
            return FailureDecision::GiveUp { attempts: made };
        }
        let attempt = made + 1;
        self.attempts.insert(peer.clone(), attempt);
        info!(peer_id = %peer, attempt, force_relay = self.force_relay, "Replacing failed connection");
        FailureDecision::Replace {
            attempt,
            force_relay: self.force_relay,
        }
    }

    /// Connected again: the budget refills
    pub fn on_connected(&mut self, peer: &ClientId) {
        if self.attempts.remove(peer).is_some() {
            debug!(peer_id = %peer, "Recovery counter reset");
        }
    }

    /// Peer left the room
    pub fn forget(&mut self, peer: &ClientId) {
        self.attempts.remove(peer);
    }
}

/// Timer that delivers one message after a delay. Dropping it cancels the
/// timer, so storing it on a peer entry ties its life to the entry.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn after<T: Send + 'static>(delay: Duration, tx: mpsc::UnboundedSender<T>, msg: T) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the timer now. Dropping has the same effect.
    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy::new(&MeetingConfig::default())
    }

    #[test]
    fn test_exponential_backoff() {
        let schedule = BackoffSchedule::default();

        assert_eq!(schedule.calculate_backoff(0), Duration::from_millis(1000));
        assert_eq!(schedule.calculate_backoff(1), Duration::from_millis(2000));
        assert_eq!(schedule.calculate_backoff(2), Duration::from_millis(4000));
        assert_eq!(schedule.calculate_backoff(4), Duration::from_millis(16000));
        // Capped
        assert_eq!(schedule.calculate_backoff(5), Duration::from_millis(30000));
        assert_eq!(schedule.calculate_backoff(40), Duration::from_millis(30000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let schedule = BackoffSchedule {
            jitter_enabled: true,
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = schedule.calculate_backoff(1);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn test_budget_of_five_then_give_up() {
        let mut policy = policy();
        let peer = ClientId::from("b");
        for expected in 1..=5 {
            match policy.next_attempt(&peer) {
                RecoveryDecision::Retry { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("Expected Retry, got {:?}", other),
            }
        }
        assert_eq!(
            policy.next_attempt(&peer),
            RecoveryDecision::GiveUp { attempts: 5 }
        );
        assert_eq!(policy.on_failed(&peer), FailureDecision::GiveUp { attempts: 5 });
    }

    #[test]
    fn test_connected_resets_counter() {
        let mut policy = policy();
        let peer = ClientId::from("b");
        policy.next_attempt(&peer);
        policy.next_attempt(&peer);
        assert_eq!(policy.attempts(&peer), 2);
        assert_eq!(policy.initial_delay(&peer), Duration::from_millis(4000));

        policy.on_connected(&peer);
        assert_eq!(policy.attempts(&peer), 0);
        assert_eq!(policy.initial_delay(&peer), Duration::from_millis(1000));
    }

    #[test]
    fn test_counters_are_per_peer() {
        let mut policy = policy();
        policy.next_attempt(&ClientId::from("b"));
        assert_eq!(policy.attempts(&ClientId::from("c")), 0);
        policy.forget(&ClientId::from("b"));
        assert_eq!(policy.attempts(&ClientId::from("b")), 0);
    }

    #[test]
    fn test_failure_forces_relay_only_with_turn() {
        let mut policy = policy();
        assert_eq!(
            policy.on_failed(&ClientId::from("b")),
            FailureDecision::Replace {
                attempt: 1,
                force_relay: false
            }
        );

        let mut config = MeetingConfig::default();
        config.turn_servers.push(crate::config::TurnServerConfig {
            url: "turn:t.example.com".to_string(),
            username: "u".to_string(),
            credential: "c".to_string(),
        });
        let mut policy = RecoveryPolicy::new(&config);
        assert!(matches!(
            policy.on_failed(&ClientId::from("b")),
            FailureDecision::Replace {
                force_relay: true,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_task_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _task = ScheduledTask::after(Duration::from_secs(2), tx, 7u32);

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_task_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = ScheduledTask::after(Duration::from_secs(1), tx, ());
        drop(task);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = ScheduledTask::after(Duration::from_secs(1), tx.clone(), 1u8);
        task.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
