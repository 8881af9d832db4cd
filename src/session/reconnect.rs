//! Reconnect-Policy
//!
//! Zählt Versuche seit dem letzten Verbindungsverlust und entscheidet, ob
//! in-place neu verbunden, der Rendezvous-Endpunkt gewechselt oder
//! aufgegeben wird. Die Wartezeit wächst linear und ist nach oben begrenzt.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Einstellbare Parameter der Policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Versuche insgesamt, danach wird aufgegeben
    pub max_attempts: u32,
    /// Aufeinanderfolgende In-place-Fehlschläge vor dem Endpunktwechsel
    pub rotate_after: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            rotate_after: 2,
            base_delay_ms: 2_000,
            max_delay_ms: 10_000,
        }
    }
}

/// Nächster Schritt der Policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Gleiche Session, gleiche Kennung
    InPlace,
    /// Nächster Endpunkt, neue Session mit gleichem Raum und gleicher Rolle
    RotateEndpoint,
    /// Budget erschöpft
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
    consecutive_in_place: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
            consecutive_in_place: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Wartezeit vor dem nächsten Versuch
    pub fn next_delay(&self) -> Duration {
        let scaled = self
            .config
            .base_delay_ms
            .saturating_mul(u64::from(self.attempts) + 1);
        Duration::from_millis(scaled.min(self.config.max_delay_ms))
    }

    pub fn next_action(&self) -> ReconnectAction {
        if self.attempts >= self.config.max_attempts {
            ReconnectAction::GiveUp
        } else if self.consecutive_in_place >= self.config.rotate_after {
            ReconnectAction::RotateEndpoint
        } else {
            ReconnectAction::InPlace
        }
    }

    /// Zählt einen gestarteten Versuch. Ein Endpunktwechsel setzt den
    /// In-place-Zähler nicht zurück: schlägt er fehl, wird erneut rotiert.
    pub fn record_attempt(&mut self, action: ReconnectAction) {
        match action {
            ReconnectAction::InPlace => {
                self.attempts += 1;
                self.consecutive_in_place += 1;
            }
            ReconnectAction::RotateEndpoint => {
                self.attempts += 1;
            }
            ReconnectAction::GiveUp => {}
        }
    }

    /// Nach erfolgreicher Verbindung oder manuellem Neustart
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.consecutive_in_place = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence_rotates_then_gives_up() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        let mut actions = Vec::new();

        loop {
            let action = policy.next_action();
            actions.push(action);
            if action == ReconnectAction::GiveUp {
                break;
            }
            policy.record_attempt(action);
        }

        use ReconnectAction::*;
        assert_eq!(
            actions,
            vec![InPlace, InPlace, RotateEndpoint, RotateEndpoint, RotateEndpoint, GiveUp]
        );
    }

    #[test]
    fn test_delay_is_linear_monotone_and_capped() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        let mut last = Duration::ZERO;
        let mut delays = Vec::new();

        for _ in 0..8 {
            let delay = policy.next_delay();
            assert!(delay >= last);
            assert!(delay <= Duration::from_secs(10));
            delays.push(delay.as_secs());
            last = delay;
            policy.record_attempt(ReconnectAction::RotateEndpoint);
        }
        assert_eq!(&delays[..5], &[2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_reset_restores_in_place() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
        policy.record_attempt(ReconnectAction::InPlace);
        policy.record_attempt(ReconnectAction::InPlace);
        assert_eq!(policy.next_action(), ReconnectAction::RotateEndpoint);

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_action(), ReconnectAction::InPlace);
    }

    proptest::proptest! {
        #[test]
        fn prop_in_place_streak_never_exceeds_rotate_after(
            max_attempts in 1u32..10,
            rotate_after in 1u32..5,
        ) {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                max_attempts,
                rotate_after,
                ..Default::default()
            });
            let mut streak = 0;
            let mut total = 0;
            loop {
                match policy.next_action() {
                    ReconnectAction::GiveUp => break,
                    ReconnectAction::InPlace => streak += 1,
                    ReconnectAction::RotateEndpoint => streak = 0,
                }
                proptest::prop_assert!(streak <= rotate_after);
                policy.record_attempt(policy.next_action());
                total += 1;
            }
            proptest::prop_assert_eq!(total, max_attempts);
        }
    }
}
