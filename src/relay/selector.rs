//! Relay-Auswahl
//!
//! Prüft STUN-Kandidaten nacheinander mit festem Abstand und kurzem
//! Timeout, verwirft nicht erreichbare und hängt eine begrenzte Zahl
//! TURN-Kandidaten ungeprüft an. Eine Runde dauert höchstens
//! [`SelectionBudget::total_timeout_ms`], damit das Öffnen der Session
//! innerhalb seines Timeouts bleibt.

use super::candidate::{fallback_stun_pair, RelayCandidate};
use super::probe::{ProbeOutcome, RelayProbe};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Zusätzliche Wartezeit über dem Probe-Timeout, falls eine Probe hängt
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// Grenzen für eine Auswahlrunde
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionBudget {
    /// Höchstens so viele STUN-Kandidaten werden geprüft
    pub max_probed: usize,
    pub probe_timeout_ms: u64,
    /// Pause zwischen zwei Probes
    pub probe_spacing_ms: u64,
    /// Höchstens so viele TURN-Kandidaten werden angehängt
    pub max_relays: usize,
    /// Obergrenze für die ganze Runde; danach wird nicht mehr geprüft
    pub total_timeout_ms: u64,
}

impl Default for SelectionBudget {
    fn default() -> Self {
        Self {
            max_probed: 12,
            probe_timeout_ms: 3_000,
            probe_spacing_ms: 300,
            max_relays: 2,
            total_timeout_ms: 2_500,
        }
    }
}

impl SelectionBudget {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_spacing(&self) -> Duration {
        Duration::from_millis(self.probe_spacing_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

/// Wählt die Relay-Liste für eine neue Session
#[derive(Clone)]
pub struct RelaySelector {
    probe: Arc<dyn RelayProbe>,
}

impl RelaySelector {
    pub fn new(probe: Arc<dyn RelayProbe>) -> Self {
        Self { probe }
    }

    /// Liefert `erreichbare STUN ++ begrenzte TURN`. Schlägt nie fehl:
    /// antwortet kein STUN Server, wird das Standard-Paar verwendet.
    pub async fn select_relays(
        &self,
        catalog: &[RelayCandidate],
        budget: &SelectionBudget,
    ) -> Vec<RelayCandidate> {
        let deadline = Instant::now() + budget.total_timeout();
        let mut verified = Vec::new();
        let stun: Vec<&RelayCandidate> = catalog
            .iter()
            .filter(|c| c.is_stun())
            .take(budget.max_probed)
            .collect();

        for (i, candidate) in stun.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(budget.probe_spacing()).await;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!("Selection time spent, {} candidate(s) not probed", stun.len() - i);
                break;
            }

            let outcome = tokio::time::timeout(
                (budget.probe_timeout() + PROBE_GRACE).min(remaining),
                self.probe.probe(candidate, budget.probe_timeout()),
            )
            .await
            .unwrap_or(ProbeOutcome::TimedOut);

            match outcome {
                ProbeOutcome::Reachable => {
                    tracing::debug!("Relay {:?} is reachable", candidate.urls);
                    verified.push((*candidate).clone());
                }
                other => {
                    tracing::debug!("Discarding relay {:?}: {:?}", candidate.urls, other);
                }
            }
        }

        if verified.is_empty() {
            tracing::warn!("No STUN server reachable, using fallback pair");
            verified = fallback_stun_pair();
        }

        let relays = catalog
            .iter()
            .filter(|c| !c.is_stun())
            .take(budget.max_relays)
            .cloned();
        verified.extend(relays);

        tracing::info!("Selected {} relay candidate(s)", verified.len());
        verified
    }
}

impl std::fmt::Debug for RelaySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySelector").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayKind;
    use crate::test_support::FakeProbe;

    fn catalog() -> Vec<RelayCandidate> {
        vec![
            RelayCandidate::stun("stun:a:1"),
            RelayCandidate::turn(vec!["turn:t1:3478".into()], "u", "p"),
            RelayCandidate::stun("stun:b:1"),
            RelayCandidate::stun("stun:c:1"),
            RelayCandidate::turn(vec!["turn:t2:3478".into()], "u", "p"),
            RelayCandidate::turn(vec!["turn:t3:3478".into()], "u", "p"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_reachable_stun_then_capped_turn() {
        let probe = Arc::new(FakeProbe::reachable(&["stun:a:1", "stun:c:1"]));
        let selector = RelaySelector::new(probe.clone());

        let selected = selector
            .select_relays(&catalog(), &SelectionBudget::default())
            .await;

        let urls: Vec<&str> = selected.iter().map(|c| c.urls[0].as_str()).collect();
        assert_eq!(urls, vec!["stun:a:1", "stun:c:1", "turn:t1:3478", "turn:t2:3478"]);
        assert_eq!(probe.probed().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_default_pair() {
        let selector = RelaySelector::new(Arc::new(FakeProbe::reachable(&[])));

        let selected = selector
            .select_relays(&catalog(), &SelectionBudget::default())
            .await;

        let stun: Vec<&RelayCandidate> = selected.iter().filter(|c| c.is_stun()).collect();
        assert_eq!(stun, fallback_stun_pair().iter().collect::<Vec<_>>());
        assert_eq!(
            selected.iter().filter(|c| c.kind == RelayKind::Turn).count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_checks_bounded_prefix_with_spacing() {
        let catalog: Vec<RelayCandidate> = (0..20)
            .map(|i| RelayCandidate::stun(format!("stun:s{i}:1")))
            .collect();
        let probe = Arc::new(FakeProbe::reachable(&["stun:s0:1"]));
        let selector = RelaySelector::new(probe.clone());
        let budget = SelectionBudget {
            max_probed: 4,
            ..Default::default()
        };

        let start = tokio::time::Instant::now();
        let selected = selector.select_relays(&catalog, &budget).await;

        assert_eq!(probe.probed().len(), 4);
        assert_eq!(selected.len(), 1);
        // drei Pausen à 300 ms zwischen vier Probes
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_catalog_stays_within_total_budget() {
        let probe = Arc::new(FakeProbe::hanging());
        let selector = RelaySelector::new(probe.clone());
        let budget = SelectionBudget::default();

        let start = tokio::time::Instant::now();
        let selected = selector
            .select_relays(&crate::relay::default_relay_catalog(), &budget)
            .await;

        // Abbruch nach der Gesamtzeit plus höchstens einer Pause
        assert!(start.elapsed() <= budget.total_timeout() + budget.probe_spacing());
        assert_eq!(probe.probed().len(), 1);
        assert!(selected.starts_with(&fallback_stun_pair()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_relay_check_is_cut_off() {
        let probe = Arc::new(FakeProbe::hanging());
        let selector = RelaySelector::new(probe);
        let budget = SelectionBudget {
            max_probed: 1,
            ..Default::default()
        };

        let selected = selector
            .select_relays(&[RelayCandidate::stun("stun:slow:1")], &budget)
            .await;

        assert_eq!(selected, fallback_stun_pair());
    }
}
