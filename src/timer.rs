//! Timer-Verwaltung für den Event-Loop
//!
//! Alle zeitgesteuerten Vorgänge (Reconnect-Backoff, Liveness-Probe,
//! Call-Timeouts, Call-Ticker, Roster-Sweep) laufen als eigene Tokio-Tasks,
//! die beim Ablauf ein [`Wakeup`] in den Event-Loop schicken. Der Besitzer
//! hält das [`TimerHandle`] und kann es jederzeit abbrechen.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

// ============================================================================
// WAKEUPS
// ============================================================================

/// Weckruf eines abgelaufenen Timers
///
/// Epochen und Call-IDs erlauben es dem Empfänger, Weckrufe zu verwerfen,
/// die schon im Kanal lagen, als der Timer abgebrochen wurde.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// Nächster Reconnect-Versuch fällig
    Reconnect { epoch: u64 },
    /// Periodische Liveness-Prüfung
    Liveness { epoch: u64 },
    /// Wähl- oder Klingel-Timeout eines Anrufs
    CallTimeout { call_id: u64 },
    /// Sekundentakt eines aktiven Anrufs
    CallTick { call_id: u64 },
    /// Periodisches Aufräumen der Mitgliederliste
    RosterSweep,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Erzeugt Timer, deren Weckrufe im Event-Loop landen
#[derive(Debug, Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Wakeup>,
}

impl Scheduler {
    /// Erstellt einen Scheduler samt Empfänger für den Event-Loop
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Wakeup>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Einmaliger Timer
    pub fn once(&self, delay: Duration, wakeup: Wakeup) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(wakeup);
        });
        TimerHandle { task }
    }

    /// Periodischer Timer, der erste Weckruf kommt nach `period`
    pub fn every(&self, period: Duration, wakeup: Wakeup) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(wakeup).is_err() {
                    break;
                }
            }
        });
        TimerHandle { task }
    }
}

// ============================================================================
// TIMER HANDLE
// ============================================================================

/// Laufender Timer; wird beim Drop abgebrochen
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Bricht den Timer ab
    pub fn cancel(self) {
        // Drop erledigt den Abbruch
    }

    /// `true` solange der Timer noch feuern kann
    pub fn is_pending(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let (scheduler, mut rx) = Scheduler::channel();
        let _timer = scheduler.once(Duration::from_secs(3), Wakeup::RosterSweep);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.try_recv().unwrap(), Wakeup::RosterSweep);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (scheduler, mut rx) = Scheduler::channel();
        let timer = scheduler.once(Duration::from_secs(1), Wakeup::CallTimeout { call_id: 7 });
        timer.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_ticks_until_dropped() {
        let (scheduler, mut rx) = Scheduler::channel();
        let ticker = scheduler.every(Duration::from_secs(1), Wakeup::CallTick { call_id: 1 });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let mut ticks = 0;
        while rx.try_recv().is_ok() {
            ticks += 1;
        }
        assert_eq!(ticks, 3);

        drop(ticker);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
    }
}
