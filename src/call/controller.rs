//! Call Controller - Zustandsmaschine für genau einen Anruf
//!
//! `Idle → Dialing → Active → Idle` (ausgehend) und
//! `Idle → Ringing → Active → Idle` (eingehend). Jeder Weg zurück nach
//! `Idle` gibt Mikrofon, Transport-Handle und Timer frei.

use super::capture::{AudioConstraints, CaptureStream, MediaCapture, MediaError};
use crate::timer::{Scheduler, TimerHandle, Wakeup};
use crate::transport::{MediaCall, TransportSession};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout, Instant};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("No incoming call to answer")]
    NotRinging,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Call transport error: {0}")]
    Transport(String),
}

// ============================================================================
// STATE & EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Dialing { peer_id: String },
    Ringing { peer_id: String },
    Active { peer_id: String },
}

impl CallState {
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            CallState::Idle => None,
            CallState::Dialing { peer_id }
            | CallState::Ringing { peer_id }
            | CallState::Active { peer_id } => Some(peer_id),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEndReason {
    /// Lokal aufgelegt oder abgebrochen
    HungUp,
    /// Abgelehnt (lokal oder von der Gegenseite vor dem Abheben)
    Rejected,
    /// Ausgehender Anruf nicht angenommen
    NoAnswer,
    /// Eingehender Anruf verpasst
    Missed,
    RemoteClosed,
    RemoteError,
    LinkLost,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallState),
    Incoming { peer_id: String },
    /// Zweiter Anruf während eines laufenden wurde abgewiesen
    Busy { peer_id: String },
    Established { peer_id: String },
    Tick { peer_id: String, elapsed_secs: u64 },
    Ended {
        peer_id: String,
        reason: CallEndReason,
        duration_secs: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    pub dial_timeout_ms: u64,
    pub ring_timeout_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 30_000,
            ring_timeout_ms: 30_000,
            tick_interval_ms: 1_000,
        }
    }
}

impl CallSettings {
    fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

// ============================================================================
// CALL LEG
// ============================================================================

struct CallLeg {
    state: CallState,
    call: Arc<dyn MediaCall>,
    stream: Option<Box<dyn CaptureStream>>,
    started_at: Option<Instant>,
    timeout: Option<TimerHandle>,
    ticker: Option<TimerHandle>,
}

impl CallLeg {
    fn peer_id(&self) -> &str {
        self.call.peer_id()
    }

    fn elapsed_secs(&self) -> u64 {
        self.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Gibt alles frei, egal in welchem Zustand
    fn release(&mut self) {
        self.timeout = None;
        self.ticker = None;
        if let Some(stream) = self.stream.take() {
            stream.stop();
        }
        self.call.close();
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct CallController {
    capture: Arc<dyn MediaCapture>,
    constraints: AudioConstraints,
    scheduler: Scheduler,
    settings: CallSettings,
    leg: Option<CallLeg>,
}

impl CallController {
    pub fn new(
        capture: Arc<dyn MediaCapture>,
        constraints: AudioConstraints,
        scheduler: Scheduler,
        settings: CallSettings,
    ) -> Self {
        Self {
            capture,
            constraints,
            scheduler,
            settings,
            leg: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.leg
            .as_ref()
            .map(|leg| leg.state.clone())
            .unwrap_or(CallState::Idle)
    }

    /// Anzahl noch laufender Call-Timer (Timeout und Ticker)
    pub fn pending_timers(&self) -> usize {
        self.leg
            .as_ref()
            .map(|leg| {
                [&leg.timeout, &leg.ticker]
                    .iter()
                    .filter(|t| t.as_ref().map(|t| t.is_pending()).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }

    fn leg_for(&mut self, call_id: u64) -> Option<&mut CallLeg> {
        self.leg.as_mut().filter(|leg| leg.call.id() == call_id)
    }

    // ------------------------------------------------------------------------
    // Local actions
    // ------------------------------------------------------------------------

    /// Ruft einen Peer an: Mikrofon holen, Anruf starten, Wähl-Timeout setzen
    pub async fn start_call(
        &mut self,
        session: Arc<dyn TransportSession>,
        peer_id: &str,
    ) -> Result<Vec<CallEvent>, CallError> {
        if self.leg.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let stream = self.capture.acquire_audio(&self.constraints).await?;
        tracing::info!("Calling {}", peer_id);

        let call = match timeout(
            self.settings.dial_timeout(),
            session.call(peer_id, stream.as_ref()),
        )
        .await
        {
            Ok(Ok(call)) => call,
            Ok(Err(e)) => {
                stream.stop();
                tracing::warn!("Failed to call {}: {}", peer_id, e);
                return Err(CallError::Transport(e.to_string()));
            }
            Err(_) => {
                stream.stop();
                tracing::warn!("Call request to {} timed out", peer_id);
                return Err(CallError::Transport(format!("call to {peer_id} timed out")));
            }
        };

        let state = CallState::Dialing {
            peer_id: peer_id.to_string(),
        };
        let timeout = self.scheduler.once(
            self.settings.dial_timeout(),
            Wakeup::CallTimeout { call_id: call.id() },
        );
        self.leg = Some(CallLeg {
            state: state.clone(),
            call,
            stream: Some(stream),
            started_at: None,
            timeout: Some(timeout),
            ticker: None,
        });
        Ok(vec![CallEvent::StateChanged(state)])
    }

    /// Nimmt den klingelnden Anruf an. Ohne Mikrofon bleibt es beim Klingeln.
    pub async fn accept(&mut self) -> Result<Vec<CallEvent>, CallError> {
        let call = match &self.leg {
            Some(leg) if matches!(leg.state, CallState::Ringing { .. }) && leg.stream.is_none() => {
                Arc::clone(&leg.call)
            }
            _ => return Err(CallError::NotRinging),
        };

        let stream = match self.capture.acquire_audio(&self.constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Cannot answer call from {}: {}", call.peer_id(), e);
                return Err(CallError::Media(e));
            }
        };

        // Während des Mikrofon-Zugriffs kann der Anruf geendet haben
        let Some(leg) = self.leg_for(call.id()) else {
            stream.stop();
            return Err(CallError::NotRinging);
        };

        if let Err(e) = call.answer(stream.as_ref()) {
            stream.stop();
            tracing::warn!("Failed to answer call from {}: {}", call.peer_id(), e);
            return Ok(self.end(CallEndReason::Failed));
        }
        tracing::info!("Answered call from {}", call.peer_id());
        leg.stream = Some(stream);
        Ok(Vec::new())
    }

    pub fn reject(&mut self) -> Result<Vec<CallEvent>, CallError> {
        match &self.leg {
            Some(leg) if matches!(leg.state, CallState::Ringing { .. }) => {
                Ok(self.end(CallEndReason::Rejected))
            }
            _ => Err(CallError::NotRinging),
        }
    }

    /// Legt auf oder bricht das Wählen ab
    pub fn hangup(&mut self) -> Result<Vec<CallEvent>, CallError> {
        if self.leg.is_none() {
            return Err(CallError::NoActiveCall);
        }
        Ok(self.end(CallEndReason::HungUp))
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    /// Eingehender Anruf; bei laufendem Anruf sofort besetzt
    pub fn on_incoming(&mut self, call: Arc<dyn MediaCall>) -> Vec<CallEvent> {
        let peer_id = call.peer_id().to_string();
        if self.leg.is_some() {
            tracing::info!("Busy, rejecting call from {}", peer_id);
            call.close();
            return vec![CallEvent::Busy { peer_id }];
        }

        tracing::info!("Incoming call from {}", peer_id);
        let state = CallState::Ringing {
            peer_id: peer_id.clone(),
        };
        let timeout = self.scheduler.once(
            self.settings.ring_timeout(),
            Wakeup::CallTimeout { call_id: call.id() },
        );
        self.leg = Some(CallLeg {
            state: state.clone(),
            call,
            stream: None,
            started_at: None,
            timeout: Some(timeout),
            ticker: None,
        });
        vec![CallEvent::Incoming { peer_id }, CallEvent::StateChanged(state)]
    }

    /// Medienstrom der Gegenseite ist da: der Anruf läuft
    pub fn on_remote_stream(&mut self, call_id: u64) -> Vec<CallEvent> {
        let tick = self.settings.tick_interval();
        let scheduler = self.scheduler.clone();
        let Some(leg) = self.leg_for(call_id) else {
            return Vec::new();
        };
        if matches!(leg.state, CallState::Active { .. }) {
            return Vec::new();
        }

        let peer_id = leg.peer_id().to_string();
        leg.state = CallState::Active {
            peer_id: peer_id.clone(),
        };
        leg.timeout = None;
        leg.started_at = Some(Instant::now());
        leg.ticker = Some(scheduler.every(tick, Wakeup::CallTick { call_id }));
        tracing::info!("Call with {} established", peer_id);

        vec![
            CallEvent::StateChanged(leg.state.clone()),
            CallEvent::Established { peer_id },
        ]
    }

    pub fn on_call_closed(&mut self, call_id: u64) -> Vec<CallEvent> {
        let reason = match self.leg_for(call_id).map(|leg| &leg.state) {
            Some(CallState::Dialing { .. }) => CallEndReason::Rejected,
            Some(CallState::Ringing { .. }) => CallEndReason::Missed,
            Some(_) => CallEndReason::RemoteClosed,
            None => return Vec::new(),
        };
        self.end(reason)
    }

    pub fn on_call_error(&mut self, call_id: u64, reason: &str) -> Vec<CallEvent> {
        if self.leg_for(call_id).is_none() {
            return Vec::new();
        }
        tracing::warn!("Call {} failed: {}", call_id, reason);
        self.end(CallEndReason::RemoteError)
    }

    /// Link zu einem Peer ist weg; ein Anruf mit ihm endet
    pub fn on_link_lost(&mut self, peer_id: &str) -> Vec<CallEvent> {
        match &self.leg {
            Some(leg) if leg.peer_id() == peer_id => self.end(CallEndReason::LinkLost),
            _ => Vec::new(),
        }
    }

    /// Session wurde neu aufgebaut, alle Anruf-Handles sind ungültig
    pub fn on_session_reset(&mut self) -> Vec<CallEvent> {
        if self.leg.is_some() {
            self.end(CallEndReason::LinkLost)
        } else {
            Vec::new()
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    pub fn on_timeout(&mut self, call_id: u64) -> Vec<CallEvent> {
        let reason = match self.leg_for(call_id).map(|leg| &leg.state) {
            Some(CallState::Dialing { .. }) => CallEndReason::NoAnswer,
            Some(CallState::Ringing { .. }) => CallEndReason::Missed,
            _ => return Vec::new(),
        };
        tracing::info!("Call {} timed out ({:?})", call_id, reason);
        self.end(reason)
    }

    pub fn on_tick(&mut self, call_id: u64) -> Vec<CallEvent> {
        match self.leg_for(call_id) {
            Some(leg) if matches!(leg.state, CallState::Active { .. }) => vec![CallEvent::Tick {
                peer_id: leg.peer_id().to_string(),
                elapsed_secs: leg.elapsed_secs(),
            }],
            _ => Vec::new(),
        }
    }

    /// Beendet den Anruf und gibt alle Ressourcen frei
    fn end(&mut self, reason: CallEndReason) -> Vec<CallEvent> {
        let Some(mut leg) = self.leg.take() else {
            return Vec::new();
        };
        let duration_secs = leg.elapsed_secs();
        leg.release();

        let peer_id = leg.peer_id().to_string();
        tracing::info!(
            "Call with {} ended ({:?}, {}s)",
            peer_id,
            reason,
            duration_secs
        );
        vec![
            CallEvent::Ended {
                peer_id,
                reason,
                duration_secs,
            },
            CallEvent::StateChanged(CallState::Idle),
        ]
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("state", &self.state())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::RendezvousEndpoint;
    use crate::test_support::FakeCapture;
    use crate::transport::{MemoryNetwork, OpenedSession, PeerTransport, SessionConfig, TransportEvent};
    use tokio::sync::mpsc;

    struct Side {
        controller: CallController,
        capture: Arc<FakeCapture>,
        opened: OpenedSession,
        wakeups: mpsc::UnboundedReceiver<Wakeup>,
    }

    async fn side(net: &MemoryNetwork, id: &str, capture: FakeCapture) -> Side {
        let opened = net
            .open(SessionConfig {
                requested_id: Some(id.to_string()),
                endpoint: RendezvousEndpoint::new("mem", 443, "/", "test", true),
                relays: Vec::new(),
            })
            .await
            .unwrap();
        let (scheduler, wakeups) = Scheduler::channel();
        let capture = Arc::new(capture);
        let controller = CallController::new(
            capture.clone(),
            AudioConstraints::default(),
            scheduler,
            CallSettings::default(),
        );
        Side {
            controller,
            capture,
            opened,
            wakeups,
        }
    }

    impl Side {
        /// Leitet das nächste Call-Event des Transports an den Controller
        async fn pump(&mut self) -> Vec<CallEvent> {
            match self.opened.events.recv().await.unwrap() {
                TransportEvent::IncomingCall { call } => self.controller.on_incoming(call),
                TransportEvent::RemoteStream { call_id, .. } => {
                    self.controller.on_remote_stream(call_id)
                }
                TransportEvent::CallClosed { call_id, .. } => self.controller.on_call_closed(call_id),
                other => panic!("unexpected {other:?}"),
            }
        }

        async fn wake(&mut self) -> Vec<CallEvent> {
            match self.wakeups.recv().await.unwrap() {
                Wakeup::CallTimeout { call_id } => self.controller.on_timeout(call_id),
                Wakeup::CallTick { call_id } => self.controller.on_tick(call_id),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    fn ended_reason(events: &[CallEvent]) -> Option<CallEndReason> {
        events.iter().find_map(|e| match e {
            CallEvent::Ended { reason, .. } => Some(*reason),
            _ => None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_is_answered_ticks_and_hangs_up() {
        let net = MemoryNetwork::new();
        let mut a = side(&net, "A", FakeCapture::allow()).await;
        let mut b = side(&net, "B", FakeCapture::allow()).await;

        let events = a
            .controller
            .start_call(a.opened.session.clone(), "B")
            .await
            .unwrap();
        assert_eq!(
            events,
            vec![CallEvent::StateChanged(CallState::Dialing { peer_id: "B".into() })]
        );

        let events = b.pump().await;
        assert_eq!(events[0], CallEvent::Incoming { peer_id: "A".into() });
        b.controller.accept().await.unwrap();

        b.pump().await;
        a.pump().await;
        assert_eq!(a.controller.state(), CallState::Active { peer_id: "B".into() });
        assert_eq!(b.controller.state(), CallState::Active { peer_id: "A".into() });
        assert_eq!(a.controller.pending_timers(), 1);

        let tick = a.wake().await;
        assert!(matches!(&tick[..], [CallEvent::Tick { elapsed_secs: 1, .. }]));
        a.wake().await;

        let events = a.controller.hangup().unwrap();
        assert_eq!(
            events[0],
            CallEvent::Ended {
                peer_id: "B".into(),
                reason: CallEndReason::HungUp,
                duration_secs: 2
            }
        );
        assert_eq!(a.controller.pending_timers(), 0);
        assert_eq!(a.capture.live_streams(), 0);

        let events = b.pump().await;
        assert_eq!(ended_reason(&events), Some(CallEndReason::RemoteClosed));
        assert_eq!(b.capture.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out_on_both_sides() {
        let net = MemoryNetwork::new();
        let mut a = side(&net, "A", FakeCapture::allow()).await;
        let mut b = side(&net, "B", FakeCapture::allow()).await;

        a.controller
            .start_call(a.opened.session.clone(), "B")
            .await
            .unwrap();
        b.pump().await;

        let events = a.wake().await;
        assert_eq!(ended_reason(&events), Some(CallEndReason::NoAnswer));

        let events = b.pump().await;
        assert_eq!(ended_reason(&events), Some(CallEndReason::Missed));
        assert!(a.controller.state().is_idle());
        assert!(b.controller.state().is_idle());
        assert_eq!(a.controller.pending_timers() + b.controller.pending_timers(), 0);
        assert_eq!(a.capture.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_incoming_call_is_busy() {
        let net = MemoryNetwork::new();
        let mut a = side(&net, "A", FakeCapture::allow()).await;
        let mut b = side(&net, "B", FakeCapture::allow()).await;
        let c = side(&net, "C", FakeCapture::allow()).await;

        a.controller
            .start_call(a.opened.session.clone(), "B")
            .await
            .unwrap();
        b.pump().await;

        let stream = c.capture.acquire_audio(&AudioConstraints::default()).await.unwrap();
        c.opened.session.call("B", stream.as_ref()).await.unwrap();

        let events = b.pump().await;
        assert_eq!(events, vec![CallEvent::Busy { peer_id: "C".into() }]);
        assert_eq!(b.controller.state(), CallState::Ringing { peer_id: "A".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_microphone() {
        let net = MemoryNetwork::new();
        let mut a = side(&net, "A", FakeCapture::deny()).await;
        let mut b = side(&net, "B", FakeCapture::deny()).await;

        let err = a
            .controller
            .start_call(a.opened.session.clone(), "B")
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Media(MediaError::PermissionDenied));
        assert!(a.controller.state().is_idle());

        let stream = FakeCapture::allow()
            .acquire_audio(&AudioConstraints::default())
            .await
            .unwrap();
        a.opened.session.call("B", stream.as_ref()).await.unwrap();
        b.pump().await;

        let err = b.controller.accept().await.unwrap_err();
        assert_eq!(err, CallError::Media(MediaError::PermissionDenied));
        assert_eq!(b.controller.state(), CallState::Ringing { peer_id: "A".into() });

        let events = b.controller.reject().unwrap();
        assert_eq!(ended_reason(&events), Some(CallEndReason::Rejected));
        assert_eq!(b.controller.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_ends_call_with_that_peer_only() {
        let net = MemoryNetwork::new();
        let mut a = side(&net, "A", FakeCapture::allow()).await;
        let _b = side(&net, "B", FakeCapture::allow()).await;

        a.controller
            .start_call(a.opened.session.clone(), "B")
            .await
            .unwrap();
        assert!(a.controller.on_link_lost("C").is_empty());

        let events = a.controller.on_link_lost("B");
        assert_eq!(ended_reason(&events), Some(CallEndReason::LinkLost));
        assert_eq!(a.capture.live_streams(), 0);
        assert!(a.controller.hangup().is_err());
    }
}
