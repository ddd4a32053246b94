use std::collections::HashSet;
use std::time::Duration;

use cloak_client_core::deep_link::{
    AuthLinkPayload, DeepLinkError, LinkRoute, find_deep_link_arg, interpret,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::pending_link::PendingLinkBuffer;
use crate::relay::{RelayError, RelaySender, UiSignal};
use crate::surface::DisplaySurface;

pub const DEFAULT_READY_TIMEOUT_MS: u64 = 3_000;

/// Ways a URL reaches the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// This process's own argv at first launch.
    Launch { argv: Vec<String> },
    /// A later launch forwarded through the instance lock.
    SecondInstance { argv: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkContextConfig {
    pub scheme: String,
    pub ready_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Waiting,
    Ready,
    /// Never signalled; links flow anyway after the ready timeout.
    AssumedReady,
}

impl ListenerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::AssumedReady => "assumed_ready",
        }
    }

    fn accepts_delivery(self) -> bool {
        !matches!(self, Self::Waiting)
    }
}

/// Process-lifetime owner of the pending link, the relay and the surface.
/// Every activation is routed through here so that links are delivered in
/// arrival order and none are lost before the display side is listening.
pub struct LinkContext<D> {
    config: LinkContextConfig,
    buffer: PendingLinkBuffer,
    relay: RelaySender,
    surface: D,
    listener: ListenerState,
    redelivered: HashSet<String>,
}

impl<D: DisplaySurface> LinkContext<D> {
    pub fn new(config: LinkContextConfig, relay: RelaySender, surface: D) -> Self {
        Self {
            config,
            buffer: PendingLinkBuffer::new(),
            relay,
            surface,
            listener: ListenerState::Waiting,
            redelivered: HashSet::new(),
        }
    }

    #[cfg(test)]
    pub fn surface(&self) -> &D {
        &self.surface
    }

    #[cfg(test)]
    pub fn buffer(&self) -> &PendingLinkBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn listener_state(&self) -> ListenerState {
        self.listener
    }

    /// Drains whatever is still waiting, for persistence at shutdown.
    pub fn take_pending(&self) -> Option<AuthLinkPayload> {
        self.buffer.drain()
    }

    pub fn handle_activation(&mut self, activation: Activation) {
        match activation {
            Activation::Launch { argv } => {
                self.route_args(&argv);
            }
            Activation::SecondInstance { argv } => {
                if self.surface.is_minimized() {
                    self.surface.restore();
                }
                self.surface.focus();
                self.route_args(&argv);
            }
        }
    }

    fn route_args(&mut self, argv: &[String]) {
        let link = find_deep_link_arg(argv.iter().map(String::as_str), &self.config.scheme)
            .map(str::to_string);
        match link {
            Some(url) => {
                self.route_url(&url);
            }
            None => tracing::debug!(args = argv.len(), "activation carried no deep link"),
        }
    }

    /// Interprets `url` and hands it on. Returns whether a payload was
    /// accepted for delivery.
    pub fn route_url(&mut self, url: &str) -> bool {
        match interpret(url, &self.config.scheme) {
            Ok(payload) => {
                tracing::info!(route = payload.route.as_str(), "deep link received");
                self.deliver_or_hold(payload);
                true
            }
            Err(error @ (DeepLinkError::SchemeMismatch { .. } | DeepLinkError::UnrecognizedRoute { .. })) => {
                tracing::debug!(code = error.code(), error = %error, "ignoring foreign link");
                false
            }
            Err(error) => {
                tracing::warn!(code = error.code(), error = %error, "discarding malformed deep link");
                false
            }
        }
    }

    pub fn handle_signal(&mut self, signal: UiSignal) {
        match signal {
            UiSignal::ListenerReady => {
                tracing::info!(previous = self.listener.as_str(), "display listener ready");
                self.listener = ListenerState::Ready;
                self.flush_pending();
            }
            UiSignal::Ack { delivery_id } => match self.relay.acknowledge(delivery_id) {
                Some(raw_data) => {
                    self.redelivered.remove(&raw_data);
                }
                None => tracing::debug!(delivery_id, "ack for unknown delivery"),
            },
        }
    }

    /// Fallback for a display side that never signals readiness.
    pub fn handle_ready_timeout(&mut self) {
        if self.listener != ListenerState::Waiting {
            return;
        }
        tracing::warn!(
            timeout_ms = self.config.ready_timeout.as_millis() as u64,
            pending = !self.buffer.is_empty(),
            "display listener never signalled readiness, delivering anyway"
        );
        self.listener = ListenerState::AssumedReady;
        self.flush_pending();
    }

    /// Re-buffers deliveries the display side never acknowledged. A payload
    /// gets one retry per loss; the retry marker clears once it is acked,
    /// dropped or displaced by a newer link.
    pub fn check_acknowledgements(&mut self, now: Instant) {
        for lost in self.relay.take_unacknowledged(now) {
            if self.redelivered.remove(&lost.raw_data) {
                tracing::warn!(delivery_id = lost.delivery_id, "deep link lost after redelivery, dropping");
                continue;
            }
            tracing::warn!(delivery_id = lost.delivery_id, "deep link unacknowledged, re-buffering");
            let payload = AuthLinkPayload {
                protocol: self.config.scheme.clone(),
                route: LinkRoute::Auth,
                raw_data: lost.raw_data,
            };
            let raw_data = payload.raw_data.clone();
            if self.buffer.restore_if_empty(payload) {
                self.redelivered.insert(raw_data);
                self.flush_pending();
            } else {
                tracing::debug!("newer link already pending, skipping redelivery");
            }
        }
    }

    fn deliver_or_hold(&mut self, payload: AuthLinkPayload) {
        if !self.listener.accepts_delivery() {
            if let Some(displaced) = self.buffer.store(payload) {
                self.redelivered.remove(&displaced.raw_data);
                tracing::info!("replaced older pending deep link");
            }
            tracing::debug!("display listener not ready, deep link held");
            return;
        }
        if let Err(RelayError::ListenerDetached) = self.relay.send(&payload.raw_data) {
            tracing::warn!("display listener detached, deep link held");
            self.listener = ListenerState::Waiting;
            self.buffer.store(payload);
        }
    }

    fn flush_pending(&mut self) {
        let Some(payload) = self.buffer.drain() else {
            return;
        };
        if let Err(RelayError::ListenerDetached) = self.relay.send(&payload.raw_data) {
            tracing::warn!("display listener detached during flush, deep link held");
            self.listener = ListenerState::Waiting;
            self.buffer.restore_if_empty(payload);
        }
    }

    /// Coordinator loop. Runs until `shutdown` fires or every input closes,
    /// then returns the context so leftover state can be persisted.
    pub async fn run(
        mut self,
        mut activations: mpsc::UnboundedReceiver<Activation>,
        mut signals: mpsc::UnboundedReceiver<UiSignal>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Self {
        let ready_deadline = tokio::time::sleep(self.config.ready_timeout);
        tokio::pin!(ready_deadline);
        let mut ack_check = tokio::time::interval(ack_check_period(self.relay.ack_timeout()));
        ack_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ready_deadline_passed = false;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(signal) = signals.recv() => self.handle_signal(signal),
                Some(activation) = activations.recv() => self.handle_activation(activation),
                () = &mut ready_deadline,
                    if !ready_deadline_passed && self.listener == ListenerState::Waiting => {
                    ready_deadline_passed = true;
                    self.handle_ready_timeout();
                }
                _ = ack_check.tick(), if self.relay.in_flight_count() > 0 => {
                    self.check_acknowledgements(Instant::now());
                }
                else => break,
            }
        }
        self
    }
}

fn ack_check_period(ack_timeout: Duration) -> Duration {
    (ack_timeout / 4).max(Duration::from_millis(50))
}
