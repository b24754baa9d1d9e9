//! Cooperative supervisor driving the link, the session, and telemetry
//!
//! Every [`SupervisorLoop::cycle`] is bounded and never sleeps:
//!
//! 1. Poll the link. If it is down, cascade that into the session, attempt a
//!    gated reconnect, and end the cycle.
//! 2. Poll the session. If it is not connected, attempt a gated `open`.
//! 3. With both healthy, flush buffered telemetry and service the session.
//!
//! Sampling runs on its own timer regardless of connectivity, so readings
//! taken during an outage are buffered and published once the path returns.
//! Every cycle ends by settling broker acknowledgements, which also returns
//! unacknowledged samples to the queue after a session loss.

use crate::backoff::{BackoffPolicy, RetryDecision};
use crate::link::{LinkDriver, LinkError, LinkState, NetworkLink, ReconnectOutcome};
use crate::observability::metrics::metrics;
use crate::session::{BrokerSession, MqttTransport, OpenStatus, SessionError, SessionState};
use crate::telemetry::{SensorSource, TelemetryPublisher};
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_millis(100);

/// What a cycle did about connectivity
#[derive(Debug, Clone, PartialEq)]
pub enum CycleAction {
    LinkReconnectDeferred { remaining: Duration },
    LinkReconnected,
    LinkReconnectFailed(LinkError),
    SessionOpenDeferred { remaining: Duration },
    SessionOpening,
    SessionOpenFailed(SessionError),
    /// Link and session were healthy; telemetry was flushed
    Serviced,
}

/// Outcome of one supervisor cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub link: LinkState,
    pub session: SessionState,
    pub action: CycleAction,
    /// Samples enqueued this cycle
    pub sampled: usize,
    /// Samples handed to the session this cycle
    pub published: usize,
    /// Samples acknowledged by the broker this cycle
    pub acknowledged: usize,
    /// Samples still owned after this cycle, queued or awaiting acknowledgement
    pub buffered: usize,
}

/// Owns every connectivity component and sequences them each cycle
pub struct SupervisorLoop<D: LinkDriver, T: MqttTransport, S: SensorSource> {
    link: NetworkLink<D>,
    session: BrokerSession<T>,
    publisher: TelemetryPublisher,
    sensors: S,
    session_backoff: BackoffPolicy,
    sample_interval: Duration,
    next_sample_at: Option<Instant>,
    cycle_interval: Duration,
}

impl<D: LinkDriver, T: MqttTransport, S: SensorSource> SupervisorLoop<D, T, S> {
    pub fn new(
        link: NetworkLink<D>,
        session: BrokerSession<T>,
        publisher: TelemetryPublisher,
        sensors: S,
        session_backoff: BackoffPolicy,
        sample_interval: Duration,
    ) -> Self {
        Self {
            link,
            session,
            publisher,
            sensors,
            session_backoff,
            sample_interval,
            next_sample_at: None,
            cycle_interval: DEFAULT_CYCLE_INTERVAL,
        }
    }

    pub fn with_cycle_interval(mut self, cycle_interval: Duration) -> Self {
        self.cycle_interval = cycle_interval;
        self
    }

    pub fn link(&self) -> &NetworkLink<D> {
        &self.link
    }

    pub fn session(&self) -> &BrokerSession<T> {
        &self.session
    }

    /// Register handlers before the loop starts
    pub fn session_mut(&mut self) -> &mut BrokerSession<T> {
        &mut self.session
    }

    pub fn publisher(&self) -> &TelemetryPublisher {
        &self.publisher
    }

    pub fn sensors(&self) -> &S {
        &self.sensors
    }

    pub fn session_backoff(&self) -> &BackoffPolicy {
        &self.session_backoff
    }

    pub fn into_parts(self) -> (NetworkLink<D>, BrokerSession<T>, TelemetryPublisher) {
        (self.link, self.session, self.publisher)
    }

    /// Run one bounded supervision cycle at `now`
    pub fn cycle(&mut self, now: Instant) -> CycleReport {
        let started = Instant::now();
        let sampled = self.sample_if_due(now);
        let (action, published) = self.supervise(now);
        let acknowledged = self.publisher.settle(&mut self.session);
        metrics().cycle_completed(started.elapsed());

        CycleReport {
            link: self.link.state().clone(),
            session: self.session.state().clone(),
            action,
            sampled,
            published,
            acknowledged,
            buffered: self.publisher.len(),
        }
    }

    fn supervise(&mut self, now: Instant) -> (CycleAction, usize) {
        let link_state = self.link.poll();
        if !link_state.is_connected() {
            self.session.poll(&link_state, now);
            let action = match self.link.reconnect(now) {
                Ok(ReconnectOutcome::Deferred { remaining }) => {
                    CycleAction::LinkReconnectDeferred { remaining }
                }
                Ok(ReconnectOutcome::Connected) => CycleAction::LinkReconnected,
                Err(e) => CycleAction::LinkReconnectFailed(e),
            };
            return (action, 0);
        }

        if !self.session.poll(&link_state, now).is_connected() {
            if let Some(action) = self.open_session(&link_state, now) {
                return (action, 0);
            }
        }

        let flush = self.publisher.flush(&mut self.session);
        if let Some(e) = &flush.stopped_by {
            debug!(error = %e, buffered = self.publisher.len(), "Telemetry flush incomplete");
        }
        self.session.poll(&link_state, now);
        (CycleAction::Serviced, flush.published)
    }

    /// Returns `None` when the session became established this cycle
    fn open_session(&mut self, link_state: &LinkState, now: Instant) -> Option<CycleAction> {
        match self.session_backoff.check(now) {
            RetryDecision::Wait { remaining } => {
                Some(CycleAction::SessionOpenDeferred { remaining })
            }
            RetryDecision::Proceed { attempt } => match self.session.open(link_state, now) {
                Ok(OpenStatus::Established) => {
                    if attempt > 1 {
                        info!(attempt, "MQTT session recovered");
                    }
                    self.session_backoff.reset();
                    None
                }
                Ok(OpenStatus::InProgress) => Some(CycleAction::SessionOpening),
                Err(e) => {
                    let delay = self.session_backoff.record_failure(now);
                    warn!(
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "MQTT session attempt failed"
                    );
                    Some(CycleAction::SessionOpenFailed(e))
                }
            },
        }
    }

    fn sample_if_due(&mut self, now: Instant) -> usize {
        let mut samples = self.sensors.collect();
        if !self.next_sample_at.is_some_and(|due| now < due) {
            self.next_sample_at = Some(now + self.sample_interval);
            samples.extend(self.sensors.read(Utc::now()));
        }

        let count = samples.len();
        if count == 0 {
            return 0;
        }
        for sample in samples {
            self.publisher.enqueue(sample);
        }
        debug!(count, buffered = self.publisher.len(), "Sampled sensors");
        count
    }

    /// Drive cycles on the runtime clock until `shutdown` flips to true
    ///
    /// Closes the session on the way out and hands the supervisor back so
    /// the caller can finish transport shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        info!(
            cycle_ms = self.cycle_interval.as_millis() as u64,
            sample_secs = self.sample_interval.as_secs(),
            "Supervisor loop started"
        );

        let mut ticker = tokio::time::interval(self.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<(LinkState, SessionState)> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping supervisor loop");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.cycle(tokio::time::Instant::now().into_std());
                    let current = (report.link.clone(), report.session.clone());
                    if last.as_ref() != Some(&current) {
                        info!(
                            link = %report.link,
                            session = %report.session,
                            buffered = report.buffered,
                            "Connectivity changed"
                        );
                        last = Some(current);
                    }
                }
            }
        }

        self.session.close();
        info!(
            buffered = self.publisher.len(),
            dropped = self.publisher.dropped(),
            "Supervisor loop stopped"
        );
        self
    }
}
