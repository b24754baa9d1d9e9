//! Sensor reads moved off the supervisor thread
//!
//! Slow sources such as 1-Wire probes run on tokio's blocking pool. A read
//! that is triggered in one cycle is handed over through
//! [`SensorSource::collect`] in a later one.

use super::{SensorSource, TelemetrySample};
use chrono::{DateTime, Utc};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, error, warn};

type Reading<S> = oneshot::Receiver<(S, Vec<TelemetrySample>)>;

/// Wraps a blocking [`SensorSource`] so `read` only starts the work
pub struct BackgroundSensor<S> {
    source: Option<S>,
    job: Option<Reading<S>>,
    ready: Vec<TelemetrySample>,
}

impl<S> BackgroundSensor<S>
where
    S: SensorSource + Send + 'static,
{
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            job: None,
            ready: Vec::new(),
        }
    }

    /// True while a reading runs on the blocking pool
    pub fn is_reading(&self) -> bool {
        self.job.is_some()
    }

    fn poll_job(&mut self) {
        let Some(job) = self.job.as_mut() else {
            return;
        };
        match job.try_recv() {
            Ok((source, samples)) => {
                debug!(count = samples.len(), "Background sensor reading finished");
                self.source = Some(source);
                self.ready.extend(samples);
                self.job = None;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Closed) => {
                error!("Sensor reading task ended without a result, source is gone");
                self.job = None;
            }
        }
    }
}

impl<S> SensorSource for BackgroundSensor<S>
where
    S: SensorSource + Send + 'static,
{
    fn read(&mut self, now: DateTime<Utc>) -> Vec<TelemetrySample> {
        self.poll_job();
        if self.job.is_some() {
            warn!("Previous sensor reading still running, skipping this one");
            return std::mem::take(&mut self.ready);
        }
        let Some(mut source) = self.source.take() else {
            return std::mem::take(&mut self.ready);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (tx, rx) = oneshot::channel();
                runtime.spawn_blocking(move || {
                    let samples = source.read(now);
                    let _ = tx.send((source, samples));
                });
                self.job = Some(rx);
            }
            Err(_) => {
                // Nothing else shares this thread without a runtime
                let samples = source.read(now);
                self.ready.extend(samples);
                self.source = Some(source);
            }
        }
        std::mem::take(&mut self.ready)
    }

    fn collect(&mut self) -> Vec<TelemetrySample> {
        self.poll_job();
        std::mem::take(&mut self.ready)
    }
}
