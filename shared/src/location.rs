use async_trait::async_trait;
use metrics::counter;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capabilities::{GeolocationError, Geolocator, PositionOptions};
use crate::model::{LatLon, TripId};

/// Receives each successful periodic fix.
#[async_trait]
pub trait LocationSink: Send + Sync {
    async fn on_sample(&self, location: LatLon);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicStart {
    Started,
    AlreadyRunning,
    /// A timer for another trip was cancelled in favour of this one.
    Replaced,
}

struct PeriodicTask {
    trip_id: TripId,
    handle: JoinHandle<()>,
}

pub struct LocationProbe {
    geolocator: Arc<dyn Geolocator>,
    options: PositionOptions,
    periodic: Mutex<Option<PeriodicTask>>,
}

impl LocationProbe {
    #[must_use]
    pub fn new(geolocator: Arc<dyn Geolocator>, options: PositionOptions) -> Self {
        Self {
            geolocator,
            options,
            periodic: Mutex::new(None),
        }
    }

    /// Single high-accuracy fix. Every failure degrades to `None`.
    pub async fn get_once(&self) -> Option<LatLon> {
        sample(self.geolocator.as_ref(), self.options).await.ok()
    }

    /// Starts the repeating probe for `trip_id`. The first sample is taken one
    /// full interval after the call.
    pub fn start_periodic(
        &self,
        trip_id: &TripId,
        interval: Duration,
        sink: Arc<dyn LocationSink>,
    ) -> PeriodicStart {
        let mut periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());

        let outcome = match periodic.as_ref() {
            Some(task) if task.trip_id == *trip_id && !task.handle.is_finished() => {
                return PeriodicStart::AlreadyRunning;
            }
            Some(task) => {
                task.handle.abort();
                info!(old_trip = %task.trip_id, new_trip = %trip_id, "replacing periodic location probe");
                PeriodicStart::Replaced
            }
            None => PeriodicStart::Started,
        };

        let geolocator = Arc::clone(&self.geolocator);
        let options = self.options;
        let task_trip = trip_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match sample(geolocator.as_ref(), options).await {
                    Ok(location) => sink.on_sample(location).await,
                    Err(_) => {
                        counter!("location.samples_skipped").increment(1);
                        debug!(trip_id = %task_trip, "periodic sample skipped");
                    }
                }
            }
        });

        info!(trip_id = %trip_id, ?interval, "periodic location probe started");
        *periodic = Some(PeriodicTask {
            trip_id: trip_id.clone(),
            handle,
        });
        outcome
    }

    /// Returns whether a probe was running.
    pub fn stop_periodic(&self) -> bool {
        let mut periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        match periodic.take() {
            Some(task) => {
                task.handle.abort();
                info!(trip_id = %task.trip_id, "periodic location probe stopped");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn periodic_trip(&self) -> Option<TripId> {
        let periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        periodic
            .as_ref()
            .filter(|task| !task.handle.is_finished())
            .map(|task| task.trip_id.clone())
    }

    #[must_use]
    pub fn is_periodic_running(&self) -> bool {
        self.periodic_trip().is_some()
    }
}

impl Drop for LocationProbe {
    fn drop(&mut self) {
        let periodic = self.periodic.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = periodic.take() {
            task.handle.abort();
        }
    }
}

#[derive(Debug)]
enum SampleError {
    Provider(GeolocationError),
    Elapsed,
}

async fn sample(geolocator: &dyn Geolocator, options: PositionOptions) -> Result<LatLon, SampleError> {
    // The provider gets a little longer than its own deadline to report it.
    let bound = options.timeout + Duration::from_millis(500);
    let result = match tokio::time::timeout(bound, geolocator.current_position(options)).await {
        Ok(Ok(position)) => Ok(position.coords),
        Ok(Err(e)) => Err(SampleError::Provider(e)),
        Err(_) => Err(SampleError::Elapsed),
    };

    if let Err(e) = &result {
        match e {
            SampleError::Provider(GeolocationError::PermissionDenied) => {
                warn!("location permission denied, continuing without position");
            }
            SampleError::Provider(e) => warn!(error = %e, "location unavailable"),
            SampleError::Elapsed => warn!(timeout = ?bound, "location provider did not answer"),
        }
    }
    result
}
