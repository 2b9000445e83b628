mod booking;
pub mod conflict;
mod error;
mod queries;
mod slots;

pub use booking::{AppointmentUpdate, BookingRequest};
pub use conflict::{conflict, find_conflict};
pub use error::EngineError;
pub use slots::generate_slots;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::model::*;
use crate::store::Store;

/// What to do with a booking that falls outside the doctor's working window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingHoursPolicy {
    /// Accept it; only slot listing is bounded by working hours.
    Allow,
    /// Reject it with `InvalidArgument`.
    Reject,
}

impl FromStr for WorkingHoursPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "allow" => Ok(WorkingHoursPolicy::Allow),
            "reject" => Ok(WorkingHoursPolicy::Reject),
            other => Err(EngineError::InvalidArgument(format!(
                "unknown working hours policy: {other} (expected allow or reject)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Default slot granularity in minutes.
    pub slot_minutes: u32,
    /// Budget for every store round-trip made by one operation.
    pub store_timeout: Duration,
    pub working_hours: WorkingHoursPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slot_minutes: 30,
            store_timeout: Duration::from_secs(5),
            working_hours: WorkingHoursPolicy::Allow,
        }
    }
}

/// Entry point for slot queries and booking admission.
///
/// Holds no appointment state of its own: everything shared lives behind the
/// injected [`Store`], so a `Scheduler` is cheap to clone into every request
/// handler.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Same store, different per-operation deadline.
    pub fn with_timeout(&self, store_timeout: Duration) -> Self {
        Self {
            store: self.store.clone(),
            config: SchedulerConfig {
                store_timeout,
                ..self.config.clone()
            },
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.store_timeout
    }

    fn check_working_hours(&self, doctor: &Doctor, span: &Span) -> Result<(), EngineError> {
        if self.config.working_hours == WorkingHoursPolicy::Allow {
            return Ok(());
        }
        let date = from_ms(span.start).date_naive();
        if doctor.working_window(date).contains_span(span) {
            Ok(())
        } else {
            Err(EngineError::InvalidArgument(format!(
                "appointment outside working hours {}..{} of doctor {}",
                doctor.working_start, doctor.working_end, doctor.id
            )))
        }
    }
}
