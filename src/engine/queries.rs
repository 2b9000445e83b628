use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, Scheduler};

impl Scheduler {
    /// Add a doctor built with [`Doctor::new`]. Ids must be unique.
    pub async fn register_doctor(&self, doctor: Doctor) -> Result<Doctor, EngineError> {
        let doctor = self.store.register_doctor(doctor, self.deadline()).await?;
        info!(
            "registered doctor {} ({}) {}..{}",
            doctor.id, doctor.name, doctor.working_start, doctor.working_end
        );
        Ok(doctor)
    }

    pub async fn doctor(&self, id: Ulid) -> Result<Doctor, EngineError> {
        self.store.get_doctor(id, self.deadline()).await
    }

    pub async fn doctors(&self) -> Result<Vec<Doctor>, EngineError> {
        self.store.list_doctors(self.deadline()).await
    }

    pub async fn appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.store.get_appointment(id, self.deadline()).await
    }

    /// A doctor's appointments overlapping `window`, ascending by start.
    /// Without a window every appointment is returned.
    pub async fn appointments(
        &self,
        doctor_id: Ulid,
        window: Option<Span>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let window =
            window.unwrap_or_else(|| Span::new(MIN_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS));
        if window.start >= window.end {
            return Err(EngineError::InvalidArgument("empty query window".into()));
        }
        self.store
            .list_appointments(doctor_id, window, self.deadline())
            .await
    }
}
