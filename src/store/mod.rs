mod memory;
mod writer;

pub use memory::MemoryStore;

use async_trait::async_trait;
use tokio::time::Instant;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;

/// Persistence boundary of the scheduler.
///
/// Every call carries a deadline; an implementation that cannot finish by then
/// returns [`EngineError::Timeout`] and leaves its state untouched. The two
/// `*_if_free` writes are the linearization point for admission: they re-check
/// overlap and commit in one atomic step, so of several overlapping writes for
/// the same doctor at most one succeeds and the rest see `Conflict`.
#[async_trait]
pub trait Store: Send + Sync {
    /// `AlreadyExists` if the id is taken.
    async fn register_doctor(&self, doctor: Doctor, deadline: Instant) -> Result<Doctor, EngineError>;

    async fn get_doctor(&self, id: Ulid, deadline: Instant) -> Result<Doctor, EngineError>;

    async fn list_doctors(&self, deadline: Instant) -> Result<Vec<Doctor>, EngineError>;

    /// Appointments of `doctor_id` overlapping `window`, ascending by start.
    async fn list_appointments(
        &self,
        doctor_id: Ulid,
        window: Span,
        deadline: Instant,
    ) -> Result<Vec<Appointment>, EngineError>;

    async fn get_appointment(&self, id: Ulid, deadline: Instant) -> Result<Appointment, EngineError>;

    /// Insert a new appointment unless it overlaps an existing one.
    async fn create_appointment_if_free(
        &self,
        doctor_id: Ulid,
        span: Span,
        fields: AppointmentFields,
        deadline: Instant,
    ) -> Result<Appointment, EngineError>;

    /// Move or edit appointment `id` unless the new span overlaps another
    /// appointment of the same doctor.
    async fn update_appointment_if_free(
        &self,
        id: Ulid,
        doctor_id: Ulid,
        span: Span,
        fields: AppointmentFields,
        deadline: Instant,
    ) -> Result<Appointment, EngineError>;

    /// Remove appointment `id`, returning its doctor.
    async fn delete_appointment(&self, id: Ulid, deadline: Instant) -> Result<Ulid, EngineError>;
}
