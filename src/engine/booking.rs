use chrono::{DateTime, Utc};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflict, validate_span};
use super::{EngineError, Scheduler};

/// A request to admit one new appointment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub doctor_id: Ulid,
    pub start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub appointment_type: String,
    pub patient_name: String,
    pub notes: Option<String>,
}

/// Partial change to an existing appointment. `None` keeps the current value;
/// `notes: Some(None)` clears the notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentUpdate {
    pub start: Option<DateTime<Utc>>,
    pub duration_minutes: Option<u32>,
    pub appointment_type: Option<String>,
    pub patient_name: Option<String>,
    pub notes: Option<Option<String>>,
}

impl AppointmentUpdate {
    pub fn is_empty(&self) -> bool {
        self == &AppointmentUpdate::default()
    }

    fn merge(self, current: &Appointment) -> (DateTime<Utc>, u32, AppointmentFields) {
        let fields = AppointmentFields {
            appointment_type: self
                .appointment_type
                .unwrap_or_else(|| current.appointment_type.clone()),
            patient_name: self
                .patient_name
                .unwrap_or_else(|| current.patient_name.clone()),
            notes: self.notes.unwrap_or_else(|| current.notes.clone()),
        };
        (
            self.start.unwrap_or(current.start),
            self.duration_minutes.unwrap_or(current.duration_minutes),
            fields,
        )
    }
}

fn validate_duration(minutes: u32) -> Result<(), EngineError> {
    if minutes == 0 {
        return Err(EngineError::InvalidArgument("duration must be positive".into()));
    }
    if minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

fn validate_patient_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidArgument("patient name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("patient name too long"));
    }
    Ok(())
}

fn validate_appointment_type(label: &str) -> Result<(), EngineError> {
    if label.trim().is_empty() {
        return Err(EngineError::InvalidArgument("appointment type is required".into()));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(EngineError::LimitExceeded("appointment type too long"));
    }
    Ok(())
}

fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

fn validate_fields(fields: &AppointmentFields) -> Result<(), EngineError> {
    validate_patient_name(&fields.patient_name)?;
    validate_appointment_type(&fields.appointment_type)?;
    validate_notes(fields.notes.as_deref())
}

/// Checks every field a patch sets, before the current appointment is read.
fn validate_patch(patch: &AppointmentUpdate) -> Result<(), EngineError> {
    if let Some(minutes) = patch.duration_minutes {
        validate_duration(minutes)?;
    }
    if let Some(ref name) = patch.patient_name {
        validate_patient_name(name)?;
    }
    if let Some(ref label) = patch.appointment_type {
        validate_appointment_type(label)?;
    }
    if let Some(ref notes) = patch.notes {
        validate_notes(notes.as_deref())?;
    }
    Ok(())
}

/// Step 1 of admission: everything that can be rejected without the store.
fn validate_request(
    start: DateTime<Utc>,
    duration_minutes: u32,
    fields: &AppointmentFields,
) -> Result<Span, EngineError> {
    validate_duration(duration_minutes)?;
    validate_fields(fields)?;
    let span = Span::from_minutes(to_ms(start), duration_minutes);
    validate_span(&span)?;
    Ok(span)
}

impl Scheduler {
    /// Validate and admit a new appointment.
    ///
    /// The read-then-decide pre-check only rejects early; the store's
    /// conditional insert repeats it atomically, and a conflict found there is
    /// reported exactly like one found here.
    pub async fn book(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        let fields = AppointmentFields {
            appointment_type: req.appointment_type,
            patient_name: req.patient_name,
            notes: req.notes,
        };
        let span = validate_request(req.start, req.duration_minutes, &fields)?;

        let deadline = self.deadline();
        let doctor = self.store.get_doctor(req.doctor_id, deadline).await?;
        self.check_working_hours(&doctor, &span)?;

        let known = self
            .store
            .list_appointments(doctor.id, span, deadline)
            .await?;
        if let Some(hit) = find_conflict(&span, known.iter().map(|a| (a.id, a.span())), None) {
            return Err(self.rejected(doctor.id, hit));
        }

        match self
            .store
            .create_appointment_if_free(doctor.id, span, fields, deadline)
            .await
        {
            Ok(appointment) => {
                info!(
                    "booked {} for doctor {} at {} ({} min)",
                    appointment.id, doctor.id, appointment.start, appointment.duration_minutes
                );
                metrics::counter!(crate::observability::BOOKINGS_ADMITTED_TOTAL).increment(1);
                Ok(appointment)
            }
            Err(EngineError::Conflict(hit)) => {
                debug!("doctor {}: conditional insert lost to {hit}", doctor.id);
                Err(self.rejected(doctor.id, hit))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply `patch` to appointment `id`, re-validating the result against the
    /// doctor's other appointments.
    pub async fn update(
        &self,
        id: Ulid,
        patch: AppointmentUpdate,
    ) -> Result<Appointment, EngineError> {
        validate_patch(&patch)?;

        let deadline = self.deadline();
        let current = self.store.get_appointment(id, deadline).await?;
        if patch.is_empty() {
            return Ok(current);
        }
        let (start, duration_minutes, fields) = patch.merge(&current);
        let span = validate_request(start, duration_minutes, &fields)?;

        let doctor = self.store.get_doctor(current.doctor_id, deadline).await?;
        self.check_working_hours(&doctor, &span)?;

        let known = self
            .store
            .list_appointments(doctor.id, span, deadline)
            .await?;
        if let Some(hit) = find_conflict(&span, known.iter().map(|a| (a.id, a.span())), Some(id)) {
            return Err(self.rejected(doctor.id, hit));
        }

        match self
            .store
            .update_appointment_if_free(id, doctor.id, span, fields, deadline)
            .await
        {
            Ok(appointment) => {
                info!(
                    "updated {id} for doctor {} to {} ({} min)",
                    doctor.id, appointment.start, appointment.duration_minutes
                );
                Ok(appointment)
            }
            Err(EngineError::Conflict(hit)) => Err(self.rejected(doctor.id, hit)),
            Err(e) => Err(e),
        }
    }

    /// Cancel an appointment. Unknown ids are `NotFound`.
    pub async fn cancel(&self, id: Ulid) -> Result<(), EngineError> {
        let doctor_id = self.store.delete_appointment(id, self.deadline()).await?;
        info!("cancelled {id} for doctor {doctor_id}");
        Ok(())
    }

    fn rejected(&self, doctor_id: Ulid, hit: Ulid) -> EngineError {
        debug!("doctor {doctor_id}: request conflicts with {hit}");
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
        EngineError::Conflict(hit)
    }
}
