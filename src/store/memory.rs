use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::conflict::check_no_conflict;
use crate::engine::EngineError;
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::writer::{wal_writer_loop, WalCommand};
use super::Store;

pub(crate) type SharedDoctor = Arc<RwLock<DoctorState>>;

/// In-process store: one lock per doctor, every mutation logged to the WAL
/// before it becomes visible.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    doctors: DashMap<Ulid, SharedDoctor>,
    /// appointment id -> doctor id
    appointment_to_doctor: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes registrations against each other and against compaction.
    registration: Arc<Mutex<()>>,
}

fn event_doctor_id(event: &Event) -> Ulid {
    match event {
        Event::DoctorRegistered { doctor } => doctor.id,
        Event::AppointmentBooked { doctor_id, .. }
        | Event::AppointmentUpdated { doctor_id, .. }
        | Event::AppointmentCancelled { doctor_id, .. } => *doctor_id,
    }
}

/// Apply an appointment event to its doctor. Caller holds the write lock.
fn apply_event(ds: &mut DoctorState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::DoctorRegistered { .. } => {}
        Event::AppointmentBooked {
            id,
            doctor_id,
            span,
            fields,
        } => {
            ds.insert_appointment(Booked {
                id: *id,
                span: *span,
                fields: fields.clone(),
            });
            index.insert(*id, *doctor_id);
        }
        Event::AppointmentUpdated {
            id,
            doctor_id,
            span,
            fields,
        } => {
            ds.remove_appointment(*id);
            ds.insert_appointment(Booked {
                id: *id,
                span: *span,
                fields: fields.clone(),
            });
            index.insert(*id, *doctor_id);
        }
        Event::AppointmentCancelled { id, .. } => {
            ds.remove_appointment(*id);
            index.remove(id);
        }
    }
}

/// Replay holds the log to the same no-overlap rule as a live write.
fn check_replayed(ds: &DoctorState, event: &Event) -> Result<(), EngineError> {
    match event {
        Event::AppointmentBooked { span, .. } => check_no_conflict(ds, span, None),
        Event::AppointmentUpdated { id, span, .. } => {
            if ds.get(*id).is_none() {
                return Err(EngineError::NotFound(*id));
            }
            check_no_conflict(ds, span, Some(*id))
        }
        Event::DoctorRegistered { .. } | Event::AppointmentCancelled { .. } => Ok(()),
    }
}

impl MemoryStore {
    /// Rebuild state from the WAL at `path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let appointment_to_doctor = DashMap::new();
        let mut replayed: HashMap<Ulid, DoctorState> = HashMap::new();
        let mut skipped = 0;
        for event in &events {
            if let Event::DoctorRegistered { doctor } = event {
                replayed.insert(doctor.id, DoctorState::new(doctor.clone()));
            } else if let Some(ds) = replayed.get_mut(&event_doctor_id(event)) {
                if let Err(e) = check_replayed(ds, event) {
                    warn!("skipping replayed event {event:?}: {e}");
                    skipped += 1;
                    continue;
                }
                apply_event(ds, event, &appointment_to_doctor);
            }
        }
        info!(
            "replayed {} events: {} doctors, {} appointments, {skipped} skipped",
            events.len(),
            replayed.len(),
            appointment_to_doctor.len()
        );

        let doctors = replayed
            .into_iter()
            .map(|(id, ds)| (id, Arc::new(RwLock::new(ds))))
            .collect();
        Ok(Self {
            inner: Arc::new(Inner {
                doctors,
                appointment_to_doctor,
                wal_tx,
                registration: Arc::new(Mutex::new(())),
            }),
        })
    }

    pub fn doctor_count(&self) -> usize {
        self.inner.doctors.len()
    }

    pub fn appointment_count(&self) -> usize {
        self.inner.appointment_to_doctor.len()
    }

    #[cfg(test)]
    pub(crate) fn doctor_cell(&self, id: Ulid) -> Option<SharedDoctor> {
        self.inner.doctors.get(&id).map(|e| e.value().clone())
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    ///
    /// Holds the registration lock and a read lock on every doctor until the
    /// rewrite lands, so no write can slip between the snapshot and the swap.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _registration = self.inner.registration.clone().lock_owned().await;
        let cells: Vec<SharedDoctor> = self
            .inner
            .doctors
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut guards = Vec::with_capacity(cells.len());
        for cell in cells {
            guards.push(cell.read_owned().await);
        }
        guards.sort_by_key(|g| g.doctor.id);

        let mut events = Vec::new();
        for ds in &guards {
            events.push(Event::DoctorRegistered {
                doctor: ds.doctor.clone(),
            });
            events.extend(ds.appointments.iter().map(|b| Event::AppointmentBooked {
                id: b.id,
                doctor_id: ds.doctor.id,
                span: b.span,
                fields: b.fields.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))
    }

    fn cell(&self, doctor_id: Ulid) -> Result<SharedDoctor, EngineError> {
        self.inner
            .doctors
            .get(&doctor_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(doctor_id))
    }

    fn doctor_of(&self, appointment_id: Ulid) -> Result<Ulid, EngineError> {
        self.inner
            .appointment_to_doctor
            .get(&appointment_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(appointment_id))
    }

    async fn read(
        &self,
        doctor_id: Ulid,
        deadline: Instant,
    ) -> Result<OwnedRwLockReadGuard<DoctorState>, EngineError> {
        let cell = self.cell(doctor_id)?;
        timeout_at(deadline, cell.read_owned())
            .await
            .map_err(|_| EngineError::Timeout)
    }

    async fn write(
        &self,
        doctor_id: Ulid,
        deadline: Instant,
    ) -> Result<OwnedRwLockWriteGuard<DoctorState>, EngineError> {
        let cell = self.cell(doctor_id)?;
        timeout_at(deadline, cell.write_owned())
            .await
            .map_err(|_| EngineError::Timeout)
    }

    /// Log `event`, then apply it under the already-held write lock.
    ///
    /// Runs on its own task: once started, a commit finishes even if the
    /// caller gives up, so the WAL and memory never disagree. The deadline is
    /// checked once more before anything is written.
    async fn commit(
        &self,
        mut guard: OwnedRwLockWriteGuard<DoctorState>,
        event: Event,
        deadline: Instant,
    ) -> Result<OwnedRwLockWriteGuard<DoctorState>, EngineError> {
        if Instant::now() >= deadline {
            return Err(EngineError::Timeout);
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.wal_append(&event).await?;
            apply_event(&mut guard, &event, &inner.appointment_to_doctor);
            Ok::<_, EngineError>(guard)
        })
        .await
        .map_err(|e| EngineError::Unavailable(format!("commit task failed: {e}")))?
    }
}

impl Inner {
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_doctor(&self, doctor: Doctor, deadline: Instant) -> Result<Doctor, EngineError> {
        let lock = self.inner.registration.clone();
        let registration = timeout_at(deadline, lock.lock_owned())
            .await
            .map_err(|_| EngineError::Timeout)?;
        if self.inner.doctors.contains_key(&doctor.id) {
            return Err(EngineError::AlreadyExists(doctor.id));
        }
        if self.inner.doctors.len() >= MAX_DOCTORS {
            return Err(EngineError::LimitExceeded("too many doctors"));
        }
        if Instant::now() >= deadline {
            return Err(EngineError::Timeout);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _registration = registration;
            inner
                .wal_append(&Event::DoctorRegistered {
                    doctor: doctor.clone(),
                })
                .await?;
            inner
                .doctors
                .insert(doctor.id, Arc::new(RwLock::new(DoctorState::new(doctor.clone()))));
            Ok::<_, EngineError>(doctor)
        })
        .await
        .map_err(|e| EngineError::Unavailable(format!("commit task failed: {e}")))?
    }

    async fn get_doctor(&self, id: Ulid, deadline: Instant) -> Result<Doctor, EngineError> {
        Ok(self.read(id, deadline).await?.doctor.clone())
    }

    async fn list_doctors(&self, deadline: Instant) -> Result<Vec<Doctor>, EngineError> {
        let ids: Vec<Ulid> = self.inner.doctors.iter().map(|e| *e.key()).collect();
        let mut doctors = Vec::with_capacity(ids.len());
        for id in ids {
            doctors.push(self.read(id, deadline).await?.doctor.clone());
        }
        doctors.sort_by_key(|d| d.id);
        Ok(doctors)
    }

    async fn list_appointments(
        &self,
        doctor_id: Ulid,
        window: Span,
        deadline: Instant,
    ) -> Result<Vec<Appointment>, EngineError> {
        let ds = self.read(doctor_id, deadline).await?;
        Ok(ds
            .overlapping(&window)
            .map(|b| b.to_appointment(doctor_id))
            .collect())
    }

    async fn get_appointment(&self, id: Ulid, deadline: Instant) -> Result<Appointment, EngineError> {
        let doctor_id = self.doctor_of(id)?;
        let ds = self.read(doctor_id, deadline).await?;
        ds.get(id)
            .map(|b| b.to_appointment(doctor_id))
            .ok_or(EngineError::NotFound(id))
    }

    async fn create_appointment_if_free(
        &self,
        doctor_id: Ulid,
        span: Span,
        fields: AppointmentFields,
        deadline: Instant,
    ) -> Result<Appointment, EngineError> {
        let guard = self.write(doctor_id, deadline).await?;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many appointments for doctor"));
        }
        check_no_conflict(&guard, &span, None)?;

        let id = Ulid::new();
        let event = Event::AppointmentBooked {
            id,
            doctor_id,
            span,
            fields,
        };
        let guard = self.commit(guard, event, deadline).await?;
        debug!("doctor {doctor_id}: admitted {id}, {} booked", guard.appointments.len());
        guard
            .get(id)
            .map(|b| b.to_appointment(doctor_id))
            .ok_or(EngineError::NotFound(id))
    }

    async fn update_appointment_if_free(
        &self,
        id: Ulid,
        doctor_id: Ulid,
        span: Span,
        fields: AppointmentFields,
        deadline: Instant,
    ) -> Result<Appointment, EngineError> {
        if self.doctor_of(id)? != doctor_id {
            return Err(EngineError::NotFound(id));
        }
        let guard = self.write(doctor_id, deadline).await?;
        if guard.get(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        check_no_conflict(&guard, &span, Some(id))?;

        let event = Event::AppointmentUpdated {
            id,
            doctor_id,
            span,
            fields,
        };
        let guard = self.commit(guard, event, deadline).await?;
        guard
            .get(id)
            .map(|b| b.to_appointment(doctor_id))
            .ok_or(EngineError::NotFound(id))
    }

    async fn delete_appointment(&self, id: Ulid, deadline: Instant) -> Result<Ulid, EngineError> {
        let doctor_id = self.doctor_of(id)?;
        let guard = self.write(doctor_id, deadline).await?;
        // A concurrent delete may have won while we waited for the lock.
        if guard.get(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.commit(guard, Event::AppointmentCancelled { id, doctor_id }, deadline)
            .await?;
        Ok(doctor_id)
    }
}
