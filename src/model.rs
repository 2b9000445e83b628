use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::*;

/// Unix milliseconds, the internal time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `[start, start + minutes)`.
    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + Ms::from(minutes) * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

pub fn to_ms(t: DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

pub fn from_ms(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// A doctor and the daily window they take appointments in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Ulid,
    pub name: String,
    pub specialization: String,
    pub working_start: NaiveTime,
    pub working_end: NaiveTime,
}

impl Doctor {
    pub fn new(
        id: Ulid,
        name: String,
        specialization: String,
        working_start: NaiveTime,
        working_end: NaiveTime,
    ) -> Result<Self, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidArgument("doctor name is empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("doctor name too long"));
        }
        if specialization.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("specialization too long"));
        }
        if working_start >= working_end {
            return Err(EngineError::InvalidArgument(format!(
                "working hours {working_start}..{working_end} are empty"
            )));
        }
        Ok(Self {
            id,
            name,
            specialization,
            working_start,
            working_end,
        })
    }

    /// `[date + working_start, date + working_end)`, read as UTC.
    pub fn working_window(&self, date: NaiveDate) -> Span {
        let start = date.and_time(self.working_start).and_utc().timestamp_millis();
        let end = date.and_time(self.working_end).and_utc().timestamp_millis();
        Span::new(start, end)
    }
}

/// The caller-controlled part of an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentFields {
    pub appointment_type: String,
    pub patient_name: String,
    pub notes: Option<String>,
}

/// An admitted appointment as the doctor state stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booked {
    pub id: Ulid,
    pub span: Span,
    pub fields: AppointmentFields,
}

impl Booked {
    pub fn to_appointment(&self, doctor_id: Ulid) -> Appointment {
        Appointment {
            id: self.id,
            doctor_id,
            start: from_ms(self.span.start),
            duration_minutes: (self.span.duration_ms() / MINUTE_MS) as u32,
            appointment_type: self.fields.appointment_type.clone(),
            patient_name: self.fields.patient_name.clone(),
            notes: self.fields.notes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub appointment_type: String,
    pub patient_name: String,
    pub notes: Option<String>,
}

impl Appointment {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::minutes(i64::from(self.duration_minutes))
    }

    pub fn span(&self) -> Span {
        Span::from_minutes(to_ms(self.start), self.duration_minutes)
    }
}

#[derive(Debug, Clone)]
pub struct DoctorState {
    pub doctor: Doctor,
    /// Admitted appointments, sorted by `span.start`.
    pub appointments: Vec<Booked>,
}

impl DoctorState {
    pub fn new(doctor: Doctor) -> Self {
        Self {
            doctor,
            appointments: Vec::new(),
        }
    }

    /// Insert appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, booked: Booked) {
        let pos = self
            .appointments
            .binary_search_by_key(&booked.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, booked);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Booked> {
        let pos = self.appointments.iter().position(|b| b.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booked> {
        self.appointments.iter().find(|b| b.id == id)
    }

    /// Return only appointments whose span overlaps the query window.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booked> {
        let right_bound = self
            .appointments
            .partition_point(|b| b.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// WAL record payload. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DoctorRegistered {
        doctor: Doctor,
    },
    AppointmentBooked {
        id: Ulid,
        doctor_id: Ulid,
        span: Span,
        fields: AppointmentFields,
    },
    AppointmentUpdated {
        id: Ulid,
        doctor_id: Ulid,
        span: Span,
        fields: AppointmentFields,
    },
    AppointmentCancelled {
        id: Ulid,
        doctor_id: Ulid,
    },
}

// ── Text formats ─────────────────────────────────────────────────

pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| EngineError::InvalidArgument(format!("bad date '{s}': {e}")))
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, EngineError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| EngineError::InvalidArgument(format!("bad time of day '{s}': {e}")))
}

/// RFC 3339 instant, e.g. `2025-03-10T09:00:00Z`.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::InvalidArgument(format!("bad instant '{s}': {e}")))
}

pub fn format_slot(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booked(start: Ms, end: Ms) -> Booked {
        Booked {
            id: Ulid::new(),
            span: Span::new(start, end),
            fields: AppointmentFields {
                appointment_type: "checkup".into(),
                patient_name: "Ada".into(),
                notes: None,
            },
        }
    }

    fn doctor() -> Doctor {
        Doctor::new(
            Ulid::new(),
            "Dr. Grey".into(),
            "cardiology".into(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_is_half_open() {
        let m = MINUTE_MS;
        assert!(!Span::new(0, 30 * m).overlaps(&Span::new(30 * m, 60 * m)));
        assert!(Span::new(0, 30 * m).overlaps(&Span::new(29 * m, 59 * m)));
    }

    #[test]
    fn span_overlap_is_symmetric() {
        let spans = [
            Span::new(0, 10),
            Span::new(5, 15),
            Span::new(10, 20),
            Span::new(0, 100),
            Span::new(50, 51),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
            assert!(a.overlaps(a));
        }
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn span_from_minutes() {
        let s = Span::from_minutes(1_000, 30);
        assert_eq!(s.end, 1_000 + 30 * MINUTE_MS);
    }

    #[test]
    fn doctor_rejects_empty_working_hours() {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let r = Doctor::new(Ulid::new(), "Dr. No".into(), "gp".into(), nine, nine);
        assert!(matches!(r, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn doctor_rejects_blank_name() {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        let r = Doctor::new(Ulid::new(), "  ".into(), "gp".into(), nine, ten);
        assert!(matches!(r, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn working_window_on_date() {
        let d = doctor();
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let w = d.working_window(date);
        let expected_start = parse_instant("2025-03-10T09:00:00Z").unwrap();
        assert_eq!(w.start, to_ms(expected_start));
        assert_eq!(w.duration_ms(), 8 * 60 * MINUTE_MS);
    }

    #[test]
    fn booked_roundtrips_to_appointment() {
        let start = to_ms(parse_instant("2025-03-10T09:00:00Z").unwrap());
        let b = booked(start, start + 45 * MINUTE_MS);
        let doctor_id = Ulid::new();
        let a = b.to_appointment(doctor_id);
        assert_eq!(a.doctor_id, doctor_id);
        assert_eq!(a.duration_minutes, 45);
        assert_eq!(a.span(), b.span);
        assert_eq!(a.end(), parse_instant("2025-03-10T09:45:00Z").unwrap());
    }

    #[test]
    fn appointments_stay_sorted() {
        let mut ds = DoctorState::new(doctor());
        ds.insert_appointment(booked(300, 400));
        ds.insert_appointment(booked(100, 200));
        ds.insert_appointment(booked(200, 300));
        let starts: Vec<Ms> = ds.appointments.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut ds = DoctorState::new(doctor());
        ds.insert_appointment(booked(100, 200));
        assert!(ds.remove_appointment(Ulid::new()).is_none());
        assert_eq!(ds.appointments.len(), 1);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ds = DoctorState::new(doctor());
        ds.insert_appointment(booked(100, 200));
        ds.insert_appointment(booked(450, 600));
        ds.insert_appointment(booked(1000, 1100));

        let hits: Vec<_> = ds.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ds = DoctorState::new(doctor());
        ds.insert_appointment(booked(100, 200));
        assert_eq!(ds.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn parse_text_formats() {
        assert_eq!(
            parse_date("2025-03-10").unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
        );
        assert!(matches!(parse_date("2025-13-40"), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(parse_date("tomorrow"), Err(EngineError::InvalidArgument(_))));
        assert_eq!(
            parse_time_of_day("09:30").unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap()
        );
        assert_eq!(
            parse_time_of_day("17:00:00").unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap()
        );
        assert!(parse_instant("2025-03-10 09:00").is_err());
        assert_eq!(format_slot(NaiveTime::from_hms_opt(9, 5, 0).unwrap()), "09:05");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::DoctorRegistered { doctor: doctor() };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
