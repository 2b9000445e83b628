use chrono::{NaiveDate, NaiveTime};
use tracing::debug;
use ulid::Ulid;

use crate::limits::MAX_SLOT_MINUTES;
use crate::model::*;

use super::conflict::conflict;
use super::{EngineError, Scheduler};

/// Start times of the free `granularity`-minute slots in the doctor's working
/// window on `date`, ascending.
///
/// Candidates start at the window start and step by the granularity; a
/// candidate is kept iff it lies fully inside the window and overlaps none of
/// `booked`. A trailing remainder shorter than one slot is never offered.
pub fn generate_slots(
    doctor: &Doctor,
    date: NaiveDate,
    granularity_minutes: u32,
    booked: &[Span],
) -> Vec<NaiveTime> {
    let window = doctor.working_window(date);
    let step = Ms::from(granularity_minutes) * MINUTE_MS;
    if step <= 0 {
        return Vec::new();
    }

    let mut slots = Vec::new();
    let mut t = window.start;
    while t + step <= window.end {
        let candidate = Span::new(t, t + step);
        if window.contains_span(&candidate) && !conflict(&candidate, booked) {
            slots.push(from_ms(t).time());
        }
        t += step;
    }
    slots
}

impl Scheduler {
    /// Free slots for `doctor_id` on `date` (`YYYY-MM-DD`).
    pub async fn available_slots(
        &self,
        doctor_id: Ulid,
        date: &str,
        granularity_minutes: Option<u32>,
    ) -> Result<Vec<NaiveTime>, EngineError> {
        let date = parse_date(date)?;
        let granularity = granularity_minutes.unwrap_or(self.config.slot_minutes);
        if granularity == 0 {
            return Err(EngineError::InvalidArgument("slot granularity must be positive".into()));
        }
        if granularity > MAX_SLOT_MINUTES {
            return Err(EngineError::LimitExceeded("slot granularity too large"));
        }

        let deadline = self.deadline();
        let doctor = self.store.get_doctor(doctor_id, deadline).await?;
        let window = doctor.working_window(date);
        let booked: Vec<Span> = self
            .store
            .list_appointments(doctor_id, window, deadline)
            .await?
            .iter()
            .map(Appointment::span)
            .collect();

        let slots = generate_slots(&doctor, date, granularity, &booked);
        debug!(
            "doctor {doctor_id} on {date}: {} free of {} candidate slots",
            slots.len(),
            window.duration_ms() / (Ms::from(granularity) * MINUTE_MS)
        );
        metrics::counter!(crate::observability::SLOT_QUERIES_TOTAL).increment(1);
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn doctor(start: NaiveTime, end: NaiveTime) -> Doctor {
        Doctor::new(Ulid::new(), "Dr. Grey".into(), "gp".into(), start, end).unwrap()
    }

    fn at(h: u32, m: u32) -> Ms {
        date().and_time(hm(h, m)).and_utc().timestamp_millis()
    }

    fn render(slots: &[NaiveTime]) -> Vec<String> {
        slots.iter().map(|t| format_slot(*t)).collect()
    }

    #[test]
    fn empty_schedule_one_hour() {
        let d = doctor(hm(9, 0), hm(10, 0));
        let slots = generate_slots(&d, date(), 30, &[]);
        assert_eq!(render(&slots), vec!["09:00", "09:30"]);
    }

    #[test]
    fn first_slot_booked() {
        let d = doctor(hm(9, 0), hm(10, 0));
        let booked = [Span::new(at(9, 0), at(9, 30))];
        let slots = generate_slots(&d, date(), 30, &booked);
        assert_eq!(render(&slots), vec!["09:30"]);
    }

    #[test]
    fn appointment_ending_at_slot_start_leaves_slot_free() {
        let d = doctor(hm(9, 0), hm(10, 0));
        let booked = [Span::new(at(8, 30), at(9, 0))];
        let slots = generate_slots(&d, date(), 30, &booked);
        assert_eq!(render(&slots), vec!["09:00", "09:30"]);
    }

    #[test]
    fn partial_overlap_removes_both_touched_slots() {
        let d = doctor(hm(9, 0), hm(11, 0));
        let booked = [Span::new(at(9, 15), at(9, 45))];
        let slots = generate_slots(&d, date(), 30, &booked);
        assert_eq!(render(&slots), vec!["10:00", "10:30"]);
    }

    #[test]
    fn remainder_shorter_than_a_slot_is_dropped() {
        let d = doctor(hm(9, 0), hm(10, 45));
        let slots = generate_slots(&d, date(), 30, &[]);
        assert_eq!(render(&slots), vec!["09:00", "09:30", "10:00"]);
        let window = d.working_window(date());
        for s in &slots {
            let start = date().and_time(*s).and_utc().timestamp_millis();
            assert!(start + 30 * MINUTE_MS <= window.end);
        }
    }

    #[test]
    fn candidate_count_is_floor_of_window_over_granularity() {
        let d = doctor(hm(8, 0), hm(17, 0));
        for g in [5u32, 15, 20, 30, 45, 60, 90] {
            let slots = generate_slots(&d, date(), g, &[]);
            assert_eq!(slots.len() as u32, 9 * 60 / g, "granularity {g}");
        }
    }

    #[test]
    fn fully_booked_day_is_empty_not_error() {
        let d = doctor(hm(9, 0), hm(10, 0));
        let booked = [Span::new(at(9, 0), at(10, 0))];
        assert!(generate_slots(&d, date(), 30, &booked).is_empty());
    }

    #[test]
    fn output_is_ascending_and_unique() {
        let d = doctor(hm(9, 0), hm(12, 0));
        let booked = [Span::new(at(10, 0), at(10, 20)), Span::new(at(9, 40), at(10, 5))];
        let slots = generate_slots(&d, date(), 20, &booked);
        assert!(slots.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(render(&slots), vec!["09:00", "09:20", "10:20", "10:40", "11:00", "11:20", "11:40"]);
    }

    #[test]
    fn deterministic_for_same_input() {
        let d = doctor(hm(9, 0), hm(17, 0));
        let booked = [Span::new(at(12, 0), at(13, 0)), Span::new(at(9, 30), at(9, 45))];
        assert_eq!(
            generate_slots(&d, date(), 15, &booked),
            generate_slots(&d, date(), 15, &booked)
        );
    }

    #[test]
    fn appointments_on_other_days_are_ignored() {
        let d = doctor(hm(9, 0), hm(10, 0));
        let next_day = at(9, 0) + 24 * 60 * MINUTE_MS;
        let booked = [Span::new(next_day, next_day + 30 * MINUTE_MS)];
        assert_eq!(generate_slots(&d, date(), 30, &booked).len(), 2);
    }
}
