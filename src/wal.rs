use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest payload a record may carry. Events are a few hundred bytes; a
/// length prefix beyond this can only come from a corrupt tail.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// Event log of the memory store.
///
/// One record per event: `[u32 le: len][bincode: Event][u32 le: crc32(payload)]`.
/// Records are appended into a buffer and made durable by `sync`, so a batch of
/// bookings costs one fsync. A torn tail left by a crash fails its length or
/// CRC check and replay stops there.
///
/// A batch whose `push` or `sync` fails must be undone with `rollback`, which
/// truncates the file back to the last successful sync. If that fails too the
/// log is poisoned and refuses further writes until a `rewrite` succeeds.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    /// File length as of the last successful `sync` or `rewrite`.
    durable_len: u64,
    pending_bytes: u64,
    pending_records: u64,
    records_since_compact: u64,
    poisoned: bool,
    #[cfg(test)]
    pub(crate) fail_syncs: u32,
}

/// Returns the number of bytes written.
fn write_record(out: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "record too large"));
    }
    let len = payload.len() as u32;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// `Ok(None)` at a clean end of file or a torn record.
fn read_exact_or_eof(input: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    match input.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_record(input: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if read_exact_or_eof(input, &mut word)?.is_none() {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_RECORD_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if read_exact_or_eof(input, &mut payload)?.is_none() {
        return Ok(None);
    }
    if read_exact_or_eof(input, &mut word)?.is_none() {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len,
            pending_bytes: 0,
            pending_records: 0,
            records_since_compact: 0,
            poisoned: false,
            #[cfg(test)]
            fail_syncs: 0,
        })
    }

    /// Buffer one record. Not durable until `sync`.
    pub fn push(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by a failed rollback"));
        }
        self.pending_bytes += write_record(&mut self.out, event)?;
        self.pending_records += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL poisoned by a failed rollback"));
        }
        self.out.flush()?;
        #[cfg(test)]
        if self.fail_syncs > 0 {
            self.fail_syncs -= 1;
            return Err(io::Error::other("injected fsync failure"));
        }
        self.out.get_ref().sync_all()?;
        self.durable_len += self.pending_bytes;
        self.records_since_compact += self.pending_records;
        self.pending_bytes = 0;
        self.pending_records = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.push(event)?;
        self.sync()
    }

    /// Discard every record pushed since the last successful `sync`, both the
    /// buffered bytes and whatever already reached the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.poisoned = true;
        let file = open_append(&self.path)?;
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        // into_parts drops the stale buffer without flushing it.
        let _ = std::mem::replace(&mut self.out, BufWriter::new(file)).into_parts();
        self.pending_bytes = 0;
        self.pending_records = 0;
        self.poisoned = false;
        Ok(())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Durable records since the last rewrite.
    pub fn records_since_compact(&self) -> u64 {
        self.records_since_compact
    }

    fn snapshot_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Replace the log with `events`: write a synced snapshot beside it, then
    /// rename it over the log and reopen for append. Clears a poisoned log.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp = self.snapshot_path();
        let mut len = 0;
        {
            let mut snap = BufWriter::new(File::create(&tmp)?);
            for event in events {
                len += write_record(&mut snap, event)?;
            }
            snap.flush()?;
            snap.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        let _ = std::mem::replace(&mut self.out, BufWriter::new(open_append(&self.path)?))
            .into_parts();
        self.durable_len = len;
        self.pending_bytes = 0;
        self.pending_records = 0;
        self.records_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    /// Every intact event in `path`, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut input = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_record(&mut input)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveTime;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn registered() -> Event {
        Event::DoctorRegistered {
            doctor: Doctor::new(
                Ulid::new(),
                "Dr. Grey".into(),
                "surgery".into(),
                NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            )
            .unwrap(),
        }
    }

    fn booked(doctor_id: Ulid) -> Event {
        Event::AppointmentBooked {
            id: Ulid::new(),
            doctor_id,
            span: Span::from_minutes(1_700_000_000_000, 30),
            fields: AppointmentFields {
                appointment_type: "checkup".into(),
                patient_name: "Ada".into(),
                notes: Some("first visit".into()),
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let doctor_id = Ulid::new();
        let events = vec![registered(), booked(doctor_id)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let event = registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::AppointmentCancelled {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
        };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rewrite_shrinks_and_accepts_appends() {
        let path = tmp_path("rewrite.wal");
        let reg = registered();
        let Event::DoctorRegistered { ref doctor } = reg else {
            unreachable!()
        };
        let doctor_id = doctor.id;

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&reg).unwrap();
        for _ in 0..20 {
            let b = booked(doctor_id);
            let Event::AppointmentBooked { id, .. } = b else {
                unreachable!()
            };
            wal.append(&b).unwrap();
            wal.append(&Event::AppointmentCancelled { id, doctor_id }).unwrap();
        }
        assert_eq!(wal.records_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        wal.rewrite(std::slice::from_ref(&reg)).unwrap();
        assert_eq!(wal.records_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let after = booked(doctor_id);
        wal.append(&after).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![reg, after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn pushed_records_land_after_sync() {
        let path = tmp_path("push_sync.wal");
        let events: Vec<Event> = (0..5).map(|_| registered()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.push(e).unwrap();
            }
            wal.sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_ends_replay() {
        let path = tmp_path("huge_prefix.wal");
        let event = registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_discards_flushed_but_unsynced_records() {
        let path = tmp_path("rollback.wal");
        let kept = registered();
        let doomed = booked(Ulid::new());
        let later = booked(Ulid::new());

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();

        wal.push(&doomed).unwrap();
        wal.fail_syncs = 1;
        assert!(wal.sync().is_err());
        // The failed sync already flushed the bytes to the file.
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone(), doomed]);

        wal.rollback().unwrap();
        assert!(!wal.is_poisoned());
        assert_eq!(wal.records_since_compact(), 1);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone()]);

        wal.append(&later).unwrap();
        assert_eq!(wal.records_since_compact(), 2);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_drops_buffered_records() {
        let path = tmp_path("rollback_buffered.wal");
        let kept = registered();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        wal.push(&booked(Ulid::new())).unwrap();
        wal.rollback().unwrap();
        wal.sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_resumes_after_existing_records() {
        let path = tmp_path("reopen_len.wal");
        let first = registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let second = booked(Ulid::new());
        let mut wal = Wal::open(&path).unwrap();
        wal.push(&second).unwrap();
        wal.fail_syncs = 1;
        assert!(wal.sync().is_err());
        wal.rollback().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        let _ = fs::remove_file(&path);
    }
}
