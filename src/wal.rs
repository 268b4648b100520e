use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one framed event. `Ok(None)` on clean EOF, a torn tail, or a bad checksum.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [&mut payload[..], &mut crc_buf[..]] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
    }

    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

/// Per-tenant append-only log of committed booking operations.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`.
/// A truncated or corrupt tail (crash mid-write) ends replay; everything
/// before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch(std::iter::once(event))
    }

    /// Write and fsync a group of events. On failure the log is cut back to
    /// where the batch began: either every event in it is durable or none is.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        let start = self.writer.get_ref().metadata()?.len();
        let appended_before = self.appends_since_compact;
        let mut result = Ok(());
        for event in events {
            result = self.append_buffered(event);
            if result.is_err() {
                break;
            }
        }
        let result = result.and_then(|()| self.flush_sync());
        if let Err(e) = result {
            self.appends_since_compact = appended_before;
            if let Err(rollback) = self.truncate_to(start) {
                tracing::error!(
                    "WAL {}: could not roll back failed batch to {start} bytes: {rollback}",
                    self.path.display()
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Buffer an event; durable only after the next `flush_sync()`.
    fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Drop everything past `len` bytes, buffered or on disk.
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // Swap before dropping: a dropped BufWriter flushes its buffer.
        let (_, _discarded) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        self.writer.get_ref().set_len(len)?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All valid events in the log. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = decode_event(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceFlag, ResourceKind};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn vehicle(name: &str) -> Event {
        Event::ResourceRegistered {
            id: Ulid::new(),
            kind: ResourceKind::Vehicle,
            name: Some(name.into()),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            vehicle("Corolla"),
            Event::CustomerRegistered {
                id: Ulid::new(),
                name: "Ana".into(),
                phone: Some("+351 900 000 000".into()),
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_drops_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = vehicle("Hilux");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::ResourceFlagged {
            id: Ulid::new(),
            flag: Some(ResourceFlag::Maintenance),
        };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let keep = vehicle("Transit");
        let later = vehicle("Sprinter");
        {
            let mut wal = Wal::open(&path).unwrap();
            for i in 0..20 {
                wal.append(&vehicle(&format!("churn {i}"))).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, later]);
    }

    #[test]
    fn buffered_appends_count_until_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| vehicle(&format!("V{i}"))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn batch_lands_in_order() {
        let path = tmp_path("batch.wal");
        let events: Vec<Event> = (0..4).map(|i| vehicle(&format!("B{i}"))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_batch(&events).unwrap();
            assert_eq!(wal.appends_since_compact(), 4);
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn truncate_discards_written_and_buffered_tail() {
        let path = tmp_path("truncate.wal");
        let kept = vec![vehicle("Yaris"), vehicle("Polo")];
        let later = vehicle("Golf");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_batch(&kept).unwrap();
            let start = fs::metadata(&path).unwrap().len();

            // One record reaches disk, another is still buffered: both go.
            wal.append_buffered(&vehicle("flushed")).unwrap();
            wal.flush_sync().unwrap();
            wal.append_buffered(&vehicle("buffered")).unwrap();
            wal.truncate_to(start).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), start);

            wal.append(&later).unwrap();
        }
        let mut expected = kept;
        expected.push(later);
        assert_eq!(Wal::replay(&path).unwrap(), expected);
    }
}
