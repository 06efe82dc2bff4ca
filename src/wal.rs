use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frames larger than this are treated as corruption rather than allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode one event as `[u32 len][bincode payload][u32 crc32]`, little endian.
fn encode_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL frame"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Frame {
    Event(Event, u64),
    End,
    /// Short read, bad CRC or undecodable payload. Everything from here on
    /// is dropped.
    Torn,
}

/// Fill `buf` completely, or report how far we got before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Torn),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Torn);
    }

    let mut body = vec![0u8; len + 4];
    if read_full(reader, &mut body)? < body.len() {
        return Ok(Frame::Torn);
    }
    let (payload, crc_bytes) = body.split_at(len);
    let mut crc_buf = [0u8; 4];
    crc_buf.copy_from_slice(crc_bytes);
    if crc32fast::hash(payload) != u32::from_le_bytes(crc_buf) {
        return Ok(Frame::Torn);
    }
    match bincode::deserialize::<Event>(payload) {
        Ok(event) => Ok(Frame::Event(event, 8 + len as u64)),
        Err(_) => Ok(Frame::Torn),
    }
}

/// What a WAL file holds: every intact event up to the first torn frame.
#[derive(Debug, Default)]
pub struct Recovered {
    pub events: Vec<Event>,
    /// Byte length of the intact prefix.
    pub valid_len: u64,
    /// Bytes after the intact prefix; a crash mid-write leaves some.
    pub discarded: u64,
}

/// Append-only write-ahead log of [`Event`]s.
///
/// Appends are buffered and made durable by [`Wal::flush_sync`], which the
/// group-commit writer calls once per batch. Compaction writes a sibling
/// `.wal.tmp` file and renames it over the log.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Read every intact event. A missing file is an empty log.
    pub fn recover(path: &Path) -> io::Result<Recovered> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Recovered::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut out = Recovered::default();
        while let Frame::Event(event, size) = read_frame(&mut reader)? {
            out.events.push(event);
            out.valid_len += size;
        }
        out.discarded = total - out.valid_len;
        Ok(out)
    }

    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::recover(path)?.events)
    }

    /// Open the log for appending, first cutting it back to `valid_len` so
    /// new frames never land behind a torn one.
    pub fn open(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                "truncating torn WAL tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one frame. Not durable until [`Wal::flush_sync`].
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a full replacement log next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        for event in events {
            encode_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the replacement over the log and continue appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tourdesk_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn location(name: &str) -> Event {
        Event::LocationRegistered { id: Ulid::new(), name: name.into() }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![location("Harbour"), Event::CategoryRemoved { id: Ulid::new() }];
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let recovered = Wal::recover(&path).unwrap();
        assert_eq!(recovered.events, events);
        assert_eq!(recovered.discarded, 0);
        assert_eq!(recovered.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = tmp_path("missing.wal");
        let recovered = Wal::recover(&path).unwrap();
        assert!(recovered.events.is_empty());
        assert_eq!(recovered.valid_len, 0);
    }

    #[test]
    fn torn_tail_is_discarded_and_truncated_on_open() {
        let path = tmp_path("torn_tail.wal");
        let first = location("Market");
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8; 6]).unwrap();
        }

        let recovered = Wal::recover(&path).unwrap();
        assert_eq!(recovered.events, vec![first.clone()]);
        assert_eq!(recovered.discarded, 6);

        // Without truncation this frame would sit behind the garbage.
        let second = location("Bridge");
        {
            let mut wal = Wal::open(&path, recovered.valid_len).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn bad_crc_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = location("Square");
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&location("Tower")).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn oversized_length_prefix_is_corruption() {
        let path = tmp_path("oversized.wal");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }
        let recovered = Wal::recover(&path).unwrap();
        assert!(recovered.events.is_empty());
        assert_eq!(recovered.discarded, 20);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact.wal");
        let keep = location("Fortress");
        {
            let mut wal = Wal::open(&path, 0).unwrap();
            for i in 0..20 {
                let id = Ulid::new();
                wal.append(&Event::CategoryRegistered { id, name: format!("c{i}") }).unwrap();
                wal.append(&Event::CategoryRemoved { id }).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();

            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            let after = fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

            wal.append(&location("Late")).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], keep);
        assert!(!Wal::tmp_path(&path).exists());
    }

    #[test]
    fn buffered_appends_need_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| location(&format!("L{i}"))).collect();
        let mut wal = Wal::open(&path, 0).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        assert!(Wal::replay(&path).unwrap().is_empty());
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
