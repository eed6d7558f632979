use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a single record to [len][bincode][crc32] format. Returns the bytes written.
fn encode_record<R: Serialize>(writer: &mut impl Write, record: &R) -> io::Result<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(RECORD_OVERHEAD + u64::from(len))
}

/// Length prefix plus CRC trailer.
const RECORD_OVERHEAD: u64 = 8;

/// Append-only write-ahead log of `R` records.
///
/// Format per entry: `[u32: len][bincode: R][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded on replay via length-prefix + CRC check,
///   and cut off by [`Wal::recover`] before the file is reopened for appends.
pub struct Wal<R> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length covered by the last successful `flush_sync`.
    synced_len: u64,
    pending_bytes: u64,
    pending_records: u64,
    /// Set when a failed batch could not be cut back off the file.
    poisoned: bool,
    _record: PhantomData<fn(R)>,
}

/// Records read back from disk, and where the intact prefix ends.
struct Replay<R> {
    records: Vec<R>,
    intact_len: u64,
}

impl<R: Serialize + DeserializeOwned> Wal<R> {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            pending_bytes: 0,
            pending_records: 0,
            poisoned: false,
            _record: PhantomData,
        })
    }

    /// Replay the log, cut any torn or corrupt tail off the file, then open it
    /// for appends. New records always follow the last intact one.
    pub fn recover(path: &Path) -> io::Result<(Vec<R>, Self)> {
        let replay = Self::replay_intact(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > replay.intact_len
        {
            tracing::warn!(
                path = %path.display(),
                discarded = meta.len() - replay.intact_len,
                "truncating WAL after last intact entry"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.intact_len)?;
            file.sync_all()?;
        }
        let wal = Self::open(path)?;
        Ok((replay.records, wal))
    }

    /// Append and fsync one record. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, record: &R) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Buffer a record without flushing. Durable only after `flush_sync()`.
    pub fn append_buffered(&mut self, record: &R) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL unusable until compaction after a failed rollback"));
        }
        self.pending_bytes += encode_record(&mut self.writer, record)?;
        self.pending_records += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.pending_bytes;
        self.pending_bytes = 0;
        self.pending_records = 0;
        Ok(())
    }

    /// Throw away everything appended since the last successful `flush_sync`,
    /// whether it is still buffered or already reached the file. If the file
    /// cannot be cut back, every later append fails until the next compaction.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.truncate_to_synced();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the unwritten buffer instead of flushing it on drop.
        let _ = stale.into_parts();
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_records);
        self.pending_bytes = 0;
        self.pending_records = 0;
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, records: &[R]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp snapshot over the WAL and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = stale.into_parts();
        self.appends_since_compact = 0;
        self.pending_bytes = 0;
        self.pending_records = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[R]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact record from disk. Replay stops at the first torn or
    /// corrupt entry; everything after it is ignored.
    pub fn replay(path: &Path) -> io::Result<Vec<R>> {
        Ok(Self::replay_intact(path)?.records)
    }

    fn replay_intact(path: &Path) -> io::Result<Replay<R>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    records: Vec::new(),
                    intact_len: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut intact_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            if !read_entry_part(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            if !read_entry_part(&mut reader, &mut payload)? {
                tracing::warn!(path = %path.display(), "discarding torn WAL entry");
                break;
            }

            let mut crc_buf = [0u8; 4];
            if !read_entry_part(&mut reader, &mut crc_buf)? {
                tracing::warn!(path = %path.display(), "discarding torn WAL entry");
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!(path = %path.display(), entry = records.len(), "WAL checksum mismatch, stopping replay");
                break;
            }

            match bincode::deserialize::<R>(&payload) {
                Ok(record) => {
                    records.push(record);
                    intact_len += RECORD_OVERHEAD + len as u64;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), entry = records.len(), "undecodable WAL entry: {e}");
                    break;
                }
            }
        }

        Ok(Replay { records, intact_len })
    }
}

/// Fill `buf` completely. Ok(false) on a clean or torn EOF.
fn read_entry_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
