use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Change;

/// Upper bound on one record's payload. Anything larger is a corrupt length prefix.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode a single change to [len][bincode][crc32] format.
fn encode_change(writer: &mut impl Write, change: &Change) -> io::Result<()> {
    let payload =
        bincode::serialize(change).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Change][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
/// - A batch is written whole or not at all: on error the file is cut back
///   to the end of the last committed batch.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// File length after the last successful commit.
    committed_len: u64,
    appends_since_compact: u64,
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (file, committed_len) = open_append(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            committed_len,
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, change: &Change) -> io::Result<()> {
        self.append_batch([change])
    }

    /// Encode every change, then write and fsync them as one unit.
    /// Nothing reaches the file unless every record encoded.
    pub fn append_batch<'a>(&mut self, changes: impl IntoIterator<Item = &'a Change>) -> io::Result<()> {
        let mut buf = Vec::new();
        let mut count = 0u64;
        for change in changes {
            encode_change(&mut buf, change)?;
            count += 1;
        }
        if let Err(e) = self.write_committed(&buf) {
            self.rollback();
            return Err(e);
        }
        self.committed_len += buf.len() as u64;
        self.appends_since_compact += count;
        Ok(())
    }

    fn write_committed(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.file.sync_all()
    }

    /// Drop any bytes past the last committed batch.
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.committed_len).and_then(|()| self.file.sync_all()) {
            tracing::error!("failed to roll WAL back to {} bytes: {e}", self.committed_len);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log to a temp file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, changes: &[Change]) -> io::Result<()> {
        let file = File::create(path.with_extension("wal.tmp"))?;
        let mut writer = BufWriter::new(file);
        for change in changes {
            encode_change(&mut writer, change)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let (file, committed_len) = open_append(&self.path)?;
        self.file = file;
        self.committed_len = committed_len;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, changes: &[Change]) -> io::Result<()> {
        Self::write_compact_file(&self.path, changes)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay every intact record. Reading stops at the first truncated or
    /// corrupt record, which is how a crash mid-append shows up.
    pub fn replay(path: &Path) -> io::Result<Vec<Change>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut changes = Vec::new();
        while let Some(change) = read_record(&mut reader)? {
            changes.push(change);
        }
        Ok(changes)
    }
}

/// Fill `buf`, or report `false` on a clean or partial EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<Option<Change>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        tracing::warn!("WAL record claims {len} bytes, discarding tail");
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        tracing::warn!("WAL record failed CRC check, discarding tail");
        return Ok(None);
    }
    Ok(bincode::deserialize::<Change>(&payload).ok())
}
