use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

fn write_frame(writer: &mut impl Write, commit: &Commit) -> io::Result<()> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact commit, or `None` at the end of the log or at the first torn
/// or corrupt frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Commit>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

/// Append-only plan log.
///
/// Each frame is `[u32 le: len][bincode Commit][u32 le: crc32 of payload]`.
/// A commit carries every event of one mutation, so a frame torn by a crash
/// loses that mutation whole. Replay stops at the first bad frame.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Buffer one commit. Nothing is durable until `flush_sync`, which lets the
    /// writer task group several commits behind one fsync.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        write_frame(&mut self.writer, commit)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted log next to `path`. Does not touch the live log.
    pub fn write_compact_file(path: &Path, commits: &[Commit]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for commit in commits {
            write_frame(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted log over the live one and keep appending to it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact commit in log order. A missing file is an empty plan.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        let mut reader = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut commits = Vec::new();
        while let Some(commit) = read_frame(&mut reader)? {
            commits.push(commit);
        }
        Ok(commits)
    }
}
