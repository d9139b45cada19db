//! Journaled lineage table.
//!
//! [`FileLineageStore`] keeps the table in memory and persists it as a JSON
//! snapshot plus an append-only journal next to it. Every successful update
//! appends one frame holding only the members it added, so the cost of a
//! write does not depend on how large the table is. Opening replays the
//! journal over the snapshot, then folds it into a fresh snapshot;
//! [`FileLineageStore::save`] folds on demand.
//!
//! Journal frames use the same framing as the envelope log:
//!
//! ```text
//! [4 bytes: entry length (little-endian u32)]
//! [4 bytes: CRC32 of entry (little-endian u32)]
//! [N bytes: JSON journal entry]
//! ```
//!
//! A frame is appended before its update is installed in memory, so a failed
//! append changes neither. Each snapshot carries a generation that journal
//! entries repeat; entries from another generation are ignored on replay.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cask_store::SyncMode;
use cask_types::EnvelopeId;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{LineageError, LineageResult};
use crate::memory::InMemoryLineageStore;
use crate::traits::LineageStore;
use crate::types::{Lineage, LineageDelta};

const SNAPSHOT_FORMAT: u32 = 1;

/// Frame header: 4 bytes length + 4 bytes CRC.
const FRAME_HEADER: u64 = 8;

/// The journal belonging to the snapshot at `snapshot`.
pub fn journal_path_for(snapshot: &Path) -> PathBuf {
    snapshot.with_extension("journal")
}

#[derive(Deserialize)]
struct Snapshot {
    format: u32,
    #[serde(default)]
    generation: u64,
    lineages: Vec<Lineage>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    format: u32,
    generation: u64,
    lineages: &'a [Lineage],
}

#[derive(Serialize, Deserialize)]
struct JournalEntry {
    generation: u64,
    delta: LineageDelta,
}

struct Journal {
    file: File,
    end: u64,
    generation: u64,
}

/// A [`LineageStore`] persisted as a JSON snapshot and a delta journal.
pub struct FileLineageStore {
    path: PathBuf,
    journal_path: PathBuf,
    inner: InMemoryLineageStore,
    /// Held across append-and-install so the journal follows update order.
    journal: Mutex<Journal>,
    sync_mode: SyncMode,
}

impl FileLineageStore {
    /// Open the table whose snapshot lives at `path`, starting empty if
    /// neither the snapshot nor the journal exists.
    pub fn open(path: impl AsRef<Path>) -> LineageResult<Self> {
        Self::open_with(path, SyncMode::default())
    }

    pub fn open_with(path: impl AsRef<Path>, sync_mode: SyncMode) -> LineageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let journal_path = journal_path_for(&path);
        fs::create_dir_all(parent_dir(&path))?;

        let (generation, lineages) = load_snapshot(&path)?;
        let inner = InMemoryLineageStore::with_lineages(lineages);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&journal_path)?;
        let (entries, valid_end) = scan_journal(&journal_path)?;
        let file_len = file.metadata()?.len();
        if valid_end < file_len {
            warn!(valid_end, file_len, "dropping torn tail of lineage journal");
            file.set_len(valid_end)?;
        }

        let mut replayed = 0usize;
        for entry in entries {
            if entry.generation == generation {
                inner.absorb(entry.delta);
                replayed += 1;
            } else {
                debug!(
                    entry = entry.generation,
                    snapshot = generation,
                    "skipping journal entry from another generation"
                );
            }
        }

        let store = Self {
            path,
            journal_path,
            inner,
            journal: Mutex::new(Journal {
                file,
                end: valid_end,
                generation,
            }),
            sync_mode,
        };
        if valid_end > 0 {
            store.save()?;
        }
        info!(
            path = %store.path.display(),
            lineages = store.inner.lineage_count(),
            replayed,
            "lineage table opened"
        );
        Ok(store)
    }

    /// Path of the JSON snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Bytes in the journal not yet folded into the snapshot.
    pub fn journal_len(&self) -> u64 {
        self.journal.lock().expect("lock poisoned").end
    }

    /// Fold the journal into a fresh snapshot and empty it.
    pub fn save(&self) -> LineageResult<()> {
        let mut journal = self.journal.lock().expect("lock poisoned");
        let lineages = self.inner.snapshot();
        write_snapshot(&self.path, journal.generation, &lineages)?;
        journal.file.set_len(0)?;
        let folded = journal.end;
        journal.end = 0;
        debug!(
            path = %self.path.display(),
            lineages = lineages.len(),
            folded,
            "lineage journal folded into snapshot"
        );
        Ok(())
    }

    fn append(&self, journal: &mut Journal, entry: &JournalEntry) -> LineageResult<()> {
        let frame = encode_frame(&serde_json::to_vec(entry)?)?;
        let offset = journal.end;
        if let Err(e) = append_frame(&mut journal.file, &frame, self.sync_mode) {
            warn!(error = %e, "lineage journal append failed; truncating partial frame");
            if let Err(truncate) = journal.file.set_len(offset) {
                warn!(error = %truncate, "failed to truncate partial journal frame");
            }
            return Err(e.into());
        }
        journal.end += frame.len() as u64;
        Ok(())
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn load_snapshot(path: &Path) -> LineageResult<(u64, Vec<Lineage>)> {
    if !path.exists() {
        return Ok((0, Vec::new()));
    }
    let bytes = fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    if snapshot.format != SNAPSHOT_FORMAT {
        return Err(LineageError::Serialization(format!(
            "unsupported lineage snapshot format {} in {}",
            snapshot.format,
            path.display()
        )));
    }
    Ok((snapshot.generation, snapshot.lineages))
}

/// Replace the snapshot through a temp file and an atomic rename.
fn write_snapshot(path: &Path, generation: u64, lineages: &[Lineage]) -> LineageResult<()> {
    let snapshot = SnapshotRef {
        format: SNAPSHOT_FORMAT,
        generation,
        lineages,
    };
    let mut tmp = NamedTempFile::new_in(parent_dir(path))?;
    serde_json::to_writer(&mut tmp, &snapshot)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Scan the journal front to back. Returns the decoded entries and the
/// offset just past the last intact frame.
fn scan_journal(path: &Path) -> LineageResult<(Vec<JournalEntry>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut entries = Vec::new();
    let mut offset: u64 = 0;

    while offset + FRAME_HEADER <= file_len {
        let mut header = [0u8; FRAME_HEADER as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if len == 0 || offset + FRAME_HEADER + len as u64 > file_len {
            warn!(offset, len, file_len, "invalid journal frame length; stopping replay");
            break;
        }

        let mut payload = vec![0u8; len as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated journal frame; stopping replay");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        if crc32fast::hash(&payload) != expected_crc {
            warn!(offset, "journal checksum mismatch; skipping frame");
        } else {
            match serde_json::from_slice::<JournalEntry>(&payload) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(offset, error = %e, "undecodable journal entry; skipping frame"),
            }
        }
        offset += FRAME_HEADER + len as u64;
    }

    Ok((entries, offset))
}

fn encode_frame(payload: &[u8]) -> LineageResult<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "journal entry exceeds frame limit")
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER as usize + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn append_frame(file: &mut File, frame: &[u8], sync_mode: SyncMode) -> io::Result<()> {
    file.write_all(frame)?;
    match sync_mode {
        SyncMode::EveryWrite => file.sync_data(),
        SyncMode::OsDefault => file.flush(),
    }
}

impl LineageStore for FileLineageStore {
    fn read_lineage(&self, root: &EnvelopeId) -> LineageResult<Option<Lineage>> {
        self.inner.read_lineage(root)
    }

    fn lineage_of(&self, member: &EnvelopeId) -> LineageResult<Option<EnvelopeId>> {
        self.inner.lineage_of(member)
    }

    fn compare_and_swap(&self, expected: Option<u64>, lineage: Lineage) -> LineageResult<()> {
        let mut journal = self.journal.lock().expect("lock poisoned");
        let root = lineage.root();
        let current = self.inner.read_lineage(&root)?;
        let actual = current.as_ref().map(Lineage::version);
        if actual != expected {
            return Err(LineageError::Conflict {
                root,
                expected,
                actual,
            });
        }

        let entry = JournalEntry {
            generation: journal.generation,
            delta: LineageDelta::between(current.as_ref(), &lineage),
        };
        self.append(&mut journal, &entry)?;
        self.inner.compare_and_swap(expected, lineage)
    }

    fn roots(&self) -> LineageResult<Vec<EnvelopeId>> {
        self.inner.roots()
    }

    /// Write the new table as a snapshot of the next generation. Journal
    /// entries left from the old table no longer replay.
    fn reset(&self, mut lineages: Vec<Lineage>) -> LineageResult<()> {
        let mut journal = self.journal.lock().expect("lock poisoned");
        lineages.sort_by_key(Lineage::root);
        let generation = journal.generation + 1;
        write_snapshot(&self.path, generation, &lineages)?;

        journal.generation = generation;
        match journal.file.set_len(0) {
            Ok(()) => journal.end = 0,
            Err(e) => warn!(error = %e, "failed to empty lineage journal after reset"),
        }
        self.inner.reset(lineages)
    }

    fn checkpoint(&self) -> LineageResult<()> {
        self.save()
    }
}

impl std::fmt::Debug for FileLineageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLineageStore")
            .field("path", &self.path)
            .field("journal_len", &self.journal_len())
            .field("inner", &self.inner)
            .finish()
    }
}
