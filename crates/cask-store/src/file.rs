use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use cask_envelope::{Envelope, EnvelopeError};
use cask_types::EnvelopeId;
use tracing::{debug, info, warn};

use crate::config::SyncMode;
use crate::error::{StoreError, StoreResult};
use crate::traits::{EnvelopeStore, Insertion};

/// Name of the log file inside the store directory.
pub const LOG_FILE: &str = "envelopes.log";

/// Frame header: 4 bytes length + 4 bytes CRC.
const FRAME_HEADER: u64 = 8;

/// Options for [`FileEnvelopeStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileOptions {
    pub sync_mode: SyncMode,
    pub verify_on_read: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::OsDefault,
            verify_on_read: true,
        }
    }
}

/// Location of one envelope's stored bytes inside the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Frame {
    /// Offset of the frame header.
    offset: u64,
    /// Length of the stored bytes after the header.
    len: u32,
}

struct LogWriter {
    file: File,
    end: u64,
}

/// Append-only, crash-recoverable envelope store.
///
/// Every envelope is one frame in `envelopes.log`:
///
/// ```text
/// [4 bytes: stored length (little-endian u32)]
/// [4 bytes: CRC32 of stored bytes (little-endian u32)]
/// [N bytes: canonical bytes followed by the 32-byte identity]
/// ```
///
/// The offset table is rebuilt by scanning the log on open; a torn tail left
/// by a crash is cut off. The writer lock is held across the presence check
/// and the append so insert-if-absent is atomic, and an identity only becomes
/// readable once its frame is fully written.
pub struct FileEnvelopeStore {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    frames: RwLock<HashMap<EnvelopeId, Frame>>,
    quarantine: RwLock<BTreeSet<EnvelopeId>>,
    options: FileOptions,
}

impl FileEnvelopeStore {
    /// Open (or create) a store in directory `dir`.
    pub fn open(dir: &Path, options: FileOptions) -> StoreResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (frames, valid_end) = scan_log(&path)?;
        let file_len = file.metadata()?.len();
        if valid_end < file_len {
            warn!(
                valid_end,
                file_len,
                "dropping torn tail of envelope log"
            );
            file.set_len(valid_end)?;
        }

        info!(path = %path.display(), envelopes = frames.len(), "envelope store opened");
        Ok(Self {
            path,
            writer: Mutex::new(LogWriter {
                file,
                end: valid_end,
            }),
            frames: RwLock::new(frames),
            quarantine: RwLock::new(BTreeSet::new()),
            options,
        })
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log in bytes.
    pub fn log_len(&self) -> u64 {
        self.writer.lock().expect("lock poisoned").end
    }

    fn read_frame(&self, id: &EnvelopeId, mut file: File, frame: Frame) -> StoreResult<Vec<u8>> {
        file.seek(SeekFrom::Start(frame.offset))?;

        let mut header = [0u8; FRAME_HEADER as usize];
        file.read_exact(&mut header)?;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut stored = vec![0u8; frame.len as usize];
        file.read_exact(&mut stored)?;

        if crc32fast::hash(&stored) != expected_crc {
            self.quarantine(id, "frame checksum mismatch");
            return Err(StoreError::Corrupt {
                id: *id,
                source: EnvelopeError::Malformed {
                    offset: 0,
                    reason: "frame checksum mismatch".into(),
                },
            });
        }
        Ok(stored)
    }

    fn quarantine(&self, id: &EnvelopeId, reason: &str) {
        warn!(id = %id.short_hex(), reason, "quarantining envelope");
        self.quarantine
            .write()
            .expect("lock poisoned")
            .insert(*id);
    }
}

/// Scan the log front to back. Returns the frame table and the offset just
/// past the last intact frame.
fn scan_log(path: &Path) -> StoreResult<(HashMap<EnvelopeId, Frame>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut frames = HashMap::new();
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

        if (len as usize) < EnvelopeId::LEN || offset + FRAME_HEADER + len as u64 > file_len {
            warn!(offset, len, file_len, "invalid frame length; stopping recovery");
            break;
        }

        let mut stored = vec![0u8; len as usize];
        match file.read_exact(&mut stored) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated frame; stopping recovery");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        if crc32fast::hash(&stored) != expected_crc {
            // Kept in place; the identity is unknown, so the frame is skipped.
            warn!(offset, "frame checksum mismatch; skipping frame");
        } else {
            let id = EnvelopeId::from_slice(&stored[stored.len() - EnvelopeId::LEN..])
                .unwrap_or_default();
            // A later frame for the same identity replaces a quarantined one.
            frames.insert(id, Frame { offset, len });
        }
        offset += FRAME_HEADER + len as u64;
    }

    debug!(recovered = frames.len(), valid_end = offset, "envelope log scan complete");
    Ok((frames, offset))
}

fn append_frame(file: &mut File, frame: &[u8], sync_mode: SyncMode) -> io::Result<()> {
    file.write_all(frame)?;
    match sync_mode {
        SyncMode::EveryWrite => file.sync_data(),
        SyncMode::OsDefault => file.flush(),
    }
}

fn encode_frame(stored: &[u8]) -> StoreResult<Vec<u8>> {
    let len = u32::try_from(stored.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "envelope exceeds frame limit")
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER as usize + stored.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(stored).to_le_bytes());
    frame.extend_from_slice(stored);
    Ok(frame)
}

impl EnvelopeStore for FileEnvelopeStore {
    fn read(&self, id: &EnvelopeId) -> StoreResult<Option<Envelope>> {
        if self.quarantine.read().expect("lock poisoned").contains(id) {
            return Err(StoreError::Quarantined(*id));
        }
        // The handle is opened under the frame-table lock so it always
        // matches the offsets, even across a concurrent compaction.
        let (frame, file) = {
            let frames = self.frames.read().expect("lock poisoned");
            match frames.get(id) {
                Some(frame) => (*frame, File::open(&self.path)?),
                None => return Ok(None),
            }
        };
        let stored = self.read_frame(id, file, frame)?;

        let decoded = if self.options.verify_on_read {
            Envelope::decode(stored)
        } else {
            Envelope::decode_trusted(stored)
        };
        match decoded {
            Ok(envelope) if envelope.id() == *id => Ok(Some(envelope)),
            Ok(envelope) => {
                self.quarantine(id, "stored identity differs from index");
                Err(StoreError::HashMismatch {
                    id: *id,
                    computed: envelope.id(),
                })
            }
            Err(EnvelopeError::HashMismatch { computed, .. }) => {
                self.quarantine(id, "stored bytes fail identity verification");
                Err(StoreError::HashMismatch { id: *id, computed })
            }
            Err(source) => {
                self.quarantine(id, "stored bytes are malformed");
                Err(StoreError::Corrupt { id: *id, source })
            }
        }
    }

    fn insert(&self, envelope: &Envelope) -> StoreResult<Insertion> {
        let id = envelope.id();
        envelope
            .view()
            .verify()
            .map_err(|source| StoreError::Rejected { id, source })?;
        let frame_bytes = encode_frame(envelope.as_bytes())?;

        let mut w = self.writer.lock().expect("lock poisoned");
        let quarantined = self.quarantine.read().expect("lock poisoned").contains(&id);
        if !quarantined && self.frames.read().expect("lock poisoned").contains_key(&id) {
            return Ok(Insertion::AlreadyPresent);
        }

        let offset = w.end;
        if let Err(e) = append_frame(&mut w.file, &frame_bytes, self.options.sync_mode) {
            warn!(id = %id.short_hex(), error = %e, "append failed; truncating partial frame");
            if let Err(truncate) = w.file.set_len(offset) {
                warn!(error = %truncate, "failed to truncate partial frame");
            }
            return Err(e.into());
        }
        w.end += frame_bytes.len() as u64;

        self.frames.write().expect("lock poisoned").insert(
            id,
            Frame {
                offset,
                len: (frame_bytes.len() as u64 - FRAME_HEADER) as u32,
            },
        );
        if quarantined {
            info!(id = %id.short_hex(), "quarantined envelope replaced by verified copy");
            self.quarantine.write().expect("lock poisoned").remove(&id);
        }
        debug!(id = %id.short_hex(), offset, "envelope appended");
        Ok(Insertion::Inserted)
    }

    fn exists(&self, id: &EnvelopeId) -> StoreResult<bool> {
        Ok(self.frames.read().expect("lock poisoned").contains_key(id))
    }

    fn ids(&self) -> StoreResult<Vec<EnvelopeId>> {
        let frames = self.frames.read().expect("lock poisoned");
        let mut ids: Vec<EnvelopeId> = frames.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.frames.read().expect("lock poisoned").len())
    }

    fn quarantined(&self) -> Vec<EnvelopeId> {
        self.quarantine
            .read()
            .expect("lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Rewrite the log without the given envelopes, through a temp file and
    /// an atomic rename.
    fn remove(&self, ids: &[EnvelopeId]) -> StoreResult<usize> {
        let doomed: BTreeSet<EnvelopeId> = ids.iter().copied().collect();
        let mut w = self.writer.lock().expect("lock poisoned");

        let mut survivors: Vec<(EnvelopeId, Frame)> = {
            let frames = self.frames.read().expect("lock poisoned");
            frames
                .iter()
                .filter(|(id, _)| !doomed.contains(id))
                .map(|(id, frame)| (*id, *frame))
                .collect()
        };
        let removed = self.len()? - survivors.len();
        if removed == 0 {
            return Ok(0);
        }
        survivors.sort_by_key(|(_, frame)| frame.offset);

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut source = File::open(&self.path)?;
        let mut rewritten = HashMap::with_capacity(survivors.len());
        let mut offset = 0u64;
        for (id, frame) in survivors {
            let total = FRAME_HEADER + frame.len as u64;
            source.seek(SeekFrom::Start(frame.offset))?;
            let mut raw = vec![0u8; total as usize];
            source.read_exact(&mut raw)?;
            tmp.write_all(&raw)?;
            rewritten.insert(
                id,
                Frame {
                    offset,
                    len: frame.len,
                },
            );
            offset += total;
        }
        tmp.as_file().sync_all()?;

        let mut frames = self.frames.write().expect("lock poisoned");
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        w.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        w.end = offset;
        *frames = rewritten;
        drop(frames);
        self.quarantine
            .write()
            .expect("lock poisoned")
            .retain(|id| !doomed.contains(id));

        info!(removed, log_len = offset, "envelope log compacted");
        Ok(removed)
    }
}

impl std::fmt::Debug for FileEnvelopeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.frames.read().expect("lock poisoned").len();
        f.debug_struct("FileEnvelopeStore")
            .field("path", &self.path)
            .field("envelope_count", &count)
            .finish()
    }
}
