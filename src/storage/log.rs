//! On-disk record framing, write-ahead log and snapshot files.
//!
//! A store directory holds:
//! - `CURRENT`: the generation of the newest complete snapshot.
//! - `snapshot-NNNNNN.dat`: every live vector as of that generation.
//! - `wal-NNNNNN.log`: mutations applied after the snapshot of the same
//!   generation was cut.
//!
//! Both file kinds are a sequence of frames:
//! `[u32 body length LE][u32 crc32(body) LE][body]`, where the body is a codec
//! byte followed by the `serde_json` encoding of a [`LogRecord`], lz4
//! compressed when the codec says so.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::vector::Vector;

const HEADER_LEN: usize = 8;
const CODEC_RAW: u8 = 0;
const CODEC_LZ4: u8 = 1;
/// Frames larger than this are treated as garbage rather than allocated.
const MAX_FRAME_LEN: usize = 1 << 30;

pub(crate) const CURRENT_FILE: &str = "CURRENT";
const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".dat";
const WAL_PREFIX: &str = "wal-";
const WAL_SUFFIX: &str = ".log";
const TMP_SUFFIX: &str = ".tmp";

/// A single durable mutation.
///
/// A batch is one record and therefore one frame: it is either replayed
/// entirely or not at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum LogRecord {
    Put { vector: Arc<Vector> },
    Delete { id: String },
    Batch { vectors: Vec<Arc<Vector>> },
}

/// Diagnostic statistics from a WAL replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ReplayStats {
    pub records: usize,
    pub bytes: u64,
    /// Set when replay stopped at a torn or corrupt frame.
    pub truncated_at: Option<u64>,
}

/// Which kind of generation file a directory entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Snapshot,
    Wal,
}

pub(crate) fn snapshot_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{SNAPSHOT_PREFIX}{generation:06}{SNAPSHOT_SUFFIX}"))
}

pub(crate) fn wal_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{WAL_PREFIX}{generation:06}{WAL_SUFFIX}"))
}

fn parse_generation(name: &str) -> Option<(FileKind, u64)> {
    let (kind, digits) = if let Some(rest) = name.strip_prefix(SNAPSHOT_PREFIX) {
        (FileKind::Snapshot, rest.strip_suffix(SNAPSHOT_SUFFIX)?)
    } else if let Some(rest) = name.strip_prefix(WAL_PREFIX) {
        (FileKind::Wal, rest.strip_suffix(WAL_SUFFIX)?)
    } else {
        return None;
    };
    digits.parse().ok().map(|generation| (kind, generation))
}

/// Lists the snapshot and WAL files in `dir`, sorted by generation.
pub(crate) fn list_generation_files(dir: &Path) -> StorageResult<Vec<(FileKind, u64, PathBuf)>> {
    let mut files = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| StorageError::io("list store files", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io("list store files", e))?;
        let name = entry.file_name();
        if let Some((kind, generation)) = name.to_str().and_then(parse_generation) {
            files.push((kind, generation, entry.path()));
        }
    }
    files.sort_by_key(|(_, generation, _)| *generation);
    Ok(files)
}

/// Removes leftovers of interrupted atomic writes.
pub(crate) fn remove_temp_files(dir: &Path) -> StorageResult<()> {
    let entries = fs::read_dir(dir).map_err(|e| StorageError::io("list store files", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io("list store files", e))?;
        if entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
            fs::remove_file(entry.path()).map_err(|e| StorageError::io("remove temp file", e))?;
        }
    }
    Ok(())
}

/// Serializes a record into its on-disk frame.
pub(crate) fn encode_frame(record: &LogRecord, compression: bool) -> StorageResult<Vec<u8>> {
    let key = record_key(record);
    let json = serde_json::to_vec(record).map_err(|e| StorageError::Serialization {
        operation: "encode record",
        key: key.clone(),
        reason: e.to_string(),
    })?;

    let mut body = Vec::with_capacity(json.len() + 1);
    if compression {
        body.push(CODEC_LZ4);
        body.extend_from_slice(&lz4_flex::compress_prepend_size(&json));
    } else {
        body.push(CODEC_RAW);
        body.extend_from_slice(&json);
    }

    if body.len() > MAX_FRAME_LEN {
        return Err(StorageError::Serialization {
            operation: "encode record",
            key,
            reason: format!("record of {} bytes exceeds the frame limit", body.len()),
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn record_key(record: &LogRecord) -> Option<String> {
    match record {
        LogRecord::Put { vector } => Some(vector.id.clone()),
        LogRecord::Delete { id } => Some(id.clone()),
        LogRecord::Batch { .. } => None,
    }
}

fn decode_body(body: &[u8]) -> Result<LogRecord, String> {
    let (&codec, payload) = body.split_first().ok_or("empty frame body")?;
    let json = match codec {
        CODEC_RAW => std::borrow::Cow::Borrowed(payload),
        CODEC_LZ4 => std::borrow::Cow::Owned(
            lz4_flex::decompress_size_prepended(payload).map_err(|e| e.to_string())?,
        ),
        other => return Err(format!("unknown codec {other}")),
    };
    serde_json::from_slice(&json).map_err(|e| e.to_string())
}

/// Outcome of reading one frame.
enum Frame {
    Record(LogRecord, u64),
    End,
    Invalid(String),
}

/// Sequential frame reader that knows the file length, so a torn tail is
/// detected without reading past it.
struct FrameReader {
    reader: BufReader<File>,
    offset: u64,
    len: u64,
}

impl FrameReader {
    fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
            len,
        })
    }

    fn next_frame(&mut self) -> io::Result<Frame> {
        let remaining = self.len - self.offset;
        if remaining == 0 {
            return Ok(Frame::End);
        }
        if remaining < HEADER_LEN as u64 {
            return Ok(Frame::Invalid("truncated frame header".to_string()));
        }

        let mut header = [0u8; HEADER_LEN];
        self.reader.read_exact(&mut header)?;
        let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if body_len > MAX_FRAME_LEN || (body_len as u64) > remaining - HEADER_LEN as u64 {
            return Ok(Frame::Invalid("truncated frame body".to_string()));
        }

        let mut body = vec![0u8; body_len];
        self.reader.read_exact(&mut body)?;
        if crc32fast::hash(&body) != stored_crc {
            return Ok(Frame::Invalid("checksum mismatch".to_string()));
        }

        let frame_len = (HEADER_LEN + body_len) as u64;
        match decode_body(&body) {
            Ok(record) => {
                self.offset += frame_len;
                Ok(Frame::Record(record, frame_len))
            }
            Err(reason) => Ok(Frame::Invalid(reason)),
        }
    }
}

/// Reads every intact record of a WAL file.
///
/// Replay stops at the first torn or corrupt frame; the file is truncated
/// there so later appends do not land behind garbage.
pub(crate) fn replay_wal(path: &Path) -> StorageResult<(Vec<LogRecord>, ReplayStats)> {
    let mut reader = FrameReader::open(path).map_err(|e| StorageError::io("open WAL", e))?;
    let mut records = Vec::new();
    let mut stats = ReplayStats::default();

    loop {
        match reader
            .next_frame()
            .map_err(|e| StorageError::io("replay WAL", e))?
        {
            Frame::Record(record, len) => {
                records.push(record);
                stats.records += 1;
                stats.bytes += len;
            }
            Frame::End => break,
            Frame::Invalid(reason) => {
                tracing::warn!(
                    path = %path.display(),
                    offset = reader.offset,
                    %reason,
                    "WAL tail is unreadable, truncating"
                );
                stats.truncated_at = Some(reader.offset);
                break;
            }
        }
    }

    if let Some(offset) = stats.truncated_at {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StorageError::io("truncate WAL", e))?;
        file.set_len(offset)
            .and_then(|()| file.sync_all())
            .map_err(|e| StorageError::io("truncate WAL", e))?;
    }

    Ok((records, stats))
}

/// Reads a snapshot file. Snapshots are written atomically, so any unreadable
/// frame means the file is corrupted.
pub(crate) fn read_snapshot(path: &Path) -> StorageResult<Vec<Arc<Vector>>> {
    let mut reader = FrameReader::open(path).map_err(|e| StorageError::io("open snapshot", e))?;
    let mut vectors = Vec::new();
    loop {
        match reader
            .next_frame()
            .map_err(|e| StorageError::io("read snapshot", e))?
        {
            Frame::Record(LogRecord::Put { vector }, _) => vectors.push(vector),
            Frame::Record(_, _) => {
                return Err(StorageError::Corrupted {
                    path: path.to_path_buf(),
                    reason: format!("unexpected record at offset {}", reader.offset),
                });
            }
            Frame::End => return Ok(vectors),
            Frame::Invalid(reason) => {
                return Err(StorageError::Corrupted {
                    path: path.to_path_buf(),
                    reason: format!("{reason} at offset {}", reader.offset),
                });
            }
        }
    }
}

/// Writes `path` via a temporary sibling: write, fsync, rename, fsync dir.
fn write_atomically(
    path: &Path,
    operation: &'static str,
    write: impl FnOnce(&mut BufWriter<File>) -> StorageResult<()>,
) -> StorageResult<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp_name);

    let file = File::create(&tmp).map_err(|e| StorageError::io(operation, e))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    let file = writer
        .into_inner()
        .map_err(|e| StorageError::io(operation, e.into_error()))?;
    file.sync_all().map_err(|e| StorageError::io(operation, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| StorageError::io(operation, e))?;
    sync_dir(path.parent().unwrap_or(Path::new(".")));
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), "directory fsync failed: {e}");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Writes a complete snapshot of `vectors` for `generation`.
pub(crate) fn write_snapshot(
    dir: &Path,
    generation: u64,
    vectors: &[Arc<Vector>],
    compression: bool,
) -> StorageResult<u64> {
    let mut written = 0u64;
    write_atomically(&snapshot_path(dir, generation), "write snapshot", |out| {
        for vector in vectors {
            let frame = encode_frame(
                &LogRecord::Put {
                    vector: Arc::clone(vector),
                },
                compression,
            )?;
            out.write_all(&frame)
                .map_err(|e| StorageError::io_for_key("write snapshot", &vector.id, e))?;
            written += frame.len() as u64;
        }
        Ok(())
    })?;
    Ok(written)
}

pub(crate) fn read_current(dir: &Path) -> StorageResult<Option<u64>> {
    let path = dir.join(CURRENT_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io("read CURRENT", e)),
    };
    contents
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| StorageError::Corrupted {
            path,
            reason: format!("'{}' is not a generation number", contents.trim()),
        })
}

pub(crate) fn write_current(dir: &Path, generation: u64) -> StorageResult<()> {
    write_atomically(&dir.join(CURRENT_FILE), "write CURRENT", |out| {
        writeln!(out, "{generation}").map_err(|e| StorageError::io("write CURRENT", e))
    })
}

/// Whether each WAL append is fsynced before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// `fdatasync` after every write.
    #[default]
    Sync,
    /// Leave flushing to the operating system.
    Buffered,
}

/// Append handle for the active WAL file.
#[derive(Debug)]
pub(crate) struct WalWriter {
    file: File,
    path: PathBuf,
    len: u64,
    durability: Durability,
}

impl WalWriter {
    /// Opens `path` for appending, creating it if needed.
    pub(crate) fn open(path: PathBuf, durability: Durability) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io("open WAL", e))?;
        let len = file
            .metadata()
            .map_err(|e| StorageError::io("open WAL", e))?
            .len();
        Ok(Self {
            file,
            path,
            len,
            durability,
        })
    }

    /// Opens an existing WAL without write access, so every append fails.
    #[cfg(test)]
    pub(crate) fn read_only(path: PathBuf, durability: Durability) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| StorageError::io("open WAL", e))?;
        let len = file
            .metadata()
            .map_err(|e| StorageError::io("open WAL", e))?
            .len();
        Ok(Self {
            file,
            path,
            len,
            durability,
        })
    }

    /// Appends one frame. On failure the file is cut back to its previous
    /// length so no partial frame survives.
    pub(crate) fn append(&mut self, frame: &[u8], key: Option<&str>) -> StorageResult<()> {
        let result = self.file.write_all(frame).and_then(|()| match self.durability {
            Durability::Sync => self.file.sync_data(),
            Durability::Buffered => self.file.flush(),
        });

        match result {
            Ok(()) => {
                self.len += frame.len() as u64;
                Ok(())
            }
            Err(source) => {
                if let Err(e) = self.file.set_len(self.len) {
                    tracing::warn!(path = %self.path.display(), "failed to roll back WAL append: {e}");
                }
                Err(match key {
                    Some(key) => StorageError::io_for_key("append WAL", key, source),
                    None => StorageError::io("append WAL", source),
                })
            }
        }
    }

    pub(crate) fn sync(&mut self) -> StorageResult<()> {
        self.file
            .flush()
            .and_then(|()| self.file.sync_all())
            .map_err(|e| StorageError::io("sync WAL", e))
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(id: &str, values: Vec<f32>) -> LogRecord {
        LogRecord::Put {
            vector: Arc::new(Vector::new(id, values)),
        }
    }

    fn ids(records: &[LogRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| match r {
                LogRecord::Put { vector } => vector.id.clone(),
                LogRecord::Delete { id } => format!("-{id}"),
                LogRecord::Batch { vectors } => format!("batch:{}", vectors.len()),
            })
            .collect()
    }

    #[test]
    fn test_generation_file_names() {
        let dir = Path::new("/data");
        assert_eq!(snapshot_path(dir, 7), Path::new("/data/snapshot-000007.dat"));
        assert_eq!(wal_path(dir, 12), Path::new("/data/wal-000012.log"));
        assert_eq!(
            parse_generation("wal-000012.log"),
            Some((FileKind::Wal, 12))
        );
        assert_eq!(parse_generation("snapshot-000007.dat.tmp"), None);
        assert_eq!(parse_generation("CURRENT"), None);
    }

    #[test]
    fn test_wal_append_and_replay() {
        for compression in [false, true] {
            let temp_dir = TempDir::new().unwrap();
            let path = wal_path(temp_dir.path(), 0);
            let mut wal = WalWriter::open(path.clone(), Durability::Sync).unwrap();

            let records = [
                put("a", vec![1.0, 0.0]),
                LogRecord::Delete { id: "a".into() },
                LogRecord::Batch {
                    vectors: vec![
                        Arc::new(Vector::new("b", vec![0.0, 1.0])),
                        Arc::new(Vector::new("c", vec![0.5, 0.5]).with_metadata("k", "v")),
                    ],
                },
            ];
            for record in &records {
                let frame = encode_frame(record, compression).unwrap();
                wal.append(&frame, None).unwrap();
            }
            let written = wal.len();
            drop(wal);

            let (replayed, stats) = replay_wal(&path).unwrap();
            assert_eq!(ids(&replayed), vec!["a", "-a", "batch:2"]);
            assert_eq!(stats.records, 3);
            assert_eq!(stats.bytes, written);
            assert_eq!(stats.truncated_at, None);
        }
    }

    #[test]
    fn test_failed_append_leaves_wal_intact() {
        let temp_dir = TempDir::new().unwrap();
        let path = wal_path(temp_dir.path(), 0);
        let mut wal = WalWriter::open(path.clone(), Durability::Sync).unwrap();
        wal.append(&encode_frame(&put("a", vec![1.0]), false).unwrap(), None)
            .unwrap();
        let intact = wal.len();
        drop(wal);

        let mut wal = WalWriter::read_only(path.clone(), Durability::Sync).unwrap();
        let frame = encode_frame(&put("b", vec![2.0]), false).unwrap();
        let err = wal.append(&frame, Some("b")).unwrap_err();
        assert!(matches!(err, StorageError::Io { key: Some(ref k), .. } if k == "b"));
        assert_eq!(wal.len(), intact);
        drop(wal);

        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
        let (replayed, stats) = replay_wal(&path).unwrap();
        assert_eq!(ids(&replayed), vec!["a"]);
        assert_eq!(stats.truncated_at, None);
    }

    #[test]
    fn test_replay_truncates_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let path = wal_path(temp_dir.path(), 0);
        let mut wal = WalWriter::open(path.clone(), Durability::Buffered).unwrap();
        wal.append(&encode_frame(&put("a", vec![1.0]), true).unwrap(), None)
            .unwrap();
        let intact = wal.len();

        let torn = encode_frame(&put("b", vec![2.0]), true).unwrap();
        wal.append(&torn[..torn.len() - 3], None).unwrap();
        drop(wal);

        let (replayed, stats) = replay_wal(&path).unwrap();
        assert_eq!(ids(&replayed), vec!["a"]);
        assert_eq!(stats.truncated_at, Some(intact));
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
    }

    #[test]
    fn test_replay_stops_at_checksum_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = wal_path(temp_dir.path(), 0);
        let first = encode_frame(&put("a", vec![1.0]), false).unwrap();
        let mut second = encode_frame(&put("b", vec![2.0]), false).unwrap();
        let last = second.len() - 1;
        second[last] ^= 0xFF;
        let third = encode_frame(&put("c", vec![3.0]), false).unwrap();
        fs::write(&path, [first.clone(), second, third].concat()).unwrap();

        let (replayed, stats) = replay_wal(&path).unwrap();
        assert_eq!(ids(&replayed), vec!["a"]);
        assert_eq!(stats.truncated_at, Some(first.len() as u64));
    }

    #[test]
    fn test_snapshot_round_trip_and_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let vectors = vec![
            Arc::new(Vector::new("a", vec![1.0, 0.0])),
            Arc::new(Vector::new("b", vec![0.0, 1.0])),
        ];
        write_snapshot(temp_dir.path(), 3, &vectors, true).unwrap();

        let path = snapshot_path(temp_dir.path(), 3);
        assert_eq!(read_snapshot(&path).unwrap(), vectors);

        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 1);
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            read_snapshot(&path),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_current_pointer() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(read_current(temp_dir.path()).unwrap(), None);
        write_current(temp_dir.path(), 42).unwrap();
        assert_eq!(read_current(temp_dir.path()).unwrap(), Some(42));

        fs::write(temp_dir.path().join(CURRENT_FILE), "garbage").unwrap();
        assert!(matches!(
            read_current(temp_dir.path()),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_list_generation_files_sorted() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["wal-000002.log", "snapshot-000001.dat", "wal-000001.log", "other.txt"] {
            fs::write(temp_dir.path().join(name), b"").unwrap();
        }
        let files = list_generation_files(temp_dir.path()).unwrap();
        let generations: Vec<u64> = files.iter().map(|(_, g, _)| *g).collect();
        assert_eq!(generations, vec![1, 1, 2]);
    }
}
