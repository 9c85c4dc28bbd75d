//! Append-only storage writer for one output file.
//!
//! Single-threaded per instance: bytes appear in the file in `write` call
//! order, so no interleaving is possible. Durability is bounded by the flush
//! cadence, not guaranteed per call.

use crate::clip::{self, IndexEntry};
use common_io::{EncodedUnit, RecorderError, Result};
use config::WriterConfig;
use nix::fcntl::posix_fallocate;
use nix::sys::statvfs::statvfs;
use nix::unistd::{access, AccessFlags};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Sink consumed by the capture pipeline's writer thread.
pub trait RecordSink: Send {
    /// Append one encoded unit, retrying partial writes until fully accepted
    /// or an unrecoverable error occurs. Returns payload bytes accepted.
    fn append_unit(&mut self, unit: &EncodedUnit) -> Result<u64>;

    /// Force data durability of everything buffered so far.
    fn flush(&mut self) -> Result<()>;

    /// Write the trailing index, flush once and release the descriptor.
    fn finalize(&mut self) -> Result<()>;

    fn bytes_written(&self) -> u64;
}

/// Per-writer status snapshot.
#[derive(Debug, Clone)]
pub struct StorageStatus {
    pub bytes_written: u64,
    pub bytes_available: u64,
    pub write_rate_mbps: f64,
    pub is_writing: bool,
    pub current_file: Option<PathBuf>,
}

struct OpenFile {
    file: File,
    path: PathBuf,
    offset: u64,
    index: Vec<IndexEntry>,
    units_since_flush: u32,
    opened_at: Instant,
}

/// Preallocating sequential writer over one clip file.
pub struct StorageWriter {
    config: WriterConfig,
    output_dir: PathBuf,
    open_file: Option<OpenFile>,
    bytes_written: u64,
    fell_back_to_buffered: bool,
}

impl StorageWriter {
    /// Verify the output directory exists and is writable.
    pub fn new(output_dir: &Path, config: WriterConfig) -> Result<Self> {
        let meta = std::fs::metadata(output_dir).map_err(|e| {
            RecorderError::Resource(format!(
                "output directory {}: {}",
                output_dir.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(RecorderError::Resource(format!(
                "{} is not a directory",
                output_dir.display()
            )));
        }
        access(output_dir, AccessFlags::W_OK).map_err(|_| {
            RecorderError::Resource(format!("{} is not writable", output_dir.display()))
        })?;

        info!(dir = %output_dir.display(), "storage writer initialized");
        Ok(Self {
            config,
            output_dir: output_dir.to_path_buf(),
            open_file: None,
            bytes_written: 0,
            fell_back_to_buffered: false,
        })
    }

    /// Open `<output_dir>/<filename>` for sequential write and pre-allocate
    /// the configured extent. Filesystems without allocation support fall
    /// back to plain buffered growth.
    pub fn open(&mut self, filename: &str, camera_id: u32) -> Result<PathBuf> {
        if self.open_file.is_some() {
            return Err(RecorderError::InvalidState(
                "writer already has an open file".into(),
            ));
        }

        let path = self.output_dir.join(filename);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        if self.config.preallocate_bytes > 0 {
            match posix_fallocate(file.as_raw_fd(), 0, self.config.preallocate_bytes as i64) {
                Ok(()) => debug!(
                    bytes = self.config.preallocate_bytes,
                    "extent preallocated"
                ),
                Err(nix::errno::Errno::ENOSPC) => {
                    return Err(RecorderError::Io(std::io::Error::from_raw_os_error(
                        nix::errno::Errno::ENOSPC as i32,
                    )));
                }
                Err(errno) => {
                    // e.g. EOPNOTSUPP on filesystems without fallocate
                    warn!(%errno, "preallocation unsupported, using buffered growth");
                    self.fell_back_to_buffered = true;
                }
            }
        }

        let mut open_file = OpenFile {
            file,
            path: path.clone(),
            offset: 0,
            index: Vec::new(),
            units_since_flush: 0,
            opened_at: Instant::now(),
        };
        let header = clip::encode_header(camera_id);
        write_fully(&mut open_file.file, &header)?;
        open_file.offset = header.len() as u64;

        self.bytes_written = 0;
        self.open_file = Some(open_file);
        info!(path = %path.display(), camera = camera_id, "output file opened");
        Ok(path)
    }

    /// Whether `open` had to give up on preallocated extents. The owner
    /// raises the one-time Warning alert for this.
    pub fn fell_back_to_buffered(&self) -> bool {
        self.fell_back_to_buffered
    }

    /// Raw append with partial-write retry. EINTR is retryable; everything
    /// else surfaces as `Io`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let open_file = self.open_file.as_mut().ok_or_else(|| {
            RecorderError::InvalidState("write before open".into())
        })?;
        write_fully(&mut open_file.file, bytes)?;
        open_file.offset += bytes.len() as u64;
        Ok(bytes.len())
    }

    pub fn available_space(&self) -> Result<u64> {
        let stat = statvfs(&self.output_dir)
            .map_err(|errno| RecorderError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    /// Free space net of the reserved floor.
    pub fn has_space(&self, required_bytes: u64) -> Result<bool> {
        let available = self.available_space()?;
        Ok(available.saturating_sub(self.config.reserved_bytes) >= required_bytes)
    }

    pub fn status(&self) -> StorageStatus {
        let (is_writing, current_file, rate) = match &self.open_file {
            Some(open_file) => {
                let secs = open_file.opened_at.elapsed().as_secs_f64();
                let rate = if secs > 0.0 {
                    (open_file.offset as f64 / (1024.0 * 1024.0)) / secs
                } else {
                    0.0
                };
                (true, Some(open_file.path.clone()), rate)
            }
            None => (false, None, 0.0),
        };
        StorageStatus {
            bytes_written: self.bytes_written,
            bytes_available: self.available_space().unwrap_or(0),
            write_rate_mbps: rate,
            is_writing,
            current_file,
        }
    }
}

impl RecordSink for StorageWriter {
    fn append_unit(&mut self, unit: &EncodedUnit) -> Result<u64> {
        let record = clip::encode_record(unit);
        let entry_offset = self
            .open_file
            .as_ref()
            .map(|f| f.offset)
            .ok_or_else(|| RecorderError::InvalidState("append before open".into()))?;

        self.write(&record)?;
        self.bytes_written += unit.data.len() as u64;

        let flush_interval = self.config.flush_interval_units;
        let open_file = self.open_file.as_mut().unwrap();
        open_file.index.push(IndexEntry {
            offset: entry_offset,
            pts_ns: unit.pts_ns,
        });
        open_file.units_since_flush += 1;
        if flush_interval > 0 && open_file.units_since_flush >= flush_interval {
            open_file.file.sync_data()?;
            open_file.units_since_flush = 0;
        }
        Ok(unit.data.len() as u64)
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(open_file) = self.open_file.as_mut() {
            // data durability only; metadata is not required per call
            open_file.file.sync_data()?;
            open_file.units_since_flush = 0;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let Some(mut open_file) = self.open_file.take() else {
            return Ok(());
        };
        // drop the unused preallocated tail before the trailer goes in
        open_file.file.set_len(open_file.offset)?;
        let trailer = clip::encode_trailer(&open_file.index);
        write_fully(&mut open_file.file, &trailer)?;
        open_file.file.sync_data()?;
        info!(
            path = %open_file.path.display(),
            frames = open_file.index.len(),
            bytes = open_file.offset + trailer.len() as u64,
            "output file finalized"
        );
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Drop for StorageWriter {
    fn drop(&mut self) {
        if self.open_file.is_some() {
            let _ = self.finalize();
        }
    }
}

fn write_fully(file: &mut File, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        match file.write(bytes) {
            Ok(0) => {
                return Err(RecorderError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "storage accepted zero bytes",
                )))
            }
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(RecorderError::Io(e)),
        }
    }
    Ok(())
}
