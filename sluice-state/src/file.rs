//! Buffered spill streams. Every spill target consists of two files, `<path>.dat` holding the
//! value bytes and `<path>_key.dat` holding the key bytes, so the two never interleave.

use crate::error::{Result, SliceStoreError};
use sluice_types::{Buffer, BufferProvider};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::error;

pub fn value_path(path: &Path) -> PathBuf {
    with_suffix(path, ".dat")
}

pub fn key_path(path: &Path) -> PathBuf {
    with_suffix(path, "_key.dat")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn allocate(provider: &dyn BufferProvider, size: usize) -> Result<Option<Buffer>> {
    if size == 0 {
        return Ok(None);
    }
    provider
        .get_unpooled_buffer(size)
        .map(Some)
        .ok_or(SliceStoreError::AllocationFailed { size })
}

struct WriteStream {
    path: PathBuf,
    file: File,
    buffer: Option<Buffer>,
    len: usize,
    committed: u64,
}

impl WriteStream {
    fn open(path: PathBuf, buffer: Option<Buffer>, truncate: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        if truncate {
            options.write(true).create(true).truncate(true);
        } else {
            options.create(true).append(true);
        }
        let file = options
            .open(&path)
            .map_err(|e| SliceStoreError::io(&path, e))?;
        let committed = file
            .metadata()
            .map_err(|e| SliceStoreError::io(&path, e))?
            .len();
        Ok(Self {
            path,
            file,
            buffer,
            len: 0,
            committed,
        })
    }

    fn write(&mut self, mut data: &[u8]) -> Result<()> {
        let capacity = match &self.buffer {
            Some(buffer) => buffer.len(),
            None => {
                return self
                    .file
                    .write_all(data)
                    .map_err(|e| SliceStoreError::io(&self.path, e));
            }
        };

        while !data.is_empty() {
            let n = (capacity - self.len).min(data.len());
            if let Some(buffer) = self.buffer.as_mut() {
                buffer.write_bytes(self.len, &data[..n])?;
            }
            self.len += n;
            data = &data[n..];

            if self.len == capacity {
                self.flush()?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(buffer) = &self.buffer {
            if self.len > 0 {
                self.file
                    .write_all(buffer.bytes(0, self.len)?)
                    .map_err(|e| SliceStoreError::io(&self.path, e))?;
                self.len = 0;
            }
        }
        self.file
            .flush()
            .map_err(|e| SliceStoreError::io(&self.path, e))
    }

    fn commit(&mut self) -> Result<()> {
        self.committed = self
            .file
            .metadata()
            .map_err(|e| SliceStoreError::io(&self.path, e))?
            .len();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.len = 0;
        self.file
            .set_len(self.committed)
            .and_then(|_| self.file.seek(SeekFrom::Start(self.committed)))
            .map_err(|e| SliceStoreError::io(&self.path, e))?;
        Ok(())
    }
}

pub struct FileWriter {
    values: WriteStream,
    keys: WriteStream,
}

impl FileWriter {
    /// Opens (appending) both streams of the spill target `path`. Each stream gets its own
    /// `buffer_size` buffer from `provider`; a size of 0 writes straight through.
    pub fn new(path: &Path, provider: &dyn BufferProvider, buffer_size: usize) -> Result<Self> {
        Self::open(path, provider, buffer_size, false)
    }

    /// Like [`FileWriter::new`], but discards whatever the two files held before.
    pub fn create(path: &Path, provider: &dyn BufferProvider, buffer_size: usize) -> Result<Self> {
        Self::open(path, provider, buffer_size, true)
    }

    fn open(
        path: &Path,
        provider: &dyn BufferProvider,
        buffer_size: usize,
        truncate: bool,
    ) -> Result<Self> {
        let values =
            WriteStream::open(value_path(path), allocate(provider, buffer_size)?, truncate)?;
        let keys = WriteStream::open(key_path(path), allocate(provider, buffer_size)?, truncate)?;
        Ok(Self { values, keys })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.values.write(data)
    }

    pub fn write_key(&mut self, data: &[u8]) -> Result<()> {
        self.keys.write(data)
    }

    /// Writes out both buffers. Everything written so far survives a later
    /// [`FileWriter::rollback`].
    pub fn flush(&mut self) -> Result<()> {
        self.values.flush()?;
        self.keys.flush()?;
        self.values.commit()?;
        self.keys.commit()
    }

    /// Cuts both files back to their length at the last successful flush (or at open), dropping
    /// buffered bytes and bytes that already reached the file.
    pub fn rollback(&mut self) -> Result<()> {
        self.values.rollback()?;
        self.keys.rollback()
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("failed to flush spill file on drop: {}", e);
        }
    }
}

struct ReadStream {
    path: PathBuf,
    file: File,
    buffer: Option<Buffer>,
    pos: usize,
    end: usize,
}

impl ReadStream {
    fn open(path: PathBuf, buffer: Option<Buffer>) -> Result<Self> {
        let file = File::open(&path).map_err(|e| SliceStoreError::io(&path, e))?;
        Ok(Self {
            path,
            file,
            buffer,
            pos: 0,
            end: 0,
        })
    }

    fn read_file(file: &mut File, path: &Path, dest: &mut [u8]) -> Result<usize> {
        loop {
            match file.read(dest) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SliceStoreError::io(path, e)),
            }
        }
    }

    fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < dest.len() {
            let Some(buffer) = self.buffer.as_mut() else {
                let n = Self::read_file(&mut self.file, &self.path, &mut dest[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
                continue;
            };

            if self.pos == self.end {
                self.end = Self::read_file(&mut self.file, &self.path, buffer.as_mut_slice())?;
                self.pos = 0;
                if self.end == 0 {
                    break;
                }
            }

            let n = (self.end - self.pos).min(dest.len() - filled);
            dest[filled..filled + n].copy_from_slice(buffer.bytes(self.pos, n)?);
            self.pos += n;
            filled += n;
        }
        Ok(filled)
    }
}

pub struct FileReader {
    values: ReadStream,
    keys: ReadStream,
}

impl FileReader {
    pub fn new(path: &Path, provider: &dyn BufferProvider, buffer_size: usize) -> Result<Self> {
        let values = ReadStream::open(value_path(path), allocate(provider, buffer_size)?)?;
        let keys = ReadStream::open(key_path(path), allocate(provider, buffer_size)?)?;
        Ok(Self { values, keys })
    }

    /// Fills `dest` from the value stream, returning the number of bytes read. Less than
    /// `dest.len()` is only returned at the end of the stream.
    pub fn read(&mut self, dest: &mut [u8]) -> Result<usize> {
        self.values.read(dest)
    }

    pub fn read_key(&mut self, dest: &mut [u8]) -> Result<usize> {
        self.keys.read(dest)
    }
}
