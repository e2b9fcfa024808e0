use crate::error::{Result, SliceStoreError};
use crate::file::{key_path, value_path, FileReader, FileWriter};
use sluice_types::{BufferProvider, FileLayout, JoinSide, OriginId, Timestamp, WorkerThreadId};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Owns the working directory of the spill files of one operator instance.
pub struct MemoryController {
    working_dir: PathBuf,
    origin: OriginId,
    file_buffer_size: usize,
    file_layout: FileLayout,
}

impl MemoryController {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        origin: OriginId,
        file_buffer_size: usize,
        file_layout: FileLayout,
    ) -> Result<Self> {
        let working_dir = working_dir.into();
        fs::create_dir_all(&working_dir).map_err(|e| SliceStoreError::io(&working_dir, e))?;
        let controller = Self {
            working_dir,
            origin,
            file_buffer_size,
            file_layout,
        };
        // files of an earlier run with the same origin are never read again
        let stale = controller.delete_all()?;
        if stale > 0 {
            info!(
                "removed {} stale spill files from {}",
                stale,
                controller.working_dir.display()
            );
        }
        Ok(controller)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn file_layout(&self) -> FileLayout {
        self.file_layout
    }

    fn prefix(&self) -> String {
        format!("memory_controller_{}_", self.origin)
    }

    /// Base path of the spill files; the streams append `.dat` and `_key.dat`.
    pub fn path(&self, slice_end: Timestamp, thread: WorkerThreadId, side: JoinSide) -> PathBuf {
        self.working_dir
            .join(format!("{}{}_{}_{}", self.prefix(), slice_end, thread, side))
    }

    /// Opens the spill files for appending to what an earlier spill left there.
    pub fn writer(
        &self,
        slice_end: Timestamp,
        thread: WorkerThreadId,
        side: JoinSide,
        provider: &dyn BufferProvider,
    ) -> Result<FileWriter> {
        FileWriter::new(
            &self.path(slice_end, thread, side),
            provider,
            self.file_buffer_size,
        )
    }

    /// Opens the spill files for the first spill of a paged vector, discarding their content.
    pub fn create_writer(
        &self,
        slice_end: Timestamp,
        thread: WorkerThreadId,
        side: JoinSide,
        provider: &dyn BufferProvider,
    ) -> Result<FileWriter> {
        FileWriter::create(
            &self.path(slice_end, thread, side),
            provider,
            self.file_buffer_size,
        )
    }

    pub fn reader(
        &self,
        slice_end: Timestamp,
        thread: WorkerThreadId,
        side: JoinSide,
        provider: &dyn BufferProvider,
    ) -> Result<FileReader> {
        FileReader::new(
            &self.path(slice_end, thread, side),
            provider,
            self.file_buffer_size,
        )
    }

    pub fn delete_files(
        &self,
        slice_end: Timestamp,
        thread: WorkerThreadId,
        side: JoinSide,
    ) -> Result<()> {
        let path = self.path(slice_end, thread, side);
        for file in [value_path(&path), key_path(&path)] {
            match fs::remove_file(&file) {
                Ok(()) => debug!("removed spill file {}", file.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(SliceStoreError::io(file, e)),
            }
        }
        Ok(())
    }

    /// Removes every spill file of this origin from the working directory and returns how many
    /// were removed.
    pub fn delete_all(&self) -> Result<usize> {
        let prefix = self.prefix();
        let entries =
            fs::read_dir(&self.working_dir).map_err(|e| SliceStoreError::io(&self.working_dir, e))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| SliceStoreError::io(&self.working_dir, e))?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!("failed to remove spill file {}: {}", entry.path().display(), e)
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sluice_types::HeapBufferProvider;

    #[test]
    fn test_paths_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let controller =
            MemoryController::new(dir.path().join("spill"), OriginId(3), 16, FileLayout::NoSeparation)
                .unwrap();
        assert_eq!(
            controller.path(Timestamp(2000), WorkerThreadId(1), JoinSide::Right),
            dir.path().join("spill/memory_controller_3_2000_1_right")
        );

        let provider = HeapBufferProvider::new(64);
        for thread in 0..2 {
            let mut writer = controller
                .writer(Timestamp(2000), WorkerThreadId(thread), JoinSide::Left, &provider)
                .unwrap();
            writer.write(b"hello").unwrap();
        }
        let base = controller.path(Timestamp(2000), WorkerThreadId(0), JoinSide::Left);
        assert!(value_path(&base).exists());
        assert!(key_path(&base).exists());

        controller
            .delete_files(Timestamp(2000), WorkerThreadId(0), JoinSide::Left)
            .unwrap();
        assert!(!value_path(&base).exists());
        // deleting twice is fine
        controller
            .delete_files(Timestamp(2000), WorkerThreadId(0), JoinSide::Left)
            .unwrap();

        assert_eq!(controller.delete_all().unwrap(), 2);
        assert_eq!(fs::read_dir(controller.working_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_new_removes_files_of_earlier_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("memory_controller_3_100_0_left.dat"), [0xAAu8; 8]).unwrap();
        fs::write(dir.path().join("memory_controller_3_100_0_left_key.dat"), b"").unwrap();
        fs::write(dir.path().join("memory_controller_4_100_0_left.dat"), b"other").unwrap();

        let controller =
            MemoryController::new(dir.path(), OriginId(3), 0, FileLayout::NoSeparation).unwrap();
        let mut names: Vec<_> = fs::read_dir(controller.working_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["memory_controller_4_100_0_left.dat".to_string()]);
    }
}
