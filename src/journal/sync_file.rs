use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use super::file::{
    error_code, list_with_extension, BufferCallback, IoCallback, IoErrorListener, SequentialFile,
    SequentialFileFactory,
};
use super::{JournalError, JournalResult};

/// A journal file written with plain buffered I/O on the caller's thread.
/// Callbacks fire before `write` returns.
#[derive(Debug)]
pub struct SyncSequentialFile {
    directory: PathBuf,
    name: Mutex<String>,
    file: Mutex<Option<File>>,
    position: AtomicU64,
    listener: Option<Arc<dyn IoErrorListener>>,
}

impl SyncSequentialFile {
    pub fn new(directory: &Path, name: &str, listener: Option<Arc<dyn IoErrorListener>>) -> Self {
        Self {
            directory: directory.to_path_buf(),
            name: Mutex::new(name.to_string()),
            file: Mutex::new(None),
            position: AtomicU64::new(0),
            listener,
        }
    }

    fn report(&self, e: &std::io::Error) {
        if let Some(listener) = &self.listener {
            listener.on_io_error(error_code(e), &e.to_string(), &self.file_name());
        }
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> std::io::Result<T>) -> JournalResult<T> {
        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| JournalError::FileNotOpen(self.file_name()))?;
        op(file).map_err(|e| {
            self.report(&e);
            JournalError::Io(e)
        })
    }
}

impl SequentialFile for SyncSequentialFile {
    fn file_name(&self) -> String {
        self.name.lock().clone()
    }

    fn path(&self) -> PathBuf {
        self.directory.join(&*self.name.lock())
    }

    fn open(&self) -> JournalResult<()> {
        let mut guard = self.file.lock();
        if guard.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path())
            .inspect_err(|e| self.report(e))?;
        *guard = Some(file);
        self.position.store(0, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    fn close(&self) -> JournalResult<()> {
        if let Some(file) = self.file.lock().take() {
            file.sync_all().inspect_err(|e| self.report(e))?;
        }
        Ok(())
    }

    fn alignment(&self) -> usize {
        1
    }

    fn fill(&self, position: u64, size: u64, fill: u8) -> JournalResult<()> {
        const CHUNK: usize = 64 * 1024;
        let block = vec![fill; CHUNK.min(size as usize).max(1)];
        self.with_file(|file| {
            file.seek(SeekFrom::Start(position))?;
            let mut remaining = size as usize;
            while remaining > 0 {
                let n = remaining.min(block.len());
                file.write_all(&block[..n])?;
                remaining -= n;
            }
            file.sync_data()
        })
    }

    fn size(&self) -> JournalResult<u64> {
        self.with_file(|file| Ok(file.metadata()?.len()))
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    fn write(
        &self,
        buffer: BytesMut,
        sync: bool,
        callback: Option<Arc<dyn IoCallback>>,
    ) -> JournalResult<()> {
        // Position moves under the file lock and only past written bytes,
        // so a failed write leaves no gap.
        let result = self.with_file(|file| {
            let position = self.position.load(Ordering::Acquire);
            file.seek(SeekFrom::Start(position))?;
            file.write_all(&buffer)?;
            if sync {
                file.sync_data()?;
            }
            self.position
                .store(position + buffer.len() as u64, Ordering::Release);
            Ok(())
        });
        if let Some(callback) = callback {
            match &result {
                Ok(()) => callback.done(),
                Err(e) => callback.on_error(-1, &e.to_string()),
            }
        }
        result
    }

    fn read(&self, position: u64, buf: &mut [u8]) -> JournalResult<usize> {
        self.with_file(|file| {
            file.seek(SeekFrom::Start(position))?;
            let mut total = 0;
            while total < buf.len() {
                match file.read(&mut buf[total..])? {
                    0 => break,
                    n => total += n,
                }
            }
            Ok(total)
        })
    }

    fn sync(&self) -> JournalResult<()> {
        self.with_file(|file| file.sync_data())
    }

    fn rename_to(&self, new_name: &str) -> JournalResult<()> {
        let from = self.path();
        let to = self.directory.join(new_name);
        fs::rename(&from, &to).inspect_err(|e| self.report(e))?;
        *self.name.lock() = new_name.to_string();
        Ok(())
    }

    fn delete(&self) -> JournalResult<()> {
        self.file.lock().take();
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                self.report(&e);
                Err(e.into())
            }
        }
    }

    fn set_buffer_callback(&self, _callback: Option<Arc<dyn BufferCallback>>) {
        // Buffers are dropped as soon as `write` returns.
    }
}

#[derive(Debug)]
pub struct SyncSequentialFileFactory {
    directory: PathBuf,
    listener: RwLock<Option<Arc<dyn IoErrorListener>>>,
}

impl SyncSequentialFileFactory {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            listener: RwLock::new(None),
        }
    }
}

impl SequentialFileFactory for SyncSequentialFileFactory {
    fn directory(&self) -> &Path {
        &self.directory
    }

    fn create_sequential_file(&self, name: &str) -> Arc<dyn SequentialFile> {
        Arc::new(SyncSequentialFile::new(
            &self.directory,
            name,
            self.listener.read().clone(),
        ))
    }

    fn list_files(&self, extension: &str) -> JournalResult<Vec<String>> {
        list_with_extension(&self.directory, extension)
    }

    fn supports_callbacks(&self) -> bool {
        false
    }

    fn set_io_error_listener(&self, listener: Arc<dyn IoErrorListener>) {
        *self.listener.write() = Some(listener);
    }

    fn on_io_error(&self, code: i32, message: &str, file: &str) {
        warn!(target: "relaymq::journal", code, file, "I/O error: {message}");
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_io_error(code, message, file);
        }
    }

    fn new_buffer(&self, size: usize) -> BytesMut {
        BytesMut::with_capacity(size)
    }

    fn release_buffer(&self, _buffer: BytesMut) {}

    fn alignment(&self) -> usize {
        1
    }
}
