use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::buffer::BufferPool;
use super::file::{
    error_code, list_with_extension, BufferCallback, IoCallback, IoErrorListener, SequentialFile,
    SequentialFileFactory, GENERIC_IO_ERROR,
};
use super::{JournalError, JournalResult};

pub const ASYNC_ALIGNMENT: usize = 512;

enum Request {
    Write {
        position: u64,
        buffer: BytesMut,
        sync: bool,
        callback: Option<Arc<dyn IoCallback>>,
    },
    /// Completes once every earlier request has been written.
    Flush {
        sync: bool,
        done: flume::Sender<std::io::Result<()>>,
    },
}

struct Writer {
    tx: flume::Sender<Request>,
    handle: JoinHandle<()>,
}

type SharedFile = Arc<Mutex<Option<File>>>;
type SharedBufferCallback = Arc<RwLock<Option<Arc<dyn BufferCallback>>>>;

/// A journal file whose writes are queued to a dedicated writer thread.
/// Writes complete in submission order; at most `max_io` may be queued.
/// After a failed write the writer skips everything queued behind it and
/// the file refuses new writes until reopened.
pub struct AsyncSequentialFile {
    directory: PathBuf,
    name: Mutex<String>,
    file: SharedFile,
    position: AtomicU64,
    broken: Arc<AtomicBool>,
    max_io: usize,
    writer: Mutex<Option<Writer>>,
    listener: Option<Arc<dyn IoErrorListener>>,
    buffer_callback: SharedBufferCallback,
}

impl std::fmt::Debug for AsyncSequentialFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSequentialFile")
            .field("name", &*self.name.lock())
            .field("position", &self.position())
            .field("open", &self.is_open())
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl AsyncSequentialFile {
    pub fn new(
        directory: &Path,
        name: &str,
        max_io: usize,
        listener: Option<Arc<dyn IoErrorListener>>,
    ) -> Self {
        Self {
            directory: directory.to_path_buf(),
            name: Mutex::new(name.to_string()),
            file: Arc::new(Mutex::new(None)),
            position: AtomicU64::new(0),
            broken: Arc::new(AtomicBool::new(false)),
            max_io: max_io.max(1),
            writer: Mutex::new(None),
            listener,
            buffer_callback: Arc::new(RwLock::new(None)),
        }
    }

    fn report(&self, e: &std::io::Error) {
        if let Some(listener) = &self.listener {
            listener.on_io_error(error_code(e), &e.to_string(), &self.file_name());
        }
    }

    /// Waits until every write queued so far has reached the file.
    pub fn flush_pending(&self, sync: bool) -> JournalResult<()> {
        let tx = match self.writer.lock().as_ref() {
            Some(writer) => writer.tx.clone(),
            None => return Ok(()),
        };
        let (done_tx, done_rx) = flume::bounded(1);
        tx.send(Request::Flush { sync, done: done_tx })
            .map_err(|_| JournalError::WriterStopped)?;
        match done_rx.recv() {
            Ok(result) => result.map_err(JournalError::Io),
            Err(_) => Err(JournalError::WriterStopped),
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

fn run_writer(
    name: String,
    file: SharedFile,
    broken: Arc<AtomicBool>,
    rx: flume::Receiver<Request>,
    listener: Option<Arc<dyn IoErrorListener>>,
    buffer_callback: SharedBufferCallback,
) {
    while let Ok(request) = rx.recv() {
        match request {
            Request::Write {
                position,
                buffer,
                sync,
                callback,
            } => {
                if broken.load(Ordering::Acquire) {
                    if let Some(callback) = callback {
                        callback.on_error(GENERIC_IO_ERROR, "an earlier write to this file failed");
                    }
                    if let Some(recycle) = buffer_callback.read().clone() {
                        recycle.buffer_done(buffer);
                    }
                    continue;
                }
                let result = match file.lock().as_mut() {
                    Some(f) => f
                        .seek(SeekFrom::Start(position))
                        .and_then(|_| f.write_all(&buffer))
                        .and_then(|_| if sync { f.sync_data() } else { Ok(()) }),
                    None => Err(std::io::Error::other("file closed")),
                };
                match result {
                    Ok(()) => {
                        if let Some(callback) = callback {
                            callback.done();
                        }
                    }
                    Err(e) => {
                        broken.store(true, Ordering::Release);
                        let code = error_code(&e);
                        let message = e.to_string();
                        warn!(target: "relaymq::journal", file = %name, code, "async write failed: {message}");
                        if let Some(listener) = &listener {
                            listener.on_io_error(code, &message, &name);
                        }
                        if let Some(callback) = callback {
                            callback.on_error(code, &message);
                        }
                    }
                }
                if let Some(recycle) = buffer_callback.read().clone() {
                    recycle.buffer_done(buffer);
                }
            }
            Request::Flush { sync, done } => {
                let result = if sync {
                    match file.lock().as_ref() {
                        Some(f) => f.sync_data(),
                        None => Ok(()),
                    }
                } else {
                    Ok(())
                };
                let _ = done.send(result);
            }
        }
    }
    debug!(target: "relaymq::journal", file = %name, "writer thread exiting");
}

impl SequentialFile for AsyncSequentialFile {
    fn file_name(&self) -> String {
        self.name.lock().clone()
    }

    fn path(&self) -> PathBuf {
        self.directory.join(&*self.name.lock())
    }

    fn open(&self) -> JournalResult<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path())
            .inspect_err(|e| self.report(e))?;
        *self.file.lock() = Some(file);
        self.position.store(0, Ordering::Release);
        self.broken.store(false, Ordering::Release);

        let (tx, rx) = flume::bounded(self.max_io);
        let name = self.file_name();
        let shared = self.file.clone();
        let broken = self.broken.clone();
        let listener = self.listener.clone();
        let buffer_callback = self.buffer_callback.clone();
        let handle = std::thread::Builder::new()
            .name(format!("relaymq-aio-{name}"))
            .spawn(move || run_writer(name, shared, broken, rx, listener, buffer_callback))?;
        *writer = Some(Writer { tx, handle });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    fn close(&self) -> JournalResult<()> {
        if let Some(Writer { tx, handle }) = self.writer.lock().take() {
            drop(tx);
            if handle.join().is_err() {
                warn!(target: "relaymq::journal", file = %self.file_name(), "writer thread panicked");
            }
        }
        if let Some(file) = self.file.lock().take() {
            file.sync_all().inspect_err(|e| self.report(e))?;
        }
        Ok(())
    }

    fn alignment(&self) -> usize {
        ASYNC_ALIGNMENT
    }

    fn fill(&self, position: u64, size: u64, fill: u8) -> JournalResult<()> {
        self.flush_pending(false)?;
        let block = vec![fill; (64 * 1024).min(size as usize).max(1)];
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
        let tx = match self.writer.lock().as_ref() {
            Some(writer) => writer.tx.clone(),
            None => {
                if let Some(callback) = callback {
                    callback.on_error(GENERIC_IO_ERROR, "file is not open");
                }
                return Err(JournalError::FileNotOpen(self.file_name()));
            }
        };
        if self.is_broken() {
            if let Some(callback) = callback {
                callback.on_error(GENERIC_IO_ERROR, "an earlier write to this file failed");
            }
            return Err(JournalError::FileBroken(self.file_name()));
        }
        let position = self.position.fetch_add(buffer.len() as u64, Ordering::AcqRel);
        let request = Request::Write {
            position,
            buffer,
            sync,
            callback,
        };
        // Blocks while `max_io` writes are already queued.
        if let Err(flume::SendError(request)) = tx.send(request) {
            if let Request::Write {
                callback: Some(callback),
                ..
            } = request
            {
                callback.on_error(GENERIC_IO_ERROR, "writer stopped");
            }
            return Err(JournalError::WriterStopped);
        }
        Ok(())
    }

    fn read(&self, position: u64, buf: &mut [u8]) -> JournalResult<usize> {
        self.flush_pending(false)?;
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
        if self.writer.lock().is_some() {
            return self.flush_pending(true);
        }
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
        if self.is_open() {
            self.close()?;
        }
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                self.report(&e);
                Err(e.into())
            }
        }
    }

    fn set_buffer_callback(&self, callback: Option<Arc<dyn BufferCallback>>) {
        *self.buffer_callback.write() = callback;
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct AsyncSequentialFileFactory {
    directory: PathBuf,
    max_io: usize,
    buffers: Arc<BufferPool>,
    listener: RwLock<Option<Arc<dyn IoErrorListener>>>,
    files: Mutex<Vec<Weak<AsyncSequentialFile>>>,
}

impl AsyncSequentialFileFactory {
    pub fn new(directory: impl Into<PathBuf>, max_io: usize, buffer_size: usize) -> Self {
        Self {
            directory: directory.into(),
            max_io: max_io.max(1),
            buffers: Arc::new(BufferPool::new(buffer_size, max_io.max(1))),
            listener: RwLock::new(None),
            files: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    fn live_files(&self) -> Vec<Arc<AsyncSequentialFile>> {
        let mut files = self.files.lock();
        files.retain(|f| f.strong_count() > 0);
        files.iter().filter_map(Weak::upgrade).collect()
    }
}

impl SequentialFileFactory for AsyncSequentialFileFactory {
    fn directory(&self) -> &Path {
        &self.directory
    }

    fn create_sequential_file(&self, name: &str) -> Arc<dyn SequentialFile> {
        let file = Arc::new(AsyncSequentialFile::new(
            &self.directory,
            name,
            self.max_io,
            self.listener.read().clone(),
        ));
        file.set_buffer_callback(Some(self.buffers.clone() as Arc<dyn BufferCallback>));
        self.files.lock().push(Arc::downgrade(&file));
        file
    }

    fn list_files(&self, extension: &str) -> JournalResult<Vec<String>> {
        list_with_extension(&self.directory, extension)
    }

    fn supports_callbacks(&self) -> bool {
        true
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
        self.buffers.get(self.calculate_block_size(size))
    }

    fn release_buffer(&self, buffer: BytesMut) {
        self.buffers.release(buffer);
    }

    fn alignment(&self) -> usize {
        ASYNC_ALIGNMENT
    }

    fn stop(&self) {
        self.flush();
        self.buffers.clear();
    }

    fn flush(&self) {
        for file in self.live_files() {
            if let Err(e) = file.flush_pending(false) {
                debug!(target: "relaymq::journal", file = %file.file_name(), error = %e, "flush skipped");
            }
        }
    }
}
