use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;

use super::JournalResult;

/// Error code reported when the OS gives none.
pub const GENERIC_IO_ERROR: i32 = -1;

/// Completion of one write.
pub trait IoCallback: Send + Sync {
    fn done(&self);

    fn on_error(&self, code: i32, message: &str);
}

/// Receives write buffers back once the bytes are on disk.
pub trait BufferCallback: Send + Sync {
    fn buffer_done(&self, buffer: BytesMut);
}

/// Told about every I/O failure of a factory's files.
pub trait IoErrorListener: Send + Sync {
    fn on_io_error(&self, code: i32, message: &str, file: &str);
}

impl fmt::Debug for dyn IoCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IoCallback")
    }
}

impl fmt::Debug for dyn BufferCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BufferCallback")
    }
}

impl fmt::Debug for dyn IoErrorListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IoErrorListener")
    }
}

/// A file written front to back. Writes go to the current position, which
/// then advances; reads are positioned.
pub trait SequentialFile: Send + Sync + fmt::Debug {
    fn file_name(&self) -> String;

    fn path(&self) -> PathBuf;

    fn open(&self) -> JournalResult<()>;

    fn is_open(&self) -> bool;

    fn close(&self) -> JournalResult<()>;

    fn alignment(&self) -> usize;

    /// Rounds `position` up to the next aligned offset.
    fn calculate_block_start(&self, position: u64) -> u64 {
        align_up(position, self.alignment() as u64)
    }

    /// Writes `size` bytes of `fill` starting at `position`.
    fn fill(&self, position: u64, size: u64, fill: u8) -> JournalResult<()>;

    fn size(&self) -> JournalResult<u64>;

    fn position(&self) -> u64;

    fn set_position(&self, position: u64);

    /// Writes `buffer` at the current position. With a callback the call
    /// may return before the bytes are written; the callback fires once
    /// they are (and are synced when `sync` is set).
    fn write(
        &self,
        buffer: BytesMut,
        sync: bool,
        callback: Option<Arc<dyn IoCallback>>,
    ) -> JournalResult<()>;

    /// Reads into `buf` from `position`. Returns the bytes read.
    fn read(&self, position: u64, buf: &mut [u8]) -> JournalResult<usize>;

    fn sync(&self) -> JournalResult<()>;

    fn rename_to(&self, new_name: &str) -> JournalResult<()>;

    fn delete(&self) -> JournalResult<()>;

    fn set_buffer_callback(&self, callback: Option<Arc<dyn BufferCallback>>);

    /// True once a write failed after later writes were already placed
    /// behind it. Nothing more may be appended to the file.
    fn is_broken(&self) -> bool {
        false
    }
}

pub trait SequentialFileFactory: Send + Sync + fmt::Debug {
    fn directory(&self) -> &Path;

    fn create_sequential_file(&self, name: &str) -> Arc<dyn SequentialFile>;

    /// File names in the directory ending with `.{extension}`.
    fn list_files(&self, extension: &str) -> JournalResult<Vec<String>>;

    fn supports_callbacks(&self) -> bool;

    fn set_io_error_listener(&self, listener: Arc<dyn IoErrorListener>);

    fn on_io_error(&self, code: i32, message: &str, file: &str);

    fn new_buffer(&self, size: usize) -> BytesMut;

    fn release_buffer(&self, buffer: BytesMut);

    fn alignment(&self) -> usize;

    fn calculate_block_size(&self, size: usize) -> usize {
        align_up(size as u64, self.alignment() as u64) as usize
    }

    fn start(&self) {}

    fn stop(&self) {}

    fn create_dirs(&self) -> JournalResult<()> {
        std::fs::create_dir_all(self.directory())?;
        Ok(())
    }

    /// Waits for every write submitted so far.
    fn flush(&self) {}
}

#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

pub(crate) fn list_with_extension(directory: &Path, extension: &str) -> JournalResult<Vec<String>> {
    let suffix = format!(".{extension}");
    let mut names = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(&suffix) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

pub(crate) fn error_code(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(GENERIC_IO_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_blocks() {
        assert_eq!(align_up(0, 512), 0);
        assert_eq!(align_up(1, 512), 512);
        assert_eq!(align_up(512, 512), 512);
        assert_eq!(align_up(513, 512), 1024);
        assert_eq!(align_up(7, 1), 7);
    }
}
