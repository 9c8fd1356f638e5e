//! Pull/push byte streams over in-memory buffers.
//!
//! The engine consumes module binaries, mounted files and state snapshots
//! through a reader (engine asks for bytes) and produces unmounted files and
//! snapshots through a writer (engine hands bytes over). Both sides are plain
//! cursors over memory; the C-ABI thunks at the bottom adapt them to the
//! `(userdata, data, size)` callbacks of the native engine.

use std::ffi::c_void;
use std::io;

/// Bounded reader over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct StreamReader<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    /// Create a reader positioned at the start of `buffer`.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    /// Copy up to `out.len()` bytes into `out`.
    ///
    /// Returns the number of bytes copied, which is 0 exactly when the
    /// underlying data is exhausted.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let remaining = self.remaining();
        if remaining == 0 {
            return 0;
        }

        let len = out.len().min(remaining);
        out[..len].copy_from_slice(&self.buffer[self.pos..self.pos + len]);
        self.pos += len;
        len
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Total size of the underlying buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the underlying buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether every byte has been read.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

impl io::Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(StreamReader::read(self, buf))
    }
}

/// Unbounded writer that owns its buffer.
///
/// Growth is exact: each write that runs past the end extends the backing
/// store to precisely the new total, with no geometric over-allocation.
#[derive(Debug, Clone, Default)]
pub struct StreamWriter {
    buffer: Vec<u8>,
    pos: usize,
}

impl StreamWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` at the cursor.
    pub fn write(&mut self, data: &[u8]) {
        let len_rm = self.buffer.len() - self.pos;
        if data.len() > len_rm {
            let grow = data.len() - len_rm;
            self.buffer.reserve_exact(grow);
            self.buffer.resize(self.buffer.len() + grow, 0);
        }

        self.buffer[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Allocated capacity of the backing store.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// View the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the written bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl io::Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        StreamWriter::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read callback for the native engine.
///
/// # Safety
///
/// `userdata` must point to a live `StreamReader` and `data` must be valid
/// for `size` bytes of writes.
pub unsafe extern "C" fn read_thunk(userdata: *mut c_void, data: *mut c_void, size: usize) -> usize {
    if size == 0 || data.is_null() {
        return 0;
    }
    let reader = &mut *(userdata as *mut StreamReader<'_>);
    let out = std::slice::from_raw_parts_mut(data as *mut u8, size);
    reader.read(out)
}

/// Write callback for the native engine. Always reports success (0).
///
/// # Safety
///
/// `userdata` must point to a live `StreamWriter` and `data` must be valid
/// for `size` bytes of reads.
pub unsafe extern "C" fn write_thunk(userdata: *mut c_void, data: *mut c_void, size: usize) -> i32 {
    if size == 0 || data.is_null() {
        return 0;
    }
    let writer = &mut *(userdata as *mut StreamWriter);
    let input = std::slice::from_raw_parts(data as *const u8, size);
    writer.write(input);
    0
}
