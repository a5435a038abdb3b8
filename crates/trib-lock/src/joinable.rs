//! The joinable stream engine.
//!
//! One [`JoinableFile`] is hosted by the entry of the path being streamed.
//! It carries the append-only byte sequence produced by the writer (or the
//! materialized on-disk content when opened read-first) and signals waiting
//! readers through a condvar whenever bytes arrive or the writer completes.
//! Readers therefore block only while no new bytes are available and the
//! writer has not signaled end-of-data; there is no polling.

use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

/// Producer/multi-consumer byte stream bound to one file entry.
pub struct JoinableFile {
    path: PathBuf,
    state: Mutex<StreamState>,
    data_ready: Condvar,
}

struct StreamState {
    buffer: Vec<u8>,
    writer_active: bool,
    readers: usize,
}

impl JoinableFile {
    /// A stream with an active producer; bytes arrive through [`append`].
    ///
    /// [`append`]: JoinableFile::append
    pub(crate) fn for_write(path: PathBuf, capacity: usize) -> Self {
        Self {
            path,
            state: Mutex::new(StreamState {
                buffer: Vec::with_capacity(capacity),
                writer_active: true,
                readers: 0,
            }),
            data_ready: Condvar::new(),
        }
    }

    /// A read-only stream over already-materialized content.
    pub(crate) fn for_read(path: PathBuf, content: Vec<u8>) -> Self {
        Self {
            path,
            state: Mutex::new(StreamState {
                buffer: content,
                writer_active: false,
                readers: 0,
            }),
            data_ready: Condvar::new(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Append produced bytes and wake joined readers. Only the single writer
    /// handle calls this, and only after the bytes are durably written
    /// through to the underlying file.
    pub(crate) fn append(&self, bytes: &[u8]) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.writer_active, "append after end-of-data");
        st.buffer.extend_from_slice(bytes);
        self.data_ready.notify_all();
    }

    /// Signal end-of-data. Idempotent; wakes all joined readers.
    pub(crate) fn finish_write(&self) {
        let mut st = self.state.lock().unwrap();
        st.writer_active = false;
        self.data_ready.notify_all();
    }

    pub(crate) fn writer_active(&self) -> bool {
        self.state.lock().unwrap().writer_active
    }

    pub(crate) fn attach_reader(&self) {
        self.state.lock().unwrap().readers += 1;
    }

    /// Detach one reader; true when no handles remain attached and the
    /// instance should leave its entry.
    pub(crate) fn detach_reader(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.readers == 0 {
            panic!("reader detached twice from {}", self.path.display());
        }
        st.readers -= 1;
        st.readers == 0 && !st.writer_active
    }

    /// True when neither the writer nor any reader remains attached.
    pub(crate) fn idle(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.readers == 0 && !st.writer_active
    }

    /// Copy bytes starting at `offset` into `out`, blocking while the buffer
    /// has nothing new and the writer is still producing. Returns 0 only at
    /// end-of-data.
    pub(crate) fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut st = self.state.lock().unwrap();
        loop {
            if offset < st.buffer.len() {
                let n = out.len().min(st.buffer.len() - offset);
                out[..n].copy_from_slice(&st.buffer[offset..offset + n]);
                return n;
            }
            if !st.writer_active {
                return 0;
            }
            st = self.data_ready.wait(st).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_only_stream_reads_to_eof() {
        let j = JoinableFile::for_read(PathBuf::from("/f"), b"payload".to_vec());
        let mut out = [0u8; 16];
        let n = j.read_at(0, &mut out);
        assert_eq!(&out[..n], b"payload");
        assert_eq!(j.read_at(n, &mut out), 0);
    }

    #[test]
    fn test_appended_bytes_are_immediately_visible() {
        let j = JoinableFile::for_write(PathBuf::from("/f"), 64);
        j.append(b"abc");
        let mut out = [0u8; 8];
        assert_eq!(j.read_at(0, &mut out), 3);
        j.append(b"def");
        assert_eq!(j.read_at(3, &mut out), 3);
        assert_eq!(&out[..3], b"def");
    }

    #[test]
    fn test_reader_blocks_until_writer_finishes() {
        let j = Arc::new(JoinableFile::for_write(PathBuf::from("/f"), 64));
        j.append(b"head");

        let reader = {
            let j = Arc::clone(&j);
            thread::spawn(move || {
                let mut collected = Vec::new();
                let mut buf = [0u8; 4];
                let mut pos = 0;
                loop {
                    let n = j.read_at(pos, &mut buf);
                    if n == 0 {
                        break;
                    }
                    collected.extend_from_slice(&buf[..n]);
                    pos += n;
                }
                collected
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        j.append(b"tail");
        j.finish_write();

        assert_eq!(reader.join().unwrap(), b"headtail");
    }

    #[test]
    fn test_detach_reports_last_handle() {
        let j = JoinableFile::for_write(PathBuf::from("/f"), 64);
        j.attach_reader();
        j.attach_reader();
        assert!(!j.detach_reader());
        j.finish_write();
        assert!(j.detach_reader());
        assert!(j.idle());
    }
}
