//! Single-writer/multi-reader spill buffer. One producer appends to a temp
//! file; any number of readers follow along from arbitrary offsets, waiting
//! for the writer when they catch up. Not a plain file (readers block at
//! the write frontier) and not a channel (readers can start at any offset
//! and re-read).

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
struct Progress {
    len: u64,
    closed: bool,
}

pub struct Swmr {
    file: File,
    progress: watch::Sender<Progress>,
    users: AtomicUsize,
}

impl Swmr {
    pub fn new(file: File) -> Arc<Self> {
        let (progress, _) = watch::channel(Progress {
            len: 0,
            closed: false,
        });
        Arc::new(Self {
            file,
            progress,
            users: AtomicUsize::new(0),
        })
    }

    /// Appends a chunk. Only the producing task may call this.
    pub fn append(&self, chunk: &[u8]) -> io::Result<()> {
        let offset = self.progress.borrow().len;
        self.file.write_all_at(chunk, offset)?;
        self.progress.send_modify(|p| p.len += chunk.len() as u64);
        Ok(())
    }

    /// Closes the writer side. Readers drain whatever was appended and then
    /// see end-of-stream; new readers may still be created.
    pub fn close(&self) {
        self.progress.send_modify(|p| p.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.progress.borrow().closed
    }

    pub fn len(&self) -> u64 {
        self.progress.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live readers.
    pub fn users(&self) -> usize {
        self.users.load(Ordering::SeqCst)
    }

    pub fn reader(self: Arc<Self>, offset: u64) -> SwmrReader {
        self.users.fetch_add(1, Ordering::SeqCst);
        SwmrReader {
            rx: self.progress.subscribe(),
            swmr: self,
            pos: offset,
        }
    }
}

/// Forward reader over the spill buffer. `next_chunk` waits for the writer
/// whenever the cursor reaches the write frontier.
pub struct SwmrReader {
    rx: watch::Receiver<Progress>,
    swmr: Arc<Swmr>,
    pos: u64,
}

impl SwmrReader {
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Returns up to `max` bytes at the cursor, waiting for the producer if
    /// none are available yet. An empty result means end-of-stream.
    pub async fn next_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        loop {
            let progress = *self.rx.borrow_and_update();
            if self.pos < progress.len {
                let want = ((progress.len - self.pos) as usize).min(max.max(1));
                let mut buf = vec![0u8; want];
                self.swmr.file.read_exact_at(&mut buf, self.pos)?;
                self.pos += want as u64;
                return Ok(Bytes::from(buf));
            }
            if progress.closed || self.rx.changed().await.is_err() {
                return Ok(Bytes::new());
            }
        }
    }
}

impl Drop for SwmrReader {
    fn drop(&mut self) {
        self.swmr.users.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file() -> File {
        tempfile::tempfile().expect("tempfile")
    }

    async fn drain(mut reader: SwmrReader) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let chunk = reader.next_chunk(8).await.expect("read");
            if chunk.is_empty() {
                return out;
            }
            out.extend_from_slice(&chunk);
        }
    }

    #[tokio::test]
    async fn reader_follows_writer() {
        let swmr = Swmr::new(scratch_file());
        let reader = Arc::clone(&swmr).reader(0);

        let writer = Arc::clone(&swmr);
        let producer = tokio::spawn(async move {
            for part in [&b"hel"[..], b"lo ", b"world"] {
                writer.append(part).expect("append");
                tokio::task::yield_now().await;
            }
            writer.close();
        });

        let body = drain(reader).await;
        producer.await.expect("producer");
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn late_reader_sees_all_bytes() {
        let swmr = Swmr::new(scratch_file());
        swmr.append(b"0123456789").expect("append");
        swmr.close();

        assert_eq!(drain(Arc::clone(&swmr).reader(0)).await, b"0123456789");
        assert_eq!(drain(Arc::clone(&swmr).reader(4)).await, b"456789");
    }

    #[tokio::test]
    async fn users_are_counted() {
        let swmr = Swmr::new(scratch_file());
        assert_eq!(swmr.users(), 0);
        let a = Arc::clone(&swmr).reader(0);
        let b = Arc::clone(&swmr).reader(0);
        assert_eq!(swmr.users(), 2);
        drop(a);
        drop(b);
        assert_eq!(swmr.users(), 0);
    }

    #[tokio::test]
    async fn close_with_no_data_is_eof() {
        let swmr = Swmr::new(scratch_file());
        swmr.close();
        assert!(swmr.is_closed());
        let mut reader = Arc::clone(&swmr).reader(0);
        assert!(reader.next_chunk(16).await.expect("read").is_empty());
    }
}
