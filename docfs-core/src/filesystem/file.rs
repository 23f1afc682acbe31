use super::Overlay;
use crate::backend::ByteStream;
use crate::document::SyncDocument;
use crate::error::{Error, Result};
use crate::identity::Identity;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::warn;

/// Flags after which a close refreshes the document from the real file.
const WRITE_FLAGS: i32 = libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND | libc::O_TRUNC;

/// A file opened through the overlay.
///
/// Content goes straight to the real file. The document is created or refreshed once, on
/// [`close`](OverlayFile::close), and only when the file was opened for writing. Dropping an
/// open file closes it and logs any failure.
pub struct OverlayFile {
    overlay: Overlay,
    ctx: Identity,
    path: String,
    flags: i32,
    stream: Option<Box<dyn ByteStream>>,
}

impl OverlayFile {
    pub(super) fn new(overlay: Overlay, ctx: Identity, path: String, flags: i32, stream: Box<dyn ByteStream>) -> Self {
        Self {
            overlay,
            ctx,
            path,
            flags,
            stream: Some(stream),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Who opened the file; a created file's document is owned by them.
    pub fn identity(&self) -> &Identity {
        &self.ctx
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Release the real file and bring the metadata up to date.
    ///
    /// Returns the documents written. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<Vec<SyncDocument>> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(Vec::new());
        };
        let flushed = stream.flush();
        drop(stream);
        if let Err(e) = flushed {
            return Err(Error::io("flush", &self.path, e));
        }
        if self.flags & WRITE_FLAGS == 0 {
            return Ok(Vec::new());
        }
        self.overlay.close_written(&self.ctx, &self.path, self.flags)
    }

    fn stream(&mut self) -> io::Result<&mut Box<dyn ByteStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "file is closed"))
    }
}

impl Read for OverlayFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for OverlayFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

impl Seek for OverlayFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.stream()?.seek(pos)
    }
}

impl Drop for OverlayFile {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.close() {
            warn!(path = %self.path, error = %e, "closing file failed");
        }
    }
}
