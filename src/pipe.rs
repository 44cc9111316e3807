//! The CDP pipe transport: two OS pipes wired to the child's fds 3 and 4,
//! carrying NUL-terminated JSON frames in both directions.

use std::io::{self, Read, Write};

use crate::error::{CdpError, Result};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Both pipe pairs needed to talk to a chromium child.
///
/// The child reads commands on its fd 3 and writes responses on its fd 4;
/// the parent keeps the opposite ends. The child-side ends are dropped by
/// [`PipePair::into_parent`] once the child holds its own copies, so the
/// parent observes EOF when the child exits.
#[derive(Debug)]
pub struct PipePair {
    parent_reader: os_pipe::PipeReader,
    parent_writer: os_pipe::PipeWriter,
    child_reader: os_pipe::PipeReader,
    child_writer: os_pipe::PipeWriter,
}

impl PipePair {
    pub fn new() -> io::Result<Self> {
        // parent -> child commands; the child reads this on fd 3
        let (child_reader, parent_writer) = os_pipe::pipe()?;
        // child -> parent responses; the child writes this on fd 4
        let (parent_reader, child_writer) = os_pipe::pipe()?;
        Ok(Self {
            parent_reader,
            parent_writer,
            child_reader,
            child_writer,
        })
    }

    /// Raw descriptors of the child-side ends, for the `pre_exec` shim that
    /// renumbers them to 3 and 4.
    #[cfg(unix)]
    pub fn child_raw_fds(&self) -> (i32, i32) {
        (self.child_reader.as_raw_fd(), self.child_writer.as_raw_fd())
    }

    /// Drop the child-side ends and keep the parent's transport.
    pub fn into_parent(self) -> Pipe {
        Pipe {
            reader: PipeReadEnd {
                inner: Some(self.parent_reader),
                buf: Vec::new(),
            },
            writer: PipeWriteEnd {
                inner: Some(self.parent_writer),
            },
        }
    }
}

/// The parent side of the transport.
#[derive(Debug)]
pub struct Pipe {
    reader: PipeReadEnd,
    writer: PipeWriteEnd,
}

impl Pipe {
    /// Split into independently owned halves so reads and writes can live on
    /// different worker threads.
    pub fn split(self) -> (PipeReadEnd, PipeWriteEnd) {
        (self.reader, self.writer)
    }

    /// Close both ends. Idempotent.
    pub fn close(&mut self) {
        self.reader.close();
        self.writer.close();
    }

    /// Build a transport from raw halves; used by the tests to stand in a
    /// scripted browser on the far ends.
    pub fn from_raw(reader: os_pipe::PipeReader, writer: os_pipe::PipeWriter) -> Self {
        Pipe {
            reader: PipeReadEnd {
                inner: Some(reader),
                buf: Vec::new(),
            },
            writer: PipeWriteEnd {
                inner: Some(writer),
            },
        }
    }
}

/// The read half: blocking reads, split on the NUL delimiter, with any
/// trailing partial frame retained for the next call.
#[derive(Debug)]
pub struct PipeReadEnd {
    inner: Option<os_pipe::PipeReader>,
    buf: Vec<u8>,
}

impl PipeReadEnd {
    /// Block until at least one complete frame is available and return every
    /// complete frame buffered so far.
    ///
    /// Returns [`CdpError::PipeClosed`] once the other end has closed and no
    /// complete frame remains.
    pub fn read_frames(&mut self) -> Result<Vec<Vec<u8>>> {
        let Some(reader) = self.inner.as_mut() else {
            return Err(CdpError::PipeClosed);
        };
        let mut chunk = [0u8; 8192];
        loop {
            if self.buf.contains(&0u8) {
                return Ok(split_frames(&mut self.buf));
            }
            match reader.read(&mut chunk) {
                Ok(0) => {
                    if !self.buf.is_empty() {
                        tracing::warn!(
                            bytes = self.buf.len(),
                            "pipe closed mid-frame, discarding partial frame"
                        );
                        self.buf.clear();
                    }
                    self.close();
                    return Err(CdpError::PipeClosed);
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    self.close();
                    return Err(CdpError::PipeClosed);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn close(&mut self) {
        self.inner.take();
    }
}

/// The write half. A frame is written whole: the bytes, then a single NUL.
#[derive(Debug)]
pub struct PipeWriteEnd {
    inner: Option<os_pipe::PipeWriter>,
}

impl PipeWriteEnd {
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let Some(writer) = self.inner.as_mut() else {
            return Err(CdpError::PipeClosed);
        };
        let res = writer
            .write_all(frame)
            .and_then(|()| writer.write_all(&[0u8]))
            .and_then(|()| writer.flush());
        match res {
            Ok(()) => Ok(()),
            Err(err)
                if err.kind() == io::ErrorKind::BrokenPipe
                    || err.kind() == io::ErrorKind::WriteZero =>
            {
                self.close();
                Err(CdpError::PipeClosed)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn close(&mut self) {
        self.inner.take();
    }
}

fn split_frames(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == 0) {
        let mut frame: Vec<u8> = buf.drain(..=pos).collect();
        frame.pop();
        frames.push(frame);
    }
    frames
}

/// Renumber the inherited pipe ends to the fds chromium demands and move the
/// child into its own process group. Runs between `fork` and `exec`, so only
/// async-signal-safe calls are allowed.
#[cfg(unix)]
pub(crate) fn install_child_ends(read_fd: i32, write_fd: i32) -> io::Result<()> {
    unsafe {
        // Lift both ends clear of the 3/4 range first so the renumbering
        // cannot clobber one with the other.
        let read_fd = if read_fd == 3 || read_fd == 4 {
            cvt(libc::fcntl(read_fd, libc::F_DUPFD, 5))?
        } else {
            read_fd
        };
        let write_fd = if write_fd == 3 || write_fd == 4 {
            cvt(libc::fcntl(write_fd, libc::F_DUPFD, 5))?
        } else {
            write_fd
        };
        // dup2 leaves the duplicate without close-on-exec, which is exactly
        // what the child needs.
        cvt(libc::dup2(read_fd, 3))?;
        cvt(libc::dup2(write_fd, 4))?;
        cvt(libc::setpgid(0, 0))?;
    }
    Ok(())
}

#[cfg(unix)]
fn cvt(ret: i32) -> io::Result<i32> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn frames_split_on_nul_and_retain_partial() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let mut end = PipeReadEnd {
            inner: Some(reader),
            buf: Vec::new(),
        };

        writer
            .write_all(b"{\"id\":1}\0{\"id\":2}\0{\"id\"")
            .unwrap();
        let frames = end.read_frames().unwrap();
        assert_eq!(frames, vec![b"{\"id\":1}".to_vec(), b"{\"id\":2}".to_vec()]);

        // the tail of the third frame arrives later
        writer.write_all(b":3}\0").unwrap();
        let frames = end.read_frames().unwrap();
        assert_eq!(frames, vec![b"{\"id\":3}".to_vec()]);
    }

    #[test]
    fn empty_frames_are_preserved_for_the_codec() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let mut end = PipeReadEnd {
            inner: Some(reader),
            buf: Vec::new(),
        };
        writer.write_all(b"\0{bye}\0").unwrap();
        let frames = end.read_frames().unwrap();
        assert_eq!(frames, vec![Vec::new(), b"{bye}".to_vec()]);
    }

    #[test]
    fn eof_reports_closed_and_stays_closed() {
        let (reader, writer) = os_pipe::pipe().unwrap();
        let mut end = PipeReadEnd {
            inner: Some(reader),
            buf: Vec::new(),
        };
        drop(writer);
        assert!(matches!(end.read_frames(), Err(CdpError::PipeClosed)));
        // idempotent after close
        assert!(matches!(end.read_frames(), Err(CdpError::PipeClosed)));
    }

    #[test]
    fn write_frame_appends_delimiter() {
        let (mut reader, writer) = os_pipe::pipe().unwrap();
        let mut end = PipeWriteEnd {
            inner: Some(writer),
        };
        end.write_frame(b"{\"id\":7}").unwrap();
        end.close();

        let mut all = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut all).unwrap();
        assert_eq!(all, b"{\"id\":7}\0");
        assert!(matches!(
            end.write_frame(b"{}"),
            Err(CdpError::PipeClosed)
        ));
    }
}
