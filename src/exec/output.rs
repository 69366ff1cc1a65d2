/// Bounded stdio collection for traced processes
///
/// Each stream is drained on its own thread. Bytes beyond the cap are
/// discarded, or the process group is killed when the caller asks for it.
use super::process::ProcessKiller;
use crate::config::types::OutputStream;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::thread;

pub(crate) fn capture_stream(
    mut file: File,
    stream: OutputStream,
    limit: usize,
    kill_on_limit: bool,
    killer: ProcessKiller,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        let mut overflowed = false;

        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if overflowed {
                        continue;
                    }
                    if out.len() + n > limit {
                        let remaining = limit.saturating_sub(out.len());
                        out.extend_from_slice(&buf[..remaining]);
                        overflowed = true;
                        killer.record_output_limit(stream, limit);
                        if kill_on_limit {
                            killer.kill();
                            break;
                        }
                        continue;
                    }
                    out.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{} capture stopped: {}", stream, e);
                    break;
                }
            }
        }

        out
    })
}

/// Write `data` to the child's stdin and close it. A child that exits
/// without reading everything is not an error.
pub(crate) fn feed_stdin(mut file: File, data: Vec<u8>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if let Err(e) = file.write_all(&data) {
            if e.kind() != ErrorKind::BrokenPipe {
                log::debug!("stdin feed stopped: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    fn pipe() -> (File, File) {
        let (r, w) = nix::unistd::pipe().unwrap();
        // SAFETY: fresh descriptors owned by nobody else
        unsafe { (File::from_raw_fd(r), File::from_raw_fd(w)) }
    }

    #[test]
    fn test_capture_under_limit_keeps_everything() {
        let (r, mut w) = pipe();
        let handle = capture_stream(r, OutputStream::Stdout, 64, false, ProcessKiller::detached());
        w.write_all(b"hello\n").unwrap();
        drop(w);
        assert_eq!(handle.join().unwrap(), b"hello\n");
    }

    #[test]
    fn test_capture_over_limit_truncates_and_records() {
        let (r, mut w) = pipe();
        let killer = ProcessKiller::detached();
        let handle = capture_stream(r, OutputStream::Stderr, 4, false, killer.clone());
        w.write_all(b"0123456789").unwrap();
        drop(w);
        assert_eq!(handle.join().unwrap(), b"0123");
        assert_eq!(killer.output_limit(), Some((OutputStream::Stderr, 4)));
    }

    #[test]
    fn test_feed_stdin_tolerates_closed_reader() {
        let (r, w) = pipe();
        drop(r);
        feed_stdin(w, vec![b'x'; 1 << 20]).join().unwrap();
    }
}
