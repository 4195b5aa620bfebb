//! Thread-per-connection deployment.
//!
//! A blocking accept loop hands each socket to the auto-scaling
//! executor; pool workers run a blocking read/execute/write loop over
//! the same parser and command layer the reactor uses. Saturation of
//! the pool (queue full, every worker busy at the ceiling) drops the
//! connection instead of queueing it forever.

use crate::command::{self, Outcome};
use crate::config::Config;
use crate::executor::Executor;
use crate::protocol::{self, Parser, Response};
use crate::storage::LruStorage;
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 4096;

/// Command lines longer than this can only be garbage.
const MAX_COMMAND_LINE: usize = 4096;

pub fn run(config: &Config, storage: Arc<Mutex<LruStorage>>) -> io::Result<()> {
    let executor = Executor::new(
        config.low_watermark,
        config.high_watermark,
        config.max_queue_size,
        config.idle_time,
    );
    executor.start();

    let listener = TcpListener::bind(&config.listen)?;
    info!(addr = %config.listen, "starting blocking runtime");

    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                debug!(peer = %peer_addr, "accepted connection");
                let ratio = executor.size_ratio();
                if ratio > 0.9 {
                    warn!(ratio, "worker pool near capacity");
                }
                let storage = Arc::clone(&storage);
                let accepted = executor.execute(move || {
                    if let Err(e) = serve_client(stream, &storage) {
                        debug!(error = %e, "connection error");
                    }
                });
                if !accepted {
                    warn!(peer = %peer_addr, "worker pool saturated, dropping connection");
                }
            }
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

/// Serve one client until it quits, closes, or the transport fails.
fn serve_client<S: Read + Write>(mut stream: S, storage: &Mutex<LruStorage>) -> io::Result<()> {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if !drain_commands(&mut buffer, &mut stream, storage)? {
            return Ok(());
        }
    }
}

/// Execute every complete command in `buffer`, writing replies as they
/// finish. Returns false on `quit`.
fn drain_commands<S: Read + Write>(
    buffer: &mut BytesMut,
    stream: &mut S,
    storage: &Mutex<LruStorage>,
) -> io::Result<bool> {
    loop {
        let parsed = match Parser::parse(&buffer[..]) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                if buffer.len() > MAX_COMMAND_LINE {
                    debug!("command line too long");
                    write_reply(stream, Response::error())?;
                    buffer.clear();
                }
                return Ok(true);
            }
            Err(e) => {
                debug!(error = %e, "parse error");
                write_reply(stream, Response::error())?;
                match protocol::find_recovery_point(&buffer[..]) {
                    Some(pos) => {
                        buffer.advance(pos);
                        continue;
                    }
                    None => {
                        buffer.clear();
                        return Ok(true);
                    }
                }
            }
        };

        let (total, data) = if parsed.command.expects_data() {
            let total = parsed.consumed + parsed.arg_len + 2;
            if buffer.len() < total {
                // Wait for the rest of the data block.
                return Ok(true);
            }
            let data_end = parsed.consumed + parsed.arg_len;
            if &buffer[data_end..total] != b"\r\n" {
                debug!("data block missing line terminator");
                write_reply(stream, Response::error())?;
                buffer.advance(total);
                continue;
            }
            (total, buffer[parsed.consumed..data_end].to_vec())
        } else {
            (parsed.consumed, Vec::new())
        };

        let outcome = {
            let mut guard = storage.lock().unwrap();
            command::execute(&parsed.command, &mut guard, &data)
        };
        buffer.advance(total);
        match outcome {
            Outcome::Reply(reply) => write_reply(stream, reply)?,
            Outcome::Close => return Ok(false),
        }
    }
}

fn write_reply<S: Write>(stream: &mut S, mut reply: Vec<u8>) -> io::Result<()> {
    reply.extend_from_slice(b"\r\n");
    stream.write_all(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Blocking-style stream: reads return scripted chunks, then EOF.
    struct FakeStream {
        reads: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl FakeStream {
        fn new(reads: &[&[u8]]) -> Self {
            FakeStream {
                reads: reads.iter().map(|r| r.to_vec()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                None => Ok(0),
            }
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_session(reads: &[&[u8]], storage: &Mutex<LruStorage>) -> Vec<u8> {
        let mut stream = FakeStream::new(reads);
        let written = {
            let session = serve_client(&mut stream, storage);
            assert!(session.is_ok());
            stream.written
        };
        written
    }

    #[test]
    fn full_session_round_trip() {
        let storage = Mutex::new(LruStorage::new(1024));
        let written = run_session(
            &[b"set greeting 5\r\nhello\r\n", b"get greeting\r\n"],
            &storage,
        );
        assert_eq!(written, b"STORED\r\nVALUE greeting 5\r\nhello\r\nEND\r\n");
    }

    #[test]
    fn storage_command_split_across_reads() {
        let storage = Mutex::new(LruStorage::new(1024));
        let written = run_session(&[b"set k 4", b" \r\nab", b"cd\r\nget k\r\n"], &storage);
        assert_eq!(written, b"STORED\r\nVALUE k 4\r\nabcd\r\nEND\r\n");
    }

    #[test]
    fn quit_ends_the_session() {
        let storage = Mutex::new(LruStorage::new(1024));
        let written = run_session(&[b"quit\r\nget ignored\r\n"], &storage);
        assert_eq!(written, b"");
    }

    #[test]
    fn bad_command_gets_error_and_session_continues() {
        let storage = Mutex::new(LruStorage::new(1024));
        let written = run_session(&[b"nonsense\r\nversion\r\n"], &storage);
        let expected = format!("ERROR\r\nVERSION {}\r\n", env!("CARGO_PKG_VERSION"));
        assert_eq!(written, expected.as_bytes());
    }
}
