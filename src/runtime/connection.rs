//! Per-socket connection state machine.
//!
//! Drives readiness events into command executions without ever
//! blocking: `do_read` drains the socket and walks the
//! parse / fill-argument / execute loop over a fixed read buffer;
//! `do_write` performs one scatter-write over the queued responses.
//! The reactor owns registration and teardown; it consults `is_alive`
//! after every call and `wants_write` to decide the interest set.

use crate::command::{self, Outcome};
use crate::protocol::{self, Command, Parser, Response};
use crate::storage::LruStorage;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Fixed read buffer size per connection.
pub const READ_BUFFER_SIZE: usize = 4096;

pub struct Connection<S> {
    stream: S,
    is_alive: AtomicBool,
    read_buf: Box<[u8; READ_BUFFER_SIZE]>,
    /// Fill level of `read_buf`.
    read_bytes: usize,
    /// Command parsed off the wire, waiting for its data block.
    command: Option<Command>,
    /// Accumulated data block, including its trailing `\r\n`.
    argument: Vec<u8>,
    /// Bytes still needed to complete the data block.
    arg_remains: usize,
    output_queue: VecDeque<Vec<u8>>,
    /// Cumulative bytes of the front response already written. Reset
    /// only when that element is fully written.
    head_written: usize,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        Connection {
            stream,
            is_alive: AtomicBool::new(true),
            read_buf: Box::new([0u8; READ_BUFFER_SIZE]),
            read_bytes: 0,
            command: None,
            argument: Vec::new(),
            arg_remains: 0,
            output_queue: VecDeque::new(),
            head_written: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    /// Peer hangup.
    pub fn on_close(&self) {
        self.is_alive.store(false, Ordering::Release);
    }

    /// Transport fault.
    pub fn on_error(&self) {
        self.is_alive.store(false, Ordering::Release);
    }

    /// True while responses are queued; the reactor keeps WRITABLE
    /// interest set exactly then.
    pub fn wants_write(&self) -> bool {
        !self.output_queue.is_empty()
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Drain the socket and process complete commands. Stops on
    /// `WouldBlock`, peer close, or a transport error.
    pub fn do_read(&mut self, storage: &Mutex<LruStorage>) {
        loop {
            match self.stream.read(&mut self.read_buf[self.read_bytes..]) {
                Ok(0) => {
                    debug!("peer closed connection");
                    self.on_close();
                    return;
                }
                Ok(n) => {
                    self.read_bytes += n;
                    self.process_buffer(storage);
                    if !self.is_alive() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "read failed");
                    self.on_error();
                    return;
                }
            }
        }
    }

    /// One scatter-write over the queued responses. Returns true when
    /// progress was made and output remains, so the caller can drain
    /// further.
    pub fn do_write(&mut self) -> bool {
        if self.output_queue.is_empty() {
            return false;
        }
        let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(self.output_queue.len());
        let mut chunks = self.output_queue.iter();
        if let Some(front) = chunks.next() {
            iov.push(IoSlice::new(&front[self.head_written..]));
        }
        for chunk in chunks {
            iov.push(IoSlice::new(chunk));
        }

        let written = match self.stream.write_vectored(&iov) {
            Ok(0) => {
                warn!("write returned zero");
                self.on_error();
                return false;
            }
            Ok(n) => n,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return false;
            }
            Err(ref e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("peer went away mid-write");
                self.on_close();
                return false;
            }
            Err(e) => {
                warn!(error = %e, "write failed");
                self.on_error();
                return false;
            }
        };
        self.account_written(written);
        !self.output_queue.is_empty()
    }

    /// Walk the buffer: parse a command line, fill its data block,
    /// execute once complete. Repeats until the buffer runs dry or a
    /// command needs more bytes.
    fn process_buffer(&mut self, storage: &Mutex<LruStorage>) {
        while self.read_bytes > 0 {
            if self.command.is_none() {
                match Parser::parse(&self.read_buf[..self.read_bytes]) {
                    Ok(Some(parsed)) => {
                        self.arg_remains = if parsed.command.expects_data() {
                            parsed.arg_len + 2
                        } else {
                            0
                        };
                        self.argument.clear();
                        self.command = Some(parsed.command);
                        self.consume(parsed.consumed);
                    }
                    Ok(None) => {
                        if self.read_bytes == self.read_buf.len() {
                            // The line can never complete.
                            warn!("command line exceeds read buffer");
                            self.enqueue_response(Response::error());
                            self.read_bytes = 0;
                        }
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "parse error");
                        self.enqueue_response(Response::error());
                        // Resynchronize at the next line boundary.
                        match protocol::find_recovery_point(&self.read_buf[..self.read_bytes]) {
                            Some(pos) => {
                                self.consume(pos);
                                continue;
                            }
                            None => {
                                self.read_bytes = 0;
                                break;
                            }
                        }
                    }
                }
            }

            if self.arg_remains > 0 {
                let take = self.arg_remains.min(self.read_bytes);
                self.argument.extend_from_slice(&self.read_buf[..take]);
                self.arg_remains -= take;
                self.consume(take);
            }

            if let Some(cmd) = self.command.take() {
                if self.arg_remains > 0 {
                    // Data block still incomplete.
                    self.command = Some(cmd);
                    break;
                }
                if !self.finish_command(&cmd, storage) {
                    self.read_bytes = 0;
                    self.on_close();
                    break;
                }
            }
        }
    }

    /// Execute a fully assembled command and queue its reply. Returns
    /// false when the connection should close.
    fn finish_command(&mut self, command: &Command, storage: &Mutex<LruStorage>) -> bool {
        let data_len = if self.argument.is_empty() {
            0
        } else if self.argument.ends_with(b"\r\n") {
            self.argument.len() - 2
        } else {
            debug!("data block missing line terminator");
            self.argument.clear();
            self.enqueue_response(Response::error());
            return true;
        };
        let outcome = {
            let mut guard = storage.lock().unwrap();
            command::execute(command, &mut guard, &self.argument[..data_len])
        };
        self.argument.clear();
        match outcome {
            Outcome::Reply(reply) => {
                self.enqueue_response(reply);
                true
            }
            Outcome::Close => false,
        }
    }

    fn enqueue_response(&mut self, mut reply: Vec<u8>) {
        reply.extend_from_slice(b"\r\n");
        self.output_queue.push_back(reply);
    }

    /// Drop `n` processed bytes from the front of the read buffer.
    fn consume(&mut self, n: usize) {
        self.read_buf.copy_within(n..self.read_bytes, 0);
        self.read_bytes -= n;
    }

    /// Advance the queue by `written` bytes, popping fully written
    /// responses and tracking the offset into the partially written
    /// front.
    fn account_written(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.output_queue.front() else {
                break;
            };
            let remaining = front.len() - self.head_written;
            if written >= remaining {
                written -= remaining;
                self.output_queue.pop_front();
                self.head_written = 0;
            } else {
                self.head_written += written;
                written = 0;
            }
        }
    }
}
