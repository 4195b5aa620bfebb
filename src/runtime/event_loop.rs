//! mio reactor for the nonblocking deployment.
//!
//! Each reactor thread owns a Poll instance, a SO_REUSEPORT listener,
//! and the connections it accepted (the kernel balances accepts across
//! listeners, so every connection is touched by exactly one thread).
//! The store is shared behind a single mutex. One worker is the
//! single-threaded variant; N workers the multi-threaded one.
//!
//! mio delivers edge-triggered readiness, so handlers drain: reads loop
//! until `WouldBlock` inside `do_read`, and `do_write` is re-invoked
//! while it makes progress and output remains.

use crate::config::Config;
use crate::runtime::connection::Connection;
use crate::storage::LruStorage;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;

/// A reactor-owned connection plus its registered interest set.
struct Conn {
    inner: Connection<TcpStream>,
    interest: Interest,
}

pub fn run(config: &Config, storage: Arc<Mutex<LruStorage>>) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    info!(
        workers = config.workers,
        addr = %addr,
        "starting nonblocking runtime"
    );

    let mut handles = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let storage = Arc::clone(&storage);
        let max_connections = config.max_connections;
        let handle = thread::Builder::new()
            .name(format!("reactor-{worker_id}"))
            .spawn(move || {
                if let Err(e) = reactor_loop(worker_id, addr, max_connections, &storage) {
                    error!(worker = worker_id, error = %e, "reactor failed");
                }
            })?;
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn reactor_loop(
    worker_id: usize,
    addr: SocketAddr,
    max_connections: usize,
    storage: &Mutex<LruStorage>,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    let listener = bind_reuseport(addr)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut connections: Slab<Conn> = Slab::with_capacity(max_connections);

    info!(worker = worker_id, "reactor started");

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &listener,
                        &mut poll,
                        &mut connections,
                        max_connections,
                        worker_id,
                    )?;
                }
                Token(conn_id) => {
                    handle_connection_event(conn_id, event, &mut poll, &mut connections, storage);
                }
            }
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<Conn>,
    max_connections: usize,
    worker_id: usize,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if connections.len() >= max_connections {
                    warn!("connection limit reached, dropping connection");
                    continue;
                }
                let entry = connections.vacant_entry();
                let token = Token(entry.key());
                let mut conn = Conn {
                    inner: Connection::new(stream),
                    interest: Interest::READABLE,
                };
                poll.registry()
                    .register(conn.inner.stream_mut(), token, conn.interest)?;
                debug!(
                    worker = worker_id,
                    conn_id = token.0,
                    peer = %peer_addr,
                    "accepted connection"
                );
                entry.insert(conn);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        }
    }
    Ok(())
}

fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    poll: &mut Poll,
    connections: &mut Slab<Conn>,
    storage: &Mutex<LruStorage>,
) {
    let alive = {
        let Some(conn) = connections.get_mut(conn_id) else {
            return;
        };
        if event.is_error() {
            conn.inner.on_error();
        } else {
            if event.is_readable() || event.is_read_closed() {
                conn.inner.do_read(storage);
            }
            if event.is_writable() && conn.inner.is_alive() {
                while conn.inner.do_write() {}
            }
        }
        if conn.inner.is_alive() {
            update_interest(poll, conn, conn_id);
        }
        conn.inner.is_alive()
    };

    if !alive {
        close_connection(poll, connections, conn_id);
    }
}

/// WRITABLE interest is set exactly while responses are queued.
fn update_interest(poll: &mut Poll, conn: &mut Conn, conn_id: usize) {
    let desired = if conn.inner.wants_write() {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if desired == conn.interest {
        return;
    }
    match poll
        .registry()
        .reregister(conn.inner.stream_mut(), Token(conn_id), desired)
    {
        Ok(()) => conn.interest = desired,
        Err(e) => {
            warn!(conn_id, error = %e, "reregister failed");
            conn.inner.on_error();
        }
    }
}

fn close_connection(poll: &mut Poll, connections: &mut Slab<Conn>, conn_id: usize) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        let _ = poll.registry().deregister(conn.inner.stream_mut());
        debug!(conn_id, "connection closed");
    }
}

/// TCP listener with SO_REUSEPORT so every reactor can bind the same
/// address and let the kernel spread accepts.
fn bind_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
