// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stream-socket channels with zmq-style roles: a router serving many
//! request/reply clients, publishers fanning a message out to every
//! connected peer and subscribers receiving them. Endpoints can be bound
//! (accepting peers) or connected (a single upstream peer); either end of a
//! pub/sub pair may be the binding side.
//!
//! Socket I/O runs on internal threads. Inbound frames surface on a
//! crossbeam channel so a single-threaded control loop can multiplex every
//! channel with `select!`; outbound frames are serviced by the [`IoContext`]
//! writer pool, sized by the `--io-threads` option.

use crate::endpoint::Endpoint;
use crate::framing;
use crate::message::IpcMessage;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub type ConnId = u64;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum HubEvent {
    Connected(ConnId),
    Disconnected(ConnId),
    Message(ConnId, Vec<Vec<u8>>),
}

enum Sock {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Sock {
    fn try_clone(&self) -> io::Result<Sock> {
        match self {
            Sock::Tcp(s) => Ok(Sock::Tcp(s.try_clone()?)),
            Sock::Unix(s) => Ok(Sock::Unix(s.try_clone()?)),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Sock::Tcp(s) => s.set_read_timeout(timeout),
            Sock::Unix(s) => s.set_read_timeout(timeout),
        }
    }
}

impl Read for Sock {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Sock::Tcp(s) => s.read(buf),
            Sock::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Sock {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sock::Tcp(s) => s.write(buf),
            Sock::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sock::Tcp(s) => s.flush(),
            Sock::Unix(s) => s.flush(),
        }
    }
}

struct ConnState {
    id: ConnId,
    writer: Mutex<Sock>,
    alive: AtomicBool,
}

struct WriteJob {
    conn: Arc<ConnState>,
    parts: Arc<Vec<Vec<u8>>>,
}

/// Pool of writer threads shared by every channel in the process.
#[derive(Clone)]
pub struct IoContext {
    workers: Arc<Vec<Sender<WriteJob>>>,
}

impl IoContext {
    pub fn new(io_threads: usize) -> Self {
        let count = io_threads.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = unbounded::<WriteJob>();
            thread::Builder::new()
                .name(format!("ipc-io-{index}"))
                .spawn(move || {
                    for job in rx.iter() {
                        if !job.conn.alive.load(Ordering::Acquire) {
                            continue;
                        }
                        let parts: Vec<&[u8]> = job.parts.iter().map(|p| p.as_slice()).collect();
                        let result = {
                            let mut writer = match job.conn.writer.lock() {
                                Ok(writer) => writer,
                                Err(_) => continue,
                            };
                            framing::write_parts(&mut *writer, &parts)
                        };
                        if let Err(e) = result {
                            debug!("dropping connection {} on write error: {e}", job.conn.id);
                            job.conn.alive.store(false, Ordering::Release);
                        }
                    }
                })
                .expect("failed to spawn ipc writer thread");
            workers.push(tx);
        }
        IoContext {
            workers: Arc::new(workers),
        }
    }

    fn submit(&self, conn: Arc<ConnState>, parts: Arc<Vec<Vec<u8>>>) {
        // Route by connection id so per-connection ordering is preserved.
        let index = (conn.id % self.workers.len() as u64) as usize;
        let _ = self.workers[index].send(WriteJob { conn, parts });
    }
}

struct HubShared {
    conns: Mutex<HashMap<ConnId, Arc<ConnState>>>,
    events: Sender<HubEvent>,
    running: AtomicBool,
    next_id: AtomicU64,
}

/// One bound or connected stream endpoint plus its service threads.
pub struct StreamHub {
    shared: Arc<HubShared>,
    events_rx: Receiver<HubEvent>,
    io: IoContext,
    ipc_path: Option<PathBuf>,
}

impl StreamHub {
    pub fn bind(endpoint: &Endpoint, io: &IoContext) -> io::Result<StreamHub> {
        let (events, events_rx) = unbounded();
        let shared = Arc::new(HubShared {
            conns: Mutex::new(HashMap::new()),
            events,
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });
        let mut ipc_path = None;
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())?;
                listener.set_nonblocking(true)?;
                spawn_acceptor(shared.clone(), Listener::Tcp(listener));
            }
            Endpoint::Ipc(path) => {
                // A stale socket file from a previous run blocks the bind
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                ipc_path = Some(path.clone());
                spawn_acceptor(shared.clone(), Listener::Unix(listener));
            }
        }
        Ok(StreamHub {
            shared,
            events_rx,
            io: io.clone(),
            ipc_path,
        })
    }

    pub fn connect(endpoint: &Endpoint, io: &IoContext) -> io::Result<StreamHub> {
        let (events, events_rx) = unbounded();
        let shared = Arc::new(HubShared {
            conns: Mutex::new(HashMap::new()),
            events,
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });
        let sock = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())?;
                stream.set_nodelay(true)?;
                Sock::Tcp(stream)
            }
            Endpoint::Ipc(path) => Sock::Unix(UnixStream::connect(path)?),
        };
        register_conn(&shared, sock)?;
        Ok(StreamHub {
            shared,
            events_rx,
            io: io.clone(),
            ipc_path: None,
        })
    }

    pub fn events(&self) -> &Receiver<HubEvent> {
        &self.events_rx
    }

    pub fn send_to(&self, conn_id: ConnId, parts: Vec<Vec<u8>>) -> bool {
        let conn = {
            let conns = match self.shared.conns.lock() {
                Ok(conns) => conns,
                Err(_) => return false,
            };
            conns.get(&conn_id).cloned()
        };
        match conn {
            Some(conn) => {
                self.io.submit(conn, Arc::new(parts));
                true
            }
            None => false,
        }
    }

    pub fn broadcast(&self, parts: Vec<Vec<u8>>) {
        let parts = Arc::new(parts);
        let conns: Vec<Arc<ConnState>> = match self.shared.conns.lock() {
            Ok(conns) => conns.values().cloned().collect(),
            Err(_) => return,
        };
        for conn in conns {
            self.io.submit(conn, parts.clone());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.conns.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Drop for StreamHub {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(path) = &self.ipc_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

fn spawn_acceptor(shared: Arc<HubShared>, listener: Listener) {
    thread::Builder::new()
        .name("ipc-accept".to_string())
        .spawn(move || {
            while shared.running.load(Ordering::Acquire) {
                let accepted = match &listener {
                    Listener::Tcp(l) => l.accept().map(|(s, _)| {
                        // accepted sockets must not inherit the listener's
                        // non-blocking mode
                        let _ = s.set_nonblocking(false);
                        let _ = s.set_nodelay(true);
                        Sock::Tcp(s)
                    }),
                    Listener::Unix(l) => l.accept().map(|(s, _)| {
                        let _ = s.set_nonblocking(false);
                        Sock::Unix(s)
                    }),
                };
                match accepted {
                    Ok(sock) => {
                        if let Err(e) = register_conn(&shared, sock) {
                            warn!("failed to register accepted connection: {e}");
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                }
            }
        })
        .expect("failed to spawn ipc accept thread");
}

fn register_conn(shared: &Arc<HubShared>, sock: Sock) -> io::Result<()> {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let mut reader = sock.try_clone()?;
    reader.set_read_timeout(Some(READ_POLL_INTERVAL))?;
    let conn = Arc::new(ConnState {
        id,
        writer: Mutex::new(sock),
        alive: AtomicBool::new(true),
    });
    if let Ok(mut conns) = shared.conns.lock() {
        conns.insert(id, conn.clone());
    }
    let _ = shared.events.send(HubEvent::Connected(id));

    let shared = shared.clone();
    thread::Builder::new()
        .name(format!("ipc-read-{id}"))
        .spawn(move || {
            loop {
                let mut poll_reader = PollRead {
                    inner: &mut reader,
                    shared: &shared,
                    conn: &conn,
                };
                match framing::read_parts(&mut poll_reader) {
                    Ok(parts) => {
                        trace!("connection {id} received {} part frame", parts.len());
                        if shared.events.send(HubEvent::Message(id, parts)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            conn.alive.store(false, Ordering::Release);
            if let Ok(mut conns) = shared.conns.lock() {
                conns.remove(&id);
            }
            let _ = shared.events.send(HubEvent::Disconnected(id));
        })
        .expect("failed to spawn ipc reader thread");
    Ok(())
}

/// Read adapter that retries the socket's poll-interval timeouts while the
/// hub and connection are still live, so mid-frame reads never lose sync.
struct PollRead<'a> {
    inner: &'a mut Sock,
    shared: &'a Arc<HubShared>,
    conn: &'a Arc<ConnState>,
}

impl Read for PollRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    if !self.shared.running.load(Ordering::Acquire)
                        || !self.conn.alive.load(Ordering::Acquire)
                    {
                        return Err(io::Error::new(io::ErrorKind::Other, "channel shut down"));
                    }
                }
                other => return other,
            }
        }
    }
}

/// Request/reply server side: many clients, replies addressed per client.
pub struct RouterChannel {
    hub: StreamHub,
}

impl RouterChannel {
    pub fn bind(endpoint: &Endpoint, io: &IoContext) -> io::Result<RouterChannel> {
        Ok(RouterChannel {
            hub: StreamHub::bind(endpoint, io)?,
        })
    }

    pub fn events(&self) -> &Receiver<HubEvent> {
        self.hub.events()
    }

    pub fn send(&self, conn_id: ConnId, msg: &IpcMessage) {
        self.hub.send_to(conn_id, vec![msg.encode()]);
    }
}

/// Request/reply client side.
pub struct DealerChannel {
    hub: StreamHub,
}

impl DealerChannel {
    pub fn connect(endpoint: &Endpoint, io: &IoContext) -> io::Result<DealerChannel> {
        Ok(DealerChannel {
            hub: StreamHub::connect(endpoint, io)?,
        })
    }

    pub fn send(&self, msg: &IpcMessage) {
        self.hub.broadcast(vec![msg.encode()]);
    }

    /// Wait for the next message frame, skipping connection lifecycle events.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<IpcMessage> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            match self.hub.events().recv_timeout(remaining) {
                Ok(HubEvent::Message(_, parts)) => {
                    return IpcMessage::decode(parts.first()?).ok();
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Fan-out publisher. May bind (peers connect to us) or connect (we feed a
/// single bound subscriber).
pub struct PubChannel {
    hub: StreamHub,
}

impl PubChannel {
    pub fn bind(endpoint: &Endpoint, io: &IoContext) -> io::Result<PubChannel> {
        Ok(PubChannel {
            hub: StreamHub::bind(endpoint, io)?,
        })
    }

    pub fn connect(endpoint: &Endpoint, io: &IoContext) -> io::Result<PubChannel> {
        Ok(PubChannel {
            hub: StreamHub::connect(endpoint, io)?,
        })
    }

    pub fn publish(&self, msg: &IpcMessage) {
        self.hub.broadcast(vec![msg.encode()]);
    }

    pub fn publish_parts(&self, parts: Vec<Vec<u8>>) {
        self.hub.broadcast(parts);
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.connection_count()
    }
}

/// Subscriber. May connect to a bound publisher or bind and accept
/// connecting publishers.
pub struct SubChannel {
    hub: StreamHub,
}

impl SubChannel {
    pub fn bind(endpoint: &Endpoint, io: &IoContext) -> io::Result<SubChannel> {
        Ok(SubChannel {
            hub: StreamHub::bind(endpoint, io)?,
        })
    }

    pub fn connect(endpoint: &Endpoint, io: &IoContext) -> io::Result<SubChannel> {
        Ok(SubChannel {
            hub: StreamHub::connect(endpoint, io)?,
        })
    }

    pub fn events(&self) -> &Receiver<HubEvent> {
        self.hub.events()
    }

    /// Send a message upstream. Used for buffer config requests on the
    /// frame-ready subscription.
    pub fn send(&self, msg: &IpcMessage) {
        self.hub.broadcast(vec![msg.encode()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgType, MsgVal};
    use serde_json::json;

    fn free_tcp_endpoint() -> Endpoint {
        // Bind to an ephemeral port to find a free one, then release it.
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        Endpoint::Tcp(format!("127.0.0.1:{port}"))
    }

    #[test]
    fn router_dealer_request_reply() {
        let io = IoContext::new(2);
        let endpoint = free_tcp_endpoint();
        let router = RouterChannel::bind(&endpoint, &io).unwrap();
        let dealer = DealerChannel::connect(&endpoint, &io).unwrap();

        let mut request = IpcMessage::new(MsgType::Cmd, MsgVal::Status).with_id(3);
        request.set_param("view", json!("all"));
        dealer.send(&request);

        let (client, received) = loop {
            match router.events().recv_timeout(Duration::from_secs(5)).unwrap() {
                HubEvent::Message(id, parts) => {
                    break (id, IpcMessage::decode(&parts[0]).unwrap())
                }
                _ => continue,
            }
        };
        assert_eq!(received.msg_id, 3);
        assert_eq!(received.get_str("view").unwrap(), "all");

        router.send(client, &IpcMessage::ack(&received));
        let reply = dealer.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(reply.is_ack());
        assert_eq!(reply.msg_id, 3);
    }

    #[test]
    fn pub_sub_fan_out() {
        let io = IoContext::new(1);
        let endpoint = free_tcp_endpoint();
        let publisher = PubChannel::bind(&endpoint, &io).unwrap();
        let sub_a = SubChannel::connect(&endpoint, &io).unwrap();
        let sub_b = SubChannel::connect(&endpoint, &io).unwrap();

        // Wait for both connections to land before publishing
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while publisher.subscriber_count() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(publisher.subscriber_count(), 2);

        let notify = IpcMessage::new(MsgType::Notify, MsgVal::FrameReady);
        publisher.publish(&notify);

        for sub in [&sub_a, &sub_b] {
            let msg = loop {
                match sub.events().recv_timeout(Duration::from_secs(5)).unwrap() {
                    HubEvent::Message(_, parts) => break IpcMessage::decode(&parts[0]).unwrap(),
                    _ => continue,
                }
            };
            assert_eq!(msg.msg_val, MsgVal::FrameReady);
        }
    }

    #[test]
    fn ipc_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Ipc(dir.path().join("ctrl.sock"));
        let io = IoContext::new(1);
        let router = RouterChannel::bind(&endpoint, &io).unwrap();
        let dealer = DealerChannel::connect(&endpoint, &io).unwrap();

        dealer.send(&IpcMessage::new(MsgType::Cmd, MsgVal::RequestVersion));
        let got = loop {
            match router.events().recv_timeout(Duration::from_secs(5)).unwrap() {
                HubEvent::Message(_, parts) => break IpcMessage::decode(&parts[0]).unwrap(),
                _ => continue,
            }
        };
        assert_eq!(got.msg_val, MsgVal::RequestVersion);
    }
}
