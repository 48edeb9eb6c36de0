use crate::cluster::{self, Command, Connection, Node, Options, Peer, PeerConfig, PeerId};
use crate::db::Database;
use crate::error::Result;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::io::{Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The update-loop tick interval: the longest the node waits before checking
/// its timers when no peer traffic arrives.
const TICK: Duration = Duration::from_millis(100);

/// Delay between reconnection attempts to a peer.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A transport event delivered to the sync thread.
enum Event {
    /// The outbound link to a peer came up.
    Connected(PeerId),
    /// The outbound link to a peer went down.
    Disconnected(PeerId),
    /// A frame arrived from a peer.
    Frame(PeerId, Vec<u8>),
}

/// A basalt cluster server: wires a [`Node`] to TCP peer links and runs the
/// sync thread. Each peer link is maintained by a writer thread that
/// reconnects forever; inbound frames arrive on a listener and are handed to
/// the node in arrival order.
///
/// Frames are length-prefixed (u32 BE). The first frame on every outbound
/// connection is a preamble carrying the sender's node name, so the receiver
/// can attribute inbound frames to a configured peer.
pub struct Server {
    node: Node,
    commands: CommandQueue,
    event_tx: Sender<Event>,
    event_rx: Receiver<Event>,
    conns: Vec<Arc<TcpConnection>>,
}

impl Server {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        priority: i64,
        peers: Vec<PeerConfig>,
        db: Box<dyn Database>,
        opts: Options,
    ) -> Self {
        let name = name.into();
        let commands = CommandQueue::new(name.clone());
        let mut node =
            Node::new(name, version, priority, db, Box::new(commands.handle()), opts);
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        let mut conns = Vec::new();
        for config in peers {
            let (out_tx, out_rx) = crossbeam::channel::unbounded();
            let conn = Arc::new(TcpConnection {
                peer: conns.len(),
                addr: config.host.clone(),
                out_tx,
                out_rx: Mutex::new(Some(out_rx)),
                connected: AtomicBool::new(false),
                drop_requested: AtomicBool::new(false),
                sent_bytes: AtomicU64::new(0),
                received_bytes: AtomicU64::new(0),
            });
            node.add_peer(config, conn.clone());
            conns.push(conn);
        }
        Server { node, commands, event_tx, event_rx, conns }
    }

    /// Starts a graceful shutdown; serve() returns once it completes.
    pub fn begin_shutdown(&mut self, wait: Duration) {
        self.node.begin_shutdown(wait);
    }

    /// Connects to peers, accepts inbound connections, and runs the update
    /// loop until a graceful shutdown completes.
    pub fn serve(mut self, listen_addr: &str) -> Result<()> {
        info!("Listening for peers on {listen_addr}");
        let listener = TcpListener::bind(listen_addr)?;

        // Inbound frames are attributed by the preamble's node name.
        let by_name: HashMap<String, Arc<TcpConnection>> = self
            .conns
            .iter()
            .map(|conn| (self.node.peer(conn.peer).name.clone(), conn.clone()))
            .collect();
        let event_tx = self.event_tx.clone();
        std::thread::spawn(move || listen(listener, by_name, event_tx));

        // One writer thread per peer, reconnecting forever.
        let node_name = self.node.name().to_string();
        for conn in &self.conns {
            let conn = conn.clone();
            let event_tx = self.event_tx.clone();
            let preamble = node_name.clone();
            std::thread::spawn(move || write_peer(conn, preamble, event_tx));
        }

        // The sync thread: tick, ingest transport events, and update.
        let ticker = crossbeam::channel::tick(TICK);
        let mut worker_db = self.node.db().fork();
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => {},
                recv(self.event_rx) -> event => match event? {
                    Event::Connected(peer) => self.node.on_connect(peer),
                    Event::Disconnected(peer) => self.node.on_disconnect(peer),
                    Event::Frame(peer, frame) => self.node.receive_frame(peer, &frame),
                },
            }
            while self.node.update() {}
            self.serve_commands(worker_db.as_mut());
            if self.node.graceful_shutdown() && self.node.shutdown_complete() {
                info!("Shutdown complete");
                return Ok(());
            }
        }
    }

    /// Services commands the node queued for us. This stands in for the full
    /// command server: it answers peer synchronization requests and returns
    /// anything else.
    fn serve_commands(&mut self, db: &mut dyn Database) {
        for command in self.commands.take() {
            if self.node.peek_peer_command(db, &command) {
                continue;
            }
            if command.complete {
                debug!("Command {} complete", command.id);
                continue;
            }
            warn!("No command handler for {} ({}), dropping", command.id, command.request.method);
        }
    }
}

/// The minimal command server behind the standalone binary: queues commands
/// from the node so that the serve loop can answer peer synchronization
/// requests asynchronously. A full deployment embeds [`Node`] under its own
/// command server instead.
struct CommandQueue {
    name: String,
    queue: Arc<Mutex<VecDeque<Command>>>,
}

impl CommandQueue {
    fn new(name: String) -> Self {
        CommandQueue { name, queue: Arc::new(Mutex::new(VecDeque::new())) }
    }

    fn handle(&self) -> Self {
        CommandQueue { name: self.name.clone(), queue: self.queue.clone() }
    }

    fn take(&self) -> Vec<Command> {
        self.queue.lock().expect("command queue poisoned").drain(..).collect()
    }
}

impl cluster::Server for CommandQueue {
    fn accept_command(&mut self, command: Command, _is_new: bool) {
        self.queue.lock().expect("command queue poisoned").push_back(command);
    }

    fn cancel_command(&mut self, id: &str) {
        self.queue.lock().expect("command queue poisoned").retain(|c| c.id != id);
    }

    fn on_node_login(&mut self, peer: &Peer) {
        info!("{}: peer {} logged in", self.name, peer.name);
    }

    fn can_stand_down(&mut self) -> bool {
        self.queue.lock().expect("command queue poisoned").is_empty()
    }
}

/// The outbound half of a peer link. send() enqueues frames for the writer
/// thread, which owns the socket and reconnects forever.
struct TcpConnection {
    peer: PeerId,
    addr: String,
    out_tx: Sender<Vec<u8>>,
    /// Taken once by the writer thread.
    out_rx: Mutex<Option<Receiver<Vec<u8>>>>,
    connected: AtomicBool,
    drop_requested: AtomicBool,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
}

impl Connection for TcpConnection {
    fn send(&self, frame: &[u8]) -> Result<()> {
        self.sent_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(self.out_tx.send(frame.to_vec())?)
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reconnect(&self) {
        self.drop_requested.store(true, Ordering::SeqCst);
    }

    fn send_buffer_empty(&self) -> bool {
        self.out_tx.is_empty()
    }

    fn take_transfer_stats(&self) -> (u64, u64) {
        (self.sent_bytes.swap(0, Ordering::Relaxed), self.received_bytes.swap(0, Ordering::Relaxed))
    }
}

/// Writes a length-prefixed frame.
fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
    stream.write_all(&(frame.len() as u32).to_be_bytes())?;
    stream.write_all(frame)?;
    Ok(())
}

/// The largest frame we'll accept, as a sanity bound on the length prefix.
const MAX_FRAME_LEN: u32 = 64 << 20;

/// Reads a length-prefixed frame, or None at EOF.
fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_LEN {
        return crate::errproto!("frame of {len} bytes exceeds maximum");
    }
    let mut frame = vec![0u8; len as usize];
    stream.read_exact(&mut frame)?;
    Ok(Some(frame))
}

/// Maintains the outbound link to one peer: connect, send the name preamble,
/// then pump queued frames until the link drops or a reconnect is requested.
fn write_peer(conn: Arc<TcpConnection>, preamble: String, events: Sender<Event>) {
    let out_rx = conn.out_rx.lock().expect("writer lock poisoned").take().expect("writer started twice");
    loop {
        match TcpStream::connect(&conn.addr) {
            Ok(mut stream) => {
                if write_frame(&mut stream, preamble.as_bytes()).is_ok() {
                    debug!("Connected to peer {}", conn.addr);
                    conn.connected.store(true, Ordering::SeqCst);
                    if events.send(Event::Connected(conn.peer)).is_err() {
                        return;
                    }
                    let reason = pump_frames(&conn, &mut stream, &out_rx);
                    conn.connected.store(false, Ordering::SeqCst);
                    debug!("Disconnected from peer {}: {reason}", conn.addr);
                    if events.send(Event::Disconnected(conn.peer)).is_err() {
                        return;
                    }
                }
            }
            Err(error) => debug!("Failed connecting to peer {}: {error}", conn.addr),
        }
        std::thread::sleep(RECONNECT_DELAY);
    }
}

/// Pumps queued frames onto an established connection. Returns why it
/// stopped.
fn pump_frames(
    conn: &TcpConnection,
    stream: &mut TcpStream,
    out_rx: &Receiver<Vec<u8>>,
) -> &'static str {
    loop {
        if conn.drop_requested.swap(false, Ordering::SeqCst) {
            return "reconnect requested";
        }
        match out_rx.recv_timeout(TICK) {
            Ok(frame) => {
                if write_frame(stream, &frame).is_err() {
                    return "write failed";
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return "sender closed",
        }
    }
}

/// Accepts inbound peer connections and spawns a reader for each.
fn listen(
    listener: TcpListener,
    by_name: HashMap<String, Arc<TcpConnection>>,
    events: Sender<Event>,
) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let by_name = by_name.clone();
                let events = events.clone();
                std::thread::spawn(move || {
                    if let Err(error) = read_peer(stream, by_name, events) {
                        debug!("Peer reader failed: {error}");
                    }
                });
            }
            Err(error) => error!("Failed accepting peer connection: {error}"),
        }
    }
}

/// Reads frames from an inbound peer connection. The first frame names the
/// sender; frames from unknown senders are dropped.
fn read_peer(
    mut stream: TcpStream,
    by_name: HashMap<String, Arc<TcpConnection>>,
    events: Sender<Event>,
) -> Result<()> {
    let Some(preamble) = read_frame(&mut stream)? else {
        return Ok(());
    };
    let name = String::from_utf8(preamble)?;
    let Some(conn) = by_name.get(&name) else {
        warn!("Inbound connection from unknown peer {name}, dropping");
        return Ok(());
    };
    debug!("Peer {name} connected inbound");
    while let Some(frame) = read_frame(&mut stream)? {
        conn.received_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        if events.send(Event::Frame(conn.peer, frame)).is_err() {
            return Ok(());
        }
    }
    debug!("Peer {name} disconnected inbound");
    Ok(())
}
