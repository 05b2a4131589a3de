//! The reactor thread and the public [`Engine`] handle producers call into.

use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};

use mio::{Events, Interest, Poll, Token, Waker, net::TcpListener};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::{
    client::{ClientConn, ReadByteOutcome, WriteOutcome},
    error::StartupError,
    options::EngineOptions,
    protocol::{ClientFrame, DatasetId, HostFrame},
    registry::Registry,
};

const CANCEL_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;

/// Monotonic millisecond clock, epoched on the first observed sample rather
/// than on construction, so clients see `x = 0` at the first point they
/// actually receive.
struct Clock {
    epoch: OnceLock<Instant>,
    last_ms: AtomicU64,
}

impl Clock {
    fn new() -> Self {
        Self { epoch: OnceLock::new(), last_ms: AtomicU64::new(0) }
    }

    /// Stamps "now" relative to the epoch, clamped to be non-decreasing.
    ///
    /// `Instant` is documented as monotonic on every target this crate
    /// supports, but the standard library only promises "best effort" on a
    /// handful of old kernels, so the clamp is kept as a cheap belt-and-braces
    /// measure rather than relied upon.
    fn stamp(&self) -> u64 {
        let epoch = *self.epoch.get_or_init(Instant::now);
        let elapsed = Instant::now().saturating_duration_since(epoch).as_millis() as u64;
        self.clamp(elapsed)
    }

    /// Folds a timestamp through the monotonicity clamp without touching the
    /// epoch; used by `add_data_at` for caller-supplied times.
    fn clamp(&self, candidate: u64) -> u64 {
        let mut prev = self.last_ms.load(Ordering::Relaxed);
        loop {
            if candidate <= prev {
                return prev;
            }
            match self.last_ms.compare_exchange_weak(
                prev,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

struct EngineState {
    registry: Registry,
    clients: HashMap<Token, ClientConn>,
}

struct Shared {
    state: Mutex<EngineState>,
    clock: Clock,
    options: EngineOptions,
    stop: AtomicBool,
    waker: Waker,
    registry_full_warned: AtomicBool,
}

/// A running LiveGrapher host. Accepts viewer connections on the configured
/// port and streams named time series to whichever clients subscribed.
///
/// Cheap to share: every public method takes `&self`. Dropping the last
/// handle stops the reactor thread and closes every socket it owns.
pub struct Engine {
    shared: Arc<Shared>,
    reactor: Option<JoinHandle<()>>,
}

impl Engine {
    /// Binds the listener and starts the reactor thread.
    ///
    /// # Errors
    /// Returns [`StartupError`] if the listener can't be bound/configured or
    /// the reactor's `Poll`/`Waker` can't be created. Nothing past this point
    /// can fail the engine as a whole; per-connection errors are handled by
    /// dropping the connection.
    pub fn new(port: u16, options: EngineOptions) -> Result<Self, StartupError> {
        let addr = SocketAddr::new(options.bind_address, port);
        let listener = bind_listener(addr, options.listen_backlog)?;

        suppress_sigpipe();

        let poll = Poll::new().map_err(StartupError::Reactor)?;
        let waker =
            Waker::new(poll.registry(), CANCEL_TOKEN).map_err(StartupError::Waker)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState { registry: Registry::new(), clients: HashMap::new() }),
            clock: Clock::new(),
            options,
            stop: AtomicBool::new(false),
            waker,
            registry_full_warned: AtomicBool::new(false),
        });

        let reactor_shared = Arc::clone(&shared);
        let reactor = std::thread::Builder::new()
            .name("livegrapher-reactor".into())
            .spawn(move || run_reactor(reactor_shared, poll, listener))
            .map_err(StartupError::Reactor)?;

        info!(%addr, "livegrapher engine started");
        Ok(Self { shared, reactor: Some(reactor) })
    }

    /// Records a sample timestamped at `monotonic_ms_since_epoch()`, fans it
    /// out to every client currently subscribed to `name`, and wakes the
    /// reactor if any of them had an empty write queue beforehand.
    pub fn add_data(&self, name: &str, value: f32) {
        let time_ms = self.shared.clock.stamp();
        self.publish(name, time_ms, value);
    }

    /// Records a sample at a caller-supplied timestamp. `time_ms` still
    /// passes through the monotonicity clamp shared with `add_data`, so
    /// mixing both calls on one engine can never regress what's on the wire.
    pub fn add_data_at(&self, name: &str, time_ms: u64, value: f32) {
        let time_ms = self.shared.clock.clamp(time_ms);
        self.publish(name, time_ms, value);
    }

    fn publish(&self, name: &str, time_ms: u64, value: f32) {
        let mut state = self.shared.state.lock().unwrap();
        let id = match state.registry.lookup_or_assign(name) {
            Ok(id) => id,
            Err(_full) => {
                if !self.shared.registry_full_warned.swap(true, Ordering::Relaxed) {
                    warn!(%name, "dataset registry full, dropping sample");
                }
                return;
            }
        };

        let mut frame = Vec::with_capacity(crate::protocol::DATA_POINT_FRAME_LEN);
        HostFrame::DataPoint { id, time_ms, value }
            .encode_into(&mut frame, self.shared.options.id_mask())
            .expect("DataPoint encoding is infallible");

        let mut woke_anyone = false;
        for client in state.clients.values_mut() {
            if client.is_subscribed(id) {
                let was_empty = !client.has_pending_write();
                client.push_outbound(&frame);
                if was_empty && client.has_pending_write() {
                    woke_anyone = true;
                }
            }
        }
        drop(state);

        if woke_anyone {
            let _ = self.shared.waker.wake();
        }
    }

    /// Stops the reactor thread and closes every socket. Equivalent to
    /// dropping the engine; exposed explicitly so callers can observe the
    /// join rather than relying on `Drop` timing.
    pub fn shutdown(self) {
        // The Drop impl does the actual work; this just gives shutdown an
        // explicit, self-documenting name at call sites.
        drop(self);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.reactor.take() {
            let _ = handle.join();
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, StartupError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(StartupError::Configure)?;
    socket.set_reuse_address(true).map_err(StartupError::Configure)?;
    socket.set_nonblocking(true).map_err(StartupError::Configure)?;
    socket.bind(&addr.into()).map_err(|source| StartupError::Bind { addr, source })?;
    socket.listen(backlog as i32).map_err(|source| StartupError::Bind { addr, source })?;
    let std_listener: StdTcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|source| StartupError::Bind { addr, source })
}

#[cfg(unix)]
fn suppress_sigpipe() {
    // SAFETY: installing SIG_IGN for SIGPIPE is a process-wide, one-shot
    // configuration change with no preconditions; it's the standard way
    // non-Linux-only Unix code avoids dying on a write to a closed socket.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn suppress_sigpipe() {}

fn run_reactor(shared: Arc<Shared>, mut poll: Poll, mut listener: TcpListener) {
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
        .expect("registering the listener cannot fail right after Poll::new");

    let mut events = Events::with_capacity(128);
    let mut next_token = FIRST_CLIENT_TOKEN;

    loop {
        {
            let mut state = shared.state.lock().unwrap();
            sync_write_interest(&mut state, &poll);
        }

        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %e, "reactor poll failed");
            continue;
        }

        for event in events.iter() {
            match event.token() {
                CANCEL_TOKEN => {
                    // No payload to drain: the waker just coalesces wakeups.
                    // Falling through re-checks the stop flag below and lets
                    // the next iteration re-sync write interest either way.
                }
                LISTENER_TOKEN => {
                    accept_connections(&shared, &mut poll, &mut listener, &mut next_token);
                }
                token => {
                    let mut state = shared.state.lock().unwrap();
                    let mut drop_client = false;

                    if event.is_readable() {
                        drop_client |= handle_readable(&mut state, &shared, token);
                    }
                    if !drop_client && event.is_writable() {
                        drop_client |= handle_writable(&mut state, token);
                    }

                    if drop_client {
                        if let Some(mut client) = state.clients.remove(&token) {
                            let _ = poll.registry().deregister(client.stream());
                            debug!(peer = %client.peer_addr(), "client disconnected");
                        }
                    }
                }
            }
        }

        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
    }

    let mut state = shared.state.lock().unwrap();
    for (_, mut client) in state.clients.drain() {
        let _ = poll.registry().deregister(client.stream());
    }
    let _ = poll.registry().deregister(&mut listener);
    info!("livegrapher engine stopped");
}

fn accept_connections(
    shared: &Arc<Shared>,
    poll: &mut Poll,
    listener: &mut TcpListener,
    next_token: &mut usize,
) {
    loop {
        let (mut stream, peer_addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };

        if shared.options.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
            }
        }

        let token = Token(*next_token);
        *next_token += 1;

        if let Err(e) = poll.registry().register(&mut stream, token, Interest::READABLE) {
            warn!(%peer_addr, error = %e, "failed to register accepted client");
            continue;
        }

        debug!(%peer_addr, "client connected");
        let mut state = shared.state.lock().unwrap();
        let max_queue_bytes = shared.options.max_queue_bytes_per_client;
        state.clients.insert(token, ClientConn::new(stream, peer_addr, max_queue_bytes));
    }
}

/// Reads and dispatches exactly one client-to-host frame, if one is already
/// available. Returns `true` if the client should be dropped.
///
/// Deliberately doesn't drain everything the socket has buffered: the
/// reactor holds `state`'s lock for the duration of this call, and a client
/// that keeps control bytes coming (even benignly) must not be able to starve
/// every other client's events in this batch, or a producer thread blocked on
/// the same lock in `Engine::publish`. Read readiness is level-triggered, so
/// any bytes left unread keep the socket marked readable and it's serviced
/// again on the next `poll`, interleaved with everything else.
fn handle_readable(state: &mut EngineState, shared: &Arc<Shared>, token: Token) -> bool {
    let Some(client) = state.clients.get_mut(&token) else { return false };
    let header = match client.try_read_header_byte() {
        ReadByteOutcome::Got(byte) => byte,
        ReadByteOutcome::WouldBlock => return false,
        ReadByteOutcome::Closed | ReadByteOutcome::Failed => return true,
    };

    let frame = match ClientFrame::decode(header) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(peer = %client.peer_addr(), error = %e, "protocol violation, dropping client");
            return true;
        }
    };

    match frame {
        ClientFrame::Subscribe(id) => client.set_subscribed(id, true),
        ClientFrame::Unsubscribe(id) => client.set_subscribed(id, false),
        // `client`'s borrow of `state.clients` must end before we can take
        // the registry snapshot and look the client back up.
        ClientFrame::ListRequest => emit_catalog(state, shared, token),
    }
    false
}

fn emit_catalog(state: &mut EngineState, shared: &Arc<Shared>, token: Token) {
    let id_mask = shared.options.id_mask();
    let snapshot: Vec<(DatasetId, String)> =
        state.registry.snapshot().map(|(id, name)| (id, name.to_owned())).collect();

    let Some(client) = state.clients.get_mut(&token) else { return };
    let mut burst = Vec::new();
    let last = snapshot.len().saturating_sub(1);
    for (i, (id, name)) in snapshot.iter().enumerate() {
        let entry = HostFrame::CatalogEntry { id: *id, name, is_last: i == last };
        if entry.encode_into(&mut burst, id_mask).is_err() {
            // Names are only ever accepted into the registry as valid,
            // non-empty, <=255-byte strings, so this path is unreachable.
            debug_assert!(false, "registry produced an unencodable name");
            return;
        }
    }
    if !burst.is_empty() {
        client.push_outbound(&burst);
    }
}

/// Flushes one best-effort write. Returns `true` if the client should be
/// dropped.
fn handle_writable(state: &mut EngineState, token: Token) -> bool {
    let Some(client) = state.clients.get_mut(&token) else { return false };
    matches!(client.try_write(), WriteOutcome::Failed)
}

/// Re-registers each client's interest set so it includes WRITABLE exactly
/// when it has queued bytes, toggling only on transitions to avoid redundant
/// `reregister` syscalls every iteration.
fn sync_write_interest(state: &mut EngineState, poll: &Poll) {
    for (&token, client) in &mut state.clients {
        let want_writable = client.has_pending_write();
        if want_writable == client.write_armed() {
            continue;
        }
        let interest =
            if want_writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        if poll.registry().reregister(client.stream(), token, interest).is_ok() {
            client.set_write_armed(want_writable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotone_under_out_of_order_clamp() {
        let clock = Clock::new();
        assert_eq!(clock.clamp(100), 100);
        // A smaller candidate must not move the clock backwards.
        assert_eq!(clock.clamp(50), 100);
        assert_eq!(clock.clamp(150), 150);
    }

    #[test]
    fn stamp_starts_near_zero_on_first_call() {
        let clock = Clock::new();
        let first = clock.stamp();
        assert!(first < 50, "first stamp should be close to the first-sample epoch, got {first}");
    }
}
