//! Process-wide edge interrupt dispatch.
//!
//! One epoll set (through `mio`) holds the value handle of every watched pin. A single
//! dispatch thread blocks on it and runs the registered callbacks in the order the
//! kernel reports readiness. The callback registry and the epoll membership are only
//! changed together under one lock, so the dispatch thread never sees a handle that
//! is in one but not the other.

use log::{debug, error, info, trace, warn};
use std::fs::File;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::FileExt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::GpioError;
use crate::header::GPIO_COUNT;
use crate::sysfs::Edge;

const STOP_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = GPIO_COUNT as usize;

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub pin_id: u32,
    pub edge: Edge,
    pub timestamp_ms: u64,
}

pub type Callback = Arc<dyn Fn(EdgeEvent) + Send + Sync>;

pub(crate) struct WatchEntry {
    pub(crate) pin_id: u32,
    pub(crate) edge: Edge,
    pub(crate) value: Arc<File>,
    pub(crate) first_event: Arc<AtomicBool>,
    pub(crate) callback: Callback,
}

struct Shared {
    watches: Mutex<FxHashMap<RawFd, WatchEntry>>,
}

pub struct InterruptService {
    registry: Registry,
    waker: Waker,
    shared: Arc<Shared>,
    stopped: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl InterruptService {
    /// Creates the epoll set and spawns the dispatch thread.
    pub fn start() -> Result<Arc<Self>, GpioError> {
        let poll = Poll::new().map_err(|e| GpioError::io("create epoll", e))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| GpioError::io("clone epoll registry", e))?;
        let waker = Waker::new(poll.registry(), STOP_TOKEN)
            .map_err(|e| GpioError::io("create epoll waker", e))?;
        let shared = Arc::new(Shared {
            watches: Mutex::new(FxHashMap::default()),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("gpio-interrupts".into())
            .spawn(move || dispatch_loop(poll, thread_shared))
            .map_err(|e| GpioError::io("spawn interrupt thread", e))?;

        info!("interrupt service started");

        Ok(Arc::new(Self {
            registry,
            waker,
            shared,
            stopped: AtomicBool::new(false),
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// Signals the dispatch thread to exit and waits for it. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake interrupt thread: {e}");
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            // a callback stopping the service cannot join its own thread
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("interrupt thread panicked");
            }
        }
        info!("interrupt service stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    pub fn watched_count(&self) -> usize {
        self.shared.watches.lock().len()
    }

    pub fn is_watched(&self, fd: RawFd) -> bool {
        self.shared.watches.lock().contains_key(&fd)
    }

    /// Adds `fd` to the epoll set and the registry in one step.
    pub(crate) fn watch(&self, fd: RawFd, entry: WatchEntry) -> Result<(), GpioError> {
        if !self.is_running() {
            return Err(GpioError::InvalidState(
                "interrupt service is stopped".into(),
            ));
        }

        let mut watches = self.shared.watches.lock();
        if watches.contains_key(&fd) {
            return Err(GpioError::InvalidState(format!(
                "handle {fd} is already watched"
            )));
        }

        self.registry
            .register(
                &mut SourceFd(&fd),
                Token(fd as usize),
                Interest::READABLE | Interest::PRIORITY,
            )
            .map_err(|e| GpioError::io(format!("epoll add gpio{}", entry.pin_id), e))?;

        debug!("watching gpio{} on handle {fd}", entry.pin_id);
        watches.insert(fd, entry);
        Ok(())
    }

    /// Removes `fd` from the epoll set and the registry. Returns `false` if it was
    /// not watched.
    pub(crate) fn unwatch(&self, fd: RawFd) -> Result<bool, GpioError> {
        let mut watches = self.shared.watches.lock();
        let Some(pin_id) = watches.get(&fd).map(|entry| entry.pin_id) else {
            return Ok(false);
        };

        // the entry outlives a failed deregister so both sides still agree
        self.registry
            .deregister(&mut SourceFd(&fd))
            .map_err(|e| GpioError::io(format!("epoll del gpio{pin_id}"), e))?;
        watches.remove(&fd);
        debug!("unwatching gpio{pin_id} on handle {fd}");
        Ok(true)
    }
}

impl Drop for InterruptService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(mut poll: Poll, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(EVENT_CAPACITY);

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // the readiness set can no longer be trusted
            error!("interrupt wait failed: {e}");
            std::process::abort();
        }

        for event in events.iter() {
            if event.token() == STOP_TOKEN {
                debug!("interrupt thread exiting");
                return;
            }

            let fd = event.token().0 as RawFd;
            let ready = {
                let watches = shared.watches.lock();
                match watches.get(&fd) {
                    None => {
                        trace!("readiness on unwatched handle {fd}");
                        None
                    }
                    Some(entry) if entry.first_event.swap(false, Ordering::AcqRel) => {
                        debug!("suppressed initial event on gpio{}", entry.pin_id);
                        None
                    }
                    Some(entry) => Some((
                        entry.pin_id,
                        entry.edge,
                        entry.value.clone(),
                        entry.callback.clone(),
                    )),
                }
            };

            if let Some((pin_id, edge, value, callback)) = ready {
                let event = EdgeEvent {
                    pin_id,
                    edge: resolve_edge(pin_id, edge, &value),
                    timestamp_ms: epoch_millis(),
                };
                if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                    error!("callback for gpio{pin_id} panicked");
                }
            }
        }
    }
}

/// A `Both` watch does not say which way the line moved, so read the level.
fn resolve_edge(pin_id: u32, edge: Edge, value: &File) -> Edge {
    if edge != Edge::Both {
        return edge;
    }
    let mut buf = [0u8; 1];
    match value.read_at(&mut buf, 0) {
        Ok(1) if buf[0] == b'1' => Edge::Rising,
        Ok(1) => Edge::Falling,
        Ok(_) => Edge::Both,
        Err(e) => {
            warn!("read value of gpio{pin_id}: {e}");
            Edge::Both
        }
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::testutil::FakeSysfs;

    fn open_rw(path: &std::path::Path) -> File {
        OpenOptions::new().read(true).write(true).open(path).unwrap()
    }

    fn entry(pin_id: u32, value: Arc<File>, callback: Callback) -> WatchEntry {
        WatchEntry {
            pin_id,
            edge: Edge::Rising,
            value,
            first_event: Arc::new(AtomicBool::new(false)),
            callback,
        }
    }

    #[test]
    fn stop_is_idempotent() {
        let service = InterruptService::start().unwrap();
        assert!(service.is_running());
        service.stop();
        service.stop();
        assert!(!service.is_running());
    }

    #[test]
    fn watch_after_stop_is_rejected() {
        let fake = FakeSysfs::new("irq-stopped");
        fake.add_fifo_line(6);
        let value = Arc::new(open_rw(&fake.root().join("gpio6/value")));

        let service = InterruptService::start().unwrap();
        service.stop();
        let err = service
            .watch(value.as_raw_fd(), entry(6, value.clone(), Arc::new(|_| {})))
            .unwrap_err();
        assert!(matches!(err, GpioError::InvalidState(_)));
        assert_eq!(service.watched_count(), 0);
    }

    #[test]
    fn unwatch_unknown_handle_is_a_no_op() {
        let service = InterruptService::start().unwrap();
        assert!(!service.unwatch(1234).unwrap());
    }

    #[test]
    fn registry_and_epoll_stay_in_step() {
        let fake = FakeSysfs::new("irq-membership");
        fake.add_fifo_line(5);
        let value = Arc::new(open_rw(&fake.root().join("gpio5/value")));
        let fd = value.as_raw_fd();

        let service = InterruptService::start().unwrap();
        service
            .watch(fd, entry(5, value.clone(), Arc::new(|_| {})))
            .unwrap();
        assert!(service.is_watched(fd));

        let dup = service.watch(fd, entry(5, value.clone(), Arc::new(|_| {})));
        assert!(matches!(dup, Err(GpioError::InvalidState(_))));

        assert!(service.unwatch(fd).unwrap());
        assert!(!service.is_watched(fd));
        assert_eq!(service.watched_count(), 0);
    }

    #[test]
    fn failed_deregister_keeps_entry() {
        let fake = FakeSysfs::new("irq-deregister");
        fake.add_fifo_line(12);
        let value = Arc::new(open_rw(&fake.root().join("gpio12/value")));
        let fd = value.as_raw_fd();

        let service = InterruptService::start().unwrap();
        service
            .watch(fd, entry(12, value.clone(), Arc::new(|_| {})))
            .unwrap();
        // pull the handle out of epoll behind the registry's back
        service.registry.deregister(&mut SourceFd(&fd)).unwrap();

        let err = service.unwatch(fd).unwrap_err();
        assert!(matches!(err, GpioError::Io { .. }));
        assert!(service.is_watched(fd));
    }

    #[test]
    fn both_edges_resolve_from_current_level() {
        let fake = FakeSysfs::new("irq-resolve");
        fake.add_line(3);
        let value = open_rw(&fake.root().join("gpio3/value"));

        assert_eq!(resolve_edge(3, Edge::Both, &value), Edge::Falling);
        fake.write("gpio3/value", "1\n");
        assert_eq!(resolve_edge(3, Edge::Both, &value), Edge::Rising);
        // a single-edge watch is reported as armed
        assert_eq!(resolve_edge(3, Edge::Falling, &value), Edge::Falling);
    }

    #[test]
    fn dispatches_readiness_to_callback() {
        let fake = FakeSysfs::new("irq-dispatch");
        fake.add_fifo_line(13);
        let path = fake.root().join("gpio13/value");
        let value = Arc::new(open_rw(&path));
        let mut writer = open_rw(&path);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let service = InterruptService::start().unwrap();
        service
            .watch(
                value.as_raw_fd(),
                entry(
                    13,
                    value.clone(),
                    Arc::new(move |evt| {
                        let _ = tx.lock().send(evt);
                    }),
                ),
            )
            .unwrap();

        writer.write_all(b"1").unwrap();
        let evt = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(evt.pin_id, 13);
        assert_eq!(evt.edge, Edge::Rising);
    }

    #[test]
    fn panicking_callback_does_not_kill_dispatch() {
        let fake = FakeSysfs::new("irq-panic");
        fake.add_fifo_line(20);
        fake.add_fifo_line(21);
        let bad_path = fake.root().join("gpio20/value");
        let good_path = fake.root().join("gpio21/value");
        let bad = Arc::new(open_rw(&bad_path));
        let good = Arc::new(open_rw(&good_path));
        let mut bad_writer = open_rw(&bad_path);
        let mut good_writer = open_rw(&good_path);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let service = InterruptService::start().unwrap();
        service
            .watch(
                bad.as_raw_fd(),
                entry(20, bad.clone(), Arc::new(|_| panic!("callback failure"))),
            )
            .unwrap();
        service
            .watch(
                good.as_raw_fd(),
                entry(
                    21,
                    good.clone(),
                    Arc::new(move |evt| {
                        let _ = tx.lock().send(evt.pin_id);
                    }),
                ),
            )
            .unwrap();

        bad_writer.write_all(b"1").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        good_writer.write_all(b"1").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 21);
    }
}
