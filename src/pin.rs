use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use nix::fcntl::{FcntlArg, OFlag, fcntl};

use crate::error::GpioError;
use crate::header::GPIO_COUNT;
use crate::interrupt::{Callback, EdgeEvent, InterruptService, WatchEntry};
use crate::sysfs::{self, Edge, Mode, SysfsGateway};

const LEVEL_HIGH: u8 = b'1';
const LEVEL_LOW: u8 = b'0';

/// An exported sysfs GPIO line.
///
/// The value handle stays open for the lifetime of the pin. [`Pin::close`] ends any
/// active watch and unexports the line; dropping a pin without closing it only ends
/// the watch.
pub struct Pin {
    line: u32,
    gateway: SysfsGateway,
    service: Arc<InterruptService>,
    direction_path: PathBuf,
    value: Arc<File>,
    first_event: Arc<AtomicBool>,
    watching: bool,
}

impl Pin {
    /// Exports `line` if needed, opens its value file and applies `mode`.
    pub fn open(
        gateway: &SysfsGateway,
        service: &Arc<InterruptService>,
        line: u32,
        mode: Mode,
    ) -> Result<Self, GpioError> {
        if line >= GPIO_COUNT {
            return Err(GpioError::InvalidValue(format!(
                "gpio{line} is out of range, lines are 0..{GPIO_COUNT}"
            )));
        }

        let was_exported = gateway.is_exported(line);
        let dir = gateway.export_if_needed(line)?;
        let value_path = dir.join("value");
        let value = match OpenOptions::new().read(true).write(true).open(&value_path) {
            Ok(value) => value,
            Err(e) => {
                if !was_exported && let Err(unexport_err) = gateway.unexport(line) {
                    warn!("failed to release gpio{line} after open error: {unexport_err}");
                }
                return Err(GpioError::io(format!("open {}", value_path.display()), e));
            }
        };

        let pin = Self {
            line,
            gateway: gateway.clone(),
            service: service.clone(),
            direction_path: dir.join("direction"),
            value: Arc::new(value),
            first_event: Arc::new(AtomicBool::new(true)),
            watching: false,
        };

        if let Err(e) = pin.set_mode(mode) {
            if let Err((_, close_err)) = pin.close() {
                warn!("failed to release gpio{line} after open error: {close_err}");
            }
            return Err(e);
        }

        Ok(pin)
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn mode(&self) -> Result<Mode, GpioError> {
        sysfs::read_mode_at(&self.direction_path)
    }

    /// Writes `mode` only when it differs from the current direction.
    pub fn set_mode(&self, mode: Mode) -> Result<(), GpioError> {
        if self.mode()? != mode {
            self.gateway.write_mode(self.line, mode)?;
        }
        Ok(())
    }

    pub fn set(&self) -> Result<(), GpioError> {
        self.write_level(LEVEL_HIGH)
    }

    pub fn clear(&self) -> Result<(), GpioError> {
        self.write_level(LEVEL_LOW)
    }

    pub fn write(&self, high: bool) -> Result<(), GpioError> {
        if high { self.set() } else { self.clear() }
    }

    pub fn get(&self) -> Result<bool, GpioError> {
        let mut buf = [0u8; 1];
        self.value
            .read_at(&mut buf, 0)
            .map_err(|e| GpioError::io(format!("read gpio{} value", self.line), e))?;
        Ok(buf[0] == LEVEL_HIGH)
    }

    fn write_level(&self, level: u8) -> Result<(), GpioError> {
        self.value
            .write_at(&[level], 0)
            .map_err(|e| GpioError::io(format!("write gpio{} value", self.line), e))?;
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    /// Arms edge interrupts for this pin. The first readiness report after arming
    /// reflects the current level rather than a transition and is dropped.
    ///
    /// A pin that is already watched is re-armed with the new edge and callback.
    pub fn begin_watch<F>(&mut self, edge: Edge, callback: F) -> Result<(), GpioError>
    where
        F: Fn(EdgeEvent) + Send + Sync + 'static,
    {
        self.begin_watch_with(edge, Arc::new(callback))
    }

    pub fn begin_watch_with(&mut self, edge: Edge, callback: Callback) -> Result<(), GpioError> {
        let mode = self.mode()?;
        if mode != Mode::Input {
            return Err(GpioError::PreconditionViolated(format!(
                "gpio{} must be in input mode to watch, found {}",
                self.line,
                mode.as_sysfs()
            )));
        }
        if self.watching {
            self.end_watch()?;
        }

        self.gateway.write_edge(self.line, edge)?;
        set_nonblocking(&self.value, true)?;

        // armed before registration so the dispatch thread never sees it cleared
        self.first_event.store(true, Ordering::Release);
        let entry = WatchEntry {
            pin_id: self.line,
            edge,
            value: self.value.clone(),
            first_event: self.first_event.clone(),
            callback,
        };
        if let Err(e) = self.service.watch(self.fd(), entry) {
            if let Err(restore) = set_nonblocking(&self.value, false) {
                warn!("restore blocking mode on gpio{}: {restore}", self.line);
            }
            return Err(e);
        }

        self.watching = true;
        debug!("gpio{} watching {} edges", self.line, edge.as_sysfs());
        Ok(())
    }

    /// Disarms edge interrupts. A no-op when no watch is active.
    pub fn end_watch(&mut self) -> Result<(), GpioError> {
        if !self.watching {
            return Ok(());
        }
        self.service.unwatch(self.fd())?;
        self.watching = false;
        set_nonblocking(&self.value, false)?;
        debug!("gpio{} watch ended", self.line);
        Ok(())
    }

    /// Blocks until the line reads `level`, or until `timeout` elapses.
    ///
    /// Arms a transient watch on both edges and always disarms it before returning,
    /// so the pin must be in input mode and not already watched.
    pub fn wait_for(&mut self, level: bool, timeout: Option<Duration>) -> Result<(), GpioError> {
        let line = self.line;
        self.wait_until(timeout, |pin| Ok(pin.get()? == level))
            .map_err(|e| match e {
                GpioError::Timeout(_) => GpioError::Timeout(format!(
                    "gpio{line} did not reach level {}",
                    u8::from(level)
                )),
                e => e,
            })
    }

    /// Re-evaluates `reached` before arming and after every edge event.
    fn wait_until<F>(&mut self, timeout: Option<Duration>, reached: F) -> Result<(), GpioError>
    where
        F: Fn(&Pin) -> Result<bool, GpioError>,
    {
        let mode = self.mode()?;
        if mode != Mode::Input {
            return Err(GpioError::PreconditionViolated(format!(
                "gpio{} must be in input mode to wait, found {}",
                self.line,
                mode.as_sysfs()
            )));
        }
        if self.watching {
            return Err(GpioError::PreconditionViolated(format!(
                "gpio{} is already watched",
                self.line
            )));
        }
        if reached(&*self)? {
            return Ok(());
        }

        let (tx, rx) = mpsc::sync_channel::<()>(1);
        self.begin_watch(Edge::Both, move |_| {
            let _ = tx.try_send(());
        })?;

        let outcome = self.wait_loop(timeout, &rx, &reached);
        let disarm = self.end_watch();
        outcome?;
        disarm
    }

    fn wait_loop<F>(
        &self,
        timeout: Option<Duration>,
        rx: &mpsc::Receiver<()>,
        reached: &F,
    ) -> Result<(), GpioError>
    where
        F: Fn(&Pin) -> Result<bool, GpioError>,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // the level may have changed before the watch was armed
            if reached(self)? {
                return Ok(());
            }
            let received = match deadline {
                None => rx.recv().map_err(|_| ()),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    rx.recv_timeout(remaining).map_err(|_| ())
                }
            };
            if received.is_err() {
                return Err(GpioError::Timeout(format!(
                    "gpio{} wait timed out",
                    self.line
                )));
            }
        }
    }

    /// Ends any watch and unexports the line. On failure the pin is handed back so
    /// the caller can retry.
    pub fn close(mut self) -> Result<(), (Pin, GpioError)> {
        if let Err(e) = self.end_watch() {
            return Err((self, e));
        }
        if let Err(e) = self.gateway.unexport(self.line) {
            return Err((self, e));
        }
        Ok(())
    }

    fn fd(&self) -> RawFd {
        self.value.as_raw_fd()
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        if let Err(e) = self.end_watch() {
            warn!("gpio{} watch cleanup on drop: {e}", self.line);
        }
    }
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pin")
            .field("line", &self.line)
            .field("watching", &self.watching)
            .finish()
    }
}

fn set_nonblocking(file: &File, nonblocking: bool) -> Result<(), GpioError> {
    let fd = file.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| GpioError::io("read handle flags", e.into()))?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| GpioError::io("write handle flags", e.into()))?;
    Ok(())
}
