use log::{info, warn};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::error::GpioError;
use crate::gpio::{EventHandler, GpioBackend, PinSettings};
use crate::interrupt::InterruptService;
use crate::pin::Pin;
use crate::sysfs::{Edge, Mode, SysfsGateway};

pub struct SysfsBackend {
    gateway: SysfsGateway,
    service: Arc<InterruptService>,
    pins: RwLock<FxHashMap<u32, Mutex<PinHandle>>>, // keyed by pin id
}

struct PinHandle {
    pin: Pin,
    settings: PinSettings,
}

impl SysfsBackend {
    pub fn new(gateway: SysfsGateway, service: Arc<InterruptService>) -> Self {
        Self {
            gateway,
            service,
            pins: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn interrupt_service(&self) -> &Arc<InterruptService> {
        &self.service
    }

    /// Closes every open pin, releasing their exports. Pins that fail to close are
    /// kept and reported in the returned error.
    pub fn close_all(&self) -> Result<(), GpioError> {
        let mut pins = self.pins.write();
        let mut failed = Vec::new();
        for (pin_id, handle) in pins.drain() {
            let PinHandle { pin, settings } = handle.into_inner();
            if let Err((pin, e)) = pin.close() {
                warn!("failed to close pin {pin_id}: {e}");
                failed.push((pin_id, PinHandle { pin, settings }));
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = failed.iter().map(|(id, _)| id.to_string()).collect();
        for (pin_id, handle) in failed {
            pins.insert(pin_id, Mutex::new(handle));
        }
        Err(GpioError::InvalidState(format!(
            "pins still exported: {}",
            ids.join(", ")
        )))
    }

    fn apply_edge(
        &self,
        pin_id: u32,
        pin: &mut Pin,
        edge: Edge,
        handler: Option<EventHandler>,
    ) -> Result<(), GpioError> {
        match (edge, handler) {
            (Edge::None, _) | (_, None) => {
                if pin.is_watching() {
                    pin.end_watch()?;
                    self.gateway.write_edge(pin.line(), Edge::None)?;
                }
                Ok(())
            }
            (edge, Some(handler)) => {
                pin.begin_watch(edge, move |event| handler.dispatch(pin_id, event))
            }
        }
    }
}

impl GpioBackend for SysfsBackend {
    fn get_settings(&self, pin_id: u32) -> Result<PinSettings, GpioError> {
        let pins = self.pins.read();

        Ok(pins
            .get(&pin_id)
            .map(|handle| handle.lock().settings)
            .unwrap_or_default())
    }

    fn set_settings(
        &self,
        pin_id: u32,
        line: u32,
        settings: &PinSettings,
        event_handler: Option<EventHandler>,
    ) -> Result<(), GpioError> {
        let pins = self.pins.upgradable_read();

        let Some(mode) = settings.state.mode() else {
            if !pins.contains_key(&pin_id) {
                return Ok(());
            }
            let mut pins = RwLockUpgradableReadGuard::upgrade(pins);
            if let Some(handle) = pins.remove(&pin_id) {
                let PinHandle { pin, settings } = handle.into_inner();
                if let Err((pin, e)) = pin.close() {
                    pins.insert(pin_id, Mutex::new(PinHandle { pin, settings }));
                    return Err(e);
                }
                info!("pin {pin_id} closed");
            }
            return Ok(());
        };

        match pins.get(&pin_id) {
            Some(handle) => {
                let mut handle = handle.lock();

                if handle.settings.state != settings.state {
                    // watches only make sense on inputs
                    if mode != Mode::Input {
                        self.apply_edge(pin_id, &mut handle.pin, Edge::None, None)?;
                    }
                    handle.pin.set_mode(mode)?;
                    handle.settings.state = settings.state;
                }

                self.apply_edge(pin_id, &mut handle.pin, settings.edge, event_handler)?;
                handle.settings.edge = settings.edge;
            }
            None => {
                // the upgradable guard keeps other writers out while the line is opened
                let mut pin = Pin::open(&self.gateway, &self.service, line, mode)?;
                if let Err(e) = self.apply_edge(pin_id, &mut pin, settings.edge, event_handler) {
                    if let Err((_, close_err)) = pin.close() {
                        warn!("failed to release gpio{line} after edge error: {close_err}");
                    }
                    return Err(e);
                }
                info!("pin {pin_id} opened on gpio{line} as {}", mode.as_sysfs());

                let mut pins = RwLockUpgradableReadGuard::upgrade(pins);
                pins.insert(
                    pin_id,
                    Mutex::new(PinHandle {
                        pin,
                        settings: *settings,
                    }),
                );
            }
        }

        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<bool, GpioError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| GpioError::InvalidState("pin not configured, set state first".into()))?
            .lock();

        handle.pin.get()
    }

    fn write_value(&self, pin_id: u32, value: bool) -> Result<(), GpioError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| GpioError::InvalidState("pin not configured, set state first".into()))?
            .lock();

        if !handle.settings.state.is_writable() {
            return Err(GpioError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }

        handle.pin.write(value)
    }
}
