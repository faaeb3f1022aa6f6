use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::GpioError;
use crate::gpio::{EventHandler, GpioBackend, PinSettings, PinState};
use crate::interrupt::{EdgeEvent, epoch_millis};
use crate::sysfs::Edge;

/// In-memory backend for running the API without GPIO hardware.
///
/// Edge events are synthesised from [`MockGpioBackend::inject_level`], which stands
/// in for a signal driven onto an input line from outside.
#[derive(Default)]
pub struct MockGpioBackend {
    pins: RwLock<FxHashMap<u32, Mutex<MockPinState>>>, // keyed by pin id
}

struct MockPinState {
    line: u32,
    settings: PinSettings,
    value: bool,
    handler: Option<EventHandler>,
}

impl MockGpioBackend {
    /// Drives an input pin to `level`, dispatching an event if the configured edge
    /// matches the transition.
    pub fn inject_level(&self, pin_id: u32, level: bool) -> Result<(), GpioError> {
        let pins = self.pins.read();
        let mut pin = pins
            .get(&pin_id)
            .ok_or_else(|| GpioError::InvalidState("pin not configured, set state first".into()))?
            .lock();

        if pin.settings.state != PinState::Input {
            return Err(GpioError::InvalidState(
                "only input pins can be driven externally".into(),
            ));
        }

        let old = pin.value;
        pin.value = level;

        let observed = match (old, level) {
            (false, true) => Edge::Rising,
            (true, false) => Edge::Falling,
            _ => return Ok(()),
        };
        if edge_matches(pin.settings.edge, observed)
            && let Some(handler) = &pin.handler
        {
            handler.dispatch(
                pin_id,
                EdgeEvent {
                    pin_id: pin.line,
                    edge: observed,
                    timestamp_ms: epoch_millis(),
                },
            );
        }
        Ok(())
    }
}

impl GpioBackend for MockGpioBackend {
    fn get_settings(&self, pin_id: u32) -> Result<PinSettings, GpioError> {
        let pins = self.pins.read();

        Ok(pins
            .get(&pin_id)
            .map(|pin| pin.lock().settings)
            .unwrap_or_default())
    }

    fn set_settings(
        &self,
        pin_id: u32,
        line: u32,
        settings: &PinSettings,
        event_handler: Option<EventHandler>,
    ) -> Result<(), GpioError> {
        let mut pins = self.pins.write();

        if settings.state == PinState::Closed {
            pins.remove(&pin_id);
            return Ok(());
        }

        let entry = pins.entry(pin_id).or_insert_with(|| {
            Mutex::new(MockPinState {
                line,
                settings: PinSettings::default(),
                value: false,
                handler: None,
            })
        });

        let pin = entry.get_mut();
        pin.settings = *settings;
        pin.handler = if settings.edge != Edge::None {
            event_handler
        } else {
            None
        };

        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<bool, GpioError> {
        let pins = self.pins.read();
        let pin = pins
            .get(&pin_id)
            .ok_or_else(|| GpioError::InvalidState("pin not configured, set state first".into()))?
            .lock();

        Ok(pin.value)
    }

    fn write_value(&self, pin_id: u32, value: bool) -> Result<(), GpioError> {
        let pins = self.pins.read();
        let mut pin = pins
            .get(&pin_id)
            .ok_or_else(|| GpioError::InvalidState("pin not configured, set state first".into()))?
            .lock();

        if !pin.settings.state.is_writable() {
            return Err(GpioError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }

        pin.value = value;
        Ok(())
    }
}

fn edge_matches(configured: Edge, observed: Edge) -> bool {
    match configured {
        Edge::None => false,
        Edge::Rising => observed == Edge::Rising,
        Edge::Falling => observed == Edge::Falling,
        Edge::Both => matches!(observed, Edge::Rising | Edge::Falling),
    }
}
