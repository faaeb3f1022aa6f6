use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{AppConfig, PinConfig};
use crate::error::GpioError;
use crate::interrupt::EdgeEvent;
use crate::sysfs::{Edge, Mode};

pub type GpioManager<B> = GenericGpioManager<B>;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PinState {
    #[default]
    Closed,
    Input,
    Output,
}

impl PinState {
    pub fn mode(&self) -> Option<Mode> {
        match self {
            PinState::Closed => None,
            PinState::Input => Some(Mode::Input),
            PinState::Output => Some(Mode::Output),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, PinState::Output)
    }

    pub fn is_edge_detectable(&self) -> bool {
        matches!(self, PinState::Input)
    }
}

impl From<Mode> for PinState {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Input => PinState::Input,
            Mode::Output => PinState::Output,
        }
    }
}

pub struct EventCallbackHandler {
    event_tx: broadcast::Sender<EdgeEvent>,
    event_history: FxHashMap<u32, RwLock<VecDeque<EdgeEvent>>>,
    event_history_capacity: usize,
}

impl EventCallbackHandler {
    pub fn new(
        event_tx: broadcast::Sender<EdgeEvent>,
        event_history: FxHashMap<u32, RwLock<VecDeque<EdgeEvent>>>,
        event_history_capacity: usize,
    ) -> Self {
        Self {
            event_tx,
            event_history,
            event_history_capacity,
        }
    }

    /// Records `event` under the declared pin id and broadcasts it. Runs on the
    /// interrupt thread, so it must not block.
    pub fn dispatch(&self, pin_id: u32, mut event: EdgeEvent) {
        event.pin_id = pin_id;
        if let Some(history_lock) = self.event_history.get(&pin_id) {
            let mut history = history_lock.write();
            while history.len() >= self.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.event_tx.send(event);
    }
}

pub type EventHandler = Arc<EventCallbackHandler>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PinSettings {
    pub state: PinState,
    pub edge: Edge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinDescriptor {
    pub info: PinConfig,
    pub line: u32,
    pub settings: PinSettings,
}

/// Storage for the live state of declared pins. `pin_id` is the configured id,
/// `line` the kernel GPIO line it resolves to.
pub trait GpioBackend: Send + Sync {
    fn get_settings(&self, pin_id: u32) -> Result<PinSettings, GpioError>;
    fn set_settings(
        &self,
        pin_id: u32,
        line: u32,
        settings: &PinSettings,
        event_handler: Option<EventHandler>,
    ) -> Result<(), GpioError>;
    fn read_value(&self, pin_id: u32) -> Result<bool, GpioError>;
    fn write_value(&self, pin_id: u32, value: bool) -> Result<(), GpioError>;
}

pub struct GenericGpioManager<B: GpioBackend> {
    config: Arc<AppConfig>,
    backend: Arc<B>,
    event_handler: EventHandler,
}

impl<B: GpioBackend> GenericGpioManager<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity);

        let mut history = FxHashMap::default();
        for id in config.gpios.keys() {
            history.insert(*id, RwLock::new(VecDeque::new()));
        }

        let event_handler = Arc::new(EventCallbackHandler::new(
            event_tx,
            history,
            config.event_history_capacity,
        ));

        Self {
            config,
            backend,
            event_handler,
        }
    }

    fn pin_config(&self, pin_id: u32) -> Result<&PinConfig, GpioError> {
        self.config
            .gpios
            .get(&pin_id)
            .ok_or_else(|| GpioError::NotFoundPin(pin_id.to_string()))
    }

    fn capability_matches(state: PinState, cfg: &PinConfig) -> bool {
        match state.mode() {
            None => true,
            Some(mode) => cfg.capabilities.contains(&mode),
        }
    }

    fn describe(&self, pin_id: u32, cfg: &PinConfig) -> Result<PinDescriptor, GpioError> {
        Ok(PinDescriptor {
            info: cfg.clone(),
            line: cfg.resolve_line()?,
            settings: self.backend.get_settings(pin_id).unwrap_or_default(),
        })
    }

    pub async fn list_pins(&self) -> Result<HashMap<u32, PinDescriptor>, GpioError> {
        self.config
            .gpios
            .iter()
            .map(|(id, cfg)| self.describe(*id, cfg).map(|desc| (*id, desc)))
            .collect()
    }

    pub async fn get_pin_descriptor(&self, pin_id: u32) -> Result<PinDescriptor, GpioError> {
        let cfg = self.pin_config(pin_id)?;
        self.describe(pin_id, cfg)
    }

    pub async fn get_pin_info(&self, pin_id: u32) -> Result<PinConfig, GpioError> {
        self.pin_config(pin_id).cloned()
    }

    pub async fn get_pin_settings(&self, pin_id: u32) -> Result<PinSettings, GpioError> {
        self.pin_config(pin_id)?;
        self.backend.get_settings(pin_id)
    }

    pub async fn set_pin_settings(
        &self,
        pin_id: u32,
        settings: &PinSettings,
    ) -> Result<(), GpioError> {
        let cfg = self.pin_config(pin_id)?;

        if !Self::capability_matches(settings.state, cfg) {
            return Err(GpioError::InvalidState(format!(
                "State not supported by pin {pin_id}"
            )));
        }

        let handler = if settings.edge != Edge::None {
            if !settings.state.is_edge_detectable() {
                return Err(GpioError::PreconditionViolated(format!(
                    "Edge detection requires input state on pin {pin_id}",
                )));
            }
            Some(self.event_handler.clone())
        } else {
            None
        };

        let line = cfg.resolve_line()?;
        self.backend.set_settings(pin_id, line, settings, handler)
    }

    pub async fn read_value(&self, pin_id: u32) -> Result<bool, GpioError> {
        self.pin_config(pin_id)?;
        self.backend.read_value(pin_id)
    }

    pub async fn write_value(&self, pin_id: u32, value: u8) -> Result<(), GpioError> {
        if value > 1 {
            return Err(GpioError::InvalidValue("Value must be 0 or 1".into()));
        }

        self.pin_config(pin_id)?;
        self.backend.write_value(pin_id, value == 1)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_handler.event_tx.subscribe()
    }

    pub async fn get_events(
        &self,
        pin_id: u32,
        limit: Option<usize>,
    ) -> Result<Vec<EdgeEvent>, GpioError> {
        self.pin_config(pin_id)?;
        let map = &self.event_handler.event_history;

        Ok(map
            .get(&pin_id)
            .map(|d| {
                let history = d.read();
                let skip = history.len().saturating_sub(limit.unwrap_or(usize::MAX));
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    pub async fn get_last_event(&self, pin_id: u32) -> Result<Option<EdgeEvent>, GpioError> {
        self.pin_config(pin_id)?;
        let map = &self.event_handler.event_history;

        Ok(map.get(&pin_id).and_then(|d| d.read().back().cloned()))
    }
}
