pub mod backend;
pub mod config;
pub mod error;
pub mod gpio;
pub mod header;
pub mod interrupt;
pub mod pin;
pub mod routes;
pub mod sysfs;

#[cfg(test)]
mod testutil;

pub use config::{AppConfig, HttpConfig, PinConfig};
pub use error::GpioError;
pub use gpio::{
    EventCallbackHandler, EventHandler, GpioBackend, GpioManager, PinDescriptor, PinSettings,
    PinState,
};
pub use header::{GPIO_COUNT, HeaderPin, Rail};
pub use interrupt::{Callback, EdgeEvent, InterruptService};
pub use pin::Pin;
pub use routes::AppState;
pub use sysfs::{Edge, Mode, SysfsGateway};

pub use backend::{MockGpioBackend, SysfsBackend};
