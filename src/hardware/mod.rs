//! Bench instruments.
//!
//! - [`capabilities`]: one async trait per role (supply, meter, scope, sensor)
//! - [`scpi`]: shared SCPI base used by the Siglent drivers
//! - [`spd3303x`], [`sdm3045x`], [`sds1104x`]: Siglent drivers over any
//!   [`crate::transport::Transport`]
//! - [`ens210`]: ENS210 sensor behind a serial USB-to-I2C dongle
//! - [`target`]: turning `--spd 192.168.1.50` style arguments into transports
//! - [`discovery`]: `/dev/usbtmc*` probing
//! - [`mock`]: mock SCPI server and in-process mock instruments

pub mod capabilities;
pub mod discovery;
pub mod ens210;
pub mod mock;
pub mod scpi;
pub mod sdm3045x;
pub mod sds1104x;
pub mod serial;
pub mod spd3303x;
pub mod target;

pub use capabilities::{
    ChannelSetup, HumiditySensor, Multimeter, Oscilloscope, PowerSupply, SensorReading,
    TriggerSlope,
};
pub use ens210::{Ens210, Ens210Options};
pub use sdm3045x::Sdm3045x;
pub use sds1104x::Sds1104x;
pub use spd3303x::Spd3303x;
pub use target::Target;
