//! ISX-3 bioimpedance analyser driver with optional Python bindings.
//!
//! The device speaks a framed, acknowledged binary protocol over a serial
//! port: every command is `[cmd, len, payload..., cmd]` and is answered by
//! zero or more data frames followed by a 4-byte acknowledgement.
//!
//! # Layers
//!
//! - [`codec`]: big-endian float and integer conversions.
//! - [`frame`]: frame reading, acknowledgement handling, request/response.
//! - [`config`]: the desired device configuration and its validity rules.
//! - [`Isx3`]: the device session and command catalog.
//! - [`sweep`]: chunked multi-channel sweeps and result decoding.
//! - [`worker`]: a thread that owns a session and streams results.
//!
//! # Example
//! ```ignore
//! use _core::{Isx3, SerialSettings};
//!
//! let mut device = Isx3::connect_serial(&SerialSettings::default())?;
//! device.set_setup()?;
//! device.set_options()?;
//! let result = device.get_measurements()?;
//! ```

pub mod codec;
pub mod config;
mod errors;
pub mod frame;
pub mod impedance_range;
mod isx3;
pub mod logging;
pub mod sweep;
pub mod worker;

#[cfg(test)]
mod mock;
#[cfg(feature = "python")]
mod python;

pub use config::{
    generate_electrode_combinations, CurrentRange, DeviceConfiguration, ElectrodeCombination,
    FeChannel, FeMode, FrequencyScale, InjectionType, Reported, SetupRequest, TimeStampMode,
};
pub use errors::*;
pub use frame::{AckClass, AckCode, Frame, Response, Transport};
pub use impedance_range::{calculate_valid_impedance_range, ImpedanceWindow};
pub use isx3::{
    DeviceId, DeviceOption, ExtensionPortModule, ExternalModule, FeSettings, FirmwareId,
    FrequencyPoint, InternalModule, Isx3, MacAddress, SerialSettings, SessionState,
    DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT, RESTART_SETTLE_DELAY,
};
pub use sweep::{deserialize_result, MeasurementRecord, ResultLayout, SweepResult};
pub use worker::{Repeat, SweepWorker, WorkerCommand, WorkerEvent};
