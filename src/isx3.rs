//! ISX-3 device session and command catalog.
//!
//! Every command follows the same pattern: build `[cmd, len, payload..., cmd]`,
//! write it, collect data frames until the acknowledgement arrives, then parse
//! the data frames at fixed offsets. Commands derived from the
//! [`DeviceConfiguration`] re-run [`DeviceConfiguration::check_settings`]
//! first, so an invalid configuration never reaches the device.
//!
//! # Session state
//!
//! The session owns its transport exclusively. A restart resets the device,
//! closes the port, waits for the device to boot (about 12 seconds) and
//! reopens it; the session refuses commands while in that state.

use std::fmt;
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::codec::{
    byte_at, decode_single_at, decode_single_sequence, decode_u16, decode_u32, encode_single,
    take_array,
};
use crate::config::{
    wire_enum, CurrentRange, DeviceConfiguration, ElectrodeCombination, FeChannel, FeMode,
    Reported, SetupRequest, TimeStampMode,
};
use crate::errors::{DriverError, Result};
use crate::frame::{self, AckCode, Frame, Response, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default timeout for every blocking read and write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the device needs after a reset before the port can be reopened.
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_secs(12);

const CMD_SAVE_SETTINGS: u8 = 0x90;
const CMD_SET_OPTIONS: u8 = 0x97;
const CMD_GET_OPTIONS: u8 = 0x98;
const CMD_RESET_SYSTEM: u8 = 0xA1;
pub(crate) const CMD_SET_FE_SETTINGS: u8 = 0xB0;
const CMD_GET_FE_SETTINGS: u8 = 0xB1;
pub(crate) const CMD_SET_EXTENSION_PORT_CHANNEL: u8 = 0xB2;
const CMD_GET_EXTENSION_PORT_CHANNEL: u8 = 0xB3;
const CMD_GET_EXTENSION_PORT_MODULE: u8 = 0xB5;
const CMD_SET_SETUP: u8 = 0xB6;
const CMD_GET_SETUP: u8 = 0xB7;
pub(crate) const CMD_START_MEASURE: u8 = 0xB8;
const CMD_GET_SYNC_TIME: u8 = 0xBA;
const CMD_SET_ETHERNET: u8 = 0xBD;
const CMD_GET_ETHERNET: u8 = 0xBE;
const CMD_TCP_WATCHDOG: u8 = 0xCF;
const CMD_GET_ARM_FIRMWARE_ID: u8 = 0xD0;
const CMD_GET_DEVICE_ID: u8 = 0xD1;
const CMD_GET_FPGA_FIRMWARE_ID: u8 = 0xD2;

// Set setup sub-commands
const SETUP_RESET: u8 = 0x01;
const SETUP_ADD_SWEEP: u8 = 0x03;

// Get setup sub-commands
const SETUP_FREQUENCY_COUNT: u8 = 0x01;
const SETUP_FREQUENCY_POINT: u8 = 0x02;
const SETUP_FREQUENCY_LIST: u8 = 0x04;
const SETUP_SAVE_SLOT: u8 = 0x20;
const SETUP_DC_BIAS: u8 = 0x33;

// Ethernet sub-commands
const ETH_IP_ADDRESS: u8 = 0x01;
const ETH_MAC_ADDRESS: u8 = 0x02;
const ETH_DHCP: u8 = 0x03;

/// Front-end "clear" payload: resets the channel list before new settings.
const FE_CLEAR: [u8; 3] = [0xFF, 0xFF, 0xFF];

/// Start-measure enable block.
const START_MEASURE_ENABLE: [u8; 3] = [0x01, 0x00, 0x01];

/// Fixed optional-field block of the add-sweep setup command.
const SWEEP_OPTIONAL_BLOCK: [u8; 14] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00,
];

/// Delivery year is reported as an offset from this year.
const DELIVERY_YEAR_BASE: u16 = 2010;

// ============================================================================
// Data Types
// ============================================================================

/// How to open and reopen the serial port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
            settle_delay: RESTART_SETTLE_DELAY,
        }
    }
}

/// Lifecycle of the transport owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    /// Device is rebooting; no command may be issued.
    Restarting,
    Closed,
}

/// Front-end settings as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeSettings {
    pub mode: Reported<FeMode>,
    pub channel: Reported<FeChannel>,
    pub range: Reported<CurrentRange>,
}

wire_enum! {
    /// Module plugged into the extension port.
    ExternalModule {
        NoModule = 0x00 => "none",
        MeaRack = 0x01 => "mea-rack",
        MuxModule32 = 0x02 => "mux-module-32",
        EcisAdapter = 0x03 => "ecis-adapter",
        ExtPortAdapter = 0x05 => "extport-adapter",
        SlideChipAdapter = 0x06 => "slide-chip-adapter",
        Mux32Any2Any = 0x07 => "mux32-any2any",
        DaqEisMux = 0x08 => "daq-eis-mux",
        Mux32Any2Any2202 = 0x09 => "mux32-any2any-2202",
    }
}

wire_enum! {
    /// Multiplexer built into the device.
    InternalModule {
        NoModule = 0x00 => "none",
        MuxModule16x4 = 0x01 => "mux-module-16x4",
        MuxModule32x2 = 0x02 => "mux-module-32x2",
        Mux32Any2Any = 0x07 => "mux32-any2any",
        Mux32Any2Any2202 = 0x09 => "mux32-any2any-2202",
    }
}

/// Extension-port module identification.
///
/// Channel counts are only reported by the 2202 any-to-any multiplexers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPortModule {
    pub external: Reported<ExternalModule>,
    pub internal: Reported<InternalModule>,
    pub external_channels: Option<u8>,
    pub internal_channels: Option<u8>,
}

/// Settings of one point of the configured frequency list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyPoint {
    pub frequency: f32,
    pub precision: f32,
    pub amplitude: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareId {
    pub revision: u16,
    pub build: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    pub version: u8,
    pub device_id: u16,
    pub serial_number: u16,
    pub delivery_year: u16,
}

/// Device options read and written with the options commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOption {
    TimeStampMs,
    TimeStampUs,
    CurrentRangeReporting,
}

impl DeviceOption {
    fn to_byte(self) -> u8 {
        match self {
            DeviceOption::TimeStampMs => 0x01,
            DeviceOption::TimeStampUs => 0x02,
            DeviceOption::CurrentRangeReporting => 0x04,
        }
    }
}

/// Hardware address as the usual dash-separated hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{b:02x}")).collect();
        f.write_str(&parts.join("-"))
    }
}

type Reopen = Box<dyn FnMut() -> Result<Box<dyn Transport>> + Send>;

// ============================================================================
// Isx3 Session
// ============================================================================

/// ISX-3 device session.
///
/// # Example (Rust)
/// ```ignore
/// let mut device = Isx3::connect_serial(&SerialSettings {
///     path: "/dev/ttyUSB0".into(),
///     ..Default::default()
/// })?;
/// device.do_initial_setup(&request)?;
/// let sweep = device.get_measurements()?;
/// println!("{} combinations measured", sweep.real.len());
/// ```
pub struct Isx3 {
    transport: Option<Box<dyn Transport>>,
    reopen: Option<Reopen>,
    settle_delay: Duration,
    config: DeviceConfiguration,
    state: SessionState,
    last_ack: Option<AckCode>,
}

impl Isx3 {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the serial port described by `settings`.
    ///
    /// The settings are kept so [`Isx3::restart`] can reopen the same port.
    pub fn connect_serial(settings: &SerialSettings) -> Result<Self> {
        let transport = open_serial(settings)?;
        let reopen_settings = settings.clone();
        let mut device = Self::from_transport(transport);
        device.reopen = Some(Box::new(move || open_serial(&reopen_settings)));
        device.settle_delay = settings.settle_delay;
        info!("opened {} at {} baud", settings.path, settings.baud_rate);
        Ok(device)
    }

    /// Create a session on an already-open transport.
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            reopen: None,
            settle_delay: RESTART_SETTLE_DELAY,
            config: DeviceConfiguration::default(),
            state: SessionState::Ready,
            last_ack: None,
        }
    }

    /// Provide the way to reopen the transport after a restart.
    pub fn with_reopen<F>(mut self, settle_delay: Duration, reopen: F) -> Self
    where
        F: FnMut() -> Result<Box<dyn Transport>> + Send + 'static,
    {
        self.reopen = Some(Box::new(reopen));
        self.settle_delay = settle_delay;
        self
    }

    // ------------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn configuration(&self) -> &DeviceConfiguration {
        &self.config
    }

    /// Mutable access for the individual setters; nothing is sent until a command runs.
    pub fn configuration_mut(&mut self) -> &mut DeviceConfiguration {
        &mut self.config
    }

    /// Replace the whole configuration after validating it.
    pub fn set_configuration(&mut self, config: DeviceConfiguration) -> Result<()> {
        config.check_settings()?;
        self.config = config;
        Ok(())
    }

    /// Acknowledgement of the last completed command, including informational codes.
    pub fn last_acknowledgement(&self) -> Option<AckCode> {
        self.last_ack
    }

    /// Drop the transport; the session refuses commands afterwards.
    pub fn close(&mut self) {
        self.transport = None;
        self.state = SessionState::Closed;
    }

    /// Reset the device, then close and reopen the transport once it has booted.
    ///
    /// Blocks for the settle delay.
    pub fn restart(&mut self) -> Result<()> {
        if self.reopen.is_none() {
            return Err(DriverError::NotReady(
                "session has no way to reopen its transport".into(),
            ));
        }
        self.reset_system()?;

        self.state = SessionState::Restarting;
        self.transport = None;
        info!("device restarting, waiting {:?}", self.settle_delay);
        thread::sleep(self.settle_delay);

        let reopened = match self.reopen.as_mut() {
            Some(reopen) => reopen(),
            None => Err(DriverError::NotReady("reopen handler vanished".into())),
        };
        match reopened {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state = SessionState::Ready;
                info!("device restarted");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Frame access
    // ------------------------------------------------------------------------

    fn transport_mut(&mut self) -> Result<&mut dyn Transport> {
        match (self.state, self.transport.as_mut()) {
            (SessionState::Ready, Some(t)) => Ok(t.as_mut()),
            (SessionState::Restarting, _) => Err(DriverError::NotReady(
                "device is restarting".into(),
            )),
            _ => Err(DriverError::NotReady("transport is closed".into())),
        }
    }

    /// Write a raw command and collect the response.
    pub fn send_and_receive(&mut self, command: &[u8]) -> Result<Response> {
        let response = frame::send_and_receive(self.transport_mut()?, command)?;
        self.last_ack = Some(response.ack);
        Ok(response)
    }

    /// Read the next frame without sending anything.
    pub fn read_frame(&mut self) -> Result<Frame> {
        frame::read_frame(self.transport_mut()?)
    }

    fn command(&mut self, cmd: u8, payload: &[u8]) -> Result<Response> {
        let frame = Frame::build(cmd, payload)?;
        self.send_and_receive(frame.as_bytes())
    }

    // ------------------------------------------------------------------------
    // System Commands
    // ------------------------------------------------------------------------

    pub fn reset_system(&mut self) -> Result<()> {
        self.command(CMD_RESET_SYSTEM, &[])?;
        Ok(())
    }

    /// Persist the current device settings across power cycles.
    pub fn save_settings(&mut self) -> Result<()> {
        self.command(CMD_SAVE_SETTINGS, &[])?;
        Ok(())
    }

    /// Apply every setter, check, then send the sweep setup and the options.
    pub fn do_initial_setup(&mut self, request: &SetupRequest) -> Result<()> {
        self.config.apply(request)?;
        self.set_setup()?;
        self.set_options()?;
        debug!("initial setup done: {:?}", self.config);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Front-end
    // ------------------------------------------------------------------------

    /// Clear the channel list, then apply mode, channel and range.
    pub fn set_fe_settings(&mut self) -> Result<()> {
        self.config.check_settings()?;
        self.send_fe_settings()
    }

    /// Front-end frames for a configuration the caller has already checked.
    pub(crate) fn send_fe_settings(&mut self) -> Result<()> {
        let payload = [
            self.config.mode().to_byte(),
            self.config.channel().to_byte(),
            self.config.range().to_byte(),
        ];
        self.command(CMD_SET_FE_SETTINGS, &FE_CLEAR)?;
        self.command(CMD_SET_FE_SETTINGS, &payload)?;
        Ok(())
    }

    pub fn get_fe_settings(&mut self) -> Result<FeSettings> {
        let response = self.command(CMD_GET_FE_SETTINGS, &[])?;
        let msg = response.first()?.as_bytes();
        Ok(FeSettings {
            mode: FeMode::decode(byte_at(msg, 2)?),
            channel: FeChannel::decode(byte_at(msg, 3)?),
            range: CurrentRange::decode(byte_at(msg, 4)?),
        })
    }

    /// Add the electrode combination at `offset` to the device channel list.
    pub fn set_extension_port_channel(&mut self, offset: usize) -> Result<()> {
        self.config.check_settings()?;
        self.send_extension_port_channel(offset)
    }

    /// Channel frame for a configuration the caller has already checked.
    pub(crate) fn send_extension_port_channel(&mut self, offset: usize) -> Result<()> {
        let combination = *self.config.combinations().get(offset).ok_or_else(|| {
            DriverError::config(
                "muxElectrodeConfig",
                format!(
                    "no combination at offset {offset}, {} configured",
                    self.config.combinations().len()
                ),
            )
        })?;
        self.command(CMD_SET_EXTENSION_PORT_CHANNEL, &combination)?;
        Ok(())
    }

    /// Channel list currently programmed into the device.
    pub fn get_extension_port_channel(&mut self) -> Result<Vec<ElectrodeCombination>> {
        let payload = self.command(CMD_GET_EXTENSION_PORT_CHANNEL, &[])?.payload();
        if payload.len() % 4 != 0 {
            return Err(DriverError::Decode(format!(
                "channel list of {} bytes is not a multiple of 4",
                payload.len()
            )));
        }
        payload
            .chunks_exact(4)
            .map(|c| take_array::<4>(c, 0))
            .collect()
    }

    pub fn get_extension_port_module(&mut self) -> Result<ExtensionPortModule> {
        let response = self.command(CMD_GET_EXTENSION_PORT_MODULE, &[])?;
        let msg = response.first()?.as_bytes();
        let external = ExternalModule::decode(byte_at(msg, 2)?);
        let internal = InternalModule::decode(byte_at(msg, 3)?);

        let ext_2202 = external == Reported::Known(ExternalModule::Mux32Any2Any2202);
        let int_2202 = internal == Reported::Known(InternalModule::Mux32Any2Any2202);
        let (external_channels, internal_channels) = match (ext_2202, int_2202) {
            (true, true) => (Some(byte_at(msg, 4)?), Some(byte_at(msg, 5)?)),
            (true, false) => (Some(byte_at(msg, 4)?), None),
            (false, true) => (None, Some(byte_at(msg, 4)?)),
            (false, false) => (None, None),
        };

        Ok(ExtensionPortModule {
            external,
            internal,
            external_channels,
            internal_channels,
        })
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    /// Reset the frequency list, then program the configured sweep.
    pub fn set_setup(&mut self) -> Result<()> {
        self.config.check_settings()?;
        let payload = sweep_setup_payload(&self.config);
        self.command(CMD_SET_SETUP, &[SETUP_RESET])?;
        self.command(CMD_SET_SETUP, &payload)?;
        Ok(())
    }

    pub fn get_total_number_of_frequencies(&mut self) -> Result<u16> {
        let response = self.command(CMD_GET_SETUP, &[SETUP_FREQUENCY_COUNT])?;
        decode_u16(response.first()?.as_bytes(), 3)
    }

    /// Frequency, precision and amplitude of one point of the frequency list.
    pub fn get_frequency_point(&mut self, point: u16) -> Result<FrequencyPoint> {
        let [hi, lo] = point.to_be_bytes();
        let response = self.command(CMD_GET_SETUP, &[SETUP_FREQUENCY_POINT, hi, lo])?;
        let msg = response.first()?.as_bytes();
        Ok(FrequencyPoint {
            frequency: decode_single_at(msg, 3)?,
            precision: decode_single_at(msg, 7)?,
            amplitude: decode_single_at(msg, 11)?,
        })
    }

    /// All frequencies of the programmed sweep, in device order.
    ///
    /// Long lists arrive split over several frames; each frame echoes the
    /// sub-command before its floats.
    pub fn get_frequency_list(&mut self) -> Result<Vec<f32>> {
        let response = self.command(CMD_GET_SETUP, &[SETUP_FREQUENCY_LIST])?;
        let mut bytes = Vec::new();
        for frame in &response.frames {
            let floats = frame
                .payload()
                .strip_prefix(&[SETUP_FREQUENCY_LIST])
                .ok_or_else(|| {
                    DriverError::Decode(format!(
                        "frequency list frame without sub-command echo: {:02X?}",
                        frame.as_bytes()
                    ))
                })?;
            bytes.extend_from_slice(floats);
        }
        decode_single_sequence(&bytes)
    }

    /// Store the programmed setup in a device slot (1..=255).
    pub fn save_setup_to_slot(&mut self, slot: u8) -> Result<()> {
        if slot == 0 {
            return Err(DriverError::config("slot", "slot must be in [1, 255]"));
        }
        self.command(CMD_GET_SETUP, &[SETUP_SAVE_SLOT, slot])?;
        Ok(())
    }

    pub fn get_dc_bias(&mut self) -> Result<f32> {
        let response = self.command(CMD_GET_SETUP, &[SETUP_DC_BIAS])?;
        decode_single_at(response.first()?.as_bytes(), 3)
    }

    // ------------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------------

    /// Send the timestamp and current-range reporting options.
    pub fn set_options(&mut self) -> Result<()> {
        let timestamp = match self.config.timestamp() {
            TimeStampMode::Off => [DeviceOption::TimeStampMs.to_byte(), 0x00],
            TimeStampMode::Ms => [DeviceOption::TimeStampMs.to_byte(), 0x01],
            TimeStampMode::Us => [DeviceOption::TimeStampUs.to_byte(), 0x01],
        };
        self.command(CMD_SET_OPTIONS, &timestamp)?;

        let range = [
            DeviceOption::CurrentRangeReporting.to_byte(),
            u8::from(self.config.report_current_range()),
        ];
        self.command(CMD_SET_OPTIONS, &range)?;
        Ok(())
    }

    pub fn get_option(&mut self, option: DeviceOption) -> Result<bool> {
        let response = self.command(CMD_GET_OPTIONS, &[option.to_byte()])?;
        Ok(byte_at(response.first()?.as_bytes(), 3)? != 0)
    }

    pub fn get_timestamp_mode(&mut self) -> Result<TimeStampMode> {
        if self.get_option(DeviceOption::TimeStampMs)? {
            return Ok(TimeStampMode::Ms);
        }
        if self.get_option(DeviceOption::TimeStampUs)? {
            return Ok(TimeStampMode::Us);
        }
        Ok(TimeStampMode::Off)
    }

    // ------------------------------------------------------------------------
    // Measurement
    // ------------------------------------------------------------------------

    /// Start measuring the channel list; results follow as separate frames.
    pub fn start_measurement(&mut self) -> Result<()> {
        self.command(CMD_START_MEASURE, &START_MEASURE_ENABLE)?;
        Ok(())
    }

    pub fn get_sync_time(&mut self) -> Result<u32> {
        let response = self.command(CMD_GET_SYNC_TIME, &[])?;
        decode_u32(response.first()?.as_bytes(), 2)
    }

    // ------------------------------------------------------------------------
    // Ethernet
    // ------------------------------------------------------------------------

    pub fn set_ip_address(&mut self, address: Ipv4Addr) -> Result<()> {
        let [a, b, c, d] = address.octets();
        self.command(CMD_SET_ETHERNET, &[ETH_IP_ADDRESS, a, b, c, d])?;
        Ok(())
    }

    pub fn set_dhcp(&mut self, enabled: bool) -> Result<()> {
        self.command(CMD_SET_ETHERNET, &[ETH_DHCP, u8::from(enabled)])?;
        Ok(())
    }

    pub fn get_ip_address(&mut self) -> Result<Ipv4Addr> {
        let response = self.command(CMD_GET_ETHERNET, &[ETH_IP_ADDRESS])?;
        let octets: [u8; 4] = take_array(response.first()?.as_bytes(), 3)?;
        Ok(Ipv4Addr::from(octets))
    }

    pub fn get_mac_address(&mut self) -> Result<MacAddress> {
        let response = self.command(CMD_GET_ETHERNET, &[ETH_MAC_ADDRESS])?;
        Ok(MacAddress(take_array(response.first()?.as_bytes(), 3)?))
    }

    pub fn get_dhcp(&mut self) -> Result<bool> {
        let response = self.command(CMD_GET_ETHERNET, &[ETH_DHCP])?;
        Ok(byte_at(response.first()?.as_bytes(), 3)? == 1)
    }

    /// Close idle TCP clients after `interval_ms`; 0 disables the watchdog.
    pub fn set_tcp_watchdog(&mut self, interval_ms: u32) -> Result<()> {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&interval_ms.to_be_bytes());
        self.command(CMD_TCP_WATCHDOG, &payload)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Identification
    // ------------------------------------------------------------------------

    pub fn get_arm_firmware_id(&mut self) -> Result<FirmwareId> {
        let response = self.command(CMD_GET_ARM_FIRMWARE_ID, &[])?;
        let msg = response.first()?.as_bytes();
        Ok(FirmwareId {
            revision: decode_u16(msg, 4)?,
            build: decode_u16(msg, 6)?,
        })
    }

    pub fn get_device_id(&mut self) -> Result<DeviceId> {
        let response = self.command(CMD_GET_DEVICE_ID, &[])?;
        let msg = response.first()?.as_bytes();
        Ok(DeviceId {
            version: byte_at(msg, 2)?,
            device_id: decode_u16(msg, 3)?,
            serial_number: decode_u16(msg, 5)?,
            delivery_year: DELIVERY_YEAR_BASE.saturating_add(decode_u16(msg, 7)?),
        })
    }

    pub fn get_fpga_firmware_id(&mut self) -> Result<FirmwareId> {
        let response = self.command(CMD_GET_FPGA_FIRMWARE_ID, &[])?;
        let msg = response.first()?.as_bytes();
        Ok(FirmwareId {
            revision: decode_u16(msg, 7)?,
            build: decode_u16(msg, 9)?,
        })
    }
}

fn open_serial(settings: &SerialSettings) -> Result<Box<dyn Transport>> {
    let port = serialport::new(&settings.path, settings.baud_rate)
        .timeout(settings.timeout)
        .open()?;
    Ok(Box::new(port))
}

/// Payload of the add-sweep setup command.
///
/// Layout: sub-command, fmin, fmax, fnum (all f32), scale, precision,
/// amplitude (f32), the fixed optional block, excitation type.
fn sweep_setup_payload(cfg: &DeviceConfiguration) -> Vec<u8> {
    let mut payload = Vec::with_capacity(37);
    payload.push(SETUP_ADD_SWEEP);
    payload.extend_from_slice(&encode_single(cfg.fmin()));
    payload.extend_from_slice(&encode_single(cfg.fmax()));
    payload.extend_from_slice(&encode_single(f32::from(cfg.fnum())));
    payload.push(cfg.scale().to_byte());
    payload.extend_from_slice(&encode_single(cfg.precision()));
    payload.extend_from_slice(&encode_single(cfg.amplitude()));
    payload.extend_from_slice(&SWEEP_OPTIONAL_BLOCK);
    payload.push(cfg.excitation().to_byte());
    payload
}
