//! Desired instrument configuration and its validation rules.
//!
//! [`DeviceConfiguration`] is owned by the caller and only read by the device
//! session. Every setter validates its argument before touching any field, and
//! [`DeviceConfiguration::check_settings`] enforces the cross-field rules that
//! must hold before a single byte is sent to the instrument.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

/// Highest frequency point count accepted by the sweep setup.
pub const MAX_FREQUENCY_POINTS: u16 = 2047;
/// Highest precision setting accepted by the device.
pub const MAX_PRECISION: f32 = 10.0;

/// One multiplexed measurement path: four channel indices, in the order the
/// front-end expects them for the selected mode.
pub type ElectrodeCombination = [u8; 4];

/// Define a closed enumeration with its protocol byte and a lowercase label
/// used by `Display`/`FromStr`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $byte:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn to_byte(self) -> u8 {
                match self {
                    $($name::$variant => $byte),+
                }
            }

            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some($name::$variant),)+
                    _ => None,
                }
            }

            /// Decode a byte reported by the device, keeping unknown values.
            pub fn decode(byte: u8) -> $crate::config::Reported<Self> {
                match Self::from_byte(byte) {
                    Some(v) => $crate::config::Reported::Known(v),
                    None => $crate::config::Reported::Unknown(byte),
                }
            }

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.label())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::errors::DriverError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.label() == wanted)
                    .ok_or_else(|| $crate::errors::DriverError::Configuration {
                        field: stringify!($name),
                        message: format!(
                            "unknown value '{}', expected one of: {}",
                            s,
                            Self::ALL.iter().map(|v| v.label()).collect::<Vec<_>>().join(", ")
                        ),
                    })
            }
        }
    };
}
pub(crate) use wire_enum;

/// A device-reported enumeration byte that may fall outside the known catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reported<T> {
    Known(T),
    Unknown(u8),
}

impl<T> Reported<T> {
    pub fn known(self) -> Option<T> {
        match self {
            Reported::Known(v) => Some(v),
            Reported::Unknown(_) => None,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Reported<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reported::Known(v) => v.fmt(f),
            Reported::Unknown(b) => write!(f, "unknown({b:#04X})"),
        }
    }
}

wire_enum! {
    /// Stimulus driving the measurement.
    InjectionType {
        Voltage = 0x01 => "voltage",
        Current = 0x02 => "current",
    }
}

wire_enum! {
    /// Current range of the front-end.
    CurrentRange {
        Auto = 0x00 => "auto",
        Select10mA = 0x01 => "10ma",
        Select100uA = 0x02 => "100ua",
        Select1uA = 0x04 => "1ua",
        Select10nA = 0x06 => "10na",
    }
}

impl CurrentRange {
    /// Ceiling current in amps; `None` when the device picks the range.
    pub fn amps(self) -> Option<f64> {
        match self {
            CurrentRange::Auto => None,
            CurrentRange::Select10mA => Some(10e-3),
            CurrentRange::Select100uA => Some(100e-6),
            CurrentRange::Select1uA => Some(1e-6),
            CurrentRange::Select10nA => Some(10e-9),
        }
    }
}

wire_enum! {
    FrequencyScale {
        Linear = 0x00 => "linear",
        Logarithmic = 0x01 => "log",
    }
}

wire_enum! {
    /// Electrode topology of the front-end.
    FeMode {
        TwoPoint = 0x01 => "2pt",
        FourPoint = 0x02 => "4pt",
        ThreePoint = 0x03 => "3pt",
    }
}

wire_enum! {
    FeChannel {
        Bnc = 0x01 => "bnc",
        ExtensionPort = 0x02 => "extport",
        InternalMux = 0x03 => "mux",
    }
}

/// Timestamp attached to each result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeStampMode {
    #[default]
    Off,
    Ms,
    Us,
}

impl TimeStampMode {
    pub const ALL: &'static [TimeStampMode] =
        &[TimeStampMode::Off, TimeStampMode::Ms, TimeStampMode::Us];

    /// Bytes the timestamp occupies in a result frame.
    pub fn byte_len(self) -> usize {
        match self {
            TimeStampMode::Off => 0,
            TimeStampMode::Ms => 4,
            TimeStampMode::Us => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TimeStampMode::Off => "off",
            TimeStampMode::Ms => "ms",
            TimeStampMode::Us => "us",
        }
    }
}

impl fmt::Display for TimeStampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TimeStampMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(TimeStampMode::Off),
            "ms" => Ok(TimeStampMode::Ms),
            "us" => Ok(TimeStampMode::Us),
            _ => Err(DriverError::config(
                "TimeStampMode",
                format!("unknown value '{s}', expected one of: off, ms, us"),
            )),
        }
    }
}

// ============================================================================
// Device configuration
// ============================================================================

/// Every argument of the composite initial setup, applied in one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupRequest {
    pub fmin: f32,
    pub fmax: f32,
    pub fnum: u16,
    pub scale: FrequencyScale,
    pub channel: FeChannel,
    pub mode: FeMode,
    pub range: CurrentRange,
    pub precision: f32,
    pub excitation: InjectionType,
    pub amplitude: f32,
    pub combinations: Vec<ElectrodeCombination>,
    pub timestamp: TimeStampMode,
    pub report_current_range: bool,
}

/// Desired state of the instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    fmin: f32,
    fmax: f32,
    fnum: u16,
    scale: FrequencyScale,
    mode: FeMode,
    channel: FeChannel,
    range: CurrentRange,
    excitation: InjectionType,
    amplitude: f32,
    precision: f32,
    combinations: Vec<ElectrodeCombination>,
    timestamp: TimeStampMode,
    report_current_range: bool,
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            fmin: 1e3,
            fmax: 1e7,
            fnum: 13,
            scale: FrequencyScale::Logarithmic,
            mode: FeMode::FourPoint,
            channel: FeChannel::Bnc,
            range: CurrentRange::Select10mA,
            excitation: InjectionType::Voltage,
            amplitude: 0.5,
            precision: 1.0,
            combinations: vec![[1, 2, 3, 4]],
            timestamp: TimeStampMode::Off,
            report_current_range: true,
        }
    }
}

impl DeviceConfiguration {
    // ------------------------------------------------------------------------
    // Setters
    // ------------------------------------------------------------------------

    pub fn set_frequency(
        &mut self,
        fmin: f32,
        fmax: f32,
        fnum: u16,
        scale: FrequencyScale,
    ) -> Result<()> {
        check_frequency("fmin", fmin)?;
        check_frequency("fmax", fmax)?;
        check_fnum(fnum)?;
        self.fmin = fmin;
        self.fmax = fmax;
        self.fnum = fnum;
        self.scale = scale;
        Ok(())
    }

    pub fn set_fe_mode(&mut self, mode: FeMode) {
        self.mode = mode;
    }

    pub fn set_fe_channel(&mut self, channel: FeChannel) {
        self.channel = channel;
    }

    pub fn set_range(&mut self, range: CurrentRange) {
        self.range = range;
    }

    pub fn set_precision(&mut self, precision: f32) -> Result<()> {
        check_precision(precision)?;
        self.precision = precision;
        Ok(())
    }

    pub fn set_excitation_type(&mut self, excitation: InjectionType) {
        self.excitation = excitation;
    }

    /// Amplitude in volts or amps, depending on the excitation type.
    pub fn set_excitation_amplitude(&mut self, amplitude: f32) -> Result<()> {
        check_amplitude(amplitude)?;
        self.amplitude = amplitude;
        Ok(())
    }

    pub fn set_time_stamp(&mut self, timestamp: TimeStampMode) {
        self.timestamp = timestamp;
    }

    pub fn set_report_current_range(&mut self, enabled: bool) {
        self.report_current_range = enabled;
    }

    /// Replace the electrode combinations; each must have exactly 4 entries.
    pub fn set_mux_channels<C: AsRef<[u8]>>(&mut self, combinations: &[C]) -> Result<()> {
        let parsed = combinations
            .iter()
            .enumerate()
            .map(|(i, c)| {
                <ElectrodeCombination>::try_from(c.as_ref()).map_err(|_| {
                    DriverError::config(
                        "muxElectrodeConfig",
                        format!(
                            "combination {i} has {} entries, expected 4: {:?}",
                            c.as_ref().len(),
                            c.as_ref()
                        ),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.combinations = parsed;
        Ok(())
    }

    /// Apply every setter in a fixed order, then the cross-field checks.
    ///
    /// Nothing is committed unless the whole request is valid.
    pub fn apply(&mut self, request: &SetupRequest) -> Result<()> {
        let mut next = self.clone();
        next.set_frequency(request.fmin, request.fmax, request.fnum, request.scale)?;
        next.set_fe_channel(request.channel);
        next.set_fe_mode(request.mode);
        next.set_range(request.range);
        next.set_precision(request.precision)?;
        next.set_excitation_type(request.excitation);
        next.set_excitation_amplitude(request.amplitude)?;
        next.set_mux_channels(&request.combinations)?;
        next.set_time_stamp(request.timestamp);
        next.set_report_current_range(request.report_current_range);
        next.check_settings()?;
        *self = next;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Cross-field invariants; must pass before any device command is sent.
    pub fn check_settings(&self) -> Result<()> {
        // Fields may have arrived through deserialization rather than setters.
        check_frequency("fmin", self.fmin)?;
        check_frequency("fmax", self.fmax)?;
        check_fnum(self.fnum)?;
        check_precision(self.precision)?;
        check_amplitude(self.amplitude)?;

        if self.combinations.is_empty() {
            return Err(DriverError::config(
                "muxElectrodeConfig",
                "no electrode combinations configured",
            ));
        }
        if self.channel == FeChannel::Bnc && self.combinations.len() != 1 {
            return Err(DriverError::config(
                "muxElectrodeConfig",
                format!(
                    "BNC channel measures exactly one combination, {} configured",
                    self.combinations.len()
                ),
            ));
        }
        if self.excitation == InjectionType::Current && self.range == CurrentRange::Auto {
            return Err(DriverError::config(
                "range",
                "auto current range is not supported for current injection",
            ));
        }
        for (i, c) in self.combinations.iter().enumerate() {
            if !combination_matches_mode(self.mode, c) {
                return Err(DriverError::config(
                    "muxElectrodeConfig",
                    format!("combination {i} {c:?} does not match {} mode", self.mode),
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn fmin(&self) -> f32 {
        self.fmin
    }

    pub fn fmax(&self) -> f32 {
        self.fmax
    }

    pub fn fnum(&self) -> u16 {
        self.fnum
    }

    pub fn scale(&self) -> FrequencyScale {
        self.scale
    }

    pub fn mode(&self) -> FeMode {
        self.mode
    }

    pub fn channel(&self) -> FeChannel {
        self.channel
    }

    pub fn range(&self) -> CurrentRange {
        self.range
    }

    pub fn excitation(&self) -> InjectionType {
        self.excitation
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    pub fn precision(&self) -> f32 {
        self.precision
    }

    pub fn combinations(&self) -> &[ElectrodeCombination] {
        &self.combinations
    }

    pub fn timestamp(&self) -> TimeStampMode {
        self.timestamp
    }

    pub fn report_current_range(&self) -> bool {
        self.report_current_range
    }

    /// Frequencies the device will step through, computed on the host.
    ///
    /// Useful when no device is attached; [`crate::Isx3::get_frequency_list`]
    /// returns the values the device actually uses.
    pub fn expected_frequencies(&self) -> Vec<f64> {
        let n = self.fnum as usize;
        let (lo, hi) = (self.fmin as f64, self.fmax as f64);
        if n == 1 {
            return vec![lo];
        }
        let steps = (n - 1) as f64;
        (0..n)
            .map(|i| {
                let t = i as f64 / steps;
                match self.scale {
                    FrequencyScale::Linear => lo + (hi - lo) * t,
                    FrequencyScale::Logarithmic => lo * (hi / lo).powf(t),
                }
            })
            .collect()
    }
}

fn check_frequency(field: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DriverError::config(
            field,
            format!("{value} Hz must be a positive frequency"),
        ))
    }
}

fn check_fnum(fnum: u16) -> Result<()> {
    if (1..=MAX_FREQUENCY_POINTS).contains(&fnum) {
        Ok(())
    } else {
        Err(DriverError::config(
            "fnum",
            format!("{fnum} frequency points is out of range [1, {MAX_FREQUENCY_POINTS}]"),
        ))
    }
}

fn check_precision(precision: f32) -> Result<()> {
    if (0.0..=MAX_PRECISION).contains(&precision) {
        Ok(())
    } else {
        Err(DriverError::config(
            "precision",
            format!("{precision} is out of range [0, {MAX_PRECISION}]"),
        ))
    }
}

fn check_amplitude(amplitude: f32) -> Result<()> {
    if amplitude.is_finite() && amplitude > 0.0 {
        Ok(())
    } else {
        Err(DriverError::config(
            "amplitude",
            format!("{amplitude} must be a positive excitation amplitude"),
        ))
    }
}

/// Mode-specific electrode distinctness rules.
///
/// - 2-point: `[a, a, b, b]` with `a != b`
/// - 3-point: `[a, b, c, c]` with `a`, `b`, `c` distinct
/// - 4-point: all four distinct
pub fn combination_matches_mode(mode: FeMode, c: &ElectrodeCombination) -> bool {
    let [a, b, x, y] = *c;
    match mode {
        FeMode::TwoPoint => a == b && x == y && a != x,
        FeMode::ThreePoint => a != b && x == y && a != x && b != x,
        FeMode::FourPoint => a != b && a != x && a != y && b != x && b != y && x != y,
    }
}

/// All 4-electrode combinations of `electrodes` (default `1..=5`).
///
/// With `ordered`, each set appears once in ascending input order; otherwise
/// every ordering of each set is produced.
pub fn generate_electrode_combinations(
    electrodes: &[u8],
    ordered: bool,
) -> Vec<ElectrodeCombination> {
    let default: Vec<u8> = (1..=5).collect();
    let e = if electrodes.is_empty() {
        default.as_slice()
    } else {
        electrodes
    };
    let n = e.len();

    let mut sets = Vec::new();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                for l in k + 1..n {
                    sets.push([e[i], e[j], e[k], e[l]]);
                }
            }
        }
    }
    if ordered {
        return sets;
    }

    let mut orders = Vec::with_capacity(24);
    for i in 0..4 {
        for j in (0..4).filter(|&j| j != i) {
            for k in (0..4).filter(|&k| k != i && k != j) {
                let l = 6 - i - j - k;
                orders.push([i, j, k, l]);
            }
        }
    }
    sets.iter()
        .flat_map(|s| orders.iter().map(move |o| [s[o[0]], s[o[1]], s[o[2]], s[o[3]]]))
        .collect()
}
