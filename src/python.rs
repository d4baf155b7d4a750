//! Python bindings for the `_core` extension module.

use std::time::Duration;

use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::codec::decode_uint_be;
use crate::config::{
    generate_electrode_combinations, CurrentRange, FeChannel, FeMode, FrequencyScale,
    InjectionType, SetupRequest, TimeStampMode,
};
use crate::errors::DriverError;
use crate::impedance_range::calculate_valid_impedance_range;
use crate::isx3::{Isx3, SerialSettings, DEFAULT_BAUD_RATE};
use crate::logging;
use crate::sweep::SweepResult;

impl From<DriverError> for PyErr {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Configuration { .. } | DriverError::Range(_) => {
                PyValueError::new_err(e.to_string())
            }
            DriverError::Timeout(_) => PyTimeoutError::new_err(e.to_string()),
            DriverError::Io(_) | DriverError::Serial(_) => PyIOError::new_err(e.to_string()),
            _ => PyRuntimeError::new_err(e.to_string()),
        }
    }
}

/// Result of one sweep, indexed `[combination][frequency]`.
///
/// Attributes:
///     real, imag: Impedance parts in ohms.
///     warning_code: Chained acknowledgement codes, 0 when clean.
///     current_range: Range label per point, None when reporting is off.
///     time_offset: Timestamp per point, None when timestamps are off.
///     start_time, finish_time: ISO 8601 strings.
#[pyclass(name = "SweepResult", frozen)]
#[derive(Clone)]
struct PySweepResult {
    #[pyo3(get)]
    real: Vec<Vec<f32>>,
    #[pyo3(get)]
    imag: Vec<Vec<f32>>,
    #[pyo3(get)]
    warning_code: Vec<Vec<u32>>,
    #[pyo3(get)]
    current_range: Vec<Vec<Option<String>>>,
    #[pyo3(get)]
    time_offset: Vec<Vec<Option<u64>>>,
    #[pyo3(get)]
    start_time: String,
    #[pyo3(get)]
    finish_time: String,
}

#[pymethods]
impl PySweepResult {
    fn __repr__(&self) -> String {
        format!(
            "SweepResult(combinations={}, frequencies={}, start_time={})",
            self.real.len(),
            self.real.first().map_or(0, Vec::len),
            self.start_time
        )
    }
}

impl From<SweepResult> for PySweepResult {
    fn from(r: SweepResult) -> Self {
        let time_offset = r
            .time_offset
            .iter()
            .map(|row| row.iter().map(|b| b.as_deref().map(decode_uint_be)).collect())
            .collect();
        PySweepResult {
            current_range: r
                .current_range
                .iter()
                .map(|row| row.iter().map(|c| c.as_ref().map(ToString::to_string)).collect())
                .collect(),
            time_offset,
            start_time: r.start_time.to_rfc3339(),
            finish_time: r.finish_time.to_rfc3339(),
            real: r.real,
            imag: r.imag,
            warning_code: r.warning_code,
        }
    }
}

/// ISX-3 impedance analyser on a serial port.
///
/// Example:
///     >>> dev = Isx3("/dev/ttyUSB0")
///     >>> dev.setup(fmin=1e3, fmax=1e6, fnum=20)
///     >>> result = dev.sweep()
///     >>> print(result.real[0])
#[pyclass(name = "Isx3", unsendable)]
struct PyIsx3 {
    inner: Isx3,
}

#[pymethods]
impl PyIsx3 {
    #[new]
    #[pyo3(signature = (path, baud_rate=DEFAULT_BAUD_RATE, timeout_s=10.0))]
    fn new(path: &str, baud_rate: u32, timeout_s: f64) -> PyResult<Self> {
        let settings = SerialSettings {
            path: path.to_string(),
            baud_rate,
            timeout: Duration::try_from_secs_f64(timeout_s)
                .map_err(|e| PyValueError::new_err(e.to_string()))?,
            ..Default::default()
        };
        Ok(PyIsx3 {
            inner: Isx3::connect_serial(&settings)?,
        })
    }

    /// Validate and send a complete setup.
    ///
    /// Enumerations are given by name, e.g. `mode="4pt"`, `channel="extport"`,
    /// `range="10ma"`, `excitation="voltage"`, `timestamp="ms"`.
    ///
    /// Raises:
    ///     ValueError: If any setting is invalid; nothing is sent in that case.
    #[pyo3(signature = (
        fmin=1e3, fmax=1e7, fnum=13, scale="log", channel="bnc", mode="4pt",
        range="10ma", precision=1.0, excitation="voltage", amplitude=0.5,
        combinations=None, timestamp="off", report_current_range=true
    ))]
    #[allow(clippy::too_many_arguments)]
    fn setup(
        &mut self,
        fmin: f32,
        fmax: f32,
        fnum: u16,
        scale: &str,
        channel: &str,
        mode: &str,
        range: &str,
        precision: f32,
        excitation: &str,
        amplitude: f32,
        combinations: Option<Vec<[u8; 4]>>,
        timestamp: &str,
        report_current_range: bool,
    ) -> PyResult<()> {
        let request = SetupRequest {
            fmin,
            fmax,
            fnum,
            scale: scale.parse::<FrequencyScale>()?,
            channel: channel.parse::<FeChannel>()?,
            mode: mode.parse::<FeMode>()?,
            range: range.parse::<CurrentRange>()?,
            precision,
            excitation: excitation.parse::<InjectionType>()?,
            amplitude,
            combinations: combinations.unwrap_or_else(|| vec![[1, 2, 3, 4]]),
            timestamp: timestamp.parse::<TimeStampMode>()?,
            report_current_range,
        };
        Ok(self.inner.do_initial_setup(&request)?)
    }

    /// Run one sweep over all combinations and frequencies.
    fn sweep(&mut self, py: Python<'_>) -> PyResult<PySweepResult> {
        let result = py.detach(|| self.inner.get_measurements())?;
        Ok(result.into())
    }

    fn get_frequency_list(&mut self) -> PyResult<Vec<f32>> {
        Ok(self.inner.get_frequency_list()?)
    }

    fn get_fe_settings<'py>(&mut self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let fe = self.inner.get_fe_settings()?;
        let dict = PyDict::new(py);
        dict.set_item("mode", fe.mode.to_string())?;
        dict.set_item("channel", fe.channel.to_string())?;
        dict.set_item("range", fe.range.to_string())?;
        Ok(dict)
    }

    fn get_device_id<'py>(&mut self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let id = self.inner.get_device_id()?;
        let dict = PyDict::new(py);
        dict.set_item("version", id.version)?;
        dict.set_item("device_id", id.device_id)?;
        dict.set_item("serial_number", id.serial_number)?;
        dict.set_item("delivery_year", id.delivery_year)?;
        Ok(dict)
    }

    /// ARM and FPGA firmware as `(revision, build)` pairs.
    fn get_firmware_ids(&mut self) -> PyResult<((u16, u16), (u16, u16))> {
        let arm = self.inner.get_arm_firmware_id()?;
        let fpga = self.inner.get_fpga_firmware_id()?;
        Ok(((arm.revision, arm.build), (fpga.revision, fpga.build)))
    }

    fn save_settings(&mut self) -> PyResult<()> {
        Ok(self.inner.save_settings()?)
    }

    /// Reset and reopen the port; blocks for about 12 seconds.
    fn restart(&mut self, py: Python<'_>) -> PyResult<()> {
        Ok(py.detach(|| self.inner.restart())?)
    }

    fn __repr__(&self) -> String {
        format!("Isx3(state={:?})", self.inner.state())
    }
}

/// Impedance window `(z_min, z_max)` in ohms for the given excitation.
///
/// Raises:
///     ValueError: If the excitation exceeds the device limits.
#[pyfunction(name = "calculate_valid_impedance_range")]
#[pyo3(signature = (injection, value, range="auto"))]
fn py_calculate_valid_impedance_range(
    injection: &str,
    value: f64,
    range: &str,
) -> PyResult<(f64, f64)> {
    let window = calculate_valid_impedance_range(
        injection.parse::<InjectionType>()?,
        value,
        range.parse::<CurrentRange>()?,
    )?;
    Ok((window.z_min, window.z_max))
}

#[pyfunction(name = "generate_electrode_combinations")]
#[pyo3(signature = (electrodes=None, ordered=false))]
fn py_generate_electrode_combinations(
    electrodes: Option<Vec<u8>>,
    ordered: bool,
) -> Vec<[u8; 4]> {
    generate_electrode_combinations(&electrodes.unwrap_or_default(), ordered)
}

#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::set_python_log_level_str(py, level)
}

#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;
    m.add_class::<PyIsx3>()?;
    m.add_class::<PySweepResult>()?;
    m.add_function(wrap_pyfunction!(py_calculate_valid_impedance_range, m)?)?;
    m.add_function(wrap_pyfunction!(py_generate_electrode_combinations, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add("DEFAULT_BAUD_RATE", DEFAULT_BAUD_RATE)?;
    Ok(())
}
