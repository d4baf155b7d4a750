//! Logging setup: `env_logger` for binaries, a bridge into Python's `logging`
//! for the extension module.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `ISX3_LOG`, then `RUST_LOG`, default `info`.
pub fn env_level() -> LevelFilter {
    let var = std::env::var("ISX3_LOG").or_else(|_| std::env::var("RUST_LOG"));
    parse_level(var.ok().as_deref()).unwrap_or(LevelFilter::Info)
}

pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Install the stderr logger once; later calls are no-ops.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(env_level().as_str());
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .init();
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, set_python_log_level, set_python_log_level_str};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Forwards `log` records to `logging.getLogger(target)`, `::` mapped to `.`.
    struct PyLogger {
        level: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn logger_for<'py>(&self, py: Python<'py>, target: &str) -> PyResult<Bound<'py, PyAny>> {
            let mut loggers = self
                .loggers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(logger) = loggers.get(target) {
                return Ok(logger.bind(py).clone());
            }
            let logger = self.logging.bind(py).call_method1("getLogger", (target,))?;
            loggers.insert(target.to_string(), logger.clone().unbind());
            Ok(logger)
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let logger = self.logger_for(py, &target)?;
            let level = python_level(record.level());
            if !logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                return Ok(());
            }
            let none = py.None();
            let py_record = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    level,
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (py_record,))?;
            Ok(())
        }

        fn level(&self) -> LevelFilter {
            *self
                .level
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust log records into Python's `logging`. Safe to call repeatedly.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut result = Ok(());
        PY_LOG_ONCE.call_once(|| {
            let logging = match py.import("logging") {
                Ok(m) => m.unbind(),
                Err(e) => {
                    result = Err(e);
                    return;
                }
            };
            let logger: &'static PyLogger = Box::leak(Box::new(PyLogger {
                level: Mutex::new(level),
                logging,
                loggers: Mutex::new(HashMap::new()),
            }));
            if log::set_logger(logger).is_ok() {
                log::set_max_level(level);
                let _ = PY_LOGGER.set(logger);
            }
        });
        result
    }

    /// Change the level forwarded to Python and drop cached loggers.
    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            *logger
                .level
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = level;
            logger
                .loggers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
        }
        log::set_max_level(level);
        Ok(())
    }

    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        set_python_log_level(py, parse_level(level).unwrap_or_else(env_level))
    }
}
