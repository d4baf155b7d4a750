//! Pre-flight check of the impedance window an excitation can resolve.

use log::debug;

use crate::config::{CurrentRange, InjectionType};
use crate::errors::{DriverError, Result};

/// Largest current the front-end can inject, in amps.
pub const MAX_INJECTION_CURRENT: f64 = 10e-3;
/// Largest voltage the front-end can apply, in volts.
pub const MAX_INJECTION_VOLTAGE: f64 = 1.0;

/// Inclusive impedance window in ohms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpedanceWindow {
    pub z_min: f64,
    pub z_max: f64,
}

impl ImpedanceWindow {
    pub fn contains(&self, ohms: f64) -> bool {
        ohms >= self.z_min && ohms <= self.z_max
    }
}

/// Impedance window the device can validly resolve under the given excitation.
///
/// `value` is in amps for current injection and volts for voltage injection.
/// Fails with [`DriverError::Range`] when the excitation exceeds what the
/// device can deliver.
pub fn calculate_valid_impedance_range(
    injection: InjectionType,
    value: f64,
    range: CurrentRange,
) -> Result<ImpedanceWindow> {
    if !value.is_finite() || value <= 0.0 {
        return Err(DriverError::Range(format!(
            "injection value {value} must be positive"
        )));
    }

    let window = match injection {
        InjectionType::Current => {
            if value > MAX_INJECTION_CURRENT {
                return Err(DriverError::Range(format!(
                    "injection current {value} A exceeds {MAX_INJECTION_CURRENT} A"
                )));
            }
            ImpedanceWindow {
                z_min: 0.0,
                z_max: MAX_INJECTION_VOLTAGE / value,
            }
        }
        InjectionType::Voltage => {
            if value > MAX_INJECTION_VOLTAGE {
                return Err(DriverError::Range(format!(
                    "injection voltage {value} V exceeds {MAX_INJECTION_VOLTAGE} V"
                )));
            }
            let floor = value / MAX_INJECTION_CURRENT;
            let z_min = match range.amps() {
                Some(ceiling) => floor.max(value / ceiling),
                None => floor,
            };
            ImpedanceWindow {
                z_min,
                z_max: f64::INFINITY,
            }
        }
    };

    debug!("impedance range: [{}, {}]", window.z_min, window.z_max);
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn voltage_with_auto_range() {
        let w = calculate_valid_impedance_range(InjectionType::Voltage, 0.5, CurrentRange::Auto)
            .unwrap();
        assert!(close(w.z_min, 50.0));
        assert!(w.z_max.is_infinite());
        assert!(w.contains(1e9));
        assert!(!w.contains(10.0));
    }

    #[test]
    fn voltage_with_fixed_range_uses_the_tighter_floor() {
        let w =
            calculate_valid_impedance_range(InjectionType::Voltage, 0.5, CurrentRange::Select1uA)
                .unwrap();
        assert!(close(w.z_min, 0.5 / 1e-6));

        let w =
            calculate_valid_impedance_range(InjectionType::Voltage, 0.5, CurrentRange::Select10mA)
                .unwrap();
        assert!(close(w.z_min, 50.0));
    }

    #[test]
    fn current_injection() {
        let w = calculate_valid_impedance_range(
            InjectionType::Current,
            0.005,
            CurrentRange::Select10mA,
        )
        .unwrap();
        assert_eq!(w.z_min, 0.0);
        assert!(close(w.z_max, 200.0));
    }

    #[test]
    fn excessive_excitation_is_rejected() {
        assert!(matches!(
            calculate_valid_impedance_range(InjectionType::Voltage, 2.0, CurrentRange::Auto),
            Err(DriverError::Range(_))
        ));
        for range in CurrentRange::ALL {
            assert!(matches!(
                calculate_valid_impedance_range(InjectionType::Current, 0.02, *range),
                Err(DriverError::Range(_))
            ));
        }
        assert!(
            calculate_valid_impedance_range(InjectionType::Current, 0.0, CurrentRange::Select10mA)
                .is_err()
        );
    }
}
