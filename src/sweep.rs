//! Measurement sweep across every electrode combination and frequency.
//!
//! The front-end holds at most [`MAX_CHANNELS_PER_CYCLE`] combinations per
//! cycle, so longer lists are measured in chunks. Each chunk clears and
//! re-applies the front-end settings, programs its combinations, starts the
//! measurement, then reads `chunk_len * fnum` result frames in
//! combination-major order.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Local};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::codec::{decode_single_at, decode_u16, decode_uint_be};
use crate::config::{CurrentRange, Reported, TimeStampMode};
use crate::errors::{DriverError, Result};
use crate::frame::{log_acknowledgement, AckClass, AckCode, Frame};
use crate::isx3::{Isx3, CMD_START_MEASURE};

/// Hardware limit of combinations measured per front-end cycle.
pub const MAX_CHANNELS_PER_CYCLE: usize = 128;

/// Acknowledgements chained before one result fold into a single warning code.
const MAX_CHAINED_ACKS: usize = 2;

/// One (electrode combination, frequency) result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub combination_index: usize,
    pub frequency_index: usize,
    /// Running index the device assigned to this result.
    pub device_index: u16,
    pub real: f32,
    pub imag: f32,
    /// `first + 1000 * second` of the acknowledgements preceding the result, 0 if none.
    pub warning_code: u32,
    /// `None` when current-range reporting is off.
    pub current_range: Option<Reported<CurrentRange>>,
    /// Raw timestamp bytes in wire order; `None` when timestamps are off.
    pub time_offset: Option<Vec<u8>>,
}

impl MeasurementRecord {
    /// Timestamp as an unsigned integer in the configured unit.
    pub fn time_offset_value(&self) -> Option<u64> {
        self.time_offset.as_deref().map(decode_uint_be)
    }

    pub fn magnitude(&self) -> f32 {
        self.real.hypot(self.imag)
    }
}

/// Full output of one sweep, indexed `[combination][frequency]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub real: Vec<Vec<f32>>,
    pub imag: Vec<Vec<f32>>,
    pub warning_code: Vec<Vec<u32>>,
    pub current_range: Vec<Vec<Option<Reported<CurrentRange>>>>,
    pub time_offset: Vec<Vec<Option<Vec<u8>>>>,
    pub start_time: DateTime<Local>,
    pub finish_time: DateTime<Local>,
}

impl SweepResult {
    fn with_shape(combinations: usize, fnum: usize, start_time: DateTime<Local>) -> Self {
        Self {
            real: vec![vec![0.0; fnum]; combinations],
            imag: vec![vec![0.0; fnum]; combinations],
            warning_code: vec![vec![0; fnum]; combinations],
            current_range: vec![vec![None; fnum]; combinations],
            time_offset: vec![vec![None; fnum]; combinations],
            start_time,
            finish_time: start_time,
        }
    }

    fn place(&mut self, record: MeasurementRecord) {
        let (c, f) = (record.combination_index, record.frequency_index);
        self.real[c][f] = record.real;
        self.imag[c][f] = record.imag;
        self.warning_code[c][f] = record.warning_code;
        self.current_range[c][f] = record.current_range;
        self.time_offset[c][f] = record.time_offset;
    }

    pub fn combinations(&self) -> usize {
        self.real.len()
    }

    pub fn frequencies(&self) -> usize {
        self.real.first().map_or(0, Vec::len)
    }

    /// Rebuild the record stored at `[combination][frequency]`.
    ///
    /// The device index is not kept in the arrays and is reported as 0.
    pub fn record(&self, combination: usize, frequency: usize) -> Option<MeasurementRecord> {
        Some(MeasurementRecord {
            combination_index: combination,
            frequency_index: frequency,
            device_index: 0,
            real: *self.real.get(combination)?.get(frequency)?,
            imag: self.imag[combination][frequency],
            warning_code: self.warning_code[combination][frequency],
            current_range: self.current_range[combination][frequency],
            time_offset: self.time_offset[combination][frequency].clone(),
        })
    }

    /// Warnings reported anywhere in the sweep, as `(combination, frequency, code)`.
    pub fn warnings(&self) -> Vec<(usize, usize, u32)> {
        self.warning_code
            .iter()
            .enumerate()
            .flat_map(|(c, row)| {
                row.iter()
                    .enumerate()
                    .filter(|(_, code)| **code != 0)
                    .map(move |(f, code)| (c, f, *code))
            })
            .collect()
    }
}

/// Optional fields present in result frames, fixed by the device options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultLayout {
    pub timestamp: TimeStampMode,
    pub report_current_range: bool,
}

impl ResultLayout {
    /// Payload length: index, timestamp, range byte, real and imaginary floats.
    pub fn payload_len(self) -> usize {
        2 + self.timestamp.byte_len() + usize::from(self.report_current_range) + 8
    }
}

/// Decode one result frame into a record placed at `[combination][frequency]`.
pub fn deserialize_result(
    frame: &Frame,
    layout: ResultLayout,
    warning_code: u32,
    combination_index: usize,
    frequency_index: usize,
) -> Result<MeasurementRecord> {
    if frame.tag() != CMD_START_MEASURE {
        return Err(DriverError::Protocol(format!(
            "expected a result frame, got tag {:#04X}",
            frame.tag()
        )));
    }
    let payload = frame.payload();
    if payload.len() != layout.payload_len() {
        return Err(DriverError::Decode(format!(
            "result payload has {} bytes, expected {} for {:?}",
            payload.len(),
            layout.payload_len(),
            layout
        )));
    }

    let device_index = decode_u16(payload, 0)?;
    let mut pos = 2;

    let ts_len = layout.timestamp.byte_len();
    let time_offset = (ts_len > 0).then(|| payload[pos..pos + ts_len].to_vec());
    pos += ts_len;

    let current_range = if layout.report_current_range {
        let range = CurrentRange::decode(payload[pos]);
        pos += 1;
        Some(range)
    } else {
        None
    };

    Ok(MeasurementRecord {
        combination_index,
        frequency_index,
        device_index,
        real: decode_single_at(payload, pos)?,
        imag: decode_single_at(payload, pos + 4)?,
        warning_code,
        current_range,
        time_offset,
    })
}

fn cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

impl Isx3 {
    /// Run one full sweep and return the populated result.
    pub fn get_measurements(&mut self) -> Result<SweepResult> {
        self.run_sweep(None, |_| {})
    }

    /// Run one full sweep, handing each record to `on_record` as it arrives.
    ///
    /// `cancel` is checked before each chunk; a set flag ends the sweep with
    /// [`DriverError::Cancelled`] once the running chunk has been read. Any
    /// error aborts the whole sweep and no partial result is returned.
    pub fn run_sweep<F>(
        &mut self,
        cancel: Option<&AtomicBool>,
        mut on_record: F,
    ) -> Result<SweepResult>
    where
        F: FnMut(&MeasurementRecord),
    {
        self.configuration().check_settings()?;
        let combinations = self.configuration().combinations().len();
        let fnum = usize::from(self.configuration().fnum());
        let layout = ResultLayout {
            timestamp: self.configuration().timestamp(),
            report_current_range: self.configuration().report_current_range(),
        };

        let mut result = SweepResult::with_shape(combinations, fnum, Local::now());
        info!(
            "sweep: {combinations} combinations x {fnum} frequencies in {} chunk(s)",
            combinations.div_ceil(MAX_CHANNELS_PER_CYCLE)
        );

        for chunk_start in (0..combinations).step_by(MAX_CHANNELS_PER_CYCLE) {
            if cancelled(cancel) {
                info!("sweep cancelled before combination {chunk_start}");
                return Err(DriverError::Cancelled);
            }
            let chunk_end = (chunk_start + MAX_CHANNELS_PER_CYCLE).min(combinations);
            debug!("chunk {chunk_start}..{chunk_end}");

            self.send_fe_settings()?;
            for offset in chunk_start..chunk_end {
                self.send_extension_port_channel(offset)?;
            }
            self.start_measurement()?;

            for combination in chunk_start..chunk_end {
                for frequency in 0..fnum {
                    let (frame, warning_code) = self.read_result_frame()?;
                    let record =
                        deserialize_result(&frame, layout, warning_code, combination, frequency)?;
                    on_record(&record);
                    result.place(record);
                }
            }
        }

        result.finish_time = Local::now();
        info!(
            "sweep finished in {} ms",
            (result.finish_time - result.start_time).num_milliseconds()
        );
        Ok(result)
    }

    /// Next result frame and the warning code of the acknowledgements before it.
    fn read_result_frame(&mut self) -> Result<(Frame, u32)> {
        let mut chained: Vec<AckCode> = Vec::with_capacity(MAX_CHAINED_ACKS);
        loop {
            let frame = self.read_frame()?;
            let Some(code) = frame.ack_byte() else {
                return Ok((frame, warning_code(&chained)));
            };

            let ack = AckCode::try_from(code)?;
            log_acknowledgement(CMD_START_MEASURE, ack);
            if ack.class() == AckClass::Rejection {
                return Err(DriverError::DeviceRejection {
                    command: CMD_START_MEASURE,
                    code: ack,
                });
            }
            if chained.len() == MAX_CHAINED_ACKS {
                return Err(DriverError::Protocol(format!(
                    "more than {MAX_CHAINED_ACKS} acknowledgements before a result"
                )));
            }
            chained.push(ack);
        }
    }
}

fn warning_code(chained: &[AckCode]) -> u32 {
    chained
        .iter()
        .zip([1u32, 1000])
        .map(|(ack, scale)| u32::from(ack.to_byte()) * scale)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_single;
    use crate::config::{
        generate_electrode_combinations, DeviceConfiguration, FeChannel, FrequencyScale,
    };
    use crate::mock::{ack, frame, result_frame, split_frames, MockPort};
    use std::sync::{Arc, Mutex};

    fn configuration(combinations: &[[u8; 4]], fnum: u16) -> DeviceConfiguration {
        let mut cfg = DeviceConfiguration::default();
        cfg.set_frequency(1e3, 1e4, fnum, FrequencyScale::Linear).unwrap();
        cfg.set_fe_channel(FeChannel::ExtensionPort);
        cfg.set_mux_channels(combinations).unwrap();
        cfg
    }

    fn session(port: MockPort, cfg: DeviceConfiguration) -> (Isx3, Arc<Mutex<Vec<u8>>>) {
        let written = port.written();
        let mut dev = Isx3::from_transport(Box::new(port));
        dev.set_configuration(cfg).unwrap();
        (dev, written)
    }

    /// Queue the acknowledgements and results of one chunk.
    fn queue_chunk(port: &mut MockPort, range: std::ops::Range<usize>, fnum: u16) {
        port.queue_acks(2 + range.len() + 1);
        for c in range {
            for f in 0..fnum {
                let index = (c * usize::from(fnum) + usize::from(f)) as u16;
                port.queue(&result_frame(index, 0x01, c as f32, f as f32));
            }
        }
    }

    #[test]
    fn chunks_at_the_channel_limit() {
        let combos: Vec<[u8; 4]> = generate_electrode_combinations(&[1, 2, 3, 4, 5, 6], false)
            .into_iter()
            .take(200)
            .collect();
        let fnum = 2;
        let mut port = MockPort::new();
        queue_chunk(&mut port, 0..128, fnum);
        queue_chunk(&mut port, 128..200, fnum);
        let (mut dev, written) = session(port, configuration(&combos, fnum));

        let mut seen = Vec::new();
        let result = dev
            .run_sweep(None, |r| seen.push((r.combination_index, r.frequency_index)))
            .unwrap();

        assert_eq!(seen.len(), 200 * 2);
        assert_eq!(seen[0], (0, 0));
        assert_eq!(seen[1], (0, 1));
        assert_eq!(seen[399], (199, 1));
        assert_eq!(result.combinations(), 200);
        assert_eq!(result.frequencies(), 2);
        assert_eq!(result.real[150][1], 150.0);
        assert_eq!(result.imag[150][1], 1.0);
        assert!(result.finish_time >= result.start_time);

        let frames = split_frames(&written.lock().unwrap());
        let fe_apply = frames
            .iter()
            .filter(|f| f[0] == 0xB0 && f[2] != 0xFF)
            .count();
        assert_eq!(fe_apply, 2);
        let channels: Vec<&[u8]> = frames
            .iter()
            .filter(|f| f[0] == 0xB2)
            .map(|f| &f[2..6])
            .collect();
        assert_eq!(channels.len(), 200);
        assert_eq!(channels[128], &combos[128][..]);
        assert_eq!(frames.iter().filter(|f| f[0] == 0xB8).count(), 2);
    }

    #[test]
    fn chained_acknowledgements_become_a_warning_code() {
        let mut port = MockPort::new();
        port.queue_acks(4);
        port.queue(&ack(0x90));
        port.queue(&ack(0x91));
        port.queue(&result_frame(0, 0x04, 1.0, -1.0));
        port.queue(&ack(0x90));
        port.queue(&result_frame(1, 0x07, 2.0, -2.0));
        let (mut dev, _) = session(port, configuration(&[[1, 2, 3, 4]], 2));

        let result = dev.get_measurements().unwrap();
        assert_eq!(result.warning_code[0], vec![0x90 + 1000 * 0x91, 0x90]);
        assert_eq!(
            result.current_range[0],
            vec![
                Some(Reported::Known(CurrentRange::Select1uA)),
                Some(Reported::Unknown(0x07)),
            ]
        );
        assert_eq!(result.warnings().len(), 2);
    }

    #[test]
    fn rejection_before_a_result_aborts() {
        let mut port = MockPort::new();
        port.queue_acks(4);
        port.queue(&ack(0x82));
        let (mut dev, _) = session(port, configuration(&[[1, 2, 3, 4]], 1));
        assert!(matches!(
            dev.get_measurements(),
            Err(DriverError::DeviceRejection { command: 0xB8, .. })
        ));
    }

    #[test]
    fn malformed_result_aborts_the_sweep() {
        let mut port = MockPort::new();
        port.queue_acks(4);
        port.queue(&result_frame(0, 0x01, 1.0, 1.0));
        let mut bad = result_frame(1, 0x01, 1.0, 1.0);
        let last = bad.len() - 1;
        bad[last] = 0x00;
        port.queue(&bad);
        let (mut dev, _) = session(port, configuration(&[[1, 2, 3, 4]], 2));

        let mut delivered = 0;
        let err = dev.run_sweep(None, |_| delivered += 1).unwrap_err();
        assert!(matches!(err, DriverError::MalformedFrame { tag: 0xB8, trailer: 0x00 }));
        assert_eq!(delivered, 1);
    }

    #[test]
    fn missing_results_time_out() {
        let mut port = MockPort::new();
        port.queue_acks(4);
        port.queue(&result_frame(0, 0x01, 1.0, 1.0));
        let (mut dev, _) = session(port, configuration(&[[1, 2, 3, 4]], 3));
        assert!(matches!(dev.get_measurements(), Err(DriverError::Timeout(_))));
    }

    #[test]
    fn cancel_flag_stops_before_the_next_chunk() {
        let (mut dev, written) = session(MockPort::new(), configuration(&[[1, 2, 3, 4]], 1));
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            dev.run_sweep(Some(&cancel), |_| {}),
            Err(DriverError::Cancelled)
        ));
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_during_a_chunk_finishes_it_and_skips_the_rest() {
        let combos: Vec<[u8; 4]> = generate_electrode_combinations(&[1, 2, 3, 4, 5, 6], false)
            .into_iter()
            .take(200)
            .collect();
        let mut port = MockPort::new();
        queue_chunk(&mut port, 0..128, 1);
        let (mut dev, written) = session(port, configuration(&combos, 1));

        let cancel = AtomicBool::new(false);
        let mut delivered = 0;
        let err = dev
            .run_sweep(Some(&cancel), |_| {
                delivered += 1;
                cancel.store(true, Ordering::Relaxed);
            })
            .unwrap_err();

        assert!(matches!(err, DriverError::Cancelled));
        assert_eq!(delivered, 128);
        let frames = split_frames(&written.lock().unwrap());
        assert_eq!(frames.iter().filter(|f| f[0] == 0xB8).count(), 1);
        let fe_apply = frames
            .iter()
            .filter(|f| f[0] == 0xB0 && f[2] != 0xFF)
            .count();
        assert_eq!(fe_apply, 1);
        assert_eq!(frames.iter().filter(|f| f[0] == 0xB2).count(), 128);
    }

    #[test]
    fn invalid_configuration_is_rejected_before_any_frame() {
        let (mut dev, written) = session(
            MockPort::new(),
            configuration(&[[1, 2, 3, 4], [2, 3, 4, 5]], 1),
        );
        dev.configuration_mut().set_fe_channel(FeChannel::Bnc);
        let err = dev.get_measurements().unwrap_err();
        assert!(err.is_configuration());
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn deserialize_with_timestamp_and_no_range() {
        let mut payload = vec![0x01, 0x02];
        payload.extend_from_slice(&[0x00, 0x01, 0x02, 0x03, 0x04]);
        payload.extend_from_slice(&encode_single(12.5));
        payload.extend_from_slice(&encode_single(-3.25));
        let bytes = frame(0xB8, &payload);
        let mut reader = bytes.as_slice();
        let frame = crate::frame::read_frame(&mut reader).unwrap();

        let layout = ResultLayout {
            timestamp: TimeStampMode::Us,
            report_current_range: false,
        };
        let record = deserialize_result(&frame, layout, 0, 3, 4).unwrap();
        assert_eq!(record.device_index, 0x0102);
        assert_eq!(record.time_offset, Some(vec![0x00, 0x01, 0x02, 0x03, 0x04]));
        assert_eq!(record.time_offset_value(), Some(0x01020304));
        assert_eq!(record.current_range, None);
        assert_eq!(record.real, 12.5);
        assert_eq!(record.imag, -3.25);
        assert_eq!((record.combination_index, record.frequency_index), (3, 4));

        let ms = ResultLayout {
            timestamp: TimeStampMode::Ms,
            report_current_range: false,
        };
        assert!(matches!(
            deserialize_result(&frame, ms, 0, 0, 0),
            Err(DriverError::Decode(_))
        ));
    }

    #[test]
    fn non_result_frame_is_a_protocol_error() {
        let bytes = frame(0xB1, &[0; 11]);
        let frame = crate::frame::read_frame(&mut bytes.as_slice()).unwrap();
        let layout = ResultLayout {
            timestamp: TimeStampMode::Off,
            report_current_range: true,
        };
        assert!(matches!(
            deserialize_result(&frame, layout, 0, 0, 0),
            Err(DriverError::Protocol(_))
        ));
    }
}
