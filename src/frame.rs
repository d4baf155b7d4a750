//! Frame layer of the ISX-3 serial protocol.
//!
//! Every unit on the wire has the shape `[tag, length, body..., tag]`: the
//! command tag is repeated as the last byte of the body and serves as the
//! integrity marker. Commands are answered by zero or more data frames followed
//! by one 4-byte acknowledgement frame `[0x18, 0x01, code, 0x18]`.

use std::fmt;
use std::io::{self, Read, Write};

use log::{debug, info, warn};

use crate::errors::{DriverError, Result};

/// Tag byte of acknowledgement frames.
pub const ACK_TAG: u8 = 0x18;

/// Trait for Read + Write + Send, allowing different transport backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

// ============================================================================
// Acknowledgements
// ============================================================================

/// How an acknowledgement affects the command that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckClass {
    /// Command executed.
    Success,
    /// Device notice that does not abort the command.
    Info,
    /// The device refused or could not execute the command.
    Rejection,
}

/// Acknowledgement codes defined by the device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCode {
    /// 0x01: incorrect frame syntax.
    FrameNotAcknowledged,
    /// 0x02: communication timeout, less data than expected.
    CommunicationTimeout,
    /// 0x04: system boot ready.
    WakeUp,
    /// 0x11: valid TCP client-socket connection.
    TcpSocketValid,
    /// 0x81: command has not been executed.
    NotExecuted,
    /// 0x82: command could not be recognized.
    NotRecognized,
    /// 0x83: command executed.
    CommandAcknowledged,
    /// 0x84: system is operational and ready to receive data.
    SystemReady,
    /// 0x90
    OvercurrentDetected,
    /// 0x91
    OvervoltageDetected,
}

impl AckCode {
    pub fn to_byte(self) -> u8 {
        match self {
            AckCode::FrameNotAcknowledged => 0x01,
            AckCode::CommunicationTimeout => 0x02,
            AckCode::WakeUp => 0x04,
            AckCode::TcpSocketValid => 0x11,
            AckCode::NotExecuted => 0x81,
            AckCode::NotRecognized => 0x82,
            AckCode::CommandAcknowledged => 0x83,
            AckCode::SystemReady => 0x84,
            AckCode::OvercurrentDetected => 0x90,
            AckCode::OvervoltageDetected => 0x91,
        }
    }

    pub fn class(self) -> AckClass {
        match self {
            AckCode::FrameNotAcknowledged
            | AckCode::CommunicationTimeout
            | AckCode::NotExecuted
            | AckCode::NotRecognized => AckClass::Rejection,
            AckCode::CommandAcknowledged => AckClass::Success,
            AckCode::WakeUp
            | AckCode::TcpSocketValid
            | AckCode::SystemReady
            | AckCode::OvercurrentDetected
            | AckCode::OvervoltageDetected => AckClass::Info,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            AckCode::FrameNotAcknowledged => "frame not acknowledged: incorrect syntax",
            AckCode::CommunicationTimeout => "communication timeout: less data than expected",
            AckCode::WakeUp => "wake-up message: system boot ready",
            AckCode::TcpSocketValid => "valid TCP client-socket connection",
            AckCode::NotExecuted => "not acknowledged: command has not been executed",
            AckCode::NotRecognized => "not acknowledged: command could not be recognized",
            AckCode::CommandAcknowledged => "command acknowledged",
            AckCode::SystemReady => "system ready: operational and ready to receive data",
            AckCode::OvercurrentDetected => "overcurrent detected",
            AckCode::OvervoltageDetected => "overvoltage detected",
        }
    }
}

impl TryFrom<u8> for AckCode {
    type Error = DriverError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x01 => AckCode::FrameNotAcknowledged,
            0x02 => AckCode::CommunicationTimeout,
            0x04 => AckCode::WakeUp,
            0x11 => AckCode::TcpSocketValid,
            0x81 => AckCode::NotExecuted,
            0x82 => AckCode::NotRecognized,
            0x83 => AckCode::CommandAcknowledged,
            0x84 => AckCode::SystemReady,
            0x90 => AckCode::OvercurrentDetected,
            0x91 => AckCode::OvervoltageDetected,
            other => return Err(DriverError::UnknownAcknowledgement(other)),
        })
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X} ({})", self.to_byte(), self.description())
    }
}

/// True iff `bytes` has the fixed acknowledgement shape `[0x18, 0x01, *, 0x18]`.
pub fn is_acknowledgement(bytes: &[u8]) -> bool {
    matches!(bytes, [ACK_TAG, 0x01, _, ACK_TAG])
}

/// Log an acknowledgement at a level matching its class.
pub(crate) fn log_acknowledgement(command: u8, code: AckCode) {
    match code {
        AckCode::CommandAcknowledged => debug!("cmd {command:#04X}: {code}"),
        AckCode::OvercurrentDetected | AckCode::OvervoltageDetected => {
            warn!("cmd {command:#04X}: {code}")
        }
        _ => info!("cmd {command:#04X}: {code}"),
    }
}

// ============================================================================
// Frames
// ============================================================================

/// One transport-level unit, stored with its header and trailing tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Build a frame `[tag, len, payload..., tag]`.
    pub fn build(tag: u8, payload: &[u8]) -> Result<Self> {
        let len = u8::try_from(payload.len()).map_err(|_| {
            DriverError::Protocol(format!(
                "payload of {} bytes does not fit in one frame",
                payload.len()
            ))
        })?;
        let mut bytes = Vec::with_capacity(payload.len() + 3);
        bytes.push(tag);
        bytes.push(len);
        bytes.extend_from_slice(payload);
        bytes.push(tag);
        Ok(Self { bytes })
    }

    pub fn tag(&self) -> u8 {
        self.bytes[0]
    }

    /// Body bytes between the length byte and the trailing tag.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[2..self.bytes.len() - 1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn is_acknowledgement(&self) -> bool {
        is_acknowledgement(&self.bytes)
    }

    /// The acknowledgement code byte, if this is an acknowledgement frame.
    pub fn ack_byte(&self) -> Option<u8> {
        self.is_acknowledgement().then(|| self.bytes[2])
    }
}

/// Blocking exact read; a transport timeout is fatal for the in-flight call.
pub(crate) fn read_exact<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => {
            DriverError::Timeout(format!("waiting for {} bytes from device", buf.len()))
        }
        _ => DriverError::Io(e),
    })
}

/// Read one frame: 2 header bytes, then `length + 1` body bytes ending in the tag.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; 2];
    read_exact(reader, &mut header)?;
    let [tag, len] = header;

    let mut bytes = vec![0u8; len as usize + 3];
    bytes[..2].copy_from_slice(&header);
    read_exact(reader, &mut bytes[2..])?;

    let trailer = bytes[bytes.len() - 1];
    if trailer != tag {
        return Err(DriverError::MalformedFrame { tag, trailer });
    }
    debug!("rx {:02X?}", bytes);
    Ok(Frame { bytes })
}

// ============================================================================
// Request/response
// ============================================================================

/// Everything the device sent back for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Non-acknowledgement frames, in arrival order.
    pub frames: Vec<Frame>,
    /// The terminating acknowledgement (success or informational).
    pub ack: AckCode,
}

impl Response {
    /// Concatenation of all data frames, headers and trailing tags included.
    pub fn bytes(&self) -> Vec<u8> {
        self.frames
            .iter()
            .flat_map(|f| f.as_bytes().iter().copied())
            .collect()
    }

    /// Concatenation of the frame payloads only.
    pub fn payload(&self) -> Vec<u8> {
        self.frames
            .iter()
            .flat_map(|f| f.payload().iter().copied())
            .collect()
    }

    /// The first data frame; most queries answer with exactly one.
    pub fn first(&self) -> Result<&Frame> {
        self.frames
            .first()
            .ok_or_else(|| DriverError::Decode("device sent no data before acknowledging".into()))
    }
}

/// Write `command`, then collect frames until the acknowledgement arrives.
///
/// Rejection codes fail the call with [`DriverError::DeviceRejection`];
/// informational codes are logged and returned in [`Response::ack`].
pub fn send_and_receive<T: Read + Write + ?Sized>(
    transport: &mut T,
    command: &[u8],
) -> Result<Response> {
    let cmd = command.first().copied().unwrap_or_default();
    debug!("tx {:02X?}", command);
    transport.write_all(command).map_err(write_error)?;
    transport.flush().map_err(write_error)?;

    let mut frames = Vec::new();
    loop {
        let frame = read_frame(transport)?;
        let Some(code) = frame.ack_byte() else {
            frames.push(frame);
            continue;
        };

        let ack = AckCode::try_from(code)?;
        log_acknowledgement(cmd, ack);
        if ack.class() == AckClass::Rejection {
            return Err(DriverError::DeviceRejection {
                command: cmd,
                code: ack,
            });
        }
        return Ok(Response { frames, ack });
    }
}

fn write_error(e: io::Error) -> DriverError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            DriverError::Timeout("writing command to device".into())
        }
        _ => DriverError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ack, MockPort};
    use std::io::Cursor;

    #[test]
    fn read_frame_returns_header_and_body() {
        let raw = [0xB1, 0x03, 0x02, 0x01, 0x00, 0xB1, 0xEE];
        let mut cursor = Cursor::new(raw.to_vec());
        let frame = read_frame(&mut cursor).unwrap();
        assert_eq!(frame.as_bytes(), &raw[..6]);
        assert_eq!(frame.tag(), 0xB1);
        assert_eq!(frame.payload(), &[0x02, 0x01, 0x00]);
    }

    #[test]
    fn empty_body_frame() {
        let mut cursor = Cursor::new(vec![0xA1, 0x00, 0xA1]);
        let frame = read_frame(&mut cursor).unwrap();
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn mismatched_trailer_is_malformed() {
        let mut cursor = Cursor::new(vec![0xB1, 0x02, 0x01, 0x02, 0xB0]);
        match read_frame(&mut cursor) {
            Err(DriverError::MalformedFrame { tag, trailer }) => {
                assert_eq!(tag, 0xB1);
                assert_eq!(trailer, 0xB0);
            }
            other => panic!("expected malformed frame, got {other:?}"),
        }
    }

    #[test]
    fn truncated_body_times_out() {
        let mut cursor = Cursor::new(vec![0xB1, 0x05, 0x01]);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(DriverError::Timeout(_))
        ));
    }

    #[test]
    fn acknowledgement_shape() {
        assert!(is_acknowledgement(&[0x18, 0x01, 0x83, 0x18]));
        assert!(is_acknowledgement(&[0x18, 0x01, 0x00, 0x18]));
        assert!(!is_acknowledgement(&[0x19, 0x01, 0x83, 0x18]));
        assert!(!is_acknowledgement(&[0x18, 0x02, 0x83, 0x18]));
        assert!(!is_acknowledgement(&[0x18, 0x01, 0x83, 0x19]));
        assert!(!is_acknowledgement(&[0x18, 0x01, 0x83]));
        assert!(!is_acknowledgement(&[0x18, 0x01, 0x83, 0x18, 0x00]));
    }

    #[test]
    fn ack_catalog_round_trips_and_classifies() {
        for byte in [0x01, 0x02, 0x04, 0x11, 0x81, 0x82, 0x83, 0x84, 0x90, 0x91] {
            assert_eq!(AckCode::try_from(byte).unwrap().to_byte(), byte);
        }
        assert_eq!(AckCode::CommandAcknowledged.class(), AckClass::Success);
        assert_eq!(AckCode::NotRecognized.class(), AckClass::Rejection);
        assert_eq!(AckCode::OvervoltageDetected.class(), AckClass::Info);
        assert!(matches!(
            AckCode::try_from(0x55),
            Err(DriverError::UnknownAcknowledgement(0x55))
        ));
    }

    #[test]
    fn send_and_receive_collects_frames_until_ack() {
        let mut port = MockPort::new();
        port.queue(&[0xB3, 0x04, 1, 2, 3, 4, 0xB3]);
        port.queue(&[0xB3, 0x04, 5, 6, 7, 8, 0xB3]);
        port.queue(&ack(0x83));
        let written = port.written();

        let response = send_and_receive(&mut port, &[0xB3, 0x00, 0xB3]).unwrap();
        assert_eq!(response.ack, AckCode::CommandAcknowledged);
        assert_eq!(response.frames.len(), 2);
        assert_eq!(
            response.bytes(),
            vec![0xB3, 0x04, 1, 2, 3, 4, 0xB3, 0xB3, 0x04, 5, 6, 7, 8, 0xB3]
        );
        assert_eq!(response.payload(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(*written.lock().unwrap(), vec![0xB3, 0x00, 0xB3]);
    }

    #[test]
    fn rejection_fails_the_command() {
        let mut port = MockPort::new();
        port.queue(&ack(0x82));
        match send_and_receive(&mut port, &[0xA1, 0x00, 0xA1]) {
            Err(DriverError::DeviceRejection { command, code }) => {
                assert_eq!(command, 0xA1);
                assert_eq!(code, AckCode::NotRecognized);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn informational_ack_does_not_abort() {
        let mut port = MockPort::new();
        port.queue(&ack(0x84));
        let response = send_and_receive(&mut port, &[0x90, 0x00, 0x90]).unwrap();
        assert_eq!(response.ack, AckCode::SystemReady);
        assert!(response.frames.is_empty());
        assert!(response.first().is_err());
    }

    #[test]
    fn missing_ack_times_out() {
        let mut port = MockPort::new();
        port.queue(&[0xB1, 0x03, 0x02, 0x01, 0x00, 0xB1]);
        assert!(matches!(
            send_and_receive(&mut port, &[0xB1, 0x00, 0xB1]),
            Err(DriverError::Timeout(_))
        ));
    }

    #[test]
    fn build_wraps_payload_in_tags() {
        let frame = Frame::build(0xB2, &[1, 2, 3, 4]).unwrap();
        assert_eq!(frame.as_bytes(), &[0xB2, 0x04, 1, 2, 3, 4, 0xB2]);
        assert!(Frame::build(0xB2, &[0u8; 256]).is_err());
    }
}
