//! Scripted serial port for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::codec::encode_single;
use crate::frame::ACK_TAG;

/// Device side is a queue of bytes; host writes are captured for inspection.
/// Reading past the queue behaves like a serial read timeout.
pub struct MockPort {
    input: VecDeque<u8>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    /// Queue `n` command acknowledgements.
    pub fn queue_acks(&mut self, n: usize) {
        for _ in 0..n {
            self.queue(&ack(0x83));
        }
    }

    /// Handle on everything the host has written, usable after the port is moved.
    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.written)
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock port drained"));
        }
        let n = buf.len().min(self.input.len());
        for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn ack(code: u8) -> [u8; 4] {
    [ACK_TAG, 0x01, code, ACK_TAG]
}

/// Build a device frame `[tag, len, payload..., tag]`.
pub fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![tag, payload.len() as u8];
    bytes.extend_from_slice(payload);
    bytes.push(tag);
    bytes
}

/// Result frame with current-range reporting on and timestamps off.
pub fn result_frame(index: u16, range: u8, real: f32, imag: f32) -> Vec<u8> {
    let mut payload = index.to_be_bytes().to_vec();
    payload.push(range);
    payload.extend_from_slice(&encode_single(real));
    payload.extend_from_slice(&encode_single(imag));
    frame(0xB8, &payload)
}

/// Split captured host bytes back into frames.
pub fn split_frames(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + 1 < bytes.len() {
        let end = pos + bytes[pos + 1] as usize + 3;
        frames.push(bytes[pos..end].to_vec());
        pos = end;
    }
    frames
}
