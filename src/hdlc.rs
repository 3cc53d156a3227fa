//! HDLC framing as used on the DIAG wire.
//!
//! Frames are terminated by `0x7e`, escape `0x7d` and `0x7e` in the body as
//! `0x7d, byte ^ 0x20`, and carry a little-endian CRC-16/CCITT trailer
//! computed over the payload before escaping.

use crc::{CRC_16_IBM_SDLC, Crc};

pub const CONTROL_CHAR: u8 = 0x7e;
pub const ESCAPE_CHAR: u8 = 0x7d;
pub const ESCAPE_MASK: u8 = 0x20;

/// Poly 0x8408 (reflected), init 0xffff, output complemented. The checksum
/// equals the trailer the peers put on the wire.
pub const CRC_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Decoded frames above this size are dropped; the protocol maximum response
/// is 16 KiB, so anything near this limit is stream corruption.
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// HDLC-encode `payload`: append the CRC trailer, escape, terminate.
pub fn encode(payload: &[u8]) -> Vec<u8> {
	let crc = CRC_CCITT.checksum(payload).to_le_bytes();
	let mut out = Vec::with_capacity(2 * (payload.len() + 2) + 1);

	for &b in payload.iter().chain(crc.iter()) {
		if b == CONTROL_CHAR || b == ESCAPE_CHAR {
			out.push(ESCAPE_CHAR);
			out.push(b ^ ESCAPE_MASK);
		} else {
			out.push(b);
		}
	}
	out.push(CONTROL_CHAR);

	out
}

/// Streaming decoder, stateful across reads so frames may arrive in
/// arbitrary fragments.
#[derive(Default)]
pub struct Decoder {
	pending_escape: bool,
	frame: Vec<u8>,
	overrun: bool,
}

impl Decoder {
	pub fn new() -> Self {
		Decoder::default()
	}

	/// Feed `input` and collect every frame completed by it, CRC trailer
	/// stripped. Terminated frames shorter than the trailer (including the
	/// empty idle marker) are discarded.
	pub fn decode(&mut self, input: &[u8]) -> Vec<Vec<u8>> {
		let mut frames = Vec::new();

		for &b in input {
			if self.pending_escape {
				self.push_byte(b ^ ESCAPE_MASK);
				self.pending_escape = false;
			} else if b == ESCAPE_CHAR {
				self.pending_escape = true;
			} else if b == CONTROL_CHAR {
				if let Some(frame) = self.finish_frame() {
					frames.push(frame);
				}
			} else {
				self.push_byte(b);
			}
		}

		frames
	}

	fn push_byte(&mut self, b: u8) {
		if self.frame.len() >= MAX_FRAME_SIZE {
			if !self.overrun {
				warn!("hdlc frame exceeds {} bytes, dropping", MAX_FRAME_SIZE);
			}
			self.overrun = true;
			return;
		}
		self.frame.push(b);
	}

	fn finish_frame(&mut self) -> Option<Vec<u8>> {
		let mut frame = std::mem::take(&mut self.frame);
		let overrun = std::mem::take(&mut self.overrun);
		self.pending_escape = false;

		if overrun || frame.len() < 2 {
			return None;
		}

		let trailer = [frame[frame.len() - 2], frame[frame.len() - 1]];
		frame.truncate(frame.len() - 2);

		let expected = CRC_CCITT.checksum(&frame).to_le_bytes();
		if trailer != expected {
			debug!(
				"hdlc crc mismatch: got {:02x}{:02x}, expected {:02x}{:02x}",
				trailer[0], trailer[1], expected[0], expected[1]
			);
		}

		Some(frame)
	}
}
