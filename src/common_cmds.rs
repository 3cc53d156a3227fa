//! Locally handled configuration commands.
//!
//! These outrank any peripheral registration: logging configuration,
//! extended message configuration and the event mask commands. Every mask
//! mutation is pushed to the peripherals over their control channels.

use crate::error::{Result, RouterError};
use crate::masks::bits_to_bytes;
use crate::router::{ClientId, Router};
use crate::wire::{Reader, Writer};

const DIAG_CMD_LOGGING_CONFIGURATION: u32 = 0x73;
const DIAG_CMD_OP_LOG_DISABLE: u32 = 0;
const DIAG_CMD_OP_GET_LOG_RANGE: u32 = 1;
const DIAG_CMD_OP_SET_LOG_MASK: u32 = 3;
const DIAG_CMD_OP_GET_LOG_MASK: u32 = 4;

const DIAG_CMD_EXTENDED_MESSAGE_CONFIGURATION: u32 = 0x7d;
const DIAG_CMD_OP_GET_SSID_RANGE: u32 = 1;
const DIAG_CMD_OP_GET_BUILD_MASK: u32 = 2;
const DIAG_CMD_OP_GET_MSG_MASK: u32 = 3;
const DIAG_CMD_OP_SET_MSG_MASK: u32 = 4;
const DIAG_CMD_OP_SET_ALL_MSG_MASK: u32 = 5;

const DIAG_CMD_GET_MASK: u32 = 0x81;
const DIAG_CMD_SET_MASK: u32 = 0x82;
const DIAG_CMD_EVENT_REPORT_CONTROL: u32 = 0x60;

const DIAG_CMD_STATUS_SUCCESS: u32 = 0;
const DIAG_CMD_STATUS_INVALID_EQUIPMENT_ID: u32 = 1;

const DIAG_CMD_MSG_STATUS_UNSUCCESSFUL: u8 = 0;
const DIAG_CMD_MSG_STATUS_SUCCESSFUL: u8 = 1;

const DIAG_CMD_EVENT_ERROR_CODE_OK: u8 = 0;
const DIAG_CMD_EVENT_ERROR_CODE_FAIL: u8 = 1;

pub fn register(router: &mut Router) {
	router.register_common(DIAG_CMD_LOGGING_CONFIGURATION, handle_logging_configuration);
	router.register_common(
		DIAG_CMD_EXTENDED_MESSAGE_CONFIGURATION,
		handle_extended_message_configuration,
	);
	router.register_common(DIAG_CMD_GET_MASK, handle_event_get_mask);
	router.register_common(DIAG_CMD_SET_MASK, handle_event_set_mask);
	router.register_common(DIAG_CMD_EVENT_REPORT_CONTROL, handle_event_report_control);
}

/// `{cmd_code, reserved[3], operation:u32}` header shared by all logging
/// configuration requests, echoed back verbatim in responses.
fn log_cmd_header(buf: &[u8]) -> Result<(u32, &[u8])> {
	if buf.len() < 8 {
		return Err(RouterError::WrongSize);
	}
	let mut r = Reader::new(buf);
	r.skip(4)?;
	let operation = r.u32_le()?;
	Ok((operation, &buf[..8]))
}

fn handle_logging_configuration(
	router: &mut Router,
	client: ClientId,
	buf: &[u8],
) -> Result<()> {
	let (operation, header) = log_cmd_header(buf)?;

	match operation {
		DIAG_CMD_OP_LOG_DISABLE => {
			if buf.len() != 8 {
				return Err(RouterError::WrongSize);
			}

			router.masks.disable_log();
			router.broadcast_log_mask(0);

			let mut resp = Writer::new();
			resp.bytes(header).u32_le(DIAG_CMD_STATUS_SUCCESS);
			router.dm_send(client, &resp.into_vec());
		}
		DIAG_CMD_OP_GET_LOG_RANGE => {
			if buf.len() != 8 {
				return Err(RouterError::WrongSize);
			}

			let mut resp = Writer::new();
			resp.bytes(header).u32_le(DIAG_CMD_STATUS_SUCCESS);
			for range in router.masks.log_range() {
				resp.u32_le(range);
			}
			router.dm_send(client, &resp.into_vec());
		}
		DIAG_CMD_OP_SET_LOG_MASK => {
			let mut r = Reader::new(&buf[8..]);
			let equip_id = r.u32_le()?;
			let num_items = r.u32_le()?;
			let mask = r.rest();
			if mask.len() != bits_to_bytes(num_items) {
				return Err(RouterError::WrongSize);
			}

			let (num_items, mask_size) = router
				.masks
				.set_log_mask(equip_id, num_items, mask)
				.ok_or(RouterError::BadParams)?;
			router.broadcast_log_mask(equip_id);

			let mut resp = Writer::new();
			resp.bytes(header)
				.u32_le(DIAG_CMD_STATUS_SUCCESS)
				.u32_le(equip_id)
				.u32_le(num_items)
				.bytes(&mask[..mask_size.min(mask.len())]);
			router.dm_send(client, &resp.into_vec());
		}
		DIAG_CMD_OP_GET_LOG_MASK => {
			if buf.len() != 12 {
				return Err(RouterError::WrongSize);
			}
			let mut r = Reader::new(&buf[8..]);
			let equip_id = r.u32_le()?;

			let mut resp = Writer::new();
			resp.bytes(header);
			match router.masks.get_log_mask(equip_id) {
				Some((num_items, mask)) => {
					resp.u32_le(DIAG_CMD_STATUS_SUCCESS)
						.u32_le(equip_id)
						.u32_le(num_items)
						.bytes(&mask);
				}
				None => {
					resp.u32_le(DIAG_CMD_STATUS_INVALID_EQUIPMENT_ID)
						.u32_le(equip_id)
						.u32_le(0);
				}
			}
			router.broadcast_log_mask(equip_id);
			router.dm_send(client, &resp.into_vec());
		}
		other => {
			warn!("unrecognized logging operation {}", other);
			return Err(RouterError::BadParams);
		}
	}

	Ok(())
}

fn handle_extended_message_configuration(
	router: &mut Router,
	client: ClientId,
	buf: &[u8],
) -> Result<()> {
	if buf.len() < 2 {
		return Err(RouterError::WrongSize);
	}
	let operation = u32::from(buf[1]);
	let header = &buf[..2];

	match operation {
		DIAG_CMD_OP_GET_SSID_RANGE => {
			if buf.len() != 2 {
				return Err(RouterError::WrongSize);
			}

			let ranges = router.masks.ssid_ranges();
			let mut resp = Writer::new();
			resp.bytes(header)
				.u8(DIAG_CMD_MSG_STATUS_SUCCESSFUL)
				.u8(0) // reserved
				.u32_le(ranges.len() as u32);
			for (first, last) in ranges {
				resp.u16_le(first).u16_le(last);
			}
			router.dm_send(client, &resp.into_vec());
		}
		DIAG_CMD_OP_GET_BUILD_MASK => {
			if buf.len() != 6 {
				return Err(RouterError::WrongSize);
			}
			let mut r = Reader::new(&buf[2..]);
			let first = u32::from(r.u16_le()?);
			let last = u32::from(r.u16_le()?);

			let mut resp = Writer::new();
			resp.bytes(header);
			match router.masks.get_build_mask(first, last) {
				Some(((first, last), mask)) => {
					resp.u16_le(first as u16)
						.u16_le(last as u16)
						.u8(DIAG_CMD_MSG_STATUS_SUCCESSFUL)
						.u8(0);
					for flag in mask {
						resp.u32_le(flag);
					}
				}
				None => {
					resp.u16_le(first as u16)
						.u16_le(last as u16)
						.u8(DIAG_CMD_MSG_STATUS_UNSUCCESSFUL)
						.u8(0);
				}
			}
			router.dm_send(client, &resp.into_vec());
		}
		DIAG_CMD_OP_GET_MSG_MASK => {
			if buf.len() != 6 {
				return Err(RouterError::WrongSize);
			}
			let mut r = Reader::new(&buf[2..]);
			let first = u32::from(r.u16_le()?);
			let _last = r.u16_le()?;

			let mut resp = Writer::new();
			resp.bytes(header);
			match router.masks.get_msg_mask(first) {
				Some(((first, last), mask)) => {
					let num = (last - first + 1) as usize;
					resp.u8(DIAG_CMD_MSG_STATUS_SUCCESSFUL).u8(0);
					for flag in &mask[..num.min(mask.len())] {
						resp.u32_le(*flag);
					}
				}
				None => {
					resp.u8(DIAG_CMD_MSG_STATUS_UNSUCCESSFUL).u8(0);
				}
			}
			router.dm_send(client, &resp.into_vec());
		}
		DIAG_CMD_OP_SET_MSG_MASK => {
			let mut r = Reader::new(&buf[2..]);
			let first = u32::from(r.u16_le()?);
			let last = u32::from(r.u16_le()?);
			let rsvd = r.u16_le()?;

			let num = (last.saturating_sub(first) + 1) as usize;
			let flag_bytes = r.rest();
			if flag_bytes.len() != num * 4 {
				return Err(RouterError::WrongSize);
			}
			let flags: Vec<u32> = flag_bytes
				.chunks_exact(4)
				.map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
				.collect();

			let mut resp = Writer::new();
			resp.bytes(header).u16_le(first as u16).u16_le(last as u16);
			if router.masks.set_msg_mask(first, last, &flags) {
				resp.u8(DIAG_CMD_MSG_STATUS_SUCCESSFUL).u8(rsvd as u8);
				for flag in &flags {
					resp.u32_le(*flag);
				}
				router.broadcast_msg_mask(Some((first, last)));
			} else {
				resp.u8(DIAG_CMD_MSG_STATUS_UNSUCCESSFUL).u8(rsvd as u8);
			}
			router.dm_send(client, &resp.into_vec());
		}
		DIAG_CMD_OP_SET_ALL_MSG_MASK => {
			if buf.len() != 7 {
				return Err(RouterError::WrongSize);
			}
			let mut r = Reader::new(&buf[2..]);
			let rsvd = r.u8()?;
			let mask = r.u32_le()?;

			router.masks.set_all_msg_mask(mask);
			router.broadcast_msg_mask(None);

			let mut resp = Writer::new();
			resp.bytes(header)
				.u8(DIAG_CMD_MSG_STATUS_SUCCESSFUL)
				.u8(rsvd)
				.u32_le(mask);
			router.dm_send(client, &resp.into_vec());
		}
		other => {
			warn!("unknown extended message configuration {}", other);
			return Err(RouterError::BadParams);
		}
	}

	Ok(())
}

fn handle_event_get_mask(router: &mut Router, client: ClientId, buf: &[u8]) -> Result<()> {
	if buf.len() != 4 {
		return Err(RouterError::WrongSize);
	}
	let mut r = Reader::new(buf);
	let cmd_code = r.u8()?;
	let _pad = r.u8()?;
	let reserved = r.u16_le()?;

	let num_bits = router.masks.event_max_bits();
	let mut resp = Writer::new();
	resp.u8(cmd_code);
	match router.masks.get_event_mask(num_bits) {
		Some(mask) => {
			resp.u8(DIAG_CMD_EVENT_ERROR_CODE_OK)
				.u16_le(reserved)
				.u16_le(num_bits)
				.bytes(&mask);
		}
		None => {
			resp.u8(DIAG_CMD_EVENT_ERROR_CODE_FAIL)
				.u16_le(reserved)
				.u16_le(0);
		}
	}
	router.dm_send(client, &resp.into_vec());

	Ok(())
}

fn handle_event_set_mask(router: &mut Router, client: ClientId, buf: &[u8]) -> Result<()> {
	let mut r = Reader::new(buf);
	let cmd_code = r.u8()?;
	let _pad = r.u8()?;
	let reserved = r.u16_le()?;
	let num_bits = r.u16_le()?;
	let mask = r.rest();
	if mask.len() != bits_to_bytes(num_bits.into()) {
		return Err(RouterError::WrongSize);
	}

	router.masks.update_event_mask(num_bits, mask);
	router.broadcast_event_mask();

	let mut resp = Writer::new();
	resp.u8(cmd_code)
		.u8(DIAG_CMD_EVENT_ERROR_CODE_OK)
		.u16_le(reserved)
		.u16_le(num_bits)
		.bytes(mask);
	router.dm_send(client, &resp.into_vec());

	Ok(())
}

fn handle_event_report_control(
	router: &mut Router,
	client: ClientId,
	buf: &[u8],
) -> Result<()> {
	if buf.len() != 2 {
		return Err(RouterError::WrongSize);
	}
	let operation = buf[1];

	router.masks.toggle_events(operation != 0);
	router.broadcast_event_mask();

	let mut resp = Writer::new();
	resp.u8(DIAG_CMD_EVENT_REPORT_CONTROL as u8).u16_le(0);
	router.dm_send(client, &resp.into_vec());

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::masks::MaskStatus;
	use crate::router::test_support::{pipe_client, queued_frames};

	fn router_with_client() -> (Router, ClientId) {
		let mut router = Router::new().unwrap();
		router.register_common_cmds();
		let client = pipe_client(&mut router, false);
		router.enable_client(client);
		(router, client)
	}

	#[test]
	fn log_range_query_reports_sixteen_ranges() {
		let (mut router, client) = router_with_client();

		let req = [0x73, 0, 0, 0, 0x01, 0, 0, 0];
		router.handle_command(client, &req);

		let frames = queued_frames(&mut router, client);
		assert_eq!(frames.len(), 1);
		let resp = &frames[0];
		assert_eq!(resp.len(), 8 + 4 + 16 * 4);
		assert_eq!(&resp[..8], &req);
		let mut r = Reader::new(&resp[8..]);
		assert_eq!(r.u32_le().unwrap(), DIAG_CMD_STATUS_SUCCESS);
		assert_eq!(r.u32_le().unwrap(), 0); // equip 0
		assert_eq!(r.u32_le().unwrap(), 0xa02); // equip 1
	}

	#[test]
	fn log_disable_resets_status() {
		let (mut router, client) = router_with_client();

		router.handle_command(client, &[0x73, 0, 0, 0, 0, 0, 0, 0]);

		assert_eq!(router.masks.log_status(), MaskStatus::AllDisabled);
		let frames = queued_frames(&mut router, client);
		assert_eq!(frames[0].len(), 12);
	}

	#[test]
	fn set_log_mask_round_trips() {
		let (mut router, client) = router_with_client();

		let mut req = Writer::new();
		req.u8(0x73).zeros(3).u32_le(DIAG_CMD_OP_SET_LOG_MASK);
		req.u32_le(1).u32_le(16).bytes(&[0xde, 0xad]);
		router.handle_command(client, &req.into_vec());

		let frames = queued_frames(&mut router, client);
		let mut r = Reader::new(&frames[0][8..]);
		assert_eq!(r.u32_le().unwrap(), DIAG_CMD_STATUS_SUCCESS);
		assert_eq!(r.u32_le().unwrap(), 1);
		assert_eq!(r.u32_le().unwrap(), 16);
		assert_eq!(r.rest(), &[0xde, 0xad]);

		// and the mask can be read back
		let mut req = Writer::new();
		req.u8(0x73).zeros(3).u32_le(DIAG_CMD_OP_GET_LOG_MASK).u32_le(1);
		router.handle_command(client, &req.into_vec());
		let frames = queued_frames(&mut router, client);
		let mut r = Reader::new(&frames[0][8..]);
		assert_eq!(r.u32_le().unwrap(), DIAG_CMD_STATUS_SUCCESS);
		assert_eq!(r.u32_le().unwrap(), 1);
		assert_eq!(r.u32_le().unwrap(), 16);
		assert_eq!(r.rest(), &[0xde, 0xad]);
	}

	#[test]
	fn get_log_mask_unknown_equipment() {
		let (mut router, client) = router_with_client();

		let mut req = Writer::new();
		req.u8(0x73).zeros(3).u32_le(DIAG_CMD_OP_GET_LOG_MASK).u32_le(20);
		router.handle_command(client, &req.into_vec());

		let frames = queued_frames(&mut router, client);
		let mut r = Reader::new(&frames[0][8..]);
		assert_eq!(r.u32_le().unwrap(), DIAG_CMD_STATUS_INVALID_EQUIPMENT_ID);
	}

	#[test]
	fn wrong_length_yields_bad_length_response() {
		let (mut router, client) = router_with_client();

		// get-log-range with a trailing byte
		router.handle_command(client, &[0x73, 0, 0, 0, 0x01, 0, 0, 0, 0xff]);

		let frames = queued_frames(&mut router, client);
		assert_eq!(frames[0][0], 0x15);
		assert_eq!(&frames[0][1..], &[0x73, 0, 0, 0, 0x01, 0, 0, 0, 0xff]);
	}

	#[test]
	fn ssid_range_query_lists_all_ranges() {
		let (mut router, client) = router_with_client();

		router.handle_command(client, &[0x7d, 0x01]);

		let frames = queued_frames(&mut router, client);
		let resp = &frames[0];
		assert_eq!(resp.len(), 8 + 25 * 4);
		let mut r = Reader::new(&resp[2..]);
		assert_eq!(r.u8().unwrap(), DIAG_CMD_MSG_STATUS_SUCCESSFUL);
		r.skip(1).unwrap();
		assert_eq!(r.u32_le().unwrap(), 25);
		assert_eq!(r.u16_le().unwrap(), 0);
		assert_eq!(r.u16_le().unwrap(), 120);
	}

	#[test]
	fn set_msg_mask_broadcast_and_echo() {
		let (mut router, client) = router_with_client();

		let mut req = Writer::new();
		req.u8(0x7d).u8(DIAG_CMD_OP_SET_MSG_MASK as u8);
		req.u16_le(0).u16_le(3).u16_le(0);
		for flag in [1u32, 2, 3, 4] {
			req.u32_le(flag);
		}
		router.handle_command(client, &req.into_vec());

		assert_eq!(router.masks.msg_status(), MaskStatus::Valid);
		let frames = queued_frames(&mut router, client);
		let resp = &frames[0];
		let mut r = Reader::new(&resp[2..]);
		assert_eq!(r.u16_le().unwrap(), 0);
		assert_eq!(r.u16_le().unwrap(), 3);
		assert_eq!(r.u8().unwrap(), DIAG_CMD_MSG_STATUS_SUCCESSFUL);
		r.skip(1).unwrap();
		assert_eq!(r.u32_le().unwrap(), 1);
	}

	#[test]
	fn set_all_msg_mask_toggles_status() {
		let (mut router, client) = router_with_client();

		let mut req = Writer::new();
		req.u8(0x7d).u8(DIAG_CMD_OP_SET_ALL_MSG_MASK as u8).u8(0).u32_le(0);
		router.handle_command(client, &req.into_vec());
		assert_eq!(router.masks.msg_status(), MaskStatus::AllDisabled);

		let mut req = Writer::new();
		req.u8(0x7d)
			.u8(DIAG_CMD_OP_SET_ALL_MSG_MASK as u8)
			.u8(0)
			.u32_le(0xffff_ffff);
		router.handle_command(client, &req.into_vec());
		assert_eq!(router.masks.msg_status(), MaskStatus::AllEnabled);
	}

	#[test]
	fn event_report_control_toggles_and_acks() {
		let (mut router, client) = router_with_client();

		router.handle_command(client, &[0x60, 0x01]);
		assert_eq!(router.masks.event_status(), MaskStatus::AllEnabled);

		let frames = queued_frames(&mut router, client);
		assert_eq!(frames[0], vec![0x60, 0, 0]);
	}

	#[test]
	fn event_set_then_get_mask() {
		let (mut router, client) = router_with_client();

		let mask = vec![0x0f; 64];
		let mut req = Writer::new();
		req.u8(0x82).u8(0).u16_le(0).u16_le(512).bytes(&mask);
		router.handle_command(client, &req.into_vec());
		assert_eq!(router.masks.event_status(), MaskStatus::Valid);
		let _ = queued_frames(&mut router, client);

		router.handle_command(client, &[0x81, 0, 0, 0]);
		let frames = queued_frames(&mut router, client);
		let resp = &frames[0];
		let mut r = Reader::new(resp);
		assert_eq!(r.u8().unwrap(), 0x81);
		assert_eq!(r.u8().unwrap(), DIAG_CMD_EVENT_ERROR_CODE_OK);
		r.skip(2).unwrap();
		assert_eq!(r.u16_le().unwrap(), 512);
		assert_eq!(r.rest(), &mask[..]);
	}
}
