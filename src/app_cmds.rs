//! Fallback command handlers.
//!
//! Consulted only when no peripheral claimed a command: protocol version,
//! build id, keep-alive and the diag-id table query.

use crate::error::{Result, RouterError};
use crate::router::{ClientId, Router};
use crate::wire::{Reader, Writer};

const DIAG_CMD_DIAG_VERSION_NO: u32 = 0;
const DIAG_CMD_DIAG_VERSION_ID: u32 = 28;
const DIAG_CMD_EXTENDED_BUILD_ID: u32 = 124;
const DIAG_PROTOCOL_VERSION_NUMBER: u8 = 2;

const DIAG_CMD_KEEP_ALIVE_SUBSYS: u32 = 50;
const DIAG_CMD_KEEP_ALIVE_CMD: u32 = 3;

const DIAG_CMD_DIAG_SUBSYS: u32 = 18;
const DIAG_CMD_DIAG_GET_DIAG_ID: u32 = 0x222;

const MOBILE_MODEL_NUMBER: u32 = 0;
const MOBILE_SOFTWARE_REVISION: &str = "OE";
const MOBILE_MODEL_STRING: &str = "DB410C";
const MSM_REVISION_NUMBER: u32 = 2;

pub fn register(router: &mut Router) {
	router.register_fallback(DIAG_CMD_DIAG_VERSION_ID, handle_diag_version);
	router.register_fallback(DIAG_CMD_DIAG_VERSION_NO, handle_diag_version_no);
	router.register_fallback(DIAG_CMD_EXTENDED_BUILD_ID, handle_extended_build_id);
	router.register_fallback_subsys(
		DIAG_CMD_KEEP_ALIVE_SUBSYS,
		DIAG_CMD_KEEP_ALIVE_CMD,
		handle_keep_alive,
	);
	router.register_fallback_subsys(
		DIAG_CMD_DIAG_SUBSYS,
		DIAG_CMD_DIAG_GET_DIAG_ID,
		handle_diag_id_query,
	);
}

fn handle_diag_version(router: &mut Router, client: ClientId, _buf: &[u8]) -> Result<()> {
	router.dm_send(
		client,
		&[DIAG_CMD_DIAG_VERSION_ID as u8, DIAG_PROTOCOL_VERSION_NUMBER],
	);
	Ok(())
}

fn handle_diag_version_no(router: &mut Router, client: ClientId, _buf: &[u8]) -> Result<()> {
	router.dm_send(client, &[0u8; 55]);
	Ok(())
}

fn handle_extended_build_id(router: &mut Router, client: ClientId, buf: &[u8]) -> Result<()> {
	if buf.len() != 1 {
		return Err(RouterError::WrongSize);
	}

	let mut resp = Writer::new();
	resp.u8(DIAG_CMD_EXTENDED_BUILD_ID as u8)
		.u8(DIAG_PROTOCOL_VERSION_NUMBER)
		.u16_le(0)
		.u32_le(MSM_REVISION_NUMBER)
		.u32_le(MOBILE_MODEL_NUMBER)
		.cstr(MOBILE_SOFTWARE_REVISION)
		.cstr(MOBILE_MODEL_STRING);
	router.dm_send(client, &resp.into_vec());

	Ok(())
}

fn handle_keep_alive(router: &mut Router, client: ClientId, _buf: &[u8]) -> Result<()> {
	let mut resp = [0u8; 16];
	resp[0] = crate::router::DIAG_CMD_SUBSYS_DISPATCH;
	resp[1] = DIAG_CMD_KEEP_ALIVE_SUBSYS as u8;
	resp[2] = DIAG_CMD_KEEP_ALIVE_CMD as u8;
	router.dm_send(client, &resp);

	Ok(())
}

/// Dump the live per-process diag-id table, one `{id, len, name}` row per
/// entry.
fn handle_diag_id_query(router: &mut Router, client: ClientId, buf: &[u8]) -> Result<()> {
	if buf.len() < 5 {
		return Err(RouterError::WrongSize);
	}
	let mut r = Reader::new(buf);
	let header = r.take(4)?;
	let version = r.u8()?;

	let mut resp = Writer::new();
	resp.bytes(header)
		.u8(version)
		.u8(router.diag_ids.len() as u8);
	for entry in &router.diag_ids {
		resp.u8(entry.id)
			.u8(entry.process_name.len() as u8 + 1)
			.cstr(&entry.process_name);
	}

	let resp = resp.into_vec();
	router.dm_send(client, &resp);

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hdlc;
	use crate::router::test_support::{pipe_client, queued_frames};
	use crate::router::DiagIdEntry;

	fn router_with_client(hdlc_encoded: bool) -> (Router, ClientId) {
		let mut router = Router::new().unwrap();
		router.register_app_cmds();
		let client = pipe_client(&mut router, hdlc_encoded);
		router.enable_client(client);
		(router, client)
	}

	#[test]
	fn keep_alive_scenario() {
		let (mut router, client) = router_with_client(true);

		router.handle_command(client, &[0x4b, 0x32, 0x03, 0x00]);

		let expected = hdlc::encode(&[
			0x4b, 0x32, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
			0x00, 0x00,
		]);
		assert_eq!(queued_frames(&mut router, client), vec![expected]);
	}

	#[test]
	fn diag_version_scenario() {
		let (mut router, client) = router_with_client(true);

		router.handle_command(client, &[0x1c]);

		assert_eq!(
			queued_frames(&mut router, client),
			vec![hdlc::encode(&[0x1c, 0x02])]
		);
	}

	#[test]
	fn extended_build_id_layout() {
		let (mut router, client) = router_with_client(false);

		router.handle_command(client, &[0x7c]);

		let frames = queued_frames(&mut router, client);
		let resp = &frames[0];
		assert_eq!(resp[0], 0x7c);
		assert_eq!(resp[1], 0x02);
		assert_eq!(&resp[4..8], &2u32.to_le_bytes());
		assert_eq!(&resp[8..12], &0u32.to_le_bytes());
		assert_eq!(&resp[12..], b"OE\0DB410C\0");
	}

	#[test]
	fn extended_build_id_rejects_long_requests() {
		let (mut router, client) = router_with_client(false);

		router.handle_command(client, &[0x7c, 0x00]);

		let frames = queued_frames(&mut router, client);
		assert_eq!(frames[0][0], 0x15);
	}

	#[test]
	fn diag_id_query_lists_table() {
		let (mut router, client) = router_with_client(false);
		router.diag_ids.push(DiagIdEntry {
			id: 1,
			process_name: "apps".to_owned(),
		});
		router.diag_ids.push(DiagIdEntry {
			id: 2,
			process_name: "wlan_pd".to_owned(),
		});

		router.handle_command(client, &[0x4b, 0x12, 0x22, 0x02, 0x01]);

		let frames = queued_frames(&mut router, client);
		let mut r = Reader::new(&frames[0]);
		assert_eq!(r.take(4).unwrap(), &[0x4b, 0x12, 0x22, 0x02]);
		assert_eq!(r.u8().unwrap(), 1); // version echo
		assert_eq!(r.u8().unwrap(), 2); // entries
		assert_eq!(r.u8().unwrap(), 1);
		assert_eq!(r.u8().unwrap(), 5);
		assert_eq!(r.take(5).unwrap(), b"apps\0");
		assert_eq!(r.u8().unwrap(), 2);
		assert_eq!(r.u8().unwrap(), 8);
		assert_eq!(r.take(8).unwrap(), b"wlan_pd\0");
	}

	#[test]
	fn version_no_returns_55_zeros() {
		let (mut router, client) = router_with_client(false);

		router.handle_command(client, &[0x00]);

		let frames = queued_frames(&mut router, client);
		assert_eq!(frames[0], vec![0u8; 55]);
	}
}
