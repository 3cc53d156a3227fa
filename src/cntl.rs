//! Per-peripheral control protocol.
//!
//! The CNTL channel carries a stream of `{cmd:u32, len:u32}` TLVs. Inbound
//! packets register command ranges, negotiate the feature mask and assign
//! per-process diag ids; outbound packets push the current filter masks and
//! the diag mode to the peripheral.

use num_enum::TryFromPrimitive;

use crate::masks::{MaskStatus, SSID_FIRST, SSID_LAST};
use crate::peripheral::{Feature, LinkOps};
use crate::router::{DiagIdEntry, PerifId, Router};
use crate::wire::{Reader, Writer};

#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u32)]
enum CntlCmd {
	Register = 1,
	DiagMode = 3,
	FeatureMask = 8,
	LogMask = 9,
	EventMask = 10,
	MsgMask = 11,
	NumPresets = 12,
	BufferingTxMode = 17,
	Deregister = 27,
	DiagId = 33,
}

const DIAG_BUFFERING_MODE_STREAMING: u8 = 0;

/// Parse one control datagram. A truncated TLV aborts the rest of this
/// buffer, not the stream.
pub fn recv(router: &mut Router, id: PerifId, buf: &[u8]) {
	let mut offset = 0;

	while offset + 8 <= buf.len() {
		let mut r = Reader::new(&buf[offset..]);
		let cmd = r.u32_le().unwrap_or(0);
		let len = r.u32_le().unwrap_or(0) as usize;

		let Ok(body) = r.take(len) else {
			warn!("truncated diag cntl command");
			break;
		};

		match CntlCmd::try_from(cmd) {
			Ok(CntlCmd::Register) => handle_register(router, id, body),
			Ok(CntlCmd::FeatureMask) => handle_feature_mask(router, id, body),
			Ok(CntlCmd::Deregister) => handle_deregister(router, id, body),
			Ok(CntlCmd::DiagId) => handle_diag_id(router, id, body),
			Ok(CntlCmd::NumPresets) => {}
			_ => {
				let name = perif_name(router, id);
				warn!("[{}] unsupported control packet: {} ({} bytes)", name, cmd, len);
			}
		}

		offset += 8 + len;
	}
}

fn perif_name(router: &Router, id: PerifId) -> String {
	router
		.peripherals
		.get(&id)
		.map_or_else(|| "?".to_owned(), |p| p.name.clone())
}

/// Registration key prefix: `0xff` with a real subsystem id stands for the
/// subsystem-dispatch command byte.
fn range_keys(cmd: u16, subsys: u16, first: u16, last: u16) -> (u32, u32) {
	let mut cmd = u32::from(cmd);
	let subsys = u32::from(subsys);

	if cmd == 0xff && subsys != 0xff {
		cmd = u32::from(crate::router::DIAG_CMD_SUBSYS_DISPATCH);
	}

	(
		cmd << 24 | subsys << 16 | u32::from(first),
		cmd << 24 | subsys << 16 | u32::from(last),
	)
}

fn handle_register(router: &mut Router, id: PerifId, body: &[u8]) {
	let mut r = Reader::new(body);
	let parsed: crate::error::Result<()> = (|| {
		let _version = r.u32_le()?;
		let cmd = r.u16_le()?;
		let subsys = r.u16_le()?;
		let count = r.u16_le()?;
		let _port = r.u16_le()?;

		for _ in 0..count {
			let first = r.u16_le()?;
			let last = r.u16_le()?;
			let _data = r.u32_le()?;

			let (first, last) = range_keys(cmd, subsys, first, last);
			router.register_peripheral_cmd(first, last, id);
		}
		Ok(())
	})();

	if parsed.is_err() {
		warn!("[{}] short register packet", perif_name(router, id));
	}
}

fn handle_deregister(router: &mut Router, id: PerifId, body: &[u8]) {
	let mut r = Reader::new(body);
	let parsed: crate::error::Result<()> = (|| {
		let _version = r.u32_le()?;
		let cmd = r.u16_le()?;
		let subsys = r.u16_le()?;
		let count = r.u16_le()?;

		for _ in 0..count {
			let first = r.u16_le()?;
			let last = r.u16_le()?;

			let (first, last) = range_keys(cmd, subsys, first, last);
			router.deregister_peripheral_cmd(first, last, id);
		}
		Ok(())
	})();

	if parsed.is_err() {
		warn!("[{}] short deregister packet", perif_name(router, id));
	}
}

fn handle_feature_mask(router: &mut Router, id: PerifId, body: &[u8]) {
	let mut r = Reader::new(body);
	let Ok(mask_len) = r.u32_le() else {
		warn!("[{}] short feature mask packet", perif_name(router, id));
		return;
	};
	let mut word = [0u8; 4];
	let take = (mask_len as usize).min(4).min(r.remaining());
	if let Ok(bytes) = r.take(take) {
		word[..take].copy_from_slice(bytes);
	}
	let mask = Feature::from_bits_truncate(u32::from_le_bytes(word));

	let (name, local) = {
		let Some(perif) = router.peripherals.get(&id) else {
			return;
		};
		let mut local = Feature::FEATURE_MASK_SUPPORT
			| Feature::MASTER_SETS_COMMON_MASK
			| Feature::APPS_HDLC_ENCODE
			| Feature::DIAG_ID;
		if perif.cmd_fd.is_some() {
			local |= Feature::REQ_RSP_SUPPORT;
		}
		if perif.link.uses_sockets() {
			local |= Feature::SOCKETS_ENABLED;
		}
		(perif.name.clone(), local)
	};

	let names: Vec<&str> = mask.iter_names().map(|(name, _)| name).collect();
	info!("[{}] mask: {} ({:#x})", name, names.join(" "), mask.bits());

	let negotiated = mask & local;
	if let Some(perif) = router.peripherals.get_mut(&id) {
		perif.features = negotiated;
	}

	send_feature_mask(router, id, negotiated);
	send_log_masks(router, id);
	send_msg_masks(router, id);
	send_event_mask(router, id);
	set_diag_mode(router, id, true);
	set_buffering_mode(router, id, DIAG_BUFFERING_MODE_STREAMING);
}

fn handle_diag_id(router: &mut Router, id: PerifId, body: &[u8]) {
	let mut r = Reader::new(body);
	let Ok(version) = r.u32_le() else {
		warn!("[{}] short diag id packet", perif_name(router, id));
		return;
	};

	let (requested, process_name) = if version >= 2 {
		let Ok(requested) = r.u8() else {
			return;
		};
		let feature_len = r.u8().unwrap_or(0);
		let _ = r.take(usize::from(feature_len).min(r.remaining()));
		(u32::from(requested), r.cstr())
	} else {
		let Ok(requested) = r.u32_le() else {
			return;
		};
		(requested, r.cstr())
	};

	if process_name.is_empty() {
		warn!("[{}] diag id packet without process name", perif_name(router, id));
		return;
	}

	let assigned = match router
		.diag_ids
		.iter()
		.find(|entry| entry.process_name == process_name)
	{
		Some(entry) => entry.id,
		None => {
			router.last_diag_id = router.last_diag_id.wrapping_add(1);
			// version 3 peers bring their own id; everyone else takes the
			// next counter value
			let assigned = if version >= 3 && requested != 0 {
				requested as u8
			} else {
				router.last_diag_id
			};
			router.diag_ids.push(DiagIdEntry {
				id: assigned,
				process_name: process_name.clone(),
			});
			assigned
		}
	};

	if let Some(perif) = router.peripherals.get_mut(&id) {
		if perif.diag_id == 0 {
			perif.diag_id = assigned;
		}
	}

	debug!(
		"[{}] diag id {} for {}",
		perif_name(router, id),
		assigned,
		process_name
	);

	let mut body = Writer::new();
	body.u32_le(version);
	if version >= 2 {
		body.u8(assigned);
	} else {
		body.u32_le(u32::from(assigned));
	}
	body.cstr(&process_name);
	let pkt = with_header(CntlCmd::DiagId, body.into_vec());
	push_cntl(router, id, &pkt);
}

// ----------------------------------------------------------------------
// Outbound packets

fn with_header(cmd: CntlCmd, body: Vec<u8>) -> Vec<u8> {
	let mut w = Writer::with_capacity(8 + body.len());
	w.u32_le(cmd as u32).u32_le(body.len() as u32).bytes(&body);
	w.into_vec()
}

fn push_cntl(router: &mut Router, id: PerifId, pkt: &[u8]) {
	let Some(perif) = router.peripherals.get_mut(&id) else {
		return;
	};
	if perif.cntl_fd.is_none() {
		warn!("[{}] has no control channel, skipping", perif.name);
		return;
	}
	perif.cntlq.push(pkt, None);
}

fn send_feature_mask(router: &mut Router, id: PerifId, mask: Feature) {
	let mut body = Writer::new();
	// 4-byte mask plus the two pad bytes the original carried on the wire
	body.u32_le(4).u32_le(mask.bits()).zeros(2);
	let pkt = with_header(CntlCmd::FeatureMask, body.into_vec());
	push_cntl(router, id, &pkt);
}

pub fn send_log_mask(router: &mut Router, id: PerifId, equip_id: u32) {
	let status = router.masks.log_status();

	let (equip_id, num_items, mask) = if status == MaskStatus::Valid {
		match router.masks.get_log_mask(equip_id) {
			Some((num_items, mask)) => (equip_id, num_items, mask),
			None => (equip_id, 0, Vec::new()),
		}
	} else {
		(0, 0, Vec::new())
	};

	let mut body = Writer::new();
	body.u8(1) // stream id
		.u8(status.into())
		.u8(equip_id as u8)
		.u32_le(num_items)
		.u32_le(mask.len() as u32)
		.bytes(&mask);
	let pkt = with_header(CntlCmd::LogMask, body.into_vec());
	push_cntl(router, id, &pkt);
}

pub fn send_log_masks(router: &mut Router, id: PerifId) {
	if router.masks.log_status() == MaskStatus::Valid {
		for equip_id in 0..crate::masks::MAX_EQUIP_ID as u32 {
			send_log_mask(router, id, equip_id);
		}
	} else {
		send_log_mask(router, id, 0);
	}
}

pub fn send_msg_mask(router: &mut Router, id: PerifId, range: (u32, u32)) {
	let status = router.masks.msg_status();

	let (range, flags) = match status {
		MaskStatus::Valid => match router.masks.get_msg_mask(range.0) {
			Some((table_range, mask)) => {
				let num = (table_range.1 - table_range.0 + 1) as usize;
				(table_range, mask[..num.min(mask.len())].to_vec())
			}
			None => (range, Vec::new()),
		},
		MaskStatus::AllEnabled => {
			// a single synthetic entry carries the fill value
			let flag = router
				.masks
				.get_msg_mask(range.0)
				.and_then(|(_, mask)| mask.first().copied())
				.unwrap_or(0);
			(range, vec![flag])
		}
		MaskStatus::AllDisabled => ((0, 0), Vec::new()),
		MaskStatus::Invalid => (range, Vec::new()),
	};

	let mut body = Writer::new();
	body.u8(1) // stream id
		.u8(status.into())
		.u8(0) // msg mode
		.u16_le(range.0 as u16)
		.u16_le(range.1 as u16)
		.u32_le(flags.len() as u32);
	for flag in &flags {
		body.u32_le(*flag);
	}
	let pkt = with_header(CntlCmd::MsgMask, body.into_vec());
	push_cntl(router, id, &pkt);
}

pub fn send_msg_masks(router: &mut Router, id: PerifId) {
	for i in 0..SSID_FIRST.len() {
		send_msg_mask(router, id, (SSID_FIRST[i], SSID_LAST[i]));
	}
}

pub fn send_event_mask(router: &mut Router, id: PerifId) {
	let status = router.masks.event_status();
	let event_config =
		u8::from(status == MaskStatus::AllEnabled || status == MaskStatus::Valid);

	let mask = if status == MaskStatus::Valid {
		router
			.masks
			.get_event_mask(router.masks.event_max_bits())
			.unwrap_or_default()
	} else {
		Vec::new()
	};

	let mut body = Writer::new();
	body.u8(1) // stream id
		.u8(status.into())
		.u8(event_config)
		.u32_le(mask.len() as u32)
		.bytes(&mask);
	let pkt = with_header(CntlCmd::EventMask, body.into_vec());
	push_cntl(router, id, &pkt);
}

pub fn set_diag_mode(router: &mut Router, id: PerifId, real_time: bool) {
	let diag_id = router.peripherals.get(&id).map_or(0, |p| p.diag_id);
	let rt = u32::from(real_time);

	let mut body = Writer::new();
	body.u32_le(if diag_id != 0 { 2 } else { 1 }) // version
		.u32_le(rt) // sleep vote
		.u32_le(rt)
		.u32_le(0) // use_nrt_values
		.u32_le(0) // commit threshold
		.u32_le(0) // sleep threshold
		.u32_le(0) // sleep time
		.u32_le(0) // drain timer
		.u32_le(0); // event stale timer
	if diag_id != 0 {
		body.u8(diag_id);
	}
	let pkt = with_header(CntlCmd::DiagMode, body.into_vec());
	push_cntl(router, id, &pkt);
}

pub fn set_buffering_mode(router: &mut Router, id: PerifId, mode: u8) {
	let diag_id = router.peripherals.get(&id).map_or(0, |p| p.diag_id);

	let mut body = Writer::new();
	if diag_id != 0 {
		body.u32_le(2).u8(diag_id).u8(0).u8(mode);
	} else {
		body.u32_le(1).u8(0).u8(mode);
	}
	let pkt = with_header(CntlCmd::BufferingTxMode, body.into_vec());
	push_cntl(router, id, &pkt);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::router::test_support::{pipe_client, queued_frames, test_peripheral};

	fn register_tlv(cmd: u16, subsys: u16, ranges: &[(u16, u16)]) -> Vec<u8> {
		let mut body = Writer::new();
		body.u32_le(1) // version
			.u16_le(cmd)
			.u16_le(subsys)
			.u16_le(ranges.len() as u16)
			.u16_le(0); // port
		for &(first, last) in ranges {
			body.u16_le(first).u16_le(last).u32_le(0);
		}
		with_header(CntlCmd::Register, body.into_vec())
	}

	fn give_cntl_channel(router: &mut Router, id: PerifId) {
		let (rx, _tx) = nix::unistd::pipe().unwrap();
		router.peripherals.get_mut(&id).unwrap().cntl_fd = Some(std::rc::Rc::new(rx));
		std::mem::forget(_tx);
	}

	#[test]
	fn register_then_dispatch_forwards_to_dataq() {
		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		router.enable_client(client);
		let modem = test_peripheral(&mut router, "modem");

		// plain-command registration: 0xff/0xff covers single-byte keys
		recv(&mut router, modem, &register_tlv(0xff, 0xff, &[(0x0000, 0xffff)]));
		router.handle_command(client, &[0x7b, 0x00, 0x00]);

		let perif = router.peripherals.get_mut(&modem).unwrap();
		let head = perif.dataq.pop_head().unwrap();
		assert_eq!(
			head.pending(),
			crate::hdlc::encode(&[0x7b, 0x00, 0x00]).as_slice()
		);
		// nothing bounced back to the client
		assert!(queued_frames(&mut router, client).is_empty());
	}

	#[test]
	fn register_substitutes_subsys_dispatch_prefix() {
		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		let modem = test_peripheral(&mut router, "modem");

		recv(&mut router, modem, &register_tlv(0xff, 0x32, &[(0x0003, 0x0003)]));
		// key 0x4b320003: keep-alive style frame
		router.handle_command(client, &[0x4b, 0x32, 0x03, 0x00]);

		assert_eq!(router.peripherals[&modem].dataq.len(), 1);
	}

	#[test]
	fn truncated_tlv_aborts_buffer_quietly() {
		let mut router = Router::new().unwrap();
		let modem = test_peripheral(&mut router, "modem");

		// header declares 100 bytes, only 40 follow
		let mut buf = Writer::new();
		buf.u32_le(CntlCmd::Register as u32).u32_le(100).zeros(40);
		recv(&mut router, modem, &buf.into_vec());

		// parser survives and the next well-formed datagram still works
		recv(&mut router, modem, &register_tlv(0xff, 0xff, &[(0, 0xffff)]));
		let client = pipe_client(&mut router, false);
		router.handle_command(client, &[0x7b]);
		assert_eq!(router.peripherals[&modem].dataq.len(), 1);
	}

	#[test]
	fn deregister_removes_ranges() {
		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		router.enable_client(client);
		let modem = test_peripheral(&mut router, "modem");

		recv(&mut router, modem, &register_tlv(0xff, 0xff, &[(0x007b, 0x007b)]));

		let mut body = Writer::new();
		body.u32_le(1).u16_le(0xff).u16_le(0xff).u16_le(1);
		body.u16_le(0x007b).u16_le(0x007b);
		recv(&mut router, modem, &with_header(CntlCmd::Deregister, body.into_vec()));

		router.handle_command(client, &[0x7b]);
		assert!(router.peripherals[&modem].dataq.is_empty());
		assert_eq!(
			queued_frames(&mut router, client),
			vec![vec![0x13, 0x7b]]
		);
	}

	#[test]
	fn feature_mask_negotiation_intersects_and_replies() {
		let mut router = Router::new().unwrap();
		let modem = test_peripheral(&mut router, "modem");
		give_cntl_channel(&mut router, modem);

		let offered = Feature::FEATURE_MASK_SUPPORT
			| Feature::APPS_HDLC_ENCODE
			| Feature::REQ_RSP_SUPPORT
			| Feature::STM;
		let mut body = Writer::new();
		body.u32_le(4).u32_le(offered.bits());
		recv(&mut router, modem, &with_header(CntlCmd::FeatureMask, body.into_vec()));

		// no command channel on this peripheral: REQ_RSP and STM drop out
		let negotiated = router.peripherals[&modem].features;
		assert_eq!(
			negotiated,
			Feature::FEATURE_MASK_SUPPORT | Feature::APPS_HDLC_ENCODE
		);

		// first reply on the control queue is the feature mask echo
		let perif = router.peripherals.get_mut(&modem).unwrap();
		let head = perif.cntlq.pop_head().unwrap();
		let mut r = Reader::new(head.pending());
		assert_eq!(r.u32_le().unwrap(), CntlCmd::FeatureMask as u32);
		assert_eq!(r.u32_le().unwrap(), 10);
		assert_eq!(r.u32_le().unwrap(), 4);
		assert_eq!(r.u32_le().unwrap(), negotiated.bits());

		// masks, diag mode and buffering mode follow
		assert!(perif.cntlq.len() >= 28);
	}

	#[test]
	fn diag_ids_increment_per_unique_process() {
		let mut router = Router::new().unwrap();
		let modem = test_peripheral(&mut router, "modem");
		give_cntl_channel(&mut router, modem);

		let mut body = Writer::new();
		body.u32_le(1).u32_le(0).cstr("apps");
		recv(&mut router, modem, &with_header(CntlCmd::DiagId, body.into_vec()));

		let mut body = Writer::new();
		body.u32_le(1).u32_le(0).cstr("wlan_pd");
		recv(&mut router, modem, &with_header(CntlCmd::DiagId, body.into_vec()));

		// repeat of a known name keeps its id
		let mut body = Writer::new();
		body.u32_le(1).u32_le(0).cstr("apps");
		recv(&mut router, modem, &with_header(CntlCmd::DiagId, body.into_vec()));

		let ids: Vec<(u8, &str)> = router
			.diag_ids
			.iter()
			.map(|e| (e.id, e.process_name.as_str()))
			.collect();
		assert_eq!(ids, vec![(1, "apps"), (2, "wlan_pd")]);
		assert_eq!(router.peripherals[&modem].diag_id, 1);

		// three replies queued on the control channel
		assert_eq!(router.peripherals[&modem].cntlq.len(), 3);
	}

	#[test]
	fn version_3_peer_brings_its_own_id() {
		let mut router = Router::new().unwrap();
		let modem = test_peripheral(&mut router, "modem");
		give_cntl_channel(&mut router, modem);

		let mut body = Writer::new();
		body.u32_le(3).u8(0x2a).u8(0).cstr("npu");
		recv(&mut router, modem, &with_header(CntlCmd::DiagId, body.into_vec()));

		assert_eq!(router.diag_ids[0].id, 0x2a);
		assert_eq!(router.diag_ids[0].process_name, "npu");
	}

	#[test]
	fn mask_packets_reflect_table_status() {
		let mut router = Router::new().unwrap();
		let modem = test_peripheral(&mut router, "modem");
		give_cntl_channel(&mut router, modem);

		// invalid tables: single empty log mask packet
		send_log_masks(&mut router, modem);
		{
			let perif = router.peripherals.get_mut(&modem).unwrap();
			assert_eq!(perif.cntlq.len(), 1);
			let head = perif.cntlq.pop_head().unwrap();
			let mut r = Reader::new(head.pending());
			assert_eq!(r.u32_le().unwrap(), CntlCmd::LogMask as u32);
			let _len = r.u32_le().unwrap();
			assert_eq!(r.u8().unwrap(), 1); // stream id
			assert_eq!(r.u8().unwrap(), u8::from(MaskStatus::Invalid));
			assert_eq!(r.u8().unwrap(), 0); // equip id
			assert_eq!(r.u32_le().unwrap(), 0); // last item
			assert_eq!(r.u32_le().unwrap(), 0); // mask size
		}

		// one valid mask: sixteen per-equipment packets
		router.masks.set_log_mask(1, 8, &[0xa5]).unwrap();
		send_log_masks(&mut router, modem);
		{
			let perif = router.peripherals.get_mut(&modem).unwrap();
			assert_eq!(perif.cntlq.len(), crate::masks::MAX_EQUIP_ID);
			perif.cntlq.purge();
		}

		// disabled events: config 0, no body
		router.masks.toggle_events(false);
		send_event_mask(&mut router, modem);
		{
			let perif = router.peripherals.get_mut(&modem).unwrap();
			let head = perif.cntlq.pop_head().unwrap();
			let mut r = Reader::new(head.pending());
			assert_eq!(r.u32_le().unwrap(), CntlCmd::EventMask as u32);
			let _len = r.u32_le().unwrap();
			assert_eq!(r.u8().unwrap(), 1);
			assert_eq!(r.u8().unwrap(), u8::from(MaskStatus::AllDisabled));
			assert_eq!(r.u8().unwrap(), 0); // event config
			assert_eq!(r.u32_le().unwrap(), 0); // mask len
		}

		// all-disabled msg mask: zeroed range, no items
		router.masks.set_all_msg_mask(0);
		send_msg_mask(&mut router, modem, (4000, 4010));
		{
			let perif = router.peripherals.get_mut(&modem).unwrap();
			let head = perif.cntlq.pop_head().unwrap();
			let mut r = Reader::new(head.pending());
			assert_eq!(r.u32_le().unwrap(), CntlCmd::MsgMask as u32);
			let _len = r.u32_le().unwrap();
			r.skip(3).unwrap();
			assert_eq!(r.u16_le().unwrap(), 0);
			assert_eq!(r.u16_le().unwrap(), 0);
			assert_eq!(r.u32_le().unwrap(), 0);
		}
	}

	#[test]
	fn diag_mode_version_follows_diag_id() {
		let mut router = Router::new().unwrap();
		let modem = test_peripheral(&mut router, "modem");
		give_cntl_channel(&mut router, modem);

		set_diag_mode(&mut router, modem, true);
		{
			let perif = router.peripherals.get_mut(&modem).unwrap();
			let head = perif.cntlq.pop_head().unwrap();
			let mut r = Reader::new(head.pending());
			assert_eq!(r.u32_le().unwrap(), CntlCmd::DiagMode as u32);
			assert_eq!(r.u32_le().unwrap(), 36);
			assert_eq!(r.u32_le().unwrap(), 1); // version
			assert_eq!(r.u32_le().unwrap(), 1); // sleep vote
			assert_eq!(r.u32_le().unwrap(), 1); // real time
		}

		router.peripherals.get_mut(&modem).unwrap().diag_id = 7;
		set_diag_mode(&mut router, modem, true);
		{
			let perif = router.peripherals.get_mut(&modem).unwrap();
			let head = perif.cntlq.pop_head().unwrap();
			let mut r = Reader::new(head.pending());
			assert_eq!(r.u32_le().unwrap(), CntlCmd::DiagMode as u32);
			assert_eq!(r.u32_le().unwrap(), 37);
			assert_eq!(r.u32_le().unwrap(), 2); // version
		}

		set_buffering_mode(&mut router, modem, DIAG_BUFFERING_MODE_STREAMING);
		{
			let perif = router.peripherals.get_mut(&modem).unwrap();
			let head = perif.cntlq.pop_head().unwrap();
			let mut r = Reader::new(head.pending());
			assert_eq!(r.u32_le().unwrap(), CntlCmd::BufferingTxMode as u32);
			assert_eq!(r.u32_le().unwrap(), 7);
			assert_eq!(r.u32_le().unwrap(), 2); // version
			assert_eq!(r.u8().unwrap(), 7); // diag id
		}
	}
}
