//! Log, message and event filter-mask tables.
//!
//! Three parallel tables shared by the host-side configuration commands and
//! the peripheral control channel: the log mask (per equipment id bitmaps),
//! the runtime message mask (25 SSID ranges with 32-bit flags per SSID) plus
//! its build-time twin, and the bit-addressed event mask.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const MAX_EQUIP_ID: usize = 16;
pub const MSG_MASK_TBL_CNT: usize = 25;
pub const MAX_SSID_PER_RANGE: u32 = 200;
pub const MAX_ITEMS_PER_EQUIP_ID: u32 = 512;
pub const MAX_ITEMS_ALLOWED: u32 = 0xfff;
pub const APPS_EVENT_LAST_ID: u16 = 0x200;
pub const EVENT_MASK_SIZE: usize = 513;

/// Highest log code per equipment id.
const LOG_CODE_LAST_TBL: [u32; MAX_EQUIP_ID] = [
	0x0, 0x1a02, 0x0, 0x0, 0x4910, 0x5420, 0x0, 0x74ff, 0x0, 0x0, 0xa38a, 0xb201, 0x0, 0xd1ff,
	0x0, 0x0,
];

pub const SSID_FIRST: [u32; MSG_MASK_TBL_CNT] = [
	0, 500, 1000, 2000, 3000, 4000, 4500, 4600, 5000, 5500, 6000, 6500, 7000, 7100, 7200, 8000,
	8500, 9000, 9500, 10200, 10251, 10300, 10350, 10400, 0xc000,
];

pub const SSID_LAST: [u32; MSG_MASK_TBL_CNT] = [
	120, 506, 1007, 2008, 3014, 4010, 4573, 4615, 5033, 5516, 6081, 6521, 7003, 7111, 7201, 8000,
	8529, 9008, 9510, 10210, 10255, 10300, 10377, 10416, 0xc063,
];

pub fn bits_to_bytes(bits: u32) -> usize {
	(bits as usize + 7) / 8
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MaskStatus {
	Invalid = 0,
	AllDisabled = 1,
	AllEnabled = 2,
	Valid = 3,
}

struct LogMask {
	equip_id: u8,
	num_items_tools: u32,
	mask: Vec<u8>,
}

struct MsgMask {
	ssid_first: u32,
	ssid_last: u32,
	ssid_last_tools: u32,
	/// Initial table range, before tools growth.
	range: u32,
	mask: Vec<u32>,
}

fn msg_mask_table() -> Vec<MsgMask> {
	(0..MSG_MASK_TBL_CNT)
		.map(|i| {
			let range = (SSID_LAST[i] - SSID_FIRST[i] + 1).max(MAX_SSID_PER_RANGE);
			MsgMask {
				ssid_first: SSID_FIRST[i],
				ssid_last: SSID_LAST[i],
				ssid_last_tools: SSID_LAST[i],
				range,
				mask: vec![u32::MAX; range as usize],
			}
		})
		.collect()
}

pub struct MaskTables {
	log: Vec<LogMask>,
	log_status: MaskStatus,
	msg: Vec<MsgMask>,
	msg_status: MaskStatus,
	build: Vec<MsgMask>,
	build_status: MaskStatus,
	event: Vec<u8>,
	event_status: MaskStatus,
	event_max_bits: u16,
}

impl Default for MaskTables {
	fn default() -> Self {
		MaskTables::new()
	}
}

impl MaskTables {
	pub fn new() -> Self {
		let log = (0..MAX_EQUIP_ID as u8)
			.map(|equip_id| {
				let num_items = LOG_CODE_LAST_TBL[equip_id as usize] & 0xfff;
				let range =
					(bits_to_bytes(num_items) as u32).max(MAX_ITEMS_PER_EQUIP_ID) as usize;
				LogMask {
					equip_id,
					num_items_tools: num_items,
					mask: vec![0; range],
				}
			})
			.collect();

		MaskTables {
			log,
			log_status: MaskStatus::Invalid,
			msg: msg_mask_table(),
			msg_status: MaskStatus::Invalid,
			build: msg_mask_table(),
			build_status: MaskStatus::Invalid,
			event: vec![0; EVENT_MASK_SIZE],
			event_status: MaskStatus::Invalid,
			event_max_bits: APPS_EVENT_LAST_ID,
		}
	}

	pub fn log_status(&self) -> MaskStatus {
		self.log_status
	}

	pub fn msg_status(&self) -> MaskStatus {
		self.msg_status
	}

	pub fn build_status(&self) -> MaskStatus {
		self.build_status
	}

	pub fn event_status(&self) -> MaskStatus {
		self.event_status
	}

	pub fn event_max_bits(&self) -> u16 {
		self.event_max_bits
	}

	pub fn disable_log(&mut self) {
		for item in &mut self.log {
			item.mask.fill(0);
		}
		self.log_status = MaskStatus::AllDisabled;
	}

	pub fn log_range(&self) -> [u32; MAX_EQUIP_ID] {
		let mut ranges = [0u32; MAX_EQUIP_ID];
		for (slot, item) in ranges.iter_mut().zip(self.log.iter()) {
			*slot = item.num_items_tools;
		}
		ranges
	}

	/// Install a new bitmap for one equipment id. Returns the (possibly
	/// capped) item count and bitmap size actually stored.
	pub fn set_log_mask(
		&mut self,
		equip_id: u32,
		num_items: u32,
		mask: &[u8],
	) -> Option<(u32, usize)> {
		let item = self
			.log
			.iter_mut()
			.find(|item| u32::from(item.equip_id) == equip_id)?;

		item.num_items_tools = num_items.min(MAX_ITEMS_ALLOWED);
		let mask_size = bits_to_bytes(item.num_items_tools);
		item.mask.fill(0);
		if mask_size > item.mask.len() {
			item.mask.resize(mask_size, 0);
		}
		let n = mask_size.min(mask.len());
		item.mask[..n].copy_from_slice(&mask[..n]);
		self.log_status = MaskStatus::Valid;

		Some((item.num_items_tools, mask_size))
	}

	pub fn get_log_mask(&self, equip_id: u32) -> Option<(u32, Vec<u8>)> {
		let item = self
			.log
			.iter()
			.find(|item| u32::from(item.equip_id) == equip_id)?;

		let mask_size = bits_to_bytes(item.num_items_tools);
		Some((
			item.num_items_tools,
			item.mask[..mask_size.min(item.mask.len())].to_vec(),
		))
	}

	pub fn ssid_ranges(&self) -> Vec<(u16, u16)> {
		self.msg
			.iter()
			.map(|item| (item.ssid_first as u16, item.ssid_last_tools as u16))
			.collect()
	}

	/// Build-time mask for a range starting exactly at `first`. The returned
	/// range may be truncated to what the table holds.
	pub fn get_build_mask(&self, first: u32, last: u32) -> Option<((u32, u32), Vec<u32>)> {
		let item = self.build.iter().find(|item| item.ssid_first == first)?;

		let mut num = last.saturating_sub(first) + 1;
		let mut last = last;
		if num > item.range {
			warn!(
				"truncating ssid range {}..{} to table size {}",
				first, last, item.range
			);
			num = item.range;
			last = first + num - 1;
		}
		Some(((first, last), item.mask[..num as usize].to_vec()))
	}

	/// Runtime mask for the table range containing `first`. Returns the full
	/// table range and a copy of its flags.
	pub fn get_msg_mask(&self, first: u32) -> Option<((u32, u32), Vec<u32>)> {
		let item = self
			.msg
			.iter()
			.find(|item| first >= item.ssid_first && first <= item.ssid_last_tools)?;

		let num = (item.range as usize).min(item.mask.len());
		Some(((item.ssid_first, item.ssid_last), item.mask[..num].to_vec()))
	}

	pub fn set_msg_mask(&mut self, first: u32, last: u32, flags: &[u32]) -> bool {
		for i in 0..self.msg.len() {
			let next_first = self.msg.get(i + 1).map(|next| next.ssid_first);
			let item = &mut self.msg[i];

			if first < item.ssid_first
				|| first > item.ssid_first + MAX_SSID_PER_RANGE
				|| next_first.is_some_and(|nf| first >= nf)
			{
				continue;
			}

			let mut num = last.saturating_sub(first) + 1;
			if num > MAX_SSID_PER_RANGE {
				warn!(
					"truncating ssid range {}..{} to {} entries",
					first, last, MAX_SSID_PER_RANGE
				);
				num = MAX_SSID_PER_RANGE;
				item.ssid_last_tools = item.ssid_first + MAX_SSID_PER_RANGE;
				item.mask.resize(MAX_SSID_PER_RANGE as usize + 1, 0);
			}
			if last > item.ssid_last_tools {
				if num != MAX_SSID_PER_RANGE {
					item.ssid_last_tools = last;
				}
				let range_tools = (item.ssid_last_tools - item.ssid_first + 1) as usize;
				item.mask.resize(range_tools, 0);
			}

			let offset = (first - item.ssid_first) as usize;
			let num = num as usize;
			if offset + num > item.mask.len() || flags.len() < num {
				warn!("ssid range not in mask table: offset {} num {}", offset, num);
				return false;
			}
			item.mask[offset..offset + num].copy_from_slice(&flags[..num]);
			self.msg_status = MaskStatus::Valid;
			return true;
		}

		false
	}

	pub fn set_all_msg_mask(&mut self, mask: u32) {
		self.msg_status = if mask != 0 {
			MaskStatus::AllEnabled
		} else {
			MaskStatus::AllDisabled
		};
		for item in &mut self.msg {
			item.mask.fill(mask);
		}
	}

	pub fn get_event_mask(&self, num_bits: u16) -> Option<Vec<u8>> {
		if num_bits > self.event_max_bits {
			return None;
		}
		Some(self.event[..bits_to_bytes(num_bits.into())].to_vec())
	}

	pub fn update_event_mask(&mut self, num_bits: u16, mask: &[u8]) {
		let size = bits_to_bytes(num_bits.into());
		if num_bits > self.event_max_bits {
			self.event.resize(size, 0);
			self.event_max_bits = num_bits;
		}
		let n = size.min(mask.len());
		self.event[..n].copy_from_slice(&mask[..n]);
		self.event_status = MaskStatus::Valid;
	}

	pub fn toggle_events(&mut self, enabled: bool) {
		if enabled {
			self.event.fill(0xff);
			self.event_status = MaskStatus::AllEnabled;
		} else {
			self.event.fill(0);
			self.event_status = MaskStatus::AllDisabled;
		}
	}
}
