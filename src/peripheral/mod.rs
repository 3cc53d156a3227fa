//! Peripheral model.
//!
//! A peripheral is one on-chip processor exposing DIAG channels. Two
//! transports exist, QIPCRTR sockets and rpmsg character devices; both hang
//! behind the same [`Peripheral`] value so the command dispatcher never
//! branches on the transport.

pub mod qrtr;
pub mod rpmsg;

use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use enum_dispatch::enum_dispatch;

use self::qrtr::QrtrLink;
use self::rpmsg::RpmsgLink;

use crate::hdlc;
use crate::mbuf::WriteQueue;
use crate::router::{PerifId, Router};
use crate::watch::WatchFlow;
use crate::wire::Reader;

bitflags! {
	/// Negotiated DIAG feature mask.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct Feature: u32 {
		const FEATURE_MASK_SUPPORT = 1 << 0;
		const MASTER_SETS_COMMON_MASK = 1 << 1;
		const LOG_ON_DEMAND = 1 << 2;
		const VERSION_RSP_ON_MASTER = 1 << 3;
		const REQ_RSP_SUPPORT = 1 << 4;
		const PRESET_MASKS = 1 << 5;
		const APPS_HDLC_ENCODE = 1 << 6;
		const STM = 1 << 9;
		const PERIPHERAL_BUFFERING = 1 << 10;
		const MASK_CENTRALIZATION = 1 << 11;
		const SOCKETS_ENABLED = 1 << 13;
		const DCI_EXTENDED_HEADER = 1 << 14;
		const DIAG_ID = 1 << 15;
		const PKT_HEADER_UNTAG = 1 << 16;
		const DIAG_ID_FEATURE_MASK = 1 << 17;
	}
}

#[enum_dispatch]
pub trait LinkOps {
	/// Whether the far side talks over the socket transport.
	fn uses_sockets(&self) -> bool;
}

/// Transport arm behind a peripheral.
#[enum_dispatch(LinkOps)]
pub enum Link {
	Qrtr(QrtrLink),
	Rpmsg(RpmsgLink),
}

impl Link {
	#[cfg(test)]
	pub fn test() -> Self {
		Link::Rpmsg(RpmsgLink {
			remoteproc: "test".to_owned(),
		})
	}
}

pub struct Peripheral {
	pub name: String,
	pub features: Feature,
	pub diag_id: u8,

	pub cmdq: WriteQueue,
	pub cntlq: WriteQueue,
	pub dataq: WriteQueue,

	pub cntl_fd: Option<Rc<OwnedFd>>,
	pub data_fd: Option<Rc<OwnedFd>>,
	pub cmd_fd: Option<Rc<OwnedFd>>,
	pub dci_cmd_fd: Option<Rc<OwnedFd>>,
	pub cntl_open: bool,
	pub data_open: bool,

	pub flow: WatchFlow,
	pub decoder: hdlc::Decoder,
	pub link: Link,
}

impl Peripheral {
	pub fn new(name: &str, link: Link) -> Self {
		Peripheral {
			name: name.to_owned(),
			features: Feature::empty(),
			diag_id: 0,
			cmdq: WriteQueue::new(),
			cntlq: WriteQueue::new(),
			dataq: WriteQueue::new(),
			cntl_fd: None,
			data_fd: None,
			cmd_fd: None,
			dci_cmd_fd: None,
			cntl_open: false,
			data_open: false,
			flow: WatchFlow::new(),
			decoder: hdlc::Decoder::new(),
			link,
		}
	}
}

/// Non-HDLC record framing used on peripheral data and command channels:
/// `{0x7e, version=1, len:u16_le}` header, payload, trailing `0x7e`.
pub fn parse_non_hdlc(buf: &[u8]) -> Option<&[u8]> {
	let mut r = Reader::new(buf);
	let start = r.u8().ok()?;
	let version = r.u8().ok()?;
	let len = r.u16_le().ok()? as usize;

	if start != hdlc::CONTROL_CHAR || version != 1 {
		warn!("invalid non-HDLC frame");
		return None;
	}
	if buf.len() < 4 + len + 1 {
		warn!("truncated non-HDLC frame");
		return None;
	}
	if buf[4 + len] != hdlc::CONTROL_CHAR {
		warn!("non-HDLC frame is not terminated");
		return None;
	}

	Some(&buf[4..4 + len])
}

impl Router {
	/// Bring up both peripheral transports. Either may find nothing on this
	/// system; that is not an error.
	pub fn peripheral_init(&mut self) {
		rpmsg::init(self);
		qrtr::init(self);
	}

	pub fn add_peripheral(&mut self, perif: Peripheral) -> PerifId {
		let id = self.alloc_perif_id();
		self.peripherals.insert(id, perif);
		id
	}

	/// Forward a command frame to a peripheral, honouring its negotiated
	/// features: the dedicated command channel when it has one, and raw
	/// buffers when the far side does its own HDLC encoding.
	pub fn peripheral_send(&mut self, id: PerifId, msg: &[u8]) {
		let Some(perif) = self.peripherals.get_mut(&id) else {
			return;
		};

		let queue = if perif.features.contains(Feature::REQ_RSP_SUPPORT) {
			&mut perif.cmdq
		} else {
			&mut perif.dataq
		};

		if perif.features.contains(Feature::APPS_HDLC_ENCODE) {
			queue.push(msg, None);
		} else {
			queue.push_hdlc(msg, None);
		}
	}

	/// Tear a peripheral down: dispatch registrations go first, then the
	/// queues, watches and fds.
	pub fn peripheral_close(&mut self, id: PerifId) {
		self.remove_peripheral_cmds(id);

		let Some(mut perif) = self.peripherals.remove(&id) else {
			return;
		};
		info!("[{}] closing peripheral", perif.name);

		perif.cmdq.purge();
		perif.cntlq.purge();
		perif.dataq.purge();

		for fd in [
			perif.cntl_fd.take(),
			perif.data_fd.take(),
			perif.cmd_fd.take(),
			perif.dci_cmd_fd.take(),
		]
		.into_iter()
		.flatten()
		{
			self.watch.remove_fd(fd.as_raw_fd());
		}
	}

	pub fn broadcast_log_mask(&mut self, equip_id: u32) {
		for id in self.peripheral_ids() {
			crate::cntl::send_log_mask(self, id, equip_id);
		}
	}

	/// `range` of `None` refreshes every SSID range.
	pub fn broadcast_msg_mask(&mut self, range: Option<(u32, u32)>) {
		for id in self.peripheral_ids() {
			match range {
				Some(range) => crate::cntl::send_msg_mask(self, id, range),
				None => crate::cntl::send_msg_masks(self, id),
			}
		}
	}

	pub fn broadcast_event_mask(&mut self) {
		for id in self.peripheral_ids() {
			crate::cntl::send_event_mask(self, id);
		}
	}

	pub(crate) fn peripheral_ids(&self) -> Vec<PerifId> {
		self.peripherals.keys().copied().collect()
	}
}
