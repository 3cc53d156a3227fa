//! The router core: entity tables and the three-tier command dispatcher.
//!
//! Every piece of mutable daemon state hangs off one [`Router`] value that is
//! constructed in `main` and passed by borrow into each reactor callback.

use std::os::fd::{OwnedFd, RawFd};

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::dm::Client;
use crate::error::{Result, RouterError};
use crate::masks::MaskTables;
use crate::peripheral::{self, Peripheral};
use crate::transport::usb::UsbEndpoint;
use crate::watch::{QueueRef, ReadSource, TimerEvent, Watch, fd_write};
use crate::{app_cmds, common_cmds};

pub const DIAG_CMD_SUBSYS_DISPATCH: u8 = 0x4b;
pub const DIAG_CMD_SUBSYS_DISPATCH_V2: u8 = 0x80;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClientId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PerifId(pub u32);

pub type CmdCallback = fn(&mut Router, ClientId, &[u8]) -> Result<()>;

#[derive(Clone, Copy)]
pub enum CmdTarget {
	Callback(CmdCallback),
	Peripheral(PerifId),
}

/// One registration: a handler covering the closed key range
/// `[first, last]`.
pub struct CmdRange {
	pub first: u32,
	pub last: u32,
	pub target: CmdTarget,
}

impl CmdRange {
	fn contains(&self, key: u32) -> bool {
		(self.first..=self.last).contains(&key)
	}
}

/// One assigned per-process diag id.
pub struct DiagIdEntry {
	pub id: u8,
	pub process_name: String,
}

/// rpmsg device-node table entry, keyed by devnode path.
pub struct Devnode {
	pub name: String,
	pub rproc: String,
}

pub struct Router {
	pub watch: Watch,
	pub masks: MaskTables,

	pub(crate) clients: HashMap<ClientId, Client>,
	next_client: u32,
	pub(crate) peripherals: HashMap<PerifId, Peripheral>,
	next_perif: u32,

	common_cmds: Vec<CmdRange>,
	perif_cmds: Vec<CmdRange>,
	fallback_cmds: Vec<CmdRange>,

	pub(crate) diag_ids: Vec<DiagIdEntry>,
	pub(crate) last_diag_id: u8,

	pub(crate) usb: Option<UsbEndpoint>,
	pub(crate) unix_listener: Option<OwnedFd>,
	pub(crate) uevent_monitor: Option<OwnedFd>,
	pub(crate) devnodes: HashMap<String, Devnode>,
}

impl Router {
	pub fn new() -> Result<Self> {
		Ok(Router {
			watch: Watch::new()?,
			masks: MaskTables::new(),
			clients: HashMap::new(),
			next_client: 0,
			peripherals: HashMap::new(),
			next_perif: 0,
			common_cmds: Vec::new(),
			perif_cmds: Vec::new(),
			fallback_cmds: Vec::new(),
			diag_ids: Vec::new(),
			last_diag_id: 0,
			usb: None,
			unix_listener: None,
			uevent_monitor: None,
			devnodes: HashMap::new(),
		})
	}

	pub(crate) fn alloc_client_id(&mut self) -> ClientId {
		let id = ClientId(self.next_client);
		self.next_client += 1;
		id
	}

	pub(crate) fn alloc_perif_id(&mut self) -> PerifId {
		let id = PerifId(self.next_perif);
		self.next_perif += 1;
		id
	}

	// ------------------------------------------------------------------
	// Dispatch registry

	pub fn register_common(&mut self, cmd: u32, cb: CmdCallback) {
		let key = 0xffff_0000 | cmd;
		self.common_cmds.push(CmdRange {
			first: key,
			last: key,
			target: CmdTarget::Callback(cb),
		});
	}

	pub fn register_fallback(&mut self, cmd: u32, cb: CmdCallback) {
		let key = 0xffff_0000 | cmd;
		self.fallback_cmds.push(CmdRange {
			first: key,
			last: key,
			target: CmdTarget::Callback(cb),
		});
	}

	pub fn register_fallback_subsys(&mut self, subsys: u32, cmd: u32, cb: CmdCallback) {
		let key = u32::from(DIAG_CMD_SUBSYS_DISPATCH) << 24 | (subsys & 0xff) << 16 | cmd;
		self.fallback_cmds.push(CmdRange {
			first: key,
			last: key,
			target: CmdTarget::Callback(cb),
		});
	}

	/// Install a peripheral-owned range (CNTL REGISTER).
	pub fn register_peripheral_cmd(&mut self, first: u32, last: u32, owner: PerifId) {
		self.perif_cmds.push(CmdRange {
			first,
			last,
			target: CmdTarget::Peripheral(owner),
		});
	}

	/// Remove the peripheral-owned registrations matching exactly this
	/// range (CNTL DEREGISTER).
	pub fn deregister_peripheral_cmd(&mut self, first: u32, last: u32, owner: PerifId) {
		self.perif_cmds.retain(|range| {
			!(range.first == first
				&& range.last == last
				&& matches!(range.target, CmdTarget::Peripheral(id) if id == owner))
		});
	}

	/// Drop every registration owned by a departing peripheral.
	pub fn remove_peripheral_cmds(&mut self, owner: PerifId) {
		self.perif_cmds
			.retain(|range| !matches!(range.target, CmdTarget::Peripheral(id) if id == owner));
	}

	pub fn register_common_cmds(&mut self) {
		common_cmds::register(self);
	}

	pub fn register_app_cmds(&mut self) {
		app_cmds::register(self);
	}

	// ------------------------------------------------------------------
	// Command handling

	/// Routing key for a command frame. Subsystem-dispatched commands mix a
	/// little-endian sub-command into a big-endian packed key; tools on the
	/// wire rely on this exact layout.
	pub fn command_key(data: &[u8]) -> u32 {
		if data.len() >= 4
			&& (data[0] == DIAG_CMD_SUBSYS_DISPATCH || data[0] == DIAG_CMD_SUBSYS_DISPATCH_V2)
		{
			u32::from(data[0]) << 24
				| u32::from(data[1]) << 16
				| u32::from(data[3]) << 8
				| u32::from(data[2])
		} else {
			0xffff_0000 | u32::from(data[0])
		}
	}

	fn dispatch(&mut self, client: ClientId, data: &[u8]) -> Result<()> {
		let key = Self::command_key(data);

		if let Some(cb) = self
			.common_cmds
			.iter()
			.find(|range| range.contains(key))
			.map(|range| range.target)
		{
			if let CmdTarget::Callback(cb) = cb {
				return cb(self, client, data);
			}
		}

		let matches: SmallVec<[CmdTarget; 4]> = self
			.perif_cmds
			.iter()
			.filter(|range| range.contains(key))
			.map(|range| range.target)
			.collect();
		if !matches.is_empty() {
			for target in matches {
				match target {
					CmdTarget::Callback(cb) => {
						let _ = cb(self, client, data);
					}
					CmdTarget::Peripheral(id) => self.peripheral_send(id, data),
				}
			}
			return Ok(());
		}

		if let Some(CmdTarget::Callback(cb)) = self
			.fallback_cmds
			.iter()
			.find(|range| range.contains(key))
			.map(|range| range.target)
		{
			return cb(self, client, data);
		}

		Err(RouterError::NotFound)
	}

	/// Dispatch one command frame from a client, converting handler errors
	/// into DIAG error responses.
	pub fn handle_command(&mut self, client: ClientId, data: &[u8]) {
		if data.is_empty() {
			return;
		}

		if let Err(err) = self.dispatch(client, data) {
			match err.response_code() {
				Some(code) => {
					let mut resp = Vec::with_capacity(data.len() + 1);
					resp.push(code);
					resp.extend_from_slice(data);
					self.dm_send(client, &resp);
				}
				None => debug!("command handler failed: {}", err),
			}
		}
	}

	// ------------------------------------------------------------------
	// Reactor plumbing

	pub(crate) fn handle_read_event(&mut self, source: ReadSource, fd: RawFd) {
		let result = match source {
			ReadSource::Client(id) => self.client_recv(id, fd),
			ReadSource::UnixListener => crate::transport::unix::accept_ready(self, fd),
			ReadSource::UsbEp0 => crate::transport::usb::ep0_ready(self, fd),
			ReadSource::Uevent => peripheral::rpmsg::uevent_ready(self, fd),
			ReadSource::QrtrCntl(id) => peripheral::qrtr::cntl_ready(self, id, fd),
			ReadSource::QrtrCmd(id) => peripheral::qrtr::cmd_ready(self, id, fd),
			ReadSource::QrtrData(id) => peripheral::qrtr::data_ready(self, id, fd),
			ReadSource::RpmsgCntl(id) => peripheral::rpmsg::cntl_ready(self, id, fd),
			ReadSource::RpmsgCmd(id) => peripheral::rpmsg::cmd_ready(self, id, fd),
			ReadSource::RpmsgData(id) => peripheral::rpmsg::data_ready(self, id, fd),
		};

		if result.is_err() {
			self.watch.remove_read(fd);
		}
	}

	pub(crate) fn handle_timer(&mut self, event: TimerEvent) {
		match event {
			TimerEvent::OpenRpmsgPeripheral(id) => peripheral::rpmsg::open_peripheral(self, id),
		}
	}

	pub(crate) fn queue_len(&self, queue: QueueRef) -> usize {
		match queue {
			QueueRef::ClientOut(id) => self.clients.get(&id).map_or(0, |c| c.outq.len()),
			QueueRef::PerifCntl(id) => self.peripherals.get(&id).map_or(0, |p| p.cntlq.len()),
			QueueRef::PerifData(id) => self.peripherals.get(&id).map_or(0, |p| p.dataq.len()),
			QueueRef::PerifCmd(id) => self.peripherals.get(&id).map_or(0, |p| p.cmdq.len()),
		}
	}

	fn queue_mut(&mut self, queue: QueueRef) -> Option<&mut crate::mbuf::WriteQueue> {
		match queue {
			QueueRef::ClientOut(id) => self.clients.get_mut(&id).map(|c| &mut c.outq),
			QueueRef::PerifCntl(id) => self.peripherals.get_mut(&id).map(|p| &mut p.cntlq),
			QueueRef::PerifData(id) => self.peripherals.get_mut(&id).map(|p| &mut p.dataq),
			QueueRef::PerifCmd(id) => self.peripherals.get_mut(&id).map(|p| &mut p.cmdq),
		}
	}

	/// Write the head of `queue` to its fd. A completed buffer is released,
	/// decrementing its flow token.
	pub(crate) fn flush_queue(&mut self, fd: RawFd, queue: QueueRef) {
		let Some(q) = self.queue_mut(queue) else {
			return;
		};
		let Some(head) = q.head_mut() else {
			return;
		};

		match fd_write(fd, head.pending()) {
			Ok(n) => {
				head.advance(n);
				if head.done() {
					q.pop_head();
				}
			}
			Err(nix::errno::Errno::EAGAIN) => {}
			Err(e) => {
				warn!("write failed on {:?}: {}", queue, e);
				match queue {
					QueueRef::ClientOut(id) => self.remove_client(id),
					QueueRef::PerifCntl(id)
					| QueueRef::PerifData(id)
					| QueueRef::PerifCmd(id) => self.peripheral_close(id),
				}
			}
		}
	}

	pub fn quit(&mut self) {
		self.watch.quit();
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use std::os::fd::OwnedFd;
	use std::rc::Rc;

	use super::*;

	/// Client backed by a pipe, so queued buffers can really be flushed.
	pub fn pipe_client(router: &mut Router, hdlc_encoded: bool) -> ClientId {
		let (rx, tx) = nix::unistd::pipe().unwrap();
		let rx: Rc<OwnedFd> = Rc::new(rx);
		let tx: Rc<OwnedFd> = Rc::new(tx);
		router.add_client("test", Some(rx), tx, hdlc_encoded)
	}

	/// Drain a client's output queue into plain byte vectors.
	pub fn queued_frames(router: &mut Router, id: ClientId) -> Vec<Vec<u8>> {
		let client = router.clients.get_mut(&id).unwrap();
		let mut frames = Vec::new();
		while let Some(mbuf) = client.outq.pop_head() {
			frames.push(mbuf.pending().to_vec());
		}
		frames
	}

	/// Bare peripheral with queues but no transport fds.
	pub fn test_peripheral(router: &mut Router, name: &str) -> PerifId {
		let perif = Peripheral::new(name, crate::peripheral::Link::test());
		router.add_peripheral(perif)
	}
}

#[cfg(test)]
mod tests {
	use super::test_support::*;
	use super::*;
	use crate::hdlc;

	fn ok_handler(_r: &mut Router, _c: ClientId, _d: &[u8]) -> Result<()> {
		Ok(())
	}

	fn tag_handler(tag: u8) -> CmdCallback {
		// distinct fn items per tag, picked via a tiny table
		match tag {
			0 => |r: &mut Router, c: ClientId, _d: &[u8]| {
				r.dm_send(c, &[0xa0]);
				Ok(())
			},
			1 => |r: &mut Router, c: ClientId, _d: &[u8]| {
				r.dm_send(c, &[0xa1]);
				Ok(())
			},
			_ => |r: &mut Router, c: ClientId, _d: &[u8]| {
				r.dm_send(c, &[0xa2]);
				Ok(())
			},
		}
	}

	#[test]
	fn key_construction() {
		assert_eq!(
			Router::command_key(&[0x4b, 0x32, 0x03, 0x00]),
			0x4b32_0003
		);
		assert_eq!(
			Router::command_key(&[0x80, 0x12, 0x22, 0x02]),
			0x8012_0222
		);
		assert_eq!(Router::command_key(&[0x1c]), 0xffff_001c);
		// short subsystem frames fall back to the single-byte key
		assert_eq!(Router::command_key(&[0x4b, 0x32]), 0xffff_004b);
	}

	#[test]
	fn common_outranks_peripheral_and_fallback() {
		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		router.enable_client(client);
		let perif = test_peripheral(&mut router, "modem");

		router.register_common(0x42, tag_handler(0));
		router.register_peripheral_cmd(0xffff_0042, 0xffff_0042, perif);
		router.register_fallback(0x42, tag_handler(1));

		router.handle_command(client, &[0x42]);

		assert_eq!(queued_frames(&mut router, client), vec![vec![0xa0]]);
		assert!(router.peripherals[&perif].dataq.is_empty());
	}

	#[test]
	fn peripheral_outranks_fallback() {
		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		router.enable_client(client);
		let perif = test_peripheral(&mut router, "modem");

		router.register_peripheral_cmd(0xffff_0042, 0xffff_0042, perif);
		router.register_fallback(0x42, tag_handler(1));

		router.handle_command(client, &[0x42]);

		assert!(queued_frames(&mut router, client).is_empty());
		assert_eq!(router.peripherals[&perif].dataq.len(), 1);
	}

	#[test]
	fn fallback_runs_when_nothing_else_matches() {
		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		router.enable_client(client);

		router.register_fallback(0x42, tag_handler(1));
		router.handle_command(client, &[0x42]);

		assert_eq!(queued_frames(&mut router, client), vec![vec![0xa1]]);
	}

	#[test]
	fn unknown_command_gets_bad_command_response() {
		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, true);
		router.enable_client(client);

		router.handle_command(client, &[0xfe]);

		assert_eq!(
			queued_frames(&mut router, client),
			vec![hdlc::encode(&[0x13, 0xfe])]
		);
	}

	#[test]
	fn every_matching_peripheral_forwards() {
		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		let a = test_peripheral(&mut router, "modem");
		let b = test_peripheral(&mut router, "cdsp");

		router.register_peripheral_cmd(0xffff_0000, 0xffff_00ff, a);
		router.register_peripheral_cmd(0xffff_0040, 0xffff_0044, b);

		router.handle_command(client, &[0x42]);

		assert_eq!(router.peripherals[&a].dataq.len(), 1);
		assert_eq!(router.peripherals[&b].dataq.len(), 1);
	}

	#[test]
	fn deregister_removes_exact_range_only() {
		let mut router = Router::new().unwrap();
		let perif = test_peripheral(&mut router, "modem");

		router.register_peripheral_cmd(0x7b00_0000, 0x7b00_ffff, perif);
		router.register_peripheral_cmd(0x7c00_0000, 0x7c00_ffff, perif);
		router.deregister_peripheral_cmd(0x7b00_0000, 0x7b00_ffff, perif);

		assert_eq!(router.perif_cmds.len(), 1);
		router.remove_peripheral_cmds(perif);
		assert!(router.perif_cmds.is_empty());
	}

	#[test]
	fn handler_error_maps_to_status_byte() {
		fn bad_len(_r: &mut Router, _c: ClientId, _d: &[u8]) -> Result<()> {
			Err(RouterError::WrongSize)
		}

		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		router.enable_client(client);
		router.register_fallback(0x42, bad_len);

		router.handle_command(client, &[0x42, 0x01]);

		assert_eq!(
			queued_frames(&mut router, client),
			vec![vec![0x15, 0x42, 0x01]]
		);
	}

	#[test]
	fn flush_queue_writes_and_releases_flow() {
		use crate::watch::{QueueRef, WatchFlow};

		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		router.enable_client(client);

		let flow = WatchFlow::new();
		router.dm_broadcast(&[1, 2, 3], Some(&flow));
		assert_eq!(flow.count(), 1);

		let fd = {
			use std::os::fd::AsRawFd;
			router.clients[&client].out_fd.as_raw_fd()
		};
		router.flush_queue(fd, QueueRef::ClientOut(client));

		assert_eq!(flow.count(), 0);
		assert_eq!(router.queue_len(QueueRef::ClientOut(client)), 0);
	}

	#[test]
	fn dispatch_tolerates_handlers_touching_registry() {
		fn registering(r: &mut Router, _c: ClientId, _d: &[u8]) -> Result<()> {
			r.register_fallback(0x99, |_r, _c, _d| Ok(()));
			Ok(())
		}

		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		router.register_fallback(0x42, registering);
		router.handle_command(client, &[0x42]);
		assert_eq!(router.fallback_cmds.len(), 2);
	}

	#[test]
	fn ok_handler_is_silent() {
		let mut router = Router::new().unwrap();
		let client = pipe_client(&mut router, false);
		router.enable_client(client);
		router.register_common(0x42, ok_handler);
		router.handle_command(client, &[0x42]);
		assert!(queued_frames(&mut router, client).is_empty());
	}
}
