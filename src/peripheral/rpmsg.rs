//! rpmsg character-device transport.
//!
//! Peripherals on older platforms expose their DIAG channels as rpmsg
//! character devices. A sysfs scan seeds the device-node table and a kobject
//! uevent socket keeps it current; sighting a primary channel schedules the
//! peripheral open one second later so sibling channels can finish
//! enumerating.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::sys::socket::{
	AddressFamily, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, socket,
};

use crate::cntl;
use crate::error::Result;
use crate::peripheral::{self, Feature, Link, LinkOps, Peripheral};
use crate::router::{Devnode, PerifId, Router};
use crate::watch::{QueueRef, ReadSource, TimerEvent, fd_read};

const RPMSG_SYS_DEVICES: &str = "/sys/bus/rpmsg/devices";

/// Channels that identify a peripheral worth opening.
const PRIMARY_CHANNELS: [&str; 2] = ["DIAG", "APPS_RIVA_DATA"];

const OPEN_DELAY_MS: u64 = 1000;

pub struct RpmsgLink {
	pub remoteproc: String,
}

impl LinkOps for RpmsgLink {
	fn uses_sockets(&self) -> bool {
		false
	}
}

fn read_attr(dir: &Path, attr: &str) -> Option<String> {
	fs::read_to_string(dir.join(attr))
		.ok()
		.map(|s| s.trim_end().to_owned())
}

/// Walk up the device chain looking for the remoteproc that owns this
/// channel.
fn find_remoteproc(dir: &Path) -> Option<String> {
	let mut dir = fs::canonicalize(dir).ok()?;
	loop {
		if let Some(rproc) = read_attr(&dir, "rpmsg_name") {
			return Some(rproc);
		}
		if !dir.pop() {
			return None;
		}
	}
}

/// DEVNAME from a sysfs uevent attribute file.
fn devname_from_uevent(dir: &Path) -> Option<String> {
	let uevent = fs::read_to_string(dir.join("uevent")).ok()?;
	uevent
		.lines()
		.find_map(|line| line.strip_prefix("DEVNAME="))
		.map(str::to_owned)
}

fn devnode_add(router: &mut Router, devnode: String, name: String, rproc: String) {
	if router.devnodes.contains_key(&devnode) {
		warn!("node {} already in list", devnode);
		return;
	}
	debug!("[{}] rpmsg channel {} at {}", rproc, name, devnode);
	router.devnodes.insert(devnode, Devnode { name, rproc });
}

fn devnode_remove(router: &mut Router, devnode: &str) {
	router.devnodes.remove(devnode);
}

fn devnode_open(router: &Router, rproc: &str, name: &str) -> Option<OwnedFd> {
	let path = router
		.devnodes
		.iter()
		.find(|(_, node)| node.rproc == rproc && node.name == name)
		.map(|(path, _)| path.clone())?;

	match fs::OpenOptions::new()
		.read(true)
		.write(true)
		.custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
		.open(&path)
	{
		Ok(file) => Some(file.into()),
		Err(e) => {
			warn!("failed to open {}: {}", path, e);
			None
		}
	}
}

/// Create the peripheral for a newly seen primary channel and schedule its
/// open.
fn peripheral_create(router: &mut Router, rproc: &str, channel: &str) {
	if !PRIMARY_CHANNELS.contains(&channel) {
		return;
	}
	if router.peripherals.values().any(|p| p.name == rproc) {
		return;
	}

	let perif = Peripheral::new(
		rproc,
		Link::Rpmsg(RpmsgLink {
			remoteproc: rproc.to_owned(),
		}),
	);
	let id = router.add_peripheral(perif);
	router
		.watch
		.add_timer(TimerEvent::OpenRpmsgPeripheral(id), OPEN_DELAY_MS, false);
}

/// Delayed-open timer handler: acquire the channels by name and join the
/// reactor.
pub fn open_peripheral(router: &mut Router, id: PerifId) {
	let Some(rproc) = router.peripherals.get(&id).map(|p| p.name.clone()) else {
		return;
	};

	let Some(data) = devnode_open(router, &rproc, "DIAG")
		.or_else(|| devnode_open(router, &rproc, "APPS_RIVA_DATA"))
	else {
		warn!("[{}] unable to open DIAG channel", rproc);
		return;
	};

	let Some(cntl_fd) = devnode_open(router, &rproc, "DIAG_CNTL")
		.or_else(|| devnode_open(router, &rproc, "APPS_RIVA_CTRL"))
	else {
		warn!("[{}] unable to find DIAG_CNTL channel", rproc);
		return;
	};

	let cmd = devnode_open(router, &rproc, "DIAG_CMD");

	let data_raw = data.as_raw_fd();
	let cntl_raw = cntl_fd.as_raw_fd();
	let cmd_raw = cmd.as_ref().map(|fd| fd.as_raw_fd());

	let flow = {
		let Some(perif) = router.peripherals.get_mut(&id) else {
			return;
		};
		perif.data_fd = Some(Rc::new(data));
		perif.cntl_fd = Some(Rc::new(cntl_fd));
		perif.cmd_fd = cmd.map(Rc::new);
		perif.flow.clone()
	};

	router.watch.add_queue(cntl_raw, QueueRef::PerifCntl(id));
	router.watch.add_queue(data_raw, QueueRef::PerifData(id));
	router.watch.add_read(cntl_raw, ReadSource::RpmsgCntl(id), None);
	router
		.watch
		.add_read(data_raw, ReadSource::RpmsgData(id), Some(flow));
	if let Some(cmd_raw) = cmd_raw {
		router.watch.add_read(cmd_raw, ReadSource::RpmsgCmd(id), None);
		router.watch.add_queue(cmd_raw, QueueRef::PerifCmd(id));
	}

	info!("[{}] rpmsg peripheral up", rproc);

	// let the newly found peripheral know about the current masks
	cntl::send_msg_masks(router, id);
}

pub fn cntl_ready(router: &mut Router, id: PerifId, fd: RawFd) -> Result<()> {
	let mut buf = [0u8; 4096];
	match fd_read(fd, &mut buf) {
		Ok(0) => {
			router.peripheral_close(id);
			Ok(())
		}
		Ok(n) => {
			let payload = buf[..n].to_vec();
			cntl::recv(router, id, &payload);
			Ok(())
		}
		Err(nix::errno::Errno::EAGAIN) => Ok(()),
		Err(e) => {
			warn!("failed to read from cntl channel: {}", e);
			router.peripheral_close(id);
			Err(e.into())
		}
	}
}

pub fn data_ready(router: &mut Router, id: PerifId, fd: RawFd) -> Result<()> {
	let Some(perif) = router.peripherals.get(&id) else {
		return Ok(());
	};
	let pre_encoded = perif.features.contains(Feature::APPS_HDLC_ENCODE);
	let flow = perif.flow.clone();
	let mut buf = [0u8; 4096];

	loop {
		let n = match fd_read(fd, &mut buf) {
			Ok(0) => {
				router.peripheral_close(id);
				return Ok(());
			}
			Ok(n) => n,
			Err(nix::errno::Errno::EAGAIN) => return Ok(()),
			Err(e) => {
				warn!("failed to read from data channel: {}", e);
				router.peripheral_close(id);
				return Err(e.into());
			}
		};

		if pre_encoded {
			router.dm_broadcast(&buf[..n], Some(&flow));
		} else {
			let Some(perif) = router.peripherals.get_mut(&id) else {
				return Ok(());
			};
			let frames = perif.decoder.decode(&buf[..n]);
			for frame in frames {
				router.dm_broadcast(&frame, Some(&flow));
			}
		}
	}
}

pub fn cmd_ready(router: &mut Router, id: PerifId, fd: RawFd) -> Result<()> {
	let mut buf = [0u8; 16384];
	match fd_read(fd, &mut buf) {
		Ok(0) => {
			router.peripheral_close(id);
			Ok(())
		}
		Ok(n) => {
			if let Some(payload) = peripheral::parse_non_hdlc(&buf[..n]) {
				let payload = payload.to_vec();
				router.dm_broadcast(&payload, None);
			}
			Ok(())
		}
		Err(nix::errno::Errno::EAGAIN) => Ok(()),
		Err(e) => {
			warn!("failed to read from cmd channel: {}", e);
			router.peripheral_close(id);
			Err(e.into())
		}
	}
}

fn scan_sysfs(router: &mut Router) {
	let entries = match fs::read_dir(RPMSG_SYS_DEVICES) {
		Ok(entries) => entries,
		Err(e) => {
			debug!("no rpmsg bus: {}", e);
			return;
		}
	};

	for entry in entries.flatten() {
		let dir: PathBuf = entry.path();
		let Some(devname) = devname_from_uevent(&dir) else {
			continue;
		};
		let Some(name) = read_attr(&dir, "name") else {
			continue;
		};
		let Some(rproc) = find_remoteproc(&dir) else {
			continue;
		};

		let devnode = format!("/dev/{}", devname);
		devnode_add(router, devnode, name.clone(), rproc.clone());
		peripheral_create(router, &rproc, &name);
	}
}

/// Parsed kobject uevent of interest.
struct Uevent {
	action: String,
	devpath: String,
	subsystem: String,
	devname: String,
}

fn parse_uevent(buf: &[u8]) -> Option<Uevent> {
	let mut action = None;
	let mut devpath = None;
	let mut subsystem = None;
	let mut devname = None;

	for field in buf.split(|&b| b == 0) {
		let field = std::str::from_utf8(field).ok()?;
		if let Some((key, value)) = field.split_once('=') {
			match key {
				"ACTION" => action = Some(value.to_owned()),
				"DEVPATH" => devpath = Some(value.to_owned()),
				"SUBSYSTEM" => subsystem = Some(value.to_owned()),
				"DEVNAME" => devname = Some(value.to_owned()),
				_ => {}
			}
		}
	}

	Some(Uevent {
		action: action?,
		devpath: devpath?,
		subsystem: subsystem?,
		devname: devname?,
	})
}

pub fn uevent_ready(router: &mut Router, fd: RawFd) -> Result<()> {
	let mut buf = [0u8; 4096];

	loop {
		let n = match fd_read(fd, &mut buf) {
			Ok(0) => return Ok(()),
			Ok(n) => n,
			Err(nix::errno::Errno::EAGAIN) => return Ok(()),
			Err(nix::errno::Errno::ENOBUFS) => continue,
			Err(e) => {
				warn!("uevent read failed: {}", e);
				return Err(e.into());
			}
		};

		let Some(event) = parse_uevent(&buf[..n]) else {
			continue;
		};
		if event.subsystem != "rpmsg" {
			continue;
		}

		let devnode = format!("/dev/{}", event.devname);
		match event.action.as_str() {
			"add" => {
				let sys_dir = Path::new("/sys").join(event.devpath.trim_start_matches('/'));
				let Some(name) = read_attr(&sys_dir, "name") else {
					continue;
				};
				let Some(rproc) = find_remoteproc(&sys_dir) else {
					continue;
				};
				devnode_add(router, devnode, name.clone(), rproc.clone());
				peripheral_create(router, &rproc, &name);
			}
			"remove" => devnode_remove(router, &devnode),
			other => debug!("unknown uevent action {}", other),
		}
	}
}

fn open_monitor() -> io::Result<OwnedFd> {
	let fd = socket(
		AddressFamily::Netlink,
		SockType::Datagram,
		SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
		SockProtocol::NetlinkKObjectUEvent,
	)
	.map_err(io::Error::from)?;

	// group 1 carries the kernel uevent broadcast
	let addr = NetlinkAddr::new(0, 1);
	bind(fd.as_raw_fd(), &addr).map_err(io::Error::from)?;

	Ok(fd)
}

pub fn init(router: &mut Router) {
	match open_monitor() {
		Ok(fd) => {
			router.watch.add_read(fd.as_raw_fd(), ReadSource::Uevent, None);
			router.uevent_monitor = Some(fd);
		}
		Err(e) => warn!("uevent monitor unavailable: {}", e),
	}

	scan_sysfs(router);
}
