//! QIPCRTR socket transport.
//!
//! Each peripheral owns four datagram sockets on the Qualcomm IPC router
//! address family: control, data, command and DCI command. The control, data
//! and DCI sockets are published to the name service under the DIAG service
//! id; the command socket looks the peripheral's command server up instead.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use num_enum::TryFromPrimitive;

use crate::cntl;
use crate::error::Result;
use crate::peripheral::{self, Link, LinkOps, Peripheral};
use crate::router::{PerifId, Router};
use crate::watch::{QueueRef, ReadSource};
use crate::wire::{Reader, Writer};

const AF_QIPCRTR: libc::c_int = 42;
const QRTR_PORT_CTRL: u32 = 0xffff_fffe;

const DIAG_SERVICE_ID: u32 = 4097;

const DIAG_INSTANCE_BASE_MODEM: u32 = 0;
const DIAG_INSTANCE_BASE_LPASS: u32 = 64;
const DIAG_INSTANCE_BASE_WCNSS: u32 = 128;
const DIAG_INSTANCE_BASE_SENSORS: u32 = 192;
const DIAG_INSTANCE_BASE_CDSP: u32 = 256;
const DIAG_INSTANCE_BASE_WDSP: u32 = 320;

const DIAG_INSTANCE_CNTL: u32 = 0;
const DIAG_INSTANCE_CMD: u32 = 1;
const DIAG_INSTANCE_DATA: u32 = 2;
const DIAG_INSTANCE_DCI: u32 = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u32)]
enum QrtrType {
	Data = 1,
	Hello = 2,
	Bye = 3,
	NewServer = 4,
	DelServer = 5,
	DelClient = 6,
	NewLookup = 10,
}

pub struct QrtrLink {
	pub instance_base: u32,
}

impl LinkOps for QrtrLink {
	fn uses_sockets(&self) -> bool {
		true
	}
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrQrtr {
	sq_family: libc::sa_family_t,
	sq_node: u32,
	sq_port: u32,
}

fn qrtr_socket() -> io::Result<OwnedFd> {
	let fd = unsafe {
		libc::socket(
			AF_QIPCRTR,
			libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
			0,
		)
	};
	if fd < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn local_addr(fd: RawFd) -> io::Result<(u32, u32)> {
	let mut addr: SockaddrQrtr = unsafe { mem::zeroed() };
	let mut len = mem::size_of::<SockaddrQrtr>() as libc::socklen_t;
	let ret = unsafe {
		libc::getsockname(fd, (&raw mut addr).cast(), &mut len)
	};
	if ret < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok((addr.sq_node, addr.sq_port))
}

fn send_to(fd: RawFd, node: u32, port: u32, buf: &[u8]) -> io::Result<()> {
	let addr = SockaddrQrtr {
		sq_family: AF_QIPCRTR as libc::sa_family_t,
		sq_node: node,
		sq_port: port,
	};
	let ret = unsafe {
		libc::sendto(
			fd,
			buf.as_ptr().cast(),
			buf.len(),
			0,
			(&raw const addr).cast(),
			mem::size_of::<SockaddrQrtr>() as libc::socklen_t,
		)
	};
	if ret < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}

fn connect_to(fd: RawFd, node: u32, port: u32) -> io::Result<()> {
	let addr = SockaddrQrtr {
		sq_family: AF_QIPCRTR as libc::sa_family_t,
		sq_node: node,
		sq_port: port,
	};
	let ret = unsafe {
		libc::connect(
			fd,
			(&raw const addr).cast(),
			mem::size_of::<SockaddrQrtr>() as libc::socklen_t,
		)
	};
	if ret < 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}

/// Announce a service instance on this socket to the local name service.
fn publish(fd: RawFd, service: u32, instance: u32) -> io::Result<()> {
	let (node, port) = local_addr(fd)?;
	let mut w = Writer::with_capacity(20);
	w.u32_le(QrtrType::NewServer as u32)
		.u32_le(service)
		.u32_le(instance)
		.u32_le(node)
		.u32_le(port);
	send_to(fd, node, QRTR_PORT_CTRL, &w.into_vec())
}

/// Ask the name service to report servers of `service`/`instance`; replies
/// arrive as NEW_SERVER control messages on this socket.
fn new_lookup(fd: RawFd, service: u32, instance: u32) -> io::Result<()> {
	let (node, _) = local_addr(fd)?;
	let mut w = Writer::with_capacity(20);
	w.u32_le(QrtrType::NewLookup as u32)
		.u32_le(service)
		.u32_le(instance)
		.u32_le(0)
		.u32_le(0);
	send_to(fd, node, QRTR_PORT_CTRL, &w.into_vec())
}

struct QrtrPacket<'a> {
	ty: QrtrType,
	node: u32,
	port: u32,
	data: &'a [u8],
}

fn recv_from(fd: RawFd, buf: &mut [u8]) -> nix::Result<(usize, SockaddrQrtr)> {
	let mut addr: SockaddrQrtr = unsafe { mem::zeroed() };
	let mut len = mem::size_of::<SockaddrQrtr>() as libc::socklen_t;
	let n = unsafe {
		libc::recvfrom(
			fd,
			buf.as_mut_ptr().cast(),
			buf.len(),
			0,
			(&raw mut addr).cast(),
			&mut len,
		)
	};
	nix::errno::Errno::result(n).map(|n| (n as usize, addr))
}

/// Decode one datagram into {type, sender, payload}. Messages from the
/// control port carry their own type word; everything else is data.
fn decode<'a>(buf: &'a [u8], sender: &SockaddrQrtr) -> Option<QrtrPacket<'a>> {
	if sender.sq_port != QRTR_PORT_CTRL {
		return Some(QrtrPacket {
			ty: QrtrType::Data,
			node: sender.sq_node,
			port: sender.sq_port,
			data: buf,
		});
	}

	let mut r = Reader::new(buf);
	let cmd = r.u32_le().ok()?;
	let ty = QrtrType::try_from(cmd).ok()?;
	match ty {
		QrtrType::NewServer | QrtrType::DelServer => {
			let _service = r.u32_le().ok()?;
			let _instance = r.u32_le().ok()?;
			let node = r.u32_le().ok()?;
			let port = r.u32_le().ok()?;
			Some(QrtrPacket { ty, node, port, data: &[] })
		}
		QrtrType::DelClient => {
			let node = r.u32_le().ok()?;
			let port = r.u32_le().ok()?;
			Some(QrtrPacket { ty, node, port, data: &[] })
		}
		_ => Some(QrtrPacket {
			ty,
			node: sender.sq_node,
			port: sender.sq_port,
			data: &[],
		}),
	}
}

/// Receive and decode, mapping ENETRESET to a quiet failure that drops the
/// read watch.
fn recv_packet(name: &str, fd: RawFd, buf: &mut [u8]) -> Result<(usize, SockaddrQrtr)> {
	match recv_from(fd, buf) {
		Ok(ok) => Ok(ok),
		Err(e) => {
			if e != nix::errno::Errno::ENETRESET {
				warn!("[{}] recvfrom failed: {}", name, e);
			}
			Err(e.into())
		}
	}
}

fn perif_name(router: &Router, id: PerifId) -> String {
	router
		.peripherals
		.get(&id)
		.map_or_else(|| "?".to_owned(), |p| p.name.clone())
}

pub fn cntl_ready(router: &mut Router, id: PerifId, fd: RawFd) -> Result<()> {
	let mut buf = [0u8; 4096];
	let name = perif_name(router, id);
	let (n, sender) = recv_packet(&name, fd, &mut buf)?;
	let Some(pkt) = decode(&buf[..n], &sender) else {
		warn!("[{}] unable to decode qrtr packet", name);
		return Ok(());
	};

	match pkt.ty {
		QrtrType::DelClient => {}
		QrtrType::Data => {
			let connect_needed = router
				.peripherals
				.get(&id)
				.is_some_and(|p| !p.cntl_open);
			if connect_needed {
				let _ = connect_to(fd, pkt.node, pkt.port);
				if let Some(perif) = router.peripherals.get_mut(&id) {
					perif.cntl_open = true;
				}
				router.watch.add_queue(fd, QueueRef::PerifCntl(id));
			}
			let payload = pkt.data.to_vec();
			cntl::recv(router, id, &payload);
		}
		QrtrType::Bye => {
			router.watch.remove_queue(QueueRef::PerifCntl(id));
			if let Some(perif) = router.peripherals.get_mut(&id) {
				perif.cntl_open = false;
			}
		}
		other => {
			warn!(
				"[{}] unhandled CNTL message from {}:{} ({:?})",
				name, pkt.node, pkt.port, other
			);
		}
	}

	Ok(())
}

pub fn cmd_ready(router: &mut Router, id: PerifId, fd: RawFd) -> Result<()> {
	let mut buf = [0u8; 4096];
	let name = perif_name(router, id);
	let (n, sender) = recv_packet(&name, fd, &mut buf)?;
	let Some(pkt) = decode(&buf[..n], &sender) else {
		warn!("[{}] unable to decode qrtr packet", name);
		return Ok(());
	};

	match pkt.ty {
		QrtrType::DelClient => {}
		QrtrType::Data => {
			if let Some(payload) = peripheral::parse_non_hdlc(pkt.data) {
				let payload = payload.to_vec();
				router.dm_broadcast(&payload, None);
			}
		}
		QrtrType::NewServer => {
			if pkt.node == 0 && pkt.port == 0 {
				return Ok(());
			}
			info!("[{}] connecting CMD socket to {}:{}", name, pkt.node, pkt.port);
			if let Err(e) = connect_to(fd, pkt.node, pkt.port) {
				warn!("[{}] failed to connect to {}:{}: {}", name, pkt.node, pkt.port, e);
				return Ok(());
			}
			router.watch.add_queue(fd, QueueRef::PerifCmd(id));
		}
		QrtrType::DelServer => {
			router.watch.remove_queue(QueueRef::PerifCmd(id));
		}
		other => {
			warn!(
				"[{}] unhandled CMD message from {}:{} ({:?})",
				name, pkt.node, pkt.port, other
			);
		}
	}

	Ok(())
}

pub fn data_ready(router: &mut Router, id: PerifId, fd: RawFd) -> Result<()> {
	let mut buf = [0u8; 4096];
	let name = perif_name(router, id);
	let (n, sender) = recv_packet(&name, fd, &mut buf)?;
	let Some(pkt) = decode(&buf[..n], &sender) else {
		warn!("[{}] unable to decode qrtr packet", name);
		return Ok(());
	};

	match pkt.ty {
		QrtrType::DelClient => {}
		QrtrType::Data => {
			let connect_needed = router
				.peripherals
				.get(&id)
				.is_some_and(|p| !p.data_open);
			if connect_needed {
				let _ = connect_to(fd, pkt.node, pkt.port);
				if let Some(perif) = router.peripherals.get_mut(&id) {
					perif.data_open = true;
				}
				router.watch.add_queue(fd, QueueRef::PerifData(id));
			}

			if let Some(payload) = peripheral::parse_non_hdlc(pkt.data) {
				let payload = payload.to_vec();
				let flow = router.peripherals.get(&id).map(|p| p.flow.clone());
				router.dm_broadcast(&payload, flow.as_ref());
			}
		}
		QrtrType::Bye => {
			router.watch.remove_queue(QueueRef::PerifData(id));
			if let Some(perif) = router.peripherals.get_mut(&id) {
				perif.data_open = false;
			}
		}
		other => {
			warn!(
				"[{}] unhandled DATA message from {}:{} ({:?})",
				name, pkt.node, pkt.port, other
			);
		}
	}

	Ok(())
}

fn init_subsystem(router: &mut Router, name: &str, instance_base: u32) -> io::Result<()> {
	let cntl = qrtr_socket()?;
	let data = qrtr_socket()?;
	let cmd = qrtr_socket()?;
	let dci_cmd = qrtr_socket()?;

	publish(cntl.as_raw_fd(), DIAG_SERVICE_ID, instance_base + DIAG_INSTANCE_CNTL)?;
	new_lookup(cmd.as_raw_fd(), DIAG_SERVICE_ID, instance_base + DIAG_INSTANCE_CMD)?;
	publish(data.as_raw_fd(), DIAG_SERVICE_ID, instance_base + DIAG_INSTANCE_DATA)?;
	publish(dci_cmd.as_raw_fd(), DIAG_SERVICE_ID, instance_base + DIAG_INSTANCE_DCI)?;

	let mut perif = Peripheral::new(name, Link::Qrtr(QrtrLink { instance_base }));
	let cntl_raw = cntl.as_raw_fd();
	let data_raw = data.as_raw_fd();
	let cmd_raw = cmd.as_raw_fd();
	perif.cntl_fd = Some(Rc::new(cntl));
	perif.data_fd = Some(Rc::new(data));
	perif.cmd_fd = Some(Rc::new(cmd));
	perif.dci_cmd_fd = Some(Rc::new(dci_cmd));
	let flow = perif.flow.clone();

	let id = router.add_peripheral(perif);
	router.watch.add_read(cntl_raw, ReadSource::QrtrCntl(id), None);
	router.watch.add_read(cmd_raw, ReadSource::QrtrCmd(id), None);
	router.watch.add_read(data_raw, ReadSource::QrtrData(id), Some(flow));

	Ok(())
}

pub fn init(router: &mut Router) {
	let subsystems = [
		("modem", DIAG_INSTANCE_BASE_MODEM),
		("lpass", DIAG_INSTANCE_BASE_LPASS),
		("wcnss", DIAG_INSTANCE_BASE_WCNSS),
		("sensors", DIAG_INSTANCE_BASE_SENSORS),
		("cdsp", DIAG_INSTANCE_BASE_CDSP),
		("wdsp", DIAG_INSTANCE_BASE_WDSP),
	];

	for (name, base) in subsystems {
		if let Err(e) = init_subsystem(router, name, base) {
			warn!("[{}] qrtr transport unavailable: {}", name, e);
			return;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decode_data_from_plain_sender() {
		let sender = SockaddrQrtr {
			sq_family: AF_QIPCRTR as libc::sa_family_t,
			sq_node: 3,
			sq_port: 17,
		};
		let pkt = decode(&[1, 2, 3], &sender).unwrap();
		assert_eq!(pkt.ty, QrtrType::Data);
		assert_eq!((pkt.node, pkt.port), (3, 17));
		assert_eq!(pkt.data, &[1, 2, 3]);
	}

	#[test]
	fn decode_new_server_from_ctrl_port() {
		let sender = SockaddrQrtr {
			sq_family: AF_QIPCRTR as libc::sa_family_t,
			sq_node: 0,
			sq_port: QRTR_PORT_CTRL,
		};
		let mut w = Writer::new();
		w.u32_le(4).u32_le(DIAG_SERVICE_ID).u32_le(65).u32_le(1).u32_le(42);
		let buf = w.into_vec();
		let pkt = decode(&buf, &sender).unwrap();
		assert_eq!(pkt.ty, QrtrType::NewServer);
		assert_eq!((pkt.node, pkt.port), (1, 42));
	}

	#[test]
	fn decode_rejects_garbage_ctrl() {
		let sender = SockaddrQrtr {
			sq_family: AF_QIPCRTR as libc::sa_family_t,
			sq_node: 0,
			sq_port: QRTR_PORT_CTRL,
		};
		assert!(decode(&[0xff, 0xff, 0xff, 0xff], &sender).is_none());
		assert!(decode(&[1], &sender).is_none());
	}
}
