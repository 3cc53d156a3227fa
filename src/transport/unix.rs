//! Abstract UNIX seqpacket listener.
//!
//! Every accepted connection becomes a raw (non-HDLC) client, enabled
//! immediately.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use nix::sys::socket::{
	AddressFamily, Backlog, SockFlag, SockType, UnixAddr, accept4, bind, listen, socket,
};

use crate::error::Result;
use crate::router::Router;
use crate::watch::ReadSource;

const SOCKET_NAME: &[u8] = b"diag";

pub fn open(router: &mut Router) -> Result<()> {
	let fd = socket(
		AddressFamily::Unix,
		SockType::SeqPacket,
		SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
		None,
	)?;

	let addr = UnixAddr::new_abstract(SOCKET_NAME)?;
	bind(fd.as_raw_fd(), &addr)?;
	listen(&fd, Backlog::new(2)?)?;

	router.watch.add_read(fd.as_raw_fd(), ReadSource::UnixListener, None);
	router.unix_listener = Some(fd);

	Ok(())
}

pub fn accept_ready(router: &mut Router, fd: RawFd) -> Result<()> {
	loop {
		let client = match accept4(fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
			Ok(client) => client,
			Err(nix::errno::Errno::EAGAIN) => return Ok(()),
			Err(e) => {
				warn!("failed to accept: {}", e);
				return Ok(());
			}
		};

		let client: Rc<OwnedFd> = Rc::new(unsafe { OwnedFd::from_raw_fd(client) });
		let id = router.add_client("UNIX", Some(client.clone()), client, false);
		router.enable_client(id);
	}
}
