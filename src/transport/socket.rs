//! TCP host client.

use std::net::TcpStream;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use crate::error::Result;
use crate::router::Router;

pub fn connect(router: &mut Router, host: &str, port: u16) -> Result<()> {
	let stream = TcpStream::connect((host, port))?;
	stream.set_nonblocking(true)?;

	info!("connected to {}:{}", host, port);

	let fd: Rc<OwnedFd> = Rc::new(stream.into());
	let id = router.add_client("DIAG CLIENT", Some(fd.clone()), fd, true);
	router.enable_client(id);

	Ok(())
}
