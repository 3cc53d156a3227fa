//! Diagnostic Monitor registry.
//!
//! A DM is a host client attached to the router: the TCP or UART peer, a
//! UNIX socket connection or the USB host. Clients start disabled; outbound
//! traffic to a disabled client is dropped without error.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use crate::error::Result;
use crate::hdlc;
use crate::mbuf::WriteQueue;
use crate::router::{ClientId, Router};
use crate::watch::{QueueRef, ReadSource, WatchFlow, fd_read};

pub struct Client {
	pub name: String,
	pub in_fd: Option<Rc<OwnedFd>>,
	pub out_fd: Rc<OwnedFd>,
	pub hdlc_encoded: bool,
	pub enabled: bool,
	pub decoder: hdlc::Decoder,
	pub outq: WriteQueue,
}

impl Client {
	/// Enqueue one message, respecting the client's framing. A no-op for
	/// disabled clients.
	pub fn send(&mut self, msg: &[u8], flow: Option<&WatchFlow>) {
		if !self.enabled {
			return;
		}

		if self.hdlc_encoded {
			self.outq.push_hdlc(msg, flow.cloned());
		} else {
			self.outq.push(msg, flow.cloned());
		}
	}
}

impl Router {
	/// Register a new DM. The input fd (when present) joins the read set;
	/// the output fd drains the client's queue.
	pub fn add_client(
		&mut self,
		name: &str,
		in_fd: Option<Rc<OwnedFd>>,
		out_fd: Rc<OwnedFd>,
		hdlc_encoded: bool,
	) -> ClientId {
		let id = self.alloc_client_id();

		if let Some(ref fd) = in_fd {
			self.watch
				.add_read(fd.as_raw_fd(), ReadSource::Client(id), None);
		}
		self.watch
			.add_queue(out_fd.as_raw_fd(), QueueRef::ClientOut(id));

		debug!("[{}] new client", name);

		self.clients.insert(
			id,
			Client {
				name: name.to_owned(),
				in_fd,
				out_fd,
				hdlc_encoded,
				enabled: false,
				decoder: hdlc::Decoder::new(),
				outq: WriteQueue::new(),
			},
		);

		id
	}

	pub fn enable_client(&mut self, id: ClientId) {
		if let Some(client) = self.clients.get_mut(&id) {
			client.enabled = true;
		}
	}

	/// Disabling authorizes discarding anything still queued.
	pub fn disable_client(&mut self, id: ClientId) {
		if let Some(client) = self.clients.get_mut(&id) {
			client.enabled = false;
			client.outq.purge();
		}
	}

	pub fn remove_client(&mut self, id: ClientId) {
		if let Some(client) = self.clients.remove(&id) {
			debug!("[{}] client removed", client.name);
			if let Some(ref fd) = client.in_fd {
				self.watch.remove_fd(fd.as_raw_fd());
			}
			self.watch.remove_fd(client.out_fd.as_raw_fd());
		}
	}

	pub fn dm_send(&mut self, id: ClientId, msg: &[u8]) {
		if let Some(client) = self.clients.get_mut(&id) {
			client.send(msg, None);
		}
	}

	/// Send `msg` to every registered DM, charging `flow` for each copy.
	pub fn dm_broadcast(&mut self, msg: &[u8], flow: Option<&WatchFlow>) {
		for client in self.clients.values_mut() {
			client.send(msg, flow);
		}
	}

	/// Read and handle whatever `fd` has for this client. EOF and transport
	/// errors remove the client.
	pub fn client_recv(&mut self, id: ClientId, fd: RawFd) -> Result<()> {
		let Some(client) = self.clients.get(&id) else {
			return Ok(());
		};
		let hdlc_encoded = client.hdlc_encoded;
		let mut buf = [0u8; 4096];

		loop {
			let n = match fd_read(fd, &mut buf) {
				Ok(0) => {
					self.remove_client(id);
					return Ok(());
				}
				Ok(n) => n,
				Err(nix::errno::Errno::EAGAIN) => return Ok(()),
				Err(e) => {
					let name = self
						.clients
						.get(&id)
						.map_or("?", |c| c.name.as_str())
						.to_owned();
					warn!("[{}] read failed: {}", name, e);
					self.remove_client(id);
					return Err(e.into());
				}
			};

			if hdlc_encoded {
				let Some(client) = self.clients.get_mut(&id) else {
					return Ok(());
				};
				let frames = client.decoder.decode(&buf[..n]);
				for frame in frames {
					self.handle_command(id, &frame);
				}
			} else {
				self.handle_command(id, &buf[..n]);
			}
		}
	}
}
