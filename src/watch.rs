//! Single-threaded reactor.
//!
//! One poll loop drives every file descriptor in the process: readable fds
//! registered with [`Watch::add_read`], write queues registered with
//! [`Watch::add_queue`], millisecond timers and quit hooks. Handlers run to
//! completion on the loop thread; nothing here blocks except the poll itself.
//!
//! Back-pressure: a read watch may carry a [`WatchFlow`] token counting the
//! packets queued downstream on its behalf. While the token sits above the
//! watermark the fd is left out of the poll set, so a slow host client stops
//! the peripheral feed instead of growing the router's memory.

use std::cell::Cell;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::error::Result;
use crate::router::{ClientId, PerifId, Router};

const FLOW_WATERMARK: u32 = 10;

/// Shared outstanding-packet counter for one peripheral.
#[derive(Clone, Default)]
pub struct WatchFlow(Rc<Cell<u32>>);

impl WatchFlow {
	pub fn new() -> Self {
		WatchFlow::default()
	}

	pub fn inc(&self) {
		self.0.set(self.0.get() + 1);
	}

	pub fn dec(&self) {
		let count = self.0.get();
		if count == 0 {
			warn!("unbalanced flow control");
		} else {
			self.0.set(count - 1);
		}
	}

	pub fn blocked(&self) -> bool {
		self.0.get() > FLOW_WATERMARK
	}

	pub fn count(&self) -> u32 {
		self.0.get()
	}
}

/// What a readable fd means to the router.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadSource {
	Client(ClientId),
	UnixListener,
	UsbEp0,
	Uevent,
	QrtrCntl(PerifId),
	QrtrCmd(PerifId),
	QrtrData(PerifId),
	RpmsgCntl(PerifId),
	RpmsgCmd(PerifId),
	RpmsgData(PerifId),
}

/// Which write queue a registered fd drains.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueueRef {
	ClientOut(ClientId),
	PerifCntl(PerifId),
	PerifData(PerifId),
	PerifCmd(PerifId),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerEvent {
	OpenRpmsgPeripheral(PerifId),
}

struct ReadWatch {
	fd: RawFd,
	source: ReadSource,
	flow: Option<WatchFlow>,
}

struct QueueWatch {
	fd: RawFd,
	queue: QueueRef,
}

struct Timer {
	event: TimerEvent,
	interval: Duration,
	deadline: Instant,
	repeat: bool,
}

#[derive(Clone, Copy)]
enum Slot {
	Wakeup,
	Read(RawFd, ReadSource),
	Queue(RawFd, QueueRef),
}

pub struct Watch {
	reads: Vec<ReadWatch>,
	queues: Vec<QueueWatch>,
	timers: Vec<Timer>,
	quit_hooks: Vec<fn(&mut Router)>,
	quit: bool,
	wakeup: EventFd,
}

impl Watch {
	pub fn new() -> Result<Self> {
		let wakeup =
			EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
		Ok(Watch {
			reads: Vec::new(),
			queues: Vec::new(),
			timers: Vec::new(),
			quit_hooks: Vec::new(),
			quit: false,
			wakeup,
		})
	}

	pub fn add_read(&mut self, fd: RawFd, source: ReadSource, flow: Option<WatchFlow>) {
		self.reads.push(ReadWatch { fd, source, flow });
	}

	pub fn add_queue(&mut self, fd: RawFd, queue: QueueRef) {
		self.queues.push(QueueWatch { fd, queue });
	}

	/// Drop every registration for `fd`. Idempotent.
	pub fn remove_fd(&mut self, fd: RawFd) {
		self.reads.retain(|w| w.fd != fd);
		self.queues.retain(|w| w.fd != fd);
	}

	pub fn remove_read(&mut self, fd: RawFd) {
		self.reads.retain(|w| w.fd != fd);
	}

	pub fn remove_queue(&mut self, queue: QueueRef) {
		self.queues.retain(|w| w.queue != queue);
	}

	fn has_read(&self, fd: RawFd, source: ReadSource) -> bool {
		self.reads.iter().any(|w| w.fd == fd && w.source == source)
	}

	fn has_queue(&self, fd: RawFd, queue: QueueRef) -> bool {
		self.queues.iter().any(|w| w.fd == fd && w.queue == queue)
	}

	/// The read watches that may enter the poll set: everything whose flow
	/// token is not above the watermark.
	pub fn read_set(&self) -> Vec<(RawFd, ReadSource)> {
		self.reads
			.iter()
			.filter(|w| !w.flow.as_ref().is_some_and(WatchFlow::blocked))
			.map(|w| (w.fd, w.source))
			.collect()
	}

	fn queue_set(&self) -> Vec<(RawFd, QueueRef)> {
		self.queues.iter().map(|w| (w.fd, w.queue)).collect()
	}

	pub fn add_timer(&mut self, event: TimerEvent, interval_ms: u64, repeat: bool) {
		let interval = Duration::from_millis(interval_ms);
		self.timers.push(Timer {
			event,
			interval,
			deadline: Instant::now() + interval,
			repeat,
		});
	}

	/// Poll timeout in milliseconds until the soonest timer, -1 for none.
	fn next_timeout(&self, now: Instant) -> i32 {
		self.timers
			.iter()
			.map(|t| t.deadline.saturating_duration_since(now).as_millis())
			.min()
			.map_or(-1, |ms| ms.min(i32::MAX as u128) as i32)
	}

	/// Expired timer events in ascending deadline order. Repeating timers
	/// re-arm, one-shots are destroyed.
	fn due_timers(&mut self, now: Instant) -> Vec<TimerEvent> {
		let mut due: Vec<(Instant, TimerEvent)> = self
			.timers
			.iter()
			.filter(|t| t.deadline <= now)
			.map(|t| (t.deadline, t.event))
			.collect();
		due.sort_by_key(|&(deadline, _)| deadline);

		for timer in &mut self.timers {
			if timer.deadline <= now && timer.repeat {
				timer.deadline = now + timer.interval;
			}
		}
		self.timers.retain(|t| t.deadline > now || t.repeat);

		due.into_iter().map(|(_, event)| event).collect()
	}

	pub fn add_quit(&mut self, hook: fn(&mut Router)) {
		self.quit_hooks.push(hook);
	}

	/// Flag shutdown and interrupt the poll.
	pub fn quit(&mut self) {
		self.quit = true;
		let _ = fd_write(self.wakeup.as_fd().as_raw_fd(), &1u64.to_ne_bytes());
	}
}

/// Reactor main loop. Returns after [`Watch::quit`], once every quit hook
/// has run.
pub fn run(router: &mut Router) {
	while !router.watch.quit {
		let mut pfds: Vec<libc::pollfd> = Vec::new();
		let mut slots: Vec<Slot> = Vec::new();

		let wake_fd = router.watch.wakeup.as_fd().as_raw_fd();
		pfds.push(pollfd(wake_fd, libc::POLLIN));
		slots.push(Slot::Wakeup);

		for (fd, source) in router.watch.read_set() {
			pfds.push(pollfd(fd, libc::POLLIN));
			slots.push(Slot::Read(fd, source));
		}

		for (fd, queue) in router.watch.queue_set() {
			if router.queue_len(queue) > 0 {
				pfds.push(pollfd(fd, libc::POLLOUT));
				slots.push(Slot::Queue(fd, queue));
			}
		}

		let now = Instant::now();
		let timeout = router.watch.next_timeout(now);

		let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout) };
		if ret < 0 {
			let errno = Errno::last();
			if errno == Errno::EINTR {
				continue;
			}
			warn!("poll failed: {}", errno);
			break;
		}

		for event in router.watch.due_timers(Instant::now()) {
			router.handle_timer(event);
		}

		let ready: Vec<Slot> = pfds
			.iter()
			.zip(slots.iter())
			.filter(|(pfd, _)| pfd.revents != 0)
			.map(|(_, &slot)| slot)
			.collect();

		for slot in ready {
			match slot {
				Slot::Wakeup => {
					let mut buf = [0u8; 8];
					let _ = fd_read(wake_fd, &mut buf);
				}
				// Handlers may have removed a registration earlier in this
				// batch; re-validate before dispatching.
				Slot::Read(fd, source) => {
					if router.watch.has_read(fd, source) {
						router.handle_read_event(source, fd);
					}
				}
				Slot::Queue(fd, queue) => {
					if router.watch.has_queue(fd, queue) {
						router.flush_queue(fd, queue);
					}
				}
			}
		}
	}

	let hooks = std::mem::take(&mut router.watch.quit_hooks);
	for hook in hooks {
		hook(router);
	}
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
	libc::pollfd {
		fd,
		events,
		revents: 0,
	}
}

pub fn fd_read(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
	let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
	Errno::result(n).map(|n| n as usize)
}

pub fn fd_write(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
	let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
	Errno::result(n).map(|n| n as usize)
}
