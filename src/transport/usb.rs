//! USB functionfs gadget endpoint.
//!
//! The gadget side of the DIAG interface: descriptors and strings go down
//! ep0, the host reads log traffic from the bulk-in endpoint and writes
//! commands to bulk-out. The host client is toggled by FUNCTIONFS_ENABLE and
//! FUNCTIONFS_DISABLE events on ep0.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::rc::Rc;

use num_enum::TryFromPrimitive;

use crate::error::{Result, RouterError};
use crate::router::{ClientId, Router};
use crate::watch::{ReadSource, fd_read, fd_write};
use crate::wire::Writer;

const USB_FFS_EP0_NAME: &str = "ep0";
const USB_FFS_OUT_NAME: &str = "ep1";
const USB_FFS_IN_NAME: &str = "ep2";

const FUNCTIONFS_DESCRIPTORS_MAGIC_V2: u32 = 3;
const FUNCTIONFS_STRINGS_MAGIC: u32 = 2;
const FUNCTIONFS_HAS_FS_DESC: u32 = 1;
const FUNCTIONFS_HAS_HS_DESC: u32 = 2;
const FUNCTIONFS_HAS_SS_DESC: u32 = 4;

const USB_DT_INTERFACE: u8 = 4;
const USB_DT_ENDPOINT: u8 = 5;
const USB_DT_SS_ENDPOINT_COMP: u8 = 0x30;
const USB_CLASS_VENDOR_SPEC: u8 = 0xff;
const USB_ENDPOINT_XFER_BULK: u8 = 2;
const USB_DIR_IN: u8 = 0x80;

const USB_PROTOCOL_DIAG: u8 = 0x30;
const INTERFACE_STRING: &str = "Diag interface";

#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
enum FfsEvent {
	Bind = 0,
	Unbind = 1,
	Enable = 2,
	Disable = 3,
	Setup = 4,
	Suspend = 5,
	Resume = 6,
}

pub struct UsbEndpoint {
	ep0: OwnedFd,
	bulk_out: OwnedFd,
	client: ClientId,
}

fn interface_descriptor(w: &mut Writer) {
	w.u8(9)
		.u8(USB_DT_INTERFACE)
		.u8(0) // bInterfaceNumber
		.u8(0) // bAlternateSetting
		.u8(2) // bNumEndpoints
		.u8(USB_CLASS_VENDOR_SPEC)
		.u8(USB_CLASS_VENDOR_SPEC)
		.u8(USB_PROTOCOL_DIAG)
		.u8(1); // iInterface
}

fn endpoint_descriptor(w: &mut Writer, address: u8, max_packet: u16) {
	w.u8(7)
		.u8(USB_DT_ENDPOINT)
		.u8(address)
		.u8(USB_ENDPOINT_XFER_BULK)
		.u16_le(max_packet)
		.u8(0); // bInterval
}

fn ss_companion(w: &mut Writer) {
	w.u8(6).u8(USB_DT_SS_ENDPOINT_COMP).u8(0).u8(0).u16_le(0);
}

/// FS/HS/SS descriptor set: one vendor-specific interface with a bulk
/// endpoint pair.
fn descriptors() -> Vec<u8> {
	let mut body = Writer::new();

	// full speed
	interface_descriptor(&mut body);
	endpoint_descriptor(&mut body, 1, 64);
	endpoint_descriptor(&mut body, 2 | USB_DIR_IN, 64);
	// high speed
	interface_descriptor(&mut body);
	endpoint_descriptor(&mut body, 1, 512);
	endpoint_descriptor(&mut body, 2 | USB_DIR_IN, 512);
	// super speed
	interface_descriptor(&mut body);
	endpoint_descriptor(&mut body, 1, 1024);
	ss_companion(&mut body);
	endpoint_descriptor(&mut body, 2 | USB_DIR_IN, 1024);
	ss_companion(&mut body);

	let body = body.into_vec();
	let mut w = Writer::with_capacity(24 + body.len());
	w.u32_le(FUNCTIONFS_DESCRIPTORS_MAGIC_V2)
		.u32_le(24 + body.len() as u32)
		.u32_le(FUNCTIONFS_HAS_FS_DESC | FUNCTIONFS_HAS_HS_DESC | FUNCTIONFS_HAS_SS_DESC)
		.u32_le(3) // fs descriptor count
		.u32_le(3) // hs descriptor count
		.u32_le(5) // ss descriptor count
		.bytes(&body);
	w.into_vec()
}

fn strings() -> Vec<u8> {
	let lang0_len = 2 + INTERFACE_STRING.len() + 1;
	let mut w = Writer::with_capacity(16 + lang0_len);
	w.u32_le(FUNCTIONFS_STRINGS_MAGIC)
		.u32_le((16 + lang0_len) as u32)
		.u32_le(1) // string count
		.u32_le(1) // language count
		.u16_le(0x0409) // en-us
		.cstr(INTERFACE_STRING);
	w.into_vec()
}

fn open_ep(dir: &Path, name: &str, nonblock: bool) -> io::Result<OwnedFd> {
	let mut options = OpenOptions::new();
	options.read(true).write(true);
	if nonblock {
		options.custom_flags(libc::O_NONBLOCK);
	}
	Ok(options.open(dir.join(name))?.into())
}

fn write_all(fd: RawFd, buf: &[u8]) -> Result<()> {
	let n = fd_write(fd, buf)?;
	if n != buf.len() {
		return Err(RouterError::Transport(io::Error::other(
			"short write on ep0",
		)));
	}
	Ok(())
}

pub fn open(router: &mut Router, ffs_dir: &str) -> Result<()> {
	let dir = Path::new(ffs_dir);

	let ep0 = open_ep(dir, USB_FFS_EP0_NAME, false)?;
	write_all(ep0.as_raw_fd(), &descriptors())?;
	write_all(ep0.as_raw_fd(), &strings())?;

	let bulk_out = open_ep(dir, USB_FFS_OUT_NAME, true)?;
	let bulk_in = open_ep(dir, USB_FFS_IN_NAME, true)?;

	// host side of the bulk pair; input only joins the read set on
	// FUNCTIONFS_ENABLE
	let client = router.add_client("USB client", None, Rc::new(bulk_in), true);

	router
		.watch
		.add_read(ep0.as_raw_fd(), ReadSource::UsbEp0, None);
	router.usb = Some(UsbEndpoint {
		ep0,
		bulk_out,
		client,
	});

	Ok(())
}

pub fn ep0_ready(router: &mut Router, fd: RawFd) -> Result<()> {
	let mut event = [0u8; 12];
	let n = match fd_read(fd, &mut event) {
		Ok(n) => n,
		Err(nix::errno::Errno::EAGAIN) => return Ok(()),
		Err(e) => {
			warn!("failed to read ffs ep0: {}", e);
			return Err(e.into());
		}
	};
	if n < event.len() {
		warn!("short ffs ep0 event");
		return Ok(());
	}

	let Some(usb) = router.usb.as_ref() else {
		return Ok(());
	};
	let client = usb.client;
	let bulk_out = usb.bulk_out.as_raw_fd();

	match FfsEvent::try_from(event[8]) {
		Ok(FfsEvent::Enable) => {
			debug!("usb endpoint enabled");
			router.watch.remove_read(bulk_out);
			router
				.watch
				.add_read(bulk_out, ReadSource::Client(client), None);
			router.enable_client(client);
		}
		Ok(FfsEvent::Disable) => {
			debug!("usb endpoint disabled");
			router.disable_client(client);
		}
		Ok(other) => debug!("ffs event {:?}", other),
		Err(_) => warn!("unknown ffs event {}", event[8]),
	}

	Ok(())
}
