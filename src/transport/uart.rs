//! UART host client.

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::rc::Rc;

use nix::sys::termios::{
	BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
	SpecialCharacterIndices, cfsetispeed, cfsetospeed, tcflush, tcgetattr, tcsetattr,
};

use crate::error::{Result, RouterError};
use crate::router::Router;

fn check_baudrate(baudrate: u32) -> Option<BaudRate> {
	match baudrate {
		9600 => Some(BaudRate::B9600),
		19200 => Some(BaudRate::B19200),
		38400 => Some(BaudRate::B38400),
		115200 => Some(BaudRate::B115200),
		_ => {
			warn!("illegal baud rate {}", baudrate);
			None
		}
	}
}

pub fn open(router: &mut Router, uartname: &str, baudrate: u32) -> Result<()> {
	let rate = check_baudrate(baudrate).ok_or(RouterError::BadParams)?;

	let file = OpenOptions::new()
		.read(true)
		.write(true)
		.custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
		.open(uartname)?;
	let fd: OwnedFd = file.into();

	tcflush(&fd, FlushArg::TCIOFLUSH)?;

	// raw 8N1, modem control lines ignored
	let mut termios = tcgetattr(&fd)?;
	termios.input_flags = InputFlags::empty();
	termios.output_flags = OutputFlags::empty();
	termios.local_flags = LocalFlags::empty();
	termios.control_flags &=
		!(ControlFlags::PARENB | ControlFlags::CSTOPB | ControlFlags::CSIZE);
	termios.control_flags |= ControlFlags::CS8 | ControlFlags::CLOCAL | ControlFlags::CREAD;
	termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
	termios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
	cfsetispeed(&mut termios, rate)?;
	cfsetospeed(&mut termios, rate)?;
	tcsetattr(&fd, SetArg::TCSANOW, &termios)?;

	info!("connected to {}@{}", uartname, baudrate);

	let fd = Rc::new(fd);
	let id = router.add_client("UART client", Some(fd.clone()), fd, true);
	router.enable_client(id);

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn only_supported_baud_rates_pass() {
		assert!(check_baudrate(115200).is_some());
		assert!(check_baudrate(9600).is_some());
		assert!(check_baudrate(57600).is_none());
		assert!(check_baudrate(0).is_none());
	}
}
