use std::process::ExitCode;

use clap::Parser;
use log::{error, warn};

use diag_router::{DEFAULT_BAUD_RATE, DEFAULT_SOCKET_PORT, Router, logging, transport, watch};

/// User space application for the diag interface.
#[derive(Parser)]
#[command(name = "diag", disable_version_flag = true)]
struct Args {
	/// Socket address of the host to connect to
	#[arg(short = 's', value_name = "address[:port]", conflicts_with = "uart")]
	socket: Option<String>,

	/// UART device to serve the host on
	#[arg(short = 'u', value_name = "device[@baudrate]")]
	uart: Option<String>,
}

fn parse_socket_arg(spec: &str) -> Option<(&str, u16)> {
	match spec.split_once(':') {
		Some((host, port)) => Some((host, port.parse().ok()?)),
		None => Some((spec, DEFAULT_SOCKET_PORT)),
	}
}

fn parse_uart_arg(spec: &str) -> Option<(&str, u32)> {
	match spec.split_once('@') {
		Some((dev, baud)) => Some((dev, baud.parse().ok()?)),
		None => Some((spec, DEFAULT_BAUD_RATE)),
	}
}

fn main() -> ExitCode {
	logging::init();
	let args = Args::parse();

	let mut router = match Router::new() {
		Ok(router) => router,
		Err(e) => {
			error!("failed to initialize reactor: {}", e);
			return ExitCode::FAILURE;
		}
	};

	if let Some(ref spec) = args.socket {
		let Some((host, port)) = parse_socket_arg(spec) else {
			error!("invalid socket address {}", spec);
			return ExitCode::FAILURE;
		};
		if let Err(e) = transport::socket::connect(&mut router, host, port) {
			error!("failed to connect to client: {}", e);
			return ExitCode::FAILURE;
		}
	} else if let Some(ref spec) = args.uart {
		let Some((dev, baudrate)) = parse_uart_arg(spec) else {
			error!("invalid uart device {}", spec);
			return ExitCode::FAILURE;
		};
		if let Err(e) = transport::uart::open(&mut router, dev, baudrate) {
			error!("failed to open uart: {}", e);
			return ExitCode::FAILURE;
		}
	}

	if let Err(e) = transport::usb::open(&mut router, "/dev/ffs-diag") {
		warn!("failed to open usb endpoint: {}", e);
	}

	if let Err(e) = transport::unix::open(&mut router) {
		error!("failed to create unix socket dm: {}", e);
		return ExitCode::FAILURE;
	}

	router.peripheral_init();

	router.register_app_cmds();
	router.register_common_cmds();

	watch::run(&mut router);

	ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn socket_arg_defaults_port() {
		assert_eq!(parse_socket_arg("10.0.0.1"), Some(("10.0.0.1", 2500)));
		assert_eq!(parse_socket_arg("host:2800"), Some(("host", 2800)));
		assert_eq!(parse_socket_arg("host:x"), None);
	}

	#[test]
	fn uart_arg_defaults_baudrate() {
		assert_eq!(
			parse_uart_arg("/dev/ttyMSM0"),
			Some(("/dev/ttyMSM0", 115200))
		);
		assert_eq!(
			parse_uart_arg("/dev/ttyMSM0@9600"),
			Some(("/dev/ttyMSM0", 9600))
		);
		assert_eq!(parse_uart_arg("/dev/tty@fast"), None);
	}
}
