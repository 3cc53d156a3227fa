//! User-space router for the Qualcomm DIAG protocol.
//!
//! One host-side diagnostic endpoint (TCP, UART, USB functionfs or UNIX
//! seqpacket) is multiplexed against the on-chip peripheral processors that
//! expose DIAG data, control and command channels over QIPCRTR sockets or
//! rpmsg character devices. Commands from the host are dispatched to the
//! owning peripheral or answered locally; log, event and message records
//! from the peripherals are broadcast to every attached host client.

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod app_cmds;
pub mod cntl;
pub mod common_cmds;
pub mod dm;
pub mod error;
pub mod hdlc;
pub mod logging;
pub mod masks;
pub mod mbuf;
pub mod peripheral;
pub mod router;
pub mod transport;
pub mod watch;
pub mod wire;

pub use crate::router::Router;

pub const DEFAULT_SOCKET_PORT: u16 = 2500;
pub const DEFAULT_BAUD_RATE: u32 = 115200;
