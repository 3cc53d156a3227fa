use thiserror::Error;

/// DIAG error-response status codes, as sent back to the host client.
pub const DIAG_CMD_RSP_BAD_COMMAND: u8 = 0x13;
pub const DIAG_CMD_RSP_BAD_PARAMS: u8 = 0x14;
pub const DIAG_CMD_RSP_BAD_LENGTH: u8 = 0x15;

#[derive(Debug, Error)]
pub enum RouterError {
	#[error("no handler for command")]
	NotFound,
	#[error("invalid parameters")]
	BadParams,
	#[error("wrong packet length")]
	WrongSize,
	#[error("truncated control packet")]
	Truncated,
	#[error("transport error: {0}")]
	Transport(#[from] std::io::Error),
	#[error("os error: {0}")]
	Os(#[from] nix::errno::Errno),
}

impl RouterError {
	/// On-wire status byte for errors that produce a DIAG error response.
	pub fn response_code(&self) -> Option<u8> {
		match self {
			RouterError::NotFound => Some(DIAG_CMD_RSP_BAD_COMMAND),
			RouterError::BadParams => Some(DIAG_CMD_RSP_BAD_PARAMS),
			RouterError::WrongSize => Some(DIAG_CMD_RSP_BAD_LENGTH),
			_ => None,
		}
	}
}

pub type Result<T> = std::result::Result<T, RouterError>;
