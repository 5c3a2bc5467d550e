use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Errors surfaced by modem operations.
pub enum ModemError {
    /// No matching reply arrived before the timeout, after all retries.
    Timeout,
    /// The modem answered with `ERROR`, `NO CARRIER` or a socket level failure.
    Io,
    /// The modem answered with `+CME ERROR: <code>` or `+CMS ERROR: <code>`.
    CmeError(u16),
    /// A received payload could not be queued and was discarded.
    NoBuffers,
    /// The request can't be expressed as a valid command.
    InvalidArgument,
    /// All socket slots are in use.
    NoSockets,
    /// The socket isn't connected, or the peer closed it.
    NotConnected,
    /// The socket handle doesn't refer to an open socket.
    NotFound,
    /// Writing to the serial transport failed.
    Transport,
}
impl ModemError {
    /// Check if the modem itself rejected the command.
    ///
    /// These are never retried, since the modem is responsive.
    pub const fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Io | Self::CmeError(_))
    }
}
impl fmt::Display for ModemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out waiting for the modem"),
            Self::Io => f.write_str("modem reported an error"),
            Self::CmeError(code) => write!(f, "modem reported error code {code}"),
            Self::NoBuffers => f.write_str("no buffers available"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::NoSockets => f.write_str("no free socket slots"),
            Self::NotConnected => f.write_str("socket not connected"),
            Self::NotFound => f.write_str("no such socket"),
            Self::Transport => f.write_str("serial transport error"),
        }
    }
}

pub type ModemResult<T> = Result<T, ModemError>;
