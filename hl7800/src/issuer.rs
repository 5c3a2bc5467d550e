//! Serialized command issuing.
//!
//! Only one command may be in flight at a time, since replies carry nothing that identifies the
//! command they belong to. Callers take the [IssuerGuard] first, which owns the write half of the
//! transport. While it is held, the modem is kept awake.

use core::fmt::Write as _;

use embassy_sync::mutex::MutexGuard;
use embassy_time::{with_timeout, Duration, Instant};
use embedded_io_async::Write;

use crate::{
    fmt::printable,
    router::{PendingCommand, Reply},
    socket::SocketHandle,
    ControlLines, DefaultRawMutex, Modem, ModemError, ModemResult, EOF_PATTERN, MAX_COMMAND_LEN,
};

/// A formatted command.
pub(crate) type CommandBuf = heapless::String<MAX_COMMAND_LEN>;

/// Format a command into a bounded buffer.
pub(crate) fn format_command(args: core::fmt::Arguments<'_>) -> ModemResult<CommandBuf> {
    let mut command = CommandBuf::new();
    command
        .write_fmt(args)
        .map_err(|_| ModemError::InvalidArgument)?;
    Ok(command)
}

macro_rules! command {
    ($($arg:tt)*) => {
        $crate::issuer::format_command(format_args!($($arg)*))
    };
}
pub(crate) use command;

#[derive(Clone, Copy, Debug)]
/// A command and how to wait for its reply.
pub(crate) struct Request<'a> {
    pub command: &'a str,
    pub timeout: Duration,
    /// Total transmissions, if no reply arrives in time.
    pub attempts: u8,
    pub socket: Option<SocketHandle>,
}
impl<'a> Request<'a> {
    pub const fn new(command: &'a str, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            attempts: 1,
            socket: None,
        }
    }
    /// Send the command up to `retries` times. Zero is treated like one.
    pub const fn retries(mut self, retries: u8) -> Self {
        self.attempts = if retries == 0 { 1 } else { retries };
        self
    }
    /// The command acts on this socket.
    pub const fn socket(mut self, handle: SocketHandle) -> Self {
        self.socket = Some(handle);
        self
    }
}

/// Exclusive access to the transport.
///
/// Dropping this releases the transport and starts the idle timer, after which the modem may go
/// to sleep.
pub(crate) struct IssuerGuard<'m, W: Write, C: ControlLines> {
    modem: &'m Modem<W, C>,
    writer: MutexGuard<'m, DefaultRawMutex, W>,
}
impl<'m, W: Write, C: ControlLines> IssuerGuard<'m, W, C> {
    pub(crate) fn new(modem: &'m Modem<W, C>, writer: MutexGuard<'m, DefaultRawMutex, W>) -> Self {
        modem.with_state(|state| {
            state.power.busy = true;
            state.work.allow_sleep_at = None;
        });
        Self { modem, writer }
    }
    /// Set up the bookkeeping for a new attempt and return its token.
    fn arm(&self, socket: Option<SocketHandle>, command: Option<&str>) -> u32 {
        let token = self.modem.shared.reply.arm();
        self.modem.with_state(|state| {
            state.pending = Some(PendingCommand {
                token,
                socket,
                outcome: None,
            });
            match command {
                Some(command) => state.dispatcher.expect_echo(command),
                None => state.dispatcher.cancel_echo(),
            }
        });
        token
    }
    /// Give up on the attempt in flight. A reply arriving later is discarded.
    fn abandon(&self) {
        self.modem.shared.reply.disarm();
        self.modem.with_state(|state| {
            state.pending = None;
            state.dispatcher.cancel_echo();
        });
    }
    async fn write(&mut self, bytes: &[u8]) -> ModemResult<()> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|_| ModemError::Transport)
    }
    async fn flush(&mut self) -> ModemResult<()> {
        self.writer.flush().await.map_err(|_| ModemError::Transport)
    }
    async fn wait(&self, token: u32, timeout: Duration) -> ModemResult<Reply> {
        // The outcome is checked even on timeout, since the reply may have raced the timer.
        let _ = with_timeout(timeout, self.modem.shared.reply.wait(token)).await;
        self.modem.shared.reply.disarm();
        let outcome = self.modem.with_state(|state| {
            state.dispatcher.cancel_echo();
            state.pending.take().and_then(|pending| pending.outcome)
        });
        outcome.unwrap_or(Err(ModemError::Timeout))
    }
    /// Send a command and wait for its terminal reply.
    ///
    /// If no reply arrives within the timeout, the command is sent again, until all attempts are
    /// used up. Errors reported by the modem are returned immediately.
    pub async fn issue(&mut self, request: Request<'_>) -> ModemResult<Reply> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let token = self.arm(request.socket, Some(request.command));
            trace!("Sending {} ({}/{}).", request.command, attempt, request.attempts);
            let sent = async {
                self.write(request.command.as_bytes()).await?;
                self.write(b"\r").await?;
                self.flush().await
            }
            .await;
            if let Err(err) = sent {
                error!("Failed to send {}.", request.command);
                self.abandon();
                return Err(err);
            }
            match self.wait(token, request.timeout).await {
                Err(ModemError::Timeout) if attempt < request.attempts => {
                    debug!("No reply to {}, retrying.", request.command);
                }
                Err(err) => {
                    if !err.is_protocol_error() {
                        warn!("{} failed: {:?}", request.command, err);
                    }
                    return Err(err);
                }
                Ok(reply) => return Ok(reply),
            }
        }
    }
    /// Terminate a data block, which a dropped send may have left open.
    ///
    /// The reply is awaited and discarded, so it can't be taken for the reply to the next
    /// command.
    pub async fn close_data_block(&mut self, timeout: Duration) {
        if !self
            .modem
            .with_state(|state| core::mem::take(&mut state.data_block_open))
        {
            return;
        }
        debug!("Terminating an abandoned data block.");
        let token = self.arm(None, None);
        let sent = async {
            self.write(EOF_PATTERN).await?;
            self.flush().await
        }
        .await;
        if sent.is_err() {
            self.abandon();
            return;
        }
        if let Err(err) = self.wait(token, timeout).await {
            debug!("Abandoned data block ended with {:?}.", err);
        }
    }
    /// Send a command, which is expected to reply with `OK`.
    pub async fn issue_ok(&mut self, request: Request<'_>) -> ModemResult<()> {
        match self.issue(request).await? {
            Reply::Ok => Ok(()),
            Reply::Connect => {
                warn!("Unexpected data mode after {}.", request.command);
                Err(ModemError::Io)
            }
        }
    }
    /// Write a raw data block in data mode, terminated by the EOF pattern, and wait for the reply.
    pub async fn send_data(
        &mut self,
        fragments: &[&[u8]],
        timeout: Duration,
        socket: SocketHandle,
    ) -> ModemResult<Reply> {
        let token = self.arm(Some(socket), None);
        let sent = async {
            for fragment in fragments {
                trace!("Writing {} bytes: {}", fragment.len(), printable(fragment));
                self.write(fragment).await?;
            }
            self.write(EOF_PATTERN).await?;
            self.flush().await
        }
        .await;
        if let Err(err) = sent {
            self.abandon();
            return Err(err);
        }
        self.wait(token, timeout).await
    }
}
impl<W: Write, C: ControlLines> Drop for IssuerGuard<'_, W, C> {
    fn drop(&mut self) {
        let delay = self.modem.config.allow_sleep_delay;
        self.modem.shared.reply.disarm();
        self.modem.with_state(|state| {
            // Left over, if the future waiting for the reply was dropped.
            if state.pending.take().is_some() {
                state.dispatcher.cancel_echo();
            }
            state.power.busy = false;
            if state.power.may_sleep() {
                state.work.allow_sleep_at = Some(Instant::now() + delay);
            }
        });
        self.modem.shared.work.put();
    }
}
