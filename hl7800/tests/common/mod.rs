//! A scripted stand-in for the modem.
//!
//! Everything the driver writes is split into commands and data blocks, recorded and handed to a
//! script, which answers with timed responses. Responses are written into a pipe, which the
//! runner reads from.
#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    convert::Infallible,
    future::Future,
};

use embassy_futures::{
    block_on,
    select::{select3, Either3},
};
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, channel::Channel, pipe::Pipe};
use embassy_time::{Duration, Instant, Timer};
use embedded_io_async::{ErrorType, Read, Write};
use hl7800::{
    ControlLine, ControlLines, Modem, ModemConfig, ModemRunner, PinSnapshot, EOF_PATTERN,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostMessage {
    Command(String),
    Data(Vec<u8>),
}
impl HostMessage {
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Command(command) => Some(command),
            Self::Data(_) => None,
        }
    }
}

pub struct Response {
    pub delay: Duration,
    pub bytes: Vec<u8>,
}
/// Respond right away.
pub fn now(bytes: &str) -> Response {
    after(0, bytes)
}
/// Respond after a delay in milliseconds.
pub fn after(millis: u64, bytes: &str) -> Response {
    Response {
        delay: Duration::from_millis(millis),
        bytes: bytes.as_bytes().to_vec(),
    }
}

pub type Script = Box<dyn FnMut(&HostMessage) -> Vec<Response>>;

pub struct Sim {
    to_host: Pipe<NoopRawMutex, 8192>,
    outbox: Channel<NoopRawMutex, (Instant, Vec<u8>), 64>,
    inbox: RefCell<Vec<u8>>,
    data_mode: Cell<bool>,
    received: RefCell<Vec<(Instant, HostMessage)>>,
    script: RefCell<Script>,
}
impl Sim {
    pub fn new(script: impl FnMut(&HostMessage) -> Vec<Response> + 'static) -> Self {
        Self {
            to_host: Pipe::new(),
            outbox: Channel::new(),
            inbox: RefCell::new(Vec::new()),
            data_mode: Cell::new(false),
            received: RefCell::new(Vec::new()),
            script: RefCell::new(Box::new(script)),
        }
    }
    fn next_message(&self) -> Option<HostMessage> {
        let mut inbox = self.inbox.borrow_mut();
        if self.data_mode.get() {
            let end = inbox
                .windows(EOF_PATTERN.len())
                .position(|window| window == EOF_PATTERN)?;
            let data = inbox[..end].to_vec();
            inbox.drain(..end + EOF_PATTERN.len());
            self.data_mode.set(false);
            Some(HostMessage::Data(data))
        } else {
            let end = inbox.iter().position(|b| *b == b'\r')?;
            let command = String::from_utf8_lossy(&inbox[..end]).into_owned();
            inbox.drain(..=end);
            if command.starts_with("AT+KTCPSND") || command.starts_with("AT+KUDPSND") {
                self.data_mode.set(true);
            }
            Some(HostMessage::Command(command))
        }
    }
    fn on_host_bytes(&self, bytes: &[u8]) {
        self.inbox.borrow_mut().extend_from_slice(bytes);
        while let Some(message) = self.next_message() {
            let responses = (self.script.borrow_mut())(&message);
            let now = Instant::now();
            self.received.borrow_mut().push((now, message));
            for response in responses {
                self.outbox
                    .try_send((now + response.delay, response.bytes))
                    .expect("outbox overflow");
            }
        }
    }
    /// Send something unsolicited.
    pub fn inject(&self, bytes: &str) {
        self.outbox
            .try_send((Instant::now(), bytes.as_bytes().to_vec()))
            .expect("outbox overflow");
    }
    /// Everything the driver sent so far.
    pub fn received(&self) -> Vec<(Instant, HostMessage)> {
        self.received.borrow().clone()
    }
    /// The commands the driver sent so far.
    pub fn commands(&self) -> Vec<String> {
        self.received
            .borrow()
            .iter()
            .filter_map(|(_, message)| message.command().map(str::to_owned))
            .collect()
    }
    /// When `command` was sent, in order.
    pub fn sent_at(&self, command: &str) -> Vec<Instant> {
        self.received
            .borrow()
            .iter()
            .filter(|(_, message)| message.command() == Some(command))
            .map(|(at, _)| *at)
            .collect()
    }
    pub async fn run(&self) -> ! {
        loop {
            let (at, bytes) = self.outbox.receive().await;
            Timer::at(at).await;
            self.to_host.write_all(&bytes).await;
        }
    }
}

pub struct SimReader<'a>(pub &'a Sim);
impl ErrorType for SimReader<'_> {
    type Error = Infallible;
}
impl Read for SimReader<'_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        Ok(self.0.to_host.read(buf).await)
    }
}

pub struct SimWriter<'a>(pub &'a Sim);
impl ErrorType for SimWriter<'_> {
    type Error = Infallible;
}
impl Write for SimWriter<'_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.on_host_bytes(buf);
        Ok(buf.len())
    }
    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub type LineLog = RefCell<Vec<(Instant, ControlLine, bool)>>;

pub struct RecordingLines<'a>(pub &'a LineLog);
impl ControlLines for RecordingLines<'_> {
    fn set(&mut self, line: ControlLine, asserted: bool) {
        self.0.borrow_mut().push((Instant::now(), line, asserted));
    }
}

pub type TestModem<'a> = Modem<SimWriter<'a>, RecordingLines<'a>>;

pub fn ready_pins() -> PinSnapshot {
    PinSnapshot::new()
        .with_vgpio(true)
        .with_gpio6(true)
        .with_cts(false)
}

/// Short timeouts, so failing paths don't stall the tests.
pub fn test_config() -> ModemConfig {
    ModemConfig {
        command_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_millis(500),
        data_timeout: Duration::from_millis(500),
        wakeup_timeout: Duration::from_secs(2),
        boot_timeout: Duration::from_millis(500),
        raw_data_timeout: Duration::from_millis(200),
        retries: 1,
        signal_quality_period: Duration::from_ticks(0),
        ..Default::default()
    }
}

/// Run `body`, while the runner and the simulator make progress.
pub fn drive<R: Read, W: Write, C: ControlLines, T>(
    runner: &mut ModemRunner<'_, R, W, C>,
    sim: &Sim,
    body: impl Future<Output = T>,
) -> T {
    block_on(async {
        match select3(runner.run(), sim.run(), body).await {
            Either3::First(never) | Either3::Second(never) => never,
            Either3::Third(out) => out,
        }
    })
}
