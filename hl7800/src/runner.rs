use embassy_futures::select::{select, Either};
use embassy_time::{with_timeout, Duration, Instant, Timer};
use embedded_io_async::{Read, Write};

use crate::{
    framer::LineFramer,
    issuer::{command, Request},
    router::{take_due, RawRead, NETWORK_REFRESH_DELAY},
    socket::{SocketHandle, SocketKind},
    ControlLine, ControlLines, Modem, EOF_PATTERN, MAX_SOCKETS, RX_BUFFER_SIZE,
};

/// Retries of the network refresh, while the modem hasn't reported `+KSUP` yet.
const MAX_KSUP_WAITS: u8 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RawStage {
    Payload(usize),
    Trailer,
}

/// A raw data block, that is currently being read.
#[derive(Clone, Copy, Debug)]
struct RawTransfer {
    handle: SocketHandle,
    stage: RawStage,
}

/// Runs the background processing of the modem.
///
/// This reads everything the modem sends, routes it and carries out work, that can't be done in
/// place. [ModemRunner::run] never returns, so it should be spawned as a task or joined with the
/// application.
pub struct ModemRunner<'m, R: Read, W: Write, C: ControlLines> {
    modem: &'m Modem<W, C>,
    reader: R,
    framer: LineFramer<RX_BUFFER_SIZE>,
    raw: Option<RawTransfer>,
}
impl<'m, R: Read, W: Write, C: ControlLines> ModemRunner<'m, R, W, C> {
    pub(crate) fn new(modem: &'m Modem<W, C>, reader: R) -> Self {
        Self {
            modem,
            reader,
            framer: LineFramer::new(),
            raw: None,
        }
    }
    /// Run the RX loop and the work loop.
    pub async fn run(&mut self) -> ! {
        let modem = self.modem;
        let Self {
            reader, framer, raw, ..
        } = self;
        match select(rx_loop(modem, reader, framer, raw), modem.work_loop()).await {
            Either::First(never) | Either::Second(never) => never,
        }
    }
}

async fn rx_loop<R: Read, W: Write, C: ControlLines>(
    modem: &Modem<W, C>,
    reader: &mut R,
    framer: &mut LineFramer<RX_BUFFER_SIZE>,
    raw: &mut Option<RawTransfer>,
) -> ! {
    loop {
        process_buffered(modem, framer, raw);
        let event = select(reader.read(framer.spare()), modem.shared.pins.receive());
        let event = if raw.is_some() {
            match with_timeout(modem.config.raw_data_timeout, event).await {
                Ok(event) => event,
                Err(_) => {
                    warn!("Raw data stalled, returning to line mode.");
                    // The rest of the block would corrupt the next line.
                    framer.clear();
                    *raw = None;
                    continue;
                }
            }
        } else {
            event.await
        };
        match event {
            Either::First(Ok(0)) => {
                warn!("Transport reached end of file.");
                Timer::after(Duration::from_millis(10)).await;
            }
            Either::First(Ok(len)) => framer.commit(len),
            Either::First(Err(_)) => error!("Reading from the transport failed."),
            Either::Second(pins) => modem.on_pins(pins),
        }
    }
}

/// Route everything that is completely buffered.
fn process_buffered<W: Write, C: ControlLines>(
    modem: &Modem<W, C>,
    framer: &mut LineFramer<RX_BUFFER_SIZE>,
    raw: &mut Option<RawTransfer>,
) {
    let now = Instant::now();
    loop {
        match *raw {
            Some(RawTransfer {
                handle,
                stage: RawStage::Payload(len),
            }) => {
                let Some(data) = framer.next_raw(len) else {
                    return;
                };
                modem.with_state(|state| state.deliver_payload(&modem.shared, handle, data));
                *raw = Some(RawTransfer {
                    handle,
                    stage: RawStage::Trailer,
                });
            }
            Some(RawTransfer {
                stage: RawStage::Trailer,
                ..
            }) => {
                let Some(marker) = framer.next_raw(EOF_PATTERN.len()) else {
                    return;
                };
                if marker != EOF_PATTERN {
                    warn!("Raw data wasn't terminated properly.");
                }
                *raw = None;
            }
            None => {
                let Some(line) = framer.next_line() else {
                    return;
                };
                if let Some(RawRead { handle, len }) =
                    modem.with_state(|state| state.route(&modem.shared, now, line))
                {
                    trace!("Reading {} raw bytes for socket {}.", len, handle.index());
                    *raw = Some(RawTransfer {
                        handle,
                        stage: RawStage::Payload(len),
                    });
                }
            }
        }
    }
}

impl<W: Write, C: ControlLines> Modem<W, C> {
    /// Carry out deferred work, whenever it is kicked or a deadline expires.
    pub(crate) async fn work_loop(&self) -> ! {
        loop {
            match self.with_state(|state| state.work.next_deadline()) {
                Some(deadline) => {
                    select(self.shared.work.next(), Timer::at(deadline)).await;
                }
                None => self.shared.work.next().await,
            }
            let now = Instant::now();
            if self.with_state(|state| take_due(&mut state.work.allow_sleep_at, now)) {
                self.allow_sleep();
            }
            if self.with_state(|state| take_due(&mut state.work.stale_cleanup_at, now)) {
                self.delete_stale_sessions().await;
            }
            self.receive_pending().await;
            if self.with_state(|state| take_due(&mut state.work.network_refresh_at, now)) {
                self.refresh_network_status().await;
            }
            if self.with_state(|state| take_due(&mut state.work.signal_poll_at, now)) {
                self.poll_signal_quality().await;
            }
        }
    }
    /// The idle timeout expired.
    fn allow_sleep(&self) {
        let allowed = self.with_state(|state| match state.power.on_idle() {
            Some(actions) => {
                state.apply_power(&self.shared, &actions);
                true
            }
            None => false,
        });
        if allowed {
            debug!("Allowing the modem to sleep.");
            self.set_line(ControlLine::Wake, false);
        }
    }
    async fn delete_stale_sessions(&self) {
        let mut issuer = self.lock().await;
        while let Some(stale) = self.with_state(|state| state.stale.pop()) {
            let command = match stale.kind {
                SocketKind::Stream => command!("AT+KTCPDEL={}", stale.id),
                SocketKind::Datagram => command!("AT+KUDPCLOSE={}", stale.id),
            };
            let Ok(command) = command else {
                continue;
            };
            debug!("Deleting stale session {}.", stale.id);
            if let Err(err) = issuer
                .issue_ok(Request::new(&command, self.config.command_timeout))
                .await
            {
                warn!("Deleting stale session {} failed: {:?}", stale.id, err);
            }
        }
    }
    /// Fetch the data the modem announced for every socket.
    async fn receive_pending(&self) {
        for index in 0..MAX_SOCKETS {
            let handle = SocketHandle(index as u8);
            let available = self.with_state(|state| {
                state
                    .sockets
                    .get(handle)
                    .is_ok_and(|socket| socket.rx_available > 0)
            });
            if !available {
                continue;
            }
            let mut issuer = self.lock().await;
            let mtu = self.config.mtu;
            let command = self.with_state(|state| {
                let socket = state.sockets.get_mut(handle).ok()?;
                let id = socket.session.id()?;
                let stem = socket.kind.stem();
                let len = socket.begin_receive(mtu)?;
                command!("AT+{}RCV={},{}", stem, id, len).ok()
            });
            let Some(command) = command else {
                continue;
            };
            let res = issuer
                .issue_ok(Request::new(&command, self.config.data_timeout).socket(handle))
                .await;
            if let Err(err) = res {
                warn!("Receiving on socket {} failed: {:?}", index, err);
            }
            let deliver_eof = self.with_state(|state| {
                state
                    .sockets
                    .get_mut(handle)
                    .is_ok_and(|socket| socket.finish_receive())
            });
            if deliver_eof {
                self.shared.deliver_eof(handle);
            }
        }
    }
    /// Follow up on a registration change.
    async fn refresh_network_status(&self) {
        let waiting = self.with_state(|state| {
            if state.power.off {
                return true;
            }
            if state.power.wait_for_ksup && state.power.wait_for_ksup_tries < MAX_KSUP_WAITS {
                state.power.wait_for_ksup_tries += 1;
                state.work.network_refresh_at = Some(Instant::now() + NETWORK_REFRESH_DELAY);
                return true;
            }
            if state.power.wait_for_ksup {
                debug!("Modem never reported startup, continuing anyway.");
                state.power.wait_for_ksup = false;
            }
            false
        });
        if waiting {
            return;
        }
        let mut issuer = self.lock().await;
        if let Err(err) = issuer
            .issue_ok(Request::new("AT+COPS?", self.config.command_timeout))
            .await
        {
            warn!("Querying the operator failed: {:?}", err);
        }
        let period = self.config.signal_quality_period;
        self.with_state(|state| {
            if core::mem::take(&mut state.network_dropped) {
                state.work.network_refresh_at = Some(Instant::now() + NETWORK_REFRESH_DELAY);
            }
            if state.network.is_registered() {
                if period > Duration::from_ticks(0) && state.work.signal_poll_at.is_none() {
                    state.work.signal_poll_at = Some(Instant::now());
                }
            } else {
                state.work.signal_poll_at = None;
                state.end_streams(&self.shared);
            }
        });
    }
    async fn poll_signal_quality(&self) {
        let mut issuer = self.lock().await;
        if let Err(err) = issuer
            .issue_ok(Request::new("AT+KCELLMEAS=0", self.config.command_timeout))
            .await
        {
            warn!("Measuring signal quality failed: {:?}", err);
        }
        let period = self.config.signal_quality_period;
        self.with_state(|state| {
            if state.network.is_registered() && period > Duration::from_ticks(0) {
                state.work.signal_poll_at = Some(Instant::now() + period);
            }
        });
    }
}
