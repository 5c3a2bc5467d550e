//! Routing of framed lines to the state they affect.
//!
//! All of this runs on the RX loop, with the state lock held. Nothing in here may block or await.
//! Follow up work, which needs the transport, is scheduled for the work loop instead.

use core::cmp::Ordering;

use embassy_sync::{channel::Channel, signal::Signal};
use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::{
    dispatch::{Dispatch, Dispatcher, Info, LineKind, SocketLine, Terminal, Unsolicited},
    event::{Event, EventChannel, RadioMode, Revision},
    fmt::printable,
    parse,
    power::{PowerActions, PowerState},
    socket::{
        EndOfStream, Payload, SessionId, SocketHandle, SocketKind, SocketNotification,
        SocketState, SocketTable, StaleSocket,
    },
    sync::{ReplySignal, SignalQueue},
    Apn, DefaultRawMutex, ModemError, ModemResult, NetworkState, PinSnapshot, SleepState,
    StartupState, MAX_SOCKETS, RX_QUEUE_DEPTH,
};

/// Firmware starting with this revision uses the new syntax for selecting the radio mode.
pub(crate) const NEW_RAT_CMD_MIN_VERSION: &str = "HL7800.4.5.4.0";
/// Delay between a registration report and the follow up status queries.
pub(crate) const NETWORK_REFRESH_DELAY: Duration = Duration::from_millis(500);
/// Delay before sessions, that nobody owns, are deleted.
pub(crate) const STALE_CLEANUP_DELAY: Duration = Duration::from_millis(100);
/// Status line snapshots, that may be queued for the RX loop.
pub(crate) const PIN_QUEUE_DEPTH: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A successful terminal reply.
pub enum Reply {
    Ok,
    /// The modem entered data mode.
    Connect,
}

/// Bookkeeping for the command in flight.
pub(crate) struct PendingCommand {
    pub token: u32,
    /// The socket the command acts on.
    pub socket: Option<SocketHandle>,
    pub outcome: Option<ModemResult<Reply>>,
}

/// Raw data follows. The RX loop reads `len` bytes for the socket, followed by the EOF pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RawRead {
    pub handle: SocketHandle,
    pub len: usize,
}

/// Deadlines of deferred work.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct WorkSchedule {
    pub allow_sleep_at: Option<Instant>,
    pub stale_cleanup_at: Option<Instant>,
    pub network_refresh_at: Option<Instant>,
    pub signal_poll_at: Option<Instant>,
}
impl WorkSchedule {
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.allow_sleep_at,
            self.stale_cleanup_at,
            self.network_refresh_at,
            self.signal_poll_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// Takes the deadline out of `slot`, if it has passed.
pub(crate) fn take_due(slot: &mut Option<Instant>, now: Instant) -> bool {
    if slot.is_some_and(|at| at <= now) {
        *slot = None;
        true
    } else {
        false
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// What the modem told us about itself.
pub struct ModemInfo {
    pub manufacturer: heapless::String<32>,
    pub model: heapless::String<32>,
    pub revision: Revision,
    pub imei: heapless::String<16>,
    pub serial_number: heapless::String<32>,
    pub imsi: heapless::String<16>,
    pub iccid: heapless::String<24>,
    pub apn: Apn,
    pub radio_mode: Option<RadioMode>,
    /// The last reported `AT+CFUN` level.
    pub functionality: Option<u8>,
    /// The operator selection mode from `+COPS`.
    pub operator_mode: Option<u8>,
    /// Reference signal received power in dBm.
    pub rsrp: Option<i16>,
    /// Signal to interference plus noise ratio in dB.
    pub sinr: Option<i16>,
    /// The firmware uses the new syntax for selecting the radio mode.
    ///
    /// This is informational. The driver only queries the radio mode, which works the same on
    /// all revisions.
    pub new_rat_syntax: bool,
}

/// Per socket delivery primitives.
pub(crate) struct SocketChannels {
    pub rx: Channel<DefaultRawMutex, Payload, RX_QUEUE_DEPTH>,
    pub eof: Signal<DefaultRawMutex, ()>,
    pub notify: Signal<DefaultRawMutex, ModemResult<()>>,
}
impl SocketChannels {
    pub const fn new() -> Self {
        Self {
            rx: Channel::new(),
            eof: Signal::new(),
            notify: Signal::new(),
        }
    }
    /// Drop everything left over from a previous owner of the slot.
    pub fn reset(&self) {
        while self.rx.try_receive().is_ok() {}
        self.eof.reset();
        self.notify.reset();
    }
}

/// Signals shared between the loops and the callers.
pub(crate) struct Shared {
    pub reply: ReplySignal,
    pub awake: Signal<DefaultRawMutex, ()>,
    pub work: SignalQueue,
    pub pins: Channel<DefaultRawMutex, PinSnapshot, PIN_QUEUE_DEPTH>,
    pub events: EventChannel,
    pub sockets: [SocketChannels; MAX_SOCKETS],
}
impl Shared {
    pub const fn new() -> Self {
        Self {
            reply: ReplySignal::new(),
            awake: Signal::new(),
            work: SignalQueue::new(),
            pins: Channel::new(),
            events: EventChannel::new(),
            sockets: [const { SocketChannels::new() }; MAX_SOCKETS],
        }
    }
    pub fn publish(&self, event: Event) {
        trace!("Publishing event {:?}.", event);
        self.events.immediate_publisher().publish_immediate(event);
    }
    pub fn deliver_eof(&self, handle: SocketHandle) {
        debug!("Delivering end of stream for socket {}.", handle.index());
        self.sockets[handle.index()].eof.signal(());
    }
    fn deliver_eof_if(&self, handle: SocketHandle, eos: EndOfStream) {
        if eos == EndOfStream::DeliverNow {
            self.deliver_eof(handle);
        }
    }
}

/// Everything the RX loop and the callers share.
pub(crate) struct ModemState {
    pub dispatcher: Dispatcher,
    pub pending: Option<PendingCommand>,
    pub sockets: SocketTable,
    pub stale: Vec<StaleSocket, MAX_SOCKETS>,
    pub power: PowerState,
    pub network: NetworkState,
    pub startup: StartupState,
    pub info: ModemInfo,
    pub work: WorkSchedule,
    /// A socket reported a network failure, so the next refresh reports the network as lost.
    pub network_dropped: bool,
    /// The modem rebooted, so the network configuration has to be picked up again.
    pub reconfig_ip: bool,
    /// The modem restores its sessions after a reboot.
    pub restore_sessions: bool,
    /// A send was dropped after the modem may have entered data mode.
    pub data_block_open: bool,
    pub configured: bool,
}
impl ModemState {
    pub const fn new(low_power: bool, desired: SleepState, restore_sessions: bool) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            pending: None,
            sockets: SocketTable::new(),
            stale: Vec::new(),
            power: PowerState::new(low_power, desired),
            network: NetworkState::NotRegistered,
            startup: StartupState::Undetermined,
            info: ModemInfo {
                manufacturer: heapless::String::new(),
                model: heapless::String::new(),
                revision: heapless::String::new(),
                imei: heapless::String::new(),
                serial_number: heapless::String::new(),
                imsi: heapless::String::new(),
                iccid: heapless::String::new(),
                apn: heapless::String::new(),
                radio_mode: None,
                functionality: None,
                operator_mode: None,
                rsrp: None,
                sinr: None,
                new_rat_syntax: false,
            },
            work: WorkSchedule {
                allow_sleep_at: None,
                stale_cleanup_at: None,
                network_refresh_at: None,
                signal_poll_at: None,
            },
            network_dropped: false,
            reconfig_ip: false,
            restore_sessions,
            data_block_open: false,
            configured: false,
        }
    }

    /// Classify one line and apply its effects.
    ///
    /// Returns a [RawRead], if the line opened a raw data block for a socket receive.
    pub fn route(&mut self, shared: &Shared, now: Instant, line: &[u8]) -> Option<RawRead> {
        match self.dispatcher.classify(line) {
            Dispatch::Empty => None,
            Dispatch::Unmatched => {
                debug!("Unhandled line: {}", printable(line));
                None
            }
            Dispatch::Matched(kind, rest) => {
                trace!("{:?}: {}", kind, printable(line));
                match kind {
                    LineKind::Terminal(terminal) => {
                        self.on_terminal(shared, terminal, rest);
                        None
                    }
                    LineKind::Unsolicited(unsolicited) => {
                        self.on_unsolicited(shared, now, unsolicited, rest);
                        None
                    }
                    LineKind::SocketScoped(socket_line) => {
                        self.on_socket_line(shared, now, socket_line, rest)
                    }
                    LineKind::Info(info) => {
                        self.on_info(shared, info, rest);
                        None
                    }
                }
            }
        }
    }

    /// Record the outcome of the command in flight and wake its issuer.
    ///
    /// A reply, that arrives while nothing is pending or after an outcome was recorded, is
    /// discarded.
    pub fn complete(&mut self, shared: &Shared, outcome: ModemResult<Reply>) {
        match &mut self.pending {
            Some(pending) if pending.outcome.is_none() => {
                pending.outcome = Some(outcome);
                if !shared.reply.complete(pending.token) {
                    debug!("Command {} was abandoned, dropping its reply.", pending.token);
                }
            }
            _ => debug!("Discarding reply {:?}, no command is waiting for it.", outcome),
        }
    }

    fn pending_socket(&self) -> Option<SocketHandle> {
        self.pending.as_ref().and_then(|pending| pending.socket)
    }

    fn on_terminal(&mut self, shared: &Shared, terminal: Terminal, rest: &[u8]) {
        let outcome = match terminal {
            Terminal::Ok => Ok(Reply::Ok),
            Terminal::CmeError | Terminal::CmsError => {
                let code = parse::number(rest).unwrap_or_default();
                warn!("Modem reported error code {}.", code);
                Err(ModemError::CmeError(code))
            }
            Terminal::Error | Terminal::ExtendedError => Err(ModemError::Io),
            Terminal::NoCarrier => {
                if let Some(handle) = self.pending_socket() {
                    if let Ok(socket) = self.sockets.get_mut(handle) {
                        let eos = socket.fail(ModemError::Io);
                        shared.deliver_eof_if(handle, eos);
                    }
                }
                Err(ModemError::Io)
            }
        };
        self.complete(shared, outcome);
    }

    fn on_unsolicited(
        &mut self,
        shared: &Shared,
        now: Instant,
        unsolicited: Unsolicited,
        rest: &[u8],
    ) {
        match unsolicited {
            Unsolicited::StartupReport => {
                let startup = StartupState::from_bits(parse::number(rest).unwrap_or(5));
                info!("Modem started up, state: {:?}", startup);
                self.startup = startup;
                shared.publish(Event::StartupState(startup));
                let actions = self.power.on_startup_report();
                self.apply_power(shared, &actions);
                if !self.restore_sessions {
                    self.detach_sessions(shared);
                }
                self.reconfig_ip = true;
            }
            Unsolicited::NetworkReport => {
                let Some(stat) = parse::nth_number::<u8>(rest, 0) else {
                    warn!("Malformed registration report: {}", printable(rest));
                    return;
                };
                self.set_network(shared, NetworkState::from_bits(stat));
                self.work.network_refresh_at = Some(now + NETWORK_REFRESH_DELAY);
                shared.work.put();
            }
        }
    }

    pub fn set_network(&mut self, shared: &Shared, state: NetworkState) {
        if self.network != state {
            info!("Network state: {:?}", state);
        }
        self.network = state;
        shared.publish(Event::NetworkState(state));
    }

    fn on_socket_line(
        &mut self,
        shared: &Shared,
        now: Instant,
        line: SocketLine,
        rest: &[u8],
    ) -> Option<RawRead> {
        if line == SocketLine::Connect {
            if let Some(handle) = self.pending_socket() {
                if let Ok(socket) = self.sockets.get(handle) {
                    if socket.state == SocketState::Receiving {
                        return Some(RawRead {
                            handle,
                            len: socket.rx_expected,
                        });
                    }
                }
            }
            self.complete(shared, Ok(Reply::Connect));
            return None;
        }
        let Some(id) = parse::nth_number::<u8>(rest, 0) else {
            warn!("Socket message without session id: {}", printable(rest));
            return None;
        };
        match line {
            SocketLine::Created(kind) => self.on_created(shared, now, kind, id),
            SocketLine::Indication(_) => match self.sockets.find_session(id) {
                Some(handle) => {
                    debug!("Session {} is up.", id);
                    shared.sockets[handle.index()].notify.signal(Ok(()));
                }
                None => debug!("Indication for unknown session {}.", id),
            },
            SocketLine::Notification(_) => {
                let code = parse::nth_number::<u8>(rest, 1).unwrap_or_default();
                self.on_notification(shared, id, SocketNotification::from_bits(code));
            }
            SocketLine::DataAvailable(_) => {
                let len = parse::nth_number::<usize>(rest, 1).unwrap_or_default();
                match self
                    .sockets
                    .find_session(id)
                    .and_then(|handle| self.sockets.get_mut(handle).ok())
                {
                    Some(socket) => {
                        trace!("Session {} has {} bytes available.", id, len);
                        socket.rx_available = len;
                        shared.work.put();
                    }
                    None => debug!("Data for unknown session {}.", id),
                }
            }
            SocketLine::Connect => {}
        }
        None
    }

    fn on_created(&mut self, shared: &Shared, now: Instant, kind: SocketKind, id: u8) {
        let Some(session) = SessionId::assigned(id) else {
            warn!("Modem assigned invalid session id 0.");
            return;
        };
        let candidate = self
            .pending_socket()
            .filter(|handle| {
                self.sockets.get(*handle).is_ok_and(|socket| {
                    socket.kind == kind && socket.session == SessionId::Pending
                })
            })
            .or_else(|| self.sockets.find_pending(kind));
        if let Some(owner) = self.sockets.find_session(id) {
            if candidate.is_none() {
                trace!("Session {} is already known.", id);
                return;
            }
            // The modem only hands out an id again, after it lost the old session.
            warn!("Session {} was handed out again, detaching socket {}.", id, owner.index());
            if let Ok(socket) = self.sockets.get_mut(owner) {
                let eos = socket.detach();
                shared.deliver_eof_if(owner, eos);
            }
        }
        match candidate.and_then(|handle| self.sockets.get_mut(handle).ok()) {
            Some(socket) => {
                debug!("Socket was assigned session {}.", id);
                socket.session = session;
            }
            None => {
                debug!("Session {} has no owner, it will be deleted.", id);
                self.queue_stale(shared, now, StaleSocket { kind, id });
            }
        }
    }

    /// Schedule the deletion of a session nobody owns.
    fn queue_stale(&mut self, shared: &Shared, now: Instant, stale: StaleSocket) {
        if !self.stale.contains(&stale) && self.stale.push(stale).is_err() {
            warn!("Too many stale sessions, leaking session {}.", stale.id);
        }
        self.work.stale_cleanup_at = Some(now + STALE_CLEANUP_DELAY);
        shared.work.put();
    }

    /// Free a socket, that never reached its owner. Its session is deleted in the background.
    pub fn release_socket(&mut self, shared: &Shared, now: Instant, handle: SocketHandle) {
        let Some(socket) = self.sockets.free(handle) else {
            return;
        };
        if let Some(id) = socket.session.id() {
            self.queue_stale(
                shared,
                now,
                StaleSocket {
                    kind: socket.kind,
                    id,
                },
            );
        }
    }

    fn on_notification(&mut self, shared: &Shared, id: u8, notification: SocketNotification) {
        let Some(handle) = self.sockets.find_session(id) else {
            debug!("Notification {:?} for unknown session {}.", notification, id);
            return;
        };
        let Ok(socket) = self.sockets.get_mut(handle) else {
            return;
        };
        let notify = &shared.sockets[handle.index()].notify;
        match notification {
            SocketNotification::DataSent => notify.signal(Ok(())),
            SocketNotification::Disconnected => {
                info!("Session {} was closed by the peer.", id);
                let connecting = socket.state == SocketState::Connecting;
                let eos = socket.peer_closed();
                if connecting {
                    notify.signal(Err(ModemError::NotConnected));
                }
                shared.deliver_eof_if(handle, eos);
            }
            _ => {
                warn!("Session {} failed: {:?}", id, notification);
                self.network_dropped = true;
                let eos = socket.fail(ModemError::Io);
                notify.signal(Err(ModemError::Io));
                shared.deliver_eof_if(handle, eos);
            }
        }
    }

    fn on_info(&mut self, shared: &Shared, info: Info, rest: &[u8]) {
        let value = parse::trim(rest);
        match info {
            Info::Manufacturer => self.info.manufacturer = parse::to_string(value),
            Info::Model => self.info.model = parse::to_string(value),
            Info::Imei => self.info.imei = parse::to_string(value),
            Info::SerialNumber => {
                let value = value.strip_prefix(b"+KGSN: ").unwrap_or(value);
                self.info.serial_number = parse::to_string(value);
            }
            Info::Imsi => self.info.imsi = parse::to_string(value),
            Info::Iccid => self.info.iccid = parse::to_string(value),
            Info::Revision => {
                let revision: Revision = parse::to_string(value);
                self.info.new_rat_syntax =
                    parse::compare_revisions(&revision, NEW_RAT_CMD_MIN_VERSION)
                        != Ordering::Less;
                info!("Firmware revision: {}", revision.as_str());
                shared.publish(Event::Revision(revision.clone()));
                self.info.revision = revision;
            }
            Info::NetworkQuery => {
                let value = value.strip_prefix(b"+CEREG: ").unwrap_or(value);
                if let Some(stat) = parse::nth_number::<u8>(value, 1) {
                    self.set_network(shared, NetworkState::from_bits(stat));
                }
            }
            Info::RadioMode => {
                let Some(mode) = parse::number(value).and_then(RadioMode::from_ksrat) else {
                    warn!("Unknown radio mode: {}", printable(value));
                    return;
                };
                if self.info.radio_mode != Some(mode) {
                    self.info.radio_mode = Some(mode);
                    shared.publish(Event::RadioMode(mode));
                }
            }
            Info::PdpContext => {
                // `"IPV4V6","<apn>",...`
                let Some(apn) = parse::fields(value).nth(1) else {
                    return;
                };
                let apn: Apn = parse::to_string(parse::unquote(apn));
                if self.info.apn != apn {
                    info!("APN: {}", apn.as_str());
                    self.info.apn = apn.clone();
                    shared.publish(Event::ApnUpdated(apn));
                }
            }
            Info::Operator => self.info.operator_mode = parse::nth_number(value, 0),
            Info::Functionality => self.info.functionality = parse::nth_number(value, 0),
            Info::CellMeasurement => self.on_cell_measurement(shared, value),
        }
    }

    /// `+KCELLMEAS: <rsrp>,<downlink path loss>,<pucch tx power>,<pusch tx power>,<sinr>`
    fn on_cell_measurement(&mut self, shared: &Shared, value: &[u8]) {
        if value.iter().filter(|b| **b == b',').count() < 4 {
            warn!("Malformed cell measurement: {}", printable(value));
            return;
        }
        if parse::fields(value).next().is_some_and(|rsrp| parse::trim(rsrp).is_empty()) {
            debug!("Signal quality is unknown.");
            self.info.rsrp = None;
            self.info.sinr = None;
            return;
        }
        let (Some(rsrp), Some(sinr)) = (
            parse::nth_number::<i16>(value, 0),
            parse::nth_number::<i16>(value, 4),
        ) else {
            warn!("Malformed cell measurement: {}", printable(value));
            return;
        };
        debug!("RSRP: {} dBm SINR: {} dB", rsrp, sinr);
        self.info.rsrp = Some(rsrp);
        self.info.sinr = Some(sinr);
        shared.publish(Event::SignalQuality { rsrp, sinr });
    }

    /// Queue a received payload for the socket's owner.
    pub fn deliver_payload(&mut self, shared: &Shared, handle: SocketHandle, data: &[u8]) {
        let Ok(socket) = self.sockets.get_mut(handle) else {
            debug!("Dropping {} bytes for a closed socket.", data.len());
            return;
        };
        let queued = Payload::from_slice(data)
            .ok()
            .is_some_and(|payload| shared.sockets[handle.index()].rx.try_send(payload).is_ok());
        if queued {
            trace!("Queued {} bytes for socket {}.", data.len(), handle.index());
        } else {
            warn!("Receive queue of socket {} is full.", handle.index());
            socket.error.get_or_insert(ModemError::NoBuffers);
        }
    }

    /// Process a new snapshot of the status lines.
    pub fn on_pins(&mut self, shared: &Shared, pins: PinSnapshot) -> PowerActions {
        let actions = self.power.on_pins(pins);
        if actions.release_lines {
            self.reconfig_ip = true;
        }
        self.apply_power(shared, &actions);
        actions
    }

    /// Publish and signal the effects of a power state change.
    pub fn apply_power(&self, shared: &Shared, actions: &PowerActions) {
        if let Some(sleep) = actions.sleep_changed {
            info!("Sleep state: {:?}", sleep);
            if sleep != SleepState::Awake {
                shared.awake.reset();
            }
            shared.publish(Event::SleepState(sleep));
        }
        if actions.awake {
            shared.awake.signal(());
        }
    }

    /// The modem rebooted and forgot all sessions. Every socket, that had one, ends.
    fn detach_sessions(&mut self, shared: &Shared) {
        for (handle, socket) in self.sockets.iter_mut() {
            let connecting = socket.state == SocketState::Connecting;
            if socket.session.id().is_none() && !connecting {
                continue;
            }
            debug!("Socket {} lost its session.", handle.index());
            let eos = socket.detach();
            if connecting {
                shared.sockets[handle.index()]
                    .notify
                    .signal(Err(ModemError::NotConnected));
            }
            shared.deliver_eof_if(handle, eos);
        }
    }

    /// The network is gone, so every stream ends.
    pub fn end_streams(&mut self, shared: &Shared) {
        for (handle, socket) in self.sockets.iter_mut() {
            if socket.kind == SocketKind::Stream
                && matches!(
                    socket.state,
                    SocketState::Connected | SocketState::Sending | SocketState::Receiving
                )
            {
                let eos = socket.peer_closed();
                shared.deliver_eof_if(handle, eos);
            }
        }
    }
}
