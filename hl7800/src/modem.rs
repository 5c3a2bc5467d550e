use core::{cell::RefCell, net::SocketAddr};

use embassy_futures::select::{select, Either};
use embassy_sync::{blocking_mutex, mutex::Mutex};
use embassy_time::{with_timeout, Duration, Instant, Timer};
use embedded_io_async::{Read, Write};

use crate::{
    event::{Event, EventListener},
    issuer::{command, IssuerGuard, Request},
    router::{ModemInfo, ModemState, Reply, Shared},
    socket::{Payload, SessionId, SocketHandle, SocketKind, SocketState},
    ControlLine, ControlLines, DefaultRawMutex, ModemConfig, ModemError, ModemResult,
    ModemRunner, NetworkState, PinSnapshot, SleepState, StartupState, MAX_APN_LEN,
};

/// Low time of the reset pulse.
const RESET_PULSE: Duration = Duration::from_millis(50);
/// Time between releasing reset and asserting wake.
const RESET_SETTLE: Duration = Duration::from_millis(10);
/// In the sleep level, the modem needs this long after wake is asserted, before CTS is valid.
const WAKE_TO_CTS_DELAY: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A snapshot of a socket's state.
pub struct SocketInfo {
    pub kind: SocketKind,
    pub session: SessionId,
    pub state: SocketState,
    pub rx_available: usize,
    pub error: Option<ModemError>,
}

/// Driver for a HL7800 modem.
///
/// All operations take `&self`, so the modem can be shared between tasks. Commands are
/// serialized internally. The [ModemRunner] returned by [Modem::runner] has to be running for
/// anything to make progress.
pub struct Modem<W: Write, C: ControlLines> {
    pub(crate) state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<ModemState>>,
    pub(crate) shared: Shared,
    pub(crate) config: ModemConfig,
    writer: Mutex<DefaultRawMutex, W>,
    lines: blocking_mutex::Mutex<DefaultRawMutex, RefCell<C>>,
}
impl<W: Write, C: ControlLines> Modem<W, C> {
    /// Create a new driver.
    ///
    /// `writer` is the transmit half of the UART the modem is connected to. The modem isn't
    /// touched until [Modem::reset] is called.
    pub fn new(writer: W, lines: C, config: ModemConfig) -> Self {
        let state = ModemState::new(config.low_power, config.sleep_level, config.restore_on_boot);
        Self {
            state: blocking_mutex::Mutex::new(RefCell::new(state)),
            shared: Shared::new(),
            config,
            writer: Mutex::new(writer),
            lines: blocking_mutex::Mutex::new(RefCell::new(lines)),
        }
    }
    /// Get the runner, which processes everything the modem sends.
    pub fn runner<R: Read>(&self, reader: R) -> ModemRunner<'_, R, W, C> {
        ModemRunner::new(self, reader)
    }
    pub fn config(&self) -> &ModemConfig {
        &self.config
    }
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut ModemState) -> T) -> T {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }
    pub(crate) fn set_line(&self, line: ControlLine, asserted: bool) {
        trace!("{:?} -> {}", line, asserted);
        self.lines.lock(|lines| lines.borrow_mut().set(line, asserted));
    }
    /// Queue a snapshot of the status lines.
    ///
    /// This is meant to be called from the edge interrupts of VGPIO, GPIO6 and CTS and never
    /// blocks. A snapshot, that doesn't fit into the queue, is dropped.
    pub fn pin_changed(&self, pins: PinSnapshot) {
        if self.shared.pins.try_send(pins).is_err() {
            warn!("Status line queue is full, dropping snapshot.");
        }
    }
    /// Register a listener for state change events.
    ///
    /// Returns [None], if all listener slots are taken.
    pub fn subscribe(&self) -> Option<EventListener<'_>> {
        self.shared.events.subscriber().ok()
    }

    /// Take the transport without waking the modem.
    pub(crate) async fn acquire(&self) -> IssuerGuard<'_, W, C> {
        IssuerGuard::new(self, self.writer.lock().await)
    }
    /// Take the transport and make sure the modem is awake.
    pub(crate) async fn lock(&self) -> IssuerGuard<'_, W, C> {
        let mut guard = self.acquire().await;
        if self.config.low_power {
            self.wake().await;
        }
        guard.close_data_block(self.config.command_timeout).await;
        guard
    }
    async fn wake(&self) {
        let desired = self.with_state(|state| {
            state.power.hold_awake();
            // The modem may already be up, in which case no further snapshot arrives.
            let mut actions = Default::default();
            state.power.evaluate(&mut actions);
            state.apply_power(&self.shared, &actions);
            state.power.desired
        });
        self.set_line(ControlLine::Wake, true);
        if desired == SleepState::Sleep {
            Timer::after(WAKE_TO_CTS_DELAY).await;
        }
        if self.with_state(|state| state.power.is_awake()) {
            return;
        }
        debug!("Waiting for the modem to wake up.");
        if with_timeout(self.config.wakeup_timeout, self.shared.awake.wait())
            .await
            .is_err()
        {
            warn!("Modem didn't wake up in time.");
        }
    }

    /// Send a command and wait for its terminal reply.
    ///
    /// `retries` is the total number of transmissions, if no reply arrives within `timeout`.
    pub async fn issue(&self, command: &str, timeout: Duration, retries: u8) -> ModemResult<()> {
        let mut issuer = self.lock().await;
        issuer
            .issue_ok(Request::new(command, timeout).retries(retries))
            .await
    }
    /// Send a command with the default timeout and no retries.
    pub async fn send_at_command(&self, command: &str) -> ModemResult<()> {
        self.issue(command, self.config.command_timeout, 1).await
    }

    /// Reset the modem and configure it.
    pub async fn reset(&self) -> ModemResult<()> {
        let mut issuer = self.acquire().await;
        self.reset_and_configure(&mut issuer).await
    }
    async fn reset_and_configure(&self, issuer: &mut IssuerGuard<'_, W, C>) -> ModemResult<()> {
        info!("Resetting modem.");
        self.with_state(|state| {
            state.power.restarting = true;
            state.power.off = false;
            state.configured = false;
            state.data_block_open = false;
            state.startup = StartupState::Undetermined;
            state.work.signal_poll_at = None;
            let actions = state.power.on_reset();
            state.apply_power(&self.shared, &actions);
            state.set_network(&self.shared, NetworkState::NotRegistered);
        });
        self.shared.awake.reset();

        self.set_line(ControlLine::Wake, false);
        self.set_line(ControlLine::Reset, true);
        Timer::after(RESET_PULSE).await;
        self.set_line(ControlLine::Reset, false);
        self.set_line(ControlLine::Wake, true);
        Timer::after(RESET_SETTLE).await;

        if with_timeout(self.config.boot_timeout, self.shared.awake.wait())
            .await
            .is_err()
        {
            warn!("Modem didn't report startup in time.");
        }

        let res = self.configure(issuer).await;
        self.with_state(|state| {
            state.power.restarting = false;
            state.configured = res.is_ok();
            if res.is_err() {
                state.set_network(&self.shared, NetworkState::UnableToConfigure);
            }
        });
        match res {
            Ok(()) => info!("Modem is configured."),
            Err(err) => error!("Configuring the modem failed: {:?}", err),
        }
        res
    }
    /// A configuration command, which is retried.
    fn request<'a>(&self, command: &'a str) -> Request<'a> {
        Request::new(command, self.config.command_timeout).retries(self.config.retries)
    }
    async fn configure(&self, issuer: &mut IssuerGuard<'_, W, C>) -> ModemResult<()> {
        for command in ["ATE0", "AT+CMEE=1", "AT+CGMR", "AT+KSRAT?", "AT+CFUN=4,0"] {
            issuer.issue_ok(self.request(command)).await?;
        }
        if self.config.low_power {
            // GPIO6 reports the modem's wake state.
            issuer.issue_ok(self.request("AT+KHWIOCFG=3,1,6")).await?;
            issuer
                .issue_ok(self.request(self.config.sleep_level.sleep_command()))
                .await?;
        } else {
            issuer
                .issue_ok(self.request(SleepState::Awake.sleep_command()))
                .await?;
        }
        for command in ["AT+CGMI", "AT+CGMM", "AT+CGSN", "AT+KGSN=3"] {
            issuer.issue_ok(self.request(command)).await?;
        }
        // These fail without a SIM.
        if issuer.issue_ok(self.request("AT+CCID?")).await.is_err() {
            debug!("No ICCID available.");
        }
        if self.with_state(|state| state.startup) != StartupState::SimNotPresent
            && issuer.issue_ok(self.request("AT+CIMI")).await.is_err()
        {
            debug!("No IMSI available.");
        }

        issuer.issue_ok(self.request("AT+CGDCONT?")).await?;
        if let Some(apn) = &self.config.apn {
            if self.with_state(|state| state.info.apn != *apn) {
                info!("Writing APN {}.", apn.as_str());
                let command = command!("AT+CGDCONT=1,\"IPV4V6\",\"{}\"", apn)?;
                issuer.issue_ok(self.request(&command)).await?;
                issuer.issue_ok(self.request("AT+CGDCONT?")).await?;
            }
        }
        let apn = self.with_state(|state| state.info.apn.clone());
        let command = command!("AT+KCNXCFG=1,\"GPRS\",\"{}\",,,\"IPV4V6\"", apn)?;
        issuer.issue_ok(self.request(&command)).await?;

        for command in [
            "AT+CEREG?",
            "AT+CEREG=5",
            "AT+KTCPCFG?",
            "AT+KUDPCFG?",
            "AT+CFUN=1,0",
        ] {
            issuer.issue_ok(self.request(command)).await?;
        }
        self.with_state(|state| state.reconfig_ip = false);
        Ok(())
    }

    /// Set up the data connection again, if the modem rebooted or lost power since it was
    /// configured.
    async fn reconfigure_ip(&self, issuer: &mut IssuerGuard<'_, W, C>) {
        if !self.with_state(|state| core::mem::take(&mut state.reconfig_ip)) {
            return;
        }
        info!("Reconfiguring the IP connection.");
        let apn = self.with_state(|state| state.info.apn.clone());
        let res = match command!("AT+KCNXCFG=1,\"GPRS\",\"{}\",,,\"IPV4V6\"", apn) {
            Ok(command) => issuer.issue_ok(self.request(&command)).await,
            Err(err) => Err(err),
        };
        if let Err(err) = res {
            error!("Reconfiguring the IP connection failed: {:?}", err);
            self.with_state(|state| state.reconfig_ip = true);
            return;
        }
        for command in ["AT+KTCPCFG?", "AT+KUDPCFG?"] {
            if let Err(err) = issuer.issue_ok(self.request(command)).await {
                debug!("{} failed: {:?}", command, err);
            }
        }
    }

    /// Store a new APN in the modem and reset it, so it takes effect.
    pub async fn update_apn(&self, apn: &str) -> ModemResult<()> {
        if apn.len() > MAX_APN_LEN || apn.contains('"') {
            return Err(ModemError::InvalidArgument);
        }
        let command = command!("AT+CGDCONT=1,\"IPV4V6\",\"{}\"", apn)?;
        let mut issuer = self.lock().await;
        issuer
            .issue_ok(Request::new(&command, self.config.command_timeout))
            .await?;
        self.reset_and_configure(&mut issuer).await
    }
    /// Set the functionality level with `AT+CFUN`.
    pub async fn set_functionality(&self, level: u8) -> ModemResult<()> {
        let command = command!("AT+CFUN={},0", level)?;
        self.send_at_command(&command).await
    }
    /// Query the functionality level.
    pub async fn functionality(&self) -> ModemResult<u8> {
        self.with_state(|state| state.info.functionality = None);
        self.send_at_command("AT+CFUN?").await?;
        self.with_state(|state| state.info.functionality)
            .ok_or(ModemError::Io)
    }
    /// Change the level the modem sleeps at, when idle.
    pub async fn set_desired_sleep_level(&self, level: SleepState) -> ModemResult<()> {
        if level == SleepState::Uninitialized || !self.config.low_power {
            return Err(ModemError::InvalidArgument);
        }
        self.with_state(|state| state.power.desired = level);
        self.send_at_command(level.sleep_command()).await
    }
    /// Measure the signal quality now.
    ///
    /// Returns RSRP and SINR, or [None] if the modem doesn't know them.
    pub async fn signal_quality(&self) -> ModemResult<Option<(i16, i16)>> {
        self.send_at_command("AT+KCELLMEAS=0").await?;
        Ok(self.with_state(|state| state.info.rsrp.zip(state.info.sinr)))
    }
    /// Power the modem off. It has to be reset, to use it again.
    pub async fn power_off(&self) -> ModemResult<()> {
        let mut issuer = self.lock().await;
        issuer
            .issue_ok(Request::new("AT+CPOF", self.config.command_timeout))
            .await?;
        info!("Modem is powered off.");
        self.with_state(|state| {
            state.power.off = true;
            state.work.signal_poll_at = None;
            state.set_network(&self.shared, NetworkState::NotRegistered);
        });
        Ok(())
    }
    /// Keep the modem awake, while the returned guard is alive.
    pub fn keep_awake(&self) -> KeepAwake<'_, W, C> {
        let low_power = self.with_state(|state| {
            state.power.keep_awake += 1;
            state.power.hold_awake();
            state.work.allow_sleep_at = None;
            state.power.low_power
        });
        if low_power {
            self.set_line(ControlLine::Wake, true);
        }
        KeepAwake { modem: self }
    }
    /// Publish the current state to all listeners.
    pub fn generate_status_events(&self) {
        let (network, startup, sleep, info) = self.with_state(|state| {
            (
                state.network,
                state.startup,
                state.power.sleep,
                state.info.clone(),
            )
        });
        self.shared.publish(Event::NetworkState(network));
        self.shared.publish(Event::StartupState(startup));
        self.shared.publish(Event::SleepState(sleep));
        if let (Some(rsrp), Some(sinr)) = (info.rsrp, info.sinr) {
            self.shared.publish(Event::SignalQuality { rsrp, sinr });
        }
        if let Some(mode) = info.radio_mode {
            self.shared.publish(Event::RadioMode(mode));
        }
        self.shared.publish(Event::ApnUpdated(info.apn));
        self.shared.publish(Event::Revision(info.revision));
    }

    pub fn network_state(&self) -> NetworkState {
        self.with_state(|state| state.network)
    }
    pub fn startup_state(&self) -> StartupState {
        self.with_state(|state| state.startup)
    }
    pub fn sleep_state(&self) -> SleepState {
        self.with_state(|state| state.power.sleep)
    }
    /// Check if the last reset and configuration succeeded.
    pub fn is_configured(&self) -> bool {
        self.with_state(|state| state.configured)
    }
    /// Everything the modem reported about itself.
    pub fn info(&self) -> ModemInfo {
        self.with_state(|state| state.info.clone())
    }

    /// Allocate a socket.
    ///
    /// Datagram sockets are created in the modem right away. Stream sockets are created once
    /// they are connected.
    pub async fn open(&self, kind: SocketKind) -> ModemResult<SocketHandle> {
        let handle = self.with_state(|state| state.sockets.allocate(kind))?;
        self.shared.sockets[handle.index()].reset();
        if kind == SocketKind::Datagram {
            if let Err(err) = self.create_datagram(handle).await {
                self.with_state(|state| {
                    state.release_socket(&self.shared, Instant::now(), handle)
                });
                return Err(err);
            }
        }
        Ok(handle)
    }
    async fn create_datagram(&self, handle: SocketHandle) -> ModemResult<()> {
        let mut issuer = self.lock().await;
        self.reconfigure_ip(&mut issuer).await;
        self.with_state(|state| state.sockets.get_mut(handle)?.begin_connect())?;
        // The caller never sees the handle, if this is dropped.
        let _cancel = CancelOnDrop {
            modem: self,
            handle,
            release: true,
        };
        let notify = &self.shared.sockets[handle.index()].notify;
        notify.reset();
        let command = command!(
            "AT+KUDPCFG=1,0,,,,,0,{}",
            self.config.restore_on_boot as u8
        )?;
        let res = async {
            issuer
                .issue_ok(Request::new(&command, self.config.command_timeout).socket(handle))
                .await?;
            self.assigned_session(handle)?;
            with_timeout(self.config.command_timeout, notify.wait())
                .await
                .map_err(|_| ModemError::Timeout)?
        }
        .await;
        self.finish_connect(handle, res)
    }
    fn assigned_session(&self, handle: SocketHandle) -> ModemResult<u8> {
        self.with_state(|state| state.sockets.get(handle).map(|socket| socket.session.id()))?
            .ok_or(ModemError::Io)
    }
    fn finish_connect(&self, handle: SocketHandle, res: ModemResult<()>) -> ModemResult<()> {
        self.with_state(|state| {
            let socket = state.sockets.get_mut(handle)?;
            match res {
                Ok(()) => socket.connected(),
                Err(err) => {
                    socket.error = Some(err);
                    socket.state = SocketState::Error;
                }
            }
            res
        })
    }
    /// Set the local address of a socket.
    pub fn bind(&self, handle: SocketHandle, local: SocketAddr) -> ModemResult<()> {
        self.with_state(|state| {
            state.sockets.get_mut(handle)?.local = Some(local);
            Ok(())
        })
    }
    /// Connect a socket.
    ///
    /// For datagram sockets this only sets the default destination.
    pub async fn connect(&self, handle: SocketHandle, remote: SocketAddr) -> ModemResult<()> {
        let kind = self.with_state(|state| {
            let socket = state.sockets.get_mut(handle)?;
            socket.remote = Some(remote);
            Ok::<_, ModemError>(socket.kind)
        })?;
        if kind == SocketKind::Datagram {
            return Ok(());
        }
        let mut issuer = self.lock().await;
        self.reconfigure_ip(&mut issuer).await;
        self.with_state(|state| state.sockets.get_mut(handle)?.begin_connect())?;
        let _cancel = CancelOnDrop {
            modem: self,
            handle,
            release: false,
        };
        let res = self.connect_stream(&mut issuer, handle, remote).await;
        if let Err(err) = res {
            warn!("Connecting socket {} failed: {:?}", handle.index(), err);
        }
        self.finish_connect(handle, res)
    }
    async fn connect_stream(
        &self,
        issuer: &mut IssuerGuard<'_, W, C>,
        handle: SocketHandle,
        remote: SocketAddr,
    ) -> ModemResult<()> {
        let command = command!(
            "AT+KTCPCFG=1,0,\"{}\",{},,,,{},,{}",
            remote.ip(),
            remote.port(),
            remote.is_ipv6() as u8,
            self.config.restore_on_boot as u8
        )?;
        issuer
            .issue_ok(Request::new(&command, self.config.command_timeout).socket(handle))
            .await?;
        let id = self.assigned_session(handle)?;

        let notify = &self.shared.sockets[handle.index()].notify;
        notify.reset();
        let command = command!("AT+KTCPCNX={}", id)?;
        issuer
            .issue_ok(Request::new(&command, self.config.command_timeout).socket(handle))
            .await?;
        with_timeout(self.config.connect_timeout, notify.wait())
            .await
            .map_err(|_| ModemError::Timeout)?
    }

    /// Send data on a connected socket.
    pub async fn send(&self, handle: SocketHandle, data: &[u8]) -> ModemResult<usize> {
        self.send_inner(handle, None, &[data]).await
    }
    /// Send data, that is split across multiple buffers, as one transfer.
    pub async fn send_vectored(
        &self,
        handle: SocketHandle,
        fragments: &[&[u8]],
    ) -> ModemResult<usize> {
        self.send_inner(handle, None, fragments).await
    }
    /// Send a datagram to `remote`.
    pub async fn send_to(
        &self,
        handle: SocketHandle,
        remote: SocketAddr,
        data: &[u8],
    ) -> ModemResult<usize> {
        self.send_inner(handle, Some(remote), &[data]).await
    }
    async fn send_inner(
        &self,
        handle: SocketHandle,
        to: Option<SocketAddr>,
        fragments: &[&[u8]],
    ) -> ModemResult<usize> {
        let len: usize = fragments.iter().map(|fragment| fragment.len()).sum();
        if len == 0 || len > self.config.mtu {
            return Err(ModemError::InvalidArgument);
        }
        self.with_state(|state| {
            let socket = state.sockets.get(handle)?;
            if socket.is_closed() {
                Err(socket.error.unwrap_or(ModemError::NotConnected))
            } else {
                Ok(())
            }
        })?;

        let mut issuer = self.lock().await;
        self.reconfigure_ip(&mut issuer).await;
        let command = self.with_state(|state| {
            let socket = state.sockets.get_mut(handle)?;
            let id = socket.session.id().ok_or(ModemError::NotConnected)?;
            let command = match socket.kind {
                SocketKind::Stream => command!("AT+KTCPSND={},{}", id, len)?,
                SocketKind::Datagram => {
                    let remote = to.or(socket.remote).ok_or(ModemError::InvalidArgument)?;
                    command!(
                        "AT+KUDPSND={},\"{}\",{},{}",
                        id,
                        remote.ip(),
                        remote.port(),
                        len
                    )?
                }
            };
            socket.begin_send()?;
            Ok::<_, ModemError>(command)
        })?;
        let _cancel = CancelOnDrop {
            modem: self,
            handle,
            release: false,
        };

        let res = async {
            let request = Request::new(&command, self.config.data_timeout).socket(handle);
            if issuer.issue(request).await? != Reply::Connect {
                warn!("Modem didn't enter data mode for {}.", command.as_str());
                return Err(ModemError::Io);
            }
            match issuer
                .send_data(fragments, self.config.data_timeout, handle)
                .await?
            {
                Reply::Ok => Ok(len),
                Reply::Connect => Err(ModemError::Io),
            }
        }
        .await;
        self.with_state(|state| {
            if let Ok(socket) = state.sockets.get_mut(handle) {
                socket.finish_send();
            }
        });
        res
    }

    /// Wait for the next received payload.
    ///
    /// Returns [None] exactly once, when the stream ended. Afterwards the socket reports
    /// [ModemError::NotConnected], or the error that ended it.
    pub async fn receive(&self, handle: SocketHandle) -> ModemResult<Option<Payload>> {
        let channels = &self.shared.sockets[handle.index()];
        let ended = self.with_state(|state| {
            let socket = state.sockets.get(handle)?;
            Ok::<_, ModemError>(
                socket
                    .eof_taken
                    .then(|| socket.error.unwrap_or(ModemError::NotConnected)),
            )
        })?;
        if let Ok(payload) = channels.rx.try_receive() {
            return Ok(Some(payload));
        }
        if let Some(err) = ended {
            return Err(err);
        }
        match select(channels.rx.receive(), channels.eof.wait()).await {
            Either::First(payload) => Ok(Some(payload)),
            Either::Second(()) => {
                self.with_state(|state| {
                    if let Ok(socket) = state.sockets.get_mut(handle) {
                        socket.eof_taken = true;
                    }
                });
                Ok(None)
            }
        }
    }
    /// Take the error recorded on a socket.
    pub fn take_error(&self, handle: SocketHandle) -> ModemResult<Option<ModemError>> {
        self.with_state(|state| Ok(state.sockets.get_mut(handle)?.error.take()))
    }
    pub fn socket_info(&self, handle: SocketHandle) -> ModemResult<SocketInfo> {
        self.with_state(|state| {
            let socket = state.sockets.get(handle)?;
            Ok(SocketInfo {
                kind: socket.kind,
                session: socket.session,
                state: socket.state,
                rx_available: socket.rx_available,
                error: socket.error,
            })
        })
    }
    /// Close a socket and free its slot.
    pub async fn close(&self, handle: SocketHandle) -> ModemResult<()> {
        let (kind, id, peer_closed) = self.with_state(|state| {
            let socket = state.sockets.get(handle)?;
            Ok::<_, ModemError>((
                socket.kind,
                socket.session.id(),
                socket.state == SocketState::ClosedByPeer,
            ))
        })?;
        if let Some(id) = id {
            let mut issuer = self.lock().await;
            let timeout = self.config.command_timeout;
            if kind == SocketKind::Stream && !peer_closed {
                let command = command!("AT+KTCPCLOSE={}", id)?;
                if let Err(err) = issuer.issue_ok(Request::new(&command, timeout)).await {
                    debug!("Closing session {} failed: {:?}", id, err);
                }
            }
            let command = match kind {
                SocketKind::Stream => command!("AT+KTCPDEL={}", id)?,
                SocketKind::Datagram => command!("AT+KUDPCLOSE={}", id)?,
            };
            if let Err(err) = issuer.issue_ok(Request::new(&command, timeout)).await {
                warn!("Deleting session {} failed: {:?}", id, err);
            }
        }
        self.with_state(|state| state.sockets.free(handle));
        self.shared.sockets[handle.index()].reset();
        Ok(())
    }

    /// Process a status line snapshot on the RX loop.
    pub(crate) fn on_pins(&self, pins: PinSnapshot) {
        let delay = self.config.allow_sleep_delay;
        let actions = self.with_state(|state| {
            let actions = state.on_pins(&self.shared, pins);
            if actions.rearm_sleep && state.power.may_sleep() {
                state.work.allow_sleep_at = Some(Instant::now() + delay);
            }
            actions
        });
        if actions.release_lines {
            debug!("Modem lost power, releasing control lines.");
            self.set_line(ControlLine::Wake, false);
            self.set_line(ControlLine::PowerOn, false);
            self.set_line(ControlLine::FastShutdown, false);
        }
        if actions.rearm_sleep {
            self.set_line(ControlLine::Wake, true);
            self.shared.work.put();
        }
    }
}

/// Settles a socket, if the future driving its connect or send is dropped halfway.
struct CancelOnDrop<'m, W: Write, C: ControlLines> {
    modem: &'m Modem<W, C>,
    handle: SocketHandle,
    /// Free the slot, if the connect didn't finish.
    release: bool,
}
impl<W: Write, C: ControlLines> Drop for CancelOnDrop<'_, W, C> {
    fn drop(&mut self) {
        self.modem.with_state(|state| {
            let Ok(socket) = state.sockets.get_mut(self.handle) else {
                return;
            };
            let connecting = socket.state == SocketState::Connecting;
            if socket.abandon() {
                debug!("Send on socket {} was abandoned.", self.handle.index());
                state.data_block_open = true;
            }
            if connecting {
                debug!("Connect on socket {} was abandoned.", self.handle.index());
                if self.release {
                    state.release_socket(&self.modem.shared, Instant::now(), self.handle);
                }
            }
        });
    }
}

/// Keeps the modem awake while alive.
pub struct KeepAwake<'m, W: Write, C: ControlLines> {
    modem: &'m Modem<W, C>,
}
impl<W: Write, C: ControlLines> Drop for KeepAwake<'_, W, C> {
    fn drop(&mut self) {
        let delay = self.modem.config.allow_sleep_delay;
        self.modem.with_state(|state| {
            state.power.keep_awake = state.power.keep_awake.saturating_sub(1);
            if state.power.may_sleep() {
                state.work.allow_sleep_at = Some(Instant::now() + delay);
            }
        });
        self.modem.shared.work.put();
    }
}
