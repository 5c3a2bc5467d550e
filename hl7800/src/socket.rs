//! Socket sessions multiplexed over the serial link.
//!
//! The modem hosts the actual IP stack. It assigns every socket a small session id once it has
//! been configured, and all later commands and notifications for that socket carry that id.
//! Locally, sockets live in a fixed size arena and are referred to by [SocketHandle].

use core::net::SocketAddr;

use macro_bits::serializable_enum;

use crate::{ModemError, ModemResult, MAX_PAYLOAD, MAX_SOCKETS};

/// One received packet, or a chunk of a stream.
pub type Payload = heapless::Vec<u8, MAX_PAYLOAD>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The transport protocol of a socket.
pub enum SocketKind {
    /// TCP
    Stream,
    /// UDP
    Datagram,
}
impl SocketKind {
    /// The IPv4 and transport header overhead, which has to fit into the MTU together with the
    /// payload.
    pub const fn header_overhead(&self) -> usize {
        match self {
            Self::Stream => 40,
            Self::Datagram => 28,
        }
    }
    /// Command stem, which differs between the two kinds.
    pub(crate) const fn stem(&self) -> &'static str {
        match self {
            Self::Stream => "KTCP",
            Self::Datagram => "KUDP",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The session id assigned by the modem.
pub enum SessionId {
    /// The modem hasn't acknowledged the creation yet.
    #[default]
    Pending,
    /// The id assigned by the modem. This is never zero.
    Assigned(u8),
}
impl SessionId {
    /// Create an assigned id, rejecting the invalid id zero.
    pub const fn assigned(id: u8) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(Self::Assigned(id))
        }
    }
    /// The assigned id, if any.
    pub const fn id(&self) -> Option<u8> {
        match self {
            Self::Pending => None,
            Self::Assigned(id) => Some(*id),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Lifecycle state of a socket.
pub enum SocketState {
    #[default]
    Idle,
    /// Creation or connection is in flight.
    Connecting,
    Connected,
    Sending,
    Receiving,
    ClosedByPeer,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Refers to an open socket.
pub struct SocketHandle(pub(crate) u8);
impl SocketHandle {
    /// The index of the socket in the arena.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Codes of `+KTCP_NOTIF` and `+KUDP_NOTIF`.
    pub enum SocketNotification: u8 {
        #[default]
        NetworkError => 0,
        NoMoreSockets => 1,
        MemoryError => 2,
        DnsError => 3,
        Disconnected => 4,
        ConnectionError => 5,
        GenericError => 6,
        ClientRequest => 7,
        DataSent => 8,
        BadSessionId => 9,
        SessionRunning => 10,
        AllSessionsUsed => 11,
        Timeout => 12,
        SslConnectionError => 13,
        SslInitError => 14
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// What the caller has to do after an end-of-stream condition was recorded.
pub enum EndOfStream {
    /// Deliver the end-of-stream now.
    DeliverNow,
    /// A receive is in flight. The receive completion delivers it.
    Deferred,
    /// It was already delivered earlier.
    AlreadyDelivered,
}

#[derive(Clone, Debug)]
/// One socket slot.
pub struct Socket {
    pub kind: SocketKind,
    pub session: SessionId,
    pub state: SocketState,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    /// Bytes the modem reported as available.
    pub rx_available: usize,
    /// Bytes requested by the receive in flight.
    pub rx_expected: usize,
    pub error: Option<ModemError>,
    /// End-of-stream has to be delivered once the receive in flight completes.
    pub close_pending: bool,
    pub eof_delivered: bool,
    /// The application consumed the end-of-stream.
    pub eof_taken: bool,
}
impl Socket {
    fn new(kind: SocketKind) -> Self {
        Self {
            kind,
            session: SessionId::Pending,
            state: SocketState::Idle,
            local: None,
            remote: None,
            rx_available: 0,
            rx_expected: 0,
            error: None,
            close_pending: false,
            eof_delivered: false,
            eof_taken: false,
        }
    }
    /// The state the socket returns to after a transfer.
    const fn resting_state(kind: SocketKind) -> SocketState {
        match kind {
            SocketKind::Stream => SocketState::Connected,
            SocketKind::Datagram => SocketState::Idle,
        }
    }
    /// `IDLE -> CONNECTING`
    pub fn begin_connect(&mut self) -> ModemResult<()> {
        match self.state {
            SocketState::Idle => {
                self.state = SocketState::Connecting;
                Ok(())
            }
            SocketState::Connected => Err(ModemError::InvalidArgument),
            _ => Err(ModemError::NotConnected),
        }
    }
    /// `CONNECTING -> CONNECTED` for streams, or back to `IDLE` for datagram sockets.
    pub fn connected(&mut self) {
        if self.state == SocketState::Connecting {
            self.state = Self::resting_state(self.kind);
        }
    }
    /// Check that a send may start and enter `SENDING`.
    pub fn begin_send(&mut self) -> ModemResult<()> {
        let ready = match (self.kind, self.state) {
            (SocketKind::Stream, SocketState::Connected) => true,
            (SocketKind::Datagram, SocketState::Idle | SocketState::Connected) => {
                self.session.id().is_some()
            }
            _ => false,
        };
        if !ready {
            return Err(self.error.unwrap_or(ModemError::NotConnected));
        }
        self.state = SocketState::Sending;
        Ok(())
    }
    /// Leave `SENDING`.
    pub fn finish_send(&mut self) {
        if self.state == SocketState::Sending {
            self.state = Self::resting_state(self.kind);
        }
    }
    /// Enter `RECEIVING`, consuming the available byte count.
    ///
    /// Returns the amount of bytes to request, which is clamped to what fits into one packet and
    /// into one [Payload].
    pub fn begin_receive(&mut self, mtu: usize) -> Option<usize> {
        if self.state != Self::resting_state(self.kind) || self.rx_available == 0 {
            return None;
        }
        let len = self
            .rx_available
            .min(mtu.saturating_sub(self.kind.header_overhead()))
            .min(MAX_PAYLOAD);
        if len == 0 {
            return None;
        }
        self.rx_available = 0;
        self.rx_expected = len;
        self.state = SocketState::Receiving;
        Some(len)
    }
    /// Leave `RECEIVING`.
    ///
    /// Returns [true], if an end-of-stream was deferred during the receive and has to be
    /// delivered now.
    pub fn finish_receive(&mut self) -> bool {
        self.rx_expected = 0;
        if self.state == SocketState::Receiving {
            self.state = if self.error.is_some_and(|e| e != ModemError::NoBuffers) {
                SocketState::Error
            } else if self.close_pending {
                SocketState::ClosedByPeer
            } else {
                Self::resting_state(self.kind)
            };
        }
        if self.close_pending && !self.eof_delivered {
            self.close_pending = false;
            self.eof_delivered = true;
            true
        } else {
            false
        }
    }
    fn end_of_stream(&mut self) -> EndOfStream {
        if self.eof_delivered {
            EndOfStream::AlreadyDelivered
        } else if self.state == SocketState::Receiving {
            self.close_pending = true;
            EndOfStream::Deferred
        } else {
            self.eof_delivered = true;
            EndOfStream::DeliverNow
        }
    }
    /// The peer closed the connection.
    pub fn peer_closed(&mut self) -> EndOfStream {
        let eos = self.end_of_stream();
        if !matches!(self.state, SocketState::Receiving | SocketState::Error) {
            self.state = SocketState::ClosedByPeer;
        }
        eos
    }
    /// A socket level error occured.
    pub fn fail(&mut self, err: ModemError) -> EndOfStream {
        self.error = Some(err);
        let eos = self.end_of_stream();
        if self.state != SocketState::Receiving {
            self.state = SocketState::Error;
        }
        eos
    }
    /// The modem lost the session, so the id may be handed out again.
    pub fn detach(&mut self) -> EndOfStream {
        self.session = SessionId::Pending;
        self.fail(ModemError::NotConnected)
    }
    /// The future driving a connect or send was dropped halfway.
    ///
    /// Returns [true], if a send was cut short and the modem may still wait for its data.
    pub fn abandon(&mut self) -> bool {
        match self.state {
            SocketState::Sending => {
                self.finish_send();
                true
            }
            SocketState::Connecting => {
                self.error.get_or_insert(ModemError::Timeout);
                self.state = SocketState::Error;
                false
            }
            _ => false,
        }
    }
    /// Check if the socket has ended from the perspective of the application.
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, SocketState::ClosedByPeer | SocketState::Error)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A session the modem reported, which isn't tracked locally.
pub struct StaleSocket {
    pub kind: SocketKind,
    pub id: u8,
}

/// Fixed size arena of sockets.
pub struct SocketTable {
    slots: [Option<Socket>; MAX_SOCKETS],
}
impl SocketTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_SOCKETS],
        }
    }
    /// Take a free slot.
    pub fn allocate(&mut self, kind: SocketKind) -> ModemResult<SocketHandle> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ModemError::NoSockets)?;
        self.slots[index] = Some(Socket::new(kind));
        trace!("Allocated socket slot {}.", index);
        Ok(SocketHandle(index as u8))
    }
    /// Release a slot.
    pub fn free(&mut self, handle: SocketHandle) -> Option<Socket> {
        let socket = self.slots.get_mut(handle.index())?.take();
        if socket.is_some() {
            trace!("Socket slot {} is now free again.", handle.index());
        }
        socket
    }
    pub fn get(&self, handle: SocketHandle) -> ModemResult<&Socket> {
        self.slots
            .get(handle.index())
            .and_then(Option::as_ref)
            .ok_or(ModemError::NotFound)
    }
    pub fn get_mut(&mut self, handle: SocketHandle) -> ModemResult<&mut Socket> {
        self.slots
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or(ModemError::NotFound)
    }
    /// Look up a socket by the session id the modem assigned.
    pub fn find_session(&self, id: u8) -> Option<SocketHandle> {
        self.iter()
            .find(|(_, socket)| socket.session.id() == Some(id))
            .map(|(handle, _)| handle)
    }
    /// Find a socket of this kind, that is still waiting for its session id.
    pub fn find_pending(&self, kind: SocketKind) -> Option<SocketHandle> {
        self.iter()
            .find(|(_, socket)| {
                socket.kind == kind
                    && socket.session == SessionId::Pending
                    && socket.state == SocketState::Connecting
            })
            .map(|(handle, _)| handle)
    }
    /// Iterate over all open sockets.
    pub fn iter(&self) -> impl Iterator<Item = (SocketHandle, &Socket)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| Some((SocketHandle(index as u8), slot.as_ref()?)))
    }
    /// Iterate mutably over all open sockets.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SocketHandle, &mut Socket)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| Some((SocketHandle(index as u8), slot.as_mut()?)))
    }
}
impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}
