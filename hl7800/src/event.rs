//! State change notifications.
//!
//! Nobody waits synchronously for these, so they are fanned out through a publish-subscribe
//! channel. Each listener has its own queue. A listener, that doesn't keep up, loses the oldest
//! events.

use embassy_sync::pubsub::{PubSubChannel, Subscriber};

use crate::{Apn, DefaultRawMutex, NetworkState, SleepState, StartupState};

/// Events buffered per listener.
pub const EVENT_QUEUE_DEPTH: usize = 8;
/// The maximum number of registered listeners.
pub const MAX_LISTENERS: usize = 4;

/// Version string of the modem firmware.
pub type Revision = heapless::String<32>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The LTE flavour used by the modem.
pub enum RadioMode {
    #[default]
    CatM1,
    NbIot,
}
impl RadioMode {
    pub(crate) const fn from_ksrat(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::CatM1),
            1 => Some(Self::NbIot),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A change of modem state.
pub enum Event {
    NetworkState(NetworkState),
    StartupState(StartupState),
    SleepState(SleepState),
    /// Reference signal received power in dBm and signal to interference plus noise ratio in dB.
    SignalQuality { rsrp: i16, sinr: i16 },
    ApnUpdated(Apn),
    RadioMode(RadioMode),
    Revision(Revision),
}

pub(crate) type EventChannel =
    PubSubChannel<DefaultRawMutex, Event, EVENT_QUEUE_DEPTH, MAX_LISTENERS, 1>;

/// A registered event listener. Dropping it unregisters it.
pub type EventListener<'a> =
    Subscriber<'a, DefaultRawMutex, Event, EVENT_QUEUE_DEPTH, MAX_LISTENERS, 1>;
