//! # `hl7800`
//! This is an async driver for the Sierra Wireless HL7800 LTE-M/NB-IoT modem. The modem hosts the
//! IP stack itself and is controlled over a UART with AT commands. This crate implements the
//! command protocol, socket multiplexing and power management on top of `embassy`.
//! ## Protocol overview
//! This chapter will give a short overview of how the modem talks to us.
//!
//! ### Commands
//! Every command is a line of text terminated by CR. The modem answers with zero or more
//! informational lines followed by a terminal line: `OK`, `ERROR` or `+CME ERROR: <code>`. There
//! is nothing in a reply identifying the command it belongs to, so only one command may be in
//! flight at a time. The driver serializes all commands through one lock and pairs each attempt
//! with a fresh token. A reply arriving after its command timed out is discarded instead of being
//! attributed to the next command.
//!
//! Some queries, like `AT+CGSN`, reply with a bare value without any prefix. These are matched
//! against the command in flight instead.
//!
//! ### Unsolicited notifications
//! The modem reports events on its own at any time, interleaved with replies. Examples are the
//! boot report `+KSUP`, registration changes `+CEREG` and socket notifications like
//! `+KTCP_DATA`. All lines are classified by the longest matching prefix in a static table.
//!
//! ### Sockets
//! The modem assigns every TCP or UDP session an id, which all later commands and notifications
//! carry. Data is exchanged in data mode. After `CONNECT`, the payload is transferred raw and
//! terminated by `--EOF--Pattern--`. Announced data is fetched by the runner in the background and
//! queued per socket.
//!
//! ### Power
//! In low power mode, the modem is kept awake by asserting the wake line while commands are
//! issued. After a period of inactivity, the line is released and the modem drops to the
//! configured sleep level. Its state is tracked through the VGPIO, GPIO6 and CTS status lines,
//! which the application samples in their edge interrupts and passes to [Modem::pin_changed].
//!
//! ## Usage
//! Create a [Modem] with the transmit half of the UART and the [ControlLines]. Then run the
//! [ModemRunner] obtained from [Modem::runner] with the receive half, before calling
//! [Modem::reset] to boot and configure the modem.

#![cfg_attr(not(test), no_std)]
#![allow(unexpected_cfgs)]
pub(crate) mod fmt;

mod config;
mod dispatch;
mod error;
mod event;
mod framer;
mod issuer;
mod modem;
mod parse;
mod pins;
mod power;
mod router;
mod runner;
mod socket;
mod sync;

pub use config::*;
pub use dispatch::{Info, LineKind, PrefixTable, SocketLine, Terminal, Unsolicited};
pub use error::{ModemError, ModemResult};
pub use event::{Event, EventListener, RadioMode, Revision, EVENT_QUEUE_DEPTH, MAX_LISTENERS};
pub use framer::LineFramer;
pub use modem::{KeepAwake, Modem, SocketInfo};
pub use pins::{ControlLine, ControlLines, CtsFilter, GpioControlLines};
pub use power::{NetworkState, PinSnapshot, SleepState, StartupState};
pub use router::ModemInfo;
pub use runner::ModemRunner;
pub use socket::{Payload, SessionId, SocketHandle, SocketKind, SocketNotification, SocketState};

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        pub type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        pub type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
