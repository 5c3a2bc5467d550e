//! Classification of framed lines.
//!
//! Every line the modem sends is one of a few kinds: a terminal reply to the command in flight,
//! an unsolicited notification, a socket scoped message or an informational reply to a query.
//! Lines are classified by the longest table prefix they start with, so the order of the table
//! entries doesn't matter and a short prefix can never shadow a longer one.

use crate::socket::SocketKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Replies, which end the command in flight.
pub enum Terminal {
    Ok,
    Error,
    /// `+CME ERROR: <code>`
    CmeError,
    /// `+CMS ERROR: <code>`
    CmsError,
    /// `+CEER: <report>`
    ExtendedError,
    NoCarrier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Notifications, which may arrive at any time.
pub enum Unsolicited {
    /// `+KSUP: <state>`, sent once the modem has booted.
    StartupReport,
    /// `+CEREG: <stat>,...`
    NetworkReport,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Messages concerning one socket session.
pub enum SocketLine {
    /// `+KTCPCFG: <id>` / `+KUDPCFG: <id>`
    Created(SocketKind),
    /// `+KTCP_IND: <id>,<status>` / `+KUDP_IND: <id>,<status>`
    Indication(SocketKind),
    /// `+KTCP_NOTIF: <id>,<code>` / `+KUDP_NOTIF: <id>,<code>`
    Notification(SocketKind),
    /// `+KTCP_DATA: <id>,<len>` / `+KUDP_DATA: <id>,<len>`
    DataAvailable(SocketKind),
    /// `CONNECT`, which opens data mode.
    Connect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Informational replies to queries.
pub enum Info {
    Manufacturer,
    Model,
    Revision,
    Imei,
    SerialNumber,
    Imsi,
    /// The reply to `AT+CEREG?`, which is shaped `<n>,<stat>`.
    NetworkQuery,
    Iccid,
    RadioMode,
    PdpContext,
    Operator,
    Functionality,
    CellMeasurement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The kind of a line.
pub enum LineKind {
    Terminal(Terminal),
    Unsolicited(Unsolicited),
    SocketScoped(SocketLine),
    Info(Info),
}

/// A set of prefixes, matched by longest prefix.
pub struct PrefixTable<'a, T> {
    entries: &'a [(&'a str, T)],
}
impl<'a, T: Copy> PrefixTable<'a, T> {
    pub const fn new(entries: &'a [(&'a str, T)]) -> Self {
        Self { entries }
    }
    /// Find the entry with the longest prefix of `line`.
    ///
    /// Returns the entry's value and the remainder of the line after the prefix.
    pub fn lookup<'l>(&self, line: &'l [u8]) -> Option<(T, &'l [u8])> {
        self.entries
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_bytes()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, value)| (*value, &line[prefix.len()..]))
    }
}

/// Every prefixed line the modem may send.
pub static LINE_TABLE: PrefixTable<'static, LineKind> = PrefixTable::new(&[
    ("OK", LineKind::Terminal(Terminal::Ok)),
    ("ERROR", LineKind::Terminal(Terminal::Error)),
    ("+CME ERROR: ", LineKind::Terminal(Terminal::CmeError)),
    ("+CMS ERROR: ", LineKind::Terminal(Terminal::CmsError)),
    ("+CEER: ", LineKind::Terminal(Terminal::ExtendedError)),
    ("NO CARRIER", LineKind::Terminal(Terminal::NoCarrier)),
    ("+KSUP: ", LineKind::Unsolicited(Unsolicited::StartupReport)),
    ("+CEREG: ", LineKind::Unsolicited(Unsolicited::NetworkReport)),
    ("CONNECT", LineKind::SocketScoped(SocketLine::Connect)),
    (
        "+KTCPCFG: ",
        LineKind::SocketScoped(SocketLine::Created(SocketKind::Stream)),
    ),
    (
        "+KUDPCFG: ",
        LineKind::SocketScoped(SocketLine::Created(SocketKind::Datagram)),
    ),
    (
        "+KTCP_IND: ",
        LineKind::SocketScoped(SocketLine::Indication(SocketKind::Stream)),
    ),
    (
        "+KUDP_IND: ",
        LineKind::SocketScoped(SocketLine::Indication(SocketKind::Datagram)),
    ),
    (
        "+KTCP_NOTIF: ",
        LineKind::SocketScoped(SocketLine::Notification(SocketKind::Stream)),
    ),
    (
        "+KUDP_NOTIF: ",
        LineKind::SocketScoped(SocketLine::Notification(SocketKind::Datagram)),
    ),
    (
        "+KTCP_DATA: ",
        LineKind::SocketScoped(SocketLine::DataAvailable(SocketKind::Stream)),
    ),
    (
        "+KUDP_DATA: ",
        LineKind::SocketScoped(SocketLine::DataAvailable(SocketKind::Datagram)),
    ),
    ("+CCID: ", LineKind::Info(Info::Iccid)),
    ("+KSRAT: ", LineKind::Info(Info::RadioMode)),
    ("+CGDCONT: 1,", LineKind::Info(Info::PdpContext)),
    ("+COPS: ", LineKind::Info(Info::Operator)),
    ("+CFUN: ", LineKind::Info(Info::Functionality)),
    ("+KCELLMEAS: ", LineKind::Info(Info::CellMeasurement)),
]);

/// Commands, whose reply line carries no prefix.
///
/// These are matched against the command text instead of the reply.
pub static ECHO_TABLE: PrefixTable<'static, Info> = PrefixTable::new(&[
    ("AT+CGMI", Info::Manufacturer),
    ("AT+CGMM", Info::Model),
    ("AT+CGMR", Info::Revision),
    ("AT+CGSN", Info::Imei),
    ("AT+KGSN=3", Info::SerialNumber),
    ("AT+CIMI", Info::Imsi),
    ("AT+CEREG?", Info::NetworkQuery),
]);

/// The longest command, that can be matched in echo mode.
pub const MAX_ECHO_COMMAND_LEN: usize = 32;

/// The result of classifying one line.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch<'l> {
    /// Blank line, which carries nothing.
    Empty,
    /// The line matched an entry.
    Matched(LineKind, &'l [u8]),
    /// No entry matched the line.
    Unmatched,
}

/// Classifies lines, optionally expecting an unprefixed reply to the command in flight.
///
/// While echo mode is armed, the next line that isn't a terminal reply is matched against the
/// command text. Since that line has no prefix of its own, an unsolicited notification arriving
/// in this window gets attributed to the command. There is no way to tell them apart on the
/// wire.
pub struct Dispatcher {
    echo: Option<heapless::String<MAX_ECHO_COMMAND_LEN>>,
}
impl Dispatcher {
    pub const fn new() -> Self {
        Self { echo: None }
    }
    /// Expect the next reply line to belong to `command`.
    ///
    /// Commands without an entry in [ECHO_TABLE] don't arm echo mode.
    pub fn expect_echo(&mut self, command: &str) {
        self.echo = match ECHO_TABLE.lookup(command.as_bytes()) {
            Some(_) => heapless::String::try_from(command).ok(),
            None => None,
        };
    }
    /// Disarm echo mode.
    pub fn cancel_echo(&mut self) {
        self.echo = None;
    }
    /// Check if echo mode is armed.
    #[cfg(test)]
    pub const fn expecting_echo(&self) -> bool {
        self.echo.is_some()
    }
    /// Classify a line.
    pub fn classify<'l>(&mut self, line: &'l [u8]) -> Dispatch<'l> {
        if line.is_empty() {
            return Dispatch::Empty;
        }
        let table_match = LINE_TABLE.lookup(line);
        if let Some((kind @ LineKind::Terminal(_), rest)) = table_match {
            return Dispatch::Matched(kind, rest);
        }
        if let Some(command) = self.echo.take() {
            if let Some((info, _)) = ECHO_TABLE.lookup(command.as_bytes()) {
                return Dispatch::Matched(LineKind::Info(info), line);
            }
        }
        match table_match {
            Some((kind, rest)) => Dispatch::Matched(kind, rest),
            None => Dispatch::Unmatched,
        }
    }
}
impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
