use embassy_time::Duration;

use crate::SleepState;

/// The maximum number of sockets the modem supports at the same time.
pub const MAX_SOCKETS: usize = 6;
/// The largest IP packet the modem exchanges with us.
pub const MAX_PAYLOAD: usize = 1500;
/// Received payloads, that may be queued per socket.
pub const RX_QUEUE_DEPTH: usize = 2;
/// Size of the line framer's buffer. This has to fit a whole payload plus its trailer.
pub const RX_BUFFER_SIZE: usize = 2048;
/// The longest command we format.
pub const MAX_COMMAND_LEN: usize = 160;
/// The longest access point name.
pub const MAX_APN_LEN: usize = 64;
/// Marks the end of a raw data block in both directions.
pub const EOF_PATTERN: &[u8] = b"--EOF--Pattern--";

/// An access point name.
pub type Apn = heapless::String<MAX_APN_LEN>;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Runtime configuration of the driver.
pub struct ModemConfig {
    /// How long to wait for the reply to an ordinary command.
    pub command_timeout: Duration,
    /// How long to wait for a TCP connection to be established.
    pub connect_timeout: Duration,
    /// How long to wait for `CONNECT` and the final `OK` of a data transfer.
    pub data_timeout: Duration,
    /// How long to wait for the modem to wake up.
    pub wakeup_timeout: Duration,
    /// How long to wait for `+KSUP` after a reset.
    pub boot_timeout: Duration,
    /// How long a raw data block may stall, before it is abandoned.
    pub raw_data_timeout: Duration,
    /// Attempts for commands, that are retried on timeout.
    pub retries: u8,
    /// Idle time after the last command, before the modem is allowed to sleep.
    pub allow_sleep_delay: Duration,
    /// Period of signal quality polling while registered. Zero disables polling.
    pub signal_quality_period: Duration,
    pub mtu: usize,
    /// Manage sleep through the wake and status lines.
    pub low_power: bool,
    /// The sleep level the modem should enter when idle.
    pub sleep_level: SleepState,
    /// Access point name to configure. If [None], the name stored in the modem is kept.
    pub apn: Option<Apn>,
    /// Have the modem restore socket configurations after reboots.
    pub restore_on_boot: bool,
    /// Window of the CTS glitch filter.
    pub cts_filter: Duration,
}
impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(6),
            connect_timeout: Duration::from_secs(31),
            data_timeout: Duration::from_secs(62),
            wakeup_timeout: Duration::from_secs(12),
            boot_timeout: Duration::from_secs(12),
            raw_data_timeout: Duration::from_secs(1),
            retries: 3,
            allow_sleep_delay: Duration::from_secs(5),
            signal_quality_period: Duration::from_secs(30),
            mtu: MAX_PAYLOAD,
            low_power: false,
            sleep_level: SleepState::Hibernate,
            apn: None,
            restore_on_boot: false,
            cts_filter: Duration::from_micros(10),
        }
    }
}
