//! Power, registration and boot state of the modem.
//!
//! ## Sleep
//! The modem signals its state through three input lines. It is able to accept commands, when
//! VGPIO and GPIO6 are high and CTS is low. The driver keeps it awake by asserting the wake line.
//! Once nothing has been sent for a while, the wake line is released and the modem may drop to
//! the configured sleep level on its own. Coming back from the hibernate levels is a reboot from
//! the modem's point of view, so it reports `+KSUP` again, which we wait for before considering
//! it awake.
//!
//! Interrupt handlers only capture a [PinSnapshot] and queue it. The evaluation below runs on
//! the RX loop.

use bitfield_struct::bitfield;
use macro_bits::serializable_enum;

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
/// The levels of the modem's status lines at one point in time.
pub struct PinSnapshot {
    pub vgpio: bool,
    pub gpio6: bool,
    pub cts: bool,
    #[bits(5)]
    pub __: u8,
}
impl PinSnapshot {
    /// Check if the modem is able to accept commands.
    pub const fn is_command_ready(&self) -> bool {
        self.vgpio() && self.gpio6() && !self.cts()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Sleep level of the modem.
pub enum SleepState {
    /// Nothing is known yet.
    #[default]
    Uninitialized,
    Hibernate,
    LiteHibernate,
    Sleep,
    Awake,
}
impl SleepState {
    /// Check if waking up from this level involves a reboot of the modem.
    pub const fn is_hibernate(&self) -> bool {
        matches!(self, Self::Hibernate | Self::LiteHibernate)
    }
    /// The `AT+KSLEEP` command selecting this level.
    pub const fn sleep_command(&self) -> &'static str {
        match self {
            Self::Hibernate => "AT+KSLEEP=1,2,10",
            Self::LiteHibernate => "AT+KSLEEP=1,1,10",
            Self::Sleep => "AT+KSLEEP=1,0,10",
            Self::Awake | Self::Uninitialized => "AT+KSLEEP=2,0,10",
        }
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// EPS registration state, as reported by `+CEREG`.
    pub enum NetworkState: u8 {
        #[default]
        NotRegistered => 0,
        HomeNetwork => 1,
        Searching => 2,
        RegistrationDenied => 3,
        OutOfCoverage => 4,
        Roaming => 5,
        Emergency => 8,
        UnableToConfigure => 0xf0
    }
}
impl NetworkState {
    /// Check if data can be exchanged.
    pub const fn is_registered(&self) -> bool {
        matches!(self, Self::HomeNetwork | Self::Roaming)
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Boot state, as reported by `+KSUP`.
    pub enum StartupState: u8 {
        Ready => 0,
        WaitingForAccessCode => 1,
        SimNotPresent => 2,
        SimLock => 3,
        UnrecoverableError => 4,
        #[default]
        Undetermined => 5,
        InactiveSim => 6
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Side effects of a power state evaluation, which are carried out by the caller.
pub struct PowerActions {
    /// The sleep state changed to this.
    pub sleep_changed: Option<SleepState>,
    /// The modem became awake, so waiters have to be released.
    pub awake: bool,
    /// The modem lost power, so the control lines have to be released.
    pub release_lines: bool,
    /// Sleep should be allowed again after the idle delay.
    pub rearm_sleep: bool,
}

/// Sleep bookkeeping.
#[derive(Clone, Debug)]
pub struct PowerState {
    pub sleep: SleepState,
    pub desired: SleepState,
    pub pins: PinSnapshot,
    pub low_power: bool,
    /// The wake line is released and the modem may sleep.
    pub allow_sleep: bool,
    /// An issuer is currently holding the transport.
    pub busy: bool,
    /// Number of outstanding keep awake guards.
    pub keep_awake: u8,
    /// The modem is expected to report `+KSUP` before it accepts commands.
    pub wait_for_ksup: bool,
    pub wait_for_ksup_tries: u8,
    /// The modem was powered off on purpose.
    pub off: bool,
    pub restarting: bool,
}
impl PowerState {
    pub const fn new(low_power: bool, desired: SleepState) -> Self {
        Self {
            sleep: SleepState::Uninitialized,
            desired,
            pins: PinSnapshot::new(),
            low_power,
            allow_sleep: false,
            busy: false,
            keep_awake: 0,
            wait_for_ksup: false,
            wait_for_ksup_tries: 0,
            off: false,
            restarting: false,
        }
    }
    /// Check if the modem is awake.
    pub const fn is_awake(&self) -> bool {
        matches!(self.sleep, SleepState::Awake)
    }
    /// Check if the idle timeout may move the modem to sleep.
    pub const fn may_sleep(&self) -> bool {
        self.low_power && !self.busy && !self.restarting && self.keep_awake == 0
    }
    fn set_sleep(&mut self, state: SleepState, actions: &mut PowerActions) {
        if self.sleep != state {
            self.sleep = state;
            actions.sleep_changed = Some(state);
        }
    }
    /// Decide whether the modem is awake, based on the last pin snapshot.
    pub fn evaluate(&mut self, actions: &mut PowerActions) {
        if !self.low_power {
            return;
        }
        let ready = self.pins.is_command_ready();
        if ready && !self.is_awake() && !self.allow_sleep && !self.wait_for_ksup {
            debug!("Modem is awake.");
            self.set_sleep(SleepState::Awake, actions);
            actions.awake = true;
        } else if !ready && self.is_awake() && self.allow_sleep {
            debug!("Modem is no longer awake.");
            if self.desired.is_hibernate() {
                self.wait_for_ksup = true;
                self.wait_for_ksup_tries = 0;
                self.set_sleep(self.desired, actions);
            } else if self.desired == SleepState::Sleep {
                self.set_sleep(SleepState::Sleep, actions);
            }
        }
    }
    /// Process a new snapshot of the status lines.
    pub fn on_pins(&mut self, pins: PinSnapshot) -> PowerActions {
        let mut actions = PowerActions::default();
        let previous = core::mem::replace(&mut self.pins, pins);
        trace!(
            "Status lines: VGPIO {} GPIO6 {} CTS {}",
            pins.vgpio(),
            pins.gpio6(),
            pins.cts()
        );
        if previous.vgpio() && !pins.vgpio() {
            // The modem is powering down or resetting.
            actions.release_lines = true;
            self.wait_for_ksup = true;
            self.wait_for_ksup_tries = 0;
            if self.desired.is_hibernate() {
                self.set_sleep(self.desired, &mut actions);
            }
        } else if self.low_power
            && !self.off
            && pins.vgpio()
            && (!previous.vgpio() || !previous.gpio6())
        {
            // The modem woke up on its own, so give it a chance to send what it has.
            self.hold_awake();
            actions.rearm_sleep = true;
        }
        if self.low_power && previous.gpio6() && !pins.gpio6() {
            self.wait_for_ksup = true;
            self.wait_for_ksup_tries = 0;
        }
        self.evaluate(&mut actions);
        actions
    }
    /// The modem booted and reported `+KSUP`.
    pub fn on_startup_report(&mut self) -> PowerActions {
        let mut actions = PowerActions::default();
        self.wait_for_ksup = false;
        self.set_sleep(SleepState::Awake, &mut actions);
        actions.awake = true;
        actions
    }
    /// The idle timeout expired. Returns [None], if sleep isn't allowed right now.
    pub fn on_idle(&mut self) -> Option<PowerActions> {
        if !self.may_sleep() {
            return None;
        }
        let mut actions = PowerActions::default();
        self.allow_sleep = true;
        self.set_sleep(self.desired, &mut actions);
        Some(actions)
    }
    /// Someone needs the modem, so the wake line is asserted again.
    pub fn hold_awake(&mut self) {
        self.allow_sleep = false;
    }
    /// The modem is reset by the driver.
    pub fn on_reset(&mut self) -> PowerActions {
        let mut actions = PowerActions::default();
        self.set_sleep(SleepState::Uninitialized, &mut actions);
        self.wait_for_ksup = true;
        self.wait_for_ksup_tries = 0;
        self.allow_sleep = false;
        actions
    }
}
