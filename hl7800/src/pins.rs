//! Control and status lines of the modem.

use embassy_time::{block_for, Duration, Instant};
use embedded_hal::digital::{InputPin, OutputPin};

use crate::PinSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Output lines driven by the driver.
pub enum ControlLine {
    /// Active low reset.
    Reset,
    /// Keeps the modem awake while asserted.
    Wake,
    PowerOn,
    FastShutdown,
}

/// Drives the modem's control lines.
///
/// `asserted` is the logical state. Implementations take care of the polarity of each line.
pub trait ControlLines {
    fn set(&mut self, line: ControlLine, asserted: bool);
}

/// [ControlLines] on top of `embedded-hal` output pins.
///
/// The reset line is active low, all other lines are active high.
pub struct GpioControlLines<Reset, Wake, PowerOn, FastShutdown> {
    pub reset: Reset,
    pub wake: Wake,
    pub power_on: PowerOn,
    pub fast_shutdown: FastShutdown,
}
impl<Reset, Wake, PowerOn, FastShutdown> ControlLines
    for GpioControlLines<Reset, Wake, PowerOn, FastShutdown>
where
    Reset: OutputPin,
    Wake: OutputPin,
    PowerOn: OutputPin,
    FastShutdown: OutputPin,
{
    fn set(&mut self, line: ControlLine, asserted: bool) {
        // Failing to drive a pin isn't recoverable in any meaningful way, so this is only logged.
        let res = match line {
            ControlLine::Reset => self.reset.set_state((!asserted).into()).is_ok(),
            ControlLine::Wake => self.wake.set_state(asserted.into()).is_ok(),
            ControlLine::PowerOn => self.power_on.set_state(asserted.into()).is_ok(),
            ControlLine::FastShutdown => self.fast_shutdown.set_state(asserted.into()).is_ok(),
        };
        if !res {
            error!("Failed to drive control line {:?}.", line);
        }
    }
}

impl PinSnapshot {
    /// Read the status lines.
    ///
    /// A line, that can't be read, is taken to be in its "not ready" state.
    pub fn sample(
        vgpio: &mut impl InputPin,
        gpio6: &mut impl InputPin,
        cts: &mut impl InputPin,
    ) -> Self {
        PinSnapshot::new()
            .with_vgpio(vgpio.is_high().unwrap_or(false))
            .with_gpio6(gpio6.is_high().unwrap_or(false))
            .with_cts(cts.is_high().unwrap_or(true))
    }
}

/// Software glitch filter for the CTS line.
///
/// CTS toggles rapidly while the modem's UART changes state. An edge arriving within the filter
/// window of the previous edge is ignored. Otherwise the line is sampled again after the window
/// and the edge only counts if the level held.
pub struct CtsFilter {
    window: Duration,
    last_edge: Option<Instant>,
    level: Option<bool>,
}
impl CtsFilter {
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            last_edge: None,
            level: None,
        }
    }
    /// Filter an edge on the CTS line.
    ///
    /// This is meant to run in the edge interrupt and busy waits for the filter window.
    /// Returns the new level, if it changed.
    pub fn on_edge(&mut self, now: Instant, mut sample: impl FnMut() -> bool) -> Option<bool> {
        let level = sample();
        let too_soon = self
            .last_edge
            .and_then(|last| now.checked_duration_since(last))
            .is_some_and(|elapsed| elapsed <= self.window);
        self.last_edge = Some(now);
        if too_soon {
            return None;
        }
        block_for(self.window);
        if sample() != level || self.level == Some(level) {
            return None;
        }
        self.level = Some(level);
        Some(level)
    }
}
