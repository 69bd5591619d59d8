use anyhow::Context;
use log::debug;
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};

use crate::dispatch::EdgeSender;
use crate::messages::ButtonTag;

/// An output line driving an LED or similar.
pub trait Indicator {
    fn set(&mut self, on: bool);
    fn is_on(&self) -> bool;
}

impl Indicator for OutputPin {
    fn set(&mut self, on: bool) {
        if on {
            self.set_high();
        } else {
            self.set_low();
        }
    }

    fn is_on(&self) -> bool {
        self.is_set_high()
    }
}

pub fn output(gpio: &Gpio, pin: u8) -> anyhow::Result<OutputPin> {
    let mut line = gpio
        .get(pin)
        .with_context(|| format!("acquiring output line {pin}"))?
        .into_output();
    line.set_low();
    Ok(line)
}

/// Pull-up input whose falling edge queues `tag`. The callback runs on rppal's
/// interrupt thread, so it only ever attempts a non-blocking enqueue.
///
/// The interrupt stays registered for as long as the returned pin is alive.
pub fn watch_button(
    gpio: &Gpio,
    pin: u8,
    tag: ButtonTag,
    edges: EdgeSender,
) -> anyhow::Result<InputPin> {
    let mut line = gpio
        .get(pin)
        .with_context(|| format!("acquiring input line {pin}"))?
        .into_input_pullup();
    line.set_async_interrupt(Trigger::FallingEdge, move |_level| edges.on_edge(tag))
        .with_context(|| format!("registering falling edge interrupt on line {pin}"))?;
    debug!(target: "gpio", "Watching {} button on line {}", tag.name(), pin);
    Ok(line)
}
