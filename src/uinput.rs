//! The synthetic output keyboard.
//!
//! Every event the daemon forwards or receives from the macro daemon is
//! queued here and written to the kernel in groups: `flush` terminates a
//! group with a `SYN_REPORT` barrier so downstream consumers observe it
//! atomically.

use crate::keys::KeyEvent;
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, BusType, InputId, Key};
use std::io;

pub struct UinputKbd {
    device: VirtualDevice,
    queue: Vec<evdev::InputEvent>,
}

impl UinputKbd {
    /// Create the virtual keyboard, advertising the full keyboard key range.
    pub fn new() -> io::Result<Self> {
        let mut keys = AttributeSet::new();
        for k in 0..300u16 {
            keys.insert(Key(k));
        }
        let device = VirtualDeviceBuilder::new()?
            .name("keygated")
            .input_id(InputId::new(BusType::BUS_USB, 1, 1, 1))
            .with_keys(&keys)?
            .build()?;
        log::info!("created virtual output keyboard");
        Ok(Self {
            device,
            queue: Vec::new(),
        })
    }

    /// Queue one event for the next flush.
    pub fn emit(&mut self, ev: &KeyEvent) {
        self.queue.push(ev.to_input_event());
    }

    /// Write the queued group followed by a synchronization barrier.
    pub fn flush(&mut self) -> io::Result<()> {
        self.device.emit(&self.queue)?;
        self.queue.clear();
        Ok(())
    }
}
