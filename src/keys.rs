//! Key event types and the fixed-layout wire record exchanged with the
//! macro daemon.

use evdev::{EventType, InputEvent};

/// Event type of a synchronization record (`EV_SYN`).
pub const EV_SYN: u16 = 0x00;
/// Event type of a key record (`EV_KEY`).
pub const EV_KEY: u16 = 0x01;

/// One input record as read from a keyboard device. The daemon treats the
/// fields opaquely apart from comparing `code` against the passthrough set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyEvent {
    pub ev_type: u16,
    pub code: u16,
    pub value: i32,
}

impl KeyEvent {
    pub fn new(ev_type: u16, code: u16, value: i32) -> Self {
        Self {
            ev_type,
            code,
            value,
        }
    }

    pub fn is_syn(&self) -> bool {
        self.ev_type == EV_SYN
    }

    pub fn to_input_event(self) -> InputEvent {
        InputEvent::new(EventType(self.ev_type), self.code, self.value)
    }
}

impl From<InputEvent> for KeyEvent {
    fn from(ev: InputEvent) -> Self {
        Self {
            ev_type: ev.event_type().0,
            code: ev.code(),
            value: ev.value(),
        }
    }
}

/// The record exchanged with the macro daemon. A reply stream is terminated
/// by the first record whose `done` byte is non-zero; that terminator's
/// event fields are never emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KbdAction {
    pub ev: KeyEvent,
    pub done: u8,
}

impl KbdAction {
    /// Size of one wire record: `type:u16 code:u16 value:i32 done:u8` plus
    /// three bytes of padding, little-endian throughout.
    pub const WIRE_LEN: usize = 12;

    pub fn from_event(ev: KeyEvent) -> Self {
        Self { ev, done: 0 }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..2].copy_from_slice(&self.ev.ev_type.to_le_bytes());
        buf[2..4].copy_from_slice(&self.ev.code.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ev.value.to_le_bytes());
        buf[8] = self.done;
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::WIRE_LEN]) -> Self {
        Self {
            ev: KeyEvent {
                ev_type: u16::from_le_bytes([buf[0], buf[1]]),
                code: u16::from_le_bytes([buf[2], buf[3]]),
                value: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            },
            done: buf[8],
        }
    }
}
