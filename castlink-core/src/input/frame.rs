//! Raw and normalized input frames.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Gamepad button set, XInput bit layout plus extended buttons.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct GamepadButtons: u32 {
        const DPAD_UP        = 1 << 0;
        const DPAD_DOWN      = 1 << 1;
        const DPAD_LEFT      = 1 << 2;
        const DPAD_RIGHT     = 1 << 3;
        const START          = 1 << 4;
        const BACK           = 1 << 5;
        const LEFT_THUMB     = 1 << 6;
        const RIGHT_THUMB    = 1 << 7;
        const LEFT_SHOULDER  = 1 << 8;
        const RIGHT_SHOULDER = 1 << 9;
        const GUIDE          = 1 << 10;
        const MISC           = 1 << 11;
        const A              = 1 << 12;
        const B              = 1 << 13;
        const X              = 1 << 14;
        const Y              = 1 << 15;
        const PADDLE1        = 1 << 16;
        const PADDLE2        = 1 << 17;
        const PADDLE3        = 1 << 18;
        const PADDLE4        = 1 << 19;
        const TOUCHPAD       = 1 << 20;
    }
}

impl GamepadButtons {
    /// Index of the single set bit, if exactly one is set.
    pub fn single_bit_index(self) -> Option<u32> {
        (self.bits().count_ones() == 1).then(|| self.bits().trailing_zeros())
    }
}

/// Analog stick position, both axes in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Stick {
    pub x: f32,
    pub y: f32,
}

impl Stick {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Relative mouse motion for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MouseState {
    pub dx: i32,
    pub dy: i32,
    /// Bit 0 left, bit 1 right, bit 2 middle, bits 3-4 extra buttons.
    pub buttons: u8,
    pub wheel: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    /// Platform virtual-key code.
    pub key: u16,
    pub down: bool,
}

/// Gamepad state exactly as the client reported it.
///
/// `buttons` is the raw inbound bit set: any of the 32 bits may be
/// set, including ones without a [`GamepadButtons`] name.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawGamepad {
    pub buttons: u32,
    pub left_stick: Stick,
    pub right_stick: Stick,
    pub left_trigger: f32,
    pub right_trigger: f32,
}

/// One inbound client message before profile transforms.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawInput {
    pub gamepad: Option<RawGamepad>,
    pub mouse: Option<MouseState>,
    pub key_events: Vec<KeyEvent>,
}

/// Gamepad state after remapping, swaps and deadzones.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GamepadFrame {
    pub left_stick: Stick,
    pub right_stick: Stick,
    pub left_trigger: f32,
    pub right_trigger: f32,
    pub buttons: GamepadButtons,
}

/// What the injection sink receives.
///
/// Absent parts were not in the inbound message and leave the
/// corresponding device untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputFrame {
    pub gamepad: Option<GamepadFrame>,
    pub mouse: Option<MouseState>,
    pub key_events: Vec<KeyEvent>,
}
