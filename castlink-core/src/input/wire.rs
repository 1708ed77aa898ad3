//! Inbound client messages.
//!
//! ```json
//! {"Type":"gamepad","Buttons":4096,"LeftX":0.0,"LeftY":0.0,"RightX":0.0,"RightY":0.0,"LeftTrigger":0.0,"RightTrigger":0.0}
//! {"Type":"mouse","Dx":3,"Dy":-1,"Buttons":0,"Wheel":0}
//! {"Type":"keyboard","Key":65,"Down":true}
//! {"Type":"latency","RttMs":12.5}
//! ```
//!
//! Every field is required. An unknown `Type` or a missing field is a
//! malformed message and is dropped.

use serde::{Deserialize, Serialize};

use crate::error::InputError;
use crate::input::frame::{KeyEvent, MouseState, RawGamepad, RawInput, Stick};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GamepadMessage {
    pub buttons: u32,
    pub left_x: f32,
    pub left_y: f32,
    pub right_x: f32,
    pub right_y: f32,
    pub left_trigger: f32,
    pub right_trigger: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MouseMessage {
    pub dx: i32,
    pub dy: i32,
    pub buttons: u8,
    pub wheel: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyboardMessage {
    pub key: u16,
    pub down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencyMessage {
    pub rtt_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type", rename_all = "lowercase")]
pub enum ClientMessage {
    Gamepad(GamepadMessage),
    Mouse(MouseMessage),
    Keyboard(KeyboardMessage),
    /// Client-measured round trip, fed to quality control.
    Latency(LatencyMessage),
}

impl ClientMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self, InputError> {
        serde_json::from_slice(bytes).map_err(|e| InputError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Plain numeric fields always serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// The input part of this message; `None` for latency reports.
    pub fn into_raw(self) -> Option<RawInput> {
        match self {
            Self::Gamepad(g) => Some(RawInput {
                gamepad: Some(RawGamepad {
                    buttons: g.buttons,
                    left_stick: Stick::new(g.left_x, g.left_y),
                    right_stick: Stick::new(g.right_x, g.right_y),
                    left_trigger: g.left_trigger,
                    right_trigger: g.right_trigger,
                }),
                ..RawInput::default()
            }),
            Self::Mouse(m) => Some(RawInput {
                mouse: Some(MouseState {
                    dx: m.dx,
                    dy: m.dy,
                    buttons: m.buttons,
                    wheel: m.wheel,
                }),
                ..RawInput::default()
            }),
            Self::Keyboard(k) => Some(RawInput {
                key_events: vec![KeyEvent {
                    key: k.key,
                    down: k.down,
                }],
                ..RawInput::default()
            }),
            Self::Latency(_) => None,
        }
    }
}
