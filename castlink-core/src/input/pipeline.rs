//! Pure input transforms: swap, deadzone, remap.

use crate::input::frame::{GamepadButtons, GamepadFrame, InputFrame, RawGamepad, RawInput, Stick};
use crate::input::profile::{ButtonAction, MappingProfile, SpecialAction};

/// Largest usable deadzone; 1.0 would divide by zero.
const MAX_DEADZONE: f32 = 0.99;

/// Output of [`process_input`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessedInput {
    pub frame: InputFrame,
    pub special: Vec<SpecialAction>,
}

/// Rescale `v` so the band `(-d, d)` reads as zero and the rest of the
/// range still spans `[-1, 1]`.
///
/// The input is clamped to `[-1, 1]` and `d` to `[0, 0.99]` first; the
/// output is continuous in `v`.
pub fn apply_deadzone(v: f32, d: f32) -> f32 {
    if v.is_nan() {
        return 0.0;
    }
    let v = v.clamp(-1.0, 1.0);
    let d = if d.is_nan() { 0.0 } else { d.clamp(0.0, MAX_DEADZONE) };
    if v.abs() < d {
        return 0.0;
    }
    (v.signum() * (v.abs() - d) / (1.0 - d)).clamp(-1.0, 1.0)
}

/// Apply `profile` to one inbound message.
///
/// Pure function of its arguments: the same input under the same
/// profile always yields the same frame and actions.
pub fn process_input(raw: &RawInput, profile: &MappingProfile) -> ProcessedInput {
    let mut special = Vec::new();
    let gamepad = raw
        .gamepad
        .as_ref()
        .map(|pad| process_gamepad(pad, profile, &mut special));

    ProcessedInput {
        frame: InputFrame {
            gamepad,
            mouse: raw.mouse,
            key_events: raw.key_events.clone(),
        },
        special,
    }
}

fn process_gamepad(
    pad: &RawGamepad,
    profile: &MappingProfile,
    special: &mut Vec<SpecialAction>,
) -> GamepadFrame {
    let (left, right) = if profile.stick_swap {
        (pad.right_stick, pad.left_stick)
    } else {
        (pad.left_stick, pad.right_stick)
    };
    let (lt, rt) = if profile.trigger_swap {
        (pad.right_trigger, pad.left_trigger)
    } else {
        (pad.left_trigger, pad.right_trigger)
    };

    let dz = &profile.deadzones;
    let mut buttons = GamepadButtons::empty();
    let mut bits = pad.buttons;
    while bits != 0 {
        let bit = bits.trailing_zeros();
        bits &= bits - 1;
        match profile.action_for_bit(bit) {
            Some(ButtonAction::Gamepad(out)) => buttons |= out,
            Some(ButtonAction::Special(action)) => special.push(action),
            None => {}
        }
    }

    GamepadFrame {
        left_stick: Stick::new(
            apply_deadzone(left.x, dz.left_stick),
            apply_deadzone(left.y, dz.left_stick),
        ),
        right_stick: Stick::new(
            apply_deadzone(right.x, dz.right_stick),
            apply_deadzone(right.y, dz.right_stick),
        ),
        left_trigger: apply_deadzone(lt, dz.triggers).max(0.0),
        right_trigger: apply_deadzone(rt, dz.triggers).max(0.0),
        buttons,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::frame::{KeyEvent, MouseState};

    fn pad(buttons: u32) -> RawInput {
        RawInput {
            gamepad: Some(RawGamepad {
                buttons,
                ..RawGamepad::default()
            }),
            ..RawInput::default()
        }
    }

    #[test]
    fn deadzone_band_and_edges() {
        assert_eq!(apply_deadzone(0.05, 0.1), 0.0);
        assert_eq!(apply_deadzone(-0.09, 0.1), 0.0);
        assert_eq!(apply_deadzone(1.0, 0.1), 1.0);
        assert_eq!(apply_deadzone(-1.0, 0.1), -1.0);
        assert!((apply_deadzone(0.55, 0.1) - 0.5).abs() < 1e-6);
        assert_eq!(apply_deadzone(0.3, 0.0), 0.3);
        // Out-of-range inputs and deadzones are clamped.
        assert_eq!(apply_deadzone(3.0, 0.1), 1.0);
        assert_eq!(apply_deadzone(0.5, -1.0), 0.5);
        assert_eq!(apply_deadzone(0.98, 5.0), 0.0);
        assert_eq!(apply_deadzone(1.0, 5.0), 1.0);
        assert_eq!(apply_deadzone(f32::NAN, 0.1), 0.0);
    }

    #[test]
    fn deadzone_output_bounded_and_monotonic() {
        for d in [0.0f32, 0.05, 0.1, 0.25, 0.5, 0.9, 0.99] {
            let mut prev = f32::NEG_INFINITY;
            for i in -220..=220 {
                let v = i as f32 / 200.0;
                let out = apply_deadzone(v, d);
                assert!((-1.0..=1.0).contains(&out), "d={d} v={v} out={out}");
                assert!(out >= prev - 1e-6, "not monotonic at d={d} v={v}");
                prev = out;
            }
        }
    }

    #[test]
    fn deadzone_is_continuous_at_threshold() {
        let d = 0.2;
        let just_inside = apply_deadzone(d - 1e-4, d);
        let just_outside = apply_deadzone(d + 1e-4, d);
        assert_eq!(just_inside, 0.0);
        assert!(just_outside < 1e-3);
    }

    #[test]
    fn screenshot_remap_versus_default() {
        let a = GamepadButtons::A.bits();
        let remapped = MappingProfile::identity("shots")
            .with_binding(
                GamepadButtons::A,
                ButtonAction::Special(SpecialAction::Screenshot),
            )
            .unwrap();

        let out = process_input(&pad(a), &remapped);
        assert_eq!(out.frame.gamepad.unwrap().buttons, GamepadButtons::empty());
        assert_eq!(out.special, vec![SpecialAction::Screenshot]);

        let out = process_input(&pad(a), &MappingProfile::default());
        assert_eq!(out.frame.gamepad.unwrap().buttons, GamepadButtons::A);
        assert!(out.special.is_empty());
    }

    #[test]
    fn unmapped_bits_drop_silently() {
        let out = process_input(&pad(1 << 31 | GamepadButtons::B.bits()), &MappingProfile::default());
        assert_eq!(out.frame.gamepad.unwrap().buttons, GamepadButtons::B);
        assert!(out.special.is_empty());
    }

    #[test]
    fn one_source_may_raise_several_actions_in_bit_order() {
        let profile = MappingProfile::identity("media")
            .with_binding(GamepadButtons::X, ButtonAction::Special(SpecialAction::VolumeUp))
            .unwrap()
            .with_binding(GamepadButtons::START, ButtonAction::Special(SpecialAction::Home))
            .unwrap();
        let bits = (GamepadButtons::X | GamepadButtons::START | GamepadButtons::A).bits();
        let out = process_input(&pad(bits), &profile);
        assert_eq!(out.special, vec![SpecialAction::Home, SpecialAction::VolumeUp]);
        assert_eq!(out.frame.gamepad.unwrap().buttons, GamepadButtons::A);
    }

    #[test]
    fn stick_and_trigger_swaps() {
        let mut profile = MappingProfile::default();
        profile.stick_swap = true;
        profile.trigger_swap = true;
        profile.deadzones.left_stick = 0.0;
        profile.deadzones.right_stick = 0.0;
        profile.deadzones.triggers = 0.0;

        let raw = RawInput {
            gamepad: Some(RawGamepad {
                buttons: 0,
                left_stick: Stick::new(0.5, -0.5),
                right_stick: Stick::new(-0.25, 0.75),
                left_trigger: 0.2,
                right_trigger: 0.9,
            }),
            ..RawInput::default()
        };
        let pad = process_input(&raw, &profile).frame.gamepad.unwrap();
        assert_eq!(pad.left_stick, Stick::new(-0.25, 0.75));
        assert_eq!(pad.right_stick, Stick::new(0.5, -0.5));
        assert_eq!(pad.left_trigger, 0.9);
        assert_eq!(pad.right_trigger, 0.2);
    }

    #[test]
    fn negative_trigger_reads_as_released() {
        let raw = RawInput {
            gamepad: Some(RawGamepad {
                left_trigger: -0.7,
                ..RawGamepad::default()
            }),
            ..RawInput::default()
        };
        let pad = process_input(&raw, &MappingProfile::default()).frame.gamepad.unwrap();
        assert_eq!(pad.left_trigger, 0.0);
    }

    #[test]
    fn mouse_and_keys_pass_through() {
        let raw = RawInput {
            gamepad: None,
            mouse: Some(MouseState {
                dx: 4,
                dy: -2,
                buttons: 1,
                wheel: 0,
            }),
            key_events: vec![KeyEvent { key: 65, down: true }],
        };
        let out = process_input(&raw, &MappingProfile::default());
        assert_eq!(out.frame.gamepad, None);
        assert_eq!(out.frame.mouse, raw.mouse);
        assert_eq!(out.frame.key_events, raw.key_events);
    }
}
