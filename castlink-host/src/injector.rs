//! Injection sink that records input instead of driving a virtual
//! device.
//!
//! Platform injection backends (virtual gamepad drivers, OS input APIs)
//! plug in behind the same [`InjectionSink`] trait.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use castlink_core::input::GamepadFrame;
use castlink_core::{InjectionSink, InputError, InputFrame, SpecialAction};

/// Counters kept by [`LoggingInjector`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectorCounts {
    pub gamepad: u64,
    pub mouse: u64,
    pub keys: u64,
    pub special: u64,
}

#[derive(Debug, Default)]
pub struct LoggingInjector {
    gamepad: AtomicU64,
    mouse: AtomicU64,
    keys: AtomicU64,
    special: AtomicU64,
}

impl LoggingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> InjectorCounts {
        InjectorCounts {
            gamepad: self.gamepad.load(Ordering::Relaxed),
            mouse: self.mouse.load(Ordering::Relaxed),
            keys: self.keys.load(Ordering::Relaxed),
            special: self.special.load(Ordering::Relaxed),
        }
    }
}

impl InjectionSink for LoggingInjector {
    fn inject(&self, frame: &InputFrame) -> Result<(), InputError> {
        if let Some(GamepadFrame {
            left_stick,
            right_stick,
            left_trigger,
            right_trigger,
            buttons,
        }) = frame.gamepad
        {
            self.gamepad.fetch_add(1, Ordering::Relaxed);
            debug!(
                ?buttons,
                lx = left_stick.x,
                ly = left_stick.y,
                rx = right_stick.x,
                ry = right_stick.y,
                lt = left_trigger,
                rt = right_trigger,
                "gamepad"
            );
        }
        if let Some(mouse) = frame.mouse {
            self.mouse.fetch_add(1, Ordering::Relaxed);
            debug!(dx = mouse.dx, dy = mouse.dy, buttons = mouse.buttons, wheel = mouse.wheel, "mouse");
        }
        for key in &frame.key_events {
            self.keys.fetch_add(1, Ordering::Relaxed);
            debug!(key = key.key, down = key.down, "key");
        }
        Ok(())
    }

    fn special(&self, action: SpecialAction) -> Result<(), InputError> {
        self.special.fetch_add(1, Ordering::Relaxed);
        info!(%action, "special action");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castlink_core::input::{KeyEvent, MouseState};

    #[test]
    fn counts_each_device() {
        let injector = LoggingInjector::new();
        let frame = InputFrame {
            gamepad: Some(GamepadFrame::default()),
            mouse: Some(MouseState {
                dx: 3,
                dy: -1,
                buttons: 1,
                wheel: 0,
            }),
            key_events: vec![
                KeyEvent { key: 32, down: true },
                KeyEvent { key: 32, down: false },
            ],
        };
        injector.inject(&frame).unwrap();
        injector.inject(&InputFrame::default()).unwrap();
        injector.special(SpecialAction::Screenshot).unwrap();

        assert_eq!(
            injector.counts(),
            InjectorCounts {
                gamepad: 1,
                mouse: 1,
                keys: 2,
                special: 1,
            }
        );
    }
}
