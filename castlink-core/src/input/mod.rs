//! Client input: parse, normalize, inject.
//!
//! | Module       | Purpose                                               |
//! |--------------|-------------------------------------------------------|
//! | `wire`       | `Type`-tagged JSON messages from clients               |
//! | `frame`      | Raw and normalized frames, [`GamepadButtons`]          |
//! | `profile`    | [`MappingProfile`] and the swappable [`ProfileSlot`]    |
//! | `pipeline`   | [`process_input`] and [`apply_deadzone`]                |
//! | `dispatcher` | Bounded [`InputQueue`] and the [`InputDispatcher`] task |

pub mod dispatcher;
pub mod frame;
pub mod pipeline;
pub mod profile;
pub mod wire;

pub use dispatcher::{
    DEFAULT_INPUT_QUEUE, DispatchStats, InboundInput, InjectionSink, InputDispatcher, InputQueue,
};
pub use frame::{GamepadButtons, GamepadFrame, InputFrame, KeyEvent, MouseState, RawGamepad, RawInput, Stick};
pub use pipeline::{ProcessedInput, apply_deadzone, process_input};
pub use profile::{ButtonAction, ButtonBinding, Deadzones, MappingProfile, ProfileSlot, SpecialAction};
pub use wire::ClientMessage;
