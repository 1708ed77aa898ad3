//! Button mapping profiles and the atomically swappable active slot.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::input::frame::GamepadButtons;

/// Number of source bits a profile can map.
pub const BUTTON_SLOTS: usize = 32;

// ── Actions ──────────────────────────────────────────────────────

/// Host-side actions that do not correspond to a gamepad output bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialAction {
    VolumeUp,
    VolumeDown,
    Mute,
    MediaPlayPause,
    MediaNext,
    MediaPrevious,
    Screenshot,
    GyroToggle,
    ShowKeyboard,
    Home,
}

impl fmt::Display for SpecialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What one source button does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
    /// Set these output gamepad bits.
    Gamepad(GamepadButtons),
    /// Raise a discrete action instead of a gamepad bit.
    Special(SpecialAction),
}

// ── Deadzones ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deadzones {
    pub left_stick: f32,
    pub right_stick: f32,
    pub triggers: f32,
}

impl Default for Deadzones {
    fn default() -> Self {
        Self {
            left_stick: 0.1,
            right_stick: 0.1,
            triggers: 0.05,
        }
    }
}

// ── MappingProfile ───────────────────────────────────────────────

/// Source-bit → action table plus per-profile transforms.
///
/// Stored as a fixed table indexed by source bit so lookups during
/// input processing never allocate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ProfileFile", into = "ProfileFile")]
pub struct MappingProfile {
    pub name: String,
    buttons: [Option<ButtonAction>; BUTTON_SLOTS],
    pub stick_swap: bool,
    pub trigger_swap: bool,
    pub deadzones: Deadzones,
}

impl MappingProfile {
    /// Every named button maps to itself; unnamed bits are dropped.
    pub fn identity(name: impl Into<String>) -> Self {
        let mut buttons = [None; BUTTON_SLOTS];
        for (_, flag) in GamepadButtons::all().iter_names() {
            if let Some(idx) = flag.single_bit_index() {
                buttons[idx as usize] = Some(ButtonAction::Gamepad(flag));
            }
        }
        Self {
            name: name.into(),
            buttons,
            stick_swap: false,
            trigger_swap: false,
            deadzones: Deadzones::default(),
        }
    }

    /// Map a single source button. `source` must have exactly one bit set.
    pub fn bind(&mut self, source: GamepadButtons, action: ButtonAction) -> Result<(), ConfigError> {
        let idx = source_index(source)?;
        self.buttons[idx] = Some(action);
        Ok(())
    }

    /// Make a source button do nothing.
    pub fn unbind(&mut self, source: GamepadButtons) -> Result<(), ConfigError> {
        let idx = source_index(source)?;
        self.buttons[idx] = None;
        Ok(())
    }

    pub fn with_binding(mut self, source: GamepadButtons, action: ButtonAction) -> Result<Self, ConfigError> {
        self.bind(source, action)?;
        Ok(self)
    }

    /// Action for source bit `bit` (0..32).
    pub fn action_for_bit(&self, bit: u32) -> Option<ButtonAction> {
        self.buttons.get(bit as usize).copied().flatten()
    }

    /// Load a profile from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("{}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| ConfigError::Invalid(format!("{}: {e}", path.display())))
    }
}

impl Default for MappingProfile {
    fn default() -> Self {
        Self::identity("default")
    }
}

fn source_index(source: GamepadButtons) -> Result<usize, ConfigError> {
    source
        .single_bit_index()
        .map(|i| i as usize)
        .ok_or_else(|| ConfigError::Invalid(format!("binding source {source:?} must be a single button")))
}

// ── Serialized form ──────────────────────────────────────────────

/// One entry of a profile file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonBinding {
    pub source: GamepadButtons,
    pub action: ButtonAction,
}

/// On-disk profile: differences from the identity mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileFile {
    pub name: String,
    pub stick_swap: bool,
    pub trigger_swap: bool,
    pub deadzones: Deadzones,
    pub bindings: Vec<ButtonBinding>,
    /// Sources that should be ignored entirely.
    pub unbound: Vec<GamepadButtons>,
}

impl Default for ProfileFile {
    fn default() -> Self {
        Self {
            name: "default".into(),
            stick_swap: false,
            trigger_swap: false,
            deadzones: Deadzones::default(),
            bindings: Vec::new(),
            unbound: Vec::new(),
        }
    }
}

impl TryFrom<ProfileFile> for MappingProfile {
    type Error = ConfigError;

    fn try_from(file: ProfileFile) -> Result<Self, Self::Error> {
        let mut profile = MappingProfile::identity(file.name);
        profile.stick_swap = file.stick_swap;
        profile.trigger_swap = file.trigger_swap;
        profile.deadzones = file.deadzones;
        for source in file.unbound {
            profile.unbind(source)?;
        }
        for b in file.bindings {
            profile.bind(b.source, b.action)?;
        }
        Ok(profile)
    }
}

impl From<MappingProfile> for ProfileFile {
    fn from(profile: MappingProfile) -> Self {
        let identity = MappingProfile::identity("");
        let mut bindings = Vec::new();
        let mut unbound = Vec::new();
        for bit in 0..BUTTON_SLOTS as u32 {
            let ours = profile.action_for_bit(bit);
            if ours == identity.action_for_bit(bit) {
                continue;
            }
            let source = GamepadButtons::from_bits_retain(1 << bit);
            match ours {
                Some(action) => bindings.push(ButtonBinding { source, action }),
                None => unbound.push(source),
            }
        }
        Self {
            name: profile.name,
            stick_swap: profile.stick_swap,
            trigger_swap: profile.trigger_swap,
            deadzones: profile.deadzones,
            bindings,
            unbound,
        }
    }
}

// ── ProfileSlot ──────────────────────────────────────────────────

/// Holder of the active profile.
///
/// Readers clone the `Arc` and work on an immutable snapshot; a swap
/// replaces the whole profile, so no reader ever sees a partly edited
/// table.
#[derive(Debug)]
pub struct ProfileSlot {
    active: RwLock<Arc<MappingProfile>>,
}

impl ProfileSlot {
    pub fn new(profile: MappingProfile) -> Self {
        Self {
            active: RwLock::new(Arc::new(profile)),
        }
    }

    pub fn current(&self) -> Arc<MappingProfile> {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install `profile`; returns the one it replaced.
    pub fn swap(&self, profile: MappingProfile) -> Arc<MappingProfile> {
        let next = Arc::new(profile);
        let mut guard = match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}

impl Default for ProfileSlot {
    fn default() -> Self {
        Self::new(MappingProfile::default())
    }
}
