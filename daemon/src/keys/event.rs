//! Key identities and the two input formats they arrive in: Android keycodes
//! forwarded from the key callback, and `getevent -l` text lines.

/// `KEY_*` names treated as the vendor shortcut button in the raw event stream.
/// Custom buttons frequently show up as `KEY_UNKNOWN`.
pub const SHORTCUT_KEY_NAMES: [&str; 7] = [
    "KEY_ASSISTANT",
    "KEY_VOICECOMMAND",
    "KEY_NOTIFICATION",
    "KEY_MACRO",
    "KEY_KBD_LCD_MENU1",
    "KEY_FN",
    "KEY_UNKNOWN",
];

/// Android keycodes treated as the vendor shortcut button:
/// NOTIFICATION, ASSIST, VOICE_ASSIST and three OPPO custom codes.
pub const SHORTCUT_KEYCODES: [u32; 6] = [83, 219, 231, 286, 287, 288];

pub const KEYCODE_VOLUME_UP: u32 = 24;
pub const KEYCODE_VOLUME_DOWN: u32 = 25;
pub const KEYCODE_CAMERA: u32 = 27;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    VolumeDown,
    VolumeUp,
    Camera,
    Shortcut(String),
    Other(String),
}

impl Key {
    /// Classifies a `getevent -l` key name such as `KEY_VOLUMEDOWN`.
    pub fn from_label(label: &str) -> Key {
        match label {
            "KEY_VOLUMEDOWN" => Key::VolumeDown,
            "KEY_VOLUMEUP" => Key::VolumeUp,
            "KEY_CAMERA" => Key::Camera,
            s if SHORTCUT_KEY_NAMES.contains(&s) => Key::Shortcut(s.to_string()),
            s => Key::Other(s.to_string()),
        }
    }

    /// Classifies an Android `KeyEvent` keycode.
    pub fn from_keycode(code: u32) -> Key {
        match code {
            KEYCODE_VOLUME_DOWN => Key::VolumeDown,
            KEYCODE_VOLUME_UP => Key::VolumeUp,
            KEYCODE_CAMERA => Key::Camera,
            c if SHORTCUT_KEYCODES.contains(&c) => Key::Shortcut(format!("KEYCODE_{c}")),
            c => Key::Other(format!("KEYCODE_{c}")),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Key::VolumeDown => "KEY_VOLUMEDOWN",
            Key::VolumeUp => "KEY_VOLUMEUP",
            Key::Camera => "KEY_CAMERA",
            Key::Shortcut(s) | Key::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
}

impl KeyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyAction::Down => "DOWN",
            KeyAction::Up => "UP",
        }
    }
}

impl std::str::FromStr for KeyAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "down" => Ok(KeyAction::Down),
            "up" => Ok(KeyAction::Up),
            other => Err(format!("unknown key action '{other}'")),
        }
    }
}

/// One key transition fed to the recognizer, whatever its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInput {
    pub key: Key,
    pub action: KeyAction,
    /// Auto-repeat count while the key is held; 0 for the initial edge.
    pub repeat: u32,
}

impl KeyInput {
    pub fn new(key: Key, action: KeyAction, repeat: u32) -> Self {
        Self { key, action, repeat }
    }

    pub fn from_keycode(code: u32, action: KeyAction, repeat: u32) -> Self {
        Self::new(Key::from_keycode(code), action, repeat)
    }

    /// True only for the initial (non-repeat) press.
    pub fn is_down_edge(&self) -> bool {
        self.action == KeyAction::Down && self.repeat == 0
    }

    /// Diagnostic action name; held-key repeats show as `REPEAT`.
    pub fn action_label(&self) -> &'static str {
        match (self.action, self.repeat) {
            (KeyAction::Down, 0) => "DOWN",
            (KeyAction::Down, _) => "REPEAT",
            (KeyAction::Up, _) => "UP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawAction {
    Down,
    Up,
    Repeat,
}

impl RawAction {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "DOWN" | "00000001" | "0001" => Some(RawAction::Down),
            "UP" | "00000000" | "0000" => Some(RawAction::Up),
            "REPEAT" | "00000002" | "0002" => Some(RawAction::Repeat),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RawAction::Down => "DOWN",
            RawAction::Up => "UP",
            RawAction::Repeat => "REPEAT",
        }
    }
}

/// A key line from `getevent -l`, borrowed from the input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawKeyLine<'a> {
    pub device: &'a str,
    pub key: &'a str,
    pub action: RawAction,
}

impl RawKeyLine<'_> {
    pub fn to_input(&self) -> KeyInput {
        let (action, repeat) = match self.action {
            RawAction::Down => (KeyAction::Down, 0),
            RawAction::Repeat => (KeyAction::Down, 1),
            RawAction::Up => (KeyAction::Up, 0),
        };
        KeyInput::new(Key::from_label(self.key), action, repeat)
    }
}

/// Parses one `getevent -l` line:
///
/// ```text
/// /dev/input/event3: EV_KEY       KEY_VOLUMEDOWN       DOWN
/// [   4711.094211] /dev/input/event3: EV_KEY KEY_VOLUMEUP 00000000
/// ```
///
/// Returns `None` for non-key events and unrecognized action tokens.
pub fn parse_getevent_line(line: &str) -> Option<RawKeyLine<'_>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let ev = parts.iter().position(|p| *p == "EV_KEY")?;
    let key = *parts.get(ev + 1)?;
    let action = RawAction::parse(parts.get(ev + 2)?)?;
    let device = ev
        .checked_sub(1)
        .map(|i| parts[i].trim_end_matches(':'))
        .unwrap_or("");
    Some(RawKeyLine { device, key, action })
}
