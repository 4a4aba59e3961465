use std::fmt;
use std::str::FromStr;

/// The physical-button gesture that fires the trigger.
///
/// Persisted as its string form in `config.toml` and passed by name over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMethod {
    None,
    #[default]
    VolDownDouble,
    VolUpDouble,
    VolDownLong,
    VolBoth,
    CameraLong,
    ShortcutKey,
}

impl TriggerMethod {
    pub const ALL: [TriggerMethod; 7] = [
        TriggerMethod::None,
        TriggerMethod::VolDownDouble,
        TriggerMethod::VolUpDouble,
        TriggerMethod::VolDownLong,
        TriggerMethod::VolBoth,
        TriggerMethod::CameraLong,
        TriggerMethod::ShortcutKey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerMethod::None => "none",
            TriggerMethod::VolDownDouble => "vol_down_double",
            TriggerMethod::VolUpDouble => "vol_up_double",
            TriggerMethod::VolDownLong => "vol_down_long",
            TriggerMethod::VolBoth => "vol_both",
            TriggerMethod::CameraLong => "camera_long",
            TriggerMethod::ShortcutKey => "shortcut_key",
        }
    }
}

impl fmt::Display for TriggerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown trigger method '{0}'")]
pub struct UnknownMethod(pub String);

impl FromStr for TriggerMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        TriggerMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for method in TriggerMethod::ALL {
            assert_eq!(method.as_str().parse::<TriggerMethod>().unwrap(), method);
        }
    }

    #[test]
    fn parse_trims_whitespace() {
        assert_eq!(" vol_both\n".parse::<TriggerMethod>().unwrap(), TriggerMethod::VolBoth);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = "triple_tap".parse::<TriggerMethod>().unwrap_err();
        assert_eq!(err.to_string(), "unknown trigger method 'triple_tap'");
    }

    #[test]
    fn default_is_volume_down_double_click() {
        assert_eq!(TriggerMethod::default(), TriggerMethod::VolDownDouble);
    }
}
