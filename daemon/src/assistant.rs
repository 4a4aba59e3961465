//! Default-assistant binding.
//!
//! OPPO CN builds ship Breeno as the assistant, which keeps the session call
//! from reaching Google. Switching needs all three secure settings.
use std::sync::Arc;
use std::time::Duration;

use crate::broker::CommandRunner;

pub const GSA_PACKAGE: &str = "com.google.android.googlequicksearchbox";
pub const GMS_PACKAGE: &str = "com.google.android.gms";
pub const GOOGLE_ASSISTANT_COMPONENT: &str =
    "com.google.android.googlequicksearchbox/com.google.android.voiceinteraction.GsaVoiceInteractionService";
pub const GOOGLE_RECOGNITION_COMPONENT: &str =
    "com.google.android.googlequicksearchbox/com.google.android.voicesearch.serviceapi.GoogleRecognitionService";

const VERIFY_DELAY: Duration = Duration::from_millis(500);

pub struct Assistant {
    runner: Arc<dyn CommandRunner>,
    verify_delay: Duration,
}

impl Assistant {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            verify_delay: VERIFY_DELAY,
        }
    }

    #[cfg(test)]
    fn without_delay(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            verify_delay: Duration::ZERO,
        }
    }

    /// Current `assistant` component, `None` if unset or unreadable.
    pub fn current(&self) -> Option<String> {
        self.runner
            .execute("settings get secure assistant")
            .filter(|s| !s.is_empty() && s != "null")
    }

    pub fn is_google(&self) -> bool {
        self.current().is_some_and(|c| c.contains(GSA_PACKAGE))
    }

    /// Points `assistant`, `voice_interaction_service` and
    /// `voice_recognition_service` at Google, then reads the binding back.
    pub fn set_google(&self) -> bool {
        let writes = [
            format!("settings put secure assistant {GOOGLE_ASSISTANT_COMPONENT}"),
            format!("settings put secure voice_interaction_service {GOOGLE_ASSISTANT_COMPONENT}"),
            format!("settings put secure voice_recognition_service {GOOGLE_RECOGNITION_COMPONENT}"),
        ];
        for command in &writes {
            self.runner.execute(command);
        }
        log::info!("Assistant settings applied");

        // Settings propagate asynchronously.
        std::thread::sleep(self.verify_delay);
        let current = self.current();
        let ok = current.as_deref().is_some_and(|c| c.contains(GSA_PACKAGE));
        log::info!("Assistant verification: {ok} (current={current:?})");
        ok
    }
}

/// Whether `package` is installed, via `pm path`.
pub fn is_package_installed(runner: &dyn CommandRunner, package: &str) -> bool {
    runner
        .execute(&format!("pm path {package}"))
        .is_some_and(|out| out.contains("package:"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::{stdout, RecordingRunner};
    use crate::error::TriggerError;
    use std::sync::Mutex;

    #[test]
    fn null_and_blank_are_not_an_assistant() {
        for value in ["null\n", "  ", ""] {
            let value = value.to_string();
            let assistant = Assistant::new(Arc::new(RecordingRunner::new(move |_| stdout(&value))));
            assert_eq!(assistant.current(), None);
            assert!(!assistant.is_google());
        }
    }

    #[test]
    fn breeno_is_not_google() {
        let runner = RecordingRunner::new(|_| stdout("com.heytap.speechassist/.VoiceInteractionService\n"));
        let assistant = Assistant::new(Arc::new(runner));
        assert!(!assistant.is_google());
    }

    #[test]
    fn unreachable_broker_is_not_google() {
        let runner = RecordingRunner::new(|_| Err(TriggerError::PermissionDenied));
        assert!(!Assistant::new(Arc::new(runner)).is_google());
    }

    #[test]
    fn set_google_writes_three_settings_then_verifies() {
        let stored = Arc::new(Mutex::new(String::from("null")));
        let state = stored.clone();
        let runner = Arc::new(RecordingRunner::new(move |cmd| {
            if let Some(value) = cmd.strip_prefix("settings put secure assistant ") {
                *state.lock().unwrap() = value.to_string();
            }
            if cmd == "settings get secure assistant" {
                return stdout(&state.lock().unwrap());
            }
            stdout("")
        }));
        let assistant = Assistant::without_delay(runner.clone());
        assert!(assistant.set_google());

        let ran = runner.ran();
        assert_eq!(ran.len(), 4);
        assert!(ran[1].starts_with("settings put secure voice_interaction_service "));
        assert!(ran[2].ends_with(GOOGLE_RECOGNITION_COMPONENT));
        assert_eq!(ran[3], "settings get secure assistant");
    }

    #[test]
    fn set_google_fails_when_setting_does_not_stick() {
        let runner = RecordingRunner::new(|cmd| {
            if cmd.starts_with("settings get") {
                stdout("com.heytap.speechassist/.VoiceInteractionService")
            } else {
                stdout("")
            }
        });
        assert!(!Assistant::without_delay(Arc::new(runner)).set_google());
    }

    #[test]
    fn package_presence_from_pm_path() {
        let runner = RecordingRunner::new(|cmd| {
            if cmd.ends_with(GSA_PACKAGE) {
                stdout("package:/product/priv-app/Velvet/Velvet.apk\n")
            } else {
                stdout("")
            }
        });
        assert!(is_package_installed(&runner, GSA_PACKAGE));
        assert!(!is_package_installed(&runner, GMS_PACKAGE));
    }
}
