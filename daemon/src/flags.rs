//! Feature-flag writes that unlock Circle to Search in the Google apps.
//!
//! Every write is independent: a failed one is logged and the batch goes on.
use std::sync::Arc;

use crate::assistant::{Assistant, GMS_PACKAGE, GSA_PACKAGE};
use crate::broker::CommandRunner;

pub const OMNIENT_PACKAGE: &str = "com.google.android.apps.search.omnient.device";

pub const NAMESPACES: [&str; 4] = ["android_gms", "search", "google", "omnient"];

pub const FLAG_KEYS: [&str; 7] = [
    "CircleToSearch__is_enabled",
    "CircleToSearch__is_available",
    "CircleToSearch__is_visual_entry_point_enabled",
    "Omnient__is_enabled",
    "is_lens_omni_enabled",
    "contextual_search_enabled",
    "is_omnisearch_enabled",
];

/// Phenotype flag ids forced to 1 for every package in [`OVERRIDE_PACKAGES`].
pub const PHENOTYPE_FLAG_IDS: [&str; 9] = [
    "45631784", // omnient
    "45434440", // lens
    "45353727", // contextual search
    "45657807", // visual entry point
    "45656205", // visual entry point v2
    "45657474", // omnient entry point
    "45350500", // overlay
    "45656105", // screen capture
    "45641470", // search entry point
];

pub const OVERRIDE_PACKAGES: [&str; 3] = [GSA_PACKAGE, OMNIENT_PACKAGE, GMS_PACKAGE];

/// Restarted after the writes so the new values are read.
pub const RESTART_PACKAGES: [&str; 3] = [GSA_PACKAGE, GMS_PACKAGE, OMNIENT_PACKAGE];

const READ_BACK: [(&str, &str); 4] = [
    ("android_gms", "CircleToSearch__is_enabled"),
    ("search", "CircleToSearch__is_enabled"),
    ("android_gms", "CircleToSearch__is_available"),
    ("android_gms", "Omnient__is_enabled"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagReport {
    pub attempted: usize,
    pub succeeded: usize,
}

impl FlagReport {
    pub fn success(&self) -> bool {
        self.succeeded > 0
    }
}

pub struct FlagMutator {
    runner: Arc<dyn CommandRunner>,
    assistant: Assistant,
}

impl FlagMutator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            assistant: Assistant::new(runner.clone()),
            runner,
        }
    }

    /// The full write batch, device_config puts first.
    pub fn write_commands() -> Vec<String> {
        let mut commands = Vec::with_capacity(NAMESPACES.len() * FLAG_KEYS.len() + 27);
        for namespace in NAMESPACES {
            for key in FLAG_KEYS {
                commands.push(format!("device_config put {namespace} {key} true"));
            }
        }
        for package in OVERRIDE_PACKAGES {
            for id in PHENOTYPE_FLAG_IDS {
                commands.push(format!(
                    "am broadcast -a com.google.android.gms.phenotype.FLAG_OVERRIDE \
                     --es packageName {package} --es user '' --es name {id} \
                     --es intVal 1 --es committed 1"
                ));
            }
        }
        commands
    }

    pub fn enable(&self) -> FlagReport {
        let mut report = FlagReport::default();
        for command in Self::write_commands() {
            report.attempted += 1;
            if self.runner.execute(&command).is_some() {
                report.succeeded += 1;
            }
        }
        for package in RESTART_PACKAGES {
            self.runner.execute(&format!("am force-stop {package}"));
        }

        if report.success() {
            log::info!("Flag writes applied: {}/{}", report.succeeded, report.attempted);
        } else {
            log::error!("No flag write succeeded ({} attempted)", report.attempted);
        }
        report
    }

    /// True if any main key reads back `true`, else whether Google is the
    /// default assistant (the session call works without the flags then).
    pub fn is_enabled(&self) -> bool {
        let flagged = READ_BACK.iter().any(|(namespace, key)| {
            self.runner
                .execute(&format!("device_config get {namespace} {key}"))
                .is_some_and(|v| v == "true")
        });
        flagged || self.assistant.is_google()
    }

    pub fn disable(&self) -> bool {
        self.runner
            .execute("device_config delete android_gms CircleToSearch__is_enabled");
        true
    }

    pub fn assistant(&self) -> &Assistant {
        &self.assistant
    }
}
