//! Hidden-API invoker: a fixed-priority chain of independent strategies that
//! each try to open the Circle to Search session.
//!
//! A strategy reports failure as a [`TriggerError`]; the chain logs it and
//! moves on. The first success ends the chain.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::CommandRunner;
use crate::config::ServiceConfig;
use crate::error::TriggerError;
use crate::ipc::ConnectionSlot;
use crate::parcel::{service_call, BundleValue, ParcelArg, ParcelReply};
use crate::sysprop::{self, SDK_UPSIDE_DOWN_CAKE};

pub const VOICE_INTERACTION_SERVICE: &str = "voiceinteraction";
pub const CONTEXTUAL_SEARCH_SERVICE: &str = "contextual_search";
/// `ContextualSearchManager.ENTRYPOINT_LONG_PRESS_HOME`.
const CONTEXTUAL_SEARCH_ENTRYPOINT: i32 = 1;
pub const SHOW_SESSION_COMMAND: &str = "cmd voiceinteraction show";

const GSA_PACKAGE: &str = "com.google.android.googlequicksearchbox";

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn attempt(&self) -> Result<(), TriggerError>;
}

/// Session arguments the Google app reads to open Circle to Search rather
/// than the assistant.
fn session_bundle(invoked_at_ms: i64) -> ParcelArg {
    ParcelArg::Bundle(vec![
        ("invocation_time_ms".into(), BundleValue::Long(invoked_at_ms)),
        ("omni.entry_point".into(), BundleValue::Int(1)),
        ("cts_trigger".into(), BundleValue::Bool(true)),
    ])
}

/// `showSessionFromSession` on the voice-interaction manager, once per
/// spoofed attribution tag, then with the older three-argument signature.
pub struct VoiceInteractionCall {
    runner: Arc<dyn CommandRunner>,
    code: u32,
    flags: i32,
    calling_packages: Vec<String>,
    clock: fn() -> i64,
}

impl VoiceInteractionCall {
    pub fn new(runner: Arc<dyn CommandRunner>, service: &ServiceConfig) -> Self {
        Self {
            runner,
            code: service.show_session_code,
            flags: service.session_flags,
            calling_packages: service.calling_packages.clone(),
            clock: sysprop::elapsed_realtime_ms,
        }
    }

    /// token, args bundle, flags, then the attribution tag if given.
    fn call(&self, calling_package: Option<&str>) -> Result<bool, TriggerError> {
        let mut args = vec![
            ParcelArg::Null,
            session_bundle((self.clock)()),
            ParcelArg::I32(self.flags),
        ];
        if let Some(package) = calling_package {
            args.push(ParcelArg::S16(package.to_string()));
        }
        let output = self
            .runner
            .run(&service_call(VOICE_INTERACTION_SERVICE, self.code, &args))?;
        ParcelReply::parse(&output.combined())?.bool_result()
    }
}

impl Strategy for VoiceInteractionCall {
    fn name(&self) -> &'static str {
        "voice interaction session"
    }

    fn attempt(&self) -> Result<(), TriggerError> {
        let mut last_err = None;

        for package in &self.calling_packages {
            match self.call(Some(package)) {
                Ok(true) => {
                    log::info!("showSessionFromSession accepted as {package}");
                    return Ok(());
                }
                Ok(false) => log::debug!("showSessionFromSession refused as {package}"),
                Err(e @ TriggerError::ServiceUnavailable(_)) => return Err(e),
                Err(e) => {
                    log::debug!("showSessionFromSession as {package} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        match self.call(None) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => last_err = Some(e),
        }

        Err(last_err.unwrap_or_else(|| {
            TriggerError::ReflectionFailure("showSessionFromSession returned false".into())
        }))
    }
}

/// `startContextualSearch` on Android 14+. Void method: no exception is success.
pub struct ContextualSearchCall {
    runner: Arc<dyn CommandRunner>,
    code: u32,
    sdk: Option<u32>,
}

impl ContextualSearchCall {
    pub fn new(runner: Arc<dyn CommandRunner>, service: &ServiceConfig, sdk: Option<u32>) -> Self {
        Self {
            runner,
            code: service.contextual_search_code,
            sdk,
        }
    }
}

impl Strategy for ContextualSearchCall {
    fn name(&self) -> &'static str {
        "contextual search"
    }

    fn attempt(&self) -> Result<(), TriggerError> {
        match self.sdk {
            Some(sdk) if sdk >= SDK_UPSIDE_DOWN_CAKE => {}
            sdk => {
                return Err(TriggerError::ServiceUnavailable(format!(
                    "{CONTEXTUAL_SEARCH_SERVICE} needs SDK {SDK_UPSIDE_DOWN_CAKE}, device reports {sdk:?}"
                )))
            }
        }
        let command = service_call(
            CONTEXTUAL_SEARCH_SERVICE,
            self.code,
            &[ParcelArg::I32(CONTEXTUAL_SEARCH_ENTRYPOINT)],
        );
        let output = self.runner.run(&command)?;
        ParcelReply::parse(&output.combined())?.check()
    }
}

/// `triggerNow` on the privileged daemon, binding the shared connection
/// first if needed.
pub struct RemoteServiceCall {
    slot: &'static ConnectionSlot,
    socket: PathBuf,
    bind_timeout: Duration,
}

impl RemoteServiceCall {
    pub fn new(slot: &'static ConnectionSlot, socket: PathBuf, bind_timeout: Duration) -> Self {
        Self {
            slot,
            socket,
            bind_timeout,
        }
    }
}

impl Strategy for RemoteServiceCall {
    fn name(&self) -> &'static str {
        "remote trigger service"
    }

    fn attempt(&self) -> Result<(), TriggerError> {
        if !self.slot.is_bound() && !self.slot.bind(&self.socket, self.bind_timeout) {
            return Err(TriggerError::ServiceUnavailable(format!(
                "no trigger service at {}",
                self.socket.display()
            )));
        }
        if self.slot.trigger_now()? {
            Ok(())
        } else {
            Err(TriggerError::ReflectionFailure("triggerNow returned false".into()))
        }
    }
}

/// A shell command through the privilege broker. Any output counts.
pub struct BrokerCommand {
    broker: Arc<dyn CommandRunner>,
    command: &'static str,
}

impl BrokerCommand {
    pub fn show_session(broker: Arc<dyn CommandRunner>) -> Self {
        Self {
            broker,
            command: SHOW_SESSION_COMMAND,
        }
    }
}

impl Strategy for BrokerCommand {
    fn name(&self) -> &'static str {
        "broker shell"
    }

    fn attempt(&self) -> Result<(), TriggerError> {
        let output = self.broker.run(self.command)?;
        log::debug!("{} -> {}", self.command, output.combined());
        Ok(())
    }
}

/// One `am start` intent extra.
#[derive(Debug, Clone, Copy)]
pub enum Extra {
    Bool(&'static str, bool),
    Int(&'static str, i32),
    Str(&'static str, &'static str),
}

/// Static description of an activity intent.
#[derive(Debug, Clone, Copy)]
pub struct IntentSpec {
    pub name: &'static str,
    pub action: Option<&'static str>,
    pub component: Option<&'static str>,
    pub package: Option<&'static str>,
    pub extras: &'static [Extra],
}

/// `FLAG_ACTIVITY_NEW_TASK`
const FLAG_NEW_TASK: &str = "0x10000000";

impl IntentSpec {
    pub fn command(&self) -> String {
        let mut cmd = String::from("am start");
        if let Some(action) = self.action {
            cmd.push_str(&format!(" -a {action}"));
        }
        if let Some(component) = self.component {
            cmd.push_str(&format!(" -n {component}"));
        }
        if let Some(package) = self.package {
            cmd.push_str(&format!(" -p {package}"));
        }
        cmd.push_str(&format!(" -f {FLAG_NEW_TASK}"));
        for extra in self.extras {
            match extra {
                Extra::Bool(key, v) => cmd.push_str(&format!(" --ez {key} {v}")),
                Extra::Int(key, v) => cmd.push_str(&format!(" --ei {key} {v}")),
                Extra::Str(key, v) => cmd.push_str(&format!(" --es {key} {v}")),
            }
        }
        cmd
    }
}

const CTS_ASSIST_EXTRAS: &[Extra] = &[
    Extra::Bool("ASSIST_CONTEXT_TYPE_CTS", true),
    Extra::Int("invocationType", 1),
    Extra::Bool("is_omnisearch", true),
];

pub const ASSIST_FALLBACK: IntentSpec = IntentSpec {
    name: "assist intent",
    action: Some("android.intent.action.ASSIST"),
    component: None,
    package: None,
    extras: CTS_ASSIST_EXTRAS,
};

pub const PROBE_INTENTS: [IntentSpec; 7] = [
    IntentSpec {
        name: "omnient activity",
        action: None,
        component: Some(
            "com.google.android.googlequicksearchbox/com.google.android.apps.search.omnient.device.OmnientActivity",
        ),
        package: None,
        extras: &[Extra::Str("source", "long_press_nav")],
    },
    IntentSpec {
        name: "omnient trigger action",
        action: Some("com.google.android.apps.search.omnient.TRIGGER"),
        component: None,
        package: Some(GSA_PACKAGE),
        extras: &[],
    },
    IntentSpec {
        name: "search long press",
        action: Some("android.intent.action.SEARCH_LONG_PRESS"),
        component: None,
        package: None,
        extras: &[],
    },
    IntentSpec {
        name: "lens activity",
        action: None,
        component: Some(
            "com.google.android.googlequicksearchbox/com.google.android.apps.search.lens.LensActivity",
        ),
        package: None,
        extras: &[Extra::Str("lens_entry_point", "cts")],
    },
    IntentSpec {
        name: "assist with omnisearch extras",
        action: Some("android.intent.action.ASSIST"),
        component: None,
        package: None,
        extras: &[
            Extra::Bool("is_omnisearch", true),
            Extra::Int("omni.entry_point", 1),
            Extra::Bool("cts_trigger", true),
        ],
    },
    IntentSpec {
        name: "voice assist",
        action: Some("android.intent.action.VOICE_ASSIST"),
        component: None,
        package: Some(GSA_PACKAGE),
        extras: &[],
    },
    IntentSpec {
        name: "gms circle to search activity",
        action: None,
        component: Some("com.google.android.gms/com.google.android.gms.search.cta.CircleToSearchActivity"),
        package: None,
        extras: &[],
    },
];

/// Launches an activity through `am start`. The activity manager prints
/// `Error:` lines instead of failing the process when it rejects an intent.
pub struct IntentLaunch {
    runner: Arc<dyn CommandRunner>,
    intent: IntentSpec,
}

impl IntentLaunch {
    pub fn new(runner: Arc<dyn CommandRunner>, intent: IntentSpec) -> Self {
        Self { runner, intent }
    }
}

impl Strategy for IntentLaunch {
    fn name(&self) -> &'static str {
        self.intent.name
    }

    fn attempt(&self) -> Result<(), TriggerError> {
        let output = self.runner.run(&self.intent.command())?;
        let text = output.combined();
        if !output.success || text.contains("Error") || text.contains("Exception") {
            let detail = text
                .lines()
                .find(|l| l.contains("Error") || l.contains("Exception"))
                .unwrap_or(&text)
                .trim()
                .to_string();
            return Err(TriggerError::ProcessFailure(detail));
        }
        Ok(())
    }
}

/// Per-attempt diagnostics from one run of the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeReport {
    pub lines: Vec<String>,
    pub succeeded: Option<&'static str>,
}

impl InvokeReport {
    pub fn success(&self) -> bool {
        self.succeeded.is_some()
    }
}

pub struct Invoker {
    strategies: Vec<Box<dyn Strategy>>,
}

impl Invoker {
    pub fn new(strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    /// Only the session call; used by the privileged daemon's `triggerNow`.
    pub fn session_only(local: Arc<dyn CommandRunner>, service: &ServiceConfig) -> Self {
        Self::new(vec![Box::new(VoiceInteractionCall::new(local, service))])
    }

    /// Chain used for key gestures recognized inside the daemon.
    pub fn for_daemon(
        local: Arc<dyn CommandRunner>,
        broker: Arc<dyn CommandRunner>,
        service: &ServiceConfig,
        sdk: Option<u32>,
    ) -> Self {
        Self::new(vec![
            Box::new(VoiceInteractionCall::new(local.clone(), service)),
            Box::new(ContextualSearchCall::new(local.clone(), service, sdk)),
            Box::new(BrokerCommand::show_session(broker)),
            Box::new(IntentLaunch::new(local, ASSIST_FALLBACK)),
        ])
    }

    /// Full chain for an unprivileged caller.
    pub fn for_client(
        local: Arc<dyn CommandRunner>,
        broker: Arc<dyn CommandRunner>,
        remote: RemoteServiceCall,
        service: &ServiceConfig,
        sdk: Option<u32>,
    ) -> Self {
        Self::new(vec![
            Box::new(VoiceInteractionCall::new(local.clone(), service)),
            Box::new(ContextualSearchCall::new(local.clone(), service, sdk)),
            Box::new(remote),
            Box::new(BrokerCommand::show_session(broker)),
            Box::new(IntentLaunch::new(local, ASSIST_FALLBACK)),
        ])
    }

    /// Every probe intent in order, stopping at the first one accepted.
    pub fn probe_intents(runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(
            PROBE_INTENTS
                .iter()
                .map(|intent| Box::new(IntentLaunch::new(runner.clone(), *intent)) as Box<dyn Strategy>)
                .collect(),
        )
    }

    pub fn invoke_with_log(&self) -> InvokeReport {
        let mut report = InvokeReport::default();

        for (index, strategy) in self.strategies.iter().enumerate() {
            let name = strategy.name();
            match strategy.attempt() {
                Ok(()) => {
                    log::info!("Triggered via {name}");
                    report.lines.push(format!("{}. {name}: ok", index + 1));
                    report.succeeded = Some(name);
                    return report;
                }
                Err(e) => {
                    log::warn!("{name} failed: {e}");
                    report.lines.push(format!("{}. {name}: {e}", index + 1));
                }
            }
        }

        log::error!("All {} trigger strategies failed", self.strategies.len());
        report
    }
}
