//! Async driver around a [`Recognizer`]: feeds it key inputs, owns the
//! long-press timer, records diagnostics, and forwards fires to the daemon
//! event loop as [`DaemonEvent::TriggerRequested`].
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::event::KeyInput;
use super::method::TriggerMethod;
use super::recent::{KeyEventRecord, SharedRecentKeys};
use super::recognizer::{Action, Recognizer, Timing};
use crate::event::{DaemonEvent, TriggerSource};

pub enum KeyCommand {
    Input {
        input: KeyInput,
        /// Receives whether the event was consumed by a gesture.
        reply: Option<oneshot::Sender<bool>>,
    },
    SetMethod(TriggerMethod),
    SetTiming(Timing),
}

pub struct KeyPipeline {
    tx: mpsc::Sender<KeyCommand>,
    task: JoinHandle<()>,
}

impl KeyPipeline {
    pub fn spawn(
        recognizer: Recognizer,
        recent: SharedRecentKeys,
        fire_tx: mpsc::Sender<DaemonEvent>,
        source: TriggerSource,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(run(rx, recognizer, recent, fire_tx, source));
        Self { tx, task }
    }

    pub fn sender(&self) -> mpsc::Sender<KeyCommand> {
        self.tx.clone()
    }

    /// Stops the driver; a pending long press is dropped unfired.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run(
    mut rx: mpsc::Receiver<KeyCommand>,
    mut recognizer: Recognizer,
    recent: SharedRecentKeys,
    fire_tx: mpsc::Sender<DaemonEvent>,
    source: TriggerSource,
) {
    let mut long_press_at: Option<Instant> = None;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    KeyCommand::Input { input, reply } => {
                        log::debug!("Key event: {} {}", input.key.label(), input.action_label());
                        if let Ok(mut keys) = recent.lock() {
                            keys.push(KeyEventRecord::new(&input, chrono::Local::now()));
                        }

                        let outcome = recognizer.on_input(&input, Instant::now().into_std());
                        match outcome.action {
                            Action::Fire => request_trigger(&fire_tx, source),
                            Action::ArmLongPress(delay) => long_press_at = Some(Instant::now() + delay),
                            Action::CancelLongPress => long_press_at = None,
                            Action::None => {}
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(outcome.consumed);
                        }
                    }
                    KeyCommand::SetMethod(method) => {
                        log::info!("{source:?} recognizer method: {method}");
                        recognizer.set_method(method);
                        long_press_at = None;
                    }
                    KeyCommand::SetTiming(timing) => recognizer.set_timing(timing),
                }
            }
            () = sleep_until(long_press_at.unwrap_or_else(Instant::now)), if long_press_at.is_some() => {
                long_press_at = None;
                if recognizer.long_press_elapsed() {
                    log::info!("Long press detected ({})", recognizer.method());
                    request_trigger(&fire_tx, source);
                }
            }
        }
    }
}

fn request_trigger(fire_tx: &mpsc::Sender<DaemonEvent>, source: TriggerSource) {
    // A full channel drops this fire; the gate would reject it anyway.
    if fire_tx.try_send(DaemonEvent::TriggerRequested(source)).is_err() {
        log::warn!("Trigger request from {source:?} dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::event::{Key, KeyAction};
    use crate::keys::recent::RecentKeys;
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;

    fn timing() -> Timing {
        Timing {
            double_click_window: Duration::from_millis(400),
            long_press: Duration::from_millis(600),
        }
    }

    fn spawn(method: TriggerMethod) -> (KeyPipeline, mpsc::Receiver<DaemonEvent>, SharedRecentKeys) {
        let (fire_tx, fire_rx) = mpsc::channel(8);
        let recent = RecentKeys::shared();
        let pipeline = KeyPipeline::spawn(
            Recognizer::new(method, timing()),
            recent.clone(),
            fire_tx,
            TriggerSource::KeyStream,
        );
        (pipeline, fire_rx, recent)
    }

    async fn send(pipeline: &KeyPipeline, key: Key, action: KeyAction) -> bool {
        let (reply, rx) = oneshot::channel();
        pipeline
            .sender()
            .send(KeyCommand::Input { input: KeyInput::new(key, action, 0), reply: Some(reply) })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn long_press_fires_after_delay() {
        let (pipeline, mut fired, _) = spawn(TriggerMethod::VolDownLong);
        send(&pipeline, Key::VolumeDown, KeyAction::Down).await;

        tokio::time::sleep(Duration::from_millis(599)).await;
        assert!(matches!(fired.try_recv(), Err(TryRecvError::Empty)));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(matches!(
            fired.recv().await,
            Some(DaemonEvent::TriggerRequested(TriggerSource::KeyStream))
        ));
        pipeline.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn long_press_cancelled_by_early_release() {
        let (pipeline, mut fired, _) = spawn(TriggerMethod::CameraLong);
        send(&pipeline, Key::Camera, KeyAction::Down).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        send(&pipeline, Key::Camera, KeyAction::Up).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(fired.try_recv(), Err(TryRecvError::Empty)));
        pipeline.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn method_change_drops_pending_long_press() {
        let (pipeline, mut fired, _) = spawn(TriggerMethod::VolDownLong);
        send(&pipeline, Key::VolumeDown, KeyAction::Down).await;
        pipeline
            .sender()
            .send(KeyCommand::SetMethod(TriggerMethod::VolBoth))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(fired.try_recv(), Err(TryRecvError::Empty)));
        pipeline.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn double_click_consumes_second_press_and_records_keys() {
        let (pipeline, mut fired, recent) = spawn(TriggerMethod::VolDownDouble);
        assert!(!send(&pipeline, Key::VolumeDown, KeyAction::Down).await);
        send(&pipeline, Key::VolumeDown, KeyAction::Up).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(send(&pipeline, Key::VolumeDown, KeyAction::Down).await);

        assert!(matches!(fired.recv().await, Some(DaemonEvent::TriggerRequested(_))));
        assert_eq!(recent.lock().unwrap().render_tail(usize::MAX).lines().count(), 3);
        pipeline.stop().await;
    }
}
