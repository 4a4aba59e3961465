//! Gesture recognition state machine.
//!
//! The recognizer is clock-free: callers pass the current instant with every
//! input, and long presses are reported as "arm"/"cancel" decisions that the
//! caller turns into a timer. That keeps the same machine usable for the
//! forwarded key callback and the raw `getevent` stream.
use std::time::{Duration, Instant};

use super::event::{Key, KeyAction, KeyInput};
use super::method::TriggerMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Two down-edges closer than this are a double-click.
    pub double_click_window: Duration,
    /// Hold time before a long press fires.
    pub long_press: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Fire,
    /// Start (or restart) the long-press timer.
    ArmLongPress(Duration),
    /// Drop a pending long-press timer without firing.
    CancelLongPress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub action: Action,
    /// Whether the key callback should swallow this event.
    pub consumed: bool,
}

impl Outcome {
    const PASS: Outcome = Outcome { action: Action::None, consumed: false };

    fn fire() -> Self {
        Outcome { action: Action::Fire, consumed: true }
    }

    fn pass(action: Action) -> Self {
        Outcome { action, consumed: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Gesture {
    Disabled,
    DoubleClick(Key),
    LongPress(Key),
    Chord,
    Shortcut,
}

impl From<TriggerMethod> for Gesture {
    fn from(method: TriggerMethod) -> Self {
        match method {
            TriggerMethod::None => Gesture::Disabled,
            TriggerMethod::VolDownDouble => Gesture::DoubleClick(Key::VolumeDown),
            TriggerMethod::VolUpDouble => Gesture::DoubleClick(Key::VolumeUp),
            TriggerMethod::VolDownLong => Gesture::LongPress(Key::VolumeDown),
            TriggerMethod::VolBoth => Gesture::Chord,
            TriggerMethod::CameraLong => Gesture::LongPress(Key::Camera),
            TriggerMethod::ShortcutKey => Gesture::Shortcut,
        }
    }
}

pub struct Recognizer {
    method: TriggerMethod,
    gesture: Gesture,
    timing: Timing,
    /// First click of a potential double-click.
    last_down: Option<(Key, Instant)>,
    long_press_armed: bool,
    volume_down_held: bool,
    volume_up_held: bool,
}

impl Recognizer {
    pub fn new(method: TriggerMethod, timing: Timing) -> Self {
        Self {
            method,
            gesture: method.into(),
            timing,
            last_down: None,
            long_press_armed: false,
            volume_down_held: false,
            volume_up_held: false,
        }
    }

    pub fn method(&self) -> TriggerMethod {
        self.method
    }

    /// Switches gesture and forgets all partial state.
    pub fn set_method(&mut self, method: TriggerMethod) {
        self.method = method;
        self.gesture = method.into();
        self.reset();
    }

    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    pub fn reset(&mut self) {
        self.last_down = None;
        self.long_press_armed = false;
        self.volume_down_held = false;
        self.volume_up_held = false;
    }

    pub fn on_input(&mut self, input: &KeyInput, now: Instant) -> Outcome {
        match self.gesture.clone() {
            Gesture::Disabled => Outcome::PASS,
            Gesture::DoubleClick(target) => self.double_click(input, &target, now),
            Gesture::LongPress(target) => self.long_press(input, &target),
            Gesture::Chord => self.chord(input),
            Gesture::Shortcut => {
                if matches!(input.key, Key::Shortcut(_)) && input.is_down_edge() {
                    log::info!("Shortcut key detected: {}", input.key.label());
                    Outcome::fire()
                } else {
                    Outcome::PASS
                }
            }
        }
    }

    /// Called when the long-press timer expires. Returns true if the press
    /// was still armed, i.e. the trigger should fire.
    pub fn long_press_elapsed(&mut self) -> bool {
        std::mem::take(&mut self.long_press_armed)
    }

    fn double_click(&mut self, input: &KeyInput, target: &Key, now: Instant) -> Outcome {
        if input.key != *target || !input.is_down_edge() {
            return Outcome::PASS;
        }
        match self.last_down.take() {
            Some((key, at))
                if key == *target
                    && now.saturating_duration_since(at) < self.timing.double_click_window =>
            {
                log::info!("Double click detected: {}", target.label());
                Outcome::fire()
            }
            _ => {
                self.last_down = Some((target.clone(), now));
                Outcome::PASS
            }
        }
    }

    fn long_press(&mut self, input: &KeyInput, target: &Key) -> Outcome {
        if input.key != *target {
            if input.action == KeyAction::Down && self.long_press_armed {
                self.long_press_armed = false;
                return Outcome::pass(Action::CancelLongPress);
            }
            return Outcome::PASS;
        }
        match input.action {
            KeyAction::Down if input.repeat == 0 => {
                self.long_press_armed = true;
                Outcome::pass(Action::ArmLongPress(self.timing.long_press))
            }
            KeyAction::Down => Outcome::PASS,
            KeyAction::Up if self.long_press_armed => {
                self.long_press_armed = false;
                Outcome::pass(Action::CancelLongPress)
            }
            KeyAction::Up => Outcome::PASS,
        }
    }

    fn chord(&mut self, input: &KeyInput) -> Outcome {
        let slot = match input.key {
            Key::VolumeDown => &mut self.volume_down_held,
            Key::VolumeUp => &mut self.volume_up_held,
            _ => return Outcome::PASS,
        };
        // Auto-repeat only reports a key that is already held.
        match input.action {
            KeyAction::Down if input.repeat > 0 => return Outcome::PASS,
            KeyAction::Down => *slot = true,
            KeyAction::Up => *slot = false,
        }
        if self.volume_down_held && self.volume_up_held {
            log::info!("Both volume keys detected");
            self.volume_down_held = false;
            self.volume_up_held = false;
            return Outcome::fire();
        }
        Outcome::PASS
    }
}
