//! Physical-button gesture recognition.
pub(crate) mod event;
mod gate;
mod method;
mod pipeline;
mod recent;
mod recognizer;

pub use event::{parse_getevent_line, KeyAction, KeyInput};
pub use gate::TriggerGate;
pub use method::TriggerMethod;
pub use pipeline::{KeyCommand, KeyPipeline};
pub use recent::{RecentKeys, SharedRecentKeys, RECENT_KEYS_REPORTED};
pub use recognizer::{Recognizer, Timing};
