//! Debounced "target present" alerting.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::config::AlertSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Idle,
    Active,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertEvent {
    On,
    Off,
}

/// Silence required before switching on, and absence required before switching off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebounceWindows {
    pub activate_after: Duration,
    pub deactivate_after: Duration,
}

impl From<&AlertSettings> for DebounceWindows {
    fn from(settings: &AlertSettings) -> Self {
        Self {
            activate_after: settings.activate_after,
            deactivate_after: settings.deactivate_after,
        }
    }
}

impl Default for DebounceWindows {
    fn default() -> Self {
        DebounceWindows::from(&AlertSettings::default())
    }
}

/// Hysteresis over per-frame detections.
///
/// - `Idle -> Active` when the target is seen and the last miss is older than
///   `activate_after`.
/// - `Active -> Idle` when the target is missed and the last sighting is older
///   than `deactivate_after`.
///
/// A timestamp that was never set counts as infinitely old. Only transitions
/// produce events, so an event never repeats the previous one.
#[derive(Debug)]
pub struct AlertStateMachine {
    windows: DebounceWindows,
    state: AlertState,
    last_seen: Option<Instant>,
    last_missing: Option<Instant>,
}

impl AlertStateMachine {
    pub fn new(windows: DebounceWindows) -> Self {
        Self {
            windows,
            state: AlertState::Idle,
            last_seen: None,
            last_missing: None,
        }
    }

    pub fn state(&self) -> AlertState {
        self.state
    }

    /// Feed one frame's verdict observed at `now`.
    pub fn observe(&mut self, detected: bool, now: Instant) -> Option<AlertEvent> {
        if detected {
            self.last_seen = Some(now);
            if self.state == AlertState::Idle
                && older_than(self.last_missing, now, self.windows.activate_after)
            {
                self.state = AlertState::Active;
                return Some(AlertEvent::On);
            }
        } else {
            self.last_missing = Some(now);
            if self.state == AlertState::Active
                && older_than(self.last_seen, now, self.windows.deactivate_after)
            {
                self.state = AlertState::Idle;
                return Some(AlertEvent::Off);
            }
        }
        None
    }

    /// Back to `Idle` with no history. Returns `Off` if an alert was active.
    pub fn reset(&mut self) -> Option<AlertEvent> {
        let was_active = self.state == AlertState::Active;
        self.state = AlertState::Idle;
        self.last_seen = None;
        self.last_missing = None;
        was_active.then_some(AlertEvent::Off)
    }
}

fn older_than(at: Option<Instant>, now: Instant, window: Duration) -> bool {
    match at {
        None => true,
        Some(at) => now.saturating_duration_since(at) > window,
    }
}

/// Alert collaborator: renders on/off however it likes.
pub trait AlertSink: Send + Sync {
    fn on(&self);
    fn off(&self);

    fn dispatch(&self, event: AlertEvent) {
        match event {
            AlertEvent::On => self.on(),
            AlertEvent::Off => self.off(),
        }
    }
}

/// Default sink: log lines only.
pub struct LogAlertSink {
    target_class: String,
}

impl LogAlertSink {
    pub fn new(target_class: &str) -> Self {
        Self {
            target_class: target_class.to_string(),
        }
    }
}

impl AlertSink for LogAlertSink {
    fn on(&self) {
        log::warn!("ALERT: {} detected", self.target_class);
    }

    fn off(&self) {
        log::info!("alert cleared: no {} in view", self.target_class);
    }
}
