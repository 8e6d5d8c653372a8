//! Parameter automation timeline: scheduled value changes against the
//! audio clock, evaluated the way WebAudio's `AudioParam` does.

use serde::{Deserialize, Serialize};

/// A scheduled change to a parameter. All times are in seconds on the
/// audio clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Automation {
    /// Hold `value` from `time` onward.
    SetValueAtTime { value: f64, time: f64 },
    /// Ramp linearly from the previous event to reach `value` at `time`.
    LinearRampToValueAtTime { value: f64, time: f64 },
    /// Approach `target` exponentially from `start`, with the given time constant.
    SetTargetAtTime { target: f64, start: f64, time_constant: f64 },
    /// Drop every event scheduled at or after `time`.
    CancelScheduledValues { time: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EventKind {
    Set(f64),
    Linear(f64),
    Target { target: f64, time_constant: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ParamEvent {
    time: f64,
    kind: EventKind,
}

/// The automation state of one parameter.
#[derive(Debug, Clone)]
pub struct ParamTimeline {
    initial: f64,
    events: Vec<ParamEvent>,
}

impl ParamTimeline {
    pub fn new(initial: f64) -> Self {
        ParamTimeline {
            initial,
            events: Vec::new(),
        }
    }

    /// Insert an automation event, keeping events ordered by time. Events at
    /// equal times keep insertion order.
    pub fn schedule(&mut self, automation: Automation) {
        let event = match automation {
            Automation::SetValueAtTime { value, time } => ParamEvent {
                time,
                kind: EventKind::Set(value),
            },
            Automation::LinearRampToValueAtTime { value, time } => ParamEvent {
                time,
                kind: EventKind::Linear(value),
            },
            Automation::SetTargetAtTime {
                target,
                start,
                time_constant,
            } => ParamEvent {
                time: start,
                kind: EventKind::Target {
                    target,
                    time_constant: time_constant.max(1e-6),
                },
            },
            Automation::CancelScheduledValues { time } => {
                self.events.retain(|e| e.time < time);
                return;
            }
        };
        let idx = self.events.partition_point(|e| e.time <= event.time);
        self.events.insert(idx, event);
    }

    /// Parameter value at time `t`.
    pub fn value_at(&self, t: f64) -> f64 {
        let mut value = self.initial;
        let mut anchor = f64::NEG_INFINITY;
        let mut active_target: Option<(f64, f64)> = None;

        for event in &self.events {
            if event.time > t {
                if let EventKind::Linear(end) = event.kind {
                    if anchor.is_finite() {
                        let frac = (t - anchor) / (event.time - anchor);
                        return value + (end - value) * frac;
                    }
                }
                break;
            }
            value = match active_target {
                Some((target, tc)) => approach(value, target, tc, event.time - anchor),
                None => value,
            };
            active_target = None;
            match event.kind {
                EventKind::Set(v) | EventKind::Linear(v) => value = v,
                EventKind::Target {
                    target,
                    time_constant,
                } => active_target = Some((target, time_constant)),
            }
            anchor = event.time;
        }

        match active_target {
            Some((target, tc)) => approach(value, target, tc, t - anchor),
            None => value,
        }
    }

    /// Drop events that can no longer influence values at or after `now`,
    /// folding them into the initial value.
    pub fn prune(&mut self, now: f64) {
        let settled = self
            .events
            .iter()
            .rposition(|e| e.time <= now && !matches!(e.kind, EventKind::Target { .. }));
        if let Some(idx) = settled {
            let still_ramping = matches!(
                self.events.get(idx + 1),
                Some(ParamEvent { kind: EventKind::Linear(_), .. })
            );
            if !still_ramping {
                self.initial = self.value_at(self.events[idx].time);
                self.events.drain(..=idx);
            }
        }
    }

    /// Whether any events remain scheduled.
    pub fn is_automated(&self) -> bool {
        !self.events.is_empty()
    }
}

fn approach(from: f64, target: f64, time_constant: f64, elapsed: f64) -> f64 {
    target + (from - target) * (-elapsed / time_constant).exp()
}
