//! Test-only observer that captures all events into a shared vector.

use std::sync::{Arc, Mutex};

use crate::observability::traits::{AnalysisEvent, AnalysisObserver};

/// Observer that records all events for test assertions.
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<AnalysisEvent>>>,
}

impl RecordingObserver {
    /// Create a new recording observer and return a handle to the captured events.
    pub fn new() -> (Self, Arc<Mutex<Vec<AnalysisEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: Arc::clone(&events),
            },
            events,
        )
    }
}

impl AnalysisObserver for RecordingObserver {
    fn record_event(&self, event: &AnalysisEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_events() {
        let (obs, events) = RecordingObserver::new();

        obs.record_event(&AnalysisEvent::BatchStarted { samples: 1 });
        obs.record_event(&AnalysisEvent::AnalysisTaskCrashed {
            message: "x".into(),
        });

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert!(matches!(captured[0], AnalysisEvent::BatchStarted { .. }));
        assert!(matches!(captured[1], AnalysisEvent::AnalysisTaskCrashed { .. }));
    }

    #[test]
    fn name_is_recording() {
        let (obs, _) = RecordingObserver::new();
        assert_eq!(obs.name(), "recording");
    }
}
