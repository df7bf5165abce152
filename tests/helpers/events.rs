use std::sync::{Arc, Mutex};

use perimeter::policy::{ServiceEvent, ServiceEventType};
use perimeter::storage::Store;

/// Collects every event dispatched by a store.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<ServiceEvent>>>,
}

impl EventRecorder {
    pub fn attach(store: &Store) -> Self {
        let recorder = Self::default();
        let sink = recorder.events.clone();
        store
            .events()
            .subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        recorder
    }

    /// Drain what has been recorded so far.
    pub fn take(&self) -> Vec<ServiceEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn take_types(&self) -> Vec<(ServiceEventType, String, String)> {
        self.take()
            .into_iter()
            .map(|e| (e.event_type, e.identity_id, e.service_id))
            .collect()
    }
}
