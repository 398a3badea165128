use std::sync::{Arc, RwLock};

use crate::core::{Error, Measurement, Metadata, Ticks};

/// Receiver of subscriber lifecycle and data notifications.
///
/// Every method has a no-op default, so a listener implements only the
/// events it cares about. Callbacks run synchronously on the channel read
/// task that produced the event, in production order; listeners that need
/// to do real work should hand off to their own executor.
#[allow(unused_variables)]
pub trait SubscriberListener: Send + Sync {
    /// Informational status text from the session or the publisher
    fn on_status(&self, message: &str) {}

    /// A recoverable decode error or a fatal channel error
    fn on_error(&self, error: &Error) {}

    /// Timestamp of the first measurement of a new subscription
    fn on_data_start_time(&self, start_time: Ticks) {}

    /// Metadata document received from the publisher
    fn on_metadata(&self, metadata: &Metadata) {}

    /// A batch of newly decoded measurements
    fn on_measurements(&self, measurements: &[Measurement]) {}

    /// A temporal replay finished
    fn on_processing_complete(&self, message: &str) {}

    /// The connection closed for a reason other than a caller-initiated
    /// disconnect
    fn on_connection_terminated(&self, cause: Option<&Error>) {}
}

/// Registry fanning events out to every registered listener
#[derive(Default, Clone)]
pub struct EventDispatcher {
    listeners: Arc<RwLock<Vec<Arc<dyn SubscriberListener>>>>,
}

impl EventDispatcher {
    /// Creates an empty dispatcher
    pub fn new() -> Self {
        EventDispatcher::default()
    }

    /// Registers a listener for all event kinds
    pub fn register(&self, listener: Arc<dyn SubscriberListener>) {
        self.listeners
            .write()
            .expect("listener registry poisoned")
            .push(listener);
    }

    fn each(&self, mut f: impl FnMut(&dyn SubscriberListener)) {
        let listeners = self.listeners.read().expect("listener registry poisoned");

        for listener in listeners.iter() {
            f(listener.as_ref());
        }
    }

    pub(crate) fn status(&self, message: &str) {
        self.each(|l| l.on_status(message));
    }

    pub(crate) fn error(&self, error: &Error) {
        self.each(|l| l.on_error(error));
    }

    pub(crate) fn data_start_time(&self, start_time: Ticks) {
        self.each(|l| l.on_data_start_time(start_time));
    }

    pub(crate) fn metadata(&self, metadata: &Metadata) {
        self.each(|l| l.on_metadata(metadata));
    }

    pub(crate) fn measurements(&self, measurements: &[Measurement]) {
        self.each(|l| l.on_measurements(measurements));
    }

    pub(crate) fn processing_complete(&self, message: &str) {
        self.each(|l| l.on_processing_complete(message));
    }

    pub(crate) fn connection_terminated(&self, cause: Option<&Error>) {
        self.each(|l| l.on_connection_terminated(cause));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl SubscriberListener for Recorder {
        fn on_status(&self, message: &str) {
            self.log.lock().unwrap().push(format!("status:{}", message));
        }

        fn on_error(&self, error: &Error) {
            self.log.lock().unwrap().push(format!("error:{}", error));
        }

        fn on_connection_terminated(&self, cause: Option<&Error>) {
            self.log
                .lock()
                .unwrap()
                .push(format!("terminated:{}", cause.is_some()));
        }
    }

    struct Silent;
    impl SubscriberListener for Silent {}

    #[test]
    fn test_delivery_order_preserved() {
        let dispatcher = EventDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());

        dispatcher.status("connected");
        dispatcher.error(&Error::framing("bad frame"));
        dispatcher.connection_terminated(None);

        let log = recorder.log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            &[
                "status:connected".to_string(),
                "error:Framing error: bad frame".to_string(),
                "terminated:false".to_string(),
            ]
        );
    }

    #[test]
    fn test_defaults_are_no_ops() {
        let dispatcher = EventDispatcher::new();
        dispatcher.register(Arc::new(Silent));

        // Nothing to assert beyond not panicking
        dispatcher.status("connected");
        dispatcher.measurements(&[]);
        dispatcher.data_start_time(Ticks(0));
        dispatcher.processing_complete("done");
    }
}
