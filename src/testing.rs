//! Utilities for the test suite.

use std::sync::{Arc, Mutex};

use crate::listener::Listener;
use crate::stream::Stream;

/// Records every firing of a stream for later assertions.
pub struct Recorder<A> {
    values: Arc<Mutex<Vec<A>>>,
    listener: Listener,
}

impl<A: Clone + Send + Sync + 'static> Recorder<A> {
    /// Listen to `stream` and start recording.
    pub fn attach(stream: &Stream<A>) -> Recorder<A> {
        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = values.clone();
        let listener = stream.listen(move |a| sink.lock().unwrap().push(a));
        Recorder { values, listener }
    }

    /// Everything recorded so far, in delivery order.
    pub fn values(&self) -> Vec<A> {
        self.values.lock().unwrap().clone()
    }

    /// Stop recording.
    pub fn unlisten(&self) {
        self.listener.unlisten();
    }
}

mod test {
    use super::Recorder;
    use crate::StreamSink;

    #[test]
    fn recorder_observes_in_order() {
        let sink = StreamSink::new();
        let recorder = Recorder::attach(&sink.stream());
        sink.feed(0..3).unwrap();
        assert_eq!(recorder.values(), vec![0, 1, 2]);
    }
}
