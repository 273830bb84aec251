//! Polling engine: timers, pending requests, response correlation

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{PollingError, UpdateSink};
use crate::adapter::{CanFrame, CanId};
use crate::config::PollingConfig;
use crate::registry::{ParameterRegistry, ParameterSpec, Parser};
use crate::session::FrameSink;
use crate::uds::{self, CorrelationKey};

struct PendingRequest {
    parameter_id: String,
    parser: Parser,
}

#[derive(Default)]
struct PollState {
    /// Bumped on every stop; ticks from an older generation are void
    generation: u64,
    pending: HashMap<CorrelationKey, PendingRequest>,
    groups: Vec<String>,
    on_update: Option<Arc<dyn UpdateSink>>,
}

/// Schedules parameter requests and matches their responses
pub struct PollingEngine {
    sink: Arc<dyn FrameSink>,
    config: PollingConfig,
    state: Arc<Mutex<PollState>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingEngine {
    pub fn new(sink: Arc<dyn FrameSink>, config: PollingConfig) -> Self {
        Self {
            sink,
            config,
            state: Arc::new(Mutex::new(PollState::default())),
            timers: Mutex::new(Vec::new()),
            listener_handle: Mutex::new(None),
        }
    }

    /// Replace any running polling with the given parameters
    ///
    /// All ids are validated before anything is scheduled. Group `i` first
    /// fires after `i * stagger`, then at its own interval.
    pub fn start_polling<S: AsRef<str>>(
        &self,
        parameter_ids: &[S],
        registry: &ParameterRegistry,
        on_update: Arc<dyn UpdateSink>,
    ) -> Result<(), PollingError> {
        self.stop_all_polling();

        let mut specs = Vec::with_capacity(parameter_ids.len());
        for id in parameter_ids {
            let id = id.as_ref();
            let spec = registry
                .get(id)
                .ok_or_else(|| PollingError::UnknownParameter(id.to_string()))?;
            if spec.request.interval_ms == 0 {
                return Err(PollingError::InvalidInterval(id.to_string()));
            }
            specs.push(spec.clone());
        }

        let generation = {
            let mut state = self.state.lock();
            state.on_update = Some(on_update);
            state.groups = specs.iter().map(|spec| spec.id.clone()).collect();
            state.generation
        };

        let stagger = Duration::from_millis(self.config.stagger_ms);
        let mut timers = self.timers.lock();
        for (index, spec) in specs.into_iter().enumerate() {
            let sink = self.sink.clone();
            let state = self.state.clone();
            let first_delay = stagger * index as u32;

            debug!(
                parameter = %spec.id,
                interval_ms = spec.request.interval_ms,
                first_delay_ms = first_delay.as_millis() as u64,
                "Scheduling poll group"
            );

            timers.push(tokio::spawn(async move {
                tokio::time::sleep(first_delay).await;
                let mut ticker = tokio::time::interval(spec.request.interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    Self::tick(&*sink, &state, generation, &spec).await;
                }
            }));
        }

        info!(groups = timers.len(), "Polling started");
        Ok(())
    }

    async fn tick(
        sink: &dyn FrameSink,
        state: &Mutex<PollState>,
        generation: u64,
        spec: &ParameterSpec,
    ) {
        let key = spec.correlation_key();
        {
            let mut state = state.lock();
            if state.generation != generation {
                return;
            }
            let pending = PendingRequest {
                parameter_id: spec.id.clone(),
                parser: spec.parser.clone(),
            };
            if state.pending.insert(key.clone(), pending).is_some() {
                trace!(%key, "Previous request unanswered, overwriting");
            }
        }

        if let Err(e) = sink.send_request(&spec.request).await {
            warn!(parameter = %spec.id, error = %e, "Failed to send poll request");
            let mut state = state.lock();
            if state.generation == generation {
                state.pending.remove(&key);
            }
        }
    }

    /// Match a response frame against the pending requests
    ///
    /// Anything but a positive read-by-identifier response for a pending key
    /// is dropped. Parser errors and panics are logged and swallowed.
    pub fn handle_incoming_frame(&self, can_id: CanId, data_hex: &str) {
        Self::dispatch(&self.state, can_id, data_hex);
    }

    fn dispatch(state: &Mutex<PollState>, can_id: CanId, data_hex: &str) {
        let Some(pid) = uds::answered_read_pid(data_hex) else {
            if let Some((sid, nrc)) = uds::negative_response(data_hex) {
                debug!(%can_id, "Negative response to 0x{:02X}: NRC 0x{:02X}", sid, nrc);
            }
            return;
        };

        let key = CorrelationKey::new(can_id, pid);
        let (pending, on_update) = {
            let mut state = state.lock();
            match state.pending.remove(&key) {
                Some(pending) => (pending, state.on_update.clone()),
                None => {
                    trace!(%key, "No pending request for response");
                    return;
                }
            }
        };

        let parsed = panic::catch_unwind(AssertUnwindSafe(|| (pending.parser)(data_hex)));
        match parsed {
            Ok(Ok(Some(value))) => {
                if let Some(sink) = on_update {
                    sink.on_update(&pending.parameter_id, &value);
                }
            }
            Ok(Ok(None)) => {
                debug!(parameter = %pending.parameter_id, "Parser produced no value");
            }
            Ok(Err(e)) => {
                warn!(parameter = %pending.parameter_id, error = %e, "Parser failed");
            }
            Err(_) => {
                warn!(parameter = %pending.parameter_id, "Parser panicked");
            }
        }
    }

    /// Cancel every timer and forget every pending request
    pub fn stop_all_polling(&self) {
        {
            let mut state = self.state.lock();
            state.generation += 1;
            state.pending.clear();
            state.groups.clear();
            state.on_update = None;
        }

        let timers: Vec<_> = self.timers.lock().drain(..).collect();
        if !timers.is_empty() {
            for timer in &timers {
                timer.abort();
            }
            info!(groups = timers.len(), "Polling stopped");
        }
    }

    /// Consume decoded frames from the session reader
    pub fn start_listener(&self, mut frames: broadcast::Receiver<CanFrame>) {
        let state = self.state.clone();

        let handle = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        Self::dispatch(&state, frame.id, &frame.data_hex());
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Frame listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Frame channel closed");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.listener_handle.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_pending(&self, key: &CorrelationKey) -> bool {
        self.state.lock().pending.contains_key(key)
    }

    /// Parameter ids being polled, in group order
    pub fn active_groups(&self) -> Vec<String> {
        self.state.lock().groups.clone()
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterType;
    use crate::registry::{ParseError, RequestDescriptor};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{sleep, Instant};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(Instant, String)>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(_, p)| p.clone()).collect()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        fn adapter_type(&self) -> AdapterType {
            AdapterType::CommandStyle
        }

        async fn send_request(&self, request: &RequestDescriptor) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::SendFailed("test".into()));
            }
            self.sent.lock().push((Instant::now(), request.payload_hex()));
            Ok(())
        }

        async fn send_frame(&self, _frame: &CanFrame) -> Result<(), TransportError> {
            Ok(())
        }

        async fn prepare_raw_mode(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn restore_defaults(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Updates(Mutex<Vec<(String, Value)>>);

    impl UpdateSink for Updates {
        fn on_update(&self, parameter_id: &str, value: &Value) {
            self.0.lock().push((parameter_id.to_string(), value.clone()));
        }
    }

    fn id(s: &str) -> CanId {
        s.parse().unwrap()
    }

    fn voltage(data_hex: &str) -> Result<Option<Value>, ParseError> {
        let raw = u16::from_str_radix(&data_hex[10..14], 16)
            .map_err(|_| ParseError::InvalidData(data_hex.to_string()))?;
        Ok(Some(json!(raw)))
    }

    fn registry(interval_ms: u64) -> ParameterRegistry {
        let mut registry = ParameterRegistry::new();
        for (name, payload) in [("a", "220301"), ("b", "220302")] {
            let request = RequestDescriptor::new(id("79B"), payload, interval_ms).unwrap();
            registry.insert(ParameterSpec::new(name, request, id("7BB"), voltage));
        }
        let request = RequestDescriptor::new(id("79B"), "220303", interval_ms).unwrap();
        registry.insert(ParameterSpec::new("panics", request, id("7BB"), |_| {
            panic!("broken parser")
        }));
        registry
    }

    fn setup() -> (Arc<RecordingSink>, PollingEngine, Arc<Updates>) {
        let sink = Arc::new(RecordingSink::default());
        let engine = PollingEngine::new(sink.clone(), PollingConfig::default());
        (sink, engine, Arc::new(Updates::default()))
    }

    fn key(pid: &str) -> CorrelationKey {
        CorrelationKey::new(id("7BB"), pid)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_parameter_schedules_nothing() {
        let (sink, engine, updates) = setup();

        let err = engine
            .start_polling(&["a", "missing"], &registry(100), updates)
            .unwrap_err();

        assert_eq!(err, PollingError::UnknownParameter("missing".into()));
        sleep(Duration::from_millis(500)).await;
        assert!(sink.sent().is_empty());
        assert!(engine.active_groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_are_staggered_once() {
        let (sink, engine, updates) = setup();
        let started = Instant::now();

        engine
            .start_polling(&["a", "b"], &registry(1000), updates)
            .unwrap();
        sleep(Duration::from_millis(1100)).await;

        let sent = sink.sent.lock().clone();
        let offsets: Vec<(u64, String)> = sent
            .iter()
            .map(|(at, p)| ((*at - started).as_millis() as u64, p.clone()))
            .collect();
        assert_eq!(
            offsets,
            vec![
                (0, "220301".to_string()),
                (50, "220302".to_string()),
                (1000, "220301".to_string()),
                (1050, "220302".to_string()),
            ]
        );
        assert_eq!(engine.active_groups(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_ticks_keep_one_pending_entry() {
        let (sink, engine, updates) = setup();

        engine
            .start_polling(&["a", "b"], &registry(100), updates)
            .unwrap();
        sleep(Duration::from_millis(175)).await;

        let sent_a = sink.sent().iter().filter(|p| *p == "220301").count();
        assert_eq!(sent_a, 2);
        assert!(engine.is_pending(&key("220301")));
        assert_eq!(engine.pending_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_delivers_value_and_clears_pending() {
        let (_sink, engine, updates) = setup();

        engine
            .start_polling(&["a"], &registry(1000), updates.clone())
            .unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(engine.is_pending(&key("220301")));

        engine.handle_incoming_frame(id("7BB"), "0762030100000168");

        assert_eq!(updates.0.lock().clone(), vec![("a".to_string(), json!(1))]);
        assert_eq!(engine.pending_count(), 0);

        // A duplicate reply has nothing left to match
        engine.handle_incoming_frame(id("7BB"), "0762030100000168");
        assert_eq!(updates.0.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_responses_are_dropped() {
        let (_sink, engine, updates) = setup();

        engine
            .start_polling(&["a"], &registry(1000), updates.clone())
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        // Wrong id, unpolled identifier, negative response, too short
        engine.handle_incoming_frame(id("7BC"), "0762030100000168");
        engine.handle_incoming_frame(id("7BB"), "0762099900000168");
        engine.handle_incoming_frame(id("7BB"), "037F2231");
        engine.handle_incoming_frame(id("7BB"), "0362");

        assert!(updates.0.lock().is_empty());
        assert!(engine.is_pending(&key("220301")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timers() {
        let (sink, engine, updates) = setup();

        engine
            .start_polling(&["a"], &registry(100), updates.clone())
            .unwrap();
        sleep(Duration::from_millis(10)).await;
        engine.stop_all_polling();
        let sent_before = sink.sent().len();

        sleep(Duration::from_millis(1000)).await;
        engine.handle_incoming_frame(id("7BB"), "0762030100000168");

        assert_eq!(sink.sent().len(), sent_before);
        assert!(updates.0.lock().is_empty());
        assert_eq!(engine.pending_count(), 0);

        // Idempotent
        engine.stop_all_polling();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_removes_pending() {
        let (sink, engine, updates) = setup();
        sink.fail.store(true, Ordering::SeqCst);

        engine
            .start_polling(&["a"], &registry(100), updates)
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parser_panic_is_contained() {
        let (_sink, engine, updates) = setup();

        engine
            .start_polling(&["panics", "a"], &registry(1000), updates.clone())
            .unwrap();
        sleep(Duration::from_millis(60)).await;

        engine.handle_incoming_frame(id("7BB"), "0762030300000168");
        engine.handle_incoming_frame(id("7BB"), "0762030100000168");

        assert_eq!(updates.0.lock().clone(), vec![("a".to_string(), json!(1))]);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_feeds_correlator() {
        let (_sink, engine, updates) = setup();
        let (tx, rx) = broadcast::channel(16);
        engine.start_listener(rx);

        engine
            .start_polling(&["a"], &registry(1000), updates.clone())
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        tx.send(CanFrame::from_hex(id("7BB"), "0762030100000168").unwrap())
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(updates.0.lock().clone(), vec![("a".to_string(), json!(1))]);
    }
}
