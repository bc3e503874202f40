// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Plugin base and chain. Every plugin runs behind a bounded work queue
//! serviced by a dedicated worker thread. Downstream registrations come in
//! two kinds: blocking callbacks invoked inline on the caller's worker (the
//! persistence tail, so backpressure propagates) and non-blocking callbacks
//! that enqueue on the target's queue.

use crate::frame::Frame;
use crate::meta::{MetaPublisher, MetaValue};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use framepipe_common::error::ConfigError;
use framepipe_ipc::IpcMessage;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid frame pushed onto plugin chain")]
    InvalidFrame,
}

/// last/max/mean aggregate of call durations in microseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallDuration {
    pub last_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
    count: u64,
}

impl CallDuration {
    pub fn update(&mut self, duration_us: u64) {
        self.last_us = duration_us;
        self.max_us = self.max_us.max(duration_us);
        self.count += 1;
        // Running mean without storing the series
        self.mean_us = ((self.mean_us * (self.count - 1)) + duration_us) / self.count;
    }

    pub fn reset(&mut self) {
        *self = CallDuration::default();
    }
}

/// Value constraints advertised in configuration metadata. Only integer
/// and string alternatives are representable in the serialized form; an
/// unset list is omitted entirely.
#[derive(Debug, Clone)]
pub enum AllowedValue {
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, Default)]
pub struct ParamMetadata {
    pub type_name: String,
    pub access_mode: String,
    pub allowed_values: Option<Vec<AllowedValue>>,
    pub min: Option<i32>,
    pub max: Option<i32>,
}

impl ParamMetadata {
    pub fn write_to(&self, reply: &mut IpcMessage, plugin_name: &str, param_name: &str) {
        let prefix = format!("metadata/{plugin_name}/{param_name}");
        reply.set_param(&format!("{prefix}/type"), json!(self.type_name));
        reply.set_param(&format!("{prefix}/access_mode"), json!(self.access_mode));
        if let Some(min) = self.min {
            reply.set_param(&format!("{prefix}/min"), json!(min));
        }
        if let Some(max) = self.max {
            reply.set_param(&format!("{prefix}/max"), json!(max));
        }
        if let Some(allowed) = &self.allowed_values {
            for value in allowed {
                match value {
                    AllowedValue::Int(v) => {
                        reply.set_param(&format!("{prefix}/allowed_values[]"), json!(v))
                    }
                    AllowedValue::Str(v) => {
                        reply.set_param(&format!("{prefix}/allowed_values[]"), json!(v))
                    }
                }
            }
        }
    }
}

/// The behavior a concrete plugin implements. The surrounding
/// [`PluginHandle`] supplies the queue, worker thread, callback wiring,
/// error bookkeeping and timing.
pub trait FrameProcessorPlugin: Send {
    fn process_frame(&mut self, frame: Arc<Frame>, ctx: &PluginContext<'_>);

    /// End-of-acquisition hook; the sentinel is always forwarded by the
    /// base after this returns.
    fn process_end_of_acquisition(&mut self, _ctx: &PluginContext<'_>) {}

    fn configure(
        &mut self,
        _config: &IpcMessage,
        _reply: &mut IpcMessage,
        _ctx: &PluginContext<'_>,
    ) -> Result<(), ConfigError> {
        Ok(())
    }

    fn request_configuration(&self, _reply: &mut IpcMessage) {}

    fn execute(&mut self, command: &str, _reply: &mut IpcMessage) -> Result<(), ConfigError> {
        Err(ConfigError::new(format!(
            "submitted command not supported: {command}"
        )))
    }

    fn commands(&self) -> Vec<String> {
        Vec::new()
    }

    fn status(&self, _status: &mut IpcMessage) {}

    fn reset_statistics(&mut self) -> bool {
        true
    }
}

enum QueueItem {
    Frame(Arc<Frame>),
    Stop,
}

/// Bounded FIFO of frame references with a head-drop overflow policy: when
/// the queue is full the oldest queued frame is discarded and counted.
pub struct WorkQueue {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
    dropped: AtomicU64,
}

impl WorkQueue {
    fn new(capacity: usize) -> WorkQueue {
        let (tx, rx) = bounded(capacity);
        WorkQueue {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn add(&self, frame: Arc<Frame>) {
        let mut item = QueueItem::Frame(frame);
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    match self.rx.try_recv() {
                        Ok(QueueItem::Frame(_)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(QueueItem::Stop) => {
                            // Never displace the stop sentinel; drop the new
                            // frame instead.
                            let _ = self.tx.try_send(QueueItem::Stop);
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                        Err(_) => {}
                    }
                    item = returned;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send_stop(&self) {
        let _ = self.tx.send(QueueItem::Stop);
    }
}

type FrameListener = Arc<dyn Fn(Arc<Frame>) + Send + Sync>;

/// One loaded plugin: its state, queue, worker and downstream wiring.
pub struct PluginHandle {
    name: String,
    inner: Mutex<Box<dyn FrameProcessorPlugin>>,
    queue: WorkQueue,
    callbacks: Mutex<Vec<(String, Arc<PluginHandle>)>>,
    blocking_callbacks: Mutex<Vec<(String, Arc<PluginHandle>)>>,
    listeners: Mutex<Vec<(String, FrameListener)>>,
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    process_duration: Mutex<CallDuration>,
    meta: MetaPublisher,
    worker: Mutex<Option<JoinHandle<()>>>,
    processing: AtomicBool,
}

/// Capabilities handed to a plugin while it runs: pushing downstream,
/// recording errors and warnings, publishing meta data.
pub struct PluginContext<'a> {
    handle: &'a PluginHandle,
}

impl PluginContext<'_> {
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn push(&self, frame: Arc<Frame>) -> Result<(), ChainError> {
        self.handle.push(frame)
    }

    pub fn push_to(&self, plugin_name: &str, frame: Arc<Frame>) -> Result<(), ChainError> {
        self.handle.push_to(plugin_name, frame)
    }

    pub fn set_error(&self, msg: impl Into<String>) {
        self.handle.set_error(msg);
    }

    pub fn set_warning(&self, msg: impl Into<String>) {
        self.handle.set_warning(msg);
    }

    pub fn publish_meta(&self, parameter: &str, value: MetaValue, header: &str) {
        self.handle
            .meta
            .publish(self.handle.name(), parameter, value, header);
    }

    pub fn meta_publisher(&self) -> &MetaPublisher {
        &self.handle.meta
    }
}

impl PluginHandle {
    pub fn new(
        name: impl Into<String>,
        plugin: Box<dyn FrameProcessorPlugin>,
        meta: MetaPublisher,
    ) -> Arc<PluginHandle> {
        Arc::new(PluginHandle {
            name: name.into(),
            inner: Mutex::new(plugin),
            queue: WorkQueue::new(DEFAULT_QUEUE_CAPACITY),
            callbacks: Mutex::new(Vec::new()),
            blocking_callbacks: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
            process_duration: Mutex::new(CallDuration::default()),
            meta,
            worker: Mutex::new(None),
            processing: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Start the worker thread servicing this plugin's queue.
    pub fn start(self: &Arc<Self>) {
        let handle = self.clone();
        let worker = std::thread::Builder::new()
            .name(format!("plugin-{}", self.name))
            .spawn(move || loop {
                match handle.queue.rx.recv() {
                    Ok(QueueItem::Frame(frame)) => {
                        handle.processing.store(true, Ordering::Release);
                        handle.dispatch(frame);
                        handle.processing.store(false, Ordering::Release);
                    }
                    Ok(QueueItem::Stop) | Err(_) => break,
                }
            })
            .expect("failed to spawn plugin worker thread");
        *self.worker.lock().expect("worker slot poisoned") = Some(worker);
    }

    /// Stop the worker after the queued frames drain.
    pub fn stop(&self) {
        self.queue.send_stop();
        let worker = self.worker.lock().expect("worker slot poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    /// True while a frame is being processed or frames are queued; polled
    /// by the controller during shutdown.
    pub fn is_working(&self) -> bool {
        self.processing.load(Ordering::Acquire) || !self.queue.is_empty()
    }

    /// Entry point for frames: enqueue from non-blocking edges, called
    /// directly from blocking edges.
    pub fn callback(&self, frame: Arc<Frame>) {
        self.dispatch(frame);
    }

    fn dispatch(&self, frame: Arc<Frame>) {
        let ctx = PluginContext { handle: self };
        if frame.end_of_acquisition_flag() {
            {
                let mut plugin = self.inner.lock().expect("plugin state poisoned");
                plugin.process_end_of_acquisition(&ctx);
            }
            // The sentinel is always forwarded
            if let Err(e) = self.push(frame) {
                self.set_error(e.to_string());
            }
        } else {
            let start = Instant::now();
            {
                let mut plugin = self.inner.lock().expect("plugin state poisoned");
                plugin.process_frame(frame, &ctx);
            }
            let elapsed_us = start.elapsed().as_micros() as u64;
            self.process_duration
                .lock()
                .expect("duration stats poisoned")
                .update(elapsed_us);
        }
    }

    /// Push a frame to every registered downstream: blocking callbacks
    /// inline in registration order, then listeners, then the non-blocking
    /// queues.
    pub fn push(&self, frame: Arc<Frame>) -> Result<(), ChainError> {
        if !frame.end_of_acquisition_flag() && !frame.is_valid() {
            return Err(ChainError::InvalidFrame);
        }
        let blocking: Vec<Arc<PluginHandle>> = {
            let callbacks = self.blocking_callbacks.lock().expect("callbacks poisoned");
            callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in blocking {
            cb.callback(frame.clone());
        }
        let listeners: Vec<FrameListener> = {
            let listeners = self.listeners.lock().expect("listeners poisoned");
            listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(frame.clone());
        }
        let callbacks: Vec<Arc<PluginHandle>> = {
            let callbacks = self.callbacks.lock().expect("callbacks poisoned");
            callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb.queue.add(frame.clone());
        }
        Ok(())
    }

    /// Push a frame to one named downstream only.
    pub fn push_to(&self, plugin_name: &str, frame: Arc<Frame>) -> Result<(), ChainError> {
        if !frame.end_of_acquisition_flag() && !frame.is_valid() {
            return Err(ChainError::InvalidFrame);
        }
        let blocking = {
            let callbacks = self.blocking_callbacks.lock().expect("callbacks poisoned");
            callbacks
                .iter()
                .find(|(name, _)| name == plugin_name)
                .map(|(_, cb)| cb.clone())
        };
        if let Some(cb) = blocking {
            cb.callback(frame.clone());
        }
        let non_blocking = {
            let callbacks = self.callbacks.lock().expect("callbacks poisoned");
            callbacks
                .iter()
                .find(|(name, _)| name == plugin_name)
                .map(|(_, cb)| cb.clone())
        };
        if let Some(cb) = non_blocking {
            cb.queue.add(frame);
        }
        Ok(())
    }

    /// Register a downstream plugin. A name may appear in only one of the
    /// blocking and non-blocking sets.
    pub fn register_callback(&self, name: &str, cb: Arc<PluginHandle>, blocking: bool) {
        let mut callbacks = self.callbacks.lock().expect("callbacks poisoned");
        let mut blocking_callbacks = self.blocking_callbacks.lock().expect("callbacks poisoned");
        if blocking {
            if callbacks.iter().any(|(n, _)| n == name) {
                warn!(
                    "non-blocking callback {name} already registered with {}. \
                     Must be removed before adding blocking callback",
                    self.name
                );
            } else if !blocking_callbacks.iter().any(|(n, _)| n == name) {
                debug!("registering blocking callback {name} with {}", self.name);
                blocking_callbacks.push((name.to_string(), cb));
            }
        } else if blocking_callbacks.iter().any(|(n, _)| n == name) {
            warn!(
                "blocking callback {name} already registered with {}. \
                 Must be removed before adding non-blocking callback",
                self.name
            );
        } else if !callbacks.iter().any(|(n, _)| n == name) {
            debug!("registering non-blocking callback {name} with {}", self.name);
            callbacks.push((name.to_string(), cb));
        }
    }

    /// Register a bare listener invoked inline on pushes, used for the
    /// controller's frame-counting tail.
    pub fn register_listener(&self, name: &str, listener: FrameListener) {
        let mut listeners = self.listeners.lock().expect("listeners poisoned");
        if !listeners.iter().any(|(n, _)| n == name) {
            listeners.push((name.to_string(), listener));
        }
    }

    pub fn remove_callback(&self, name: &str) {
        self.callbacks
            .lock()
            .expect("callbacks poisoned")
            .retain(|(n, _)| n != name);
        self.blocking_callbacks
            .lock()
            .expect("callbacks poisoned")
            .retain(|(n, _)| n != name);
        self.listeners
            .lock()
            .expect("listeners poisoned")
            .retain(|(n, _)| n != name);
    }

    pub fn remove_all_callbacks(&self) {
        self.callbacks.lock().expect("callbacks poisoned").clear();
        self.blocking_callbacks
            .lock()
            .expect("callbacks poisoned")
            .clear();
        self.listeners.lock().expect("listeners poisoned").clear();
    }

    /// Record an error, deduplicated by exact string.
    pub fn set_error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        let mut errors = self.errors.lock().expect("errors poisoned");
        if !errors.contains(&msg) {
            error!("{}: {msg}", self.name);
            errors.push(msg);
        }
    }

    /// Record a warning, deduplicated by exact string.
    pub fn set_warning(&self, msg: impl Into<String>) {
        let msg = msg.into();
        let mut warnings = self.warnings.lock().expect("warnings poisoned");
        if !warnings.contains(&msg) {
            warn!("{}: {msg}", self.name);
            warnings.push(msg);
        }
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("errors poisoned").clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().expect("warnings poisoned").clone()
    }

    pub fn clear_errors(&self) {
        self.errors.lock().expect("errors poisoned").clear();
        self.warnings.lock().expect("warnings poisoned").clear();
    }

    pub fn configure(&self, config: &IpcMessage, reply: &mut IpcMessage) -> Result<(), ConfigError> {
        let ctx = PluginContext { handle: self };
        let mut plugin = self.inner.lock().expect("plugin state poisoned");
        plugin.configure(config, reply, &ctx)
    }

    pub fn request_configuration(&self, reply: &mut IpcMessage) {
        let plugin = self.inner.lock().expect("plugin state poisoned");
        plugin.request_configuration(reply);
    }

    pub fn execute(&self, command: &str, reply: &mut IpcMessage) -> Result<(), ConfigError> {
        let mut plugin = self.inner.lock().expect("plugin state poisoned");
        plugin.execute(command, reply)
    }

    pub fn commands(&self) -> Vec<String> {
        let plugin = self.inner.lock().expect("plugin state poisoned");
        plugin.commands()
    }

    pub fn status(&self, status: &mut IpcMessage) {
        let plugin = self.inner.lock().expect("plugin state poisoned");
        plugin.status(status);
    }

    pub fn reset_statistics(&self) -> bool {
        self.process_duration
            .lock()
            .expect("duration stats poisoned")
            .reset();
        let mut plugin = self.inner.lock().expect("plugin state poisoned");
        plugin.reset_statistics()
    }

    pub fn add_performance_stats(&self, status: &mut IpcMessage) {
        let duration = *self.process_duration.lock().expect("duration stats poisoned");
        status.set_param(
            &format!("{}/timing/last_process", self.name),
            json!(duration.last_us),
        );
        status.set_param(
            &format!("{}/timing/max_process", self.name),
            json!(duration.max_us),
        );
        status.set_param(
            &format!("{}/timing/mean_process", self.name),
            json!(duration.mean_us),
        );
        status.set_param(
            &format!("{}/queue/dropped", self.name),
            json!(self.queue.dropped()),
        );
    }

    /// Create an end-of-acquisition sentinel and push it through this
    /// plugin's downstream edges.
    pub fn notify_end_of_acquisition(&self) {
        let _ = self.push(Arc::new(Frame::end_of_acquisition()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FrameMetaData;
    use crate::pool::DataBlockPools;
    use framepipe_common::{CompressionType, DataType};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingPlugin {
        processed: Arc<AtomicUsize>,
        eoa: Arc<AtomicUsize>,
        forward: bool,
    }

    impl FrameProcessorPlugin for CountingPlugin {
        fn process_frame(&mut self, frame: Arc<Frame>, ctx: &PluginContext<'_>) {
            self.processed.fetch_add(1, Ordering::SeqCst);
            if self.forward {
                let _ = ctx.push(frame);
            }
        }

        fn process_end_of_acquisition(&mut self, _ctx: &PluginContext<'_>) {
            self.eoa.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn data_frame(pools: &DataBlockPools, frame_number: u64) -> Arc<Frame> {
        let meta = FrameMetaData::new(
            "data",
            DataType::U16,
            "acq",
            vec![2, 2],
            CompressionType::None,
        );
        Arc::new(Frame::from_data_block(
            frame_number,
            meta,
            pools.take(8),
            &[0; 8],
        ))
    }

    fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn end_of_acquisition_drains_two_stage_chain() {
        let pools = DataBlockPools::default();
        let (meta, _meta_rx) = MetaPublisher::new();
        let a_processed = Arc::new(AtomicUsize::new(0));
        let a_eoa = Arc::new(AtomicUsize::new(0));
        let b_processed = Arc::new(AtomicUsize::new(0));
        let b_eoa = Arc::new(AtomicUsize::new(0));
        let forwarded_sentinels = Arc::new(AtomicUsize::new(0));

        let stage_a = PluginHandle::new(
            "stage_a",
            Box::new(CountingPlugin {
                processed: a_processed.clone(),
                eoa: a_eoa.clone(),
                forward: true,
            }),
            meta.clone(),
        );
        let stage_b = PluginHandle::new(
            "stage_b",
            Box::new(CountingPlugin {
                processed: b_processed.clone(),
                eoa: b_eoa.clone(),
                forward: true,
            }),
            meta,
        );
        stage_a.register_callback("stage_b", stage_b.clone(), false);
        let sentinel_count = forwarded_sentinels.clone();
        stage_b.register_listener(
            "tail",
            Arc::new(move |frame| {
                if frame.end_of_acquisition_flag() {
                    sentinel_count.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        stage_a.start();
        stage_b.start();

        const N: usize = 10;
        for i in 0..N {
            stage_a.queue().add(data_frame(&pools, i as u64));
        }
        stage_a.queue().add(Arc::new(Frame::end_of_acquisition()));

        assert!(wait_until(Duration::from_secs(5), || {
            forwarded_sentinels.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(a_processed.load(Ordering::SeqCst), N);
        assert_eq!(b_processed.load(Ordering::SeqCst), N);
        assert_eq!(a_eoa.load(Ordering::SeqCst), 1);
        assert_eq!(b_eoa.load(Ordering::SeqCst), 1);

        stage_a.stop();
        stage_b.stop();
        assert!(!stage_a.is_working());
        assert!(!stage_b.is_working());
    }

    #[test]
    fn invalid_frame_is_rejected() {
        let (meta, _meta_rx) = MetaPublisher::new();
        let plugin = PluginHandle::new(
            "sink",
            Box::new(CountingPlugin {
                processed: Arc::new(AtomicUsize::new(0)),
                eoa: Arc::new(AtomicUsize::new(0)),
                forward: false,
            }),
            meta,
        );
        let pools = DataBlockPools::default();
        let mut bad_meta = FrameMetaData::default();
        bad_meta.dataset_name = "data".to_string();
        let frame = Arc::new(Frame::from_data_block(0, bad_meta, pools.take(4), &[0; 4]));
        assert!(matches!(
            plugin.push(frame),
            Err(ChainError::InvalidFrame)
        ));
    }

    #[test]
    fn blocking_callbacks_preserve_registration_order() {
        let (meta, _meta_rx) = MetaPublisher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct OrderPlugin {
            tag: &'static str,
            order: Arc<Mutex<Vec<&'static str>>>,
        }
        impl FrameProcessorPlugin for OrderPlugin {
            fn process_frame(&mut self, _frame: Arc<Frame>, _ctx: &PluginContext<'_>) {
                self.order.lock().unwrap().push(self.tag);
            }
        }

        let source = PluginHandle::new(
            "source",
            Box::new(CountingPlugin {
                processed: Arc::new(AtomicUsize::new(0)),
                eoa: Arc::new(AtomicUsize::new(0)),
                forward: false,
            }),
            meta.clone(),
        );
        let first = PluginHandle::new(
            "first",
            Box::new(OrderPlugin {
                tag: "first",
                order: order.clone(),
            }),
            meta.clone(),
        );
        let second = PluginHandle::new(
            "second",
            Box::new(OrderPlugin {
                tag: "second",
                order: order.clone(),
            }),
            meta,
        );
        source.register_callback("first", first, true);
        source.register_callback("second", second, true);

        let pools = DataBlockPools::default();
        source.push(data_frame(&pools, 1)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn callback_name_is_exclusive_between_sets() {
        let (meta, _meta_rx) = MetaPublisher::new();
        let make = |name: &str| {
            PluginHandle::new(
                name,
                Box::new(CountingPlugin {
                    processed: Arc::new(AtomicUsize::new(0)),
                    eoa: Arc::new(AtomicUsize::new(0)),
                    forward: false,
                }),
                meta.clone(),
            )
        };
        let upstream = make("upstream");
        let downstream = make("downstream");
        upstream.register_callback("edge", downstream.clone(), false);
        // Second registration under the same name in the other set is refused
        upstream.register_callback("edge", downstream, true);
        assert_eq!(upstream.callbacks.lock().unwrap().len(), 1);
        assert!(upstream.blocking_callbacks.lock().unwrap().is_empty());
    }

    #[test]
    fn full_queue_drops_oldest() {
        let (meta, _meta_rx) = MetaPublisher::new();
        let plugin = PluginHandle::new(
            "slow",
            Box::new(CountingPlugin {
                processed: Arc::new(AtomicUsize::new(0)),
                eoa: Arc::new(AtomicUsize::new(0)),
                forward: false,
            }),
            meta,
        );
        // Worker not started: fill the queue beyond capacity
        let pools = DataBlockPools::default();
        for i in 0..(DEFAULT_QUEUE_CAPACITY + 5) as u64 {
            plugin.queue().add(data_frame(&pools, i));
        }
        assert_eq!(plugin.queue().len(), DEFAULT_QUEUE_CAPACITY);
        assert_eq!(plugin.queue().dropped(), 5);
    }

    #[test]
    fn errors_deduplicate() {
        let (meta, _meta_rx) = MetaPublisher::new();
        let plugin = PluginHandle::new(
            "p",
            Box::new(CountingPlugin {
                processed: Arc::new(AtomicUsize::new(0)),
                eoa: Arc::new(AtomicUsize::new(0)),
                forward: false,
            }),
            meta,
        );
        plugin.set_error("boom");
        plugin.set_error("boom");
        plugin.set_warning("careful");
        plugin.set_warning("careful");
        assert_eq!(plugin.errors(), vec!["boom".to_string()]);
        assert_eq!(plugin.warnings(), vec!["careful".to_string()]);
        plugin.clear_errors();
        assert!(plugin.errors().is_empty());
    }
}
