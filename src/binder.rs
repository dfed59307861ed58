//! Dispatch table from message ids to typed handlers.
//!
//! Handlers are registered explicitly: [`MethodBinder::on`] for
//! notifications, [`MethodBinder::answer`] for request/reply methods. The
//! id defaults to `wire_hash(T::TYPE_NAME)` so both sides derive it from
//! the packet type alone.
//!
//! [`DispatchMode::Serial`] runs handlers one at a time in arrival order on
//! a single pool worker; [`DispatchMode::Concurrent`] spawns each dispatch
//! independently.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{FromValue, Packet, ToValue, Value};
use crate::error::Result;
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// In-order, non-overlapping handler runs.
    Serial,
    /// Every dispatch on its own worker.
    Concurrent,
}

/// Where replies go. Implemented by the peer; kept abstract so the binder
/// can be tested alone.
pub trait ResponseSink: Send + Sync {
    fn send_reply(&self, request_id: i32, sequence: i32, value: &Value);
    fn send_error(&self, request_id: i32, sequence: i32, message: &str);
}

/// One inbound message handed to the binder.
pub struct DispatchContext {
    pub message_id: i32,
    pub sequence: i32,
    pub value: Value,
    pub sink: Arc<dyn ResponseSink>,
}

/// `None` = notification handler, no reply. `Some` = reply or error text.
type HandlerFn = dyn Fn(&Value) -> Option<Result<Value>> + Send + Sync;

struct MethodEntry {
    name: &'static str,
    handler: Box<HandlerFn>,
}

#[derive(Default)]
struct SerialQueue {
    jobs: VecDeque<(Arc<MethodEntry>, DispatchContext)>,
    draining: bool,
}

pub struct MethodBinder {
    mode: DispatchMode,
    pool: Arc<WorkerPool>,
    methods: Mutex<HashMap<i32, Arc<MethodEntry>>>,
    serial: Arc<Mutex<SerialQueue>>,
}

impl MethodBinder {
    pub fn new(mode: DispatchMode, pool: Arc<WorkerPool>) -> Self {
        Self {
            mode,
            pool,
            methods: Mutex::new(HashMap::new()),
            serial: Arc::new(Mutex::new(SerialQueue::default())),
        }
    }

    /// Bind a notification handler for `T` at its default id.
    pub fn on<T, F>(&self, handler: F)
    where
        T: Packet,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.bind_raw(
            T::message_id(),
            T::TYPE_NAME,
            Box::new(move |value| match T::from_value(value) {
                Some(packet) => {
                    handler(packet);
                    None
                }
                None => Some(Err(crate::error::WireError::Decode(format!(
                    "payload is not a {}",
                    T::TYPE_NAME
                )))),
            }),
        );
    }

    /// Bind a request handler for `T` whose reply `R` is sent back to the
    /// caller.
    pub fn answer<T, R, F>(&self, handler: F)
    where
        T: Packet,
        R: Packet,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        self.bind_raw(
            T::message_id(),
            T::TYPE_NAME,
            Box::new(move |value| match T::from_value(value) {
                Some(packet) => Some(handler(packet).map(|reply| reply.to_value())),
                None => Some(Err(crate::error::WireError::Decode(format!(
                    "payload is not a {}",
                    T::TYPE_NAME
                )))),
            }),
        );
    }

    /// Bind at an explicit id, for ids negotiated outside the type names.
    pub fn on_id<F>(&self, id: i32, name: &'static str, handler: F)
    where
        F: Fn(&Value) -> Option<Result<Value>> + Send + Sync + 'static,
    {
        self.bind_raw(id, name, Box::new(handler));
    }

    fn bind_raw(&self, id: i32, name: &'static str, handler: Box<HandlerFn>) {
        let mut methods = self.methods.lock();
        if let Some(previous) = methods.insert(id, Arc::new(MethodEntry { name, handler })) {
            warn!(id, old = previous.name, new = name, "method rebound");
        } else {
            debug!(id, method = name, "method bound");
        }
    }

    /// Name of the method bound at `id`, for log context.
    pub fn method_name(&self, id: i32) -> Option<&'static str> {
        self.methods.lock().get(&id).map(|e| e.name)
    }

    /// Remove every binding.
    pub fn unbind(&self) {
        self.methods.lock().clear();
    }

    /// Route one inbound message. Unknown ids are dropped with a log line.
    pub fn dispatch(&self, ctx: DispatchContext) {
        let entry = match self.methods.lock().get(&ctx.message_id) {
            Some(entry) => Arc::clone(entry),
            None => {
                warn!(id = ctx.message_id, "no bound method, message dropped");
                return;
            }
        };

        match self.mode {
            DispatchMode::Concurrent => {
                self.pool.spawn(move || Self::run(&entry, ctx));
            }
            DispatchMode::Serial => {
                let start_drain = {
                    let mut queue = self.serial.lock();
                    queue.jobs.push_back((entry, ctx));
                    if queue.draining {
                        false
                    } else {
                        queue.draining = true;
                        true
                    }
                };

                if start_drain {
                    let serial = Arc::clone(&self.serial);
                    self.pool.spawn(move || loop {
                        let (entry, ctx) = {
                            let mut queue = serial.lock();
                            match queue.jobs.pop_front() {
                                Some(job) => job,
                                None => {
                                    queue.draining = false;
                                    break;
                                }
                            }
                        };
                        Self::run(&entry, ctx);
                    });
                }
            }
        }
    }

    fn run(entry: &MethodEntry, ctx: DispatchContext) {
        let outcome = catch_unwind(AssertUnwindSafe(|| (entry.handler)(&ctx.value)));

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(method = entry.name, "handler panicked");
                Some(Err(crate::error::WireError::Remote(format!(
                    "handler {} failed",
                    entry.name
                ))))
            }
        };

        let Some(result) = result else {
            return;
        };

        if ctx.sequence == 0 {
            if let Err(e) = result {
                warn!(method = entry.name, error = %e, "notification handler failed");
            }
            return;
        }

        match result {
            Ok(value) => ctx.sink.send_reply(ctx.message_id, ctx.sequence, &value),
            Err(e) => {
                warn!(method = entry.name, error = %e, "handler failed");
                ctx.sink
                    .send_error(ctx.message_id, ctx.sequence, &e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;
    use crate::wire_packet;
    use std::sync::mpsc;
    use std::time::Duration;

    wire_packet! {
        struct Step {
            pub index: i32,
        }
    }

    wire_packet! {
        struct StepDone {
            pub index: i32,
        }
    }

    struct Replies(Mutex<mpsc::Sender<std::result::Result<Value, String>>>);

    impl ResponseSink for Replies {
        fn send_reply(&self, _request_id: i32, _sequence: i32, value: &Value) {
            let _ = self.0.lock().send(Ok(value.clone()));
        }

        fn send_error(&self, _request_id: i32, _sequence: i32, message: &str) {
            let _ = self.0.lock().send(Err(message.to_owned()));
        }
    }

    fn ctx(value: Value, sequence: i32, sink: &Arc<Replies>) -> DispatchContext {
        DispatchContext {
            message_id: Step::message_id(),
            sequence,
            value,
            sink: Arc::clone(sink) as Arc<dyn ResponseSink>,
        }
    }

    #[test]
    fn test_serial_preserves_order_under_mixed_durations() {
        let pool = Arc::new(WorkerPool::with_defaults());
        let binder = MethodBinder::new(DispatchMode::Serial, Arc::clone(&pool));

        let (tx, rx) = mpsc::channel();
        let order = Mutex::new(tx);
        binder.on::<Step, _>(move |step| {
            // Early steps take longer; order must still hold.
            std::thread::sleep(Duration::from_millis(30u64.saturating_sub(step.index as u64 * 10)));
            let _ = order.lock().send(step.index);
        });

        let (sink_tx, _sink_rx) = mpsc::channel();
        let sink = Arc::new(Replies(Mutex::new(sink_tx)));
        for index in 0..3 {
            binder.dispatch(ctx(Step { index }.to_value(), 0, &sink));
        }

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 0);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 1);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), 2);
        pool.shutdown();
    }

    #[test]
    fn test_answer_posts_reply_and_error() {
        let pool = Arc::new(WorkerPool::with_defaults());
        let binder = MethodBinder::new(DispatchMode::Concurrent, Arc::clone(&pool));

        binder.answer::<Step, StepDone, _>(|step| {
            if step.index < 0 {
                Err(WireError::Protocol("negative step".into()))
            } else {
                Ok(StepDone { index: step.index })
            }
        });

        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(Replies(Mutex::new(tx)));

        binder.dispatch(ctx(Step { index: 4 }.to_value(), 1, &sink));
        let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(StepDone::from_value(&reply), Some(StepDone { index: 4 }));

        binder.dispatch(ctx(Step { index: -1 }.to_value(), 2, &sink));
        let err = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
        assert!(err.contains("negative step"));
        pool.shutdown();
    }

    #[test]
    fn test_unknown_id_dropped() {
        let pool = Arc::new(WorkerPool::with_defaults());
        let binder = MethodBinder::new(DispatchMode::Concurrent, Arc::clone(&pool));

        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(Replies(Mutex::new(tx)));
        binder.dispatch(ctx(Step { index: 1 }.to_value(), 7, &sink));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        pool.shutdown();
    }

    #[test]
    fn test_rebind_replaces_and_unbind_clears() {
        let pool = Arc::new(WorkerPool::with_defaults());
        let binder = MethodBinder::new(DispatchMode::Concurrent, Arc::clone(&pool));

        binder.on::<Step, _>(|_| {});
        assert_eq!(binder.method_name(Step::message_id()), Some("Step"));

        let (tx, rx) = mpsc::channel();
        binder.on::<Step, _>(move |step| {
            let _ = tx.send(step.index);
        });

        let (sink_tx, _sink_rx) = mpsc::channel();
        let sink = Arc::new(Replies(Mutex::new(sink_tx)));
        binder.dispatch(ctx(Step { index: 9 }.to_value(), 0, &sink));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 9);

        binder.unbind();
        assert_eq!(binder.method_name(Step::message_id()), None);
        pool.shutdown();
    }

    #[test]
    fn test_panicking_handler_reports_error() {
        let pool = Arc::new(WorkerPool::with_defaults());
        let binder = MethodBinder::new(DispatchMode::Concurrent, Arc::clone(&pool));

        binder.answer::<Step, StepDone, _>(|_| panic!("boom"));

        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(Replies(Mutex::new(tx)));
        binder.dispatch(ctx(Step { index: 0 }.to_value(), 3, &sink));

        let err = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
        assert!(err.contains("Step"));
        pool.shutdown();
    }
}
