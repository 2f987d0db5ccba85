//! Cross-thread work queue primitives.
//!
//! Host threads describe work as [`IoEntry`] values and push them over a
//! single unbounded channel to the runtime thread, which executes them in
//! enqueue order. Each entry carries a [`ReplySlot`] describing how its
//! result travels back: dropped, handed to a blocked caller, or dispatched
//! onto the originating thread's [`CallbackQueue`].

use std::sync::mpsc;

use crate::error::BridgeError;
use crate::runner::RuntimeCore;
use crate::value::{FunctionRef, Value};

pub type BridgeResult = Result<Value, BridgeError>;

/// Completion callback delivered on the caller's queue.
pub type ResultCallback = Box<dyn FnOnce(BridgeResult) + Send>;

/// Arbitrary work executed on the runtime thread with engine access.
pub(crate) type TransactionFn = Box<dyn FnOnce(&mut RuntimeCore) -> BridgeResult + Send>;

/// A unit of work bound for the runtime thread.
pub(crate) enum IoEntry {
    /// Run a closure with direct engine access.
    Transaction {
        perform: TransactionFn,
        reply: ReplySlot,
    },
    /// Call `target.function(args...)`.
    Invoke {
        target: String,
        function: String,
        args: Vec<Value>,
        reply: ReplySlot,
    },
    /// Call `target.emit(event, args...)`; a missing target or emitter is a
    /// no-op, matching event semantics.
    Emit {
        target: String,
        event: String,
        args: Vec<Value>,
        reply: ReplySlot,
    },
    /// Call a captured script function by handle.
    CallHandle {
        function: FunctionRef,
        args: Vec<Value>,
        reply: ReplySlot,
    },
    /// Release a captured script function. Never replies.
    ReleaseHandle { function: FunctionRef },
    /// Stop the runtime loop after this entry.
    Shutdown,
}

impl IoEntry {
    /// Short tag for logging.
    pub fn describe(&self) -> &'static str {
        match self {
            IoEntry::Transaction { .. } => "transaction",
            IoEntry::Invoke { .. } => "invoke",
            IoEntry::Emit { .. } => "emit",
            IoEntry::CallHandle { .. } => "call-handle",
            IoEntry::ReleaseHandle { .. } => "release-handle",
            IoEntry::Shutdown => "shutdown",
        }
    }

    /// Rejects the entry without executing it. Used for entries drained
    /// after the runtime loop stops; delivery is not guaranteed past
    /// shutdown, but waiters must still be unblocked.
    pub fn abort(self) {
        match self {
            IoEntry::Transaction { reply, .. }
            | IoEntry::Invoke { reply, .. }
            | IoEntry::Emit { reply, .. }
            | IoEntry::CallHandle { reply, .. } => {
                reply.deliver(Err(BridgeError::RuntimeUnavailable));
            }
            IoEntry::ReleaseHandle { .. } | IoEntry::Shutdown => {}
        }
    }
}

/// How an entry's result travels back to its originator.
pub(crate) enum ReplySlot {
    /// Fire and forget.
    Ignore,
    /// A caller is blocked on the paired receiver.
    Rendezvous(mpsc::SyncSender<BridgeResult>),
    /// Dispatch the callback onto the originating thread's queue.
    Sink {
        sink: CallbackSink,
        callback: ResultCallback,
    },
}

impl ReplySlot {
    pub fn deliver(self, result: BridgeResult) {
        match self {
            ReplySlot::Ignore => {}
            ReplySlot::Rendezvous(tx) => {
                // A send failure means the caller gave up (timeout); the
                // result is dropped, which is the documented race.
                let _ = tx.send(result);
            }
            ReplySlot::Sink { sink, callback } => {
                sink.post(move || callback(result));
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Job(Job),
    /// Stops the pumping loop; jobs posted earlier still run first.
    Close,
}

/// Receiving end of a host-thread callback queue. The thread that owns the
/// results pumps this queue; by default the facade runs one on a dedicated
/// thread.
pub struct CallbackQueue {
    rx: mpsc::Receiver<Message>,
}

/// Cloneable handle used to post jobs onto a [`CallbackQueue`].
#[derive(Clone)]
pub struct CallbackSink {
    tx: mpsc::Sender<Message>,
}

impl CallbackSink {
    /// Posts a job; silently dropped when the queue is gone, since a
    /// departed consumer has declared it no longer wants results.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Message::Job(Box::new(job)));
    }

    /// Stops the queue's pumping loop after the jobs already posted, even
    /// while other sink clones are still alive.
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close);
    }
}

impl CallbackQueue {
    /// Creates a queue and its first sink. `run` returns once every sink
    /// clone has been dropped or any sink calls [`CallbackSink::close`].
    pub fn channel() -> (CallbackSink, CallbackQueue) {
        let (tx, rx) = mpsc::channel();
        (CallbackSink { tx }, CallbackQueue { rx })
    }

    /// Runs one pending job if any is ready.
    pub fn pump_one(&self) -> bool {
        match self.rx.try_recv() {
            Ok(Message::Job(job)) => {
                job();
                true
            }
            Ok(Message::Close) | Err(_) => false,
        }
    }

    /// Blocks for the next job, up to `timeout`.
    pub fn pump_timeout(&self, timeout: std::time::Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(Message::Job(job)) => {
                job();
                true
            }
            Ok(Message::Close) | Err(_) => false,
        }
    }

    /// Runs jobs until every sink has been dropped or the queue is closed.
    pub fn run(&self) {
        while let Ok(message) = self.rx.recv() {
            match message {
                Message::Job(job) => job(),
                Message::Close => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn rendezvous_delivers_to_blocked_caller() {
        let (tx, rx) = mpsc::sync_channel(1);
        ReplySlot::Rendezvous(tx).deliver(Ok(Value::Int(9)));
        let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received.unwrap(), Value::Int(9));
    }

    #[test]
    fn rendezvous_tolerates_departed_caller() {
        let (tx, rx) = mpsc::sync_channel::<BridgeResult>(1);
        drop(rx);
        ReplySlot::Rendezvous(tx).deliver(Ok(Value::Null));
    }

    #[test]
    fn sink_reply_runs_on_the_pumping_thread() {
        let (sink, queue) = CallbackQueue::channel();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        ReplySlot::Sink {
            sink,
            callback: Box::new(move |result| {
                assert_eq!(result.unwrap(), Value::Int(1));
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        }
        .deliver(Ok(Value::Int(1)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(queue.pump_timeout(Duration::from_secs(1)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_queue_preserves_post_order() {
        let (sink, queue) = CallbackQueue::channel();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            sink.post(move || seen.lock().unwrap().push(i));
        }
        while queue.pump_one() {}
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn close_stops_the_run_loop_despite_live_sinks() {
        let (sink, queue) = CallbackQueue::channel();
        let retained = sink.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        sink.post(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        sink.close();
        // Returns even though `retained` is still alive; the job posted
        // before the close still ran.
        queue.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(retained);
    }

    #[test]
    fn aborted_entry_unblocks_waiter_with_unavailable() {
        let (tx, rx) = mpsc::sync_channel(1);
        let entry = IoEntry::Invoke {
            target: "t".into(),
            function: "f".into(),
            args: Vec::new(),
            reply: ReplySlot::Rendezvous(tx),
        };
        entry.abort();
        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            Err(BridgeError::RuntimeUnavailable) => {}
            other => panic!("expected RuntimeUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn abort_of_silent_entries_is_a_no_op() {
        IoEntry::Shutdown.abort();
        IoEntry::ReleaseHandle {
            function: crate::value::FunctionRef { id: 1 },
        }
        .abort();
    }
}
