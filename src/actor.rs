//! Actor-style subscribers: one serial consumer thread per subscriber.
//!
//! A subscriber owns a worker object and a FIFO of pending deliveries. The
//! consumer thread drains the FIFO in batches, invoking the worker's
//! [`Handler::on_event`] per event and [`Actor::on_batch_done`] after each
//! drained batch. The subscriber also observes the process shutdown signal,
//! so actors tear down during a coordinated exit without any extra wiring.
//!
//! Subscriber lifetime is a scoped resource: dropping the handle (or the
//! type-erased [`SubscriberScope`]) removes the subscriber from every
//! routing table it touched, closes the FIFO, and joins the consumer thread
//! before returning. An event emitted after the drop completes is never
//! delivered.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::manager::LifetimeManager;
use crate::topic::{directory, next_subscriber_id, SubscriberId, Topic};

/// A subscriber's worker object, driven by its consumer thread.
///
/// Event handling itself is expressed per event type via [`Handler`].
pub trait Actor: Send + 'static {
    /// Invoked after each drained batch, before the consumer waits again.
    /// A producer that enqueues mid-batch is observed in the next batch.
    fn on_batch_done(&mut self) {}

    /// Invoked exactly once when the consumer is tearing down, whether from
    /// the scope being dropped or from process shutdown.
    fn on_shutdown(&mut self) {}
}

/// Handling of one event type by an [`Actor`]. A worker implements this once
/// per event type it subscribes to.
pub trait Handler<E>: Actor {
    /// Invoked for each event, in per-topic emission order. The payload is
    /// shared across subscribers and immutable from the moment of emission.
    fn on_event(&mut self, event: &E);
}

type Thunk<W> = Box<dyn FnOnce(&mut W) + Send>;

struct Fifo<W> {
    closed: bool,
    pending: Vec<Thunk<W>>,
}

struct Mailbox<W> {
    fifo: Mutex<Fifo<W>>,
    available: Condvar,
}

impl<W> Mailbox<W> {
    fn enqueue(&self, thunk: Thunk<W>) {
        let mut fifo = self.fifo.lock();
        if fifo.closed {
            return;
        }
        fifo.pending.push(thunk);
        self.available.notify_one();
    }

    fn close(&self) {
        let mut fifo = self.fifo.lock();
        fifo.closed = true;
        self.available.notify_all();
    }

    /// Take the whole pending buffer, or `None` once closed. Closing wins
    /// over pending deliveries.
    fn next_batch(&self) -> Option<Vec<Thunk<W>>> {
        let mut fifo = self.fifo.lock();
        loop {
            if fifo.closed {
                return None;
            }
            if !fifo.pending.is_empty() {
                return Some(std::mem::take(&mut fifo.pending));
            }
            self.available.wait(&mut fifo);
        }
    }
}

fn consume<W: Actor>(id: SubscriberId, mailbox: &Arc<Mailbox<W>>, mut worker: W) {
    let _shutdown = LifetimeManager::global().subscribe_shutdown({
        let mailbox = Arc::clone(mailbox);
        move || mailbox.close()
    });

    while let Some(batch) = mailbox.next_batch() {
        for thunk in batch {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| thunk(&mut worker))) {
                let message = panic_message(payload.as_ref());
                warn!(
                    subscriber = id,
                    panic = %message,
                    "event handler panicked; subscriber continues"
                );
                LifetimeManager::global()
                    .log(&format!("Event handler panicked in subscriber {id}: {message}"));
            }
        }
        worker.on_batch_done();
    }

    worker.on_shutdown();
    debug!(subscriber = id, "consumer thread exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("non-string panic payload"))
}

/// Create a subscriber around `worker` and start its consumer thread.
///
/// The returned handle is not yet wired to any topic; chain
/// [`SubscriberHandle::attach`] to route events into it. Requires the
/// lifetime manager to be activated.
#[must_use = "dropping the handle immediately tears the subscriber down"]
pub fn subscribe<W: Actor>(worker: W) -> SubscriberHandle<W> {
    let id = next_subscriber_id();
    let mailbox = Arc::new(Mailbox {
        fifo: Mutex::new(Fifo {
            closed: false,
            pending: Vec::new(),
        }),
        available: Condvar::new(),
    });

    let consumer = {
        let mailbox = Arc::clone(&mailbox);
        thread::spawn(move || consume(id, &mailbox, worker))
    };
    debug!(subscriber = id, "subscriber created");

    SubscriberHandle {
        id,
        mailbox,
        consumer: Some(consumer),
    }
}

/// Owning handle of one subscriber.
///
/// [`attach`](Self::attach) consumes and returns the handle, so wiring one
/// subscriber onto several topics reads as a chain:
///
/// ```ignore
/// let scope = vigil::subscribe(worker).attach(timers).attach(input);
/// ```
pub struct SubscriberHandle<W: Actor> {
    id: SubscriberId,
    mailbox: Arc<Mailbox<W>>,
    consumer: Option<JoinHandle<()>>,
}

impl<W: Actor> SubscriberHandle<W> {
    /// This subscriber's process-wide id.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Route events published on `topic` into this subscriber's FIFO.
    #[must_use = "attach consumes and returns the handle; rebind or chain it"]
    pub fn attach<E>(self, topic: Topic<E>) -> Self
    where
        W: Handler<E>,
        E: Send + Sync + 'static,
    {
        let table = directory().table::<E>();
        directory().link::<E>(self.id);

        let mailbox = Arc::clone(&self.mailbox);
        table.add_route(
            self.id,
            topic.id(),
            Box::new(move |event: Arc<E>| {
                mailbox.enqueue(Box::new(move |worker: &mut W| worker.on_event(&event)));
            }),
        );
        self
    }

    /// Erase the worker type, keeping only the scoped teardown.
    #[must_use = "dropping the scope immediately tears the subscriber down"]
    pub fn into_scope(self) -> SubscriberScope {
        SubscriberScope::from(self)
    }
}

impl<W: Actor> Drop for SubscriberHandle<W> {
    fn drop(&mut self) {
        directory().cleanup(self.id);
        self.mailbox.close();
        if let Some(consumer) = self.consumer.take() {
            if consumer.join().is_err() {
                warn!(subscriber = self.id, "consumer thread panicked");
            }
        }
    }
}

trait ScopedSubscriber: Send {}

impl<W: Actor> ScopedSubscriber for SubscriberHandle<W> {}

/// Type-erased holder of any [`SubscriberHandle`].
///
/// Dropping the scope removes the subscriber from every routing table it
/// touched, closes its FIFO, and blocks until the consumer thread joins.
pub struct SubscriberScope {
    _subscriber: Box<dyn ScopedSubscriber>,
}

impl<W: Actor> From<SubscriberHandle<W>> for SubscriberScope {
    fn from(handle: SubscriberHandle<W>) -> Self {
        Self {
            _subscriber: Box::new(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Mailbox semantics are testable without a consumer thread (and without
    // the activated manager the full subscriber path requires); the
    // end-to-end delivery scenarios live in tests/actor_delivery.rs.

    fn mailbox() -> Mailbox<Vec<u32>> {
        Mailbox {
            fifo: Mutex::new(Fifo {
                closed: false,
                pending: Vec::new(),
            }),
            available: Condvar::new(),
        }
    }

    #[test]
    fn batches_preserve_enqueue_order() {
        let mailbox = mailbox();
        for value in [1_u32, 2, 3] {
            mailbox.enqueue(Box::new(move |sink: &mut Vec<u32>| sink.push(value)));
        }

        let mut sink = Vec::new();
        let batch = mailbox.next_batch().expect("batch available");
        assert_eq!(batch.len(), 3);
        for thunk in batch {
            thunk(&mut sink);
        }
        assert_eq!(sink, [1, 2, 3]);
    }

    #[test]
    fn close_wins_over_pending_deliveries() {
        let mailbox = mailbox();
        mailbox.enqueue(Box::new(|sink: &mut Vec<u32>| sink.push(1)));
        mailbox.close();
        assert!(mailbox.next_batch().is_none());
    }

    #[test]
    fn enqueue_after_close_is_dropped() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let mailbox = mailbox();
        mailbox.close();

        struct CountOnDrop(Arc<AtomicUsize>);
        impl Drop for CountOnDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let marker = CountOnDrop(Arc::clone(&dropped));
        mailbox.enqueue(Box::new(move |_sink: &mut Vec<u32>| {
            let _keep = &marker;
        }));

        // The thunk, and with it the captured marker, must have been dropped
        // on the rejected enqueue path.
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let static_payload = panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_message(static_payload.as_ref()), "static message");

        let owned_payload =
            panic::catch_unwind(|| std::panic::panic_any(String::from("owned"))).unwrap_err();
        assert_eq!(panic_message(owned_payload.as_ref()), "owned");
    }
}
