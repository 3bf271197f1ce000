//! Typed event dispatch onto a single consumer task.
//!
//! An [`EventQueue`] is a bounded channel of owned event values plus the
//! loop that hands them, in order, to one handler. Producers on normal
//! task context use [`send`](EventQueue::send) and may suspend; interrupt
//! context uses [`send_irq`](EventQueue::send_irq), which never does.
//! Shutdown is cooperative: [`close`](EventQueue::close) completes only
//! after the consumer has drained everything queued before it and
//! returned.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use portable_atomic::{AtomicBool, Ordering};

use crate::config::EVENT_QUEUE_PARAM_MAX_LEN;
use crate::error::Error;

/// Consumer side of an [`EventQueue`].
pub trait EventHandler<T> {
    async fn handle(&mut self, event: T);
}

enum Msg<T> {
    Event(T),
    Close,
}

pub struct EventQueue<T, const N: usize> {
    channel: Channel<CriticalSectionRawMutex, Msg<T>, N>,
    closed: Signal<CriticalSectionRawMutex, ()>,
    dispatching: AtomicBool,
}

impl<T, const N: usize> Default for EventQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> EventQueue<T, N> {
    const PARAM_FITS: () = assert!(core::mem::size_of::<T>() <= EVENT_QUEUE_PARAM_MAX_LEN);

    pub const fn new() -> Self {
        let _: () = Self::PARAM_FITS;
        Self {
            channel: Channel::new(),
            closed: Signal::new(),
            dispatching: AtomicBool::new(false),
        }
    }

    /// Enqueue an event, waiting for space when the queue is full.
    pub async fn send(&self, event: T) {
        self.channel.send(Msg::Event(event)).await;
    }

    /// Enqueue an event without ever suspending. Safe to call from
    /// interrupt context; a full queue is reported as [`Error::Busy`].
    pub fn send_irq(&self, event: T) -> Result<(), Error> {
        self.channel
            .try_send(Msg::Event(event))
            .map_err(|_| Error::Busy)
    }

    /// True while the consumer is inside the handler. Lets a handler's
    /// callees detect they are being invoked from the dispatch context.
    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::Relaxed)
    }

    /// Consume events in FIFO order until [`close`](Self::close) is
    /// observed. Spawn this on the task that owns the queue.
    pub async fn run<H: EventHandler<T>>(&self, handler: &mut H) {
        loop {
            match self.channel.receive().await {
                Msg::Event(event) => {
                    self.dispatching.store(true, Ordering::Relaxed);
                    handler.handle(event).await;
                    self.dispatching.store(false, Ordering::Relaxed);
                }
                Msg::Close => {
                    self.closed.signal(());
                    return;
                }
            }
        }
    }

    /// Request shutdown and wait for the consumer to finish pending work.
    ///
    /// Must not be called from the handler itself; the consumer cannot
    /// drain its own queue while blocked here.
    pub async fn close(&self) {
        self.channel.send(Msg::Close).await;
        self.closed.wait().await;
    }
}
