//! Non-blocking ports connecting processors.
//!
//! Ports are thin wrappers over `flume` channels. An input port tells
//! "nothing yet" apart from "end of stream", and an output port tells "full"
//! apart from "closed downstream", which is all the step protocol needs.
//!
//! Capacity is enforced with a second channel of permits: the output side
//! takes a permit before every push and the input side hands it back when a
//! value leaves the channel. Both ends can therefore await readiness
//! ([`InputPort::ready`], [`OutputPort::ready`]) without consuming anything.

use flume::{Receiver, Sender, TryRecvError};

/// Result of a non-blocking pull.
#[derive(Debug)]
pub enum Pull<T> {
    /// A value was available.
    Ready(T),
    /// The producer is still open but has nothing ready.
    Empty,
    /// The producer closed and every value was consumed.
    Finished,
}

/// Create a connected output/input port pair holding at most `capacity` values.
pub fn channel<T>(capacity: usize) -> (OutputPort<T>, InputPort<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = flume::unbounded();
    let (permit_tx, permit_rx) = flume::bounded(capacity);
    for _ in 0..capacity {
        // Cannot fail: the permit channel was sized for exactly this.
        let _ = permit_tx.try_send(());
    }
    (
        OutputPort {
            tx: Some(tx),
            permits: permit_rx,
            reserved: false,
        },
        InputPort {
            rx: Some(rx),
            permits: permit_tx,
            peeked: None,
        },
    )
}

/// Receiving end of a port.
#[derive(Debug)]
pub struct InputPort<T> {
    rx: Option<Receiver<T>>,
    permits: Sender<()>,
    peeked: Option<T>,
}

impl<T> InputPort<T> {
    fn dequeued(&self, value: T) -> T {
        // Every output may be gone already; nobody needs the permit then.
        let _ = self.permits.try_send(());
        value
    }

    /// Pull one value without blocking.
    pub fn try_pull(&mut self) -> Pull<T> {
        if let Some(value) = self.peeked.take() {
            return Pull::Ready(value);
        }
        let Some(rx) = &self.rx else {
            return Pull::Finished;
        };
        let received = rx.try_recv();
        match received {
            Ok(value) => Pull::Ready(self.dequeued(value)),
            Err(TryRecvError::Empty) => Pull::Empty,
            Err(TryRecvError::Disconnected) => {
                self.rx = None;
                Pull::Finished
            }
        }
    }

    /// `true` once the producer closed and nothing is left to read, or after
    /// [`close`](Self::close).
    pub fn is_finished(&self) -> bool {
        if self.peeked.is_some() {
            return false;
        }
        match &self.rx {
            Some(rx) => rx.is_disconnected() && rx.is_empty(),
            None => true,
        }
    }

    /// Drop the receiver. The producer observes a disconnected channel.
    pub fn close(&mut self) {
        self.rx = None;
        self.peeked = None;
    }

    /// Wait until [`try_pull`](Self::try_pull) returns something other than
    /// [`Pull::Empty`].
    pub async fn ready(&mut self) {
        if self.peeked.is_some() {
            return;
        }
        let Some(rx) = &self.rx else {
            return;
        };
        let received = rx.recv_async().await;
        match received {
            Ok(value) => self.peeked = Some(self.dequeued(value)),
            Err(_) => self.rx = None,
        }
    }

    /// Await the next value. Returns `None` at end of stream.
    pub async fn recv(&mut self) -> Option<T> {
        self.ready().await;
        self.peeked.take()
    }
}

impl<T> Clone for InputPort<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            permits: self.permits.clone(),
            peeked: None,
        }
    }
}

/// Sending end of a port.
#[derive(Debug)]
pub struct OutputPort<T> {
    tx: Option<Sender<T>>,
    permits: Receiver<()>,
    reserved: bool,
}

impl<T> OutputPort<T> {
    fn try_reserve(&mut self) -> bool {
        if !self.reserved {
            self.reserved = self.permits.try_recv().is_ok();
        }
        self.reserved
    }

    /// `true` when a push would be accepted right now.
    pub fn can_push(&self) -> bool {
        !self.is_finished() && (self.reserved || !self.permits.is_empty())
    }

    /// `true` once every consumer went away or after [`finish`](Self::finish).
    pub fn is_finished(&self) -> bool {
        self.tx.as_ref().map_or(true, Sender::is_disconnected)
    }

    /// Push a value. Returns the value back if the port is full or closed.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        if self.is_finished() || !self.try_reserve() {
            return Err(value);
        }
        let Some(tx) = &self.tx else {
            return Err(value);
        };
        match tx.send(value) {
            Ok(()) => {
                self.reserved = false;
                Ok(())
            }
            Err(err) => Err(err.into_inner()),
        }
    }

    /// Signal end of stream to the consumers.
    pub fn finish(&mut self) {
        self.tx = None;
    }

    /// Wait until [`push`](Self::push) would succeed or the port is finished.
    pub async fn ready(&mut self) {
        if self.reserved || self.is_finished() {
            return;
        }
        // Fails only once every input port is gone, which also finishes us.
        self.reserved = self.permits.recv_async().await.is_ok();
    }

    /// Await capacity and push. Returns the value back if the consumers are gone.
    pub async fn send(&mut self, value: T) -> Result<(), T> {
        self.ready().await;
        self.push(value)
    }
}

impl<T> Clone for OutputPort<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            permits: self.permits.clone(),
            reserved: false,
        }
    }
}
