//! Bounded event queue with pause/resume watermarks.
//!
//! The search driver pushes transport events through one of these; the
//! consumer side pulls them lazily. When the backlog grows past the high
//! watermark the producer is parked after its push, which stops the driver
//! from requesting further pages; once the consumer has drained the backlog
//! below the low watermark the producer is released again. Only one
//! producer may be parked at a time; the `paused` flag encodes that a
//! single resume is outstanding.

use std::{
	collections::VecDeque,
	sync::atomic::{AtomicBool, Ordering},
};

use tokio::sync::{Mutex, Notify};

/// Backlog depth after which the producer is parked.
const HIGH_WATERMARK: usize = 2000;

/// Backlog depth below which a parked producer is released.
const LOW_WATERMARK: usize = 200;

/// The queue was closed; the producer should stop and tear down.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Closed;

#[derive(Debug)]
struct Backlog<T> {
	items: VecDeque<T>,
	/// A producer is parked waiting for the backlog to drain.
	paused: bool,
}

/// Single-producer single-consumer FIFO with hysteresis backpressure.
#[derive(Debug)]
pub(crate) struct EventQueue<T> {
	backlog: Mutex<Backlog<T>>,
	closed: AtomicBool,
	readable: Notify,
	resume: Notify,
}

impl<T> EventQueue<T> {
	pub(crate) fn new() -> Self {
		EventQueue {
			backlog: Mutex::new(Backlog { items: VecDeque::new(), paused: false }),
			closed: AtomicBool::new(false),
			readable: Notify::new(),
			resume: Notify::new(),
		}
	}

	/// Append one event. Parks until the consumer drains the backlog when
	/// the push crossed the high watermark. Returns [`Closed`] once the
	/// consumer is gone, signalling the producer to unwind.
	pub(crate) async fn push(&self, item: T) -> Result<(), Closed> {
		if self.closed.load(Ordering::Acquire) {
			return Err(Closed);
		}
		let pause = {
			let mut backlog = self.backlog.lock().await;
			backlog.items.push_back(item);
			if backlog.items.len() > HIGH_WATERMARK && !backlog.paused {
				backlog.paused = true;
				true
			} else {
				false
			}
		};
		self.readable.notify_one();
		if pause {
			self.resume.notified().await;
			if self.closed.load(Ordering::Acquire) {
				return Err(Closed);
			}
		}
		Ok(())
	}

	/// Remove the oldest event, waiting for one to arrive. Returns `None`
	/// once the queue is closed and drained.
	pub(crate) async fn pop(&self) -> Option<T> {
		loop {
			{
				let mut backlog = self.backlog.lock().await;
				if let Some(item) = backlog.items.pop_front() {
					if backlog.paused && backlog.items.len() < LOW_WATERMARK {
						backlog.paused = false;
						self.resume.notify_one();
					}
					return Some(item);
				}
				if self.closed.load(Ordering::Acquire) {
					return None;
				}
			}
			self.readable.notified().await;
		}
	}

	/// Close the queue. Never blocks, so it is safe to call from `Drop`;
	/// both sides are woken up and a parked producer sees [`Closed`] on its
	/// next step.
	pub(crate) fn close(&self) {
		self.closed.store(true, Ordering::Release);
		self.readable.notify_one();
		self.resume.notify_one();
	}
}
