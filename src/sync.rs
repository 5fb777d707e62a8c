//! One-shot completion primitive shared by in-flight fetches, authentication
//! challenges, and list-refresh parking.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use tokio::sync::watch;
// self
use crate::_prelude::*;

/// A multi-waiter, one-shot value cell.
///
/// Clones share the cell: `complete` may be called from any clone and every
/// `wait` observes the completed value. The first completion wins; later calls
/// are ignored.
pub(crate) struct Completion<T: Clone> {
	tx: Arc<watch::Sender<Option<T>>>,
}
impl<T: Clone> Completion<T> {
	pub(crate) fn new() -> Self {
		let (tx, _rx) = watch::channel(None);

		Self { tx: Arc::new(tx) }
	}

	pub(crate) fn complete(&self, value: T) {
		self.tx.send_if_modified(|slot| {
			if slot.is_none() {
				*slot = Some(value);

				true
			} else {
				false
			}
		});
	}

	pub(crate) async fn wait(&self) -> T {
		let mut rx = self.tx.subscribe();

		loop {
			if let Some(value) = rx.borrow_and_update().clone() {
				return value;
			}

			// The sender half lives in `self`, so the channel cannot close while
			// a waiter holds it.
			let _ = rx.changed().await;
		}
	}
}
impl<T: Clone> Clone for Completion<T> {
	fn clone(&self) -> Self {
		Self { tx: self.tx.clone() }
	}
}
impl<T: Clone> Default for Completion<T> {
	fn default() -> Self {
		Self::new()
	}
}
impl<T: Clone> Debug for Completion<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("Completion").field("completed", &self.tx.borrow().is_some()).finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[tokio::test]
	async fn waiters_share_the_first_completed_value() {
		let completion = Completion::new();
		let waiter = completion.clone();
		let handle = tokio::spawn(async move { waiter.wait().await });

		completion.complete(1);
		completion.complete(2);

		assert_eq!(handle.await.expect("join"), 1);
		assert_eq!(completion.wait().await, 1);
	}
}
