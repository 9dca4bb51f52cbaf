//! The fixups queue.
//!
//! When a file's checksum does not match after a delta apply, the
//! updater queues a fixup request; the detailer drains the queue in a
//! second pass and asks for the whole file.  Items are keyed to their
//! collection so the second pass can walk the collection list in order.
//! Dropping the sender closes the queue, which is how the updater
//! signals the end of the first pass.

use tokio::sync::mpsc;

/// One fixup request: refetch `name` of collection `coll` (an index
/// into the configuration's collection list) from scratch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fixup {
	pub coll: usize,
	pub name: String,
}

#[derive(Clone, Debug)]
pub struct FixupsSender {
	tx: mpsc::UnboundedSender<Fixup>,
}

impl FixupsSender {
	pub fn put(&self, coll: usize, name: &str) {
		// A send can only fail once the detailer is gone, at which
		// point the fixup is moot anyway.
		let _ = self.tx.send(Fixup { coll, name: name.to_string() });
	}
}

#[derive(Debug)]
pub struct FixupsReceiver {
	rx: mpsc::UnboundedReceiver<Fixup>,
}

impl FixupsReceiver {
	/// Next fixup, waiting for the updater to produce one or close the
	/// queue.  None once the queue is closed and drained.
	pub async fn get(&mut self) -> Option<Fixup> {
		self.rx.recv().await
	}
}

/// Create a connected fixups queue.
pub fn fixups() -> (FixupsSender, FixupsReceiver) {
	let (tx, rx) = mpsc::unbounded_channel();
	(FixupsSender { tx }, FixupsReceiver { rx })
}


// vim: ts=4
