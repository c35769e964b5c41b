//! Elkrem: a one-way hash tree producing a long sequence of revocation
//! pre-images from a single 32-byte root.
//!
//! Nodes are addressed by their post-order traversal index, so the sender
//! hands out pre-images in the order 0, 1, 2, … and every non-leaf node it
//! reveals also discloses the entire subtree below it. The receiver only
//! ever needs to retain one node per tree level, giving O(log n) storage
//! for the full revocation history.
//!
//! Derivation is fixed as `left(h) = sha256(h)` and
//! `right(h) = sha256(h ‖ 0x01)`, over a tree of height 47.

use bitcoin::hashes::{sha256, Hash};

use std::fmt;

/// The height of the tree, bounding the number of derivable pre-images to
/// 2^48 - 1.
const MAX_HEIGHT: u8 = 47;

/// An error returned by the elkrem sender or receiver.
#[derive(Copy, Clone, PartialEq)]
pub enum ElkremError {
	/// The requested index lies outside the tree.
	OutOfRange,
	/// A received pre-image does not re-derive the previously accepted
	/// pre-images below it.
	Mismatch,
	/// The requested index has not been revealed to this receiver yet.
	NotYetReceived,
}

impl fmt::Debug for ElkremError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			ElkremError::OutOfRange => f.write_str("index outside the elkrem tree"),
			ElkremError::Mismatch => f.write_str("pre-image inconsistent with previously received nodes"),
			ElkremError::NotYetReceived => f.write_str("index not yet revealed"),
		}
	}
}

fn left_child(sha: &[u8; 32]) -> [u8; 32] {
	sha256::Hash::hash(&sha[..]).into_inner()
}

fn right_child(sha: &[u8; 32]) -> [u8; 32] {
	let mut buf = [0u8; 33];
	buf[..32].copy_from_slice(&sha[..]);
	buf[32] = 0x01;
	sha256::Hash::hash(&buf[..]).into_inner()
}

// Post-order index of the root of a tree with the given height.
fn root_index(height: u8) -> u64 {
	(1u64 << (height as u64 + 1)) - 2
}

// Walks from a node at post-order index `i` and height `h` down to the node
// at index `w`. The left child of a node at index i and height h sits at
// index i - 2^h, the right child at i - 1.
fn descend(w: u64, mut i: u64, mut h: u8, mut sha: [u8; 32]) -> Result<[u8; 32], ElkremError> {
	while w < i {
		if w <= i - (1u64 << h) {
			sha = left_child(&sha);
			i -= 1u64 << h;
		} else {
			sha = right_child(&sha);
			i -= 1;
		}
		if h == 0 {
			break;
		}
		h -= 1;
	}
	if w != i {
		return Err(ElkremError::OutOfRange);
	}
	Ok(sha)
}

/// The sender half of an elkrem tree. Stores only the root and re-derives
/// any pre-image on demand.
#[derive(Clone)]
pub struct ElkremSender {
	root: [u8; 32],
}

impl ElkremSender {
	/// Creates a sender from a 32-byte root secret.
	pub fn new(root: [u8; 32]) -> ElkremSender {
		ElkremSender { root }
	}

	/// Returns the pre-image at the given post-order index.
	pub fn at_index(&self, w: u64) -> Result<[u8; 32], ElkremError> {
		if w > root_index(MAX_HEIGHT) {
			return Err(ElkremError::OutOfRange);
		}
		descend(w, root_index(MAX_HEIGHT), MAX_HEIGHT, self.root)
	}
}

#[derive(Clone)]
struct ElkremNode {
	sha: [u8; 32],
	height: u8,
	index: u64,
}

/// The receiver half of an elkrem tree. Accepts pre-images in post-order
/// index order, verifying that every non-leaf node re-derives the two
/// subtree roots received before it, and retains at most one node per tree
/// level.
#[derive(Clone)]
pub struct ElkremReceiver {
	stack: Vec<ElkremNode>,
}

impl ElkremReceiver {
	/// Creates an empty receiver.
	pub fn new() -> ElkremReceiver {
		ElkremReceiver { stack: Vec::new() }
	}

	/// The post-order index of the most recently accepted pre-image, if
	/// any.
	pub fn up_to(&self) -> Option<u64> {
		self.stack.last().map(|node| node.index)
	}

	/// Inserts the next pre-image in the elkrem sequence.
	///
	/// A leaf is accepted as-is; its validity is established later, when
	/// the parent disclosing it arrives. A non-leaf node is accepted only
	/// if its derived children match the two equal-height nodes currently
	/// on top of the stack, which it then replaces.
	pub fn add_next(&mut self, sha: &[u8; 32]) -> Result<(), ElkremError> {
		let t = self.stack.len();
		let mut node = ElkremNode {
			sha: *sha,
			height: 0,
			index: if t > 0 { self.stack[t - 1].index + 1 } else { 0 },
		};
		if node.index > root_index(MAX_HEIGHT) {
			return Err(ElkremError::OutOfRange);
		}
		if t >= 2 && self.stack[t - 2].height == self.stack[t - 1].height {
			// Two equal-height subtrees on the stack mean this node must be
			// their parent.
			node.height = self.stack[t - 1].height + 1;
			if left_child(sha) != self.stack[t - 2].sha {
				return Err(ElkremError::Mismatch);
			}
			if right_child(sha) != self.stack[t - 1].sha {
				return Err(ElkremError::Mismatch);
			}
			self.stack.truncate(t - 2);
		}
		self.stack.push(node);
		Ok(())
	}

	/// Returns the pre-image at the given post-order index, re-deriving it
	/// from the retained node covering that index.
	pub fn at_index(&self, w: u64) -> Result<[u8; 32], ElkremError> {
		for node in self.stack.iter() {
			let subtree_size = (1u64 << (node.height as u64 + 1)) - 1;
			let lowest = node.index + 1 - subtree_size;
			if w >= lowest && w <= node.index {
				return descend(w, node.index, node.height, node.sha);
			}
		}
		Err(ElkremError::NotYetReceived)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sender_is_deterministic() {
		let sender_a = ElkremSender::new([7; 32]);
		let sender_b = ElkremSender::new([7; 32]);
		for i in 0..32 {
			assert_eq!(sender_a.at_index(i).unwrap(), sender_b.at_index(i).unwrap());
		}
		assert_ne!(sender_a.at_index(0).unwrap(), sender_a.at_index(1).unwrap());
	}

	#[test]
	fn receiver_accepts_in_order() {
		let sender = ElkremSender::new([1; 32]);
		let mut receiver = ElkremReceiver::new();
		for i in 0..64 {
			receiver.add_next(&sender.at_index(i).unwrap()).unwrap();
			assert_eq!(receiver.up_to(), Some(i));
			// Stack stays logarithmic: never more than one node per level.
			assert!(receiver.stack.len() <= 48);
		}
		// Every previously revealed index stays derivable.
		for i in 0..64 {
			assert_eq!(receiver.at_index(i).unwrap(), sender.at_index(i).unwrap());
		}
		assert_eq!(receiver.at_index(64), Err(ElkremError::NotYetReceived));
	}

	#[test]
	fn receiver_rejects_skipped_index() {
		let sender = ElkremSender::new([2; 32]);
		let mut receiver = ElkremReceiver::new();
		receiver.add_next(&sender.at_index(0).unwrap()).unwrap();
		// Index 1 is a leaf and slides in unverified, but the parent at
		// index 2 then exposes the substitution.
		receiver.add_next(&sender.at_index(3).unwrap()).unwrap();
		assert_eq!(receiver.add_next(&sender.at_index(2).unwrap()), Err(ElkremError::Mismatch));
	}

	#[test]
	fn receiver_rejects_mutated_preimage() {
		let sender = ElkremSender::new([3; 32]);
		let mut receiver = ElkremReceiver::new();
		receiver.add_next(&sender.at_index(0).unwrap()).unwrap();
		receiver.add_next(&sender.at_index(1).unwrap()).unwrap();
		let mut parent = sender.at_index(2).unwrap();
		parent[0] ^= 0x01;
		assert_eq!(receiver.add_next(&parent), Err(ElkremError::Mismatch));
		// The untampered parent is still accepted afterwards.
		receiver.add_next(&sender.at_index(2).unwrap()).unwrap();
		assert_eq!(receiver.up_to(), Some(2));
	}

	#[test]
	fn deep_indexes_resolve() {
		let sender = ElkremSender::new([4; 32]);
		// Root of the whole tree is the last derivable index.
		let last = (1u64 << 48) - 2;
		assert!(sender.at_index(last).is_ok());
		assert_eq!(sender.at_index(last + 1), Err(ElkremError::OutOfRange));
	}
}
