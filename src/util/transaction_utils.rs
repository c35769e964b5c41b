use bitcoin::blockdata::transaction::Transaction;

use std::cmp::Ordering;

/// Sorts a transaction's inputs and outputs into the agreed-upon canonical
/// (BIP-69) ordering: inputs by previous txid (in display byte order) then
/// output index, outputs by value then script bytes. Both channel parties
/// apply this to independently constructed transactions so that only
/// signatures, never full transactions, need to cross the wire.
pub fn sort_transaction(tx: &mut Transaction) {
	tx.input.sort_unstable_by(|a, b| {
		let a_txid = display_order_txid(&a.previous_output.txid);
		let b_txid = display_order_txid(&b.previous_output.txid);
		match a_txid.cmp(&b_txid) {
			Ordering::Equal => a.previous_output.vout.cmp(&b.previous_output.vout),
			ord => ord,
		}
	});
	tx.output.sort_unstable_by(|a, b| {
		if a.value < b.value {
			Ordering::Less
		} else if b.value < a.value {
			Ordering::Greater
		} else {
			a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes())
		}
	});
}

// Txids are compared in the byte order they are displayed in, which is the
// reverse of their in-memory order.
fn display_order_txid(txid: &::bitcoin::Txid) -> [u8; 32] {
	use bitcoin::hashes::Hash;
	let mut bytes = txid.into_inner();
	bytes.reverse();
	bytes
}
