//! The peer message contracts the channel engine produces and consumes.
//!
//! Wire encoding is the embedding application's concern; these are the
//! in-memory shapes exchanged with the state machine. The funding workflow
//! messages (init, cancel, contribution and counterparty-signature
//! exchanges, plus their single-funder variants) surface as arguments to
//! the corresponding [`LightningWallet`](::ln::wallet::LightningWallet)
//! methods rather than as standalone types.

use bitcoin::blockdata::transaction::OutPoint;

use secp256k1::PublicKey;

/// Revokes a prior commitment state and extends the counterparty's
/// revocation window by one.
///
/// An all-zero `revocation` pre-image turns the message into a pure window
/// extension: nothing is revoked, only the new key/hash pair is handed
/// over.
#[derive(Clone, Debug)]
pub struct CommitRevocation {
	/// The funding outpoint uniquely identifying the channel.
	pub channel_point: OutPoint,
	/// The pre-image revoking the sender's lowest unrevoked commitment.
	pub revocation: [u8; 32],
	/// The revocation public key for the commitment at the sender's new
	/// window edge.
	pub next_revocation_key: PublicKey,
	/// sha256 of the pre-image behind `next_revocation_key`, committed to
	/// by HTLC scripts at that height.
	pub next_revocation_hash: [u8; 32],
}

/// Requests the addition of a new HTLC to the shared update log.
#[derive(Clone, Debug)]
pub struct HTLCAddRequest {
	/// sha256 of the payment pre-image; the HTLC settles against its
	/// revelation.
	pub redemption_hash: [u8; 32],
	/// The HTLC amount, in asset units.
	pub amount: u64,
	/// Absolute block height after which the HTLC expires.
	pub expiry: u32,
}
