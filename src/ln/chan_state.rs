//! The durable record backing an open channel, and the narrow persistence
//! interface the state machine checkpoints it through. The on-disk schema
//! is the embedding application's concern; the engine only ever asks for a
//! full snapshot write or an incremental revocation-state append.

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction};

use secp256k1::{PublicKey, SecretKey};

use ln::elkrem::{ElkremReceiver, ElkremSender};

/// The full state of an open channel: the immutable parameters fixed at
/// funding plus the dynamic state advanced by every commitment update.
#[derive(Clone)]
pub struct OpenChannelState {
	/// Identifier of the node on the other end of the channel.
	pub their_node_id: [u8; 32],
	/// The outpoint of the on-chain funding output. Uniquely identifies
	/// the channel for its whole lifetime.
	pub funding_outpoint: OutPoint,
	/// The 2-of-2 redeem script of the funding output.
	pub funding_redeem_script: Script,
	/// Total value locked into the channel, in asset units.
	pub capacity: u64,
	/// Our settled balance, excluding pending HTLCs.
	pub our_balance: u64,
	/// The counterparty's settled balance, excluding pending HTLCs.
	pub their_balance: u64,
	/// Our multi-sig public key for the funding output.
	pub our_multisig_key: PublicKey,
	/// The counterparty's multi-sig public key for the funding output.
	pub their_multisig_key: PublicKey,
	/// The secret key behind our commitment outputs. Kept rather than just
	/// the public half because revocation private keys are derived from it
	/// once the counterparty reveals a pre-image.
	pub our_commit_key: SecretKey,
	/// The counterparty's commitment public key.
	pub their_commit_key: PublicKey,
	/// The CSV delay on our pay-to-self commitment output.
	pub local_csv_delay: u32,
	/// The CSV delay on the counterparty's pay-to-self output.
	pub remote_csv_delay: u32,
	/// Script our funds are paid out to on cooperative close.
	pub our_delivery_script: Script,
	/// Script the counterparty's funds are paid out to on cooperative
	/// close.
	pub their_delivery_script: Script,
	/// The latest fully-signed commitment transaction we can broadcast.
	pub our_commit_tx: Option<Transaction>,
	/// The counterparty's signature over `our_commit_tx`.
	pub our_commit_sig: Vec<u8>,
	/// Producer of our revocation pre-images.
	pub local_elkrem: ElkremSender,
	/// Append-only record of the counterparty's verified pre-images.
	pub remote_elkrem: ElkremReceiver,
	/// The revocation key whose pre-image revokes the counterparty's
	/// current commitment tail.
	pub their_current_revocation: Option<PublicKey>,
	/// sha256 of the pre-image expected to revoke the counterparty's tail,
	/// or all-zero when no HTLC has committed to one yet.
	pub their_current_revocation_hash: [u8; 32],
	/// Count of local commitment states accepted over the channel's
	/// lifetime. Monotonically non-decreasing.
	pub num_updates: u64,
	/// Confirmation depth the funding transaction needed before the
	/// channel opened.
	pub num_confs_required: u16,
}

impl OpenChannelState {
	/// Returns a read-only summary of the channel's current settled state.
	pub fn snapshot(&self) -> ChannelSnapshot {
		ChannelSnapshot {
			channel_point: self.funding_outpoint,
			capacity: self.capacity,
			our_balance: self.our_balance,
			their_balance: self.their_balance,
			num_updates: self.num_updates,
		}
	}
}

/// A point-in-time summary of a channel's settled state.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSnapshot {
	/// The channel's funding outpoint.
	pub channel_point: OutPoint,
	/// Total channel value, in asset units.
	pub capacity: u64,
	/// Our settled balance.
	pub our_balance: u64,
	/// The counterparty's settled balance.
	pub their_balance: u64,
	/// Number of accepted local commitment states.
	pub num_updates: u64,
}

/// The persistence checkpoints the engine emits. Implementations must make
/// each call durable before returning: a channel is only safe to re-open
/// from its last synced state.
pub trait ChannelPersister: Send + Sync {
	/// Writes the entire channel state.
	fn full_sync(&self, state: &OpenChannelState) -> Result<(), String>;

	/// Records the advanced revocation-receiver state after a counterparty
	/// revocation has been verified.
	fn sync_revocation(&self, state: &OpenChannelState) -> Result<(), String>;

	/// Removes all state for the channel, leaving at most a closing
	/// summary behind.
	fn close_channel(&self, channel_point: &OutPoint) -> Result<(), String>;
}
