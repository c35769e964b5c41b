//! The channel state machine: a pair of asymmetric commitment transaction
//! chains advanced through a pipelined sign/revoke protocol, sharing an
//! append-only HTLC update log.
//!
//! In order to allow updates to be fully non-blocking, either side is able
//! to create multiple new commitment states up to a pre-determined window
//! size. Before the start of a session both sides send out revocation
//! messages with all-zero pre-images to populate their revocation window
//! for the remote party; [`LightningChannel::extend_revocation_window`]
//! grows the window by a single revocation.
//!
//! The state machine has four main methods:
//!  * `sign_next_commitment` — called when one wishes to sign the next
//!    commitment, either initiating a new state update or responding to a
//!    received commitment.
//!  * `receive_new_commitment` — called upon receipt of a new commitment
//!    from the remote party. If the commitment is valid a revocation should
//!    immediately be generated and sent.
//!  * `revoke_current_commitment` — revokes the current commitment, to be
//!    called directly after receiving a new one.
//!  * `receive_revocation` — processes a revocation from the remote party,
//!    creating a new defacto broadcastable state on success.

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin::consensus::encode;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{Amount, EcdsaSighashType, PackedLockTime, Sequence, Txid, Witness};

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};
use secp256k1;

use chain::assets::AssetEncoder;
use chain::keysinterface::{SignDescriptor, Signer};
use ln::chan_state::{ChannelPersister, ChannelSnapshot, OpenChannelState};
use ln::chan_utils;
use ln::msgs::{CommitRevocation, HTLCAddRequest};
use util::errors::ChannelError;
use util::logger::Logger;
use util::transaction_utils;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

/// The number of unrevoked commitment transactions allowed within a
/// commitment chain. This value allows a greater degree of
/// de-synchronization by letting either party extend the other's chain
/// non-interactively, and also serves as a flow control mechanism.
pub const INITIAL_REVOCATION_WINDOW: usize = 4;

/// The current state of a particular channel.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChannelStatus {
	/// The channel is still going through the funding workflow.
	Pending,
	/// An open, active channel capable of sending and receiving HTLCs.
	Open,
	/// A cooperative closure is in progress; HTLC traffic is rejected.
	Closing,
	/// The channel has been fully closed.
	Closed,
	/// An un-cooperative closure has been detected. The dispute resolution
	/// path itself lives outside this state machine.
	Dispute,
}

/// The exact type of an entry within the shared HTLC log.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UpdateType {
	/// Adds a new HTLC to the channel.
	Add,
	/// Cancels an HTLC after its absolute timeout, returning the funds to
	/// the sender.
	Timeout,
	/// Settles an HTLC by revealing its payment pre-image, moving the
	/// funds to the receiver.
	Settle,
}

/// A commitment state update which adds, settles, or times out an HTLC.
/// Carries all metadata needed to reconstruct the HTLC's output and to pair
/// a settle or timeout entry with the addition it closes.
#[derive(Clone, Debug)]
pub struct PaymentDescriptor {
	/// The payment hash. The HTLC can be settled iff the pre-image to this
	/// hash is presented.
	pub payment_hash: [u8; 32],
	/// Absolute block height after which the HTLC expires.
	pub timeout: u32,
	/// The HTLC amount in asset units.
	pub amount: u64,
	/// The entry's index within the originating party's log.
	pub index: u32,
	/// For settle and timeout entries, the index of the add entry being
	/// closed within the opposite log.
	pub parent_index: u32,
	/// The exact type of this entry.
	pub entry_type: UpdateType,
	// The heights at which this update was first included on the remote and
	// local commitment chains. Zero means not yet included; once both chain
	// tails pass the relevant pair the update is fully locked in (adds) or
	// eligible for compaction (removals).
	pub(super) add_height_remote: u64,
	pub(super) add_height_local: u64,
	pub(super) remove_height_remote: u64,
	pub(super) remove_height_local: u64,
	pub(super) settled: bool,
	pub(super) is_forwarded: bool,
}

/// A commitment to a new state within an active channel. Each side can
/// independently extend the other side's chain with new commitments, up to
/// the revocation window.
struct Commitment {
	// The commitment height, or the update number of this commitment.
	height: u64,
	// Indexes into the HTLC logs up to which this commitment includes
	// updates. These let both sides concurrently create new commitments,
	// with each new commitment sent to the remote party naming which of
	// their updates it covers.
	our_msg_index: u32,
	their_msg_index: u32,
	// The commitment transaction itself. Absent only for the placeholder
	// commitment both chains are seeded with at channel creation.
	txn: Option<Transaction>,
	// The counterparty's signature for the transaction, when this
	// commitment extends our local chain.
	sig: Option<Vec<u8>>,
	// The settled balances at this point within the chain, computed by
	// evaluating all log entries before the two indexes above.
	our_balance: u64,
	their_balance: u64,
}

/// A chain of unrevoked commitments. The tail is the latest fully signed
/// yet unrevoked commitment (the current broadcastable state); the tip is
/// the most recently appended one. The tail is dropped once the chain owner
/// revokes it.
struct CommitmentChain {
	commitments: VecDeque<Commitment>,
}

impl CommitmentChain {
	fn new() -> CommitmentChain {
		CommitmentChain { commitments: VecDeque::new() }
	}

	// Extends the chain by a single commitment proposed by either party.
	fn add_commitment(&mut self, commitment: Commitment) {
		self.commitments.push_back(commitment);
	}

	// Reduces the length of the chain by one; called once a revocation for
	// the lowest unrevoked commitment is exchanged.
	fn advance_tail(&mut self) {
		self.commitments.pop_front();
	}

	fn tip(&self) -> Option<&Commitment> {
		self.commitments.back()
	}

	fn tail(&self) -> Option<&Commitment> {
		self.commitments.front()
	}
}

/// An active payment channel, implementing the asynchronous, batched and
/// pipelined commitment update protocol.
///
/// A channel owns its state outright; every public method takes `&mut
/// self`, so the instance must sit behind a write-exclusive lock when
/// shared. Independent channels may progress in parallel.
pub struct LightningChannel {
	signer: Arc<dyn Signer>,
	persister: Arc<dyn ChannelPersister>,
	encoder: Arc<dyn AssetEncoder>,
	secp_ctx: Secp256k1<secp256k1::All>,
	logger: Arc<dyn Logger>,

	status: ChannelStatus,

	our_log_counter: u32,
	their_log_counter: u32,

	// The height of our local commitment chain's tail; equals the number of
	// channel updates we have accepted.
	current_height: u64,

	// The edge of the revocation window we have extended to the remote
	// party. New revocations for prior states push this edge outwards,
	// letting the remote party initiate updates independently until the
	// window is exhausted.
	revocation_window_edge: u64,

	// Revocations given to us by the remote party which we have consumed by
	// signing new commitments. The front element names the keys/hashes we
	// next expect to be revoked.
	used_revocations: VecDeque<CommitRevocation>,

	// Unused revocations from the remote party. Each lets us create one new
	// commitment on their chain; without any we cannot propose updates.
	revocation_window: VecDeque<CommitRevocation>,

	// The remote node's commitment chain; commitments we initiate extend
	// it. And our own, extended by commitments we receive. The local tail
	// is the state we can safely broadcast.
	remote_commit_chain: CommitmentChain,
	local_commit_chain: CommitmentChain,

	channel_state: OpenChannelState,

	// The shared, mostly append-only HTLC update logs, keyed by each
	// entry's log index. Walked up to a commitment's message indexes when
	// reconstructing its transaction; compacted once updates are locked in
	// on both chains.
	our_update_log: BTreeMap<u32, PaymentDescriptor>,
	their_update_log: BTreeMap<u32, PaymentDescriptor>,

	funding_txin: TxIn,
	funding_p2wsh: Script,

	close_fee: u64,
}

impl LightningChannel {
	/// Creates a new active channel from a settled channel state, an
	/// implementation of the signer, the persistence layer, and the asset
	/// encoder shared with the counterparty.
	pub fn new(signer: Arc<dyn Signer>, persister: Arc<dyn ChannelPersister>,
			encoder: Arc<dyn AssetEncoder>, state: OpenChannelState, close_fee: u64,
			logger: Arc<dyn Logger>) -> LightningChannel {
		let mut local_chain = CommitmentChain::new();
		let mut remote_chain = CommitmentChain::new();

		// Seed both chains with the current un-revoked commitment for each
		// side.
		let seed = || Commitment {
			height: state.num_updates,
			our_msg_index: 0,
			their_msg_index: 0,
			txn: state.our_commit_tx.clone(),
			sig: None,
			our_balance: state.our_balance,
			their_balance: state.their_balance,
		};
		local_chain.add_commitment(seed());
		remote_chain.add_commitment(seed());

		let funding_p2wsh = chan_utils::witness_script_hash(&state.funding_redeem_script);
		let funding_txin = TxIn {
			previous_output: state.funding_outpoint,
			script_sig: Script::new(),
			sequence: Sequence::MAX,
			witness: Witness::default(),
		};

		LightningChannel {
			signer,
			persister,
			encoder,
			secp_ctx: Secp256k1::new(),
			logger,
			status: ChannelStatus::Open,
			our_log_counter: 0,
			their_log_counter: 0,
			current_height: state.num_updates,
			revocation_window_edge: state.num_updates,
			used_revocations: VecDeque::new(),
			revocation_window: VecDeque::new(),
			remote_commit_chain: remote_chain,
			local_commit_chain: local_chain,
			channel_state: state,
			our_update_log: BTreeMap::new(),
			their_update_log: BTreeMap::new(),
			funding_txin,
			funding_p2wsh,
			close_fee,
		}
	}

	fn is_closing(&self) -> bool {
		self.status == ChannelStatus::Closing || self.status == ChannelStatus::Closed
	}

	fn our_commit_pubkey(&self) -> PublicKey {
		PublicKey::from_secret_key(&self.secp_ctx, &self.channel_state.our_commit_key)
	}

	// The descriptor under which every spend of the funding output is
	// signed.
	fn funding_sign_desc(&self) -> SignDescriptor {
		SignDescriptor {
			pubkey: Some(self.channel_state.our_multisig_key),
			redeem_script: self.channel_state.funding_redeem_script.clone(),
			output: TxOut {
				value: self.channel_state.capacity,
				script_pubkey: self.funding_p2wsh.clone(),
			},
			hash_type: EcdsaSighashType::All,
			input_index: 0,
		}
	}

	// Evaluates all update entries in both HTLC logs below the passed
	// indexes, applying every settle and timeout before debiting newly
	// added HTLCs, and returns the indexes of the add entries that survive
	// into the commitment. Balances are adjusted in place, and each
	// entry's first-inclusion height for the chain being built is recorded.
	fn evaluate_htlc_view(&mut self, our_log_index: u32, their_log_index: u32,
			our_balance: &mut u64, their_balance: &mut u64, next_height: u64,
			remote_chain: bool) -> (Vec<u32>, Vec<u32>) {
		let mut skip_us: HashSet<u32> = HashSet::new();
		let mut skip_them: HashSet<u32> = HashSet::new();

		// First run through the non-add entries in both logs, populating
		// the skip sets and crediting balances to reflect each settle or
		// timeout encountered.
		let our_removals: Vec<u32> = self.our_update_log.range(..our_log_index)
			.filter(|&(_, entry)| entry.entry_type != UpdateType::Add)
			.map(|(index, _)| *index).collect();
		for index in our_removals {
			let entry = self.our_update_log.get_mut(&index)
				.expect("collected index vanished from our log");
			skip_them.insert(entry.parent_index);
			process_remove_entry(entry, our_balance, their_balance, next_height, remote_chain, true);
		}
		let their_removals: Vec<u32> = self.their_update_log.range(..their_log_index)
			.filter(|&(_, entry)| entry.entry_type != UpdateType::Add)
			.map(|(index, _)| *index).collect();
		for index in their_removals {
			let entry = self.their_update_log.get_mut(&index)
				.expect("collected index vanished from their log");
			skip_us.insert(entry.parent_index);
			process_remove_entry(entry, our_balance, their_balance, next_height, remote_chain, false);
		}

		// Second pass: skip settled HTLCs and debit the balances for any
		// adds that remain live.
		let our_adds: Vec<u32> = self.our_update_log.range(..our_log_index)
			.filter(|&(index, entry)| entry.entry_type == UpdateType::Add && !skip_us.contains(index))
			.map(|(index, _)| *index).collect();
		for index in our_adds.iter() {
			let entry = self.our_update_log.get_mut(index)
				.expect("collected index vanished from our log");
			process_add_entry(entry, our_balance, their_balance, next_height, remote_chain, false);
		}
		let their_adds: Vec<u32> = self.their_update_log.range(..their_log_index)
			.filter(|&(index, entry)| entry.entry_type == UpdateType::Add && !skip_them.contains(index))
			.map(|(index, _)| *index).collect();
		for index in their_adds.iter() {
			let entry = self.their_update_log.get_mut(index)
				.expect("collected index vanished from their log");
			process_add_entry(entry, our_balance, their_balance, next_height, remote_chain, true);
		}

		(our_adds, their_adds)
	}

	// Returns a populated commitment expressing the state of the channel
	// from the point of view of the local or remote chain, evaluating the
	// HTLC logs up to the passed indexes. Used to construct both chains'
	// transactions when signing or verifying new commitment updates.
	fn fetch_commitment_view(&mut self, remote_chain: bool, our_log_index: u32,
			their_log_index: u32, revocation_key: &PublicKey, revocation_hash: &[u8; 32])
			-> Result<Commitment, ChannelError> {
		let (mut our_balance, mut their_balance, next_height) = {
			let chain = if remote_chain { &self.remote_commit_chain } else { &self.local_commit_chain };
			match chain.tip() {
				Some(tip) => (tip.our_balance, tip.their_balance, tip.height + 1),
				None => (self.channel_state.our_balance, self.channel_state.their_balance,
					self.current_height + 1),
			}
		};

		// Run through all the HTLCs this transaction covers, updating
		// their commitment heights and adjusting the balances accordingly.
		let (our_htlcs, their_htlcs) = self.evaluate_htlc_view(our_log_index, their_log_index,
			&mut our_balance, &mut their_balance, next_height, remote_chain);

		let local_key = self.our_commit_pubkey();
		let remote_key = self.channel_state.their_commit_key;
		let (self_key, other_key, delay, delay_balance, p2wkh_balance) = if remote_chain {
			(remote_key, local_key, self.channel_state.remote_csv_delay, their_balance, our_balance)
		} else {
			(local_key, remote_key, self.channel_state.local_csv_delay, our_balance, their_balance)
		};

		let our_commit_tx = !remote_chain;
		let mut commit_tx = create_commit_tx(self.funding_txin.clone(), &self_key, &other_key,
			revocation_key, delay, delay_balance, p2wkh_balance);

		let mut pending_total = 0u64;
		for index in our_htlcs.iter() {
			let entry = self.our_update_log.get(index)
				.expect("filtered index vanished from our log");
			pending_total += entry.amount;
			add_htlc_output(&mut commit_tx, our_commit_tx, entry, revocation_hash, delay,
				false, &local_key, &remote_key);
		}
		for index in their_htlcs.iter() {
			let entry = self.their_update_log.get(index)
				.expect("filtered index vanished from their log");
			pending_total += entry.amount;
			add_htlc_output(&mut commit_tx, our_commit_tx, entry, revocation_hash, delay,
				true, &local_key, &remote_key);
		}

		debug_assert_eq!(our_balance + their_balance + pending_total, self.channel_state.capacity);

		// Sort into the agreed-upon canonical ordering, letting both sides
		// exchange only signatures rather than full transactions, then
		// hand the result to the asset encoder.
		transaction_utils::sort_transaction(&mut commit_tx);
		let commit_tx = self.encoder.encode_outputs(commit_tx, false)
			.map_err(|err| ChannelError::ScriptExecutionFailed(format!("asset encoding failed: {}", err)))?;

		Ok(Commitment {
			txn: Some(commit_tx),
			height: next_height,
			our_msg_index: our_log_index,
			their_msg_index: their_log_index,
			sig: None,
			our_balance,
			their_balance,
		})
	}

	/// Signs a new commitment over the remote chain, covering all updates
	/// to the HTLC log prior to this call, and consumes one revocation
	/// from the window. Returns the raw signature along with the
	/// counterparty log index the new commitment covers, for inclusion in
	/// the commitment message sent to the remote party.
	pub fn sign_next_commitment(&mut self) -> Result<(Vec<u8>, u32), ChannelError> {
		// We need an unused revocation from the remote party, and room for
		// the commitment it will eventually revoke.
		if self.used_revocations.len() == INITIAL_REVOCATION_WINDOW {
			return Err(ChannelError::NoRevocationWindow);
		}
		let next_revocation = match self.revocation_window.front() {
			Some(revocation) => revocation.clone(),
			None => return Err(ChannelError::NoRevocationWindow),
		};

		let new_commit_view = self.fetch_commitment_view(true, self.our_log_counter,
			self.their_log_counter, &next_revocation.next_revocation_key,
			&next_revocation.next_revocation_hash)?;

		log_trace!(self, "ChannelPoint({}): extending remote chain to height {}, our_balance={}, their_balance={}",
			self.channel_state.funding_outpoint, new_commit_view.height,
			new_commit_view.our_balance, new_commit_view.their_balance);

		let sig = {
			let commit_tx = new_commit_view.txn.as_ref()
				.expect("freshly built commitment view carries a transaction");
			let mut sighashes = SighashCache::new(commit_tx);
			let sign_desc = self.funding_sign_desc();
			self.signer.sign_output_raw(commit_tx, &sign_desc, &mut sighashes)
				.map_err(|_| ChannelError::SigningFailed)?
		};

		// Extend the remote chain and move the consumed revocation to the
		// used set only now that the procedure can no longer fail.
		self.remote_commit_chain.add_commitment(new_commit_view);
		self.used_revocations.push_back(next_revocation);
		self.revocation_window.pop_front();

		Ok((sig, self.their_log_counter))
	}

	/// Processes a signature for a new commitment extending our local
	/// chain, sent by the remote party. On success the commitment is
	/// appended to the local chain; a revocation for the prior state
	/// should then be generated and sent without delay.
	pub fn receive_new_commitment(&mut self, their_sig: &[u8], our_log_index: u32)
			-> Result<(), ChannelError> {
		// Fetch the revocation pair for the commitment extending our chain
		// by one.
		let next_height = self.current_height + 1;
		let revocation = self.channel_state.local_elkrem.at_index(next_height)
			.map_err(|_| ChannelError::ElkremMismatch)?;
		let revocation_key = chan_utils::derive_revocation_pubkey(&self.secp_ctx,
			&self.channel_state.their_commit_key, &revocation)
			.map_err(|_| ChannelError::KeyMismatch)?;
		let revocation_hash = sha256::Hash::hash(&revocation[..]).into_inner();

		// TODO: fetch_commitment_view has already recorded inclusion
		// heights by the time signature verification can fail below; roll
		// those back on the error path instead of relying on the caller to
		// tear the channel down.
		let local_commitment_view = self.fetch_commitment_view(false, our_log_index,
			self.their_log_counter, &revocation_key, &revocation_hash)?;

		log_trace!(self, "ChannelPoint({}): extending local chain to height {}, our_balance={}, their_balance={}",
			self.channel_state.funding_outpoint, local_commitment_view.height,
			local_commitment_view.our_balance, local_commitment_view.their_balance);

		{
			let commit_tx = local_commitment_view.txn.as_ref()
				.expect("freshly built commitment view carries a transaction");
			let mut sighashes = SighashCache::new(commit_tx);
			let sighash = sighashes.segwit_signature_hash(0,
					&self.channel_state.funding_redeem_script, self.channel_state.capacity,
					EcdsaSighashType::All)
				.map_err(|_| ChannelError::SignatureInvalid)?;
			let msg = Message::from_slice(&sighash[..])
				.map_err(|_| ChannelError::SignatureInvalid)?;
			let sig = Signature::from_der(their_sig)
				.map_err(|_| ChannelError::SignatureInvalid)?;
			if self.secp_ctx.verify_ecdsa(&msg, &sig, &self.channel_state.their_multisig_key).is_err() {
				return Err(ChannelError::SignatureInvalid);
			}
		}

		let mut accepted = local_commitment_view;
		accepted.sig = Some(their_sig.to_vec());
		self.local_commit_chain.add_commitment(accepted);

		Ok(())
	}

	/// Returns whether the two chain tips have diverged, meaning one side
	/// holds updates the other has yet to commit to.
	pub fn pending_updates(&self) -> bool {
		let local_index = self.local_commit_chain.tip().map(|tip| tip.our_msg_index);
		let remote_index = self.remote_commit_chain.tip().map(|tip| tip.our_msg_index);
		local_index != remote_index
	}

	/// Revokes the lowest unrevoked commitment in our local chain,
	/// advancing our tail by one and extending the edge of our revocation
	/// window. The updated channel snapshot is persisted before the
	/// revocation message is returned.
	pub fn revoke_current_commitment(&mut self) -> Result<CommitRevocation, ChannelError> {
		let their_commit_key = self.channel_state.their_commit_key;

		let revocation = self.channel_state.local_elkrem.at_index(self.current_height)
			.map_err(|_| ChannelError::ElkremMismatch)?;

		// Along with the revocation we hand over an additional extension
		// of our revocation window.
		self.revocation_window_edge += 1;
		let revocation_edge = self.channel_state.local_elkrem.at_index(self.revocation_window_edge)
			.map_err(|_| ChannelError::ElkremMismatch)?;
		let next_revocation_key = chan_utils::derive_revocation_pubkey(&self.secp_ctx,
			&their_commit_key, &revocation_edge)
			.map_err(|_| ChannelError::KeyMismatch)?;
		let next_revocation_hash = sha256::Hash::hash(&revocation_edge[..]).into_inner();

		log_trace!(self, "ChannelPoint({}): revoking height={}, now at height={}, window_edge={}",
			self.channel_state.funding_outpoint,
			self.local_commit_chain.tail().map(|tail| tail.height).unwrap_or(0),
			self.current_height + 1, self.revocation_window_edge);

		// Advance our tail, as we've revoked our previous state.
		self.local_commit_chain.advance_tail();
		self.current_height += 1;

		{
			let tail = self.local_commit_chain.tail()
				.expect("local chain retains its tip after a tail advance");
			self.channel_state.our_commit_tx = tail.txn.clone();
			self.channel_state.our_balance = tail.our_balance;
			self.channel_state.their_balance = tail.their_balance;
			self.channel_state.our_commit_sig = tail.sig.clone().unwrap_or_default();
			self.channel_state.num_updates += 1;

			log_trace!(self, "ChannelPoint({}): state transition accepted: our_balance={}, their_balance={}",
				self.channel_state.funding_outpoint, tail.our_balance, tail.their_balance);
		}

		self.persister.full_sync(&self.channel_state)
			.map_err(ChannelError::PersistenceFailed)?;

		Ok(CommitRevocation {
			channel_point: self.channel_state.funding_outpoint,
			revocation,
			next_revocation_key,
			next_revocation_hash,
		})
	}

	/// Processes a revocation sent by the remote party for the lowest
	/// unrevoked commitment in their chain.
	///
	/// An all-zero pre-image is a pure window extension and is simply
	/// appended to the revocation window. Otherwise the pre-image is
	/// validated against the stored revocation key and hash and fed to the
	/// elkrem receiver, the remote chain tail advances, and the HTLC logs
	/// are compacted. Returns the HTLCs which have become locked in on
	/// both chains and can now be forwarded upstream.
	pub fn receive_revocation(&mut self, rev_msg: &CommitRevocation)
			-> Result<Vec<PaymentDescriptor>, ChannelError> {
		if rev_msg.revocation == [0; 32] {
			self.revocation_window.push_back(rev_msg.clone());
			return Ok(Vec::new());
		}

		// All validation happens before any state is touched, so a bogus
		// revocation leaves the channel exactly as it was.
		let next_revocation = match self.used_revocations.front() {
			Some(revocation) => revocation.clone(),
			None => return Err(ChannelError::KeyMismatch),
		};

		let revocation_priv = chan_utils::derive_revocation_privkey(&self.secp_ctx,
			&self.channel_state.our_commit_key, &rev_msg.revocation)
			.map_err(|_| ChannelError::KeyMismatch)?;
		let revocation_pub = PublicKey::from_secret_key(&self.secp_ctx, &revocation_priv);
		match self.channel_state.their_current_revocation {
			Some(current_key) if current_key == revocation_pub => {},
			_ => return Err(ChannelError::KeyMismatch),
		}

		// We also need to have been handed the proper pre-image to the
		// revocation hash committed to by any current HTLC scripts.
		if self.channel_state.their_current_revocation_hash != [0; 32] {
			let revoke_hash = sha256::Hash::hash(&rev_msg.revocation[..]).into_inner();
			if self.channel_state.their_current_revocation_hash != revoke_hash {
				return Err(ChannelError::HashMismatch);
			}
		}

		self.channel_state.remote_elkrem.add_next(&rev_msg.revocation)
			.map_err(|_| ChannelError::ElkremMismatch)?;

		// Rotate the current revocation key/hash to the pair consumed by
		// the next outstanding commitment, and fold the freshly extended
		// window entry in.
		self.channel_state.their_current_revocation = Some(next_revocation.next_revocation_key);
		self.channel_state.their_current_revocation_hash = next_revocation.next_revocation_hash;
		self.used_revocations.pop_front();
		self.revocation_window.push_back(rev_msg.clone());

		log_trace!(self, "ChannelPoint({}): remote party accepted state transition, revoked height {}",
			self.channel_state.funding_outpoint,
			self.remote_commit_chain.tail().map(|tail| tail.height).unwrap_or(0));

		// The elkrem receiver has advanced, sync before the new state is
		// acted upon.
		self.persister.sync_revocation(&self.channel_state)
			.map_err(ChannelError::PersistenceFailed)?;

		// They revoked the lowest height in their chain, so it advances by
		// a single commitment.
		self.remote_commit_chain.advance_tail();

		let remote_chain_tail = self.remote_commit_chain.tail()
			.expect("remote chain retains its tip after a tail advance").height;
		let local_chain_tail = self.local_commit_chain.tail()
			.expect("local chain is never empty").height;

		// Emit the counterparty log entries which are now locked in on
		// both chains and not yet handed to the router.
		let mut htlcs_to_forward = Vec::new();
		for (_, htlc) in self.their_update_log.iter_mut() {
			if htlc.is_forwarded {
				continue;
			}

			if htlc.entry_type == UpdateType::Add {
				if htlc.add_height_remote == 0 || htlc.add_height_local == 0 {
					continue;
				}
				if remote_chain_tail >= htlc.add_height_remote
						&& local_chain_tail >= htlc.add_height_local {
					htlc.is_forwarded = true;
					htlcs_to_forward.push(htlc.clone());
				}
			} else {
				if htlc.remove_height_remote == 0 || htlc.remove_height_local == 0 {
					continue;
				}
				if remote_chain_tail >= htlc.remove_height_remote
						&& local_chain_tail >= htlc.remove_height_local {
					htlc.is_forwarded = true;
					htlcs_to_forward.push(htlc.clone());
				}
			}
		}

		self.compact_logs(local_chain_tail, remote_chain_tail);

		Ok(htlcs_to_forward)
	}

	// Garbage-collects HTLCs which have been removed from the point of
	// view of both chain tails: each qualifying settle/timeout entry is
	// evicted together with the add entry it closed.
	fn compact_logs(&mut self, local_chain_tail: u64, remote_chain_tail: u64) {
		fn compact(log_a: &mut BTreeMap<u32, PaymentDescriptor>,
				log_b: &mut BTreeMap<u32, PaymentDescriptor>,
				local_chain_tail: u64, remote_chain_tail: u64) {
			let removable: Vec<(u32, u32)> = log_a.iter()
				.filter(|&(_, htlc)| {
					htlc.entry_type != UpdateType::Add
						&& htlc.remove_height_remote != 0 && htlc.remove_height_local != 0
						&& remote_chain_tail >= htlc.remove_height_remote
						&& local_chain_tail >= htlc.remove_height_local
				})
				.map(|(index, htlc)| (*index, htlc.parent_index))
				.collect();
			for (index, parent_index) in removable {
				log_b.remove(&parent_index);
				log_a.remove(&index);
			}
		}
		compact(&mut self.our_update_log, &mut self.their_update_log, local_chain_tail, remote_chain_tail);
		compact(&mut self.their_update_log, &mut self.our_update_log, local_chain_tail, remote_chain_tail);
	}

	/// Extends the revocation window gifted to the remote party by a
	/// single revocation, increasing the number of commitment updates they
	/// can initiate without our cooperation. The returned message carries
	/// an all-zero pre-image; nothing is revoked.
	pub fn extend_revocation_window(&mut self) -> Result<CommitRevocation, ChannelError> {
		let next_height = self.revocation_window_edge + 1;
		let revocation = self.channel_state.local_elkrem.at_index(next_height)
			.map_err(|_| ChannelError::ElkremMismatch)?;

		let next_revocation_key = chan_utils::derive_revocation_pubkey(&self.secp_ctx,
			&self.channel_state.their_commit_key, &revocation)
			.map_err(|_| ChannelError::KeyMismatch)?;
		let next_revocation_hash = sha256::Hash::hash(&revocation[..]).into_inner();

		self.revocation_window_edge += 1;

		Ok(CommitRevocation {
			channel_point: self.channel_state.funding_outpoint,
			revocation: [0; 32],
			next_revocation_key,
			next_revocation_hash,
		})
	}

	/// Appends an outgoing HTLC to our update log, returning its index for
	/// use in the outgoing wire message.
	pub fn add_htlc(&mut self, htlc: &HTLCAddRequest) -> Result<u32, ChannelError> {
		if self.is_closing() {
			return Err(ChannelError::ChannelClosing);
		}
		let index = self.our_log_counter;
		self.our_update_log.insert(index, PaymentDescriptor {
			entry_type: UpdateType::Add,
			payment_hash: htlc.redemption_hash,
			timeout: htlc.expiry,
			amount: htlc.amount,
			index,
			parent_index: 0,
			add_height_remote: 0,
			add_height_local: 0,
			remove_height_remote: 0,
			remove_height_local: 0,
			settled: false,
			is_forwarded: false,
		});
		self.our_log_counter += 1;
		Ok(index)
	}

	/// Appends an HTLC received from the remote party to their update log,
	/// returning its index within that log.
	pub fn receive_htlc(&mut self, htlc: &HTLCAddRequest) -> Result<u32, ChannelError> {
		if self.is_closing() {
			return Err(ChannelError::ChannelClosing);
		}
		let index = self.their_log_counter;
		self.their_update_log.insert(index, PaymentDescriptor {
			entry_type: UpdateType::Add,
			payment_hash: htlc.redemption_hash,
			timeout: htlc.expiry,
			amount: htlc.amount,
			index,
			parent_index: 0,
			add_height_remote: 0,
			add_height_local: 0,
			remove_height_remote: 0,
			remove_height_local: 0,
			settled: false,
			is_forwarded: false,
		});
		self.their_log_counter += 1;
		Ok(index)
	}

	/// Settles the first un-settled incoming HTLC whose payment hash
	/// matches the passed pre-image, appending the settle entry to our
	/// log. The index of the HTLC settled within the remote log is
	/// returned to ease constructing the corresponding wire message.
	pub fn settle_htlc(&mut self, preimage: [u8; 32]) -> Result<u32, ChannelError> {
		if self.is_closing() {
			return Err(ChannelError::ChannelClosing);
		}
		let payment_hash = sha256::Hash::hash(&preimage[..]).into_inner();

		let mut target = None;
		for (index, htlc) in self.their_update_log.iter_mut() {
			if htlc.entry_type != UpdateType::Add {
				continue;
			}
			if !htlc.settled && htlc.payment_hash == payment_hash {
				htlc.settled = true;
				target = Some((*index, htlc.amount));
				break;
			}
		}
		let (parent_index, amount) = match target {
			Some(found) => found,
			None => return Err(ChannelError::UnknownPaymentHash),
		};

		let index = self.our_log_counter;
		self.our_update_log.insert(index, PaymentDescriptor {
			entry_type: UpdateType::Settle,
			payment_hash: [0; 32],
			timeout: 0,
			amount,
			index,
			parent_index,
			add_height_remote: 0,
			add_height_local: 0,
			remove_height_remote: 0,
			remove_height_local: 0,
			settled: false,
			is_forwarded: false,
		});
		self.our_log_counter += 1;

		Ok(parent_index)
	}

	/// Processes the remote party settling one of our outgoing HTLCs,
	/// identified by its index within our log.
	pub fn receive_htlc_settle(&mut self, preimage: [u8; 32], log_index: u32)
			-> Result<(), ChannelError> {
		if self.is_closing() {
			return Err(ChannelError::ChannelClosing);
		}
		let payment_hash = sha256::Hash::hash(&preimage[..]).into_inner();

		let (parent_index, amount) = match self.our_update_log.get(&log_index) {
			Some(htlc) => {
				if htlc.payment_hash != payment_hash {
					return Err(ChannelError::InvalidPreimage);
				}
				(htlc.index, htlc.amount)
			},
			None => return Err(ChannelError::UnknownLogEntry),
		};

		let index = self.their_log_counter;
		self.their_update_log.insert(index, PaymentDescriptor {
			entry_type: UpdateType::Settle,
			payment_hash: [0; 32],
			timeout: 0,
			amount,
			index,
			parent_index,
			add_height_remote: 0,
			add_height_local: 0,
			remove_height_remote: 0,
			remove_height_local: 0,
			settled: false,
			is_forwarded: false,
		});
		self.their_log_counter += 1;

		Ok(())
	}

	/// Initiates a cooperative closure of the channel. To be called only
	/// once all pending HTLCs have been settled or removed. The channel
	/// shifts into the closing state, rejecting further HTLC traffic, and
	/// our half of the closure signature is returned along with the txid
	/// the initiator should watch the chain for.
	pub fn init_cooperative_close(&mut self) -> Result<(Vec<u8>, Txid), ChannelError> {
		if self.is_closing() {
			return Err(ChannelError::ChannelClosing);
		}
		self.status = ChannelStatus::Closing;

		let close_tx = create_cooperative_close_tx(self.funding_txin.clone(),
			self.channel_state.our_balance, self.channel_state.their_balance,
			&self.channel_state.our_delivery_script, &self.channel_state.their_delivery_script,
			true, self.close_fee);
		let close_tx = self.encoder.encode_outputs(close_tx, false)
			.map_err(|err| ChannelError::ScriptExecutionFailed(format!("asset encoding failed: {}", err)))?;
		let txid = close_tx.txid();

		let sig = {
			let mut sighashes = SighashCache::new(&close_tx);
			let sign_desc = self.funding_sign_desc();
			self.signer.sign_output_raw(&close_tx, &sign_desc, &mut sighashes)
				.map_err(|_| ChannelError::SigningFailed)?
		};

		Ok((sig, txid))
	}

	/// Completes a cooperative closure initiated by the remote party.
	/// Builds the identical closure transaction, contributes our half of
	/// the 2-of-2 witness, and validates the result under standard script
	/// flags. The returned transaction is fully signed and ready for
	/// broadcast by the caller.
	pub fn complete_cooperative_close(&mut self, remote_sig: &[u8])
			-> Result<Transaction, ChannelError> {
		if self.is_closing() {
			return Err(ChannelError::ChannelClosing);
		}
		self.status = ChannelStatus::Closed;

		let close_tx = create_cooperative_close_tx(self.funding_txin.clone(),
			self.channel_state.our_balance, self.channel_state.their_balance,
			&self.channel_state.our_delivery_script, &self.channel_state.their_delivery_script,
			false, self.close_fee);
		let mut close_tx = self.encoder.encode_outputs(close_tx, false)
			.map_err(|err| ChannelError::ScriptExecutionFailed(format!("asset encoding failed: {}", err)))?;

		let our_sig = {
			let mut sighashes = SighashCache::new(&close_tx);
			let sign_desc = self.funding_sign_desc();
			self.signer.sign_output_raw(&close_tx, &sign_desc, &mut sighashes)
				.map_err(|_| ChannelError::SigningFailed)?
		};

		// Assemble the witness minding the order of the keys within the
		// redeem script, then make sure the result actually spends the
		// funding output before handing it back for broadcast.
		let witness = chan_utils::spend_multisig(&self.channel_state.funding_redeem_script,
			&self.channel_state.our_multisig_key, &our_sig,
			&self.channel_state.their_multisig_key, remote_sig);
		close_tx.input[0].witness = Witness::from_vec(witness);

		let spending = encode::serialize(&close_tx);
		self.funding_p2wsh.verify(0, Amount::from_sat(self.channel_state.capacity), &spending)
			.map_err(|err| ChannelError::ScriptExecutionFailed(err.to_string()))?;

		Ok(close_tx)
	}

	/// The outpoint of the funding output backing this channel, used
	/// throughout the system to uniquely identify it.
	pub fn channel_point(&self) -> OutPoint {
		self.channel_state.funding_outpoint
	}

	/// The channel's current lifecycle state.
	pub fn status(&self) -> ChannelStatus {
		self.status
	}

	/// Returns a snapshot of the channel's current settled state.
	pub fn state_snapshot(&self) -> ChannelSnapshot {
		self.channel_state.snapshot()
	}

	/// Deletes all persisted state concerning the channel, leaving only a
	/// small closing summary behind.
	pub fn delete_state(&mut self) -> Result<(), ChannelError> {
		self.persister.close_channel(&self.channel_state.funding_outpoint)
			.map_err(ChannelError::PersistenceFailed)
	}
}

// Evaluates the effect of an add entry: if the HTLC has not yet been
// committed on the chain being built, the sender's balance is debited and
// the inclusion height recorded. Later re-builds at higher heights leave
// the original height in place.
fn process_add_entry(htlc: &mut PaymentDescriptor, our_balance: &mut u64, their_balance: &mut u64,
		next_height: u64, remote_chain: bool, is_incoming: bool) {
	{
		let add_height = if remote_chain { &mut htlc.add_height_remote } else { &mut htlc.add_height_local };
		if *add_height != 0 {
			return;
		}
		*add_height = next_height;
	}

	if is_incoming {
		*their_balance -= htlc.amount;
	} else {
		*our_balance -= htlc.amount;
	}
}

// Evaluates a settle or timeout entry: a settle credits the receiving side
// with the HTLC amount, a timeout returns it to the sender. Entries already
// processed on the chain being built are ignored.
fn process_remove_entry(htlc: &mut PaymentDescriptor, our_balance: &mut u64, their_balance: &mut u64,
		next_height: u64, remote_chain: bool, is_incoming: bool) {
	{
		let remove_height = if remote_chain { &mut htlc.remove_height_remote } else { &mut htlc.remove_height_local };
		if *remove_height != 0 {
			return;
		}
		*remove_height = next_height;
	}

	match (is_incoming, htlc.entry_type) {
		// An incoming HTLC settled means we learned the pre-image, so our
		// balance grows. Timed out, the value returns to the remote party.
		(true, UpdateType::Settle) => *our_balance += htlc.amount,
		(true, UpdateType::Timeout) => *their_balance += htlc.amount,
		// Mirror image for our outgoing HTLCs.
		(false, UpdateType::Settle) => *their_balance += htlc.amount,
		(false, UpdateType::Timeout) => *our_balance += htlc.amount,
		(_, UpdateType::Add) => debug_assert!(false, "add entry in removal pass"),
	}
}

// Appends an HTLC output to the passed commitment transaction. One of four
// script forms is chosen from the two-bit key of whether the HTLC is
// incoming and whether the transaction is our own commitment.
fn add_htlc_output(commit_tx: &mut Transaction, our_commit: bool, htlc: &PaymentDescriptor,
		revocation_hash: &[u8; 32], delay: u32, is_incoming: bool,
		local_key: &PublicKey, remote_key: &PublicKey) {
	let redeem_script = match (is_incoming, our_commit) {
		// Paying to us on our own commitment: the receiver's script form.
		(true, true) => chan_utils::receiver_htlc_script(htlc.timeout, delay, remote_key,
			local_key, revocation_hash, &htlc.payment_hash),
		// Paying to us on their commitment: their outgoing HTLC, the
		// sender's script form.
		(true, false) => chan_utils::sender_htlc_script(htlc.timeout, delay, remote_key,
			local_key, revocation_hash, &htlc.payment_hash),
		// We pay, on our commitment.
		(false, true) => chan_utils::sender_htlc_script(htlc.timeout, delay, local_key,
			remote_key, revocation_hash, &htlc.payment_hash),
		// We pay, on their commitment.
		(false, false) => chan_utils::receiver_htlc_script(htlc.timeout, delay, local_key,
			remote_key, revocation_hash, &htlc.payment_hash),
	};

	commit_tx.output.push(TxOut {
		value: htlc.amount,
		script_pubkey: chan_utils::witness_script_hash(&redeem_script),
	});
}

/// Creates a commitment transaction spending the funding output. Two
/// outputs are produced: one to the transaction's owner, spendable after a
/// relative delay or immediately with the revocation key, and an
/// unencumbered one to the counterparty. Zero-value outputs are omitted,
/// and HTLC outputs are appended by the caller.
pub(crate) fn create_commit_tx(funding_txin: TxIn, self_key: &PublicKey, their_key: &PublicKey,
		revoke_key: &PublicKey, csv_timeout: u32, amount_to_self: u64,
		amount_to_them: u64) -> Transaction {
	let to_self_script = chan_utils::commit_script_to_self(csv_timeout, self_key, revoke_key);
	let pay_to_us = chan_utils::witness_script_hash(&to_self_script);
	let pay_to_them = chan_utils::commit_script_unencumbered(their_key);

	let mut output = Vec::with_capacity(2);
	if amount_to_self != 0 {
		output.push(TxOut { value: amount_to_self, script_pubkey: pay_to_us });
	}
	if amount_to_them != 0 {
		output.push(TxOut { value: amount_to_them, script_pubkey: pay_to_them });
	}

	// Version 2, as OP_CSV fails for anything below.
	Transaction {
		version: 2,
		lock_time: PackedLockTime::ZERO,
		input: vec![funding_txin],
		output,
	}
}

/// Creates the transaction cooperatively closing an active channel,
/// returning each side's settled balance to its delivery script. The
/// initiator of the closure pays the fee in entirety; a refund output for
/// a side with no settled funds is omitted.
pub(crate) fn create_cooperative_close_tx(funding_txin: TxIn, mut our_balance: u64,
		mut their_balance: u64, our_delivery_script: &Script, their_delivery_script: &Script,
		initiator: bool, fee: u64) -> Transaction {
	if initiator {
		our_balance = our_balance.saturating_sub(fee);
	} else {
		their_balance = their_balance.saturating_sub(fee);
	}

	let mut close_tx = Transaction {
		version: 2,
		lock_time: PackedLockTime::ZERO,
		input: vec![funding_txin],
		output: Vec::with_capacity(2),
	};
	if our_balance != 0 {
		close_tx.output.push(TxOut { value: our_balance, script_pubkey: our_delivery_script.clone() });
	}
	if their_balance != 0 {
		close_tx.output.push(TxOut { value: their_balance, script_pubkey: their_delivery_script.clone() });
	}

	transaction_utils::sort_transaction(&mut close_tx);
	close_tx
}

#[cfg(test)]
mod tests {
	use super::*;

	use bitcoin::hashes::{sha256, Hash};
	use bitcoin::Txid;

	use secp256k1::{Secp256k1, SecretKey};

	use chain::assets::IdentityEncoder;
	use ln::elkrem::{ElkremReceiver, ElkremSender};
	use util::test_utils::{KeyStore, TestChannelPersister, TestLogger, TestSigner};

	use std::sync::{Arc, Mutex};

	const CAPACITY: u64 = 1_000_000;
	const CSV_DELAY: u32 = 144;

	struct TestParty {
		channel: LightningChannel,
		persister: Arc<TestChannelPersister>,
	}

	fn keypair(secp_ctx: &Secp256k1<secp256k1::All>, fill: u8) -> (SecretKey, PublicKey) {
		let secret = SecretKey::from_slice(&[fill; 32]).unwrap();
		(secret, PublicKey::from_secret_key(secp_ctx, &secret))
	}

	// Builds a pair of channels wired back-to-back over a fabricated
	// funding output, with both revocation windows fully primed.
	fn create_test_channels() -> (TestParty, TestParty) {
		let secp_ctx = Secp256k1::new();
		let logger: Arc<dyn Logger> = Arc::new(TestLogger::new());

		let (alice_commit_secret, alice_commit_pub) = keypair(&secp_ctx, 0x11);
		let (bob_commit_secret, bob_commit_pub) = keypair(&secp_ctx, 0x12);
		let (alice_ms_secret, alice_ms_pub) = keypair(&secp_ctx, 0x13);
		let (bob_ms_secret, bob_ms_pub) = keypair(&secp_ctx, 0x14);
		let (_, alice_delivery_pub) = keypair(&secp_ctx, 0x15);
		let (_, bob_delivery_pub) = keypair(&secp_ctx, 0x16);

		let (redeem_script, _) = chan_utils::gen_funding_pk_script(&alice_ms_pub, &bob_ms_pub, CAPACITY);
		let funding_outpoint = OutPoint::new(Txid::from_inner([0xfe; 32]), 0);

		let alice_elkrem = ElkremSender::new([0x21; 32]);
		let bob_elkrem = ElkremSender::new([0x22; 32]);

		// Each side's revocation key for height zero is anchored to the
		// *other* side's commitment key and its own first pre-image.
		let alice_rev_for_bob = chan_utils::derive_revocation_pubkey(&secp_ctx, &alice_commit_pub,
			&bob_elkrem.at_index(0).unwrap()).unwrap();
		let bob_rev_for_alice = chan_utils::derive_revocation_pubkey(&secp_ctx, &bob_commit_pub,
			&alice_elkrem.at_index(0).unwrap()).unwrap();

		let make_state = |commit_key: &SecretKey, their_commit: &PublicKey, ms: &PublicKey,
				their_ms: &PublicKey, delivery: &PublicKey, their_delivery: &PublicKey,
				elkrem: &ElkremSender, their_revocation: PublicKey| OpenChannelState {
			their_node_id: [0xbb; 32],
			funding_outpoint,
			funding_redeem_script: redeem_script.clone(),
			capacity: CAPACITY,
			our_balance: CAPACITY / 2,
			their_balance: CAPACITY / 2,
			our_multisig_key: *ms,
			their_multisig_key: *their_ms,
			our_commit_key: *commit_key,
			their_commit_key: *their_commit,
			local_csv_delay: CSV_DELAY,
			remote_csv_delay: CSV_DELAY,
			our_delivery_script: chan_utils::commit_script_unencumbered(delivery),
			their_delivery_script: chan_utils::commit_script_unencumbered(their_delivery),
			our_commit_tx: None,
			our_commit_sig: Vec::new(),
			local_elkrem: elkrem.clone(),
			remote_elkrem: ElkremReceiver::new(),
			their_current_revocation: Some(their_revocation),
			their_current_revocation_hash: [0; 32],
			num_updates: 0,
			num_confs_required: 1,
		};

		let alice_state = make_state(&alice_commit_secret, &bob_commit_pub, &alice_ms_pub,
			&bob_ms_pub, &alice_delivery_pub, &bob_delivery_pub, &alice_elkrem, alice_rev_for_bob);
		let bob_state = make_state(&bob_commit_secret, &alice_commit_pub, &bob_ms_pub,
			&alice_ms_pub, &bob_delivery_pub, &alice_delivery_pub, &bob_elkrem, bob_rev_for_alice);

		let party = |ms_secret: SecretKey, commit_secret: SecretKey, state: OpenChannelState| {
			let mut keys = KeyStore::new([0; 32]);
			keys.register(&secp_ctx, ms_secret);
			keys.register(&secp_ctx, commit_secret);
			let signer = Arc::new(TestSigner::new(Arc::new(Mutex::new(keys))));
			let persister = Arc::new(TestChannelPersister::new());
			let channel = LightningChannel::new(signer, persister.clone(),
				Arc::new(IdentityEncoder), state, 0, logger.clone());
			TestParty { channel, persister }
		};

		let mut alice = party(alice_ms_secret, alice_commit_secret, alice_state);
		let mut bob = party(bob_ms_secret, bob_commit_secret, bob_state);

		// Populate both revocation windows before the session starts.
		for _ in 0..INITIAL_REVOCATION_WINDOW {
			let from_alice = alice.channel.extend_revocation_window().unwrap();
			let from_bob = bob.channel.extend_revocation_window().unwrap();
			assert!(alice.channel.receive_revocation(&from_bob).unwrap().is_empty());
			assert!(bob.channel.receive_revocation(&from_alice).unwrap().is_empty());
		}
		assert_eq!(alice.channel.revocation_window.len(), INITIAL_REVOCATION_WINDOW);
		assert_eq!(bob.channel.revocation_window.len(), INITIAL_REVOCATION_WINDOW);

		(alice, bob)
	}

	fn assert_channel_sane(channel: &LightningChannel) {
		// Heights within each chain are contiguous and the chains stay
		// within the revocation window.
		for chain in &[&channel.local_commit_chain, &channel.remote_commit_chain] {
			let heights: Vec<u64> = chain.commitments.iter().map(|commitment| commitment.height).collect();
			for pair in heights.windows(2) {
				assert_eq!(pair[1], pair[0] + 1);
			}
			assert!(heights.len() <= INITIAL_REVOCATION_WINDOW + 1);
		}
		assert!(channel.used_revocations.len() + channel.revocation_window.len()
			<= INITIAL_REVOCATION_WINDOW);
	}

	// Drives one full state transition initiated by `from`, delivering the
	// new commitment to `to` and completing the revocation round trip.
	fn round_trip(from: &mut LightningChannel, to: &mut LightningChannel) -> Vec<PaymentDescriptor> {
		let (sig, log_index) = from.sign_next_commitment().unwrap();
		to.receive_new_commitment(&sig, log_index).unwrap();
		let revocation = to.revoke_current_commitment().unwrap();
		let forwarded = from.receive_revocation(&revocation).unwrap();
		assert_channel_sane(from);
		assert_channel_sane(to);
		forwarded
	}

	#[test]
	fn single_htlc_round_trip() {
		let (mut alice, mut bob) = create_test_channels();

		let preimage = [9; 32];
		let payment_hash = sha256::Hash::hash(&preimage[..]).into_inner();
		let add = HTLCAddRequest {
			redemption_hash: payment_hash,
			amount: 100_000,
			expiry: 600,
		};
		assert_eq!(alice.channel.add_htlc(&add).unwrap(), 0);
		assert_eq!(bob.channel.receive_htlc(&add).unwrap(), 0);

		// Alice extends Bob's chain with the HTLC and Bob revokes his
		// prior state.
		let forwarded = round_trip(&mut alice.channel, &mut bob.channel);
		assert!(forwarded.is_empty());

		{
			let tail = alice.channel.remote_commit_chain.tail().unwrap();
			assert_eq!(tail.height, 1);
			assert_eq!(tail.our_balance, 400_000);
			assert_eq!(tail.their_balance, 500_000);
			let tx = tail.txn.as_ref().unwrap();
			// Delayed, unencumbered, plus the pending HTLC output.
			assert_eq!(tx.output.len(), 3);
			assert!(tx.output.iter().any(|txout| txout.value == 100_000));
		}

		// Reciprocal direction: Bob commits, Alice revokes; Bob can now
		// forward the locked-in HTLC upstream.
		let forwarded = round_trip(&mut bob.channel, &mut alice.channel);
		assert_eq!(forwarded.len(), 1);
		assert_eq!(forwarded[0].payment_hash, payment_hash);
		assert_eq!(forwarded[0].amount, 100_000);

		{
			let tail = alice.channel.local_commit_chain.tail().unwrap();
			assert_eq!(tail.our_balance, 400_000);
			assert_eq!(tail.their_balance, 500_000);
		}
		assert_eq!(alice.channel.channel_state.num_updates, 1);
		assert_eq!(bob.channel.channel_state.num_updates, 1);
		assert!(alice.persister.full_syncs() > 0);
		assert!(bob.persister.revocation_syncs() > 0);
	}

	#[test]
	fn settle_compacts_the_logs() {
		let (mut alice, mut bob) = create_test_channels();

		let preimage = [9; 32];
		let payment_hash = sha256::Hash::hash(&preimage[..]).into_inner();
		let add = HTLCAddRequest {
			redemption_hash: payment_hash,
			amount: 100_000,
			expiry: 600,
		};
		alice.channel.add_htlc(&add).unwrap();
		bob.channel.receive_htlc(&add).unwrap();
		round_trip(&mut alice.channel, &mut bob.channel);
		round_trip(&mut bob.channel, &mut alice.channel);

		// Bob knows the pre-image and settles, then the settle is locked
		// in on both chains through a full round in each direction.
		let settle_index = bob.channel.settle_htlc(preimage).unwrap();
		assert_eq!(settle_index, 0);
		alice.channel.receive_htlc_settle(preimage, settle_index).unwrap();

		round_trip(&mut bob.channel, &mut alice.channel);
		round_trip(&mut alice.channel, &mut bob.channel);

		// Compaction runs on revocation receipt, so Bob observes both
		// tails past the settle only after one more empty exchange.
		assert_eq!(alice.channel.our_update_log.len(), 0);
		assert_eq!(alice.channel.their_update_log.len(), 0);
		round_trip(&mut bob.channel, &mut alice.channel);

		// Once settled on both chains the add and settle entries vanish.
		assert_eq!(alice.channel.our_update_log.len(), 0);
		assert_eq!(alice.channel.their_update_log.len(), 0);
		assert_eq!(bob.channel.our_update_log.len(), 0);
		assert_eq!(bob.channel.their_update_log.len(), 0);

		// From Bob's side the settled value has arrived.
		let bob_snapshot = bob.channel.state_snapshot();
		assert_eq!(bob_snapshot.our_balance, 600_000);
		assert_eq!(bob_snapshot.their_balance, 400_000);
		let alice_snapshot = alice.channel.state_snapshot();
		assert_eq!(alice_snapshot.our_balance, 400_000);
		assert_eq!(alice_snapshot.their_balance, 600_000);
	}

	#[test]
	fn settle_with_unknown_hash_fails() {
		let (_, mut bob) = create_test_channels();
		assert_eq!(bob.channel.settle_htlc([1; 32]), Err(ChannelError::UnknownPaymentHash));

		let preimage = [9; 32];
		let add = HTLCAddRequest {
			redemption_hash: sha256::Hash::hash(&preimage[..]).into_inner(),
			amount: 10,
			expiry: 10,
		};
		bob.channel.receive_htlc(&add).unwrap();
		assert_eq!(bob.channel.receive_htlc_settle(preimage, 7), Err(ChannelError::UnknownLogEntry));
	}

	#[test]
	fn bogus_revocation_leaves_state_untouched() {
		let (mut alice, mut bob) = create_test_channels();

		let add = HTLCAddRequest {
			redemption_hash: [5; 32],
			amount: 50_000,
			expiry: 500,
		};
		alice.channel.add_htlc(&add).unwrap();
		bob.channel.receive_htlc(&add).unwrap();

		let (sig, log_index) = alice.channel.sign_next_commitment().unwrap();
		bob.channel.receive_new_commitment(&sig, log_index).unwrap();
		let mut revocation = bob.channel.revoke_current_commitment().unwrap();

		// Replace the pre-image with a deeper one from Bob's own tree: the
		// derived key no longer matches the stored revocation key.
		revocation.revocation = bob.channel.channel_state.local_elkrem.at_index(2).unwrap();

		let used_before = alice.channel.used_revocations.len();
		let window_before = alice.channel.revocation_window.len();
		let tail_before = alice.channel.remote_commit_chain.tail().unwrap().height;
		let elkrem_before = alice.channel.channel_state.remote_elkrem.up_to();

		assert_eq!(alice.channel.receive_revocation(&revocation).unwrap_err(), ChannelError::KeyMismatch);

		assert_eq!(alice.channel.used_revocations.len(), used_before);
		assert_eq!(alice.channel.revocation_window.len(), window_before);
		assert_eq!(alice.channel.remote_commit_chain.tail().unwrap().height, tail_before);
		assert_eq!(alice.channel.channel_state.remote_elkrem.up_to(), elkrem_before);
	}

	#[test]
	fn window_exhaustion_blocks_signing() {
		let (mut alice, mut bob) = create_test_channels();

		for i in 0..INITIAL_REVOCATION_WINDOW {
			let add = HTLCAddRequest {
				redemption_hash: [i as u8; 32],
				amount: 1_000,
				expiry: 100 + i as u32,
			};
			alice.channel.add_htlc(&add).unwrap();
			bob.channel.receive_htlc(&add).unwrap();
			let (sig, log_index) = alice.channel.sign_next_commitment().unwrap();
			bob.channel.receive_new_commitment(&sig, log_index).unwrap();
		}

		assert_eq!(alice.channel.sign_next_commitment().map(|_| ()),
			Err(ChannelError::NoRevocationWindow));

		// Draining one revocation frees the window again.
		let revocation = bob.channel.revoke_current_commitment().unwrap();
		alice.channel.receive_revocation(&revocation).unwrap();
		assert!(alice.channel.sign_next_commitment().is_ok());
	}

	#[test]
	fn cooperative_close_round_trip() {
		let (mut alice, mut bob) = create_test_channels();

		let (alice_sig, close_txid) = alice.channel.init_cooperative_close().unwrap();
		let close_tx = bob.channel.complete_cooperative_close(&alice_sig).unwrap();

		// Both sides independently construct the identical transaction,
		// and the assembled witness passes standard script verification.
		assert_eq!(close_tx.txid(), close_txid);
		assert_eq!(close_tx.output.len(), 2);
		assert_eq!(close_tx.output.iter().map(|txout| txout.value).sum::<u64>(), CAPACITY);
		assert_eq!(alice.channel.status(), ChannelStatus::Closing);
		assert_eq!(bob.channel.status(), ChannelStatus::Closed);

		// Closing channels reject further operations.
		assert_eq!(alice.channel.init_cooperative_close().map(|_| ()), Err(ChannelError::ChannelClosing));
		let add = HTLCAddRequest { redemption_hash: [1; 32], amount: 1, expiry: 1 };
		assert_eq!(alice.channel.add_htlc(&add), Err(ChannelError::ChannelClosing));
		assert_eq!(bob.channel.receive_htlc(&add), Err(ChannelError::ChannelClosing));

		// With the channel closed, its persisted state can be torn down.
		bob.channel.delete_state().unwrap();
		assert_eq!(bob.persister.closes(), 1);
	}

	#[test]
	fn close_fee_comes_out_of_the_initiator() {
		let (alice, _) = create_test_channels();
		let state = &alice.channel.channel_state;

		let as_initiator = create_cooperative_close_tx(alice.channel.funding_txin.clone(),
			state.our_balance, state.their_balance, &state.our_delivery_script,
			&state.their_delivery_script, true, 5_000);
		let as_responder = create_cooperative_close_tx(alice.channel.funding_txin.clone(),
			state.their_balance, state.our_balance, &state.their_delivery_script,
			&state.our_delivery_script, false, 5_000);

		// Mirror-image construction yields the identical transaction, with
		// the initiator's output short the fee.
		assert_eq!(as_initiator, as_responder);
		let ours: u64 = as_initiator.output.iter()
			.filter(|txout| txout.script_pubkey == state.our_delivery_script)
			.map(|txout| txout.value).sum();
		assert_eq!(ours, state.our_balance - 5_000);
	}

	#[test]
	fn pending_updates_tracks_chain_divergence() {
		let (mut alice, mut bob) = create_test_channels();
		assert!(!alice.channel.pending_updates());

		let add = HTLCAddRequest { redemption_hash: [3; 32], amount: 1_000, expiry: 99 };
		alice.channel.add_htlc(&add).unwrap();
		bob.channel.receive_htlc(&add).unwrap();

		let (sig, log_index) = alice.channel.sign_next_commitment().unwrap();
		assert!(alice.channel.pending_updates());

		bob.channel.receive_new_commitment(&sig, log_index).unwrap();
		let revocation = bob.channel.revoke_current_commitment().unwrap();
		alice.channel.receive_revocation(&revocation).unwrap();
		assert!(alice.channel.pending_updates());

		// Only once the reciprocal commitment lands do both tips cover the
		// same log prefix again.
		let (sig, log_index) = bob.channel.sign_next_commitment().unwrap();
		alice.channel.receive_new_commitment(&sig, log_index).unwrap();
		let revocation = alice.channel.revoke_current_commitment().unwrap();
		bob.channel.receive_revocation(&revocation).unwrap();
		assert!(!alice.channel.pending_updates());
	}
}
