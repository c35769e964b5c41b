//! The channel-aware wallet: accepts funding requests, performs coin
//! selection with input locking, negotiates the four-step funding workflow
//! with a remote peer, and hands off opened channels once the funding
//! transaction confirms.
//!
//! The wallet embeds a general purpose base wallet reached through
//! [`WalletController`], with channel awareness layered on top. All
//! interaction is independent of any particular peer-to-peer transport, so
//! the wallet is self-contained and embeddable.

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin::consensus::encode;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::util::bip32::{ChildNumber, ExtendedPrivKey};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{Amount, EcdsaSighashType, PackedLockTime, Sequence, Witness};

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};
use secp256k1;

use chain::assets::AssetEncoder;
use chain::chaininterface::{AddressType, BlockChainIO, ChainNotifier, Utxo, WalletController};
use chain::keysinterface::{InputScript, SignDescriptor, Signer};
use ln::chan_state::{ChannelPersister, OpenChannelState};
use ln::chan_utils;
use ln::channel::{create_commit_tx, LightningChannel};
use ln::elkrem::{ElkremReceiver, ElkremSender};
use ln::reservation::{ChannelContribution, ChannelReservation, PartialChannelState};
use util::config::WalletConfig;
use util::errors::{ChainError, ReservationError};
use util::logger::Logger;
use util::transaction_utils;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// The hardened HD child index the master elkrem root is derived from.
const ELKREM_ROOT_INDEX: u32 = 1;

// The hardened HD child index the node identity key is derived from.
const IDENTITY_KEY_INDEX: u32 = 2;

struct FundingLimbo {
	// Incomplete channels are tracked as reservations here, keyed by a
	// monotonically assigned id, until the final signatures are exchanged
	// or the reservation is cancelled.
	reservations: HashMap<u64, Arc<ChannelReservation>>,
	next_id: u64,
}

/// A domain-specific wallet capable of executing the workflow required to
/// open and operate payment channels, layered over a general base wallet.
///
/// The wallet is internally concurrent: the reservation limbo, the locked
/// outpoint set and each reservation are guarded by their own locks, and
/// blocking chain calls are issued without the limbo lock held. Coin
/// selection is additionally serialized so two concurrent funding requests
/// can never double-spend the same inputs.
pub struct LightningWallet {
	cfg: WalletConfig,

	wallet: Arc<dyn WalletController>,
	signer: Arc<dyn Signer>,
	chain_io: Arc<dyn BlockChainIO>,
	chain_notifier: Arc<dyn ChainNotifier>,
	persister: Arc<dyn ChannelPersister>,
	encoder: Arc<dyn AssetEncoder>,

	secp_ctx: Secp256k1<secp256k1::All>,

	// The root HD key all channel-specific secrets descend from.
	root_key: ExtendedPrivKey,

	limbo: Mutex<FundingLimbo>,

	// The set of currently locked outpoints, guarded by the coin selection
	// lock so that listing, selection and locking happen as one atomic
	// step.
	coin_select: Mutex<HashSet<OutPoint>>,

	started: AtomicBool,
	shutdown: Arc<AtomicBool>,

	logger: Arc<dyn Logger>,
}

impl LightningWallet {
	/// Creates a new wallet over the passed chain services. The base
	/// wallet's root key is fetched once here; it must remain stable
	/// across restarts for channel secrets to be re-derivable.
	pub fn new(cfg: WalletConfig, wallet: Arc<dyn WalletController>, signer: Arc<dyn Signer>,
			chain_io: Arc<dyn BlockChainIO>, chain_notifier: Arc<dyn ChainNotifier>,
			persister: Arc<dyn ChannelPersister>, encoder: Arc<dyn AssetEncoder>,
			logger: Arc<dyn Logger>) -> Result<LightningWallet, ReservationError> {
		let root_secret = wallet.fetch_root_key()?;
		let root_key = ExtendedPrivKey::new_master(cfg.network, &root_secret.secret_bytes())
			.map_err(|_| ReservationError::KeyDerivationFailed)?;

		Ok(LightningWallet {
			cfg,
			wallet,
			signer,
			chain_io,
			chain_notifier,
			persister,
			encoder,
			secp_ctx: Secp256k1::new(),
			root_key,
			limbo: Mutex::new(FundingLimbo { reservations: HashMap::new(), next_id: 0 }),
			coin_select: Mutex::new(HashSet::new()),
			started: AtomicBool::new(false),
			shutdown: Arc::new(AtomicBool::new(false)),
			logger,
		})
	}

	/// Starts the underlying base wallet. Safe to call more than once.
	pub fn startup(&self) -> Result<(), ReservationError> {
		if self.started.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		self.wallet.start()?;
		Ok(())
	}

	/// Signals shutdown: the base wallet is stopped and every in-flight
	/// confirmation waiter yields a `None` channel handle.
	pub fn shutdown(&self) -> Result<(), ReservationError> {
		if self.shutdown.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		self.wallet.stop()?;
		Ok(())
	}

	/// Returns all currently locked outpoints.
	pub fn locked_outpoints(&self) -> Vec<OutPoint> {
		self.coin_select.lock().unwrap().iter().cloned().collect()
	}

	/// Returns all currently active (non-cancelled) reservations.
	pub fn active_reservations(&self) -> Vec<Arc<ChannelReservation>> {
		self.limbo.lock().unwrap().reservations.values().cloned().collect()
	}

	/// Drops all volatile reservation state, unlocking every outpoint held
	/// by a pending reservation.
	pub fn reset_reservations(&self) {
		{
			let mut limbo = self.limbo.lock().unwrap();
			limbo.reservations.clear();
			limbo.next_id = 0;
		}
		let mut locked = self.coin_select.lock().unwrap();
		for outpoint in locked.drain() {
			self.wallet.unlock_outpoint(outpoint);
		}
	}

	/// Returns the wallet's node identity key, derived from the HD root at
	/// a reserved index.
	pub fn get_identity_key(&self) -> Result<secp256k1::SecretKey, ReservationError> {
		let child = ChildNumber::from_hardened_idx(IDENTITY_KEY_INDEX)
			.map_err(|_| ReservationError::KeyDerivationFailed)?;
		let identity_key = self.root_key.ckd_priv(&self.secp_ctx, child)
			.map_err(|_| ReservationError::KeyDerivationFailed)?;
		Ok(identity_key.private_key)
	}

	// The private key serving as the master elkrem root; the secret input
	// from which per-channel elkrem roots are derived.
	fn derive_master_elkrem_root(&self) -> Result<[u8; 32], ReservationError> {
		let child = ChildNumber::from_hardened_idx(ELKREM_ROOT_INDEX)
			.map_err(|_| ReservationError::KeyDerivationFailed)?;
		let elkrem_key = self.root_key.ckd_priv(&self.secp_ctx, child)
			.map_err(|_| ReservationError::KeyDerivationFailed)?;
		Ok(elkrem_key.private_key.secret_bytes())
	}

	fn fetch_reservation(&self, reservation_id: u64)
			-> Result<Arc<ChannelReservation>, ReservationError> {
		let limbo = self.limbo.lock().unwrap();
		limbo.reservations.get(&reservation_id).cloned()
			.ok_or(ReservationError::UnknownReservation)
	}

	/// Kicks off the workflow required to open a payment channel with a
	/// remote node. Inputs selected for the funding transaction are locked
	/// until the reservation completes or is cancelled, ensuring
	/// concurrent reservations never double-spend them.
	///
	/// The returned reservation carries our contribution, ready for
	/// transmission to the remote party. When `our_fund_amt` is zero (the
	/// responding side of a single-funder channel) no coin selection is
	/// performed at all.
	pub fn init_channel_reservation(&self, capacity: u64, our_fund_amt: u64,
			their_node_id: [u8; 32], num_confs: u16, csv_delay: u32)
			-> Result<Arc<ChannelReservation>, ReservationError> {
		let reservation_id = {
			let mut limbo = self.limbo.lock().unwrap();
			limbo.next_id += 1;
			limbo.next_id
		};

		// Two fresh keys from the HD chain: one for the multi-sig funding
		// output, one for the commitment outputs. The commitment secret is
		// kept in the channel state, as revocation private keys are later
		// derived from it.
		let multisig_key = self.wallet.new_raw_key()
			.map_err(|_| ReservationError::KeyDerivationFailed)?;
		let commit_key = self.wallet.new_raw_key()
			.map_err(|_| ReservationError::KeyDerivationFailed)?;
		let commit_secret = self.signer.derive_secret_key(&commit_key)
			.map_err(|_| ReservationError::KeyDerivationFailed)?;

		// A fresh address for the cooperative close payout.
		let delivery_address = self.wallet.new_address(AddressType::WitnessPubKey, false)?;
		let our_delivery_script = delivery_address.script_pubkey();

		let mut our_contribution = ChannelContribution {
			funding_amount: our_fund_amt,
			inputs: Vec::new(),
			change_outputs: Vec::new(),
			multisig_key,
			commit_key,
			revocation_key: None,
			csv_delay,
			delivery_address,
		};

		// On the receiving end of a single funder channel there is nothing
		// to select; otherwise gather enough coins to meet the requested
		// amount.
		if our_fund_amt > 0 {
			self.select_coins_and_change(our_fund_amt, &mut our_contribution)?;
		}

		let partial = PartialChannelState {
			their_node_id,
			capacity,
			our_balance: our_fund_amt,
			their_balance: 0,
			local_csv_delay: csv_delay,
			remote_csv_delay: 0,
			our_multisig_key: multisig_key,
			their_multisig_key: None,
			our_commit_key: commit_secret,
			their_commit_key: None,
			our_delivery_script,
			their_delivery_script: None,
			funding_outpoint: None,
			funding_redeem_script: None,
			our_commit_tx: None,
			our_commit_sig: None,
			local_elkrem: None,
			remote_elkrem: ElkremReceiver::new(),
			their_current_revocation: None,
			num_confs,
		};

		let reservation = Arc::new(ChannelReservation::new(reservation_id, num_confs,
			our_contribution, partial));

		self.limbo.lock().unwrap().reservations
			.insert(reservation_id, reservation.clone());

		log_info!(self, "New channel reservation {} with {} for capacity {} (our amount {})",
			reservation_id, hex_short(&their_node_id), capacity, our_fund_amt);

		Ok(reservation)
	}

	// Performs coin selection over the wallet's unlocked unspent witness
	// outputs carrying the configured asset, locking each selected
	// outpoint and producing change if any. The coin selection lock spans
	// the entire listing + selection + locking window.
	fn select_coins_and_change(&self, amt: u64, contribution: &mut ChannelContribution)
			-> Result<(), ReservationError> {
		let mut locked = self.coin_select.lock().unwrap();

		let coins = self.wallet.list_unspent_witness(self.cfg.funding_confs)?;
		let (selected, change_amt) = coin_select(amt, &coins, &self.cfg.asset_id)?;

		// The selected coins are now reserved, keeping concurrent funding
		// requests from referring to the same set.
		for outpoint in selected.iter() {
			locked.insert(*outpoint);
			self.wallet.lock_outpoint(*outpoint);

			// Empty witness for now; signing happens once the counterparty
			// accepts and the full transaction is known.
			contribution.inputs.push(TxIn {
				previous_output: *outpoint,
				script_sig: Script::new(),
				sequence: Sequence::MAX,
				witness: Witness::default(),
			});
		}

		if change_amt != 0 {
			let change_address = self.wallet.new_address(AddressType::WitnessPubKey, true)?;
			contribution.change_outputs.push(TxOut {
				value: change_amt,
				script_pubkey: change_address.script_pubkey(),
			});
		}

		Ok(())
	}

	/// Cancels an existing reservation, freeing its locked inputs for use
	/// by future reservations.
	pub fn cancel_reservation(&self, reservation_id: u64) -> Result<(), ReservationError> {
		let reservation = {
			let mut limbo = self.limbo.lock().unwrap();
			limbo.reservations.remove(&reservation_id)
				.ok_or(ReservationError::UnknownReservation)?
		};

		let state = reservation.state.lock().unwrap();
		let mut locked = self.coin_select.lock().unwrap();
		for input in state.our_contribution.inputs.iter() {
			locked.remove(&input.previous_output);
			self.wallet.unlock_outpoint(input.previous_output);
		}

		Ok(())
	}

	/// Processes the counterparty's contribution in a dual-funder
	/// workflow: assembles and canonically sorts the funding transaction,
	/// signs our inputs, derives the revocation keys for the first
	/// commitment pair, constructs both commitment transactions, and signs
	/// the counterparty's version.
	pub fn add_contribution(&self, reservation_id: u64, theirs: ChannelContribution)
			-> Result<(), ReservationError> {
		let reservation = self.fetch_reservation(reservation_id)?;
		let mut state = reservation.state.lock().unwrap();

		// All multi-party inputs and outputs, the 2-of-2 funding output,
		// and the canonical ordering letting both sides exchange only
		// signatures.
		let our_multisig_key = state.partial.our_multisig_key;
		let (redeem_script, funding_output) = chan_utils::gen_funding_pk_script(
			&our_multisig_key, &theirs.multisig_key, state.partial.capacity);

		let mut funding_tx = Transaction {
			version: 2,
			lock_time: PackedLockTime::ZERO,
			input: Vec::new(),
			output: Vec::new(),
		};
		for input in state.our_contribution.inputs.iter() {
			funding_tx.input.push(input.clone());
		}
		for input in theirs.inputs.iter() {
			funding_tx.input.push(input.clone());
		}
		for change in state.our_contribution.change_outputs.iter() {
			funding_tx.output.push(change.clone());
		}
		for change in theirs.change_outputs.iter() {
			funding_tx.output.push(change.clone());
		}
		funding_tx.output.push(funding_output.clone());
		transaction_utils::sort_transaction(&mut funding_tx);

		let mut funding_tx = self.encoder.encode_outputs(funding_tx, true)
			.map_err(ReservationError::Chain)?;

		// Sign every input we own, collecting the witnesses in sorted
		// input order.
		let mut scripts_by_index: Vec<Option<InputScript>> = vec![None; funding_tx.input.len()];
		{
			let mut sighashes = SighashCache::new(&funding_tx);
			for (input_index, txin) in funding_tx.input.iter().enumerate() {
				let info = match self.wallet.fetch_input_info(&txin.previous_output) {
					Ok(info) => info,
					Err(ChainError::NotMine) => continue,
					Err(err) => return Err(ReservationError::Chain(err)),
				};
				let sign_desc = SignDescriptor {
					pubkey: None,
					redeem_script: Script::new(),
					output: info,
					hash_type: EcdsaSighashType::All,
					input_index,
				};
				let input_script = self.signer.compute_input_script(&funding_tx, &sign_desc, &mut sighashes)
					.map_err(|_| ReservationError::SigningFailed)?;
				scripts_by_index[input_index] = Some(input_script);
			}
		}
		let mut our_input_scripts = Vec::new();
		for (input_index, maybe_script) in scripts_by_index.into_iter().enumerate() {
			if let Some(input_script) = maybe_script {
				funding_tx.input[input_index].script_sig = input_script.script_sig.clone();
				funding_tx.input[input_index].witness = Witness::from_vec(input_script.witness.clone());
				our_input_scripts.push(input_script);
			}
		}

		// The outputs are canonically sorted, so locate the multi-sig
		// outpoint by script in order to record it.
		let funding_txid = funding_tx.txid();
		let multisig_index = chan_utils::find_script_output_index(&funding_tx, &funding_output.script_pubkey)
			.ok_or_else(|| ReservationError::Chain(ChainError::Backend(
				"funding output missing from assembled transaction".to_string())))?;
		let funding_outpoint = OutPoint::new(funding_txid, multisig_index);

		// Our first commitment's revocation key comes from the first
		// pre-image of this channel's elkrem tree; an empty receiver
		// tracks the counterparty's side until they start revealing.
		let master_elkrem_root = self.derive_master_elkrem_root()?;
		let elkrem_root = derive_elkrem_root(&master_elkrem_root, &our_multisig_key, &theirs.multisig_key);
		let local_elkrem = ElkremSender::new(elkrem_root);
		let first_preimage = local_elkrem.at_index(0)
			.map_err(|_| ReservationError::KeyDerivationFailed)?;
		let our_revoke_key = chan_utils::derive_revocation_pubkey(&self.secp_ctx,
			&theirs.commit_key, &first_preimage)
			.map_err(|_| ReservationError::KeyDerivationFailed)?;
		let their_revoke_key = theirs.revocation_key
			.ok_or(ReservationError::KeyDerivationFailed)?;

		// With the funding outpoint known, create both initial commitment
		// transactions.
		let commit_txin = TxIn {
			previous_output: funding_outpoint,
			script_sig: Script::new(),
			sequence: Sequence::MAX,
			witness: Witness::default(),
		};
		let our_balance = state.our_contribution.funding_amount;
		let their_balance = theirs.funding_amount;
		let our_commit_pub = PublicKey::from_secret_key(&self.secp_ctx, &state.partial.our_commit_key);

		let mut our_commit_tx = create_commit_tx(commit_txin.clone(), &our_commit_pub,
			&theirs.commit_key, &our_revoke_key, state.our_contribution.csv_delay,
			our_balance, their_balance);
		let mut their_commit_tx = create_commit_tx(commit_txin, &theirs.commit_key,
			&our_commit_pub, &their_revoke_key, theirs.csv_delay,
			their_balance, our_balance);
		transaction_utils::sort_transaction(&mut our_commit_tx);
		transaction_utils::sort_transaction(&mut their_commit_tx);
		let our_commit_tx = self.encoder.encode_outputs(our_commit_tx, false)
			.map_err(ReservationError::Chain)?;
		let their_commit_tx = self.encoder.encode_outputs(their_commit_tx, false)
			.map_err(ReservationError::Chain)?;

		// Generate our half of the 2-of-2 for their version of the
		// commitment transaction.
		let our_commitment_sig = {
			let sign_desc = SignDescriptor {
				pubkey: Some(our_multisig_key),
				redeem_script: redeem_script.clone(),
				output: funding_output.clone(),
				hash_type: EcdsaSighashType::All,
				input_index: 0,
			};
			let mut sighashes = SighashCache::new(&their_commit_tx);
			self.signer.sign_output_raw(&their_commit_tx, &sign_desc, &mut sighashes)
				.map_err(|_| ReservationError::SigningFailed)?
		};

		// Record the newly available information within the reservation.
		state.partial.our_balance = our_balance;
		state.partial.their_balance = their_balance;
		state.partial.remote_csv_delay = theirs.csv_delay;
		state.partial.their_multisig_key = Some(theirs.multisig_key);
		state.partial.their_commit_key = Some(theirs.commit_key);
		state.partial.their_delivery_script = Some(theirs.delivery_address.script_pubkey());
		state.partial.funding_outpoint = Some(funding_outpoint);
		state.partial.funding_redeem_script = Some(redeem_script);
		state.partial.our_commit_tx = Some(our_commit_tx);
		state.partial.local_elkrem = Some(local_elkrem);
		state.partial.their_current_revocation = Some(their_revoke_key);
		state.our_contribution.revocation_key = Some(our_revoke_key);
		state.their_contribution = Some(theirs);
		state.funding_tx = Some(funding_tx);
		state.our_funding_input_scripts = our_input_scripts;
		state.our_commitment_sig = Some(our_commitment_sig);

		Ok(())
	}

	/// Processes the counterparty's contribution on the responding side of
	/// a single-funder workflow. No funding transaction is assembled
	/// locally; only the redeem script, the elkrem tree and our first
	/// revocation key are computed, with the commitment pair deferred
	/// until the initiator reveals the funding outpoint.
	pub fn add_single_contribution(&self, reservation_id: u64, theirs: ChannelContribution)
			-> Result<(), ReservationError> {
		let reservation = self.fetch_reservation(reservation_id)?;
		let mut state = reservation.state.lock().unwrap();

		let our_multisig_key = state.partial.our_multisig_key;
		let (redeem_script, _) = chan_utils::gen_funding_pk_script(
			&our_multisig_key, &theirs.multisig_key, state.partial.capacity);

		let master_elkrem_root = self.derive_master_elkrem_root()?;
		let elkrem_root = derive_elkrem_root(&master_elkrem_root, &our_multisig_key, &theirs.multisig_key);
		let local_elkrem = ElkremSender::new(elkrem_root);
		let first_preimage = local_elkrem.at_index(0)
			.map_err(|_| ReservationError::KeyDerivationFailed)?;
		let our_revoke_key = chan_utils::derive_revocation_pubkey(&self.secp_ctx,
			&theirs.commit_key, &first_preimage)
			.map_err(|_| ReservationError::KeyDerivationFailed)?;

		state.partial.remote_csv_delay = theirs.csv_delay;
		state.partial.their_multisig_key = Some(theirs.multisig_key);
		state.partial.their_commit_key = Some(theirs.commit_key);
		state.partial.their_delivery_script = Some(theirs.delivery_address.script_pubkey());
		state.partial.funding_redeem_script = Some(redeem_script);
		state.partial.local_elkrem = Some(local_elkrem);
		state.our_contribution.revocation_key = Some(our_revoke_key);
		state.their_contribution = Some(theirs);

		Ok(())
	}

	/// The final step of the dual-funder workflow: validates every
	/// counterparty input witness under standard script flags against the
	/// chain oracle's view of the spent outputs, verifies their signature
	/// over our first commitment transaction, then persists the channel,
	/// broadcasts the funding transaction and hands the reservation to a
	/// confirmation waiter.
	///
	/// Any validation failure aborts before broadcast, leaving the
	/// reservation in limbo for the caller to cancel.
	pub fn complete_reservation(&self, reservation_id: u64, their_input_scripts: Vec<InputScript>,
			their_commit_sig: &[u8]) -> Result<(), ReservationError> {
		let reservation = self.fetch_reservation(reservation_id)?;
		let open_state;
		let funding_tx = {
			let mut state = reservation.state.lock().unwrap();

			let mut funding_tx = state.funding_tx.clone()
				.ok_or(ReservationError::UnknownReservation)?;

			// Complete the transaction by attaching their witnesses to the
			// inputs that are not ours, in sorted input order.
			let mut verify_targets = Vec::new();
			let mut sig_index = 0;
			for (input_index, txin) in funding_tx.input.iter_mut().enumerate() {
				if !their_input_scripts.is_empty() && txin.witness.is_empty()
						&& txin.script_sig.is_empty() {
					let input_script = their_input_scripts.get(sig_index)
						.ok_or_else(|| ReservationError::ScriptExecutionFailed(
							"not enough counterparty input scripts".to_string()))?;
					txin.witness = Witness::from_vec(input_script.witness.clone());
					txin.script_sig = input_script.script_sig.clone();
					verify_targets.push(input_index);
					sig_index += 1;
				}
			}

			// Each witness+script combo must satisfy the output it claims
			// to spend, as reported by the chain oracle.
			let spending = encode::serialize(&funding_tx);
			for input_index in verify_targets {
				let prev_out = funding_tx.input[input_index].previous_output;
				let output = self.chain_io.get_utxo(&prev_out.txid, prev_out.vout)
					.map_err(|_| ReservationError::UtxoMissing)?;
				output.script_pubkey.verify(input_index, Amount::from_sat(output.value), &spending)
					.map_err(|err| ReservationError::ScriptExecutionFailed(err.to_string()))?;
			}

			// Their signature must let us spend our version of the
			// commitment transaction.
			let our_commit_tx = state.partial.our_commit_tx.clone()
				.ok_or(ReservationError::UnknownReservation)?;
			let redeem_script = state.partial.funding_redeem_script.clone()
				.ok_or(ReservationError::UnknownReservation)?;
			let their_multisig_key = state.partial.their_multisig_key
				.ok_or(ReservationError::UnknownReservation)?;
			verify_commitment_sig(&self.secp_ctx, &our_commit_tx, &redeem_script,
				state.partial.capacity, their_commit_sig, &their_multisig_key)?;

			state.partial.our_commit_sig = Some(their_commit_sig.to_vec());
			state.their_funding_input_scripts = their_input_scripts;
			state.funding_tx = Some(funding_tx.clone());

			open_state = state.partial.finalize()
				.ok_or(ReservationError::UnknownReservation)?;
			funding_tx
		};

		// Funding complete: out of limbo, into the database, onto the
		// network.
		self.limbo.lock().unwrap().reservations.remove(&reservation_id);

		self.persister.full_sync(&open_state)
			.map_err(|err| ReservationError::Chain(ChainError::Backend(err)))?;

		log_info!(self, "Broadcasting funding tx for ChannelPoint({}): {}",
			open_state.funding_outpoint, funding_tx.txid());
		self.wallet.publish_transaction(&funding_tx)
			.map_err(ReservationError::Chain)?;

		self.open_channel_after_confirmations(reservation, open_state);

		Ok(())
	}

	/// Progresses the single-funder responder workflow once the initiator
	/// reveals the funding outpoint, their revocation key, and a signature
	/// for our version of the commitment transaction. Both commitment
	/// transactions are built against the provided outpoint, their
	/// signature verified, and ours over their version produced.
	pub fn complete_single_funder(&self, reservation_id: u64, funding_outpoint: OutPoint,
			revoke_key: PublicKey, their_commit_sig: &[u8]) -> Result<(), ReservationError> {
		let reservation = self.fetch_reservation(reservation_id)?;
		let mut state = reservation.state.lock().unwrap();

		let theirs = state.their_contribution.clone()
			.ok_or(ReservationError::UnknownReservation)?;
		let redeem_script = state.partial.funding_redeem_script.clone()
			.ok_or(ReservationError::UnknownReservation)?;
		let our_revoke_key = state.our_contribution.revocation_key
			.ok_or(ReservationError::KeyDerivationFailed)?;

		let our_balance = state.our_contribution.funding_amount;
		let their_balance = theirs.funding_amount;
		let our_commit_pub = PublicKey::from_secret_key(&self.secp_ctx, &state.partial.our_commit_key);

		let commit_txin = TxIn {
			previous_output: funding_outpoint,
			script_sig: Script::new(),
			sequence: Sequence::MAX,
			witness: Witness::default(),
		};
		let mut our_commit_tx = create_commit_tx(commit_txin.clone(), &our_commit_pub,
			&theirs.commit_key, &our_revoke_key, state.our_contribution.csv_delay,
			our_balance, their_balance);
		let mut their_commit_tx = create_commit_tx(commit_txin, &theirs.commit_key,
			&our_commit_pub, &revoke_key, theirs.csv_delay, their_balance, our_balance);
		transaction_utils::sort_transaction(&mut our_commit_tx);
		transaction_utils::sort_transaction(&mut their_commit_tx);
		let our_commit_tx = self.encoder.encode_outputs(our_commit_tx, false)
			.map_err(ReservationError::Chain)?;
		let their_commit_tx = self.encoder.encode_outputs(their_commit_tx, false)
			.map_err(ReservationError::Chain)?;

		verify_commitment_sig(&self.secp_ctx, &our_commit_tx, &redeem_script,
			state.partial.capacity, their_commit_sig,
			&theirs.multisig_key)?;

		// With their signature verified we can safely sign their version,
		// allowing the initiator to broadcast the funding transaction.
		let our_commitment_sig = {
			let sign_desc = SignDescriptor {
				pubkey: Some(state.partial.our_multisig_key),
				redeem_script: redeem_script.clone(),
				output: TxOut {
					value: state.partial.capacity,
					script_pubkey: chan_utils::witness_script_hash(&redeem_script),
				},
				hash_type: EcdsaSighashType::All,
				input_index: 0,
			};
			let mut sighashes = SighashCache::new(&their_commit_tx);
			self.signer.sign_output_raw(&their_commit_tx, &sign_desc, &mut sighashes)
				.map_err(|_| ReservationError::SigningFailed)?
		};

		state.partial.funding_outpoint = Some(funding_outpoint);
		state.partial.their_current_revocation = Some(revoke_key);
		state.partial.our_balance = our_balance;
		state.partial.their_balance = their_balance;
		state.partial.our_commit_tx = Some(our_commit_tx);
		state.partial.our_commit_sig = Some(their_commit_sig.to_vec());
		state.our_commitment_sig = Some(our_commitment_sig);

		Ok(())
	}

	/// Finalizes a single-funder reservation to which we are the
	/// responder, once the remote peer reports the funding transaction
	/// confirmed. The channel state is persisted and the opened channel
	/// delivered through the reservation's open signal.
	pub fn complete_channel_open(&self, reservation_id: u64) -> Result<(), ReservationError> {
		let reservation = {
			let mut limbo = self.limbo.lock().unwrap();
			limbo.reservations.remove(&reservation_id)
				.ok_or(ReservationError::UnknownReservation)?
		};

		let open_state = reservation.state.lock().unwrap().partial.finalize()
			.ok_or(ReservationError::UnknownReservation)?;

		self.persister.full_sync(&open_state)
			.map_err(|err| ReservationError::Chain(ChainError::Backend(err)))?;

		let channel = LightningChannel::new(self.signer.clone(), self.persister.clone(),
			self.encoder.clone(), open_state, self.cfg.close_fee, self.logger.clone());
		reservation.send_open_signal(Some(channel));

		Ok(())
	}

	// Waits (on a dedicated thread) for the funding transaction to reach
	// the reservation's confirmation depth, then delivers the opened
	// channel through the reservation's one-shot signal. Notifier or
	// wallet shutdown deliver a `None` handle instead.
	fn open_channel_after_confirmations(&self, reservation: Arc<ChannelReservation>,
			state: OpenChannelState) {
		let notifier = self.chain_notifier.clone();
		let signer = self.signer.clone();
		let persister = self.persister.clone();
		let encoder = self.encoder.clone();
		let logger = self.logger.clone();
		let quit = self.shutdown.clone();
		let close_fee = self.cfg.close_fee;
		let num_confs = reservation.num_confs() as u32;
		let txid = state.funding_outpoint.txid;

		log_info!(self, "Waiting for funding tx (txid: {}) to reach {} confirmations",
			txid, num_confs);

		thread::spawn(move || {
			let ntfn = notifier.register_confirmations_ntfn(&txid, num_confs);
			loop {
				if quit.load(Ordering::Acquire) {
					reservation.send_open_signal(None);
					return;
				}
				match ntfn.confirmed.recv_timeout(Duration::from_millis(50)) {
					Ok(()) => break,
					Err(mpsc::RecvTimeoutError::Timeout) => continue,
					// A dropped sender means the notifier is shutting
					// down, which doesn't count as a confirmation.
					Err(mpsc::RecvTimeoutError::Disconnected) => {
						reservation.send_open_signal(None);
						return;
					}
				}
			}

			let channel = LightningChannel::new(signer, persister, encoder, state,
				close_fee, logger);
			reservation.send_open_signal(Some(channel));
		});
	}
}

// Verifies a counterparty signature over a commitment transaction spending
// the funding output, with the channel capacity as the signed value.
fn verify_commitment_sig(secp_ctx: &Secp256k1<secp256k1::All>, commit_tx: &Transaction,
		redeem_script: &Script, capacity: u64, raw_sig: &[u8], their_key: &PublicKey)
		-> Result<(), ReservationError> {
	let mut sighashes = SighashCache::new(commit_tx);
	let sighash = sighashes.segwit_signature_hash(0, redeem_script, capacity, EcdsaSighashType::All)
		.map_err(|_| ReservationError::SignatureInvalid)?;
	let msg = Message::from_slice(&sighash[..])
		.map_err(|_| ReservationError::SignatureInvalid)?;
	let sig = Signature::from_der(raw_sig)
		.map_err(|_| ReservationError::SignatureInvalid)?;
	secp_ctx.verify_ecdsa(&msg, &sig, their_key)
		.map_err(|_| ReservationError::SignatureInvalid)
}

// Selects a minimal prefix of the passed coins whose asset-filtered sum
// meets the requested amount, returning the selected outpoints along with
// the change left over.
fn coin_select(amt: u64, coins: &[Utxo], asset_id: &str)
		-> Result<(Vec<OutPoint>, u64), ReservationError> {
	let (total, selected) = select_inputs(amt, coins, asset_id)?;
	Ok((selected, total - amt))
}

// Walks the coins in order, collecting outputs of the configured asset
// until the selection amount is met.
fn select_inputs(amt: u64, coins: &[Utxo], asset_id: &str)
		-> Result<(u64, Vec<OutPoint>), ReservationError> {
	let mut selected = Vec::new();
	let mut total = 0u64;
	let mut remaining = coins.iter();
	while total < amt {
		match remaining.next() {
			Some(coin) => {
				if coin.asset.asset_id == asset_id {
					selected.push(coin.outpoint);
					total += coin.asset.value;
				}
			}
			None => return Err(ReservationError::InsufficientFunds),
		}
	}
	Ok((total, selected))
}

// Derives a channel's elkrem root by hashing the master elkrem root with
// both parties' multi-sig keys: deterministic and unique per channel, yet
// reproducible from the wallet root alone.
fn derive_elkrem_root(master_root: &[u8; 32], local_key: &PublicKey, remote_key: &PublicKey) -> [u8; 32] {
	let mut sha = sha256::Hash::engine();
	sha.input(&master_root[..]);
	sha.input(&local_key.serialize());
	sha.input(&remote_key.serialize());
	sha256::Hash::from_engine(sha).into_inner()
}

// Short hex rendering of a node id for log lines.
fn hex_short(id: &[u8; 32]) -> String {
	let mut out = String::with_capacity(16);
	for byte in id.iter().take(8) {
		out.push_str(&format!("{:02x}", byte));
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	use bitcoin::network::constants::Network;
	use bitcoin::util::address::Address;
	use bitcoin::Txid;

	use secp256k1::SecretKey;

	use chain::assets::IdentityEncoder;
	use util::test_utils::{p2wkh_input_script, KeyStore, TestBlockChainIO, TestChannelPersister,
		TestLogger, TestNotifier, TestWalletController};
	use util::test_utils::TestSigner;

	use std::sync::{Arc, Mutex};
	use std::thread;
	use std::time::Duration;

	const ASSET_ID: &str = "beefcafe";
	const CAPACITY: u64 = 1_000_000;
	const CSV_DELAY: u32 = 144;

	struct WalletHarness {
		wallet: Arc<LightningWallet>,
		keys: Arc<Mutex<KeyStore>>,
		controller: Arc<TestWalletController>,
		chain_io: Arc<TestBlockChainIO>,
		notifier: Arc<TestNotifier>,
		persister: Arc<TestChannelPersister>,
	}

	// Spins up a wallet over in-memory chain services, funded with the
	// passed (txid byte, vout, on-chain value, asset value) outputs.
	fn create_test_wallet(utxos: &[(u8, u32, u64, u64)]) -> WalletHarness {
		let keys = Arc::new(Mutex::new(KeyStore::new([0x5a; 32])));
		let controller = Arc::new(TestWalletController::new(keys.clone(), ASSET_ID, utxos));
		let chain_io = Arc::new(TestBlockChainIO::new());
		let notifier = Arc::new(TestNotifier::new());
		let persister = Arc::new(TestChannelPersister::new());
		let signer = Arc::new(TestSigner::new(keys.clone()));
		let logger: Arc<dyn Logger> = Arc::new(TestLogger::new());

		let cfg = WalletConfig::new(Network::Regtest, ASSET_ID.to_string());
		let wallet = LightningWallet::new(cfg,
			controller.clone() as Arc<dyn WalletController>,
			signer as Arc<dyn Signer>,
			chain_io.clone() as Arc<dyn BlockChainIO>,
			notifier.clone() as Arc<dyn ChainNotifier>,
			persister.clone() as Arc<dyn ChannelPersister>,
			Arc::new(IdentityEncoder) as Arc<dyn AssetEncoder>,
			logger).unwrap();

		WalletHarness {
			wallet: Arc::new(wallet),
			keys,
			controller,
			chain_io,
			notifier,
			persister,
		}
	}

	// Plays the remote node in funding workflows, with all of its keys
	// known to the test.
	struct RemoteNode {
		secp_ctx: Secp256k1<secp256k1::All>,
		ms_secret: SecretKey,
		ms_pub: PublicKey,
		commit_pub: PublicKey,
		elkrem: ElkremSender,
		input_secret: SecretKey,
		input_pub: PublicKey,
		prev_outpoint: OutPoint,
		prev_output: TxOut,
		funding_amount: u64,
		change: u64,
		change_script: Script,
		delivery_address: Address,
	}

	impl RemoteNode {
		fn new(funding_amount: u64, change: u64) -> RemoteNode {
			let secp_ctx = Secp256k1::new();
			let key = |fill: u8| {
				let secret = SecretKey::from_slice(&[fill; 32]).unwrap();
				let public = PublicKey::from_secret_key(&secp_ctx, &secret);
				(secret, public)
			};
			let (ms_secret, ms_pub) = key(0x61);
			let (_, commit_pub) = key(0x62);
			let (input_secret, input_pub) = key(0x63);
			let (_, change_pub) = key(0x64);
			let (_, delivery_pub) = key(0x65);

			let prev_outpoint = OutPoint::new(Txid::from_inner([0xb0; 32]), 1);
			let prev_output = TxOut {
				value: 700_000,
				script_pubkey: chan_utils::commit_script_unencumbered(&input_pub),
			};

			RemoteNode {
				ms_secret,
				ms_pub,
				commit_pub,
				elkrem: ElkremSender::new([0x71; 32]),
				input_secret,
				input_pub,
				prev_outpoint,
				prev_output,
				funding_amount,
				change,
				change_script: chan_utils::commit_script_unencumbered(&change_pub),
				delivery_address: Address::p2wpkh(&::bitcoin::PublicKey::new(delivery_pub),
					Network::Regtest).unwrap(),
				secp_ctx,
			}
		}

		// The contribution this node sends over the wire. The revocation
		// key can only be derived once the other side's commitment key is
		// known.
		fn contribution(&self, other_commit_key: &PublicKey, with_inputs: bool) -> ChannelContribution {
			let revocation_key = chan_utils::derive_revocation_pubkey(&self.secp_ctx,
				other_commit_key, &self.elkrem.at_index(0).unwrap()).unwrap();
			let (inputs, change_outputs) = if with_inputs {
				(vec![TxIn {
					previous_output: self.prev_outpoint,
					script_sig: Script::new(),
					sequence: Sequence::MAX,
					witness: Witness::default(),
				}],
				vec![TxOut { value: self.change, script_pubkey: self.change_script.clone() }])
			} else {
				(Vec::new(), Vec::new())
			};
			ChannelContribution {
				funding_amount: self.funding_amount,
				inputs,
				change_outputs,
				multisig_key: self.ms_pub,
				commit_key: self.commit_pub,
				revocation_key: Some(revocation_key),
				csv_delay: CSV_DELAY,
				delivery_address: self.delivery_address.clone(),
			}
		}

		fn sign_funding_input(&self, funding_tx: &Transaction) -> InputScript {
			let input_index = funding_tx.input.iter()
				.position(|txin| txin.previous_output == self.prev_outpoint).unwrap();
			p2wkh_input_script(&self.secp_ctx, &self.input_secret, &self.input_pub,
				funding_tx, input_index, self.prev_output.value)
		}

		fn sign_commitment(&self, commit_tx: &Transaction, redeem_script: &Script) -> Vec<u8> {
			let mut sighashes = SighashCache::new(commit_tx);
			let sighash = sighashes.segwit_signature_hash(0, redeem_script, CAPACITY,
				EcdsaSighashType::All).unwrap();
			let msg = Message::from_slice(&sighash[..]).unwrap();
			self.secp_ctx.sign_ecdsa(&msg, &self.ms_secret).serialize_der().to_vec()
		}
	}

	#[test]
	fn dual_funding_workflow() {
		// Both sides bring 500k of the asset to a 1M channel.
		let harness = create_test_wallet(&[(0xa1, 0, 100_000_000, 1_000_000)]);
		let remote = RemoteNode::new(CAPACITY / 2, 100_000);
		harness.chain_io.add_utxo(remote.prev_outpoint, remote.prev_output.clone());

		let reservation = harness.wallet.init_channel_reservation(CAPACITY, CAPACITY / 2,
			[0xb1; 32], 1, CSV_DELAY).unwrap();
		let our_contribution = reservation.our_contribution();
		assert_eq!(our_contribution.inputs.len(), 1);
		assert_eq!(our_contribution.change_outputs.len(), 1);
		assert_eq!(our_contribution.change_outputs[0].value, 500_000);
		assert_eq!(harness.wallet.locked_outpoints().len(), 1);

		// The contribution exchange; the remote node derives its
		// revocation key from our commitment key.
		let their_contribution = remote.contribution(&our_contribution.commit_key, true);
		harness.wallet.add_contribution(reservation.reservation_id(),
			their_contribution).unwrap();

		let funding_tx = reservation.funding_tx().unwrap();
		assert_eq!(funding_tx.input.len(), 2);
		// Funding output plus both sides' change.
		assert_eq!(funding_tx.output.len(), 3);
		let (redeem_script, funding_output) = chan_utils::gen_funding_pk_script(
			&our_contribution.multisig_key, &remote.ms_pub, CAPACITY);
		let funding_index = chan_utils::find_script_output_index(&funding_tx,
			&funding_output.script_pubkey).unwrap();
		assert_eq!(reservation.funding_outpoint().unwrap(),
			OutPoint::new(funding_tx.txid(), funding_index));

		// Our input carries its witness already; theirs is still bare.
		assert_eq!(funding_tx.input.iter().filter(|txin| txin.witness.is_empty()).count(), 1);

		// The remote node completes its half: a witness for its funding
		// input plus a signature over our commitment transaction.
		let their_input_script = remote.sign_funding_input(&funding_tx);
		let our_commit_tx = reservation.our_commit_tx().unwrap();
		let their_commit_sig = remote.sign_commitment(&our_commit_tx, &redeem_script);

		harness.wallet.complete_reservation(reservation.reservation_id(),
			vec![their_input_script], &their_commit_sig).unwrap();

		// Out of limbo, persisted and broadcast.
		assert!(harness.wallet.active_reservations().is_empty());
		assert_eq!(harness.persister.full_syncs(), 1);
		assert_eq!(harness.controller.published().len(), 1);

		// Our commitment transaction must spend the funding output under
		// standard verification once both halves of the witness are in.
		let our_ms_secret = harness.keys.lock().unwrap()
			.secret_for(&our_contribution.multisig_key).unwrap();
		let secp_ctx = Secp256k1::new();
		let our_sig = {
			let mut sighashes = SighashCache::new(&our_commit_tx);
			let sighash = sighashes.segwit_signature_hash(0, &redeem_script, CAPACITY,
				EcdsaSighashType::All).unwrap();
			let msg = Message::from_slice(&sighash[..]).unwrap();
			secp_ctx.sign_ecdsa(&msg, &our_ms_secret).serialize_der().to_vec()
		};
		let mut spendable_commit = our_commit_tx.clone();
		spendable_commit.input[0].witness = Witness::from_vec(chan_utils::spend_multisig(
			&redeem_script, &our_contribution.multisig_key, &our_sig,
			&remote.ms_pub, &their_commit_sig));
		funding_output.script_pubkey.verify(0, Amount::from_sat(CAPACITY),
			&encode::serialize(&spendable_commit)).unwrap();

		// Once the notifier fires, the opened channel arrives through the
		// reservation's signal with both balances settled.
		let open_signal = reservation.take_open_signal().unwrap();
		harness.notifier.confirm_all();
		let channel = open_signal.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
		let snapshot = channel.state_snapshot();
		assert_eq!(snapshot.our_balance, CAPACITY / 2);
		assert_eq!(snapshot.their_balance, CAPACITY / 2);
		assert_eq!(snapshot.capacity, CAPACITY);
	}

	#[test]
	fn single_funder_responder_workflow() {
		// As the responding side we contribute nothing: no coins listed,
		// none locked.
		let harness = create_test_wallet(&[]);
		let remote = RemoteNode::new(CAPACITY, 0);

		let reservation = harness.wallet.init_channel_reservation(CAPACITY, 0,
			[0xb2; 32], 1, CSV_DELAY).unwrap();
		assert_eq!(harness.controller.list_unspent_calls(), 0);
		assert!(harness.wallet.locked_outpoints().is_empty());

		let our_contribution = reservation.our_contribution();
		harness.wallet.add_single_contribution(reservation.reservation_id(),
			remote.contribution(&our_contribution.commit_key, false)).unwrap();
		let our_revoke_key = reservation.our_contribution().revocation_key.unwrap();

		// The initiator assembles the funding transaction privately and
		// reveals the outpoint, its revocation key, and a signature over
		// our commitment.
		let funding_outpoint = OutPoint::new(Txid::from_inner([0xab; 32]), 0);
		let (redeem_script, _) = chan_utils::gen_funding_pk_script(
			&our_contribution.multisig_key, &remote.ms_pub, CAPACITY);
		let their_revoke_key = chan_utils::derive_revocation_pubkey(&remote.secp_ctx,
			&our_contribution.commit_key, &ElkremSender::new([0x99; 32]).at_index(0).unwrap()).unwrap();

		// Our commitment as the initiator will compute it: we hold
		// nothing, they hold everything.
		let commit_txin = TxIn {
			previous_output: funding_outpoint,
			script_sig: Script::new(),
			sequence: Sequence::MAX,
			witness: Witness::default(),
		};
		let mut expected_commit = create_commit_tx(commit_txin, &our_contribution.commit_key,
			&remote.commit_pub, &our_revoke_key, CSV_DELAY, 0, CAPACITY);
		transaction_utils::sort_transaction(&mut expected_commit);
		assert_eq!(expected_commit.output.len(), 1);
		let their_commit_sig = remote.sign_commitment(&expected_commit, &redeem_script);

		harness.wallet.complete_single_funder(reservation.reservation_id(),
			funding_outpoint, their_revoke_key, &their_commit_sig).unwrap();
		assert_eq!(reservation.our_commit_tx().unwrap(), expected_commit);
		assert!(reservation.our_signatures().1.is_some());

		// The peer reports the channel open; the handle arrives with the
		// full balance on their side.
		let open_signal = reservation.take_open_signal().unwrap();
		harness.wallet.complete_channel_open(reservation.reservation_id()).unwrap();
		let channel = open_signal.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
		let snapshot = channel.state_snapshot();
		assert_eq!(snapshot.our_balance, 0);
		assert_eq!(snapshot.their_balance, CAPACITY);
		assert_eq!(harness.controller.list_unspent_calls(), 0);
		assert_eq!(harness.persister.full_syncs(), 1);
	}

	#[test]
	fn cancellation_releases_locked_inputs() {
		let harness = create_test_wallet(&[(0xa2, 0, 100_000_000, 1_000_000)]);

		let reservation = harness.wallet.init_channel_reservation(CAPACITY, 500_000,
			[0xb3; 32], 1, CSV_DELAY).unwrap();
		assert_eq!(harness.wallet.locked_outpoints().len(), 1);

		harness.wallet.cancel_reservation(reservation.reservation_id()).unwrap();
		assert!(harness.wallet.locked_outpoints().is_empty());
		assert!(harness.wallet.active_reservations().is_empty());
		assert_eq!(harness.wallet.cancel_reservation(reservation.reservation_id()),
			Err(ReservationError::UnknownReservation));

		// The freed inputs fund the next reservation.
		harness.wallet.init_channel_reservation(CAPACITY, 500_000, [0xb3; 32], 1,
			CSV_DELAY).unwrap();
		assert_eq!(harness.wallet.locked_outpoints().len(), 1);
	}

	#[test]
	fn insufficient_funds_leaves_no_locks() {
		let harness = create_test_wallet(&[(0xa3, 0, 10_000_000, 100_000)]);

		let result = harness.wallet.init_channel_reservation(CAPACITY, 500_000,
			[0xb4; 32], 1, CSV_DELAY);
		assert_eq!(result.map(|_| ()), Err(ReservationError::InsufficientFunds));
		assert!(harness.wallet.locked_outpoints().is_empty());
		assert!(harness.wallet.active_reservations().is_empty());
	}

	#[test]
	fn concurrent_reservations_never_share_inputs() {
		// Two requests which together overshoot the wallet's funds:
		// exactly one wins both coins, the other comes up empty-handed.
		let harness = create_test_wallet(&[
			(0xa4, 0, 60_000_000, 600_000),
			(0xa5, 1, 60_000_000, 600_000),
		]);

		let spawn_reserve = |wallet: Arc<LightningWallet>| {
			thread::spawn(move || {
				wallet.init_channel_reservation(1_400_000, 700_000, [0xb5; 32], 1, CSV_DELAY)
					.map(|reservation| reservation.our_contribution().inputs.len())
			})
		};
		let first = spawn_reserve(harness.wallet.clone());
		let second = spawn_reserve(harness.wallet.clone());
		let results = vec![first.join().unwrap(), second.join().unwrap()];

		let winners: Vec<_> = results.iter().filter(|result| result.is_ok()).collect();
		let losers: Vec<_> = results.iter().filter(|result| result.is_err()).collect();
		assert_eq!(winners.len(), 1);
		assert_eq!(losers.len(), 1);
		assert_eq!(*winners[0].as_ref().unwrap(), 2);
		assert_eq!(losers[0].as_ref().unwrap_err(), &ReservationError::InsufficientFunds);
		assert_eq!(harness.wallet.locked_outpoints().len(), 2);
	}

	#[test]
	fn notifier_shutdown_yields_null_channel() {
		let harness = create_test_wallet(&[(0xa6, 0, 100_000_000, 1_000_000)]);
		let remote = RemoteNode::new(CAPACITY / 2, 100_000);
		harness.chain_io.add_utxo(remote.prev_outpoint, remote.prev_output.clone());

		let reservation = harness.wallet.init_channel_reservation(CAPACITY, CAPACITY / 2,
			[0xb6; 32], 1, CSV_DELAY).unwrap();
		let our_contribution = reservation.our_contribution();
		harness.wallet.add_contribution(reservation.reservation_id(),
			remote.contribution(&our_contribution.commit_key, true)).unwrap();

		let funding_tx = reservation.funding_tx().unwrap();
		let (redeem_script, _) = chan_utils::gen_funding_pk_script(
			&our_contribution.multisig_key, &remote.ms_pub, CAPACITY);
		let their_input_script = remote.sign_funding_input(&funding_tx);
		let their_commit_sig = remote.sign_commitment(&reservation.our_commit_tx().unwrap(),
			&redeem_script);
		harness.wallet.complete_reservation(reservation.reservation_id(),
			vec![their_input_script], &their_commit_sig).unwrap();

		// The notifier goes away before the funding transaction confirms:
		// the waiter hands back a null channel rather than hanging.
		let open_signal = reservation.take_open_signal().unwrap();
		harness.notifier.shutdown();
		assert!(open_signal.recv_timeout(Duration::from_secs(10)).unwrap().is_none());
	}

	#[test]
	fn elkrem_roots_are_per_channel() {
		let (_, key_a) = {
			let secp_ctx = Secp256k1::new();
			let secret = SecretKey::from_slice(&[1; 32]).unwrap();
			(secret, PublicKey::from_secret_key(&secp_ctx, &secret))
		};
		let (_, key_b) = {
			let secp_ctx = Secp256k1::new();
			let secret = SecretKey::from_slice(&[2; 32]).unwrap();
			(secret, PublicKey::from_secret_key(&secp_ctx, &secret))
		};

		let master = [9; 32];
		let root_ab = derive_elkrem_root(&master, &key_a, &key_b);
		let root_ba = derive_elkrem_root(&master, &key_b, &key_a);
		assert_ne!(root_ab, root_ba);
		assert_eq!(root_ab, derive_elkrem_root(&master, &key_a, &key_b));
		assert_ne!(root_ab, derive_elkrem_root(&[10; 32], &key_a, &key_b));
	}
}
