//! The transient record tracking a single in-progress channel funding
//! negotiation, from the initial coin selection until the channel opens or
//! the reservation is cancelled.

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin::util::address::Address;

use secp256k1::{PublicKey, SecretKey};

use chain::keysinterface::InputScript;
use ln::channel::LightningChannel;
use ln::chan_state::OpenChannelState;
use ln::elkrem::{ElkremReceiver, ElkremSender};

use std::sync::mpsc;
use std::sync::Mutex;

/// One party's contribution to a channel: the funds and keys it brings to
/// the funding transaction and the parameters of its commitment outputs.
#[derive(Clone, Debug)]
pub struct ChannelContribution {
	/// The amount of funds contributed, in asset units.
	pub funding_amount: u64,
	/// The inputs this party adds to the funding transaction.
	pub inputs: Vec<TxIn>,
	/// Any change produced by this party's coin selection.
	pub change_outputs: Vec<TxOut>,
	/// The key anchoring this party's half of the 2-of-2 funding output.
	pub multisig_key: PublicKey,
	/// The key this party's commitment outputs pay to.
	pub commit_key: PublicKey,
	/// The revocation key for this party's first commitment transaction.
	/// Derivable only once the counterparty's commitment key is known, so
	/// the field is vacant until the contribution exchange step.
	pub revocation_key: Option<PublicKey>,
	/// The CSV delay on this party's pay-to-self commitment output.
	pub csv_delay: u32,
	/// Where this party's funds land on cooperative close.
	pub delivery_address: Address,
}

// The channel state under construction, mirroring OpenChannelState with
// the fields learned later in the workflow left optional.
pub(super) struct PartialChannelState {
	pub(super) their_node_id: [u8; 32],
	pub(super) capacity: u64,
	pub(super) our_balance: u64,
	pub(super) their_balance: u64,
	pub(super) local_csv_delay: u32,
	pub(super) remote_csv_delay: u32,
	pub(super) our_multisig_key: PublicKey,
	pub(super) their_multisig_key: Option<PublicKey>,
	pub(super) our_commit_key: SecretKey,
	pub(super) their_commit_key: Option<PublicKey>,
	pub(super) our_delivery_script: Script,
	pub(super) their_delivery_script: Option<Script>,
	pub(super) funding_outpoint: Option<OutPoint>,
	pub(super) funding_redeem_script: Option<Script>,
	pub(super) our_commit_tx: Option<Transaction>,
	pub(super) our_commit_sig: Option<Vec<u8>>,
	pub(super) local_elkrem: Option<ElkremSender>,
	pub(super) remote_elkrem: ElkremReceiver,
	pub(super) their_current_revocation: Option<PublicKey>,
	pub(super) num_confs: u16,
}

impl PartialChannelState {
	// Assembles the final open-channel record. Returns None while any
	// counterparty-sourced field is still outstanding.
	pub(super) fn finalize(&self) -> Option<OpenChannelState> {
		Some(OpenChannelState {
			their_node_id: self.their_node_id,
			funding_outpoint: match self.funding_outpoint { Some(outpoint) => outpoint, None => return None },
			funding_redeem_script: match self.funding_redeem_script { Some(ref script) => script.clone(), None => return None },
			capacity: self.capacity,
			our_balance: self.our_balance,
			their_balance: self.their_balance,
			our_multisig_key: self.our_multisig_key,
			their_multisig_key: match self.their_multisig_key { Some(key) => key, None => return None },
			our_commit_key: self.our_commit_key,
			their_commit_key: match self.their_commit_key { Some(key) => key, None => return None },
			local_csv_delay: self.local_csv_delay,
			remote_csv_delay: self.remote_csv_delay,
			our_delivery_script: self.our_delivery_script.clone(),
			their_delivery_script: match self.their_delivery_script { Some(ref script) => script.clone(), None => return None },
			our_commit_tx: self.our_commit_tx.clone(),
			our_commit_sig: match self.our_commit_sig { Some(ref sig) => sig.clone(), None => return None },
			local_elkrem: match self.local_elkrem { Some(ref elkrem) => elkrem.clone(), None => return None },
			remote_elkrem: self.remote_elkrem.clone(),
			their_current_revocation: self.their_current_revocation,
			their_current_revocation_hash: [0; 32],
			num_updates: 0,
			num_confs_required: self.num_confs,
		})
	}
}

// Everything a reservation accumulates across the workflow steps, guarded
// by the reservation's own lock.
pub(super) struct ReservationState {
	pub(super) our_contribution: ChannelContribution,
	pub(super) their_contribution: Option<ChannelContribution>,
	pub(super) partial: PartialChannelState,
	pub(super) funding_tx: Option<Transaction>,
	// Our witnesses for the funding inputs we contribute, in sorted input
	// order.
	pub(super) our_funding_input_scripts: Vec<InputScript>,
	pub(super) their_funding_input_scripts: Vec<InputScript>,
	// Our signature over the counterparty's first commitment transaction.
	pub(super) our_commitment_sig: Option<Vec<u8>>,
}

/// A pending channel-open negotiation tracked in the wallet's reservation
/// limbo. All mutations flow through the owning
/// [`LightningWallet`](::ln::wallet::LightningWallet); the reservation
/// itself exposes read access to the negotiated artifacts and the one-shot
/// signal delivering the opened channel.
pub struct ChannelReservation {
	reservation_id: u64,
	num_confs: u16,
	pub(super) state: Mutex<ReservationState>,
	chan_open_tx: Mutex<Option<mpsc::Sender<Option<LightningChannel>>>>,
	chan_open_rx: Mutex<Option<mpsc::Receiver<Option<LightningChannel>>>>,
}

impl ChannelReservation {
	pub(super) fn new(reservation_id: u64, num_confs: u16, our_contribution: ChannelContribution,
			partial: PartialChannelState) -> ChannelReservation {
		let (chan_open_tx, chan_open_rx) = mpsc::channel();
		ChannelReservation {
			reservation_id,
			num_confs,
			state: Mutex::new(ReservationState {
				our_contribution,
				their_contribution: None,
				partial,
				funding_tx: None,
				our_funding_input_scripts: Vec::new(),
				their_funding_input_scripts: Vec::new(),
				our_commitment_sig: None,
			}),
			chan_open_tx: Mutex::new(Some(chan_open_tx)),
			chan_open_rx: Mutex::new(Some(chan_open_rx)),
		}
	}

	/// The reservation's id within the wallet's limbo. Every workflow step
	/// must carry a valid, active id.
	pub fn reservation_id(&self) -> u64 {
		self.reservation_id
	}

	/// The confirmation depth the funding transaction must reach before
	/// the channel is considered open.
	pub fn num_confs(&self) -> u16 {
		self.num_confs
	}

	/// Our contribution to the channel, for transmission to the remote
	/// party. The revocation key is populated once the counterparty's
	/// contribution has been processed.
	pub fn our_contribution(&self) -> ChannelContribution {
		self.state.lock().unwrap().our_contribution.clone()
	}

	/// The counterparty's contribution, once it has been processed.
	pub fn their_contribution(&self) -> Option<ChannelContribution> {
		self.state.lock().unwrap().their_contribution.clone()
	}

	/// The assembled funding transaction, once both contributions are in.
	/// Witnesses for the counterparty's inputs are attached during the
	/// final workflow step.
	pub fn funding_tx(&self) -> Option<Transaction> {
		self.state.lock().unwrap().funding_tx.clone()
	}

	/// The outpoint of the channel's funding output, which doubles as the
	/// channel's identifier.
	pub fn funding_outpoint(&self) -> Option<OutPoint> {
		self.state.lock().unwrap().partial.funding_outpoint
	}

	/// Our first commitment transaction, against which the counterparty's
	/// commitment signature is exchanged.
	pub fn our_commit_tx(&self) -> Option<Transaction> {
		self.state.lock().unwrap().partial.our_commit_tx.clone()
	}

	/// The signatures we contribute to the workflow: our funding input
	/// witnesses (in sorted input order) and our signature over the
	/// counterparty's first commitment transaction.
	pub fn our_signatures(&self) -> (Vec<InputScript>, Option<Vec<u8>>) {
		let state = self.state.lock().unwrap();
		(state.our_funding_input_scripts.clone(), state.our_commitment_sig.clone())
	}

	/// Takes the receiving half of the one-shot open signal. Yields
	/// `Some(channel)` once the funding transaction reaches depth and the
	/// channel state has been persisted, or `None` if the wallet or the
	/// notifier shut down first. Subsequent calls return `None`.
	pub fn take_open_signal(&self) -> Option<mpsc::Receiver<Option<LightningChannel>>> {
		self.chan_open_rx.lock().unwrap().take()
	}

	// Delivers the opened channel (or the shutdown marker) through the
	// one-shot signal. Later invocations are no-ops.
	pub(super) fn send_open_signal(&self, channel: Option<LightningChannel>) {
		if let Some(sender) = self.chan_open_tx.lock().unwrap().take() {
			// The receiver may be long gone; nothing to do about it here.
			let _ = sender.send(channel);
		}
	}
}
