//! The abstract signature producer the channel engine routes all 2-of-2 and
//! funding-input signing through, paving the way for hardware tokens, HSMs
//! or a plain software wallet to hold the actual keys.

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{Transaction, TxOut};
use bitcoin::util::sighash::SighashCache;
use bitcoin::EcdsaSighashType;

use secp256k1::{PublicKey, SecretKey};

/// Houses the information required to successfully sign a given output.
///
/// The same descriptor shape serves both raw multi-sig signing and full
/// input-script computation; fields that do not apply are left at their
/// empty values. The sighash midstate is computed once per transaction by
/// the caller and threaded through here so signing many inputs of one
/// transaction stays linear.
pub struct SignDescriptor {
	/// The public key the signature should validate under, when the caller
	/// knows it. Left as `None` for inputs whose key the signer resolves
	/// from the output script itself.
	pub pubkey: Option<PublicKey>,
	/// The full script required to redeem the output. Only populated when
	/// signing a p2wsh or p2sh output; empty otherwise.
	pub redeem_script: Script,
	/// The output being spent. Both the script and the value must be
	/// populated or an invalid signature may be produced.
	pub output: TxOut,
	/// The sighash type to commit to.
	pub hash_type: EcdsaSighashType,
	/// The index of the input being signed.
	pub input_index: usize,
}

/// A full spend witness for a single funding-transaction input, in the form
/// it travels over the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct InputScript {
	/// The (possibly empty) signature script.
	pub script_sig: Script,
	/// The witness stack.
	pub witness: Vec<Vec<u8>>,
}

/// An abstract object capable of producing raw signatures and complete
/// input scripts for transactions spending outputs it holds keys for.
pub trait Signer: Send + Sync {
	/// Generates a signature for the passed transaction according to the
	/// data within the descriptor.
	///
	/// The returned signature is DER-encoded and void of the trailing
	/// sighash-type byte.
	fn sign_output_raw<'a>(&self, tx: &'a Transaction, sign_desc: &SignDescriptor,
		sighashes: &mut SighashCache<&'a Transaction>) -> Result<Vec<u8>, ()>;

	/// Generates a complete input script, including any witness data, for
	/// the input described by the descriptor. Handles both regular p2wkh
	/// outputs and p2wkh outputs nested within p2sh.
	fn compute_input_script<'a>(&self, tx: &'a Transaction, sign_desc: &SignDescriptor,
		sighashes: &mut SighashCache<&'a Transaction>) -> Result<InputScript, ()>;

	/// Returns the secret counterpart of a public key previously handed out
	/// by the backing wallet. The channel state machine needs the commitment
	/// secret key directly in order to derive revocation private keys from
	/// revealed pre-images.
	fn derive_secret_key(&self, pubkey: &PublicKey) -> Result<SecretKey, ()>;
}
