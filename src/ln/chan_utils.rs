//! Pure constructors for the scripts a channel's transactions are built
//! from, plus the revocation key tweak both parties derive from revealed
//! elkrem pre-images.

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, Script};
use bitcoin::blockdata::transaction::{Transaction, TxOut};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::{EcdsaSighashType, WPubkeyHash};

use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Signing, Verification};
use secp256k1;

/// Wraps a redeem script into the pay-to-witness-script-hash output script
/// committing to it.
pub fn witness_script_hash(redeem_script: &Script) -> Script {
	redeem_script.to_v0_p2wsh()
}

/// Builds the 2-of-2 multi-sig redeem script anchoring a channel, along
/// with the funding output paying `amount` to its p2wsh wrapping.
///
/// The two keys are ordered canonically (by serialized bytes) so both
/// parties derive a byte-identical script without coordination.
pub fn gen_funding_pk_script(our_key: &PublicKey, their_key: &PublicKey, amount: u64) -> (Script, TxOut) {
	let our_ser = our_key.serialize();
	let their_ser = their_key.serialize();
	let (first, second) = if our_ser[..] < their_ser[..] {
		(our_ser, their_ser)
	} else {
		(their_ser, our_ser)
	};

	let redeem_script = Builder::new().push_opcode(opcodes::all::OP_PUSHNUM_2)
	                                  .push_slice(&first)
	                                  .push_slice(&second)
	                                  .push_opcode(opcodes::all::OP_PUSHNUM_2)
	                                  .push_opcode(opcodes::all::OP_CHECKMULTISIG)
	                                  .into_script();
	let funding_output = TxOut {
		value: amount,
		script_pubkey: witness_script_hash(&redeem_script),
	};
	(redeem_script, funding_output)
}

/// Builds the delayed "pay-to-self" commitment output script. The output
/// has two redemption clauses: the owner after a relative `csv_timeout`
/// delay, or the counterparty immediately with the revocation key should a
/// revoked commitment ever be broadcast.
pub fn commit_script_to_self(csv_timeout: u32, self_key: &PublicKey, revoke_key: &PublicKey) -> Script {
	Builder::new().push_opcode(opcodes::all::OP_IF)
	              .push_slice(&revoke_key.serialize())
	              .push_opcode(opcodes::all::OP_ELSE)
	              .push_int(csv_timeout as i64)
	              .push_opcode(opcodes::all::OP_CSV)
	              .push_opcode(opcodes::all::OP_DROP)
	              .push_slice(&self_key.serialize())
	              .push_opcode(opcodes::all::OP_ENDIF)
	              .push_opcode(opcodes::all::OP_CHECKSIG)
	              .into_script()
}

/// Builds the unencumbered pay-to-counterparty commitment output: a plain
/// p2wkh over the counterparty's commitment key, spendable immediately.
pub fn commit_script_unencumbered(key: &PublicKey) -> Script {
	Script::new_v0_p2wpkh(&WPubkeyHash::hash(&key.serialize()))
}

/// Builds the HTLC script for an offered (outgoing) HTLC on the sender's
/// commitment transaction.
///
/// The receiver can sweep the output with either the payment pre-image or
/// the revocation pre-image; the sender is refunded once the absolute
/// `timeout` passes and its own `csv_timeout` delay has been served.
pub fn sender_htlc_script(timeout: u32, csv_timeout: u32, sender_key: &PublicKey,
		receiver_key: &PublicKey, revocation_hash: &[u8; 32], payment_hash: &[u8; 32]) -> Script {
	Builder::new().push_opcode(opcodes::all::OP_IF)
	              .push_opcode(opcodes::all::OP_SIZE)
	              .push_int(32)
	              .push_opcode(opcodes::all::OP_EQUALVERIFY)
	              .push_opcode(opcodes::all::OP_SHA256)
	              .push_opcode(opcodes::all::OP_DUP)
	              .push_slice(&payment_hash[..])
	              .push_opcode(opcodes::all::OP_EQUAL)
	              .push_opcode(opcodes::all::OP_SWAP)
	              .push_slice(&revocation_hash[..])
	              .push_opcode(opcodes::all::OP_EQUAL)
	              .push_opcode(opcodes::all::OP_ADD)
	              .push_opcode(opcodes::all::OP_VERIFY)
	              .push_slice(&receiver_key.serialize())
	              .push_opcode(opcodes::all::OP_ELSE)
	              .push_int(timeout as i64)
	              .push_opcode(opcodes::all::OP_CLTV)
	              .push_int(csv_timeout as i64)
	              .push_opcode(opcodes::all::OP_CSV)
	              .push_opcode(opcodes::all::OP_2DROP)
	              .push_slice(&sender_key.serialize())
	              .push_opcode(opcodes::all::OP_ENDIF)
	              .push_opcode(opcodes::all::OP_CHECKSIG)
	              .into_script()
}

/// Builds the HTLC script for an accepted (incoming) HTLC on the
/// receiver's commitment transaction.
///
/// The receiver settles with the payment pre-image after serving its
/// `csv_timeout` delay; the sender reclaims the output either with the
/// revocation pre-image or after the absolute `timeout` passes.
pub fn receiver_htlc_script(timeout: u32, csv_timeout: u32, sender_key: &PublicKey,
		receiver_key: &PublicKey, revocation_hash: &[u8; 32], payment_hash: &[u8; 32]) -> Script {
	Builder::new().push_opcode(opcodes::all::OP_IF)
	              .push_opcode(opcodes::all::OP_SIZE)
	              .push_int(32)
	              .push_opcode(opcodes::all::OP_EQUALVERIFY)
	              .push_opcode(opcodes::all::OP_SHA256)
	              .push_slice(&payment_hash[..])
	              .push_opcode(opcodes::all::OP_EQUALVERIFY)
	              .push_int(csv_timeout as i64)
	              .push_opcode(opcodes::all::OP_CSV)
	              .push_opcode(opcodes::all::OP_DROP)
	              .push_slice(&receiver_key.serialize())
	              .push_opcode(opcodes::all::OP_ELSE)
	              .push_opcode(opcodes::all::OP_IF)
	              .push_opcode(opcodes::all::OP_SIZE)
	              .push_int(32)
	              .push_opcode(opcodes::all::OP_EQUALVERIFY)
	              .push_opcode(opcodes::all::OP_SHA256)
	              .push_slice(&revocation_hash[..])
	              .push_opcode(opcodes::all::OP_EQUALVERIFY)
	              .push_opcode(opcodes::all::OP_ELSE)
	              .push_int(timeout as i64)
	              .push_opcode(opcodes::all::OP_CLTV)
	              .push_opcode(opcodes::all::OP_DROP)
	              .push_opcode(opcodes::all::OP_ENDIF)
	              .push_slice(&sender_key.serialize())
	              .push_opcode(opcodes::all::OP_ENDIF)
	              .push_opcode(opcodes::all::OP_CHECKSIG)
	              .into_script()
}

/// Assembles the witness stack spending a 2-of-2 multi-sig output. Both
/// signatures are DER-encoded without the sighash byte; the stack carries
/// them in the order their keys appear within the redeem script, with the
/// extra empty element CHECKMULTISIG pops and the redeem script last.
pub fn spend_multisig(redeem_script: &Script, our_key: &PublicKey, our_sig: &[u8],
		their_key: &PublicKey, their_sig: &[u8]) -> Vec<Vec<u8>> {
	let mut our_sig = our_sig.to_vec();
	our_sig.push(EcdsaSighashType::All.to_u32() as u8);
	let mut their_sig = their_sig.to_vec();
	their_sig.push(EcdsaSighashType::All.to_u32() as u8);

	let (first_sig, second_sig) = if our_key.serialize()[..] < their_key.serialize()[..] {
		(our_sig, their_sig)
	} else {
		(their_sig, our_sig)
	};
	vec![Vec::new(), first_sig, second_sig, redeem_script.to_bytes()]
}

/// Locates the output paying to the given script within a transaction,
/// returning its index.
pub fn find_script_output_index(tx: &Transaction, script: &Script) -> Option<u32> {
	tx.output.iter().position(|txout| &txout.script_pubkey == script).map(|vout| vout as u32)
}

// The revocation tweak commits to both the commitment key and the
// pre-image: tweak = sha256(serialize(C) || r).
fn revocation_tweak(commit_key: &PublicKey, revoke_preimage: &[u8; 32]) -> Result<Scalar, secp256k1::Error> {
	let mut sha = sha256::Hash::engine();
	sha.input(&commit_key.serialize());
	sha.input(&revoke_preimage[..]);
	let hash = sha256::Hash::from_engine(sha).into_inner();
	Scalar::from_be_bytes(hash).map_err(|_| secp256k1::Error::InvalidTweak)
}

/// Derives the revocation public key from the counterparty's commitment key
/// and a revocation pre-image: `revoke_key = C + sha256(C ‖ r)·G`.
///
/// Only public data goes in, so either party can compute it; the private
/// counterpart requires both the commitment secret key and the pre-image,
/// which come to rest in one party's hands only after the revealing
/// revocation message.
pub fn derive_revocation_pubkey<C: Verification>(secp_ctx: &Secp256k1<C>, commit_key: &PublicKey,
		revoke_preimage: &[u8; 32]) -> Result<PublicKey, secp256k1::Error> {
	let tweak = revocation_tweak(commit_key, revoke_preimage)?;
	commit_key.add_exp_tweak(secp_ctx, &tweak)
}

/// Derives the revocation private key matching
/// [`derive_revocation_pubkey`]: `revoke_priv = c + sha256(C ‖ r) mod n`.
pub fn derive_revocation_privkey<C: Signing>(secp_ctx: &Secp256k1<C>, commit_secret: &SecretKey,
		revoke_preimage: &[u8; 32]) -> Result<SecretKey, secp256k1::Error> {
	let commit_key = PublicKey::from_secret_key(secp_ctx, commit_secret);
	let tweak = revocation_tweak(&commit_key, revoke_preimage)?;
	commit_secret.add_tweak(&tweak)
}

#[cfg(test)]
mod tests {
	use super::*;

	use secp256k1::Secp256k1;

	fn test_key(fill: u8) -> (SecretKey, PublicKey) {
		let secp_ctx = Secp256k1::new();
		let secret = SecretKey::from_slice(&[fill; 32]).unwrap();
		let public = PublicKey::from_secret_key(&secp_ctx, &secret);
		(secret, public)
	}

	#[test]
	fn revocation_keypair_is_consistent() {
		let secp_ctx = Secp256k1::new();
		let (commit_secret, commit_key) = test_key(11);
		let preimage = [42; 32];

		let revoke_pub = derive_revocation_pubkey(&secp_ctx, &commit_key, &preimage).unwrap();
		let revoke_priv = derive_revocation_privkey(&secp_ctx, &commit_secret, &preimage).unwrap();
		assert_eq!(PublicKey::from_secret_key(&secp_ctx, &revoke_priv), revoke_pub);

		// A different pre-image must land on a different key.
		let other = derive_revocation_pubkey(&secp_ctx, &commit_key, &[43; 32]).unwrap();
		assert_ne!(other, revoke_pub);
	}

	#[test]
	fn funding_script_is_symmetric() {
		let (_, key_a) = test_key(5);
		let (_, key_b) = test_key(6);

		let (redeem_ab, out_ab) = gen_funding_pk_script(&key_a, &key_b, 100_000);
		let (redeem_ba, out_ba) = gen_funding_pk_script(&key_b, &key_a, 100_000);
		assert_eq!(redeem_ab, redeem_ba);
		assert_eq!(out_ab, out_ba);
		assert_eq!(out_ab.script_pubkey, witness_script_hash(&redeem_ab));
		assert_eq!(out_ab.value, 100_000);

		// Exact template: OP_2 <low key> <high key> OP_2 OP_CHECKMULTISIG.
		let (first, second) = if key_a.serialize()[..] < key_b.serialize()[..] {
			(key_a, key_b)
		} else {
			(key_b, key_a)
		};
		let expected = ::hex::decode(format!("5221{}21{}52ae",
			::hex::encode(&first.serialize()[..]),
			::hex::encode(&second.serialize()[..]))).unwrap();
		assert_eq!(redeem_ab.to_bytes(), expected);
	}

	#[test]
	fn multisig_witness_follows_script_key_order() {
		let (_, key_a) = test_key(5);
		let (_, key_b) = test_key(6);
		let (redeem, _) = gen_funding_pk_script(&key_a, &key_b, 1);

		let sig_a = vec![0xaa; 70];
		let sig_b = vec![0xbb; 70];
		let witness = spend_multisig(&redeem, &key_a, &sig_a, &key_b, &sig_b);
		let flipped = spend_multisig(&redeem, &key_b, &sig_b, &key_a, &sig_a);

		assert_eq!(witness, flipped);
		assert_eq!(witness.len(), 4);
		assert!(witness[0].is_empty());
		assert_eq!(witness[3], redeem.to_bytes());
		// Sighash flag appended to both signatures.
		assert_eq!(*witness[1].last().unwrap(), EcdsaSighashType::All.to_u32() as u8);
		assert_eq!(*witness[2].last().unwrap(), EcdsaSighashType::All.to_u32() as u8);
	}

	#[test]
	fn htlc_scripts_commit_to_inputs() {
		let (_, sender) = test_key(7);
		let (_, receiver) = test_key(8);
		let payment_hash = [1; 32];
		let revocation_hash = [2; 32];

		let offered = sender_htlc_script(600, 144, &sender, &receiver, &revocation_hash, &payment_hash);
		let accepted = receiver_htlc_script(600, 144, &sender, &receiver, &revocation_hash, &payment_hash);
		assert_ne!(offered, accepted);

		// Any input change must alter the script.
		let other_hash = sender_htlc_script(600, 144, &sender, &receiver, &revocation_hash, &[3; 32]);
		assert_ne!(offered, other_hash);
		let other_timeout = sender_htlc_script(601, 144, &sender, &receiver, &revocation_hash, &payment_hash);
		assert_ne!(offered, other_timeout);
	}

	#[test]
	fn locates_output_after_wrapping() {
		use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
		use bitcoin::{PackedLockTime, Sequence, Txid, Witness};
		use bitcoin::hashes::Hash;

		let (_, key_a) = test_key(5);
		let (_, key_b) = test_key(6);
		let (_, funding_output) = gen_funding_pk_script(&key_a, &key_b, 42);

		let tx = Transaction {
			version: 2,
			lock_time: PackedLockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::new(Txid::from_inner([9; 32]), 0),
				script_sig: Script::new(),
				sequence: Sequence::MAX,
				witness: Witness::default(),
			}],
			output: vec![
				TxOut { value: 1, script_pubkey: commit_script_unencumbered(&key_a) },
				funding_output.clone(),
			],
		};
		assert_eq!(find_script_output_index(&tx, &funding_output.script_pubkey), Some(1));
		assert_eq!(find_script_output_index(&tx, &commit_script_unencumbered(&key_b)), None);
	}
}
