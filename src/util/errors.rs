//! Error types live here.

use std::fmt;

/// An error raised by one of the external-interface traits in the `chain`
/// module. Implementations translate their backend failures into one of
/// these variants before handing them to the engine.
#[derive(Clone, PartialEq)]
pub enum ChainError {
	/// The queried output is not under control of this wallet.
	NotMine,
	/// The queried object (transaction, output, key) could not be found.
	NotFound,
	/// The backing service failed, with a human-readable reason.
	Backend(String),
}

impl fmt::Debug for ChainError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			ChainError::NotMine => f.write_str("output does not belong to the wallet"),
			ChainError::NotFound => f.write_str("object not found"),
			ChainError::Backend(ref err) => write!(f, "backend failure: {}", err),
		}
	}
}

impl fmt::Display for ChainError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

/// An error returned by the channel funding reservation workflow. These are
/// local to the affected reservation, which stays in limbo (holding its
/// input locks) until cancelled unless noted otherwise.
#[derive(Clone, PartialEq)]
pub enum ReservationError {
	/// Coin selection could not gather enough outputs of the configured
	/// asset to meet the requested funding amount.
	InsufficientFunds,
	/// The given reservation id is not present in limbo.
	UnknownReservation,
	/// An HD key at one of the reserved derivation indexes could not be
	/// produced.
	KeyDerivationFailed,
	/// The signer failed to produce a signature or input script.
	SigningFailed,
	/// A counterparty signature parsed but did not verify.
	SignatureInvalid,
	/// The script engine rejected a funding input witness under standard
	/// verification flags.
	ScriptExecutionFailed(String),
	/// The chain oracle returned no output for a claimed previous outpoint.
	UtxoMissing,
	/// A failure in one of the underlying chain services.
	Chain(ChainError),
}

impl fmt::Debug for ReservationError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			ReservationError::InsufficientFunds => f.write_str("not enough available outputs to create funding transaction"),
			ReservationError::UnknownReservation => f.write_str("attempted to update non-existent funding state"),
			ReservationError::KeyDerivationFailed => f.write_str("unable to derive key at reserved index"),
			ReservationError::SigningFailed => f.write_str("signer failed to produce a signature"),
			ReservationError::SignatureInvalid => f.write_str("counterparty's signature is invalid"),
			ReservationError::ScriptExecutionFailed(ref err) => write!(f, "cannot validate transaction: {}", err),
			ReservationError::UtxoMissing => f.write_str("input to funding tx does not exist"),
			ReservationError::Chain(ref err) => write!(f, "chain failure: {}", err),
		}
	}
}

impl fmt::Display for ReservationError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

impl From<ChainError> for ReservationError {
	fn from(err: ChainError) -> ReservationError {
		ReservationError::Chain(err)
	}
}

/// An error returned by the channel state machine. Failures are fatal for
/// the affected operation but not for the channel itself; the persisted
/// channel state is left untouched and the caller decides whether to retry
/// or escalate to a dispute.
#[derive(Clone, PartialEq)]
pub enum ChannelError {
	/// The channel is closing or closed, the operation is disallowed.
	ChannelClosing,
	/// Signing a new commitment was attempted with the revocation window
	/// empty or fully consumed.
	NoRevocationWindow,
	/// The signer failed to produce a commitment signature.
	SigningFailed,
	/// A commitment signature parsed but did not verify.
	SignatureInvalid,
	/// A revocation pre-image is inconsistent with the elkrem receiver's
	/// previously accepted pre-images.
	ElkremMismatch,
	/// The revocation key derived from a revealed pre-image does not match
	/// the counterparty's current revocation key.
	KeyMismatch,
	/// The hash of a revealed pre-image does not match the counterparty's
	/// current revocation hash.
	HashMismatch,
	/// No un-settled HTLC with the given payment hash exists in the
	/// counterparty's update log.
	UnknownPaymentHash,
	/// A settle pre-image does not hash to the referenced HTLC's payment
	/// hash.
	InvalidPreimage,
	/// The referenced log entry does not exist.
	UnknownLogEntry,
	/// The script engine rejected the fully-signed transaction.
	ScriptExecutionFailed(String),
	/// Committing channel state to the persistence layer failed.
	PersistenceFailed(String),
}

impl fmt::Debug for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			ChannelError::ChannelClosing => f.write_str("channel is being closed, operation disallowed"),
			ChannelError::NoRevocationWindow => f.write_str("unable to sign new commitment, the current revocation window is exhausted"),
			ChannelError::SigningFailed => f.write_str("signer failed to produce a commitment signature"),
			ChannelError::SignatureInvalid => f.write_str("invalid commitment signature"),
			ChannelError::ElkremMismatch => f.write_str("revocation pre-image inconsistent with receiver tree"),
			ChannelError::KeyMismatch => f.write_str("revocation key mismatch"),
			ChannelError::HashMismatch => f.write_str("revocation hash mismatch"),
			ChannelError::UnknownPaymentHash => f.write_str("invalid payment hash"),
			ChannelError::InvalidPreimage => f.write_str("invalid payment pre-image"),
			ChannelError::UnknownLogEntry => f.write_str("non existent log entry"),
			ChannelError::ScriptExecutionFailed(ref err) => write!(f, "cannot validate transaction: {}", err),
			ChannelError::PersistenceFailed(ref err) => write!(f, "unable to persist channel state: {}", err),
		}
	}
}

impl fmt::Display for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}
