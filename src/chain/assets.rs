//! Colored-asset plumbing. The engine tracks asset-denominated values
//! natively; the actual on-chain encoding of asset transfers is delegated
//! to an external service behind the [`AssetEncoder`] trait.

use bitcoin::blockdata::transaction::Transaction;

use util::errors::ChainError;

/// The asset id and asset-denominated value carried by a transaction
/// output.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetData {
	/// Identifier of the asset riding on the output.
	pub asset_id: String,
	/// The output's value in asset units.
	pub value: u64,
}

/// Re-encodes a canonically sorted transaction's outputs into the colored
/// asset representation.
///
/// The engine constructs every funding, commitment and cooperative close
/// transaction with asset-denominated output values and runs it through the
/// encoder as the final construction step. An encoder for an OP_RETURN
/// based protocol would replace the output values with transfer
/// instructions; the [`IdentityEncoder`] leaves the transaction untouched.
/// Both channel parties must configure the same encoder or signature
/// exchange will fail.
pub trait AssetEncoder: Send + Sync {
	/// Returns the asset-encoded form of `tx`. `is_funding` distinguishes
	/// the funding transaction, whose outputs must retain spendable
	/// on-chain values, from commitment and close transactions.
	fn encode_outputs(&self, tx: Transaction, is_funding: bool) -> Result<Transaction, ChainError>;
}

/// An [`AssetEncoder`] which performs no re-encoding at all, for chains and
/// tests where output values are used as-is.
pub struct IdentityEncoder;

impl AssetEncoder for IdentityEncoder {
	fn encode_outputs(&self, tx: Transaction, _is_funding: bool) -> Result<Transaction, ChainError> {
		Ok(tx)
	}
}
