//! Process-wide wallet configuration. Passed to the wallet at construction
//! rather than read from the environment, so the composition root stays in
//! control of every knob.

use bitcoin::network::constants::Network;

/// Top-level configuration for a [`LightningWallet`](::ln::wallet::LightningWallet).
///
/// A wallet operates on a single colored asset: coin selection only
/// considers outputs carrying `asset_id`, and every capacity, balance and
/// HTLC amount inside the engine is denominated in that asset's units.
#[derive(Clone, Debug)]
pub struct WalletConfig {
	/// The chain the wallet operates on.
	pub network: Network,
	/// The asset identifier outputs must carry to be eligible for funding
	/// transactions.
	pub asset_id: String,
	/// Fee debited from the closure initiator's output when building the
	/// cooperative close transaction.
	pub close_fee: u64,
	/// Minimum confirmations an output needs before coin selection will
	/// consider it.
	pub funding_confs: i32,
}

impl WalletConfig {
	/// Creates a configuration for the given network and asset with default
	/// fee and confirmation settings.
	pub fn new(network: Network, asset_id: String) -> WalletConfig {
		WalletConfig {
			network,
			asset_id,
			..Default::default()
		}
	}
}

impl Default for WalletConfig {
	fn default() -> WalletConfig {
		WalletConfig {
			network: Network::Testnet,
			asset_id: String::new(),
			close_fee: 0,
			funding_confs: 1,
		}
	}
}
