//! Traits which allow the channel engine to interact with a base wallet and
//! the blockchain.
//!
//! The engine is deliberately wallet-agnostic: a pure library wallet, an RPC
//! bridge, or a hardware-assisted wallet can all drive a channel as long as
//! they implement [`WalletController`]. Chain queries flow through
//! [`BlockChainIO`] and confirmation events through [`ChainNotifier`].

use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxOut};
use bitcoin::util::address::Address;
use bitcoin::Txid;

use secp256k1::{PublicKey, SecretKey};

use chain::assets::AssetData;
use util::config::WalletConfig;
use util::errors::ChainError;

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

/// The possible address kinds a [`WalletController`] can produce.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AddressType {
	/// A p2wkh address.
	WitnessPubKey,
	/// A p2wkh output nested within a p2sh output.
	NestedWitnessPubKey,
	/// A regular p2pkh address.
	PubKeyHash,
}

/// An unspent output together with the colored-asset data riding on it.
#[derive(Clone, Debug)]
pub struct Utxo {
	/// The on-chain value of the output, in satoshis.
	pub value: u64,
	/// The asset id and asset-denominated value carried by the output.
	pub asset: AssetData,
	/// The outpoint of the output.
	pub outpoint: OutPoint,
}

/// An abstract interface to a base wallet controlling on-chain funds.
///
/// The engine layers channel awareness on top: key material, coin listing,
/// outpoint locking, and broadcasting are all proxied here. Implementors
/// must closely adhere to the documented behavior of each method, as the
/// funding workflow depends on it for safety.
pub trait WalletController: Send + Sync {
	/// Returns the output referenced by the passed outpoint if the wallet
	/// controls it, and `ChainError::NotMine` otherwise.
	fn fetch_input_info(&self, prev_out: &OutPoint) -> Result<TxOut, ChainError>;

	/// Returns the sum of all unspent outputs with at least `confs`
	/// confirmations, optionally restricted to witness outputs. Zero confs
	/// includes mempool outputs.
	fn confirmed_balance(&self, confs: i32, witness: bool) -> Result<u64, ChainError>;

	/// Returns the next external (or, when `change` is set, internal)
	/// address of the requested type.
	fn new_address(&self, addr_type: AddressType, change: bool) -> Result<Address, ChainError>;

	/// Returns the next raw key controlled by the wallet. These back the
	/// 2-of-2 multi-sig funding outputs and the commitment outputs.
	fn new_raw_key(&self) -> Result<PublicKey, ChainError>;

	/// Returns a root key used to deterministically generate channel
	/// secrets. Must remain constant across restarts.
	fn fetch_root_key(&self) -> Result<SecretKey, ChainError>;

	/// Funds, signs, and broadcasts a transaction paying to the passed
	/// outputs, returning its txid.
	fn send_outputs(&self, outputs: &[TxOut]) -> Result<Txid, ChainError>;

	/// Returns all unspent version-0 witness outputs with at least
	/// `confirms` confirmations, excluding currently locked outpoints.
	/// Passing -1 includes unconfirmed outputs.
	fn list_unspent_witness(&self, confirms: i32) -> Result<Vec<Utxo>, ChainError>;

	/// Marks an outpoint ineligible for coin selection until unlocked.
	fn lock_outpoint(&self, outpoint: OutPoint);

	/// Reverses a previous [`lock_outpoint`](WalletController::lock_outpoint) call.
	fn unlock_outpoint(&self, outpoint: OutPoint);

	/// Performs cursory validation of the passed transaction and broadcasts
	/// it to the network.
	fn publish_transaction(&self, tx: &Transaction) -> Result<(), ChainError>;

	/// Initializes the wallet, establishing any required connections.
	fn start(&self) -> Result<(), ChainError>;

	/// Signals the wallet for shutdown.
	fn stop(&self) -> Result<(), ChainError>;
}

/// A dedicated, always-up-to-date source for queries about the current
/// state of the blockchain.
pub trait BlockChainIO: Send + Sync {
	/// Returns the height of the best known chain.
	fn get_current_height(&self) -> Result<i32, ChainError>;

	/// Returns the output referenced by the passed txid and index, erroring
	/// with `ChainError::NotFound` if it has been spent or never existed.
	fn get_utxo(&self, txid: &Txid, index: u32) -> Result<TxOut, ChainError>;

	/// Returns the full transaction with the passed txid.
	fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError>;
}

/// A pending confirmation notification, as returned by
/// [`ChainNotifier::register_confirmations_ntfn`].
///
/// A message on `confirmed` means the watched transaction reached the
/// requested depth. The sender half being dropped without a message means
/// the notifier shut down before the depth was reached.
pub struct ConfirmationNtfn {
	/// Yields one event when the registered confirmation depth is reached.
	pub confirmed: mpsc::Receiver<()>,
}

/// An interface for requesting a one-shot notification once a transaction
/// reaches a confirmation depth.
pub trait ChainNotifier: Send + Sync {
	/// Registers an intent to be notified once `txid` reaches `num_confs`
	/// confirmations.
	fn register_confirmations_ntfn(&self, txid: &Txid, num_confs: u32) -> ConfirmationNtfn;
}

/// A "driver" for a particular concrete [`WalletController`]
/// implementation, identified by a unique name.
pub struct WalletDriver {
	/// Uniquely identifies the WalletController this driver drives.
	pub wallet_type: String,
	/// Creates a new instance of the concrete WalletController from the
	/// wallet configuration.
	pub new: Box<dyn Fn(&WalletConfig) -> Result<Arc<dyn WalletController>, ChainError> + Send + Sync>,
}

/// The set of registered wallet drivers. Owned by the application's
/// composition root and handed to whichever component instantiates the
/// wallet; there is no process-global registry.
pub struct WalletDriverRegistry {
	drivers: HashMap<String, WalletDriver>,
}

impl WalletDriverRegistry {
	/// Creates an empty registry.
	pub fn new() -> WalletDriverRegistry {
		WalletDriverRegistry { drivers: HashMap::new() }
	}

	/// Registers a driver, erroring if one with the same type name already
	/// exists.
	pub fn register_wallet(&mut self, driver: WalletDriver) -> Result<(), ChainError> {
		if self.drivers.contains_key(&driver.wallet_type) {
			return Err(ChainError::Backend("wallet already registered".to_string()));
		}
		self.drivers.insert(driver.wallet_type.clone(), driver);
		Ok(())
	}

	/// Looks up the driver registered under the given type name.
	pub fn driver(&self, wallet_type: &str) -> Option<&WalletDriver> {
		self.drivers.get(wallet_type)
	}

	/// Returns the names of all registered drivers.
	pub fn supported_wallets(&self) -> Vec<String> {
		self.drivers.keys().cloned().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn noop_driver(name: &str) -> WalletDriver {
		WalletDriver {
			wallet_type: name.to_string(),
			new: Box::new(|_| Err(ChainError::Backend("not wired up".to_string()))),
		}
	}

	#[test]
	fn registry_rejects_duplicate_drivers() {
		let mut registry = WalletDriverRegistry::new();
		registry.register_wallet(noop_driver("btcd")).unwrap();
		assert!(registry.register_wallet(noop_driver("btcd")).is_err());
		assert!(registry.driver("btcd").is_some());
		assert_eq!(registry.supported_wallets(), vec!["btcd".to_string()]);
	}
}
