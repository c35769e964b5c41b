use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxOut};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::network::constants::Network;
use bitcoin::util::address::Address;
use bitcoin::util::sighash::SighashCache;
use bitcoin::{EcdsaSighashType, Txid, WPubkeyHash};

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signing};
use secp256k1;

use chain::assets::AssetData;
use chain::chaininterface::{AddressType, BlockChainIO, ChainNotifier, ConfirmationNtfn, Utxo,
	WalletController};
use chain::keysinterface::{InputScript, SignDescriptor, Signer};
use ln::chan_state::{ChannelPersister, OpenChannelState};
use util::errors::ChainError;
use util::logger::{Level, Logger, Record};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

pub struct TestLogger {
	level: Level,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		TestLogger { level: Level::Off }
	}

	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		if self.level >= record.level {
			println!("{:<5} [{} : {}] {}", record.level.to_string(), record.module_path,
				record.line, record.args);
		}
	}
}

/// A bag of keys shared between the test wallet controller and the test
/// signer, with deterministic derivation of fresh keys from a seed.
pub struct KeyStore {
	seed: [u8; 32],
	counter: u64,
	by_pubkey: HashMap<[u8; 33], SecretKey>,
	by_script: HashMap<Script, (PublicKey, SecretKey)>,
}

impl KeyStore {
	pub fn new(seed: [u8; 32]) -> KeyStore {
		KeyStore {
			seed,
			counter: 0,
			by_pubkey: HashMap::new(),
			by_script: HashMap::new(),
		}
	}

	pub fn register<C: Signing>(&mut self, secp_ctx: &Secp256k1<C>, secret: SecretKey) -> PublicKey {
		let public = PublicKey::from_secret_key(secp_ctx, &secret);
		self.by_pubkey.insert(public.serialize(), secret);
		let script = Script::new_v0_p2wpkh(&WPubkeyHash::hash(&public.serialize()));
		self.by_script.insert(script, (public, secret));
		public
	}

	pub fn next_key<C: Signing>(&mut self, secp_ctx: &Secp256k1<C>) -> PublicKey {
		loop {
			self.counter += 1;
			let mut engine = sha256::Hash::engine();
			engine.input(&self.seed[..]);
			engine.input(&self.counter.to_be_bytes());
			let bytes = sha256::Hash::from_engine(engine).into_inner();
			if let Ok(secret) = SecretKey::from_slice(&bytes) {
				return self.register(secp_ctx, secret);
			}
		}
	}

	pub fn secret_for(&self, public: &PublicKey) -> Option<SecretKey> {
		self.by_pubkey.get(&public.serialize()).cloned()
	}

	pub fn keys_for_script(&self, script: &Script) -> Option<(PublicKey, SecretKey)> {
		self.by_script.get(script).cloned()
	}
}

/// Produces the p2wkh witness spending the given input, the way a real
/// wallet would sign a funding contribution.
pub fn p2wkh_input_script<C: Signing>(secp_ctx: &Secp256k1<C>, secret: &SecretKey,
		public: &PublicKey, tx: &Transaction, input_index: usize, value: u64) -> InputScript {
	let script_code = Script::new_p2pkh(&::bitcoin::PublicKey::new(*public).pubkey_hash());
	let mut sighashes = SighashCache::new(tx);
	let sighash = sighashes.segwit_signature_hash(input_index, &script_code, value,
		EcdsaSighashType::All).unwrap();
	let msg = Message::from_slice(&sighash[..]).unwrap();
	let mut sig = secp_ctx.sign_ecdsa(&msg, secret).serialize_der().to_vec();
	sig.push(EcdsaSighashType::All.to_u32() as u8);
	InputScript {
		script_sig: Script::new(),
		witness: vec![sig, public.serialize().to_vec()],
	}
}

pub struct TestSigner {
	secp_ctx: Secp256k1<secp256k1::All>,
	keys: Arc<Mutex<KeyStore>>,
}

impl TestSigner {
	pub fn new(keys: Arc<Mutex<KeyStore>>) -> TestSigner {
		TestSigner { secp_ctx: Secp256k1::new(), keys }
	}
}

impl Signer for TestSigner {
	fn sign_output_raw<'a>(&self, _tx: &'a Transaction, sign_desc: &SignDescriptor,
			sighashes: &mut SighashCache<&'a Transaction>) -> Result<Vec<u8>, ()> {
		let public = sign_desc.pubkey.ok_or(())?;
		let secret = self.keys.lock().unwrap().secret_for(&public).ok_or(())?;
		let sighash = sighashes.segwit_signature_hash(sign_desc.input_index,
			&sign_desc.redeem_script, sign_desc.output.value, sign_desc.hash_type)
			.map_err(|_| ())?;
		let msg = Message::from_slice(&sighash[..]).map_err(|_| ())?;
		Ok(self.secp_ctx.sign_ecdsa(&msg, &secret).serialize_der().to_vec())
	}

	fn compute_input_script<'a>(&self, _tx: &'a Transaction, sign_desc: &SignDescriptor,
			sighashes: &mut SighashCache<&'a Transaction>) -> Result<InputScript, ()> {
		let (public, secret) = self.keys.lock().unwrap()
			.keys_for_script(&sign_desc.output.script_pubkey).ok_or(())?;
		let script_code = Script::new_p2pkh(&::bitcoin::PublicKey::new(public).pubkey_hash());
		let sighash = sighashes.segwit_signature_hash(sign_desc.input_index, &script_code,
			sign_desc.output.value, sign_desc.hash_type).map_err(|_| ())?;
		let msg = Message::from_slice(&sighash[..]).map_err(|_| ())?;
		let mut sig = self.secp_ctx.sign_ecdsa(&msg, &secret).serialize_der().to_vec();
		sig.push(sign_desc.hash_type.to_u32() as u8);
		Ok(InputScript {
			script_sig: Script::new(),
			witness: vec![sig, public.serialize().to_vec()],
		})
	}

	fn derive_secret_key(&self, public: &PublicKey) -> Result<SecretKey, ()> {
		self.keys.lock().unwrap().secret_for(public).ok_or(())
	}
}

/// An in-memory base wallet: a fixed set of asset-carrying outputs, key
/// derivation through a shared [`KeyStore`], and bookkeeping the tests can
/// assert against.
pub struct TestWalletController {
	secp_ctx: Secp256k1<secp256k1::All>,
	keys: Arc<Mutex<KeyStore>>,
	root_secret: SecretKey,
	utxos: Mutex<Vec<Utxo>>,
	outputs: Mutex<HashMap<OutPoint, TxOut>>,
	locked: Mutex<HashSet<OutPoint>>,
	published: Mutex<Vec<Transaction>>,
	list_calls: AtomicUsize,
}

impl TestWalletController {
	pub fn new(keys: Arc<Mutex<KeyStore>>, asset_id: &str, utxo_specs: &[(u8, u32, u64, u64)])
			-> TestWalletController {
		let secp_ctx = Secp256k1::new();
		let mut utxos = Vec::new();
		let mut outputs = HashMap::new();
		{
			let mut store = keys.lock().unwrap();
			for &(txid_byte, vout, value, asset_value) in utxo_specs {
				let public = store.next_key(&secp_ctx);
				let script = Script::new_v0_p2wpkh(&WPubkeyHash::hash(&public.serialize()));
				let outpoint = OutPoint::new(Txid::from_inner([txid_byte; 32]), vout);
				outputs.insert(outpoint, TxOut { value, script_pubkey: script });
				utxos.push(Utxo {
					value,
					asset: AssetData { asset_id: asset_id.to_string(), value: asset_value },
					outpoint,
				});
			}
		}
		TestWalletController {
			secp_ctx,
			keys,
			root_secret: SecretKey::from_slice(&[0x42; 32]).unwrap(),
			utxos: Mutex::new(utxos),
			outputs: Mutex::new(outputs),
			locked: Mutex::new(HashSet::new()),
			published: Mutex::new(Vec::new()),
			list_calls: AtomicUsize::new(0),
		}
	}

	pub fn published(&self) -> Vec<Transaction> {
		self.published.lock().unwrap().clone()
	}

	pub fn list_unspent_calls(&self) -> usize {
		self.list_calls.load(Ordering::SeqCst)
	}
}

impl WalletController for TestWalletController {
	fn fetch_input_info(&self, prev_out: &OutPoint) -> Result<TxOut, ChainError> {
		self.outputs.lock().unwrap().get(prev_out).cloned().ok_or(ChainError::NotMine)
	}

	fn confirmed_balance(&self, _confs: i32, _witness: bool) -> Result<u64, ChainError> {
		Ok(self.utxos.lock().unwrap().iter().map(|utxo| utxo.value).sum())
	}

	fn new_address(&self, _addr_type: AddressType, _change: bool) -> Result<Address, ChainError> {
		let public = self.keys.lock().unwrap().next_key(&self.secp_ctx);
		Address::p2wpkh(&::bitcoin::PublicKey::new(public), Network::Regtest)
			.map_err(|err| ChainError::Backend(err.to_string()))
	}

	fn new_raw_key(&self) -> Result<PublicKey, ChainError> {
		Ok(self.keys.lock().unwrap().next_key(&self.secp_ctx))
	}

	fn fetch_root_key(&self) -> Result<SecretKey, ChainError> {
		Ok(self.root_secret)
	}

	fn send_outputs(&self, _outputs: &[TxOut]) -> Result<Txid, ChainError> {
		Ok(Txid::from_inner([0; 32]))
	}

	fn list_unspent_witness(&self, _confirms: i32) -> Result<Vec<Utxo>, ChainError> {
		self.list_calls.fetch_add(1, Ordering::SeqCst);
		let locked = self.locked.lock().unwrap();
		Ok(self.utxos.lock().unwrap().iter()
			.filter(|utxo| !locked.contains(&utxo.outpoint))
			.cloned().collect())
	}

	fn lock_outpoint(&self, outpoint: OutPoint) {
		self.locked.lock().unwrap().insert(outpoint);
	}

	fn unlock_outpoint(&self, outpoint: OutPoint) {
		self.locked.lock().unwrap().remove(&outpoint);
	}

	fn publish_transaction(&self, tx: &Transaction) -> Result<(), ChainError> {
		self.published.lock().unwrap().push(tx.clone());
		Ok(())
	}

	fn start(&self) -> Result<(), ChainError> {
		Ok(())
	}

	fn stop(&self) -> Result<(), ChainError> {
		Ok(())
	}
}

pub struct TestBlockChainIO {
	height: Mutex<i32>,
	utxos: Mutex<HashMap<OutPoint, TxOut>>,
	transactions: Mutex<HashMap<Txid, Transaction>>,
}

impl TestBlockChainIO {
	pub fn new() -> TestBlockChainIO {
		TestBlockChainIO {
			height: Mutex::new(100),
			utxos: Mutex::new(HashMap::new()),
			transactions: Mutex::new(HashMap::new()),
		}
	}

	pub fn add_utxo(&self, outpoint: OutPoint, output: TxOut) {
		self.utxos.lock().unwrap().insert(outpoint, output);
	}
}

impl BlockChainIO for TestBlockChainIO {
	fn get_current_height(&self) -> Result<i32, ChainError> {
		Ok(*self.height.lock().unwrap())
	}

	fn get_utxo(&self, txid: &Txid, index: u32) -> Result<TxOut, ChainError> {
		self.utxos.lock().unwrap().get(&OutPoint::new(*txid, index)).cloned()
			.ok_or(ChainError::NotFound)
	}

	fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
		self.transactions.lock().unwrap().get(txid).cloned().ok_or(ChainError::NotFound)
	}
}

/// A confirmation notifier under test control: registrations queue up
/// until the test fires them. Registrations arriving after
/// [`confirm_all`](TestNotifier::confirm_all) confirm immediately, and
/// ones arriving after [`shutdown`](TestNotifier::shutdown) observe a
/// dropped sender straight away.
pub struct TestNotifier {
	pending: Mutex<Vec<(Txid, u32, mpsc::Sender<()>)>>,
	auto_confirm: AtomicBool,
	shut_down: AtomicBool,
}

impl TestNotifier {
	pub fn new() -> TestNotifier {
		TestNotifier {
			pending: Mutex::new(Vec::new()),
			auto_confirm: AtomicBool::new(false),
			shut_down: AtomicBool::new(false),
		}
	}

	pub fn confirm_all(&self) {
		self.auto_confirm.store(true, Ordering::SeqCst);
		for (_, _, sender) in self.pending.lock().unwrap().drain(..) {
			let _ = sender.send(());
		}
	}

	pub fn shutdown(&self) {
		self.shut_down.store(true, Ordering::SeqCst);
		self.pending.lock().unwrap().clear();
	}
}

impl ChainNotifier for TestNotifier {
	fn register_confirmations_ntfn(&self, txid: &Txid, num_confs: u32) -> ConfirmationNtfn {
		let (sender, receiver) = mpsc::channel();
		if self.shut_down.load(Ordering::SeqCst) {
			drop(sender);
		} else if self.auto_confirm.load(Ordering::SeqCst) {
			let _ = sender.send(());
		} else {
			self.pending.lock().unwrap().push((*txid, num_confs, sender));
		}
		ConfirmationNtfn { confirmed: receiver }
	}
}

pub struct TestChannelPersister {
	full_syncs: AtomicUsize,
	revocation_syncs: AtomicUsize,
	closes: AtomicUsize,
}

impl TestChannelPersister {
	pub fn new() -> TestChannelPersister {
		TestChannelPersister {
			full_syncs: AtomicUsize::new(0),
			revocation_syncs: AtomicUsize::new(0),
			closes: AtomicUsize::new(0),
		}
	}

	pub fn full_syncs(&self) -> usize {
		self.full_syncs.load(Ordering::SeqCst)
	}

	pub fn revocation_syncs(&self) -> usize {
		self.revocation_syncs.load(Ordering::SeqCst)
	}

	pub fn closes(&self) -> usize {
		self.closes.load(Ordering::SeqCst)
	}
}

impl ChannelPersister for TestChannelPersister {
	fn full_sync(&self, _state: &OpenChannelState) -> Result<(), String> {
		self.full_syncs.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	fn sync_revocation(&self, _state: &OpenChannelState) -> Result<(), String> {
		self.revocation_syncs.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	fn close_channel(&self, _channel_point: &OutPoint) -> Result<(), String> {
		self.closes.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}
