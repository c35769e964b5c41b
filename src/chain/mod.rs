//! Module provides the interfaces the channel engine uses to reach the
//! outside world: the base wallet, the chain oracle, the confirmation
//! notifier, the signer and the colored-asset encoder.

pub mod chaininterface;
pub mod keysinterface;
pub mod assets;
