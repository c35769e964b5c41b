#![crate_name = "chromawallet"]

//! A colored-asset payment channel engine, in library form.
//!
//! The crate implements the two hard pieces of an off-chain payment channel
//! wallet: the funding reservation workflow which negotiates, assembles and
//! signs the channel funding transaction, and the commitment state machine
//! which advances a pair of asymmetric commitment transactions through a
//! pipelined sign/revoke protocol over a shared HTLC update log. Everything
//! else (the base wallet, chain access, confirmation notifications, channel
//! persistence and the peer wire protocol) is reached through the traits in
//! the `chain` module, so the engine can be embedded into an existing wallet
//! instead of shipping as a self-contained daemon.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

extern crate bitcoin;
extern crate secp256k1;
#[cfg(test)] extern crate hex;

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
