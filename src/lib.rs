#![cfg_attr(not(feature = "std"), no_std)]

//! Reader-side ISO/IEC 7816-3 smart-card communication stack: cold-reset
//! and ATR acquisition, PTS/PPS negotiation, and the T=0 and T=1 APDU
//! transmission protocols.
//!
//! The hardware driver (USART in smart-card mode, RST/VCC/presence GPIOs,
//! the microsecond tick source) is out of scope; [`hal`] defines the
//! traits a board support crate implements to plug into [`session`].

pub mod apdu;
pub mod atr;
pub mod channel;
pub mod clock;
pub mod error;
pub mod hal;
#[cfg(test)]
pub(crate) mod mock;
pub mod pts;
pub mod session;
pub mod t0;
pub mod t1;
pub mod timing;

pub use apdu::{ApduCommand, ApduResponse, LeEncoding};
pub use atr::{Atr, InterfaceBytes};
pub use error::{ProtocolError, Result};
pub use session::{
    early_init, init, is_inserted, lost, register_removal_handler, send_apdu, CardKind,
    CardSession, FsmState, InitFlags, RemovalHandler,
};
pub use timing::Convention;
