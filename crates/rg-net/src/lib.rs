//! rg-net: network voice logics
//!
//! Wire codecs and session state machines for the network-facing logic
//! variants:
//!
//! - USRP: 32 byte header datagrams carrying 160-sample voice frames,
//!   JSON/TLV metadata, pings and DTMF
//! - Rewind: framed protocol with challenge/response authentication and
//!   five second keep-alives
//! - SIP: call policy over an external SIP stack seam
//!
//! All sockets live in the event loop; these logics consume decoded
//! datagrams and queue encoded ones.

pub mod bridge;
mod error;
pub mod rewind;
pub mod rewind_logic;
pub mod sip;
pub mod usrp;
pub mod usrp_logic;

#[cfg(test)]
pub mod testsupport;

pub use bridge::NetBridge;
pub use error::{NetError, NetResult};
pub use rewind::RewindFrame;
pub use rewind_logic::RewindLogic;
pub use sip::{DnsResolver, NullDnsResolver, NullSipStack, SipCall, SipCallState, SipLogic, SipStack};
pub use usrp::{UsrpFrame, UsrpHeader, UsrpJsonMeta, UsrpTlvMeta};
pub use usrp_logic::UsrpLogic;
