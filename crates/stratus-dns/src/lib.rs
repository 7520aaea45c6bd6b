//! DNS protocol building blocks for the stratus control-plane bridge.
//!
//! This crate holds the pieces of the DNS layer that do not depend on the
//! record store: conversions between stored records and wire records,
//! TSIG key handling, the out-of-band SOA fetcher, the outgoing NOTIFY
//! sender, and AXFR response chunking. The server crate wires them into
//! its listeners and handlers.

pub mod axfr;
pub mod client;
pub mod notify;
pub mod record;
pub mod soa;
pub mod tsig;

pub use record::WireRecord;
