pub mod bootstrap;
pub mod channel;
pub mod client;
pub mod framing;
pub mod packages;
pub mod proto;
