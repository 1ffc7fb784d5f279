pub mod cdcrelay;
pub mod client;
pub mod error;
pub mod tlv;
