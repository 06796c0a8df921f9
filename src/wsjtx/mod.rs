//! Decoder-app wire codec: Qt primitive layer plus framed messages.
pub mod msg;
pub mod qt;

pub use msg::{decode_datagram, Color, Command, Configure};
