pub mod bitfield;
pub mod connection;
pub mod handshake;
pub mod message;

pub use bitfield::Bitfield;
pub use connection::PeerConnection;
pub use message::Message;
