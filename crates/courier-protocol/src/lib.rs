//! # courier-protocol
//!
//! Wire format for Courier cursor tokens.
//!
//! A cursor token tells the message bus, per topic, which message a
//! subscriber saw last. Clients treat it as opaque; the bus hands a fresh one
//! out with every delivered batch and accepts it back on resubscribe.
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::cursor::{self, CursorPosition};
//!
//! let token = cursor::encode(&[CursorPosition::new("chat", 1)]);
//! assert_eq!(token, "chat,0000000000000001");
//!
//! let decoded = cursor::decode(&token).unwrap();
//! assert_eq!(decoded[0].id, 1);
//! ```

pub mod cursor;

pub use cursor::{decode, encode, encode_updated, CursorError, CursorPosition, CursorWriter};
