// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod error;
pub mod nat;
pub mod pex;
pub mod protocol;
pub mod service;
pub mod session;

use bitvec::prelude::{BitVec, Msb0};

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A peer-disclosed piece-availability bitfield.
///
/// Stored most significant bit first, so the first highest bit represents the
/// first piece, the second highest bit the second piece, and so on (e.g.
/// `0b1100_0001` means the peer has pieces 0, 1, and 7).
pub type Bitfield = BitVec<Msb0, u8>;
