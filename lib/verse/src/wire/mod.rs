//! Byte-exact, endian-fixed wire layer: primitive codecs, the datagram
//! packet and the stream message framing.

pub mod codec;
pub mod message;
pub mod packet;

use std::io;

/// Augmented `io::Write` that is aware of the amount of remaining free
/// capacity in the destination. Packers must check capacity upfront and only
/// write when everything they intend to write fits.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the
/// source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}
