//! Byte-order aware primitive reads and writes.
//!
//! Packages are little-endian on disk unless written byte-swapped; a
//! swapped tag switches every later multi-byte field to big-endian.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

macro_rules! read_swapped {
    ($self:ident, $swap:ident, $method:ident) => {
        if $swap {
            $self.$method::<BigEndian>()
        } else {
            $self.$method::<LittleEndian>()
        }
    };
}

macro_rules! write_swapped {
    ($self:ident, $swap:ident, $method:ident, $value:ident) => {
        if $swap {
            $self.$method::<BigEndian>($value)
        } else {
            $self.$method::<LittleEndian>($value)
        }
    };
}

/// Reads with a runtime byte-order switch.
pub trait EndianRead: Read {
    fn read_i32_as(&mut self, swap: bool) -> io::Result<i32> {
        read_swapped!(self, swap, read_i32)
    }

    fn read_u32_as(&mut self, swap: bool) -> io::Result<u32> {
        read_swapped!(self, swap, read_u32)
    }

    fn read_i64_as(&mut self, swap: bool) -> io::Result<i64> {
        read_swapped!(self, swap, read_i64)
    }

    fn read_u64_as(&mut self, swap: bool) -> io::Result<u64> {
        read_swapped!(self, swap, read_u64)
    }
}

impl<R: Read + ?Sized> EndianRead for R {}

/// Writes with a runtime byte-order switch.
pub trait EndianWrite: Write {
    fn write_i32_as(&mut self, value: i32, swap: bool) -> io::Result<()> {
        write_swapped!(self, swap, write_i32, value)
    }

    fn write_u32_as(&mut self, value: u32, swap: bool) -> io::Result<()> {
        write_swapped!(self, swap, write_u32, value)
    }

    fn write_i64_as(&mut self, value: i64, swap: bool) -> io::Result<()> {
        write_swapped!(self, swap, write_i64, value)
    }

    fn write_u64_as(&mut self, value: u64, swap: bool) -> io::Result<()> {
        write_swapped!(self, swap, write_u64, value)
    }
}

impl<W: Write + ?Sized> EndianWrite for W {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_swapped_layout() {
        let mut buf = Vec::new();
        buf.write_u32_as(0x11223344, false).unwrap();
        buf.write_u32_as(0x11223344, true).unwrap();
        assert_eq!(&buf[..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[4..], &[0x11, 0x22, 0x33, 0x44]);

        let mut cur = Cursor::new(buf);
        assert_eq!(cur.read_u32_as(false).unwrap(), 0x11223344);
        assert_eq!(cur.read_u32_as(true).unwrap(), 0x11223344);
    }
}
