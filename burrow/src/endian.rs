//! Byte order aware stream codec.
//!
//! Fixed width integers keep their sign, floats keep their exact IEEE-754 bit
//! pattern, and strings are framed as an `i32` byte length followed by UTF-8
//! without a BOM. The byte order is a type parameter, so one codebase reads
//! and writes both little and big endian streams.
use std::{
    io::{self, Read, Write},
    marker::PhantomData,
};

use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt};

pub use byteorder::{BigEndian, LittleEndian};

pub struct EndianWriter<W, O> {
    inner: W,
    _order: PhantomData<O>,
}

impl<W: Write, O: ByteOrder> EndianWriter<W, O> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            _order: PhantomData,
        }
    }

    pub fn write_i8(&mut self, value: i8) -> io::Result<()> {
        self.inner.write_i8(value)
    }

    pub fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.inner.write_u8(value)
    }

    pub fn write_i16(&mut self, value: i16) -> io::Result<()> {
        self.inner.write_i16::<O>(value)
    }

    pub fn write_u16(&mut self, value: u16) -> io::Result<()> {
        self.inner.write_u16::<O>(value)
    }

    pub fn write_i32(&mut self, value: i32) -> io::Result<()> {
        self.inner.write_i32::<O>(value)
    }

    pub fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.inner.write_u32::<O>(value)
    }

    pub fn write_i64(&mut self, value: i64) -> io::Result<()> {
        self.inner.write_i64::<O>(value)
    }

    pub fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.inner.write_u64::<O>(value)
    }

    pub fn write_f32(&mut self, value: f32) -> io::Result<()> {
        self.inner.write_u32::<O>(value.to_bits())
    }

    pub fn write_f64(&mut self, value: f64) -> io::Result<()> {
        self.inner.write_u64::<O>(value.to_bits())
    }

    pub fn write_string(&mut self, value: &str) -> io::Result<()> {
        let len = i32::try_from(value.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
        self.write_i32(len)?;
        self.inner.write_all(value.as_bytes())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct EndianReader<R, O> {
    inner: R,
    _order: PhantomData<O>,
}

impl<R: Read, O: ByteOrder> EndianReader<R, O> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            _order: PhantomData,
        }
    }

    pub fn read_i8(&mut self) -> io::Result<i8> {
        self.inner.read_i8()
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        self.inner.read_u8()
    }

    pub fn read_i16(&mut self) -> io::Result<i16> {
        self.inner.read_i16::<O>()
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        self.inner.read_u16::<O>()
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        self.inner.read_i32::<O>()
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        self.inner.read_u32::<O>()
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        self.inner.read_i64::<O>()
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        self.inner.read_u64::<O>()
    }

    pub fn read_f32(&mut self) -> io::Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> io::Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_string(&mut self) -> io::Result<String> {
        let len = self.read_i32()?;
        let len = usize::try_from(len).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("negative string length {len}"),
            )
        })?;
        let mut bytes = Vec::new();
        (&mut self.inner).take(len as u64).read_to_end(&mut bytes)?;
        if bytes.len() != len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        String::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fixed_width_layout_per_order() {
        let mut le = EndianWriter::<_, LittleEndian>::new(Vec::new());
        le.write_i32(-2).unwrap();
        le.write_u16(0x0102).unwrap();
        assert_eq!(le.into_inner(), vec![0xFE, 0xFF, 0xFF, 0xFF, 0x02, 0x01]);

        let mut be = EndianWriter::<_, BigEndian>::new(Vec::new());
        be.write_i32(-2).unwrap();
        be.write_u16(0x0102).unwrap();
        assert_eq!(be.into_inner(), vec![0xFF, 0xFF, 0xFF, 0xFE, 0x01, 0x02]);
    }

    #[test]
    fn test_string_framing() {
        let mut w = EndianWriter::<_, BigEndian>::new(Vec::new());
        w.write_string("héllo").unwrap();
        let bytes = w.into_inner();
        // 'é' is two bytes, no BOM in front
        assert_eq!(&bytes[..4], &[0, 0, 0, 6]);
        assert_eq!(&bytes[4..], "héllo".as_bytes());

        let mut r = EndianReader::<_, BigEndian>::new(Cursor::new(bytes));
        assert_eq!(r.read_string().unwrap(), "héllo");
    }

    #[test]
    fn test_every_primitive_reads_back_bit_exact() {
        fn roundtrip<O: ByteOrder>() {
            let nan = f64::from_bits(0x7FF8_0000_0000_0042);
            let mut w = EndianWriter::<_, O>::new(Vec::new());
            w.write_i8(-128).unwrap();
            w.write_u8(255).unwrap();
            w.write_i16(i16::MIN).unwrap();
            w.write_u32(0xDEAD_BEEF).unwrap();
            w.write_i64(-1).unwrap();
            w.write_u64(u64::MAX - 1).unwrap();
            w.write_f32(-0.0).unwrap();
            w.write_f64(nan).unwrap();
            w.write_string("").unwrap();

            let mut r = EndianReader::<_, O>::new(Cursor::new(w.into_inner()));
            assert_eq!(r.read_i8().unwrap(), -128);
            assert_eq!(r.read_u8().unwrap(), 255);
            assert_eq!(r.read_i16().unwrap(), i16::MIN);
            assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
            assert_eq!(r.read_i64().unwrap(), -1);
            assert_eq!(r.read_u64().unwrap(), u64::MAX - 1);
            assert_eq!(r.read_f32().unwrap().to_bits(), (-0.0f32).to_bits());
            assert_eq!(r.read_f64().unwrap().to_bits(), nan.to_bits());
            assert_eq!(r.read_string().unwrap(), "");
        }
        roundtrip::<LittleEndian>();
        roundtrip::<BigEndian>();
    }

    #[test]
    fn test_bad_string_frames() {
        let mut r = EndianReader::<_, LittleEndian>::new(Cursor::new(vec![0xFF, 0xFF, 0xFF, 0xFF]));
        assert_eq!(r.read_string().unwrap_err().kind(), io::ErrorKind::InvalidData);

        let mut r = EndianReader::<_, LittleEndian>::new(Cursor::new(vec![4, 0, 0, 0, b'a']));
        assert_eq!(r.read_string().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);

        let mut r = EndianReader::<_, LittleEndian>::new(Cursor::new(vec![1, 0, 0, 0, 0xC3]));
        assert_eq!(r.read_string().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
