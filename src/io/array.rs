//! Bounded contiguous-buffer streams.

use super::{Readable, Writeable};

/// A [`Writeable`] over a caller-provided byte slice.
///
/// After a successful [`Writeable::write_finalize`], [`ArrayWrite::written_len`]
/// reports the committed record length; the next write starts a fresh record
/// at the beginning of the slice.
pub struct ArrayWrite<'a> {
	buf: &'a mut [u8],
	len: usize,
	written: usize,
	overflow: bool,
}

impl<'a> ArrayWrite<'a> {
	pub fn new(buf: &'a mut [u8]) -> Self {
		ArrayWrite {
			buf,
			len: 0,
			written: 0,
			overflow: false,
		}
	}

	/// Length of the most recently committed record.
	pub fn written_len(&self) -> usize {
		self.written
	}

	/// The committed record contents.
	pub fn written(&self) -> &[u8] {
		&self.buf[..self.written]
	}
}

impl Writeable for ArrayWrite<'_> {
	fn space(&self) -> usize {
		if self.overflow {
			0
		} else {
			self.buf.len() - self.len
		}
	}

	fn write_next(&mut self, byte: u8) {
		if self.overflow || self.len >= self.buf.len() {
			self.overflow = true;
		} else {
			self.buf[self.len] = byte;
			self.len += 1;
		}
	}

	fn write_overflow(&mut self) {
		self.overflow = true;
	}

	fn write_finalize(&mut self) -> bool {
		let ok = !self.overflow;
		self.written = if ok { self.len } else { 0 };
		self.len = 0;
		self.overflow = false;
		ok
	}

	fn write_abort(&mut self) {
		self.len = 0;
		self.overflow = false;
	}

	fn write_bytes(&mut self, data: &[u8]) {
		if self.space() >= data.len() {
			self.buf[self.len..self.len + data.len()].copy_from_slice(data);
			self.len += data.len();
		} else {
			self.overflow = true;
		}
	}
}

/// A [`Readable`] over a borrowed byte slice.
///
/// The whole slice is one committed record; [`Readable::read_finalize`]
/// rewinds so the record may be read again.
pub struct ArrayRead<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> ArrayRead<'a> {
	pub fn new(buf: &'a [u8]) -> Self {
		ArrayRead { buf, pos: 0 }
	}
}

impl Readable for ArrayRead<'_> {
	fn bytes_ready(&self) -> usize {
		self.buf.len() - self.pos
	}

	fn read_next(&mut self) -> Option<u8> {
		let b = self.buf.get(self.pos).copied();
		if b.is_some() {
			self.pos += 1;
		}
		b
	}

	fn read_finalize(&mut self) {
		self.pos = 0;
	}

	fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
		if self.bytes_ready() < dst.len() {
			return false;
		}
		dst.copy_from_slice(&self.buf[self.pos..self.pos + dst.len()]);
		self.pos += dst.len();
		true
	}

	fn read_consume(&mut self, n: usize) -> bool {
		if self.bytes_ready() < n {
			return false;
		}
		self.pos += n;
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn overflow_discards_record() {
		let mut raw = [0u8; 4];
		let mut w = ArrayWrite::new(&mut raw);
		w.write_bytes(&[1, 2, 3, 4, 5]);
		assert_eq!(w.space(), 0); // poisoned until finalize or abort
		w.write_u8(9);
		assert!(!w.write_finalize());
		assert_eq!(w.written_len(), 0);
		// The sink is usable again after the failed finalize.
		w.write_bytes(&[7, 8]);
		assert!(w.write_finalize());
		assert_eq!(w.written(), &[7, 8]);
	}

	#[test]
	fn abort_resets() {
		let mut raw = [0u8; 4];
		let mut w = ArrayWrite::new(&mut raw);
		w.write_bytes(&[1, 2, 3]);
		w.write_abort();
		w.write_bytes(&[4, 4, 4, 4]);
		assert!(w.write_finalize());
		assert_eq!(w.written(), &[4, 4, 4, 4]);
	}

	#[test]
	fn finalize_rewinds_reader() {
		let src = [1u8, 2, 3];
		let mut r = ArrayRead::new(&src);
		assert_eq!(r.read_u16(), Some(0x0102));
		r.read_finalize();
		assert_eq!(r.bytes_ready(), 3);
		assert_eq!(r.read_u8(), Some(1));
	}

	#[test]
	fn underflow_reads_nothing() {
		let src = [1u8, 2];
		let mut r = ArrayRead::new(&src);
		assert_eq!(r.read_u32(), None);
		// Failed composite read must not consume the prefix.
		assert_eq!(r.bytes_ready(), 2);
		assert_eq!(r.read_u16(), Some(0x0102));
	}
}
