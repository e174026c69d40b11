// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

// Block wire format.
//
// The forward stream starts at byte 0 of the buffer:
// [NSEG: 2] then per segment
// [KIND | STRALIGN << 2 | (NSTR & 7) << 5: 1][NSTR >> 3: 1]
// followed by the segment's strings and, for kinds 2 and 3, the fork.
// KIND: 0 = string only, 1 = remote, 2 = fork, 3 = stop + fork.
//
// String record:
// [HAS_STOP | EXT << 1 | BITLEN << 2: 1 or 2 (LE, when EXT)] then
// ceil((BITLEN + align) / 8) payload bytes, where align chains from the
// segment's STRALIGN through the preceding string lengths.
//
// Fork record, bit packed LSB first, padded to a byte:
// [FANOUT - 2: W][SEGIDX: FANOUT x W][SHORTHAND: FANOUT x 4]
// W is the bit length of NSEG.
//
// Remote pointers live in a reverse growing region at the buffer end and
// are never compressed: [BLOCK: 8 LE][GEN: 8 LE], the first remote in
// segment order occupying the final 16 bytes. When compression is on, the
// forward stream (including NSEG) is wrapped in gzip whole.
//
// The two regions share the buffer capacity; marshalling a block whose
// cursors would meet fails with ShortWrite, the signal to subdivide.

use std::io::{Read, Write};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use crate::{
	bucket::{Block, Buf},
	error::{Error, Result},
	node::{ForkElem, Fork, Node, Remote, Segment, Str, Tail},
};

pub(crate) const SEGCOUNT_SIZE: usize = 2;
pub(crate) const REMOTE_SIZE: usize = 16;
pub(crate) const MAX_STR_BITS: u64 = (1 << 14) - 1;
// gzip header and trailer bytes around the forward stream.
pub(crate) const GZIP_OVERHEAD: usize = 18;

pub(crate) fn bit_len(n: u64) -> u32 {
	64 - n.leading_zeros()
}

struct BitWriter {
	cur: u8,
	used: u32,
}

impl BitWriter {
	fn new() -> BitWriter {
		BitWriter { cur: 0, used: 0 }
	}

	fn put<W: Write>(&mut self, w: &mut W, mut v: u32, width: u32) -> std::io::Result<()> {
		let mut left = width;
		while left > 0 {
			let take = (8 - self.used).min(left);
			self.cur |= ((v & ((1u32 << take) - 1)) as u8) << self.used;
			v >>= take;
			self.used += take;
			left -= take;
			if self.used == 8 {
				w.write_all(&[self.cur])?;
				self.cur = 0;
				self.used = 0;
			}
		}
		Ok(())
	}

	fn pad<W: Write>(&mut self, w: &mut W) -> std::io::Result<()> {
		if self.used > 0 {
			w.write_all(&[self.cur])?;
			self.cur = 0;
			self.used = 0;
		}
		Ok(())
	}
}

struct BitReader {
	cur: u8,
	avail: u32,
}

impl BitReader {
	fn new() -> BitReader {
		BitReader { cur: 0, avail: 0 }
	}

	fn get(&mut self, r: &mut Reader, width: u32) -> Result<u32> {
		let mut v = 0u32;
		let mut got = 0;
		while got < width {
			if self.avail == 0 {
				self.cur = r.read_fwd(1)?[0];
				self.avail = 8;
			}
			let take = (width - got).min(self.avail);
			v |= ((self.cur & ((1u32 << take) - 1) as u8) as u32) << got;
			self.cur >>= take;
			self.avail -= take;
			got += take;
		}
		Ok(v)
	}
}

/// Forward and reverse reads over one block. When both sides share the raw
/// buffer the cursors must not meet; a decompressed forward stream is
/// bounded on its own.
struct Reader<'a> {
	fwd: &'a [u8],
	fwd_off: usize,
	rev: &'a [u8],
	rev_off: usize,
	shared: bool,
}

impl<'a> Reader<'a> {
	fn read_fwd(&mut self, n: usize) -> Result<&'a [u8]> {
		let end = self.fwd_off + n;
		let over = if self.shared { end + self.rev_off >= self.fwd.len() } else { end > self.fwd.len() };
		if over {
			return Err(Error::ShortRead);
		}
		let out = &self.fwd[self.fwd_off..end];
		self.fwd_off = end;
		Ok(out)
	}

	fn read_rev_remote(&mut self) -> Result<Remote> {
		let pos = self.rev_off;
		let end = self
			.rev
			.len()
			.checked_sub(self.rev_off)
			.filter(|end| *end >= REMOTE_SIZE && (!self.shared || end - REMOTE_SIZE > self.fwd_off))
			.ok_or(Error::ShortRead)?;
		let start = end - REMOTE_SIZE;
		let mut word = [0u8; 8];
		word.copy_from_slice(&self.rev[start..start + 8]);
		let bn = u64::from_le_bytes(word);
		word.copy_from_slice(&self.rev[start + 8..end]);
		let gen = u64::from_le_bytes(word);
		self.rev_off += REMOTE_SIZE;
		Ok(Remote { bn, gen, pos: pos as u32 })
	}
}

fn write_segments<W: Write>(node: &Node, w: &mut W) -> std::io::Result<()> {
	let nseg = node.segs.len();
	let ptrwidth = bit_len(nseg as u64);
	w.write_all(&(nseg as u16).to_le_bytes())?;
	for seg in &node.segs {
		let nstr = seg.strings.len();
		let b0 = seg.tail.kind() | (((seg.stralign & 7) as u8) << 2) | (((nstr & 7) as u8) << 5);
		w.write_all(&[b0, (nstr >> 3) as u8])?;
		let mut align = seg.stralign;
		for s in &seg.strings {
			debug_assert_eq!(s.align, align);
			if s.bitlen < 64 {
				w.write_all(&[(s.has_stop as u8) | ((s.bitlen as u8) << 2)])?;
			} else {
				let h = (s.has_stop as u16) | 2 | ((s.bitlen as u16) << 2);
				w.write_all(&h.to_le_bytes())?;
			}
			debug_assert_eq!(s.bits.len() as u64, (s.bitlen + align as u64 + 7) / 8);
			w.write_all(&s.bits)?;
			align = ((align as u64 + s.bitlen) & 7) as u32;
		}
		if let Some(fork) = seg.tail.fork() {
			let mut bw = BitWriter::new();
			bw.put(w, fork.fanout() as u32 - 2, ptrwidth)?;
			for e in &fork.elems {
				bw.put(w, e.segidx, ptrwidth)?;
			}
			for e in &fork.elems {
				bw.put(w, e.shorthand_match.min(15), 4)?;
			}
			bw.pad(w)?;
		}
	}
	Ok(())
}

fn check_node(node: &Node) -> Result<()> {
	let nseg = node.segs.len();
	if nseg > u16::MAX as usize {
		return Err(Error::InvalidArgument(format!("{} segments in one block", nseg)));
	}
	for seg in &node.segs {
		if seg.strings.len() >= (1 << 11) {
			return Err(Error::InvalidArgument("too many strings in segment".into()));
		}
		for s in &seg.strings {
			if s.bitlen > MAX_STR_BITS {
				return Err(Error::InvalidArgument("oversized string".into()));
			}
		}
		if let Some(fork) = seg.tail.fork() {
			if fork.fanout() < 2 {
				return Err(Error::Corrupt("fork fanout below 2".into()));
			}
			for e in &fork.elems {
				if e.segidx as usize >= nseg {
					return Err(Error::Corrupt(format!("fork child {} out of range", e.segidx)));
				}
			}
		}
	}
	Ok(())
}

/// Serialize into a buffer of exactly `bufsize` bytes. Fails with
/// `ShortWrite` when the forward stream and the remote region would meet.
pub(crate) fn marshal(node: &Node, bufsize: usize, compressed: bool) -> Result<Vec<u8>> {
	check_node(node)?;
	let remotes: Vec<Remote> =
		node.segs.iter().filter_map(|seg| seg.tail.remote().copied()).collect();
	let rev_len = remotes.len() * REMOTE_SIZE;

	let mut fwd = Vec::with_capacity(bufsize);
	if compressed {
		let mut enc = GzEncoder::new(&mut fwd, Compression::default());
		write_segments(node, &mut enc)?;
		enc.finish()?;
	} else {
		write_segments(node, &mut fwd)?;
	}
	if fwd.len() + rev_len >= bufsize {
		return Err(Error::ShortWrite);
	}

	let mut out = vec![0u8; bufsize];
	out[..fwd.len()].copy_from_slice(&fwd);
	for (i, r) in remotes.iter().enumerate() {
		let end = bufsize - i * REMOTE_SIZE;
		out[end - 16..end - 8].copy_from_slice(&r.bn.to_le_bytes());
		out[end - 8..end].copy_from_slice(&r.gen.to_le_bytes());
	}
	Ok(out)
}

fn parse_segments(r: &mut Reader) -> Result<Vec<Segment>> {
	let mut word = [0u8; 2];
	word.copy_from_slice(r.read_fwd(SEGCOUNT_SIZE)?);
	let nseg = u16::from_le_bytes(word) as usize;
	let ptrwidth = bit_len(nseg as u64);

	let mut segs = Vec::with_capacity(nseg);
	for _ in 0..nseg {
		let h = r.read_fwd(2)?;
		let kind = h[0] & 3;
		let stralign = ((h[0] >> 2) & 7) as u32;
		let nstr = (((h[0] >> 5) & 7) as usize) | ((h[1] as usize) << 3);

		let mut strings = Vec::with_capacity(nstr);
		let mut align = stralign;
		for _ in 0..nstr {
			let b0 = r.read_fwd(1)?[0];
			let has_stop = b0 & 1 == 1;
			let mut bitlen = (b0 >> 2) as u64;
			if b0 & 2 != 0 {
				bitlen |= (r.read_fwd(1)?[0] as u64) << 6;
			}
			let nbytes = ((bitlen + align as u64 + 7) / 8) as usize;
			let bits = r.read_fwd(nbytes)?.to_vec();
			strings.push(Str { has_stop, bitlen, align, bits });
			align = ((align as u64 + bitlen) & 7) as u32;
		}

		let tail = match kind {
			0 => Tail::None,
			1 => Tail::Remote(r.read_rev_remote()?),
			_ => {
				let mut br = BitReader::new();
				let fanout = br.get(r, ptrwidth)? as usize + 2;
				let mut elems = Vec::with_capacity(fanout);
				for _ in 0..fanout {
					let segidx = br.get(r, ptrwidth)?;
					if segidx as usize >= nseg {
						return Err(Error::Corrupt(format!(
							"fork child {} out of range",
							segidx
						)));
					}
					elems.push(ForkElem { segidx, shorthand_match: 0 });
				}
				for e in elems.iter_mut() {
					e.shorthand_match = br.get(r, 4)?;
				}
				let fork = Fork { elems };
				if kind == 2 {
					Tail::Fork(fork)
				} else {
					Tail::StopFork(fork)
				}
			}
		};
		segs.push(Segment { stralign, strings, tail });
	}
	Ok(segs)
}

pub(crate) fn demarshal(data: &[u8], compressed: bool) -> Result<Node> {
	let segs = if compressed {
		let mut fwd = Vec::new();
		let limit = data.len() as u64 * 32 + 1024;
		GzDecoder::new(data)
			.take(limit)
			.read_to_end(&mut fwd)
			.map_err(|e| Error::Corrupt(format!("bad compressed stream: {}", e)))?;
		let mut r = Reader { fwd: &fwd, fwd_off: 0, rev: data, rev_off: 0, shared: false };
		parse_segments(&mut r)?
	} else {
		let mut r = Reader { fwd: data, fwd_off: 0, rev: data, rev_off: 0, shared: true };
		parse_segments(&mut r)?
	};
	let mut node = Node::empty();
	node.segs = segs;
	Ok(node)
}

/// Parse a fetched buffer, keeping a reference to it so remote positions
/// in the reverse region stay addressable.
pub(crate) fn parse_block(buf: &Buf, address: Block, compressed: bool) -> Result<Node> {
	let mut node = demarshal(&buf.bytes(), compressed)?;
	node.address = address;
	node.buf = Some(buf.clone());
	Ok(node)
}

/// Re-read the remote pointer stored at reverse offset `pos` of a buffer.
pub(crate) fn remote_at(data: &[u8], pos: u32) -> Result<Remote> {
	let end = data.len().checked_sub(pos as usize).ok_or(Error::ShortRead)?;
	let start = end.checked_sub(REMOTE_SIZE).ok_or(Error::ShortRead)?;
	let mut word = [0u8; 8];
	word.copy_from_slice(&data[start..start + 8]);
	let bn = u64::from_le_bytes(word);
	word.copy_from_slice(&data[start + 8..end]);
	let gen = u64::from_le_bytes(word);
	Ok(Remote { bn, gen, pos })
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::key::Key;

	const BUFSIZE: usize = 512;

	fn leaf(bytes: &[u8]) -> Segment {
		let mut seg = Segment::new();
		seg.push_bits(&Key::from_bytes(bytes), true);
		seg
	}

	#[test]
	fn round_trip_single_string() {
		let mut node = Node::empty();
		node.segs.push(leaf(&[0xab, 0xcd]));
		let out = marshal(&node, BUFSIZE, false).unwrap();
		assert_eq!(out.len(), BUFSIZE);
		let back = demarshal(&out, false).unwrap();
		assert_eq!(back, node);
	}

	#[test]
	fn round_trip_fork_and_remote() {
		let mut root = Segment::new();
		root.push_bits(&Key::from_bytes(&[0xab]), false);
		root.tail = Tail::Fork(Fork {
			elems: vec![
				ForkElem { segidx: 1, shorthand_match: 3 },
				ForkElem { segidx: 2, shorthand_match: 0 },
			],
		});
		let mut away = Segment::new();
		away.push_bits(&Key::new(4, vec![0xc0]), false);
		away.tail = Tail::Remote(Remote { bn: 7, gen: 9, pos: 0 });
		let mut node = Node::empty();
		node.segs.push(root);
		node.segs.push(away);
		node.segs.push(leaf(&[0xef]));

		let out = marshal(&node, BUFSIZE, false).unwrap();
		let back = demarshal(&out, false).unwrap();
		assert_eq!(back, node);
		// The remote is parked at the very end of the buffer.
		assert_eq!(remote_at(&out, 0).unwrap(), Remote { bn: 7, gen: 9, pos: 0 });
	}

	#[test]
	fn round_trip_two_remotes() {
		let mut node = Node::empty();
		let mut root = Segment::new();
		root.push_bits(&Key::from_bytes(&[0x01]), false);
		root.tail = Tail::Fork(Fork {
			elems: vec![
				ForkElem { segidx: 1, shorthand_match: 0 },
				ForkElem { segidx: 2, shorthand_match: 0 },
			],
		});
		let mut left = Segment::new();
		left.push_bits(&Key::new(1, vec![0]), false);
		left.tail = Tail::Remote(Remote { bn: 11, gen: 1, pos: 0 });
		let mut right = Segment::new();
		right.push_bits(&Key::new(1, vec![0x80]), false);
		right.tail = Tail::Remote(Remote { bn: 12, gen: 2, pos: 16 });
		node.segs.push(root);
		node.segs.push(left);
		node.segs.push(right);

		let out = marshal(&node, BUFSIZE, false).unwrap();
		let back = demarshal(&out, false).unwrap();
		assert_eq!(back, node);
		assert_eq!(remote_at(&out, 16).unwrap(), Remote { bn: 12, gen: 2, pos: 16 });
	}

	#[test]
	fn round_trip_long_string_and_stop_fork() {
		let mut node = Node::empty();
		let mut root = Segment::new();
		let long: Vec<u8> = (0..40).map(|i| i as u8).collect();
		root.push_bits(&Key::from_bytes(&long), false);
		root.tail = Tail::StopFork(Fork {
			elems: vec![
				ForkElem { segidx: 1, shorthand_match: 15 },
				ForkElem { segidx: 2, shorthand_match: 1 },
			],
		});
		node.segs.push(root);
		node.segs.push(leaf(&[0x00]));
		node.segs.push(leaf(&[0xff]));
		let out = marshal(&node, BUFSIZE, false).unwrap();
		assert_eq!(demarshal(&out, false).unwrap(), node);
	}

	#[test]
	fn round_trip_compressed() {
		let mut node = Node::empty();
		let mut root = Segment::new();
		root.push_bits(&Key::from_bytes(&[0xab]), false);
		root.tail = Tail::Fork(Fork {
			elems: vec![
				ForkElem { segidx: 1, shorthand_match: 0 },
				ForkElem { segidx: 2, shorthand_match: 0 },
			],
		});
		let mut away = Segment::new();
		away.push_bits(&Key::new(4, vec![0xc0]), true);
		away.tail = Tail::Remote(Remote { bn: 42, gen: 4242, pos: 0 });
		node.segs.push(root);
		node.segs.push(away);
		node.segs.push(leaf(&[0xef, 0x01]));

		let out = marshal(&node, BUFSIZE, true).unwrap();
		let back = demarshal(&out, true).unwrap();
		assert_eq!(back, node);
		// The reverse region is readable without inflating the block.
		assert_eq!(remote_at(&out, 0).unwrap(), Remote { bn: 42, gen: 4242, pos: 0 });
	}

	#[test]
	fn empty_block_is_empty_node() {
		let node = Node::empty();
		let out = marshal(&node, BUFSIZE, false).unwrap();
		assert_eq!(demarshal(&out, false).unwrap().segs.len(), 0);
		// A zeroed buffer parses the same way.
		assert_eq!(demarshal(&vec![0u8; BUFSIZE], false).unwrap().segs.len(), 0);
	}

	#[test]
	fn overflow_signals_split() {
		let mut node = Node::empty();
		let mut seg = Segment::new();
		let long: Vec<u8> = vec![0x5a; BUFSIZE];
		seg.push_bits(&Key::from_bytes(&long[..600 / 8]), true);
		node.segs.push(seg);
		match marshal(&node, 64, false) {
			Err(Error::ShortWrite) => (),
			other => panic!("expected split signal, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn corrupt_fork_child_rejected() {
		let mut node = Node::empty();
		let mut root = Segment::new();
		root.push_bits(&Key::from_bytes(&[1]), false);
		root.tail = Tail::Fork(Fork {
			elems: vec![
				ForkElem { segidx: 1, shorthand_match: 0 },
				ForkElem { segidx: 9, shorthand_match: 0 },
			],
		});
		node.segs.push(root);
		node.segs.push(leaf(&[2]));
		match marshal(&node, BUFSIZE, false) {
			Err(Error::Corrupt(_)) => (),
			other => panic!("expected corrupt, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn truncated_stream_rejected() {
		// One segment claiming 2047 strings inside an 8 byte buffer.
		let mut data = vec![0u8; 8];
		data[0] = 1;
		data[2] = 0xe0;
		data[3] = 0xff;
		match demarshal(&data, false) {
			Err(Error::ShortRead) => (),
			other => panic!("expected short read, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn garbage_compressed_stream_rejected() {
		let data = vec![0u8; BUFSIZE];
		match demarshal(&data, true) {
			Err(Error::Corrupt(_)) => (),
			other => panic!("expected corrupt, got {:?}", other.map(|_| ())),
		}
	}
}
