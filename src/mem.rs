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

// In-memory bucket.
//
// Blocks are stored as plain byte vectors guarded by a single mutex.
// Each block carries a write version; a link handed out by a linked fetch
// is the version observed plus one, so that NO_LINK (0) never validates.
// Every applied write or discard bumps the version, expiring all links
// opened before it. Fetched buffers are snapshots shared between fetchers
// until the block is next rewritten.

use std::collections::HashMap;
use parking_lot::Mutex;
use crate::{
	bucket::{Block, Bucket, Buf, Gen, Link, NO_BLOCK, NO_LINK},
	display::hex,
	error::{Error, Result},
};

pub struct MemBucket {
	bufsize: usize,
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	blocks: HashMap<Block, BlockSlot>,
	bufs: HashMap<u64, BufSlot>,
	next_block: Block,
	next_gen: Gen,
	next_buf: u64,
}

struct BlockSlot {
	data: Vec<u8>,
	gen: Gen,
	version: u64,
	discarded: bool,
	// Snapshot buffer shared by fetchers of the current content.
	cur_buf: Option<u64>,
	// Buffers still associated with this block address.
	live_bufs: u32,
}

struct BufSlot {
	buf: Buf,
	refs: u32,
	block: Option<Block>,
}

/// Live object counts, for leak accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemBucketStats {
	pub live_bufs: usize,
	pub live_blocks: usize,
}

impl MemBucket {
	pub fn new(bufsize: usize) -> MemBucket {
		let mut inner = Inner::default();
		inner.next_gen = 1;
		inner.next_buf = 1;
		MemBucket { bufsize, inner: Mutex::new(inner) }
	}

	pub fn stats(&self) -> MemBucketStats {
		let inner = self.inner.lock();
		MemBucketStats {
			live_bufs: inner.bufs.len(),
			live_blocks: inner.blocks.len(),
		}
	}
}

impl Inner {
	fn new_buf(&mut self, data: Vec<u8>, block: Option<Block>) -> Buf {
		let id = self.next_buf;
		self.next_buf += 1;
		let buf = Buf::new(id, data);
		self.bufs.insert(id, BufSlot { buf: buf.clone(), refs: 1, block });
		buf
	}

	fn dec_ref(&mut self, id: u64) {
		let slot = match self.bufs.get_mut(&id) {
			Some(slot) => slot,
			None => panic!("releasing unknown buffer {}", id),
		};
		assert!(slot.refs > 0, "buffer {} refcount underflow", id);
		slot.refs -= 1;
		if slot.refs > 0 {
			return;
		}
		let block = slot.block;
		self.bufs.remove(&id);
		if let Some(bn) = block {
			if let Some(bslot) = self.blocks.get_mut(&bn) {
				bslot.live_bufs -= 1;
				if bslot.cur_buf == Some(id) {
					bslot.cur_buf = None;
				}
				if bslot.discarded && bslot.live_bufs == 0 {
					log::trace!(target: "keypace", "Freeing block {}", bn);
					self.blocks.remove(&bn);
				}
			}
		}
	}
}

impl Bucket for MemBucket {
	fn bufsize(&self) -> usize {
		self.bufsize
	}

	fn keep(&self, buf: &Buf, decref: bool) -> Result<(Block, Gen)> {
		let mut inner = self.inner.lock();
		let data = buf.bytes().clone();
		if data.len() != self.bufsize {
			if decref {
				inner.dec_ref(buf.id());
			}
			return Err(Error::InvalidArgument(format!(
				"keep of {} byte buffer into {} byte blocks",
				data.len(),
				self.bufsize
			)));
		}
		let bn = inner.next_block;
		inner.next_block += 1;
		let gen = inner.next_gen;
		inner.next_gen += 1;
		// The kept buffer becomes associated with the block while keeping
		// its reference count.
		let live_bufs = match inner.bufs.get_mut(&buf.id()) {
			Some(slot) => {
				slot.block = Some(bn);
				1
			}
			None => 0,
		};
		log::trace!(target: "keypace", "Kept block {} gen {}: {}", bn, gen, hex(&data[..data.len().min(8)]));
		inner.blocks.insert(
			bn,
			BlockSlot { data, gen, version: 0, discarded: false, cur_buf: None, live_bufs },
		);
		if decref {
			inner.dec_ref(buf.id());
		}
		Ok((bn, gen))
	}

	fn fetch(&self, block: Block, withlink: bool) -> Result<(Buf, Link)> {
		let mut inner = self.inner.lock();
		if block == NO_BLOCK {
			let buf = inner.new_buf(vec![0u8; self.bufsize], None);
			return Ok((buf, NO_LINK));
		}
		let (data, version, cur_buf) = match inner.blocks.get(&block) {
			Some(slot) => (slot.data.clone(), slot.version, slot.cur_buf),
			None => {
				return Err(Error::InvalidArgument(format!("fetch of unknown block {}", block)))
			}
		};
		let shared = cur_buf.filter(|id| inner.bufs.contains_key(id));
		let buf = match shared {
			Some(id) => {
				let slot = inner.bufs.get_mut(&id).unwrap();
				slot.refs += 1;
				slot.buf.clone()
			}
			None => {
				let buf = inner.new_buf(data, Some(block));
				let slot = inner.blocks.get_mut(&block).unwrap();
				slot.cur_buf = Some(buf.id());
				slot.live_bufs += 1;
				buf
			}
		};
		let link = if withlink { version + 1 } else { NO_LINK };
		log::trace!(target: "keypace", "Fetched block {} link {}", block, link);
		Ok((buf, link))
	}

	fn replace(&self, block: Block, buf: &Buf, off: usize, link: Link, decref: bool) -> Result<()> {
		let mut inner = self.inner.lock();
		let result = (|inner: &mut Inner| {
			let slot = match inner.blocks.get_mut(&block) {
				Some(slot) => slot,
				None => {
					return Err(Error::InvalidArgument(format!(
						"replace of unknown block {}",
						block
					)))
				}
			};
			let valid = !slot.discarded && slot.version + 1 == link;
			let data = buf.bytes();
			if data.is_empty() {
				// Link probe: verify only, never expire other links.
				return if link != NO_LINK && !valid { Err(Error::LinkExpired) } else { Ok(()) };
			}
			if link != NO_LINK && !valid {
				return Err(Error::LinkExpired);
			}
			if off + data.len() > slot.data.len() {
				return Err(Error::InvalidArgument(format!(
					"replace of {} bytes at {} overflows block {}",
					data.len(),
					off,
					block
				)));
			}
			slot.data[off..off + data.len()].copy_from_slice(&data);
			slot.version += 1;
			slot.cur_buf = None;
			log::trace!(
				target: "keypace",
				"Replaced {} bytes at {} of block {}, version {}",
				data.len(),
				off,
				block,
				slot.version,
			);
			Ok(())
		})(&mut *inner);
		if decref {
			inner.dec_ref(buf.id());
		}
		result
	}

	fn discard(&self, blocks: &[Block]) -> Result<()> {
		let mut inner = self.inner.lock();
		for bn in blocks {
			let slot = match inner.blocks.get_mut(bn) {
				Some(slot) => slot,
				None => {
					return Err(Error::InvalidArgument(format!(
						"discard of unknown block {}",
						bn
					)))
				}
			};
			slot.discarded = true;
			slot.version += 1;
			log::trace!(target: "keypace", "Discarded block {}", bn);
			if slot.live_bufs == 0 {
				inner.blocks.remove(bn);
			}
		}
		Ok(())
	}

	fn release(&self, bufs: &[&Buf]) -> Result<()> {
		let mut inner = self.inner.lock();
		for buf in bufs {
			inner.dec_ref(buf.id());
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn bucket() -> MemBucket {
		env_logger::try_init().ok();
		MemBucket::new(64)
	}

	fn filled(bucket: &MemBucket, fill: u8) -> Buf {
		let (buf, _) = bucket.fetch(NO_BLOCK, false).unwrap();
		for b in buf.bytes_mut().iter_mut() {
			*b = fill;
		}
		buf
	}

	#[test]
	fn keep_and_fetch() {
		let bucket = bucket();
		let buf = filled(&bucket, 0xaa);
		let (bn, gen) = bucket.keep(&buf, true).unwrap();
		assert!(gen != 0);

		let (read, link) = bucket.fetch(bn, false).unwrap();
		assert_eq!(link, NO_LINK);
		assert!(read.bytes().iter().all(|b| *b == 0xaa));
		bucket.release(&[&read]).unwrap();
		assert_eq!(bucket.stats().live_bufs, 0);
	}

	#[test]
	fn anonymous_buffer_keeps_refcount() {
		let bucket = bucket();
		let buf = filled(&bucket, 0x11);
		let (bn, _) = bucket.keep(&buf, false).unwrap();
		// Still referenced after being assigned a block address.
		assert_eq!(bucket.stats().live_bufs, 1);
		let (read, _) = bucket.fetch(bn, false).unwrap();
		assert!(read.bytes().iter().all(|b| *b == 0x11));
		bucket.release(&[&read, &buf]).unwrap();
		assert_eq!(bucket.stats().live_bufs, 0);
	}

	#[test]
	fn linked_replace_succeeds_when_unmodified() {
		let bucket = bucket();
		let (bn, _) = bucket.keep(&filled(&bucket, 0), true).unwrap();
		let (buf, link) = bucket.fetch(bn, true).unwrap();
		assert!(link != NO_LINK);
		let patch = filled(&bucket, 0xff);
		bucket.replace(bn, &patch, 0, link, true).unwrap();
		bucket.release(&[&buf]).unwrap();

		let (read, _) = bucket.fetch(bn, false).unwrap();
		assert!(read.bytes().iter().all(|b| *b == 0xff));
		bucket.release(&[&read]).unwrap();
	}

	#[test]
	fn linked_replace_fails_when_modified() {
		let bucket = bucket();
		let (bn, _) = bucket.keep(&filled(&bucket, 0), true).unwrap();
		let (buf, link) = bucket.fetch(bn, true).unwrap();
		// An intervening unlinked write expires the link.
		bucket.replace(bn, &filled(&bucket, 1), 0, NO_LINK, true).unwrap();
		let patch = filled(&bucket, 2);
		assert!(bucket.replace(bn, &patch, 0, link, true).unwrap_err().is_link_expired());
		bucket.release(&[&buf]).unwrap();
	}

	#[test]
	fn discard_expires_links() {
		let bucket = bucket();
		let (bn, _) = bucket.keep(&filled(&bucket, 0), true).unwrap();
		let (buf, link) = bucket.fetch(bn, true).unwrap();
		bucket.discard(&[bn]).unwrap();
		assert!(bucket.replace(bn, &Buf::empty(), 0, link, false).unwrap_err().is_link_expired());
		bucket.release(&[&buf]).unwrap();
		assert_eq!(bucket.stats().live_blocks, 0);
	}

	#[test]
	fn probe_does_not_expire_other_links() {
		let bucket = bucket();
		let (bn, _) = bucket.keep(&filled(&bucket, 0), true).unwrap();
		let (buf_a, link_a) = bucket.fetch(bn, true).unwrap();
		let (buf_b, link_b) = bucket.fetch(bn, true).unwrap();

		bucket.replace(bn, &Buf::empty(), 0, link_a, false).unwrap();
		// The probe left link_b intact.
		bucket.replace(bn, &filled(&bucket, 3), 0, link_b, true).unwrap();
		bucket.release(&[&buf_a, &buf_b]).unwrap();
	}

	#[test]
	fn replace_expires_every_other_link() {
		let bucket = bucket();
		let (bn, _) = bucket.keep(&filled(&bucket, 0), true).unwrap();
		let (buf_a, link_a) = bucket.fetch(bn, true).unwrap();
		let (buf_b, link_b) = bucket.fetch(bn, true).unwrap();

		bucket.replace(bn, &filled(&bucket, 4), 0, link_a, true).unwrap();
		let patch = filled(&bucket, 5);
		assert!(bucket.replace(bn, &patch, 0, link_b, true).unwrap_err().is_link_expired());
		bucket.release(&[&buf_a, &buf_b]).unwrap();
	}

	#[test]
	fn block_freed_after_discard_and_last_release() {
		let bucket = bucket();
		let (bn, _) = bucket.keep(&filled(&bucket, 7), true).unwrap();
		let (buf_a, _) = bucket.fetch(bn, false).unwrap();
		let (buf_b, _) = bucket.fetch(bn, false).unwrap();
		bucket.discard(&[bn]).unwrap();
		assert_eq!(bucket.stats().live_blocks, 1);
		bucket.release(&[&buf_a]).unwrap();
		assert_eq!(bucket.stats().live_blocks, 1);
		bucket.release(&[&buf_b]).unwrap();
		assert_eq!(bucket.stats(), MemBucketStats { live_bufs: 0, live_blocks: 0 });
	}

	#[test]
	fn partial_replace() {
		let bucket = bucket();
		let (bn, _) = bucket.keep(&filled(&bucket, 0), true).unwrap();
		let patch = Buf::new(0, vec![0xee; 8]);
		bucket.replace(bn, &patch, 16, NO_LINK, false).unwrap();
		let (read, _) = bucket.fetch(bn, false).unwrap();
		{
			let bytes = read.bytes();
			assert!(bytes[0..16].iter().all(|b| *b == 0));
			assert!(bytes[16..24].iter().all(|b| *b == 0xee));
			assert!(bytes[24..].iter().all(|b| *b == 0));
		}
		bucket.release(&[&read]).unwrap();
	}

	#[test]
	fn refcount_conservation() {
		let bucket = bucket();
		let buf = filled(&bucket, 1);
		let (bn, _) = bucket.keep(&buf, true).unwrap();
		let (a, _) = bucket.fetch(bn, false).unwrap();
		let (b, link) = bucket.fetch(bn, true).unwrap();
		bucket.replace(bn, &filled(&bucket, 2), 0, link, true).unwrap();
		let (c, _) = bucket.fetch(bn, false).unwrap();
		bucket.release(&[&a, &b, &c]).unwrap();
		bucket.discard(&[bn]).unwrap();
		assert_eq!(bucket.stats(), MemBucketStats { live_bufs: 0, live_blocks: 0 });
	}
}
