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

use std::sync::Arc;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::error::Result;

/// Block address within a bucket.
pub type Block = u64;
/// Generation tag. A (Block, Gen) pair never re-occurs: an address reused
/// for a new payload gets a fresh generation.
pub type Gen = u64;
/// Token returned by a linked fetch, presented to a linked replace.
pub type Link = u64;

pub const NO_BLOCK: Block = u64::MAX;
pub const NO_LINK: Link = 0;

/// Reference counted byte buffer. The handle carries an identity; the count
/// itself is kept by the bucket that issued the buffer. Reference counts are
/// for buffers, whereas allocation is for blocks: a buffer keeps its count
/// after being written to a new block, and an anonymous buffer (from
/// `fetch(NO_BLOCK)`) can be assigned a block address by `keep` while
/// retaining its references.
#[derive(Clone, Debug)]
pub struct Buf {
	id: u64,
	data: Arc<RwLock<Vec<u8>>>,
}

impl Buf {
	pub(crate) fn new(id: u64, data: Vec<u8>) -> Buf {
		Buf { id, data: Arc::new(RwLock::new(data)) }
	}

	/// A zero-length buffer, usable as a link probe with `Bucket::replace`.
	pub fn empty() -> Buf {
		Buf::new(0, Vec::new())
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn len(&self) -> usize {
		self.data.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn bytes(&self) -> RwLockReadGuard<Vec<u8>> {
		self.data.read()
	}

	pub fn bytes_mut(&self) -> RwLockWriteGuard<Vec<u8>> {
		self.data.write()
	}
}

/// Block-addressed buffer pool. Synchronization is load-linked /
/// store-conditional: a linked `fetch` opens a link that a later `replace`
/// validates, and any applied write or discard of the block in between
/// expires it.
pub trait Bucket: Send + Sync {
	/// Buffer size served and expected by this bucket.
	fn bufsize(&self) -> usize;

	/// Write the contents of `buf` to a newly allocated block; return the
	/// block address and a generation that never re-occurs for it.
	/// Decrements the buffer's refcount when `decref` is set.
	fn keep(&self, buf: &Buf, decref: bool) -> Result<(Block, Gen)>;

	/// Read a block and increment the returned buffer's refcount. With
	/// `withlink`, also open a link for a later conditional `replace`.
	/// Fetching `NO_BLOCK` returns an anonymous zeroed buffer and `NO_LINK`.
	fn fetch(&self, block: Block, withlink: bool) -> Result<(Buf, Link)>;

	/// Write `buf` in place at byte `off` of the block. If `link` is not
	/// `NO_LINK` the write fails with `LinkExpired` when the block has been
	/// modified or discarded since the matching fetch. A zero-length `buf`
	/// only verifies the link: it neither modifies the block nor expires
	/// other outstanding links. Decrements the buffer's refcount when
	/// `decref` is set, on success and failure alike.
	fn replace(&self, block: Block, buf: &Buf, off: usize, link: Link, decref: bool) -> Result<()>;

	/// Mark blocks for deallocation. Storage is freed once the last buffer
	/// associated with the block is released.
	fn discard(&self, blocks: &[Block]) -> Result<()>;

	/// Decrement buffer refcounts. Buffers are freed at zero; blocks whose
	/// last buffer goes and that were discarded are freed with them.
	fn release(&self, bufs: &[&Buf]) -> Result<()>;
}
