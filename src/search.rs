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

// Search over the paced trie.
//
// A search state is a stack of stacks, outermost to innermost: remote hops
// up to the last block, segments within the last block, strings within the
// last segment, and a final bit or fork position. Each entry snapshots the
// per-dimension key bit counts at that point so a trimmed or retraced
// search can resume where it left off.

use std::collections::HashMap;
use crate::{
	bucket::{Bucket, Buf, Link, NO_LINK},
	codec,
	error::{Error, Result},
	key::{pace, Key},
	keystore::Keystore,
	node::{Node, Remote, Tail},
};

#[derive(Debug, Clone)]
pub(crate) struct RemHop {
	pub keybit: Vec<u64>,
	pub rem: Remote,
	pub link: Link,
}

#[derive(Debug, Clone)]
pub(crate) struct SegHop {
	pub keybit: Vec<u64>,
	pub segidx: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct StrHop {
	pub keybit: Vec<u64>,
	pub strnum: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct BitHop {
	pub keybit: Vec<u64>,
	pub bitnum: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct ForkHop {
	pub keybit: Vec<u64>,
	pub first: usize,
	pub n: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SearchState {
	pub rempath: Vec<RemHop>,
	pub segpath: Vec<SegHop>,
	pub strpath: Vec<StrHop>,
	// A search ends on a bit within a string or on a fork, never both.
	pub bitpath: Option<BitHop>,
	pub forkpath: Option<ForkHop>,
	// Segment indices of forks seen in the last block.
	pub forks: Vec<usize>,
}

/// How a downtree walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WalkEnd {
	/// Every dimension matched its required bit count. `stop` tells whether
	/// a stored tuple ends exactly at the final position.
	Matched { stop: bool },
	/// The next stored bit disagrees with the key (`store_ended` false), or
	/// the stored path ended while the key goes on (`store_ended` true).
	Diverged { store_ended: bool },
	/// A fork where the key bits do not single out a child.
	Ambiguous { first: usize, n: usize },
}

/// Position where a walk terminated, within the last block.
#[derive(Debug, Clone)]
pub(crate) struct WalkPos {
	pub segidx: usize,
	pub offset: u64,
	pub keybit: Vec<u64>,
	pub global: u64,
	pub stopmap: HashMap<u32, u64>,
}

/// Buffers fetched during a retrace. Everything still held when the guard
/// drops is released, so failure paths and panics cannot leak references.
struct FetchGuard<'a> {
	bucket: &'a dyn Bucket,
	bufs: Vec<Buf>,
}

impl<'a> FetchGuard<'a> {
	fn new(bucket: &'a dyn Bucket) -> FetchGuard<'a> {
		FetchGuard { bucket, bufs: Vec::new() }
	}

	fn push(&mut self, buf: Buf) {
		self.bufs.push(buf);
	}

	fn release_tail(&mut self, n: usize) -> Result<()> {
		for _ in 0..n {
			if let Some(buf) = self.bufs.pop() {
				self.bucket.release(&[&buf])?;
			}
		}
		Ok(())
	}

	/// Release everything fetched except the final buffer, whose reference
	/// the caller keeps inside the parsed block.
	fn keep_last(mut self) -> Result<()> {
		self.bufs.pop();
		while let Some(buf) = self.bufs.pop() {
			self.bucket.release(&[&buf])?;
		}
		Ok(())
	}
}

impl<'a> Drop for FetchGuard<'a> {
	fn drop(&mut self) {
		for buf in self.bufs.drain(..) {
			if self.bucket.release(&[&buf]).is_err() {
				log::warn!(target: "keypace", "Leaked a buffer while unwinding a retrace");
			}
		}
	}
}

/// Link probe: a zero length replace that fails when the block has been
/// rewritten or discarded since the link was opened.
pub(crate) fn modified(bucket: &dyn Bucket, bn: crate::bucket::Block, link: Link) -> bool {
	bucket.replace(bn, &Buf::empty(), 0, link, false).is_err()
}

pub(crate) fn release_node(ks: &Keystore, node: &mut Node) -> Result<()> {
	if let Some(buf) = node.buf.take() {
		ks.bucket.release(&[&buf])?;
	}
	Ok(())
}

impl SearchState {
	pub fn new() -> SearchState {
		SearchState::default()
	}

	fn clear_inner(&mut self) {
		self.segpath.clear();
		self.strpath.clear();
		self.bitpath = None;
		self.forkpath = None;
		self.forks.clear();
	}

	/// Record the string and bit position a walk terminated at.
	fn mark_position(&mut self, node: &Node, segidx: usize, offset: u64, keybit: &[u64]) {
		if let Some(seg) = node.segs.get(segidx) {
			let mut strnum = 0;
			let mut within = offset;
			for s in &seg.strings {
				if within < s.bitlen {
					break;
				}
				within -= s.bitlen;
				strnum += 1;
			}
			self.strpath.push(StrHop { keybit: keybit.to_vec(), strnum });
			self.bitpath = Some(BitHop { keybit: keybit.to_vec(), bitnum: within });
		}
	}

	/// Walk down the trie from the start block (or the root when absent),
	/// matching paced key bits until every dimension has consumed its
	/// `limit` bits, the store disagrees, or a fork cannot be resolved.
	/// On return only the final block's buffer is held.
	pub fn downtree(
		&mut self,
		ks: &Keystore,
		start: Option<Node>,
		keys: &[Key],
		limit: &[u64],
	) -> Result<(Node, WalkEnd, WalkPos)> {
		let dims = keys.len();
		let mut node = match start {
			Some(node) => node,
			None => {
				if self.rempath.is_empty() {
					self.rempath.push(RemHop {
						keybit: vec![0; dims],
						rem: Remote { bn: ks.root, gen: 0, pos: 0 },
						link: NO_LINK,
					});
				}
				let bn = self.rempath.last().expect("pushed above").rem.bn;
				let (buf, link) = ks.bucket.fetch(bn, true)?;
				self.rempath.last_mut().expect("pushed above").link = link;
				match codec::parse_block(&buf, bn, ks.compressed) {
					Ok(node) => node,
					Err(e) => {
						let _ = ks.bucket.release(&[&buf]);
						return Err(e);
					}
				}
			}
		};

		let mut keybit = self.rempath.last().map(|hop| hop.keybit.clone()).unwrap_or_else(|| vec![0; dims]);
		if keybit.len() != dims {
			keybit = vec![0; dims];
		}
		let mut global: u64 = keybit.iter().sum();
		let mut stopmap: HashMap<u32, u64> = HashMap::new();
		for d in 0..dims {
			if keybit[d] >= keys[d].bitlen {
				stopmap.insert(d as u32, keys[d].bitlen);
			}
		}
		let done = |keybit: &[u64]| (0..dims).all(|d| keybit[d] >= limit[d]);

		self.clear_inner();
		let mut segidx = 0usize;
		self.segpath.push(SegHop { keybit: keybit.clone(), segidx });

		loop {
			if node.segs.is_empty() {
				// A blank block: the store ends right here.
				let end = if done(&keybit) {
					WalkEnd::Matched { stop: false }
				} else {
					WalkEnd::Diverged { store_ended: true }
				};
				let pos = WalkPos { segidx: 0, offset: 0, keybit, global, stopmap };
				return Ok((node, end, pos));
			}
			if segidx >= node.segs.len() {
				release_node(ks, &mut node)?;
				return Err(Error::Corrupt(format!("segment {} out of range", segidx)));
			}
			let total = node.segs[segidx].total_bits();
			let mut offset = 0u64;

			while offset < total {
				if done(&keybit) {
					let stop = node.segs[segidx].stop_at(offset);
					self.mark_position(&node, segidx, offset, &keybit);
					let pos = WalkPos { segidx, offset, keybit, global, stopmap };
					return Ok((node, WalkEnd::Matched { stop }, pos));
				}
				let (dim, _) = pace(&ks.dimpace, global, &stopmap);
				let d = dim as usize;
				if d >= dims {
					release_node(ks, &mut node)?;
					return Err(Error::InvalidArgument(format!(
						"pacing returned dimension {} of {}",
						dim, dims
					)));
				}
				if keybit[d] >= keys[d].bitlen {
					// The paced dimension ran out of key bits before the
					// others: the keys do not co-exhaust here.
					self.mark_position(&node, segidx, offset, &keybit);
					let pos = WalkPos { segidx, offset, keybit, global, stopmap };
					return Ok((node, WalkEnd::Diverged { store_ended: false }, pos));
				}
				if keys[d].bit(keybit[d]) != node.segs[segidx].stream_bit(offset) {
					self.mark_position(&node, segidx, offset, &keybit);
					let pos = WalkPos { segidx, offset, keybit, global, stopmap };
					return Ok((node, WalkEnd::Diverged { store_ended: false }, pos));
				}
				keybit[d] += 1;
				global += 1;
				offset += 1;
				if keybit[d] == keys[d].bitlen {
					stopmap.insert(dim, keys[d].bitlen);
				}
			}

			if done(&keybit) {
				let stop = node.segs[segidx].stop_at(total)
					|| matches!(node.segs[segidx].tail, Tail::StopFork(_));
				self.mark_position(&node, segidx, total, &keybit);
				let pos = WalkPos { segidx, offset: total, keybit, global, stopmap };
				return Ok((node, WalkEnd::Matched { stop }, pos));
			}

			let tail = node.segs[segidx].tail.clone();
			match tail {
				Tail::None => {
					self.mark_position(&node, segidx, total, &keybit);
					let pos = WalkPos { segidx, offset: total, keybit, global, stopmap };
					return Ok((node, WalkEnd::Diverged { store_ended: true }, pos));
				}
				Tail::Remote(rem) => {
					self.rempath.push(RemHop { keybit: keybit.clone(), rem, link: NO_LINK });
					let fetched = ks.bucket.fetch(rem.bn, true);
					release_node(ks, &mut node)?;
					let (buf, link) = match fetched {
						Ok(ok) => ok,
						// The pointer came from a possibly stale parent; a
						// vanished child means the path was rewritten.
						Err(_) => return Err(Error::LinkExpired),
					};
					self.rempath.last_mut().expect("pushed above").link = link;
					node = match codec::parse_block(&buf, rem.bn, ks.compressed) {
						Ok(n) => n,
						Err(e) => {
							let _ = ks.bucket.release(&[&buf]);
							return Err(e);
						}
					};
					self.clear_inner();
					segidx = 0;
					self.segpath.push(SegHop { keybit: keybit.clone(), segidx });
				}
				Tail::Fork(ref fork) | Tail::StopFork(ref fork) => {
					self.forks.push(segidx);
					let (dim, _) = pace(&ks.dimpace, global, &stopmap);
					let d = dim as usize;
					if d >= dims || keybit[d] >= keys[d].bitlen {
						self.mark_position(&node, segidx, total, &keybit);
						let pos = WalkPos { segidx, offset: total, keybit, global, stopmap };
						return Ok((node, WalkEnd::Diverged { store_ended: false }, pos));
					}
					let kb = keys[d].bit(keybit[d]);
					let mut first = None;
					let mut n = 0;
					for (i, e) in fork.elems.iter().enumerate() {
						let child = match node.segs.get(e.segidx as usize) {
							Some(child) => child,
							None => {
								release_node(ks, &mut node)?;
								return Err(Error::Corrupt("fork child out of range".into()));
							}
						};
						// A child without local bits cannot be told apart
						// here; count it as a candidate.
						let matches = child.total_bits() == 0 || child.stream_bit(0) == kb;
						if matches {
							if first.is_none() {
								first = Some(i);
							}
							n += 1;
						}
					}
					match (first, n) {
						(Some(i), 1) => {
							segidx = fork.elems[i].segidx as usize;
							self.segpath.push(SegHop { keybit: keybit.clone(), segidx });
						}
						(Some(i), n) => {
							self.forkpath =
								Some(ForkHop { keybit: keybit.clone(), first: i, n });
							let pos =
								WalkPos { segidx, offset: total, keybit, global, stopmap };
							return Ok((node, WalkEnd::Ambiguous { first: i, n }, pos));
						}
						(None, _) => {
							self.mark_position(&node, segidx, total, &keybit);
							let pos =
								WalkPos { segidx, offset: total, keybit, global, stopmap };
							return Ok((node, WalkEnd::Diverged { store_ended: false }, pos));
						}
					}
				}
			}
		}
	}

	/// Re-validate the remote pointer path against concurrent rewrites.
	///
	/// Walks the recorded hops from the root, re-fetching each block with a
	/// fresh link. A modified parent backs the scan up two steps. Once the
	/// path is known to be lost, blocks are re-parsed and the next hop is
	/// relocated by its (block, gen) identity; when that fails the path is
	/// trimmed and the last good block returned so the caller can resume.
	/// Every buffer fetched here is released except the one returned.
	pub fn retrace(&mut self, ks: &Keystore) -> Result<Node> {
		assert!(!self.rempath.is_empty(), "retrace without a path");
		let mut fetched = FetchGuard::new(&*ks.bucket);
		let mut lost = false;
		let mut i: isize = 0;

		loop {
			let at = i as usize;
			let (buf, link) = match ks.bucket.fetch(self.rempath[at].rem.bn, true) {
				Ok(ok) => ok,
				Err(e) => {
					if i == 0 {
						return Err(e);
					}
					// The child vanished entirely; treat like a modified
					// parent and back up.
					fetched.release_tail(1)?;
					i -= 1;
					continue;
				}
			};
			fetched.push(buf.clone());

			if i == 0 {
				lost = self.rempath[0].link == NO_LINK
					|| modified(&*ks.bucket, self.rempath[0].rem.bn, self.rempath[0].link);
			} else if modified(
				&*ks.bucket,
				self.rempath[at - 1].rem.bn,
				self.rempath[at - 1].link,
			) {
				// Parent rewritten under us: drop this fetch and the
				// parent's, then rescan from one step higher.
				fetched.release_tail(2)?;
				i -= 1;
				continue;
			}
			self.rempath[at].link = link;

			if at == self.rempath.len() - 1 {
				let node = codec::parse_block(&buf, self.rempath[at].rem.bn, ks.compressed)?;
				fetched.keep_last()?;
				return Ok(node);
			}

			let rn = self.rempath[at + 1].rem;
			if !lost {
				// Fast path: re-read the pointer at its recorded position
				// and check it still leads where it used to. In the common
				// case this avoids parsing entirely.
				match codec::remote_at(&buf.bytes(), rn.pos) {
					Ok(next) if next.bn == rn.bn && next.gen == rn.gen => {
						i += 1;
						continue;
					}
					_ => lost = true,
				}
			}

			// The pointer moved or the path is no longer trusted: re-parse
			// this block and look for the next hop by identity.
			let node = codec::parse_block(&buf, self.rempath[at].rem.bn, ks.compressed)?;
			let mut found = false;
			for seg in &node.segs {
				if let Tail::Remote(r) = &seg.tail {
					if r.bn == rn.bn && r.gen == rn.gen {
						self.rempath[at + 1].rem.pos = r.pos;
						found = true;
						break;
					}
				}
			}
			if found {
				lost = false;
				i += 1;
				continue;
			}
			log::debug!(
				target: "keypace",
				"Retrace lost block {} gen {}; trimming at {}",
				rn.bn,
				rn.gen,
				at + 1,
			);
			self.rempath.truncate(at + 1);
			self.clear_inner();
			fetched.keep_last()?;
			return Ok(node);
		}
	}
}

/// Ordered enumeration parameters for a subtree scan.
pub(crate) struct Scan<'a> {
	pub keys: &'a [Key],
	pub required: Vec<u64>,
	pub exact: Vec<bool>,
	pub reverse: Vec<bool>,
	pub max: usize,
}

impl<'a> Scan<'a> {
	fn qualifies(&self, acc: &[Key]) -> bool {
		for d in 0..self.keys.len() {
			let need = self.required[d];
			if acc[d].bitlen < need || acc[d].substr(0, need) != self.keys[d].substr(0, need) {
				return false;
			}
			if self.exact[d] {
				if acc[d] != self.keys[d] {
					return false;
				}
				continue;
			}
			// A zero length key bounds nothing: it names the start (or,
			// reversed, the end) of the dimension.
			if self.keys[d].is_empty() {
				continue;
			}
			let ord = acc[d].compare(&self.keys[d]);
			let wrong =
				if self.reverse[d] { ord == std::cmp::Ordering::Greater } else { ord == std::cmp::Ordering::Less };
			if wrong {
				return false;
			}
		}
		true
	}
}

/// Enumerate stored tuples in per-dimension lexicographic order, starting
/// at the root. Emission honors the reverse flags and stops once `max`
/// results are out.
pub(crate) fn scan(ks: &Keystore, opts: &Scan, out: &mut Vec<Vec<Key>>) -> Result<()> {
	let (buf, _) = ks.bucket.fetch(ks.root, false)?;
	let node = match codec::parse_block(&buf, ks.root, ks.compressed) {
		Ok(node) => node,
		Err(e) => {
			let _ = ks.bucket.release(&[&buf]);
			return Err(e);
		}
	};
	let mut acc: Vec<Key> = vec![Key::default(); opts.keys.len()];
	let result = if node.segs.is_empty() {
		Ok(true)
	} else {
		collect_from(ks, &node, 0, 0, &mut acc, 0, opts, out)
	};
	ks.bucket.release(&[&buf])?;
	result.map(|_| ())
}

fn emit(acc: &[Key], opts: &Scan, out: &mut Vec<Vec<Key>>) -> bool {
	if out.len() >= opts.max {
		return false;
	}
	if opts.qualifies(acc) {
		out.push(acc.to_vec());
	}
	out.len() < opts.max
}

fn collect_from(
	ks: &Keystore,
	node: &Node,
	segidx: usize,
	offset: u64,
	acc: &mut Vec<Key>,
	global: u64,
	opts: &Scan,
	out: &mut Vec<Vec<Key>>,
) -> Result<bool> {
	let seg = match node.segs.get(segidx) {
		Some(seg) => seg,
		None => return Err(Error::Corrupt(format!("segment {} out of range", segidx))),
	};
	let empty = HashMap::new();
	let save: Vec<u64> = acc.iter().map(|k| k.bitlen).collect();

	let result = (|| {
		let total = seg.total_bits();
		let mut off = offset;
		let mut g = global;
		while off < total {
			let (dim, _) = pace(&ks.dimpace, g, &empty);
			let d = dim as usize;
			if d >= acc.len() {
				return Err(Error::InvalidArgument(format!(
					"pacing returned dimension {} of {}",
					dim,
					acc.len()
				)));
			}
			acc[d].push_bit(seg.stream_bit(off));
			off += 1;
			g += 1;
			if seg.stop_at(off) {
				// A stored tuple ends right here. Order it against the
				// continuation by the direction of the next paced bit.
				let cont = off < total || seg.tail.kind() != 0;
				if !cont {
					return Ok(emit(acc, opts, out));
				}
				let (next_dim, _) = pace(&ks.dimpace, g, &empty);
				let rev = opts.reverse.get(next_dim as usize).copied().unwrap_or(false);
				if rev {
					if !collect_from(ks, node, segidx, off, acc, g, opts, out)? {
						return Ok(false);
					}
					return Ok(emit(acc, opts, out));
				}
				if !emit(acc, opts, out) {
					return Ok(false);
				}
			}
		}

		match &seg.tail {
			Tail::None => Ok(true),
			Tail::Remote(rem) => {
				let (buf, _) = match ks.bucket.fetch(rem.bn, false) {
					Ok(ok) => ok,
					Err(_) => return Err(Error::LinkExpired),
				};
				let child = match codec::parse_block(&buf, rem.bn, ks.compressed) {
					Ok(child) => child,
					Err(e) => {
						let _ = ks.bucket.release(&[&buf]);
						return Err(e);
					}
				};
				let more = if child.segs.is_empty() {
					Ok(true)
				} else {
					collect_from(ks, &child, 0, 0, acc, g, opts, out)
				};
				ks.bucket.release(&[&buf])?;
				more
			}
			Tail::Fork(fork) | Tail::StopFork(fork) => {
				let (next_dim, _) = pace(&ks.dimpace, g, &empty);
				let rev = opts.reverse.get(next_dim as usize).copied().unwrap_or(false);
				let is_stop = matches!(seg.tail, Tail::StopFork(_)) && !seg.stop_at(total);
				if is_stop && !rev {
					if !emit(acc, opts, out) {
						return Ok(false);
					}
				}
				let order: Vec<usize> = if rev {
					(0..fork.elems.len()).rev().collect()
				} else {
					(0..fork.elems.len()).collect()
				};
				for i in order {
					let child = fork.elems[i].segidx as usize;
					if !collect_from(ks, node, child, 0, acc, g, opts, out)? {
						return Ok(false);
					}
				}
				if is_stop && rev {
					if !emit(acc, opts, out) {
						return Ok(false);
					}
				}
				Ok(true)
			}
		}
	})();

	for (d, len) in save.iter().enumerate() {
		if acc[d].bitlen != *len {
			acc[d] = acc[d].substr(0, *len);
		}
	}
	result
}

/// Follow the path beyond a fully matched partial key by shorthand match
/// counters: at each fork take the unique child whose counter equals the
/// distance walked past the supplied bits. The first endpoint reached is
/// the record.
pub(crate) fn shorthand_follow(
	ks: &Keystore,
	mut node: Node,
	pos: &WalkPos,
	keys: &[Key],
) -> Result<Vec<Key>> {
	let mut acc: Vec<Key> = keys.to_vec();
	let supplied = pos.global;
	let mut g = pos.global;
	let mut segidx = pos.segidx;
	let mut off = pos.offset;
	let stopmap = pos.stopmap.clone();

	let result = loop {
		if segidx >= node.segs.len() {
			break Err(Error::Corrupt(format!("segment {} out of range", segidx)));
		}
		let total = node.segs[segidx].total_bits();
		let mut ended = false;
		while off < total {
			let (dim, _) = pace(&ks.dimpace, g, &stopmap);
			let d = dim as usize;
			if d >= acc.len() {
				break;
			}
			acc[d].push_bit(node.segs[segidx].stream_bit(off));
			off += 1;
			g += 1;
			if node.segs[segidx].stop_at(off) {
				ended = true;
				break;
			}
		}
		if ended {
			break Ok(acc);
		}
		if off < total {
			break Err(Error::InvalidArgument("pacing dimension out of range".into()));
		}

		match node.segs[segidx].tail.clone() {
			Tail::None => {
				break Err(Error::Corrupt("path ends without a stop".into()));
			}
			Tail::StopFork(_) => break Ok(acc),
			Tail::Remote(rem) => {
				let fetched = ks.bucket.fetch(rem.bn, true);
				release_node(ks, &mut node)?;
				let (buf, _) = match fetched {
					Ok(ok) => ok,
					Err(_) => break Err(Error::LinkExpired),
				};
				node = match codec::parse_block(&buf, rem.bn, ks.compressed) {
					Ok(n) => n,
					Err(e) => {
						let _ = ks.bucket.release(&[&buf]);
						return Err(e);
					}
				};
				segidx = 0;
				off = 0;
			}
			Tail::Fork(fork) => {
				let residual = g.saturating_sub(supplied).min(14) as u32 + 1;
				let mut matched = None;
				let mut count = 0;
				for e in &fork.elems {
					if e.shorthand_match == residual {
						if matched.is_none() {
							matched = Some(e.segidx as usize);
						}
						count += 1;
					}
				}
				match (matched, count) {
					(Some(child), 1) => {
						segidx = child;
						off = 0;
					}
					_ => {
						break Err(Error::InvalidArgument(
							"shorthand does not identify a unique key".into(),
						))
					}
				}
			}
		}
	};
	release_node(ks, &mut node)?;
	result
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::Arc;
	use crate::{
		bucket::NO_BLOCK,
		key::Dimpace,
		keystore::Keystore,
		mem::MemBucket,
		node::{Fork, ForkElem, Segment},
	};

	fn modulo1() -> Dimpace {
		Box::new(|_b, _stopmap: &HashMap<u32, u64>| (0, 0))
	}

	fn keep_block(bucket: &MemBucket, node: &Node) -> (crate::bucket::Block, crate::bucket::Gen) {
		let data = codec::marshal(node, bucket.bufsize(), false).unwrap();
		let (buf, _) = bucket.fetch(NO_BLOCK, false).unwrap();
		buf.bytes_mut().copy_from_slice(&data);
		bucket.keep(&buf, true).unwrap()
	}

	fn rewrite_block(bucket: &MemBucket, bn: crate::bucket::Block, node: &Node) {
		let data = codec::marshal(node, bucket.bufsize(), false).unwrap();
		let (buf, _) = bucket.fetch(NO_BLOCK, false).unwrap();
		buf.bytes_mut().copy_from_slice(&data);
		bucket.replace(bn, &buf, 0, NO_LINK, true).unwrap();
	}

	fn seg_with(key: &Key, stop: bool, tail: Tail) -> Segment {
		let mut seg = Segment::new();
		if key.bitlen > 0 {
			seg.push_bits(key, stop);
		}
		seg.tail = tail;
		seg
	}

	/// Three-block path; the middle block is rewritten underneath a held
	/// search path. Retrace has to re-parse the middle block, relocate the
	/// leaf pointer by its (block, gen) identity and resume cleanly.
	#[test]
	fn retrace_relocates_moved_remote() {
		env_logger::try_init().ok();
		let bucket = Arc::new(MemBucket::new(512));
		let full = Key::from_bytes(&[0xab, 0xcd, 0xef]);

		let mut leaf = Node::empty();
		leaf.segs.push(seg_with(&full.substr(16, 8), true, Tail::None));
		let (l, lg) = keep_block(&bucket, &leaf);

		let mut middle = Node::empty();
		middle.segs.push(seg_with(
			&full.substr(8, 8),
			false,
			Tail::Remote(Remote { bn: l, gen: lg, pos: 0 }),
		));
		let (m, mg) = keep_block(&bucket, &middle);

		let mut root = Node::empty();
		root.segs.push(seg_with(
			&full.substr(0, 8),
			false,
			Tail::Remote(Remote { bn: m, gen: mg, pos: 0 }),
		));
		let (r, _) = keep_block(&bucket, &root);

		let mut ks = Keystore::new(modulo1(), bucket.clone(), r, 512, false);
		ks.init();

		// Reader walks down and remembers the remote path.
		let mut state = SearchState::new();
		let (mut node, end, _) =
			state.downtree(&ks, None, &[full.clone()], &[full.bitlen]).unwrap();
		assert_eq!(end, WalkEnd::Matched { stop: true });
		assert_eq!(state.rempath.len(), 3);
		assert_eq!(state.rempath[2].rem.pos, 0);
		release_node(&ks, &mut node).unwrap();

		// Writer republishes the middle block with a second branch whose
		// fresh leaf steals the first reverse slot: the old leaf pointer
		// keeps its identity but moves to a new position.
		let mut fresh = Node::empty();
		fresh.segs.push(seg_with(&Key::from_bytes(&[0x55]), true, Tail::None));
		let (l2, l2g) = keep_block(&bucket, &fresh);

		let mut rewritten = Node::empty();
		let mut entry = seg_with(&full.substr(8, 4), false, Tail::None);
		entry.tail = Tail::Fork(Fork {
			elems: vec![
				ForkElem { segidx: 1, shorthand_match: 0 },
				ForkElem { segidx: 2, shorthand_match: 0 },
			],
		});
		rewritten.segs.push(entry);
		// 0xcd continues with 0b1101; the new branch takes 0b0000.
		rewritten.segs.push(seg_with(
			&Key::new(4, vec![0x00]),
			false,
			Tail::Remote(Remote { bn: l2, gen: l2g, pos: 0 }),
		));
		rewritten.segs.push(seg_with(
			&full.substr(12, 4),
			false,
			Tail::Remote(Remote { bn: l, gen: lg, pos: 16 }),
		));
		rewrite_block(&bucket, m, &rewritten);

		// The retrace lands on the original leaf at its new position.
		let mut node = state.retrace(&ks).unwrap();
		assert_eq!(state.rempath.len(), 3);
		assert_eq!(state.rempath[2].rem.bn, l);
		assert_eq!(state.rempath[2].rem.gen, lg);
		assert_eq!(state.rempath[2].rem.pos, 16);
		assert_eq!(node.segs[0].strings[0].to_key(), full.substr(16, 8));
		release_node(&ks, &mut node).unwrap();

		// Everything fetched along the way went back.
		assert_eq!(bucket.stats().live_bufs, 0);
	}

	/// A trimmed retrace: the recorded leaf vanished entirely, so the path
	/// is cut back to the deepest block that still exists.
	#[test]
	fn retrace_trims_a_lost_path() {
		env_logger::try_init().ok();
		let bucket = Arc::new(MemBucket::new(512));
		let full = Key::from_bytes(&[0xab, 0xcd]);

		let mut leaf = Node::empty();
		leaf.segs.push(seg_with(&full.substr(8, 8), true, Tail::None));
		let (l, lg) = keep_block(&bucket, &leaf);

		let mut root = Node::empty();
		root.segs.push(seg_with(
			&full.substr(0, 8),
			false,
			Tail::Remote(Remote { bn: l, gen: lg, pos: 0 }),
		));
		let (r, _) = keep_block(&bucket, &root);

		let mut ks = Keystore::new(modulo1(), bucket.clone(), r, 512, false);
		ks.init();

		let mut state = SearchState::new();
		let (mut node, _, _) = state.downtree(&ks, None, &[full.clone()], &[full.bitlen]).unwrap();
		release_node(&ks, &mut node).unwrap();
		assert_eq!(state.rempath.len(), 2);

		// The writer rehomes the tail into a brand new leaf.
		let mut fresh = Node::empty();
		fresh.segs.push(seg_with(&full.substr(8, 8), true, Tail::None));
		let (l2, l2g) = keep_block(&bucket, &fresh);
		let mut rewritten = Node::empty();
		rewritten.segs.push(seg_with(
			&full.substr(0, 8),
			false,
			Tail::Remote(Remote { bn: l2, gen: l2g, pos: 0 }),
		));
		rewrite_block(&bucket, r, &rewritten);
		bucket.discard(&[l]).unwrap();

		let mut node = state.retrace(&ks).unwrap();
		// Only the root survived the trim; inner positions were reset.
		assert_eq!(state.rempath.len(), 1);
		assert!(state.segpath.is_empty());
		assert!(state.forkpath.is_none());
		assert_eq!(node.address, r);
		release_node(&ks, &mut node).unwrap();
		assert_eq!(bucket.stats().live_bufs, 0);
	}

	#[test]
	fn downtree_reports_divergence_position() {
		env_logger::try_init().ok();
		let bucket = Arc::new(MemBucket::new(512));
		let stored = Key::from_bytes(&[0xab, 0xcd]);
		let mut root = Node::empty();
		root.segs.push(seg_with(&stored, true, Tail::None));
		let (r, _) = keep_block(&bucket, &root);

		let mut ks = Keystore::new(modulo1(), bucket.clone(), r, 512, false);
		ks.init();

		let probe = Key::from_bytes(&[0xab, 0xef]);
		let mut state = SearchState::new();
		let (mut node, end, pos) =
			state.downtree(&ks, None, &[probe.clone()], &[probe.bitlen]).unwrap();
		assert_eq!(end, WalkEnd::Diverged { store_ended: false });
		assert_eq!(pos.offset, 10);
		assert_eq!(pos.keybit, vec![10]);
		release_node(&ks, &mut node).unwrap();
		assert_eq!(bucket.stats().live_bufs, 0);
	}
}
