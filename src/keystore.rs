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

// The keystore proper: a paced multi-dimensional trie over a bucket.
//
// Mutations never lock anything. Each one walks down to the block that has
// to change, rebuilds that block in memory (spilling oversized subtrees
// into freshly kept blocks), and publishes the result with a single linked
// replace. A conflicting writer expires the link; the losing side retraces
// its path and retries.

use std::collections::HashMap;
use std::sync::Arc;
use crate::{
	bucket::{Block, Bucket, Gen, Link, NO_BLOCK, NO_LINK},
	codec::{self, bit_len, GZIP_OVERHEAD, MAX_STR_BITS},
	error::{Error, Result},
	key::{pace, shorthand_len, Dimpace, Key},
	node::{realign_chain, Fork, ForkElem, Node, Remote, Segment, Str, Tail},
	search::{self, Scan, SearchState, WalkEnd, WalkPos},
};

const MAX_RETRIES: usize = 16;

/// For a given block size, how many children a fork can address before the
/// fork header, the shorthand table, the segment headers and one remote
/// pointer per child overflow the block. Returns the maximum fanout, the
/// bit distance between forks (stops included) and the pointer width.
/// The fanout mixes ternary and binary splits, 2·3^a + 2^b.
pub fn fork_fan(bufsize: usize, compressed: bool) -> (u32, u32, u32) {
	let mut bs = bufsize as i64 - (2 + 1); // block header + fork header
	if compressed {
		bs -= GZIP_OVERHEAD as i64;
	}
	let maxsegbits = bit_len((bs / 3 - 1) as u64); // 3 is the minimum size of a segment
	let (mut p3, mut p2) = (1i64, 1i64);
	let mut bd = 1u64;
	loop {
		let w = 2 * p3 + p2;
		let s = (w * bit_len(bd + 1) as i64 + 7) / 8; // bits for shorthands
		if 18 * w + s + (maxsegbits as i64 * w + 7) / 8 > bs {
			// 18 is the size of a segment holding one remote pointer
			return ((2 * p3 / 3 + p2 / 2) as u32, (bd - 1) as u32, maxsegbits);
		}
		p3 *= 3;
		p2 *= 2;
		bd += 1;
	}
}

/// Options for `Keystore::retrieve`. Every field has the "not supplied"
/// default: full-length match, forward order, no key cap.
#[derive(Default)]
pub struct RetrieveOptions {
	/// Follow shorthand match counters past the supplied bits; implies a
	/// single result and excludes `matchlen` and `reverse`.
	pub shorthand: bool,
	/// Minimum bits to match per dimension; a value above the key length
	/// demands the stop as well (exact match).
	pub matchlen: HashMap<u32, u64>,
	/// Per-dimension descending order.
	pub reverse: Vec<bool>,
	/// Cap on returned tuples; absent means all of them. Use with caution.
	pub maxkeys: Option<usize>,
}

pub struct Keystore {
	pub(crate) dimpace: Dimpace,
	pub(crate) bucket: Arc<dyn Bucket>,
	pub(crate) root: Block,
	pub(crate) bufsize: usize,
	pub(crate) compressed: bool,
	forkfanout: u32,
	forkwidth: u32,
	initialized: bool,
}

impl Keystore {
	pub fn new(
		dimpace: Dimpace,
		bucket: Arc<dyn Bucket>,
		root: Block,
		bufsize: usize,
		compressed: bool,
	) -> Keystore {
		Keystore {
			dimpace,
			bucket,
			root,
			bufsize,
			compressed,
			forkfanout: 0,
			forkwidth: 0,
			initialized: false,
		}
	}

	/// Validate the configuration and cache the fork geometry. Must be
	/// called exactly once before any operation; calling an operation
	/// first is a programming error and panics.
	pub fn init(&mut self) {
		assert!(self.root != NO_BLOCK, "unknown root");
		assert_eq!(self.bufsize, self.bucket.bufsize(), "buffer size differs from the bucket's");
		assert!(self.bufsize >= 64);
		let (fanout, distance, width) = fork_fan(self.bufsize, self.compressed);
		self.forkfanout = fanout;
		self.forkwidth = distance;
		self.initialized = true;
		log::debug!(
			target: "keypace",
			"Keystore over root {}: fanout {}, bit distance {}, pointer width {}",
			self.root,
			fanout,
			distance,
			width,
		);
	}

	fn assert_init(&self) {
		assert!(self.initialized, "keystore operation before init");
	}

	/// Write an empty trie block and return its address, ready to serve as
	/// a fresh root.
	pub fn format_root(bucket: &dyn Bucket, compressed: bool) -> Result<Block> {
		let node = Node::empty();
		let data = codec::marshal(&node, bucket.bufsize(), compressed)?;
		let (buf, _) = bucket.fetch(NO_BLOCK, false)?;
		buf.bytes_mut().copy_from_slice(&data);
		let (bn, _) = bucket.keep(&buf, true)?;
		Ok(bn)
	}

	/// Insert one key tuple. Returns, per dimension, the position of the
	/// first bit not shared with any previously stored key; for a key that
	/// is a strict prefix of a stored one this is the key length (the stop
	/// position). With `shorthands` above zero the total must cover the
	/// per-dimension minima, and the fork taken by the new key records a
	/// shorthand match counter.
	pub fn insert(&self, keys: &[Key], shorthands: u64) -> Result<Vec<u64>> {
		self.assert_init();
		if keys.is_empty() {
			return Err(Error::InvalidArgument("a key needs at least one dimension".into()));
		}
		let limits: Vec<u64> = keys.iter().map(|k| k.bitlen).collect();
		let mut state = SearchState::new();
		let mut start: Option<Node> = None;
		for _ in 0..MAX_RETRIES {
			let (mut node, end, pos) = match state.downtree(self, start.take(), keys, &limits) {
				Ok(walked) => walked,
				Err(Error::LinkExpired) => {
					start = Some(state.retrace(self)?);
					continue;
				}
				Err(e) => return Err(e),
			};
			let applied = self.apply_insert(&state, &mut node, &end, &pos, keys, shorthands);
			search::release_node(self, &mut node)?;
			match applied {
				Ok(uniq) => return Ok(uniq),
				Err(Error::LinkExpired) => {
					start = Some(state.retrace(self)?);
				}
				Err(e) => return Err(e),
			}
		}
		Err(Error::LinkExpired)
	}

	fn apply_insert(
		&self,
		state: &SearchState,
		node: &mut Node,
		end: &WalkEnd,
		pos: &WalkPos,
		keys: &[Key],
		shorthands: u64,
	) -> Result<Vec<u64>> {
		let uniq = pos.keybit.clone();
		if shorthands > 0 {
			let minima: HashMap<u32, u64> = uniq
				.iter()
				.enumerate()
				.filter(|(_, u)| **u > 0)
				.map(|(d, u)| (d as u32, *u))
				.collect();
			let need = shorthand_len(&self.dimpace, &minima);
			if shorthands < need {
				return Err(Error::InvalidArgument(format!(
					"shorthand total {} below the minimum {}",
					shorthands, need
				)));
			}
		}
		// Counters are one-based so that a recorded branch can never be
		// confused with an unannotated sibling.
		let counter = if shorthands > 0 && pos.global >= shorthands {
			(pos.global - shorthands).min(14) as u32 + 1
		} else {
			0
		};

		match end {
			WalkEnd::Matched { stop: true } => {
				// The tuple is already stored; nothing changes.
				return Ok(uniq);
			}
			WalkEnd::Matched { stop: false } => {
				if node.segs.is_empty() {
					node.segs.push(Segment::new());
				}
				let seg = &mut node.segs[pos.segidx];
				let total = seg.total_bits();
				if pos.offset >= total {
					match seg.tail.clone() {
						Tail::Fork(f) => seg.tail = Tail::StopFork(f),
						Tail::StopFork(_) => return Ok(uniq),
						Tail::None | Tail::Remote(_) => mark_stop(seg),
					}
				} else {
					let (mut head, tail_strs) = seg.split_strings(pos.offset);
					match head.last_mut() {
						Some(last) => last.has_stop = true,
						None => head.push(Str::from_key(&Key::default(), 0, true)),
					}
					let align = seg.stralign;
					let mut strings = realign_chain(head, align);
					strings.extend(realign_chain(
						tail_strs,
						((align as u64 + pos.offset) & 7) as u32,
					));
					seg.strings = strings;
				}
			}
			WalkEnd::Diverged { store_ended } => {
				let (dim, _) = pace(&self.dimpace, pos.global, &pos.stopmap);
				let d = dim as usize;
				if d >= keys.len() || pos.keybit[d] >= keys[d].bitlen {
					return Err(Error::InvalidArgument(
						"dimension keys do not exhaust simultaneously".into(),
					));
				}
				let rem = self.interleave(keys, &pos.keybit, pos.global)?;
				if node.segs.is_empty() {
					let mut seg = Segment::new();
					push_chunks(&mut seg, &rem, true);
					node.segs.push(seg);
				} else if *store_ended {
					// The stored path is a strict prefix: keep its stop and
					// continue the chain with the new tail.
					push_chunks(&mut node.segs[pos.segidx], &rem, true);
				} else if pos.offset >= node.segs[pos.segidx].total_bits() {
					// Divergence at a fork: grow it by one branch.
					match node.segs[pos.segidx].tail.clone() {
						Tail::Fork(f) | Tail::StopFork(f) => {
							if f.fanout() as u32 >= self.forkfanout {
								return Err(Error::InvalidArgument(format!(
									"fork fanout {} exhausted",
									self.forkfanout
								)));
							}
							let is_stop =
								matches!(node.segs[pos.segidx].tail, Tail::StopFork(_));
							let mut child = Segment::new();
							push_chunks(&mut child, &rem, true);
							let nb = rem.bit(0);
							let new_idx = node.segs.len() as u32;
							node.segs.push(child);
							let mut elems = f.elems.clone();
							let at = elems
								.iter()
								.position(|e| {
									let c = &node.segs[e.segidx as usize];
									c.total_bits() > 0 && c.stream_bit(0) > nb
								})
								.unwrap_or(elems.len());
							elems.insert(
								at,
								ForkElem { segidx: new_idx, shorthand_match: counter },
							);
							let fork = Fork { elems };
							node.segs[pos.segidx].tail =
								if is_stop { Tail::StopFork(fork) } else { Tail::Fork(fork) };
						}
						_ => return Err(Error::Corrupt("divergence at a segment end".into())),
					}
				} else {
					// Divergence inside the string chain: split it and fork
					// into the old tail and the new one.
					let seg = node.segs[pos.segidx].clone();
					let (head, old_strs) = seg.split_strings(pos.offset);
					let old_child =
						Segment { stralign: 0, strings: old_strs, tail: seg.tail.clone() };
					let mut new_child = Segment::new();
					push_chunks(&mut new_child, &rem, true);
					let ob = old_child.stream_bit(0);
					let nb = rem.bit(0);
					let old_idx = node.segs.len() as u32;
					node.segs.push(old_child);
					let new_idx = node.segs.len() as u32;
					node.segs.push(new_child);
					let elems = if nb < ob {
						vec![
							ForkElem { segidx: new_idx, shorthand_match: counter },
							ForkElem { segidx: old_idx, shorthand_match: 0 },
						]
					} else {
						vec![
							ForkElem { segidx: old_idx, shorthand_match: 0 },
							ForkElem { segidx: new_idx, shorthand_match: counter },
						]
					};
					let align = node.segs[pos.segidx].stralign;
					node.segs[pos.segidx].strings = realign_chain(head, align);
					node.segs[pos.segidx].tail = Tail::Fork(Fork { elems });
				}
			}
			WalkEnd::Ambiguous { .. } => {
				return Err(Error::Corrupt("fork children share leading bits".into()));
			}
		}

		let mut kept = Vec::new();
		let data = self.marshal_or_split(node, &mut kept)?;
		let link = state.rempath.last().map(|h| h.link).unwrap_or(NO_LINK);
		match self.write_block(&data, node.address, link) {
			Ok(()) => Ok(uniq),
			Err(e) => {
				if !kept.is_empty() {
					let _ = self.bucket.discard(&kept);
				}
				Err(e)
			}
		}
	}

	/// Delete a key tuple: exactly matching keys for dimensions with
	/// `exact` set, the whole prefix subtree otherwise. Omitting `exact`
	/// prefix-deletes in every dimension. Deleting an absent key is a
	/// no-op.
	pub fn delete(&self, keys: &[Key], exact: Option<&[bool]>) -> Result<()> {
		self.assert_init();
		if keys.is_empty() {
			return Err(Error::InvalidArgument("a key needs at least one dimension".into()));
		}
		let exact = match exact {
			Some(e) => {
				if e.len() != keys.len() {
					return Err(Error::InvalidArgument(
						"exact flags do not cover the dimensions".into(),
					));
				}
				e.to_vec()
			}
			None => vec![false; keys.len()],
		};
		let limits: Vec<u64> = keys.iter().map(|k| k.bitlen).collect();
		for _ in 0..MAX_RETRIES {
			let mut state = SearchState::new();
			let (mut node, end, pos) = match state.downtree(self, None, keys, &limits) {
				Ok(walked) => walked,
				Err(Error::LinkExpired) => continue,
				Err(e) => return Err(e),
			};
			let applied = self.apply_delete(&state, &mut node, &end, &pos, &exact);
			search::release_node(self, &mut node)?;
			match applied {
				Ok(()) => return Ok(()),
				Err(Error::LinkExpired) => continue,
				Err(e) => return Err(e),
			}
		}
		Err(Error::LinkExpired)
	}

	fn apply_delete(
		&self,
		state: &SearchState,
		node: &mut Node,
		end: &WalkEnd,
		pos: &WalkPos,
		exact: &[bool],
	) -> Result<()> {
		let stop = match end {
			WalkEnd::Matched { stop } => *stop,
			// Nothing stored under this key.
			_ => return Ok(()),
		};
		let mut discard = Vec::new();
		if exact.iter().all(|e| *e) {
			if !stop || !clear_stop(node, pos.segidx, pos.offset) {
				return Ok(());
			}
		} else {
			if node.segs.is_empty() {
				return Ok(());
			}
			self.truncate_below(node, pos.segidx, pos.offset, &mut discard)?;
		}
		prune_node(node);
		self.publish_pruned(state, node, discard)
	}

	/// Replace `old` with `new`. Succeeds only when, in every dimension,
	/// `old` is the unique stored key under the longest common prefix of
	/// `old` and `new`; the path below that point is then rewritten in
	/// place. `exact` demands a full match of `old` per dimension.
	pub fn replace(&self, old: &[Key], new: &[Key], exact: Option<&[bool]>) -> Result<()> {
		self.assert_init();
		if old.is_empty() || old.len() != new.len() {
			return Err(Error::InvalidArgument("old and new keys must share dimensions".into()));
		}
		let dims = old.len();
		let exact = match exact {
			Some(e) => {
				if e.len() != dims {
					return Err(Error::InvalidArgument(
						"exact flags do not cover the dimensions".into(),
					));
				}
				e.to_vec()
			}
			None => vec![false; dims],
		};
		let common: Vec<u64> = (0..dims).map(|d| lcp(&old[d], &new[d])).collect();
		let prefix: Vec<Key> = (0..dims).map(|d| old[d].substr(0, common[d])).collect();

		// The rewrite is sound only when nothing else lives under the
		// common prefix.
		let mut under = Vec::new();
		search::scan(
			self,
			&Scan {
				keys: &prefix,
				required: common.clone(),
				exact: vec![false; dims],
				reverse: vec![false; dims],
				max: 2,
			},
			&mut under,
		)?;
		if under.len() != 1 {
			return Err(Error::InvalidArgument(
				"old key is not unique under the common prefix".into(),
			));
		}
		for d in 0..dims {
			let stored = &under[0][d];
			let matches = if exact[d] {
				*stored == old[d]
			} else {
				stored.bitlen >= old[d].bitlen && stored.substr(0, old[d].bitlen) == old[d]
			};
			if !matches {
				return Err(Error::InvalidArgument("stored key does not match old key".into()));
			}
		}

		for _ in 0..MAX_RETRIES {
			let mut state = SearchState::new();
			let (mut node, end, pos) = match state.downtree(self, None, &prefix, &common) {
				Ok(walked) => walked,
				Err(Error::LinkExpired) => continue,
				Err(e) => return Err(e),
			};
			let applied = (|| {
				match end {
					WalkEnd::Matched { .. } => (),
					_ => return Err(Error::InvalidArgument("old key not present".into())),
				}
				if node.segs.is_empty() {
					return Err(Error::InvalidArgument("old key not present".into()));
				}
				let mut discard = Vec::new();
				self.truncate_below(&mut node, pos.segidx, pos.offset, &mut discard)?;
				let rem = self.interleave(new, &pos.keybit, pos.global)?;
				if rem.is_empty() {
					mark_stop(&mut node.segs[pos.segidx]);
				} else {
					push_chunks(&mut node.segs[pos.segidx], &rem, true);
				}
				prune_node(&mut node);
				self.publish_pruned(&state, &mut node, discard)
			})();
			search::release_node(self, &mut node)?;
			match applied {
				Ok(()) => return Ok(()),
				Err(Error::LinkExpired) => continue,
				Err(e) => return Err(e),
			}
		}
		Err(Error::LinkExpired)
	}

	/// Look up stored tuples. Results come in lexicographic order per
	/// dimension, descending where `reverse` says so, capped by `maxkeys`.
	pub fn retrieve(&self, keys: &[Key], opts: &RetrieveOptions) -> Result<Vec<Vec<Key>>> {
		self.assert_init();
		if keys.is_empty() {
			return Err(Error::InvalidArgument("a key needs at least one dimension".into()));
		}
		let dims = keys.len();
		if opts.shorthand {
			if !opts.matchlen.is_empty()
				|| opts.reverse.iter().any(|r| *r)
				|| opts.maxkeys.map_or(false, |m| m != 1)
			{
				return Err(Error::InvalidArgument(
					"shorthand lookup excludes matchlen, reverse and maxkeys".into(),
				));
			}
			let limits: Vec<u64> = keys.iter().map(|k| k.bitlen).collect();
			let mut state = SearchState::new();
			let (mut node, end, pos) = state.downtree(self, None, keys, &limits)?;
			return match end {
				WalkEnd::Matched { stop: true } => {
					search::release_node(self, &mut node)?;
					Ok(vec![keys.to_vec()])
				}
				WalkEnd::Matched { stop: false } => {
					// shorthand_follow consumes and releases the node.
					search::shorthand_follow(self, node, &pos, keys).map(|tuple| vec![tuple])
				}
				_ => {
					search::release_node(self, &mut node)?;
					Err(Error::InvalidArgument("shorthand key not present".into()))
				}
			};
		}

		for d in opts.matchlen.keys() {
			if *d as usize >= dims {
				return Err(Error::InvalidArgument(format!(
					"matchlen names dimension {} of {}",
					d, dims
				)));
			}
		}
		if !opts.reverse.is_empty() && opts.reverse.len() != dims {
			return Err(Error::InvalidArgument(
				"reverse flags do not cover the dimensions".into(),
			));
		}
		let mut required = Vec::with_capacity(dims);
		let mut exact = Vec::with_capacity(dims);
		for d in 0..dims {
			let want = opts.matchlen.get(&(d as u32)).copied().unwrap_or(keys[d].bitlen);
			required.push(want.min(keys[d].bitlen));
			exact.push(want > keys[d].bitlen);
		}
		let mut reverse = opts.reverse.clone();
		reverse.resize(dims, false);
		let max = opts.maxkeys.unwrap_or(usize::MAX);
		let scan = Scan { keys, required, exact, reverse, max };

		// A writer tearing blocks down mid-scan surfaces as an expired
		// link; start the scan over.
		for _ in 0..MAX_RETRIES {
			let mut out = Vec::new();
			match search::scan(self, &scan, &mut out) {
				Ok(()) => return Ok(out),
				Err(Error::LinkExpired) => continue,
				Err(e) => return Err(e),
			}
		}
		Err(Error::LinkExpired)
	}

	/// Interleave the unconsumed key bits into one stream, paced from
	/// `global` onward.
	fn interleave(&self, keys: &[Key], keybit: &[u64], global: u64) -> Result<Key> {
		let dims = keys.len();
		let mut keybit = keybit.to_vec();
		let mut stopmap: HashMap<u32, u64> = HashMap::new();
		for d in 0..dims {
			if keybit[d] >= keys[d].bitlen {
				stopmap.insert(d as u32, keys[d].bitlen);
			}
		}
		let mut g = global;
		let mut out = Key::default();
		let most = keys.iter().map(|k| k.bitlen).sum::<u64>() * 2 + 64;
		let mut steps = 0u64;
		while !(0..dims).all(|d| keybit[d] >= keys[d].bitlen) {
			if steps > most {
				return Err(Error::InvalidArgument(
					"dimension pacing does not advance".into(),
				));
			}
			steps += 1;
			let (dim, run) = pace(&self.dimpace, g, &stopmap);
			let d = dim as usize;
			if d >= dims {
				return Err(Error::InvalidArgument(format!(
					"pacing returned dimension {} of {}",
					dim, dims
				)));
			}
			for _ in 0..run {
				if keybit[d] >= keys[d].bitlen {
					break;
				}
				out.push_bit(keys[d].bit(keybit[d]));
				keybit[d] += 1;
				g += 1;
				if keybit[d] == keys[d].bitlen {
					stopmap.insert(dim, keys[d].bitlen);
				}
			}
		}
		Ok(out)
	}

	/// Drop everything hanging below the given stream position: the string
	/// tail, the fork subtree, and every remote block underneath, which is
	/// queued for discarding.
	fn truncate_below(
		&self,
		node: &mut Node,
		segidx: usize,
		offset: u64,
		discard: &mut Vec<Block>,
	) -> Result<()> {
		let tail = node.segs[segidx].tail.clone();
		self.gather_remote_blocks(node, &tail, discard)?;
		let (mut head, _) = node.segs[segidx].split_strings(offset);
		if let Some(last) = head.last_mut() {
			// The tuple ending exactly at the cut goes with the subtree.
			last.has_stop = false;
		}
		let align = node.segs[segidx].stralign;
		node.segs[segidx].strings = realign_chain(head, align);
		node.segs[segidx].tail = Tail::None;
		Ok(())
	}

	/// Queue every block reachable through `tail` for discarding.
	fn gather_remote_blocks(
		&self,
		node: &Node,
		tail: &Tail,
		out: &mut Vec<Block>,
	) -> Result<()> {
		if let Tail::Remote(r) = tail {
			return self.collect_blocks(r.bn, out);
		}
		let mut sub = Vec::new();
		gather_subtree(node, tail, &mut sub);
		for i in sub {
			if let Tail::Remote(r) = &node.segs[i].tail {
				self.collect_blocks(r.bn, out)?;
			}
		}
		Ok(())
	}

	fn collect_blocks(&self, bn: Block, out: &mut Vec<Block>) -> Result<()> {
		if out.contains(&bn) {
			return Ok(());
		}
		out.push(bn);
		let (buf, _) = match self.bucket.fetch(bn, false) {
			Ok(fetched) => fetched,
			// Already gone; nothing left to collect.
			Err(_) => return Ok(()),
		};
		let result = match codec::parse_block(&buf, bn, self.compressed) {
			Ok(child) => {
				let mut r = Ok(());
				for seg in &child.segs {
					if let Tail::Remote(rem) = &seg.tail {
						r = self.collect_blocks(rem.bn, out);
						if r.is_err() {
							break;
						}
					}
				}
				r
			}
			Err(_) => Ok(()),
		};
		self.bucket.release(&[&buf])?;
		result
	}

	/// Publish a pruned block, or, when pruning emptied it, detach it from
	/// its parent and climb while parents die too. The root survives empty.
	fn publish_pruned(
		&self,
		state: &SearchState,
		node: &mut Node,
		mut discard: Vec<Block>,
	) -> Result<()> {
		let mut level = state.rempath.len() - 1;
		let live = !node.segs.is_empty() && alive(node, 0);
		if live || level == 0 {
			if !live {
				node.segs.clear();
			}
			let mut kept = Vec::new();
			let data = self.marshal_or_split(node, &mut kept)?;
			let written =
				self.write_block(&data, state.rempath[level].rem.bn, state.rempath[level].link);
			if written.is_err() {
				let _ = self.bucket.discard(&kept);
				return written;
			}
			if !discard.is_empty() {
				self.bucket.discard(&discard)?;
			}
			return Ok(());
		}

		let mut condemned = state.rempath[level].rem.bn;
		discard.push(condemned);
		loop {
			level -= 1;
			let pbn = state.rempath[level].rem.bn;
			let (buf, link) = self.bucket.fetch(pbn, true)?;
			let parsed = codec::parse_block(&buf, pbn, self.compressed);
			let result = (|| {
				let mut parent = parsed?;
				let mut found = false;
				for seg in parent.segs.iter_mut() {
					if let Tail::Remote(r) = &seg.tail {
						if r.bn == condemned {
							seg.tail = Tail::None;
							found = true;
							break;
						}
					}
				}
				if !found {
					// The parent moved on since our walk.
					return Err(Error::LinkExpired);
				}
				prune_node(&mut parent);
				let live = !parent.segs.is_empty() && alive(&parent, 0);
				if live || level == 0 {
					if !live {
						parent.segs.clear();
					}
					let mut kept = Vec::new();
					let data = self.marshal_or_split(&mut parent, &mut kept)?;
					let written = self.write_block(&data, pbn, link);
					if written.is_err() {
						let _ = self.bucket.discard(&kept);
					}
					written.map(|_| true)
				} else {
					Ok(false)
				}
			})();
			self.bucket.release(&[&buf])?;
			match result {
				Ok(true) => {
					self.bucket.discard(&discard)?;
					return Ok(());
				}
				Ok(false) => {
					discard.push(pbn);
					condemned = pbn;
				}
				Err(e) => return Err(e),
			}
		}
	}

	fn marshal_or_split(&self, node: &mut Node, kept: &mut Vec<Block>) -> Result<Vec<u8>> {
		for _ in 0..64 {
			match codec::marshal(node, self.bufsize, self.compressed) {
				Ok(data) => return Ok(data),
				Err(Error::ShortWrite) => self.split_node(node, kept)?,
				Err(e) => return Err(e),
			}
		}
		Err(Error::ShortWrite)
	}

	/// The block does not fit: spill part of it into a fresh block behind
	/// a remote pointer. Long string chains are halved; otherwise the
	/// weightiest fork subtree moves out whole.
	fn split_node(&self, node: &mut Node, kept: &mut Vec<Block>) -> Result<()> {
		let mut victim = None;
		let mut bits = 0u64;
		for (i, seg) in node.segs.iter().enumerate() {
			if seg.total_bits() > bits {
				victim = Some(i);
				bits = seg.total_bits();
			}
		}
		if let Some(i) = victim {
			if bits >= 320 {
				let (head, tail_strs) = node.segs[i].split_strings(bits / 2);
				return self.detach_into_child(node, i, head, tail_strs, kept);
			}
		}

		let mut best = None;
		let mut weight = 0u64;
		for i in 0..node.segs.len() {
			if node.segs[i].tail.fork().is_none() {
				continue;
			}
			let mut sub = Vec::new();
			gather_subtree(node, &node.segs[i].tail.clone(), &mut sub);
			let w: u64 = sub
				.iter()
				.map(|j| {
					3 + node.segs[*j]
						.strings
						.iter()
						.map(|s| 2 + s.bits.len() as u64)
						.sum::<u64>()
				})
				.sum();
			if w > weight {
				best = Some(i);
				weight = w;
			}
		}
		match best {
			Some(i) if weight > 40 => {
				let head = node.segs[i].strings.clone();
				self.detach_into_child(node, i, head, Vec::new(), kept)
			}
			_ => Err(Error::ShortWrite),
		}
	}

	fn detach_into_child(
		&self,
		node: &mut Node,
		victim: usize,
		head: Vec<Str>,
		tail_strs: Vec<Str>,
		kept: &mut Vec<Block>,
	) -> Result<()> {
		let old_tail = node.segs[victim].tail.clone();
		let mut order = Vec::new();
		gather_subtree(node, &old_tail, &mut order);
		let map: HashMap<u32, u32> =
			order.iter().enumerate().map(|(n, old)| (*old as u32, (n + 1) as u32)).collect();
		let mut child = Node::empty();
		child.segs.push(Segment {
			stralign: 0,
			strings: realign_chain(tail_strs, 0),
			tail: remap_tail(&old_tail, &map),
		});
		for old in &order {
			let mut seg = node.segs[*old].clone();
			seg.tail = remap_tail(&seg.tail, &map);
			child.segs.push(seg);
		}
		let (bn, gen) = self.keep_node(&mut child, kept)?;
		let align = node.segs[victim].stralign;
		node.segs[victim].strings = realign_chain(head, align);
		node.segs[victim].tail = Tail::Remote(Remote { bn, gen, pos: 0 });
		compact(node);
		Ok(())
	}

	fn keep_node(&self, node: &mut Node, kept: &mut Vec<Block>) -> Result<(Block, Gen)> {
		let data = self.marshal_or_split(node, kept)?;
		let (buf, _) = self.bucket.fetch(NO_BLOCK, false)?;
		buf.bytes_mut().copy_from_slice(&data);
		let (bn, gen) = self.bucket.keep(&buf, true)?;
		kept.push(bn);
		log::trace!(target: "keypace", "Kept subtree block {} gen {}", bn, gen);
		Ok((bn, gen))
	}

	fn write_block(&self, data: &[u8], bn: Block, link: Link) -> Result<()> {
		let (buf, _) = self.bucket.fetch(NO_BLOCK, false)?;
		buf.bytes_mut().copy_from_slice(data);
		log::trace!(target: "keypace", "Publishing block {}", bn);
		self.bucket.replace(bn, &buf, 0, link, true)
	}
}

fn lcp(a: &Key, b: &Key) -> u64 {
	let n = a.bitlen.min(b.bitlen);
	for i in 0..n {
		if a.bit(i) != b.bit(i) {
			return i;
		}
	}
	n
}

/// Append a bit stream to a segment, chopped into strings the codec can
/// hold, marking the final string as a stop when asked.
fn push_chunks(seg: &mut Segment, stream: &Key, stop: bool) {
	let mut from = 0;
	while from < stream.bitlen {
		let len = (stream.bitlen - from).min(MAX_STR_BITS);
		let last = from + len == stream.bitlen;
		seg.push_bits(&stream.substr(from, len), stop && last);
		from += len;
	}
	if stream.bitlen == 0 && stop {
		mark_stop(seg);
	}
}

fn mark_stop(seg: &mut Segment) {
	match seg.strings.last_mut() {
		Some(last) => last.has_stop = true,
		None => {
			let align = seg.stralign;
			seg.strings.push(Str::from_key(&Key::default(), align, true));
		}
	}
}

/// Clear the endpoint marker sitting exactly at the stream position.
/// Returns false when there is none.
fn clear_stop(node: &mut Node, segidx: usize, offset: u64) -> bool {
	if segidx >= node.segs.len() {
		return false;
	}
	let seg = &mut node.segs[segidx];
	if offset >= seg.total_bits() {
		if let Tail::StopFork(f) = seg.tail.clone() {
			seg.tail = Tail::Fork(f);
			return true;
		}
	}
	let mut consumed = 0;
	for s in seg.strings.iter_mut() {
		consumed += s.bitlen;
		if consumed == offset {
			if s.has_stop {
				s.has_stop = false;
				return true;
			}
			return false;
		}
		if consumed > offset {
			return false;
		}
	}
	false
}

fn gather_subtree(node: &Node, tail: &Tail, out: &mut Vec<usize>) {
	if let Some(fork) = tail.fork() {
		for e in &fork.elems {
			let i = e.segidx as usize;
			if i < node.segs.len() && !out.contains(&i) {
				out.push(i);
				let tail = node.segs[i].tail.clone();
				gather_subtree(node, &tail, out);
			}
		}
	}
}

fn remap_tail(tail: &Tail, map: &HashMap<u32, u32>) -> Tail {
	let remap = |fork: &Fork| Fork {
		elems: fork
			.elems
			.iter()
			.map(|e| ForkElem {
				segidx: *map.get(&e.segidx).unwrap_or(&e.segidx),
				shorthand_match: e.shorthand_match,
			})
			.collect(),
	};
	match tail {
		Tail::Fork(f) => Tail::Fork(remap(f)),
		Tail::StopFork(f) => Tail::StopFork(remap(f)),
		other => other.clone(),
	}
}

/// Drop segments unreachable from the entry segment and renumber the rest.
fn compact(node: &mut Node) {
	if node.segs.is_empty() {
		return;
	}
	let mut keep = vec![false; node.segs.len()];
	let mut stack = vec![0usize];
	while let Some(i) = stack.pop() {
		if i >= node.segs.len() || keep[i] {
			continue;
		}
		keep[i] = true;
		if let Some(fork) = node.segs[i].tail.fork() {
			for e in &fork.elems {
				stack.push(e.segidx as usize);
			}
		}
	}
	let mut map: HashMap<u32, u32> = HashMap::new();
	let mut segs = Vec::new();
	for (i, seg) in node.segs.iter().enumerate() {
		if keep[i] {
			map.insert(i as u32, segs.len() as u32);
			segs.push(seg.clone());
		}
	}
	for seg in segs.iter_mut() {
		seg.tail = remap_tail(&seg.tail, &map);
	}
	node.segs = segs;
}

fn seg_alive(node: &Node, i: usize, seen: &mut Vec<bool>) -> bool {
	if i >= node.segs.len() || seen[i] {
		return false;
	}
	seen[i] = true;
	let seg = &node.segs[i];
	if seg.strings.iter().any(|s| s.has_stop) {
		return true;
	}
	match &seg.tail {
		Tail::None => false,
		Tail::Remote(_) | Tail::StopFork(_) => true,
		Tail::Fork(f) => {
			for e in &f.elems {
				if seg_alive(node, e.segidx as usize, seen) {
					return true;
				}
			}
			false
		}
	}
}

fn alive(node: &Node, i: usize) -> bool {
	let mut seen = vec![false; node.segs.len()];
	seg_alive(node, i, &mut seen)
}

/// After a removal: drop dead fork branches, dissolve single-child forks
/// by splicing the survivor into its parent, and compact.
fn prune_node(node: &mut Node) {
	loop {
		let mut changed = false;
		for i in 0..node.segs.len() {
			// Bits past the last stop of a leaf segment are dead weight.
			if matches!(node.segs[i].tail, Tail::None) {
				let seg = &mut node.segs[i];
				if let Some(n) = seg.strings.iter().rposition(|s| s.has_stop) {
					if n + 1 < seg.strings.len() {
						seg.strings.truncate(n + 1);
						changed = true;
					}
				}
			}
			let (fork, is_stop) = match &node.segs[i].tail {
				Tail::Fork(f) => (f.clone(), false),
				Tail::StopFork(f) => (f.clone(), true),
				_ => continue,
			};
			let live: Vec<ForkElem> = fork
				.elems
				.iter()
				.filter(|e| alive(node, e.segidx as usize))
				.cloned()
				.collect();
			if live.len() == fork.elems.len() {
				continue;
			}
			changed = true;
			match live.len() {
				0 => {
					node.segs[i].tail = Tail::None;
					if is_stop {
						mark_stop(&mut node.segs[i]);
					}
				}
				1 => {
					let child = live[0].segidx as usize;
					if is_stop {
						mark_stop(&mut node.segs[i]);
					}
					splice(node, i, child);
				}
				_ => {
					let fork = Fork { elems: live };
					node.segs[i].tail =
						if is_stop { Tail::StopFork(fork) } else { Tail::Fork(fork) };
				}
			}
		}
		if !changed {
			break;
		}
	}
	compact(node);
}

/// Absorb a single surviving fork child into its parent segment.
fn splice(node: &mut Node, parent: usize, child: usize) {
	let child_seg = node.segs[child].clone();
	let p = &mut node.segs[parent];
	let at = ((p.stralign as u64 + p.total_bits()) & 7) as u32;
	let mut strings = realign_chain(child_seg.strings, at);
	p.strings.append(&mut strings);
	p.tail = child_seg.tail;
}
