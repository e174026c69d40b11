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

mod bucket;
mod codec;
mod display;
mod error;
mod key;
mod keystore;
mod mem;
mod node;
mod search;

pub use bucket::{Block, Bucket, Buf, Gen, Link, NO_BLOCK, NO_LINK};
pub use error::{Error, Result};
pub use key::{shorthand_len, Dimpace, Key};
pub use keystore::{fork_fan, Keystore, RetrieveOptions};
pub use mem::{MemBucket, MemBucketStats};
