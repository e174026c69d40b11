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

#[derive(Debug)]
pub enum Error {
	Io(std::io::Error),
	Corrupt(String),
	InvalidArgument(String),
	/// The block was rewritten or discarded since the matching linked fetch.
	LinkExpired,
	/// Forward and reverse cursors met while serializing a block. The block
	/// content does not fit and must be subdivided.
	ShortWrite,
	ShortRead,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	pub fn is_link_expired(&self) -> bool {
		match self {
			Error::LinkExpired => true,
			_ => false,
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Error::Io(e) => write!(f, "IO error: {}", e),
			Error::Corrupt(e) => write!(f, "Corrupt data: {}", e),
			Error::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
			Error::LinkExpired => write!(f, "Block rewritten under our feet"),
			Error::ShortWrite => write!(f, "Block overflow"),
			Error::ShortRead => write!(f, "Unexpected end of block"),
		}
	}
}

impl std::error::Error for Error {}
