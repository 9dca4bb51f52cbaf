//! Block checksums for rsync-style detailing.
//!
//! For a regular file the detailer may offer the server a list of
//! per-block checksums instead of one whole-file digest: a weak 32-bit
//! rolling sum the server can slide over its copy cheaply, paired with
//! a block MD5 to confirm matches.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const MIN_BLOCK: usize = 64;
const MAX_BLOCK: usize = 16384;

/// Block size for a file: the square root of the size rounded up to a
/// multiple of 64, clamped to [64, 16384].
fn block_size(size: u64) -> usize {
	let root = (size as f64).sqrt() as usize;
	let rounded = (root + MIN_BLOCK - 1) / MIN_BLOCK * MIN_BLOCK;
	rounded.max(MIN_BLOCK).min(MAX_BLOCK)
}

/// The rsync weak checksum of a block: two 16-bit halves, the byte sum
/// and the position-weighted byte sum.
fn rolling_sum(block: &[u8]) -> u32 {
	let len = block.len() as u32;
	let mut a: u32 = 0;
	let mut b: u32 = 0;
	for (i, &byte) in block.iter().enumerate() {
		a = a.wrapping_add(byte as u32);
		b = b.wrapping_add((len - i as u32).wrapping_mul(byte as u32));
	}
	((b & 0xffff) << 16) | (a & 0xffff)
}

/// A regular file opened for block summing.
pub struct RsyncFile {
	file: File,
	size: u64,
	blocksize: usize,
	buf: Vec<u8>,
}

impl std::fmt::Debug for RsyncFile {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RsyncFile")
			.field("size", &self.size)
			.field("blocksize", &self.blocksize)
			.finish()
	}
}

impl RsyncFile {
	pub fn open(path: &Path) -> io::Result<RsyncFile> {
		let file = File::open(path)?;
		let size = file.metadata()?.len();
		let blocksize = block_size(size);
		Ok(RsyncFile { file, size, blocksize, buf: vec![0; blocksize] })
	}

	pub fn size(&self) -> u64 {
		self.size
	}

	pub fn blocksize(&self) -> usize {
		self.blocksize
	}

	/// Checksums of the next block: `(weak-hex, md5-hex)`.  None after
	/// the last block.
	pub fn next_block(&mut self) -> io::Result<Option<(String, String)>> {
		let mut filled = 0;
		while filled < self.buf.len() {
			let n = self.file.read(&mut self.buf[filled..])?;
			if n == 0 {
				break;
			}
			filled += n;
		}
		if filled == 0 {
			return Ok(None);
		}
		let block = &self.buf[..filled];
		let weak = format!("{:08x}", rolling_sum(block));
		let md5 = hex::encode(Md5::digest(block));
		Ok(Some((weak, md5)))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_block_size_bounds() {
		assert_eq!(block_size(0), 64);
		assert_eq!(block_size(100), 64);
		assert_eq!(block_size(10_000), 128);
		assert_eq!(block_size(u64::MAX / 2), 16384);
	}

	#[test]
	fn test_rolling_sum_known_value() {
		// a = 1+2+3 = 6, b = 3*1 + 2*2 + 1*3 = 10
		assert_eq!(rolling_sum(&[1, 2, 3]), (10 << 16) | 6);
	}

	#[test]
	fn test_blocks_cover_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		let data = vec![7u8; 200];
		std::fs::write(&path, &data).unwrap();
		let mut rf = RsyncFile::open(&path).unwrap();
		assert_eq!(rf.size(), 200);
		assert_eq!(rf.blocksize(), 64);
		let mut blocks = 0;
		while rf.next_block().unwrap().is_some() {
			blocks += 1;
		}
		// 200 bytes in 64-byte blocks: 3 full + 1 short.
		assert_eq!(blocks, 4);
	}
}

// vim: ts=4
