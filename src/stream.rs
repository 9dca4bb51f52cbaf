//! Buffered line streams.
//!
//! `WireReader`/`WireWriter` wrap a multiplexer channel with the
//! line-oriented protocol the workers speak: `getln` hands out one
//! `\n`-terminated line at a time (terminator stripped), writes are
//! buffered until `flush`.  A zlib filter can be engaged and disengaged
//! at message boundaries for collections that negotiate compression.
//!
//! `FileLineReader`/`FileLineWriter` are their synchronous counterparts
//! for local files; the writer can carry a running MD5 of everything
//! written through it, which is how checkout bodies are checksummed.

use crate::mux::{ChanReader, ChanWriter};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};

const READ_CHUNK: usize = 4096;

struct ZlibReadFilter {
	z: Decompress,
	finished: bool,
}

/// Buffered reader over a mux channel.
#[derive(Debug)]
pub struct WireReader {
	chan: ChanReader,
	/// Bytes as they came off the channel (compressed while a filter
	/// is engaged).
	raw: Vec<u8>,
	/// Decoded bytes that lines are carved out of.
	data: Vec<u8>,
	pos: usize,
	z: Option<ZlibReadFilter>,
	eof: bool,
}

impl std::fmt::Debug for ZlibReadFilter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ZlibReadFilter").field("finished", &self.finished).finish()
	}
}

impl WireReader {
	pub fn new(chan: ChanReader) -> Self {
		WireReader { chan, raw: Vec::new(), data: Vec::new(), pos: 0, z: None, eof: false }
	}

	/// Engage zlib decompression.  Bytes already buffered but not yet
	/// consumed were read ahead of the message boundary and are pushed
	/// back under the filter.
	pub fn filter_start_zlib(&mut self) {
		if self.pos < self.data.len() {
			let mut rest = self.data.split_off(self.pos);
			rest.extend_from_slice(&self.raw);
			self.raw = rest;
		}
		self.data.clear();
		self.pos = 0;
		self.z = Some(ZlibReadFilter { z: Decompress::new(true), finished: false });
	}

	/// Disengage the filter at a message boundary.  Whatever the
	/// channel carries next is plain again.
	pub fn filter_stop(&mut self) {
		self.z = None;
	}

	/// Next line with the `\n` terminator stripped, or None at EOF.  A
	/// final unterminated line is returned as-is.
	pub async fn getln(&mut self) -> io::Result<Option<Vec<u8>>> {
		loop {
			if let Some(nl) = self.data[self.pos..].iter().position(|&b| b == b'\n') {
				let line = self.data[self.pos..self.pos + nl].to_vec();
				self.pos += nl + 1;
				self.compact();
				return Ok(Some(line));
			}
			if self.eof {
				if self.pos < self.data.len() {
					let line = self.data[self.pos..].to_vec();
					self.pos = self.data.len();
					self.compact();
					return Ok(Some(line));
				}
				return Ok(None);
			}
			self.fill().await?;
		}
	}

	/// Next line converted to a String; protocol lines are ASCII.
	pub async fn getln_str(&mut self) -> io::Result<Option<String>> {
		match self.getln().await? {
			Some(line) => Ok(Some(String::from_utf8_lossy(&line).into_owned())),
			None => Ok(None),
		}
	}

	fn compact(&mut self) {
		if self.pos == self.data.len() {
			self.data.clear();
			self.pos = 0;
		} else if self.pos > READ_CHUNK {
			self.data.drain(..self.pos);
			self.pos = 0;
		}
	}

	async fn fill(&mut self) -> io::Result<()> {
		if self.raw.is_empty() {
			let mut chunk = [0u8; READ_CHUNK];
			let n = self.chan.read(&mut chunk).await?;
			if n == 0 {
				self.eof = true;
				return Ok(());
			}
			self.raw.extend_from_slice(&chunk[..n]);
		}
		match &mut self.z {
			None => {
				self.data.extend_from_slice(&self.raw);
				self.raw.clear();
			}
			Some(filter) => {
				if filter.finished {
					// Reading on after the compressed stream ended
					// means a message boundary was missed.
					return Err(io::Error::new(
						io::ErrorKind::InvalidData,
						"read past end of compressed stream",
					));
				}
				let mut scratch = [0u8; READ_CHUNK];
				let before_in = filter.z.total_in();
				let before_out = filter.z.total_out();
				let status = filter
					.z
					.decompress(&self.raw, &mut scratch, FlushDecompress::None)
					.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
				let consumed = (filter.z.total_in() - before_in) as usize;
				let produced = (filter.z.total_out() - before_out) as usize;
				self.raw.drain(..consumed);
				self.data.extend_from_slice(&scratch[..produced]);
				if status == flate2::Status::StreamEnd {
					filter.finished = true;
				} else if consumed == 0 && produced == 0 {
					// The tail of the buffered input is a partial
					// deflate block; more bytes are needed.
					let mut chunk = [0u8; READ_CHUNK];
					let n = self.chan.read(&mut chunk).await?;
					if n == 0 {
						self.eof = true;
						return Ok(());
					}
					self.raw.extend_from_slice(&chunk[..n]);
				}
			}
		}
		Ok(())
	}
}

struct ZlibWriteFilter {
	z: Compress,
}

/// Buffered writer over a mux channel.
pub struct WireWriter {
	chan: ChanWriter,
	buf: Vec<u8>,
	z: Option<ZlibWriteFilter>,
}

impl std::fmt::Debug for WireWriter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WireWriter").field("buffered", &self.buf.len()).finish()
	}
}

impl WireWriter {
	pub fn new(chan: ChanWriter) -> Self {
		WireWriter { chan, buf: Vec::new(), z: None }
	}

	/// Engage zlib compression for subsequent writes.
	pub fn filter_start_zlib(&mut self) {
		self.z = Some(ZlibWriteFilter { z: Compress::new(Compression::default(), true) });
	}

	/// Finish the compressed stream and return to plain writes.
	pub fn filter_stop(&mut self) -> io::Result<()> {
		if let Some(mut filter) = self.z.take() {
			deflate(&mut filter.z, &[], &mut self.buf, FlushCompress::Finish)?;
		}
		Ok(())
	}

	/// Buffer bytes for the channel, compressing when a filter is
	/// engaged.
	pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
		match &mut self.z {
			None => {
				self.buf.extend_from_slice(bytes);
				Ok(())
			}
			Some(filter) => deflate(&mut filter.z, bytes, &mut self.buf, FlushCompress::None),
		}
	}

	pub fn write_str(&mut self, s: &str) -> io::Result<()> {
		self.write(s.as_bytes())
	}

	/// Push everything buffered out on the channel.  With a filter
	/// engaged the compressor is sync-flushed first so the peer can
	/// decode what we sent so far.
	pub async fn flush(&mut self) -> io::Result<()> {
		if let Some(filter) = &mut self.z {
			deflate(&mut filter.z, &[], &mut self.buf, FlushCompress::Sync)?;
		}
		if !self.buf.is_empty() {
			self.chan.write_all(&self.buf).await?;
			self.buf.clear();
		}
		Ok(())
	}

	/// Flush and close the write side of the channel.
	pub async fn close(&mut self) -> io::Result<()> {
		self.filter_stop()?;
		self.flush().await?;
		self.chan.close()
	}
}

fn deflate(
	z: &mut Compress,
	mut input: &[u8],
	out: &mut Vec<u8>,
	flush: FlushCompress,
) -> io::Result<()> {
	let mut scratch = [0u8; READ_CHUNK];
	loop {
		let before_in = z.total_in();
		let before_out = z.total_out();
		let status = z
			.compress(input, &mut scratch, flush)
			.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
		let consumed = (z.total_in() - before_in) as usize;
		let produced = (z.total_out() - before_out) as usize;
		out.extend_from_slice(&scratch[..produced]);
		input = &input[consumed..];
		match flush {
			FlushCompress::Finish => {
				if status == flate2::Status::StreamEnd {
					return Ok(());
				}
			}
			_ => {
				if input.is_empty() && produced < scratch.len() {
					return Ok(());
				}
			}
		}
	}
}

/// Line reader over a local file.
#[derive(Debug)]
pub struct FileLineReader {
	rd: BufReader<File>,
}

impl FileLineReader {
	pub fn open(path: &std::path::Path) -> io::Result<Self> {
		Ok(FileLineReader { rd: BufReader::new(File::open(path)?) })
	}

	pub fn new(file: File) -> Self {
		FileLineReader { rd: BufReader::new(file) }
	}

	/// Next line with the terminator stripped, or None at EOF.
	pub fn getln(&mut self) -> io::Result<Option<Vec<u8>>> {
		let mut line = Vec::new();
		let n = self.rd.read_until(b'\n', &mut line)?;
		if n == 0 {
			return Ok(None);
		}
		if line.last() == Some(&b'\n') {
			line.pop();
		}
		Ok(Some(line))
	}
}

/// Buffered writer over a local file with an optional running MD5 of
/// the bytes written.
pub struct FileLineWriter {
	wr: BufWriter<File>,
	md5: Option<Md5>,
}

impl std::fmt::Debug for FileLineWriter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FileLineWriter").finish()
	}
}

impl FileLineWriter {
	pub fn new(file: File) -> Self {
		FileLineWriter { wr: BufWriter::new(file), md5: None }
	}

	pub fn md5_start(&mut self) {
		self.md5 = Some(Md5::new());
	}

	/// Stop hashing and return the hex digest of everything written
	/// since `md5_start`.
	pub fn md5_finish(&mut self) -> Option<String> {
		self.md5.take().map(|ctx| hex::encode(ctx.finalize()))
	}

	pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
		if let Some(ctx) = &mut self.md5 {
			ctx.update(bytes);
		}
		self.wr.write_all(bytes)
	}

	/// Flush and recover the underlying file.
	pub fn into_file(self) -> io::Result<File> {
		self.wr.into_inner().map_err(|e| e.into_error())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::{Read, Seek, SeekFrom};

	#[test]
	fn test_file_line_reader_strips_newline() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"one\ntwo\nlast").unwrap();
		let mut rd = FileLineReader::open(&path).unwrap();
		assert_eq!(rd.getln().unwrap().unwrap(), b"one");
		assert_eq!(rd.getln().unwrap().unwrap(), b"two");
		assert_eq!(rd.getln().unwrap().unwrap(), b"last");
		assert!(rd.getln().unwrap().is_none());
	}

	#[test]
	fn test_file_line_writer_md5() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		let mut wr = FileLineWriter::new(File::create(&path).unwrap());
		wr.md5_start();
		wr.write(b"hello\n").unwrap();
		wr.write(b"world\n").unwrap();
		let digest = wr.md5_finish().unwrap();
		// MD5 of "hello\nworld\n"
		assert_eq!(digest, "0f723ae7f9bf07744445e93ac5595156");
		let mut file = wr.into_file().unwrap();
		file.seek(SeekFrom::Start(0)).unwrap();
		let mut contents = String::new();
		file.read_to_string(&mut contents).unwrap();
		assert_eq!(contents, "hello\nworld\n");
	}
}

// vim: ts=4
