//! RCS tokenizer.
//!
//! The file is memory-mapped and tokens borrow directly from the map,
//! so their lifetime is tied to the lexer.  The lexer distinguishes
//! very little on its own: it eats whitespace and yields semicolons,
//! colons, `@`-delimited strings (with `@@` escaping a literal `@`;
//! these may be binary, the doubled `@`s are left in place) and bare
//! identifier runs.  What an identifier means (num, id, sym, keyword)
//! depends on grammar position and is validated by the caller.

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokKind {
	Str,
	Semicolon,
	Colon,
	Id,
}

#[derive(Clone, Copy, Debug)]
pub struct Token<'a> {
	pub kind: TokKind,
	pub value: &'a [u8],
}

pub struct RcsLexer {
	map: Mmap,
	pos: usize,
	tok_start: usize,
	eof: bool,
}

impl std::fmt::Debug for RcsLexer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RcsLexer").field("pos", &self.pos).field("eof", &self.eof).finish()
	}
}

impl RcsLexer {
	/// Map the RCS file into memory.  The map and its file descriptor
	/// are released when the lexer is dropped.
	#[allow(unsafe_code)]
	pub fn open(path: &Path) -> io::Result<RcsLexer> {
		let file = File::open(path)?;
		let len = file.metadata()?.len();
		if len == 0 {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "empty RCS file"));
		}
		// SAFETY: the mapping is read-only and we assume the RCS file
		// is not truncated underneath us while parsing, the same
		// assumption every RCS reader makes.
		let map = unsafe { Mmap::map(&file)? };
		Ok(RcsLexer { map, pos: 0, tok_start: 0, eof: false })
	}

	pub fn eof(&self) -> bool {
		self.eof
	}

	/// Next token, or None at EOF or on an unterminated string.
	pub fn get(&mut self) -> Option<Token<'_>> {
		if self.eof {
			return None;
		}
		let data: &[u8] = &self.map;
		let mut cp = self.pos;
		while cp < data.len() && data[cp].is_ascii_whitespace() {
			cp += 1;
		}
		if cp >= data.len() {
			self.eof = true;
			return None;
		}
		self.tok_start = cp;

		if data[cp] == b'@' {
			// A possibly binary RCS string; find its closing '@',
			// skipping doubled ones.
			cp += 1;
			let start = cp;
			loop {
				let sep = match data[cp..].iter().position(|&b| b == b'@') {
					Some(off) => cp + off,
					None => return None,
				};
				if sep + 1 >= data.len() || data[sep + 1] != b'@' {
					self.pos = sep + 1;
					return Some(Token { kind: TokKind::Str, value: &self.map[start..sep] });
				}
				cp = sep + 2;
			}
		}
		if data[cp] == b';' {
			self.pos = cp + 1;
			return Some(Token { kind: TokKind::Semicolon, value: &self.map[cp..cp + 1] });
		}
		if data[cp] == b':' {
			self.pos = cp + 1;
			return Some(Token { kind: TokKind::Colon, value: &self.map[cp..cp + 1] });
		}
		// A regular symbol (sym, num, id or a keyword).
		let start = cp;
		while cp < data.len()
			&& data[cp] != b'@'
			&& data[cp] != b';'
			&& data[cp] != b':'
			&& !data[cp].is_ascii_whitespace()
		{
			cp += 1;
		}
		self.pos = cp;
		Some(Token { kind: TokKind::Id, value: &self.map[start..cp] })
	}

	/// Push the last token back.  Only meaningful for Id tokens, which
	/// is all the grammar ever ungets.
	pub fn unget(&mut self) {
		self.pos = self.tok_start;
	}
}

/// A num is digits and dots only.
pub fn is_num(value: &[u8]) -> bool {
	!value.is_empty() && value.iter().all(|&c| c.is_ascii_digit() || c == b'.')
}

/// An id forbids `$,:;@` and unprintable bytes and needs at least one
/// character that is neither a digit nor a dot.
pub fn is_id(value: &[u8]) -> bool {
	let mut idchar = false;
	for &c in value {
		if b"$,:;@".contains(&c) || !c.is_ascii_graphic() {
			return false;
		}
		if !idchar && !c.is_ascii_digit() && c != b'.' {
			idchar = true;
		}
	}
	idchar
}

/// A sym additionally forbids dots and needs at least one non-digit.
pub fn is_sym(value: &[u8]) -> bool {
	let mut idchar = false;
	for &c in value {
		if b"$,.:;@".contains(&c) || !c.is_ascii_graphic() {
			return false;
		}
		if !idchar && !c.is_ascii_digit() {
			idchar = true;
		}
	}
	idchar
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Write;

	fn lexer_for(content: &[u8]) -> (tempfile::TempDir, RcsLexer) {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f,v");
		let mut f = File::create(&path).unwrap();
		f.write_all(content).unwrap();
		drop(f);
		(dir, RcsLexer::open(&path).unwrap())
	}

	#[test]
	fn test_basic_tokens() {
		let (_d, mut lex) = lexer_for(b"head 1.2;\n");
		let t = lex.get().unwrap();
		assert_eq!(t.kind, TokKind::Id);
		assert_eq!(t.value, b"head");
		let t = lex.get().unwrap();
		assert_eq!(t.value, b"1.2");
		assert_eq!(lex.get().unwrap().kind, TokKind::Semicolon);
		assert!(lex.get().is_none());
		assert!(lex.eof());
	}

	#[test]
	fn test_string_with_escaped_at() {
		let (_d, mut lex) = lexer_for(b"@a@@b@ ;");
		let t = lex.get().unwrap();
		assert_eq!(t.kind, TokKind::Str);
		// The doubled '@' stays doubled in the raw token.
		assert_eq!(t.value, b"a@@b");
		assert_eq!(lex.get().unwrap().kind, TokKind::Semicolon);
	}

	#[test]
	fn test_unterminated_string() {
		let (_d, mut lex) = lexer_for(b"@never closed");
		assert!(lex.get().is_none());
	}

	#[test]
	fn test_unget() {
		let (_d, mut lex) = lexer_for(b"alpha beta");
		assert_eq!(lex.get().unwrap().value, b"alpha");
		lex.unget();
		assert_eq!(lex.get().unwrap().value, b"alpha");
		assert_eq!(lex.get().unwrap().value, b"beta");
	}

	#[test]
	fn test_validators() {
		assert!(is_num(b"1.2.3"));
		assert!(!is_num(b"1a"));
		assert!(is_id(b"bob"));
		assert!(is_id(b"r1.2x"));
		assert!(!is_id(b"1.2"));
		assert!(!is_id(b"a;b"));
		assert!(is_sym(b"RELENG_5"));
		assert!(!is_sym(b"REL.5"));
		assert!(!is_sym(b"123"));
	}
}

// vim: ts=4
