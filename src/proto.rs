//! Field encoding for the line-oriented protocol spoken on the wire and
//! in status files.
//!
//! Fields on a line are separated by single spaces; special characters
//! inside a field are escaped as `\_` (space), `\t` (tab), `\n` (newline)
//! and `\\` (backslash).  Integer tokens are decimal, time tokens are
//! signed decimal seconds since the epoch.

use std::borrow::Cow;

/// Escape a field for emission.
pub fn escape(s: &str) -> Cow<'_, str> {
	if !s.bytes().any(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\\')) {
		return Cow::Borrowed(s);
	}
	let mut out = String::with_capacity(s.len() + 8);
	for c in s.chars() {
		match c {
			' ' => out.push_str("\\_"),
			'\t' => out.push_str("\\t"),
			'\n' => out.push_str("\\n"),
			'\\' => out.push_str("\\\\"),
			_ => out.push(c),
		}
	}
	Cow::Owned(out)
}

fn unescape(s: &str) -> String {
	if !s.contains('\\') {
		return s.to_string();
	}
	let mut out = String::with_capacity(s.len());
	let mut it = s.chars();
	while let Some(c) = it.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match it.next() {
			Some('_') => out.push(' '),
			Some('t') => out.push('\t'),
			Some('n') => out.push('\n'),
			Some('\\') => out.push('\\'),
			// Unknown escapes collapse to the escaped character.
			Some(other) => out.push(other),
			None => break,
		}
	}
	out
}

/// Cursor over the space-separated fields of one protocol line.
///
/// Modeled after strsep(): an exhausted scanner returns None from every
/// getter, and `at_end()` tells whether the whole line was consumed
/// (trailing garbage is a protocol error for most commands).
#[derive(Debug)]
pub struct Scanner<'a> {
	rest: Option<&'a str>,
}

impl<'a> Scanner<'a> {
	pub fn new(line: &'a str) -> Self {
		Scanner { rest: Some(line) }
	}

	/// Next field, unescaped.
	pub fn get_ascii(&mut self) -> Option<String> {
		let rest = self.rest?;
		match rest.find(' ') {
			Some(pos) => {
				self.rest = Some(&rest[pos + 1..]);
				Some(unescape(&rest[..pos]))
			}
			None => {
				self.rest = None;
				Some(unescape(rest))
			}
		}
	}

	/// Next field, raw (no unescaping).
	pub fn get_raw(&mut self) -> Option<&'a str> {
		let rest = self.rest?;
		match rest.find(' ') {
			Some(pos) => {
				self.rest = Some(&rest[pos + 1..]);
				Some(&rest[..pos])
			}
			None => {
				self.rest = None;
				Some(rest)
			}
		}
	}

	/// Next field as a decimal integer.
	pub fn get_int(&mut self) -> Option<i64> {
		let tok = self.get_ascii()?;
		tok.parse().ok()
	}

	/// Next field as a time (signed decimal seconds since the epoch).
	pub fn get_time(&mut self) -> Option<i64> {
		self.get_int()
	}

	/// Everything that remains on the line, unsplit and unescaped.
	pub fn get_rest(&mut self) -> Option<String> {
		self.rest.take().map(unescape)
	}

	/// Everything that remains on the line, raw.
	pub fn get_rest_raw(&mut self) -> Option<&'a str> {
		self.rest.take()
	}

	/// True once the whole line has been consumed.
	pub fn at_end(&self) -> bool {
		self.rest.is_none()
	}
}


// vim: ts=4
