//! RCS grammar parser: admin section, deltas, description and (when a
//! writable parse is requested) the deltatexts.
//!
//! Unknown "newphrases" anywhere are skipped.  A deltatext naming a
//! revision with no matching delta is tolerated: the file is treated as
//! possibly corrupt and the checksum mismatch path will refetch it.

use crate::error::RcsError;
use crate::rcs::keyword::{decode_expand, ExpandMode};
use crate::rcs::lexer::{is_id, is_num, RcsLexer, TokKind};
use crate::stream::WireWriter;
use md5::{Digest, Md5};
use std::io;
use std::path::Path;

/// One revision of the file.
#[derive(Debug)]
pub struct Delta {
	pub revnum: String,
	pub revdate: String,
	pub author: String,
	pub state: Option<String>,
	pub next: Option<String>,
	pub log: Option<Vec<u8>>,
	pub text: Option<Vec<u8>>,
}

/// A parsed RCS file.
#[derive(Debug)]
pub struct RcsFile {
	/// Path relative to the collection prefix, as known to the server.
	pub name: String,
	pub head: String,
	pub branch: Option<String>,
	pub access: Vec<String>,
	/// Symbol table in file order, `(sym, num)` pairs.
	pub tags: Vec<(String, String)>,
	pub strict: bool,
	pub comment: Option<Vec<u8>>,
	pub expand: ExpandMode,
	pub desc: Vec<u8>,
	pub deltas: Vec<Delta>,
}

impl RcsFile {
	/// Parse the RCS file at `path`.  A read-only parse skips the
	/// deltatexts.
	pub fn parse(path: &Path, name: &str, read_only: bool) -> Result<RcsFile, RcsError> {
		let mut lex = RcsLexer::open(path).map_err(RcsError::Open)?;
		let mut rf = RcsFile {
			name: name.to_string(),
			head: String::new(),
			branch: None,
			access: Vec::new(),
			tags: Vec::new(),
			strict: false,
			comment: None,
			expand: ExpandMode::Default,
			desc: Vec::new(),
			deltas: Vec::new(),
		};
		let bad = |detail: &'static str| RcsError::Syntax { path: path.to_path_buf(), detail };

		parse_admin(&mut rf, &mut lex).map_err(bad)?;
		parse_deltas(&mut rf, &mut lex).map_err(bad)?;

		want_kw(&mut lex, b"desc").ok_or_else(|| bad("missing desc"))?;
		rf.desc = get_string(&mut lex).ok_or_else(|| bad("bad desc"))?;

		if !read_only {
			parse_deltatexts(&mut rf, &mut lex).map_err(bad)?;
		}
		Ok(rf)
	}

	/// Record a symbol from the admin section.
	pub fn import_tag(&mut self, sym: String, num: String) {
		self.tags.push((sym, num));
	}

	fn delta_mut(&mut self, revnum: &str) -> Option<&mut Delta> {
		self.deltas.iter_mut().find(|d| d.revnum == revnum)
	}

	/// Tell the server which revisions we already hold.  One line per
	/// delta in file order, each carrying the revision number, its date
	/// and the MD5 of the delta text, closed off with a dot.
	pub fn send_details(&self, wr: &mut WireWriter) -> io::Result<()> {
		wr.write_str(&format!("V {}\n", crate::proto::escape(&self.name)))?;
		for delta in &self.deltas {
			let text = match &delta.text {
				Some(text) => text,
				None => continue,
			};
			let md5 = hex::encode(Md5::digest(text));
			wr.write_str(&format!("{} {} {}\n", delta.revnum, delta.revdate, md5))?;
		}
		wr.write_str(".\n")?;
		Ok(())
	}
}

fn want_kw(lex: &mut RcsLexer, kw: &[u8]) -> Option<()> {
	let tok = lex.get()?;
	if tok.kind == TokKind::Id && tok.value == kw {
		Some(())
	} else {
		None
	}
}

fn want_scolon(lex: &mut RcsLexer) -> Option<()> {
	let tok = lex.get()?;
	if tok.kind == TokKind::Semicolon {
		Some(())
	} else {
		None
	}
}

fn want_colon(lex: &mut RcsLexer) -> Option<()> {
	let tok = lex.get()?;
	if tok.kind == TokKind::Colon {
		Some(())
	} else {
		None
	}
}

fn get_num(lex: &mut RcsLexer) -> Option<String> {
	let tok = lex.get()?;
	if tok.kind == TokKind::Id && is_num(tok.value) {
		Some(String::from_utf8_lossy(tok.value).into_owned())
	} else {
		None
	}
}

fn get_id(lex: &mut RcsLexer) -> Option<String> {
	let tok = lex.get()?;
	if tok.kind == TokKind::Id && is_id(tok.value) {
		Some(String::from_utf8_lossy(tok.value).into_owned())
	} else {
		None
	}
}

fn get_string(lex: &mut RcsLexer) -> Option<Vec<u8>> {
	let tok = lex.get()?;
	if tok.kind == TokKind::Str {
		Some(tok.value.to_vec())
	} else {
		None
	}
}

/// Skip tokens up to and including the terminating semicolon of a
/// newphrase.
fn skip_newphrase(lex: &mut RcsLexer) -> Option<()> {
	loop {
		let tok = lex.get()?;
		match tok.kind {
			TokKind::Id | TokKind::Str | TokKind::Colon => continue,
			TokKind::Semicolon => return Some(()),
		}
	}
}

fn parse_admin(rf: &mut RcsFile, lex: &mut RcsLexer) -> Result<(), &'static str> {
	// head num;
	want_kw(lex, b"head").ok_or("missing head")?;
	rf.head = get_num(lex).ok_or("bad head")?;
	want_scolon(lex).ok_or("bad head")?;

	// { branch num; }
	let mut tok = lex.get().ok_or("truncated admin section")?;
	if tok.kind == TokKind::Id && tok.value == b"branch" {
		rf.branch = Some(get_num(lex).ok_or("bad branch")?);
		want_scolon(lex).ok_or("bad branch")?;
		tok = lex.get().ok_or("truncated admin section")?;
	}

	// access {id}*;
	if !(tok.kind == TokKind::Id && tok.value == b"access") {
		return Err("missing access");
	}
	loop {
		let tok = lex.get().ok_or("truncated access list")?;
		match tok.kind {
			TokKind::Id => {
				let id = String::from_utf8_lossy(tok.value).into_owned();
				rf.access.push(id);
			}
			TokKind::Semicolon => break,
			_ => return Err("bad access list"),
		}
	}

	// symbols {sym : num}*;
	want_kw(lex, b"symbols").ok_or("missing symbols")?;
	loop {
		let tok = lex.get().ok_or("truncated symbols")?;
		match tok.kind {
			TokKind::Id => {
				let sym = String::from_utf8_lossy(tok.value).into_owned();
				want_colon(lex).ok_or("bad symbol")?;
				let num = get_num(lex).ok_or("bad symbol")?;
				rf.import_tag(sym, num);
			}
			TokKind::Semicolon => break,
			_ => return Err("bad symbols"),
		}
	}

	// locks {id : num}*;  The locks are of no interest and skipped.
	want_kw(lex, b"locks").ok_or("missing locks")?;
	loop {
		let tok = lex.get().ok_or("truncated locks")?;
		match tok.kind {
			TokKind::Id => {
				want_colon(lex).ok_or("bad lock")?;
				let tok = lex.get().ok_or("bad lock")?;
				if tok.kind != TokKind::Id {
					return Err("bad lock");
				}
			}
			TokKind::Semicolon => break,
			_ => return Err("bad locks"),
		}
	}

	// Optional sections and newphrases until the deltas begin.
	loop {
		let tok = match lex.get() {
			Some(tok) => tok,
			None => break,
		};
		if tok.kind != TokKind::Id {
			return Err("bad admin section");
		}
		if tok.value == b"strict" {
			rf.strict = true;
			want_scolon(lex).ok_or("bad strict")?;
		} else if tok.value == b"comment" {
			rf.comment = Some(get_string(lex).ok_or("bad comment")?);
			want_scolon(lex).ok_or("bad comment")?;
		} else if tok.value == b"expand" {
			let s = get_string(lex).ok_or("bad expand")?;
			let s = String::from_utf8_lossy(&s).into_owned();
			rf.expand = decode_expand(&s).ok_or("unknown expand mode")?;
			want_scolon(lex).ok_or("bad expand")?;
		} else if is_id(tok.value) {
			skip_newphrase(lex).ok_or("truncated newphrase")?;
		} else {
			lex.unget();
			break;
		}
	}
	Ok(())
}

fn parse_deltas(rf: &mut RcsFile, lex: &mut RcsLexer) -> Result<(), &'static str> {
	loop {
		let tok = match lex.get() {
			Some(tok) => tok,
			None => return Ok(()),
		};
		if tok.kind != TokKind::Id || !is_num(tok.value) {
			// End of the deltas.
			lex.unget();
			return Ok(());
		}
		let revnum = String::from_utf8_lossy(tok.value).into_owned();

		// date num;
		want_kw(lex, b"date").ok_or("bad delta date")?;
		let revdate = get_num(lex).ok_or("bad delta date")?;
		want_scolon(lex).ok_or("bad delta date")?;

		// author id;
		want_kw(lex, b"author").ok_or("bad delta author")?;
		let author = get_id(lex).ok_or("bad delta author")?;
		want_scolon(lex).ok_or("bad delta author")?;

		// state {id};
		want_kw(lex, b"state").ok_or("bad delta state")?;
		let mut state = None;
		let mut tok = lex.get().ok_or("bad delta state")?;
		if tok.kind == TokKind::Id && is_id(tok.value) {
			state = Some(String::from_utf8_lossy(tok.value).into_owned());
			tok = lex.get().ok_or("bad delta state")?;
		}
		if tok.kind != TokKind::Semicolon {
			return Err("bad delta state");
		}

		// branches {num}*;  Branch revisions are not followed.
		want_kw(lex, b"branches").ok_or("bad delta branches")?;
		loop {
			let tok = lex.get().ok_or("bad delta branches")?;
			match tok.kind {
				TokKind::Id if is_num(tok.value) => continue,
				TokKind::Semicolon => break,
				_ => return Err("bad delta branches"),
			}
		}

		// next {num};
		want_kw(lex, b"next").ok_or("bad delta next")?;
		let mut next = None;
		let mut tok = lex.get().ok_or("bad delta next")?;
		if tok.kind == TokKind::Id && is_num(tok.value) {
			next = Some(String::from_utf8_lossy(tok.value).into_owned());
			tok = lex.get().ok_or("bad delta next")?;
		}
		if tok.kind != TokKind::Semicolon {
			return Err("bad delta next");
		}

		// { newphrase }* until the next delta or "desc".
		loop {
			let tok = match lex.get() {
				Some(tok) => tok,
				None => return Err("truncated deltas"),
			};
			if tok.kind == TokKind::Id && tok.value != b"desc" && is_id(tok.value) {
				skip_newphrase(lex).ok_or("truncated newphrase")?;
			} else {
				lex.unget();
				break;
			}
		}

		rf.deltas.push(Delta { revnum, revdate, author, state, next, log: None, text: None });
	}
}

fn parse_deltatexts(rf: &mut RcsFile, lex: &mut RcsLexer) -> Result<(), &'static str> {
	loop {
		let revnum = match lex.get() {
			Some(tok) => {
				if tok.kind != TokKind::Id || !is_num(tok.value) {
					return Err("bad deltatext");
				}
				String::from_utf8_lossy(tok.value).into_owned()
			}
			None => break,
		};

		// log string
		want_kw(lex, b"log").ok_or("bad deltatext log")?;
		let log = get_string(lex).ok_or("bad deltatext log")?;

		// { newphrase }* until "text".
		loop {
			let tok = lex.get().ok_or("truncated deltatext")?;
			if tok.kind == TokKind::Id && tok.value != b"text" && is_id(tok.value) {
				skip_newphrase(lex).ok_or("truncated newphrase")?;
			} else {
				lex.unget();
				break;
			}
		}

		// text string
		want_kw(lex, b"text").ok_or("bad deltatext")?;
		let text = get_string(lex).ok_or("bad deltatext")?;

		match rf.delta_mut(&revnum) {
			Some(delta) => {
				delta.log = Some(log);
				delta.text = Some(text);
			}
			// No such delta: the file is possibly corrupt, but the
			// checksum mismatch will take care of refetching it.
			None => return Ok(()),
		}
	}
	Ok(())
}


// vim: ts=4
