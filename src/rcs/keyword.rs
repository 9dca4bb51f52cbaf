//! CVS keyword expansion.
//!
//! Scans emitted lines for `$Key$` or `$Key:oldvalue$` occurrences of
//! the enabled keywords and rewrites them according to the collection's
//! expansion mode.  The server can declare aliases for the standard
//! keywords and turn individual keywords on and off during the
//! collection exchange.

use crate::util;

/// CVS expansion modes, in their RCS `expand` spellings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpandMode {
	Default,
	KeyValue,
	KeyValueLocker,
	Key,
	Old,
	Binary,
	Value,
}

/// Decode the wire/RCS spelling of an expansion mode.
pub fn decode_expand(s: &str) -> Option<ExpandMode> {
	match s {
		"." => Some(ExpandMode::Default),
		"kv" => Some(ExpandMode::KeyValue),
		"kvl" => Some(ExpandMode::KeyValueLocker),
		"k" => Some(ExpandMode::Key),
		"o" => Some(ExpandMode::Old),
		"b" => Some(ExpandMode::Binary),
		"v" => Some(ExpandMode::Value),
		_ => None,
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RcsKey {
	Author,
	CvsHeader,
	Date,
	Header,
	Id,
	Locker,
	Log,
	Name,
	RcsFile,
	Revision,
	Source,
	State,
}

/// The standard CVS keywords.
const TAG_DEFAULTS: [(&str, RcsKey); 12] = [
	("Author", RcsKey::Author),
	("CVSHeader", RcsKey::CvsHeader),
	("Date", RcsKey::Date),
	("Header", RcsKey::Header),
	("Id", RcsKey::Id),
	("Locker", RcsKey::Locker),
	("Log", RcsKey::Log),
	("Name", RcsKey::Name),
	("RCSfile", RcsKey::RcsFile),
	("Revision", RcsKey::Revision),
	("Source", RcsKey::Source),
	("State", RcsKey::State),
];

#[derive(Clone, Debug)]
struct Tag {
	ident: String,
	key: RcsKey,
}

/// Per-collection keyword table: the enabled keywords plus any aliases
/// the server declared.
#[derive(Clone, Debug, Default)]
pub struct KeywordTable {
	enabled: Vec<Tag>,
	aliases: Vec<Tag>,
}

impl KeywordTable {
	pub fn new() -> KeywordTable {
		KeywordTable::default()
	}

	/// Declare `ident` as an alias for the standard keyword `rcskey`.
	pub fn alias(&mut self, ident: &str, rcskey: &str) -> Result<(), ()> {
		for (name, key) in &TAG_DEFAULTS {
			if *name == rcskey {
				self.aliases.insert(0, Tag { ident: ident.to_string(), key: *key });
				return Ok(());
			}
		}
		Err(())
	}

	/// Enable a keyword, or every known keyword and alias for ".".
	pub fn enable(&mut self, ident: &str) -> Result<(), ()> {
		let all = ident == ".";
		for (name, key) in &TAG_DEFAULTS {
			if all || *name == ident {
				self.enabled.push(Tag { ident: (*name).to_string(), key: *key });
				if !all {
					return Ok(());
				}
			}
		}
		let aliases = self.aliases.clone();
		for tag in aliases {
			if all || tag.ident == ident {
				let found = !all;
				self.enabled.push(tag);
				if found {
					return Ok(());
				}
			}
		}
		if all {
			Ok(())
		} else {
			Err(())
		}
	}

	/// Disable a keyword, or everything for ".".
	pub fn disable(&mut self, ident: &str) -> Result<(), ()> {
		if ident == "." {
			self.enabled.clear();
			return Ok(());
		}
		match self.enabled.iter().position(|t| t.ident == ident) {
			Some(pos) => {
				self.enabled.remove(pos);
				Ok(())
			}
			None => Err(()),
		}
	}

	fn find(&self, key: &[u8]) -> Option<&Tag> {
		self.enabled.iter().find(|t| t.ident.as_bytes() == key)
	}

	/// Expand the keywords on one line.  Modes Old and Binary leave the
	/// line untouched.
	pub fn expand_line(&self, ctx: &ExpandContext<'_>, line: &[u8]) -> Vec<u8> {
		let mut cur = line.to_vec();
		if ctx.mode == ExpandMode::Old || ctx.mode == ExpandMode::Binary {
			return cur;
		}
		let mut from = 0;
		loop {
			let dollar = match cur[from..].iter().position(|&b| b == b'$') {
				Some(off) => from + off,
				None => return cur,
			};
			let keystart = dollar + 1;
			let vallim = match cur[keystart..].iter().position(|&b| b == b'$') {
				Some(off) => keystart + off,
				None => return cur,
			};
			if vallim == keystart {
				// "$$": the second dollar may open a real keyword.
				from = keystart;
				continue;
			}
			let keyend = match cur[keystart..vallim].iter().position(|&b| b == b':') {
				Some(0) => {
					from = vallim;
					continue;
				}
				Some(off) => keystart + off,
				None => vallim,
			};
			let tag = match self.find(&cur[keystart..keyend]) {
				Some(tag) => tag,
				None => {
					from = vallim + 1;
					continue;
				}
			};
			let key = cur[keystart..keyend].to_vec();
			let replacement: Vec<u8> = match ctx.mode {
				ExpandMode::Key => {
					let mut r = Vec::with_capacity(key.len() + 2);
					r.push(b'$');
					r.extend_from_slice(&key);
					r.push(b'$');
					r
				}
				ExpandMode::Value => match expand_tag(tag.key, ctx) {
					Some(val) => val.into_bytes(),
					None => {
						from = vallim + 1;
						continue;
					}
				},
				_ => match expand_tag(tag.key, ctx) {
					Some(val) => {
						let mut r = Vec::new();
						r.push(b'$');
						r.extend_from_slice(&key);
						r.extend_from_slice(b": ");
						r.extend_from_slice(val.as_bytes());
						r.extend_from_slice(b" $");
						r
					}
					None => {
						from = vallim + 1;
						continue;
					}
				},
			};
			let mut next = Vec::with_capacity(cur.len() - (vallim - dollar) + replacement.len());
			next.extend_from_slice(&cur[..dollar]);
			next.extend_from_slice(&replacement);
			next.extend_from_slice(&cur[vallim + 1..]);
			from = dollar + replacement.len();
			cur = next;
		}
	}
}

/// Everything needed to compute keyword values for one delta.
#[derive(Debug)]
pub struct ExpandContext<'a> {
	/// RCS file path relative to the CVS root
	pub rcsfile: &'a str,
	pub cvsroot: &'a str,
	pub revnum: &'a str,
	pub revdate: &'a str,
	pub author: &'a str,
	pub state: &'a str,
	pub tag: Option<&'a str>,
	pub mode: ExpandMode,
}

/// Value of one keyword, or None when the keyword has no value here
/// (the occurrence is then left alone).
fn expand_tag(key: RcsKey, ctx: &ExpandContext<'_>) -> Option<String> {
	let cvsdate = util::rcsdate_to_cvsdate(ctx.revdate)?;
	let filename = util::path_last(ctx.rcsfile);
	match key {
		RcsKey::Author => Some(ctx.author.to_string()),
		RcsKey::CvsHeader => Some(format!(
			"{} {} {} {} {}",
			ctx.rcsfile, ctx.revnum, cvsdate, ctx.author, ctx.state
		)),
		RcsKey::Date => Some(cvsdate),
		RcsKey::Header => Some(format!(
			"{}/{} {} {} {} {}",
			ctx.cvsroot, ctx.rcsfile, ctx.revnum, cvsdate, ctx.author, ctx.state
		)),
		RcsKey::Id => Some(format!(
			"{} {} {} {} {}",
			filename, ctx.revnum, cvsdate, ctx.author, ctx.state
		)),
		RcsKey::Locker => None,
		RcsKey::Log => None,
		RcsKey::Name => ctx.tag.map(|t| t.to_string()),
		RcsKey::RcsFile => Some(filename.to_string()),
		RcsKey::Revision => Some(ctx.revnum.to_string()),
		RcsKey::Source => Some(format!("{}/{}", ctx.cvsroot, ctx.rcsfile)),
		RcsKey::State => Some(ctx.state.to_string()),
	}
}


// vim: ts=4
