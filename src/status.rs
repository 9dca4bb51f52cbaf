//! The per-collection status file: the client's persisted belief about
//! every file it holds.
//!
//! The file is a sorted text stream (see `util::pathcmp`; a `U` record
//! closes the directory its path names, so it sorts after everything
//! inside).  Reading validates the order and the D/U nesting.  Writing
//! is a merge: records stream from the old file to a tempfile, with
//! lookups, upserts and deletes splicing changes in along the way, and
//! close() renames the tempfile over the original.  A path compressor
//! keeps the emitted D/U brackets well-formed no matter what was
//! spliced.

use crate::config::Collection;
use crate::error::StatusError;
use crate::fattr::Fattr;
use crate::logging::*;
use crate::pathcomp::{CompOp, PathComp, PathOp};
use crate::proto::{escape, Scanner};
use crate::stream::FileLineReader;
use crate::util;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

pub const STATUS_VERSION: i64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecKind {
	DirDown,
	CheckoutLive,
	CheckoutDead,
	DirUp,
}

impl RecKind {
	fn cmd(self) -> char {
		match self {
			RecKind::DirDown => 'D',
			RecKind::DirUp => 'U',
			RecKind::CheckoutLive => 'C',
			RecKind::CheckoutDead => 'c',
		}
	}
}

/// One record of the status file.
#[derive(Clone, Debug)]
pub struct StatusRec {
	pub file: String,
	pub detail: RecDetail,
}

#[derive(Clone, Debug)]
pub enum RecDetail {
	DirDown,
	DirUp {
		clientattr: Fattr,
	},
	CheckoutLive {
		tag: String,
		date: String,
		serverattr: Fattr,
		revnum: String,
		revdate: String,
		clientattr: Fattr,
	},
	CheckoutDead {
		tag: String,
		date: String,
		serverattr: Fattr,
	},
}

impl StatusRec {
	pub fn kind(&self) -> RecKind {
		match self.detail {
			RecDetail::DirDown => RecKind::DirDown,
			RecDetail::DirUp { .. } => RecKind::DirUp,
			RecDetail::CheckoutLive { .. } => RecKind::CheckoutLive,
			RecDetail::CheckoutDead { .. } => RecKind::CheckoutDead,
		}
	}
}

/// Status file ordering: paths compare with `/` as code point 1, and a
/// DirUp record sorts after everything inside the directory it closes
/// (including the equal path itself).
pub fn statusrec_cmp(akind: RecKind, afile: &str, bkind: RecKind, bfile: &str) -> Ordering {
	if akind == RecKind::DirUp || bkind == RecKind::DirUp {
		let lena = afile.len();
		let lenb = bfile.len();
		if akind == RecKind::DirUp
			&& ((lena < lenb && bfile.as_bytes()[lena] == b'/') || lena == lenb)
			&& bfile.as_bytes().starts_with(afile.as_bytes())
		{
			return Ordering::Greater;
		}
		if bkind == RecKind::DirUp
			&& ((lenb < lena && afile.as_bytes()[lenb] == b'/') || lenb == lena)
			&& afile.as_bytes().starts_with(bfile.as_bytes())
		{
			return Ordering::Less;
		}
	}
	util::pathcmp(afile, bfile)
}

/// A record as read, with its payload still unparsed so it can be
/// copied through verbatim.
#[derive(Clone, Debug)]
struct RawRec {
	kind: RecKind,
	file: String,
	rest: String,
}

struct Writer {
	out: BufWriter<File>,
	temppath: PathBuf,
	pc: PathComp,
}

/// Open status store.  `Reading` only walks the old file; `Writing`
/// additionally streams records into a tempfile that replaces the old
/// file on close.
pub struct Status {
	path: PathBuf,
	rd: Option<FileLineReader>,
	wr: Option<Writer>,
	pending: Option<RawRec>,
	last: Option<(RecKind, String)>,
	eof: bool,
	linenum: u64,
	depth: i64,
	dirty: bool,
	scantime: i64,
}

impl std::fmt::Debug for Status {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Status")
			.field("path", &self.path)
			.field("linenum", &self.linenum)
			.finish()
	}
}

impl Drop for Status {
	fn drop(&mut self) {
		// An abandoned writer leaves no stray tempfile behind.
		if let Some(wr) = self.wr.take() {
			let _ = std::fs::remove_file(&wr.temppath);
		}
	}
}

impl Status {
	/// Open the status file of a collection.  With a scan time given
	/// the store is opened for updating and the rewritten file will
	/// record that scan time; otherwise it is read-only.  A missing
	/// file reads as empty.
	pub fn open(
		coll: &Collection,
		colldir: &str,
		scantime: Option<i64>,
	) -> Result<Status, StatusError> {
		let path = coll.status_path(colldir);
		let rd = match FileLineReader::open(&path) {
			Ok(rd) => Some(rd),
			Err(e) => {
				if e.kind() != io::ErrorKind::NotFound {
					warn!("Could not open \"{}\": {}", path.display(), e);
				}
				None
			}
		};
		let mut st = Status {
			eof: rd.is_none(),
			path,
			rd,
			wr: None,
			pending: None,
			last: None,
			linenum: 0,
			depth: 0,
			dirty: false,
			scantime: -1,
		};
		if st.rd.is_some() {
			st.read_header()?;
		}

		if let Some(newtime) = scantime {
			st.open_writer(coll, colldir, newtime)?;
		}
		Ok(st)
	}

	fn read_header(&mut self) -> Result<(), StatusError> {
		let line = match self.getln_checked()? {
			Some(line) => line,
			None => return Err(self.corrupt("missing header")),
		};
		self.linenum = 1;
		let mut sc = Scanner::new(&line);
		let id = sc.get_ascii();
		let ver = sc.get_int();
		let scantime = sc.get_time();
		if id.as_deref() != Some("F") || scantime.is_none() || !sc.at_end() {
			return Err(self.corrupt("unparseable header"));
		}
		if ver != Some(STATUS_VERSION) {
			return Err(self.corrupt("version mismatch"));
		}
		self.scantime = scantime.expect("checked above");
		Ok(())
	}

	fn open_writer(
		&mut self,
		coll: &Collection,
		colldir: &str,
		newtime: i64,
	) -> Result<(), StatusError> {
		let dir = coll.base.join(colldir).join(&coll.name);
		std::fs::create_dir_all(&dir)
			.map_err(|e| StatusError::Create { path: dir.clone(), source: e })?;
		let temppath = util::tempname(&self.path);
		let file = File::create(&temppath)
			.map_err(|e| StatusError::Create { path: temppath.clone(), source: e })?;
		let mut fa = Fattr::new(crate::fattr::FileType::File);
		fa.merge_default();
		fa.apply_umask(coll.umask);
		fa.install(None, &temppath)
			.map_err(|e| StatusError::Create { path: temppath.clone(), source: e })?;
		let mut out = BufWriter::new(file);
		writeln!(out, "F {} {}", STATUS_VERSION, newtime)
			.map_err(|e| StatusError::Write { path: temppath.clone(), source: e })?;
		if newtime != self.scantime {
			self.dirty = true;
		}
		self.wr = Some(Writer { out, temppath, pc: PathComp::new() });
		Ok(())
	}

	/// Scan time recorded in the file that was read.
	pub fn scantime(&self) -> i64 {
		self.scantime
	}

	fn corrupt(&self, reason: &str) -> StatusError {
		StatusError::Corrupt {
			path: self.path.clone(),
			line: self.linenum,
			reason: reason.to_string(),
		}
	}

	fn getln_checked(&mut self) -> Result<Option<String>, StatusError> {
		let rd = match &mut self.rd {
			Some(rd) => rd,
			None => return Ok(None),
		};
		match rd.getln() {
			Ok(Some(line)) => Ok(Some(String::from_utf8_lossy(&line).into_owned())),
			Ok(None) => Ok(None),
			Err(e) => Err(StatusError::Corrupt {
				path: self.path.clone(),
				line: self.linenum,
				reason: format!("read error: {}", e),
			}),
		}
	}

	fn read_raw(&mut self) -> Result<Option<RawRec>, StatusError> {
		if self.eof {
			return Ok(None);
		}
		let line = match self.getln_checked()? {
			Some(line) => line,
			None => {
				self.eof = true;
				return Ok(None);
			}
		};
		self.linenum += 1;
		let mut sc = Scanner::new(&line);
		let cmd = sc.get_ascii().unwrap_or_default();
		let file = match sc.get_ascii() {
			Some(file) => file,
			None => return Err(self.corrupt("truncated record")),
		};
		let kind = match cmd.as_str() {
			"D" => {
				self.depth += 1;
				RecKind::DirDown
			}
			"C" => RecKind::CheckoutLive,
			"c" => RecKind::CheckoutDead,
			"U" => {
				if self.depth <= 0 {
					return Err(self.corrupt("\"U\" entry has no matching \"D\""));
				}
				self.depth -= 1;
				RecKind::DirUp
			}
			_ => return Err(self.corrupt("invalid record type")),
		};
		if let Some((lkind, lfile)) = &self.last {
			if statusrec_cmp(*lkind, lfile, kind, &file) != Ordering::Less {
				return Err(self.corrupt("file is not sorted properly"));
			}
		}
		self.last = Some((kind, file.clone()));
		let rest = sc.get_rest_raw().unwrap_or("").to_string();
		Ok(Some(RawRec { kind, file, rest }))
	}

	fn cook(&self, raw: &RawRec) -> Result<StatusRec, StatusError> {
		let mut sc = Scanner::new(&raw.rest);
		let detail = match raw.kind {
			RecKind::DirDown => RecDetail::DirDown,
			RecKind::DirUp => {
				let attr = sc.get_ascii().ok_or_else(|| self.corrupt("truncated record"))?;
				if !sc.at_end() {
					return Err(self.corrupt("trailing fields"));
				}
				let clientattr =
					Fattr::decode(&attr).ok_or_else(|| self.corrupt("bad attributes"))?;
				RecDetail::DirUp { clientattr }
			}
			RecKind::CheckoutLive => {
				let tag = sc.get_ascii();
				let date = sc.get_ascii();
				let serverattr = sc.get_ascii();
				let revnum = sc.get_ascii();
				let revdate = sc.get_ascii();
				let clientattr = sc.get_ascii();
				if clientattr.is_none() || !sc.at_end() {
					return Err(self.corrupt("truncated record"));
				}
				let serverattr = Fattr::decode(&serverattr.expect("checked above"))
					.ok_or_else(|| self.corrupt("bad attributes"))?;
				let clientattr = Fattr::decode(&clientattr.expect("checked above"))
					.ok_or_else(|| self.corrupt("bad attributes"))?;
				RecDetail::CheckoutLive {
					tag: tag.expect("checked above"),
					date: date.expect("checked above"),
					serverattr,
					revnum: revnum.expect("checked above"),
					revdate: revdate.expect("checked above"),
					clientattr,
				}
			}
			RecKind::CheckoutDead => {
				let tag = sc.get_ascii();
				let date = sc.get_ascii();
				let serverattr = sc.get_ascii();
				if serverattr.is_none() || !sc.at_end() {
					return Err(self.corrupt("truncated record"));
				}
				let serverattr = Fattr::decode(&serverattr.expect("checked above"))
					.ok_or_else(|| self.corrupt("bad attributes"))?;
				RecDetail::CheckoutDead {
					tag: tag.expect("checked above"),
					date: date.expect("checked above"),
					serverattr,
				}
			}
		};
		Ok(StatusRec { file: raw.file.clone(), detail })
	}

	/// Payload text of a record, either copied through raw or encoded
	/// from a cooked record.
	fn payload_of(rec: &StatusRec) -> String {
		match &rec.detail {
			RecDetail::DirDown => String::new(),
			RecDetail::DirUp { clientattr } => escape(&clientattr.encode(None)).into_owned(),
			RecDetail::CheckoutLive { tag, date, serverattr, revnum, revdate, clientattr } => {
				format!(
					"{} {} {} {} {} {}",
					escape(tag),
					escape(date),
					escape(&serverattr.encode(None)),
					escape(revnum),
					escape(revdate),
					escape(&clientattr.encode(None))
				)
			}
			RecDetail::CheckoutDead { tag, date, serverattr } => format!(
				"{} {} {}",
				escape(tag),
				escape(date),
				escape(&serverattr.encode(None))
			),
		}
	}

	fn emit(
		&mut self,
		kind: RecKind,
		file: &str,
		payload: &str,
	) -> Result<(), StatusError> {
		let wr = match &mut self.wr {
			Some(wr) => wr,
			None => return Ok(()),
		};
		let op = match kind {
			RecKind::DirDown => PathOp::DirDown,
			RecKind::DirUp => PathOp::DirUp,
			_ => PathOp::File,
		};
		wr.pc.put(op, file);
		let mut own_attr_used = false;
		let mut res: io::Result<()> = Ok(());
		while let Some((cop, name)) = wr.pc.get() {
			res = match cop {
				CompOp::DirDown => writeln!(wr.out, "D {}", escape(&name)),
				CompOp::DirUp => {
					let attr = if kind == RecKind::DirUp && !own_attr_used {
						own_attr_used = true;
						payload.to_string()
					} else {
						escape(&Fattr::bogus().encode(None)).into_owned()
					};
					writeln!(wr.out, "U {} {}", escape(&name), attr)
				}
			};
			if res.is_err() {
				break;
			}
		}
		if res.is_ok() && !matches!(kind, RecKind::DirDown | RecKind::DirUp) {
			res = writeln!(wr.out, "{} {} {}", kind.cmd(), escape(file), payload);
		}
		let temppath = wr.temppath.clone();
		res.map_err(|e| StatusError::Write { path: temppath, source: e })
	}

	fn emit_raw(&mut self, raw: &RawRec) -> Result<(), StatusError> {
		let rest = raw.rest.clone();
		let file = raw.file.clone();
		self.emit(raw.kind, &file, &rest)
	}

	/// Next record in file order.
	pub fn next(&mut self) -> Result<Option<StatusRec>, StatusError> {
		if let Some(p) = self.pending.take() {
			return Ok(Some(self.cook(&p)?));
		}
		match self.read_raw()? {
			Some(raw) => Ok(Some(self.cook(&raw)?)),
			None => Ok(None),
		}
	}

	/// Find the record for `name`.  When writing, every record that
	/// sorts before it is copied to the output (or discarded when
	/// `deleteto` is set).  Returns None when no such record exists;
	/// reading continues from the first record at or past the target.
	pub fn lookup(
		&mut self,
		name: &str,
		isdirup: bool,
		deleteto: bool,
	) -> Result<Option<StatusRec>, StatusError> {
		let mut cur = match self.pending.take() {
			Some(cur) => cur,
			None => match self.read_raw()? {
				Some(cur) => cur,
				None => return Ok(None),
			},
		};
		let keykind = if isdirup { RecKind::DirUp } else { RecKind::CheckoutLive };
		loop {
			let order = statusrec_cmp(cur.kind, &cur.file, keykind, name);
			if order != Ordering::Less {
				let result = if order == Ordering::Equal {
					Some(self.cook(&cur)?)
				} else {
					None
				};
				self.pending = Some(cur);
				return Ok(result);
			}
			if self.wr.is_some() && !deleteto {
				self.emit_raw(&cur)?;
			}
			cur = match self.read_raw()? {
				Some(cur) => cur,
				None => return Ok(None),
			};
		}
	}

	/// Upsert a record.  Replacing a directory with a file drops the
	/// directory's whole subtree.
	pub fn put(&mut self, rec: &StatusRec) -> Result<(), StatusError> {
		let isdirup = rec.kind() == RecKind::DirUp;
		if let Some(old) = self.lookup(&rec.file, isdirup, false)? {
			if old.kind() == RecKind::DirDown {
				if matches!(rec.kind(), RecKind::CheckoutLive | RecKind::CheckoutDead) {
					// Replacing a directory with a file: discard all
					// entries inside it, the closing DirUp included.
					self.lookup(&rec.file, true, true)?;
					self.pending = None;
				}
			} else {
				self.pending = None;
			}
		}
		self.dirty = true;
		let payload = Status::payload_of(rec);
		let file = rec.file.clone();
		self.emit(rec.kind(), &file, &payload)
	}

	/// Delete the record for `name`, if present.
	pub fn delete(&mut self, name: &str, isdirup: bool) -> Result<(), StatusError> {
		if self.lookup(name, isdirup, false)?.is_some() {
			self.pending = None;
			self.dirty = true;
		}
		Ok(())
	}

	/// Finish: flush the remaining records, close any open directory
	/// brackets and rename the tempfile over the status file.  When
	/// nothing changed the tempfile is discarded.
	pub fn close(mut self) -> Result<(), StatusError> {
		if self.wr.is_none() {
			return Ok(());
		}
		if !self.dirty {
			let wr = self.wr.take().expect("writer present");
			let _ = std::fs::remove_file(&wr.temppath);
			return Ok(());
		}
		if let Some(p) = self.pending.take() {
			self.emit_raw(&p)?;
		}
		while let Some(raw) = self.read_raw()? {
			self.emit_raw(&raw)?;
		}
		let mut wr = self.wr.take().expect("writer present");
		wr.pc.finish();
		let bogus = escape(&Fattr::bogus().encode(None)).into_owned();
		while let Some((cop, name)) = wr.pc.get() {
			debug_assert_eq!(cop, CompOp::DirUp);
			writeln!(wr.out, "U {} {}", escape(&name), bogus)
				.map_err(|e| StatusError::Write { path: wr.temppath.clone(), source: e })?;
		}
		wr.out
			.flush()
			.map_err(|e| StatusError::Write { path: wr.temppath.clone(), source: e })?;
		drop(wr.out);
		std::fs::rename(&wr.temppath, &self.path)
			.map_err(|e| StatusError::Write { path: wr.temppath.clone(), source: e })?;
		Ok(())
	}
}


// vim: ts=4
