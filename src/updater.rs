//! The updater: last stage of the pipeline.
//!
//! Applies the server's responses (attribute updates, dead checkouts,
//! diff edits, full checkout bodies and deletions) and rewrites each
//! collection's status file as it goes.  New file contents are always
//! built under a temporary name next to the target and renamed into
//! place with their final attributes already applied.  A content
//! checksum that does not match after a delta apply queues a fixup so
//! the file is refetched whole in the second pass.

use crate::config::{Collection, Config, CO_CHECKOUTMODE, CO_COMPRESS, CO_DELETE, CO_SKIP};
use crate::error::WorkerError;
use crate::fattr::{Fattr, FileType, FA_COIGNORE, FA_DEV, FA_INODE, FA_LINKCOUNT, FA_MASK, FA_MODTIME};
use crate::fixups::FixupsSender;
use crate::logging::*;
use crate::mux::{ChanId, ChanReader, Mux};
use crate::proto::Scanner;
use crate::rcs::diff;
use crate::rcs::keyword::{decode_expand, ExpandContext, ExpandMode};
use crate::status::{RecDetail, Status, StatusRec};
use crate::stream::{FileLineReader, FileLineWriter, WireReader};
use crate::util;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub async fn updater(
	config: Arc<Config>,
	mux: Arc<Mux>,
	id1: ChanId,
	fixups: FixupsSender,
) -> Result<(), WorkerError> {
	let mut rd = WireReader::new(ChanReader::new(mux, id1));
	let result = do_batch(&config, &mut rd, Some(&fixups), false).await;
	// Close the fixups queue even on failure so the detailer's second
	// pass does not block forever.
	drop(fixups);
	result?;
	do_batch(&config, &mut rd, None, true).await
}

fn rfail(e: std::io::Error) -> WorkerError {
	WorkerError::Read(e)
}

async fn do_batch(
	config: &Config,
	rd: &mut WireReader,
	fixups: Option<&FixupsSender>,
	isfixups: bool,
) -> Result<(), WorkerError> {
	for (collidx, coll) in config.colls.iter().enumerate() {
		if coll.options(CO_SKIP) {
			continue;
		}
		let line = rd.getln_str().await.map_err(rfail)?.ok_or(WorkerError::PrematureEof)?;
		let mut sc = Scanner::new(&line);
		let cmd = sc.get_ascii();
		let collname = sc.get_ascii();
		let release = sc.get_ascii();
		if release.is_none()
			|| !sc.at_end()
			|| cmd.as_deref() != Some("COLL")
			|| collname.as_deref() != Some(coll.name.as_str())
			|| release.as_deref() != Some(coll.release.as_str())
		{
			return Err(WorkerError::Protocol);
		}

		let mut st = Status::open(coll, &config.colldir, Some(coll.scantime()))?;
		if !isfixups {
			info!("Updating collection {}/{}", coll.name, coll.release);
		}
		if coll.options(CO_COMPRESS) {
			rd.filter_start_zlib();
		}
		do_coll(coll, collidx, &mut st, rd, fixups, isfixups).await?;
		st.close()?;
		if coll.options(CO_COMPRESS) {
			rd.filter_stop();
		}
	}
	let line = rd.getln_str().await.map_err(rfail)?.ok_or(WorkerError::PrematureEof)?;
	if line != "." {
		return Err(WorkerError::Protocol);
	}
	Ok(())
}

async fn do_coll(
	coll: &Collection,
	collidx: usize,
	st: &mut Status,
	rd: &mut WireReader,
	fixups: Option<&FixupsSender>,
	isfixups: bool,
) -> Result<(), WorkerError> {
	let mut needfixupmsg = isfixups;
	loop {
		let line = rd.getln_str().await.map_err(rfail)?.ok_or(WorkerError::PrematureEof)?;
		if line == "." {
			break;
		}
		if needfixupmsg {
			info!("Applying fixups for collection {}/{}", coll.name, coll.release);
			needfixupmsg = false;
		}
		let mut sc = Scanner::new(&line);
		let cmd = sc.get_ascii().unwrap_or_default();
		if cmd.len() != 1 {
			return Err(WorkerError::Protocol);
		}
		match cmd.as_str() {
			"T" => {
				// Update recorded information for a checked-out file.
				let name = sc.get_ascii();
				let tag = sc.get_ascii();
				let date = sc.get_ascii();
				let revnum = sc.get_ascii();
				let revdate = sc.get_ascii();
				let attr = sc.get_ascii();
				if attr.is_none() || !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				let rcsattr = decode_attr(&attr.expect("checked above"))?;
				let name = name.expect("checked above");
				let dest = checkout_dest(coll, &name)?;
				set_attrs(
					coll,
					st,
					&name,
					&tag.expect("checked above"),
					&date.expect("checked above"),
					&revnum.expect("checked above"),
					&revdate.expect("checked above"),
					&rcsattr,
					&dest,
				)?;
			}
			"c" | "u" => {
				// Checkout dead: the file is not supposed to exist on
				// the client.  "u" deletes it outright, "c" only if
				// something is there anyway.
				let name = sc.get_ascii();
				let tag = sc.get_ascii();
				let date = sc.get_ascii();
				let attr = sc.get_ascii();
				if attr.is_none() || !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				let serverattr = decode_attr(&attr.expect("checked above"))?;
				let name = name.expect("checked above");
				let dest = checkout_dest(coll, &name)?;
				if cmd == "u" || dest.exists() {
					delete_file(coll, &name, &dest);
				}
				let rec = StatusRec {
					file: name,
					detail: RecDetail::CheckoutDead {
						tag: tag.expect("checked above"),
						date: date.expect("checked above"),
						serverattr,
					},
				};
				st.put(&rec)?;
			}
			"U" => {
				// Edit a live checked-out file with a diff chain.
				let name = sc.get_ascii();
				let tag = sc.get_ascii();
				let date = sc.get_ascii();
				let _oldrevnum = sc.get_ascii();
				let _fromattic = sc.get_ascii();
				let _loglines = sc.get_ascii();
				let expand = sc.get_ascii();
				let attr = sc.get_ascii();
				let wantmd5 = sc.get_ascii();
				if wantmd5.is_none() || !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				let serverattr = decode_attr(&attr.expect("checked above"))?;
				let expand = decode_expand(&expand.expect("checked above"))
					.ok_or(WorkerError::Protocol)?;
				let name = name.expect("checked above");
				let dest = checkout_dest(coll, &name)?;
				do_diff(
					coll,
					collidx,
					st,
					rd,
					fixups,
					&name,
					&tag.expect("checked above"),
					&date.expect("checked above"),
					serverattr,
					expand,
					&wantmd5.expect("checked above"),
					&dest,
				)
				.await?;
			}
			"C" | "Y" => {
				// Full checkout.
				let name = sc.get_ascii();
				let tag = sc.get_ascii();
				let date = sc.get_ascii();
				let revnum = sc.get_ascii();
				let revdate = sc.get_ascii();
				let attr = sc.get_ascii();
				if attr.is_none() || !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				let serverattr = decode_attr(&attr.expect("checked above"))?;
				let revdate = revdate.expect("checked above");
				let modtime = match util::rcsdate_to_time(&revdate) {
					Some(t) => t,
					None => {
						error!("Updater: Invalid RCS date: {}", revdate);
						return Err(WorkerError::Protocol);
					}
				};
				let mut clientattr = Fattr::new(FileType::File);
				clientattr.set_modtime(modtime);
				let derived = Fattr::for_checkout(&serverattr, coll.umask);
				clientattr.override_with(&derived, FA_MASK);
				clientattr.merge_default();
				let name = name.expect("checked above");
				let dest = checkout_dest(coll, &name)?;
				let rec = StatusRec {
					file: name,
					detail: RecDetail::CheckoutLive {
						tag: tag.expect("checked above"),
						date: date.expect("checked above"),
						serverattr,
						revnum: revnum.expect("checked above"),
						revdate,
						clientattr,
					},
				};
				checkout(coll, collidx, st, rd, fixups, rec, &dest, cmd == "Y").await?;
			}
			"D" => {
				// Delete file.
				let name = sc.get_ascii().ok_or(WorkerError::Protocol)?;
				if !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				let dest = checkout_dest(coll, &name)?;
				delete_file(coll, &name, &dest);
				st.delete(&name, false)?;
			}
			"!" => {
				let msg = sc.get_rest().unwrap_or_default();
				warn!("Server warning: {}", msg);
			}
			_ => {
				error!("Updater: Unknown command: \"{}\"", cmd);
				return Err(WorkerError::Protocol);
			}
		}
	}
	Ok(())
}

fn decode_attr(attr: &str) -> Result<Fattr, WorkerError> {
	match Fattr::decode(attr) {
		Some(fa) => Ok(fa),
		None => {
			error!("Updater: Bad attributes \"{}\"", attr);
			Err(WorkerError::Protocol)
		}
	}
}

fn checkout_dest(coll: &Collection, name: &str) -> Result<PathBuf, WorkerError> {
	util::checkoutpath(&coll.prefix, name).ok_or(WorkerError::Protocol)
}

/// Apply an attribute-only update: no content was transferred.
fn set_attrs(
	coll: &Collection,
	st: &mut Status,
	name: &str,
	tag: &str,
	date: &str,
	revnum: &str,
	revdate: &str,
	rcsattr: &Fattr,
	dest: &Path,
) -> Result<(), WorkerError> {
	let mut fileattr = match Fattr::from_path(dest, true) {
		Some(fa) => fa,
		None => {
			// The file has vanished.
			st.delete(name, false)?;
			return Ok(());
		}
	};
	let derived = Fattr::for_checkout(rcsattr, coll.umask);
	fileattr.override_with(&derived, FA_MASK);

	match fileattr.install(None, dest) {
		Err(e) => {
			warn!("Cannot set attributes for \"{}\": {}", dest.display(), e);
			return Ok(());
		}
		Ok(true) => {
			info!(" SetAttrs {}", name);
			fileattr = match Fattr::from_path(dest, true) {
				Some(fa) => fa,
				None => {
					st.delete(name, false)?;
					return Ok(());
				}
			};
		}
		Ok(false) => {}
	}

	fileattr.maskout(FA_COIGNORE);
	let rec = StatusRec {
		file: name.to_string(),
		detail: RecDetail::CheckoutLive {
			tag: tag.to_string(),
			date: date.to_string(),
			serverattr: rcsattr.clone(),
			revnum: revnum.to_string(),
			revdate: revdate.to_string(),
			clientattr: fileattr,
		},
	};
	st.put(&rec)?;
	Ok(())
}

/// Delete a checked-out file, honoring the collection's delete policy,
/// then prune newly empty parent directories.
fn delete_file(coll: &Collection, name: &str, dest: &Path) {
	if coll.options(CO_DELETE) {
		info!(" Delete {}", name);
		if let Err(e) = Fattr::delete(dest) {
			warn!("Cannot delete \"{}\": {}", dest.display(), e);
			return;
		}
		if coll.options(CO_CHECKOUTMODE) {
			prune_dirs(&coll.prefix, dest);
		}
	} else {
		info!(" NoDelete {}", name);
	}
}

/// Remove empty directories above `file`, stopping at the collection
/// prefix.
fn prune_dirs(prefix: &Path, file: &Path) {
	let mut cur = file.to_path_buf();
	while let Some(parent) = cur.parent() {
		if parent == prefix {
			return;
		}
		if std::fs::remove_dir(parent).is_err() {
			return;
		}
		cur = parent.to_path_buf();
	}
}

/// Install the built file and persist its status record.  The recorded
/// client attributes are re-read from disk after the install, with the
/// server's link count preserved.
fn update_file(
	coll: &Collection,
	st: &mut Status,
	mut rec: StatusRec,
	dest: &Path,
	from: Option<&Path>,
) -> Result<bool, WorkerError> {
	{
		let clientattr = match &mut rec.detail {
			RecDetail::CheckoutLive { clientattr, .. } => clientattr,
			_ => return Err(WorkerError::Protocol),
		};
		clientattr.apply_umask(coll.umask);
		if let Err(e) = clientattr.install(from, dest) {
			warn!("Cannot install \"{}\": {}", dest.display(), e);
			if let Some(from) = from {
				let _ = std::fs::remove_file(from);
			}
			return Ok(false);
		}

		// We were not necessarily able to set every attribute to the
		// desired value, so record what the file actually has, keeping
		// the server's link count for hard link preservation.
		let mut fileattr = match Fattr::from_path(dest, true) {
			Some(fa) => fa,
			None => {
				warn!("Updater: Cannot stat \"{}\"", dest.display());
				return Ok(false);
			}
		};
		fileattr.override_with(clientattr, FA_LINKCOUNT);

		// The device and inode only matter for hard link detection;
		// leave them out of the record for singly-linked files.
		if fileattr.linkcount().unwrap_or(1) <= 1 {
			fileattr.maskout(FA_DEV | FA_INODE);
		}
		if coll.options(CO_CHECKOUTMODE) {
			fileattr.maskout(FA_COIGNORE);
		}
		*clientattr = fileattr;
	}
	st.put(&rec)?;
	Ok(true)
}

fn check_md5(
	fixups: Option<&FixupsSender>,
	collidx: usize,
	name: &str,
	dest: &Path,
	computed: &str,
	want: &str,
) {
	if computed == want {
		return;
	}
	match fixups {
		Some(fixups) => {
			error!(
				"{}: Checksum mismatch -- will transfer entire file",
				dest.display()
			);
			fixups.put(collidx, name);
		}
		None => {
			error!("{}: Checksum mismatch -- file not updated", dest.display());
		}
	}
}

/// Apply a chain of deltas to an existing checked-out file.  Each
/// delta reads the previous result and writes a fresh temporary; the
/// last temporary is installed over the target.
#[allow(clippy::too_many_arguments)]
async fn do_diff(
	coll: &Collection,
	collidx: usize,
	st: &mut Status,
	rd: &mut WireReader,
	fixups: Option<&FixupsSender>,
	name: &str,
	tag: &str,
	date: &str,
	serverattr: Fattr,
	expand: ExpandMode,
	wantmd5: &str,
	dest: &Path,
) -> Result<(), WorkerError> {
	info!(" Edit {}", name);

	let mut revnum = String::new();
	let mut revdate = String::new();
	let mut author = String::new();
	let mut orig: Option<FileLineReader> = None;
	let mut to: Option<(FileLineWriter, PathBuf)> = None;

	let result = loop {
		let line = match rd.getln_str().await {
			Ok(Some(line)) => line,
			Ok(None) => break Err(WorkerError::PrematureEof),
			Err(e) => break Err(rfail(e)),
		};
		if line == "." {
			break Ok(());
		}
		let mut sc = Scanner::new(&line);
		if sc.get_ascii().as_deref() != Some("D") {
			break Err(WorkerError::Protocol);
		}
		let rn = sc.get_ascii();
		let _diffbase = sc.get_ascii();
		let rdate = sc.get_ascii();
		let auth = sc.get_ascii();
		if auth.is_none() || !sc.at_end() {
			break Err(WorkerError::Protocol);
		}
		revnum = rn.expect("checked above");
		revdate = rdate.expect("checked above");
		author = auth.expect("checked above");

		match &mut orig {
			None => {
				// First delta: the origin is the file we have.
				match FileLineReader::open(dest) {
					Ok(rd) => orig = Some(rd),
					Err(e) => break Err(WorkerError::local(dest, e)),
				}
			}
			Some(slot) => {
				// Subsequent deltas read the previous result.
				let (wr, oldtemp) = to.take().expect("previous delta present");
				let mut file = match wr.into_file() {
					Ok(file) => file,
					Err(e) => break Err(WorkerError::local(&oldtemp, e)),
				};
				if let Err(e) = file.seek(SeekFrom::Start(0)) {
					break Err(WorkerError::local(&oldtemp, e));
				}
				// The open handle keeps the unlinked file readable.
				let _ = std::fs::remove_file(&oldtemp);
				*slot = FileLineReader::new(file);
			}
		}
		let temppath = util::tempname(dest);
		let file = match open_temp(&temppath) {
			Ok(file) => file,
			Err(e) => break Err(WorkerError::local(&temppath, e)),
		};
		to = Some((FileLineWriter::new(file), temppath));
		debug!("  Add delta {} {} {}", revnum, revdate, author);

		let batch = diff_batch(
			coll,
			rd,
			name,
			tag,
			&revnum,
			&revdate,
			&author,
			expand,
			orig.as_mut().expect("origin opened above"),
			&mut to.as_mut().expect("target opened above").0,
		)
		.await;
		if let Err(e) = batch {
			break Err(e);
		}
	};

	drop(orig);
	let (from, temp_guard) = match to {
		Some((wr, temppath)) => match wr.into_file() {
			Ok(_) => (Some(temppath.clone()), Some(temppath)),
			Err(e) => {
				let _ = std::fs::remove_file(&temppath);
				return Err(WorkerError::local(&temppath, e));
			}
		},
		None => (None, None),
	};
	if let Err(e) = result {
		if let Some(temp) = temp_guard {
			let _ = std::fs::remove_file(&temp);
		}
		return Err(e);
	}

	let mut clientattr = match Fattr::from_path(dest, false) {
		Some(fa) => fa,
		None => Fattr::new(FileType::File),
	};
	let derived = Fattr::for_checkout(&serverattr, coll.umask);
	clientattr.override_with(&derived, FA_MASK);
	// The write time is "now"; recording it would defeat the next
	// comparison against the server's modtime.
	clientattr.maskout(FA_MODTIME);

	let rec = StatusRec {
		file: name.to_string(),
		detail: RecDetail::CheckoutLive {
			tag: tag.to_string(),
			date: date.to_string(),
			serverattr,
			revnum,
			revdate,
			clientattr,
		},
	};
	let installed = update_file(coll, st, rec, dest, from.as_deref())?;
	if installed {
		let (md5, _) = util::md5_file(dest).map_err(|e| WorkerError::local(dest, e))?;
		check_md5(fixups, collidx, name, dest, &md5, wantmd5);
	}
	Ok(())
}

/// The sub-commands inside one delta: log lines (absorbed), state
/// updates and the diff apply trigger.
#[allow(clippy::too_many_arguments)]
async fn diff_batch(
	coll: &Collection,
	rd: &mut WireReader,
	name: &str,
	tag: &str,
	revnum: &str,
	revdate: &str,
	author: &str,
	expand: ExpandMode,
	orig: &mut FileLineReader,
	to: &mut FileLineWriter,
) -> Result<(), WorkerError> {
	let mut state = String::new();
	loop {
		let line = rd.getln_str().await.map_err(rfail)?.ok_or(WorkerError::PrematureEof)?;
		if line == "." {
			return Ok(());
		}
		let mut sc = Scanner::new(&line);
		let cmd = sc.get_ascii().unwrap_or_default();
		match cmd.as_str() {
			"L" => {
				// Log lines; the contents are not used.
				loop {
					let line = rd
						.getln_str()
						.await
						.map_err(rfail)?
						.ok_or(WorkerError::PrematureEof)?;
					if line == "." || line == ".+" {
						break;
					}
				}
			}
			"S" => {
				let tok = sc.get_ascii();
				if tok.is_none() || !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				state = tok.expect("checked above");
			}
			"T" => {
				let ctx = ExpandContext {
					rcsfile: name,
					cvsroot: &coll.cvsroot,
					revnum,
					revdate,
					author,
					state: &state,
					tag: if tag == "." { None } else { Some(tag) },
					mode: expand,
				};
				diff::apply(rd, orig, to, &coll.keyword, &ctx).await.map_err(|e| {
					error!("Updater: Bad diff from server");
					match e.kind() {
						std::io::ErrorKind::UnexpectedEof => WorkerError::PrematureEof,
						_ => WorkerError::Protocol,
					}
				})?;
			}
			_ => {
				error!("Updater: Protocol error");
				return Err(WorkerError::Protocol);
			}
		}
	}
}

fn open_temp(path: &Path) -> std::io::Result<File> {
	OpenOptions::new().read(true).write(true).create_new(true).open(path)
}

/// Receive a full checkout body and install it.
async fn checkout(
	coll: &Collection,
	collidx: usize,
	st: &mut Status,
	rd: &mut WireReader,
	fixups: Option<&FixupsSender>,
	rec: StatusRec,
	dest: &Path,
	isfixup: bool,
) -> Result<(), WorkerError> {
	if isfixup {
		info!(" Fixup {}", rec.file);
	} else {
		info!(" Checkout {}", rec.file);
	}
	util::mkdirhier(dest).map_err(|e| {
		WorkerError::Message(format!(
			"Cannot create directories leading to \"{}\": {}",
			dest.display(),
			e
		))
	})?;

	let temppath = util::tempname(dest);
	let file = match open_temp(&temppath) {
		Ok(file) => file,
		Err(e) => return Err(WorkerError::local(&temppath, e)),
	};
	let mut to = FileLineWriter::new(file);
	to.md5_start();

	// Line-oriented body with dot-stuffing; "." ends a body whose last
	// line has a newline, ".+" one whose last line does not.
	let mut first = true;
	let body = loop {
		let line = match rd.getln().await {
			Ok(Some(line)) => line,
			Ok(None) => break Err(WorkerError::PrematureEof),
			Err(e) => break Err(rfail(e)),
		};
		let newline_end = line == b".";
		if newline_end || line == b".+" {
			if newline_end {
				if let Err(e) = to.write(b"\n") {
					break Err(WorkerError::local(&temppath, e));
				}
			}
			break Ok(());
		}
		let payload: &[u8] = if line.starts_with(b"..") { &line[1..] } else { &line };
		let res = if first {
			to.write(payload)
		} else {
			to.write(b"\n").and_then(|_| to.write(payload))
		};
		if let Err(e) = res {
			break Err(WorkerError::local(&temppath, e));
		}
		first = false;
	};
	if let Err(e) = body {
		let _ = std::fs::remove_file(&temppath);
		return Err(e);
	}

	let md5 = to.md5_finish().expect("md5 filter was started");
	if let Err(e) = to.into_file() {
		let _ = std::fs::remove_file(&temppath);
		return Err(WorkerError::local(&temppath, e));
	}

	// The checksum line follows the body.
	let line = match rd.getln_str().await {
		Ok(Some(line)) => line,
		Ok(None) => {
			let _ = std::fs::remove_file(&temppath);
			return Err(WorkerError::PrematureEof);
		}
		Err(e) => {
			let _ = std::fs::remove_file(&temppath);
			return Err(rfail(e));
		}
	};
	let mut sc = Scanner::new(&line);
	let cmd = sc.get_ascii();
	let wantmd5 = sc.get_ascii();
	if cmd.as_deref() != Some("5") || wantmd5.is_none() || !sc.at_end() {
		let _ = std::fs::remove_file(&temppath);
		return Err(WorkerError::Protocol);
	}
	check_md5(
		if isfixup { None } else { fixups },
		collidx,
		&rec.file,
		dest,
		&md5,
		&wantmd5.expect("checked above"),
	);

	update_file(coll, st, rec, dest, Some(&temppath))?;
	Ok(())
}

// vim: ts=4
