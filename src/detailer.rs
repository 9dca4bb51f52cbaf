//! The detailer: second stage of the pipeline.
//!
//! Reads the server's per-file update proposals from channel 0,
//! decides per file whether the client needs it and what delta shape
//! to ask for, and writes the requests to channel 1.  After the main
//! pass it drains the fixups queue and requests the affected files a
//! second time, from scratch.

use crate::config::{
	Collection, Config, CO_CHECKOUTMODE, CO_COMPRESS, CO_NORCS, CO_NORSYNC, CO_SKIP,
};
use crate::error::WorkerError;
use crate::fattr::{Fattr, FileType};
use crate::fixups::{Fixup, FixupsReceiver};
use crate::logging::*;
use crate::mux::{ChanId, ChanReader, ChanWriter, Mux};
use crate::proto::{escape, Scanner};
use crate::rcs::parser::RcsFile;
use crate::rsyncsum::RsyncFile;
use crate::status::{RecDetail, Status};
use crate::stream::{WireReader, WireWriter};
use crate::util;
use std::sync::Arc;

pub async fn detailer(
	config: Arc<Config>,
	mux: Arc<Mux>,
	id0: ChanId,
	id1: ChanId,
	fixups: FixupsReceiver,
) -> Result<(), WorkerError> {
	let mut rd = WireReader::new(ChanReader::new(mux.clone(), id0));
	let mut wr = WireWriter::new(ChanWriter::new(mux, id1));
	batch(&config, &mut rd, &mut wr, fixups).await
}

fn wfail(e: std::io::Error) -> WorkerError {
	WorkerError::Write(e)
}

fn rfail(e: std::io::Error) -> WorkerError {
	WorkerError::Read(e)
}

async fn batch(
	config: &Config,
	rd: &mut WireReader,
	wr: &mut WireWriter,
	mut fixups: FixupsReceiver,
) -> Result<(), WorkerError> {
	for coll in &config.colls {
		if coll.options(CO_SKIP) {
			continue;
		}
		let line = rd.getln_str().await.map_err(rfail)?.ok_or(WorkerError::PrematureEof)?;
		let mut sc = Scanner::new(&line);
		let cmd = sc.get_ascii();
		let collname = sc.get_ascii();
		let release = sc.get_ascii();
		let scantime = sc.get_time();
		if scantime.is_none()
			|| !sc.at_end()
			|| cmd.as_deref() != Some("COLL")
			|| collname.as_deref() != Some(coll.name.as_str())
			|| release.as_deref() != Some(coll.release.as_str())
		{
			return Err(WorkerError::Protocol);
		}
		coll.set_scantime(scantime.expect("checked above"));

		wr.write_str(&format!("COLL {} {}\n", escape(&coll.name), escape(&coll.release)))
			.map_err(wfail)?;
		wr.flush().await.map_err(wfail)?;
		if coll.options(CO_COMPRESS) {
			rd.filter_start_zlib();
			wr.filter_start_zlib();
		}
		let mut st = Status::open(coll, &config.colldir, None)?;
		detail_coll(coll, &mut st, rd, wr).await?;
		drop(st);
		if coll.options(CO_COMPRESS) {
			rd.filter_stop();
			wr.filter_stop().map_err(wfail)?;
		}
		wr.flush().await.map_err(wfail)?;
	}
	let line = rd.getln_str().await.map_err(rfail)?.ok_or(WorkerError::PrematureEof)?;
	if line != "." {
		return Err(WorkerError::Protocol);
	}
	wr.write_str(".\n").map_err(wfail)?;
	wr.flush().await.map_err(wfail)?;

	// Second pass: request a full checkout for everything the updater
	// could not reconstruct.  The pass is sent even when empty.
	let mut pending: Option<Fixup> = None;
	let mut fixups_eof = false;
	for (i, coll) in config.colls.iter().enumerate() {
		if coll.options(CO_SKIP) {
			continue;
		}
		wr.write_str(&format!("COLL {} {}\n", escape(&coll.name), escape(&coll.release)))
			.map_err(wfail)?;
		if coll.options(CO_COMPRESS) {
			wr.filter_start_zlib();
		}
		while !fixups_eof {
			if pending.is_none() {
				pending = fixups.get().await;
				if pending.is_none() {
					fixups_eof = true;
					break;
				}
			}
			let fixup = pending.as_ref().expect("pending checked above");
			if fixup.coll != i {
				break;
			}
			if coll.options(CO_CHECKOUTMODE) {
				wr.write_str(&format!(
					"Y {} {} {}\n",
					escape(&fixup.name),
					escape(&coll.tag),
					escape(&coll.date)
				))
				.map_err(wfail)?;
			} else {
				wr.write_str(&format!("X {}\n", escape(&fixup.name))).map_err(wfail)?;
			}
			pending = None;
		}
		wr.write_str(".\n").map_err(wfail)?;
		if coll.options(CO_COMPRESS) {
			wr.filter_stop().map_err(wfail)?;
		}
		wr.flush().await.map_err(wfail)?;
	}
	wr.write_str(".\n").map_err(wfail)?;
	wr.flush().await.map_err(wfail)?;
	Ok(())
}

async fn detail_coll(
	coll: &Collection,
	st: &mut Status,
	rd: &mut WireReader,
	wr: &mut WireWriter,
) -> Result<(), WorkerError> {
	loop {
		let line = rd.getln_str().await.map_err(rfail)?.ok_or(WorkerError::PrematureEof)?;
		if line == "." {
			break;
		}
		let mut sc = Scanner::new(&line);
		let cmd = sc.get_ascii().unwrap_or_default();
		match cmd.as_str() {
			"D" => {
				// Delete file.
				let file = sc.get_ascii().ok_or(WorkerError::Protocol)?;
				if !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				wr.write_str(&format!("D {}\n", escape(&file))).map_err(wfail)?;
			}
			"I" | "i" | "j" => {
				// Directory operations.
				let file = sc.get_ascii().ok_or(WorkerError::Protocol)?;
				if !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				wr.write_str(&format!("{} {}\n", cmd, escape(&file))).map_err(wfail)?;
			}
			"J" => {
				// Set directory attributes.
				let file = sc.get_ascii();
				let attr = sc.get_ascii();
				if file.is_none() || attr.is_none() || !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				wr.write_str(&format!(
					"J {} {}\n",
					escape(&file.expect("checked above")),
					escape(&attr.expect("checked above"))
				))
				.map_err(wfail)?;
			}
			"H" | "h" => {
				// Make hard link.
				let file = sc.get_ascii();
				let target = sc.get_ascii();
				if file.is_none() || target.is_none() || !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				wr.write_str(&format!(
					"{} {} {}\n",
					cmd,
					escape(&file.expect("checked above")),
					escape(&target.expect("checked above"))
				))
				.map_err(wfail)?;
			}
			"T" | "t" => {
				// Candidate RCS file addition.
				let file = sc.get_ascii();
				let attr = sc.get_ascii();
				if file.is_none() || attr.is_none() || !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				let rcsattr =
					Fattr::decode(&attr.expect("checked above")).ok_or(WorkerError::Protocol)?;
				check_rcs_attr(coll, st, wr, &file.expect("checked above"), &rcsattr, cmd == "t")
					.await?;
			}
			"U" => {
				// Add or update file.
				let file = sc.get_ascii().ok_or(WorkerError::Protocol)?;
				if !sc.at_end() {
					return Err(WorkerError::Protocol);
				}
				send_details(coll, st, wr, &file, None).await?;
			}
			"!" => {
				let msg = sc.get_rest().unwrap_or_default();
				warn!("Server warning: {}", msg);
			}
			_ => return Err(WorkerError::Protocol),
		}
		wr.flush().await.map_err(wfail)?;
	}
	wr.write_str(".\n").map_err(wfail)?;
	Ok(())
}

/// On a candidate RCS addition, confirm or request the file.  Only
/// meaningful outside checkout mode, where the RCS files themselves are
/// mirrored.
async fn check_rcs_attr(
	coll: &Collection,
	st: &mut Status,
	wr: &mut WireWriter,
	name: &str,
	server_attr: &Fattr,
	attic: bool,
) -> Result<(), WorkerError> {
	let path = util::cvspath(&coll.prefix, name, attic);
	let fa = Fattr::from_path(&path, true);
	if let Some(fa) = &fa {
		if fa.equal(server_attr) {
			// The attributes are sent back whole, not culled by the
			// negotiated support, so the list file records everything
			// we know.
			let cmd = if attic { 'l' } else { 'L' };
			wr.write_str(&format!("{} {} {}\n", cmd, escape(name), escape(&fa.encode(None))))
				.map_err(wfail)?;
			return Ok(());
		}
	}
	send_details(coll, st, wr, name, fa.as_ref()).await
}

async fn send_details(
	coll: &Collection,
	st: &mut Status,
	wr: &mut WireWriter,
	name: &str,
	fa: Option<&Fattr>,
) -> Result<(), WorkerError> {
	if coll.options(CO_CHECKOUTMODE) {
		return send_co(coll, st, wr, name).await;
	}

	// Determine whether it is a file or a node.
	let observed;
	let fa = match fa {
		Some(fa) => Some(fa),
		None => {
			let path = util::cvspath(&coll.prefix, name, false);
			observed = Fattr::from_path(&path, true).or_else(|| {
				let attic = util::cvspath(&coll.prefix, name, true);
				Fattr::from_path(&attic, true)
			});
			observed.as_ref()
		}
	};

	match fa {
		None => {
			// The file does not exist here, so ask for all of it.
			wr.write_str(&format!("A {}\n", escape(name))).map_err(wfail)?;
			Ok(())
		}
		Some(fa) if fa.ftype() == FileType::File => {
			if name.ends_with(",v") && !coll.options(CO_NORCS) {
				send_rcs(coll, wr, name).await
			} else {
				send_regular(coll, wr, name).await
			}
		}
		Some(_) => {
			// Some kind of node.
			wr.write_str(&format!("N {}\n", escape(name))).map_err(wfail)?;
			Ok(())
		}
	}
}

/// Checkout-mode detailing for one file.
async fn send_co(
	coll: &Collection,
	st: &mut Status,
	wr: &mut WireWriter,
	name: &str,
) -> Result<(), WorkerError> {
	let path = util::checkoutpath(&coll.prefix, name).ok_or(WorkerError::Protocol)?;
	let fa = Fattr::from_path(&path, true);
	let fa = match fa {
		Some(fa) => fa,
		None => {
			// We do not have the file; the server has to send it
			// whole (or tell us it is dead).
			wr.write_str(&format!(
				"C {} {} {}\n",
				escape(name),
				escape(&coll.tag),
				escape(&coll.date)
			))
			.map_err(wfail)?;
			return Ok(());
		}
	};

	// Recorded information is only usable when it matches the file we
	// actually have.
	let mut recorded = st.lookup(name, false, false)?;
	if let Some(rec) = &recorded {
		let usable = match &rec.detail {
			RecDetail::CheckoutLive { clientattr, .. } => clientattr.equal(&fa),
			_ => false,
		};
		if !usable {
			recorded = None;
		}
	}

	if let Some(rec) = &recorded {
		if let RecDetail::CheckoutLive { revnum, revdate, .. } = &rec.detail {
			if revdate != "." {
				wr.write_str(&format!(
					"U {} {} {} {} {}\n",
					escape(name),
					escape(&coll.tag),
					escape(&coll.date),
					escape(revnum),
					escape(revdate)
				))
				.map_err(wfail)?;
				return Ok(());
			}
		}
	}

	// Without complete recorded information the file's checksum is the
	// best aid toward identifying which version it is.
	let (md5, _) = util::md5_file(&path).map_err(|e| {
		WorkerError::Message(format!(
			"Cannot calculate checksum for \"{}\": {}",
			path.display(),
			e
		))
	})?;
	match &recorded {
		None => {
			wr.write_str(&format!(
				"S {} {} {} {}\n",
				escape(name),
				escape(&coll.tag),
				escape(&coll.date),
				md5
			))
			.map_err(wfail)?;
		}
		Some(rec) => {
			if let RecDetail::CheckoutLive { revnum, .. } = &rec.detail {
				wr.write_str(&format!(
					"s {} {} {} {} {}\n",
					escape(name),
					escape(&coll.tag),
					escape(&coll.date),
					escape(revnum),
					md5
				))
				.map_err(wfail)?;
			}
		}
	}
	Ok(())
}

/// Ask for an update to an RCS file we hold, or for the whole file.
async fn send_rcs(
	coll: &Collection,
	wr: &mut WireWriter,
	name: &str,
) -> Result<(), WorkerError> {
	let path = util::atticpath(&coll.prefix, name);
	if Fattr::from_path(&path, true).is_none() {
		// No RCS file on the client; have the server send it whole.
		wr.write_str(&format!("A {}\n", escape(name))).map_err(wfail)?;
		return Ok(());
	}
	match RcsFile::parse(&path, name, false) {
		Ok(rf) => {
			rf.send_details(wr).map_err(wfail)?;
			Ok(())
		}
		// Not a valid RCS file; treat it as a regular file.
		Err(_) => send_regular(coll, wr, name).await,
	}
}

/// Regular-file detailing: rsync block sums when allowed, a whole-file
/// digest otherwise.
async fn send_regular(
	coll: &Collection,
	wr: &mut WireWriter,
	name: &str,
) -> Result<(), WorkerError> {
	if !coll.options(CO_NORSYNC) && !coll.norsync_excluded(name) {
		return send_rsync(coll, wr, name).await;
	}
	let path = util::cvspath(&coll.prefix, name, false);
	match util::md5_file(&path) {
		Ok((md5, size)) => {
			wr.write_str(&format!("R {} {} {}\n", escape(name), size, md5)).map_err(wfail)?;
			Ok(())
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			// The file does not exist on the client.
			wr.write_str(&format!("A {}\n", escape(name))).map_err(wfail)?;
			Ok(())
		}
		Err(e) => Err(WorkerError::Message(format!(
			"Read failure from \"{}\": {}",
			path.display(),
			e
		))),
	}
}

async fn send_rsync(coll: &Collection, wr: &mut WireWriter, name: &str) -> Result<(), WorkerError> {
	let path = util::cvspath(&coll.prefix, name, false);
	let mut rf = match RsyncFile::open(&path) {
		Ok(rf) => rf,
		Err(_) => {
			// Fall back to a whole-file transfer.
			wr.write_str(&format!("A {}\n", escape(name))).map_err(wfail)?;
			return Ok(());
		}
	};
	wr.write_str(&format!("r {} {} {}\n", escape(name), rf.size(), rf.blocksize()))
		.map_err(wfail)?;
	loop {
		let block = rf.next_block().map_err(|e| {
			WorkerError::Message(format!("Read failure from \"{}\": {}", path.display(), e))
		})?;
		let (weak, md5) = match block {
			Some(block) => block,
			None => break,
		};
		wr.write_str(&format!("{} {}\n", weak, md5)).map_err(wfail)?;
	}
	wr.write_str(".\n").map_err(wfail)?;
	Ok(())
}

// vim: ts=4
