//! The lister: first stage of the pipeline.
//!
//! Walks the status file of each collection and tells the server, per
//! entry, what the client believes it holds.  Anything that cannot be
//! confirmed against the filesystem is reported with the bogus
//! attribute sentinel so the server resends it.  A directory that
//! vanished locally prunes everything beneath it from the listing.

use crate::config::{Collection, Config, CO_COMPRESS, CO_SKIP, CO_TRUSTSTATUSFILE};
use crate::error::WorkerError;
use crate::fattr::{Fattr, FileType};
use crate::logging::*;
use crate::mux::{ChanId, ChanWriter, Mux};
use crate::proto::escape;
use crate::status::{RecDetail, Status, StatusRec};
use crate::stream::WireWriter;
use crate::util;
use std::sync::Arc;

pub async fn lister(config: Arc<Config>, mux: Arc<Mux>, id0: ChanId) -> Result<(), WorkerError> {
	let mut wr = WireWriter::new(ChanWriter::new(mux, id0));
	let result = run(&config, &mut wr).await;
	let _ = wr.close().await;
	result
}

async fn run(config: &Config, wr: &mut WireWriter) -> Result<(), WorkerError> {
	for coll in &config.colls {
		if coll.options(CO_SKIP) {
			continue;
		}
		let mut st = Status::open(coll, &config.colldir, None)?;
		wr.write_str(&format!("COLL {} {}\n", escape(&coll.name), escape(&coll.release)))
			.map_err(WorkerError::Write)?;
		wr.flush().await.map_err(WorkerError::Write)?;
		if coll.options(CO_COMPRESS) {
			wr.filter_start_zlib();
		}
		list_coll(config, wr, coll, &mut st).await?;
		if coll.options(CO_COMPRESS) {
			wr.filter_stop().map_err(WorkerError::Write)?;
		}
		wr.flush().await.map_err(WorkerError::Write)?;
	}
	wr.write_str(".\n").map_err(WorkerError::Write)?;
	wr.flush().await.map_err(WorkerError::Write)?;
	Ok(())
}

/// List a single collection based on its status file.
async fn list_coll(
	config: &Config,
	wr: &mut WireWriter,
	coll: &Collection,
	st: &mut Status,
) -> Result<(), WorkerError> {
	let mut depth: i64 = 0;
	let mut prunedepth = i64::MAX;
	let mut attrstack: Vec<Fattr> = Vec::new();

	while let Some(sr) = st.next()? {
		match &sr.detail {
			RecDetail::DirDown => {
				depth += 1;
				if depth < prunedepth && !do_dirdown(config, wr, coll, &sr, &mut attrstack)? {
					prunedepth = depth;
				}
			}
			RecDetail::DirUp { .. } => {
				if depth < prunedepth {
					do_dirup(config, wr, coll, &sr, &mut attrstack).await?;
				} else if depth == prunedepth {
					// Finished pruning.
					prunedepth = i64::MAX;
				}
				depth -= 1;
			}
			RecDetail::CheckoutLive { .. } => {
				if depth < prunedepth {
					do_file(config, wr, coll, &sr)?;
				}
			}
			RecDetail::CheckoutDead { .. } => {
				if depth < prunedepth {
					do_dead(config, wr, coll, &sr)?;
				}
			}
		}
	}
	debug_assert_eq!(depth, 0);
	wr.write_str(".\n").map_err(WorkerError::Write)?;
	Ok(())
}

/// Returns false when the directory is gone and its subtree should be
/// pruned from the listing.
fn do_dirdown(
	config: &Config,
	wr: &mut WireWriter,
	coll: &Collection,
	sr: &StatusRec,
	attrstack: &mut Vec<Fattr>,
) -> Result<bool, WorkerError> {
	let fa = if coll.options(CO_TRUSTSTATUSFILE) {
		Fattr::new(FileType::Directory)
	} else {
		let path = coll.prefix.join(&sr.file);
		let mut fa = match Fattr::from_path(&path, true) {
			Some(fa) => fa,
			// The directory does not exist: prune everything below.
			None => return Ok(false),
		};
		if fa.ftype() == FileType::Symlink {
			// A symlink to a directory counts as the directory.
			if let Some(fa2) = Fattr::from_path(&path, false) {
				if fa2.ftype() == FileType::Directory {
					fa = fa2;
				}
			}
		}
		fa
	};

	if fa.ftype() != FileType::Directory {
		// Report it as something bogus so that it gets replaced.
		send_bogus(config, wr, sr)?;
		return Ok(false);
	}

	attrstack.push(fa);
	wr.write_str(&format!("D {}\n", escape(util::path_last(&sr.file))))
		.map_err(WorkerError::Write)?;
	Ok(true)
}

async fn do_dirup(
	config: &Config,
	wr: &mut WireWriter,
	coll: &Collection,
	sr: &StatusRec,
	attrstack: &mut Vec<Fattr>,
) -> Result<(), WorkerError> {
	let clientattr = match &sr.detail {
		RecDetail::DirUp { clientattr } => clientattr,
		_ => return Err(WorkerError::Protocol),
	};
	let fa = attrstack.pop().unwrap_or_else(Fattr::bogus);
	let observed = if coll.options(CO_TRUSTSTATUSFILE) { clientattr } else { &fa };
	let sendattr = if observed.equal(clientattr) {
		observed.encode(Some(&config.fasupport))
	} else {
		Fattr::bogus().encode(Some(&config.fasupport))
	};
	wr.write_str(&format!("U {}\n", escape(&sendattr))).map_err(WorkerError::Write)?;
	wr.flush().await.map_err(WorkerError::Write)?;
	Ok(())
}

fn do_file(
	config: &Config,
	wr: &mut WireWriter,
	coll: &Collection,
	sr: &StatusRec,
) -> Result<(), WorkerError> {
	let (tag, date, serverattr, clientattr) = match &sr.detail {
		RecDetail::CheckoutLive { tag, date, serverattr, clientattr, .. } => {
			(tag, date, serverattr, clientattr)
		}
		_ => return Err(WorkerError::Protocol),
	};

	let mut observed: Option<Fattr> = None;
	if !coll.options(CO_TRUSTSTATUSFILE) {
		let path = match util::checkoutpath(&coll.prefix, &sr.file) {
			Some(path) => path,
			None => return send_bogus(config, wr, sr),
		};
		observed = Fattr::from_path(&path, true);
		if observed.is_none() {
			return send_bogus(config, wr, sr);
		}
	}
	let fa = observed.as_ref().unwrap_or(clientattr);
	let expected = Fattr::for_checkout(serverattr, coll.umask);
	if !fa.equal(clientattr)
		|| !fa.equal(&expected)
		|| coll.tag != *tag
		|| coll.date != *date
	{
		return send_bogus(config, wr, sr);
	}
	wr.write_str(&format!(
		"F {} {}\n",
		escape(util::path_last(&sr.file)),
		escape(&serverattr.encode(Some(&config.fasupport)))
	))
	.map_err(WorkerError::Write)?;
	Ok(())
}

fn do_dead(
	config: &Config,
	wr: &mut WireWriter,
	coll: &Collection,
	sr: &StatusRec,
) -> Result<(), WorkerError> {
	let (tag, date, serverattr) = match &sr.detail {
		RecDetail::CheckoutDead { tag, date, serverattr } => (tag, date, serverattr),
		_ => return Err(WorkerError::Protocol),
	};
	if !coll.options(CO_TRUSTSTATUSFILE) {
		let path = match util::checkoutpath(&coll.prefix, &sr.file) {
			Some(path) => path,
			None => return send_bogus(config, wr, sr),
		};
		if let Some(fa) = Fattr::from_path(&path, true) {
			if fa.ftype() != FileType::Directory {
				// We should not have this file but we do.  The server
				// will either delete it or send the live version.
				return send_bogus(config, wr, sr);
			}
		}
	}
	let sendattr = if coll.tag != *tag || coll.date != *date {
		Fattr::bogus().encode(Some(&config.fasupport))
	} else {
		serverattr.encode(Some(&config.fasupport))
	};
	wr.write_str(&format!("f {} {}\n", escape(util::path_last(&sr.file)), escape(&sendattr)))
		.map_err(WorkerError::Write)?;
	Ok(())
}

fn send_bogus(config: &Config, wr: &mut WireWriter, sr: &StatusRec) -> Result<(), WorkerError> {
	debug!("listing {} as bogus", sr.file);
	wr.write_str(&format!(
		"F {} {}\n",
		escape(util::path_last(&sr.file)),
		escape(&Fattr::bogus().encode(Some(&config.fasupport)))
	))
	.map_err(WorkerError::Write)?;
	Ok(())
}

// vim: ts=4
