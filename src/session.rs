//! Session driver: connects to the server, performs the text-mode
//! handshake (greeting, protocol and attribute negotiation, login,
//! collection exchange), switches to multiplexed mode and runs the
//! three pipeline workers to completion.

use crate::config::{Config, CO_SKIP};
use crate::detailer::detailer;
use crate::fattr;
use crate::fixups::fixups;
use crate::lister::lister;
use crate::logging::*;
use crate::mux::{ChanWriter, Mux};
use crate::proto::{escape, Scanner};
use crate::stream::WireWriter;
use crate::updater::updater;
use crate::util;
use std::error::Error;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const PROTO_MAJ: u32 = 17;
const PROTO_MIN: u32 = 0;
const PROTO_SWVER: &str = "CSUP_0_1";

struct ServerConn {
	rd: BufReader<OwnedReadHalf>,
	wr: OwnedWriteHalf,
}

impl ServerConn {
	async fn getln(&mut self) -> Result<String, Box<dyn Error>> {
		let mut line = String::new();
		let n = self.rd.read_line(&mut line).await?;
		if n == 0 {
			return Err("Connection closed by server".into());
		}
		if line.ends_with('\n') {
			line.pop();
		}
		Ok(line)
	}

	async fn send(&mut self, s: &str) -> Result<(), Box<dyn Error>> {
		self.wr.write_all(s.as_bytes()).await?;
		Ok(())
	}
}

/// Run a full session for the given configuration.
pub async fn run(mut config: Config) -> Result<(), Box<dyn Error>> {
	let addr = format!("{}:{}", config.host, config.port);
	debug!("Connecting to {}", addr);
	let socket = TcpStream::connect(&addr)
		.await
		.map_err(|e| format!("Cannot connect to {}: {}", addr, e))?;
	let (rd, wr) = socket.into_split();
	let mut conn = ServerConn { rd: BufReader::new(rd), wr };

	greet(&mut conn).await?;
	negproto(&mut conn).await?;
	login(&mut conn).await?;
	negattr(&mut conn, &mut config).await?;
	xchgcoll(&mut conn, &mut config).await?;

	debug!("Establishing multiplexed-mode data connection");
	conn.send("MUX\n").await?;
	let mux = Mux::connect(conn.rd, conn.wr)
		.await
		.map_err(|e| format!("Cannot establish multiplexed mode: {}", e))?;

	let id0 = mux.chan_open().await?;
	let id1 = mux.chan_listen()?;
	{
		let mut chan0 = WireWriter::new(ChanWriter::new(mux.clone(), id0));
		chan0.write_str(&format!("CHAN {}\n", id1))?;
		chan0.flush().await?;
	}
	mux.chan_accept(id1).await?;

	let config = Arc::new(config);
	let (fix_tx, fix_rx) = fixups();
	let lh = tokio::spawn(lister(config.clone(), mux.clone(), id0));
	let dh = tokio::spawn(detailer(config.clone(), mux.clone(), id0, id1, fix_rx));
	let uh = tokio::spawn(updater(config.clone(), mux.clone(), id1, fix_tx));
	debug!("Running");

	// All three workers are joined unconditionally so the multiplexer
	// can always be torn down cleanly.
	let (lres, dres, ures) = futures::join!(lh, dh, uh);
	let mut failed = false;
	let mut transient = false;
	for (who, res) in [("Lister", lres), ("Detailer", dres), ("Updater", ures)] {
		match res {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				error!("{} failed: {}", who, e);
				failed = true;
				transient = transient || e.is_transient();
			}
			Err(e) => {
				error!("{} failed: {}", who, e);
				failed = true;
			}
		}
	}

	if failed {
		// Do not wait for orderly channel closure the peer may never
		// perform; force the teardown.
		mux.fini().await;
		if transient {
			return Err("Failed due to a network problem; try again later".into());
		}
		return Err("Failed".into());
	}

	debug!("Shutting down connection to server");
	let _ = mux.chan_close(id0);
	let _ = mux.chan_close(id1);
	mux.chan_wait(id0).await;
	mux.chan_wait(id1).await;
	mux.fini().await;
	info!("Finished successfully");
	Ok(())
}

/// Read and check the server's greeting.
async fn greet(conn: &mut ServerConn) -> Result<(), Box<dyn Error>> {
	let line = conn.getln().await?;
	let mut sc = Scanner::new(&line);
	match sc.get_ascii().as_deref() {
		Some("OK") => {
			let _maj = sc.get_ascii();
			let _min = sc.get_ascii();
			let swver = sc.get_ascii();
			debug!("Server software version: {}", swver.as_deref().unwrap_or("."));
			Ok(())
		}
		Some("!") => {
			Err(format!("Rejected by server: {}", sc.get_rest().unwrap_or_default()).into())
		}
		_ => Err("Invalid greeting from server".into()),
	}
}

/// Negotiate the protocol version.
async fn negproto(conn: &mut ServerConn) -> Result<(), Box<dyn Error>> {
	conn.send(&format!("PROTO {} {} {}\n", PROTO_MAJ, PROTO_MIN, PROTO_SWVER)).await?;
	let line = conn.getln().await?;
	let mut sc = Scanner::new(&line);
	match sc.get_ascii().as_deref() {
		Some("PROTO") => {
			let maj = sc.get_int();
			let min = sc.get_int();
			if maj.is_none() || min.is_none() {
				return Err("Invalid PROTO command from server".into());
			}
			if maj != Some(PROTO_MAJ as i64) || min != Some(PROTO_MIN as i64) {
				return Err(format!(
					"Server protocol version {}.{} not supported by client",
					maj.expect("checked above"),
					min.expect("checked above")
				)
				.into());
			}
			Ok(())
		}
		Some("!") => {
			Err(format!("Protocol negotiation failed: {}", sc.get_rest().unwrap_or_default())
				.into())
		}
		_ => Err("Invalid PROTO command from server".into()),
	}
}

/// Identify ourselves; only the unauthenticated exchange is supported.
async fn login(conn: &mut ServerConn) -> Result<(), Box<dyn Error>> {
	conn.send(&format!("USER {} {}\n", escape(&util::login_name()), escape(&util::hostname())))
		.await?;
	let line = conn.getln().await?;
	let mut sc = Scanner::new(&line);
	let _cmd = sc.get_ascii();
	let realm = sc.get_ascii();
	let challenge = sc.get_ascii();
	if challenge.is_none() || !sc.at_end() {
		return Err("Invalid server reply to USER".into());
	}
	if realm.as_deref() != Some(".") || challenge.as_deref() != Some(".") {
		return Err("Authentication required by the server and not supported by client".into());
	}
	conn.send("AUTHMD5 . . .\n").await?;
	let line = conn.getln().await?;
	let mut sc = Scanner::new(&line);
	match sc.get_ascii().as_deref() {
		Some("OK") => Ok(()),
		Some("!") => Err(format!("Server error: {}", sc.get_rest().unwrap_or_default()).into()),
		_ => Err("Invalid server reply to AUTHMD5".into()),
	}
}

/// File attribute support negotiation: both sides advertise the
/// attributes they can handle per file type and the session uses the
/// intersection.
async fn negattr(conn: &mut ServerConn, config: &mut Config) -> Result<(), Box<dyn Error>> {
	debug!("Negotiating file attribute support");
	let mut msg = format!("ATTR {}\n", fattr::FT_NUMBER);
	for i in 0..fattr::FT_NUMBER {
		msg.push_str(&format!("{:x}\n", fattr::SUPPORTED[i]));
	}
	msg.push_str(".\n");
	conn.send(&msg).await?;

	let line = conn.getln().await?;
	let mut sc = Scanner::new(&line);
	if sc.get_ascii().as_deref() != Some("ATTR") {
		return Err("Protocol error negotiating attribute support".into());
	}
	let n = sc
		.get_int()
		.filter(|&n| n >= 0 && n as usize <= fattr::FT_NUMBER)
		.ok_or("Protocol error negotiating attribute support")?;
	let mut support = [0u32; fattr::FT_NUMBER];
	for (i, slot) in support.iter_mut().enumerate().take(n as usize) {
		let line = conn.getln().await?;
		let attr = u32::from_str_radix(line.trim(), 16)
			.map_err(|_| "Protocol error negotiating attribute support")?;
		*slot = fattr::SUPPORTED[i] & attr;
	}
	let line = conn.getln().await?;
	if line != "." {
		return Err("Protocol error negotiating attribute support".into());
	}
	config.fasupport = support;
	Ok(())
}

/// Exchange collection information: send every collection with its
/// options, fold in the server's option reply and collect the CVS root
/// and keyword configuration it pushes back.
async fn xchgcoll(conn: &mut ServerConn, config: &mut Config) -> Result<(), Box<dyn Error>> {
	debug!("Exchanging collection information");
	let mut msg = String::new();
	for coll in &config.colls {
		msg.push_str(&format!(
			"COLL {} {} {:o} {}\n.\n",
			escape(&coll.name),
			escape(&coll.release),
			coll.umask,
			coll.options
		));
	}
	msg.push_str(".\n");
	conn.send(&msg).await?;

	for coll in &mut config.colls {
		if coll.options(CO_SKIP) {
			continue;
		}
		let line = conn.getln().await?;
		let mut sc = Scanner::new(&line);
		let cmd = sc.get_ascii();
		let collname = sc.get_ascii();
		let release = sc.get_ascii();
		let options = sc.get_int();
		if options.is_none()
			|| !sc.at_end()
			|| cmd.as_deref() != Some("COLL")
			|| collname.as_deref() != Some(coll.name.as_str())
			|| release.as_deref() != Some(coll.release.as_str())
		{
			return Err("Protocol error during collection exchange".into());
		}
		coll.fold_server_options(options.expect("checked above") as u32);

		loop {
			let line = conn.getln().await?;
			if line == "." {
				break;
			}
			let mut sc = Scanner::new(&line);
			match sc.get_ascii().as_deref() {
				Some("!") => {
					warn!("Server message: {}", sc.get_rest().unwrap_or_default());
				}
				Some("PRFX") => {
					coll.cvsroot = sc.get_rest().unwrap_or_default();
				}
				Some("KEYALIAS") => {
					let ident = sc.get_ascii();
					let rcskey = sc.get_ascii();
					if rcskey.is_none() || !sc.at_end() {
						return Err("Protocol error during collection exchange".into());
					}
					coll.keyword
						.alias(&ident.expect("checked above"), &rcskey.expect("checked above"))
						.map_err(|_| "Protocol error during collection exchange")?;
				}
				Some("KEYON") => {
					let ident = sc.get_ascii();
					if ident.is_none() || !sc.at_end() {
						return Err("Protocol error during collection exchange".into());
					}
					coll.keyword
						.enable(&ident.expect("checked above"))
						.map_err(|_| "Protocol error during collection exchange")?;
				}
				Some("KEYOFF") => {
					let ident = sc.get_ascii();
					if ident.is_none() || !sc.at_end() {
						return Err("Protocol error during collection exchange".into());
					}
					coll.keyword
						.disable(&ident.expect("checked above"))
						.map_err(|_| "Protocol error during collection exchange")?;
				}
				_ => {}
			}
		}
	}
	Ok(())
}

// vim: ts=4
