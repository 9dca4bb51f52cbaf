//! Detailer behavior: the per-file requests emitted for the server's
//! update proposals, in checkout and RCS modes.

use rsup::config::{Collection, Config, CO_CHECKOUTMODE, CO_NORSYNC};
use rsup::detailer::detailer;
use rsup::fattr::{self, Fattr};
use rsup::fixups::fixups;
use rsup::mux::{ChanReader, ChanWriter, Mux};
use rsup::rcs::keyword::KeywordTable;
use rsup::status::{RecDetail, Status, StatusRec};
use rsup::stream::{WireReader, WireWriter};
use rsup::util;
use std::path::Path;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

const SERVER_ATTR: &str = "2#811#13#644";

fn test_config(base: &Path, prefix: &Path, options: u32) -> Config {
	Config {
		host: "test".to_string(),
		port: 0,
		base: base.to_path_buf(),
		colldir: "sup".to_string(),
		colls: vec![Collection {
			name: "x".to_string(),
			release: "r".to_string(),
			tag: ".".to_string(),
			date: ".".to_string(),
			base: base.to_path_buf(),
			prefix: prefix.to_path_buf(),
			cvsroot: "/cvs".to_string(),
			umask: 0o022,
			options,
			keyword: KeywordTable::new(),
			norsync: Vec::new(),
			scantime: AtomicI64::new(-1),
		}],
		fasupport: fattr::SUPPORTED,
	}
}

/// Feed the detailer scripted server commands and collect everything
/// it emits, both passes included.
async fn run_detailer(cfg: Config, commands: &str) -> Vec<String> {
	let (a, b) = tokio::io::duplex(1 << 16);
	let (ar, aw) = tokio::io::split(a);
	let (br, bw) = tokio::io::split(b);
	let (client, server) = tokio::join!(Mux::connect(ar, aw), Mux::accept(br, bw));
	let (client, server) = (client.unwrap(), server.unwrap());
	let sid0 = server.chan_listen().unwrap();
	let accept = {
		let server = server.clone();
		tokio::spawn(async move { server.chan_accept(sid0).await })
	};
	let id0 = client.chan_open().await.unwrap();
	accept.await.unwrap().unwrap();
	let id1 = client.chan_listen().unwrap();
	let sid1 = server.chan_open().await.unwrap();
	client.chan_accept(id1).await.unwrap();

	let cfg = Arc::new(cfg);
	// No updater in this harness: the queue closes at once and the
	// fixup pass runs empty.
	let (fix_tx, fix_rx) = fixups();
	drop(fix_tx);
	let handle = tokio::spawn(detailer(cfg, client.clone(), id0, id1, fix_rx));

	let mut s0w = WireWriter::new(ChanWriter::new(server.clone(), sid0));
	s0w.write_str(&format!("COLL x r 77\n{}.\n.\n", commands)).unwrap();
	s0w.flush().await.unwrap();

	let mut s1r = WireReader::new(ChanReader::new(server.clone(), sid1));
	let mut lines = Vec::new();
	let mut dots = 0;
	// Two dots end the main pass, two more the fixup pass.
	while dots < 4 {
		let line = s1r.getln_str().await.unwrap().expect("EOF from detailer");
		if line == "." {
			dots += 1;
		}
		lines.push(line);
	}
	handle.await.unwrap().unwrap();
	client.fini().await;
	server.fini().await;
	lines
}

#[tokio::test]
async fn test_missing_file_requests_full_checkout() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	let cfg = test_config(base.path(), prefix.path(), CO_CHECKOUTMODE);
	let lines = run_detailer(cfg, "U sub/new.c,v\n").await;
	assert_eq!(
		lines,
		vec![
			"COLL x r".to_string(),
			"C sub/new.c,v . .".to_string(),
			".".to_string(),
			".".to_string(),
			// Fixup pass, empty but always emitted.
			"COLL x r".to_string(),
			".".to_string(),
			".".to_string(),
		]
	);
}

#[tokio::test]
async fn test_recorded_file_requests_delta_update() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	std::fs::write(prefix.path().join("z.c"), "known\n").unwrap();
	let cfg = test_config(base.path(), prefix.path(), CO_CHECKOUTMODE);

	let clientattr = Fattr::from_path(&prefix.path().join("z.c"), true).unwrap();
	let mut st = Status::open(&cfg.colls[0], "sup", Some(1)).unwrap();
	st.put(&StatusRec {
		file: "z.c,v".to_string(),
		detail: RecDetail::CheckoutLive {
			tag: ".".to_string(),
			date: ".".to_string(),
			serverattr: Fattr::decode(SERVER_ATTR).unwrap(),
			revnum: "1.4".to_string(),
			revdate: "2012.02.02.02.02.02".to_string(),
			clientattr,
		},
	})
	.unwrap();
	st.close().unwrap();

	let lines = run_detailer(cfg, "U z.c,v\n").await;
	assert_eq!(lines[1], "U z.c,v . . 1.4 2012.02.02.02.02.02");
}

#[tokio::test]
async fn test_unrecorded_file_sends_checksum() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	std::fs::write(prefix.path().join("z.c"), "local contents\n").unwrap();
	let cfg = test_config(base.path(), prefix.path(), CO_CHECKOUTMODE);
	let (md5, _) = util::md5_file(&prefix.path().join("z.c")).unwrap();

	let lines = run_detailer(cfg, "U z.c,v\n").await;
	assert_eq!(lines[1], format!("S z.c,v . . {}", md5));
}

#[tokio::test]
async fn test_forwarded_commands_pass_through() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	let cfg = test_config(base.path(), prefix.path(), CO_CHECKOUTMODE);
	let lines = run_detailer(
		cfg,
		"D gone/file.c,v\nJ some/dir 1#2\nH linked.c,v target.c,v\n",
	)
	.await;
	assert_eq!(lines[1], "D gone/file.c,v");
	assert_eq!(lines[2], "J some/dir 1#2");
	assert_eq!(lines[3], "H linked.c,v target.c,v");
}

#[tokio::test]
async fn test_rcs_mode_missing_file_requests_whole_file() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	let cfg = test_config(base.path(), prefix.path(), 0);
	let lines = run_detailer(cfg, "U mod/file.c,v\n").await;
	assert_eq!(lines[1], "A mod/file.c,v");
}

#[tokio::test]
async fn test_rcs_mode_parseable_file_sends_delta_details() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	let rcs = "head\t1.2;\n\
		access;\n\
		symbols;\n\
		locks; strict;\n\
		\n\
		1.2\n\
		date\t2012.01.02.03.04.05;\tauthor bob;\tstate Exp;\n\
		branches;\n\
		next\t1.1;\n\
		\n\
		1.1\n\
		date\t2011.12.31.23.59.59;\tauthor alice;\tstate Exp;\n\
		branches;\n\
		next\t;\n\
		\n\
		desc\n\
		@@\n\
		\n\
		1.2\n\
		log\n\
		@tweak\n@\n\
		text\n\
		@line one\nline two\n@\n\
		\n\
		1.1\n\
		log\n\
		@initial\n@\n\
		text\n\
		@d1 1\n@\n";
	std::fs::write(prefix.path().join("file.c,v"), rcs).unwrap();
	let cfg = test_config(base.path(), prefix.path(), 0);

	let lines = run_detailer(cfg, "U file.c,v\n").await;
	assert_eq!(lines[1], "V file.c,v");
	assert_eq!(lines[2], "1.2 2012.01.02.03.04.05 987929d61c9b69f0c6406b840aa77fd8");
	assert_eq!(lines[3], "1.1 2011.12.31.23.59.59 dc31c10dd15c4fd75ee494179bbeebd2");
	assert_eq!(lines[4], ".");
}

#[tokio::test]
async fn test_rcs_mode_regular_file_uses_whole_file_digest_with_norsync() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	std::fs::write(prefix.path().join("data.bin"), "not rcs at all\n").unwrap();
	let cfg = test_config(base.path(), prefix.path(), CO_NORSYNC);
	let (md5, size) = util::md5_file(&prefix.path().join("data.bin")).unwrap();

	let lines = run_detailer(cfg, "U data.bin\n").await;
	assert_eq!(lines[1], format!("R data.bin {} {}", size, md5));
}

#[tokio::test]
async fn test_rcs_mode_regular_file_offers_rsync_blocks() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	let data = vec![b'y'; 100];
	std::fs::write(prefix.path().join("data.bin"), &data).unwrap();
	let cfg = test_config(base.path(), prefix.path(), 0);

	let lines = run_detailer(cfg, "U data.bin\n").await;
	assert_eq!(lines[1], "r data.bin 100 64");
	// Two blocks (64 + 36 bytes), each a weak sum and a block MD5.
	assert_eq!(lines[2].split(' ').count(), 2);
	assert_eq!(lines[3].split(' ').count(), 2);
	assert_eq!(lines[4], ".");
}

#[tokio::test]
async fn test_fixup_pass_terminates_even_when_empty() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	let cfg = test_config(base.path(), prefix.path(), CO_CHECKOUTMODE);
	let lines = run_detailer(cfg, "").await;
	assert_eq!(
		lines,
		vec![
			"COLL x r".to_string(),
			".".to_string(),
			".".to_string(),
			"COLL x r".to_string(),
			".".to_string(),
			".".to_string(),
		]
	);
}
