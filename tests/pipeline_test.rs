//! End-to-end pipeline tests: the three workers run against a scripted
//! peer speaking the multiplexed wire protocol over an in-memory
//! duplex, exactly as a server would.

use rsup::config::{Collection, Config, CO_CHECKOUTMODE, CO_DELETE};
use rsup::detailer::detailer;
use rsup::fattr::{self, Fattr, FileType};
use rsup::fixups::fixups;
use rsup::lister::lister;
use rsup::mux::{ChanReader, ChanWriter, Mux};
use rsup::rcs::keyword::KeywordTable;
use rsup::status::{RecDetail, RecKind, Status, StatusRec};
use rsup::stream::{WireReader, WireWriter};
use rsup::updater::updater;
use std::path::Path;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

const GOOD_MD5: &str = "e971ca2a05ee04f9d84d94b92a74d751"; // alpha\ndelta\ngamma\n

fn test_config(base: &Path, prefix: &Path, extra_options: u32) -> Config {
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
			options: CO_CHECKOUTMODE | extra_options,
			keyword: KeywordTable::new(),
			norsync: Vec::new(),
			scantime: AtomicI64::new(-1),
		}],
		fasupport: fattr::SUPPORTED,
	}
}

struct Peer {
	client: Arc<Mux>,
	server: Arc<Mux>,
	s0w: WireWriter,
	s1r: WireReader,
	s1w: WireWriter,
	lister_out: tokio::task::JoinHandle<Vec<String>>,
}

/// Two connected multiplexers with both channels up, the scripted peer
/// on the server side and a drain task collecting the lister's output.
async fn peer() -> Peer {
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
	assert_eq!((id0, id1), (sid0, sid1));

	let mut s0r = WireReader::new(ChanReader::new(server.clone(), sid0));
	let lister_out = tokio::spawn(async move {
		let mut lines = Vec::new();
		while let Some(line) = s0r.getln_str().await.unwrap() {
			lines.push(line);
		}
		lines
	});

	Peer {
		s0w: WireWriter::new(ChanWriter::new(server.clone(), sid0)),
		s1r: WireReader::new(ChanReader::new(server.clone(), sid1)),
		s1w: WireWriter::new(ChanWriter::new(server.clone(), sid1)),
		client,
		server,
		lister_out,
	}
}

/// Read one detailer pass: with a single collection, a pass ends after
/// its two terminating dots.
async fn read_pass(rd: &mut WireReader) -> Vec<String> {
	let mut lines = Vec::new();
	let mut dots = 0;
	while dots < 2 {
		let line = rd.getln_str().await.unwrap().expect("peer saw EOF mid-pass");
		if line == "." {
			dots += 1;
		}
		lines.push(line);
	}
	lines
}

async fn send(wr: &mut WireWriter, text: &str) {
	wr.write_str(text).unwrap();
	wr.flush().await.unwrap();
}

fn spawn_workers(
	cfg: &Arc<Config>,
	client: &Arc<Mux>,
) -> (
	tokio::task::JoinHandle<Result<(), rsup::WorkerError>>,
	tokio::task::JoinHandle<Result<(), rsup::WorkerError>>,
	tokio::task::JoinHandle<Result<(), rsup::WorkerError>>,
) {
	let (fix_tx, fix_rx) = fixups();
	let lh = tokio::spawn(lister(cfg.clone(), client.clone(), 0));
	let dh = tokio::spawn(detailer(cfg.clone(), client.clone(), 0, 1, fix_rx));
	let uh = tokio::spawn(updater(cfg.clone(), client.clone(), 1, fix_tx));
	(lh, dh, uh)
}

fn read_status(coll: &Collection) -> Vec<(RecKind, String)> {
	let mut st = Status::open(coll, "sup", None).unwrap();
	let mut recs = Vec::new();
	while let Some(rec) = st.next().unwrap() {
		recs.push((rec.kind(), rec.file.clone()));
	}
	recs
}

fn attr_text() -> String {
	let mut fa = Fattr::new(FileType::File);
	fa.set_modtime(1325376000);
	fa.encode(None)
}

#[tokio::test]
async fn test_empty_status_no_changes() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	let cfg = Arc::new(test_config(base.path(), prefix.path(), 0));
	let mut peer = peer().await;
	let (lh, dh, uh) = spawn_workers(&cfg, &peer.client);

	send(&mut peer.s0w, "COLL x r 123\n.\n.\n").await;
	let req1 = read_pass(&mut peer.s1r).await;
	assert_eq!(req1, vec!["COLL x r", ".", "."]);
	send(&mut peer.s1w, "COLL x r\n.\n.\n").await;
	let req2 = read_pass(&mut peer.s1r).await;
	assert_eq!(req2, vec!["COLL x r", ".", "."]);
	send(&mut peer.s1w, "COLL x r\n.\n.\n").await;

	lh.await.unwrap().unwrap();
	dh.await.unwrap().unwrap();
	uh.await.unwrap().unwrap();
	assert_eq!(peer.lister_out.await.unwrap(), vec!["COLL x r", ".", "."]);

	let status = std::fs::read_to_string(cfg.colls[0].status_path("sup")).unwrap();
	assert_eq!(status, "F 5 123\n");

	peer.client.fini().await;
	peer.server.fini().await;
}

#[tokio::test]
async fn test_checkout_dead_records_status_without_touching_fs() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	let cfg = Arc::new(test_config(base.path(), prefix.path(), 0));
	let mut peer = peer().await;
	let (lh, dh, uh) = spawn_workers(&cfg, &peer.client);

	send(&mut peer.s0w, "COLL x r 99\n.\n.\n").await;
	read_pass(&mut peer.s1r).await;
	send(
		&mut peer.s1w,
		&format!("COLL x r\nc a/b/c . . {}\n.\n.\n", attr_text()),
	)
	.await;
	read_pass(&mut peer.s1r).await;
	send(&mut peer.s1w, "COLL x r\n.\n.\n").await;

	lh.await.unwrap().unwrap();
	dh.await.unwrap().unwrap();
	uh.await.unwrap().unwrap();
	peer.lister_out.await.unwrap();

	assert_eq!(
		read_status(&cfg.colls[0]),
		vec![
			(RecKind::DirDown, "a".to_string()),
			(RecKind::DirDown, "a/b".to_string()),
			(RecKind::CheckoutDead, "a/b/c".to_string()),
			(RecKind::DirUp, "a/b".to_string()),
			(RecKind::DirUp, "a".to_string()),
		]
	);
	// Nothing was created under the checkout prefix.
	assert_eq!(std::fs::read_dir(prefix.path()).unwrap().count(), 0);

	peer.client.fini().await;
	peer.server.fini().await;
}

fn diff_update_block(wantmd5: &str) -> String {
	format!(
		"COLL x r\n\
		 U f.c,v . . 1.1 0 0 . {attr} {md5}\n\
		 D 1.2 . 2012.01.01.00.00.00 bob\n\
		 L\n\
		 .\n\
		 S Exp\n\
		 T\n\
		 d2 1\n\
		 a2 1\n\
		 delta\n\
		 .\n\
		 .\n\
		 .\n\
		 .\n\
		 .\n",
		attr = attr_text(),
		md5 = wantmd5
	)
}

#[tokio::test]
async fn test_delta_apply_updates_file_and_status() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	std::fs::write(prefix.path().join("f.c"), "alpha\nbeta\ngamma\n").unwrap();
	let cfg = Arc::new(test_config(base.path(), prefix.path(), 0));
	let mut peer = peer().await;
	let (lh, dh, uh) = spawn_workers(&cfg, &peer.client);

	send(&mut peer.s0w, "COLL x r 5\n.\n.\n").await;
	read_pass(&mut peer.s1r).await;
	send(&mut peer.s1w, &diff_update_block(GOOD_MD5)).await;
	let req2 = read_pass(&mut peer.s1r).await;
	assert_eq!(req2, vec!["COLL x r", ".", "."], "no fixups expected");
	send(&mut peer.s1w, "COLL x r\n.\n.\n").await;

	lh.await.unwrap().unwrap();
	dh.await.unwrap().unwrap();
	uh.await.unwrap().unwrap();
	peer.lister_out.await.unwrap();

	let contents = std::fs::read_to_string(prefix.path().join("f.c")).unwrap();
	assert_eq!(contents, "alpha\ndelta\ngamma\n");

	let mut st = Status::open(&cfg.colls[0], "sup", None).unwrap();
	let rec = st.lookup("f.c,v", false, false).unwrap().expect("record exists");
	match &rec.detail {
		RecDetail::CheckoutLive { revnum, revdate, .. } => {
			assert_eq!(revnum, "1.2");
			assert_eq!(revdate, "2012.01.01.00.00.00");
		}
		other => panic!("unexpected record: {:?}", other),
	}

	// No temporaries were left next to the target.
	let names: Vec<String> = std::fs::read_dir(prefix.path())
		.unwrap()
		.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
		.collect();
	assert_eq!(names, vec!["f.c".to_string()]);

	peer.client.fini().await;
	peer.server.fini().await;
}

#[tokio::test]
async fn test_md5_mismatch_drives_fixup_pass() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	std::fs::write(prefix.path().join("f.c"), "alpha\nbeta\ngamma\n").unwrap();
	let cfg = Arc::new(test_config(base.path(), prefix.path(), 0));
	let mut peer = peer().await;
	let (lh, dh, uh) = spawn_workers(&cfg, &peer.client);

	send(&mut peer.s0w, "COLL x r 5\n.\n.\n").await;
	read_pass(&mut peer.s1r).await;
	// Advertise a checksum the patched file cannot match.
	send(&mut peer.s1w, &diff_update_block(&"0".repeat(32))).await;

	// The fixup pass must request exactly this file, once.
	let req2 = read_pass(&mut peer.s1r).await;
	assert_eq!(req2, vec!["COLL x r", "Y f.c,v . .", ".", "."]);

	// Serve the fixup with a full checkout body.
	send(
		&mut peer.s1w,
		&format!(
			"COLL x r\n\
			 Y f.c,v . . 1.2 2012.01.01.00.00.00 {attr}\n\
			 alpha\n\
			 delta\n\
			 gamma\n\
			 .\n\
			 5 {md5}\n\
			 .\n\
			 .\n",
			attr = attr_text(),
			md5 = GOOD_MD5
		),
	)
	.await;

	lh.await.unwrap().unwrap();
	dh.await.unwrap().unwrap();
	uh.await.unwrap().unwrap();
	peer.lister_out.await.unwrap();

	let contents = std::fs::read_to_string(prefix.path().join("f.c")).unwrap();
	assert_eq!(contents, "alpha\ndelta\ngamma\n");

	peer.client.fini().await;
	peer.server.fini().await;
}

#[tokio::test]
async fn test_delete_prunes_empty_parents() {
	let base = tempfile::tempdir().unwrap();
	let prefix = tempfile::tempdir().unwrap();
	std::fs::create_dir_all(prefix.path().join("x/y")).unwrap();
	std::fs::write(prefix.path().join("x/y/z"), "doomed\n").unwrap();

	let cfg = Arc::new(test_config(base.path(), prefix.path(), CO_DELETE));
	// Previous run recorded the file.
	{
		let mut st = Status::open(&cfg.colls[0], "sup", Some(1)).unwrap();
		let mut attr = Fattr::new(FileType::File);
		attr.set_modtime(1325376000);
		st.put(&StatusRec {
			file: "x/y/z,v".to_string(),
			detail: RecDetail::CheckoutLive {
				tag: ".".to_string(),
				date: ".".to_string(),
				serverattr: attr.clone(),
				revnum: "1.1".to_string(),
				revdate: "2012.01.01.00.00.00".to_string(),
				clientattr: attr,
			},
		})
		.unwrap();
		st.close().unwrap();
	}

	let mut peer = peer().await;
	let (lh, dh, uh) = spawn_workers(&cfg, &peer.client);

	send(&mut peer.s0w, "COLL x r 2\n.\n.\n").await;
	read_pass(&mut peer.s1r).await;
	send(&mut peer.s1w, "COLL x r\nD x/y/z,v\n.\n.\n").await;
	read_pass(&mut peer.s1r).await;
	send(&mut peer.s1w, "COLL x r\n.\n.\n").await;

	lh.await.unwrap().unwrap();
	dh.await.unwrap().unwrap();
	uh.await.unwrap().unwrap();
	peer.lister_out.await.unwrap();

	// The file and its now-empty parents are gone; the prefix stays.
	assert!(!prefix.path().join("x/y/z").exists());
	assert!(!prefix.path().join("x/y").exists());
	assert!(!prefix.path().join("x").exists());
	assert!(prefix.path().exists());

	let recs = read_status(&cfg.colls[0]);
	assert!(
		!recs.iter().any(|(k, _)| *k == RecKind::CheckoutLive),
		"status record was not removed: {:?}",
		recs
	);

	peer.client.fini().await;
	peer.server.fini().await;
}
