//! Applier for the RCS-style line diffs the server sends for checkout
//! updates.
//!
//! A diff is a sequence of `aN M` / `dN M` hunks (0-based in the `a`
//! case, as RCS emits them) terminated by a line of `.` or `.+` (the
//! latter meaning the last line carries no newline).  Added lines that
//! begin with a dot arrive dot-stuffed.  Every emitted line runs
//! through keyword expansion.

use crate::rcs::keyword::{ExpandContext, KeywordTable};
use crate::stream::{FileLineReader, FileLineWriter, WireReader};
use std::io;

fn bad(what: &'static str) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, what)
}

fn writeln(
	to: &mut FileLineWriter,
	table: &KeywordTable,
	ctx: &ExpandContext<'_>,
	line: &[u8],
) -> io::Result<()> {
	let expanded = table.expand_line(ctx, line);
	to.write(&expanded)?;
	to.write(b"\n")
}

/// Apply one diff read from the wire against `orig`, writing the new
/// revision of the file to `to`.
pub async fn apply(
	rd: &mut WireReader,
	orig: &mut FileLineReader,
	to: &mut FileLineWriter,
	table: &KeywordTable,
	ctx: &ExpandContext<'_>,
) -> io::Result<()> {
	let mut last = b'a';
	let mut n: i64 = 0;

	let mut line = rd.getln().await?;
	loop {
		let l = match &line {
			Some(l) => l,
			None => return Err(io::ErrorKind::UnexpectedEof.into()),
		};
		if l == b"." || l == b".+" {
			break;
		}
		// Forced commits come through as an empty line before the
		// terminator; empty lines between hunks are skipped.
		if l.is_empty() {
			line = rd.getln().await?;
			continue;
		}
		let cmd = l[0];
		if cmd != b'a' && cmd != b'd' {
			return Err(bad("bad diff command"));
		}
		let rest = std::str::from_utf8(&l[1..]).map_err(|_| bad("bad hunk header"))?;
		let mut fields = rest.splitn(2, ' ');
		let mut at: i64 = fields
			.next()
			.and_then(|s| s.parse().ok())
			.ok_or_else(|| bad("bad hunk header"))?;
		let mut count: i64 = fields
			.next()
			.and_then(|s| s.parse().ok())
			.ok_or_else(|| bad("bad hunk header"))?;
		if at < 0 || count <= 0 {
			return Err(bad("bad hunk header"));
		}

		// RCS quirk: an "a" hunk following an "a" hunk is positioned
		// one line further than its header says.
		if cmd == b'a' && last == b'a' {
			at += 1;
		}
		while n < at - 1 {
			let oline = orig.getln()?.ok_or_else(|| bad("diff past end of original"))?;
			n += 1;
			writeln(to, table, ctx, &oline)?;
		}
		if cmd == b'a' {
			for _ in 0..count {
				let mut aline =
					rd.getln().await?.ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
				if aline.first() == Some(&b'.') {
					aline.remove(0);
				}
				writeln(to, table, ctx, &aline)?;
			}
		} else {
			while count > 0 {
				if orig.getln()?.is_none() {
					break;
				}
				n += 1;
				count -= 1;
			}
		}
		line = rd.getln().await?;
		last = cmd;
	}

	// Whatever remains of the original copies through.
	while let Some(oline) = orig.getln()? {
		writeln(to, table, ctx, &oline)?;
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::rcs::keyword::ExpandMode;

	fn ctx() -> ExpandContext<'static> {
		ExpandContext {
			rcsfile: "f,v",
			cvsroot: "/cvs",
			revnum: "1.2",
			revdate: "2012.01.01.00.00.00",
			author: "bob",
			state: "Exp",
			tag: None,
			mode: ExpandMode::Default,
		}
	}

	// The wire-reading side of the applier is covered by the updater
	// integration tests; here the hunk arithmetic is exercised through
	// a local pipe-shaped fixture.
	async fn run_diff(diff: &[u8], orig: &[u8]) -> Vec<u8> {
		use crate::mux::{ChanReader, ChanWriter, Mux};
		let (a, b) = tokio::io::duplex(1 << 16);
		let (ar, aw) = tokio::io::split(a);
		let (br, bw) = tokio::io::split(b);
		let client = Mux::connect(ar, aw);
		let server = Mux::accept(br, bw);
		let (client, server) = tokio::join!(client, server);
		let (client, server) = (client.unwrap(), server.unwrap());
		let sid = server.chan_listen().unwrap();
		let accept = {
			let server = server.clone();
			tokio::spawn(async move { server.chan_accept(sid).await })
		};
		let id0 = client.chan_open().await.unwrap();
		accept.await.unwrap().unwrap();
		let mut w = ChanWriter::new(server.clone(), sid);
		w.write_all(diff).await.unwrap();

		let dir = tempfile::tempdir().unwrap();
		let opath = dir.path().join("orig");
		std::fs::write(&opath, orig).unwrap();
		let mut ord = FileLineReader::open(&opath).unwrap();
		let tpath = dir.path().join("to");
		let mut to = FileLineWriter::new(std::fs::File::create(&tpath).unwrap());
		let mut rd = WireReader::new(ChanReader::new(client.clone(), id0));
		let table = KeywordTable::new();
		apply(&mut rd, &mut ord, &mut to, &table, &ctx()).await.unwrap();
		to.into_file().unwrap();
		let out = std::fs::read(&tpath).unwrap();
		client.fini().await;
		server.fini().await;
		out
	}

	#[tokio::test]
	async fn test_apply_delete_then_add() {
		let out = run_diff(b"d2 1\na2 1\ndelta\n.\n", b"alpha\nbeta\ngamma\n").await;
		assert_eq!(out, b"alpha\ndelta\ngamma\n".to_vec());
	}

	#[tokio::test]
	async fn test_empty_diff_copies_through() {
		let out = run_diff(b".\n", b"one\ntwo\n").await;
		assert_eq!(out, b"one\ntwo\n".to_vec());
	}

	#[tokio::test]
	async fn test_dot_stuffed_added_line() {
		let out = run_diff(b"a1 1\n..dot\n.\n", b"x\n").await;
		assert_eq!(out, b"x\n.dot\n".to_vec());
	}

	#[tokio::test]
	async fn test_consecutive_adds_compensate() {
		// Two "a" hunks in a row: the second is off by one in RCS.
		let out = run_diff(b"a1 1\nfirst\na1 1\nsecond\n.\n", b"x\ny\n").await;
		assert_eq!(out, b"x\nfirst\nsecond\ny\n".to_vec());
	}
}

// vim: ts=4
