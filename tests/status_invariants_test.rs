//! Status store invariants: every produced file reads back in strictly
//! increasing record order and with balanced directory brackets.

use rsup::config::{Collection, CO_CHECKOUTMODE};
use rsup::fattr::{Fattr, FileType};
use rsup::rcs::keyword::KeywordTable;
use rsup::status::{statusrec_cmp, RecDetail, RecKind, Status, StatusRec};
use std::cmp::Ordering;
use std::sync::atomic::AtomicI64;

fn test_coll(base: &std::path::Path) -> Collection {
	Collection {
		name: "src".to_string(),
		release: "cvs".to_string(),
		tag: ".".to_string(),
		date: ".".to_string(),
		base: base.to_path_buf(),
		prefix: base.to_path_buf(),
		cvsroot: String::new(),
		umask: 0o022,
		options: CO_CHECKOUTMODE,
		keyword: KeywordTable::new(),
		norsync: Vec::new(),
		scantime: AtomicI64::new(-1),
	}
}

fn live_rec(file: &str) -> StatusRec {
	let mut attr = Fattr::new(FileType::File);
	attr.set_modtime(1000);
	StatusRec {
		file: file.to_string(),
		detail: RecDetail::CheckoutLive {
			tag: ".".to_string(),
			date: ".".to_string(),
			serverattr: attr.clone(),
			revnum: "1.1".to_string(),
			revdate: "2012.01.01.00.00.00".to_string(),
			clientattr: attr,
		},
	}
}

fn dead_rec(file: &str) -> StatusRec {
	let mut attr = Fattr::new(FileType::File);
	attr.set_modtime(1000);
	StatusRec {
		file: file.to_string(),
		detail: RecDetail::CheckoutDead {
			tag: ".".to_string(),
			date: ".".to_string(),
			serverattr: attr,
		},
	}
}

fn check_invariants(coll: &Collection) -> Vec<(RecKind, String)> {
	let mut st = Status::open(coll, "sup", None).unwrap();
	let mut seen: Vec<(RecKind, String)> = Vec::new();
	let mut depth = 0i64;
	while let Some(rec) = st.next().unwrap() {
		if let Some((pk, pf)) = seen.last() {
			assert_eq!(
				statusrec_cmp(*pk, pf, rec.kind(), &rec.file),
				Ordering::Less,
				"records out of order: {:?} then {:?}",
				pf,
				rec.file
			);
		}
		match rec.kind() {
			RecKind::DirDown => depth += 1,
			RecKind::DirUp => {
				depth -= 1;
				assert!(depth >= 0, "unbalanced brackets");
			}
			_ => {}
		}
		seen.push((rec.kind(), rec.file.clone()));
	}
	assert_eq!(depth, 0, "brackets do not balance");
	seen
}

#[test]
fn test_deep_tree_stays_sorted_and_balanced() {
	let dir = tempfile::tempdir().unwrap();
	let coll = test_coll(dir.path());

	let mut st = Status::open(&coll, "sup", Some(1)).unwrap();
	for file in [
		"a/1", "a/b/2", "a/b/3", "a/b/c/4", "a/z", "b/1", "m", "z/deep/deeper/leaf",
	] {
		st.put(&live_rec(file)).unwrap();
	}
	st.close().unwrap();
	let seen = check_invariants(&coll);
	assert_eq!(seen.iter().filter(|(k, _)| *k == RecKind::CheckoutLive).count(), 8);
}

#[test]
fn test_incremental_merge_preserves_invariants() {
	let dir = tempfile::tempdir().unwrap();
	let coll = test_coll(dir.path());

	let mut st = Status::open(&coll, "sup", Some(1)).unwrap();
	for file in ["a/b/one", "a/b/two", "c/three", "d/four"] {
		st.put(&live_rec(file)).unwrap();
	}
	st.close().unwrap();

	// Second run: replace one record, add records on both sides of the
	// existing ones, delete another and mark one dead.
	let mut st = Status::open(&coll, "sup", Some(2)).unwrap();
	st.put(&live_rec("a/a/zero")).unwrap();
	st.put(&live_rec("a/b/two")).unwrap();
	st.put(&dead_rec("c/gone")).unwrap();
	st.delete("c/three", false).unwrap();
	st.put(&live_rec("e/five")).unwrap();
	st.close().unwrap();

	let seen = check_invariants(&coll);
	let files: Vec<&str> = seen
		.iter()
		.filter(|(k, _)| matches!(k, RecKind::CheckoutLive | RecKind::CheckoutDead))
		.map(|(_, f)| f.as_str())
		.collect();
	assert_eq!(files, vec!["a/a/zero", "a/b/one", "a/b/two", "c/gone", "d/four", "e/five"]);
}

#[test]
fn test_unchanged_run_leaves_file_alone() {
	let dir = tempfile::tempdir().unwrap();
	let coll = test_coll(dir.path());

	let mut st = Status::open(&coll, "sup", Some(7)).unwrap();
	st.put(&live_rec("a/file")).unwrap();
	st.close().unwrap();
	let before = std::fs::read(coll.status_path("sup")).unwrap();

	// Same scan time, no modifications: the tempfile is discarded.
	let st = Status::open(&coll, "sup", Some(7)).unwrap();
	st.close().unwrap();
	let after = std::fs::read(coll.status_path("sup")).unwrap();
	assert_eq!(before, after);

	// No stray temporaries left next to the status file.
	let dirents: Vec<_> = std::fs::read_dir(coll.status_path("sup").parent().unwrap())
		.unwrap()
		.map(|e| e.unwrap().file_name())
		.collect();
	assert_eq!(dirents.len(), 1);
}
