//! Small helpers shared across the pipeline: the path ordering used by
//! status files, checkout/RCS path derivation, temporary file naming and
//! the safe wrappers around the libc calls we need.

use md5::{Digest, Md5};
use std::cmp::Ordering;
use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

/// Compare two paths byte-wise with `/` sorting before every other
/// character (it is compared as code point 1).  This is the order status
/// files are kept in.
pub fn pathcmp(a: &str, b: &str) -> Ordering {
	let key = |c: u8| if c == b'/' { 1u8 } else { c };
	let mut ia = a.bytes().map(key);
	let mut ib = b.bytes().map(key);
	loop {
		match (ia.next(), ib.next()) {
			(None, None) => return Ordering::Equal,
			(None, Some(_)) => return Ordering::Less,
			(Some(_), None) => return Ordering::Greater,
			(Some(ca), Some(cb)) => match ca.cmp(&cb) {
				Ordering::Equal => continue,
				other => return other,
			},
		}
	}
}

/// Length of the longest common directory prefix of two paths.
pub fn commonpathlength(a: &str, b: &str) -> usize {
	let ab = a.as_bytes();
	let bb = b.as_bytes();
	let minlen = ab.len().min(bb.len());
	let mut lastslash = 0;
	for i in 0..minlen {
		if ab[i] != bb[i] {
			return lastslash;
		}
		if ab[i] == b'/' {
			// Include the leading slash of an absolute path.
			lastslash = if i == 0 { 1 } else { i };
		}
	}
	if ab.len() > minlen {
		if ab[minlen] == b'/' {
			return minlen;
		}
		return lastslash;
	} else if bb.len() > minlen {
		if bb[minlen] == b'/' {
			return minlen;
		}
		return lastslash;
	}
	minlen
}

/// Final component of a slash-separated path.
pub fn path_last(path: &str) -> &str {
	match path.rfind('/') {
		Some(pos) => &path[pos + 1..],
		None => path,
	}
}

/// Absolute pathname of the checkout file corresponding to `file`
/// under `prefix`.  An RCS `,v` suffix is stripped; the path must be
/// relative and must not contain `..` components.
pub fn checkoutpath(prefix: &Path, file: &str) -> Option<PathBuf> {
	if file.is_empty() || file.starts_with('/') {
		return None;
	}
	for comp in file.split('/') {
		if comp == ".." {
			return None;
		}
	}
	let stripped = file.strip_suffix(",v").unwrap_or(file);
	if stripped.is_empty() {
		return None;
	}
	Some(prefix.join(stripped))
}

/// Pathname of the RCS file `name` under `prefix`, optionally looking in
/// the Attic subdirectory next to it.
pub fn cvspath(prefix: &Path, name: &str, attic: bool) -> PathBuf {
	if !attic {
		return prefix.join(name);
	}
	match name.rfind('/') {
		Some(pos) => prefix.join(&name[..pos]).join("Attic").join(&name[pos + 1..]),
		None => prefix.join("Attic").join(name),
	}
}

/// Pathname of the RCS file, preferring the regular location and falling
/// back to the Attic when only the latter exists.
pub fn atticpath(prefix: &Path, name: &str) -> PathBuf {
	let path = cvspath(prefix, name, false);
	if path.exists() {
		return path;
	}
	let attic = cvspath(prefix, name, true);
	if attic.exists() {
		return attic;
	}
	path
}

const TEMPNAME_PREFIX: &str = "#cvs.csup";

static TEMPNAME_COUNT: AtomicU32 = AtomicU32::new(0);

/// Compute a temporary pathname in the same directory as `path`.  The
/// names mimic CVSup's so that stale temporaries are recognizable.
pub fn tempname(path: &Path) -> PathBuf {
	let count = TEMPNAME_COUNT.fetch_add(1, AtomicOrdering::Relaxed);
	let name = format!("{}-{}.{}", TEMPNAME_PREFIX, std::process::id(), count);
	match path.parent() {
		Some(dir) if dir != Path::new("") => dir.join(name),
		_ => PathBuf::from(name),
	}
}

/// Create all the directories leading to `path` (but not `path` itself).
pub fn mkdirhier(path: &Path) -> io::Result<()> {
	if let Some(parent) = path.parent() {
		if !parent.as_os_str().is_empty() {
			std::fs::create_dir_all(parent)?;
		}
	}
	Ok(())
}

/// Parse an RCS date of the form `YYYY.MM.DD.HH.MM.SS` (a two-digit year
/// is accepted and interpreted the way strptime's %y does) into seconds
/// since the epoch, UTC.
pub fn rcsdate_to_time(revdate: &str) -> Option<i64> {
	let mut parts = revdate.split('.');
	let mut year: i64 = parts.next()?.parse().ok()?;
	let month: i64 = parts.next()?.parse().ok()?;
	let day: i64 = parts.next()?.parse().ok()?;
	let hour: i64 = parts.next()?.parse().ok()?;
	let min: i64 = parts.next()?.parse().ok()?;
	let sec: i64 = parts.next()?.parse().ok()?;
	if parts.next().is_some() {
		return None;
	}
	if year < 100 {
		year += if year <= 68 { 2000 } else { 1900 };
	}
	if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
		return None;
	}
	if !(0..24).contains(&hour) || !(0..60).contains(&min) || !(0..61).contains(&sec) {
		return None;
	}
	Some(days_from_civil(year, month, day) * 86400 + hour * 3600 + min * 60 + sec)
}

/// Reformat an RCS date as CVS writes it into expanded keywords,
/// `YYYY/MM/DD HH:MM:SS`.
pub fn rcsdate_to_cvsdate(revdate: &str) -> Option<String> {
	let mut parts = revdate.split('.');
	let mut year: i64 = parts.next()?.parse().ok()?;
	if year < 100 {
		year += if year <= 68 { 2000 } else { 1900 };
	}
	let mut rest = [0i64; 5];
	for slot in rest.iter_mut() {
		*slot = parts.next()?.parse().ok()?;
	}
	if parts.next().is_some() {
		return None;
	}
	Some(format!(
		"{:04}/{:02}/{:02} {:02}:{:02}:{:02}",
		year, rest[0], rest[1], rest[2], rest[3], rest[4]
	))
}

/// Days since 1970-01-01 for a proleptic Gregorian civil date.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
	let y = if m <= 2 { y - 1 } else { y };
	let era = if y >= 0 { y } else { y - 399 } / 400;
	let yoe = y - era * 400;
	let mp = (m + 9) % 12;
	let doy = (153 * mp + 2) / 5 + d - 1;
	let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
	era * 146097 + doe - 719468
}

/// Compute the MD5 checksum of a file as a lowercase hex digest, along
/// with the file size.
pub fn md5_file(path: &Path) -> io::Result<(String, u64)> {
	let mut file = File::open(path)?;
	let mut ctx = Md5::new();
	let mut buf = [0u8; 8192];
	let mut size = 0u64;
	loop {
		let n = file.read(&mut buf)?;
		if n == 0 {
			break;
		}
		size += n as u64;
		ctx.update(&buf[..n]);
	}
	Ok((hex::encode(ctx.finalize()), size))
}

/// Get the effective user ID of the current process.
#[allow(unsafe_code)]
pub fn effective_uid() -> u32 {
	// SAFETY: geteuid() just returns a value from the process
	// credentials without any side effects.
	unsafe { libc::geteuid() }
}

/// Get the effective group ID of the current process.
#[allow(unsafe_code)]
pub fn effective_gid() -> u32 {
	// SAFETY: getegid() just returns a value from the process
	// credentials without any side effects.
	unsafe { libc::getegid() }
}

/// Host name of this machine, for the login exchange.
#[allow(unsafe_code)]
pub fn hostname() -> String {
	let mut buf = [0u8; 256];
	// SAFETY: gethostname writes a NUL-terminated name into the buffer
	// we own, truncating if needed.
	let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len() - 1) };
	if rc != 0 {
		return "unknown".to_string();
	}
	buf[buf.len() - 1] = 0;
	let end = buf.iter().position(|&b| b == 0).unwrap_or(0);
	String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Login name of the invoking user.
pub fn login_name() -> String {
	if let Ok(user) = std::env::var("USER") {
		if !user.is_empty() {
			return user;
		}
	}
	owner_name(effective_uid()).unwrap_or_else(|| "nobody".to_string())
}

/// Look up the login name for a uid.  Returns None for unknown uids.
#[allow(unsafe_code)]
pub fn owner_name(uid: u32) -> Option<String> {
	let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
	let mut buf = [0u8; 1024];
	let mut result: *mut libc::passwd = std::ptr::null_mut();
	// SAFETY: getpwuid_r writes into the buffers we own and sets result
	// to either null or a pointer to pwd.
	let rc = unsafe {
		libc::getpwuid_r(
			uid,
			&mut pwd,
			buf.as_mut_ptr() as *mut libc::c_char,
			buf.len(),
			&mut result,
		)
	};
	if rc != 0 || result.is_null() {
		return None;
	}
	// SAFETY: on success pw_name points at a NUL-terminated string
	// inside buf.
	let name = unsafe { CStr::from_ptr(pwd.pw_name) };
	Some(name.to_string_lossy().into_owned())
}

/// Look up the group name for a gid.  Returns None for unknown gids.
#[allow(unsafe_code)]
pub fn group_name(gid: u32) -> Option<String> {
	let mut grp: libc::group = unsafe { std::mem::zeroed() };
	let mut buf = [0u8; 1024];
	let mut result: *mut libc::group = std::ptr::null_mut();
	// SAFETY: getgrgid_r writes into the buffers we own and sets result
	// to either null or a pointer to grp.
	let rc = unsafe {
		libc::getgrgid_r(
			gid,
			&mut grp,
			buf.as_mut_ptr() as *mut libc::c_char,
			buf.len(),
			&mut result,
		)
	};
	if rc != 0 || result.is_null() {
		return None;
	}
	// SAFETY: on success gr_name points at a NUL-terminated string
	// inside buf.
	let name = unsafe { CStr::from_ptr(grp.gr_name) };
	Some(name.to_string_lossy().into_owned())
}

/// Look up a uid by login name.
#[allow(unsafe_code)]
pub fn uid_for_name(name: &str) -> Option<u32> {
	let cname = std::ffi::CString::new(name).ok()?;
	let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
	let mut buf = [0u8; 1024];
	let mut result: *mut libc::passwd = std::ptr::null_mut();
	// SAFETY: same contract as getpwuid_r above.
	let rc = unsafe {
		libc::getpwnam_r(
			cname.as_ptr(),
			&mut pwd,
			buf.as_mut_ptr() as *mut libc::c_char,
			buf.len(),
			&mut result,
		)
	};
	if rc != 0 || result.is_null() {
		return None;
	}
	Some(pwd.pw_uid)
}

/// Look up a gid by group name.
#[allow(unsafe_code)]
pub fn gid_for_name(name: &str) -> Option<u32> {
	let cname = std::ffi::CString::new(name).ok()?;
	let mut grp: libc::group = unsafe { std::mem::zeroed() };
	let mut buf = [0u8; 1024];
	let mut result: *mut libc::group = std::ptr::null_mut();
	// SAFETY: same contract as getgrgid_r above.
	let rc = unsafe {
		libc::getgrnam_r(
			cname.as_ptr(),
			&mut grp,
			buf.as_mut_ptr() as *mut libc::c_char,
			buf.len(),
			&mut result,
		)
	};
	if rc != 0 || result.is_null() {
		return None;
	}
	Some(grp.gr_gid)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_pathcmp_slash_sorts_first() {
		// '/' must sort before any printable character.
		assert_eq!(pathcmp("a/b", "a.c"), Ordering::Less);
		assert_eq!(pathcmp("a", "a"), Ordering::Equal);
		assert_eq!(pathcmp("a/b", "a/b/c"), Ordering::Less);
		assert_eq!(pathcmp("b", "a/z"), Ordering::Greater);
	}

	#[test]
	fn test_commonpathlength() {
		assert_eq!(commonpathlength("a/b/c", "a/b/d"), 3);
		assert_eq!(commonpathlength("a/b", "a/b/c"), 3);
		assert_eq!(commonpathlength("abc", "abd"), 0);
		assert_eq!(commonpathlength("/x/y", "/x/z"), 2);
	}

	#[test]
	fn test_path_last() {
		assert_eq!(path_last("a/b/c"), "c");
		assert_eq!(path_last("c"), "c");
	}

	#[test]
	fn test_checkoutpath() {
		let prefix = Path::new("/prefix");
		assert_eq!(checkoutpath(prefix, "dir/file.c,v"), Some(PathBuf::from("/prefix/dir/file.c")));
		assert_eq!(checkoutpath(prefix, "/abs/file.c,v"), None);
		assert_eq!(checkoutpath(prefix, "dir/../file.c,v"), None);
		assert_eq!(checkoutpath(prefix, "dir/file.c"), Some(PathBuf::from("/prefix/dir/file.c")));
	}

	#[test]
	fn test_cvspath_attic() {
		let prefix = Path::new("/p");
		assert_eq!(cvspath(prefix, "d/f,v", false), PathBuf::from("/p/d/f,v"));
		assert_eq!(cvspath(prefix, "d/f,v", true), PathBuf::from("/p/d/Attic/f,v"));
		assert_eq!(cvspath(prefix, "f,v", true), PathBuf::from("/p/Attic/f,v"));
	}

	#[test]
	fn test_rcsdate_to_time() {
		assert_eq!(rcsdate_to_time("1970.01.01.00.00.00"), Some(0));
		assert_eq!(rcsdate_to_time("2012.01.01.00.00.00"), Some(1325376000));
		// Two-digit years follow the strptime %y convention.
		assert_eq!(rcsdate_to_time("99.12.31.23.59.59"), rcsdate_to_time("1999.12.31.23.59.59"));
		assert_eq!(rcsdate_to_time("garbage"), None);
	}

	#[test]
	fn test_rcsdate_to_cvsdate() {
		assert_eq!(
			rcsdate_to_cvsdate("2012.01.02.03.04.05").as_deref(),
			Some("2012/01/02 03:04:05")
		);
	}

	#[test]
	fn test_tempname_in_same_dir() {
		let t = tempname(Path::new("/some/dir/file"));
		assert!(t.starts_with("/some/dir"));
		assert!(t.file_name().unwrap().to_string_lossy().starts_with("#cvs.csup-"));
	}
}

// vim: ts=4
