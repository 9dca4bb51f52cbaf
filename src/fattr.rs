//! File attribute handling.
//!
//! A `Fattr` is a typed bag of file metadata with a mask selecting which
//! fields are valid.  Attributes travel in a compact text encoding made
//! of `len#value` pieces, are compared field-wise over the mask both
//! sides support, and are applied to the filesystem right before a
//! rename so installs commit files already in their final shape.

use crate::util;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// File types, numbered as they appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
	Unknown = 0,
	File = 1,
	Directory = 2,
	CharDev = 3,
	BlockDev = 4,
	Symlink = 5,
}

pub const FT_NUMBER: usize = 6;

impl FileType {
	pub fn code(self) -> u32 {
		self as u32
	}

	/// Out-of-range codes decode as Unknown.
	pub fn from_code(code: i64) -> FileType {
		match code {
			1 => FileType::File,
			2 => FileType::Directory,
			3 => FileType::CharDev,
			4 => FileType::BlockDev,
			5 => FileType::Symlink,
			_ => FileType::Unknown,
		}
	}
}

pub const FA_FILETYPE: u32 = 0x0001;
pub const FA_MODTIME: u32 = 0x0002;
pub const FA_SIZE: u32 = 0x0004;
pub const FA_LINKTARGET: u32 = 0x0008;
pub const FA_RDEV: u32 = 0x0010;
pub const FA_OWNER: u32 = 0x0020;
pub const FA_GROUP: u32 = 0x0040;
pub const FA_MODE: u32 = 0x0080;
pub const FA_FLAGS: u32 = 0x0100;
pub const FA_LINKCOUNT: u32 = 0x0200;
pub const FA_DEV: u32 = 0x0400;
pub const FA_INODE: u32 = 0x0800;

pub const FA_MASK: u32 = 0x0fff;

/// Attributes not persisted in the status file when in checkout mode.
pub const FA_COIGNORE: u32 = FA_MASK & !(FA_FILETYPE | FA_MODTIME | FA_SIZE | FA_MODE);

const FA_PERMMASK: u32 = 0o777;
const FA_SETIDMASK: u32 = 0o7000;

#[cfg(target_os = "freebsd")]
const FA_FLAGS_IF_SUPPORTED: u32 = FA_FLAGS;
#[cfg(not(target_os = "freebsd"))]
const FA_FLAGS_IF_SUPPORTED: u32 = 0;

/// Per-filetype attribute support, possibly narrowed by negotiation
/// with the server.
pub type Support = [u32; FT_NUMBER];

/// The attributes this client supports for each file type.
pub const SUPPORTED: Support = [
	/* Unknown */ 0,
	/* File */
	FA_FILETYPE
		| FA_MODTIME | FA_SIZE
		| FA_OWNER | FA_GROUP
		| FA_MODE | FA_FLAGS_IF_SUPPORTED
		| FA_LINKCOUNT | FA_INODE
		| FA_DEV,
	/* Directory */
	FA_FILETYPE | FA_OWNER | FA_GROUP | FA_MODE | FA_FLAGS_IF_SUPPORTED,
	/* CharDev */
	FA_FILETYPE
		| FA_RDEV | FA_OWNER
		| FA_GROUP | FA_MODE
		| FA_FLAGS_IF_SUPPORTED
		| FA_LINKCOUNT | FA_DEV
		| FA_INODE,
	/* BlockDev */
	FA_FILETYPE
		| FA_RDEV | FA_OWNER
		| FA_GROUP | FA_MODE
		| FA_FLAGS_IF_SUPPORTED
		| FA_LINKCOUNT | FA_DEV
		| FA_INODE,
	/* Symlink */ FA_FILETYPE | FA_LINKTARGET,
];

pub fn supported(ftype: FileType) -> u32 {
	SUPPORTED[ftype as usize]
}

/// A bag of file metadata.  Only the fields selected by `mask` are
/// meaningful.
#[derive(Clone, Debug)]
pub struct Fattr {
	mask: u32,
	ftype: FileType,
	modtime: i64,
	size: u64,
	linktarget: String,
	rdev: u64,
	uid: u32,
	gid: u32,
	mode: u32,
	flags: u32,
	linkcount: u64,
	dev: u64,
	inode: u64,
}

impl Fattr {
	/// An empty attribute of the given type.  The link count defaults
	/// to 1 when the type supports it.
	pub fn new(ftype: FileType) -> Fattr {
		let mut fa = Fattr {
			mask: 0,
			ftype,
			modtime: 0,
			size: 0,
			linktarget: String::new(),
			rdev: 0,
			uid: 0,
			gid: 0,
			mode: 0,
			flags: 0,
			linkcount: 0,
			dev: 0,
			inode: 0,
		};
		if ftype != FileType::Unknown {
			fa.mask |= FA_FILETYPE;
		}
		if supported(ftype) & FA_LINKCOUNT != 0 {
			fa.mask |= FA_LINKCOUNT;
			fa.linkcount = 1;
		}
		fa
	}

	/// The sentinel attribute sent when the client wants the server to
	/// resend a file from scratch.  It compares unequal even to itself.
	pub fn bogus() -> Fattr {
		let mut fa = Fattr::new(FileType::Unknown);
		fa.mask = FA_MODTIME | FA_SIZE | FA_MODE;
		fa
	}

	/// Attributes from a stat result.  The link target of a symlink is
	/// not known here; `from_path` fills it in.
	pub fn from_metadata(meta: &fs::Metadata) -> Fattr {
		let ft = meta.file_type();
		let ftype = if ft.is_file() {
			FileType::File
		} else if ft.is_dir() {
			FileType::Directory
		} else if ft.is_symlink() {
			FileType::Symlink
		} else {
			use std::os::unix::fs::FileTypeExt;
			if ft.is_char_device() {
				FileType::CharDev
			} else if ft.is_block_device() {
				FileType::BlockDev
			} else {
				FileType::Unknown
			}
		};
		let mut fa = Fattr::new(ftype);
		fa.mask = FA_FILETYPE | (supported(ftype) & !FA_LINKTARGET);
		if fa.mask & FA_MODTIME != 0 {
			fa.modtime = meta.mtime();
		}
		if fa.mask & FA_SIZE != 0 {
			fa.size = meta.size();
		}
		if fa.mask & FA_RDEV != 0 {
			fa.rdev = meta.rdev();
		}
		if fa.mask & FA_OWNER != 0 {
			fa.uid = meta.uid();
		}
		if fa.mask & FA_GROUP != 0 {
			fa.gid = meta.gid();
		}
		if fa.mask & FA_MODE != 0 {
			fa.mode = meta.mode() & (FA_SETIDMASK | FA_PERMMASK);
		}
		if fa.mask & FA_LINKCOUNT != 0 {
			fa.linkcount = meta.nlink();
		}
		if fa.mask & FA_DEV != 0 {
			fa.dev = meta.dev();
		}
		if fa.mask & FA_INODE != 0 {
			fa.inode = meta.ino();
		}
		fa
	}

	/// Attributes of the file at `path`; `nofollow` uses lstat
	/// semantics.  Returns None when the file cannot be statted.
	pub fn from_path(path: &Path, nofollow: bool) -> Option<Fattr> {
		let meta =
			if nofollow { fs::symlink_metadata(path).ok()? } else { fs::metadata(path).ok()? };
		let mut fa = Fattr::from_metadata(&meta);
		if fa.ftype == FileType::Symlink {
			if let Ok(target) = fs::read_link(path) {
				fa.linktarget = target.to_string_lossy().into_owned();
				fa.mask |= FA_LINKTARGET;
			}
		}
		Some(fa)
	}

	pub fn ftype(&self) -> FileType {
		self.ftype
	}

	pub fn mask(&self) -> u32 {
		self.mask
	}

	pub fn modtime(&self) -> Option<i64> {
		if self.mask & FA_MODTIME != 0 {
			Some(self.modtime)
		} else {
			None
		}
	}

	pub fn size(&self) -> Option<u64> {
		if self.mask & FA_SIZE != 0 {
			Some(self.size)
		} else {
			None
		}
	}

	pub fn linkcount(&self) -> Option<u64> {
		if self.mask & FA_LINKCOUNT != 0 {
			Some(self.linkcount)
		} else {
			None
		}
	}

	pub fn set_modtime(&mut self, modtime: i64) {
		self.modtime = modtime;
		self.mask |= FA_MODTIME;
	}

	/// Decode the text form.  Returns None on any malformation.
	pub fn decode(attr: &str) -> Option<Fattr> {
		let mut fa = Fattr::new(FileType::Unknown);
		let mut cur = attr;

		let mask = scan_int(&mut cur, 16)?;
		if mask < 0 || (mask as u32) & !FA_MASK != 0 {
			return None;
		}
		fa.mask = mask as u32;

		if fa.mask & FA_FILETYPE != 0 {
			fa.ftype = FileType::from_code(scan_int(&mut cur, 10)?);
		} else {
			// The filetype attribute is always valid.
			fa.mask |= FA_FILETYPE;
			fa.ftype = FileType::Unknown;
		}
		if fa.mask & FA_MODTIME != 0 {
			fa.modtime = scan_int(&mut cur, 10)?;
		}
		if fa.mask & FA_SIZE != 0 {
			fa.size = scan_int(&mut cur, 10)? as u64;
		}
		if fa.mask & FA_LINKTARGET != 0 {
			fa.linktarget = scan_str(&mut cur)?;
		}
		if fa.mask & FA_RDEV != 0 {
			fa.rdev = scan_int(&mut cur, 16)? as u64;
		}
		if fa.mask & FA_OWNER != 0 {
			let name = scan_str(&mut cur)?;
			match util::uid_for_name(&name) {
				Some(uid) => fa.uid = uid,
				None => fa.mask &= !FA_OWNER,
			}
		}
		if fa.mask & FA_GROUP != 0 {
			let name = scan_str(&mut cur)?;
			match util::gid_for_name(&name) {
				Some(gid) => fa.gid = gid,
				None => fa.mask &= !FA_GROUP,
			}
		}
		if fa.mask & FA_MODE != 0 {
			let mode = scan_int(&mut cur, 8)? as u32;
			fa.mode = mode & fa.modemask();
		}
		if fa.mask & FA_FLAGS != 0 {
			fa.flags = scan_int(&mut cur, 16)? as u32;
		}
		if fa.mask & FA_LINKCOUNT != 0 {
			fa.linkcount = scan_int(&mut cur, 10)? as u64;
		} else if supported(fa.ftype) & FA_LINKCOUNT != 0 {
			// A missing but supported link count is taken to be 1.
			fa.mask |= FA_LINKCOUNT;
			fa.linkcount = 1;
		}
		if fa.mask & FA_DEV != 0 {
			fa.dev = scan_int(&mut cur, 16)? as u64;
		}
		if fa.mask & FA_INODE != 0 {
			fa.inode = scan_int(&mut cur, 10)? as u64;
		}
		if !cur.is_empty() {
			return None;
		}
		Some(fa)
	}

	/// Encode to the text form.  When a support table is given, only
	/// the attributes both sides support are emitted; owner and group
	/// names that cannot be resolved are dropped, as is a link count of
	/// one.
	pub fn encode(&self, support: Option<&Support>) -> String {
		let mut mask = match support {
			Some(sup) => self.mask & sup[self.ftype as usize],
			None => self.mask,
		};
		let mut owner = String::new();
		let mut group = String::new();
		if mask & FA_OWNER != 0 {
			match util::owner_name(self.uid) {
				Some(name) => owner = name,
				None => mask &= !FA_OWNER,
			}
		}
		if mask & FA_GROUP != 0 {
			match util::group_name(self.gid) {
				Some(name) => group = name,
				None => mask &= !FA_GROUP,
			}
		}
		if mask & FA_LINKCOUNT != 0 && self.linkcount == 1 {
			mask &= !FA_LINKCOUNT;
		}

		let mut out = String::new();
		push_piece(&mut out, &format!("{:x}", mask));
		if mask & FA_FILETYPE != 0 {
			push_piece(&mut out, &format!("{}", self.ftype.code()));
		}
		if mask & FA_MODTIME != 0 {
			push_piece(&mut out, &format!("{}", self.modtime));
		}
		if mask & FA_SIZE != 0 {
			push_piece(&mut out, &format!("{}", self.size));
		}
		if mask & FA_LINKTARGET != 0 {
			push_piece(&mut out, &self.linktarget);
		}
		if mask & FA_RDEV != 0 {
			push_piece(&mut out, &format!("{:x}", self.rdev));
		}
		if mask & FA_OWNER != 0 {
			push_piece(&mut out, &owner);
		}
		if mask & FA_GROUP != 0 {
			push_piece(&mut out, &group);
		}
		if mask & FA_MODE != 0 {
			let modemask = if mask & FA_OWNER != 0 && mask & FA_GROUP != 0 {
				FA_SETIDMASK | FA_PERMMASK
			} else {
				FA_PERMMASK
			};
			push_piece(&mut out, &format!("{:o}", self.mode & modemask));
		}
		if mask & FA_FLAGS != 0 {
			push_piece(&mut out, &format!("{:x}", self.flags));
		}
		if mask & FA_LINKCOUNT != 0 {
			push_piece(&mut out, &format!("{}", self.linkcount));
		}
		if mask & FA_DEV != 0 {
			push_piece(&mut out, &format!("{:x}", self.dev));
		}
		if mask & FA_INODE != 0 {
			push_piece(&mut out, &format!("{}", self.inode));
		}
		out
	}

	/// Remove the attributes in `mask` from this record.
	pub fn maskout(&mut self, mask: u32) {
		if mask & FA_LINKTARGET != 0 && self.mask & FA_LINKTARGET != 0 {
			self.linktarget.clear();
		}
		self.mask &= !mask;
	}

	/// Take attributes from `from` that are not already present here.
	pub fn merge(&mut self, from: &Fattr) {
		self.override_with(from, from.mask & !self.mask);
	}

	/// Force-overwrite the attributes in `mask` with values from
	/// `from`.
	pub fn override_with(&mut self, from: &Fattr, mask: u32) {
		let mask = mask & from.mask;
		self.mask |= mask;
		if mask & FA_FILETYPE != 0 {
			self.ftype = from.ftype;
		}
		if mask & FA_MODTIME != 0 {
			self.modtime = from.modtime;
		}
		if mask & FA_SIZE != 0 {
			self.size = from.size;
		}
		if mask & FA_LINKTARGET != 0 {
			self.linktarget = from.linktarget.clone();
		}
		if mask & FA_RDEV != 0 {
			self.rdev = from.rdev;
		}
		if mask & FA_OWNER != 0 {
			self.uid = from.uid;
		}
		if mask & FA_GROUP != 0 {
			self.gid = from.gid;
		}
		if mask & FA_MODE != 0 {
			self.mode = from.mode;
		}
		if mask & FA_FLAGS != 0 {
			self.flags = from.flags;
		}
		if mask & FA_LINKCOUNT != 0 {
			self.linkcount = from.linkcount;
		}
		if mask & FA_DEV != 0 {
			self.dev = from.dev;
		}
		if mask & FA_INODE != 0 {
			self.inode = from.inode;
		}
	}

	/// Attributes for a checked-out working file derived from the RCS
	/// file attributes: executable RCS files yield 0777, others 0666,
	/// both minus the collection umask.
	pub fn for_checkout(rcsattr: &Fattr, umask: u32) -> Fattr {
		let mut fa = Fattr::new(FileType::File);
		if rcsattr.mask & FA_MODE != 0 {
			fa.mode = if rcsattr.mode & 0o111 != 0 { 0o777 } else { 0o666 };
			fa.mode &= !umask;
			fa.mask |= FA_MODE;
		}
		fa
	}

	/// Merge in the process defaults for fields still absent: effective
	/// owner and group, and a mode of 0666 (0777 for directories).
	pub fn merge_default(&mut self) {
		let mut def = Fattr::new(self.ftype);
		def.uid = util::effective_uid();
		def.gid = util::effective_gid();
		def.mode = if self.ftype == FileType::Directory { 0o777 } else { 0o666 };
		def.mask |= FA_OWNER | FA_GROUP | FA_MODE;
		self.merge(&def);
	}

	/// Apply a umask to the mode, if one is present.
	pub fn apply_umask(&mut self, umask: u32) {
		if self.mask & FA_MODE != 0 {
			self.mode &= !umask;
		}
	}

	fn modemask(&self) -> u32 {
		if self.mask & FA_OWNER != 0 && self.mask & FA_GROUP != 0 {
			FA_SETIDMASK | FA_PERMMASK
		} else {
			FA_PERMMASK
		}
	}

	/// Compare the attributes valid on both sides.  A record of unknown
	/// type is unequal to everything, including itself.
	pub fn equal(&self, other: &Fattr) -> bool {
		if self.ftype == FileType::Unknown || other.ftype == FileType::Unknown {
			return false;
		}
		let mask = self.mask & other.mask;
		if mask & FA_MODTIME != 0 && self.modtime != other.modtime {
			return false;
		}
		if mask & FA_SIZE != 0 && self.size != other.size {
			return false;
		}
		if mask & FA_LINKTARGET != 0 && self.linktarget != other.linktarget {
			return false;
		}
		if mask & FA_RDEV != 0 && self.rdev != other.rdev {
			return false;
		}
		if mask & FA_OWNER != 0 && self.uid != other.uid {
			return false;
		}
		if mask & FA_GROUP != 0 && self.gid != other.gid {
			return false;
		}
		if mask & FA_MODE != 0 && self.mode != other.mode {
			return false;
		}
		if mask & FA_FLAGS != 0 && self.flags != other.flags {
			return false;
		}
		if mask & FA_LINKCOUNT != 0 && self.linkcount != other.linkcount {
			return false;
		}
		if mask & FA_DEV != 0 && self.dev != other.dev {
			return false;
		}
		if mask & FA_INODE != 0 && self.inode != other.inode {
			return false;
		}
		true
	}

	/// Apply these attributes to the filesystem.  With `from` given,
	/// the attributes are set on `from` and it is then renamed onto
	/// `to`, committing a file already in final shape; without it the
	/// target is updated in place.  Returns Ok(false) when nothing
	/// needed changing, Ok(true) when an update was applied.
	pub fn install(&self, from: Option<&Path>, to: &Path) -> io::Result<bool> {
		let mask = self.mask & supported(self.ftype);
		let modemask = if mask & FA_OWNER != 0 && mask & FA_GROUP != 0 {
			FA_SETIDMASK | FA_PERMMASK
		} else {
			FA_PERMMASK
		};

		let inplace = from.is_none();
		let workpath = from.unwrap_or(to);
		let old = Fattr::from_path(to, true);
		if inplace {
			match &old {
				Some(old) if self.equal(old) => return Ok(false),
				Some(_) => {}
				None => return Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
			}
		}

		if let Some(old) = &old {
			// Clear flags that would prevent further changes.
			#[cfg(target_os = "freebsd")]
			if old.mask & FA_FLAGS != 0 && old.flags > 0 {
				clear_flags(to)?;
			}

			// A type flip between directory and non-directory means the
			// target has to go before the rename can succeed.
			if !inplace
				&& (self.ftype == FileType::Directory) != (old.ftype == FileType::Directory)
			{
				if old.ftype == FileType::Directory {
					fs::remove_dir(to)?;
				} else {
					fs::remove_file(to)?;
				}
			}
		}

		if mask & FA_MODTIME != 0 {
			set_times(workpath, self.modtime)?;
		}
		if mask & (FA_OWNER | FA_GROUP) != 0 {
			let uid = if mask & FA_OWNER != 0 { self.uid } else { u32::MAX };
			let gid = if mask & FA_GROUP != 0 { self.gid } else { u32::MAX };
			chown(workpath, uid, gid)?;
		}
		if mask & FA_MODE != 0 {
			let mut newmode = self.mode & modemask;
			if let Some(old) = &old {
				if old.mask & FA_MODE != 0 {
					newmode |= old.mode & !modemask;
					newmode &= FA_SETIDMASK | FA_PERMMASK;
				}
			}
			fs::set_permissions(workpath, fs::Permissions::from_mode(newmode))?;
		}

		if let Some(from) = from {
			fs::rename(from, to)?;
		}

		#[cfg(target_os = "freebsd")]
		if mask & FA_FLAGS != 0 {
			set_flags(to, self.flags)?;
		}
		Ok(true)
	}

	/// Remove the file or directory at `path`, whichever it is.
	pub fn delete(path: &Path) -> io::Result<()> {
		let meta = fs::symlink_metadata(path)?;
		if meta.is_dir() {
			fs::remove_dir(path)
		} else {
			fs::remove_file(path)
		}
	}
}

impl fmt::Display for Fattr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.encode(None))
	}
}

fn push_piece(out: &mut String, value: &str) {
	out.push_str(&format!("{}#{}", value.len(), value));
}

/// Eat one `len#value` piece and parse the value as an integer in the
/// given radix.
fn scan_int(cur: &mut &str, radix: u32) -> Option<i64> {
	let piece = scan_str(cur)?;
	let (neg, digits) = match piece.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, piece.as_str()),
	};
	let val = i64::from_str_radix(digits, radix).ok()?;
	Some(if neg { -val } else { val })
}

/// Eat one `len#value` piece and return the value verbatim.
fn scan_str(cur: &mut &str) -> Option<String> {
	let hash = cur.find('#')?;
	let len: usize = cur[..hash].parse().ok()?;
	let rest = &cur[hash + 1..];
	if rest.len() < len || !rest.is_char_boundary(len) {
		return None;
	}
	let val = rest[..len].to_string();
	*cur = &rest[len..];
	Some(val)
}

#[allow(unsafe_code)]
fn set_times(path: &Path, modtime: i64) -> io::Result<()> {
	use std::os::unix::ffi::OsStrExt;
	let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
	let now = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_secs() as libc::time_t)
		.unwrap_or(0);
	let times = [
		libc::timeval { tv_sec: now, tv_usec: 0 },
		libc::timeval { tv_sec: modtime as libc::time_t, tv_usec: 0 },
	];
	// SAFETY: cpath is NUL-terminated and times points at two valid
	// timevals.
	let rc = unsafe { libc::utimes(cpath.as_ptr(), times.as_ptr()) };
	if rc != 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}

#[allow(unsafe_code)]
fn chown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
	use std::os::unix::ffi::OsStrExt;
	let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
	// SAFETY: cpath is NUL-terminated; uid/gid of u32::MAX mean "leave
	// unchanged" per chown(2).
	let rc = unsafe { libc::chown(cpath.as_ptr(), uid, gid) };
	if rc != 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}

#[cfg(target_os = "freebsd")]
#[allow(unsafe_code)]
fn clear_flags(path: &Path) -> io::Result<()> {
	set_flags(path, 0)
}

#[cfg(target_os = "freebsd")]
#[allow(unsafe_code)]
fn set_flags(path: &Path, flags: u32) -> io::Result<()> {
	use std::os::unix::ffi::OsStrExt;
	let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
	// SAFETY: cpath is NUL-terminated.
	let rc = unsafe { libc::chflags(cpath.as_ptr(), flags as libc::c_ulong) };
	if rc != 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	fn file_attr(modtime: i64, size: u64, mode: u32) -> Fattr {
		let mut fa = Fattr::new(FileType::File);
		fa.modtime = modtime;
		fa.size = size;
		fa.mode = mode;
		fa.mask |= FA_MODTIME | FA_SIZE | FA_MODE;
		fa
	}

	#[test]
	fn test_encode_decode_roundtrip() {
		let fa = file_attr(1325376000, 42, 0o644);
		let enc = fa.encode(None);
		let dec = Fattr::decode(&enc).unwrap();
		assert!(fa.equal(&dec));
		assert_eq!(dec.modtime(), Some(1325376000));
		assert_eq!(dec.size(), Some(42));
	}

	#[test]
	fn test_encode_format() {
		let fa = file_attr(100, 5, 0o644);
		// mask 0x287 = filetype|modtime|size|mode|linkcount, linkcount
		// of one is culled leaving 0x87.
		assert_eq!(fa.encode(None), "2#871#13#1001#53#644");
	}

	#[test]
	fn test_bogus_unequal_to_itself() {
		let bogus = Fattr::bogus();
		assert!(!bogus.equal(&bogus));
		assert!(!bogus.equal(&file_attr(0, 0, 0)));
	}

	#[test]
	fn test_decode_rejects_garbage() {
		assert!(Fattr::decode("").is_none());
		assert!(Fattr::decode("zz#12").is_none());
		assert!(Fattr::decode("4#ffff").is_none());
		// Trailing bytes after the last piece.
		let enc = file_attr(1, 2, 0o600).encode(None) + "x";
		assert!(Fattr::decode(&enc).is_none());
	}

	#[test]
	fn test_merge_takes_only_missing() {
		let mut fa = file_attr(10, 20, 0o600);
		let mut other = file_attr(99, 98, 0o777);
		other.mask |= FA_INODE;
		other.inode = 7;
		fa.merge(&other);
		assert_eq!(fa.modtime(), Some(10));
		assert_eq!(fa.size(), Some(20));
		assert_eq!(fa.inode, 7);
		assert!(fa.mask & FA_INODE != 0);
	}

	#[test]
	fn test_override_forces_fields() {
		let mut fa = file_attr(10, 20, 0o600);
		let other = file_attr(99, 98, 0o777);
		fa.override_with(&other, FA_MODTIME);
		assert_eq!(fa.modtime(), Some(99));
		assert_eq!(fa.size(), Some(20));
	}

	#[test]
	fn test_for_checkout_modes() {
		let mut rcs = Fattr::new(FileType::File);
		rcs.mode = 0o755;
		rcs.mask |= FA_MODE;
		let co = Fattr::for_checkout(&rcs, 0o022);
		assert_eq!(co.mode, 0o755);
		rcs.mode = 0o644;
		let co = Fattr::for_checkout(&rcs, 0o022);
		assert_eq!(co.mode, 0o644);
	}

	#[test]
	fn test_maskout_coignore() {
		let mut fa = file_attr(10, 20, 0o600);
		fa.mask |= FA_DEV | FA_INODE;
		fa.maskout(FA_COIGNORE);
		assert_eq!(fa.mask & (FA_DEV | FA_INODE), 0);
		assert!(fa.mask & FA_MODTIME != 0);
	}

	#[test]
	fn test_from_path_regular_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"hello").unwrap();
		let fa = Fattr::from_path(&path, true).unwrap();
		assert_eq!(fa.ftype(), FileType::File);
		assert_eq!(fa.size(), Some(5));
	}

	#[test]
	fn test_install_applies_mode_and_modtime() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"hello").unwrap();
		let mut fa = Fattr::from_path(&path, true).unwrap();
		fa.set_modtime(1000000);
		fa.mode = 0o640;
		fa.mask |= FA_MODE;
		assert!(fa.install(None, &path).unwrap());
		let after = Fattr::from_path(&path, true).unwrap();
		assert_eq!(after.modtime(), Some(1000000));
		assert_eq!(after.mode & 0o777, 0o640);
		// A second install with identical attributes is a no-op.
		assert!(!fa.install(None, &path).unwrap());
	}

	#[test]
	fn test_install_renames_from_temp() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("t");
		let temp = dir.path().join("#cvs.csup-1.0");
		std::fs::write(&temp, b"data").unwrap();
		let mut fa = Fattr::new(FileType::File);
		fa.mode = 0o600;
		fa.mask |= FA_MODE;
		fa.set_modtime(123456);
		assert!(fa.install(Some(&temp), &target).unwrap());
		assert!(!temp.exists());
		let after = Fattr::from_path(&target, true).unwrap();
		assert_eq!(after.modtime(), Some(123456));
	}
}

// vim: ts=4
