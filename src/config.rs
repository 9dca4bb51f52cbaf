//! Configuration: the collection list and everything the session needs
//! to know about the server.
//!
//! Collections are declared in a TOML file.  Minimal example:
//!
//! ```toml
//! host = "cvsup.example.org"
//! base = "/var/db/rsup"
//!
//! [[collection]]
//! name = "src-all"
//! release = "cvs"
//! prefix = "/usr/src"
//! delete = true
//! compress = true
//! ```

use crate::error::ConfigError;
use crate::fattr;
use crate::rcs::keyword::KeywordTable;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

/// Collection options.
pub const CO_DELETE: u32 = 0x00000002;
pub const CO_COMPRESS: u32 = 0x00000040;
pub const CO_USERELSUFFIX: u32 = 0x00000080;
pub const CO_EXACTRCS: u32 = 0x00000100;
pub const CO_CHECKRCS: u32 = 0x00000200;
pub const CO_SKIP: u32 = 0x00000400;
pub const CO_CHECKOUTMODE: u32 = 0x00000800;
pub const CO_NORSYNC: u32 = 0x00001000;
pub const CO_SETMODE: u32 = 0x00010000;
pub const CO_NORCS: u32 = 0x00040000;
pub const CO_TRUSTSTATUSFILE: u32 = 0x00100000;

/// Options the server is allowed to set.
pub const CO_SERVMAYSET: u32 = CO_SKIP | CO_NORSYNC | CO_NORCS;
/// Options the server is allowed to clear.
pub const CO_SERVMAYCLEAR: u32 = CO_CHECKRCS;

pub const DEFAULT_PORT: u16 = 5999;
pub const DEFAULT_COLLDIR: &str = "sup";

/// One collection: a named subtree of the server's repository pinned to
/// a release, tag and date.
#[derive(Debug)]
pub struct Collection {
	pub name: String,
	pub release: String,
	pub tag: String,
	pub date: String,
	pub base: PathBuf,
	pub prefix: PathBuf,
	pub cvsroot: String,
	pub umask: u32,
	pub options: u32,
	pub keyword: KeywordTable,
	/// File name suffixes excluded from rsync detailing.
	pub norsync: Vec<String>,
	/// Server scan time, filled in by the detailer and read by the
	/// updater when it rewrites the status file.
	pub scantime: AtomicI64,
}

impl Collection {
	pub fn options(&self, opt: u32) -> bool {
		self.options & opt != 0
	}

	/// Fold in the option bits the server sent back during the
	/// collection exchange.
	pub fn fold_server_options(&mut self, opts: u32) {
		self.options = (self.options | (opts & CO_SERVMAYSET)) & !(!opts & CO_SERVMAYCLEAR);
	}

	/// Path of the persisted status file for this collection.
	pub fn status_path(&self, colldir: &str) -> PathBuf {
		let mut name = String::from("checkouts");
		if self.options(CO_USERELSUFFIX) {
			name.push_str(&format!(".{}:{}", self.release, self.tag));
		}
		self.base.join(colldir).join(&self.name).join(name)
	}

	/// True when rsync detailing is ruled out for this file name.
	pub fn norsync_excluded(&self, name: &str) -> bool {
		self.norsync.iter().any(|suffix| name.ends_with(suffix.as_str()))
	}

	pub fn set_scantime(&self, t: i64) {
		self.scantime.store(t, Ordering::SeqCst);
	}

	pub fn scantime(&self) -> i64 {
		self.scantime.load(Ordering::SeqCst)
	}
}

/// The whole client configuration for one run.
#[derive(Debug)]
pub struct Config {
	pub host: String,
	pub port: u16,
	pub base: PathBuf,
	pub colldir: String,
	pub colls: Vec<Collection>,
	/// Attribute support negotiated with the server.
	pub fasupport: fattr::Support,
}

/// Command line overrides applied on top of the configuration file.
#[derive(Debug, Default)]
pub struct Overrides {
	pub host: Option<String>,
	pub base: Option<PathBuf>,
	pub colldir: Option<String>,
	pub port: Option<u16>,
	/// Some(true) forces compression everywhere, Some(false) disables
	/// it everywhere.
	pub compress: Option<bool>,
	pub trust_status_file: bool,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
	host: String,
	port: Option<u16>,
	base: String,
	colldir: Option<String>,
	#[serde(default, rename = "collection")]
	collections: Vec<CollectionFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CollectionFile {
	name: String,
	release: Option<String>,
	tag: Option<String>,
	date: Option<String>,
	base: Option<String>,
	prefix: Option<String>,
	umask: Option<String>,
	#[serde(default)]
	delete: bool,
	#[serde(default)]
	compress: bool,
	#[serde(default)]
	use_rel_suffix: bool,
	#[serde(default)]
	exact_rcs: bool,
	#[serde(default)]
	check_rcs: bool,
	#[serde(default)]
	set_mode: bool,
	#[serde(default)]
	skip: bool,
	#[serde(default)]
	norsync: bool,
	#[serde(default)]
	norcs: bool,
	#[serde(default)]
	trust_status_file: bool,
	#[serde(default)]
	norsync_patterns: Vec<String>,
}

/// Load a configuration file and apply the command line overrides.
pub fn load(path: &Path, over: &Overrides) -> Result<Config, ConfigError> {
	let text = std::fs::read_to_string(path)
		.map_err(|e| ConfigError::Io { path: path.to_path_buf(), source: e })?;
	let file: ConfigFile = toml::from_str(&text)
		.map_err(|e| ConfigError::Parse { path: path.to_path_buf(), message: e.to_string() })?;

	let host = over.host.clone().unwrap_or(file.host);
	let port = over.port.or(file.port).unwrap_or(DEFAULT_PORT);
	let base = over.base.clone().unwrap_or_else(|| PathBuf::from(&file.base));
	let colldir = over
		.colldir
		.clone()
		.or(file.colldir)
		.unwrap_or_else(|| DEFAULT_COLLDIR.to_string());

	if file.collections.is_empty() {
		return Err(ConfigError::Invalid { message: "no collections declared".to_string() });
	}

	let mut colls = Vec::with_capacity(file.collections.len());
	for cf in file.collections {
		colls.push(build_collection(cf, &base, over)?);
	}

	Ok(Config { host, port, base, colldir, colls, fasupport: fattr::SUPPORTED })
}

fn build_collection(
	cf: CollectionFile,
	default_base: &Path,
	over: &Overrides,
) -> Result<Collection, ConfigError> {
	let base = cf.base.map(PathBuf::from).unwrap_or_else(|| default_base.to_path_buf());
	let prefix = cf.prefix.map(PathBuf::from).unwrap_or_else(|| base.clone());
	if !prefix.is_absolute() {
		return Err(ConfigError::Invalid {
			message: format!("collection {}: prefix must be absolute", cf.name),
		});
	}
	let umask = match cf.umask {
		Some(s) => u32::from_str_radix(&s, 8).map_err(|_| ConfigError::Invalid {
			message: format!("collection {}: bad umask \"{}\"", cf.name, s),
		})?,
		None => 0o022,
	};

	let mut options = CO_CHECKOUTMODE;
	let mut flag = |on: bool, bit: u32| {
		if on {
			options |= bit;
		}
	};
	flag(cf.delete, CO_DELETE);
	flag(cf.compress, CO_COMPRESS);
	flag(cf.use_rel_suffix, CO_USERELSUFFIX);
	flag(cf.exact_rcs, CO_EXACTRCS);
	flag(cf.check_rcs, CO_CHECKRCS);
	flag(cf.set_mode, CO_SETMODE);
	flag(cf.skip, CO_SKIP);
	flag(cf.norsync, CO_NORSYNC);
	flag(cf.norcs, CO_NORCS);
	flag(cf.trust_status_file || over.trust_status_file, CO_TRUSTSTATUSFILE);
	match over.compress {
		Some(true) => options |= CO_COMPRESS,
		Some(false) => options &= !CO_COMPRESS,
		None => {}
	}

	Ok(Collection {
		name: cf.name,
		release: cf.release.unwrap_or_else(|| "cvs".to_string()),
		tag: cf.tag.unwrap_or_else(|| ".".to_string()),
		date: cf.date.unwrap_or_else(|| ".".to_string()),
		base,
		prefix,
		cvsroot: String::new(),
		umask,
		options,
		keyword: KeywordTable::new(),
		norsync: cf.norsync_patterns,
		scantime: AtomicI64::new(-1),
	})
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample(toml: &str) -> Result<Config, ConfigError> {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("rsup.toml");
		std::fs::write(&path, toml).unwrap();
		load(&path, &Overrides::default())
	}

	#[test]
	fn test_load_minimal() {
		let cfg = sample(
			"host = \"h\"\nbase = \"/b\"\n[[collection]]\nname = \"src\"\nprefix = \"/usr/src\"\n",
		)
		.unwrap();
		assert_eq!(cfg.host, "h");
		assert_eq!(cfg.port, DEFAULT_PORT);
		assert_eq!(cfg.colldir, "sup");
		let coll = &cfg.colls[0];
		assert_eq!(coll.tag, ".");
		assert_eq!(coll.date, ".");
		assert!(coll.options(CO_CHECKOUTMODE));
		assert!(!coll.options(CO_DELETE));
	}

	#[test]
	fn test_relative_prefix_rejected() {
		let err = sample("host = \"h\"\nbase = \"/b\"\n[[collection]]\nname = \"src\"\nprefix = \"rel\"\n");
		assert!(err.is_err());
	}

	#[test]
	fn test_status_path_with_rel_suffix() {
		let cfg = sample(
			"host = \"h\"\nbase = \"/b\"\n[[collection]]\nname = \"src\"\nprefix = \"/p\"\nuse_rel_suffix = true\nrelease = \"cvs\"\ntag = \"RELENG_5\"\n",
		)
		.unwrap();
		let coll = &cfg.colls[0];
		assert_eq!(
			coll.status_path("sup"),
			PathBuf::from("/b/sup/src/checkouts.cvs:RELENG_5")
		);
	}

	#[test]
	fn test_fold_server_options() {
		let cfg = sample(
			"host = \"h\"\nbase = \"/b\"\n[[collection]]\nname = \"src\"\nprefix = \"/p\"\ncheck_rcs = true\n",
		)
		.unwrap();
		let mut coll = cfg.colls.into_iter().next().unwrap();
		// Server sets NORSYNC and does not confirm CHECKRCS.
		coll.fold_server_options(CO_NORSYNC);
		assert!(coll.options(CO_NORSYNC));
		assert!(!coll.options(CO_CHECKRCS));
	}

	#[test]
	fn test_norsync_excluded() {
		let cfg = sample(
			"host = \"h\"\nbase = \"/b\"\n[[collection]]\nname = \"src\"\nprefix = \"/p\"\nnorsync_patterns = [\".gz\"]\n",
		)
		.unwrap();
		assert!(cfg.colls[0].norsync_excluded("ports/distfiles/foo.gz"));
		assert!(!cfg.colls[0].norsync_excluded("src/main.c,v"));
	}
}

// vim: ts=4
