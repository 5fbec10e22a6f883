//! Extended build version information (§4.12). There's no HTML surface in
//! this crate, so only the `Display` rendering is kept.

/// Full information about the current build.
pub struct Version {
    /// Version of the package, from `Cargo.toml`.
    pkg_version: &'static str,

    /// Short hash of the commit pointed to by `HEAD`.
    hash: &'static str,

    /// Full hash of the commit pointed to by `HEAD`.
    full_hash: &'static str,

    /// Local date of the build.
    date: &'static str,

    /// `" dirty"` if the repository had uncommitted changes at build time, else `""`.
    dirty: &'static str,
}

impl Version {
    /// Package version string (e.g. `"0.1.0"`).
    pub fn pkg_version(&self) -> &'static str {
        self.pkg_version
    }

    /// Short commit hash.
    pub fn hash(&self) -> &'static str {
        self.hash
    }

    /// Full commit hash, useful for linking to the exact build.
    pub fn full_hash(&self) -> &'static str {
        self.full_hash
    }

    /// Whether the working tree had uncommitted changes at build time.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }
}

impl Default for Version {
    /// Construct full version information from constants embedded by `build.rs`.
    fn default() -> Self {
        Self {
            pkg_version: env!("CARGO_PKG_VERSION"),
            hash: env!("GIT_STATUS_HASH"),
            full_hash: env!("GIT_STATUS_FULL_HASH"),
            date: build_time::build_time_local!("%Y-%m-%d %H:%M"),
            dirty: {
                let dirty = env!("GIT_STATUS_DIRTY");
                if dirty == "dirty" {
                    " dirty"
                } else {
                    ""
                }
            },
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { pkg_version, hash, date, dirty, .. } = self;
        write!(f, "{pkg_version} ({hash} {date}{dirty})")
    }
}
