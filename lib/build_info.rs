//! Build identity reported by `--version`, the bootstrap log event and the `build_info` metric.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("RIDER_SYNC_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("RIDER_SYNC_GIT_COMMIT_HASH")
);

const SHORT_HASH_LEN: usize = 12;

/// Returns the first twelve characters of the commit hash, or `"unknown"` as-is.
pub fn short_commit_hash() -> &'static str {
    if GIT_COMMIT_HASH == "unknown" {
        return GIT_COMMIT_HASH;
    }
    &GIT_COMMIT_HASH[..SHORT_HASH_LEN.min(GIT_COMMIT_HASH.len())]
}
