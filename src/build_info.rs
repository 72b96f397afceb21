/// Build-time git commit SHA stamped by build.rs when available.
pub fn git_sha() -> Option<&'static str> {
    option_env!("MUSTER_BUILD_GIT_SHA")
}

/// `--version` text: crate version, followed by the commit when known.
pub const LONG_VERSION: &str = env!("MUSTER_LONG_VERSION");
