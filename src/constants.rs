use std::time::Duration;

pub const HEADER_REPO_COMMIT: &str = "x-repo-commit";

pub const DEFAULT_LINK_EXPIRES: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_REDIRECT_LIMIT: usize = 10;

/// Upper bound on a single chunk pulled from a spill buffer or file stream.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;
