use nix::sys::resource::{getrlimit, Resource};
use std::io;

/// Soft `RLIMIT_NOFILE` of this process, saturated to `usize`.
pub(crate) fn fd_soft_limit() -> io::Result<usize> {
    let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(io::Error::from)?;
    Ok(usize::try_from(soft).unwrap_or(usize::MAX))
}

/// Warns when `desired_fds` descriptors would not fit under the soft limit.
/// Accepts past the limit fail with EMFILE and are retried, so the server
/// still starts.
pub(crate) fn warn_if_fd_limit_below(desired_fds: usize) {
    let limit = match fd_soft_limit() {
        Ok(limit) => limit,
        Err(e) => {
            tracing::warn!(error = %e, "cannot read the open file limit");
            return;
        }
    };

    if desired_fds > limit {
        tracing::warn!(
            desired_fds,
            limit,
            "open file limit is below the connection capacity; raise it with `ulimit -n`"
        );
    }
}
