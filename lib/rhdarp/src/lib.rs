use std::path::Path;
use fnv::{FnvHashMap, FnvHashSet};

pub mod rh;
pub mod data;
pub mod error;
mod uid;
pub use uid::{IntUid, UidGen};
pub use error::DarpError;

pub type Map<K, V> = FnvHashMap<K, V>;
pub type Set<T> = FnvHashSet<T>;

/// Tolerance for comparing times and reading binary values off a solution.
pub const EPS: f64 = 1e-7;


mod logging_setup {
    use super::*;
    use tracing_subscriber::{EnvFilter, fmt, registry, prelude::*};
    use tracing_appender::{non_blocking, non_blocking::WorkerGuard};
    use std::fs::OpenOptions;
    use anyhow::Context;

    fn build_and_set_global_subscriber<P>(logfile: Option<P>, is_test : bool) -> anyhow::Result<Option<WorkerGuard>> where
        P : AsRef<Path>
    {
        let stderr_log = fmt::layer().with_writer(std::io::stderr);
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let r = registry().with(stderr_log).with(env_filter);

        let flush_guard = match logfile {
            Some(p) => {
                let p = p.as_ref();
                let logfile = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(p)
                    .with_context(|| format!("unable to open log file {:?}", p))?;
                let (writer, _guard) = non_blocking::NonBlockingBuilder::default()
                    .lossy(false)
                    .finish(logfile);
                let json = fmt::layer()
                    .json()
                    .with_span_list(true)
                    .with_current_span(false)
                    .with_writer(writer);

                let r = r.with(json);
                if is_test { r.try_init().ok(); }
                else { r.try_init()?; }
                Some(_guard)
            },
            None => {
                if is_test { r.try_init().ok(); }
                else { r.try_init()?; }
                None
            }
        };
        Ok(flush_guard)
    }

    /// Install the global subscriber: human-readable events on stderr, filtered by `RUST_LOG`
    /// (default `info`), plus newline-delimited JSON in `logfile` if one is given.  Keep the
    /// returned guard alive until the program exits or buffered JSON lines are lost.
    pub fn init_logging(logfile: Option<impl AsRef<Path>>) -> anyhow::Result<Option<WorkerGuard>> {
        build_and_set_global_subscriber(logfile, false)
    }

    #[allow(dead_code)]
    pub(crate) fn init_test_logging(logfile: Option<impl AsRef<Path>>) -> Option<WorkerGuard> {
        build_and_set_global_subscriber(logfile, true).ok().flatten()
    }
}
pub use logging_setup::*;
