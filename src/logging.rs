//! Process-wide logging sink and `logmask` translation.
//!
//! The original daemon keeps one nullable `FILE*` as its log sink,
//! protected by a cooperative try-lock with a 5ms backoff so concurrent
//! writer threads never block each other for long, and so `SIGHUP` can
//! swap the underlying file out from under them. [`LogSink`] is that same
//! shape: an `Arc<Mutex<Option<File>>>` that a `tracing` layer writes
//! through, reopened in place on `SIGHUP`.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use anyhow::{Context, Result};

const TRY_LOCK_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Clone)]
pub struct LogSink {
    path: Option<PathBuf>,
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    /// `logfile` absent means the sink falls back to stdout, matching the
    /// config default.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let file = match &path {
            Some(p) => Some(open_append(p)?),
            None => None,
        };
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// `SIGHUP`: close and reopen from the configured path. A no-op for a
    /// stdout sink — there's nothing to rotate.
    pub fn reopen(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let new_file = open_append(path)?;
        let mut guard = lock_with_backoff(&self.file);
        *guard = Some(new_file);
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open logfile '{}'", path.display()))
}

/// Spin with the same 5ms backoff the original daemon's log writer uses,
/// rather than blocking indefinitely on a poisoned or contended mutex.
fn lock_with_backoff(m: &Mutex<Option<File>>) -> std::sync::MutexGuard<'_, Option<File>> {
    loop {
        match m.try_lock() {
            Ok(guard) => return guard,
            Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => std::thread::sleep(TRY_LOCK_BACKOFF),
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock_with_backoff(&self.file);
        match guard.as_mut() {
            Some(f) => f.write(buf),
            // Writer failures degrade to dropping the line; they never
            // take down a session.
            None => io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = lock_with_backoff(&self.file);
        match guard.as_mut() {
            Some(f) => f.flush(),
            None => io::stdout().flush(),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolve the configured `logmask` to its effective value: the config
/// key wins if present; a literal `"ALL"` (case-insensitive) means every
/// level at full verbosity; otherwise fall back to the `LOGMASK`
/// environment variable, then a quiet default.
pub fn resolve_logmask(configured: Option<&str>) -> String {
    match configured {
        Some(s) if s.eq_ignore_ascii_case("all") => "E9W9I9D9F9".to_string(),
        Some(s) => s.to_string(),
        None => std::env::var("LOGMASK").unwrap_or_else(|_| "E9W4I2D0F9".to_string()),
    }
}

/// Translate a `"E9W4I2D0F9"`-shaped mask into the `tracing` directive
/// that enables the most verbose level any category asks for. The
/// original's per-level 0-9 granularity has no equivalent in `tracing`'s
/// five fixed levels, so this folds it down to "is this level on at all".
pub fn build_env_filter(mask: &str) -> tracing_subscriber::EnvFilter {
    let verbosity = |category: char| -> u8 {
        mask.char_indices()
            .find(|(_, c)| c.eq_ignore_ascii_case(&category))
            .and_then(|(i, _)| mask[i + 1..].chars().next())
            .and_then(|c| c.to_digit(10))
            .unwrap_or(0) as u8
    };

    let directive = if verbosity('D') > 0 {
        "debug"
    } else if verbosity('I') > 0 {
        "info"
    } else if verbosity('W') > 0 {
        "warn"
    } else if verbosity('E') > 0 || verbosity('F') > 0 {
        "error"
    } else {
        "off"
    };

    tracing_subscriber::EnvFilter::new(directive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_maps_to_fully_verbose_mask() {
        assert_eq!(resolve_logmask(Some("all")), "E9W9I9D9F9");
        assert_eq!(resolve_logmask(Some("ALL")), "E9W9I9D9F9");
    }

    #[test]
    fn configured_mask_passes_through_verbatim() {
        assert_eq!(resolve_logmask(Some("E9W4I2D0F9")), "E9W4I2D0F9");
    }

    #[test]
    fn debug_verbosity_wins_over_lower_levels() {
        let filter = build_env_filter("E9W9I9D9F9").to_string();
        assert_eq!(filter, "debug");
    }

    #[test]
    fn zeroed_mask_turns_logging_off() {
        let filter = build_env_filter("E0W0I0D0F0").to_string();
        assert_eq!(filter, "off");
    }

    #[test]
    fn only_error_enabled_maps_to_error_level() {
        let filter = build_env_filter("E9W0I0D0F0").to_string();
        assert_eq!(filter, "error");
    }
}
