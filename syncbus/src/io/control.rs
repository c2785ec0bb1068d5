//! Stop flag (`control/STOP`) and Ctrl-C handling.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};

use crate::core::types::StopSignal;
use crate::exit_codes;
use crate::io::atomic::write_atomic;

/// Read/write access to the soft-stop flag.
pub trait ControlFlags {
    fn stop_signal(&self) -> Result<StopSignal>;
    fn request_stop(&self, reason: &str) -> Result<()>;
    /// Remove the flag. Returns whether one was present.
    fn clear_stop(&self) -> Result<bool>;
}

/// Stop flag backed by file presence.
#[derive(Debug, Clone)]
pub struct FileControl {
    stop_path: PathBuf,
}

impl FileControl {
    pub fn new(stop_path: impl Into<PathBuf>) -> Self {
        Self {
            stop_path: stop_path.into(),
        }
    }

    pub fn stop_path(&self) -> &Path {
        &self.stop_path
    }
}

impl ControlFlags for FileControl {
    fn stop_signal(&self) -> Result<StopSignal> {
        match fs::symlink_metadata(&self.stop_path) {
            Ok(_) => Ok(StopSignal::SoftStop),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(StopSignal::Clear),
            Err(err) => {
                Err(err).with_context(|| format!("check stop flag {}", self.stop_path.display()))
            }
        }
    }

    fn request_stop(&self, reason: &str) -> Result<()> {
        let note = format!(
            "stop requested at {} ({reason})\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        write_atomic(&self.stop_path, &note)?;
        info!(path = %self.stop_path.display(), reason, "soft stop requested");
        Ok(())
    }

    fn clear_stop(&self) -> Result<bool> {
        match fs::remove_file(&self.stop_path) {
            Ok(()) => {
                info!(path = %self.stop_path.display(), "stop flag cleared");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("remove stop flag {}", self.stop_path.display()))
            }
        }
    }
}

static INTERRUPTS: AtomicUsize = AtomicUsize::new(0);

/// First Ctrl-C raises the stop flag; the second exits immediately.
///
/// A hard stop may leave the run state BUSY; the next invocation clears it
/// once it goes stale.
pub fn install_signal_handlers(control: FileControl) -> Result<()> {
    ctrlc::set_handler(move || {
        let count = INTERRUPTS.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            eprintln!("syncbus: stopping after the current cycle (Ctrl-C again to abort)");
            if let Err(err) = control.request_stop("interrupt") {
                warn!(err = %format!("{err:#}"), "failed to raise stop flag");
            }
        } else {
            eprintln!("syncbus: hard stop");
            process::exit(exit_codes::HARD_STOP);
        }
    })
    .context("install Ctrl-C handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_presence_is_the_signal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let control = FileControl::new(temp.path().join("control").join("STOP"));

        assert_eq!(control.stop_signal().expect("signal"), StopSignal::Clear);
        control.request_stop("test").expect("request");
        assert_eq!(control.stop_signal().expect("signal"), StopSignal::SoftStop);
        let note = fs::read_to_string(control.stop_path()).expect("read");
        assert!(note.starts_with("stop requested at"));

        assert!(control.clear_stop().expect("clear"));
        assert!(!control.clear_stop().expect("clear again"));
        assert_eq!(control.stop_signal().expect("signal"), StopSignal::Clear);
    }

    #[test]
    fn empty_flag_file_still_stops() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("STOP");
        fs::write(&path, "").expect("touch");
        assert_eq!(
            FileControl::new(path).stop_signal().expect("signal"),
            StopSignal::SoftStop
        );
    }
}
