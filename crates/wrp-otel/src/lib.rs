//! Zero-configuration `tracing` installer: a single entry point the agent
//! facade calls once at process start, after which every component's
//! `tracing` spans/events reach whatever subscriber was installed.
//!
//! This crate deliberately does not wire an OpenTelemetry exporter or a
//! metrics pipeline — structured logging is the ambient stack this core
//! carries; shipping spans off-box is an external collaborator's job.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};
use wrp_core::loglevel::{LogLevel, LogLevelController};

static INSTALLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("a tracing subscriber is already installed for this process")]
    AlreadyInstalled,
    #[error("invalid tracing filter directive {0:?}: {1}")]
    InvalidFilter(String, #[source] tracing_subscriber::filter::ParseError),
}

/// Installs a global `fmt` subscriber driven by an `EnvFilter` built from
/// `directives` (e.g. `"wrp_credentials=debug,wrp_transport_ws=info"`).
/// Idempotent-aware: returns `AlreadyInstalled` rather than panicking if
/// called twice, since `tracing`'s global dispatcher can only be set once.
pub fn install(directives: &str) -> Result<(), ObservabilityError> {
    let filter = EnvFilter::try_new(directives)
        .map_err(|e| ObservabilityError::InvalidFilter(directives.to_string(), e))?;
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(ObservabilityError::AlreadyInstalled);
    }
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init().ok();
    Ok(())
}

/// A [`LogLevelController`] backed by a [`tracing_subscriber::reload`]
/// handle, so `wrp-router`'s `self/loglevel` CRUD handler can
/// change the installed filter at runtime without this crate depending on
/// the router.
pub struct ReloadableLevelController {
    handle: tracing_subscriber::reload::Handle<EnvFilter, Registry>,
    current: AtomicU8,
}

fn level_to_code(level: LogLevel) -> u8 {
    match level {
        LogLevel::Debug => 0,
        LogLevel::Info => 1,
        LogLevel::Warn => 2,
        LogLevel::Error => 3,
    }
}

fn code_to_level(code: u8) -> LogLevel {
    match code {
        0 => LogLevel::Debug,
        1 => LogLevel::Info,
        2 => LogLevel::Warn,
        _ => LogLevel::Error,
    }
}

impl LogLevelController for ReloadableLevelController {
    fn set_level(&self, level: LogLevel) -> Result<(), String> {
        self.handle
            .modify(|filter| *filter = EnvFilter::new(level.as_str()))
            .map_err(|e| e.to_string())?;
        self.current.store(level_to_code(level), Ordering::SeqCst);
        Ok(())
    }

    fn current_level(&self) -> LogLevel {
        code_to_level(self.current.load(Ordering::SeqCst))
    }
}

/// Installs a global subscriber whose filter can be changed later through
/// the returned [`LogLevelController`]. `directives` seeds the initial filter, e.g. `"info"`.
pub fn install_with_reload(directives: &str) -> Result<Arc<dyn LogLevelController>, ObservabilityError> {
    let initial = EnvFilter::try_new(directives).map_err(|e| ObservabilityError::InvalidFilter(directives.to_string(), e))?;
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(ObservabilityError::AlreadyInstalled);
    }
    let (filter, handle) = tracing_subscriber::reload::Layer::new(initial);
    let subscriber = Registry::default().with(filter).with(tracing_subscriber::fmt::layer());
    let _ = tracing::subscriber::set_global_default(subscriber);

    let level = directives.parse().unwrap_or(LogLevel::Info);
    Ok(Arc::new(ReloadableLevelController {
        handle,
        current: AtomicU8::new(level_to_code(level)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_directive() {
        let err = install("not a valid directive ===").unwrap_err();
        assert!(matches!(err, ObservabilityError::InvalidFilter(_, _)));
    }

    #[test]
    fn reload_controller_tracks_the_level_it_set() {
        let controller = install_with_reload("info").expect("first install in this binary succeeds");
        assert_eq!(controller.current_level(), LogLevel::Info);
        controller.set_level(LogLevel::Debug).expect("reload handle is still live");
        assert_eq!(controller.current_level(), LogLevel::Debug);
    }
}
