//! Host logging bootstrap and hook panic context.
//!
//! # Responsibility
//! - Turn the `HostConfig` log settings into one rolling file logger.
//! - Track which extension hook the current thread is running.
//! - Log panics with the extension and hook that raised them.
//!
//! # Invariants
//! - The logger is started at most once per process.
//! - Repeating init with the same settings is a no-op; other settings are
//!   rejected, never applied.
//! - Panic payloads are logged as one capped line.
//!
//! Every event is one `event=... module=... status=...` line; registry and
//! dispatch code never logs hook payloads.

use crate::config::HostConfig;
use flexi_logger::{
    Cleanup, Criterion, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming, WriteMode,
};
use log::{error, info};
use once_cell::sync::OnceCell;
use std::cell::RefCell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

const LOG_FILE_BASENAME: &str = "modhost";
const MAX_LOG_FILE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LOG_FILES: usize = 5;
const MAX_PANIC_PAYLOAD_CHARS: usize = 160;

static ACTIVE: OnceCell<ActiveLogger> = OnceCell::new();
static PANIC_HOOK_INSTALLED: OnceCell<()> = OnceCell::new();

thread_local! {
    static CURRENT_HOOK: RefCell<Option<(String, String)>> = const { RefCell::new(None) };
}

struct ActiveLogger {
    settings: LogSettings,
    _handle: LoggerHandle,
}

/// Supported log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parses a case-insensitive level name; `warning` is accepted for `warn`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// `debug` in debug builds, `info` in release builds.
    pub fn for_build() -> Self {
        if cfg!(debug_assertions) {
            Self::Debug
        } else {
            Self::Info
        }
    }
}

/// Resolved logger settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LogLevel,
    pub dir: PathBuf,
}

impl LogSettings {
    /// Reads the log settings of a host config.
    ///
    /// Returns `Ok(None)` when the config has no `log_dir`: the host then
    /// runs without a file logger.
    pub fn from_config(config: &HostConfig) -> Result<Option<Self>, LoggingError> {
        let Some(dir) = config.log_dir.as_ref() else {
            return Ok(None);
        };
        let level = LogLevel::parse(&config.log_level)
            .ok_or_else(|| LoggingError::UnsupportedLevel(config.log_level.clone()))?;
        if !dir.is_absolute() {
            return Err(LoggingError::RelativeDir(dir.clone()));
        }
        Ok(Some(Self {
            level,
            dir: dir.clone(),
        }))
    }
}

#[derive(Debug)]
pub enum LoggingError {
    UnsupportedLevel(String),
    RelativeDir(PathBuf),
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Backend(FlexiLoggerError),
    AlreadyActive {
        active: LogSettings,
        requested: LogSettings,
    },
}

impl Display for LoggingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedLevel(level) => write!(
                f,
                "unsupported log level `{level}`; expected trace|debug|info|warn|error"
            ),
            Self::RelativeDir(path) => {
                write!(f, "log_dir must be an absolute path, got `{}`", path.display())
            }
            Self::CreateDir { path, source } => write!(
                f,
                "failed to create log directory `{}`: {source}",
                path.display()
            ),
            Self::Backend(err) => write!(f, "failed to start logger: {err}"),
            Self::AlreadyActive { active, requested } => write!(
                f,
                "logging already active ({} at `{}`); refusing to switch to {} at `{}`",
                active.level.as_str(),
                active.dir.display(),
                requested.level.as_str(),
                requested.dir.display()
            ),
        }
    }
}

impl Error for LoggingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::CreateDir { source, .. } => Some(source),
            Self::Backend(err) => Some(err),
            Self::UnsupportedLevel(_) | Self::RelativeDir(_) | Self::AlreadyActive { .. } => None,
        }
    }
}

impl From<FlexiLoggerError> for LoggingError {
    fn from(value: FlexiLoggerError) -> Self {
        Self::Backend(value)
    }
}

/// Starts the file logger for a host config.
///
/// Returns `Ok(false)` when the config has no `log_dir`.
pub fn init_from_config(config: &HostConfig) -> Result<bool, LoggingError> {
    match LogSettings::from_config(config)? {
        Some(settings) => init_logging(&settings).map(|()| true),
        None => Ok(false),
    }
}

/// Starts the rolling file logger.
///
/// # Errors
/// - `CreateDir` when the directory cannot be created.
/// - `Backend` when `flexi_logger` refuses the setup.
/// - `AlreadyActive` when a logger with other settings is running.
pub fn init_logging(settings: &LogSettings) -> Result<(), LoggingError> {
    let active = ACTIVE.get_or_try_init(|| start_logger(settings))?;
    if active.settings != *settings {
        return Err(LoggingError::AlreadyActive {
            active: active.settings.clone(),
            requested: settings.clone(),
        });
    }
    Ok(())
}

fn start_logger(settings: &LogSettings) -> Result<ActiveLogger, LoggingError> {
    std::fs::create_dir_all(&settings.dir).map_err(|source| LoggingError::CreateDir {
        path: settings.dir.clone(),
        source,
    })?;

    let handle = Logger::try_with_str(settings.level.as_str())?
        .log_to_file(
            FileSpec::default()
                .directory(settings.dir.as_path())
                .basename(LOG_FILE_BASENAME),
        )
        .rotate(
            Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(MAX_LOG_FILES),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .append()
        .format_for_files(flexi_logger::detailed_format)
        .start()?;

    install_panic_hook_once();
    info!(
        "event=logging_init module=host status=ok level={} log_dir={} version={}",
        settings.level.as_str(),
        settings.dir.display(),
        env!("CARGO_PKG_VERSION")
    );

    Ok(ActiveLogger {
        settings: settings.clone(),
        _handle: handle,
    })
}

/// Marks the current thread as running one extension hook until dropped.
pub(crate) struct HookScope {
    previous: Option<(String, String)>,
}

impl Drop for HookScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_HOOK.with(|current| *current.borrow_mut() = previous);
    }
}

/// Enters a hook scope; nested scopes restore the outer one on drop.
pub(crate) fn enter_hook(extension: &str, hook: &str) -> HookScope {
    let previous = CURRENT_HOOK.with(|current| {
        current
            .borrow_mut()
            .replace((extension.to_string(), hook.to_string()))
    });
    HookScope { previous }
}

/// `(extension, hook)` the current thread is running, if any.
pub(crate) fn current_hook() -> Option<(String, String)> {
    CURRENT_HOOK.with(|current| current.borrow().clone())
}

fn install_panic_hook_once() {
    if PANIC_HOOK_INSTALLED.get().is_some() {
        return;
    }

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let (extension, hook) = current_hook()
            .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
        error!(
            "event=panic_captured module=host status=error extension={} hook={} location={} payload={}",
            extension,
            hook,
            location,
            panic_payload_summary(panic_info)
        );
        previous_hook(panic_info);
    }));

    let _ = PANIC_HOOK_INSTALLED.set(());
}

fn panic_payload_summary(info: &std::panic::PanicHookInfo<'_>) -> String {
    let payload = if let Some(message) = info.payload().downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = info.payload().downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };
    single_line(&payload, MAX_PANIC_PAYLOAD_CHARS)
}

fn single_line(value: &str, max_chars: usize) -> String {
    let normalized = value.replace(['\n', '\r'], " ");
    let mut truncated = normalized.chars().take(max_chars).collect::<String>();
    if normalized.chars().count() > max_chars {
        truncated.push_str("...");
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::{
        current_hook, enter_hook, init_from_config, init_logging, single_line, LogLevel,
        LogSettings, LoggingError,
    };
    use crate::config::HostConfig;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    // The logger outlives the test, so the directory is not cleaned up.
    fn process_log_dir(suffix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "modhost-logging-{suffix}-{}-{nanos}",
            std::process::id()
        ))
    }

    #[test]
    fn parses_level_names() {
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse(" warning "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn config_without_log_dir_starts_no_logger() {
        let config = HostConfig::default();
        assert_eq!(LogSettings::from_config(&config).expect("settings"), None);
        assert!(!init_from_config(&config).expect("no logger is fine"));
    }

    #[test]
    fn config_settings_reject_bad_values() {
        let config = HostConfig {
            log_level: "loud".to_string(),
            log_dir: Some(process_log_dir("unused")),
            ..HostConfig::default()
        };
        assert!(matches!(
            LogSettings::from_config(&config),
            Err(LoggingError::UnsupportedLevel(_))
        ));

        let config = HostConfig {
            log_dir: Some(PathBuf::from("logs/dev")),
            ..HostConfig::default()
        };
        assert!(matches!(
            LogSettings::from_config(&config),
            Err(LoggingError::RelativeDir(_))
        ));
    }

    #[test]
    fn single_line_removes_newlines_and_truncates() {
        let line = single_line("hook\nfailed\rbadly", 8);
        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));
        assert!(line.ends_with("..."));
    }

    #[test]
    fn hook_scopes_nest_and_restore() {
        assert_eq!(current_hook(), None);
        {
            let _outer = enter_hook("node", "install");
            {
                let _inner = enter_hook("user", "modules_installed");
                assert_eq!(
                    current_hook(),
                    Some(("user".to_string(), "modules_installed".to_string()))
                );
            }
            assert_eq!(
                current_hook(),
                Some(("node".to_string(), "install".to_string()))
            );
        }
        assert_eq!(current_hook(), None);
    }

    #[test]
    fn init_is_idempotent_for_same_settings_and_rejects_others() {
        let settings = LogSettings {
            level: LogLevel::Info,
            dir: process_log_dir("active"),
        };
        init_logging(&settings).expect("first init should succeed");
        init_logging(&settings).expect("same settings should be idempotent");

        let louder = LogSettings {
            level: LogLevel::Debug,
            ..settings.clone()
        };
        assert!(matches!(
            init_logging(&louder),
            Err(LoggingError::AlreadyActive { .. })
        ));

        let elsewhere = LogSettings {
            dir: process_log_dir("conflict"),
            ..settings
        };
        let err = init_logging(&elsewhere).expect_err("directory conflict should fail");
        assert!(err.to_string().contains("refusing to switch"));
    }
}
