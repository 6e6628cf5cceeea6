//! Runtime configuration files: registered applications, context levels and
//! the logging mode, kept in one directory between daemon runs.
//!
//! ```text
//! dlt-runtime-application.cfg   APID:description:
//! dlt-runtime-context.cfg       APID:CTID:level:status:description:
//! dlt-runtime.cfg               LoggingMode = N
//! ```

use std::borrow::Cow;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dltrelay_frame::Id4;
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};
use crate::registry::{ContextRegistration, Registry};

pub const APPLICATION_FILE: &str = "dlt-runtime-application.cfg";
pub const CONTEXT_FILE: &str = "dlt-runtime-context.cfg";
pub const CONFIG_FILE: &str = "dlt-runtime.cfg";

const LOGGING_MODE_KEY: &str = "LoggingMode";

/// Where producer log messages may go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    Off,
    /// Consumers only.
    #[default]
    External,
    /// Trace sink only.
    Internal,
    Both,
}

impl LoggingMode {
    pub fn from_i8(value: i8) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::External),
            2 => Some(Self::Internal),
            3 => Some(Self::Both),
            _ => None,
        }
    }

    pub fn as_i8(self) -> i8 {
        match self {
            Self::Off => 0,
            Self::External => 1,
            Self::Internal => 2,
            Self::Both => 3,
        }
    }

    pub fn to_consumers(self) -> bool {
        matches!(self, Self::External | Self::Both)
    }

    pub fn to_trace(self) -> bool {
        matches!(self, Self::Internal | Self::Both)
    }
}

/// The runtime configuration directory.
#[derive(Debug, Clone)]
pub struct RuntimeStore {
    dir: PathBuf,
}

impl RuntimeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn application_path(&self) -> PathBuf {
        self.dir.join(APPLICATION_FILE)
    }

    pub fn context_path(&self) -> PathBuf {
        self.dir.join(CONTEXT_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Fill `registry` from the files. Entries get pid 0 and no channel.
    ///
    /// Returns true when both files were present; the registry then keeps
    /// the loaded levels over those sent by re-registering producers.
    pub fn load(&self, registry: &mut Registry, ecu: Id4) -> Result<bool> {
        let applications = self.load_applications(registry, ecu)?;
        let contexts = self.load_contexts(registry, ecu)?;
        let loaded = applications && contexts;
        if loaded {
            registry.settings_mut().runtime_config_loaded = true;
        }
        info!(dir = %self.dir.display(), loaded, "runtime configuration read");
        Ok(loaded)
    }

    fn load_applications(&self, registry: &mut Registry, ecu: Id4) -> Result<bool> {
        let path = self.application_path();
        let Some(text) = read_optional(&path)? else {
            return Ok(false);
        };
        for (number, line) in text.lines().enumerate() {
            let Some((apid, description)) = parse_application_line(line) else {
                if !line.trim().is_empty() {
                    warn!(path = %path.display(), line = number + 1, "skipping malformed line");
                }
                continue;
            };
            registry.add_application(ecu, apid, 0, description, None)?;
        }
        Ok(true)
    }

    fn load_contexts(&self, registry: &mut Registry, ecu: Id4) -> Result<bool> {
        let path = self.context_path();
        let Some(text) = read_optional(&path)? else {
            return Ok(false);
        };
        for (number, line) in text.lines().enumerate() {
            let Some(registration) = parse_context_line(line) else {
                if !line.trim().is_empty() {
                    warn!(path = %path.display(), line = number + 1, "skipping malformed line");
                }
                continue;
            };
            if let Err(err) = registry.add_context(ecu, registration) {
                warn!(path = %path.display(), line = number + 1, error = %err, "context not restored");
            }
        }
        Ok(true)
    }

    pub fn save_applications(&self, registry: &Registry, ecu: Id4) -> Result<()> {
        let mut text = String::new();
        if let Some(list) = registry.find_user_list(ecu) {
            for app in list.applications() {
                let _ = writeln!(text, "{}:{}:", app.apid, single_line(&app.description));
            }
        }
        self.write_file(&self.application_path(), &text)
    }

    pub fn save_contexts(&self, registry: &Registry, ecu: Id4) -> Result<()> {
        let mut text = String::new();
        if let Some(list) = registry.find_user_list(ecu) {
            for ctx in list.contexts() {
                let _ = writeln!(
                    text,
                    "{}:{}:{}:{}:{}:",
                    ctx.apid,
                    ctx.ctid,
                    ctx.log_level,
                    ctx.trace_status,
                    single_line(&ctx.description)
                );
            }
        }
        self.write_file(&self.context_path(), &text)
    }

    /// Delete the application and context files.
    pub fn reset(&self) -> Result<()> {
        for path in [self.application_path(), self.context_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "runtime file removed"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(DaemonError::Persist { path, source }),
            }
        }
        Ok(())
    }

    pub fn load_logging_mode(&self) -> Result<Option<LoggingMode>> {
        let path = self.config_path();
        let Some(text) = read_optional(&path)? else {
            return Ok(None);
        };
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.trim() != LOGGING_MODE_KEY {
                continue;
            }
            let mode = value.trim().parse::<i8>().ok().and_then(LoggingMode::from_i8);
            if mode.is_none() {
                warn!(path = %path.display(), value = value.trim(), "invalid logging mode");
            }
            return Ok(mode);
        }
        Ok(None)
    }

    pub fn save_logging_mode(&self, mode: LoggingMode) -> Result<()> {
        let text = format!("{LOGGING_MODE_KEY} = {}\n", mode.as_i8());
        self.write_file(&self.config_path(), &text)
    }

    fn write_file(&self, path: &Path, text: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .and_then(|()| std::fs::write(path, text))
            .map_err(|source| DaemonError::Persist {
                path: path.to_path_buf(),
                source,
            })
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(DaemonError::Persist {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn strip_terminator(field: &str) -> &str {
    field.strip_suffix(':').unwrap_or(field)
}

/// Descriptions come from producers; one entry must stay on one line.
fn single_line(description: &str) -> Cow<'_, str> {
    if description.contains(['\n', '\r']) {
        Cow::Owned(description.replace(['\n', '\r'], " "))
    } else {
        Cow::Borrowed(description)
    }
}

fn parse_application_line(line: &str) -> Option<(Id4, &str)> {
    let (apid, rest) = line.trim_end().split_once(':')?;
    let apid = Id4::new(apid);
    if apid.is_empty() {
        return None;
    }
    Some((apid, strip_terminator(rest)))
}

fn parse_context_line(line: &str) -> Option<ContextRegistration> {
    let mut fields = line.trim_end().splitn(5, ':');
    let apid = Id4::new(fields.next()?);
    let ctid = Id4::new(fields.next()?);
    let log_level = fields.next()?.trim().parse().ok()?;
    let trace_status = fields.next()?.trim().parse().ok()?;
    let description = strip_terminator(fields.next().unwrap_or_default()).to_string();
    if apid.is_empty() || ctid.is_empty() {
        return None;
    }
    Some(ContextRegistration {
        apid,
        ctid,
        log_level,
        trace_status,
        log_level_pos: -1,
        channel: None,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistrySettings;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "dltrelay-persist-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    fn ecu() -> Id4 {
        Id4::new("ECU1")
    }

    fn populated() -> Registry {
        let mut registry = Registry::new(RegistrySettings::default());
        registry
            .add_application(ecu(), Id4::new("APP"), 42, "demo app", None)
            .expect("application should register");
        registry
            .add_context(
                ecu(),
                ContextRegistration {
                    apid: Id4::new("APP"),
                    ctid: Id4::new("CTX"),
                    log_level: 5,
                    trace_status: 1,
                    log_level_pos: 3,
                    channel: None,
                    description: "with: colon".to_string(),
                },
            )
            .expect("context should register");
        registry
    }

    #[test]
    fn save_then_load_restores_entries() {
        let dir = temp_dir("roundtrip");
        let store = RuntimeStore::new(&dir);
        let source = populated();
        store.save_applications(&source, ecu()).expect("save apps");
        store.save_contexts(&source, ecu()).expect("save contexts");

        let text = std::fs::read_to_string(store.context_path()).expect("context file");
        assert_eq!(text, "APP:CTX:5:1:with: colon:\n");

        let mut restored = Registry::new(RegistrySettings::default());
        assert!(store.load(&mut restored, ecu()).expect("load"));
        assert!(restored.settings().runtime_config_loaded);

        let app = restored
            .find_application(ecu(), Id4::new("APP"))
            .expect("application restored");
        assert_eq!(app.pid, 0);
        assert_eq!(app.channel, None);
        assert_eq!(app.description, "demo app");

        let ctx = restored
            .find_context(ecu(), Id4::new("APP"), Id4::new("CTX"))
            .expect("context restored");
        assert_eq!((ctx.log_level, ctx.trace_status), (5, 1));
        assert_eq!(ctx.description, "with: colon");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn multi_line_descriptions_stay_on_one_line() {
        let dir = temp_dir("newline");
        let store = RuntimeStore::new(&dir);
        let mut source = Registry::new(RegistrySettings::default());
        source
            .add_application(ecu(), Id4::new("APP"), 42, "first\nsecond", None)
            .expect("application should register");
        source
            .add_context(
                ecu(),
                ContextRegistration {
                    apid: Id4::new("APP"),
                    ctid: Id4::new("CTX"),
                    log_level: 2,
                    trace_status: 0,
                    log_level_pos: 0,
                    channel: None,
                    description: "a\r\nb".to_string(),
                },
            )
            .expect("context should register");
        store.save_applications(&source, ecu()).expect("save apps");
        store.save_contexts(&source, ecu()).expect("save contexts");

        let text = std::fs::read_to_string(store.context_path()).expect("context file");
        assert_eq!(text, "APP:CTX:2:0:a  b:\n");

        let mut restored = Registry::new(RegistrySettings::default());
        assert!(store.load(&mut restored, ecu()).expect("load"));
        let app = restored
            .find_application(ecu(), Id4::new("APP"))
            .expect("application restored");
        assert_eq!(app.description, "first second");
        let ctx = restored
            .find_context(ecu(), Id4::new("APP"), Id4::new("CTX"))
            .expect("context restored");
        assert_eq!(ctx.description, "a  b");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_files_are_not_an_error() {
        let store = RuntimeStore::new(temp_dir("missing"));
        let mut registry = Registry::default();
        assert!(!store.load(&mut registry, ecu()).expect("load"));
        assert!(!registry.settings().runtime_config_loaded);
        assert_eq!(store.load_logging_mode().expect("mode"), None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = temp_dir("malformed");
        std::fs::create_dir_all(&dir).expect("dir");
        let store = RuntimeStore::new(&dir);
        std::fs::write(store.application_path(), "APP:ok:\n\n:nope:\n").expect("write");
        std::fs::write(store.context_path(), "APP:CTX:x:0::\nAPP:C2:3:0:fine:\nAPP:C3:9:0::\n")
            .expect("write");

        let mut registry = Registry::default();
        assert!(store.load(&mut registry, ecu()).expect("load"));
        let list = registry.find_user_list(ecu()).expect("user list");
        assert_eq!(list.applications().len(), 1);
        assert_eq!(list.contexts().len(), 1);
        assert_eq!(list.contexts()[0].ctid, Id4::new("C2"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reset_removes_files() {
        let dir = temp_dir("reset");
        let store = RuntimeStore::new(&dir);
        let registry = populated();
        store.save_applications(&registry, ecu()).expect("save apps");
        store.save_contexts(&registry, ecu()).expect("save contexts");

        store.reset().expect("reset");
        assert!(!store.application_path().exists());
        assert!(!store.context_path().exists());
        store.reset().expect("second reset is a no-op");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn logging_mode_round_trip() {
        let dir = temp_dir("mode");
        let store = RuntimeStore::new(&dir);
        store.save_logging_mode(LoggingMode::Both).expect("save mode");
        assert_eq!(
            std::fs::read_to_string(store.config_path()).expect("config file"),
            "LoggingMode = 3\n"
        );
        assert_eq!(store.load_logging_mode().expect("mode"), Some(LoggingMode::Both));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn logging_mode_gates() {
        assert!(LoggingMode::External.to_consumers());
        assert!(!LoggingMode::External.to_trace());
        assert!(LoggingMode::Both.to_trace());
        assert!(!LoggingMode::Off.to_consumers());
        assert_eq!(LoggingMode::from_i8(4), None);
    }
}
