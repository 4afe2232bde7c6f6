//! Configuration and logging setup.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs};

use cryptoki_sys::CK_SLOT_ID;
use log::LevelFilter;
use secrecy::SecretString;
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::constants::*;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn user_pin() -> Option<SecretString> {
        env::var(P11BRIDGE_ENV_USER_PIN).ok().map(SecretString::new)
    }
    fn login() -> bool {
        true
    }
    fn read_write() -> bool {
        false
    }
    fn log_level() -> LevelFilter {
        match env::var(P11BRIDGE_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}, using info",
                        P11BRIDGE_ENV_LOG_LEVEL
                    );
                    LevelFilter::Info
                }
            },
            _ => LevelFilter::Info,
        }
    }
    fn log_type() -> LogType {
        LogType::Stderr
    }
    fn log_file() -> PathBuf {
        PathBuf::from("./p11bridge.log")
    }
    fn syslog_facility() -> String {
        "user".to_string()
    }
}


//------------ Config --------------------------------------------------------

/// The configuration of a PKCS#11 module and how to use it.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Path to the PKCS#11 library.
    pub lib_path: PathBuf,

    /// The slot to use. Without it, the first slot with a token is used.
    #[serde(default)]
    pub slot: Option<SlotIdOrLabel>,

    #[serde(default = "ConfigDefaults::user_pin")]
    pub user_pin: Option<SecretString>,

    #[serde(default = "ConfigDefaults::login")]
    pub login: bool,

    #[serde(default = "ConfigDefaults::read_write")]
    pub read_write: bool,

    #[serde(default = "ConfigDefaults::log_level", deserialize_with = "de_level_filter")]
    log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    syslog_facility: String,
}

/// # Accessors
impl Config {
    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn log_type(&self) -> &LogType {
        &self.log_type
    }
}

/// # Create
impl Config {
    /// Creates a config for the library at `lib_path` with all defaults.
    pub fn for_library(lib_path: impl Into<PathBuf>) -> Self {
        Config {
            lib_path: lib_path.into(),
            slot: None,
            user_pin: ConfigDefaults::user_pin(),
            login: ConfigDefaults::login(),
            read_write: ConfigDefaults::read_write(),
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
        }
    }

    pub fn set_log_level(&mut self, level: LevelFilter) {
        self.log_level = level;
    }

    pub fn set_log_type(&mut self, log_type: LogType) {
        self.log_type = log_type;
    }

    pub fn create() -> Result<Self, ConfigError> {
        Self::read_config(Path::new(P11BRIDGE_DEFAULT_CONFIG_FILE))
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Cannot read config file '{}': {}", file.display(), e),
            )
        })?;
        let config: Config = toml::from_str(&content)?;
        config.verify()?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.lib_path.as_os_str().is_empty() {
            return Err(ConfigError::other("lib_path must not be empty"));
        }
        if let Some(SlotIdOrLabel::Label(label)) = &self.slot {
            if label.is_empty() {
                return Err(ConfigError::other("slot label must not be empty"));
            }
            if label.len() > 32 {
                return Err(ConfigError::other("slot label must not exceed 32 characters"));
            }
        }
        Ok(())
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("syslog is not supported on this platform")),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = fern::log_file(path)
            .map_err(|err| ConfigError::Other(format!("Failed to open log file '{}': {}", path.display(), err)))?;
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("p11bridge"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => Err(ConfigError::Other(format!("Cannot connect to syslog: {}", err))),
        }
    }

    /// Creates the fern dispatcher shared by all log targets.
    fn fern_logger(&self) -> fern::Dispatch {
        let show_target = self.log_level >= LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
    }
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ SlotIdOrLabel -------------------------------------------------

/// Selects a slot either by its id or by the label of its token.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum SlotIdOrLabel {
    Id(CK_SLOT_ID),
    Label(String),
}

impl FromStr for SlotIdOrLabel {
    type Err = std::convert::Infallible;

    /// Numbers are taken as ids and anything else as a label.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<CK_SLOT_ID>() {
            Ok(id) => SlotIdOrLabel::Id(id),
            Err(_) => SlotIdOrLabel::Label(s.to_string()),
        })
    }
}

impl fmt::Display for SlotIdOrLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SlotIdOrLabel::Id(id) => write!(f, "slot {}", id),
            SlotIdOrLabel::Label(label) => write!(f, "token '{}'", label),
        }
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    fn parse(toml: &str) -> Config {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn should_parse_default_config_file() {
        let c = Config::read_config(Path::new("./defaults/p11bridge.conf")).unwrap();
        assert_eq!(c.lib_path, PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"));
        assert_eq!(c.slot, Some(SlotIdOrLabel::Label("My token 1".to_string())));
        assert!(c.login);
        assert!(!c.read_write);
        assert_eq!(c.log_type(), &LogType::Stderr);
    }

    #[test]
    fn should_read_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            lib_path = "/opt/vendor/libpkcs11.so"
            slot = 3
            user_pin = "1234"
            read_write = true
            log_level = "debug"
            log_type = "file"
            log_file = "/tmp/p11probe.log"
            "#
        )
        .unwrap();

        let c = Config::read_config(file.path()).unwrap();
        assert_eq!(c.slot, Some(SlotIdOrLabel::Id(3)));
        assert_eq!(c.user_pin.as_ref().map(|p| p.expose_secret().as_str()), Some("1234"));
        assert!(c.read_write);
        assert_eq!(c.log_level(), LevelFilter::Debug);
        assert_eq!(c.log_type(), &LogType::File);
        assert_eq!(c.log_file, PathBuf::from("/tmp/p11probe.log"));
    }

    #[test]
    fn pin_is_not_printed() {
        let c = parse(
            r#"
            lib_path = "/lib.so"
            user_pin = "987654"
            "#,
        );
        assert!(!format!("{:?}", c).contains("987654"));
    }

    #[test]
    fn should_reject_bad_values() {
        assert!(toml::from_str::<Config>(r#"slot = 1"#).is_err());
        assert!(toml::from_str::<Config>("lib_path = \"/lib.so\"\nlog_type = \"journal\"").is_err());
        assert!(toml::from_str::<Config>("lib_path = \"/lib.so\"\nlog_level = \"loud\"").is_err());

        let c = parse("lib_path = \"\"");
        assert!(c.verify().is_err());
        let c = parse("lib_path = \"/lib.so\"\nslot = \"\"");
        assert!(c.verify().is_err());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::read_config(Path::new("/nonexistent/p11bridge.conf")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/p11bridge.conf"));
        match err {
            ConfigError::IoError(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("expected an io error, got {}", other),
        }
    }

    #[test]
    fn slot_from_str() {
        assert_eq!(SlotIdOrLabel::from_str("12").unwrap(), SlotIdOrLabel::Id(12));
        assert_eq!(
            SlotIdOrLabel::from_str("signing key").unwrap(),
            SlotIdOrLabel::Label("signing key".to_string())
        );
    }

    #[test]
    fn should_set_correct_log_levels() {
        use log::Level as LL;

        fn void_logger(config: &Config) -> Box<dyn log::Log> {
            let void_output = fern::Output::writer(Box::new(io::sink()), "");
            let (_, void_logger) = config.fern_logger().chain(void_output).into_log();
            void_logger
        }

        fn for_target_at_level(target: &str, level: LL) -> log::Metadata {
            log::Metadata::builder().target(target).level(level).build()
        }

        for config_level in &["error", "warn", "info", "debug", "trace"] {
            let config = parse(&format!("lib_path = \"/lib.so\"\nlog_level = \"{}\"", config_level));
            let log = void_logger(&config);
            let config_level = LL::from_str(config_level).unwrap();

            for msg_level in &[LL::Error, LL::Warn, LL::Info, LL::Debug, LL::Trace] {
                assert_eq!(
                    *msg_level <= config_level,
                    log.enabled(&for_target_at_level("p11bridge::api", *msg_level)),
                    "Logging at level {} with log_level={}",
                    msg_level,
                    config_level
                );

                // Subsystem init and exit are logged at debug.
                assert_eq!(
                    *msg_level <= config_level,
                    log.enabled(&for_target_at_level("p11bridge::pkcs11::library", *msg_level)),
                    "Loader logging at level {} with log_level={}",
                    msg_level,
                    config_level
                );
            }
        }
    }
}
