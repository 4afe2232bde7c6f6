//! The command line interface of the `p11probe` tool.

use std::fmt;
use std::path::PathBuf;

use log::{LevelFilter, warn};
use secrecy::ExposeSecret;

use crate::api;
use crate::config::{Config, ConfigError, LogType, SlotIdOrLabel};
use crate::constants::P11BRIDGE_DEFAULT_CONFIG_FILE;
use crate::error;
use crate::handle::Handle;
use crate::pkcs11::UserType;
use crate::pkcs11::library::{LibraryLoader, SharedLibraryLoader};


//------------ Options -------------------------------------------------------

/// The command line options for the probe.
#[derive(clap::Parser)]
#[command(
    version,
    about = "Loads a PKCS#11 module and checks that it can be used.",
)]
pub struct Options {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won't result in usable options, exits the process.
    pub fn from_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Builds the configuration from the config file and the options.
    ///
    /// If a library path is given, no config file is read unless one is
    /// given explicitly, too.
    pub fn config(&self) -> Result<Config, ConfigError> {
        let file = match (&self.general.config, &self.general.lib_path) {
            (Some(file), _) => Some(file.clone()),
            (None, Some(_)) => None,
            (None, None) => Some(PathBuf::from(P11BRIDGE_DEFAULT_CONFIG_FILE)),
        };

        let mut config = match (file, &self.general.lib_path) {
            (Some(file), _) => Config::read_config(&file)?,
            (None, Some(lib_path)) => Config::for_library(lib_path.clone()),
            (None, None) => return Err(ConfigError::other("no PKCS#11 library given")),
        };

        if let Some(lib_path) = &self.general.lib_path {
            config.lib_path = lib_path.clone();
        }
        if let Some(slot) = &self.general.slot {
            config.slot = Some(slot.clone());
        }
        match self.general.log_level {
            Some(level) => config.set_log_level(level),
            None if self.general.verbose => config.set_log_level(LevelFilter::Debug),
            None => {}
        }
        if let Some(log_type) = &self.general.log_type {
            config.set_log_type(log_type.clone());
        }
        config.verify()?;
        Ok(config)
    }

    /// Runs the command using the platform library loader.
    pub fn run(self, config: &Config) -> Result<Report, Error> {
        self.run_with(&SharedLibraryLoader, config)
    }

    pub fn run_with(self, loader: &dyn LibraryLoader, config: &Config) -> Result<Report, Error> {
        let lib_path = config.lib_path.to_string_lossy();
        let module = LoadedModule(api::load_module_with(loader, &lib_path)?);

        match self.command {
            Command::Info => module.info(),
            Command::Slots(cmd) => module.slots(cmd.token_present),
            Command::Wait => module.wait(),
            Command::Session(cmd) => module.session(config, cmd),
        }
    }
}


//------------ GeneralOptions ------------------------------------------------

#[derive(clap::Args)]
pub struct GeneralOptions {
    /// Read the config from this file.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Path to the PKCS#11 library, overriding the config.
    #[arg(short = 'l', long, value_name = "path")]
    pub lib_path: Option<PathBuf>,

    /// Slot id or token label, overriding the config.
    #[arg(short, long, value_name = "id or label")]
    pub slot: Option<SlotIdOrLabel>,

    /// The log level, overriding the config.
    #[arg(long, value_name = "level")]
    pub log_level: Option<LevelFilter>,

    /// Where to log to: stderr, file or syslog.
    #[arg(long, value_name = "target")]
    pub log_type: Option<LogType>,

    /// Log at debug level unless a log level is given.
    #[arg(short, long)]
    pub verbose: bool,
}


//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// Show what the library reports about itself
    Info,

    /// List the slots and the tokens in them
    Slots(Slots),

    /// Wait until a token is inserted and show its slot
    Wait,

    /// Open a session, log in and out, and close it again
    Session(Session),
}

#[derive(clap::Args)]
pub struct Slots {
    /// Only list slots holding a token
    #[arg(long)]
    pub token_present: bool,
}

#[derive(clap::Args)]
pub struct Session {
    /// Open a read-write session
    #[arg(long)]
    pub read_write: bool,

    /// Do not log in
    #[arg(long)]
    pub no_login: bool,
}


//------------ LoadedModule --------------------------------------------------

/// A module that is unloaded when dropped.
struct LoadedModule(Handle);

impl LoadedModule {
    fn info(&self) -> Result<Report, Error> {
        let info = api::module_info(self.0)?;
        let mut report = Report::default();
        report.line(format!("Cryptoki version: {}", info.cryptoki_version));
        report.line(format!("Manufacturer:     {}", info.manufacturer));
        report.line(format!("Description:      {}", info.description));
        report.line(format!("Library version:  {}", info.library_version));
        Ok(report)
    }

    fn slots(&self, token_present: bool) -> Result<Report, Error> {
        let mut report = Report::default();
        for slot_id in api::slot_list(self.0, token_present)? {
            let slot = api::init_slot(self.0, slot_id)?;
            let info = api::slot_info(self.0, slot)?;
            report.line(format!(
                "Slot {}: {} ({}), hardware {}, firmware {}",
                info.id, info.description, info.manufacturer, info.hardware_version, info.firmware_version
            ));
            if info.token_present {
                let token = api::token_info(self.0, slot)?;
                report.line(format!(
                    "  Token '{}': {} {}, serial {}",
                    token.label, token.manufacturer, token.model, token.serial_number
                ));
            } else {
                report.line("  No token");
            }
            api::destroy_slot(self.0, slot)?;
        }
        Ok(report)
    }

    fn wait(&self) -> Result<Report, Error> {
        let slot = api::wait_for_slot(self.0)?;
        let info = api::slot_info(self.0, slot)?;
        let mut report = Report::default();
        report.line(format!("Slot event in slot {}: {}", info.id, info.description));
        if info.token_present {
            report.line(format!("  Token '{}'", api::token_info(self.0, slot)?.label));
        }
        api::destroy_slot(self.0, slot)?;
        Ok(report)
    }

    fn session(&self, config: &Config, cmd: Session) -> Result<Report, Error> {
        let slot = match &config.slot {
            Some(SlotIdOrLabel::Id(id)) => api::init_slot(self.0, *id)?,
            Some(SlotIdOrLabel::Label(label)) => api::init_slot_by_label(self.0, label)?,
            None => match api::slot_list(self.0, true)?.first() {
                Some(id) => api::init_slot(self.0, *id)?,
                None => return Err(Error::Other("no slot holds a token".to_string())),
            },
        };

        let read_write = cmd.read_write || config.read_write;
        let session = api::open_session(self.0, slot, read_write)?;

        let mut report = Report::default();
        report.line(format!(
            "Opened {} session {}",
            if read_write { "read-write" } else { "read-only" },
            session
        ));

        if config.login && !cmd.no_login {
            let pin = config.user_pin.as_ref().map(|pin| pin.expose_secret().as_bytes());
            if let Err(err) = api::login(self.0, slot, session, UserType::User, pin) {
                api::close_session(self.0, slot, session)?;
                return Err(err.into());
            }
            report.line(format!("Session state: {}", api::session_state(self.0, slot, session)?));
            api::logout(self.0, slot, session)?;
            report.line("Logged out");
        }

        api::close_session(self.0, slot, session)?;
        report.line("Closed session");
        Ok(report)
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        if let Err(err) = api::unload_module(self.0) {
            warn!("{}", err);
        }
    }
}


//------------ Report --------------------------------------------------------

/// The output of a command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Report {
    lines: Vec<String>,
}

impl Report {
    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    Pkcs11(error::Error),
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Pkcs11(e) => e.fmt(f),
            Error::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<error::Error> for Error {
    fn from(e: error::Error) -> Self {
        Error::Pkcs11(e)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::Parser;
    use cryptoki_sys::CKR_PIN_INCORRECT;

    use super::*;
    use crate::mock::{self, MockBehaviour, MockLoader, MockSlot};

    fn options(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("p11probe").chain(args.iter().copied())).unwrap()
    }

    fn run(args: &[&str]) -> Result<Report, Error> {
        let options = options(args);
        let config = options.config().unwrap();
        options.run_with(&MockLoader, &config)
    }

    #[test]
    fn lib_path_option_needs_no_config_file() {
        let options = options(&["--lib-path", "/lib.so", "--slot", "token", "info"]);
        let config = options.config().unwrap();
        assert_eq!(config.lib_path, PathBuf::from("/lib.so"));
        assert_eq!(config.slot, Some(SlotIdOrLabel::Label("token".to_string())));
    }

    #[test]
    fn explicit_log_level_beats_verbose() {
        let config = options(&["-l", "/lib.so", "-v", "info"]).config().unwrap();
        assert_eq!(config.log_level(), LevelFilter::Debug);

        let config = options(&["-l", "/lib.so", "-v", "--log-level", "trace", "info"])
            .config()
            .unwrap();
        assert_eq!(config.log_level(), LevelFilter::Trace);
    }

    #[test]
    fn info_reports_library() {
        let mock = mock::install(MockBehaviour::default());
        let report = run(&["-l", "libmock.so", "info"]).unwrap().to_string();
        assert!(report.contains("Cryptoki version: 2.20"));
        assert!(report.contains("TestCA"));
        assert!(report.contains("MockToken"));
        assert_eq!(mock.calls().finalize, 1);
    }

    #[test]
    fn slots_lists_tokens() {
        let _mock = mock::install(MockBehaviour {
            slots: vec![MockSlot::empty(0), MockSlot::with_token(1, "signer")],
            ..Default::default()
        });
        let report = run(&["-l", "libmock.so", "slots"]).unwrap().to_string();
        assert!(report.contains("Slot 0"));
        assert!(report.contains("No token"));
        assert!(report.contains("Token 'signer'"));
        assert!(report.contains("hardware 1.00, firmware 2.05"));

        let report = run(&["-l", "libmock.so", "slots", "--token-present"]).unwrap().to_string();
        assert!(!report.contains("Slot 0"));
    }

    #[test]
    fn wait_reports_slot_event() {
        let mock = mock::install(MockBehaviour {
            slots: vec![MockSlot::empty(0), MockSlot::with_token(1, "signer")],
            slot_event: 1,
            ..Default::default()
        });
        let report = run(&["-l", "libmock.so", "wait"]).unwrap().to_string();
        assert!(report.contains("Slot event in slot 1"));
        assert!(report.contains("Token 'signer'"));
        assert_eq!(mock.calls().wait_for_slot_event.len(), 1);
    }

    #[test]
    fn session_round_trip() {
        let mock = mock::install(MockBehaviour::default());
        let report = run(&["-l", "libmock.so", "session", "--read-write"]).unwrap().to_string();
        assert!(report.contains("Opened read-write session"));
        assert!(report.contains("authenticated as user"));
        assert!(report.contains("Closed session"));

        let calls = mock.calls();
        assert_eq!(calls.login.len(), 1);
        assert_eq!(calls.logout.len(), 1);
        assert_eq!(calls.close_session.len(), 1);
        assert_eq!(calls.libraries_closed, 1);
    }

    #[test]
    fn failed_login_closes_session_and_unloads() {
        let mock = mock::install(MockBehaviour {
            login_rv: CKR_PIN_INCORRECT,
            ..Default::default()
        });
        let err = run(&["-l", "libmock.so", "session"]).unwrap_err();
        assert!(err.to_string().contains("CKR_PIN_INCORRECT"));

        let calls = mock.calls();
        assert_eq!(calls.close_session.len(), 1);
        assert_eq!(calls.finalize, 1);
        assert_eq!(calls.libraries_closed, 1);
    }

    #[test]
    fn session_without_login() {
        let mock = mock::install(MockBehaviour::default());
        run(&["-l", "libmock.so", "session", "--no-login"]).unwrap();
        assert!(mock.calls().login.is_empty());
    }
}
