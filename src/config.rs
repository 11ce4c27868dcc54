//! Settings consumed by the privilege separation core.
//!
//! Loading a configuration file is left to the caller; any serde
//! format can produce a [`Config`].  Missing fields take the defaults
//! of a classic anonymous-only server.

use crate::{error::Error, sandbox, secutil::lookup_user, session::Identities};
use serde_derive::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub anonymous_enable: bool,
    pub local_enable: bool,
    pub write_enable: bool,
    pub anon_upload_enable: bool,
    pub anon_mkdir_write_enable: bool,
    pub anon_other_write_enable: bool,
    /// Re-own anonymous uploads to `chown_username`.
    pub chown_uploads: bool,
    pub chown_username: String,
    /// Local account used for anonymous sessions.
    pub ftp_username: String,
    /// Map every real login to `guest_username`.
    pub guest_enable: bool,
    pub guest_username: String,
    /// Unprivileged account for pre-login processing and the brokers.
    pub nopriv_user: String,
    /// Empty, non-writable jail directory.
    pub secure_chroot_dir: PathBuf,
    /// Root directory of anonymous sessions.
    pub anon_root: Option<PathBuf>,
    pub chroot_local_user: bool,
    pub ssl_enable: bool,
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
    pub port_enable: bool,
    pub pasv_enable: bool,
    pub connect_from_port_20: bool,
    pub ftp_data_port: u16,
    pub pasv_min_port: u16,
    pub pasv_max_port: u16,
    /// Accept passive data connections from any address.
    pub pasv_promiscuous: bool,
    pub port_promiscuous: bool,
    /// Seconds.
    pub accept_timeout: u64,
    /// Seconds.
    pub connect_timeout: u64,
    /// Seconds.
    pub delay_failed_login: u64,
    /// Seconds.
    pub delay_successful_login: u64,
    /// Run the untrusted processes under the ptrace sandbox.
    pub sandbox_enable: bool,
    pub one_process_model: bool,
    pub mdtm_write: bool,
    pub chmod_enable: bool,
    pub syslog_enable: bool,
    /// `RLIMIT_NOFILE` of the untrusted processes.
    pub max_files: Option<u64>,
    /// Anonymous passwords (e-mail addresses) that are refused.
    pub banned_emails: Vec<String>,
    /// If not empty, the only anonymous passwords that are accepted.
    pub email_passwords: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            anonymous_enable: true,
            local_enable: false,
            write_enable: false,
            anon_upload_enable: false,
            anon_mkdir_write_enable: false,
            anon_other_write_enable: false,
            chown_uploads: false,
            chown_username: "root".to_string(),
            ftp_username: "ftp".to_string(),
            guest_enable: false,
            guest_username: "ftp".to_string(),
            nopriv_user: "nobody".to_string(),
            secure_chroot_dir: PathBuf::from("/usr/share/empty"),
            anon_root: None,
            chroot_local_user: false,
            ssl_enable: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            port_enable: true,
            pasv_enable: true,
            connect_from_port_20: false,
            ftp_data_port: 20,
            pasv_min_port: 0,
            pasv_max_port: 0,
            pasv_promiscuous: false,
            port_promiscuous: false,
            accept_timeout: 60,
            connect_timeout: 60,
            delay_failed_login: 1,
            delay_successful_login: 0,
            sandbox_enable: false,
            one_process_model: false,
            mdtm_write: true,
            chmod_enable: true,
            syslog_enable: false,
            max_files: None,
            banned_emails: vec![],
            email_passwords: vec![],
        }
    }
}

impl Config {
    /// Startup checks; every failure here is fatal before serving.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.anonymous_enable && !self.local_enable {
            return Err(Error::Config(
                "neither anonymous_enable nor local_enable is set".into(),
            ));
        }
        if self.one_process_model && (self.local_enable || self.guest_enable) {
            return Err(Error::Config(
                "one_process_model only supports anonymous sessions".into(),
            ));
        }
        if self.one_process_model
            && (self.connect_from_port_20 || self.port_promiscuous || self.chown_uploads)
        {
            return Err(Error::Config(
                "one_process_model has no privileges for reserved ports, foreign hosts or chown"
                    .into(),
            ));
        }
        if self.connect_from_port_20 && self.ftp_data_port == 0 {
            return Err(Error::Config("invalid ftp_data_port".into()));
        }
        if self.pasv_min_port != 0
            && self.pasv_max_port != 0
            && self.pasv_min_port > self.pasv_max_port
        {
            return Err(Error::Config(
                "pasv_min_port is larger than pasv_max_port".into(),
            ));
        }
        if self.ssl_enable && cfg!(feature = "tls") && self.ssl_cert_file.is_none() {
            return Err(Error::Config("ssl_enable requires ssl_cert_file".into()));
        }
        if self.sandbox_enable && !sandbox::is_available() {
            return Err(Error::SandboxUnavailable);
        }
        if !self.secure_chroot_dir.is_dir() {
            return Err(Error::Config(format!(
                "secure_chroot_dir {} is not a directory",
                self.secure_chroot_dir.display()
            )));
        }
        lookup_user(&self.nopriv_user)?;
        Identities::resolve(self)?;
        Ok(())
    }

    /// Settings that allow anonymous sessions to modify the filesystem.
    pub fn anon_writes(&self) -> bool {
        self.anon_upload_enable || self.anon_mkdir_write_enable || self.anon_other_write_enable
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl From<&Config> for ftp_privsep_log::Config {
    fn from(config: &Config) -> Self {
        (!config.syslog_enable).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            secure_chroot_dir: PathBuf::from("/"),
            nopriv_user: "root".to_string(),
            ftp_username: "root".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_is_valid() {
        config().validate().unwrap();
    }

    #[test]
    fn test_log_target() {
        let log = ftp_privsep_log::Config::from(&config());
        assert!(log.foreground);
        assert_eq!(log.filter, "info");

        let syslog = Config {
            syslog_enable: true,
            ..config()
        };
        assert!(!ftp_privsep_log::Config::from(&syslog).foreground);
    }

    #[test]
    fn test_one_process_is_anonymous_only() {
        let config = Config {
            one_process_model: true,
            local_enable: true,
            ..config()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_pasv_range() {
        let config = Config {
            pasv_min_port: 50000,
            pasv_max_port: 40000,
            ..config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_jail() {
        let config = Config {
            secure_chroot_dir: PathBuf::from("/nonexistent/jail/dir"),
            ..config()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_identity() {
        let config = Config {
            chown_uploads: true,
            chown_username: "no-such-ftp-user".to_string(),
            ..config()
        };
        assert!(matches!(config.validate(), Err(Error::UserNotFound(_))));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config = serde_json::from_str(r#"{"anon_upload_enable": true}"#).unwrap();
        assert!(config.anon_writes());
        assert_eq!(config.ftp_username, "ftp");
    }
}
