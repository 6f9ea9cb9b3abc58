use std::env;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use log::warn;
use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 2052;
const DEFAULT_TLS_CERT: &str = "ssl/chat/certificate.pem";
const DEFAULT_TLS_KEY: &str = "ssl/chat/private.key";
const DEFAULT_STATIC_DIR: &str = "public";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid bind address '{0}'")]
    InvalidBindAddr(String),
    #[error("Invalid port '{0}'")]
    InvalidPort(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub static_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind = lookup("CHAT_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr: IpAddr = bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(bind.clone()))?;

        let port = match lookup("CHAT_PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
            None => DEFAULT_PORT,
        };

        Ok(Config {
            bind_addr,
            port,
            tls_cert: lookup("CHAT_TLS_CERT").map_or_else(|| DEFAULT_TLS_CERT.into(), PathBuf::from),
            tls_key: lookup("CHAT_TLS_KEY").map_or_else(|| DEFAULT_TLS_KEY.into(), PathBuf::from),
            static_dir: lookup("CHAT_STATIC_DIR")
                .map_or_else(|| DEFAULT_STATIC_DIR.into(), PathBuf::from),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// True when both PEM files exist and hold a certificate and a key.
    pub fn tls_available(&self) -> bool {
        let cert_file = match File::open(&self.tls_cert) {
            Ok(file) => file,
            Err(e) => {
                warn!("Failed to open certificate file {}: {}", self.tls_cert.display(), e);
                return false;
            }
        };
        let key_file = match File::open(&self.tls_key) {
            Ok(file) => file,
            Err(e) => {
                warn!("Failed to open private key file {}: {}", self.tls_key.display(), e);
                return false;
            }
        };

        let certs: Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect();
        match certs {
            Ok(certs) if !certs.is_empty() => {}
            Ok(_) => {
                warn!("No certificates in {}", self.tls_cert.display());
                return false;
            }
            Err(e) => {
                warn!("Failed to parse certificate: {}", e);
                return false;
            }
        }

        match rustls_pemfile::private_key(&mut BufReader::new(key_file)) {
            Ok(Some(_)) => true,
            Ok(None) => {
                warn!("No private key in {}", self.tls_key.display());
                false
            }
            Err(e) => {
                warn!("Failed to parse private key: {}", e);
                false
            }
        }
    }
}
