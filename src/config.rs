//! Server configuration.
//!
//! Every option the server recognises lives in [`ServerConfig`]. Values are
//! plain data; [`ServerConfig::validate`] rejects combinations the server
//! cannot run with.

use crate::connection::MIN_BUFFER_SIZE;
use crate::dispatch::DEFAULT_SESSION_COOKIE;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_rustls::rustls::{self, SupportedProtocolVersion};
use tokio_rustls::TlsAcceptor;

/// Errors in the server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("buffer size must be at least {min} bytes, got {got}")]
    BufferTooSmall { got: usize, min: usize },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("session cookie name must not be empty")]
    EmptyCookieName,

    #[error("invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no private key found in {0}")]
    MissingKey(PathBuf),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// Which TLS versions a secured listener negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsProtocol {
    Tls12,
    Tls13,
    #[default]
    Any,
}

impl TlsProtocol {
    fn versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        static TLS12: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
        static TLS13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

        match self {
            TlsProtocol::Tls12 => TLS12,
            TlsProtocol::Tls13 => TLS13,
            TlsProtocol::Any => rustls::ALL_VERSIONS,
        }
    }
}

/// Certificate and key for a secured listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM certificate chain
    pub cert_path: PathBuf,
    /// PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub key_path: PathBuf,
    pub protocol: TlsProtocol,
}

impl TlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            protocol: TlsProtocol::default(),
        }
    }

    /// Loads the certificate chain and key into a handshake acceptor.
    pub fn load_acceptor(&self) -> Result<TlsAcceptor, ConfigError> {
        let mut cert_reader = BufReader::new(open(&self.cert_path)?);
        let cert_chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ConfigError::Io {
                path: self.cert_path.clone(),
                source,
            })?;

        let mut key_reader = BufReader::new(open(&self.key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|source| ConfigError::Io {
                path: self.key_path.clone(),
                source,
            })?
            .ok_or_else(|| ConfigError::MissingKey(self.key_path.clone()))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(self.protocol.versions())?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn open(path: &Path) -> Result<File, ConfigError> {
    File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    /// Pending-connection queue depth passed to `listen`
    pub backlog: u32,
    /// Per-connection read buffer; bounds the request line and each header line
    pub buffer_size: usize,
    /// Requests processed at once before new ones are queued
    pub max_concurrent_requests: usize,
    /// Queued requests beyond which clients get 503
    pub max_queue_size: usize,
    pub session_cookie_name: String,
    /// `Server` header value
    pub server_name: String,
    /// Longest wait for client bytes; `None` disables
    pub idle_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
    /// How long `stop` waits for in-flight work
    pub shutdown_grace: Duration,
    pub max_body_size: u64,
    pub max_headers: usize,
    /// Sessions idle longer than this are swept
    pub session_timeout: Duration,
    pub show_error_details: bool,
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_PORT)),
            backlog: 1024,
            buffer_size: crate::connection::DEFAULT_BUFFER_SIZE,
            max_concurrent_requests: 64,
            max_queue_size: 1024,
            session_cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
            server_name: "portico".to_string(),
            idle_timeout: Some(Duration::from_secs(30)),
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            max_body_size: crate::protocol::parser::DEFAULT_MAX_BODY_SIZE,
            max_headers: crate::protocol::parser::DEFAULT_MAX_HEADERS,
            session_timeout: Duration::from_secs(20 * 60),
            show_error_details: false,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Sets the bind address from `host` and `port`.
    pub fn with_address(mut self, host: &str, port: u16) -> Result<Self, ConfigError> {
        let addr = format!("{}:{}", host, port);
        self.bind_address = addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(addr))?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall {
                got: self.buffer_size,
                min: MIN_BUFFER_SIZE,
            });
        }
        if self.backlog == 0 {
            return Err(ConfigError::Zero("backlog"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Zero("max_concurrent_requests"));
        }
        if self.max_headers == 0 {
            return Err(ConfigError::Zero("max_headers"));
        }
        if self.session_cookie_name.is_empty() {
            return Err(ConfigError::EmptyCookieName);
        }
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_secure());
        assert_eq!(config.session_cookie_name, "__tiny_sessid");
    }

    #[test]
    fn test_small_buffer_rejected() {
        let config = ServerConfig {
            buffer_size: 512,
            ..ServerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferTooSmall { got: 512, min: 1024 })
        ));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = ServerConfig {
            max_concurrent_requests: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
    }

    #[test]
    fn test_empty_cookie_name_rejected() {
        let config = ServerConfig {
            session_cookie_name: String::new(),
            ..ServerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCookieName));
        assert_eq!(err.to_string(), "session cookie name must not be empty");
    }

    #[test]
    fn test_zero_queue_is_allowed() {
        // Every request beyond the concurrency cap is refused
        let config = ServerConfig {
            max_queue_size: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_address() {
        let config = ServerConfig::default().with_address("0.0.0.0", 8080).unwrap();
        assert_eq!(config.bind_address.port(), 8080);

        assert!(matches!(
            ServerConfig::default().with_address("not a host", 80),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_missing_certificate() {
        let tls = TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(tls.load_acceptor(), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_key_file_without_key() {
        let dir = std::env::temp_dir().join(format!("portico-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "not a pem file\n").unwrap();

        let result = TlsConfig::new(&cert, &key).load_acceptor();
        assert!(matches!(result, Err(ConfigError::MissingKey(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
