//! Kerberos configuration synthesis and GSSAPI bind orchestration for
//! directory servers.
//!
//! The crate performs no I/O of its own. Network access is supplied by the
//! caller through [`DirectoryDialer`], [`KerberosClientFactory`] and
//! [`SrvResolver`] implementations.

pub mod address;
pub mod bind;
pub mod credentials;
pub mod discovery;
pub mod krb5;
pub mod ldap;
pub mod options;
pub mod sasl;

pub use address::{format_servers_with_port, strip_ldap_scheme};
pub use bind::{
    BindState, DirectoryDialer, GssapiBinder, KerberosClientError, KerberosClientFactory,
    connect_with_gssapi,
};
pub use credentials::Credentials;
pub use discovery::{
    KdcDiscovery, LookupError, SrvResolver, SrvTarget, discover_kdcs, discover_realm,
};
pub use krb5::{
    EncryptionType, KerberosConfig, KerberosConfigError, LibDefaults, RealmEntry,
    build_kerberos_config,
};
pub use options::{
    AuthenticationOptions, ConfigSource, ConfigurationError, KerberosClientSettings, RealmSpec,
};
pub use sasl::{BindError, DirectoryConnection, GssStep, GssapiClient, GssapiError};

/// Classification of a failed bind attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    KerberosClient,
    Bind,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration_error",
            ErrorKind::Transport => "transport_error",
            ErrorKind::KerberosClient => "kerberos_client_error",
            ErrorKind::Bind => "bind_error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid authentication options: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("failed to connect to {address}:{port}: {source}")]
    Transport {
        address: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Kerberos client error: {0}")]
    KerberosClient(#[from] KerberosClientError),

    #[error("GSSAPI bind failed: {0}")]
    Bind(#[from] BindError),
}

impl ConnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Configuration(_) => ErrorKind::Configuration,
            ConnectError::Transport { .. } => ErrorKind::Transport,
            ConnectError::KerberosClient(_) => ErrorKind::KerberosClient,
            ConnectError::Bind(_) => ErrorKind::Bind,
        }
    }
}
