use std::path::PathBuf;

use typed_builder::TypedBuilder;

use crate::discovery::KdcDiscovery;
use crate::krb5::{DEFAULT_ENCRYPTION_TYPES, EncryptionType};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Kerberos realm is required for GSSAPI authentication")]
    MissingRealm,

    #[error("at least one Kerberos realm is required when no krb5.conf is supplied")]
    EmptyRealmList,

    #[error("Kerberos config file path is empty")]
    EmptyConfigFilePath,

    #[error("a krb5.conf path and an explicit realm list are mutually exclusive")]
    ConflictingSources,

    #[error("invalid realm name: {0:?}")]
    InvalidRealmName(String),

    #[error("at least one encryption type must be permitted")]
    NoEncryptionTypes,
}

/// One Kerberos realm definition.
///
/// Realm names are stored upper-case. Empty host lists are filled in by the
/// configuration builder: admin and kpasswd servers fall back to the KDCs and
/// the default domain falls back to the lower-cased realm name.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct RealmSpec {
    #[builder(setter(transform = |name: &str| name.trim().to_uppercase()))]
    pub realm_name: String,

    #[builder(default)]
    pub kdc_hosts: Vec<String>,

    #[builder(default)]
    pub admin_server_hosts: Vec<String>,

    #[builder(default)]
    pub kpasswd_hosts: Vec<String>,

    #[builder(default, setter(into))]
    pub default_domain: String,

    #[builder(default)]
    pub master_kdc_hosts: Vec<String>,

    /// How `kdc_hosts` was obtained, when it came from DNS.
    #[builder(default, setter(strip_option))]
    pub kdc_discovery: Option<KdcDiscovery>,
}

/// Where the Kerberos client gets its configuration from.
///
/// Exactly one source is active for a bind attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// An existing krb5.conf on disk.
    File(PathBuf),
    /// Realms to synthesize an in-memory configuration from.
    Realms(Vec<RealmSpec>),
}

impl ConfigSource {
    /// Picks the source from loosely specified inputs, rejecting both or neither.
    pub fn from_parts(
        config_file: Option<PathBuf>,
        realms: Vec<RealmSpec>,
    ) -> Result<Self, ConfigurationError> {
        match (config_file, realms.is_empty()) {
            (Some(_), false) => Err(ConfigurationError::ConflictingSources),
            (Some(path), true) => Ok(Self::File(path)),
            (None, false) => Ok(Self::Realms(realms)),
            (None, true) => Err(ConfigurationError::EmptyRealmList),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "File",
            Self::Realms(_) => "Realms",
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::File(path) if path.as_os_str().is_empty() => {
                Err(ConfigurationError::EmptyConfigFilePath)
            }
            Self::File(_) => Ok(()),
            Self::Realms(realms) if realms.is_empty() => Err(ConfigurationError::EmptyRealmList),
            Self::Realms(realms) => realms
                .iter()
                .find(|realm| realm.realm_name.trim().is_empty())
                .map_or(Ok(()), |realm| {
                    Err(ConfigurationError::InvalidRealmName(realm.realm_name.clone()))
                }),
        }
    }
}

/// Knobs passed through to the Kerberos client implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KerberosClientSettings {
    /// Skip the PA-FX-FAST pre-authentication extension; some domain
    /// controllers reject requests that carry it.
    pub disable_pa_fx_fast: bool,

    /// Workstation name presented to the KDC. The local host name is used when unset.
    pub client_computer_name: Option<String>,
}

impl Default for KerberosClientSettings {
    fn default() -> Self {
        Self {
            disable_pa_fx_fast: true,
            client_computer_name: None,
        }
    }
}

/// Normalized input to a GSSAPI bind attempt.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct AuthenticationOptions {
    /// Realm holding the user's credentials, stored upper-case.
    #[builder(setter(transform = |realm: &str| realm.trim().to_uppercase()))]
    pub default_realm: String,

    pub source: ConfigSource,

    /// Host part of the target SPN; the directory server address is used when unset.
    #[builder(default, setter(strip_option, into))]
    pub service_principal_target: Option<String>,

    /// Ticket and permitted encryption types, strongest first.
    #[builder(default = DEFAULT_ENCRYPTION_TYPES.to_vec())]
    pub encryption_types: Vec<EncryptionType>,

    #[builder(default)]
    pub client_settings: KerberosClientSettings,
}

impl AuthenticationOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.default_realm.trim().is_empty() {
            return Err(ConfigurationError::MissingRealm);
        }
        // A krb5.conf file carries its own enctype lists.
        if matches!(self.source, ConfigSource::Realms(_)) && self.encryption_types.is_empty() {
            return Err(ConfigurationError::NoEncryptionTypes);
        }
        self.source.validate()
    }

    /// `ldap/<target>` where target defaults to `server_host`.
    pub fn service_principal_name(&self, server_host: &str) -> String {
        let target = self
            .service_principal_target
            .as_deref()
            .filter(|target| !target.trim().is_empty())
            .unwrap_or(server_host);
        format!("ldap/{target}")
    }
}
