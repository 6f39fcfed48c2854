//! In-memory Kerberos client configuration.
//!
//! [`KerberosConfig`] is an immutable value produced either by
//! [`build_kerberos_config`] from realm specs or by parsing a krb5.conf file.
//! It renders back to krb5.conf syntax through `Display`.

use std::collections::BTreeMap;
use std::time::Duration;

pub mod builder;
pub mod enctype;
pub mod parse;
pub mod render;
pub mod request;

pub use builder::build_kerberos_config;
pub use enctype::{DEFAULT_ENCRYPTION_TYPES, EncryptionType, UnknownEncryptionType};
pub use parse::ParseError;
pub use request::{KdcRequest, KdcRequestKind};

use crate::discovery::KdcDiscovery;

#[derive(Debug, thiserror::Error)]
pub enum KerberosConfigError {
    #[error("at least one realm is required to build a Kerberos configuration")]
    NoRealms,

    #[error("at least one encryption type must be permitted")]
    NoEncryptionTypes,

    #[error("realm {realm} has no usable KDC ({})", describe_discovery(.discovery.as_ref()))]
    NoKdc {
        realm: String,
        discovery: Option<KdcDiscovery>,
    },

    #[error("failed to read Kerberos config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid Kerberos config file {path}: {source}")]
    Parse { path: String, source: ParseError },

    #[error("default realm {0} is not defined in the configuration")]
    UnknownRealm(String),
}

fn describe_discovery(discovery: Option<&KdcDiscovery>) -> String {
    match discovery {
        None => "no KDC hosts given and discovery was not attempted".to_owned(),
        Some(KdcDiscovery::Found(_)) => "discovered KDC list was empty".to_owned(),
        Some(KdcDiscovery::NoneAdvertised) => "DNS advertises no KDC for the domain".to_owned(),
        Some(KdcDiscovery::LookupFailed(reason)) => format!("KDC discovery failed: {reason}"),
    }
}

/// Library-wide defaults (`[libdefaults]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibDefaults {
    pub default_realm: String,
    pub allow_weak_crypto: bool,
    pub dns_lookup_realm: bool,
    pub dns_lookup_kdc: bool,
    pub ticket_lifetime: Duration,
    pub renew_lifetime: Duration,
    pub forwardable: bool,
    pub proxiable: bool,
    pub rdns: bool,
    /// Messages larger than this go over TCP; 1 forces TCP for everything.
    pub udp_preference_limit: u32,
    pub default_tgs_enctypes: Vec<EncryptionType>,
    pub default_tkt_enctypes: Vec<EncryptionType>,
    pub permitted_enctypes: Vec<EncryptionType>,
    pub preferred_preauth_types: Vec<i32>,
}

impl Default for LibDefaults {
    /// MIT krb5 documented defaults.
    fn default() -> Self {
        Self {
            default_realm: String::new(),
            allow_weak_crypto: false,
            dns_lookup_realm: false,
            dns_lookup_kdc: true,
            ticket_lifetime: Duration::from_secs(24 * 60 * 60),
            renew_lifetime: Duration::ZERO,
            forwardable: false,
            proxiable: false,
            rdns: true,
            udp_preference_limit: 1465,
            default_tgs_enctypes: DEFAULT_ENCRYPTION_TYPES.to_vec(),
            default_tkt_enctypes: DEFAULT_ENCRYPTION_TYPES.to_vec(),
            permitted_enctypes: DEFAULT_ENCRYPTION_TYPES.to_vec(),
            preferred_preauth_types: vec![17, 16, 15, 14],
        }
    }
}

impl LibDefaults {
    /// Whether the configuration asks for every KDC exchange to use TCP.
    pub fn prefers_tcp(&self) -> bool {
        self.udp_preference_limit <= 1
    }

    pub fn permitted_enctype_ids(&self) -> Vec<i32> {
        self.permitted_enctypes.iter().map(|e| e.id()).collect()
    }

    pub fn default_tgs_enctype_ids(&self) -> Vec<i32> {
        self.default_tgs_enctypes.iter().map(|e| e.id()).collect()
    }

    pub fn default_tkt_enctype_ids(&self) -> Vec<i32> {
        self.default_tkt_enctypes.iter().map(|e| e.id()).collect()
    }
}

/// One `[realms]` entry. Server lists carry explicit ports where the builder added them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RealmEntry {
    pub realm: String,
    pub kdc: Vec<String>,
    pub admin_server: Vec<String>,
    pub kpasswd_server: Vec<String>,
    pub master_kdc: Vec<String>,
    pub default_domain: String,
}

/// Complete Kerberos client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KerberosConfig {
    pub lib_defaults: LibDefaults,
    pub realms: Vec<RealmEntry>,
    /// Domain (or `.domain` suffix) to realm name.
    pub domain_realm: BTreeMap<String, String>,
}

impl KerberosConfig {
    /// Looks up a realm entry, ignoring case.
    pub fn realm(&self, name: &str) -> Option<&RealmEntry> {
        self.realms
            .iter()
            .find(|entry| entry.realm.eq_ignore_ascii_case(name))
    }

    /// Resolves a host name to its realm through `[domain_realm]`.
    ///
    /// Exact host matches win; otherwise the longest matching `.suffix`.
    pub fn realm_for_host(&self, host: &str) -> Option<&str> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(realm) = self.domain_realm.get(&host) {
            return Some(realm);
        }

        let mut suffix = host.as_str();
        while let Some(position) = suffix.find('.') {
            let dotted = &suffix[position..];
            if let Some(realm) = self.domain_realm.get(dotted) {
                return Some(realm);
            }
            suffix = &suffix[position + 1..];
        }
        None
    }
}
