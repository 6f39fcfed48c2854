//! KDC discovery through DNS SRV records.
//!
//! Discovery never fails hard. Its outcome is a [`KdcDiscovery`] value that
//! tells "the domain advertises nothing" apart from "the lookup itself broke",
//! and the configuration builder decides what an empty KDC list means.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tracing::{debug, info, instrument, warn};

use crate::options::{AuthenticationOptions, ConfigSource, ConfigurationError, RealmSpec};

pub const KERBEROS_SERVICE: &str = "kerberos";
pub const KPASSWD_SERVICE: &str = "kpasswd";
pub const TCP: &str = "tcp";

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("no records found")]
    NoRecords,

    #[error("{0}")]
    Failed(String),
}

/// Name resolution used by discovery.
pub trait SrvResolver: Sync {
    /// Resolves an SRV owner name such as `_kerberos._tcp.example.local`.
    fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>, LookupError>;

    fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, LookupError>;
}

/// Outcome of discovering the servers for one service in one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdcDiscovery {
    /// `ip:port` endpoints, in SRV priority order.
    Found(Vec<String>),
    /// The domain publishes no matching SRV records.
    NoneAdvertised,
    /// The SRV query failed, or none of its targets could be resolved.
    LookupFailed(String),
}

impl KdcDiscovery {
    pub fn endpoints(&self) -> &[String] {
        match self {
            Self::Found(endpoints) => endpoints,
            Self::NoneAdvertised | Self::LookupFailed(_) => &[],
        }
    }

    pub fn into_endpoints(self) -> Vec<String> {
        match self {
            Self::Found(endpoints) => endpoints,
            Self::NoneAdvertised | Self::LookupFailed(_) => Vec::new(),
        }
    }
}

/// Resolves `_service._proto.domain` to `ip:port` endpoints.
///
/// A target that fails to resolve is logged and skipped; the remaining
/// targets are still resolved.
#[instrument(level = "debug", skip(resolver))]
pub fn discover_kdcs<R>(resolver: &R, service: &str, proto: &str, domain: &str) -> KdcDiscovery
where
    R: SrvResolver + ?Sized,
{
    let name = format!("_{service}._{proto}.{}", domain.trim_end_matches('.'));

    let mut targets = match resolver.lookup_srv(&name) {
        Ok(targets) => targets,
        Err(LookupError::NoRecords) => {
            warn!(%name, "no SRV records published");
            return KdcDiscovery::NoneAdvertised;
        }
        Err(LookupError::Failed(reason)) => {
            warn!(%name, %reason, "SRV lookup failed");
            return KdcDiscovery::LookupFailed(reason);
        }
    };

    // A lone "." target means the service is explicitly unavailable.
    targets.retain(|srv| !srv.target.trim_end_matches('.').is_empty());
    if targets.is_empty() {
        warn!(%name, "SRV lookup returned no usable targets");
        return KdcDiscovery::NoneAdvertised;
    }

    targets.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));

    let mut endpoints = Vec::new();
    let mut seen = HashSet::new();
    let mut failures = Vec::new();

    for srv in &targets {
        let host = srv.target.trim_end_matches('.');
        let addresses = match host.parse::<IpAddr>() {
            Ok(ip) => Ok(vec![ip]),
            Err(_) => resolver.lookup_host(host),
        };

        match addresses {
            Ok(addresses) if addresses.is_empty() => {
                warn!(%host, "SRV target has no addresses");
                failures.push(format!("{host}: no addresses"));
            }
            Ok(addresses) => {
                for ip in addresses {
                    let endpoint = SocketAddr::new(ip, srv.port).to_string();
                    if seen.insert(endpoint.clone()) {
                        endpoints.push(endpoint);
                    }
                }
            }
            Err(err) => {
                warn!(%host, %err, "failed to resolve SRV target");
                failures.push(format!("{host}: {err}"));
            }
        }
    }

    if endpoints.is_empty() {
        return KdcDiscovery::LookupFailed(failures.join("; "));
    }

    debug!(%name, endpoints = endpoints.len(), "discovered servers");
    KdcDiscovery::Found(endpoints)
}

/// Builds a realm definition whose hosts come from DNS.
///
/// The realm's domain is its lower-cased name. KDCs come from
/// `_kerberos._tcp` and password servers from `_kpasswd._tcp`; an empty
/// kpasswd result leaves the builder to fall back to the KDCs.
pub fn discover_realm<R>(resolver: &R, realm_name: &str) -> RealmSpec
where
    R: SrvResolver + ?Sized,
{
    let domain = realm_name.trim().to_lowercase();
    let kdcs = discover_kdcs(resolver, KERBEROS_SERVICE, TCP, &domain);
    let kpasswd = discover_kdcs(resolver, KPASSWD_SERVICE, TCP, &domain);

    info!(
        realm = %realm_name,
        kdcs = kdcs.endpoints().len(),
        kpasswd = kpasswd.endpoints().len(),
        "realm discovery finished"
    );

    RealmSpec::builder()
        .realm_name(realm_name)
        .kdc_hosts(kdcs.endpoints().to_vec())
        .kpasswd_hosts(kpasswd.into_endpoints())
        .default_domain(domain)
        .kdc_discovery(kdcs)
        .build()
}

impl AuthenticationOptions {
    /// Options that read everything from an existing krb5.conf.
    pub fn from_config_file(default_realm: &str, path: PathBuf) -> Result<Self, ConfigurationError> {
        let default_realm = default_realm.trim();
        if default_realm.is_empty() {
            return Err(ConfigurationError::MissingRealm);
        }
        if path.as_os_str().is_empty() {
            return Err(ConfigurationError::EmptyConfigFilePath);
        }
        Ok(Self::builder()
            .default_realm(default_realm)
            .source(ConfigSource::File(path))
            .build())
    }

    /// Assembles options the way an operator typically supplies them.
    ///
    /// A config file wins outright. Otherwise the default realm is discovered
    /// through DNS, plus `target_domain` as a second realm when it names a
    /// different domain. The two realms are discovered concurrently.
    pub fn discover<R>(
        default_realm: &str,
        target_domain: Option<&str>,
        config_file: Option<PathBuf>,
        resolver: &R,
    ) -> Result<Self, ConfigurationError>
    where
        R: SrvResolver,
    {
        if let Some(path) = config_file {
            return Self::from_config_file(default_realm, path);
        }

        let default_realm = default_realm.trim();
        if default_realm.is_empty() {
            return Err(ConfigurationError::MissingRealm);
        }

        let secondary = target_domain
            .map(str::trim)
            .filter(|domain| !domain.is_empty() && !domain.eq_ignore_ascii_case(default_realm));

        let realms = std::thread::scope(|scope| {
            let secondary = secondary.map(|domain| scope.spawn(move || discover_realm(resolver, domain)));
            let mut realms = vec![discover_realm(resolver, default_realm)];

            if let Some(handle) = secondary {
                match handle.join() {
                    Ok(spec) => realms.push(spec),
                    Err(_) => warn!("secondary realm discovery panicked; continuing with one realm"),
                }
            }
            realms
        });

        Ok(Self::builder()
            .default_realm(default_realm)
            .source(ConfigSource::Realms(realms))
            .build())
    }
}
