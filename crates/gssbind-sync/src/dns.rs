use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use gssbind_core::discovery::{LookupError, SrvResolver, SrvTarget};
use tracing::{debug, instrument};
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::system_conf::read_system_conf;
use trust_dns_resolver::Resolver;

/// Blocking DNS resolver used for KDC discovery.
///
/// A blocking `Resolver` runs one query at a time, so concurrent lookups
/// each take an idle resolver from the pool or build their own.
pub struct SystemResolver {
    config: ResolverConfig,
    opts: ResolverOpts,
    idle: Mutex<Vec<Resolver>>,
}

impl std::fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemResolver")
            .field("name_servers", &self.config.name_servers().len())
            .finish_non_exhaustive()
    }
}

impl SystemResolver {
    fn new(config: ResolverConfig, opts: ResolverOpts) -> Result<Self, ResolveError> {
        let first = Resolver::new(config.clone(), opts.clone()).map_err(ResolveError::from)?;
        Ok(Self {
            config,
            opts,
            idle: Mutex::new(vec![first]),
        })
    }

    /// Uses the host's resolver configuration (`/etc/resolv.conf` or the registry).
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        let (config, opts) = read_system_conf().map_err(ResolveError::from)?;
        Self::new(config, opts)
    }

    /// Queries the given name servers instead of the system ones, typically
    /// the domain controllers themselves.
    pub fn with_name_servers(servers: &[SocketAddr]) -> Result<Self, ResolveError> {
        let mut config = ResolverConfig::new();
        for server in servers {
            config.add_name_server(NameServerConfig::new(*server, Protocol::Udp));
            config.add_name_server(NameServerConfig::new(*server, Protocol::Tcp));
        }

        Self::new(config, ResolverOpts::default())
    }

    fn with_resolver<T>(
        &self,
        query: impl FnOnce(&Resolver) -> Result<T, ResolveError>,
    ) -> Result<T, LookupError> {
        let pooled = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let resolver = match pooled {
            Some(resolver) => resolver,
            None => {
                debug!("all resolvers busy, creating another");
                Resolver::new(self.config.clone(), self.opts.clone())
                    .map_err(|err| LookupError::Failed(err.to_string()))?
            }
        };

        let result = query(&resolver).map_err(lookup_error);
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(resolver);
        }
        result
    }
}

impl SrvResolver for SystemResolver {
    #[instrument(level = "debug", skip(self))]
    fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>, LookupError> {
        let lookup = self.with_resolver(|resolver| resolver.srv_lookup(name))?;
        let targets: Vec<_> = lookup
            .iter()
            .map(|srv| SrvTarget {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8(),
            })
            .collect();

        debug!(count = targets.len(), "SRV answer");
        Ok(targets)
    }

    #[instrument(level = "debug", skip(self))]
    fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        let lookup = self.with_resolver(|resolver| resolver.lookup_ip(host))?;
        Ok(lookup.iter().collect())
    }
}

fn lookup_error(err: ResolveError) -> LookupError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => LookupError::NoRecords,
        _ => LookupError::Failed(err.to_string()),
    }
}
