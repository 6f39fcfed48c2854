use anyhow::Context;
use clap::Parser;
use gssbind_core::krb5::{EncryptionType, DEFAULT_ENCRYPTION_TYPES};
use gssbind_core::{
    discover_realm, AuthenticationOptions, ConfigSource, Credentials, KerberosClientSettings,
    RealmSpec, SrvResolver,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, registry::Registry, EnvFilter};

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Sets up a panic hook so panics end up in the log file.
fn setup_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        tracing::error!("A panic occurred: {}", panic_info);
    }));
}

/// Kerberos GSSAPI bind against a directory server
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory server address, optionally prefixed with ldap://, ldaps:// or ldapi://
    #[arg(short, long, env = "GSSBIND_SERVER")]
    pub server: String,

    #[arg(short, long, env = "GSSBIND_PORT", default_value_t = 389, help = "Directory server port")]
    pub port: u16,

    #[arg(short, long, env = "GSSBIND_USER", help = "User name (account, user@REALM or DOMAIN\\user)")]
    pub username: String,

    #[arg(short = 'P', long, env = "GSSBIND_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Kerberos realm holding the user's account
    #[arg(short, long, env = "GSSBIND_REALM")]
    pub realm: String,

    /// Second domain whose KDCs are discovered alongside the user's realm,
    /// also when the user's realm gets its KDCs from --kdc
    #[arg(long, env = "GSSBIND_TARGET_DOMAIN")]
    pub target_domain: Option<String>,

    /// Existing krb5.conf; disables discovery and configuration synthesis
    #[arg(long, env = "GSSBIND_KRB5_CONFIG", conflicts_with = "kdc")]
    pub krb5_config: Option<PathBuf>,

    /// KDC hosts for the realm; skips SRV discovery when given
    #[arg(long, env = "GSSBIND_KDC", value_delimiter = ',')]
    pub kdc: Vec<String>,

    /// Name servers used for SRV discovery instead of the system resolver
    #[arg(long, env = "GSSBIND_DNS_SERVER", value_delimiter = ',')]
    pub dns_server: Vec<SocketAddr>,

    /// Host part of the service principal; defaults to the server address
    #[arg(long, env = "GSSBIND_SPN_TARGET")]
    pub spn_target: Option<String>,

    /// Permitted encryption types, strongest first
    #[arg(long, env = "GSSBIND_ENCTYPES", value_delimiter = ',')]
    pub enctypes: Vec<EncryptionType>,

    #[arg(long, env = "GSSBIND_CLIENT_COMPUTER_NAME", help = "Client computer name presented to the KDC")]
    pub client_computer_name: Option<String>,

    #[arg(long, env = "GSSBIND_DIAL_TIMEOUT", default_value_t = 10, help = "Connect timeout in seconds")]
    pub dial_timeout: u64,

    /// Print the Kerberos configuration that would be used and exit
    #[arg(long)]
    pub print_config: bool,

    #[arg(long, env = "GSSBIND_LOG_FILE", default_value = "gssbind.log")]
    pub log_file: PathBuf,

    /// Verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, help = "Increase logging verbosity")]
    pub verbose: u8,
}

impl Args {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    /// Whether building the options needs DNS.
    pub fn needs_resolver(&self) -> bool {
        self.krb5_config.is_none() && (self.kdc.is_empty() || self.target_domain().is_some())
    }

    fn target_domain(&self) -> Option<&str> {
        self.target_domain
            .as_deref()
            .map(str::trim)
            .filter(|domain| !domain.is_empty() && !domain.eq_ignore_ascii_case(self.realm.trim()))
    }
}

/// Initialize logging with file output and proper structured logging
pub fn init_logging(verbose_level: u8, log_file: &std::path::Path) -> anyhow::Result<()> {
    setup_panic_hook();

    // Bridge logs from the `log` crate to `tracing`
    LogTracer::init().ok();

    let file = std::fs::File::create(log_file)
        .with_context(|| format!("failed to create log file {}", log_file.display()))?;
    let (nb_writer, guard) = tracing_appender::non_blocking(file);

    if LOG_GUARD.set(guard).is_err() {
        tracing::warn!("LOG_GUARD was already set. This may indicate a problem in initialization.");
    }

    let filter_str = match verbose_level {
        0 => "info,sspi=error,trust_dns_proto=warn,trust_dns_resolver=warn",
        1 => "debug,sspi=warn,trust_dns_proto=info,trust_dns_resolver=info",
        2 => "trace,sspi=info",
        _ => "trace",
    };

    let env_filter = EnvFilter::new(filter_str);

    let subscriber = Registry::default().with(env_filter).with(
        fmt::layer()
            .with_writer(nb_writer)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false)
            .compact(),
    );

    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!("Logging system initialized.");

    Ok(())
}

/// Create authentication options from command line arguments
///
/// `resolver` is only called when SRV discovery is needed.
pub fn create_authentication_options<R, F>(
    args: &Args,
    resolver: F,
) -> anyhow::Result<AuthenticationOptions>
where
    R: SrvResolver,
    F: FnOnce() -> anyhow::Result<R>,
{
    let mut options = if let Some(path) = &args.krb5_config {
        AuthenticationOptions::from_config_file(&args.realm, path.clone())
            .context("invalid Kerberos settings")?
    } else if args.kdc.is_empty() {
        let resolver = resolver()?;
        AuthenticationOptions::discover(&args.realm, args.target_domain.as_deref(), None, &resolver)
            .context("invalid Kerberos settings")?
    } else {
        debug!(kdcs = ?args.kdc, "using KDCs from the command line");
        let mut realms = vec![RealmSpec::builder()
            .realm_name(&args.realm)
            .kdc_hosts(args.kdc.clone())
            .build()];
        if let Some(domain) = args.target_domain() {
            let resolver = resolver()?;
            realms.push(discover_realm(&resolver, domain));
        }
        AuthenticationOptions::builder()
            .default_realm(&args.realm)
            .source(ConfigSource::Realms(realms))
            .build()
    };

    options.service_principal_target = args.spn_target.clone();
    options.encryption_types = if args.enctypes.is_empty() {
        DEFAULT_ENCRYPTION_TYPES.to_vec()
    } else {
        args.enctypes.clone()
    };
    options.client_settings = KerberosClientSettings {
        client_computer_name: args.client_computer_name.clone(),
        ..KerberosClientSettings::default()
    };

    info!(
        realm = %options.default_realm,
        source = options.source.name(),
        enctypes = ?options.encryption_types,
        "authentication options ready"
    );
    Ok(options)
}
