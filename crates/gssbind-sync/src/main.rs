mod config;

use anyhow::Context;
use clap::Parser;
use gssbind_core::{build_kerberos_config, AuthenticationOptions, ConfigSource, KerberosConfig};
use gssbind_sync::SystemResolver;
use tracing::{error, info, instrument};

use config::{create_authentication_options, init_logging, Args};

#[instrument(name = "main", level = "info", skip_all)]
fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // If logging cannot be set up there is nowhere to report later failures.
    if let Err(e) = init_logging(args.verbose, &args.log_file) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run_app(&args) {
        error!("gssbind failed: {:?}", e);
        return Err(e);
    }

    Ok(())
}

fn run_app(args: &Args) -> anyhow::Result<()> {
    info!(
        server = %args.server,
        port = args.port,
        username = %args.username,
        realm = %args.realm,
        discovery = args.needs_resolver(),
        "starting GSSAPI bind"
    );

    let options = create_authentication_options(args, || {
        let resolver = if args.dns_server.is_empty() {
            SystemResolver::from_system_conf()
        } else {
            SystemResolver::with_name_servers(&args.dns_server)
        };
        resolver.context("failed to set up DNS resolver")
    })?;

    if args.print_config {
        let config = effective_config(&options)?;
        print!("{config}");
        return Ok(());
    }

    match gssbind_sync::connect_with_gssapi(
        &args.server,
        args.port,
        &args.credentials(),
        args.dial_timeout(),
        &options,
    ) {
        Ok(connection) => {
            info!(peer = %connection.peer_addr(), "bind succeeded");
            println!(
                "Bound to {} as {} using GSSAPI",
                connection.peer_addr(),
                args.username
            );
            connection.unbind();
            Ok(())
        }
        Err(err) => {
            eprintln!("{}: {err}", err.kind().code());
            Err(err).context("GSSAPI bind failed")
        }
    }
}

/// The Kerberos configuration the bind would use.
fn effective_config(options: &AuthenticationOptions) -> anyhow::Result<KerberosConfig> {
    let config = match &options.source {
        ConfigSource::File(path) => KerberosConfig::load(path)?,
        ConfigSource::Realms(realms) => build_kerberos_config(
            &options.default_realm,
            realms,
            &options.encryption_types,
        )?,
    };
    Ok(config)
}
