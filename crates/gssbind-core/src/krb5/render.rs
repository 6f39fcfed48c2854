use std::fmt::{self, Display};
use std::time::Duration;

use super::{EncryptionType, KerberosConfig};

impl Display for KerberosConfig {
    /// Renders the configuration as krb5.conf text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let defaults = &self.lib_defaults;

        writeln!(f, "[libdefaults]")?;
        if !defaults.default_realm.is_empty() {
            writeln!(f, "    default_realm = {}", defaults.default_realm)?;
        }
        writeln!(f, "    allow_weak_crypto = {}", defaults.allow_weak_crypto)?;
        writeln!(f, "    dns_lookup_realm = {}", defaults.dns_lookup_realm)?;
        writeln!(f, "    dns_lookup_kdc = {}", defaults.dns_lookup_kdc)?;
        writeln!(f, "    ticket_lifetime = {}", seconds(defaults.ticket_lifetime))?;
        writeln!(f, "    renew_lifetime = {}", seconds(defaults.renew_lifetime))?;
        writeln!(f, "    forwardable = {}", defaults.forwardable)?;
        writeln!(f, "    proxiable = {}", defaults.proxiable)?;
        writeln!(f, "    rdns = {}", defaults.rdns)?;
        writeln!(f, "    udp_preference_limit = {}", defaults.udp_preference_limit)?;
        write_enctypes(f, "default_tgs_enctypes", &defaults.default_tgs_enctypes)?;
        write_enctypes(f, "default_tkt_enctypes", &defaults.default_tkt_enctypes)?;
        write_enctypes(f, "permitted_enctypes", &defaults.permitted_enctypes)?;
        if !defaults.preferred_preauth_types.is_empty() {
            let preauth = defaults
                .preferred_preauth_types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "    preferred_preauth_types = {preauth}")?;
        }

        writeln!(f)?;
        writeln!(f, "[realms]")?;
        for realm in &self.realms {
            writeln!(f, "    {} = {{", realm.realm)?;
            write_servers(f, "kdc", &realm.kdc)?;
            write_servers(f, "admin_server", &realm.admin_server)?;
            write_servers(f, "kpasswd_server", &realm.kpasswd_server)?;
            write_servers(f, "master_kdc", &realm.master_kdc)?;
            if !realm.default_domain.is_empty() {
                writeln!(f, "        default_domain = {}", realm.default_domain)?;
            }
            writeln!(f, "    }}")?;
        }

        writeln!(f)?;
        writeln!(f, "[domain_realm]")?;
        for (domain, realm) in &self.domain_realm {
            writeln!(f, "    {domain} = {realm}")?;
        }

        Ok(())
    }
}

fn write_servers(f: &mut fmt::Formatter<'_>, key: &str, servers: &[String]) -> fmt::Result {
    for server in servers {
        writeln!(f, "        {key} = {server}")?;
    }
    Ok(())
}

fn seconds(duration: Duration) -> u64 {
    duration.as_secs()
}

fn write_enctypes(f: &mut fmt::Formatter<'_>, key: &str, types: &[EncryptionType]) -> fmt::Result {
    write!(f, "    {key} =")?;
    for etype in types {
        write!(f, " {etype}")?;
    }
    writeln!(f)
}
