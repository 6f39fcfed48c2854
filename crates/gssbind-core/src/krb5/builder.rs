use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use super::{EncryptionType, KerberosConfig, KerberosConfigError, LibDefaults, RealmEntry};
use crate::address::{KDC_PORT, KPASSWD_PORT, format_servers_with_port};
use crate::options::RealmSpec;

const TICKET_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
const RENEW_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Synthesizes a Kerberos client configuration from already-resolved realm data.
///
/// The function is pure: it performs no DNS lookups and touches no shared
/// state, so the same inputs always produce the same configuration. Realms
/// whose KDC list is empty are rejected with [`KerberosConfigError::NoKdc`];
/// filling that list is the job of whoever assembled the [`RealmSpec`]s.
pub fn build_kerberos_config(
    default_realm: &str,
    realms: &[RealmSpec],
    encryption_types: &[EncryptionType],
) -> Result<KerberosConfig, KerberosConfigError> {
    if realms.is_empty() {
        return Err(KerberosConfigError::NoRealms);
    }
    if encryption_types.is_empty() {
        return Err(KerberosConfigError::NoEncryptionTypes);
    }

    let lib_defaults = lib_defaults(default_realm, encryption_types);

    let realm_entries = realms
        .iter()
        .map(realm_entry)
        .collect::<Result<Vec<_>, _>>()?;

    let mut domain_realm = BTreeMap::new();
    for entry in &realm_entries {
        register_domain_mappings(&mut domain_realm, entry);
    }

    debug!(
        default_realm = %lib_defaults.default_realm,
        realms = realm_entries.len(),
        mappings = domain_realm.len(),
        "built Kerberos configuration"
    );

    Ok(KerberosConfig {
        lib_defaults,
        realms: realm_entries,
        domain_realm,
    })
}

fn lib_defaults(default_realm: &str, encryption_types: &[EncryptionType]) -> LibDefaults {
    let enctypes = encryption_types.to_vec();
    LibDefaults {
        default_realm: default_realm.trim().to_uppercase(),
        // Older domain controllers still issue RC4 tickets.
        allow_weak_crypto: true,
        dns_lookup_realm: false,
        dns_lookup_kdc: false,
        ticket_lifetime: TICKET_LIFETIME,
        renew_lifetime: RENEW_LIFETIME,
        forwardable: true,
        proxiable: true,
        rdns: false,
        // UDP fragments get dropped by firewalls in front of DCs.
        udp_preference_limit: 1,
        preferred_preauth_types: enctypes.iter().map(|e| e.id()).collect(),
        default_tgs_enctypes: enctypes.clone(),
        default_tkt_enctypes: enctypes.clone(),
        permitted_enctypes: enctypes,
    }
}

fn realm_entry(spec: &RealmSpec) -> Result<RealmEntry, KerberosConfigError> {
    let realm = spec.realm_name.trim().to_uppercase();

    if spec.kdc_hosts.is_empty() {
        return Err(KerberosConfigError::NoKdc {
            realm,
            discovery: spec.kdc_discovery.clone(),
        });
    }

    let admin_server = or_kdcs(&spec.admin_server_hosts, &spec.kdc_hosts);
    let kpasswd_hosts = or_kdcs(&spec.kpasswd_hosts, &spec.kdc_hosts);
    let master_kdc = or_kdcs(&spec.master_kdc_hosts, &spec.kdc_hosts);

    let default_domain = if spec.default_domain.trim().is_empty() {
        realm.to_lowercase()
    } else {
        spec.default_domain.trim().to_lowercase()
    };

    Ok(RealmEntry {
        kdc: format_servers_with_port(&spec.kdc_hosts, KDC_PORT),
        kpasswd_server: format_servers_with_port(&kpasswd_hosts, KPASSWD_PORT),
        admin_server,
        master_kdc,
        default_domain,
        realm,
    })
}

fn or_kdcs(hosts: &[String], kdcs: &[String]) -> Vec<String> {
    if hosts.is_empty() {
        kdcs.to_vec()
    } else {
        hosts.to_vec()
    }
}

fn register_domain_mappings(domain_realm: &mut BTreeMap<String, String>, entry: &RealmEntry) {
    let lower_realm = entry.realm.to_lowercase();
    insert_domain(domain_realm, &lower_realm, &entry.realm);

    if entry.default_domain != lower_realm {
        insert_domain(domain_realm, &entry.default_domain, &entry.realm);
    }
}

fn insert_domain(domain_realm: &mut BTreeMap<String, String>, domain: &str, realm: &str) {
    domain_realm.insert(domain.to_owned(), realm.to_owned());
    domain_realm.insert(format!(".{domain}"), realm.to_owned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::KdcDiscovery;
    use crate::krb5::DEFAULT_ENCRYPTION_TYPES;

    fn spec(name: &str, kdcs: &[&str]) -> RealmSpec {
        RealmSpec::builder()
            .realm_name(name)
            .kdc_hosts(kdcs.iter().map(ToString::to_string).collect())
            .build()
    }

    #[test]
    fn single_realm_scenario() {
        let config = build_kerberos_config(
            "EXAMPLE.LOCAL",
            &[spec("EXAMPLE.LOCAL", &["10.0.0.1"])],
            &DEFAULT_ENCRYPTION_TYPES,
        )
        .unwrap();

        assert_eq!(config.realms.len(), 1);
        let realm = &config.realms[0];
        assert_eq!(realm.kdc, ["10.0.0.1:88"]);
        assert_eq!(realm.kpasswd_server, ["10.0.0.1:464"]);
        assert_eq!(realm.admin_server, ["10.0.0.1"]);
        assert_eq!(realm.master_kdc, ["10.0.0.1"]);
        assert_eq!(realm.default_domain, "example.local");

        assert_eq!(config.domain_realm.len(), 2);
        assert_eq!(config.domain_realm["example.local"], "EXAMPLE.LOCAL");
        assert_eq!(config.domain_realm[".example.local"], "EXAMPLE.LOCAL");
    }

    #[test]
    fn lib_defaults_force_tcp_and_fixed_lifetimes() {
        let config = build_kerberos_config(
            "example.local",
            &[spec("example.local", &["dc1"])],
            &DEFAULT_ENCRYPTION_TYPES,
        )
        .unwrap();
        let defaults = &config.lib_defaults;

        assert_eq!(defaults.default_realm, "EXAMPLE.LOCAL");
        assert!(defaults.allow_weak_crypto);
        assert!(!defaults.dns_lookup_kdc);
        assert!(!defaults.dns_lookup_realm);
        assert!(!defaults.rdns);
        assert!(defaults.forwardable && defaults.proxiable);
        assert!(defaults.prefers_tcp());
        assert_eq!(defaults.ticket_lifetime, Duration::from_secs(86_400));
        assert_eq!(defaults.renew_lifetime, Duration::from_secs(604_800));
        assert_eq!(defaults.permitted_enctype_ids(), [18, 17, 23]);
        assert_eq!(defaults.default_tgs_enctype_ids(), [18, 17, 23]);
        assert_eq!(defaults.default_tkt_enctype_ids(), [18, 17, 23]);
        assert_eq!(defaults.preferred_preauth_types, [18, 17, 23]);
    }

    #[test]
    fn custom_encryption_policy_is_honored() {
        let config = build_kerberos_config(
            "EXAMPLE.LOCAL",
            &[spec("EXAMPLE.LOCAL", &["dc1"])],
            &[EncryptionType::Aes256CtsHmacSha196],
        )
        .unwrap();
        assert_eq!(config.lib_defaults.permitted_enctype_ids(), [18]);
    }

    #[test]
    fn explicit_hosts_win_over_kdc_defaults() {
        let realm = RealmSpec::builder()
            .realm_name("corp.example")
            .kdc_hosts(vec!["dc1".into(), "dc2:1088".into()])
            .admin_server_hosts(vec!["admin".into()])
            .kpasswd_hosts(vec!["pw".into()])
            .build();

        let config =
            build_kerberos_config("CORP.EXAMPLE", &[realm], &DEFAULT_ENCRYPTION_TYPES).unwrap();
        let entry = &config.realms[0];
        assert_eq!(entry.kdc, ["dc1:88", "dc2:1088"]);
        assert_eq!(entry.admin_server, ["admin"]);
        assert_eq!(entry.kpasswd_server, ["pw:464"]);
    }

    #[test]
    fn distinct_default_domain_adds_four_mappings() {
        let realm = RealmSpec::builder()
            .realm_name("CORP.EXAMPLE")
            .kdc_hosts(vec!["dc1".into()])
            .default_domain("ad.example.com")
            .build();

        let config =
            build_kerberos_config("CORP.EXAMPLE", &[realm], &DEFAULT_ENCRYPTION_TYPES).unwrap();
        let keys: Vec<_> = config.domain_realm.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            [".ad.example.com", ".corp.example", "ad.example.com", "corp.example"]
        );
        assert!(config.domain_realm.values().all(|r| r == "CORP.EXAMPLE"));
        assert_eq!(config.realm_for_host("dc1.ad.example.com"), Some("CORP.EXAMPLE"));
    }

    #[test]
    fn two_realms_keep_order_and_mappings() {
        let config = build_kerberos_config(
            "TESTLAB.LOCAL",
            &[spec("TESTLAB.LOCAL", &["10.0.0.1"]), spec("testlab2.local", &["10.0.1.1"])],
            &DEFAULT_ENCRYPTION_TYPES,
        )
        .unwrap();

        let names: Vec<_> = config.realms.iter().map(|r| r.realm.as_str()).collect();
        assert_eq!(names, ["TESTLAB.LOCAL", "TESTLAB2.LOCAL"]);
        assert_eq!(config.domain_realm.len(), 4);
        assert_eq!(config.realm_for_host("dc2.testlab2.local"), Some("TESTLAB2.LOCAL"));
    }

    #[test]
    fn building_twice_is_identical() {
        let realms = [spec("EXAMPLE.LOCAL", &["10.0.0.1", "10.0.0.2"])];
        let first = build_kerberos_config("EXAMPLE.LOCAL", &realms, &DEFAULT_ENCRYPTION_TYPES);
        let second = build_kerberos_config("EXAMPLE.LOCAL", &realms, &DEFAULT_ENCRYPTION_TYPES);
        assert_eq!(first.unwrap(), second.unwrap());
    }

    #[test]
    fn empty_realm_list_is_rejected() {
        let err = build_kerberos_config("EXAMPLE.LOCAL", &[], &DEFAULT_ENCRYPTION_TYPES);
        assert!(matches!(err, Err(KerberosConfigError::NoRealms)));
    }

    #[test]
    fn empty_encryption_policy_is_rejected() {
        let realm = RealmSpec::builder()
            .realm_name("A.LOCAL")
            .kdc_hosts(vec!["10.0.0.1".to_owned()])
            .build();
        let err = build_kerberos_config("A.LOCAL", &[realm], &[]);
        assert!(matches!(err, Err(KerberosConfigError::NoEncryptionTypes)));
    }

    #[test]
    fn realm_without_kdc_reports_discovery_outcome() {
        let realm = RealmSpec::builder()
            .realm_name("EXAMPLE.LOCAL")
            .kdc_discovery(KdcDiscovery::LookupFailed("SERVFAIL".into()))
            .build();

        let err = build_kerberos_config("EXAMPLE.LOCAL", &[realm], &DEFAULT_ENCRYPTION_TYPES)
            .unwrap_err();
        assert!(matches!(err, KerberosConfigError::NoKdc { ref realm, .. } if realm == "EXAMPLE.LOCAL"));
        assert!(err.to_string().contains("SERVFAIL"));
    }
}
