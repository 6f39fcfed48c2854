//! Directory server address and Kerberos server list helpers.

/// Well-known Kerberos KDC port.
pub const KDC_PORT: u16 = 88;

/// Well-known Kerberos password change (kpasswd) port.
pub const KPASSWD_PORT: u16 = 464;

/// Scheme prefixes recognized on a directory server address, checked in order.
pub const LDAP_SCHEME_PREFIXES: [&str; 3] = ["ldap://", "ldaps://", "ldapi://"];

/// Strips one recognized LDAP scheme prefix from `address`.
///
/// Only the first matching prefix is removed and matching is case-sensitive.
/// An address without a recognized prefix is returned as-is.
pub fn strip_ldap_scheme(address: &str) -> &str {
    LDAP_SCHEME_PREFIXES
        .iter()
        .find_map(|prefix| address.strip_prefix(prefix))
        .unwrap_or(address)
}

/// Appends `:default_port` to every host that does not already name a port.
///
/// Any entry containing a `:` is considered to carry a port and is passed
/// through unchanged (this includes bracketed IPv6 socket addresses).
pub fn format_servers_with_port<S: AsRef<str>>(servers: &[S], default_port: u16) -> Vec<String> {
    servers
        .iter()
        .map(|server| {
            let server = server.as_ref();
            if server.contains(':') {
                server.to_owned()
            } else {
                format!("{server}:{default_port}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_each_supported_scheme_once() {
        assert_eq!(strip_ldap_scheme("ldap://dc1.example.local"), "dc1.example.local");
        assert_eq!(strip_ldap_scheme("ldaps://dc1.example.local"), "dc1.example.local");
        assert_eq!(strip_ldap_scheme("ldapi://dc1.example.local"), "dc1.example.local");
        assert_eq!(strip_ldap_scheme("ldap://ldap://10.0.0.1"), "ldap://10.0.0.1");
    }

    #[test]
    fn leaves_unprefixed_addresses_alone() {
        assert_eq!(strip_ldap_scheme("10.0.0.1"), "10.0.0.1");
        assert_eq!(strip_ldap_scheme("LDAP://dc1"), "LDAP://dc1");
        assert_eq!(strip_ldap_scheme(""), "");
    }

    #[test]
    fn appends_port_only_when_missing() {
        let servers = ["10.0.0.1", "kdc.example.local:8888", "[fe80::1]:88"];
        assert_eq!(
            format_servers_with_port(&servers, KDC_PORT),
            vec!["10.0.0.1:88", "kdc.example.local:8888", "[fe80::1]:88"]
        );
    }

    #[test]
    fn same_hosts_formatted_for_kdc_and_kpasswd() {
        let hosts = vec!["dc1".to_owned(), "dc2".to_owned()];
        assert_eq!(format_servers_with_port(&hosts, KDC_PORT), ["dc1:88", "dc2:88"]);
        assert_eq!(
            format_servers_with_port(&hosts, KPASSWD_PORT),
            ["dc1:464", "dc2:464"]
        );
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let servers: [&str; 0] = [];
        assert!(format_servers_with_port(&servers, KDC_PORT).is_empty());
    }
}
