//! Blocking network drivers for `gssbind-core`: TCP directory transport,
//! system DNS resolution and an `sspi`-backed Kerberos client.

pub mod authenticator;
pub mod dns;
pub mod kerberos;
pub mod transport;

use std::time::Duration;

use gssbind_core::{AuthenticationOptions, ConnectError, Credentials};

pub use authenticator::{SspiGssapiClient, SspiKerberosFactory};
pub use dns::SystemResolver;
pub use kerberos::KdcRouter;
pub use transport::{LdapConnection, LdapParts, RequestError, TcpDialer};

/// Binds to `address:port` with Kerberos GSSAPI using the default TCP
/// transport and the `sspi` Kerberos client.
pub fn connect_with_gssapi(
    address: &str,
    port: u16,
    credentials: &Credentials,
    dial_timeout: Duration,
    options: &AuthenticationOptions,
) -> Result<LdapConnection, ConnectError> {
    let dialer = TcpDialer {
        io_timeout: Some(dial_timeout.max(kerberos::KDC_TIMEOUT)),
    };
    gssbind_core::connect_with_gssapi(
        &dialer,
        &SspiKerberosFactory,
        address,
        port,
        credentials,
        dial_timeout,
        options,
    )
}
