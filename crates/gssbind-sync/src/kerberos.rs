use anyhow::Context;
use byteorder::{BigEndian, ReadBytesExt};
use gssbind_core::address::{format_servers_with_port, KDC_PORT};
use gssbind_core::krb5::{KdcRequest, KdcRequestKind, KerberosConfig};
use sspi::generator::NetworkRequest;
use sspi::network_client::NetworkProtocol;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Upper bound for a single KDC exchange.
pub const KDC_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_UDP_DATAGRAM: usize = 65_535;

/// Largest length a KDC may announce on the TCP transport.
pub const MAX_KDC_RESPONSE: u32 = 4 * 1024 * 1024;

/// Picks KDCs for the provider's requests from the effective Kerberos
/// configuration, trying each KDC of a realm in order.
#[derive(Debug, Clone)]
pub struct KdcRouter {
    config: KerberosConfig,
    default_realm: String,
}

impl KdcRouter {
    pub fn new(config: KerberosConfig, default_realm: &str) -> Self {
        Self {
            config,
            default_realm: default_realm.to_uppercase(),
        }
    }

    /// `host:port` endpoints to try for `request`, in configured order.
    ///
    /// The realm named in the request body wins when it has KDCs. Service
    /// ticket requests for an unknown realm follow `[domain_realm]` for the
    /// service host, and everything else goes to the default realm.
    pub fn endpoints(&self, request: Option<&KdcRequest>, service_host: Option<&str>) -> Vec<String> {
        let known = |realm: &str| {
            self.config
                .realm(realm)
                .is_some_and(|entry| !entry.kdc.is_empty())
        };

        let by_body = request
            .map(|request| request.realm.as_str())
            .filter(|realm| known(*realm));
        let by_host = || {
            service_host
                .filter(|_| request.is_none_or(|request| request.kind == KdcRequestKind::Tgs))
                .and_then(|host| self.config.realm_for_host(host))
                .filter(|realm| known(*realm))
        };
        let realm = by_body.or_else(by_host).unwrap_or(self.default_realm.as_str());

        self.config
            .realm(realm)
            .map(|entry| format_servers_with_port(&entry.kdc, KDC_PORT))
            .unwrap_or_default()
    }

    /// Sends a provider request and returns the response with its 4-byte
    /// big-endian length prefix, whichever transport was used.
    ///
    /// When no KDC is configured for the request the provider's own URL is
    /// used, which covers KDCs it located through DNS.
    #[instrument(
        name = "kerberos.send_packet",
        level = "info",
        skip(self, packet),
        fields(protocol = ?packet.protocol, url = %packet.url, data_len = packet.data.len()),
        err
    )]
    pub fn send(&self, packet: &NetworkRequest, service_host: Option<&str>) -> Result<Vec<u8>, anyhow::Error> {
        if matches!(packet.protocol, NetworkProtocol::Http | NetworkProtocol::Https) {
            anyhow::bail!("KDC proxy transport is not supported: {}", packet.url);
        }

        let request = packet.data.get(4..).and_then(KdcRequest::parse);
        let mut endpoints = self.endpoints(request.as_ref(), service_host);
        if endpoints.is_empty() {
            endpoints.push(provider_endpoint(packet)?);
        }
        debug!(request = ?request, endpoints = ?endpoints, "routing KDC request");

        let mut failures = Vec::new();
        for endpoint in &endpoints {
            let result = match packet.protocol {
                NetworkProtocol::Udp => send_udp_packet(endpoint, &packet.data),
                _ => send_tcp_packet(endpoint, &packet.data),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %format!("{err:#}"), "KDC did not answer");
                    failures.push(format!("{endpoint}: {err:#}"));
                }
            }
        }

        anyhow::bail!("no KDC answered ({})", failures.join("; "))
    }
}

fn provider_endpoint(packet: &NetworkRequest) -> Result<String, anyhow::Error> {
    let host = packet
        .url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing host in URL"))?;
    let port = packet.url.port().unwrap_or(KDC_PORT);
    Ok(format!("{host}:{port}"))
}

fn resolve(endpoint: &str) -> Result<SocketAddr, anyhow::Error> {
    endpoint
        .to_socket_addrs()
        .context("failed to resolve KDC address")?
        .next()
        .ok_or_else(|| anyhow::anyhow!("KDC host {endpoint} has no address"))
}

/// Sends a packet via TCP to the Kerberos KDC
#[instrument(name = "kerberos.tcp", level = "info", skip(data), err)]
fn send_tcp_packet(endpoint: &str, data: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let address = resolve(endpoint)?;

    info!("establishing TCP connection to KDC");

    let mut stream = TcpStream::connect_timeout(&address, KDC_TIMEOUT)
        .context("failed to establish TCP connection to KDC")?;
    stream.set_read_timeout(Some(KDC_TIMEOUT))?;
    stream.set_write_timeout(Some(KDC_TIMEOUT))?;

    // The request is already length-prefixed.
    stream
        .write_all(data)
        .context("failed to write packet data to KDC")?;

    stream
        .flush()
        .context("failed to flush TCP stream to KDC")?;

    info!("packet sent, waiting for KDC response");

    let response_len = stream
        .read_u32::<BigEndian>()
        .context("failed to read response length from KDC")?;
    if response_len > MAX_KDC_RESPONSE {
        anyhow::bail!("KDC response of {response_len} bytes is too large");
    }

    let mut response_data = vec![0u8; response_len as usize + 4];
    response_data[..4].copy_from_slice(&response_len.to_be_bytes()); // include length prefix

    stream
        .read_exact(&mut response_data[4..])
        .context("failed to read response data from KDC")?;

    info!(
        response_len = response_data.len(),
        "received response from KDC"
    );

    Ok(response_data)
}

/// Sends a packet via UDP to the Kerberos KDC
#[instrument(name = "kerberos.udp", level = "info", skip(data), err)]
fn send_udp_packet(endpoint: &str, data: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let address = resolve(endpoint)?;

    let bind_address = if address.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let socket = UdpSocket::bind(bind_address).context("failed to bind UDP socket")?;
    socket.set_read_timeout(Some(KDC_TIMEOUT))?;
    socket
        .connect(address)
        .context("failed to connect UDP socket to KDC")?;

    // Datagrams carry no length prefix.
    let payload = data.get(4..).unwrap_or_default();
    socket
        .send(payload)
        .context("failed to send datagram to KDC")?;

    let mut datagram = vec![0u8; MAX_UDP_DATAGRAM];
    let received = socket
        .recv(&mut datagram)
        .context("failed to receive datagram from KDC")?;
    datagram.truncate(received);

    let mut response_data = Vec::with_capacity(received + 4);
    response_data.extend_from_slice(&(received as u32).to_be_bytes());
    response_data.extend_from_slice(&datagram);

    info!(
        response_len = response_data.len(),
        "received response from KDC"
    );

    Ok(response_data)
}
