//! SASL GSSAPI bind exchange (RFC 4752) over any directory connection.

use std::error::Error as StdError;
use std::io;

use tracing::{debug, info, instrument};

use crate::ldap::{BindResponse, ProtocolError, ResultCode};

pub const GSSAPI_MECHANISM: &str = "GSSAPI";

/// Security layer bit for "no protection" in the RFC 4752 layer octet.
pub const SECURITY_LAYER_NONE: u8 = 0x01;

/// Result of one `init_sec_context` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GssStep {
    /// Send this token and feed the server's answer back in.
    Continue(Vec<u8>),
    /// The context is established; a final token may still need sending.
    Complete(Option<Vec<u8>>),
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct GssapiError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl GssapiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// A Kerberos GSSAPI initiator.
pub trait GssapiClient {
    /// Runs one round of context establishment towards `target_name`.
    ///
    /// `input` is `None` on the first call and the server's token afterwards.
    fn init_sec_context(
        &mut self,
        target_name: &str,
        input: Option<&[u8]>,
    ) -> Result<GssStep, GssapiError>;

    fn wrap_message(&mut self, message: &[u8]) -> Result<Vec<u8>, GssapiError>;

    fn unwrap_message(&mut self, token: &[u8]) -> Result<Vec<u8>, GssapiError>;
}

/// An open directory connection able to carry SASL bind requests.
pub trait DirectoryConnection {
    fn sasl_bind(
        &mut self,
        mechanism: &str,
        credentials: Option<&[u8]>,
    ) -> Result<BindResponse, BindError>;

    /// Releases the connection. Further requests on it fail.
    fn close(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("bind rejected by server: {code}: {message}")]
    Rejected { code: ResultCode, message: String },

    #[error("server did not return a GSSAPI token")]
    MissingServerToken,

    #[error("mutual authentication was required but the server did not prove its identity")]
    MutualAuthNotEstablished,

    #[error("security layer negotiation failed: {0}")]
    SecurityLayer(String),

    #[error("GSSAPI failure: {0}")]
    Gssapi(#[from] GssapiError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error during bind: {0}")]
    Io(#[from] io::Error),
}

/// Performs a SASL GSSAPI bind on `connection`.
///
/// With `mutual_auth_required`, the bind fails unless the security context
/// completed by consuming a token from the server.
#[instrument(skip(connection, client))]
pub fn gssapi_bind<C, G>(
    connection: &mut C,
    client: &mut G,
    service_principal: &str,
    mutual_auth_required: bool,
) -> Result<(), BindError>
where
    C: DirectoryConnection + ?Sized,
    G: GssapiClient + ?Sized,
{
    let mut server_token: Option<Vec<u8>> = None;
    let mut round = 0usize;

    let (final_token, mutual) = loop {
        round += 1;
        let had_server_token = server_token.is_some();

        match client.init_sec_context(service_principal, server_token.as_deref())? {
            GssStep::Continue(token) => {
                debug!(round, token_len = token.len(), "sending GSSAPI token");
                let response = connection.sasl_bind(GSSAPI_MECHANISM, Some(&token))?;
                server_token = Some(expect_challenge(response)?);
            }
            GssStep::Complete(token) => break (token, had_server_token),
        }
    };

    info!(rounds = round, mutual, "security context established");
    if mutual_auth_required && !mutual {
        return Err(BindError::MutualAuthNotEstablished);
    }

    let response = connection.sasl_bind(
        GSSAPI_MECHANISM,
        Some(final_token.as_deref().unwrap_or_default()),
    )?;
    if response.is_success() {
        debug!("server completed the bind without security layer negotiation");
        return Ok(());
    }
    let wrapped_offer = expect_challenge(response)?;

    let choice = negotiate_security_layer(client, &wrapped_offer)?;
    let response = connection.sasl_bind(GSSAPI_MECHANISM, Some(&choice))?;
    if !response.is_success() {
        return Err(rejected(response));
    }

    info!("GSSAPI bind complete");
    Ok(())
}

fn negotiate_security_layer<G>(client: &mut G, wrapped_offer: &[u8]) -> Result<Vec<u8>, BindError>
where
    G: GssapiClient + ?Sized,
{
    let offer = client.unwrap_message(wrapped_offer)?;
    let &[layers, high, mid, low] = offer.as_slice() else {
        return Err(BindError::SecurityLayer(format!(
            "server offer must be 4 octets, got {}",
            offer.len()
        )));
    };

    let max_size = u32::from_be_bytes([0, high, mid, low]);
    debug!(layers = format_args!("{layers:#04x}"), max_size, "server security layer offer");

    if layers & SECURITY_LAYER_NONE == 0 {
        return Err(BindError::SecurityLayer(
            "server requires a protection layer".to_owned(),
        ));
    }

    // No layer selected, so the maximum buffer size must be zero.
    Ok(client.wrap_message(&[SECURITY_LAYER_NONE, 0, 0, 0])?)
}

fn expect_challenge(response: BindResponse) -> Result<Vec<u8>, BindError> {
    if response.in_progress() {
        return response.server_sasl_creds.ok_or(BindError::MissingServerToken);
    }
    if response.is_success() {
        return Err(BindError::MissingServerToken);
    }
    Err(rejected(response))
}

fn rejected(response: BindResponse) -> BindError {
    BindError::Rejected {
        code: response.result_code,
        message: response.diagnostic_message,
    }
}
