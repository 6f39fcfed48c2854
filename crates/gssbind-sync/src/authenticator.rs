use std::fmt::Debug;
use std::path::Path;

use gssbind_core::address::{format_servers_with_port, KDC_PORT};
use gssbind_core::krb5::{EncryptionType, KerberosConfig, KerberosConfigError, LibDefaults};
use gssbind_core::{
    Credentials, GssStep, GssapiClient, GssapiError, KerberosClientError, KerberosClientFactory,
    KerberosClientSettings,
};
use sspi::generator::GeneratorState;
use sspi::{
    AuthIdentity, BufferType, ClientRequestFlags, CredentialUse, DataRepresentation,
    EncryptionFlags, Kerberos, SecurityBuffer, SecurityBufferRef, SecurityStatus, Sspi, SspiImpl,
    Username,
};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::kerberos::KdcRouter;

/// Encryption types the `sspi` Kerberos provider implements.
pub const PROVIDER_ENCTYPES: [EncryptionType; 2] = [
    EncryptionType::Aes256CtsHmacSha196,
    EncryptionType::Aes128CtsHmacSha196,
];

/// Kerberos GSSAPI initiator backed by the `sspi` Kerberos provider.
pub struct SspiGssapiClient {
    provider: Kerberos,
    credentials: <Kerberos as SspiImpl>::CredentialsHandle,
    router: KdcRouter,
    send_sequence: u32,
    recv_sequence: u32,
}

impl Debug for SspiGssapiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SspiGssapiClient")
            .field("send_sequence", &self.send_sequence)
            .field("recv_sequence", &self.recv_sequence)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

fn sspi_error(context: &'static str) -> impl FnOnce(sspi::Error) -> GssapiError {
    move |err| GssapiError::with_source(context, err)
}

impl SspiGssapiClient {
    pub fn new(
        config: sspi::KerberosConfig,
        identity: AuthIdentity,
        router: KdcRouter,
    ) -> Result<Self, GssapiError> {
        let mut provider = Kerberos::new_client_from_config(config)
            .map_err(sspi_error("failed to create Kerberos provider"))?;

        let auth_data = sspi::Credentials::AuthIdentity(identity);
        let acq = provider
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(&auth_data);
        let credentials = acq
            .execute(&mut provider)
            .map_err(sspi_error("failed to acquire Kerberos credentials"))?
            .credentials_handle;

        Ok(Self {
            provider,
            credentials,
            router,
            send_sequence: 0,
            recv_sequence: 0,
        })
    }
}

impl GssapiClient for SspiGssapiClient {
    #[instrument(
        name = "sspi.init_sec_context",
        level = "info",
        skip(self, input),
        fields(input_len = input.map(<[u8]>::len))
    )]
    fn init_sec_context(
        &mut self,
        target_name: &str,
        input: Option<&[u8]>,
    ) -> Result<GssStep, GssapiError> {
        let mut output = [SecurityBuffer::new(Vec::new(), BufferType::Token)];
        let mut input_buffer = input.map(|token| [SecurityBuffer::new(token.to_vec(), BufferType::Token)]);
        let service_host = target_name.split_once('/').map(|(_, host)| host);
        let router = &self.router;

        // The builder borrows the output buffer; it must be gone before the token is read.
        let result = {
            let mut builder = self
                .provider
                .initialize_security_context()
                .with_credentials_handle(&mut self.credentials)
                .with_context_requirements(
                    ClientRequestFlags::MUTUAL_AUTH | ClientRequestFlags::INTEGRITY,
                )
                .with_target_data_representation(DataRepresentation::Native)
                .with_target_name(target_name)
                .with_output(&mut output);

            if let Some(input_buffer) = input_buffer.as_mut() {
                builder = builder.with_input(input_buffer);
            }

            let mut generator = self
                .provider
                .initialize_security_context_impl(&mut builder)
                .map_err(sspi_error("InitializeSecurityContext failed"))?;

            let mut state = generator.start();
            loop {
                match state {
                    GeneratorState::Suspended(request) => {
                        let response = router.send(&request, service_host).map_err(|err| {
                            sspi::Error::new(
                                sspi::ErrorKind::NoAuthenticatingAuthority,
                                format!("{err:#}"),
                            )
                        });
                        state = generator.resume(response);
                    }
                    GeneratorState::Completed(result) => break result,
                }
            }
        }
        .map_err(sspi_error("InitializeSecurityContext failed"))?;

        let token = std::mem::take(&mut output[0].buffer);
        debug!(status = ?result.status, token_len = token.len(), "security context step");

        match result.status {
            SecurityStatus::ContinueNeeded if token.is_empty() => Err(GssapiError::new(
                "SSPI ContinueNeeded but no token produced",
            )),
            SecurityStatus::ContinueNeeded => Ok(GssStep::Continue(token)),
            SecurityStatus::Ok => Ok(GssStep::Complete((!token.is_empty()).then_some(token))),
            other => Err(GssapiError::new(format!(
                "unexpected InitializeSecurityContext status {other:?}"
            ))),
        }
    }

    fn wrap_message(&mut self, message: &[u8]) -> Result<Vec<u8>, GssapiError> {
        let sizes = self
            .provider
            .query_context_sizes()
            .map_err(sspi_error("failed to query context sizes"))?;

        let mut token = vec![0u8; sizes.security_trailer as usize];
        let mut data = message.to_vec();
        let mut buffers = [
            SecurityBufferRef::token_buf(&mut token),
            SecurityBufferRef::data_buf(&mut data),
        ];

        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.provider
            .encrypt_message(EncryptionFlags::empty(), &mut buffers, sequence)
            .map_err(sspi_error("failed to wrap message"))?;

        let mut wrapped = buffers[0].data().to_vec();
        wrapped.extend_from_slice(buffers[1].data());
        Ok(wrapped)
    }

    fn unwrap_message(&mut self, token: &[u8]) -> Result<Vec<u8>, GssapiError> {
        let sizes = self
            .provider
            .query_context_sizes()
            .map_err(sspi_error("failed to query context sizes"))?;

        let split = (sizes.security_trailer as usize).min(token.len());
        let (header, body) = token.split_at(split);
        let mut header = header.to_vec();
        let mut body = body.to_vec();
        let mut buffers = [
            SecurityBufferRef::token_buf(&mut header),
            SecurityBufferRef::data_buf(&mut body),
        ];

        let sequence = self.recv_sequence;
        self.recv_sequence = self.recv_sequence.wrapping_add(1);
        self.provider
            .decrypt_message(&mut buffers, sequence)
            .map_err(sspi_error("failed to unwrap message"))?;

        Ok(buffers[1].data().to_vec())
    }
}

/// Creates [`SspiGssapiClient`]s from either a krb5.conf file or a synthesized configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SspiKerberosFactory;

impl SspiKerberosFactory {
    /// KDC URL for `realm`, or `None` to let the provider locate one through DNS.
    pub fn kdc_url(config: &KerberosConfig, realm: &str) -> Result<Option<Url>, KerberosClientError> {
        let kdc = config.realm(realm).and_then(|entry| entry.kdc.first());

        let Some(kdc) = kdc else {
            if config.lib_defaults.dns_lookup_kdc {
                info!(realm, "no KDC configured, leaving discovery to the Kerberos provider");
                return Ok(None);
            }
            return Err(match config.realm(realm) {
                Some(entry) => KerberosConfigError::NoKdc {
                    realm: entry.realm.clone(),
                    discovery: None,
                },
                None => KerberosConfigError::UnknownRealm(realm.to_owned()),
            }
            .into());
        };

        let scheme = if config.lib_defaults.prefers_tcp() {
            "tcp"
        } else {
            "udp"
        };
        let endpoint = format_servers_with_port(&[kdc], KDC_PORT).concat();
        let url = Url::parse(&format!("{scheme}://{endpoint}"))
            .map_err(|err| GssapiError::with_source(format!("invalid KDC address {endpoint}"), err))?;
        Ok(Some(url))
    }
}

fn names(types: &[EncryptionType]) -> String {
    types
        .iter()
        .map(|etype| etype.name())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fails when no permitted encryption type is available to the provider and
/// warns about every setting it cannot honor.
fn check_provider_support(defaults: &LibDefaults) -> Result<(), KerberosClientError> {
    let (usable, unavailable): (Vec<_>, Vec<_>) = defaults
        .permitted_enctypes
        .iter()
        .copied()
        .partition(|etype| PROVIDER_ENCTYPES.contains(etype));

    if usable.is_empty() {
        return Err(KerberosClientError::Unsupported(format!(
            "none of the permitted encryption types ({}) is available",
            names(&defaults.permitted_enctypes)
        )));
    }
    if !unavailable.is_empty() {
        warn!(
            enctypes = %names(&unavailable),
            "permitted encryption types not available in the Kerberos provider"
        );
    }

    let unrestricted: Vec<_> = PROVIDER_ENCTYPES
        .into_iter()
        .filter(|etype| !usable.contains(etype))
        .collect();
    if !unrestricted.is_empty() {
        warn!(
            enctypes = %names(&unrestricted),
            "the Kerberos provider cannot exclude these encryption types"
        );
    }

    let mit = LibDefaults::default();
    let ignored: Vec<_> = [
        ("ticket_lifetime", defaults.ticket_lifetime != mit.ticket_lifetime),
        ("renew_lifetime", defaults.renew_lifetime != mit.renew_lifetime),
        ("forwardable", defaults.forwardable != mit.forwardable),
        ("proxiable", defaults.proxiable != mit.proxiable),
    ]
    .into_iter()
    .filter_map(|(name, set)| set.then_some(name))
    .collect();
    if !ignored.is_empty() {
        warn!(settings = ?ignored, "Kerberos provider ignores these ticket options");
    }
    Ok(())
}

fn identity(credentials: &Credentials, realm: &str) -> Result<AuthIdentity, GssapiError> {
    let username = match credentials.principal_realm() {
        Some(_) => Username::parse(credentials.user()),
        None => Username::new_upn(credentials.account_name(), realm),
    }
    .map_err(|_| GssapiError::new(format!("invalid user name {:?}", credentials.user())))?;

    Ok(AuthIdentity {
        username,
        password: credentials.password().to_owned().into(),
    })
}

fn client_computer_name(settings: &KerberosClientSettings) -> String {
    settings.client_computer_name.clone().unwrap_or_else(|| {
        whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string())
    })
}

impl KerberosClientFactory for SspiKerberosFactory {
    type Client = SspiGssapiClient;

    #[instrument(level = "info", skip(self, credentials, settings), err)]
    fn from_file(
        &self,
        credentials: &Credentials,
        realm: &str,
        path: &Path,
        settings: &KerberosClientSettings,
    ) -> Result<SspiGssapiClient, KerberosClientError> {
        let config = KerberosConfig::load(path)?;
        if !config.lib_defaults.default_realm.is_empty()
            && !config.lib_defaults.default_realm.eq_ignore_ascii_case(realm)
        {
            warn!(
                file_realm = %config.lib_defaults.default_realm,
                realm,
                "config file default realm differs from requested realm"
            );
        }
        self.from_config(credentials, realm, &config, settings)
    }

    #[instrument(level = "info", skip_all, fields(realm = %realm), err)]
    fn from_config(
        &self,
        credentials: &Credentials,
        realm: &str,
        config: &KerberosConfig,
        settings: &KerberosClientSettings,
    ) -> Result<SspiGssapiClient, KerberosClientError> {
        let kdc_url = Self::kdc_url(config, realm)?;
        check_provider_support(&config.lib_defaults)?;

        // The provider never sends PA-FX-FAST, so disabling it needs no extra setup.
        debug!(
            kdc_url = kdc_url.as_ref().map(Url::as_str),
            disable_pa_fx_fast = settings.disable_pa_fx_fast,
            realms = config.realms.len(),
            "creating Kerberos client"
        );

        let sspi_config = sspi::KerberosConfig {
            kdc_url,
            client_computer_name: Some(client_computer_name(settings)),
        };

        Ok(SspiGssapiClient::new(
            sspi_config,
            identity(credentials, realm)?,
            KdcRouter::new(config.clone(), realm),
        )?)
    }
}
