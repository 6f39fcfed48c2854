use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{error, info, instrument};

use crate::ConnectError;
use crate::address::strip_ldap_scheme;
use crate::credentials::Credentials;
use crate::krb5::{KerberosConfig, KerberosConfigError, build_kerberos_config};
use crate::options::{AuthenticationOptions, ConfigSource, KerberosClientSettings};
use crate::sasl::{DirectoryConnection, GssapiClient, GssapiError, gssapi_bind};

/// Opens transport connections to a directory server.
pub trait DirectoryDialer {
    type Connection: DirectoryConnection;

    fn dial(&self, host: &str, port: u16, timeout: Duration) -> io::Result<Self::Connection>;
}

/// Builds Kerberos GSSAPI initiators for a user.
pub trait KerberosClientFactory {
    type Client: GssapiClient;

    fn from_file(
        &self,
        credentials: &Credentials,
        realm: &str,
        path: &Path,
        settings: &KerberosClientSettings,
    ) -> Result<Self::Client, KerberosClientError>;

    fn from_config(
        &self,
        credentials: &Credentials,
        realm: &str,
        config: &KerberosConfig,
        settings: &KerberosClientSettings,
    ) -> Result<Self::Client, KerberosClientError>;
}

#[derive(Debug, thiserror::Error)]
pub enum KerberosClientError {
    #[error(transparent)]
    Config(#[from] KerberosConfigError),

    #[error("failed to initialize Kerberos client: {0}")]
    Init(#[from] GssapiError),

    /// The configuration asks for something the Kerberos client cannot do.
    #[error("unsupported Kerberos configuration: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindState {
    #[default]
    Idle,
    Validated,
    Connected,
    ClientBuilt,
    Bound,
    Failed,
}

impl BindState {
    pub fn name(self) -> &'static str {
        match self {
            BindState::Idle => "Idle",
            BindState::Validated => "Validated",
            BindState::Connected => "Connected",
            BindState::ClientBuilt => "ClientBuilt",
            BindState::Bound => "Bound",
            BindState::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BindState::Bound | BindState::Failed)
    }
}

/// Drives one GSSAPI bind attempt from validation to an authenticated connection.
///
/// Each attempt is a single linear pass. Once a connection has been dialed,
/// every failure closes it before the error is returned.
#[derive(Debug)]
pub struct GssapiBinder<'a, D, F> {
    dialer: &'a D,
    factory: &'a F,
    state: BindState,
}

impl<'a, D, F> GssapiBinder<'a, D, F>
where
    D: DirectoryDialer,
    F: KerberosClientFactory,
{
    pub fn new(dialer: &'a D, factory: &'a F) -> Self {
        Self {
            dialer,
            factory,
            state: BindState::Idle,
        }
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    fn set_state(&mut self, state: BindState) {
        info!(state = state.name(), "Setting bind state");
        self.state = state;
    }

    fn fail(&mut self, err: ConnectError) -> ConnectError {
        error!(kind = err.kind().code(), %err, from = self.state.name(), "GSSAPI bind attempt failed");
        self.set_state(BindState::Failed);
        err
    }

    #[instrument(skip(self, credentials, options), fields(user = credentials.user(), realm = %options.default_realm))]
    pub fn connect(
        &mut self,
        address: &str,
        port: u16,
        credentials: &Credentials,
        dial_timeout: Duration,
        options: &AuthenticationOptions,
    ) -> Result<D::Connection, ConnectError> {
        self.set_state(BindState::Idle);

        if let Err(err) = options.validate() {
            return Err(self.fail(ConnectError::Configuration(err)));
        }
        self.set_state(BindState::Validated);

        let host = strip_ldap_scheme(address);
        let mut connection = match self.dialer.dial(host, port, dial_timeout) {
            Ok(connection) => connection,
            Err(source) => {
                return Err(self.fail(ConnectError::Transport {
                    address: host.to_owned(),
                    port,
                    source,
                }));
            }
        };
        self.set_state(BindState::Connected);

        let mut client = match self.build_client(credentials, options) {
            Ok(client) => client,
            Err(err) => {
                connection.close();
                return Err(self.fail(ConnectError::KerberosClient(err)));
            }
        };
        self.set_state(BindState::ClientBuilt);

        let spn = options.service_principal_name(host);
        if let Err(err) = gssapi_bind(&mut connection, &mut client, &spn, true) {
            connection.close();
            return Err(self.fail(ConnectError::Bind(err)));
        }

        self.set_state(BindState::Bound);
        Ok(connection)
    }

    fn build_client(
        &self,
        credentials: &Credentials,
        options: &AuthenticationOptions,
    ) -> Result<F::Client, KerberosClientError> {
        let realm = options.default_realm.as_str();
        let settings = &options.client_settings;

        match &options.source {
            ConfigSource::File(path) => {
                info!(path = %path.display(), "using Kerberos config file");
                self.factory.from_file(credentials, realm, path, settings)
            }
            ConfigSource::Realms(realms) => {
                let config = build_kerberos_config(realm, realms, &options.encryption_types)?;
                self.factory
                    .from_config(credentials, realm, &config, settings)
            }
        }
    }
}

/// Validates `options`, dials `address:port`, builds a Kerberos client and
/// performs a mutually authenticated GSSAPI bind.
///
/// On success the bound connection is handed to the caller.
pub fn connect_with_gssapi<D, F>(
    dialer: &D,
    factory: &F,
    address: &str,
    port: u16,
    credentials: &Credentials,
    dial_timeout: Duration,
    options: &AuthenticationOptions,
) -> Result<D::Connection, ConnectError>
where
    D: DirectoryDialer,
    F: KerberosClientFactory,
{
    GssapiBinder::new(dialer, factory).connect(address, port, credentials, dial_timeout, options)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    use super::*;
    use crate::ErrorKind;
    use crate::discovery::KdcDiscovery;
    use crate::ldap::{BindResponse, ResultCode};
    use crate::options::RealmSpec;
    use crate::sasl::tests::{ScriptedConnection, ScriptedGssapi, response};
    use crate::sasl::{BindError, GssStep};

    #[derive(Debug)]
    struct SharedConnection(Rc<RefCell<ScriptedConnection>>);

    impl DirectoryConnection for SharedConnection {
        fn sasl_bind(
            &mut self,
            mechanism: &str,
            credentials: Option<&[u8]>,
        ) -> Result<BindResponse, BindError> {
            self.0.borrow_mut().sasl_bind(mechanism, credentials)
        }

        fn close(&mut self) {
            self.0.borrow_mut().close();
        }
    }

    struct FakeDialer {
        connection: Rc<RefCell<ScriptedConnection>>,
        refuse: bool,
        dialed: RefCell<Vec<(String, u16, Duration)>>,
    }

    impl FakeDialer {
        fn new(connection: ScriptedConnection) -> Self {
            Self {
                connection: Rc::new(RefCell::new(connection)),
                refuse: false,
                dialed: RefCell::default(),
            }
        }

        fn closed(&self) -> bool {
            self.connection.borrow().closed
        }
    }

    impl DirectoryDialer for FakeDialer {
        type Connection = SharedConnection;

        fn dial(&self, host: &str, port: u16, timeout: Duration) -> io::Result<SharedConnection> {
            self.dialed.borrow_mut().push((host.to_owned(), port, timeout));
            if self.refuse {
                return Err(io::ErrorKind::ConnectionRefused.into());
            }
            Ok(SharedConnection(Rc::clone(&self.connection)))
        }
    }

    struct RecordingClient {
        inner: ScriptedGssapi,
        targets: Rc<RefCell<Vec<String>>>,
    }

    impl GssapiClient for RecordingClient {
        fn init_sec_context(
            &mut self,
            target_name: &str,
            input: Option<&[u8]>,
        ) -> Result<GssStep, GssapiError> {
            self.targets.borrow_mut().push(target_name.to_owned());
            self.inner.init_sec_context(target_name, input)
        }

        fn wrap_message(&mut self, message: &[u8]) -> Result<Vec<u8>, GssapiError> {
            self.inner.wrap_message(message)
        }

        fn unwrap_message(&mut self, token: &[u8]) -> Result<Vec<u8>, GssapiError> {
            self.inner.unwrap_message(token)
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        missing_file: bool,
        one_way: bool,
        targets: Rc<RefCell<Vec<String>>>,
        configs: RefCell<Vec<KerberosConfig>>,
        files: RefCell<Vec<PathBuf>>,
    }

    impl FakeFactory {
        fn client(&self) -> RecordingClient {
            let inner = if self.one_way {
                ScriptedGssapi {
                    steps: [GssStep::Complete(Some(b"ap-req".to_vec()))].into(),
                    ..ScriptedGssapi::default()
                }
            } else {
                ScriptedGssapi::mutual()
            };
            RecordingClient {
                inner,
                targets: Rc::clone(&self.targets),
            }
        }
    }

    impl KerberosClientFactory for FakeFactory {
        type Client = RecordingClient;

        fn from_file(
            &self,
            _credentials: &Credentials,
            _realm: &str,
            path: &Path,
            settings: &KerberosClientSettings,
        ) -> Result<RecordingClient, KerberosClientError> {
            assert!(settings.disable_pa_fx_fast);
            self.files.borrow_mut().push(path.to_owned());
            if self.missing_file {
                return Err(KerberosConfigError::Io {
                    path: path.display().to_string(),
                    source: io::ErrorKind::NotFound.into(),
                }
                .into());
            }
            Ok(self.client())
        }

        fn from_config(
            &self,
            _credentials: &Credentials,
            _realm: &str,
            config: &KerberosConfig,
            _settings: &KerberosClientSettings,
        ) -> Result<RecordingClient, KerberosClientError> {
            self.configs.borrow_mut().push(config.clone());
            Ok(self.client())
        }
    }

    fn realm_options(kdcs: &[&str]) -> AuthenticationOptions {
        AuthenticationOptions::builder()
            .default_realm("example.local")
            .source(ConfigSource::Realms(vec![
                RealmSpec::builder()
                    .realm_name("example.local")
                    .kdc_hosts(kdcs.iter().map(ToString::to_string).collect())
                    .build(),
            ]))
            .build()
    }

    fn credentials() -> Credentials {
        Credentials::new("alice", "secret")
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn successful_bind_hands_over_open_connection() {
        let dialer = FakeDialer::new(ScriptedConnection::happy_path());
        let factory = FakeFactory::default();
        let mut binder = GssapiBinder::new(&dialer, &factory);

        let connection = binder
            .connect(
                "ldap://dc1.example.local",
                389,
                &credentials(),
                TIMEOUT,
                &realm_options(&["10.0.0.1"]),
            )
            .unwrap();

        assert_eq!(binder.state(), BindState::Bound);
        assert!(!dialer.closed());
        assert_eq!(
            dialer.dialed.borrow().as_slice(),
            [("dc1.example.local".to_owned(), 389, TIMEOUT)]
        );
        assert!(factory.targets.borrow().iter().all(|t| t == "ldap/dc1.example.local"));

        let configs = factory.configs.borrow();
        assert_eq!(configs[0].realms[0].kdc, ["10.0.0.1:88"]);
        assert_eq!(configs[0].lib_defaults.default_realm, "EXAMPLE.LOCAL");
        drop(connection);
    }

    #[test]
    fn explicit_spn_target_overrides_address() {
        let dialer = FakeDialer::new(ScriptedConnection::happy_path());
        let factory = FakeFactory::default();
        let mut options = realm_options(&["10.0.0.1"]);
        options.service_principal_target = Some("dc1.example.local".to_owned());

        connect_with_gssapi(&dialer, &factory, "10.0.0.1", 389, &credentials(), TIMEOUT, &options)
            .unwrap();
        assert_eq!(factory.targets.borrow()[0], "ldap/dc1.example.local");
    }

    #[test]
    fn invalid_options_fail_before_dialing() {
        let dialer = FakeDialer::new(ScriptedConnection::default());
        let factory = FakeFactory::default();
        let options = AuthenticationOptions::builder()
            .default_realm("EXAMPLE.LOCAL")
            .source(ConfigSource::Realms(Vec::new()))
            .build();

        let mut binder = GssapiBinder::new(&dialer, &factory);
        let err = binder
            .connect("dc1", 389, &credentials(), TIMEOUT, &options)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(binder.state(), BindState::Failed);
        assert!(dialer.dialed.borrow().is_empty());
    }

    #[test]
    fn dial_failure_is_a_transport_error() {
        let mut dialer = FakeDialer::new(ScriptedConnection::default());
        dialer.refuse = true;
        let factory = FakeFactory::default();

        let err = connect_with_gssapi(
            &dialer,
            &factory,
            "ldaps://dc1",
            636,
            &credentials(),
            TIMEOUT,
            &realm_options(&["10.0.0.1"]),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("dc1:636"));
        assert!(factory.configs.borrow().is_empty());
    }

    #[test]
    fn missing_config_file_closes_connection() {
        let dialer = FakeDialer::new(ScriptedConnection::happy_path());
        let factory = FakeFactory {
            missing_file: true,
            ..FakeFactory::default()
        };
        let options = AuthenticationOptions::builder()
            .default_realm("EXAMPLE.LOCAL")
            .source(ConfigSource::File("/nonexistent/krb5.conf".into()))
            .build();

        let err = connect_with_gssapi(&dialer, &factory, "dc1", 389, &credentials(), TIMEOUT, &options)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::KerberosClient);
        assert!(dialer.closed());
        assert_eq!(factory.files.borrow()[0], PathBuf::from("/nonexistent/krb5.conf"));

        let mut stale = SharedConnection(Rc::clone(&dialer.connection));
        assert!(stale.sasl_bind("GSSAPI", None).is_err());
    }

    #[test]
    fn realm_without_kdcs_is_a_kerberos_client_error() {
        let dialer = FakeDialer::new(ScriptedConnection::happy_path());
        let factory = FakeFactory::default();
        let options = AuthenticationOptions::builder()
            .default_realm("EXAMPLE.LOCAL")
            .source(ConfigSource::Realms(vec![
                RealmSpec::builder()
                    .realm_name("EXAMPLE.LOCAL")
                    .kdc_discovery(KdcDiscovery::NoneAdvertised)
                    .build(),
            ]))
            .build();

        let err = connect_with_gssapi(&dialer, &factory, "dc1", 389, &credentials(), TIMEOUT, &options)
            .unwrap_err();

        assert!(matches!(
            err,
            ConnectError::KerberosClient(KerberosClientError::Config(KerberosConfigError::NoKdc { .. }))
        ));
        assert!(dialer.closed());
        assert!(factory.configs.borrow().is_empty());
    }

    #[test]
    fn rejected_bind_closes_connection() {
        let dialer = FakeDialer::new(ScriptedConnection::answering([response(
            ResultCode::INVALID_CREDENTIALS,
            None,
        )]));
        let factory = FakeFactory::default();
        let mut binder = GssapiBinder::new(&dialer, &factory);

        let err = binder
            .connect("dc1", 389, &credentials(), TIMEOUT, &realm_options(&["10.0.0.1"]))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Bind);
        assert_eq!(binder.state(), BindState::Failed);
        assert!(dialer.closed());
    }

    #[test]
    fn bind_without_mutual_authentication_is_refused() {
        let dialer = FakeDialer::new(ScriptedConnection::happy_path());
        let factory = FakeFactory {
            one_way: true,
            ..FakeFactory::default()
        };
        let mut binder = GssapiBinder::new(&dialer, &factory);

        let err = binder
            .connect("dc1", 389, &credentials(), TIMEOUT, &realm_options(&["10.0.0.1"]))
            .unwrap_err();

        assert!(matches!(
            err,
            ConnectError::Bind(BindError::MutualAuthNotEstablished)
        ));
        assert_eq!(binder.state(), BindState::Failed);
        assert!(dialer.closed());
        assert!(dialer.connection.borrow().sent.is_empty());
    }

    #[test]
    fn state_names_are_stable() {
        let names: Vec<_> = [
            BindState::Idle,
            BindState::Validated,
            BindState::Connected,
            BindState::ClientBuilt,
            BindState::Bound,
            BindState::Failed,
        ]
        .into_iter()
        .map(BindState::name)
        .collect();
        assert_eq!(
            names,
            ["Idle", "Validated", "Connected", "ClientBuilt", "Bound", "Failed"]
        );
        assert!(BindState::Failed.is_terminal() && !BindState::Connected.is_terminal());
    }
}
