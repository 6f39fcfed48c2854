/// User name and password handed to the Kerberos client.
///
/// The password is kept out of `Debug` output so credentials can travel
/// through instrumented functions without ending up in logs.
#[derive(Clone)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Account name without any `DOMAIN\` prefix or `@realm` suffix.
    pub fn account_name(&self) -> &str {
        let user = self
            .user
            .rsplit_once('\\')
            .map_or(self.user.as_str(), |(_, account)| account);
        user.split_once('@').map_or(user, |(account, _)| account)
    }

    /// Realm named by a `user@REALM` principal, if any.
    pub fn principal_realm(&self) -> Option<&str> {
        self.user
            .split_once('@')
            .map(|(_, realm)| realm)
            .filter(|realm| !realm.is_empty())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_password() {
        let creds = Credentials::new("alice", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn splits_account_and_realm() {
        let upn = Credentials::new("alice@EXAMPLE.LOCAL", "x");
        assert_eq!(upn.account_name(), "alice");
        assert_eq!(upn.principal_realm(), Some("EXAMPLE.LOCAL"));

        let down_level = Credentials::new("EXAMPLE\\bob", "x");
        assert_eq!(down_level.account_name(), "bob");
        assert_eq!(down_level.principal_realm(), None);

        assert_eq!(Credentials::new("carol", "x").account_name(), "carol");
    }
}
