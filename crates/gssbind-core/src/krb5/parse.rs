//! krb5.conf reader.
//!
//! Understands the subset of the MIT profile syntax a client needs:
//! `[libdefaults]`, `[realms]` and `[domain_realm]`. Other sections, nested
//! relation blocks and unknown keys are skipped.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use super::{
    DEFAULT_ENCRYPTION_TYPES, EncryptionType, KerberosConfig, KerberosConfigError, LibDefaults,
    RealmEntry,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: expected `key = value`")]
    ExpectedAssignment { line: usize },

    #[error("line {line}: relation outside of any section")]
    OutsideSection { line: usize },

    #[error("line {line}: unexpected `}}`")]
    UnexpectedClose { line: usize },

    #[error("line {line}: invalid value {value:?} for {key}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },

    #[error("unterminated block at end of file")]
    UnterminatedBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    LibDefaults,
    Realms,
    DomainRealm,
    Other,
}

impl KerberosConfig {
    /// Parses krb5.conf text.
    pub fn from_krb5_conf(text: &str) -> Result<Self, ParseError> {
        Parser::default().run(text)
    }

    /// Reads and parses a krb5.conf file.
    pub fn load(path: &Path) -> Result<Self, KerberosConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| KerberosConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_krb5_conf(&text).map_err(|source| KerberosConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Default)]
struct Parser {
    config: KerberosConfig,
    section: Option<Section>,
    realm: Option<RealmEntry>,
    skip_depth: usize,
}

impl Parser {
    fn run(mut self, text: &str) -> Result<KerberosConfig, ParseError> {
        self.config.lib_defaults = LibDefaults::default();

        for (index, raw) in text.lines().enumerate() {
            self.line(index + 1, raw.trim())?;
        }

        if self.realm.is_some() || self.skip_depth > 0 {
            return Err(ParseError::UnterminatedBlock);
        }
        Ok(self.config)
    }

    fn line(&mut self, line: usize, trimmed: &str) -> Result<(), ParseError> {
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            return Ok(());
        }

        if self.realm.is_none() && self.skip_depth == 0 {
            if let Some(header) = trimmed.strip_prefix('[') {
                let name = header.split(']').next().unwrap_or_default().trim();
                self.section = Some(match name {
                    "libdefaults" => Section::LibDefaults,
                    "realms" => Section::Realms,
                    "domain_realm" => Section::DomainRealm,
                    _ => Section::Other,
                });
                return Ok(());
            }

            if trimmed.starts_with("include") {
                warn!(directive = trimmed, "ignoring krb5.conf include directive");
                return Ok(());
            }
        }

        if trimmed.starts_with('}') {
            return self.close_block(line);
        }

        let (key, value) = trimmed
            .split_once('=')
            .ok_or(ParseError::ExpectedAssignment { line })?;
        let key = key.trim().trim_end_matches('*').trim();
        let value = value.trim();

        if value == "{" {
            self.open_block(line, key)?;
            return Ok(());
        }

        if self.skip_depth > 0 {
            return Ok(());
        }

        if let Some(realm) = self.realm.as_mut() {
            apply_realm_relation(realm, key, value);
            return Ok(());
        }

        match self.section {
            None => Err(ParseError::OutsideSection { line }),
            Some(Section::LibDefaults) => {
                apply_lib_default(&mut self.config.lib_defaults, line, key, value)
            }
            Some(Section::DomainRealm) => {
                self.config
                    .domain_realm
                    .insert(key.to_ascii_lowercase(), value.to_uppercase());
                Ok(())
            }
            Some(Section::Realms) => Err(ParseError::InvalidValue {
                line,
                key: key.to_owned(),
                value: value.to_owned(),
            }),
            Some(Section::Other) => Ok(()),
        }
    }

    fn open_block(&mut self, line: usize, key: &str) -> Result<(), ParseError> {
        match self.section {
            None => Err(ParseError::OutsideSection { line }),
            Some(Section::Realms) if self.realm.is_none() && self.skip_depth == 0 => {
                self.realm = Some(RealmEntry {
                    realm: key.to_uppercase(),
                    ..RealmEntry::default()
                });
                Ok(())
            }
            Some(_) => {
                self.skip_depth += 1;
                Ok(())
            }
        }
    }

    fn close_block(&mut self, line: usize) -> Result<(), ParseError> {
        if self.skip_depth > 0 {
            self.skip_depth -= 1;
            return Ok(());
        }

        let realm = self.realm.take().ok_or(ParseError::UnexpectedClose { line })?;
        debug!(realm = %realm.realm, kdcs = realm.kdc.len(), "parsed realm");
        self.config.realms.push(realm);
        Ok(())
    }
}

fn apply_realm_relation(realm: &mut RealmEntry, key: &str, value: &str) {
    match key {
        "kdc" => realm.kdc.push(value.to_owned()),
        "admin_server" => realm.admin_server.push(value.to_owned()),
        "kpasswd_server" => realm.kpasswd_server.push(value.to_owned()),
        "master_kdc" => realm.master_kdc.push(value.to_owned()),
        "default_domain" => value.clone_into(&mut realm.default_domain),
        other => debug!(key = other, realm = %realm.realm, "ignoring realm relation"),
    }
}

fn apply_lib_default(
    defaults: &mut LibDefaults,
    line: usize,
    key: &str,
    value: &str,
) -> Result<(), ParseError> {
    let invalid = || ParseError::InvalidValue {
        line,
        key: key.to_owned(),
        value: value.to_owned(),
    };

    match key {
        "default_realm" => defaults.default_realm = value.to_uppercase(),
        "allow_weak_crypto" => defaults.allow_weak_crypto = parse_bool(value).ok_or_else(invalid)?,
        "dns_lookup_realm" => defaults.dns_lookup_realm = parse_bool(value).ok_or_else(invalid)?,
        "dns_lookup_kdc" => defaults.dns_lookup_kdc = parse_bool(value).ok_or_else(invalid)?,
        "dns_fallback" => {
            let enabled = parse_bool(value).ok_or_else(invalid)?;
            defaults.dns_lookup_realm = enabled;
            defaults.dns_lookup_kdc = enabled;
        }
        "ticket_lifetime" => defaults.ticket_lifetime = parse_duration(value).ok_or_else(invalid)?,
        "renew_lifetime" => defaults.renew_lifetime = parse_duration(value).ok_or_else(invalid)?,
        "forwardable" => defaults.forwardable = parse_bool(value).ok_or_else(invalid)?,
        "proxiable" => defaults.proxiable = parse_bool(value).ok_or_else(invalid)?,
        "rdns" => defaults.rdns = parse_bool(value).ok_or_else(invalid)?,
        "udp_preference_limit" => {
            defaults.udp_preference_limit = value.parse().map_err(|_| invalid())?;
        }
        "default_tgs_enctypes" => defaults.default_tgs_enctypes = parse_enctypes(value),
        "default_tkt_enctypes" => defaults.default_tkt_enctypes = parse_enctypes(value),
        "permitted_enctypes" => defaults.permitted_enctypes = parse_enctypes(value),
        "preferred_preauth_types" => {
            defaults.preferred_preauth_types = value
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|item| !item.is_empty())
                .map(str::parse)
                .collect::<Result<_, _>>()
                .map_err(|_| invalid())?;
        }
        other => debug!(key = other, "ignoring libdefaults relation"),
    }
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" | "nil" => Some(false),
        _ => None,
    }
}

/// Accepts plain seconds, `HH:MM[:SS]`, or unit runs such as `1d 10h 30m 5s`.
pub(crate) fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if value.contains(':') {
        let parts = value
            .split(':')
            .map(str::parse::<u64>)
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        let (hours, minutes, seconds) = match parts.as_slice() {
            &[hours, minutes] => (hours, minutes, 0),
            &[hours, minutes, seconds] => (hours, minutes, seconds),
            _ => return None,
        };
        let total = hours
            .checked_mul(3_600)?
            .checked_add(minutes.checked_mul(60)?)?
            .checked_add(seconds)?;
        return Some(Duration::from_secs(total));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in value.chars().filter(|c| !c.is_whitespace()) {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        let amount: u64 = digits.parse().ok()?;
        total = total.checked_add(amount.checked_mul(unit)?)?;
        digits.clear();
    }

    if !digits.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total))
}

fn parse_enctypes(value: &str) -> Vec<EncryptionType> {
    let mut enctypes = Vec::new();
    for token in value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
    {
        let expanded: Vec<EncryptionType> = match token.to_ascii_lowercase().as_str() {
            "default" => DEFAULT_ENCRYPTION_TYPES.to_vec(),
            "aes" => vec![
                EncryptionType::Aes256CtsHmacSha196,
                EncryptionType::Aes128CtsHmacSha196,
                EncryptionType::Aes256CtsHmacSha384192,
                EncryptionType::Aes128CtsHmacSha256128,
            ],
            "rc4" => vec![EncryptionType::Arcfour],
            "des3" => vec![EncryptionType::Des3CbcSha1],
            _ => match token.parse() {
                Ok(etype) => vec![etype],
                Err(err) => {
                    debug!(%err, "skipping unsupported encryption type");
                    Vec::new()
                }
            },
        };

        for etype in expanded {
            if !enctypes.contains(&etype) {
                enctypes.push(etype);
            }
        }
    }
    enctypes
}
