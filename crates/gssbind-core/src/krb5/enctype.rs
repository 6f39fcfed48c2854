use std::fmt::Display;
use std::str::FromStr;

/// Kerberos encryption types understood by the configuration layer.
///
/// Each variant carries both its krb5.conf name and its IANA number so the
/// name and identifier lists of a configuration can never drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionType {
    Aes256CtsHmacSha196,
    Aes128CtsHmacSha196,
    Aes256CtsHmacSha384192,
    Aes128CtsHmacSha256128,
    Arcfour,
    Des3CbcSha1,
}

impl EncryptionType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aes256CtsHmacSha196 => "aes256-cts-hmac-sha1-96",
            Self::Aes128CtsHmacSha196 => "aes128-cts-hmac-sha1-96",
            Self::Aes256CtsHmacSha384192 => "aes256-cts-hmac-sha384-192",
            Self::Aes128CtsHmacSha256128 => "aes128-cts-hmac-sha256-128",
            Self::Arcfour => "arcfour-hmac-md5",
            Self::Des3CbcSha1 => "des3-cbc-sha1",
        }
    }

    pub const fn id(self) -> i32 {
        match self {
            Self::Aes256CtsHmacSha196 => 18,
            Self::Aes128CtsHmacSha196 => 17,
            Self::Aes256CtsHmacSha384192 => 20,
            Self::Aes128CtsHmacSha256128 => 19,
            Self::Arcfour => 23,
            Self::Des3CbcSha1 => 16,
        }
    }

    /// Ciphers considered weak by MIT krb5 (`allow_weak_crypto` gates them).
    pub const fn is_weak(self) -> bool {
        matches!(self, Self::Arcfour | Self::Des3CbcSha1)
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|etype| etype.id() == id)
    }

    const ALL: [Self; 6] = [
        Self::Aes256CtsHmacSha196,
        Self::Aes128CtsHmacSha196,
        Self::Aes256CtsHmacSha384192,
        Self::Aes128CtsHmacSha256128,
        Self::Arcfour,
        Self::Des3CbcSha1,
    ];
}

/// The compatibility set used when the caller does not choose one:
/// AES-256, AES-128, then RC4 for older domain controllers.
pub const DEFAULT_ENCRYPTION_TYPES: [EncryptionType; 3] = [
    EncryptionType::Aes256CtsHmacSha196,
    EncryptionType::Aes128CtsHmacSha196,
    EncryptionType::Arcfour,
];

impl Display for EncryptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown encryption type: {0}")]
pub struct UnknownEncryptionType(pub String);

impl FromStr for EncryptionType {
    type Err = UnknownEncryptionType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lowered = value.trim().to_ascii_lowercase();
        // Aliases accepted by MIT krb5 for the same ciphers.
        let canonical = match lowered.as_str() {
            "aes256-cts" | "aes256-sha1" => "aes256-cts-hmac-sha1-96",
            "aes128-cts" | "aes128-sha1" => "aes128-cts-hmac-sha1-96",
            "aes256-sha2" => "aes256-cts-hmac-sha384-192",
            "aes128-sha2" => "aes128-cts-hmac-sha256-128",
            "rc4-hmac" | "arcfour-hmac" => "arcfour-hmac-md5",
            "des3-hmac-sha1" | "des3-cbc-sha1-kd" => "des3-cbc-sha1",
            other => other,
        };

        Self::ALL
            .into_iter()
            .find(|etype| etype.name() == canonical)
            .or_else(|| canonical.parse::<i32>().ok().and_then(Self::from_id))
            .ok_or_else(|| UnknownEncryptionType(value.to_owned()))
    }
}
