use bitcoin::hashes::{sha256d, Hash};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

const SECRET_LENGTH: usize = 32;

/// The redemption credential of a swap.
///
/// Created once by the initiator and revealed only inside a redeem
/// transaction. `Debug` never prints the value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Secret([u8; SECRET_LENGTH]);

impl Secret {
    /// Generates a fresh secret from the operating system's CSPRNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    pub fn generate_with<R>(rng: &mut R) -> Self
    where
        R: RngCore + CryptoRng,
    {
        let mut bytes = [0u8; SECRET_LENGTH];
        rng.fill_bytes(&mut bytes);

        Secret(bytes)
    }

    pub fn from_vec(vec: &[u8]) -> Result<Secret, InvalidLength> {
        if vec.len() != SECRET_LENGTH {
            return Err(InvalidLength {
                expected: SECRET_LENGTH,
                got: vec.len(),
            });
        }

        let mut bytes = [0u8; SECRET_LENGTH];
        bytes.copy_from_slice(vec);

        Ok(Secret(bytes))
    }

    pub fn hash(&self) -> SecretHash {
        SecretHash::new(*self)
    }

    pub fn as_raw_secret(&self) -> &[u8; SECRET_LENGTH] {
        &self.0
    }

    pub fn into_raw_secret(self) -> [u8; SECRET_LENGTH] {
        self.0
    }
}

impl From<[u8; SECRET_LENGTH]> for Secret {
    fn from(bytes: [u8; SECRET_LENGTH]) -> Self {
        Secret(bytes)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl fmt::LowerHex for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for Secret {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vec = hex::decode(s.trim_start_matches("0x"))?;
        let secret = Secret::from_vec(&vec)?;

        Ok(secret)
    }
}

/// Double SHA-256 commitment to a [`Secret`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretHash([u8; SECRET_LENGTH]);

impl SecretHash {
    pub fn new(secret: Secret) -> Self {
        let hash = sha256d::Hash::hash(secret.as_raw_secret());

        SecretHash(hash.into_inner())
    }

    /// Recomputes the hash of `secret` and compares it with `self`.
    ///
    /// This is the only way a revealed secret may be accepted: a hash
    /// supplied alongside a secret is never trusted.
    pub fn verify(&self, secret: &Secret) -> bool {
        SecretHash::new(*secret) == *self
    }

    pub fn from_vec(vec: &[u8]) -> Result<SecretHash, InvalidLength> {
        let secret = Secret::from_vec(vec)?;

        Ok(SecretHash(secret.into_raw_secret()))
    }

    pub fn as_raw(&self) -> &[u8; SECRET_LENGTH] {
        &self.0
    }

    pub fn into_raw(self) -> [u8; SECRET_LENGTH] {
        self.0
    }
}

impl From<[u8; SECRET_LENGTH]> for SecretHash {
    fn from(bytes: [u8; SECRET_LENGTH]) -> Self {
        SecretHash(bytes)
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({})", hex::encode(&self.0))
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for SecretHash {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vec = hex::decode(s.trim_start_matches("0x"))?;
        let hash = SecretHash::from_vec(&vec)?;

        Ok(hash)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
#[error("expected {expected} bytes, got {got}")]
pub struct InvalidLength {
    expected: usize,
    got: usize,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FromHexError {
    #[error("invalid hex")]
    Hex(#[from] hex::FromHexError),
    #[error(transparent)]
    Length(#[from] InvalidLength),
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Secret::from_str(&hex).map_err(de::Error::custom)
    }
}

impl Serialize for SecretHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SecretHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        SecretHash::from_str(&hex).map_err(de::Error::custom)
    }
}
