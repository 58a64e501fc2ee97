// This file is part of CATENA.
//
// Copyright (C) 2022 Affidaty Spa.
//
// CATENA is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// CATENA is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with CATENA. If not, see <https://www.gnu.org/licenses/>.

//! Ed25519 keys and signatures.
//!
//! Public keys are carried around as raw 32-byte values so they can be used
//! as map keys; point validity is checked at verification time.

use crate::{crypto::hash::Hash, Error, ErrorKind, Result};
use ed25519_dalek::{
    Keypair as KeyPairImpl, PublicKey as PublicKeyImpl, SecretKey, Signer as _, Verifier as _,
};
use rand::rngs::OsRng;
use serde::{self, de::Visitor, Deserialize, Serialize};
use std::convert::TryFrom;

/// Public key length in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

pub struct KeyPair(KeyPairImpl);

/// Raw Ed25519 public key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl KeyPair {
    /// Construct from the 32-byte secret key, deriving the public half.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<KeyPair> {
        let secret = SecretKey::from_bytes(bytes)
            .map_err(|err| Error::new_ext(ErrorKind::MalformedData, err))?;
        let public = PublicKeyImpl::from(&secret);
        Ok(KeyPair(KeyPairImpl { secret, public }))
    }

    pub fn from_random() -> KeyPair {
        let mut csprng = OsRng {};
        let internal = KeyPairImpl::generate(&mut csprng);
        KeyPair(internal)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let sig = self.0.sign(data).to_bytes().to_vec();
        Ok(sig)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public.to_bytes())
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<PublicKey> {
        let bytes = <[u8; PUBLIC_KEY_LEN]>::try_from(bytes)
            .map_err(|_| Error::new(ErrorKind::MalformedData))?;
        Ok(PublicKey(bytes))
    }

    /// Creates a new instance from a hex string.
    pub fn from_hex(hex: &str) -> Result<PublicKey> {
        match hex::decode(hex) {
            Ok(buf) => Self::from_bytes(&buf),
            Err(_) => Err(Error::new(ErrorKind::MalformedData)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify `sig` over `data`. An invalid point or signature encoding simply
    /// fails the verification.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        let imp = match PublicKeyImpl::from_bytes(&self.0) {
            Ok(imp) => imp,
            Err(_) => return false,
        };
        ed25519_dalek::Signature::try_from(sig)
            .and_then(|s| imp.verify(data, &s))
            .is_ok()
    }

    /// Derive the account address: the first 8 bytes (big-endian) of the
    /// public key digest.
    pub fn to_address(&self) -> u64 {
        let digest = Hash::from_data(&self.0);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(buf)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'v> Visitor<'v> for BytesVisitor {
            type Value = PublicKey;

            fn expecting(
                &self,
                fmt: &mut std::fmt::Formatter<'_>,
            ) -> std::result::Result<(), std::fmt::Error> {
                write!(fmt, "expecting byte array.")
            }

            fn visit_bytes<E>(self, bytes: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                PublicKey::from_bytes(bytes)
                    .map_err(|_err| serde::de::Error::custom("Invalid public key"))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(&v)
            }
        }
        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::base::serialize::{rmp_deserialize, rmp_serialize};

    /// Deterministic keypair used across the test suites. The index selects
    /// distinct keys for multi-delegate scenarios.
    pub fn test_keypair(index: u8) -> KeyPair {
        let mut seed = [0x42u8; 32];
        seed[0] = index;
        KeyPair::from_secret_bytes(&seed).unwrap()
    }

    pub fn test_public_key(index: u8) -> PublicKey {
        test_keypair(index).public_key()
    }

    #[test]
    fn sign_verify() {
        let keypair = test_keypair(0);
        let data = b"hello world";

        let sig = keypair.sign(data).unwrap();

        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(keypair.public_key().verify(data, &sig));
    }

    #[test]
    fn verify_tampered_data() {
        let keypair = test_keypair(0);
        let sig = keypair.sign(b"hello world").unwrap();

        assert!(!keypair.public_key().verify(b"hello wArld", &sig));
    }

    #[test]
    fn verify_wrong_key() {
        let sig = test_keypair(0).sign(b"hello world").unwrap();

        assert!(!test_public_key(1).verify(b"hello world", &sig));
    }

    #[test]
    fn verify_garbage_signature() {
        let public = test_public_key(0);

        assert!(!public.verify(b"hello world", &[0u8; 3]));
    }

    #[test]
    fn address_is_deterministic() {
        let addr0 = test_public_key(0).to_address();
        let addr1 = test_public_key(1).to_address();

        assert_eq!(addr0, test_public_key(0).to_address());
        assert_ne!(addr0, addr1);
    }

    #[test]
    fn public_key_serialize_deserialize() {
        let expected = test_public_key(0);

        let buf = rmp_serialize(&expected).unwrap();
        let public: PublicKey = rmp_deserialize(&buf).unwrap();

        assert_eq!(public, expected);
    }

    #[test]
    fn random_keypair_sign_verify() {
        let keypair = KeyPair::from_random();
        let data = b"hello world";

        let sign = keypair.sign(data).unwrap();

        assert!(keypair.public_key().verify(data, &sign));
    }
}
