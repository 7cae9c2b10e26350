// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The authenticated encryption primitive used to seal buckets.

use crate::{Iv, Tag, IV_SIZE};
use chacha20poly1305::{
    aead::{AeadInPlace, Error as AeadError},
    ChaCha20Poly1305, Key, KeyInit, Nonce,
};
use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An AEAD with detached tags, operating in place.
pub trait AuthenticatedCipher: Send + Sync {
    /// Encrypts `buffer` in place under `iv`, authenticating `associated_data` too.
    fn encrypt(&self, iv: &Iv, associated_data: &[u8], buffer: &mut [u8])
        -> Result<Tag, AeadError>;

    /// Decrypts `buffer` in place, failing if `tag` does not authenticate it together
    /// with `associated_data`.
    fn decrypt(
        &self,
        iv: &Iv,
        associated_data: &[u8],
        buffer: &mut [u8],
        tag: &Tag,
    ) -> Result<(), AeadError>;
}

/// ChaCha20-Poly1305 under a key drawn at construction time and never exported.
#[derive(ZeroizeOnDrop)]
pub struct ChaChaCipher {
    inner: ChaCha20Poly1305,
}

impl ChaChaCipher {
    /// Creates a cipher with a fresh random key.
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key[..]);
        let inner = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Self { inner }
    }
}

impl std::fmt::Debug for ChaChaCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChaChaCipher")
    }
}

impl AuthenticatedCipher for ChaChaCipher {
    fn encrypt(
        &self,
        iv: &Iv,
        associated_data: &[u8],
        buffer: &mut [u8],
    ) -> Result<Tag, AeadError> {
        let tag =
            self.inner
                .encrypt_in_place_detached(Nonce::from_slice(iv), associated_data, buffer)?;
        let mut result = [0u8; 16];
        result.copy_from_slice(tag.as_slice());
        Ok(result)
    }

    fn decrypt(
        &self,
        iv: &Iv,
        associated_data: &[u8],
        buffer: &mut [u8],
        tag: &Tag,
    ) -> Result<(), AeadError> {
        self.inner.decrypt_in_place_detached(
            Nonce::from_slice(iv),
            associated_data,
            buffer,
            chacha20poly1305::Tag::from_slice(tag),
        )
    }
}

/// Draws a fresh random IV.
pub fn random_iv<R: RngCore + CryptoRng>(rng: &mut R) -> Iv {
    let mut iv = [0u8; IV_SIZE];
    rng.fill_bytes(&mut iv);
    iv
}
