/*
 * SPDX-FileCopyrightText: 2026 Townsquare Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};

/// Signing material of a local actor.
#[derive(Clone)]
pub struct KeyPair {
    pub key_id: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .field("public_key_pem", &self.public_key_pem)
            .finish_non_exhaustive()
    }
}

/// PEM-encoded (public, private) pair, before it is bound to an actor.
#[derive(Clone)]
pub struct GeneratedKeys {
    pub public_key_pem: String,
    pub private_key_pem: String,
}

pub fn key_id_for(actor_url: &str) -> String {
    format!("{actor_url}#main-key")
}

pub fn generate_rsa_keys(bits: usize) -> Result<GeneratedKeys> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits).context("generate rsa key")?;
    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .context("encode private key pem")?
        .to_string();
    let public_key_pem = RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)
        .context("encode public key pem")?;
    Ok(GeneratedKeys {
        public_key_pem,
        private_key_pem,
    })
}

/// RSA key generation is CPU bound; keep it off the async workers.
pub async fn generate_rsa_keys_blocking(bits: usize) -> Result<GeneratedKeys> {
    tokio::task::spawn_blocking(move || generate_rsa_keys(bits))
        .await
        .context("key generation task")?
}
