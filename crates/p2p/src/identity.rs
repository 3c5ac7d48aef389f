//! Deterministic node identity.
//!
//! The Ed25519 secret key is the SHA-256 digest of a configured seed, so a
//! node restarted with the same seed keeps its `PeerId`.

use anyhow::{anyhow, bail, Result};
use libp2p::identity;
use libp2p::PeerId;
use sha2::{Digest, Sha256};

/// Derive the node keypair from `seed`.
pub fn keypair_from_seed(seed: &str) -> Result<identity::Keypair> {
    if seed.trim().is_empty() {
        bail!("identity seed must not be empty");
    }
    let digest: [u8; 32] = Sha256::digest(seed.as_bytes()).into();
    identity::Keypair::ed25519_from_bytes(digest)
        .map_err(|e| anyhow!("derive ed25519 identity from seed: {e}"))
}

/// `PeerId` that `seed` resolves to.
pub fn peer_id_from_seed(seed: &str) -> Result<PeerId> {
    Ok(keypair_from_seed(seed)?.public().to_peer_id())
}
