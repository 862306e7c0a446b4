//! # Diffie-Hellman Key Agreement
//!
//! Arithmetic over the multiplicative group modulo a safe prime `p` with
//! generator `g`. The handshake combines three operations:
//!
//! | Operation | Result |
//! |-----------|--------|
//! | [`DhGroup::generate_keypair`] | `(x, g^x mod p)` |
//! | [`DhGroup::shared_secret`] | `peer^x mod p` |
//! | [`DhGroup::weighted_power`] | `base^e mod p` (folds the password verifier into the exchange) |
//!
//! The password-derived secret `g^H(password ‖ salt) mod p` equals the
//! verifier the server stores for that user, so both sides can reach the
//! same `weighted_power(server_public, verifier)` value without the
//! password crossing the wire.
//!
//! All group elements travel as fixed-width big-endian byte strings of
//! exactly `|p|` bytes, so hash inputs never depend on the length of a
//! decimal rendering.

use num_bigint::{BigUint, RandBigInt};
use num_traits::{Num, One};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::ProtocolError;

/// The 1536-bit MODP safe prime (RFC 3526, group 5).
pub const MODP_1536_PRIME_HEX: &str = "ffffffffffffffffc90fdaa22168c234c4c6628b80dc1cd129024\
    e088a67cc74020bbea63b139b22514a08798e3404ddef9519b3cd\
    3a431b302b0a6df25f14374fe1356d6d51c245e485b576625e7ec\
    6f44c42e9a637ed6b0bff5cb6f406b7edee386bfb5a899fa5ae9f\
    24117c4b1fe649286651ece45b3dc2007cb8a163bf0598da48361\
    c55d39a69163fa8fd24cf5f83655d23dca3ad961c62f356208552\
    bb9ed529077096966d670c354e4abc9804f1746c08ca237327fff\
    fffffffffffff";

pub const DEFAULT_GENERATOR: u32 = 2;

#[derive(Clone, PartialEq, Eq)]
pub struct DhGroup {
    p: BigUint,
    g: BigUint,
    width: usize,
}

impl DhGroup {
    pub fn new(p: BigUint, g: BigUint) -> Result<Self, ProtocolError> {
        if p <= BigUint::from(5u32) {
            return Err(ProtocolError::Malformed("prime too small"));
        }
        let p_minus_one = &p - BigUint::one();
        if g <= BigUint::one() || g >= p_minus_one {
            return Err(ProtocolError::Malformed("generator outside (1, p-1)"));
        }
        let width = (p.bits() as usize).div_ceil(8);
        Ok(Self { p, g, width })
    }

    pub fn modp_1536() -> Self {
        let p = BigUint::from_str_radix(MODP_1536_PRIME_HEX, 16)
            .unwrap_or_else(|_| unreachable!("MODP_1536_PRIME_HEX is valid hex"));
        Self {
            width: (p.bits() as usize).div_ceil(8),
            p,
            g: BigUint::from(DEFAULT_GENERATOR),
        }
    }

    pub fn prime(&self) -> &BigUint {
        &self.p
    }

    pub fn generator(&self) -> &BigUint {
        &self.g
    }

    /// Byte length of every encoded group element.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Generate a fresh keypair with a private exponent in `[2, p-2]`.
    pub fn generate_keypair(&self) -> DhKeypair {
        let low = BigUint::from(2u32);
        let high = &self.p - BigUint::one();
        let private = OsRng.gen_biguint_range(&low, &high);
        let public = self.g.modpow(&private, &self.p);
        DhKeypair { private, public }
    }

    /// Compute `peer_public^own_private mod p`.
    ///
    /// Rejects peer values outside `[2, p-2]`, which would pin the
    /// secret to a trivial subgroup.
    pub fn shared_secret(&self, own: &DhKeypair, peer_public: &BigUint) -> Result<BigUint, ProtocolError> {
        self.check_element(peer_public)?;
        Ok(peer_public.modpow(&own.private, &self.p))
    }

    /// Compute `base^exponent mod p`.
    pub fn weighted_power(&self, base: &BigUint, exponent: &BigUint) -> BigUint {
        base.modpow(exponent, &self.p)
    }

    /// Compute `g^SHA-256(password ‖ salt) mod p`.
    ///
    /// Client side this is the transient password secret; server side the
    /// same value is the stored verifier.
    pub fn password_secret(&self, password: &[u8], salt: &[u8]) -> BigUint {
        let mut hasher = Sha256::new();
        hasher.update(password);
        hasher.update(salt);
        let exponent = BigUint::from_bytes_be(&hasher.finalize());
        self.g.modpow(&exponent, &self.p)
    }

    /// Encode a group element as exactly [`width`](Self::width) big-endian bytes.
    pub fn encode(&self, value: &BigUint) -> Vec<u8> {
        let bytes = value.to_bytes_be();
        let mut out = vec![0u8; self.width.saturating_sub(bytes.len())];
        out.extend_from_slice(&bytes);
        out
    }

    /// Decode a peer's public value, enforcing width and range.
    pub fn decode_public(&self, bytes: &[u8]) -> Result<BigUint, ProtocolError> {
        if bytes.len() != self.width {
            return Err(ProtocolError::Malformed("public value has wrong width"));
        }
        let value = BigUint::from_bytes_be(bytes);
        self.check_element(&value)?;
        Ok(value)
    }

    fn check_element(&self, value: &BigUint) -> Result<(), ProtocolError> {
        let p_minus_one = &self.p - BigUint::one();
        if *value <= BigUint::one() || *value >= p_minus_one {
            return Err(ProtocolError::Malformed("public value outside [2, p-2]"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for DhGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhGroup")
            .field("bits", &self.p.bits())
            .field("g", &self.g)
            .finish()
    }
}

/// A per-attempt keypair. Never reused across handshake attempts.
pub struct DhKeypair {
    private: BigUint,
    public: BigUint,
}

impl DhKeypair {
    pub fn public(&self) -> &BigUint {
        &self.public
    }
}

impl std::fmt::Debug for DhKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeypair")
            .field("public_bits", &self.public.bits())
            .finish_non_exhaustive()
    }
}
