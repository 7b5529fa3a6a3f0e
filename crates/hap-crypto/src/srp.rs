//! SRP-6a for HomeKit pair-setup.
//!
//! Group rfc5054.3072 (N = RFC 5054 3072-bit prime, g = 5), SHA-512, with
//! the RFC 2945 key derivative `x = H(salt | H(identity | ":" | password))`.
//! [`SrpServer`] is the accessory seat; [`SrpClient`] implements the
//! controller seat and drives the protocol round-trip tests.

use hap_core::error::CryptoError;
use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// N size in bytes (3072 bits).
const N_BYTES: usize = 384;

/// Salt length used by pair-setup.
pub const SRP_SALT_LENGTH: usize = 16;

/// RFC 5054 3072-bit prime N as hex string.
const RFC5054_N_3072: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08",
    "8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B",
    "302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9",
    "A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6",
    "49286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8",
    "FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C",
    "180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D",
    "04507A33A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7D",
    "B3970F85A6E1E4C7ABF5AE8CDB0933D71E8C94E04A25619DCEE3D226",
    "1AD2EE6BF12FFA06D98A0864D87602733EC86A64521F2B18177B200C",
    "BBE117577A615D6C770988C0BAD946E208E24FA074E5AB3143DB5BFC",
    "E0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF"
);

/// SRP-6a parameters (3072-bit, RFC 5054).
pub struct SrpParams {
    /// Prime modulus N.
    pub n: BigUint,
    /// Generator g (always 5).
    pub g: BigUint,
}

impl Default for SrpParams {
    fn default() -> Self {
        let n = BigUint::parse_bytes(RFC5054_N_3072.as_bytes(), 16)
            .expect("Invalid RFC 5054 prime constant");
        let g = BigUint::from(5u32);
        Self { n, g }
    }
}

/// Server-side SRP session: holds the verifier for one identity/password
/// pair and walks through key exchange and proof verification.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SrpServer {
    #[zeroize(skip)]
    params: SrpParams,
    identity: Vec<u8>,
    salt: [u8; SRP_SALT_LENGTH],
    #[zeroize(skip)]
    verifier: BigUint,
    #[zeroize(skip)]
    private_key: BigUint,
    #[zeroize(skip)]
    public_key: BigUint,
    #[zeroize(skip)]
    client_public: Option<BigUint>,
    shared_secret: Option<Vec<u8>>,
}

impl SrpServer {
    /// Create a server session with a random salt and ephemeral key.
    pub fn new(identity: &[u8], password: &[u8]) -> Self {
        let mut salt = [0u8; SRP_SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        let b = OsRng.gen_biguint(256);
        Self::with_salt_and_private(identity, password, salt, b)
    }

    fn with_salt_and_private(
        identity: &[u8],
        password: &[u8],
        salt: [u8; SRP_SALT_LENGTH],
        b: BigUint,
    ) -> Self {
        let params = SrpParams::default();

        // Verifier v = g^x mod N
        let x = compute_x(&salt, identity, password);
        let verifier = params.g.modpow(&x, &params.n);

        // Server public key B = (k*v + g^b) mod N
        let k = compute_k(&params);
        let g_b = params.g.modpow(&b, &params.n);
        let k_v = (&k * &verifier) % &params.n;
        let public_key = (&k_v + &g_b) % &params.n;

        Self {
            params,
            identity: identity.to_vec(),
            salt,
            verifier,
            private_key: b,
            public_key,
            client_public: None,
            shared_secret: None,
        }
    }

    /// The 16-byte salt sent in the first reply.
    pub fn salt(&self) -> [u8; SRP_SALT_LENGTH] {
        self.salt
    }

    /// Server public key B (384 bytes, left-padded).
    pub fn public_key(&self) -> Vec<u8> {
        pad_to_n(&self.public_key)
    }

    /// Install the client public key A and derive the shared secret
    /// `K = H(PAD(S))` with `S = (A * v^u)^b mod N`.
    pub fn set_client_public(&mut self, client_public: &[u8]) -> Result<(), CryptoError> {
        let a = BigUint::from_bytes_be(client_public);

        // A mod N = 0 would force S = 0
        if &a % &self.params.n == BigUint::ZERO {
            return Err(CryptoError::KeyDerivation(
                "Invalid client public key: A mod N = 0".to_string(),
            ));
        }

        let u = compute_u(&a, &self.public_key);
        if u == BigUint::ZERO {
            return Err(CryptoError::KeyDerivation(
                "Invalid u value: u = 0".to_string(),
            ));
        }

        // S = (A * v^u)^b mod N
        let v_u = self.verifier.modpow(&u, &self.params.n);
        let base = (&a * &v_u) % &self.params.n;
        let s = base.modpow(&self.private_key, &self.params.n);

        let mut hasher = Sha512::new();
        hasher.update(pad_to_n(&s));
        self.shared_secret = Some(hasher.finalize().to_vec());
        self.client_public = Some(a);
        Ok(())
    }

    /// The 64-byte shared secret, available after key exchange.
    pub fn shared_secret(&self) -> Option<&[u8]> {
        self.shared_secret.as_deref()
    }

    /// Verify the client proof M1 in constant time and return the server
    /// proof `M2 = H(PAD(A) | M1 | K)`.
    pub fn verify_client_proof(&self, client_proof: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (a, k) = match (&self.client_public, &self.shared_secret) {
            (Some(a), Some(k)) => (a, k),
            _ => {
                return Err(CryptoError::KeyDerivation(
                    "Client public key not installed".to_string(),
                ))
            }
        };

        let expected_m1 = compute_m1(
            &self.params,
            &self.identity,
            &self.salt,
            a,
            &self.public_key,
            k,
        );

        if !bool::from(client_proof.ct_eq(&expected_m1)) {
            return Err(CryptoError::KeyDerivation(
                "Client proof is invalid".to_string(),
            ));
        }

        let mut hasher = Sha512::new();
        hasher.update(pad_to_n(a));
        hasher.update(&expected_m1);
        hasher.update(k);
        Ok(hasher.finalize().to_vec())
    }
}

/// Client-side SRP session, the controller's half of the exchange.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SrpClient {
    #[zeroize(skip)]
    params: SrpParams,
    identity: Vec<u8>,
    password: Vec<u8>,
    private_key: Vec<u8>,
    #[zeroize(skip)]
    public_key: BigUint,
}

/// Result of processing the server challenge.
pub struct SrpClientProof {
    pub client_proof: Vec<u8>,
    pub shared_secret: Vec<u8>,
    pub expected_server_proof: Vec<u8>,
}

impl SrpClient {
    /// Create new SRP client; identity is "Pair-Setup", password the PIN.
    pub fn new(identity: &[u8], password: &[u8]) -> Self {
        let params = SrpParams::default();
        let a = OsRng.gen_biguint(256);
        let private_key = a.to_bytes_be();
        let public_key = params.g.modpow(&a, &params.n);

        Self {
            params,
            identity: identity.to_vec(),
            password: password.to_vec(),
            private_key,
            public_key,
        }
    }

    /// Client public key A (384 bytes, left-padded).
    pub fn public_key(&self) -> Vec<u8> {
        pad_to_n(&self.public_key)
    }

    /// Process the server's salt and public key B, producing M1, the shared
    /// secret and the expected server proof.
    pub fn process_challenge(
        &self,
        salt: &[u8],
        server_public: &[u8],
    ) -> Result<SrpClientProof, CryptoError> {
        let b = BigUint::from_bytes_be(server_public);
        if &b % &self.params.n == BigUint::ZERO {
            return Err(CryptoError::KeyDerivation(
                "Invalid server public key: B mod N = 0".to_string(),
            ));
        }

        let a = BigUint::from_bytes_be(&self.private_key);
        let u = compute_u(&self.public_key, &b);
        if u == BigUint::ZERO {
            return Err(CryptoError::KeyDerivation(
                "Invalid u value: u = 0".to_string(),
            ));
        }

        let x = compute_x(salt, &self.identity, &self.password);
        let k = compute_k(&self.params);

        // S = (B - k * g^x)^(a + u*x) mod N
        let g_x = self.params.g.modpow(&x, &self.params.n);
        let k_gx = (&k * &g_x) % &self.params.n;
        let base = if b >= k_gx {
            (&b - &k_gx) % &self.params.n
        } else {
            (&b + &self.params.n - &k_gx) % &self.params.n
        };
        let exponent = (&a + &u * &x) % (&self.params.n - BigUint::from(1u32));
        let s = base.modpow(&exponent, &self.params.n);

        let mut hasher = Sha512::new();
        hasher.update(pad_to_n(&s));
        let shared_secret = hasher.finalize().to_vec();

        let client_proof = compute_m1(
            &self.params,
            &self.identity,
            salt,
            &self.public_key,
            &b,
            &shared_secret,
        );

        let mut hasher = Sha512::new();
        hasher.update(pad_to_n(&self.public_key));
        hasher.update(&client_proof);
        hasher.update(&shared_secret);
        let expected_server_proof = hasher.finalize().to_vec();

        Ok(SrpClientProof {
            client_proof,
            shared_secret,
            expected_server_proof,
        })
    }

    /// Verify the server's proof M2 in constant time.
    pub fn verify_server_proof(&self, proof: &[u8], expected: &[u8]) -> bool {
        proof.ct_eq(expected).into()
    }
}

/// Pad a value to N_BYTES with leading zeros.
fn pad_to_n(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= N_BYTES {
        bytes[bytes.len() - N_BYTES..].to_vec()
    } else {
        let mut padded = vec![0u8; N_BYTES - bytes.len()];
        padded.extend_from_slice(&bytes);
        padded
    }
}

/// Compute k = SHA512(N || PAD(g)).
fn compute_k(params: &SrpParams) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(pad_to_n(&params.n));
    hasher.update(pad_to_n(&params.g));
    BigUint::from_bytes_be(&hasher.finalize())
}

/// Compute u = SHA512(PAD(A) || PAD(B)).
fn compute_u(a: &BigUint, b: &BigUint) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(pad_to_n(a));
    hasher.update(pad_to_n(b));
    BigUint::from_bytes_be(&hasher.finalize())
}

/// Compute x = SHA512(salt || SHA512(identity || ":" || password)).
fn compute_x(salt: &[u8], identity: &[u8], password: &[u8]) -> BigUint {
    let mut hasher = Sha512::new();
    hasher.update(identity);
    hasher.update(b":");
    hasher.update(password);
    let inner_hash = hasher.finalize();

    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(inner_hash);
    BigUint::from_bytes_be(&hasher.finalize())
}

/// Compute M1 = H(H(N) XOR H(g) || H(I) || salt || PAD(A) || PAD(B) || K).
fn compute_m1(
    params: &SrpParams,
    identity: &[u8],
    salt: &[u8],
    a: &BigUint,
    b: &BigUint,
    k: &[u8],
) -> Vec<u8> {
    let mut hasher = Sha512::new();
    hasher.update(pad_to_n(&params.n));
    let h_n = hasher.finalize();

    // H(g) is taken over the raw generator bytes (0x05), NOT over PAD(g);
    // padding here makes the proof incompatible with Apple controllers.
    let mut hasher = Sha512::new();
    hasher.update(params.g.to_bytes_be());
    let h_g = hasher.finalize();

    let mut xor_result = [0u8; 64];
    for i in 0..64 {
        xor_result[i] = h_n[i] ^ h_g[i];
    }

    let mut hasher = Sha512::new();
    hasher.update(identity);
    let h_i = hasher.finalize();

    let mut hasher = Sha512::new();
    hasher.update(xor_result);
    hasher.update(h_i);
    hasher.update(salt);
    hasher.update(pad_to_n(a));
    hasher.update(pad_to_n(b));
    hasher.update(k);
    hasher.finalize().to_vec()
}
