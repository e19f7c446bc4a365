//! Mock BSV chain client for CashHandle
//!
//! Holds the service wallet key and produces ordinal inscriptions and signed
//! transfer payloads. Nothing is broadcast to a real network; broadcasts are
//! only logged.

use crate::config::{BsvConfig, BsvNetwork};
use crate::error::{Result, StoreError};
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::Rng;
use secp256k1::{
    constants::{PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Mock on-chain balance of the service wallet, in satoshis.
pub const MOCK_WALLET_BALANCE: u64 = 100_000;

const INSCRIPTION_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from a hex-encoded 32-byte secret.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| StoreError::CryptoError(format!("Invalid hex secret key: {}", e)))?;
        let secret_key = SecretKey::from_slice(&bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                StoreError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                StoreError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// SHA-256 of the compressed public key, hex encoded.
    pub fn address(&self) -> String {
        let pubkey_bytes: [u8; PUBLIC_KEY_SIZE] = self.public_key.serialize();
        hex::encode(Sha256::digest(pubkey_bytes))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Signs the SHA-256 digest of a message and returns the DER-encoded signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let digest: [u8; 32] = Sha256::digest(message).into();
        let message = Message::from_digest(digest);
        SECP256K1_CONTEXT
            .sign_ecdsa(&message, &self.secret_key)
            .serialize_der()
            .to_vec()
    }
}

/// Verifies a DER signature over the SHA-256 digest of a message.
pub fn verify_signature(public_key_bytes: &[u8], message: &[u8], signature_der: &[u8]) -> Result<()> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(StoreError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| StoreError::CryptoError(format!("Invalid public key: {}", e)))?;
    let signature = Signature::from_der(signature_der)
        .map_err(|e| StoreError::CryptoError(format!("Invalid signature: {}", e)))?;

    let digest: [u8; 32] = Sha256::digest(message).into();
    SECP256K1_CONTEXT
        .verify_ecdsa(&Message::from_digest(digest), &signature, &public_key)
        .map_err(|_| StoreError::CryptoError("Signature verification failed".to_string()))
}

/// Metadata written into a token inscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InscriptionMetadata {
    pub symbol: String,
    pub handcash_handle: String,
    pub total_supply: String,
    pub owner: String,
    pub created_at: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct Inscription {
    pub inscription_id: String,
    pub content_type: String,
    pub content: String,
    pub metadata: InscriptionMetadata,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferPayload<'a> {
    inscription_id: &'a str,
    from: &'a str,
    to: &'a str,
    amount: Option<u64>,
    timestamp: i64,
}

/// The service wallet.
pub struct BsvWallet {
    keypair: KeyPair,
    network: BsvNetwork,
}

impl BsvWallet {
    pub fn new(keypair: KeyPair, network: BsvNetwork) -> Self {
        BsvWallet { keypair, network }
    }

    /// Load the configured key, or generate one when it is missing or malformed.
    pub fn from_config(config: &BsvConfig) -> Self {
        let keypair = match config.private_key.as_deref() {
            Some(secret) => KeyPair::from_secret_hex(secret).unwrap_or_else(|e| {
                warn!(error = %e, "invalid bsv.private_key, generating a random key");
                KeyPair::generate()
            }),
            None => {
                warn!("using a randomly generated BSV key; set bsv.private_key in production");
                KeyPair::generate()
            }
        };
        Self::new(keypair, config.network)
    }

    pub fn network(&self) -> BsvNetwork {
        self.network
    }

    pub fn address(&self) -> String {
        self.keypair.address()
    }

    pub fn balance(&self) -> u64 {
        MOCK_WALLET_BALANCE
    }

    /// Build the JSON inscription announcing a new handle token.
    pub fn create_inscription(
        &self,
        symbol: &str,
        handcash_handle: &str,
        total_supply: u64,
        owner: &str,
    ) -> Result<Inscription> {
        let metadata = InscriptionMetadata {
            symbol: symbol.to_string(),
            handcash_handle: handcash_handle.to_string(),
            total_supply: total_supply.to_string(),
            owner: owner.to_string(),
            created_at: Utc::now().to_rfc3339(),
            kind: "bsv-token".to_string(),
            protocol: "ordinals".to_string(),
        };
        let content = serde_json::to_string_pretty(&metadata)
            .map_err(|e| StoreError::ChainError(format!("Failed to encode inscription: {}", e)))?;

        let inscription = Inscription {
            inscription_id: generate_inscription_id(),
            content_type: "application/json".to_string(),
            content,
            metadata,
        };
        info!(
            inscription = %inscription.inscription_id,
            symbol,
            network = ?self.network,
            "inscription created"
        );
        Ok(inscription)
    }

    /// Sign a transfer of an inscription and return its transaction id.
    pub fn transfer_inscription(
        &self,
        inscription_id: &str,
        to_address: &str,
        amount: Option<u64>,
    ) -> Result<String> {
        if inscription_id.trim().is_empty() || to_address.trim().is_empty() {
            return Err(StoreError::ChainError(
                "Inscription id and destination address are required".to_string(),
            ));
        }

        let from = self.address();
        let payload = serde_json::to_vec(&TransferPayload {
            inscription_id,
            from: &from,
            to: to_address,
            amount,
            timestamp: Utc::now().timestamp_millis(),
        })
        .map_err(|e| StoreError::ChainError(format!("Failed to encode transfer: {}", e)))?;

        let signature = self.keypair.sign(&payload);
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        hasher.update(&signature);
        let tx_id = hex::encode(hasher.finalize());

        info!(tx_id = %tx_id, inscription = %inscription_id, to = %to_address, "broadcasting transaction");
        Ok(tx_id)
    }

    /// Inscribed supplies are final.
    pub fn mint_additional(&self, _token_id: &str, _amount: u64) -> Result<String> {
        Err(StoreError::ChainError(
            "Additional minting not supported for ordinals tokens".to_string(),
        ))
    }
}

fn generate_inscription_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..INSCRIPTION_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("ord_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> BsvWallet {
        BsvWallet::new(KeyPair::generate(), BsvNetwork::Testnet)
    }

    #[test]
    fn test_address_is_hashed_public_key() {
        let keypair = KeyPair::generate();
        let address = keypair.address();
        assert_eq!(address.len(), 64);
        assert_eq!(
            address,
            hex::encode(Sha256::digest(keypair.public_key.serialize()))
        );
    }

    #[test]
    fn test_secret_hex_round_trip() {
        let keypair = KeyPair::generate();
        let restored =
            KeyPair::from_secret_hex(&hex::encode(keypair.secret_key.secret_bytes())).unwrap();
        assert_eq!(restored.public_key, keypair.public_key);
        assert!(KeyPair::from_secret_hex("abcd").is_err());
        assert!(KeyPair::from_secret_hex("not hex").is_err());
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"cashhandle");
        let pubkey = keypair.public_key.serialize();
        assert!(verify_signature(&pubkey, b"cashhandle", &signature).is_ok());
        assert!(verify_signature(&pubkey, b"tampered", &signature).is_err());
    }

    #[test]
    fn test_inscription_content() {
        let inscription = wallet()
            .create_inscription("$alice", "@alice", 1_000_000_000, "owner-address")
            .unwrap();
        assert!(inscription.inscription_id.starts_with("ord_"));
        let suffix = inscription.inscription_id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), INSCRIPTION_SUFFIX_LEN);
        assert_eq!(inscription.content_type, "application/json");

        let content: serde_json::Value = serde_json::from_str(&inscription.content).unwrap();
        assert_eq!(content["type"], "bsv-token");
        assert_eq!(content["protocol"], "ordinals");
        assert_eq!(content["totalSupply"], "1000000000");
        assert_eq!(content["handcashHandle"], "@alice");
    }

    #[test]
    fn test_transfer_produces_txid() {
        let wallet = wallet();
        let tx_id = wallet
            .transfer_inscription("ord_1_abc", "recipient", Some(5))
            .unwrap();
        assert_eq!(tx_id.len(), 64);
        assert!(wallet.transfer_inscription("", "recipient", None).is_err());
    }

    #[test]
    fn test_mock_balance_and_no_minting() {
        let wallet = wallet();
        assert_eq!(wallet.balance(), MOCK_WALLET_BALANCE);
        assert!(matches!(
            wallet.mint_additional("token", 1),
            Err(StoreError::ChainError(_))
        ));
    }

    #[test]
    fn test_from_config_falls_back_on_bad_key() {
        let config = BsvConfig {
            network: BsvNetwork::Mainnet,
            private_key: Some("zz".to_string()),
        };
        let wallet = BsvWallet::from_config(&config);
        assert_eq!(wallet.network(), BsvNetwork::Mainnet);
        assert_eq!(wallet.address().len(), 64);
    }
}
