//! Predicate oracle: decides whether an unlock proof satisfies a locking
//! condition.
//!
//! The ledger treats this module as a boolean oracle. It never mutates
//! state; [`StandardOracle`] dispatches on the [`LockingCondition`] tag.

use crate::transaction::{encode_locking_condition, signature_hash};
use crate::types::*;
use bitcoin_hashes::{sha256d, Hash as BitcoinHash};
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey, VerifyOnly};
use sha2::{Digest, Sha256};

/// Per-input view handed to the oracle
#[derive(Debug, Clone, Copy)]
pub struct TxContext<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    /// Height of the block the spending transaction is (or would be) in
    pub spending_height: Natural,
}

impl<'a> TxContext<'a> {
    pub fn signature_hash(&self) -> Hash {
        signature_hash(self.tx, self.input_index)
    }
}

/// Verify: 𝒫 × ℒ × 𝒞 → {true, false}
///
/// Must be pure: same inputs, same answer, no side effects.
pub trait PredicateOracle: Send + Sync {
    fn verify(&self, proof: &UnlockProof, condition: &LockingCondition, ctx: &TxContext<'_>) -> bool;
}

/// Oracle for the built-in condition variants, verifying ECDSA signatures
/// over secp256k1
pub struct StandardOracle {
    secp: Secp256k1<VerifyOnly>,
}

impl StandardOracle {
    pub fn new() -> Self {
        StandardOracle {
            secp: Secp256k1::verification_only(),
        }
    }

    fn verify_signature(&self, pubkey_bytes: &[u8], signature_bytes: &[u8], sighash: &Hash) -> bool {
        // Parse public key
        let pubkey = match PublicKey::from_slice(pubkey_bytes) {
            Ok(pk) => pk,
            Err(_) => return false,
        };

        // Parse signature (DER format)
        let signature = match Signature::from_der(signature_bytes) {
            Ok(sig) => sig,
            Err(_) => return false,
        };

        let message = Message::from_digest(*sighash);
        self.secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
    }

    /// Signatures must match keys in key order; each key is used at most once
    fn verify_multisig(
        &self,
        threshold: u8,
        pubkeys: &[ByteString],
        signatures: &[ByteString],
        sighash: &Hash,
    ) -> bool {
        let threshold = threshold as usize;
        if threshold == 0 || threshold > pubkeys.len() || signatures.len() != threshold {
            return false;
        }
        let mut keys = pubkeys.iter();
        signatures
            .iter()
            .all(|sig| keys.any(|pk| self.verify_signature(pk, sig, sighash)))
    }
}

impl Default for StandardOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl PredicateOracle for StandardOracle {
    fn verify(&self, proof: &UnlockProof, condition: &LockingCondition, ctx: &TxContext<'_>) -> bool {
        match (condition, proof) {
            (LockingCondition::AnyoneCanSpend, UnlockProof::Empty) => true,

            (LockingCondition::PayToKeyHash { key_hash }, UnlockProof::Signature { pubkey, signature }) => {
                hash160(pubkey) == *key_hash
                    && self.verify_signature(pubkey, signature, &ctx.signature_hash())
            }

            (LockingCondition::PayToScriptHash { script_hash }, UnlockProof::ScriptHash { redeem, inner }) => {
                // One level only: the redeem condition may not itself be a script hash
                if matches!(**redeem, LockingCondition::PayToScriptHash { .. }) {
                    return false;
                }
                condition_hash(redeem) == *script_hash && self.verify(inner, redeem, ctx)
            }

            (LockingCondition::Multisig { threshold, pubkeys }, UnlockProof::MultiSignature { signatures }) => {
                self.verify_multisig(*threshold, pubkeys, signatures, &ctx.signature_hash())
            }

            (
                LockingCondition::HashTimeLock { hash_lock, recipient, .. },
                UnlockProof::Preimage { preimage, pubkey, signature },
            ) => {
                sha256(preimage) == *hash_lock
                    && hash160(pubkey) == *recipient
                    && self.verify_signature(pubkey, signature, &ctx.signature_hash())
            }

            (
                LockingCondition::HashTimeLock { refund, timeout_height, .. },
                UnlockProof::Refund { pubkey, signature },
            ) => {
                ctx.spending_height >= *timeout_height
                    && hash160(pubkey) == *refund
                    && self.verify_signature(pubkey, signature, &ctx.signature_hash())
            }

            _ => false,
        }
    }
}

// ============================================================================
// HASHING AND SIGNING HELPERS
// ============================================================================

/// Single SHA-256
pub fn sha256(data: &[u8]) -> Hash {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(data));
    hash
}

/// Double SHA-256, used for transaction ids, block hashes and Merkle nodes
pub fn sha256d(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// HASH160 = RIPEMD160(SHA256(x))
pub fn hash160(data: &[u8]) -> KeyHash {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Ripemd160::digest(sha256(data)));
    hash
}

/// Hash committed to by a pay-to-script-hash output
pub fn condition_hash(condition: &LockingCondition) -> KeyHash {
    hash160(&encode_locking_condition(condition))
}

/// Key hash of the compressed public key for `secret_key`
pub fn key_hash_for(secret_key: &SecretKey) -> KeyHash {
    hash160(&public_key_bytes(secret_key))
}

/// Compressed public key bytes for `secret_key`
pub fn public_key_bytes(secret_key: &SecretKey) -> ByteString {
    let secp = Secp256k1::signing_only();
    PublicKey::from_secret_key(&secp, secret_key).serialize().to_vec()
}

/// DER signature of `sighash`
pub fn sign_digest(sighash: &Hash, secret_key: &SecretKey) -> ByteString {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest(*sighash);
    secp.sign_ecdsa(&message, secret_key).serialize_der().to_vec()
}

/// Proof spending a pay-to-key-hash output at `input_index`
pub fn sign_input(tx: &Transaction, input_index: usize, secret_key: &SecretKey) -> UnlockProof {
    let sighash = signature_hash(tx, input_index);
    UnlockProof::Signature {
        pubkey: public_key_bytes(secret_key),
        signature: sign_digest(&sighash, secret_key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SEQUENCE_FINAL;

    fn secret(n: u8) -> SecretKey {
        SecretKey::from_slice(&[n; 32]).unwrap()
    }

    fn spending_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::new([7; 32], 0),
                unlock_proof: UnlockProof::Empty,
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput {
                value: 10,
                locking_condition: LockingCondition::AnyoneCanSpend,
            }],
            lock_time: 0,
        }
    }

    fn ctx(tx: &Transaction, height: Natural) -> TxContext<'_> {
        TxContext { tx, input_index: 0, spending_height: height }
    }

    #[test]
    fn test_anyone_can_spend_requires_empty_proof() {
        let oracle = StandardOracle::new();
        let tx = spending_tx();
        assert!(oracle.verify(&UnlockProof::Empty, &LockingCondition::AnyoneCanSpend, &ctx(&tx, 1)));
        let proof = UnlockProof::Signature { pubkey: vec![2; 33], signature: vec![0; 70] };
        assert!(!oracle.verify(&proof, &LockingCondition::AnyoneCanSpend, &ctx(&tx, 1)));
    }

    #[test]
    fn test_pay_to_key_hash() {
        let oracle = StandardOracle::new();
        let key = secret(1);
        let condition = LockingCondition::PayToKeyHash { key_hash: key_hash_for(&key) };
        let tx = spending_tx();

        let proof = sign_input(&tx, 0, &key);
        assert!(oracle.verify(&proof, &condition, &ctx(&tx, 1)));

        // Wrong key
        let proof = sign_input(&tx, 0, &secret(2));
        assert!(!oracle.verify(&proof, &condition, &ctx(&tx, 1)));
    }

    #[test]
    fn test_signature_commits_to_outputs() {
        let oracle = StandardOracle::new();
        let key = secret(3);
        let condition = LockingCondition::PayToKeyHash { key_hash: key_hash_for(&key) };
        let tx = spending_tx();
        let proof = sign_input(&tx, 0, &key);

        let mut tampered = tx.clone();
        tampered.outputs[0].value = 11;
        assert!(!oracle.verify(&proof, &condition, &ctx(&tampered, 1)));
    }

    #[test]
    fn test_multisig_two_of_three() {
        let oracle = StandardOracle::new();
        let keys = [secret(4), secret(5), secret(6)];
        let condition = LockingCondition::Multisig {
            threshold: 2,
            pubkeys: keys.iter().map(public_key_bytes).collect(),
        };
        let tx = spending_tx();
        let sighash = signature_hash(&tx, 0);

        let ordered = UnlockProof::MultiSignature {
            signatures: vec![sign_digest(&sighash, &keys[0]), sign_digest(&sighash, &keys[2])],
        };
        assert!(oracle.verify(&ordered, &condition, &ctx(&tx, 1)));

        // Out of key order
        let reversed = UnlockProof::MultiSignature {
            signatures: vec![sign_digest(&sighash, &keys[2]), sign_digest(&sighash, &keys[0])],
        };
        assert!(!oracle.verify(&reversed, &condition, &ctx(&tx, 1)));

        // Below threshold
        let single = UnlockProof::MultiSignature {
            signatures: vec![sign_digest(&sighash, &keys[1])],
        };
        assert!(!oracle.verify(&single, &condition, &ctx(&tx, 1)));
    }

    #[test]
    fn test_pay_to_script_hash_wraps_multisig() {
        let oracle = StandardOracle::new();
        let key = secret(7);
        let redeem = LockingCondition::Multisig {
            threshold: 1,
            pubkeys: vec![public_key_bytes(&key)],
        };
        let condition = LockingCondition::PayToScriptHash { script_hash: condition_hash(&redeem) };
        let tx = spending_tx();
        let sighash = signature_hash(&tx, 0);
        let proof = UnlockProof::ScriptHash {
            redeem: Box::new(redeem),
            inner: Box::new(UnlockProof::MultiSignature { signatures: vec![sign_digest(&sighash, &key)] }),
        };
        assert!(oracle.verify(&proof, &condition, &ctx(&tx, 1)));

        let other = LockingCondition::AnyoneCanSpend;
        let wrong = UnlockProof::ScriptHash {
            redeem: Box::new(other),
            inner: Box::new(UnlockProof::Empty),
        };
        assert!(!oracle.verify(&wrong, &condition, &ctx(&tx, 1)));
    }

    #[test]
    fn test_hash_time_lock_branches() {
        let oracle = StandardOracle::new();
        let recipient = secret(8);
        let refund = secret(9);
        let preimage = b"open sesame".to_vec();
        let condition = LockingCondition::HashTimeLock {
            hash_lock: sha256(&preimage),
            recipient: key_hash_for(&recipient),
            refund: key_hash_for(&refund),
            timeout_height: 100,
        };
        let tx = spending_tx();
        let sighash = signature_hash(&tx, 0);

        let claim = UnlockProof::Preimage {
            preimage: preimage.clone(),
            pubkey: public_key_bytes(&recipient),
            signature: sign_digest(&sighash, &recipient),
        };
        assert!(oracle.verify(&claim, &condition, &ctx(&tx, 5)));

        let bad_preimage = UnlockProof::Preimage {
            preimage: b"guess".to_vec(),
            pubkey: public_key_bytes(&recipient),
            signature: sign_digest(&sighash, &recipient),
        };
        assert!(!oracle.verify(&bad_preimage, &condition, &ctx(&tx, 5)));

        let reclaim = UnlockProof::Refund {
            pubkey: public_key_bytes(&refund),
            signature: sign_digest(&sighash, &refund),
        };
        assert!(!oracle.verify(&reclaim, &condition, &ctx(&tx, 99)));
        assert!(oracle.verify(&reclaim, &condition, &ctx(&tx, 100)));
    }

    #[test]
    fn test_malformed_key_material_is_rejected_not_panicking() {
        let oracle = StandardOracle::new();
        let condition = LockingCondition::PayToKeyHash { key_hash: hash160(&[1, 2, 3]) };
        let tx = spending_tx();
        let proof = UnlockProof::Signature { pubkey: vec![1, 2, 3], signature: vec![0xff; 3] };
        assert!(!oracle.verify(&proof, &condition, &ctx(&tx, 1)));
    }
}
