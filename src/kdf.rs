use std::fmt;

use ark_bls12_381::Bls12_381;
use ark_ec::pairing::Pairing;
use ark_ec::CurveGroup;
use ark_serialize::CanonicalSerialize;
use serde::{Deserialize, Serialize};

use crate::{GkdError, Gt, Result, G1, G2};

const SESSION_KEY_CONTEXT: &str = "sgkd 2025-06 vehicular group session key";

pub const SESSION_KEY_LEN: usize = 32;

// ====================== 会话密钥 ======================
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    // 日志中只显示前 8 字节
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

// 不在日志中输出完整密钥
impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({}..)", self.fingerprint())
    }
}

// ====================== 配对密钥派生 ======================

// blake3 派生模式，输入为 GT 元素的压缩编码
pub fn session_key_from_gt(gt: &Gt) -> Result<SessionKey> {
    let mut bytes = Vec::with_capacity(gt.compressed_size());
    gt.serialize_compressed(&mut bytes)
        .map_err(|_| GkdError::SerializationError)?;
    let mut hasher = blake3::Hasher::new_derive_key(SESSION_KEY_CONTEXT);
    hasher.update(&bytes);
    Ok(SessionKey(*hasher.finalize().as_bytes()))
}

pub fn pair(p: &G1, q: &G2) -> Gt {
    Bls12_381::pairing(p.into_affine(), q.into_affine())
}

// Hash(e(w1, w2))
pub fn derive_session_key(w1: &G1, w2: &G2) -> Result<SessionKey> {
    session_key_from_gt(&pair(w1, w2))
}
