use std::fmt;

use ark_bls12_381::{Bls12_381, Fr, G1Projective, G2Projective};
use ark_ec::pairing::PairingOutput;
use log::info;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod authority;
pub mod codec;
pub mod config;
pub mod kdf;
pub mod member;
pub mod transport;

pub use authority::{GroupParameters, RecordKind, RevocationRecord, RevocationUpdate, TrustedAuthority};
pub use config::NetworkConfig;
pub use kdf::{derive_session_key, SessionKey};
pub use member::{update_witness, MemberCredential, MemberStatus, UpdateOutcome, Vehicle};
pub use tokio_util::sync::CancellationToken;

// ====================== 群元素类型 ======================
pub type Scalar = Fr;
pub type G1 = G1Projective;
pub type G2 = G2Projective;
pub type Gt = PairingOutput<Bls12_381>;

pub const ID_LEN: usize = 16; // 线上定长成员标识

// ====================== 自定义错误 ======================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Precondition {
    #[error("x + sk is zero, the inverse is undefined")]
    ZeroDenominator,
    #[error("update revokes this member's own secret")]
    SelfRevocation,
    #[error("no usable scalar after {0} sampling attempts")]
    SamplingExhausted(usize),
}

#[derive(Debug, Error)]
pub enum GkdError {
    #[error("Fatal setup error: {0}")]
    FatalSetup(String),
    #[error("Protocol precondition violated: {0}")]
    Precondition(#[from] Precondition),
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Serialization error")]
    SerializationError,
    #[error("Member id must be at most {max} bytes, got {0}", max = ID_LEN)]
    InvalidMemberId(usize),
    #[error("Member {0} is already active")]
    DuplicateMember(MemberId),
    #[error("Member {0} not found")]
    MemberNotFound(MemberId),
    #[error("Member {0} has already been revoked")]
    AlreadyRevoked(MemberId),
    #[error("Credential does not belong to member {0}")]
    CredentialMismatch(MemberId),
    #[error("Epoch gap: expected {expected}, received {received}")]
    EpochGap { expected: u64, received: u64 },
    #[error("Operation timed out")]
    Timeout,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GkdError>;

// ====================== 成员标识 ======================
// 成员标识由车辆自选，不足 16 字节补零
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId([u8; ID_LEN]);

impl MemberId {
    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_label(label: &str) -> Result<Self> {
        Self::from_padded(label.as_bytes())
    }

    pub fn from_padded(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > ID_LEN {
            return Err(GkdError::InvalidMemberId(bytes.len()));
        }
        let mut id = [0u8; ID_LEN];
        id[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        &self.0[..end]
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.trimmed()))
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({:?})", String::from_utf8_lossy(self.trimmed()))
    }
}

// ====================== 协议函数 ======================

/// (Setup) 群初始化
pub fn setup() -> Result<TrustedAuthority> {
    let mut rng = OsRng;
    TrustedAuthority::setup(&mut rng)
}

/// (Join) 成员注册：签发凭证并在成员端派生会话密钥
pub fn join(ta: &mut TrustedAuthority, label: &str) -> Result<Vehicle> {
    let mut rng = OsRng;
    let id = MemberId::from_label(label)?;
    let credential = ta.join(id, &mut rng)?;
    let vehicle = Vehicle::from_credential(credential)?;
    info!("Member {} joined with key {}", id, vehicle.session_key().fingerprint());
    Ok(vehicle)
}

/// (Revoke) 成员撤销
pub fn revoke(ta: &mut TrustedAuthority, label: &str) -> Result<RevocationUpdate> {
    let id = MemberId::from_label(label)?;
    ta.revoke(&id)
}

/// (Refresh) 群密钥刷新
pub fn refresh(ta: &mut TrustedAuthority) -> Result<RevocationUpdate> {
    let mut rng = OsRng;
    ta.refresh(&mut rng)
}

/// (Audit) 公开审计：返回撤销公告记录
pub fn audit(ta: &TrustedAuthority) -> Vec<RevocationRecord> {
    ta.audit().to_vec()
}
