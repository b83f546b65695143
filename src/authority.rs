use std::collections::{HashMap, HashSet};
use std::fmt;

use ark_ff::{Field, Zero};
use ark_std::UniformRand;
use chrono::Utc;
use log::{debug, info, warn};
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};

use crate::kdf::{derive_session_key, SessionKey};
use crate::member::MemberCredential;
use crate::{GkdError, MemberId, Precondition, Result, Scalar, G1, G2};

pub const MAX_SAMPLING_ATTEMPTS: usize = 64; // 注册/刷新时的采样重试上限

// ====================== 公共参数 ======================
#[derive(Clone, Debug, PartialEq)]
pub struct GroupParameters {
    pub g1: G1,
    pub h: G1,
    pub g2: G2,
}

// 每次撤销后广播的更新消息
#[derive(Clone, Debug, PartialEq)]
pub struct RevocationUpdate {
    pub epoch: u64, // 撤销生效后的纪元
    pub a_new: G2,
    pub x_r: Scalar,
}

// ====================== 撤销公告 ======================
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Revoked,
    Refresh,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub epoch: u64,
    pub member: Option<MemberId>,
    pub kind: RecordKind,
    pub recorded_at: i64,
}

// ====================== 可信中心 ======================
pub struct TrustedAuthority {
    params: GroupParameters,
    sk: Scalar,
    aggregate: G2, // A
    epoch: u64,
    members: HashMap<MemberId, Scalar>,
    revoked: HashSet<MemberId>,
    bulletin_board: Vec<RevocationRecord>,
}

impl fmt::Debug for TrustedAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedAuthority")
            .field("epoch", &self.epoch)
            .field("members", &self.members.len())
            .field("revoked", &self.revoked.len())
            .finish_non_exhaustive()
    }
}

impl TrustedAuthority {
    /// (Setup) 生成公共参数、私钥 sk 以及初始聚合值 A = g2^u
    pub fn setup<R: Rng + CryptoRng>(rng: &mut R) -> Result<Self> {
        let g1 = G1::rand(rng);
        let h = G1::rand(rng);
        let g2 = G2::rand(rng);
        if g1.is_zero() || h.is_zero() || g2.is_zero() {
            return Err(GkdError::FatalSetup("sampled an identity generator".into()));
        }

        let u = Scalar::rand(rng);
        let sk = Scalar::rand(rng);
        if u.is_zero() || sk.is_zero() {
            return Err(GkdError::FatalSetup("sampled a zero exponent".into()));
        }

        info!("Trusted authority setup complete.");
        Ok(Self {
            params: GroupParameters { g1, h, g2 },
            sk,
            aggregate: g2 * u,
            epoch: 0,
            members: HashMap::new(),
            revoked: HashSet::new(),
            bulletin_board: Vec::new(),
        })
    }

    /// (Join) 签发 x, w1 = h^(x+sk), w2 = A^(1/(x+sk))
    pub fn join<R: Rng + CryptoRng>(&mut self, id: MemberId, rng: &mut R) -> Result<MemberCredential> {
        if self.members.contains_key(&id) {
            return Err(GkdError::DuplicateMember(id));
        }
        if self.revoked.contains(&id) {
            return Err(GkdError::AlreadyRevoked(id));
        }

        let (x, inv) = self.sample_fresh_secret(rng)?;
        let credential = MemberCredential {
            id,
            x,
            w1: self.params.h * (x + self.sk),
            w2: self.aggregate * inv,
            epoch: self.epoch,
        };
        self.members.insert(id, x);
        info!(
            "Registered member {} at epoch {} ({} active)",
            id,
            self.epoch,
            self.members.len()
        );
        Ok(credential)
    }

    // 凭证未送达时撤回注册
    pub fn cancel_join(&mut self, id: &MemberId) -> bool {
        let removed = self.members.remove(id).is_some();
        if removed {
            warn!("Registration of member {} cancelled", id);
        }
        removed
    }

    /// (Revoke) A <- A^(1/(x_r+sk))，同一秘密只能撤销一次
    pub fn revoke(&mut self, id: &MemberId) -> Result<RevocationUpdate> {
        if self.revoked.contains(id) {
            return Err(GkdError::AlreadyRevoked(*id));
        }
        let x_r = *self
            .members
            .get(id)
            .ok_or(GkdError::MemberNotFound(*id))?;

        let update = self.advance(x_r)?;
        self.members.remove(id);
        self.revoked.insert(*id);
        self.record(update.epoch, Some(*id), RecordKind::Revoked);
        info!(
            "Revoked member {}; group now at epoch {} ({} active)",
            id,
            update.epoch,
            self.members.len()
        );
        Ok(update)
    }

    /// (Refresh) 撤销一个不属于任何成员的随机秘密以刷新群密钥
    pub fn refresh<R: Rng + CryptoRng>(&mut self, rng: &mut R) -> Result<RevocationUpdate> {
        let (x, _) = self.sample_fresh_secret(rng)?;
        let update = self.advance(x)?;
        self.record(update.epoch, None, RecordKind::Refresh);
        info!("Group key refreshed; group now at epoch {}", update.epoch);
        Ok(update)
    }

    /// (Reissue) 为错过更新的成员按当前 A 重新计算 w2
    pub fn reissue(&self, id: &MemberId) -> Result<MemberCredential> {
        if self.revoked.contains(id) {
            return Err(GkdError::AlreadyRevoked(*id));
        }
        let x = *self
            .members
            .get(id)
            .ok_or(GkdError::MemberNotFound(*id))?;
        let inv = (x + self.sk)
            .inverse()
            .ok_or(Precondition::ZeroDenominator)?;
        info!("Reissued credential for member {} at epoch {}", id, self.epoch);
        Ok(MemberCredential {
            id: *id,
            x,
            w1: self.params.h * (x + self.sk),
            w2: self.aggregate * inv,
            epoch: self.epoch,
        })
    }

    // 同步成员持有的密钥 Hash(e(h, A))
    pub fn group_key(&self) -> Result<SessionKey> {
        derive_session_key(&self.params.h, &self.aggregate)
    }

    pub fn params(&self) -> &GroupParameters {
        &self.params
    }

    pub fn aggregate(&self) -> &G2 {
        &self.aggregate
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    pub fn is_revoked(&self, id: &MemberId) -> bool {
        self.revoked.contains(id)
    }

    /// (Audit) 撤销公告板，按时间顺序
    pub fn audit(&self) -> &[RevocationRecord] {
        &self.bulletin_board
    }

    // A <- A^(1/(x_r+sk)); state is untouched when the inverse is undefined.
    fn advance(&mut self, x_r: Scalar) -> Result<RevocationUpdate> {
        let inv = (x_r + self.sk)
            .inverse()
            .ok_or(Precondition::ZeroDenominator)?;
        self.aggregate = self.aggregate * inv;
        self.epoch += 1;
        Ok(RevocationUpdate {
            epoch: self.epoch,
            a_new: self.aggregate,
            x_r,
        })
    }

    // x 非零、未被使用且 x + sk 可逆
    fn sample_fresh_secret<R: Rng + CryptoRng>(&self, rng: &mut R) -> Result<(Scalar, Scalar)> {
        for attempt in 1..=MAX_SAMPLING_ATTEMPTS {
            let x = Scalar::rand(rng);
            if x.is_zero() || self.members.values().any(|active| *active == x) {
                debug!("Resampling member secret (attempt {})", attempt);
                continue;
            }
            match (x + self.sk).inverse() {
                Some(inv) => return Ok((x, inv)),
                None => warn!("Sampled secret with x + sk = 0, resampling"),
            }
        }
        Err(Precondition::SamplingExhausted(MAX_SAMPLING_ATTEMPTS).into())
    }

    fn record(&mut self, epoch: u64, member: Option<MemberId>, kind: RecordKind) {
        self.bulletin_board.push(RevocationRecord {
            epoch,
            member,
            kind,
            recorded_at: Utc::now().timestamp(),
        });
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::kdf::pair;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn join_issues_witnesses_that_pair_to_the_group_value(seed in any::<u64>(), members in 1usize..5) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut ta = TrustedAuthority::setup(&mut rng).unwrap();
            let target = pair(&ta.params().h, ta.aggregate());

            let mut secrets = HashSet::new();
            for i in 0..members {
                let cred = ta.join(MemberId::from_label(&format!("veh-{i}")).unwrap(), &mut rng).unwrap();
                prop_assert!(!cred.x.is_zero());
                prop_assert!(!(cred.x + ta.sk).is_zero());
                prop_assert!(secrets.insert(cred.x));
                prop_assert_eq!(pair(&cred.w1, &cred.w2), target);
            }
            prop_assert_eq!(ta.member_count(), members);
        }

        #[test]
        fn revocation_epochs_and_records_stay_in_step(seed in any::<u64>(), members in 1usize..5) {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut ta = TrustedAuthority::setup(&mut rng).unwrap();
            let ids: Vec<MemberId> = (0..members)
                .map(|i| MemberId::from_label(&format!("veh-{i}")).unwrap())
                .collect();
            for id in &ids {
                ta.join(*id, &mut rng).unwrap();
            }

            for (n, id) in ids.iter().enumerate() {
                let update = ta.revoke(id).unwrap();
                prop_assert_eq!(update.epoch, n as u64 + 1);
                prop_assert_eq!(&update.a_new, ta.aggregate());
                prop_assert!(matches!(ta.revoke(id), Err(GkdError::AlreadyRevoked(_))));
            }
            prop_assert_eq!(ta.member_count(), 0);
            prop_assert_eq!(ta.audit().len(), members);
        }
    }
}
