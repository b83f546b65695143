use std::fmt;

use ark_ff::Field;
use log::{debug, info, warn};

use crate::authority::RevocationUpdate;
use crate::kdf::{derive_session_key, SessionKey};
use crate::{GkdError, MemberId, Precondition, Result, Scalar, G1, G2};

// ====================== 成员凭证 ======================
#[derive(Clone, PartialEq)]
pub struct MemberCredential {
    pub id: MemberId,
    pub x: Scalar,
    pub w1: G1,
    pub w2: G2,
    pub epoch: u64, // w2 所属纪元
}

// x 为成员私密值，不输出
impl fmt::Debug for MemberCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberCredential")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberStatus {
    HasKey,
    Desynchronized { expected: u64, received: u64 },
    Revoked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Rekeyed(SessionKey),
    Stale,    // 重复或已应用的纪元
    Excluded, // 本成员被撤销
}

// ====================== 见证更新 ======================

/// (Update) 见证更新：e = 1/(x_i - x_r), w2_new = A_new^e · (w2_old^e)^(-1)
pub fn update_witness(w2_old: &G2, x_i: &Scalar, a_new: &G2, x_r: &Scalar) -> Result<G2> {
    let e = (*x_i - x_r)
        .inverse()
        .ok_or(Precondition::SelfRevocation)?;
    Ok(*a_new * e - *w2_old * e)
}

// ====================== 车辆成员 ======================
#[derive(Debug)]
pub struct Vehicle {
    credential: MemberCredential,
    session_key: SessionKey,
    status: MemberStatus,
}

impl Vehicle {
    pub fn from_credential(credential: MemberCredential) -> Result<Self> {
        let session_key = derive_session_key(&credential.w1, &credential.w2)?;
        info!(
            "Member {} derived session key {} at epoch {}",
            credential.id,
            session_key.fingerprint(),
            credential.epoch
        );
        Ok(Self {
            credential,
            session_key,
            status: MemberStatus::HasKey,
        })
    }

    pub fn id(&self) -> &MemberId {
        &self.credential.id
    }

    pub fn credential(&self) -> &MemberCredential {
        &self.credential
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn status(&self) -> MemberStatus {
        self.status
    }

    pub fn epoch(&self) -> u64 {
        self.credential.epoch
    }

    pub fn is_revoked(&self) -> bool {
        self.status == MemberStatus::Revoked
    }

    // 按纪元顺序且只应用一次；跳跃的纪元返回 EpochGap，凭证不变
    pub fn apply_update(&mut self, update: &RevocationUpdate) -> Result<UpdateOutcome> {
        if self.status == MemberStatus::Revoked {
            debug!("Member {} is revoked, ignoring epoch {}", self.id(), update.epoch);
            return Ok(UpdateOutcome::Excluded);
        }

        let expected = self.credential.epoch + 1;
        if update.epoch < expected {
            debug!(
                "Member {} discarding stale update for epoch {}",
                self.id(),
                update.epoch
            );
            return Ok(UpdateOutcome::Stale);
        }
        if update.epoch > expected {
            warn!(
                "Member {} missed updates: expected epoch {}, received {}",
                self.id(),
                expected,
                update.epoch
            );
            self.status = MemberStatus::Desynchronized {
                expected,
                received: update.epoch,
            };
            return Err(GkdError::EpochGap {
                expected,
                received: update.epoch,
            });
        }

        let w2_new = match update_witness(&self.credential.w2, &self.credential.x, &update.a_new, &update.x_r) {
            Ok(w2) => w2,
            Err(GkdError::Precondition(Precondition::SelfRevocation)) => {
                warn!("Member {} was revoked at epoch {}", self.id(), update.epoch);
                self.status = MemberStatus::Revoked;
                return Ok(UpdateOutcome::Excluded);
            }
            Err(e) => return Err(e),
        };

        let session_key = derive_session_key(&self.credential.w1, &w2_new)?;
        self.credential.w2 = w2_new;
        self.credential.epoch = update.epoch;
        self.session_key = session_key;
        self.status = MemberStatus::HasKey;
        info!(
            "Member {} re-keyed to {} at epoch {}",
            self.id(),
            session_key.fingerprint(),
            update.epoch
        );
        Ok(UpdateOutcome::Rekeyed(session_key))
    }

    // 接受 TA 重新签发的同一秘密的凭证
    pub fn resynchronize(&mut self, credential: MemberCredential) -> Result<SessionKey> {
        if self.status == MemberStatus::Revoked {
            return Err(GkdError::AlreadyRevoked(self.credential.id));
        }
        if credential.id != self.credential.id || credential.x != self.credential.x {
            return Err(GkdError::CredentialMismatch(self.credential.id));
        }
        if credential.epoch < self.credential.epoch {
            return Err(GkdError::EpochGap {
                expected: self.credential.epoch,
                received: credential.epoch,
            });
        }

        let session_key = derive_session_key(&credential.w1, &credential.w2)?;
        info!(
            "Member {} resynchronized from epoch {} to {}",
            self.id(),
            self.credential.epoch,
            credential.epoch
        );
        self.credential = credential;
        self.session_key = session_key;
        self.status = MemberStatus::HasKey;
        Ok(session_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::pair;
    use crate::TrustedAuthority;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Group {
        ta: TrustedAuthority,
        rng: StdRng,
    }

    impl Group {
        fn new() -> Self {
            let mut rng = StdRng::seed_from_u64(11);
            let ta = TrustedAuthority::setup(&mut rng).unwrap();
            Self { ta, rng }
        }

        fn join(&mut self, label: &str) -> Vehicle {
            let id = MemberId::from_label(label).unwrap();
            Vehicle::from_credential(self.ta.join(id, &mut self.rng).unwrap()).unwrap()
        }

        fn revoke(&mut self, label: &str) -> RevocationUpdate {
            self.ta.revoke(&MemberId::from_label(label).unwrap()).unwrap()
        }
    }

    #[test]
    fn surviving_witness_converges_on_new_aggregate() {
        let mut group = Group::new();
        let survivor = group.join("veh-1");
        group.join("veh-2");
        let update = group.revoke("veh-2");

        let cred = survivor.credential();
        let w2_new = update_witness(&cred.w2, &cred.x, &update.a_new, &update.x_r).unwrap();
        assert_eq!(pair(&cred.w1, &w2_new), pair(&group.ta.params().h, &update.a_new));
    }

    #[test]
    fn own_secret_cannot_be_updated() {
        let mut group = Group::new();
        let revoked = group.join("veh-1");
        let update = group.revoke("veh-1");

        let cred = revoked.credential();
        let err = update_witness(&cred.w2, &cred.x, &update.a_new, &update.x_r).unwrap_err();
        assert!(matches!(err, GkdError::Precondition(Precondition::SelfRevocation)));
    }

    #[test]
    fn witness_update_is_a_pure_function() {
        let mut group = Group::new();
        let survivor = group.join("veh-1");
        group.join("veh-2");
        let update = group.revoke("veh-2");

        let cred = survivor.credential();
        let first = update_witness(&cred.w2, &cred.x, &update.a_new, &update.x_r).unwrap();
        let second = update_witness(&cred.w2, &cred.x, &update.a_new, &update.x_r).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_delivery_is_stale() {
        let mut group = Group::new();
        let mut vehicle = group.join("veh-1");
        group.join("veh-2");
        let update = group.revoke("veh-2");

        let key = match vehicle.apply_update(&update).unwrap() {
            UpdateOutcome::Rekeyed(key) => key,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(key, group.ta.group_key().unwrap());
        assert_eq!(vehicle.apply_update(&update).unwrap(), UpdateOutcome::Stale);
        assert_eq!(vehicle.session_key(), &key);
        assert_eq!(vehicle.epoch(), 1);
    }

    #[test]
    fn gap_is_reported_and_late_update_still_applies() {
        let mut group = Group::new();
        let mut vehicle = group.join("veh-1");
        group.join("veh-2");
        group.join("veh-3");
        let first = group.revoke("veh-2");
        let second = group.revoke("veh-3");
        let original_key = *vehicle.session_key();

        let err = vehicle.apply_update(&second).unwrap_err();
        assert!(matches!(err, GkdError::EpochGap { expected: 1, received: 2 }));
        assert_eq!(
            vehicle.status(),
            MemberStatus::Desynchronized { expected: 1, received: 2 }
        );
        assert_eq!(vehicle.session_key(), &original_key);

        assert!(matches!(vehicle.apply_update(&first).unwrap(), UpdateOutcome::Rekeyed(_)));
        assert!(matches!(vehicle.apply_update(&second).unwrap(), UpdateOutcome::Rekeyed(_)));
        assert_eq!(vehicle.status(), MemberStatus::HasKey);
        assert_eq!(vehicle.session_key(), &group.ta.group_key().unwrap());
    }

    #[test]
    fn revoked_member_keeps_old_key_and_stays_revoked() {
        let mut group = Group::new();
        let mut revoked = group.join("veh-1");
        group.join("veh-2");
        let old_key = *revoked.session_key();

        let update = group.revoke("veh-1");
        assert_eq!(revoked.apply_update(&update).unwrap(), UpdateOutcome::Excluded);
        assert!(revoked.is_revoked());
        assert_eq!(revoked.session_key(), &old_key);
        assert_eq!(revoked.epoch(), 0);

        let refresh = group.ta.refresh(&mut group.rng).unwrap();
        assert_eq!(revoked.apply_update(&refresh).unwrap(), UpdateOutcome::Excluded);
        assert!(matches!(
            revoked.resynchronize(revoked.credential().clone()),
            Err(GkdError::AlreadyRevoked(_))
        ));
    }

    #[test]
    fn resynchronize_recovers_after_missed_updates() {
        let mut group = Group::new();
        let mut vehicle = group.join("veh-1");
        let mut other = group.join("veh-2");
        group.join("veh-3");
        group.revoke("veh-3");
        let missed = group.ta.refresh(&mut group.rng).unwrap();
        assert!(vehicle.apply_update(&missed).is_err());

        let reissued = group.ta.reissue(vehicle.id()).unwrap();
        let key = vehicle.resynchronize(reissued).unwrap();
        assert_eq!(key, group.ta.group_key().unwrap());
        assert_eq!(vehicle.epoch(), 2);
        assert_eq!(vehicle.status(), MemberStatus::HasKey);

        let foreign = group.ta.reissue(other.id()).unwrap();
        assert!(matches!(
            vehicle.resynchronize(foreign.clone()),
            Err(GkdError::CredentialMismatch(_))
        ));
        other.resynchronize(foreign).unwrap();
        assert_eq!(other.session_key(), vehicle.session_key());
    }
}
