use log::{error, info, warn, LevelFilter};
use sgkd::{audit, join, refresh, revoke, setup, GkdError, UpdateOutcome, Vehicle};

fn apply(vehicles: &mut [Vehicle], update: &sgkd::RevocationUpdate) -> Result<(), GkdError> {
    for vehicle in vehicles.iter_mut() {
        match vehicle.apply_update(update)? {
            UpdateOutcome::Rekeyed(key) => info!("{} now holds {}", vehicle.id(), key.fingerprint()),
            UpdateOutcome::Excluded => warn!("{} is excluded from epoch {}", vehicle.id(), update.epoch),
            UpdateOutcome::Stale => {}
        }
    }
    Ok(())
}

// ====================== 主函数 ======================
fn main() -> Result<(), GkdError> {
    // 初始化日志
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
    info!("Starting group key distribution demo...");

    // (Setup) 可信中心初始化
    let mut ta = setup().map_err(|e| {
        error!("Trusted authority setup failed: {}", e);
        e
    })?;

    // (Join) 车辆注册
    let mut vehicles = vec![
        join(&mut ta, "veh_id_000001")?,
        join(&mut ta, "veh_id_000002")?,
        join(&mut ta, "veh_id_000003")?,
    ];
    info!("Group key at epoch {}: {}", ta.epoch(), ta.group_key()?.fingerprint());

    // (Revoke) 撤销第一辆车，其余成员本地更新
    let update = revoke(&mut ta, "veh_id_000001")?;
    apply(&mut vehicles, &update)?;

    // (Refresh) 刷新群密钥
    let update = refresh(&mut ta)?;
    apply(&mut vehicles, &update)?;

    let group_key = ta.group_key()?;
    for vehicle in vehicles.iter().filter(|v| !v.is_revoked()) {
        if vehicle.session_key() != &group_key {
            error!("{} is out of sync with the group", vehicle.id());
        }
    }
    info!("Group key at epoch {}: {}", ta.epoch(), group_key.fingerprint());

    // (Audit) 公开审计：打印撤销公告
    for record in audit(&ta) {
        let line = serde_json::to_string(&record).map_err(|_| GkdError::SerializationError)?;
        println!("{}", line);
    }

    Ok(())
}
