//! Hybrid volume placement and background promotion / demotion

use bytes::Bytes;
use fds_common::config::{SmConfig, TierAlgorithm, TieringConfig};
use fds_common::{MediaPolicy, ObjectId, QosDispatcher, Tier, VolumeId};
use fds_sm::{HybridTierCtrlr, ObjectStore, ObjectStoreConfig, SmRequestHandler, VolumeDesc};
use std::sync::Arc;
use tempfile::TempDir;

fn hybrid_store(token_bits: u32, tiering: TieringConfig) -> (TempDir, Arc<ObjectStore>) {
    let dir = tempfile::tempdir().unwrap();
    let sm = SmConfig {
        token_bits,
        hdd_disks: vec![0, 1],
        ssd_disks: vec![2],
        ..SmConfig::default()
    };
    let config = ObjectStoreConfig::new(dir.path(), sm, tiering);
    let store = Arc::new(ObjectStore::open(config).unwrap());
    (dir, store)
}

fn object(s: &str) -> (ObjectId, Bytes) {
    let data = Bytes::copy_from_slice(s.as_bytes());
    (ObjectId::from_data(&data), data)
}

#[test]
fn test_hybrid_volume_promotes_hot_and_demotes_displaced() {
    let tiering = TieringConfig {
        ssd_rank_table_size: 1,
        ..TieringConfig::default()
    };
    let (_dir, store) = hybrid_store(0, tiering.clone());
    let qos = QosDispatcher::started(2, 0).unwrap();
    let handler = Arc::new(SmRequestHandler::new(Arc::clone(&store), Arc::clone(&qos)));
    let ctrl = HybridTierCtrlr::new(handler, tiering);

    let vol = VolumeId::new(1);
    store
        .register_volume(VolumeDesc::new(vol, MediaPolicy::Hybrid, 5))
        .unwrap();

    let (a, da) = object("object A");
    let (b, db) = object("object B");
    assert_eq!(store.put_object(vol, &a, &da).unwrap().tier, Tier::Ssd);
    // Colder than the SSD tail
    assert_eq!(store.put_object(vol, &b, &db).unwrap().tier, Tier::Hdd);
    assert!(store.rank_engine().contains(&a));

    for _ in 0..4 {
        assert_eq!(store.get_object(vol, &b).unwrap(), db);
    }

    // B is promoted and pushes A out of the rank table
    let stats = ctrl.run_once().unwrap();
    qos.wait_idle();
    assert_eq!((stats.promoted, stats.demoted), (1, 0));
    assert!(store.get_meta(&b).unwrap().unwrap().on_tier(Tier::Ssd));
    assert!(store.rank_engine().contains(&b));
    assert!(store.rank_engine().is_demotion_candidate(&a));

    let stats = ctrl.run_once().unwrap();
    qos.wait_idle();
    assert_eq!((stats.promoted, stats.demoted), (0, 1));
    let meta_a = store.get_meta(&a).unwrap().unwrap();
    assert!(meta_a.on_tier(Tier::Hdd) && !meta_a.on_tier(Tier::Ssd));
    assert!(!store.rank_engine().contains(&a));
    assert!(!store.rank_engine().is_demotion_candidate(&a));

    assert_eq!(store.get_object(vol, &a).unwrap(), da);
    assert_eq!(store.get_object(vol, &b).unwrap(), db);
}

#[test]
fn test_selection_is_repeatable() {
    let tiering = TieringConfig {
        ssd_rank_table_size: 1,
        ..TieringConfig::default()
    };
    let (_dir, store) = hybrid_store(1, tiering);
    let vol = VolumeId::new(3);
    store
        .register_volume(VolumeDesc::new(vol, MediaPolicy::Hybrid, 5))
        .unwrap();
    let (a, da) = object("resident");
    store.put_object(vol, &a, &da).unwrap();

    // Unaccessed newcomers rank colder than the resident and stay on HDD
    for i in 0..8 {
        let (oid, data) = object(&format!("newcomer {i}"));
        assert_eq!(store.put_object(vol, &oid, &data).unwrap().tier, Tier::Hdd);
    }
}

#[test]
fn test_random_algorithm_respects_fixed_policies() {
    let tiering = TieringConfig {
        algorithm: TierAlgorithm::RandomTest,
        random_ssd_percent: 100,
        ..TieringConfig::default()
    };
    let (_dir, store) = hybrid_store(1, tiering);
    let (hybrid, hdd) = (VolumeId::new(1), VolumeId::new(2));
    store
        .register_volume(VolumeDesc::new(hybrid, MediaPolicy::Hybrid, 1))
        .unwrap();
    store
        .register_volume(VolumeDesc::new(hdd, MediaPolicy::HybridPrefcap, 1))
        .unwrap();
    let (x, dx) = object("x");
    let (y, dy) = object("y");
    assert_eq!(store.put_object(hybrid, &x, &dx).unwrap().tier, Tier::Ssd);
    assert_eq!(store.put_object(hdd, &y, &dy).unwrap().tier, Tier::Hdd);
}
