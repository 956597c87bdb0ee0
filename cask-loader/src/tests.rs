use crate::bundle_io::BundleIO;
use crate::task::{TaskKind, TaskState};
use crate::transport::MemoryTransport;
use crate::*;
use cask_base::{AssetManifestInfo, BundleArchiveWriter, BundleManifestInfo, ContentChecksum, Manifest};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(50);

fn archive(assets: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = BundleArchiveWriter::default();
    for (name, data) in assets {
        writer.add_asset(*name, data.to_vec());
    }
    writer.to_bytes().unwrap()
}

fn bundle_info(
    name: &str,
    data: &[u8],
    assets: Vec<AssetManifestInfo>,
) -> BundleManifestInfo {
    BundleManifestInfo {
        name: name.to_string(),
        length: data.len() as u64,
        hash: format!("{}-hash", name),
        checksum: ContentChecksum::of_bytes(data),
        assets,
        ..Default::default()
    }
}

struct Fixture {
    manager: AssetManager,
    storage: MemoryStorage,
}

// bundle1: A -> (B, C), D is listed but not in the archive, E -> (B, Z) where Z does not exist
// bundle2: B, C
// scenes: S
fn fixture_with_config(config: LoaderConfig) -> Fixture {
    let storage = MemoryStorage::default();
    let bundle1 = archive(&[("A", b"asset a"), ("E", b"asset e")]);
    let bundle2 = archive(&[("B", b"asset b"), ("C", b"asset c")]);
    let scenes = archive(&[("S", b"scene s")]);

    let mut scene_info = bundle_info("scenes", &scenes, vec![AssetManifestInfo::new("S", &[])]);
    scene_info.is_scene = true;

    let manifest = Manifest {
        version: 1,
        bundles: vec![
            bundle_info(
                "bundle1",
                &bundle1,
                vec![
                    AssetManifestInfo::new("A", &["B", "C"]),
                    AssetManifestInfo::new("D", &[]),
                    AssetManifestInfo::new("E", &["B", "Z"]),
                ],
            ),
            bundle_info(
                "bundle2",
                &bundle2,
                vec![AssetManifestInfo::new("B", &[]), AssetManifestInfo::new("C", &[])],
            ),
            scene_info,
        ],
    };

    storage.insert_file("/ro/bundle1", bundle1);
    storage.insert_file("/ro/bundle2", bundle2);
    storage.insert_file("/ro/scenes", scenes);

    let manager = AssetManager::with_memory_io(
        config,
        manifest,
        storage.clone(),
        Arc::new(MemoryTransport::default()),
    )
    .unwrap();
    Fixture { manager, storage }
}

fn fixture() -> Fixture {
    fixture_with_config(
        LoaderConfig::new("/ro", "/rw").with_unload_delay(Duration::from_millis(100)),
    )
}

fn run_updates(
    manager: &mut AssetManager,
    count: usize,
) {
    for _ in 0..count {
        manager.update_with_delta(TICK);
    }
}

fn run_until_done(
    manager: &mut AssetManager,
    handler: Handler,
) -> HandlerState {
    for _ in 0..100 {
        if manager.handler_state(handler) != HandlerState::Doing {
            break;
        }
        manager.update_with_delta(TICK);
    }
    manager.handler_state(handler)
}

// For work done on worker threads
fn wait_until_done(
    manager: &mut AssetManager,
    handler: Handler,
) -> HandlerState {
    let deadline = Instant::now() + Duration::from_secs(10);
    while manager.handler_state(handler) == HandlerState::Doing {
        assert!(Instant::now() < deadline, "request did not finish");
        manager.update_with_delta(TICK);
        std::thread::sleep(Duration::from_millis(1));
    }
    manager.handler_state(handler)
}

#[test]
fn load_with_dependencies_then_unload_closes_both_bundles() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let handler = manager.load_asset("A");
    assert_eq!(manager.handler_state(handler), HandlerState::Doing);
    assert_eq!(run_until_done(&mut manager, handler), HandlerState::Success);

    let instance = manager.handler_instance(handler).unwrap();
    assert_eq!(instance.bytes(), b"asset a");
    assert_eq!(instance.kind(), InstanceKind::Asset);

    let database = manager.database();
    for name in ["A", "B", "C"] {
        assert_eq!(database.ref_count(name), 1, "{}", name);
    }
    assert!(database.bundle("bundle1").unwrap().dependency_bundles.contains("bundle2"));
    assert!(database.bundle("bundle2").unwrap().ref_bundles.contains("bundle1"));
    assert!(database.asset("A").unwrap().chain.down_stream.contains("B"));
    assert_eq!(storage.open_count(), 2);

    manager.unload(handler).unwrap();
    for name in ["A", "B", "C"] {
        assert_eq!(manager.database().ref_count(name), 0, "{}", name);
    }
    // Closing waits for the unload delay
    assert!(manager.database().is_bundle_loaded("bundle1"));
    assert_eq!(storage.close_count(), 0);

    run_updates(&mut manager, 10);
    assert!(!manager.database().is_bundle_loaded("bundle1"));
    assert!(!manager.database().is_bundle_loaded("bundle2"));
    assert_eq!(storage.close_count(), 2);
    assert!(manager.database().asset("A").unwrap().loaded_instance.is_none());
}

#[test]
fn merged_requests_share_one_extraction() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let calls = Rc::new(Cell::new(0));
    let handlers: Vec<Handler> = (0..3).map(|_| manager.load_asset("A")).collect();
    for handler in &handlers {
        let calls = calls.clone();
        manager
            .on_complete(*handler, move |outcome| {
                assert!(outcome.is_ok());
                calls.set(calls.get() + 1);
            })
            .unwrap();
    }

    assert_eq!(run_until_done(&mut manager, handlers[0]), HandlerState::Success);
    assert_eq!(calls.get(), 3);
    assert_eq!(storage.extract_count("A"), 1);
    assert_eq!(manager.database().ref_count("A"), 3);
    // Dependencies are held once, on behalf of A
    assert_eq!(manager.database().ref_count("B"), 1);

    let ids: Vec<InstanceId> = handlers
        .iter()
        .map(|x| manager.handler_instance(*x).unwrap().id())
        .collect();
    assert!(ids.iter().all(|x| *x == ids[0]));
    assert_eq!(manager.runner().task_count(), 0);
}

#[test]
fn loaded_asset_takes_fast_path() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let first = manager.load_asset("A");
    run_until_done(&mut manager, first);
    let started = manager.runner().started_count();

    // B is already held by A, loading it directly adds a reference without a task
    let second = manager.load_asset("B");
    assert_eq!(manager.handler_state(second), HandlerState::Success);
    assert_eq!(manager.database().ref_count("B"), 2);
    assert_eq!(manager.runner().started_count(), started);
    assert_eq!(storage.extract_count("B"), 1);

    manager.unload(first).unwrap();
    assert_eq!(manager.database().ref_count("B"), 1);
    run_updates(&mut manager, 10);
    assert!(!manager.database().is_bundle_loaded("bundle1"));
    assert!(manager.database().is_bundle_loaded("bundle2"));

    manager.unload(second).unwrap();
    run_updates(&mut manager, 10);
    assert!(!manager.database().is_bundle_loaded("bundle2"));
}

#[test]
fn unload_twice_is_rejected() {
    let Fixture { mut manager, .. } = fixture();
    let first = manager.load_asset("B");
    let second = manager.load_asset("B");
    run_until_done(&mut manager, first);
    assert_eq!(manager.database().ref_count("B"), 2);

    manager.unload(first).unwrap();
    assert!(matches!(manager.unload(first), Err(LoadError::InvalidHandler)));
    assert_eq!(manager.database().ref_count("B"), 1);
    assert_eq!(manager.handler_state(second), HandlerState::Success);
}

#[test]
fn reload_within_delay_keeps_bundle_open() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let handler = manager.load_asset("A");
    run_until_done(&mut manager, handler);
    let instance = manager.handler_instance(handler).unwrap();
    manager.unload(handler).unwrap();
    run_updates(&mut manager, 1);

    let again = manager.load_asset("A");
    assert_eq!(run_until_done(&mut manager, again), HandlerState::Success);
    run_updates(&mut manager, 10);

    assert_eq!(storage.close_count(), 0);
    assert_eq!(storage.open_count(), 2);
    assert_eq!(storage.extract_count("A"), 1);
    assert_eq!(manager.handler_instance(again).unwrap().id(), instance.id());
    assert_eq!(manager.database().ref_count("A"), 1);
}

#[test]
fn failed_dependency_rolls_back() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let handler = manager.load_asset("E");
    assert_eq!(run_until_done(&mut manager, handler), HandlerState::Failed);
    match manager.handler_error(handler) {
        Some(LoadError::DependencyLoadFailed {
            asset, dependency, ..
        }) => {
            assert_eq!(asset, "E");
            assert_eq!(dependency, "Z");
        }
        other => panic!("unexpected error {:?}", other),
    }

    assert_eq!(manager.database().ref_count("E"), 0);
    assert_eq!(manager.database().ref_count("B"), 0);
    assert!(manager.database().asset("B").unwrap().chain.up_stream.is_empty());

    run_updates(&mut manager, 10);
    assert_eq!(storage.close_count(), storage.open_count());
    // Failed handlers release themselves
    assert_eq!(manager.handler_state(handler), HandlerState::Invalid);
}

#[test]
fn missing_asset_in_archive_fails_extraction() {
    let Fixture { mut manager, .. } = fixture();
    let handler = manager.load_asset("D");
    assert_eq!(run_until_done(&mut manager, handler), HandlerState::Failed);
    assert!(matches!(
        manager.handler_error(handler),
        Some(LoadError::ExtractionFailed { .. })
    ));
    assert_eq!(manager.database().ref_count("D"), 0);
    assert!(manager.database().bundle("bundle1").unwrap().used_assets.is_empty());
}

#[test]
fn unreadable_bundle_fails_every_waiting_asset() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();
    storage.fail_opens("/ro/bundle2");

    let b = manager.load_asset("B");
    let c = manager.load_asset("C");
    assert_eq!(run_until_done(&mut manager, b), HandlerState::Failed);
    assert_eq!(manager.handler_state(c), HandlerState::Failed);
    assert!(matches!(
        manager.handler_error(c),
        Some(LoadError::BundleOpenFailed { .. })
    ));
    // Both asset loads merged into one open
    assert_eq!(storage.open_count(), 1);
    assert!(manager.database().is_bundle_unused("bundle2"));
}

#[test]
fn bad_names_fail_immediately() {
    let Fixture { mut manager, .. } = fixture();

    let empty = manager.load_asset("");
    assert_eq!(manager.handler_state(empty), HandlerState::Failed);
    assert!(matches!(manager.handler_error(empty), Some(LoadError::NameEmpty)));

    let missing = manager.load_asset("nope");
    assert!(matches!(
        manager.handler_error(missing),
        Some(LoadError::ManifestEntryMissing(_))
    ));

    let bundle = manager.load_bundle("nope");
    assert_eq!(manager.handler_state(bundle), HandlerState::Failed);
    assert_eq!(manager.runner().task_count(), 0);

    run_updates(&mut manager, 2);
    assert_eq!(manager.handler_state(empty), HandlerState::Invalid);
    assert!(matches!(manager.handler_progress(empty), Err(LoadError::InvalidHandler)));
}

#[test]
fn cancel_before_start() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let handler = manager.load_asset("A");
    let outcome = manager.completion(handler).unwrap();
    manager.cancel(handler).unwrap();
    run_updates(&mut manager, 1);

    assert_eq!(manager.handler_state(handler), HandlerState::Failed);
    assert!(matches!(outcome.try_recv(), Ok(Err(LoadError::Cancelled))));
    assert_eq!(manager.runner().task_count(), 0);
    assert_eq!(storage.open_count(), 0);
    assert!(matches!(manager.cancel(handler), Err(LoadError::NotInFlight)));
}

#[test]
fn cancel_leaves_merged_request_alone() {
    let Fixture { mut manager, .. } = fixture();
    let cancelled = manager.load_asset("A");
    let kept = manager.load_asset("A");
    manager.cancel(cancelled).unwrap();

    assert_eq!(run_until_done(&mut manager, kept), HandlerState::Success);
    assert!(matches!(manager.handler_error(cancelled), Some(LoadError::Cancelled)));
    assert_eq!(manager.database().ref_count("A"), 1);
}

#[test]
fn cancel_mid_load_releases_everything() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let handler = manager.load_asset("A");
    run_updates(&mut manager, 3);
    assert_eq!(manager.handler_state(handler), HandlerState::Doing);
    let progress = manager.handler_progress(handler).unwrap();
    assert!((0.0..1.0).contains(&progress));

    manager.unload(handler).unwrap();
    assert_eq!(manager.handler_state(handler), HandlerState::Invalid);
    run_updates(&mut manager, 20);

    assert_eq!(manager.runner().task_count(), 0);
    for name in ["A", "B", "C"] {
        assert_eq!(manager.database().ref_count(name), 0, "{}", name);
    }
    assert_eq!(storage.close_count(), storage.open_count());
}

#[test]
fn external_file_loads_as_raw() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();
    storage.insert_file("/data/config.bin", vec![7u8; 16]);

    let handler = manager.load_asset("/data/config.bin");
    assert_eq!(run_until_done(&mut manager, handler), HandlerState::Success);
    let instance = manager.handler_instance(handler).unwrap();
    assert_eq!(instance.kind(), InstanceKind::Raw);
    assert_eq!(instance.bytes(), &[7u8; 16][..]);

    manager.unload_instance(&instance).unwrap();
    assert_eq!(manager.handler_state(handler), HandlerState::Invalid);
    run_updates(&mut manager, 10);
    assert!(!manager.database().is_bundle_loaded("/data/config.bin"));
}

#[test]
fn unload_by_instance_releases_one_reference() {
    let Fixture { mut manager, .. } = fixture();
    let first = manager.load_asset("C");
    let second = manager.load_asset("C");
    run_until_done(&mut manager, first);

    let instance = manager.handler_instance(second).unwrap();
    manager.unload_instance(&instance).unwrap();
    assert_eq!(manager.database().ref_count("C"), 1);
    manager.unload_instance(&instance).unwrap();
    assert_eq!(manager.database().ref_count("C"), 0);
    assert!(matches!(
        manager.unload_instance(&instance),
        Err(LoadError::NotLoaded(_))
    ));
}

#[test]
fn higher_priority_starts_first() {
    let Fixture { mut manager, .. } = fixture_with_config(
        LoaderConfig::new("/ro", "/rw")
            .with_unload_delay(Duration::from_millis(100))
            .with_max_task_starts_per_tick(1),
    );

    let low = manager.load_asset_with_priority("B", Priority::Low);
    let high = manager.load_asset_with_priority("C", Priority::VeryHigh);
    run_updates(&mut manager, 1);

    let runner = manager.runner();
    let low_task = runner.find_task(TaskKind::AssetLoad, "B").unwrap();
    let high_task = runner.find_task(TaskKind::AssetLoad, "C").unwrap();
    assert_eq!(runner.task_state(high_task), TaskState::Running);
    assert_eq!(runner.task_state(low_task), TaskState::Waiting);

    assert_eq!(run_until_done(&mut manager, low), HandlerState::Success);
    assert_eq!(manager.handler_state(high), HandlerState::Success);
}

#[test]
fn scenes_and_bundles() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let scene = manager.load_scene("S");
    assert_eq!(run_until_done(&mut manager, scene), HandlerState::Success);
    assert_eq!(manager.handler_instance(scene).unwrap().kind(), InstanceKind::Scene);

    let not_a_scene = manager.load_scene("A");
    assert_eq!(manager.handler_state(not_a_scene), HandlerState::Failed);

    let bundle = manager.load_bundle("bundle2");
    assert_eq!(run_until_done(&mut manager, bundle), HandlerState::Success);
    assert_eq!(manager.database().bundle("bundle2").unwrap().external_refs, 1);
    run_updates(&mut manager, 10);
    assert!(manager.database().is_bundle_loaded("bundle2"));

    manager.unload(bundle).unwrap();
    manager.unload(scene).unwrap();
    run_updates(&mut manager, 10);
    assert!(!manager.database().is_bundle_loaded("bundle2"));
    assert!(!manager.database().is_bundle_loaded("scenes"));
    assert_eq!(storage.close_count(), 2);
}

#[test]
fn bundle_request_during_delay_keeps_bundle_open() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let first = manager.load_bundle("bundle2");
    assert_eq!(run_until_done(&mut manager, first), HandlerState::Success);
    manager.unload(first).unwrap();
    // Half of the unload delay
    run_updates(&mut manager, 1);
    assert!(manager.database().is_bundle_loaded("bundle2"));

    let second = manager.load_bundle("bundle2");
    assert_eq!(manager.database().bundle("bundle2").unwrap().pending_requests, 1);
    run_updates(&mut manager, 1);
    assert_eq!(manager.handler_state(second), HandlerState::Success);
    assert!(manager.database().is_bundle_loaded("bundle2"));

    run_updates(&mut manager, 10);
    let info = manager.database().bundle("bundle2").unwrap();
    assert!(info.loaded_handle.is_some());
    assert_eq!(info.external_refs, 1);
    assert_eq!(info.pending_requests, 0);
    assert_eq!(storage.close_count(), 0);

    manager.unload(second).unwrap();
    run_updates(&mut manager, 10);
    assert!(!manager.database().is_bundle_loaded("bundle2"));
    assert_eq!(storage.close_count(), 1);
}

#[test]
fn unloading_bundle_request_in_flight_drops_it() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let handler = manager.load_bundle("bundle2");
    assert_eq!(manager.handler_state(handler), HandlerState::Doing);
    manager.unload(handler).unwrap();
    assert_eq!(manager.handler_state(handler), HandlerState::Invalid);
    assert_eq!(manager.database().bundle("bundle2").unwrap().pending_requests, 0);

    run_updates(&mut manager, 10);
    let info = manager.database().bundle("bundle2").unwrap();
    assert!(info.loaded_handle.is_none());
    assert_eq!(info.external_refs, 0);
    assert_eq!(storage.close_count(), storage.open_count());
}

#[test]
fn reset_drops_everything() {
    let Fixture {
        mut manager,
        storage,
    } = fixture();

    let loaded = manager.load_asset("A");
    run_until_done(&mut manager, loaded);
    let pending = manager.load_asset("S");
    let manifest = manager.database().manifest().clone();

    manager.reset(manifest).unwrap();
    assert_eq!(manager.handler_state(loaded), HandlerState::Invalid);
    assert_eq!(manager.handler_state(pending), HandlerState::Invalid);
    assert_eq!(storage.close_count(), storage.open_count());
    assert!(manager.database().snapshot().assets.is_empty());

    let again = manager.load_asset("A");
    assert_eq!(run_until_done(&mut manager, again), HandlerState::Success);
}

#[test]
fn sync_load() {
    let Fixture { mut manager, .. } = fixture();
    let instance = manager.load_asset_sync("C").unwrap();
    assert_eq!(instance.bytes(), b"asset c");
    assert!(matches!(manager.load_asset_sync("D"), Err(LoadError::ExtractionFailed { .. })));
}

//
// Downloads
//
const DLC_URL: &str = "http://cdn/dlc/pack.bundle";

struct DownloadFixture {
    manager: AssetManager,
    transport: MemoryTransport,
    data: Vec<u8>,
    read_write_root: PathBuf,
}

fn download_fixture(root: &Path) -> DownloadFixture {
    download_fixture_with_retries(root, 3)
}

fn download_fixture_with_retries(
    root: &Path,
    retries: u32,
) -> DownloadFixture {
    let data: Vec<u8> = (0..1000u32).map(|x| (x % 251) as u8).collect();
    let base = b"base bundle".to_vec();
    let mut dlc = bundle_info("dlc/pack.bundle", &data, vec![AssetManifestInfo::new("P", &[])]);
    dlc.group = "dlc".to_string();
    let manifest = Manifest {
        version: 2,
        bundles: vec![
            dlc,
            bundle_info("base.bundle", &base, vec![AssetManifestInfo::new("Q", &[])]),
        ],
    };

    let transport = MemoryTransport::default();
    transport.insert(DLC_URL, data.clone());
    transport.insert("http://cdn/base.bundle", base);

    let read_write_root = root.join("rw");
    let config = LoaderConfig::new(root.join("ro"), &read_write_root)
        .with_download_url("http://cdn/")
        .with_max_download_retries(retries);
    let manager = AssetManager::with_memory_io(
        config,
        manifest,
        MemoryStorage::default(),
        Arc::new(transport.clone()),
    )
    .unwrap();

    DownloadFixture {
        manager,
        transport,
        data,
        read_write_root,
    }
}

#[test]
fn download_publishes_verified_file() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture {
        mut manager,
        transport,
        data,
        read_write_root,
    } = download_fixture(dir.path());

    let received = Rc::new(Cell::new(0u64));
    let totals = Rc::new(RefCell::new(Vec::new()));
    {
        let received = received.clone();
        let totals = totals.clone();
        manager.set_download_listener(move |progress| {
            received.set(received.get() + progress.delta);
            totals.borrow_mut().push(progress.total);
        });
    }

    let handler = manager.download_bundle("dlc/pack.bundle");
    assert_eq!(wait_until_done(&mut manager, handler), HandlerState::Success);

    let final_path = read_write_root.join("dlc").join("pack.bundle");
    assert_eq!(std::fs::read(&final_path).unwrap(), data);
    assert!(!read_write_root.join("dlc").join("pack.bundle.downloading").exists());
    assert_eq!(received.get(), data.len() as u64);
    assert!(totals.borrow().iter().all(|x| *x == data.len() as u64));
    assert_eq!(transport.requests(), vec![(DLC_URL.to_string(), 0)]);

    let info = manager.update_info("dlc/pack.bundle").unwrap();
    assert_eq!(info.state, UpdateState::Updated);
    assert_eq!(info.group, "dlc");
    assert_eq!(
        manager.database().bundle("dlc/pack.bundle").unwrap().state,
        database::BundleState::InReadWrite
    );
}

#[test]
fn interrupted_download_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture {
        mut manager,
        transport,
        data,
        read_write_root,
    } = download_fixture(dir.path());
    transport.fail_once_after(DLC_URL, 100);

    let handler = manager.download_bundle("dlc/pack.bundle");
    assert_eq!(wait_until_done(&mut manager, handler), HandlerState::Success);
    assert_eq!(
        transport.requests(),
        vec![(DLC_URL.to_string(), 0), (DLC_URL.to_string(), 100)]
    );
    assert_eq!(
        std::fs::read(read_write_root.join("dlc").join("pack.bundle")).unwrap(),
        data
    );
}

#[test]
fn new_request_resumes_file_left_by_failed_one() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture {
        mut manager,
        transport,
        data,
        read_write_root,
    } = download_fixture_with_retries(dir.path(), 0);
    let temp_path = read_write_root.join("dlc").join("pack.bundle.downloading");
    transport.fail_once_after(DLC_URL, 300);

    let first = manager.download_bundle("dlc/pack.bundle");
    assert_eq!(wait_until_done(&mut manager, first), HandlerState::Failed);
    assert_eq!(std::fs::metadata(&temp_path).unwrap().len(), 300);

    let second = manager.download_bundle("dlc/pack.bundle");
    assert_eq!(wait_until_done(&mut manager, second), HandlerState::Success);
    assert_eq!(
        transport.requests(),
        vec![(DLC_URL.to_string(), 0), (DLC_URL.to_string(), 300)]
    );
    assert_eq!(
        std::fs::read(read_write_root.join("dlc").join("pack.bundle")).unwrap(),
        data
    );
}

#[test]
fn complete_temp_file_is_verified_without_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture {
        mut manager,
        transport,
        data,
        read_write_root,
    } = download_fixture(dir.path());
    let temp_path = read_write_root.join("dlc").join("pack.bundle.downloading");
    std::fs::create_dir_all(temp_path.parent().unwrap()).unwrap();
    std::fs::write(&temp_path, &data).unwrap();

    let handler = manager.download_bundle("dlc/pack.bundle");
    assert_eq!(wait_until_done(&mut manager, handler), HandlerState::Success);
    assert!(transport.requests().is_empty());
    assert!(!temp_path.exists());
    assert_eq!(
        std::fs::read(read_write_root.join("dlc").join("pack.bundle")).unwrap(),
        data
    );
}

#[test]
fn complete_but_corrupt_temp_file_downloads_again() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture {
        mut manager,
        transport,
        data,
        read_write_root,
    } = download_fixture(dir.path());
    let temp_path = read_write_root.join("dlc").join("pack.bundle.downloading");
    std::fs::create_dir_all(temp_path.parent().unwrap()).unwrap();
    std::fs::write(&temp_path, vec![0u8; data.len()]).unwrap();

    let handler = manager.download_bundle("dlc/pack.bundle");
    assert_eq!(wait_until_done(&mut manager, handler), HandlerState::Success);
    // Verifying the leftover file failed, the next attempt starts over instead of resuming
    assert_eq!(transport.requests(), vec![(DLC_URL.to_string(), 0)]);
    assert_eq!(
        std::fs::read(read_write_root.join("dlc").join("pack.bundle")).unwrap(),
        data
    );
}

#[test]
fn cancel_during_verification_keeps_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture {
        mut manager,
        transport,
        data,
        read_write_root,
    } = download_fixture(dir.path());
    let temp_path = read_write_root.join("dlc").join("pack.bundle.downloading");
    std::fs::create_dir_all(temp_path.parent().unwrap()).unwrap();
    std::fs::write(&temp_path, &data).unwrap();

    let handler = manager.download_bundle("dlc/pack.bundle");
    // Starts the task, which goes straight to verifying the leftover file
    run_updates(&mut manager, 1);
    assert_eq!(manager.handler_state(handler), HandlerState::Doing);
    manager.cancel(handler).unwrap();
    run_updates(&mut manager, 1);
    assert!(matches!(manager.handler_error(handler), Some(LoadError::Cancelled)));
    assert!(temp_path.exists());
    assert!(!read_write_root.join("dlc").join("pack.bundle").exists());

    let again = manager.download_bundle("dlc/pack.bundle");
    assert_eq!(wait_until_done(&mut manager, again), HandlerState::Success);
    assert!(transport.requests().is_empty());
    assert_eq!(
        std::fs::read(read_write_root.join("dlc").join("pack.bundle")).unwrap(),
        data
    );
}

#[test]
fn download_gives_up_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture {
        mut manager,
        transport,
        ..
    } = download_fixture(dir.path());
    let url = "http://cdn/missing.bundle";
    let manifest = Manifest {
        version: 3,
        bundles: vec![bundle_info("missing.bundle", b"never served", vec![])],
    };
    manager.reset(manifest).unwrap();

    let handler = manager.download_bundle("missing.bundle");
    assert_eq!(wait_until_done(&mut manager, handler), HandlerState::Failed);
    assert!(matches!(
        manager.handler_error(handler),
        Some(LoadError::TransferFailed { .. })
    ));
    assert_eq!(transport.requests().len(), 4);
    assert!(transport.requests().iter().all(|(x, _)| x == url));
    assert_eq!(
        manager.update_info("missing.bundle").unwrap().state,
        UpdateState::Failed
    );
}

#[test]
fn corrupt_download_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture {
        mut manager,
        transport,
        read_write_root,
        ..
    } = download_fixture(dir.path());
    transport.corrupt(DLC_URL);

    let handler = manager.download_bundle("dlc/pack.bundle");
    assert_eq!(wait_until_done(&mut manager, handler), HandlerState::Failed);
    // Verification failures delete the temp file, so every attempt starts over
    assert_eq!(transport.requests(), vec![(DLC_URL.to_string(), 0); 4]);
    assert!(!read_write_root.join("dlc").join("pack.bundle").exists());
    assert!(!read_write_root.join("dlc").join("pack.bundle.downloading").exists());
    assert_eq!(
        manager.database().bundle("dlc/pack.bundle").unwrap().state,
        database::BundleState::Missing
    );
}

#[test]
fn paused_group_waits() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture {
        mut manager,
        transport,
        ..
    } = download_fixture(dir.path());

    manager.pause_group("dlc");
    assert!(manager.is_group_paused("dlc"));
    let handlers = manager.download_updates(&Manifest::default(), Some("dlc"));
    assert_eq!(handlers.len(), 1);

    run_updates(&mut manager, 5);
    assert_eq!(manager.handler_state(handlers[0]), HandlerState::Doing);
    assert!(transport.requests().is_empty());
    assert_eq!(
        manager.update_info("dlc/pack.bundle").unwrap().state,
        UpdateState::Waiting
    );

    manager.resume_group("dlc");
    assert_eq!(wait_until_done(&mut manager, handlers[0]), HandlerState::Success);
    assert_eq!(manager.update_infos().len(), 1);
}

#[test]
fn missing_bundle_downloads_before_load() {
    let dir = tempfile::tempdir().unwrap();
    let data = archive(&[("P", b"downloaded asset")]);
    let manifest = Manifest {
        version: 1,
        bundles: vec![bundle_info("pack.bundle", &data, vec![AssetManifestInfo::new("P", &[])])],
    };
    let transport = MemoryTransport::default();
    transport.insert("http://cdn/pack.bundle", data);

    let config = LoaderConfig::new(dir.path().join("ro"), dir.path().join("rw"))
        .with_download_url("http://cdn")
        .with_auto_download_missing(true);
    let mut manager = AssetManager::with_io(
        config,
        manifest,
        |io_tx| Ok(Box::new(DiskBundleIO::new(2, io_tx)?) as Box<dyn BundleIO>),
        Arc::new(transport),
    )
    .unwrap();

    let handler = manager.load_asset("P");
    assert_eq!(wait_until_done(&mut manager, handler), HandlerState::Success);
    assert_eq!(manager.handler_instance(handler).unwrap().bytes(), b"downloaded asset");
    assert!(dir.path().join("rw").join("pack.bundle").is_file());
}

#[test]
fn missing_bundle_without_auto_download_fails() {
    let dir = tempfile::tempdir().unwrap();
    let DownloadFixture { mut manager, .. } = download_fixture(dir.path());
    let handler = manager.load_asset("P");
    assert_eq!(run_until_done(&mut manager, handler), HandlerState::Failed);
    assert!(matches!(
        manager.handler_error(handler),
        Some(LoadError::BundleOpenFailed { .. })
    ));
}
