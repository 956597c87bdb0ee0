use cask::base::{AssetManifestInfo, BundleArchiveWriter, BundleManifestInfo, ContentChecksum, Manifest};
use cask::loader::{AssetManager, HandlerState, LoaderConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug)]
struct Transform {
    position: [f32; 3],
    rotation: [f32; 4],
    scale: [f32; 3],
}

#[derive(Serialize, Deserialize, Debug)]
struct Material {
    name: String,
    texture: String,
}

// Writes the archives and manifest a build step would have produced into `root`
fn write_build_data(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let transform = Transform {
        position: [1.0, 2.0, 3.0],
        rotation: [0.0, 0.0, 0.0, 1.0],
        scale: [1.0, 1.0, 1.0],
    };
    let material = Material {
        name: "stone".to_string(),
        texture: "textures/stone".to_string(),
    };

    let mut level = BundleArchiveWriter::default();
    level.add_asset("level/transform", bincode::serialize(&transform)?);
    level.add_asset("level/material", bincode::serialize(&material)?);
    let level = level.to_bytes()?;

    let mut textures = BundleArchiveWriter::default();
    textures.add_asset("textures/stone", vec![128u8; 64 * 64]);
    let textures = textures.to_bytes()?;

    let manifest = Manifest {
        version: 1,
        bundles: vec![
            BundleManifestInfo {
                name: "level.bundle".to_string(),
                length: level.len() as u64,
                hash: "0001".to_string(),
                checksum: ContentChecksum::of_bytes(&level),
                assets: vec![
                    AssetManifestInfo::new("level/transform", &["level/material"]),
                    AssetManifestInfo::new("level/material", &["textures/stone"]),
                ],
                ..Default::default()
            },
            BundleManifestInfo {
                name: "textures.bundle".to_string(),
                length: textures.len() as u64,
                hash: "0001".to_string(),
                checksum: ContentChecksum::of_bytes(&textures),
                assets: vec![AssetManifestInfo::new("textures/stone", &[])],
                ..Default::default()
            },
        ],
    };

    std::fs::write(root.join("level.bundle"), level)?;
    std::fs::write(root.join("textures.bundle"), textures)?;
    manifest.save_to_file(&root.join("manifest.json"))?;
    Ok(())
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let build_dir = tempfile::tempdir().unwrap();
    let read_only_root = build_dir.path().join("shipped");
    let read_write_root = build_dir.path().join("cache");
    std::fs::create_dir_all(&read_only_root).unwrap();
    write_build_data(&read_only_root).unwrap();

    let config = LoaderConfig::new(&read_only_root, &read_write_root)
        .with_unload_delay(Duration::from_millis(250));
    let mut manager = AssetManager::new(config).unwrap();

    let transform = manager.load_asset("level/transform");
    manager
        .on_complete(transform, |outcome| match outcome {
            Ok(_) => println!("level/transform finished loading"),
            Err(e) => println!("level/transform failed: {}", e),
        })
        .unwrap();

    loop {
        std::thread::sleep(Duration::from_millis(15));
        manager.update();
        profiling::finish_frame!();

        match manager.handler_state(transform) {
            HandlerState::Doing => {
                println!(
                    "level/transform loading {:.0}%",
                    manager.handler_progress(transform).unwrap() * 100.0
                )
            }
            HandlerState::Success => break,
            HandlerState::Failed | HandlerState::Invalid => {
                println!("load failed: {:?}", manager.handler_error(transform));
                return;
            }
        }
    }

    let instance = manager.handler_instance(transform).unwrap();
    let data: Transform = instance.deserialize().unwrap();
    println!("loaded {:?}", data);

    let material = manager.load_asset_sync("level/material").unwrap();
    println!("loaded {:?}", material.deserialize::<Material>().unwrap());
    manager.unload_instance(&material).unwrap();

    for bundle in &manager.database().snapshot().bundles {
        println!(
            "{} loaded: {} used by {:?} depends on {:?}",
            bundle.name, bundle.loaded, bundle.used_assets, bundle.dependency_bundles
        );
    }

    manager.unload(transform).unwrap();
    while manager.database().is_bundle_loaded("level.bundle")
        || manager.database().is_bundle_loaded("textures.bundle")
    {
        std::thread::sleep(Duration::from_millis(15));
        manager.update();
    }
    println!("all bundles closed");
}
