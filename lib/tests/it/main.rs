use anyhow::Result;
use camino::Utf8Path;
use indoc::indoc;

use imgcomposer_lib::error::InstallError;
use imgcomposer_lib::mount::{resolve_mount_points, DiskPathIdMap, MountOrder};
use imgcomposer_lib::packages::installation_order;
use imgcomposer_lib::repos::{generate_apt_sources, PREFERENCES_DIR, SOURCES_LIST_PATH};
use imgcomposer_lib::template::ImageTemplate;

const TEMPLATE: &str = indoc! { r#"
    image:
      name: edge-image
      version: "1.0"
    target:
      os: ubuntu
      dist: ubuntu24
      arch: x86_64
      imageType: raw
    disk:
      partitions:
        - id: boot
          fsType: fat32
          mountPoint: /boot/efi
        - id: rootfs
          fsType: ext4
          mountPoint: /
        - id: data
          fsType: ext4
          mountPoint: /var/lib/data
        - id: swap
          fsType: swap
    systemConfig:
      name: edge
      packages: [bash, initramfs-tools, filesystem, systemd]
      packageRepositories:
        - codename: sed
          url: https://eci.intel.com/sed-repos/noble
          pkey: https://eci.intel.com/sed-repos/gpg-keys/GPG-PUB-KEY-INTEL-SED.gpg
          priority: 1000
        - id: openvino
          codename: ubuntu24
          url: https://apt.repos.intel.com/openvino/2025
          pkey: https://apt.repos.intel.com/intel-gpg-keys/GPG-PUB-KEY-INTEL-SW-PRODUCTS.PUB
          component: main
      additionalFiles:
        - local: files/motd
          final: /etc/motd
"# };

const DISK_PATHS: &str = r#"[
    {"id": "rootfs", "path": "/dev/loop0p2"},
    {"id": "boot", "path": "/dev/loop0p1"},
    {"id": "data", "path": "/dev/loop0p3"},
    {"id": "swap", "path": "/dev/loop0p4"}
]"#;

fn assert_err_contains<T>(r: Result<T>, s: impl AsRef<str>) {
    let s = s.as_ref();
    let msg = format!("{:#}", r.err().unwrap());
    if !msg.contains(s) {
        panic!(r#"Error message "{}" did not contain "{}""#, msg, s);
    }
}

fn staging() -> Result<(tempfile::TempDir, camino::Utf8PathBuf)> {
    let td = tempfile::tempdir()?;
    let p = Utf8Path::from_path(td.path()).unwrap().join("staging");
    Ok((td, p))
}

#[test]
fn test_package_order() {
    let t = ImageTemplate::from_yaml_str(TEMPLATE).unwrap();
    assert_eq!(
        installation_order(&t.system_config.packages),
        ["filesystem", "bash", "systemd", "initramfs-tools"]
    );
}

#[test]
fn test_generate_apt_sources() -> Result<()> {
    let (_td, staging) = staging()?;
    let mut t = ImageTemplate::from_yaml_str(TEMPLATE)?;
    generate_apt_sources(&mut t, &staging)?;
    let files = &t.system_config.additional_files;
    let dests = files
        .iter()
        .map(|f| f.final_path.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        dests,
        [
            "/etc/motd",
            SOURCES_LIST_PATH,
            &format!("{PREFERENCES_DIR}/sed"),
            &format!("{PREFERENCES_DIR}/openvino"),
        ]
    );
    let sources = std::fs::read_to_string(&files[1].local)?;
    similar_asserts::assert_eq!(
        sources,
        indoc! { "
            # Package repositories generated from image template configuration
            deb [signed-by=/usr/share/keyrings/GPG-PUB-KEY-INTEL-SED.gpg] https://eci.intel.com/sed-repos/noble sed main
            deb [signed-by=/usr/share/keyrings/GPG-PUB-KEY-INTEL-SW-PRODUCTS.PUB.gpg] https://apt.repos.intel.com/openvino/2025 ubuntu24 main
        " }
    );
    similar_asserts::assert_eq!(
        std::fs::read_to_string(&files[3].local)?,
        indoc! { "
            # Priority 500: Default
            Package: *
            Pin: origin apt.repos.intel.com
            Pin-Priority: 500
        " }
    );
    assert!(files[1..].iter().all(|f| f.local.starts_with(&staging)));

    // Generating again replaces the sources instead of adding duplicates
    let first = files[1].local.clone();
    generate_apt_sources(&mut t, &staging)?;
    let files = &t.system_config.additional_files;
    assert_eq!(files.len(), 4);
    assert_ne!(files[1].local, first);
    Ok(())
}

#[test]
fn test_generate_apt_sources_rpm() -> Result<()> {
    let (_td, staging) = staging()?;
    let mut t = ImageTemplate::from_yaml_str(TEMPLATE)?;
    t.target.os = "azure-linux".into();
    generate_apt_sources(&mut t, &staging)?;
    assert_eq!(t.system_config.additional_files.len(), 1);
    assert!(!staging.exists());
    Ok(())
}

#[test]
fn test_generate_apt_sources_invalid() -> Result<()> {
    let (_td, staging) = staging()?;
    let mut t = ImageTemplate::from_yaml_str(TEMPLATE)?;
    t.system_config.package_repositories[0].pkey = String::new();
    let r = generate_apt_sources(&mut t, &staging);
    let e = r.as_ref().err().unwrap();
    assert!(matches!(
        e.downcast_ref::<InstallError>(),
        Some(InstallError::RepositoryGenerationFailure)
    ));
    assert_err_contains(r, "Missing signing key");
    assert_eq!(t.system_config.additional_files.len(), 1);
    Ok(())
}

#[test]
fn test_resolve_mount_points() -> Result<()> {
    let td = tempfile::tempdir()?;
    let path = Utf8Path::from_path(td.path()).unwrap().join("parts.json");
    std::fs::write(&path, DISK_PATHS)?;
    let map = DiskPathIdMap::from_json_path(&path)?;
    assert_eq!(map.len(), 4);
    assert_eq!(map.get("boot").unwrap(), "/dev/loop0p1");

    let t = ImageTemplate::from_yaml_str(TEMPLATE)?;
    let root = Utf8Path::new("/var/tmp/chroot/edge");
    let mounts = resolve_mount_points(root, &map, &t.disk.partitions, MountOrder::default())?;
    let targets = mounts
        .iter()
        .map(|m| m.absolute_mount_point.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        targets,
        [
            "/var/tmp/chroot/edge",
            "/var/tmp/chroot/edge/boot/efi",
            "/var/tmp/chroot/edge/var/lib/data"
        ]
    );
    assert_eq!(mounts[1].mount_flags, ["-t", "vfat", "-o", "umask=0077"]);

    std::fs::write(&path, r#"[{"id": "a", "path": "/dev/a"}, {"id": "a", "path": "/dev/b"}]"#)?;
    assert_err_contains(DiskPathIdMap::from_json_path(&path), "Duplicate partition ID a");
    Ok(())
}
