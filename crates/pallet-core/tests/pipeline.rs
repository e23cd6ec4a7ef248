use flate2::write::GzEncoder;
use flate2::Compression;
use pallet_core::{CancellationToken, CoreError, Engine, InstallOptions, Stage};
use pallet_fetch::{ArchiveOrigin, FetchConfig};
use pallet_schema::{Checksum, Destination, DigestAlgorithm, PackageName, Version};
use pallet_store::{digest_bytes, InstallLayout, InstallReceipt, InstalledArtifact};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Root bypasses permission checks, so permission tests skip themselves.
fn skip_if_root() -> bool {
    #[allow(unsafe_code)]
    unsafe {
        libc::getuid() == 0
    }
}

/// Gzipped tarball holding `dir` under the top-level name `top`.
fn tar_gz(top: &str, dir: &Path) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.append_dir_all(top, dir).unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

struct World {
    dir: tempfile::TempDir,
    layout: InstallLayout,
}

impl World {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::with_root(dir.path().join("prefix"), dir.path());
        Self { dir, layout }
    }

    fn engine(&self) -> Engine {
        Engine::new(self.layout.clone(), FetchConfig::default()).unwrap()
    }

    fn prefix(&self) -> &Path {
        self.layout.prefix()
    }

    /// Pack a `git-repos-<version>/` release tree and write it next to the prefix.
    fn publish_release(&self, version: &str, files: &[(&str, &str)]) -> PathBuf {
        let src = tempfile::tempdir().unwrap();
        let top_name = format!("git-repos-{version}");
        let top = src.path().join(&top_name);
        fs::create_dir_all(&top).unwrap();
        for (name, content) in files {
            let path = top.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
        let archive = self.dir.path().join(format!("v{version}.tar.gz"));
        fs::write(&archive, tar_gz(&top_name, &top)).unwrap();
        archive
    }

    fn write_manifest(&self, archive: &Path, checksum: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join("git-repos.toml");
        fs::write(
            &path,
            format!(
                r#"
name = "git-repos"
description = "A git plugin to iterate over multiple repositories"
homepage = "https://github.com/lojoe/git-repos"

[source]
url = "file://{}"
version = "0.3"
checksum = "{checksum}"
{body}
"#,
                archive.display()
            ),
        )
        .unwrap();
        path
    }

    fn manifest_for(&self, archive: &Path, body: &str) -> PathBuf {
        let digest = digest_bytes(DigestAlgorithm::Sha256, &fs::read(archive).unwrap());
        self.write_manifest(archive, &format!("sha256:{digest}"), body)
    }
}

const SCRIPT: &str = "#!/bin/sh\necho \"usage: git-repos [-h]\"\n";

const STEPS: &str = r#"
[[install]]
source = "git-repos"
destination = "bin"

[[install]]
source = "cr.sh"
destination = "bash_completion"

[[test]]
command = ["git-repos", "-h"]
"#;

fn standard_release(world: &World) -> PathBuf {
    world.publish_release("0.3", &[("git-repos", SCRIPT), ("cr.sh", "cr() { :; }\n")])
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn open_journal_entries(world: &World) -> usize {
    file_names(&world.layout.journal_dir())
        .iter()
        .filter(|n| n.ends_with(".json"))
        .count()
}

#[test]
fn install_places_files_and_passes_smoke_tests() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);

    let outcome = world
        .engine()
        .install_file(&manifest, InstallOptions::default())
        .unwrap();

    assert_eq!(outcome.artifacts().len(), 2);
    assert_eq!(outcome.origin, ArchiveOrigin::LocalFile);
    assert!(outcome.tests_passed(), "{:?}", outcome.tests);

    let bin = world.prefix().join("bin/git-repos");
    assert_eq!(fs::read_to_string(&bin).unwrap(), SCRIPT);
    assert_eq!(fs::metadata(&bin).unwrap().permissions().mode() & 0o111, 0o111);
    assert!(world
        .prefix()
        .join("etc/bash_completion.d/cr.sh")
        .is_file());
    assert_eq!(outcome.receipt.version, "0.3");
}

#[test]
fn checksum_mismatch_leaves_prefix_untouched() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.write_manifest(&archive, &format!("sha256:{}", "0".repeat(64)), STEPS);

    let engine = world.engine();
    let err = engine
        .install_file(&manifest, InstallOptions::default())
        .unwrap_err();

    assert!(matches!(err, CoreError::ChecksumMismatch { .. }), "{err:?}");
    assert_eq!(err.stage(), Stage::Verify);
    assert!(!world.prefix().exists(), "prefix must not be created");
    assert!(engine.list().unwrap().is_empty());
    assert_eq!(
        fs::read_dir(world.layout.downloads_dir()).unwrap().count(),
        0,
        "unverified bytes must not be cached"
    );
}

#[test]
fn empty_install_list_is_rejected_before_fetching() {
    let world = World::new();
    let manifest = world.dir.path().join("empty.toml");
    fs::write(
        &manifest,
        format!(
            r#"
name = "git-repos"
[source]
url = "http://127.0.0.1:1/never-contacted.tar.gz"
checksum = "sha256:{}"
"#,
            "a".repeat(64)
        ),
    )
    .unwrap();

    let err = world
        .engine()
        .install_file(&manifest, InstallOptions::default())
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Parse);
    assert!(err.to_string().contains("install list is empty"), "{err}");
}

#[test]
fn reinstall_is_idempotent_and_uses_cache() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);
    let engine = world.engine();

    let first = engine
        .install_file(&manifest, InstallOptions::default())
        .unwrap();
    let second = engine
        .install_file(&manifest, InstallOptions::default())
        .unwrap();

    assert_eq!(second.origin, ArchiveOrigin::Cache);
    assert_eq!(first.artifacts(), second.artifacts());
    let names: Vec<_> = fs::read_dir(world.prefix().join("bin"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, vec!["git-repos"], "no backups or temp files may remain");
    assert_eq!(engine.list().unwrap().len(), 1);
}

#[test]
fn cached_archive_survives_missing_source() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);
    let engine = world.engine();

    let parsed = engine.load_manifest(&manifest).unwrap();
    engine.fetch_verified(&parsed).unwrap();
    fs::remove_file(&archive).unwrap();

    let outcome = engine.install(&parsed, InstallOptions::default()).unwrap();
    assert_eq!(outcome.origin, ArchiveOrigin::Cache);
}

#[test]
fn corrupt_cache_entry_is_refetched() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);
    let engine = world.engine();
    let parsed = engine.load_manifest(&manifest).unwrap();
    engine.fetch_verified(&parsed).unwrap();

    for entry in fs::read_dir(world.layout.downloads_dir()).unwrap() {
        fs::write(entry.unwrap().path(), b"bit rot").unwrap();
    }

    let fetched = engine.fetch_verified(&parsed).unwrap();
    assert_eq!(fetched.origin, ArchiveOrigin::LocalFile);
    assert_eq!(fetched.bytes, fs::read(&archive).unwrap());
}

#[test]
fn failing_smoke_test_keeps_install() {
    let world = World::new();
    let archive = standard_release(&world);
    let steps = STEPS.replace(r#"["git-repos", "-h"]"#, r#"["false"]"#);
    let manifest = world.manifest_for(&archive, &steps);

    let outcome = world
        .engine()
        .install_file(&manifest, InstallOptions::default())
        .unwrap();
    assert!(!outcome.tests_passed());
    let failure = outcome.tests.unwrap().failure.unwrap();
    assert_eq!(failure.index, 0);
    assert_eq!(failure.command, "false");
    assert!(world.prefix().join("bin/git-repos").is_file());
}

#[test]
fn skip_tests_stops_after_publish() {
    let world = World::new();
    let archive = standard_release(&world);
    let steps = STEPS.replace(r#"["git-repos", "-h"]"#, r#"["false"]"#);
    let manifest = world.manifest_for(&archive, &steps);

    let outcome = world
        .engine()
        .install_file(
            &manifest,
            InstallOptions {
                skip_tests: true,
                ..InstallOptions::default()
            },
        )
        .unwrap();
    assert!(outcome.tests.is_none());
    assert!(outcome.tests_passed());
}

#[test]
fn publish_failure_is_all_or_nothing() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);
    fs::create_dir_all(world.prefix().join("etc/bash_completion.d/cr.sh")).unwrap();

    let engine = world.engine();
    let err = engine
        .install_file(&manifest, InstallOptions::default())
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Install);
    assert!(!world.prefix().join("bin").exists(), "bin dir created by the run must be removed");
    assert!(engine.list().unwrap().is_empty());
}

#[test]
fn read_only_destination_rolls_back() {
    if skip_if_root() {
        eprintln!("skipping: running as root");
        return;
    }
    let world = World::new();
    let archive = world.publish_release("0.3", &[("git-repos", SCRIPT), ("README", "readme")]);
    let manifest = world.manifest_for(
        &archive,
        r#"
[[install]]
source = "git-repos"
destination = "bin"

[[install]]
source = "README"
destination = "share"
"#,
    );
    let share = world.prefix().join("share");
    fs::create_dir_all(&share).unwrap();
    fs::set_permissions(&share, fs::Permissions::from_mode(0o555)).unwrap();

    let result = world
        .engine()
        .install_file(&manifest, InstallOptions::default());
    fs::set_permissions(&share, fs::Permissions::from_mode(0o755)).unwrap();

    assert!(result.is_err());
    assert!(!world.prefix().join("bin/git-repos").exists());
}

#[test]
fn cancelled_engine_installs_nothing() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);
    let token = CancellationToken::new();
    let engine = world.engine().with_cancellation(token.clone());
    token.cancel();

    let err = engine
        .install_file(&manifest, InstallOptions::default())
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Cancelled);
    assert!(!world.prefix().exists());
}

#[test]
fn uninstall_removes_exactly_recorded_files() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);
    let engine = world.engine();
    engine
        .install_file(&manifest, InstallOptions::default())
        .unwrap();

    let foreign = world.prefix().join("bin/other-tool");
    fs::write(&foreign, b"not ours").unwrap();

    let removed = engine.uninstall("git-repos").unwrap();
    assert_eq!(removed.len(), 2);
    assert!(foreign.exists());
    assert!(!world.prefix().join("bin/git-repos").exists());
    assert!(
        !world.prefix().join("etc/bash_completion.d").exists(),
        "emptied directories are pruned"
    );
    assert!(engine.list().unwrap().is_empty());
    assert!(matches!(
        engine.uninstall("git-repos"),
        Err(CoreError::NotInstalled(_))
    ));
}

#[test]
fn upgrade_removes_superseded_files() {
    let world = World::new();
    let engine = world.engine();
    let v1 = standard_release(&world);
    engine
        .install_file(&world.manifest_for(&v1, STEPS), InstallOptions::default())
        .unwrap();

    let v2 = world.publish_release("0.4", &[("git-repos", SCRIPT)]);
    let only_bin = r#"
[[install]]
source = "git-repos"
destination = "bin"
"#;
    engine
        .install_file(&world.manifest_for(&v2, only_bin), InstallOptions::default())
        .unwrap();

    assert!(world.prefix().join("bin/git-repos").exists());
    assert!(!world.prefix().join("etc/bash_completion.d/cr.sh").exists());
    assert_eq!(engine.receipt("git-repos").unwrap().artifacts.len(), 1);
}

#[test]
fn test_requires_an_installed_package() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);
    let engine = world.engine();
    let parsed = engine.load_manifest(&manifest).unwrap();

    let err = engine
        .test(&parsed, pallet_core::DEFAULT_TEST_TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, CoreError::NotInstalled(_)));

    engine.install(&parsed, InstallOptions::default()).unwrap();
    let report = engine
        .test(&parsed, pallet_core::DEFAULT_TEST_TIMEOUT)
        .unwrap();
    assert!(report.success());
    assert_eq!(report.passed, vec!["git-repos -h"]);
}

#[test]
fn test_report_serializes_for_json_output() {
    let world = World::new();
    let archive = standard_release(&world);
    let steps = STEPS.replace(r#"["git-repos", "-h"]"#, r#"["false"]"#);
    let manifest = world.manifest_for(&archive, &steps);
    let outcome = world
        .engine()
        .install_file(&manifest, InstallOptions::default())
        .unwrap();

    let json = serde_json::to_value(outcome.tests.unwrap()).unwrap();
    assert_eq!(json["failure"]["index"], 0);
    assert_eq!(json["failure"]["command"], "false");
}

#[test]
fn receipt_write_failure_unpublishes_files() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);
    let engine = world.engine();

    let receipts = world.layout.receipts_dir();
    fs::remove_dir(&receipts).unwrap();
    fs::write(&receipts, b"not a directory").unwrap();

    let err = engine
        .install_file(&manifest, InstallOptions::default())
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Install, "{err:?}");
    assert!(!world.prefix().join("bin/git-repos").exists());
    assert!(!world.prefix().join("etc/bash_completion.d/cr.sh").exists());
    assert_eq!(open_journal_entries(&world), 0);
}

#[test]
fn failed_receipt_update_keeps_previous_install() {
    if skip_if_root() {
        return;
    }
    let world = World::new();
    let engine = world.engine();
    let v1 = standard_release(&world);
    let first = engine
        .install_file(&world.manifest_for(&v1, STEPS), InstallOptions::default())
        .unwrap();

    let v2 = world.publish_release(
        "0.4",
        &[("git-repos", "#!/bin/sh\necho v2\n"), ("cr.sh", "cr() { :; }\n")],
    );
    let receipts = world.layout.receipts_dir();
    fs::set_permissions(&receipts, fs::Permissions::from_mode(0o555)).unwrap();
    let result = engine.install_file(&world.manifest_for(&v2, STEPS), InstallOptions::default());
    fs::set_permissions(&receipts, fs::Permissions::from_mode(0o755)).unwrap();

    assert_eq!(result.unwrap_err().stage(), Stage::Install);
    assert_eq!(
        fs::read_to_string(world.prefix().join("bin/git-repos")).unwrap(),
        SCRIPT
    );
    assert_eq!(file_names(&world.prefix().join("bin")), vec!["git-repos"]);
    let kept = engine.receipt("git-repos").unwrap();
    assert_eq!(kept.archive_checksum, first.receipt.archive_checksum);
    assert_eq!(file_names(&receipts), vec!["git-repos.json"]);
}

#[test]
fn uninstall_ignores_names_outside_the_receipt_store() {
    let world = World::new();
    let engine = world.engine();
    let victim = world.dir.path().join("victim.txt");
    fs::write(&victim, b"not pallet's").unwrap();

    let planted = InstallReceipt {
        name: PackageName::new("evil"),
        version: Version::new("1.0"),
        archive_checksum: Checksum::new(DigestAlgorithm::Sha256, &"a".repeat(64)).unwrap(),
        url: "file:///srv/evil-1.0.tar.gz".to_owned(),
        installed_at: "2025-01-01T00:00:00Z".to_owned(),
        artifacts: vec![InstalledArtifact {
            step: 0,
            source: "victim.txt".to_owned(),
            destination: Destination::Bin,
            path: victim.clone(),
            mode: 0o644,
        }],
        checksum: None,
    };
    let planted_path = world.layout.state_dir().join("evil.json");
    fs::write(&planted_path, serde_json::to_string(&planted).unwrap()).unwrap();

    for name in ["../evil", "receipts/../../evil"] {
        assert!(
            matches!(engine.uninstall(name), Err(CoreError::NotInstalled(_))),
            "{name}"
        );
        assert!(matches!(engine.receipt(name), Err(CoreError::NotInstalled(_))));
    }
    assert_eq!(fs::read(&victim).unwrap(), b"not pallet's");
    assert!(planted_path.exists());
}

#[test]
fn concurrent_installs_to_one_destination_are_serialized() {
    let world = World::new();
    let archive = standard_release(&world);
    let manifest = world.manifest_for(&archive, STEPS);
    let engines: Vec<Engine> = (0..4).map(|_| world.engine()).collect();
    let options = InstallOptions {
        skip_tests: true,
        ..InstallOptions::default()
    };

    std::thread::scope(|scope| {
        let workers: Vec<_> = engines
            .into_iter()
            .map(|engine| {
                let manifest = &manifest;
                scope.spawn(move || {
                    for _ in 0..3 {
                        engine.install_file(manifest, options).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    });

    assert_eq!(
        fs::read_to_string(world.prefix().join("bin/git-repos")).unwrap(),
        SCRIPT
    );
    assert_eq!(file_names(&world.prefix().join("bin")), vec!["git-repos"]);
    assert_eq!(
        file_names(&world.prefix().join("etc/bash_completion.d")),
        vec!["cr.sh"]
    );
    assert_eq!(file_names(&world.layout.receipts_dir()), vec!["git-repos.json"]);
    assert_eq!(open_journal_entries(&world), 0);

    let receipt = world.engine().receipt("git-repos").unwrap();
    assert_eq!(receipt.artifacts.len(), 2);
}
