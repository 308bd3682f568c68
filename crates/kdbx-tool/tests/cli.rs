use assert_cmd::Command;
use kdbx_core::{
    Credentials, Database, EntryBuilder, GroupBuilder, KdfParams, SavePolicy,
};
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn bin(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("kdbx"));
    // Keep config lookup inside the test directory
    cmd.current_dir(dir).env("XDG_CONFIG_HOME", dir).env("HOME", dir);
    cmd
}

fn fixture() -> (TempDir, PathBuf) {
    let policy = SavePolicy {
        kdf: KdfParams::Aes {
            rounds: 100,
            seed: [3u8; 32],
        },
        ..SavePolicy::kdbx4()
    };
    let mut db = Database::with_policy("Vault", policy);
    let work = db.add_group(GroupBuilder::new("Work").build()).unwrap();
    db.add_entry(
        EntryBuilder::new("GitHub")
            .username("octocat")
            .password("hunter2")
            .parent_group(work)
            .build(),
    )
    .unwrap();
    db.add_entry(EntryBuilder::new("Wifi").password("swordfish").build())
        .unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("vault.kdbx");
    std::fs::write(&path, db.save(&Credentials::from_password("pw")).unwrap()).unwrap();
    (dir, path)
}

#[test]
fn info_reads_header_without_password() {
    let (dir, path) = fixture();

    bin(dir.path())
        .arg("info")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("KDBX 4.0"))
        .stdout(predicate::str::contains("AES-KDF, 100 rounds"));
}

#[test]
fn list_prints_tree() {
    let (dir, path) = fixture();

    bin(dir.path())
        .env("KDBX_PASSWORD", "pw")
        .arg("list")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Vault/"))
        .stdout(predicate::str::contains("  Work/"))
        .stdout(predicate::str::contains("GitHub (octocat)"))
        .stdout(predicate::str::contains("Wifi"));
}

#[test]
fn wrong_password_fails() {
    let (dir, path) = fixture();

    bin(dir.path())
        .env("KDBX_PASSWORD", "not it")
        .arg("list")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid credentials"));
}

#[test]
fn show_masks_protected_values() {
    let (dir, path) = fixture();

    bin(dir.path())
        .env("KDBX_PASSWORD", "pw")
        .args(["show"])
        .arg(&path)
        .arg("GitHub")
        .assert()
        .success()
        .stdout(predicate::str::contains("UserName: octocat"))
        .stdout(predicate::str::contains("Password: ********"))
        .stdout(predicate::str::contains("hunter2").not());

    bin(dir.path())
        .env("KDBX_PASSWORD", "pw")
        .args(["show", "--reveal"])
        .arg(&path)
        .arg("GitHub")
        .assert()
        .success()
        .stdout(predicate::str::contains("Password: hunter2"))
        .stdout(predicate::str::contains("Group: Vault/Work"));
}

#[test]
fn show_unknown_entry_fails() {
    let (dir, path) = fixture();

    bin(dir.path())
        .env("KDBX_PASSWORD", "pw")
        .arg("show")
        .arg(&path)
        .arg("Nope")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no entry matches"));
}

#[test]
fn resave_converts_format_and_keeps_backup() {
    let (dir, path) = fixture();
    let before = std::fs::read(&path).unwrap();

    bin(dir.path())
        .env("KDBX_PASSWORD", "pw")
        .args(["resave", "--format", "3.1"])
        .arg(&path)
        .assert()
        .success();

    let backup = dir.path().join("vault.kdbx.bak");
    assert_eq!(std::fs::read(&backup).unwrap(), before);

    bin(dir.path())
        .arg("info")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("KDBX 3.1"));

    let db = Database::open(&std::fs::read(&path).unwrap(), &Credentials::from_password("pw"))
        .unwrap();
    let wifi = db.entries().find(|e| e.title() == "Wifi").unwrap();
    assert_eq!(
        db.field_text(&wifi.uuid, "Password").unwrap().unwrap().as_str(),
        "swordfish"
    );
}

#[test]
fn resave_to_output_leaves_input() {
    let (dir, path) = fixture();
    let before = std::fs::read(&path).unwrap();
    let output = dir.path().join("copy.kdbx");

    bin(dir.path())
        .env("KDBX_PASSWORD", "pw")
        .arg("resave")
        .arg(&path)
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert!(!dir.path().join("vault.kdbx.bak").exists());
    assert!(Database::open(&std::fs::read(&output).unwrap(), &Credentials::from_password("pw")).is_ok());
}

#[test]
fn config_file_sets_default_format() {
    let (dir, path) = fixture();
    std::fs::write(
        dir.path().join("kdbx-tool.toml"),
        "[save]\nformat = \"4.1\"\nbackup = false\n",
    )
    .unwrap();

    bin(dir.path())
        .env("KDBX_PASSWORD", "pw")
        .arg("resave")
        .arg(&path)
        .assert()
        .success();

    assert!(!dir.path().join("vault.kdbx.bak").exists());
    bin(dir.path())
        .arg("info")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("KDBX 4.1"));
}
