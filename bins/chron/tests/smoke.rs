use assert_cmd::Command;

#[test]
fn missing_chronfile_argument_exits_one() {
    Command::cargo_bin("chron")
        .unwrap()
        .env("PORT", "3000")
        .assert()
        .code(1);
}

#[test]
fn invalid_port_exits_one() {
    Command::cargo_bin("chron")
        .unwrap()
        .env("PORT", "not-a-port")
        .arg("chronfile.toml")
        .assert()
        .code(1);
}

#[test]
fn missing_port_exits_one() {
    Command::cargo_bin("chron")
        .unwrap()
        .env_remove("PORT")
        .arg("chronfile.toml")
        .assert()
        .code(1);
}

#[test]
fn nonexistent_chronfile_aborts() {
    let home = tempfile::tempdir().unwrap();
    Command::cargo_bin("chron")
        .unwrap()
        .env("PORT", "0")
        .env("HOME", home.path())
        .env_remove("XDG_DATA_HOME")
        .arg(home.path().join("missing.toml"))
        .assert()
        .code(1);
}
