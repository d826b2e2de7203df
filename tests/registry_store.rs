use anyhow::Result;

use camgrid::{CameraIdentity, FeedError, FeedRecord, FeedStore};

fn record(mac: &str, user: &str, secret: &str) -> FeedRecord {
    FeedRecord {
        hardware_address: mac.to_string(),
        user_name: user.to_string(),
        secret: secret.to_string(),
    }
}

#[test]
fn missing_store_loads_empty() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FeedStore::new(dir.path().join("cameras.dat"));
    assert!(store.load()?.is_empty());
    Ok(())
}

#[test]
fn corrupt_store_is_reported() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cameras.dat");
    std::fs::write(&path, "[{\"hardwareAddress\": ")?;
    let err = FeedStore::new(&path).load().unwrap_err();
    assert!(matches!(err, FeedError::ConfigLoadCorrupt { .. }));
    Ok(())
}

#[test]
fn unusable_hardware_address_is_corrupt() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cameras.dat");
    std::fs::write(
        &path,
        r#"[{"hardwareAddress": "not-a-mac", "userName": "admin", "secret": "pw"}]"#,
    )?;
    let err = FeedStore::new(&path).load().unwrap_err();
    assert!(matches!(err, FeedError::ConfigLoadCorrupt { .. }));
    Ok(())
}

#[test]
fn saves_raw_credentials_and_reads_them_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FeedStore::new(dir.path().join("nested").join("cameras.dat"));
    let records = vec![
        record("aa:bb:cc:dd:ee:ff", "admin", "p@ss:w/rd"),
        record("00:11:22:33:44:55", "viewer", "contraseña"),
    ];
    store.save(&records)?;

    let text = std::fs::read_to_string(store.path())?;
    assert!(text.contains("\n    {\n        \"hardwareAddress\""));
    assert!(text.contains("p@ss:w/rd"));
    assert!(text.contains("contraseña"));
    assert!(!text.contains("%40"));

    assert_eq!(store.load()?, records);
    Ok(())
}

#[test]
fn legacy_keys_and_encoded_secrets_are_accepted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cameras.dat");
    std::fs::write(
        &path,
        r#"[
    {
        "mac": "AA-BB-CC-DD-EE-FF",
        "usuario": "admin",
        "password": "p%40ss%3Aw%2Frd"
    },
    {
        "hardwareAddress": "00:11:22:33:44:55",
        "userName": "ops%20team",
        "secret": "100%"
    }
]"#,
    )?;
    let store = FeedStore::new(&path);
    let records = store.load()?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].secret, "p@ss:w/rd");
    // Current-layout values are never decoded.
    assert_eq!(records[1].user_name, "ops%20team");
    assert_eq!(records[1].secret, "100%");

    let identity = records[0].identity()?;
    assert_eq!(identity, CameraIdentity::parse("aa:bb:cc:dd:ee:ff", "admin", "p@ss:w/rd")?);

    // Re-saving upgrades to the current keys and raw values.
    store.save(&records)?;
    let text = std::fs::read_to_string(&path)?;
    assert!(text.contains("\"hardwareAddress\": \"AA-BB-CC-DD-EE-FF\""));
    assert!(text.contains("\"secret\": \"p@ss:w/rd\""));
    assert!(!text.contains("usuario"));
    Ok(())
}

#[test]
fn literal_percent_sequences_survive_save_and_load() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FeedStore::new(dir.path().join("cameras.dat"));
    let records = vec![
        record("aa:bb:cc:dd:ee:ff", "admin", "50%41off"),
        record("00:11:22:33:44:55", "ops%20team", "100%"),
    ];
    store.save(&records)?;
    let loaded = store.load()?;
    assert_eq!(loaded, records);
    assert_eq!(loaded[0].secret, "50%41off");

    // A second pass must not decode again.
    store.save(&loaded)?;
    assert_eq!(store.load()?, records);
    Ok(())
}
