use digit_transfer::logging::install_logger;

#[test]
fn logger_installs_once_and_writes_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.log");

    assert!(install_logger(Some(&path)));
    log::info!("first epoch done");
    assert!(!install_logger(None));

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("first epoch done"));
}
