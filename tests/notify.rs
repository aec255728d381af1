use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use iomux::{notify, FileNotifier};

mod util;

use util::start_handler;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("iomux-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn reports_created_files() {
    let handler = start_handler();
    let dir = scratch_dir("create");

    let notifier = FileNotifier::new(&handler.handle()).unwrap();
    let (tx, rx) = mpsc::channel();
    notifier
        .watch(&dir, notify::CREATE, move |event| {
            tx.send((
                event.path.clone(),
                event.name.clone(),
                event.mask & notify::CREATE != 0,
            ))
            .unwrap();
        })
        .unwrap();

    fs::write(dir.join("spawned.txt"), b"x").unwrap();

    let (path, name, was_create) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(path, dir);
    assert_eq!(name.unwrap(), "spawned.txt");
    assert!(was_create);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unwatch_silences_the_path() {
    let handler = start_handler();
    let dir = scratch_dir("unwatch");

    let notifier = FileNotifier::new(&handler.handle()).unwrap();
    let (tx, rx) = mpsc::channel();
    let wd = notifier
        .watch(&dir, notify::CREATE, move |event| {
            tx.send(event.name.clone()).unwrap();
        })
        .unwrap();

    fs::write(dir.join("seen.txt"), b"x").unwrap();
    assert!(rx.recv_timeout(RECV_TIMEOUT).is_ok());

    notifier.unwatch(wd).unwrap();
    fs::write(dir.join("unseen.txt"), b"x").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn reports_modifications() {
    let handler = start_handler();
    let dir = scratch_dir("modify");
    let file = dir.join("target.txt");
    fs::write(&file, b"before").unwrap();

    let notifier = FileNotifier::new(&handler.handle()).unwrap();
    let (tx, rx) = mpsc::channel();
    notifier
        .watch(&file, notify::MODIFY, move |event| {
            tx.send(event.mask).unwrap();
        })
        .unwrap();

    fs::write(&file, b"after").unwrap();

    let mask = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(mask & notify::MODIFY != 0);

    let _ = fs::remove_dir_all(&dir);
}
