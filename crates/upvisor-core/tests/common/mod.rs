#![allow(dead_code)]

use std::{
    fs,
    io::{Cursor, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use sha2::{Digest, Sha256};
use tracing_subscriber::fmt::MakeWriter;
use upvisor_core::{Config, Launcher, VersionStore};
use url::Url;
use zip::write::FileOptions;

pub const DUMMYD: &str = "dummyd";
pub const AUTOD: &str = "autod";

/// A daemon home in a temp directory, with `current -> genesis` already in place.
pub struct TestHome {
    pub temp: tempfile::TempDir,
    pub config: Config,
}

impl TestHome {
    pub fn new(name: &str, genesis_script: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = Config::new(temp.path().join("home"), name);
        config.poll_interval = Duration::from_millis(20);
        config.shutdown_grace = Duration::from_millis(300);
        let home = Self { temp, config };
        write_script(&home.store().genesis_binary(), genesis_script);
        fs::create_dir_all(home.config.home.join("data")).expect("data dir");
        home
    }

    pub fn store(&self) -> VersionStore {
        VersionStore::from_config(&self.config).expect("store")
    }

    pub fn launcher(&self) -> Launcher {
        Launcher::new(self.config.clone()).expect("launcher")
    }

    pub fn signal_path(&self) -> PathBuf {
        self.store().signal_path()
    }

    pub fn install_upgrade(&self, name: &str, script: &str) {
        let binary = self.store().upgrade_binary(name).expect("upgrade path");
        write_script(&binary, script);
    }

    /// Scratch directory outside the home for artifacts and canned signals.
    pub fn scratch(&self) -> PathBuf {
        let dir = self.temp.path().join("scratch");
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    pub fn pointer_target(&self) -> PathBuf {
        fs::read_link(self.store().current_link()).expect("current link")
    }

    pub fn rotated_signals(&self) -> usize {
        fs::read_dir(self.config.home.join("data"))
            .expect("data dir")
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".bak"))
            .count()
    }
}

pub fn write_script(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, format!("#!/bin/sh\n{body}")).expect("write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
}

pub fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().unix_permissions(0o755);
    for (name, contents) in entries {
        writer.start_file(*name, options).expect("zip entry");
        writer.write_all(contents).expect("zip write");
    }
    writer.finish().expect("zip finish").into_inner()
}

/// Write `bytes` to `dir/name` and return a `file://` URL carrying its sha256.
pub fn artifact_url(dir: &Path, name: &str, bytes: &[u8]) -> Url {
    let path = dir.join(name);
    fs::write(&path, bytes).expect("write artifact");
    let mut url = Url::from_file_path(&path).expect("file url");
    url.set_query(Some(&format!("checksum=sha256:{}", sha256(bytes))));
    url
}

/// Write a canned announcement that a script can copy onto the signal path.
pub fn canned_signal(dir: &Path, file: &str, name: &str, height: u64, info: &str) -> PathBuf {
    let path = dir.join(file);
    let body = serde_json::json!({ "name": name, "height": height, "info": info });
    fs::write(&path, body.to_string()).expect("write canned signal");
    path
}

/// Collects formatted log output in memory.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().expect("log buffer").clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("log buffer").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a thread-local subscriber that records everything at debug and above.
pub fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    (value, capture.contents())
}
