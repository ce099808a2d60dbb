use std::{
    fs,
    io::{Cursor, Write},
    panic,
    path::Path,
    time::Duration,
};

use anyhow::Result;
use httptest::{matchers::*, responders::*, Expectation, Server};
use sha2::{Digest, Sha256};
use upvisor_domain::PlatformKey;
use upvisor_store::{DownloadError, Downloader, MAX_REFERRAL_HOPS};
use url::Url;
use zip::write::FileOptions;

const BINARY: &str = "autod";

fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().unix_permissions(0o755);
    for (name, contents) in entries {
        writer.start_file(*name, options).expect("zip entry");
        writer.write_all(contents).expect("zip write");
    }
    writer.finish().expect("zip finish").into_inner()
}

fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *contents)
            .expect("tar entry");
    }
    builder
        .into_inner()
        .expect("tar finish")
        .finish()
        .expect("gzip finish")
}

/// Write `bytes` under `dir` and return a checksummed `file://` URL for it.
fn file_url(dir: &Path, name: &str, bytes: &[u8]) -> Url {
    let path = dir.join(name);
    fs::write(&path, bytes).expect("write artifact");
    let mut url = Url::from_file_path(&path).expect("file url");
    url.set_query(Some(&format!("checksum=sha256:{}", sha256(bytes))));
    url
}

fn referral(name: &str, info: &str) -> Vec<u8> {
    serde_json::json!({ "name": name, "info": info })
        .to_string()
        .into_bytes()
}

fn downloader() -> Downloader {
    Downloader::new(BINARY, Duration::from_secs(10)).expect("downloader")
}

fn start_server() -> Option<Server> {
    match panic::catch_unwind(Server::run) {
        Ok(server) => Some(server),
        Err(_) => {
            eprintln!("skipping http download test (httptest server unavailable)");
            None
        }
    }
}

#[test]
fn raw_binary_over_http_is_installed_executable() -> Result<()> {
    let Some(server) = start_server() else {
        return Ok(());
    };
    let body = b"#!/bin/sh\necho raw\n".to_vec();
    server.expect(
        Expectation::matching(request::method_path("GET", "/autod"))
            .respond_with(status_code(200).body(body.clone())),
    );
    let url = Url::parse(&format!(
        "{}?checksum=sha256:{}",
        server.url_str("/autod"),
        sha256(&body)
    ))?;

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain2");
    let installed = downloader().materialize(&url, &dest, &PlatformKey::current())?;

    assert_eq!(installed.binary, dest.join("bin").join(BINARY));
    assert_eq!(fs::read(&installed.binary)?, body);
    assert_eq!(installed.referrals, 0);
    assert_eq!(installed.bytes_fetched, body.len() as u64);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&installed.binary)?.permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "binary must be executable");
    }
    Ok(())
}

#[test]
fn http_error_status_fails_without_installing() -> Result<()> {
    let Some(server) = start_server() else {
        return Ok(());
    };
    server.expect(
        Expectation::matching(request::method_path("GET", "/missing.zip"))
            .respond_with(status_code(404)),
    );
    let url = Url::parse(&format!(
        "{}?checksum=sha256:{}",
        server.url_str("/missing.zip"),
        sha256(b"")
    ))?;
    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain2");

    let err = downloader()
        .materialize(&url, &dest, &PlatformKey::current())
        .expect_err("404 must fail");
    assert!(matches!(err, DownloadError::Fetch { .. }), "{err}");
    assert!(!dest.exists());
    Ok(())
}

#[test]
fn zip_with_bin_directory_is_expanded() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let archive = zip_bytes(&[("bin/autod", b"#!/bin/sh\necho zipped\n"), ("README", b"hi")]);
    let url = file_url(artifacts.path(), "autod.zip", &archive);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain2");
    let installed = downloader().materialize(&url, &dest, &PlatformKey::current())?;

    assert_eq!(fs::read(&installed.binary)?, b"#!/bin/sh\necho zipped\n");
    assert!(dest.join("README").is_file());
    Ok(())
}

#[test]
fn flat_zip_places_binary_under_bin() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let archive = zip_bytes(&[("autod", b"flat")]);
    let url = file_url(artifacts.path(), "autod.zip", &archive);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain2");
    downloader().materialize(&url, &dest, &PlatformKey::current())?;

    assert_eq!(fs::read(dest.join("bin").join(BINARY))?, b"flat");
    assert!(!dest.join(BINARY).exists());
    Ok(())
}

#[test]
fn tar_gz_is_expanded() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let archive = tar_gz_bytes(&[("bin/autod", b"tarred")]);
    let url = file_url(artifacts.path(), "autod.tar.gz", &archive);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain2");
    downloader().materialize(&url, &dest, &PlatformKey::current())?;

    assert_eq!(fs::read(dest.join("bin").join(BINARY))?, b"tarred");
    Ok(())
}

#[test]
fn missing_checksum_is_refused() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let mut url = file_url(artifacts.path(), "autod", b"binary");
    url.set_query(None);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain2");
    let err = downloader()
        .materialize(&url, &dest, &PlatformKey::current())
        .expect_err("unverified download must fail");

    assert!(matches!(err, DownloadError::MissingChecksum { .. }), "{err}");
    assert!(!dest.exists());
    Ok(())
}

#[test]
fn checksum_mismatch_leaves_destination_untouched() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let mut url = file_url(artifacts.path(), "autod", b"tampered");
    url.set_query(Some(&format!("checksum=sha256:{}", sha256(b"expected"))));

    let home = tempfile::tempdir()?;
    let upgrades = home.path().join("upgrades");
    let dest = upgrades.join("chain2");
    let err = downloader()
        .materialize(&url, &dest, &PlatformKey::current())
        .expect_err("mismatch must fail");

    match err {
        DownloadError::ChecksumMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, format!("sha256:{}", sha256(b"expected")));
            assert_eq!(actual, format!("sha256:{}", sha256(b"tampered")));
        }
        other => panic!("expected ChecksumMismatch, got {other}"),
    }
    assert!(!dest.exists());
    assert_eq!(
        fs::read_dir(&upgrades)?.count(),
        0,
        "no staging leftovers expected"
    );
    Ok(())
}

#[test]
fn existing_install_survives_failed_download() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let mut url = file_url(artifacts.path(), "autod", b"tampered");
    url.set_query(Some(&format!("checksum=sha256:{}", sha256(b"expected"))));

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain2");
    fs::create_dir_all(dest.join("bin"))?;
    fs::write(dest.join("bin").join(BINARY), b"previous")?;

    assert!(downloader()
        .materialize(&url, &dest, &PlatformKey::current())
        .is_err());
    assert_eq!(fs::read(dest.join("bin").join(BINARY))?, b"previous");
    Ok(())
}

#[test]
fn referral_chain_is_followed() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let final_zip = zip_bytes(&[("bin/autod", b"Chain 3 binary")]);
    let final_url = file_url(artifacts.path(), "zip_directory.zip", &final_zip);
    let ref_zip = zip_bytes(&[(
        "upgrade-info.json",
        &referral("chain3", final_url.as_str()),
    )]);
    let ref_url = file_url(artifacts.path(), "ref_zipped.zip", &ref_zip);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain3");
    let installed = downloader().materialize(&ref_url, &dest, &PlatformKey::current())?;

    assert_eq!(installed.referrals, 1);
    assert_eq!(fs::read(&installed.binary)?, b"Chain 3 binary");
    assert!(!dest.join("upgrade-info.json").exists());
    Ok(())
}

#[test]
fn referral_with_binaries_map_uses_platform_entry() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let final_url = file_url(artifacts.path(), "linux.bin", b"platform binary");
    let platform = PlatformKey::new("linux", "amd64");
    let info = serde_json::json!({
        "binaries": {
            "darwin/arm64": "https://example.invalid/wrong",
            "linux/amd64": final_url.as_str(),
        }
    })
    .to_string();
    let ref_zip = zip_bytes(&[("bin/upgrade-info.json", &referral("chain3", &info))]);
    let ref_url = file_url(artifacts.path(), "ref.zip", &ref_zip);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain3");
    downloader().materialize(&ref_url, &dest, &platform)?;

    assert_eq!(fs::read(dest.join("bin").join(BINARY))?, b"platform binary");
    Ok(())
}

#[test]
fn referral_without_platform_entry_is_unsupported() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let info = r#"{"binaries":{"darwin/arm64":"https://example.invalid/wrong"}}"#;
    let ref_zip = zip_bytes(&[("upgrade-info.json", &referral("chain3", info))]);
    let ref_url = file_url(artifacts.path(), "ref.zip", &ref_zip);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain3");
    let err = downloader()
        .materialize(&ref_url, &dest, &PlatformKey::new("linux", "amd64"))
        .expect_err("no linux entry");

    assert!(
        matches!(err, DownloadError::UnsupportedPlatform { .. }),
        "{err}"
    );
    assert!(!dest.exists());
    Ok(())
}

/// Build a chain of `hops` referrals ending at a real binary and return its head.
fn referral_chain(dir: &Path, hops: usize) -> Url {
    let mut next = file_url(dir, "final.bin", b"end of chain");
    for hop in 0..hops {
        let archive = zip_bytes(&[("upgrade-info.json", &referral("chain", next.as_str()))]);
        next = file_url(dir, &format!("ref-{hop}.zip"), &archive);
    }
    next
}

#[test]
fn referral_chain_within_bound_succeeds() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let head = referral_chain(artifacts.path(), MAX_REFERRAL_HOPS);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain");
    let installed = downloader().materialize(&head, &dest, &PlatformKey::current())?;

    assert_eq!(installed.referrals, MAX_REFERRAL_HOPS);
    assert_eq!(fs::read(&installed.binary)?, b"end of chain");
    Ok(())
}

#[test]
fn referral_chain_past_bound_is_a_loop() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let head = referral_chain(artifacts.path(), MAX_REFERRAL_HOPS + 1);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain");
    let err = downloader()
        .materialize(&head, &dest, &PlatformKey::current())
        .expect_err("chain too long");

    assert!(
        matches!(err, DownloadError::ReferralLoop { limit, .. } if limit == MAX_REFERRAL_HOPS),
        "{err}"
    );
    assert!(!dest.exists());
    Ok(())
}

#[test]
fn archive_without_binary_is_rejected() -> Result<()> {
    let artifacts = tempfile::tempdir()?;
    let archive = zip_bytes(&[("docs/README", b"no binary here")]);
    let url = file_url(artifacts.path(), "empty.zip", &archive);

    let home = tempfile::tempdir()?;
    let dest = home.path().join("upgrades").join("chain2");
    let err = downloader()
        .materialize(&url, &dest, &PlatformKey::current())
        .expect_err("missing binary");

    assert!(matches!(err, DownloadError::MissingBinary { .. }), "{err}");
    assert!(!dest.exists());
    Ok(())
}
