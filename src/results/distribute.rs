//! Delivery of the result archive: copy to the result volume, or upload to the depository.
//!
//! Both actions are independent and operator-triggered. A failure is returned
//! to the caller as a `DeliveryError` and never touches the run outcome.

use crate::config::SupervisorConfig;
use crate::error::DeliveryError;
use crate::system::SystemOps;
use std::path::{Path, PathBuf};

pub const README_FILE_NAME: &str = "README_AND_HOW_TO_UPLOAD.txt";

/// Plain-text instructions stored next to the archive on the result volume.
pub const UPLOAD_INSTRUCTIONS: &str = "\
TPM algorithm test results
==========================

This volume holds one archive per test run (algtest_result_<id>.zip).

How to upload:
1. Unplug the USB disk and restart into your usual system.
2. Plug the USB disk in again and open the ALGTEST_RES volume.
3. Upload every algtest_result_<id>.zip file at https://is.muni.cz/go/tpm

What the archive contains:
- TPM manufacturer, vendor string and firmware version
- TPM properties, supported algorithms, commands and curves (Quicktest_*.txt)
- Performance measurements of cryptographic operations (Perf_*.csv)
- Transient keys generated by the TPM during the test (Keygen_*.csv)
- Output of the TPM random number generator
- Summary files under results/ and performance/

The archive holds no personal data and no long-term keys of the TPM.
";

/// Copy the archive and the instructions onto the result volume, mounting it first if needed.
///
/// Returns the path of the copied archive.
pub fn store_to_volume(
    system: &dyn SystemOps,
    archive: &Path,
    mount_point: &Path,
    volume_label: &str,
) -> Result<PathBuf, DeliveryError> {
    if !archive.is_file() {
        return Err(DeliveryError::NoArchive);
    }

    if !system.mount_point_present(mount_point) {
        match system.mount_by_label(volume_label, mount_point) {
            Ok(()) => log::info!("[Deliver] Mounted {} at {}", volume_label, mount_point.display()),
            Err(e) => log::warn!("[Deliver] Mounting {} failed: {}", volume_label, e),
        }
    }
    if !system.mount_point_present(mount_point) {
        return Err(DeliveryError::VolumeUnavailable(
            mount_point.display().to_string(),
        ));
    }

    let file_name = archive
        .file_name()
        .ok_or_else(|| DeliveryError::CopyFailed(archive.display().to_string()))?;
    let target = mount_point.join(file_name);

    std::fs::copy(archive, &target)
        .map_err(|e| DeliveryError::CopyFailed(format!("{}: {}", target.display(), e)))?;
    std::fs::write(mount_point.join(README_FILE_NAME), UPLOAD_INSTRUCTIONS)
        .map_err(|e| DeliveryError::CopyFailed(format!("{}: {}", README_FILE_NAME, e)))?;
    system.sync();

    log::info!("[Deliver] Copied to USB. File name: {}", target.display());
    Ok(target)
}

/// Whether a depository response reports success (`"uspech": 1`).
pub fn is_success_response(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("uspech").and_then(|s| s.as_i64()))
        == Some(1)
}

/// Multipart upload client for the depository endpoint.
#[derive(Debug, Clone)]
pub struct Uploader {
    endpoint: String,
    depository_id: String,
    user_agent: String,
}

impl Uploader {
    pub fn new(endpoint: &str, depository_id: u32, user_agent: &str) -> Self {
        Uploader {
            endpoint: endpoint.to_string(),
            depository_id: depository_id.to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Uploader::new(
            &config.upload_endpoint,
            config.depository_id,
            &config.user_agent,
        )
    }

    /// Upload `archive`. Any transport error or a missing/false sentinel is a failure.
    ///
    /// Blocking: call from a worker thread or `spawn_blocking`.
    pub fn upload(&self, archive: &Path, description: &str, message: &str) -> Result<(), DeliveryError> {
        if !archive.is_file() {
            return Err(DeliveryError::NoArchive);
        }
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let form = reqwest::blocking::multipart::Form::new()
            .text("quco", self.depository_id.clone())
            .text("vlsozav", "najax")
            .text("ajax-upload", "ajax")
            .file("FILE_1", archive)
            .map_err(|e| DeliveryError::UploadFailed(e.to_string()))?
            .text("A_NAZEV_1", file_name.clone())
            .text("A_POPIS_1", description.to_string())
            .text("TEXT_MAILU", message.to_string());

        let client = reqwest::blocking::Client::builder()
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| DeliveryError::UploadFailed(e.to_string()))?;

        log::info!("[Deliver] Uploading {} to {}", file_name, self.endpoint);
        let response = client
            .post(&self.endpoint)
            .query(&[
                ("vybos_vzorek_last", ""),
                ("vybos_vzorek", self.depository_id.as_str()),
                ("vybos_hledej", "Vyhledat osobu"),
            ])
            .multipart(form)
            .send()
            .map_err(|e| DeliveryError::UploadFailed(e.to_string()))?;

        let body = response
            .text()
            .map_err(|e| DeliveryError::UploadFailed(e.to_string()))?;
        if is_success_response(&body) {
            log::info!("[Deliver] Results uploaded successfully.");
            Ok(())
        } else {
            log::warn!("[Deliver] Depository rejected upload: {}", body.trim());
            Err(DeliveryError::UploadRejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSystem {
        mounted: AtomicBool,
        can_mount: bool,
        syncs: AtomicUsize,
        mount_point: PathBuf,
    }

    impl FakeSystem {
        fn new(mount_point: &Path, mounted: bool, can_mount: bool) -> Self {
            if mounted {
                std::fs::create_dir_all(mount_point).unwrap();
            }
            FakeSystem {
                mounted: AtomicBool::new(mounted),
                can_mount,
                syncs: AtomicUsize::new(0),
                mount_point: mount_point.to_path_buf(),
            }
        }
    }

    impl SystemOps for FakeSystem {
        fn mount_point_present(&self, _mount_point: &Path) -> bool {
            self.mounted.load(Ordering::SeqCst)
        }

        fn mount_by_label(&self, _label: &str, _mount_point: &Path) -> Result<(), String> {
            if self.can_mount {
                std::fs::create_dir_all(&self.mount_point).map_err(|e| e.to_string())?;
                self.mounted.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err("no such device".to_string())
            }
        }

        fn sync(&self) {
            self.syncs.fetch_add(1, Ordering::SeqCst);
        }

        fn power_off(&self) -> Result<(), String> {
            Ok(())
        }
    }

    fn archive_in(dir: &Path) -> PathBuf {
        let archive = dir.join("algtest_result_1.zip");
        std::fs::write(&archive, b"PK\x05\x06zip").unwrap();
        archive
    }

    #[test]
    fn test_store_mounts_then_copies() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_in(dir.path());
        let mount = dir.path().join("mnt");
        let system = FakeSystem::new(&mount, false, true);

        let copied = store_to_volume(&system, &archive, &mount, "ALGTEST_RES").unwrap();
        assert_eq!(std::fs::read(&copied).unwrap(), b"PK\x05\x06zip");
        let readme = std::fs::read_to_string(mount.join(README_FILE_NAME)).unwrap();
        assert_eq!(readme, UPLOAD_INSTRUCTIONS);
        assert_eq!(system.syncs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_store_without_volume() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_in(dir.path());
        let mount = dir.path().join("mnt");
        let system = FakeSystem::new(&mount, false, false);

        let err = store_to_volume(&system, &archive, &mount, "ALGTEST_RES").unwrap_err();
        assert!(matches!(err, DeliveryError::VolumeUnavailable(_)));
        assert_eq!(system.syncs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_store_without_archive() {
        let dir = tempfile::tempdir().unwrap();
        let system = FakeSystem::new(dir.path(), true, false);
        let err = store_to_volume(&system, &dir.path().join("none.zip"), dir.path(), "X").unwrap_err();
        assert!(matches!(err, DeliveryError::NoArchive));
    }

    #[test]
    fn test_success_sentinel() {
        assert!(is_success_response(r#"{"uspech": 1}"#));
        assert!(!is_success_response(r#"{"uspech": 0}"#));
        assert!(!is_success_response(r#"{"chyba": "x"}"#));
        assert!(!is_success_response("<html>"));
    }

    #[test]
    fn test_upload_success() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_in(dir.path());
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/dok/depository_in")
            .match_query(Matcher::UrlEncoded("vybos_vzorek".into(), "4085".into()))
            .match_header("user-agent", "tpm2-algtest-ui")
            .match_body(Matcher::Regex("algtest_result_1.zip".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"uspech":1}"#)
            .create();

        let uploader = Uploader::new(
            &format!("{}/dok/depository_in", server.url()),
            4085,
            "tpm2-algtest-ui",
        );
        uploader.upload(&archive, "contact: lab", "").unwrap();
        mock.assert();
    }

    #[test]
    fn test_upload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_in(dir.path());
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/dok/depository_in")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"uspech":0}"#)
            .create();

        let uploader = Uploader::new(&format!("{}/dok/depository_in", server.url()), 4085, "ua");
        assert!(matches!(
            uploader.upload(&archive, "", ""),
            Err(DeliveryError::UploadRejected)
        ));
    }

    #[test]
    fn test_upload_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_in(dir.path());
        let uploader = Uploader::new("http://127.0.0.1:1/dok/depository_in", 4085, "ua");
        assert!(matches!(
            uploader.upload(&archive, "", ""),
            Err(DeliveryError::UploadFailed(_))
        ));
    }
}
