#![cfg(unix)]
//! Archive, volume store and upload through the public controller API.

use algtest_supervisor::config::TestProfile;
use algtest_supervisor::results::archive::{archive_path, create_archive};
use algtest_supervisor::results::distribute::README_FILE_NAME;
use algtest_supervisor::{AlgtestController, DeliveryError, LifecycleState, SupervisorConfig, SystemImpl};
use mockito::Matcher;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TOOL: &str = r#"
if [ "$1" = "--version" ]; then echo "tpm2_algtest 0.6.1"; exit 0; fi
category="$1"
shift
outdir=""
while [ $# -gt 0 ]; do
    case "$1" in
        --outdir) outdir="$2"; shift 2 ;;
        *) shift ;;
    esac
done
if [ "$category" = "quicktest" ]; then
    printf 'TPM2_PT_MANUFACTURER: 0x494E5443\nTPM2_PT_VENDOR_STRING_1: 0x534C4239\nTPM2_PT_FIRMWARE_VERSION_1: 0x00070055\nTPM2_PT_FIRMWARE_VERSION_2: 0x0011CB00\n' > "$outdir/Quicktest_properties-fixed.txt"
fi
exit 0
"#;

fn finished_run(work_dir: &Path, endpoint: &str) -> AlgtestController {
    let script = work_dir.join("tool.sh");
    std::fs::write(&script, TOOL).unwrap();

    let mut config = SupervisorConfig::default();
    config.tool_path = "sh".to_string();
    config.tool_args = vec![script.to_string_lossy().into_owned()];
    config.work_dir = work_dir.to_path_buf();
    config.connectivity_url = "http://127.0.0.1:1/".to_string();
    config.connectivity_timeout_secs = 1;
    config.idle_recheck_ms = 10;
    config.result_mount_point = work_dir.join("usb");
    config.upload_endpoint = endpoint.to_string();

    let mut ctrl = AlgtestController::new(config, Arc::new(SystemImpl::new()));
    ctrl.start(TestProfile::Basic.default_stages(), Some("lab@example.org".to_string()))
        .unwrap();
    assert_eq!(ctrl.join(), Some(LifecycleState::Success));
    ctrl
}

fn entry_names(zip_path: &Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(File::open(zip_path).unwrap()).unwrap();
    archive.file_names().map(|n| n.to_string()).collect()
}

#[test]
fn test_archive_preserves_tree() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().join("algtest_result_x");
    std::fs::create_dir_all(run_dir.join("detail/nested")).unwrap();
    std::fs::write(run_dir.join("detail/nested/a.csv"), "a;b\n").unwrap();
    std::fs::write(run_dir.join("top.txt"), "top").unwrap();

    let zip_path = create_archive(&run_dir).unwrap();
    assert_eq!(zip_path, archive_path(&run_dir));
    assert_eq!(zip_path, dir.path().join("algtest_result_x.zip"));

    let names = entry_names(&zip_path);
    assert!(names.iter().any(|n| n == "detail/nested/a.csv"));
    assert!(names.iter().any(|n| n == "top.txt"));

    let mut archive = zip::ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
    let mut content = String::new();
    archive
        .by_name("detail/nested/a.csv")
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "a;b\n");
}

#[test]
fn test_store_to_existing_mount_point() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("usb")).unwrap();
    let ctrl = finished_run(dir.path(), "http://127.0.0.1:1/");

    let stored: PathBuf = ctrl.store_to_volume().unwrap();
    let archive = ctrl.archive_path().unwrap();
    assert_eq!(stored.parent(), Some(dir.path().join("usb").as_path()));
    assert_eq!(stored.file_name(), archive.file_name());
    assert_eq!(std::fs::read(&stored).unwrap(), std::fs::read(&archive).unwrap());
    assert!(dir.path().join("usb").join(README_FILE_NAME).is_file());
    assert!(ctrl.get_log(0).contains("Copied to USB. File name: algtest_result_"));
    assert_eq!(ctrl.get_state(), LifecycleState::Success);
}

#[test]
fn test_upload_success_sets_status() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/dok/depository_in")
        .match_query(Matcher::UrlEncoded("vybos_vzorek".into(), "4085".into()))
        .with_status(200)
        .with_body(r#"{"uspech": 1}"#)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let endpoint = format!("{}/dok/depository_in", server.url());
    let ctrl = finished_run(dir.path(), &endpoint);

    ctrl.upload().unwrap();
    mock.assert();
    assert_eq!(ctrl.get_status(), "Results uploaded successfully.");
    assert_eq!(ctrl.get_state(), LifecycleState::Success);
}

#[test]
fn test_rejected_upload_keeps_lifecycle_state() {
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("POST", "/dok/depository_in")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"uspech": 0}"#)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let endpoint = format!("{}/dok/depository_in", server.url());
    let ctrl = finished_run(dir.path(), &endpoint);

    assert!(matches!(ctrl.upload(), Err(DeliveryError::UploadRejected)));
    assert_eq!(ctrl.get_state(), LifecycleState::Success);
    assert_eq!(ctrl.get_status(), "Results upload failed.");
    assert!(ctrl.get_log(0).contains("Results upload failed."));
}

#[test]
fn test_unreachable_endpoint_is_upload_failure() {
    let dir = tempfile::tempdir().unwrap();
    let ctrl = finished_run(dir.path(), "http://127.0.0.1:1/dok/depository_in");

    assert!(matches!(ctrl.upload(), Err(DeliveryError::UploadFailed(_))));
    assert_eq!(ctrl.get_state(), LifecycleState::Success);
    assert_eq!(ctrl.get_status(), "Results upload failed.");
}
