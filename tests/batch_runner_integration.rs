#![cfg(unix)]
//! End-to-end batch runs against a fake `tpm2_algtest` shell script.

use algtest_supervisor::config::TestProfile;
use algtest_supervisor::{AlgtestController, Connectivity, LifecycleState, SupervisorConfig, SystemImpl};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROPERTIES: &str = "\
TPM2_PT_FAMILY_INDICATOR:
  raw: 0x322E3000
  value: \"2.0\"
TPM2_PT_MANUFACTURER: 0x494E5443
TPM2_PT_VENDOR_STRING_1: 0x534C4239
TPM2_PT_VENDOR_STRING_2: 0x36373000
TPM2_PT_FIRMWARE_VERSION_1: 0x00070055
TPM2_PT_FIRMWARE_VERSION_2: 0x0011CB00
";

const STEM: &str = "INTC_SLB9670_7.85.17.51968";

/// Write a fake tool. `rng_body` is the shell snippet run for the `rng` category.
fn fake_tool(dir: &Path, version: &str, rng_body: &str) -> PathBuf {
    let script = format!(
        r#"
if [ "$1" = "--version" ]; then
    echo "tpm2_algtest {version}"
    exit 0
fi
if [ "$1" = "-s" ]; then
    shift
    echo "dialect legacy"
fi
category="$1"
shift
outdir=""
while [ $# -gt 0 ]; do
    case "$1" in
        --outdir) outdir="$2"; shift 2 ;;
        *) shift ;;
    esac
done
case "$category" in
    quicktest)
        cat > "$outdir/Quicktest_properties-fixed.txt" <<'EOF'
{properties}EOF
        printf 'TPM2_ALG_RSA:\n  asymmetric: 1\n' > "$outdir/Quicktest_algorithms.txt"
        ;;
    keygen)
        echo "+++Generating RSA keys+++"
        printf '50%%\n'
        printf 'id;n;e;p\n1;CA1;11;3D\n2;CA1;11;7\n' > "$outdir/Keygen_RSA_1024_keys.csv"
        printf '100%%\n'
        ;;
    perf)
        echo "measuring Sign" 1>&2
        printf 'duration,returncode\n0.001,0000\n0.002,0000\n0.0,0001\n' > "$outdir/Perf_Sign:RSA_2048_RSASSA.csv"
        printf '40%%\n'
        printf '100%%\n'
        ;;
    rng)
        {rng_body}
        ;;
esac
exit 0
"#,
        version = version,
        properties = PROPERTIES,
        rng_body = rng_body
    );
    let path = dir.join("fake_tpm2_algtest.sh");
    std::fs::write(&path, script).unwrap();
    path
}

fn config_for(work_dir: &Path, script: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    config.tool_path = "sh".to_string();
    config.tool_args = vec![script.to_string_lossy().into_owned()];
    config.work_dir = work_dir.to_path_buf();
    config.connectivity_url = "http://127.0.0.1:1/".to_string();
    config.connectivity_timeout_secs = 1;
    config.idle_recheck_ms = 10;
    config.result_mount_point = work_dir.join("usb");
    config
}

fn controller(config: SupervisorConfig) -> AlgtestController {
    AlgtestController::new(config, Arc::new(SystemImpl::new()))
}

fn read_entry(zip_path: &Path, name: &str) -> String {
    let mut archive = zip::ZipArchive::new(File::open(zip_path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    content
}

#[test]
fn test_successful_batch_produces_archive() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_tool(dir.path(), "0.6.1", "echo 'collecting random bytes'");
    let mut ctrl = controller(config_for(dir.path(), &script));

    ctrl.start(TestProfile::Basic.default_stages(), Some("lab@example.org".to_string()))
        .unwrap();
    assert_eq!(ctrl.join(), Some(LifecycleState::Success));

    assert!(ctrl.is_finished());
    assert_eq!(ctrl.get_state(), LifecycleState::Success);
    assert_eq!(ctrl.get_percentage(), 100);
    assert_eq!(ctrl.get_status(), "All tests finished successfully.");
    assert_eq!(ctrl.get_connectivity(), Connectivity::Offline);

    let statuses = ctrl.get_statuses().join("\n");
    assert!(statuses.contains("Running performance (2/3)"));
    assert!(statuses.contains("Generating RSA keys"));

    let log = ctrl.get_log(0);
    assert!(log.contains("measuring Sign"));
    assert!(log.contains("collecting random bytes"));
    assert!(log.contains("Keygen_RSA_1024_keys.csv: recovered 1 keys, 1 failed"));
    assert!(log.contains("row 2 (id 2) skipped"));
    assert!(!log.contains("dialect legacy"));

    let zip_path = ctrl.archive_path().expect("archive should exist");
    let keys = read_entry(&zip_path, "detail/Keygen_RSA_1024_keys.csv");
    assert!(keys.starts_with("id;n;e;p;q;d\n1;CA1;11;3D;35;AC1\n"));

    let support = read_entry(&zip_path, &format!("results/{}.csv", STEM));
    assert!(support.contains("TPM2_ALG_RSA;asymmetric=1"));
    let performance = read_entry(&zip_path, &format!("performance/{}.csv", STEM));
    assert!(performance.contains("Key parameters:;RSA 2048;Scheme:;RSASSA"));
    assert!(performance.contains("successful:;2;failed:;1;error:;0001"));
}

#[test]
fn test_legacy_dialect_for_old_tool() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_tool(dir.path(), "0.5.2", "true");
    let mut ctrl = controller(config_for(dir.path(), &script));

    ctrl.start(TestProfile::Basic.default_stages(), None).unwrap();
    assert_eq!(ctrl.join(), Some(LifecycleState::Success));
    assert!(ctrl.get_log(0).contains("dialect legacy"));
}

#[test]
fn test_failed_stage_still_formats_results() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_tool(dir.path(), "0.6.1", "echo 'device error'; exit 3");
    let mut ctrl = controller(config_for(dir.path(), &script));

    ctrl.start(TestProfile::Basic.default_stages(), None).unwrap();
    assert_eq!(ctrl.join(), Some(LifecycleState::Failed));
    assert_eq!(ctrl.get_state(), LifecycleState::Failed);
    assert!(ctrl.get_log(0).contains("exit code 3"));
    assert!(ctrl.get_percentage() < 100);

    let zip_path = ctrl.archive_path().expect("partial results are archived");
    let performance = read_entry(&zip_path, &format!("performance/{}.csv", STEM));
    assert!(performance.contains("TPM2_Sign"));
}

#[test]
fn test_stop_yields_stopped_not_failed() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_tool(dir.path(), "0.6.1", "echo 'rng started'; exec sleep 30");
    let mut ctrl = controller(config_for(dir.path(), &script));

    ctrl.start(TestProfile::Basic.default_stages(), None).unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    while !ctrl.get_log(0).contains("rng started") {
        assert!(Instant::now() < deadline, "rng stage never started");
        std::thread::sleep(Duration::from_millis(20));
    }
    let before = ctrl.get_percentage();

    let stopped_at = Instant::now();
    ctrl.stop();
    assert_eq!(ctrl.join(), Some(LifecycleState::Stopped));
    assert!(stopped_at.elapsed() < Duration::from_secs(10));

    assert_eq!(ctrl.get_state(), LifecycleState::Stopped);
    assert_eq!(ctrl.get_status(), "Stop requested.");
    assert!(ctrl.get_percentage() >= before);
    assert_eq!(ctrl.get_connectivity(), Connectivity::Unknown);
    assert!(ctrl.archive_path().is_some());
}

#[test]
fn test_probe_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("broken.sh");
    std::fs::write(&script, "if [ \"$1\" = \"--version\" ]; then echo 0.6.0; exit 0; fi\nexit 1\n").unwrap();
    let mut ctrl = controller(config_for(dir.path(), &script));

    ctrl.start(TestProfile::Basic.default_stages(), None).unwrap();
    assert_eq!(ctrl.join(), Some(LifecycleState::Failed));
    assert!(ctrl.get_log(0).contains("Capability probe failed"));
    assert!(!ctrl.get_statuses().join("\n").contains("Running key generation"));
    assert!(ctrl.archive_path().is_none());
}

#[test]
fn test_new_run_after_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_tool(dir.path(), "0.6.1", "true");
    let mut ctrl = controller(config_for(dir.path(), &script));

    let first = ctrl.start(TestProfile::Basic.default_stages(), None).unwrap();
    assert_eq!(ctrl.join(), Some(LifecycleState::Success));
    let second = ctrl.start(TestProfile::Basic.default_stages(), None).unwrap();
    assert_ne!(first, second);
    assert_eq!(ctrl.join(), Some(LifecycleState::Success));
}

/// The rng stage leaves a helper running that shares the tool's output pipes.
#[test]
fn test_stop_reaches_forked_helpers() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_tool(dir.path(), "0.6.1", "echo 'rng started'; sleep 30");
    let mut ctrl = controller(config_for(dir.path(), &script));

    ctrl.start(TestProfile::Basic.default_stages(), None).unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    while !ctrl.get_log(0).contains("rng started") {
        assert!(Instant::now() < deadline, "rng stage never started");
        std::thread::sleep(Duration::from_millis(20));
    }

    let stopped_at = Instant::now();
    ctrl.stop();
    assert_eq!(ctrl.join(), Some(LifecycleState::Stopped));
    assert!(
        stopped_at.elapsed() < Duration::from_secs(10),
        "stop took {:?}",
        stopped_at.elapsed()
    );
    assert!(ctrl.archive_path().is_some());
}

#[test]
fn test_malformed_detail_file_keeps_success() {
    let dir = tempfile::tempdir().unwrap();
    let script = fake_tool(
        dir.path(),
        "0.6.1",
        r#"printf 'time;rc\n1;0\n' > "$outdir/Perf_Sign:RSA_1024_RSASSA.csv""#,
    );
    let mut ctrl = controller(config_for(dir.path(), &script));

    ctrl.start(TestProfile::Basic.default_stages(), None).unwrap();
    assert_eq!(ctrl.join(), Some(LifecycleState::Success));

    let zip_path = ctrl.archive_path().expect("archive should exist");
    let performance = read_entry(&zip_path, &format!("performance/{}.csv", STEM));
    assert!(performance.contains("successful:;2;failed:;1;error:;0001"));
    assert!(performance.contains("lacks required column 'duration'"));
    let raw = read_entry(&zip_path, "detail/Perf_Sign:RSA_1024_RSASSA.csv");
    assert_eq!(raw, "time;rc\n1;0\n");
}
