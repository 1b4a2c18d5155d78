mod common;

use std::path::PathBuf;

use percolator::lock::{JobLock, LockRecord};
use percolator::registry::DeleteStatus;
use percolator::store::{Store, TableKind};

use common::{fixture, read_jsonl, records, write_jsonl};


fn write_manifest(fx: &common::Fixture, name: &str, manifest: &serde_json::Value) -> PathBuf {
    let path = fx.jobs().join(name);
    std::fs::write(&path, manifest.to_string()).unwrap();
    path
}

#[test]
fn a_job_runs_end_to_end() {
    let mut fx = fixture();

    fx.write_incoming("1-base.json", &records(0..100));
    let manifest = serde_json::json!({
        "id": "Job-1",
        "data_supplier": "XC",
        "date": "2018-05-01T12:00:00+00:00",
        "validator": {
            "specimen": {"results": {"outfiles": {"valid": ["/validator/1-base.json"]}}}
        },
    });
    let path = write_manifest(&fx, "job1.json", &manifest);

    assert!(fx.pipeline.run_job(&path, false).unwrap());

    // records landed in current
    let source = fx.pipeline.settings.source("xc-specimen").unwrap().clone();
    assert_eq!(fx.pipeline.store.count(&source, TableKind::Current).unwrap(), 100);

    // the input moved out of incoming
    assert!(!fx.incoming().join("1-base.json").exists());
    assert!(fx
        .pipeline
        .settings
        .paths
        .processed
        .join("1-base.json")
        .exists());

    // the finalized manifest landed in done with the original content,
    // the meta breadcrumbs and the produced delta files
    let done: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fx.pipeline.settings.paths.done.join("Job-1.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(done["data_supplier"], "XC");
    assert_eq!(done["percolator"]["xc-specimen"]["1-base.json"]["new"]["count"], 100);

    let outfiles = done["percolator"]["outfiles"].as_array().unwrap();
    assert!(!outfiles.is_empty());
    for outfile in outfiles {
        let path = PathBuf::from(outfile.as_str().unwrap());
        assert!(path.exists(), "outfile {} should exist", path.display());
        for line in read_jsonl(&path) {
            assert!(line.is_object());
        }
    }

    // the delta file names carry the job id
    assert!(fx.delta().join("Job-1-specimen-new.json").exists());

    // and the lock is gone
    assert!(matches!(
        fx.pipeline.lock.status().unwrap(),
        percolator::lock::LockStatus::Free
    ));
}

#[test]
fn a_live_lock_backs_off_without_side_effects() {
    let mut fx = fixture();

    fx.write_incoming("1-base.json", &records(0..10));
    let manifest = serde_json::json!({
        "id": "Job-2",
        "data_supplier": "XC",
        "validator": {
            "specimen": {"results": {"outfiles": {"valid": ["1-base.json"]}}}
        },
    });
    let path = write_manifest(&fx, "job2.json", &manifest);

    // a lock held by this very process reads as live
    let other = JobLock::new(&fx.jobs());
    other.acquire(&fx.jobs().join("other.json")).unwrap();

    assert!(!fx.pipeline.run_job(&path, false).unwrap());

    // nothing happened: no staging, no delta, no done file
    let source = fx.pipeline.settings.source("xc-specimen").unwrap().clone();
    assert_eq!(fx.pipeline.store.count(&source, TableKind::Import).unwrap(), 0);
    assert!(fx.incoming().join("1-base.json").exists());
    assert_eq!(std::fs::read_dir(fx.delta()).unwrap().count(), 0);
    assert!(!fx.pipeline.settings.paths.done.join("Job-2.json").exists());
}

#[test]
fn a_stale_lock_quarantines_the_crashed_job() {
    let mut fx = fixture();

    // the crashed run left its manifest and a lock with a dead pid
    let crashed = write_manifest(
        &fx,
        "crashed.json",
        &serde_json::json!({"id": "Job-dead", "data_supplier": "XC"}),
    );
    let record = LockRecord {
        job: crashed.clone(),
        pid: u32::MAX,
    };
    std::fs::write(
        fx.jobs().join(".lock"),
        serde_json::to_string(&record).unwrap(),
    )
    .unwrap();

    fx.write_incoming("1-base.json", &records(0..10));
    let manifest = serde_json::json!({
        "id": "Job-3",
        "data_supplier": "XC",
        "validator": {
            "specimen": {"results": {"outfiles": {"valid": ["1-base.json"]}}}
        },
    });
    let path = write_manifest(&fx, "job3.json", &manifest);

    assert!(fx.pipeline.run_job(&path, false).unwrap());

    // the dead job was moved aside and this job ran to completion
    assert!(!crashed.exists());
    assert!(fx.pipeline.settings.paths.failed.join("crashed.json").exists());
    assert!(fx.pipeline.settings.paths.done.join("Job-3.json").exists());
}

#[test]
fn explicit_deletes_run_from_the_manifest() {
    let mut fx = fixture();

    // baseline import so there is something to kill
    fx.write_incoming("1-base.json", &records(0..10));
    let manifest = serde_json::json!({
        "id": "Job-4",
        "data_supplier": "XC",
        "validator": {
            "specimen": {"results": {"outfiles": {"valid": ["1-base.json"]}}}
        },
    });
    let path = write_manifest(&fx, "job4.json", &manifest);
    assert!(fx.pipeline.run_job(&path, false).unwrap());

    // a second job carrying only a delete list of three live ids
    std::fs::write(
        fx.incoming().join("gone.txt"),
        "XC.0001@TEST\nXC.0002@TEST\nXC.0003@TEST\n",
    )
    .unwrap();
    let manifest = serde_json::json!({
        "id": "Job-5",
        "data_supplier": "XC",
        "delete": {"specimen": ["gone.txt"]},
    });
    let path = write_manifest(&fx, "job5.json", &manifest);
    assert!(fx.pipeline.run_job(&path, false).unwrap());

    let source = fx.pipeline.settings.source("xc-specimen").unwrap().clone();
    assert_eq!(fx.pipeline.store.count(&source, TableKind::Current).unwrap(), 7);

    // kills are REMOVED in the registry and in the kill delta
    for seq in 1..=3 {
        let entry = fx
            .pipeline
            .store
            .deletion(&format!("XC.000{seq}@TEST"))
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, DeleteStatus::Removed);
    }

    let kills = read_jsonl(&fx.delta().join("Job-5-specimen-kill.json"));
    assert_eq!(kills.len(), 3);
    assert!(kills.iter().all(|kill| kill["status"] == "REMOVED"));

    let done: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fx.pipeline.settings.paths.done.join("Job-5.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(done["percolator"]["xc-specimen"]["gone.txt"]["kill"]["count"], 3);
}

#[test]
fn a_failing_file_does_not_abort_the_job() {
    let mut fx = fixture();

    // only the second of the two scheduled files exists
    fx.write_incoming("2-good.json", &records(0..10));
    let manifest = serde_json::json!({
        "id": "Job-6",
        "data_supplier": "XC",
        "validator": {
            "specimen": {"results": {"outfiles": {"valid": ["1-missing.json", "2-good.json"]}}}
        },
    });
    let path = write_manifest(&fx, "job6.json", &manifest);

    assert!(fx.pipeline.run_job(&path, false).unwrap());

    // the good file imported fine
    let source = fx.pipeline.settings.source("xc-specimen").unwrap().clone();
    assert_eq!(fx.pipeline.store.count(&source, TableKind::Current).unwrap(), 10);

    // the bad one is marked failed in the finalized manifest
    let done: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(fx.pipeline.settings.paths.done.join("Job-6.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(done["percolator"]["xc-specimen"]["1-missing.json"]["status"], "failed");
    assert!(done["percolator"]["xc-specimen"]["2-good.json"]["status"].is_null());

    // and the lock is released
    assert!(matches!(
        fx.pipeline.lock.status().unwrap(),
        percolator::lock::LockStatus::Free
    ));
}

#[test]
fn unknown_sources_fail_before_any_work() {
    let mut fx = fixture();

    fx.write_incoming("1-base.json", &records(0..10));
    let manifest = serde_json::json!({
        "id": "Job-7",
        "data_supplier": "NOPE",
        "validator": {
            "specimen": {"results": {"outfiles": {"valid": ["1-base.json"]}}}
        },
    });
    let path = write_manifest(&fx, "job7.json", &manifest);

    let err = fx.pipeline.run_job(&path, false).unwrap_err();
    assert!(matches!(err, percolator::errors::Error::Source(_)));

    // startup failure leaves no lock behind
    assert!(matches!(
        fx.pipeline.lock.status().unwrap(),
        percolator::lock::LockStatus::Free
    ));
    assert!(fx.incoming().join("1-base.json").exists());
}

#[test]
fn delta_files_append_across_retries_of_one_job() {
    let mut fx = fixture();

    fx.write_incoming("1-base.json", &records(0..5));
    let manifest = serde_json::json!({
        "id": "Job-8",
        "data_supplier": "XC",
        "validator": {
            "specimen": {"results": {"outfiles": {"valid": ["1-base.json"]}}}
        },
    });
    let path = write_manifest(&fx, "job8.json", &manifest);
    assert!(fx.pipeline.run_job(&path, false).unwrap());

    // the retry re-stages the same file, finds nothing new, and the delta
    // file from the first attempt is untouched
    write_jsonl(&fx.incoming().join("1-base.json"), &records(0..5));
    assert!(fx.pipeline.run_job(&path, false).unwrap());

    let lines = read_jsonl(&fx.delta().join("Job-8-specimen-new.json"));
    assert_eq!(lines.len(), 5);
}
