mod common;

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::tempdir;

use common::{
    assert_summary_recomputable, config_for, create_vault_tree, item_keys, remote, sources,
    ScriptedSession, StopAfter,
};
use vault_inventory_core::checkpoint::{CheckpointOptions, CheckpointState, CheckpointStore};
use vault_inventory_core::model::{InventoryItem, ItemKey, RawRecord, SourceKind};
use vault_inventory_core::writer::ResumePoint;
use vault_inventory_core::{
    AppConfig, Error, InventoryReader, InventoryWriter, OverwritePolicy, RunOptions,
    RunOrchestrator, RunStatus, SilentReporter,
};

fn two_page_session() -> ScriptedSession {
    ScriptedSession::with_pages(vec![
        vec![
            remote("a.sldprt", "/Vault/a.sldprt", Some("101")),
            remote("x.sldprt", "/Vault/x.sldprt", Some("102")),
        ],
        vec![
            remote("c.sldasm", "/Vault/sub/c.sldasm", Some("103")),
            remote("z.txt", "/Other/z.txt", Some("104")),
        ],
    ])
}

fn options(resume: bool) -> (RunOptions, Arc<AtomicBool>) {
    let cancel = Arc::new(AtomicBool::new(false));
    let options = RunOptions {
        resume,
        policy: OverwritePolicy::Force,
        cancel: cancel.clone(),
        ..RunOptions::default()
    };
    (options, cancel)
}

fn run_uninterrupted(work: &Path, vault: &Path) -> Vec<(SourceKind, String)> {
    let config = config_for(work, vault);
    let (options, _) = options(false);
    let mut orchestrator =
        RunOrchestrator::new(config.clone(), sources(&config, two_page_session())).unwrap();
    orchestrator.run(&options, &SilentReporter).unwrap();
    item_keys(&InventoryReader::open(&config.output.path).unwrap())
}

/// Run until `limit` items are emitted, then abort via the cancel flag.
fn run_interrupted(config: &AppConfig, limit: u64) -> Option<String> {
    let (options, cancel) = options(false);
    let reporter = StopAfter { limit, cancel };
    let mut orchestrator =
        RunOrchestrator::new(config.clone(), sources(config, two_page_session())).unwrap();
    match orchestrator.run(&options, &reporter) {
        Err(Error::RunAborted {
            cause,
            emitted,
            last_cursor,
        }) => {
            assert!(matches!(*cause, Error::Interrupted));
            assert_eq!(emitted, limit);
            last_cursor
        }
        other => panic!("expected interruption, got {:?}", other.map(|o| o.summary)),
    }
}

fn resume(config: &AppConfig) -> vault_inventory_core::RunOutcome {
    let (options, _) = options(true);
    let mut orchestrator =
        RunOrchestrator::new(config.clone(), sources(config, two_page_session())).unwrap();
    orchestrator.run(&options, &SilentReporter).unwrap()
}

#[test]
fn test_resume_after_any_item_matches_uninterrupted_run() {
    let tmp = tempdir().unwrap();
    let vault = tmp.path().join("Vault");
    create_vault_tree(&vault);

    let expected = run_uninterrupted(&tmp.path().join("baseline"), &vault);
    assert_eq!(expected.len(), 7);

    for k in 1..=expected.len() as u64 {
        let work = tmp.path().join(format!("interrupted-{}", k));
        let config = config_for(&work, &vault);

        run_interrupted(&config, k);
        let outcome = resume(&config);
        assert!(outcome.resumed, "k={}", k);
        assert_eq!(outcome.summary.status, RunStatus::Completed, "k={}", k);

        let reader = InventoryReader::open(&config.output.path).unwrap();
        assert_summary_recomputable(&reader);
        let keys = item_keys(&reader);
        let unique: HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len(), "duplicates after resume at k={}", k);
        assert_eq!(keys, expected, "k={}", k);
    }
}

#[test]
fn test_abort_reports_last_recorded_cursor() {
    let tmp = tempdir().unwrap();
    let vault = tmp.path().join("Vault");
    create_vault_tree(&vault);
    let config = config_for(tmp.path(), &vault);

    // Interrupt inside the second remote page (3 pdm items + 3 remote rows).
    let cursor = run_interrupted(&config, 6);
    assert_eq!(cursor.as_deref(), Some("1"));
}

#[test]
fn test_resume_discards_bytes_written_after_last_record() {
    let tmp = tempdir().unwrap();
    let vault = tmp.path().join("Vault");
    create_vault_tree(&vault);
    let config = config_for(tmp.path(), &vault);

    run_interrupted(&config, 2);
    // A crash mid-append leaves a torn item past the recorded offset.
    let mut output = OpenOptions::new()
        .append(true)
        .open(&config.output.path)
        .unwrap();
    output.write_all(b",\n    {\"name\":\"torn").unwrap();
    drop(output);

    let outcome = resume(&config);
    assert_eq!(outcome.summary.total_items, 7);
    let reader = InventoryReader::open(&config.output.path).unwrap();
    assert_summary_recomputable(&reader);
    assert_eq!(reader.items().len(), 7);
}

#[test]
fn test_without_resume_flag_run_starts_over() {
    let tmp = tempdir().unwrap();
    let vault = tmp.path().join("Vault");
    create_vault_tree(&vault);
    let config = config_for(tmp.path(), &vault);

    run_interrupted(&config, 3);
    let (options, _) = options(false);
    let mut orchestrator =
        RunOrchestrator::new(config.clone(), sources(&config, two_page_session())).unwrap();
    let outcome = orchestrator.run(&options, &SilentReporter).unwrap();
    assert!(!outcome.resumed);
    assert_eq!(outcome.summary.total_items, 7);
}

#[test]
fn test_resume_without_checkpoint_names_the_problem() {
    let tmp = tempdir().unwrap();
    let vault = tmp.path().join("Vault");
    create_vault_tree(&vault);
    let config = config_for(tmp.path(), &vault);
    run_uninterrupted(tmp.path(), &vault);

    let mut orchestrator =
        RunOrchestrator::new(config.clone(), sources(&config, two_page_session())).unwrap();
    let options = RunOptions {
        resume: true,
        ..RunOptions::default()
    };
    let result = orchestrator.run(&options, &SilentReporter);
    match result {
        Err(err @ Error::NothingToResume(_)) => {
            assert!(err.to_string().contains("--force"));
            assert!(!err.to_string().contains("--resume"));
        }
        other => panic!("expected NothingToResume, got {:?}", other.map(|o| o.summary)),
    }
}

#[test]
fn test_resume_retries_units_of_failed_source() {
    let tmp = tempdir().unwrap();
    let vault = tmp.path().join("Vault");
    create_vault_tree(&vault);
    let mut config = config_for(tmp.path(), &vault);
    config.plm.max_consecutive_errors = 2;

    let healthy = ScriptedSession::with_pages(vec![
        vec![remote("a.sldprt", "/Vault/a.sldprt", Some("1"))],
        vec![remote("b.sldprt", "/Vault/b.sldprt", Some("2"))],
        vec![remote("c.sldasm", "/Vault/sub/c.sldasm", Some("3"))],
        vec![remote("d.sldprt", "/Vault/d.sldprt", Some("4"))],
    ]);
    let mut flaky = healthy.clone();
    flaky.failing_pages = vec![1, 2];

    let (first, _) = options(false);
    let mut orchestrator = RunOrchestrator::new(config.clone(), sources(&config, flaky)).unwrap();
    let outcome = orchestrator.run(&first, &SilentReporter).unwrap();
    assert_eq!(outcome.summary.status, RunStatus::Partial);
    assert_eq!(outcome.summary.failed_paths.len(), 2);

    let (retry, _) = options(true);
    let mut orchestrator =
        RunOrchestrator::new(config.clone(), sources(&config, healthy)).unwrap();
    let outcome = orchestrator.run(&retry, &SilentReporter).unwrap();
    assert!(outcome.resumed);
    assert_eq!(outcome.summary.status, RunStatus::Completed);
    assert!(outcome.summary.failed_paths.is_empty());
    assert_eq!(outcome.summary.stats.total(SourceKind::Plm), 4);

    let reader = InventoryReader::open(&config.output.path).unwrap();
    assert_summary_recomputable(&reader);
    let keys = item_keys(&reader);
    let unique: HashSet<_> = keys.iter().collect();
    assert_eq!(unique.len(), keys.len());
    assert_eq!(keys.len(), 7);
}

#[test]
fn test_corrupt_checkpoint_blocks_resume() {
    let tmp = tempdir().unwrap();
    let vault = tmp.path().join("Vault");
    create_vault_tree(&vault);
    let config = config_for(tmp.path(), &vault);

    run_interrupted(&config, 2);
    let (options, _) = options(true);
    let mut orchestrator =
        RunOrchestrator::new(config.clone(), sources(&config, two_page_session())).unwrap();
    let run_id = orchestrator.run_id(&options);
    fs::write(
        config.checkpoint.dir.join(format!("{}.json", run_id)),
        "{\"run_id\":",
    )
    .unwrap();

    let result = orchestrator.run(&options, &SilentReporter);
    assert!(matches!(result, Err(Error::CheckpointCorrupt { .. })));
}

fn item(path: &str) -> InventoryItem {
    InventoryItem::from_record(
        RawRecord {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            remote_id: None,
            size: None,
            created_at: None,
            modified_at: None,
        },
        SourceKind::Plm,
        None,
    )
}

/// Number of items in the output prefix `[..offset]` once the array is closed.
fn items_before(output: &Path, offset: u64) -> usize {
    let bytes = fs::read(output).unwrap();
    let mut prefix = bytes[..offset as usize].to_vec();
    prefix.extend_from_slice(b"\n  ]\n}\n");
    let doc: serde_json::Value = serde_json::from_slice(&prefix).unwrap();
    doc["items"].as_array().unwrap().len()
}

#[test]
fn test_checkpoint_never_ahead_of_output() {
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("inventory.json");
    let checkpoint_dir = tmp.path().join("checkpoint");
    let sources = [SourceKind::Plm];

    for crash_after in 1..=4usize {
        let run_id = format!("crash-{}", crash_after);
        let mut writer =
            InventoryWriter::open(&output, OverwritePolicy::Force, &sources, None).unwrap();
        let mut store = CheckpointStore::create(
            &checkpoint_dir,
            CheckpointState::new(run_id.clone(), &sources),
            CheckpointOptions::default(),
        )
        .unwrap();

        for i in 0..crash_after {
            let item = item(&format!("/Vault/{}.prt", i));
            let offset = writer.write_item(&item).unwrap();
            // The last write is never recorded: the process dies in between.
            if i + 1 < crash_after {
                let key = ItemKey::new(SourceKind::Plm, item.remote_path.clone());
                store.record(&key, None, offset, false).unwrap();
            }
        }
        drop(store);
        drop(writer);

        let state = CheckpointStore::load(&checkpoint_dir, &run_id).unwrap().unwrap();
        let durable = items_before(&output, fs::metadata(&output).unwrap().len());
        assert!(state.emitted_count as usize <= durable);
        if state.emitted_count > 0 {
            assert_eq!(
                items_before(&output, state.output_offset),
                state.emitted_count as usize
            );
        }

        // Resuming from the checkpoint drops the unrecorded tail.
        let mut resumed = InventoryWriter::open(
            &output,
            OverwritePolicy::Force,
            &sources,
            Some(ResumePoint {
                offset: state.output_offset,
                emitted: state.emitted_count,
                stats: state.stats.clone(),
            }),
        )
        .unwrap();
        let summary = resumed.finalize(RunStatus::Partial, Vec::new()).unwrap();
        drop(resumed);
        assert_eq!(summary.total_items, state.emitted_count);
        let reader = InventoryReader::open(&output).unwrap();
        assert_eq!(reader.items().len() as u64, state.emitted_count);
    }
}
