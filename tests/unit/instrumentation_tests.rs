use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_runner::instrumentation::diff_summary::diff_hint;
use agent_runner::instrumentation::file_watcher::translate;
use agent_runner::instrumentation::{summarize, DiffStats, WorkspaceWatcher};
use agent_runner::provider::{FileOperation, ProviderEvent, Subscribers};
use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind};
use tokio::sync::mpsc;

// ── Diff summaries ──────────────────────────────────────────

#[test]
fn counts_changed_lines() {
    let stats = DiffStats::between("a\nb\nc\n", "a\nB\nc\nd\n");
    assert_eq!(
        stats,
        DiffStats {
            additions: 2,
            deletions: 1,
        }
    );
    assert_eq!(stats.shorthand(), "+2 -1");
    assert_eq!(DiffStats::between("same\n", "same\n"), DiffStats::default());
}

#[test]
fn new_file_is_all_additions() {
    match summarize(Some("notes.md"), "", "one\ntwo\n") {
        ProviderEvent::DiffHint {
            path,
            additions,
            deletions,
            summary,
        } => {
            assert_eq!(path.as_deref(), Some("notes.md"));
            assert_eq!((additions, deletions), (2, 0));
            assert_eq!(summary, "notes.md: +2 -0");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn pathless_hint_uses_shorthand() {
    let mut stats = DiffStats::default();
    stats.add(DiffStats {
        additions: 3,
        deletions: 4,
    });
    assert_eq!(
        diff_hint(None, stats),
        ProviderEvent::DiffHint {
            path: None,
            additions: 3,
            deletions: 4,
            summary: "+3 -4".into(),
        }
    );
}

// ── File watcher ────────────────────────────────────────────

fn event(kind: EventKind, paths: &[&str]) -> Event {
    paths
        .iter()
        .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
}

#[test]
fn notify_events_map_to_file_operations() {
    let root = Path::new("/work/sess-1");
    assert_eq!(
        translate(
            root,
            &event(EventKind::Create(CreateKind::File), &["/work/sess-1/src/new.rs"])
        ),
        Some(ProviderEvent::FilesTouched {
            paths: vec!["src/new.rs".into()],
            operation: FileOperation::Create,
        })
    );
    assert_eq!(
        translate(
            root,
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/work/sess-1/a.ts"]
            )
        ),
        Some(ProviderEvent::FilesTouched {
            paths: vec!["a.ts".into()],
            operation: FileOperation::Write,
        })
    );
    assert_eq!(
        translate(
            root,
            &event(EventKind::Remove(RemoveKind::File), &["/work/sess-1/old.txt"])
        ),
        Some(ProviderEvent::FilesTouched {
            paths: vec!["old.txt".into()],
            operation: FileOperation::Delete,
        })
    );
}

#[test]
fn noise_is_ignored() {
    let root = Path::new("/work/sess-1");
    for kind in [
        EventKind::Access(AccessKind::Any),
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
        EventKind::Any,
    ] {
        assert_eq!(translate(root, &event(kind, &["/work/sess-1/a.ts"])), None);
    }
    assert_eq!(
        translate(
            root,
            &event(
                EventKind::Create(CreateKind::File),
                &["/work/sess-1/.git/index", "/elsewhere/x.rs"]
            )
        ),
        None
    );
}

#[tokio::test]
async fn watcher_reports_new_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().canonicalize().expect("canonical");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = WorkspaceWatcher::start(&root, tx).expect("watch");

    std::fs::write(root.join("hello.txt"), "hi").expect("write");

    let mut seen = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !seen {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(ProviderEvent::FilesTouched { paths, .. })) => {
                seen = paths.iter().any(|p| p == "hello.txt");
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    drop(watcher);
    assert!(seen, "watcher never reported hello.txt");
}

// ── Subscribers ─────────────────────────────────────────────

#[test]
fn listener_may_unsubscribe_itself_while_emitting() {
    let subs: Arc<Subscribers<u32>> = Arc::new(Subscribers::new());
    let calls = Arc::new(Mutex::new(0_u32));
    let own_id = Arc::new(Mutex::new(None));

    let listener_subs = Arc::clone(&subs);
    let listener_calls = Arc::clone(&calls);
    let listener_id = Arc::clone(&own_id);
    let id = subs.subscribe(Arc::new(move |_: &u32| {
        *listener_calls.lock().unwrap() += 1;
        if let Some(id) = *listener_id.lock().unwrap() {
            listener_subs.unsubscribe(id);
        }
    }));
    *own_id.lock().unwrap() = Some(id);

    subs.emit(&1);
    subs.emit(&2);
    assert_eq!(*calls.lock().unwrap(), 1);
    assert!(subs.is_empty());
    assert_eq!(subs.len(), 0);
}
