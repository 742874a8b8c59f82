//! Watcher-driven sync-back: debounce collapse, no-op detection and
//! auto-save batching.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use oxpack::{PackageEngine, PackageEvent, Settings};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

const DOCUMENT: &[u8] = b"<w:document><w:body/></w:document>";

fn write_container(path: &Path) {
    let file = File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    writer.start_file("word/document.xml", options).unwrap();
    writer.write_all(DOCUMENT).unwrap();
    writer.start_file("word/styles.xml", options).unwrap();
    writer.write_all(b"<w:styles/>").unwrap();
    writer.finish().unwrap();
}

/// Short debounce, auto-save effectively disabled unless a test wants it.
fn test_settings(autosave_ms: u64) -> Settings {
    let mut settings = Settings::default();
    settings.engine.debounce_ms = 150;
    settings.engine.autosave_delay_ms = autosave_ms;
    settings
}

async fn wait_for(
    events: &mut broadcast::Receiver<PackageEvent>,
    want: impl Fn(&PackageEvent) -> bool,
    wait: Duration,
) -> Option<PackageEvent> {
    timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => return event,
                Ok(_) => continue,
                Err(_) => panic!("event channel closed"),
            }
        }
    })
    .await
    .ok()
}

fn count_synced(events: &mut broadcast::Receiver<PackageEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PackageEvent::EntrySynced { .. }) {
            count += 1;
        }
    }
    count
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_of_edits_syncs_exactly_once() {
    let dir = TempDir::new().unwrap();
    let container = dir.path().join("report.docx");
    write_container(&container);

    let engine = PackageEngine::builder()
        .settings(test_settings(600_000))
        .build();
    let mut events = engine.subscribe();
    engine.open(&container).await.unwrap();
    let doc_path = engine
        .temp_file_path(&container, "word/document.xml")
        .await
        .unwrap();

    // Let the watcher establish itself before editing.
    sleep(Duration::from_millis(300)).await;

    // Five rapid writes, all within one debounce window.
    for i in 0..5 {
        fs::write(&doc_path, format!("<w:document><!-- rev {i} --></w:document>")).unwrap();
        sleep(Duration::from_millis(10)).await;
    }

    let synced = wait_for(
        &mut events,
        |e| matches!(e, PackageEvent::EntrySynced { .. }),
        Duration::from_secs(5),
    )
    .await;
    assert!(synced.is_some(), "no sync-back observed");

    // Give a second debounce window a chance to (wrongly) fire again.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(count_synced(&mut events), 0, "burst synced more than once");

    // The in-memory image holds the final write.
    assert_eq!(
        engine
            .read_entry(&container, "word/document.xml")
            .await
            .unwrap(),
        b"<w:document><!-- rev 4 --></w:document>"
    );
    assert!(engine.has_unsaved_changes(&container).await);
    assert_eq!(
        engine.list_modified(&container).await,
        vec!["word/document.xml".to_string()]
    );

    engine.close(&container).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_write_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let container = dir.path().join("report.docx");
    write_container(&container);

    let engine = PackageEngine::builder()
        .settings(test_settings(600_000))
        .build();
    let mut events = engine.subscribe();
    engine.open(&container).await.unwrap();
    let doc_path = engine
        .temp_file_path(&container, "word/document.xml")
        .await
        .unwrap();

    sleep(Duration::from_millis(300)).await;

    // Same bytes back: the watcher fires but the byte-compare wins.
    fs::write(&doc_path, DOCUMENT).unwrap();
    sleep(Duration::from_millis(800)).await;

    assert!(!engine.has_unsaved_changes(&container).await);
    assert!(engine.list_modified(&container).await.is_empty());
    assert_eq!(count_synced(&mut events), 0);

    engine.close(&container).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backdated_temp_edit_is_skipped_as_stale() {
    let dir = TempDir::new().unwrap();
    let container = dir.path().join("report.docx");
    write_container(&container);

    let mut settings = test_settings(600_000);
    settings.engine.stale_after_secs = 1;
    let engine = PackageEngine::builder().settings(settings).build();
    let mut events = engine.subscribe();
    engine.open(&container).await.unwrap();
    let doc_path = engine
        .temp_file_path(&container, "word/document.xml")
        .await
        .unwrap();

    sleep(Duration::from_millis(300)).await;

    // Write, then push the mtime far into the past before the debounce
    // settles: the event arrives but the file looks like old replay.
    fs::write(&doc_path, b"<w:document><w:p/></w:document>").unwrap();
    let backdated = std::time::SystemTime::now() - Duration::from_secs(60);
    File::options()
        .write(true)
        .open(&doc_path)
        .unwrap()
        .set_modified(backdated)
        .unwrap();

    sleep(Duration::from_millis(800)).await;
    assert_eq!(count_synced(&mut events), 0, "stale edit was folded");
    assert!(!engine.has_unsaved_changes(&container).await);
    assert!(engine.list_modified(&container).await.is_empty());

    engine.close(&container).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn autosave_commits_after_the_batching_delay() {
    let dir = TempDir::new().unwrap();
    let container = dir.path().join("report.docx");
    write_container(&container);

    let engine = PackageEngine::builder()
        .settings(test_settings(300))
        .build();
    let mut events = engine.subscribe();
    engine.open(&container).await.unwrap();
    let doc_path = engine
        .temp_file_path(&container, "word/document.xml")
        .await
        .unwrap();

    sleep(Duration::from_millis(300)).await;

    let edited = b"<w:document><w:body><w:p/></w:body></w:document>";
    fs::write(&doc_path, edited).unwrap();

    let saved = wait_for(
        &mut events,
        |e| matches!(e, PackageEvent::Saved { .. }),
        Duration::from_secs(8),
    )
    .await;
    assert!(saved.is_some(), "auto-save did not commit");
    assert!(!engine.has_unsaved_changes(&container).await);

    // The container on disk now holds the edit.
    use std::io::Read;
    let mut archive = zip::ZipArchive::new(File::open(&container).unwrap()).unwrap();
    let mut entry = archive.by_name("word/document.xml").unwrap();
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes, edited);
    drop(entry);

    // And the engine's own save does not bounce back as an external
    // change: no reload, local state stays consistent.
    sleep(Duration::from_millis(800)).await;
    let mut reloaded = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PackageEvent::Reloaded { .. }) {
            reloaded = true;
        }
    }
    assert!(!reloaded, "self-inflicted save triggered a reload");

    engine.close(&container).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edits_to_multiple_entries_batch_into_one_save() {
    let dir = TempDir::new().unwrap();
    let container = dir.path().join("report.docx");
    write_container(&container);

    let engine = PackageEngine::builder()
        .settings(test_settings(400))
        .build();
    let mut events = engine.subscribe();
    engine.open(&container).await.unwrap();
    let doc_path = engine
        .temp_file_path(&container, "word/document.xml")
        .await
        .unwrap();
    let styles_path = engine
        .temp_file_path(&container, "word/styles.xml")
        .await
        .unwrap();

    sleep(Duration::from_millis(300)).await;

    fs::write(&doc_path, b"<w:document><w:body><w:p/></w:body></w:document>").unwrap();
    fs::write(&styles_path, b"<w:styles><w:style/></w:styles>").unwrap();

    let saved = wait_for(
        &mut events,
        |e| matches!(e, PackageEvent::Saved { .. }),
        Duration::from_secs(8),
    )
    .await;
    assert!(saved.is_some());

    // One save, not one per entry.
    sleep(Duration::from_millis(800)).await;
    let mut extra_saves = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PackageEvent::Saved { .. }) {
            extra_saves += 1;
        }
    }
    assert_eq!(extra_saves, 0, "edits did not batch into one save");

    engine.close(&container).await;
}
