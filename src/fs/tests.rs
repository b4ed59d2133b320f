use std::sync::Arc;
use tempfile::TempDir;
use super::*;
use crate::config::FsOptions;
use crate::storage::{MemoryStore, StoreOp};

fn options(dir: &TempDir) -> FsOptions {
    FsOptions {
        // Long TTLs: anything observed after a mutation comes from invalidation.
        list_ttl_ms: 60_000,
        capacity_ttl_ms: 60_000,
        staging_dir: Some(dir.path().to_path_buf()),
        ..FsOptions::default()
    }
}

fn mount<I, K, V>(objects: I) -> (TempDir, Arc<MemoryStore>, BucketFs)
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::with_objects(objects));
    let fs = BucketFs::new(store.clone(), options(&dir));
    (dir, store, fs)
}

fn empty() -> (TempDir, Arc<MemoryStore>, BucketFs) {
    mount(Vec::<(String, Vec<u8>)>::new())
}

fn names(entries: &[DirEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

async fn read_all(fs: &BucketFs, path: &str, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let n = fs.read(path, None, &mut buf, out.len() as u64).await.unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[tokio::test]
async fn test_root_is_directory() {
    let (_dir, store, fs) = empty();
    assert_eq!(fs.getattr("/").await.unwrap(), Entry::Directory);
    assert_eq!(fs.getattr("").await.unwrap(), Entry::Directory);
    assert_eq!(store.list_calls(), 0);
}

#[tokio::test]
async fn test_getattr_file_dir_and_missing() {
    let (_dir, _store, fs) = mount([("docs/a.txt", "abc"), ("marker/", "")]);
    assert!(matches!(fs.getattr("/docs/a.txt").await.unwrap(), Entry::File { size: 3, .. }));
    assert_eq!(fs.getattr("/docs").await.unwrap(), Entry::Directory);
    assert_eq!(fs.getattr("/marker").await.unwrap(), Entry::Directory);
    let err = fs.getattr("/nope").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);
}

#[tokio::test]
async fn test_getattr_listing_failure_is_io() {
    let (_dir, store, fs) = mount([("a", "1")]);
    store.fail_all(StoreOp::List);
    assert_eq!(fs.getattr("/a").await.unwrap_err().errno(), libc::EIO);
    assert_eq!(fs.readdir("/").await.unwrap_err().errno(), libc::EIO);
}

#[tokio::test]
async fn test_open_handle_shadows_store() {
    let (_dir, _store, fs) = mount([("f", "abc")]);
    let id = fs.open("/f", true).await.unwrap().unwrap();
    assert!(matches!(fs.getattr("/f").await.unwrap(), Entry::File { size: 3, .. }));

    fs.write(id, &[7u8; 100], 0).await.unwrap();
    assert!(matches!(fs.getattr("/f").await.unwrap(), Entry::File { size: 100, .. }));

    let fresh = fs.create("/new.bin", 0o644).await.unwrap();
    fs.write(fresh, b"xy", 10).await.unwrap();
    assert!(matches!(fs.getattr("/new.bin").await.unwrap(), Entry::File { size: 12, .. }));
}

#[tokio::test]
async fn test_readdir_implicit_dirs_without_duplicates() {
    let (_dir, _store, fs) = mount([("a/b.txt", "1"), ("a/c/d.txt", "2"), ("a/c/e.txt", "3")]);
    let entries = fs.readdir("/a").await.unwrap();
    assert_eq!(names(&entries), vec![".", "..", "b.txt", "c"]);
    assert_eq!(entries[3].entry, Entry::Directory);
    assert!(!entries[2].entry.is_dir());
}

#[tokio::test]
async fn test_mkdir_visible_before_ttl() {
    let (_dir, store, fs) = empty();
    assert!(fs.getattr("/x").await.unwrap_err().is_not_found());
    fs.mkdir("/x").await.unwrap();
    assert_eq!(fs.getattr("/x").await.unwrap(), Entry::Directory);
    assert_eq!(store.object("x/"), Some(Vec::new()));
    assert_eq!(store.list_calls(), 2);
}

#[tokio::test]
async fn test_overlapping_writes_last_wins() {
    let (_dir, store, fs) = empty();
    let id = fs.create("/f", 0o644).await.unwrap();
    fs.write(id, &[1u8; 100], 0).await.unwrap();
    fs.write(id, &[2u8; 100], 50).await.unwrap();
    fs.flush(id).await.unwrap();

    let stored = store.object("f").unwrap();
    assert_eq!(stored.len(), 150);
    assert!(stored[..50].iter().all(|&b| b == 1));
    assert!(stored[50..150].iter().all(|&b| b == 2));
}

#[tokio::test]
async fn test_sparse_write() {
    let (_dir, store, fs) = empty();
    let id = fs.create("/sparse", 0o644).await.unwrap();
    fs.write(id, b"end", 5).await.unwrap();
    fs.release(id).await.unwrap();
    assert_eq!(store.object("sparse").unwrap(), b"\0\0\0\0\0end");
}

#[tokio::test]
async fn test_open_for_write_starts_from_current_content() {
    let (_dir, store, fs) = mount([("greeting", "hello")]);
    let id = fs.open("/greeting", true).await.unwrap().unwrap();
    fs.write(id, b"J", 0).await.unwrap();
    fs.release(id).await.unwrap();
    assert_eq!(store.object("greeting").unwrap(), b"Jello");
}

#[tokio::test]
async fn test_open_download_failure_starts_empty() {
    let (_dir, store, fs) = mount([("f", "old content")]);
    store.fail(StoreOp::Get, "f");
    let id = fs.open("/f", true).await.unwrap().unwrap();
    assert!(matches!(fs.getattr("/f").await.unwrap(), Entry::File { size: 0, .. }));
    fs.write(id, b"new", 0).await.unwrap();
    fs.release(id).await.unwrap();
    assert_eq!(store.object("f").unwrap(), b"new");
}

#[tokio::test]
async fn test_interrupted_download_never_reaches_the_store() {
    let (_dir, store, fs) = empty();
    for _ in 0..20 {
        store.insert("f", vec![b'X'; 1 << 20]);
        store.interrupt("f", 1 << 20);
        let id = fs.open("/f", true).await.unwrap().unwrap();
        assert!(matches!(fs.getattr("/f").await.unwrap(), Entry::File { size: 0, .. }));
        fs.write(id, b"new", 0).await.unwrap();
        fs.release(id).await.unwrap();
        assert_eq!(store.object("f").unwrap(), b"new");
        store.clear_failures();
    }
}

#[tokio::test]
async fn test_read_only_open_has_no_handle() {
    let (_dir, store, fs) = mount([("f", "data")]);
    assert_eq!(fs.open("/f", false).await.unwrap(), None);
    assert_eq!(fs.open_handles(), 0);
    assert_eq!(store.get_calls(), 0);
}

#[tokio::test]
async fn test_read_edges() {
    let (_dir, _store, fs) = mount([("zero", ""), ("five", "12345")]);
    let mut buf = [0u8; 8];
    assert_eq!(fs.read("/zero", None, &mut buf, 0).await.unwrap(), 0);
    assert_eq!(fs.read("/five", None, &mut buf, 5).await.unwrap(), 0);
    assert_eq!(fs.read("/five", None, &mut buf, 500).await.unwrap(), 0);
    assert_eq!(fs.read("/five", None, &mut buf, 3).await.unwrap(), 2);
    assert_eq!(&buf[..2], b"45");
}

#[tokio::test]
async fn test_chunked_read_reassembles_object() {
    let content: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let (_dir, _store, fs) = mount([("blob", content.clone())]);
    assert_eq!(read_all(&fs, "/blob", 777).await, content);
}

#[tokio::test]
async fn test_read_missing_object() {
    let (_dir, store, fs) = empty();
    let mut buf = [0u8; 4];
    assert_eq!(fs.read("/ghost", None, &mut buf, 0).await.unwrap_err().errno(), libc::ENOENT);
    store.fail_all(StoreOp::Get);
    assert_eq!(fs.read("/ghost", None, &mut buf, 0).await.unwrap_err().errno(), libc::EIO);
}

#[tokio::test]
async fn test_read_through_write_handle_sees_unflushed_data() {
    let (_dir, store, fs) = mount([("f", "aaaa")]);
    let id = fs.open("/f", true).await.unwrap().unwrap();
    fs.write(id, b"bb", 2).await.unwrap();
    let mut buf = [0u8; 8];
    let n = fs.read("/f", Some(id), &mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], b"aabb");
    assert_eq!(store.object("f").unwrap(), b"aaaa");
}

#[tokio::test]
async fn test_write_unknown_handle() {
    let (_dir, _store, fs) = empty();
    let err = fs.write(42, b"x", 0).await.unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);
    let err = fs.truncate("/f", 0, Some(42)).await.unwrap_err();
    assert_eq!(err.errno(), libc::EBADF);
}

#[tokio::test]
async fn test_truncate_with_handle() {
    let (_dir, store, fs) = mount([("f", "0123456789")]);
    let id = fs.open("/f", true).await.unwrap().unwrap();
    fs.truncate("/f", 4, Some(id)).await.unwrap();
    assert!(matches!(fs.getattr("/f").await.unwrap(), Entry::File { size: 4, .. }));
    fs.release(id).await.unwrap();
    assert_eq!(store.object("f").unwrap(), b"0123");
}

#[tokio::test]
async fn test_truncate_without_handle() {
    let (_dir, store, fs) = mount([("f", "content")]);
    assert!(matches!(fs.getattr("/f").await.unwrap(), Entry::File { size: 7, .. }));

    let err = fs.truncate("/f", 3, None).await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOSYS);

    fs.truncate("/f", 0, None).await.unwrap();
    assert_eq!(store.object("f").unwrap(), Vec::<u8>::new());
    assert!(matches!(fs.getattr("/f").await.unwrap(), Entry::File { size: 0, .. }));
}

#[tokio::test]
async fn test_flush_is_noop_when_clean_or_unknown() {
    let (_dir, store, fs) = mount([("f", "abc")]);
    let id = fs.open("/f", true).await.unwrap().unwrap();
    store.fail_all(StoreOp::Put);
    fs.flush(id).await.unwrap();
    fs.flush(9999).await.unwrap();
}

#[tokio::test]
async fn test_flush_failure_keeps_handle_dirty() {
    let (_dir, store, fs) = empty();
    let id = fs.create("/f", 0o644).await.unwrap();
    fs.write(id, b"payload", 0).await.unwrap();

    store.fail(StoreOp::Put, "f");
    assert_eq!(fs.flush(id).await.unwrap_err().errno(), libc::EIO);
    assert!(fs.handles.get(id).unwrap().dirty);

    store.clear_failures();
    fs.flush(id).await.unwrap();
    assert!(!fs.handles.get(id).unwrap().dirty);
    assert_eq!(store.object("f").unwrap(), b"payload");
}

#[tokio::test]
async fn test_flush_invalidates_listing() {
    let (_dir, store, fs) = mount([("f", "abc")]);
    fs.readdir("/").await.unwrap();
    let id = fs.open("/f", true).await.unwrap().unwrap();
    fs.write(id, b"abcdef", 0).await.unwrap();
    fs.release(id).await.unwrap();
    assert!(matches!(fs.getattr("/f").await.unwrap(), Entry::File { size: 6, .. }));
    assert_eq!(store.list_calls(), 2);
}

#[tokio::test]
async fn test_create_without_writes_stores_empty_object() {
    let (_dir, store, fs) = empty();
    let id = fs.create("/touched", 0o644).await.unwrap();
    fs.release(id).await.unwrap();
    assert_eq!(store.object("touched"), Some(Vec::new()));
}

#[tokio::test]
async fn test_release_removes_handle_and_staging() {
    let (dir, store, fs) = empty();
    let id = fs.create("/f", 0o644).await.unwrap();
    fs.write(id, b"data", 0).await.unwrap();
    let staging = fs.handles.get(id).unwrap().staging.path().to_path_buf();
    assert!(staging.starts_with(dir.path()));

    fs.release(id).await.unwrap();
    assert_eq!(fs.open_handles(), 0);
    assert!(!staging.exists());
    assert_eq!(store.object("f").unwrap(), b"data");
    assert_eq!(fs.write(id, b"x", 0).await.unwrap_err().errno(), libc::EBADF);
    fs.release(id).await.unwrap();
}

#[tokio::test]
async fn test_release_failure_preserves_content() {
    let (dir, store, fs) = empty();
    let id = fs.create("/dir/report.txt", 0o644).await.unwrap();
    fs.write(id, b"unsaved", 0).await.unwrap();
    store.fail_all(StoreOp::Put);

    let err = fs.release(id).await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert_eq!(fs.open_handles(), 0);

    let kept = dir.path().join("unflushed").join(format!("dir_report.txt-{}", id));
    assert_eq!(std::fs::read(kept).unwrap(), b"unsaved");
    assert!(store.object("dir/report.txt").is_none());
}

#[tokio::test]
async fn test_release_failure_discards_when_not_preserving() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let fs = BucketFs::new(
        store.clone(),
        FsOptions {
            preserve_unflushed: false,
            release_flush_attempts: 1,
            ..options(&dir)
        },
    );
    let id = fs.create("/f", 0o644).await.unwrap();
    fs.write(id, b"lost", 0).await.unwrap();
    store.fail_all(StoreOp::Put);

    assert!(fs.release(id).await.is_err());
    assert_eq!(fs.open_handles(), 0);
    assert!(!dir.path().join("unflushed").exists());
}

#[tokio::test]
async fn test_unlink_invalidates() {
    let (_dir, store, fs) = mount([("a", "1"), ("b", "2")]);
    assert_eq!(names(&fs.readdir("/").await.unwrap()), vec![".", "..", "a", "b"]);
    fs.unlink("/a").await.unwrap();
    assert_eq!(names(&fs.readdir("/").await.unwrap()), vec![".", "..", "b"]);
    assert_eq!(store.keys(), vec!["b"]);
}

#[tokio::test]
async fn test_rmdir_empty_and_full() {
    let (_dir, store, fs) = mount([("empty/", ""), ("full/", ""), ("full/x", "1")]);
    fs.rmdir("/empty").await.unwrap();
    assert!(store.object("empty/").is_none());

    let err = fs.rmdir("/full").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOTEMPTY);
    assert!(store.object("full/").is_some());
}

#[tokio::test]
async fn test_rmdir_without_marker() {
    let (_dir, _store, fs) = empty();
    fs.rmdir("/never-existed").await.unwrap();
}

#[tokio::test]
async fn test_rename_directory() {
    let (_dir, store, fs) = mount([("a/x", "1"), ("a/y", "2"), ("keep", "3")]);
    fs.readdir("/").await.unwrap();
    fs.rename("/a", "/b").await.unwrap();
    assert_eq!(store.keys(), vec!["b/x", "b/y", "keep"]);
    assert_eq!(store.object("b/y").unwrap(), b"2");
    assert!(fs.getattr("/a").await.unwrap_err().is_not_found());
    assert_eq!(fs.getattr("/b").await.unwrap(), Entry::Directory);
}

#[tokio::test]
async fn test_rename_directory_with_marker() {
    let (_dir, store, fs) = mount([("a/", ""), ("a/sub/z", "1")]);
    fs.rename("/a", "/b").await.unwrap();
    assert_eq!(store.keys(), vec!["b/", "b/sub/z"]);
}

#[tokio::test]
async fn test_rename_empty_directory() {
    let (_dir, store, fs) = mount([("e/", "")]);
    fs.rename("/e", "/n").await.unwrap();
    assert_eq!(store.keys(), vec!["n/"]);
    assert_eq!(fs.getattr("/n").await.unwrap(), Entry::Directory);
}

#[tokio::test]
async fn test_rename_carries_open_handles() {
    let (_dir, store, fs) = mount([("a/x", "1")]);
    let id = fs.open("/a/x", true).await.unwrap().unwrap();
    fs.rename("/a", "/b").await.unwrap();
    fs.write(id, b"2", 0).await.unwrap();
    assert!(matches!(fs.getattr("/b/x").await.unwrap(), Entry::File { size: 1, .. }));
    fs.release(id).await.unwrap();
    assert_eq!(store.keys(), vec!["b/x"]);
    assert_eq!(store.object("b/x").unwrap(), b"2");
}

#[tokio::test]
async fn test_rename_directory_is_not_atomic() {
    let (_dir, store, fs) = mount([("a/x", "1"), ("a/y", "2")]);
    store.fail(StoreOp::Delete, "a/x");
    let err = fs.rename("/a", "/b").await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert!(store.object("b/x").is_some());
    assert!(store.object("a/x").is_some());
    assert!(store.object("b/y").is_none());
    assert!(store.object("a/y").is_some());
}

#[tokio::test]
async fn test_rename_file() {
    let (_dir, store, fs) = mount([("old.txt", "body")]);
    fs.rename("/old.txt", "/new.txt").await.unwrap();
    assert_eq!(store.keys(), vec!["new.txt"]);
}

#[tokio::test]
async fn test_rename_file_tolerates_delete_failure() {
    let (_dir, store, fs) = mount([("old.txt", "body")]);
    store.fail(StoreOp::Delete, "old.txt");
    fs.rename("/old.txt", "/new.txt").await.unwrap();
    assert_eq!(store.keys(), vec!["new.txt", "old.txt"]);
}

#[tokio::test]
async fn test_rename_missing_file() {
    let (_dir, _store, fs) = empty();
    assert!(fs.rename("/ghost", "/other").await.is_err());
}

#[tokio::test]
async fn test_access_always_granted() {
    let (_dir, _store, fs) = empty();
    fs.access("/anything", libc::W_OK).await.unwrap();
}

#[tokio::test]
async fn test_statfs_counts_files_and_survives_failure() {
    let (_dir, store, fs) = mount([("d/", Vec::new()), ("d/a", vec![0u8; 5000])]);
    let capacity = fs.statfs().await;
    assert_eq!(capacity.total_blocks - capacity.free_blocks, 2);
    assert_eq!(capacity.total_files - capacity.free_files, 1);

    fs.mkdir("/e").await.unwrap();
    store.fail_all(StoreOp::List);
    assert_eq!(fs.statfs().await, Capacity::fallback());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers() {
    let (_dir, store, fs) = empty();
    let fs = Arc::new(fs);
    let mut tasks = Vec::new();
    for i in 0..16u8 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move {
            let path = format!("/dir/file-{:02}", i);
            let id = fs.create(&path, 0o644).await.unwrap();
            for chunk in 0..4u64 {
                fs.write(id, &[i; 64], chunk * 64).await.unwrap();
            }
            fs.getattr(&path).await.unwrap();
            fs.release(id).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(fs.open_handles(), 0);
    assert_eq!(fs.readdir("/dir").await.unwrap().len(), 16 + 2);
    for i in 0..16u8 {
        let data = store.object(&format!("dir/file-{:02}", i)).unwrap();
        assert_eq!(data, vec![i; 256]);
    }
}
