mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::MemBackend;
use httpfs::wire::{Timespec, Value, Verb};
use httpfs::{Errno, HttpFs, MountConfig};

fn fs_with(backend: &Arc<MemBackend>, config: MountConfig) -> HttpFs {
    HttpFs::new(backend.clone(), config)
}

fn cached_config() -> MountConfig {
    MountConfig {
        attr_cache: true,
        cache: true,
        blocksize: 16,
        ..Default::default()
    }
}

#[tokio::test]
async fn end_to_end_read_of_twelve_bytes() {
    let backend = Arc::new(MemBackend::new().with_file("/test", b"hello world!"));
    let fs = fs_with(&backend, MountConfig::default());

    let stat = fs.getattr("/test").await.unwrap();
    assert_eq!(stat.size, 12);

    let fh = fs.open("/test").await.unwrap();
    assert_eq!(fh, 0);
    let data = fs.read("/test", fh, 0, 12).await.unwrap();
    assert_eq!(&data[..], b"hello world!");

    let reads: Vec<_> = backend
        .requests()
        .into_iter()
        .filter(|r| r.operation == "read")
        .collect();
    assert_eq!(reads.len(), 1);
    assert_eq!(
        reads[0].args,
        vec![Value::from("/test"), Value::Int(0), Value::Int(12)]
    );
}

#[tokio::test]
async fn getattr_is_cached_until_mutation() {
    let backend = Arc::new(MemBackend::new().with_file("/f", b"abc"));
    let fs = fs_with(&backend, cached_config());

    assert_eq!(fs.getattr("/f").await.unwrap().size, 3);
    assert_eq!(fs.getattr("/f").await.unwrap().size, 3);
    assert_eq!(backend.count(Verb::Getattr), 1);

    fs.truncate("/f", 10).await.unwrap();
    assert_eq!(fs.getattr("/f").await.unwrap().size, 10);
    assert_eq!(backend.count(Verb::Getattr), 2);

    fs.chmod("/f", 0o600).await.unwrap();
    assert_eq!(fs.getattr("/f").await.unwrap().mode & 0o7777, 0o600);

    fs.chown("/f", 5, 6).await.unwrap();
    let stat = fs.getattr("/f").await.unwrap();
    assert_eq!((stat.uid, stat.gid), (5, 6));

    let t = Timespec::new(1_000, 0);
    fs.utimens("/f", t, t).await.unwrap();
    assert_eq!(fs.getattr("/f").await.unwrap().mtime, t);
}

#[tokio::test]
async fn failed_getattr_is_not_cached() {
    let backend = Arc::new(MemBackend::new());
    let fs = fs_with(&backend, cached_config());

    assert_eq!(fs.getattr("/nope").await, Err(Errno::ENOENT));
    assert_eq!(fs.getattr("/nope").await, Err(Errno::ENOENT));
    assert_eq!(backend.count(Verb::Getattr), 2);
}

#[tokio::test]
async fn unlink_and_rename_drop_cached_entries() {
    let backend = Arc::new(MemBackend::new().with_file("/a", b"1").with_file("/b", b"22"));
    let fs = fs_with(&backend, cached_config());

    fs.getattr("/a").await.unwrap();
    fs.getattr("/b").await.unwrap();
    fs.rename("/a", "/b").await.unwrap();
    assert_eq!(fs.getattr("/a").await, Err(Errno::ENOENT));
    assert_eq!(fs.getattr("/b").await.unwrap().size, 1);

    fs.unlink("/b").await.unwrap();
    assert_eq!(fs.getattr("/b").await, Err(Errno::ENOENT));
}

#[tokio::test]
async fn write_through_cache_updates_size() {
    let backend = Arc::new(MemBackend::new());
    let fs = fs_with(&backend, cached_config());

    let fh = fs.create("/new", 0o644).await.unwrap();
    assert_ne!(fh, 0);
    assert_eq!(fs.getattr("/new").await.unwrap().size, 0);

    assert_eq!(fs.write("/new", fh, 0, Bytes::from_static(b"abc")).await, Ok(3));
    assert_eq!(fs.write("/new", fh, 3, Bytes::from_static(b"def")).await, Ok(3));
    assert_eq!(backend.count(Verb::Write), 0);

    fs.release(fh).await.unwrap();
    assert_eq!(backend.count(Verb::Write), 1);
    assert_eq!(backend.node("/new").unwrap().data, b"abcdef");
    // the buffered write invalidated the entry cached after create
    assert_eq!(fs.getattr("/new").await.unwrap().size, 6);
}

#[tokio::test]
async fn cached_reads_prefetch_a_block() {
    let content: Vec<u8> = (0..64u8).collect();
    let backend = Arc::new(MemBackend::new().with_file("/big", &content));
    let fs = fs_with(&backend, cached_config());

    let fh = fs.open("/big").await.unwrap();
    assert_eq!(&fs.read("/big", fh, 0, 4).await.unwrap()[..], &content[0..4]);
    assert_eq!(&fs.read("/big", fh, 4, 8).await.unwrap()[..], &content[4..12]);
    assert_eq!(backend.count(Verb::Read), 1);

    assert_eq!(&fs.read("/big", fh, 40, 4).await.unwrap()[..], &content[40..44]);
    assert_eq!(backend.count(Verb::Read), 2);
    fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn nocache_paths_go_direct() {
    let backend = Arc::new(MemBackend::new().with_file("/app.log", b"0123456789"));
    let config = MountConfig {
        nocache: Some(regex::Regex::new(r"\.log$").unwrap()),
        ..cached_config()
    };
    let fs = fs_with(&backend, config);

    let fh = fs.open("/app.log").await.unwrap();
    assert_eq!(fh, 0);
    fs.write("/app.log", fh, 10, Bytes::from_static(b"x")).await.unwrap();
    assert_eq!(backend.count(Verb::Write), 1);
    fs.read("/app.log", fh, 0, 2).await.unwrap();
    fs.read("/app.log", fh, 2, 2).await.unwrap();
    assert_eq!(backend.count(Verb::Read), 2);
}

#[tokio::test]
async fn link_and_symlink_send_path_then_target() {
    let backend = Arc::new(MemBackend::new().with_file("/target", b"t"));
    let fs = fs_with(&backend, MountConfig::default());

    fs.link("/target", "/hard").await.unwrap();
    fs.symlink("/target", "/soft").await.unwrap();

    let reqs = backend.requests();
    assert_eq!(reqs[0].operation, "link");
    assert_eq!(reqs[0].args, vec![Value::from("/hard"), Value::from("/target")]);
    assert_eq!(reqs[1].operation, "symlink");
    assert_eq!(reqs[1].args, vec![Value::from("/soft"), Value::from("/target")]);

    assert_eq!(fs.readlink("/soft").await.unwrap(), "/target");
    assert_eq!(fs.getattr("/hard").await.unwrap().size, 1);
}

#[tokio::test]
async fn directories() {
    let backend = Arc::new(MemBackend::new());
    let fs = fs_with(&backend, MountConfig::default());

    fs.mkdir("/d", 0o755).await.unwrap();
    fs.create("/d/x", 0o644).await.unwrap();
    fs.create("/d/y", 0o644).await.unwrap();
    assert_eq!(fs.readdir("/d").await.unwrap(), vec!["x", "y"]);
    assert!(fs.getattr("/d").await.unwrap().is_dir());

    fs.unlink("/d/x").await.unwrap();
    fs.unlink("/d/y").await.unwrap();
    fs.rmdir("/d").await.unwrap();
    assert_eq!(fs.readdir("/").await.unwrap(), Vec::<String>::new());
}

#[tokio::test]
async fn failed_create_allocates_no_descriptor() {
    let backend = Arc::new(MemBackend::new());
    let fs = fs_with(&backend, cached_config());

    // shutting the call manager down makes every call fail
    fs.rpc().shutdown();
    assert!(fs.create("/x", 0o644).await.is_err());
    assert_eq!(fs.blocks().open_slots(), 0);
    assert_eq!(backend.requests().len(), 0);
}

#[tokio::test]
async fn create_and_rmdir_drop_cached_entries() {
    let backend = Arc::new(MemBackend::new().with_file("/f", b"hello"));
    let fs = fs_with(&backend, cached_config());

    assert_eq!(fs.getattr("/f").await.unwrap().size, 5);
    let fh = fs.create("/f", 0o644).await.unwrap();
    assert_eq!(fs.getattr("/f").await.unwrap().size, 0);
    fs.release(fh).await.unwrap();

    fs.mkdir("/d", 0o755).await.unwrap();
    assert!(fs.getattr("/d").await.unwrap().is_dir());
    fs.rmdir("/d").await.unwrap();
    assert_eq!(fs.getattr("/d").await, Err(Errno::ENOENT));
}

#[tokio::test]
async fn mkdir_link_and_symlink_keep_other_entries_cached() {
    let backend = Arc::new(MemBackend::new().with_file("/f", b"abc"));
    let fs = fs_with(&backend, cached_config());

    fs.getattr("/f").await.unwrap();
    assert_eq!(backend.count(Verb::Getattr), 1);

    fs.mkdir("/d", 0o755).await.unwrap();
    fs.link("/f", "/hard").await.unwrap();
    fs.symlink("/f", "/soft").await.unwrap();

    assert_eq!(fs.getattr("/f").await.unwrap().size, 3);
    assert_eq!(backend.count(Verb::Getattr), 1);
}
